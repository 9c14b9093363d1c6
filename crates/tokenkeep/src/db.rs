//! Transaction database facade.
//!
//! Bundles the SQLite transaction store with the status notifier and the
//! token-request cache, and drives the append flows: audit-record
//! decomposition, atomic request+record writes, durable status changes
//! followed by exactly one notification.

use crate::cache::SecondChanceCache;
use crate::records::{movements, transaction_records};
use chrono::Utc;
use std::collections::HashMap;
use tokenkeep_bus::StatusNotifier;
use tokenkeep_core::{
    AuditRecord, Context, MovementRecord, QueryTokenRequestsParams, QueryTransactionsParams,
    QueryValidationsParams, Result, ResultExt, StatusEvent, StoreConfig, TransactionRecord,
    TxStatus,
};
use tokenkeep_sqlite::{
    SqliteTransactionStore, TokenRequestIterator, TransactionIterator, TxAtomicWrite,
    ValidationIterator,
};

pub struct TransactionDb {
    store: SqliteTransactionStore,
    notifier: StatusNotifier,
    cache: SecondChanceCache,
}

impl TransactionDb {
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        Ok(Self {
            store: SqliteTransactionStore::open(cfg)?,
            notifier: StatusNotifier::new(),
            cache: SecondChanceCache::default(),
        })
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    pub fn store(&self) -> &SqliteTransactionStore {
        &self.store
    }

    /// Decompose the audit record and write the token request, the
    /// transaction records and the movements in one atomic write. The
    /// request cache is filled once the write is durable.
    pub fn append_transaction_record(
        &self,
        ctx: &Context,
        record: &AuditRecord,
        raw_request: &[u8],
        application_metadata: &HashMap<String, Vec<u8>>,
        pp_hash: &[u8],
    ) -> Result<()> {
        tracing::debug!("appending new transaction record... [{}]", record.anchor);
        let now = Utc::now();
        let txs = transaction_records(record, now)
            .with_context(|| format!("failed parsing transactions from audit record [{}]", record.anchor))?;
        let moves = movements(record, now)?;

        let mut w = self.store.begin_atomic_write()?;
        let appended = Self::append_records(
            &mut w,
            ctx,
            &record.anchor,
            raw_request,
            application_metadata,
            pp_hash,
            &txs,
            &moves,
        );
        if let Err(e) = appended {
            if let Err(re) = w.rollback() {
                tracing::error!("error rolling back: {re}");
            }
            return Err(e.context(format!("append for txid [{}] failed", record.anchor)));
        }
        w.commit()
            .with_context(|| format!("committing tx for txid [{}] failed", record.anchor))?;

        self.cache.add(record.anchor.clone(), raw_request.to_vec());
        tracing::debug!("appending transaction record completed without errors");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn append_records(
        w: &mut TxAtomicWrite<'_>,
        ctx: &Context,
        anchor: &str,
        raw_request: &[u8],
        application_metadata: &HashMap<String, Vec<u8>>,
        pp_hash: &[u8],
        txs: &[TransactionRecord],
        moves: &[MovementRecord],
    ) -> Result<()> {
        w.add_token_request(ctx, anchor, raw_request, application_metadata, pp_hash)?;
        for tx in txs {
            w.add_transaction(ctx, tx)?;
        }
        for movement in moves {
            w.add_movement(ctx, movement)?;
        }
        Ok(())
    }

    /// Store the token request and the validation metadata for a
    /// transaction in one atomic write.
    pub fn append_validation_record(
        &self,
        ctx: &Context,
        tx_id: &str,
        token_request: &[u8],
        metadata: &HashMap<String, Vec<u8>>,
        pp_hash: &[u8],
    ) -> Result<()> {
        tracing::debug!("appending new validation record... [{tx_id}]");
        let mut w = self.store.begin_atomic_write()?;
        let appended = (|| {
            w.add_token_request(ctx, tx_id, token_request, &HashMap::new(), pp_hash)?;
            w.add_validation_record(ctx, tx_id, metadata)
        })();
        if let Err(e) = appended {
            if let Err(re) = w.rollback() {
                tracing::error!("error rolling back: {re}");
            }
            return Err(e.context(format!("append validation record for txid [{tx_id}] failed")));
        }
        w.commit()
            .with_context(|| format!("append validation record commit for txid [{tx_id}] failed"))?;

        self.cache.add(tx_id.to_string(), token_request.to_vec());
        Ok(())
    }

    /// Set the status of a transaction. Returns after the backend commit;
    /// every subscriber registered at that point receives exactly one
    /// event. No event is published on error.
    pub fn set_status(
        &self,
        ctx: &Context,
        tx_id: &str,
        status: TxStatus,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        tracing::debug!("set status [{tx_id}][{status}]...");
        self.store
            .set_status(ctx, tx_id, status, &message)
            .with_context(|| format!("failed setting status [{tx_id}][{status}]"))?;

        tokenkeep_core::observe::record_status_event(&status.to_string());
        self.notifier.notify(&StatusEvent {
            tx_id: tx_id.to_string(),
            status,
            message,
        });
        tracing::debug!("set status [{tx_id}][{status}] done");
        Ok(())
    }

    pub fn get_status(&self, ctx: &Context, tx_id: &str) -> Result<(TxStatus, String)> {
        self.store
            .get_status(ctx, tx_id)
            .with_context(|| format!("failed getting status [{tx_id}]"))
    }

    /// The token request bound to the transaction id. Consults the cache
    /// first; a backend hit fills the cache, a backend error never does.
    pub fn get_token_request(&self, ctx: &Context, tx_id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(raw) = self.cache.get(tx_id) {
            return Ok(Some(raw));
        }
        let raw = self.store.get_token_request(ctx, tx_id)?;
        if let Some(raw) = &raw {
            self.cache.add(tx_id.to_string(), raw.clone());
        }
        Ok(raw)
    }

    pub fn transactions(
        &self,
        ctx: &Context,
        params: &QueryTransactionsParams,
    ) -> Result<TransactionIterator> {
        self.store.query_transactions(ctx, params)
    }

    pub fn validations(
        &self,
        ctx: &Context,
        params: &QueryValidationsParams,
    ) -> Result<ValidationIterator> {
        self.store.query_validations(ctx, params)
    }

    pub fn token_requests(
        &self,
        ctx: &Context,
        params: &QueryTokenRequestsParams,
    ) -> Result<TokenRequestIterator> {
        self.store.query_token_requests(ctx, params)
    }

    pub fn movements(&self, ctx: &Context, tx_id: &str) -> Result<Vec<MovementRecord>> {
        self.store.movements(ctx, tx_id)
    }

    pub fn add_transaction_endorsement_ack(
        &self,
        ctx: &Context,
        tx_id: &str,
        endorser: &[u8],
        sigma: &[u8],
    ) -> Result<()> {
        self.store
            .add_transaction_endorsement_ack(ctx, tx_id, endorser, sigma)
    }

    pub fn get_transaction_endorsement_acks(
        &self,
        ctx: &Context,
        tx_id: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        self.store.get_transaction_endorsement_acks(ctx, tx_id)
    }
}
