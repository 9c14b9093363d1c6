//! SQLite-backed transaction store.
//!
//! Persists token-request blobs, per-action transaction records, validation
//! records, movements and endorsement acknowledgements. The transaction
//! status lives on the request row; record reads join it. Writes go through
//! the same atomic-write handle discipline as the token store.

use crate::backend::{classify, open_read_only, open_rw};
use crate::conditions::{where_clause, Cond, Param};
use crate::read_pool::ReadPool;
use crate::schema::{self, TransactionTables};
use crate::tokens::ITERATOR_BATCH;
use chrono::Utc;
use num_bigint::BigInt;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokenkeep_core::{
    ActionType, Context, MovementRecord, QueryTokenRequestsParams, QueryTransactionsParams,
    QueryValidationsParams, Result, StoreConfig, StoreError, TokenRequestRecord,
    TransactionRecord, TxStatus, ValidationRecord,
};

pub struct SqliteTransactionStore {
    conn: Arc<Mutex<Connection>>,
    tables: TransactionTables,
    read_pool: Arc<ReadPool>,
}

impl SqliteTransactionStore {
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        cfg.validate()?;
        let tables = TransactionTables::new(&cfg.table_prefix);
        let conn = open_rw(&cfg)?;
        if cfg.create_schema {
            schema::init_schema(&conn, &schema::transaction_schema(&tables))?;
        }
        let read_pool = Arc::new(ReadPool::open(&cfg.path, cfg.read_pool_size)?);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables,
            read_pool,
        })
    }

    fn with_read<R>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        ctx.check()?;
        let conn = self.read_pool.acquire();
        f(&conn)
    }

    /// Begin an atomic write. Same handle discipline as the token store:
    /// commit or roll back exactly once, drop rolls back.
    pub fn begin_atomic_write(&self) -> Result<TxAtomicWrite<'_>> {
        let guard = self.conn.lock();
        guard
            .execute("BEGIN IMMEDIATE", [])
            .map_err(|e| classify(e, "beginning write transaction"))?;
        Ok(TxAtomicWrite {
            conn: guard,
            tables: &self.tables,
            state: TxnState::Active,
        })
    }

    /// Status and status message of a transaction.
    pub fn get_status(&self, ctx: &Context, tx_id: &str) -> Result<(TxStatus, String)> {
        self.with_read(ctx, |conn| {
            let sql = format!(
                "SELECT status, status_message FROM {} WHERE tx_id = ?1",
                self.tables.requests
            );
            let row: Option<(i64, String)> = conn
                .query_row(&sql, params![tx_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()
                .map_err(|e| classify(e, "querying status"))?;
            match row {
                Some((code, message)) => {
                    let status = TxStatus::from_code(code).ok_or_else(|| {
                        StoreError::Backend(anyhow::anyhow!(
                            "corrupt status code [{code}] for [{tx_id}]"
                        ))
                    })?;
                    Ok((status, message))
                }
                None => Err(StoreError::NotFound(format!(
                    "no status found for transaction [{tx_id}]"
                ))),
            }
        })
    }

    /// Set the status of a transaction. Updating an id with no request row
    /// succeeds and is warn-logged; the caller enforces the lattice.
    pub fn set_status(
        &self,
        ctx: &Context,
        tx_id: &str,
        status: TxStatus,
        message: &str,
    ) -> Result<()> {
        ctx.check()?;
        let sql = format!(
            "UPDATE {} SET status = ?1, status_message = ?2 WHERE tx_id = ?3",
            self.tables.requests
        );
        let conn = self.conn.lock();
        let updated = conn
            .execute(&sql, params![status.code(), message, tx_id])
            .map_err(|e| classify(e, &format!("setting status [{tx_id}][{status}]")))?;
        if updated == 0 {
            tracing::warn!("no token request found while setting status [{tx_id}][{status}]");
        }
        Ok(())
    }

    /// The token-request blob bound to the transaction id, if any.
    pub fn get_token_request(&self, ctx: &Context, tx_id: &str) -> Result<Option<Vec<u8>>> {
        self.with_read(ctx, |conn| {
            let sql = format!(
                "SELECT request FROM {} WHERE tx_id = ?1",
                self.tables.requests
            );
            conn.query_row(&sql, params![tx_id], |row| row.get(0))
                .optional()
                .map_err(|e| classify(e, "querying token request"))
        })
    }

    /// Iterator over transaction records matching the cumulative filters.
    pub fn query_transactions(
        &self,
        ctx: &Context,
        params: &QueryTransactionsParams,
    ) -> Result<TransactionIterator> {
        let mut children = Vec::new();
        if !params.sender_wallet_id.is_empty() {
            children.push(Cond::Eq {
                column: "t.sender_eid".to_string(),
                value: Param::Text(params.sender_wallet_id.clone()),
            });
        }
        if !params.recipient_wallet_id.is_empty() {
            children.push(Cond::Eq {
                column: "t.recipient_eid".to_string(),
                value: Param::Text(params.recipient_wallet_id.clone()),
            });
        }
        if let Some(from) = params.from {
            children.push(Cond::Ge {
                column: "t.stored_at".to_string(),
                value: Param::Timestamp(from),
            });
        }
        if let Some(to) = params.to {
            children.push(Cond::Le {
                column: "t.stored_at".to_string(),
                value: Param::Timestamp(to),
            });
        }
        if !params.action_types.is_empty() {
            children.push(Cond::In {
                column: "t.action_type".to_string(),
                values: params
                    .action_types
                    .iter()
                    .map(|a| Param::Int(a.code()))
                    .collect(),
            });
        }
        if !params.statuses.is_empty() {
            children.push(Cond::In {
                column: "COALESCE(r.status, 0)".to_string(),
                values: params.statuses.iter().map(|s| Param::Int(s.code())).collect(),
            });
        }
        if !params.ids.is_empty() {
            children.push(Cond::In {
                column: "t.tx_id".to_string(),
                values: params.ids.iter().map(|id| Param::Text(id.clone())).collect(),
            });
        }
        TransactionIterator::new(
            self.read_pool.db_path(),
            self.tables.clone(),
            Cond::And(children),
            ctx.clone(),
        )
    }

    /// Iterator over validation records matching the filters.
    pub fn query_validations(
        &self,
        ctx: &Context,
        params: &QueryValidationsParams,
    ) -> Result<ValidationIterator> {
        let mut children = Vec::new();
        if let Some(from) = params.from {
            children.push(Cond::Ge {
                column: "v.stored_at".to_string(),
                value: Param::Timestamp(from),
            });
        }
        if let Some(to) = params.to {
            children.push(Cond::Le {
                column: "v.stored_at".to_string(),
                value: Param::Timestamp(to),
            });
        }
        if !params.statuses.is_empty() {
            children.push(Cond::In {
                column: "COALESCE(r.status, 0)".to_string(),
                values: params.statuses.iter().map(|s| Param::Int(s.code())).collect(),
            });
        }
        ValidationIterator::new(
            self.read_pool.db_path(),
            self.tables.clone(),
            Cond::And(children),
            ctx.clone(),
        )
    }

    /// Iterator over stored token requests matching the filters.
    pub fn query_token_requests(
        &self,
        ctx: &Context,
        params: &QueryTokenRequestsParams,
    ) -> Result<TokenRequestIterator> {
        let mut children = Vec::new();
        if !params.statuses.is_empty() {
            children.push(Cond::In {
                column: "status".to_string(),
                values: params.statuses.iter().map(|s| Param::Int(s.code())).collect(),
            });
        }
        TokenRequestIterator::new(
            self.read_pool.db_path(),
            self.tables.clone(),
            Cond::And(children),
            ctx.clone(),
        )
    }

    /// Movement rows recorded for a transaction.
    pub fn movements(&self, ctx: &Context, tx_id: &str) -> Result<Vec<MovementRecord>> {
        self.with_read(ctx, |conn| {
            let sql = format!(
                "SELECT m.tx_id, m.enrollment_id, m.token_type, m.amount, m.stored_at, COALESCE(r.status, 0) \
                 FROM {m} m LEFT JOIN {r} r ON m.tx_id = r.tx_id WHERE m.tx_id = ?1 ORDER BY m.id",
                m = self.tables.movements,
                r = self.tables.requests,
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying movements"))?;
            let mut rows = stmt
                .query(params![tx_id])
                .map_err(|e| classify(e, "querying movements"))?;
            let mut movements = Vec::new();
            while let Some(row) = rows.next().map_err(|e| classify(e, "querying movements"))? {
                movements.push(MovementRecord {
                    tx_id: row.get(0).map_err(|e| classify(e, "querying movements"))?,
                    enrollment_id: row.get(1).map_err(|e| classify(e, "querying movements"))?,
                    token_type: row.get(2).map_err(|e| classify(e, "querying movements"))?,
                    amount: parse_amount(
                        &row.get::<_, String>(3)
                            .map_err(|e| classify(e, "querying movements"))?,
                    )?,
                    timestamp: row.get(4).map_err(|e| classify(e, "querying movements"))?,
                    status: status_from_row(
                        row.get(5).map_err(|e| classify(e, "querying movements"))?,
                    )?,
                });
            }
            Ok(movements)
        })
    }

    /// Record the signature of an endorser over a transaction.
    pub fn add_transaction_endorsement_ack(
        &self,
        ctx: &Context,
        tx_id: &str,
        endorser: &[u8],
        sigma: &[u8],
    ) -> Result<()> {
        ctx.check()?;
        let sql = format!(
            "INSERT INTO {} (tx_id, endorser, sigma, stored_at) VALUES (?1, ?2, ?3, ?4)",
            self.tables.endorsement_acks
        );
        let conn = self.conn.lock();
        conn.execute(&sql, params![tx_id, endorser, sigma, Utc::now()])
            .map_err(|e| classify(e, &format!("storing endorsement ack [{tx_id}]")))?;
        Ok(())
    }

    /// All endorsement signatures for a transaction, keyed by the
    /// hex-encoded endorser identity.
    pub fn get_transaction_endorsement_acks(
        &self,
        ctx: &Context,
        tx_id: &str,
    ) -> Result<HashMap<String, Vec<u8>>> {
        self.with_read(ctx, |conn| {
            let sql = format!(
                "SELECT endorser, sigma FROM {} WHERE tx_id = ?1",
                self.tables.endorsement_acks
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| classify(e, "querying endorsement acks"))?;
            let mut rows = stmt
                .query(params![tx_id])
                .map_err(|e| classify(e, "querying endorsement acks"))?;
            let mut acks = HashMap::new();
            while let Some(row) = rows
                .next()
                .map_err(|e| classify(e, "querying endorsement acks"))?
            {
                let endorser: Vec<u8> = row
                    .get(0)
                    .map_err(|e| classify(e, "querying endorsement acks"))?;
                let sigma: Vec<u8> = row
                    .get(1)
                    .map_err(|e| classify(e, "querying endorsement acks"))?;
                acks.insert(hex::encode(endorser), sigma);
            }
            Ok(acks)
        })
    }
}

fn parse_amount(text: &str) -> Result<BigInt> {
    text.parse::<BigInt>()
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("corrupt amount [{text}]: {e}")))
}

fn status_from_row(code: i64) -> Result<TxStatus> {
    TxStatus::from_code(code)
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("corrupt status code [{code}]")))
}

fn action_from_row(code: i64) -> Result<ActionType> {
    ActionType::from_code(code)
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("corrupt action code [{code}]")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

impl TxnState {
    fn describe(self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Committed => "committed",
            TxnState::RolledBack => "rolled back",
        }
    }
}

/// Atomic write handle over the transaction store.
pub struct TxAtomicWrite<'a> {
    conn: MutexGuard<'a, Connection>,
    tables: &'a TransactionTables,
    state: TxnState,
}

impl<'a> TxAtomicWrite<'a> {
    fn ensure_active(&self, op: &str) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(StoreError::IllegalState(format!(
                "write transaction already {}: cannot {op}",
                self.state.describe()
            )));
        }
        Ok(())
    }

    /// Store the token-request blob for a transaction, with pending
    /// status. At most one request per transaction id; a second insert is
    /// a conflict.
    pub fn add_token_request(
        &mut self,
        ctx: &Context,
        tx_id: &str,
        request: &[u8],
        application_metadata: &HashMap<String, Vec<u8>>,
        pp_hash: &[u8],
    ) -> Result<()> {
        self.ensure_active("add token request")?;
        ctx.check()?;
        if tx_id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "transaction id cannot be empty".to_string(),
            ));
        }
        let metadata = serde_json::to_vec(application_metadata)?;
        let sql = format!(
            "INSERT INTO {} (tx_id, request, application_metadata, pp_hash, status, status_message, stored_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, '', ?6)",
            self.tables.requests
        );
        self.conn
            .execute(
                &sql,
                params![
                    tx_id,
                    request,
                    metadata,
                    pp_hash,
                    TxStatus::Pending.code(),
                    Utc::now()
                ],
            )
            .map_err(|e| classify(e, &format!("storing token request [{tx_id}]")))?;
        Ok(())
    }

    /// Append one transaction record.
    pub fn add_transaction(&mut self, ctx: &Context, record: &TransactionRecord) -> Result<()> {
        self.ensure_active("add transaction")?;
        ctx.check()?;
        let sql = format!(
            "INSERT INTO {} (tx_id, action_type, sender_eid, recipient_eid, token_type, amount, stored_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            self.tables.transactions
        );
        self.conn
            .execute(
                &sql,
                params![
                    record.tx_id,
                    record.action_type.code(),
                    record.sender_eid,
                    record.recipient_eid,
                    record.token_type,
                    record.amount.to_string(),
                    record.timestamp,
                ],
            )
            .map_err(|e| classify(e, &format!("storing transaction record [{}]", record.tx_id)))?;
        Ok(())
    }

    /// Append validation metadata for a transaction.
    pub fn add_validation_record(
        &mut self,
        ctx: &Context,
        tx_id: &str,
        metadata: &HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        self.ensure_active("add validation record")?;
        ctx.check()?;
        let blob = serde_json::to_vec(metadata)?;
        let sql = format!(
            "INSERT INTO {} (tx_id, metadata, stored_at) VALUES (?1, ?2, ?3)",
            self.tables.validations
        );
        self.conn
            .execute(&sql, params![tx_id, blob, Utc::now()])
            .map_err(|e| classify(e, &format!("storing validation record [{tx_id}]")))?;
        Ok(())
    }

    /// Append one movement record.
    pub fn add_movement(&mut self, ctx: &Context, record: &MovementRecord) -> Result<()> {
        self.ensure_active("add movement")?;
        ctx.check()?;
        let sql = format!(
            "INSERT INTO {} (tx_id, enrollment_id, token_type, amount, stored_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            self.tables.movements
        );
        self.conn
            .execute(
                &sql,
                params![
                    record.tx_id,
                    record.enrollment_id,
                    record.token_type,
                    record.amount.to_string(),
                    record.timestamp,
                ],
            )
            .map_err(|e| classify(e, &format!("storing movement [{}]", record.tx_id)))?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        let started = std::time::Instant::now();
        self.conn
            .execute("COMMIT", [])
            .map_err(|e| classify(e, "committing write transaction"))?;
        self.state = TxnState::Committed;
        tokenkeep_core::observe::record_commit(started.elapsed());
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("rollback")?;
        self.conn
            .execute("ROLLBACK", [])
            .map_err(|e| classify(e, "rolling back write transaction"))?;
        self.state = TxnState::RolledBack;
        Ok(())
    }
}

impl<'a> Drop for TxAtomicWrite<'a> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            tracing::debug!("rolling back unfinished transaction write");
            let _ = self.conn.execute("ROLLBACK", []);
        }
    }
}

/// Lazy iterator over transaction records, keyset-paginated on the row id.
pub struct TransactionIterator {
    conn: Connection,
    tables: TransactionTables,
    cond: Cond,
    ctx: Context,
    cursor: i64,
    buf: VecDeque<TransactionRecord>,
    done: bool,
}

impl TransactionIterator {
    fn new(
        db_path: &std::path::Path,
        tables: TransactionTables,
        cond: Cond,
        ctx: Context,
    ) -> Result<Self> {
        let conn = open_read_only(db_path)?;
        let mut it = Self {
            conn,
            tables,
            cond,
            ctx,
            cursor: 0,
            buf: VecDeque::new(),
            done: false,
        };
        it.fetch_batch()?;
        Ok(it)
    }

    fn scan(row: &Row<'_>) -> Result<(i64, TransactionRecord)> {
        let err = |e| classify(e, "scanning transaction record");
        let id: i64 = row.get(0).map_err(err)?;
        let record = TransactionRecord {
            tx_id: row.get(1).map_err(err)?,
            action_type: action_from_row(row.get(2).map_err(err)?)?,
            sender_eid: row.get(3).map_err(err)?,
            recipient_eid: row.get(4).map_err(err)?,
            token_type: row.get(5).map_err(err)?,
            amount: parse_amount(&row.get::<_, String>(6).map_err(err)?)?,
            timestamp: row.get(7).map_err(err)?,
            status: status_from_row(row.get(8).map_err(err)?)?,
            status_message: row.get(9).map_err(err)?,
        };
        Ok((id, record))
    }

    fn fetch_batch(&mut self) -> Result<()> {
        self.ctx.check()?;
        let mut parts = vec![self.cond.clone()];
        parts.push(Cond::RowGt {
            columns: vec!["t.id".to_string()],
            values: vec![Param::Int(self.cursor)],
        });
        let rendered = where_clause(&Cond::And(parts), 1);
        let sql = format!(
            "SELECT t.id, t.tx_id, t.action_type, t.sender_eid, t.recipient_eid, t.token_type, t.amount, t.stored_at, \
                    COALESCE(r.status, 0), COALESCE(r.status_message, '') \
             FROM {t} t LEFT JOIN {r} r ON t.tx_id = r.tx_id {where_} ORDER BY t.id LIMIT {limit}",
            t = self.tables.transactions,
            r = self.tables.requests,
            where_ = rendered.sql,
            limit = ITERATOR_BATCH,
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| classify(e, "querying transaction records"))?;
        let mut rows = stmt
            .query(params_from_iter(rendered.params.iter()))
            .map_err(|e| classify(e, "querying transaction records"))?;
        let mut fetched = 0;
        while let Some(row) = rows
            .next()
            .map_err(|e| classify(e, "querying transaction records"))?
        {
            let (id, record) = Self::scan(row)?;
            self.cursor = id;
            self.buf.push_back(record);
            fetched += 1;
        }
        if fetched < ITERATOR_BATCH {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for TransactionIterator {
    type Item = Result<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.fetch_batch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

/// Lazy iterator over validation records, keyset-paginated on tx id.
pub struct ValidationIterator {
    conn: Connection,
    tables: TransactionTables,
    cond: Cond,
    ctx: Context,
    cursor: Option<String>,
    buf: VecDeque<ValidationRecord>,
    done: bool,
}

impl ValidationIterator {
    fn new(
        db_path: &std::path::Path,
        tables: TransactionTables,
        cond: Cond,
        ctx: Context,
    ) -> Result<Self> {
        let conn = open_read_only(db_path)?;
        let mut it = Self {
            conn,
            tables,
            cond,
            ctx,
            cursor: None,
            buf: VecDeque::new(),
            done: false,
        };
        it.fetch_batch()?;
        Ok(it)
    }

    fn fetch_batch(&mut self) -> Result<()> {
        self.ctx.check()?;
        let err = |e| classify(e, "querying validation records");
        let mut parts = vec![self.cond.clone()];
        if let Some(cursor) = &self.cursor {
            parts.push(Cond::RowGt {
                columns: vec!["v.tx_id".to_string()],
                values: vec![Param::Text(cursor.clone())],
            });
        }
        let rendered = where_clause(&Cond::And(parts), 1);
        let sql = format!(
            "SELECT v.tx_id, v.metadata, v.stored_at, COALESCE(r.status, 0) \
             FROM {v} v LEFT JOIN {r} r ON v.tx_id = r.tx_id {where_} ORDER BY v.tx_id LIMIT {limit}",
            v = self.tables.validations,
            r = self.tables.requests,
            where_ = rendered.sql,
            limit = ITERATOR_BATCH,
        );
        let mut stmt = self.conn.prepare(&sql).map_err(err)?;
        let mut rows = stmt
            .query(params_from_iter(rendered.params.iter()))
            .map_err(err)?;
        let mut fetched = 0;
        while let Some(row) = rows.next().map_err(err)? {
            let tx_id: String = row.get(0).map_err(err)?;
            let blob: Vec<u8> = row.get(1).map_err(err)?;
            let metadata: HashMap<String, Vec<u8>> = serde_json::from_slice(&blob)?;
            self.buf.push_back(ValidationRecord {
                tx_id: tx_id.clone(),
                metadata,
                timestamp: row.get(2).map_err(err)?,
                status: status_from_row(row.get(3).map_err(err)?)?,
            });
            self.cursor = Some(tx_id);
            fetched += 1;
        }
        if fetched < ITERATOR_BATCH {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for ValidationIterator {
    type Item = Result<ValidationRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.fetch_batch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

/// Lazy iterator over stored token requests, keyset-paginated on tx id.
pub struct TokenRequestIterator {
    conn: Connection,
    tables: TransactionTables,
    cond: Cond,
    ctx: Context,
    cursor: Option<String>,
    buf: VecDeque<TokenRequestRecord>,
    done: bool,
}

impl TokenRequestIterator {
    fn new(
        db_path: &std::path::Path,
        tables: TransactionTables,
        cond: Cond,
        ctx: Context,
    ) -> Result<Self> {
        let conn = open_read_only(db_path)?;
        let mut it = Self {
            conn,
            tables,
            cond,
            ctx,
            cursor: None,
            buf: VecDeque::new(),
            done: false,
        };
        it.fetch_batch()?;
        Ok(it)
    }

    fn fetch_batch(&mut self) -> Result<()> {
        self.ctx.check()?;
        let err = |e| classify(e, "querying token requests");
        let mut parts = vec![self.cond.clone()];
        if let Some(cursor) = &self.cursor {
            parts.push(Cond::RowGt {
                columns: vec!["tx_id".to_string()],
                values: vec![Param::Text(cursor.clone())],
            });
        }
        let rendered = where_clause(&Cond::And(parts), 1);
        let sql = format!(
            "SELECT tx_id, request, status FROM {r} {where_} ORDER BY tx_id LIMIT {limit}",
            r = self.tables.requests,
            where_ = rendered.sql,
            limit = ITERATOR_BATCH,
        );
        let mut stmt = self.conn.prepare(&sql).map_err(err)?;
        let mut rows = stmt
            .query(params_from_iter(rendered.params.iter()))
            .map_err(err)?;
        let mut fetched = 0;
        while let Some(row) = rows.next().map_err(err)? {
            let tx_id: String = row.get(0).map_err(err)?;
            self.buf.push_back(TokenRequestRecord {
                tx_id: tx_id.clone(),
                request: row.get(1).map_err(err)?,
                status: status_from_row(row.get(2).map_err(err)?)?,
            });
            self.cursor = Some(tx_id);
            fetched += 1;
        }
        if fetched < ITERATOR_BATCH {
            self.done = true;
        }
        Ok(())
    }
}

impl Iterator for TokenRequestIterator {
    type Item = Result<TokenRequestRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() && !self.done {
            if let Err(e) = self.fetch_batch() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}
