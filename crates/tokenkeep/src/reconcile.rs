//! Reconciliation engine.
//!
//! Cross-validates the transaction store status against the node's vault
//! and the remote ledger, and verifies bit-equal correspondence of unspent
//! token payloads with the ledger. Never mutates; produces an ordered list
//! of human-readable mismatch strings. The pruning helper is the one
//! mutating operation and runs only on explicit operator request.

use crate::db::TransactionDb;
use std::fmt;
use tokenkeep_core::{Context, QueryTransactionsParams, Result, TokenId, TxStatus};
use tokenkeep_sqlite::SqliteTokenStore;

/// Verdict of the vault or ledger on a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Unknown,
    Valid,
    Invalid,
    Busy,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationStatus::Unknown => "unknown",
            ValidationStatus::Valid => "valid",
            ValidationStatus::Invalid => "invalid",
            ValidationStatus::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// Status probe against the node-local validation vault.
pub trait VaultStatusProbe {
    fn status(&self, ctx: &Context, tx_id: &str) -> Result<ValidationStatus>;
}

/// Status probe against the authoritative remote ledger.
pub trait LedgerStatusProbe {
    fn status(&self, ctx: &Context, tx_id: &str) -> Result<ValidationStatus>;
}

/// Content probe returning the raw ledger bytes of the passed tokens.
pub trait LedgerTokenQuery {
    fn query_tokens(&self, ctx: &Context, ids: &[TokenId]) -> Result<Vec<Vec<u8>>>;
}

/// The id a pruning run reports as the deleter of pruned tokens.
pub const PRUNER_ID: &str = "pruner";

pub struct Reconciler<'a, V, L, Q> {
    tokens: &'a SqliteTokenStore,
    transactions: &'a TransactionDb,
    vault: &'a V,
    ledger: &'a L,
    ledger_tokens: &'a Q,
}

impl<'a, V, L, Q> Reconciler<'a, V, L, Q>
where
    V: VaultStatusProbe,
    L: LedgerStatusProbe,
    Q: LedgerTokenQuery,
{
    pub fn new(
        tokens: &'a SqliteTokenStore,
        transactions: &'a TransactionDb,
        vault: &'a V,
        ledger: &'a L,
        ledger_tokens: &'a Q,
    ) -> Self {
        Self {
            tokens,
            transactions,
            vault,
            ledger,
            ledger_tokens,
        }
    }

    /// Run all checks and return the ordered mismatch list, possibly
    /// empty.
    pub fn check(&self, ctx: &Context) -> Result<Vec<String>> {
        let mut mismatches = Vec::new();
        self.check_status(ctx, &mut mismatches)?;
        self.check_unspent(ctx, &mut mismatches)?;
        tokenkeep_core::observe::record_reconcile(mismatches.len());
        Ok(mismatches)
    }

    fn check_status(&self, ctx: &Context, mismatches: &mut Vec<String>) -> Result<()> {
        let it = self
            .transactions
            .transactions(ctx, &QueryTransactionsParams::default())?;
        for record in it {
            let record = record?;
            let tx_id = &record.tx_id;

            let vault_status = match self.vault.status(ctx, tx_id) {
                Ok(status) => status,
                Err(e) => {
                    mismatches.push(format!(
                        "failed to get vault status for transaction record [{tx_id}]: [{e}]"
                    ));
                    continue;
                }
            };

            match (vault_status, record.status) {
                (ValidationStatus::Unknown, status) => mismatches.push(format!(
                    "transaction record [{tx_id}] is unknown for vault but not db [{status}]"
                )),
                (ValidationStatus::Valid, TxStatus::Pending) => mismatches.push(format!(
                    "transaction record [{tx_id}] is valid for vault but pending for db"
                )),
                (ValidationStatus::Valid, TxStatus::Deleted) => mismatches.push(format!(
                    "transaction record [{tx_id}] is valid for vault but deleted for db"
                )),
                (ValidationStatus::Invalid, TxStatus::Confirmed) => mismatches.push(format!(
                    "transaction record [{tx_id}] is invalid for vault but confirmed for db"
                )),
                (ValidationStatus::Invalid, TxStatus::Pending) => mismatches.push(format!(
                    "transaction record [{tx_id}] is invalid for vault but pending for db"
                )),
                (ValidationStatus::Busy, TxStatus::Confirmed) => mismatches.push(format!(
                    "transaction record [{tx_id}] is busy for vault but confirmed for db"
                )),
                (ValidationStatus::Busy, TxStatus::Deleted) => mismatches.push(format!(
                    "transaction record [{tx_id}] is busy for vault but deleted for db"
                )),
                _ => {}
            }

            // the request blob must exist for every known transaction
            if self.transactions.get_token_request(ctx, tx_id)?.is_none() {
                mismatches.push(format!(
                    "no token request found for transaction record [{tx_id}]"
                ));
            }

            // a ledger probe failure downgrades to unknown
            let ledger_status = self
                .ledger
                .status(ctx, tx_id)
                .unwrap_or(ValidationStatus::Unknown);
            match vault_status {
                ValidationStatus::Valid if ledger_status != ValidationStatus::Valid => {
                    mismatches.push(format!(
                        "transaction record [{tx_id}] is valid for vault but not for ledger [{ledger_status}]"
                    ));
                }
                ValidationStatus::Invalid if ledger_status != ValidationStatus::Invalid => {
                    // an invalid transaction the db already dropped may
                    // simply be unknown to the ledger
                    if !(ledger_status == ValidationStatus::Unknown
                        && record.status == TxStatus::Deleted)
                    {
                        mismatches.push(format!(
                            "transaction record [{tx_id}] is invalid for vault but not for ledger [{ledger_status}]"
                        ));
                    }
                }
                ValidationStatus::Unknown if ledger_status != ValidationStatus::Unknown => {
                    mismatches.push(format!(
                        "transaction record [{tx_id}] is unknown for vault but not for ledger [{ledger_status}]"
                    ));
                }
                ValidationStatus::Busy if ledger_status == ValidationStatus::Busy => {
                    // in flight on both sides
                }
                ValidationStatus::Busy if ledger_status != ValidationStatus::Unknown => {
                    mismatches.push(format!(
                        "transaction record [{tx_id}] is busy for vault but not for ledger [{ledger_status}]"
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_unspent(&self, ctx: &Context, mismatches: &mut Vec<String>) -> Result<()> {
        let mut unspent_ids = Vec::new();
        for token in self.tokens.unspent_tokens_iterator(ctx)? {
            let token = token?;
            if !unspent_ids.contains(&token.id) {
                unspent_ids.push(token.id);
            }
        }

        let ledger_content = match self.ledger_tokens.query_tokens(ctx, &unspent_ids) {
            Ok(content) => content,
            Err(e) => {
                mismatches.push(format!("failed to query tokens: [{e}]"));
                return Ok(());
            }
        };
        if ledger_content.len() != unspent_ids.len() {
            mismatches.push(format!(
                "expected [{}] ledger tokens, got [{}]",
                unspent_ids.len(),
                ledger_content.len()
            ));
        }

        let mut content_mismatches = Vec::new();
        self.tokens.get_token_outputs(ctx, &unspent_ids, |id, raw| {
            if !ledger_content.iter().any(|content| content == raw) {
                content_mismatches.push(format!("token content does not match at [{id}]"));
            }
            Ok(())
        })?;
        mismatches.extend(content_mismatches);
        Ok(())
    }

    /// Delete every local unspent token whose ledger status is invalid or
    /// unknown. Returns the pruned ids. Explicit operator request only.
    pub fn prune_invalid_unspent_tokens(&self, ctx: &Context) -> Result<Vec<TokenId>> {
        let mut to_prune = Vec::new();
        for token in self.tokens.unspent_tokens_iterator(ctx)? {
            let token = token?;
            if to_prune.contains(&token.id) {
                continue;
            }
            let status = self.ledger.status(ctx, &token.id.tx_id)?;
            if matches!(
                status,
                ValidationStatus::Invalid | ValidationStatus::Unknown
            ) {
                to_prune.push(token.id);
            }
        }
        if !to_prune.is_empty() {
            tracing::info!("pruning [{}] invalid unspent tokens", to_prune.len());
            self.tokens.delete_tokens(ctx, PRUNER_ID, &to_prune)?;
        }
        Ok(to_prune)
    }
}
