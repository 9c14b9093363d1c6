//! Tokenkeep: a local token-state store and reconciliation engine for a
//! UTXO-style tokenization platform running atop an external ledger.
//!
//! The workspace provides:
//! - **Token store**: relational persistence of token outputs, ownerships,
//!   public parameters and certifications, with atomic write handles
//! - **Transaction store**: token requests, per-action transaction
//!   records, validations, movements, endorsement acks, and the
//!   pending → confirmed/deleted lifecycle with listener notification
//! - **Audit decomposition**: the pure transformation of an audit record
//!   into transaction and movement records
//! - **Reconciliation**: cross-checks of store status vs vault vs ledger,
//!   and bit-equality verification of unspent token payloads
//!
//! # Quick Start
//!
//! ```no_run
//! use tokenkeep::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let ctx = Context::background();
//! let tokens = SqliteTokenStore::open(StoreConfig::new("./data/tokens.db"))?;
//!
//! let mut w = tokens.begin_atomic_write()?;
//! w.store_token(&ctx, &TokenRecord::default(), &["alice".to_string()])?;
//! w.commit()?;
//!
//! let balance = tokens.balance(&ctx, "alice", "USD")?;
//! # let _ = balance;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod db;
pub mod prelude;
pub mod records;
pub mod reconcile;

// Re-export core types
pub use tokenkeep_core::{
    ActionType, AuditEntry, AuditRecord, Context, IssuedToken, MovementRecord,
    QueryTokenDetailsParams, QueryTokenRequestsParams, QueryTransactionsParams,
    QueryValidationsParams, Result, ResultExt, SpendableToken, StatusEvent, StoreConfig,
    StoreError, SynchronousMode, Token, TokenDetails, TokenId, TokenRecord, TokenRequestRecord,
    TransactionRecord, TxStatus, UnspentToken, ValidationRecord,
};

// Re-export implementations
pub use tokenkeep_bus::{BusError, ListenerId, StatusListener, StatusNotifier, StatusWaiter};
pub use tokenkeep_sqlite::{
    SpendableTokensIterator, SqliteTokenStore, SqliteTransactionStore, TokenAtomicWrite,
    TokenRequestIterator, TransactionIterator, TxAtomicWrite, UnspentTokensIterator,
};

// Re-export main types from this crate
pub use cache::{SecondChanceCache, DEFAULT_REQUEST_CACHE_CAPACITY};
pub use db::TransactionDb;
pub use records::{movements, transaction_records};
pub use reconcile::{
    LedgerStatusProbe, LedgerTokenQuery, Reconciler, ValidationStatus, VaultStatusProbe, PRUNER_ID,
};
