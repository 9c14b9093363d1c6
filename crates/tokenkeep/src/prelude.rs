//! Convenience re-exports for common usage.

pub use crate::db::TransactionDb;
pub use crate::reconcile::{
    LedgerStatusProbe, LedgerTokenQuery, Reconciler, ValidationStatus, VaultStatusProbe,
};
pub use tokenkeep_bus::{StatusListener, StatusNotifier, StatusWaiter};
pub use tokenkeep_core::{
    ActionType, AuditEntry, AuditRecord, Context, Result, ResultExt, StatusEvent, StoreConfig,
    StoreError, TokenId, TokenRecord, TransactionRecord, TxStatus,
};
pub use tokenkeep_sqlite::{SqliteTokenStore, SqliteTransactionStore};
