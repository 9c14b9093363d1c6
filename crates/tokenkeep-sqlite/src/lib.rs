//! SQLite-backed stores for the tokenkeep subsystem.
//!
//! Two stores share one backend style:
//! - [`SqliteTokenStore`]: token outputs, ownerships, public parameters,
//!   certifications
//! - [`SqliteTransactionStore`]: token requests, transaction records,
//!   validations, movements, endorsement acks
//!
//! Key features:
//! - Atomic write handles with explicit commit/rollback and rollback on drop
//! - WAL mode plus a read-only connection pool for non-blocking reads
//! - Lazy keyset-paginated iterators owning their backend cursor
//! - A neutral condition IR rendered to positional SQL parameters

mod backend;
pub mod conditions;
pub mod read_pool;
pub mod schema;
pub mod tokens;
pub mod transactions;

pub use conditions::{where_clause, Cond, Conditions, Param, Rendered};
pub use read_pool::ReadPool;
pub use schema::{TokenTables, TransactionTables};
pub use tokens::{
    SpendableTokensIterator, SqliteTokenStore, TokenAtomicWrite, UnspentTokensIterator,
};
pub use transactions::{
    SqliteTransactionStore, TokenRequestIterator, TransactionIterator, TxAtomicWrite,
    ValidationIterator,
};
