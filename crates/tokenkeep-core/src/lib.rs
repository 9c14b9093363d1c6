//! Tokenkeep Core: types and abstractions for the tokenkeep storage subsystem
//!
//! This crate defines the shared vocabulary of the local token-state store:
//! - Token records: UTXO outputs with ownership, audit and issuer metadata
//! - Transaction records: per-action, per-enrollment decomposition of a
//!   token transaction, with a pending → confirmed/deleted lifecycle
//! - Audit records: the raw input/output view a transaction is decomposed from
//! - Error taxonomy and contextual error chaining
//! - Cooperative cancellation contexts threaded through every store call

pub mod config;
pub mod ctx;
pub mod error;
pub mod observe;
pub mod types;

pub use config::{StoreConfig, SynchronousMode};
pub use ctx::Context;
pub use error::{Result, ResultExt, StoreError};
pub use types::audit::{AuditEntry, AuditRecord};
pub use types::token::{
    IssuedToken, QueryTokenDetailsParams, SpendableToken, Token, TokenDetails, TokenId,
    TokenRecord, UnspentToken,
};
pub use types::transaction::{
    ActionType, MovementRecord, QueryTokenRequestsParams, QueryTransactionsParams,
    QueryValidationsParams, StatusEvent, TokenRequestRecord, TransactionRecord, TxStatus,
    ValidationRecord,
};
