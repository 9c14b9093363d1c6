use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of a token transaction.
///
/// The lattice is `Unknown → Pending → {Confirmed, Deleted}`. The store
/// accepts any transition; the callers enforce the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxStatus {
    #[default]
    Unknown,
    /// Submitted to the ledger, outcome not yet known.
    Pending,
    /// Confirmed by the ledger.
    Confirmed,
    /// Dropped after a failure to commit.
    Deleted,
}

impl TxStatus {
    pub fn code(self) -> i64 {
        match self {
            TxStatus::Unknown => 0,
            TxStatus::Pending => 1,
            TxStatus::Confirmed => 2,
            TxStatus::Deleted => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TxStatus::Unknown),
            1 => Some(TxStatus::Pending),
            2 => Some(TxStatus::Confirmed),
            3 => Some(TxStatus::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Unknown => "unknown",
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// The kind of token operation a transaction record describes.
///
/// The type is a function of the sender/recipient enrollment ids: no sender
/// means issue, no recipient means redeem, otherwise transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Issue,
    Transfer,
    Redeem,
}

impl ActionType {
    pub fn code(self) -> i64 {
        match self {
            ActionType::Issue => 0,
            ActionType::Transfer => 1,
            ActionType::Redeem => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ActionType::Issue),
            1 => Some(ActionType::Transfer),
            2 => Some(ActionType::Redeem),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Issue => "issue",
            ActionType::Transfer => "transfer",
            ActionType::Redeem => "redeem",
        };
        f.write_str(s)
    }
}

/// One transaction record per (tx id, action, sender, recipient, token
/// type): the total amount of `token_type` moved to `recipient_eid` in one
/// action. The sender eid is empty for issues, the recipient eid is empty
/// for redeems. The amount is always positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_id: String,
    pub action_type: ActionType,
    pub sender_eid: String,
    pub recipient_eid: String,
    pub token_type: String,
    pub amount: BigInt,
    pub status: TxStatus,
    pub status_message: String,
    pub timestamp: DateTime<Utc>,
}

/// Net movement of one token type for one enrollment id in one
/// transaction. Positive means incoming, negative outgoing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub tx_id: String,
    pub enrollment_id: String,
    pub token_type: String,
    pub amount: BigInt,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
}

/// Validation metadata recorded for a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub tx_id: String,
    pub metadata: HashMap<String, Vec<u8>>,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
}

/// The raw token-request blob bound to a transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequestRecord {
    pub tx_id: String,
    pub request: Vec<u8>,
    pub status: TxStatus,
}

/// Published on every successful status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub tx_id: String,
    pub status: TxStatus,
    pub message: String,
}

/// Cumulative filters for transaction queries. Empty fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct QueryTransactionsParams {
    pub sender_wallet_id: String,
    pub recipient_wallet_id: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub action_types: Vec<ActionType>,
    pub statuses: Vec<TxStatus>,
    pub ids: Vec<String>,
}

/// Filters for validation-record queries.
#[derive(Debug, Clone, Default)]
pub struct QueryValidationsParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub statuses: Vec<TxStatus>,
}

/// Filters for token-request queries.
#[derive(Debug, Clone, Default)]
pub struct QueryTokenRequestsParams {
    pub statuses: Vec<TxStatus>,
}
