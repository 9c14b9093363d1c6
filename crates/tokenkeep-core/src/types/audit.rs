use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// One input or output of a token transaction, tagged with the action it
/// belongs to and the enrollment id it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Index of the action within the transaction.
    pub action_index: usize,
    /// Enrollment id of the participant; empty on an output means burn.
    pub enrollment_id: String,
    pub token_type: String,
    pub amount: BigInt,
}

impl AuditEntry {
    pub fn new(
        action_index: usize,
        enrollment_id: impl Into<String>,
        token_type: impl Into<String>,
        amount: impl Into<BigInt>,
    ) -> Self {
        Self {
            action_index,
            enrollment_id: enrollment_id.into(),
            token_type: token_type.into(),
            amount: amount.into(),
        }
    }
}

/// The structured decomposition of a token transaction: its inputs and
/// outputs, each tagged by action index, enrollment id, type and amount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Transaction id anchoring the record on the ledger.
    pub anchor: String,
    pub inputs: Vec<AuditEntry>,
    pub outputs: Vec<AuditEntry>,
}

impl AuditRecord {
    pub fn new(anchor: impl Into<String>) -> Self {
        Self {
            anchor: anchor.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}
