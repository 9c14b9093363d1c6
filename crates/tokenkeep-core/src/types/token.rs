use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single UTXO output: the transaction that created it and
/// the position of the output within that transaction.
///
/// Ordering is lexicographic on `(tx_id, index)`; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId {
    pub tx_id: String,
    pub index: u64,
}

impl TokenId {
    pub fn new(tx_id: impl Into<String>, index: u64) -> Self {
        Self {
            tx_id: tx_id.into(),
            index,
        }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

/// One row of the token table: a UTXO output together with its ownership,
/// audit and issuer metadata.
///
/// The `owner`, `auditor` and `issuer` flags are independent; a record may
/// carry any combination of them. `quantity` is the canonical decimal form
/// of the value; `amount` must decode to the same number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenRecord {
    pub tx_id: String,
    pub index: u64,
    /// Raw ledger-token bytes, exactly as they appear on the ledger.
    pub ledger: Vec<u8>,
    /// Ledger metadata bytes associated with the output.
    pub ledger_metadata: Vec<u8>,
    pub token_type: String,
    /// Human-readable decimal quantity (canonical form of the value).
    pub quantity: String,
    /// Numeric value; must equal the decoded quantity.
    pub amount: u64,
    pub issuer_raw: Option<Vec<u8>>,
    pub owner_raw: Vec<u8>,
    pub owner_type: String,
    pub owner_identity: Vec<u8>,
    pub owner_wallet_id: Option<String>,
    /// This node owns the output.
    pub owner: bool,
    /// This node audited the output.
    pub auditor: bool,
    /// This node issued the output.
    pub issuer: bool,
}

impl TokenRecord {
    pub fn id(&self) -> TokenId {
        TokenId::new(self.tx_id.clone(), self.index)
    }
}

/// An owned token as returned by the query surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub owner_raw: Vec<u8>,
    pub token_type: String,
    pub quantity: String,
}

/// An unspent token, as produced by the unspent-token iterators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentToken {
    pub id: TokenId,
    pub owner_raw: Vec<u8>,
    pub token_type: String,
    pub quantity: String,
}

/// The selector-relevant projection of an unspent token. The wallet id
/// comes from the token row itself, no ownership join involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableToken {
    pub id: TokenId,
    pub token_type: String,
    pub quantity: String,
    pub wallet_id: String,
}

/// A token this node issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub id: TokenId,
    pub owner_raw: Vec<u8>,
    pub token_type: String,
    pub quantity: String,
    pub issuer_raw: Option<Vec<u8>>,
}

/// One row of the token ⨝ ownership join, regardless of spent state.
///
/// A token owned by several wallets appears once per ownership row unless
/// an enrollment filter narrows them down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDetails {
    pub tx_id: String,
    pub index: u64,
    pub owner_identity: Vec<u8>,
    pub owner_type: String,
    /// Wallet id from the ownership row ('' when the token has none).
    pub owner_enrollment: String,
    pub token_type: String,
    pub amount: u64,
    pub is_deleted: bool,
    pub spent_by: String,
    pub stored_at: DateTime<Utc>,
}

/// Cumulative filters for detail queries. Empty fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct QueryTokenDetailsParams {
    /// Matches the token's own wallet id or any ownership row.
    pub wallet_id: String,
    /// Matches ownership rows only.
    pub enrollment_id: String,
    pub token_type: String,
    pub ids: Vec<TokenId>,
    /// When false (the default) only live tokens are returned.
    pub include_deleted: bool,
}
