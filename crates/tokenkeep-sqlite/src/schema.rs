//! Table definitions for the token store and the transaction store.
//!
//! All table names carry the configurable namespace prefix.

use crate::backend::classify;
use rusqlite::Connection;
use tokenkeep_core::Result;

/// Table names of the token store under one namespace prefix.
#[derive(Debug, Clone)]
pub struct TokenTables {
    pub tokens: String,
    pub ownership: String,
    pub public_params: String,
    pub certifications: String,
}

impl TokenTables {
    pub fn new(prefix: &str) -> Self {
        Self {
            tokens: format!("{prefix}_tokens"),
            ownership: format!("{prefix}_ownership"),
            public_params: format!("{prefix}_public_params"),
            certifications: format!("{prefix}_certifications"),
        }
    }
}

/// Table names of the transaction store under one namespace prefix.
#[derive(Debug, Clone)]
pub struct TransactionTables {
    pub requests: String,
    pub transactions: String,
    pub movements: String,
    pub validations: String,
    pub endorsement_acks: String,
}

impl TransactionTables {
    pub fn new(prefix: &str) -> Self {
        Self {
            requests: format!("{prefix}_requests"),
            transactions: format!("{prefix}_transactions"),
            movements: format!("{prefix}_movements"),
            validations: format!("{prefix}_validations"),
            endorsement_acks: format!("{prefix}_endorsement_acks"),
        }
    }
}

pub fn token_schema(t: &TokenTables) -> String {
    format!(
        r#"
        -- Tokens
        CREATE TABLE IF NOT EXISTS {tokens} (
            tx_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            token_type TEXT NOT NULL,
            quantity TEXT NOT NULL,
            issuer_raw BLOB,
            owner_raw BLOB NOT NULL,
            owner_type TEXT NOT NULL,
            owner_identity BLOB NOT NULL,
            owner_wallet_id TEXT,
            ledger BLOB NOT NULL,
            ledger_metadata BLOB NOT NULL,
            stored_at TIMESTAMP NOT NULL,
            is_deleted BOOLEAN NOT NULL DEFAULT false,
            spent_by TEXT NOT NULL DEFAULT '',
            spent_at TIMESTAMP,
            owner BOOLEAN NOT NULL DEFAULT false,
            auditor BOOLEAN NOT NULL DEFAULT false,
            issuer BOOLEAN NOT NULL DEFAULT false,
            PRIMARY KEY (tx_id, idx)
        );
        CREATE INDEX IF NOT EXISTS idx_spent_{tokens} ON {tokens} ( is_deleted, owner );
        CREATE INDEX IF NOT EXISTS idx_tx_id_{tokens} ON {tokens} ( tx_id );

        -- Ownership
        CREATE TABLE IF NOT EXISTS {ownership} (
            tx_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            wallet_id TEXT NOT NULL,
            PRIMARY KEY (tx_id, idx, wallet_id),
            FOREIGN KEY (tx_id, idx) REFERENCES {tokens} (tx_id, idx)
        );

        -- Public Parameters
        CREATE TABLE IF NOT EXISTS {public_params} (
            raw BLOB NOT NULL,
            stored_at TIMESTAMP NOT NULL PRIMARY KEY
        );

        -- Certifications
        CREATE TABLE IF NOT EXISTS {certifications} (
            tx_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            certification BLOB NOT NULL,
            stored_at TIMESTAMP NOT NULL,
            PRIMARY KEY (tx_id, idx),
            FOREIGN KEY (tx_id, idx) REFERENCES {tokens} (tx_id, idx)
        );
        "#,
        tokens = t.tokens,
        ownership = t.ownership,
        public_params = t.public_params,
        certifications = t.certifications,
    )
}

pub fn transaction_schema(t: &TransactionTables) -> String {
    format!(
        r#"
        -- Token requests; the request row carries the transaction status
        CREATE TABLE IF NOT EXISTS {requests} (
            tx_id TEXT NOT NULL PRIMARY KEY,
            request BLOB NOT NULL,
            application_metadata BLOB,
            pp_hash BLOB,
            status INTEGER NOT NULL,
            status_message TEXT NOT NULL DEFAULT '',
            stored_at TIMESTAMP NOT NULL
        );

        -- Transaction records, one per (action, sender, recipient, type)
        CREATE TABLE IF NOT EXISTS {transactions} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_id TEXT NOT NULL,
            action_type INTEGER NOT NULL,
            sender_eid TEXT NOT NULL,
            recipient_eid TEXT NOT NULL,
            token_type TEXT NOT NULL,
            amount TEXT NOT NULL,
            stored_at TIMESTAMP NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tx_id_{transactions} ON {transactions} ( tx_id );

        -- Net movements per enrollment id and token type
        CREATE TABLE IF NOT EXISTS {movements} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_id TEXT NOT NULL,
            enrollment_id TEXT NOT NULL,
            token_type TEXT NOT NULL,
            amount TEXT NOT NULL,
            stored_at TIMESTAMP NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tx_id_{movements} ON {movements} ( tx_id );

        -- Validation records
        CREATE TABLE IF NOT EXISTS {validations} (
            tx_id TEXT NOT NULL PRIMARY KEY,
            metadata BLOB NOT NULL,
            stored_at TIMESTAMP NOT NULL
        );

        -- Endorsement acknowledgements
        CREATE TABLE IF NOT EXISTS {endorsement_acks} (
            tx_id TEXT NOT NULL,
            endorser BLOB NOT NULL,
            sigma BLOB NOT NULL,
            stored_at TIMESTAMP NOT NULL,
            PRIMARY KEY (tx_id, endorser)
        );
        "#,
        requests = t.requests,
        transactions = t.transactions,
        movements = t.movements,
        validations = t.validations,
        endorsement_acks = t.endorsement_acks,
    )
}

pub fn init_schema(conn: &Connection, ddl: &str) -> Result<()> {
    conn.execute_batch(ddl)
        .map_err(|e| classify(e, "initializing schema"))
}
