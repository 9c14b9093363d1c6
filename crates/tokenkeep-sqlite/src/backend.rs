//! Connection setup and backend error classification.

use rusqlite::{Connection, OpenFlags};
use tokenkeep_core::{Result, StoreConfig, StoreError, SynchronousMode};

/// Classify a backend error into the store taxonomy.
///
/// Any backend message containing "foreign key" maps to
/// `TokenDoesNotExist`; unique/primary-key violations map to `Conflict`;
/// everything else is a `Backend` error with the cause chain preserved.
pub(crate) fn classify(err: rusqlite::Error, context: &str) -> StoreError {
    let msg = err.to_string().to_lowercase();
    if msg.contains("foreign key") {
        StoreError::TokenDoesNotExist(format!("{context}: {err}"))
    } else if msg.contains("unique constraint") || msg.contains("primary key") {
        StoreError::Conflict(format!("{context}: {err}"))
    } else {
        StoreError::Backend(anyhow::Error::new(err).context(context.to_string()))
    }
}

/// Open the read-write connection and apply the configured pragmas.
pub(crate) fn open_rw(cfg: &StoreConfig) -> Result<Connection> {
    if let Some(parent) = cfg.path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open_with_flags(
        &cfg.path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )
    .map_err(|e| classify(e, "opening database"))?;

    if cfg.wal_mode {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| classify(e, "enabling WAL"))?;
    }

    let sync_mode = match cfg.synchronous {
        SynchronousMode::Full => "FULL",
        SynchronousMode::Normal => "NORMAL",
        SynchronousMode::Off => "OFF",
    };
    conn.pragma_update(None, "synchronous", sync_mode)
        .map_err(|e| classify(e, "setting synchronous mode"))?;

    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| classify(e, "enabling foreign keys"))?;

    conn.pragma_update(None, "cache_size", cfg.cache_size)
        .map_err(|e| classify(e, "setting cache size"))?;

    Ok(conn)
}

/// Open a read-only connection to an already-initialized database.
pub(crate) fn open_read_only(path: &std::path::Path) -> Result<Connection> {
    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| classify(e, "opening read-only connection"))
}
