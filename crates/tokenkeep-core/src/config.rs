use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a SQLite-backed store (token store or transaction store)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,

    /// Namespace prefix for all table names
    /// Default: "tkp"
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Enable WAL mode
    /// Default: true
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,

    /// SQLite synchronous mode
    #[serde(default)]
    pub synchronous: SynchronousMode,

    /// SQLite cache size (in pages, negative = KB)
    /// Default: -64000 (64MB)
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,

    /// Number of read-only connections kept for the read path
    /// Default: 4
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,

    /// Create the schema on open if it does not exist
    /// Default: true
    #[serde(default = "default_create_schema")]
    pub create_schema: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SynchronousMode {
    /// Full fsync (safest, slowest)
    Full,
    /// fsync at critical moments (good balance)
    #[default]
    Normal,
    /// No fsync (fastest, least safe)
    Off,
}

fn default_table_prefix() -> String {
    "tkp".to_string()
}

fn default_wal_mode() -> bool {
    true
}

fn default_cache_size() -> i32 {
    -64000 // 64MB
}

fn default_read_pool_size() -> usize {
    4
}

fn default_create_schema() -> bool {
    true
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table_prefix: default_table_prefix(),
            wal_mode: default_wal_mode(),
            synchronous: SynchronousMode::default(),
            cache_size: default_cache_size(),
            read_pool_size: default_read_pool_size(),
            create_schema: default_create_schema(),
        }
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_wal_mode(mut self, wal_mode: bool) -> Self {
        self.wal_mode = wal_mode;
        self
    }

    pub fn with_synchronous(mut self, synchronous: SynchronousMode) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn with_read_pool_size(mut self, size: usize) -> Self {
        self.read_pool_size = size;
        self
    }

    pub fn with_create_schema(mut self, create_schema: bool) -> Self {
        self.create_schema = create_schema;
        self
    }

    /// The table prefix is interpolated into DDL and query strings, so it
    /// must be a plain identifier.
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.table_prefix;
        let mut chars = prefix.chars();
        let valid_head = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        let valid_tail = prefix.chars().skip(1).all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_head || !valid_tail {
            return Err(StoreError::InvalidArgument(format!(
                "invalid table prefix [{prefix}]"
            )));
        }
        Ok(())
    }
}
