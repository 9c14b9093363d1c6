//! Pool of read-only SQLite connections for the read path.
//!
//! SQLite needs separate connections for true read concurrency; with WAL
//! mode enabled, readers proceed without blocking the writer. The pool
//! hands out connections round-robin, preferring an uncontended one.

use crate::backend::open_read_only;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokenkeep_core::Result;

pub struct ReadPool {
    connections: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    db_path: PathBuf,
}

impl ReadPool {
    /// Open `size` read-only connections to an initialized database.
    pub fn open(db_path: &Path, size: usize) -> Result<Self> {
        let size = size.max(1);
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            connections.push(Mutex::new(open_read_only(db_path)?));
        }
        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            db_path: db_path.to_path_buf(),
        })
    }

    /// Acquire a pooled connection. Tries every slot once without waiting,
    /// then blocks on the slot the round-robin counter selected.
    pub fn acquire(&self) -> MutexGuard<'_, Connection> {
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let len = self.connections.len();
        for i in 0..len {
            if let Some(guard) = self.connections[(start + i) % len].try_lock() {
                return guard;
            }
        }
        self.connections[start % len].lock()
    }

    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}
