//! SQLite persistence for the host process.
//!
//! One file-backed database, one connection behind a mutex. All writes go
//! through explicit statements; cross-row invariants (ledger + cursor
//! updates) use transactions so a crash never splits them.

mod aliases;
mod audit;
mod error;
mod groups;
mod host_jobs;
mod ledger;
mod messages;
mod schema;
mod sessions;
mod tasks;

pub use audit::SecurityEvent;
pub use error::{Result, StoreError};
pub use ledger::PendingDelivery;
pub use messages::llm_visible;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

/// Handle to the host database. Cheap to share behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        schema::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}
