//! SQLite database module for item storage
//!
//! Items, transition progress, vault memberships and user events live in a
//! single SQLite file per store. The sync engine can run against two stores
//! at once (primary and secondary) while the transition runner moves a
//! user's items between them.
//!
//! ## Tables
//!
//! - `items` - encrypted item records, the unit of sync
//! - `transition_statuses` - per-user dual-store migration progress
//! - `shared_vault_users` - vault membership and permissions
//! - `user_events` - durable user-facing notifications

pub mod items;
pub mod schema;
pub mod shared_vault_users;
pub mod transitions;
pub mod user_events;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::info;

use crate::error::SyncError;

/// Handle to one item store. Cheap to share behind an `Arc`; all access
/// goes through [`read`](ItemDb::read) and [`write`](ItemDb::write),
/// which serialize on the store's single connection. That serialization
/// is what gives each user read-after-write consistency within a store.
pub struct ItemDb {
    conn: Mutex<Connection>,
}

impl ItemDb {
    /// Open or create an item store at the given path
    pub fn open(db_path: &Path) -> Result<Self, SyncError> {
        info!("Opening item store at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| SyncError::Internal(format!("Failed to open item store: {}", e)))?;

        // Many concurrent sync requests funnel into one store: WAL keeps
        // readers off the writer's back, and the busy timeout absorbs
        // bursts of per-item saves landing together.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| SyncError::Internal(format!("Failed to configure item store: {}", e)))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            SyncError::Internal(format!("Failed to open in-memory item store: {}", e))
        })?;

        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Internal(format!("Item store lock poisoned: {}", e)))
    }

    /// Run a read query against the store
    pub fn read<F, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Connection) -> Result<T, SyncError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run a mutating operation with exclusive access to the store
    pub fn write<F, T>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SyncError>,
    {
        let mut conn = self.lock()?;
        f(&mut conn)
    }

    /// Counts surfaced by the health endpoint
    pub fn stats(&self) -> Result<DbStats, SyncError> {
        self.read(|conn| {
            let count = |sql: &str| -> Result<i64, SyncError> {
                conn.query_row(sql, [], |row| row.get(0))
                    .map_err(|e| SyncError::Internal(format!("Stats query failed: {}", e)))
            };

            Ok(DbStats {
                item_count: count("SELECT COUNT(*) FROM items")? as u64,
                user_count: count("SELECT COUNT(DISTINCT user_uuid) FROM items")? as u64,
                tombstone_count: count("SELECT COUNT(*) FROM items WHERE deleted = 1")? as u64,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub item_count: u64,
    pub user_count: u64,
    pub tombstone_count: u64,
}

// Re-exports
pub use items::{Item, ItemHash, ItemQuery, SortKey, SortOrder, TimeComparator};
pub use shared_vault_users::{SharedVaultPermission, SharedVaultUser};
pub use transitions::TransitionStatusRow;
pub use user_events::UserEventRow;
