//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::SyncError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), SyncError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, SyncError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| SyncError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SyncError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| SyncError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| SyncError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(ITEMS_SCHEMA)
        .map_err(|e| SyncError::Internal(format!("Failed to create items tables: {}", e)))?;

    conn.execute_batch(COLLABORATOR_SCHEMA)
        .map_err(|e| SyncError::Internal(format!("Failed to create collaborator tables: {}", e)))?;

    Ok(())
}

const ITEMS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    uuid TEXT PRIMARY KEY,
    user_uuid TEXT NOT NULL,
    shared_vault_uuid TEXT,
    key_system_identifier TEXT,
    content TEXT,
    content_type TEXT,
    content_size INTEGER NOT NULL DEFAULT 0,
    enc_item_key TEXT,
    auth_hash TEXT,
    items_key_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    duplicate_of TEXT,
    last_edited_by_uuid TEXT,
    updated_with_session TEXT,
    created_at_timestamp INTEGER NOT NULL,
    updated_at_timestamp INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_items_user_uuid
    ON items(user_uuid, uuid);

CREATE INDEX IF NOT EXISTS idx_items_user_updated
    ON items(user_uuid, updated_at_timestamp);

CREATE INDEX IF NOT EXISTS idx_items_user_created
    ON items(user_uuid, created_at_timestamp);

CREATE INDEX IF NOT EXISTS idx_items_vault_updated
    ON items(shared_vault_uuid, updated_at_timestamp);

CREATE TABLE IF NOT EXISTS transition_statuses (
    user_uuid TEXT NOT NULL,
    transition_type TEXT NOT NULL,
    status TEXT NOT NULL,
    paging_progress INTEGER NOT NULL DEFAULT 0,
    integrity_progress INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at_timestamp INTEGER NOT NULL,
    PRIMARY KEY (user_uuid, transition_type)
);
"#;

const COLLABORATOR_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shared_vault_users (
    shared_vault_uuid TEXT NOT NULL,
    user_uuid TEXT NOT NULL,
    permission TEXT NOT NULL,
    created_at_timestamp INTEGER NOT NULL,
    PRIMARY KEY (shared_vault_uuid, user_uuid)
);

CREATE INDEX IF NOT EXISTS idx_svu_user
    ON shared_vault_users(user_uuid);

CREATE TABLE IF NOT EXISTS user_events (
    uuid TEXT PRIMARY KEY,
    user_uuid TEXT NOT NULL,
    event_type TEXT NOT NULL,
    item_uuid TEXT,
    shared_vault_uuid TEXT,
    created_at_timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_events_user
    ON user_events(user_uuid);

CREATE INDEX IF NOT EXISTS idx_user_events_item
    ON user_events(item_uuid);
"#;
