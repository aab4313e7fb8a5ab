//! User-event store
//!
//! Durable user-facing notifications. The sync engine writes one when an
//! item leaves a shared vault and clears stale ones when an item joins.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Event type for items removed from a shared vault
pub const EVENT_ITEM_REMOVED_FROM_SHARED_VAULT: &str = "item_removed_from_shared_vault";

/// One durable user notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEventRow {
    pub uuid: String,
    pub user_uuid: String,
    pub event_type: String,
    pub item_uuid: Option<String>,
    pub shared_vault_uuid: Option<String>,
    pub created_at_timestamp: i64,
}

impl UserEventRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: row.get("uuid")?,
            user_uuid: row.get("user_uuid")?,
            event_type: row.get("event_type")?,
            item_uuid: row.get("item_uuid")?,
            shared_vault_uuid: row.get("shared_vault_uuid")?,
            created_at_timestamp: row.get("created_at_timestamp")?,
        })
    }
}

/// Insert a user event
pub fn insert(conn: &Connection, event: &UserEventRow) -> Result<(), SyncError> {
    conn.execute(
        r#"
        INSERT INTO user_events (
            uuid, user_uuid, event_type, item_uuid, shared_vault_uuid,
            created_at_timestamp
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            event.uuid,
            event.user_uuid,
            event.event_type,
            event.item_uuid,
            event.shared_vault_uuid,
            event.created_at_timestamp,
        ],
    )
    .map_err(|e| SyncError::Internal(format!("User event insert failed: {}", e)))?;

    Ok(())
}

/// Remove every event referencing an item
pub fn remove_for_item(conn: &Connection, item_uuid: &str) -> Result<usize, SyncError> {
    conn.execute(
        "DELETE FROM user_events WHERE item_uuid = ?",
        params![item_uuid],
    )
    .map_err(|e| SyncError::Internal(format!("User event delete failed: {}", e)))
}

/// List a user's events, newest first
pub fn find_all_for_user(
    conn: &Connection,
    user_uuid: &str,
) -> Result<Vec<UserEventRow>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM user_events WHERE user_uuid = ? ORDER BY created_at_timestamp DESC",
        )
        .map_err(|e| SyncError::Internal(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params![user_uuid], UserEventRow::from_row)
        .map_err(|e| SyncError::Internal(format!("Query failed: {}", e)))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Internal(format!("Row parse failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ItemDb;

    #[test]
    fn test_insert_list_and_remove_by_item() {
        let db = ItemDb::open_in_memory().unwrap();
        db.write(|conn| {
            let event = UserEventRow {
                uuid: "ev-1".to_string(),
                user_uuid: "u-1".to_string(),
                event_type: EVENT_ITEM_REMOVED_FROM_SHARED_VAULT.to_string(),
                item_uuid: Some("a-1".to_string()),
                shared_vault_uuid: Some("v-1".to_string()),
                created_at_timestamp: 1000,
            };
            insert(conn, &event)?;

            assert_eq!(find_all_for_user(conn, "u-1")?, vec![event]);
            assert_eq!(remove_for_item(conn, "a-1")?, 1);
            assert!(find_all_for_user(conn, "u-1")?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
