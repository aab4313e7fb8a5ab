//! Transition status persistence
//!
//! One row per `(user, transition type)` records how far a dual-store
//! migration has progressed, so an interrupted run resumes at the page it
//! stopped on instead of starting over.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::transition::TransitionState;

/// Stored migration progress for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionStatusRow {
    pub user_uuid: String,
    pub transition_type: String,
    pub status: TransitionState,
    pub paging_progress: u32,
    pub integrity_progress: u32,
    pub last_error: Option<String>,
    pub updated_at_timestamp: i64,
}

impl TransitionStatusRow {
    pub fn not_started(user_uuid: &str, transition_type: &str) -> Self {
        Self {
            user_uuid: user_uuid.to_string(),
            transition_type: transition_type.to_string(),
            status: TransitionState::NotStarted,
            paging_progress: 0,
            integrity_progress: 0,
            last_error: None,
            updated_at_timestamp: 0,
        }
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let status_text: String = row.get("status")?;
        Ok(Self {
            user_uuid: row.get("user_uuid")?,
            transition_type: row.get("transition_type")?,
            status: TransitionState::from_str(&status_text),
            paging_progress: row.get::<_, i64>("paging_progress")? as u32,
            integrity_progress: row.get::<_, i64>("integrity_progress")? as u32,
            last_error: row.get("last_error")?,
            updated_at_timestamp: row.get("updated_at_timestamp")?,
        })
    }
}

/// Load the status row for a user, if any
pub fn find_status(
    conn: &Connection,
    user_uuid: &str,
    transition_type: &str,
) -> Result<Option<TransitionStatusRow>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT * FROM transition_statuses WHERE user_uuid = ? AND transition_type = ?")
        .map_err(|e| SyncError::Internal(format!("Prepare failed: {}", e)))?;

    let mut rows = stmt
        .query(params![user_uuid, transition_type])
        .map_err(|e| SyncError::Internal(format!("Query failed: {}", e)))?;

    match rows
        .next()
        .map_err(|e| SyncError::Internal(format!("Row fetch failed: {}", e)))?
    {
        Some(row) => Ok(Some(TransitionStatusRow::from_row(row).map_err(|e| {
            SyncError::Internal(format!("Row parse failed: {}", e))
        })?)),
        None => Ok(None),
    }
}

/// Upsert the status row
pub fn save_status(conn: &Connection, status: &TransitionStatusRow) -> Result<(), SyncError> {
    conn.execute(
        r#"
        INSERT INTO transition_statuses (
            user_uuid, transition_type, status, paging_progress,
            integrity_progress, last_error, updated_at_timestamp
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (user_uuid, transition_type) DO UPDATE SET
            status = excluded.status,
            paging_progress = excluded.paging_progress,
            integrity_progress = excluded.integrity_progress,
            last_error = excluded.last_error,
            updated_at_timestamp = excluded.updated_at_timestamp
        "#,
        params![
            status.user_uuid,
            status.transition_type,
            status.status.as_str(),
            status.paging_progress as i64,
            status.integrity_progress as i64,
            status.last_error,
            status.updated_at_timestamp,
        ],
    )
    .map_err(|e| SyncError::Internal(format!("Status upsert failed: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ItemDb;

    #[test]
    fn test_status_round_trip_and_resume_point() {
        let db = ItemDb::open_in_memory().unwrap();
        db.write(|conn| {
            assert!(find_status(conn, "u-1", "items")?.is_none());

            let mut status = TransitionStatusRow::not_started("u-1", "items");
            status.status = TransitionState::InProgress;
            status.paging_progress = 5;
            status.updated_at_timestamp = 1000;
            save_status(conn, &status)?;

            let loaded = find_status(conn, "u-1", "items")?.unwrap();
            assert_eq!(loaded, status);

            status.paging_progress = 7;
            save_status(conn, &status)?;
            let reloaded = find_status(conn, "u-1", "items")?.unwrap();
            assert_eq!(reloaded.paging_progress, 7);
            Ok(())
        })
        .unwrap();
    }
}
