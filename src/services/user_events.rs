//! User-event service
//!
//! Wraps the durable user-event store with the two operations the sync
//! engine needs around vault membership changes of an item.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::clock::Timer;
use crate::db::user_events::{self, UserEventRow, EVENT_ITEM_REMOVED_FROM_SHARED_VAULT};
use crate::db::ItemDb;
use crate::error::SyncError;

pub struct UserEventService {
    db: Arc<ItemDb>,
    timer: Arc<Timer>,
}

impl UserEventService {
    pub fn new(db: Arc<ItemDb>, timer: Arc<Timer>) -> Self {
        Self { db, timer }
    }

    /// An item joined a shared vault: notifications referencing it are now
    /// stale, so drop them.
    pub fn remove_user_events_after_item_is_added_to_shared_vault(
        &self,
        user_uuid: &str,
        item_uuid: &str,
        shared_vault_uuid: &str,
    ) -> Result<(), SyncError> {
        let removed = self
            .db
            .write(|conn| user_events::remove_for_item(conn, item_uuid))?;
        debug!(
            user = %user_uuid,
            item = %item_uuid,
            vault = %shared_vault_uuid,
            removed,
            "Cleared user events after item joined shared vault"
        );
        Ok(())
    }

    /// An item left a shared vault: record a durable notification so other
    /// vault members learn of the removal.
    pub fn create_item_removed_from_shared_vault_user_event(
        &self,
        user_uuid: &str,
        item_uuid: &str,
        shared_vault_uuid: &str,
    ) -> Result<UserEventRow, SyncError> {
        let event = UserEventRow {
            uuid: Uuid::new_v4().to_string(),
            user_uuid: user_uuid.to_string(),
            event_type: EVENT_ITEM_REMOVED_FROM_SHARED_VAULT.to_string(),
            item_uuid: Some(item_uuid.to_string()),
            shared_vault_uuid: Some(shared_vault_uuid.to_string()),
            created_at_timestamp: self.timer.now_micros(),
        };

        self.db.write(|conn| user_events::insert(conn, &event))?;

        Ok(event)
    }

    /// List a user's events, newest first
    pub fn list_for_user(&self, user_uuid: &str) -> Result<Vec<UserEventRow>, SyncError> {
        self.db
            .read(|conn| user_events::find_all_for_user(conn, user_uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> UserEventService {
        UserEventService::new(
            Arc::new(ItemDb::open_in_memory().unwrap()),
            Arc::new(Timer::new()),
        )
    }

    #[test]
    fn test_removal_event_then_cleanup() {
        let svc = service();

        let event = svc
            .create_item_removed_from_shared_vault_user_event("u-1", "a-1", "v-1")
            .unwrap();
        assert_eq!(event.item_uuid.as_deref(), Some("a-1"));
        assert_eq!(svc.list_for_user("u-1").unwrap().len(), 1);

        svc.remove_user_events_after_item_is_added_to_shared_vault("u-1", "a-1", "v-2")
            .unwrap();
        assert!(svc.list_for_user("u-1").unwrap().is_empty());
    }
}
