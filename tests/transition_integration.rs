//! Integration tests for the dual-store transition runner
//!
//! These tests run full migrations between two in-memory stores and
//! exercise the resumability and failure paths.

use std::sync::Arc;

use vellum_sync::clock::Timer;
use vellum_sync::db::items::{self, Item, ItemQuery};
use vellum_sync::db::transitions::{self, TransitionStatusRow};
use vellum_sync::db::ItemDb;
use vellum_sync::services::events::{DomainEvent, EventBus};
use vellum_sync::transition::{
    TransitionConfig, TransitionOutcome, TransitionRunner, TransitionState,
    TRANSITION_TYPE_ITEMS,
};

const USER: &str = "user-1";

struct TestStores {
    source: Arc<ItemDb>,
    target: Arc<ItemDb>,
    events: Arc<EventBus>,
    runner: TransitionRunner,
}

fn stores() -> TestStores {
    let source = Arc::new(ItemDb::open_in_memory().unwrap());
    let target = Arc::new(ItemDb::open_in_memory().unwrap());
    let events = Arc::new(EventBus::new());
    let runner = TransitionRunner::new(
        source.clone(),
        target.clone(),
        events.clone(),
        Arc::new(Timer::new()),
        TransitionConfig {
            page_size: 2,
            settle_delay_ms: 1,
            overwrite_settle_delay_ms: 1,
        },
    );
    TestStores {
        source,
        target,
        events,
        runner,
    }
}

fn seed(db: &ItemDb, uuid: &str, created_at: i64, vault: Option<&str>) -> Item {
    let item = Item {
        uuid: uuid.to_string(),
        user_uuid: USER.to_string(),
        content: Some(format!("003:payload-{}", uuid)),
        content_type: Some("Note".to_string()),
        content_size: 64,
        shared_vault_uuid: vault.map(|v| v.to_string()),
        created_at_timestamp: created_at,
        updated_at_timestamp: created_at,
        ..Default::default()
    };
    db.write(|conn| items::insert_item(conn, &item)).unwrap();
    item
}

fn count(db: &ItemDb) -> i64 {
    db.read(|conn| items::count_all(conn, &ItemQuery::for_user(USER)))
        .unwrap()
}

fn status(db: &ItemDb) -> Option<TransitionStatusRow> {
    db.read(|conn| transitions::find_status(conn, USER, TRANSITION_TYPE_ITEMS))
        .unwrap()
}

#[tokio::test]
async fn test_full_transition_copies_verifies_and_cleans_up() {
    let stores = stores();
    for i in 1..=5 {
        seed(&stores.source, &format!("item-{}", i), 1000 * i, None);
    }
    seed(&stores.source, "vaulted", 9000, Some("vault-v"));

    let outcome = stores.runner.run(USER).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Verified);

    // Everything copied
    assert_eq!(count(&stores.target), 6);

    // Only the shared-vault item survives in the source
    let remaining = stores
        .source
        .read(|conn| items::find_all(conn, &ItemQuery::for_user(USER)))
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].uuid, "vaulted");

    let row = status(&stores.target).unwrap();
    assert_eq!(row.status, TransitionState::Verified);
}

#[tokio::test]
async fn test_copied_items_are_identical() {
    let stores = stores();
    let original = seed(&stores.source, "item-1", 1000, None);

    stores.runner.run(USER).await.unwrap();

    let copied = stores
        .target
        .read(|conn| items::find_by_uuid(conn, USER, "item-1"))
        .unwrap()
        .unwrap();
    assert!(copied.is_identical_to(&original));
}

#[tokio::test]
async fn test_populated_target_counts_as_migrated() {
    let stores = stores();
    seed(&stores.source, "item-1", 1000, None);
    seed(&stores.target, "item-1", 1000, None);

    let outcome = stores.runner.run(USER).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::AlreadyMigrated);

    // Source untouched: no copy or cleanup ran
    assert_eq!(count(&stores.source), 1);
    let row = status(&stores.target).unwrap();
    assert_eq!(row.status, TransitionState::Verified);
}

#[tokio::test]
async fn test_verified_run_is_idempotent() {
    let stores = stores();
    seed(&stores.source, "item-1", 1000, None);

    assert_eq!(
        stores.runner.run(USER).await.unwrap(),
        TransitionOutcome::Verified
    );
    assert_eq!(
        stores.runner.run(USER).await.unwrap(),
        TransitionOutcome::AlreadyMigrated
    );
}

/// A crashed run resumes at the recorded page, not page 1
#[tokio::test]
async fn test_resume_starts_at_recorded_page() {
    let stores = stores();
    // Ten items, page size 2: five pages
    for i in 1..=10 {
        seed(&stores.source, &format!("item-{:02}", i), 1000 * i, None);
    }

    // Simulate a crash after page 2 completed
    stores
        .target
        .write(|conn| {
            let mut row = TransitionStatusRow::not_started(USER, TRANSITION_TYPE_ITEMS);
            row.status = TransitionState::InProgress;
            row.paging_progress = 3;
            row.updated_at_timestamp = 1;
            transitions::save_status(conn, &row)
        })
        .unwrap();

    let outcome = stores.runner.run(USER).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Verified);

    // Pages 3..5 were copied (items 5..10); pages 1..2 were not re-read
    let copied: Vec<String> = stores
        .target
        .read(|conn| items::find_all(conn, &ItemQuery::for_user(USER)))
        .unwrap()
        .into_iter()
        .map(|i| i.uuid)
        .collect();
    assert_eq!(
        copied,
        (5..=10).map(|i| format!("item-{:02}", i)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_newer_target_item_is_not_overwritten() {
    let stores = stores();
    seed(&stores.source, "item-1", 1000, None);

    // Target already holds a newer edit of the same item
    let newer = Item {
        uuid: "item-1".to_string(),
        user_uuid: USER.to_string(),
        content: Some("003:newer".to_string()),
        content_type: Some("Note".to_string()),
        content_size: 64,
        created_at_timestamp: 1000,
        updated_at_timestamp: 5000,
        ..Default::default()
    };
    stores
        .target
        .write(|conn| {
            items::insert_item(conn, &newer)?;
            // An in-progress status so the precondition does not shortcut
            let mut row = TransitionStatusRow::not_started(USER, TRANSITION_TYPE_ITEMS);
            row.status = TransitionState::InProgress;
            row.paging_progress = 1;
            row.updated_at_timestamp = 1;
            transitions::save_status(conn, &row)
        })
        .unwrap();

    // Verification fails because the source copy is older and different
    let outcome = stores.runner.run(USER).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Failed);

    // The newer target item was preserved
    let kept = stores
        .target
        .read(|conn| items::find_by_uuid(conn, USER, "item-1"))
        .unwrap()
        .unwrap();
    assert_eq!(kept.content.as_deref(), Some("003:newer"));
}

#[tokio::test]
async fn test_failed_verification_resets_progress() {
    let stores = stores();
    seed(&stores.source, "item-1", 1000, None);

    // A target item the source has never seen
    let ghost = Item {
        uuid: "ghost".to_string(),
        user_uuid: USER.to_string(),
        content: Some("003:ghost".to_string()),
        content_type: Some("Note".to_string()),
        created_at_timestamp: 500,
        updated_at_timestamp: 500,
        ..Default::default()
    };
    stores
        .target
        .write(|conn| {
            items::insert_item(conn, &ghost)?;
            let mut row = TransitionStatusRow::not_started(USER, TRANSITION_TYPE_ITEMS);
            row.status = TransitionState::InProgress;
            row.paging_progress = 1;
            row.updated_at_timestamp = 1;
            transitions::save_status(conn, &row)
        })
        .unwrap();

    let outcome = stores.runner.run(USER).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Failed);

    let row = status(&stores.target).unwrap();
    assert_eq!(row.status, TransitionState::Failed);
    // Progress is reset so the retry rechecks everything
    assert_eq!(row.paging_progress, 1);
    assert_eq!(row.integrity_progress, 1);

    // The source was not cleaned up
    assert_eq!(count(&stores.source), 1);
}

#[tokio::test]
async fn test_failed_run_can_retry_to_verified() {
    let stores = stores();
    seed(&stores.source, "item-1", 1000, None);

    let ghost = Item {
        uuid: "ghost".to_string(),
        user_uuid: USER.to_string(),
        content: Some("003:ghost".to_string()),
        content_type: Some("Note".to_string()),
        created_at_timestamp: 500,
        updated_at_timestamp: 500,
        ..Default::default()
    };
    stores
        .target
        .write(|conn| {
            items::insert_item(conn, &ghost)?;
            let mut row = TransitionStatusRow::not_started(USER, TRANSITION_TYPE_ITEMS);
            row.status = TransitionState::InProgress;
            row.paging_progress = 1;
            row.updated_at_timestamp = 1;
            transitions::save_status(conn, &row)
        })
        .unwrap();

    assert_eq!(
        stores.runner.run(USER).await.unwrap(),
        TransitionOutcome::Failed
    );

    // Operator reconciles the divergence, then retries
    stores
        .target
        .write(|conn| items::remove_by_uuid(conn, "ghost").map(|_| ()))
        .unwrap();

    assert_eq!(
        stores.runner.run(USER).await.unwrap(),
        TransitionOutcome::Verified
    );
    assert_eq!(count(&stores.source), 0);
}

#[tokio::test]
async fn test_status_events_are_emitted() {
    let stores = stores();
    let mut receiver = stores.events.subscribe();
    seed(&stores.source, "item-1", 1000, None);

    stores.runner.run(USER).await.unwrap();

    let mut states = vec![];
    while let Ok(event) = receiver.try_recv() {
        if let DomainEvent::TransitionStatusUpdated {
            user_uuid,
            status,
            transition_type,
            ..
        } = event
        {
            assert_eq!(user_uuid, USER);
            assert_eq!(transition_type, TRANSITION_TYPE_ITEMS);
            states.push(status);
        }
    }

    assert_eq!(states.first(), Some(&TransitionState::InProgress));
    assert_eq!(states.last(), Some(&TransitionState::Verified));
}

#[tokio::test]
async fn test_transition_of_empty_user_verifies() {
    let stores = stores();

    let outcome = stores.runner.run(USER).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Verified);
    assert_eq!(count(&stores.target), 0);
}
