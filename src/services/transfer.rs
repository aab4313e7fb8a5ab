//! Transfer-size calculator
//!
//! A sync response must not exceed the configured byte budget even when
//! the page limit would allow more items. The calculator streams the
//! `(uuid, content_size, updated_at)` projection under the query's own
//! filters and ordering, and selects the longest prefix that fits.
//!
//! Cursor queries carry an inclusive boundary, so the stream head may be
//! the item the previous page ended on. Those *anchor* rows still consume
//! budget (the window advances one budget-span per page) but are not
//! re-delivered.

use std::sync::Arc;

use crate::db::items::{self, ItemQuery};
use crate::db::ItemDb;
use crate::error::SyncError;

/// Which uuids to hydrate, and whether the budget or limit cut the page
/// short of the matching stream
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    pub uuids: Vec<String>,
    pub truncated: bool,
}

/// Select the ordered prefix of matching items whose sizes fit the budget.
///
/// `cursor_boundary` is the decoded cursor timestamp for inclusive
/// queries; leading rows at exactly that instant are treated as anchors.
/// The first deliverable item is always included, even when the running
/// total already exceeds the budget; otherwise a single oversized item
/// would stall the cursor forever.
pub fn select_uuids_under_budget(
    db: &Arc<ItemDb>,
    query: &ItemQuery,
    budget_bytes: u64,
    cursor_boundary: Option<i64>,
) -> Result<TransferPlan, SyncError> {
    let stream = db.read(|conn| items::content_sizes(conn, query))?;

    let mut uuids = Vec::new();
    let mut anchored = 0usize;
    let mut total: u64 = 0;

    for row in &stream {
        let size = row.content_size.max(0) as u64;

        if uuids.is_empty() {
            // Anchors are only recognized as a contiguous head of the stream
            if cursor_boundary == Some(row.updated_at_timestamp) {
                anchored += 1;
                total += size;
                continue;
            }

            uuids.push(row.uuid.clone());
            total += size;
            if total > budget_bytes {
                break;
            }
            continue;
        }

        if total + size > budget_bytes {
            break;
        }

        total += size;
        uuids.push(row.uuid.clone());
    }

    let truncated = anchored + uuids.len() < stream.len();

    Ok(TransferPlan { uuids, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::items::{insert_item, Item};

    fn sized_item(uuid: &str, updated_at: i64, content_size: i64) -> Item {
        Item {
            uuid: uuid.to_string(),
            user_uuid: "u-1".to_string(),
            content: Some("003:encrypted".to_string()),
            content_type: Some("Note".to_string()),
            content_size,
            created_at_timestamp: updated_at,
            updated_at_timestamp: updated_at,
            ..Default::default()
        }
    }

    fn seeded_db(sizes: &[(&str, i64, i64)]) -> Arc<ItemDb> {
        let db = Arc::new(ItemDb::open_in_memory().unwrap());
        db.read(|conn| {
            for (uuid, updated_at, size) in sizes {
                insert_item(conn, &sized_item(uuid, *updated_at, *size))?;
            }
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_prefix_under_budget() {
        let db = seeded_db(&[("a", 1000, 60), ("b", 2000, 60), ("c", 3000, 10)]);
        let plan =
            select_uuids_under_budget(&db, &ItemQuery::for_user("u-1"), 100, None).unwrap();
        assert_eq!(plan.uuids, vec!["a"]);
        assert!(plan.truncated);
    }

    #[test]
    fn test_everything_fits() {
        let db = seeded_db(&[("a", 1000, 30), ("b", 2000, 30), ("c", 3000, 30)]);
        let plan =
            select_uuids_under_budget(&db, &ItemQuery::for_user("u-1"), 100, None).unwrap();
        assert_eq!(plan.uuids, vec!["a", "b", "c"]);
        assert!(!plan.truncated);
    }

    #[test]
    fn test_oversized_first_item_still_delivered() {
        let db = seeded_db(&[("a", 1000, 500), ("b", 2000, 10)]);
        let plan =
            select_uuids_under_budget(&db, &ItemQuery::for_user("u-1"), 100, None).unwrap();
        assert_eq!(plan.uuids, vec!["a"]);
        assert!(plan.truncated);
    }

    #[test]
    fn test_exact_fit_is_not_truncated() {
        let db = seeded_db(&[("a", 1000, 50), ("b", 2000, 50)]);
        let plan =
            select_uuids_under_budget(&db, &ItemQuery::for_user("u-1"), 100, None).unwrap();
        assert_eq!(plan.uuids, vec!["a", "b"]);
        assert!(!plan.truncated);
    }

    #[test]
    fn test_empty_stream() {
        let db = seeded_db(&[]);
        let plan =
            select_uuids_under_budget(&db, &ItemQuery::for_user("u-1"), 100, None).unwrap();
        assert!(plan.uuids.is_empty());
        assert!(!plan.truncated);
    }

    #[test]
    fn test_respects_query_limit() {
        let db = seeded_db(&[("a", 1000, 10), ("b", 2000, 10), ("c", 3000, 10)]);
        let mut query = ItemQuery::for_user("u-1");
        query.limit = Some(2);
        let plan = select_uuids_under_budget(&db, &query, 1000, None).unwrap();
        assert_eq!(plan.uuids, vec!["a", "b"]);
        assert!(!plan.truncated);
    }

    #[test]
    fn test_anchor_consumes_budget_without_delivery() {
        use crate::db::items::TimeComparator;

        let db = seeded_db(&[("a", 1000, 60), ("b", 2000, 60), ("c", 3000, 10)]);
        let mut query = ItemQuery::for_user("u-1");
        query.last_sync_time = Some(1000);
        query.comparator = TimeComparator::AtOrAfter;

        // The boundary item "a" anchors the window: counted, not delivered
        let plan = select_uuids_under_budget(&db, &query, 100, Some(1000)).unwrap();
        assert_eq!(plan.uuids, vec!["b"]);
        assert!(plan.truncated);
    }

    #[test]
    fn test_anchor_only_stream_is_exhausted() {
        use crate::db::items::TimeComparator;

        let db = seeded_db(&[("a", 1000, 60)]);
        let mut query = ItemQuery::for_user("u-1");
        query.last_sync_time = Some(1000);
        query.comparator = TimeComparator::AtOrAfter;

        let plan = select_uuids_under_budget(&db, &query, 100, Some(1000)).unwrap();
        assert!(plan.uuids.is_empty());
        assert!(!plan.truncated);
    }
}
