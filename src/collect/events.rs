//! Collection Events
//!
//! Notification payloads produced after a collection result has been
//! committed. The engine only returns identifiers; these events carry the
//! display data the client shows as a transient message.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::collect::drop::{DropCatalog, ItemSlot};
use crate::collect::engine::CollectionResult;
use crate::store::model::UserId;

/// A single item collected by a user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionEvent {
    /// User who collected the item.
    pub user_id: UserId,
    /// Item identifier.
    pub item_id: String,
    /// Display title.
    pub title: String,
    /// Display description.
    pub description: String,
    /// Icon reference.
    pub icon: String,
    /// Slot the item can be equipped in.
    pub slot: ItemSlot,
    /// When the collection was committed.
    pub collected_at: DateTime<Utc>,
}

impl CollectionEvent {
    /// Build one event per collected identifier, in result order.
    ///
    /// Identifiers missing from the catalog are skipped; the catalog is the
    /// same one the result was evaluated against, so that only happens
    /// when a caller mixes catalogs.
    pub fn from_result(
        user_id: UserId,
        result: &CollectionResult,
        catalog: &DropCatalog,
        collected_at: DateTime<Utc>,
    ) -> Vec<CollectionEvent> {
        result
            .iter()
            .filter_map(|id| catalog.get(id))
            .map(|item| CollectionEvent {
                user_id,
                item_id: item.id.clone(),
                title: item.title.clone(),
                description: item.description.clone(),
                icon: item.icon.clone(),
                slot: item.slot,
                collected_at,
            })
            .collect()
    }

    /// Short user-facing message.
    pub fn message(&self) -> String {
        format!("You found the {}!", self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::engine::{evaluate, CollectedSet};
    use crate::core::geo::GeoPoint;

    #[test]
    fn test_events_follow_result_order() {
        let catalog = DropCatalog::builtin();
        let crown = catalog.get("hat_crown").unwrap().position;

        let result = evaluate(crown, catalog.drops(), &CollectedSet::new()).unwrap();
        let events = CollectionEvent::from_result(UserId(7), &result, &catalog, Utc::now());

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item_id, "hat_crown");
        assert_eq!(events[0].user_id, UserId(7));
        assert_eq!(events[0].slot, ItemSlot::Hat);
        assert_eq!(events[0].message(), "You found the Crown!");
    }

    #[test]
    fn test_empty_result_no_events() {
        let catalog = DropCatalog::builtin();
        let far = GeoPoint::new(0.0, 0.0);
        let result = evaluate(far, catalog.drops(), &CollectedSet::new()).unwrap();
        assert!(CollectionEvent::from_result(UserId(1), &result, &catalog, Utc::now()).is_empty());
    }
}
