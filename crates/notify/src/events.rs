//! State-change events pushed to subscribers.
//!
//! Every event is self-contained: ids, the new status, and aggregate
//! counts travel with it, so a subscriber never needs a follow-up query
//! to render it. Delivery is at-least-once and not ordering-guaranteed:
//! consumers resolve conflicts with [`ItemStatus::rank`] and
//! `finished_at`, never arrival order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use segmentd_queue::item::{AggregateCounts, CancelScope, ItemStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// An item moved to a new status.
    #[serde(rename = "item:statusChanged")]
    ItemStatusChanged {
        item_id: Uuid,
        batch_id: Option<Uuid>,
        project_id: String,
        user_id: String,
        status: ItemStatus,
        attempt: u32,
        /// Project-scoped counts as of this change.
        aggregates: AggregateCounts,
    },

    /// Every item of a dispatched batch reached a terminal or requeued
    /// state.
    #[serde(rename = "batch:settled")]
    BatchSettled {
        batch_id: Uuid,
        model_id: String,
        completed: u64,
        failed: u64,
        cancelled: u64,
    },

    /// One cancellation operation was applied. Bulk scopes emit exactly
    /// one of these, never one per item.
    #[serde(rename = "cancellation:applied")]
    CancellationApplied {
        scope: CancelScope,
        target: Option<String>,
        cancelled_count: u64,
    },
}

impl Event {
    /// Project scope of the event, when it has one. Batches group by
    /// model, not owner, so `batch:settled` is unscoped.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Self::ItemStatusChanged { project_id, .. } => Some(project_id),
            Self::CancellationApplied { scope: CancelScope::Project, target, .. } => {
                target.as_deref()
            }
            _ => None,
        }
    }

    /// User scope of the event, when it has one.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::ItemStatusChanged { user_id, .. } => Some(user_id),
            Self::CancellationApplied { scope: CancelScope::User, target, .. } => target.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_tags() {
        let event = Event::BatchSettled {
            batch_id: Uuid::new_v4(),
            model_id: "hrnet".into(),
            completed: 4,
            failed: 1,
            cancelled: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "batch:settled");
        assert_eq!(json["completed"], 4);

        let back: Event = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Event::BatchSettled { failed: 1, .. }));
    }

    #[test]
    fn scoping_accessors() {
        let event = Event::ItemStatusChanged {
            item_id: Uuid::new_v4(),
            batch_id: None,
            project_id: "p1".into(),
            user_id: "u1".into(),
            status: ItemStatus::Completed,
            attempt: 0,
            aggregates: AggregateCounts::default(),
        };
        assert_eq!(event.project_id(), Some("p1"));
        assert_eq!(event.user_id(), Some("u1"));

        let cancel = Event::CancellationApplied {
            scope: CancelScope::Project,
            target: Some("p2".into()),
            cancelled_count: 3,
        };
        assert_eq!(cancel.project_id(), Some("p2"));
        assert_eq!(cancel.user_id(), None);
    }
}
