//! Publishes state-change events and answers reconciliation queries.
//!
//! Fan-out is best-effort: an individual delivery failure is logged and
//! counted, never retried here and never surfaced to the submitter. The
//! pull-based [`NotificationBus::reconcile`] recomputes a subscriber's
//! aggregate view straight from the authoritative store and is the
//! correctness backstop for lost pushes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use segmentd_core::types::OwnerRef;
use segmentd_queue::item::AggregateCounts;
use segmentd_queue::store::QueueStore;

use crate::error::NotifyError;
use crate::events::Event;
use crate::transport::Transport;

/// What a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    /// Everything, including unscoped `batch:settled` events.
    All,
    Project(String),
    User(String),
}

impl EventFilter {
    /// Whether an event is visible under this filter.
    ///
    /// Batches group by model, not owner, so `batch:settled` only reaches
    /// `All` subscribers; owner-scoped subscribers learn outcomes from the
    /// per-item events.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Project(p) => event.project_id() == Some(p.as_str()),
            Self::User(u) => event.user_id() == Some(u.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscriber_id: String,
    pub filter: EventFilter,
    pub created_at: DateTime<Utc>,
}

/// Counts for one publish fan-out.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryOutcome {
    pub sent: u64,
    pub failed: u64,
}

/// Authoritative aggregate view returned by `reconcile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateState {
    pub filter: EventFilter,
    pub counts: AggregateCounts,
    pub as_of: DateTime<Utc>,
}

pub struct NotificationBus {
    store: Arc<QueueStore>,
    transport: Arc<dyn Transport>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl NotificationBus {
    pub fn new(store: Arc<QueueStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber, replacing any previous filter.
    pub fn subscribe(&self, subscriber_id: &str, filter: EventFilter) {
        debug!(subscriber_id, ?filter, "subscriber registered");
        self.subscriptions.write().unwrap().insert(
            subscriber_id.to_string(),
            Subscription {
                subscriber_id: subscriber_id.to_string(),
                filter,
                created_at: Utc::now(),
            },
        );
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.subscriptions.write().unwrap().remove(subscriber_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().unwrap().len()
    }

    /// Fan an event out to every matching subscriber.
    ///
    /// One subscriber's failure never blocks another's delivery.
    pub async fn publish(&self, event: &Event) -> DeliveryOutcome {
        let targets: Vec<String> = {
            let subs = self.subscriptions.read().unwrap();
            subs.values()
                .filter(|s| s.filter.matches(event))
                .map(|s| s.subscriber_id.clone())
                .collect()
        };

        let mut outcome = DeliveryOutcome::default();
        for subscriber_id in targets {
            match self.transport.send(&subscriber_id, event).await {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        subscriber_id = %subscriber_id,
                        error = %e,
                        "push delivery failed, reconcile will correct"
                    );
                }
            }
        }
        outcome
    }

    /// Recompute the subscriber's aggregate view from the authoritative
    /// store. Callable on reconnect or periodically.
    pub fn reconcile(&self, subscriber_id: &str) -> Result<AggregateState, NotifyError> {
        let filter = {
            let subs = self.subscriptions.read().unwrap();
            subs.get(subscriber_id)
                .map(|s| s.filter.clone())
                .ok_or_else(|| NotifyError::UnknownSubscriber(subscriber_id.to_string()))?
        };

        let counts = match &filter {
            EventFilter::All => self.store.aggregate_all(),
            EventFilter::Project(p) => self.store.aggregate(&OwnerRef::Project(p.clone())),
            EventFilter::User(u) => self.store.aggregate(&OwnerRef::User(u.clone())),
        };

        Ok(AggregateState {
            filter,
            counts,
            as_of: Utc::now(),
        })
    }
}
