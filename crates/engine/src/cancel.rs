//! Cancellation across item, batch, project, user and all-jobs scopes.
//!
//! Waiting items (`Queued`/`Assigned`) are cancelled by direct
//! compare-and-swap. In-flight items get a cooperative flag: the GPU call
//! is never aborted mid-flight, but the scheduler checks the flag at its
//! per-item checkpoints and discards the raw result, forcing the recorded
//! status to `Cancelled`. Each bulk operation emits exactly one aggregate
//! event.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use segmentd_core::types::OwnerRef;
use segmentd_notify::bus::NotificationBus;
use segmentd_notify::events::Event;
use segmentd_queue::item::{CancelScope, CancellationRecord, ItemStatus};
use segmentd_queue::store::QueueStore;

use crate::metrics::EngineMetrics;

/// Cooperative cancellation flags for in-flight items.
///
/// Each flag lives here and nowhere else; settlement takes it exactly
/// once via [`CancelFlags::take`].
#[derive(Debug, Default)]
pub struct CancelFlags {
    inner: Mutex<HashSet<Uuid>>,
}

impl CancelFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: Uuid) {
        self.inner.lock().unwrap().insert(id);
    }

    /// Consume the flag for an item. Returns whether it was set.
    pub fn take(&self, id: Uuid) -> bool {
        self.inner.lock().unwrap().remove(&id)
    }

    pub fn is_set(&self, id: Uuid) -> bool {
        self.inner.lock().unwrap().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

pub struct CancellationCoordinator {
    store: Arc<QueueStore>,
    flags: Arc<CancelFlags>,
    bus: Arc<NotificationBus>,
    metrics: Arc<EngineMetrics>,
}

impl CancellationCoordinator {
    pub fn new(
        store: Arc<QueueStore>,
        flags: Arc<CancelFlags>,
        bus: Arc<NotificationBus>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self { store, flags, bus, metrics }
    }

    /// Cancel a single item. Returns the affected count (0 or 1);
    /// cancelling an already-terminal item is a silent no-op.
    pub async fn cancel_item(&self, id: Uuid) -> u64 {
        let affected = u64::from(self.cancel_one(id));
        self.finish(CancelScope::Item, Some(id.to_string()), affected).await
    }

    /// Cancel every non-terminal item of a batch.
    pub async fn cancel_batch(&self, batch_id: Uuid) -> u64 {
        let affected = self
            .store
            .items_in_batch(batch_id)
            .iter()
            .filter(|item| self.cancel_one(item.id))
            .count() as u64;
        self.finish(CancelScope::Batch, Some(batch_id.to_string()), affected).await
    }

    /// Cancel every non-terminal item of a project.
    pub async fn cancel_for_project(&self, project_id: &str) -> u64 {
        let affected = self.cancel_owner(&OwnerRef::Project(project_id.to_string()));
        self.finish(CancelScope::Project, Some(project_id.to_string()), affected).await
    }

    /// Cancel every non-terminal item of a user.
    pub async fn cancel_for_user(&self, user_id: &str) -> u64 {
        let affected = self.cancel_owner(&OwnerRef::User(user_id.to_string()));
        self.finish(CancelScope::User, Some(user_id.to_string()), affected).await
    }

    /// Emergency stop: cancel every active item in the system.
    pub async fn cancel_all(&self) -> u64 {
        let affected = self
            .store
            .active_items()
            .iter()
            .filter(|item| self.cancel_one(item.id))
            .count() as u64;
        self.finish(CancelScope::All, None, affected).await
    }

    fn cancel_owner(&self, owner: &OwnerRef) -> u64 {
        self.store
            .items_for_owner(owner)
            .iter()
            .filter(|item| self.cancel_one(item.id))
            .count() as u64
    }

    /// Cancel one item, looping on lost swaps. Returns whether this call
    /// is responsible for the item ending up cancelled.
    fn cancel_one(&self, id: Uuid) -> bool {
        loop {
            let Some(item) = self.store.item(id) else {
                return false;
            };
            if item.status.is_terminal() {
                return false;
            }
            match item.status {
                ItemStatus::Queued | ItemStatus::Assigned => {
                    if self.store.transition(
                        id,
                        item.status,
                        ItemStatus::Cancelled,
                        Default::default(),
                    ) {
                        EngineMetrics::incr(&self.metrics.items_cancelled);
                        debug!(item_id = %id, from = %item.status, "item cancelled");
                        return true;
                    }
                    // Lost a race with the scheduler; re-read and retry.
                }
                ItemStatus::Processing => {
                    self.flags.set(id);
                    // If settlement won the race the flag came too late.
                    if let Some(now) = self.store.item(id) {
                        if now.status.is_terminal() {
                            self.flags.take(id);
                            return now.status == ItemStatus::Cancelled;
                        }
                    }
                    debug!(item_id = %id, "in-flight item flagged for cancellation");
                    return true;
                }
                _ => return false,
            }
        }
    }

    /// Record the audit entry and publish the single aggregate event.
    /// A zero-affected operation stays silent (idempotency).
    async fn finish(&self, scope: CancelScope, target: Option<String>, affected: u64) -> u64 {
        if affected == 0 {
            debug!(?scope, ?target, "cancellation matched nothing");
            return 0;
        }

        self.store.record_cancellation(CancellationRecord {
            scope,
            target: target.clone(),
            issued_at: Utc::now(),
            affected,
        });

        info!(?scope, ?target, affected, "cancellation applied");
        let outcome = self
            .bus
            .publish(&Event::CancellationApplied {
                scope,
                target,
                cancelled_count: affected,
            })
            .await;
        EngineMetrics::add(&self.metrics.notifications_sent, outcome.sent);
        EngineMetrics::add(&self.metrics.notifications_failed, outcome.failed);
        affected
    }
}
