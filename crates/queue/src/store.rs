//! Authoritative record of every item and batch.
//!
//! All shared-state mutation in the engine funnels through the
//! compare-and-swap [`QueueStore::transition`]; the scheduler,
//! cancellation and notification paths share no other mutable state. A
//! stale swap returns `false` and the caller re-reads; it is never an
//! error.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use segmentd_core::types::OwnerRef;

use crate::error::QueueError;
use crate::item::{
    AggregateCounts, Batch, BatchStatus, CancellationRecord, ItemStatus, NewItem, QueueItem,
};

/// Optional field updates applied atomically with a status swap.
#[derive(Debug, Default, Clone)]
pub struct TransitionUpdate {
    /// Attach the item to a batch.
    pub set_batch: Option<Uuid>,
    /// Detach the item from its batch (retry requeue).
    pub clear_batch: bool,
    /// Record the result reference (completion).
    pub result_ref: Option<String>,
    /// Record the error detail (failure).
    pub error: Option<String>,
    /// Count one finished processing attempt (retry requeue).
    pub bump_attempts: bool,
}

struct Inner {
    items: HashMap<Uuid, QueueItem>,
    batches: HashMap<Uuid, Batch>,
    cancellations: Vec<CancellationRecord>,
    seq: u64,
}

/// In-memory authoritative store, rebuildable from a persisted snapshot.
pub struct QueueStore {
    max_pending_per_user: usize,
    inner: RwLock<Inner>,
}

impl QueueStore {
    pub fn new(max_pending_per_user: usize) -> Self {
        Self {
            max_pending_per_user,
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                batches: HashMap::new(),
                cancellations: Vec::new(),
                seq: 0,
            }),
        }
    }

    /// Rebuild from persisted state after a restart. The submission
    /// sequence resumes past the highest seen value; gate permits are not
    /// restored here; in-flight work is recomputed by the engine's
    /// recovery pass.
    pub fn from_snapshot(
        items: Vec<QueueItem>,
        batches: Vec<Batch>,
        max_pending_per_user: usize,
    ) -> Self {
        let seq = items.iter().map(|i| i.seq + 1).max().unwrap_or(0);
        Self {
            max_pending_per_user,
            inner: RwLock::new(Inner {
                items: items.into_iter().map(|i| (i.id, i)).collect(),
                batches: batches.into_iter().map(|b| (b.id, b)).collect(),
                cancellations: Vec::new(),
                seq,
            }),
        }
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Record a new item as `Queued`.
    ///
    /// Rejects with [`QueueError::CapacityExceeded`] when the user already
    /// holds the configured maximum of non-terminal items.
    pub fn submit(&self, new: NewItem) -> Result<Uuid, QueueError> {
        let mut inner = self.inner.write().unwrap();

        let pending = inner
            .items
            .values()
            .filter(|i| i.user_id == new.user_id && !i.status.is_terminal())
            .count();
        if pending >= self.max_pending_per_user {
            return Err(QueueError::CapacityExceeded {
                user_id: new.user_id,
                pending,
            });
        }

        let id = Uuid::new_v4();
        let seq = inner.seq;
        inner.seq += 1;
        inner.items.insert(
            id,
            QueueItem {
                id,
                project_id: new.project_id,
                user_id: new.user_id,
                model_id: new.model_id,
                image_ref: new.image_ref,
                seq,
                status: ItemStatus::Queued,
                batch_id: None,
                attempts: 0,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                result_ref: None,
                error: None,
            },
        );
        debug!(item_id = %id, seq, "item queued");
        Ok(id)
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Compare-and-swap status transition.
    ///
    /// Returns `false` when the item is unknown, `from` no longer matches,
    /// or the edge is not in the lifecycle graph. Callers treat `false`
    /// as "re-read and no-op", never as an error. Timestamps are stamped
    /// here: `started_at` on entry to `Processing`, `finished_at` on entry
    /// to a terminal status.
    pub fn transition(
        &self,
        id: Uuid,
        from: ItemStatus,
        to: ItemStatus,
        update: TransitionUpdate,
    ) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(item) = inner.items.get_mut(&id) else {
            warn!(item_id = %id, "transition on unknown item");
            return false;
        };
        if item.status != from {
            debug!(
                item_id = %id,
                expected = %from,
                actual = %item.status,
                "stale transition, caller should re-read"
            );
            return false;
        }
        if !from.can_transition_to(to) {
            warn!(item_id = %id, from = %from, to = %to, "transition not in lifecycle graph");
            return false;
        }

        item.status = to;
        if let Some(batch_id) = update.set_batch {
            item.batch_id = Some(batch_id);
        }
        if update.clear_batch {
            item.batch_id = None;
        }
        if let Some(result_ref) = update.result_ref {
            item.result_ref = Some(result_ref);
        }
        if let Some(error) = update.error {
            item.error = Some(error);
        }
        if update.bump_attempts {
            item.attempts += 1;
        }
        let now = Utc::now();
        if to == ItemStatus::Processing {
            item.started_at = Some(now);
        }
        if to.is_terminal() {
            item.finished_at = Some(now);
        }
        debug!(item_id = %id, from = %from, to = %to, "item transitioned");
        true
    }

    /// Attach a batch to an already-`Assigned` item (retry re-entry).
    /// CAS on "status is `Assigned` and no batch attached".
    pub fn attach_batch(&self, id: Uuid, batch_id: Uuid) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.items.get_mut(&id) {
            Some(item) if item.status == ItemStatus::Assigned && item.batch_id.is_none() => {
                item.batch_id = Some(batch_id);
                true
            }
            _ => false,
        }
    }

    /// Detach an `Assigned` item from its batch (restart recovery).
    pub fn detach_batch(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.items.get_mut(&id) {
            Some(item) if item.status == ItemStatus::Assigned => {
                item.batch_id = None;
                true
            }
            _ => false,
        }
    }

    // ── Batch lifecycle ──────────────────────────────────────────────

    pub fn create_batch(&self, model_id: &str) -> Uuid {
        let mut inner = self.inner.write().unwrap();
        let id = Uuid::new_v4();
        inner.batches.insert(
            id,
            Batch {
                id,
                model_id: model_id.to_string(),
                item_ids: Vec::new(),
                status: BatchStatus::Forming,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Append an item to a `Forming` batch. Sealed batches are immutable.
    pub fn append_to_batch(&self, batch_id: Uuid, item_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.write().unwrap();
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or(QueueError::UnknownBatch(batch_id))?;
        if batch.status != BatchStatus::Forming {
            return Err(QueueError::BatchSealed(batch_id));
        }
        batch.item_ids.push(item_id);
        Ok(())
    }

    /// Seal a batch: `Forming → Dispatched`. Returns `false` on a stale swap.
    pub fn seal_batch(&self, batch_id: Uuid) -> bool {
        self.swap_batch_status(batch_id, BatchStatus::Forming, BatchStatus::Dispatched)
    }

    /// Settle a batch: `Dispatched → Settled`.
    pub fn settle_batch(&self, batch_id: Uuid) -> bool {
        self.swap_batch_status(batch_id, BatchStatus::Dispatched, BatchStatus::Settled)
    }

    fn swap_batch_status(&self, batch_id: Uuid, from: BatchStatus, to: BatchStatus) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.batches.get_mut(&batch_id) {
            Some(batch) if batch.status == from => {
                batch.status = to;
                true
            }
            Some(_) | None => false,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn item(&self, id: Uuid) -> Option<QueueItem> {
        self.inner
            .read()
            .unwrap()
            .items
            .get(&id)
            .cloned()
    }

    pub fn batch(&self, id: Uuid) -> Option<Batch> {
        self.inner
            .read()
            .unwrap()
            .batches
            .get(&id)
            .cloned()
    }

    /// Items of a batch in batch order.
    pub fn items_in_batch(&self, batch_id: Uuid) -> Vec<QueueItem> {
        let inner = self.inner.read().unwrap();
        let Some(batch) = inner.batches.get(&batch_id) else {
            return Vec::new();
        };
        batch
            .item_ids
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    /// All items for an owner, in submission order.
    pub fn items_for_owner(&self, owner: &OwnerRef) -> Vec<QueueItem> {
        let inner = self.inner.read().unwrap();
        let mut items: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|i| owner_matches(owner, i))
            .cloned()
            .collect();
        items.sort_by_key(|i| i.seq);
        items
    }

    /// All non-terminal items, in submission order.
    pub fn active_items(&self) -> Vec<QueueItem> {
        let inner = self.inner.read().unwrap();
        let mut items: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|i| !i.status.is_terminal())
            .cloned()
            .collect();
        items.sort_by_key(|i| i.seq);
        items
    }

    pub fn aggregate(&self, owner: &OwnerRef) -> AggregateCounts {
        let inner = self.inner.read().unwrap();
        let mut counts = AggregateCounts::default();
        for item in inner.items.values().filter(|i| owner_matches(owner, i)) {
            counts.bump(item.status);
        }
        counts
    }

    pub fn aggregate_all(&self) -> AggregateCounts {
        let inner = self.inner.read().unwrap();
        let mut counts = AggregateCounts::default();
        for item in inner.items.values() {
            counts.bump(item.status);
        }
        counts
    }

    pub fn processing_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .items
            .values()
            .filter(|i| i.status == ItemStatus::Processing)
            .count()
    }

    /// All batches, unordered. Used by restart recovery.
    pub fn batches(&self) -> Vec<Batch> {
        let inner = self.inner.read().unwrap();
        inner.batches.values().cloned().collect()
    }

    /// Snapshot for the persistence collaborator.
    pub fn snapshot(&self) -> (Vec<QueueItem>, Vec<Batch>) {
        let inner = self.inner.read().unwrap();
        (
            inner.items.values().cloned().collect(),
            inner.batches.values().cloned().collect(),
        )
    }

    // ── Cancellation audit ───────────────────────────────────────────

    pub fn record_cancellation(&self, record: CancellationRecord) {
        let mut inner = self.inner.write().unwrap();
        inner.cancellations.push(record);
    }

    pub fn cancellation_log(&self) -> Vec<CancellationRecord> {
        let inner = self.inner.read().unwrap();
        inner.cancellations.clone()
    }
}

fn owner_matches(owner: &OwnerRef, item: &QueueItem) -> bool {
    match owner {
        OwnerRef::Project(p) => &item.project_id == p,
        OwnerRef::User(u) => &item.user_id == u,
    }
}
