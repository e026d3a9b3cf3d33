//! Groups pending items into per-model batches.
//!
//! One open `Forming` batch per model. A batch seals when it reaches the
//! model's max size or when the flush window has elapsed since its first
//! item, whichever comes first, so no item waits indefinitely for a batch
//! to fill. Sealing is poll-driven: the scheduler tick calls
//! [`BatchAssembler::flush_due`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use segmentd_core::config::InferenceConfig;
use segmentd_core::types::ModelId;

use crate::item::{ItemStatus, QueueItem};
use crate::store::{QueueStore, TransitionUpdate};

struct FormingBatch {
    id: Uuid,
    opened_at: Instant,
    len: usize,
}

/// Accumulates queue items into per-model batches and hands sealed batch
/// ids to the scheduler over a channel.
pub struct BatchAssembler {
    store: Arc<QueueStore>,
    flush_window: Duration,
    max_sizes: HashMap<ModelId, usize>,
    default_max: usize,
    open: Mutex<HashMap<ModelId, FormingBatch>>,
    sealed_tx: mpsc::UnboundedSender<Uuid>,
}

impl BatchAssembler {
    /// Create an assembler. The returned receiver yields sealed batch ids
    /// in seal order.
    pub fn new(
        store: Arc<QueueStore>,
        inference: &InferenceConfig,
        flush_window: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                flush_window,
                max_sizes: inference.batch_sizes(),
                default_max: inference.default_batch_size.max(1),
                open: Mutex::new(HashMap::new()),
                sealed_tx,
            },
            sealed_rx,
        )
    }

    fn max_batch_for(&self, model_id: &str) -> usize {
        self.max_sizes.get(model_id).copied().unwrap_or(self.default_max)
    }

    /// Append an item to the open batch for its model, sealing on size.
    ///
    /// Handles both first assignment (`Queued → Assigned`) and retry
    /// re-entry (already `Assigned`, batch cleared). Returns `None` when
    /// the item lost a race with cancellation, in which case the caller no-ops.
    pub fn offer(&self, item: &QueueItem) -> Option<Uuid> {
        let max = self.max_batch_for(&item.model_id);
        let mut open = self.open.lock().unwrap();

        let created_here = !open.contains_key(&item.model_id);
        let (batch_id, len_before) = {
            let fb = open.entry(item.model_id.clone()).or_insert_with(|| FormingBatch {
                id: self.store.create_batch(&item.model_id),
                opened_at: Instant::now(),
                len: 0,
            });
            (fb.id, fb.len)
        };

        let joined = match item.status {
            ItemStatus::Queued => self.store.transition(
                item.id,
                ItemStatus::Queued,
                ItemStatus::Assigned,
                TransitionUpdate { set_batch: Some(batch_id), ..Default::default() },
            ),
            ItemStatus::Assigned => self.store.attach_batch(item.id, batch_id),
            _ => false,
        };
        if !joined {
            debug!(item_id = %item.id, "item no longer eligible for batching");
            if created_here && len_before == 0 {
                // Discard the batch opened for an item that never joined.
                open.remove(&item.model_id);
                self.store.seal_batch(batch_id);
                self.store.settle_batch(batch_id);
            }
            return None;
        }

        if let Err(e) = self.store.append_to_batch(batch_id, item.id) {
            // Unreachable while the open-map lock is held; sealed batches
            // are removed from the map under the same lock.
            warn!(batch_id = %batch_id, item_id = %item.id, error = %e, "failed to append to forming batch");
            return None;
        }

        let mut seal_now = false;
        if let Some(fb) = open.get_mut(&item.model_id) {
            fb.len += 1;
            seal_now = fb.len >= max;
        }
        if seal_now {
            if let Some(fb) = open.remove(&item.model_id) {
                self.seal(fb);
            }
        }
        Some(batch_id)
    }

    /// Seal open batches whose flush window elapsed. Called from the
    /// scheduler tick. Returns the sealed batch ids.
    pub fn flush_due(&self) -> Vec<Uuid> {
        let mut open = self.open.lock().unwrap();
        let due: Vec<ModelId> = open
            .iter()
            .filter(|(_, fb)| fb.len > 0 && fb.opened_at.elapsed() >= self.flush_window)
            .map(|(model, _)| model.clone())
            .collect();

        let mut sealed = Vec::with_capacity(due.len());
        for model in due {
            if let Some(fb) = open.remove(&model) {
                sealed.push(fb.id);
                self.seal(fb);
            }
        }
        sealed
    }

    /// Number of items currently buffered across all forming batches.
    pub fn buffered(&self) -> usize {
        self.open.lock().unwrap().values().map(|fb| fb.len).sum()
    }

    fn seal(&self, fb: FormingBatch) {
        if self.store.seal_batch(fb.id) {
            debug!(batch_id = %fb.id, items = fb.len, "batch sealed");
            if self.sealed_tx.send(fb.id).is_err() {
                warn!(batch_id = %fb.id, "scheduler channel closed, sealed batch dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::NewItem;
    use segmentd_core::config::ModelProfile;

    fn test_config() -> InferenceConfig {
        InferenceConfig {
            call_timeout_ms: 30_000,
            model_profiles: vec![
                ModelProfile { model_id: "batch4".into(), max_batch_size: 4 },
                ModelProfile { model_id: "solo".into(), max_batch_size: 1 },
            ],
            default_batch_size: 4,
        }
    }

    fn submit(store: &QueueStore, model: &str) -> QueueItem {
        let id = store
            .submit(NewItem {
                project_id: "p".into(),
                user_id: "u".into(),
                model_id: model.into(),
                image_ref: "img".into(),
            })
            .unwrap();
        store.item(id).unwrap()
    }

    #[test]
    fn seals_on_size_without_timer_wait() {
        let store = Arc::new(QueueStore::new(100));
        let (assembler, mut rx) = BatchAssembler::new(store.clone(), &test_config(), Duration::from_secs(60));

        for _ in 0..3 {
            let item = submit(&store, "batch4");
            assembler.offer(&item);
            assert!(rx.try_recv().is_err(), "must not seal below max size");
        }
        let item = submit(&store, "batch4");
        let batch_id = assembler.offer(&item).unwrap();
        assert_eq!(rx.try_recv().unwrap(), batch_id);
        assert_eq!(store.batch(batch_id).unwrap().item_ids.len(), 4);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn seals_on_flush_window_with_partial_fill() {
        let store = Arc::new(QueueStore::new(100));
        let (assembler, mut rx) = BatchAssembler::new(store.clone(), &test_config(), Duration::from_millis(20));

        let a = submit(&store, "batch4");
        let b = submit(&store, "batch4");
        assembler.offer(&a);
        let batch_id = assembler.offer(&b).unwrap();

        assert!(assembler.flush_due().is_empty(), "window not yet elapsed");
        std::thread::sleep(Duration::from_millis(30));
        let sealed = assembler.flush_due();
        assert_eq!(sealed, vec![batch_id]);
        assert_eq!(rx.try_recv().unwrap(), batch_id);
        assert_eq!(store.batch(batch_id).unwrap().item_ids.len(), 2);
    }

    #[test]
    fn single_item_models_seal_immediately() {
        let store = Arc::new(QueueStore::new(100));
        let (assembler, mut rx) = BatchAssembler::new(store.clone(), &test_config(), Duration::from_secs(60));

        let item = submit(&store, "solo");
        let batch_id = assembler.offer(&item).unwrap();
        assert_eq!(rx.try_recv().unwrap(), batch_id);
    }

    #[test]
    fn models_get_separate_batches() {
        let store = Arc::new(QueueStore::new(100));
        let (assembler, _rx) = BatchAssembler::new(store.clone(), &test_config(), Duration::from_secs(60));

        let a = submit(&store, "batch4");
        let b = submit(&store, "other-model");
        let batch_a = assembler.offer(&a).unwrap();
        let batch_b = assembler.offer(&b).unwrap();
        assert_ne!(batch_a, batch_b);
    }

    #[test]
    fn cancelled_item_is_not_batched() {
        let store = Arc::new(QueueStore::new(100));
        let (assembler, mut rx) = BatchAssembler::new(store.clone(), &test_config(), Duration::from_millis(1));

        let item = submit(&store, "batch4");
        store.transition(item.id, ItemStatus::Queued, ItemStatus::Cancelled, Default::default());
        // Offer races with cancellation: the stale snapshot still says queued
        assert_eq!(assembler.offer(&item), None);
        assert_eq!(assembler.buffered(), 0);

        std::thread::sleep(Duration::from_millis(5));
        assert!(assembler.flush_due().is_empty(), "no batch should form for a cancelled item");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn timer_starts_with_first_item() {
        let store = Arc::new(QueueStore::new(100));
        let (assembler, _rx) = BatchAssembler::new(store.clone(), &test_config(), Duration::from_millis(25));

        let a = submit(&store, "batch4");
        assembler.offer(&a);
        std::thread::sleep(Duration::from_millis(15));
        // Second item does not reset the window
        let b = submit(&store, "batch4");
        assembler.offer(&b);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(assembler.flush_due().len(), 1);
    }
}
