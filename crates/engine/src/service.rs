//! Wires the engine together and exposes it to the surrounding
//! application: submit, cancel, aggregate query, event subscription with
//! reconcile, plus lifecycle (start/shutdown/recover).

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use segmentd_core::config::EngineConfig;
use segmentd_core::types::OwnerRef;
use segmentd_notify::bus::{AggregateState, EventFilter, NotificationBus};
use segmentd_notify::error::NotifyError;
use segmentd_notify::transport::Transport;
use segmentd_queue::assembler::BatchAssembler;
use segmentd_queue::item::{AggregateCounts, Batch, ItemStatus, NewItem, QueueItem};
use segmentd_queue::store::QueueStore;

use crate::cancel::{CancelFlags, CancellationCoordinator};
use crate::gate::ConcurrencyGate;
use crate::inference::{InferenceBackend, ResultStore};
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;
use crate::scheduler::{publish_item_event, Scheduler};

/// One submission request: a set of images for one model, owned by one
/// project/user pair.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub project_id: String,
    pub user_id: String,
    pub model_id: String,
    pub image_refs: Vec<String>,
}

/// Per-image outcome of a submission. Capacity rejections never abort
/// the rest of the request.
#[derive(Debug, Clone, Default)]
pub struct SubmitReceipt {
    pub queued: Vec<Uuid>,
    pub rejected: Vec<String>,
}

/// The segmentation job engine facade.
pub struct SegmentationEngine {
    store: Arc<QueueStore>,
    assembler: Arc<BatchAssembler>,
    gate: Arc<ConcurrencyGate>,
    bus: Arc<NotificationBus>,
    flags: Arc<CancelFlags>,
    metrics: Arc<EngineMetrics>,
    coordinator: CancellationCoordinator,
    scheduler: Arc<Scheduler>,
    sealed_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
    shutdown: Arc<Notify>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentationEngine {
    pub fn new(
        config: &EngineConfig,
        backend: Arc<dyn InferenceBackend>,
        results: Arc<dyn ResultStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let store = Arc::new(QueueStore::new(config.queue.max_pending_per_user));
        Self::with_store(config, store, backend, results, transport)
    }

    /// Rebuild on top of persisted state. Call [`Self::recover`] before
    /// [`Self::start`] to re-enter interrupted work.
    pub fn from_snapshot(
        config: &EngineConfig,
        items: Vec<QueueItem>,
        batches: Vec<Batch>,
        backend: Arc<dyn InferenceBackend>,
        results: Arc<dyn ResultStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let store = Arc::new(QueueStore::from_snapshot(
            items,
            batches,
            config.queue.max_pending_per_user,
        ));
        Self::with_store(config, store, backend, results, transport)
    }

    fn with_store(
        config: &EngineConfig,
        store: Arc<QueueStore>,
        backend: Arc<dyn InferenceBackend>,
        results: Arc<dyn ResultStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (assembler, sealed_rx) =
            BatchAssembler::new(store.clone(), &config.inference, config.queue.flush_window());
        let assembler = Arc::new(assembler);
        let gate = Arc::new(ConcurrencyGate::new(config.gate.capacity));
        let bus = Arc::new(NotificationBus::new(store.clone(), transport));
        let flags = Arc::new(CancelFlags::new());
        let metrics = Arc::new(EngineMetrics::new());
        let coordinator = CancellationCoordinator::new(
            store.clone(),
            flags.clone(),
            bus.clone(),
            metrics.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            assembler.clone(),
            gate.clone(),
            backend,
            results,
            bus.clone(),
            flags.clone(),
            metrics.clone(),
            RetryPolicy::from_config(&config.retry),
            config.inference.call_timeout(),
        ));

        Self {
            store,
            assembler,
            gate,
            bus,
            flags,
            metrics,
            coordinator,
            scheduler,
            sealed_rx: Mutex::new(Some(sealed_rx)),
            shutdown: Arc::new(Notify::new()),
            runner: Mutex::new(None),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the scheduler loop. Calling twice is a logged no-op.
    pub fn start(&self) {
        let Some(sealed_rx) = self.sealed_rx.lock().unwrap().take() else {
            warn!("engine already started");
            return;
        };
        let handle = tokio::spawn(self.scheduler.clone().run(sealed_rx, self.shutdown.clone()));
        *self.runner.lock().unwrap() = Some(handle);
        info!("engine started");
    }

    /// Stop the scheduler loop. In-flight dispatches settle through the
    /// store; nothing is lost.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let handle = self.runner.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task join failed");
            }
        }
        info!("engine stopped");
    }

    /// Re-enter work interrupted by a restart. Items left `Processing`
    /// (their worker is gone) or stranded `Assigned` return to fresh
    /// batches; orphaned batches are force-settled. Gate permits are
    /// recomputed implicitly; nothing depends on persisted permit state.
    pub fn recover(&self) {
        // Settle orphaned batches first, before re-entry opens fresh ones.
        let mut settled = 0usize;
        for batch in self.store.batches() {
            match batch.status {
                segmentd_queue::item::BatchStatus::Forming => {
                    self.store.seal_batch(batch.id);
                    self.store.settle_batch(batch.id);
                    settled += 1;
                }
                segmentd_queue::item::BatchStatus::Dispatched => {
                    self.store.settle_batch(batch.id);
                    settled += 1;
                }
                segmentd_queue::item::BatchStatus::Settled => {}
            }
        }

        let mut reentered = 0usize;
        for item in self.store.active_items() {
            match item.status {
                ItemStatus::Processing => {
                    if !self.store.transition(
                        item.id,
                        ItemStatus::Processing,
                        ItemStatus::Assigned,
                        segmentd_queue::store::TransitionUpdate {
                            clear_batch: true,
                            ..Default::default()
                        },
                    ) {
                        continue;
                    }
                }
                ItemStatus::Assigned if item.batch_id.is_some() => {
                    self.store.detach_batch(item.id);
                }
                ItemStatus::Queued | ItemStatus::Assigned => {}
                _ => continue,
            }
            if let Some(fresh) = self.store.item(item.id) {
                if self.assembler.offer(&fresh).is_some() {
                    reentered += 1;
                }
            }
        }
        info!(reentered, orphaned_batches = settled, "recovery pass complete");
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit a set of images. Each image is checked against the owner's
    /// pending capacity; accepted items are queued and offered for
    /// batching, rejected refs are returned without failing the call.
    pub async fn submit(&self, request: SubmitRequest) -> SubmitReceipt {
        let mut receipt = SubmitReceipt::default();
        for image_ref in request.image_refs {
            let new = NewItem {
                project_id: request.project_id.clone(),
                user_id: request.user_id.clone(),
                model_id: request.model_id.clone(),
                image_ref: image_ref.clone(),
            };
            match self.store.submit(new) {
                Ok(id) => {
                    EngineMetrics::incr(&self.metrics.items_submitted);
                    if let Some(item) = self.store.item(id) {
                        self.assembler.offer(&item);
                    }
                    publish_item_event(&self.store, &self.bus, &self.metrics, id).await;
                    receipt.queued.push(id);
                }
                Err(e) => {
                    EngineMetrics::incr(&self.metrics.items_rejected);
                    warn!(user_id = %request.user_id, image_ref = %image_ref, error = %e, "submission rejected");
                    receipt.rejected.push(image_ref);
                }
            }
        }
        info!(
            project_id = %request.project_id,
            user_id = %request.user_id,
            model_id = %request.model_id,
            queued = receipt.queued.len(),
            rejected = receipt.rejected.len(),
            "submission processed"
        );
        receipt
    }

    // ── Cancellation ─────────────────────────────────────────────────

    pub async fn cancel_item(&self, id: Uuid) -> u64 {
        self.coordinator.cancel_item(id).await
    }

    pub async fn cancel_batch(&self, batch_id: Uuid) -> u64 {
        self.coordinator.cancel_batch(batch_id).await
    }

    pub async fn cancel_project(&self, project_id: &str) -> u64 {
        self.coordinator.cancel_for_project(project_id).await
    }

    pub async fn cancel_user(&self, user_id: &str) -> u64 {
        self.coordinator.cancel_for_user(user_id).await
    }

    /// Emergency stop.
    pub async fn cancel_all(&self) -> u64 {
        self.coordinator.cancel_all().await
    }

    // ── Queries & events ─────────────────────────────────────────────

    pub fn aggregate(&self, owner: &OwnerRef) -> AggregateCounts {
        self.store.aggregate(owner)
    }

    /// Non-terminal items, oldest first.
    pub fn active_items(&self) -> Vec<QueueItem> {
        self.store.active_items()
    }

    pub fn subscribe(&self, subscriber_id: &str, filter: EventFilter) {
        self.bus.subscribe(subscriber_id, filter);
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.bus.unsubscribe(subscriber_id)
    }

    /// Authoritative aggregate view; the backstop for lost push events.
    pub fn reconcile(&self, subscriber_id: &str) -> Result<AggregateState, NotifyError> {
        self.bus.reconcile(subscriber_id)
    }

    pub fn metrics_snapshot(&self) -> serde_json::Value {
        self.metrics.snapshot()
    }

    /// Permits currently leased to in-flight dispatches.
    pub fn gate_in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Authoritative store handle for collaborators (persistence sync,
    /// monitoring).
    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    /// Pending cooperative cancellation flags (monitoring).
    pub fn pending_cancel_flags(&self) -> usize {
        self.flags.len()
    }
}
