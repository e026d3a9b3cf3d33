//! Pulls sealed batches and drives them through inference.
//!
//! The run loop receives sealed batch ids from the assembler, ticks the
//! assembler's flush window, and spawns one dispatch task per batch. A
//! dispatch acquires a gate permit, moves eligible items into
//! `Processing`, invokes the backend once for the whole batch under the
//! hard call timeout, then settles every item independently. One item's
//! failure never blocks or fails its siblings. The permit is held until
//! the batch settles, never across an individual item's retry delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use segmentd_core::types::OwnerRef;
use segmentd_notify::bus::NotificationBus;
use segmentd_notify::events::Event;
use segmentd_queue::assembler::BatchAssembler;
use segmentd_queue::item::ItemStatus;
use segmentd_queue::store::{QueueStore, TransitionUpdate};

use crate::cancel::CancelFlags;
use crate::gate::ConcurrencyGate;
use crate::inference::{
    InferenceBackend, InferenceError, InferenceOutput, InferenceRequest, ResultStore,
    SegmentationResult,
};
use crate::metrics::EngineMetrics;
use crate::retry::RetryPolicy;

/// How often the run loop polls the assembler's flush window.
const FLUSH_TICK: Duration = Duration::from_millis(25);

/// Outcome of settling one item of a dispatched batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Completed,
    Failed,
    Cancelled,
    Requeued,
}

pub struct Scheduler {
    store: Arc<QueueStore>,
    assembler: Arc<BatchAssembler>,
    gate: Arc<ConcurrencyGate>,
    backend: Arc<dyn InferenceBackend>,
    results: Arc<dyn ResultStore>,
    bus: Arc<NotificationBus>,
    flags: Arc<CancelFlags>,
    metrics: Arc<EngineMetrics>,
    retry: RetryPolicy,
    infer_timeout: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<QueueStore>,
        assembler: Arc<BatchAssembler>,
        gate: Arc<ConcurrencyGate>,
        backend: Arc<dyn InferenceBackend>,
        results: Arc<dyn ResultStore>,
        bus: Arc<NotificationBus>,
        flags: Arc<CancelFlags>,
        metrics: Arc<EngineMetrics>,
        retry: RetryPolicy,
        infer_timeout: Duration,
    ) -> Self {
        Self {
            store,
            assembler,
            gate,
            backend,
            results,
            bus,
            flags,
            metrics,
            retry,
            infer_timeout,
        }
    }

    /// Event loop: dispatch sealed batches, tick the flush window, exit on
    /// shutdown. In-flight dispatch tasks settle through the store even
    /// after the loop exits.
    pub async fn run(
        self: Arc<Self>,
        mut sealed_rx: mpsc::UnboundedReceiver<Uuid>,
        shutdown: Arc<Notify>,
    ) {
        info!(
            gate_capacity = self.gate.capacity(),
            infer_timeout_ms = self.infer_timeout.as_millis() as u64,
            "scheduler started"
        );
        let mut tick = tokio::time::interval(FLUSH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_batch = sealed_rx.recv() => {
                    match maybe_batch {
                        Some(batch_id) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.dispatch_batch(batch_id).await;
                            });
                        }
                        None => {
                            warn!("assembler channel closed, scheduler exiting");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.assembler.flush_due();
                }
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Drive one sealed batch: permit → processing → infer → settle.
    async fn dispatch_batch(self: Arc<Self>, batch_id: Uuid) {
        let permit = self.gate.acquire().await;
        let Some(batch) = self.store.batch(batch_id) else {
            warn!(batch_id = %batch_id, "sealed batch disappeared");
            return;
        };

        // Per-item cancellation checkpoint before the GPU sees anything.
        let mut cancelled: u64 = 0;
        let mut requests = Vec::new();
        for item in self.store.items_in_batch(batch_id) {
            if self.flags.take(item.id) {
                if self
                    .store
                    .transition(item.id, item.status, ItemStatus::Cancelled, Default::default())
                {
                    EngineMetrics::incr(&self.metrics.items_cancelled);
                    cancelled += 1;
                }
                continue;
            }
            if item.status != ItemStatus::Assigned {
                continue;
            }
            if self
                .store
                .transition(item.id, ItemStatus::Assigned, ItemStatus::Processing, Default::default())
            {
                publish_item_event(&self.store, &self.bus, &self.metrics, item.id).await;
                requests.push(InferenceRequest {
                    item_id: item.id,
                    image_ref: item.image_ref.clone(),
                });
            }
        }

        if requests.is_empty() {
            debug!(batch_id = %batch_id, "no dispatchable items, settling empty batch");
            self.finish_batch(batch_id, &batch.model_id, 0, 0, cancelled).await;
            drop(permit);
            return;
        }

        EngineMetrics::incr(&self.metrics.batches_dispatched);
        EngineMetrics::incr(&self.metrics.inference_calls);
        debug!(batch_id = %batch_id, model_id = %batch.model_id, items = requests.len(), "batch dispatched");

        let started = Instant::now();
        let call = tokio::time::timeout(
            self.infer_timeout,
            self.backend.infer(&requests, &batch.model_id),
        )
        .await;
        EngineMetrics::add(&self.metrics.inference_time_us, started.elapsed().as_micros() as u64);

        // A whole-call failure is classified once for every in-flight item.
        let outputs: Vec<InferenceOutput> = match call {
            Ok(Ok(outputs)) => outputs,
            Ok(Err(error)) => {
                warn!(batch_id = %batch_id, error = %error, "inference call failed");
                requests
                    .iter()
                    .map(|r| InferenceOutput::err(r.item_id, error.clone()))
                    .collect()
            }
            Err(_) => {
                let timeout_ms = self.infer_timeout.as_millis() as u64;
                warn!(batch_id = %batch_id, timeout_ms, "inference call timed out");
                requests
                    .iter()
                    .map(|r| InferenceOutput::err(r.item_id, InferenceError::Timeout(timeout_ms)))
                    .collect()
            }
        };
        let by_item: HashMap<Uuid, &InferenceOutput> =
            outputs.iter().map(|o| (o.item_id, o)).collect();

        let mut completed: u64 = 0;
        let mut failed: u64 = 0;
        for request in &requests {
            let output = by_item.get(&request.item_id).copied();
            match self.settle_item(request, output, &batch.model_id).await {
                Settlement::Completed => completed += 1,
                Settlement::Failed => failed += 1,
                Settlement::Cancelled => cancelled += 1,
                Settlement::Requeued => {}
            }
        }

        self.finish_batch(batch_id, &batch.model_id, completed, failed, cancelled).await;
        drop(permit);
    }

    async fn finish_batch(
        &self,
        batch_id: Uuid,
        model_id: &str,
        completed: u64,
        failed: u64,
        cancelled: u64,
    ) {
        self.store.settle_batch(batch_id);
        EngineMetrics::incr(&self.metrics.batches_settled);
        let outcome = self
            .bus
            .publish(&Event::BatchSettled {
                batch_id,
                model_id: model_id.to_string(),
                completed,
                failed,
                cancelled,
            })
            .await;
        EngineMetrics::add(&self.metrics.notifications_sent, outcome.sent);
        EngineMetrics::add(&self.metrics.notifications_failed, outcome.failed);
        debug!(batch_id = %batch_id, completed, failed, cancelled, "batch settled");
    }

    /// Settle one item. The cancellation flag wins over whatever the
    /// backend produced: the raw result is discarded and the recorded
    /// status forced to `Cancelled`.
    async fn settle_item(
        &self,
        request: &InferenceRequest,
        output: Option<&InferenceOutput>,
        model_id: &str,
    ) -> Settlement {
        let id = request.item_id;

        if self.flags.take(id) {
            if self
                .store
                .transition(id, ItemStatus::Processing, ItemStatus::Cancelled, Default::default())
            {
                EngineMetrics::incr(&self.metrics.items_cancelled);
                debug!(item_id = %id, "result discarded, item cancelled");
                return Settlement::Cancelled;
            }
            return self.observed_settlement(id);
        }

        let Some(output) = output else {
            // The backend omitted the item from its result list. Retrying
            // an input the model silently ignored risks a loop; fail it.
            return self
                .fail_item(id, InferenceError::ModelRejected("no output for item".into()))
                .await;
        };

        if let Some(error) = &output.error {
            if error.is_retryable() {
                return self.requeue_or_fail(id, error.clone()).await;
            }
            return self.fail_item(id, error.clone()).await;
        }

        let Some(polygons) = &output.polygons else {
            return self
                .fail_item(id, InferenceError::ModelRejected("output carried no polygons".into()))
                .await;
        };

        let result_ref = format!("seg-{id}");
        let result = SegmentationResult {
            item_id: id,
            model_id: model_id.to_string(),
            polygons: polygons.clone(),
            produced_at: Utc::now(),
        };
        if let Err(error) = self.results.put(&result_ref, result).await {
            // Storage hiccups are transient; the polygons can be recomputed.
            warn!(item_id = %id, error = %error, "failed to persist result");
            return self
                .requeue_or_fail(id, InferenceError::ResourceExhausted(error.to_string()))
                .await;
        }

        if self.store.transition(
            id,
            ItemStatus::Processing,
            ItemStatus::Completed,
            TransitionUpdate { result_ref: Some(result_ref), ..Default::default() },
        ) {
            EngineMetrics::incr(&self.metrics.items_completed);
            publish_item_event(&self.store, &self.bus, &self.metrics, id).await;
            return Settlement::Completed;
        }
        self.observed_settlement(id)
    }

    /// Re-enter a transiently failed item into a fresh batch after the
    /// backoff delay, or fail it once attempts are exhausted.
    async fn requeue_or_fail(&self, id: Uuid, error: InferenceError) -> Settlement {
        let Some(item) = self.store.item(id) else {
            return Settlement::Failed;
        };
        let next_attempt = item.attempts + 1;
        if next_attempt >= self.retry.max_attempts {
            return self.fail_item(id, error).await;
        }

        if self.store.transition(
            id,
            ItemStatus::Processing,
            ItemStatus::Assigned,
            TransitionUpdate { clear_batch: true, bump_attempts: true, ..Default::default() },
        ) {
            EngineMetrics::incr(&self.metrics.retries_scheduled);
            let delay = self.retry.delay_for(next_attempt);
            warn!(
                item_id = %id,
                attempt = next_attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, item re-enters a fresh batch"
            );
            publish_item_event(&self.store, &self.bus, &self.metrics, id).await;
            self.spawn_requeue(id, delay);
            return Settlement::Requeued;
        }
        self.observed_settlement(id)
    }

    async fn fail_item(&self, id: Uuid, error: InferenceError) -> Settlement {
        if self.store.transition(
            id,
            ItemStatus::Processing,
            ItemStatus::Failed,
            TransitionUpdate { error: Some(error.to_string()), ..Default::default() },
        ) {
            EngineMetrics::incr(&self.metrics.items_failed);
            info!(item_id = %id, error = %error, "item failed");
            publish_item_event(&self.store, &self.bus, &self.metrics, id).await;
            return Settlement::Failed;
        }
        self.observed_settlement(id)
    }

    /// Map whatever status the item reached concurrently to a settlement.
    fn observed_settlement(&self, id: Uuid) -> Settlement {
        match self.store.item(id).map(|i| i.status) {
            Some(ItemStatus::Completed) => Settlement::Completed,
            Some(ItemStatus::Cancelled) => Settlement::Cancelled,
            Some(ItemStatus::Assigned) | Some(ItemStatus::Queued) | Some(ItemStatus::Processing) => {
                Settlement::Requeued
            }
            Some(ItemStatus::Failed) | None => Settlement::Failed,
        }
    }

    /// After the backoff delay, hand the item back to the assembler.
    /// The outcome is always recorded: cancellation flags are honored
    /// here, and a lost race leaves the item to whichever path won.
    fn spawn_requeue(&self, id: Uuid, delay: Duration) {
        let store = self.store.clone();
        let assembler = self.assembler.clone();
        let flags = self.flags.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if flags.take(id) {
                if store.transition(id, ItemStatus::Assigned, ItemStatus::Cancelled, Default::default())
                {
                    EngineMetrics::incr(&metrics.items_cancelled);
                    debug!(item_id = %id, "requeued item cancelled before re-entry");
                }
                return;
            }
            let Some(item) = store.item(id) else { return };
            if item.status != ItemStatus::Assigned || item.batch_id.is_some() {
                return;
            }
            if assembler.offer(&item).is_none() {
                debug!(item_id = %id, "requeue lost a race with cancellation");
            }
        });
    }
}

/// Publish `item:statusChanged` with fresh project aggregates.
pub(crate) async fn publish_item_event(
    store: &QueueStore,
    bus: &NotificationBus,
    metrics: &EngineMetrics,
    item_id: Uuid,
) {
    let Some(item) = store.item(item_id) else { return };
    let aggregates = store.aggregate(&OwnerRef::Project(item.project_id.clone()));
    let outcome = bus
        .publish(&Event::ItemStatusChanged {
            item_id: item.id,
            batch_id: item.batch_id,
            project_id: item.project_id,
            user_id: item.user_id,
            status: item.status,
            attempt: item.attempts,
            aggregates,
        })
        .await;
    EngineMetrics::add(&metrics.notifications_sent, outcome.sent);
    EngineMetrics::add(&metrics.notifications_failed, outcome.failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use segmentd_core::config::{InferenceConfig, ModelProfile};
    use segmentd_notify::transport::ChannelTransport;
    use segmentd_queue::item::{BatchStatus, NewItem};

    use crate::inference::{MemoryResultStore, Polygon};

    /// Scripted backend: per-image behaviors keyed by image_ref.
    struct MockBackend {
        calls: AtomicU64,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        /// Sleep injected into every call, simulating GPU latency.
        latency: Duration,
        /// image_ref prefixes that fail: "transient-*" retryably,
        /// "broken-*" permanently, "missing-*" omitted from output.
        fail_transient_times: AtomicU64,
    }

    impl MockBackend {
        fn new(latency: Duration) -> Self {
            Self {
                calls: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                latency,
                fail_transient_times: AtomicU64::new(u64::MAX),
            }
        }

        /// Make `transient-*` images fail only the first `n` calls.
        fn transient_until(self, n: u64) -> Self {
            self.fail_transient_times.store(n, Ordering::SeqCst);
            self
        }

        fn square() -> Vec<Polygon> {
            vec![Polygon { points: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] }]
        }
    }

    #[async_trait]
    impl InferenceBackend for MockBackend {
        async fn infer(
            &self,
            requests: &[InferenceRequest],
            _model_id: &str,
        ) -> Result<Vec<InferenceOutput>, InferenceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(requests
                .iter()
                .filter(|r| !r.image_ref.starts_with("missing-"))
                .map(|r| {
                    if r.image_ref.starts_with("broken-") {
                        InferenceOutput::err(
                            r.item_id,
                            InferenceError::MalformedInput(r.image_ref.clone()),
                        )
                    } else if r.image_ref.starts_with("transient-")
                        && call <= self.fail_transient_times.load(Ordering::SeqCst)
                    {
                        InferenceOutput::err(
                            r.item_id,
                            InferenceError::ResourceExhausted("gpu busy".into()),
                        )
                    } else {
                        InferenceOutput::ok(r.item_id, Self::square())
                    }
                })
                .collect())
        }
    }

    struct Harness {
        store: Arc<QueueStore>,
        assembler: Arc<BatchAssembler>,
        backend: Arc<MockBackend>,
        results: Arc<MemoryResultStore>,
        flags: Arc<CancelFlags>,
        metrics: Arc<EngineMetrics>,
        shutdown: Arc<Notify>,
    }

    fn harness(gate_capacity: usize, backend: MockBackend) -> Harness {
        let inference_config = InferenceConfig {
            call_timeout_ms: 30_000,
            model_profiles: vec![
                ModelProfile { model_id: "batch2".into(), max_batch_size: 2 },
                ModelProfile { model_id: "batch5".into(), max_batch_size: 5 },
                ModelProfile { model_id: "batch10".into(), max_batch_size: 10 },
                ModelProfile { model_id: "solo".into(), max_batch_size: 1 },
            ],
            default_batch_size: 4,
        };
        let store = Arc::new(QueueStore::new(1000));
        let (assembler, sealed_rx) =
            BatchAssembler::new(store.clone(), &inference_config, Duration::from_millis(50));
        let assembler = Arc::new(assembler);
        let gate = Arc::new(ConcurrencyGate::new(gate_capacity));
        let backend = Arc::new(backend);
        let results = Arc::new(MemoryResultStore::new());
        let transport = Arc::new(ChannelTransport::new());
        let bus = Arc::new(NotificationBus::new(store.clone(), transport));
        let flags = Arc::new(CancelFlags::new());
        let metrics = Arc::new(EngineMetrics::new());
        let shutdown = Arc::new(Notify::new());

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            assembler.clone(),
            gate,
            backend.clone(),
            results.clone(),
            bus,
            flags.clone(),
            metrics.clone(),
            RetryPolicy::default(),
            inference_config.call_timeout(),
        ));
        tokio::spawn(scheduler.run(sealed_rx, shutdown.clone()));

        Harness { store, assembler, backend, results, flags, metrics, shutdown }
    }

    fn submit_and_offer(h: &Harness, model: &str, image_ref: &str) -> Uuid {
        let id = h
            .store
            .submit(NewItem {
                project_id: "p1".into(),
                user_id: "u1".into(),
                model_id: model.into(),
                image_ref: image_ref.into(),
            })
            .unwrap();
        let item = h.store.item(id).unwrap();
        h.assembler.offer(&item);
        id
    }

    async fn wait_until_terminal(h: &Harness, ids: &[Uuid]) {
        for _ in 0..2000 {
            if ids.iter().all(|id| h.store.item(*id).unwrap().status.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("items never settled");
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_completes_with_results() {
        let h = harness(4, MockBackend::new(Duration::from_millis(10)));
        let a = submit_and_offer(&h, "batch2", "img-a");
        let b = submit_and_offer(&h, "batch2", "img-b");
        wait_until_terminal(&h, &[a, b]).await;

        for id in [a, b] {
            let item = h.store.item(id).unwrap();
            assert_eq!(item.status, ItemStatus::Completed);
            let result_ref = item.result_ref.unwrap();
            assert!(h.results.get(&result_ref).await.unwrap().is_some());
        }
        let batch_id = h.store.item(a).unwrap().batch_id.unwrap();
        assert_eq!(h.store.batch(batch_id).unwrap().status, BatchStatus::Settled);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 1);
        h.shutdown.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn one_permanent_failure_never_fails_siblings() {
        let h = harness(4, MockBackend::new(Duration::from_millis(10)));
        let mut ids = Vec::new();
        for i in 0..5 {
            let image = if i == 2 { "broken-img".to_string() } else { format!("img-{i}") };
            ids.push(submit_and_offer(&h, "batch5", &image));
        }
        wait_until_terminal(&h, &ids).await;

        let statuses: Vec<ItemStatus> =
            ids.iter().map(|id| h.store.item(*id).unwrap().status).collect();
        assert_eq!(statuses.iter().filter(|s| **s == ItemStatus::Completed).count(), 4);
        assert_eq!(statuses.iter().filter(|s| **s == ItemStatus::Failed).count(), 1);
        assert_eq!(statuses[2], ItemStatus::Failed);
        assert!(h.store.item(ids[2]).unwrap().error.unwrap().contains("malformed input"));
        h.shutdown.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_into_fresh_batch() {
        let h = harness(4, MockBackend::new(Duration::from_millis(10)).transient_until(1));
        let id = submit_and_offer(&h, "solo", "transient-img");
        wait_until_terminal(&h, &[id]).await;

        let item = h.store.item(id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.attempts, 1);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.metrics.retries_scheduled.load(Ordering::Relaxed), 1);
        h.shutdown.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_error() {
        // Always-transient: attempts 1..=3 all fail, then the item fails.
        let h = harness(4, MockBackend::new(Duration::from_millis(10)));
        let id = submit_and_offer(&h, "solo", "transient-img");
        wait_until_terminal(&h, &[id]).await;

        let item = h.store.item(id).unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 2);
        assert!(item.error.unwrap().contains("gpu busy"));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 3);
        h.shutdown.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn omitted_output_fails_only_that_item() {
        let h = harness(4, MockBackend::new(Duration::from_millis(10)));
        let a = submit_and_offer(&h, "batch2", "img-a");
        let b = submit_and_offer(&h, "batch2", "missing-img");
        wait_until_terminal(&h, &[a, b]).await;

        assert_eq!(h.store.item(a).unwrap().status, ItemStatus::Completed);
        let missing = h.store.item(b).unwrap();
        assert_eq!(missing.status, ItemStatus::Failed);
        assert!(missing.error.unwrap().contains("no output"));
        h.shutdown.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn gate_bounds_concurrent_dispatches() {
        // Capacity 4, batch size 10, 100 items: never more than 4 calls in
        // flight at once.
        let h = harness(4, MockBackend::new(Duration::from_millis(200)));
        let mut ids = Vec::new();
        for i in 0..100 {
            ids.push(submit_and_offer(&h, "batch10", &format!("img-{i}")));
        }
        wait_until_terminal(&h, &ids).await;

        assert!(
            h.backend.max_in_flight.load(Ordering::SeqCst) <= 4,
            "max in flight {} exceeded gate capacity",
            h.backend.max_in_flight.load(Ordering::SeqCst)
        );
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 10);
        h.shutdown.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_cancellation_discards_late_result() {
        // Simulated 5s inference, cancel after 1s: the raw result arrives
        // at 5s but the recorded status is cancelled.
        let h = harness(4, MockBackend::new(Duration::from_secs(5)));
        let id = submit_and_offer(&h, "solo", "img-slow");

        // Let the dispatch reach processing.
        for _ in 0..200 {
            if h.store.item(id).unwrap().status == ItemStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.store.item(id).unwrap().status, ItemStatus::Processing);

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.flags.set(id);

        wait_until_terminal(&h, &[id]).await;
        let item = h.store.item(id).unwrap();
        assert_eq!(item.status, ItemStatus::Cancelled);
        assert!(item.result_ref.is_none());
        assert_eq!(h.results.len().await, 0, "discarded result must not be stored");
        assert!(h.flags.is_empty());
        h.shutdown.notify_waiters();
    }

    #[tokio::test(start_paused = true)]
    async fn whole_call_timeout_is_transient() {
        // Backend sleeps past the call timeout; with always-transient
        // classification the item retries and eventually fails.
        let inference_config = InferenceConfig {
            call_timeout_ms: 100,
            model_profiles: vec![ModelProfile { model_id: "solo".into(), max_batch_size: 1 }],
            default_batch_size: 4,
        };
        let store = Arc::new(QueueStore::new(1000));
        let (assembler, sealed_rx) =
            BatchAssembler::new(store.clone(), &inference_config, Duration::from_millis(50));
        let assembler = Arc::new(assembler);
        let backend = Arc::new(MockBackend::new(Duration::from_secs(10)));
        let results = Arc::new(MemoryResultStore::new());
        let transport = Arc::new(ChannelTransport::new());
        let bus = Arc::new(NotificationBus::new(store.clone(), transport));
        let flags = Arc::new(CancelFlags::new());
        let metrics = Arc::new(EngineMetrics::new());
        let shutdown = Arc::new(Notify::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            assembler.clone(),
            Arc::new(ConcurrencyGate::new(2)),
            backend.clone(),
            results,
            bus,
            flags,
            metrics.clone(),
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
                backoff_factor: 2.0,
            },
            inference_config.call_timeout(),
        ));
        tokio::spawn(scheduler.run(sealed_rx, shutdown.clone()));

        let id = store
            .submit(NewItem {
                project_id: "p1".into(),
                user_id: "u1".into(),
                model_id: "solo".into(),
                image_ref: "img".into(),
            })
            .unwrap();
        let item = store.item(id).unwrap();
        assembler.offer(&item);

        for _ in 0..2000 {
            if store.item(id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let item = store.item(id).unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.error.unwrap().contains("timed out"));
        assert_eq!(item.attempts, 1);
        shutdown.notify_waiters();
    }
}
