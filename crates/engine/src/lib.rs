pub mod cancel;
pub mod gate;
pub mod inference;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod service;

pub use cancel::{CancelFlags, CancellationCoordinator};
pub use gate::{ConcurrencyGate, GatePermit};
pub use inference::{
    InferenceBackend, InferenceError, InferenceOutput, InferenceRequest, MemoryResultStore,
    Polygon, ResultStore, SegmentationResult, StoreError,
};
pub use metrics::EngineMetrics;
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::Scheduler;
pub use service::{SegmentationEngine, SubmitReceipt, SubmitRequest};
