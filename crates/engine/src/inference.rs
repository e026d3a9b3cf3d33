//! Inference and result-storage collaborator seams.
//!
//! The ML side is a black box behind [`InferenceBackend`]: one batched
//! call per dispatched batch, partial success per item, hard timeout
//! enforced by the scheduler. Results land in a [`ResultStore`] (ACID per
//! item, not across items).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use segmentd_core::types::ModelId;

// ── Errors ───────────────────────────────────────────────────────────

/// Failure modes of an inference call, per item or whole-call.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// The call exceeded its hard timeout.
    #[error("inference timed out after {0}ms")]
    Timeout(u64),

    /// GPU memory or execution resources were exhausted.
    #[error("gpu resources exhausted: {0}")]
    ResourceExhausted(String),

    /// The input image cannot be processed by any attempt.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The model rejected the input (wrong dimensions, unsupported
    /// format, missing weights).
    #[error("model rejected input: {0}")]
    ModelRejected(String),
}

impl InferenceError {
    /// Transient failures are retried by policy; permanent ones surface
    /// immediately as `failed`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ResourceExhausted(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result storage backend error: {0}")]
    Backend(String),
}

// ── Payloads ─────────────────────────────────────────────────────────

/// One closed polygon in image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<(f32, f32)>,
}

/// Segmentation output for one item, stored under its result reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationResult {
    pub item_id: Uuid,
    pub model_id: ModelId,
    pub polygons: Vec<Polygon>,
    pub produced_at: DateTime<Utc>,
}

/// One item handed to the backend.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub item_id: Uuid,
    pub image_ref: String,
}

/// Per-item outcome of a batched call: polygons or an error, never both.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub item_id: Uuid,
    pub polygons: Option<Vec<Polygon>>,
    pub error: Option<InferenceError>,
}

impl InferenceOutput {
    pub fn ok(item_id: Uuid, polygons: Vec<Polygon>) -> Self {
        Self { item_id, polygons: Some(polygons), error: None }
    }

    pub fn err(item_id: Uuid, error: InferenceError) -> Self {
        Self { item_id, polygons: None, error: Some(error) }
    }
}

// ── Collaborator traits ──────────────────────────────────────────────

/// Batched GPU inference. Must support partial success: a per-item error
/// in the output list fails that item alone, while an `Err` return fails
/// the whole call (and is classified once for every item).
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(
        &self,
        requests: &[InferenceRequest],
        model_id: &str,
    ) -> Result<Vec<InferenceOutput>, InferenceError>;
}

/// CRUD store for segmentation payloads, keyed by result reference.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SegmentationResult>, StoreError>;
    async fn put(&self, id: &str, result: SegmentationResult) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// In-memory result store for embedding and tests.
pub struct MemoryResultStore {
    entries: tokio::sync::RwLock<HashMap<String, SegmentationResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for MemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn get(&self, id: &str) -> Result<Option<SegmentationResult>, StoreError> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, result: SegmentationResult) -> Result<(), StoreError> {
        self.entries.write().await.insert(id.to_string(), result);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}
