//! Queue item and batch data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use segmentd_core::types::{ModelId, ProjectId, UserId};

// ── Item status ──────────────────────────────────────────────────────

/// Lifecycle status of a queue item.
///
/// Transitions follow `Queued → Assigned → Processing → {Completed,
/// Failed, Cancelled}`. The one extra edge, `Processing → Assigned`, is
/// the retry path: a transiently failed item re-enters a fresh batch.
/// An item never returns to `Queued` after leaving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Total order used by subscribers to resolve out-of-order event
    /// arrival: a higher rank always wins over a lower one.
    pub fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Assigned => 1,
            Self::Processing => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Whether `next` is a legal direct successor of `self`.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, Processing)
                | (Assigned, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Processing, Assigned)
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ── Queue item ───────────────────────────────────────────────────────

/// One submitted unit of work: an image paired with a target model,
/// tracked through its whole lifecycle. Never deleted by this engine;
/// retention belongs to the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub model_id: ModelId,
    /// Reference into the image store collaborator.
    pub image_ref: String,
    /// Monotonic submission sequence, a priority hint for batch assembly.
    pub seq: u64,
    pub status: ItemStatus,
    pub batch_id: Option<Uuid>,
    /// Completed processing attempts (0 until the first retry requeue).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Reference into the result store, set on completion.
    pub result_ref: Option<String>,
    /// Error detail, set on failure.
    pub error: Option<String>,
}

/// Fields supplied at submission; everything else is engine-owned.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub model_id: ModelId,
    pub image_ref: String,
}

// ── Batch ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Forming,
    Dispatched,
    Settled,
}

/// A bounded group of items dispatched together to the inference
/// collaborator. Immutable once `Dispatched`; member items settle
/// independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub model_id: ModelId,
    pub item_ids: Vec<Uuid>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
}

// ── Cancellation audit ───────────────────────────────────────────────

/// Scope of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelScope {
    Item,
    Batch,
    Project,
    User,
    All,
}

/// Audit record of one cancellation operation (single or bulk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub scope: CancelScope,
    /// Target id; `None` for the all-jobs emergency stop.
    pub target: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub affected: u64,
}

// ── Aggregates ───────────────────────────────────────────────────────

/// Per-owner status counts. `Assigned` items count toward `queued`;
/// they have a batch but have not touched the GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl AggregateCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }

    pub fn bump(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Queued | ItemStatus::Assigned => self.queued += 1,
            ItemStatus::Processing => self.processing += 1,
            ItemStatus::Completed => self.completed += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Cancelled => self.cancelled += 1,
        }
    }
}
