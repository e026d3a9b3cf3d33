//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The owning user is already at their pending-item limit. The only
    /// way a submission can fail; user-correctable.
    #[error("pending capacity exceeded for user {user_id}: {pending} items")]
    CapacityExceeded { user_id: String, pending: usize },

    #[error("unknown batch: {0}")]
    UnknownBatch(uuid::Uuid),

    #[error("batch {0} is no longer accepting items")]
    BatchSealed(uuid::Uuid),
}
