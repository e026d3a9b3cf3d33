//! Shared identifier types.
//!
//! Projects, users and models are identified by opaque strings owned by the
//! surrounding application; items and batches get generated UUIDs.

use serde::{Deserialize, Serialize};

/// Identifier of the project an item belongs to.
pub type ProjectId = String;

/// Identifier of the submitting user.
pub type UserId = String;

/// Identifier of the target segmentation model (e.g. "hrnet").
pub type ModelId = String;

/// A reference to either owning scope of queued work.
///
/// Aggregate queries and event subscriptions are always scoped to one of
/// these two owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRef {
    Project(ProjectId),
    User(UserId),
}

impl OwnerRef {
    pub fn project(id: impl Into<String>) -> Self {
        Self::Project(id.into())
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project(id) => write!(f, "project:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}
