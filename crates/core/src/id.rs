//! Identifiers for constructed instances.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for an [`Instance`](crate::Instance).
///
/// ULIDs sort by creation time, so ids double as a construction order in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(Ulid);

impl InstanceId {
    /// Generate a new InstanceId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
