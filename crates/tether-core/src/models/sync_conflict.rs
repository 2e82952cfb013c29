//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::Entity;

/// A local pending change whose remote copy moved on after the change was
/// recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier (0 until recorded)
    pub id: i64,
    /// Collection of the entity
    pub collection: String,
    /// Entity involved in the conflict
    pub entity_id: String,
    /// Remote timestamp known when the local change was made
    pub known_modified_at: Option<String>,
    /// Remote timestamp observed during push
    pub remote_modified_at: Option<String>,
    /// Local copy awaiting push
    pub local: Entity,
    /// Authoritative remote copy
    pub remote: Entity,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    /// How the conflict was handled
    pub resolution: ConflictResolution,
}

/// Outcome recorded for a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Left pending for the caller to resolve
    Surfaced,
    /// Local copy pushed over the remote one
    LocalWins,
    /// Remote copy accepted, local change dropped
    RemoteWins,
    /// Replacement entity supplied by the application
    Merged,
}

impl ConflictResolution {
    /// Stable name used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Surfaced => "surfaced",
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::Merged => "merged",
        }
    }

    /// Parse a stored name; unknown values read as surfaced
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "local_wins" => Self::LocalWins,
            "remote_wins" => Self::RemoteWins,
            "merged" => Self::Merged,
            _ => Self::Surfaced,
        }
    }
}
