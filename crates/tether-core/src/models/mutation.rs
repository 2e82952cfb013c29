//! Mutation log entry model

use serde::{Deserialize, Serialize};

/// What a pending entry asks the push engine to do.
///
/// `known_modified_at` is the remote last-modified timestamp the local copy
/// was based on when the change was made; `None` means the entity has never
/// been seen remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum PendingMarker {
    /// Create or update the remote copy
    Save { known_modified_at: Option<String> },
    /// Tombstone: delete the remote copy
    Delete { known_modified_at: Option<String> },
}

impl PendingMarker {
    /// True for tombstones
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    /// Remote timestamp the change was based on
    #[must_use]
    pub fn known_modified_at(&self) -> Option<&str> {
        match self {
            Self::Save { known_modified_at } | Self::Delete { known_modified_at } => {
                known_modified_at.as_deref()
            }
        }
    }

    pub(crate) const fn operation(&self) -> &'static str {
        match self {
            Self::Save { .. } => "save",
            Self::Delete { .. } => "delete",
        }
    }

    pub(crate) fn from_parts(operation: &str, known_modified_at: Option<String>) -> Self {
        if operation == "delete" {
            Self::Delete { known_modified_at }
        } else {
            Self::Save { known_modified_at }
        }
    }
}

/// One pending (not yet confirmed remote) change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Collection of the entity
    pub collection: String,
    /// Entity identifier
    pub entity_id: String,
    /// Requested remote operation
    pub marker: PendingMarker,
    /// When the change was recorded (unix microseconds)
    pub recorded_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_parts_round_trip() {
        let marker = PendingMarker::Delete {
            known_modified_at: Some("t1".into()),
        };
        let rebuilt =
            PendingMarker::from_parts(marker.operation(), marker.known_modified_at().map(str::to_string));
        assert_eq!(rebuilt, marker);
        assert!(rebuilt.is_delete());
    }

    #[test]
    fn test_new_entity_marker_has_no_timestamp() {
        let marker = PendingMarker::Save {
            known_modified_at: None,
        };
        assert!(!marker.is_delete());
        assert_eq!(marker.known_modified_at(), None);
    }
}
