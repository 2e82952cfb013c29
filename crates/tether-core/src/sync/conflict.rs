//! Conflict detection and pluggable resolution.

use crate::models::{ConflictResolution, Entity};

/// What the push engine may do with a pending save
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictCheck {
    /// Remote has no such id: create it
    Create,
    /// Remote still at the timestamp the change was based on: overwrite it
    Overwrite,
    /// Remote moved on since the change was recorded
    Conflict(Entity),
}

/// Compare the marker recorded with a pending change against the remote copy.
#[must_use]
pub fn detect(known_modified_at: Option<&str>, remote: Option<Entity>) -> ConflictCheck {
    match remote {
        None => ConflictCheck::Create,
        Some(remote) if remote.last_modified_at() == known_modified_at => ConflictCheck::Overwrite,
        Some(remote) => ConflictCheck::Conflict(remote),
    }
}

/// Both sides of a detected conflict
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    pub collection: &'a str,
    pub entity_id: &'a str,
    /// Remote timestamp the local change was based on
    pub known_modified_at: Option<&'a str>,
    pub local: &'a Entity,
    pub remote: &'a Entity,
}

/// Decision for one conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Leave the change pending and report the conflict
    Keep,
    /// Push this entity over the remote copy
    Push(Entity),
    /// Drop the local change and take the remote copy
    AcceptRemote,
}

impl Resolution {
    pub(crate) fn journal_as(&self, local: &Entity) -> ConflictResolution {
        match self {
            Self::Keep => ConflictResolution::Surfaced,
            Self::Push(entity) if entity == local => ConflictResolution::LocalWins,
            Self::Push(_) => ConflictResolution::Merged,
            Self::AcceptRemote => ConflictResolution::RemoteWins,
        }
    }
}

/// Decides how conflicts are handled
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Resolution;
}

/// Report every conflict and keep the change pending
#[derive(Debug, Clone, Copy, Default)]
pub struct SurfaceConflicts;

impl ConflictPolicy for SurfaceConflicts {
    fn resolve(&self, _conflict: &ConflictContext<'_>) -> Resolution {
        Resolution::Keep
    }
}

/// Local copy always wins
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocal;

impl ConflictPolicy for PreferLocal {
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Resolution {
        Resolution::Push(conflict.local.clone())
    }
}

/// Remote copy always wins
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferRemote;

impl ConflictPolicy for PreferRemote {
    fn resolve(&self, _conflict: &ConflictContext<'_>) -> Resolution {
        Resolution::AcceptRemote
    }
}

/// Application-supplied resolution function
pub struct ConflictFn<F>(pub F);

impl<F> ConflictPolicy for ConflictFn<F>
where
    F: Fn(&ConflictContext<'_>) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &ConflictContext<'_>) -> Resolution {
        (self.0)(conflict)
    }
}
