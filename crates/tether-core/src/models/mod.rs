//! Data models for Tether

mod entity;
mod mutation;
mod sync_conflict;

pub use entity::{
    generate_entity_id, lookup_path, Entity, ACL_FIELD, AUTH_TOKEN_FIELD, CREATED_FIELD,
    ID_FIELD, LAST_MODIFIED_FIELD, LOCAL_FIELD, METADATA_FIELD,
};
pub use mutation::{PendingMarker, PendingMutation};
pub use sync_conflict::{ConflictResolution, SyncConflict};
