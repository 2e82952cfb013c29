//! Entity model
//!
//! Entities are schema-less JSON objects. The only required attribute is the
//! `_id`; the `_kmd` block carries system metadata maintained by the remote
//! service and `_acl` carries access control that the local store preserves
//! verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Entity identifier attribute.
pub const ID_FIELD: &str = "_id";
/// System metadata block.
pub const METADATA_FIELD: &str = "_kmd";
/// Access control block.
pub const ACL_FIELD: &str = "_acl";
/// Last-modified timestamp inside the metadata block.
pub const LAST_MODIFIED_FIELD: &str = "lmt";
/// Creation timestamp inside the metadata block.
pub const CREATED_FIELD: &str = "ect";
/// Session token carried by entities of the user collection.
pub const AUTH_TOKEN_FIELD: &str = "authtoken";
/// Marks an id assigned locally that the remote has never seen.
pub const LOCAL_FIELD: &str = "local";

/// Generate a new entity id (UUID v7, time-sortable)
#[must_use]
pub fn generate_entity_id() -> String {
    Uuid::now_v7().to_string()
}

/// A schema-less record belonging to one collection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    /// Create an empty entity
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build an entity from a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidInput(format!(
                "entity must be a JSON object, got {other}"
            ))),
        }
    }

    /// Consume the entity into a JSON value
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Borrow the underlying attribute map
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Builder-style attribute setter
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set a top-level attribute
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up an attribute by dotted path (`address.city`)
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.0, path)
    }

    /// Entity identifier, if one has been assigned
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Assign the entity identifier
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    /// Builder-style id setter
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.set_id(id);
        self
    }

    /// System metadata block
    #[must_use]
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.0.get(METADATA_FIELD).and_then(Value::as_object)
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let slot = self
            .0
            .entry(METADATA_FIELD.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(map) => map,
            _ => unreachable!("metadata slot was just normalized to an object"),
        }
    }

    /// Last-modified timestamp assigned by the remote
    #[must_use]
    pub fn last_modified_at(&self) -> Option<&str> {
        self.metadata()
            .and_then(|kmd| kmd.get(LAST_MODIFIED_FIELD))
            .and_then(Value::as_str)
    }

    /// Set the last-modified timestamp
    pub fn set_last_modified_at(&mut self, timestamp: impl Into<String>) {
        self.metadata_mut().insert(
            LAST_MODIFIED_FIELD.to_string(),
            Value::String(timestamp.into()),
        );
    }

    /// Builder-style last-modified setter
    #[must_use]
    pub fn with_last_modified_at(mut self, timestamp: impl Into<String>) -> Self {
        self.set_last_modified_at(timestamp);
        self
    }

    /// Creation timestamp assigned by the remote
    #[must_use]
    pub fn created_at(&self) -> Option<&str> {
        self.metadata()
            .and_then(|kmd| kmd.get(CREATED_FIELD))
            .and_then(Value::as_str)
    }

    /// Session token carried by user entities
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.metadata()
            .and_then(|kmd| kmd.get(AUTH_TOKEN_FIELD))
            .and_then(Value::as_str)
    }

    /// Access control block
    #[must_use]
    pub fn acl(&self) -> Option<&Value> {
        self.0.get(ACL_FIELD)
    }

    /// True when the id was assigned locally and never created remotely
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.metadata()
            .and_then(|kmd| kmd.get(LOCAL_FIELD))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) fn mark_local(&mut self) {
        self.metadata_mut()
            .insert(LOCAL_FIELD.to_string(), Value::Bool(true));
    }

    /// Copy of the entity as sent on a remote create: no id, no local flag.
    #[must_use]
    pub(crate) fn for_remote_create(&self) -> Self {
        let mut copy = self.clone();
        copy.0.remove(ID_FIELD);
        if let Some(Value::Object(kmd)) = copy.0.get_mut(METADATA_FIELD) {
            kmd.remove(LOCAL_FIELD);
            if kmd.is_empty() {
                copy.0.remove(METADATA_FIELD);
            }
        }
        copy
    }

    /// Keep the stored `_acl`/`_kmd` blocks when the caller did not supply them.
    pub(crate) fn inherit_system_fields(&mut self, existing: &Self) {
        for field in [ACL_FIELD, METADATA_FIELD] {
            if !self.0.contains_key(field) {
                if let Some(value) = existing.0.get(field) {
                    self.0.insert(field.to_string(), value.clone());
                }
            }
        }
    }
}

impl TryFrom<Value> for Entity {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        entity.into_value()
    }
}

/// Resolve a dotted attribute path inside a JSON object.
pub fn lookup_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_unique() {
        assert_ne!(generate_entity_id(), generate_entity_id());
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Entity::from_value(json!([1, 2])).is_err());
        assert!(Entity::from_value(json!({"_id": "a"})).is_ok());
    }

    #[test]
    fn test_metadata_accessors() {
        let entity = Entity::from_value(json!({
            "_id": "u1",
            "_kmd": {"lmt": "2024-01-02T00:00:00.000Z", "ect": "2024-01-01T00:00:00.000Z", "authtoken": "tok"}
        }))
        .unwrap();
        assert_eq!(entity.id(), Some("u1"));
        assert_eq!(entity.last_modified_at(), Some("2024-01-02T00:00:00.000Z"));
        assert_eq!(entity.created_at(), Some("2024-01-01T00:00:00.000Z"));
        assert_eq!(entity.auth_token(), Some("tok"));
        assert!(!entity.is_local());
    }

    #[test]
    fn test_empty_id_is_absent() {
        let entity = Entity::new().with(ID_FIELD, "");
        assert_eq!(entity.id(), None);
    }

    #[test]
    fn test_remote_create_copy_strips_local_fields() {
        let mut entity = Entity::new().with_id("tmp").with("title", "x");
        entity.mark_local();
        assert!(entity.is_local());

        let outgoing = entity.for_remote_create();
        assert_eq!(outgoing.id(), None);
        assert!(outgoing.metadata().is_none());
        assert_eq!(outgoing.get("title"), Some(&json!("x")));
    }

    #[test]
    fn test_inherit_system_fields_only_fills_missing() {
        let existing = Entity::from_value(json!({
            "_id": "a",
            "_acl": {"creator": "me"},
            "_kmd": {"lmt": "t1"}
        }))
        .unwrap();

        let mut incoming = Entity::new().with_id("a").with("_acl", json!({"creator": "you"}));
        incoming.inherit_system_fields(&existing);

        assert_eq!(incoming.acl(), Some(&json!({"creator": "you"})));
        assert_eq!(incoming.last_modified_at(), Some("t1"));
    }

    #[test]
    fn test_lookup_nested_path() {
        let entity = Entity::from_value(json!({"address": {"city": "Oslo"}})).unwrap();
        assert_eq!(entity.get("address.city"), Some(&json!("Oslo")));
        assert_eq!(entity.get("address.zip"), None);
    }
}
