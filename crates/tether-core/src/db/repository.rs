//! Entity table access
//!
//! Functions take a `&Connection` so they run equally inside a
//! [`libsql::Transaction`] (which derefs to its connection).

use std::collections::{BTreeMap, BTreeSet};

use libsql::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::Entity;

fn parse_entity(row: &Row) -> Result<Entity> {
    let body: String = row.get(0)?;
    Entity::from_value(serde_json::from_str(&body)?)
}

/// Load one entity
pub async fn load_entity(conn: &Connection, collection: &str, id: &str) -> Result<Option<Entity>> {
    let mut rows = conn
        .query(
            "SELECT body FROM entities WHERE collection = ? AND id = ?",
            params![collection, id],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(parse_entity(&row)?)),
        None => Ok(None),
    }
}

/// Load every entity of a collection, ordered by id
pub async fn load_collection(conn: &Connection, collection: &str) -> Result<Vec<Entity>> {
    let mut rows = conn
        .query(
            "SELECT body FROM entities WHERE collection = ? ORDER BY id",
            [collection],
        )
        .await?;

    let mut entities = Vec::new();
    while let Some(row) = rows.next().await? {
        entities.push(parse_entity(&row)?);
    }
    Ok(entities)
}

/// Load the subset of `ids` present locally
pub async fn load_entities(
    conn: &Connection,
    collection: &str,
    ids: &BTreeSet<String>,
) -> Result<Vec<Entity>> {
    let mut entities = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(entity) = load_entity(conn, collection, id).await? {
            entities.push(entity);
        }
    }
    Ok(entities)
}

/// Stored last-modified timestamps for the given ids (absent ids are omitted)
pub async fn load_modified_at(
    conn: &Connection,
    collection: &str,
    ids: &BTreeSet<String>,
) -> Result<BTreeMap<String, Option<String>>> {
    let mut stamps = BTreeMap::new();
    for id in ids {
        let mut rows = conn
            .query(
                "SELECT modified_at FROM entities WHERE collection = ? AND id = ?",
                params![collection, id.as_str()],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            stamps.insert(id.clone(), row.get::<Option<String>>(0)?);
        }
    }
    Ok(stamps)
}

/// Insert or replace an entity; it must carry an id
pub async fn upsert_entity(conn: &Connection, collection: &str, entity: &Entity) -> Result<()> {
    let id = entity
        .id()
        .ok_or_else(|| Error::InvalidInput("entity has no _id".into()))?;
    let body = serde_json::to_string(entity)?;
    let modified_at = entity.last_modified_at().map(str::to_string);

    conn.execute(
        "INSERT OR REPLACE INTO entities (collection, id, body, modified_at) VALUES (?, ?, ?, ?)",
        params![collection, id, body, modified_at],
    )
    .await?;
    Ok(())
}

/// Delete one entity, returning whether a row was removed
pub async fn delete_entity(conn: &Connection, collection: &str, id: &str) -> Result<bool> {
    let removed = conn
        .execute(
            "DELETE FROM entities WHERE collection = ? AND id = ?",
            params![collection, id],
        )
        .await?;
    Ok(removed > 0)
}

/// Delete every entity of a collection
pub async fn delete_collection(conn: &Connection, collection: &str) -> Result<u64> {
    Ok(conn
        .execute("DELETE FROM entities WHERE collection = ?", [collection])
        .await?)
}
