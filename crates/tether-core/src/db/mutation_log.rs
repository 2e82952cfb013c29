//! Mutation log access

use std::collections::BTreeSet;

use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{PendingMarker, PendingMutation};

fn parse_entry(row: &Row) -> Result<PendingMutation> {
    let operation: String = row.get(2)?;
    Ok(PendingMutation {
        collection: row.get(0)?,
        entity_id: row.get(1)?,
        marker: PendingMarker::from_parts(&operation, row.get::<Option<String>>(3)?),
        recorded_at: row.get(4)?,
    })
}

/// Record a pending change, replacing any earlier marker for the same id
pub async fn record(
    conn: &Connection,
    collection: &str,
    id: &str,
    marker: &PendingMarker,
) -> Result<PendingMutation> {
    let recorded_at = chrono::Utc::now().timestamp_micros();
    let known_modified_at = marker.known_modified_at().map(str::to_string);

    conn.execute(
        "INSERT OR REPLACE INTO mutation_log (collection, id, operation, known_modified_at, recorded_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            collection,
            id,
            marker.operation(),
            known_modified_at,
            recorded_at
        ],
    )
    .await?;

    Ok(PendingMutation {
        collection: collection.to_string(),
        entity_id: id.to_string(),
        marker: marker.clone(),
        recorded_at,
    })
}

/// Pending entry for one id
pub async fn load_entry(
    conn: &Connection,
    collection: &str,
    id: &str,
) -> Result<Option<PendingMutation>> {
    let mut rows = conn
        .query(
            "SELECT collection, id, operation, known_modified_at, recorded_at
             FROM mutation_log WHERE collection = ? AND id = ?",
            params![collection, id],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(parse_entry(&row)?)),
        None => Ok(None),
    }
}

/// All pending entries of a collection, oldest first
pub async fn load_pending(conn: &Connection, collection: &str) -> Result<Vec<PendingMutation>> {
    let mut rows = conn
        .query(
            "SELECT collection, id, operation, known_modified_at, recorded_at
             FROM mutation_log WHERE collection = ? ORDER BY recorded_at, id",
            [collection],
        )
        .await?;

    let mut entries = Vec::new();
    while let Some(row) = rows.next().await? {
        entries.push(parse_entry(&row)?);
    }
    Ok(entries)
}

/// Number of pending entries; `None` counts every collection
pub async fn pending_count(conn: &Connection, collection: Option<&str>) -> Result<u64> {
    let mut rows = match collection {
        Some(collection) => {
            conn.query(
                "SELECT COUNT(*) FROM mutation_log WHERE collection = ?",
                [collection],
            )
            .await?
        }
        None => conn.query("SELECT COUNT(*) FROM mutation_log", ()).await?,
    };

    let count: i64 = match rows.next().await? {
        Some(row) => row.get(0)?,
        None => 0,
    };
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Collections that have at least one pending entry
pub async fn collections_with_pending(conn: &Connection) -> Result<BTreeSet<String>> {
    let mut rows = conn
        .query("SELECT DISTINCT collection FROM mutation_log", ())
        .await?;

    let mut collections = BTreeSet::new();
    while let Some(row) = rows.next().await? {
        collections.insert(row.get::<String>(0)?);
    }
    Ok(collections)
}

/// Remove one entry
pub async fn delete_entry(conn: &Connection, collection: &str, id: &str) -> Result<bool> {
    let removed = conn
        .execute(
            "DELETE FROM mutation_log WHERE collection = ? AND id = ?",
            params![collection, id],
        )
        .await?;
    Ok(removed > 0)
}

/// Remove the entries for ids confirmed pushed
pub async fn delete_entries(
    conn: &Connection,
    collection: &str,
    ids: &BTreeSet<String>,
) -> Result<u64> {
    let mut removed = 0;
    for id in ids {
        removed += conn
            .execute(
                "DELETE FROM mutation_log WHERE collection = ? AND id = ?",
                params![collection, id.as_str()],
            )
            .await?;
    }
    Ok(removed)
}

/// Point a still-pending entry at a newer remote timestamp
pub async fn rebase_entry(
    conn: &Connection,
    collection: &str,
    id: &str,
    known_modified_at: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE mutation_log SET known_modified_at = ? WHERE collection = ? AND id = ?",
        params![known_modified_at.map(str::to_string), collection, id],
    )
    .await?;
    Ok(())
}

/// Drop every entry of a collection
pub async fn clear_collection(conn: &Connection, collection: &str) -> Result<u64> {
    Ok(conn
        .execute("DELETE FROM mutation_log WHERE collection = ?", [collection])
        .await?)
}
