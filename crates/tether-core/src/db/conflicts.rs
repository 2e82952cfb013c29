//! Conflict journal access

use libsql::{params, Connection, Row};

use crate::error::Result;
use crate::models::{ConflictResolution, Entity, SyncConflict};

/// Journal a conflict, returning its row id
pub async fn insert_conflict(conn: &Connection, conflict: &SyncConflict) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_conflicts (
            collection, entity_id, known_modified_at, remote_modified_at,
            local_body, remote_body, detected_at, resolution
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            conflict.collection.as_str(),
            conflict.entity_id.as_str(),
            conflict.known_modified_at.clone(),
            conflict.remote_modified_at.clone(),
            serde_json::to_string(&conflict.local)?,
            serde_json::to_string(&conflict.remote)?,
            conflict.detected_at,
            conflict.resolution.as_str()
        ],
    )
    .await?;
    Ok(conn.last_insert_rowid())
}

fn parse_conflict(row: &Row) -> Result<SyncConflict> {
    let local: String = row.get(5)?;
    let remote: String = row.get(6)?;
    let resolution: String = row.get(8)?;
    Ok(SyncConflict {
        id: row.get(0)?,
        collection: row.get(1)?,
        entity_id: row.get(2)?,
        known_modified_at: row.get(3)?,
        remote_modified_at: row.get(4)?,
        local: Entity::from_value(serde_json::from_str(&local)?)?,
        remote: Entity::from_value(serde_json::from_str(&remote)?)?,
        detected_at: row.get(7)?,
        resolution: ConflictResolution::from_name(&resolution),
    })
}

/// Most recent conflicts first
pub async fn list_conflicts(
    conn: &Connection,
    collection: Option<&str>,
    limit: usize,
) -> Result<Vec<SyncConflict>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut rows = match collection {
        Some(collection) => {
            conn.query(
                "SELECT id, collection, entity_id, known_modified_at, remote_modified_at,
                        local_body, remote_body, detected_at, resolution
                 FROM sync_conflicts WHERE collection = ?
                 ORDER BY detected_at DESC, id DESC LIMIT ?",
                params![collection, limit],
            )
            .await?
        }
        None => {
            conn.query(
                "SELECT id, collection, entity_id, known_modified_at, remote_modified_at,
                        local_body, remote_body, detected_at, resolution
                 FROM sync_conflicts ORDER BY detected_at DESC, id DESC LIMIT ?",
                [limit],
            )
            .await?
        }
    };

    let mut conflicts = Vec::new();
    while let Some(row) = rows.next().await? {
        conflicts.push(parse_conflict(&row)?);
    }
    Ok(conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn conflict(collection: &str, id: &str, detected_at: i64) -> SyncConflict {
        SyncConflict {
            id: 0,
            collection: collection.into(),
            entity_id: id.into(),
            known_modified_at: Some("t1".into()),
            remote_modified_at: Some("t2".into()),
            local: Entity::new().with_id(id).with("side", "local"),
            remote: Entity::new().with_id(id).with("side", "remote"),
            detected_at,
            resolution: ConflictResolution::Surfaced,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_list_newest_first() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();

        insert_conflict(conn, &conflict("books", "a", 10)).await.unwrap();
        insert_conflict(conn, &conflict("books", "b", 20)).await.unwrap();
        insert_conflict(conn, &conflict("authors", "x", 30))
            .await
            .unwrap();

        let all = list_conflicts(conn, None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].entity_id, "x");

        let books = list_conflicts(conn, Some("books"), 1).await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].entity_id, "b");
        assert_eq!(books[0].remote.get("side"), Some(&serde_json::json!("remote")));
        assert_eq!(books[0].resolution, ConflictResolution::Surfaced);
    }
}
