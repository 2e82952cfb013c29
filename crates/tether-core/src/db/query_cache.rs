//! Query result and aggregation caches

use std::collections::BTreeSet;

use libsql::{params, Connection};
use serde_json::Value;

use crate::error::Result;

/// Ids a query signature returned at its last successful pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCacheEntry {
    /// Ids matching the query remotely at `pulled_at`
    pub ids: BTreeSet<String>,
    /// Opaque pull cursor (server request time when available)
    pub cursor: Option<String>,
    /// Local time of the pull (unix ms)
    pub pulled_at: i64,
}

/// Load the cache entry for a query signature
pub async fn load_entry(
    conn: &Connection,
    collection: &str,
    signature: &str,
) -> Result<Option<QueryCacheEntry>> {
    let mut rows = conn
        .query(
            "SELECT ids, cursor, pulled_at FROM query_cache WHERE collection = ? AND signature = ?",
            params![collection, signature],
        )
        .await?;

    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    let ids: String = row.get(0)?;
    Ok(Some(QueryCacheEntry {
        ids: serde_json::from_str(&ids)?,
        cursor: row.get(1)?,
        pulled_at: row.get(2)?,
    }))
}

/// Replace the cache entry for a query signature
pub async fn store_entry(
    conn: &Connection,
    collection: &str,
    signature: &str,
    entry: &QueryCacheEntry,
) -> Result<()> {
    let ids = serde_json::to_string(&entry.ids)?;
    conn.execute(
        "INSERT OR REPLACE INTO query_cache (collection, signature, ids, cursor, pulled_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            collection,
            signature,
            ids,
            entry.cursor.clone(),
            entry.pulled_at
        ],
    )
    .await?;
    Ok(())
}

/// Drop removed ids from every cached query of the collection
pub async fn forget_ids(conn: &Connection, collection: &str, ids: &BTreeSet<String>) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let mut rows = conn
        .query(
            "SELECT signature, ids FROM query_cache WHERE collection = ?",
            [collection],
        )
        .await?;

    let mut updates = Vec::new();
    while let Some(row) = rows.next().await? {
        let signature: String = row.get(0)?;
        let cached: BTreeSet<String> = serde_json::from_str(&row.get::<String>(1)?)?;
        if cached.iter().any(|id| ids.contains(id)) {
            let kept = cached.difference(ids).cloned().collect::<BTreeSet<_>>();
            updates.push((signature, kept));
        }
    }

    for (signature, kept) in updates {
        conn.execute(
            "UPDATE query_cache SET ids = ? WHERE collection = ? AND signature = ?",
            params![serde_json::to_string(&kept)?, collection, signature],
        )
        .await?;
    }
    Ok(())
}

/// Drop all cached queries and aggregations of a collection
pub async fn clear_collection(conn: &Connection, collection: &str) -> Result<()> {
    conn.execute("DELETE FROM query_cache WHERE collection = ?", [collection])
        .await?;
    conn.execute(
        "DELETE FROM aggregation_cache WHERE collection = ?",
        [collection],
    )
    .await?;
    Ok(())
}

/// Store an aggregation result
pub async fn store_aggregation(
    conn: &Connection,
    collection: &str,
    signature: &str,
    result: &Value,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO aggregation_cache (collection, signature, result, cached_at)
         VALUES (?, ?, ?, ?)",
        params![
            collection,
            signature,
            result.to_string(),
            chrono::Utc::now().timestamp_millis()
        ],
    )
    .await?;
    Ok(())
}

/// Load a cached aggregation result
pub async fn load_aggregation(
    conn: &Connection,
    collection: &str,
    signature: &str,
) -> Result<Option<Value>> {
    let mut rows = conn
        .query(
            "SELECT result FROM aggregation_cache WHERE collection = ? AND signature = ?",
            params![collection, signature],
        )
        .await?;

    match rows.next().await? {
        Some(row) => Ok(Some(serde_json::from_str(&row.get::<String>(0)?)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_and_load_entry() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let entry = QueryCacheEntry {
            ids: ids(&["a", "b"]),
            cursor: Some("2024-01-01T00:00:00.000Z".into()),
            pulled_at: 42,
        };

        store_entry(conn, "books", "{}", &entry).await.unwrap();
        assert_eq!(load_entry(conn, "books", "{}").await.unwrap(), Some(entry));
        assert_eq!(load_entry(conn, "books", "other").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_forget_ids_updates_every_signature() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        for (signature, cached) in [("q1", ids(&["a", "b"])), ("q2", ids(&["b", "c"]))] {
            let entry = QueryCacheEntry {
                ids: cached,
                cursor: None,
                pulled_at: 1,
            };
            store_entry(conn, "books", signature, &entry).await.unwrap();
        }

        forget_ids(conn, "books", &ids(&["b"])).await.unwrap();

        let q1 = load_entry(conn, "books", "q1").await.unwrap().unwrap();
        let q2 = load_entry(conn, "books", "q2").await.unwrap().unwrap();
        assert_eq!(q1.ids, ids(&["a"]));
        assert_eq!(q2.ids, ids(&["c"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_aggregation_cache_cleared_with_collection() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        store_aggregation(conn, "books", "count", &json!({"count": 3}))
            .await
            .unwrap();
        assert_eq!(
            load_aggregation(conn, "books", "count").await.unwrap(),
            Some(json!({"count": 3}))
        );

        clear_collection(conn, "books").await.unwrap();
        assert_eq!(load_aggregation(conn, "books", "count").await.unwrap(), None);
    }
}
