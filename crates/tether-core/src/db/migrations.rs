//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn apply_statements(conn: &Connection, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }
    Ok(())
}

/// Migration to version 1: entity store, query cache, mutation log
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply_statements(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // One logical table per collection, partitioned by the collection column
            "CREATE TABLE IF NOT EXISTS entities (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                modified_at TEXT,
                PRIMARY KEY (collection, id)
            )",
            // Ids last returned for a query signature and the pull cursor
            "CREATE TABLE IF NOT EXISTS query_cache (
                collection TEXT NOT NULL,
                signature TEXT NOT NULL,
                ids TEXT NOT NULL,
                cursor TEXT,
                pulled_at INTEGER NOT NULL,
                PRIMARY KEY (collection, signature)
            )",
            // Pending local changes; a row exists until the change is confirmed remotely
            "CREATE TABLE IF NOT EXISTS mutation_log (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                operation TEXT NOT NULL CHECK (operation IN ('save', 'delete')),
                known_modified_at TEXT,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_mutation_log_collection ON mutation_log(collection)",
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )
    .await?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: aggregation cache and conflict journal
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply_statements(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS aggregation_cache (
                collection TEXT NOT NULL,
                signature TEXT NOT NULL,
                result TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                PRIMARY KEY (collection, signature)
            )",
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                known_modified_at TEXT,
                remote_modified_at TEXT,
                local_body TEXT NOT NULL,
                remote_body TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                resolution TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(collection, entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at ON sync_conflicts(detected_at DESC)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )
    .await?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
                [name],
            )
            .await
            .unwrap();
        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_all_tables_created() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in [
            "entities",
            "query_cache",
            "mutation_log",
            "aggregation_cache",
            "sync_conflicts",
        ] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }
}
