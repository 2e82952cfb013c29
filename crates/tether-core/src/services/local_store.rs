//! Persistent local store shared by the data store facade and the sync engine.
//!
//! Every write runs in one libSQL transaction covering the entity table, the
//! mutation log and the query caches, so a failed or cancelled write leaves
//! all three as they were.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use libsql::Connection;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{self, Database, QueryCacheEntry};
use crate::error::{Error, Result};
use crate::models::{
    generate_entity_id, Entity, PendingMarker, PendingMutation, SyncConflict,
};
use crate::query::{self, Query};

/// A local write, reconciled by [`LocalStore::apply`]
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// Create or replace an entity
    Saved(Entity),
    /// Remove one entity by id
    Removed(String),
    /// Remove every entity matching a query
    RemovedByQuery(Query),
}

/// What a pull wants written, prepared before the local transaction starts
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PullChanges {
    pub signature: String,
    pub upserts: Vec<Entity>,
    pub removals: BTreeSet<String>,
    pub cache_entry: QueryCacheEntry,
}

/// Ids a pull actually touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PullApplied {
    pub written: usize,
    pub removed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
}

/// Thread-safe handle to the local database.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LocalStore {
    /// Open a store at the given filesystem path, creating parent directories.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened local store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.db_path.as_deref()
    }

    /// Fetch an entity; a missing id is an error.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Entity> {
        self.find_by_id(collection, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))
    }

    /// Fetch an entity if present.
    pub async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Entity>> {
        let db = self.db.lock().await;
        db::load_entity(db.connection(), collection, id).await
    }

    /// Fetch several ids; missing ones map to `None`.
    pub async fn get_many(
        &self,
        collection: &str,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<Entity>>> {
        let db = self.db.lock().await;
        let mut found = BTreeMap::new();
        for id in ids {
            let entity = db::load_entity(db.connection(), collection, id).await?;
            found.insert(id.clone(), entity);
        }
        Ok(found)
    }

    /// Evaluate a query against every stored entity of the collection.
    pub async fn find(&self, collection: &str, query: &Query) -> Result<Vec<Entity>> {
        let items = {
            let db = self.db.lock().await;
            db::load_collection(db.connection(), collection).await?
        };
        Ok(query::apply(items, query))
    }

    /// Number of stored entities matching the query's filter.
    pub async fn count(&self, collection: &str, query: &Query) -> Result<u64> {
        let items = {
            let db = self.db.lock().await;
            db::load_collection(db.connection(), collection).await?
        };
        let count = items
            .iter()
            .filter(|entity| query::matches(entity, &query.filter))
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    /// Save an entity and record it as pending; returns the stored copy.
    pub async fn save(&self, collection: &str, entity: Entity) -> Result<Entity> {
        self.apply(collection, CacheUpdate::Saved(entity))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Database("save produced no entity".into()))
    }

    /// Remove an entity; returns whether it existed.
    pub async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let removed = self
            .apply(collection, CacheUpdate::Removed(id.to_string()))
            .await?;
        Ok(!removed.is_empty())
    }

    /// Remove every entity matching the query; returns how many.
    pub async fn remove_by_query(&self, collection: &str, query: &Query) -> Result<usize> {
        let removed = self
            .apply(collection, CacheUpdate::RemovedByQuery(query.clone()))
            .await?;
        Ok(removed.len())
    }

    /// Apply one local write atomically and return the affected entities:
    /// the stored copy for `Saved`, the removed copies otherwise.
    pub async fn apply(&self, collection: &str, update: CacheUpdate) -> Result<Vec<Entity>> {
        let db = self.db.lock().await;
        let tx = db.transaction().await?;

        let affected = match update {
            CacheUpdate::Saved(entity) => vec![save_entity(&tx, collection, entity).await?],
            CacheUpdate::Removed(id) => remove_entity(&tx, collection, &id)
                .await?
                .into_iter()
                .collect(),
            CacheUpdate::RemovedByQuery(query) => {
                let matched =
                    query::apply(db::load_collection(&tx, collection).await?, &query);
                let mut removed = Vec::with_capacity(matched.len());
                for entity in matched {
                    if let Some(id) = entity.id() {
                        removed.extend(remove_entity(&tx, collection, id).await?);
                    }
                }
                removed
            }
        };

        tx.commit().await?;
        Ok(affected)
    }

    /// Wipe entities, caches and pending changes of one collection.
    pub async fn clear(&self, collection: &str) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.transaction().await?;
        clear_collection(&tx, collection).await?;
        tx.commit().await?;
        tracing::info!(collection, "Cleared local collection");
        Ok(())
    }

    /// Wipe every collection (logout).
    pub async fn clear_all(&self) -> Result<()> {
        let db = self.db.lock().await;
        let tx = db.transaction().await?;
        for table in [
            "entities",
            "query_cache",
            "mutation_log",
            "aggregation_cache",
            "sync_conflicts",
        ] {
            tx.execute(&format!("DELETE FROM {table}"), ()).await?;
        }
        tx.commit().await?;
        tracing::info!("Cleared local store");
        Ok(())
    }

    /// Pending entries of a collection, oldest first.
    pub async fn pending(&self, collection: &str) -> Result<Vec<PendingMutation>> {
        let db = self.db.lock().await;
        db::load_pending(db.connection(), collection).await
    }

    /// Pending entry for one id.
    pub async fn pending_entry(&self, collection: &str, id: &str) -> Result<Option<PendingMutation>> {
        let db = self.db.lock().await;
        db::load_entry(db.connection(), collection, id).await
    }

    /// Ids with pending changes.
    pub async fn pending_ids(&self, collection: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .pending(collection)
            .await?
            .into_iter()
            .map(|entry| entry.entity_id)
            .collect())
    }

    /// Pending entry count for one collection, or all of them.
    pub async fn pending_count(&self, collection: Option<&str>) -> Result<u64> {
        let db = self.db.lock().await;
        db::pending_count(db.connection(), collection).await
    }

    /// Locally stored copies of entities with pending saves.
    pub async fn pending_entities(&self, collection: &str) -> Result<Vec<Entity>> {
        let db = self.db.lock().await;
        let ids = db::load_pending(db.connection(), collection)
            .await?
            .into_iter()
            .filter(|entry| !entry.marker.is_delete())
            .map(|entry| entry.entity_id)
            .collect::<BTreeSet<_>>();
        db::load_entities(db.connection(), collection, &ids).await
    }

    /// Collections with at least one pending change.
    pub async fn collections_with_pending(&self) -> Result<BTreeSet<String>> {
        let db = self.db.lock().await;
        db::collections_with_pending(db.connection()).await
    }

    /// Drop pending entries for ids confirmed pushed.
    pub async fn commit(&self, collection: &str, ids: &BTreeSet<String>) -> Result<u64> {
        let db = self.db.lock().await;
        db::delete_entries(db.connection(), collection, ids).await
    }

    /// Cache an aggregation result under a signature.
    pub async fn cache_aggregation(
        &self,
        collection: &str,
        signature: &str,
        result: &Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db::store_aggregation(db.connection(), collection, signature, result).await
    }

    /// Cached aggregation result, if any.
    pub async fn cached_aggregation(&self, collection: &str, signature: &str) -> Result<Option<Value>> {
        let db = self.db.lock().await;
        db::load_aggregation(db.connection(), collection, signature).await
    }

    /// Journaled conflicts, newest first.
    pub async fn list_conflicts(
        &self,
        collection: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        db::list_conflicts(db.connection(), collection, limit).await
    }

    pub(crate) async fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64> {
        let db = self.db.lock().await;
        db::insert_conflict(db.connection(), conflict).await
    }

    pub(crate) async fn query_cache(
        &self,
        collection: &str,
        signature: &str,
    ) -> Result<Option<QueryCacheEntry>> {
        let db = self.db.lock().await;
        db::load_query_cache(db.connection(), collection, signature).await
    }

    pub(crate) async fn modified_at(
        &self,
        collection: &str,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Option<String>>> {
        let db = self.db.lock().await;
        db::load_modified_at(db.connection(), collection, ids).await
    }

    /// Write pulled changes, skipping ids with pending local changes.
    pub(crate) async fn apply_pull(&self, collection: &str, changes: PullChanges) -> Result<PullApplied> {
        let db = self.db.lock().await;
        let tx = db.transaction().await?;

        let pending = db::load_pending(&tx, collection)
            .await?
            .into_iter()
            .map(|entry| entry.entity_id)
            .collect::<BTreeSet<_>>();
        let mut applied = PullApplied::default();

        for entity in changes.upserts {
            let Some(id) = entity.id() else { continue };
            if pending.contains(id) {
                applied.skipped.insert(id.to_string());
                continue;
            }
            db::upsert_entity(&tx, collection, &entity).await?;
            applied.written += 1;
        }

        for id in changes.removals {
            if pending.contains(&id) {
                applied.skipped.insert(id);
                continue;
            }
            db::delete_entity(&tx, collection, &id).await?;
            applied.removed.insert(id);
        }

        db::forget_cached_ids(&tx, collection, &applied.removed).await?;
        db::store_query_cache(&tx, collection, &changes.signature, &changes.cache_entry).await?;
        tx.commit().await?;

        if !applied.skipped.is_empty() {
            tracing::warn!(
                collection,
                skipped = applied.skipped.len(),
                "Pull left entities with pending local changes untouched"
            );
        }
        Ok(applied)
    }

    /// Store a single remote copy unless the id has a pending change.
    pub(crate) async fn cache_remote(&self, collection: &str, entity: &Entity) -> Result<bool> {
        let Some(id) = entity.id() else {
            return Ok(false);
        };
        let db = self.db.lock().await;
        let tx = db.transaction().await?;
        if db::load_entry(&tx, collection, id).await?.is_some() {
            return Ok(false);
        }
        db::upsert_entity(&tx, collection, entity).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Drop a local copy the remote no longer has, unless it is pending.
    pub(crate) async fn forget_remote(&self, collection: &str, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let tx = db.transaction().await?;
        if db::load_entry(&tx, collection, id).await?.is_some() {
            return Ok(false);
        }
        let removed = db::delete_entity(&tx, collection, id).await?;
        db::forget_cached_ids(&tx, collection, &BTreeSet::from([id.to_string()])).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Settle a pushed entry.
    ///
    /// The entry is removed only when it is still the one that was pushed;
    /// a change recorded meanwhile stays pending, rebased onto the remote
    /// timestamp the push produced. `remote` is the confirmed remote copy
    /// (`None` after a delete).
    pub(crate) async fn commit_pushed(
        &self,
        collection: &str,
        pushed: &PendingMutation,
        remote: Option<&Entity>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let tx = db.transaction().await?;
        let id = pushed.entity_id.as_str();

        let committed = match db::load_entry(&tx, collection, id).await? {
            None => false,
            Some(current) if current.recorded_at == pushed.recorded_at => {
                db::delete_entry(&tx, collection, id).await?;
                if let Some(remote) = remote {
                    db::upsert_entity(&tx, collection, remote).await?;
                }
                true
            }
            Some(_) => {
                let lmt = remote.and_then(Entity::last_modified_at);
                db::rebase_entry(&tx, collection, id, lmt).await?;
                tracing::debug!(collection, id, "Entry changed during push; kept pending");
                false
            }
        };

        tx.commit().await?;
        Ok(committed)
    }

    /// Replace a locally assigned id with the one the remote created.
    pub(crate) async fn commit_created(
        &self,
        collection: &str,
        pushed: &PendingMutation,
        created: &Entity,
    ) -> Result<bool> {
        let new_id = created
            .id()
            .ok_or_else(|| Error::InvalidInput("created entity has no _id".into()))?;
        let db = self.db.lock().await;
        let tx = db.transaction().await?;
        let temp_id = pushed.entity_id.as_str();

        let current = db::load_entry(&tx, collection, temp_id).await?;
        let committed = match current {
            None => {
                // Removed locally while the create was in flight: the remote copy must go too.
                db::delete_entity(&tx, collection, temp_id).await?;
                db::record_mutation(
                    &tx,
                    collection,
                    new_id,
                    &PendingMarker::Delete {
                        known_modified_at: created.last_modified_at().map(str::to_string),
                    },
                )
                .await?;
                tracing::debug!(collection, temp_id, new_id, "Entity removed during create; tombstoned");
                false
            }
            Some(current) if current.recorded_at == pushed.recorded_at => {
                db::delete_entry(&tx, collection, temp_id).await?;
                db::delete_entity(&tx, collection, temp_id).await?;
                db::upsert_entity(&tx, collection, created).await?;
                true
            }
            Some(current) => {
                // Changed during the push: carry the newer change over to the new id.
                db::delete_entry(&tx, collection, temp_id).await?;
                let known = created.last_modified_at().map(str::to_string);
                match db::load_entity(&tx, collection, temp_id).await? {
                    Some(local) if !current.marker.is_delete() => {
                        db::delete_entity(&tx, collection, temp_id).await?;
                        let mut local = local.for_remote_create().with_id(new_id);
                        local.inherit_system_fields(created);
                        db::upsert_entity(&tx, collection, &local).await?;
                        db::record_mutation(
                            &tx,
                            collection,
                            new_id,
                            &PendingMarker::Save { known_modified_at: known },
                        )
                        .await?;
                    }
                    _ => {
                        db::delete_entity(&tx, collection, temp_id).await?;
                        db::record_mutation(
                            &tx,
                            collection,
                            new_id,
                            &PendingMarker::Delete { known_modified_at: known },
                        )
                        .await?;
                    }
                }
                false
            }
        };
        db::forget_cached_ids(&tx, collection, &BTreeSet::from([temp_id.to_string()])).await?;

        tx.commit().await?;
        tracing::debug!(collection, temp_id, new_id, "Replaced local id with remote id");
        Ok(committed)
    }

    /// Drop a pending change in favour of the remote copy.
    pub(crate) async fn accept_remote(
        &self,
        collection: &str,
        pushed: &PendingMutation,
        remote: &Entity,
    ) -> Result<bool> {
        self.commit_pushed(collection, pushed, Some(remote)).await
    }

    /// Drop a pending entry whose entity vanished locally.
    pub(crate) async fn discard_pending(&self, collection: &str, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        db::delete_entry(db.connection(), collection, id).await
    }
}

async fn save_entity(conn: &Connection, collection: &str, mut entity: Entity) -> Result<Entity> {
    let existing_entry = match entity.id() {
        Some(id) => db::load_entry(conn, collection, id).await?,
        None => None,
    };

    match entity.id().map(str::to_string) {
        None => {
            entity.set_id(generate_entity_id());
            entity.mark_local();
        }
        Some(id) => {
            if let Some(existing) = db::load_entity(conn, collection, &id).await? {
                entity.inherit_system_fields(&existing);
            }
        }
    }

    let known_modified_at = match &existing_entry {
        Some(entry) => entry.marker.known_modified_at().map(str::to_string),
        None if entity.is_local() => None,
        None => entity.last_modified_at().map(str::to_string),
    };
    let id = entity
        .id()
        .ok_or_else(|| Error::InvalidInput("entity has no _id".into()))?
        .to_string();

    db::upsert_entity(conn, collection, &entity).await?;
    db::record_mutation(
        conn,
        collection,
        &id,
        &PendingMarker::Save { known_modified_at },
    )
    .await?;
    Ok(entity)
}

async fn remove_entity(conn: &Connection, collection: &str, id: &str) -> Result<Option<Entity>> {
    let Some(existing) = db::load_entity(conn, collection, id).await? else {
        return Ok(None);
    };

    db::delete_entity(conn, collection, id).await?;
    if existing.is_local() {
        db::delete_entry(conn, collection, id).await?;
    } else {
        let known_modified_at = match db::load_entry(conn, collection, id).await? {
            Some(entry) => entry.marker.known_modified_at().map(str::to_string),
            None => existing.last_modified_at().map(str::to_string),
        };
        db::record_mutation(
            conn,
            collection,
            id,
            &PendingMarker::Delete { known_modified_at },
        )
        .await?;
    }
    db::forget_cached_ids(conn, collection, &BTreeSet::from([id.to_string()])).await?;
    Ok(Some(existing))
}

async fn clear_collection(conn: &Connection, collection: &str) -> Result<()> {
    db::delete_collection(conn, collection).await?;
    db::clear_query_cache(conn, collection).await?;
    db::clear_mutations(conn, collection).await?;
    Ok(())
}
