//! Sync orchestration: push pending changes, then pull remote state.
//!
//! [`SyncEngine`] owns the local store, the remote and the conflict policy.
//! Operations on one collection are serialized through a per-collection
//! async mutex; different collections run concurrently.

mod conflict;
mod pull;
mod push;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::error::Result;
use crate::network::{Gateway, Remote};
use crate::query::Query;
use crate::services::LocalStore;

pub use conflict::{
    detect, ConflictCheck, ConflictContext, ConflictFn, ConflictPolicy, PreferLocal, PreferRemote,
    Resolution, SurfaceConflicts,
};
pub use pull::{PullMode, PullOptions, PullResult};
pub use push::{PushFailure, PushResult};

/// Outcome of a push followed by a pull
///
/// A failed pull does not hide what the push already committed remotely.
#[derive(Debug)]
pub struct SyncResult {
    pub push: PushResult,
    pub pull: Result<PullResult>,
}

impl SyncResult {
    /// True when nothing stayed pending and the pull succeeded
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.push.is_complete() && self.pull.is_ok()
    }
}

type CollectionLock = Arc<tokio::sync::Mutex<()>>;

/// Runs push, pull and sync against one remote app.
pub struct SyncEngine<G> {
    store: LocalStore,
    remote: Remote<G>,
    settings: SyncSettings,
    policy: Arc<dyn ConflictPolicy>,
    locks: Mutex<HashMap<String, CollectionLock>>,
}

impl<G: Gateway> SyncEngine<G> {
    /// Create an engine that surfaces conflicts.
    pub fn new(store: LocalStore, remote: Remote<G>, settings: SyncSettings) -> Self {
        Self {
            store,
            remote,
            settings,
            policy: Arc::new(SurfaceConflicts),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the conflict policy.
    #[must_use]
    pub fn with_conflict_policy(mut self, policy: impl ConflictPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn remote(&self) -> &Remote<G> {
        &self.remote
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn lock_for(&self, collection: &str) -> CollectionLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(collection.to_string()).or_default())
    }

    /// Push pending changes of one collection.
    pub async fn push(&self, collection: &str) -> Result<PushResult> {
        self.push_with(collection, &CancellationToken::new()).await
    }

    /// Push pending changes of one collection, stopping when `cancel` fires.
    pub async fn push_with(&self, collection: &str, cancel: &CancellationToken) -> Result<PushResult> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        self.push_locked(collection, cancel).await
    }

    /// Pull one query of one collection.
    pub async fn pull(
        &self,
        collection: &str,
        query: &Query,
        options: PullOptions,
    ) -> Result<PullResult> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        pull::pull_query(
            &self.store,
            &self.remote,
            &self.settings,
            collection,
            query,
            &options,
        )
        .await
    }

    /// Push, then pull, holding the collection lock across both.
    ///
    /// Only a failing push aborts; a failing pull is reported in
    /// [`SyncResult::pull`] next to the push outcome.
    pub async fn sync(
        &self,
        collection: &str,
        query: &Query,
        options: PullOptions,
    ) -> Result<SyncResult> {
        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;
        let cancel = options.cancel.clone().unwrap_or_default();

        let push = self.push_locked(collection, &cancel).await?;
        let pull = pull::pull_query(
            &self.store,
            &self.remote,
            &self.settings,
            collection,
            query,
            &options,
        )
        .await;
        if let Err(error) = &pull {
            tracing::warn!(
                collection,
                committed = push.committed.len(),
                %error,
                "Pull failed after push"
            );
        }
        Ok(SyncResult { push, pull })
    }

    /// Push every collection with pending changes, concurrently.
    pub async fn push_all(&self) -> Result<BTreeMap<String, Result<PushResult>>> {
        let collections = self.store.collections_with_pending().await?;
        tracing::debug!(collections = collections.len(), "Pushing all collections");
        let results = join_all(collections.iter().map(|collection| self.push(collection))).await;
        Ok(collections.into_iter().zip(results).collect())
    }

    /// Sync every collection with pending changes, concurrently.
    ///
    /// A failing collection only affects its own entry in the map.
    pub async fn sync_all(&self, options: PullOptions) -> Result<BTreeMap<String, Result<SyncResult>>> {
        let collections = self.store.collections_with_pending().await?;
        self.sync_many(collections, options).await
    }

    /// Sync the given collections with an unfiltered query each.
    pub async fn sync_many<I, S>(
        &self,
        collections: I,
        options: PullOptions,
    ) -> Result<BTreeMap<String, Result<SyncResult>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collections = collections.into_iter().map(Into::into).collect::<Vec<String>>();
        let query = Query::new();
        let results = join_all(
            collections
                .iter()
                .map(|collection| self.sync(collection, &query, options.clone())),
        )
        .await;

        let results = collections.into_iter().zip(results).collect::<BTreeMap<_, _>>();
        for (collection, result) in &results {
            match result {
                Err(error) | Ok(SyncResult { pull: Err(error), .. }) => {
                    tracing::warn!(collection, %error, "Collection sync failed");
                }
                Ok(_) => {}
            }
        }
        Ok(results)
    }

    /// Pending change count for one collection, or all of them.
    pub async fn pending_count(&self, collection: Option<&str>) -> Result<u64> {
        self.store.pending_count(collection).await
    }

    async fn push_locked(&self, collection: &str, cancel: &CancellationToken) -> Result<PushResult> {
        push::push_collection(
            &self.store,
            &self.remote,
            self.policy.as_ref(),
            &self.settings,
            collection,
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{ConflictResolution, Entity};
    use crate::network::{AppCredentials, FailureKind, MemoryGateway, Method};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn engine() -> (SyncEngine<Arc<MemoryGateway>>, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new("kid"));
        let remote = Remote::new(
            Arc::clone(&gateway),
            Arc::new(AppCredentials::new("kid", "secret")),
            "kid",
        );
        let store = LocalStore::open_in_memory().await.unwrap();
        (SyncEngine::new(store, remote, SyncSettings::default()), gateway)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_without_pending_makes_no_calls() {
        let (engine, gateway) = engine().await;
        let result = engine.push("books").await.unwrap();

        assert!(result.committed.is_empty());
        assert!(result.canceled.is_empty());
        assert_eq!(gateway.request_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_creates_local_entities_under_server_ids() {
        let (engine, gateway) = engine().await;
        let saved = engine
            .store()
            .save("books", Entity::new().with("title", "Dune"))
            .await
            .unwrap();
        let temp_id = saved.id().unwrap().to_string();

        let result = engine.push("books").await.unwrap();
        let server_id = result.created.get(&temp_id).unwrap().clone();

        assert_ne!(server_id, temp_id);
        assert!(result.committed.contains(&temp_id));
        assert_eq!(engine.pending_count(Some("books")).await.unwrap(), 0);
        assert!(engine.store().find_by_id("books", &temp_id).await.unwrap().is_none());

        let local = engine.store().get("books", &server_id).await.unwrap();
        assert!(!local.is_local());
        assert_eq!(local.get("title"), Some(&json!("Dune")));
        assert_eq!(gateway.entities("books").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_updates_and_deletes_synced_entities() {
        let (engine, gateway) = engine().await;
        let a = gateway.seed("books", Entity::new().with_id("a").with("title", "A"));
        let b = gateway.seed("books", Entity::new().with_id("b").with("title", "B"));
        engine.pull("books", &Query::new(), PullOptions::default()).await.unwrap();

        engine
            .store()
            .save("books", a.with("title", "A2"))
            .await
            .unwrap();
        engine.store().remove("books", b.id().unwrap()).await.unwrap();
        assert_eq!(engine.pending_count(None).await.unwrap(), 2);

        let result = engine.push("books").await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.committed.len(), 2);
        assert_eq!(
            gateway.entity("books", "a").unwrap().get("title"),
            Some(&json!("A2"))
        );
        assert!(gateway.entity("books", "b").is_none());
        assert_eq!(engine.pending_count(None).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicting_push_is_surfaced_and_journaled() {
        let (engine, gateway) = engine().await;
        gateway.seed("books", Entity::new().with_id("x").with("title", "v1"));
        engine.pull("books", &Query::new(), PullOptions::default()).await.unwrap();

        let local = engine.store().get("books", "x").await.unwrap();
        engine
            .store()
            .save("books", local.with("title", "local"))
            .await
            .unwrap();
        gateway.modify("books", "x", |entity| entity.insert("title", "remote"));

        let result = engine.push("books").await.unwrap();
        assert!(result.canceled.contains("x"));
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].resolution, ConflictResolution::Surfaced);
        assert_eq!(
            gateway.entity("books", "x").unwrap().get("title"),
            Some(&json!("remote"))
        );
        assert!(engine.store().pending_entry("books", "x").await.unwrap().is_some());

        let journal = engine.store().list_conflicts(Some("books"), 10).await.unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].entity_id, "x");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn prefer_remote_policy_takes_the_remote_copy() {
        let (engine, gateway) = engine().await;
        let engine = engine.with_conflict_policy(PreferRemote);
        gateway.seed("books", Entity::new().with_id("x").with("title", "v1"));
        engine.pull("books", &Query::new(), PullOptions::default()).await.unwrap();

        let local = engine.store().get("books", "x").await.unwrap();
        engine.store().save("books", local.with("title", "local")).await.unwrap();
        gateway.modify("books", "x", |entity| entity.insert("title", "remote"));

        let result = engine.push("books").await.unwrap();
        assert!(result.committed.contains("x"));
        assert_eq!(
            engine.store().get("books", "x").await.unwrap().get("title"),
            Some(&json!("remote"))
        );
        assert_eq!(engine.pending_count(None).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_function_pushes_its_result() {
        let (engine, gateway) = engine().await;
        let engine = engine.with_conflict_policy(ConflictFn(|conflict: &ConflictContext<'_>| {
            let title = format!(
                "{}+{}",
                conflict.local.get("title").and_then(|v| v.as_str()).unwrap_or_default(),
                conflict.remote.get("title").and_then(|v| v.as_str()).unwrap_or_default()
            );
            Resolution::Push(conflict.remote.clone().with("title", title))
        }));
        gateway.seed("books", Entity::new().with_id("x").with("title", "v1"));
        engine.pull("books", &Query::new(), PullOptions::default()).await.unwrap();

        let local = engine.store().get("books", "x").await.unwrap();
        engine.store().save("books", local.with("title", "local")).await.unwrap();
        gateway.modify("books", "x", |entity| entity.insert("title", "remote"));

        let result = engine.push("books").await.unwrap();
        assert!(result.committed.contains("x"));
        assert_eq!(
            gateway.entity("books", "x").unwrap().get("title"),
            Some(&json!("local+remote"))
        );
        let journal = engine.store().list_conflicts(None, 10).await.unwrap();
        assert_eq!(journal[0].resolution, ConflictResolution::Merged);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_delete_batch_stays_pending() {
        let (engine, gateway) = engine().await;
        gateway.seed("books", Entity::new().with_id("a"));
        engine.pull("books", &Query::new(), PullOptions::default()).await.unwrap();
        engine.store().remove("books", "a").await.unwrap();

        gateway.fail_method(Method::Delete, FailureKind::Server);
        let result = engine.push("books").await.unwrap();
        assert!(result.canceled.contains("a"));
        assert!(matches!(result.errors[0].error, Error::Server { .. }));
        assert!(gateway.entity("books", "a").is_some());

        gateway.clear_failures();
        let retried = engine.push("books").await.unwrap();
        assert!(retried.committed.contains("a"));
        assert!(gateway.entity("books", "a").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_pushes_before_pulling() {
        let (engine, gateway) = engine().await;
        gateway.seed("books", Entity::new().with_id("remote-1").with("title", "R"));
        engine
            .store()
            .save("books", Entity::new().with("title", "L"))
            .await
            .unwrap();

        let result = engine
            .sync("books", &Query::new(), PullOptions::default())
            .await
            .unwrap();

        assert_eq!(result.push.committed.len(), 1);
        assert_eq!(result.pull.as_ref().unwrap().mode, PullMode::Full);
        assert!(result.is_complete());
        let local = engine.store().find("books", &Query::new()).await.unwrap();
        assert_eq!(local.len(), 2);
        assert!(local.iter().all(|entity| !entity.is_local()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_all_isolates_failing_collections() {
        let (engine, gateway) = engine().await;
        engine.store().save("books", Entity::new().with("t", 1)).await.unwrap();
        engine.store().save("films", Entity::new().with("t", 2)).await.unwrap();
        gateway.fail_collection("films", FailureKind::Network);

        let results = engine.sync_all(PullOptions::default()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results["books"].as_ref().unwrap().is_complete());
        let films = results["films"].as_ref().unwrap();
        assert!(films.pull.is_err());
        assert!(!films.is_complete());
        assert_eq!(engine.pending_count(Some("films")).await.unwrap(), 1);
    }
}
