//! Application-facing store for one collection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::Entity;
use crate::network::Gateway;
use crate::query::Query;
use crate::sync::{PullOptions, PullResult, PushResult, SyncEngine, SyncResult};

use super::LocalStore;

/// Where reads and writes of a [`DataStore`] go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Local store only; the caller pushes and pulls explicitly
    #[default]
    Sync,
    /// Reads refresh from the remote, writes are pushed right away
    Cache,
    /// Straight to the remote; the local store is not touched
    Network,
}

impl StoreMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Cache => "cache",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "cache" => Ok(Self::Cache),
            "network" => Ok(Self::Network),
            other => Err(Error::InvalidInput(format!("unknown store mode: {other}"))),
        }
    }
}

/// One collection seen through a [`SyncEngine`].
pub struct DataStore<G> {
    collection: String,
    mode: StoreMode,
    engine: Arc<SyncEngine<G>>,
}

impl<G> Clone for DataStore<G> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            mode: self.mode,
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<G: Gateway> DataStore<G> {
    pub fn new(engine: Arc<SyncEngine<G>>, collection: impl Into<String>, mode: StoreMode) -> Self {
        Self {
            collection: collection.into(),
            mode,
            engine,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub const fn mode(&self) -> StoreMode {
        self.mode
    }

    fn local(&self) -> &LocalStore {
        self.engine.store()
    }

    /// Entities matching a query.
    pub async fn find(&self, query: &Query) -> Result<Vec<Entity>> {
        match self.mode {
            StoreMode::Sync => self.local().find(&self.collection, query).await,
            StoreMode::Cache => {
                let pulled = self
                    .engine
                    .pull(&self.collection, query, PullOptions::default())
                    .await;
                self.tolerate_offline(pulled.map(|_| ()))?;
                self.local().find(&self.collection, query).await
            }
            StoreMode::Network => Ok(self
                .engine
                .remote()
                .find(&self.collection, query, &CancellationToken::new())
                .await?
                .entities),
        }
    }

    /// One entity by id, `None` when absent.
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Entity>> {
        match self.mode {
            StoreMode::Sync => self.local().find_by_id(&self.collection, id).await,
            StoreMode::Cache => {
                let fetched = self
                    .engine
                    .remote()
                    .get(&self.collection, id, &CancellationToken::new())
                    .await;
                match fetched {
                    Ok(Some(entity)) => {
                        self.local().cache_remote(&self.collection, &entity).await?;
                    }
                    Ok(None) => {
                        self.local().forget_remote(&self.collection, id).await?;
                    }
                    Err(error) => self.tolerate_offline(Err(error))?,
                }
                self.local().find_by_id(&self.collection, id).await
            }
            StoreMode::Network => {
                self.engine
                    .remote()
                    .get(&self.collection, id, &CancellationToken::new())
                    .await
            }
        }
    }

    /// Number of entities matching the query's filter.
    pub async fn count(&self, query: &Query) -> Result<u64> {
        match self.mode {
            StoreMode::Sync => self.local().count(&self.collection, query).await,
            StoreMode::Cache => {
                let remote = self
                    .engine
                    .remote()
                    .count(&self.collection, query, &CancellationToken::new())
                    .await;
                match remote {
                    Ok(count) => Ok(count),
                    Err(error) => {
                        self.tolerate_offline(Err(error))?;
                        self.local().count(&self.collection, query).await
                    }
                }
            }
            StoreMode::Network => {
                self.engine
                    .remote()
                    .count(&self.collection, query, &CancellationToken::new())
                    .await
            }
        }
    }

    /// Save an entity; returns the stored copy.
    ///
    /// In cache mode a successful push returns the remote copy, under the
    /// server id when the entity was new.
    pub async fn save(&self, entity: Entity) -> Result<Entity> {
        match self.mode {
            StoreMode::Sync => self.local().save(&self.collection, entity).await,
            StoreMode::Cache => {
                let saved = self.local().save(&self.collection, entity).await?;
                let id = saved
                    .id()
                    .ok_or_else(|| Error::InvalidInput("saved entity has no _id".into()))?
                    .to_string();
                let result = self.engine.push(&self.collection).await?;
                let current_id = result.created.get(&id).cloned().unwrap_or_else(|| id.clone());
                self.check_pushed(result, &id)?;
                Ok(self
                    .local()
                    .find_by_id(&self.collection, &current_id)
                    .await?
                    .unwrap_or(saved))
            }
            StoreMode::Network => {
                let remote = self.engine.remote();
                let cancel = CancellationToken::new();
                if entity.id().is_none() || entity.is_local() {
                    remote
                        .create(&self.collection, entity.for_remote_create(), &cancel)
                        .await
                } else {
                    remote.update(&self.collection, entity, &cancel).await
                }
            }
        }
    }

    /// Remove an entity; returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        match self.mode {
            StoreMode::Sync => self.local().remove(&self.collection, id).await,
            StoreMode::Cache => {
                let removed = self.local().remove(&self.collection, id).await?;
                let result = self.engine.push(&self.collection).await?;
                self.check_pushed(result, id)?;
                Ok(removed)
            }
            StoreMode::Network => Ok(self
                .engine
                .remote()
                .delete(&self.collection, id, &CancellationToken::new())
                .await?
                > 0),
        }
    }

    /// Remove every entity matching a query; returns how many.
    pub async fn remove_by_query(&self, query: &Query) -> Result<usize> {
        match self.mode {
            StoreMode::Sync => self.local().remove_by_query(&self.collection, query).await,
            StoreMode::Cache => {
                let removed = self.local().remove_by_query(&self.collection, query).await?;
                let result = self.engine.push(&self.collection).await?;
                if let Some(failure) = result.errors.into_iter().next() {
                    self.tolerate_offline(Err(failure.error))?;
                }
                Ok(removed)
            }
            StoreMode::Network => {
                let removed = self
                    .engine
                    .remote()
                    .delete_by_query(&self.collection, query, &CancellationToken::new())
                    .await?;
                Ok(usize::try_from(removed).unwrap_or(usize::MAX))
            }
        }
    }

    pub async fn push(&self) -> Result<PushResult> {
        self.require_local("push")?;
        self.engine.push(&self.collection).await
    }

    pub async fn pull(&self, query: &Query, options: PullOptions) -> Result<PullResult> {
        self.require_local("pull")?;
        self.engine.pull(&self.collection, query, options).await
    }

    pub async fn sync(&self, query: &Query, options: PullOptions) -> Result<SyncResult> {
        self.require_local("sync")?;
        self.engine.sync(&self.collection, query, options).await
    }

    /// Pending change count of this collection.
    pub async fn pending_count(&self) -> Result<u64> {
        self.engine.pending_count(Some(&self.collection)).await
    }

    /// Drop local entities, caches and pending changes of this collection.
    pub async fn clear(&self) -> Result<()> {
        self.local().clear(&self.collection).await
    }

    fn require_local(&self, operation: &str) -> Result<()> {
        if self.mode == StoreMode::Network {
            return Err(Error::InvalidInput(format!(
                "{operation} is not available on a network store"
            )));
        }
        Ok(())
    }

    /// Swallow transient remote failures so reads and writes keep working offline.
    fn tolerate_offline(&self, outcome: Result<()>) -> Result<()> {
        match outcome {
            Err(error) if error.is_retryable() || matches!(error, Error::Cancelled) => {
                tracing::warn!(collection = %self.collection, %error, "Remote unavailable; using local data");
                Ok(())
            }
            other => other,
        }
    }

    /// Turn a push outcome for one id into an error the caller must act on.
    fn check_pushed(&self, result: PushResult, id: &str) -> Result<()> {
        if result.conflicts.iter().any(|conflict| conflict.entity_id == id) {
            return Err(Error::Conflict {
                collection: self.collection.clone(),
                id: id.to_string(),
            });
        }
        match result.errors.into_iter().find(|failure| failure.ids.contains(id)) {
            Some(failure) => self.tolerate_offline(Err(failure.error)),
            None => Ok(()),
        }
    }
}
