//! Push engine: replay pending local changes against the remote.

use std::collections::{BTreeMap, BTreeSet};

use tokio_util::sync::CancellationToken;

use super::conflict::{detect, ConflictCheck, ConflictContext, ConflictPolicy, Resolution};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::{PendingMutation, SyncConflict};
use crate::network::{Gateway, Remote};
use crate::services::LocalStore;
use crate::util::unix_millis_now;

/// A pending change that could not be pushed
#[derive(Debug)]
pub struct PushFailure {
    pub ids: BTreeSet<String>,
    pub error: Error,
}

/// Outcome of pushing one collection
#[derive(Debug, Default)]
pub struct PushResult {
    pub collection: String,
    /// Ids whose pending entries were confirmed and removed
    pub committed: BTreeSet<String>,
    /// Ids attempted and still pending
    pub canceled: BTreeSet<String>,
    /// Conflicts left pending for the caller
    pub conflicts: Vec<SyncConflict>,
    /// Locally assigned ids mapped to the ids the remote created
    pub created: BTreeMap<String, String>,
    pub errors: Vec<PushFailure>,
}

impl PushResult {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Self::default()
        }
    }

    /// True when nothing was left pending
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.canceled.is_empty()
    }

    fn fail(&mut self, ids: BTreeSet<String>, error: Error) {
        self.canceled.extend(ids.iter().cloned());
        self.errors.push(PushFailure { ids, error });
    }
}

/// Push every pending change of one collection.
///
/// Deletes go out in batches, saves one at a time. Each confirmed change is
/// committed locally right after its remote call, so an interrupted push
/// leaves committed and pending ids consistent and a retry repeats only the
/// rest.
pub(crate) async fn push_collection<G: Gateway>(
    store: &LocalStore,
    remote: &Remote<G>,
    policy: &dyn ConflictPolicy,
    settings: &SyncSettings,
    collection: &str,
    cancel: &CancellationToken,
) -> Result<PushResult> {
    let mut result = PushResult::new(collection);
    let pending = store.pending(collection).await?;
    if pending.is_empty() {
        return Ok(result);
    }

    let (deletes, saves): (Vec<_>, Vec<_>) = pending
        .into_iter()
        .partition(|entry| entry.marker.is_delete());
    tracing::debug!(
        collection,
        deletes = deletes.len(),
        saves = saves.len(),
        "Pushing pending changes"
    );

    push_deletes(store, remote, settings, collection, &deletes, cancel, &mut result).await?;

    let mut skipped = BTreeSet::new();
    for entry in &saves {
        if cancel.is_cancelled() {
            skipped.insert(entry.entity_id.clone());
            continue;
        }
        let pushed = push_save(store, remote, policy, collection, entry, cancel, &mut result).await;
        match pushed {
            Ok(()) => {}
            Err(error @ (Error::Database(_) | Error::LibSql(_))) => return Err(error),
            Err(error) => {
                tracing::warn!(collection, id = %entry.entity_id, %error, "Push failed; change stays pending");
                result.fail(BTreeSet::from([entry.entity_id.clone()]), error);
            }
        }
    }
    if !skipped.is_empty() {
        result.fail(skipped, Error::Cancelled);
    }

    tracing::info!(
        collection,
        committed = result.committed.len(),
        canceled = result.canceled.len(),
        conflicts = result.conflicts.len(),
        "Push finished"
    );
    Ok(result)
}

async fn push_deletes<G: Gateway>(
    store: &LocalStore,
    remote: &Remote<G>,
    settings: &SyncSettings,
    collection: &str,
    deletes: &[PendingMutation],
    cancel: &CancellationToken,
    result: &mut PushResult,
) -> Result<()> {
    for chunk in deletes.chunks(settings.delete_chunk_size.max(1)) {
        let ids = chunk
            .iter()
            .map(|entry| entry.entity_id.clone())
            .collect::<Vec<_>>();

        match remote.delete_by_ids(collection, &ids, cancel).await {
            Ok(removed) => {
                tracing::debug!(collection, requested = ids.len(), removed, "Deleted batch remotely");
                for entry in chunk {
                    if store.commit_pushed(collection, entry, None).await? {
                        result.committed.insert(entry.entity_id.clone());
                    } else {
                        result.canceled.insert(entry.entity_id.clone());
                    }
                }
            }
            Err(error) => {
                tracing::warn!(collection, count = ids.len(), %error, "Batched delete failed; tombstones stay pending");
                result.fail(ids.into_iter().collect(), error);
            }
        }
    }
    Ok(())
}

async fn push_save<G: Gateway>(
    store: &LocalStore,
    remote: &Remote<G>,
    policy: &dyn ConflictPolicy,
    collection: &str,
    entry: &PendingMutation,
    cancel: &CancellationToken,
    result: &mut PushResult,
) -> Result<()> {
    let id = entry.entity_id.as_str();
    let Some(local) = store.find_by_id(collection, id).await? else {
        tracing::warn!(collection, id, "Pending save has no local entity; dropping entry");
        store.discard_pending(collection, id).await?;
        return Ok(());
    };

    if local.is_local() {
        let created = remote
            .create(collection, local.for_remote_create(), cancel)
            .await?;
        if let Some(new_id) = created.id() {
            result.created.insert(id.to_string(), new_id.to_string());
        }
        settle(store.commit_created(collection, entry, &created).await?, id, result);
        return Ok(());
    }

    let remote_copy = remote.get(collection, id, cancel).await?;
    let known = entry.marker.known_modified_at();
    let outgoing = match detect(known, remote_copy) {
        ConflictCheck::Create | ConflictCheck::Overwrite => local,
        ConflictCheck::Conflict(remote_entity) => {
            let context = ConflictContext {
                collection,
                entity_id: id,
                known_modified_at: known,
                local: &local,
                remote: &remote_entity,
            };
            let resolution = policy.resolve(&context);
            let mut conflict = SyncConflict {
                id: 0,
                collection: collection.to_string(),
                entity_id: id.to_string(),
                known_modified_at: known.map(str::to_string),
                remote_modified_at: remote_entity.last_modified_at().map(str::to_string),
                local: local.clone(),
                remote: remote_entity.clone(),
                detected_at: unix_millis_now(),
                resolution: resolution.journal_as(&local),
            };
            conflict.id = store.record_conflict(&conflict).await?;
            tracing::warn!(
                collection,
                id,
                known = ?conflict.known_modified_at,
                remote = ?conflict.remote_modified_at,
                resolution = conflict.resolution.as_str(),
                "Conflict detected"
            );

            match resolution {
                Resolution::Keep => {
                    result.canceled.insert(id.to_string());
                    result.conflicts.push(conflict);
                    return Ok(());
                }
                Resolution::AcceptRemote => {
                    settle(
                        store.accept_remote(collection, entry, &remote_entity).await?,
                        id,
                        result,
                    );
                    return Ok(());
                }
                Resolution::Push(entity) => entity.with_id(id),
            }
        }
    };

    let saved = remote.update(collection, outgoing, cancel).await?;
    settle(store.commit_pushed(collection, entry, Some(&saved)).await?, id, result);
    Ok(())
}

fn settle(committed: bool, id: &str, result: &mut PushResult) {
    if committed {
        result.committed.insert(id.to_string());
    } else {
        result.canceled.insert(id.to_string());
    }
}
