//! Delta query resolver: bring a query's remote results into the local store.

use std::collections::BTreeSet;
use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::db::QueryCacheEntry;
use crate::error::Result;
use crate::models::Entity;
use crate::network::{Gateway, Remote};
use crate::query::Query;
use crate::services::{LocalStore, PullChanges};
use crate::util::{timestamp_now, unix_millis_now};

/// How a pull fetched its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    Full,
    Delta,
}

impl fmt::Display for PullMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Delta => "delta",
        })
    }
}

/// Per-call pull options
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Allow the delta path (still subject to the engine settings)
    pub use_delta: bool,
    /// Abort in-flight remote calls; nothing is written when it fires
    pub cancel: Option<CancellationToken>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            use_delta: true,
            cancel: None,
        }
    }
}

impl PullOptions {
    #[must_use]
    pub fn full() -> Self {
        Self {
            use_delta: false,
            cancel: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Outcome of one pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    pub mode: PullMode,
    /// Entities created or updated locally
    pub count: usize,
    /// Ids removed locally because the remote no longer has them
    pub deleted: BTreeSet<String>,
    /// Cursor stored for the query
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FullReason {
    DeltaDisabled,
    Paged,
    NoCursor,
    CursorExpired,
}

impl FullReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::DeltaDisabled => "delta disabled",
            Self::Paged => "paged query",
            Self::NoCursor => "no cursor",
            Self::CursorExpired => "cursor expired",
        }
    }
}

/// Decide between full and delta fetch for a query.
fn choose_mode(
    query: &Query,
    cached: Option<&QueryCacheEntry>,
    use_delta: bool,
    settings: &SyncSettings,
    now_ms: i64,
) -> std::result::Result<(), FullReason> {
    if !use_delta || !settings.delta_enabled {
        return Err(FullReason::DeltaDisabled);
    }
    if query.is_paged() {
        return Err(FullReason::Paged);
    }
    let Some(entry) = cached.filter(|entry| entry.cursor.is_some()) else {
        return Err(FullReason::NoCursor);
    };
    if let Some(max_age) = settings.max_cursor_age {
        let age_ms = now_ms.saturating_sub(entry.pulled_at);
        let max_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        if age_ms > max_ms {
            return Err(FullReason::CursorExpired);
        }
    }
    Ok(())
}

/// Pull one query of one collection.
pub(crate) async fn pull_query<G: Gateway>(
    store: &LocalStore,
    remote: &Remote<G>,
    settings: &SyncSettings,
    collection: &str,
    query: &Query,
    options: &PullOptions,
) -> Result<PullResult> {
    let cancel = options.cancel.clone().unwrap_or_default();
    let signature = query.signature();
    let cached = store.query_cache(collection, &signature).await?;

    match choose_mode(query, cached.as_ref(), options.use_delta, settings, unix_millis_now()) {
        Ok(()) => {
            let cached = cached.unwrap_or_else(|| QueryCacheEntry {
                ids: BTreeSet::new(),
                cursor: None,
                pulled_at: 0,
            });
            delta_pull(store, remote, settings, collection, query, signature, cached, &cancel).await
        }
        Err(reason) => {
            tracing::debug!(collection, reason = reason.as_str(), "Using full fetch");
            full_pull(store, remote, settings, collection, query, signature, cached, &cancel).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn full_pull<G: Gateway>(
    store: &LocalStore,
    remote: &Remote<G>,
    settings: &SyncSettings,
    collection: &str,
    query: &Query,
    signature: String,
    cached: Option<QueryCacheEntry>,
    cancel: &CancellationToken,
) -> Result<PullResult> {
    // Projected documents would overwrite complete local copies.
    let mut request_query = query.clone();
    request_query.fields.clear();
    let fetched = remote.find(collection, &request_query, cancel).await?;

    let remote_ids = ids_of(&fetched.entities);
    // Only ids this query cached before count as remote deletions; copies
    // pulled by other queries are reconciled by those queries.
    let mut previously = cached.map(|entry| entry.ids).unwrap_or_default();
    previously.retain(|id| !remote_ids.contains(id));
    let removals = if query.is_paged() {
        // Ids may just have moved to another page; only confirmed absences count.
        confirm_missing(remote, settings, collection, previously, cancel).await?
    } else {
        previously
    };

    let cursor = fetched.request_start.unwrap_or_else(timestamp_now);
    let changes = PullChanges {
        signature,
        upserts: fetched.entities,
        removals,
        cache_entry: QueryCacheEntry {
            ids: remote_ids,
            cursor: Some(cursor.clone()),
            pulled_at: unix_millis_now(),
        },
    };
    let applied = store.apply_pull(collection, changes).await?;

    tracing::info!(
        collection,
        pulled = applied.written,
        deleted = applied.removed.len(),
        cursor = %cursor,
        "Full pull finished"
    );
    Ok(PullResult {
        mode: PullMode::Full,
        count: applied.written,
        deleted: applied.removed,
        cursor: Some(cursor),
    })
}

#[allow(clippy::too_many_arguments)]
async fn delta_pull<G: Gateway>(
    store: &LocalStore,
    remote: &Remote<G>,
    settings: &SyncSettings,
    collection: &str,
    query: &Query,
    signature: String,
    cached: QueryCacheEntry,
    cancel: &CancellationToken,
) -> Result<PullResult> {
    let (remote_stamps, request_start) = remote.find_modified(collection, query, cancel).await?;
    let remote_ids = remote_stamps.keys().cloned().collect::<BTreeSet<_>>();
    let local_stamps = store.modified_at(collection, &remote_ids).await?;

    let changed = remote_stamps
        .iter()
        .filter(|(id, stamp)| local_stamps.get(*id) != Some(*stamp))
        .map(|(id, _)| id.clone())
        .collect::<Vec<_>>();
    let removals = cached
        .ids
        .difference(&remote_ids)
        .cloned()
        .collect::<BTreeSet<_>>();

    let chunk_size = settings.max_ids_per_request.max(1);
    let mut upserts = Vec::with_capacity(changed.len());
    for chunk in changed.chunks(chunk_size) {
        upserts.extend(remote.find_by_ids(collection, chunk, cancel).await?);
    }
    tracing::debug!(
        collection,
        remote = remote_ids.len(),
        changed = changed.len(),
        removed = removals.len(),
        chunks = changed.len().div_ceil(chunk_size),
        "Delta computed"
    );

    let cursor = request_start.unwrap_or_else(timestamp_now);
    let changes = PullChanges {
        signature,
        upserts,
        removals,
        cache_entry: QueryCacheEntry {
            ids: remote_ids,
            cursor: Some(cursor.clone()),
            pulled_at: unix_millis_now(),
        },
    };
    let applied = store.apply_pull(collection, changes).await?;

    tracing::info!(
        collection,
        pulled = applied.written,
        deleted = applied.removed.len(),
        cursor = %cursor,
        "Delta pull finished"
    );
    Ok(PullResult {
        mode: PullMode::Delta,
        count: applied.written,
        deleted: applied.removed,
        cursor: Some(cursor),
    })
}

/// The subset of `candidates` the remote no longer has.
async fn confirm_missing<G: Gateway>(
    remote: &Remote<G>,
    settings: &SyncSettings,
    collection: &str,
    candidates: BTreeSet<String>,
    cancel: &CancellationToken,
) -> Result<BTreeSet<String>> {
    let candidates = candidates.into_iter().collect::<Vec<_>>();
    let mut missing = BTreeSet::new();
    for chunk in candidates.chunks(settings.max_ids_per_request.max(1)) {
        let found = ids_of(&remote.find_by_ids(collection, chunk, cancel).await?);
        missing.extend(chunk.iter().filter(|id| !found.contains(*id)).cloned());
    }
    Ok(missing)
}

fn ids_of(entities: &[Entity]) -> BTreeSet<String> {
    entities
        .iter()
        .filter_map(|entity| entity.id().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(cursor: Option<&str>, pulled_at: i64) -> QueryCacheEntry {
        QueryCacheEntry {
            ids: BTreeSet::new(),
            cursor: cursor.map(str::to_string),
            pulled_at,
        }
    }

    #[test]
    fn delta_needs_a_cursor() {
        let settings = SyncSettings::default();
        let query = Query::new();
        assert_eq!(
            choose_mode(&query, None, true, &settings, 1_000),
            Err(FullReason::NoCursor)
        );
        assert_eq!(
            choose_mode(&query, Some(&entry(None, 1_000)), true, &settings, 1_000),
            Err(FullReason::NoCursor)
        );
        assert_eq!(
            choose_mode(&query, Some(&entry(Some("c"), 1_000)), true, &settings, 1_000),
            Ok(())
        );
    }

    #[test]
    fn paged_queries_never_use_delta() {
        let settings = SyncSettings::default();
        let cached = entry(Some("c"), 1_000);
        for query in [Query::new().skip(10), Query::new().limit(5)] {
            assert_eq!(
                choose_mode(&query, Some(&cached), true, &settings, 1_000),
                Err(FullReason::Paged)
            );
        }
    }

    #[test]
    fn disabled_delta_forces_full() {
        let cached = entry(Some("c"), 1_000);
        let query = Query::new();
        assert_eq!(
            choose_mode(&query, Some(&cached), false, &SyncSettings::default(), 1_000),
            Err(FullReason::DeltaDisabled)
        );
        let settings = SyncSettings::default().with_delta_enabled(false);
        assert_eq!(
            choose_mode(&query, Some(&cached), true, &settings, 1_000),
            Err(FullReason::DeltaDisabled)
        );
    }

    #[test]
    fn stale_cursor_forces_full() {
        let settings = SyncSettings::default().with_max_cursor_age(Some(Duration::from_secs(60)));
        let cached = entry(Some("c"), 0);
        let query = Query::new();
        assert_eq!(
            choose_mode(&query, Some(&cached), true, &settings, 60_000),
            Ok(())
        );
        assert_eq!(
            choose_mode(&query, Some(&cached), true, &settings, 60_001),
            Err(FullReason::CursorExpired)
        );

        let unbounded = settings.with_max_cursor_age(None);
        assert_eq!(
            choose_mode(&query, Some(&cached), true, &unbounded, i64::MAX),
            Ok(())
        );
    }
}
