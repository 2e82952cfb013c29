use std::path::Path;

use tether_core::{PullOptions, PushResult, SyncResult};
use tokio_util::sync::CancellationToken;

use crate::cli::{ConflictMode, QueryArgs};
use crate::commands::common::{
    build_query, format_sync_conflict_lines, normalize_collection, open_engine, open_store,
    sync_conflict_to_item, SyncConflictItem,
};
use crate::error::CliError;

/// Token cancelled on Ctrl-C so an interrupted pull writes nothing.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling remote calls");
            trigger.cancel();
        }
    });
    cancel
}

pub async fn run_push(
    collection: Option<&str>,
    conflicts: ConflictMode,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, conflicts).await?;

    if let Some(collection) = collection {
        let collection = normalize_collection(collection)?;
        let result = engine.push_with(&collection, &interrupt_token()).await?;
        print_push(&result);
        return Ok(());
    }

    let results = engine.push_all().await?;
    if results.is_empty() {
        println!("Nothing to push.");
    }
    for (collection, result) in results {
        match result {
            Ok(result) => print_push(&result),
            Err(error) => println!("{collection}: push failed: {error}"),
        }
    }
    Ok(())
}

pub async fn run_pull(
    collection: &str,
    query: &QueryArgs,
    full: bool,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let collection = normalize_collection(collection)?;
    let query = build_query(query)?;
    let engine = open_engine(db_path, profile, ConflictMode::Surface).await?;

    let result = engine
        .pull(&collection, &query, pull_options(full))
        .await?;
    println!(
        "{collection}: {} pull, {} pulled, {} deleted",
        result.mode,
        result.count,
        result.deleted.len()
    );
    Ok(())
}

pub async fn run_sync(
    collection: Option<&str>,
    conflicts: ConflictMode,
    full: bool,
    db_path: &Path,
    profile: Option<&str>,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, profile, conflicts).await?;

    if let Some(collection) = collection {
        let collection = normalize_collection(collection)?;
        let result = engine
            .sync(&collection, &tether_core::Query::new(), pull_options(full))
            .await?;
        print_sync(&result);
        result.pull?;
        return Ok(());
    }

    let results = engine.sync_all(pull_options(full)).await?;
    if results.is_empty() {
        println!("No collections with pending changes.");
    }
    let mut failed = 0usize;
    for (collection, result) in results {
        match result {
            Ok(result) => {
                if !result.is_complete() {
                    failed += 1;
                }
                print_sync(&result);
            }
            Err(error) => {
                failed += 1;
                println!("{collection}: sync failed: {error}");
            }
        }
    }
    if failed > 0 {
        tracing::warn!(failed, "Some collections did not sync");
    }
    Ok(())
}

pub async fn run_conflicts(
    collection: Option<&str>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let conflicts = store.list_conflicts(collection, limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

fn pull_options(full: bool) -> PullOptions {
    let options = if full {
        PullOptions::full()
    } else {
        PullOptions::default()
    };
    options.with_cancel(interrupt_token())
}

fn print_push(result: &PushResult) {
    println!(
        "{}: {} committed, {} still pending, {} conflicts",
        result.collection,
        result.committed.len(),
        result.canceled.len(),
        result.conflicts.len()
    );
    for (local_id, remote_id) in &result.created {
        println!("  created {local_id} -> {remote_id}");
    }
    for failure in &result.errors {
        println!("  failed ({} ids): {}", failure.ids.len(), failure.error);
    }
}

fn print_sync(result: &SyncResult) {
    print_push(&result.push);
    match &result.pull {
        Ok(pull) => println!(
            "{}: {} pull, {} pulled, {} deleted",
            result.push.collection,
            pull.mode,
            pull.count,
            pull.deleted.len()
        ),
        Err(error) => println!("{}: pull failed: {error}", result.push.collection),
    }
}
