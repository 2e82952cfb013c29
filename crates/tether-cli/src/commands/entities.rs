use std::path::Path;

use tether_core::LocalStore;

use crate::cli::QueryArgs;
use crate::commands::common::{
    build_query, format_entity_lines, normalize_collection, normalize_identifier, open_store,
    resolve_entity,
};
use crate::error::CliError;

pub async fn run_save(
    collection: &str,
    entity: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let collection = normalize_collection(collection)?;
    let entity = resolve_entity(entity)?;
    let store = open_store(db_path).await?;

    let saved = store.save(&collection, entity).await?;
    println!("{}", saved.id().unwrap_or_default());
    Ok(())
}

pub async fn run_get(collection: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let collection = normalize_collection(collection)?;
    let id = normalize_identifier(id, CliError::EmptyId)?;
    let store = open_store(db_path).await?;

    let entity = store
        .find_by_id(&collection, &id)
        .await?
        .ok_or_else(|| CliError::NotFound(format!("{collection}/{id}")))?;
    println!("{}", serde_json::to_string_pretty(&entity)?);
    Ok(())
}

pub async fn run_find(
    collection: &str,
    query: &QueryArgs,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let collection = normalize_collection(collection)?;
    let query = build_query(query)?;
    let store = open_store(db_path).await?;
    let entities = store.find(&collection, &query).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entities)?);
    } else {
        for line in format_entity_lines(&entities) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_remove(
    collection: &str,
    id: Option<&str>,
    filter: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let collection = normalize_collection(collection)?;
    let store = open_store(db_path).await?;

    if let Some(id) = id {
        let id = normalize_identifier(id, CliError::EmptyId)?;
        if !store.remove(&collection, &id).await? {
            return Err(CliError::NotFound(format!("{collection}/{id}")));
        }
        println!("Removed {collection}/{id}");
        return Ok(());
    }

    let query = build_query(&QueryArgs {
        filter: filter.map(str::to_string),
        ..QueryArgs::default()
    })?;
    let removed = store.remove_by_query(&collection, &query).await?;
    println!("Removed {removed} entities from {collection}");
    Ok(())
}

pub async fn run_pending(
    collection: Option<&str>,
    verbose: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let collections = match collection {
        Some(collection) => vec![normalize_collection(collection)?],
        None => store.collections_with_pending().await?.into_iter().collect(),
    };

    if collections.is_empty() {
        println!("No pending changes.");
        return Ok(());
    }

    for collection in &collections {
        print_pending(&store, collection, verbose).await?;
    }
    Ok(())
}

async fn print_pending(store: &LocalStore, collection: &str, verbose: bool) -> Result<(), CliError> {
    let count = store.pending_count(Some(collection)).await?;
    println!("{collection}: {count} pending");
    if verbose {
        for entry in store.pending(collection).await? {
            let operation = if entry.marker.is_delete() { "delete" } else { "save" };
            println!(
                "  {:<6}  {}  known={}",
                operation,
                entry.entity_id,
                entry.marker.known_modified_at().unwrap_or("-")
            );
        }
    }
    Ok(())
}

pub async fn run_clear(collection: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    match collection {
        Some(collection) => {
            let collection = normalize_collection(collection)?;
            let pending = store.pending_count(Some(&collection)).await?;
            store.clear(&collection).await?;
            println!("Cleared {collection} ({pending} pending changes dropped)");
        }
        None => {
            store.clear_all().await?;
            println!("Cleared every collection");
        }
    }
    Ok(())
}
