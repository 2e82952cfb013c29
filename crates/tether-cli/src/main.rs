//! Tether CLI - operate a local offline store against a backend from the terminal

mod cli;
mod commands;
mod config_profiles;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::entities::{
    run_clear, run_find, run_get, run_pending, run_remove, run_save,
};
use crate::commands::sync::{run_conflicts, run_pull, run_push, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Save { collection, entity } => {
            run_save(&collection, entity.as_deref(), &db_path).await?;
        }
        Commands::Get { collection, id } => run_get(&collection, &id, &db_path).await?,
        Commands::Find {
            collection,
            query,
            json,
        } => run_find(&collection, &query, json, &db_path).await?,
        Commands::Remove {
            collection,
            id,
            filter,
        } => run_remove(&collection, id.as_deref(), filter.as_deref(), &db_path).await?,
        Commands::Push {
            collection,
            on_conflict,
        } => run_push(collection.as_deref(), on_conflict, &db_path, profile).await?,
        Commands::Pull {
            collection,
            query,
            full,
        } => run_pull(&collection, &query, full, &db_path, profile).await?,
        Commands::Sync {
            collection,
            on_conflict,
            full,
        } => run_sync(collection.as_deref(), on_conflict, full, &db_path, profile).await?,
        Commands::Pending {
            collection,
            verbose,
        } => run_pending(collection.as_deref(), verbose, &db_path).await?,
        Commands::Conflicts {
            collection,
            limit,
            json,
        } => run_conflicts(collection.as_deref(), limit, json, &db_path).await?,
        Commands::Clear { collection, all: _ } => run_clear(collection.as_deref(), &db_path).await?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
        Commands::Config { command } => run_config(command, profile)?,
    }

    Ok(())
}
