use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Offline cache and delta sync for backend collections")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name holding the backend configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save an entity locally (JSON argument or stdin)
    Save {
        /// Collection name
        collection: String,
        /// Entity JSON; read from stdin when omitted
        entity: Option<String>,
    },
    /// Print one locally stored entity
    Get {
        /// Collection name
        collection: String,
        /// Entity id
        id: String,
    },
    /// Query locally stored entities
    Find {
        /// Collection name
        collection: String,
        #[command(flatten)]
        query: QueryArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove entities locally; the removal is pushed on the next sync
    #[command(alias = "rm")]
    Remove {
        /// Collection name
        collection: String,
        /// Entity id
        #[arg(required_unless_present = "filter", conflicts_with = "filter")]
        id: Option<String>,
        /// Remove every entity matching this filter document
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
    },
    /// Push pending local changes
    Push {
        /// Collection name (every collection with pending changes when omitted)
        collection: Option<String>,
        /// How to resolve conflicts
        #[arg(long, value_enum, default_value_t = ConflictMode::Surface)]
        on_conflict: ConflictMode,
    },
    /// Pull remote changes for a query
    Pull {
        /// Collection name
        collection: String,
        #[command(flatten)]
        query: QueryArgs,
        /// Skip the delta path and fetch everything
        #[arg(long)]
        full: bool,
    },
    /// Push then pull
    Sync {
        /// Collection name (every collection with pending changes when omitted)
        collection: Option<String>,
        /// How to resolve conflicts
        #[arg(long, value_enum, default_value_t = ConflictMode::Surface)]
        on_conflict: ConflictMode,
        /// Skip the delta path and fetch everything
        #[arg(long)]
        full: bool,
    },
    /// Show pending change counts
    Pending {
        /// Collection name (all collections when omitted)
        collection: Option<String>,
        /// List the pending entries
        #[arg(short, long)]
        verbose: bool,
    },
    /// List recorded sync conflicts
    Conflicts {
        /// Restrict to one collection
        #[arg(long)]
        collection: Option<String>,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop local data, caches and pending changes
    Clear {
        /// Collection name
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        collection: Option<String>,
        /// Clear every collection
        #[arg(long)]
        all: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Query flags shared by `find` and `pull`
#[derive(Args, Debug, Clone, Default)]
pub struct QueryArgs {
    /// Filter document, e.g. '{"genre":"sf"}'
    #[arg(long, value_name = "JSON")]
    pub filter: Option<String>,
    /// Sort field; prefix with '-' for descending
    #[arg(long, value_name = "FIELD", allow_hyphen_values = true)]
    pub sort: Vec<String>,
    /// Entities to skip
    #[arg(long)]
    pub skip: Option<usize>,
    /// Maximum number of entities
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConflictMode {
    /// Report conflicts and keep changes pending
    Surface,
    /// Overwrite the remote copy
    Local,
    /// Take the remote copy
    Remote,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update a profile
    Init {
        /// Profile name to initialize
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
        /// Backend base URL
        #[arg(long, value_name = "URL")]
        base_url: Option<String>,
        /// App key
        #[arg(long, value_name = "KEY")]
        app_key: Option<String>,
        /// App secret
        #[arg(long, value_name = "SECRET")]
        app_secret: Option<String>,
        /// Maximum cursor age in seconds before pulls fall back to a full fetch
        #[arg(long, value_name = "SECS")]
        max_cursor_age: Option<u64>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Show the resolved configuration of a profile
    Show {
        /// Profile name
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
    },
}
