use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tether_core::network::AppCredentials;
use tether_core::sync::{PreferLocal, PreferRemote};
use tether_core::util::{compact_text, unix_millis_now};
use tether_core::{
    Entity, HttpGateway, LocalStore, Query, Remote, SyncConflict, SyncEngine,
};

use crate::cli::{ConflictMode, QueryArgs};
use crate::config_profiles::CliProfilesConfig;
use crate::error::CliError;

const DB_PATH_ENV: &str = "TETHER_DB_PATH";
const PREVIEW_CHARS: usize = 60;

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub collection: String,
    pub entity_id: String,
    pub known_modified_at: Option<String>,
    pub remote_modified_at: Option<String>,
    pub detected_at: i64,
    pub detected_at_iso: String,
    pub resolution: String,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(DB_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("tether.db")
}

pub async fn open_store(path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(path.to_path_buf()).await?)
}

/// Local store plus a remote built from the selected profile and `TETHER_*` variables.
pub async fn open_engine(
    path: &Path,
    profile: Option<&str>,
    conflicts: ConflictMode,
) -> Result<SyncEngine<HttpGateway>, CliError> {
    let profiles = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = profiles.resolve_profile_name(profile);
    let config = profiles
        .profile(&profile_name)
        .cloned()
        .unwrap_or_default()
        .client_config(|key| env::var(key).ok())
        .map_err(|error| match error {
            tether_core::Error::Config(_) => CliError::NotConfigured,
            other => CliError::Core(other),
        })?;

    let gateway = HttpGateway::new(&config.base_url, config.sync.request_timeout)?;
    let credentials = AppCredentials::new(&config.app_key, &config.app_secret);
    let remote = Remote::new(gateway, Arc::new(credentials), config.app_key.clone());
    let store = open_store(path).await?;
    tracing::debug!(profile = %profile_name, base_url = %config.base_url, "Opened sync engine");

    let engine = SyncEngine::new(store, remote, config.sync);
    Ok(match conflicts {
        ConflictMode::Surface => engine,
        ConflictMode::Local => engine.with_conflict_policy(PreferLocal),
        ConflictMode::Remote => engine.with_conflict_policy(PreferRemote),
    })
}

pub fn normalize_identifier(value: &str, empty: CliError) -> Result<String, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(empty)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn normalize_collection(value: &str) -> Result<String, CliError> {
    normalize_identifier(value, CliError::EmptyCollection)
}

pub fn build_query(args: &QueryArgs) -> Result<Query, CliError> {
    let mut query = match args.filter.as_deref().map(str::trim) {
        None | Some("") => Query::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(filter)) => Query::from_filter(filter),
            Ok(_) => {
                return Err(CliError::InvalidJson(
                    "filter",
                    "expected a JSON object".to_string(),
                ))
            }
            Err(error) => return Err(CliError::InvalidJson("filter", error.to_string())),
        },
    };

    for field in &args.sort {
        query = match field.strip_prefix('-') {
            Some(field) => query.descending(field),
            None => query.ascending(field),
        };
    }
    if let Some(skip) = args.skip {
        query = query.skip(skip);
    }
    if let Some(limit) = args.limit {
        query = query.limit(limit);
    }
    Ok(query)
}

/// Entity from the argument, or from piped stdin when absent.
pub fn resolve_entity(input: Option<&str>) -> Result<Entity, CliError> {
    let raw = match input.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => raw.to_string(),
        None => read_piped_stdin()?.ok_or(CliError::EmptyEntity)?,
    };
    parse_entity(&raw)
}

pub fn parse_entity(raw: &str) -> Result<Entity, CliError> {
    let value = serde_json::from_str::<Value>(raw)
        .map_err(|error| CliError::InvalidJson("entity", error.to_string()))?;
    Entity::from_value(value).map_err(|error| CliError::InvalidJson("entity", error.to_string()))
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    let trimmed = buffer.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

pub fn format_entity_lines(entities: &[Entity]) -> Vec<String> {
    let now_ms = unix_millis_now();
    entities
        .iter()
        .map(|entity| {
            let id = entity.id().unwrap_or("-");
            let state = if entity.is_local() {
                "local".to_string()
            } else {
                entity
                    .last_modified_at()
                    .and_then(tether_core::util::parse_timestamp)
                    .map_or_else(
                        || "-".to_string(),
                        |time| format_relative_time(time.timestamp_millis(), now_ms),
                    )
            };
            format!("{id:<36}  {state:<10}  {}", entity_preview(entity, PREVIEW_CHARS))
        })
        .collect()
}

/// Attributes without the system fields, squashed onto one line.
pub fn entity_preview(entity: &Entity, max_chars: usize) -> String {
    let attributes = entity
        .as_map()
        .iter()
        .filter(|(key, _)| !key.starts_with('_'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<serde_json::Map<_, _>>();
    let collapsed = compact_text(&Value::Object(attributes).to_string());

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        collection: conflict.collection.clone(),
        entity_id: conflict.entity_id.clone(),
        known_modified_at: conflict.known_modified_at.clone(),
        remote_modified_at: conflict.remote_modified_at.clone(),
        detected_at: conflict.detected_at,
        detected_at_iso: format_sync_timestamp(conflict.detected_at),
        resolution: conflict.resolution.as_str().to_string(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<11}  {}/{}  known={} remote={}",
                format_sync_timestamp(conflict.detected_at),
                conflict.resolution.as_str(),
                conflict.collection,
                conflict.entity_id,
                conflict.known_modified_at.as_deref().unwrap_or("-"),
                conflict.remote_modified_at.as_deref().unwrap_or("-")
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}
