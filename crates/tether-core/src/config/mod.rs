//! Client configuration.
//!
//! `ClientConfig` identifies the remote backend (base URL plus app
//! credentials) and carries the `SyncSettings` that bound delta pulls and
//! remote batch sizes. It can be parsed from a JSON document and overridden
//! from `TETHER_*` environment variables.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

/// Environment variable overriding the backend base URL
pub const ENV_BASE_URL: &str = "TETHER_BASE_URL";
/// Environment variable overriding the app key
pub const ENV_APP_KEY: &str = "TETHER_APP_KEY";
/// Environment variable overriding the app secret
pub const ENV_APP_SECRET: &str = "TETHER_APP_SECRET";

const DEFAULT_MAX_IDS_PER_REQUEST: usize = 200;
const DEFAULT_DELETE_CHUNK_SIZE: usize = 200;
const DEFAULT_MAX_CURSOR_AGE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Tunables for push and pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Upper bound on ids in one `_id $in [...]` fetch
    pub max_ids_per_request: usize,
    /// Whether pulls may use the delta path at all
    pub delta_enabled: bool,
    /// Cursors older than this force a full fetch; `None` trusts any cursor
    #[serde(with = "optional_secs", rename = "max_cursor_age_secs")]
    pub max_cursor_age: Option<Duration>,
    /// Per-request timeout applied by the HTTP gateway
    #[serde(with = "secs", rename = "request_timeout_secs")]
    pub request_timeout: Duration,
    /// Upper bound on ids in one batched remote delete
    pub delete_chunk_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_ids_per_request: DEFAULT_MAX_IDS_PER_REQUEST,
            delta_enabled: true,
            max_cursor_age: Some(Duration::from_secs(DEFAULT_MAX_CURSOR_AGE_SECS)),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            delete_chunk_size: DEFAULT_DELETE_CHUNK_SIZE,
        }
    }
}

impl SyncSettings {
    /// Set the id batch size for delta fetches
    #[must_use]
    pub fn with_max_ids_per_request(mut self, max: usize) -> Self {
        self.max_ids_per_request = max.max(1);
        self
    }

    /// Enable or disable delta pulls
    #[must_use]
    pub const fn with_delta_enabled(mut self, enabled: bool) -> Self {
        self.delta_enabled = enabled;
        self
    }

    /// Set the cursor staleness bound
    #[must_use]
    pub const fn with_max_cursor_age(mut self, age: Option<Duration>) -> Self {
        self.max_cursor_age = age;
        self
    }

    /// Set the HTTP request timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the batched delete chunk size
    #[must_use]
    pub fn with_delete_chunk_size(mut self, size: usize) -> Self {
        self.delete_chunk_size = size.max(1);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_ids_per_request == 0 {
            return Err(Error::Config(
                "max_ids_per_request must be at least 1".to_string(),
            ));
        }
        if self.delete_chunk_size == 0 {
            return Err(Error::Config(
                "delete_chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identifies one backend app.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Backend base URL, without trailing slash
    pub base_url: String,
    /// Application key
    pub app_key: String,
    /// Application secret
    pub app_secret: String,
    /// Sync tunables
    #[serde(default)]
    pub sync: SyncSettings,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .field("sync", &self.sync)
            .finish()
    }
}

impl ClientConfig {
    /// Build and validate a configuration
    pub fn new(
        base_url: impl Into<String>,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Result<Self> {
        Self {
            base_url: base_url.into(),
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            sync: SyncSettings::default(),
        }
        .validated()
    }

    /// Replace the sync settings
    #[must_use]
    pub fn with_sync(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    /// Build a configuration entirely from `TETHER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            normalize_text_option(lookup(key))
                .ok_or_else(|| Error::Config(format!("environment variable {key} is not set")))
        };
        Self::new(
            required(ENV_BASE_URL)?,
            required(ENV_APP_KEY)?,
            required(ENV_APP_SECRET)?,
        )
    }

    /// Override fields from `TETHER_*` environment variables when present
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Override fields from an arbitrary variable source when present
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(base_url) = normalize_text_option(lookup(ENV_BASE_URL)) {
            self.base_url = base_url;
        }
        if let Some(app_key) = normalize_text_option(lookup(ENV_APP_KEY)) {
            self.app_key = app_key;
        }
        if let Some(app_secret) = normalize_text_option(lookup(ENV_APP_SECRET)) {
            self.app_secret = app_secret;
        }
        self.validated()
    }

    fn validated(mut self) -> Result<Self> {
        let base_url = normalize_text_option(Some(self.base_url))
            .ok_or_else(|| Error::Config("base_url is required".to_string()))?;
        if !is_http_url(&base_url) {
            return Err(Error::Config(
                "base_url must include http:// or https://".to_string(),
            ));
        }
        self.base_url = base_url.trim_end_matches('/').to_string();
        self.app_key = normalize_text_option(Some(self.app_key))
            .ok_or_else(|| Error::Config("app_key is required".to_string()))?;
        self.app_secret = normalize_text_option(Some(self.app_secret))
            .ok_or_else(|| Error::Config("app_secret is required".to_string()))?;
        self.sync.validate()?;
        Ok(self)
    }
}

/// Parse a client configuration from a JSON document.
pub fn parse_client_config(payload: &str) -> Result<ClientConfig> {
    let config: ClientConfig = serde_json::from_str(payload)
        .map_err(|error| Error::Config(format!("invalid client config JSON: {error}")))?;
    config.validated()
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn parse_applies_sync_defaults() {
        let config = parse_client_config(
            r#"{"base_url": "https://baas.example.com/", "app_key": "kid_1", "app_secret": "s3cret"}"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://baas.example.com");
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.sync.max_ids_per_request, 200);
        assert_eq!(config.sync.max_cursor_age, Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn parse_reads_sync_overrides() {
        let config = parse_client_config(
            r#"{
                "base_url": "http://localhost:8080",
                "app_key": "kid_1",
                "app_secret": "s3cret",
                "sync": {"delta_enabled": false, "max_cursor_age_secs": null, "max_ids_per_request": 50}
            }"#,
        )
        .unwrap();
        assert!(!config.sync.delta_enabled);
        assert_eq!(config.sync.max_cursor_age, None);
        assert_eq!(config.sync.max_ids_per_request, 50);
    }

    #[test]
    fn parse_rejects_unknown_fields_and_bad_urls() {
        let error = parse_client_config(
            r#"{"base_url": "https://x", "app_key": "k", "app_secret": "s", "extra": 1}"#,
        )
        .unwrap_err();
        assert!(error.to_string().contains("unknown field"));

        let error = parse_client_config(r#"{"base_url": "baas.example.com", "app_key": "k", "app_secret": "s"}"#)
            .unwrap_err();
        assert!(error.to_string().contains("http://"));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = ClientConfig::new("https://x", "kid", "hunter2").unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn env_lookup_builds_and_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_BASE_URL, "https://env.example.com"),
            (ENV_APP_KEY, "kid_env"),
            (ENV_APP_SECRET, "secret_env"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| vars.get(key).map(ToString::to_string);

        let config = ClientConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.app_key, "kid_env");

        let base = ClientConfig::new("https://file.example.com", "kid_file", "s").unwrap();
        let overridden = base
            .with_overrides(|key| (key == ENV_APP_KEY).then(|| "kid_override".to_string()))
            .unwrap();
        assert_eq!(overridden.app_key, "kid_override");
        assert_eq!(overridden.base_url, "https://file.example.com");
    }

    #[test]
    fn missing_env_is_config_error() {
        let error = ClientConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(error, Error::Config(message) if message.contains(ENV_BASE_URL)));
    }
}
