//! Persistent CLI profile configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::config::{ENV_APP_KEY, ENV_APP_SECRET, ENV_BASE_URL};
use tether_core::util::normalize_text_option;
use tether_core::{ClientConfig, SyncSettings};

const CONFIG_FILE_NAME: &str = "cli-config.json";
const PROFILE_ENV: &str = "TETHER_PROFILE";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub app_key: Option<String>,
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub max_cursor_age_secs: Option<u64>,
}

impl std::fmt::Debug for CliProfile {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CliProfile")
            .field("base_url", &self.base_url)
            .field("app_key", &self.app_key)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("max_cursor_age_secs", &self.max_cursor_age_secs)
            .finish()
    }
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join(CONFIG_FILE_NAME)
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path();
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    error
                )
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)
            .map_err(|error| format!("Failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("Failed to write config at {}: {}", path.display(), error))
    }

    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        if let Some(profile) = normalize_profile_name(explicit) {
            return profile;
        }
        if let Some(profile) = normalize_profile_name(std::env::var(PROFILE_ENV).ok().as_deref()) {
            return profile;
        }
        if let Some(profile) = normalize_profile_name(self.active_profile.as_deref()) {
            return profile;
        }
        "default".to_string()
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    pub fn profile_mut_or_default(&mut self, name: &str) -> &mut CliProfile {
        self.profiles.entry(name.to_string()).or_default()
    }

    fn normalize(&mut self) {
        self.active_profile = normalize_profile_name(self.active_profile.as_deref());
        for profile in self.profiles.values_mut() {
            profile.normalize();
        }
    }
}

impl CliProfile {
    /// Client configuration for this profile; variables from `env` win.
    pub fn client_config(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> tether_core::Result<ClientConfig> {
        let config = ClientConfig::from_lookup(|key| {
            normalize_text_option(env(key)).or_else(|| self.value_for(key))
        })?;
        let mut sync = SyncSettings::default();
        if let Some(secs) = self.max_cursor_age_secs {
            sync = sync.with_max_cursor_age(Some(Duration::from_secs(secs)));
        }
        Ok(config.with_sync(sync))
    }

    fn value_for(&self, key: &str) -> Option<String> {
        match key {
            ENV_BASE_URL => self.base_url.clone(),
            ENV_APP_KEY => self.app_key.clone(),
            ENV_APP_SECRET => self.app_secret.clone(),
            _ => None,
        }
    }

    fn normalize(&mut self) {
        self.base_url = normalize_text_option(self.base_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.app_key = normalize_text_option(self.app_key.take());
        self.app_secret = normalize_text_option(self.app_secret.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CliProfile {
        CliProfile {
            base_url: Some("https://baas.example.com".to_string()),
            app_key: Some("kid_profile".to_string()),
            app_secret: Some("profile-secret".to_string()),
            max_cursor_age_secs: Some(600),
        }
    }

    #[test]
    fn normalize_profile_name_rejects_empty() {
        assert_eq!(normalize_profile_name(None), None);
        assert_eq!(normalize_profile_name(Some(" ")), None);
        assert_eq!(normalize_profile_name(Some(" work ")), Some("work".to_string()));
    }

    #[test]
    fn config_roundtrip_preserves_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = CliProfilesConfig {
            version: 1,
            active_profile: Some(" default ".to_string()),
            profiles: BTreeMap::new(),
        };
        config.profiles.insert(
            "default".to_string(),
            CliProfile {
                base_url: Some(" https://baas.example.com/ ".to_string()),
                app_key: Some(" kid_1 ".to_string()),
                app_secret: Some("secret".to_string()),
                max_cursor_age_secs: None,
            },
        );

        config.save_to_path(&path).unwrap();
        let loaded = CliProfilesConfig::load_from_path(&path).unwrap();
        let profile = loaded.profile("default").unwrap();
        assert_eq!(loaded.active_profile.as_deref(), Some("default"));
        assert_eq!(profile.base_url.as_deref(), Some("https://baas.example.com"));
        assert_eq!(profile.app_key.as_deref(), Some("kid_1"));
    }

    #[test]
    fn missing_file_loads_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliProfilesConfig::load_from_path(&dir.path().join("absent.json")).unwrap();
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn resolve_profile_name_prefers_explicit_then_active() {
        let config = CliProfilesConfig {
            version: 1,
            active_profile: Some("work".to_string()),
            profiles: BTreeMap::new(),
        };
        assert_eq!(config.resolve_profile_name(Some("mobile")), "mobile");
        assert_eq!(config.resolve_profile_name(None), "work");
    }

    #[test]
    fn client_config_prefers_environment_values() {
        let config = profile()
            .client_config(|key| (key == ENV_APP_KEY).then(|| "kid_env".to_string()))
            .unwrap();
        assert_eq!(config.app_key, "kid_env");
        assert_eq!(config.app_secret, "profile-secret");
        assert_eq!(config.sync.max_cursor_age, Some(Duration::from_secs(600)));
    }

    #[test]
    fn client_config_requires_every_field() {
        let incomplete = CliProfile {
            app_secret: None,
            ..profile()
        };
        assert!(incomplete.client_config(|_| None).is_err());
    }

    #[test]
    fn debug_output_hides_secret() {
        let rendered = format!("{:?}", profile());
        assert!(!rendered.contains("profile-secret"));
    }
}
