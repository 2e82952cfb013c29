use std::env;

use tether_core::config::{ENV_APP_KEY, ENV_APP_SECRET, ENV_BASE_URL};
use tether_core::util::{is_http_url, normalize_text_option};

use crate::cli::ConfigCommands;
use crate::config_profiles::{CliProfile, CliProfilesConfig};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, global_profile: Option<&str>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            profile,
            base_url,
            app_key,
            app_secret,
            max_cursor_age,
            no_activate,
        } => run_config_init(
            profile.as_deref().or(global_profile),
            ProfileValues {
                base_url,
                app_key,
                app_secret,
                max_cursor_age,
            },
            no_activate,
        ),
        ConfigCommands::Show { profile } => run_config_show(profile.as_deref().or(global_profile)),
    }
}

/// Values given on the command line for `config init`
#[derive(Debug, Default)]
pub struct ProfileValues {
    pub base_url: Option<String>,
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    pub max_cursor_age: Option<u64>,
}

pub fn run_config_init(
    profile_name: Option<&str>,
    values: ProfileValues,
    no_activate: bool,
) -> Result<(), CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);

    let profile = config.profile_mut_or_default(&profile_name);
    merge_profile(profile, values, |key| env::var(key).ok());
    validate_profile(profile)?;

    if !no_activate {
        config.active_profile = Some(profile_name.clone());
    }

    let path = config.save().map_err(CliError::Config)?;
    println!(
        "Profile '{}' initialized at {}",
        profile_name,
        path.display()
    );

    let profile = config
        .profiles
        .get(&profile_name)
        .ok_or_else(|| CliError::Config("Failed to persist profile".to_string()))?;
    let missing_fields = missing_fields(profile);
    if missing_fields.is_empty() {
        println!("Profile '{profile_name}' is ready. Run `tether sync` to synchronize.");
    } else {
        println!(
            "Profile '{}' is missing: {}",
            profile_name,
            missing_fields.join(", ")
        );
    }

    Ok(())
}

fn run_config_show(profile_name: Option<&str>) -> Result<(), CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);
    let profile = config.profile(&profile_name).cloned().unwrap_or_default();

    println!("profile: {profile_name}");
    match profile.client_config(|key| env::var(key).ok()) {
        Ok(client) => println!("{client:#?}"),
        Err(error) => println!("incomplete: {error}"),
    }
    Ok(())
}

/// Explicit values win, then `TETHER_*` variables, then what the profile already has.
pub fn merge_profile(
    profile: &mut CliProfile,
    values: ProfileValues,
    env: impl Fn(&str) -> Option<String>,
) {
    let merge = |explicit: Option<String>, key: &str, existing: Option<String>| {
        normalize_text_option(explicit)
            .or_else(|| normalize_text_option(env(key)))
            .or(existing)
    };
    profile.base_url = merge(values.base_url, ENV_BASE_URL, profile.base_url.take())
        .map(|url| url.trim_end_matches('/').to_string());
    profile.app_key = merge(values.app_key, ENV_APP_KEY, profile.app_key.take());
    profile.app_secret = merge(values.app_secret, ENV_APP_SECRET, profile.app_secret.take());
    if values.max_cursor_age.is_some() {
        profile.max_cursor_age_secs = values.max_cursor_age;
    }
}

pub fn validate_profile(profile: &CliProfile) -> Result<(), CliError> {
    if let Some(url) = profile.base_url.as_deref() {
        if !is_http_url(url) {
            return Err(CliError::Config(
                "base_url must include http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn missing_fields(profile: &CliProfile) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if profile.base_url.is_none() {
        missing.push("base_url");
    }
    if profile.app_key.is_none() {
        missing.push("app_key");
    }
    if profile.app_secret.is_none() {
        missing.push("app_secret");
    }
    missing
}
