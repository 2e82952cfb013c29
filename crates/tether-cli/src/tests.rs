use std::path::PathBuf;

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::json;
use tether_core::{ConflictResolution, Entity, LocalStore, Query, SyncConflict};

use crate::cli::{Cli, Commands, CompletionShell, ConflictMode, QueryArgs};
use crate::commands::common::{
    build_query, entity_preview, format_relative_time, format_sync_conflict_lines,
    format_sync_timestamp, normalize_collection, parse_entity,
};
use crate::commands::completions::render_completions;
use crate::commands::config::{merge_profile, missing_fields, validate_profile, ProfileValues};
use crate::commands::entities::{run_clear, run_remove, run_save};
use crate::config_profiles::CliProfile;
use crate::error::CliError;

fn test_db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("tether-cli-test.db")
}

#[test]
fn parses_find_with_query_flags() {
    let cli = Cli::try_parse_from([
        "tether",
        "find",
        "books",
        "--filter",
        r#"{"genre":"sf"}"#,
        "--sort",
        "-year",
        "--limit",
        "5",
        "--json",
    ])
    .unwrap();

    let Commands::Find { collection, query, json } = cli.command else {
        panic!("expected find");
    };
    assert_eq!(collection, "books");
    assert!(json);
    assert_eq!(query.sort, vec!["-year".to_string()]);
    assert_eq!(query.limit, Some(5));
}

#[test]
fn parses_sync_conflict_mode() {
    let cli = Cli::try_parse_from(["tether", "sync", "books", "--on-conflict", "remote"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Sync {
            on_conflict: ConflictMode::Remote,
            full: false,
            ..
        }
    ));
}

#[test]
fn remove_requires_id_or_filter() {
    assert!(Cli::try_parse_from(["tether", "remove", "books"]).is_err());
    assert!(Cli::try_parse_from(["tether", "remove", "books", "a", "--filter", "{}"]).is_err());
    assert!(Cli::try_parse_from(["tether", "rm", "books", "--filter", "{}"]).is_ok());
}

#[test]
fn build_query_reads_filter_sort_and_paging() {
    let query = build_query(&QueryArgs {
        filter: Some(r#"{"genre":"sf"}"#.to_string()),
        sort: vec!["-year".to_string(), "title".to_string()],
        skip: Some(2),
        limit: Some(10),
    })
    .unwrap();

    let expected = Query::new()
        .equal_to("genre", "sf")
        .descending("year")
        .ascending("title")
        .skip(2)
        .limit(10);
    assert_eq!(query, expected);
}

#[test]
fn build_query_rejects_non_object_filters() {
    for filter in ["[1,2]", "{not json"] {
        let result = build_query(&QueryArgs {
            filter: Some(filter.to_string()),
            ..QueryArgs::default()
        });
        assert!(matches!(result, Err(CliError::InvalidJson("filter", _))));
    }
}

#[test]
fn parse_entity_requires_an_object() {
    let entity = parse_entity(r#"{"_id":"a","title":"Dune"}"#).unwrap();
    assert_eq!(entity.id(), Some("a"));
    assert!(parse_entity("[]").is_err());
}

#[test]
fn entity_preview_hides_system_fields_and_truncates() {
    let entity = Entity::new()
        .with_id("a")
        .with("_kmd", json!({ "lmt": "2024-01-01T00:00:00.000Z" }))
        .with("title", "A very long title that keeps going and going");

    let preview = entity_preview(&entity, 20);
    assert!(!preview.contains("_id"));
    assert_eq!(preview.chars().count(), 20);
    assert!(preview.ends_with("..."));
}

#[test]
fn normalize_collection_rejects_empty() {
    assert!(matches!(
        normalize_collection("  "),
        Err(CliError::EmptyCollection)
    ));
    assert_eq!(normalize_collection(" books ").unwrap(), "books");
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
}

#[test]
fn format_sync_timestamp_returns_utc_label() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_sync_conflict_lines_include_key_fields() {
    let conflicts = vec![SyncConflict {
        id: 1,
        collection: "books".to_string(),
        entity_id: "x".to_string(),
        known_modified_at: Some("t1".to_string()),
        remote_modified_at: Some("t2".to_string()),
        local: Entity::new().with_id("x"),
        remote: Entity::new().with_id("x"),
        detected_at: 0,
        resolution: ConflictResolution::Surfaced,
    }];

    let rendered = format_sync_conflict_lines(&conflicts);
    assert_eq!(rendered.len(), 1);
    assert!(rendered[0].contains("surfaced"));
    assert!(rendered[0].contains("books/x"));
    assert!(rendered[0].contains("known=t1 remote=t2"));
}

#[test]
fn merge_profile_prefers_explicit_then_environment() {
    let mut profile = CliProfile {
        base_url: Some("https://old.example.com".to_string()),
        app_key: Some("kid_old".to_string()),
        ..CliProfile::default()
    };
    merge_profile(
        &mut profile,
        ProfileValues {
            base_url: Some("https://new.example.com/".to_string()),
            max_cursor_age: Some(60),
            ..ProfileValues::default()
        },
        |key| (key == "TETHER_APP_SECRET").then(|| "env-secret".to_string()),
    );

    assert_eq!(profile.base_url.as_deref(), Some("https://new.example.com"));
    assert_eq!(profile.app_key.as_deref(), Some("kid_old"));
    assert_eq!(profile.app_secret.as_deref(), Some("env-secret"));
    assert_eq!(profile.max_cursor_age_secs, Some(60));
    assert!(missing_fields(&profile).is_empty());
    assert!(validate_profile(&profile).is_ok());
}

#[test]
fn validate_profile_requires_http_scheme() {
    let profile = CliProfile {
        base_url: Some("baas.example.com".to_string()),
        ..CliProfile::default()
    };
    assert!(validate_profile(&profile).is_err());
    assert_eq!(missing_fields(&profile), vec!["app_key", "app_secret"]);
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("tether"));
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn save_then_remove_leaves_a_tombstone() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = test_db_path(&dir);

    run_save("books", Some(r#"{"_id":"a","title":"Dune"}"#), &db_path)
        .await
        .unwrap();
    run_save("books", Some(r#"{"title":"Emma"}"#), &db_path)
        .await
        .unwrap();
    {
        let store = LocalStore::open_path(&db_path).await.unwrap();
        assert_eq!(store.count("books", &Query::new()).await.unwrap(), 2);
        assert_eq!(store.pending_count(Some("books")).await.unwrap(), 2);
    }

    run_remove("books", Some("a"), None, &db_path).await.unwrap();
    let missing = run_remove("books", Some("a"), None, &db_path).await;
    assert!(matches!(missing, Err(CliError::NotFound(_))));

    let store = LocalStore::open_path(&db_path).await.unwrap();
    let entry = store.pending_entry("books", "a").await.unwrap().unwrap();
    assert!(entry.marker.is_delete());
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn remove_by_filter_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = test_db_path(&dir);

    for payload in [
        r#"{"genre":"sf","title":"Dune"}"#,
        r#"{"genre":"sf","title":"Solaris"}"#,
        r#"{"genre":"romance","title":"Emma"}"#,
    ] {
        run_save("books", Some(payload), &db_path).await.unwrap();
    }

    run_remove("books", None, Some(r#"{"genre":"sf"}"#), &db_path)
        .await
        .unwrap();
    {
        let store = LocalStore::open_path(&db_path).await.unwrap();
        let left = store.find("books", &Query::new()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].get("title"), Some(&json!("Emma")));
        // Local-only entities leave no tombstones behind.
        assert_eq!(store.pending_count(Some("books")).await.unwrap(), 1);
    }

    run_clear(Some("books"), &db_path).await.unwrap();
    let store = LocalStore::open_path(&db_path).await.unwrap();
    assert_eq!(store.count("books", &Query::new()).await.unwrap(), 0);
    assert_eq!(store.pending_count(None).await.unwrap(), 0);
}

#[test]
fn save_rejects_invalid_json() {
    let result = crate::commands::common::resolve_entity(Some("{broken"));
    assert!(matches!(result, Err(CliError::InvalidJson("entity", _))));
}
