use std::time::Duration;

use clap::{CommandFactory, Parser};
use keel_core::models::{FieldChoice, SyncReport, Version};
use keel_core::remote::FileRemote;
use keel_core::SyncConfig;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::cli::{Cli, Commands, ConflictCommands};
use crate::commands::change::run_change_add;
use crate::commands::common::{
    format_relative_time, format_timestamp, normalize_identifier, open_store, parse_assignment,
    parse_assignments, parse_pick, payload_preview, short_id, unique_by_prefix,
};
use crate::commands::conflicts::{run_conflicts_resolve, ResolveChoice};
use crate::commands::entity::run_entity_show;
use crate::commands::sync::{format_sync_report, run_sync, watch_config};
use crate::error::CliError;

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn parse_assignment_reads_json_and_falls_back_to_string() {
    assert_eq!(
        parse_assignment("progress=0.5").unwrap(),
        ("progress".to_string(), json!(0.5))
    );
    assert_eq!(
        parse_assignment("title=Draft plan").unwrap(),
        ("title".to_string(), json!("Draft plan"))
    );
    assert_eq!(
        parse_assignment("title=\"42\"").unwrap(),
        ("title".to_string(), json!("42"))
    );
    assert_eq!(
        parse_assignment("tags=[\"a\",\"b\"]").unwrap(),
        ("tags".to_string(), json!(["a", "b"]))
    );
    assert_eq!(
        parse_assignment("note=").unwrap(),
        ("note".to_string(), json!(""))
    );
}

#[test]
fn parse_assignment_requires_field_name() {
    assert!(matches!(
        parse_assignment("no-equals-sign"),
        Err(CliError::InvalidAssignment(_))
    ));
    assert!(matches!(
        parse_assignment(" =1"),
        Err(CliError::InvalidAssignment(_))
    ));
}

#[test]
fn parse_assignments_rejects_duplicates_and_empty_input() {
    let payload =
        parse_assignments(&["title=Draft".to_string(), "status=null".to_string()]).unwrap();
    assert_eq!(payload.get("status"), Some(&json!(null)));

    assert!(matches!(
        parse_assignments(&["title=A".to_string(), "title=B".to_string()]),
        Err(CliError::DuplicateField(field)) if field == "title"
    ));
    assert!(matches!(parse_assignments(&[]), Err(CliError::EmptyPayload)));
}

#[test]
fn parse_pick_accepts_known_sides() {
    assert_eq!(
        parse_pick("status=server").unwrap(),
        ("status".to_string(), FieldChoice::Server)
    );
    assert_eq!(
        parse_pick("title= Local ").unwrap(),
        ("title".to_string(), FieldChoice::Local)
    );
    assert!(matches!(
        parse_pick("title=both"),
        Err(CliError::Core(keel_core::Error::Validation(_)))
    ));
}

#[test]
fn resolve_choice_from_flags() {
    assert_eq!(
        ResolveChoice::from_flags(true, false, &[]).unwrap(),
        ResolveChoice::Local
    );
    assert_eq!(
        ResolveChoice::from_flags(false, true, &[]).unwrap(),
        ResolveChoice::Server
    );

    let picks = vec!["title=local".to_string(), "status=server".to_string()];
    let ResolveChoice::Manual(selections) = ResolveChoice::from_flags(false, false, &picks).unwrap()
    else {
        panic!("expected manual choice");
    };
    assert_eq!(selections.len(), 2);
    assert_eq!(selections.get("status"), Some(&FieldChoice::Server));

    let repeated = vec!["title=local".to_string(), "title=server".to_string()];
    assert!(matches!(
        ResolveChoice::from_flags(false, false, &repeated),
        Err(CliError::DuplicateField(_))
    ));
}

#[test]
fn resolve_requires_exactly_one_strategy() {
    assert!(Cli::try_parse_from(["keel", "conflicts", "resolve", "abc"]).is_err());
    assert!(
        Cli::try_parse_from(["keel", "conflicts", "resolve", "abc", "--local", "--server"])
            .is_err()
    );

    let cli = Cli::try_parse_from([
        "keel",
        "conflicts",
        "resolve",
        "abc",
        "--pick",
        "title=local",
        "--pick",
        "status=server",
    ])
    .unwrap();
    match cli.command {
        Some(Commands::Conflicts {
            command: ConflictCommands::Resolve { pick, local, .. },
        }) => {
            assert!(!local);
            assert_eq!(pick.len(), 2);
        }
        _ => panic!("expected conflicts resolve"),
    }
}

#[test]
fn global_paths_parse_after_subcommand() {
    let cli = Cli::try_parse_from([
        "keel",
        "sync",
        "--db-path",
        "/tmp/a.db",
        "--remote",
        "/tmp/remote.json",
    ])
    .unwrap();
    assert_eq!(cli.db_path.as_deref(), Some(std::path::Path::new("/tmp/a.db")));
    assert_eq!(
        cli.remote.as_deref(),
        Some(std::path::Path::new("/tmp/remote.json"))
    );
}

#[test]
fn sync_watch_flag_parses() {
    let cli = Cli::try_parse_from(["keel", "sync", "--watch"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Commands::Sync {
            watch: true,
            command: None
        })
    ));

    let cli = Cli::try_parse_from(["keel", "sync"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Commands::Sync { watch: false, .. })
    ));
}

#[test]
fn watch_uses_configured_interval_or_default() {
    let configured = SyncConfig::default().with_sync_interval(Duration::from_secs(5));
    assert_eq!(
        watch_config(configured).sync_interval,
        Some(Duration::from_secs(5))
    );
    assert_eq!(
        watch_config(SyncConfig::default()).sync_interval,
        Some(Duration::from_secs(60))
    );
}

#[test]
fn normalize_identifier_rejects_empty() {
    assert!(matches!(
        normalize_identifier(" \n ", "Change"),
        Err(CliError::EmptyId { kind: "Change" })
    ));
    assert_eq!(normalize_identifier("  abc123  ", "Change").unwrap(), "abc123");
}

#[test]
fn unique_by_prefix_reports_missing_and_ambiguous() {
    let candidates = || {
        vec![
            ("0192aaaa-1111".to_string(), 1),
            ("0192aaaa-2222".to_string(), 2),
            ("0193bbbb-3333".to_string(), 3),
        ]
    };

    assert_eq!(unique_by_prefix("0193", "Change", candidates()).unwrap(), 3);
    assert!(matches!(
        unique_by_prefix("0192aaaa", "Change", candidates()),
        Err(CliError::AmbiguousId(message)) if message.contains("0192aaaa-1111")
    ));
    assert!(matches!(
        unique_by_prefix("ffff", "Change", candidates()),
        Err(CliError::NotFound { kind: "Change", .. })
    ));
}

#[test]
fn payload_preview_truncates_with_ellipsis() {
    let payload = parse_assignments(&["title=\"a fairly long title for a goal\"".to_string()])
        .unwrap();
    assert_eq!(payload_preview(&payload, 20), "{\"title\":\"a fairl...");
    assert_eq!(payload_preview(&payload, 200), "{\"title\":\"a fairly long title for a goal\"}");
}

#[test]
fn format_timestamp_returns_utc_label() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_relative_time_units() {
    let now = 1_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 3 * 60 * 60_000, now), "3h ago");
    assert_eq!(format_relative_time(now - 15 * 24 * 60 * 60_000, now), "2w ago");
}

#[test]
fn short_id_keeps_first_thirteen_chars() {
    assert_eq!(short_id("01929c4e-7f1a-7000-8000-000000000000"), "01929c4e-7f1a");
}

#[test]
fn sync_report_mentions_failures_only_when_present() {
    let clean = SyncReport {
        pushed: 2,
        pulled: 1,
        ..SyncReport::default()
    };
    assert_eq!(
        format_sync_report(&clean),
        "Sync completed: pushed 2, auto-merged 0, conflicts 0, pulled 1"
    );

    let failing = SyncReport {
        failed: 1,
        ..SyncReport::default()
    };
    assert!(format_sync_report(&failing).ends_with(", failed 1, exhausted 0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn entity_show_without_state_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("keel.db");

    let result = run_entity_show("goal", "missing", false, &db_path).await;
    assert!(matches!(result, Err(CliError::EntityNotFound(key)) if key == "goal/missing"));
}

#[tokio::test(flavor = "multi_thread")]
async fn change_add_defaults_base_to_last_synced_version() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote.json");
    let db_path = dir.path().join("keel.db");

    run_change_add("goal", "g1", &["title=Draft".to_string()], None, &db_path)
        .await
        .unwrap();
    run_sync(&db_path, &remote).await.unwrap();
    run_change_add("goal", "g1", &["title=Final".to_string()], None, &db_path)
        .await
        .unwrap();

    let store = open_store(&db_path).await.unwrap();
    let pending = store.claim_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].base_version, Some(Version::from("1")));
    store.release(&pending[0].id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn two_databases_reconcile_through_a_shared_remote() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote.json");
    let device_a = dir.path().join("a.db");
    let device_b = dir.path().join("b.db");

    run_change_add("goal", "g1", &["title=Draft".to_string()], None, &device_a)
        .await
        .unwrap();
    run_sync(&device_a, &remote).await.unwrap();
    run_sync(&device_b, &remote).await.unwrap();

    run_change_add("goal", "g1", &["title=From A".to_string()], None, &device_a)
        .await
        .unwrap();
    run_change_add("goal", "g1", &["title=From B".to_string()], None, &device_b)
        .await
        .unwrap();
    run_sync(&device_a, &remote).await.unwrap();
    run_sync(&device_b, &remote).await.unwrap();

    let store_b = open_store(&device_b).await.unwrap();
    let conflicts = store_b.find_unresolved(None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].field_names(), vec!["title".to_string()]);

    let prefix = short_id(&conflicts[0].id.to_string());
    run_conflicts_resolve(&prefix, &ResolveChoice::Local, &device_b, &remote)
        .await
        .unwrap();
    run_sync(&device_b, &remote).await.unwrap();

    let entity = FileRemote::new(&remote)
        .entity("goal", "g1")
        .unwrap()
        .unwrap();
    assert_eq!(entity.data.get("title"), Some(&json!("From B")));
    assert_eq!(entity.version, Version::from("3"));
    assert_eq!(store_b.count_unresolved().await.unwrap(), 0);
}
