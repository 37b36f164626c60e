//! Drives the CLI commands against a temporary data directory.

use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;
use warden_cli::app::{self, Overrides, ARTIFACTS_FILE};
use warden_cli::commands;

fn setup() -> (TempDir, Overrides) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    std::fs::create_dir_all(root.join("work")).unwrap();

    let registry = json!({"capabilities": {
        "file.write_scoped": {
            "tier": "approval_required",
            "allowed_roots": ["work"]
        },
        "legacy.exec": {
            "tier": "disabled",
            "kind": "command"
        }
    }});
    std::fs::write(root.join("capabilities.json"), registry.to_string()).unwrap();

    let config = json!({ "lock_timeout_ms": 500 });
    std::fs::write(root.join("config.json"), config.to_string()).unwrap();

    let overrides = Overrides {
        config: Some(root.join("config.json")),
        data_dir: Some(root.join("data")),
        registry: Some(root.join("capabilities.json")),
    };
    (tmp, overrides)
}

fn json_lines(out: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(out)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn work(tmp: &TempDir) -> std::path::PathBuf {
    tmp.path().canonicalize().unwrap().join("work")
}

#[tokio::test]
async fn repl_runs_a_full_turn_sequence() {
    let (tmp, overrides) = setup();
    let config = app::load_config(&overrides).unwrap();
    let protocol = app::open_protocol(&config).unwrap();
    let target = work(&tmp).join("notes.txt");

    let input = format!(
        "# comment\n\npropose file.write_scoped write {} hello\napprove\n",
        target.display()
    );
    let mut out = Vec::new();
    commands::repl(&protocol, "ops", input.as_bytes(), true, &mut out)
        .await
        .unwrap();

    let lines = json_lines(&out);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["artifact"]["type"], "proposal_action");
    assert_eq!(lines[1]["artifact"]["type"], "approval_token");
    assert_eq!(lines[1]["state"], "approved");
    let id = lines[0]["artifact"]["proposal_id"].as_str().unwrap().to_string();
    let token = lines[1]["token"].as_str().unwrap().to_string();

    let mut out = Vec::new();
    let accepted = commands::run_turn(
        &protocol,
        "ops",
        &format!("execute {id} {token}"),
        false,
        &mut out,
    )
    .await
    .unwrap();
    assert!(accepted);
    assert!(String::from_utf8_lossy(&out).contains("Execution succeeded"));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");

    let artifacts = std::fs::read_to_string(config.data_dir().join(ARTIFACTS_FILE)).unwrap();
    assert_eq!(artifacts.lines().count(), 3);
    assert!(!artifacts.contains(&token));
}

#[tokio::test]
async fn text_output_shows_token_once_with_hint() {
    let (tmp, overrides) = setup();
    let config = app::load_config(&overrides).unwrap();
    let protocol = app::open_protocol(&config).unwrap();
    let target = work(&tmp).join("a.txt");

    let mut out = Vec::new();
    commands::run_turn(
        &protocol,
        "ops",
        &format!("propose file.write_scoped write {} x", target.display()),
        false,
        &mut out,
    )
    .await
    .unwrap();
    let text = String::from_utf8_lossy(&out).to_string();
    assert!(text.starts_with("## Proposal"));
    assert!(text.contains("Approval required"));

    let mut out = Vec::new();
    commands::run_turn(&protocol, "ops", "approve", false, &mut out)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&out).to_string();
    assert!(text.contains("Token (shown once): "));
    assert!(text.contains("Run: `execute "));
}

#[tokio::test]
async fn denied_turn_reports_false() {
    let (_tmp, overrides) = setup();
    let config = app::load_config(&overrides).unwrap();
    let protocol = app::open_protocol(&config).unwrap();

    let mut out = Vec::new();
    let accepted = commands::run_turn(
        &protocol,
        "ops",
        "propose legacy.exec run echo hi",
        true,
        &mut out,
    )
    .await
    .unwrap();
    assert!(!accepted);
    let lines = json_lines(&out);
    assert_eq!(lines[0]["artifact"]["type"], "denied_action");
    assert_eq!(lines[0]["artifact"]["reason"], "disabled_capability");
    assert!(lines[0]["token"].is_null());
}

#[tokio::test]
async fn audit_tail_filters_by_proposal() {
    let (tmp, overrides) = setup();
    let config = app::load_config(&overrides).unwrap();
    let protocol = app::open_protocol(&config).unwrap();
    let work = work(&tmp);

    let mut out = Vec::new();
    let input = format!(
        "propose file.write_scoped write {} one\npropose file.write_scoped write {} two\n",
        work.join("1.txt").display(),
        work.join("2.txt").display()
    );
    commands::repl(&protocol, "ops", input.as_bytes(), true, &mut out)
        .await
        .unwrap();
    let lines = json_lines(&out);
    let first = lines[0]["artifact"]["proposal_id"].as_str().unwrap().to_string();

    let audit = app::open_audit(&config).unwrap();
    let mut out = Vec::new();
    commands::audit_tail(&audit, 20, None, true, &mut out).unwrap();
    assert_eq!(json_lines(&out).len(), 2);

    let mut out = Vec::new();
    commands::audit_tail(&audit, 20, Some(&first), true, &mut out).unwrap();
    let events = json_lines(&out);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "proposed");
    assert_eq!(events[0]["proposal_id"], first.as_str());

    let mut out = Vec::new();
    commands::audit_tail(&audit, 1, None, false, &mut out).unwrap();
    assert_eq!(String::from_utf8_lossy(&out).lines().count(), 1);
}

#[test]
fn registry_listing_resolves_relative_roots() {
    let (tmp, overrides) = setup();
    let config = app::load_config(&overrides).unwrap();
    let registry = app::load_registry(&config).unwrap();

    let mut out = Vec::new();
    commands::list_registry(&registry, true, &mut out).unwrap();
    let lines = json_lines(&out);
    assert_eq!(lines.len(), 2);
    let write = lines.iter().find(|l| l["name"] == "file.write_scoped").unwrap();
    assert_eq!(write["tier"], "approval_required");
    assert_eq!(write["kind"], "path");
    assert_eq!(
        write["allowed_roots"][0].as_str().map(Path::new),
        Some(work(&tmp).as_path())
    );
}

#[test]
fn invalid_config_is_rejected() {
    let (tmp, mut overrides) = setup();
    let path = tmp.path().join("bad.json");
    std::fs::write(&path, r#"{"token_ttl_secs": 0}"#).unwrap();
    overrides.config = Some(path);
    let err = app::load_config(&overrides).unwrap_err();
    assert!(format!("{err:#}").contains("token_ttl_secs"));
}
