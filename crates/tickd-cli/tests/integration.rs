#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tickd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tickd").unwrap();
    cmd.current_dir(dir.path())
        .env("TICKD_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    tickd(dir).arg("init").assert().success();
}

fn json_of(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

fn enqueue(dir: &TempDir, action_type: &str, key: &str, payload: &str) -> serde_json::Value {
    json_of(tickd(dir).args(["enqueue", action_type, "--key", key, "--payload", payload]))
}

// ---------------------------------------------------------------------------
// tickd init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_config_and_store() {
    let dir = TempDir::new().unwrap();
    tickd(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .tickd/config.yaml"));

    assert!(dir.path().join(".tickd/config.yaml").exists());
    assert!(dir.path().join(".tickd/tickd.db").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    tickd(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .tickd/config.yaml"));
}

#[test]
fn init_with_redb_backend() {
    let dir = TempDir::new().unwrap();
    tickd(&dir).args(["init", "--backend", "redb"]).assert().success();
    assert!(dir.path().join(".tickd/tickd.redb").exists());

    let config = std::fs::read_to_string(dir.path().join(".tickd/config.yaml")).unwrap();
    assert!(config.contains("backend: redb"));
}

#[test]
fn init_rejects_unknown_backend() {
    let dir = TempDir::new().unwrap();
    tickd(&dir)
        .args(["init", "--backend", "postgres"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown backend"));
}

// ---------------------------------------------------------------------------
// tickd enqueue / actions
// ---------------------------------------------------------------------------

#[test]
fn enqueue_twice_keeps_one_action() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let payload = r#"{"platform":"x","message":"hello"}"#;
    let first = enqueue(&dir, "POST_SOCIAL", "abc", payload);
    let second = enqueue(&dir, "POST_SOCIAL", "abc", payload);
    assert_eq!(first["id"], second["id"]);

    let status = json_of(tickd(&dir).arg("status"));
    assert_eq!(status["queue_depth"]["PENDING"], 1);
}

#[test]
fn enqueue_rejects_unknown_type() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    tickd(&dir)
        .args(["enqueue", "FAX", "--key", "k"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown action type 'FAX'"));
}

#[test]
fn enqueue_rejects_bad_payload() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    tickd(&dir)
        .args(["enqueue", "WEBHOOK", "--key", "k", "--payload", "{oops"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("payload is not valid JSON"));
}

#[test]
fn actions_list_and_show() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let created = enqueue(&dir, "send_email", "mail-1", r#"{"to":"ops@example.com"}"#);
    let id = created["id"].as_str().unwrap();

    tickd(&dir)
        .args(["actions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SEND_EMAIL"))
        .stdout(predicate::str::contains("PENDING"));

    let shown = json_of(tickd(&dir).args(["actions", "show", id]));
    assert_eq!(shown["action"]["idempotency_key"], "mail-1");
    assert_eq!(shown["history"], serde_json::json!([]));

    tickd(&dir)
        .args(["actions", "show", "not-a-uuid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid action id"));
}

#[test]
fn actions_show_by_idempotency_key() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let created = enqueue(&dir, "WEBHOOK", "order-42", "{}");

    let shown = json_of(tickd(&dir).args(["actions", "show", "--key", "order-42"]));
    assert_eq!(shown["action"]["id"], created["id"]);

    tickd(&dir)
        .args(["actions", "show", "--key", "order-43"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no action with idempotency key 'order-43'"));

    tickd(&dir).args(["actions", "show"]).assert().failure();
}

// ---------------------------------------------------------------------------
// tickd run
// ---------------------------------------------------------------------------

#[test]
fn run_one_tick_in_proof_mode() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let created = enqueue(&dir, "POST_SOCIAL", "abc", r#"{"platform":"x","message":"hello"}"#);

    let summary = json_of(tickd(&dir).args(["run", "--max-ticks", "1"]));
    assert_eq!(summary["stop_reason"], "max_ticks");
    assert_eq!(summary["ticks_led"], 1);

    let status = json_of(tickd(&dir).arg("status"));
    let tick = &status["recent_ticks"][0];
    assert_eq!(tick["actions_attempted"], 1);
    assert_eq!(tick["actions_succeeded"], 1);
    let log = &status["recent_executions"][0];
    assert_eq!(log["outcome"], "success");
    assert_eq!(log["action_id"], created["id"]);
    assert!(log["detail"].as_str().unwrap().starts_with("proof:sha256:"));
    assert_eq!(status["queue_depth"]["SUCCESS"], 1);
}

#[test]
fn run_exits_cleanly_when_killed() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    tickd(&dir).arg("kill").assert().success();

    let summary = json_of(tickd(&dir).args(["run", "--max-ticks", "50"]));
    assert_eq!(summary["stop_reason"], "killed");
    assert_eq!(summary["iterations"], 1);

    tickd(&dir).args(["kill", "--clear"]).assert().success();
    let status = json_of(tickd(&dir).arg("status"));
    assert_eq!(status["control"]["killed"], false);
}

#[test]
fn run_fails_on_invalid_config() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(dir.path().join(".tickd/config.yaml"), "batch_size: 0\n").unwrap();
    tickd(&dir)
        .args(["run", "--max-ticks", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("batch_size"));
}

// ---------------------------------------------------------------------------
// tickd pause / resume / mode
// ---------------------------------------------------------------------------

#[test]
fn pause_resume_and_mode() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let flags = json_of(tickd(&dir).arg("pause"));
    assert_eq!(flags["paused"], true);
    let flags = json_of(tickd(&dir).arg("resume"));
    assert_eq!(flags["paused"], false);

    let flags = json_of(tickd(&dir).args(["mode", "real"]));
    assert_eq!(flags["mode"], "real");
    tickd(&dir)
        .arg("mode")
        .assert()
        .success()
        .stdout(predicate::str::contains("mode: real"));

    tickd(&dir)
        .args(["mode", "turbo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown mode"));
}

#[test]
fn paused_run_leaves_queue_untouched() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    enqueue(&dir, "SEND_MESSAGE", "m1", "{}");
    tickd(&dir).arg("pause").assert().success();

    tickd(&dir).args(["run", "--max-ticks", "1"]).assert().success();
    let status = json_of(tickd(&dir).arg("status"));
    assert_eq!(status["queue_depth"]["PENDING"], 1);
    assert_eq!(status["recent_ticks"][0]["outcome"], "paused");
}

// ---------------------------------------------------------------------------
// tickd requeue
// ---------------------------------------------------------------------------

#[test]
fn requeue_rejects_live_action() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let created = enqueue(&dir, "CRM_SYNC", "c1", "{}");
    tickd(&dir)
        .args(["requeue", created["id"].as_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid transition"));
}

#[test]
fn real_mode_dead_letter_then_requeue() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    tickd(&dir).args(["mode", "real"]).assert().success();
    let created = enqueue(&dir, "CRM_SYNC", "c1", "{}");
    let id = created["id"].as_str().unwrap();

    // No CRM integration is configured, so real mode dead-letters it.
    tickd(&dir).args(["run", "--max-ticks", "1"]).assert().success();
    let shown = json_of(tickd(&dir).args(["actions", "show", id]));
    assert_eq!(shown["action"]["status"], "DEAD_LETTER");
    assert_eq!(shown["history"][0]["outcome"], "dead_letter");

    let requeued = json_of(tickd(&dir).args(["requeue", id]));
    assert_eq!(requeued["status"], "PENDING");
    assert_eq!(requeued["attempts"], 0);
}
