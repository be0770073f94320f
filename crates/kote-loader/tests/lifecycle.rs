mod common;

use std::sync::Arc;

use common::*;
use kote_db::{StorageKind, StorageScope};
use kote_loader::{NativeModule, ResultStatus};

#[tokio::test]
async fn test_load_is_idempotent() {
    let h = harness().await;
    h.write_module("ping.rhai", PING);

    let first = h.manager.load("ping", None).await;
    assert_eq!(first.status, ResultStatus::Ok, "{first}");
    let subscriptions = h.dispatcher.subscription_count();

    let second = h.manager.load("ping", None).await;
    assert_eq!(second.status, ResultStatus::Info);
    assert_eq!(second.message, "already loaded");
    assert_eq!(h.dispatcher.subscription_count(), subscriptions);
    assert_eq!(
        h.manager.registries().read().await.command_providers("ping"),
        vec!["ping".to_string()]
    );
}

#[tokio::test]
async fn test_loaded_command_answers() {
    let h = harness().await;
    h.write_module("ping.rhai", PING);
    assert!(h.manager.load("ping", None).await.is_ok());

    assert_eq!(h.owner_says(".ping").await, 1);
    assert_eq!(h.take_last().as_deref(), Some("pong"));

    // Case-insensitive, and other users may call it.
    assert_eq!(h.user_says(STRANGER, ".PING").await, 1);
    assert_eq!(h.take_last().as_deref(), Some("pong"));

    assert_eq!(h.owner_says(".pingpong").await, 0);
}

#[tokio::test]
async fn test_load_unload_load_round_trip() {
    let h = harness().await;
    h.write_module("echo.rhai", ECHO);
    let baseline = h.manager.commands().await;

    assert!(h.manager.load("echo", None).await.is_ok());
    let loaded = h.manager.commands().await;
    assert!(loaded.contains_key("echo"));

    assert!(h.manager.unload("echo").await.is_ok());
    assert_eq!(h.manager.commands().await, baseline);

    assert!(h.manager.load("echo", None).await.is_ok());
    assert_eq!(h.manager.commands().await, loaded);

    h.owner_says(".echo hi there").await;
    assert_eq!(h.take_last().as_deref(), Some("echo: hi there"));
}

#[tokio::test]
async fn test_unload_removes_every_trace() {
    let h = harness().await;
    h.write_module(
        "watch.rhai",
        r#"
fn seen(e) { }
fn press(e) { "pressed" }
fn card(e) { [#{ title: "w", text: "watch" }] }
fn ping(e) { "pong" }

fn register() {
    [
        #{ kind: "command", name: "wping", handler: "ping" },
        #{ kind: "watcher", handler: "seen", incoming: true },
        #{ kind: "callback", handler: "press", pattern: "^watch:(.+)$" },
        #{ kind: "inline", handler: "card", pattern: "^watch$" },
    ]
}
"#,
    );
    let baseline = h.dispatcher.subscription_count();

    assert!(h.manager.load("watch", None).await.is_ok());
    assert_eq!(h.dispatcher.subscription_count(), baseline + 2);
    assert!(h.manager.registries().read().await.references("watch"));
    assert!(h.manager.unit_cache().contains("watch"));

    let result = h.manager.unload("watch").await;
    assert_eq!(result.status, ResultStatus::Ok);
    assert_eq!(h.dispatcher.subscription_count(), baseline);
    assert!(!h.manager.registries().read().await.references("watch"));
    assert!(!h.manager.unit_cache().contains("watch"));
    assert!(!h.manager.is_loaded("watch").await);
    assert_eq!(h.owner_says(".wping").await, 0);

    let again = h.manager.unload("watch").await;
    assert_eq!(again.status, ResultStatus::Info);
}

#[tokio::test]
async fn test_blocked_module_is_quarantined() {
    let h = harness().await;
    let path = h.write_module("evil.rhai", EVIL);
    let subscriptions = h.dispatcher.subscription_count();

    let result = h.manager.load("evil", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.message.contains("blocked"), "{result}");
    assert!(result.notes.iter().any(|n| n.contains("system")));

    assert!(!path.exists());
    assert!(h.plugin_path("evil.rhai.blocked").exists());
    assert!(!h.manager.is_loaded("evil").await);
    assert!(!h.manager.registries().read().await.references("evil"));
    assert_eq!(h.dispatcher.subscription_count(), subscriptions);
    assert!(!h.manager.discover().contains(&"evil".to_string()));
}

#[tokio::test]
async fn test_computed_import_is_quarantined() {
    let h = harness().await;
    let path = h.write_module(
        "sneaky.rhai",
        r#"
let name = "pro" + "cess";
import name as p;

fn run(e) { p::run("ls"); }

fn register() {
    [#{ kind: "command", name: "run", handler: "run" }]
}
"#,
    );

    let result = h.manager.load("sneaky", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.notes.iter().any(|n| n.contains("dynamic import")));
    assert!(!path.exists());
    assert!(h.plugin_path("sneaky.rhai.blocked").exists());
    assert!(!h.manager.is_loaded("sneaky").await);
}

#[tokio::test]
async fn test_warning_is_posted_to_report_chat() {
    let h = harness().await;
    h.write_module(
        "reader.rhai",
        r#"
fn read(e) { open("notes.txt"); }

fn register() {
    [#{ kind: "command", name: "read", handler: "read" }]
}
"#,
    );

    let result = h.manager.load("reader", Some(CHAT)).await;
    assert!(result.is_ok(), "{result}");
    assert!(!result.notes.is_empty());
    let texts = h.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("scanner verdict warning"));
}

#[tokio::test]
async fn test_failed_import_leaves_nothing_behind() {
    let h = harness().await;
    h.write_module(
        "broken.rhai",
        r#"
throw "missing dependency";

fn register() { [] }
"#,
    );
    let result = h.manager.load("broken", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result
        .detail
        .as_deref()
        .unwrap_or_default()
        .contains("missing dependency"));
    assert!(!h.manager.is_loaded("broken").await);
    assert!(!h.manager.unit_cache().contains("broken"));
}

#[tokio::test]
async fn test_invalid_pattern_commits_nothing() {
    let h = harness().await;
    h.write_module(
        "badpat.rhai",
        r#"
fn ok(e) { "ok" }
fn press(e) { }

fn register() {
    [
        #{ kind: "command", name: "fine", handler: "ok" },
        #{ kind: "callback", handler: "press", pattern: "([unclosed" },
    ]
}
"#,
    );
    let subscriptions = h.dispatcher.subscription_count();
    let result = h.manager.load("badpat", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(h.dispatcher.subscription_count(), subscriptions);
    assert!(!h.manager.registries().read().await.has_command("fine"));
}

#[tokio::test]
async fn test_missing_module() {
    let h = harness().await;
    let result = h.manager.load("ghost", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(result.message, "module file not found");
}

#[tokio::test]
async fn test_reload_picks_up_new_source() {
    let h = harness().await;
    h.write_module("stats.rhai", &stats_module("v1"));
    assert!(h.manager.load("stats", None).await.is_ok());
    h.owner_says(".stats").await;
    assert_eq!(h.take_last().as_deref(), Some("v1"));

    h.write_module("stats.rhai", &stats_module("v2"));
    let result = h.manager.reload("stats", None).await;
    assert!(result.is_ok(), "{result}");
    assert_eq!(h.owner_says(".stats").await, 1);
    assert_eq!(h.take_last().as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_package_and_nested_modules() {
    let h = harness().await;
    h.write_module("weather/_init.rhai", &stats_module("sunny"));
    h.write_module("tools/net.rhai", ECHO);
    h.write_module("_draft.rhai", PING);

    let discovered = h.manager.discover();
    assert_eq!(
        &discovered[..6],
        &["power", "modules", "aliases", "admin", "help", "menu"]
    );
    assert!(discovered.contains(&"weather".to_string()));
    assert!(discovered.contains(&"tools.net".to_string()));
    assert!(!discovered.contains(&"_draft".to_string()));

    assert_eq!(
        h.manager.resolve("weather").await,
        Some(h.plugin_path("weather/_init.rhai"))
    );
    assert!(h.manager.load("tools.net", None).await.is_ok());
    assert!(h.manager.load("weather", None).await.is_ok());
}

#[tokio::test]
async fn test_manifest_is_recorded() {
    let h = harness().await;
    h.write_module("ping.rhai", PING);
    h.manager.load("ping", None).await;

    let manifest = h.manager.module_info("ping").await.unwrap();
    assert_eq!(manifest.version.as_deref(), Some("1.0.0"));
    assert_eq!(manifest.author.as_deref(), Some("tests"));
    assert_eq!(manifest.description, "Replies with pong.");
}

#[tokio::test]
async fn test_integrity_trip_wire_is_latched() {
    let dir = tempfile::tempdir().unwrap();
    let core = dir.path().join("core.bin");
    let h = harness_with(
        vec![Arc::new(TamperModule {
            target: core.clone(),
        }) as Arc<dyn NativeModule>],
        |config| config.integrity_files = vec![core.clone()],
    )
    .await;
    h.write_module("ping.rhai", PING);

    assert!(h.manager.load("ping", None).await.is_ok());
    let subscriptions = h.dispatcher.subscription_count();

    let result = h.manager.load("tamper", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.message.contains("core.bin"), "{result}");
    assert!(!h.manager.is_loaded("tamper").await);
    assert!(!h.manager.registries().read().await.has_command("tampered"));
    assert_eq!(h.dispatcher.subscription_count(), subscriptions);

    // Restoring the file does not clear the trip.
    std::fs::write(&core, "original").unwrap();
    h.write_module("echo.rhai", ECHO);
    let result = h.manager.load("echo", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.message.contains("loading is disabled"));
}

#[tokio::test]
async fn test_tampered_core_refuses_before_reading_module() {
    let dir = tempfile::tempdir().unwrap();
    let core = dir.path().join("kote.toml");
    let h = harness_with(Vec::new(), |config| {
        config.integrity_files = vec![core.clone()]
    })
    .await;
    h.write_module("ping.rhai", PING);
    assert!(h.manager.load("ping", None).await.is_ok());

    std::fs::remove_file(&core).unwrap();
    let path = h.write_module("echo.rhai", ECHO);
    let result = h.manager.load("echo", None).await;
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.message.contains("deleted"), "{result}");
    assert!(path.exists());
    assert!(h.manager.is_loaded("ping").await);
}

const NOTES: &str = r#"
fn remember(e) {
    storage_set("note", e.args);
    config_set("saved_by", e.sender_id);
    "saved"
}

fn recall(e) {
    let note = storage_get("note");
    if type_of(note) == "()" { "nothing" } else { `note: ${note}` }
}

fn forget(e) {
    if storage_delete("note") { "forgotten" } else { "nothing to forget" }
}

fn register() {
    [
        #{ kind: "command", name: "remember", handler: "remember" },
        #{ kind: "command", name: "recall", handler: "recall" },
        #{ kind: "command", name: "forget", handler: "forget" },
    ]
}
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_storage_round_trip() {
    let h = harness().await;
    h.write_module("notes.rhai", NOTES);
    assert!(h.manager.load("notes", None).await.is_ok());

    h.owner_says(".recall").await;
    assert_eq!(h.take_last().as_deref(), Some("nothing"));

    h.owner_says(".remember buy milk").await;
    assert_eq!(h.take_last().as_deref(), Some("saved"));
    let stored = h
        .store
        .module_value("notes", "note", StorageKind::Data, StorageScope::default())
        .await
        .unwrap();
    assert_eq!(stored, Some(serde_json::json!("buy milk")));
    let saved_by = h
        .store
        .module_value("notes", "saved_by", StorageKind::Config, StorageScope::default())
        .await
        .unwrap();
    assert_eq!(saved_by, Some(serde_json::json!(OWNER)));

    // Values outlive the loaded unit.
    assert!(h.manager.reload("notes", None).await.is_ok());
    h.owner_says(".recall").await;
    assert_eq!(h.take_last().as_deref(), Some("note: buy milk"));

    h.owner_says(".forget").await;
    assert_eq!(h.take_last().as_deref(), Some("forgotten"));
    h.owner_says(".forget").await;
    assert_eq!(h.take_last().as_deref(), Some("nothing to forget"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_storage_is_per_module() {
    let h = harness().await;
    h.write_module("notes.rhai", NOTES);
    h.write_module(
        "peek.rhai",
        r#"
fn peek(e) { let v = storage_get("note"); if type_of(v) == "()" { "empty" } else { v } }

fn register() {
    [#{ kind: "command", name: "peek", handler: "peek" }]
}
"#,
    );
    assert!(h.manager.load("notes", None).await.is_ok());
    assert!(h.manager.load("peek", None).await.is_ok());

    h.owner_says(".remember secret").await;
    h.client.clear();
    h.owner_says(".peek").await;
    assert_eq!(h.take_last().as_deref(), Some("empty"));
}
