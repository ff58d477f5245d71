// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node-level tests: spool scanning and application reload.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use apiary_node::config::{Config, Paths};
use apiary_node::isolate::{MockBehavior, MockIsolate};
use apiary_node::node::Node;

fn config(dir: &Path) -> Config {
    let spool = dir.join("spool");
    let runtime = dir.join("run");
    let plugins = dir.join("plugins");
    for path in [&spool, &runtime, &plugins] {
        std::fs::create_dir_all(path).unwrap();
    }
    Config {
        paths: Paths {
            plugins,
            runtime,
            spool,
        },
        port_range: (49152, 65535),
        services: HashMap::new(),
        storages: HashMap::new(),
        loggers: HashMap::new(),
    }
}

fn deploy_app(config: &Config, name: &str) {
    let dir = config.paths.spool.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = serde_json::json!({
        "slave": "/usr/bin/test-worker",
        "endpoint": config.paths.runtime.join(format!("{name}.sock")),
        "environment": {},
    });
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_spool_scan_starts_applications() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    deploy_app(&config, "echo");
    deploy_app(&config, "transcode");

    let isolate = Arc::new(MockIsolate::new(MockBehavior::Pending));
    let mut node = Node::with_isolate(config.clone(), isolate);
    node.start_apps();

    assert_eq!(node.app_count(), 2);
    assert!(node.app("echo").is_some());
    assert!(node.app("transcode").is_some());
    assert!(config.paths.runtime.join("echo.sock").exists());

    node.stop().await;
    assert!(!config.paths.runtime.join("echo.sock").exists());
}

#[tokio::test]
async fn test_spool_entries_without_manifest_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    deploy_app(&config, "echo");
    std::fs::create_dir_all(config.paths.spool.join("not-an-app")).unwrap();

    let isolate = Arc::new(MockIsolate::new(MockBehavior::Pending));
    let mut node = Node::with_isolate(config, isolate);
    node.start_apps();

    assert_eq!(node.app_count(), 1);
    node.stop().await;
}

#[tokio::test]
async fn test_reload_diffs_the_spool() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    deploy_app(&config, "echo");

    let isolate = Arc::new(MockIsolate::new(MockBehavior::Pending));
    let mut node = Node::with_isolate(config.clone(), isolate);
    node.start_apps();
    assert_eq!(node.app_count(), 1);

    // A new application appears and an old one goes away.
    deploy_app(&config, "transcode");
    std::fs::remove_dir_all(config.paths.spool.join("echo")).unwrap();

    node.reload().await;
    assert_eq!(node.app_count(), 1);
    assert!(node.app("echo").is_none());
    assert!(node.app("transcode").is_some());

    node.stop().await;
}

#[tokio::test]
async fn test_broken_manifest_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let app_dir = config.paths.spool.join("broken");
    std::fs::create_dir_all(&app_dir).unwrap();
    std::fs::write(app_dir.join("manifest.json"), "{not json").unwrap();

    let isolate = Arc::new(MockIsolate::new(MockBehavior::Pending));
    let mut node = Node::with_isolate(config, isolate);
    node.start_apps();
    assert_eq!(node.app_count(), 0);
}
