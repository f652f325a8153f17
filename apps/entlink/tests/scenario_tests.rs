//! Integration tests for configuration loading and scenario runs.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use entlink::cli::{cmd_check_config, cmd_run, decode_reference, encode_reference};
use entlink::config::{BackendKind, Config};
use entlink::scenario::{Scenario, ScenarioRunner};
use entlink_core::{DistributionRole, RedbStore, SiteId};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, text).unwrap();
    path
}

fn redb_config(dir: &TempDir) -> PathBuf {
    let store = dir.path().join("links.redb");
    write(
        dir,
        "entlink.toml",
        &format!(
            "local_site = 1\n\n[storage]\nbackend = \"redb\"\npath = {:?}\n",
            store.to_string_lossy()
        ),
    )
}

const REPLICATE: &str = r#"
name = "replicate"

[[containers]]
id = 1
name = "orders"

[[links]]
name = "order"
container = 1
key = 7
register = true
persistent = true

[[steps]]
op = "become_replica"
link = "order"
site = 2
"#;

// =============================================================================
// CONFIG
// =============================================================================

#[test]
fn test_check_config_accepts_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(cmd_check_config(&dir.path().join("none.toml"), true).is_ok());
}

#[test]
fn test_oversized_config_rejected() {
    let dir = TempDir::new().unwrap();
    let padding = "#".repeat(2 * 1024 * 1024);
    let path = write(&dir, "big.toml", &padding);
    assert!(Config::load(&path).is_err());
}

#[test]
fn test_redb_config_loads() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(&redb_config(&dir)).unwrap();
    assert_eq!(config.storage.backend, BackendKind::Redb);
    assert_eq!(config.site(), SiteId(1));
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[test]
fn test_replica_is_stored_in_redb() {
    let dir = TempDir::new().unwrap();
    let config_path = redb_config(&dir);
    let config = Config::load(&config_path).unwrap();

    let report = ScenarioRunner::new(&config)
        .unwrap()
        .run(&Scenario::parse(REPLICATE).unwrap())
        .unwrap();
    assert_eq!(report.failures(), 0);
    assert_eq!(report.links[0].role, DistributionRole::Replica);

    let store = RedbStore::open(config.storage.path.as_deref().unwrap()).unwrap();
    assert_eq!(store.store_count().unwrap(), 1);
    assert_eq!(store.images().unwrap().len(), 1);
}

#[test]
fn test_cmd_run_reports_mismatched_expectation() {
    let dir = TempDir::new().unwrap();
    let scenario = write(
        &dir,
        "bad.toml",
        r#"
        [[links]]
        name = "a"

        [[steps]]
        op = "become_forwarder"
        link = "a"

        [[steps]]
        op = "migrate"
        link = "a"
        site = 4
        "#,
    );
    let config = dir.path().join("entlink.toml");
    assert!(cmd_run(&config, &scenario, true).is_err());
}

#[test]
fn test_cmd_run_passes_replicate() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "ok.toml", REPLICATE);
    assert!(cmd_run(&dir.path().join("entlink.toml"), &scenario, false).is_ok());
}

#[test]
fn test_demo_scenario_passes() {
    let demo = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/migration.toml");
    let text = std::fs::read_to_string(demo).unwrap();
    let report = ScenarioRunner::new(&Config::default())
        .unwrap()
        .run(&Scenario::parse(&text).unwrap())
        .unwrap();
    assert_eq!(report.failures(), 0, "{}", report);
}

#[test]
fn test_malformed_scenario_rejected() {
    assert!(Scenario::parse("[[steps]]\nop = \"teleport\"\nlink = \"a\"").is_err());
}

// =============================================================================
// REFERENCES
// =============================================================================

#[test]
fn test_reference_text_form() {
    let encoded = encode_reference(1, "order-7", None, DistributionRole::Owner).unwrap();
    let decoded = decode_reference(&encoded).unwrap();
    assert_eq!(decoded.site(), None);
    assert_eq!(decoded.role(), Some(DistributionRole::Owner));
}
