//! CLI command integration tests.
//! Each test uses a temp directory via AXIOM_DATA_DIR for full isolation.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn axiom_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("axiom").unwrap();
    cmd.env("AXIOM_DATA_DIR", data_dir.path());
    cmd.env_remove("AXIOM_CONFIG");
    cmd
}

/// Create a token and return its id as printed.
fn create(dir: &TempDir, args: &[&str]) -> u64 {
    let output = axiom_cmd(dir).arg("create").args(args).output().unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    value["id"].as_u64().unwrap()
}

#[test]
fn stats_fresh_db() {
    let dir = TempDir::new().unwrap();
    axiom_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("tokens:        0"))
        .stdout(predicate::str::contains("next_local_id: 1"))
        .stdout(predicate::str::contains("l8_abstract"));
}

#[test]
fn create_then_get() {
    let dir = TempDir::new().unwrap();
    let id = create(&dir, &["--entity-type", "1", "--domain", "2", "--at", "l1=0,0,0"]);
    assert_eq!(id, 0x1200_0001);

    axiom_cmd(&dir)
        .args(["get", "0x12000001"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id_hex\": \"0x12000001\""))
        .stdout(predicate::str::contains("\"l2_sensory\": null"));
}

#[test]
fn query_finds_only_near_tokens() {
    let dir = TempDir::new().unwrap();
    let near = create(&dir, &["--at", "l5=0.5,0,0"]);
    let far = create(&dir, &["--at", "l5=10,0,0"]);

    let output = axiom_cmd(&dir)
        .args(["query", "l5", "0,0,0", "1.0"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<u64> = value["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["token"]["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![near]);
    assert!(!ids.contains(&far));
    assert_eq!(value["partial"], false);
}

#[test]
fn update_clear_and_delete() {
    let dir = TempDir::new().unwrap();
    let id = create(&dir, &["--at", "l6=1,1,1", "--at", "l7=2,2,2"]);

    axiom_cmd(&dir)
        .args(["update", &id.to_string(), "--weight", "0.9", "--clear", "l6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"l6_social\": null"));

    axiom_cmd(&dir)
        .args(["query", "social", "1,1,1", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"hits\": []"));

    axiom_cmd(&dir)
        .args(["delete", &id.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted"));

    axiom_cmd(&dir)
        .args(["get", &id.to_string()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("token not found"));
}

#[test]
fn ids_are_not_reused_after_delete() {
    let dir = TempDir::new().unwrap();
    let first = create(&dir, &[]);
    axiom_cmd(&dir)
        .args(["delete", &first.to_string()])
        .assert()
        .success();
    let second = create(&dir, &[]);
    assert_eq!(second & 0x00FF_FFFF, 2);
}

#[test]
fn out_of_range_weight_rejected() {
    let dir = TempDir::new().unwrap();
    axiom_cmd(&dir)
        .args(["create", "--weight", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("weight"));
}

#[test]
fn export_import_roundtrip() {
    let dir = TempDir::new().unwrap();
    create(&dir, &["--at", "l2=1,2,3"]);
    create(&dir, &["--at", "l3=4,5,6"]);
    let file = dir.path().join("space.json");

    axiom_cmd(&dir)
        .arg("export")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("exported to"));

    let other = TempDir::new().unwrap();
    axiom_cmd(&other)
        .arg("import")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 2 tokens"));

    axiom_cmd(&other)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("tokens:        2"))
        .stdout(predicate::str::contains("next_local_id: 3"));
}

#[test]
fn config_file_in_data_dir_applies() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("axiom.toml"),
        "[core.grid]\ncell_size = 4.0\n",
    )
    .unwrap();
    axiom_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("cell=4"));
}

#[test]
fn bad_layer_is_a_usage_error() {
    let dir = TempDir::new().unwrap();
    axiom_cmd(&dir)
        .args(["create", "--at", "l9=0,0,0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown layer"));
}
