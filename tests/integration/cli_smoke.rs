#![allow(missing_docs)]

use assert_cmd::Command;

#[test]
fn help_lists_the_subcommands() {
    let output = Command::cargo_bin("mnemora")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    for subcommand in ["serve", "stats", "reindex", "completions"] {
        assert!(stdout.contains(subcommand), "missing {subcommand}");
    }
}

#[test]
fn stats_reports_store_counts_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::cargo_bin("mnemora")
        .unwrap()
        .args([
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--format",
            "json",
            "--quiet",
            "stats",
        ])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["stats"]["screenshots"], 0);
    assert_eq!(parsed["stats"]["backpressure_level"], "normal");
    assert_eq!(parsed["health"]["status"], "Healthy");
    assert!(parsed["health"]["checks"].is_array());
}

#[test]
fn completions_generate_for_bash() {
    Command::cargo_bin("mnemora")
        .unwrap()
        .args(["completions", "bash"])
        .assert()
        .success();
}
