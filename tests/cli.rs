use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const VALID_CONFIG: &str = r#"{
    "server": {"host": "127.0.0.1", "port": 0},
    "logging": {"level": "off"},
    "routes": [{
        "incoming_model": "gpt-4",
        "provider": {"type": "openai", "base_url": "https://api.openai.com", "model": "gpt-4o", "api_key": "${BABEL_CLI_TEST_KEY}"}
    }]
}"#;

#[test]
fn check_accepts_valid_config() {
    let file = write_config(VALID_CONFIG);
    Command::cargo_bin("babel")
        .unwrap()
        .args(["check", "--config"])
        .arg(file.path())
        .env("BABEL_CLI_TEST_KEY", "sk-test")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration OK"))
        .stdout(predicate::str::contains("1 route(s)"));
}

#[test]
fn check_rejects_empty_routes() {
    let file = write_config(
        r#"{"server": {"host": "127.0.0.1", "port": 0}, "routes": []}"#,
    );
    Command::cargo_bin("babel")
        .unwrap()
        .args(["check", "--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one route"));
}

#[test]
fn check_rejects_blank_base_url() {
    let file = write_config(
        r#"{
            "server": {"host": "127.0.0.1", "port": 0},
            "routes": [{"incoming_model": "m", "provider": {"type": "openai", "base_url": " ", "model": null}}]
        }"#,
    );
    Command::cargo_bin("babel")
        .unwrap()
        .args(["check", "--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("base_url"));
}

#[test]
fn serve_fails_on_missing_config() {
    Command::cargo_bin("babel")
        .unwrap()
        .args(["serve", "--config", "/nonexistent/babel.json"])
        .assert()
        .failure();
}
