//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "integration-tests"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Configuration loading tests."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::time::Duration;

use relay_common::config::{AppConfig, WireFormat};
use relay_common::LogFormat;

const SAMPLE: &str = r#"
[channel]
name = "device-state"
connect_timeout_ms = 750
wire_format = "cbor"
subscriptions = ["humidity", "temperature"]

[correlator]
command_topic = "lab.commands"
reply_topic = "lab.replies"
default_timeout_ms = 2500
max_pending = 16

[broker]
history_depth = 8

[logging]
format = "pretty"
file_output = false
"#;

#[test]
fn loads_first_existing_candidate() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("relay.toml");
    std::fs::write(&present, SAMPLE).expect("write config");

    let loaded = AppConfig::load_with_source(&[missing, present.clone()]).expect("config loads");
    assert_eq!(loaded.source, present);

    let config = loaded.config;
    assert_eq!(config.channel.name, "device-state");
    assert_eq!(config.channel.connect_timeout, Duration::from_millis(750));
    assert_eq!(config.channel.disconnect_timeout, Duration::from_secs(5));
    assert_eq!(config.channel.wire_format, WireFormat::Cbor);
    assert_eq!(config.channel.subscriptions, vec!["humidity", "temperature"]);
    assert_eq!(config.correlator.command_topic, "lab.commands");
    assert_eq!(config.correlator.default_timeout, Duration::from_millis(2500));
    assert_eq!(config.correlator.max_pending, 16);
    assert_eq!(config.broker.history_depth, 8);
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert!(!config.logging.file_output);
}

#[test]
fn reports_inspected_paths_when_nothing_exists() {
    let dir = tempfile::tempdir().expect("temp dir");
    let candidate = dir.path().join("absent.toml");
    let err = AppConfig::load(&[candidate]).expect_err("no config present");
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn invalid_file_is_rejected_with_context() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[broker]\nhistory_depth = 0\n").expect("write config");
    let err = AppConfig::from_path(&path).expect_err("zero history depth rejected");
    assert!(err.to_string().contains("history_depth"));
}
