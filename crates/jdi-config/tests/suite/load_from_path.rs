use std::time::Duration;

use jdi_config::{ConfigError, DebuggerConfig};

#[test]
fn full_document_round_trips_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jdi.toml");
    std::fs::write(
        &path,
        r#"
[connect]
host = "debuggee.local"
port = 8000
allow_terminate = true

[timeouts]
request_ms = 1500
suspend_ms = 250
suspend_poll_ms = 10

[step_filters]
enabled = false
filter_statics = true
filter_constructors = true
active_patterns = ["java.*", "*$Proxy*"]
inactive_patterns = []

[logging]
level = "jdi.model=trace"
stderr = false
"#,
    )
    .unwrap();

    let config = DebuggerConfig::load_from_path(&path).unwrap();
    assert_eq!(config.connect.address(), "debuggee.local:8000");
    assert!(config.connect.allow_terminate);
    assert_eq!(config.timeouts.request(), Duration::from_millis(1500));
    assert_eq!(config.timeouts.suspend(), Duration::from_millis(250));
    assert_eq!(config.timeouts.handshake(), Duration::from_secs(5));
    assert!(!config.step_filters.enabled);
    assert!(config.step_filters.filter_statics);
    assert!(config.step_filters.filter_synthetics);
    assert_eq!(config.step_filters.active_patterns, vec!["java.*", "*$Proxy*"]);
    assert!(config.step_filters.inactive_patterns.is_empty());
    assert!(!config.logging.stderr);
    assert!(config.validate().is_empty());
}

#[test]
fn missing_file_reports_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = DebuggerConfig::load_from_path(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => assert!(reported.ends_with("absent.toml")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn parse_errors_do_not_echo_config_values() {
    let err = DebuggerConfig::load_from_str("[connect]\nport = \"super-secret\"\n").unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("failed to parse toml config"));
    assert!(!message.contains("port = "), "snippet leaked: {message}");
}

#[test]
fn explicit_path_wins_over_environment() {
    let explicit = std::path::PathBuf::from("/etc/jdi/explicit.toml");
    assert_eq!(
        DebuggerConfig::discover_path(Some(explicit.clone())),
        Some(explicit)
    );
}
