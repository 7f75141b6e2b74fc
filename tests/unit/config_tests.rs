//! Unit tests for settings parsing, environment overrides and credential
//! loading.

use std::time::Duration;

use agent_steward::config::{
    DaemonConfig, Settings, ENV_DEBUG, ENV_DISABLE_CAFFEINATE, ENV_HEARTBEAT_INTERVAL,
    ENV_SERVER_URL,
};
use agent_steward::AppError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serial_test::serial;

fn clear_env() {
    for key in [
        ENV_SERVER_URL,
        ENV_HEARTBEAT_INTERVAL,
        ENV_DISABLE_CAFFEINATE,
        ENV_DEBUG,
        "DEBUG",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_are_rooted_at_home() {
    let config = DaemonConfig::with_home("/tmp/steward-home".into());
    assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
    assert_eq!(config.spawn_report_timeout, Duration::from_secs(15));
    assert_eq!(config.agent_program, "claude");
    assert!(config.server_url.is_none());
    assert_eq!(
        config.state_path(),
        std::path::Path::new("/tmp/steward-home/daemon.state.json")
    );
    assert_eq!(
        config.lock_path(),
        std::path::Path::new("/tmp/steward-home/daemon.state.json.lock")
    );
    assert!(config.logs_dir().ends_with("logs"));
}

#[test]
fn settings_override_defaults() {
    let settings = Settings::from_toml_str(
        r#"
server_url = "https://sync.example.test"
agent_program = "codex"
agent_args = ["--quiet"]
heartbeat_interval_ms = 5000
spawn_report_timeout_seconds = 3
disable_caffeinate = true
"#,
    )
    .expect("settings parse");

    let mut config = DaemonConfig::with_home("/tmp/h".into());
    config.apply_settings(settings);

    assert_eq!(config.server_url.as_deref(), Some("https://sync.example.test"));
    assert_eq!(config.agent_program, "codex");
    assert_eq!(config.agent_args, vec!["--quiet".to_owned()]);
    assert_eq!(config.heartbeat_interval, Duration::from_millis(5000));
    assert_eq!(config.spawn_report_timeout, Duration::from_secs(3));
    assert!(config.disable_caffeinate);
}

#[test]
fn unknown_settings_key_is_rejected() {
    let result = Settings::from_toml_str("no_such_key = 1");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
#[serial]
fn heartbeat_env_override_is_milliseconds() {
    clear_env();
    std::env::set_var(ENV_HEARTBEAT_INTERVAL, "250");
    let mut config = DaemonConfig::with_home("/tmp/h".into());
    config.apply_env().expect("valid override");
    assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
    clear_env();
}

#[test]
#[serial]
fn non_numeric_heartbeat_env_is_config_error() {
    clear_env();
    std::env::set_var(ENV_HEARTBEAT_INTERVAL, "soon");
    let mut config = DaemonConfig::with_home("/tmp/h".into());
    let err = config.apply_env().expect_err("must reject");
    assert!(matches!(err, AppError::Config(_)));
    clear_env();
}

#[test]
#[serial]
fn zero_heartbeat_env_is_config_error() {
    clear_env();
    std::env::set_var(ENV_HEARTBEAT_INTERVAL, "0");
    let mut config = DaemonConfig::with_home("/tmp/h".into());
    assert!(config.apply_env().is_err());
    clear_env();
}

#[test]
#[serial]
fn env_flags_and_server_url_apply() {
    clear_env();
    std::env::set_var(ENV_SERVER_URL, "http://127.0.0.1:9");
    std::env::set_var(ENV_DISABLE_CAFFEINATE, "1");
    std::env::set_var(ENV_DEBUG, "true");
    let mut config = DaemonConfig::with_home("/tmp/h".into());
    config.apply_env().expect("env applies");
    assert_eq!(config.server_url.as_deref(), Some("http://127.0.0.1:9"));
    assert!(config.disable_caffeinate);
    assert!(config.debug);
    clear_env();
}

#[test]
#[serial]
fn falsey_flag_values_are_ignored() {
    clear_env();
    std::env::set_var(ENV_DEBUG, "false");
    let mut config = DaemonConfig::with_home("/tmp/h".into());
    config.apply_env().expect("env applies");
    assert!(!config.debug);
    clear_env();
}

#[test]
fn missing_credentials_mean_local_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DaemonConfig::with_home(dir.path().to_path_buf());
    assert!(config.load_credentials().expect("no error").is_none());
}

#[test]
fn credentials_are_decoded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DaemonConfig::with_home(dir.path().to_path_buf());
    let secret = STANDARD.encode([7u8; 32]);
    std::fs::write(
        config.credentials_path(),
        format!(r#"{{"token":"tok-1","secret":"{secret}"}}"#),
    )
    .expect("write credentials");

    let creds = config
        .load_credentials()
        .expect("load")
        .expect("credentials present");
    assert_eq!(creds.token, "tok-1");
    assert_eq!(creds.secret, [7u8; 32]);
    assert!(!format!("{creds:?}").contains("tok-1"));
}

#[test]
fn short_secret_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DaemonConfig::with_home(dir.path().to_path_buf());
    let secret = STANDARD.encode([1u8; 16]);
    std::fs::write(
        config.credentials_path(),
        format!(r#"{{"token":"t","secret":"{secret}"}}"#),
    )
    .expect("write credentials");

    assert!(matches!(config.load_credentials(), Err(AppError::Config(_))));
}

#[test]
fn machine_id_is_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DaemonConfig::with_home(dir.path().join("nested"));
    let first = config.machine_id().expect("generate");
    let second = config.machine_id().expect("reuse");
    assert_eq!(first, second);
    assert!(!first.is_empty());
}
