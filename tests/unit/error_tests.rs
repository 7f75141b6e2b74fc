//! Unit tests for `AppError` display format and conversions.

use agent_steward::AppError;

#[test]
fn display_uses_lowercase_prefix() {
    assert_eq!(AppError::Lock("held".into()).to_string(), "lock: held");
    assert_eq!(
        AppError::Timeout("no report".into()).to_string(),
        "timeout: no report"
    );
    assert_eq!(AppError::Rpc("bad method".into()).to_string(), "rpc: bad method");
}

#[test]
fn io_error_converts_to_io_variant() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("gone")));
}

#[test]
fn toml_error_converts_to_config_variant() {
    let parse: Result<toml::Value, _> = toml::from_str("= nope");
    let err: AppError = parse.expect_err("invalid toml").into();
    assert!(err.to_string().starts_with("config: invalid settings"));
}

#[test]
fn messages_have_no_trailing_period() {
    for err in [
        AppError::Spawn("exec failed".into()),
        AppError::Crypto("bad tag".into()),
        AppError::Sync("disconnected".into()),
    ] {
        let s = err.to_string();
        assert!(!s.ends_with('.'), "unexpected trailing period: {s}");
    }
}
