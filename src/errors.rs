//! Error types shared across the daemon.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Expected non-error outcomes (another daemon already running, lock held by
/// another instance, directory creation awaiting approval) are modelled as
/// values elsewhere and never surface through this type.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Exclusive lock marker could not be created or removed.
    Lock(String),
    /// Persisted daemon state could not be written or removed.
    State(String),
    /// Child session could not be launched.
    Spawn(String),
    /// An operation did not complete within its time budget.
    Timeout(String),
    /// Local control surface failure (bind, serve, or client request).
    Control(String),
    /// Remote sync channel or machine registration failure.
    Sync(String),
    /// Encryption or decryption failure.
    Crypto(String),
    /// Remote procedure call rejected at the boundary.
    Rpc(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Lock(msg) => write!(f, "lock: {msg}"),
            Self::State(msg) => write!(f, "state: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Control(msg) => write!(f, "control: {msg}"),
            Self::Sync(msg) => write!(f, "sync: {msg}"),
            Self::Crypto(msg) => write!(f, "crypto: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid settings: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Control(err.to_string())
    }
}
