//! Daemon configuration: settings file, environment overrides, and
//! credential loading.
//!
//! Precedence is built-in defaults, then `<home>/settings.toml`, then the
//! environment. The home directory itself can only come from the
//! environment since every other path hangs off it.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Home directory override (affects every persisted path).
pub const ENV_HOME_DIR: &str = "STEWARD_HOME_DIR";
/// Remote authority base URL.
pub const ENV_SERVER_URL: &str = "STEWARD_SERVER_URL";
/// Heartbeat interval override in milliseconds.
pub const ENV_HEARTBEAT_INTERVAL: &str = "STEWARD_DAEMON_HEARTBEAT_INTERVAL";
/// Disables `caffeinate` sleep prevention when set to a truthy value.
pub const ENV_DISABLE_CAFFEINATE: &str = "STEWARD_DISABLE_CAFFEINATE";
/// Debug verbosity flag.
pub const ENV_DEBUG: &str = "STEWARD_DEBUG";

const DEFAULT_HOME_DIR_NAME: &str = ".agent-steward";
const STATE_FILE_NAME: &str = "daemon.state.json";
const SETTINGS_FILE_NAME: &str = "settings.toml";
const CREDENTIALS_FILE_NAME: &str = "access.key";
const MACHINE_ID_FILE_NAME: &str = "machine_id";

fn default_agent_program() -> String {
    "claude".into()
}

fn default_heartbeat_ms() -> u64 {
    60_000
}

fn default_spawn_report_timeout_seconds() -> u64 {
    15
}

fn default_keepalive_interval_seconds() -> u64 {
    20
}

/// Contents of `<home>/settings.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Settings {
    /// Remote authority base URL (`https://…`).
    pub server_url: Option<String>,
    /// Agent program launched for every spawned session.
    pub agent_program: Option<String>,
    /// Arguments passed to the agent program before daemon-added flags.
    #[serde(default)]
    pub agent_args: Vec<String>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: Option<u64>,
    /// How long a spawn waits for the child to self-report.
    pub spawn_report_timeout_seconds: Option<u64>,
    /// Interval between `machine-alive` pings to the remote authority.
    pub keepalive_interval_seconds: Option<u64>,
    /// Disable sleep prevention.
    #[serde(default)]
    pub disable_caffeinate: bool,
}

impl Settings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on invalid TOML or unknown keys.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// Machine-scoped credentials for the remote authority.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token presented on every request.
    pub token: String,
    /// Shared secret used by the sync cipher.
    pub secret: [u8; 32],
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    token: String,
    secret: String,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Root for every persisted file.
    pub home_dir: PathBuf,
    /// Remote authority base URL; `None` runs the daemon in local-only mode.
    pub server_url: Option<String>,
    /// Agent program launched for spawned sessions.
    pub agent_program: String,
    /// Default arguments for the agent program.
    pub agent_args: Vec<String>,
    /// Interval between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// Maximum wait for a spawned child's self-report.
    pub spawn_report_timeout: Duration,
    /// Interval between `machine-alive` pings.
    pub keepalive_interval: Duration,
    /// Sleep prevention disabled.
    pub disable_caffeinate: bool,
    /// Debug verbosity.
    pub debug: bool,
    /// Version this process was built as; compared against running and
    /// installed daemons.
    pub version: String,
}

impl DaemonConfig {
    /// Defaults rooted at `home_dir`, without reading any file or variable.
    #[must_use]
    pub fn with_home(home_dir: PathBuf) -> Self {
        Self {
            home_dir,
            server_url: None,
            agent_program: default_agent_program(),
            agent_args: Vec::new(),
            heartbeat_interval: Duration::from_millis(default_heartbeat_ms()),
            spawn_report_timeout: Duration::from_secs(default_spawn_report_timeout_seconds()),
            keepalive_interval: Duration::from_secs(default_keepalive_interval_seconds()),
            disable_caffeinate: false,
            debug: false,
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Resolve configuration from the environment and the settings file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no home directory can be determined,
    /// the settings file is invalid, or an environment override is malformed.
    pub fn load() -> Result<Self> {
        let home_dir = resolve_home_dir()?;
        let mut config = Self::with_home(home_dir);

        let settings_path = config.settings_path();
        if settings_path.exists() {
            let raw = fs::read_to_string(&settings_path)
                .map_err(|err| AppError::Config(format!("failed to read settings: {err}")))?;
            config.apply_settings(Settings::from_toml_str(&raw)?);
        }

        config.apply_env()?;
        Ok(config)
    }

    /// Overlay values from a parsed settings file.
    pub fn apply_settings(&mut self, settings: Settings) {
        if let Some(url) = settings.server_url {
            self.server_url = Some(url);
        }
        if let Some(program) = settings.agent_program {
            self.agent_program = program;
        }
        if !settings.agent_args.is_empty() {
            self.agent_args = settings.agent_args;
        }
        if let Some(ms) = settings.heartbeat_interval_ms {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = settings.spawn_report_timeout_seconds {
            self.spawn_report_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = settings.keepalive_interval_seconds {
            self.keepalive_interval = Duration::from_secs(secs);
        }
        self.disable_caffeinate |= settings.disable_caffeinate;
    }

    /// Overlay values from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the heartbeat override is not a
    /// positive integer.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env(ENV_SERVER_URL) {
            self.server_url = Some(url);
        }
        if let Some(raw) = non_empty_env(ENV_HEARTBEAT_INTERVAL) {
            let ms: u64 = raw.parse().map_err(|_| {
                AppError::Config(format!("{ENV_HEARTBEAT_INTERVAL} must be milliseconds, got '{raw}'"))
            })?;
            if ms == 0 {
                return Err(AppError::Config(format!(
                    "{ENV_HEARTBEAT_INTERVAL} must be greater than zero"
                )));
            }
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if env_flag(ENV_DISABLE_CAFFEINATE) {
            self.disable_caffeinate = true;
        }
        if env_flag(ENV_DEBUG) || env_flag("DEBUG") {
            self.debug = true;
        }
        Ok(())
    }

    /// Persisted daemon state file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.home_dir.join(STATE_FILE_NAME)
    }

    /// Exclusive lock marker guarding the daemon instance.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.home_dir.join(format!("{STATE_FILE_NAME}.lock"))
    }

    /// Directory holding daemon log files.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    /// Settings file consulted by [`DaemonConfig::load`].
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.home_dir.join(SETTINGS_FILE_NAME)
    }

    /// Credentials file written by the (external) auth flow.
    #[must_use]
    pub fn credentials_path(&self) -> PathBuf {
        self.home_dir.join(CREDENTIALS_FILE_NAME)
    }

    /// Scratch space for per-session auth material.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.home_dir.join("tmp")
    }

    /// Load credentials from `access.key`.
    ///
    /// Returns `Ok(None)` when the file does not exist so the daemon can run
    /// in local-only mode.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but is malformed.
    pub fn load_credentials(&self) -> Result<Option<Credentials>> {
        let path = self.credentials_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no credentials file");
                return Ok(None);
            }
            Err(err) => {
                return Err(AppError::Config(format!("failed to read credentials: {err}")));
            }
        };

        let file: CredentialsFile = serde_json::from_str(&raw)
            .map_err(|err| AppError::Config(format!("invalid credentials file: {err}")))?;
        let decoded = STANDARD
            .decode(file.secret.trim())
            .map_err(|err| AppError::Config(format!("credential secret is not base64: {err}")))?;
        let secret: [u8; 32] = decoded.try_into().map_err(|bytes: Vec<u8>| {
            AppError::Config(format!(
                "credential secret must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;

        Ok(Some(Credentials {
            token: file.token,
            secret,
        }))
    }

    /// Read the machine identity, generating and persisting one on first use.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the identity file cannot be written.
    pub fn machine_id(&self) -> Result<String> {
        let path = self.home_dir.join(MACHINE_ID_FILE_NAME);
        if let Ok(existing) = fs::read_to_string(&path) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_owned());
            }
        }

        fs::create_dir_all(&self.home_dir)?;
        let id = uuid::Uuid::new_v4().to_string();
        fs::write(&path, &id)
            .map_err(|err| AppError::Io(format!("failed to persist machine id: {err}")))?;
        Ok(id)
    }
}

fn resolve_home_dir() -> Result<PathBuf> {
    if let Some(dir) = non_empty_env(ENV_HOME_DIR) {
        return Ok(expand_tilde(&dir));
    }
    let home = env::var("HOME")
        .map_err(|_| AppError::Config(format!("neither {ENV_HOME_DIR} nor HOME is set")))?;
    Ok(Path::new(&home).join(DEFAULT_HOME_DIR_NAME))
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return Path::new(&home).join(rest);
        }
        warn!(path = raw, "cannot expand ~ without HOME");
    }
    PathBuf::from(raw)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    non_empty_env(key).is_some_and(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
}
