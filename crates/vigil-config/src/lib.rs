//! Shared configuration for the dashboard shell.
//!
//! TOML profiles (one per backend), environment overrides under the
//! `VIGIL_` prefix, and translation to the runtime types the other
//! crates consume: `vigil_core::SourceConfig`, `vigil_core::QueueConfig`,
//! and `vigil_api::TransportConfig`.

pub mod logging;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_api::{TlsMode, TransportConfig};
use vigil_core::{QueueConfig, RetryPolicy, SourceConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no profile named '{profile}' in config")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults applied where a profile is silent.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named backend profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// Exponential backoff base, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive reconnect failures tolerated before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Streaming handshake deadline before falling back to polling.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Interval between polls on the fallback transport.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// How long synced queue entries stay around for auditing.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Override for the durable queue file location.
    pub queue_path: Option<PathBuf>,

    #[serde(default)]
    pub insecure: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            connection_timeout_ms: default_connection_timeout_ms(),
            polling_interval_ms: default_polling_interval_ms(),
            retention_hours: default_retention_hours(),
            queue_path: None,
            insecure: false,
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_connection_timeout_ms() -> u64 {
    3000
}
fn default_polling_interval_ms() -> u64 {
    10_000
}
fn default_retention_hours() -> u64 {
    24
}

/// A named backend profile.
#[derive(Debug, Deserialize, Serialize)]
pub struct Profile {
    /// Streaming endpoint (ws:// or wss://).
    pub stream_url: String,

    /// Polling endpoint returning a complete snapshot.
    pub poll_url: String,

    /// Prefer the streaming transport when both are viable.
    #[serde(default = "default_prefer_streaming")]
    pub prefer_streaming: bool,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Override the global insecure-TLS setting.
    pub insecure: Option<bool>,

    /// Override the global polling interval (milliseconds).
    pub polling_interval_ms: Option<u64>,

    /// Override the global retry budget.
    pub max_retries: Option<u32>,
}

fn default_prefer_streaming() -> bool {
    true
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "vigil-dash", "vigil").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default location of the durable queue file, next to other app data.
pub fn default_queue_path() -> PathBuf {
    ProjectDirs::from("com", "vigil-dash", "vigil").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("queue.json");
            p
        },
        |dirs| dirs.data_dir().join("queue.json"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("vigil");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = config_path();

    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("VIGIL_").split("_"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(&path, toml_str)?;
    Ok(())
}

// ── Translation to runtime types ────────────────────────────────────

/// Look up a profile by name, falling back to `default_profile`.
pub fn select_profile<'a>(
    config: &'a Config,
    name: Option<&'a str>,
) -> Result<(&'a str, &'a Profile), ConfigError> {
    let name = name
        .or(config.default_profile.as_deref())
        .unwrap_or("default");
    config
        .profiles
        .get(name)
        .map(|profile| (name, profile))
        .ok_or_else(|| ConfigError::UnknownProfile {
            profile: name.into(),
        })
}

/// Build a `SourceConfig` from a profile plus the global defaults.
pub fn profile_to_source_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<SourceConfig, ConfigError> {
    let stream_url = parse_url("stream_url", &profile.stream_url)?;
    let poll_url = parse_url("poll_url", &profile.poll_url)?;

    let mut cfg = SourceConfig::new(stream_url, poll_url);
    cfg.prefer_streaming = profile.prefer_streaming;
    cfg.connection_timeout = Duration::from_millis(defaults.connection_timeout_ms);
    cfg.polling_interval = Duration::from_millis(
        profile
            .polling_interval_ms
            .unwrap_or(defaults.polling_interval_ms),
    );
    cfg.retry = RetryPolicy {
        base_delay: Duration::from_millis(defaults.base_delay_ms),
        max_delay: Duration::from_millis(defaults.max_delay_ms),
        max_retries: profile.max_retries.unwrap_or(defaults.max_retries),
    };
    Ok(cfg)
}

/// Build the queue configuration from the global defaults.
pub fn queue_config(defaults: &Defaults) -> QueueConfig {
    QueueConfig {
        path: defaults
            .queue_path
            .clone()
            .unwrap_or_else(default_queue_path),
        retention: Duration::from_secs(defaults.retention_hours.saturating_mul(60 * 60)),
    }
}

/// Build the HTTP transport configuration for a profile.
pub fn transport_config(profile: &Profile, defaults: &Defaults) -> TransportConfig {
    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    TransportConfig {
        tls,
        timeout: Duration::from_millis(defaults.connection_timeout_ms),
    }
}

fn parse_url(field: &str, raw: &str) -> Result<url::Url, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL: {raw}"),
    })
}
