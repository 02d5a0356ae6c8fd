//! Configuration management.
//!
//! Configuration is read from environment variables:
//! - `CUA_MODEL_NAME` - Optional. Default model string. Defaults to `anthropic/claude-3-5-sonnet-20241022`.
//! - `CUA_CONTAINER_NAME` - Optional. Default computer name for runs that don't specify one.
//! - `CUA_API_KEY` - Optional. Shared key required on `/responses` (and forwarded to the sandbox control server).
//! - `CUA_COMPUTER_URL` - Optional. Control-server URL template with a `{name}` placeholder. Defaults to `http://{name}:8000`.
//! - `HOST` / `PORT` - Optional. Proxy bind address. Defaults to `0.0.0.0:8000`.
//! - `POOL_SIZE` - Optional. Maximum concurrently open computers. Defaults to `5`.
//! - `POOL_ACQUIRE_TIMEOUT_SECS` - Optional. How long a session waits for a handle. Defaults to `60`.
//! - `SESSION_IDLE_TIMEOUT_SECS` - Optional. Idle-session eviction. Defaults to `300`.
//! - `SHUTDOWN_DEADLINE_SECS` - Optional. Grace period before force-cancel. Defaults to `30`.
//! - `TRAJECTORY_DIR` - Optional. Base directory for saved trajectories. Defaults to `trajectories`.
//! - `SCRUB_PII` - Optional. `true` registers the PII scrubber on every run.
//!
//! Per-provider keys (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, ...) are read
//! at request time through the env overlay, never cached here.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy bind host
    pub host: String,

    /// Proxy bind port
    pub port: u16,

    /// Default model string for requests that omit one
    pub default_model: String,

    /// Default computer name for requests that omit one
    pub container_name: Option<String>,

    /// Shared API key required on the proxy, if set
    pub api_key: Option<String>,

    /// Control-server URL template (`{name}` placeholder)
    pub computer_url: String,

    /// Maximum concurrently open computer handles
    pub pool_size: usize,

    /// How long an acquire waits before `PoolExhausted`
    pub acquire_timeout: Duration,

    /// Idle sessions older than this are evicted
    pub session_idle_timeout: Duration,

    /// Grace period for active runs at shutdown
    pub shutdown_deadline: Duration,

    /// Base directory for saved trajectories
    pub trajectory_dir: PathBuf,

    /// Register the PII scrubber on every run
    pub scrub_pii: bool,
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{e}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_var("PORT", 8000u16)?;

        let default_model = std::env::var("CUA_MODEL_NAME")
            .unwrap_or_else(|_| "anthropic/claude-3-5-sonnet-20241022".to_string());

        let pool_size = parse_var("POOL_SIZE", 5usize)?;
        let acquire_timeout = Duration::from_secs(parse_var("POOL_ACQUIRE_TIMEOUT_SECS", 60u64)?);
        let session_idle_timeout =
            Duration::from_secs(parse_var("SESSION_IDLE_TIMEOUT_SECS", 300u64)?);
        let shutdown_deadline = Duration::from_secs(parse_var("SHUTDOWN_DEADLINE_SECS", 30u64)?);

        let scrub_pii = std::env::var("SCRUB_PII")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Ok(Self {
            host,
            port,
            default_model,
            container_name: std::env::var("CUA_CONTAINER_NAME").ok(),
            api_key: std::env::var("CUA_API_KEY").ok(),
            computer_url: std::env::var("CUA_COMPUTER_URL")
                .unwrap_or_else(|_| "http://{name}:8000".to_string()),
            pool_size,
            acquire_timeout,
            session_idle_timeout,
            shutdown_deadline,
            trajectory_dir: std::env::var("TRAJECTORY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("trajectories")),
            scrub_pii,
        })
    }

    /// A config with defaults and the given bind address (useful for tests).
    pub fn for_addr(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            default_model: "anthropic/claude-3-5-sonnet-20241022".to_string(),
            container_name: None,
            api_key: None,
            computer_url: "http://{name}:8000".to_string(),
            pool_size: 5,
            acquire_timeout: Duration::from_secs(60),
            session_idle_timeout: Duration::from_secs(300),
            shutdown_deadline: Duration::from_secs(30),
            trajectory_dir: PathBuf::from("trajectories"),
            scrub_pii: false,
        }
    }
}
