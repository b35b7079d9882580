//! Runner configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `CLAWLETS_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use axum::http::HeaderValue;

use crate::error::BufferError;

/// Default loopback port for the secrets buffer.
pub const DEFAULT_SECRETS_PORT: u16 = 43110;
/// Default origin allowed to submit secrets (the local dashboard).
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:3000";
/// Default lifetime of a buffered secret set.
pub const DEFAULT_SECRETS_TTL: Duration = Duration::from_secs(300);
/// Default request body limit for submissions.
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024;

/// Runner daemon configuration.
#[derive(Clone)]
pub struct RunnerConfig {
    /// Base directory for runner state (defaults to `~/.clawlets`).
    pub runtime_dir: Option<PathBuf>,
    /// Project the runner belongs to.
    pub project_id: String,
    /// Runner name within the project.
    pub runner_name: String,
    /// Loopback port for the secrets buffer.
    pub secrets_port: u16,
    /// Shared nonce expected on every submission.
    pub secrets_nonce: Option<String>,
    /// The only origin allowed to submit.
    pub allowed_origin: String,
    /// Lifetime of a buffered secret set.
    pub secrets_ttl: Duration,
    /// Largest accepted submission body.
    pub max_body_bytes: usize,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Whether to skip `mlock` (for development without root/`CAP_IPC_LOCK`).
    pub disable_mlock: bool,
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CLAWLETS_RUNTIME_DIR` — runtime directory (default: `~/.clawlets`)
    /// - `CLAWLETS_PROJECT_ID` — project id (default: `default`)
    /// - `CLAWLETS_RUNNER_NAME` — runner name (default: `runner`)
    /// - `CLAWLETS_SECRETS_PORT` — buffer port (default: `43110`)
    /// - `CLAWLETS_SECRETS_NONCE` — submission nonce (required to start the buffer)
    /// - `CLAWLETS_ALLOWED_ORIGIN` — allowed origin (default: `http://localhost:3000`)
    /// - `CLAWLETS_SECRETS_TTL_SECS` — buffer TTL in seconds (default: `300`, minimum 10)
    /// - `CLAWLETS_MAX_BODY_BYTES` — submission body limit (default: `262144`)
    /// - `CLAWLETS_LOG_LEVEL` — log filter (default: `info`)
    /// - `CLAWLETS_DISABLE_MLOCK` — skip `mlockall` for dev environments (default: `false`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let secrets_port = non_empty("CLAWLETS_SECRETS_PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_SECRETS_PORT);

        let secrets_ttl = non_empty("CLAWLETS_SECRETS_TTL_SECS")
            .and_then(|v| v.trim().parse().ok())
            .map_or(DEFAULT_SECRETS_TTL, Duration::from_secs);

        let max_body_bytes = non_empty("CLAWLETS_MAX_BODY_BYTES")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);

        let disable_mlock = lookup("CLAWLETS_DISABLE_MLOCK")
            .is_some_and(|v| v == "true" || v == "1");

        Self {
            runtime_dir: non_empty("CLAWLETS_RUNTIME_DIR").map(PathBuf::from),
            project_id: non_empty("CLAWLETS_PROJECT_ID").unwrap_or_else(|| "default".to_owned()),
            runner_name: non_empty("CLAWLETS_RUNNER_NAME").unwrap_or_else(|| "runner".to_owned()),
            secrets_port,
            secrets_nonce: non_empty("CLAWLETS_SECRETS_NONCE"),
            allowed_origin: non_empty("CLAWLETS_ALLOWED_ORIGIN")
                .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGIN.to_owned()),
            secrets_ttl,
            max_body_bytes,
            log_level: non_empty("CLAWLETS_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            disable_mlock,
        }
    }

    /// Settings for the secrets buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] if no nonce is configured or
    /// the origin is not a valid header value.
    pub fn buffer_config(&self) -> Result<BufferConfig, BufferError> {
        let nonce = self
            .secrets_nonce
            .clone()
            .ok_or_else(|| BufferError::InvalidConfig {
                reason: "CLAWLETS_SECRETS_NONCE is not set".to_owned(),
            })?;

        let config = BufferConfig::new(self.secrets_port, nonce, self.allowed_origin.clone())
            .with_ttl(self.secrets_ttl)
            .with_max_body_bytes(self.max_body_bytes);
        config.validate()?;
        Ok(config)
    }
}

impl std::fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("runtime_dir", &self.runtime_dir)
            .field("project_id", &self.project_id)
            .field("runner_name", &self.runner_name)
            .field("secrets_port", &self.secrets_port)
            .field("secrets_nonce", &self.secrets_nonce.as_ref().map(|_| "[redacted]"))
            .field("allowed_origin", &self.allowed_origin)
            .field("secrets_ttl", &self.secrets_ttl)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("log_level", &self.log_level)
            .field("disable_mlock", &self.disable_mlock)
            .finish()
    }
}

/// Settings for one [`LocalSecretsBuffer`](crate::buffer::LocalSecretsBuffer).
#[derive(Clone)]
pub struct BufferConfig {
    /// Loopback port; `0` picks a free one.
    pub port: u16,
    pub nonce: String,
    pub allowed_origin: String,
    pub ttl: Duration,
    pub max_body_bytes: usize,
}

impl BufferConfig {
    #[must_use]
    pub fn new(port: u16, nonce: impl Into<String>, allowed_origin: impl Into<String>) -> Self {
        Self {
            port,
            nonce: nonce.into(),
            allowed_origin: allowed_origin.into(),
            ttl: DEFAULT_SECRETS_TTL,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Check the settings and return the origin as a header value.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] for an empty nonce or an empty
    /// or unencodable origin.
    pub fn validate(&self) -> Result<HeaderValue, BufferError> {
        if self.nonce.is_empty() {
            return Err(BufferError::InvalidConfig {
                reason: "nonce must not be empty".to_owned(),
            });
        }
        if self.allowed_origin.is_empty() {
            return Err(BufferError::InvalidConfig {
                reason: "allowed origin must not be empty".to_owned(),
            });
        }
        HeaderValue::from_str(&self.allowed_origin).map_err(|e| BufferError::InvalidConfig {
            reason: format!("allowed origin is not a valid header value: {e}"),
        })
    }
}

impl std::fmt::Debug for BufferConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferConfig")
            .field("port", &self.port)
            .field("nonce", &"[redacted]")
            .field("allowed_origin", &self.allowed_origin)
            .field("ttl", &self.ttl)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}
