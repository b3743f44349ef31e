use crate::core::{Result, RunStateError};
use std::time::Duration;

/// Key prefix shared by every tag list and value hash.
pub const DEFAULT_KEY_PREFIX: &str = "workflow-utils";
/// Namespace of the output log that carries state messages.
pub const STREAM_STATE_NAMESPACE: &str = "stream-state";
/// Silence window after which a catch-up read treats the backlog as drained.
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(50);

/// Runtime configuration
///
/// Built the same way as a connection config: start from `new()` or
/// `default()`, chain setters, then `validate()`.
#[derive(Debug, Clone)]
pub struct RunStateConfig {
    /// Prefix prepended to every backend key
    pub key_prefix: String,

    /// Output log namespace for state channels
    pub namespace: String,

    /// Quiescence window of the catch-up reader
    pub quiescence: Duration,

    /// Interval between keep-alive frames on idle connections
    pub keepalive_interval: Duration,

    /// Buffered events per multiplexed connection
    pub mux_buffer: usize,

    /// Listen address of the HTTP surface
    pub bind_addr: String,
}

impl RunStateConfig {
    pub fn new() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            namespace: STREAM_STATE_NAMESPACE.to_string(),
            quiescence: DEFAULT_QUIESCENCE,
            keepalive_interval: Duration::from_secs(15),
            mux_buffer: 64,
            bind_addr: "127.0.0.1:3000".to_string(),
        }
    }

    /// Set the backend key prefix
    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    /// Set the state log namespace
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Set the catch-up quiescence window
    pub fn quiescence(mut self, window: Duration) -> Self {
        self.quiescence = window;
        self
    }

    /// Set the keep-alive interval
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the per-connection event buffer
    pub fn mux_buffer(mut self, buffer: usize) -> Self {
        self.mux_buffer = buffer;
        self
    }

    /// Set the HTTP listen address
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Read overrides from `RUNSTATE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, with an injectable variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(prefix) = lookup("RUNSTATE_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(namespace) = lookup("RUNSTATE_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(bind) = lookup("RUNSTATE_BIND") {
            config.bind_addr = bind;
        }
        if let Some(ms) = lookup("RUNSTATE_QUIESCENCE_MS") {
            config.quiescence = Duration::from_millis(parse_number("RUNSTATE_QUIESCENCE_MS", &ms)?);
        }
        if let Some(secs) = lookup("RUNSTATE_KEEPALIVE_SECS") {
            config.keepalive_interval =
                Duration::from_secs(parse_number("RUNSTATE_KEEPALIVE_SECS", &secs)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(RunStateError::InvalidConfig(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.quiescence.is_zero() {
            return Err(RunStateError::InvalidConfig(
                "quiescence must be > 0".to_string(),
            ));
        }

        if self.keepalive_interval.is_zero() {
            return Err(RunStateError::InvalidConfig(
                "keepalive_interval must be > 0".to_string(),
            ));
        }

        if self.mux_buffer == 0 {
            return Err(RunStateError::InvalidConfig(
                "mux_buffer must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RunStateConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(var: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| RunStateError::InvalidConfig(format!("{var} must be a number, got '{raw}'")))
}
