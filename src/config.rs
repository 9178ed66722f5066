//! Client configuration resolved from the environment.
//!
//! Resolution order for every setting:
//! 1. `AYON_RPC_*` environment variable
//! 2. Built-in default
//!
//! | Variable                        | Default               |
//! |---------------------------------|-----------------------|
//! | `AYON_RPC_URL`                  | `ws://localhost:8765` |
//! | `AYON_RPC_RECONNECT_ATTEMPTS`   | `5` (0 disables)      |
//! | `AYON_RPC_RECONNECT_BASE_MS`    | `100`                 |
//! | `AYON_RPC_PENDING_TIMEOUT_SECS` | `300` (0 disables)    |

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

/// Default pipeline server endpoint.
pub const DEFAULT_URL: &str = "ws://localhost:8765";

pub const ENV_URL: &str = "AYON_RPC_URL";
pub const ENV_RECONNECT_ATTEMPTS: &str = "AYON_RPC_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_BASE_MS: &str = "AYON_RPC_RECONNECT_BASE_MS";
pub const ENV_PENDING_TIMEOUT_SECS: &str = "AYON_RPC_PENDING_TIMEOUT_SECS";

const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BASE_MS: u64 = 100;
const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 300;

/// Upper bound for a single reconnect delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Upper bound for the interval between pending-call sweeps.
const MAX_PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Exponential backoff for reconnecting after an unexpected disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts after each unexpected disconnect; 0 disables reconnection.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            max_delay: MAX_RECONNECT_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// Doubles per attempt: 100ms, 200ms, 400ms, ... capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Settings for a [`Connection`](crate::ipc::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub url: Url,
    pub reconnect: ReconnectPolicy,
    /// Age after which an unanswered call is abandoned; `None` keeps calls
    /// until the connection drops.
    pub pending_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            reconnect: ReconnectPolicy::default(),
            pending_timeout: Some(Duration::from_secs(DEFAULT_PENDING_TIMEOUT_SECS)),
        }
    }
}

impl ClientConfig {
    /// Default settings for a specific endpoint.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: parse_endpoint(url)?,
            ..Self::default()
        })
    }

    /// Resolve settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = non_empty(lookup(ENV_URL)) {
            config.url =
                parse_endpoint(&raw).with_context(|| format!("Invalid {}", ENV_URL))?;
        }

        if let Some(attempts) = parse_var::<u32>(&lookup, ENV_RECONNECT_ATTEMPTS)? {
            config.reconnect.max_attempts = attempts;
        }

        if let Some(base_ms) = parse_var::<u64>(&lookup, ENV_RECONNECT_BASE_MS)? {
            if base_ms == 0 {
                bail!("Invalid {}: delay must be positive", ENV_RECONNECT_BASE_MS);
            }
            config.reconnect.base_delay = Duration::from_millis(base_ms);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, ENV_PENDING_TIMEOUT_SECS)? {
            config.pending_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// How often to sweep for abandoned calls, if at all.
    pub fn prune_interval(&self) -> Option<Duration> {
        self.pending_timeout.map(|timeout| {
            (timeout / 2)
                .min(MAX_PRUNE_INTERVAL)
                .max(Duration::from_millis(10))
        })
    }
}

/// Parse and validate a WebSocket endpoint URL.
pub fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("Invalid URL: {}", raw))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => bail!("Unsupported URL scheme '{}' (expected ws or wss)", other),
    }

    if url.host_str().is_none() {
        bail!("URL has no host: {}", raw);
    }

    Ok(url)
}

fn default_url() -> Url {
    Url::parse(DEFAULT_URL).expect("DEFAULT_URL must be a valid ws:// URL")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    non_empty(lookup(key))
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {} value: {}", key, raw))
        })
        .transpose()
}
