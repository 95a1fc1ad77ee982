//! Runtime configuration.
//!
//! Every tunable lives here so that call sites never hardcode a timeout or a
//! budget. Values come from `Default`, from `development()` for tests and local
//! work, or from `SMARTSPACE_*` environment variables.

use crate::{ConfigError, SpaceError, SpaceResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_MAX_STEPS: u32 = 10;
pub const DEFAULT_MAX_TRIGGER_DEPTH: u32 = 5;
pub const DEFAULT_TOOL_CALL_EXPIRY_SECS: u64 = 300;
pub const DEFAULT_LOCAL_TOOL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_EXTERNAL_TOOL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECTION_STALE_SECS: u64 = 90;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_BROKER_WINDOW: usize = 256;
pub const DEFAULT_BROKER_CAPACITY: usize = 1024;
pub const DEFAULT_BROKER_IDLE_SECS: u64 = 600;
pub const DEFAULT_REPLAY_PAGE_SIZE: usize = 500;
pub const DEFAULT_CONTEXT_WINDOW: usize = 50;
pub const DEFAULT_PUSH_BUFFER: usize = 64;
pub const DEFAULT_MAP_SIZE_MB: usize = 1024;

/// How the SmartSpace-scope copy of a run lifecycle event is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleMirror {
    /// Publish the copy to the space's live channel only. The run-scope log is
    /// the durable source; the copy can be rebuilt from it.
    #[default]
    Projection,
    /// Append the copy to the space log as well. A crash between the two
    /// appends leaves the space copy missing, never the run copy.
    Durable,
}

impl FromStr for LifecycleMirror {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "projection" => Ok(Self::Projection),
            "durable" => Ok(Self::Durable),
            other => Err(ConfigError::InvalidValue {
                field: "lifecycle_mirror".to_string(),
                value: other.to_string(),
                reason: "expected 'projection' or 'durable'".to_string(),
            }),
        }
    }
}

/// Backoff policy for transient infrastructure errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Configuration for the run runtime, the stream gateway and the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Reasoning iterations allowed per run before it fails.
    pub max_steps: u32,

    /// Trigger depth at which the coordinator stops creating runs.
    pub max_trigger_depth: u32,

    /// How long a dispatched remote call may stay unresolved.
    pub tool_call_expiry: Duration,

    pub local_tool_timeout: Duration,
    pub external_tool_timeout: Duration,

    /// Connections silent for longer than this are deregistered.
    pub connection_stale_timeout: Duration,

    /// Period of the expiry and stale-connection sweeps.
    pub sweep_interval: Duration,

    /// Silence after which a subscription yields a keep-alive.
    pub keepalive_interval: Duration,

    /// Events each scope channel retains for replay and gap repair.
    pub broker_window: usize,

    /// Broadcast capacity per scope channel.
    pub broker_capacity: usize,

    /// Scope channels with no subscribers and no publishes for this long are evicted.
    pub broker_idle_ttl: Duration,

    /// Events fetched per durable read during replay.
    pub replay_page_size: usize,

    /// Space messages included in a run's model context.
    pub context_window: usize,

    pub lifecycle_mirror: LifecycleMirror,

    /// Pending pushes buffered per connection before pushes are dropped.
    pub push_buffer: usize,

    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_trigger_depth: DEFAULT_MAX_TRIGGER_DEPTH,
            tool_call_expiry: Duration::from_secs(DEFAULT_TOOL_CALL_EXPIRY_SECS),
            local_tool_timeout: Duration::from_secs(DEFAULT_LOCAL_TOOL_TIMEOUT_SECS),
            external_tool_timeout: Duration::from_secs(DEFAULT_EXTERNAL_TOOL_TIMEOUT_SECS),
            connection_stale_timeout: Duration::from_secs(DEFAULT_CONNECTION_STALE_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            broker_window: DEFAULT_BROKER_WINDOW,
            broker_capacity: DEFAULT_BROKER_CAPACITY,
            broker_idle_ttl: Duration::from_secs(DEFAULT_BROKER_IDLE_SECS),
            replay_page_size: DEFAULT_REPLAY_PAGE_SIZE,
            context_window: DEFAULT_CONTEXT_WINDOW,
            lifecycle_mirror: LifecycleMirror::default(),
            push_buffer: DEFAULT_PUSH_BUFFER,
            retry: RetryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Short timeouts and small windows for tests and local development.
    pub fn development() -> Self {
        Self {
            tool_call_expiry: Duration::from_millis(300),
            local_tool_timeout: Duration::from_secs(2),
            external_tool_timeout: Duration::from_secs(2),
            connection_stale_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(500),
            broker_window: 64,
            broker_capacity: 256,
            broker_idle_ttl: Duration::from_secs(5),
            replay_page_size: 16,
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(50),
                backoff_multiplier: 2.0,
            },
            ..Self::default()
        }
    }

    /// Create RuntimeConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `SMARTSPACE_MAX_STEPS` (default: 10)
    /// - `SMARTSPACE_MAX_TRIGGER_DEPTH` (default: 5)
    /// - `SMARTSPACE_TOOL_CALL_EXPIRY_SECS` (default: 300)
    /// - `SMARTSPACE_LOCAL_TOOL_TIMEOUT_SECS` (default: 30)
    /// - `SMARTSPACE_EXTERNAL_TOOL_TIMEOUT_SECS` (default: 30)
    /// - `SMARTSPACE_CONNECTION_STALE_SECS` (default: 90)
    /// - `SMARTSPACE_SWEEP_INTERVAL_SECS` (default: 5)
    /// - `SMARTSPACE_KEEPALIVE_SECS` (default: 15)
    /// - `SMARTSPACE_BROKER_WINDOW` (default: 256)
    /// - `SMARTSPACE_BROKER_CAPACITY` (default: 1024)
    /// - `SMARTSPACE_BROKER_IDLE_SECS` (default: 600)
    /// - `SMARTSPACE_REPLAY_PAGE_SIZE` (default: 500)
    /// - `SMARTSPACE_CONTEXT_WINDOW` (default: 50)
    /// - `SMARTSPACE_LIFECYCLE_MIRROR`: `projection` or `durable` (default: projection)
    /// - `SMARTSPACE_PUSH_BUFFER` (default: 64)
    /// - `SMARTSPACE_RETRY_MAX` (default: 5)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let secs = |key: &str, default: u64| Duration::from_secs(env_or(key, default));
        let retry = RetryConfig {
            max_retries: env_or("SMARTSPACE_RETRY_MAX", RetryConfig::default().max_retries),
            ..RetryConfig::default()
        };

        Self {
            max_steps: env_or("SMARTSPACE_MAX_STEPS", DEFAULT_MAX_STEPS),
            max_trigger_depth: env_or("SMARTSPACE_MAX_TRIGGER_DEPTH", DEFAULT_MAX_TRIGGER_DEPTH),
            tool_call_expiry: secs(
                "SMARTSPACE_TOOL_CALL_EXPIRY_SECS",
                DEFAULT_TOOL_CALL_EXPIRY_SECS,
            ),
            local_tool_timeout: secs(
                "SMARTSPACE_LOCAL_TOOL_TIMEOUT_SECS",
                DEFAULT_LOCAL_TOOL_TIMEOUT_SECS,
            ),
            external_tool_timeout: secs(
                "SMARTSPACE_EXTERNAL_TOOL_TIMEOUT_SECS",
                DEFAULT_EXTERNAL_TOOL_TIMEOUT_SECS,
            ),
            connection_stale_timeout: secs(
                "SMARTSPACE_CONNECTION_STALE_SECS",
                DEFAULT_CONNECTION_STALE_SECS,
            ),
            sweep_interval: secs("SMARTSPACE_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
            keepalive_interval: secs("SMARTSPACE_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS),
            broker_window: env_or("SMARTSPACE_BROKER_WINDOW", DEFAULT_BROKER_WINDOW),
            broker_capacity: env_or("SMARTSPACE_BROKER_CAPACITY", DEFAULT_BROKER_CAPACITY),
            broker_idle_ttl: secs("SMARTSPACE_BROKER_IDLE_SECS", DEFAULT_BROKER_IDLE_SECS),
            replay_page_size: env_or("SMARTSPACE_REPLAY_PAGE_SIZE", DEFAULT_REPLAY_PAGE_SIZE),
            context_window: env_or("SMARTSPACE_CONTEXT_WINDOW", DEFAULT_CONTEXT_WINDOW),
            lifecycle_mirror: env_or("SMARTSPACE_LIFECYCLE_MIRROR", LifecycleMirror::default()),
            push_buffer: env_or("SMARTSPACE_PUSH_BUFFER", DEFAULT_PUSH_BUFFER),
            retry,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SpaceResult<()> {
        if self.max_steps == 0 {
            return Err(invalid("max_steps", self.max_steps, "must be greater than 0"));
        }

        let durations = [
            ("tool_call_expiry", self.tool_call_expiry),
            ("local_tool_timeout", self.local_tool_timeout),
            ("external_tool_timeout", self.external_tool_timeout),
            ("connection_stale_timeout", self.connection_stale_timeout),
            ("sweep_interval", self.sweep_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("broker_idle_ttl", self.broker_idle_ttl),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(invalid(field, format!("{:?}", value), "must be positive"));
            }
        }

        let sizes = [
            ("broker_window", self.broker_window),
            ("broker_capacity", self.broker_capacity),
            ("replay_page_size", self.replay_page_size),
            ("push_buffer", self.push_buffer),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(invalid(field, value, "must be greater than 0"));
            }
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "must be at least 1.0",
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(invalid(
                "retry.initial_backoff",
                format!("{:?}", self.retry.initial_backoff),
                "must not exceed retry.max_backoff",
            ));
        }

        Ok(())
    }
}

/// LMDB storage backend configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Directory holding the LMDB environment.
    pub path: PathBuf,
    /// Maximum map size in megabytes.
    pub map_size_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/smartspace"),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

impl StorageConfig {
    /// Reads `SMARTSPACE_DATA_DIR` and `SMARTSPACE_MAP_SIZE_MB`.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            path: std::env::var("SMARTSPACE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.path),
            map_size_mb: env_or("SMARTSPACE_MAP_SIZE_MB", default.map_size_mb),
        }
    }

    pub fn validate(&self) -> SpaceResult<()> {
        if self.map_size_mb == 0 {
            return Err(invalid("map_size_mb", self.map_size_mb, "must be greater than 0"));
        }
        if self.path.as_os_str().is_empty() {
            return Err(SpaceError::Config(ConfigError::MissingRequired {
                field: "path".to_string(),
            }));
        }
        Ok(())
    }
}

/// Tracing subscriber configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Reads `SMARTSPACE_LOG_FILTER` and `SMARTSPACE_LOG_JSON`.
    pub fn from_env() -> Self {
        Self {
            default_filter: std::env::var("SMARTSPACE_LOG_FILTER")
                .unwrap_or_else(|_| "info".to_string()),
            json: std::env::var("SMARTSPACE_LOG_JSON")
                .map(|s| s.eq_ignore_ascii_case("true") || s == "1")
                .unwrap_or(false),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> SpaceError {
    SpaceError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeConfig::default().validate().is_ok());
        assert!(RuntimeConfig::development().validate().is_ok());
        assert!(StorageConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_step_budget_rejected() {
        let config = RuntimeConfig {
            max_steps: 0,
            ..RuntimeConfig::default()
        };
        match config.validate() {
            Err(SpaceError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "max_steps")
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = RuntimeConfig {
            tool_call_expiry: Duration::ZERO,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.backoff_for(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(350));
        assert_eq!(retry.backoff_for(9), Duration::from_millis(350));
    }

    #[test]
    fn test_lifecycle_mirror_parse() {
        assert_eq!("Durable".parse::<LifecycleMirror>(), Ok(LifecycleMirror::Durable));
        assert_eq!(
            "projection".parse::<LifecycleMirror>(),
            Ok(LifecycleMirror::Projection)
        );
        assert!("both".parse::<LifecycleMirror>().is_err());
    }
}
