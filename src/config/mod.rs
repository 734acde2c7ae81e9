//! Ledger configuration.
//!
//! ```rust,no_run
//! use usage_ledger::config::{EnforcementMode, LedgerConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LedgerConfig::from_env()?
//!     .enforcement(EnforcementMode::HardReservation)
//!     .default_ceiling_cents(200);
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{CostEstimates, CostEstimatesBuilder};
use crate::types::OperationType;

const ENV_PREFIX: &str = "USAGE_LEDGER_";

/// Errors that can occur in configuration operations
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key with invalid value
        key: String,
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple validation errors
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// How admission interacts with concurrent requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Check against committed spend only. Concurrent in-flight requests may
    /// overshoot the ceiling by at most one window of concurrency.
    SoftCap,
    /// Atomically hold the estimate at admission and settle it on commit, so
    /// in-flight requests count against the ceiling.
    #[default]
    HardReservation,
}

impl std::str::FromStr for EnforcementMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soft_cap" | "soft" => Ok(Self::SoftCap),
            "hard_reservation" | "hard" => Ok(Self::HardReservation),
            other => Err(ConfigError::InvalidValue {
                key: "enforcement".into(),
                message: format!("unknown mode '{}'", other),
            }),
        }
    }
}

/// Backoff policy for transient store failures on the commit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub enforcement: EnforcementMode,
    /// Ceiling for new periods when no resolver is supplied.
    pub default_ceiling_cents: u64,
    pub estimates: CostEstimates,
    pub allowed_operations: BTreeSet<OperationType>,
    pub retry: RetryConfig,
    /// Reservations older than this are reclaimed by the expiry sweep.
    pub reservation_ttl_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enforcement: EnforcementMode::default(),
            default_ceiling_cents: 200,
            estimates: CostEstimates::default(),
            allowed_operations: OperationType::ALL.into_iter().collect(),
            retry: RetryConfig::default(),
            reservation_ttl_secs: 900,
        }
    }
}

impl LedgerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enforcement(mut self, mode: EnforcementMode) -> Self {
        self.enforcement = mode;
        self
    }

    pub fn default_ceiling_cents(mut self, cents: u64) -> Self {
        self.default_ceiling_cents = cents;
        self
    }

    pub fn estimates(mut self, estimates: CostEstimates) -> Self {
        self.estimates = estimates;
        self
    }

    pub fn estimate(mut self, operation: OperationType, cents: u64) -> Self {
        self.estimates.set(operation, cents);
        self
    }

    pub fn allowed_operations(mut self, ops: impl IntoIterator<Item = OperationType>) -> Self {
        self.allowed_operations = ops.into_iter().collect();
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl_secs = ttl.as_secs();
        self
    }

    pub fn reservation_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn is_allowed(&self, operation: OperationType) -> bool {
        self.allowed_operations.contains(&operation)
    }

    /// Defaults overridden by `USAGE_LEDGER_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self {
            estimates: CostEstimatesBuilder::new().with_env_overrides()?.build(),
            ..Self::default()
        };

        if let Some(mode) = env_var("ENFORCEMENT") {
            config.enforcement = mode.parse()?;
        }
        if let Some(cents) = env_parse::<u64>("DEFAULT_CEILING_CENTS")? {
            config.default_ceiling_cents = cents;
        }
        if let Some(list) = env_var("ALLOWED_OPERATIONS") {
            config.allowed_operations = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<OperationType>()
                        .map_err(|e| ConfigError::InvalidValue {
                            key: format!("{}ALLOWED_OPERATIONS", ENV_PREFIX),
                            message: e.to_string(),
                        })
                })
                .collect::<ConfigResult<_>>()?;
        }
        if let Some(n) = env_parse::<u32>("MAX_RETRIES")? {
            config.retry.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("INITIAL_BACKOFF_MS")? {
            config.retry.initial_backoff_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("MAX_BACKOFF_MS")? {
            config.retry.max_backoff_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("RESERVATION_TTL_SECS")? {
            config.reservation_ttl_secs = secs;
        }

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.default_ceiling_cents == 0 {
            errors.push(ConfigError::InvalidValue {
                key: "default_ceiling_cents".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.allowed_operations.is_empty() {
            errors.push(ConfigError::InvalidValue {
                key: "allowed_operations".into(),
                message: "at least one operation must be allowed".into(),
            });
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            errors.push(ConfigError::InvalidValue {
                key: "retry.initial_backoff_ms".into(),
                message: format!(
                    "{} exceeds max_backoff_ms {}",
                    self.retry.initial_backoff_ms, self.retry.max_backoff_ms
                ),
            });
        }
        if self.enforcement == EnforcementMode::HardReservation && self.reservation_ttl_secs == 0 {
            errors.push(ConfigError::InvalidValue {
                key: "reservation_ttl_secs".into(),
                message: "hard reservations need a non-zero TTL".into(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(ValidationErrors(errors))),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

pub(crate) fn env_parse<T>(name: &str) -> ConfigResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|v| {
            v.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: format!("{}{}", ENV_PREFIX, name),
                message: e.to_string(),
            })
        })
        .transpose()
}
