//! # usage-ledger
//!
//! Per-user, per-month cost ledger that caps spend on AI-backed features.
//!
//! Every metered request is admitted against the user's monthly ceiling
//! before the AI call is made, and its actual cost is committed afterwards
//! with a single atomic increment in the backing store. Once a period's
//! total reaches the ceiling it is closed for the rest of the month.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use usage_ledger::{OperationType, UsageLedger, UserId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), usage_ledger::Error> {
//!     let ledger = UsageLedger::builder().build()?;
//!     let user = UserId::new("user-1")?;
//!
//!     let reservation = ledger
//!         .check_and_reserve(&user, OperationType::Chat, 1)
//!         .await?;
//!     // ... call the AI service ...
//!     reservation.commit(1).await?;
//!
//!     let summary = ledger.get_summary(&user).await?;
//!     println!("{} cents left this month", summary.remaining_cents);
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! The in-memory store suits tests and single-instance deployments. Enable
//! `postgres` or `redis-backend` to share the ledger across processes.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod budget;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod observability;
pub mod prelude;
pub mod recorder;
pub mod reservation;
pub mod summary;
pub mod types;

pub use budget::{
    Admission, CeilingResolver, CostEstimates, CostEstimatesBuilder, DenyReason, FixedCeiling,
    PeriodStatus, SubscriptionTier, TieredCeilings, admit,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EnforcementMode, LedgerConfig, RetryConfig};
#[cfg(feature = "postgres")]
pub use ledger::{PostgresConfig, PostgresLedgerStore};
#[cfg(feature = "redis-backend")]
pub use ledger::{RedisConfig, RedisLedgerStore};
pub use ledger::{
    Charge, ChargeOutcome, Hold, LedgerError, LedgerResult, LedgerStore, MemoryLedgerStore,
    ReserveOutcome, StoreFactory,
};
pub use observability::{LedgerMetrics, MetricsSummary};
pub use recorder::UsageRecorder;
pub use reservation::{Billed, Reservation, ReservationState, UsageLedger, UsageLedgerBuilder};
pub use summary::{UsageSummary, UsageSummaryReader};
pub use types::{CategoryUsage, OperationType, PeriodKey, ReservationId, UsagePeriod, UserId};

/// Error type for usage-ledger operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request was refused at admission.
    #[error("Monthly budget exceeded ({reason}): {used}¢ used of {ceiling}¢")]
    BudgetExceeded {
        reason: DenyReason,
        used: u64,
        ceiling: u64,
    },

    /// The store could not be reached or answered with an error.
    #[error("Usage store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// A commit arrived after the period had already closed.
    #[error("Usage limit already reached for {user_id} in {period}; {cost_cents}¢ not recorded")]
    LimitReached {
        user_id: String,
        period: String,
        cost_cents: u64,
    },

    /// The operation is not in the configured allowed set.
    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(OperationType),

    #[error("Unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("Invalid cost: {0}")]
    InvalidCost(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    /// The ceiling resolver could not produce a ceiling.
    #[error("Ceiling unavailable for {user_id}: {message}")]
    Ceiling { user_id: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored record could not be decoded.
    #[error("Corrupt ledger record: {0}")]
    Corrupt(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Operation refused by policy
    Authorization,
    /// Configuration, parsing, or input validation errors
    Configuration,
    /// Store failures that may succeed on retry
    Transient,
    /// Internal errors (IO, JSON, corrupt records)
    Internal,
    /// Budget limits
    ResourceLimit,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::OperationNotAllowed(_) => ErrorCategory::Authorization,

            Error::Config(_)
            | Error::UnknownOperation(_)
            | Error::InvalidCost(_)
            | Error::InvalidUserId(_)
            | Error::Ceiling { .. } => ErrorCategory::Configuration,

            Error::StoreUnavailable { .. } => ErrorCategory::Transient,

            Error::BudgetExceeded { .. } | Error::LimitReached { .. } => {
                ErrorCategory::ResourceLimit
            }

            Error::Corrupt(_) | Error::Json(_) | Error::Io(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_resource_limit(&self) -> bool {
        self.category() == ErrorCategory::ResourceLimit
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Error::BudgetExceeded { reason, .. } => Some(*reason),
            Error::LimitReached { .. } => Some(DenyReason::AlreadyAtLimit),
            _ => None,
        }
    }

    /// Text safe to show to the end user.
    ///
    /// Budget refusals get their own message pointing at the upgrade path so
    /// clients can tell them apart from outages.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::BudgetExceeded {
                reason: DenyReason::AlreadyAtLimit,
                ..
            }
            | Error::LimitReached { .. } => {
                "You've used all of this month's AI features. Upgrade to Premium to keep going, or check back when your allowance resets next month."
            }
            Error::BudgetExceeded {
                reason: DenyReason::WouldExceed,
                ..
            } => {
                "This request would go over this month's AI allowance. Upgrade to Premium for a higher monthly limit."
            }
            Error::OperationNotAllowed(_) => "This feature isn't available on your plan.",
            Error::StoreUnavailable { .. } => {
                "We couldn't check your usage right now. Please try again in a moment."
            }
            _ => "Something went wrong. Please try again.",
        }
    }
}

impl From<ledger::LedgerError> for Error {
    fn from(err: ledger::LedgerError) -> Self {
        match err {
            ledger::LedgerError::NotFound { key } => Error::StoreUnavailable {
                message: format!("usage period {} not found", key),
            },
            ledger::LedgerError::Unavailable { message } => Error::StoreUnavailable { message },
            ledger::LedgerError::Serialization(e) => Error::Json(e),
            ledger::LedgerError::Corrupt { message } => Error::Corrupt(message),
            ledger::LedgerError::InvalidCeiling { user_id, period } => Error::Ceiling {
                user_id,
                message: format!("period {} cannot be created with a zero ceiling", period),
            },
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::InvalidValue { key, message } => {
                Error::Config(format!("Invalid value for {}: {}", key, message))
            }
            config::ConfigError::Serialization(e) => Error::Json(e),
            config::ConfigError::Io(e) => Error::Io(e),
            config::ConfigError::ValidationErrors(errors) => Error::Config(errors.to_string()),
        }
    }
}

/// Result type for usage-ledger operations.
pub type Result<T> = std::result::Result<T, Error>;
