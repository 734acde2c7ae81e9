//! Durable per-user-per-month usage ledger.
//!
//! Every mutation is a single atomic operation on the backing store: the
//! in-memory backend holds a per-entry lock only for the increment, Postgres
//! uses one conditional `UPDATE`, and Redis runs one server-side script.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod store;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresLedgerStore};
#[cfg(feature = "redis-backend")]
pub use redis::{RedisConfig, RedisLedgerStore};
pub use store::{
    Charge, ChargeOutcome, Hold, LedgerStore, MemoryLedgerStore, ReserveOutcome, StoreFactory,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Usage period not found: {key}")]
    NotFound { key: String },

    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt ledger record: {message}")]
    Corrupt { message: String },

    #[error("Period {period} for {user_id} needs a ceiling above zero")]
    InvalidCeiling { user_id: String, period: String },
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Periods are never created with a zero ceiling, whatever the backend.
pub(crate) fn check_ceiling(key: &crate::types::PeriodKey, ceiling_cents: u64) -> LedgerResult<()> {
    if ceiling_cents == 0 {
        return Err(LedgerError::InvalidCeiling {
            user_id: key.user_id.to_string(),
            period: key.month_label(),
        });
    }
    Ok(())
}

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> LedgerResult<T>;
    fn storage_err_ctx(self, context: &str) -> LedgerResult<T>;
}

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> LedgerResult<T> {
        self.map_err(|e| LedgerError::Unavailable {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> LedgerResult<T> {
        self.map_err(|e| LedgerError::Unavailable {
            message: format!("{}: {}", context, e),
        })
    }
}

/// Retry `operation` on errors accepted by `is_retryable`, with jittered
/// exponential backoff.
pub(crate) async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
    is_retryable: impl Fn(&LedgerError) -> bool,
    operation: F,
) -> LedgerResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = LedgerResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying ledger operation after transient failure"
                );
                // Symmetrical 10% jitter so concurrent retries spread out
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
