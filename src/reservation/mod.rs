//! Admission and the request lifecycle around an AI call.
//!
//! ```rust,no_run
//! use usage_ledger::{OperationType, UsageLedger, UserId};
//!
//! # async fn example() -> usage_ledger::Result<()> {
//! let ledger = UsageLedger::builder().build()?;
//! let user = UserId::new("user-1")?;
//!
//! let outcome = ledger
//!     .execute(&user, OperationType::ScanImage, 4, || async {
//!         // call the AI service, report the value and what it actually cost
//!         Ok::<_, std::io::Error>(("grilled salmon, 420 kcal", 3))
//!     })
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

mod guard;

pub use guard::{Reservation, ReservationState};

use std::future::Future;
use std::sync::Arc;

use tracing::Instrument;

use crate::budget::{
    Admission, CeilingResolver, DenyReason, FixedCeiling, admit, resolve_ceiling, validate_cost,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{EnforcementMode, LedgerConfig};
use crate::ledger::{Hold, LedgerStore, MemoryLedgerStore, ReserveOutcome};
use crate::observability::{LedgerMetrics, MetricsSummary, check_span};
use crate::recorder::UsageRecorder;
use crate::summary::{UsageSummary, UsageSummaryReader};
use crate::types::{OperationType, PeriodKey, ReservationId, UsagePeriod, UserId};
use crate::{Error, Result};

/// Value returned by a successful AI call together with what it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Billed<T> {
    pub value: T,
    pub cost_cents: u64,
    /// `false` when the commit could not be recorded. The value is still
    /// returned; the lost charge is logged and counted.
    pub recorded: bool,
}

/// Entry point for metering AI-backed features.
pub struct UsageLedger {
    store: Arc<dyn LedgerStore>,
    ceilings: Arc<dyn CeilingResolver>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    recorder: Arc<UsageRecorder>,
    summaries: UsageSummaryReader,
    metrics: Arc<LedgerMetrics>,
}

impl UsageLedger {
    pub fn builder() -> UsageLedgerBuilder {
        UsageLedgerBuilder::default()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Admit a request estimated at `estimate_cents`, or refuse it.
    ///
    /// Store and resolver failures refuse the request: nothing is spent when
    /// the budget cannot be checked.
    pub async fn check_and_reserve(
        &self,
        user_id: &UserId,
        operation: OperationType,
        estimate_cents: u64,
    ) -> Result<Reservation> {
        validate_cost(estimate_cents)?;
        let span = check_span(user_id, operation, estimate_cents);

        if !self.config.is_allowed(operation) {
            self.metrics.denied_not_allowed.inc();
            span.finish("not_allowed");
            return Err(Error::OperationNotAllowed(operation));
        }

        let key = PeriodKey::containing(user_id.clone(), self.clock.now());
        span.record_period(&key.to_string());

        let result = self
            .admit_in(&key, operation, estimate_cents)
            .instrument(span.span().clone())
            .await;

        match result {
            Ok((id, holds_budget)) => {
                self.metrics.record_admitted(holds_budget);
                span.finish("admitted");
                Ok(Reservation::new(
                    id,
                    user_id.clone(),
                    operation,
                    estimate_cents,
                    key,
                    holds_budget,
                    Arc::clone(&self.recorder),
                ))
            }
            Err(e) => {
                match &e {
                    Error::BudgetExceeded { reason, .. } => {
                        self.metrics.record_denied(*reason);
                        span.finish("denied");
                    }
                    other => {
                        if other.is_retryable() {
                            self.metrics.store_errors.inc();
                        }
                        tracing::warn!(
                            user_id = %user_id,
                            operation = %operation,
                            error = %other,
                            "Budget check failed; refusing request"
                        );
                        span.finish("error");
                    }
                }
                Err(e)
            }
        }
    }

    /// [`check_and_reserve`](Self::check_and_reserve) with the configured
    /// estimate for `operation`.
    pub async fn check_and_reserve_default(
        &self,
        user_id: &UserId,
        operation: OperationType,
    ) -> Result<Reservation> {
        let estimate = self.config.estimates.get(operation);
        self.check_and_reserve(user_id, operation, estimate).await
    }

    /// Would a request of `estimate_cents` be admitted right now? Reads only.
    pub async fn preview(&self, user_id: &UserId, estimate_cents: u64) -> Result<Admission> {
        let key = PeriodKey::containing(user_id.clone(), self.clock.now());
        match self.store.get(&key).await? {
            Some(period) => Ok(admit(&period, estimate_cents)),
            None => {
                let ceiling = resolve_ceiling(self.ceilings.as_ref(), user_id).await?;
                let period = UsagePeriod::new(key, ceiling, self.clock.now());
                Ok(admit(&period, estimate_cents))
            }
        }
    }

    /// Run `call` under budget control.
    ///
    /// `call` is invoked only when the request is admitted and must resolve
    /// to the value and its actual cost. Successful calls are committed;
    /// failed calls release their reservation and are not billed. The outer
    /// error is the admission refusal; the inner one is the call's own.
    pub async fn execute<T, E, F, Fut>(
        &self,
        user_id: &UserId,
        operation: OperationType,
        estimate_cents: u64,
        call: F,
    ) -> Result<std::result::Result<Billed<T>, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(T, u64), E>>,
    {
        let reservation = self
            .check_and_reserve(user_id, operation, estimate_cents)
            .await?;

        match call().await {
            Ok((value, cost_cents)) => {
                let recorded = reservation.commit(cost_cents).await.is_ok();
                Ok(Ok(Billed {
                    value,
                    cost_cents,
                    recorded,
                }))
            }
            Err(e) => {
                // A failed release is logged and left for the expiry sweep.
                let _ = reservation.fail().await;
                Ok(Err(e))
            }
        }
    }

    /// Commit a cost outside the reservation protocol.
    pub async fn record_commit(
        &self,
        user_id: &UserId,
        operation: OperationType,
        cost_cents: u64,
    ) -> Result<UsagePeriod> {
        self.recorder.commit(user_id, operation, cost_cents).await
    }

    pub async fn record_commit_with_key(
        &self,
        user_id: &UserId,
        operation: OperationType,
        cost_cents: u64,
        idempotency_key: impl Into<String>,
    ) -> Result<UsagePeriod> {
        self.recorder
            .commit_with_key(user_id, operation, cost_cents, idempotency_key)
            .await
    }

    /// Usage for the current month.
    pub async fn get_summary(&self, user_id: &UserId) -> Result<UsageSummary> {
        self.summaries.current(user_id).await
    }

    pub async fn summary_for(&self, user_id: &UserId, year: i32, month: u32) -> Result<UsageSummary> {
        self.summaries.summarize(user_id, year, month).await
    }

    /// Reclaim reservations older than the configured TTL, left behind by
    /// handlers that died between admission and commit.
    pub async fn release_expired_reservations(&self) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.config.reservation_ttl_duration())
            .map_err(|e| Error::Config(format!("reservation TTL out of range: {}", e)))?;
        let cutoff = self.clock.now() - ttl;

        let released = self.store.release_expired(cutoff).await?;
        self.metrics.reservations_expired.add(released as u64);
        if released > 0 {
            tracing::info!(
                released = released,
                cutoff = %cutoff,
                "Released expired reservations"
            );
        }
        Ok(released)
    }

    async fn admit_in(
        &self,
        key: &PeriodKey,
        operation: OperationType,
        estimate_cents: u64,
    ) -> Result<(ReservationId, bool)> {
        let period = match self.store.get(key).await? {
            Some(period) => period,
            None => {
                let ceiling = resolve_ceiling(self.ceilings.as_ref(), &key.user_id).await?;
                self.store.create_if_absent(key, ceiling).await?
            }
        };
        let id = ReservationId::new();

        match self.config.enforcement {
            EnforcementMode::SoftCap => match admit(&period, estimate_cents) {
                Admission::Admit => Ok((id, false)),
                Admission::Deny(reason) => Err(Self::exceeded(reason, &period)),
            },
            EnforcementMode::HardReservation => {
                let hold = Hold {
                    reservation_id: id,
                    operation,
                    amount_cents: estimate_cents,
                };
                match self.store.reserve(key, &hold).await? {
                    ReserveOutcome::Granted(_) => Ok((id, true)),
                    ReserveOutcome::Denied { period, reason } => {
                        Err(Self::exceeded(reason, &period))
                    }
                }
            }
        }
    }

    fn exceeded(reason: DenyReason, period: &UsagePeriod) -> Error {
        Error::BudgetExceeded {
            reason,
            used: period.total_cost_cents,
            ceiling: period.ceiling_cents,
        }
    }
}

/// Builder for [`UsageLedger`]. Every part has an in-process default.
#[derive(Default)]
pub struct UsageLedgerBuilder {
    store: Option<Arc<dyn LedgerStore>>,
    ceilings: Option<Arc<dyn CeilingResolver>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<LedgerMetrics>>,
    config: LedgerConfig,
}

impl UsageLedgerBuilder {
    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ceilings(mut self, ceilings: Arc<dyn CeilingResolver>) -> Self {
        self.ceilings = Some(ceilings);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn enforcement(mut self, mode: EnforcementMode) -> Self {
        self.config.enforcement = mode;
        self
    }

    pub fn build(self) -> Result<UsageLedger> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryLedgerStore::with_clock(Arc::clone(&clock))));
        let ceilings = self
            .ceilings
            .unwrap_or_else(|| Arc::new(FixedCeiling(self.config.default_ceiling_cents)));
        let metrics = self.metrics.unwrap_or_default();

        let recorder = Arc::new(UsageRecorder::new(
            Arc::clone(&store),
            Arc::clone(&ceilings),
            Arc::clone(&clock),
            self.config.retry,
            Arc::clone(&metrics),
        ));
        let summaries =
            UsageSummaryReader::new(Arc::clone(&store), Arc::clone(&ceilings), Arc::clone(&clock));

        tracing::debug!(
            store = store.name(),
            ceilings = ceilings.name(),
            enforcement = ?self.config.enforcement,
            "Usage ledger ready"
        );

        Ok(UsageLedger {
            store,
            ceilings,
            clock,
            config: self.config,
            recorder,
            summaries,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn ledger(mode: EnforcementMode, ceiling: u64) -> UsageLedger {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 9, 10, 9, 0, 0).unwrap());
        UsageLedger::builder()
            .clock(Arc::new(clock))
            .config(LedgerConfig::new().enforcement(mode).default_ceiling_cents(ceiling))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_hard_reservation_holds_estimate() {
        let ledger = ledger(EnforcementMode::HardReservation, 10);
        let user = UserId::new("user-1").unwrap();

        let first = ledger
            .check_and_reserve(&user, OperationType::MealPlan, 6)
            .await
            .unwrap();
        assert!(first.holds_budget());

        let err = ledger
            .check_and_reserve(&user, OperationType::MealPlan, 6)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BudgetExceeded {
                reason: DenyReason::WouldExceed,
                ..
            }
        ));

        first.commit(5).await.unwrap();
        let summary = ledger.get_summary(&user).await.unwrap();
        assert_eq!(summary.total_cost_cents, 5);
        assert_eq!(summary.reserved_cents, 0);
        assert_eq!(ledger.metrics().open_reservations, 0);
    }

    #[tokio::test]
    async fn test_soft_cap_does_not_hold() {
        let ledger = ledger(EnforcementMode::SoftCap, 10);
        let user = UserId::new("user-1").unwrap();

        let a = ledger
            .check_and_reserve(&user, OperationType::MealPlan, 6)
            .await
            .unwrap();
        let b = ledger
            .check_and_reserve(&user, OperationType::MealPlan, 6)
            .await
            .unwrap();
        assert!(!a.holds_budget());

        a.commit(6).await.unwrap();
        b.commit(6).await.unwrap();
        let summary = ledger.get_summary(&user).await.unwrap();
        assert_eq!(summary.total_cost_cents, 12);
        assert!(summary.limit_reached);
    }

    #[tokio::test]
    async fn test_disallowed_operation_is_refused() {
        let ledger = UsageLedger::builder()
            .config(LedgerConfig::new().allowed_operations([OperationType::Chat]))
            .build()
            .unwrap();
        let user = UserId::new("user-1").unwrap();

        let err = ledger
            .check_and_reserve(&user, OperationType::BodyScan, 6)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationNotAllowed(OperationType::BodyScan)));
        assert_eq!(ledger.metrics().denied_not_allowed, 1);
    }

    #[tokio::test]
    async fn test_default_estimate_used() {
        let ledger = ledger(EnforcementMode::HardReservation, 200);
        let user = UserId::new("user-1").unwrap();

        let reservation = ledger
            .check_and_reserve_default(&user, OperationType::BodyScan)
            .await
            .unwrap();
        assert_eq!(reservation.estimate_cents(), 6);
        assert_eq!(ledger.get_summary(&user).await.unwrap().reserved_cents, 6);
        reservation.cancel().await.unwrap();
        assert_eq!(ledger.get_summary(&user).await.unwrap().reserved_cents, 0);
    }

    #[tokio::test]
    async fn test_preview_never_creates_period() {
        let ledger = ledger(EnforcementMode::HardReservation, 5);
        let user = UserId::new("user-1").unwrap();

        assert!(ledger.preview(&user, 5).await.unwrap().is_admitted());
        assert!(!ledger.preview(&user, 6).await.unwrap().is_admitted());
        assert!(ledger
            .store()
            .get(&PeriodKey::new(user, 2026, 9).unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = UsageLedger::builder()
            .config(LedgerConfig::new().default_ceiling_cents(0))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
