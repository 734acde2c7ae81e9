//! Commit path: applies actual costs to the period of the commit's month.

use std::sync::Arc;

use tracing::Instrument;

use crate::budget::{CeilingResolver, resolve_ceiling, validate_cost};
use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::ledger::{Charge, ChargeOutcome, LedgerError, LedgerResult, LedgerStore, with_retry};
use crate::observability::{LedgerMetrics, commit_span, release_span};
use crate::types::{OperationType, PeriodKey, ReservationId, UsagePeriod, UserId};
use crate::{Error, Result};

/// Hold taken at admission that a commit should settle.
#[derive(Debug, Clone)]
pub(crate) struct HeldBudget {
    pub key: PeriodKey,
    pub reservation_id: ReservationId,
}

/// Records actual spend after a successful AI call.
///
/// The period is resolved from the clock when the commit runs, not when the
/// request was admitted, so a request straddling midnight on the last day of
/// the month is billed to the new month. The period key is fixed once per
/// call, so retries never move a charge between months.
pub struct UsageRecorder {
    store: Arc<dyn LedgerStore>,
    ceilings: Arc<dyn CeilingResolver>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    metrics: Arc<LedgerMetrics>,
}

impl UsageRecorder {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ceilings: Arc<dyn CeilingResolver>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            store,
            ceilings,
            clock,
            retry,
            metrics,
        }
    }

    /// Apply `cost_cents` to the user's current period.
    ///
    /// Without an idempotency key a retried call is a new charge; prefer
    /// [`commit_with_key`](Self::commit_with_key) when the caller may retry.
    pub async fn commit(
        &self,
        user_id: &UserId,
        operation: OperationType,
        cost_cents: u64,
    ) -> Result<UsagePeriod> {
        self.record(user_id, Charge::new(operation, cost_cents), None)
            .await
    }

    pub async fn commit_with_key(
        &self,
        user_id: &UserId,
        operation: OperationType,
        cost_cents: u64,
        idempotency_key: impl Into<String>,
    ) -> Result<UsagePeriod> {
        let charge = Charge::new(operation, cost_cents).idempotency_key(idempotency_key);
        self.record(user_id, charge, None).await
    }

    pub(crate) fn metrics(&self) -> &Arc<LedgerMetrics> {
        &self.metrics
    }

    pub(crate) async fn settle(
        &self,
        user_id: &UserId,
        operation: OperationType,
        cost_cents: u64,
        held: &HeldBudget,
    ) -> Result<UsagePeriod> {
        let charge = Charge::new(operation, cost_cents)
            .idempotency_key(held.reservation_id.idempotency_key());
        self.record(user_id, charge, Some(held)).await
    }

    /// Give back a hold without charging. Returns whether it was still held.
    pub(crate) async fn release(
        &self,
        user_id: &UserId,
        operation: OperationType,
        held: &HeldBudget,
    ) -> Result<bool> {
        let span = release_span(user_id, operation);
        span.record_period(&held.key.to_string());

        let result = self
            .retrying(|| self.store.release(&held.key, held.reservation_id))
            .instrument(span.span().clone())
            .await;

        match result {
            Ok(released) => {
                if released {
                    self.metrics.record_released();
                }
                span.finish(if released { "released" } else { "absent" });
                Ok(released)
            }
            Err(e) => {
                self.metrics.store_errors.inc();
                tracing::warn!(
                    user_id = %user_id,
                    period = %held.key,
                    reservation_id = %held.reservation_id,
                    error = %e,
                    "Reservation release failed; expiry sweep will reclaim it"
                );
                span.finish("error");
                Err(e.into())
            }
        }
    }

    async fn record(
        &self,
        user_id: &UserId,
        charge: Charge,
        held: Option<&HeldBudget>,
    ) -> Result<UsagePeriod> {
        validate_cost(charge.cost_cents)?;
        let span = commit_span(user_id, charge.operation, charge.cost_cents);
        let key = PeriodKey::containing(user_id.clone(), self.clock.now());
        span.record_period(&key.to_string());

        let result = self
            .apply_or_create(user_id, &key, &charge, held)
            .instrument(span.span().clone())
            .await;

        match result {
            Ok(ChargeOutcome::Applied {
                period,
                crossed_limit,
            }) => {
                let latency_ms = span.finish("applied");
                self.metrics
                    .record_applied(charge.cost_cents, crossed_limit, latency_ms);
                if crossed_limit {
                    tracing::info!(
                        user_id = %user_id,
                        period = %key,
                        total_cost_cents = period.total_cost_cents,
                        ceiling_cents = period.ceiling_cents,
                        "Monthly usage limit reached"
                    );
                }
                Ok(period)
            }
            Ok(ChargeOutcome::Duplicate(period)) => {
                span.finish("duplicate");
                self.metrics.commits_duplicate.inc();
                tracing::debug!(
                    user_id = %user_id,
                    period = %key,
                    idempotency_key = ?charge.idempotency_key,
                    "Commit already applied"
                );
                Ok(period)
            }
            Ok(ChargeOutcome::Rejected(period)) => {
                span.finish("rejected");
                self.metrics.commits_rejected.inc();
                tracing::warn!(
                    user_id = %user_id,
                    period = %key,
                    operation = %charge.operation,
                    cost_cents = charge.cost_cents,
                    total_cost_cents = period.total_cost_cents,
                    "Unbilled spend: commit refused because the period already reached its limit"
                );
                Err(Error::LimitReached {
                    user_id: user_id.to_string(),
                    period: key.month_label(),
                    cost_cents: charge.cost_cents,
                })
            }
            Err(e) => {
                span.finish("lost");
                if matches!(e, Error::StoreUnavailable { .. } | Error::Corrupt(_)) {
                    self.metrics.commits_lost.inc();
                    self.metrics.store_errors.inc();
                }
                tracing::error!(
                    user_id = %user_id,
                    period = %key,
                    operation = %charge.operation,
                    cost_cents = charge.cost_cents,
                    idempotency_key = ?charge.idempotency_key,
                    error = %e,
                    "Unbilled spend: commit could not be recorded"
                );
                Err(e)
            }
        }
    }

    async fn apply_or_create(
        &self,
        user_id: &UserId,
        key: &PeriodKey,
        charge: &Charge,
        held: Option<&HeldBudget>,
    ) -> Result<ChargeOutcome> {
        match self.apply(key, charge, held).await {
            Err(LedgerError::NotFound { .. }) => {
                // First charge of a new month.
                let ceiling = resolve_ceiling(self.ceilings.as_ref(), user_id).await?;
                self.retrying(|| self.store.create_if_absent(key, ceiling))
                    .await?;
                Ok(self.apply(key, charge, held).await?)
            }
            other => Ok(other?),
        }
    }

    async fn apply(
        &self,
        key: &PeriodKey,
        charge: &Charge,
        held: Option<&HeldBudget>,
    ) -> LedgerResult<ChargeOutcome> {
        match held {
            Some(held) if held.key == *key => {
                self.retrying(|| self.store.settle(key, held.reservation_id, charge))
                    .await
            }
            Some(held) => {
                // Admitted last month, completed this month: the charge lands
                // in the new period whether or not the old hold comes back.
                match self
                    .retrying(|| self.store.release(&held.key, held.reservation_id))
                    .await
                {
                    Ok(true) => self.metrics.record_released(),
                    Ok(false) => {}
                    Err(e) => {
                        self.metrics.store_errors.inc();
                        tracing::warn!(
                            period = %held.key,
                            reservation_id = %held.reservation_id,
                            error = %e,
                            "Could not release last month's hold; left for the expiry sweep"
                        );
                    }
                }
                self.retrying(|| self.store.apply_charge(key, charge))
                    .await
            }
            None => {
                self.retrying(|| self.store.apply_charge(key, charge))
                    .await
            }
        }
    }

    async fn retrying<F, Fut, T>(&self, operation: F) -> LedgerResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = LedgerResult<T>>,
    {
        with_retry(
            self.retry.max_retries,
            self.retry.initial_backoff(),
            self.retry.max_backoff(),
            LedgerError::is_transient,
            operation,
        )
        .await
    }
}
