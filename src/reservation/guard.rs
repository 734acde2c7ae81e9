//! Per-request admission handle.

use std::sync::Arc;

use serde::Serialize;

use crate::Result;
use crate::recorder::{HeldBudget, UsageRecorder};
use crate::types::{OperationType, PeriodKey, ReservationId, UsagePeriod, UserId};

/// Lifecycle of an admitted request.
///
/// `Admitted` is the only state holding budget; every other state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Admitted,
    Committed,
    Failed,
    Released,
}

/// Proof that a request was admitted, returned by
/// [`UsageLedger::check_and_reserve`](super::UsageLedger::check_and_reserve).
///
/// Call [`commit`](Self::commit) with the actual cost once the AI call
/// succeeds, or [`fail`](Self::fail) when it does not. Under hard reservation
/// a handle dropped without either gives its hold back in the background; a
/// failed call is never billed.
#[must_use = "commit or fail the reservation once the AI call finishes"]
pub struct Reservation {
    id: ReservationId,
    user_id: UserId,
    operation: OperationType,
    estimate_cents: u64,
    admitted_in: PeriodKey,
    held: Option<HeldBudget>,
    state: ReservationState,
    recorder: Arc<UsageRecorder>,
}

impl Reservation {
    pub(crate) fn new(
        id: ReservationId,
        user_id: UserId,
        operation: OperationType,
        estimate_cents: u64,
        admitted_in: PeriodKey,
        holds_budget: bool,
        recorder: Arc<UsageRecorder>,
    ) -> Self {
        let held = holds_budget.then(|| HeldBudget {
            key: admitted_in.clone(),
            reservation_id: id,
        });
        Self {
            id,
            user_id,
            operation,
            estimate_cents,
            admitted_in,
            held,
            state: ReservationState::Admitted,
            recorder,
        }
    }

    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn estimate_cents(&self) -> u64 {
        self.estimate_cents
    }

    /// Period the request was admitted against. The commit may land in a
    /// later one if the month rolls over first.
    pub fn admitted_in(&self) -> &PeriodKey {
        &self.admitted_in
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    /// Whether budget is held in the store (hard reservation).
    pub fn holds_budget(&self) -> bool {
        self.held.is_some()
    }

    /// Record the actual cost of the completed call.
    ///
    /// The reservation id is the commit's idempotency key, so a commit that
    /// is retried after a timeout is applied at most once.
    pub async fn commit(mut self, actual_cents: u64) -> Result<UsagePeriod> {
        let result = match self.held {
            Some(ref held) => {
                self.recorder
                    .settle(&self.user_id, self.operation, actual_cents, held)
                    .await
            }
            None => {
                self.recorder
                    .commit_with_key(
                        &self.user_id,
                        self.operation,
                        actual_cents,
                        self.id.idempotency_key(),
                    )
                    .await
            }
        };

        match &result {
            // The store's settle gives the hold back whether the charge was
            // applied or refused.
            Ok(_) | Err(crate::Error::LimitReached { .. }) => {
                self.close(ReservationState::Committed);
            }
            // Leave the hold for Drop to release.
            Err(_) => {}
        }
        result
    }

    /// The AI call failed: release the hold and record nothing.
    pub async fn fail(mut self) -> Result<()> {
        self.finish_without_charge(ReservationState::Failed).await
    }

    /// The caller abandoned the request before calling the AI service.
    pub async fn cancel(mut self) -> Result<()> {
        self.finish_without_charge(ReservationState::Released)
            .await
    }

    async fn finish_without_charge(&mut self, state: ReservationState) -> Result<()> {
        if let Some(ref held) = self.held {
            self.recorder
                .release(&self.user_id, self.operation, held)
                .await?;
        }
        self.close(state);
        Ok(())
    }

    fn close(&mut self, state: ReservationState) {
        if self.state == ReservationState::Admitted && self.held.is_some() {
            self.recorder.metrics().record_closed();
        }
        self.state = state;
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("operation", &self.operation)
            .field("estimate_cents", &self.estimate_cents)
            .field("admitted_in", &self.admitted_in)
            .field("holds_budget", &self.held.is_some())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.state != ReservationState::Admitted {
            return;
        }
        let Some(held) = self.held.take() else {
            return;
        };
        self.recorder.metrics().record_closed();
        self.state = ReservationState::Released;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let recorder = Arc::clone(&self.recorder);
                let user_id = self.user_id.clone();
                let operation = self.operation;
                handle.spawn(async move {
                    // Failures are logged by the recorder; the expiry sweep
                    // reclaims anything left behind.
                    let _ = recorder.release(&user_id, operation, &held).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    reservation_id = %self.id,
                    period = %held.key,
                    "Reservation dropped outside a runtime; left for the expiry sweep"
                );
            }
        }
    }
}
