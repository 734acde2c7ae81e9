//! Ledger store contract and the in-memory backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{LedgerError, LedgerResult, check_ceiling};
use crate::budget::{Admission, DenyReason, admit};
use crate::clock::{Clock, SystemClock};
use crate::types::{OperationType, PeriodKey, ReservationId, UsagePeriod};

/// A committed cost to apply to a period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub operation: OperationType,
    pub cost_cents: u64,
    /// Charges sharing a key are applied at most once per period.
    pub idempotency_key: Option<String>,
}

impl Charge {
    pub fn new(operation: OperationType, cost_cents: u64) -> Self {
        Self {
            operation,
            cost_cents,
            idempotency_key: None,
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Budget held by an admitted request until it settles or is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    pub reservation_id: ReservationId,
    pub operation: OperationType,
    pub amount_cents: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    /// The charge was added; `crossed_limit` is set when this charge flipped
    /// the sticky flag.
    Applied {
        period: UsagePeriod,
        crossed_limit: bool,
    },
    /// The idempotency key was already applied; the record is unchanged.
    Duplicate(UsagePeriod),
    /// The period had already reached its limit; the record is unchanged.
    Rejected(UsagePeriod),
}

impl ChargeOutcome {
    pub fn period(&self) -> &UsagePeriod {
        match self {
            Self::Applied { period, .. } | Self::Duplicate(period) | Self::Rejected(period) => {
                period
            }
        }
    }

    pub fn into_period(self) -> UsagePeriod {
        match self {
            Self::Applied { period, .. } | Self::Duplicate(period) | Self::Rejected(period) => {
                period
            }
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Granted(UsagePeriod),
    Denied {
        period: UsagePeriod,
        reason: DenyReason,
    },
}

/// Storage backend for usage periods.
///
/// Every mutating method must be a single atomic read-modify-write on the
/// backing store; callers never read a record, compute, and write it back.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &PeriodKey) -> LedgerResult<Option<UsagePeriod>>;

    /// Create the period with `ceiling_cents` unless it exists. Concurrent
    /// callers all observe the single record that won, including its ceiling.
    async fn create_if_absent(&self, key: &PeriodKey, ceiling_cents: u64)
    -> LedgerResult<UsagePeriod>;

    /// Add `charge` to the period's total and category counters, setting the
    /// sticky limit flag when the new total reaches the ceiling.
    async fn apply_charge(&self, key: &PeriodKey, charge: &Charge) -> LedgerResult<ChargeOutcome>;

    /// Hold `hold.amount_cents` if the policy admits it against committed
    /// plus already-reserved spend. Re-reserving the same id is a no-op.
    async fn reserve(&self, key: &PeriodKey, hold: &Hold) -> LedgerResult<ReserveOutcome>;

    /// Release the reservation (if still held) and apply `charge` in one step.
    async fn settle(
        &self,
        key: &PeriodKey,
        reservation_id: ReservationId,
        charge: &Charge,
    ) -> LedgerResult<ChargeOutcome>;

    /// Drop a reservation without charging. Returns whether it was held.
    async fn release(&self, key: &PeriodKey, reservation_id: ReservationId) -> LedgerResult<bool>;

    /// Release every reservation taken before `older_than`.
    async fn release_expired(&self, older_than: DateTime<Utc>) -> LedgerResult<usize>;
}

#[derive(Debug, Clone, Copy)]
struct HeldAmount {
    amount_cents: u64,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PeriodEntry {
    period: UsagePeriod,
    commit_keys: HashSet<String>,
    holds: HashMap<ReservationId, HeldAmount>,
}

impl PeriodEntry {
    fn new(period: UsagePeriod) -> Self {
        Self {
            period,
            commit_keys: HashSet::new(),
            holds: HashMap::new(),
        }
    }

    fn apply(&mut self, charge: &Charge, now: DateTime<Utc>) -> ChargeOutcome {
        if let Some(ref key) = charge.idempotency_key
            && self.commit_keys.contains(key)
        {
            return ChargeOutcome::Duplicate(self.period.clone());
        }

        match self
            .period
            .try_charge(charge.operation, charge.cost_cents, now)
        {
            None => ChargeOutcome::Rejected(self.period.clone()),
            Some(crossed_limit) => {
                if let Some(ref key) = charge.idempotency_key {
                    self.commit_keys.insert(key.clone());
                }
                ChargeOutcome::Applied {
                    period: self.period.clone(),
                    crossed_limit,
                }
            }
        }
    }

    fn drop_hold(&mut self, reservation_id: &ReservationId, now: DateTime<Utc>) -> bool {
        match self.holds.remove(reservation_id) {
            Some(held) => {
                self.period.reserved_cents =
                    self.period.reserved_cents.saturating_sub(held.amount_cents);
                self.period.updated_at = now;
                true
            }
            None => false,
        }
    }
}

/// Process-local store for tests and single-instance deployments.
///
/// Each operation runs under the map's per-shard write lock, which is held
/// only for the duration of the increment.
#[derive(Debug)]
pub struct MemoryLedgerStore {
    periods: Arc<DashMap<PeriodKey, PeriodEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            periods: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Number of stored periods.
    pub fn count(&self) -> usize {
        self.periods.len()
    }

    pub fn clear(&self) {
        self.periods.clear();
    }

    fn not_found(key: &PeriodKey) -> LedgerError {
        LedgerError::NotFound {
            key: key.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &PeriodKey) -> LedgerResult<Option<UsagePeriod>> {
        Ok(self.periods.get(key).map(|entry| entry.period.clone()))
    }

    async fn create_if_absent(
        &self,
        key: &PeriodKey,
        ceiling_cents: u64,
    ) -> LedgerResult<UsagePeriod> {
        check_ceiling(key, ceiling_cents)?;
        let now = self.clock.now();
        let entry = self
            .periods
            .entry(key.clone())
            .or_insert_with(|| PeriodEntry::new(UsagePeriod::new(key.clone(), ceiling_cents, now)));
        Ok(entry.period.clone())
    }

    async fn apply_charge(&self, key: &PeriodKey, charge: &Charge) -> LedgerResult<ChargeOutcome> {
        let now = self.clock.now();
        let mut entry = self
            .periods
            .get_mut(key)
            .ok_or_else(|| Self::not_found(key))?;
        Ok(entry.apply(charge, now))
    }

    async fn reserve(&self, key: &PeriodKey, hold: &Hold) -> LedgerResult<ReserveOutcome> {
        let now = self.clock.now();
        let mut entry = self
            .periods
            .get_mut(key)
            .ok_or_else(|| Self::not_found(key))?;

        if entry.holds.contains_key(&hold.reservation_id) {
            return Ok(ReserveOutcome::Granted(entry.period.clone()));
        }

        match admit(&entry.period, hold.amount_cents) {
            Admission::Admit => {
                entry.period.reserved_cents += hold.amount_cents;
                entry.period.updated_at = now;
                entry.holds.insert(
                    hold.reservation_id,
                    HeldAmount {
                        amount_cents: hold.amount_cents,
                        created_at: now,
                    },
                );
                Ok(ReserveOutcome::Granted(entry.period.clone()))
            }
            Admission::Deny(reason) => Ok(ReserveOutcome::Denied {
                period: entry.period.clone(),
                reason,
            }),
        }
    }

    async fn settle(
        &self,
        key: &PeriodKey,
        reservation_id: ReservationId,
        charge: &Charge,
    ) -> LedgerResult<ChargeOutcome> {
        let now = self.clock.now();
        let mut entry = self
            .periods
            .get_mut(key)
            .ok_or_else(|| Self::not_found(key))?;
        entry.drop_hold(&reservation_id, now);
        Ok(entry.apply(charge, now))
    }

    async fn release(&self, key: &PeriodKey, reservation_id: ReservationId) -> LedgerResult<bool> {
        let now = self.clock.now();
        Ok(self
            .periods
            .get_mut(key)
            .map(|mut entry| entry.drop_hold(&reservation_id, now))
            .unwrap_or(false))
    }

    async fn release_expired(&self, older_than: DateTime<Utc>) -> LedgerResult<usize> {
        let now = self.clock.now();
        let mut released = 0;

        for mut entry in self.periods.iter_mut() {
            let expired: Vec<ReservationId> = entry
                .holds
                .iter()
                .filter(|(_, held)| held.created_at < older_than)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if entry.drop_hold(&id, now) {
                    released += 1;
                }
            }
        }

        Ok(released)
    }
}

/// Factory for store backends.
pub struct StoreFactory;

impl StoreFactory {
    pub fn memory() -> Arc<dyn LedgerStore> {
        Arc::new(MemoryLedgerStore::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::UserId;
    use chrono::TimeZone;

    fn key(user: &str) -> PeriodKey {
        PeriodKey::new(UserId::new(user).unwrap(), 2026, 4).unwrap()
    }

    fn hold(amount_cents: u64) -> Hold {
        Hold {
            reservation_id: ReservationId::new(),
            operation: OperationType::ScanImage,
            amount_cents,
        }
    }

    #[tokio::test]
    async fn test_create_if_absent_keeps_first_ceiling() {
        let store = MemoryLedgerStore::new();
        let k = key("user-1");

        let first = store.create_if_absent(&k, 200).await.unwrap();
        let second = store.create_if_absent(&k, 900).await.unwrap();

        assert_eq!(first.ceiling_cents, 200);
        assert_eq!(second.ceiling_cents, 200);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn test_create_if_absent_rejects_zero_ceiling() {
        let store = MemoryLedgerStore::new();
        let err = store.create_if_absent(&key("user-1"), 0).await.unwrap_err();

        assert!(matches!(err, LedgerError::InvalidCeiling { .. }));
        assert!(!err.is_transient());
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_apply_charge_requires_period() {
        let store = MemoryLedgerStore::new();
        let err = store
            .apply_charge(&key("ghost"), &Charge::new(OperationType::Chat, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_apply_charge_flips_limit_once() {
        let at = Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap();
        let store = MemoryLedgerStore::with_clock(Arc::new(ManualClock::new(at)));
        let k = key("user-1");
        store.create_if_absent(&k, 100).await.unwrap();

        let outcome = store
            .apply_charge(&k, &Charge::new(OperationType::Chat, 60))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ChargeOutcome::Applied {
                crossed_limit: false,
                ..
            }
        ));

        let outcome = store
            .apply_charge(&k, &Charge::new(OperationType::ScanImage, 40))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ChargeOutcome::Applied {
                crossed_limit: true,
                ..
            }
        ));
        assert_eq!(outcome.period().limit_reached_at, Some(at));

        let outcome = store
            .apply_charge(&k, &Charge::new(OperationType::Chat, 5))
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Rejected(_)));
        assert_eq!(outcome.period().total_cost_cents, 100);
    }

    #[tokio::test]
    async fn test_idempotency_key_applies_once() {
        let store = MemoryLedgerStore::new();
        let k = key("user-1");
        store.create_if_absent(&k, 1_000).await.unwrap();

        let charge = Charge::new(OperationType::MealPlan, 30).idempotency_key("req-1");
        assert!(store.apply_charge(&k, &charge).await.unwrap().is_applied());
        let replay = store.apply_charge(&k, &charge).await.unwrap();

        assert!(matches!(replay, ChargeOutcome::Duplicate(_)));
        assert_eq!(replay.period().total_cost_cents, 30);
        assert_eq!(replay.period().category_count(OperationType::MealPlan), 1);
    }

    #[tokio::test]
    async fn test_reserve_counts_outstanding_holds() {
        let store = MemoryLedgerStore::new();
        let k = key("user-1");
        store.create_if_absent(&k, 100).await.unwrap();

        let first = hold(60);
        assert!(matches!(
            store.reserve(&k, &first).await.unwrap(),
            ReserveOutcome::Granted(_)
        ));
        // Same id again does not double the hold.
        let again = store.reserve(&k, &first).await.unwrap();
        assert!(matches!(again, ReserveOutcome::Granted(ref p) if p.reserved_cents == 60));

        let denied = store.reserve(&k, &hold(50)).await.unwrap();
        assert!(matches!(
            denied,
            ReserveOutcome::Denied {
                reason: DenyReason::WouldExceed,
                ..
            }
        ));

        assert!(store.release(&k, first.reservation_id).await.unwrap());
        assert!(!store.release(&k, first.reservation_id).await.unwrap());
        assert!(matches!(
            store.reserve(&k, &hold(50)).await.unwrap(),
            ReserveOutcome::Granted(_)
        ));
    }

    #[tokio::test]
    async fn test_settle_swaps_hold_for_actual_cost() {
        let store = MemoryLedgerStore::new();
        let k = key("user-1");
        store.create_if_absent(&k, 100).await.unwrap();

        let h = hold(40);
        store.reserve(&k, &h).await.unwrap();

        let outcome = store
            .settle(
                &k,
                h.reservation_id,
                &Charge::new(OperationType::ScanImage, 35)
                    .idempotency_key(h.reservation_id.idempotency_key()),
            )
            .await
            .unwrap();

        let period = outcome.period();
        assert_eq!(period.reserved_cents, 0);
        assert_eq!(period.total_cost_cents, 35);
        assert!(period.is_consistent());
    }

    #[tokio::test]
    async fn test_settle_releases_hold_even_when_rejected() {
        let store = MemoryLedgerStore::new();
        let k = key("user-1");
        store.create_if_absent(&k, 100).await.unwrap();

        let h = hold(10);
        store.reserve(&k, &h).await.unwrap();
        store
            .apply_charge(&k, &Charge::new(OperationType::Chat, 95))
            .await
            .unwrap();
        store
            .apply_charge(&k, &Charge::new(OperationType::Chat, 5))
            .await
            .unwrap();

        let outcome = store
            .settle(&k, h.reservation_id, &Charge::new(OperationType::ScanImage, 10))
            .await
            .unwrap();
        assert!(matches!(outcome, ChargeOutcome::Rejected(_)));
        assert_eq!(outcome.period().reserved_cents, 0);
        assert_eq!(outcome.period().total_cost_cents, 100);
    }

    #[tokio::test]
    async fn test_release_expired_reclaims_old_holds() {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = MemoryLedgerStore::with_clock(Arc::new(clock.clone()));
        let k = key("user-1");
        store.create_if_absent(&k, 1_000).await.unwrap();

        store.reserve(&k, &hold(100)).await.unwrap();
        clock.advance(chrono::Duration::minutes(30));
        store.reserve(&k, &hold(200)).await.unwrap();

        let cutoff = start + chrono::Duration::minutes(15);
        assert_eq!(store.release_expired(cutoff).await.unwrap(), 1);

        let period = store.get(&k).await.unwrap().unwrap();
        assert_eq!(period.reserved_cents, 200);
    }
}
