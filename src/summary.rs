//! Read-only usage reporting for client screens.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::budget::{CeilingResolver, PeriodStatus, resolve_ceiling};
use crate::clock::Clock;
use crate::ledger::LedgerStore;
use crate::types::{CategoryUsage, OperationType, PeriodKey, UsagePeriod, UserId};
use crate::{Error, Result};

/// Snapshot of one user's month, as shown on the usage screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub user_id: UserId,
    pub year: i32,
    pub month: u32,
    pub ceiling_cents: u64,
    pub total_cost_cents: u64,
    pub reserved_cents: u64,
    /// Net of in-flight reservations; zero once the limit is reached.
    pub remaining_cents: u64,
    pub per_category: BTreeMap<OperationType, CategoryUsage>,
    pub commit_count: u64,
    pub limit_reached: bool,
    pub limit_reached_at: Option<DateTime<Utc>>,
    pub usage_percent: f64,
    pub status: PeriodStatus,
    /// Last write to the period, or the read time for an untouched month.
    pub updated_at: DateTime<Utc>,
}

impl UsageSummary {
    pub fn from_period(period: &UsagePeriod) -> Self {
        Self {
            user_id: period.key.user_id.clone(),
            year: period.key.year,
            month: period.key.month,
            ceiling_cents: period.ceiling_cents,
            total_cost_cents: period.total_cost_cents,
            reserved_cents: period.reserved_cents,
            remaining_cents: period.remaining_cents(),
            per_category: period.categories.clone(),
            commit_count: period.commit_count(),
            limit_reached: period.limit_reached,
            limit_reached_at: period.limit_reached_at,
            usage_percent: period.usage_percent(),
            status: PeriodStatus::of(period),
            updated_at: period.updated_at,
        }
    }

    /// Summary of a month with no recorded usage, as of `now`.
    pub fn untouched(key: &PeriodKey, ceiling_cents: u64, now: DateTime<Utc>) -> Self {
        Self::from_period(&UsagePeriod::new(key.clone(), ceiling_cents, now))
    }

    pub fn category_cost(&self, operation: OperationType) -> u64 {
        self.per_category
            .get(&operation)
            .map(|c| c.cost_cents)
            .unwrap_or(0)
    }
}

/// Queries the store on every call; nothing is cached between requests.
pub struct UsageSummaryReader {
    store: Arc<dyn LedgerStore>,
    ceilings: Arc<dyn CeilingResolver>,
    clock: Arc<dyn Clock>,
}

impl UsageSummaryReader {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ceilings: Arc<dyn CeilingResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ceilings,
            clock,
        }
    }

    pub async fn summarize(&self, user_id: &UserId, year: i32, month: u32) -> Result<UsageSummary> {
        let key = PeriodKey::new(user_id.clone(), year, month)?;
        self.summarize_key(&key).await
    }

    pub async fn current(&self, user_id: &UserId) -> Result<UsageSummary> {
        let key = PeriodKey::containing(user_id.clone(), self.clock.now());
        self.summarize_key(&key).await
    }

    async fn summarize_key(&self, key: &PeriodKey) -> Result<UsageSummary> {
        match self.store.get(key).await.map_err(Error::from)? {
            Some(period) => Ok(UsageSummary::from_period(&period)),
            None => {
                let ceiling = resolve_ceiling(self.ceilings.as_ref(), &key.user_id).await?;
                Ok(UsageSummary::untouched(key, ceiling, self.clock.now()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::FixedCeiling;
    use crate::clock::ManualClock;
    use crate::ledger::{Charge, MemoryLedgerStore};
    use chrono::TimeZone;

    fn reader() -> (UsageSummaryReader, Arc<MemoryLedgerStore>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap());
        let store = Arc::new(MemoryLedgerStore::with_clock(Arc::new(clock.clone())));
        let reader = UsageSummaryReader::new(
            store.clone(),
            Arc::new(FixedCeiling(200)),
            Arc::new(clock),
        );
        (reader, store)
    }

    #[tokio::test]
    async fn test_missing_period_is_untouched_and_not_created() {
        let (reader, store) = reader();
        let user = UserId::new("new-user").unwrap();

        let summary = reader.current(&user).await.unwrap();

        assert_eq!(summary.total_cost_cents, 0);
        assert_eq!(summary.remaining_cents, 200);
        assert_eq!((summary.year, summary.month), (2026, 3));
        assert!(!summary.limit_reached);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_untouched_summary_uses_injected_clock() {
        let (reader, _) = reader();
        let user = UserId::new("new-user").unwrap();

        let summary = reader.summarize(&user, 2026, 2).await.unwrap();

        assert_eq!(
            summary.updated_at,
            Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap()
        );
        assert!(summary.limit_reached_at.is_none());
    }

    #[tokio::test]
    async fn test_summary_reports_categories() {
        let (reader, store) = reader();
        let user = UserId::new("user-1").unwrap();
        let key = PeriodKey::new(user.clone(), 2026, 3).unwrap();
        store.create_if_absent(&key, 200).await.unwrap();
        store
            .apply_charge(&key, &Charge::new(OperationType::ScanImage, 120))
            .await
            .unwrap();
        store
            .apply_charge(&key, &Charge::new(OperationType::Chat, 30))
            .await
            .unwrap();

        let summary = reader.summarize(&user, 2026, 3).await.unwrap();

        assert_eq!(summary.total_cost_cents, 150);
        assert_eq!(summary.remaining_cents, 50);
        assert_eq!(summary.category_cost(OperationType::ScanImage), 120);
        assert_eq!(summary.commit_count, 2);
        assert!(!summary.status.is_exceeded());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"]["status"], "within_budget");
        assert_eq!(json["per_category"]["chat"]["cost_cents"], 30);
    }

    #[tokio::test]
    async fn test_invalid_month_rejected() {
        let (reader, _) = reader();
        let user = UserId::new("user-1").unwrap();
        assert!(reader.summarize(&user, 2026, 0).await.is_err());
    }
}
