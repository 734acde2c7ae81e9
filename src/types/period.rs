//! Per-user, per-calendar-month usage record.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::{OperationType, UserId};

/// Identity of a [`UsagePeriod`]: one per user per calendar month (UTC).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeriodKey {
    pub user_id: UserId,
    pub year: i32,
    pub month: u32,
}

impl PeriodKey {
    pub fn new(user_id: UserId, year: i32, month: u32) -> crate::Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(crate::Error::Config(format!(
                "month must be 1-12, got {}",
                month
            )));
        }
        Ok(Self {
            user_id,
            year,
            month,
        })
    }

    /// Key of the month containing `at`.
    pub fn containing(user_id: UserId, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn next(&self) -> Self {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        Self {
            user_id: self.user_id.clone(),
            year,
            month,
        }
    }

    /// `2026-03` style label.
    pub fn month_label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:04}-{:02}", self.user_id, self.year, self.month)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub cost_cents: u64,
    pub count: u64,
}

/// Ledger record for one [`PeriodKey`].
///
/// `total_cost_cents` always equals the sum of the per-category costs, only
/// grows, and once `limit_reached` is set the record accepts no further
/// charges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub key: PeriodKey,
    /// Fixed when the period is created.
    pub ceiling_cents: u64,
    pub total_cost_cents: u64,
    /// Outstanding hard reservations not yet settled or released.
    #[serde(default)]
    pub reserved_cents: u64,
    #[serde(default)]
    pub categories: BTreeMap<OperationType, CategoryUsage>,
    pub limit_reached: bool,
    pub limit_reached_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UsagePeriod {
    pub fn new(key: PeriodKey, ceiling_cents: u64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            ceiling_cents,
            total_cost_cents: 0,
            reserved_cents: 0,
            categories: BTreeMap::new(),
            limit_reached: false,
            limit_reached_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a committed charge in place.
    ///
    /// Returns `None` without touching the record when the limit was already
    /// reached, otherwise `Some(crossed)` where `crossed` reports whether this
    /// charge set the sticky flag.
    pub(crate) fn try_charge(
        &mut self,
        operation: OperationType,
        cost_cents: u64,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        if self.limit_reached {
            return None;
        }

        self.total_cost_cents = self.total_cost_cents.saturating_add(cost_cents);
        let category = self.categories.entry(operation).or_default();
        category.cost_cents = category.cost_cents.saturating_add(cost_cents);
        category.count += 1;
        self.updated_at = now;

        let crossed = self.total_cost_cents >= self.ceiling_cents;
        if crossed {
            self.limit_reached = true;
            self.limit_reached_at = Some(now);
        }
        Some(crossed)
    }

    pub fn committed_and_reserved(&self) -> u64 {
        self.total_cost_cents.saturating_add(self.reserved_cents)
    }

    /// Budget still admissible, net of outstanding reservations.
    pub fn remaining_cents(&self) -> u64 {
        if self.limit_reached {
            return 0;
        }
        self.ceiling_cents
            .saturating_sub(self.committed_and_reserved())
    }

    pub fn category_cost(&self, operation: OperationType) -> u64 {
        self.categories
            .get(&operation)
            .map(|c| c.cost_cents)
            .unwrap_or(0)
    }

    pub fn category_count(&self, operation: OperationType) -> u64 {
        self.categories
            .get(&operation)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    pub fn commit_count(&self) -> u64 {
        self.categories.values().map(|c| c.count).sum()
    }

    pub fn usage_percent(&self) -> f64 {
        if self.ceiling_cents == 0 {
            return 100.0;
        }
        self.total_cost_cents as f64 / self.ceiling_cents as f64 * 100.0
    }

    /// `true` when the total matches the per-category breakdown.
    pub fn is_consistent(&self) -> bool {
        let sum: u64 = self.categories.values().map(|c| c.cost_cents).sum();
        sum == self.total_cost_cents
    }
}
