//! Admission policy for proposed charges.

use serde::{Deserialize, Serialize};

use crate::types::UsagePeriod;

/// Why a proposed charge was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The period's sticky limit flag is already set.
    AlreadyAtLimit,
    /// Committed plus reserved spend plus the proposed charge passes the ceiling.
    WouldExceed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyAtLimit => "already_at_limit",
            Self::WouldExceed => "would_exceed",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Deny(DenyReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Admit => None,
            Self::Deny(reason) => Some(*reason),
        }
    }
}

/// Largest cost accepted anywhere in the ledger; every backend stores cents
/// in a signed 64-bit column.
pub const MAX_COST_CENTS: u64 = i64::MAX as u64;

pub fn validate_cost(cost_cents: u64) -> crate::Result<u64> {
    if cost_cents > MAX_COST_CENTS {
        return Err(crate::Error::InvalidCost(format!(
            "{} cents exceeds the maximum of {}",
            cost_cents, MAX_COST_CENTS
        )));
    }
    Ok(cost_cents)
}

/// Decide whether `proposed_cents` may be spent against `period`.
///
/// Pure; safe to call for previews. Outstanding reservations count as spent,
/// which reduces to `total + proposed > ceiling` when nothing is reserved.
pub fn admit(period: &UsagePeriod, proposed_cents: u64) -> Admission {
    if period.limit_reached {
        return Admission::Deny(DenyReason::AlreadyAtLimit);
    }
    match period
        .committed_and_reserved()
        .checked_add(proposed_cents)
    {
        Some(projected) if projected <= period.ceiling_cents => Admission::Admit,
        _ => Admission::Deny(DenyReason::WouldExceed),
    }
}

/// Coarse view of a period's spend against its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeriodStatus {
    WithinBudget {
        used: u64,
        limit: u64,
        remaining: u64,
    },
    Exceeded {
        used: u64,
        limit: u64,
        overage: u64,
    },
}

impl PeriodStatus {
    pub fn of(period: &UsagePeriod) -> Self {
        let used = period.total_cost_cents;
        let limit = period.ceiling_cents;
        if period.limit_reached || used >= limit {
            Self::Exceeded {
                used,
                limit,
                overage: used.saturating_sub(limit),
            }
        } else {
            Self::WithinBudget {
                used,
                limit,
                remaining: limit - used,
            }
        }
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded { .. })
    }

    pub fn used(&self) -> u64 {
        match self {
            Self::WithinBudget { used, .. } | Self::Exceeded { used, .. } => *used,
        }
    }
}
