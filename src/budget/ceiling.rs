//! Monthly ceiling resolution.
//!
//! The ceiling is consulted only when a period is first created; later tier
//! changes apply from the next month onward.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Supplies the admissible monthly spend for a user.
#[async_trait::async_trait]
pub trait CeilingResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn ceiling_for(&self, user_id: &UserId) -> crate::Result<u64>;
}

/// Ask `resolver` for the user's ceiling, refusing a zero ceiling before it
/// can reach the store.
pub(crate) async fn resolve_ceiling(
    resolver: &dyn CeilingResolver,
    user_id: &UserId,
) -> crate::Result<u64> {
    match resolver.ceiling_for(user_id).await? {
        0 => Err(crate::Error::Ceiling {
            user_id: user_id.to_string(),
            message: format!("resolver '{}' returned a zero ceiling", resolver.name()),
        }),
        cents => Ok(cents),
    }
}

/// Same ceiling for every user.
#[derive(Debug, Clone, Copy)]
pub struct FixedCeiling(pub u64);

#[async_trait::async_trait]
impl CeilingResolver for FixedCeiling {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn ceiling_for(&self, _user_id: &UserId) -> crate::Result<u64> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
}

/// Ceiling by subscription tier, with per-user tier assignments pushed in
/// by the subscription service.
#[derive(Debug, Clone)]
pub struct TieredCeilings {
    ceilings: HashMap<SubscriptionTier, u64>,
    assignments: Arc<DashMap<UserId, SubscriptionTier>>,
    default_tier: SubscriptionTier,
}

impl TieredCeilings {
    pub fn new(free_cents: u64, premium_cents: u64) -> Self {
        let mut ceilings = HashMap::new();
        ceilings.insert(SubscriptionTier::Free, free_cents);
        ceilings.insert(SubscriptionTier::Premium, premium_cents);
        Self {
            ceilings,
            assignments: Arc::new(DashMap::new()),
            default_tier: SubscriptionTier::Free,
        }
    }

    pub fn with_default_tier(mut self, tier: SubscriptionTier) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn set_tier(&self, user_id: UserId, tier: SubscriptionTier) {
        self.assignments.insert(user_id, tier);
    }

    pub fn remove(&self, user_id: &UserId) -> Option<SubscriptionTier> {
        self.assignments.remove(user_id).map(|(_, tier)| tier)
    }

    pub fn tier_of(&self, user_id: &UserId) -> SubscriptionTier {
        self.assignments
            .get(user_id)
            .map(|t| *t)
            .unwrap_or(self.default_tier)
    }
}

#[async_trait::async_trait]
impl CeilingResolver for TieredCeilings {
    fn name(&self) -> &str {
        "tiered"
    }

    async fn ceiling_for(&self, user_id: &UserId) -> crate::Result<u64> {
        let tier = self.tier_of(user_id);
        self.ceilings
            .get(&tier)
            .copied()
            .ok_or_else(|| crate::Error::Ceiling {
                user_id: user_id.to_string(),
                message: format!("no ceiling configured for tier {:?}", tier),
            })
    }
}
