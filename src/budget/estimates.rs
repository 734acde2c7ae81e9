//! Default per-operation cost estimates used at admission time.
//!
//! Estimates only gate admission; the recorder always commits the actual cost
//! reported by the AI boundary. Values can be overridden through environment
//! variables or configuration files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigResult, env_parse};
use crate::types::OperationType;

const FALLBACK_ESTIMATE_CENTS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostEstimates {
    per_operation: BTreeMap<OperationType, u64>,
    default_cents: u64,
}

impl CostEstimates {
    pub fn builder() -> CostEstimatesBuilder {
        CostEstimatesBuilder::new()
    }

    pub fn get(&self, operation: OperationType) -> u64 {
        self.per_operation
            .get(&operation)
            .copied()
            .unwrap_or(self.default_cents)
    }

    pub fn set(&mut self, operation: OperationType, cents: u64) {
        self.per_operation.insert(operation, cents);
    }

    pub fn default_cents(&self) -> u64 {
        self.default_cents
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperationType, u64)> + '_ {
        self.per_operation.iter().map(|(op, cents)| (*op, *cents))
    }
}

impl Default for CostEstimates {
    fn default() -> Self {
        CostEstimatesBuilder::new().with_defaults().build()
    }
}

#[derive(Debug, Default)]
pub struct CostEstimatesBuilder {
    per_operation: BTreeMap<OperationType, u64>,
    default_cents: Option<u64>,
}

impl CostEstimatesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        self.per_operation.insert(OperationType::ScanImage, 4);
        self.per_operation.insert(OperationType::BodyScan, 6);
        self.per_operation.insert(OperationType::Chat, 1);
        self.per_operation.insert(OperationType::ShoppingList, 1);
        self.per_operation.insert(OperationType::MealPlan, 5);
        self.per_operation.insert(OperationType::RecipeSuggestion, 2);
        self
    }

    pub fn operation(mut self, operation: OperationType, cents: u64) -> Self {
        self.per_operation.insert(operation, cents);
        self
    }

    pub fn default_cents(mut self, cents: u64) -> Self {
        self.default_cents = Some(cents);
        self
    }

    /// Defaults overridden by `USAGE_LEDGER_ESTIMATE_<OPERATION>` variables.
    /// A value that is not a whole number of cents is an error.
    pub fn with_env_overrides(mut self) -> ConfigResult<Self> {
        self = self.with_defaults();

        for op in OperationType::ALL {
            if let Some(cents) = env_parse::<u64>(&format!("ESTIMATE_{}", op.env_suffix()))? {
                self.per_operation.insert(op, cents);
            }
        }

        Ok(self)
    }

    pub fn build(self) -> CostEstimates {
        CostEstimates {
            per_operation: self.per_operation,
            default_cents: self.default_cents.unwrap_or(FALLBACK_ESTIMATE_CENTS),
        }
    }
}
