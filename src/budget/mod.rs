//! Budget policy, monthly ceilings and admission-time cost estimates.

pub mod ceiling;
pub mod estimates;
pub mod policy;

pub(crate) use ceiling::resolve_ceiling;
pub use ceiling::{CeilingResolver, FixedCeiling, SubscriptionTier, TieredCeilings};
pub use estimates::{CostEstimates, CostEstimatesBuilder};
pub use policy::{Admission, DenyReason, MAX_COST_CENTS, PeriodStatus, admit, validate_cost};
