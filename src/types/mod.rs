//! Core ledger data types.

mod ids;
mod operation;
mod period;

pub use ids::{ReservationId, UserId};
pub use operation::OperationType;
pub use period::{CategoryUsage, PeriodKey, UsagePeriod};
