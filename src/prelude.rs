//! Prelude module for convenient imports.
//!
//! ```rust
//! use usage_ledger::prelude::*;
//! ```

pub use crate::Error;
pub use crate::Result;

// Ledger facade
pub use crate::reservation::{Billed, Reservation, ReservationState, UsageLedger};
pub use crate::summary::UsageSummary;

// Types
pub use crate::types::{OperationType, PeriodKey, UsagePeriod, UserId};

// Policy and ceilings
pub use crate::budget::{CeilingResolver, DenyReason, FixedCeiling, TieredCeilings};
pub use crate::config::{EnforcementMode, LedgerConfig};

// Storage
pub use crate::ledger::{LedgerStore, MemoryLedgerStore};
