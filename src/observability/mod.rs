//! Structured tracing and local metrics for the ledger.
//!
//! Every admission and commit runs inside a span (`ledger.check`,
//! `ledger.commit`) carrying the user, operation and cost, and updates the
//! atomic counters in [`LedgerMetrics`].

mod metrics;
mod spans;

pub use metrics::{Counter, InFlightGauge, LatencyHistogram, LedgerMetrics, MetricsSummary};
pub use spans::{LedgerSpan, check_span, commit_span, release_span};
