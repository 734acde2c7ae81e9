//! Structured span definitions for tracing.

use std::time::Instant;
use tracing::{Level, Span, field, span};

use crate::types::{OperationType, UserId};

/// Span plus start time, so the outcome and latency can be recorded when the
/// protocol step finishes.
pub struct LedgerSpan {
    span: Span,
    start: Instant,
}

impl LedgerSpan {
    fn new(span: Span) -> Self {
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn record_period(&self, period: &str) {
        self.span.record("period", period);
    }

    pub fn finish(self, outcome: &str) -> f64 {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("outcome", outcome);
        self.span.record("latency_ms", latency_ms as u64);
        latency_ms
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

pub fn check_span(user_id: &UserId, operation: OperationType, estimate_cents: u64) -> LedgerSpan {
    LedgerSpan::new(span!(
        Level::INFO,
        "ledger.check",
        user_id = %user_id,
        operation = %operation,
        estimate_cents = estimate_cents,
        period = field::Empty,
        outcome = field::Empty,
        latency_ms = field::Empty,
    ))
}

pub fn commit_span(user_id: &UserId, operation: OperationType, cost_cents: u64) -> LedgerSpan {
    LedgerSpan::new(span!(
        Level::INFO,
        "ledger.commit",
        user_id = %user_id,
        operation = %operation,
        cost_cents = cost_cents,
        period = field::Empty,
        outcome = field::Empty,
        latency_ms = field::Empty,
    ))
}

pub fn release_span(user_id: &UserId, operation: OperationType) -> LedgerSpan {
    LedgerSpan::new(span!(
        Level::DEBUG,
        "ledger.release",
        user_id = %user_id,
        operation = %operation,
        period = field::Empty,
        outcome = field::Empty,
        latency_ms = field::Empty,
    ))
}
