//! Statement tracing hook.
//!
//! A tracer sees every statement the gateway runs, at start and at end. It is
//! how external tooling logs traffic, and how the race harness injects a
//! cancellation at exactly the right moment.

use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;
use crate::store::{describe, StatementKind};

pub struct StatementStart<'a> {
    pub kind: StatementKind,
    pub sql: &'a str,
    pub params: &'a [String],
}

pub enum StatementOutcome<'a> {
    /// Statement completed and returned this many rows.
    Rows(usize),
    Failed(&'a StoreError),
    /// Abandoned by its scope before the result arrived.
    Cancelled,
}

pub struct StatementEnd<'a> {
    pub kind: StatementKind,
    pub sql: &'a str,
    pub outcome: StatementOutcome<'a>,
    pub elapsed: Duration,
}

/// Observer of gateway statements. Callbacks run inline on the statement's
/// task and must not block.
pub trait StatementTracer: Send + Sync {
    fn statement_start(&self, event: &StatementStart<'_>);
    fn statement_end(&self, event: &StatementEnd<'_>);
}

/// Emits one `tracing` debug event per statement boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl StatementTracer for LogTracer {
    fn statement_start(&self, event: &StatementStart<'_>) {
        debug!(
            kind = %event.kind,
            sql = %describe(event.sql, event.params),
            "statement start"
        );
    }

    fn statement_end(&self, event: &StatementEnd<'_>) {
        let elapsed_ms = event.elapsed.as_millis() as u64;
        match &event.outcome {
            StatementOutcome::Rows(rows) => {
                debug!(kind = %event.kind, rows, elapsed_ms, "statement end")
            }
            StatementOutcome::Failed(err) => {
                debug!(kind = %event.kind, error = %err, elapsed_ms, "statement failed")
            }
            StatementOutcome::Cancelled => {
                debug!(kind = %event.kind, elapsed_ms, "statement cancelled")
            }
        }
    }
}
