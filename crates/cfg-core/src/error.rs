use thiserror::Error;

/// Crate-wide errors that are not CPU faults (spec.md §7).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CfgError {
    /// A graph invariant (I1-I4) was violated — a host-level bug, never
    /// raised by a correctly-behaving guest program. Fatal: callers are
    /// expected to stop and dump the offending neighbourhood (spec.md §7).
    #[error("unhandled CFG discrepancy at {context}: {detail}")]
    UnhandledCfgDiscrepancy { context: String, detail: String },

    #[error("scheduler queue is full (capacity {capacity})")]
    SchedulerQueueFull { capacity: usize },
}

impl CfgError {
    pub fn discrepancy(context: impl Into<String>, detail: impl Into<String>) -> Self {
        let context = context.into();
        let detail = detail.into();
        tracing::error!(%context, %detail, "unhandled CFG discrepancy");
        CfgError::UnhandledCfgDiscrepancy { context, detail }
    }
}
