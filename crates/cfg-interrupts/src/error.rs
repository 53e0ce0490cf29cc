use thiserror::Error;

/// An I/O port or callback index the host never registered (spec.md §7
/// `UnhandledOperation`). Surfaced, not fatal: callers decide whether to
/// log-and-continue (reads return 0) or halt, per their own configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unhandled operation in {context}: {detail}")]
pub struct UnhandledOperation {
    pub context: String,
    pub detail: String,
}

impl UnhandledOperation {
    pub fn new(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            detail: detail.into(),
        }
    }
}
