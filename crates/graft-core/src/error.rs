//! Classified engine failures.
//!
//! Operations return `anyhow::Result`; failures that callers need to
//! distinguish are raised as `EngineError` so they can be downcast.

use thiserror::Error;

/// Failure kinds surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation precondition does not hold (missing dependency,
    /// conflicting skill, active customize session, rebase-locked uninstall).
    #[error("{0}")]
    Precondition(String),

    /// Malformed manifest or request (missing field, unknown key, bad path).
    #[error("{0}")]
    InvalidInput(String),

    /// A manifest or file-operation path would resolve outside the project root.
    #[error("path escapes project root: {0}")]
    PathTraversal(String),

    /// Structured data that cannot be unified (dependency ranges, host ports).
    #[error("{0}")]
    Incompatible(String),

    /// A subprocess exited non-zero.
    #[error("command failed: {command}: {detail}")]
    Subprocess { command: String, detail: String },

    /// A subprocess exceeded its timeout budget.
    #[error("command timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    /// Another live process holds the engine lock.
    #[error("operation in progress (pid {pid}, started {started}); delete .g2/lock if stale")]
    LockContention { pid: u32, started: String },
}

impl EngineError {
    /// Build a precondition failure from anything displayable.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Build an invalid-input failure from anything displayable.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
