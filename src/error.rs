//! Crate-wide error type. Modules that are matched on by the Supervisor or
//! by callers needing to distinguish failure kinds return `Result<T, DataCenterError>`;
//! the binary edge converts these to `anyhow::Error` via `.context()`, the
//! same boundary style the teacher's `main.rs` uses for its own `anyhow::Result`
//! call chains.

use thiserror::Error;

/// One variant family per error kind in §7.
#[derive(Debug, Error)]
pub enum DataCenterError {
    /// Disk full, brief DB lock contention. Retried with backoff inside the
    /// writer before this is raised.
    #[error("transient I/O error in {component}: {source}")]
    TransientIo {
        component: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("transient storage error in {component}: {source}")]
    TransientStorage {
        component: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Tick without timestamp, unknown exchange id, bar-interval parse
    /// failure. Dropped at the entry point with a warning; unknown
    /// interval tags at startup escalate to `Fatal`.
    #[error("malformed input in {component}: {reason}")]
    MalformedInput {
        component: &'static str,
        reason: String,
    },

    /// Cyclic supervisor dependency, missing required batch columns.
    /// Always fatal, always surfaced to the caller.
    #[error("invariant violation in {component}: {reason}")]
    InvariantViolation {
        component: &'static str,
        reason: String,
    },

    /// Startup-time configuration error (unknown bar interval, unreadable
    /// instrument table) — fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// A shutdown grace period elapsed with work still outstanding. Logged,
    /// not propagated as a hard failure — supervisor proceeds regardless.
    #[error("shutdown timeout in {component} after {elapsed_ms}ms")]
    ShutdownTimeout { component: &'static str, elapsed_ms: u64 },
}

pub type Result<T> = std::result::Result<T, DataCenterError>;

impl From<std::io::Error> for DataCenterError {
    fn from(source: std::io::Error) -> Self {
        Self::TransientIo {
            component: "unknown",
            source,
        }
    }
}

impl From<rusqlite::Error> for DataCenterError {
    fn from(source: rusqlite::Error) -> Self {
        Self::TransientStorage {
            component: "unknown",
            source,
        }
    }
}
