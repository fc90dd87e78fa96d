//! Error types for the harness crate

use thiserror::Error;

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Harness errors
///
/// Everything here ends an artifact's evaluation. The transactional retry
/// signal deliberately lives elsewhere ([`crate::tx::TxError`]): it is
/// recovered locally by the retry combinator and never bubbles this far.
#[derive(Debug, Clone, Error)]
pub enum HarnessError {
    #[error("unable to resolve the given path '{path}'")]
    PathResolve { path: String },

    #[error("unable to load a transaction library '{path}': {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("symbol '{symbol}' not found in loaded library")]
    SymbolNotFound { symbol: String },

    #[error("shared memory region creation failed")]
    RegionCreate,

    #[error("transaction begin failed")]
    TxBegin,

    #[error("memory allocation failed (insufficient memory)")]
    OutOfMemory,

    #[error("invalid workload configuration: {reason}")]
    Config { reason: &'static str },

    /// A correctness violation observed by the workload. The message is the
    /// single line reported to the user.
    #[error("{message}")]
    Violation { message: &'static str },

    /// A side operation or a whole phase blew its wall-clock budget. The
    /// worker threads may still be executing inside the artifact, so the
    /// engine must not unload it.
    #[error("{message}")]
    Overrun { message: &'static str },

    #[error("failed to spawn worker thread: {reason}")]
    Spawn { reason: String },

    #[error("unreachable harness state: {context}")]
    Unreachable { context: &'static str },
}
