//! Error types for the engine.

use thiserror::Error;

/// Main error type for core-engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying I/O failure (geometry/cell/stream file access).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A parsed file violated its grammar.
    #[error("malformed input in {path}: {reason}")]
    MalformedInput { path: String, reason: String },

    /// A unit cell's matrix is singular and cannot be inverted.
    #[error("degenerate cell: {reason}")]
    DegenerateCell { reason: String },

    /// Not enough peaks were found to attempt indexing.
    #[error("insufficient peaks for indexing: found {found}, need at least {required}")]
    InsufficientPeaks { found: usize, required: usize },

    /// An external indexer subprocess exceeded its allotted time.
    #[error("indexer {method} timed out after {timeout_secs}s")]
    IndexerTimeout { method: String, timeout_secs: u64 },

    /// An external indexer ran but returned no usable candidate cell.
    #[error("indexer {method} rejected the frame: {reason}")]
    IndexerRejected { method: String, reason: String },

    /// Integration of a predicted reflection failed outright.
    #[error("integration failed for reflection ({h},{k},{l}): {reason}")]
    IntegrationFailed { h: i32, k: i32, l: i32, reason: String },

    /// A linear system (scaling or post-refinement) was singular.
    #[error("linear solve singular: {reason}")]
    LinAlgSingular { reason: String },

    /// Allocation failure during per-frame processing.
    #[error("out of memory while processing {context}")]
    OutOfMemory { context: String },

    /// A bounded operation exceeded its deadline.
    #[error("operation timed out: {context}")]
    Timeout { context: String },

    /// Cooperative cancellation observed a stop request.
    #[error("cancelled: {context}")]
    Cancelled { context: String },

    /// A geometry description was structurally invalid (bad panel, overlap, etc).
    #[error("invalid geometry: {reason}")]
    InvalidGeometry { reason: String },

    /// A cell description (file or in-memory) was structurally invalid.
    #[error("invalid cell: {reason}")]
    InvalidCell { reason: String },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Policy for how a processing stage should react to a recoverable error.
///
/// Setup-time failures (missing geometry, unparseable cell) always abort
/// regardless of this policy; it governs only per-frame / per-crystal work,
/// per spec §7's propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Abort the whole run on the first error.
    Fail,
    /// Record the failure on the affected unit (frame/crystal) and continue.
    #[default]
    Continue,
}

impl ErrorPolicy {
    /// Returns true if this policy should abort the whole run.
    pub fn should_abort(&self) -> bool {
        matches!(self, ErrorPolicy::Fail)
    }
}
