//! Progress reporting for bulk phases (spec §7: "a running progress bar").
//!
//! Library code depends only on the [`Progress`] trait; the `indicatif`
//! backend is wired in by the CLI binaries, keeping `indicatif` out of the
//! pipeline/scaling crate surface.

/// A sink for bulk-phase progress updates. Implementations must be safe to
/// call from multiple worker threads concurrently.
pub trait Progress: Send + Sync {
    /// Set (or reset) the total item count for the current phase.
    fn set_total(&self, total: u64);
    /// Report the current completed-item count. Must be safe to call with
    /// a value lower than a previous call returns without panicking, though
    /// callers in this engine only ever report non-decreasing values.
    fn set_position(&self, position: u64);
    /// Mark the current phase as finished.
    fn finish(&self) {}
}

/// A `Progress` implementation that does nothing; used in tests and any
/// context without a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl Progress for NoopProgress {
    fn set_total(&self, _total: u64) {}
    fn set_position(&self, _position: u64) {}
}
