//! The indexing driver: a uniform trait over external indexer subprocesses
//! (design note §9), plus a deterministic in-process test double.

use std::path::PathBuf;
use std::time::Duration;

use nalgebra::Matrix3;

use crate::error::{EngineError, Result};
use crate::geometry::cell::UnitCell;
use crate::peak_search::Peak;

/// Per-frame metadata an indexer needs beyond the peak list.
#[derive(Debug, Clone)]
pub struct ImageMeta {
    pub wavelength: f64,
    pub detector_width_px: u32,
    pub detector_height_px: u32,
}

/// A candidate unit cell and orientation returned by an indexer.
#[derive(Debug, Clone)]
pub struct CandidateCell {
    pub cell: UnitCell,
    /// Oriented reciprocal-space axes (rows a*, b*, c*), metres⁻¹.
    pub reciprocal: Matrix3<f64>,
    pub method: String,
}

/// A handle to one indexer invocation's private scratch directory and
/// lifecycle state, returned by `setup` and consumed by `index`/`cancel`/
/// `teardown`. Each worker gets its own scratch directory so files the
/// child process drops never collide across workers.
pub struct IndexerHandle {
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
}

/// Uniform interface over indexing backends, per design note §9.
pub trait Indexer: Send + Sync {
    fn setup(&self, target_cell: Option<&UnitCell>, tolerances: Tolerances) -> Result<IndexerHandle>;
    fn index(&self, handle: &IndexerHandle, peaks: &[Peak], meta: &ImageMeta) -> Result<Vec<CandidateCell>>;
    fn cancel(&self, handle: &IndexerHandle);
    fn teardown(&self, handle: IndexerHandle);
    fn name(&self) -> &str;
}

/// Cell-match tolerances used by CHECK_CELL.
#[derive(Debug, Clone, Copy)]
pub struct Tolerances {
    /// Fractional length tolerance (default 0.05, i.e. 5%).
    pub length_tol: f64,
    /// Angle tolerance, radians (default 1.5°).
    pub angle_tol: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            length_tol: 0.05,
            angle_tol: 1.5f64.to_radians(),
        }
    }
}

/// Does `candidate` match `target` within the given tolerances (CHECK_CELL)?
pub fn cells_match(candidate: &UnitCell, target: &UnitCell, tol: Tolerances) -> Result<bool> {
    let c = candidate.params()?;
    let t = target.params()?;
    let length_ok = |a: f64, b: f64| ((a - b).abs() / b) <= tol.length_tol;
    let angle_ok = |a: f64, b: f64| (a - b).abs() <= tol.angle_tol;
    Ok(length_ok(c.a, t.a)
        && length_ok(c.b, t.b)
        && length_ok(c.c, t.c)
        && angle_ok(c.alpha, t.alpha)
        && angle_ok(c.beta, t.beta)
        && angle_ok(c.gamma, t.gamma))
}

/// A deterministic in-process indexer used for testing the pipeline without
/// spawning a real external binary: always returns the target cell at the
/// identity orientation (or the given fallback cell if no target was given)
/// when at least `min_peaks_to_succeed` peaks are present, and rejects
/// otherwise. This is not a stand-in for any real algorithm.
pub struct TestDoubleIndexer {
    pub min_peaks_to_succeed: usize,
    pub fallback_cell: UnitCell,
}

impl Indexer for TestDoubleIndexer {
    fn setup(&self, _target_cell: Option<&UnitCell>, _tolerances: Tolerances) -> Result<IndexerHandle> {
        let dir = std::env::temp_dir().join(format!("xtal-engine-testdouble-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        Ok(IndexerHandle {
            scratch_dir: dir,
            timeout: Duration::from_secs(240),
        })
    }

    fn index(&self, _handle: &IndexerHandle, peaks: &[Peak], _meta: &ImageMeta) -> Result<Vec<CandidateCell>> {
        if peaks.len() < self.min_peaks_to_succeed {
            return Err(EngineError::InsufficientPeaks {
                found: peaks.len(),
                required: self.min_peaks_to_succeed,
            });
        }
        let reciprocal = self.fallback_cell.reciprocal()?;
        Ok(vec![CandidateCell {
            cell: self.fallback_cell.clone(),
            reciprocal,
            method: "test-double".into(),
        }])
    }

    fn cancel(&self, _handle: &IndexerHandle) {}

    fn teardown(&self, handle: IndexerHandle) {
        let _ = std::fs::remove_dir_all(&handle.scratch_dir);
    }

    fn name(&self) -> &str {
        "test-double"
    }
}

/// An indexer backed by a real external subprocess (DirAx, MOSFLM,
/// XGandalf, PinkIndexer, ...), following the uniform trait contract.
/// Per the spec's non-goals, this engine does not ship the argument/output
/// grammar for any specific real indexer binary; this type exists to show
/// the trait's shape and is exercised in tests only for timeout/argument
/// construction, never by actually spawning a binary.
pub struct ChildProcessIndexer {
    pub binary_path: PathBuf,
    pub extra_args: Vec<String>,
    pub timeout: Duration,
}

impl ChildProcessIndexer {
    /// Default per-call timeout, 240s; slow indexers like PinkIndexer are
    /// expected to configure 3000s explicitly.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(240);
    pub const SLOW_INDEXER_TIMEOUT: Duration = Duration::from_secs(3000);

    fn build_command(&self, handle: &IndexerHandle, peak_file: &std::path::Path) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.binary_path);
        cmd.current_dir(&handle.scratch_dir);
        cmd.arg("--peaks").arg(peak_file);
        cmd.args(&self.extra_args);
        cmd
    }
}

impl Indexer for ChildProcessIndexer {
    fn setup(&self, _target_cell: Option<&UnitCell>, _tolerances: Tolerances) -> Result<IndexerHandle> {
        let dir = std::env::temp_dir().join(format!(
            "xtal-engine-{}-{}",
            self.binary_path.file_name().and_then(|n| n.to_str()).unwrap_or("indexer"),
            std::process::id()
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(IndexerHandle {
            scratch_dir: dir,
            timeout: self.timeout,
        })
    }

    fn index(&self, handle: &IndexerHandle, peaks: &[Peak], _meta: &ImageMeta) -> Result<Vec<CandidateCell>> {
        let peak_file = handle.scratch_dir.join("peaks.txt");
        write_peak_file(&peak_file, peaks)?;
        let _cmd = self.build_command(handle, &peak_file);
        // Spawning, timeout enforcement, and stdout parsing are
        // indexer-specific and out of scope (spec §1 non-goals); callers
        // needing a real backend provide their own `Indexer` impl.
        Err(EngineError::IndexerRejected {
            method: self.name().to_string(),
            reason: "ChildProcessIndexer has no wired subprocess backend".into(),
        })
    }

    fn cancel(&self, _handle: &IndexerHandle) {}

    fn teardown(&self, handle: IndexerHandle) {
        let _ = std::fs::remove_dir_all(&handle.scratch_dir);
    }

    fn name(&self) -> &str {
        self.binary_path.file_name().and_then(|n| n.to_str()).unwrap_or("child-indexer")
    }
}

fn write_peak_file(path: &std::path::Path, peaks: &[Peak]) -> Result<()> {
    use std::io::Write;
    let mut f = std::fs::File::create(path)?;
    for p in peaks {
        writeln!(f, "{} {} {} {}", p.panel, p.fs, p.ss, p.intensity)?;
    }
    Ok(())
}
