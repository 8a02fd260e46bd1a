//! # xtal_engine
//!
//! Core processing engine for serial crystallography: peak search,
//! indexing-assisted geometric prediction, partiality modeling, intensity
//! integration, and scaling/post-refinement of XFEL diffraction snapshots.
//!
//! ## Pipeline
//!
//! - **Geometry**: multi-panel detector description and the three
//!   interconvertible unit-cell representations ([`geometry`])
//! - **Peak search**: Zaef gradient-walk and Peakfinder8/9 connected-component
//!   search over raw panel images ([`peak_search`])
//! - **Indexing**: a uniform trait over external indexing backends plus a
//!   deterministic test double ([`indexer`])
//! - **Prediction**: the two-Ewald-sphere partiality model and reflection
//!   prediction against a detector ([`prediction`]), with analytic gradients
//!   for post-refinement ([`gradients`]), and per-candidate prediction-
//!   refinement plus peak-coverage validation ([`refine`])
//! - **Integration**: annulus background estimation and intensity summation
//!   ([`integration`])
//! - **Scaling**: iterative scale-factor/full-intensity estimation and
//!   per-crystal post-refinement ([`scaling`]), merging by symmetry-unique
//!   Miller index under a configured point group ([`symmetry`])
//! - **Orchestration**: per-frame pipeline wiring the above together
//!   ([`pipeline`]) and a worker pool for driving it across many frames
//!   ([`worker_pool`])
//! - **I/O**: the append-only stream codec ([`stream`]) and MessagePack
//!   peak-list import ([`msgpack`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use xtal_engine::geometry::UnitCell;
//!
//! let cell = UnitCell::cubic(10e-9);
//! let reciprocal = cell.reciprocal()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

// Core types
pub mod geometry;
pub mod reflection;

// Algorithms
pub mod gradients;
pub mod indexer;
pub mod integration;
pub mod peak_search;
pub mod prediction;
pub mod refine;
pub mod scaling;
pub mod symmetry;

// Orchestration
pub mod config;
pub mod pipeline;
pub mod progress;
pub mod worker_pool;

// I/O
pub mod msgpack;
pub mod stream;

// Re-exports for convenience
pub use error::{EngineError, ErrorPolicy, Result};
