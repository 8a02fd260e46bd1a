//! Multi-panel detector geometry and unit-cell representations.
//!
//! This module covers component A: detector panel geometry and the three
//! interconvertible unit-cell representations, plus text parsers for the
//! geometry and cell file formats described in the external-interfaces
//! section.

pub mod cell;
pub mod cell_file;
pub mod detector;
pub mod geom_file;

pub use cell::{CellParams, CellRepr, Centering, LatticeType, UnitCell};
pub use detector::{Detector, Panel};
