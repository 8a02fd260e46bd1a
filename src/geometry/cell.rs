//! Unit cell representations and conversions.
//!
//! A [`UnitCell`] is always held in exactly one of three representations —
//! crystallographic (a, b, c, α, β, γ), Cartesian direct-space axes, or
//! Cartesian reciprocal-space axes — and converts between them on demand.
//! All lengths are metres; all reciprocal lengths are metres⁻¹ (no 2π
//! factor, matching the convention used throughout this engine's geometry
//! and prediction code).

use nalgebra::{Matrix3, Vector3};

use crate::error::{EngineError, Result};

/// The six scalar cell parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellParams {
    /// Axis length a, metres.
    pub a: f64,
    /// Axis length b, metres.
    pub b: f64,
    /// Axis length c, metres.
    pub c: f64,
    /// Angle α (between b and c), radians.
    pub alpha: f64,
    /// Angle β (between a and c), radians.
    pub beta: f64,
    /// Angle γ (between a and b), radians.
    pub gamma: f64,
}

/// Lattice centering, carried through from a CrystFEL-style cell file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Centering {
    Primitive,
    ACentered,
    BCentered,
    CCentered,
    BodyCentered,
    FaceCentered,
    Rhombohedral,
}

/// Bravais lattice type, carried through from a CrystFEL-style cell file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatticeType {
    Triclinic,
    Monoclinic,
    Orthorhombic,
    Tetragonal,
    Rhombohedral,
    Hexagonal,
    Cubic,
}

/// A unit cell, internally held in exactly one of three representations.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitCell {
    /// Six scalar parameters.
    Crystallographic(CellParams),
    /// Direct-space axes in the lab frame; row i is axis i (a, b, c).
    Cartesian(Matrix3<f64>),
    /// Reciprocal-space axes in the lab frame; row i is axis i (a*, b*, c*).
    Reciprocal(Matrix3<f64>),
}

const DEGENERATE_TOL: f64 = 1e-30;

impl UnitCell {
    /// Build a cell from its six scalar parameters (angles in radians).
    pub fn from_params(params: CellParams) -> Self {
        UnitCell::Crystallographic(params)
    }

    /// Build a cubic cell of edge length `a` (metres).
    pub fn cubic(a: f64) -> Self {
        let half_pi = std::f64::consts::FRAC_PI_2;
        UnitCell::from_params(CellParams {
            a,
            b: a,
            c: a,
            alpha: half_pi,
            beta: half_pi,
            gamma: half_pi,
        })
    }

    /// The six scalar parameters, computing them if the canonical
    /// representation is Cartesian or reciprocal.
    pub fn params(&self) -> Result<CellParams> {
        match self {
            UnitCell::Crystallographic(p) => Ok(*p),
            UnitCell::Cartesian(m) => Ok(params_from_cartesian(m)),
            UnitCell::Reciprocal(_) => {
                let cart = self.cartesian()?;
                Ok(params_from_cartesian(&cart))
            }
        }
    }

    /// Direct-space Cartesian axes (rows a, b, c), computing them if needed.
    ///
    /// Convention: **a** lies along +x, **b** lies in the xy-plane with γ
    /// the angle between **a** and **b**, and the z-component of **c** is
    /// always positive.
    pub fn cartesian(&self) -> Result<Matrix3<f64>> {
        match self {
            UnitCell::Cartesian(m) => Ok(*m),
            UnitCell::Crystallographic(p) => cartesian_from_params(p),
            UnitCell::Reciprocal(recip) => invert_transpose(recip),
        }
    }

    /// Reciprocal-space Cartesian axes (rows a*, b*, c*), computing them if
    /// needed. This is the matrix inverse-transpose of the direct axes,
    /// computed via an explicit LU decomposition; a singular direct-axis
    /// matrix fails with [`EngineError::DegenerateCell`].
    pub fn reciprocal(&self) -> Result<Matrix3<f64>> {
        match self {
            UnitCell::Reciprocal(m) => Ok(*m),
            _ => {
                let direct = self.cartesian()?;
                invert_transpose(&direct)
            }
        }
    }

    /// Cell volume in cubic metres (always positive).
    pub fn volume(&self) -> Result<f64> {
        let cart = self.cartesian()?;
        let a = cart.row(0).transpose();
        let b = cart.row(1).transpose();
        let c = cart.row(2).transpose();
        Ok(a.dot(&b.cross(&c)).abs())
    }

    /// Re-express this cell in the requested canonical representation.
    pub fn into_repr(self, repr: CellRepr) -> Result<UnitCell> {
        match repr {
            CellRepr::Crystallographic => Ok(UnitCell::Crystallographic(self.params()?)),
            CellRepr::Cartesian => Ok(UnitCell::Cartesian(self.cartesian()?)),
            CellRepr::Reciprocal => Ok(UnitCell::Reciprocal(self.reciprocal()?)),
        }
    }
}

/// Tag identifying which of the three representations is canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRepr {
    Crystallographic,
    Cartesian,
    Reciprocal,
}

fn cartesian_from_params(p: &CellParams) -> Result<Matrix3<f64>> {
    if p.a <= 0.0 || p.b <= 0.0 || p.c <= 0.0 {
        return Err(EngineError::DegenerateCell {
            reason: format!("non-positive axis length a={} b={} c={}", p.a, p.b, p.c),
        });
    }
    let (cos_a, cos_b, cos_g) = (p.alpha.cos(), p.beta.cos(), p.gamma.cos());
    let sin_g = p.gamma.sin();
    if sin_g.abs() < 1e-12 {
        return Err(EngineError::DegenerateCell {
            reason: format!("gamma too close to 0 or pi: {}", p.gamma),
        });
    }

    let ax = p.a;
    let ay = 0.0;
    let az = 0.0;

    let bx = p.b * cos_g;
    let by = p.b * sin_g;
    let bz = 0.0;

    let cx = p.c * cos_b;
    let cy = p.c * (cos_a - cos_b * cos_g) / sin_g;
    let cz_sq = 1.0 - cos_a * cos_a - cos_b * cos_b - cos_g * cos_g + 2.0 * cos_a * cos_b * cos_g;
    if cz_sq <= DEGENERATE_TOL {
        return Err(EngineError::DegenerateCell {
            reason: "cell angles are not geometrically consistent".into(),
        });
    }
    // Sign convention: z-component of c is always positive.
    let cz = p.c * cz_sq.sqrt() / sin_g;

    Ok(Matrix3::new(ax, ay, az, bx, by, bz, cx, cy, cz))
}

fn params_from_cartesian(m: &Matrix3<f64>) -> CellParams {
    let a_vec = m.row(0).transpose();
    let b_vec = m.row(1).transpose();
    let c_vec = m.row(2).transpose();
    let a = a_vec.norm();
    let b = b_vec.norm();
    let c = c_vec.norm();
    let alpha = (b_vec.dot(&c_vec) / (b * c)).clamp(-1.0, 1.0).acos();
    let beta = (a_vec.dot(&c_vec) / (a * c)).clamp(-1.0, 1.0).acos();
    let gamma = (a_vec.dot(&b_vec) / (a * b)).clamp(-1.0, 1.0).acos();
    CellParams { a, b, c, alpha, beta, gamma }
}

/// Invert-transpose a 3x3 matrix via an explicit LU decomposition, failing
/// with `DegenerateCell` if the matrix is singular.
fn invert_transpose(m: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let lu = nalgebra::linalg::LU::new(*m);
    let det = lu.determinant();
    if det.abs() < 1e-30 {
        return Err(EngineError::DegenerateCell {
            reason: format!("singular axis matrix (det={det:e})"),
        });
    }
    let inv = lu.try_inverse().ok_or_else(|| EngineError::DegenerateCell {
        reason: "LU decomposition could not be inverted".into(),
    })?;
    Ok(inv.transpose())
}

/// Rotate a unit cell's Cartesian representation by an orthogonal matrix,
/// used when the indexer hands back a crystal orientation.
pub fn rotate_cartesian(axes: &Matrix3<f64>, rotation: &Matrix3<f64>) -> Matrix3<f64> {
    // Rows are vectors, so rotate each row: axes' = axes * R^T.
    axes * rotation.transpose()
}

/// Map fractional Miller indices (h,k,l) to a reciprocal-space vector, in
/// metres⁻¹, given the cell's reciprocal Cartesian axes.
pub fn hkl_to_vector(recip: &Matrix3<f64>, h: i32, k: i32, l: i32) -> Vector3<f64> {
    let a_star = recip.row(0).transpose();
    let b_star = recip.row(1).transpose();
    let c_star = recip.row(2).transpose();
    (h as f64) * a_star + (k as f64) * b_star + (l as f64) * c_star
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cubic_roundtrip_trivial() {
        // Scenario 1 from spec §8: UnitCell(10nm,10nm,10nm,90,90,90)
        let cell = UnitCell::cubic(10e-9);
        let cart = cell.cartesian().unwrap();
        assert_relative_eq!(cart[(0, 0)], 1e-8, epsilon = 1e-18);
        assert_relative_eq!(cart[(0, 1)], 0.0, epsilon = 1e-18);
        assert_relative_eq!(cart[(0, 2)], 0.0, epsilon = 1e-18);
        assert_relative_eq!(cart[(1, 1)], 1e-8, epsilon = 1e-18);
        assert_relative_eq!(cart[(2, 2)], 1e-8, epsilon = 1e-18);

        let recip = cell.reciprocal().unwrap();
        for row in 0..3 {
            let v = recip.row(row).transpose();
            assert_relative_eq!(v.norm(), 1e8, epsilon = 1e2);
        }
    }

    #[test]
    fn roundtrip_preserves_params_for_all_representations() {
        let params = CellParams {
            a: 5e-10,
            b: 6e-10,
            c: 7e-10,
            alpha: 80f64.to_radians(),
            beta: 95f64.to_radians(),
            gamma: 100f64.to_radians(),
        };
        let cell = UnitCell::from_params(params);

        for repr in [CellRepr::Crystallographic, CellRepr::Cartesian, CellRepr::Reciprocal] {
            let converted = cell.clone().into_repr(repr).unwrap();
            let back = converted.params().unwrap();
            assert_relative_eq!(back.a, params.a, max_relative = 1e-9);
            assert_relative_eq!(back.b, params.b, max_relative = 1e-9);
            assert_relative_eq!(back.c, params.c, max_relative = 1e-9);
            assert_relative_eq!(back.alpha, params.alpha, max_relative = 1e-9);
            assert_relative_eq!(back.beta, params.beta, max_relative = 1e-9);
            assert_relative_eq!(back.gamma, params.gamma, max_relative = 1e-9);
        }
    }

    #[test]
    fn degenerate_cell_rejected() {
        let params = CellParams {
            a: 1e-9,
            b: 1e-9,
            c: 1e-9,
            alpha: 0.0,
            beta: 0.0,
            gamma: 0.0,
        };
        let cell = UnitCell::from_params(params);
        assert!(cell.cartesian().is_err());
    }

    #[test]
    fn reciprocal_of_reciprocal_is_direct() {
        let cell = UnitCell::from_params(CellParams {
            a: 5e-10,
            b: 6e-10,
            c: 7e-10,
            alpha: 85f64.to_radians(),
            beta: 92f64.to_radians(),
            gamma: 100f64.to_radians(),
        });
        let direct = cell.cartesian().unwrap();
        let recip_cell = UnitCell::Reciprocal(cell.reciprocal().unwrap());
        let back = recip_cell.cartesian().unwrap();
        for r in 0..3 {
            for c in 0..3 {
                assert_relative_eq!(back[(r, c)], direct[(r, c)], max_relative = 1e-6);
            }
        }
    }
}
