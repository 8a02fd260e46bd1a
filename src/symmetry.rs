//! Point-group symmetry reduction of Miller indices (component H's "for each
//! symmetry-unique (h,k,l)" merge key), generalising the Miller-index-family
//! grouping used for powder-pattern multiplicities: every reflection in an
//! orbit under the point group's operations is mapped to one lexicographically
//! maximal representative.

use std::collections::HashSet;

use crate::reflection::Hkl;

/// A point-group operation acting on Miller indices, as an integer matrix.
pub type IntMat3 = [[i32; 3]; 3];

const IDENTITY: IntMat3 = [[1, 0, 0], [0, 1, 0], [0, 0, 1]];
const INVERSION: IntMat3 = [[-1, 0, 0], [0, -1, 0], [0, 0, -1]];

fn mat_mul(a: &IntMat3, b: &IntMat3) -> IntMat3 {
    let mut out = [[0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn apply(m: &IntMat3, hkl: Hkl) -> Hkl {
    let (h, k, l) = hkl;
    (
        m[0][0] * h + m[0][1] * k + m[0][2] * l,
        m[1][0] * h + m[1][1] * k + m[1][2] * l,
        m[2][0] * h + m[2][1] * k + m[2][2] * l,
    )
}

/// Generate the closure of a generator set under matrix multiplication: the
/// full finite point group those generators span.
fn closure(generators: &[IntMat3]) -> Vec<IntMat3> {
    let mut seen: HashSet<IntMat3> = HashSet::new();
    seen.insert(IDENTITY);
    let mut frontier: Vec<IntMat3> = vec![IDENTITY];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for g in generators {
            for f in &frontier {
                let candidate = mat_mul(g, f);
                if seen.insert(candidate) {
                    next.push(candidate);
                }
            }
        }
        frontier = next;
    }
    seen.into_iter().collect()
}

/// Laue classes covering the point-group symmetries this engine reduces
/// against. Each is assumed centrosymmetric: Friedel's law already merges
/// `(h,k,l)` with `(-h,-k,-l)` for non-anomalous intensity data, so every
/// class includes inversion regardless of whether the underlying space
/// group does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointGroup {
    /// 1 (no symmetry beyond Friedel's law is even assumed away; kept for
    /// completeness as the trivial non-centrosymmetric class).
    P1,
    /// -1, triclinic.
    Triclinic,
    /// 2/m, unique axis b.
    Monoclinic,
    /// mmm, orthorhombic.
    Orthorhombic,
    /// 4/m, tetragonal.
    Tetragonal4M,
    /// 4/mmm, tetragonal.
    Tetragonal4Mmm,
    /// -3, trigonal (hexagonal axes).
    Trigonal3Bar,
    /// -3m, trigonal (hexagonal axes).
    Trigonal3BarM,
    /// 6/m, hexagonal.
    Hexagonal6M,
    /// 6/mmm, hexagonal.
    Hexagonal6Mmm,
    /// m-3, cubic.
    CubicM3,
    /// m-3m, cubic.
    CubicM3m,
}

impl PointGroup {
    /// Parse a Hermann-Mauguin-ish point-group symbol, as it would appear
    /// after `partialator`'s `-y` flag.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol.trim() {
            "1" => PointGroup::P1,
            "-1" => PointGroup::Triclinic,
            "2/m" => PointGroup::Monoclinic,
            "mmm" => PointGroup::Orthorhombic,
            "4/m" => PointGroup::Tetragonal4M,
            "4/mmm" => PointGroup::Tetragonal4Mmm,
            "-3" => PointGroup::Trigonal3Bar,
            "-3m" => PointGroup::Trigonal3BarM,
            "6/m" => PointGroup::Hexagonal6M,
            "6/mmm" => PointGroup::Hexagonal6Mmm,
            "m-3" | "m3" => PointGroup::CubicM3,
            "m-3m" | "m3m" => PointGroup::CubicM3m,
            _ => return None,
        })
    }

    fn generators(&self) -> Vec<IntMat3> {
        // 4-fold about c: (h,k,l) -> (-k,h,l).
        const R4: IntMat3 = [[0, -1, 0], [1, 0, 0], [0, 0, 1]];
        // 6-fold about c, hexagonal axes: (h,k,l) -> (-k,h+k,l).
        const R6: IntMat3 = [[0, -1, 0], [1, 1, 0], [0, 0, 1]];
        // 3-fold about c, hexagonal axes (R6 squared).
        const R3: IntMat3 = [[-1, -1, 0], [1, 0, 0], [0, 0, 1]];
        // 2-fold about b: (h,k,l) -> (-h,k,-l).
        const TWO_B: IntMat3 = [[-1, 0, 0], [0, 1, 0], [0, 0, -1]];
        // 2-fold about a: (h,k,l) -> (h,-k,-l).
        const TWO_A: IntMat3 = [[1, 0, 0], [0, -1, 0], [0, 0, -1]];
        // Mirror swapping h and k.
        const SWAP_HK: IntMat3 = [[0, 1, 0], [1, 0, 0], [0, 0, 1]];
        // Cyclic permutation h->l->k->h: 3-fold about the [111] body diagonal.
        const CYCLIC: IntMat3 = [[0, 0, 1], [1, 0, 0], [0, 1, 0]];

        match self {
            PointGroup::P1 => vec![IDENTITY],
            PointGroup::Triclinic => vec![INVERSION],
            PointGroup::Monoclinic => vec![TWO_B, INVERSION],
            PointGroup::Orthorhombic => vec![TWO_A, TWO_B, INVERSION],
            PointGroup::Tetragonal4M => vec![R4, INVERSION],
            PointGroup::Tetragonal4Mmm => vec![R4, SWAP_HK, INVERSION],
            PointGroup::Trigonal3Bar => vec![R3, INVERSION],
            PointGroup::Trigonal3BarM => vec![R3, SWAP_HK, INVERSION],
            PointGroup::Hexagonal6M => vec![R6, INVERSION],
            PointGroup::Hexagonal6Mmm => vec![R6, SWAP_HK, INVERSION],
            PointGroup::CubicM3 => vec![TWO_A, TWO_B, CYCLIC, INVERSION],
            PointGroup::CubicM3m => vec![R4, CYCLIC, INVERSION],
        }
    }

    /// The full set of operations (rotations and their inversions) spanned
    /// by this class's generators.
    pub fn operations(&self) -> Vec<IntMat3> {
        closure(&self.generators())
    }
}

/// Reduce `hkl` to its symmetry-asymmetric-unit representative under `pg`:
/// the lexicographically greatest index triple among all of `hkl`'s
/// symmetry-equivalents.
pub fn reduce_to_asymmetric_unit(pg: PointGroup, hkl: Hkl) -> Hkl {
    pg.operations()
        .iter()
        .map(|m| apply(m, hkl))
        .max()
        .unwrap_or(hkl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p1_leaves_indices_unchanged_except_for_friedel() {
        assert_eq!(reduce_to_asymmetric_unit(PointGroup::P1, (1, 2, 3)), (1, 2, 3));
    }

    #[test]
    fn triclinic_merges_friedel_pairs() {
        let a = reduce_to_asymmetric_unit(PointGroup::Triclinic, (1, 2, 3));
        let b = reduce_to_asymmetric_unit(PointGroup::Triclinic, (-1, -2, -3));
        assert_eq!(a, b);
    }

    #[test]
    fn orthorhombic_merges_all_sign_variants() {
        let base = reduce_to_asymmetric_unit(PointGroup::Orthorhombic, (1, 2, 3));
        for variant in [(1, 2, 3), (-1, 2, 3), (1, -2, 3), (1, 2, -3), (-1, -2, -3)] {
            assert_eq!(reduce_to_asymmetric_unit(PointGroup::Orthorhombic, variant), base);
        }
    }

    #[test]
    fn tetragonal_4mmm_merges_h_k_swap_and_sign() {
        let base = reduce_to_asymmetric_unit(PointGroup::Tetragonal4Mmm, (3, 1, 2));
        assert_eq!(reduce_to_asymmetric_unit(PointGroup::Tetragonal4Mmm, (1, 3, 2)), base);
        assert_eq!(reduce_to_asymmetric_unit(PointGroup::Tetragonal4Mmm, (-1, -3, 2)), base);
    }

    #[test]
    fn cubic_m3m_merges_all_axis_permutations() {
        let base = reduce_to_asymmetric_unit(PointGroup::CubicM3m, (1, 2, 3));
        assert_eq!(reduce_to_asymmetric_unit(PointGroup::CubicM3m, (3, 1, 2)), base);
        assert_eq!(reduce_to_asymmetric_unit(PointGroup::CubicM3m, (2, 3, 1)), base);
        assert_eq!(reduce_to_asymmetric_unit(PointGroup::CubicM3m, (-3, -1, -2)), base);
    }

    #[test]
    fn group_orders_match_expected_laue_class_sizes() {
        assert_eq!(PointGroup::P1.operations().len(), 1);
        assert_eq!(PointGroup::Triclinic.operations().len(), 2);
        assert_eq!(PointGroup::Monoclinic.operations().len(), 4);
        assert_eq!(PointGroup::Orthorhombic.operations().len(), 8);
        assert_eq!(PointGroup::Tetragonal4M.operations().len(), 8);
        assert_eq!(PointGroup::Tetragonal4Mmm.operations().len(), 16);
        assert_eq!(PointGroup::Trigonal3Bar.operations().len(), 6);
        assert_eq!(PointGroup::Trigonal3BarM.operations().len(), 12);
        assert_eq!(PointGroup::Hexagonal6M.operations().len(), 12);
        assert_eq!(PointGroup::Hexagonal6Mmm.operations().len(), 24);
        assert_eq!(PointGroup::CubicM3.operations().len(), 24);
        assert_eq!(PointGroup::CubicM3m.operations().len(), 48);
    }

    #[test]
    fn unknown_symbol_is_rejected() {
        assert!(PointGroup::from_symbol("bogus").is_none());
    }

    #[test]
    fn known_symbols_round_trip_to_expected_variant() {
        assert_eq!(PointGroup::from_symbol("mmm"), Some(PointGroup::Orthorhombic));
        assert_eq!(PointGroup::from_symbol("m-3m"), Some(PointGroup::CubicM3m));
    }
}
