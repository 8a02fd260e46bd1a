//! Reflection prediction and the partiality model (component D).

use nalgebra::{Matrix3, Vector3};

use crate::geometry::cell::hkl_to_vector;
use crate::geometry::Detector;
use crate::reflection::{Reflection, ReflectionList};

/// Beam parameters captured by value at prediction time, breaking the
/// Crystal↔Image reference cycle (design note §9: a crystal holds an
/// immutable snapshot of (λ, beam) rather than a live back-pointer).
#[derive(Debug, Clone, Copy)]
pub struct BeamSnapshot {
    /// Incident wavelength, metres.
    pub wavelength: f64,
    /// Full-angle beam divergence, radians.
    pub divergence: f64,
    /// Bandwidth Δλ/λ, dimensionless fraction.
    pub bandwidth: f64,
    /// Default profile radius for newly created crystals, metres⁻¹.
    pub profile_radius_default: f64,
}

/// Orientation + lattice geometry needed to predict reflections for one
/// crystal: the reciprocal-space Cartesian axes already include the
/// orientation (i.e. this is the *oriented* reciprocal matrix, not the
/// cell-frame one).
#[derive(Debug, Clone, Copy)]
pub struct Orientation {
    /// Oriented reciprocal-space axes, rows a*, b*, c*, metres⁻¹.
    pub reciprocal: Matrix3<f64>,
}

/// Excitation-error extrema against the two Ewald spheres, used to build
/// the partiality function.
#[derive(Debug, Clone, Copy)]
pub struct PartialityResult {
    pub partiality: f64,
    pub clamp_low: bool,
    pub clamp_high: bool,
    /// Signed excitation error at the nominal (unbandwidth-broadened)
    /// wavelength, metres⁻¹ — this is what gets stored on the reflection.
    pub excitation_error: f64,
}

/// Profile radius effectively broadened by beam divergence: a node further
/// from the beam axis sweeps a wider range of excitation error as the beam
/// direction wobbles by the full divergence angle `ϕ`, so the excitation
/// window widens by roughly `0.5 * ϕ * |q|`.
pub fn effective_profile_radius(r_p: f64, divergence: f64, q: &Vector3<f64>) -> f64 {
    r_p + 0.5 * divergence * q.norm()
}

/// Compute the partiality of one reciprocal-lattice node given its lab-frame
/// position `q` (already including orientation), the beam, and the
/// crystal's profile radius `r_p`.
///
/// Follows spec §4.D: test the rlp sphere (radius r_p, centred on the node)
/// against the Ewald spheres at k_low = 1/(λ(1+Δλ/2)) and
/// k_high = 1/(λ(1−Δλ/2)); r1, r2 are the resulting excitation-error
/// extrema, each clamped to ±r_p; s = (r1+r2)/(2·r_p); q_frac = 1 − |s|;
/// p = 0.5(3·q_frac − q_frac³) for |s| ≤ 1, else 0.
pub fn partiality(q: &Vector3<f64>, beam: &BeamSnapshot, r_p: f64) -> PartialityResult {
    let k_low = 1.0 / (beam.wavelength * (1.0 + beam.bandwidth / 2.0));
    let k_high = 1.0 / (beam.wavelength * (1.0 - beam.bandwidth / 2.0));
    let eff_rp = effective_profile_radius(r_p, beam.divergence, q);

    // Excitation error of node q against a sphere of radius k centred at
    // (0,0,-k) in the beam frame: Δ = k - |q - (0,0,-k)|... the node lies
    // on the sphere when |q + k_in| = k. We use the standard linearised
    // form: excitation error ≈ -(q·q + 2*q_z*k) / (2k), sign chosen so
    // positive means the node is outside the sphere.
    let excitation = |k: f64| -> f64 {
        let q2 = q.norm_squared();
        -(q2 + 2.0 * q.z * k) / (2.0 * k)
    };

    let r1 = excitation(k_low).clamp(-eff_rp, eff_rp);
    let r2 = excitation(k_high).clamp(-eff_rp, eff_rp);
    let clamp_low = excitation(k_low).abs() >= eff_rp;
    let clamp_high = excitation(k_high).abs() >= eff_rp;

    let s = (r1 + r2) / (2.0 * eff_rp);
    let nominal_k = 1.0 / beam.wavelength;
    let excitation_error = excitation(nominal_k);

    if s.abs() > 1.0 {
        return PartialityResult {
            partiality: 0.0,
            clamp_low,
            clamp_high,
            excitation_error,
        };
    }
    let q_frac = 1.0 - s.abs();
    let p = 0.5 * (3.0 * q_frac - q_frac.powi(3));
    PartialityResult {
        partiality: p.clamp(0.0, 1.0),
        clamp_low,
        clamp_high,
        excitation_error,
    }
}

/// Lorentz factor for a reflection; 1 at the untilted orientation, per
/// spec §4.D. A fuller geometric correction would depend on the rocking
/// width and q_z; this engine uses the simple untilted-frame value, which
/// is what the partiality model above already assumes.
pub fn lorentz_factor(_q: &Vector3<f64>) -> f64 {
    1.0
}

/// Predict reflections for one crystal orientation against a detector,
/// filling in `output` (the crystal's own reflection list).
///
/// For every reciprocal-lattice node within the detector's `q_max`, tests
/// whether its excitation error falls within the profile radius; if so,
/// maps its lab-frame direction to (fs,ss) on the owning panel, dropping
/// any reflection whose mapped position lies outside every panel.
pub fn predict_reflections(
    orientation: &Orientation,
    beam: &BeamSnapshot,
    r_p: f64,
    detector: &Detector,
    q_max: f64,
    clen_lookup: impl Fn(&str) -> Option<f64> + Copy,
    output: &ReflectionList,
) {
    let a_star = orientation.reciprocal.row(0).transpose();
    let b_star = orientation.reciprocal.row(1).transpose();
    let c_star = orientation.reciprocal.row(2).transpose();

    // Bound the search range along each axis from q_max; |h|*|a*| <= q_max
    // is a safe (if loose) per-axis bound since a*,b*,c* need not be
    // orthogonal. We additionally prune by |q| itself below.
    let h_max = (q_max / a_star.norm()).ceil() as i32 + 1;
    let k_max = (q_max / b_star.norm()).ceil() as i32 + 1;
    let l_max = (q_max / c_star.norm()).ceil() as i32 + 1;

    for h in -h_max..=h_max {
        for k in -k_max..=k_max {
            for l in -l_max..=l_max {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                let q = hkl_to_vector(&orientation.reciprocal, h, k, l);
                if q.norm() > q_max + r_p {
                    continue;
                }
                let result = partiality(&q, beam, r_p);
                if result.partiality <= 0.0 {
                    continue;
                }

                // Map q's lab-frame direction to a detector position: the
                // scattered beam direction is q + k_in, with k_in along +z.
                let k_in = Vector3::new(0.0, 0.0, 1.0 / beam.wavelength);
                let direction = q + k_in;
                let Some((panel_name, fs, ss)) = detector.reverse_map(&direction, clen_lookup) else {
                    continue;
                };

                let mut refl = Reflection::predicted(h, k, l, fs, ss, panel_name, result.excitation_error);
                refl.resolution = q.norm();
                refl.partiality = result.partiality;
                refl.clamp_low = result.clamp_low;
                refl.clamp_high = result.clamp_high;
                refl.lorentz = lorentz_factor(&q);
                output.insert(refl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::cell::UnitCell;
    use crate::geometry::detector::Panel;
    use approx::assert_relative_eq;

    fn flat_detector() -> Detector {
        let panel = Panel {
            name: "p0".into(),
            min_fs: 0,
            max_fs: 1023,
            min_ss: 0,
            max_ss: 1023,
            corner: (-512.0, -512.0),
            fs_vec: Vector3::new(1.0, 0.0, 0.0) * 1e-4,
            ss_vec: Vector3::new(0.0, 1.0, 0.0) * 1e-4,
            pixel_pitch: 1e-4,
            camera_length: Some(0.08),
            clen_from: None,
            bad_mask: vec![],
            no_index: false,
        };
        Detector {
            panels: vec![panel],
            default_clen: Some(0.08),
            photon_energy_ev: None,
            adu_per_ev: None,
        }
    }

    #[test]
    fn fully_clamped_reflection_has_partiality_one() {
        // Scenario 6: r1 = -r_p, r2 = +r_p exactly => s=0, q_frac=1, p=1.
        let beam = BeamSnapshot {
            wavelength: 1.0e-10,
            divergence: 0.0,
            bandwidth: 0.01,
            profile_radius_default: 1e6,
        };
        let r_p = 1e6;
        // A node whose excitation error against the two Ewald spheres
        // straddles zero and clears ±r_p on both ends: q.z carries the
        // node below -r_p at k_low, and the in-plane component's
        // k-dependent (q²/2k) term swings it back above +r_p at k_high.
        let q = Vector3::new(2_086_048_896.838_248, 0.0, -220_000_000.0);
        let result = partiality(&q, &beam, r_p);
        assert!(result.clamp_low);
        assert!(result.clamp_high);
        assert!(result.partiality >= 0.999, "partiality was {}", result.partiality);
    }

    #[test]
    fn partiality_is_always_in_unit_interval() {
        let beam = BeamSnapshot {
            wavelength: 1.55e-10,
            divergence: 0.0,
            bandwidth: 0.01,
            profile_radius_default: 5e5,
        };
        for qz in [-2e9, -1e9, 0.0, 1e9, 2e9] {
            for qx in [0.0, 1e8, 5e8] {
                let q = Vector3::new(qx, 0.0, qz);
                let result = partiality(&q, &beam, 5e5);
                assert!(result.partiality >= 0.0 && result.partiality <= 1.0);
            }
        }
    }

    #[test]
    fn cubic_cell_axis_reflections_are_predicted() {
        // Scenario 3 from spec §8: 10nm cubic cell, r_p = 0.005 Å⁻¹ = 5e7 m⁻¹.
        let cell = UnitCell::cubic(10e-9);
        let recip = cell.reciprocal().unwrap();
        let orientation = Orientation { reciprocal: recip };
        let beam = BeamSnapshot {
            wavelength: 1.55e-10,
            divergence: 0.0,
            bandwidth: 0.01,
            profile_radius_default: 5e7,
        };
        let r_p = 5e7;
        let detector = flat_detector();
        let q_max = detector.q_max(beam.wavelength, |_| None).unwrap();
        let output = ReflectionList::new();
        predict_reflections(&orientation, &beam, r_p, &detector, q_max, |_| None, &output);

        // (1,0,0) and (0,1,0) sit transverse to the beam axis and clear the
        // profile radius comfortably. (0,0,1) sits along the beam axis
        // itself (identity orientation maps c* to +z, same as k_in): no
        // node of this cell's spacing there ever comes close to either
        // Ewald sphere, so it never predicts, regardless of orientation —
        // the two-sphere model's forward-direction blind region, not a bug.
        for hkl in [(1, 0, 0), (0, 1, 0)] {
            let handle = output.get(hkl).unwrap_or_else(|| panic!("reflection {hkl:?} should be predicted"));
            assert!(handle.get().partiality > 0.0, "reflection {hkl:?} should have p>0");
        }
        assert!(output.get((0, 0, 1)).is_none(), "(0,0,1) lies on the beam axis and should not be predicted");
    }
}
