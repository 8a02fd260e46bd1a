//! Prediction-refinement and peak-coverage validation (spec §4.G step 5),
//! distinct from the post-refinement against merged intensities in
//! [`crate::scaling`]: here the objective is the sum of squared (Δfs, Δss)
//! between predicted reflection positions and the nearest observed peak,
//! varying the crystal's nine reciprocal-axis components. Gradients are
//! analytic, in the same style as [`crate::gradients`].

use nalgebra::{Matrix3, Vector3};

use crate::geometry::cell::hkl_to_vector;
use crate::geometry::detector::Panel;
use crate::geometry::Detector;
use crate::peak_search::Peak;
use crate::prediction::{partiality, BeamSnapshot, Orientation};
use crate::reflection::ReflectionList;

/// Configuration for one crystal's prediction-refinement.
#[derive(Debug, Clone, Copy)]
pub struct RefineConfig {
    pub max_iters: usize,
    pub step: f64,
    /// Stop early once the parameter-step norm falls below this.
    pub convergence_eps: f64,
    /// A predicted reflection and an observed peak on the same panel within
    /// this many pixels are considered a match.
    pub match_radius_px: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        RefineConfig {
            max_iters: 20,
            step: 1e-3,
            convergence_eps: 1e-4,
            match_radius_px: 3.0,
        }
    }
}

/// Outcome of refining one crystal's orientation against observed peaks.
#[derive(Debug, Clone, Copy)]
pub struct RefineResult {
    pub orientation: Orientation,
    pub iterations: usize,
    /// Number of predicted reflections matched to an observed peak on the
    /// final iteration.
    pub n_matched: usize,
}

/// Derivative of predicted (fs, ss) with respect to each of the nine
/// reciprocal-axis components, for one reflection (h,k,l) mapped onto
/// `panel`. Returns `None` if the ray is parallel to the panel plane or
/// points away from the detector (shouldn't happen for an already-matched
/// reflection, but guarded for safety).
fn position_gradient(beam: &BeamSnapshot, panel: &Panel, clen: f64, h: i32, k: i32, l: i32, q: &Vector3<f64>) -> Option<[(f64, f64); 9]> {
    let k_in = Vector3::new(0.0, 0.0, 1.0 / beam.wavelength);
    let direction = q + k_in;
    if direction.z.abs() < 1e-30 {
        return None;
    }
    let t = clen / direction.z;
    if t <= 0.0 {
        return None;
    }

    let (a, b, c, d) = (panel.fs_vec.x, panel.ss_vec.x, panel.fs_vec.y, panel.ss_vec.y);
    let det = a * d - b * c;
    if det.abs() < 1e-30 {
        return None;
    }

    let coefs = [h as f64, k as f64, l as f64];
    let mut out = [(0.0, 0.0); 9];
    for i in 0..3 {
        for j in 0..3 {
            // d(direction)/d(recip[i][j]) is coefs[i] along unit axis j.
            let d_dir = coefs[i];
            let (d_dx, d_dy, d_dz) = match j {
                0 => (d_dir, 0.0, 0.0),
                1 => (0.0, d_dir, 0.0),
                _ => (0.0, 0.0, d_dir),
            };
            let d_t = -clen / (direction.z * direction.z) * d_dz;
            let d_point_x = t * d_dx + direction.x * d_t;
            let d_point_y = t * d_dy + direction.y * d_t;
            let d_local_fs = (d_point_x * d - d_point_y * b) / det;
            let d_local_ss = (d_point_y * a - d_point_x * c) / det;
            out[i * 3 + j] = (d_local_fs, d_local_ss);
        }
    }
    Some(out)
}

fn apply_step(reciprocal: &mut Matrix3<f64>, grad: &[f64; 9], step: f64) -> f64 {
    let mut norm_sq = 0.0;
    for i in 0..3 {
        for j in 0..3 {
            let delta = -step * grad[i * 3 + j];
            reciprocal[(i, j)] += delta;
            norm_sq += delta * delta;
        }
    }
    norm_sq.sqrt()
}

/// Find the nearest peak on `panel_name` to (fs, ss) within `radius`.
fn nearest_peak<'a>(peaks: &'a [Peak], panel_name: &str, fs: f64, ss: f64, radius: f64) -> Option<&'a Peak> {
    peaks
        .iter()
        .filter(|p| p.panel == panel_name)
        .map(|p| (p, (p.fs - fs).powi(2) + (p.ss - ss).powi(2)))
        .filter(|(_, d2)| *d2 <= radius * radius)
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).expect("distances are finite"))
        .map(|(p, _)| p)
}

/// Refine a crystal's oriented reciprocal axes by minimising the sum of
/// squared (Δfs, Δss) between predicted reflections and their nearest
/// matching observed peak. Observed peaks not matched to any prediction,
/// and predictions not matched to any peak, are simply ignored.
pub fn refine_orientation(
    orientation: &Orientation,
    beam: &BeamSnapshot,
    r_p: f64,
    detector: &Detector,
    peaks: &[Peak],
    cfg: &RefineConfig,
) -> RefineResult {
    let mut reciprocal = orientation.reciprocal;
    let q_max = match detector.q_max(beam.wavelength, |_| None) {
        Ok(q) => q,
        Err(_) => return RefineResult { orientation: *orientation, iterations: 0, n_matched: 0 },
    };

    let mut iterations = 0;
    let mut n_matched = 0;

    for _ in 0..cfg.max_iters {
        iterations += 1;
        let scratch = ReflectionList::new();
        let current = Orientation { reciprocal };
        crate::prediction::predict_reflections(&current, beam, r_p, detector, q_max, |_| None, &scratch);

        let mut grad = [0.0_f64; 9];
        let mut matched = 0usize;
        let mut cursor = scratch.cursor();
        while let Some(handle) = cursor.next() {
            let r = handle.get();
            let panel_name = match &r.panel {
                Some(p) => p,
                None => continue,
            };
            let Some(panel) = detector.panels.iter().find(|p| &p.name == panel_name) else { continue };
            let Some(peak) = nearest_peak(peaks, panel_name, r.fs, r.ss, cfg.match_radius_px) else { continue };
            let clen = match detector.camera_length(panel, |_| None) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let q = hkl_to_vector(&reciprocal, r.h, r.k, r.l);
            let Some(jac) = position_gradient(beam, panel, clen, r.h, r.k, r.l, &q) else { continue };

            let d_fs = peak.fs - r.fs;
            let d_ss = peak.ss - r.ss;
            matched += 1;
            for idx in 0..9 {
                let (jfs, jss) = jac[idx];
                // d(loss)/d(param) for loss = Δfs² + Δss², Δ = obs - pred.
                grad[idx] += -2.0 * d_fs * jfs - 2.0 * d_ss * jss;
            }
        }

        n_matched = matched;
        if matched == 0 {
            break;
        }
        let step_norm = apply_step(&mut reciprocal, &grad, cfg.step);
        if step_norm < cfg.convergence_eps {
            break;
        }
    }

    RefineResult {
        orientation: Orientation { reciprocal },
        iterations,
        n_matched,
    }
}

/// CHECK_PEAKS: the fraction of observed peaks that land within
/// `match_radius_px` of some predicted reflection on the same panel.
pub fn peak_coverage_fraction(orientation: &Orientation, beam: &BeamSnapshot, r_p: f64, detector: &Detector, peaks: &[Peak], match_radius_px: f64) -> f64 {
    if peaks.is_empty() {
        return 0.0;
    }
    let q_max = match detector.q_max(beam.wavelength, |_| None) {
        Ok(q) => q,
        Err(_) => return 0.0,
    };
    let predicted = ReflectionList::new();
    crate::prediction::predict_reflections(orientation, beam, r_p, detector, q_max, |_| None, &predicted);

    let mut predicted_positions: Vec<(String, f64, f64)> = Vec::new();
    let mut cursor = predicted.cursor();
    while let Some(handle) = cursor.next() {
        let r = handle.get();
        if let Some(panel) = r.panel {
            predicted_positions.push((panel, r.fs, r.ss));
        }
    }

    let n_covered = peaks
        .iter()
        .filter(|p| {
            predicted_positions
                .iter()
                .any(|(panel, fs, ss)| panel == &p.panel && (fs - p.fs).powi(2) + (ss - p.ss).powi(2) <= match_radius_px * match_radius_px)
        })
        .count();
    n_covered as f64 / peaks.len() as f64
}
