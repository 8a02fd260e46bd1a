//! Scaling and post-refinement (component H): iterative joint estimation of
//! per-crystal scale factors, merged full intensities, and refined
//! per-crystal geometry.

use std::collections::HashMap;
use std::sync::RwLock;

use nalgebra::Matrix3;
use rayon::prelude::*;

use crate::gradients::partiality_gradient;
use crate::prediction::{partiality, BeamSnapshot};
use crate::reflection::Hkl;

/// One crystal's contribution to scaling: its own reflection list plus the
/// mutable state post-refinement adjusts.
pub struct Crystal {
    pub reciprocal: Matrix3<f64>,
    pub osf: f64,
    pub profile_radius: f64,
    pub beam: BeamSnapshot,
    pub reflections: Vec<ScalingReflection>,
    /// Set when this crystal's linear solve was singular or its
    /// refinement diverged (spec §4.H failure semantics); excluded from
    /// the scale step for that iteration but eligible to recover next one.
    pub pr_dud: bool,
}

/// A scalable observation as scaling sees it: enough to compute weights
/// and residuals without needing the full `Reflection` bookkeeping.
#[derive(Debug, Clone)]
pub struct ScalingReflection {
    pub hkl: Hkl,
    pub h: i32,
    pub k: i32,
    pub l: i32,
    pub intensity: f64,
    pub sigma: f64,
    pub partiality: f64,
    pub lorentz: f64,
    pub negative_intensity: bool,
    pub scalable: bool,
    pub refinable: bool,
}

/// Merged state for one symmetry-unique reflection.
#[derive(Debug, Clone, Default)]
pub struct MergedReflection {
    pub full_intensity: f64,
    pub redundancy: u32,
}

/// The merged reflection list shared by the scaling subsystem, behind a
/// reader-writer lock (spec §5 shared-resource policy): scale computation
/// takes the read lock; insertion of a freshly seen key takes the write
/// lock under a double-checked pattern.
#[derive(Default)]
pub struct MergedList {
    table: RwLock<HashMap<Hkl, MergedReflection>>,
}

impl MergedList {
    pub fn new() -> Self {
        MergedList { table: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, hkl: Hkl) -> Option<MergedReflection> {
        self.table.read().expect("merged list poisoned").get(&hkl).cloned()
    }

    fn get_or_default(&self, hkl: Hkl) -> MergedReflection {
        if let Some(m) = self.get(hkl) {
            return m;
        }
        let mut table = self.table.write().expect("merged list poisoned");
        table.entry(hkl).or_default().clone()
    }

    fn set(&self, hkl: Hkl, value: MergedReflection) {
        let mut table = self.table.write().expect("merged list poisoned");
        table.insert(hkl, value);
    }

    pub fn len(&self) -> usize {
        self.table.read().expect("merged list poisoned").len()
    }
}

/// Configuration for the outer scaling/post-refinement loop.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub n_iterations: usize,
    /// Relative tolerance on aggregate residual change, terminates the
    /// scale/merge alternation early.
    pub scale_convergence_tol: f64,
    /// Maximum osf change across crystals below which the outer loop stops.
    pub osf_convergence_tol: f64,
    /// Outlier rejection threshold, in multiples of σ.
    pub outlier_k: f64,
    /// Per the REDESIGN FLAGS resolution: negative intensities are valid
    /// observations by default; set true to reproduce the original
    /// silent-skip behaviour.
    pub exclude_negative_intensities: bool,
    pub post_refine_max_iters: usize,
    pub post_refine_step: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        ScalingConfig {
            n_iterations: 10,
            scale_convergence_tol: 1e-6,
            osf_convergence_tol: 1e-6,
            outlier_k: 5.0,
            exclude_negative_intensities: false,
            post_refine_max_iters: 50,
            post_refine_step: 1e-3,
        }
    }
}

fn included(r: &ScalingReflection, cfg: &ScalingConfig) -> bool {
    r.scalable && !(cfg.exclude_negative_intensities && r.negative_intensity)
}

/// Step 1: estimate each symmetry-unique full intensity, then update every
/// crystal's osf by weighted linear least squares. Returns the maximum
/// |Δosf| observed, used for the outer-loop convergence test.
pub fn scale_step(crystals: &mut [Crystal], merged: &MergedList, cfg: &ScalingConfig) -> f64 {
    // Accumulate per-hkl weighted numerator/denominator across all crystals.
    let mut numer: HashMap<Hkl, f64> = HashMap::new();
    let mut denom: HashMap<Hkl, f64> = HashMap::new();
    let mut redundancy: HashMap<Hkl, u32> = HashMap::new();

    for crystal in crystals.iter() {
        if crystal.pr_dud {
            continue;
        }
        for r in &crystal.reflections {
            if !included(r, cfg) || r.sigma <= 0.0 {
                continue;
            }
            let w = r.partiality * crystal.osf.powi(2) * r.lorentz.powi(2) / (r.sigma * r.sigma);
            if w <= 0.0 || !w.is_finite() {
                continue;
            }
            let contribution = r.intensity / (crystal.osf * r.lorentz * r.partiality);
            *numer.entry(r.hkl).or_insert(0.0) += w * contribution;
            *denom.entry(r.hkl).or_insert(0.0) += w;
            *redundancy.entry(r.hkl).or_insert(0) += 1;
        }
    }

    for (hkl, num) in &numer {
        let den = denom[hkl];
        if den <= 0.0 {
            continue;
        }
        merged.set(
            *hkl,
            MergedReflection {
                full_intensity: num / den,
                redundancy: redundancy[hkl],
            },
        );
    }

    // Update each crystal's osf: weighted linear least squares minimising
    // Σ (I_obs − osf·L·p·I_full)² over its own reflections.
    let mut max_delta = 0.0_f64;
    for crystal in crystals.iter_mut() {
        if crystal.pr_dud {
            continue;
        }
        let mut num = 0.0;
        let mut den = 0.0;
        for r in &crystal.reflections {
            if !included(r, cfg) || r.sigma <= 0.0 {
                continue;
            }
            let full = match merged.get(r.hkl) {
                Some(m) if m.redundancy > 0 => m.full_intensity,
                _ => continue,
            };
            let model = r.lorentz * r.partiality * full;
            let weight = 1.0 / (r.sigma * r.sigma);
            num += weight * model * r.intensity;
            den += weight * model * model;
        }
        if den <= 0.0 {
            crystal.pr_dud = true;
            continue;
        }
        let new_osf = num / den;
        if !new_osf.is_finite() || new_osf <= 0.0 {
            crystal.pr_dud = true;
            continue;
        }
        max_delta = max_delta.max((new_osf - crystal.osf).abs());
        crystal.osf = new_osf;
    }

    max_delta
}

/// Step 2: a reflection is refinable iff it is scalable and its merged
/// full-intensity match has redundancy ≥ 2 (or a reference list was
/// supplied, handled by the caller pre-seeding `merged`).
pub fn select_refinable(crystals: &mut [Crystal], merged: &MergedList, has_reference: bool) {
    for crystal in crystals.iter_mut() {
        for r in crystal.reflections.iter_mut() {
            let redundancy_ok = has_reference
                || merged.get(r.hkl).map(|m| m.redundancy >= 2).unwrap_or(false);
            r.refinable = r.scalable && redundancy_ok;
        }
    }
}

/// Step 3: post-refine one crystal's nine reciprocal-axis components by
/// gradient descent against Σ(I_obs − osf·L·p·I_full)², using the analytic
/// partiality gradients. Outliers (|residual| > k·σ) are down-weighted to
/// zero. Returns `false` (and marks the crystal `pr_dud`) if the linear
/// solve underlying a step is singular or the loss diverges.
pub fn post_refine_crystal(crystal: &mut Crystal, merged: &MergedList, cfg: &ScalingConfig) -> bool {
    let mut prev_loss = f64::INFINITY;

    for _ in 0..cfg.post_refine_max_iters {
        let mut grad = [0.0_f64; 9];
        let mut loss = 0.0_f64;
        let mut n_used = 0usize;

        for r in &crystal.reflections {
            if !r.refinable {
                continue;
            }
            let Some(full) = merged.get(r.hkl).map(|m| m.full_intensity) else { continue };
            let q = crate::geometry::cell::hkl_to_vector(&crystal.reciprocal, r.h, r.k, r.l);
            let model = crystal.osf * r.lorentz * r.partiality * full;
            let residual = r.intensity - model;
            if r.sigma > 0.0 && (residual / r.sigma).abs() > cfg.outlier_k {
                continue;
            }
            loss += residual * residual;
            n_used += 1;

            let pg = partiality_gradient(r.h, r.k, r.l, &q, &crystal.beam, crystal.profile_radius);
            let nine = pg.as_nine();
            // d(loss)/d(param) = -2 * residual * osf * L * full * dp/dparam
            let coeff = -2.0 * residual * crystal.osf * r.lorentz * full;
            for i in 0..9 {
                grad[i] += coeff * nine[i];
            }
        }

        if n_used == 0 {
            crystal.pr_dud = true;
            return false;
        }

        if !loss.is_finite() || loss > prev_loss * 10.0 && prev_loss.is_finite() {
            crystal.pr_dud = true;
            return false;
        }

        let grad_norm: f64 = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if grad_norm < 1e-20 {
            break;
        }

        let step = cfg.post_refine_step;
        apply_gradient_step(&mut crystal.reciprocal, &grad, step);

        if (prev_loss - loss).abs() / prev_loss.max(1e-300) < cfg.scale_convergence_tol {
            prev_loss = loss;
            break;
        }
        prev_loss = loss;
    }

    !prev_loss.is_nan()
}

fn apply_gradient_step(reciprocal: &mut Matrix3<f64>, grad: &[f64; 9], step: f64) {
    let mut delta = [0.0_f64; 9];
    for i in 0..9 {
        delta[i] = -step * grad[i];
    }
    reciprocal[(0, 0)] += delta[0];
    reciprocal[(0, 1)] += delta[1];
    reciprocal[(0, 2)] += delta[2];
    reciprocal[(1, 0)] += delta[3];
    reciprocal[(1, 1)] += delta[4];
    reciprocal[(1, 2)] += delta[5];
    reciprocal[(2, 0)] += delta[6];
    reciprocal[(2, 1)] += delta[7];
    reciprocal[(2, 2)] += delta[8];
}

/// Run post-refinement across every non-dud crystal in parallel, via
/// rayon's work-stealing pool (distinct from the hand-rolled worker pool
/// in [`crate::worker_pool`], which implements this engine's own
/// range/streaming scheduling contract for the peak-search/indexing path).
pub fn post_refine_all(crystals: &mut [Crystal], merged: &MergedList, cfg: &ScalingConfig) {
    crystals.par_iter_mut().for_each(|crystal| {
        if crystal.pr_dud {
            return;
        }
        post_refine_crystal(crystal, merged, cfg);
    });
}

/// Step 4: after refinement, recompute the profile radius as the median of
/// per-reflection excitation-error magnitudes over scalable reflections,
/// then recompute partialities.
pub fn re_predict(crystal: &mut Crystal, excitation_errors: &[f64]) {
    if !excitation_errors.is_empty() {
        let mut sorted: Vec<f64> = excitation_errors.iter().map(|e| e.abs()).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        crystal.profile_radius = sorted[sorted.len() / 2];
    }
    for r in crystal.reflections.iter_mut() {
        let q = crate::geometry::cell::hkl_to_vector(&crystal.reciprocal, r.h, r.k, r.l);
        let result = partiality(&q, &crystal.beam, crystal.profile_radius);
        r.partiality = result.partiality;
        r.scalable = r.partiality >= 0.1 && r.intensity.abs() >= 0.1;
    }
}

/// Run the full outer loop (spec §4.H): scale, select refinable,
/// post-refine, re-predict, repeat until `n_iterations` or osf convergence.
pub fn run_outer_loop(crystals: &mut [Crystal], merged: &MergedList, cfg: &ScalingConfig, has_reference: bool) -> usize {
    let mut iterations_run = 0;
    for _ in 0..cfg.n_iterations {
        iterations_run += 1;
        let max_delta = scale_step(crystals, merged, cfg);
        select_refinable(crystals, merged, has_reference);
        post_refine_all(crystals, merged, cfg);
        for crystal in crystals.iter_mut() {
            if crystal.pr_dud {
                continue;
            }
            let errors: Vec<f64> = crystal
                .reflections
                .iter()
                .filter(|r| r.scalable)
                .map(|r| {
                    let q = crate::geometry::cell::hkl_to_vector(&crystal.reciprocal, r.h, r.k, r.l);
                    partiality(&q, &crystal.beam, crystal.profile_radius).excitation_error
                })
                .collect();
            re_predict(crystal, &errors);
        }
        if max_delta < cfg.osf_convergence_tol {
            break;
        }
    }
    iterations_run
}
