//! Analytic partiality gradients with respect to the nine reciprocal-axis
//! components and beam divergence, used by post-refinement (component H)
//! and checked against central finite differences in the test suite
//! (spec §8 gradient laws).

use nalgebra::Vector3;

use crate::prediction::BeamSnapshot;

/// Gradient of partiality with respect to each of the crystal's nine
/// reciprocal-axis components, plus beam divergence.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PartialityGradient {
    pub d_a_star: Vector3<f64>,
    pub d_b_star: Vector3<f64>,
    pub d_c_star: Vector3<f64>,
    pub d_divergence: f64,
}

impl PartialityGradient {
    /// The nine cell-parameter components as a flat array, in the order
    /// used by the gradient-law test: a*x, a*y, a*z, b*x, b*y, b*z, c*x,
    /// c*y, c*z.
    pub fn as_nine(&self) -> [f64; 9] {
        [
            self.d_a_star.x,
            self.d_a_star.y,
            self.d_a_star.z,
            self.d_b_star.x,
            self.d_b_star.y,
            self.d_b_star.z,
            self.d_c_star.x,
            self.d_c_star.y,
            self.d_c_star.z,
        ]
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Derivative, w.r.t. `q` and w.r.t. divergence, of one Ewald-sphere
/// excitation-error extremum after clamping to ±(effective profile
/// radius). Returns `(d/dq, d/dw)`.
fn clamped_extremum_gradient(
    raw: f64,
    k: f64,
    q: &Vector3<f64>,
    eff_rp: f64,
    d_eff_rp_dq: &Vector3<f64>,
    d_eff_rp_dw: f64,
) -> (Vector3<f64>, f64) {
    if raw.abs() >= eff_rp {
        let s = sign(raw);
        (s * d_eff_rp_dq, s * d_eff_rp_dw)
    } else {
        // d(excitation(k))/dq = -q/k - e_z
        let d_dq = -q / k - Vector3::new(0.0, 0.0, 1.0);
        (d_dq, 0.0)
    }
}

/// Analytic gradient of partiality w.r.t. (q_x, q_y, q_z, divergence) at a
/// given reciprocal-lattice node `q`, beam, and nominal profile radius.
/// Returns `None` if the reflection is fully excluded (|s| > 1), where the
/// gradient is identically zero almost everywhere.
pub fn partiality_gradient_wrt_q(q: &Vector3<f64>, beam: &BeamSnapshot, r_p: f64) -> Option<(Vector3<f64>, f64)> {
    let k_low = 1.0 / (beam.wavelength * (1.0 + beam.bandwidth / 2.0));
    let k_high = 1.0 / (beam.wavelength * (1.0 - beam.bandwidth / 2.0));

    let n = q.norm();
    let eff_rp = r_p + 0.5 * beam.divergence * n;
    let d_eff_rp_dq = if n > 1e-300 {
        0.5 * beam.divergence * q / n
    } else {
        Vector3::zeros()
    };
    let d_eff_rp_dw = 0.5 * n;

    let excitation = |k: f64| -> f64 {
        let q2 = q.norm_squared();
        -(q2 + 2.0 * q.z * k) / (2.0 * k)
    };

    let r1_raw = excitation(k_low);
    let r2_raw = excitation(k_high);
    let r1 = r1_raw.clamp(-eff_rp, eff_rp);
    let r2 = r2_raw.clamp(-eff_rp, eff_rp);

    let s = (r1 + r2) / (2.0 * eff_rp);
    if s.abs() > 1.0 {
        return None;
    }

    let (d_r1_dq, d_r1_dw) = clamped_extremum_gradient(r1_raw, k_low, q, eff_rp, &d_eff_rp_dq, d_eff_rp_dw);
    let (d_r2_dq, d_r2_dw) = clamped_extremum_gradient(r2_raw, k_high, q, eff_rp, &d_eff_rp_dq, d_eff_rp_dw);

    let denom = 4.0 * eff_rp * eff_rp;
    let d_s_dq = ((d_r1_dq + d_r2_dq) * (2.0 * eff_rp) - (r1 + r2) * 2.0 * d_eff_rp_dq) / denom;
    let d_s_dw = ((d_r1_dw + d_r2_dw) * (2.0 * eff_rp) - (r1 + r2) * 2.0 * d_eff_rp_dw) / denom;

    let u = 1.0 - s.abs();
    let d_p_ds = -sign(s) * 1.5 * (1.0 - u * u);

    Some((d_p_ds * d_s_dq, d_p_ds * d_s_dw))
}

/// Gradient of partiality with respect to the nine reciprocal-axis
/// components of a*, b*, c* and beam divergence, for a reflection (h,k,l)
/// at lab-frame node `q`.
pub fn partiality_gradient(h: i32, k: i32, l: i32, q: &Vector3<f64>, beam: &BeamSnapshot, r_p: f64) -> PartialityGradient {
    let Some((d_p_dq, d_p_dw)) = partiality_gradient_wrt_q(q, beam, r_p) else {
        return PartialityGradient::default();
    };
    PartialityGradient {
        d_a_star: d_p_dq * h as f64,
        d_b_star: d_p_dq * k as f64,
        d_c_star: d_p_dq * l as f64,
        d_divergence: d_p_dw,
    }
}
