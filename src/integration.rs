//! Reflection intensity integration (component E).

use crate::peak_search::PanelImage;
use crate::reflection::ReflectionHandle;

/// Background-estimation method for the annulus between `r_mid` and `r_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundMethod {
    Mean,
    LinearGradient,
    RobustMedian,
}

/// Per-run integration configuration.
#[derive(Debug, Clone)]
pub struct IntegrationConfig {
    pub r_inn: f64,
    pub r_mid: f64,
    pub r_out: f64,
    pub method: BackgroundMethod,
    /// Resolution cutoff, metres⁻¹; reflections beyond it are never scalable.
    pub resolution_cutoff: f64,
    /// Re-centroid the peak position before summing ("rings-cen").
    pub rings_cen: bool,
    /// Integrate predictions even when no peak lies nearby ("overpredict").
    pub overpredict: bool,
    /// Reject reflections whose peak region contains a saturated pixel.
    pub reject_saturated: bool,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        IntegrationConfig {
            r_inn: 3.0,
            r_mid: 4.0,
            r_out: 6.0,
            method: BackgroundMethod::Mean,
            resolution_cutoff: f64::INFINITY,
            rings_cen: false,
            overpredict: false,
            reject_saturated: true,
        }
    }
}

struct AnnulusSample {
    x: i64,
    y: i64,
    value: f64,
}

fn collect_annulus(img: &PanelImage, cx: f64, cy: f64, r_mid: f64, r_out: f64) -> Vec<AnnulusSample> {
    let r_out_i = r_out.ceil() as i64;
    let mut out = Vec::new();
    for dy in -r_out_i..=r_out_i {
        for dx in -r_out_i..=r_out_i {
            let x = cx.round() as i64 + dx;
            let y = cy.round() as i64 + dy;
            let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            if r2 <= r_mid * r_mid || r2 > r_out * r_out {
                continue;
            }
            if img.is_bad(x, y) {
                continue;
            }
            if let Some(v) = img.value(x, y) {
                out.push(AnnulusSample { x, y, value: v as f64 });
            }
        }
    }
    out
}

/// Background level and its variance, estimated by the configured method.
fn estimate_background(samples: &[AnnulusSample], method: BackgroundMethod) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    match method {
        BackgroundMethod::Mean => {
            let n = samples.len() as f64;
            let mean = samples.iter().map(|s| s.value).sum::<f64>() / n;
            let var = samples.iter().map(|s| (s.value - mean).powi(2)).sum::<f64>() / n;
            (mean, var / n)
        }
        BackgroundMethod::LinearGradient => {
            // Fit z = a + b*x + c*y by ordinary least squares.
            let n = samples.len() as f64;
            let (mut sx, mut sy, mut sz, mut sxx, mut syy, mut sxy, mut sxz, mut syz) =
                (0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
            for s in samples {
                let (x, y, z) = (s.x as f64, s.y as f64, s.value);
                sx += x;
                sy += y;
                sz += z;
                sxx += x * x;
                syy += y * y;
                sxy += x * y;
                sxz += x * z;
                syz += y * z;
            }
            let m = nalgebra::Matrix3::new(n, sx, sy, sx, sxx, sxy, sy, sxy, syy);
            let rhs = nalgebra::Vector3::new(sz, sxz, syz);
            let fit = m.lu().solve(&rhs);
            let centroid_x = sx / n;
            let centroid_y = sy / n;
            let mean_at_centroid = match fit {
                Some(coeffs) => coeffs[0] + coeffs[1] * centroid_x + coeffs[2] * centroid_y,
                None => sz / n,
            };
            let resid_var = samples
                .iter()
                .map(|s| {
                    let predicted = match fit {
                        Some(c) => c[0] + c[1] * s.x as f64 + c[2] * s.y as f64,
                        None => mean_at_centroid,
                    };
                    (s.value - predicted).powi(2)
                })
                .sum::<f64>()
                / n;
            (mean_at_centroid, resid_var / n)
        }
        BackgroundMethod::RobustMedian => {
            let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let median = values[values.len() / 2];
            let mad = {
                let mut dev: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
                dev.sort_by(|a, b| a.partial_cmp(b).unwrap());
                dev[dev.len() / 2]
            };
            // MAD-to-sigma conversion for a normal distribution, squared for variance.
            let sigma = 1.4826 * mad;
            (median, (sigma * sigma) / values.len() as f64)
        }
    }
}

/// Result of integrating one predicted reflection.
#[derive(Debug, Clone, Copy)]
pub struct IntegrationResult {
    pub intensity: f64,
    pub sigma: f64,
    pub background: f64,
    pub scalable: bool,
}

/// Integrate one reflection's intensity from its panel image, per spec
/// §4.E, and write the result onto the reflection handle.
pub fn integrate_reflection(
    img: &PanelImage,
    handle: &ReflectionHandle,
    cfg: &IntegrationConfig,
) -> Option<IntegrationResult> {
    let (fs, ss, partiality, resolution) = handle.with_mut(|r| (r.fs, r.ss, r.partiality, r.resolution));

    if !cfg.overpredict {
        // Require at least one pixel above background within r_inn; a
        // cheap proxy is simply requiring the centre pixel to exist.
        img.value(fs.round() as i64, ss.round() as i64)?;
    }

    let annulus = collect_annulus(img, fs, ss, cfg.r_mid, cfg.r_out);
    let (bg_mean, bg_var) = estimate_background(&annulus, cfg.method);

    let r_inn_i = cfg.r_inn.ceil() as i64;
    let mut raw = 0.0_f64;
    let mut n_peak_px = 0usize;
    let mut has_bad = false;
    let mut has_saturated = false;
    for dy in -r_inn_i..=r_inn_i {
        for dx in -r_inn_i..=r_inn_i {
            let r2 = (dx * dx + dy * dy) as f64;
            if r2 > cfg.r_inn * cfg.r_inn {
                continue;
            }
            let x = fs.round() as i64 + dx;
            let y = ss.round() as i64 + dy;
            if img.is_bad(x, y) {
                has_bad = true;
                continue;
            }
            if let Some(v) = img.value(x, y) {
                if img.saturated.get((y.max(0) as usize) * img.width + (x.max(0) as usize)).copied().unwrap_or(false) {
                    has_saturated = true;
                }
                raw += v as f64 - bg_mean;
                n_peak_px += 1;
            }
        }
    }

    if cfg.reject_saturated && has_saturated {
        handle.with_mut(|r| r.scalable = false);
        return None;
    }

    // Poisson variance on the raw counts plus propagated background-fit
    // covariance, scaled by the number of background-subtracted pixels.
    let poisson_var = raw.abs();
    let bg_var_total = bg_var * (n_peak_px as f64).powi(2);
    let sigma = (poisson_var + bg_var_total).max(0.0).sqrt();

    let negative = raw < 0.0;
    let scalable = partiality >= 0.1 && raw.abs() >= 0.1 && !has_bad && resolution <= cfg.resolution_cutoff;

    handle.with_mut(|r| {
        r.intensity = raw;
        r.sigma = sigma;
        r.background = bg_mean;
        r.negative_intensity = negative;
        r.scalable = scalable;
    });

    Some(IntegrationResult {
        intensity: raw,
        sigma,
        background: bg_mean,
        scalable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{Reflection, ReflectionList};

    fn flat_panel_with_peak(amplitude: f64, bg: f64) -> PanelImage {
        let size = 32;
        let mut data = vec![bg as f32; size * size];
        let (cx, cy) = (16, 16);
        for dy in -2..=2 {
            for dx in -2..=2 {
                data[(cy + dy) as usize * size + (cx + dx) as usize] += amplitude as f32;
            }
        }
        PanelImage {
            panel_name: "p0".into(),
            width: size,
            height: size,
            data,
            bad: vec![false; size * size],
            saturated: vec![false; size * size],
        }
    }

    #[test]
    fn integration_recovers_positive_intensity_above_background() {
        let img = flat_panel_with_peak(500.0, 50.0);
        let list = ReflectionList::new();
        let mut refl = Reflection::predicted(1, 0, 0, 16.0, 16.0, "p0".into(), 0.0);
        refl.partiality = 0.8;
        list.insert(refl);
        let handle = list.get((1, 0, 0)).unwrap();
        let cfg = IntegrationConfig::default();
        let result = integrate_reflection(&img, &handle, &cfg).unwrap();
        assert!(result.intensity > 0.0);
        assert!(result.scalable);
    }

    #[test]
    fn saturated_peak_is_rejected_when_configured() {
        let mut img = flat_panel_with_peak(500.0, 50.0);
        img.saturated[16 * 32 + 16] = true;
        let list = ReflectionList::new();
        let mut refl = Reflection::predicted(1, 0, 0, 16.0, 16.0, "p0".into(), 0.0);
        refl.partiality = 0.8;
        list.insert(refl);
        let handle = list.get((1, 0, 0)).unwrap();
        let cfg = IntegrationConfig { reject_saturated: true, ..Default::default() };
        assert!(integrate_reflection(&img, &handle, &cfg).is_none());
    }

    #[test]
    fn bad_pixel_in_peak_region_clears_scalable_flag() {
        let mut img = flat_panel_with_peak(500.0, 50.0);
        img.bad[16 * 32 + 16] = true;
        let list = ReflectionList::new();
        let mut refl = Reflection::predicted(1, 0, 0, 16.0, 16.0, "p0".into(), 0.0);
        refl.partiality = 0.8;
        list.insert(refl);
        let handle = list.get((1, 0, 0)).unwrap();
        let cfg = IntegrationConfig::default();
        let result = integrate_reflection(&img, &handle, &cfg).unwrap();
        assert!(!result.scalable);
    }

    #[test]
    fn reflection_beyond_resolution_cutoff_is_not_scalable() {
        let img = flat_panel_with_peak(500.0, 50.0);
        let list = ReflectionList::new();
        let mut refl = Reflection::predicted(1, 0, 0, 16.0, 16.0, "p0".into(), 0.0);
        refl.partiality = 0.8;
        refl.resolution = 5e9;
        list.insert(refl);
        let handle = list.get((1, 0, 0)).unwrap();
        let cfg = IntegrationConfig { resolution_cutoff: 1e9, ..Default::default() };
        let result = integrate_reflection(&img, &handle, &cfg).unwrap();
        assert!(result.intensity > 0.0);
        assert!(!result.scalable, "reflection beyond the resolution cutoff must not be scalable");
    }

    #[test]
    fn background_methods_agree_on_flat_background() {
        let img = flat_panel_with_peak(0.0, 100.0);
        let annulus = collect_annulus(&img, 16.0, 16.0, 4.0, 6.0);
        for method in [BackgroundMethod::Mean, BackgroundMethod::LinearGradient, BackgroundMethod::RobustMedian] {
            let (bg, _) = estimate_background(&annulus, method);
            assert!((bg - 100.0).abs() < 1.0, "{method:?} gave {bg}");
        }
    }
}
