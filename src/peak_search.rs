//! Bragg peak search (component C): Zaef gradient-walk and Peakfinder8/9.

use crate::geometry::Detector;

/// A single detector frame's raw pixel data, one buffer per panel, laid out
/// row-major (ss-major, fs-minor) to match the panel's own (fs,ss) address
/// space.
#[derive(Debug, Clone)]
pub struct PanelImage {
    pub panel_name: String,
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
    pub bad: Vec<bool>,
    pub saturated: Vec<bool>,
}

impl PanelImage {
    pub fn value(&self, x: i64, y: i64) -> Option<f32> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        self.data.get(y as usize * self.width + x as usize).copied()
    }

    pub fn is_bad(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return true;
        }
        self.bad[y as usize * self.width + x as usize]
    }
}

/// A frame's worth of per-panel raw data.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub panels: Vec<PanelImage>,
}

impl Frame {
    pub fn panel(&self, name: &str) -> Option<&PanelImage> {
        self.panels.iter().find(|p| p.panel_name == name)
    }
}

/// A located Bragg peak.
#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    pub panel: String,
    /// Subpixel fast-scan / slow-scan position, panel-local.
    pub fs: f64,
    pub ss: f64,
    pub intensity: f64,
}

/// Parameters for the Zaef gradient-walk algorithm.
#[derive(Debug, Clone)]
pub struct ZaefConfig {
    pub threshold: f32,
    pub min_gradient: f32,
    pub window_half_width: i64,
    pub integration_radius: i64,
    pub min_peak_separation: f64,
    pub max_walk_distance: i64,
}

impl Default for ZaefConfig {
    fn default() -> Self {
        ZaefConfig {
            threshold: 800.0,
            min_gradient: 100_000.0,
            window_half_width: 5,
            integration_radius: 10,
            min_peak_separation: 15.0,
            max_walk_distance: 50,
        }
    }
}

/// Squared-gradient magnitude at (x,y), using forward/backward differences.
fn gradient_squared(img: &PanelImage, x: i64, y: i64) -> Option<f32> {
    let v = img.value(x, y)?;
    let dx1 = img.value(x + 1, y)? - v;
    let dx2 = v - img.value(x - 1, y)?;
    let dy1 = img.value(x, y + 1)? - v;
    let dy2 = v - img.value(x, y - 1)?;
    Some((dx1 * dx1 + dx2 * dx2) / 2.0 + (dy1 * dy1 + dy2 * dy2) / 2.0)
}

/// Is (x,y) an isolated hot pixel: strictly greater than each of its 8
/// neighbours divided by 2?
fn is_isolated_hot_pixel(img: &PanelImage, x: i64, y: i64) -> bool {
    let Some(v) = img.value(x, y) else { return false };
    for dy in -1..=1 {
        for dx in -1..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let Some(n) = img.value(x + dx, y + dy) else { continue };
            if v <= n / 2.0 {
                return false;
            }
        }
    }
    true
}

/// Hill-climb from (x0,y0) within a sliding window until no neighbour in
/// the window exceeds the current maximum, or the walk strays too far.
fn hill_climb(img: &PanelImage, x0: i64, y0: i64, cfg: &ZaefConfig) -> Option<(i64, i64)> {
    let (mut cx, mut cy) = (x0, y0);
    let mut cur = img.value(cx, cy)?;
    loop {
        let mut best = (cx, cy, cur);
        for dy in -cfg.window_half_width..=cfg.window_half_width {
            for dx in -cfg.window_half_width..=cfg.window_half_width {
                let (nx, ny) = (cx + dx, cy + dy);
                if let Some(v) = img.value(nx, ny) {
                    if v > best.2 {
                        best = (nx, ny, v);
                    }
                }
            }
        }
        if best.0 == cx && best.1 == cy {
            return Some((cx, cy));
        }
        if (best.0 - x0).abs() > cfg.max_walk_distance || (best.1 - y0).abs() > cfg.max_walk_distance {
            return None;
        }
        cx = best.0;
        cy = best.1;
        cur = best.2;
    }
}

/// Centroid over a disk of radius `cfg.integration_radius`, excluding
/// pixels outside the frame.
fn centroid(img: &PanelImage, cx: i64, cy: i64, cfg: &ZaefConfig) -> Option<(f64, f64, f64)> {
    let r = cfg.integration_radius;
    let (mut sum_i, mut sum_x, mut sum_y) = (0.0_f64, 0.0_f64, 0.0_f64);
    for dy in -r..=r {
        for dx in -r..=r {
            if dx * dx + dy * dy > r * r {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if let Some(v) = img.value(x, y) {
                let v = v as f64;
                sum_i += v;
                sum_x += v * x as f64;
                sum_y += v * y as f64;
            }
        }
    }
    if sum_i <= 0.0 {
        return None;
    }
    Some((sum_x / sum_i, sum_y / sum_i, sum_i))
}

/// Run the Zaef gradient-walk peak search over one panel.
pub fn zaef_search(img: &PanelImage, cfg: &ZaefConfig) -> Vec<Peak> {
    let mut accepted: Vec<Peak> = Vec::new();

    for y in 1..(img.height as i64 - 1) {
        for x in 1..(img.width as i64 - 1) {
            if img.is_bad(x, y) {
                continue;
            }
            let Some(v) = img.value(x, y) else { continue };
            if v <= cfg.threshold {
                continue;
            }
            let Some(g) = gradient_squared(img, x, y) else { continue };
            if g <= cfg.min_gradient {
                continue;
            }
            let Some((px, py)) = hill_climb(img, x, y, cfg) else { continue };
            if is_isolated_hot_pixel(img, px, py) {
                continue;
            }
            let Some((cfs, css, intensity)) = centroid(img, px, py, cfg) else { continue };
            if cfs < 0.0 || css < 0.0 || cfs >= img.width as f64 || css >= img.height as f64 {
                continue;
            }
            let too_close = accepted.iter().any(|p| {
                let d2 = (p.fs - cfs).powi(2) + (p.ss - css).powi(2);
                d2 < cfg.min_peak_separation * cfg.min_peak_separation
            });
            if too_close {
                continue;
            }
            accepted.push(Peak {
                panel: img.panel_name.clone(),
                fs: cfs,
                ss: css,
                intensity,
            });
        }
    }

    cull_bad_columns(accepted)
}

/// Delete all peaks sharing an exact fast-scan column if more than three
/// peaks land on it (suppresses detector bad-column artefacts).
fn cull_bad_columns(peaks: Vec<Peak>) -> Vec<Peak> {
    use std::collections::HashMap;
    let mut by_column: HashMap<i64, usize> = HashMap::new();
    for p in &peaks {
        *by_column.entry(p.fs.round() as i64).or_insert(0) += 1;
    }
    peaks
        .into_iter()
        .filter(|p| by_column[&(p.fs.round() as i64)] <= 3)
        .collect()
}

/// Parameters shared by Peakfinder8 and Peakfinder9.
#[derive(Debug, Clone)]
pub struct PeakfinderConfig {
    pub snr_threshold: f32,
    pub min_pix_count: usize,
    pub max_pix_count: usize,
    pub local_bg_radius: i64,
    pub min_res_px: f64,
    pub max_res_px: f64,
    /// Peakfinder9 only: biggest-pixel SNR threshold.
    pub pf9_biggest_pixel_snr: Option<f32>,
    /// Peakfinder9 only: peak-pixel SNR threshold.
    pub pf9_peak_pixel_snr: Option<f32>,
    /// Peakfinder9 only: minimum margin a pixel must exceed each neighbour by.
    pub pf9_neighbor_margin: Option<f32>,
}

impl Default for PeakfinderConfig {
    fn default() -> Self {
        PeakfinderConfig {
            snr_threshold: 5.0,
            min_pix_count: 2,
            max_pix_count: 200,
            local_bg_radius: 10,
            min_res_px: 0.0,
            max_res_px: f64::INFINITY,
            pf9_biggest_pixel_snr: None,
            pf9_peak_pixel_snr: None,
            pf9_neighbor_margin: None,
        }
    }
}

/// Local background mean and standard deviation over an annulus of the
/// given radius around (cx,cy), excluding pixels within `inner`.
fn local_background(img: &PanelImage, cx: i64, cy: i64, inner: i64, outer: i64) -> (f64, f64) {
    let mut values = Vec::new();
    for dy in -outer..=outer {
        for dx in -outer..=outer {
            let d2 = dx * dx + dy * dy;
            if d2 <= inner * inner || d2 > outer * outer {
                continue;
            }
            if let Some(v) = img.value(cx + dx, cy + dy) {
                values.push(v as f64);
            }
        }
    }
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, var.sqrt().max(1e-6))
}

fn center_distance_px(width: usize, height: usize, x: i64, y: i64) -> f64 {
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt()
}

/// Connected-component peak search shared by Peakfinder8 and Peakfinder9;
/// `extra_accept` applies algorithm-specific per-pixel acceptance criteria
/// beyond the shared SNR threshold.
fn connected_component_search(
    img: &PanelImage,
    cfg: &PeakfinderConfig,
    extra_accept: impl Fn(&PanelImage, i64, i64, f64, f64) -> bool,
) -> Vec<Peak> {
    let mut visited = vec![false; img.width * img.height];
    let mut peaks = Vec::new();

    for y0 in 0..img.height as i64 {
        for x0 in 0..img.width as i64 {
            let idx0 = y0 as usize * img.width + x0 as usize;
            if visited[idx0] || img.is_bad(x0, y0) {
                continue;
            }
            let r = center_distance_px(img.width, img.height, x0, y0);
            if r < cfg.min_res_px || r > cfg.max_res_px {
                continue;
            }
            let (bg_mean, bg_std) = local_background(img, x0, y0, cfg.local_bg_radius / 2, cfg.local_bg_radius);
            let Some(v0) = img.value(x0, y0) else { continue };
            let snr0 = (v0 as f64 - bg_mean) / bg_std;
            if snr0 < cfg.snr_threshold as f64 || !extra_accept(img, x0, y0, bg_mean, bg_std) {
                visited[idx0] = true;
                continue;
            }

            // Flood-fill the connected component of pixels above threshold.
            let mut stack = vec![(x0, y0)];
            let mut member = Vec::new();
            visited[idx0] = true;
            while let Some((x, y)) = stack.pop() {
                member.push((x, y));
                for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx as usize >= img.width || ny as usize >= img.height {
                        continue;
                    }
                    let nidx = ny as usize * img.width + nx as usize;
                    if visited[nidx] || img.is_bad(nx, ny) {
                        continue;
                    }
                    let Some(v) = img.value(nx, ny) else { continue };
                    let snr = (v as f64 - bg_mean) / bg_std;
                    if snr >= cfg.snr_threshold as f64 {
                        visited[nidx] = true;
                        stack.push((nx, ny));
                    }
                }
            }

            if member.len() < cfg.min_pix_count || member.len() > cfg.max_pix_count {
                continue;
            }

            let mut sum_i = 0.0;
            let mut sum_x = 0.0;
            let mut sum_y = 0.0;
            for (x, y) in &member {
                let v = (img.value(*x, *y).unwrap_or(0.0) as f64 - bg_mean).max(0.0);
                sum_i += v;
                sum_x += v * *x as f64;
                sum_y += v * *y as f64;
            }
            if sum_i <= 0.0 {
                continue;
            }
            peaks.push(Peak {
                panel: img.panel_name.clone(),
                fs: sum_x / sum_i,
                ss: sum_y / sum_i,
                intensity: sum_i,
            });
        }
    }

    peaks
}

/// Peakfinder8: SNR threshold, pixel-count bounds, resolution-ring bounds.
pub fn peakfinder8(img: &PanelImage, cfg: &PeakfinderConfig) -> Vec<Peak> {
    connected_component_search(img, cfg, |_, _, _, _, _| true)
}

/// Peakfinder9: adds biggest-pixel / peak-pixel SNR requirements and a
/// minimum per-neighbour margin.
pub fn peakfinder9(img: &PanelImage, cfg: &PeakfinderConfig) -> Vec<Peak> {
    let biggest_thresh = cfg.pf9_biggest_pixel_snr.unwrap_or(cfg.snr_threshold) as f64;
    let peak_thresh = cfg.pf9_peak_pixel_snr.unwrap_or(cfg.snr_threshold) as f64;
    let margin = cfg.pf9_neighbor_margin.unwrap_or(0.0);

    connected_component_search(img, cfg, move |img, x, y, bg_mean, bg_std| {
        let Some(v) = img.value(x, y) else { return false };
        let snr = (v as f64 - bg_mean) / bg_std;
        if snr < biggest_thresh || snr < peak_thresh {
            return false;
        }
        for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1), (-1, -1), (1, 1), (-1, 1), (1, -1)] {
            if let Some(n) = img.value(x + dx, y + dy) {
                if v <= n + margin {
                    return false;
                }
            }
        }
        true
    })
}

/// Adjust peaks imported from an external list from pixel-index to
/// pixel-distance convention (adds 0.5 to both coordinates).
pub fn apply_pixel_index_offset(peaks: &mut [Peak]) {
    for p in peaks.iter_mut() {
        p.fs += 0.5;
        p.ss += 0.5;
    }
}

/// Find the panel owning a given pixel within a frame, using the detector
/// to resolve the global (fs,ss) address back to the panel-local frame.
pub fn locate_panel_image<'a>(frame: &'a Frame, detector: &Detector, global_fs: f64, global_ss: f64) -> Option<&'a PanelImage> {
    let panel = detector.panel_for(global_fs, global_ss)?;
    frame.panel(&panel.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_frame(width: usize, height: usize, peaks: &[(f64, f64, f32, f32)]) -> PanelImage {
        let mut data = vec![0.0_f32; width * height];
        for y in 0..height {
            for x in 0..width {
                let mut acc = 0.0_f32;
                for (px, py, amp, sigma) in peaks {
                    let dx = x as f64 - px;
                    let dy = y as f64 - py;
                    acc += amp * (-(dx * dx + dy * dy) as f32 / (2.0 * sigma * sigma)).exp();
                }
                data[y * width + x] = acc;
            }
        }
        PanelImage {
            panel_name: "p0".into(),
            width,
            height,
            data,
            bad: vec![false; width * height],
            saturated: vec![false; width * height],
        }
    }

    #[test]
    fn zaef_finds_three_synthetic_peaks() {
        // Scenario 2 from spec §8.
        let truth = [(100.0, 100.0), (500.0, 500.0), (900.0, 900.0)];
        let img = gaussian_frame(1024, 1024, &truth.map(|(x, y)| (x, y, 10_000.0, 2.0)));
        let cfg = ZaefConfig::default();
        let peaks = zaef_search(&img, &cfg);
        assert_eq!(peaks.len(), 3, "expected 3 peaks, found {}", peaks.len());
        for (tx, ty) in truth {
            let found = peaks.iter().any(|p| ((p.fs - tx).powi(2) + (p.ss - ty).powi(2)).sqrt() < 0.3);
            assert!(found, "no peak within 0.3px of truth ({tx},{ty})");
        }
    }

    #[test]
    fn isolated_hot_pixel_is_rejected() {
        let mut img = gaussian_frame(64, 64, &[]);
        img.data[32 * 64 + 32] = 50_000.0;
        let cfg = ZaefConfig::default();
        let peaks = zaef_search(&img, &cfg);
        assert!(peaks.is_empty());
    }

    #[test]
    fn bad_column_with_many_peaks_is_culled() {
        let mut peak_list = Vec::new();
        for i in 0..4 {
            peak_list.push((200.0, (100 + i * 30) as f64, 9000.0, 1.5));
        }
        let img = gaussian_frame(512, 512, &peak_list);
        let cfg = ZaefConfig { min_peak_separation: 5.0, ..Default::default() };
        let peaks = zaef_search(&img, &cfg);
        assert!(peaks.is_empty(), "4 peaks sharing a column should all be culled");
    }

    #[test]
    fn peakfinder8_recovers_isolated_peak() {
        let img = gaussian_frame(256, 256, &[(128.0, 128.0, 2000.0, 2.5)]);
        let cfg = PeakfinderConfig { snr_threshold: 4.0, min_pix_count: 2, max_pix_count: 500, ..Default::default() };
        let peaks = peakfinder8(&img, &cfg);
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].fs - 128.0).abs() < 1.0);
    }

    #[test]
    fn pixel_index_offset_shifts_both_axes() {
        let mut peaks = vec![Peak { panel: "p0".into(), fs: 10.0, ss: 20.0, intensity: 1.0 }];
        apply_pixel_index_offset(&mut peaks);
        assert_eq!(peaks[0].fs, 10.5);
        assert_eq!(peaks[0].ss, 20.5);
    }
}
