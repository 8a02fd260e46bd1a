//! Multi-panel detector geometry: (fs,ss) ↔ lab-frame mapping.

use nalgebra::Vector3;

use crate::error::{EngineError, Result};

/// One rectangular detector tile.
#[derive(Debug, Clone)]
pub struct Panel {
    /// Panel name, as given in the geometry file (e.g. "q0a0").
    pub name: String,
    /// Inclusive fast-scan pixel bounds.
    pub min_fs: u32,
    pub max_fs: u32,
    /// Inclusive slow-scan pixel bounds.
    pub min_ss: u32,
    pub max_ss: u32,
    /// Corner position (cnx, cny), in pixels, of the (min_fs, min_ss) corner,
    /// measured in the panel's own pixel pitch.
    pub corner: (f64, f64),
    /// Fast-scan basis vector in the lab frame, metres per pixel.
    pub fs_vec: Vector3<f64>,
    /// Slow-scan basis vector in the lab frame, metres per pixel.
    pub ss_vec: Vector3<f64>,
    /// Pixel pitch, metres/pixel.
    pub pixel_pitch: f64,
    /// Camera length, metres. `None` means "read from a per-frame header
    /// field", recorded in `clen_from`.
    pub camera_length: Option<f64>,
    /// Header field name to source the camera length from, if any.
    pub clen_from: Option<String>,
    /// Bad-pixel mask: `true` marks a pixel as unusable, indexed [ss][fs]
    /// relative to the panel's own origin.
    pub bad_mask: Vec<Vec<bool>>,
    /// If set, peaks/reflections on this panel are never used for indexing.
    pub no_index: bool,
}

impl Panel {
    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.max_fs - self.min_fs + 1
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.max_ss - self.min_ss + 1
    }

    /// Does this panel's (fs,ss) rectangle contain the given global address?
    pub fn contains(&self, fs: f64, ss: f64) -> bool {
        fs >= self.min_fs as f64
            && fs <= (self.max_fs as f64 + 1.0)
            && ss >= self.min_ss as f64
            && ss <= (self.max_ss as f64 + 1.0)
    }

    /// Is the given panel-relative pixel marked bad? Out-of-range pixels
    /// count as bad.
    pub fn is_bad(&self, fs_local: i64, ss_local: i64) -> bool {
        if fs_local < 0 || ss_local < 0 {
            return true;
        }
        match self.bad_mask.get(ss_local as usize) {
            Some(row) => row.get(fs_local as usize).copied().unwrap_or(false),
            None => false,
        }
    }

    /// Map a global (fs,ss) coordinate on this panel to a lab-frame position
    /// relative to the sample, given the effective camera length.
    pub fn position(&self, fs: f64, ss: f64, clen: f64) -> Vector3<f64> {
        let local_fs = fs - self.min_fs as f64;
        let local_ss = ss - self.min_ss as f64;
        let x = self.corner.0 * self.pixel_pitch + local_fs * self.fs_vec.x + local_ss * self.ss_vec.x;
        let y = self.corner.1 * self.pixel_pitch + local_fs * self.fs_vec.y + local_ss * self.ss_vec.y;
        Vector3::new(x, y, clen)
    }

    /// Map a lab-frame position on this panel's plane back to (fs,ss),
    /// inverting [`Panel::position`] for the in-plane (x,y) components.
    pub fn inverse_position(&self, point: &Vector3<f64>) -> Option<(f64, f64)> {
        // Solve [fs_vec.xy ss_vec.xy] * [local_fs; local_ss] = point.xy - corner
        let rel_x = point.x - self.corner.0 * self.pixel_pitch;
        let rel_y = point.y - self.corner.1 * self.pixel_pitch;
        let (a, b, c, d) = (self.fs_vec.x, self.ss_vec.x, self.fs_vec.y, self.ss_vec.y);
        let det = a * d - b * c;
        if det.abs() < 1e-30 {
            return None;
        }
        let local_fs = (rel_x * d - rel_y * b) / det;
        let local_ss = (rel_y * a - rel_x * c) / det;
        Some((local_fs + self.min_fs as f64, local_ss + self.min_ss as f64))
    }
}

/// An ordered multi-panel detector.
#[derive(Debug, Clone, Default)]
pub struct Detector {
    pub panels: Vec<Panel>,
    /// Global fallback camera length (metres) when a panel doesn't override it.
    pub default_clen: Option<f64>,
    /// Nominal photon energy, eV, if given in the geometry file.
    pub photon_energy_ev: Option<f64>,
    /// ADU-per-eV conversion factor, if given.
    pub adu_per_ev: Option<f64>,
}

impl Detector {
    /// Find the panel owning a given global (fs,ss) address.
    ///
    /// Panel rectangles never overlap (a geometry-load invariant), so at
    /// most one panel can claim an address.
    pub fn panel_for(&self, fs: f64, ss: f64) -> Option<&Panel> {
        self.panels.iter().find(|p| p.contains(fs, ss))
    }

    /// Camera length to use for a panel, given an optional per-frame header
    /// lookup closure for `panel/clen` references.
    pub fn camera_length(&self, panel: &Panel, header_lookup: impl Fn(&str) -> Option<f64>) -> Result<f64> {
        if let Some(field) = &panel.clen_from {
            return header_lookup(field).ok_or_else(|| EngineError::MalformedInput {
                path: "frame header".into(),
                reason: format!("camera length field '{field}' not present"),
            });
        }
        panel
            .camera_length
            .or(self.default_clen)
            .ok_or_else(|| EngineError::InvalidGeometry {
                reason: format!("panel '{}' has no camera length", panel.name),
            })
    }

    /// Scattering vector q (metres⁻¹) for a detector pixel, given the
    /// incident wavelength λ (metres). Uses the convention q = k_out -
    /// k_in with |k| = 1/λ (no 2π factor), matching the reciprocal-space
    /// convention used by [`crate::geometry::cell`].
    pub fn q_vector(&self, panel: &Panel, fs: f64, ss: f64, clen: f64, wavelength: f64) -> Vector3<f64> {
        let r = panel.position(fs, ss, clen);
        let k = 1.0 / wavelength;
        let k_in = Vector3::new(0.0, 0.0, k);
        let r_hat = r / r.norm();
        k * r_hat - k_in
    }

    /// Largest |q| reachable on any panel, used to bound prediction search.
    pub fn q_max(&self, wavelength: f64, header_lookup: impl Fn(&str) -> Option<f64> + Copy) -> Result<f64> {
        let mut max_q = 0.0_f64;
        for panel in &self.panels {
            let clen = self.camera_length(panel, header_lookup)?;
            let corners = [
                (panel.min_fs as f64, panel.min_ss as f64),
                (panel.max_fs as f64 + 1.0, panel.min_ss as f64),
                (panel.min_fs as f64, panel.max_ss as f64 + 1.0),
                (panel.max_fs as f64 + 1.0, panel.max_ss as f64 + 1.0),
            ];
            for (fs, ss) in corners {
                let q = self.q_vector(panel, fs, ss, clen, wavelength);
                max_q = max_q.max(q.norm());
            }
        }
        Ok(max_q)
    }

    /// Reverse-map a lab-frame direction (unnormalized) back to the owning
    /// panel and (fs,ss), by intersecting the ray from the sample with each
    /// panel's plane (approximated here as the plane z = clen, valid for
    /// the common flat, untilted-panel geometries this engine targets).
    pub fn reverse_map(
        &self,
        direction: &Vector3<f64>,
        header_lookup: impl Fn(&str) -> Option<f64>,
    ) -> Option<(String, f64, f64)> {
        if direction.z.abs() < 1e-30 {
            return None;
        }
        for panel in &self.panels {
            let clen = self.camera_length(panel, &header_lookup).ok()?;
            let t = clen / direction.z;
            if t <= 0.0 {
                continue;
            }
            let point = direction * t;
            if let Some((fs, ss)) = panel.inverse_position(&point) {
                if panel.contains(fs, ss) {
                    return Some((panel.name.clone(), fs, ss));
                }
            }
        }
        None
    }
}
