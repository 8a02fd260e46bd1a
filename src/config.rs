//! Run configuration: an optional TOML file, layered under CLI flags.
//!
//! Only a handful of run-wide knobs are worth putting in a file (peak
//! search algorithm choice and its thresholds, indexing tolerances,
//! integration radii); everything else is a CLI flag. Unknown TOML keys
//! are ignored rather than rejected, so older config files keep working
//! as new options are added.

use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::indexer::Tolerances;
use crate::integration::{BackgroundMethod, IntegrationConfig};
use crate::peak_search::{PeakfinderConfig, ZaefConfig};

/// Which peak-search algorithm a config file selects.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PeakAlgorithm {
    Zaef,
    Peakfinder8,
    Peakfinder9,
}

impl Default for PeakAlgorithm {
    fn default() -> Self {
        PeakAlgorithm::Zaef
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawZaefSection {
    threshold: Option<f32>,
    min_gradient: Option<f32>,
    min_peak_separation: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawPeakfinderSection {
    snr_threshold: Option<f32>,
    min_pix_count: Option<usize>,
    max_pix_count: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawIntegrationSection {
    r_inn: Option<f64>,
    r_mid: Option<f64>,
    r_out: Option<f64>,
    method: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawIndexingSection {
    length_tol: Option<f64>,
    angle_tol_deg: Option<f64>,
    min_peaks: Option<usize>,
}

/// Top-level shape of a run-configuration TOML file. All sections and all
/// fields within them are optional; absent values fall back to this
/// engine's built-in defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawConfig {
    peak_algorithm: Option<PeakAlgorithm>,
    zaef: Option<RawZaefSection>,
    peakfinder: Option<RawPeakfinderSection>,
    integration: Option<RawIntegrationSection>,
    indexing: Option<RawIndexingSection>,
}

/// A fully resolved run configuration: every field has a concrete value,
/// built by layering an optional TOML file under this engine's defaults.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub peak_algorithm: PeakAlgorithm,
    pub zaef: ZaefConfig,
    pub peakfinder: PeakfinderConfig,
    pub integration: IntegrationConfig,
    pub tolerances: Tolerances,
    pub min_peaks_for_indexing: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            peak_algorithm: PeakAlgorithm::default(),
            zaef: ZaefConfig::default(),
            peakfinder: PeakfinderConfig::default(),
            integration: IntegrationConfig::default(),
            tolerances: Tolerances::default(),
            min_peaks_for_indexing: 15,
        }
    }
}

impl RunConfig {
    /// Load and apply a TOML config file on top of the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let raw: RawConfig = toml::from_str(&text).map_err(|e| EngineError::MalformedInput {
            path: path.display().to_string(),
            reason: format!("invalid TOML: {e}"),
        })?;
        Ok(Self::default().apply(raw))
    }

    fn apply(mut self, raw: RawConfig) -> Self {
        if let Some(algo) = raw.peak_algorithm {
            self.peak_algorithm = algo;
        }
        if let Some(z) = raw.zaef {
            if let Some(v) = z.threshold {
                self.zaef.threshold = v;
            }
            if let Some(v) = z.min_gradient {
                self.zaef.min_gradient = v;
            }
            if let Some(v) = z.min_peak_separation {
                self.zaef.min_peak_separation = v;
            }
        }
        if let Some(p) = raw.peakfinder {
            if let Some(v) = p.snr_threshold {
                self.peakfinder.snr_threshold = v;
            }
            if let Some(v) = p.min_pix_count {
                self.peakfinder.min_pix_count = v;
            }
            if let Some(v) = p.max_pix_count {
                self.peakfinder.max_pix_count = v;
            }
        }
        if let Some(i) = raw.integration {
            if let Some(v) = i.r_inn {
                self.integration.r_inn = v;
            }
            if let Some(v) = i.r_mid {
                self.integration.r_mid = v;
            }
            if let Some(v) = i.r_out {
                self.integration.r_out = v;
            }
            if let Some(method) = i.method {
                self.integration.method = match method.as_str() {
                    "mean" => BackgroundMethod::Mean,
                    "linear-gradient" => BackgroundMethod::LinearGradient,
                    "robust-median" => BackgroundMethod::RobustMedian,
                    _ => self.integration.method,
                };
            }
        }
        if let Some(idx) = raw.indexing {
            if let Some(v) = idx.length_tol {
                self.tolerances.length_tol = v;
            }
            if let Some(v) = idx.angle_tol_deg {
                self.tolerances.angle_tol = v.to_radians();
            }
            if let Some(v) = idx.min_peaks {
                self.min_peaks_for_indexing = v;
            }
        }
        self
    }
}

/// Initialize the global tracing subscriber for a CLI binary, honouring
/// `RUST_LOG` and defaulting to `info` otherwise.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_fields_keep_defaults() {
        let raw = RawConfig::default();
        let cfg = RunConfig::default().apply(raw);
        assert_eq!(cfg.peak_algorithm, PeakAlgorithm::Zaef);
        assert_eq!(cfg.min_peaks_for_indexing, 15);
    }

    #[test]
    fn toml_overrides_only_specified_fields() {
        let text = r#"
            peak-algorithm = "peakfinder8"

            [peakfinder]
            snr-threshold = 4.5

            [indexing]
            min-peaks = 25
        "#;
        let raw: RawConfig = toml::from_str(text).unwrap();
        let cfg = RunConfig::default().apply(raw);
        assert_eq!(cfg.peak_algorithm, PeakAlgorithm::Peakfinder8);
        assert_eq!(cfg.peakfinder.snr_threshold, 4.5);
        assert_eq!(cfg.min_peaks_for_indexing, 25);
        // Untouched fields still carry their built-in defaults.
        assert_eq!(cfg.integration.r_inn, IntegrationConfig::default().r_inn);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid = [[[").unwrap();
        let result = RunConfig::load(&path);
        assert!(result.is_err());
    }
}
