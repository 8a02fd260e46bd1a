//! Per-frame orchestration (component G): from a loaded frame to an emitted
//! stream chunk, tying together peak search, indexing, prediction, and
//! integration.

use crate::error::{EngineError, Result};
use crate::geometry::cell::{hkl_to_vector, UnitCell};
use crate::geometry::Detector;
use crate::indexer::{cells_match, ImageMeta, Indexer, Tolerances};
use crate::integration::{integrate_reflection, IntegrationConfig};
use crate::peak_search::{locate_panel_image, Frame, Peak, PeakfinderConfig, ZaefConfig};
use crate::prediction::{predict_reflections, BeamSnapshot, Orientation};
use crate::reflection::ReflectionList;
use crate::refine::{peak_coverage_fraction, refine_orientation, RefineConfig};
use crate::stream::{Chunk, CrystalRecord, FrameStatus, ReflectionRecord};

/// Which peak-search algorithm to run for a frame, or none (externally
/// supplied peaks, per spec §6's MessagePack import path).
#[derive(Debug, Clone)]
pub enum PeakSource {
    Zaef(ZaefConfig),
    Peakfinder8(PeakfinderConfig),
    Peakfinder9(PeakfinderConfig),
    External(Vec<Peak>),
}

/// Per-run configuration for processing a single frame.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_peaks_for_indexing: usize,
    pub target_cell: Option<UnitCell>,
    pub tolerances: Tolerances,
    pub integration: IntegrationConfig,
    /// Maximum number of indexing attempts (RETRY) before giving up on a
    /// frame, each attempt excluding peaks already claimed by an accepted
    /// crystal from the previous round (MULTI lattice search).
    pub max_indexing_attempts: usize,
    pub beam: BeamSnapshot,
    /// REFINE: run prediction-refinement on each candidate cell before
    /// accepting it (spec §4.G step 5).
    pub refine: bool,
    pub refine_config: RefineConfig,
    /// CHECK_PEAKS: reject a candidate unless at least this fraction of
    /// detected peaks land near a predicted reflection.
    pub check_peaks: bool,
    pub check_peaks_min_fraction: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            min_peaks_for_indexing: 15,
            target_cell: None,
            tolerances: Tolerances::default(),
            integration: IntegrationConfig::default(),
            max_indexing_attempts: 1,
            beam: BeamSnapshot {
                wavelength: 1.0e-10,
                divergence: 0.0,
                bandwidth: 0.01,
                profile_radius_default: 3e6,
            },
            refine: false,
            refine_config: RefineConfig::default(),
            check_peaks: false,
            check_peaks_min_fraction: 0.5,
        }
    }
}

/// Find peaks for a frame, dispatching on the configured source.
pub fn search_peaks(frame: &Frame, source: &PeakSource) -> Vec<Peak> {
    match source {
        PeakSource::External(peaks) => peaks.clone(),
        PeakSource::Zaef(cfg) => frame
            .panels
            .iter()
            .flat_map(|panel| crate::peak_search::zaef_search(panel, cfg))
            .collect(),
        PeakSource::Peakfinder8(cfg) => frame
            .panels
            .iter()
            .flat_map(|panel| crate::peak_search::peakfinder8(panel, cfg))
            .collect(),
        PeakSource::Peakfinder9(cfg) => frame
            .panels
            .iter()
            .flat_map(|panel| crate::peak_search::peakfinder9(panel, cfg))
            .collect(),
    }
}

/// One successfully indexed crystal's predicted-and-integrated reflections,
/// along with the cell used to predict them.
pub struct IndexedCrystal {
    pub cell: UnitCell,
    pub orientation: Orientation,
    pub method: String,
    pub reflections: ReflectionList,
}

/// Process one frame end to end: search or accept peaks, attempt indexing
/// (CHECK_CELL against a target cell when one is configured), predict and
/// integrate reflections for each accepted crystal, and build the stream
/// chunk to emit.
///
/// RETRY/MULTI: on each attempt, peaks already consumed by a previously
/// accepted crystal (within `cfg.tolerances` of its predicted positions)
/// are withheld from the next indexing attempt, so multiple lattices in
/// one frame can each get a chance.
pub fn process_frame(
    filename: &str,
    event_id: &str,
    frame: &Frame,
    detector: &Detector,
    peak_source: &PeakSource,
    indexer: &dyn Indexer,
    cfg: &PipelineConfig,
) -> Chunk {
    let peaks = search_peaks(frame, peak_source);
    let n_peaks = peaks.len();

    let peak_records: Vec<ReflectionRecord> = peaks
        .iter()
        .map(|p| ReflectionRecord {
            h: 0,
            k: 0,
            l: 0,
            intensity: p.intensity,
            sigma: 0.0,
            partiality: 0.0,
            background: 0.0,
            fs: p.fs,
            ss: p.ss,
            panel: p.panel.clone(),
        })
        .collect();

    if peaks.len() < cfg.min_peaks_for_indexing {
        return Chunk {
            filename: filename.to_string(),
            event_id: event_id.to_string(),
            indexed_by: "none".into(),
            status: FrameStatus::NotIndexed,
            n_peaks,
            peaks: peak_records,
            crystals: vec![],
            extra_header_fields: vec![],
        };
    }

    let meta = ImageMeta {
        wavelength: cfg.beam.wavelength,
        detector_width_px: detector.panels.iter().map(|p| p.max_fs + 1).max().unwrap_or(0),
        detector_height_px: detector.panels.iter().map(|p| p.max_ss + 1).max().unwrap_or(0),
    };

    let mut remaining_peaks = peaks.clone();
    let mut crystals = Vec::new();
    let mut indexer_name = String::new();
    let mut any_indexed = false;
    let mut last_error: Option<EngineError> = None;

    for _attempt in 0..cfg.max_indexing_attempts.max(1) {
        if remaining_peaks.len() < cfg.min_peaks_for_indexing {
            break;
        }
        let handle = match indexer.setup(cfg.target_cell.as_ref(), cfg.tolerances) {
            Ok(h) => h,
            Err(e) => {
                last_error = Some(e);
                break;
            }
        };
        let candidates = indexer.index(&handle, &remaining_peaks, &meta);
        indexer.teardown(handle);

        let candidates = match candidates {
            Ok(c) => c,
            Err(e) => {
                last_error = Some(e);
                break;
            }
        };

        let mut accepted_this_round = false;
        for candidate in candidates {
            if let Some(target) = &cfg.target_cell {
                match cells_match(&candidate.cell, target, cfg.tolerances) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => continue,
                }
            }

            let mut orientation = Orientation { reciprocal: candidate.reciprocal };
            let r_p = cfg.beam.profile_radius_default;

            if cfg.refine {
                let result = refine_orientation(&orientation, &cfg.beam, r_p, detector, &remaining_peaks, &cfg.refine_config);
                orientation = result.orientation;
            }

            if cfg.check_peaks {
                let coverage = peak_coverage_fraction(&orientation, &cfg.beam, r_p, detector, &remaining_peaks, cfg.refine_config.match_radius_px);
                if coverage < cfg.check_peaks_min_fraction {
                    continue;
                }
            }

            let q_max = match detector.q_max(cfg.beam.wavelength, |_| None) {
                Ok(q) => q,
                Err(_) => continue,
            };
            let output = ReflectionList::new();
            predict_reflections(&orientation, &cfg.beam, r_p, detector, q_max, |_| None, &output);

            integrate_all(frame, detector, &output, &cfg.integration);

            indexer_name = candidate.method.clone();
            any_indexed = true;
            accepted_this_round = true;
            remove_consumed_peaks(&mut remaining_peaks, &output, detector);
            crystals.push(IndexedCrystal {
                cell: candidate.cell,
                orientation,
                method: candidate.method,
                reflections: output,
            });
        }
        if !accepted_this_round {
            break;
        }
    }

    let status = if any_indexed {
        FrameStatus::Indexed
    } else if let Some(err) = last_error {
        FrameStatus::Failed(err.to_string())
    } else {
        FrameStatus::NotIndexed
    };

    let crystal_records = crystals.iter().map(crystal_to_record).collect();

    Chunk {
        filename: filename.to_string(),
        event_id: event_id.to_string(),
        indexed_by: indexer_name,
        status,
        n_peaks,
        peaks: peak_records,
        crystals: crystal_records,
        extra_header_fields: vec![],
    }
}

fn integrate_all(frame: &Frame, detector: &Detector, reflections: &ReflectionList, cfg: &IntegrationConfig) {
    let mut cursor = reflections.cursor();
    while let Some(handle) = cursor.next() {
        let (fs, ss) = handle.with_mut(|r| (r.fs, r.ss));
        let Some(img) = locate_panel_image(frame, detector, fs, ss) else { continue };
        if let Some(result) = integrate_reflection(img, &handle, cfg) {
            handle.with_mut(|r| {
                r.intensity = result.intensity;
                r.sigma = result.sigma;
                r.background = result.background;
                r.scalable = result.scalable;
            });
        }
    }
}

/// Withhold peaks that lie within one pixel of an accepted crystal's
/// integrated reflections, so a subsequent indexing attempt (MULTI) sees
/// only the unexplained peaks.
fn remove_consumed_peaks(peaks: &mut Vec<Peak>, reflections: &ReflectionList, _detector: &Detector) {
    let mut cursor = reflections.cursor();
    let mut claimed = Vec::new();
    while let Some(handle) = cursor.next() {
        let (fs, ss, panel) = handle.with_mut(|r| (r.fs, r.ss, r.panel.clone().unwrap_or_default()));
        claimed.push((panel, fs, ss));
    }
    peaks.retain(|p| {
        !claimed
            .iter()
            .any(|(panel, fs, ss)| panel == &p.panel && (fs - p.fs).abs() < 1.0 && (ss - p.ss).abs() < 1.0)
    });
}

fn crystal_to_record(crystal: &IndexedCrystal) -> CrystalRecord {
    let params = crystal.cell.params().unwrap_or(crate::geometry::cell::CellParams {
        a: 0.0,
        b: 0.0,
        c: 0.0,
        alpha: 0.0,
        beta: 0.0,
        gamma: 0.0,
    });
    let mut cursor = crystal.reflections.cursor();
    let mut records = Vec::new();
    while let Some(handle) = cursor.next() {
        let r = handle.get();
        records.push(ReflectionRecord {
            h: r.h,
            k: r.k,
            l: r.l,
            intensity: r.intensity,
            sigma: r.sigma,
            partiality: r.partiality,
            background: r.background,
            fs: r.fs,
            ss: r.ss,
            panel: r.panel.unwrap_or_default(),
        });
    }
    let recip = crystal.orientation.reciprocal;
    CrystalRecord {
        cell_a: params.a,
        cell_b: params.b,
        cell_c: params.c,
        cell_alpha: params.alpha,
        cell_beta: params.beta,
        cell_gamma: params.gamma,
        osf: 1.0,
        profile_radius: 3e6,
        reciprocal: [
            [recip[(0, 0)], recip[(0, 1)], recip[(0, 2)]],
            [recip[(1, 0)], recip[(1, 1)], recip[(1, 2)]],
            [recip[(2, 0)], recip[(2, 1)], recip[(2, 2)]],
        ],
        reflections: records,
    }
}

/// Re-derive the scattering vector for a recorded reflection, used when a
/// downstream consumer (e.g. scaling) needs `q` but only has the oriented
/// cell and Miller indices on hand.
pub fn reflection_q(orientation: &Orientation, h: i32, k: i32, l: i32) -> nalgebra::Vector3<f64> {
    hkl_to_vector(&orientation.reciprocal, h, k, l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::detector::Panel;
    use crate::indexer::TestDoubleIndexer;
    use crate::peak_search::PanelImage;
    use nalgebra::Vector3;

    fn flat_detector() -> Detector {
        let panel = Panel {
            name: "p0".into(),
            min_fs: 0,
            max_fs: 511,
            min_ss: 0,
            max_ss: 511,
            corner: (-256.0, -256.0),
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

    fn flat_frame() -> Frame {
        Frame {
            panels: vec![PanelImage {
                panel_name: "p0".into(),
                width: 512,
                height: 512,
                data: vec![0.0; 512 * 512],
                bad: vec![false; 512 * 512],
                saturated: vec![false; 512 * 512],
            }],
        }
    }

    #[test]
    fn frame_with_too_few_peaks_is_not_indexed() {
        let detector = flat_detector();
        let frame = flat_frame();
        let peaks: Vec<Peak> = (0..3)
            .map(|i| Peak { panel: "p0".into(), fs: 100.0 + i as f64, ss: 100.0, intensity: 5000.0 })
            .collect();
        let indexer = TestDoubleIndexer { min_peaks_to_succeed: 1, fallback_cell: UnitCell::cubic(10e-9) };
        let cfg = PipelineConfig { min_peaks_for_indexing: 15, ..Default::default() };
        let chunk = process_frame("f.h5", "0", &frame, &detector, &PeakSource::External(peaks), &indexer, &cfg);
        assert_eq!(chunk.status, FrameStatus::NotIndexed);
        assert!(chunk.crystals.is_empty());
    }

    #[test]
    fn frame_with_enough_peaks_is_indexed_and_predicted() {
        let detector = flat_detector();
        let frame = flat_frame();
        let peaks: Vec<Peak> = (0..20)
            .map(|i| Peak { panel: "p0".into(), fs: 100.0 + i as f64, ss: 100.0, intensity: 5000.0 })
            .collect();
        let indexer = TestDoubleIndexer { min_peaks_to_succeed: 1, fallback_cell: UnitCell::cubic(10e-9) };
        let cfg = PipelineConfig { min_peaks_for_indexing: 15, ..Default::default() };
        let chunk = process_frame("f.h5", "0", &frame, &detector, &PeakSource::External(peaks), &indexer, &cfg);
        assert_eq!(chunk.status, FrameStatus::Indexed);
        assert_eq!(chunk.crystals.len(), 1);
    }

    fn predicted_peaks_for_fallback_cell(detector: &Detector, cfg: &PipelineConfig) -> Vec<Peak> {
        let cell = UnitCell::cubic(10e-9);
        let orientation = Orientation { reciprocal: cell.reciprocal().unwrap() };
        let q_max = detector.q_max(cfg.beam.wavelength, |_| None).unwrap();
        let output = ReflectionList::new();
        predict_reflections(&orientation, &cfg.beam, cfg.beam.profile_radius_default, detector, q_max, |_| None, &output);
        let mut peaks = Vec::new();
        let mut cursor = output.cursor();
        while let Some(handle) = cursor.next() {
            let r = handle.get();
            if let Some(panel) = r.panel {
                peaks.push(Peak { panel, fs: r.fs, ss: r.ss, intensity: 1000.0 });
            }
        }
        peaks
    }

    /// CHECK_PEAKS rejects a candidate whose predicted reflections have no
    /// relation to the detected peaks.
    #[test]
    fn check_peaks_rejects_candidate_with_unrelated_peaks() {
        let detector = flat_detector();
        let frame = flat_frame();
        // Well outside the panel's valid (fs,ss) range, so no predicted
        // reflection (always mapped within panel bounds) can ever be near.
        let peaks: Vec<Peak> = (0..20)
            .map(|i| Peak { panel: "p0".into(), fs: -50.0 + i as f64 * 0.01, ss: -50.0, intensity: 5000.0 })
            .collect();
        let indexer = TestDoubleIndexer { min_peaks_to_succeed: 1, fallback_cell: UnitCell::cubic(10e-9) };
        let cfg = PipelineConfig {
            min_peaks_for_indexing: 15,
            check_peaks: true,
            check_peaks_min_fraction: 0.5,
            ..Default::default()
        };
        let chunk = process_frame("f.h5", "0", &frame, &detector, &PeakSource::External(peaks), &indexer, &cfg);
        assert_eq!(chunk.status, FrameStatus::NotIndexed);
        assert!(chunk.crystals.is_empty());
    }

    /// CHECK_PEAKS accepts a candidate when the detected peaks coincide with
    /// its own predicted reflections.
    #[test]
    fn check_peaks_accepts_candidate_with_matching_peaks() {
        let detector = flat_detector();
        let frame = flat_frame();
        let base_cfg = PipelineConfig { min_peaks_for_indexing: 15, ..Default::default() };
        let peaks = predicted_peaks_for_fallback_cell(&detector, &base_cfg);
        assert!(peaks.len() >= 15, "fixture should predict enough reflections to index");

        let indexer = TestDoubleIndexer { min_peaks_to_succeed: 1, fallback_cell: UnitCell::cubic(10e-9) };
        let cfg = PipelineConfig {
            check_peaks: true,
            check_peaks_min_fraction: 0.5,
            ..base_cfg
        };
        let chunk = process_frame("f.h5", "0", &frame, &detector, &PeakSource::External(peaks), &indexer, &cfg);
        assert_eq!(chunk.status, FrameStatus::Indexed);
        assert_eq!(chunk.crystals.len(), 1);
    }

    /// Enabling prediction-refinement against peaks that already match the
    /// candidate orientation should keep it indexed rather than diverging.
    #[test]
    fn refine_enabled_still_indexes_a_well_matched_frame() {
        let detector = flat_detector();
        let frame = flat_frame();
        let base_cfg = PipelineConfig { min_peaks_for_indexing: 15, ..Default::default() };
        let peaks = predicted_peaks_for_fallback_cell(&detector, &base_cfg);

        let indexer = TestDoubleIndexer { min_peaks_to_succeed: 1, fallback_cell: UnitCell::cubic(10e-9) };
        let cfg = PipelineConfig { refine: true, ..base_cfg };
        let chunk = process_frame("f.h5", "0", &frame, &detector, &PeakSource::External(peaks), &indexer, &cfg);
        assert_eq!(chunk.status, FrameStatus::Indexed);
        assert_eq!(chunk.crystals.len(), 1);
    }
}
