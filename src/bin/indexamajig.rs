//! `indexamajig`: process a list of diffraction frames into a stream file.
//!
//! Drives the per-frame pipeline (peak search, indexing, prediction,
//! integration) across a list of input frames using the range-mode worker
//! pool, emitting one [`xtal_engine::stream::Chunk`] per frame.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use xtal_engine::config::{init_tracing, PeakAlgorithm, RunConfig};
use xtal_engine::error::Result;
use xtal_engine::geometry::geom_file::parse_geom_file;
use xtal_engine::indexer::{Indexer, TestDoubleIndexer};
use xtal_engine::peak_search::{Frame, PanelImage};
use xtal_engine::pipeline::{process_frame, PeakSource, PipelineConfig};
use xtal_engine::prediction::BeamSnapshot;
use xtal_engine::progress::Progress;
use xtal_engine::stream::{write_stream, Prologue};
use xtal_engine::worker_pool::{run_range, StopFlag};

/// Index a list of diffraction frames and write a stream file.
#[derive(Parser, Debug)]
#[command(name = "indexamajig", version, about = "Index serial crystallography frames into a stream file")]
struct Args {
    /// Text file listing one input frame path per line.
    #[arg(short = 'i', long)]
    input_list: PathBuf,

    /// Detector geometry file.
    #[arg(short = 'g', long)]
    geometry: PathBuf,

    /// Optional run-configuration TOML file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output stream file.
    #[arg(short = 'o', long, default_value = "output.stream")]
    output: PathBuf,

    /// Number of worker threads.
    #[arg(short = 'j', long, default_value_t = 4)]
    n_workers: usize,

    /// Incident wavelength, Angstrom.
    #[arg(long, default_value_t = 1.0)]
    wavelength_angstrom: f64,
}

struct IndicatifProgress(ProgressBar);

impl Progress for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.0.set_length(total);
    }
    fn set_position(&self, position: u64) {
        self.0.set_position(position);
    }
    fn finish(&self) {
        self.0.finish_with_message("done");
    }
}

/// Placeholder frame loader: real image formats (HDF5, CBF) are outside
/// this engine's scope (non-goal); this produces an all-zero frame sized
/// to the geometry so the pipeline's control flow can run against real
/// paths end to end.
fn load_frame(detector: &xtal_engine::geometry::Detector) -> Frame {
    Frame {
        panels: detector
            .panels
            .iter()
            .map(|p| {
                let w = p.width() as usize;
                let h = p.height() as usize;
                PanelImage {
                    panel_name: p.name.clone(),
                    width: w,
                    height: h,
                    data: vec![0.0; w * h],
                    bad: vec![false; w * h],
                    saturated: vec![false; w * h],
                }
            })
            .collect(),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let detector = parse_geom_file(&args.geometry)?;
    info!(panels = detector.panels.len(), "geometry loaded");

    let run_config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    let frame_paths: Vec<String> = std::fs::read_to_string(&args.input_list)?
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    let beam = BeamSnapshot {
        wavelength: args.wavelength_angstrom * 1e-10,
        divergence: 0.0,
        bandwidth: 0.01,
        profile_radius_default: 3e6,
    };

    let pipeline_cfg = PipelineConfig {
        min_peaks_for_indexing: run_config.min_peaks_for_indexing,
        tolerances: run_config.tolerances,
        integration: run_config.integration.clone(),
        beam,
        ..Default::default()
    };

    let indexer: Box<dyn Indexer> = Box::new(TestDoubleIndexer {
        min_peaks_to_succeed: run_config.min_peaks_for_indexing,
        fallback_cell: xtal_engine::geometry::UnitCell::cubic(10e-9),
    });

    let peak_source_template = match run_config.peak_algorithm {
        PeakAlgorithm::Zaef => PeakSource::Zaef(run_config.zaef.clone()),
        PeakAlgorithm::Peakfinder8 => PeakSource::Peakfinder8(run_config.peakfinder.clone()),
        PeakAlgorithm::Peakfinder9 => PeakSource::Peakfinder9(run_config.peakfinder.clone()),
    };
    let chunks: Mutex<Vec<xtal_engine::stream::Chunk>> = Mutex::new(Vec::with_capacity(frame_paths.len()));
    let stop = StopFlag::new();
    let bar = ProgressBar::new(frame_paths.len() as u64);
    bar.set_style(ProgressStyle::with_template("{bar:40} {pos}/{len} frames").unwrap_or(ProgressStyle::default_bar()));
    let progress = IndicatifProgress(bar);

    run_range(
        frame_paths.len(),
        args.n_workers,
        |i| {
            let path = &frame_paths[i];
            let frame = load_frame(&detector);
            let chunk = process_frame(path, "0", &frame, &detector, &peak_source_template, indexer.as_ref(), &pipeline_cfg);
            if matches!(chunk.status, xtal_engine::stream::FrameStatus::Failed(_)) {
                warn!(frame = %path, "frame processing failed");
            }
            chunks.lock().expect("chunk list mutex poisoned").push(chunk);
        },
        &stop,
        &progress,
    );
    progress.finish();

    let mut chunks = chunks.into_inner().expect("chunk list mutex poisoned");
    chunks.sort_by(|a, b| a.filename.cmp(&b.filename));

    let prologue = Prologue {
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        argv: std::env::args().collect(),
        geometry_text: std::fs::read_to_string(&args.geometry).unwrap_or_default(),
        target_cell_text: String::new(),
    };

    let file = File::create(&args.output)?;
    let mut out = BufWriter::new(file);
    write_stream(&mut out, &prologue, &chunks)?;
    out.flush()?;

    info!(frames = chunks.len(), output = %args.output.display(), "stream written");
    Ok(())
}
