//! `partialator`: read a stream, scale and post-refine, write a merged
//! reflection list.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use nalgebra::Matrix3;
use tracing::{info, warn};

use xtal_engine::config::init_tracing;
use xtal_engine::error::{EngineError, Result};
use xtal_engine::prediction::BeamSnapshot;
use xtal_engine::scaling::{Crystal, MergedList, ScalingConfig, ScalingReflection};
use xtal_engine::stream::read_stream;
use xtal_engine::symmetry::{reduce_to_asymmetric_unit, PointGroup};

/// Scale and post-refine a stream's crystals into a merged reflection list.
#[derive(Parser, Debug)]
#[command(name = "partialator", version, about = "Scale and post-refine a stream into a merged reflection list")]
struct Args {
    /// Input stream file.
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Point-group symbol, e.g. "mmm", "-1", "m-3m".
    #[arg(short = 'y', long)]
    pointgroup: String,

    /// Beam wavelength in Angstrom (divergence/bandwidth use this engine's
    /// defaults; a full beam-file format is outside this engine's scope).
    #[arg(short = 'b', long, default_value_t = 1.0)]
    beam: f64,

    /// Maximum number of scale/post-refine outer-loop iterations.
    #[arg(short = 'n', long, default_value_t = 10)]
    iterations: usize,

    /// Number of threads for the post-refinement fan-out (0 = rayon default).
    #[arg(short = 'j', long, default_value_t = 0)]
    n_threads: usize,

    /// Output merged-reflection-list file (HKL text, one row per
    /// symmetry-unique reflection).
    #[arg(short = 'o', long, default_value = "merged.hkl")]
    output: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let point_group = PointGroup::from_symbol(&args.pointgroup).ok_or_else(|| EngineError::MalformedInput {
        path: args.pointgroup.clone(),
        reason: "unrecognised point-group symbol".into(),
    })?;

    if args.n_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.n_threads)
            .build_global()
            .map_err(|e| EngineError::MalformedInput { path: "-j".into(), reason: e.to_string() })?;
    }

    let file = File::open(&args.input)?;
    let parsed = read_stream(file)?;
    if parsed.truncated {
        warn!(path = %args.input.display(), "stream ends in a truncated final chunk, continuing with what was read");
    }
    info!(chunks = parsed.chunks.len(), pointgroup = %args.pointgroup, "stream loaded");

    let beam = BeamSnapshot {
        wavelength: args.beam * 1e-10,
        divergence: 0.0,
        bandwidth: 0.01,
        profile_radius_default: 3e6,
    };

    let mut crystals = Vec::new();
    for chunk in &parsed.chunks {
        for crystal_record in &chunk.crystals {
            let reciprocal = Matrix3::new(
                crystal_record.reciprocal[0][0],
                crystal_record.reciprocal[0][1],
                crystal_record.reciprocal[0][2],
                crystal_record.reciprocal[1][0],
                crystal_record.reciprocal[1][1],
                crystal_record.reciprocal[1][2],
                crystal_record.reciprocal[2][0],
                crystal_record.reciprocal[2][1],
                crystal_record.reciprocal[2][2],
            );
            let reflections: Vec<ScalingReflection> = crystal_record
                .reflections
                .iter()
                .filter(|r| r.sigma > 0.0)
                .map(|r| {
                    let canonical = reduce_to_asymmetric_unit(point_group, (r.h, r.k, r.l));
                    ScalingReflection {
                        hkl: canonical,
                        h: r.h,
                        k: r.k,
                        l: r.l,
                        intensity: r.intensity,
                        sigma: r.sigma,
                        partiality: r.partiality.max(0.1),
                        lorentz: 1.0,
                        negative_intensity: r.intensity < 0.0,
                        scalable: r.partiality >= 0.1,
                        refinable: false,
                    }
                })
                .collect();

            crystals.push(Crystal {
                reciprocal,
                osf: 1.0,
                profile_radius: crystal_record.profile_radius,
                beam,
                reflections,
                pr_dud: false,
            });
        }
    }
    info!(crystals = crystals.len(), "crystals loaded for scaling");

    let merged = MergedList::new();
    let cfg = ScalingConfig { n_iterations: args.iterations, ..ScalingConfig::default() };
    let iterations_run = xtal_engine::scaling::run_outer_loop(&mut crystals, &merged, &cfg, false);
    let n_dud = crystals.iter().filter(|c| c.pr_dud).count();
    info!(iterations_run, crystals_excluded = n_dud, merged_reflections = merged.len(), "scaling converged");

    write_merged_hkl(&args.output, &crystals, &merged)?;
    info!(output = %args.output.display(), "merged reflection list written");
    Ok(())
}

fn write_merged_hkl(path: &PathBuf, crystals: &[Crystal], merged: &MergedList) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "  h   k   l          I    redundancy")?;
    for crystal in crystals {
        for r in &crystal.reflections {
            if !seen.insert(r.hkl) {
                continue;
            }
            let Some(m) = merged.get(r.hkl) else { continue };
            let (h, k, l) = r.hkl;
            writeln!(out, "{h:4} {k:4} {l:4} {:12.2} {:6}", m.full_intensity, m.redundancy)?;
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognised_point_group_is_rejected() {
        assert!(PointGroup::from_symbol("not-a-group").is_none());
    }
}
