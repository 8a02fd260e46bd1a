//! The append-only text stream codec (component I).
//!
//! Hand-written rather than serde-derived: the format is a bespoke,
//! line-oriented, begin/end-delimited grammar, not a generic serialization
//! target (the same reasoning that keeps the teacher's CIF reader off
//! serde).

use std::io::{BufRead, BufReader, Read, Write};

use crate::error::{EngineError, Result};

/// Status of one frame's processing, embedded in its stream chunk rather
/// than propagated as a hard error (spec §7 propagation policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    Indexed,
    NotIndexed,
    Failed(String),
}

impl FrameStatus {
    fn to_field(&self) -> String {
        match self {
            FrameStatus::Indexed => "indexed".into(),
            FrameStatus::NotIndexed => "not-indexed".into(),
            FrameStatus::Failed(reason) => format!("failed: {reason}"),
        }
    }

    fn from_field(s: &str) -> Self {
        if s == "indexed" {
            FrameStatus::Indexed
        } else if s == "not-indexed" {
            FrameStatus::NotIndexed
        } else if let Some(reason) = s.strip_prefix("failed: ") {
            FrameStatus::Failed(reason.to_string())
        } else {
            FrameStatus::Failed(format!("unrecognised status '{s}'"))
        }
    }
}

/// One reflection table row, the unit emitted for both peaks and
/// integrated reflections.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionRecord {
    pub h: i32,
    pub k: i32,
    pub l: i32,
    pub intensity: f64,
    pub sigma: f64,
    pub partiality: f64,
    pub background: f64,
    pub fs: f64,
    pub ss: f64,
    pub panel: String,
}

/// One crystal sub-block within a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct CrystalRecord {
    pub cell_a: f64,
    pub cell_b: f64,
    pub cell_c: f64,
    pub cell_alpha: f64,
    pub cell_beta: f64,
    pub cell_gamma: f64,
    pub osf: f64,
    pub profile_radius: f64,
    /// Oriented reciprocal-space axes (rows a*, b*, c*, metres⁻¹), as used
    /// by prediction and by partialator's post-refinement.
    pub reciprocal: [[f64; 3]; 3],
    pub reflections: Vec<ReflectionRecord>,
}

/// One frame's worth of output records.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub filename: String,
    pub event_id: String,
    pub indexed_by: String,
    pub status: FrameStatus,
    pub n_peaks: usize,
    pub peaks: Vec<ReflectionRecord>,
    pub crystals: Vec<CrystalRecord>,
    /// Unrecognised header fields, preserved verbatim for forward
    /// compatibility (spec §4.I: "reader must tolerate unknown header
    /// fields").
    pub extra_header_fields: Vec<(String, String)>,
}

/// The file prologue: engine version, argv, geometry-file contents, target
/// cell text, carried once at the start of a stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Prologue {
    pub engine_version: String,
    pub argv: Vec<String>,
    pub geometry_text: String,
    pub target_cell_text: String,
}

const CHUNK_BEGIN: &str = "----- Begin chunk -----";
const CHUNK_END: &str = "----- End chunk -----";
const CRYSTAL_BEGIN: &str = "--- Begin crystal";
const CRYSTAL_END: &str = "--- End crystal";
const PEAK_BEGIN: &str = "Peaks from peak search";
const PEAK_END: &str = "End of peak list";
const REFLECTION_BEGIN: &str = "Reflections measured after indexing";
const REFLECTION_END: &str = "End of reflections";
const GEOM_BEGIN: &str = "----- Begin geometry file -----";
const GEOM_END: &str = "----- End geometry file -----";
const CELL_BEGIN: &str = "----- Begin unit cell -----";
const CELL_END: &str = "----- End unit cell -----";

/// Write a prologue followed by every chunk to `out`. Writes are expected
/// to be serialised by the caller under a single mutex (spec §5 ordering
/// guarantee: chunks are byte-contiguous, no per-frame ordering required).
pub fn write_stream<W: Write>(out: &mut W, prologue: &Prologue, chunks: &[Chunk]) -> Result<()> {
    writeln!(out, "CrystFEL-compatible stream version 1.0")?;
    writeln!(out, "engine_version = {}", prologue.engine_version)?;
    writeln!(out, "argv = {}", prologue.argv.join(" "))?;
    writeln!(out, "{GEOM_BEGIN}")?;
    write!(out, "{}", prologue.geometry_text)?;
    if !prologue.geometry_text.ends_with('\n') {
        writeln!(out)?;
    }
    writeln!(out, "{GEOM_END}")?;
    writeln!(out, "{CELL_BEGIN}")?;
    write!(out, "{}", prologue.target_cell_text)?;
    if !prologue.target_cell_text.ends_with('\n') {
        writeln!(out)?;
    }
    writeln!(out, "{CELL_END}")?;

    for chunk in chunks {
        write_chunk(out, chunk)?;
    }
    Ok(())
}

fn write_chunk<W: Write>(out: &mut W, chunk: &Chunk) -> Result<()> {
    writeln!(out, "{CHUNK_BEGIN}")?;
    writeln!(out, "Image filename: {}", chunk.filename)?;
    writeln!(out, "Event: {}", chunk.event_id)?;
    writeln!(out, "indexed_by = {}", chunk.indexed_by)?;
    writeln!(out, "status = {}", chunk.status.to_field())?;
    writeln!(out, "num_peaks = {}", chunk.n_peaks)?;
    for (k, v) in &chunk.extra_header_fields {
        writeln!(out, "{k} = {v}")?;
    }

    writeln!(out, "{PEAK_BEGIN}")?;
    writeln!(out, "  fs/px   ss/px (1/d)/nm^-1   Intensity  Panel")?;
    for p in &chunk.peaks {
        writeln!(out, "{:12.6} {:12.6} {:12.6} {:12.2} {}", p.fs, p.ss, p.background, p.intensity, p.panel)?;
    }
    writeln!(out, "{PEAK_END}")?;

    for crystal in &chunk.crystals {
        writeln!(out, "{CRYSTAL_BEGIN} -----")?;
        writeln!(
            out,
            "Cell parameters {:.6} {:.6} {:.6} nm, {:.6} {:.6} {:.6} deg",
            crystal.cell_a * 1e9,
            crystal.cell_b * 1e9,
            crystal.cell_c * 1e9,
            crystal.cell_alpha.to_degrees(),
            crystal.cell_beta.to_degrees(),
            crystal.cell_gamma.to_degrees()
        )?;
        writeln!(out, "OSF = {:.6}", crystal.osf)?;
        writeln!(out, "profile_radius = {:.6} nm^-1", crystal.profile_radius * 1e-9)?;
        let r = crystal.reciprocal;
        writeln!(out, "astar = {:.8} {:.8} {:.8} nm^-1", r[0][0] * 1e-9, r[0][1] * 1e-9, r[0][2] * 1e-9)?;
        writeln!(out, "bstar = {:.8} {:.8} {:.8} nm^-1", r[1][0] * 1e-9, r[1][1] * 1e-9, r[1][2] * 1e-9)?;
        writeln!(out, "cstar = {:.8} {:.8} {:.8} nm^-1", r[2][0] * 1e-9, r[2][1] * 1e-9, r[2][2] * 1e-9)?;
        writeln!(out, "{REFLECTION_BEGIN}")?;
        writeln!(out, "   h    k    l          I    sigma(I)       peak background  fs/px  ss/px panel")?;
        for r in &crystal.reflections {
            writeln!(
                out,
                "{:4} {:4} {:4} {:10.2} {:10.2} {:10.4} {:10.2} {:7.2} {:7.2} {}",
                r.h, r.k, r.l, r.intensity, r.sigma, r.partiality, r.background, r.fs, r.ss, r.panel
            )?;
        }
        writeln!(out, "{REFLECTION_END}")?;
        writeln!(out, "{CRYSTAL_END} -----")?;
    }

    writeln!(out, "{CHUNK_END}")?;
    Ok(())
}

/// Read a full stream into a prologue and its chunks. Truncated final
/// chunks are reported via the returned `truncated` flag rather than
/// failing outright (spec §4.I).
pub struct ReadResult {
    pub prologue: Prologue,
    pub chunks: Vec<Chunk>,
    pub truncated: bool,
}

pub fn read_stream<R: Read>(input: R) -> Result<ReadResult> {
    let mut lines = BufReader::new(input).lines();
    let mut prologue = Prologue::default();
    let mut chunks = Vec::new();
    let mut truncated = false;

    while let Some(line) = lines.next() {
        let line = line?;
        if let Some(v) = line.strip_prefix("engine_version = ") {
            prologue.engine_version = v.to_string();
        } else if let Some(v) = line.strip_prefix("argv = ") {
            prologue.argv = v.split_whitespace().map(String::from).collect();
        } else if line == GEOM_BEGIN {
            prologue.geometry_text = read_block(&mut lines, GEOM_END)?;
        } else if line == CELL_BEGIN {
            prologue.target_cell_text = read_block(&mut lines, CELL_END)?;
        } else if line == CHUNK_BEGIN {
            match read_chunk(&mut lines) {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) => {
                    truncated = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(ReadResult { prologue, chunks, truncated })
}

fn read_block(lines: &mut std::io::Lines<BufReader<impl Read>>, end_marker: &str) -> Result<String> {
    let mut out = String::new();
    for line in lines.by_ref() {
        let line = line?;
        if line == end_marker {
            return Ok(out);
        }
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn read_chunk(lines: &mut std::io::Lines<BufReader<impl Read>>) -> Result<Option<Chunk>> {
    let mut filename = String::new();
    let mut event_id = String::new();
    let mut indexed_by = String::new();
    let mut status = FrameStatus::NotIndexed;
    let mut n_peaks = 0usize;
    let mut peaks = Vec::new();
    let mut crystals = Vec::new();
    let mut extra_header_fields = Vec::new();
    let mut saw_end = false;

    loop {
        let Some(line) = lines.next() else { break };
        let line = line?;
        if line == CHUNK_END {
            saw_end = true;
            break;
        } else if let Some(v) = line.strip_prefix("Image filename: ") {
            filename = v.to_string();
        } else if let Some(v) = line.strip_prefix("Event: ") {
            event_id = v.to_string();
        } else if let Some(v) = line.strip_prefix("indexed_by = ") {
            indexed_by = v.to_string();
        } else if let Some(v) = line.strip_prefix("status = ") {
            status = FrameStatus::from_field(v);
        } else if let Some(v) = line.strip_prefix("num_peaks = ") {
            n_peaks = v.trim().parse().unwrap_or(0);
        } else if line == PEAK_BEGIN {
            peaks = read_peak_table(lines)?;
        } else if line.starts_with(CRYSTAL_BEGIN) {
            crystals.push(read_crystal(lines)?);
        } else if let Some((k, v)) = line.split_once(" = ") {
            // Forward compatibility: preserve unrecognised key=value header
            // fields verbatim rather than failing.
            extra_header_fields.push((k.to_string(), v.to_string()));
        }
    }

    if !saw_end {
        return Ok(None);
    }

    Ok(Some(Chunk {
        filename,
        event_id,
        indexed_by,
        status,
        n_peaks,
        peaks,
        crystals,
        extra_header_fields,
    }))
}

fn read_peak_table(lines: &mut std::io::Lines<BufReader<impl Read>>) -> Result<Vec<ReflectionRecord>> {
    let mut out = Vec::new();
    for line in lines.by_ref() {
        let line = line?;
        if line == PEAK_END {
            return Ok(out);
        }
        if line.trim().is_empty() || line.trim_start().starts_with("fs/px") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        out.push(ReflectionRecord {
            h: 0,
            k: 0,
            l: 0,
            intensity: parse_field(fields[3])?,
            sigma: 0.0,
            partiality: 0.0,
            background: parse_field(fields[2])?,
            fs: parse_field(fields[0])?,
            ss: parse_field(fields[1])?,
            panel: fields[4].to_string(),
        });
    }
    Err(EngineError::MalformedInput {
        path: "stream".into(),
        reason: "peak table not terminated".into(),
    })
}

fn parse_star_vector(rest: &str) -> [f64; 3] {
    let nums: Vec<f64> = rest.split_whitespace().filter_map(|t| t.parse::<f64>().ok()).collect();
    if nums.len() >= 3 {
        [nums[0] * 1e9, nums[1] * 1e9, nums[2] * 1e9]
    } else {
        [0.0, 0.0, 0.0]
    }
}

fn read_crystal(lines: &mut std::io::Lines<BufReader<impl Read>>) -> Result<CrystalRecord> {
    let mut cell = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    let mut osf = 1.0;
    let mut profile_radius = 0.0;
    let mut reciprocal = [[0.0; 3]; 3];
    let mut reflections = Vec::new();

    for line in lines.by_ref() {
        let line = line?;
        if line.starts_with(CRYSTAL_END) {
            return Ok(CrystalRecord {
                cell_a: cell.0,
                cell_b: cell.1,
                cell_c: cell.2,
                cell_alpha: cell.3,
                cell_beta: cell.4,
                cell_gamma: cell.5,
                osf,
                profile_radius,
                reciprocal,
                reflections,
            });
        } else if let Some(rest) = line.strip_prefix("astar = ") {
            reciprocal[0] = parse_star_vector(rest);
        } else if let Some(rest) = line.strip_prefix("bstar = ") {
            reciprocal[1] = parse_star_vector(rest);
        } else if let Some(rest) = line.strip_prefix("cstar = ") {
            reciprocal[2] = parse_star_vector(rest);
        } else if let Some(rest) = line.strip_prefix("Cell parameters ") {
            let nums: Vec<f64> = rest
                .split_whitespace()
                .filter_map(|t| t.parse::<f64>().ok())
                .collect();
            if nums.len() >= 6 {
                cell = (
                    nums[0] * 1e-9,
                    nums[1] * 1e-9,
                    nums[2] * 1e-9,
                    nums[3].to_radians(),
                    nums[4].to_radians(),
                    nums[5].to_radians(),
                );
            }
        } else if let Some(v) = line.strip_prefix("OSF = ") {
            osf = v.trim().parse().unwrap_or(1.0);
        } else if let Some(v) = line.strip_prefix("profile_radius = ") {
            let num_str = v.split_whitespace().next().unwrap_or("0");
            profile_radius = num_str.parse::<f64>().unwrap_or(0.0) * 1e9;
        } else if line == REFLECTION_BEGIN {
            reflections = read_reflection_table(lines)?;
        }
    }

    Err(EngineError::MalformedInput {
        path: "stream".into(),
        reason: "crystal block not terminated".into(),
    })
}

fn read_reflection_table(lines: &mut std::io::Lines<BufReader<impl Read>>) -> Result<Vec<ReflectionRecord>> {
    let mut out = Vec::new();
    for line in lines.by_ref() {
        let line = line?;
        if line == REFLECTION_END {
            return Ok(out);
        }
        if line.trim().is_empty() || line.trim_start().starts_with('h') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        out.push(ReflectionRecord {
            h: fields[0].parse().unwrap_or(0),
            k: fields[1].parse().unwrap_or(0),
            l: fields[2].parse().unwrap_or(0),
            intensity: parse_field(fields[3])?,
            sigma: parse_field(fields[4])?,
            partiality: parse_field(fields[5])?,
            background: parse_field(fields[6])?,
            fs: parse_field(fields[7])?,
            ss: parse_field(fields[8])?,
            panel: fields[9].to_string(),
        });
    }
    Err(EngineError::MalformedInput {
        path: "stream".into(),
        reason: "reflection table not terminated".into(),
    })
}

fn parse_field(s: &str) -> Result<f64> {
    s.parse().map_err(|_| EngineError::MalformedInput {
        path: "stream".into(),
        reason: format!("expected a number, got '{s}'"),
    })
}
