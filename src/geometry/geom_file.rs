//! Plain-text geometry file parser (`key = value` / `panel/key = value`).

use std::collections::HashMap;
use std::path::Path;

use nalgebra::Vector3;
use regex::Regex;

use crate::error::{EngineError, Result};
use crate::geometry::detector::{Detector, Panel};

/// Parse a geometry file from disk.
pub fn parse_geom_file(path: &Path) -> Result<Detector> {
    let content = std::fs::read_to_string(path)?;
    parse_geom_str(&content, &path.display().to_string())
}

#[derive(Default)]
struct PanelBuilder {
    min_fs: Option<u32>,
    max_fs: Option<u32>,
    min_ss: Option<u32>,
    max_ss: Option<u32>,
    corner_x: Option<f64>,
    corner_y: Option<f64>,
    fs_vec: Option<Vector3<f64>>,
    ss_vec: Option<Vector3<f64>>,
    res: Option<f64>,
    clen: Option<f64>,
    clen_from: Option<String>,
    no_index: bool,
}

impl PanelBuilder {
    fn build(self, name: &str) -> Result<Panel> {
        let missing = |field: &str| EngineError::MalformedInput {
            path: "geometry file".into(),
            reason: format!("panel '{name}' missing required key '{field}'"),
        };
        let min_fs = self.min_fs.ok_or_else(|| missing("min_fs"))?;
        let max_fs = self.max_fs.ok_or_else(|| missing("max_fs"))?;
        let min_ss = self.min_ss.ok_or_else(|| missing("min_ss"))?;
        let max_ss = self.max_ss.ok_or_else(|| missing("max_ss"))?;
        let res = self.res.ok_or_else(|| missing("res"))?;
        let pixel_pitch = 1.0 / res;
        let fs_vec = self.fs_vec.unwrap_or_else(|| Vector3::new(1.0, 0.0, 0.0)) * pixel_pitch;
        let ss_vec = self.ss_vec.unwrap_or_else(|| Vector3::new(0.0, 1.0, 0.0)) * pixel_pitch;
        Ok(Panel {
            name: name.to_string(),
            min_fs,
            max_fs,
            min_ss,
            max_ss,
            corner: (self.corner_x.unwrap_or(0.0), self.corner_y.unwrap_or(0.0)),
            fs_vec,
            ss_vec,
            pixel_pitch,
            camera_length: self.clen,
            clen_from: self.clen_from,
            bad_mask: vec![vec![false; (max_fs - min_fs + 1) as usize]; (max_ss - min_ss + 1) as usize],
            no_index: self.no_index,
        })
    }
}

/// Parse geometry file content already read into memory.
pub fn parse_geom_str(content: &str, path: &str) -> Result<Detector> {
    let line_re = Regex::new(r"^\s*([A-Za-z0-9_./*-]+)\s*=\s*(.+?)\s*$").expect("static regex");
    let vector_re = Regex::new(r"^\s*([+-]?[\d.eE+-]+)x\s*([+-]?[\d.eE+-]+)y\s*(?:([+-]?[\d.eE+-]+)z)?\s*$")
        .expect("static regex");

    let mut global_clen: Option<f64> = None;
    let mut photon_energy: Option<f64> = None;
    let mut adu_per_ev: Option<f64> = None;
    let mut panels: HashMap<String, PanelBuilder> = HashMap::new();
    let mut panel_order: Vec<String> = Vec::new();

    for (lineno, raw_line) in content.lines().enumerate() {
        let line = raw_line.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let caps = match line_re.captures(line) {
            Some(c) => c,
            None => continue,
        };
        let key = caps.get(1).unwrap().as_str();
        let value = caps.get(2).unwrap().as_str().trim();

        if let Some((panel_name, panel_key)) = key.split_once('/') {
            let builder = panels.entry(panel_name.to_string()).or_insert_with(|| {
                panel_order.push(panel_name.to_string());
                PanelBuilder::default()
            });
            apply_panel_key(builder, panel_key, value, &vector_re, path, lineno + 1)?;
            continue;
        }

        match key {
            "clen" => global_clen = Some(parse_f64(value, path, lineno + 1)?),
            "photon_energy" => photon_energy = Some(parse_f64(value, path, lineno + 1)?),
            "adu_per_eV" | "adu_per_ev" => adu_per_ev = Some(parse_f64(value, path, lineno + 1)?),
            "mask_good" | "mask_bad" => {
                // Recognised but not interpreted further here: applied when loading frames.
            }
            _ => {}
        }
    }

    let mut built_panels = Vec::with_capacity(panel_order.len());
    for name in panel_order {
        let builder = panels.remove(&name).expect("just inserted");
        built_panels.push(builder.build(&name)?);
    }

    if built_panels.is_empty() {
        return Err(EngineError::InvalidGeometry {
            reason: format!("{path}: no panels defined"),
        });
    }

    for (i, a) in built_panels.iter().enumerate() {
        for b in &built_panels[i + 1..] {
            if ranges_overlap(a.min_fs, a.max_fs, b.min_fs, b.max_fs) && ranges_overlap(a.min_ss, a.max_ss, b.min_ss, b.max_ss) {
                return Err(EngineError::InvalidGeometry {
                    reason: format!("panels '{}' and '{}' overlap in (fs,ss) address space", a.name, b.name),
                });
            }
        }
    }

    Ok(Detector {
        panels: built_panels,
        default_clen: global_clen,
        photon_energy_ev: photon_energy,
        adu_per_ev,
    })
}

fn ranges_overlap(a_min: u32, a_max: u32, b_min: u32, b_max: u32) -> bool {
    a_min <= b_max && b_min <= a_max
}

fn apply_panel_key(
    builder: &mut PanelBuilder,
    key: &str,
    value: &str,
    vector_re: &Regex,
    path: &str,
    lineno: usize,
) -> Result<()> {
    match key {
        "min_fs" => builder.min_fs = Some(parse_u32(value, path, lineno)?),
        "max_fs" => builder.max_fs = Some(parse_u32(value, path, lineno)?),
        "min_ss" => builder.min_ss = Some(parse_u32(value, path, lineno)?),
        "max_ss" => builder.max_ss = Some(parse_u32(value, path, lineno)?),
        "corner_x" => builder.corner_x = Some(parse_f64(value, path, lineno)?),
        "corner_y" => builder.corner_y = Some(parse_f64(value, path, lineno)?),
        "res" => builder.res = Some(parse_f64(value, path, lineno)?),
        "fs" => builder.fs_vec = Some(parse_vector(value, vector_re, path, lineno)?),
        "ss" => builder.ss_vec = Some(parse_vector(value, vector_re, path, lineno)?),
        "no_index" => builder.no_index = value == "1" || value.eq_ignore_ascii_case("true"),
        "clen" => {
            if let Ok(v) = value.parse::<f64>() {
                builder.clen = Some(v);
            } else {
                builder.clen_from = Some(value.to_string());
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_vector(value: &str, re: &Regex, path: &str, lineno: usize) -> Result<Vector3<f64>> {
    let caps = re.captures(value.trim()).ok_or_else(|| EngineError::MalformedInput {
        path: path.into(),
        reason: format!("line {lineno}: malformed vector '{value}'"),
    })?;
    let x: f64 = caps.get(1).unwrap().as_str().parse().unwrap_or(0.0);
    let y: f64 = caps.get(2).unwrap().as_str().parse().unwrap_or(0.0);
    let z: f64 = caps.get(3).map(|m| m.as_str().parse().unwrap_or(0.0)).unwrap_or(0.0);
    Ok(Vector3::new(x, y, z))
}

fn parse_f64(value: &str, path: &str, lineno: usize) -> Result<f64> {
    value.parse().map_err(|_| EngineError::MalformedInput {
        path: path.into(),
        reason: format!("line {lineno}: expected a number, got '{value}'"),
    })
}

fn parse_u32(value: &str, path: &str, lineno: usize) -> Result<u32> {
    value.parse().map_err(|_| EngineError::MalformedInput {
        path: path.into(),
        reason: format!("line {lineno}: expected an integer, got '{value}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
clen = 0.08
photon_energy = 9500
adu_per_eV = 0.01

panel0/min_fs = 0
panel0/max_fs = 511
panel0/min_ss = 0
panel0/max_ss = 1023
panel0/corner_x = -256.0
panel0/corner_y = -512.0
panel0/fs = 1.0x 0.0y
panel0/ss = 0.0x 1.0y
panel0/res = 10000

panel1/min_fs = 512
panel1/max_fs = 1023
panel1/min_ss = 0
panel1/max_ss = 1023
panel1/corner_x = 0.0
panel1/corner_y = -512.0
panel1/fs = 1.0x 0.0y
panel1/ss = 0.0x 1.0y
panel1/res = 10000
panel1/clen = beam/clen_from_header
";

    #[test]
    fn parses_two_panels() {
        let det = parse_geom_str(SAMPLE, "test.geom").unwrap();
        assert_eq!(det.panels.len(), 2);
        assert_eq!(det.default_clen, Some(0.08));
        assert_eq!(det.panels[0].name, "panel0");
        assert_eq!(det.panels[1].clen_from.as_deref(), Some("beam/clen_from_header"));
    }

    #[test]
    fn rejects_overlapping_panels() {
        let overlapping = SAMPLE.replace("panel1/min_fs = 512", "panel1/min_fs = 500");
        assert!(parse_geom_str(&overlapping, "test.geom").is_err());
    }

    #[test]
    fn rejects_missing_required_key() {
        let broken = SAMPLE.replace("panel0/res = 10000", "");
        assert!(parse_geom_str(&broken, "test.geom").is_err());
    }
}
