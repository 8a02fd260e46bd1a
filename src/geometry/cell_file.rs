//! Cell file parsers: CrystFEL-style cell files and PDB `CRYST1` records.

use std::path::Path;

use regex::Regex;

use crate::error::{EngineError, Result};
use crate::geometry::cell::{CellParams, Centering, LatticeType, UnitCell};

/// A parsed cell file: the cell itself plus lattice metadata that has no
/// home in [`UnitCell`] but is carried through for indexing tolerances.
#[derive(Debug, Clone)]
pub struct CellFile {
    pub cell: UnitCell,
    pub lattice_type: Option<LatticeType>,
    pub centering: Option<Centering>,
    pub unique_axis: Option<char>,
}

/// Parse a cell file, auto-detecting CrystFEL vs. PDB format by extension
/// and, failing that, by content sniffing.
pub fn parse_cell_file(path: &Path) -> Result<CellFile> {
    let content = std::fs::read_to_string(path)?;
    let path_str = path.display().to_string();
    if content.lines().any(|l| l.starts_with("CRYST1")) {
        parse_pdb_cryst1(&content, &path_str)
    } else {
        parse_crystfel_cell(&content, &path_str)
    }
}

fn parse_crystfel_cell(content: &str, path: &str) -> Result<CellFile> {
    let kv_re = Regex::new(r"^\s*([A-Za-z_]+)\s*=\s*(\S+)").expect("static regex");

    let mut a = None;
    let mut b = None;
    let mut c = None;
    let mut al = None;
    let mut be = None;
    let mut ga = None;
    let mut lattice_type = None;
    let mut centering = None;
    let mut unique_axis = None;

    for line in content.lines() {
        let line = line.split(';').next().unwrap_or("").trim();
        let Some(caps) = kv_re.captures(line) else { continue };
        let key = caps.get(1).unwrap().as_str();
        let raw_value = caps.get(2).unwrap().as_str();
        let value = raw_value.split_whitespace().next().unwrap_or(raw_value);
        match key {
            "a" => a = Some(parse_length(value, path, key)?),
            "b" => b = Some(parse_length(value, path, key)?),
            "c" => c = Some(parse_length(value, path, key)?),
            "al" => al = Some(parse_angle(value, path, key)?),
            "be" => be = Some(parse_angle(value, path, key)?),
            "ga" => ga = Some(parse_angle(value, path, key)?),
            "lattice_type" => lattice_type = Some(parse_lattice_type(value, path)?),
            "centering" => centering = Some(parse_centering(value, path)?),
            "unique_axis" => unique_axis = value.chars().next(),
            _ => {}
        }
    }

    let missing = |field: &str| EngineError::MalformedInput {
        path: path.into(),
        reason: format!("missing required key '{field}'"),
    };
    let params = CellParams {
        a: a.ok_or_else(|| missing("a"))?,
        b: b.ok_or_else(|| missing("b"))?,
        c: c.ok_or_else(|| missing("c"))?,
        alpha: al.ok_or_else(|| missing("al"))?,
        beta: be.ok_or_else(|| missing("be"))?,
        gamma: ga.ok_or_else(|| missing("ga"))?,
    };

    Ok(CellFile {
        cell: UnitCell::from_params(params),
        lattice_type,
        centering,
        unique_axis,
    })
}

fn parse_pdb_cryst1(content: &str, path: &str) -> Result<CellFile> {
    let line = content
        .lines()
        .find(|l| l.starts_with("CRYST1"))
        .ok_or_else(|| EngineError::MalformedInput {
            path: path.into(),
            reason: "no CRYST1 record found".into(),
        })?;

    // Fixed-column PDB format: CRYST1 a(9) b(9) c(9) alpha(7) beta(7) gamma(7) space_group(11)
    let field = |start: usize, end: usize| -> Result<&str> {
        line.get(start..end.min(line.len())).ok_or_else(|| EngineError::MalformedInput {
            path: path.into(),
            reason: "CRYST1 record too short".into(),
        })
    };
    let parse_col = |start: usize, end: usize| -> Result<f64> {
        field(start, end)?.trim().parse().map_err(|_| EngineError::MalformedInput {
            path: path.into(),
            reason: format!("CRYST1 field [{start}..{end}) is not numeric"),
        })
    };

    // PDB lengths are in Angstroms; convert to metres.
    let a_ang = parse_col(6, 15)?;
    let b_ang = parse_col(15, 24)?;
    let c_ang = parse_col(24, 33)?;
    let alpha_deg = parse_col(33, 40)?;
    let beta_deg = parse_col(40, 47)?;
    let gamma_deg = parse_col(47, 54)?;

    let params = CellParams {
        a: a_ang * 1e-10,
        b: b_ang * 1e-10,
        c: c_ang * 1e-10,
        alpha: alpha_deg.to_radians(),
        beta: beta_deg.to_radians(),
        gamma: gamma_deg.to_radians(),
    };

    Ok(CellFile {
        cell: UnitCell::from_params(params),
        lattice_type: None,
        centering: None,
        unique_axis: None,
    })
}

fn parse_length(value: &str, path: &str, key: &str) -> Result<f64> {
    // CrystFEL cell files give a/b/c in Angstroms.
    let ang: f64 = value.parse().map_err(|_| EngineError::MalformedInput {
        path: path.into(),
        reason: format!("key '{key}': expected a length, got '{value}'"),
    })?;
    Ok(ang * 1e-10)
}

fn parse_angle(value: &str, path: &str, key: &str) -> Result<f64> {
    let deg: f64 = value.parse().map_err(|_| EngineError::MalformedInput {
        path: path.into(),
        reason: format!("key '{key}': expected an angle in degrees, got '{value}'"),
    })?;
    Ok(deg.to_radians())
}

fn parse_lattice_type(value: &str, path: &str) -> Result<LatticeType> {
    Ok(match value {
        "triclinic" => LatticeType::Triclinic,
        "monoclinic" => LatticeType::Monoclinic,
        "orthorhombic" => LatticeType::Orthorhombic,
        "tetragonal" => LatticeType::Tetragonal,
        "rhombohedral" => LatticeType::Rhombohedral,
        "hexagonal" => LatticeType::Hexagonal,
        "cubic" => LatticeType::Cubic,
        other => {
            return Err(EngineError::MalformedInput {
                path: path.into(),
                reason: format!("unknown lattice_type '{other}'"),
            })
        }
    })
}

fn parse_centering(value: &str, path: &str) -> Result<Centering> {
    Ok(match value {
        "P" => Centering::Primitive,
        "A" => Centering::ACentered,
        "B" => Centering::BCentered,
        "C" => Centering::CCentered,
        "I" => Centering::BodyCentered,
        "F" => Centering::FaceCentered,
        "R" => Centering::Rhombohedral,
        other => {
            return Err(EngineError::MalformedInput {
                path: path.into(),
                reason: format!("unknown centering '{other}'"),
            })
        }
    })
}
