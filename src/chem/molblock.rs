//! V2000 molblock reader.
//!
//! Reads the connection table that heads every SD record: three header
//! lines, a counts line, the atom and bond blocks, and property lines up to
//! `M  END`. Coordinates are parsed and discarded; only connectivity,
//! element, charge, and isotope survive into the graph.

use super::error::ChemError;
use super::graph::{Atom, BondOrder, MolGraph};

pub fn parse(text: &str) -> Result<MolGraph, ChemError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 4 {
        return Err(ChemError::parse("molblock shorter than header + counts"));
    }

    let counts = lines[3];
    let (atom_count, bond_count) = parse_counts(counts)?;

    let atoms_end = 4 + atom_count;
    let bonds_end = atoms_end + bond_count;
    if lines.len() < bonds_end {
        return Err(ChemError::parse(format!(
            "molblock truncated: counts promise {atom_count} atoms / {bond_count} bonds"
        )));
    }

    let mut graph = MolGraph::new();
    for line in &lines[4..atoms_end] {
        graph.add_atom(parse_atom_line(line)?);
    }
    for line in &lines[atoms_end..bonds_end] {
        let (a, b, order) = parse_bond_line(line, atom_count)?;
        if graph.bond_between(a, b).is_some() {
            return Err(ChemError::parse(format!(
                "duplicate bond between atoms {} and {}",
                a + 1,
                b + 1
            )));
        }
        graph.add_bond(a, b, order);
        if order == BondOrder::Aromatic {
            graph.atoms[a].aromatic = true;
            graph.atoms[b].aromatic = true;
        }
    }

    for line in &lines[bonds_end..] {
        let trimmed = line.trim_end();
        if trimmed.starts_with("M  END") {
            break;
        }
        if let Some(rest) = trimmed.strip_prefix("M  CHG") {
            apply_charge_property(&mut graph, rest)?;
        } else if let Some(rest) = trimmed.strip_prefix("M  ISO") {
            apply_isotope_property(&mut graph, rest)?;
        }
        // Other property lines (M  RAD, A, V, ...) are skipped.
    }

    Ok(graph)
}

fn parse_counts(line: &str) -> Result<(usize, usize), ChemError> {
    // The counts line is fixed-width (3 columns per field) but files in the
    // wild drift, so fall back to whitespace splitting when the fixed
    // columns do not parse.
    let fixed = |range: std::ops::Range<usize>| -> Option<usize> {
        line.get(range)?.trim().parse().ok()
    };
    if let (Some(a), Some(b)) = (fixed(0..3), fixed(3..6)) {
        return Ok((a, b));
    }
    let mut parts = line.split_whitespace();
    let a = parts
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ChemError::parse("unreadable counts line"))?;
    let b = parts
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ChemError::parse("unreadable counts line"))?;
    Ok((a, b))
}

fn parse_atom_line(line: &str) -> Result<Atom, ChemError> {
    let mut parts = line.split_whitespace();
    let _x = parts.next();
    let _y = parts.next();
    let symbol = match (parts.next(), parts.next()) {
        (Some(_z), Some(sym)) => sym,
        _ => return Err(ChemError::parse(format!("unreadable atom line: {line:?}"))),
    };
    let mut atom = Atom::new(symbol, false);
    let _mass_diff = parts.next();
    if let Some(charge_code) = parts.next().and_then(|t| t.parse::<u8>().ok()) {
        atom.charge = legacy_charge(charge_code);
    }
    Ok(atom)
}

/// The atom-block charge column uses the legacy code table, not a signed
/// value.
fn legacy_charge(code: u8) -> i8 {
    match code {
        1 => 3,
        2 => 2,
        3 => 1,
        5 => -1,
        6 => -2,
        7 => -3,
        _ => 0,
    }
}

fn parse_bond_line(line: &str, atom_count: usize) -> Result<(usize, usize, BondOrder), ChemError> {
    // Fixed 3-column fields; tolerate whitespace-separated variants.
    let fixed_prefix = line
        .get(..9)
        .filter(|p| p.chars().all(|c| c.is_ascii_digit() || c == ' '));
    let nums: Vec<usize> = match fixed_prefix {
        Some(_) => [0..3, 3..6, 6..9]
            .into_iter()
            .filter_map(|r| line.get(r).and_then(|t| t.trim().parse().ok()))
            .collect(),
        None => line
            .split_whitespace()
            .take(3)
            .filter_map(|t| t.parse().ok())
            .collect(),
    };
    if nums.len() < 3 {
        return Err(ChemError::parse(format!("unreadable bond line: {line:?}")));
    }
    let (a, b) = (nums[0], nums[1]);
    if a == 0 || b == 0 || a > atom_count || b > atom_count || a == b {
        return Err(ChemError::parse(format!(
            "bond references invalid atom numbers: {line:?}"
        )));
    }
    let order = match nums[2] {
        1 => BondOrder::Single,
        2 => BondOrder::Double,
        3 => BondOrder::Triple,
        4 => BondOrder::Aromatic,
        other => {
            return Err(ChemError::parse(format!(
                "unsupported bond type {other}"
            )))
        }
    };
    Ok((a - 1, b - 1, order))
}

/// `M  CHG nn8 aaa vvv ...` pairs override every legacy atom-block charge.
fn apply_charge_property(graph: &mut MolGraph, rest: &str) -> Result<(), ChemError> {
    let values = property_pairs(rest)?;
    if !values.is_empty() {
        for atom in &mut graph.atoms {
            atom.charge = 0;
        }
    }
    for (atom_no, value) in values {
        let idx = atom_no
            .checked_sub(1)
            .filter(|&i| i < graph.atoms.len())
            .ok_or_else(|| ChemError::parse("M  CHG references missing atom"))?;
        graph.atoms[idx].charge = value as i8;
    }
    Ok(())
}

fn apply_isotope_property(graph: &mut MolGraph, rest: &str) -> Result<(), ChemError> {
    for (atom_no, value) in property_pairs(rest)? {
        let idx = atom_no
            .checked_sub(1)
            .filter(|&i| i < graph.atoms.len())
            .ok_or_else(|| ChemError::parse("M  ISO references missing atom"))?;
        graph.atoms[idx].isotope = value.max(0) as u16;
    }
    Ok(())
}

fn property_pairs(rest: &str) -> Result<Vec<(usize, i32)>, ChemError> {
    let mut tokens = rest.split_whitespace();
    let declared: usize = tokens
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ChemError::parse("property line missing count"))?;
    let mut out = Vec::with_capacity(declared);
    for _ in 0..declared {
        let atom_no = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ChemError::parse("property line truncated"))?;
        let value = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ChemError::parse("property line truncated"))?;
        out.push((atom_no, value));
    }
    Ok(out)
}
