//! SMILES reader.
//!
//! Covers the organic subset, bracket atoms (isotope, charge, explicit
//! hydrogens), aromatic lowercase atoms, branches, ring closures (digits and
//! `%nn`), and dot-separated fragments. Stereo markers (`/`, `\`, `@`) and
//! atom maps are accepted and discarded; this engine does not model
//! stereochemistry.

use std::collections::HashMap;

use super::error::ChemError;
use super::graph::{Atom, BondOrder, MolGraph};

const ORGANIC_SUBSET: &[&str] = &["B", "C", "N", "O", "P", "S", "F", "Cl", "Br", "I"];
const AROMATIC_SUBSET: &[&str] = &["b", "c", "n", "o", "p", "s"];

pub fn parse(text: &str) -> Result<MolGraph, ChemError> {
    let trimmed = text.trim();
    let mut parser = Parser {
        chars: trimmed.as_bytes(),
        pos: 0,
        graph: MolGraph::new(),
        prev_atom: None,
        pending_bond: None,
        branch_stack: Vec::new(),
        ring_bonds: HashMap::new(),
    };
    parser.run()?;
    if !parser.ring_bonds.is_empty() {
        let mut open: Vec<u32> = parser.ring_bonds.keys().copied().collect();
        open.sort_unstable();
        return Err(ChemError::parse(format!(
            "unclosed ring bond(s): {open:?}"
        )));
    }
    if !parser.branch_stack.is_empty() {
        return Err(ChemError::parse("unbalanced '(' in SMILES"));
    }
    Ok(parser.graph)
}

struct Parser<'a> {
    chars: &'a [u8],
    pos: usize,
    graph: MolGraph,
    prev_atom: Option<usize>,
    pending_bond: Option<BondOrder>,
    branch_stack: Vec<Option<usize>>,
    /// Open ring closures: number -> (atom, bond written at the opening).
    ring_bonds: HashMap<u32, (usize, Option<BondOrder>)>,
}

impl<'a> Parser<'a> {
    fn run(&mut self) -> Result<(), ChemError> {
        while let Some(&c) = self.chars.get(self.pos) {
            match c {
                b'(' => {
                    self.branch_stack.push(self.prev_atom);
                    self.pos += 1;
                }
                b')' => {
                    let anchor = self
                        .branch_stack
                        .pop()
                        .ok_or_else(|| ChemError::parse("unbalanced ')' in SMILES"))?;
                    self.prev_atom = anchor;
                    self.pending_bond = None;
                    self.pos += 1;
                }
                b'-' => {
                    self.pending_bond = Some(BondOrder::Single);
                    self.pos += 1;
                }
                b'=' => {
                    self.pending_bond = Some(BondOrder::Double);
                    self.pos += 1;
                }
                b'#' => {
                    self.pending_bond = Some(BondOrder::Triple);
                    self.pos += 1;
                }
                b':' => {
                    self.pending_bond = Some(BondOrder::Aromatic);
                    self.pos += 1;
                }
                // Directional bonds degrade to single bonds.
                b'/' | b'\\' => {
                    self.pending_bond = Some(BondOrder::Single);
                    self.pos += 1;
                }
                b'.' => {
                    if self.pending_bond.is_some() {
                        return Err(ChemError::parse("bond symbol before '.'"));
                    }
                    self.prev_atom = None;
                    self.pos += 1;
                }
                b'0'..=b'9' => {
                    let number = (c - b'0') as u32;
                    self.pos += 1;
                    self.ring_closure(number)?;
                }
                b'%' => {
                    self.pos += 1;
                    let number = self.two_digit_ring_number()?;
                    self.ring_closure(number)?;
                }
                b'[' => {
                    self.pos += 1;
                    let atom = self.bracket_atom()?;
                    self.attach(atom)?;
                }
                _ => {
                    let atom = self.organic_atom()?;
                    self.attach(atom)?;
                }
            }
        }
        Ok(())
    }

    fn two_digit_ring_number(&mut self) -> Result<u32, ChemError> {
        let d1 = self.digit()?;
        let d2 = self.digit()?;
        Ok(d1 * 10 + d2)
    }

    fn digit(&mut self) -> Result<u32, ChemError> {
        match self.chars.get(self.pos) {
            Some(c @ b'0'..=b'9') => {
                self.pos += 1;
                Ok((*c - b'0') as u32)
            }
            _ => Err(ChemError::parse("expected digit after '%'")),
        }
    }

    fn ring_closure(&mut self, number: u32) -> Result<(), ChemError> {
        let here = self
            .prev_atom
            .ok_or_else(|| ChemError::parse("ring closure before any atom"))?;
        let bond_hint = self.pending_bond.take();
        match self.ring_bonds.remove(&number) {
            Some((there, open_hint)) => {
                if here == there {
                    return Err(ChemError::parse(format!(
                        "ring bond {number} closes on its own atom"
                    )));
                }
                let order = match (open_hint, bond_hint) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(ChemError::parse(format!(
                            "conflicting orders for ring bond {number}"
                        )))
                    }
                    (Some(a), _) => a,
                    (None, Some(b)) => b,
                    (None, None) => self.default_order(there, here),
                };
                self.graph.add_bond(there, here, order);
            }
            None => {
                self.ring_bonds.insert(number, (here, bond_hint));
            }
        }
        Ok(())
    }

    fn default_order(&self, a: usize, b: usize) -> BondOrder {
        if self.graph.atoms[a].aromatic && self.graph.atoms[b].aromatic {
            BondOrder::Aromatic
        } else {
            BondOrder::Single
        }
    }

    fn attach(&mut self, atom: Atom) -> Result<(), ChemError> {
        let idx = self.graph.add_atom(atom);
        if let Some(prev) = self.prev_atom {
            let order = self
                .pending_bond
                .take()
                .unwrap_or_else(|| self.default_order(prev, idx));
            self.graph.add_bond(prev, idx, order);
        } else if self.pending_bond.is_some() {
            return Err(ChemError::parse("bond symbol with no preceding atom"));
        }
        self.prev_atom = Some(idx);
        Ok(())
    }

    fn organic_atom(&mut self) -> Result<Atom, ChemError> {
        let rest = &self.chars[self.pos..];
        // Two-letter symbols first.
        for sym in ["Cl", "Br"] {
            if rest.starts_with(sym.as_bytes()) {
                self.pos += 2;
                return Ok(Atom::new(sym, false));
            }
        }
        let c = rest[0] as char;
        let sym = c.to_string();
        if ORGANIC_SUBSET.contains(&sym.as_str()) {
            self.pos += 1;
            return Ok(Atom::new(sym, false));
        }
        if AROMATIC_SUBSET.contains(&sym.as_str()) {
            self.pos += 1;
            return Ok(Atom::new(sym.to_uppercase(), true));
        }
        Err(ChemError::parse(format!(
            "unexpected character '{c}' at position {}",
            self.pos
        )))
    }

    fn bracket_atom(&mut self) -> Result<Atom, ChemError> {
        let mut isotope: u16 = 0;
        while let Some(c @ b'0'..=b'9') = self.chars.get(self.pos) {
            isotope = isotope
                .saturating_mul(10)
                .saturating_add((*c - b'0') as u16);
            self.pos += 1;
        }

        let (symbol, aromatic) = self.bracket_symbol()?;

        // Chirality markers are parsed and dropped.
        while self.chars.get(self.pos) == Some(&b'@') {
            self.pos += 1;
        }

        let mut explicit_h: u8 = 0;
        if self.chars.get(self.pos) == Some(&b'H') {
            self.pos += 1;
            explicit_h = 1;
            if let Some(c @ b'0'..=b'9') = self.chars.get(self.pos) {
                explicit_h = *c - b'0';
                self.pos += 1;
            }
        }

        let mut charge: i8 = 0;
        while let Some(&c) = self.chars.get(self.pos) {
            let sign: i8 = match c {
                b'+' => 1,
                b'-' => -1,
                _ => break,
            };
            self.pos += 1;
            if let Some(d @ b'1'..=b'9') = self.chars.get(self.pos) {
                charge = sign * (*d - b'0') as i8;
                self.pos += 1;
            } else {
                charge += sign;
            }
        }

        // Atom map labels are parsed and dropped.
        if self.chars.get(self.pos) == Some(&b':') {
            self.pos += 1;
            let mut saw_digit = false;
            while let Some(b'0'..=b'9') = self.chars.get(self.pos) {
                self.pos += 1;
                saw_digit = true;
            }
            if !saw_digit {
                return Err(ChemError::parse("':' in bracket atom without map number"));
            }
        }

        if self.chars.get(self.pos) != Some(&b']') {
            return Err(ChemError::parse("unterminated bracket atom"));
        }
        self.pos += 1;

        let mut atom = Atom::new(symbol, aromatic);
        atom.isotope = isotope;
        atom.charge = charge;
        atom.explicit_h = Some(explicit_h);
        Ok(atom)
    }

    fn bracket_symbol(&mut self) -> Result<(String, bool), ChemError> {
        let rest = &self.chars[self.pos..];
        let first = *rest
            .first()
            .ok_or_else(|| ChemError::parse("unterminated bracket atom"))?
            as char;
        if first.is_ascii_uppercase() {
            let mut sym = first.to_string();
            self.pos += 1;
            if let Some(&c) = self.chars.get(self.pos) {
                if (c as char).is_ascii_lowercase() && c != b'h' {
                    // Two-letter element, e.g. [Na], [Cl-].
                    sym.push(c as char);
                    self.pos += 1;
                }
            }
            Ok((sym, false))
        } else if first.is_ascii_lowercase() {
            let sym = first.to_string();
            if AROMATIC_SUBSET.contains(&sym.as_str()) {
                self.pos += 1;
                Ok((sym.to_uppercase(), true))
            } else {
                Err(ChemError::parse(format!(
                    "unknown aromatic symbol '{first}'"
                )))
            }
        } else if first == '*' {
            self.pos += 1;
            Ok(("*".to_string(), false))
        } else {
            Err(ChemError::parse(format!(
                "unexpected '{first}' in bracket atom"
            )))
        }
    }
}
