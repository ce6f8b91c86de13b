//! Molecular graph representation shared by every toolkit routine.
//!
//! A [`MolGraph`] is a plain atoms-and-bonds adjacency structure. It carries
//! no coordinates; the engine only reasons about connectivity, element
//! identity, charge, and aromaticity. Ring and aromaticity perception is
//! deferred to [`MolGraph::perceive_rings`], which every matching and
//! ring-sensitive fingerprint path requires to have run first.

use serde::{Deserialize, Serialize};

/// Bond order, with aromatic as its own class rather than an order of 1.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondOrder {
    Single,
    Double,
    Triple,
    Aromatic,
}

impl BondOrder {
    /// Twice the conventional bond order; aromatic counts as 1.5.
    pub fn order_x2(self) -> u32 {
        match self {
            BondOrder::Single => 2,
            BondOrder::Double => 4,
            BondOrder::Triple => 6,
            BondOrder::Aromatic => 3,
        }
    }

    /// Stable numeric code used in fingerprint path encodings.
    pub fn code(self) -> u64 {
        match self {
            BondOrder::Single => 1,
            BondOrder::Double => 2,
            BondOrder::Triple => 3,
            BondOrder::Aromatic => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    /// Element symbol with conventional capitalization ("C", "Cl", "Na").
    pub symbol: String,
    pub aromatic: bool,
    pub charge: i8,
    /// Isotope mass number; 0 means unspecified.
    pub isotope: u16,
    /// Hydrogen count written explicitly in a bracket atom. `None` means the
    /// count is implied by valence rules.
    pub explicit_h: Option<u8>,
    /// Filled by ring perception.
    pub in_ring: bool,
}

impl Atom {
    pub fn new(symbol: impl Into<String>, aromatic: bool) -> Self {
        Atom {
            symbol: symbol.into(),
            aromatic,
            charge: 0,
            isotope: 0,
            explicit_h: None,
            in_ring: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bond {
    pub a: usize,
    pub b: usize,
    pub order: BondOrder,
    /// Filled by ring perception.
    pub in_ring: bool,
}

impl Bond {
    /// The endpoint that is not `atom`.
    pub fn other(&self, atom: usize) -> usize {
        if self.a == atom {
            self.b
        } else {
            self.a
        }
    }
}

/// Connectivity graph of one molecule (possibly several disconnected
/// fragments).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MolGraph {
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
    /// Sizes of the perceived fundamental rings, sorted ascending.
    pub ring_sizes: Vec<u32>,
    pub rings_perceived: bool,
    /// Neighbor lists as `(neighbor_atom, bond_index)`, kept in sync by
    /// [`MolGraph::add_bond`]. Rebuilt after deserialization.
    #[serde(skip)]
    adjacency: Vec<Vec<(usize, usize)>>,
}

impl MolGraph {
    pub fn new() -> Self {
        MolGraph::default()
    }

    pub fn add_atom(&mut self, atom: Atom) -> usize {
        self.atoms.push(atom);
        self.adjacency.push(Vec::new());
        self.atoms.len() - 1
    }

    pub fn add_bond(&mut self, a: usize, b: usize, order: BondOrder) -> usize {
        let idx = self.bonds.len();
        self.bonds.push(Bond {
            a,
            b,
            order,
            in_ring: false,
        });
        self.adjacency[a].push((b, idx));
        self.adjacency[b].push((a, idx));
        idx
    }

    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    pub fn neighbors(&self, atom: usize) -> &[(usize, usize)] {
        &self.adjacency[atom]
    }

    pub fn degree(&self, atom: usize) -> usize {
        self.adjacency[atom].len()
    }

    pub fn bond_between(&self, a: usize, b: usize) -> Option<&Bond> {
        self.adjacency[a]
            .iter()
            .find(|(n, _)| *n == b)
            .map(|&(_, bi)| &self.bonds[bi])
    }

    /// Restore the neighbor lists after serde deserialization, which skips
    /// them.
    pub fn rebuild_adjacency(&mut self) {
        self.adjacency = vec![Vec::new(); self.atoms.len()];
        for (idx, bond) in self.bonds.iter().enumerate() {
            self.adjacency[bond.a].push((bond.b, idx));
            self.adjacency[bond.b].push((bond.a, idx));
        }
    }

    /// Sum of bond orders at `atom`, doubled so aromatic bonds stay integral.
    pub fn bond_order_sum_x2(&self, atom: usize) -> u32 {
        self.adjacency[atom]
            .iter()
            .map(|&(_, bi)| self.bonds[bi].order.order_x2())
            .sum()
    }

    /// Hydrogen count of `atom`: the explicit bracket count when present,
    /// otherwise the count implied by the smallest standard valence that
    /// accommodates the bonded electrons.
    pub fn hydrogen_count(&self, atom: usize) -> u8 {
        if let Some(h) = self.atoms[atom].explicit_h {
            return h;
        }
        self.implicit_hydrogens(atom)
    }

    /// Valence-implied hydrogen count, ignoring any explicit bracket count.
    pub fn implicit_hydrogens(&self, atom: usize) -> u8 {
        let a = &self.atoms[atom];
        let bonded = (self.bond_order_sum_x2(atom) + 1) / 2;
        for valence in default_valences(&a.symbol) {
            let adjusted = adjust_valence_for_charge(*valence, &a.symbol, a.charge);
            if adjusted >= bonded {
                return (adjusted - bonded) as u8;
            }
        }
        0
    }

    /// Ring and aromaticity perception.
    ///
    /// A bond is a ring bond when a path between its endpoints survives the
    /// bond's removal; the size recorded for it is the smallest cycle through
    /// it. Both are graph invariants, so the same molecule produces the same
    /// ring data no matter how its atoms were numbered on input. Alternating
    /// six-membered carbocycles are normalized to the aromatic form so Kekulé
    /// and aromatic inputs index identically.
    pub fn perceive_rings(&mut self) {
        for atom in &mut self.atoms {
            atom.in_ring = false;
        }
        for bond in &mut self.bonds {
            bond.in_ring = false;
        }
        self.ring_sizes.clear();

        let mut smallest_cycles: Vec<Vec<usize>> = Vec::new();
        for bi in 0..self.bonds.len() {
            if let Some(path_bonds) = self.shortest_detour(bi) {
                let mut cycle = path_bonds;
                cycle.push(bi);
                self.ring_sizes.push(cycle.len() as u32);
                for &cb in &cycle {
                    self.bonds[cb].in_ring = true;
                    self.atoms[self.bonds[cb].a].in_ring = true;
                    self.atoms[self.bonds[cb].b].in_ring = true;
                }
                smallest_cycles.push(cycle);
            }
        }
        self.ring_sizes.sort_unstable();
        self.ring_sizes.dedup();

        for cycle in smallest_cycles {
            self.aromatize_if_alternating(&cycle);
        }
        self.rings_perceived = true;
    }

    /// Shortest path between the endpoints of bond `bi` that avoids the bond
    /// itself, as bond indices. `None` when the bond is a bridge.
    fn shortest_detour(&self, bi: usize) -> Option<Vec<usize>> {
        let (from, to) = (self.bonds[bi].a, self.bonds[bi].b);
        let n = self.atoms.len();
        let mut prev: Vec<Option<(usize, usize)>> = vec![None; n];
        let mut seen = vec![false; n];
        let mut queue = std::collections::VecDeque::new();
        seen[from] = true;
        queue.push_back(from);
        while let Some(atom) = queue.pop_front() {
            if atom == to {
                break;
            }
            for &(nbr, nbi) in &self.adjacency[atom] {
                if nbi == bi || seen[nbr] {
                    continue;
                }
                seen[nbr] = true;
                prev[nbr] = Some((atom, nbi));
                queue.push_back(nbr);
            }
        }
        if !seen[to] {
            return None;
        }
        let mut path = Vec::new();
        let mut cursor = to;
        while cursor != from {
            let (p, pbi) = prev[cursor]?;
            path.push(pbi);
            cursor = p;
        }
        Some(path)
    }

    /// Flip a Kekulé six-ring of carbons (alternating single/double bonds)
    /// to the aromatic form.
    fn aromatize_if_alternating(&mut self, cycle_bonds: &[usize]) {
        if cycle_bonds.len() != 6 {
            return;
        }
        let mut singles = 0usize;
        let mut doubles = 0usize;
        for &bi in cycle_bonds {
            let bond = &self.bonds[bi];
            if self.atoms[bond.a].symbol != "C" || self.atoms[bond.b].symbol != "C" {
                return;
            }
            match bond.order {
                BondOrder::Single => singles += 1,
                BondOrder::Double => doubles += 1,
                BondOrder::Aromatic => return,
                BondOrder::Triple => return,
            }
        }
        if singles != 3 || doubles != 3 {
            return;
        }
        // Alternation check: every ring atom must carry exactly one double
        // bond within the cycle.
        let mut double_count = std::collections::HashMap::new();
        for &bi in cycle_bonds {
            if self.bonds[bi].order == BondOrder::Double {
                *double_count.entry(self.bonds[bi].a).or_insert(0u32) += 1;
                *double_count.entry(self.bonds[bi].b).or_insert(0u32) += 1;
            }
        }
        if double_count.len() != 6 || double_count.values().any(|&c| c != 1) {
            return;
        }
        for &bi in cycle_bonds {
            self.bonds[bi].order = BondOrder::Aromatic;
            self.atoms[self.bonds[bi].a].aromatic = true;
            self.atoms[self.bonds[bi].b].aromatic = true;
        }
    }

    /// Connected components as atom index lists.
    pub fn components(&self) -> Vec<Vec<usize>> {
        let n = self.atoms.len();
        let mut seen = vec![false; n];
        let mut out = Vec::new();
        for root in 0..n {
            if seen[root] {
                continue;
            }
            let mut comp = Vec::new();
            let mut stack = vec![root];
            seen[root] = true;
            while let Some(a) = stack.pop() {
                comp.push(a);
                for &(nbr, _) in &self.adjacency[a] {
                    if !seen[nbr] {
                        seen[nbr] = true;
                        stack.push(nbr);
                    }
                }
            }
            comp.sort_unstable();
            out.push(comp);
        }
        out
    }
}

/// Standard valences per element, smallest first. Elements outside the table
/// get a permissive fallback so exotic atoms never fail hydrogen counting.
pub(crate) fn default_valences(symbol: &str) -> &'static [u32] {
    match symbol {
        "B" => &[3],
        "C" => &[4],
        "N" => &[3, 5],
        "O" => &[2],
        "P" => &[3, 5],
        "S" => &[2, 4, 6],
        "F" | "Cl" | "Br" | "I" => &[1],
        "H" => &[1],
        _ => &[0],
    }
}

fn adjust_valence_for_charge(valence: u32, symbol: &str, charge: i8) -> u32 {
    if charge == 0 || valence == 0 {
        return valence;
    }
    if charge > 0 {
        // Cations of N/P/O/S gain a bond (ammonium, oxonium); everything
        // else keeps its base valence.
        match symbol {
            "N" | "P" | "O" | "S" => valence + charge as u32,
            _ => valence,
        }
    } else {
        valence.saturating_sub(charge.unsigned_abs() as u32)
    }
}
