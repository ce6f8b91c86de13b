//! Canonical atom ranking and canonical SMILES output.
//!
//! Ranking is iterative neighborhood refinement over an initial invariant of
//! (element, aromaticity, charge, isotope, degree, hydrogen count), with
//! deterministic tie-breaking. Equality of the emitted string is the "same
//! molecule" relation the exact-match index relies on, and the writer is
//! idempotent on its own output: parsing canonical SMILES and re-emitting
//! yields the identical string.

use super::graph::{BondOrder, MolGraph};

const ORGANIC_SUBSET: &[&str] = &["B", "C", "N", "O", "P", "S", "F", "Cl", "Br", "I"];
const AROMATIC_SUBSET: &[&str] = &["B", "C", "N", "O", "P", "S"];

/// Dense canonical ranks, one per atom; rank 0 is the canonical root class.
pub fn canonical_ranks(g: &MolGraph) -> Vec<u32> {
    let n = g.atom_count();
    if n == 0 {
        return Vec::new();
    }

    // Initial invariant.
    let mut keyed: Vec<(InitialKey, usize)> = (0..n)
        .map(|i| {
            let a = &g.atoms[i];
            (
                (
                    a.symbol.clone(),
                    a.aromatic,
                    a.charge,
                    a.isotope,
                    g.degree(i),
                    g.hydrogen_count(i),
                ),
                i,
            )
        })
        .collect();
    keyed.sort();
    let mut ranks = dense_ranks(&keyed);

    loop {
        ranks = refine(g, ranks);
        let classes = class_count(&ranks);
        if classes == n as u32 {
            break;
        }
        // Tie-break: single out the lowest-index atom of the first
        // non-singleton class, then re-refine.
        let Some(chosen) = first_tied_atom(&ranks) else {
            break;
        };
        let mut keyed: Vec<((u32, u32), usize)> = (0..n)
            .map(|i| ((ranks[i] * 2 + u32::from(i != chosen), 0), i))
            .collect();
        keyed.sort();
        let split = dense_ranks(&keyed);
        if class_count(&split) == classes {
            break;
        }
        ranks = split;
    }
    ranks
}

type InitialKey = (String, bool, i8, u16, usize, u8);

fn dense_ranks<K: Ord>(sorted: &[(K, usize)]) -> Vec<u32> {
    let mut ranks = vec![0u32; sorted.len()];
    let mut rank = 0u32;
    for (pos, (key, atom)) in sorted.iter().enumerate() {
        if pos > 0 && sorted[pos - 1].0 != *key {
            rank += 1;
        }
        ranks[*atom] = rank;
    }
    ranks
}

fn class_count(ranks: &[u32]) -> u32 {
    ranks.iter().copied().max().map_or(0, |m| m + 1)
}

fn first_tied_atom(ranks: &[u32]) -> Option<usize> {
    let mut counts = std::collections::BTreeMap::new();
    for &r in ranks {
        *counts.entry(r).or_insert(0u32) += 1;
    }
    let tied_rank = counts.into_iter().find(|&(_, c)| c > 1)?.0;
    ranks.iter().position(|&r| r == tied_rank)
}

/// One refinement sweep: extend every rank with the sorted multiset of
/// (bond class, neighbor rank) pairs, then re-densify. Repeats internally
/// until the partition stops splitting.
fn refine(g: &MolGraph, mut ranks: Vec<u32>) -> Vec<u32> {
    loop {
        let before = class_count(&ranks);
        let mut keyed: Vec<((u32, Vec<(u64, u32)>), usize)> = (0..g.atom_count())
            .map(|i| {
                let mut nbrs: Vec<(u64, u32)> = g
                    .neighbors(i)
                    .iter()
                    .map(|&(nbr, bi)| (g.bonds[bi].order.code(), ranks[nbr]))
                    .collect();
                nbrs.sort_unstable();
                ((ranks[i], nbrs), i)
            })
            .collect();
        keyed.sort();
        ranks = dense_ranks(&keyed);
        if class_count(&ranks) == before {
            return ranks;
        }
    }
}

/// Canonical SMILES for the whole graph (fragments joined with `.`).
pub fn canonical_smiles(g: &MolGraph) -> String {
    if g.atom_count() == 0 {
        return String::new();
    }
    let ranks = canonical_ranks(g);
    let mut components = g.components();
    components.sort_by_key(|comp| comp.iter().map(|&a| ranks[a]).min());

    let mut writer = Writer {
        graph: g,
        ranks: &ranks,
        visited: vec![false; g.atom_count()],
        preorder: vec![usize::MAX; g.atom_count()],
        next_preorder: 0,
        tree_child: vec![Vec::new(); g.atom_count()],
        closures_at: vec![Vec::new(); g.atom_count()],
        closure_bonds: Vec::new(),
        ring_numbers: std::collections::HashMap::new(),
        next_ring_number: 1,
        out: String::new(),
    };

    let mut first = true;
    for comp in components {
        let root = comp
            .iter()
            .copied()
            .min_by_key(|&a| ranks[a])
            .unwrap_or(comp[0]);
        if !first {
            writer.out.push('.');
        }
        first = false;
        writer.discover(root);
        writer.sort_closures();
        writer.emit_atom(root);
    }
    writer.out
}

struct Writer<'a> {
    graph: &'a MolGraph,
    ranks: &'a [u32],
    visited: Vec<bool>,
    preorder: Vec<usize>,
    next_preorder: usize,
    tree_child: Vec<Vec<(usize, usize)>>,
    closures_at: Vec<Vec<usize>>,
    closure_bonds: Vec<usize>,
    ring_numbers: std::collections::HashMap<usize, u32>,
    next_ring_number: u32,
    out: String,
}

impl<'a> Writer<'a> {
    /// First pass: fix the DFS tree and identify ring-closure bonds.
    fn discover(&mut self, atom: usize) {
        self.visited[atom] = true;
        self.preorder[atom] = self.next_preorder;
        self.next_preorder += 1;
        let mut nbrs: Vec<(usize, usize)> = self.graph.neighbors(atom).to_vec();
        nbrs.sort_by_key(|&(n, _)| (self.ranks[n], n));
        for (nbr, bi) in nbrs {
            if !self.visited[nbr] {
                self.tree_child[atom].push((nbr, bi));
                self.discover(nbr);
            } else if !self.is_tree_bond(bi) && !self.closure_bonds.contains(&bi) {
                self.closure_bonds.push(bi);
                self.closures_at[self.graph.bonds[bi].a].push(bi);
                self.closures_at[self.graph.bonds[bi].b].push(bi);
            }
        }
    }

    fn is_tree_bond(&self, bond: usize) -> bool {
        let b = &self.graph.bonds[bond];
        self.tree_child[b.a].iter().any(|&(_, bi)| bi == bond)
            || self.tree_child[b.b].iter().any(|&(_, bi)| bi == bond)
    }

    /// Ring closures at each atom are emitted in the DFS order of the far
    /// endpoint, which is fully determined by the canonical ranks.
    fn sort_closures(&mut self) {
        let graph = self.graph;
        let preorder = self.preorder.clone();
        for (atom, list) in self.closures_at.iter_mut().enumerate() {
            list.sort_by_key(|&bi| preorder[graph.bonds[bi].other(atom)]);
        }
    }

    /// Second pass: emit the atom token, its ring-closure digits, then its
    /// branches. The bond symbol leading into an atom is pushed by its
    /// parent, just before the recursive call.
    fn emit_atom(&mut self, atom: usize) {
        self.out.push_str(&atom_token(self.graph, atom));

        let closures = self.closures_at[atom].clone();
        for bi in closures {
            let bond = &self.graph.bonds[bi];
            let partner = bond.other(atom);
            match self.ring_numbers.get(&bi).copied() {
                None => {
                    let number = self.next_ring_number;
                    self.next_ring_number += 1;
                    self.ring_numbers.insert(bi, number);
                    let both_aromatic =
                        self.graph.atoms[atom].aromatic && self.graph.atoms[partner].aromatic;
                    self.push_bond_symbol(both_aromatic, bond.order);
                    self.push_ring_number(number);
                }
                Some(number) => {
                    self.push_ring_number(number);
                }
            }
        }

        let children = self.tree_child[atom].clone();
        for (pos, (child, bi)) in children.iter().enumerate() {
            let order = self.graph.bonds[*bi].order;
            let both_aromatic =
                self.graph.atoms[atom].aromatic && self.graph.atoms[*child].aromatic;
            let last = pos + 1 == children.len();
            if !last {
                self.out.push('(');
            }
            self.push_bond_symbol(both_aromatic, order);
            self.emit_atom(*child);
            if !last {
                self.out.push(')');
            }
        }
    }

    fn push_bond_symbol(&mut self, both_aromatic: bool, order: BondOrder) {
        match order {
            BondOrder::Single => {
                if both_aromatic {
                    self.out.push('-');
                }
            }
            BondOrder::Double => self.out.push('='),
            BondOrder::Triple => self.out.push('#'),
            BondOrder::Aromatic => {
                if !both_aromatic {
                    self.out.push(':');
                }
            }
        }
    }

    fn push_ring_number(&mut self, number: u32) {
        if number < 10 {
            self.out.push(char::from(b'0' + number as u8));
        } else {
            self.out.push('%');
            self.out.push_str(&format!("{number:02}"));
        }
    }
}

fn atom_token(g: &MolGraph, idx: usize) -> String {
    let a = &g.atoms[idx];
    let subset = if a.aromatic {
        AROMATIC_SUBSET.contains(&a.symbol.as_str())
    } else {
        ORGANIC_SUBSET.contains(&a.symbol.as_str())
    };
    let total_h = g.hydrogen_count(idx);
    let implied_h = g.implicit_hydrogens(idx);
    let needs_bracket =
        a.isotope != 0 || a.charge != 0 || !subset || total_h != implied_h;

    let mut sym = a.symbol.clone();
    if a.aromatic {
        sym = sym.to_lowercase();
    }
    if !needs_bracket {
        return sym;
    }

    let mut token = String::from("[");
    if a.isotope != 0 {
        token.push_str(&a.isotope.to_string());
    }
    token.push_str(&sym);
    match total_h {
        0 => {}
        1 => token.push('H'),
        n => {
            token.push('H');
            token.push_str(&n.to_string());
        }
    }
    match a.charge {
        0 => {}
        1 => token.push('+'),
        -1 => token.push('-'),
        c if c > 1 => token.push_str(&format!("+{c}")),
        c => token.push_str(&format!("-{}", -(c as i16))),
    }
    token.push(']');
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chem::smiles;

    fn canon(input: &str) -> String {
        let mut g = smiles::parse(input).unwrap();
        g.perceive_rings();
        canonical_smiles(&g)
    }

    #[test]
    fn equivalent_inputs_share_canonical_form() {
        assert_eq!(canon("CCO"), canon("OCC"));
        assert_eq!(canon("C(C)O"), canon("CCO"));
        assert_eq!(canon("c1ccccc1"), canon("c1ccccc1"));
        assert_eq!(canon("CC(=O)O"), canon("OC(C)=O"));
    }

    #[test]
    fn distinct_molecules_stay_distinct() {
        assert_ne!(canon("CCO"), canon("CCN"));
        assert_ne!(canon("CCO"), canon("CCC"));
        assert_ne!(canon("C1CCCCC1"), canon("c1ccccc1"));
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for input in ["CCO", "c1ccccc1", "CC(=O)[O-]", "Cc1ccccc1", "C1CC1", "[NH4+].[Cl-]"] {
            let once = canon(input);
            let twice = canon(&once);
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn kekule_and_aromatic_benzene_agree() {
        assert_eq!(canon("C1=CC=CC=C1"), canon("c1ccccc1"));
    }

    #[test]
    fn charges_and_isotopes_survive() {
        let s = canon("[13CH4]");
        assert!(s.contains("13C"), "got {s}");
        let s = canon("CC(=O)[O-]");
        assert!(s.contains("[O-]"), "got {s}");
    }

    #[test]
    fn fragments_are_dot_joined() {
        let s = canon("[Na+].[Cl-]");
        assert_eq!(s.matches('.').count(), 1);
        assert_eq!(canon("[Cl-].[Na+]"), s);
    }

    #[test]
    fn empty_graph_yields_empty_string() {
        let g = MolGraph::new();
        assert_eq!(canonical_smiles(&g), "");
    }
}
