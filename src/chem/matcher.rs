//! Subgraph isomorphism for substructure queries.
//!
//! Backtracking VF2-style search mapping query atoms onto target atoms.
//! Compatibility is element + aromaticity + formal charge on atoms, and
//! equal order (or aromatic-to-aromatic) on bonds. Isotopes constrain the
//! match only when the query specifies one.

use super::graph::{Bond, BondOrder, MolGraph};

/// True when `needle` embeds into `haystack` as a subgraph.
pub fn is_substructure(haystack: &MolGraph, needle: &MolGraph) -> bool {
    if needle.atom_count() == 0 {
        return true;
    }
    if needle.atom_count() > haystack.atom_count()
        || needle.bonds.len() > haystack.bonds.len()
    {
        return false;
    }

    let order = query_order(needle);
    let mut mapping = vec![usize::MAX; needle.atom_count()];
    let mut used = vec![false; haystack.atom_count()];
    extend(haystack, needle, &order, 0, &mut mapping, &mut used)
}

/// Visit order over query atoms: every atom after the first of its
/// component is adjacent to an already-ordered atom, which keeps the
/// candidate set small during backtracking.
fn query_order(needle: &MolGraph) -> Vec<usize> {
    let n = needle.atom_count();
    let mut order = Vec::with_capacity(n);
    let mut placed = vec![false; n];
    for root in 0..n {
        if placed[root] {
            continue;
        }
        placed[root] = true;
        let mut stack = vec![root];
        while let Some(atom) = stack.pop() {
            order.push(atom);
            for &(nbr, _) in needle.neighbors(atom) {
                if !placed[nbr] {
                    placed[nbr] = true;
                    stack.push(nbr);
                }
            }
        }
    }
    order
}

fn extend(
    haystack: &MolGraph,
    needle: &MolGraph,
    order: &[usize],
    depth: usize,
    mapping: &mut Vec<usize>,
    used: &mut Vec<bool>,
) -> bool {
    if depth == order.len() {
        return true;
    }
    let q = order[depth];

    // Anchor on an already-mapped neighbor when one exists; otherwise this
    // atom starts a new query fragment and every unused target atom is a
    // candidate.
    let anchor = needle
        .neighbors(q)
        .iter()
        .find(|&&(nbr, _)| mapping[nbr] != usize::MAX)
        .map(|&(nbr, _)| mapping[nbr]);

    let try_candidate = |t: usize,
                         mapping: &mut Vec<usize>,
                         used: &mut Vec<bool>|
     -> bool {
        if used[t] || !atoms_compatible(haystack, needle, t, q) {
            return false;
        }
        if !bonds_consistent(haystack, needle, q, t, mapping) {
            return false;
        }
        mapping[q] = t;
        used[t] = true;
        if extend(haystack, needle, order, depth + 1, mapping, used) {
            return true;
        }
        mapping[q] = usize::MAX;
        used[t] = false;
        false
    };

    match anchor {
        Some(mapped_nbr) => {
            let candidates: Vec<usize> = haystack
                .neighbors(mapped_nbr)
                .iter()
                .map(|&(t, _)| t)
                .collect();
            for t in candidates {
                if try_candidate(t, mapping, used) {
                    return true;
                }
            }
        }
        None => {
            for t in 0..haystack.atom_count() {
                if try_candidate(t, mapping, used) {
                    return true;
                }
            }
        }
    }
    false
}

fn atoms_compatible(haystack: &MolGraph, needle: &MolGraph, t: usize, q: usize) -> bool {
    let qa = &needle.atoms[q];
    let ta = &haystack.atoms[t];
    if qa.symbol != ta.symbol || qa.aromatic != ta.aromatic || qa.charge != ta.charge {
        return false;
    }
    if qa.isotope != 0 && qa.isotope != ta.isotope {
        return false;
    }
    // Degree can only grow under embedding.
    needle.degree(q) <= haystack.degree(t)
}

/// Every query bond from `q` into the mapped region must exist in the
/// target with a compatible order.
fn bonds_consistent(
    haystack: &MolGraph,
    needle: &MolGraph,
    q: usize,
    t: usize,
    mapping: &[usize],
) -> bool {
    for &(nbr, bi) in needle.neighbors(q) {
        let mapped = mapping[nbr];
        if mapped == usize::MAX {
            continue;
        }
        match haystack.bond_between(t, mapped) {
            Some(target_bond) => {
                if !bonds_compatible(&needle.bonds[bi], target_bond) {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

fn bonds_compatible(query: &Bond, target: &Bond) -> bool {
    query.order == target.order
        || (query.order == BondOrder::Aromatic && target.order == BondOrder::Aromatic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chem::smiles;

    fn graph(input: &str) -> MolGraph {
        let mut g = smiles::parse(input).unwrap();
        g.perceive_rings();
        g
    }

    #[test]
    fn molecule_matches_itself() {
        for s in ["CCO", "c1ccccc1", "CC(=O)O"] {
            let g = graph(s);
            assert!(is_substructure(&g, &g), "{s} should match itself");
        }
    }

    #[test]
    fn benzene_is_in_toluene() {
        let toluene = graph("Cc1ccccc1");
        let benzene = graph("c1ccccc1");
        assert!(is_substructure(&toluene, &benzene));
        assert!(!is_substructure(&benzene, &toluene));
    }

    #[test]
    fn ethanol_is_not_in_benzene() {
        let benzene = graph("c1ccccc1");
        let ethanol = graph("CCO");
        assert!(!is_substructure(&benzene, &ethanol));
    }

    #[test]
    fn aliphatic_chain_does_not_match_aromatic_ring() {
        let benzene = graph("c1ccccc1");
        let propane = graph("CCC");
        assert!(!is_substructure(&benzene, &propane));
    }

    #[test]
    fn chain_embeds_into_longer_chain() {
        let pentane = graph("CCCCC");
        let ethane = graph("CC");
        assert!(is_substructure(&pentane, &ethane));
    }

    #[test]
    fn bond_orders_constrain_matches() {
        let ethene = graph("C=C");
        let ethane = graph("CC");
        assert!(!is_substructure(&ethane, &ethene));
        assert!(!is_substructure(&ethene, &ethane));
    }

    #[test]
    fn charges_constrain_matches() {
        let acetate = graph("CC(=O)[O-]");
        let acid = graph("CC(=O)O");
        let charged_o = graph("[O-]");
        assert!(is_substructure(&acetate, &charged_o));
        assert!(!is_substructure(&acid, &charged_o));
    }

    #[test]
    fn disconnected_query_fragments_match_independently() {
        let salt = graph("[Na+].[Cl-]");
        let q = graph("[Cl-]");
        assert!(is_substructure(&salt, &q));
        let both = graph("[Cl-].[Na+]");
        assert!(is_substructure(&salt, &both));
    }

    #[test]
    fn empty_query_matches_anything() {
        let g = graph("CCO");
        assert!(is_substructure(&g, &MolGraph::new()));
    }

    #[test]
    fn ring_query_needs_a_ring() {
        let cyclohexane = graph("C1CCCCC1");
        let hexane = graph("CCCCCC");
        assert!(is_substructure(&cyclohexane, &graph("CCC")));
        assert!(!is_substructure(&hexane, &cyclohexane));
    }
}
