//! Avalon-style fingerprint bit generation.
//!
//! Bits are drawn from four feature classes selected by a bit-flag mask:
//!
//! - atom bits: (element, aromaticity, charge) per atom
//! - path bits: linear simple paths of 1..=5 bonds
//! - ring bits: smallest-ring sizes present in the molecule
//! - environment bits: per-atom (element, aromaticity, charge, degree,
//!   hydrogen count)
//!
//! Atom and path features are embedding-monotone: every feature of a
//! substructure S is also a feature of any molecule containing S. Query
//! fingerprints are therefore restricted to those two classes, which is what
//! makes `bits(query) ⊆ bits(structure)` hold for every substructure pair.
//! Ring sizes and atom environments are not preserved under embedding, so
//! only structure fingerprints may set them.
//!
//! The generator works through a process-global scratch workspace; all
//! Avalon-kind calls are serialized on its mutex.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::graph::MolGraph;
use crate::fingerprint::BitFingerprint;

pub const FP_CLASS_ATOMS: u32 = 0b0001;
pub const FP_CLASS_PATHS: u32 = 0b0010;
pub const FP_CLASS_RINGS: u32 = 0b0100;
pub const FP_CLASS_ATOM_ENV: u32 = 0b1000;

/// Structure fingerprints default to every class.
pub const FP_DEFAULT_BIT_FLAGS: u32 =
    FP_CLASS_ATOMS | FP_CLASS_PATHS | FP_CLASS_RINGS | FP_CLASS_ATOM_ENV;

/// Classes that survive the query flag: only the embedding-monotone ones.
pub const FP_QUERY_SAFE_FLAGS: u32 = FP_CLASS_ATOMS | FP_CLASS_PATHS;

const MAX_PATH_BONDS: usize = 5;

/// Changing the seed changes every bit assignment and forces an index
/// rebuild.
const FP_HASH_SEED: u64 = 0x6d6f_6c64_6578;

// Feature-class tags mixed into each hash so classes never collide
// structurally.
const TAG_ATOM: u64 = 1;
const TAG_PATH: u64 = 2;
const TAG_RING: u64 = 3;
const TAG_ENV: u64 = 4;

struct Scratch {
    visited: Vec<bool>,
    path_atoms: Vec<usize>,
    path_bonds: Vec<usize>,
    forward: Vec<u64>,
    backward: Vec<u64>,
    bytes: Vec<u8>,
}

static SCRATCH: Lazy<Mutex<Scratch>> = Lazy::new(|| {
    Mutex::new(Scratch {
        visited: Vec::new(),
        path_atoms: Vec::new(),
        path_bonds: Vec::new(),
        forward: Vec::new(),
        backward: Vec::new(),
        bytes: Vec::new(),
    })
});

/// Serialized entry point for Avalon-kind fingerprints.
pub(crate) fn generate(graph: &MolGraph, width: u32, query_flag: bool, bit_flags: u32) -> BitFingerprint {
    let mut scratch = SCRATCH.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    generate_with_scratch(graph, width, query_flag, bit_flags, &mut scratch)
}

/// Path-only generation without the shared workspace; usable in parallel.
pub(crate) fn generate_linear(graph: &MolGraph, width: u32) -> BitFingerprint {
    let mut scratch = Scratch {
        visited: Vec::new(),
        path_atoms: Vec::new(),
        path_bonds: Vec::new(),
        forward: Vec::new(),
        backward: Vec::new(),
        bytes: Vec::new(),
    };
    generate_with_scratch(graph, width, false, FP_QUERY_SAFE_FLAGS, &mut scratch)
}

fn generate_with_scratch(
    graph: &MolGraph,
    width: u32,
    query_flag: bool,
    bit_flags: u32,
    scratch: &mut Scratch,
) -> BitFingerprint {
    let flags = if query_flag {
        bit_flags & FP_QUERY_SAFE_FLAGS
    } else {
        bit_flags
    };
    let mut fp = BitFingerprint::new(width);

    if flags & FP_CLASS_ATOMS != 0 {
        for idx in 0..graph.atom_count() {
            let inv = atom_invariant(graph, idx);
            set_feature_bit(&mut fp, width, &[TAG_ATOM, inv], scratch);
        }
    }

    if flags & FP_CLASS_PATHS != 0 {
        enumerate_paths(graph, width, &mut fp, scratch);
    }

    if flags & FP_CLASS_RINGS != 0 {
        for &size in &graph.ring_sizes {
            set_feature_bit(&mut fp, width, &[TAG_RING, u64::from(size)], scratch);
        }
    }

    if flags & FP_CLASS_ATOM_ENV != 0 {
        for idx in 0..graph.atom_count() {
            let inv = atom_invariant(graph, idx);
            let env = [
                TAG_ENV,
                inv,
                graph.degree(idx) as u64,
                u64::from(graph.hydrogen_count(idx)),
            ];
            set_feature_bit(&mut fp, width, &env, scratch);
        }
    }

    fp
}

/// Invariant over properties the substructure matcher requires to be equal.
/// Anything finer (degree, hydrogens, ring membership) would break the
/// screening subset guarantee for path bits.
fn atom_invariant(graph: &MolGraph, idx: usize) -> u64 {
    let atom = &graph.atoms[idx];
    let mut bytes = Vec::with_capacity(atom.symbol.len() + 2);
    bytes.extend_from_slice(atom.symbol.as_bytes());
    bytes.push(u8::from(atom.aromatic));
    bytes.push(atom.charge as u8);
    xxh3_64_with_seed(&bytes, FP_HASH_SEED)
}

fn enumerate_paths(graph: &MolGraph, width: u32, fp: &mut BitFingerprint, scratch: &mut Scratch) {
    scratch.visited.clear();
    scratch.visited.resize(graph.atom_count(), false);
    for start in 0..graph.atom_count() {
        scratch.path_atoms.clear();
        scratch.path_bonds.clear();
        scratch.path_atoms.push(start);
        scratch.visited[start] = true;
        extend_path(graph, width, start, fp, scratch);
        scratch.visited[start] = false;
    }
}

fn extend_path(
    graph: &MolGraph,
    width: u32,
    last: usize,
    fp: &mut BitFingerprint,
    scratch: &mut Scratch,
) {
    // Snapshot: recursion below mutates the scratch lists.
    let neighbors: Vec<(usize, usize)> = graph.neighbors(last).to_vec();
    for (nbr, bi) in neighbors {
        if scratch.visited[nbr] {
            continue;
        }
        scratch.path_atoms.push(nbr);
        scratch.path_bonds.push(bi);
        scratch.visited[nbr] = true;

        set_path_bit(graph, width, fp, scratch);
        if scratch.path_bonds.len() < MAX_PATH_BONDS {
            extend_path(graph, width, nbr, fp, scratch);
        }

        scratch.visited[nbr] = false;
        scratch.path_bonds.pop();
        scratch.path_atoms.pop();
    }
}

/// Each path is seen once from each end; hashing the lexicographically
/// smaller encoding makes both traversals land on the same bit.
fn set_path_bit(graph: &MolGraph, width: u32, fp: &mut BitFingerprint, scratch: &mut Scratch) {
    scratch.forward.clear();
    scratch.backward.clear();

    scratch.forward.push(TAG_PATH);
    for (pos, &atom) in scratch.path_atoms.iter().enumerate() {
        scratch.forward.push(atom_invariant(graph, atom));
        if let Some(&bi) = scratch.path_bonds.get(pos) {
            scratch.forward.push(graph.bonds[bi].order.code());
        }
    }

    scratch.backward.push(TAG_PATH);
    for (pos, &atom) in scratch.path_atoms.iter().enumerate().rev() {
        scratch.backward.push(atom_invariant(graph, atom));
        if pos > 0 {
            scratch.backward.push(graph.bonds[scratch.path_bonds[pos - 1]].order.code());
        }
    }

    let encoding: Vec<u64> = if scratch.forward <= scratch.backward {
        scratch.forward.clone()
    } else {
        scratch.backward.clone()
    };
    set_feature_bit(fp, width, &encoding, scratch);
}

fn set_feature_bit(fp: &mut BitFingerprint, width: u32, words: &[u64], scratch: &mut Scratch) {
    scratch.bytes.clear();
    for w in words {
        scratch.bytes.extend_from_slice(&w.to_le_bytes());
    }
    let hash = xxh3_64_with_seed(&scratch.bytes, FP_HASH_SEED);
    fp.set((hash % u64::from(width)) as u32);
}
