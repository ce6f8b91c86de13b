//! Chemistry toolkit binding.
//!
//! This is the capability surface the rest of the engine programs against:
//! structure parsing, canonical SMILES, substructure matching, fingerprint
//! generation, and stable binary serialization. Molecule handles returned
//! here are owned resources with an explicit release; hand every one to the
//! [`ResourceTracker`](crate::tracker::ResourceTracker) so a failed
//! operation cannot leak it. A released handle stays safe to touch; every
//! operation on it reports [`ChemError::Internal`].

mod avalon;
mod canon;
pub mod error;
mod graph;
mod matcher;
mod molblock;
mod smiles;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

pub use avalon::{
    FP_CLASS_ATOMS, FP_CLASS_ATOM_ENV, FP_CLASS_PATHS, FP_CLASS_RINGS, FP_DEFAULT_BIT_FLAGS,
    FP_QUERY_SAFE_FLAGS,
};
pub use error::ChemError;
pub use graph::{Atom, Bond, BondOrder, MolGraph};

use crate::fingerprint::{BitFingerprint, FingerprintKind, FingerprintSettings};
use crate::tracker::{Releasable, ReleaseError};

static ACTIVATION: OnceCell<Result<(), ChemError>> = OnceCell::new();
static NEXT_MOL_KEY: AtomicU64 = AtomicU64::new(1);

/// One-shot toolkit activation. Idempotent; once it fails, every later call
/// surfaces the same failure.
pub fn activate() -> Result<(), ChemError> {
    ACTIVATION
        .get_or_init(|| {
            // Sanity-screen the valence tables the hydrogen model depends
            // on before anything parses.
            for symbol in ["B", "C", "N", "O", "P", "S", "F", "Cl", "Br", "I", "H"] {
                let valences = graph::default_valences(symbol);
                if valences.is_empty() || valences.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(ChemError::internal(format!(
                        "valence table corrupt for element {symbol}"
                    )));
                }
            }
            Ok(())
        })
        .clone()
}

/// Owned handle to a parsed molecule.
///
/// Clones share the underlying structure; releasing any clone releases all
/// of them. Handles are cheap to clone, which is how they are both kept by
/// callers and registered with the resource tracker.
#[derive(Clone)]
pub struct Mol {
    cell: Arc<MolCell>,
}

struct MolCell {
    key: u64,
    graph: RwLock<Option<MolGraph>>,
}

impl std::fmt::Debug for Mol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mol")
            .field("key", &self.cell.key)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Mol {
    fn from_graph(graph: MolGraph) -> Self {
        Mol {
            cell: Arc::new(MolCell {
                key: NEXT_MOL_KEY.fetch_add(1, Ordering::Relaxed),
                graph: RwLock::new(Some(graph)),
            }),
        }
    }

    /// Process-unique identity of this handle; stable across clones.
    pub fn key(&self) -> u64 {
        self.cell.key
    }

    pub fn is_released(&self) -> bool {
        self.cell
            .graph
            .read()
            .map(|g| g.is_none())
            .unwrap_or(true)
    }

    /// Free the underlying structure. Idempotent.
    pub fn release(&self) {
        if let Ok(mut guard) = self.cell.graph.write() {
            guard.take();
        }
    }

    /// Ring and aromaticity perception; required before this handle can be
    /// the haystack of a substructure match.
    pub fn update_property_cache(&self) -> Result<(), ChemError> {
        let mut guard = self
            .cell
            .graph
            .write()
            .map_err(|_| ChemError::internal("molecule lock poisoned"))?;
        match guard.as_mut() {
            Some(graph) => {
                if !graph.rings_perceived {
                    graph.perceive_rings();
                }
                Ok(())
            }
            None => Err(released()),
        }
    }

    pub fn properties_cached(&self) -> bool {
        self.cell
            .graph
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|g| g.rings_perceived))
            .unwrap_or(false)
    }

    pub fn atom_count(&self) -> Result<usize, ChemError> {
        self.with_graph(|g| g.atom_count())
    }

    pub(crate) fn with_graph<T>(&self, f: impl FnOnce(&MolGraph) -> T) -> Result<T, ChemError> {
        let guard = self
            .cell
            .graph
            .read()
            .map_err(|_| ChemError::internal("molecule lock poisoned"))?;
        match guard.as_ref() {
            Some(graph) => Ok(f(graph)),
            None => Err(released()),
        }
    }
}

fn released() -> ChemError {
    ChemError::internal("operation on released molecule handle")
}

impl Releasable for Mol {
    fn resource_key(&self) -> u64 {
        self.key()
    }

    fn release(&self) -> Result<(), ReleaseError> {
        Mol::release(self);
        Ok(())
    }
}

/// Parse SMILES. With `sanitize`, valences are screened and rings/aromaticity
/// perceived; without it the input is trusted, the fast path for text this
/// engine canonicalized itself.
pub fn parse_smiles(text: &str, sanitize: bool) -> Result<Mol, ChemError> {
    activate()?;
    let mut graph = smiles::parse(text)?;
    if sanitize {
        screen_valences(&graph)?;
        graph.perceive_rings();
    }
    Ok(Mol::from_graph(graph))
}

/// Parse a V2000 molblock. Always sanitized; SD files arrive Kekulé-form
/// and need aromaticity perception to index consistently.
pub fn parse_molblock(text: &str) -> Result<Mol, ChemError> {
    activate()?;
    let mut graph = molblock::parse(text)?;
    screen_valences(&graph)?;
    graph.perceive_rings();
    Ok(Mol::from_graph(graph))
}

fn screen_valences(graph: &MolGraph) -> Result<(), ChemError> {
    for idx in 0..graph.atom_count() {
        let atom = &graph.atoms[idx];
        let valences = graph::default_valences(&atom.symbol);
        let Some(&max) = valences.last() else {
            continue;
        };
        if max == 0 {
            // Element outside the table: no screening.
            continue;
        }
        let bonded = (graph.bond_order_sum_x2(idx) + 1) / 2;
        let total = bonded + u32::from(atom.explicit_h.unwrap_or(0));
        let limit = max + atom.charge.unsigned_abs() as u32;
        if total > limit {
            return Err(ChemError::sanitize(format!(
                "atom {} ({}) exceeds valence {limit} with {total} bonds",
                idx + 1,
                atom.symbol
            )));
        }
    }
    Ok(())
}

/// Canonical SMILES; perceives rings first when the handle has not been
/// cached yet, so Kekulé and aromatic inputs agree.
pub fn to_canonical_smiles(mol: &Mol) -> Result<String, ChemError> {
    mol.update_property_cache()?;
    mol.with_graph(canon::canonical_smiles)
}

/// Stable binary serialization of a molecule.
pub fn to_binary(mol: &Mol) -> Result<Vec<u8>, ChemError> {
    mol.with_graph(|graph| {
        bincode::serde::encode_to_vec(graph, bincode::config::standard())
            .map_err(|e| ChemError::internal(format!("molecule encode failed: {e}")))
    })?
}

/// Inverse of [`to_binary`].
pub fn from_binary(bytes: &[u8]) -> Result<Mol, ChemError> {
    activate()?;
    let (mut graph, _): (MolGraph, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ChemError::parse(format!("molecule decode failed: {e}")))?;
    graph.rebuild_adjacency();
    Ok(Mol::from_graph(graph))
}

/// Substructure test. The haystack must have its property cache updated
/// (rings and aromaticity initialized) before this is called.
pub fn has_substructure_match(haystack: &Mol, needle: &Mol) -> Result<bool, ChemError> {
    if !haystack.properties_cached() {
        return Err(ChemError::internal(
            "update_property_cache must run on the haystack before substructure matching",
        ));
    }
    haystack.with_graph(|hay| needle.with_graph(|ndl| matcher::is_substructure(hay, ndl)))?
}

/// Avalon fingerprint straight from SMILES text. `assume_canonical` skips
/// sanitization and takes the fast ring-perception path.
pub fn avalon_fingerprint(
    text: &str,
    width: u32,
    query_flag: bool,
    bit_flags: u32,
    assume_canonical: bool,
) -> Result<BitFingerprint, ChemError> {
    let mol = parse_smiles(text, !assume_canonical)?;
    mol.update_property_cache()?;
    let fp = mol.with_graph(|graph| avalon::generate(graph, width, query_flag, bit_flags))?;
    mol.release();
    Ok(fp)
}

/// Fingerprint dispatch over the configured kind.
pub fn generic_fingerprint(
    mol: &Mol,
    settings: &FingerprintSettings,
) -> Result<BitFingerprint, ChemError> {
    mol.with_graph(|graph| match settings.kind {
        FingerprintKind::Avalon => avalon::generate(
            graph,
            settings.width,
            settings.avalon_query_flag,
            settings.avalon_bit_flags,
        ),
        FingerprintKind::Linear => avalon::generate_linear(graph, settings.width),
    })
}
