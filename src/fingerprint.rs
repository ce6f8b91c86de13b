//! Fingerprint engine: fixed-width bit vectors plus the settings pair that
//! drives indexing and querying.
//!
//! Two settings objects configure the engine, one for structure
//! fingerprints (stored in the index) and one for query fingerprints. The
//! engine's contract is the screening invariant: for any substructure pair
//! S ⊆ M, `bits(query_fp(S)) ⊆ bits(structure_fp(M))`. Changing either
//! settings object invalidates every previously built index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::chem::{self, ChemError, Mol, FP_DEFAULT_BIT_FLAGS};
use crate::tracker::{ResourceTracker, WaveGuard};

/// Default bit-vector width.
pub const DEFAULT_FP_WIDTH: u32 = 512;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FingerprintError {
    #[error("invalid fingerprint settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Chem(#[from] ChemError),
}

/// Fingerprint algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintKind {
    /// Full-featured generator, serialized on a process-wide lock.
    Avalon,
    /// Path-only bits; safe to run in parallel.
    Linear,
}

/// One side of the engine configuration (structure or query).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSettings {
    pub kind: FingerprintKind,
    /// Number of bits in the vector.
    pub width: u32,
    /// True for query fingerprints: restricts generation to the
    /// embedding-monotone bit classes.
    pub avalon_query_flag: bool,
    /// Mask selecting which bit classes may be set.
    pub avalon_bit_flags: u32,
    /// Kind-specific extras, carried opaquely.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_params: BTreeMap<String, String>,
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        FingerprintSettings {
            kind: FingerprintKind::Avalon,
            width: DEFAULT_FP_WIDTH,
            avalon_query_flag: false,
            avalon_bit_flags: FP_DEFAULT_BIT_FLAGS,
            extra_params: BTreeMap::new(),
        }
    }
}

impl FingerprintSettings {
    /// Structure-side defaults.
    pub fn structure() -> Self {
        Self::default()
    }

    /// Query-side defaults: same generator, query flag raised.
    pub fn query() -> Self {
        FingerprintSettings {
            avalon_query_flag: true,
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: FingerprintKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    pub fn with_query_flag(mut self, query_flag: bool) -> Self {
        self.avalon_query_flag = query_flag;
        self
    }

    pub fn with_bit_flags(mut self, bit_flags: u32) -> Self {
        self.avalon_bit_flags = bit_flags;
        self
    }
}

/// Fixed-width bit vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitFingerprint {
    width: u32,
    words: Vec<u64>,
}

impl BitFingerprint {
    pub fn new(width: u32) -> Self {
        BitFingerprint {
            width,
            words: vec![0u64; width.div_ceil(64) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Set bit `idx`; out-of-range indices are ignored.
    pub fn set(&mut self, idx: u32) {
        if idx < self.width {
            self.words[(idx / 64) as usize] |= 1u64 << (idx % 64);
        }
    }

    pub fn get(&self, idx: u32) -> bool {
        idx < self.width && self.words[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = u32> + '_ {
        let width = self.width;
        self.words
            .iter()
            .enumerate()
            .flat_map(move |(word_idx, &word)| {
                (0..64).filter_map(move |bit| {
                    let idx = word_idx as u32 * 64 + bit;
                    if idx < width && word & (1u64 << bit) != 0 {
                        Some(idx)
                    } else {
                        None
                    }
                })
            })
    }

    /// True when every set bit of `self` is set in `other`.
    pub fn is_subset_of(&self, other: &BitFingerprint) -> bool {
        if self.width != other.width {
            return false;
        }
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & !b == 0)
    }

    /// Tanimoto similarity: |A ∩ B| / |A ∪ B|, 1.0 for two empty vectors.
    pub fn tanimoto(&self, other: &BitFingerprint) -> f64 {
        let inter: u32 = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a & b).count_ones())
            .sum();
        let union: u32 = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| (a | b).count_ones())
            .sum();
        if union == 0 {
            return 1.0;
        }
        f64::from(inter) / f64::from(union)
    }
}

/// The engine bound to its two settings objects.
pub struct FingerprintEngine {
    structure: FingerprintSettings,
    query: FingerprintSettings,
    tracker: std::sync::Arc<ResourceTracker>,
}

impl FingerprintEngine {
    /// Both settings must agree on width, or the superset screen would
    /// compare vectors of different length.
    pub fn new(
        structure: FingerprintSettings,
        query: FingerprintSettings,
        tracker: std::sync::Arc<ResourceTracker>,
    ) -> Result<Self, FingerprintError> {
        if structure.width == 0 {
            return Err(FingerprintError::InvalidSettings(
                "fingerprint width must be positive".into(),
            ));
        }
        if structure.width != query.width {
            return Err(FingerprintError::InvalidSettings(format!(
                "structure width {} and query width {} differ",
                structure.width, query.width
            )));
        }
        if query.avalon_bit_flags & !structure.avalon_bit_flags != 0 {
            return Err(FingerprintError::InvalidSettings(
                "query bit classes must be a subset of structure bit classes".into(),
            ));
        }
        Ok(FingerprintEngine {
            structure,
            query,
            tracker,
        })
    }

    pub fn width(&self) -> u32 {
        self.structure.width
    }

    pub fn structure_settings(&self) -> &FingerprintSettings {
        &self.structure
    }

    pub fn query_settings(&self) -> &FingerprintSettings {
        &self.query
    }

    /// Structure fingerprint from an already-parsed handle.
    pub fn structure_fp(&self, mol: &Mol) -> Result<BitFingerprint, FingerprintError> {
        mol.update_property_cache()?;
        Ok(chem::generic_fingerprint(mol, &self.structure)?)
    }

    /// Structure fingerprint from SMILES text. `assume_canonical` skips
    /// sanitization, the fast path for text this engine emitted itself.
    pub fn structure_fp_smiles(
        &self,
        smiles: &str,
        assume_canonical: bool,
    ) -> Result<BitFingerprint, FingerprintError> {
        self.fp_from_smiles(smiles, assume_canonical, &self.structure)
    }

    /// Query fingerprint from SMILES text.
    pub fn query_fp(
        &self,
        smiles: &str,
        assume_canonical: bool,
    ) -> Result<BitFingerprint, FingerprintError> {
        self.fp_from_smiles(smiles, assume_canonical, &self.query)
    }

    fn fp_from_smiles(
        &self,
        smiles: &str,
        assume_canonical: bool,
        settings: &FingerprintSettings,
    ) -> Result<BitFingerprint, FingerprintError> {
        let guard = WaveGuard::fresh(&self.tracker);
        let mol = chem::parse_smiles(smiles, !assume_canonical)?;
        self.tracker.mark(mol.clone(), guard.wave(), false);
        mol.update_property_cache()?;
        let fp = chem::generic_fingerprint(&mol, settings)?;
        debug!(
            width = settings.width,
            bits = fp.count_ones(),
            query = settings.avalon_query_flag,
            "fingerprint_computed"
        );
        Ok(fp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn engine() -> FingerprintEngine {
        FingerprintEngine::new(
            FingerprintSettings::structure(),
            FingerprintSettings::query(),
            Arc::new(ResourceTracker::new()),
        )
        .unwrap()
    }

    #[test]
    fn bitvector_set_get_roundtrip() {
        let mut fp = BitFingerprint::new(512);
        for idx in [0u32, 63, 64, 511] {
            assert!(!fp.get(idx));
            fp.set(idx);
            assert!(fp.get(idx));
        }
        fp.set(512);
        assert!(!fp.get(512));
        assert_eq!(fp.count_ones(), 4);
        assert_eq!(fp.ones().collect::<Vec<_>>(), vec![0, 63, 64, 511]);
    }

    #[test]
    fn subset_and_tanimoto_behave() {
        let mut a = BitFingerprint::new(128);
        let mut b = BitFingerprint::new(128);
        a.set(1);
        a.set(5);
        b.set(1);
        b.set(5);
        b.set(9);
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
        assert!((a.tanimoto(&b) - 2.0 / 3.0).abs() < 1e-9);
        assert!((a.tanimoto(&a) - 1.0).abs() < 1e-9);

        let empty = BitFingerprint::new(128);
        assert!((empty.tanimoto(&BitFingerprint::new(128)) - 1.0).abs() < 1e-9);
        assert!(empty.is_subset_of(&b));
    }

    #[test]
    fn widths_must_agree() {
        let err = FingerprintEngine::new(
            FingerprintSettings::structure().with_width(512),
            FingerprintSettings::query().with_width(256),
            Arc::new(ResourceTracker::new()),
        );
        assert!(matches!(err, Err(FingerprintError::InvalidSettings(_))));
    }

    #[test]
    fn zero_width_is_rejected() {
        let err = FingerprintEngine::new(
            FingerprintSettings::structure().with_width(0),
            FingerprintSettings::query().with_width(0),
            Arc::new(ResourceTracker::new()),
        );
        assert!(matches!(err, Err(FingerprintError::InvalidSettings(_))));
    }

    #[test]
    fn screening_invariant_holds_for_substructure_pairs() {
        let eng = engine();
        let pairs = [
            ("CCO", "CCO"),
            ("CC", "CCCO"),
            ("c1ccccc1", "Cc1ccccc1"),
            ("C=O", "CC(=O)O"),
        ];
        for (needle, hay) in pairs {
            let q = eng.query_fp(needle, false).unwrap();
            let s = eng.structure_fp_smiles(hay, false).unwrap();
            assert!(q.is_subset_of(&s), "{needle} should screen into {hay}");
        }
    }

    #[test]
    fn handle_and_smiles_paths_agree() {
        let eng = engine();
        let mol = chem::parse_smiles("Cc1ccccc1", true).unwrap();
        let canonical = chem::to_canonical_smiles(&mol).unwrap();
        let from_handle = eng.structure_fp(&mol).unwrap();
        let from_smiles = eng.structure_fp_smiles(&canonical, true).unwrap();
        assert_eq!(from_handle, from_smiles);
        mol.release();
    }

    #[test]
    fn temporaries_are_swept_after_each_call() {
        let tracker = Arc::new(ResourceTracker::new());
        let eng = FingerprintEngine::new(
            FingerprintSettings::structure(),
            FingerprintSettings::query(),
            tracker.clone(),
        )
        .unwrap();
        eng.query_fp("CCO", false).unwrap();
        assert_eq!(tracker.total_tracked(), 0);
    }

    #[test]
    fn settings_serialize_roundtrip() {
        let settings = FingerprintSettings::query().with_width(1024);
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"avalon\""));
        let back: FingerprintSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(settings, back);
    }
}
