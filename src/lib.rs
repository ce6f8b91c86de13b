//! moldex — a chemical structure search engine.
//!
//! A persistent, incrementally-updatable inverted index of molecules with
//! five query modes: free-text, name/identifier, exact structure,
//! fingerprint screen, and full substructure search. Molecules arrive as
//! SD files, are canonicalized and fingerprinted, and land as one document
//! each in a [tantivy](https://docs.rs/tantivy) index; substructure search
//! runs a two-stage candidate-then-verify pipeline over the fingerprint
//! screen.
//!
//! ## Layers
//!
//! - [`chem`] — the chemistry toolkit binding: parsing (SMILES, V2000
//!   molblock), canonical SMILES, subgraph matching, fingerprint bit
//!   generation, binary serialization. Molecule handles are owned
//!   resources with explicit release.
//! - [`tracker`] — wave-scoped registration and deterministic cleanup of
//!   toolkit-backed objects, with a quarantine mode for aliased handles.
//! - [`sdf`] — lazy SD file record streaming, gzip-aware.
//! - [`fingerprint`] — fixed-width bit vectors and the structure/query
//!   settings pair; guarantees the screening invariant
//!   `bits(query_fp(S)) ⊆ bits(structure_fp(M))` for substructure pairs.
//! - [`store`] — the persistent term index with its
//!   closed/writing/searching/shutdown lifecycle.
//! - [`facade`] — [`ChemicalIndex`], the single entry point: ingest,
//!   search, listeners, shutdown.
//! - [`collector`] / [`results`] — bounded verification collector and the
//!   hit-to-identifier adapter.
//!
//! ## Quick start
//!
//! ```ignore
//! use moldex::{ChemicalIndex, EngineConfig, IngestOptions};
//!
//! let index = ChemicalIndex::open("/data/molecules.idx", EngineConfig::default())?;
//! let file = std::io::BufReader::new(std::fs::File::open("catalog.sdf")?);
//! let summary = index.ingest_stream(file, &IngestOptions::new("ID").with_dataset("catalog.sdf"))?;
//! println!("indexed {} molecules", summary.indexed);
//!
//! if let Some(hits) = index.search_substructure("c1ccccc1", 25)? {
//!     for pk in index.primary_keys(Some(&hits))? {
//!         println!("{pk}");
//!     }
//! }
//! ```
//!
//! Rebuild the index whenever the fingerprint kind, width, or bit flags
//! change; documents written under the old settings do not screen
//! correctly under new ones.

pub mod chem;
pub mod collector;
pub mod config;
pub mod facade;
pub mod fingerprint;
pub mod results;
pub mod sdf;
pub mod store;
pub mod tracker;

pub use chem::ChemError;
pub use config::{ConfigError, EngineConfig};
pub use facade::{
    ChemicalIndex, EngineError, IngestListener, IngestOptions, IngestSummary, ListenerId,
};
pub use fingerprint::{
    BitFingerprint, FingerprintEngine, FingerprintError, FingerprintKind, FingerprintSettings,
};
pub use sdf::{SdfError, SdfReader, SdfRecord};
pub use store::{DocKey, Hits, IndexDoc, IndexStore, ScoredHit, StoreError};
pub use tracker::{Releasable, ResourceTracker, WaveGuard};
