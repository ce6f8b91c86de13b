//! The chemical index: single entry point tying parsing, fingerprints, the
//! lexical store, and verification together.
//!
//! Ingest drives the SD reader over an input stream; each record is parsed,
//! canonicalized, fingerprinted, and written as one document (replacing any
//! previous document with the same primary key). Search offers free-text,
//! name/identifier, exact-structure, fingerprint-screen, and two-stage
//! substructure modes. Every search returns `None` once the index is shut
//! down.
//!
//! One ingest runs at a time; searches issued during an ingest block until
//! the store's writer side commits and the searcher reopens.

use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn, Level};

use crate::chem::{self, ChemError, Mol};
use crate::collector::SubstructureCollector;
use crate::config::EngineConfig;
use crate::fingerprint::{FingerprintEngine, FingerprintError};
use crate::results;
use crate::sdf::{SdfError, SdfReader, SdfRecord};
use crate::store::{DocField, Hits, IndexDoc, IndexStore, ScoredHit, StoreError, StoreQuery};
use crate::tracker::{ResourceTracker, WaveGuard};

/// Hard ceiling on the candidate prefix scanned during substructure
/// verification.
pub const MAX_CANDIDATE_CAP: usize = 100_000;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Chem(#[from] ChemError),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sdf(#[from] SdfError),
    #[error("ingest aborted after {consecutive} consecutive record failures: {last}")]
    IngestAborted {
        consecutive: u64,
        last: String,
        summary: IngestSummary,
    },
}

/// Receives `(pk, canonical_smiles)` synchronously after every successful
/// document write. Failures are logged and never abort the ingest.
pub trait IngestListener: Send + Sync {
    fn on_molecule_indexed(
        &self,
        pk: &str,
        canonical_smiles: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Handle returned by [`ChemicalIndex::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-stream ingest parameters.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Record property holding the unique identifier. A record without a
    /// value here fails (it cannot be addressed or replaced).
    pub primary_key_field: String,
    /// Properties whose values become `name` synonyms on the document.
    pub name_fields: Vec<String>,
    /// Skip records until this primary key appears; the matching record
    /// itself is ingested.
    pub skip_until_pk: Option<String>,
    /// Primary keys to skip outright.
    pub skip_pks: BTreeSet<String>,
    /// Dataset label stamped on every record.
    pub dataset: String,
    /// Seed for the monotonic record counter.
    pub first_record_number: u64,
}

impl IngestOptions {
    pub fn new(primary_key_field: impl Into<String>) -> Self {
        IngestOptions {
            primary_key_field: primary_key_field.into(),
            name_fields: Vec::new(),
            skip_until_pk: None,
            skip_pks: BTreeSet::new(),
            dataset: String::new(),
            first_record_number: 1,
        }
    }

    pub fn with_name_fields(mut self, fields: Vec<String>) -> Self {
        self.name_fields = fields;
        self
    }

    pub fn with_skip_until_pk(mut self, pk: impl Into<String>) -> Self {
        self.skip_until_pk = Some(pk.into());
        self
    }

    pub fn with_skip_pks(mut self, pks: BTreeSet<String>) -> Self {
        self.skip_pks = pks;
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }
}

/// Structured outcome of one ingest run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub records: u64,
    pub indexed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub aborted: bool,
}

enum RecordFailure {
    /// Recoverable per-record input or toolkit failure; counted against
    /// the consecutive-error budget.
    Record(String),
    /// Store-level failure; aborts the ingest immediately.
    Fatal(EngineError),
}

pub struct ChemicalIndex {
    store: IndexStore,
    fingerprints: FingerprintEngine,
    tracker: Arc<ResourceTracker>,
    listeners: Mutex<Vec<(ListenerId, Box<dyn IngestListener>)>>,
    next_listener_id: AtomicU64,
    consecutive_error_limit: u64,
    candidate_cap: Option<usize>,
}

impl ChemicalIndex {
    /// Bind to a storage directory with the given configuration. Fails when
    /// the chemistry toolkit cannot activate or the fingerprint settings
    /// pair is unusable.
    pub fn open(dir: impl Into<PathBuf>, config: EngineConfig) -> Result<Self, EngineError> {
        chem::activate()?;
        let tracker = Arc::new(ResourceTracker::with_quarantine_delay(
            Duration::from_millis(config.cleanup.quarantine_delay_ms),
        ));
        let fingerprints = FingerprintEngine::new(
            config.fingerprint.structure,
            config.fingerprint.query,
            tracker.clone(),
        )?;
        let store =
            IndexStore::open(dir).with_writer_memory(config.index.writer_memory_bytes);
        Ok(ChemicalIndex {
            store,
            fingerprints,
            tracker,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            consecutive_error_limit: config.ingest.consecutive_error_limit,
            candidate_cap: config.substructure.candidate_cap,
        })
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn fingerprints(&self) -> &FingerprintEngine {
        &self.fingerprints
    }

    // ── Ingestion ───────────────────────────────────────────────────────

    /// Drive the SD reader over `input`, indexing one document per record.
    ///
    /// Per-record input failures are logged, counted, and skipped; the
    /// consecutive-failure counter resets on every successful record, and
    /// crossing the configured limit aborts with
    /// [`EngineError::IngestAborted`]. IO errors on the stream itself and
    /// store failures abort immediately. Uncommitted writes are rolled back
    /// on abort.
    pub fn ingest_stream<R: BufRead>(
        &self,
        input: R,
        options: &IngestOptions,
    ) -> Result<IngestSummary, EngineError> {
        let span = tracing::span!(Level::INFO, "ingest", dataset = %options.dataset);
        let _guard = span.enter();
        let start = Instant::now();

        let mut summary = IngestSummary::default();
        let mut consecutive = 0u64;
        let mut armed = options.skip_until_pk.is_none();

        let reader =
            SdfReader::from_reader(input, &options.dataset, options.first_record_number);
        for item in reader {
            let record = match item {
                Ok(record) => record,
                Err(err) => {
                    // Stream IO failures are fatal immediately.
                    summary.aborted = true;
                    let _ = self.store.rollback();
                    warn!(error = %err, "ingest_failure: input stream");
                    return Err(err.into());
                }
            };
            summary.records += 1;

            let pk = match record.property(&options.primary_key_field) {
                Some(value) if !value.is_empty() => value.to_string(),
                _ => {
                    let message = format!(
                        "record at line {} has no value for primary key field '{}'",
                        record.line_number, options.primary_key_field
                    );
                    self.note_record_failure(&mut summary, &mut consecutive, message)?;
                    continue;
                }
            };

            if !armed {
                if options.skip_until_pk.as_deref() == Some(pk.as_str()) {
                    armed = true;
                } else {
                    summary.skipped += 1;
                    continue;
                }
            }
            if options.skip_pks.contains(&pk) {
                debug!(pk = %pk, "record in skip set");
                summary.skipped += 1;
                continue;
            }

            match self.index_record(&record, &pk, options) {
                Ok(smiles) => {
                    consecutive = 0;
                    summary.indexed += 1;
                    self.notify_listeners(&pk, &smiles);
                }
                Err(RecordFailure::Record(message)) => {
                    self.note_record_failure(&mut summary, &mut consecutive, message)?;
                }
                Err(RecordFailure::Fatal(err)) => {
                    summary.aborted = true;
                    let _ = self.store.rollback();
                    warn!(error = %err, "ingest_failure: store");
                    return Err(err);
                }
            }
        }

        self.store.commit()?;
        info!(
            records = summary.records,
            indexed = summary.indexed,
            skipped = summary.skipped,
            errors = summary.errors,
            elapsed_micros = start.elapsed().as_micros() as u64,
            "ingest_success"
        );
        Ok(summary)
    }

    fn note_record_failure(
        &self,
        summary: &mut IngestSummary,
        consecutive: &mut u64,
        message: String,
    ) -> Result<(), EngineError> {
        warn!(error = %message, "ingest_record_failure");
        summary.errors += 1;
        *consecutive += 1;
        summary.last_error = Some(message.clone());
        if *consecutive > self.consecutive_error_limit {
            summary.aborted = true;
            let _ = self.store.rollback();
            return Err(EngineError::IngestAborted {
                consecutive: *consecutive,
                last: message,
                summary: summary.clone(),
            });
        }
        Ok(())
    }

    /// Parse, canonicalize, fingerprint, and write one record. The molecule
    /// handle stays alive through fingerprinting, which produces the same
    /// bits as reparsing the canonical SMILES would.
    fn index_record(
        &self,
        record: &SdfRecord,
        pk: &str,
        options: &IngestOptions,
    ) -> Result<String, RecordFailure> {
        let line = record.line_number;
        let per_record = |err: String| RecordFailure::Record(err);

        let wave = WaveGuard::fresh(&self.tracker);
        let mol = chem::parse_molblock(&record.molblock)
            .map_err(|e| per_record(format!("line {line}: molblock rejected: {e}")))?;
        self.tracker.mark(mol.clone(), wave.wave(), false);

        let smiles = chem::to_canonical_smiles(&mol)
            .map_err(|e| per_record(format!("line {line}: canonicalization failed: {e}")))?;
        if smiles.is_empty() {
            return Err(per_record(format!(
                "line {line}: canonicalization yielded empty SMILES"
            )));
        }

        let fp = self
            .fingerprints
            .structure_fp(&mol)
            .map_err(|e| per_record(format!("line {line}: fingerprint failed: {e}")))?;

        let mut names = Vec::new();
        for field in &options.name_fields {
            if let Some(value) = record.property(field) {
                names.push(value.to_string());
            }
        }
        let mut props = record.properties.clone();
        props.remove(&options.primary_key_field);

        let doc = IndexDoc {
            pk: pk.to_string(),
            smiles: smiles.clone(),
            names,
            fp_bits: fp.ones().collect(),
            props,
        };

        // Replace-by-pk: delete first, then add.
        self.store
            .delete_by_term(DocField::Pk, pk)
            .map_err(|e| RecordFailure::Fatal(e.into()))?;
        self.store
            .add_document(&doc)
            .map_err(|e| RecordFailure::Fatal(e.into()))?;
        debug!(pk = %pk, smiles = %smiles, "document_indexed");
        Ok(smiles)
    }

    // ── Ingestion events ────────────────────────────────────────────────

    pub fn add_listener(&self, listener: Box<dyn IngestListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify_listeners(&self, pk: &str, canonical_smiles: &str) {
        let listeners = self.lock_listeners();
        for (id, listener) in listeners.iter() {
            if let Err(err) = listener.on_molecule_indexed(pk, canonical_smiles) {
                warn!(listener = id.0, pk = %pk, error = %err, "ingest listener failed");
            }
        }
    }

    fn lock_listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Box<dyn IngestListener>)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// Parsed multi-field query over every indexed field. Parse errors come
    /// back unchanged as [`StoreError::QueryParse`].
    pub fn search_free(&self, text: &str, max_hits: usize) -> Result<Option<Hits>, EngineError> {
        self.run_search(|| self.store.search(&StoreQuery::Free(text), max_hits))
    }

    /// `name:value OR pk:value`.
    pub fn search_by_name(
        &self,
        name: &str,
        max_hits: usize,
    ) -> Result<Option<Hits>, EngineError> {
        self.run_search(|| self.store.search(&StoreQuery::NameOrPk(name), max_hits))
    }

    /// Exact-structure lookup: the query is canonicalized, then matched as
    /// a term against the stored canonical SMILES.
    pub fn search_exact(
        &self,
        smiles: &str,
        max_hits: usize,
    ) -> Result<Option<Hits>, EngineError> {
        if self.store.is_shut_down() {
            return Ok(None);
        }
        let canonical = self.canonicalize_query(smiles)?;
        self.run_search(|| {
            self.store.search(
                &StoreQuery::Term {
                    field: DocField::Smiles,
                    value: &canonical,
                },
                max_hits,
            )
        })
    }

    /// Fingerprint screen: documents whose stored structure fingerprint
    /// covers every bit of the query fingerprint.
    pub fn search_by_fp(
        &self,
        smiles: &str,
        max_hits: usize,
    ) -> Result<Option<Hits>, EngineError> {
        if self.store.is_shut_down() {
            return Ok(None);
        }
        let query_fp = self.fingerprints.query_fp(smiles, false)?;
        let bits: Vec<u32> = query_fp.ones().collect();
        self.run_search(|| self.store.search(&StoreQuery::FpSuperset(&bits), max_hits))
    }

    /// Two-stage substructure search: fingerprint screen for candidates,
    /// then atom-level verification in relevance order until `max_hits`
    /// survivors are found.
    ///
    /// The candidate stage scans at most the configured cap (default
    /// `min(10 × max_hits, 100000)`); matches beyond that prefix are not
    /// reported. Scores of surviving candidates are preserved.
    pub fn search_substructure(
        &self,
        smiles: &str,
        max_hits: usize,
    ) -> Result<Option<Hits>, EngineError> {
        if self.store.is_shut_down() {
            return Ok(None);
        }
        let span = tracing::span!(Level::DEBUG, "substructure", query = %smiles);
        let _guard = span.enter();

        let query_wave = WaveGuard::fresh(&self.tracker);
        let query_mol = chem::parse_smiles(smiles, true)?;
        self.tracker.mark(query_mol.clone(), query_wave.wave(), false);
        query_mol.update_property_cache()?;

        let query_fp =
            chem::generic_fingerprint(&query_mol, self.fingerprints.query_settings())?;
        let bits: Vec<u32> = query_fp.ones().collect();

        let cap = self
            .candidate_cap
            .unwrap_or_else(|| max_hits.saturating_mul(10).min(MAX_CANDIDATE_CAP));
        let candidates = match self.store.search(&StoreQuery::FpSuperset(&bits), cap) {
            Ok(hits) => hits,
            Err(StoreError::Shutdown) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut collector = SubstructureCollector::new(max_hits);
        let mut survivors = 0usize;
        let mut scanned = 0usize;
        for hit in candidates.iter() {
            if survivors >= max_hits {
                break;
            }
            scanned += 1;
            let candidate_wave = WaveGuard::fresh(&self.tracker);
            match self.verify_candidate(*hit, &query_mol, candidate_wave.wave()) {
                Ok(true) => {
                    collector.collect(*hit);
                    survivors += 1;
                }
                Ok(false) => {}
                Err(RecordFailure::Fatal(err)) => return Err(err),
                Err(RecordFailure::Record(message)) => {
                    warn!(error = %message, "candidate verification failed, skipping");
                }
            }
        }
        debug!(
            candidates = candidates.len(),
            scanned, survivors, "substructure_search_complete"
        );
        Ok(Some(collector.into_hits()))
    }

    /// Atom-level check of one candidate. The stored SMILES is canonical,
    /// so it is reparsed without sanitization.
    fn verify_candidate(
        &self,
        hit: ScoredHit,
        query_mol: &Mol,
        wave: u64,
    ) -> Result<bool, RecordFailure> {
        let doc = self
            .store
            .get_document(hit.doc)
            .map_err(|e| RecordFailure::Fatal(e.into()))?;
        let candidate = chem::parse_smiles(&doc.smiles, false)
            .map_err(|e| RecordFailure::Record(format!("pk {}: reparse failed: {e}", doc.pk)))?;
        self.tracker.mark(candidate.clone(), wave, false);
        candidate
            .update_property_cache()
            .map_err(|e| RecordFailure::Record(format!("pk {}: {e}", doc.pk)))?;
        chem::has_substructure_match(&candidate, query_mol)
            .map_err(|e| RecordFailure::Record(format!("pk {}: match failed: {e}", doc.pk)))
    }

    fn canonicalize_query(&self, smiles: &str) -> Result<String, EngineError> {
        let wave = WaveGuard::fresh(&self.tracker);
        let mol = chem::parse_smiles(smiles, true)?;
        self.tracker.mark(mol.clone(), wave.wave(), false);
        Ok(chem::to_canonical_smiles(&mol)?)
    }

    fn run_search(
        &self,
        search: impl FnOnce() -> Result<Hits, StoreError>,
    ) -> Result<Option<Hits>, EngineError> {
        match search() {
            Ok(hits) => Ok(Some(hits)),
            Err(StoreError::Shutdown) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // ── Documents and lifecycle ─────────────────────────────────────────

    /// Ordered primary keys for a hit collection; empty for `None`.
    pub fn primary_keys(&self, hits: Option<&Hits>) -> Result<Vec<String>, EngineError> {
        Ok(results::primary_keys(&self.store, hits)?)
    }

    pub fn document(&self, hit: &ScoredHit) -> Result<IndexDoc, EngineError> {
        Ok(self.store.get_document(hit.doc)?)
    }

    /// Live document count; `None` once shut down.
    pub fn num_docs(&self) -> Result<Option<u64>, EngineError> {
        match self.store.num_docs() {
            Ok(n) => Ok(Some(n)),
            Err(StoreError::Shutdown) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.store.is_shut_down()
    }

    /// Terminal shutdown: the store closes for good and tracked toolkit
    /// objects are quarantined for deferred release (an in-flight search
    /// may still alias them).
    pub fn shutdown(&self) -> Result<(), EngineError> {
        self.store.shutdown()?;
        self.tracker.quarantine_and_cleanup();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullListener;

    impl IngestListener for NullListener {
        fn on_molecule_indexed(
            &self,
            _pk: &str,
            _canonical_smiles: &str,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    fn open_index() -> (tempfile::TempDir, ChemicalIndex) {
        let dir = tempfile::TempDir::new().unwrap();
        let index = ChemicalIndex::open(dir.path(), EngineConfig::default()).unwrap();
        (dir, index)
    }

    #[test]
    fn listener_registry_adds_and_removes() {
        let (_dir, index) = open_index();
        let a = index.add_listener(Box::new(NullListener));
        let b = index.add_listener(Box::new(NullListener));
        assert_ne!(a, b);
        assert!(index.remove_listener(a));
        assert!(!index.remove_listener(a));
        assert!(index.remove_listener(b));
    }

    #[test]
    fn ingest_options_builders_compose() {
        let options = IngestOptions::new("ID")
            .with_dataset("demo.sdf")
            .with_name_fields(vec!["Name".into()])
            .with_skip_until_pk("M-5")
            .with_skip_pks(BTreeSet::from(["M-9".to_string()]));
        assert_eq!(options.primary_key_field, "ID");
        assert_eq!(options.skip_until_pk.as_deref(), Some("M-5"));
        assert!(options.skip_pks.contains("M-9"));
    }

    #[test]
    fn construction_validates_fingerprint_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.fingerprint.query.width = 64;
        assert!(matches!(
            ChemicalIndex::open(dir.path(), config),
            Err(EngineError::Fingerprint(_))
        ));
    }
}
