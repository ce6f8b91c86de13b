//! End-to-end scenarios over a real index directory: ingest SD streams,
//! then exercise every search mode, replacement, skip handling, the
//! consecutive-error budget, listeners, and shutdown behavior.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use moldex::{ChemicalIndex, EngineConfig, EngineError, IngestListener, IngestOptions, StoreError};

// ── SD fixtures ─────────────────────────────────────────────────────────

fn molblock(title: &str, atoms: &[&str], bonds: &[(usize, usize, u8)]) -> String {
    let mut block = format!("{title}\n  moldex\n\n");
    block.push_str(&format!(
        "{:3}{:3}  0  0  0  0  0  0  0  0999 V2000\n",
        atoms.len(),
        bonds.len()
    ));
    for symbol in atoms {
        block.push_str(&format!(
            "    0.0000    0.0000    0.0000 {symbol:<3} 0  0\n"
        ));
    }
    for (a, b, order) in bonds {
        block.push_str(&format!("{a:3}{b:3}{order:3}  0\n"));
    }
    block.push_str("M  END\n");
    block
}

fn ethanol_block(title: &str) -> String {
    molblock(title, &["C", "C", "O"], &[(1, 2, 1), (2, 3, 1)])
}

fn ethylamine_block(title: &str) -> String {
    molblock(title, &["C", "C", "N"], &[(1, 2, 1), (2, 3, 1)])
}

fn benzene_block(title: &str) -> String {
    molblock(
        title,
        &["C", "C", "C", "C", "C", "C"],
        &[(1, 2, 2), (2, 3, 1), (3, 4, 2), (4, 5, 1), (5, 6, 2), (6, 1, 1)],
    )
}

fn record(pk: &str, block: &str, extra: &[(&str, &str)]) -> String {
    let mut text = String::from(block);
    text.push_str(&format!("> <ID>\n{pk}\n\n"));
    for (name, value) in extra {
        text.push_str(&format!("> <{name}>\n{value}\n\n"));
    }
    text.push_str("$$$$\n");
    text
}

fn broken_record(pk: &str) -> String {
    // Bond references a second atom that does not exist; the molblock is
    // rejected while the pk property still parses.
    let block = "broken\n  moldex\n\n  1  1  0  0  0  0  0  0  0  0999 V2000\n    0.0000    0.0000    0.0000 C   0  0\n  1  2  1  0\nM  END\n";
    record(pk, block, &[])
}

fn open_index() -> (tempfile::TempDir, ChemicalIndex) {
    let dir = tempfile::TempDir::new().unwrap();
    let index = ChemicalIndex::open(dir.path(), EngineConfig::default()).unwrap();
    (dir, index)
}

fn ingest(index: &ChemicalIndex, sdf: &str, options: &IngestOptions) -> moldex::IngestSummary {
    index
        .ingest_stream(Cursor::new(sdf.as_bytes()), options)
        .unwrap()
}

fn options() -> IngestOptions {
    IngestOptions::new("ID").with_dataset("scenario.sdf")
}

fn pks(index: &ChemicalIndex, hits: Option<&moldex::Hits>) -> Vec<String> {
    index.primary_keys(hits).unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[test]
fn exact_match_is_canonicalization_insensitive() {
    let (_dir, index) = open_index();
    let summary = ingest(&index, &record("A1", &ethanol_block("ethanol"), &[]), &options());
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.errors, 0);

    // "OCC" and the ingested molblock canonicalize to the same SMILES.
    let hits = index.search_exact("OCC", 10).unwrap().unwrap();
    assert_eq!(pks(&index, Some(&hits)), vec!["A1"]);
}

#[test]
fn fingerprint_screen_separates_molecules() {
    let (_dir, index) = open_index();
    let sdf = format!(
        "{}{}",
        record("B1", &ethanol_block("ethanol"), &[]),
        record("B2", &benzene_block("benzene"), &[])
    );
    ingest(&index, &sdf, &options());

    let hits = index.search_by_fp("CCO", 10).unwrap().unwrap();
    let keys = pks(&index, Some(&hits));
    assert!(keys.contains(&"B1".to_string()));
    assert!(!keys.contains(&"B2".to_string()));
}

#[test]
fn substructure_search_verifies_candidates() {
    let (_dir, index) = open_index();
    let sdf = format!(
        "{}{}",
        record("C1", &benzene_block("benzene"), &[]),
        record("C2", &ethanol_block("ethanol"), &[])
    );
    ingest(&index, &sdf, &options());

    let hits = index.search_substructure("c1ccccc1", 10).unwrap().unwrap();
    assert_eq!(pks(&index, Some(&hits)), vec!["C1"]);
}

#[test]
fn reingesting_a_pk_replaces_the_document() {
    let (_dir, index) = open_index();
    ingest(&index, &record("D1", &ethanol_block("v1"), &[]), &options());
    ingest(&index, &record("D1", &ethylamine_block("v2"), &[]), &options());

    assert_eq!(index.num_docs().unwrap(), Some(1));
    assert!(index.search_exact("CCO", 1).unwrap().unwrap().is_empty());
    let hits = index.search_exact("CCN", 1).unwrap().unwrap();
    assert_eq!(pks(&index, Some(&hits)), vec!["D1"]);
}

#[test]
fn skip_set_excludes_records() {
    let (_dir, index) = open_index();
    let sdf = format!(
        "{}{}{}",
        record("E1", &ethanol_block("e1"), &[]),
        record("E2", &ethanol_block("e2"), &[]),
        record("E3", &ethanol_block("e3"), &[])
    );
    let opts = options().with_skip_pks(BTreeSet::from(["E2".to_string()]));
    let summary = ingest(&index, &sdf, &opts);
    assert_eq!(summary.indexed, 2);
    assert_eq!(summary.skipped, 1);

    assert_eq!(index.num_docs().unwrap(), Some(2));
    assert!(index.search_by_name("E2", 5).unwrap().unwrap().is_empty());
    assert_eq!(index.search_by_name("E1", 5).unwrap().unwrap().len(), 1);
}

#[test]
fn consecutive_error_budget_aborts_and_rolls_back() {
    let (_dir, index) = open_index();
    ingest(&index, &record("F0", &ethanol_block("good"), &[]), &options());

    let mut sdf = String::new();
    for i in 0..101 {
        sdf.push_str(&broken_record(&format!("BAD-{i}")));
    }
    let err = index
        .ingest_stream(Cursor::new(sdf.as_bytes()), &options())
        .unwrap_err();
    match err {
        EngineError::IngestAborted {
            consecutive,
            summary,
            ..
        } => {
            assert_eq!(consecutive, 101);
            assert!(summary.aborted);
            assert_eq!(summary.errors, 101);
            assert!(summary.last_error.is_some());
        }
        other => panic!("expected IngestAborted, got {other}"),
    }

    // The committed index is untouched.
    assert_eq!(index.num_docs().unwrap(), Some(1));
}

#[test]
fn error_counter_resets_on_success() {
    let (_dir, index) = open_index();
    let mut sdf = String::new();
    for i in 0..60 {
        sdf.push_str(&broken_record(&format!("X-{i}")));
    }
    sdf.push_str(&record("GOOD-1", &ethanol_block("good"), &[]));
    for i in 60..130 {
        sdf.push_str(&broken_record(&format!("X-{i}")));
    }

    // 60 + 70 failures, but never more than 100 consecutive.
    let summary = ingest(&index, &sdf, &options());
    assert!(!summary.aborted);
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.errors, 130);
    assert_eq!(index.num_docs().unwrap(), Some(1));
}

#[test]
fn skip_until_pk_arms_inclusively() {
    let (_dir, index) = open_index();
    let sdf = format!(
        "{}{}{}",
        record("G1", &ethanol_block("g1"), &[]),
        record("G2", &ethanol_block("g2"), &[]),
        record("G3", &ethanol_block("g3"), &[])
    );
    let opts = options().with_skip_until_pk("G2");
    let summary = ingest(&index, &sdf, &opts);
    assert_eq!(summary.indexed, 2);
    assert_eq!(summary.skipped, 1);
    assert!(index.search_by_name("G1", 5).unwrap().unwrap().is_empty());
    assert_eq!(index.search_by_name("G3", 5).unwrap().unwrap().len(), 1);
}

#[test]
fn missing_primary_key_is_counted_not_fatal() {
    let (_dir, index) = open_index();
    let mut sdf = String::from(&ethanol_block("anonymous"));
    sdf.push_str("$$$$\n");
    sdf.push_str(&record("H1", &ethanol_block("named"), &[]));

    let summary = ingest(&index, &sdf, &options());
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.errors, 1);
    assert!(summary
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("primary key")));
}

// ── Search modes over a small catalog ───────────────────────────────────

fn catalog(index: &ChemicalIndex) {
    let sdf = format!(
        "{}{}{}",
        record("MOL-1", &ethanol_block("ethanol"), &[("Name", "ethanol"), ("CAS", "64-17-5")]),
        record("MOL-2", &benzene_block("benzene"), &[("Name", "benzene")]),
        record("MOL-3", &ethylamine_block("ethylamine"), &[("Name", "ethylamine")])
    );
    let opts = options().with_name_fields(vec!["Name".to_string()]);
    ingest(index, &sdf, &opts);
}

#[test]
fn name_search_covers_names_and_pks() {
    let (_dir, index) = open_index();
    catalog(&index);

    let by_name = index.search_by_name("benzene", 10).unwrap().unwrap();
    assert_eq!(pks(&index, Some(&by_name)), vec!["MOL-2"]);

    let by_pk = index.search_by_name("MOL-3", 10).unwrap().unwrap();
    assert_eq!(pks(&index, Some(&by_pk)), vec!["MOL-3"]);
}

#[test]
fn free_text_search_spans_properties() {
    let (_dir, index) = open_index();
    catalog(&index);

    let hits = index.search_free("ethanol", 10).unwrap().unwrap();
    assert_eq!(pks(&index, Some(&hits)), vec!["MOL-1"]);

    // Query parse errors surface unchanged.
    assert!(matches!(
        index.search_free("pk:(", 10),
        Err(EngineError::Store(StoreError::QueryParse(_)))
    ));
}

#[test]
fn stored_documents_keep_their_properties() {
    let (_dir, index) = open_index();
    catalog(&index);

    let hits = index.search_exact("CCO", 1).unwrap().unwrap();
    let doc = index.document(&hits.entries[0]).unwrap();
    assert_eq!(doc.pk, "MOL-1");
    assert_eq!(doc.names, vec!["ethanol".to_string()]);
    assert_eq!(doc.props.get("CAS").map(String::as_str), Some("64-17-5"));
    assert_eq!(doc.props.get("dataset_name").map(String::as_str), Some("scenario.sdf"));
    assert!(doc.props.contains_key("record_number"));
}

#[test]
fn fp_hits_are_true_bit_supersets() {
    let (_dir, index) = open_index();
    catalog(&index);

    let query_fp = index.fingerprints().query_fp("CCO", false).unwrap();
    let hits = index.search_by_fp("CCO", 10).unwrap().unwrap();
    assert!(!hits.is_empty());
    for hit in hits.iter() {
        let doc = index.document(hit).unwrap();
        let stored_fp = index
            .fingerprints()
            .structure_fp_smiles(&doc.smiles, true)
            .unwrap();
        assert!(
            query_fp.is_subset_of(&stored_fp),
            "hit {} is not a bit superset of the query",
            doc.pk
        );
    }
}

#[test]
fn substructure_respects_max_hits_and_order() {
    let (_dir, index) = open_index();
    let mut sdf = String::new();
    for i in 0..8 {
        sdf.push_str(&record(&format!("R-{i}"), &benzene_block("ring"), &[]));
    }
    ingest(&index, &sdf, &options());

    let hits = index.search_substructure("c1ccccc1", 3).unwrap().unwrap();
    assert_eq!(hits.len(), 3);
    // Collector output is score-ordered, ties toward the lower doc id.
    for pair in hits.entries.windows(2) {
        assert!(
            pair[0].score > pair[1].score
                || (pair[0].score == pair[1].score && pair[0].doc < pair[1].doc)
        );
    }
}

// ── Listeners ───────────────────────────────────────────────────────────

struct Recorder {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl IngestListener for Recorder {
    fn on_molecule_indexed(
        &self,
        pk: &str,
        canonical_smiles: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.seen
            .lock()
            .unwrap()
            .push((pk.to_string(), canonical_smiles.to_string()));
        Ok(())
    }
}

struct Faulty;

impl IngestListener for Faulty {
    fn on_molecule_indexed(
        &self,
        _pk: &str,
        _canonical_smiles: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("listener on fire".into())
    }
}

#[test]
fn listeners_see_documents_in_write_order() {
    let (_dir, index) = open_index();
    let seen = Arc::new(Mutex::new(Vec::new()));
    index.add_listener(Box::new(Recorder { seen: seen.clone() }));
    // A failing listener must not disturb the ingest or its neighbor.
    index.add_listener(Box::new(Faulty));

    let sdf = format!(
        "{}{}",
        record("L1", &ethanol_block("one"), &[]),
        record("L2", &ethylamine_block("two"), &[])
    );
    let summary = ingest(&index, &sdf, &options());
    assert_eq!(summary.indexed, 2);

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "L1");
    assert_eq!(events[1].0, "L2");
    assert!(!events[0].1.is_empty());
}

#[test]
fn removed_listeners_stop_receiving() {
    let (_dir, index) = open_index();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let id = index.add_listener(Box::new(Recorder { seen: seen.clone() }));
    assert!(index.remove_listener(id));

    ingest(&index, &record("L3", &ethanol_block("x"), &[]), &options());
    assert!(seen.lock().unwrap().is_empty());
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[test]
fn shutdown_turns_every_search_into_none() {
    let (_dir, index) = open_index();
    catalog(&index);
    index.shutdown().unwrap();

    assert!(index.is_shut_down());
    assert!(index.search_free("ethanol", 5).unwrap().is_none());
    assert!(index.search_by_name("benzene", 5).unwrap().is_none());
    assert!(index.search_exact("CCO", 5).unwrap().is_none());
    assert!(index.search_by_fp("CCO", 5).unwrap().is_none());
    assert!(index.search_substructure("c1ccccc1", 5).unwrap().is_none());
    assert!(index.num_docs().unwrap().is_none());

    // Ingest against a shut-down store is an error, not a crash.
    assert!(index
        .ingest_stream(
            Cursor::new(record("Z1", &ethanol_block("z"), &[]).into_bytes()),
            &options()
        )
        .is_err());
}

#[test]
fn search_before_any_ingest_reports_no_index() {
    let (_dir, index) = open_index();
    assert!(matches!(
        index.search_exact("CCO", 5),
        Err(EngineError::Store(StoreError::NoIndexYet))
    ));
}

#[test]
fn tracker_is_empty_after_every_operation() {
    let (_dir, index) = open_index();
    catalog(&index);
    index.search_substructure("c1ccccc1", 5).unwrap().unwrap();
    index.search_exact("CCO", 5).unwrap().unwrap();
    index.search_by_fp("CCN", 5).unwrap().unwrap();
    assert_eq!(index.tracker().total_tracked(), 0);
}

#[test]
fn primary_keys_of_none_is_empty() {
    let (_dir, index) = open_index();
    assert!(pks(&index, None).is_empty());
}
