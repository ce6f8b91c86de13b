//! Persistent inverted index over tantivy.
//!
//! Exactly one of {writer, searcher} is open at a time against the storage
//! directory; the store is a state machine over `closed / writing /
//! searching / shutdown` and its public operations drive the transitions.
//! A search issued mid-ingest blocks on the state mutex until the writer
//! side commits and the searcher reopens.
//!
//! Field layout: `pk` and `smiles` are raw (not analyzed) stored fields,
//! `name` is a multi-valued raw stored field, `fp` holds one indexed-only
//! token per set fingerprint bit (the bit index in decimal), and free-form
//! record properties live in a stored, raw-indexed JSON field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, JsonObjectOptions, OwnedValue, Schema, TextFieldIndexing, STORED,
    STRING,
};
use tantivy::{DocAddress, Index, IndexReader, IndexWriter, TantivyDocument, Term};
use thiserror::Error;
use tracing::{debug, info};

pub const FIELD_PK: &str = "pk";
pub const FIELD_SMILES: &str = "smiles";
pub const FIELD_FP: &str = "fp";
pub const FIELD_NAME: &str = "name";
pub const FIELD_PROPS: &str = "props";

const DEFAULT_WRITER_MEMORY_BYTES: usize = 50_000_000;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("index store error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("query parse error: {0}")]
    QueryParse(String),
    #[error("document rejected: {0}")]
    DocParse(String),
    #[error("no index has been built in this directory yet")]
    NoIndexYet,
    #[error("index store is shut down")]
    Shutdown,
}

/// Identity of one hit inside the index; ordering follows (segment, doc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocKey {
    pub segment: u32,
    pub doc: u32,
}

impl DocKey {
    /// Placeholder used by sentinel collector entries.
    pub const SENTINEL: DocKey = DocKey {
        segment: u32::MAX,
        doc: u32::MAX,
    };
}

/// One scored search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredHit {
    pub doc: DocKey,
    pub score: f32,
}

/// Ordered, scored hit collection returned by every search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hits {
    pub entries: Vec<ScoredHit>,
}

impl Hits {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredHit> {
        self.entries.iter()
    }
}

/// Document shape accepted by [`IndexStore::add_document`] and returned by
/// [`IndexStore::get_document`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDoc {
    pub pk: String,
    pub smiles: String,
    pub names: Vec<String>,
    /// Set bit positions of the structure fingerprint; indexed, never
    /// stored, so they come back empty from [`IndexStore::get_document`].
    pub fp_bits: Vec<u32>,
    pub props: BTreeMap<String, String>,
}

/// Term-queryable raw fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocField {
    Pk,
    Smiles,
    Name,
}

/// Query primitives the store executes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreQuery<'a> {
    /// Exact term on one raw field.
    Term { field: DocField, value: &'a str },
    /// `name:x OR pk:x`, the name-or-identifier lookup.
    NameOrPk(&'a str),
    /// Documents whose fingerprint contains every listed bit.
    FpSuperset(&'a [u32]),
    /// Parsed multi-field query over every indexed field.
    Free(&'a str),
}

struct FieldSet {
    pk: Field,
    smiles: Field,
    fp: Field,
    name: Field,
    props: Field,
}

enum State {
    Closed,
    Writing {
        index: Index,
        fields: FieldSet,
        writer: IndexWriter,
    },
    Searching {
        index: Index,
        fields: FieldSet,
        reader: IndexReader,
    },
    Shutdown,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Writing { .. } => "writing",
            State::Searching { .. } => "searching",
            State::Shutdown => "shutdown",
        }
    }
}

pub struct IndexStore {
    dir: PathBuf,
    writer_memory: usize,
    state: Mutex<State>,
}

impl IndexStore {
    /// Bind to a storage directory. No IO happens until the first
    /// operation opens a writer or searcher.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        IndexStore {
            dir: dir.into(),
            writer_memory: DEFAULT_WRITER_MEMORY_BYTES,
            state: Mutex::new(State::Closed),
        }
    }

    pub fn with_writer_memory(mut self, bytes: usize) -> Self {
        self.writer_memory = bytes;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(*self.lock_state(), State::Shutdown)
    }

    /// Delete every document whose `field` equals `value`.
    pub fn delete_by_term(&self, field: DocField, value: &str) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        let (_, fields, writer) = Self::ensure_writing(&mut state, &self.dir, self.writer_memory)?;
        let term = Term::from_field_text(raw_field(fields, field), value);
        writer.delete_term(term);
        Ok(())
    }

    pub fn add_document(&self, doc: &IndexDoc) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        let (index, _, writer) = Self::ensure_writing(&mut state, &self.dir, self.writer_memory)?;
        let json = doc_to_json(doc);
        let schema = index.schema();
        let tantivy_doc = TantivyDocument::parse_json(&schema, &json.to_string())
            .map_err(|e| StoreError::DocParse(e.to_string()))?;
        writer.add_document(tantivy_doc)?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        match &mut *state {
            State::Writing { writer, .. } => {
                writer.commit()?;
                Ok(())
            }
            State::Shutdown => Err(StoreError::Shutdown),
            // Nothing pending.
            _ => Ok(()),
        }
    }

    /// Drop uncommitted changes, leaving the committed index untouched.
    pub fn rollback(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        match &mut *state {
            State::Writing { writer, .. } => {
                writer.rollback()?;
                Ok(())
            }
            State::Shutdown => Err(StoreError::Shutdown),
            _ => Ok(()),
        }
    }

    pub fn search(&self, query: &StoreQuery<'_>, max_hits: usize) -> Result<Hits, StoreError> {
        if max_hits == 0 {
            return Ok(Hits::default());
        }
        let mut state = self.lock_state();
        let (index, fields, reader) = Self::ensure_searching(&mut state, &self.dir)?;
        let searcher = reader.searcher();
        let parsed = build_query(index, fields, query)?;
        let top = searcher.search(&parsed, &TopDocs::with_limit(max_hits))?;
        let entries = top
            .into_iter()
            .map(|(score, address)| ScoredHit {
                doc: DocKey {
                    segment: address.segment_ord,
                    doc: address.doc_id,
                },
                score,
            })
            .collect();
        Ok(Hits { entries })
    }

    pub fn get_document(&self, key: DocKey) -> Result<IndexDoc, StoreError> {
        let mut state = self.lock_state();
        let (_, fields, reader) = Self::ensure_searching(&mut state, &self.dir)?;
        let searcher = reader.searcher();
        let doc: TantivyDocument = searcher.doc(DocAddress::new(key.segment, key.doc))?;

        let first_text = |field: Field| -> String {
            doc.get_first(field)
                .and_then(owned_str)
                .unwrap_or_default()
        };
        let mut out = IndexDoc {
            pk: first_text(fields.pk),
            smiles: first_text(fields.smiles),
            ..IndexDoc::default()
        };
        for value in doc.get_all(fields.name) {
            if let Some(s) = owned_str(value) {
                out.names.push(s);
            }
        }
        if let Some(OwnedValue::Object(entries)) = doc.get_first(fields.props) {
            for (prop, value) in entries {
                if let Some(s) = owned_str(value) {
                    out.props.insert(prop.to_string(), s);
                }
            }
        }
        Ok(out)
    }

    pub fn num_docs(&self) -> Result<u64, StoreError> {
        let mut state = self.lock_state();
        let (_, _, reader) = Self::ensure_searching(&mut state, &self.dir)?;
        Ok(reader.searcher().num_docs())
    }

    /// Close whichever side is open; a writer commits first.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, State::Closed) {
            State::Writing { mut writer, .. } => {
                writer.commit()?;
                Ok(())
            }
            State::Shutdown => {
                *state = State::Shutdown;
                Err(StoreError::Shutdown)
            }
            _ => Ok(()),
        }
    }

    /// Terminal. Pending writes are committed; every later operation fails
    /// with [`StoreError::Shutdown`].
    pub fn shutdown(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        let previous = std::mem::replace(&mut *state, State::Shutdown);
        info!(from = previous.name(), "index store shut down");
        if let State::Writing { mut writer, .. } = previous {
            writer.commit()?;
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_writing<'s>(
        state: &'s mut State,
        dir: &Path,
        writer_memory: usize,
    ) -> Result<(&'s Index, &'s FieldSet, &'s mut IndexWriter), StoreError> {
        match state {
            State::Shutdown => return Err(StoreError::Shutdown),
            State::Writing { .. } => {}
            _ => {
                // Leaving `searching` drops the reader before the writer
                // opens.
                *state = State::Closed;
                let index = open_or_create(dir)?;
                let fields = resolve_fields(&index)?;
                let writer: IndexWriter = index.writer(writer_memory)?;
                debug!(dir = %dir.display(), "index writer opened");
                *state = State::Writing {
                    index,
                    fields,
                    writer,
                };
            }
        }
        match state {
            State::Writing {
                index,
                fields,
                writer,
            } => Ok((index, fields, writer)),
            _ => Err(StoreError::Shutdown),
        }
    }

    fn ensure_searching<'s>(
        state: &'s mut State,
        dir: &Path,
    ) -> Result<(&'s Index, &'s FieldSet, &'s IndexReader), StoreError> {
        match state {
            State::Shutdown => return Err(StoreError::Shutdown),
            State::Searching { .. } => {}
            _ => {
                // A writer commits on the way out.
                if let State::Writing { writer, .. } =
                    std::mem::replace(&mut *state, State::Closed)
                {
                    let mut writer = writer;
                    writer.commit()?;
                }
                if !dir.join("meta.json").exists() {
                    return Err(StoreError::NoIndexYet);
                }
                let index = Index::open_in_dir(dir)?;
                let fields = resolve_fields(&index)?;
                let reader = index.reader()?;
                debug!(dir = %dir.display(), "index searcher opened");
                *state = State::Searching {
                    index,
                    fields,
                    reader,
                };
            }
        }
        match state {
            State::Searching {
                index,
                fields,
                reader,
            } => Ok((index, fields, reader)),
            _ => Err(StoreError::Shutdown),
        }
    }
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field(FIELD_PK, STRING | STORED);
    builder.add_text_field(FIELD_SMILES, STRING | STORED);
    builder.add_text_field(FIELD_FP, STRING);
    builder.add_text_field(FIELD_NAME, STRING | STORED);
    let props_options = JsonObjectOptions::default().set_stored().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("raw")
            .set_index_option(IndexRecordOption::Basic),
    );
    builder.add_json_field(FIELD_PROPS, props_options);
    builder.build()
}

fn open_or_create(dir: &Path) -> Result<Index, StoreError> {
    std::fs::create_dir_all(dir)?;
    if dir.join("meta.json").exists() {
        Ok(Index::open_in_dir(dir)?)
    } else {
        Ok(Index::create_in_dir(dir, build_schema())?)
    }
}

fn resolve_fields(index: &Index) -> Result<FieldSet, StoreError> {
    let schema = index.schema();
    Ok(FieldSet {
        pk: schema.get_field(FIELD_PK)?,
        smiles: schema.get_field(FIELD_SMILES)?,
        fp: schema.get_field(FIELD_FP)?,
        name: schema.get_field(FIELD_NAME)?,
        props: schema.get_field(FIELD_PROPS)?,
    })
}

fn raw_field(fields: &FieldSet, field: DocField) -> Field {
    match field {
        DocField::Pk => fields.pk,
        DocField::Smiles => fields.smiles,
        DocField::Name => fields.name,
    }
}

fn doc_to_json(doc: &IndexDoc) -> serde_json::Value {
    let fp_tokens: Vec<String> = doc.fp_bits.iter().map(u32::to_string).collect();
    serde_json::json!({
        FIELD_PK: doc.pk,
        FIELD_SMILES: doc.smiles,
        FIELD_NAME: doc.names,
        FIELD_FP: fp_tokens,
        FIELD_PROPS: doc.props,
    })
}

fn owned_str(value: &OwnedValue) -> Option<String> {
    match value {
        OwnedValue::Str(s) => Some(s.clone()),
        _ => None,
    }
}

fn build_query(
    index: &Index,
    fields: &FieldSet,
    query: &StoreQuery<'_>,
) -> Result<Box<dyn Query>, StoreError> {
    match query {
        StoreQuery::Term { field, value } => {
            let term = Term::from_field_text(raw_field(fields, *field), value);
            Ok(Box::new(TermQuery::new(term, IndexRecordOption::Basic)))
        }
        StoreQuery::NameOrPk(value) => {
            let name = TermQuery::new(
                Term::from_field_text(fields.name, value),
                IndexRecordOption::Basic,
            );
            let pk = TermQuery::new(
                Term::from_field_text(fields.pk, value),
                IndexRecordOption::Basic,
            );
            Ok(Box::new(BooleanQuery::new(vec![
                (Occur::Should, Box::new(name) as Box<dyn Query>),
                (Occur::Should, Box::new(pk) as Box<dyn Query>),
            ])))
        }
        StoreQuery::FpSuperset(bits) => {
            let clauses: Vec<(Occur, Box<dyn Query>)> = bits
                .iter()
                .map(|bit| {
                    let term = Term::from_field_text(fields.fp, &bit.to_string());
                    (
                        Occur::Must,
                        Box::new(TermQuery::new(term, IndexRecordOption::Basic))
                            as Box<dyn Query>,
                    )
                })
                .collect();
            Ok(Box::new(BooleanQuery::new(clauses)))
        }
        StoreQuery::Free(text) => {
            // Union of all indexed fields, discovered from the schema.
            let default_fields = vec![fields.pk, fields.smiles, fields.fp, fields.name, fields.props];
            let parser = QueryParser::for_index(index, default_fields);
            parser
                .parse_query(text)
                .map_err(|e| StoreError::QueryParse(e.to_string()))
        }
    }
}
