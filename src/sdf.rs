//! SD file record streaming.
//!
//! An SD file interleaves molblocks with named property sections, records
//! separated by `$$$$`. The reader is lazy: one record per `next()` call,
//! each carrying the raw molblock text, the parsed property map, and the
//! synthetic properties `dataset_name`, `line_number` (first line of the
//! record, 1-based), and `record_number`.
//!
//! Inputs whose name ends in `.gz` or `.zip` are treated as gzip streams.
//! Line endings are normalized to `\n` on the way in.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::warn;

/// Property key carrying the input name on every record.
pub const PROP_DATASET_NAME: &str = "dataset_name";
/// Property key carrying the record's starting line number.
pub const PROP_LINE_NUMBER: &str = "line_number";
/// Property key carrying the record's ordinal in the stream.
pub const PROP_RECORD_NUMBER: &str = "record_number";

const RECORD_TERMINATOR: &str = "$$$$";
const MOLBLOCK_END: &str = "M  END";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SdfError {
    #[error("sd file io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One SD record: raw molblock plus its property map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdfRecord {
    pub molblock: String,
    pub properties: BTreeMap<String, String>,
    pub line_number: u64,
    pub record_number: u64,
}

impl SdfRecord {
    /// Property lookup covering both file properties and the synthetic ones.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

pub struct SdfReader<R: BufRead> {
    input: R,
    dataset: String,
    next_line: u64,
    next_record: u64,
    finished: bool,
}

impl SdfReader<BufReader<Box<dyn Read + Send>>> {
    /// Open a file path, transparently decoding gzip when the name says so.
    pub fn open(path: &Path) -> Result<Self, SdfError> {
        let file = File::open(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let reader: Box<dyn Read + Send> = if is_compressed_name(&name) {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(SdfReader::from_reader(BufReader::new(reader), &name, 1))
    }
}

fn is_compressed_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".gz") || lower.ends_with(".zip")
}

impl<R: BufRead> SdfReader<R> {
    /// Wrap an arbitrary stream. `first_record_number` seeds the monotonic
    /// `record_number` property.
    pub fn from_reader(input: R, dataset: &str, first_record_number: u64) -> Self {
        SdfReader {
            input,
            dataset: dataset.to_string(),
            next_line: 1,
            next_record: first_record_number,
            finished: false,
        }
    }

    /// Read one `\n`-normalized line; `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>, SdfError> {
        let mut buf = String::new();
        let n = self.input.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.next_line += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn next_record(&mut self) -> Result<Option<SdfRecord>, SdfError> {
        if self.finished {
            return Ok(None);
        }
        let start_line = self.next_line;
        let mut region: Vec<String> = Vec::new();
        let mut saw_terminator = false;
        loop {
            match self.read_line()? {
                Some(line) => {
                    if line.trim() == RECORD_TERMINATOR {
                        saw_terminator = true;
                        break;
                    }
                    region.push(line);
                }
                None => {
                    self.finished = true;
                    break;
                }
            }
        }
        if !saw_terminator && region.iter().all(|l| l.trim().is_empty()) {
            // Trailing whitespace after the last record.
            return Ok(None);
        }

        let record_number = self.next_record;
        self.next_record += 1;

        let (molblock, mut properties) = split_region(&region, start_line);
        properties.insert(PROP_DATASET_NAME.to_string(), self.dataset.clone());
        properties.insert(PROP_LINE_NUMBER.to_string(), start_line.to_string());
        properties.insert(PROP_RECORD_NUMBER.to_string(), record_number.to_string());

        Ok(Some(SdfRecord {
            molblock,
            properties,
            line_number: start_line,
            record_number,
        }))
    }
}

impl<R: BufRead> Iterator for SdfReader<R> {
    type Item = Result<SdfRecord, SdfError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Split one record region into molblock text and property sections.
///
/// Without an `M  END` line the whole region is treated as molblock and the
/// property map stays empty. A property header missing its closing `>` is
/// skipped along with its value lines.
fn split_region(region: &[String], start_line: u64) -> (String, BTreeMap<String, String>) {
    let mut properties = BTreeMap::new();

    let end_idx = region
        .iter()
        .position(|line| line.trim_end() == MOLBLOCK_END || line.starts_with(MOLBLOCK_END));
    let Some(end_idx) = end_idx else {
        let mut molblock = region.join("\n");
        if !molblock.is_empty() {
            molblock.push('\n');
        }
        return (molblock, properties);
    };

    let mut molblock = region[..=end_idx].join("\n");
    molblock.push('\n');

    let mut idx = end_idx + 1;
    while idx < region.len() {
        let line = &region[idx];
        if !line.starts_with('>') {
            idx += 1;
            continue;
        }
        let name = property_name(line);
        let (value, consumed) = property_value(&region[idx + 1..]);
        match name {
            Some(name) => {
                properties.insert(name, value);
            }
            None => {
                warn!(
                    line = start_line + idx as u64,
                    header = %line,
                    "skipping property header without closing '>'"
                );
            }
        }
        idx += 1 + consumed;
    }

    (molblock, properties)
}

/// The property name is everything between the first `<` and the matching
/// `>` of the header line.
fn property_name(header: &str) -> Option<String> {
    let open = header.find('<')?;
    let close = header[open + 1..].find('>')?;
    Some(header[open + 1..open + 1 + close].to_string())
}

/// Collect value lines. A single blank line inside a value is preserved as
/// a padded blank; a blank line followed by a new section (or a second
/// blank) terminates the value.
fn property_value(lines: &[String]) -> (String, usize) {
    let mut value_lines: Vec<String> = Vec::new();
    let mut consumed = 0usize;
    while consumed < lines.len() {
        let line = &lines[consumed];
        if line.trim().is_empty() {
            match lines.get(consumed + 1) {
                Some(next) if !next.trim().is_empty() && !next.starts_with('>') => {
                    value_lines.push(" ".to_string());
                    consumed += 1;
                }
                _ => {
                    consumed += 1;
                    break;
                }
            }
        } else {
            value_lines.push(line.clone());
            consumed += 1;
        }
    }
    (value_lines.join("\n"), consumed)
}
