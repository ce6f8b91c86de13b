//! Engine configuration.
//!
//! Typed settings with defaults and builder methods, plus [`EngineConfig::from_map`]
//! for the external properties-parser collaborator, which hands over plain
//! string options. Recognized keys:
//!
//! | key | effect |
//! |-----|--------|
//! | `fingerprint.kind` | `avalon` or `linear`, for both settings objects |
//! | `fingerprint.width` | bit vector width (default 512) |
//! | `fingerprint.avalon_bit_flags` | bit-class selector mask |
//! | `query.avalon_query_flag` | 1 restricts the query side to monotone classes |
//! | `ingest.consecutive_error_limit` | abort budget (default 100) |
//! | `cleanup.quarantine_delay_ms` | deferred release delay (default 60000) |
//! | `substructure.candidate_cap` | overrides `min(10 × max_hits, 100000)` |
//! | `index.writer_memory_bytes` | index writer heap budget |
//!
//! Unknown keys are logged and ignored, so old option files keep loading.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::fingerprint::{FingerprintKind, FingerprintSettings};

pub const DEFAULT_CONSECUTIVE_ERROR_LIMIT: u64 = 100;
pub const DEFAULT_QUARANTINE_DELAY_MS: u64 = 60_000;
pub const DEFAULT_WRITER_MEMORY_BYTES: usize = 50_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("unknown fingerprint kind '{0}'")]
    UnknownKind(String),
    #[error("invalid value '{value}' for option '{key}'")]
    InvalidValue { key: String, value: String },
}

/// The settings pair driving the fingerprint engine. Changing any of these
/// on an existing index requires a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintPairConfig {
    pub structure: FingerprintSettings,
    pub query: FingerprintSettings,
}

impl Default for FingerprintPairConfig {
    fn default() -> Self {
        FingerprintPairConfig {
            structure: FingerprintSettings::structure(),
            query: FingerprintSettings::query(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestTuning {
    /// Ingest aborts once this many consecutive records fail.
    pub consecutive_error_limit: u64,
}

impl Default for IngestTuning {
    fn default() -> Self {
        IngestTuning {
            consecutive_error_limit: DEFAULT_CONSECUTIVE_ERROR_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupTuning {
    /// Delay before a quarantined sweep releases its snapshot.
    pub quarantine_delay_ms: u64,
}

impl Default for CleanupTuning {
    fn default() -> Self {
        CleanupTuning {
            quarantine_delay_ms: DEFAULT_QUARANTINE_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstructureTuning {
    /// Fixed candidate-stage cap; `None` keeps the per-query formula.
    pub candidate_cap: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTuning {
    pub writer_memory_bytes: usize,
}

impl Default for IndexTuning {
    fn default() -> Self {
        IndexTuning {
            writer_memory_bytes: DEFAULT_WRITER_MEMORY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub fingerprint: FingerprintPairConfig,
    pub ingest: IngestTuning,
    pub cleanup: CleanupTuning,
    pub substructure: SubstructureTuning,
    pub index: IndexTuning,
}

impl EngineConfig {
    /// Apply recognized options from a string map over the defaults.
    pub fn from_map(options: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = EngineConfig::default();
        for (key, value) in options {
            match key.as_str() {
                "fingerprint.kind" => {
                    let kind = match value.to_ascii_lowercase().as_str() {
                        "avalon" => FingerprintKind::Avalon,
                        "linear" => FingerprintKind::Linear,
                        _ => return Err(ConfigError::UnknownKind(value.clone())),
                    };
                    config.fingerprint.structure.kind = kind;
                    config.fingerprint.query.kind = kind;
                }
                "fingerprint.width" => {
                    let width = parse_number(key, value)?;
                    config.fingerprint.structure.width = width;
                    config.fingerprint.query.width = width;
                }
                "fingerprint.avalon_bit_flags" => {
                    let flags = parse_number(key, value)?;
                    config.fingerprint.structure.avalon_bit_flags = flags;
                    config.fingerprint.query.avalon_bit_flags = flags;
                }
                "query.avalon_query_flag" => {
                    let flag: u32 = parse_number(key, value)?;
                    config.fingerprint.query.avalon_query_flag = flag != 0;
                }
                "ingest.consecutive_error_limit" => {
                    config.ingest.consecutive_error_limit = parse_number(key, value)?;
                }
                "cleanup.quarantine_delay_ms" => {
                    config.cleanup.quarantine_delay_ms = parse_number(key, value)?;
                }
                "substructure.candidate_cap" => {
                    config.substructure.candidate_cap = Some(parse_number(key, value)?);
                }
                "index.writer_memory_bytes" => {
                    config.index.writer_memory_bytes = parse_number(key, value)?;
                }
                _ => {
                    warn!(option = %key, "unrecognized option ignored");
                }
            }
        }
        Ok(config)
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = EngineConfig::default();
        assert_eq!(config.fingerprint.structure.width, 512);
        assert!(!config.fingerprint.structure.avalon_query_flag);
        assert!(config.fingerprint.query.avalon_query_flag);
        assert_eq!(config.ingest.consecutive_error_limit, 100);
        assert_eq!(config.cleanup.quarantine_delay_ms, 60_000);
        assert_eq!(config.substructure.candidate_cap, None);
    }

    #[test]
    fn from_map_applies_recognized_options() {
        let options = BTreeMap::from([
            ("fingerprint.kind".to_string(), "linear".to_string()),
            ("fingerprint.width".to_string(), "1024".to_string()),
            ("query.avalon_query_flag".to_string(), "0".to_string()),
            ("ingest.consecutive_error_limit".to_string(), "5".to_string()),
            ("cleanup.quarantine_delay_ms".to_string(), "250".to_string()),
            ("substructure.candidate_cap".to_string(), "5000".to_string()),
            ("definitely.not.an.option".to_string(), "x".to_string()),
        ]);
        let config = EngineConfig::from_map(&options).unwrap();
        assert_eq!(config.fingerprint.structure.kind, FingerprintKind::Linear);
        assert_eq!(config.fingerprint.query.width, 1024);
        assert!(!config.fingerprint.query.avalon_query_flag);
        assert_eq!(config.ingest.consecutive_error_limit, 5);
        assert_eq!(config.cleanup.quarantine_delay_ms, 250);
        assert_eq!(config.substructure.candidate_cap, Some(5000));
    }

    #[test]
    fn bad_values_are_rejected() {
        let options = BTreeMap::from([("fingerprint.width".to_string(), "wide".to_string())]);
        assert!(matches!(
            EngineConfig::from_map(&options),
            Err(ConfigError::InvalidValue { .. })
        ));

        let options = BTreeMap::from([("fingerprint.kind".to_string(), "morgan".to_string())]);
        assert!(matches!(
            EngineConfig::from_map(&options),
            Err(ConfigError::UnknownKind(_))
        ));
    }

    #[test]
    fn config_serializes_roundtrip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
