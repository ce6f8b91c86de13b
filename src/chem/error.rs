//! Error surface of the chemistry toolkit.

use thiserror::Error;

/// Failures reported by the chemistry toolkit, tagged by origin so callers
/// can distinguish bad input from a toolkit defect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChemError {
    /// The input text is not a valid structure.
    #[error("structure parse failure: {0}")]
    Parse(String),
    /// The structure parsed but failed sanitization (valence screening,
    /// ring perception preconditions).
    #[error("sanitization failure: {0}")]
    Sanitize(String),
    /// The toolkit itself misbehaved; also covers operations on a released
    /// molecule handle.
    #[error("toolkit internal error: {0}")]
    Internal(String),
}

impl ChemError {
    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        ChemError::Parse(msg.into())
    }

    pub(crate) fn sanitize(msg: impl Into<String>) -> Self {
        ChemError::Sanitize(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        ChemError::Internal(msg.into())
    }
}
