//! Error types for row decoding.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors produced while decoding collaborator rows.
///
/// Rows arrive from the persistence collaborator as loosely-typed JSON
/// objects. Any defect fails the whole decode; a partially-populated
/// message is never produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The row was not a JSON object.
    #[error("expected a row object, got {0}")]
    NotAnObject(String),

    /// A required column was absent.
    #[error("missing column `{0}`")]
    MissingColumn(&'static str),

    /// A column held a value of an unexpected type or format.
    #[error("column `{column}` is invalid: {detail}")]
    InvalidColumn {
        /// Column name.
        column: &'static str,
        /// What was wrong with the value.
        detail: String,
    },
}

impl ModelError {
    /// Creates an invalid-column error.
    pub fn invalid_column(column: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidColumn {
            column,
            detail: detail.into(),
        }
    }
}
