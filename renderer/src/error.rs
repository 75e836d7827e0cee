use std::fmt;
use std::ops::Range;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A cache key or cache condition referenced a field the data context
    /// does not have. Never rendered as an empty key.
    #[error("undefined field: {0}")]
    UndefinedField(String),

    #[error("type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("cannot loop over {0}")]
    NotIterable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A render error or warning enriched with source location information.
#[derive(Debug)]
pub struct DiagnosticError {
    pub error: RuntimeError,
    pub span: Option<Range<usize>>,
    pub source_id: usize,
    pub is_warning: bool,
}

impl DiagnosticError {
    pub fn at(error: RuntimeError, span: Option<Range<usize>>, source_id: usize) -> Self {
        DiagnosticError {
            error,
            span,
            source_id,
            is_warning: false,
        }
    }

    /// Create a warning diagnostic, optionally pointing at a source span.
    pub fn warning(error: RuntimeError, span: Option<Range<usize>>, source_id: usize) -> Self {
        DiagnosticError {
            error,
            span,
            source_id,
            is_warning: true,
        }
    }
}

impl From<RuntimeError> for DiagnosticError {
    fn from(error: RuntimeError) -> Self {
        DiagnosticError {
            error,
            span: None,
            source_id: 0,
            is_warning: false,
        }
    }
}

impl fmt::Display for DiagnosticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for DiagnosticError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
