use std::ops::Range;

use codespan_reporting::diagnostic::{Diagnostic, Label, Severity};

/// What went wrong while compiling a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed tag, expression, or block nesting.
    Syntax,
    /// A cache or uncached block placed where caching is not allowed
    /// (inside a loop or conditional).
    Structural,
}

/// Compile errors with source location information.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Range<usize>,
    pub file_id: usize,
    pub severity: Severity,
    pub kind: ErrorKind,
    pub notes: Vec<String>,
}

impl ParseError {
    pub fn error(message: impl Into<String>, span: Range<usize>, file_id: usize) -> Self {
        ParseError {
            message: message.into(),
            span,
            file_id,
            severity: Severity::Error,
            kind: ErrorKind::Syntax,
            notes: Vec::new(),
        }
    }

    pub fn structural(message: impl Into<String>, span: Range<usize>, file_id: usize) -> Self {
        ParseError {
            kind: ErrorKind::Structural,
            ..ParseError::error(message, span, file_id)
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_structural(&self) -> bool {
        self.kind == ErrorKind::Structural
    }

    /// Convert to a codespan-reporting Diagnostic for display.
    pub fn to_diagnostic(&self) -> Diagnostic<usize> {
        let code = match self.kind {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Structural => "structure",
        };
        Diagnostic::new(self.severity)
            .with_code(code)
            .with_message(&self.message)
            .with_labels(vec![Label::primary(self.file_id, self.span.clone())])
            .with_notes(self.notes.clone())
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (at {}..{})", self.message, self.span.start, self.span.end)
    }
}

impl std::error::Error for ParseError {}
