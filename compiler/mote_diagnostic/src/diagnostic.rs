//! Core diagnostic types.

use std::fmt;

use mote_ir::DebugLoc;

use crate::ErrorCode;

/// Severity level for diagnostics.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Note => write!(f, "note"),
        }
    }
}

/// A compiler diagnostic.
///
/// Built with the `with_*` methods:
///
/// ```text
/// Diagnostic::error(ErrorCode::E2001)
///     .with_message("blocking operation in interrupt handler")
///     .with_location(loc)
///     .with_note("in function @isr")
/// ```
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
#[must_use = "diagnostics should be reported or returned, not silently dropped"]
pub struct Diagnostic {
    /// Error code for searchability.
    pub code: ErrorCode,
    pub severity: Severity,
    /// Main error message.
    pub message: String,
    /// Source position, when the offending construct carries one.
    pub location: Option<DebugLoc>,
    /// Input file the diagnostic belongs to, when there is no `!loc`.
    pub file: Option<String>,
    /// Additional context (function, instruction, pass).
    pub notes: Vec<String>,
}

impl Diagnostic {
    fn new_with_severity(code: ErrorCode, severity: Severity) -> Self {
        Diagnostic {
            code,
            severity,
            message: String::new(),
            location: None,
            file: None,
            notes: Vec::new(),
        }
    }

    /// Create a new error diagnostic.
    #[cold]
    pub fn error(code: ErrorCode) -> Self {
        Self::new_with_severity(code, Severity::Error)
    }

    /// Create a new warning diagnostic.
    #[cold]
    pub fn warning(code: ErrorCode) -> Self {
        Self::new_with_severity(code, Severity::Warning)
    }

    /// Set the main message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_location(mut self, location: Option<DebugLoc>) -> Self {
        self.location = location;
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Add a note providing additional context.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Check if this is an error (vs warning/note).
    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }

    /// `(file, line, column)` used to order diagnostics. Diagnostics without
    /// a position sort after positioned ones of the same file.
    pub(crate) fn sort_key(&self) -> (String, u32, u32) {
        match (&self.location, &self.file) {
            (Some(loc), _) => (loc.file.clone(), loc.line, loc.column),
            (None, Some(file)) => (file.clone(), u32::MAX, u32::MAX),
            (None, None) => (String::new(), u32::MAX, u32::MAX),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.severity, self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let loc = DebugLoc {
            file: "main.go".into(),
            line: 4,
            column: 2,
        };
        let diag = Diagnostic::error(ErrorCode::E1002)
            .with_message("capture out of range")
            .with_location(Some(loc.clone()))
            .with_note("in function @f");
        assert!(diag.is_error());
        assert_eq!(diag.location, Some(loc));
        assert_eq!(diag.notes, vec!["in function @f".to_string()]);
        assert_eq!(diag.to_string(), "error[E1002]: capture out of range");
    }

    #[test]
    fn unpositioned_sorts_last() {
        let positioned = Diagnostic::error(ErrorCode::E0001)
            .with_location(Some(DebugLoc {
                file: "a".into(),
                line: 9,
                column: 1,
            }))
            .sort_key();
        let unpositioned = Diagnostic::error(ErrorCode::E0001).with_file("a").sort_key();
        assert!(positioned < unpositioned);
    }
}
