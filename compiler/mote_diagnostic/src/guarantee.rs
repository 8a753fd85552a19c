use std::fmt;

/// Proof that at least one error diagnostic was emitted.
///
/// Only [`DiagnosticQueue`](crate::DiagnosticQueue) can create one through
/// the public API, so holding an `ErrorGuaranteed` means the failure has
/// been reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ErrorGuaranteed(());

impl ErrorGuaranteed {
    pub(crate) fn new() -> Self {
        ErrorGuaranteed(())
    }

    /// Proof from an error count, when the caller has counted errors that
    /// were already reported elsewhere.
    pub fn from_error_count(count: usize) -> Option<Self> {
        (count > 0).then(Self::new)
    }
}

impl fmt::Display for ErrorGuaranteed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("error(s) emitted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_error_count_returns_some_for_nonzero() {
        assert!(ErrorGuaranteed::from_error_count(1).is_some());
        assert!(ErrorGuaranteed::from_error_count(100).is_some());
    }

    #[test]
    fn from_error_count_returns_none_for_zero() {
        assert!(ErrorGuaranteed::from_error_count(0).is_none());
    }

    #[test]
    fn display_shows_error_message() {
        let g = ErrorGuaranteed::new();
        assert_eq!(g.to_string(), "error(s) emitted");
    }
}
