use std::fmt;

/// Error codes for all compiler diagnostics.
///
/// Format: E#### where the first digit indicates the kind:
/// - E0xxx: Input errors (IR syntax, linking, reading files)
/// - E1xxx: Malformed input (IR violates an invariant a pass relies on)
/// - E2xxx: Unsupported constructs (the selected lowering cannot express it)
/// - E9xxx: Internal compiler errors
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ErrorCode {
    // Input Errors (E0xxx)
    /// IR syntax error
    E0001,
    /// Conflicting definitions across packages
    E0002,
    /// Input file could not be read or output could not be written
    E0003,
    /// Invalid command-line option
    E0004,

    // Malformed Input (E1xxx)
    /// Module fails structural verification
    E1001,
    /// Instruction violates a lowering pass's input contract
    E1002,

    // Unsupported Constructs (E2xxx)
    /// Construct cannot be expressed by the selected lowering strategy
    E2001,

    // Internal Errors (E9xxx)
    /// Pass invariant broken (precondition, postcondition or failure contract)
    E9001,
    /// Too many errors
    E9002,
}

impl ErrorCode {
    pub const ALL: &'static [ErrorCode] = &[
        ErrorCode::E0001,
        ErrorCode::E0002,
        ErrorCode::E0003,
        ErrorCode::E0004,
        ErrorCode::E1001,
        ErrorCode::E1002,
        ErrorCode::E2001,
        ErrorCode::E9001,
        ErrorCode::E9002,
    ];

    /// Check if this is an input error (E0xxx range).
    pub fn is_input_error(&self) -> bool {
        self.as_str().starts_with("E0")
    }

    /// Check if this is a malformed-input error (E1xxx range).
    pub fn is_malformed_input(&self) -> bool {
        self.as_str().starts_with("E1")
    }

    /// Check if this is an unsupported-construct error (E2xxx range).
    pub fn is_unsupported(&self) -> bool {
        self.as_str().starts_with("E2")
    }

    /// Check if this is an internal compiler error (E9xxx range).
    pub fn is_internal(&self) -> bool {
        self.as_str().starts_with("E9")
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::E0001 => "E0001",
            ErrorCode::E0002 => "E0002",
            ErrorCode::E0003 => "E0003",
            ErrorCode::E0004 => "E0004",
            ErrorCode::E1001 => "E1001",
            ErrorCode::E1002 => "E1002",
            ErrorCode::E2001 => "E2001",
            ErrorCode::E9001 => "E9001",
            ErrorCode::E9002 => "E9002",
        }
    }

    /// Short description of what the code means.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::E0001 => "IR syntax error",
            ErrorCode::E0002 => "conflicting definitions across packages",
            ErrorCode::E0003 => "I/O error",
            ErrorCode::E0004 => "invalid command-line option",
            ErrorCode::E1001 => "module fails verification",
            ErrorCode::E1002 => "malformed input to a lowering pass",
            ErrorCode::E2001 => "unsupported construct",
            ErrorCode::E9001 => "internal compiler error",
            ErrorCode::E9002 => "too many errors",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
