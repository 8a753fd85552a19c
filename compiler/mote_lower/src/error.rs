//! Lowering failures.
//!
//! Every pass reports failures as a [`LowerError`]. The [`ErrorKind`] says
//! whose fault it is: the input's (malformed), the target's (unsupported) or
//! the compiler's (internal). The driver turns errors into diagnostics with
//! [`LowerError::to_diagnostic`].

use std::fmt;

use mote_diagnostic::{Diagnostic, ErrorCode};
use mote_ir::{inst_to_string, Body, DebugLoc, Inst, LayoutOverflow, VerifyError};

/// Classification of a lowering failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The IR violates an invariant the pass relies on.
    MalformedInput,
    /// The selected lowering strategy cannot express the input.
    UnsupportedConstruct,
    /// A pass broke one of its own invariants.
    InternalConsistency,
}

impl ErrorKind {
    pub fn code(self) -> ErrorCode {
        match self {
            ErrorKind::MalformedInput => ErrorCode::E1002,
            ErrorKind::UnsupportedConstruct => ErrorCode::E2001,
            ErrorKind::InternalConsistency => ErrorCode::E9001,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::MalformedInput => "malformed input",
            ErrorKind::UnsupportedConstruct => "unsupported construct",
            ErrorKind::InternalConsistency => "internal consistency failure",
        })
    }
}

/// A structured lowering failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct LowerError {
    pub kind: ErrorKind,
    pub message: String,
    /// Pass that reported the failure; filled in by the pipeline runner.
    pub pass: Option<&'static str>,
    pub function: Option<String>,
    /// The offending instruction, printed in module syntax.
    pub instruction: Option<String>,
    pub loc: Option<DebugLoc>,
}

pub type LowerResult<T> = Result<T, LowerError>;

impl From<LayoutOverflow> for LowerError {
    fn from(err: LayoutOverflow) -> Self {
        LowerError::malformed(err.to_string())
    }
}

impl LowerError {
    #[cold]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        LowerError {
            kind,
            message: message.into(),
            pass: None,
            function: None,
            instruction: None,
            loc: None,
        }
    }

    #[cold]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedInput, message)
    }

    #[cold]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedConstruct, message)
    }

    #[cold]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalConsistency, message)
    }

    /// Wrap a verifier failure as an internal error of the current pass.
    pub fn from_verify(err: &VerifyError) -> Self {
        let mut lowered = Self::internal(format!("module verification failed: {}", err.message));
        lowered.function.clone_from(&err.function);
        lowered
    }

    #[must_use]
    pub fn in_function(mut self, name: &str) -> Self {
        if self.function.is_none() {
            self.function = Some(name.to_owned());
        }
        self
    }

    /// Attach the offending instruction and its location.
    #[must_use]
    pub fn at_inst(mut self, body: &Body, inst: &Inst) -> Self {
        let bare = Inst::new(inst.result, inst.kind.clone());
        self.instruction = Some(inst_to_string(body, &bare));
        if self.loc.is_none() {
            self.loc.clone_from(&inst.loc);
        }
        self
    }

    /// Attach an already printed instruction.
    #[must_use]
    pub fn with_instruction(mut self, text: impl Into<String>) -> Self {
        if self.instruction.is_none() {
            self.instruction = Some(text.into());
        }
        self
    }

    #[must_use]
    pub fn with_loc(mut self, loc: Option<DebugLoc>) -> Self {
        if self.loc.is_none() {
            self.loc = loc;
        }
        self
    }

    #[must_use]
    pub fn in_pass(mut self, pass: &'static str) -> Self {
        if self.pass.is_none() {
            self.pass = Some(pass);
        }
        self
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut diag = Diagnostic::error(self.kind.code())
            .with_message(&self.message)
            .with_location(self.loc.clone());
        if let Some(function) = &self.function {
            diag = diag.with_note(format!("in function @{function}"));
        }
        if let Some(inst) = &self.instruction {
            diag = diag.with_note(format!("instruction: `{inst}`"));
        }
        if let Some(pass) = self.pass {
            diag = diag.with_note(format!("during pass `{pass}`"));
        }
        diag
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mote_ir::parse_module;

    use super::*;

    #[test]
    fn diagnostic_carries_context() {
        let module = parse_module(
            "define void @isr() {\nentry:\n  sleep i64 5 !loc(\"isr.go\", 7, 3)\n  ret void\n}\n",
        )
        .unwrap();
        let body = module.functions[0].body.as_ref().unwrap();
        let inst = &body.blocks[0].insts[0];
        let err = LowerError::unsupported("blocking operation in interrupt handler")
            .at_inst(body, inst)
            .in_function("isr")
            .in_pass("concurrency");

        assert_eq!(
            err.to_string(),
            "unsupported construct: blocking operation in interrupt handler"
        );
        let diag = err.to_diagnostic();
        assert_eq!(diag.code, ErrorCode::E2001);
        assert_eq!(diag.location.as_ref().map(|l| l.line), Some(7));
        assert_eq!(
            diag.notes,
            vec![
                "in function @isr".to_string(),
                "instruction: `sleep i64 5`".to_string(),
                "during pass `concurrency`".to_string(),
            ]
        );
    }

    #[test]
    fn first_context_wins() {
        let err = LowerError::malformed("x").in_function("a").in_function("b");
        assert_eq!(err.function.as_deref(), Some("a"));
    }

    #[test]
    fn kinds_map_to_code_ranges() {
        assert!(ErrorKind::MalformedInput.code().is_malformed_input());
        assert!(ErrorKind::UnsupportedConstruct.code().is_unsupported());
        assert!(ErrorKind::InternalConsistency.code().is_internal());
    }
}
