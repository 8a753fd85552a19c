//! Diagnostic system for compiler error reporting.
//!
//! Every failure the compiler can report becomes a [`Diagnostic`]:
//! - Error codes for searchability
//! - A one-line message (what went wrong)
//! - An optional source location (where it went wrong)
//! - Notes (the offending function, instruction or pass)
//!
//! # Error Guarantees
//!
//! [`ErrorGuaranteed`] is type-level proof that at least one error was
//! emitted into a [`DiagnosticQueue`]. Driver stages return it instead of
//! `()` so a failure can never be silently swallowed.
//!
//! ```text
//! let guarantee = queue.emit_error(diagnostic);
//! fn load() -> Result<Module, ErrorGuaranteed> { ... }
//! ```

mod diagnostic;
pub mod emitter;
mod error_code;
mod guarantee;
pub mod queue;

pub use diagnostic::{Diagnostic, Severity};
pub use error_code::ErrorCode;
pub use guarantee::ErrorGuaranteed;
pub use queue::DiagnosticQueue;
