//! Whole-program lowering passes for the mote compiler.
//!
//! The passes turn a linked [`mote_ir::Module`] full of high-level
//! constructs into plain IR a code generator can consume directly:
//!
//! ```text
//! Module
//!     │
//!     ▼
//! interface     ──► MethodTable (kept in the PassContext)
//!     │
//!     ▼
//! func-values
//!     │
//!     ▼
//! concurrency   (Tasks or Coroutines)
//!     │
//!     ▼
//! gc-roots      ──► RootTable (attached to the module)
//!     │
//!     ▼
//! dce
//! ```
//!
//! Each pass is a [`PassDescriptor`] run by a [`Pipeline`]. Any single pass
//! or prefix runs in isolation, which is how the [`golden`] fixtures test
//! them.

pub mod concurrency;
pub mod config;
pub mod context;
pub mod dce;
mod edit;
pub mod error;
pub mod func_value;
pub mod gc_roots;
pub mod golden;
pub mod interface;
pub mod pipeline;
pub mod runtime;

#[cfg(test)]
mod test_helpers;

pub use config::{Scheduler, TargetConfig, UnknownScheduler};
pub use context::PassContext;
pub use error::{ErrorKind, LowerError, LowerResult};
pub use gc_roots::RootRegistry;
pub use interface::{DispatchKind, MethodTable, MethodTableBuilder};
pub use pipeline::{PassDescriptor, PassReport, Pipeline, PipelineError, PipelineReport};
pub use runtime::RuntimeFn;
