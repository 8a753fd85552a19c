//! Pass sequencing.
//!
//! A pass is a [`PassDescriptor`]: a name, a precondition, the transform, a
//! postcondition and the kinds of failure the transform may report. The
//! [`Pipeline`] runner executes descriptors in order against one module:
//!
//! 1. check the precondition
//! 2. snapshot the module and run the transform
//! 3. on failure restore the snapshot, so a failed pass is never partially
//!    applied, and stop
//! 4. check the postcondition (which always includes module verification)
//!
//! A failure outside the pass's contract, a failed precondition or a failed
//! postcondition is an internal-consistency failure naming the pass.
//!
//! Any single pass, prefix or named subsequence can be run in isolation,
//! which is how the golden fixtures exercise each pass on its own.

use std::fmt;
use std::time::{Duration, Instant};

use mote_diagnostic::{Diagnostic, ErrorCode};
use mote_ir::{inst_to_string, verify_module, InstKind, Module};
use tracing::{debug, info_span};

use crate::context::PassContext;
use crate::error::{ErrorKind, LowerError, LowerResult};
use crate::{concurrency, dce, func_value, gc_roots, interface};

/// Module predicate checked before or after a pass.
pub type Check = fn(&Module, &PassContext) -> Result<(), String>;

/// The transform itself.
pub type Transform = fn(&mut Module, &mut PassContext) -> LowerResult<()>;

/// One pass of the pipeline.
#[derive(Clone, Copy)]
pub struct PassDescriptor {
    pub name: &'static str,
    pub precondition: Check,
    pub run: Transform,
    /// Checked after module verification succeeds.
    pub postcondition: Check,
    /// Error kinds the transform may legitimately report.
    pub failures: &'static [ErrorKind],
}

impl fmt::Debug for PassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassDescriptor")
            .field("name", &self.name)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

/// Timing and size of one executed pass.
#[derive(Clone, Debug)]
pub struct PassReport {
    pub name: &'static str,
    pub elapsed: Duration,
    pub insts_before: usize,
    pub insts_after: usize,
}

/// What a pipeline run did.
#[derive(Clone, Debug, Default)]
pub struct PipelineReport {
    pub passes: Vec<PassReport>,
}

impl PipelineReport {
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name).collect()
    }
}

/// Failure of a pipeline run.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown pass `{name}` (available: {available})")]
    UnknownPass { name: String, available: String },
    #[error("cannot run the first {requested} passes of a {available}-pass pipeline")]
    PrefixTooLong { requested: usize, available: usize },
    #[error(transparent)]
    Pass(#[from] LowerError),
}

impl PipelineError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            PipelineError::Pass(err) => err.to_diagnostic(),
            other => Diagnostic::error(ErrorCode::E0004).with_message(other.to_string()),
        }
    }

    /// The pass failure, if this is one.
    pub fn as_lower_error(&self) -> Option<&LowerError> {
        match self {
            PipelineError::Pass(err) => Some(err),
            _ => None,
        }
    }
}

/// An ordered list of passes.
#[derive(Clone, Debug)]
pub struct Pipeline {
    passes: Vec<PassDescriptor>,
}

impl Pipeline {
    pub fn new(passes: Vec<PassDescriptor>) -> Self {
        Pipeline { passes }
    }

    /// Interface → function values → concurrency → GC roots → DCE.
    pub fn standard() -> Self {
        Pipeline::new(vec![
            interface::descriptor(),
            func_value::descriptor(),
            concurrency::descriptor(),
            gc_roots::descriptor(),
            dce::descriptor(),
        ])
    }

    pub fn passes(&self) -> &[PassDescriptor] {
        &self.passes
    }

    fn unknown(&self, name: &str) -> PipelineError {
        PipelineError::UnknownPass {
            name: name.to_owned(),
            available: self
                .passes
                .iter()
                .map(|p| p.name)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    fn position(&self, name: &str) -> Result<usize, PipelineError> {
        self.passes
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| self.unknown(name))
    }

    /// The named passes, in the order given.
    pub fn select(&self, names: &[&str]) -> Result<Pipeline, PipelineError> {
        let passes = names
            .iter()
            .map(|name| self.position(name).map(|i| self.passes[i]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pipeline::new(passes))
    }

    /// Run every pass in order.
    pub fn run(
        &self,
        module: &mut Module,
        ctx: &mut PassContext,
    ) -> Result<PipelineReport, PipelineError> {
        run_passes(&self.passes, module, ctx)
    }

    /// Run one pass in isolation.
    pub fn run_pass(
        &self,
        name: &str,
        module: &mut Module,
        ctx: &mut PassContext,
    ) -> Result<PipelineReport, PipelineError> {
        let index = self.position(name)?;
        run_passes(&self.passes[index..=index], module, ctx)
    }

    /// Run the first `count` passes.
    pub fn run_prefix(
        &self,
        count: usize,
        module: &mut Module,
        ctx: &mut PassContext,
    ) -> Result<PipelineReport, PipelineError> {
        if count > self.passes.len() {
            return Err(PipelineError::PrefixTooLong {
                requested: count,
                available: self.passes.len(),
            });
        }
        run_passes(&self.passes[..count], module, ctx)
    }

    /// Run every pass up to and including `name`.
    pub fn run_until(
        &self,
        name: &str,
        module: &mut Module,
        ctx: &mut PassContext,
    ) -> Result<PipelineReport, PipelineError> {
        let index = self.position(name)?;
        run_passes(&self.passes[..=index], module, ctx)
    }
}

fn run_passes(
    passes: &[PassDescriptor],
    module: &mut Module,
    ctx: &mut PassContext,
) -> Result<PipelineReport, PipelineError> {
    let mut report = PipelineReport::default();
    for pass in passes {
        report.passes.push(run_one(pass, module, ctx)?);
    }
    Ok(report)
}

fn run_one(
    pass: &PassDescriptor,
    module: &mut Module,
    ctx: &mut PassContext,
) -> LowerResult<PassReport> {
    let span = info_span!("pass", name = pass.name);
    let _guard = span.enter();

    (pass.precondition)(module, ctx).map_err(|message| {
        LowerError::internal(format!("precondition of `{}` failed: {message}", pass.name))
            .in_pass(pass.name)
    })?;

    let insts_before = module.instruction_count();
    let snapshot = module.clone();
    let start = Instant::now();

    if let Err(err) = (pass.run)(module, ctx) {
        *module = snapshot;
        debug!(kind = ?err.kind, "pass failed, module restored");
        if !pass.failures.contains(&err.kind) {
            let mut wrapped = LowerError::internal(format!(
                "pass `{}` reported a failure outside its contract: {err}",
                pass.name
            ));
            wrapped.function = err.function;
            wrapped.instruction = err.instruction;
            wrapped.loc = err.loc;
            return Err(wrapped.in_pass(pass.name));
        }
        return Err(err.in_pass(pass.name));
    }

    let checked = verify_module(module)
        .map_err(|e| LowerError::from_verify(&e))
        .and_then(|()| {
            (pass.postcondition)(module, ctx).map_err(|message| {
                LowerError::internal(format!(
                    "postcondition of `{}` failed: {message}",
                    pass.name
                ))
            })
        });
    if let Err(err) = checked {
        *module = snapshot;
        return Err(err.in_pass(pass.name));
    }

    let elapsed = start.elapsed();
    let insts_after = module.instruction_count();
    debug!(?elapsed, insts_before, insts_after, "pass finished");
    ctx.mark_completed(pass.name);
    Ok(PassReport {
        name: pass.name,
        elapsed,
        insts_before,
        insts_after,
    })
}

// ── Shared predicates ───────────────────────────────────────────────

pub(crate) fn no_requirements(_: &Module, _: &PassContext) -> Result<(), String> {
    Ok(())
}

/// First instruction matching `pred`, described as `@function: inst`.
pub(crate) fn find_inst(module: &Module, pred: impl Fn(&InstKind) -> bool) -> Option<String> {
    module.functions.iter().find_map(|function| {
        let body = function.body.as_ref()?;
        body.blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .find(|inst| pred(&inst.kind))
            .map(|inst| format!("@{}: `{}`", function.name, inst_to_string(body, inst)))
    })
}

/// Fails with `what` when any instruction matches `pred`.
pub(crate) fn forbid(
    module: &Module,
    what: &str,
    pred: impl Fn(&InstKind) -> bool,
) -> Result<(), String> {
    match find_inst(module, pred) {
        Some(found) => Err(format!("{what} remains in {found}")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests;
