//! Load → link → verify → lower → write.
//!
//! Every stage reports into a [`DiagnosticQueue`] and returns
//! [`ErrorGuaranteed`] on failure, so the caller only has to render the
//! queue and pick an exit code.

use std::fs;
use std::io::Write;
use std::path::Path;

use mote_diagnostic::{Diagnostic, DiagnosticQueue, ErrorCode, ErrorGuaranteed};
use mote_ir::{link_modules, verify_module, Module, RootTable};
use mote_lower::{PassContext, Pipeline, PipelineReport};
use tracing::{debug, info};

use crate::load::{load_packages, LoadError};
use crate::options::DriverOptions;

/// The result of lowering a set of packages.
#[derive(Debug)]
pub struct Lowered {
    pub module: Module,
    pub report: PipelineReport,
}

impl Lowered {
    pub fn roots(&self) -> Option<&RootTable> {
        self.module.roots.as_ref()
    }
}

/// Report every diagnostic; the proof comes from the last one.
fn emit_all(
    queue: &mut DiagnosticQueue,
    diagnostics: impl IntoIterator<Item = Diagnostic>,
) -> ErrorGuaranteed {
    let reported = diagnostics
        .into_iter()
        .fold(None, |_, diagnostic| Some(queue.emit_error(diagnostic)));
    reported.unwrap_or_else(|| {
        queue.emit_error(
            Diagnostic::error(ErrorCode::E9001).with_message("stage failed without a diagnostic"),
        )
    })
}

fn link_error(err: &mote_ir::LinkError) -> Diagnostic {
    Diagnostic::error(ErrorCode::E0002).with_message(err.to_string())
}

fn verify_error(err: &mote_ir::VerifyError) -> Diagnostic {
    let diagnostic = Diagnostic::error(ErrorCode::E1001).with_message(err.message.clone());
    match &err.function {
        Some(function) => diagnostic.with_note(format!("in function @{function}")),
        None => diagnostic,
    }
}

/// Load, link, verify and lower the packages named by `options`.
#[tracing::instrument(level = "info", skip_all, fields(packages = options.inputs.len()))]
pub fn lower_packages(
    options: &DriverOptions,
    queue: &mut DiagnosticQueue,
) -> Result<Lowered, ErrorGuaranteed> {
    let pipeline = match &options.passes {
        Some(passes) => {
            let names: Vec<&str> = passes.iter().map(String::as_str).collect();
            Pipeline::standard()
                .select(&names)
                .map_err(|err| queue.emit_error(err.to_diagnostic()))?
        }
        None => Pipeline::standard(),
    };

    let modules = load_packages(&options.inputs)
        .map_err(|errors| emit_all(queue, errors.iter().map(LoadError::to_diagnostic)))?;
    let mut module = link_modules(modules).map_err(|err| queue.emit_error(link_error(&err)))?;
    verify_module(&module).map_err(|err| queue.emit_error(verify_error(&err)))?;
    debug!(
        functions = module.functions.len(),
        globals = module.globals.len(),
        "linked"
    );

    let mut ctx = PassContext::new(options.config.clone());
    let report = pipeline
        .run(&mut module, &mut ctx)
        .map_err(|err| queue.emit_error(err.to_diagnostic()))?;
    for pass in &report.passes {
        info!(
            pass = pass.name,
            elapsed_us = pass.elapsed.as_micros(),
            insts_before = pass.insts_before,
            insts_after = pass.insts_after,
            "pass finished"
        );
    }
    Ok(Lowered { module, report })
}

fn write_file(path: &Path, bytes: &[u8], queue: &mut DiagnosticQueue) -> Result<(), ErrorGuaranteed> {
    fs::write(path, bytes).map_err(|err| {
        queue.emit_error(
            Diagnostic::error(ErrorCode::E0003)
                .with_message(format!("cannot write output: {err}"))
                .with_file(path.display().to_string()),
        )
    })
}

/// Write the lowered module and, when asked for, its encoded root table.
pub fn write_outputs(
    options: &DriverOptions,
    lowered: &Lowered,
    queue: &mut DiagnosticQueue,
) -> Result<(), ErrorGuaranteed> {
    if let Some(path) = &options.emit_roots {
        let Some(roots) = lowered.roots() else {
            return Err(queue.emit_error(
                Diagnostic::error(ErrorCode::E0004)
                    .with_message("`--emit-roots` needs the `gc-roots` pass to run"),
            ));
        };
        let bytes = roots.to_bytes().map_err(|err| {
            queue.emit_error(
                Diagnostic::error(ErrorCode::E9001)
                    .with_message(format!("cannot encode the root table: {err}")),
            )
        })?;
        write_file(path, &bytes, queue)?;
        debug!(path = %path.display(), bytes = bytes.len(), "root table written");
    }

    let text = lowered.module.to_string();
    match &options.output {
        Some(path) => write_file(path, text.as_bytes(), queue),
        None => std::io::stdout().lock().write_all(text.as_bytes()).map_err(|err| {
            queue.emit_error(
                Diagnostic::error(ErrorCode::E0003).with_message(format!("cannot write output: {err}")),
            )
        }),
    }
}

#[cfg(test)]
mod tests;
