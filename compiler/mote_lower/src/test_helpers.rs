//! Shared test utilities for the lowering passes.
//!
//! Only compiled in test builds.

use mote_ir::{parse_module, FunctionDisplay, Module};

use crate::config::TargetConfig;
use crate::context::PassContext;
use crate::error::LowerError;
use crate::pipeline::Pipeline;

/// Parse `source`, panicking with the error position on failure.
pub(crate) fn parse(source: &str) -> Module {
    parse_module(source).unwrap_or_else(|e| panic!("parse failed at {e}\n{source}"))
}

/// Run the named passes of the standard pipeline on `source`.
pub(crate) fn run_passes_with(
    passes: &[&str],
    source: &str,
    config: TargetConfig,
) -> Result<(Module, PassContext), LowerError> {
    let mut module = parse(source);
    let mut ctx = PassContext::new(config);
    let pipeline = Pipeline::standard()
        .select(passes)
        .unwrap_or_else(|e| panic!("{e}"));
    match pipeline.run(&mut module, &mut ctx) {
        Ok(_) => Ok((module, ctx)),
        Err(err) => match err.as_lower_error() {
            Some(lower) => Err(lower.clone()),
            None => panic!("{err}"),
        },
    }
}

/// Run one pass with the default configuration, panicking on failure.
pub(crate) fn lower(pass: &str, source: &str) -> Module {
    lower_with(pass, source, TargetConfig::default())
}

pub(crate) fn lower_with(pass: &str, source: &str, config: TargetConfig) -> Module {
    match run_passes_with(&[pass], source, config) {
        Ok((module, _)) => module,
        Err(err) => panic!("{pass} failed: {err}\n{:?}", err.instruction),
    }
}

/// Run one pass with the default configuration and return its failure.
pub(crate) fn lower_err(pass: &str, source: &str) -> LowerError {
    lower_err_with(pass, source, TargetConfig::default())
}

pub(crate) fn lower_err_with(pass: &str, source: &str, config: TargetConfig) -> LowerError {
    match run_passes_with(&[pass], source, config) {
        Ok((module, _)) => panic!("{pass} unexpectedly succeeded:\n{module}"),
        Err(err) => err,
    }
}

/// Printed text of one function.
pub(crate) fn function_text(module: &Module, name: &str) -> String {
    let function = module
        .function(name)
        .unwrap_or_else(|| panic!("no function @{name}\n{module}"));
    FunctionDisplay(function).to_string()
}
