//! Parallel package loading.
//!
//! Packages are independent until they are linked, so each one is read and
//! parsed on the rayon pool. Every failure is collected; one bad package
//! never hides another.

use std::fs;
use std::path::{Path, PathBuf};

use mote_diagnostic::{Diagnostic, ErrorCode};
use mote_ir::{parse_module, DebugLoc, Module, ParseError};
use rayon::prelude::*;
use tracing::debug;

/// Why one package could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}:{source}", path.display())]
    Parse { path: PathBuf, source: ParseError },
}

impl LoadError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            LoadError::Read { path, source } => Diagnostic::error(ErrorCode::E0003)
                .with_message(format!("cannot read package: {source}"))
                .with_file(path.display().to_string()),
            LoadError::Parse { path, source } => Diagnostic::error(ErrorCode::E0001)
                .with_message(source.message.clone())
                .with_location(Some(DebugLoc {
                    file: path.display().to_string(),
                    line: source.line,
                    column: source.column,
                })),
        }
    }
}

/// Read and parse one package.
pub fn load_package(path: &Path) -> Result<Module, LoadError> {
    let source = fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_owned(),
        source,
    })?;
    let module = parse_module(&source).map_err(|source| LoadError::Parse {
        path: path.to_owned(),
        source,
    })?;
    debug!(
        path = %path.display(),
        functions = module.functions.len(),
        globals = module.globals.len(),
        "package loaded"
    );
    Ok(module)
}

/// Load every package in parallel. Modules come back in input order; on
/// failure, every failing package is reported.
pub fn load_packages(paths: &[PathBuf]) -> Result<Vec<Module>, Vec<LoadError>> {
    let results: Vec<Result<Module, LoadError>> =
        paths.par_iter().map(|path| load_package(path)).collect();
    let mut modules = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(module) => modules.push(module),
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() {
        Ok(modules)
    } else {
        Err(errors)
    }
}
