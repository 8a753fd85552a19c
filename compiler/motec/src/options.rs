//! Command-line options.
//!
//! Options take the `--name=value` form, except `-o <path>` which takes its
//! value from the next argument. Everything not starting with `-` is an
//! input package.

use std::path::PathBuf;

use mote_diagnostic::emitter::ColorMode;
use mote_diagnostic::{Diagnostic, ErrorCode};
use mote_lower::{Scheduler, TargetConfig};

/// Everything one driver invocation needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverOptions {
    /// One IR file per package, in link order.
    pub inputs: Vec<PathBuf>,
    pub config: TargetConfig,
    /// Passes to run, or `None` for the whole pipeline.
    pub passes: Option<Vec<String>>,
    /// Where to print the lowered module; stdout when absent.
    pub output: Option<PathBuf>,
    /// Where to write the encoded root table.
    pub emit_roots: Option<PathBuf>,
    pub color: ColorMode,
}

/// A command line the driver cannot act on.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    #[error("unknown option `{0}`")]
    Unknown(String),
    #[error("option `{option}` expects {expected}, found `{value}`")]
    BadValue {
        option: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("option `{0}` is missing its value")]
    MissingValue(&'static str),
    #[error("no input files")]
    NoInputs,
}

impl OptionError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(ErrorCode::E0004).with_message(self.to_string())
    }
}

fn number<T: std::str::FromStr>(
    option: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, OptionError> {
    value.parse().map_err(|_| OptionError::BadValue {
        option,
        expected,
        value: value.to_owned(),
    })
}

/// Parse the arguments that follow the program name.
pub fn parse_options(args: &[String]) -> Result<DriverOptions, OptionError> {
    let mut options = DriverOptions::default();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if arg == "-o" {
            let path = args.get(i + 1).ok_or(OptionError::MissingValue("-o"))?;
            options.output = Some(PathBuf::from(path));
            i += 2;
            continue;
        }
        if let Some(name) = arg.strip_prefix("--scheduler=") {
            let scheduler: Scheduler = name.parse().map_err(|_| OptionError::BadValue {
                option: "--scheduler",
                expected: "`tasks` or `coroutines`",
                value: name.to_owned(),
            })?;
            options.config.scheduler = scheduler;
        } else if let Some(size) = arg.strip_prefix("--pointer-size=") {
            let size: u32 = number("--pointer-size", size, "4 or 8")?;
            if !matches!(size, 4 | 8) {
                return Err(OptionError::BadValue {
                    option: "--pointer-size",
                    expected: "4 or 8",
                    value: size.to_string(),
                });
            }
            options.config.pointer_size = size;
        } else if let Some(size) = arg.strip_prefix("--stack-size=") {
            options.config.task_stack_size = number("--stack-size", size, "a byte count")?;
        } else if let Some(limit) = arg.strip_prefix("--chain-limit=") {
            options.config.chain_limit = number("--chain-limit", limit, "a number")?;
        } else if let Some(list) = arg.strip_prefix("--passes=") {
            options.passes = Some(
                list.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_owned)
                    .collect(),
            );
        } else if let Some(path) = arg.strip_prefix("--emit-roots=") {
            options.emit_roots = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--output=") {
            options.output = Some(PathBuf::from(path));
        } else if let Some(mode) = arg.strip_prefix("--color=") {
            options.color = match mode {
                "auto" => ColorMode::Auto,
                "always" => ColorMode::Always,
                "never" => ColorMode::Never,
                _ => {
                    return Err(OptionError::BadValue {
                        option: "--color",
                        expected: "`auto`, `always` or `never`",
                        value: mode.to_owned(),
                    })
                }
            };
        } else if arg.starts_with('-') {
            return Err(OptionError::Unknown(arg.to_owned()));
        } else {
            options.inputs.push(PathBuf::from(arg));
        }
        i += 1;
    }
    if options.inputs.is_empty() {
        return Err(OptionError::NoInputs);
    }
    Ok(options)
}

#[cfg(test)]
mod tests;
