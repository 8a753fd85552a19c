//! Golden fixture harness.
//!
//! A case is a pair of files: `<name>.in` holds textual IR, `<name>.out` the
//! expected output after running one or more passes over it. Cases live in
//! one directory per pass, whose name selects the pass to run; a directory
//! named [`PIPELINE_DIR`] runs the whole standard pipeline. A fixture can
//! override both with header directives:
//!
//! ```text
//! ; passes: interface, dce
//! ; scheduler: coroutines
//! ```
//!
//! Output is compared with [`compare_ir`], which ignores comments, blank
//! lines, trailing whitespace, the `source_filename` line, and `, align N`
//! annotations present on only one side. With `MOTE_UPDATE_GOLDEN=1` the
//! expected file is rewritten from the actual output instead.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use mote_ir::{parse_module, ParseError};

use crate::config::{Scheduler, TargetConfig};
use crate::context::PassContext;
use crate::pipeline::{Pipeline, PipelineError};

/// Environment variable that switches the harness into update mode.
pub const UPDATE_ENV: &str = "MOTE_UPDATE_GOLDEN";

/// Case directory that runs every pass of the standard pipeline.
pub const PIPELINE_DIR: &str = "pipeline";

// ── Fuzzy comparison ────────────────────────────────────────────────

/// Byte offset of a `;` comment outside string literals.
fn comment_start(line: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => return Some(i),
            _ => {}
        }
    }
    None
}

/// The lines of `text` that matter for comparison.
pub fn filter_irrelevant_lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let code = comment_start(line).map_or(line, |i| &line[..i]);
            code.trim_end()
        })
        .filter(|line| !line.is_empty() && !line.starts_with("source_filename"))
        .collect()
}

/// `line` without a trailing `, align N`, if it has one.
fn strip_align(line: &str) -> Option<&str> {
    let (head, tail) = line.rsplit_once(", align ")?;
    (!tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit())).then_some(head)
}

fn lines_match(expected: &str, actual: &str) -> bool {
    if expected == actual {
        return true;
    }
    match (strip_align(expected), strip_align(actual)) {
        (Some(e), None) => e == actual,
        (None, Some(a)) => expected == a,
        _ => false,
    }
}

/// First line where two IR texts differ after filtering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// Index into the filtered lines.
    pub line: usize,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |side: &Option<String>| side.clone().unwrap_or_else(|| "<end of text>".into());
        write!(
            f,
            "line {} differs\n  expected: {}\n  actual:   {}",
            self.line + 1,
            show(&self.expected),
            show(&self.actual)
        )
    }
}

/// Compare two IR texts line by line after filtering.
pub fn compare_ir(expected: &str, actual: &str) -> Result<(), Mismatch> {
    let expected = filter_irrelevant_lines(expected);
    let actual = filter_irrelevant_lines(actual);
    for line in 0..expected.len().max(actual.len()) {
        let (e, a) = (expected.get(line), actual.get(line));
        let same = match (e, a) {
            (Some(e), Some(a)) => lines_match(e, a),
            _ => false,
        };
        if !same {
            return Err(Mismatch {
                line,
                expected: e.map(|s| (*s).to_owned()),
                actual: a.map(|s| (*s).to_owned()),
            });
        }
    }
    Ok(())
}

pub fn fuzzy_equal_ir(expected: &str, actual: &str) -> bool {
    compare_ir(expected, actual).is_ok()
}

// ── Cases ───────────────────────────────────────────────────────────

/// One fixture pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoldenCase {
    pub name: String,
    pub input: PathBuf,
    pub expected: PathBuf,
    /// Name of the directory holding the case.
    pub suite: String,
}

/// Every `.in` file directly inside `dir`, sorted by name.
pub fn discover_cases(dir: &Path) -> Vec<GoldenCase> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let suite = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_owned();
    let mut cases: Vec<GoldenCase> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|e| e == "in"))
        .filter_map(|input| {
            let name = input.file_stem()?.to_str()?.to_owned();
            Some(GoldenCase {
                name,
                expected: input.with_extension("out"),
                input,
                suite: suite.clone(),
            })
        })
        .collect();
    cases.sort_by(|a, b| a.name.cmp(&b.name));
    cases
}

/// Every case directory below `root`, sorted by name.
pub fn discover_suites(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Pass list and configuration of one case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaseSetup {
    /// Passes to run, or `None` for the whole pipeline.
    pub passes: Option<Vec<String>>,
    pub config: TargetConfig,
}

/// Read the header directives of `source`, defaulting to `suite`.
pub fn case_setup(suite: &str, source: &str) -> Result<CaseSetup, GoldenError> {
    let mut setup = CaseSetup {
        passes: (suite != PIPELINE_DIR).then(|| vec![suite.to_owned()]),
        config: TargetConfig::default(),
    };
    let directives = source
        .lines()
        .map(str::trim)
        .take_while(|line| line.is_empty() || line.starts_with(';'))
        .filter_map(|line| line.strip_prefix(';')?.split_once(':'));
    for (key, value) in directives {
        let value = value.trim();
        match key.trim() {
            "passes" => {
                setup.passes = Some(
                    value
                        .split(',')
                        .map(|p| p.trim().to_owned())
                        .filter(|p| !p.is_empty())
                        .collect(),
                );
            }
            "scheduler" => {
                let scheduler: Scheduler = value
                    .parse()
                    .map_err(|_| GoldenError::Directive(format!("unknown scheduler `{value}`")))?;
                setup.config = setup.config.with_scheduler(scheduler);
            }
            // Other comments in the header are prose.
            _ => {}
        }
    }
    Ok(setup)
}

/// Why a case could not be checked.
#[derive(Debug, thiserror::Error)]
pub enum GoldenError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse { path: PathBuf, source: ParseError },
    #[error("{path}: {source}")]
    Pipeline {
        path: PathBuf,
        source: PipelineError,
    },
    #[error("bad fixture directive: {0}")]
    Directive(String),
    #[error("{path} differs from the expected output: {mismatch}\n--- actual ---\n{actual}")]
    Mismatch {
        path: PathBuf,
        mismatch: Mismatch,
        actual: String,
    },
}

/// What checking a case did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Matched,
    /// Update mode rewrote the expected file.
    Updated,
}

pub fn update_mode() -> bool {
    std::env::var(UPDATE_ENV).is_ok_and(|v| v == "1")
}

fn read(path: &Path) -> Result<String, GoldenError> {
    fs::read_to_string(path).map_err(|source| GoldenError::Io {
        path: path.to_owned(),
        source,
    })
}

/// Run the passes a case selects over its input and print the result.
pub fn lower_case(case: &GoldenCase) -> Result<String, GoldenError> {
    let source = read(&case.input)?;
    let setup = case_setup(&case.suite, &source)?;
    let mut module = parse_module(&source).map_err(|source| GoldenError::Parse {
        path: case.input.clone(),
        source,
    })?;
    let pipeline_error = |source| GoldenError::Pipeline {
        path: case.input.clone(),
        source,
    };
    let pipeline = match &setup.passes {
        Some(passes) => {
            let names: Vec<&str> = passes.iter().map(String::as_str).collect();
            Pipeline::standard().select(&names).map_err(pipeline_error)?
        }
        None => Pipeline::standard(),
    };
    let mut ctx = PassContext::new(setup.config);
    pipeline.run(&mut module, &mut ctx).map_err(pipeline_error)?;
    Ok(module.to_string())
}

/// Check one case, or regenerate its expected output in update mode.
pub fn run_case(case: &GoldenCase) -> Result<Outcome, GoldenError> {
    let actual = lower_case(case)?;
    if update_mode() {
        fs::write(&case.expected, &actual).map_err(|source| GoldenError::Io {
            path: case.expected.clone(),
            source,
        })?;
        return Ok(Outcome::Updated);
    }
    let expected = read(&case.expected)?;
    compare_ir(&expected, &actual).map_err(|mismatch| GoldenError::Mismatch {
        path: case.expected.clone(),
        mismatch,
        actual,
    })?;
    Ok(Outcome::Matched)
}
