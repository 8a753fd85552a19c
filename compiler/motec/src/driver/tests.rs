#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::*;

const MAIN: &str = "\
declare ptr @runtime.alloc(i32)
declare void @consume(ptr)

define entry void @main() {
entry:
  %a = call ptr @runtime.alloc(i32 8)
  %b = call ptr @runtime.alloc(i32 8)
  call void @consume(ptr %a)
  ret void
}
";

const LIB: &str = "\
define void @consume(ptr %p) {
entry:
  store i32 0, ptr %p
  ret void
}

define internal void @unused() {
entry:
  ret void
}
";

fn package(dir: &TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, source).unwrap();
    path
}

fn options(inputs: Vec<PathBuf>) -> DriverOptions {
    DriverOptions {
        inputs,
        ..DriverOptions::default()
    }
}

#[test]
fn packages_are_linked_and_lowered() {
    let dir = TempDir::new().unwrap();
    let inputs = vec![package(&dir, "main.mir", MAIN), package(&dir, "lib.mir", LIB)];
    let mut queue = DiagnosticQueue::new();
    let lowered = lower_packages(&options(inputs), &mut queue).unwrap();

    assert_eq!(queue.error_count(), 0);
    assert_eq!(
        lowered.report.pass_names(),
        ["interface", "func-values", "concurrency", "gc-roots", "dce"]
    );
    assert!(lowered.module.function("consume").is_some());
    assert!(lowered.module.function("unused").is_none());
    let roots = lowered.roots().unwrap();
    assert_eq!(roots.frames.len(), 1);
    assert_eq!(roots.frames[0].function, "main");
}

#[test]
fn every_failing_package_is_reported() {
    let dir = TempDir::new().unwrap();
    let inputs = vec![
        package(&dir, "good.mir", LIB),
        package(&dir, "bad.mir", "define void @f( {\n"),
        dir.path().join("missing.mir"),
    ];
    let mut queue = DiagnosticQueue::new();
    assert!(lower_packages(&options(inputs), &mut queue).is_err());

    let diagnostics = queue.flush();
    let mut codes: Vec<ErrorCode> = diagnostics.iter().map(|d| d.code).collect();
    codes.sort_by_key(|c| c.as_str());
    assert_eq!(codes, vec![ErrorCode::E0001, ErrorCode::E0003]);
    let parse = diagnostics.iter().find(|d| d.code == ErrorCode::E0001).unwrap();
    let location = parse.location.as_ref().unwrap();
    assert!(location.file.ends_with("bad.mir"), "{location}");
    assert_eq!(location.line, 1);
}

#[test]
fn conflicting_packages_fail_to_link() {
    let dir = TempDir::new().unwrap();
    let inputs = vec![package(&dir, "a.mir", LIB), package(&dir, "b.mir", LIB)];
    let mut queue = DiagnosticQueue::new();
    assert!(lower_packages(&options(inputs), &mut queue).is_err());
    let diagnostics = queue.flush();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code, ErrorCode::E0002);
}

#[test]
fn pass_failures_become_diagnostics() {
    let dir = TempDir::new().unwrap();
    let source = "\
define interrupt void @isr(ptr %ch) {
entry:
  chan.send i32 1, ptr %ch
  ret void
}
";
    let inputs = vec![package(&dir, "isr.mir", source)];
    let mut queue = DiagnosticQueue::new();
    assert!(lower_packages(&options(inputs), &mut queue).is_err());
    let diagnostics = queue.flush();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code, ErrorCode::E2001);
    assert!(
        diagnostics[0].notes.iter().any(|n| n == "in function @isr"),
        "{:?}",
        diagnostics[0].notes
    );
}

#[test]
fn unknown_pass_is_an_option_error() {
    let mut queue = DiagnosticQueue::new();
    let options = DriverOptions {
        passes: Some(vec!["inline".to_owned()]),
        ..options(vec![PathBuf::from("never-read.mir")])
    };
    assert!(lower_packages(&options, &mut queue).is_err());
    let diagnostics = queue.flush();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].code, ErrorCode::E0004);
}

#[test]
fn outputs_are_written_to_files() {
    let dir = TempDir::new().unwrap();
    let inputs = vec![package(&dir, "main.mir", MAIN), package(&dir, "lib.mir", LIB)];
    let options = DriverOptions {
        output: Some(dir.path().join("out.mir")),
        emit_roots: Some(dir.path().join("roots.bin")),
        ..options(inputs)
    };
    let mut queue = DiagnosticQueue::new();
    let lowered = lower_packages(&options, &mut queue).unwrap();
    write_outputs(&options, &lowered, &mut queue).unwrap();

    let text = fs::read_to_string(dir.path().join("out.mir")).unwrap();
    assert_eq!(text, lowered.module.to_string());
    let reparsed = mote_ir::parse_module(&text).unwrap();
    assert_eq!(reparsed.roots, lowered.module.roots);

    let bytes = fs::read(dir.path().join("roots.bin")).unwrap();
    assert_eq!(Some(RootTable::from_bytes(&bytes).unwrap()), lowered.module.roots);
}

#[test]
fn root_table_needs_the_gc_pass() {
    let dir = TempDir::new().unwrap();
    let options = DriverOptions {
        passes: Some(vec!["dce".to_owned()]),
        emit_roots: Some(dir.path().join("roots.bin")),
        ..options(vec![package(&dir, "lib.mir", LIB)])
    };
    let mut queue = DiagnosticQueue::new();
    let lowered = lower_packages(&options, &mut queue).unwrap();
    assert!(write_outputs(&options, &lowered, &mut queue).is_err());
    assert_eq!(queue.flush()[0].code, ErrorCode::E0004);
    assert!(!dir.path().join("roots.bin").exists());
}
