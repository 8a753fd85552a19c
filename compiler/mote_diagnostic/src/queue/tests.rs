#![allow(clippy::unwrap_used, clippy::expect_used)]

use mote_ir::DebugLoc;
use pretty_assertions::assert_eq;

use super::*;

fn at(file: &str, line: u32, message: &str) -> Diagnostic {
    Diagnostic::error(ErrorCode::E0001)
        .with_message(message)
        .with_location(Some(DebugLoc {
            file: file.into(),
            line,
            column: 1,
        }))
}

#[test]
fn flush_sorts_by_position() {
    let mut queue = DiagnosticQueue::new();
    queue.add(at("b.ir", 1, "third"));
    queue.add(at("a.ir", 7, "second"));
    queue.add(at("a.ir", 2, "first"));
    let messages: Vec<String> = queue.flush().into_iter().map(|d| d.message).collect();
    assert_eq!(messages, vec!["first", "second", "third"]);
}

#[test]
fn duplicates_are_dropped() {
    let mut queue = DiagnosticQueue::new();
    assert!(queue.add(at("a.ir", 1, "same")));
    assert!(!queue.add(at("a.ir", 1, "same")));
    assert_eq!(queue.error_count(), 1);
}

#[test]
fn duplicates_kept_when_unlimited() {
    let mut queue = DiagnosticQueue::with_config(DiagnosticConfig::unlimited());
    queue.add(at("a.ir", 1, "same"));
    queue.add(at("a.ir", 1, "same"));
    assert_eq!(queue.error_count(), 2);
}

#[test]
fn error_limit_appends_summary() {
    let mut queue = DiagnosticQueue::with_config(DiagnosticConfig {
        error_limit: 2,
        deduplicate: true,
    });
    for line in 1..=5 {
        queue.add(at("a.ir", line, "bad"));
    }
    assert!(queue.limit_reached());
    let flushed = queue.flush();
    assert_eq!(flushed.len(), 3);
    assert_eq!(flushed[2].code, ErrorCode::E9002);
    assert_eq!(flushed[2].notes, vec!["3 further error(s) not shown".to_string()]);
}

#[test]
fn has_errors_only_after_an_error() {
    let mut queue = DiagnosticQueue::new();
    assert!(queue.has_errors().is_none());
    queue.add(Diagnostic::warning(ErrorCode::E1001).with_message("w"));
    assert!(queue.has_errors().is_none());
    assert_eq!(queue.warning_count(), 1);
    let _proof = queue.emit_error(at("a.ir", 1, "e"));
    assert!(queue.has_errors().is_some());
}

#[test]
fn flush_resets_counts() {
    let mut queue = DiagnosticQueue::new();
    queue.add(at("a.ir", 1, "e"));
    let _ = queue.flush();
    assert_eq!(queue.error_count(), 0);
    assert_eq!(queue.peek().count(), 0);
}
