#![allow(clippy::unwrap_used, clippy::expect_used)]

use pretty_assertions::assert_eq;

use super::*;
use crate::config::TargetConfig;
use crate::error::ErrorKind;
use crate::test_helpers::{function_text, lower, lower_err, run_passes_with};

fn names(module: &Module) -> Vec<&str> {
    module
        .functions
        .iter()
        .map(|f| f.name.as_str())
        .chain(module.globals.iter().map(|g| g.name.as_str()))
        .collect()
}

#[test]
fn keeps_everything_reachable_from_roots() {
    let module = lower(
        NAME,
        "@table = internal constant [1 x ptr] [ptr @via_global]
@exported = export global i32 0
@unused = global i32 0

declare void @ext()
declare void @never()

define internal void @via_global() {
entry:
  ret void
}

define internal void @helper() {
entry:
  call void @ext()
  ret void
}

define internal void @orphan() {
entry:
  call void @never()
  ret void
}

define entry void @main() {
entry:
  call void @helper()
  %p = load ptr, ptr @table
  ret void
}

define interrupt void @isr() {
entry:
  ret void
}
",
    );
    assert_eq!(
        names(&module),
        vec!["ext", "via_global", "helper", "main", "isr", "table", "exported"]
    );
}

#[test]
fn dead_cycles_are_removed() {
    let module = lower(
        NAME,
        "define internal void @a() {
entry:
  call void @b()
  ret void
}

define internal void @b() {
entry:
  call void @a()
  ret void
}

define export void @api() {
entry:
  ret void
}
",
    );
    assert_eq!(names(&module), vec!["api"]);
}

#[test]
fn returned_symbols_are_references() {
    let module = lower(
        NAME,
        "define internal void @target() {
entry:
  ret void
}

define export ptr @get() {
entry:
  ret ptr @target
}
",
    );
    assert_eq!(names(&module), vec!["target", "get"]);
}

#[test]
fn method_table_keeps_dispatch_targets() {
    let source = "\
concrete %A { Run = @A.Run }
concrete %B { Run = @B.Run }
concrete %C { Run = @C.Run }
interface %Runner { Run }

define void @A.Run(ptr %self) {
entry:
  ret void
}

define void @B.Run(ptr %self) {
entry:
  ret void
}

define void @C.Run(ptr %self) {
entry:
  ret void
}

define internal void @run(iface %r) {
entry:
  ifacecall void Run(iface %r)
  ret void
}

define export void @main(ptr %p) {
entry:
  %a = makeiface %A, ptr %p
  %b = makeiface %B, ptr %p
  call void @run(iface %a)
  call void @run(iface %b)
  ret void
}
";
    // C is never boxed, so no call site can reach its method.
    let (module, ctx) =
        run_passes_with(&[crate::interface::NAME, NAME], source, TargetConfig::default())
            .unwrap();
    let kept = names(&module);
    assert!(kept.contains(&"A.Run"), "{kept:?}");
    assert!(kept.contains(&"B.Run"), "{kept:?}");
    assert!(!kept.contains(&"C.Run"), "{kept:?}");
    let table = ctx.method_table().unwrap();
    assert!(table.live_implementations().all(|imp| module.function(imp).is_some()));
}

#[test]
fn frames_of_removed_functions_leave_the_root_table() {
    let source = "\
declare void @use(ptr)

define internal void @dead(ptr %p) {
entry:
  call void @use(ptr null)
  call void @use(ptr %p)
  ret void
}

define export void @live(ptr %p) {
entry:
  call void @use(ptr null)
  call void @use(ptr %p)
  ret void
}
";
    let (module, _) =
        run_passes_with(&[crate::gc_roots::NAME, NAME], source, TargetConfig::default()).unwrap();
    let roots = module.roots.as_ref().unwrap();
    let frames: Vec<&str> = roots.frames.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(frames, vec!["live"]);
    assert!(module.function("dead").is_none());
    assert!(module.global(crate::runtime::GC_STACK_CHAIN).is_some());
}

#[test]
fn interfaces_must_be_lowered_first() {
    let err = lower_err(
        NAME,
        "concrete %A {}\n\ndefine export void @main() {\nentry:\n  ret void\n}\n",
    );
    assert_eq!(err.kind, ErrorKind::InternalConsistency);
    assert!(err.message.contains("precondition of `dce`"), "{}", err.message);
}

#[test]
fn unboxing_a_type_drops_its_implementation() {
    let methods = "\
concrete %A { Run = @A.Run }
concrete %B { Run = @B.Run }
interface %Runner { Run }

define void @A.Run(ptr %self) {
entry:
  ret void
}

define void @B.Run(ptr %self) {
entry:
  ret void
}

define internal void @run(iface %r) {
entry:
  ifacecall void Run(iface %r)
  ret void
}
";
    let both = format!(
        "{methods}
define export void @main(ptr %p) {{
entry:
  %a = makeiface %A, ptr %p
  %b = makeiface %B, ptr %p
  call void @run(iface %a)
  call void @run(iface %b)
  ret void
}}
"
    );
    let only_a = format!(
        "{methods}
define export void @main(ptr %p) {{
entry:
  %a = makeiface %A, ptr %p
  call void @run(iface %a)
  ret void
}}
"
    );
    let passes = [crate::interface::NAME, NAME];

    let (module, _) = run_passes_with(&passes, &both, TargetConfig::default()).unwrap();
    let kept = names(&module);
    assert!(kept.contains(&"A.Run") && kept.contains(&"B.Run"), "{kept:?}");
    assert!(
        function_text(&module, "run").contains("call void @Run$invoke(i32 %r.typecode, ptr %r.data)"),
        "{module}"
    );

    let (module, _) = run_passes_with(&passes, &only_a, TargetConfig::default()).unwrap();
    let kept = names(&module);
    assert!(kept.contains(&"A.Run"), "{kept:?}");
    assert!(!kept.contains(&"B.Run"), "{kept:?}");
    assert!(!kept.contains(&"Run$invoke"), "{kept:?}");
    assert!(
        function_text(&module, "run").contains("call void @A.Run(ptr %r.data)"),
        "{module}"
    );
}
