#![allow(clippy::unwrap_used, clippy::expect_used)]

use mote_ir::{RootTable, SlotLayout};
use pretty_assertions::assert_eq;

use super::*;
use crate::error::ErrorKind;
use crate::test_helpers::{function_text, lower, lower_err};

const DECLS: &str = "\
declare ptr @runtime.alloc(i32)
declare void @use(ptr)
declare nogc void @runtime.nilPanic()
";

fn lower_roots(source: &str) -> Module {
    lower(NAME, &format!("{DECLS}\n{source}"))
}

fn roots(module: &Module) -> &RootTable {
    module.roots.as_ref().expect("root table")
}

#[test]
fn pointer_live_across_a_call_is_spilled() {
    let module = lower_roots(
        "define void @f() {
entry:
  %a = call ptr @runtime.alloc(i32 8)
  %b = call ptr @runtime.alloc(i32 8)
  call void @use(ptr %a)
  ret void
}
",
    );
    assert_eq!(
        function_text(&module, "f"),
        "define void @f() {
entry:
  %gcframe = alloca %f$gcframe
  store %f$gcframe zeroinitializer, ptr %gcframe
  %gcframe.parent = load ptr, ptr @runtime.gcStackChain
  %gcframe.link = gep %f$gcframe, ptr %gcframe, i32 0
  store ptr %gcframe.parent, ptr %gcframe.link
  %gcframe.id = gep %f$gcframe, ptr %gcframe, i32 1
  store i32 1, ptr %gcframe.id
  %gcframe.safepoint = gep %f$gcframe, ptr %gcframe, i32 2
  store ptr %gcframe, ptr @runtime.gcStackChain
  store i32 0, ptr %gcframe.safepoint
  %a = call ptr @runtime.alloc(i32 8)
  %a.root = gep %f$gcframe, ptr %gcframe, i32 3
  store ptr %a, ptr %a.root
  store i32 1, ptr %gcframe.safepoint
  %b = call ptr @runtime.alloc(i32 8)
  store i32 0, ptr %gcframe.safepoint
  call void @use(ptr %a)
  store ptr %gcframe.parent, ptr @runtime.gcStackChain
  ret void
}
"
    );

    let text = module.to_string();
    assert!(text.contains("type %f$gcframe = { ptr, i32, i32, ptr }\n"), "{text}");
    assert!(text.contains("@runtime.gcStackChain = external global ptr\n"), "{text}");
    assert!(
        text.ends_with(
            "gcroots {
  frame 1 @f {
    slot 12 precise 4 [0]
    safepoint 0 []
    safepoint 1 [0]
  }
}
"
        ),
        "{text}"
    );
}

#[test]
fn root_ends_at_its_last_use() {
    let module = lower_roots(
        "define void @f() {
entry:
  %a = call ptr @runtime.alloc(i32 8)
  %b = call ptr @runtime.alloc(i32 8)
  call void @use(ptr %a)
  call void @use(ptr %b)
  ret void
}
",
    );
    let frame = roots(&module).frame("f").unwrap();
    // a is live across the second allocation only; b across the first use.
    assert_eq!(frame.slots.len(), 2);
    assert_eq!(frame.safe_points, vec![vec![], vec![0], vec![1]]);

    let text = function_text(&module, "f");
    assert!(
        text.contains(
            "  store i32 2, ptr %gcframe.safepoint\n  call void @use(ptr %a)\n  store i32 0, ptr %gcframe.safepoint\n  call void @use(ptr %b)\n"
        ),
        "{text}"
    );
}

#[test]
fn repeated_safe_point_id_is_stored_once() {
    let module = lower_roots(
        "define void @f(ptr %p) {
entry:
  call void @use(ptr null)
  call void @use(ptr null)
  call void @use(ptr %p)
  ret void
}
",
    );
    let text = function_text(&module, "f");
    assert!(
        text.contains(
            "  store ptr %gcframe, ptr @runtime.gcStackChain
  %p.root = gep %f$gcframe, ptr %gcframe, i32 3
  store ptr %p, ptr %p.root
  store i32 0, ptr %gcframe.safepoint
  call void @use(ptr null)
  call void @use(ptr null)
  store i32 1, ptr %gcframe.safepoint
  call void @use(ptr %p)
"
        ),
        "{text}"
    );
}

#[test]
fn phi_roots_are_spilled_after_the_phis() {
    let module = lower_roots(
        "define ptr @h(i1 %c) {
entry:
  br i1 %c, label %x, label %y

x:
  %p = call ptr @runtime.alloc(i32 4)
  br label %j

y:
  %q = call ptr @runtime.alloc(i32 8)
  br label %j

j:
  %m = phi ptr [ %p, %x ], [ %q, %y ]
  call void @use(ptr null)
  ret ptr %m
}
",
    );
    let text = function_text(&module, "h");
    assert!(
        text.contains(
            "j:
  %m = phi ptr [ %p, %x ], [ %q, %y ]
  %m.root = gep %h$gcframe, ptr %gcframe, i32 3
  store ptr %m, ptr %m.root
  store i32 1, ptr %gcframe.safepoint
  call void @use(ptr null)
  store ptr %gcframe.parent, ptr @runtime.gcStackChain
  ret ptr %m
"
        ),
        "{text}"
    );
}

#[test]
fn escaping_alloca_moves_into_the_frame() {
    let module = lower_roots(
        "define void @g() {
entry:
  %buf = alloca opaque 8
  call void @use(ptr %buf)
  %n = call ptr @runtime.alloc(i32 4)
  ret void
}
",
    );
    let text = function_text(&module, "g");
    assert!(text.contains("  %buf = gep %g$gcframe, ptr %gcframe, i32 3\n"), "{text}");
    assert!(!text.contains("alloca opaque"), "{text}");

    let frame = roots(&module).frame("g").unwrap();
    assert_eq!(
        frame.slots[0].layout,
        SlotLayout::Conservative { size: 8 }
    );
    assert_eq!(frame.safe_points, vec![vec![0]]);
}

#[test]
fn private_scalar_alloca_is_left_alone() {
    let module = lower_roots(
        "define i32 @g() {
entry:
  %n = alloca i32
  store i32 1, ptr %n
  call void @use(ptr null)
  %v = load i32, ptr %n
  ret i32 %v
}
",
    );
    assert!(roots(&module).frame("g").is_none());
    assert!(function_text(&module, "g").contains("  %n = alloca i32\n"));
}

#[test]
fn nogc_calls_are_not_safe_points() {
    let module = lower_roots(
        "define void @f() {
entry:
  %a = call ptr @runtime.alloc(i32 8)
  call void @runtime.nilPanic()
  store i32 0, ptr %a
  ret void
}

define nogc void @quiet(ptr %p) {
entry:
  call void @use(ptr null)
  store i32 0, ptr %p
  ret void
}
",
    );
    let table = roots(&module);
    assert!(table.frames.is_empty());
    assert!(module.global(GC_STACK_CHAIN).is_none());
    assert!(!function_text(&module, "quiet").contains("gcframe"));
}

#[test]
fn pointer_globals_are_roots() {
    let module = lower_roots(
        "type %Node = { i32, ptr }
type %Blob = opaque 16

@head = global ptr null
@node = internal global %Node zeroinitializer
@blob = global %Blob zeroinitializer
@count = global i32 0
@names = constant [2 x ptr] [ptr null, ptr null]
",
    );
    let table = roots(&module);
    let globals: Vec<(&str, &SlotLayout)> =
        table.globals.iter().map(|g| (g.name.as_str(), &g.layout)).collect();
    assert_eq!(
        globals,
        vec![
            (
                "head",
                &SlotLayout::Precise {
                    size: 4,
                    offsets: vec![0]
                }
            ),
            (
                "node",
                &SlotLayout::Precise {
                    size: 8,
                    offsets: vec![4]
                }
            ),
            ("blob", &SlotLayout::Conservative { size: 16 }),
        ]
    );
}

#[test]
fn frame_ids_follow_function_order() {
    let module = lower_roots(
        "define void @first(ptr %p) {
entry:
  call void @use(ptr null)
  call void @use(ptr %p)
  ret void
}

define void @second(ptr %p) {
entry:
  call void @use(ptr null)
  call void @use(ptr %p)
  ret void
}
",
    );
    let ids: Vec<(u32, &str)> = roots(&module)
        .frames
        .iter()
        .map(|f| (f.id, f.function.as_str()))
        .collect();
    assert_eq!(ids, vec![(1, "first"), (2, "second")]);
    assert!(function_text(&module, "second").contains("  store i32 2, ptr %gcframe.id\n"));
}

#[test]
fn root_table_survives_serialisation() {
    let module = lower_roots(
        "@head = global ptr null

define void @f(ptr %p) {
entry:
  call void @use(ptr null)
  call void @use(ptr %p)
  ret void
}
",
    );
    let table = roots(&module);
    let bytes = table.to_bytes().unwrap();
    assert_eq!(&RootTable::from_bytes(&bytes).unwrap(), table);
}

#[test]
fn high_level_constructs_must_be_lowered_first() {
    let err = lower_err(
        NAME,
        "define entry void @main() {\nentry:\n  sleep i64 1\n  ret void\n}\n",
    );
    assert_eq!(err.kind, ErrorKind::InternalConsistency);
    assert!(err.message.contains("precondition of `gc-roots`"), "{}", err.message);
}

#[test]
fn looping_entry_links_the_frame_once() {
    let module = lower_roots(
        "define void @f(ptr %p, i1 %c) {
entry:
  %q = call ptr @runtime.alloc(i32 4)
  call void @use(ptr %p)
  br i1 %c, label %entry, label %done

done:
  ret void
}
",
    );
    let text = function_text(&module, "f");
    let (prologue, rest) = text.split_once("\nentry:\n").unwrap();
    assert!(prologue.contains("prologue:\n  %gcframe = alloca %f$gcframe\n"), "{text}");
    assert!(prologue.contains("%gcframe.parent = load ptr, ptr @runtime.gcStackChain"), "{text}");
    assert!(prologue.contains("store ptr %gcframe, ptr @runtime.gcStackChain"), "{text}");
    assert!(prologue.ends_with("  br label %entry\n"), "{text}");
    assert!(!rest.contains("load ptr, ptr @runtime.gcStackChain"), "{text}");
    assert!(!rest.contains("alloca"), "{text}");
    assert!(rest.contains("br i1 %c, label %entry, label %done"), "{text}");
}

#[test]
fn oversized_global_is_malformed() {
    let err = lower_err(
        NAME,
        "type %Big = { [4294967295 x i8], ptr }
@g = global %Big zeroinitializer
",
    );
    assert_eq!(err.kind, ErrorKind::MalformedInput);
    assert!(err.message.contains("%Big"), "{}", err.message);
}

#[test]
fn long_pointer_array_global_is_conservative() {
    let module = lower_roots("@table = global [100000 x ptr] zeroinitializer\n");
    assert_eq!(
        roots(&module).globals[0].layout,
        SlotLayout::Conservative { size: 400_000 }
    );
}
