#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::ir::{Inst, InstKind, Operand};
use crate::roots::{FrameDescriptor, FrameSlot, RootTable, SlotLayout};
use crate::test_helpers::parse;

use super::*;

fn verify_err(source: &str) -> VerifyError {
    verify_module(&parse(source)).expect_err("expected a verification failure")
}

#[test]
fn well_formed_module_passes() {
    let module = parse(
        "concrete %T { M = @T.M }\n\
         interface %I { M }\n\
         define void @T.M(ptr %r) {\nentry:\n  ret void\n}\n\
         define entry void @main(ptr %p) {\n\
         entry:\n  %i = makeiface %T, ptr %p\n  ifacecall void M(iface %i)\n  ret void\n}\n",
    );
    verify_module(&module).unwrap();
}

#[test]
fn undefined_callee() {
    let err = verify_err("define void @f() {\nentry:\n  call void @missing()\n  ret void\n}\n");
    assert_eq!(err.function.as_deref(), Some("f"));
    assert!(err.message.contains("@missing"), "{err}");
}

#[test]
fn undefined_named_type() {
    let err = verify_err("@g = global %Nope zeroinitializer\n");
    assert!(err.message.contains("%Nope"), "{err}");
}

#[test]
fn concrete_method_must_exist() {
    let err = verify_err("concrete %T { M = @gone }\n");
    assert!(err.message.contains("@gone"), "{err}");
}

#[test]
fn undeclared_concrete_in_makeiface() {
    let err = verify_err(
        "define void @f(ptr %p) {\nentry:\n  %i = makeiface %T, ptr %p\n  ret void\n}\n",
    );
    assert!(err.message.contains("concrete type %T"), "{err}");
}

#[test]
fn phi_in_entry_block() {
    let err = verify_err(
        "define i32 @f() {\nentry:\n  %x = phi i32 [ 1, %entry ]\n  br label %entry\n}\n",
    );
    assert!(err.message.contains("phi in entry block"), "{err}");
}

#[test]
fn phi_must_cover_every_reachable_predecessor() {
    let err = verify_err(
        "define i32 @f(i1 %c) {\n\
         entry:\n  br i1 %c, label %a, label %b\n\n\
         a:\n  br label %join\n\n\
         b:\n  br label %join\n\n\
         join:\n  %x = phi i32 [ 1, %a ]\n  ret i32 %x\n}\n",
    );
    assert!(err.message.contains("no value for predecessor %b"), "{err}");
}

#[test]
fn phi_names_only_predecessors() {
    let err = verify_err(
        "define i32 @f() {\n\
         entry:\n  br label %join\n\n\
         other:\n  ret i32 0\n\n\
         join:\n  %x = phi i32 [ 1, %entry ], [ 2, %other ]\n  ret i32 %x\n}\n",
    );
    assert!(err.message.contains("not a predecessor"), "{err}");
}

#[test]
fn unreachable_predecessor_needs_no_phi_value() {
    let module = parse(
        "define i32 @f() {\n\
         entry:\n  br label %join\n\n\
         dead:\n  br label %join\n\n\
         join:\n  %x = phi i32 [ 1, %entry ]\n  ret i32 %x\n}\n",
    );
    verify_module(&module).unwrap();
}

#[test]
fn phi_after_other_instruction() {
    let mut module = parse(
        "define i32 @f() {\n\
         entry:\n  br label %join\n\n\
         join:\n  %x = phi i32 [ 1, %entry ]\n  %y = add i32 %x, 1\n  ret i32 %y\n}\n",
    );
    let body = module.functions[0].body.as_mut().unwrap();
    body.blocks[1].insts.swap(0, 1);
    let err = verify_module(&module).unwrap_err();
    assert!(err.message.contains("phi after non-phi"), "{err}");
}

#[test]
fn value_defined_twice() {
    let mut module = parse(
        "define i32 @f() {\nentry:\n  %x = add i32 1, 2\n  ret i32 %x\n}\n",
    );
    let body = module.functions[0].body.as_mut().unwrap();
    let dup = body.blocks[0].insts[0].clone();
    body.blocks[0].insts.push(dup);
    let err = verify_module(&module).unwrap_err();
    assert!(err.message.contains("defined twice"), "{err}");
}

#[test]
fn value_never_defined() {
    let mut module = parse(
        "define i32 @f() {\nentry:\n  %x = add i32 1, 2\n  ret i32 %x\n}\n",
    );
    let body = module.functions[0].body.as_mut().unwrap();
    body.blocks[0].insts.clear();
    body.blocks[0].insts.push(Inst::effect(InstKind::Call {
        ret: crate::types::Type::Void,
        callee: Operand::global("f"),
        args: vec![],
    }));
    let err = verify_module(&module).unwrap_err();
    assert!(err.message.contains("never defined"), "{err}");
}

#[test]
fn root_table_must_name_existing_frames() {
    let mut module = parse("define void @f() {\nentry:\n  ret void\n}\n");
    module.roots = Some(RootTable {
        globals: vec![],
        frames: vec![FrameDescriptor {
            id: 0,
            function: "g".into(),
            slots: vec![],
            safe_points: vec![],
        }],
    });
    let err = verify_module(&module).unwrap_err();
    assert!(err.message.contains("@g"), "{err}");
}

#[test]
fn root_table_slot_index_in_range() {
    let mut module = parse("define void @f() {\nentry:\n  ret void\n}\n");
    module.roots = Some(RootTable {
        globals: vec![],
        frames: vec![FrameDescriptor {
            id: 0,
            function: "f".into(),
            slots: vec![FrameSlot {
                offset: 12,
                layout: SlotLayout::Conservative { size: 4 },
            }],
            safe_points: vec![vec![0, 1]],
        }],
    });
    let err = verify_module(&module).unwrap_err();
    assert!(err.message.contains("out of range"), "{err}");
}

#[test]
fn error_display_names_the_function() {
    let err = verify_err("define void @f() {\nentry:\n  call void @missing()\n  ret void\n}\n");
    assert!(err.to_string().starts_with("in @f: "), "{err}");
}

#[test]
fn undefined_symbol_in_terminator() {
    let err = verify_err("define ptr @get() {\nentry:\n  ret ptr @gone\n}\n");
    assert_eq!(err.function.as_deref(), Some("get"));
    assert!(err.message.contains("@gone"), "{err}");
}
