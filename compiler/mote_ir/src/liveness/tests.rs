#![allow(clippy::unwrap_used, clippy::expect_used)]

use pretty_assertions::assert_eq;

use crate::test_helpers::{block, body, names, parse, value};

use super::*;

#[test]
fn straight_line() {
    let module = parse(
        "declare void @use(ptr)\n\
         define void @f(ptr %p) {\n\
         entry:\n  \
           %a = load ptr, ptr %p\n  \
           call void @use(ptr %a)\n  \
           call void @use(ptr %p)\n  \
           ret void\n}\n",
    );
    let body = body(&module, "f");
    let live = compute_liveness(body);
    assert_eq!(names(body, &live.live_in[0]), vec!["p"]);
    assert!(live.live_out[0].is_empty());

    let after = live.live_after(body, body.entry());
    assert_eq!(names(body, &after[0]), vec!["a", "p"]);
    assert_eq!(names(body, &after[1]), vec!["p"]);
    assert!(after[2].is_empty());
}

#[test]
fn phi_operand_is_live_on_its_edge_only() {
    let module = parse(
        "define i32 @f(i1 %c, i32 %x, i32 %y) {\n\
         entry:\n  br i1 %c, label %a, label %b\n\n\
         a:\n  br label %join\n\n\
         b:\n  br label %join\n\n\
         join:\n  %r = phi i32 [ %x, %a ], [ %y, %b ]\n  ret i32 %r\n}\n",
    );
    let body = body(&module, "f");
    let live = compute_liveness(body);
    let a = block(body, "a");
    let b = block(body, "b");
    let join = block(body, "join");

    assert_eq!(names(body, &live.live_out[a.index()]), vec!["x"]);
    assert_eq!(names(body, &live.live_out[b.index()]), vec!["y"]);
    assert!(live.live_in[join.index()].is_empty());
    assert_eq!(names(body, &live.live_in[0]), vec!["c", "x", "y"]);
}

#[test]
fn loop_carried_value_stays_live() {
    let module = parse(
        "declare void @tick()\n\
         define void @f(ptr %keep, i32 %n) {\n\
         entry:\n  br label %loop\n\n\
         loop:\n  \
           %i = phi i32 [ 0, %entry ], [ %next, %loop ]\n  \
           call void @tick()\n  \
           %next = add i32 %i, 1\n  \
           store ptr %keep, ptr %keep\n  \
           %done = icmp eq i32 %next, %n\n  \
           br i1 %done, label %exit, label %loop\n\n\
         exit:\n  ret void\n}\n",
    );
    let body = body(&module, "f");
    let live = compute_liveness(body);
    let lp = block(body, "loop");
    assert_eq!(names(body, &live.live_in[lp.index()]), vec!["keep", "n"]);
    assert_eq!(names(body, &live.live_out[lp.index()]), vec!["keep", "n", "next"]);

    // After the call: %i is still needed by the add.
    let after = live.live_after(body, lp);
    let i = value(body, "i");
    assert!(after[1].contains(&i));
    assert!(!after[2].contains(&i));
}
