//! Property-based tests for the textual IR.
//!
//! Generated modules must survive parse → print → parse unchanged: printing
//! is a fixed point and the verifier accepts what the parser builds.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Tests can panic")]
#![allow(
    clippy::uninlined_format_args,
    reason = "Proptest macros generate code with these patterns"
)]

use std::fmt::Write;

use mote_ir::{parse_module, verify_module, BinOp, ICmpPred};
use proptest::prelude::*;

/// One generated function: a chain of binary operations feeding a branch.
#[derive(Clone, Debug)]
struct FnShape {
    export: bool,
    ops: Vec<(BinOp, i64)>,
    pred: ICmpPred,
    bound: i64,
    loc: Option<(u32, u32)>,
}

fn fn_shape_strategy() -> impl Strategy<Value = FnShape> {
    (
        any::<bool>(),
        prop::collection::vec((prop::sample::select(BinOp::ALL), -50i64..50), 0..6),
        prop::sample::select(ICmpPred::ALL),
        -100i64..100,
        prop::option::of((1u32..500, 1u32..80)),
    )
        .prop_map(|(export, ops, pred, bound, loc)| FnShape {
            export,
            ops,
            pred,
            bound,
            loc,
        })
}

fn render(globals: &[(bool, i64)], shapes: &[FnShape]) -> String {
    let mut out = String::new();
    for (i, (internal, init)) in globals.iter().enumerate() {
        let linkage = if *internal { "internal " } else { "" };
        writeln!(out, "@g{i} = {linkage}global i32 {init}").unwrap();
    }
    for (i, shape) in shapes.iter().enumerate() {
        let linkage = if shape.export { "export " } else { "" };
        write!(out, "\ndefine {linkage}i32 @f{i}(i32 %x) {{\nentry:\n").unwrap();
        let mut last = "%x".to_owned();
        for (k, (op, rhs)) in shape.ops.iter().enumerate() {
            writeln!(out, "  %v{k} = {} i32 {last}, {rhs}", op.as_str()).unwrap();
            last = format!("%v{k}");
        }
        write!(out, "  %c = icmp {} i32 {last}, {}", shape.pred.as_str(), shape.bound).unwrap();
        if let Some((line, column)) = shape.loc {
            write!(out, " !loc(\"gen.go\", {line}, {column})").unwrap();
        }
        writeln!(out, "\n  br i1 %c, label %yes, label %no\n").unwrap();
        writeln!(out, "yes:\n  ret i32 {last}\n\nno:\n  ret i32 0\n}}").unwrap();
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn printing_is_a_fixed_point(
        globals in prop::collection::vec((any::<bool>(), -1000i64..1000), 0..4),
        shapes in prop::collection::vec(fn_shape_strategy(), 1..5),
    ) {
        let source = render(&globals, &shapes);
        let module = parse_module(&source).unwrap_or_else(|e| panic!("{e}\n{source}"));
        verify_module(&module).unwrap_or_else(|e| panic!("{e}\n{source}"));

        let printed = module.to_string();
        let reparsed = parse_module(&printed).unwrap_or_else(|e| panic!("{e}\n{printed}"));
        prop_assert_eq!(reparsed.to_string(), printed);
        prop_assert_eq!(reparsed.functions.len(), shapes.len());
        prop_assert_eq!(reparsed.globals.len(), globals.len());
    }
}
