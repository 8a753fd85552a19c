//! Property-based tests for the lowering pipeline and the golden comparison.
//!
//! Generated call graphs check that the pipeline is deterministic and that
//! dead-code elimination keeps exactly what the roots reach. Generated IR
//! lines check that the fuzzy comparison ignores only what it should.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Tests can panic")]
#![allow(
    clippy::doc_markdown,
    clippy::uninlined_format_args,
    clippy::redundant_closure_for_method_calls,
    reason = "Proptest macros generate code with these patterns"
)]

use std::collections::BTreeSet;
use std::fmt::Write;

use mote_ir::parse_module;
use mote_lower::golden::fuzzy_equal_ir;
use mote_lower::{PassContext, Pipeline, Scheduler, TargetConfig};
use proptest::prelude::*;

// -- Call graph generation --

/// One generated function: whether it is exported and whom it calls.
#[derive(Clone, Debug)]
struct FnShape {
    export: bool,
    calls: Vec<usize>,
}

fn call_graph_strategy() -> impl Strategy<Value = Vec<FnShape>> {
    (1usize..8).prop_flat_map(|n| {
        prop::collection::vec(
            (any::<bool>(), prop::collection::vec(0..n, 0..4))
                .prop_map(|(export, calls)| FnShape { export, calls }),
            n,
        )
    })
}

fn render(shapes: &[FnShape]) -> String {
    let mut out = String::from("declare ptr @runtime.alloc(i32)\n");
    for (i, shape) in shapes.iter().enumerate() {
        let linkage = if shape.export { "export" } else { "internal" };
        write!(out, "\ndefine {linkage} void @f{i}(ptr %p) {{\nentry:\n").unwrap();
        for (k, callee) in shape.calls.iter().enumerate() {
            writeln!(out, "  %q{k} = call ptr @runtime.alloc(i32 4)").unwrap();
            writeln!(out, "  call void @f{callee}(ptr %q{k})").unwrap();
        }
        out.push_str("  store i32 0, ptr %p\n  ret void\n}\n");
    }
    out
}

fn reachable(shapes: &[FnShape]) -> BTreeSet<usize> {
    let mut seen: BTreeSet<usize> = (0..shapes.len()).filter(|&i| shapes[i].export).collect();
    let mut work: Vec<usize> = seen.iter().copied().collect();
    while let Some(i) = work.pop() {
        for &callee in &shapes[i].calls {
            if seen.insert(callee) {
                work.push(callee);
            }
        }
    }
    seen
}

fn lower(source: &str, scheduler: Scheduler) -> mote_ir::Module {
    let mut module = parse_module(source).unwrap_or_else(|e| panic!("{e}\n{source}"));
    let mut ctx = PassContext::new(TargetConfig::default().with_scheduler(scheduler));
    Pipeline::standard()
        .run(&mut module, &mut ctx)
        .unwrap_or_else(|e| panic!("{e}\n{source}"));
    module
}

// -- IR line generation --

fn ir_line_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        (0i64..100, 0i64..100).prop_map(|(a, b)| format!("  %x = add i32 {a}, {b}")),
        (1u32..5).prop_map(|n| format!("  %p = alloca [{n} x i32]")),
        Just("  ret void".to_owned()),
        Just("@g = global ptr null".to_owned()),
        Just("target triple = \"thumbv7em-none-eabi\"".to_owned()),
    ]
}

/// A line as it might appear in a hand-written fixture.
fn decorate(line: &str, comment: bool, align: Option<u32>, trailing: bool) -> String {
    let mut out = line.to_owned();
    if let Some(align) = align {
        write!(out, ", align {align}").unwrap();
    }
    if trailing {
        out.push_str("   ");
    }
    if comment {
        out.push_str(" ; note");
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pipeline_is_deterministic(shapes in call_graph_strategy()) {
        let source = render(&shapes);
        for scheduler in Scheduler::ALL {
            let first = lower(&source, *scheduler).to_string();
            let second = lower(&source, *scheduler).to_string();
            prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn dce_keeps_exactly_what_roots_reach(shapes in call_graph_strategy()) {
        let module = lower(&render(&shapes), Scheduler::Tasks);
        let live = reachable(&shapes);
        for i in 0..shapes.len() {
            let name = format!("f{i}");
            prop_assert_eq!(
                module.function(&name).is_some(),
                live.contains(&i),
                "@{} in\n{}", name, module
            );
        }
    }

    #[test]
    fn printed_output_parses_back(shapes in call_graph_strategy()) {
        let module = lower(&render(&shapes), Scheduler::Tasks);
        let text = module.to_string();
        let reparsed = parse_module(&text).unwrap_or_else(|e| panic!("{e}\n{text}"));
        prop_assert_eq!(reparsed.to_string(), text);
    }

    #[test]
    fn decoration_is_immaterial(
        lines in prop::collection::vec(
            (ir_line_strategy(), any::<bool>(), any::<bool>(), any::<bool>(), 0usize..3),
            1..12,
        )
    ) {
        let mut plain = String::new();
        let mut decorated = String::from("; fixture header\nsource_filename = \"gen.go\"\n");
        for (line, comment, align, trailing, blanks) in &lines {
            plain.push_str(line);
            plain.push('\n');
            // Alignment only ever appears on one side.
            let align = align.then_some(4);
            decorated.push_str(&decorate(line, *comment, align, *trailing));
            decorated.push_str(&"\n".repeat(1 + blanks));
        }
        prop_assert!(fuzzy_equal_ir(&plain, &decorated), "{}\n---\n{}", plain, decorated);
        prop_assert!(fuzzy_equal_ir(&decorated, &plain));
    }

    #[test]
    fn different_code_never_compares_equal(a in 0i64..100, b in 0i64..100) {
        prop_assume!(a != b);
        let left = format!("  %x = add i32 {a}, 1\n");
        let right = format!("  %x = add i32 {b}, 1 ; {a}\n");
        prop_assert!(!fuzzy_equal_ir(&left, &right));
    }
}
