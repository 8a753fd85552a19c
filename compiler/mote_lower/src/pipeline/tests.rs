#![allow(clippy::unwrap_used, clippy::expect_used)]

use pretty_assertions::assert_eq;

use super::*;
use crate::config::{Scheduler, TargetConfig};
use crate::test_helpers::parse;

/// Exercises every pass: a boxed method call, a closure, a task and a
/// pointer that survives a call.
const PROGRAM: &str = "\
concrete %Counter { Get = @Counter.Get }
interface %Getter { Get }

@chan = internal global ptr null

declare ptr @runtime.alloc(i32)

define i32 @Counter.Get(ptr %self) {
entry:
  %v = load i32, ptr %self
  ret i32 %v
}

define closurecc i32 @bump(i32 %x, ptr %ctx) {
entry:
  %by = capture i32 0
  %r = add i32 %x, %by
  ret i32 %r
}

define void @worker(ptr %c) {
entry:
  chan.send i32 1, ptr %c
  ret void
}

define internal void @unused() {
entry:
  ret void
}

define entry void @main() {
entry:
  %p = call ptr @runtime.alloc(i32 4)
  %g = makeiface %Counter, ptr %p
  %n = ifacecall i32 Get(iface %g)
  %f = makefunc heap @bump(i32 %n)
  %m = callfunc i32 %f(i32 2)
  %c = load ptr, ptr @chan
  spawn @worker(ptr %c)
  %q = load i32, ptr %p
  ret void
}
";

fn run_standard(source: &str, config: TargetConfig) -> (Module, Result<PipelineReport, PipelineError>) {
    let mut module = parse(source);
    let mut ctx = PassContext::new(config);
    let result = Pipeline::standard().run(&mut module, &mut ctx);
    (module, result)
}

#[test]
fn standard_pipeline_order() {
    let names: Vec<&str> = Pipeline::standard().passes().iter().map(|p| p.name).collect();
    assert_eq!(names, ["interface", "func-values", "concurrency", "gc-roots", "dce"]);
}

#[test]
fn full_pipeline_lowers_everything() {
    for scheduler in Scheduler::ALL {
        let (module, result) =
            run_standard(PROGRAM, TargetConfig::default().with_scheduler(*scheduler));
        let report = result.unwrap_or_else(|e| panic!("{scheduler}: {e}"));
        assert_eq!(report.pass_names().len(), 5);
        let text = module.to_string();
        for construct in ["makeiface", "ifacecall", "makefunc", "callfunc", "spawn", "chan.send"] {
            assert!(!text.contains(construct), "{scheduler}: {construct} left\n{text}");
        }
        assert!(module.function("unused").is_none(), "{scheduler}");
        assert!(module.roots.is_some(), "{scheduler}");
    }
}

#[test]
fn pipeline_output_is_deterministic() {
    for scheduler in Scheduler::ALL {
        let config = TargetConfig::default().with_scheduler(*scheduler);
        let (first, _) = run_standard(PROGRAM, config.clone());
        let (second, _) = run_standard(PROGRAM, config);
        assert_eq!(first.to_string(), second.to_string());
    }
}

#[test]
fn failed_pass_is_not_partially_applied() {
    let source = "\
define void @wait(ptr %m) {
entry:
  mutex.lock ptr %m
  ret void
}

define interrupt void @isr(ptr %m) {
entry:
  call void @wait(ptr %m)
  ret void
}
";
    let (module, result) = run_standard(source, TargetConfig::default());
    let err = result.unwrap_err();
    let lower = err.as_lower_error().unwrap();
    assert_eq!(lower.pass, Some("concurrency"));
    assert_eq!(lower.kind, ErrorKind::UnsupportedConstruct);

    // The two passes before it succeeded and changed nothing here.
    assert_eq!(module.to_string(), parse(source).to_string());
}

#[test]
fn unknown_pass_names_the_alternatives() {
    let err = Pipeline::standard().select(&["interface", "inline"]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "unknown pass `inline` (available: interface, func-values, concurrency, gc-roots, dce)"
    );
    assert!(err.as_lower_error().is_none());
}

#[test]
fn prefix_and_until_run_leading_passes() {
    let pipeline = Pipeline::standard();
    let mut ctx = PassContext::default();

    let mut module = parse(PROGRAM);
    let report = pipeline.run_prefix(2, &mut module, &mut ctx).unwrap();
    assert_eq!(report.pass_names(), ["interface", "func-values"]);
    assert_eq!(ctx.completed(), ["interface", "func-values"]);

    let mut module = parse(PROGRAM);
    let mut ctx = PassContext::default();
    let report = pipeline.run_until("concurrency", &mut module, &mut ctx).unwrap();
    assert_eq!(report.pass_names(), ["interface", "func-values", "concurrency"]);
    assert!(ctx.has_run("concurrency"));
    assert!(!ctx.has_run("gc-roots"));

    let err = pipeline.run_prefix(6, &mut module, &mut ctx).unwrap_err();
    assert_eq!(
        err,
        PipelineError::PrefixTooLong {
            requested: 6,
            available: 5
        }
    );
}

#[test]
fn single_pass_checks_its_precondition() {
    let mut module = parse(PROGRAM);
    let mut ctx = PassContext::default();
    let err = Pipeline::standard()
        .run_pass("concurrency", &mut module, &mut ctx)
        .unwrap_err();
    let lower = err.as_lower_error().unwrap();
    assert_eq!(lower.kind, ErrorKind::InternalConsistency);
    assert_eq!(lower.pass, Some("concurrency"));
    assert!(lower.message.starts_with("precondition of `concurrency` failed"), "{}", lower.message);
}

// ── Contract enforcement ────────────────────────────────────────────

fn delete_everything(module: &mut Module, _: &mut PassContext) -> LowerResult<()> {
    module.functions.clear();
    Err(LowerError::unsupported("cannot continue"))
}

fn drop_bodies(module: &mut Module, _: &mut PassContext) -> LowerResult<()> {
    for function in &mut module.functions {
        function.body = None;
    }
    Ok(())
}

fn no_declarations(module: &Module, _: &PassContext) -> Result<(), String> {
    match module.functions.iter().find(|f| f.is_declaration()) {
        Some(f) => Err(format!("@{} lost its body", f.name)),
        None => Ok(()),
    }
}

const SMALL: &str = "define export void @f() {\nentry:\n  ret void\n}\n";

#[test]
fn failure_outside_the_contract_is_internal() {
    let pass = PassDescriptor {
        name: "rogue",
        precondition: no_requirements,
        run: delete_everything,
        postcondition: no_requirements,
        failures: &[ErrorKind::MalformedInput],
    };
    let mut module = parse(SMALL);
    let err = Pipeline::new(vec![pass])
        .run(&mut module, &mut PassContext::default())
        .unwrap_err();
    let lower = err.as_lower_error().unwrap();
    assert_eq!(lower.kind, ErrorKind::InternalConsistency);
    assert_eq!(lower.pass, Some("rogue"));
    assert!(lower.message.contains("outside its contract"), "{}", lower.message);
    assert_eq!(module.functions.len(), 1);
}

#[test]
fn failed_postcondition_restores_the_module() {
    let pass = PassDescriptor {
        name: "strip",
        precondition: no_requirements,
        run: drop_bodies,
        postcondition: no_declarations,
        failures: &[],
    };
    let mut module = parse(SMALL);
    let mut ctx = PassContext::default();
    let err = Pipeline::new(vec![pass]).run(&mut module, &mut ctx).unwrap_err();
    assert!(err.to_string().contains("postcondition of `strip` failed: @f lost its body"), "{err}");
    assert!(!module.functions[0].is_declaration());
    assert!(ctx.completed().is_empty());
}

#[test]
fn failures_become_diagnostics() {
    let err = Pipeline::standard().select(&["nope"]).unwrap_err();
    let diagnostic = err.to_diagnostic();
    assert_eq!(diagnostic.code, mote_diagnostic::ErrorCode::E0004);
}
