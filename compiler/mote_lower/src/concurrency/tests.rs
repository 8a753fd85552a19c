#![allow(clippy::unwrap_used, clippy::expect_used)]

use pretty_assertions::assert_eq;

use super::*;
use crate::config::TargetConfig;
use crate::test_helpers::{function_text, lower, lower_err_with, lower_with};

fn coroutines() -> TargetConfig {
    TargetConfig::default().with_scheduler(Scheduler::Coroutines)
}

const PING_PONG: &str = "\
define void @worker(ptr %ch, i32 %v) {
entry:
  chan.send i32 %v, ptr %ch
  ret void
}

define entry void @main(ptr %ch) {
entry:
  spawn @worker(ptr %ch, i32 7)
  %x = chan.recv i32, ptr %ch
  ret void
}
";

#[test]
fn tasks_pause_at_blocking_operations() {
    let module = lower(NAME, PING_PONG);
    assert_eq!(
        function_text(&module, "main"),
        "define entry void @main(ptr %ch) {
entry:
  %x.buf = alloca i32
  %worker.args = call ptr @runtime.alloc(i32 8)
  %worker.args.field0 = gep %worker$args, ptr %worker.args, i32 0
  store ptr %ch, ptr %worker.args.field0
  %worker.args.field1 = gep %worker$args, ptr %worker.args, i32 1
  store i32 7, ptr %worker.args.field1
  call void @runtime.startTask(ptr @worker$gowrapper, ptr %worker.args, i32 2048)
  call void @runtime.chanRecvWait(ptr %ch, ptr %x.buf)
  call void @runtime.taskPause()
  %x = load i32, ptr %x.buf
  ret void
}
"
    );
    assert_eq!(
        function_text(&module, "worker"),
        "define void @worker(ptr %ch, i32 %v) {
entry:
  %chan.send.buf = alloca i32
  store i32 %v, ptr %chan.send.buf
  call void @runtime.chanSendWait(ptr %ch, ptr %chan.send.buf)
  call void @runtime.taskPause()
  ret void
}
"
    );
    assert_eq!(
        function_text(&module, "worker$gowrapper"),
        "define internal wrapper void @worker$gowrapper(ptr %args) {
entry:
  %arg0.addr = gep %worker$args, ptr %args, i32 0
  %arg0 = load ptr, ptr %arg0.addr
  %arg1.addr = gep %worker$args, ptr %args, i32 1
  %arg1 = load i32, ptr %arg1.addr
  call void @worker(ptr %arg0, i32 %arg1)
  call void @runtime.taskExit()
  unreachable
}
"
    );
}

#[test]
fn task_stack_size_comes_from_the_config() {
    let config = TargetConfig {
        task_stack_size: 512,
        ..TargetConfig::default()
    };
    let module = lower_with(NAME, PING_PONG, config);
    assert!(function_text(&module, "main").contains("ptr %worker.args, i32 512)"));
}

const PING: &str = "\
define void @ping(ptr %p) {
entry:
  store i32 1, ptr %p
  ret void
}

define entry void @main(ptr %p) {
entry:
  spawn @ping(ptr %p)
  ret void
}
";

#[test]
fn units_that_never_block_are_not_split() {
    for scheduler in Scheduler::ALL {
        let module = lower_with(NAME, PING, TargetConfig::default().with_scheduler(*scheduler));
        assert!(module.function("ping$cont0").is_none(), "{scheduler}");
        assert!(module.function("ping$resume").is_none(), "{scheduler}");
        assert!(module.function("ping$gowrapper").is_some(), "{scheduler}");
        assert_eq!(
            function_text(&module, "ping"),
            "define void @ping(ptr %p) {
entry:
  store i32 1, ptr %p
  ret void
}
"
        );
    }

    let module = lower_with(NAME, PING, coroutines());
    let main = function_text(&module, "main");
    assert!(
        main.contains("  call void @runtime.schedule(ptr @ping$gowrapper, ptr %ping.args)\n"),
        "{main}"
    );
    let wrapper = function_text(&module, "ping$gowrapper");
    assert!(wrapper.ends_with("  call void @runtime.taskExit()\n  ret void\n}\n"), "{wrapper}");
}

const COUNTER: &str = "\
define void @counter(ptr %ch, i32 %n) {
entry:
  br label %loop

loop:
  %i = phi i32 [ 0, %entry ], [ %next, %loop ]
  chan.send i32 %i, ptr %ch
  %next = add i32 %i, 1
  %done = icmp eq i32 %next, %n
  br i1 %done, label %exit, label %loop

exit:
  ret void
}

define entry void @main(ptr %ch) {
entry:
  spawn @counter(ptr %ch, i32 3)
  ret void
}
";

#[test]
fn blocking_unit_is_split_into_continuations() {
    let module = lower_with(NAME, COUNTER, coroutines());
    assert!(module.function("counter").is_none());

    assert_eq!(
        function_text(&module, "main"),
        "define entry void @main(ptr %ch) {
entry:
  %counter.state = call ptr @runtime.alloc(i32 20)
  store i32 0, ptr %counter.state
  %counter.state.field1 = gep %counter$state.0, ptr %counter.state, i32 1
  store ptr %ch, ptr %counter.state.field1
  %counter.state.field2 = gep %counter$state.0, ptr %counter.state, i32 2
  store i32 3, ptr %counter.state.field2
  call void @runtime.schedule(ptr @counter$resume, ptr %counter.state)
  ret void
}
"
    );
    assert_eq!(
        function_text(&module, "counter$resume"),
        "define internal void @counter$resume(ptr %state) {
entry:
  %tag = load i32, ptr %state
  switch i32 %tag, label %invalid [ i32 0, label %state.0, i32 1, label %state.1 ]

state.0:
  call void @counter$cont0(ptr %state)
  ret void

state.1:
  call void @counter$cont1(ptr %state)
  ret void

invalid:
  unreachable
}
"
    );

    let cont0 = function_text(&module, "counter$cont0");
    assert!(
        cont0.starts_with(
            "define internal void @counter$cont0(ptr %state) {
resume:
  %ch.slot = gep %counter$state.0, ptr %state, i32 1
  %ch = load ptr, ptr %ch.slot
  %n.slot = gep %counter$state.0, ptr %state, i32 2
  %n = load i32, ptr %n.slot
  br label %entry
"
        ),
        "{cont0}"
    );
    assert!(cont0.contains("  %i = phi i32 [ 0, %entry ]\n"), "{cont0}");
    assert!(cont0.contains("  store i32 1, ptr %state\n"), "{cont0}");
    assert!(
        cont0.contains("  call void @runtime.chanSendWait(ptr %ch, ptr %chan.send.buf)\n  ret void\n"),
        "{cont0}"
    );
    assert!(!cont0.contains("exit:"), "{cont0}");

    // The loop counter is restored at the resume point and redefined by
    // the loop header.
    let cont1 = function_text(&module, "counter$cont1");
    assert!(cont1.contains("  %i.1 = load i32, ptr %i.slot\n"), "{cont1}");
    assert!(cont1.contains("  %next = add i32 %i.1, 1\n"), "{cont1}");
    assert!(cont1.contains("  %i = phi i32 [ %next, %loop.after ]\n"), "{cont1}");
    assert!(
        cont1.contains("exit:\n  call void @runtime.taskExit()\n  ret void\n"),
        "{cont1}"
    );
    assert!(!cont1.contains("entry:"), "{cont1}");

    let text = module.to_string();
    assert!(
        text.contains("type %counter$state.1 = { i32, i32, ptr, i32, i32 }\n"),
        "{text}"
    );
}

#[test]
fn blocking_entry_becomes_a_bootstrap() {
    let source = "\
define entry void @main(i64 %d) {
entry:
  sleep i64 %d
  ret void
}
";
    let module = lower_with(NAME, source, coroutines());
    assert_eq!(
        function_text(&module, "main"),
        "define entry void @main(i64 %d) {
entry:
  %state = call ptr @runtime.alloc(i32 16)
  store i32 0, ptr %state
  %state.field1 = gep %main$state.0, ptr %state, i32 1
  store i64 %d, ptr %state.field1
  call void @runtime.schedule(ptr @main$resume, ptr %state)
  call void @runtime.scheduler()
  ret void
}
"
    );
    assert_eq!(
        function_text(&module, "main$cont0"),
        "define internal void @main$cont0(ptr %state) {
resume:
  %d.slot = gep %main$state.0, ptr %state, i32 1
  %d = load i64, ptr %d.slot
  br label %entry

entry:
  store i32 1, ptr %state
  call void @runtime.sleepWait(i64 %d)
  ret void
}
"
    );
    assert_eq!(
        function_text(&module, "main$cont1"),
        "define internal void @main$cont1(ptr %state) {
resume:
  br label %entry.after

entry.after:
  call void @runtime.taskExit()
  ret void
}
"
    );
}

#[test]
fn received_value_is_read_back_from_the_state() {
    let source = "\
define entry void @main(ptr %ch, ptr %out) {
entry:
  %v = chan.recv i32, ptr %ch
  store i32 %v, ptr %out
  ret void
}
";
    let module = lower_with(NAME, source, coroutines());
    let cont0 = function_text(&module, "main$cont0");
    assert!(
        cont0.contains("  %chan.recv.buf = gep %main$state.1, ptr %state, i32 1\n"),
        "{cont0}"
    );
    assert!(
        cont0.contains("  call void @runtime.chanRecvWait(ptr %ch, ptr %chan.recv.buf)\n"),
        "{cont0}"
    );
    let cont1 = function_text(&module, "main$cont1");
    assert!(cont1.contains("  %v.slot = gep %main$state.1, ptr %state, i32 1\n"), "{cont1}");
    assert!(cont1.contains("  %v = load i32, ptr %v.slot\n"), "{cont1}");
    assert!(cont1.contains("  store i32 %v, ptr %out\n"), "{cont1}");
}

#[test]
fn interrupt_handlers_cannot_block() {
    let source = "\
define void @wait(ptr %m) {
entry:
  mutex.lock ptr %m
  ret void
}

define interrupt void @isr(ptr %m) {
entry:
  call void @wait(ptr %m) !loc(\"isr.go\", 4, 2)
  ret void
}
";
    for scheduler in Scheduler::ALL {
        let err = lower_err_with(NAME, source, TargetConfig::default().with_scheduler(*scheduler));
        assert_eq!(err.kind, ErrorKind::UnsupportedConstruct);
        assert_eq!(err.function.as_deref(), Some("isr"));
        assert_eq!(err.instruction.as_deref(), Some("call void @wait(ptr %m)"));
        assert_eq!(err.loc.as_ref().map(|l| l.line), Some(4));
    }
}

#[test]
fn coroutines_reject_blocking_outside_units() {
    let source = "\
define void @helper(ptr %g) {
entry:
  wg.wait ptr %g
  ret void
}
";
    let err = lower_err_with(NAME, source, coroutines());
    assert_eq!(err.kind, ErrorKind::UnsupportedConstruct);
    assert!(err.message.contains("outside a concurrency unit"), "{}", err.message);
    assert_eq!(err.instruction.as_deref(), Some("wg.wait ptr %g"));

    // The same module is fine with per-task stacks.
    let module = lower(NAME, source);
    assert!(function_text(&module, "helper").contains("@runtime.waitGroupWait(ptr %g)"));
}

#[test]
fn coroutine_units_cannot_call_blocking_functions() {
    let source = "\
define entry void @main(ptr %g) {
entry:
  call void @helper(ptr %g)
  ret void
}

define void @helper(ptr %g) {
entry:
  wg.wait ptr %g
  ret void
}
";
    let err = lower_err_with(NAME, source, coroutines());
    assert_eq!(err.kind, ErrorKind::UnsupportedConstruct);
    assert!(err.message.contains("calls @helper, which may block"), "{}", err.message);
}

#[test]
fn split_units_cannot_be_called_directly() {
    let source = "\
define void @sleeper() {
entry:
  sleep i64 10
  ret void
}

define entry void @main() {
entry:
  spawn @sleeper()
  call void @sleeper()
  ret void
}
";
    let err = lower_err_with(NAME, source, coroutines());
    assert_eq!(err.kind, ErrorKind::UnsupportedConstruct);
    assert!(err.message.contains("direct call to @sleeper"), "{}", err.message);
    assert_eq!(err.function.as_deref(), Some("main"));
}

#[test]
fn indirect_branch_near_a_split_point_is_unsupported() {
    let source = "\
define entry void @main(ptr %target) {
entry:
  sleep i64 1
  indirectbr ptr %target, [ label %a, label %b ]

a:
  ret void

b:
  ret void
}
";
    let err = lower_err_with(NAME, source, coroutines());
    assert_eq!(err.kind, ErrorKind::UnsupportedConstruct);
    assert_eq!(err.function.as_deref(), Some("main"));
    assert_eq!(err.instruction.as_deref(), Some("sleep i64 1"));
}

#[test]
fn spawn_arguments_must_match() {
    let err = lower_err_with(
        NAME,
        "define void @w(i32 %x) {\nentry:\n  ret void\n}\n\
         define entry void @main() {\nentry:\n  spawn @w(i64 1)\n  ret void\n}\n",
        TargetConfig::default(),
    );
    assert_eq!(err.kind, ErrorKind::MalformedInput);
    assert_eq!(err.instruction.as_deref(), Some("spawn @w(i64 1)"));
}

#[test]
fn modules_without_concurrency_are_untouched() {
    let source = "define export i32 @f(i32 %x) {\nentry:\n  ret i32 %x\n}\n";
    for scheduler in Scheduler::ALL {
        let module = lower_with(NAME, source, TargetConfig::default().with_scheduler(*scheduler));
        assert_eq!(module.to_string(), crate::test_helpers::parse(source).to_string());
    }
}
