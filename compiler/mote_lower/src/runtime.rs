//! Run-time support symbols the passes emit calls to.
//!
//! Each symbol is declared on demand, the first time a pass needs it, so a
//! module that never uses a feature never mentions its runtime half.

use mote_ir::{FnAttrs, Module, Type};

/// Head of the linked list of active GC frame records.
pub const GC_STACK_CHAIN: &str = "runtime.gcStackChain";

/// A run-time function the lowered program calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    /// `ptr (i32 size)`: allocate collector-managed memory.
    Alloc,
    /// Panic on a nil interface receiver. Never returns.
    NilPanic,
    /// `void (ptr fn, ptr args, i32 stack_size)`: start a task with its own stack.
    StartTask,
    /// `void (ptr fn, ptr arg)`: queue a resumable unit.
    Schedule,
    /// Run queued units until none is runnable.
    Scheduler,
    /// Yield the current task to the scheduler.
    TaskPause,
    /// Mark the current unit finished.
    TaskExit,
    ChanSendWait,
    ChanRecvWait,
    SleepWait,
    MutexLockWait,
    WaitGroupWait,
}

impl RuntimeFn {
    pub const ALL: &'static [RuntimeFn] = &[
        RuntimeFn::Alloc,
        RuntimeFn::NilPanic,
        RuntimeFn::StartTask,
        RuntimeFn::Schedule,
        RuntimeFn::Scheduler,
        RuntimeFn::TaskPause,
        RuntimeFn::TaskExit,
        RuntimeFn::ChanSendWait,
        RuntimeFn::ChanRecvWait,
        RuntimeFn::SleepWait,
        RuntimeFn::MutexLockWait,
        RuntimeFn::WaitGroupWait,
    ];

    /// The runtime function called `name`, if any.
    pub fn from_name(name: &str) -> Option<RuntimeFn> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeFn::Alloc => "runtime.alloc",
            RuntimeFn::NilPanic => "runtime.nilPanic",
            RuntimeFn::StartTask => "runtime.startTask",
            RuntimeFn::Schedule => "runtime.schedule",
            RuntimeFn::Scheduler => "runtime.scheduler",
            RuntimeFn::TaskPause => "runtime.taskPause",
            RuntimeFn::TaskExit => "runtime.taskExit",
            RuntimeFn::ChanSendWait => "runtime.chanSendWait",
            RuntimeFn::ChanRecvWait => "runtime.chanRecvWait",
            RuntimeFn::SleepWait => "runtime.sleepWait",
            RuntimeFn::MutexLockWait => "runtime.mutexLockWait",
            RuntimeFn::WaitGroupWait => "runtime.waitGroupWait",
        }
    }

    fn signature(self) -> (Type, Vec<Type>) {
        match self {
            RuntimeFn::Alloc => (Type::Ptr, vec![Type::I32]),
            RuntimeFn::NilPanic
            | RuntimeFn::Scheduler
            | RuntimeFn::TaskPause
            | RuntimeFn::TaskExit => (Type::Void, Vec::new()),
            RuntimeFn::StartTask => (Type::Void, vec![Type::Ptr, Type::Ptr, Type::I32]),
            RuntimeFn::Schedule | RuntimeFn::ChanSendWait | RuntimeFn::ChanRecvWait => {
                (Type::Void, vec![Type::Ptr, Type::Ptr])
            }
            RuntimeFn::SleepWait => (Type::Void, vec![Type::I64]),
            RuntimeFn::MutexLockWait | RuntimeFn::WaitGroupWait => (Type::Void, vec![Type::Ptr]),
        }
    }

    fn attrs(self) -> FnAttrs {
        match self {
            RuntimeFn::NilPanic => FnAttrs::NOGC,
            _ => FnAttrs::empty(),
        }
    }

    /// Declare the function in `module` unless it is already there.
    pub fn declare(self, module: &mut Module) {
        let (ret, params) = self.signature();
        module.declare_function(self.name(), ret, params, self.attrs());
    }
}

/// Declare the GC frame chain head.
pub fn declare_gc_stack_chain(module: &mut Module) {
    module.declare_global(GC_STACK_CHAIN, Type::Ptr);
}
