//! Target configuration consumed by the lowering passes.
//!
//! The configuration is an exogenous input: which concurrency strategy a
//! target uses, how wide its pointers are and how large task stacks are is
//! decided by whoever describes the board, never by the passes themselves.

use std::fmt;
use std::str::FromStr;

/// How concurrency units are lowered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Scheduler {
    /// Fixed-size stack per unit, cooperative switching at blocking points.
    #[default]
    Tasks,
    /// Units split into continuation functions over an explicit state record.
    Coroutines,
}

impl Scheduler {
    pub const ALL: &'static [Scheduler] = &[Scheduler::Tasks, Scheduler::Coroutines];

    pub fn as_str(self) -> &'static str {
        match self {
            Scheduler::Tasks => "tasks",
            Scheduler::Coroutines => "coroutines",
        }
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown scheduler name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown scheduler `{0}` (expected `tasks` or `coroutines`)")]
pub struct UnknownScheduler(pub String);

impl FromStr for Scheduler {
    type Err = UnknownScheduler;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|sched| sched.as_str() == s)
            .ok_or_else(|| UnknownScheduler(s.to_owned()))
    }
}

/// Per-target lowering parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetConfig {
    /// Pointer width in bytes.
    pub pointer_size: u32,
    pub scheduler: Scheduler,
    /// Stack size handed to `runtime.startTask` for every new task.
    pub task_stack_size: u32,
    /// Largest implementation set dispatched through a comparison chain;
    /// larger sets use a dispatch table.
    pub chain_limit: usize,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            pointer_size: 4,
            scheduler: Scheduler::Tasks,
            task_stack_size: 2048,
            chain_limit: 3,
        }
    }
}

impl TargetConfig {
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_names_round_trip() {
        for sched in Scheduler::ALL {
            assert_eq!(sched.as_str().parse::<Scheduler>().unwrap(), *sched);
        }
        let err = "threads".parse::<Scheduler>().unwrap_err();
        assert_eq!(err.to_string(), "unknown scheduler `threads` (expected `tasks` or `coroutines`)");
    }

    #[test]
    fn defaults_target_small_devices() {
        let config = TargetConfig::default();
        assert_eq!(config.pointer_size, 4);
        assert_eq!(config.scheduler, Scheduler::Tasks);
        assert_eq!(config.task_stack_size, 2048);
        assert_eq!(config.chain_limit, 3);
    }
}
