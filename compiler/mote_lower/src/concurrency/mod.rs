//! Concurrency lowering.
//!
//! A concurrency unit is a `spawn` target or an `entry` function. Every unit
//! is lowered with the strategy the target configuration selects:
//!
//! - [`Scheduler::Tasks`]: each spawned unit gets its own fixed-size stack
//!   from `runtime.startTask`. A blocking operation registers the wait with
//!   the runtime and yields through `runtime.taskPause`; the unit's call
//!   stack stays where it is.
//! - [`Scheduler::Coroutines`]: units that block are split at every blocking
//!   operation into continuation functions driven by an explicit state
//!   record (see [`coroutines`]). Units that never block run to completion
//!   when the scheduler picks them up.
//!
//! Launch sites pack their arguments into a heap record handed to a
//! generated `@"F$gowrapper"` trampoline, or straight into the unit's state
//! record when the unit is split.

mod coroutines;
mod ssa;
mod tasks;

use std::collections::{BTreeMap, BTreeSet};

use mote_ir::{
    inst_to_string, Arg, BlockingOp, DataLayout, FnAttrs, Function, Inst, InstKind, Module,
    Operand, Terminator, Type,
};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::config::Scheduler;
use crate::context::PassContext;
use crate::edit::{fresh_type, Emit};
use crate::error::{ErrorKind, LowerError, LowerResult};
use crate::pipeline::{find_inst, forbid, PassDescriptor};
use crate::runtime::RuntimeFn;

pub const NAME: &str = "concurrency";

pub fn descriptor() -> PassDescriptor {
    PassDescriptor {
        name: NAME,
        precondition,
        run: lower_concurrency,
        postcondition,
        failures: &[ErrorKind::MalformedInput, ErrorKind::UnsupportedConstruct],
    }
}

/// Closures must already be plain calls: a unit is only ever reached
/// through `spawn` or the entry point.
fn precondition(module: &Module, _: &PassContext) -> Result<(), String> {
    match find_inst(module, InstKind::is_func_value_construct) {
        Some(found) => Err(format!("function-value construct left: {found}")),
        None => Ok(()),
    }
}

fn postcondition(module: &Module, _: &PassContext) -> Result<(), String> {
    forbid(module, "concurrency construct", InstKind::is_concurrency_construct)
}

/// Lower every launch site and blocking operation in `module`.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(scheduler = %ctx.config.scheduler, functions = module.functions.len())
)]
pub fn lower_concurrency(module: &mut Module, ctx: &mut PassContext) -> LowerResult<()> {
    let facts: Vec<FunctionFacts> = module.functions.par_iter().map(collect_facts).collect();
    let analysis = Analysis::new(module, facts)?;
    if analysis.is_empty() {
        return Ok(());
    }
    analysis.check_interrupts(module)?;

    match ctx.config.scheduler {
        Scheduler::Tasks => tasks::lower(module, &analysis, &ctx.config),
        Scheduler::Coroutines => coroutines::lower(module, &analysis, &ctx.config),
    }
}

// ── Analysis ────────────────────────────────────────────────────────

/// Where a blocking operation or call sits, for diagnostics.
#[derive(Clone, Debug)]
struct Site {
    instruction: String,
    loc: Option<mote_ir::DebugLoc>,
}

/// What one function contributes to the analysis.
#[derive(Debug, Default)]
struct FunctionFacts {
    name: String,
    /// First blocking operation, if any.
    blocking: Option<Site>,
    /// `(target, arg types, site)` of every `spawn`.
    spawns: Vec<(String, Vec<Type>, Site)>,
    /// Direct callees with the first call site of each.
    calls: Vec<(String, Site)>,
}

fn collect_facts(function: &Function) -> FunctionFacts {
    let mut facts = FunctionFacts {
        name: function.name.clone(),
        ..FunctionFacts::default()
    };
    let Some(body) = &function.body else {
        return facts;
    };
    let mut seen = FxHashSet::default();
    for inst in body.blocks.iter().flat_map(|b| b.insts.iter()) {
        let site = || Site {
            instruction: inst_to_string(body, inst),
            loc: inst.loc.clone(),
        };
        match &inst.kind {
            InstKind::Blocking(_) if facts.blocking.is_none() => facts.blocking = Some(site()),
            InstKind::Spawn { target, args } => {
                let types = args.iter().map(|(ty, _)| ty.clone()).collect();
                facts.spawns.push((target.clone(), types, site()));
            }
            InstKind::Call { callee, .. } => {
                if let Some(callee) = callee.as_global() {
                    if seen.insert(callee.to_owned()) {
                        facts.calls.push((callee.to_owned(), site()));
                    }
                }
            }
            _ => {}
        }
    }
    facts
}

/// Whole-program concurrency facts.
pub(crate) struct Analysis {
    /// Spawn targets and entry functions.
    units: BTreeSet<String>,
    /// Functions containing a blocking operation, with the first one.
    blocking: BTreeMap<String, Site>,
    /// Functions that block themselves or call one that may block.
    may_block: FxHashSet<String>,
    facts: Vec<FunctionFacts>,
}

impl Analysis {
    fn new(module: &Module, facts: Vec<FunctionFacts>) -> LowerResult<Self> {
        let mut units = BTreeSet::new();
        for function in &module.functions {
            if function.has(FnAttrs::ENTRY) && !function.is_declaration() {
                units.insert(function.name.clone());
            }
        }
        for fact in &facts {
            for (target, types, site) in &fact.spawns {
                let malformed = |message: String| {
                    LowerError::malformed(message)
                        .in_function(&fact.name)
                        .with_instruction(site.instruction.clone())
                        .with_loc(site.loc.clone())
                };
                let Some(callee) = module.function(target) else {
                    return Err(malformed(format!("spawn of undefined function @{target}")));
                };
                if callee.is_declaration() {
                    return Err(malformed(format!(
                        "spawn of @{target}, which has no body to run as a unit"
                    )));
                }
                if callee.params != *types {
                    return Err(malformed(format!(
                        "spawn arguments do not match the parameters of @{target}"
                    )));
                }
                units.insert(target.clone());
            }
        }

        let blocking: BTreeMap<String, Site> = facts
            .iter()
            .filter_map(|f| Some((f.name.clone(), f.blocking.clone()?)))
            .collect();

        // Callers of blocking functions may block too, up to a fixpoint.
        let mut may_block: FxHashSet<String> = blocking.keys().cloned().collect();
        loop {
            let before = may_block.len();
            for fact in &facts {
                if !may_block.contains(&fact.name)
                    && fact.calls.iter().any(|(c, _)| may_block.contains(c))
                {
                    may_block.insert(fact.name.clone());
                }
            }
            if may_block.len() == before {
                break;
            }
        }

        debug!(
            units = units.len(),
            blocking = blocking.len(),
            may_block = may_block.len(),
            "concurrency analysis"
        );
        Ok(Analysis {
            units,
            blocking,
            may_block,
            facts,
        })
    }

    fn is_empty(&self) -> bool {
        self.blocking.is_empty() && self.facts.iter().all(|f| f.spawns.is_empty())
    }

    pub(crate) fn is_unit(&self, name: &str) -> bool {
        self.units.contains(name)
    }

    pub(crate) fn blocks(&self, name: &str) -> bool {
        self.blocking.contains_key(name)
    }

    /// Interrupt handlers run outside every unit and must never wait.
    fn check_interrupts(&self, module: &Module) -> LowerResult<()> {
        for fact in &self.facts {
            if !module.function_has(&fact.name, FnAttrs::INTERRUPT)
                || !self.may_block.contains(&fact.name)
            {
                continue;
            }
            let site = match &fact.blocking {
                Some(site) => site,
                None => fact
                    .calls
                    .iter()
                    .find(|(callee, _)| self.may_block.contains(callee))
                    .map(|(_, site)| site)
                    .ok_or_else(|| LowerError::internal("blocking interrupt without a site"))?,
            };
            return Err(self.unsupported(
                &fact.name,
                site,
                "interrupt handlers cannot block".to_owned(),
            ));
        }
        Ok(())
    }

    fn unsupported(&self, function: &str, site: &Site, message: String) -> LowerError {
        LowerError::unsupported(message)
            .in_function(function)
            .with_instruction(site.instruction.clone())
            .with_loc(site.loc.clone())
    }

    /// Every function some `spawn` launches.
    pub(crate) fn spawn_targets(&self) -> BTreeSet<&str> {
        self.facts
            .iter()
            .flat_map(|f| f.spawns.iter().map(|(t, _, _)| t.as_str()))
            .collect()
    }
}

// ── Launch support shared by both strategies ────────────────────────

/// How a launch site hands its arguments over.
#[derive(Clone, Debug)]
pub(crate) struct ArgsRecord {
    /// `%"F$args"`, absent for a unit without parameters.
    pub ty: Option<Type>,
    pub size: u32,
}

impl ArgsRecord {
    pub fn new(
        module: &mut Module,
        target: &str,
        params: &[Type],
        pointer_size: u32,
    ) -> LowerResult<Self> {
        if params.is_empty() {
            return Ok(ArgsRecord { ty: None, size: 0 });
        }
        let ty = fresh_type(module, &format!("{target}$args"), Type::Struct(params.to_vec()));
        let size = DataLayout::new(module, pointer_size)
            .size_of(&ty)
            .map_err(|err| LowerError::from(err).in_function(target))?;
        Ok(ArgsRecord { ty: Some(ty), size })
    }

    /// Allocate the record and store `args` into it; the record pointer, or
    /// `null` when there is nothing to pass.
    pub fn pack(&self, emit: &mut Emit<'_>, target: &str, args: &[Arg]) -> Operand {
        let Some(ty) = &self.ty else {
            return Operand::Null;
        };
        let record = emit.value(
            &format!("{target}.args"),
            Type::Ptr,
            InstKind::Call {
                ret: Type::Ptr,
                callee: Operand::global(RuntimeFn::Alloc.name()),
                args: vec![(Type::I32, Operand::Int(i64::from(self.size)))],
            },
        );
        for (index, (arg_ty, value)) in args.iter().enumerate() {
            let hint = emit.operand_hint(&record, &format!("field{index}"));
            let addr = emit.gep(&hint, ty, record.clone(), index as i64);
            emit.store(arg_ty, value.clone(), addr);
        }
        record
    }
}

/// `@"F$gowrapper"(ptr %args)`: unpack the arguments, run the unit and
/// report it finished. Under [`Scheduler::Tasks`] the task never returns
/// from `taskExit`.
pub(crate) fn build_gowrapper(
    name: &str,
    target: &Function,
    record: &ArgsRecord,
    scheduler: Scheduler,
) -> Function {
    let mut wrapper = Function::definition(
        name,
        Type::Void,
        vec![("args", Type::Ptr)],
        FnAttrs::INTERNAL | FnAttrs::WRAPPER,
    );
    let Some(body) = wrapper.body.as_mut() else {
        return wrapper;
    };
    let args_ptr = Operand::Local(body.params[0]);
    let entry = body.add_block("entry");
    let mut insts = Vec::new();
    let mut call_args = Vec::new();
    if let Some(ty) = &record.ty {
        for (index, param_ty) in target.params.iter().enumerate() {
            let addr = body.add_value(&format!("arg{index}.addr"), Type::Ptr);
            insts.push(Inst::new(
                Some(addr),
                InstKind::Gep {
                    ty: ty.clone(),
                    base: args_ptr.clone(),
                    index: Operand::Int(index as i64),
                },
            ));
            let value = body.add_value(&format!("arg{index}"), param_ty.clone());
            insts.push(Inst::new(
                Some(value),
                InstKind::Load {
                    ty: param_ty.clone(),
                    ptr: Operand::Local(addr),
                    align: None,
                },
            ));
            call_args.push((param_ty.clone(), Operand::Local(value)));
        }
    }
    insts.push(Inst::effect(InstKind::Call {
        ret: target.ret.clone(),
        callee: Operand::global(target.name.as_str()),
        args: call_args,
    }));
    insts.push(Inst::effect(InstKind::Call {
        ret: Type::Void,
        callee: Operand::global(RuntimeFn::TaskExit.name()),
        args: Vec::new(),
    }));
    let block = body.block_mut(entry);
    block.insts = insts;
    block.term = match scheduler {
        Scheduler::Tasks => Terminator::Unreachable,
        Scheduler::Coroutines => Terminator::Ret(None),
    };
    wrapper
}

/// Runtime call that registers the wait of a blocking operation. `buffer`
/// holds the value sent or receives the value read.
pub(crate) fn wait_call(op: &BlockingOp, buffer: Option<Operand>) -> (RuntimeFn, Vec<Arg>) {
    let buffer = buffer.unwrap_or(Operand::Null);
    match op {
        BlockingOp::ChanSend { chan, .. } => (
            RuntimeFn::ChanSendWait,
            vec![(Type::Ptr, chan.clone()), (Type::Ptr, buffer)],
        ),
        BlockingOp::ChanRecv { chan, .. } => (
            RuntimeFn::ChanRecvWait,
            vec![(Type::Ptr, chan.clone()), (Type::Ptr, buffer)],
        ),
        BlockingOp::Sleep { duration } => (RuntimeFn::SleepWait, vec![(Type::I64, duration.clone())]),
        BlockingOp::MutexLock { mutex } => (RuntimeFn::MutexLockWait, vec![(Type::Ptr, mutex.clone())]),
        BlockingOp::WaitGroupWait { group } => {
            (RuntimeFn::WaitGroupWait, vec![(Type::Ptr, group.clone())])
        }
    }
}

/// Type of the value a blocking operation moves through its buffer.
pub(crate) fn buffer_type(op: &BlockingOp) -> Option<&Type> {
    match op {
        BlockingOp::ChanSend { ty, .. } | BlockingOp::ChanRecv { ty, .. } => Some(ty),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
