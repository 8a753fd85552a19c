//! State-machine splitting.
//!
//! A unit that blocks is cut after every blocking operation. Suspension
//! point K (counting from 1) resumes in continuation `@"F$contK"`; state 0
//! starts the unit from its entry block in `@"F$cont0"`. All continuations
//! take the unit's state record, a tagged union whose `i32` tag selects the
//! variant `%"F$state.K"`:
//!
//! ```text
//! %F$state.0 = { i32, params... }
//! %F$state.K = { i32, buffer?, values live across K... }
//! ```
//!
//! Suspending stores the tag and the live values, registers the wait with
//! the runtime and returns. The runtime later calls `@"F$resume"`, which
//! switches on the tag.

use std::collections::BTreeMap;

use mote_ir::graph::{reachable_from, reaching};
use mote_ir::{
    compute_liveness, Arg, BlockId, BlockingOp, Body, CallConv, DataLayout,
    DebugLoc, FnAttrs, Function, Inst, InstKind, Module, Operand, Terminator, Type, ValueDef,
    ValueId,
};
use tracing::debug;

use super::{build_gowrapper, buffer_type, wait_call, Analysis, ArgsRecord};
use crate::config::{Scheduler, TargetConfig};
use crate::edit::{fresh_type, rewrite_insts, split_after, Step};
use crate::error::{LowerError, LowerResult};
use crate::runtime::RuntimeFn;

/// A split unit.
struct Machine {
    resume: String,
    /// `%"F$state.0"`.
    initial: Type,
    /// Bytes to allocate for the state record: the largest variant.
    size: u32,
    generated: Vec<Function>,
}

/// One blocking operation the unit may suspend at.
struct SuspendPoint {
    /// Block ending in the blocking operation.
    block: BlockId,
    /// Block execution continues in once the wait is over.
    resume: BlockId,
    op: BlockingOp,
    result: Option<ValueId>,
    loc: Option<DebugLoc>,
    variant: Type,
    /// Values live across the suspension, with their record field.
    saved: Vec<(ValueId, u32)>,
}

impl SuspendPoint {
    const BUFFER_FIELD: u32 = 1;
}

pub(super) fn lower(module: &mut Module, analysis: &Analysis, config: &TargetConfig) -> LowerResult<()> {
    check_units(analysis)?;

    let split: Vec<String> = analysis
        .units
        .iter()
        .filter(|unit| analysis.blocks(unit))
        .cloned()
        .collect();
    let mut machines: BTreeMap<String, Machine> = BTreeMap::new();
    for name in &split {
        let machine = build_machine(module, name, config)?;
        machines.insert(name.clone(), machine);
    }

    // Runtime declarations, in first-use order.
    let mut used: Vec<RuntimeFn> = Vec::new();
    let mut need = |f: RuntimeFn| {
        if !used.contains(&f) {
            used.push(f);
        }
    };
    for machine in machines.values() {
        for function in &machine.generated {
            for callee in function
                .body
                .iter()
                .flat_map(|b| b.blocks.iter())
                .flat_map(|b| b.insts.iter())
                .filter_map(|inst| inst.kind.direct_callee())
            {
                if let Some(f) = RuntimeFn::from_name(callee) {
                    need(f);
                }
            }
        }
    }

    // Split roots keep their symbol as a bootstrap; other split units are
    // only reachable through their continuations now.
    let mut generated = Vec::new();
    let mut removed = Vec::new();
    let mut bootstrapped = false;
    module.functions.retain_mut(|function| {
        let Some(machine) = machines.get(&function.name) else {
            return true;
        };
        if function.attrs.is_root() {
            function.body = Some(bootstrap(function, machine));
            bootstrapped = true;
            true
        } else {
            removed.push(function.name.clone());
            false
        }
    });
    if bootstrapped {
        need(RuntimeFn::Alloc);
        need(RuntimeFn::Schedule);
        need(RuntimeFn::Scheduler);
    }
    for machine in machines.values_mut() {
        generated.append(&mut machine.generated);
    }
    module.functions.extend(generated);

    // Launch sites, continuations included.
    let mut launches: BTreeMap<String, (ArgsRecord, String)> = BTreeMap::new();
    for target in analysis.spawn_targets() {
        if machines.contains_key(target) {
            continue;
        }
        let params = module
            .function(target)
            .map(|f| f.params.clone())
            .unwrap_or_default();
        let record = ArgsRecord::new(module, target, &params, config.pointer_size)?;
        let wrapper = module.unique_symbol(&format!("{target}$gowrapper"));
        launches.insert(target.to_owned(), (record, wrapper));
    }
    for index in 0..module.functions.len() {
        let spawns = module.functions[index].body.as_ref().is_some_and(|body| {
            body.blocks
                .iter()
                .flat_map(|b| b.insts.iter())
                .any(|inst| matches!(inst.kind, InstKind::Spawn { .. }))
        });
        if !spawns {
            continue;
        }
        let name = module.functions[index].name.clone();
        let Some(mut body) = module.functions[index].body.take() else {
            continue;
        };
        let result = rewrite_insts(&mut body, |emit, inst| {
            let InstKind::Spawn { target, args } = &inst.kind else {
                emit.push(inst);
                return Ok(Step::Continue);
            };
            need(RuntimeFn::Schedule);
            if let Some(machine) = machines.get(target) {
                need(RuntimeFn::Alloc);
                let hint = format!("{target}.state");
                for start in start_machine(emit.body, machine, &hint, args) {
                    emit.push(start);
                }
                return Ok(Step::Continue);
            }
            let Some((record, wrapper)) = launches.get(target) else {
                return Err(LowerError::internal(format!("spawn of @{target} was not analysed")));
            };
            if record.ty.is_some() {
                need(RuntimeFn::Alloc);
            }
            let packed = record.pack(emit, target, args);
            emit.call(
                RuntimeFn::Schedule.name(),
                vec![
                    (Type::Ptr, Operand::global(wrapper.as_str())),
                    (Type::Ptr, packed),
                ],
            );
            Ok(Step::Continue)
        });
        module.functions[index].body = Some(body);
        result.map_err(|e| e.in_function(&name))?;
    }
    for (target, (record, wrapper)) in &launches {
        let Some(function) = module.function(target) else {
            continue;
        };
        let generated = build_gowrapper(wrapper, function, record, Scheduler::Coroutines);
        module.functions.push(generated);
        need(RuntimeFn::TaskExit);
    }

    for f in used {
        f.declare(module);
    }
    debug!(
        split = machines.len(),
        removed = removed.len(),
        launch_targets = launches.len(),
        "lowered to coroutines"
    );
    Ok(())
}

/// Shapes a split unit cannot take part in.
fn check_units(analysis: &Analysis) -> LowerResult<()> {
    for fact in &analysis.facts {
        let in_unit = analysis.is_unit(&fact.name);
        for (callee, site) in &fact.calls {
            if analysis.is_unit(callee) && analysis.blocks(callee) {
                return Err(analysis.unsupported(
                    &fact.name,
                    site,
                    format!("direct call to @{callee}, which is split into continuations"),
                ));
            }
            if in_unit && analysis.may_block.contains(callee) {
                return Err(analysis.unsupported(
                    &fact.name,
                    site,
                    format!("@{} calls @{callee}, which may block", fact.name),
                ));
            }
        }
        if let Some(site) = &fact.blocking {
            if !in_unit {
                return Err(analysis.unsupported(
                    &fact.name,
                    site,
                    "blocking operation outside a concurrency unit".to_owned(),
                ));
            }
        }
    }
    Ok(())
}

// ── Splitting ───────────────────────────────────────────────────────

fn build_machine(module: &mut Module, name: &str, config: &TargetConfig) -> LowerResult<Machine> {
    let Some(function) = module.function(name) else {
        return Err(LowerError::internal(format!("split unit @{name} vanished")));
    };
    let Some(original) = &function.body else {
        return Err(LowerError::internal(format!("split unit @{name} has no body")));
    };
    let params = function.params.clone();
    let loc = function.loc.clone();
    let mut body = original.clone();
    check_indirect_branches(&body).map_err(|e| e.in_function(name))?;

    // Cut after each blocking operation, in textual order.
    let mut points = Vec::new();
    for block in body.block_ids().collect::<Vec<_>>() {
        let mut current = block;
        while let Some(pos) = body
            .block(current)
            .insts
            .iter()
            .position(|inst| inst.kind.is_blocking())
        {
            let hint = format!("{}.after", body.block(current).name);
            let resume = split_after(&mut body, current, pos, &hint);
            let inst = &body.block(current).insts[pos];
            let InstKind::Blocking(op) = &inst.kind else {
                return Err(LowerError::internal("split point is not blocking"));
            };
            points.push(SuspendPoint {
                block: current,
                resume,
                op: op.clone(),
                result: inst.result,
                loc: inst.loc.clone(),
                variant: Type::Void,
                saved: Vec::new(),
            });
            current = resume;
        }
    }

    let liveness = compute_liveness(&body);
    let initial = fresh_type(
        module,
        &format!("{name}$state.0"),
        Type::Struct(std::iter::once(Type::I32).chain(params.iter().cloned()).collect()),
    );
    for (k, point) in points.iter_mut().enumerate() {
        let mut live: Vec<ValueId> = liveness.live_in[point.resume.index()]
            .iter()
            .copied()
            .filter(|v| Some(*v) != point.result)
            .collect();
        live.sort_unstable();
        let mut fields = vec![Type::I32];
        if let Some(ty) = buffer_type(&point.op) {
            fields.push(ty.clone());
        }
        for v in &live {
            point.saved.push((*v, fields.len() as u32));
            fields.push(body.value_type(*v).clone());
        }
        point.variant = fresh_type(module, &format!("{name}$state.{}", k + 1), Type::Struct(fields));
    }
    let size = {
        let layout = DataLayout::new(module, config.pointer_size);
        let mut size = layout.size_of(&initial)?;
        for point in &points {
            size = size.max(layout.size_of(&point.variant)?);
        }
        size
    };

    let initial_fields: Vec<(ValueId, u32)> = body
        .params
        .iter()
        .enumerate()
        .map(|(i, v)| (*v, i as u32 + 1))
        .collect();
    let mut generated = Vec::with_capacity(points.len() + 2);
    let mut names = Vec::with_capacity(points.len() + 1);
    for k in 0..=points.len() {
        let cont = module.unique_symbol(&format!("{name}$cont{k}"));
        let (start, variant, restored) = match k {
            0 => (body.entry(), &initial, initial_fields.clone()),
            _ => {
                let point = &points[k - 1];
                let mut restored = point.saved.clone();
                if let (Some(result), Some(_)) = (point.result, buffer_type(&point.op)) {
                    restored.push((result, SuspendPoint::BUFFER_FIELD));
                }
                (point.resume, &point.variant, restored)
            }
        };
        let cont_body = continuation(&body, &points, start, variant, &restored);
        generated.push(Function {
            name: cont.clone(),
            ret: Type::Void,
            params: vec![Type::Ptr],
            attrs: FnAttrs::INTERNAL,
            cc: CallConv::C,
            loc: loc.clone(),
            body: Some(cont_body),
        });
        names.push(cont);
    }
    let resume = module.unique_symbol(&format!("{name}$resume"));
    generated.push(resume_function(&resume, &names));

    debug!(unit = name, states = names.len(), size, "split into continuations");
    Ok(Machine {
        resume,
        initial,
        size,
        generated,
    })
}

/// An `indirectbr` leading to or from a blocking operation cannot be cut:
/// its targets are only known at run time.
fn check_indirect_branches(body: &Body) -> LowerResult<()> {
    let blocking: Vec<BlockId> = body
        .block_ids()
        .filter(|b| body.block(*b).insts.iter().any(|i| i.kind.is_blocking()))
        .collect();
    let has_indirect = body
        .blocks
        .iter()
        .any(|b| matches!(b.term, Terminator::IndirectBr { .. }));
    if blocking.is_empty() || !has_indirect {
        return Ok(());
    }
    let to = reaching(body, &blocking);
    let from = reachable_from(body, &blocking);
    for block_id in body.block_ids() {
        let block = body.block(block_id);
        if !matches!(block.term, Terminator::IndirectBr { .. }) {
            continue;
        }
        if to[block_id.index()] || from[block_id.index()] {
            let op = blocking
                .iter()
                .flat_map(|b| body.block(*b).insts.iter())
                .find(|i| i.kind.is_blocking());
            let mut err = LowerError::unsupported(format!(
                "indirectbr in %{} is connected to a blocking operation",
                block.name
            ));
            if let Some(op) = op {
                err = err.at_inst(body, op);
            }
            return Err(err);
        }
    }
    Ok(())
}

/// The split body entered at `start` with `restored` loaded from `variant`.
fn continuation(
    split: &Body,
    points: &[SuspendPoint],
    start: BlockId,
    variant: &Type,
    restored: &[(ValueId, u32)],
) -> Body {
    let mut body = split.clone();
    let state = body.add_value("state", Type::Ptr);
    body.params = vec![state];
    let state_op = Operand::Local(state);

    for block in &mut body.blocks {
        if let Terminator::Ret(_) = block.term {
            block.insts.push(Inst::effect(InstKind::Call {
                ret: Type::Void,
                callee: Operand::global(RuntimeFn::TaskExit.name()),
                args: Vec::new(),
            }));
            block.term = Terminator::Ret(None);
        }
    }
    for (j, point) in points.iter().enumerate() {
        let insts = suspend(&mut body, point, j as i64 + 1, &state_op);
        let block = body.block_mut(point.block);
        block.insts.pop();
        block.insts.extend(insts);
        block.term = Terminator::Ret(None);
        block.term_loc = None;
    }

    let entry = body.add_block("resume");
    body.block_mut(entry).term = Terminator::Br(start);
    let order: Vec<BlockId> = std::iter::once(entry)
        .chain(body.block_ids().filter(|b| *b != entry))
        .collect();
    body.reorder_blocks(&order);
    body.remove_unreachable_blocks();

    let defs = body.definitions();
    let uses = body.use_counts();
    let mut loads = Vec::new();
    let mut merges = Vec::new();
    for &(value, field) in restored {
        if uses[value.index()] == 0 {
            continue;
        }
        let name = body.value_name(value).to_owned();
        let ty = body.value_type(value).clone();
        let slot = body.add_value(&format!("{name}.slot"), Type::Ptr);
        loads.push(Inst::new(
            Some(slot),
            InstKind::Gep {
                ty: variant.clone(),
                base: state_op.clone(),
                index: Operand::Int(i64::from(field)),
            },
        ));
        // Still defined in this continuation: restore into a new value and
        // join the two definitions.
        let target = match defs[value.index()] {
            Some(ValueDef::Inst(..)) => {
                let fresh = body.add_value(&name, ty.clone());
                merges.push((value, fresh));
                fresh
            }
            _ => value,
        };
        loads.push(Inst::new(
            Some(target),
            InstKind::Load {
                ty,
                ptr: Operand::Local(slot),
                align: None,
            },
        ));
    }
    let entry = body.entry();
    body.block_mut(entry).insts = loads;
    for (old, new) in merges {
        super::ssa::merge_definitions(&mut body, old, new);
    }
    body.compact_values();
    body
}

/// Save the state for suspension `tag` and register the wait.
fn suspend(body: &mut Body, point: &SuspendPoint, tag: i64, state: &Operand) -> Vec<Inst> {
    let mut insts = vec![Inst::effect(InstKind::Store {
        ty: Type::I32,
        value: Operand::Int(tag),
        ptr: state.clone(),
        align: None,
    })];
    let field_addr = |body: &mut Body, hint: &str, field: u32, insts: &mut Vec<Inst>| {
        let addr = body.add_value(hint, Type::Ptr);
        insts.push(Inst::new(
            Some(addr),
            InstKind::Gep {
                ty: point.variant.clone(),
                base: state.clone(),
                index: Operand::Int(i64::from(field)),
            },
        ));
        Operand::Local(addr)
    };
    for &(value, field) in &point.saved {
        let hint = format!("{}.save", body.value_name(value));
        let addr = field_addr(body, &hint, field, &mut insts);
        insts.push(Inst::effect(InstKind::Store {
            ty: body.value_type(value).clone(),
            value: Operand::Local(value),
            ptr: addr,
            align: None,
        }));
    }
    let buffer = buffer_type(&point.op).map(|ty| {
        let hint = format!("{}.buf", point.op.mnemonic());
        let addr = field_addr(body, &hint, SuspendPoint::BUFFER_FIELD, &mut insts);
        if let BlockingOp::ChanSend { value, .. } = &point.op {
            insts.push(Inst::effect(InstKind::Store {
                ty: ty.clone(),
                value: value.clone(),
                ptr: addr.clone(),
                align: None,
            }));
        }
        addr
    });
    let (wait, args) = wait_call(&point.op, buffer);
    insts.push(
        Inst::effect(InstKind::Call {
            ret: Type::Void,
            callee: Operand::global(wait.name()),
            args,
        })
        .with_loc(point.loc.clone()),
    );
    insts
}

/// `@"F$resume"(ptr %state)`: run the continuation the tag selects.
fn resume_function(name: &str, continuations: &[String]) -> Function {
    let mut function = Function::definition(
        name,
        Type::Void,
        vec![("state", Type::Ptr)],
        FnAttrs::INTERNAL,
    );
    let Some(body) = function.body.as_mut() else {
        return function;
    };
    let state = Operand::Local(body.params[0]);
    let entry = body.add_block("entry");
    let tag = body.add_value("tag", Type::I32);
    let mut cases = Vec::with_capacity(continuations.len());
    for (k, cont) in continuations.iter().enumerate() {
        let block = body.add_block(&format!("state.{k}"));
        let b = body.block_mut(block);
        b.insts.push(Inst::effect(InstKind::Call {
            ret: Type::Void,
            callee: Operand::global(cont.as_str()),
            args: vec![(Type::Ptr, state.clone())],
        }));
        b.term = Terminator::Ret(None);
        cases.push((k as i64, block));
    }
    let invalid = body.add_block("invalid");
    body.block_mut(invalid).term = Terminator::Unreachable;
    let b = body.block_mut(entry);
    b.insts.push(Inst::new(
        Some(tag),
        InstKind::Load {
            ty: Type::I32,
            ptr: state,
            align: None,
        },
    ));
    b.term = Terminator::Switch {
        ty: Type::I32,
        value: Operand::Local(tag),
        default: invalid,
        cases,
    };
    function
}

/// Allocate a state record in its initial state and queue the unit.
fn start_machine(body: &mut Body, machine: &Machine, hint: &str, args: &[Arg]) -> Vec<Inst> {
    let state = body.add_value(hint, Type::Ptr);
    let state_op = Operand::Local(state);
    let mut insts = vec![
        Inst::new(
            Some(state),
            InstKind::Call {
                ret: Type::Ptr,
                callee: Operand::global(RuntimeFn::Alloc.name()),
                args: vec![(Type::I32, Operand::Int(i64::from(machine.size)))],
            },
        ),
        Inst::effect(InstKind::Store {
            ty: Type::I32,
            value: Operand::Int(0),
            ptr: state_op.clone(),
            align: None,
        }),
    ];
    for (index, (ty, value)) in args.iter().enumerate() {
        let field = index as i64 + 1;
        let addr = body.add_value(&format!("{hint}.field{field}"), Type::Ptr);
        insts.push(Inst::new(
            Some(addr),
            InstKind::Gep {
                ty: machine.initial.clone(),
                base: state_op.clone(),
                index: Operand::Int(field),
            },
        ));
        insts.push(Inst::effect(InstKind::Store {
            ty: ty.clone(),
            value: value.clone(),
            ptr: Operand::Local(addr),
            align: None,
        }));
    }
    insts.push(Inst::effect(InstKind::Call {
        ret: Type::Void,
        callee: Operand::global(RuntimeFn::Schedule.name()),
        args: vec![
            (Type::Ptr, Operand::global(machine.resume.as_str())),
            (Type::Ptr, state_op),
        ],
    }));
    insts
}

/// Body of a split root: start the machine and run the scheduler.
fn bootstrap(function: &Function, machine: &Machine) -> Body {
    let mut body = Body::new();
    let mut args = Vec::with_capacity(function.params.len());
    for (i, ty) in function.params.iter().enumerate() {
        let hint = function
            .body
            .as_ref()
            .and_then(|b| b.params.get(i).map(|p| b.value_name(*p).to_owned()))
            .unwrap_or_else(|| i.to_string());
        let param = body.add_param(&hint, ty.clone());
        args.push((ty.clone(), Operand::Local(param)));
    }
    let entry = body.add_block("entry");
    let mut insts = start_machine(&mut body, machine, "state", &args);
    insts.push(Inst::effect(InstKind::Call {
        ret: Type::Void,
        callee: Operand::global(RuntimeFn::Scheduler.name()),
        args: Vec::new(),
    }));
    let block = body.block_mut(entry);
    block.insts = insts;
    block.term = Terminator::Ret((!function.ret.is_void()).then(|| (function.ret.clone(), Operand::Zero)));
    body
}
