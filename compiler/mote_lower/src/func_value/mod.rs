//! Function-value lowering.
//!
//! A function value is a `{ ptr context, ptr code }` pair. Every closure body
//! uses the same calling convention (`closurecc`: the context is the
//! trailing `ptr` parameter), so after this pass a function value is always
//! invoked as `call code(args..., context)` with no per-closure special
//! casing.
//!
//! Each target's capture set gets one context layout (see [`ContextLayout`]).
//! Plain functions used as values are reached through a generated
//! `@"f$closure"` wrapper that drops the context. Calls through a value
//! built in the same function become direct calls, after which wrappers and
//! closure bodies nobody references any more are removed.

mod layout;

use std::collections::BTreeMap;

use mote_ir::{
    inst_to_string, Arg, CallConv, DebugLoc, FnAttrs, Function, Inst, InstKind,
    Module, Operand, Placement, Type, ValueId,
};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::context::PassContext;
use crate::edit::{rewrite_insts, Emit, Step};
use crate::error::{ErrorKind, LowerError, LowerResult};
use crate::pipeline::{forbid, no_requirements, PassDescriptor};
use crate::runtime::RuntimeFn;

pub use layout::ContextLayout;
use layout::LayoutInterner;

pub const NAME: &str = "func-values";

pub fn descriptor() -> PassDescriptor {
    PassDescriptor {
        name: NAME,
        precondition: no_requirements,
        run: lower_func_values,
        postcondition,
        failures: &[ErrorKind::MalformedInput],
    }
}

fn postcondition(module: &Module, _: &PassContext) -> Result<(), String> {
    forbid(module, "function-value construct", InstKind::is_func_value_construct)
}

/// One `makefunc` as seen by the analysis.
#[derive(Clone, Debug)]
struct MakeFuncSite {
    function: String,
    target: String,
    types: Vec<Type>,
    instruction: String,
    loc: Option<DebugLoc>,
}

impl MakeFuncSite {
    fn malformed(&self, message: String) -> LowerError {
        LowerError::malformed(message)
            .in_function(&self.function)
            .with_instruction(self.instruction.clone())
            .with_loc(self.loc.clone())
    }
}

/// Whole-program decisions shared by every function rewrite.
struct Plan {
    /// Capture types and context layout of every `makefunc` target.
    targets: BTreeMap<String, (Vec<Type>, ContextLayout)>,
    /// `closurecc` wrapper of each plain function used as a value.
    wrappers: BTreeMap<String, String>,
    closures: FxHashSet<String>,
}

impl Plan {
    fn target(&self, name: &str) -> Option<&(Vec<Type>, ContextLayout)> {
        self.targets.get(name)
    }

    fn is_closure(&self, name: &str) -> bool {
        self.closures.contains(name)
    }

    /// The code pointer stored in a function value for `target`.
    fn code_for(&self, target: &str) -> String {
        self.wrappers
            .get(target)
            .cloned()
            .unwrap_or_else(|| target.to_owned())
    }
}

/// Lower every function-value construct in `module`.
#[tracing::instrument(level = "debug", skip_all, fields(functions = module.functions.len()))]
pub fn lower_func_values(module: &mut Module, ctx: &mut PassContext) -> LowerResult<()> {
    check_closure_signatures(module)?;

    let sites: Vec<Vec<MakeFuncSite>> = module.functions.par_iter().map(collect_sites).collect();
    let plan = build_plan(module, sites.into_iter().flatten(), ctx.config.pointer_size)?;

    let mut uses_alloc = false;
    for index in 0..module.functions.len() {
        let function = &module.functions[index];
        let Some(body) = &function.body else { continue };
        let touches = body
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .any(|inst| inst.kind.is_func_value_construct());
        if !touches {
            continue;
        }
        let closure = (function.cc == CallConv::Closure).then(|| function.name.clone());
        let name = function.name.clone();

        let Some(mut body) = module.functions[index].body.take() else {
            continue;
        };
        let result = lower_body(&mut body, &plan, closure.as_deref(), &mut uses_alloc);
        module.functions[index].body = Some(body);
        result.map_err(|e| e.in_function(&name))?;
    }

    for (target, wrapper) in &plan.wrappers {
        if let Some(function) = module.function(target) {
            let generated = build_wrapper(wrapper, function);
            module.functions.push(generated);
        }
    }
    if uses_alloc {
        RuntimeFn::Alloc.declare(module);
    }

    let removed = remove_unreferenced_closures(module);
    debug!(
        targets = plan.targets.len(),
        wrappers = plan.wrappers.len(),
        removed = removed.len(),
        "function values lowered"
    );
    Ok(())
}

// ── Analysis ────────────────────────────────────────────────────────

/// Every `closurecc` function takes its context as a trailing `ptr`.
fn check_closure_signatures(module: &Module) -> LowerResult<()> {
    for function in &module.functions {
        if function.cc == CallConv::Closure && function.params.last() != Some(&Type::Ptr) {
            return Err(LowerError::malformed(format!(
                "closurecc function @{} has no trailing ptr context parameter",
                function.name
            ))
            .in_function(&function.name)
            .with_loc(function.loc.clone()));
        }
    }
    Ok(())
}

fn collect_sites(function: &Function) -> Vec<MakeFuncSite> {
    let Some(body) = &function.body else {
        return Vec::new();
    };
    body.blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .filter_map(|inst| match &inst.kind {
            InstKind::MakeFunc {
                target, captures, ..
            } => Some(MakeFuncSite {
                function: function.name.clone(),
                target: target.clone(),
                types: captures.iter().map(|(ty, _)| ty.clone()).collect(),
                instruction: inst_to_string(body, inst),
                loc: inst.loc.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn build_plan(
    module: &mut Module,
    sites: impl Iterator<Item = MakeFuncSite>,
    pointer_size: u32,
) -> LowerResult<Plan> {
    let mut capture_sets: BTreeMap<String, Vec<Type>> = BTreeMap::new();
    let mut wrappers = BTreeMap::new();
    let closures: FxHashSet<String> = module
        .functions
        .iter()
        .filter(|f| f.cc == CallConv::Closure)
        .map(|f| f.name.clone())
        .collect();

    for site in sites {
        let Some(target) = module.function(&site.target) else {
            return Err(site.malformed(format!("makefunc of undefined function @{}", site.target)));
        };
        if target.cc != CallConv::Closure {
            if !site.types.is_empty() {
                return Err(site.malformed(format!(
                    "captures passed to @{}, which is not a closurecc function",
                    site.target
                )));
            }
            if !wrappers.contains_key(&site.target) {
                let name = module.unique_symbol(&format!("{}$closure", site.target));
                wrappers.insert(site.target.clone(), name);
            }
        }
        match capture_sets.get(&site.target) {
            Some(types) if *types != site.types => {
                return Err(site.malformed(format!(
                    "inconsistent capture sets for @{}",
                    site.target
                )));
            }
            Some(_) => {}
            None => {
                capture_sets.insert(site.target.clone(), site.types);
            }
        }
    }

    let mut interner = LayoutInterner::default();
    let mut targets = BTreeMap::new();
    for (target, types) in capture_sets {
        let layout = interner
            .layout(module, pointer_size, &types)
            .map_err(|err| err.in_function(&target))?;
        debug!(target = %target, ?layout, "context layout");
        targets.insert(target, (types, layout));
    }
    Ok(Plan {
        targets,
        wrappers,
        closures,
    })
}

// ── Rewriting ───────────────────────────────────────────────────────

/// A function value whose target is known where it is called.
struct Known {
    target: String,
    context: Operand,
}

fn lower_body(
    body: &mut mote_ir::Body,
    plan: &Plan,
    closure: Option<&str>,
    uses_alloc: &mut bool,
) -> LowerResult<()> {
    // Context values of record layouts are allocated up front so calls
    // appearing earlier in block order can already name them.
    let mut known: FxHashMap<ValueId, Known> = FxHashMap::default();
    let mut planned: Vec<(ValueId, String, Option<Operand>)> = Vec::new();
    for inst in body.blocks.iter().flat_map(|b| b.insts.iter()) {
        if let (
            Some(result),
            InstKind::MakeFunc {
                target, captures, ..
            },
        ) = (inst.result, &inst.kind)
        {
            planned.push((result, target.clone(), captures.first().map(|(_, op)| op.clone())));
        }
    }
    for (result, target, first_capture) in planned {
        let context = match plan.target(&target) {
            Some((_, ContextLayout::Direct)) => first_capture.unwrap_or(Operand::Null),
            Some((_, ContextLayout::Record { .. })) => {
                let hint = format!("{}.context", body.value_name(result));
                Operand::Local(body.add_value(&hint, Type::Ptr))
            }
            Some((_, ContextLayout::Empty)) | None => Operand::Null,
        };
        known.insert(result, Known { target, context });
    }

    let closure_cx = match closure {
        Some(name) => Some((
            plan.target(name),
            body.params.last().copied(),
            name.to_owned(),
        )),
        None => None,
    };

    rewrite_insts(body, |emit, inst| {
        let result = inst.result;
        match &inst.kind {
            InstKind::MakeFunc {
                placement,
                target,
                captures,
            } => {
                let Some(result) = result else {
                    return Ok(Step::Continue);
                };
                let Some(k) = known.get(&result) else {
                    return Err(LowerError::internal("makefunc was not planned"));
                };
                let context = k.context.clone();
                if let Some((_, ContextLayout::Record { ty, fields, size })) = plan.target(target) {
                    fill_record(emit, *placement, &context, ty, fields, *size, captures);
                    if *placement == Placement::Heap {
                        *uses_alloc = true;
                    }
                }
                let code = Operand::global(plan.code_for(target));
                emit.pair(
                    Some(result),
                    &Type::Func,
                    (Type::Ptr, context),
                    (Type::Ptr, code),
                );
            }
            InstKind::CallFunc { ret, func, args } => {
                let direct = func.as_local().and_then(|v| known.get(&v));
                let kind = match direct {
                    Some(k) => {
                        let mut call_args = args.clone();
                        if plan.is_closure(&k.target) {
                            call_args.push((Type::Ptr, k.context.clone()));
                        }
                        InstKind::Call {
                            ret: ret.clone(),
                            callee: Operand::global(k.target.as_str()),
                            args: call_args,
                        }
                    }
                    None => indirect_call(emit, ret, func, args),
                };
                emit.define(result, kind);
            }
            InstKind::Capture { ty, index } => {
                let Some((set, context, name)) = &closure_cx else {
                    return Err(LowerError::malformed(
                        "capture outside a closurecc function",
                    )
                    .at_inst(emit.body, &inst));
                };
                let Some((types, layout)) = set else {
                    return Err(LowerError::malformed(format!(
                        "capture in @{name}, which no makefunc creates"
                    ))
                    .at_inst(emit.body, &inst));
                };
                let field_ty = types.get(*index as usize);
                if field_ty != Some(ty) {
                    let message = match field_ty {
                        None => format!(
                            "capture index {index} out of range for @{name} ({} captures)",
                            types.len()
                        ),
                        Some(expected) => {
                            format!("capture {index} of @{name} has type {expected}, not {ty}")
                        }
                    };
                    return Err(LowerError::malformed(message).at_inst(emit.body, &inst));
                }
                let Some(context) = *context else {
                    return Err(LowerError::internal("closure without parameters"));
                };
                match layout {
                    ContextLayout::Direct => emit.substitute(result, Operand::Local(context)),
                    ContextLayout::Record { ty: record, fields, .. } => {
                        let field = fields[*index as usize];
                        let hint = emit.hint(result, "addr", "capture.addr");
                        let addr =
                            emit.gep(&hint, record, Operand::Local(context), i64::from(field));
                        emit.define(
                            result,
                            InstKind::Load {
                                ty: ty.clone(),
                                ptr: addr,
                                align: None,
                            },
                        );
                    }
                    ContextLayout::Empty => {
                        return Err(LowerError::internal("empty layout with captures"));
                    }
                }
            }
            _ => emit.push(inst),
        }
        Ok(Step::Continue)
    })?;

    sweep_dead_aggregates(body);
    Ok(())
}

/// Allocate a context record and store the captures into it.
fn fill_record(
    emit: &mut Emit<'_>,
    placement: Placement,
    context: &Operand,
    record: &Type,
    fields: &[u32],
    size: u32,
    captures: &[Arg],
) {
    let Some(context_value) = context.as_local() else {
        return;
    };
    match placement {
        Placement::Heap => emit.define(
            Some(context_value),
            InstKind::Call {
                ret: Type::Ptr,
                callee: Operand::global(RuntimeFn::Alloc.name()),
                args: vec![(Type::I32, Operand::Int(i64::from(size)))],
            },
        ),
        Placement::Stack => emit.hoist(Inst::new(
            Some(context_value),
            InstKind::Alloca {
                ty: record.clone(),
                align: None,
            },
        )),
    }
    for ((ty, value), field) in captures.iter().zip(fields) {
        let hint = emit.operand_hint(context, &format!("field{field}"));
        let addr = emit.gep(&hint, record, context.clone(), i64::from(*field));
        emit.store(ty, value.clone(), addr);
    }
}

/// `call code(args..., context)` through an unknown function value.
fn indirect_call(emit: &mut Emit<'_>, ret: &Type, func: &Operand, args: &[Arg]) -> InstKind {
    let context_hint = emit.operand_hint(func, "context");
    let context = emit.extract(&context_hint, &Type::Func, Type::Ptr, func.clone(), 0);
    let code_hint = emit.operand_hint(func, "code");
    let code = emit.extract(&code_hint, &Type::Func, Type::Ptr, func.clone(), 1);
    let mut call_args = args.to_vec();
    call_args.push((Type::Ptr, context));
    InstKind::Call {
        ret: ret.clone(),
        callee: code,
        args: call_args,
    }
}

/// Drop aggregate construction and extraction nobody reads.
fn sweep_dead_aggregates(body: &mut mote_ir::Body) {
    loop {
        let uses = body.use_counts();
        let mut removed = false;
        for block in &mut body.blocks {
            block.insts.retain(|inst| {
                let dead = matches!(
                    inst.kind,
                    InstKind::InsertValue { .. } | InstKind::ExtractValue { .. }
                ) && inst.result.is_some_and(|r| uses[r.index()] == 0);
                removed |= dead;
                !dead
            });
        }
        if !removed {
            break;
        }
    }
    body.compact_values();
}

// ── Wrappers and cleanup ────────────────────────────────────────────

/// `closurecc` trampoline for a plain function: forwards the arguments and
/// ignores the context.
fn build_wrapper(name: &str, target: &Function) -> Function {
    let arg_names: Vec<String> = (0..target.params.len()).map(|i| format!("arg{i}")).collect();
    let mut params: Vec<(&str, Type)> = arg_names
        .iter()
        .map(String::as_str)
        .zip(target.params.iter().cloned())
        .collect();
    params.push(("context", Type::Ptr));

    let mut wrapper = Function::definition(
        name,
        target.ret.clone(),
        params,
        FnAttrs::INTERNAL | FnAttrs::WRAPPER,
    );
    wrapper.cc = CallConv::Closure;
    if let Some(body) = wrapper.body.as_mut() {
        let forwarded: Vec<Arg> = body.params[..target.params.len()]
            .iter()
            .zip(&target.params)
            .map(|(v, ty)| (ty.clone(), Operand::Local(*v)))
            .collect();
        let entry = body.add_block("entry");
        let call = InstKind::Call {
            ret: target.ret.clone(),
            callee: Operand::global(target.name.as_str()),
            args: forwarded,
        };
        let (inst, ret) = if target.ret.is_void() {
            (Inst::effect(call), None)
        } else {
            let value = body.add_value("result", target.ret.clone());
            (
                Inst::new(Some(value), call),
                Some((target.ret.clone(), Operand::Local(value))),
            )
        };
        let block = body.block_mut(entry);
        block.insts.push(inst);
        block.term = mote_ir::Terminator::Ret(ret);
    }
    wrapper
}

fn is_removable(function: &Function) -> bool {
    !function.attrs.is_root()
        && (function.has(FnAttrs::WRAPPER) || function.cc == CallConv::Closure)
}

/// Remove wrappers and closure bodies no other function or global refers
/// to, until nothing changes. Returns the removed names.
fn remove_unreferenced_closures(module: &mut Module) -> Vec<String> {
    let mut removed = Vec::new();
    loop {
        let mut referenced: FxHashSet<String> = FxHashSet::default();
        for function in &module.functions {
            let Some(body) = &function.body else { continue };
            for block in &body.blocks {
                let symbols = block
                    .insts
                    .iter()
                    .flat_map(|inst| inst.kind.symbol_refs())
                    .chain(block.term.symbol_refs());
                for symbol in symbols {
                    if symbol != function.name {
                        referenced.insert(symbol.to_owned());
                    }
                }
            }
        }
        for global in &module.globals {
            if let Some(init) = &global.init {
                let mut refs = Vec::new();
                init.symbol_refs(&mut refs);
                referenced.extend(refs.into_iter().map(str::to_owned));
            }
        }

        let before = removed.len();
        module.functions.retain(|f| {
            let dead = is_removable(f) && !referenced.contains(&f.name);
            if dead {
                removed.push(f.name.clone());
            }
            !dead
        });
        if removed.len() == before {
            return removed;
        }
    }
}
