//! Interface lowering.
//!
//! Replaces every interface construct with plain IR:
//!
//! - `makeiface` / `dyniface` build the `{ i32 typecode, ptr data }` pair
//! - `ifacecall` becomes a direct call, a call to a shared comparison chain
//!   (`@"M$invoke"`) or a load from a dispatch table (`@"M$table"`),
//!   depending on how many boxed types implement the method. Table slots
//!   without an implementation point at `@"M$nil"`, which panics like the
//!   end of a chain
//! - `typeassert` and `implements` become typecode comparisons
//!
//! The analysis sees the whole program: it runs per function in parallel and
//! merges into the [`MethodTable`], which stays in the [`PassContext`] so
//! dead-code elimination can keep dispatch targets alive. Helper functions
//! and tables are only emitted when some call site ends up using them.

mod table;

use std::collections::{BTreeMap, BTreeSet};

use mote_ir::{
    inst_to_string, BlockId, Body, Constant, FnAttrs, Function, Global, ICmpPred, Inst, InstKind,
    Linkage, Module, Operand, Terminator, Type, ValueId,
};
use rayon::prelude::*;
use tracing::debug;

use crate::context::PassContext;
use crate::edit::{rewrite_insts, Emit, Step};
use crate::error::{ErrorKind, LowerError, LowerResult};
use crate::pipeline::{forbid, no_requirements, PassDescriptor};
use crate::runtime::RuntimeFn;

pub use table::{DispatchKind, MethodEntry, MethodTable, MethodTableBuilder};
use table::{CallSite, FunctionFacts};

pub const NAME: &str = "interface";

pub fn descriptor() -> PassDescriptor {
    PassDescriptor {
        name: NAME,
        precondition: no_requirements,
        run: lower_interfaces,
        postcondition,
        failures: &[ErrorKind::MalformedInput, ErrorKind::UnsupportedConstruct],
    }
}

fn postcondition(module: &Module, ctx: &PassContext) -> Result<(), String> {
    forbid(module, "interface construct", InstKind::is_interface_construct)?;
    if !module.concretes.is_empty() || !module.interfaces.is_empty() {
        return Err("concrete or interface declarations remain".into());
    }
    if ctx.method_table().is_none() {
        return Err("no method table was recorded".into());
    }
    Ok(())
}

/// Lower every interface construct in `module`.
#[tracing::instrument(level = "debug", skip_all, fields(functions = module.functions.len()))]
pub fn lower_interfaces(module: &mut Module, ctx: &mut PassContext) -> LowerResult<()> {
    let mut builder = MethodTableBuilder::new(module)?;
    let facts: Vec<FunctionFacts> = module.functions.par_iter().map(collect_facts).collect();
    for f in facts {
        builder.record(f);
    }
    let table = builder.freeze(module, ctx.config.chain_limit)?;

    let names = HelperNames::assign(module, &table);
    let mut needs = Needs::default();
    for index in 0..module.functions.len() {
        let Some(mut body) = module.functions[index].body.take() else {
            continue;
        };
        let result = rewrite_insts(&mut body, |emit, inst| {
            lower_inst(emit, inst, &table, &names, &mut needs)
        });
        let function = &mut module.functions[index];
        function.body = Some(body);
        result.map_err(|e| e.in_function(&function.name))?;
    }

    // Every comparison chain and dispatch table can reach a nil panic.
    needs.nil_panic |= !needs.invoke.is_empty() || !needs.table.is_empty();
    emit_helpers(module, &table, &names, &needs);
    if needs.nil_panic {
        RuntimeFn::NilPanic.declare(module);
    }
    module.concretes.clear();
    module.interfaces.clear();

    for (method, _) in table.methods() {
        debug!(method, dispatch = ?table.dispatch(method), "method lowered");
    }
    ctx.set_method_table(table);
    Ok(())
}

// ── Analysis ────────────────────────────────────────────────────────

fn collect_facts(function: &Function) -> FunctionFacts {
    let mut facts = FunctionFacts::default();
    let Some(body) = &function.body else {
        return facts;
    };
    for inst in body.blocks.iter().flat_map(|b| b.insts.iter()) {
        match &inst.kind {
            InstKind::MakeIface { concrete, .. } => facts.boxed.push(concrete.clone()),
            InstKind::DynIface { interface, .. } => facts.dynamic.push(interface.clone()),
            InstKind::IfaceCall {
                ret, method, args, ..
            } => facts.calls.push(CallSite {
                function: function.name.clone(),
                method: method.clone(),
                ret: ret.clone(),
                args: args.iter().map(|(ty, _)| ty.clone()).collect(),
                instruction: inst_to_string(body, &Inst::new(inst.result, inst.kind.clone())),
                loc: inst.loc.clone(),
            }),
            _ => {}
        }
    }
    facts
}

// ── Rewriting ───────────────────────────────────────────────────────

/// Symbol names of the helpers each method or interface would use.
struct HelperNames {
    invoke: BTreeMap<String, String>,
    /// Dispatch table and the nil-panic stub filling its empty slots.
    table: BTreeMap<String, (String, String)>,
    implements: BTreeMap<String, String>,
}

impl HelperNames {
    fn assign(module: &Module, table: &MethodTable) -> Self {
        let mut names = HelperNames {
            invoke: BTreeMap::new(),
            table: BTreeMap::new(),
            implements: BTreeMap::new(),
        };
        for (method, _) in table.methods() {
            match table.dispatch(method) {
                Some(DispatchKind::Chain) => {
                    let name = module.unique_symbol(&format!("{method}$invoke"));
                    names.invoke.insert(method.to_owned(), name);
                }
                Some(DispatchKind::Table) => {
                    let name = module.unique_symbol(&format!("{method}$table"));
                    let stub = module.unique_symbol(&format!("{method}$nil"));
                    names.table.insert(method.to_owned(), (name, stub));
                }
                Some(DispatchKind::Direct) | None => {}
            }
        }
        for interface in &module.interfaces {
            if table.implementers(&interface.name).len() > 1 {
                let name = module.unique_symbol(&format!("{}$implements", interface.name));
                names.implements.insert(interface.name.clone(), name);
            }
        }
        names
    }
}

/// Helpers referenced by rewritten code.
#[derive(Default)]
struct Needs {
    nil_panic: bool,
    invoke: BTreeSet<String>,
    table: BTreeSet<String>,
    implements: BTreeSet<String>,
}

fn missing_helper(what: &str, name: &str) -> LowerError {
    LowerError::internal(format!("no {what} was planned for `{name}`"))
}

fn typecode_of(emit: &mut Emit<'_>, value: &Operand) -> Operand {
    let hint = emit.operand_hint(value, "typecode");
    emit.extract(&hint, &Type::Iface, Type::I32, value.clone(), 0)
}

fn data_of(emit: &mut Emit<'_>, value: &Operand) -> Operand {
    let hint = emit.operand_hint(value, "data");
    emit.extract(&hint, &Type::Iface, Type::Ptr, value.clone(), 1)
}

fn lower_inst(
    emit: &mut Emit<'_>,
    inst: Inst,
    table: &MethodTable,
    names: &HelperNames,
    needs: &mut Needs,
) -> LowerResult<Step> {
    let result = inst.result;
    match inst.kind {
        InstKind::MakeIface { concrete, value } => {
            let id = table.type_id(&concrete).ok_or_else(|| {
                LowerError::malformed(format!("undeclared concrete type %{concrete}"))
            })?;
            if result.is_some() {
                emit.pair(
                    result,
                    &Type::Iface,
                    (Type::I32, Operand::Int(i64::from(id))),
                    (Type::Ptr, value),
                );
            }
        }
        InstKind::DynIface {
            typecode, value, ..
        } => {
            if result.is_some() {
                emit.pair(result, &Type::Iface, (Type::I32, typecode), (Type::Ptr, value));
            }
        }
        InstKind::IfaceCall {
            ret,
            method,
            receiver,
            args,
        } => {
            return lower_call(emit, result, ret, &method, &receiver, args, table, names, needs);
        }
        InstKind::TypeAssert { value, concrete } => {
            let id = table.type_id(&concrete).ok_or_else(|| {
                LowerError::malformed(format!("undeclared concrete type %{concrete}"))
            })?;
            if !table.may_hold(&concrete) {
                emit.substitute(result, Operand::Int(0));
            } else if result.is_some() {
                let tc = typecode_of(emit, &value);
                emit.icmp_eq(result, "", tc, Operand::Int(i64::from(id)));
            }
        }
        InstKind::Implements { value, interface } => match table.implementers(&interface) {
            [] => emit.substitute(result, Operand::Int(0)),
            _ if result.is_none() => {}
            [id] => {
                let tc = typecode_of(emit, &value);
                emit.icmp_eq(result, "", tc, Operand::Int(i64::from(*id)));
            }
            _ => {
                let helper = names
                    .implements
                    .get(&interface)
                    .ok_or_else(|| missing_helper("implements function", &interface))?;
                needs.implements.insert(interface.clone());
                let tc = typecode_of(emit, &value);
                emit.define(
                    result,
                    InstKind::Call {
                        ret: Type::I1,
                        callee: Operand::global(helper.as_str()),
                        args: vec![(Type::I32, tc)],
                    },
                );
            }
        },
        kind => emit.define(result, kind),
    }
    Ok(Step::Continue)
}

#[allow(clippy::too_many_arguments)]
fn lower_call(
    emit: &mut Emit<'_>,
    result: Option<ValueId>,
    ret: Type,
    method: &str,
    receiver: &Operand,
    args: Vec<(Type, Operand)>,
    table: &MethodTable,
    names: &HelperNames,
    needs: &mut Needs,
) -> LowerResult<Step> {
    let dispatch = match table.dispatch(method) {
        Some(dispatch) if !receiver.is_null() => dispatch,
        // Only a nil interface value can reach this call.
        _ => {
            needs.nil_panic = true;
            emit.call(RuntimeFn::NilPanic.name(), Vec::new());
            return Ok(Step::Unreachable);
        }
    };

    let (callee, mut call_args) = match dispatch {
        DispatchKind::Direct => {
            let imp = table
                .method(method)
                .and_then(|entry| entry.impls.first())
                .map(|(_, imp)| imp.clone())
                .ok_or_else(|| missing_helper("implementation", method))?;
            let data = data_of(emit, receiver);
            (Operand::global(imp), vec![(Type::Ptr, data)])
        }
        DispatchKind::Chain => {
            let invoke = names
                .invoke
                .get(method)
                .ok_or_else(|| missing_helper("invoke function", method))?;
            needs.invoke.insert(method.to_owned());
            let tc = typecode_of(emit, receiver);
            let data = data_of(emit, receiver);
            (
                Operand::global(invoke.as_str()),
                vec![(Type::I32, tc), (Type::Ptr, data)],
            )
        }
        DispatchKind::Table => {
            let (global, _) = names
                .table
                .get(method)
                .ok_or_else(|| missing_helper("dispatch table", method))?;
            needs.table.insert(method.to_owned());
            let tc = typecode_of(emit, receiver);
            let data = data_of(emit, receiver);
            let slot_hint = emit.operand_hint(receiver, "slot");
            let slot = emit.value(
                &slot_hint,
                Type::Ptr,
                InstKind::Gep {
                    ty: Type::Ptr,
                    base: Operand::global(global.as_str()),
                    index: tc,
                },
            );
            let fn_hint = emit.operand_hint(receiver, "fn");
            let code = emit.load(&fn_hint, &Type::Ptr, slot);
            (code, vec![(Type::Ptr, data)])
        }
    };
    call_args.extend(args);
    emit.define(
        result,
        InstKind::Call {
            ret,
            callee,
            args: call_args,
        },
    );
    Ok(Step::Continue)
}

// ── Helpers ─────────────────────────────────────────────────────────

fn emit_helpers(module: &mut Module, table: &MethodTable, names: &HelperNames, needs: &Needs) {
    for method in &needs.invoke {
        if let (Some(name), Some(entry)) = (names.invoke.get(method), table.method(method)) {
            module.functions.push(build_invoke(name, entry, table));
        }
    }
    for method in &needs.table {
        if let (Some((name, stub)), Some(entry)) = (names.table.get(method), table.method(method))
        {
            module.functions.push(build_nil_stub(stub, entry));
            module.globals.push(build_dispatch_table(name, stub, entry, table));
        }
    }
    for interface in &needs.implements {
        if let Some(name) = names.implements.get(interface) {
            module
                .functions
                .push(build_implements(name, table.implementers(interface)));
        }
    }
}

/// `ret @"M$invoke"(i32 %typecode, ptr %receiver, args...)`: compare the
/// typecode against each implementing type in id order.
fn build_invoke(name: &str, entry: &MethodEntry, table: &MethodTable) -> Function {
    let arg_names: Vec<String> = (0..entry.params.len()).map(|i| format!("arg{i}")).collect();
    let mut params = vec![("typecode", Type::I32), ("receiver", Type::Ptr)];
    params.extend(arg_names.iter().map(String::as_str).zip(entry.params.iter().cloned()));
    let mut function = Function::definition(name, entry.ret.clone(), params, FnAttrs::INTERNAL);
    if let Some(body) = function.body.as_mut() {
        fill_invoke(body, entry, table);
    }
    function
}

fn fill_invoke(body: &mut Body, entry: &MethodEntry, table: &MethodTable) {
    let typecode = Operand::Local(body.params[0]);
    let receiver = Operand::Local(body.params[1]);
    let forwarded: Vec<(Type, Operand)> = body.params[2..]
        .iter()
        .zip(&entry.params)
        .map(|(v, ty)| (ty.clone(), Operand::Local(*v)))
        .collect();

    let mut current = body.add_block("entry");
    for (id, imp) in &entry.impls {
        let label = table.type_name(*id).unwrap_or("impl");
        let hit = body.add_block(label);
        let next = body.add_block("next");

        let is = body.add_value(&format!("is.{label}"), Type::I1);
        let block = body.block_mut(current);
        block.insts.push(Inst::new(
            Some(is),
            InstKind::ICmp {
                pred: ICmpPred::Eq,
                ty: Type::I32,
                lhs: typecode.clone(),
                rhs: Operand::Int(i64::from(*id)),
            },
        ));
        block.term = Terminator::CondBr {
            cond: Operand::Local(is),
            then_block: hit,
            else_block: next,
        };

        let mut args = vec![(Type::Ptr, receiver.clone())];
        args.extend(forwarded.iter().cloned());
        let call = InstKind::Call {
            ret: entry.ret.clone(),
            callee: Operand::global(imp.as_str()),
            args,
        };
        let (inst, term) = if entry.ret.is_void() {
            (Inst::effect(call), Terminator::Ret(None))
        } else {
            let value = body.add_value(&format!("{label}.result"), entry.ret.clone());
            (
                Inst::new(Some(value), call),
                Terminator::Ret(Some((entry.ret.clone(), Operand::Local(value)))),
            )
        };
        let block = body.block_mut(hit);
        block.insts.push(inst);
        block.term = term;
        current = next;
    }

    panic_on_nil(body, current);
}

/// Call `runtime.nilPanic` at the end of `block`.
fn panic_on_nil(body: &mut Body, block: BlockId) {
    let block = body.block_mut(block);
    block.insts.push(Inst::effect(InstKind::Call {
        ret: Type::Void,
        callee: Operand::global(RuntimeFn::NilPanic.name()),
        args: Vec::new(),
    }));
    block.term = Terminator::Unreachable;
}

/// `@"M$nil"(ptr %receiver, args...)`: the method's signature, but it only
/// panics. Dispatch tables use it for the nil interface and for types
/// without the method.
fn build_nil_stub(name: &str, entry: &MethodEntry) -> Function {
    let arg_names: Vec<String> = (0..entry.params.len()).map(|i| format!("arg{i}")).collect();
    let mut params = vec![("receiver", Type::Ptr)];
    params.extend(arg_names.iter().map(String::as_str).zip(entry.params.iter().cloned()));
    let mut function = Function::definition(name, entry.ret.clone(), params, FnAttrs::INTERNAL);
    if let Some(body) = function.body.as_mut() {
        let block = body.add_block("entry");
        panic_on_nil(body, block);
    }
    function
}

/// `[N+1 x ptr]` indexed by type id; slots without an implementation hold
/// `stub`.
fn build_dispatch_table(
    name: &str,
    stub: &str,
    entry: &MethodEntry,
    table: &MethodTable,
) -> Global {
    let len = table.type_count() + 1;
    let elems = (0..len)
        .map(|id| {
            let target = entry
                .impls
                .iter()
                .find(|(i, _)| *i == id)
                .map_or(stub, |(_, imp)| imp.as_str());
            (Type::Ptr, Constant::Symbol(target.to_owned()))
        })
        .collect();
    Global {
        name: name.to_owned(),
        ty: Type::Array(u64::from(len), Box::new(Type::Ptr)),
        linkage: Linkage::Internal,
        constant: true,
        init: Some(Constant::Aggregate(elems)),
        align: None,
    }
}

/// `i1 @"I$implements"(i32 %typecode)`: a switch over the implementing ids.
fn build_implements(name: &str, ids: &[u32]) -> Function {
    let mut function = Function::definition(
        name,
        Type::I1,
        vec![("typecode", Type::I32)],
        FnAttrs::INTERNAL,
    );
    if let Some(body) = function.body.as_mut() {
        let typecode = Operand::Local(body.params[0]);
        let entry = body.add_block("entry");
        let yes = body.add_block("yes");
        let no = body.add_block("no");
        body.block_mut(entry).term = Terminator::Switch {
            ty: Type::I32,
            value: typecode,
            default: no,
            cases: ids.iter().map(|id| (i64::from(*id), yes)).collect(),
        };
        body.block_mut(yes).term = Terminator::Ret(Some((Type::I1, Operand::Int(1))));
        body.block_mut(no).term = Terminator::Ret(Some((Type::I1, Operand::Int(0))));
    }
    function
}
