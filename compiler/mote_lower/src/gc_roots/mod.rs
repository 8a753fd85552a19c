//! GC root instrumentation.
//!
//! A safe point is a call whose callee is not `nogc`: the collector may run
//! there. For every safe point the pass finds the locations that may hold a
//! live pointer:
//!
//! - SSA values of pointer-bearing type live after the call (its own result
//!   excluded). Each is spilled into a frame slot once, right after its
//!   definition.
//! - `alloca`s holding pointers whose address is live after the call or has
//!   escaped. These are relocated into a frame slot outright.
//!
//! Each instrumented function gets one frame record
//!
//! ```text
//! %"F$gcframe" = { ptr parent, i32 frame id, i32 safe point, slots... }
//! ```
//!
//! pushed onto `@runtime.gcStackChain` on entry and popped before every
//! `ret`. The active safe-point id is stored before each safe point, so the
//! collector knows which slots to scan. A slot whose static layout contains
//! `opaque` storage is scanned conservatively as a whole.
//!
//! Functions are analysed in parallel. Frame ids and safe-point ids are then
//! assigned by one merge loop over a [`RootRegistry`] in function order,
//! frozen into the module's [`RootTable`](mote_ir::RootTable).

mod registry;

use mote_ir::{
    compute_liveness, Body, DataLayout, FnAttrs, FrameSlot, Function, Inst, InstKind, Module,
    Operand, PointerMap, SlotLayout, Terminator, Type, ValueDef, ValueId,
};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::context::PassContext;
use crate::edit::{fresh_type, prepend_to_entry};
use crate::error::{ErrorKind, LowerError, LowerResult};
use crate::pipeline::{find_inst, PassDescriptor};
use crate::runtime::{declare_gc_stack_chain, GC_STACK_CHAIN};

pub use registry::RootRegistry;

pub const NAME: &str = "gc-roots";

/// `parent`, frame id and safe point come before the slots.
const HEADER_FIELDS: u32 = 3;

pub fn descriptor() -> PassDescriptor {
    PassDescriptor {
        name: NAME,
        precondition,
        run: instrument_gc_roots,
        postcondition,
        failures: &[ErrorKind::MalformedInput],
    }
}

fn precondition(module: &Module, _: &PassContext) -> Result<(), String> {
    if module.roots.is_some() {
        return Err("module is already instrumented".to_owned());
    }
    let high_level = |kind: &InstKind| {
        kind.is_interface_construct()
            || kind.is_func_value_construct()
            || kind.is_concurrency_construct()
    };
    match find_inst(module, high_level) {
        Some(found) => Err(format!("high-level construct left: {found}")),
        None => Ok(()),
    }
}

fn postcondition(module: &Module, _: &PassContext) -> Result<(), String> {
    let Some(roots) = &module.roots else {
        return Err("no root table attached".to_owned());
    };
    match roots.frames.iter().find(|f| module.function(&f.function).is_none()) {
        Some(frame) => Err(format!("frame {} describes missing @{}", frame.id, frame.function)),
        None => Ok(()),
    }
}

// ── Analysis ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotKind {
    /// An SSA value stored into the slot after its definition.
    Spilled,
    /// An `alloca` whose storage is the slot itself.
    Relocated,
}

#[derive(Clone, Debug)]
struct Slot {
    value: ValueId,
    kind: SlotKind,
    ty: Type,
    layout: SlotLayout,
}

#[derive(Clone, Debug)]
struct SafePoint {
    block: usize,
    index: usize,
    /// Live slot indices, ascending.
    roots: Vec<u32>,
}

/// Frame requirements of one function.
#[derive(Clone, Debug)]
struct FramePlan {
    slots: Vec<Slot>,
    safe_points: Vec<SafePoint>,
}

fn slot_layout(layout: DataLayout<'_>, ty: &Type) -> LowerResult<SlotLayout> {
    let size = layout.size_of(ty)?;
    Ok(match layout.pointer_map(ty) {
        PointerMap::Precise(offsets) => SlotLayout::Precise { size, offsets },
        PointerMap::None => SlotLayout::Precise {
            size,
            offsets: Vec::new(),
        },
        PointerMap::Unknown => SlotLayout::Conservative { size },
    })
}

fn is_safe_point(module: &Module, kind: &InstKind) -> bool {
    match kind {
        InstKind::Call { callee, .. } => match callee.as_global() {
            Some(name) => !module.function_has(name, FnAttrs::NOGC),
            None => true,
        },
        _ => false,
    }
}

/// Pointer-holding allocas, and whether each one's address escapes.
///
/// Only loading through the address and storing a value to it keep an
/// alloca private.
fn pointer_allocas(body: &Body, layout: DataLayout<'_>) -> FxHashMap<ValueId, bool> {
    let mut allocas: FxHashMap<ValueId, bool> = body
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .filter_map(|inst| match (&inst.kind, inst.result) {
            (InstKind::Alloca { ty, .. }, Some(v)) if layout.pointer_map(ty).has_pointers() => {
                Some((v, false))
            }
            _ => None,
        })
        .collect();
    if allocas.is_empty() {
        return allocas;
    }
    for block in &body.blocks {
        for inst in &block.insts {
            let private = match &inst.kind {
                InstKind::Load { ptr, .. } => ptr.as_local(),
                InstKind::Store { ptr, value, .. } if value != ptr => ptr.as_local(),
                _ => None,
            };
            for v in inst.kind.used_values() {
                if Some(v) != private {
                    if let Some(escaped) = allocas.get_mut(&v) {
                        *escaped = true;
                    }
                }
            }
        }
        for v in block.term.used_values() {
            if let Some(escaped) = allocas.get_mut(&v) {
                *escaped = true;
            }
        }
    }
    allocas
}

/// Decide the frame of `function`, or `None` when nothing needs rooting.
fn plan_frame(
    module: &Module,
    layout: DataLayout<'_>,
    function: &Function,
) -> LowerResult<Option<FramePlan>> {
    if function.has(FnAttrs::NOGC) {
        return Ok(None);
    }
    let Some(body) = function.body.as_ref() else {
        return Ok(None);
    };
    let allocas = pointer_allocas(body, layout);
    let stack: FxHashSet<ValueId> = body
        .blocks
        .iter()
        .flat_map(|b| b.insts.iter())
        .filter(|inst| matches!(inst.kind, InstKind::Alloca { .. }))
        .filter_map(|inst| inst.result)
        .collect();
    let escaped: Vec<ValueId> = allocas
        .iter()
        .filter(|&(_, &escaped)| escaped)
        .map(|(&v, _)| v)
        .collect();
    let is_root = |v: ValueId| {
        allocas.contains_key(&v)
            || (!stack.contains(&v) && layout.pointer_map(body.value_type(v)).has_pointers())
    };

    let liveness = compute_liveness(body);
    let mut points: Vec<(usize, usize, Vec<ValueId>)> = Vec::new();
    for block_id in body.block_ids() {
        let block = body.block(block_id);
        let mut live = liveness.live_out[block_id.index()].clone();
        live.extend(block.term.used_values());
        let mut found = Vec::new();
        for (index, inst) in block.insts.iter().enumerate().rev() {
            if inst.kind.is_phi() {
                break;
            }
            if is_safe_point(module, &inst.kind) {
                let mut roots: Vec<ValueId> = live
                    .iter()
                    .copied()
                    .filter(|&v| Some(v) != inst.result && is_root(v))
                    .chain(escaped.iter().copied())
                    .collect();
                roots.sort_unstable();
                roots.dedup();
                found.push((block_id.index(), index, roots));
            }
            if let Some(result) = inst.result {
                live.remove(&result);
            }
            live.extend(inst.kind.used_values());
        }
        points.extend(found.into_iter().rev());
    }
    if points.iter().all(|(_, _, roots)| roots.is_empty()) {
        return Ok(None);
    }

    // Slots in definition order: parameters first.
    let defs = body.definitions();
    let mut rooted: Vec<ValueId> = points.iter().flat_map(|(_, _, r)| r.iter().copied()).collect();
    rooted.sort_unstable();
    rooted.dedup();
    rooted.sort_by_key(|v| match defs[v.index()] {
        Some(ValueDef::Param(i)) => (0, i, 0),
        Some(ValueDef::Inst(block, index)) => (1, block.index(), index),
        None => (2, v.index(), 0),
    });

    let mut slot_of: FxHashMap<ValueId, u32> = FxHashMap::default();
    let mut slots = Vec::with_capacity(rooted.len());
    for (slot, &value) in (0u32..).zip(&rooted) {
        let (kind, ty) = if allocas.contains_key(&value) {
            let ty = alloca_type(body, &defs, value).ok_or_else(|| {
                LowerError::internal(format!("%{} is not an alloca", body.value_name(value)))
            })?;
            (SlotKind::Relocated, ty)
        } else {
            (SlotKind::Spilled, body.value_type(value).clone())
        };
        slot_of.insert(value, slot);
        let shape = slot_layout(layout, &ty).map_err(|err| err.in_function(&function.name))?;
        slots.push(Slot {
            value,
            kind,
            layout: shape,
            ty,
        });
    }

    let safe_points = points
        .into_iter()
        .map(|(block, index, roots)| SafePoint {
            block,
            index,
            roots: roots.iter().filter_map(|v| slot_of.get(v).copied()).collect(),
        })
        .collect();
    Ok(Some(FramePlan { slots, safe_points }))
}

fn alloca_type(body: &Body, defs: &[Option<ValueDef>], value: ValueId) -> Option<Type> {
    let Some(ValueDef::Inst(block, index)) = defs[value.index()] else {
        return None;
    };
    match &body.block(block).insts[index].kind {
        InstKind::Alloca { ty, .. } => Some(ty.clone()),
        _ => None,
    }
}

// ── Instrumentation ─────────────────────────────────────────────────

/// A committed frame: the plan plus the ids the registry assigned.
#[derive(Debug)]
struct Frame {
    ty: Type,
    id: u32,
    plan: FramePlan,
    /// Safe-point id of each entry of `plan.safe_points`.
    safe_point_ids: Vec<u32>,
}

fn field_addr(body: &mut Body, hint: &str, frame_ty: &Type, frame: ValueId, field: u32) -> (ValueId, Inst) {
    let addr = body.add_value(hint, Type::Ptr);
    let inst = Inst::new(
        Some(addr),
        InstKind::Gep {
            ty: frame_ty.clone(),
            base: Operand::Local(frame),
            index: Operand::Int(i64::from(field)),
        },
    );
    (addr, inst)
}

fn store(ty: Type, value: Operand, ptr: Operand) -> Inst {
    Inst::effect(InstKind::Store {
        ty,
        value,
        ptr,
        align: None,
    })
}

/// `%v.root = gep ...` and the store of `v` into it.
fn spill(body: &mut Body, frame_ty: &Type, frame: ValueId, value: ValueId, slot: u32) -> [Inst; 2] {
    let hint = format!("{}.root", body.value_name(value));
    let ty = body.value_type(value).clone();
    let (addr, gep) = field_addr(body, &hint, frame_ty, frame, HEADER_FIELDS + slot);
    [gep, store(ty, Operand::Local(value), Operand::Local(addr))]
}

fn instrument(body: &mut Body, frame: &Frame) {
    let ty = &frame.ty;
    let chain = || Operand::global(GC_STACK_CHAIN);

    let record = body.add_value("gcframe", Type::Ptr);
    let parent = body.add_value("gcframe.parent", Type::Ptr);
    let (link, link_gep) = field_addr(body, "gcframe.link", ty, record, 0);
    let (id, id_gep) = field_addr(body, "gcframe.id", ty, record, 1);
    let (active, active_gep) = field_addr(body, "gcframe.safepoint", ty, record, 2);
    let mut prologue = vec![
        Inst::new(
            Some(record),
            InstKind::Alloca {
                ty: ty.clone(),
                align: None,
            },
        ),
        store(ty.clone(), Operand::Zero, Operand::Local(record)),
        Inst::new(
            Some(parent),
            InstKind::Load {
                ty: Type::Ptr,
                ptr: chain(),
                align: None,
            },
        ),
        link_gep,
        store(Type::Ptr, Operand::Local(parent), Operand::Local(link)),
        id_gep,
        store(Type::I32, Operand::Int(i64::from(frame.id)), Operand::Local(id)),
        active_gep,
        store(Type::Ptr, Operand::Local(record), chain()),
    ];

    let mut spilled: FxHashMap<ValueId, u32> = FxHashMap::default();
    let mut relocated: FxHashMap<ValueId, u32> = FxHashMap::default();
    for (slot, s) in (0u32..).zip(&frame.plan.slots) {
        match s.kind {
            SlotKind::Spilled => spilled.insert(s.value, slot),
            SlotKind::Relocated => relocated.insert(s.value, slot),
        };
    }
    let safe_points: FxHashMap<(usize, usize), u32> = frame
        .plan
        .safe_points
        .iter()
        .zip(&frame.safe_point_ids)
        .map(|(p, &id)| ((p.block, p.index), id))
        .collect();

    for &param in &body.params.clone() {
        if let Some(&slot) = spilled.get(&param) {
            prologue.extend(spill(body, ty, record, param, slot));
        }
    }

    let block_ids: Vec<_> = body.block_ids().collect();
    for block_id in block_ids {
        let insts = std::mem::take(&mut body.block_mut(block_id).insts);
        let mut out = Vec::with_capacity(insts.len() + 4);
        let mut after_phis: Vec<(ValueId, u32)> = Vec::new();
        let mut last_stored = None;
        for (index, mut inst) in insts.into_iter().enumerate() {
            if !inst.kind.is_phi() {
                for (value, slot) in after_phis.drain(..) {
                    out.extend(spill(body, ty, record, value, slot));
                }
            }
            if let Some(&id) = safe_points.get(&(block_id.index(), index)) {
                if last_stored != Some(id) {
                    out.push(
                        store(Type::I32, Operand::Int(i64::from(id)), Operand::Local(active))
                            .with_loc(inst.loc.clone()),
                    );
                    last_stored = Some(id);
                }
            }
            let relocate = inst.result.and_then(|v| relocated.get(&v).copied());
            if let (Some(slot), InstKind::Alloca { .. }) = (relocate, &inst.kind) {
                inst.kind = InstKind::Gep {
                    ty: ty.clone(),
                    base: Operand::Local(record),
                    index: Operand::Int(i64::from(HEADER_FIELDS + slot)),
                };
            }
            let spill_slot = inst.result.and_then(|v| spilled.get(&v).map(|&s| (v, s)));
            let is_phi = inst.kind.is_phi();
            out.push(inst);
            match spill_slot {
                Some(pending) if is_phi => after_phis.push(pending),
                Some((value, slot)) => out.extend(spill(body, ty, record, value, slot)),
                None => {}
            }
        }
        for (value, slot) in after_phis {
            out.extend(spill(body, ty, record, value, slot));
        }
        if matches!(body.block(block_id).term, Terminator::Ret(_)) {
            out.push(store(Type::Ptr, Operand::Local(parent), chain()));
        }
        body.block_mut(block_id).insts = out;
    }
    prepend_to_entry(body, prologue);
}

// ── Pass entry ──────────────────────────────────────────────────────

/// Instrument every function that holds pointers across a safe point and
/// attach the root table to `module`.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(functions = module.functions.len())
)]
pub fn instrument_gc_roots(module: &mut Module, ctx: &mut PassContext) -> LowerResult<()> {
    let pointer_size = ctx.config.pointer_size;
    let mut registry = RootRegistry::new();

    let plans: Vec<Option<FramePlan>> = {
        let shared: &Module = module;
        let layout = DataLayout::new(shared, pointer_size);
        for global in &shared.globals {
            if global.constant || global.name == GC_STACK_CHAIN {
                continue;
            }
            if layout.pointer_map(&global.ty).has_pointers() {
                registry.add_global(&global.name, slot_layout(layout, &global.ty)?);
            }
        }
        shared
            .functions
            .par_iter()
            .map(|f| plan_frame(shared, layout, f))
            .collect::<LowerResult<_>>()?
    };

    let names: Vec<String> = module.functions.iter().map(|f| f.name.clone()).collect();
    let mut frames: Vec<Option<Frame>> = Vec::with_capacity(plans.len());
    for (name, plan) in names.iter().zip(plans) {
        let Some(plan) = plan else {
            frames.push(None);
            continue;
        };
        let mut fields = vec![Type::Ptr, Type::I32, Type::I32];
        fields.extend(plan.slots.iter().map(|s| s.ty.clone()));
        let ty = fresh_type(module, &format!("{name}$gcframe"), Type::Struct(fields));
        let offsets = DataLayout::new(module, pointer_size)
            .field_offsets(&ty)
            .map_err(|err| LowerError::from(err).in_function(name))?;
        let slots = plan
            .slots
            .iter()
            .zip(offsets.iter().skip(HEADER_FIELDS as usize))
            .map(|(s, &offset)| FrameSlot {
                offset,
                layout: s.layout.clone(),
            })
            .collect();
        let root_sets: Vec<Vec<u32>> = plan.safe_points.iter().map(|p| p.roots.clone()).collect();
        let (id, safe_point_ids) = registry.add_frame(name, slots, &root_sets);
        debug!(
            function = %name,
            id,
            slots = plan.slots.len(),
            safe_points = root_sets.len(),
            "frame"
        );
        frames.push(Some(Frame {
            ty,
            id,
            plan,
            safe_point_ids,
        }));
    }

    module
        .functions
        .par_iter_mut()
        .zip(frames.par_iter())
        .for_each(|(function, frame)| {
            if let (Some(frame), Some(body)) = (frame, function.body.as_mut()) {
                instrument(body, frame);
            }
        });

    if registry.frame_count() > 0 {
        declare_gc_stack_chain(module);
    }
    module.roots = Some(registry.freeze());
    Ok(())
}

#[cfg(test)]
mod tests;
