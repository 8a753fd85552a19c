//! Body rewriting helpers shared by the passes.
//!
//! [`rewrite_insts`] walks every instruction once and lets a pass replace it
//! with any sequence of new instructions through an [`Emit`] handle. Values
//! that fold to constants and blocks cut short by a non-returning call are
//! cleaned up afterwards, so each pass only describes the local rewrite.

use mote_ir::{
    Arg, BlockId, Body, DebugLoc, ICmpPred, Inst, InstKind, Module, Operand, Terminator, Type,
    ValueId,
};
use rustc_hash::FxHashMap;

use crate::error::LowerResult;

/// What happens to the rest of the block after a rewritten instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// Control never gets past this point: the remaining instructions are
    /// dropped and the block ends in `unreachable`.
    Unreachable,
}

/// Instruction sink for one rewritten instruction.
pub(crate) struct Emit<'a> {
    pub body: &'a mut Body,
    out: &'a mut Vec<Inst>,
    hoisted: &'a mut Vec<Inst>,
    substitutions: &'a mut FxHashMap<ValueId, Operand>,
    loc: Option<DebugLoc>,
}

impl Emit<'_> {
    /// Push an instruction with a fresh result value.
    pub fn value(&mut self, hint: &str, ty: Type, kind: InstKind) -> Operand {
        let v = self.body.add_value(hint, ty);
        self.push(Inst::new(Some(v), kind));
        Operand::Local(v)
    }

    /// Push an instruction defining an existing value (or nothing).
    pub fn define(&mut self, result: Option<ValueId>, kind: InstKind) {
        self.push(Inst::new(result, kind));
    }

    pub fn effect(&mut self, kind: InstKind) {
        self.push(Inst::effect(kind));
    }

    pub fn push(&mut self, inst: Inst) {
        let inst = if inst.loc.is_none() {
            inst.with_loc(self.loc.clone())
        } else {
            inst
        };
        self.out.push(inst);
    }

    /// Place an instruction at the start of the entry block.
    pub fn hoist(&mut self, inst: Inst) {
        self.hoisted.push(inst);
    }

    /// Every later use of `result` reads `op` instead; the defining
    /// instruction is simply not re-emitted.
    pub fn substitute(&mut self, result: Option<ValueId>, op: Operand) {
        if let Some(v) = result {
            self.substitutions.insert(v, op);
        }
    }

    /// Name hint derived from the replaced instruction's result.
    pub fn hint(&self, result: Option<ValueId>, suffix: &str, fallback: &str) -> String {
        match result {
            Some(v) => format!("{}.{suffix}", self.body.value_name(v)),
            None => fallback.to_owned(),
        }
    }

    /// `<name>.<suffix>` when `op` is a named local, `suffix` otherwise.
    pub fn operand_hint(&self, op: &Operand, suffix: &str) -> String {
        match op.as_local() {
            Some(v) => format!("{}.{suffix}", self.body.value_name(v)),
            None => suffix.to_owned(),
        }
    }

    pub fn call(&mut self, callee: &str, args: Vec<Arg>) {
        self.effect(InstKind::Call {
            ret: Type::Void,
            callee: Operand::global(callee),
            args,
        });
    }

    pub fn gep(&mut self, hint: &str, ty: &Type, base: Operand, index: i64) -> Operand {
        self.value(
            hint,
            Type::Ptr,
            InstKind::Gep {
                ty: ty.clone(),
                base,
                index: Operand::Int(index),
            },
        )
    }

    pub fn load(&mut self, hint: &str, ty: &Type, ptr: Operand) -> Operand {
        self.value(
            hint,
            ty.clone(),
            InstKind::Load {
                ty: ty.clone(),
                ptr,
                align: None,
            },
        )
    }

    pub fn store(&mut self, ty: &Type, value: Operand, ptr: Operand) {
        self.effect(InstKind::Store {
            ty: ty.clone(),
            value,
            ptr,
            align: None,
        });
    }

    pub fn extract(&mut self, hint: &str, agg_ty: &Type, field_ty: Type, agg: Operand, index: u32) -> Operand {
        self.value(
            hint,
            field_ty,
            InstKind::ExtractValue {
                ty: agg_ty.clone(),
                agg,
                index,
            },
        )
    }

    pub fn icmp_eq(&mut self, result: Option<ValueId>, hint: &str, lhs: Operand, rhs: Operand) -> Operand {
        let kind = InstKind::ICmp {
            pred: ICmpPred::Eq,
            ty: Type::I32,
            lhs,
            rhs,
        };
        match result {
            Some(v) => {
                self.define(Some(v), kind);
                Operand::Local(v)
            }
            None => self.value(hint, Type::I1, kind),
        }
    }

    /// Build a two-field pair (`iface` or `func`) into `result`.
    pub fn pair(&mut self, result: Option<ValueId>, ty: &Type, first: Arg, second: Arg) {
        let partial_hint = self.hint(result, "partial", "pair.partial");
        let partial = self.value(
            &partial_hint,
            ty.clone(),
            InstKind::InsertValue {
                ty: ty.clone(),
                agg: Operand::Undef,
                elem_ty: first.0,
                elem: first.1,
                index: 0,
            },
        );
        self.define(
            result,
            InstKind::InsertValue {
                ty: ty.clone(),
                agg: partial,
                elem_ty: second.0,
                elem: second.1,
                index: 1,
            },
        );
    }
}

/// Rewrite every instruction of `body` through `f`.
///
/// `f` receives each original instruction and must emit its replacement
/// (re-emitting the instruction unchanged keeps it). Afterwards hoisted
/// instructions are placed in the entry block, folded values are
/// substituted, blocks made unreachable are removed and the value table is
/// compacted.
pub(crate) fn rewrite_insts(
    body: &mut Body,
    mut f: impl FnMut(&mut Emit<'_>, Inst) -> LowerResult<Step>,
) -> LowerResult<()> {
    let mut substitutions: FxHashMap<ValueId, Operand> = FxHashMap::default();
    let mut hoisted = Vec::new();
    let mut truncated = false;

    let block_ids: Vec<BlockId> = body.block_ids().collect();
    for block_id in block_ids {
        let insts = std::mem::take(&mut body.block_mut(block_id).insts);
        let mut out = Vec::with_capacity(insts.len());
        let mut cut = false;
        for inst in insts {
            let loc = inst.loc.clone();
            let mut emit = Emit {
                body: &mut *body,
                out: &mut out,
                hoisted: &mut hoisted,
                substitutions: &mut substitutions,
                loc,
            };
            if f(&mut emit, inst)? == Step::Unreachable {
                cut = true;
                break;
            }
        }
        if cut {
            make_unreachable(body, block_id);
            truncated = true;
        }
        body.block_mut(block_id).insts = out;
    }

    prepend_to_entry(body, hoisted);
    if !substitutions.is_empty() {
        apply_substitutions(body, &substitutions);
    }
    if truncated {
        body.remove_unreachable_blocks();
    }
    if truncated || !substitutions.is_empty() {
        body.compact_values();
    }
    Ok(())
}

/// End `block` in `unreachable`, detaching it from its successors' phis.
pub(crate) fn make_unreachable(body: &mut Body, block: BlockId) {
    for succ in body.block(block).term.successors() {
        body.remove_phi_incoming(succ, block);
    }
    let block = body.block_mut(block);
    block.term = Terminator::Unreachable;
    block.term_loc = None;
}

fn apply_substitutions(body: &mut Body, substitutions: &FxHashMap<ValueId, Operand>) {
    let resolve = |mut op: Operand| {
        // Chains are short; the bound only guards against a cycle.
        for _ in 0..=substitutions.len() {
            match op.as_local().and_then(|v| substitutions.get(&v)) {
                Some(next) => op = next.clone(),
                None => break,
            }
        }
        op
    };
    let mut keys: Vec<ValueId> = substitutions.keys().copied().collect();
    keys.sort_unstable();
    for v in keys {
        let target = resolve(Operand::Local(v));
        body.replace_uses(v, &target);
    }
}

/// Move everything after instruction `index` of `block` (and its
/// terminator) into a new block named after `hint`; `block` then branches
/// to it. Returns the new block.
pub(crate) fn split_after(body: &mut Body, block: BlockId, index: usize, hint: &str) -> BlockId {
    let tail_id = body.add_block(hint);
    let (tail_insts, term, term_loc) = {
        let head = body.block_mut(block);
        let tail_insts = head.insts.split_off(index + 1);
        let term = std::mem::replace(&mut head.term, Terminator::Br(tail_id));
        (tail_insts, term, head.term_loc.take())
    };
    for succ in term.successors() {
        body.retarget_phi_incoming(succ, block, tail_id);
    }
    let tail = body.block_mut(tail_id);
    tail.insts = tail_insts;
    tail.term = term;
    tail.term_loc = term_loc;
    tail_id
}

/// A type name derived from `hint` that the module does not define yet.
pub(crate) fn fresh_type(module: &mut Module, hint: &str, ty: Type) -> Type {
    let mut name = hint.to_owned();
    let mut n = 1u32;
    while module.type_def(&name).is_some() {
        name = format!("{hint}.{n}");
        n += 1;
    }
    module.intern_type(&name, ty)
}

/// Insert `insts` so they run once, on entry to the function. An entry block
/// that is also a branch target gets a new block in front of it.
pub(crate) fn prepend_to_entry(body: &mut Body, insts: Vec<Inst>) {
    if insts.is_empty() {
        return;
    }
    let entry = body.entry();
    let looped = body
        .blocks
        .iter()
        .any(|b| b.term.successors().contains(&entry));
    if looped {
        let head = body.add_block("prologue");
        let block = body.block_mut(head);
        block.insts = insts;
        block.term = Terminator::Br(entry);
        let order: Vec<BlockId> = std::iter::once(head)
            .chain(body.block_ids().filter(|b| *b != head))
            .collect();
        body.reorder_blocks(&order);
        return;
    }
    let block = body.block_mut(entry);
    let rest = std::mem::replace(&mut block.insts, insts);
    block.insts.extend(rest);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mote_ir::{parse_module, verify_module};

    use super::*;

    #[test]
    fn folded_values_are_substituted_and_compacted() {
        let mut module = parse_module(
            "define i32 @f() {\nentry:\n  %x = add i32 1, 2\n  %y = add i32 %x, 3\n  ret i32 %y\n}\n",
        )
        .unwrap();
        let body = module.functions[0].body.as_mut().unwrap();
        rewrite_insts(body, |emit, inst| {
            if body_name(emit, &inst) == Some("x") {
                emit.substitute(inst.result, Operand::Int(3));
            } else {
                emit.push(inst);
            }
            Ok(Step::Continue)
        })
        .unwrap();
        verify_module(&module).unwrap();
        assert!(module.to_string().contains("%y = add i32 3, 3"));
    }

    fn body_name<'a>(emit: &'a Emit<'_>, inst: &Inst) -> Option<&'a str> {
        inst.result.map(|v| emit.body.value_name(v))
    }

    #[test]
    fn unreachable_step_cuts_the_block() {
        let mut module = parse_module(
            "declare void @stop()\n\
             define i32 @f(i1 %c) {\n\
             entry:\n  br i1 %c, label %a, label %b\n\n\
             a:\n  call void @stop()\n  %v = add i32 1, 1\n  br label %b\n\n\
             b:\n  %m = phi i32 [ 0, %entry ], [ %v, %a ]\n  ret i32 %m\n}\n",
        )
        .unwrap();
        let body = module.functions[1].body.as_mut().unwrap();
        rewrite_insts(body, |emit, inst| {
            let stops = inst.kind.direct_callee() == Some("stop");
            emit.push(inst);
            Ok(if stops { Step::Unreachable } else { Step::Continue })
        })
        .unwrap();
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("  call void @stop()\n  unreachable\n"), "{text}");
        assert!(text.contains("%m = phi i32 [ 0, %entry ]\n"), "{text}");
    }

    #[test]
    fn split_after_moves_tail_and_phi_edges() {
        let mut module = parse_module(
            "define i32 @f(i1 %c) {\n\
             entry:\n  %x = add i32 1, 1\n  %y = add i32 %x, 1\n  br i1 %c, label %j, label %j2\n\n\
             j:\n  %m = phi i32 [ %y, %entry ]\n  ret i32 %m\n\n\
             j2:\n  ret i32 0\n}\n",
        )
        .unwrap();
        let body = module.functions[0].body.as_mut().unwrap();
        let tail = split_after(body, BlockId::new(0), 0, "entry.after");
        assert_eq!(body.block(tail).name, "entry.after");
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(text.contains("  %x = add i32 1, 1\n  br label %entry.after\n"), "{text}");
        assert!(text.contains("%m = phi i32 [ %y, %entry.after ]"), "{text}");
    }

    #[test]
    fn looping_entry_gets_its_own_prologue_block() {
        let mut module = parse_module(
            "define void @f(i1 %c) {\n\
             entry:\n  %x = add i32 1, 1\n  br i1 %c, label %entry, label %done\n\n\
             done:\n  ret void\n}\n",
        )
        .unwrap();
        let body = module.functions[0].body.as_mut().unwrap();
        let once = body.add_value("once", Type::I32);
        let inst = Inst::new(
            Some(once),
            InstKind::Binary {
                op: mote_ir::BinOp::Add,
                ty: Type::I32,
                lhs: Operand::Int(2),
                rhs: Operand::Int(2),
            },
        );
        prepend_to_entry(body, vec![inst]);
        verify_module(&module).unwrap();
        let text = module.to_string();
        assert!(
            text.contains("prologue:\n  %once = add i32 2, 2\n  br label %entry\n\nentry:\n"),
            "{text}"
        );
        assert!(text.contains("br i1 %c, label %entry, label %done"), "{text}");
    }
}
