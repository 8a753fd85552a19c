//! On-demand phi construction for values with more than one definition.
//!
//! A continuation restores a saved value at its resume block, but the
//! original definition can still be reached too (a value carried around a
//! loop that contains the suspension point). Every use is then rewritten to
//! whichever definition reaches it, with phis created at join points as the
//! search walks predecessors.

use mote_ir::graph::compute_predecessors;
use mote_ir::{BlockId, Body, Inst, InstKind, Operand, ValueDef, ValueId};
use rustc_hash::FxHashMap;

/// Rewrite the uses of `old` now that `new` also defines it.
///
/// `new` must be defined by an instruction in a different block than `old`.
/// Returns the number of phis inserted.
pub(super) fn merge_definitions(body: &mut Body, old: ValueId, new: ValueId) -> usize {
    let defs = body.definitions();
    let mut at_end: FxHashMap<BlockId, (usize, ValueId)> = FxHashMap::default();
    for value in [old, new] {
        if let Some(ValueDef::Inst(block, index)) = defs[value.index()] {
            at_end.insert(block, (index, value));
        }
    }

    let mut search = Search {
        preds: compute_predecessors(body),
        at_end,
        at_start: FxHashMap::default(),
        phis: Vec::new(),
        ty: body.value_type(old).clone(),
        hint: body.value_name(old).to_owned(),
        body,
    };

    // Resolve every use first, then edit: inserting phis shifts indices.
    let mut rewrites: Vec<(BlockId, usize, Rewrite)> = Vec::new();
    let block_ids: Vec<BlockId> = search.body.block_ids().collect();
    for block_id in block_ids {
        let insts = search.body.block(block_id).insts.clone();
        for (i, inst) in insts.iter().enumerate() {
            if !inst.kind.used_values().contains(&old) {
                continue;
            }
            let rewrite = match &inst.kind {
                InstKind::Phi { incoming, .. } => Rewrite::Incoming(
                    incoming
                        .iter()
                        .map(|(op, from)| match op.as_local() {
                            Some(v) if v == old => search.read_at_end(*from),
                            _ => op.clone(),
                        })
                        .collect(),
                ),
                _ => Rewrite::All(search.read_before(block_id, i)),
            };
            rewrites.push((block_id, i, rewrite));
        }
        if search.body.block(block_id).term.used_values().contains(&old) {
            let op = search.read_at_end(block_id);
            rewrites.push((block_id, usize::MAX, Rewrite::All(op)));
        }
    }

    let Search { phis, body, .. } = search;
    let target = Operand::Local(old);
    for (block_id, index, rewrite) in rewrites {
        let block = body.block_mut(block_id);
        if index == usize::MAX {
            if let Rewrite::All(op) = &rewrite {
                block.term.for_each_operand_mut(|o| {
                    if *o == target {
                        *o = op.clone();
                    }
                });
            }
            continue;
        }
        let inst = &mut block.insts[index];
        match (&mut inst.kind, rewrite) {
            (InstKind::Phi { incoming, .. }, Rewrite::Incoming(ops)) => {
                for ((op, _), new_op) in incoming.iter_mut().zip(ops) {
                    *op = new_op;
                }
            }
            (kind, Rewrite::All(op)) => kind.for_each_operand_mut(|o| {
                if *o == target {
                    *o = op.clone();
                }
            }),
            _ => {}
        }
    }

    let count = phis.len();
    for (block_id, phi) in phis.into_iter().rev() {
        body.block_mut(block_id).insts.insert(0, phi);
    }
    count
}

enum Rewrite {
    All(Operand),
    Incoming(Vec<Operand>),
}

struct Search<'b> {
    body: &'b mut Body,
    preds: Vec<Vec<BlockId>>,
    /// The definition made inside a block and its instruction index.
    at_end: FxHashMap<BlockId, (usize, ValueId)>,
    at_start: FxHashMap<BlockId, Operand>,
    phis: Vec<(BlockId, Inst)>,
    ty: mote_ir::Type,
    hint: String,
}

impl Search<'_> {
    fn read_before(&mut self, block: BlockId, index: usize) -> Operand {
        match self.at_end.get(&block) {
            Some(&(def, value)) if def < index => Operand::Local(value),
            _ => self.read_at_start(block),
        }
    }

    fn read_at_end(&mut self, block: BlockId) -> Operand {
        match self.at_end.get(&block) {
            Some(&(_, value)) => Operand::Local(value),
            None => self.read_at_start(block),
        }
    }

    fn read_at_start(&mut self, block: BlockId) -> Operand {
        if let Some(op) = self.at_start.get(&block) {
            return op.clone();
        }
        let preds = self.preds[block.index()].clone();
        match preds.as_slice() {
            [] => Operand::Undef,
            [single] => {
                // Guards a cycle of single-predecessor blocks, which can
                // only be unreachable.
                self.at_start.insert(block, Operand::Undef);
                let op = self.read_at_end(*single);
                self.at_start.insert(block, op.clone());
                op
            }
            _ => {
                let phi = self.body.add_value(&self.hint, self.ty.clone());
                self.at_start.insert(block, Operand::Local(phi));
                let incoming = preds
                    .iter()
                    .map(|&pred| (self.read_at_end(pred), pred))
                    .collect();
                self.phis.push((
                    block,
                    Inst::new(
                        Some(phi),
                        InstKind::Phi {
                            ty: self.ty.clone(),
                            incoming,
                        },
                    ),
                ));
                Operand::Local(phi)
            }
        }
    }
}
