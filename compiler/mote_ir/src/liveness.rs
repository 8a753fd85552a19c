//! Backward dataflow liveness over SSA values.
//!
//! # Algorithm
//!
//! 1. **Precompute gen/kill** per block (forward scan).
//!    - `gen(B)`: values used by a non-phi instruction or the terminator of
//!      B before any definition in B.
//!    - `kill(B)`: values defined in B, phis included.
//! 2. **Postorder iteration** until nothing changes:
//!    - `live_out(B) = ∪ (live_in(S) ∪ phi_uses(S, B))` over successors S.
//!    - `live_in(B) = gen(B) ∪ (live_out(B) - kill(B))`.
//!
//! A phi operand is a use on the edge from its incoming block, so it is
//! live out of that predecessor but not live into the phi's own block.
//! Parameters are never killed and so reach `live_in(entry)` when used.

use rustc_hash::FxHashSet;

use crate::graph::compute_postorder;
use crate::ir::{BlockId, Body, InstKind, ValueId};

/// Set of live values at a program point.
pub type LiveSet = FxHashSet<ValueId>;

/// Liveness at every block boundary, indexed by [`BlockId::index`].
pub struct BlockLiveness {
    pub live_in: Vec<LiveSet>,
    pub live_out: Vec<LiveSet>,
}

/// Values flowing from `pred` into the phis of `block`.
fn phi_uses_from(body: &Body, block: BlockId, pred: BlockId) -> impl Iterator<Item = ValueId> + '_ {
    body.block(block).insts.iter().filter_map(move |inst| match &inst.kind {
        InstKind::Phi { incoming, .. } => incoming
            .iter()
            .find(|(_, from)| *from == pred)
            .and_then(|(value, _)| value.as_local()),
        _ => None,
    })
}

pub fn compute_liveness(body: &Body) -> BlockLiveness {
    let num_blocks = body.blocks.len();

    let mut gen: Vec<LiveSet> = Vec::with_capacity(num_blocks);
    let mut kill: Vec<LiveSet> = Vec::with_capacity(num_blocks);
    for block_id in body.block_ids() {
        let (block_gen, block_kill) = compute_gen_kill(body, block_id);
        gen.push(block_gen);
        kill.push(block_kill);
    }

    // Reachable blocks in postorder, then unreachable ones so every block
    // gets sets.
    let mut order = compute_postorder(body);
    let mut in_order = vec![false; num_blocks];
    for b in &order {
        in_order[b.index()] = true;
    }
    order.extend(body.block_ids().filter(|b| !in_order[b.index()]));

    let mut live_in: Vec<LiveSet> = (0..num_blocks).map(|_| LiveSet::default()).collect();
    let mut live_out: Vec<LiveSet> = (0..num_blocks).map(|_| LiveSet::default()).collect();

    let mut iteration = 0u32;
    loop {
        iteration += 1;
        let mut changed = false;

        for &block_id in &order {
            let idx = block_id.index();
            let mut new_live_out = LiveSet::default();
            for succ in body.block(block_id).term.successors() {
                new_live_out.extend(live_in[succ.index()].iter().copied());
                new_live_out.extend(phi_uses_from(body, succ, block_id));
            }

            let mut new_live_in = gen[idx].clone();
            new_live_in.extend(new_live_out.iter().filter(|v| !kill[idx].contains(v)));

            if new_live_in != live_in[idx] || new_live_out != live_out[idx] {
                changed = true;
                live_in[idx] = new_live_in;
                live_out[idx] = new_live_out;
            }
        }

        if !changed {
            break;
        }
    }

    tracing::trace!(iterations = iteration, num_blocks, "liveness converged");

    BlockLiveness { live_in, live_out }
}

fn compute_gen_kill(body: &Body, block_id: BlockId) -> (LiveSet, LiveSet) {
    let block = body.block(block_id);
    let mut gen = LiveSet::default();
    let mut kill = LiveSet::default();

    for inst in &block.insts {
        if !inst.kind.is_phi() {
            for v in inst.kind.used_values() {
                if !kill.contains(&v) {
                    gen.insert(v);
                }
            }
        }
        if let Some(result) = inst.result {
            kill.insert(result);
        }
    }
    for v in block.term.used_values() {
        if !kill.contains(&v) {
            gen.insert(v);
        }
    }

    (gen, kill)
}

impl BlockLiveness {
    /// Live set immediately after each instruction of `block`.
    ///
    /// Entry `i` holds the values that are live once instruction `i` has
    /// executed: what a call at position `i` must preserve.
    pub fn live_after(&self, body: &Body, block_id: BlockId) -> Vec<LiveSet> {
        let block = body.block(block_id);
        let mut live = self.live_out[block_id.index()].clone();
        live.extend(block.term.used_values());

        let mut after = vec![LiveSet::default(); block.insts.len()];
        for (i, inst) in block.insts.iter().enumerate().rev() {
            after[i] = live.clone();
            if let Some(result) = inst.result {
                live.remove(&result);
            }
            if !inst.kind.is_phi() {
                live.extend(inst.kind.used_values());
            }
        }
        after
    }
}

#[cfg(test)]
mod tests;
