//! Shared CFG utilities.
//!
//! Generic graph operations on a [`Body`] that several passes need. Passes
//! depend on this module, never on each other.

use crate::ir::{BlockId, Body};

/// Predecessor lists, indexed by block. Each list is deduplicated and in
/// block order of the predecessors.
pub fn compute_predecessors(body: &Body) -> Vec<Vec<BlockId>> {
    let num_blocks = body.blocks.len();
    let mut predecessors: Vec<Vec<BlockId>> = vec![Vec::new(); num_blocks];

    for block_id in body.block_ids() {
        for succ in body.block(block_id).term.successors() {
            if succ.index() < num_blocks {
                predecessors[succ.index()].push(block_id);
            }
        }
    }

    predecessors
}

/// Postorder traversal from the entry block. Only reachable blocks appear.
///
/// Iterative DFS with an explicit stack, so deeply nested CFGs cannot
/// overflow the native stack.
pub fn compute_postorder(body: &Body) -> Vec<BlockId> {
    let num_blocks = body.blocks.len();
    if num_blocks == 0 {
        return Vec::new();
    }
    let mut visited = vec![false; num_blocks];
    let mut postorder = Vec::with_capacity(num_blocks);

    // (block, children pushed)
    let mut stack: Vec<(BlockId, bool)> = vec![(body.entry(), false)];

    while let Some(&mut (block_id, ref mut children_done)) = stack.last_mut() {
        if *children_done {
            postorder.push(block_id);
            stack.pop();
            continue;
        }
        *children_done = true;

        if visited[block_id.index()] {
            stack.pop();
            continue;
        }
        visited[block_id.index()] = true;

        // Reverse so the first successor is explored first.
        for succ in body.block(block_id).term.successors().into_iter().rev() {
            if succ.index() < num_blocks && !visited[succ.index()] {
                stack.push((succ, false));
            }
        }
    }

    postorder
}

/// Reverse postorder from the entry block.
pub fn reverse_postorder(body: &Body) -> Vec<BlockId> {
    let mut order = compute_postorder(body);
    order.reverse();
    order
}

/// Blocks reachable from any of `starts` (the starts included).
pub fn reachable_from(body: &Body, starts: &[BlockId]) -> Vec<bool> {
    let mut seen = vec![false; body.blocks.len()];
    let mut stack: Vec<BlockId> = starts.to_vec();
    while let Some(block_id) = stack.pop() {
        if seen[block_id.index()] {
            continue;
        }
        seen[block_id.index()] = true;
        for succ in body.block(block_id).term.successors() {
            if !seen[succ.index()] {
                stack.push(succ);
            }
        }
    }
    seen
}

/// Blocks reachable from the entry block.
pub fn reachable_blocks(body: &Body) -> Vec<bool> {
    if body.blocks.is_empty() {
        return Vec::new();
    }
    reachable_from(body, &[body.entry()])
}

/// Blocks from which some block in `targets` can be reached (the targets
/// included).
pub fn reaching(body: &Body, targets: &[BlockId]) -> Vec<bool> {
    let preds = compute_predecessors(body);
    let mut seen = vec![false; body.blocks.len()];
    let mut stack: Vec<BlockId> = targets.to_vec();
    while let Some(block_id) = stack.pop() {
        if seen[block_id.index()] {
            continue;
        }
        seen[block_id.index()] = true;
        stack.extend(preds[block_id.index()].iter().copied().filter(|p| !seen[p.index()]));
    }
    seen
}
