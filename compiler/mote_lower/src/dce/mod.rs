//! Whole-program dead-code elimination.
//!
//! Reachability starts from the program's roots (functions marked `entry`,
//! `interrupt` or `export`, `export` globals, and every implementation the
//! frozen method table may dispatch to) and follows symbol references in
//! function bodies and global initializers. Everything else is dropped,
//! declarations included, and frames of dropped functions leave the root
//! table.

use std::collections::VecDeque;

use mote_ir::{Linkage, Module};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::context::PassContext;
use crate::error::LowerResult;
use crate::pipeline::{find_inst, PassDescriptor};

pub const NAME: &str = "dce";

pub fn descriptor() -> PassDescriptor {
    PassDescriptor {
        name: NAME,
        precondition,
        run: eliminate_dead_code,
        postcondition,
        failures: &[],
    }
}

/// Dispatch targets are only known once interfaces are lowered.
fn precondition(module: &Module, _: &PassContext) -> Result<(), String> {
    if !module.concretes.is_empty() || !module.interfaces.is_empty() {
        return Err("concrete or interface declarations remain".to_owned());
    }
    match find_inst(module, mote_ir::InstKind::is_interface_construct) {
        Some(found) => Err(format!("interface construct left: {found}")),
        None => Ok(()),
    }
}

fn postcondition(module: &Module, ctx: &PassContext) -> Result<(), String> {
    let reached = reachable(module, &roots(module, Some(ctx)));
    let dead = module
        .functions
        .iter()
        .map(|f| f.name.as_str())
        .chain(module.globals.iter().map(|g| g.name.as_str()))
        .find(|name| !reached.contains(name));
    match dead {
        Some(name) => Err(format!("unreachable @{name} survived")),
        None => Ok(()),
    }
}

/// Symbols alive no matter what references them.
fn roots<'m>(module: &'m Module, ctx: Option<&'m PassContext>) -> Vec<&'m str> {
    let mut roots: Vec<&str> = module
        .functions
        .iter()
        .filter(|f| f.attrs.is_root())
        .map(|f| f.name.as_str())
        .collect();
    roots.extend(
        module
            .globals
            .iter()
            .filter(|g| g.linkage == Linkage::Export)
            .map(|g| g.name.as_str()),
    );
    if let Some(table) = ctx.and_then(PassContext::method_table) {
        roots.extend(table.live_implementations());
    }
    roots
}

/// Every symbol reachable from `roots`.
fn reachable<'m>(module: &'m Module, roots: &[&'m str]) -> FxHashSet<&'m str> {
    let mut edges: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
    for function in &module.functions {
        let Some(body) = &function.body else { continue };
        let refs = edges.entry(function.name.as_str()).or_default();
        for block in &body.blocks {
            for inst in &block.insts {
                refs.extend(inst.kind.symbol_refs());
            }
            refs.extend(block.term.symbol_refs());
        }
    }
    for global in &module.globals {
        if let Some(init) = &global.init {
            init.symbol_refs(edges.entry(global.name.as_str()).or_default());
        }
    }

    let mut reached: FxHashSet<&str> = FxHashSet::default();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for &root in roots {
        if reached.insert(root) {
            queue.push_back(root);
        }
    }
    while let Some(symbol) = queue.pop_front() {
        for &next in edges.get(symbol).into_iter().flatten() {
            if reached.insert(next) {
                queue.push_back(next);
            }
        }
    }
    reached
}

/// Drop every function and global no root reaches.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(functions = module.functions.len(), globals = module.globals.len())
)]
pub fn eliminate_dead_code(module: &mut Module, ctx: &mut PassContext) -> LowerResult<()> {
    let live: FxHashSet<String> = {
        let roots = roots(module, Some(&*ctx));
        reachable(module, &roots)
            .into_iter()
            .map(str::to_owned)
            .collect()
    };

    let functions_before = module.functions.len();
    let globals_before = module.globals.len();
    module.functions.retain(|f| live.contains(&f.name));
    module.globals.retain(|g| live.contains(&g.name));
    if let Some(roots) = &mut module.roots {
        roots.retain_symbols(|name| live.contains(name));
    }
    debug!(
        functions_removed = functions_before - module.functions.len(),
        globals_removed = globals_before - module.globals.len(),
        "dead code eliminated"
    );
    Ok(())
}

#[cfg(test)]
mod tests;
