//! Structural module verification.
//!
//! Checks the invariants every pass may assume and must re-establish:
//! closedness (every referenced symbol, type, concrete type and interface
//! exists), SSA shape (values in range and defined once, entry block free
//! of phis) and consistent phi predecessors.

use rustc_hash::FxHashSet;

use crate::graph::{compute_predecessors, reachable_blocks};
use crate::ir::{Body, Function, InstKind, Operand};
use crate::module::Module;
use crate::print::inst_to_string;
use crate::types::Type;

/// A violated module invariant.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{}{}", .function.as_ref().map(|f| format!("in @{f}: ")).unwrap_or_default(), .message)]
pub struct VerifyError {
    pub function: Option<String>,
    pub message: String,
}

impl VerifyError {
    fn module(message: impl Into<String>) -> Self {
        VerifyError {
            function: None,
            message: message.into(),
        }
    }

    fn in_function(function: &Function, message: impl Into<String>) -> Self {
        VerifyError {
            function: Some(function.name.clone()),
            message: message.into(),
        }
    }
}

/// Verify the whole module.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    let mut symbols = FxHashSet::default();
    for name in module
        .functions
        .iter()
        .map(|f| &f.name)
        .chain(module.globals.iter().map(|g| &g.name))
    {
        if !symbols.insert(name.as_str()) {
            return Err(VerifyError::module(format!("symbol @{name} defined twice")));
        }
    }

    let check_type = |ty: &Type| -> Result<(), String> {
        let mut refs = Vec::new();
        ty.named_refs(&mut refs);
        match refs.into_iter().find(|name| module.type_def(name).is_none()) {
            Some(name) => Err(format!("reference to undefined type %{name}")),
            None => Ok(()),
        }
    };

    for def in &module.types {
        check_type(&def.ty).map_err(VerifyError::module)?;
    }
    for concrete in &module.concretes {
        for (method, imp) in &concrete.methods {
            if !symbols.contains(imp.as_str()) {
                return Err(VerifyError::module(format!(
                    "concrete %{} method {method} refers to undefined @{imp}",
                    concrete.name
                )));
            }
        }
    }
    for global in &module.globals {
        check_type(&global.ty).map_err(VerifyError::module)?;
        if global.is_declaration() != global.init.is_none() {
            return Err(VerifyError::module(format!(
                "global @{} must have an initializer exactly when it is not external",
                global.name
            )));
        }
        if let Some(init) = &global.init {
            let mut refs = Vec::new();
            init.symbol_refs(&mut refs);
            if let Some(missing) = refs.into_iter().find(|s| !symbols.contains(s)) {
                return Err(VerifyError::module(format!(
                    "global @{} refers to undefined @{missing}",
                    global.name
                )));
            }
        }
    }

    for function in &module.functions {
        check_type(&function.ret).map_err(|m| VerifyError::in_function(function, m))?;
        for ty in &function.params {
            check_type(ty).map_err(|m| VerifyError::in_function(function, m))?;
        }
        if let Some(body) = &function.body {
            verify_body(module, &symbols, function, body)?;
        }
    }

    if let Some(roots) = &module.roots {
        for frame in &roots.frames {
            if module.function(&frame.function).is_none() {
                return Err(VerifyError::module(format!(
                    "root table frame refers to undefined @{}",
                    frame.function
                )));
            }
            let slots = frame.slots.len() as u32;
            if frame.safe_points.iter().flatten().any(|&s| s >= slots) {
                return Err(VerifyError::module(format!(
                    "root table frame for @{} names a slot out of range",
                    frame.function
                )));
            }
        }
        for global in &roots.globals {
            if module.global(&global.name).is_none() {
                return Err(VerifyError::module(format!(
                    "root table refers to undefined global @{}",
                    global.name
                )));
            }
        }
    }

    Ok(())
}

fn verify_body(
    module: &Module,
    symbols: &FxHashSet<&str>,
    function: &Function,
    body: &Body,
) -> Result<(), VerifyError> {
    let err = |message: String| VerifyError::in_function(function, message);

    if body.blocks.is_empty() {
        return Err(err("definition has no blocks".into()));
    }
    if body.params.len() != function.params.len() {
        return Err(err("parameter count does not match signature".into()));
    }

    let num_values = body.values.len();
    let mut defined = vec![false; num_values];
    for param in &body.params {
        defined[param.index()] = true;
    }

    let preds = compute_predecessors(body);
    let reachable = reachable_blocks(body);

    for block_id in body.block_ids() {
        let block = body.block(block_id);
        let first_non_phi = block.first_non_phi();
        for (i, inst) in block.insts.iter().enumerate() {
            let text = || inst_to_string(body, inst);
            if let Some(result) = inst.result {
                if result.index() >= num_values {
                    return Err(err(format!("result out of range in `{}`", text())));
                }
                if defined[result.index()] {
                    return Err(err(format!(
                        "value %{} defined twice",
                        body.value_name(result)
                    )));
                }
                defined[result.index()] = true;
            }
            for op in inst.kind.operands() {
                if let Operand::Local(v) = op {
                    if v.index() >= num_values {
                        return Err(err(format!("operand out of range in `{}`", text())));
                    }
                }
            }
            for symbol in inst.kind.symbol_refs() {
                if !symbols.contains(symbol) {
                    return Err(err(format!(
                        "reference to undefined symbol @{symbol} in `{}`",
                        text()
                    )));
                }
            }
            match &inst.kind {
                InstKind::Phi { incoming, .. } => {
                    if block_id == body.entry() {
                        return Err(err(format!("phi in entry block: `{}`", text())));
                    }
                    if i >= first_non_phi {
                        return Err(err(format!(
                            "phi after non-phi instruction: `{}`",
                            text()
                        )));
                    }
                    let block_preds = &preds[block_id.index()];
                    if let Some((_, from)) =
                        incoming.iter().find(|(_, from)| !block_preds.contains(from))
                    {
                        return Err(err(format!(
                            "phi names %{} which is not a predecessor of %{}",
                            body.block(*from).name,
                            block.name
                        )));
                    }
                    if let Some(missing) = block_preds
                        .iter()
                        .filter(|p| reachable[p.index()])
                        .find(|p| !incoming.iter().any(|(_, from)| from == *p))
                    {
                        return Err(err(format!(
                            "phi in %{} has no value for predecessor %{}",
                            block.name,
                            body.block(*missing).name
                        )));
                    }
                }
                InstKind::MakeIface { concrete, .. } | InstKind::TypeAssert { concrete, .. } => {
                    if module.concrete(concrete).is_none() {
                        return Err(err(format!("undeclared concrete type %{concrete}")));
                    }
                }
                InstKind::DynIface { interface, .. } | InstKind::Implements { interface, .. } => {
                    if module.interface(interface).is_none() {
                        return Err(err(format!("undeclared interface %{interface}")));
                    }
                }
                _ => {}
            }
        }
        for v in block.term.used_values() {
            if v.index() >= num_values {
                return Err(err(format!("terminator operand out of range in %{}", block.name)));
            }
        }
        let term_refs = block.term.symbol_refs();
        if let Some(symbol) = term_refs.into_iter().find(|s| !symbols.contains(s)) {
            return Err(err(format!(
                "reference to undefined symbol @{symbol} in the terminator of %{}",
                block.name
            )));
        }
    }

    for (i, is_defined) in defined.iter().enumerate() {
        if !is_defined {
            return Err(err(format!("value %{} is never defined", body.values[i].name)));
        }
    }
    for value in &body.values {
        let mut refs = Vec::new();
        value.ty.named_refs(&mut refs);
        if let Some(name) = refs.into_iter().find(|n| module.type_def(n).is_none()) {
            return Err(err(format!("value %{} has undefined type %{name}", value.name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
