//! Linking per-package modules into one whole-program module.
//!
//! Packages are merged in input order, which fixes declaration order (and so
//! interface type ids) for the linked module. A definition replaces an
//! external declaration of the same symbol in place; two definitions of one
//! symbol are an error.

use crate::ir::{FnAttrs, Function};
use crate::module::{Global, Module};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("symbol @{0} is defined in more than one package")]
    DuplicateSymbol(String),
    #[error("type %{0} has conflicting definitions")]
    ConflictingType(String),
    #[error("concrete type %{0} has conflicting method sets")]
    ConflictingConcrete(String),
    #[error("interface %{0} has conflicting method lists")]
    ConflictingInterface(String),
    #[error("symbol @{0} is used as both a function and a global")]
    KindMismatch(String),
    #[error("packages target different triples: {0} and {1}")]
    TripleMismatch(String, String),
    #[error("package {0} already carries a root table")]
    AlreadyInstrumented(usize),
}

/// Link `modules` in order.
pub fn link_modules(modules: Vec<Module>) -> Result<Module, LinkError> {
    let mut linked = Module::new();
    for (index, module) in modules.into_iter().enumerate() {
        if module.roots.is_some() {
            return Err(LinkError::AlreadyInstrumented(index));
        }
        if linked.source_filename.is_none() {
            linked.source_filename = module.source_filename;
        }
        match (&linked.target_triple, module.target_triple) {
            (Some(a), Some(b)) if *a != b => return Err(LinkError::TripleMismatch(a.clone(), b)),
            (None, Some(b)) => linked.target_triple = Some(b),
            _ => {}
        }

        for def in module.types {
            match linked.type_def(&def.name) {
                Some(existing) if *existing != def.ty => {
                    return Err(LinkError::ConflictingType(def.name))
                }
                Some(_) => {}
                None => linked.types.push(def),
            }
        }
        for concrete in module.concretes {
            match linked.concrete(&concrete.name) {
                Some(existing) if *existing != concrete => {
                    return Err(LinkError::ConflictingConcrete(concrete.name))
                }
                Some(_) => {}
                None => linked.concretes.push(concrete),
            }
        }
        for iface in module.interfaces {
            match linked.interface(&iface.name) {
                Some(existing) if *existing != iface => {
                    return Err(LinkError::ConflictingInterface(iface.name))
                }
                Some(_) => {}
                None => linked.interfaces.push(iface),
            }
        }
        for global in module.globals {
            link_global(&mut linked, global)?;
        }
        for function in module.functions {
            link_function(&mut linked, function)?;
        }
    }
    tracing::debug!(
        functions = linked.functions.len(),
        globals = linked.globals.len(),
        "linked packages"
    );
    Ok(linked)
}

fn link_global(linked: &mut Module, global: Global) -> Result<(), LinkError> {
    if linked.function(&global.name).is_some() {
        return Err(LinkError::KindMismatch(global.name));
    }
    let position = linked.globals.iter().position(|g| g.name == global.name);
    match position {
        None => linked.globals.push(global),
        Some(index) => {
            let existing = &mut linked.globals[index];
            match (existing.is_declaration(), global.is_declaration()) {
                (_, true) => {}
                (true, false) => *existing = global,
                (false, false) => return Err(LinkError::DuplicateSymbol(global.name)),
            }
        }
    }
    Ok(())
}

fn link_function(linked: &mut Module, function: Function) -> Result<(), LinkError> {
    if linked.global(&function.name).is_some() {
        return Err(LinkError::KindMismatch(function.name));
    }
    let position = linked.function_index(&function.name);
    match position {
        None => linked.functions.push(function),
        Some(index) => {
            let existing = &mut linked.functions[index];
            match (existing.is_declaration(), function.is_declaration()) {
                // Attributes on declarations (e.g. `nogc`) accumulate.
                (true, true) => existing.attrs |= function.attrs,
                (false, true) => existing.attrs |= function.attrs & FnAttrs::NOGC,
                (true, false) => {
                    let attrs = existing.attrs & FnAttrs::NOGC;
                    *existing = function;
                    existing.attrs |= attrs;
                }
                (false, false) => return Err(LinkError::DuplicateSymbol(function.name)),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parse::parse_module;

    fn parse(src: &str) -> Module {
        parse_module(src).unwrap_or_else(|e| panic!("parse failed: {e}"))
    }

    #[test]
    fn definition_replaces_declaration() {
        let a = parse(
            "declare i32 @helper(i32)\n\
             define entry void @main() {\nentry:\n  %r = call i32 @helper(i32 1)\n  ret void\n}\n",
        );
        let b = parse("define i32 @helper(i32 %x) {\nentry:\n  ret i32 %x\n}\n");
        let linked = link_modules(vec![a, b]).unwrap();
        let names: Vec<&str> = linked.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["helper", "main"]);
        assert!(linked.function("helper").is_some_and(|f| !f.is_declaration()));
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let a = parse("define void @f() {\nentry:\n  ret void\n}\n");
        let b = a.clone();
        assert_eq!(
            link_modules(vec![a, b]),
            Err(LinkError::DuplicateSymbol("f".into()))
        );
    }

    #[test]
    fn concrete_declarations_keep_package_order() {
        let a = parse("concrete %A {}\ninterface %I { M }\n");
        let b = parse("concrete %B {}\nconcrete %A {}\ninterface %I { M }\n");
        let linked = link_modules(vec![a, b]).unwrap();
        let names: Vec<&str> = linked.concretes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(linked.interfaces.len(), 1);
    }

    #[test]
    fn conflicting_types_are_rejected() {
        let a = parse("type %T = { i32 }\n");
        let b = parse("type %T = { ptr }\n");
        assert_eq!(
            link_modules(vec![a, b]),
            Err(LinkError::ConflictingType("T".into()))
        );
    }

    #[test]
    fn external_global_is_resolved() {
        let a = parse("@g = external global ptr\n");
        let b = parse("@g = global ptr null\n");
        let linked = link_modules(vec![a, b]).unwrap();
        assert!(linked.global("g").is_some_and(|g| !g.is_declaration()));
    }
}
