//! The whole-program module: one link unit.

use crate::ir::{FnAttrs, Function};
use crate::roots::RootTable;
use crate::types::{Type, TypeDef};

/// Global variable linkage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Linkage {
    #[default]
    Default,
    Internal,
    /// Exported symbol; a dead-code root.
    Export,
    /// Declared here, defined outside the link unit.
    External,
}

impl Linkage {
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            Linkage::Default => None,
            Linkage::Internal => Some("internal"),
            Linkage::Export => Some("export"),
            Linkage::External => Some("external"),
        }
    }
}

/// Constant initializer of a global.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i64),
    Null,
    Undef,
    Zero,
    /// Address of a function or global.
    Symbol(String),
    /// Struct or array elements.
    Aggregate(Vec<(Type, Constant)>),
}

impl Constant {
    /// Collect every symbol this constant refers to.
    pub fn symbol_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Constant::Symbol(name) => out.push(name),
            Constant::Aggregate(elems) => {
                for (_, elem) in elems {
                    elem.symbol_refs(out);
                }
            }
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub linkage: Linkage,
    pub constant: bool,
    /// `None` exactly when the linkage is external.
    pub init: Option<Constant>,
    pub align: Option<u32>,
}

impl Global {
    pub fn external(name: impl Into<String>, ty: Type) -> Self {
        Global {
            name: name.into(),
            ty,
            linkage: Linkage::External,
            constant: false,
            init: None,
            align: None,
        }
    }

    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.linkage == Linkage::External
    }
}

/// `concrete %T { Method = @impl, ... }`: a concrete type that may be boxed
/// into interface values, with its method implementations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConcreteDecl {
    pub name: String,
    pub methods: Vec<(String, String)>,
}

impl ConcreteDecl {
    pub fn method(&self, method: &str) -> Option<&str> {
        self.methods
            .iter()
            .find(|(name, _)| name == method)
            .map(|(_, imp)| imp.as_str())
    }
}

/// `interface %I { Method, ... }`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDecl {
    pub name: String,
    pub methods: Vec<String>,
}

/// A whole-program link unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Module {
    pub source_filename: Option<String>,
    pub target_triple: Option<String>,
    pub types: Vec<TypeDef>,
    pub concretes: Vec<ConcreteDecl>,
    pub interfaces: Vec<InterfaceDecl>,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
    /// GC root descriptors, present after GC instrumentation.
    pub roots: Option<RootTable>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Lookup ──────────────────────────────────────────────────

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    pub fn type_def(&self, name: &str) -> Option<&Type> {
        self.types.iter().find(|t| t.name == name).map(|t| &t.ty)
    }

    pub fn concrete(&self, name: &str) -> Option<&ConcreteDecl> {
        self.concretes.iter().find(|c| c.name == name)
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceDecl> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    /// Is `name` a function or global of this module?
    pub fn has_symbol(&self, name: &str) -> bool {
        self.function(name).is_some() || self.global(name).is_some()
    }

    /// Follow named-type references to a structural type.
    pub fn resolve<'a>(&'a self, ty: &'a Type) -> Option<&'a Type> {
        let mut current = ty;
        for _ in 0..64 {
            match current {
                Type::Named(name) => current = self.type_def(name)?,
                other => return Some(other),
            }
        }
        None
    }

    /// Type of field `index` of an aggregate type.
    pub fn field_type(&self, ty: &Type, index: u32) -> Option<Type> {
        match self.resolve(ty)? {
            Type::Array(len, elem) => (u64::from(index) < *len).then(|| (**elem).clone()),
            other => other.fields()?.get(index as usize).cloned(),
        }
    }

    /// Does the function carry `attr`? Unknown functions carry nothing.
    pub fn function_has(&self, name: &str, attr: FnAttrs) -> bool {
        self.function(name).is_some_and(|f| f.has(attr))
    }

    // ── Mutation helpers ────────────────────────────────────────

    /// Add an external function declaration unless the symbol exists.
    pub fn declare_function(&mut self, name: &str, ret: Type, params: Vec<Type>, attrs: FnAttrs) {
        if self.function(name).is_none() {
            let mut decl = Function::declaration(name, ret, params);
            decl.attrs = attrs;
            self.functions.push(decl);
        }
    }

    /// Add an external global declaration unless the symbol exists.
    pub fn declare_global(&mut self, name: &str, ty: Type) {
        if self.global(name).is_none() {
            self.globals.push(Global::external(name, ty));
        }
    }

    /// Register `type %name = ty` unless present; returns the named type.
    pub fn intern_type(&mut self, name: &str, ty: Type) -> Type {
        if self.type_def(name).is_none() {
            self.types.push(TypeDef {
                name: name.to_owned(),
                ty,
            });
        }
        Type::Named(name.to_owned())
    }

    /// A symbol name derived from `hint` that no function or global uses.
    pub fn unique_symbol(&self, hint: &str) -> String {
        if !self.has_symbol(hint) {
            return hint.to_owned();
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{hint}.{n}");
            if !self.has_symbol(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Total number of instructions across all definitions.
    pub fn instruction_count(&self) -> usize {
        self.functions
            .iter()
            .filter_map(|f| f.body.as_ref())
            .flat_map(|b| b.blocks.iter())
            .map(|b| b.insts.len() + 1)
            .sum()
    }
}
