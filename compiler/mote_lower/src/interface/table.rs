//! The whole-program interface method table.
//!
//! Built in two phases. Workers scan functions in parallel and produce
//! [`FunctionFacts`]; a single [`MethodTableBuilder`] absorbs them in function
//! order and [`freeze`](MethodTableBuilder::freeze)s into an immutable
//! [`MethodTable`]. Nothing reads the table before it is frozen.

use std::collections::{BTreeMap, BTreeSet};

use mote_ir::{DebugLoc, Module, Type};

use crate::error::{LowerError, LowerResult};

/// How the call sites of one method are dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    /// One implementation: call it directly.
    Direct,
    /// A few implementations: compare the typecode against each in turn.
    Chain,
    /// Many implementations: index a table of code pointers by typecode.
    Table,
}

/// Implementations and call signature of one dynamically invoked method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodEntry {
    /// `(type id, implementation)` of every boxed type providing the
    /// method, in type-id order.
    pub impls: Vec<(u32, String)>,
    pub ret: Type,
    /// Argument types after the receiver.
    pub params: Vec<Type>,
}

/// One `ifacecall` as seen by the analysis.
#[derive(Clone, Debug)]
pub(crate) struct CallSite {
    pub function: String,
    pub method: String,
    pub ret: Type,
    pub args: Vec<Type>,
    pub instruction: String,
    pub loc: Option<DebugLoc>,
}

impl CallSite {
    fn error(&self, err: LowerError) -> LowerError {
        err.in_function(&self.function)
            .with_instruction(self.instruction.clone())
            .with_loc(self.loc.clone())
    }
}

/// What one function contributes to the table.
#[derive(Clone, Debug, Default)]
pub(crate) struct FunctionFacts {
    /// Concrete types boxed by `makeiface`.
    pub boxed: Vec<String>,
    /// Interfaces built from run-time typecodes by `dyniface`.
    pub dynamic: Vec<String>,
    pub calls: Vec<CallSite>,
}

/// Accumulates per-function facts before the table is frozen.
#[derive(Debug)]
pub struct MethodTableBuilder {
    type_names: Vec<String>,
    /// Method implementations per concrete type, from the declarations.
    provided: BTreeMap<String, Vec<(String, String)>>,
    interfaces: BTreeMap<String, Vec<String>>,
    boxed: BTreeSet<String>,
    dynamic: BTreeSet<String>,
    calls: Vec<CallSite>,
}

impl MethodTableBuilder {
    /// Assign type ids and check every declared implementation exists.
    ///
    /// Type ids follow declaration order of the `concrete` items, starting
    /// at 1; 0 is the typecode of a nil interface value.
    pub fn new(module: &Module) -> LowerResult<Self> {
        let mut provided = BTreeMap::new();
        for concrete in &module.concretes {
            for (method, imp) in &concrete.methods {
                if module.function(imp).is_none() {
                    return Err(LowerError::malformed(format!(
                        "concrete type %{} names missing implementation @{imp} for method `{method}`",
                        concrete.name
                    )));
                }
            }
            provided.insert(concrete.name.clone(), concrete.methods.clone());
        }
        Ok(MethodTableBuilder {
            type_names: module.concretes.iter().map(|c| c.name.clone()).collect(),
            provided,
            interfaces: module
                .interfaces
                .iter()
                .map(|i| (i.name.clone(), i.methods.clone()))
                .collect(),
            boxed: BTreeSet::new(),
            dynamic: BTreeSet::new(),
            calls: Vec::new(),
        })
    }

    pub(crate) fn record(&mut self, facts: FunctionFacts) {
        self.boxed.extend(facts.boxed);
        self.dynamic.extend(facts.dynamic);
        self.calls.extend(facts.calls);
    }

    fn type_id(&self, concrete: &str) -> Option<u32> {
        self.type_names
            .iter()
            .position(|n| n == concrete)
            .map(|i| i as u32 + 1)
    }

    fn implementation(&self, concrete: &str, method: &str) -> Option<&str> {
        self.provided
            .get(concrete)?
            .iter()
            .find(|(name, _)| name == method)
            .map(|(_, imp)| imp.as_str())
    }

    /// Resolve every call site and produce the immutable table.
    pub fn freeze(self, module: &Module, chain_limit: usize) -> LowerResult<MethodTable> {
        let mut methods: BTreeMap<String, MethodEntry> = BTreeMap::new();
        for site in &self.calls {
            let owners: Vec<&str> = self
                .interfaces
                .iter()
                .filter(|(_, ms)| ms.contains(&site.method))
                .map(|(name, _)| name.as_str())
                .collect();
            if owners.is_empty() {
                return Err(site.error(LowerError::malformed(format!(
                    "method `{}` is not declared by any interface",
                    site.method
                ))));
            }
            if let Some(dynamic) = owners.iter().find(|i| self.dynamic.contains(**i)) {
                return Err(site.error(LowerError::unsupported(format!(
                    "cannot enumerate the implementations of `{}`: values of interface %{dynamic} \
                     are built from run-time typecodes",
                    site.method
                ))));
            }

            if let Some(entry) = methods.get(&site.method) {
                if entry.ret != site.ret || entry.params != site.args {
                    return Err(site.error(LowerError::malformed(format!(
                        "inconsistent call signatures for method `{}`",
                        site.method
                    ))));
                }
                continue;
            }

            let impls = self.collect_impls(&site.method);
            for (id, imp) in &impls {
                check_signature(module, imp, &site.ret, &site.args).map_err(|message| {
                    let concrete = &self.type_names[*id as usize - 1];
                    site.error(LowerError::malformed(format!(
                        "implementation @{imp} of `{}` on %{concrete} {message}",
                        site.method
                    )))
                })?;
            }
            methods.insert(
                site.method.clone(),
                MethodEntry {
                    impls,
                    ret: site.ret.clone(),
                    params: site.args.clone(),
                },
            );
        }

        let implementers = self
            .interfaces
            .iter()
            .map(|(name, required)| (name.clone(), self.collect_implementers(required)))
            .collect();

        tracing::debug!(
            methods = methods.len(),
            boxed = self.boxed.len(),
            dynamic = !self.dynamic.is_empty(),
            "method table frozen"
        );
        Ok(MethodTable {
            type_names: self.type_names,
            boxed: self.boxed,
            dynamic: self.dynamic,
            methods,
            implementers,
            chain_limit,
        })
    }

    fn collect_impls(&self, method: &str) -> Vec<(u32, String)> {
        let mut impls: Vec<(u32, String)> = self
            .boxed
            .iter()
            .filter_map(|concrete| {
                let imp = self.implementation(concrete, method)?;
                Some((self.type_id(concrete)?, imp.to_owned()))
            })
            .collect();
        impls.sort_unstable();
        impls
    }

    /// Ids of the types a value of some interface may dynamically hold that
    /// provide every method in `required`.
    fn collect_implementers(&self, required: &[String]) -> Vec<u32> {
        let candidates: Vec<&String> = if self.dynamic.is_empty() {
            self.boxed.iter().collect()
        } else {
            self.type_names.iter().collect()
        };
        let mut ids: Vec<u32> = candidates
            .into_iter()
            .filter(|concrete| {
                required
                    .iter()
                    .all(|m| self.implementation(concrete, m).is_some())
            })
            .filter_map(|concrete| self.type_id(concrete))
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// The implementation takes the receiver followed by the call arguments.
fn check_signature(module: &Module, imp: &str, ret: &Type, args: &[Type]) -> Result<(), String> {
    let Some(function) = module.function(imp) else {
        return Err("does not exist".into());
    };
    if function.params.len() != args.len() + 1 {
        return Err(format!(
            "takes {} parameters but call sites pass a receiver and {} arguments",
            function.params.len(),
            args.len()
        ));
    }
    if function.ret != *ret || function.params[1..] != *args {
        return Err("does not match the call signature".into());
    }
    Ok(())
}

/// Frozen whole-program interface facts.
#[derive(Clone, Debug, Default)]
pub struct MethodTable {
    type_names: Vec<String>,
    boxed: BTreeSet<String>,
    dynamic: BTreeSet<String>,
    methods: BTreeMap<String, MethodEntry>,
    implementers: BTreeMap<String, Vec<u32>>,
    chain_limit: usize,
}

impl MethodTable {
    pub fn type_id(&self, concrete: &str) -> Option<u32> {
        self.type_names
            .iter()
            .position(|n| n == concrete)
            .map(|i| i as u32 + 1)
    }

    /// Name of the concrete type with the given id.
    pub fn type_name(&self, id: u32) -> Option<&str> {
        let index = id.checked_sub(1)? as usize;
        self.type_names.get(index).map(String::as_str)
    }

    /// Number of declared concrete types; the largest type id.
    pub fn type_count(&self) -> u32 {
        self.type_names.len() as u32
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    /// Dynamically invoked methods, sorted by name.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodEntry)> {
        self.methods.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Dispatch strategy for `method`, or `None` when nothing implements it.
    pub fn dispatch(&self, method: &str) -> Option<DispatchKind> {
        let count = self.methods.get(method)?.impls.len();
        match count {
            0 => None,
            1 => Some(DispatchKind::Direct),
            n if n <= self.chain_limit => Some(DispatchKind::Chain),
            _ => Some(DispatchKind::Table),
        }
    }

    pub fn is_boxed(&self, concrete: &str) -> bool {
        self.boxed.contains(concrete)
    }

    /// Is any interface value built from a run-time typecode?
    pub fn has_dynamic(&self) -> bool {
        !self.dynamic.is_empty()
    }

    /// Can an interface value ever hold `concrete`?
    pub fn may_hold(&self, concrete: &str) -> bool {
        self.is_boxed(concrete) || (self.has_dynamic() && self.type_id(concrete).is_some())
    }

    /// Type ids that implement `interface`, in ascending order.
    pub fn implementers(&self, interface: &str) -> &[u32] {
        self.implementers.get(interface).map_or(&[], Vec::as_slice)
    }

    /// Every implementation some call site may dispatch to.
    pub fn live_implementations(&self) -> impl Iterator<Item = &str> {
        self.methods
            .values()
            .flat_map(|entry| entry.impls.iter().map(|(_, imp)| imp.as_str()))
    }
}
