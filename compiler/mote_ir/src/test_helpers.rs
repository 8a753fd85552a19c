//! Shared test utilities for the IR crate.
//!
//! Only compiled in test builds.

use crate::ir::{BlockId, Body, ValueId};
use crate::module::Module;
use crate::parse::parse_module;

/// Parse `source`, panicking with the error position on failure.
pub(crate) fn parse(source: &str) -> Module {
    parse_module(source).unwrap_or_else(|e| panic!("parse failed at {e}\n{source}"))
}

/// Body of the function `name`.
pub(crate) fn body<'m>(module: &'m Module, name: &str) -> &'m Body {
    module
        .function(name)
        .and_then(|f| f.body.as_ref())
        .unwrap_or_else(|| panic!("no definition @{name}"))
}

/// Block id by label.
pub(crate) fn block(body: &Body, name: &str) -> BlockId {
    body.block_by_name(name)
        .unwrap_or_else(|| panic!("no block %{name}"))
}

/// Value id by name.
pub(crate) fn value(body: &Body, name: &str) -> ValueId {
    body.value_by_name(name)
        .unwrap_or_else(|| panic!("no value %{name}"))
}

/// Sorted value names of a set, for readable assertions.
pub(crate) fn names<'b>(body: &'b Body, set: impl IntoIterator<Item = &'b ValueId>) -> Vec<&'b str> {
    let mut out: Vec<&str> = set.into_iter().map(|v| body.value_name(*v)).collect();
    out.sort_unstable();
    out
}
