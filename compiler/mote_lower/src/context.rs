//! Whole-program context threaded through a pipeline run.

use crate::config::TargetConfig;
use crate::interface::MethodTable;

/// State shared by the passes of one pipeline run.
///
/// Holds the target configuration and the frozen whole-program tables that
/// later passes read (the method table built by interface lowering is what
/// dead-code elimination keeps alive).
#[derive(Debug, Default)]
pub struct PassContext {
    pub config: TargetConfig,
    method_table: Option<MethodTable>,
    completed: Vec<&'static str>,
}

impl PassContext {
    pub fn new(config: TargetConfig) -> Self {
        PassContext {
            config,
            method_table: None,
            completed: Vec::new(),
        }
    }

    pub fn method_table(&self) -> Option<&MethodTable> {
        self.method_table.as_ref()
    }

    /// Install the frozen method table. Later passes only read it.
    pub fn set_method_table(&mut self, table: MethodTable) {
        self.method_table = Some(table);
    }

    /// Names of the passes that finished successfully, in run order.
    pub fn completed(&self) -> &[&'static str] {
        &self.completed
    }

    pub fn has_run(&self, pass: &str) -> bool {
        self.completed.contains(&pass)
    }

    pub(crate) fn mark_completed(&mut self, pass: &'static str) {
        self.completed.push(pass);
    }
}
