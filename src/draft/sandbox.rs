//! Speculative analysis.
//!
//! Before an irreversible analysis decision in the presence of concurrent
//! voting traffic, callers clone the analyzer, run the analysis on the
//! clone, inspect the outcome, and either commit the clone back over the
//! base or drop it.

use super::analyzer::MimicRaftAnalyzer;

pub struct AnalyzerSandbox<'a> {
    base: &'a mut MimicRaftAnalyzer,
    sandbox: MimicRaftAnalyzer,
}

impl<'a> AnalyzerSandbox<'a> {
    pub fn new(base: &'a mut MimicRaftAnalyzer) -> Self {
        let sandbox = base.snapshot();
        AnalyzerSandbox { base, sandbox }
    }

    pub fn sandbox(&self) -> &MimicRaftAnalyzer {
        &self.sandbox
    }

    pub fn sandbox_mut(&mut self) -> &mut MimicRaftAnalyzer {
        &mut self.sandbox
    }

    /// Replaces the base with the sandbox. Dropping the value instead
    /// discards everything done inside the sandbox.
    pub fn commit(self) {
        *self.base = self.sandbox;
    }
}
