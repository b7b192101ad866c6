//! Compilation session over a sequence of translation units
//!
//! A unit whose lowering reports errors is counted and dropped; the next
//! unit still compiles. An `IrError` from the pipeline is a compiler bug
//! and aborts the whole session.

use crate::pipeline::{Pipeline, PipelineConfig, PipelineReport};
use thiserror::Error;
use tracing::{error, info, warn};
use vela_error::{Diagnostic, Diagnostics};
use vela_ir::{IrError, Module};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("compilation aborted: {0}")]
    Fatal(#[from] IrError),

    #[error("the session was aborted by an earlier fatal error")]
    Aborted,
}

pub struct Session {
    pipeline: Pipeline,
    modules: Vec<Module>,
    reports: Vec<PipelineReport>,
    diagnostics: Diagnostics,
    error_count: usize,
    aborted: bool,
}

impl Session {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            pipeline: Pipeline::new(config),
            modules: Vec::new(),
            reports: Vec::new(),
            diagnostics: Diagnostics::new(),
            error_count: 0,
            aborted: false,
        }
    }

    /// Lowers one unit with `lower` and runs the pipeline on it.
    ///
    /// Returns the committed module, or `None` when lowering failed.
    pub fn compile_unit<F>(&mut self, lower: F) -> Result<Option<&Module>, SessionError>
    where
        F: FnOnce() -> Result<Module, Diagnostics>,
    {
        if self.aborted {
            return Err(SessionError::Aborted);
        }

        let mut module = match lower() {
            Ok(module) => module,
            Err(diagnostics) => {
                self.error_count += 1;
                warn!(
                    errors = diagnostics.error_count(),
                    "lowering failed, unit discarded"
                );
                self.diagnostics.extend(diagnostics);
                return Ok(None);
            }
        };

        match self.pipeline.run(&mut module) {
            Ok(report) => {
                info!(module = %module.name, "unit committed");
                self.reports.push(report);
                self.modules.push(module);
                Ok(self.modules.last())
            }
            Err(err) => {
                error!(module = %module.name, %err, "fatal pipeline error");
                self.aborted = true;
                self.diagnostics.push(Diagnostic::from(err.clone()));
                Err(SessionError::Fatal(err))
            }
        }
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn reports(&self) -> &[PipelineReport] {
        &self.reports
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Units discarded because lowering reported errors
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn into_modules(self) -> Vec<Module> {
        self.modules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_ir::IrBuilder;

    fn empty_main() -> Result<Module, Diagnostics> {
        let mut module = Module::new("unit");
        let void = module.types.void();
        let f = module.create_function("main", &[], void);
        let entry = module.append_function_block(f).unwrap();
        IrBuilder::at_end(&mut module, entry).ret_void().unwrap();
        Ok(module)
    }

    #[test]
    fn test_lowering_error_discards_only_that_unit() {
        let mut session = Session::new(PipelineConfig::default());
        session.compile_unit(empty_main).unwrap();
        let failed = session
            .compile_unit(|| {
                let mut diagnostics = Diagnostics::new();
                diagnostics.error("unknown symbol `x`");
                Err(diagnostics)
            })
            .unwrap();
        assert!(failed.is_none());
        session.compile_unit(empty_main).unwrap();

        assert_eq!(session.error_count(), 1);
        assert_eq!(session.modules().len(), 2);
        assert!(session.diagnostics().has_errors());
        assert!(!session.is_aborted());
    }

    #[test]
    fn test_fatal_error_aborts_session() {
        let mut session = Session::new(PipelineConfig::default());
        let result = session.compile_unit(|| {
            let mut module = Module::new("broken");
            let i64_ty = module.types.i64();
            let f = module.create_function("f", &[], i64_ty);
            let entry = module.append_function_block(f).unwrap();
            // falls off the end of a function returning a value
            IrBuilder::at_end(&mut module, entry).const_int(1).unwrap();
            Ok(module)
        });
        assert!(matches!(result, Err(SessionError::Fatal(_))));
        assert!(session.is_aborted());
        assert!(matches!(
            session.compile_unit(empty_main),
            Err(SessionError::Aborted)
        ));
        assert!(session.modules().is_empty());
    }
}
