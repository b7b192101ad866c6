//! End-to-end tests for the Vela canonicalization pipeline
//!
//! The units under test are the sample builders of
//! [`vela_transform::samples`], which the `vela` CLI runs as well.

use vela_error::Diagnostics;
use vela_ir::{verify, IrError, Module, ValueId, ValueKind, VerifyLevel};
use vela_transform::{Pipeline, PipelineConfig, PipelineReport};

pub use vela_transform::samples::*;

/// Result of running the pipeline over one unit
#[derive(Debug)]
pub struct CompileResult {
    /// Whether every stage ran without a fatal error
    pub success: bool,
    /// The fatal error, if any
    pub error: Option<IrError>,
    /// Diagnostics produced for the unit
    pub diagnostics: Diagnostics,
    /// The transformed module
    pub module: Module,
    pub report: Option<PipelineReport>,
}

/// Runs the default pipeline over `module`
pub fn compile(module: Module) -> CompileResult {
    compile_with(module, PipelineConfig::default())
}

pub fn compile_with(mut module: Module, config: PipelineConfig) -> CompileResult {
    let pipeline = Pipeline::new(config);
    match pipeline.run(&mut module) {
        Ok(report) => CompileResult {
            success: true,
            error: None,
            diagnostics: Diagnostics::new(),
            module,
            report: Some(report),
        },
        Err(err) => CompileResult {
            success: false,
            diagnostics: Diagnostics::from(vela_error::Diagnostic::from(err.clone())),
            error: Some(err),
            module,
            report: None,
        },
    }
}

/// Asserts that the pipeline accepts the unit and returns the result
pub fn assert_compiles(module: Module) -> (Module, PipelineReport) {
    let result = compile(module);
    match (result.success, result.report) {
        (true, Some(report)) => (result.module, report),
        _ => panic!(
            "Expected the unit to compile, but got:\n{}",
            result.diagnostics.render(false)
        ),
    }
}

/// Asserts that the pipeline rejects the unit and returns the error
pub fn assert_compile_fails(module: Module) -> IrError {
    let result = compile(module);
    match result.error {
        Some(err) => err,
        None => panic!(
            "Expected the unit to be rejected, but it compiled:\n{}",
            result.module
        ),
    }
}

/// Asserts that the compiled IR dump contains `expected`
pub fn assert_ir_contains(module: &Module, expected: &str) {
    let dump = module.to_string();
    if !dump.contains(expected) {
        panic!(
            "Expected IR to contain '{}', but it didn't.\n\nIR:\n{}",
            expected, dump
        );
    }
}

/// Asserts the module is in branch-normal form
pub fn assert_branch_normal(module: &Module) {
    if let Err(err) = verify::module(module, VerifyLevel::Flat) {
        panic!("Expected branch-normal form: {}\n\nIR:\n{}", err, module);
    }
}

/// Number of values of `function` whose mnemonic is `mnemonic`
pub fn count_kind(module: &Module, function: ValueId, mnemonic: &str) -> usize {
    module
        .function_blocks(function)
        .iter()
        .flat_map(|block| module.block_values(*block))
        .filter(|value| module.kind(**value).mnemonic() == mnemonic)
        .count()
}

/// Calls to `callee` inside `block`
pub fn calls_to(module: &Module, block: ValueId, callee: ValueId) -> usize {
    module
        .block_values(block)
        .iter()
        .filter(|value| matches!(module.kind(**value), ValueKind::Call))
        .filter(|value| module.operand(**value, 0).ok() == Some(callee))
        .count()
}

/// Basic blocks a terminator can branch to
pub fn successors(module: &Module, block: ValueId) -> Vec<ValueId> {
    match module.block_values(block).last() {
        Some(last) => module
            .operands(*last)
            .filter(|target| module.kind(*target).is_block())
            .collect(),
        None => Vec::new(),
    }
}

/// Calls to each of `callees` along every path from the entry block, one
/// row per path. A path ends at a block without successors or where it
/// re-enters a block it already passed through.
pub fn hook_calls_per_path(
    module: &Module,
    function: ValueId,
    callees: &[ValueId],
) -> Vec<Vec<usize>> {
    fn walk(
        module: &Module,
        block: ValueId,
        callees: &[ValueId],
        seen: &mut Vec<ValueId>,
        counts: &[usize],
        out: &mut Vec<Vec<usize>>,
    ) {
        let counts: Vec<usize> = counts
            .iter()
            .zip(callees)
            .map(|(count, callee)| count + calls_to(module, block, *callee))
            .collect();
        let next = successors(module, block);
        if next.is_empty() {
            out.push(counts);
            return;
        }
        seen.push(block);
        for successor in next {
            if seen.contains(&successor) {
                out.push(counts.clone());
            } else {
                walk(module, successor, callees, seen, &counts, out);
            }
        }
        seen.pop();
    }

    let mut out = Vec::new();
    if let Some(&entry) = module.function_blocks(function).first() {
        let zero = vec![0; callees.len()];
        walk(module, entry, callees, &mut Vec::new(), &zero, &mut out);
    }
    out
}

/// Calls to `callee` along every path from the entry block, one count per
/// path
pub fn calls_per_path(module: &Module, function: ValueId, callee: ValueId) -> Vec<usize> {
    hook_calls_per_path(module, function, &[callee])
        .into_iter()
        .map(|row| row[0])
        .collect()
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use vela_transform::{flatten_module, partition_module};

    fn all_samples() -> Vec<Module> {
        samples()
            .into_iter()
            .map(|sample| (sample.build)().unwrap())
            .collect()
    }

    #[test]
    fn test_def_use_holds_after_pipeline() {
        for module in all_samples() {
            let (module, _) = assert_compiles(module);
            verify::def_use(&module).unwrap();
            verify::parents(&module).unwrap();
        }
    }

    #[test]
    fn test_every_block_has_one_terminator() {
        for module in all_samples() {
            let (module, _) = assert_compiles(module);
            assert_branch_normal(&module);
        }
    }

    #[test]
    fn test_flattening_twice_changes_nothing() {
        let mut module = while_sample().unwrap();
        flatten_module(&mut module).unwrap();
        partition_module(&mut module).unwrap();
        let once = module.to_string();
        let values = module.len();

        flatten_module(&mut module).unwrap();
        partition_module(&mut module).unwrap();
        pretty_assertions::assert_eq!(module.to_string(), once);
        assert_eq!(module.len(), values);
    }

    #[test]
    fn test_lifetime_insertion_twice_changes_nothing() {
        let (mut module, _) = early_return_sample().unwrap();
        vela_transform::insert_lifetime_calls(&mut module).unwrap();
        let once = module.to_string();
        vela_transform::insert_lifetime_calls(&mut module).unwrap();
        pretty_assertions::assert_eq!(module.to_string(), once);
    }

    #[test]
    fn test_one_destroy_on_every_path() {
        let (module, managed) = early_return_sample().unwrap();
        let (module, _) = assert_compiles(module);
        let main = module.find_function("maybe").unwrap();
        let destroy = managed.hooks.destroy.unwrap();
        let paths = calls_per_path(&module, main, destroy);
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|count| *count == 1), "{:?}", paths);
    }

    /// Every path through `function` initializes and destroys the managed
    /// type equally often; returns the rows that entered the loop body
    fn assert_balanced(module: Module, managed: &ManagedType, function: &str) -> Vec<Vec<usize>> {
        let (module, _) = assert_compiles(module);
        assert_branch_normal(&module);
        let function = module.find_function(function).unwrap();
        let hooks = [managed.hooks.initialize.unwrap(), managed.hooks.destroy.unwrap()];
        let rows = hook_calls_per_path(&module, function, &hooks);
        for row in &rows {
            assert_eq!(row[0], row[1], "unbalanced path in {:?}\n\n{}", rows, module);
        }
        rows.into_iter().filter(|row| row[0] == 1).collect()
    }

    #[test]
    fn test_break_destroys_loop_local_on_every_path() {
        let (module, managed) = while_break_sample().unwrap();
        let entered = assert_balanced(module, &managed, "drain");
        // back edge and break
        assert!(entered.len() >= 2, "{:?}", entered);
    }

    #[test]
    fn test_continue_destroys_loop_local_on_every_path() {
        let (module, managed) = for_continue_sample().unwrap();
        let entered = assert_balanced(module, &managed, "skip");
        // continue and fallthrough
        assert!(entered.len() >= 2, "{:?}", entered);
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;
    use vela_ir::IrBuilder;
    use vela_transform::{Session, SessionError};

    /// Makes the `View` handle of `compute` a plain host struct again
    fn hide_view(module: &mut Module) {
        let compute = module.find_function("compute").unwrap();
        let view = module.ty(module.params(compute)[0]);
        module.types.set_device_visible(view, false);
    }

    #[test]
    fn test_pointer_capture_rejected() {
        let mut module = parallel_for_sample().unwrap();
        hide_view(&mut module);
        let err = assert_compile_fails(module);
        assert!(matches!(err, IrError::RejectedCapture { .. }), "{}", err);
    }

    #[test]
    fn test_write_to_capture_rejected() {
        let mut module = parallel_for_sample().unwrap();
        let host = module.find_function("compute").unwrap();
        let entry = module.entry_block(host).unwrap();
        let k = module
            .block_values(entry)
            .iter()
            .copied()
            .find(|v| module.name(*v) == "k")
            .unwrap();
        let body = module
            .block_values(entry)
            .iter()
            .copied()
            .find(|v| matches!(module.kind(*v), ValueKind::For))
            .map(|inst| module.operand(inst, vela_ir::slot::FOR_BODY).unwrap())
            .unwrap();
        let mut builder = IrBuilder::at_end(&mut module, body);
        let zero = builder.const_float(0.0).unwrap();
        builder.write(zero, k).unwrap();

        let err = assert_compile_fails(module);
        assert!(matches!(err, IrError::RejectedCapture { .. }), "{}", err);
        assert_eq!(err.code().to_string(), "EI003");
    }

    #[test]
    fn test_value_function_falling_off_end_is_fatal() {
        let mut module = Module::new("broken");
        let i64_ty = module.types.i64();
        let f = module.create_function("f", &[], i64_ty);
        let entry = module.append_function_block(f).unwrap();
        IrBuilder::at_end(&mut module, entry).const_int(3).unwrap();
        let err = assert_compile_fails(module);
        assert!(matches!(err, IrError::StructuralViolation(_)));
    }

    #[test]
    fn test_session_counts_lowering_errors() {
        let scope = find_sample("scope").unwrap();
        let branch = find_sample("if").unwrap();
        let mut session = Session::new(PipelineConfig::default());
        session.compile_unit(|| scope.lower()).unwrap();
        session
            .compile_unit(|| {
                let mut diagnostics = Diagnostics::new();
                diagnostics.error("type mismatch");
                Err(diagnostics)
            })
            .unwrap();
        session.compile_unit(|| branch.lower()).unwrap();
        assert_eq!(session.error_count(), 1);
        assert_eq!(session.modules().len(), 2);

        let fatal = session.compile_unit(|| {
            let mut module = parallel_for_sample()
                .map_err(|err| Diagnostics::from(vela_error::Diagnostic::from(err)))?;
            hide_view(&mut module);
            Ok(module)
        });
        assert!(matches!(fatal, Err(SessionError::Fatal(_))));
        assert!(session.is_aborted());
        assert_eq!(session.modules().len(), 2);
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;
    use vela_transform::{ConfigError, Stage};

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "kernel_target": "amdgpu", "stop_after": "partition", "verify_input": false }}"#
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.kernel_target, vela_ir::Target::Amdgpu);
        assert_eq!(config.stop_after, Some(Stage::Partition));
        assert!(!config.verify_input);
        assert!(config.verify_output);

        let result = compile_with(parallel_for_sample().unwrap(), config);
        assert!(result.success);
        let module = result.module;
        assert_eq!(module.target_functions(vela_ir::Target::Amdgpu).len(), 1);
        // stopped before materialization
        let host = module.find_function("compute").unwrap();
        assert!(count_kind(&module, host, "local") > 0);
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
