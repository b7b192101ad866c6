//! Moves functions lowering already bound to a device into the per-target
//! sub-modules

use std::str::FromStr;
use tracing::debug;
use vela_ir::{annotation, IrError, Module, Result, Target, ValueId};

/// Target a function is annotated for, host when unannotated
pub fn function_target(module: &Module, function: ValueId) -> Result<Target> {
    match module.annotations(function).first(annotation::TARGET) {
        Some(name) => Target::from_str(name).map_err(IrError::UnsupportedConstruct),
        None => Ok(Target::Host),
    }
}

/// Moves every host function annotated with a device target; returns how
/// many moved
pub fn separate_targets(module: &mut Module) -> Result<usize> {
    let mut moved = 0;
    for function in module.functions.clone() {
        let target = function_target(module, function)?;
        if target == Target::Host {
            continue;
        }
        debug!(function = module.name(function), %target, "moving to target module");
        module.move_to_target(function, target)?;
        moved += 1;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotated_function_moves() {
        let mut module = Module::new("test");
        let void = module.types.void();
        let host = module.create_function("main", &[], void);
        let device = module.create_function("saxpy", &[], void);
        module.annotations_mut(device).insert(annotation::TARGET, "amdgpu");

        assert_eq!(separate_targets(&mut module).unwrap(), 1);
        assert_eq!(module.functions, vec![host]);
        assert_eq!(module.target_functions(Target::Amdgpu), &[device]);
        // already separated
        assert_eq!(separate_targets(&mut module).unwrap(), 0);
    }

    #[test]
    fn test_unknown_target_is_unsupported() {
        let mut module = Module::new("test");
        let void = module.types.void();
        let f = module.create_function("f", &[], void);
        module.annotations_mut(f).insert(annotation::TARGET, "tpu");
        assert!(matches!(
            separate_targets(&mut module),
            Err(IrError::UnsupportedConstruct(_))
        ));
    }
}
