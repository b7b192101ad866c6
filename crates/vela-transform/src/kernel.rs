//! Device Kernel Extraction
//!
//! Lifts every `for` annotated `parallel` into a standalone kernel function
//! in a device sub-module and replaces the loop with a launch.
//!
//! ```text
//!   for i in first to last @parallel { body }
//!         ↓
//!   launch @f_kernel_0, grid = last - first, block = 1, captures...
//!
//!   define void @f_kernel_0(captures...) {
//!     i = first + block.idx.x * block.dim.x + thread.idx.x
//!     body
//!   }
//! ```
//!
//! Outer values read by the body are captured by value. Pointer-carrying
//! captures, writes to captures and taking their address are rejected.

use crate::walk;
use std::collections::HashSet;
use tracing::{debug, info};
use vela_ir::{
    annotation, slot, BinaryOp, DeviceIndex, IrBuilder, IrError, Module, Result, Target, ValueId,
    ValueKind,
};

/// Extracts the parallel loops of every host function
pub fn extract_kernels(module: &mut Module, target: Target) -> Result<Vec<ValueId>> {
    let mut kernels = Vec::new();
    for function in module.functions.clone() {
        if module.function_blocks(function).is_empty() {
            continue;
        }
        kernels.extend(extract_function_kernels(module, function, target)?);
    }
    Ok(kernels)
}

pub fn extract_function_kernels(
    module: &mut Module,
    function: ValueId,
    target: Target,
) -> Result<Vec<ValueId>> {
    let loops = walk::filter_function(module, function, |kind| matches!(kind, ValueKind::For));
    let mut kernels = Vec::new();
    for inst in loops {
        if !module.has_annotation(inst, annotation::PARALLEL) {
            continue;
        }
        let name = format!("{}_kernel_{}", module.name(function), kernels.len());
        let kernel = extract_loop(module, inst, &name, target)?;
        kernels.push(kernel);
    }
    Ok(kernels)
}

/// What the loop body reads from outside
struct Captures {
    /// Captured by value, in order of first use
    values: Vec<ValueId>,
    /// Constants cloned into the kernel
    constants: Vec<ValueId>,
}

fn collect_captures(
    module: &Module,
    body: &[ValueId],
    inside: &HashSet<ValueId>,
    index: ValueId,
) -> Captures {
    let mut captures = Captures {
        values: Vec::new(),
        constants: Vec::new(),
    };
    for &value in body {
        for operand in module.operands(value) {
            if operand == index || inside.contains(&operand) {
                continue;
            }
            let kind = module.kind(operand);
            if kind.is_function() || kind.is_block() || kind.is_marker() {
                continue;
            }
            let list = if kind.is_constant() {
                &mut captures.constants
            } else {
                &mut captures.values
            };
            if !list.contains(&operand) {
                list.push(operand);
            }
        }
    }
    captures
}

fn reject(kernel: &str, reason: String) -> IrError {
    IrError::RejectedCapture {
        kernel: kernel.to_string(),
        reason,
    }
}

fn check_captures(
    module: &Module,
    kernel: &str,
    body: &[ValueId],
    captures: &[ValueId],
) -> Result<()> {
    for &capture in captures {
        let ty = module.ty(capture);
        if module.types.contains_pointer(ty) && !module.types.get(ty).device_visible {
            return Err(reject(
                kernel,
                format!(
                    "`{}` of type `{}` holds a host address",
                    module.name(capture),
                    module.types.display(ty)
                ),
            ));
        }
    }
    for &value in body {
        let target = match module.kind(value) {
            ValueKind::Write => module.operand(value, slot::WRITE_DEST)?,
            ValueKind::GetAddressOf
                if !module.has_annotation(value, annotation::LIFETIME_INSERTED) =>
            {
                module.operand(value, 0)?
            }
            _ => continue,
        };
        let root = walk::storage_root(module, target)?;
        if captures.contains(&root) {
            let action = match module.kind(value) {
                ValueKind::Write => "writes to",
                _ => "takes the address of",
            };
            return Err(reject(
                kernel,
                format!("loop body {} captured `{}`", action, module.name(root)),
            ));
        }
    }
    Ok(())
}

/// Points every use of `old` made from inside the body at `new`
fn rewire_inside(
    module: &mut Module,
    old: ValueId,
    new: ValueId,
    inside: &HashSet<ValueId>,
) -> Result<()> {
    let uses: Vec<_> = module
        .uses(old)
        .iter()
        .filter(|u| inside.contains(&u.user))
        .copied()
        .collect();
    for u in uses {
        module.set_operand(u.user, u.index, new)?;
    }
    Ok(())
}

/// Whether `value` transfers control out of the lifted body: a return, a
/// loop exit or branch whose target lies outside it
fn leaves_body(module: &Module, value: ValueId, inside: &HashSet<ValueId>) -> bool {
    match module.kind(value) {
        ValueKind::Return => true,
        ValueKind::Break | ValueKind::Continue => module
            .operand(value, 0)
            .map_or(true, |target| !inside.contains(&target)),
        ValueKind::Jump | ValueKind::CondBranch => module.operands(value).any(|target| {
            let kind = module.kind(target);
            (kind.is_marker() || kind.is_block()) && !inside.contains(&target)
        }),
        _ => false,
    }
}

fn extract_loop(module: &mut Module, inst: ValueId, name: &str, target: Target) -> Result<ValueId> {
    let index = module.operand(inst, slot::FOR_INDEX)?;
    let first = module.operand(inst, slot::FOR_FIRST)?;
    let last = module.operand(inst, slot::FOR_LAST)?;
    let body = module.operand(inst, slot::FOR_BODY)?;

    let body_values = walk::collect(module, body);
    let inside: HashSet<ValueId> = body_values.iter().copied().collect();
    if let Some(exit) = body_values
        .iter()
        .copied()
        .find(|value| leaves_body(module, *value, &inside))
    {
        return Err(IrError::UnsupportedConstruct(format!(
            "`{}` out of the parallel loop lifted into `{}`",
            module.kind(exit).mnemonic(),
            name
        )));
    }

    let nested = body_values.iter().any(|v| {
        matches!(module.kind(*v), ValueKind::For) && module.has_annotation(*v, annotation::PARALLEL)
    });
    if nested {
        return Err(IrError::UnsupportedConstruct(format!(
            "parallel loop nested in the parallel loop lifted into `{}`",
            name
        )));
    }
    let mut captures = collect_captures(module, &body_values, &inside, index);
    check_captures(module, name, &body_values, &captures.values)?;

    // A computed lower bound travels as one more argument
    let first_is_constant = module.kind(first).is_constant();
    if !first_is_constant && !captures.values.contains(&first) {
        captures.values.push(first);
    }

    let params: Vec<(String, vela_ir::TypeId)> = captures
        .values
        .iter()
        .enumerate()
        .map(|(i, capture)| {
            let param = match module.name(*capture) {
                "" => format!("capture.{}", i),
                named => named.to_string(),
            };
            (param, module.ty(*capture))
        })
        .collect();
    let params: Vec<(&str, vela_ir::TypeId)> =
        params.iter().map(|(n, ty)| (n.as_str(), *ty)).collect();
    let void = module.types.void();
    let kernel = module.create_function(name, &params, void);
    let args = module.params(kernel).to_vec();
    let entry = module.append_function_block(kernel)?;

    let location = module[inst].location.clone();
    let mut builder = IrBuilder::at_end(module, entry);
    builder.set_location(location);

    // Addressable captures become kernel locals so field access still works.
    // They borrow the host object, which keeps its own hooks, so the local
    // copies get none.
    let mut replacements = Vec::with_capacity(args.len());
    for (&capture, &arg) in captures.values.iter().zip(&args) {
        if builder.module.kind(capture).is_addressable() {
            let ty = builder.module.ty(capture);
            let name = builder.module.name(capture).to_string();
            let local = builder.local(ty, &name)?;
            builder.write(arg, local)?;
            replacements.push(local);
        } else {
            replacements.push(arg);
        }
    }
    let mut constant_clones = Vec::with_capacity(captures.constants.len());
    for &constant in &captures.constants {
        let clone = builder.module.clone_constant(constant)?;
        builder.insert(clone)?;
        constant_clones.push(clone);
    }

    let index_ty = builder.module.ty(index);
    let index_name = builder.module.name(index).to_string();
    let kernel_index = builder.local(index_ty, &index_name)?;
    let thread = builder.device_index(DeviceIndex::ThreadIndex)?;
    let block_index = builder.device_index(DeviceIndex::BlockIndex)?;
    let block_dim = builder.device_index(DeviceIndex::BlockDim)?;
    let offset = builder.binary(BinaryOp::Mul, block_index, block_dim)?;
    let offset = builder.binary(BinaryOp::Add, offset, thread)?;
    let kernel_first = if first_is_constant {
        let clone = builder.module.clone_constant(first)?;
        builder.insert(clone)?
    } else {
        let position = captures.values.iter().position(|c| *c == first);
        match position {
            Some(position) => args[position],
            None => vela_ir::ir_bail!("lower bound of `{}` was not captured", name),
        }
    };
    let global = builder.binary(BinaryOp::Add, kernel_first, offset)?;
    builder.write(global, kernel_index)?;

    for (&capture, &replacement) in captures.values.iter().zip(&replacements) {
        rewire_inside(module, capture, replacement, &inside)?;
    }
    for (&constant, &clone) in captures.constants.iter().zip(&constant_clones) {
        rewire_inside(module, constant, clone, &inside)?;
    }
    rewire_inside(module, index, kernel_index, &inside)?;

    for value in module.drain_block(body)? {
        module.push_back(entry, value)?;
    }
    IrBuilder::at_end(module, entry).ret_void()?;

    // Launch site
    let mut builder = IrBuilder::before(module, inst);
    let grid = builder.binary(BinaryOp::Sub, last, first)?;
    let block_shape = builder.const_int_of(index_ty, 1)?;
    builder.launch(kernel, grid, block_shape, &captures.values)?;

    module.finalize(inst)?;
    module.finalize(body)?;
    if module.uses(index).is_empty() && module.parent(index).is_some() {
        module.finalize(index)?;
    }

    module.annotations_mut(kernel).flag(annotation::KERNEL);
    module.move_to_target(kernel, target)?;
    info!(kernel = name, %target, captures = captures.values.len(), "extracted kernel");
    debug!(constants = captures.constants.len(), "cloned constants into kernel");
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_ir::Field;

    fn parallel_loop(module: &mut Module) -> (ValueId, ValueId, ValueId, ValueId) {
        let void = module.types.void();
        let i64_ty = module.types.i64();
        let f = module.create_function("scale", &[("n", i64_ty)], void);
        let n = module.params(f)[0];
        let entry = module.append_function_block(f).unwrap();
        let mut builder = IrBuilder::at_end(module, entry);
        let i = builder.local(i64_ty, "i").unwrap();
        let first = builder.const_int(0).unwrap();
        let (inst, body) = builder.for_loop(i, first, n).unwrap();
        builder.ret_void().unwrap();
        module.annotations_mut(inst).flag(annotation::PARALLEL);
        (f, inst, body, n)
    }

    #[test]
    fn test_loop_becomes_launch() {
        let mut module = Module::new("test");
        let (f, inst, _, n) = parallel_loop(&mut module);

        let kernels = extract_function_kernels(&mut module, f, Target::Nvptx).unwrap();
        assert_eq!(kernels.len(), 1);
        assert!(!module.contains(inst));
        let kernel = kernels[0];
        assert_eq!(module.name(kernel), "scale_kernel_0");
        assert!(module.has_annotation(kernel, annotation::KERNEL));
        assert_eq!(module.target_functions(Target::Nvptx), &[kernel]);

        let entry = module.entry_block(f).unwrap();
        let launches: Vec<_> = module
            .block_values(entry)
            .iter()
            .filter(|v| matches!(module.kind(**v), ValueKind::KernelLaunch))
            .copied()
            .collect();
        assert_eq!(launches.len(), 1);
        assert_eq!(module.operand(launches[0], slot::LAUNCH_KERNEL).unwrap(), kernel);
        let grid = module.operand(launches[0], slot::LAUNCH_GRID).unwrap();
        assert!(matches!(module.kind(grid), ValueKind::Binary(BinaryOp::Sub)));
        assert_eq!(module.operand(grid, 0).unwrap(), n);
    }

    #[test]
    fn test_pointer_capture_is_rejected() {
        let mut module = Module::new("test");
        let (f, _, body, _) = parallel_loop(&mut module);
        let f64_ty = module.types.f64();
        let ptr = module.types.pointer_to(f64_ty);
        let entry = module.entry_block(f).unwrap();
        let p = module.create_value(ValueKind::LocalVariable, ptr, "p");
        module.push_front(entry, p).unwrap();
        let mut builder = IrBuilder::at_end(&mut module, body);
        let zero = builder.const_int(0).unwrap();
        builder.index_pointer(p, zero).unwrap();

        let err = extract_function_kernels(&mut module, f, Target::Nvptx).unwrap_err();
        assert!(matches!(err, IrError::RejectedCapture { .. }));
    }

    #[test]
    fn test_device_visible_handle_is_captured() {
        let mut module = Module::new("test");
        let (f, _, body, _) = parallel_loop(&mut module);
        let f64_ty = module.types.f64();
        let ptr = module.types.pointer_to(f64_ty);
        let view = module
            .types
            .declare_struct("View", vec![Field::new("data", ptr)]);
        module.types.set_device_visible(view, true);
        let entry = module.entry_block(f).unwrap();
        let v = module.create_value(ValueKind::LocalVariable, view, "v");
        module.push_front(entry, v).unwrap();
        let mut builder = IrBuilder::at_end(&mut module, body);
        builder.access_field(v, 0).unwrap();

        let kernels = extract_function_kernels(&mut module, f, Target::Nvptx).unwrap();
        let params = module.params(kernels[0]);
        // the upper bound only shapes the grid
        assert_eq!(params.len(), 1);
        assert_eq!(module.name(params[0]), "v");
    }

    #[test]
    fn test_write_to_capture_is_rejected() {
        let mut module = Module::new("test");
        let (f, _, body, _) = parallel_loop(&mut module);
        let i64_ty = module.types.i64();
        let entry = module.entry_block(f).unwrap();
        let total = module.create_value(ValueKind::LocalVariable, i64_ty, "total");
        module.push_front(entry, total).unwrap();
        let mut builder = IrBuilder::at_end(&mut module, body);
        let one = builder.const_int(1).unwrap();
        builder.write(one, total).unwrap();

        let err = extract_function_kernels(&mut module, f, Target::Nvptx).unwrap_err();
        assert!(matches!(err, IrError::RejectedCapture { .. }));
    }

    #[test]
    fn test_break_out_of_parallel_loop_is_unsupported() {
        let mut module = Module::new("test");
        let (f, inst, body, _) = parallel_loop(&mut module);
        IrBuilder::at_end(&mut module, body).break_loop(inst).unwrap();

        let err = extract_function_kernels(&mut module, f, Target::Nvptx).unwrap_err();
        assert!(matches!(err, IrError::UnsupportedConstruct(_)));
    }

    #[test]
    fn test_break_to_enclosing_loop_is_unsupported() {
        let mut module = Module::new("test");
        let void = module.types.void();
        let i64_ty = module.types.i64();
        let f = module.create_function("outer", &[("n", i64_ty)], void);
        let n = module.params(f)[0];
        let entry = module.append_function_block(f).unwrap();
        let condition_block = module.create_block();
        let while_body = module.create_block();

        let cond = IrBuilder::at_end(&mut module, condition_block)
            .const_bool(true)
            .unwrap();
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let outer = builder.while_loop(cond, condition_block, while_body).unwrap();
        builder.ret_void().unwrap();

        let mut builder = IrBuilder::at_end(&mut module, while_body);
        let i = builder.local(i64_ty, "i").unwrap();
        let first = builder.const_int(0).unwrap();
        let (inst, body) = builder.for_loop(i, first, n).unwrap();
        module.annotations_mut(inst).flag(annotation::PARALLEL);
        IrBuilder::at_end(&mut module, body).break_loop(outer).unwrap();

        crate::flatten::flatten_function(&mut module, f).unwrap();
        let exits: Vec<ValueId> = module
            .block_values(body)
            .iter()
            .copied()
            .filter(|v| matches!(module.kind(*v), ValueKind::Jump))
            .collect();
        assert_eq!(exits.len(), 1);

        let err = extract_function_kernels(&mut module, f, Target::Nvptx).unwrap_err();
        assert!(matches!(err, IrError::UnsupportedConstruct(_)), "{}", err);
        assert!(module.contains(inst));
    }

    #[test]
    fn test_managed_capture_is_borrowed_without_hooks() {
        let mut module = Module::new("test");
        let (f, _, body, _) = parallel_loop(&mut module);
        let void = module.types.void();
        let i64_ty = module.types.i64();
        let buffer = module
            .types
            .declare_struct("Buffer", vec![Field::new("len", i64_ty)]);
        let this = module.types.pointer_to(buffer);
        let hooks = vela_ir::LifetimeHooks {
            initialize: Some(module.create_function("Buffer.init", &[("this", this)], void)),
            copy: Some(module.create_function("Buffer.copy", &[("this", this)], void)),
            destroy: Some(module.create_function("Buffer.destroy", &[("this", this)], void)),
        };
        module.types.set_hooks(buffer, hooks);
        let entry = module.entry_block(f).unwrap();
        let b = module.create_value(ValueKind::LocalVariable, buffer, "b");
        module.push_front(entry, b).unwrap();
        IrBuilder::at_end(&mut module, body).access_field(b, 0).unwrap();

        crate::lifetime::insert_function_lifetime_calls(&mut module, f).unwrap();
        crate::flatten::flatten_function(&mut module, f).unwrap();
        let kernels = extract_function_kernels(&mut module, f, Target::Nvptx).unwrap();

        let calls = |function: ValueId| {
            walk::filter_function(&module, function, |kind| matches!(kind, ValueKind::Call)).len()
        };
        assert_eq!(module.name(module.params(kernels[0])[0]), "b");
        assert_eq!(calls(kernels[0]), 0);
        // init and destroy stay with the host object
        assert_eq!(calls(f), 2);
    }
}
