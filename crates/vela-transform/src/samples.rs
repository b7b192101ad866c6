//! Sample units
//!
//! Lowering is outside this workspace, so each unit is built directly with
//! the [`IrBuilder`] in the shape lowering produces: nested scope blocks,
//! structured control, locals written from arguments. The `vela` CLI runs
//! them and the end-to-end suites check the pipeline against them.

use vela_error::{Diagnostic, Diagnostics};
use vela_ir::{
    annotation, BinaryOp, CompareOp, Field, IrBuilder, LifetimeHooks, Module, Result, TypeId,
};

/// A lifetime-managed struct with declared initialize/copy/destroy hooks
pub struct ManagedType {
    pub ty: TypeId,
    pub hooks: LifetimeHooks,
}

pub fn declare_managed_type(module: &mut Module, name: &str) -> ManagedType {
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let ty = module
        .types
        .declare_struct(name, vec![Field::new("handle", i64_ty)]);
    let this = module.types.pointer_to(ty);
    let hooks = LifetimeHooks {
        initialize: Some(module.create_function(format!("{}.init", name), &[("this", this)], void)),
        copy: Some(module.create_function(format!("{}.copy", name), &[("this", this)], void)),
        destroy: Some(module.create_function(format!("{}.destroy", name), &[("this", this)], void)),
    };
    module.types.set_hooks(ty, hooks);
    ManagedType { ty, hooks }
}

/// `{ var a: int64 = 1 + 2; }`
pub fn scope_sample() -> Result<Module> {
    let mut module = Module::new("scope");
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let main = module.create_function("main", &[], void);
    let entry = module.append_function_block(main)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let scope = builder.block_scope()?;
    builder.ret_void()?;

    let mut builder = IrBuilder::at_end(&mut module, scope);
    let a = builder.local(i64_ty, "a")?;
    let one = builder.const_int(1)?;
    let two = builder.const_int(2)?;
    let sum = builder.binary(BinaryOp::Add, one, two)?;
    builder.write(sum, a)?;
    Ok(module)
}

/// `if cond { a = 1; } else { a = 2; }`
pub fn if_else_sample() -> Result<Module> {
    let mut module = Module::new("if_else");
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let bool_ty = module.types.bool();
    let main = module.create_function("choose", &[("cond", bool_ty)], void);
    let cond = module.params(main)[0];
    let entry = module.append_function_block(main)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let a = builder.local(i64_ty, "a")?;
    let (_, then_block, else_block) = builder.if_else(cond)?;
    builder.ret_void()?;

    let mut builder = IrBuilder::at_end(&mut module, then_block);
    let one = builder.const_int(1)?;
    builder.write(one, a)?;
    let mut builder = IrBuilder::at_end(&mut module, else_block);
    let two = builder.const_int(2)?;
    builder.write(two, a)?;
    Ok(module)
}

/// `var i = 0; while i < n { i = i + 1; }`
pub fn while_sample() -> Result<Module> {
    let mut module = Module::new("while");
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let main = module.create_function("count", &[("n", i64_ty)], void);
    let n = module.params(main)[0];
    let entry = module.append_function_block(main)?;

    let condition_block = module.create_block();
    let body = module.create_block();

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let i = builder.local(i64_ty, "i")?;
    let zero = builder.const_int(0)?;
    builder.write(zero, i)?;

    let mut builder = IrBuilder::at_end(&mut module, condition_block);
    let cond = builder.compare(CompareOp::Lt, i, n)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    builder.while_loop(cond, condition_block, body)?;
    builder.ret_void()?;

    let mut builder = IrBuilder::at_end(&mut module, body);
    let one = builder.const_int(1)?;
    let next = builder.binary(BinaryOp::Add, i, one)?;
    builder.write(next, i)?;
    Ok(module)
}

/// `{ var x: T; }` for a lifetime-managed `T`
pub fn managed_local_sample() -> Result<(Module, ManagedType)> {
    let mut module = Module::new("managed_local");
    let managed = declare_managed_type(&mut module, "Resource");
    let void = module.types.void();
    let main = module.create_function("main", &[], void);
    let entry = module.append_function_block(main)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    builder.local(managed.ty, "x")?;
    builder.ret_void()?;
    Ok((module, managed))
}

/// A tensor-like view whose data pointer already addresses device memory
pub fn declare_view(module: &mut Module) -> TypeId {
    let f64_ty = module.types.f64();
    let data = module.types.pointer_to(f64_ty);
    let view = module
        .types
        .declare_struct("View", vec![Field::new("data", data)]);
    module.types.set_device_visible(view, true);
    view
}

/// `for i in 0 to n @parallel { out[i] = in[i] + k }`
pub fn parallel_for_sample() -> Result<Module> {
    let mut module = Module::new("parallel_for");
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let f64_ty = module.types.f64();
    let view = declare_view(&mut module);
    let main = module.create_function(
        "compute",
        &[("out_arg", view), ("in_arg", view), ("k_arg", f64_ty), ("n", i64_ty)],
        void,
    );
    let args = module.params(main).to_vec();
    let entry = module.append_function_block(main)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let out = builder.local(view, "out")?;
    builder.write(args[0], out)?;
    let input = builder.local(view, "in")?;
    builder.write(args[1], input)?;
    let k = builder.local(f64_ty, "k")?;
    builder.write(args[2], k)?;
    let i = builder.local(i64_ty, "i")?;
    let first = builder.const_int(0)?;
    let (inst, body) = builder.for_loop(i, first, args[3])?;
    builder.ret_void()?;
    module.annotations_mut(inst).flag(annotation::PARALLEL);

    let mut builder = IrBuilder::at_end(&mut module, body);
    let out_data = builder.access_field(out, 0)?;
    let target = builder.index_pointer(out_data, i)?;
    let in_data = builder.access_field(input, 0)?;
    let element = builder.index_pointer(in_data, i)?;
    let sum = builder.binary(BinaryOp::Add, element, k)?;
    builder.write(sum, target)?;
    Ok(module)
}

/// A sequential loop with an early `break` that accumulates into a global
pub fn loop_break_sample() -> Result<Module> {
    let mut module = Module::new("loop_break");
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let total = module.create_global("total", i64_ty);
    let main = module.create_function("accumulate", &[], void);
    let entry = module.append_function_block(main)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let i = builder.local(i64_ty, "i")?;
    let first = builder.const_int(0)?;
    let last = builder.const_int(10)?;
    let (inst, body) = builder.for_loop(i, first, last)?;
    builder.ret_void()?;

    let mut builder = IrBuilder::at_end(&mut module, body);
    let five = builder.const_int(5)?;
    let done = builder.compare(CompareOp::Eq, i, five)?;
    let (_, then_block, _) = builder.if_else(done)?;
    let next = builder.binary(BinaryOp::Add, total, i)?;
    builder.write(next, total)?;
    IrBuilder::at_end(&mut module, then_block).break_loop(inst)?;
    Ok(module)
}

/// `var x: T; if c { return; }` with an implicit return after the `if`
pub fn early_return_sample() -> Result<(Module, ManagedType)> {
    let mut module = Module::new("early_return");
    let managed = declare_managed_type(&mut module, "Resource");
    let void = module.types.void();
    let bool_ty = module.types.bool();
    let main = module.create_function("maybe", &[("c", bool_ty)], void);
    let c = module.params(main)[0];
    let entry = module.append_function_block(main)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    builder.local(managed.ty, "x")?;
    let (_, then_block, _) = builder.if_else(c)?;
    IrBuilder::at_end(&mut module, then_block).ret_void()?;
    Ok((module, managed))
}

/// `var i = 0; while i < n { var r: T; i = i + 1; if i == 3 { break } }`
pub fn while_break_sample() -> Result<(Module, ManagedType)> {
    let mut module = Module::new("while_break");
    let managed = declare_managed_type(&mut module, "Resource");
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let main = module.create_function("drain", &[("n", i64_ty)], void);
    let n = module.params(main)[0];
    let entry = module.append_function_block(main)?;

    let condition_block = module.create_block();
    let body = module.create_block();

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let i = builder.local(i64_ty, "i")?;
    let zero = builder.const_int(0)?;
    builder.write(zero, i)?;

    let mut builder = IrBuilder::at_end(&mut module, condition_block);
    let cond = builder.compare(CompareOp::Lt, i, n)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let inst = builder.while_loop(cond, condition_block, body)?;
    builder.ret_void()?;

    let mut builder = IrBuilder::at_end(&mut module, body);
    builder.local(managed.ty, "r")?;
    let one = builder.const_int(1)?;
    let next = builder.binary(BinaryOp::Add, i, one)?;
    builder.write(next, i)?;
    let three = builder.const_int(3)?;
    let hit = builder.compare(CompareOp::Eq, i, three)?;
    let (_, then_block, _) = builder.if_else(hit)?;
    IrBuilder::at_end(&mut module, then_block).break_loop(inst)?;
    Ok((module, managed))
}

/// `for i in 0 to n { var r: T; if i == 3 { continue } }`
pub fn for_continue_sample() -> Result<(Module, ManagedType)> {
    let mut module = Module::new("for_continue");
    let managed = declare_managed_type(&mut module, "Resource");
    let void = module.types.void();
    let i64_ty = module.types.i64();
    let main = module.create_function("skip", &[("n", i64_ty)], void);
    let n = module.params(main)[0];
    let entry = module.append_function_block(main)?;

    let mut builder = IrBuilder::at_end(&mut module, entry);
    let i = builder.local(i64_ty, "i")?;
    let first = builder.const_int(0)?;
    let (inst, body) = builder.for_loop(i, first, n)?;
    builder.ret_void()?;

    let mut builder = IrBuilder::at_end(&mut module, body);
    builder.local(managed.ty, "r")?;
    let three = builder.const_int(3)?;
    let hit = builder.compare(CompareOp::Eq, i, three)?;
    let (_, then_block, _) = builder.if_else(hit)?;
    IrBuilder::at_end(&mut module, then_block).continue_loop(inst)?;
    Ok((module, managed))
}

/// A named unit the CLI can run
pub struct Sample {
    pub name: &'static str,
    pub description: &'static str,
    pub build: fn() -> Result<Module>,
}

impl Sample {
    /// Builds the unit the way a lowering front end hands it to a session
    pub fn lower(&self) -> std::result::Result<Module, Diagnostics> {
        (self.build)().map_err(|err| Diagnostics::from(Diagnostic::from(err)))
    }
}

pub fn samples() -> Vec<Sample> {
    vec![
        Sample {
            name: "scope",
            description: "{ var a: int64 = 1 + 2; }",
            build: scope_sample,
        },
        Sample {
            name: "if",
            description: "if cond { a = 1; } else { a = 2; }",
            build: if_else_sample,
        },
        Sample {
            name: "while",
            description: "while i < n { i = i + 1; }",
            build: while_sample,
        },
        Sample {
            name: "lifetime",
            description: "{ var x: Resource; } with initialize/copy/destroy hooks",
            build: || managed_local_sample().map(|(module, _)| module),
        },
        Sample {
            name: "kernel",
            description: "for i in 0 to n @parallel { out[i] = in[i] + k }",
            build: parallel_for_sample,
        },
        Sample {
            name: "break",
            description: "for loop with an early break accumulating into a global",
            build: loop_break_sample,
        },
        Sample {
            name: "early-return",
            description: "managed local destroyed on both exits of a function",
            build: || early_return_sample().map(|(module, _)| module),
        },
        Sample {
            name: "while-break",
            description: "managed loop-body local destroyed before a break",
            build: || while_break_sample().map(|(module, _)| module),
        },
        Sample {
            name: "for-continue",
            description: "managed loop-body local destroyed before a continue",
            build: || for_continue_sample().map(|(module, _)| module),
        },
    ]
}

pub fn find_sample(name: &str) -> Option<Sample> {
    samples().into_iter().find(|sample| sample.name == name)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_sample_builds() {
        for sample in samples() {
            let module = sample.lower().unwrap();
            assert!(!module.all_functions().is_empty(), "{} has no functions", sample.name);
        }
    }

    #[test]
    fn test_sample_names_are_unique() {
        let names: HashSet<&str> = samples().iter().map(|sample| sample.name).collect();
        assert_eq!(names.len(), samples().len());
        assert!(find_sample("while-break").is_some());
        assert!(find_sample("missing").is_none());
    }
}
