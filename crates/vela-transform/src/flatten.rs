//! Control-Flow Flattening
//!
//! Two phases:
//!
//! 1. [`flatten_function`] rewrites nested scopes, `if`, `while` and
//!    sequential `for` into one marker-delimited block, children first.
//!    Parallel `for` loops keep their shape (only their bodies are
//!    flattened) so kernel extraction can lift them.
//! 2. [`partition_function`] cuts that block at every marker into the final
//!    list of basic blocks and rewrites branch targets from markers to
//!    blocks.

use crate::walk;
use tracing::{debug, trace};
use vela_ir::{
    annotation, ir_bail, ir_ensure, slot, BinaryOp, CompareOp, IrBuilder, Module, Result, ValueId,
    ValueKind,
};

/// Flattens the structured control of every function body
pub fn flatten_module(module: &mut Module) -> Result<()> {
    for function in walk::defined_functions(module) {
        flatten_function(module, function)?;
    }
    Ok(())
}

/// Partitions every function body into basic blocks
pub fn partition_module(module: &mut Module) -> Result<()> {
    for function in walk::defined_functions(module) {
        partition_function(module, function)?;
    }
    Ok(())
}

/// Lowers nested control in `function` into its single top-level block
pub fn flatten_function(module: &mut Module, function: ValueId) -> Result<()> {
    let blocks = module.function_blocks(function);
    if blocks.len() != 1 {
        // Already partitioned
        return Ok(());
    }
    let top = blocks[0];
    debug!(function = module.name(function), "flattening");
    flatten_block(module, top)
}

fn flatten_block(module: &mut Module, block: ValueId) -> Result<()> {
    let values = module.block_values(block).to_vec();
    for value in values {
        match module.kind(value) {
            ValueKind::Block(_) => {
                flatten_block(module, value)?;
                walk::splice_before(module, value, value)?;
                module.finalize(value)?;
            }
            ValueKind::If => {
                flatten_block(module, module.operand(value, slot::IF_THEN)?)?;
                flatten_block(module, module.operand(value, slot::IF_ELSE)?)?;
                lower_if(module, value)?;
            }
            ValueKind::While => {
                flatten_block(module, module.operand(value, slot::WHILE_CONDITION_BLOCK)?)?;
                flatten_block(module, module.operand(value, slot::WHILE_BODY)?)?;
                lower_while(module, value)?;
            }
            ValueKind::For => {
                flatten_block(module, module.operand(value, slot::FOR_BODY)?)?;
                if !module.has_annotation(value, annotation::PARALLEL) {
                    lower_for(module, value)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Detaches and finalizes a lowered structured instruction and its bodies
fn retire(module: &mut Module, inst: ValueId) -> Result<()> {
    let bodies = walk::bodies(module, inst);
    module.remove_from_block(inst)?;
    module.finalize(inst)?;
    for body in bodies {
        module.finalize(body)?;
    }
    Ok(())
}

/// Rewrites `break`/`continue` of `inst` into jumps
fn lower_loop_exits(
    module: &mut Module,
    inst: ValueId,
    break_target: ValueId,
    continue_target: ValueId,
) -> Result<()> {
    for user in module.users(inst) {
        let target = match module.kind(user) {
            ValueKind::Break => break_target,
            ValueKind::Continue => continue_target,
            _ => continue,
        };
        let void = module.types.void();
        let jump = module.create_instruction(ValueKind::Jump, void, &[target])?;
        module.replace_in_block(user, jump)?;
    }
    Ok(())
}

fn lower_if(module: &mut Module, inst: ValueId) -> Result<()> {
    let condition = module.operand(inst, slot::IF_CONDITION)?;
    let then_block = module.operand(inst, slot::IF_THEN)?;
    let else_block = module.operand(inst, slot::IF_ELSE)?;

    let on_true = module.create_marker("if.true");
    let on_false = module.create_marker("if.false");
    let merge = module.create_marker("if.merge");

    let mut builder = IrBuilder::before(module, inst);
    builder.cond_branch(condition, on_true, on_false)?;
    builder.insert(on_true)?;
    walk::splice_before(builder.module, then_block, inst)?;
    builder.jump(merge)?;
    builder.insert(on_false)?;
    walk::splice_before(builder.module, else_block, inst)?;
    builder.jump(merge)?;
    builder.insert(merge)?;

    trace!("lowered if");
    retire(module, inst)
}

fn lower_while(module: &mut Module, inst: ValueId) -> Result<()> {
    let condition = module.operand(inst, slot::WHILE_CONDITION)?;
    let condition_block = module.operand(inst, slot::WHILE_CONDITION_BLOCK)?;
    let body = module.operand(inst, slot::WHILE_BODY)?;

    let entry = module.create_marker("while.cond");
    let looping = module.create_marker("while.body");
    let after = module.create_marker("while.after");

    let mut builder = IrBuilder::before(module, inst);
    builder.jump(entry)?;
    builder.insert(entry)?;
    walk::splice_before(builder.module, condition_block, inst)?;
    builder.cond_branch(condition, looping, after)?;
    builder.insert(looping)?;
    walk::splice_before(builder.module, body, inst)?;
    builder.jump(entry)?;
    builder.insert(after)?;

    lower_loop_exits(module, inst, after, entry)?;
    trace!("lowered while");
    retire(module, inst)
}

fn lower_for(module: &mut Module, inst: ValueId) -> Result<()> {
    let index = module.operand(inst, slot::FOR_INDEX)?;
    let first = module.operand(inst, slot::FOR_FIRST)?;
    let last = module.operand(inst, slot::FOR_LAST)?;
    let body = module.operand(inst, slot::FOR_BODY)?;
    let ty = module.ty(index);

    let entry = module.create_marker("for.cond");
    let looping = module.create_marker("for.body");
    let after = module.create_marker("for.after");

    let mut builder = IrBuilder::before(module, inst);
    // counter = first - 1; wraps when first is the minimum value
    let counter = builder.local(ty, "for.counter")?;
    let one = builder.const_int_of(ty, 1)?;
    let start = builder.binary(BinaryOp::Sub, first, one)?;
    builder.write(start, counter)?;
    builder.jump(entry)?;

    builder.insert(entry)?;
    let one = builder.const_int_of(ty, 1)?;
    let next = builder.binary(BinaryOp::Add, counter, one)?;
    builder.write(next, counter)?;
    let in_range = builder.compare(CompareOp::Lt, counter, last)?;
    builder.cond_branch(in_range, looping, after)?;

    builder.insert(looping)?;
    builder.write(counter, index)?;
    walk::splice_before(builder.module, body, inst)?;
    builder.jump(entry)?;
    builder.insert(after)?;

    lower_loop_exits(module, inst, after, entry)?;
    trace!("lowered for");
    retire(module, inst)
}

/// Cuts the flattened top-level block of `function` into basic blocks
pub fn partition_function(module: &mut Module, function: ValueId) -> Result<()> {
    let blocks = module.function_blocks(function);
    if blocks.len() != 1 {
        return Ok(());
    }
    let top = blocks[0];
    let name = module.name(function).to_string();

    for &value in module.block_values(top) {
        let kind = module.kind(value);
        if kind.is_block() {
            ir_bail!("nested block left in `{}` at partitioning", name);
        }
        if matches!(kind, ValueKind::For) && module.has_annotation(value, annotation::PARALLEL) {
            ir_bail!("parallel loop in `{}` reached partitioning un-extracted", name);
        }
        ir_ensure!(
            !(kind.is_structured() || kind.is_loop_exit()),
            "`{}` left in `{}` at partitioning",
            kind.mnemonic(),
            name
        );
    }

    let values = module.drain_block(top)?;
    let mut result = vec![top];
    let mut current = top;
    for value in values {
        if !module.kind(value).is_marker() {
            module.push_back(current, value)?;
            continue;
        }
        let block = module.create_block();
        if !ends_with_terminator(module, current) {
            IrBuilder::at_end(module, current).jump(block)?;
        }
        module.replace_all_uses(value, block)?;
        module.finalize(value)?;
        result.push(block);
        current = block;
    }
    module.set_function_blocks(function, result.clone())?;

    for &block in &result {
        remove_after_terminator(module, block)?;
    }
    repair_tail(module, function)?;
    debug!(function = %name, blocks = module.function_blocks(function).len(), "partitioned");
    Ok(())
}

fn ends_with_terminator(module: &Module, block: ValueId) -> bool {
    module
        .block_values(block)
        .last()
        .map(|last| module.kind(*last).is_terminator())
        .unwrap_or(false)
}

/// Drops unreachable values following the first terminator of `block`
fn remove_after_terminator(module: &mut Module, block: ValueId) -> Result<()> {
    let values = module.block_values(block);
    let Some(first) = values.iter().position(|v| module.kind(*v).is_terminator()) else {
        return Ok(());
    };
    let dead = values[first + 1..].to_vec();
    for value in dead.into_iter().rev() {
        trace!(kind = module.kind(value).mnemonic(), "removing dead value");
        module.finalize(value)?;
    }
    Ok(())
}

/// Gives the last block a terminator and drops unreferenced empty blocks
fn repair_tail(module: &mut Module, function: ValueId) -> Result<()> {
    let blocks = module.function_blocks(function).to_vec();
    for (index, &block) in blocks.iter().enumerate() {
        if index > 0 && module.block_values(block).is_empty() && module.uses(block).is_empty() {
            module.finalize(block)?;
            continue;
        }
        if ends_with_terminator(module, block) {
            continue;
        }
        let returns_void = module.types.is_void(module.return_type(function)?);
        ir_ensure!(
            returns_void,
            "control falls off the end of `{}`, which returns a value",
            module.name(function)
        );
        IrBuilder::at_end(module, block).ret_void()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_ir::{verify, VerifyLevel};

    fn function(module: &mut Module) -> (ValueId, ValueId) {
        let void = module.types.void();
        let f = module.create_function("main", &[], void);
        let entry = module.append_function_block(f).unwrap();
        (f, entry)
    }

    fn kinds(module: &Module, block: ValueId) -> Vec<&'static str> {
        module
            .block_values(block)
            .iter()
            .map(|v| module.kind(*v).mnemonic())
            .collect()
    }

    fn run(module: &mut Module, f: ValueId) {
        flatten_function(module, f).unwrap();
        partition_function(module, f).unwrap();
        verify::module(module, VerifyLevel::Flat).unwrap();
    }

    #[test]
    fn test_nested_scope_is_inlined() {
        let mut module = Module::new("test");
        let (f, entry) = function(&mut module);
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let scope = builder.block_scope().unwrap();
        builder.ret_void().unwrap();
        IrBuilder::at_end(&mut module, scope).const_int(3).unwrap();

        run(&mut module, f);
        assert_eq!(module.function_blocks(f), &[entry]);
        assert_eq!(kinds(&module, entry), vec!["const.int", "void", "ret"]);
        assert!(!module.contains(scope));
    }

    #[test]
    fn test_if_else_gives_four_blocks() {
        let mut module = Module::new("test");
        let (f, entry) = function(&mut module);
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let cond = builder.const_bool(true).unwrap();
        let (_, then_block, else_block) = builder.if_else(cond).unwrap();
        builder.ret_void().unwrap();
        IrBuilder::at_end(&mut module, then_block).const_int(1).unwrap();
        IrBuilder::at_end(&mut module, else_block).const_int(2).unwrap();

        run(&mut module, f);
        let blocks = module.function_blocks(f).to_vec();
        assert_eq!(blocks.len(), 4);
        assert_eq!(kinds(&module, blocks[0]), vec!["const.bool", "condbr"]);
        assert_eq!(kinds(&module, blocks[1]), vec!["const.int", "br"]);
        assert_eq!(kinds(&module, blocks[2]), vec!["const.int", "br"]);
        assert_eq!(kinds(&module, blocks[3]), vec!["void", "ret"]);

        let branch = *module.block_values(blocks[0]).last().unwrap();
        assert_eq!(module.operand(branch, slot::BRANCH_TRUE).unwrap(), blocks[1]);
        assert_eq!(module.operand(branch, slot::BRANCH_FALSE).unwrap(), blocks[2]);
    }

    #[test]
    fn test_while_with_break() {
        let mut module = Module::new("test");
        let (f, entry) = function(&mut module);
        let condition_block = module.create_block();
        let body = module.create_block();
        let cond = IrBuilder::at_end(&mut module, condition_block)
            .const_bool(true)
            .unwrap();
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let inst = builder.while_loop(cond, condition_block, body).unwrap();
        builder.ret_void().unwrap();
        let mut builder = IrBuilder::at_end(&mut module, body);
        builder.break_loop(inst).unwrap();
        builder.const_int(9).unwrap();

        run(&mut module, f);
        let blocks = module.function_blocks(f).to_vec();
        // entry, condition, body, after
        assert_eq!(blocks.len(), 4);
        assert_eq!(kinds(&module, blocks[0]), vec!["br"]);
        assert_eq!(kinds(&module, blocks[1]), vec!["const.bool", "condbr"]);
        // the break became a jump to the after block; the rest is dead
        assert_eq!(kinds(&module, blocks[2]), vec!["br"]);
        let jump = module.block_values(blocks[2])[0];
        assert_eq!(module.operand(jump, 0).unwrap(), blocks[3]);
    }

    #[test]
    fn test_sequential_for_uses_counter() {
        let mut module = Module::new("test");
        let (f, entry) = function(&mut module);
        let i64_ty = module.types.i64();
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let i = builder.local(i64_ty, "i").unwrap();
        let first = builder.const_int(0).unwrap();
        let last = builder.const_int(10).unwrap();
        builder.for_loop(i, first, last).unwrap();
        builder.ret_void().unwrap();

        run(&mut module, f);
        let blocks = module.function_blocks(f).to_vec();
        assert_eq!(blocks.len(), 4);
        assert_eq!(
            kinds(&module, blocks[1]),
            vec!["const.int", "binary", "write", "cmp", "condbr"]
        );
        assert_eq!(kinds(&module, blocks[2]), vec!["write", "br"]);
        let compare = module.block_values(blocks[1])[3];
        assert!(matches!(module.kind(compare), ValueKind::Compare(CompareOp::Lt)));
    }

    #[test]
    fn test_flattening_is_idempotent() {
        let mut module = Module::new("test");
        let (f, entry) = function(&mut module);
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let cond = builder.const_bool(false).unwrap();
        builder.if_else(cond).unwrap();
        builder.ret_void().unwrap();

        run(&mut module, f);
        let before = module.to_string();
        let count = module.len();
        flatten_function(&mut module, f).unwrap();
        partition_function(&mut module, f).unwrap();
        assert_eq!(module.to_string(), before);
        assert_eq!(module.len(), count);
    }

    #[test]
    fn test_parallel_loop_blocks_partitioning() {
        let mut module = Module::new("test");
        let (f, entry) = function(&mut module);
        let i64_ty = module.types.i64();
        let mut builder = IrBuilder::at_end(&mut module, entry);
        let i = builder.local(i64_ty, "i").unwrap();
        let first = builder.const_int(0).unwrap();
        let last = builder.const_int(4).unwrap();
        let (inst, _) = builder.for_loop(i, first, last).unwrap();
        builder.ret_void().unwrap();
        module.annotations_mut(inst).flag(annotation::PARALLEL);

        flatten_function(&mut module, f).unwrap();
        assert!(module.contains(inst));
        assert!(partition_function(&mut module, f).is_err());
    }

    #[test]
    fn test_missing_return_in_void_function_is_added() {
        let mut module = Module::new("test");
        let (f, entry) = function(&mut module);
        IrBuilder::at_end(&mut module, entry).const_int(1).unwrap();
        run(&mut module, f);
        assert_eq!(kinds(&module, entry), vec!["const.int", "void", "ret"]);
    }
}
