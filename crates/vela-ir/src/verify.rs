//! IR Verification
//!
//! Walks the graph and checks the invariants each stage of the pipeline
//! relies on. Every check returns the first violation it finds.

use crate::error::Result;
use crate::module::Module;
use crate::value::{Use, ValueId, ValueKind};
use crate::{ir_bail, ir_ensure};
use std::collections::HashSet;
use tracing::debug;

/// How much of the pipeline's output contract to check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyLevel {
    /// Def-use, parent links and definition order
    Structure,
    /// Also branch-normal form
    Flat,
    /// Also no addressable storage other than allocations
    Lowered,
}

/// Operand slots and use lists agree in both directions
pub fn def_use(module: &Module) -> Result<()> {
    for (id, data) in module.iter() {
        for (index, slot) in data.operand_slots().iter().enumerate() {
            let Some(operand) = slot else { continue };
            ir_ensure!(
                module.contains(*operand),
                "operand {} of `{}` is dangling",
                index,
                data.kind.mnemonic()
            );
            let count = module
                .uses(*operand)
                .iter()
                .filter(|u| **u == Use::new(id, index))
                .count();
            ir_ensure!(
                count == 1,
                "operand {} of `{}` recorded {} times in the use list of `{}`",
                index,
                data.kind.mnemonic(),
                count,
                module.kind(*operand).mnemonic()
            );
        }
        for u in data.uses() {
            ir_ensure!(
                module.contains(u.user),
                "`{}` is used by a finalized node",
                data.kind.mnemonic()
            );
            let slot = module[u.user].operand_slots().get(u.index).copied().flatten();
            ir_ensure!(
                slot == Some(id),
                "use list of `{}` names slot {} of `{}`, which reads something else",
                data.kind.mnemonic(),
                u.index,
                module.kind(u.user).mnemonic()
            );
        }
    }
    Ok(())
}

/// Blocks and their contents agree on containment
pub fn parents(module: &Module) -> Result<()> {
    for (id, data) in module.iter() {
        if let ValueKind::Block(block) = &data.kind {
            for &value in &block.values {
                ir_ensure!(
                    module.parent(value) == Some(id),
                    "`{}` sits in a block that is not its parent",
                    module.kind(value).mnemonic()
                );
            }
        }
        if let Some(parent) = data.parent() {
            ir_ensure!(
                module.block_values(parent).contains(&id),
                "parent of `{}` does not contain it",
                data.kind.mnemonic()
            );
        }
    }
    Ok(())
}

fn needs_definition(module: &Module, operand: ValueId) -> Result<bool> {
    let kind = module.kind(operand);
    if kind.is_module_level() || kind.is_block() || kind.is_marker() {
        return Ok(false);
    }
    if module.parent(operand).is_none() {
        ir_ensure!(
            kind.is_constant(),
            "`{}` is used but not placed in any block",
            kind.mnemonic()
        );
        return Ok(false);
    }
    Ok(true)
}

fn walk_definitions(
    module: &Module,
    function: ValueId,
    block: ValueId,
    defined: &mut HashSet<ValueId>,
) -> Result<()> {
    for &value in module.block_values(block) {
        let kind = module.kind(value);
        if kind.is_block() {
            walk_definitions(module, function, value, defined)?;
            continue;
        }
        let operands: Vec<ValueId> = module.operands(value).collect();
        // Bodies first: a while condition is defined inside its condition block
        for &operand in &operands {
            if module.kind(operand).is_block() && module.parent(operand).is_none() {
                let nested = module.block_data(operand)?.function.is_none();
                if nested {
                    walk_definitions(module, function, operand, defined)?;
                }
            }
        }
        for &operand in &operands {
            if !needs_definition(module, operand)? {
                continue;
            }
            ir_ensure!(
                module.function_of(operand) == Some(function),
                "`{}` in `{}` reads a value of another function",
                kind.mnemonic(),
                module.name(function)
            );
            ir_ensure!(
                defined.contains(&operand),
                "`{}` in `{}` reads `{}` before it is defined",
                kind.mnemonic(),
                module.name(function),
                module.kind(operand).mnemonic()
            );
        }
        defined.insert(value);
    }
    Ok(())
}

/// Every operand is defined earlier in block-list order
pub fn defined_before_used(module: &Module, function: ValueId) -> Result<()> {
    let mut defined = HashSet::new();
    for &block in module.function_blocks(function) {
        walk_definitions(module, function, block, &mut defined)?;
    }
    Ok(())
}

/// Flat basic blocks each ending in exactly one terminator
pub fn branch_normal_form(module: &Module, function: ValueId) -> Result<()> {
    let blocks = module.function_blocks(function);
    let name = module.name(function);
    for &block in blocks {
        let values = module.block_values(block);
        let Some((&last, body)) = values.split_last() else {
            ir_bail!("`{}` has an empty basic block", name);
        };
        ir_ensure!(
            module.kind(last).is_terminator(),
            "basic block in `{}` ends with `{}`",
            name,
            module.kind(last).mnemonic()
        );
        for &value in body {
            let kind = module.kind(value);
            ir_ensure!(
                !kind.is_terminator(),
                "`{}` in the middle of a basic block of `{}`",
                kind.mnemonic(),
                name
            );
            ir_ensure!(
                !(kind.is_block() || kind.is_marker() || kind.is_structured() || kind.is_loop_exit()),
                "`{}` left in `{}` after flattening",
                kind.mnemonic(),
                name
            );
        }
        for target in module.operands(last) {
            if module.kind(target).is_block() || module.kind(target).is_marker() {
                ir_ensure!(
                    blocks.contains(&target),
                    "branch in `{}` targets a block outside the function",
                    name
                );
            }
        }
    }
    Ok(())
}

/// No addressable abstraction survives; allocations sit in the entry block
pub fn materialized(module: &Module, function: ValueId) -> Result<()> {
    let blocks = module.function_blocks(function);
    for (index, &block) in blocks.iter().enumerate() {
        for &value in module.block_values(block) {
            let kind = module.kind(value);
            ir_ensure!(
                !(kind.is_addressable() || matches!(kind, ValueKind::GetAddressOf | ValueKind::Write)),
                "`{}` survived materialization in `{}`",
                kind.mnemonic(),
                module.name(function)
            );
            if matches!(kind, ValueKind::Alloca) {
                ir_ensure!(
                    index == 0,
                    "allocation outside the entry block of `{}`",
                    module.name(function)
                );
            }
        }
    }
    Ok(())
}

/// Runs every check up to `level` over all function bodies
pub fn module(module: &Module, level: VerifyLevel) -> Result<()> {
    def_use(module)?;
    parents(module)?;
    for function in module.all_functions() {
        if module.function_blocks(function).is_empty() {
            continue;
        }
        defined_before_used(module, function)?;
        if level >= VerifyLevel::Flat {
            branch_normal_form(module, function)?;
        }
        if level >= VerifyLevel::Lowered {
            materialized(module, function)?;
        }
    }
    for &global in &module.globals {
        ir_ensure!(
            module.kind(global).is_module_level(),
            "`{}` listed as a global",
            module.kind(global).mnemonic()
        );
    }
    debug!(module = %module.name, ?level, "verified");
    Ok(())
}
