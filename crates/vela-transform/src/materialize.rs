//! L-value Materialization
//!
//! Lowers addressable storage into memory operations, repeating until
//! nothing changes:
//!
//! - local variable → `alloca` at the top of the entry block, `deref` at
//!   each use
//! - field / array / pointer indexing on a `deref` → element address on the
//!   underlying pointer
//! - `address_of(deref p)` → `p`
//! - remaining `deref` → `store` when it is a write destination, a fresh
//!   `load` before every other use
//!
//! Globals become module-level `global_alloca` nodes first and then follow
//! the same path.

use crate::walk;
use tracing::{debug, trace};
use vela_ir::{ir_ensure, slot, verify, IrBuilder, Module, Result, Use, ValueId, ValueKind};

pub fn materialize_module(module: &mut Module) -> Result<()> {
    materialize_globals(module)?;
    for function in walk::defined_functions(module) {
        materialize_function(module, function)?;
    }
    Ok(())
}

/// Reads every use of `value` through a fresh `deref` of `pointer` placed
/// right before the user
fn deref_each_use(module: &mut Module, value: ValueId, pointer: ValueId) -> Result<()> {
    for u in module.uses(value).to_vec() {
        let deref = IrBuilder::before(module, u.user).deref(pointer)?;
        module.set_operand(u.user, u.index, deref)?;
    }
    Ok(())
}

fn materialize_globals(module: &mut Module) -> Result<()> {
    for position in 0..module.globals.len() {
        let global = module.globals[position];
        if !matches!(module.kind(global), ValueKind::GlobalVariable) {
            continue;
        }
        let name = module.name(global).to_string();
        for u in module.uses(global) {
            ir_ensure!(
                module.parent(u.user).is_some(),
                "global `{}` is read outside a function body",
                name
            );
        }
        let ty = module.ty(global);
        let pointer = module.types.pointer_to(ty);
        let storage = module.create_value(ValueKind::GlobalAlloca, pointer, name.as_str());
        module[storage].annotations = module[global].annotations.clone();
        module[storage].location = module[global].location.clone();

        deref_each_use(module, global, storage)?;
        module.globals[position] = storage;
        module.finalize(global)?;
        debug!(global = %name, "materialized global");
    }
    Ok(())
}

pub fn materialize_function(module: &mut Module, function: ValueId) -> Result<()> {
    let entry = module.entry_block(function)?;
    let mut rounds = 0;
    loop {
        let mut changed = hoist_locals(module, function, entry)?;
        changed |= spill_projection_objects(module, function)?;
        changed |= lower_projections(module, function)?;
        changed |= collapse_address_of(module, function)?;
        changed |= split_derefs(module, function)?;
        if !changed {
            break;
        }
        rounds += 1;
    }
    debug!(function = module.name(function), rounds, "materialized");
    verify::materialized(module, function)
}

// =========================================
// Locals
// =========================================

fn hoist_locals(module: &mut Module, function: ValueId, entry: ValueId) -> Result<bool> {
    let locals = walk::filter_function(module, function, |kind| {
        matches!(kind, ValueKind::LocalVariable)
    });
    for &local in &locals {
        let ty = module.ty(local);
        let pointer = module.types.pointer_to(ty);
        let name = module.name(local).to_string();
        let alloca = module.create_value(ValueKind::Alloca, pointer, name);
        module[alloca].location = module[local].location.clone();

        let position = module
            .block_values(entry)
            .iter()
            .take_while(|v| matches!(module.kind(**v), ValueKind::Alloca))
            .count();
        module.insert_into_block(entry, position, alloca)?;

        deref_each_use(module, local, alloca)?;
        module.finalize(local)?;
        trace!(local = module.name(alloca), "hoisted to the entry block");
    }
    Ok(!locals.is_empty())
}

// =========================================
// Projections
// =========================================

fn is_projection(kind: &ValueKind) -> bool {
    matches!(
        kind,
        ValueKind::AccessField { .. } | ValueKind::IndexArray | ValueKind::IndexPointer
    )
}

/// Gives projections of plain values (arguments, call results, loaded
/// pointers) a local to project from
fn spill_projection_objects(module: &mut Module, function: ValueId) -> Result<bool> {
    let projections = walk::filter_function(module, function, is_projection);
    let mut changed = false;
    for projection in projections {
        let object = module.operand(projection, slot::OBJECT)?;
        if module.kind(object).is_addressable() {
            continue;
        }
        let ty = module.ty(object);
        let mut builder = IrBuilder::before(module, projection);
        let temp = builder.local(ty, "spill")?;
        builder.write(object, temp)?;
        module.set_operand(projection, slot::OBJECT, temp)?;
        changed = true;
    }
    Ok(changed)
}

fn lower_projections(module: &mut Module, function: ValueId) -> Result<bool> {
    let projections = walk::filter_function(module, function, is_projection);
    let mut changed = false;
    for projection in projections {
        let object = module.operand(projection, slot::OBJECT)?;
        if !matches!(module.kind(object), ValueKind::Deref) {
            continue;
        }
        let pointer = module.operand(object, 0)?;
        let kind = module.kind(projection).clone();
        let mut builder = IrBuilder::before(module, projection);
        let element = match kind {
            ValueKind::AccessField { field } => builder.struct_element_ptr(pointer, field)?,
            ValueKind::IndexArray => {
                let index = builder.module.operand(projection, slot::INDEX)?;
                builder.array_element_ptr(pointer, index)?
            }
            _ => {
                let index = builder.module.operand(projection, slot::INDEX)?;
                builder.pointer_element_ptr(pointer, index)?
            }
        };
        deref_each_use(module, projection, element)?;
        module.finalize(projection)?;
        if module.uses(object).is_empty() {
            module.finalize(object)?;
        }
        changed = true;
    }
    Ok(changed)
}

// =========================================
// Addresses and dereferences
// =========================================

fn collapse_address_of(module: &mut Module, function: ValueId) -> Result<bool> {
    let addresses = walk::filter_function(module, function, |kind| {
        matches!(kind, ValueKind::GetAddressOf)
    });
    let mut changed = false;
    for address in addresses {
        let target = module.operand(address, 0)?;
        if !matches!(module.kind(target), ValueKind::Deref) {
            continue;
        }
        let pointer = module.operand(target, 0)?;
        module.replace_all_uses(address, pointer)?;
        module.finalize(address)?;
        if module.uses(target).is_empty() {
            module.finalize(target)?;
        }
        changed = true;
    }
    Ok(changed)
}

/// Uses that a later round folds into an address computation
fn is_pending_use(module: &Module, u: Use) -> bool {
    let kind = module.kind(u.user);
    (is_projection(kind) && u.index == slot::OBJECT) || matches!(kind, ValueKind::GetAddressOf)
}

fn split_derefs(module: &mut Module, function: ValueId) -> Result<bool> {
    let derefs = walk::filter_function(module, function, |kind| matches!(kind, ValueKind::Deref));
    let mut changed = false;
    for deref in derefs {
        let pointer = module.operand(deref, 0)?;
        for u in module.uses(deref).to_vec() {
            // a store may already have replaced this user
            if !module.contains(u.user) || is_pending_use(module, u) {
                continue;
            }
            let is_destination =
                matches!(module.kind(u.user), ValueKind::Write) && u.index == slot::WRITE_DEST;
            if is_destination {
                let value = module.operand(u.user, slot::WRITE_VALUE)?;
                let void = module.types.void();
                let store =
                    module.create_instruction(ValueKind::Store, void, &[value, pointer])?;
                module[store].location = module[u.user].location.clone();
                module.replace_in_block(u.user, store)?;
            } else {
                let load = IrBuilder::before(module, u.user).load(pointer)?;
                module.set_operand(u.user, u.index, load)?;
            }
            changed = true;
        }
        if module.uses(deref).is_empty() {
            module.finalize(deref)?;
            changed = true;
        }
    }
    Ok(changed)
}
