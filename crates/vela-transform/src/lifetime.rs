//! Lifetime Management
//!
//! Inserts initialize/copy/destroy hook calls so lifetime-managed types get
//! value semantics. Runs on the structured tree, where scopes are still
//! visible, in four steps per function:
//!
//! 1. initialize every local right after its declaration
//! 2. destroy the old contents before each write, copy the new ones after
//! 3. destroy call results after their last use (unless returned), copy
//!    non-call values flowing into a return
//! 4. destroy the locals of every scope the control flow leaves
//!
//! Every node created here is flagged `lifetime.inserted` and every handled
//! node `lifetime.done`, so a second run inserts nothing.

use crate::walk;
use tracing::{debug, trace};
use vela_ir::{
    annotation, slot, HookKind, InsertPoint, IrBuilder, Module, Result, ValueId, ValueKind,
};

pub fn insert_lifetime_calls(module: &mut Module) -> Result<()> {
    for function in walk::defined_functions(module) {
        insert_function_lifetime_calls(module, function)?;
    }
    Ok(())
}

pub fn insert_function_lifetime_calls(module: &mut Module, function: ValueId) -> Result<()> {
    let top = module.entry_block(function)?;
    if module.has_annotation(top, annotation::LIFETIME_DONE) {
        return Ok(());
    }
    debug!(function = module.name(function), "inserting lifetime calls");

    insert_initializers(module, function)?;
    insert_write_hooks(module, function)?;
    insert_call_and_return_hooks(module, function)?;
    for block in module.function_blocks(function).to_vec() {
        destroy_scope_locals(module, block, &mut Vec::new())?;
    }

    module.annotations_mut(top).flag(annotation::LIFETIME_DONE);
    Ok(())
}

fn hook_builder(module: &mut Module, point: InsertPoint) -> IrBuilder<'_> {
    IrBuilder::new(module, point)
        .stamp(annotation::LIFETIME_INSERTED)
        .stamp(annotation::LIFETIME_DONE)
}

fn is_pending(module: &Module, value: ValueId) -> bool {
    !module.has_annotation(value, annotation::LIFETIME_INSERTED)
        && !module.has_annotation(value, annotation::LIFETIME_DONE)
}

fn mark_done(module: &mut Module, value: ValueId) {
    module.annotations_mut(value).flag(annotation::LIFETIME_DONE);
}

/// Emits the `kind` hooks of `object`: hookable fields first, innermost
/// first, then the hook of the whole object
pub fn emit_hooks(builder: &mut IrBuilder<'_>, object: ValueId, kind: HookKind) -> Result<()> {
    let types = &builder.module.types;
    let ty = builder.module.ty(object);
    if !types.is_hookable(ty, kind) {
        return Ok(());
    }
    let fields: Vec<usize> = types
        .fields(ty)
        .iter()
        .enumerate()
        .filter(|(_, field)| types.is_hookable(field.ty, kind))
        .map(|(index, _)| index)
        .collect();
    let hook = types.hook(ty, kind);

    for field in fields {
        let access = builder.access_field(object, field)?;
        emit_hooks(builder, access, kind)?;
    }
    if let Some(hook) = hook {
        let this = builder.address_of(object)?;
        builder.call(hook, &[this])?;
        trace!(hook = kind.as_str(), "inserted hook call");
    }
    Ok(())
}

/// Stores a non-addressable value into a fresh local so hooks can take its
/// address
fn spill(builder: &mut IrBuilder<'_>, value: ValueId) -> Result<ValueId> {
    if builder.module.kind(value).is_addressable() {
        return Ok(value);
    }
    let ty = builder.module.ty(value);
    let temp = builder.local(ty, "lifetime.tmp")?;
    builder.write(value, temp)?;
    Ok(temp)
}

// =========================================
// Declarations
// =========================================

fn insert_initializers(module: &mut Module, function: ValueId) -> Result<()> {
    let locals = walk::filter_function(module, function, |kind| {
        matches!(kind, ValueKind::LocalVariable)
    });
    for local in locals {
        if !is_pending(module, local) {
            continue;
        }
        let ty = module.ty(local);
        if module.types.is_initialize_hookable(ty) {
            let location = module[local].location.clone();
            let point = IrBuilder::point_after(module, local)?;
            let mut builder = hook_builder(module, point);
            builder.set_location(location);
            emit_hooks(&mut builder, local, HookKind::Initialize)?;
        }
        mark_done(module, local);
    }
    Ok(())
}

// =========================================
// Overwrites
// =========================================

fn insert_write_hooks(module: &mut Module, function: ValueId) -> Result<()> {
    let writes = walk::filter_function(module, function, |kind| matches!(kind, ValueKind::Write));
    for write in writes {
        if !is_pending(module, write) {
            continue;
        }
        let destination = module.operand(write, slot::WRITE_DEST)?;
        let ty = module.ty(destination);
        let location = module[write].location.clone();

        if module.types.is_destroy_hookable(ty) {
            let mut builder = hook_builder(module, InsertPoint::Before(write));
            builder.set_location(location.clone());
            emit_hooks(&mut builder, destination, HookKind::Destroy)?;
        }
        if module.types.is_copy_hookable(ty) {
            let point = IrBuilder::point_after(module, write)?;
            let mut builder = hook_builder(module, point);
            builder.set_location(location);
            emit_hooks(&mut builder, destination, HookKind::Copy)?;
        }
        mark_done(module, write);
    }
    Ok(())
}

// =========================================
// Calls and returns
// =========================================

/// Where to destroy a call result: after its last use in the call's block
/// and after the hooks already inserted behind that use, so the copy of a
/// written-to destination sees the result alive
fn destroy_point(module: &Module, call: ValueId) -> Result<InsertPoint> {
    let Some(block) = module.parent(call) else {
        vela_ir::ir_bail!("call is not inside a block");
    };
    let mut last = call;
    let mut last_position = module.position(call)?;
    for user in module.users(call) {
        let Some(anchor) = walk::ancestor_in(module, user, block) else {
            continue;
        };
        let position = module.position(anchor)?;
        if position > last_position {
            last = anchor;
            last_position = position;
        }
    }
    let kind = module.kind(last);
    if kind.is_terminator() || kind.is_loop_exit() {
        return Ok(InsertPoint::Before(last));
    }
    let values = module.block_values(block);
    let next = values[last_position + 1..]
        .iter()
        .find(|value| !module.has_annotation(**value, annotation::LIFETIME_INSERTED));
    Ok(match next {
        Some(&anchor) => InsertPoint::Before(anchor),
        None => InsertPoint::End(block),
    })
}

fn insert_call_and_return_hooks(module: &mut Module, function: ValueId) -> Result<()> {
    let calls = walk::filter_function(module, function, |kind| matches!(kind, ValueKind::Call));
    for call in calls {
        if !is_pending(module, call) {
            continue;
        }
        mark_done(module, call);
        let ty = module.ty(call);
        if !module.types.is_destroy_hookable(ty) {
            continue;
        }
        // Returned directly: ownership moves to the caller
        let returned = module
            .users(call)
            .iter()
            .any(|user| matches!(module.kind(*user), ValueKind::Return));
        if returned {
            continue;
        }
        let location = module[call].location.clone();
        let point = destroy_point(module, call)?;
        let mut builder = hook_builder(module, point);
        builder.set_location(location);
        let temp = spill(&mut builder, call)?;
        emit_hooks(&mut builder, temp, HookKind::Destroy)?;
    }

    let returns = walk::filter_function(module, function, |kind| matches!(kind, ValueKind::Return));
    for ret in returns {
        if !is_pending(module, ret) {
            continue;
        }
        mark_done(module, ret);
        let value = module.operand(ret, 0)?;
        if matches!(module.kind(value), ValueKind::Call) {
            continue;
        }
        if !module.types.is_copy_hookable(module.ty(value)) {
            continue;
        }
        let location = module[ret].location.clone();
        let mut builder = hook_builder(module, InsertPoint::Before(ret));
        builder.set_location(location);
        let object = spill(&mut builder, value)?;
        emit_hooks(&mut builder, object, HookKind::Copy)?;
        if object != value {
            module.set_operand(ret, 0, object)?;
        }
    }
    Ok(())
}

// =========================================
// Scope exit
// =========================================

struct Scope {
    /// Destroy-hookable locals in declaration order
    locals: Vec<ValueId>,
    /// Loop instruction whose body this scope is
    loop_body_of: Option<ValueId>,
}

fn destroy_locals(module: &mut Module, point: InsertPoint, scopes: &[Scope]) -> Result<()> {
    let mut builder = hook_builder(module, point);
    for scope in scopes.iter().rev() {
        for &local in scope.locals.iter().rev() {
            emit_hooks(&mut builder, local, HookKind::Destroy)?;
        }
    }
    Ok(())
}

fn enter_scope(
    module: &mut Module,
    block: ValueId,
    loop_body_of: Option<ValueId>,
    scopes: &mut Vec<Scope>,
) -> Result<()> {
    scopes.push(Scope {
        locals: Vec::new(),
        loop_body_of,
    });
    let result = walk_scope(module, block, scopes);
    scopes.pop();
    result
}

fn destroy_scope_locals(module: &mut Module, block: ValueId, scopes: &mut Vec<Scope>) -> Result<()> {
    enter_scope(module, block, None, scopes)
}

fn walk_scope(module: &mut Module, block: ValueId, scopes: &mut Vec<Scope>) -> Result<()> {
    let values = module.block_values(block).to_vec();
    let mut exited = false;
    for value in values {
        match module.kind(value) {
            ValueKind::LocalVariable => {
                let managed = module.types.is_destroy_hookable(module.ty(value));
                if managed && !module.has_annotation(value, annotation::LIFETIME_INSERTED) {
                    if let Some(scope) = scopes.last_mut() {
                        scope.locals.push(value);
                    }
                }
            }
            ValueKind::Block(_) => enter_scope(module, value, None, scopes)?,
            ValueKind::If => {
                enter_scope(module, module.operand(value, slot::IF_THEN)?, None, scopes)?;
                enter_scope(module, module.operand(value, slot::IF_ELSE)?, None, scopes)?;
            }
            ValueKind::While => {
                let condition_block = module.operand(value, slot::WHILE_CONDITION_BLOCK)?;
                let body = module.operand(value, slot::WHILE_BODY)?;
                enter_scope(module, condition_block, None, scopes)?;
                enter_scope(module, body, Some(value), scopes)?;
            }
            ValueKind::For => {
                let body = module.operand(value, slot::FOR_BODY)?;
                enter_scope(module, body, Some(value), scopes)?;
            }
            ValueKind::Return => {
                destroy_locals(module, InsertPoint::Before(value), scopes)?;
                exited = true;
                break;
            }
            ValueKind::Break | ValueKind::Continue => {
                let target = module.operand(value, 0)?;
                let depth = scopes
                    .iter()
                    .rposition(|scope| scope.loop_body_of == Some(target))
                    .unwrap_or(0);
                destroy_locals(module, InsertPoint::Before(value), &scopes[depth..])?;
                exited = true;
                break;
            }
            _ => {}
        }
    }
    if !exited {
        if let Some(scope) = scopes.last() {
            let own = std::slice::from_ref(scope);
            destroy_locals(module, InsertPoint::End(block), own)?;
        }
    }
    Ok(())
}
