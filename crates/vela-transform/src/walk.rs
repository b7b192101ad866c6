//! Graph traversal helpers shared by the passes

use vela_ir::{Module, Result, ValueId, ValueKind};

/// Body blocks owned by a structured instruction, in operand order
pub fn bodies(module: &Module, value: ValueId) -> Vec<ValueId> {
    if !module.kind(value).is_structured() {
        return Vec::new();
    }
    module
        .operands(value)
        .filter(|operand| module.kind(*operand).is_block() && module.parent(*operand).is_none())
        .collect()
}

/// Every value under `block` in pre-order: a structured instruction comes
/// before the contents of its bodies
pub fn collect(module: &Module, block: ValueId) -> Vec<ValueId> {
    let mut out = Vec::new();
    collect_into(module, block, &mut out);
    out
}

fn collect_into(module: &Module, block: ValueId, out: &mut Vec<ValueId>) {
    for &value in module.block_values(block) {
        out.push(value);
        if module.kind(value).is_block() {
            collect_into(module, value, out);
        }
        for body in bodies(module, value) {
            collect_into(module, body, out);
        }
    }
}

/// Every value of a function body, in order
pub fn function_values(module: &Module, function: ValueId) -> Vec<ValueId> {
    module
        .function_blocks(function)
        .iter()
        .flat_map(|block| collect(module, *block))
        .collect()
}

/// Values of `function` matching `predicate`
pub fn filter_function<F>(module: &Module, function: ValueId, predicate: F) -> Vec<ValueId>
where
    F: Fn(&ValueKind) -> bool,
{
    function_values(module, function)
        .into_iter()
        .filter(|value| predicate(module.kind(*value)))
        .collect()
}

/// Functions with a body, host first
pub fn defined_functions(module: &Module) -> Vec<ValueId> {
    module
        .all_functions()
        .into_iter()
        .filter(|f| !module.function_blocks(*f).is_empty())
        .collect()
}

/// Moves every value of `block` right before `anchor`, emptying `block`
pub fn splice_before(module: &mut Module, block: ValueId, anchor: ValueId) -> Result<()> {
    for value in module.drain_block(block)? {
        module.insert_before(anchor, value)?;
    }
    Ok(())
}

/// Ancestor of `value` (possibly itself) positioned directly in `block`
pub fn ancestor_in(module: &Module, value: ValueId, block: ValueId) -> Option<ValueId> {
    let mut current = value;
    loop {
        match module.parent(current) {
            Some(parent) if parent == block => return Some(current),
            Some(parent) => current = parent,
            None if module.kind(current).is_block() => {
                current = module.owning_instruction(current)?;
            }
            None => return None,
        }
    }
}

/// Strips field and array projections down to the object they address
pub fn storage_root(module: &Module, mut value: ValueId) -> Result<ValueId> {
    while matches!(
        module.kind(value),
        ValueKind::AccessField { .. } | ValueKind::IndexArray
    ) {
        value = module.operand(value, vela_ir::slot::OBJECT)?;
    }
    Ok(value)
}
