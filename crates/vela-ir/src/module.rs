//! IR Module - the node arena and the graph-editing primitives
//!
//! All nodes of a translation unit live in one arena owned by the
//! [`Module`]. Blocks own the values positioned inside them; use lists and
//! parent links are plain ids and never keep a node alive. A node leaves
//! the arena only through [`Module::finalize`], which refuses to drop a
//! node something still reads.

use crate::error::{IrError, Result};
use crate::types::{TypeId, TypeTable};
use crate::value::{annotation, Annotations, BlockData, FunctionData, Use, ValueData, ValueId, ValueKind};
use crate::{ir_bail, ir_ensure};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;
use tracing::trace;

/// Code generation target of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Host,
    Nvptx,
    Amdgpu,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Host => "host",
            Target::Nvptx => "nvptx",
            Target::Amdgpu => "amdgpu",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "host" => Ok(Target::Host),
            "nvptx" => Ok(Target::Nvptx),
            "amdgpu" => Ok(Target::Amdgpu),
            other => Err(format!("unknown target `{}`", other)),
        }
    }
}

/// Functions compiled for one device target
#[derive(Debug, Default)]
pub struct TargetModule {
    pub functions: Vec<ValueId>,
}

/// IR Module - one translation unit
#[derive(Debug)]
pub struct Module {
    /// Module name
    pub name: String,
    /// Types used by the module
    pub types: TypeTable,
    values: SlotMap<ValueId, ValueData>,
    /// Host functions, in definition order
    pub functions: Vec<ValueId>,
    /// Global variables and global allocations
    pub globals: Vec<ValueId>,
    /// Device sub-modules keyed by target
    pub targets: BTreeMap<Target, TargetModule>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: TypeTable::new(),
            values: SlotMap::with_key(),
            functions: Vec::new(),
            globals: Vec::new(),
            targets: BTreeMap::new(),
        }
    }

    // =========================================
    // Lookup
    // =========================================

    pub fn contains(&self, id: ValueId) -> bool {
        self.values.contains_key(id)
    }

    pub fn get(&self, id: ValueId) -> Result<&ValueData> {
        self.values
            .get(id)
            .ok_or_else(|| IrError::StructuralViolation(format!("dangling reference to {:?}", id)))
    }

    fn get_mut(&mut self, id: ValueId) -> Result<&mut ValueData> {
        self.values
            .get_mut(id)
            .ok_or_else(|| IrError::StructuralViolation(format!("dangling reference to {:?}", id)))
    }

    /// Kind of a live node.
    ///
    /// # Panics
    ///
    /// Panics if `id` was finalized, as do [`Module::ty`], [`Module::name`],
    /// the annotation accessors and indexing. Use [`Module::get`] where a
    /// node may be gone.
    pub fn kind(&self, id: ValueId) -> &ValueKind {
        &self[id].kind
    }

    pub fn ty(&self, id: ValueId) -> TypeId {
        self[id].ty
    }

    pub fn name(&self, id: ValueId) -> &str {
        &self[id].name
    }

    pub fn annotations(&self, id: ValueId) -> &Annotations {
        &self[id].annotations
    }

    pub fn annotations_mut(&mut self, id: ValueId) -> &mut Annotations {
        &mut self[id].annotations
    }

    pub fn has_annotation(&self, id: ValueId, key: &str) -> bool {
        self.annotations(id).has(key)
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &ValueData)> {
        self.values.iter()
    }

    // =========================================
    // Creation
    // =========================================

    /// Creates an unattached node without operands
    pub fn create_value(&mut self, kind: ValueKind, ty: TypeId, name: impl Into<String>) -> ValueId {
        self.values.insert(ValueData::new(kind, ty, name))
    }

    /// Creates an unattached instruction reading `operands`
    pub fn create_instruction(
        &mut self,
        kind: ValueKind,
        ty: TypeId,
        operands: &[ValueId],
    ) -> Result<ValueId> {
        if let Some(arity) = kind.arity() {
            ir_ensure!(
                operands.len() == arity,
                "`{}` takes {} operands, got {}",
                kind.mnemonic(),
                arity,
                operands.len()
            );
        }
        let id = self.create_value(kind, ty, "");
        for &operand in operands {
            self.push_operand(id, operand)?;
        }
        Ok(id)
    }

    pub fn create_block(&mut self) -> ValueId {
        let void = self.types.void();
        self.create_value(ValueKind::Block(BlockData::default()), void, "")
    }

    pub fn create_marker(&mut self, name: impl Into<String>) -> ValueId {
        let void = self.types.void();
        self.create_value(ValueKind::Marker, void, name)
    }

    /// Creates a host function with one argument per parameter
    pub fn create_function(
        &mut self,
        name: impl Into<String>,
        params: &[(&str, TypeId)],
        return_type: TypeId,
    ) -> ValueId {
        let param_types = params.iter().map(|(_, ty)| *ty).collect();
        let fn_ty = self.types.function(param_types, return_type);
        let args = params
            .iter()
            .map(|(name, ty)| self.create_value(ValueKind::Argument, *ty, *name))
            .collect();
        let function = self.create_value(
            ValueKind::Function(FunctionData {
                params: args,
                blocks: Vec::new(),
            }),
            fn_ty,
            name,
        );
        self.functions.push(function);
        function
    }

    /// Creates a global variable
    pub fn create_global(&mut self, name: impl Into<String>, ty: TypeId) -> ValueId {
        let global = self.create_value(ValueKind::GlobalVariable, ty, name);
        self.globals.push(global);
        global
    }

    /// Creates a detached copy of a constant
    pub fn clone_constant(&mut self, constant: ValueId) -> Result<ValueId> {
        let data = self.get(constant)?;
        ir_ensure!(data.kind.is_constant(), "`{}` is not a constant", data.kind.mnemonic());
        let (kind, ty, name) = (data.kind.clone(), data.ty, data.name.clone());
        Ok(self.create_value(kind, ty, name))
    }

    // =========================================
    // Operands and uses
    // =========================================

    pub fn operand_count(&self, id: ValueId) -> usize {
        self[id].operands.len()
    }

    /// Reads operand `index`; empty or missing slots are violations
    pub fn operand(&self, id: ValueId, index: usize) -> Result<ValueId> {
        let data = self.get(id)?;
        match data.operands.get(index) {
            Some(Some(value)) => Ok(*value),
            Some(None) => ir_bail!("operand {} of `{}` is empty", index, data.kind.mnemonic()),
            None => ir_bail!("`{}` has no operand {}", data.kind.mnemonic(), index),
        }
    }

    pub fn operands(&self, id: ValueId) -> impl Iterator<Item = ValueId> + '_ {
        self[id].operands.iter().flatten().copied()
    }

    pub fn uses(&self, id: ValueId) -> &[Use] {
        &self[id].uses
    }

    /// Distinct users, in use-list order
    pub fn users(&self, id: ValueId) -> Vec<ValueId> {
        let mut users: Vec<ValueId> = Vec::new();
        for u in self.uses(id) {
            if !users.contains(&u.user) {
                users.push(u.user);
            }
        }
        users
    }

    fn unlink_use(&mut self, value: ValueId, u: Use) -> Result<()> {
        let uses = &mut self.get_mut(value)?.uses;
        match uses.iter().position(|x| *x == u) {
            Some(pos) => {
                uses.remove(pos);
                Ok(())
            }
            None => ir_bail!("use list of {:?} misses slot {} of {:?}", value, u.index, u.user),
        }
    }

    /// Points slot `index` of `inst` at `value`, rewiring both use lists
    pub fn set_operand(&mut self, inst: ValueId, index: usize, value: ValueId) -> Result<()> {
        ir_ensure!(self.contains(value), "operand {} set to a dangling value", index);
        let data = self.get(inst)?;
        ir_ensure!(
            index < data.operands.len(),
            "`{}` has no operand {}",
            data.kind.mnemonic(),
            index
        );
        let old = data.operands[index];
        if old == Some(value) {
            return Ok(());
        }
        let u = Use::new(inst, index);
        if let Some(old) = old {
            self.unlink_use(old, u)?;
        }
        self[inst].operands[index] = Some(value);
        self[value].uses.push(u);
        trace!(?inst, index, ?value, "set operand");
        Ok(())
    }

    /// Appends an operand slot reading `value`
    pub fn push_operand(&mut self, inst: ValueId, value: ValueId) -> Result<()> {
        let index = {
            let operands = &mut self.get_mut(inst)?.operands;
            operands.push(None);
            operands.len() - 1
        };
        self.set_operand(inst, index, value)
    }

    /// Empties every operand slot of `inst`
    fn clear_operands(&mut self, inst: ValueId) -> Result<()> {
        let operands = std::mem::take(&mut self.get_mut(inst)?.operands);
        for (index, operand) in operands.into_iter().enumerate() {
            if let Some(operand) = operand {
                self.unlink_use(operand, Use::new(inst, index))?;
            }
        }
        Ok(())
    }

    /// Rewires every use of `old` to `new`
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> Result<()> {
        ir_ensure!(old != new, "cannot replace a value with itself");
        let uses = self.get(old)?.uses.clone();
        for u in uses {
            self.set_operand(u.user, u.index, new)?;
        }
        Ok(())
    }

    // =========================================
    // Blocks
    // =========================================

    pub fn block_data(&self, block: ValueId) -> Result<&BlockData> {
        match &self.get(block)?.kind {
            ValueKind::Block(data) => Ok(data),
            other => ir_bail!("expected a block, found `{}`", other.mnemonic()),
        }
    }

    fn block_data_mut(&mut self, block: ValueId) -> Result<&mut BlockData> {
        match &mut self.get_mut(block)?.kind {
            ValueKind::Block(data) => Ok(data),
            other => ir_bail!("expected a block, found `{}`", other.mnemonic()),
        }
    }

    /// Values of a block in order; empty for non-blocks
    pub fn block_values(&self, block: ValueId) -> &[ValueId] {
        match &self[block].kind {
            ValueKind::Block(data) => &data.values,
            _ => &[],
        }
    }

    /// Block currently containing `value`
    pub fn parent(&self, value: ValueId) -> Option<ValueId> {
        self[value].parent
    }

    /// Index of `value` inside its block
    pub fn position(&self, value: ValueId) -> Result<usize> {
        let Some(block) = self.get(value)?.parent else {
            ir_bail!("`{}` is not inside a block", self.kind(value).mnemonic());
        };
        match self.block_data(block)?.values.iter().position(|v| *v == value) {
            Some(pos) => Ok(pos),
            None => ir_bail!("parent block of {:?} does not contain it", value),
        }
    }

    /// Inserts an unattached value at `position` in `block`
    pub fn insert_into_block(&mut self, block: ValueId, position: usize, value: ValueId) -> Result<()> {
        let data = self.get(value)?;
        ir_ensure!(
            data.parent.is_none(),
            "`{}` already belongs to a block",
            data.kind.mnemonic()
        );
        ir_ensure!(
            !data.kind.is_module_level(),
            "`{}` cannot be placed in a block",
            data.kind.mnemonic()
        );
        ir_ensure!(block != value, "a block cannot contain itself");
        let values = &mut self.block_data_mut(block)?.values;
        ir_ensure!(position <= values.len(), "insert position {} out of range", position);
        values.insert(position, value);
        self[value].parent = Some(block);
        Ok(())
    }

    pub fn push_back(&mut self, block: ValueId, value: ValueId) -> Result<()> {
        let len = self.block_data(block)?.values.len();
        self.insert_into_block(block, len, value)
    }

    pub fn push_front(&mut self, block: ValueId, value: ValueId) -> Result<()> {
        self.insert_into_block(block, 0, value)
    }

    pub fn insert_before(&mut self, anchor: ValueId, value: ValueId) -> Result<()> {
        let position = self.position(anchor)?;
        let block = self.parent(anchor).ok_or_else(|| {
            IrError::StructuralViolation("anchor is not inside a block".into())
        })?;
        self.insert_into_block(block, position, value)
    }

    pub fn insert_after(&mut self, anchor: ValueId, value: ValueId) -> Result<()> {
        let position = self.position(anchor)?;
        let block = self.parent(anchor).ok_or_else(|| {
            IrError::StructuralViolation("anchor is not inside a block".into())
        })?;
        self.insert_into_block(block, position + 1, value)
    }

    /// Detaches `value` from its block; uses are left untouched
    pub fn remove_from_block(&mut self, value: ValueId) -> Result<()> {
        let position = self.position(value)?;
        if let Some(block) = self[value].parent.take() {
            self.block_data_mut(block)?.values.remove(position);
        }
        Ok(())
    }

    /// Takes every value out of `block`, returning them in order
    pub fn drain_block(&mut self, block: ValueId) -> Result<Vec<ValueId>> {
        let values = std::mem::take(&mut self.block_data_mut(block)?.values);
        for &value in &values {
            self[value].parent = None;
        }
        Ok(values)
    }

    /// Puts `new` at the position of `old`, moves all uses over and
    /// finalizes `old`
    pub fn replace_in_block(&mut self, old: ValueId, new: ValueId) -> Result<()> {
        self.insert_before(old, new)?;
        self.replace_all_uses(old, new)?;
        self.remove_from_block(old)?;
        self.finalize(old)
    }

    /// Destroys a node whose use list is already empty
    pub fn finalize(&mut self, value: ValueId) -> Result<()> {
        let data = self.get(value)?;
        if !data.uses.is_empty() {
            let users: Vec<_> = data
                .uses
                .iter()
                .map(|u| self.kind(u.user).mnemonic())
                .collect();
            ir_bail!(
                "finalizing `{}` {} still used by {:?}",
                data.kind.mnemonic(),
                data.name,
                users
            );
        }
        let attached = data.parent.is_some();
        let owner = match &data.kind {
            ValueKind::Block(block) => {
                ir_ensure!(block.values.is_empty(), "finalizing a non-empty block");
                block.function
            }
            ValueKind::Function(_) => ir_bail!("functions are never finalized"),
            _ => None,
        };
        if let Some(function) = owner {
            self.function_data_mut(function)?.blocks.retain(|b| *b != value);
        }
        if attached {
            self.remove_from_block(value)?;
        }
        self.clear_operands(value)?;
        self.values.remove(value);
        trace!(?value, "finalized");
        Ok(())
    }

    // =========================================
    // Functions
    // =========================================

    pub fn function_data(&self, function: ValueId) -> Result<&FunctionData> {
        match &self.get(function)?.kind {
            ValueKind::Function(data) => Ok(data),
            other => ir_bail!("expected a function, found `{}`", other.mnemonic()),
        }
    }

    fn function_data_mut(&mut self, function: ValueId) -> Result<&mut FunctionData> {
        match &mut self.get_mut(function)?.kind {
            ValueKind::Function(data) => Ok(data),
            other => ir_bail!("expected a function, found `{}`", other.mnemonic()),
        }
    }

    pub fn params(&self, function: ValueId) -> &[ValueId] {
        match &self[function].kind {
            ValueKind::Function(data) => &data.params,
            _ => &[],
        }
    }

    pub fn function_blocks(&self, function: ValueId) -> &[ValueId] {
        match &self[function].kind {
            ValueKind::Function(data) => &data.blocks,
            _ => &[],
        }
    }

    pub fn entry_block(&self, function: ValueId) -> Result<ValueId> {
        match self.function_data(function)?.blocks.first() {
            Some(block) => Ok(*block),
            None => ir_bail!("function `{}` has no body", self.name(function)),
        }
    }

    pub fn return_type(&self, function: ValueId) -> Result<TypeId> {
        match self.types.return_type(self.ty(function)) {
            Some(ty) => Ok(ty),
            None => ir_bail!("`{}` does not have a function type", self.name(function)),
        }
    }

    /// Creates a new body block at the end of `function`
    pub fn append_function_block(&mut self, function: ValueId) -> Result<ValueId> {
        self.function_data(function)?;
        let block = self.create_block();
        self.block_data_mut(block)?.function = Some(function);
        self.function_data_mut(function)?.blocks.push(block);
        Ok(block)
    }

    /// Replaces the body block list of `function`
    pub fn set_function_blocks(&mut self, function: ValueId, blocks: Vec<ValueId>) -> Result<()> {
        let old = std::mem::take(&mut self.function_data_mut(function)?.blocks);
        for block in old {
            if self.contains(block) {
                self.block_data_mut(block)?.function = None;
            }
        }
        for &block in &blocks {
            self.block_data_mut(block)?.function = Some(function);
        }
        self.function_data_mut(function)?.blocks = blocks;
        Ok(())
    }

    /// Structured instruction owning `block` as a body, if any
    pub fn owning_instruction(&self, block: ValueId) -> Option<ValueId> {
        self.uses(block)
            .iter()
            .map(|u| u.user)
            .find(|user| self.kind(*user).is_structured())
    }

    /// Function whose body contains `value`, climbing nested bodies
    pub fn function_of(&self, value: ValueId) -> Option<ValueId> {
        let mut current = value;
        loop {
            if let ValueKind::Block(data) = &self.get(current).ok()?.kind {
                if let Some(function) = data.function {
                    return Some(function);
                }
                if self.parent(current).is_none() {
                    current = self.owning_instruction(current)?;
                    continue;
                }
            }
            current = self.parent(current)?;
        }
    }

    /// Host functions followed by every target's functions
    pub fn all_functions(&self) -> Vec<ValueId> {
        self.functions
            .iter()
            .chain(self.targets.values().flat_map(|t| t.functions.iter()))
            .copied()
            .collect()
    }

    /// Moves a host function into the sub-module of `target`
    pub fn move_to_target(&mut self, function: ValueId, target: Target) -> Result<()> {
        self.function_data(function)?;
        self.functions.retain(|f| *f != function);
        self.targets.entry(target).or_default().functions.push(function);
        self.annotations_mut(function)
            .insert(annotation::TARGET, target.as_str());
        Ok(())
    }

    pub fn target_functions(&self, target: Target) -> &[ValueId] {
        self.targets
            .get(&target)
            .map(|t| t.functions.as_slice())
            .unwrap_or(&[])
    }

    /// Finds a function by name, host first
    pub fn find_function(&self, name: &str) -> Option<ValueId> {
        self.all_functions().into_iter().find(|f| self.name(*f) == name)
    }
}

/// Panics on a finalized id
impl Index<ValueId> for Module {
    type Output = ValueData;

    fn index(&self, id: ValueId) -> &ValueData {
        match self.values.get(id) {
            Some(data) => data,
            None => panic!("use of finalized value {:?}", id),
        }
    }
}

impl IndexMut<ValueId> for Module {
    fn index_mut(&mut self, id: ValueId) -> &mut ValueData {
        match self.values.get_mut(id) {
            Some(data) => data,
            None => panic!("use of finalized value {:?}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::BinaryOp;

    fn setup() -> (Module, ValueId, ValueId) {
        let mut module = Module::new("test");
        let void = module.types.void();
        let f = module.create_function("main", &[], void);
        let entry = module.append_function_block(f).unwrap();
        (module, f, entry)
    }

    fn constant(module: &mut Module, block: ValueId, v: i64) -> ValueId {
        let i64_ty = module.types.i64();
        let c = module.create_value(ValueKind::ConstInt(v), i64_ty, "");
        module.push_back(block, c).unwrap();
        c
    }

    #[test]
    fn test_set_operand_rewires_both_sides() {
        let (mut module, _, entry) = setup();
        let a = constant(&mut module, entry, 1);
        let b = constant(&mut module, entry, 2);
        let c = constant(&mut module, entry, 3);
        let i64_ty = module.types.i64();
        let add = module
            .create_instruction(ValueKind::Binary(BinaryOp::Add), i64_ty, &[a, b])
            .unwrap();

        assert_eq!(module.uses(a), &[Use::new(add, 0)]);
        module.set_operand(add, 0, c).unwrap();
        assert!(module.uses(a).is_empty());
        assert_eq!(module.uses(c), &[Use::new(add, 0)]);
        assert_eq!(module.operand(add, 0).unwrap(), c);
    }

    #[test]
    fn test_set_operand_out_of_range() {
        let (mut module, _, entry) = setup();
        let a = constant(&mut module, entry, 1);
        let void = module.types.void();
        let ret = module
            .create_instruction(ValueKind::Return, void, &[a])
            .unwrap();
        assert!(matches!(
            module.set_operand(ret, 3, a),
            Err(IrError::StructuralViolation(_))
        ));
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        let (mut module, _, entry) = setup();
        let a = constant(&mut module, entry, 1);
        let i64_ty = module.types.i64();
        let result = module.create_instruction(ValueKind::Binary(BinaryOp::Add), i64_ty, &[a]);
        assert!(result.is_err());
    }

    #[test]
    #[should_panic(expected = "finalized value")]
    fn test_kind_of_finalized_value_panics() {
        let (mut module, _, entry) = setup();
        let c = constant(&mut module, entry, 1);
        module.finalize(c).unwrap();
        assert!(module.get(c).is_err());
        module.kind(c);
    }

    #[test]
    fn test_finalize_requires_empty_use_list() {
        let (mut module, _, entry) = setup();
        let a = constant(&mut module, entry, 1);
        let void = module.types.void();
        let ret = module
            .create_instruction(ValueKind::Return, void, &[a])
            .unwrap();
        module.push_back(entry, ret).unwrap();

        assert!(module.finalize(a).is_err());
        module.finalize(ret).unwrap();
        assert!(module.uses(a).is_empty());
        module.finalize(a).unwrap();
        assert!(module.block_values(entry).is_empty());
    }

    #[test]
    fn test_insert_attached_value_fails() {
        let (mut module, _, entry) = setup();
        let a = constant(&mut module, entry, 1);
        assert!(module.push_back(entry, a).is_err());
    }

    #[test]
    fn test_replace_in_block_keeps_position() {
        let (mut module, _, entry) = setup();
        let a = constant(&mut module, entry, 1);
        let b = constant(&mut module, entry, 2);
        let void = module.types.void();
        let ret = module
            .create_instruction(ValueKind::Return, void, &[a])
            .unwrap();
        module.push_back(entry, ret).unwrap();

        let i64_ty = module.types.i64();
        let replacement = module.create_value(ValueKind::ConstInt(10), i64_ty, "");
        module.replace_in_block(a, replacement).unwrap();

        assert!(!module.contains(a));
        assert_eq!(module.block_values(entry), &[replacement, b, ret]);
        assert_eq!(module.operand(ret, 0).unwrap(), replacement);
    }

    #[test]
    fn test_function_of_climbs_nested_bodies() {
        let (mut module, f, entry) = setup();
        let bool_ty = module.types.bool();
        let void = module.types.void();
        let cond = module.create_value(ValueKind::ConstBool(true), bool_ty, "");
        module.push_back(entry, cond).unwrap();
        let then_block = module.create_block();
        let else_block = module.create_block();
        let branch = module
            .create_instruction(ValueKind::If, void, &[cond, then_block, else_block])
            .unwrap();
        module.push_back(entry, branch).unwrap();
        let inner = constant(&mut module, then_block, 4);

        assert_eq!(module.function_of(inner), Some(f));
        assert_eq!(module.owning_instruction(then_block), Some(branch));
    }

    #[test]
    fn test_move_to_target() {
        let (mut module, f, _) = setup();
        module.move_to_target(f, Target::Nvptx).unwrap();
        assert!(module.functions.is_empty());
        assert_eq!(module.target_functions(Target::Nvptx), &[f]);
        assert_eq!(module.annotations(f).first("target"), Some("nvptx"));
    }
}
