//! IR Builder
//!
//! Creates typed nodes and places them at an insertion point. Used by
//! lowering and by every pass that synthesizes code.

use crate::error::{IrError, Result};
use crate::ir_ensure;
use crate::module::Module;
use crate::types::TypeId;
use crate::value::{BinaryOp, CompareOp, DeviceIndex, ValueId, ValueKind};
use vela_error::SourceLocation;

/// Where the builder places the next node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    /// Append to the end of a block
    End(ValueId),
    /// Insert right before an anchor, keeping emission order
    Before(ValueId),
}

pub struct IrBuilder<'m> {
    pub module: &'m mut Module,
    point: InsertPoint,
    location: Option<SourceLocation>,
    stamps: Vec<&'static str>,
}

impl<'m> IrBuilder<'m> {
    pub fn new(module: &'m mut Module, point: InsertPoint) -> Self {
        Self {
            module,
            point,
            location: None,
            stamps: Vec::new(),
        }
    }

    pub fn at_end(module: &'m mut Module, block: ValueId) -> Self {
        Self::new(module, InsertPoint::End(block))
    }

    pub fn before(module: &'m mut Module, anchor: ValueId) -> Self {
        Self::new(module, InsertPoint::Before(anchor))
    }

    /// Positions the builder right after `anchor`
    pub fn after(module: &'m mut Module, anchor: ValueId) -> Result<Self> {
        let point = Self::point_after(module, anchor)?;
        Ok(Self::new(module, point))
    }

    /// Insertion point right after `anchor`
    pub fn point_after(module: &Module, anchor: ValueId) -> Result<InsertPoint> {
        let block = module.parent(anchor).ok_or_else(|| {
            IrError::StructuralViolation("anchor is not inside a block".into())
        })?;
        let position = module.position(anchor)?;
        Ok(match module.block_values(block).get(position + 1) {
            Some(next) => InsertPoint::Before(*next),
            None => InsertPoint::End(block),
        })
    }

    pub fn point(&self) -> InsertPoint {
        self.point
    }

    pub fn set_point(&mut self, point: InsertPoint) {
        self.point = point;
    }

    pub fn set_after(&mut self, anchor: ValueId) -> Result<()> {
        self.point = Self::point_after(self.module, anchor)?;
        Ok(())
    }

    /// Block the next node lands in
    pub fn block(&self) -> Result<ValueId> {
        match self.point {
            InsertPoint::End(block) => Ok(block),
            InsertPoint::Before(anchor) => self.module.parent(anchor).ok_or_else(|| {
                IrError::StructuralViolation("insert anchor is not inside a block".into())
            }),
        }
    }

    pub fn set_location(&mut self, location: Option<SourceLocation>) {
        self.location = location;
    }

    /// Flags every node created from now on with `key`
    pub fn stamp(mut self, key: &'static str) -> Self {
        self.stamps.push(key);
        self
    }

    /// Places an unattached node at the insertion point
    pub fn insert(&mut self, value: ValueId) -> Result<ValueId> {
        match self.point {
            InsertPoint::End(block) => self.module.push_back(block, value)?,
            InsertPoint::Before(anchor) => self.module.insert_before(anchor, value)?,
        }
        for key in &self.stamps {
            self.module.annotations_mut(value).flag(*key);
        }
        if self.module[value].location.is_none() {
            self.module[value].location = self.location.clone();
        }
        Ok(value)
    }

    fn emit(&mut self, kind: ValueKind, ty: TypeId, operands: &[ValueId]) -> Result<ValueId> {
        let value = self.module.create_instruction(kind, ty, operands)?;
        self.insert(value)
    }

    fn leaf(&mut self, kind: ValueKind, ty: TypeId, name: &str) -> Result<ValueId> {
        let value = self.module.create_value(kind, ty, name);
        self.insert(value)
    }

    fn pointee(&self, pointer: ValueId) -> Result<TypeId> {
        let ty = self.module.ty(pointer);
        self.module.types.pointee(ty).ok_or_else(|| {
            IrError::StructuralViolation(format!(
                "expected a pointer, found `{}`",
                self.module.types.display(ty)
            ))
        })
    }

    fn field_type(&self, aggregate: TypeId, field: usize) -> Result<TypeId> {
        self.module
            .types
            .field(aggregate, field)
            .map(|f| f.ty)
            .ok_or_else(|| {
                IrError::StructuralViolation(format!(
                    "`{}` has no field {}",
                    self.module.types.display(aggregate),
                    field
                ))
            })
    }

    fn element_type(&self, array: TypeId) -> Result<TypeId> {
        self.module.types.element(array).ok_or_else(|| {
            IrError::StructuralViolation(format!(
                "expected an array, found `{}`",
                self.module.types.display(array)
            ))
        })
    }

    // =========================================
    // Constants and containers
    // =========================================

    pub fn const_int(&mut self, value: i64) -> Result<ValueId> {
        let ty = self.module.types.i64();
        self.leaf(ValueKind::ConstInt(value), ty, "")
    }

    /// Integer constant of an explicit integer type
    pub fn const_int_of(&mut self, ty: TypeId, value: i64) -> Result<ValueId> {
        self.leaf(ValueKind::ConstInt(value), ty, "")
    }

    pub fn const_bool(&mut self, value: bool) -> Result<ValueId> {
        let ty = self.module.types.bool();
        self.leaf(ValueKind::ConstBool(value), ty, "")
    }

    pub fn const_float(&mut self, value: f64) -> Result<ValueId> {
        let ty = self.module.types.f64();
        self.leaf(ValueKind::ConstFloat(value), ty, "")
    }

    pub fn void_value(&mut self) -> Result<ValueId> {
        let ty = self.module.types.void();
        self.leaf(ValueKind::VoidValue, ty, "")
    }

    pub fn marker(&mut self, name: &str) -> Result<ValueId> {
        let marker = self.module.create_marker(name);
        self.insert(marker)
    }

    /// Nested scope block placed at the insertion point
    pub fn block_scope(&mut self) -> Result<ValueId> {
        let block = self.module.create_block();
        self.insert(block)
    }

    // =========================================
    // Addressable storage
    // =========================================

    pub fn local(&mut self, ty: TypeId, name: &str) -> Result<ValueId> {
        self.leaf(ValueKind::LocalVariable, ty, name)
    }

    pub fn access_field(&mut self, object: ValueId, field: usize) -> Result<ValueId> {
        let ty = self.field_type(self.module.ty(object), field)?;
        self.emit(ValueKind::AccessField { field }, ty, &[object])
    }

    pub fn index_array(&mut self, object: ValueId, index: ValueId) -> Result<ValueId> {
        let ty = self.element_type(self.module.ty(object))?;
        self.emit(ValueKind::IndexArray, ty, &[object, index])
    }

    pub fn index_pointer(&mut self, object: ValueId, index: ValueId) -> Result<ValueId> {
        let ty = self.pointee(object)?;
        self.emit(ValueKind::IndexPointer, ty, &[object, index])
    }

    pub fn deref(&mut self, pointer: ValueId) -> Result<ValueId> {
        let ty = self.pointee(pointer)?;
        self.emit(ValueKind::Deref, ty, &[pointer])
    }

    pub fn address_of(&mut self, variable: ValueId) -> Result<ValueId> {
        ir_ensure!(
            self.module.kind(variable).is_addressable(),
            "cannot take the address of `{}`",
            self.module.kind(variable).mnemonic()
        );
        let ty = self.module.ty(variable);
        let ty = self.module.types.pointer_to(ty);
        self.emit(ValueKind::GetAddressOf, ty, &[variable])
    }

    pub fn write(&mut self, value: ValueId, destination: ValueId) -> Result<ValueId> {
        ir_ensure!(
            self.module.kind(destination).is_addressable(),
            "cannot write into `{}`",
            self.module.kind(destination).mnemonic()
        );
        let void = self.module.types.void();
        self.emit(ValueKind::Write, void, &[value, destination])
    }

    // =========================================
    // Memory
    // =========================================

    pub fn alloca(&mut self, ty: TypeId, name: &str) -> Result<ValueId> {
        let ptr = self.module.types.pointer_to(ty);
        self.leaf(ValueKind::Alloca, ptr, name)
    }

    pub fn load(&mut self, pointer: ValueId) -> Result<ValueId> {
        let ty = self.pointee(pointer)?;
        self.emit(ValueKind::Load, ty, &[pointer])
    }

    pub fn store(&mut self, value: ValueId, pointer: ValueId) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(ValueKind::Store, void, &[value, pointer])
    }

    pub fn struct_element_ptr(&mut self, pointer: ValueId, field: usize) -> Result<ValueId> {
        let aggregate = self.pointee(pointer)?;
        let ty = self.field_type(aggregate, field)?;
        let ty = self.module.types.pointer_to(ty);
        self.emit(ValueKind::StructElementPtr { field }, ty, &[pointer])
    }

    pub fn array_element_ptr(&mut self, pointer: ValueId, index: ValueId) -> Result<ValueId> {
        let array = self.pointee(pointer)?;
        let ty = self.element_type(array)?;
        let ty = self.module.types.pointer_to(ty);
        self.emit(ValueKind::ArrayElementPtr, ty, &[pointer, index])
    }

    /// `pointer` addresses a pointer; the result is the address of element `index`
    pub fn pointer_element_ptr(&mut self, pointer: ValueId, index: ValueId) -> Result<ValueId> {
        let ty = self.pointee(pointer)?;
        ir_ensure!(
            self.module.types.is_pointer(ty),
            "pointer indexing through a non-pointer"
        );
        self.emit(ValueKind::PointerElementPtr, ty, &[pointer, index])
    }

    // =========================================
    // Arithmetic
    // =========================================

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let ty = self.module.ty(lhs);
        self.emit(ValueKind::Binary(op), ty, &[lhs, rhs])
    }

    pub fn compare(&mut self, op: CompareOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let ty = self.module.types.bool();
        self.emit(ValueKind::Compare(op), ty, &[lhs, rhs])
    }

    pub fn device_index(&mut self, index: DeviceIndex) -> Result<ValueId> {
        let ty = self.module.types.i64();
        self.leaf(ValueKind::DeviceIndex(index), ty, "")
    }

    // =========================================
    // Calls and control
    // =========================================

    pub fn call(&mut self, callee: ValueId, args: &[ValueId]) -> Result<ValueId> {
        let ty = self.module.return_type(callee)?;
        let mut operands = vec![callee];
        operands.extend_from_slice(args);
        self.emit(ValueKind::Call, ty, &operands)
    }

    pub fn ret(&mut self, value: ValueId) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(ValueKind::Return, void, &[value])
    }

    pub fn ret_void(&mut self) -> Result<ValueId> {
        let value = self.void_value()?;
        self.ret(value)
    }

    pub fn jump(&mut self, target: ValueId) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(ValueKind::Jump, void, &[target])
    }

    pub fn cond_branch(
        &mut self,
        condition: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    ) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(ValueKind::CondBranch, void, &[condition, on_true, on_false])
    }

    /// Emits `if condition {} else {}` and returns (if, then block, else block)
    pub fn if_else(&mut self, condition: ValueId) -> Result<(ValueId, ValueId, ValueId)> {
        let then_block = self.module.create_block();
        let else_block = self.module.create_block();
        let void = self.module.types.void();
        let inst = self.emit(ValueKind::If, void, &[condition, then_block, else_block])?;
        Ok((inst, then_block, else_block))
    }

    /// Emits a while loop whose condition is computed by `condition_block`
    /// and ends in `condition`
    pub fn while_loop(
        &mut self,
        condition: ValueId,
        condition_block: ValueId,
        body: ValueId,
    ) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(ValueKind::While, void, &[condition, condition_block, body])
    }

    /// Emits `for index in first to last` with an empty body; returns (for, body)
    pub fn for_loop(
        &mut self,
        index: ValueId,
        first: ValueId,
        last: ValueId,
    ) -> Result<(ValueId, ValueId)> {
        ir_ensure!(
            matches!(self.module.kind(index), ValueKind::LocalVariable),
            "for-loop index must be a local variable"
        );
        let body = self.module.create_block();
        let void = self.module.types.void();
        let inst = self.emit(ValueKind::For, void, &[index, first, last, body])?;
        Ok((inst, body))
    }

    pub fn break_loop(&mut self, target: ValueId) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(ValueKind::Break, void, &[target])
    }

    pub fn continue_loop(&mut self, target: ValueId) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(ValueKind::Continue, void, &[target])
    }

    pub fn launch(
        &mut self,
        kernel: ValueId,
        grid: ValueId,
        block: ValueId,
        args: &[ValueId],
    ) -> Result<ValueId> {
        let void = self.module.types.void();
        let mut operands = vec![kernel, grid, block];
        operands.extend_from_slice(args);
        self.emit(ValueKind::KernelLaunch, void, &operands)
    }
}
