//! IR Values
//!
//! Every node of the graph is a value stored in the module arena: functions,
//! blocks, constants and instructions alike. The node kinds form a closed
//! set; capabilities such as "addressable" or "terminator" are predicates on
//! [`ValueKind`].

use crate::types::TypeId;
use slotmap::new_key_type;
use std::collections::BTreeMap;
use std::fmt;
use vela_error::{Located, SourceLocation};

new_key_type! {
    /// Handle to a node in the module arena
    pub struct ValueId;
}

/// One operand slot reading a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: ValueId,
    pub index: usize,
}

impl Use {
    pub fn new(user: ValueId, index: usize) -> Self {
        Self { user, index }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
        };
        write!(f, "{}", s)
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "slt",
            CompareOp::Le => "sle",
            CompareOp::Gt => "sgt",
            CompareOp::Ge => "sge",
        };
        write!(f, "{}", s)
    }
}

/// Per-invocation values readable inside a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceIndex {
    ThreadIndex,
    BlockIndex,
    BlockDim,
    GridDim,
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceIndex::ThreadIndex => "thread.idx.x",
            DeviceIndex::BlockIndex => "block.idx.x",
            DeviceIndex::BlockDim => "block.dim.x",
            DeviceIndex::GridDim => "grid.dim.x",
        };
        write!(f, "{}", s)
    }
}

/// Payload of a function node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionData {
    pub params: Vec<ValueId>,
    /// Body blocks; a single structured block before partitioning
    pub blocks: Vec<ValueId>,
}

impl FunctionData {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Payload of a block node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockData {
    pub values: Vec<ValueId>,
    /// Function this block is a body block of, if any
    pub function: Option<ValueId>,
}

/// Operand slot numbers of the fixed-shape instructions
pub mod slot {
    pub const WRITE_VALUE: usize = 0;
    pub const WRITE_DEST: usize = 1;
    pub const STORE_VALUE: usize = 0;
    pub const STORE_POINTER: usize = 1;
    pub const OBJECT: usize = 0;
    pub const INDEX: usize = 1;
    pub const CALLEE: usize = 0;

    pub const IF_CONDITION: usize = 0;
    pub const IF_THEN: usize = 1;
    pub const IF_ELSE: usize = 2;

    pub const WHILE_CONDITION: usize = 0;
    pub const WHILE_CONDITION_BLOCK: usize = 1;
    pub const WHILE_BODY: usize = 2;

    pub const FOR_INDEX: usize = 0;
    pub const FOR_FIRST: usize = 1;
    pub const FOR_LAST: usize = 2;
    pub const FOR_BODY: usize = 3;

    pub const BRANCH_CONDITION: usize = 0;
    pub const BRANCH_TRUE: usize = 1;
    pub const BRANCH_FALSE: usize = 2;

    pub const LAUNCH_KERNEL: usize = 0;
    pub const LAUNCH_GRID: usize = 1;
    pub const LAUNCH_BLOCK: usize = 2;
    pub const LAUNCH_ARGS: usize = 3;
}

/// The closed set of node kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    // Module-level entities
    Function(FunctionData),
    Argument,
    GlobalVariable,
    GlobalAlloca,

    // Containers
    Block(BlockData),
    /// Placeholder branch target, collapsed by partitioning
    Marker,

    // Constants
    ConstInt(i64),
    ConstFloat(f64),
    ConstBool(bool),
    ConstChar(char),
    ConstNull,
    VoidValue,

    // Addressable storage
    LocalVariable,
    /// [object]
    AccessField { field: usize },
    /// [object, index]
    IndexArray,
    /// [object, index]
    IndexPointer,
    /// [pointer]
    Deref,

    // Memory
    /// [variable]
    GetAddressOf,
    /// [value, destination]
    Write,
    Alloca,
    /// [pointer]
    Load,
    /// [value, pointer]
    Store,
    /// [pointer]
    StructElementPtr { field: usize },
    /// [pointer, index]
    ArrayElementPtr,
    /// [pointer, index]
    PointerElementPtr,

    // Arithmetic
    Binary(BinaryOp),
    Compare(CompareOp),

    // Calls and control
    /// [callee, args...]
    Call,
    /// [value]
    Return,
    /// [target]
    Jump,
    /// [condition, true target, false target]
    CondBranch,
    /// [condition, then block, else block]
    If,
    /// [condition, condition block, body block]
    While,
    /// [index, first, last, body block]
    For,
    /// [loop]
    Break,
    /// [loop]
    Continue,

    // Device
    /// [kernel, grid shape, block shape, args...]
    KernelLaunch,
    DeviceIndex(DeviceIndex),
}

impl ValueKind {
    /// Storage whose address can be taken and which can be written
    pub fn is_addressable(&self) -> bool {
        matches!(
            self,
            ValueKind::LocalVariable
                | ValueKind::GlobalVariable
                | ValueKind::AccessField { .. }
                | ValueKind::IndexArray
                | ValueKind::IndexPointer
                | ValueKind::Deref
        )
    }

    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            ValueKind::ConstInt(_)
                | ValueKind::ConstFloat(_)
                | ValueKind::ConstBool(_)
                | ValueKind::ConstChar(_)
                | ValueKind::ConstNull
                | ValueKind::VoidValue
        )
    }

    pub fn is_block(&self) -> bool {
        matches!(self, ValueKind::Block(_))
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, ValueKind::Marker)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, ValueKind::Function(_))
    }

    /// Nodes that live in the module rather than in a block
    pub fn is_module_level(&self) -> bool {
        matches!(
            self,
            ValueKind::Function(_)
                | ValueKind::Argument
                | ValueKind::GlobalVariable
                | ValueKind::GlobalAlloca
        )
    }

    /// Everything that reads operands
    pub fn is_instruction(&self) -> bool {
        !(self.is_module_level()
            || self.is_constant()
            || self.is_block()
            || self.is_marker()
            || matches!(self, ValueKind::LocalVariable))
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            ValueKind::Return | ValueKind::Jump | ValueKind::CondBranch
        )
    }

    /// Instructions owning nested body blocks
    pub fn is_structured(&self) -> bool {
        matches!(self, ValueKind::If | ValueKind::While | ValueKind::For)
    }

    pub fn is_loop_exit(&self) -> bool {
        matches!(self, ValueKind::Break | ValueKind::Continue)
    }

    /// Number of operands for fixed-shape instructions
    pub fn arity(&self) -> Option<usize> {
        let n = match self {
            ValueKind::Call | ValueKind::KernelLaunch => return None,
            ValueKind::AccessField { .. }
            | ValueKind::Deref
            | ValueKind::GetAddressOf
            | ValueKind::Load
            | ValueKind::StructElementPtr { .. }
            | ValueKind::Return
            | ValueKind::Jump
            | ValueKind::Break
            | ValueKind::Continue => 1,
            ValueKind::IndexArray
            | ValueKind::IndexPointer
            | ValueKind::Write
            | ValueKind::Store
            | ValueKind::ArrayElementPtr
            | ValueKind::PointerElementPtr
            | ValueKind::Binary(_)
            | ValueKind::Compare(_) => 2,
            ValueKind::CondBranch | ValueKind::If | ValueKind::While => 3,
            ValueKind::For => 4,
            _ => 0,
        };
        Some(n)
    }

    /// Short name used by the printer and in messages
    pub fn mnemonic(&self) -> &'static str {
        match self {
            ValueKind::Function(_) => "function",
            ValueKind::Argument => "argument",
            ValueKind::GlobalVariable => "global",
            ValueKind::GlobalAlloca => "global_alloca",
            ValueKind::Block(_) => "block",
            ValueKind::Marker => "marker",
            ValueKind::ConstInt(_) => "const.int",
            ValueKind::ConstFloat(_) => "const.float",
            ValueKind::ConstBool(_) => "const.bool",
            ValueKind::ConstChar(_) => "const.char",
            ValueKind::ConstNull => "const.null",
            ValueKind::VoidValue => "void",
            ValueKind::LocalVariable => "local",
            ValueKind::AccessField { .. } => "field",
            ValueKind::IndexArray => "index_array",
            ValueKind::IndexPointer => "index_pointer",
            ValueKind::Deref => "deref",
            ValueKind::GetAddressOf => "address_of",
            ValueKind::Write => "write",
            ValueKind::Alloca => "alloca",
            ValueKind::Load => "load",
            ValueKind::Store => "store",
            ValueKind::StructElementPtr { .. } => "gep.struct",
            ValueKind::ArrayElementPtr => "gep.array",
            ValueKind::PointerElementPtr => "gep.pointer",
            ValueKind::Binary(_) => "binary",
            ValueKind::Compare(_) => "cmp",
            ValueKind::Call => "call",
            ValueKind::Return => "ret",
            ValueKind::Jump => "br",
            ValueKind::CondBranch => "condbr",
            ValueKind::If => "if",
            ValueKind::While => "while",
            ValueKind::For => "for",
            ValueKind::Break => "break",
            ValueKind::Continue => "continue",
            ValueKind::KernelLaunch => "launch",
            ValueKind::DeviceIndex(_) => "device_index",
        }
    }
}

/// Key/value annotations attached to nodes (`parallel`, `target = nvptx`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations(BTreeMap<String, Vec<String>>);

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a flag annotation without values
    pub fn flag(&mut self, key: impl Into<String>) {
        self.0.entry(key.into()).or_default();
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key)?.first().map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

/// Well-known annotation keys
pub mod annotation {
    /// For loop to be lifted into a kernel
    pub const PARALLEL: &str = "parallel";
    /// Function is a device kernel
    pub const KERNEL: &str = "kernel";
    /// Target a function must be compiled for
    pub const TARGET: &str = "target";
    /// Value introduced by lifetime management
    pub const LIFETIME_INSERTED: &str = "lifetime.inserted";
    /// Node already handled by lifetime management
    pub const LIFETIME_DONE: &str = "lifetime.done";
}

/// A node stored in the arena
#[derive(Debug, Clone)]
pub struct ValueData {
    pub kind: ValueKind,
    pub ty: TypeId,
    pub name: String,
    pub annotations: Annotations,
    pub location: Option<SourceLocation>,
    pub(crate) parent: Option<ValueId>,
    pub(crate) operands: Vec<Option<ValueId>>,
    pub(crate) uses: Vec<Use>,
}

impl ValueData {
    pub fn new(kind: ValueKind, ty: TypeId, name: impl Into<String>) -> Self {
        Self {
            kind,
            ty,
            name: name.into(),
            annotations: Annotations::new(),
            location: None,
            parent: None,
            operands: Vec::new(),
            uses: Vec::new(),
        }
    }

    pub fn parent(&self) -> Option<ValueId> {
        self.parent
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn operand_slots(&self) -> &[Option<ValueId>] {
        &self.operands
    }
}

impl Located for ValueData {
    fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        assert!(ValueKind::LocalVariable.is_addressable());
        assert!(!ValueKind::LocalVariable.is_instruction());
        assert!(ValueKind::Deref.is_addressable());
        assert!(ValueKind::Deref.is_instruction());
        assert!(!ValueKind::Alloca.is_addressable());
        assert!(ValueKind::CondBranch.is_terminator());
        assert!(!ValueKind::Break.is_terminator());
        assert!(ValueKind::For.is_structured());
        assert!(!ValueKind::Marker.is_instruction());
    }

    #[test]
    fn test_arity() {
        assert_eq!(ValueKind::Write.arity(), Some(2));
        assert_eq!(ValueKind::For.arity(), Some(4));
        assert_eq!(ValueKind::Call.arity(), None);
        assert_eq!(ValueKind::Alloca.arity(), Some(0));
    }

    #[test]
    fn test_annotations() {
        let mut annotations = Annotations::new();
        annotations.flag(annotation::PARALLEL);
        annotations.insert(annotation::TARGET, "nvptx");

        assert!(annotations.has("parallel"));
        assert_eq!(annotations.get("parallel"), Some(&[][..]));
        assert_eq!(annotations.first("target"), Some("nvptx"));
        assert_eq!(annotations.remove("target"), Some(vec!["nvptx".to_string()]));
        assert!(!annotations.has("target"));
    }
}
