//! vela-ir - Intermediate Representation of the Vela compiler
//!
//! The IR is a mutable, typed graph:
//! - every node lives in an arena owned by the [`Module`]
//! - blocks own the nodes positioned in them; parent links and use lists
//!   are non-owning ids
//! - every operand slot is mirrored by an entry in the operand's use list
//! - nodes leave the graph only through [`Module::finalize`]
//!
//! # Architecture
//!
//! ```text
//!   Lowering (external)
//!         ↓
//!   IR Module
//!   ├── Types (interned, with lifetime hooks)
//!   ├── Globals
//!   ├── Functions
//!   │   └── Blocks
//!   │       ├── Instructions
//!   │       └── If / While / For with nested body Blocks
//!   └── Target sub-modules (kernels)
//!         ↓
//!    [vela-transform]
//!         ↓
//!   Flat basic blocks for code generation
//! ```

pub mod error;
pub mod types;
pub mod value;
pub mod module;
pub mod builder;
pub mod printer;
pub mod verify;

pub use error::{IrError, Result};
pub use types::{Field, HookKind, LifetimeHooks, TypeId, TypeKind, TypeTable};
pub use value::{
    annotation, slot, Annotations, BinaryOp, BlockData, CompareOp, DeviceIndex, FunctionData, Use,
    ValueData, ValueId, ValueKind,
};
pub use module::{Module, Target, TargetModule};
pub use builder::{InsertPoint, IrBuilder};
pub use printer::print_function;
pub use verify::VerifyLevel;
