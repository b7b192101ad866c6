//! IR Type System
//!
//! Types are interned in a [`TypeTable`] owned by the module. Struct
//! types are nominal: every declaration gets its own id, and its fields
//! and lifetime hooks are filled in afterwards.

use crate::value::ValueId;
use std::collections::HashMap;
use std::fmt;

/// Handle to a type in the [`TypeTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Shape of a type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    Int { bits: u16 },
    Float { bits: u16 },
    Char,
    Pointer(TypeId),
    Array { element: TypeId, len: usize },
    Struct { name: String, fields: Vec<Field> },
    Function { params: Vec<TypeId>, ret: TypeId },
}

/// Named struct field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Which lifetime hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Initialize,
    Copy,
    Destroy,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Initialize => "initialize",
            HookKind::Copy => "copy",
            HookKind::Destroy => "destroy",
        }
    }
}

/// Hook functions a type declares. Each takes a pointer to the object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeHooks {
    pub initialize: Option<ValueId>,
    pub copy: Option<ValueId>,
    pub destroy: Option<ValueId>,
}

impl LifetimeHooks {
    pub fn get(&self, kind: HookKind) -> Option<ValueId> {
        match kind {
            HookKind::Initialize => self.initialize,
            HookKind::Copy => self.copy,
            HookKind::Destroy => self.destroy,
        }
    }
}

/// A type with its metadata
#[derive(Debug, Clone)]
pub struct TypeData {
    pub kind: TypeKind,
    pub hooks: LifetimeHooks,
    /// Handle types whose pointers already address device memory
    pub device_visible: bool,
}

/// Interning table for all types of a module
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<TypeData>,
    interned: HashMap<TypeKind, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeData {
            kind,
            hooks: LifetimeHooks::default(),
            device_visible: false,
        });
        id
    }

    /// Returns the id of a structural type, creating it on first use
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(id) = self.interned.get(&kind) {
            return *id;
        }
        let id = self.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    pub fn void(&mut self) -> TypeId {
        self.intern(TypeKind::Void)
    }

    pub fn bool(&mut self) -> TypeId {
        self.intern(TypeKind::Bool)
    }

    pub fn i64(&mut self) -> TypeId {
        self.intern(TypeKind::Int { bits: 64 })
    }

    pub fn f64(&mut self) -> TypeId {
        self.intern(TypeKind::Float { bits: 64 })
    }

    pub fn char(&mut self) -> TypeId {
        self.intern(TypeKind::Char)
    }

    pub fn pointer_to(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::Pointer(pointee))
    }

    pub fn array_of(&mut self, element: TypeId, len: usize) -> TypeId {
        self.intern(TypeKind::Array { element, len })
    }

    pub fn function(&mut self, params: Vec<TypeId>, ret: TypeId) -> TypeId {
        self.intern(TypeKind::Function { params, ret })
    }

    /// Declares a new nominal struct type
    pub fn declare_struct(&mut self, name: impl Into<String>, fields: Vec<Field>) -> TypeId {
        self.push(TypeKind::Struct {
            name: name.into(),
            fields,
        })
    }

    pub fn set_hooks(&mut self, ty: TypeId, hooks: LifetimeHooks) {
        self.types[ty.index()].hooks = hooks;
    }

    pub fn set_device_visible(&mut self, ty: TypeId, visible: bool) {
        self.types[ty.index()].device_visible = visible;
    }

    pub fn get(&self, ty: TypeId) -> &TypeData {
        &self.types[ty.index()]
    }

    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        &self.get(ty).kind
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn is_void(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Void)
    }

    pub fn is_pointer(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Pointer(_))
    }

    pub fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Pointer(pointee) => Some(*pointee),
            _ => None,
        }
    }

    pub fn element(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Array { element, .. } => Some(*element),
            _ => None,
        }
    }

    pub fn fields(&self, ty: TypeId) -> &[Field] {
        match self.kind(ty) {
            TypeKind::Struct { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn field(&self, ty: TypeId, index: usize) -> Option<&Field> {
        self.fields(ty).get(index)
    }

    pub fn return_type(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Function { ret, .. } => Some(*ret),
            _ => None,
        }
    }

    pub fn hook(&self, ty: TypeId, kind: HookKind) -> Option<ValueId> {
        self.get(ty).hooks.get(kind)
    }

    /// True if the type or, recursively, any struct field declares the hook
    pub fn is_hookable(&self, ty: TypeId, kind: HookKind) -> bool {
        self.hook(ty, kind).is_some()
            || self
                .fields(ty)
                .iter()
                .any(|field| self.is_hookable(field.ty, kind))
    }

    pub fn is_initialize_hookable(&self, ty: TypeId) -> bool {
        self.is_hookable(ty, HookKind::Initialize)
    }

    pub fn is_copy_hookable(&self, ty: TypeId) -> bool {
        self.is_hookable(ty, HookKind::Copy)
    }

    pub fn is_destroy_hookable(&self, ty: TypeId) -> bool {
        self.is_hookable(ty, HookKind::Destroy)
    }

    pub fn is_lifetime_managed(&self, ty: TypeId) -> bool {
        self.is_initialize_hookable(ty) || self.is_copy_hookable(ty) || self.is_destroy_hookable(ty)
    }

    /// True if a value of this type holds an address anywhere inside it
    pub fn contains_pointer(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::Pointer(_) => true,
            TypeKind::Array { element, .. } => self.contains_pointer(*element),
            TypeKind::Struct { fields, .. } => {
                fields.iter().any(|field| self.contains_pointer(field.ty))
            }
            _ => false,
        }
    }

    /// Displays a type
    pub fn display(&self, ty: TypeId) -> TypeDisplay<'_> {
        TypeDisplay { table: self, ty }
    }
}

/// Helper returned by [`TypeTable::display`]
pub struct TypeDisplay<'a> {
    table: &'a TypeTable,
    ty: TypeId,
}

impl fmt::Display for TypeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |ty| self.table.display(ty);
        match self.table.kind(self.ty) {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Bool => write!(f, "i1"),
            TypeKind::Int { bits } => write!(f, "i{}", bits),
            TypeKind::Float { bits } => write!(f, "f{}", bits),
            TypeKind::Char => write!(f, "char"),
            TypeKind::Pointer(pointee) => write!(f, "*{}", show(*pointee)),
            TypeKind::Array { element, len } => write!(f, "[{} x {}]", len, show(*element)),
            TypeKind::Struct { name, .. } => write!(f, "%{}", name),
            TypeKind::Function { params, ret } => {
                write!(f, "fn(")?;
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", show(*param))?;
                }
                write!(f, ") -> {}", show(*ret))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn fake_function() -> ValueId {
        ValueId::from(KeyData::from_ffi(1))
    }

    #[test]
    fn test_interning() {
        let mut types = TypeTable::new();
        let a = types.i64();
        let b = types.i64();
        assert_eq!(a, b);
        let pa = types.pointer_to(a);
        assert_eq!(types.pointee(pa), Some(a));
        assert_eq!(types.display(pa).to_string(), "*i64");
    }

    #[test]
    fn test_structs_are_nominal() {
        let mut types = TypeTable::new();
        let a = types.declare_struct("Pair", vec![]);
        let b = types.declare_struct("Pair", vec![]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hooks_propagate_through_fields() {
        let mut types = TypeTable::new();
        let i64_ty = types.i64();
        let inner = types.declare_struct("Buffer", vec![Field::new("len", i64_ty)]);
        types.set_hooks(
            inner,
            LifetimeHooks {
                destroy: Some(fake_function()),
                ..Default::default()
            },
        );
        let outer = types.declare_struct("Holder", vec![Field::new("buffer", inner)]);

        assert!(types.is_destroy_hookable(outer));
        assert!(!types.is_copy_hookable(outer));
        assert!(types.is_lifetime_managed(outer));
        assert!(!types.is_lifetime_managed(i64_ty));
    }

    #[test]
    fn test_contains_pointer() {
        let mut types = TypeTable::new();
        let f64_ty = types.f64();
        let ptr = types.pointer_to(f64_ty);
        let view = types.declare_struct("View", vec![Field::new("data", ptr)]);
        let array = types.array_of(f64_ty, 4);

        assert!(types.contains_pointer(view));
        assert!(!types.contains_pointer(array));
    }
}
