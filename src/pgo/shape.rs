//! Hidden shapes and resolved property slots
//!
//! A shape describes an object layout: which named properties live in the
//! object itself, which live in the out-of-object properties array, and where
//! the prototype chain continues. The lowering passes never look at objects,
//! only at shapes recorded by the profiler.

use bitflags::bitflags;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use string_interner::DefaultSymbol;

/// Identifier of an interned hidden shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeId(pub u32);

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shape{}", self.0)
    }
}

/// Identifier of a compiled method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method{}", self.0)
    }
}

/// Interned property name
pub type NameId = DefaultSymbol;

/// Storage kind of an indexed element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    /// Plain JS array slot holding a tagged value
    Tagged,
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl ElementKind {
    /// Size of one element in bytes
    pub fn byte_size(self) -> u64 {
        match self {
            ElementKind::Int8 | ElementKind::Uint8 | ElementKind::Uint8Clamped => 1,
            ElementKind::Int16 | ElementKind::Uint16 => 2,
            ElementKind::Int32 | ElementKind::Uint32 | ElementKind::Float32 => 4,
            ElementKind::Tagged
            | ElementKind::Float64
            | ElementKind::BigInt64
            | ElementKind::BigUint64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementKind::Float32 | ElementKind::Float64)
    }

    pub fn is_bigint(self) -> bool {
        matches!(self, ElementKind::BigInt64 | ElementKind::BigUint64)
    }

    /// Small integer kinds whose loaded value always fits an int32
    pub fn is_small_int(self) -> bool {
        matches!(
            self,
            ElementKind::Int8
                | ElementKind::Uint8
                | ElementKind::Uint8Clamped
                | ElementKind::Int16
                | ElementKind::Uint16
                | ElementKind::Int32
        )
    }
}

/// Where the backing store of a typed array lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OnHeapMode {
    /// Inline byte array on the managed heap
    OnHeap,
    /// External array buffer
    NotOnHeap,
    /// Mixed observations; decided at runtime
    #[default]
    Unknown,
}

/// Builtin functions with a dedicated fast path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuiltinId {
    MathSqrt,
    MathAbs,
    MathFloor,
}

impl BuiltinId {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinId::MathSqrt => "Math.sqrt",
            BuiltinId::MathAbs => "Math.abs",
            BuiltinId::MathFloor => "Math.floor",
        }
    }
}

/// Broad classification of a shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Object,
    Array { stable: bool },
    TypedArray { element: ElementKind, mode: OnHeapMode },
    String,
    Function { method: MethodId },
    Prototype,
}

bitflags! {
    /// Attribute bits of a resolved property slot
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PropertyFlags: u8 {
        const FOUND = 1 << 0;
        const IN_OBJECT = 1 << 1;
        const ACCESSOR = 1 << 2;
        const WRITABLE = 1 << 3;
        const NOT_HOLE = 1 << 4;
    }
}

/// Representation a property slot has been observed to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Representation {
    #[default]
    Tagged,
    Int,
    Double,
}

/// Resolved slot of a named property on a holder shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyLookupResult {
    pub flags: PropertyFlags,
    /// Slot index: in-object field index or properties-array index
    pub offset: u32,
    pub representation: Representation,
}

impl PropertyLookupResult {
    /// The "property not found" result
    pub const NOT_FOUND: PropertyLookupResult = PropertyLookupResult {
        flags: PropertyFlags::empty(),
        offset: 0,
        representation: Representation::Tagged,
    };

    /// A writable data property stored inside the object
    pub fn in_object(offset: u32) -> Self {
        Self {
            flags: PropertyFlags::FOUND | PropertyFlags::IN_OBJECT | PropertyFlags::WRITABLE,
            offset,
            representation: Representation::Tagged,
        }
    }

    /// A writable data property stored in the properties array
    pub fn out_of_object(offset: u32) -> Self {
        Self {
            flags: PropertyFlags::FOUND | PropertyFlags::WRITABLE,
            offset,
            representation: Representation::Tagged,
        }
    }

    /// An accessor pair stored inside the holder
    pub fn accessor(offset: u32) -> Self {
        Self {
            flags: PropertyFlags::FOUND | PropertyFlags::IN_OBJECT | PropertyFlags::ACCESSOR,
            offset,
            representation: Representation::Tagged,
        }
    }

    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representation = representation;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.flags.remove(PropertyFlags::WRITABLE);
        self
    }

    pub fn is_found(&self) -> bool {
        self.flags.contains(PropertyFlags::FOUND)
    }

    pub fn is_in_object(&self) -> bool {
        self.flags.contains(PropertyFlags::IN_OBJECT)
    }

    pub fn is_accessor(&self) -> bool {
        self.flags.contains(PropertyFlags::ACCESSOR)
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PropertyFlags::WRITABLE)
    }
}

impl fmt::Display for PropertyLookupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_found() {
            return write!(f, "not-found");
        }
        let place = if self.is_in_object() { "in-object" } else { "out-of-object" };
        let kind = if self.is_accessor() { "accessor" } else { "data" };
        write!(f, "{} {}[{}] {:?}", kind, place, self.offset, self.representation)
    }
}

/// Layout information for one hidden shape
#[derive(Debug, Clone)]
pub struct ShapeInfo {
    pub id: ShapeId,
    pub kind: ShapeKind,
    pub prototype: Option<ShapeId>,
    pub properties: HashMap<NameId, PropertyLookupResult>,
    /// Capacity of the out-of-object properties array
    pub out_of_object_capacity: u32,
    /// Shape transitions keyed by the added property
    pub transitions: HashMap<NameId, ShapeId>,
}

impl ShapeInfo {
    pub fn new(id: ShapeId, kind: ShapeKind) -> Self {
        Self {
            id,
            kind,
            prototype: None,
            properties: HashMap::default(),
            out_of_object_capacity: 0,
            transitions: HashMap::default(),
        }
    }

    pub fn is_typed_array(&self) -> bool {
        matches!(self.kind, ShapeKind::TypedArray { .. })
    }

    pub fn is_stable_array(&self) -> bool {
        matches!(self.kind, ShapeKind::Array { stable: true })
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind, ShapeKind::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementKind::Int8.byte_size(), 1);
        assert_eq!(ElementKind::Uint16.byte_size(), 2);
        assert_eq!(ElementKind::Float32.byte_size(), 4);
        assert_eq!(ElementKind::BigUint64.byte_size(), 8);
        assert_eq!(ElementKind::Tagged.byte_size(), 8);
    }

    #[test]
    fn test_lookup_result_flags() {
        let plr = PropertyLookupResult::in_object(3);
        assert!(plr.is_found());
        assert!(plr.is_in_object());
        assert!(plr.is_writable());
        assert!(!plr.is_accessor());

        let getter = PropertyLookupResult::accessor(1);
        assert!(getter.is_accessor());
        assert!(!getter.is_writable());

        assert!(!PropertyLookupResult::NOT_FOUND.is_found());
        assert!(!PropertyLookupResult::out_of_object(0).read_only().is_writable());
    }

    #[test]
    fn test_lookup_result_display() {
        let plr = PropertyLookupResult::out_of_object(2).with_representation(Representation::Int);
        assert_eq!(plr.to_string(), "data out-of-object[2] Int");
    }
}
