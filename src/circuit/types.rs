//! Machine representations and JS-level value types of gates

use crate::pgo::ShapeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine representation of the value a gate produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineType {
    /// The gate produces no value (control, checks, stores)
    NoValue,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Pointer-sized integer of the target
    ArchWord,
    /// Any machine value; only used by generic runtime calls
    AnyValue,
}

impl MachineType {
    /// Width in bits, resolving `ArchWord` against the target pointer width
    pub fn bit_width(self, pointer_bits: u32) -> u32 {
        match self {
            MachineType::NoValue | MachineType::AnyValue => 0,
            MachineType::I1 => 1,
            MachineType::I8 => 8,
            MachineType::I16 => 16,
            MachineType::I32 | MachineType::F32 => 32,
            MachineType::I64 | MachineType::F64 => 64,
            MachineType::ArchWord => pointer_bits,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            MachineType::I1
                | MachineType::I8
                | MachineType::I16
                | MachineType::I32
                | MachineType::I64
                | MachineType::ArchWord
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, MachineType::F32 | MachineType::F64)
    }

    pub fn has_value(self) -> bool {
        self != MachineType::NoValue
    }

    /// Whether two representations denote the same register class and width
    pub fn compatible(self, other: MachineType, pointer_bits: u32) -> bool {
        if self == other || self == MachineType::AnyValue || other == MachineType::AnyValue {
            return true;
        }
        self.is_int() && other.is_int() && self.bit_width(pointer_bits) == other.bit_width(pointer_bits)
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineType::NoValue => "novalue",
            MachineType::I1 => "i1",
            MachineType::I8 => "i8",
            MachineType::I16 => "i16",
            MachineType::I32 => "i32",
            MachineType::I64 => "i64",
            MachineType::F32 => "f32",
            MachineType::F64 => "f64",
            MachineType::ArchWord => "word",
            MachineType::AnyValue => "any",
        };
        f.write_str(name)
    }
}

/// JS-level type domain of a gate's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GateType {
    /// No JS value
    #[default]
    Empty,
    AnyType,
    NumberType,
    IntType,
    DoubleType,
    BooleanType,
    StringType,
    UndefinedType,
    NullType,
    /// Tagged value of unknown JS type
    TaggedValue,
    /// Tagged pointer to a heap object
    TaggedPointer,
    /// Heap object known to have a specific shape
    Object(ShapeId),
    /// Raw machine value, not a JS value
    NJSValue,
}

impl GateType {
    pub fn is_number(self) -> bool {
        matches!(self, GateType::NumberType | GateType::IntType | GateType::DoubleType)
    }

    pub fn is_int(self) -> bool {
        self == GateType::IntType
    }

    pub fn is_double(self) -> bool {
        self == GateType::DoubleType
    }

    pub fn is_heap_object(self) -> bool {
        matches!(self, GateType::TaggedPointer | GateType::Object(_) | GateType::StringType)
    }
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateType::Object(shape) => write!(f, "object<{}>", shape),
            other => write!(f, "{:?}", other),
        }
    }
}
