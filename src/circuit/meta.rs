//! Opcode-specific gate metadata
//!
//! Metadata is immutable once a gate is created and is shared between gates
//! through the circuit's interning table.

use crate::pgo::{BuiltinId, ElementKind, MethodId, OnHeapMode, PropertyLookupResult, ShapeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Generic, dynamically-typed bytecodes the front end emits as `JsBytecode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BytecodeOp {
    Add2,
    Sub2,
    Mul2,
    Div2,
    Mod2,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    And2,
    Or2,
    Xor2,
    Shl2,
    Shr2,
    Ashr2,
    Inc,
    Dec,
    Neg,
    Not,
    LdObjByName,
    StObjByName,
    LdObjByValue,
    StObjByValue,
    Call,
    /// Any bytecode without a typed fast path
    Other,
}

impl BytecodeOp {
    /// Number of value inputs, or `None` when it depends on the call arity
    pub fn value_count(self, argc: u32) -> Option<usize> {
        use BytecodeOp::*;
        match self {
            Inc | Dec | Neg | Not | LdObjByName => Some(1),
            StObjByName | LdObjByValue => Some(2),
            StObjByValue => Some(3),
            Call => Some(argc as usize + 2),
            Other => None,
            _ => Some(2),
        }
    }

    pub fn is_binary_arith(self) -> bool {
        TypedBinOp::from_bytecode(self).is_some()
    }

    pub fn is_unary_arith(self) -> bool {
        TypedUnOp::from_bytecode(self).is_some()
    }

    /// Whether executing the bytecode may change an object's shape
    pub fn may_mutate_shapes(self) -> bool {
        matches!(
            self,
            BytecodeOp::StObjByName | BytecodeOp::StObjByValue | BytecodeOp::Call | BytecodeOp::Other
        )
    }

    /// Whether the bytecode produces a JS value
    pub fn has_result(self) -> bool {
        !matches!(self, BytecodeOp::StObjByName | BytecodeOp::StObjByValue)
    }
}

/// Typed binary operations produced by speculative lowering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    NotEq,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ashr,
}

impl TypedBinOp {
    pub fn from_bytecode(op: BytecodeOp) -> Option<Self> {
        let typed = match op {
            BytecodeOp::Add2 => TypedBinOp::Add,
            BytecodeOp::Sub2 => TypedBinOp::Sub,
            BytecodeOp::Mul2 => TypedBinOp::Mul,
            BytecodeOp::Div2 => TypedBinOp::Div,
            BytecodeOp::Mod2 => TypedBinOp::Mod,
            BytecodeOp::Less => TypedBinOp::Less,
            BytecodeOp::LessEq => TypedBinOp::LessEq,
            BytecodeOp::Greater => TypedBinOp::Greater,
            BytecodeOp::GreaterEq => TypedBinOp::GreaterEq,
            // Numbers compare the same loosely and strictly
            BytecodeOp::Eq | BytecodeOp::StrictEq => TypedBinOp::Eq,
            BytecodeOp::NotEq | BytecodeOp::StrictNotEq => TypedBinOp::NotEq,
            BytecodeOp::And2 => TypedBinOp::And,
            BytecodeOp::Or2 => TypedBinOp::Or,
            BytecodeOp::Xor2 => TypedBinOp::Xor,
            BytecodeOp::Shl2 => TypedBinOp::Shl,
            BytecodeOp::Shr2 => TypedBinOp::Shr,
            BytecodeOp::Ashr2 => TypedBinOp::Ashr,
            _ => return None,
        };
        Some(typed)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            TypedBinOp::Less
                | TypedBinOp::LessEq
                | TypedBinOp::Greater
                | TypedBinOp::GreaterEq
                | TypedBinOp::Eq
                | TypedBinOp::NotEq
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            TypedBinOp::And | TypedBinOp::Or | TypedBinOp::Xor | TypedBinOp::Shl | TypedBinOp::Shr | TypedBinOp::Ashr
        )
    }
}

/// Typed unary operations produced by speculative lowering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedUnOp {
    Inc,
    Dec,
    Neg,
    Not,
}

impl TypedUnOp {
    pub fn from_bytecode(op: BytecodeOp) -> Option<Self> {
        match op {
            BytecodeOp::Inc => Some(TypedUnOp::Inc),
            BytecodeOp::Dec => Some(TypedUnOp::Dec),
            BytecodeOp::Neg => Some(TypedUnOp::Neg),
            BytecodeOp::Not => Some(TypedUnOp::Not),
            _ => None,
        }
    }
}

/// Primitive type a check or typed operation assumes for its operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Int,
    Double,
    Number,
    Boolean,
    String,
}

/// Integer comparison condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IcmpCond {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// Float comparison condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FcmpCond {
    Oeq,
    Une,
    Olt,
    Ole,
    Ogt,
    Oge,
}

/// What a call-target check compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallTargetKind {
    Method,
    Builtin,
    Getter,
}

/// Why a deoptimization guard fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeoptReason {
    NotInt,
    NotDouble,
    NotNumber,
    NotBool,
    NotString,
    NotHeapObject,
    WrongShape,
    NotStableArray,
    NotTypedArray,
    IndexOutOfRange,
    ProtoChanged,
    WrongCallTarget,
    Overflow,
    MinusZero,
    PolyMiss,
}

impl DeoptReason {
    pub fn for_param(param: ParamType) -> Self {
        match param {
            ParamType::Int => DeoptReason::NotInt,
            ParamType::Double => DeoptReason::NotDouble,
            ParamType::Number => DeoptReason::NotNumber,
            ParamType::Boolean => DeoptReason::NotBool,
            ParamType::String => DeoptReason::NotString,
        }
    }
}

/// Runtime entry points the lowered graph may call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeId {
    /// Reallocate the out-of-object properties array
    GrowPropertiesArray,
}

/// Front-end description of one generic bytecode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BytecodeInfo {
    pub method: MethodId,
    pub pc: u32,
    pub op: BytecodeOp,
    /// Property name for by-name accesses
    pub name: Option<String>,
    /// Argument count for calls
    pub argc: u32,
}

impl BytecodeInfo {
    pub fn new(method: MethodId, pc: u32, op: BytecodeOp) -> Self {
        Self {
            method,
            pc,
            op,
            name: None,
            argc: 0,
        }
    }

    pub fn named(method: MethodId, pc: u32, op: BytecodeOp, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(method, pc, op)
        }
    }

    pub fn call(method: MethodId, pc: u32, argc: u32) -> Self {
        Self {
            argc,
            ..Self::new(method, pc, BytecodeOp::Call)
        }
    }
}

/// Opcode-specific metadata carried by a gate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GateMeta {
    #[default]
    None,
    /// Raw 64-bit pattern of a constant
    Constant(u64),
    /// Parameter index
    Arg(u32),
    /// Number of incoming edges of a merge or selector
    Width(u32),
    Icmp(IcmpCond),
    Fcmp(FcmpCond),
    FrameState { method: MethodId, pc: u32 },
    Bytecode(BytecodeInfo),
    Deopt(DeoptReason),
    TypedBinary { op: TypedBinOp, operand: ParamType },
    TypedUnary { op: TypedUnOp, operand: ParamType },
    PrimitiveCheck(ParamType),
    Shape(ShapeId),
    TypedArray(ElementKind),
    Property(PropertyLookupResult),
    ProtoProperty { plr: PropertyLookupResult, depth: u32 },
    Transition { from: ShapeId, to: ShapeId },
    Element { kind: ElementKind, mode: OnHeapMode },
    CallTarget { kind: CallTargetKind, pc: u32, hint: MethodId },
    Call { argc: u32 },
    Builtin(BuiltinId),
    Runtime { id: RuntimeId, argc: u32 },
}

impl GateMeta {
    pub fn constant_bits(&self) -> Option<u64> {
        match self {
            GateMeta::Constant(bits) => Some(*bits),
            _ => None,
        }
    }

    pub fn width(&self) -> Option<usize> {
        match self {
            GateMeta::Width(n) => Some(*n as usize),
            _ => None,
        }
    }

    pub fn bytecode(&self) -> Option<&BytecodeInfo> {
        match self {
            GateMeta::Bytecode(info) => Some(info),
            _ => None,
        }
    }
}

impl fmt::Display for GateMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateMeta::None => Ok(()),
            GateMeta::Constant(bits) => write!(f, "0x{:x}", bits),
            GateMeta::Arg(index) => write!(f, "arg{}", index),
            GateMeta::Width(n) => write!(f, "width={}", n),
            GateMeta::Icmp(cond) => write!(f, "{:?}", cond),
            GateMeta::Fcmp(cond) => write!(f, "{:?}", cond),
            GateMeta::FrameState { method, pc } => write!(f, "{}@{}", method, pc),
            GateMeta::Bytecode(info) => {
                write!(f, "{:?}@{}", info.op, info.pc)?;
                if let Some(name) = &info.name {
                    write!(f, " .{}", name)?;
                }
                Ok(())
            }
            GateMeta::Deopt(reason) => write!(f, "{:?}", reason),
            GateMeta::TypedBinary { op, operand } => write!(f, "{:?}<{:?}>", op, operand),
            GateMeta::TypedUnary { op, operand } => write!(f, "{:?}<{:?}>", op, operand),
            GateMeta::PrimitiveCheck(param) => write!(f, "{:?}", param),
            GateMeta::Shape(shape) => write!(f, "{}", shape),
            GateMeta::TypedArray(kind) => write!(f, "{:?}", kind),
            GateMeta::Property(plr) => write!(f, "{}", plr),
            GateMeta::ProtoProperty { plr, depth } => write!(f, "{} depth={}", plr, depth),
            GateMeta::Transition { from, to } => write!(f, "{} -> {}", from, to),
            GateMeta::Element { kind, mode } => write!(f, "{:?} {:?}", kind, mode),
            GateMeta::CallTarget { kind, pc, hint } => write!(f, "{:?}@{} {}", kind, pc, hint),
            GateMeta::Call { argc } => write!(f, "argc={}", argc),
            GateMeta::Builtin(id) => write!(f, "{}", id.name()),
            GateMeta::Runtime { id, argc } => write!(f, "{:?} argc={}", id, argc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytecode_value_counts() {
        assert_eq!(BytecodeOp::Add2.value_count(0), Some(2));
        assert_eq!(BytecodeOp::LdObjByName.value_count(0), Some(1));
        assert_eq!(BytecodeOp::StObjByValue.value_count(0), Some(3));
        assert_eq!(BytecodeOp::Call.value_count(3), Some(5));
        assert_eq!(BytecodeOp::Other.value_count(0), None);
    }

    #[test]
    fn test_typed_op_mapping() {
        assert_eq!(TypedBinOp::from_bytecode(BytecodeOp::StrictEq), Some(TypedBinOp::Eq));
        assert!(TypedBinOp::Less.is_comparison());
        assert!(TypedBinOp::Shr.is_bitwise());
        assert_eq!(TypedBinOp::from_bytecode(BytecodeOp::LdObjByName), None);
        assert_eq!(TypedUnOp::from_bytecode(BytecodeOp::Inc), Some(TypedUnOp::Inc));
    }

    #[test]
    fn test_meta_display() {
        let info = BytecodeInfo::named(MethodId(1), 12, BytecodeOp::LdObjByName, "x");
        assert_eq!(GateMeta::Bytecode(info).to_string(), "LdObjByName@12 .x");
        assert_eq!(GateMeta::Constant(255).to_string(), "0xff");
    }
}
