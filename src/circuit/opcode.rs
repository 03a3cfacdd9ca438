//! Gate opcodes
//!
//! Opcodes fall into four groups:
//!
//! - **control** gates form the state chain and delimit basic blocks
//! - **effectful** gates sit on both the state and the depend chain
//!   (loads, stores, checks, calls, generic bytecodes)
//! - **selectors** merge values or effects at a merge point
//! - **pure** gates have only value inputs and float freely until scheduled

use super::meta::GateMeta;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpCode {
    /// Soft-deleted gate
    Nop,

    // Roots
    StateEntry,
    DependEntry,
    ArgList,

    // Control
    IfBranch,
    IfTrue,
    IfFalse,
    Merge,
    LoopBegin,
    LoopBack,
    LoopExit,
    Return,

    // Selectors
    ValueSelector,
    DependSelector,
    LoopExitValue,
    LoopExitDepend,

    // Pure values
    Arg,
    Constant,
    FrameState,
    Select,

    // Machine integer arithmetic
    Add,
    Sub,
    Mul,
    Sdiv,
    Udiv,
    Smod,
    Umod,
    And,
    Or,
    Xor,
    Shl,
    Lsr,
    Asr,
    Icmp,

    // Machine float arithmetic
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fmod,
    Fcmp,
    Fsqrt,
    Fabs,
    Ffloor,

    // Conversions
    Sext,
    Zext,
    Trunc,
    Fext,
    Ftrunc,
    SignedIntToFloat,
    FloatToSignedInt,
    Bitcast,

    // Memory and runtime
    Load,
    Store,
    DeoptCheck,
    RuntimeCall,

    // Generic bytecode
    JsBytecode,

    // Speculative checks
    PrimitiveTypeCheck,
    HeapObjectCheck,
    ObjectTypeCheck,
    StableArrayCheck,
    TypedArrayCheck,
    IndexCheck,
    ProtoChangeMarkerCheck,
    TypedCallTargetCheck,

    // Typed mid-level operations
    TypedBinaryOp,
    TypedUnaryOp,
    LoadHClass,
    LoadProperty,
    LoadPropertyOnProto,
    StoreProperty,
    TransitionShape,
    LoadTypedArrayLength,
    LoadArrayLength,
    LoadStringLength,
    LoadElement,
    StoreElement,
    CallGetter,
    TypedCall,
    BuiltinCall,
}

bitflags! {
    /// Structural properties of an opcode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpFlags: u16 {
        /// One of the circuit roots
        const ROOT = 1 << 0;
        /// Control gate
        const CONTROL = 1 << 1;
        /// Member of the state chain (other gates may take it as a state input)
        const STATE_CHAIN = 1 << 2;
        /// Produces a memory effect other gates may depend on
        const DEPEND_PRODUCER = 1 << 3;
        /// Takes one state and one depend input and stays pinned in its block
        const EFFECTFUL = 1 << 4;
        /// Merges per-predecessor inputs
        const SELECTOR = 1 << 5;
        /// Starts a basic block
        const BLOCK_START = 1 << 6;
        /// Loop header
        const LOOP_HEADER = 1 << 7;
        /// Deoptimization guard emitted by speculative lowering
        const CHECK = 1 << 8;
        /// Has no state or depend inputs
        const PURE = 1 << 9;
    }
}

/// Opcode family used to key metadata equality rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFamily {
    Root,
    Control,
    Selector,
    Constant,
    Arg,
    FrameState,
    Arithmetic,
    Conversion,
    Memory,
    Bytecode,
    Check,
    CallTargetCheck,
    Typed,
    Call,
}

/// Expected count for one edge list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::AtLeast(n) => write!(f, "{}+", n),
        }
    }
}

/// Edge-list arities of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub state: Arity,
    pub depend: Arity,
    pub value: Arity,
}

impl Signature {
    const fn new(state: Arity, depend: Arity, value: Arity) -> Self {
        Self { state, depend, value }
    }

    const fn pure(values: usize) -> Self {
        Self::new(Arity::Exact(0), Arity::Exact(0), Arity::Exact(values))
    }

    const fn effectful(values: usize) -> Self {
        Self::new(Arity::Exact(1), Arity::Exact(1), Arity::Exact(values))
    }

    pub fn accepts(&self, state: usize, depend: usize, value: usize) -> bool {
        self.state.accepts(state) && self.depend.accepts(depend) && self.value.accepts(value)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state={} depend={} value={}", self.state, self.depend, self.value)
    }
}

impl OpCode {
    pub fn flags(self) -> OpFlags {
        use OpCode::*;
        let chain = OpFlags::CONTROL | OpFlags::STATE_CHAIN;
        let effect = OpFlags::EFFECTFUL | OpFlags::STATE_CHAIN | OpFlags::DEPEND_PRODUCER;
        match self {
            Nop => OpFlags::empty(),
            StateEntry => OpFlags::ROOT | chain | OpFlags::BLOCK_START,
            DependEntry => OpFlags::ROOT | OpFlags::DEPEND_PRODUCER,
            ArgList => OpFlags::ROOT,
            IfBranch | LoopBack => chain,
            IfTrue | IfFalse | Merge | LoopExit => chain | OpFlags::BLOCK_START,
            LoopBegin => chain | OpFlags::BLOCK_START | OpFlags::LOOP_HEADER,
            Return => OpFlags::CONTROL | OpFlags::STATE_CHAIN,
            ValueSelector | LoopExitValue => OpFlags::SELECTOR,
            DependSelector | LoopExitDepend => OpFlags::SELECTOR | OpFlags::DEPEND_PRODUCER,
            PrimitiveTypeCheck | HeapObjectCheck | ObjectTypeCheck | StableArrayCheck
            | TypedArrayCheck | IndexCheck | ProtoChangeMarkerCheck | TypedCallTargetCheck
            | DeoptCheck => effect | OpFlags::CHECK,
            Load | Store | RuntimeCall | JsBytecode | TypedBinaryOp | TypedUnaryOp | LoadHClass
            | LoadProperty | LoadPropertyOnProto | StoreProperty | TransitionShape
            | LoadTypedArrayLength | LoadArrayLength | LoadStringLength | LoadElement
            | StoreElement | CallGetter | TypedCall => effect,
            _ => OpFlags::PURE,
        }
    }

    pub fn family(self) -> OpFamily {
        use OpCode::*;
        match self {
            Nop | StateEntry | DependEntry | ArgList => OpFamily::Root,
            IfBranch | IfTrue | IfFalse | Merge | LoopBegin | LoopBack | LoopExit | Return => {
                OpFamily::Control
            }
            ValueSelector | DependSelector | LoopExitValue | LoopExitDepend => OpFamily::Selector,
            Constant => OpFamily::Constant,
            Arg => OpFamily::Arg,
            FrameState => OpFamily::FrameState,
            Select | Add | Sub | Mul | Sdiv | Udiv | Smod | Umod | And | Or | Xor | Shl | Lsr
            | Asr | Icmp | Fadd | Fsub | Fmul | Fdiv | Fmod | Fcmp | Fsqrt | Fabs | Ffloor => {
                OpFamily::Arithmetic
            }
            Sext | Zext | Trunc | Fext | Ftrunc | SignedIntToFloat | FloatToSignedInt | Bitcast => {
                OpFamily::Conversion
            }
            Load | Store | LoadHClass | LoadProperty | LoadPropertyOnProto | StoreProperty
            | TransitionShape | LoadTypedArrayLength | LoadArrayLength | LoadStringLength
            | LoadElement | StoreElement => OpFamily::Memory,
            JsBytecode => OpFamily::Bytecode,
            TypedCallTargetCheck => OpFamily::CallTargetCheck,
            PrimitiveTypeCheck | HeapObjectCheck | ObjectTypeCheck | StableArrayCheck
            | TypedArrayCheck | IndexCheck | ProtoChangeMarkerCheck | DeoptCheck => OpFamily::Check,
            TypedBinaryOp | TypedUnaryOp | BuiltinCall => OpFamily::Typed,
            RuntimeCall | CallGetter | TypedCall => OpFamily::Call,
        }
    }

    /// Expected edge counts for a gate of this opcode with `meta`
    pub fn signature(self, meta: &GateMeta) -> Signature {
        use Arity::*;
        use OpCode::*;
        let width = meta.width().unwrap_or(0);
        match self {
            Nop => Signature::new(AtLeast(0), AtLeast(0), AtLeast(0)),
            StateEntry | DependEntry | ArgList | Constant => Signature::pure(0),
            IfBranch => Signature::new(Exact(1), Exact(0), Exact(1)),
            IfTrue | IfFalse | LoopBack | LoopExit => Signature::new(Exact(1), Exact(0), Exact(0)),
            Merge => Signature::new(Exact(width), Exact(0), Exact(0)),
            LoopBegin => Signature::new(Exact(2), Exact(0), Exact(0)),
            Return => Signature::effectful(1),
            ValueSelector => Signature::new(Exact(1), Exact(0), Exact(width)),
            DependSelector => Signature::new(Exact(1), Exact(width), Exact(0)),
            LoopExitValue => Signature::new(Exact(1), Exact(0), Exact(1)),
            LoopExitDepend => Signature::new(Exact(1), Exact(1), Exact(0)),
            Arg => Signature::pure(1),
            FrameState => Signature::new(Exact(0), Exact(0), AtLeast(0)),
            Select => Signature::pure(3),
            Add | Sub | Mul | Sdiv | Udiv | Smod | Umod | And | Or | Xor | Shl | Lsr | Asr | Icmp
            | Fadd | Fsub | Fmul | Fdiv | Fmod | Fcmp => Signature::pure(2),
            Fsqrt | Fabs | Ffloor | Sext | Zext | Trunc | Fext | Ftrunc | SignedIntToFloat
            | FloatToSignedInt | Bitcast => Signature::pure(1),
            BuiltinCall => Signature::pure(1),
            Load => Signature::effectful(2),
            Store => Signature::effectful(3),
            DeoptCheck => Signature::effectful(2),
            RuntimeCall => match meta {
                GateMeta::Runtime { argc, .. } => Signature::effectful(*argc as usize),
                _ => Signature::new(Exact(1), Exact(1), AtLeast(0)),
            },
            JsBytecode => match meta {
                GateMeta::Bytecode(info) => match info.op.value_count(info.argc) {
                    Some(n) => Signature::effectful(n),
                    None => Signature::new(Exact(1), Exact(1), AtLeast(0)),
                },
                _ => Signature::new(Exact(1), Exact(1), AtLeast(0)),
            },
            // value, frame state
            PrimitiveTypeCheck | HeapObjectCheck | ObjectTypeCheck | StableArrayCheck
            | TypedArrayCheck | ProtoChangeMarkerCheck => Signature::effectful(2),
            // length, index, frame state
            IndexCheck => Signature::effectful(3),
            // callee, expected method word, frame state
            TypedCallTargetCheck => Signature::effectful(3),
            // lhs, rhs, frame state
            TypedBinaryOp => Signature::effectful(3),
            // operand, frame state
            TypedUnaryOp => Signature::effectful(2),
            LoadHClass | LoadProperty | LoadPropertyOnProto | TransitionShape
            | LoadTypedArrayLength | LoadArrayLength | LoadStringLength | CallGetter => {
                Signature::effectful(1)
            }
            StoreProperty | LoadElement => Signature::effectful(2),
            StoreElement => Signature::effectful(3),
            TypedCall => match meta {
                GateMeta::Call { argc } => Signature::effectful(*argc as usize + 2),
                _ => Signature::new(Exact(1), Exact(1), AtLeast(2)),
            },
        }
    }

    pub fn is_control(self) -> bool {
        self.flags().contains(OpFlags::CONTROL)
    }

    pub fn is_state_chain(self) -> bool {
        self.flags().contains(OpFlags::STATE_CHAIN)
    }

    pub fn is_effectful(self) -> bool {
        self.flags().contains(OpFlags::EFFECTFUL)
    }

    pub fn is_depend_producer(self) -> bool {
        self.flags().contains(OpFlags::DEPEND_PRODUCER)
    }

    pub fn is_selector(self) -> bool {
        self.flags().contains(OpFlags::SELECTOR)
    }

    pub fn is_block_start(self) -> bool {
        self.flags().contains(OpFlags::BLOCK_START)
    }

    pub fn is_loop_header(self) -> bool {
        self.flags().contains(OpFlags::LOOP_HEADER)
    }

    pub fn is_check(self) -> bool {
        self.flags().contains(OpFlags::CHECK)
    }

    pub fn is_root(self) -> bool {
        self.flags().contains(OpFlags::ROOT)
    }

    /// Pure value computation: no state or depend inputs, not a root
    pub fn is_pure(self) -> bool {
        self.flags().contains(OpFlags::PURE)
    }

    /// Machine integer binary operation
    pub fn is_int_binary(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Add | Sub | Mul | Sdiv | Udiv | Smod | Umod | And | Or | Xor | Shl | Lsr | Asr
        )
    }

    /// Machine float binary operation
    pub fn is_float_binary(self) -> bool {
        use OpCode::*;
        matches!(self, Fadd | Fsub | Fmul | Fdiv | Fmod)
    }

    pub fn is_conversion(self) -> bool {
        self.family() == OpFamily::Conversion
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
