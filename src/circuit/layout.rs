//! Tagged value encoding and object field offsets
//!
//! JS values are 64-bit words:
//!
//! | Pattern                         | Meaning                      |
//! |---------------------------------|------------------------------|
//! | `0xFFFF_0000_xxxx_xxxx`         | int32 in the low half        |
//! | `bits(f64) + 2^48`              | double (top 16 bits nonzero) |
//! | top 16 bits zero, low bits zero | heap object pointer          |
//! | small constants with bit 1 set  | hole, null, undefined, bools |

use crate::pgo::{ElementKind, MethodId, ShapeId};

pub const TAG_INT: u64 = 0xFFFF_0000_0000_0000;
pub const TAG_MARK: u64 = 0xFFFF_0000_0000_0000;
pub const DOUBLE_ENCODE_OFFSET: u64 = 1 << 48;
pub const TAG_SPECIAL: u64 = 0x02;
pub const TAG_BOOLEAN: u64 = 0x04;
pub const TAG_HEAP_OBJECT_MASK: u64 = TAG_MARK | TAG_SPECIAL;

pub const VALUE_HOLE: u64 = 0x00;
pub const VALUE_NULL: u64 = TAG_SPECIAL;
pub const VALUE_FALSE: u64 = TAG_BOOLEAN | TAG_SPECIAL;
pub const VALUE_TRUE: u64 = VALUE_FALSE | 0x01;
pub const VALUE_UNDEFINED: u64 = TAG_SPECIAL | 0x08;

// Object header
pub const HCLASS_OFFSET: u64 = 0;
pub const PROPERTIES_OFFSET: u64 = 8;
pub const ELEMENTS_OFFSET: u64 = 16;
pub const IN_OBJECT_PROPERTIES_OFFSET: u64 = 24;

// Hidden class fields
pub const HCLASS_PROTOTYPE_OFFSET: u64 = 8;
pub const HCLASS_OBJECT_TYPE_OFFSET: u64 = 16;
pub const HCLASS_BIT_FIELD_OFFSET: u64 = 20;
pub const HCLASS_PROTO_CHANGE_MARKER_OFFSET: u64 = 24;

pub const HCLASS_STABLE_ELEMENTS_BIT: u64 = 1 << 0;
pub const HCLASS_ON_HEAP_BIT: u64 = 1 << 1;

// Tagged arrays (properties and elements storage)
pub const TAGGED_ARRAY_LENGTH_OFFSET: u64 = 8;
pub const TAGGED_ARRAY_DATA_OFFSET: u64 = 16;

// Arrays, strings and typed arrays; lengths are stored as tagged ints
pub const JS_ARRAY_LENGTH_OFFSET: u64 = 24;
pub const STRING_LENGTH_OFFSET: u64 = 8;
pub const TYPED_ARRAY_VIEWED_BUFFER_OFFSET: u64 = 24;
pub const TYPED_ARRAY_LENGTH_OFFSET: u64 = 32;
pub const TYPED_ARRAY_BYTE_OFFSET_OFFSET: u64 = 40;
pub const BYTE_ARRAY_DATA_OFFSET: u64 = 16;
pub const ARRAY_BUFFER_DATA_OFFSET: u64 = 24;

// Functions and accessor pairs
pub const FUNCTION_METHOD_OFFSET: u64 = 24;
pub const ACCESSOR_GETTER_OFFSET: u64 = 8;

// Object type codes stored in the hidden class
pub const OBJECT_TYPE_STRING: u64 = 1;
pub const OBJECT_TYPE_JS_ARRAY: u64 = 2;
pub const OBJECT_TYPE_TYPED_ARRAY_FIRST: u64 = 16;

/// Hidden classes live in a non-moving space; this is where the profiler's
/// shape ids are mapped to compile-time constant addresses.
pub const SHAPE_SPACE_BASE: u64 = 0x0000_1000_0000;
pub const SHAPE_ALIGNMENT: u64 = 0x40;
pub const METHOD_SPACE_BASE: u64 = 0x0000_2000_0000;

pub const fn tagged_int(value: i32) -> u64 {
    TAG_INT | (value as u32 as u64)
}

pub fn tagged_double(value: f64) -> u64 {
    value.to_bits().wrapping_add(DOUBLE_ENCODE_OFFSET)
}

pub const fn tagged_bool(value: bool) -> u64 {
    if value {
        VALUE_TRUE
    } else {
        VALUE_FALSE
    }
}

pub const fn is_tagged_int(bits: u64) -> bool {
    bits & TAG_MARK == TAG_INT
}

pub const fn is_tagged_double(bits: u64) -> bool {
    let top = bits & TAG_MARK;
    top != 0 && top != TAG_INT
}

pub const fn is_tagged_number(bits: u64) -> bool {
    bits & TAG_MARK != 0
}

pub const fn is_heap_object(bits: u64) -> bool {
    bits & TAG_HEAP_OBJECT_MASK == 0 && bits != VALUE_HOLE
}

pub const fn untag_int(bits: u64) -> i32 {
    bits as u32 as i32
}

pub fn untag_double(bits: u64) -> f64 {
    f64::from_bits(bits.wrapping_sub(DOUBLE_ENCODE_OFFSET))
}

/// Numeric value of a tagged int or double
pub fn untag_number(bits: u64) -> Option<f64> {
    if is_tagged_int(bits) {
        Some(untag_int(bits) as f64)
    } else if is_tagged_double(bits) {
        Some(untag_double(bits))
    } else {
        None
    }
}

pub const fn untag_bool(bits: u64) -> Option<bool> {
    match bits {
        VALUE_TRUE => Some(true),
        VALUE_FALSE => Some(false),
        _ => None,
    }
}

/// Tag a number, preferring the int representation when exact
pub fn tagged_number(value: f64) -> u64 {
    if value.fract() == 0.0
        && value >= i32::MIN as f64
        && value <= i32::MAX as f64
        && !(value == 0.0 && value.is_sign_negative())
    {
        tagged_int(value as i32)
    } else {
        tagged_double(value)
    }
}

/// Compile-time address of a hidden class
pub const fn shape_word(shape: ShapeId) -> u64 {
    SHAPE_SPACE_BASE + shape.0 as u64 * SHAPE_ALIGNMENT
}

/// Compile-time address of a method descriptor
pub const fn method_word(method: MethodId) -> u64 {
    METHOD_SPACE_BASE + method.0 as u64 * SHAPE_ALIGNMENT
}

pub fn typed_array_object_type(kind: ElementKind) -> u64 {
    let index = match kind {
        ElementKind::Tagged => return OBJECT_TYPE_JS_ARRAY,
        ElementKind::Int8 => 0,
        ElementKind::Uint8 => 1,
        ElementKind::Uint8Clamped => 2,
        ElementKind::Int16 => 3,
        ElementKind::Uint16 => 4,
        ElementKind::Int32 => 5,
        ElementKind::Uint32 => 6,
        ElementKind::Float32 => 7,
        ElementKind::Float64 => 8,
        ElementKind::BigInt64 => 9,
        ElementKind::BigUint64 => 10,
    };
    OBJECT_TYPE_TYPED_ARRAY_FIRST + index
}

/// Byte offset of an in-object property slot
pub const fn in_object_offset(slot: u32) -> u64 {
    IN_OBJECT_PROPERTIES_OFFSET + slot as u64 * 8
}

/// Byte offset of a slot in a tagged array
pub const fn tagged_array_offset(slot: u32) -> u64 {
    TAGGED_ARRAY_DATA_OFFSET + slot as u64 * 8
}
