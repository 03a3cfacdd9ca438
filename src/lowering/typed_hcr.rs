//! Mid-level lowering of typed gates
//!
//! Expands the guarded typed gates produced from bytecodes into machine
//! operations on the object layout described in [`crate::circuit::layout`]:
//! tag tests, hidden-class loads, field loads and stores, element address
//! arithmetic and untag/compute/retag arithmetic. Checks become
//! `DeoptCheck` gates, or disappear when checks are disabled.
//!
//! Calls (`TypedCall`, `CallGetter`, `RuntimeCall`) are left for the code
//! generator.

use crate::circuit::layout::{self, *};
use crate::circuit::{
    Circuit, CircuitBuilder, DeoptReason, FcmpCond, GateMeta, GateRef, GateType, IcmpCond, MachineType, OpCode,
    ParamType, TypedBinOp, TypedUnOp,
};
use crate::config::CompilerOptions;
use crate::pass::{rewire_effects, PassStats, PassVisitor, VisitResult};
use crate::pgo::{BuiltinId, ElementKind, OnHeapMode, PropertyLookupResult, ShapeId};

fn element_machine_type(kind: ElementKind) -> MachineType {
    match kind {
        ElementKind::Int8 | ElementKind::Uint8 | ElementKind::Uint8Clamped => MachineType::I8,
        ElementKind::Int16 | ElementKind::Uint16 => MachineType::I16,
        ElementKind::Int32 | ElementKind::Uint32 => MachineType::I32,
        ElementKind::Float32 => MachineType::F32,
        ElementKind::Float64 => MachineType::F64,
        ElementKind::Tagged | ElementKind::BigInt64 | ElementKind::BigUint64 => MachineType::I64,
    }
}

fn int_condition(op: TypedBinOp) -> Option<IcmpCond> {
    Some(match op {
        TypedBinOp::Less => IcmpCond::Slt,
        TypedBinOp::LessEq => IcmpCond::Sle,
        TypedBinOp::Greater => IcmpCond::Sgt,
        TypedBinOp::GreaterEq => IcmpCond::Sge,
        TypedBinOp::Eq => IcmpCond::Eq,
        TypedBinOp::NotEq => IcmpCond::Ne,
        _ => return None,
    })
}

fn float_condition(op: TypedBinOp) -> Option<FcmpCond> {
    Some(match op {
        TypedBinOp::Less => FcmpCond::Olt,
        TypedBinOp::LessEq => FcmpCond::Ole,
        TypedBinOp::Greater => FcmpCond::Ogt,
        TypedBinOp::GreaterEq => FcmpCond::Oge,
        TypedBinOp::Eq => FcmpCond::Oeq,
        TypedBinOp::NotEq => FcmpCond::Une,
        _ => return None,
    })
}

pub struct TypedHcrLowering {
    no_check: bool,
    trace: bool,
    lowered: u64,
}

impl TypedHcrLowering {
    pub fn new(options: &CompilerOptions) -> Self {
        Self {
            no_check: options.no_check,
            trace: options.trace_enabled("hcr-lowering"),
            lowered: 0,
        }
    }

    /// Gates lowered so far
    pub fn lowered(&self) -> u64 {
        self.lowered
    }

    fn deopt(&self, b: &mut CircuitBuilder<'_>, cond: GateRef, frame: GateRef, reason: DeoptReason) {
        if !self.no_check {
            b.deopt_check(cond, frame, reason);
        }
    }

    fn deopt_unless_heap_object(&self, b: &mut CircuitBuilder<'_>, value: GateRef, frame: GateRef, reason: DeoptReason) {
        if !self.no_check {
            let cond = b.is_heap_object(value);
            b.deopt_check(cond, frame, reason);
        }
    }

    /// Lower `gate`; `None` leaves it untouched
    fn lower(&self, b: &mut CircuitBuilder<'_>, gate: GateRef) -> Option<GateRef> {
        let g = b.circuit().gate(gate);
        let (op, meta, gt) = (g.op(), g.meta().clone(), g.gate_type());
        let values = g.value_ins().to_vec();
        let value = match (op, meta) {
            (op, meta) if op.is_check() && op != OpCode::DeoptCheck => {
                if !self.no_check {
                    self.lower_check(b, op, &meta, &values)?;
                }
                GateRef::NULL
            }
            (OpCode::LoadHClass, _) => b.load_hclass(values[0]),
            (OpCode::LoadTypedArrayLength, _) => b.load_const_offset(MachineType::I64, gt, values[0], TYPED_ARRAY_LENGTH_OFFSET),
            (OpCode::LoadArrayLength, _) => b.load_const_offset(MachineType::I64, gt, values[0], JS_ARRAY_LENGTH_OFFSET),
            (OpCode::LoadStringLength, _) => b.load_const_offset(MachineType::I64, gt, values[0], STRING_LENGTH_OFFSET),
            (OpCode::LoadProperty, GateMeta::Property(plr)) => {
                let (base, offset) = property_slot(b, values[0], plr);
                b.load_const_offset(MachineType::I64, gt, base, offset)
            }
            (OpCode::LoadPropertyOnProto, GateMeta::ProtoProperty { plr, depth }) => {
                let mut holder = values[0];
                for _ in 0..depth {
                    let hclass = b.load_hclass(holder);
                    holder = b.load_const_offset(MachineType::I64, GateType::TaggedPointer, hclass, HCLASS_PROTOTYPE_OFFSET);
                }
                let (base, offset) = property_slot(b, holder, plr);
                b.load_const_offset(MachineType::I64, gt, base, offset)
            }
            (OpCode::StoreProperty, GateMeta::Property(plr)) => {
                let (base, offset) = property_slot(b, values[0], plr);
                b.store_const_offset(base, offset, values[1]);
                GateRef::NULL
            }
            (OpCode::TransitionShape, GateMeta::Transition { to, .. }) => {
                let shape = b.shape_const(to);
                b.store_const_offset(values[0], HCLASS_OFFSET, shape);
                GateRef::NULL
            }
            (OpCode::LoadElement, GateMeta::Element { kind, mode }) => self.lower_load_element(b, kind, mode, &values, gt)?,
            (OpCode::StoreElement, GateMeta::Element { kind, mode }) => {
                self.lower_store_element(b, kind, mode, &values)?;
                GateRef::NULL
            }
            (OpCode::TypedBinaryOp, GateMeta::TypedBinary { op, operand }) => self.lower_binary(b, op, operand, &values)?,
            (OpCode::TypedUnaryOp, GateMeta::TypedUnary { op, operand }) => self.lower_unary(b, op, operand, &values)?,
            (OpCode::BuiltinCall, GateMeta::Builtin(id)) => {
                let input = b.tagged_number_to_double(values[0]);
                let op = match id {
                    BuiltinId::MathSqrt => OpCode::Fsqrt,
                    BuiltinId::MathAbs => OpCode::Fabs,
                    BuiltinId::MathFloor => OpCode::Ffloor,
                };
                let result = b.unary(op, MachineType::F64, input);
                b.double_to_tagged(result)
            }
            _ => return None,
        };
        Some(value)
    }

    fn lower_check(&self, b: &mut CircuitBuilder<'_>, op: OpCode, meta: &GateMeta, values: &[GateRef]) -> Option<()> {
        let value = values[0];
        let frame = values[values.len() - 1];
        match (op, meta) {
            (OpCode::PrimitiveTypeCheck, GateMeta::PrimitiveCheck(param)) => {
                let reason = DeoptReason::for_param(*param);
                let cond = match param {
                    ParamType::Int => b.is_tagged_int(value),
                    ParamType::Double => b.is_tagged_double(value),
                    ParamType::Number => b.is_tagged_number(value),
                    ParamType::Boolean => {
                        let yes = b.tagged_bool(true);
                        let no = b.tagged_bool(false);
                        let is_true = b.icmp(IcmpCond::Eq, value, yes);
                        let is_false = b.icmp(IcmpCond::Eq, value, no);
                        b.bool_or(is_true, is_false)
                    }
                    ParamType::String => {
                        self.deopt_unless_heap_object(b, value, frame, reason);
                        let hclass = b.load_hclass(value);
                        object_type_is(b, hclass, OBJECT_TYPE_STRING)
                    }
                };
                b.deopt_check(cond, frame, reason);
            }
            (OpCode::HeapObjectCheck, _) => self.deopt_unless_heap_object(b, value, frame, DeoptReason::NotHeapObject),
            (OpCode::ObjectTypeCheck, GateMeta::Shape(shape)) => {
                self.deopt_unless_heap_object(b, value, frame, DeoptReason::NotHeapObject);
                let cond = hclass_is(b, value, *shape);
                b.deopt_check(cond, frame, DeoptReason::WrongShape);
            }
            (OpCode::StableArrayCheck, _) => {
                self.deopt_unless_heap_object(b, value, frame, DeoptReason::NotStableArray);
                let hclass = b.load_hclass(value);
                let is_array = object_type_is(b, hclass, OBJECT_TYPE_JS_ARRAY);
                let stable = hclass_bit_set(b, hclass, HCLASS_STABLE_ELEMENTS_BIT);
                let cond = b.bool_and(is_array, stable);
                b.deopt_check(cond, frame, DeoptReason::NotStableArray);
            }
            (OpCode::TypedArrayCheck, GateMeta::TypedArray(kind)) => {
                self.deopt_unless_heap_object(b, value, frame, DeoptReason::NotTypedArray);
                let hclass = b.load_hclass(value);
                let cond = object_type_is(b, hclass, layout::typed_array_object_type(*kind));
                b.deopt_check(cond, frame, DeoptReason::NotTypedArray);
            }
            (OpCode::IndexCheck, _) => {
                // lengths and indices are tagged ints; unsigned compare also
                // rejects negative indices
                let length = b.tagged_to_int32(values[0]);
                let index = b.tagged_to_int32(values[1]);
                let cond = b.icmp(IcmpCond::Ult, index, length);
                b.deopt_check(cond, frame, DeoptReason::IndexOutOfRange);
            }
            (OpCode::ProtoChangeMarkerCheck, _) => {
                let hclass = b.load_hclass(value);
                let marker =
                    b.load_const_offset(MachineType::I64, GateType::NJSValue, hclass, HCLASS_PROTO_CHANGE_MARKER_OFFSET);
                let zero = b.int64(0);
                let cond = b.icmp(IcmpCond::Eq, marker, zero);
                b.deopt_check(cond, frame, DeoptReason::ProtoChanged);
            }
            (OpCode::TypedCallTargetCheck, _) => {
                self.deopt_unless_heap_object(b, value, frame, DeoptReason::WrongCallTarget);
                let method = b.load_const_offset(MachineType::ArchWord, GateType::NJSValue, value, FUNCTION_METHOD_OFFSET);
                let cond = b.icmp(IcmpCond::Eq, method, values[1]);
                b.deopt_check(cond, frame, DeoptReason::WrongCallTarget);
            }
            _ => return None,
        }
        Some(())
    }

    fn lower_load_element(
        &self,
        b: &mut CircuitBuilder<'_>,
        kind: ElementKind,
        mode: OnHeapMode,
        values: &[GateRef],
        gt: GateType,
    ) -> Option<GateRef> {
        if kind.is_bigint() {
            return None;
        }
        let (base, offset) = element_address(b, kind, mode, values[0], values[1]);
        let raw = b.load(element_machine_type(kind), GateType::NJSValue, base, offset);
        let value = match kind {
            ElementKind::Tagged => {
                b.circuit().set_gate_type(raw, gt);
                raw
            }
            ElementKind::Int8 | ElementKind::Int16 => {
                let wide = b.sext(raw, MachineType::I32);
                b.int32_to_tagged(wide)
            }
            ElementKind::Uint8 | ElementKind::Uint8Clamped | ElementKind::Uint16 => {
                let wide = b.zext(raw, MachineType::I32);
                b.int32_to_tagged(wide)
            }
            ElementKind::Int32 => b.int32_to_tagged(raw),
            ElementKind::Uint32 => {
                // may exceed int32, so always a double
                let wide = b.zext(raw, MachineType::I64);
                let float = b.int_to_float(wide);
                b.double_to_tagged(float)
            }
            ElementKind::Float32 => {
                let wide = b.fext(raw);
                b.double_to_tagged(wide)
            }
            ElementKind::Float64 => b.double_to_tagged(raw),
            ElementKind::BigInt64 | ElementKind::BigUint64 => return None,
        };
        Some(value)
    }

    fn lower_store_element(&self, b: &mut CircuitBuilder<'_>, kind: ElementKind, mode: OnHeapMode, values: &[GateRef]) -> Option<()> {
        if kind.is_bigint() {
            return None;
        }
        let (base, offset) = element_address(b, kind, mode, values[0], values[1]);
        let stored = if kind == ElementKind::Tagged {
            values[2]
        } else {
            let number = b.tagged_number_to_double(values[2]);
            narrow_number(b, kind, number)
        };
        b.store(base, offset, stored);
        Some(())
    }

    fn lower_binary(&self, b: &mut CircuitBuilder<'_>, op: TypedBinOp, operand: ParamType, values: &[GateRef]) -> Option<GateRef> {
        let frame = values[2];
        if operand != ParamType::Int {
            let lhs = untag_float(b, operand, values[0]);
            let rhs = untag_float(b, operand, values[1]);
            if let Some(cond) = float_condition(op) {
                let cmp = b.fcmp(cond, lhs, rhs);
                return Some(b.bool_to_tagged(cmp));
            }
            let machine_op = match op {
                TypedBinOp::Add => OpCode::Fadd,
                TypedBinOp::Sub => OpCode::Fsub,
                TypedBinOp::Mul => OpCode::Fmul,
                TypedBinOp::Div => OpCode::Fdiv,
                TypedBinOp::Mod => OpCode::Fmod,
                _ => return None,
            };
            let result = b.binary(machine_op, MachineType::F64, lhs, rhs);
            return Some(b.double_to_tagged(result));
        }

        let lhs = b.tagged_to_int32(values[0]);
        let rhs = b.tagged_to_int32(values[1]);
        if let Some(cond) = int_condition(op) {
            let cmp = b.icmp(cond, lhs, rhs);
            return Some(b.bool_to_tagged(cmp));
        }
        let result = match op {
            TypedBinOp::Add | TypedBinOp::Sub | TypedBinOp::Mul => {
                let machine_op = match op {
                    TypedBinOp::Add => OpCode::Add,
                    TypedBinOp::Sub => OpCode::Sub,
                    _ => OpCode::Mul,
                };
                let wide_lhs = b.sext(lhs, MachineType::I64);
                let wide_rhs = b.sext(rhs, MachineType::I64);
                let wide = b.binary(machine_op, MachineType::I64, wide_lhs, wide_rhs);
                let narrow = self.checked_narrow(b, wide, frame);
                if op == TypedBinOp::Mul && !self.no_check {
                    // 0 * -n is -0, which has no int representation
                    let zero = b.int32(0);
                    let is_zero = b.icmp(IcmpCond::Eq, narrow, zero);
                    let lhs_neg = b.icmp(IcmpCond::Slt, lhs, zero);
                    let rhs_neg = b.icmp(IcmpCond::Slt, rhs, zero);
                    let any_neg = b.bool_or(lhs_neg, rhs_neg);
                    let minus_zero = b.bool_and(is_zero, any_neg);
                    let yes = b.boolean(true);
                    let ok = b.binary(OpCode::Xor, MachineType::I1, minus_zero, yes);
                    b.deopt_check(ok, frame, DeoptReason::MinusZero);
                }
                narrow
            }
            TypedBinOp::Div => {
                let lhs = b.int_to_float(lhs);
                let rhs = b.int_to_float(rhs);
                let quotient = b.binary(OpCode::Fdiv, MachineType::F64, lhs, rhs);
                return Some(b.double_to_tagged(quotient));
            }
            TypedBinOp::Mod => {
                let zero = b.int32(0);
                let positive = b.icmp(IcmpCond::Sgt, rhs, zero);
                self.deopt(b, positive, frame, DeoptReason::Overflow);
                let non_negative = b.icmp(IcmpCond::Sge, lhs, zero);
                self.deopt(b, non_negative, frame, DeoptReason::MinusZero);
                b.binary(OpCode::Smod, MachineType::I32, lhs, rhs)
            }
            TypedBinOp::And => b.binary(OpCode::And, MachineType::I32, lhs, rhs),
            TypedBinOp::Or => b.binary(OpCode::Or, MachineType::I32, lhs, rhs),
            TypedBinOp::Xor => b.binary(OpCode::Xor, MachineType::I32, lhs, rhs),
            TypedBinOp::Shl | TypedBinOp::Shr | TypedBinOp::Ashr => {
                let mask = b.int32(31);
                let count = b.int_and(MachineType::I32, rhs, mask);
                let machine_op = match op {
                    TypedBinOp::Shl => OpCode::Shl,
                    TypedBinOp::Shr => OpCode::Lsr,
                    _ => OpCode::Asr,
                };
                let shifted = b.binary(machine_op, MachineType::I32, lhs, count);
                if op == TypedBinOp::Shr {
                    // results above i32::MAX are not ints
                    let zero = b.int32(0);
                    let fits = b.icmp(IcmpCond::Sge, shifted, zero);
                    self.deopt(b, fits, frame, DeoptReason::Overflow);
                }
                shifted
            }
            _ => return None,
        };
        Some(b.int32_to_tagged(result))
    }

    fn lower_unary(&self, b: &mut CircuitBuilder<'_>, op: TypedUnOp, operand: ParamType, values: &[GateRef]) -> Option<GateRef> {
        let frame = values[1];
        if operand != ParamType::Int {
            let value = untag_float(b, operand, values[0]);
            let result = match op {
                TypedUnOp::Inc | TypedUnOp::Dec => {
                    let one = b.double(1.0);
                    let machine_op = if op == TypedUnOp::Inc { OpCode::Fadd } else { OpCode::Fsub };
                    b.binary(machine_op, MachineType::F64, value, one)
                }
                TypedUnOp::Neg => {
                    let minus_one = b.double(-1.0);
                    b.binary(OpCode::Fmul, MachineType::F64, value, minus_one)
                }
                TypedUnOp::Not => {
                    let zero = b.double(0.0);
                    let is_zero = b.fcmp(FcmpCond::Oeq, value, zero);
                    let is_nan = b.fcmp(FcmpCond::Une, value, value);
                    let falsy = b.bool_or(is_zero, is_nan);
                    return Some(b.bool_to_tagged(falsy));
                }
            };
            return Some(b.double_to_tagged(result));
        }

        let value = b.tagged_to_int32(values[0]);
        let result = match op {
            TypedUnOp::Inc | TypedUnOp::Dec => {
                let wide = b.sext(value, MachineType::I64);
                let one = b.int64(1);
                let machine_op = if op == TypedUnOp::Inc { OpCode::Add } else { OpCode::Sub };
                let sum = b.binary(machine_op, MachineType::I64, wide, one);
                self.checked_narrow(b, sum, frame)
            }
            TypedUnOp::Neg => {
                let zero = b.int32(0);
                let nonzero = b.icmp(IcmpCond::Ne, value, zero);
                self.deopt(b, nonzero, frame, DeoptReason::MinusZero);
                let min = b.int32(i32::MIN);
                let not_min = b.icmp(IcmpCond::Ne, value, min);
                self.deopt(b, not_min, frame, DeoptReason::Overflow);
                b.int_sub(MachineType::I32, zero, value)
            }
            TypedUnOp::Not => {
                let zero = b.int32(0);
                let is_zero = b.icmp(IcmpCond::Eq, value, zero);
                return Some(b.bool_to_tagged(is_zero));
            }
        };
        Some(b.int32_to_tagged(result))
    }

    /// Truncate a 64-bit result to 32 bits, deoptimizing when it does not fit
    fn checked_narrow(&self, b: &mut CircuitBuilder<'_>, wide: GateRef, frame: GateRef) -> GateRef {
        let narrow = b.trunc(wide, MachineType::I32);
        if !self.no_check {
            let back = b.sext(narrow, MachineType::I64);
            let fits = b.icmp(IcmpCond::Eq, back, wide);
            b.deopt_check(fits, frame, DeoptReason::Overflow);
        }
        narrow
    }
}

impl PassVisitor for TypedHcrLowering {
    fn name(&self) -> &'static str {
        "hcr-lowering"
    }

    fn visit_gate(&mut self, circuit: &mut Circuit, gate: GateRef) -> VisitResult {
        let mut b = CircuitBuilder::before(circuit, gate);
        let Some(value) = self.lower(&mut b, gate) else {
            return VisitResult::NoChange;
        };
        let (state, depend) = (b.state(), b.depend());
        rewire_effects(circuit, gate, state, depend);
        self.lowered += 1;
        if self.trace {
            tracing::debug!("hcr-lowering: lowered {}", circuit.dump_gate(gate));
        }
        VisitResult::Replace(value)
    }

    fn finish(&mut self, stats: &mut PassStats) {
        stats.bump("hcr-lowering.lowered", self.lowered);
        self.lowered = 0;
    }
}

fn hclass_is(b: &mut CircuitBuilder<'_>, object: GateRef, shape: ShapeId) -> GateRef {
    let hclass = b.load_hclass(object);
    let expected = b.shape_const(shape);
    b.icmp(IcmpCond::Eq, hclass, expected)
}

fn object_type_is(b: &mut CircuitBuilder<'_>, hclass: GateRef, object_type: u64) -> GateRef {
    let actual = b.load_const_offset(MachineType::I32, GateType::NJSValue, hclass, HCLASS_OBJECT_TYPE_OFFSET);
    let expected = b.int32(object_type as i32);
    b.icmp(IcmpCond::Eq, actual, expected)
}

fn hclass_bit_set(b: &mut CircuitBuilder<'_>, hclass: GateRef, bit: u64) -> GateRef {
    let bits = b.load_const_offset(MachineType::I32, GateType::NJSValue, hclass, HCLASS_BIT_FIELD_OFFSET);
    let mask = b.int32(bit as i32);
    let masked = b.int_and(MachineType::I32, bits, mask);
    let zero = b.int32(0);
    b.icmp(IcmpCond::Ne, masked, zero)
}

/// Base and byte offset of a named property slot
fn property_slot(b: &mut CircuitBuilder<'_>, object: GateRef, plr: PropertyLookupResult) -> (GateRef, u64) {
    if plr.is_in_object() {
        (object, layout::in_object_offset(plr.offset))
    } else {
        let properties = b.load_const_offset(MachineType::I64, GateType::TaggedPointer, object, PROPERTIES_OFFSET);
        (properties, layout::tagged_array_offset(plr.offset))
    }
}

fn untag_float(b: &mut CircuitBuilder<'_>, operand: ParamType, value: GateRef) -> GateRef {
    match operand {
        ParamType::Double => b.untag_double(value),
        _ => b.tagged_number_to_double(value),
    }
}

/// Base address and byte offset of element `index`
fn element_address(
    b: &mut CircuitBuilder<'_>,
    kind: ElementKind,
    mode: OnHeapMode,
    object: GateRef,
    index: GateRef,
) -> (GateRef, GateRef) {
    let index = b.tagged_to_int32(index);
    let index = b.zext(index, MachineType::I64);
    let size = b.int64(kind.byte_size() as i64);
    let scaled = b.int_mul(MachineType::I64, index, size);
    if kind == ElementKind::Tagged {
        let elements = b.load_const_offset(MachineType::I64, GateType::TaggedPointer, object, ELEMENTS_OFFSET);
        let header = b.int64(TAGGED_ARRAY_DATA_OFFSET as i64);
        let offset = b.int_add(MachineType::I64, scaled, header);
        return (elements, offset);
    }
    let base = match mode {
        OnHeapMode::OnHeap => on_heap_data(b, object),
        OnHeapMode::NotOnHeap => off_heap_data(b, object),
        OnHeapMode::Unknown => {
            let hclass = b.load_hclass(object);
            let on_heap = hclass_bit_set(b, hclass, HCLASS_ON_HEAP_BIT);
            let depend = b.depend();
            let (_, if_false) = b.branch(on_heap);
            let inline = on_heap_data(b, object);
            let inline_arm = (b.state(), b.depend(), inline);
            b.set_position(if_false, depend);
            let external = off_heap_data(b, object);
            let external_arm = (b.state(), b.depend(), external);
            b.join(&[inline_arm, external_arm], MachineType::I64, GateType::NJSValue)
        }
    };
    (base, scaled)
}

fn on_heap_data(b: &mut CircuitBuilder<'_>, object: GateRef) -> GateRef {
    let bytes = b.load_const_offset(MachineType::I64, GateType::TaggedPointer, object, TYPED_ARRAY_VIEWED_BUFFER_OFFSET);
    let header = b.int64(BYTE_ARRAY_DATA_OFFSET as i64);
    b.int_add(MachineType::I64, bytes, header)
}

fn off_heap_data(b: &mut CircuitBuilder<'_>, object: GateRef) -> GateRef {
    let buffer = b.load_const_offset(MachineType::I64, GateType::TaggedPointer, object, TYPED_ARRAY_VIEWED_BUFFER_OFFSET);
    let data = b.load_const_offset(MachineType::I64, GateType::NJSValue, buffer, ARRAY_BUFFER_DATA_OFFSET);
    let byte_offset = b.load_const_offset(MachineType::I64, GateType::IntType, object, TYPED_ARRAY_BYTE_OFFSET_OFFSET);
    let byte_offset = b.tagged_to_int32(byte_offset);
    let byte_offset = b.zext(byte_offset, MachineType::I64);
    b.int_add(MachineType::I64, data, byte_offset)
}

/// Convert an f64 to the storage representation of `kind`
fn narrow_number(b: &mut CircuitBuilder<'_>, kind: ElementKind, number: GateRef) -> GateRef {
    match kind {
        ElementKind::Float64 => number,
        ElementKind::Float32 => b.ftrunc(number),
        ElementKind::Uint8Clamped => {
            let zero = b.double(0.0);
            let max = b.double(255.0);
            let is_nan = b.fcmp(FcmpCond::Une, number, number);
            let below = b.fcmp(FcmpCond::Olt, number, zero);
            let low = b.bool_or(is_nan, below);
            let clamped = b.select(low, zero, number, MachineType::F64, GateType::NJSValue);
            let above = b.fcmp(FcmpCond::Ogt, clamped, max);
            let clamped = b.select(above, max, clamped, MachineType::F64, GateType::NJSValue);
            // round half to even
            let half = b.double(0.5);
            let shifted = b.binary(OpCode::Fadd, MachineType::F64, clamped, half);
            let rounded = b.unary(OpCode::Ffloor, MachineType::F64, shifted);
            let int = b.float_to_int(rounded, MachineType::I32);
            let tie = b.fcmp(FcmpCond::Oeq, shifted, rounded);
            let one = b.int32(1);
            let low_bit = b.int_and(MachineType::I32, int, one);
            let even = b.int32(0);
            let odd = b.icmp(IcmpCond::Ne, low_bit, even);
            let round_down = b.bool_and(tie, odd);
            let lower = b.int_sub(MachineType::I32, int, one);
            let int = b.select(round_down, lower, int, MachineType::I32, GateType::NJSValue);
            b.trunc(int, MachineType::I8)
        }
        _ => {
            // ToInt32: truncation modulo 2^32, NaN and infinities store 0
            let modulus = b.double(4294967296.0);
            let reduced = b.binary(OpCode::Fmod, MachineType::F64, number, modulus);
            let finite = b.fcmp(FcmpCond::Oeq, reduced, reduced);
            let zero = b.double(0.0);
            let reduced = b.select(finite, reduced, zero, MachineType::F64, GateType::NJSValue);
            let wide = b.float_to_int(reduced, MachineType::I64);
            let int = b.trunc(wide, MachineType::I32);
            match element_machine_type(kind) {
                MachineType::I32 => int,
                narrow => b.trunc(int, narrow),
            }
        }
    }
}
