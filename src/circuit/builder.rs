//! Gate construction helpers
//!
//! A [`CircuitBuilder`] tracks a current position: the state and depend
//! producers that the next effectful gate is chained after. Pure gates ignore
//! the position; effectful gates consume it and become the new position.

use super::layout;
use super::meta::{BytecodeInfo, DeoptReason, FcmpCond, GateMeta, IcmpCond};
use super::opcode::OpCode;
use super::types::{GateType, MachineType};
use super::{Circuit, EdgeKind, GateRef};
use crate::pgo::{MethodId, ShapeId};

pub struct CircuitBuilder<'c> {
    circuit: &'c mut Circuit,
    state: GateRef,
    depend: GateRef,
}

impl<'c> CircuitBuilder<'c> {
    /// Builder positioned at the circuit entry
    pub fn new(circuit: &'c mut Circuit) -> Self {
        let state = circuit.state_entry();
        let depend = circuit.depend_entry();
        Self { circuit, state, depend }
    }

    /// Builder positioned just before `gate`, i.e. at its state and depend
    /// inputs
    pub fn before(circuit: &'c mut Circuit, gate: GateRef) -> Self {
        let state = circuit.acc().state_of(gate);
        let depend = circuit.acc().depend_of(gate);
        Self { circuit, state, depend }
    }

    pub fn circuit(&mut self) -> &mut Circuit {
        self.circuit
    }

    pub fn state(&self) -> GateRef {
        self.state
    }

    pub fn depend(&self) -> GateRef {
        self.depend
    }

    pub fn set_state(&mut self, state: GateRef) {
        self.state = state;
    }

    pub fn set_depend(&mut self, depend: GateRef) {
        self.depend = depend;
    }

    pub fn set_position(&mut self, state: GateRef, depend: GateRef) {
        self.state = state;
        self.depend = depend;
    }

    // ---- constants ----

    pub fn constant(&mut self, machine_type: MachineType, bits: u64, gate_type: GateType) -> GateRef {
        self.circuit.constant(machine_type, bits, gate_type)
    }

    pub fn int32(&mut self, value: i32) -> GateRef {
        self.constant(MachineType::I32, value as u32 as u64, GateType::NJSValue)
    }

    pub fn int64(&mut self, value: i64) -> GateRef {
        self.constant(MachineType::I64, value as u64, GateType::NJSValue)
    }

    pub fn word(&mut self, value: u64) -> GateRef {
        self.constant(MachineType::ArchWord, value, GateType::NJSValue)
    }

    pub fn double(&mut self, value: f64) -> GateRef {
        self.constant(MachineType::F64, value.to_bits(), GateType::NJSValue)
    }

    pub fn boolean(&mut self, value: bool) -> GateRef {
        self.constant(MachineType::I1, value as u64, GateType::NJSValue)
    }

    pub fn tagged_int(&mut self, value: i32) -> GateRef {
        self.constant(MachineType::I64, layout::tagged_int(value), GateType::IntType)
    }

    pub fn tagged_double(&mut self, value: f64) -> GateRef {
        self.constant(MachineType::I64, layout::tagged_double(value), GateType::DoubleType)
    }

    pub fn tagged_bool(&mut self, value: bool) -> GateRef {
        self.constant(MachineType::I64, layout::tagged_bool(value), GateType::BooleanType)
    }

    pub fn undefined(&mut self) -> GateRef {
        self.constant(MachineType::I64, layout::VALUE_UNDEFINED, GateType::UndefinedType)
    }

    /// Address of a hidden class, comparable with a loaded hidden class word
    pub fn shape_const(&mut self, shape: ShapeId) -> GateRef {
        self.constant(MachineType::ArchWord, layout::shape_word(shape), GateType::NJSValue)
    }

    /// Address of a method descriptor
    pub fn method_const(&mut self, method: MethodId) -> GateRef {
        self.constant(MachineType::ArchWord, layout::method_word(method), GateType::NJSValue)
    }

    pub fn arg(&mut self, index: u32, gate_type: GateType) -> GateRef {
        self.circuit.arg(index, gate_type)
    }

    // ---- pure arithmetic ----

    fn pure(&mut self, op: OpCode, meta: GateMeta, mt: MachineType, values: &[GateRef], gt: GateType) -> GateRef {
        self.circuit.new_gate(op, meta, mt, &[], &[], values, gt)
    }

    pub fn binary(&mut self, op: OpCode, mt: MachineType, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.pure(op, GateMeta::None, mt, &[lhs, rhs], GateType::NJSValue)
    }

    pub fn int_add(&mut self, mt: MachineType, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.binary(OpCode::Add, mt, lhs, rhs)
    }

    pub fn int_sub(&mut self, mt: MachineType, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.binary(OpCode::Sub, mt, lhs, rhs)
    }

    pub fn int_mul(&mut self, mt: MachineType, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.binary(OpCode::Mul, mt, lhs, rhs)
    }

    pub fn int_and(&mut self, mt: MachineType, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.binary(OpCode::And, mt, lhs, rhs)
    }

    pub fn int_or(&mut self, mt: MachineType, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.binary(OpCode::Or, mt, lhs, rhs)
    }

    pub fn icmp(&mut self, cond: IcmpCond, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.pure(OpCode::Icmp, GateMeta::Icmp(cond), MachineType::I1, &[lhs, rhs], GateType::NJSValue)
    }

    pub fn fcmp(&mut self, cond: FcmpCond, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.pure(OpCode::Fcmp, GateMeta::Fcmp(cond), MachineType::I1, &[lhs, rhs], GateType::NJSValue)
    }

    pub fn unary(&mut self, op: OpCode, mt: MachineType, value: GateRef) -> GateRef {
        self.pure(op, GateMeta::None, mt, &[value], GateType::NJSValue)
    }

    pub fn select(&mut self, cond: GateRef, on_true: GateRef, on_false: GateRef, mt: MachineType, gt: GateType) -> GateRef {
        self.pure(OpCode::Select, GateMeta::None, mt, &[cond, on_true, on_false], gt)
    }

    pub fn bool_and(&mut self, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.binary(OpCode::And, MachineType::I1, lhs, rhs)
    }

    pub fn bool_or(&mut self, lhs: GateRef, rhs: GateRef) -> GateRef {
        self.binary(OpCode::Or, MachineType::I1, lhs, rhs)
    }

    // ---- conversions ----

    pub fn sext(&mut self, value: GateRef, to: MachineType) -> GateRef {
        self.unary(OpCode::Sext, to, value)
    }

    pub fn zext(&mut self, value: GateRef, to: MachineType) -> GateRef {
        self.unary(OpCode::Zext, to, value)
    }

    pub fn trunc(&mut self, value: GateRef, to: MachineType) -> GateRef {
        self.unary(OpCode::Trunc, to, value)
    }

    pub fn fext(&mut self, value: GateRef) -> GateRef {
        self.unary(OpCode::Fext, MachineType::F64, value)
    }

    pub fn ftrunc(&mut self, value: GateRef) -> GateRef {
        self.unary(OpCode::Ftrunc, MachineType::F32, value)
    }

    pub fn int_to_float(&mut self, value: GateRef) -> GateRef {
        self.unary(OpCode::SignedIntToFloat, MachineType::F64, value)
    }

    pub fn float_to_int(&mut self, value: GateRef, to: MachineType) -> GateRef {
        self.unary(OpCode::FloatToSignedInt, to, value)
    }

    pub fn bitcast(&mut self, value: GateRef, to: MachineType) -> GateRef {
        self.unary(OpCode::Bitcast, to, value)
    }

    // ---- tagged values ----

    pub fn is_tagged_int(&mut self, value: GateRef) -> GateRef {
        let mark = self.int64(layout::TAG_MARK as i64);
        let tag = self.int_and(MachineType::I64, value, mark);
        let int_tag = self.int64(layout::TAG_INT as i64);
        self.icmp(IcmpCond::Eq, tag, int_tag)
    }

    pub fn is_tagged_number(&mut self, value: GateRef) -> GateRef {
        let mark = self.int64(layout::TAG_MARK as i64);
        let tag = self.int_and(MachineType::I64, value, mark);
        let zero = self.int64(0);
        self.icmp(IcmpCond::Ne, tag, zero)
    }

    pub fn is_tagged_double(&mut self, value: GateRef) -> GateRef {
        let number = self.is_tagged_number(value);
        let int = self.is_tagged_int(value);
        let yes = self.boolean(true);
        let not_int = self.binary(OpCode::Xor, MachineType::I1, int, yes);
        self.bool_and(number, not_int)
    }

    pub fn is_heap_object(&mut self, value: GateRef) -> GateRef {
        let mask = self.int64(layout::TAG_HEAP_OBJECT_MASK as i64);
        let bits = self.int_and(MachineType::I64, value, mask);
        let zero = self.int64(0);
        self.icmp(IcmpCond::Eq, bits, zero)
    }

    pub fn tagged_to_int32(&mut self, value: GateRef) -> GateRef {
        self.trunc(value, MachineType::I32)
    }

    pub fn int32_to_tagged(&mut self, value: GateRef) -> GateRef {
        let wide = self.zext(value, MachineType::I64);
        let tag = self.int64(layout::TAG_INT as i64);
        let tagged = self.int_or(MachineType::I64, wide, tag);
        self.circuit.set_gate_type(tagged, GateType::IntType);
        tagged
    }

    pub fn untag_double(&mut self, value: GateRef) -> GateRef {
        let offset = self.int64(layout::DOUBLE_ENCODE_OFFSET as i64);
        let raw = self.int_sub(MachineType::I64, value, offset);
        self.bitcast(raw, MachineType::F64)
    }

    pub fn double_to_tagged(&mut self, value: GateRef) -> GateRef {
        let raw = self.bitcast(value, MachineType::I64);
        let offset = self.int64(layout::DOUBLE_ENCODE_OFFSET as i64);
        let tagged = self.int_add(MachineType::I64, raw, offset);
        self.circuit.set_gate_type(tagged, GateType::DoubleType);
        tagged
    }

    pub fn bool_to_tagged(&mut self, cond: GateRef) -> GateRef {
        let yes = self.tagged_bool(true);
        let no = self.tagged_bool(false);
        self.select(cond, yes, no, MachineType::I64, GateType::BooleanType)
    }

    /// Tagged int or double to f64
    pub fn tagged_number_to_double(&mut self, value: GateRef) -> GateRef {
        let is_int = self.is_tagged_int(value);
        let int = self.tagged_to_int32(value);
        let from_int = self.int_to_float(int);
        let from_double = self.untag_double(value);
        self.select(is_int, from_int, from_double, MachineType::F64, GateType::NJSValue)
    }

    // ---- effectful gates ----

    /// Create an effectful gate at the current position and advance past it
    pub fn effect(&mut self, op: OpCode, meta: GateMeta, mt: MachineType, values: &[GateRef], gt: GateType) -> GateRef {
        let gate = self.circuit.new_gate(op, meta, mt, &[self.state], &[self.depend], values, gt);
        self.state = gate;
        self.depend = gate;
        gate
    }

    pub fn load(&mut self, mt: MachineType, gt: GateType, base: GateRef, offset: GateRef) -> GateRef {
        self.effect(OpCode::Load, GateMeta::None, mt, &[base, offset], gt)
    }

    pub fn load_const_offset(&mut self, mt: MachineType, gt: GateType, base: GateRef, offset: u64) -> GateRef {
        let offset = self.word(offset);
        self.load(mt, gt, base, offset)
    }

    pub fn store(&mut self, base: GateRef, offset: GateRef, value: GateRef) -> GateRef {
        self.effect(OpCode::Store, GateMeta::None, MachineType::NoValue, &[base, offset, value], GateType::Empty)
    }

    pub fn store_const_offset(&mut self, base: GateRef, offset: u64, value: GateRef) -> GateRef {
        let offset = self.word(offset);
        self.store(base, offset, value)
    }

    /// Load the hidden class word of a heap object
    pub fn load_hclass(&mut self, object: GateRef) -> GateRef {
        self.load_const_offset(MachineType::ArchWord, GateType::NJSValue, object, layout::HCLASS_OFFSET)
    }

    pub fn deopt_check(&mut self, cond: GateRef, frame_state: GateRef, reason: DeoptReason) -> GateRef {
        self.effect(
            OpCode::DeoptCheck,
            GateMeta::Deopt(reason),
            MachineType::NoValue,
            &[cond, frame_state],
            GateType::Empty,
        )
    }

    pub fn frame_state(&mut self, method: MethodId, pc: u32, values: &[GateRef]) -> GateRef {
        self.pure(OpCode::FrameState, GateMeta::FrameState { method, pc }, MachineType::NoValue, values, GateType::Empty)
    }

    pub fn bytecode(&mut self, info: BytecodeInfo, values: &[GateRef]) -> GateRef {
        let mt = if info.op.has_result() { MachineType::I64 } else { MachineType::NoValue };
        let gt = if info.op.has_result() { GateType::AnyType } else { GateType::Empty };
        self.effect(OpCode::JsBytecode, GateMeta::Bytecode(info), mt, values, gt)
    }

    // ---- control ----

    /// End the current block with a two-way branch; returns the true and
    /// false successors. The position is left on the true successor.
    pub fn branch(&mut self, cond: GateRef) -> (GateRef, GateRef) {
        let branch = self
            .circuit
            .new_gate(OpCode::IfBranch, GateMeta::None, MachineType::NoValue, &[self.state], &[], &[cond], GateType::Empty);
        let if_true = self.control(OpCode::IfTrue, branch);
        let if_false = self.control(OpCode::IfFalse, branch);
        self.state = if_true;
        (if_true, if_false)
    }

    fn control(&mut self, op: OpCode, pred: GateRef) -> GateRef {
        self.circuit
            .new_gate(op, GateMeta::None, MachineType::NoValue, &[pred], &[], &[], GateType::Empty)
    }

    pub fn merge(&mut self, states: &[GateRef]) -> GateRef {
        let merge = self.circuit.new_gate(
            OpCode::Merge,
            GateMeta::Width(states.len() as u32),
            MachineType::NoValue,
            states,
            &[],
            &[],
            GateType::Empty,
        );
        self.state = merge;
        merge
    }

    pub fn value_selector(&mut self, merge: GateRef, mt: MachineType, gt: GateType, values: &[GateRef]) -> GateRef {
        self.circuit.new_gate(
            OpCode::ValueSelector,
            GateMeta::Width(values.len() as u32),
            mt,
            &[merge],
            &[],
            values,
            gt,
        )
    }

    pub fn depend_selector(&mut self, merge: GateRef, depends: &[GateRef]) -> GateRef {
        let selector = self.circuit.new_gate(
            OpCode::DependSelector,
            GateMeta::Width(depends.len() as u32),
            MachineType::NoValue,
            &[merge],
            depends,
            &[],
            GateType::Empty,
        );
        self.depend = selector;
        selector
    }

    /// Join several `(state, depend, value)` arms; `value` may be `NULL` for
    /// every arm when the arms produce no value.
    pub fn join(&mut self, arms: &[(GateRef, GateRef, GateRef)], mt: MachineType, gt: GateType) -> GateRef {
        if arms.len() == 1 {
            let (state, depend, value) = arms[0];
            self.set_position(state, depend);
            return value;
        }
        let states: Vec<GateRef> = arms.iter().map(|a| a.0).collect();
        let depends: Vec<GateRef> = arms.iter().map(|a| a.1).collect();
        let merge = self.merge(&states);
        self.depend_selector(merge, &depends);
        if arms.iter().all(|a| a.2.is_null()) {
            return GateRef::NULL;
        }
        let values: Vec<GateRef> = arms.iter().map(|a| a.2).collect();
        self.value_selector(merge, mt, gt, &values)
    }

    /// Open a loop after the current position; the back edge is attached by
    /// [`CircuitBuilder::loop_back`]
    pub fn loop_begin(&mut self) -> GateRef {
        let header = self.circuit.new_gate(
            OpCode::LoopBegin,
            GateMeta::None,
            MachineType::NoValue,
            &[self.state, GateRef::NULL],
            &[],
            &[],
            GateType::Empty,
        );
        self.state = header;
        header
    }

    /// Loop-carried value with its back input left open
    pub fn loop_phi(&mut self, header: GateRef, mt: MachineType, gt: GateType, init: GateRef) -> GateRef {
        self.value_selector(header, mt, gt, &[init, GateRef::NULL])
    }

    /// Loop-carried memory state with its back input left open
    pub fn loop_depend_phi(&mut self, header: GateRef) -> GateRef {
        let depend = self.depend;
        self.depend_selector(header, &[depend, GateRef::NULL])
    }

    /// Close the loop: the current position becomes the back edge
    pub fn loop_back(&mut self, header: GateRef) -> GateRef {
        let back = self.control(OpCode::LoopBack, self.state);
        self.circuit.set_input(header, EdgeKind::State, 1, back);
        back
    }

    pub fn set_back_input(&mut self, selector: GateRef, kind: EdgeKind, value: GateRef) {
        self.circuit.set_input(selector, kind, 1, value);
    }

    pub fn loop_exit(&mut self, from: GateRef) -> GateRef {
        let exit = self.control(OpCode::LoopExit, from);
        self.state = exit;
        exit
    }

    pub fn loop_exit_value(&mut self, exit: GateRef, value: GateRef) -> GateRef {
        let mt = self.circuit.gate(value).machine_type();
        let gt = self.circuit.gate(value).gate_type();
        self.circuit
            .new_gate(OpCode::LoopExitValue, GateMeta::None, mt, &[exit], &[], &[value], gt)
    }

    pub fn loop_exit_depend(&mut self, exit: GateRef) -> GateRef {
        let depend = self.circuit.new_gate(
            OpCode::LoopExitDepend,
            GateMeta::None,
            MachineType::NoValue,
            &[exit],
            &[self.depend],
            &[],
            GateType::Empty,
        );
        self.depend = depend;
        depend
    }

    pub fn ret(&mut self, value: GateRef) -> GateRef {
        let ret = self.circuit.new_gate(
            OpCode::Return,
            GateMeta::None,
            MachineType::NoValue,
            &[self.state],
            &[self.depend],
            &[value],
            GateType::Empty,
        );
        self.state = GateRef::NULL;
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitInfo;

    #[test]
    fn test_effect_chain_advances() {
        let mut circuit = Circuit::new(CircuitInfo::new("b", MethodId(0)));
        let entry = circuit.state_entry();
        let mut builder = CircuitBuilder::new(&mut circuit);
        let obj = builder.arg(2, GateType::TaggedPointer);
        let hclass = builder.load_hclass(obj);
        assert_eq!(builder.state(), hclass);
        assert_eq!(builder.depend(), hclass);
        let acc = circuit.acc();
        assert_eq!(acc.state_in(hclass, 0), entry);
    }

    #[test]
    fn test_join_single_arm_passes_through() {
        let mut circuit = Circuit::new(CircuitInfo::new("b", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let v = builder.tagged_int(1);
        let (s, d) = (builder.state(), builder.depend());
        let out = builder.join(&[(s, d, v)], MachineType::I64, GateType::IntType);
        assert_eq!(out, v);
    }

    #[test]
    fn test_diamond_join() {
        let mut circuit = Circuit::new(CircuitInfo::new("b", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let cond = builder.boolean(true);
        let one = builder.tagged_int(1);
        let two = builder.tagged_int(2);
        let depend = builder.depend();
        let (t, f) = builder.branch(cond);
        let phi = builder.join(&[(t, depend, one), (f, depend, two)], MachineType::I64, GateType::IntType);
        let merge = builder.state();
        let acc = circuit.acc();
        assert_eq!(acc.opcode(merge), OpCode::Merge);
        assert_eq!(acc.opcode(phi), OpCode::ValueSelector);
        assert_eq!(acc.state_in(phi, 0), merge);
        assert!(acc.depend_selector_of(merge).is_some());
    }

    #[test]
    fn test_loop_construction() {
        let mut circuit = Circuit::new(CircuitInfo::new("b", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let zero = builder.tagged_int(0);
        let header = builder.loop_begin();
        let phi = builder.loop_phi(header, MachineType::I64, GateType::IntType, zero);
        builder.loop_depend_phi(header);
        let back = builder.loop_back(header);
        builder.set_back_input(phi, EdgeKind::Value, phi);
        let acc = circuit.acc();
        assert_eq!(acc.state_in(header, 1), back);
        assert_eq!(acc.value_in(phi, 1), phi);
    }
}
