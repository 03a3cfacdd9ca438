//! Typed read access to gates
//!
//! `GateAccessor` is a stateless view: every query goes straight to the
//! circuit. Mutations (`set_input`, `replace_gate`, type refinement) live on
//! [`Circuit`] itself so that a pass holding an accessor never aliases a
//! mutable borrow.

use super::layout;
use super::meta::{BytecodeInfo, GateMeta};
use super::meta_equal::MetaEqualityTable;
use super::opcode::OpCode;
use super::types::{GateType, MachineType};
use super::{Circuit, EdgeKind, GateRef, Use};

#[derive(Clone, Copy)]
pub struct GateAccessor<'a> {
    circuit: &'a Circuit,
}

impl<'a> GateAccessor<'a> {
    pub fn new(circuit: &'a Circuit) -> Self {
        Self { circuit }
    }

    pub fn circuit(&self) -> &'a Circuit {
        self.circuit
    }

    pub fn opcode(&self, gate: GateRef) -> OpCode {
        self.circuit.gate(gate).op()
    }

    pub fn meta(&self, gate: GateRef) -> &'a GateMeta {
        self.circuit.gate(gate).meta()
    }

    pub fn machine_type(&self, gate: GateRef) -> MachineType {
        self.circuit.gate(gate).machine_type()
    }

    pub fn gate_type(&self, gate: GateRef) -> GateType {
        self.circuit.gate(gate).gate_type()
    }

    pub fn is_nop(&self, gate: GateRef) -> bool {
        !self.circuit.is_live(gate)
    }

    pub fn state_in(&self, gate: GateRef, index: usize) -> GateRef {
        self.circuit.gate(gate).state_ins()[index]
    }

    pub fn depend_in(&self, gate: GateRef, index: usize) -> GateRef {
        self.circuit.gate(gate).depend_ins()[index]
    }

    pub fn value_in(&self, gate: GateRef, index: usize) -> GateRef {
        self.circuit.gate(gate).value_ins()[index]
    }

    pub fn state_count(&self, gate: GateRef) -> usize {
        self.circuit.gate(gate).state_ins().len()
    }

    pub fn depend_count(&self, gate: GateRef) -> usize {
        self.circuit.gate(gate).depend_ins().len()
    }

    pub fn value_count(&self, gate: GateRef) -> usize {
        self.circuit.gate(gate).value_ins().len()
    }

    pub fn value_ins(&self, gate: GateRef) -> &'a [GateRef] {
        self.circuit.gate(gate).value_ins()
    }

    /// The state input of an effectful or single-predecessor gate
    pub fn state_of(&self, gate: GateRef) -> GateRef {
        self.circuit.gate(gate).state_ins().first().copied().unwrap_or(GateRef::NULL)
    }

    /// The depend input of an effectful gate
    pub fn depend_of(&self, gate: GateRef) -> GateRef {
        self.circuit.gate(gate).depend_ins().first().copied().unwrap_or(GateRef::NULL)
    }

    /// Users of `gate` that are still live
    pub fn uses(&self, gate: GateRef) -> impl Iterator<Item = Use> + 'a {
        let circuit = self.circuit;
        circuit
            .gate(gate)
            .uses()
            .iter()
            .copied()
            .filter(move |u| circuit.is_live(u.user))
    }

    pub fn uses_of_kind(&self, gate: GateRef, kind: EdgeKind) -> impl Iterator<Item = Use> + 'a {
        self.uses(gate).filter(move |u| u.kind == kind)
    }

    pub fn value_uses(&self, gate: GateRef) -> impl Iterator<Item = Use> + 'a {
        self.uses_of_kind(gate, EdgeKind::Value)
    }

    pub fn has_value_uses(&self, gate: GateRef) -> bool {
        self.value_uses(gate).next().is_some()
    }

    /// The next gate on the state chain, skipping selectors
    pub fn state_successors(&self, gate: GateRef) -> impl Iterator<Item = GateRef> + 'a {
        let circuit = self.circuit;
        self.uses_of_kind(gate, EdgeKind::State)
            .map(|u| u.user)
            .filter(move |u| circuit.gate(*u).op().is_state_chain())
    }

    pub fn is_constant(&self, gate: GateRef) -> bool {
        self.opcode(gate) == OpCode::Constant
    }

    pub fn constant_value(&self, gate: GateRef) -> Option<u64> {
        if self.is_constant(gate) {
            self.meta(gate).constant_bits()
        } else {
            None
        }
    }

    /// Constant tagged int, if `gate` is one
    pub fn constant_tagged_int(&self, gate: GateRef) -> Option<i32> {
        self.constant_value(gate)
            .filter(|bits| layout::is_tagged_int(*bits))
            .map(layout::untag_int)
    }

    pub fn bytecode_info(&self, gate: GateRef) -> Option<&'a BytecodeInfo> {
        match self.opcode(gate) {
            OpCode::JsBytecode => self.meta(gate).bytecode(),
            _ => None,
        }
    }

    /// The frame state input of a check or typed operation
    pub fn frame_state_of(&self, gate: GateRef) -> Option<GateRef> {
        self.value_ins(gate)
            .iter()
            .rev()
            .copied()
            .find(|v| !v.is_null() && self.opcode(*v) == OpCode::FrameState)
    }

    /// Selectors attached to a merge or loop header
    pub fn selectors_of(&self, merge: GateRef) -> Vec<GateRef> {
        let circuit = self.circuit;
        self.uses_of_kind(merge, EdgeKind::State)
            .map(|u| u.user)
            .filter(|u| circuit.gate(*u).op().is_selector())
            .collect()
    }

    /// The depend selector of a merge or loop header
    pub fn depend_selector_of(&self, merge: GateRef) -> Option<GateRef> {
        self.selectors_of(merge)
            .into_iter()
            .find(|s| self.opcode(*s) == OpCode::DependSelector)
    }

    /// Whether the metadata of two gates is interchangeable under `table`
    pub fn meta_equal(&self, table: &MetaEqualityTable, a: GateRef, b: GateRef) -> bool {
        self.opcode(a) == self.opcode(b) && table.equal(self.opcode(a), self.meta(a), self.meta(b))
    }

    pub fn dump(&self, gate: GateRef) -> String {
        self.circuit.dump_gate(gate)
    }
}

impl Circuit {
    /// Typed read access to this circuit
    pub fn acc(&self) -> GateAccessor<'_> {
        GateAccessor::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::builder::CircuitBuilder;
    use crate::circuit::CircuitInfo;
    use crate::pgo::MethodId;

    #[test]
    fn test_edges_and_constants() {
        let mut circuit = Circuit::new(CircuitInfo::new("acc", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let one = builder.int32(1);
        let two = builder.int32(2);
        let sum = builder.int_add(MachineType::I32, one, two);
        let acc = circuit.acc();
        assert_eq!(acc.value_in(sum, 0), one);
        assert_eq!(acc.value_count(sum), 2);
        assert_eq!(acc.constant_value(two), Some(2));
        assert_eq!(acc.constant_value(sum), None);
        assert_eq!(acc.value_uses(one).count(), 1);
        assert!(acc.dump(sum).contains("Add"));
    }

    #[test]
    fn test_deleted_users_are_hidden() {
        let mut circuit = Circuit::new(CircuitInfo::new("acc", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let one = builder.int32(1);
        let sum = builder.int_add(MachineType::I32, one, one);
        let frame = builder.frame_state(MethodId(0), 0, &[sum]);
        circuit.delete_gate(frame);
        assert_eq!(circuit.acc().value_uses(sum).count(), 0);
        assert!(circuit.acc().is_nop(frame));
    }
}
