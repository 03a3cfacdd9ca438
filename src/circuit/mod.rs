//! Sea-of-nodes graph IR
//!
//! A [`Circuit`] owns an arena of [`Gate`]s addressed by [`GateRef`] indices.
//! Gates are connected by three kinds of edges:
//!
//! - **state** edges order control flow (and pin effectful gates into it)
//! - **depend** edges order memory effects
//! - **value** edges carry data
//!
//! Every gate records its users so that replacing a gate costs O(uses).
//! Deleting a gate turns it into [`OpCode::Nop`] in place: the pool slot stays
//! allocated so that stale edges elsewhere remain valid indices, and every
//! walk over the graph skips `Nop` gates.

pub mod accessor;
pub mod builder;
pub mod layout;
pub mod meta;
pub mod meta_equal;
pub mod opcode;
pub mod serialize;
pub mod types;

pub use accessor::GateAccessor;
pub use builder::CircuitBuilder;
pub use meta::{
    BytecodeInfo, BytecodeOp, CallTargetKind, DeoptReason, FcmpCond, GateMeta, IcmpCond,
    ParamType, RuntimeId, TypedBinOp, TypedUnOp,
};
pub use meta_equal::MetaEqualityTable;
pub use opcode::{Arity, OpCode, OpFamily, OpFlags, Signature};
pub use types::{GateType, MachineType};

use crate::pgo::MethodId;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Index of a gate in its circuit's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GateRef(u32);

impl GateRef {
    /// The sentinel "no gate" reference
    pub const NULL: GateRef = GateRef(u32::MAX);

    pub fn from_index(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        GateRef(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Display for GateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Kind of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    State,
    Depend,
    Value,
}

/// One incoming edge of `user`, seen from the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub user: GateRef,
    pub kind: EdgeKind,
    pub index: usize,
}

/// A node of the graph
#[derive(Debug, Clone)]
pub struct Gate {
    op: OpCode,
    meta: Arc<GateMeta>,
    machine_type: MachineType,
    gate_type: GateType,
    state_ins: Vec<GateRef>,
    depend_ins: Vec<GateRef>,
    value_ins: Vec<GateRef>,
    uses: Vec<Use>,
}

impl Gate {
    pub fn op(&self) -> OpCode {
        self.op
    }

    pub fn meta(&self) -> &GateMeta {
        &self.meta
    }

    pub fn machine_type(&self) -> MachineType {
        self.machine_type
    }

    pub fn gate_type(&self) -> GateType {
        self.gate_type
    }

    pub fn state_ins(&self) -> &[GateRef] {
        &self.state_ins
    }

    pub fn depend_ins(&self) -> &[GateRef] {
        &self.depend_ins
    }

    pub fn value_ins(&self) -> &[GateRef] {
        &self.value_ins
    }

    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    pub fn ins(&self, kind: EdgeKind) -> &[GateRef] {
        match kind {
            EdgeKind::State => &self.state_ins,
            EdgeKind::Depend => &self.depend_ins,
            EdgeKind::Value => &self.value_ins,
        }
    }

    fn ins_mut(&mut self, kind: EdgeKind) -> &mut Vec<GateRef> {
        match kind {
            EdgeKind::State => &mut self.state_ins,
            EdgeKind::Depend => &mut self.depend_ins,
            EdgeKind::Value => &mut self.value_ins,
        }
    }

    pub fn is_nop(&self) -> bool {
        self.op == OpCode::Nop
    }

    /// All inputs in state, depend, value order, with their edge kind
    pub fn inputs(&self) -> impl Iterator<Item = (EdgeKind, usize, GateRef)> + '_ {
        let state = self.state_ins.iter().enumerate().map(|(i, g)| (EdgeKind::State, i, *g));
        let depend = self.depend_ins.iter().enumerate().map(|(i, g)| (EdgeKind::Depend, i, *g));
        let value = self.value_ins.iter().enumerate().map(|(i, g)| (EdgeKind::Value, i, *g));
        state.chain(depend).chain(value)
    }
}

/// Per-method information the front end attaches to a circuit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitInfo {
    pub name: String,
    pub method: MethodId,
    /// Number of bytecodes in the method, used for inlining budgets
    pub bytecode_count: u32,
    /// Number of declared parameters, excluding the callee and `this`
    pub param_count: u32,
}

impl CircuitInfo {
    pub fn new(name: impl Into<String>, method: MethodId) -> Self {
        Self {
            name: name.into(),
            method,
            bytecode_count: 0,
            param_count: 0,
        }
    }
}

/// The gate pool of one compilation unit
#[derive(Debug, Clone)]
pub struct Circuit {
    gates: Vec<Gate>,
    metas: HashMap<GateMeta, Arc<GateMeta>>,
    info: CircuitInfo,
    state_entry: GateRef,
    depend_entry: GateRef,
    arg_list: GateRef,
}

impl Circuit {
    /// Create a circuit holding only its root gates
    pub fn new(info: CircuitInfo) -> Self {
        let mut circuit = Self {
            gates: Vec::new(),
            metas: HashMap::default(),
            info,
            state_entry: GateRef::NULL,
            depend_entry: GateRef::NULL,
            arg_list: GateRef::NULL,
        };
        let none = GateMeta::None;
        circuit.state_entry =
            circuit.new_gate(OpCode::StateEntry, none.clone(), MachineType::NoValue, &[], &[], &[], GateType::Empty);
        circuit.depend_entry =
            circuit.new_gate(OpCode::DependEntry, none.clone(), MachineType::NoValue, &[], &[], &[], GateType::Empty);
        circuit.arg_list =
            circuit.new_gate(OpCode::ArgList, none, MachineType::NoValue, &[], &[], &[], GateType::Empty);
        circuit
    }

    pub fn info(&self) -> &CircuitInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut CircuitInfo {
        &mut self.info
    }

    pub fn state_entry(&self) -> GateRef {
        self.state_entry
    }

    pub fn depend_entry(&self) -> GateRef {
        self.depend_entry
    }

    pub fn arg_list(&self) -> GateRef {
        self.arg_list
    }

    /// Size of the pool, including deleted gates
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Number of gates that are not deleted
    pub fn live_count(&self) -> usize {
        self.gates.iter().filter(|g| !g.is_nop()).count()
    }

    pub fn gate(&self, gate: GateRef) -> &Gate {
        &self.gates[gate.index()]
    }

    pub fn is_live(&self, gate: GateRef) -> bool {
        !gate.is_null() && gate.index() < self.gates.len() && !self.gates[gate.index()].is_nop()
    }

    pub fn is_root(&self, gate: GateRef) -> bool {
        gate == self.state_entry || gate == self.depend_entry || gate == self.arg_list
    }

    /// Iterate over all live gates in pool order
    pub fn live_gates(&self) -> impl Iterator<Item = GateRef> + '_ {
        self.gates
            .iter()
            .enumerate()
            .filter(|(_, g)| !g.is_nop())
            .map(|(i, _)| GateRef::from_index(i))
    }

    /// Share one allocation per distinct metadata value
    pub fn intern_meta(&mut self, meta: GateMeta) -> Arc<GateMeta> {
        if let Some(shared) = self.metas.get(&meta) {
            return Arc::clone(shared);
        }
        let shared = Arc::new(meta.clone());
        self.metas.insert(meta, Arc::clone(&shared));
        shared
    }

    /// Create a gate.
    ///
    /// Inputs may be [`GateRef::NULL`] placeholders that are filled in later
    /// with [`Circuit::set_input`] (loop back edges). Panics when the edge
    /// counts do not match the opcode's signature.
    #[allow(clippy::too_many_arguments)]
    pub fn new_gate(
        &mut self,
        op: OpCode,
        meta: GateMeta,
        machine_type: MachineType,
        state: &[GateRef],
        depend: &[GateRef],
        values: &[GateRef],
        gate_type: GateType,
    ) -> GateRef {
        let signature = op.signature(&meta);
        assert!(
            signature.accepts(state.len(), depend.len(), values.len()),
            "{} {} expects {}, got state={} depend={} value={}",
            op,
            meta,
            signature,
            state.len(),
            depend.len(),
            values.len()
        );
        let id = GateRef::from_index(self.gates.len());
        let meta = self.intern_meta(meta);
        self.gates.push(Gate {
            op,
            meta,
            machine_type,
            gate_type,
            state_ins: state.to_vec(),
            depend_ins: depend.to_vec(),
            value_ins: values.to_vec(),
            uses: Vec::new(),
        });
        for (kind, ins) in [(EdgeKind::State, state), (EdgeKind::Depend, depend), (EdgeKind::Value, values)] {
            for (index, input) in ins.iter().enumerate() {
                self.add_use(*input, Use { user: id, kind, index });
            }
        }
        id
    }

    fn add_use(&mut self, producer: GateRef, edge: Use) {
        if !producer.is_null() {
            self.gates[producer.index()].uses.push(edge);
        }
    }

    fn remove_use(&mut self, producer: GateRef, edge: Use) {
        if producer.is_null() {
            return;
        }
        let uses = &mut self.gates[producer.index()].uses;
        if let Some(pos) = uses.iter().position(|u| *u == edge) {
            uses.swap_remove(pos);
        }
    }

    /// Point input `index` of kind `kind` of `gate` at `new`
    pub fn set_input(&mut self, gate: GateRef, kind: EdgeKind, index: usize, new: GateRef) {
        let old = self.gates[gate.index()].ins(kind)[index];
        if old == new {
            return;
        }
        let edge = Use { user: gate, kind, index };
        self.remove_use(old, edge);
        self.gates[gate.index()].ins_mut(kind)[index] = new;
        self.add_use(new, edge);
    }

    /// Append a value input; used by variadic gates such as frame states
    pub fn push_value_input(&mut self, gate: GateRef, new: GateRef) {
        let index = self.gates[gate.index()].value_ins.len();
        self.gates[gate.index()].value_ins.push(new);
        self.add_use(new, Use { user: gate, kind: EdgeKind::Value, index });
    }

    pub fn set_machine_type(&mut self, gate: GateRef, machine_type: MachineType) {
        self.gates[gate.index()].machine_type = machine_type;
    }

    pub fn set_gate_type(&mut self, gate: GateRef, gate_type: GateType) {
        self.gates[gate.index()].gate_type = gate_type;
    }

    /// Re-point every edge of kind `kind` that targets `old` at `new`
    pub fn replace_uses(&mut self, old: GateRef, kind: EdgeKind, new: GateRef) {
        let uses: Vec<Use> = self.gates[old.index()]
            .uses
            .iter()
            .copied()
            .filter(|u| u.kind == kind)
            .collect();
        for edge in uses {
            self.set_input(edge.user, edge.kind, edge.index, new);
        }
    }

    /// Re-point all uses of `old` at `new`, whatever their kind
    pub fn replace_all_uses(&mut self, old: GateRef, new: GateRef) {
        for kind in [EdgeKind::State, EdgeKind::Depend, EdgeKind::Value] {
            self.replace_uses(old, kind, new);
        }
    }

    /// Replace `old` by the given state, depend and value producers, then
    /// delete it.
    ///
    /// A `NULL` replacement is allowed only for an edge kind `old` has no
    /// uses of.
    pub fn replace_gate(&mut self, old: GateRef, state: GateRef, depend: GateRef, value: GateRef) {
        for (kind, new) in [(EdgeKind::State, state), (EdgeKind::Depend, depend), (EdgeKind::Value, value)] {
            debug_assert!(
                !new.is_null() || !self.gates[old.index()].uses.iter().any(|u| u.kind == kind),
                "{} still has {:?} uses but no replacement",
                old,
                kind
            );
            debug_assert_ne!(old, new, "gate replaced by itself");
            self.replace_uses(old, kind, new);
        }
        self.delete_gate(old);
    }

    /// Soft-delete: the gate becomes a `Nop` with no inputs
    pub fn delete_gate(&mut self, gate: GateRef) {
        if self.gates[gate.index()].is_nop() {
            return;
        }
        let inputs: Vec<(EdgeKind, usize, GateRef)> = self.gates[gate.index()].inputs().collect();
        for (kind, index, input) in inputs {
            self.remove_use(input, Use { user: gate, kind, index });
        }
        let nop = self.intern_meta(GateMeta::None);
        let slot = &mut self.gates[gate.index()];
        slot.op = OpCode::Nop;
        slot.meta = nop;
        slot.machine_type = MachineType::NoValue;
        slot.gate_type = GateType::Empty;
        slot.state_ins.clear();
        slot.depend_ins.clear();
        slot.value_ins.clear();
    }

    /// Create a constant gate
    pub fn constant(&mut self, machine_type: MachineType, bits: u64, gate_type: GateType) -> GateRef {
        self.new_gate(OpCode::Constant, GateMeta::Constant(bits), machine_type, &[], &[], &[], gate_type)
    }

    /// Create the gate for parameter `index`. Parameter 0 is the callee,
    /// parameter 1 is `this`.
    pub fn arg(&mut self, index: u32, gate_type: GateType) -> GateRef {
        let list = self.arg_list;
        self.new_gate(OpCode::Arg, GateMeta::Arg(index), MachineType::I64, &[], &[], &[list], gate_type)
    }

    /// Parameter gates ordered by index
    pub fn args(&self) -> Vec<GateRef> {
        let mut args: Vec<(u32, GateRef)> = self.gates[self.arg_list.index()]
            .uses
            .iter()
            .filter_map(|u| match self.gates[u.user.index()].meta() {
                GateMeta::Arg(index) if self.gates[u.user.index()].op == OpCode::Arg => Some((*index, u.user)),
                _ => None,
            })
            .collect();
        args.sort();
        args.into_iter().map(|(_, g)| g).collect()
    }

    /// Live gates with the given opcode, in pool order
    pub fn gates_with_op(&self, op: OpCode) -> Vec<GateRef> {
        self.live_gates().filter(|g| self.gate(*g).op == op).collect()
    }

    /// Human-readable one-line description of a gate
    pub fn dump_gate(&self, gate: GateRef) -> String {
        let g = self.gate(gate);
        let list = |ins: &[GateRef]| ins.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let mut out = format!("{} {}", gate, g.op);
        let meta = g.meta.to_string();
        if !meta.is_empty() {
            out.push_str(&format!(" [{}]", meta));
        }
        if g.machine_type.has_value() {
            out.push_str(&format!(" : {} {}", g.machine_type, g.gate_type));
        }
        if !g.state_ins.is_empty() {
            out.push_str(&format!(" state({})", list(&g.state_ins)));
        }
        if !g.depend_ins.is_empty() {
            out.push_str(&format!(" depend({})", list(&g.depend_ins)));
        }
        if !g.value_ins.is_empty() {
            out.push_str(&format!(" value({})", list(&g.value_ins)));
        }
        out
    }

    /// Dump every live gate, one per line
    pub fn dump_all(&self) -> String {
        let mut out = String::new();
        for gate in self.live_gates() {
            out.push_str(&self.dump_gate(gate));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> Circuit {
        Circuit::new(CircuitInfo::new("test", MethodId(0)))
    }

    #[test]
    fn test_roots() {
        let circuit = empty();
        assert_eq!(circuit.len(), 3);
        assert_eq!(circuit.gate(circuit.state_entry()).op(), OpCode::StateEntry);
        assert_eq!(circuit.gate(circuit.depend_entry()).op(), OpCode::DependEntry);
        assert!(circuit.is_root(circuit.arg_list()));
    }

    #[test]
    fn test_uses_are_recorded() {
        let mut circuit = empty();
        let a = circuit.constant(MachineType::I32, 1, GateType::IntType);
        let b = circuit.constant(MachineType::I32, 2, GateType::IntType);
        let add = circuit.new_gate(OpCode::Add, GateMeta::None, MachineType::I32, &[], &[], &[a, a], GateType::IntType);
        assert_eq!(circuit.gate(a).uses().len(), 2);
        circuit.set_input(add, EdgeKind::Value, 1, b);
        assert_eq!(circuit.gate(a).uses().len(), 1);
        assert_eq!(circuit.gate(b).uses(), &[Use { user: add, kind: EdgeKind::Value, index: 1 }]);
    }

    #[test]
    #[should_panic(expected = "expects")]
    fn test_wrong_arity_panics() {
        let mut circuit = empty();
        let a = circuit.constant(MachineType::I32, 1, GateType::IntType);
        circuit.new_gate(OpCode::Add, GateMeta::None, MachineType::I32, &[], &[], &[a], GateType::IntType);
    }

    #[test]
    fn test_soft_delete_keeps_slot() {
        let mut circuit = empty();
        let a = circuit.constant(MachineType::I32, 1, GateType::IntType);
        let add = circuit.new_gate(OpCode::Add, GateMeta::None, MachineType::I32, &[], &[], &[a, a], GateType::IntType);
        let len = circuit.len();
        circuit.delete_gate(add);
        assert_eq!(circuit.len(), len);
        assert!(!circuit.is_live(add));
        assert_eq!(circuit.gate(add).op(), OpCode::Nop);
        assert!(circuit.gate(a).uses().is_empty());
        assert!(circuit.live_gates().all(|g| g != add));
    }

    #[test]
    fn test_replace_all_uses() {
        let mut circuit = empty();
        let a = circuit.constant(MachineType::I32, 1, GateType::IntType);
        let b = circuit.constant(MachineType::I32, 2, GateType::IntType);
        let add = circuit.new_gate(OpCode::Add, GateMeta::None, MachineType::I32, &[], &[], &[a, a], GateType::IntType);
        circuit.replace_all_uses(a, b);
        assert_eq!(circuit.gate(add).value_ins(), &[b, b]);
        assert!(circuit.gate(a).uses().is_empty());
    }

    #[test]
    fn test_meta_is_interned() {
        let mut circuit = empty();
        let a = circuit.constant(MachineType::I32, 7, GateType::IntType);
        let b = circuit.constant(MachineType::I64, 7, GateType::IntType);
        assert!(std::ptr::eq(circuit.gate(a).meta(), circuit.gate(b).meta()));
    }

    #[test]
    fn test_args_sorted() {
        let mut circuit = empty();
        let a2 = circuit.arg(2, GateType::AnyType);
        let a0 = circuit.arg(0, GateType::AnyType);
        let a1 = circuit.arg(1, GateType::AnyType);
        assert_eq!(circuit.args(), vec![a0, a1, a2]);
    }

    #[test]
    fn test_circuit_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Circuit>();
    }
}
