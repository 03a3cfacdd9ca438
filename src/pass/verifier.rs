//! Graph verifier
//!
//! Checked on every live gate:
//!
//! - edge counts match the opcode signature
//! - no input is `NULL` or deleted
//! - state inputs are state-chain gates, depend inputs produce effects
//! - value inputs have the machine representation the slot expects
//! - selector widths match their merge
//!
//! and globally, that every effectful gate hangs off `DependEntry` and that
//! the depend relation is acyclic outside loop back edges.

use crate::circuit::{Circuit, EdgeKind, GateRef, MachineType, OpCode};
use crate::config::CompilerOptions;
use crate::error::{Error, Result, Stage};

pub struct Verifier {
    pointer_bits: u32,
    fatal: bool,
}

impl Verifier {
    pub fn new(options: &CompilerOptions) -> Self {
        Self {
            pointer_bits: options.pointer_bits(),
            fatal: options.fatal_verifier,
        }
    }

    /// Verify and report failures per the `fatal_verifier` policy
    pub fn run(&self, circuit: &Circuit, stage: Stage) -> Result<()> {
        match self.verify(circuit) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(%stage, circuit = %circuit.info().name, "{}", err);
                if self.fatal {
                    panic!("verifier failed after {}: {}\n{}", stage, err, circuit.dump_all());
                }
                Err(err)
            }
        }
    }

    /// Verify without the fatal policy
    pub fn verify(&self, circuit: &Circuit) -> Result<()> {
        for gate in circuit.live_gates() {
            self.check_edges(circuit, gate)?;
            self.check_values(circuit, gate)?;
        }
        self.check_depend_chain(circuit)
    }

    fn check_edges(&self, circuit: &Circuit, gate: GateRef) -> Result<()> {
        let g = circuit.gate(gate);
        let signature = g.op().signature(g.meta());
        if !signature.accepts(g.state_ins().len(), g.depend_ins().len(), g.value_ins().len()) {
            return Err(Error::verification(gate, format!("{} expects {}", g.op(), signature)));
        }
        for (kind, index, input) in g.inputs() {
            if input.is_null() {
                return Err(Error::verification(gate, format!("dangling {:?} input {}", kind, index).to_lowercase()));
            }
            if !circuit.is_live(input) {
                return Err(Error::verification(gate, format!("{:?} input {} is deleted", kind, index).to_lowercase()));
            }
            let producer = circuit.gate(input).op();
            let ok = match kind {
                EdgeKind::State => producer.is_state_chain(),
                EdgeKind::Depend => producer.is_depend_producer(),
                EdgeKind::Value => producer != OpCode::Return,
            };
            if !ok {
                return Err(Error::verification(
                    gate,
                    format!("{:?} input {} is a {}", kind, index, producer).to_lowercase(),
                ));
            }
        }
        match g.op() {
            OpCode::ValueSelector | OpCode::DependSelector => {
                let merge = g.state_ins()[0];
                let merge_op = circuit.gate(merge).op();
                if !matches!(merge_op, OpCode::Merge | OpCode::LoopBegin) {
                    return Err(Error::verification(gate, format!("selector attached to {}", merge_op)));
                }
                let width = g.meta().width().unwrap_or(0);
                let preds = circuit.gate(merge).state_ins().len();
                if width != preds {
                    return Err(Error::verification(
                        gate,
                        format!("selector width {} but merge has {} predecessors", width, preds),
                    ));
                }
            }
            OpCode::LoopExitValue | OpCode::LoopExitDepend => {
                if circuit.gate(g.state_ins()[0]).op() != OpCode::LoopExit {
                    return Err(Error::verification(gate, "loop exit selector without loop exit"));
                }
            }
            OpCode::IfTrue | OpCode::IfFalse => {
                if circuit.gate(g.state_ins()[0]).op() != OpCode::IfBranch {
                    return Err(Error::verification(gate, "branch successor without branch"));
                }
            }
            OpCode::LoopBegin => {
                if circuit.gate(g.state_ins()[1]).op() != OpCode::LoopBack {
                    return Err(Error::verification(gate, "loop header back edge is not a LoopBack"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn mt(&self, circuit: &Circuit, gate: GateRef) -> MachineType {
        circuit.gate(gate).machine_type()
    }

    fn expect(&self, circuit: &Circuit, gate: GateRef, index: usize, accept: impl Fn(MachineType) -> bool, what: &str) -> Result<()> {
        let input = circuit.gate(gate).value_ins()[index];
        let mt = self.mt(circuit, input);
        if accept(mt) {
            Ok(())
        } else {
            Err(Error::verification(
                gate,
                format!("value input {} is {} but {} expected", index, mt, what),
            ))
        }
    }

    fn check_values(&self, circuit: &Circuit, gate: GateRef) -> Result<()> {
        let g = circuit.gate(gate);
        let op = g.op();
        let bits = self.pointer_bits;
        let own = g.machine_type();
        let same_width = |mt: MachineType| mt.compatible(own, bits);
        let is_i1 = |mt: MachineType| mt == MachineType::I1;
        let is_address = |mt: MachineType| matches!(mt, MachineType::I64 | MachineType::ArchWord);
        let is_tagged = |mt: MachineType| mt == MachineType::I64;
        let any_value = |mt: MachineType| mt.has_value();

        match op {
            _ if op.is_int_binary() => {
                let shift = matches!(op, OpCode::Shl | OpCode::Lsr | OpCode::Asr);
                self.expect(circuit, gate, 0, same_width, "operand of the result width")?;
                if shift {
                    self.expect(circuit, gate, 1, |mt| mt.is_int(), "integer shift count")?;
                } else {
                    self.expect(circuit, gate, 1, same_width, "operand of the result width")?;
                }
            }
            _ if op.is_float_binary() => {
                self.expect(circuit, gate, 0, same_width, "float operand")?;
                self.expect(circuit, gate, 1, same_width, "float operand")?;
            }
            OpCode::Icmp => {
                let lhs = self.mt(circuit, g.value_ins()[0]);
                if own != MachineType::I1 || !lhs.is_int() {
                    return Err(Error::verification(gate, "icmp must compare integers into i1"));
                }
                self.expect(circuit, gate, 1, |mt| mt.compatible(lhs, bits), "operand matching lhs")?;
            }
            OpCode::Fcmp => {
                self.expect(circuit, gate, 0, |mt| mt.is_float(), "float")?;
                self.expect(circuit, gate, 1, |mt| mt.is_float(), "float")?;
            }
            OpCode::IfBranch | OpCode::DeoptCheck => self.expect(circuit, gate, 0, is_i1, "i1 condition")?,
            OpCode::Select => {
                self.expect(circuit, gate, 0, is_i1, "i1 condition")?;
                self.expect(circuit, gate, 1, same_width, "arm of the result type")?;
                self.expect(circuit, gate, 2, same_width, "arm of the result type")?;
            }
            OpCode::Load | OpCode::Store => {
                self.expect(circuit, gate, 0, is_address, "address base")?;
                self.expect(circuit, gate, 1, |mt| mt.is_int(), "integer offset")?;
                if op == OpCode::Store {
                    self.expect(circuit, gate, 2, any_value, "stored value")?;
                }
            }
            OpCode::Fsqrt | OpCode::Fabs | OpCode::Ffloor | OpCode::Fext | OpCode::Ftrunc => {
                self.expect(circuit, gate, 0, |mt| mt.is_float(), "float")?;
            }
            OpCode::Sext | OpCode::Zext | OpCode::Trunc | OpCode::SignedIntToFloat => {
                self.expect(circuit, gate, 0, |mt| mt.is_int(), "integer")?;
            }
            OpCode::FloatToSignedInt => self.expect(circuit, gate, 0, |mt| mt.is_float(), "float")?,
            OpCode::Bitcast => {
                let from = self.mt(circuit, g.value_ins()[0]);
                if from.bit_width(bits) != own.bit_width(bits) {
                    return Err(Error::verification(gate, format!("bitcast from {} to {}", from, own)));
                }
            }
            OpCode::ValueSelector | OpCode::LoopExitValue => {
                for index in 0..g.value_ins().len() {
                    self.expect(circuit, gate, index, same_width, "input of the selector type")?;
                }
            }
            OpCode::PrimitiveTypeCheck
            | OpCode::HeapObjectCheck
            | OpCode::ObjectTypeCheck
            | OpCode::StableArrayCheck
            | OpCode::TypedArrayCheck
            | OpCode::ProtoChangeMarkerCheck
            | OpCode::TypedUnaryOp => self.expect(circuit, gate, 0, is_tagged, "tagged value")?,
            OpCode::TypedBinaryOp => {
                self.expect(circuit, gate, 0, is_tagged, "tagged value")?;
                self.expect(circuit, gate, 1, is_tagged, "tagged value")?;
            }
            OpCode::Arg | OpCode::FrameState | OpCode::Return => {}
            _ => {
                // Frame states are the only value inputs without a value
                for (index, input) in g.value_ins().iter().enumerate() {
                    let producer = circuit.gate(*input);
                    if !producer.machine_type().has_value() && producer.op() != OpCode::FrameState {
                        return Err(Error::verification(gate, format!("value input {} produces no value", index)));
                    }
                }
            }
        }
        if op.is_check() && op != OpCode::DeoptCheck {
            if let Some(last) = g.value_ins().last() {
                if circuit.gate(*last).op() != OpCode::FrameState {
                    return Err(Error::verification(gate, "check without frame state"));
                }
            }
        }
        Ok(())
    }

    /// Every effectful gate is reachable from `DependEntry` over depend edges,
    /// and the depend relation has no cycle except through the back input of
    /// a loop `DependSelector`.
    fn check_depend_chain(&self, circuit: &Circuit) -> Result<()> {
        let acc = circuit.acc();
        let mut reached = vec![false; circuit.len()];
        let mut stack = vec![circuit.depend_entry()];
        reached[circuit.depend_entry().index()] = true;
        while let Some(gate) = stack.pop() {
            for edge in acc.uses_of_kind(gate, EdgeKind::Depend) {
                if !reached[edge.user.index()] {
                    reached[edge.user.index()] = true;
                    stack.push(edge.user);
                }
            }
        }
        for gate in circuit.live_gates() {
            if acc.opcode(gate).is_depend_producer() && !circuit.is_root(gate) && !reached[gate.index()] {
                return Err(Error::verification(gate, "effect not reachable from the depend entry"));
            }
        }

        // Cycle check on the depend graph with loop back inputs removed
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }
        let mut marks = vec![Mark::White; circuit.len()];
        for root in circuit.live_gates() {
            if marks[root.index()] != Mark::White || !acc.opcode(root).is_depend_producer() {
                continue;
            }
            let mut stack: Vec<(GateRef, usize)> = vec![(root, 0)];
            marks[root.index()] = Mark::Grey;
            while let Some((gate, next)) = stack.pop() {
                let ins = forward_depend_ins(circuit, gate);
                if next < ins.len() {
                    stack.push((gate, next + 1));
                    let input = ins[next];
                    match marks[input.index()] {
                        Mark::Grey => {
                            return Err(Error::verification(gate, "depend chain forms a cycle"));
                        }
                        Mark::White => {
                            marks[input.index()] = Mark::Grey;
                            stack.push((input, 0));
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[gate.index()] = Mark::Black;
                }
            }
        }
        Ok(())
    }
}

fn forward_depend_ins(circuit: &Circuit, gate: GateRef) -> Vec<GateRef> {
    let g = circuit.gate(gate);
    let is_loop_selector = g.op() == OpCode::DependSelector
        && circuit.gate(g.state_ins()[0]).op() == OpCode::LoopBegin;
    g.depend_ins()
        .iter()
        .enumerate()
        .filter(|(i, _)| !(is_loop_selector && *i > 0))
        .map(|(_, d)| *d)
        .filter(|d| circuit.is_live(*d))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBuilder, CircuitInfo, GateMeta, GateType};
    use crate::pgo::MethodId;

    fn options() -> CompilerOptions {
        CompilerOptions {
            fatal_verifier: false,
            ..CompilerOptions::default()
        }
    }

    #[test]
    fn test_accepts_well_formed_loop() {
        let mut circuit = Circuit::new(CircuitInfo::new("ok", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let zero = builder.tagged_int(0);
        let header = builder.loop_begin();
        let phi = builder.loop_phi(header, MachineType::I64, GateType::IntType, zero);
        let dphi = builder.loop_depend_phi(header);
        let base = builder.arg(2, GateType::TaggedPointer);
        let load = builder.load_const_offset(MachineType::I64, GateType::IntType, base, 8);
        let cond = builder.icmp(crate::circuit::IcmpCond::Eq, load, phi);
        let (exit_true, body) = builder.branch(cond);
        builder.set_state(body);
        builder.loop_back(header);
        builder.set_back_input(phi, EdgeKind::Value, load);
        builder.set_back_input(dphi, EdgeKind::Depend, load);
        builder.set_position(exit_true, load);
        let exit = builder.loop_exit(exit_true);
        let out = builder.loop_exit_value(exit, phi);
        builder.loop_exit_depend(exit);
        builder.ret(out);
        Verifier::new(&options()).verify(&circuit).unwrap();
    }

    #[test]
    fn test_rejects_non_i1_branch() {
        let mut circuit = Circuit::new(CircuitInfo::new("bad", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let word = builder.int32(1);
        builder.branch(word);
        let err = Verifier::new(&options()).verify(&circuit).unwrap_err();
        assert!(err.to_string().contains("i1 condition"), "{}", err);
    }

    #[test]
    fn test_rejects_deleted_input() {
        let mut circuit = Circuit::new(CircuitInfo::new("bad", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let a = builder.int32(1);
        let sum = builder.int_add(MachineType::I32, a, a);
        builder.ret(sum);
        circuit.delete_gate(a);
        let err = Verifier::new(&options()).verify(&circuit).unwrap_err();
        assert!(matches!(err, Error::VerificationError { gate, .. } if gate == sum));
    }

    #[test]
    fn test_rejects_wrong_edge_kind() {
        let mut circuit = Circuit::new(CircuitInfo::new("bad", MethodId(0)));
        let a = circuit.constant(MachineType::I64, 0, GateType::NJSValue);
        let entry = circuit.state_entry();
        // a constant used as a depend input
        circuit.new_gate(OpCode::Load, GateMeta::None, MachineType::I64, &[entry], &[a], &[a, a], GateType::AnyType);
        let err = Verifier::new(&options()).verify(&circuit).unwrap_err();
        assert!(err.to_string().contains("depend input 0"), "{}", err);
    }

    #[test]
    #[should_panic(expected = "verifier failed")]
    fn test_fatal_policy_panics() {
        let mut circuit = Circuit::new(CircuitInfo::new("bad", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let word = builder.int32(1);
        builder.branch(word);
        let options = CompilerOptions {
            fatal_verifier: true,
            ..CompilerOptions::default()
        };
        let _ = Verifier::new(&options).run(&circuit, Stage::Input);
    }
}
