//! Loop peeling
//!
//! Guards at the top of a loop whose operands do not change between
//! iterations only need to run once. This pass moves them, together with
//! hidden-class and length loads of invariant objects, out of the loop into a
//! pre-header spliced between the loop entry and the `LoopBegin`.
//!
//! Only the straight-line prefix of the loop header is considered: gates
//! after the first control gate run conditionally, and gates after the first
//! store may observe its effect. A loop containing any operation that can
//! change object shapes (generic bytecodes, calls, shape transitions) is left
//! alone, since every guard in it may be invalidated by the loop itself.

use super::loop_analysis::{LoopAnalysis, LoopInfo};
use super::PassStats;
use crate::circuit::{Circuit, EdgeKind, GateRef, OpCode};
use crate::config::CompilerOptions;
use rustc_hash::FxHashMap as HashMap;

/// What happened to one loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeelOutcome {
    Peeled {
        /// Gates moved to the pre-header, in execution order
        hoisted: Vec<GateRef>,
        /// Loop-carried selectors replaced by their entry value
        folded_selectors: usize,
    },
    Skipped(String),
}

pub struct LoopPeeling {
    trace: bool,
}

fn mutates_shapes(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::JsBytecode | OpCode::TypedCall | OpCode::CallGetter | OpCode::RuntimeCall | OpCode::TransitionShape
    )
}

fn hoistable(op: OpCode) -> bool {
    op.is_check()
        || matches!(op, OpCode::LoadTypedArrayLength | OpCode::LoadStringLength | OpCode::LoadHClass)
}

fn writes_memory(op: OpCode) -> bool {
    matches!(op, OpCode::Store | OpCode::StoreProperty | OpCode::StoreElement)
}

impl LoopPeeling {
    pub fn new(options: &CompilerOptions) -> Self {
        Self {
            trace: options.trace_enabled("loop-peeling"),
        }
    }

    /// Peel every loop of the circuit, innermost first
    pub fn run(&mut self, circuit: &mut Circuit) -> PassStats {
        let mut stats = PassStats::new();
        let mut headers: Vec<(u32, GateRef)> =
            LoopAnalysis::run(circuit).into_iter().map(|l| (l.depth, l.header)).collect();
        headers.sort_by(|a, b| b.cmp(a));
        for (_, header) in headers {
            let info = LoopAnalysis::collect(circuit, header);
            match self.peel(circuit, &info) {
                PeelOutcome::Peeled {
                    hoisted,
                    folded_selectors,
                } => {
                    stats.bump("loop-peeling.peeled", 1);
                    stats.bump("loop-peeling.hoisted", hoisted.len() as u64);
                    stats.bump("loop-peeling.folded-selectors", folded_selectors as u64);
                }
                PeelOutcome::Skipped(reason) => {
                    tracing::debug!("loop-peeling: skipped {}: {}", header, reason);
                    stats.bump("loop-peeling.skipped", 1);
                }
            }
        }
        stats
    }

    /// Peel one loop
    pub fn peel(&mut self, circuit: &mut Circuit, info: &LoopInfo) -> PeelOutcome {
        let header = info.header;
        if let Some(gate) = info.first_gate_where(circuit, mutates_shapes) {
            return PeelOutcome::Skipped(format!("{} may change shapes", circuit.dump_gate(gate)));
        }
        let Some(depend_selector) = circuit.acc().depend_selector_of(header) else {
            return PeelOutcome::Skipped("loop has no depend selector".to_string());
        };

        let folded_selectors = self.fold_loop_carried(circuit, header);

        let candidates = self.header_prefix(circuit, header);
        let mut invariant: HashMap<GateRef, bool> = HashMap::default();
        let mut hoisted = Vec::new();
        // A gate may only move if every gate before it on the prefix moved
        for gate in candidates {
            let inputs = circuit.gate(gate).value_ins().to_vec();
            if !inputs.iter().all(|v| is_invariant(circuit, info, &hoisted, &mut invariant, *v)) {
                break;
            }
            hoisted.push(gate);
        }
        if hoisted.is_empty() {
            if folded_selectors == 0 {
                return PeelOutcome::Skipped("nothing invariant".to_string());
            }
            return PeelOutcome::Peeled {
                hoisted,
                folded_selectors,
            };
        }

        let mut state = circuit.gate(header).state_ins()[0];
        let mut depend = circuit.gate(depend_selector).depend_ins()[0];
        for gate in &hoisted {
            let gate = *gate;
            // Unlink from the loop
            let (old_state, old_depend) = (circuit.acc().state_of(gate), circuit.acc().depend_of(gate));
            circuit.replace_uses(gate, EdgeKind::State, old_state);
            circuit.replace_uses(gate, EdgeKind::Depend, old_depend);
            // Relink in the pre-header
            circuit.set_input(gate, EdgeKind::State, 0, state);
            circuit.set_input(gate, EdgeKind::Depend, 0, depend);
            state = gate;
            depend = gate;
            if self.trace {
                tracing::debug!("loop-peeling: hoisted {}", circuit.dump_gate(gate));
            }
        }
        circuit.set_input(header, EdgeKind::State, 0, state);
        circuit.set_input(depend_selector, EdgeKind::Depend, 0, depend);

        PeelOutcome::Peeled {
            hoisted,
            folded_selectors,
        }
    }

    /// Replace header selectors whose back input is the selector itself or its
    /// entry value by the entry value
    fn fold_loop_carried(&self, circuit: &mut Circuit, header: GateRef) -> usize {
        let selectors: Vec<GateRef> = circuit
            .acc()
            .selectors_of(header)
            .into_iter()
            .filter(|s| circuit.gate(*s).op() == OpCode::ValueSelector)
            .collect();
        let mut folded = 0;
        for selector in selectors {
            let ins = circuit.gate(selector).value_ins().to_vec();
            let entry = ins[0];
            if ins[1..].iter().all(|v| *v == selector || *v == entry) {
                circuit.replace_uses(selector, EdgeKind::Value, entry);
                circuit.delete_gate(selector);
                folded += 1;
                if self.trace {
                    tracing::debug!("loop-peeling: {} is loop-invariant", selector);
                }
            }
        }
        folded
    }

    /// Hoisting candidates on the header's straight-line prefix, up to the
    /// first gate that cannot move
    fn header_prefix(&self, circuit: &Circuit, header: GateRef) -> Vec<GateRef> {
        let acc = circuit.acc();
        let mut candidates = Vec::new();
        let mut current = header;
        loop {
            let mut next = acc.state_successors(current);
            let (Some(gate), None) = (next.next(), next.next()) else {
                break;
            };
            let op = acc.opcode(gate);
            if op.is_control() || writes_memory(op) || !op.is_effectful() || !hoistable(op) {
                break;
            }
            candidates.push(gate);
            current = gate;
        }
        candidates
    }
}

/// Whether `gate` has the same value on every iteration once `hoisted` run
/// before the loop
fn is_invariant(
    circuit: &Circuit,
    info: &LoopInfo,
    hoisted: &[GateRef],
    memo: &mut HashMap<GateRef, bool>,
    gate: GateRef,
) -> bool {
    if !info.contains(gate) || hoisted.contains(&gate) {
        return true;
    }
    if let Some(known) = memo.get(&gate) {
        return *known;
    }
    // Pessimistic while the inputs are examined, which also cuts cycles
    memo.insert(gate, false);
    let g = circuit.gate(gate);
    let result = g.op().is_pure()
        && g.value_ins()
            .iter()
            .all(|v| is_invariant(circuit, info, hoisted, memo, *v));
    memo.insert(gate, result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBuilder, CircuitInfo, GateMeta, GateType, IcmpCond, MachineType};
    use crate::pass::Verifier;
    use crate::pgo::MethodId;

    struct TypedArrayLoop {
        circuit: Circuit,
        header: GateRef,
        length: GateRef,
        check: GateRef,
    }

    // for (i = 0; i < arr.length; i++) {}
    fn typed_array_loop(with_call: bool, variant_frame: bool) -> TypedArrayLoop {
        let mut circuit = Circuit::new(CircuitInfo::new("peel", MethodId(0)));
        let mut b = CircuitBuilder::new(&mut circuit);
        let arr = b.arg(2, GateType::TaggedPointer);
        let zero = b.tagged_int(0);
        let one = b.int64(1);
        let header = b.loop_begin();
        let i = b.loop_phi(header, MachineType::I64, GateType::IntType, zero);
        let dphi = b.loop_depend_phi(header);
        let frame = if variant_frame {
            b.frame_state(MethodId(0), 4, &[arr, i])
        } else {
            b.frame_state(MethodId(0), 4, &[arr])
        };
        let check = b.effect(
            OpCode::TypedArrayCheck,
            GateMeta::TypedArray(crate::pgo::ElementKind::Int32),
            MachineType::NoValue,
            &[arr, frame],
            GateType::Empty,
        );
        let length = b.effect(OpCode::LoadTypedArrayLength, GateMeta::None, MachineType::I64, &[arr], GateType::IntType);
        if with_call {
            b.bytecode(crate::circuit::BytecodeInfo::call(MethodId(0), 6, 0), &[arr, arr]);
        }
        let cond = b.icmp(IcmpCond::Slt, i, length);
        let (_, leave) = b.branch(cond);
        let next = b.int_add(MachineType::I64, i, one);
        let back_depend = b.depend();
        b.loop_back(header);
        b.set_back_input(i, EdgeKind::Value, next);
        b.set_back_input(dphi, EdgeKind::Depend, back_depend);
        let exit = b.loop_exit(leave);
        b.set_depend(dphi);
        b.loop_exit_depend(exit);
        let result = b.loop_exit_value(exit, i);
        b.ret(result);
        TypedArrayLoop { circuit, header, length, check }
    }

    #[test]
    fn test_length_and_check_leave_the_loop() {
        let mut t = typed_array_loop(false, false);
        let before = LoopAnalysis::collect(&t.circuit, t.header);
        assert!(before.contains(t.length));

        let outcome = LoopPeeling::new(&CompilerOptions::default()).peel(&mut t.circuit, &before);
        assert_eq!(
            outcome,
            PeelOutcome::Peeled {
                hoisted: vec![t.check, t.length],
                folded_selectors: 0
            }
        );
        let after = LoopAnalysis::collect(&t.circuit, t.header);
        assert!(!after.contains(t.length));
        assert!(after.len() < before.len());
        let acc = t.circuit.acc();
        assert_eq!(acc.state_in(t.header, 0), t.length);
        assert_eq!(acc.state_in(t.length, 0), t.check);
        assert_eq!(acc.state_in(t.check, 0), t.circuit.state_entry());
        Verifier::new(&CompilerOptions::default()).verify(&t.circuit).unwrap();
    }

    #[test]
    fn test_shape_mutation_blocks_peeling() {
        let mut t = typed_array_loop(true, false);
        let info = LoopAnalysis::collect(&t.circuit, t.header);
        let outcome = LoopPeeling::new(&CompilerOptions::default()).peel(&mut t.circuit, &info);
        assert!(matches!(outcome, PeelOutcome::Skipped(_)));
        assert!(LoopAnalysis::collect(&t.circuit, t.header).contains(t.length));
    }

    #[test]
    fn test_load_stays_behind_loop_variant_check() {
        let mut t = typed_array_loop(false, true);
        let info = LoopAnalysis::collect(&t.circuit, t.header);
        let outcome = LoopPeeling::new(&CompilerOptions::default()).peel(&mut t.circuit, &info);
        assert_eq!(outcome, PeelOutcome::Skipped("nothing invariant".to_string()));

        let after = LoopAnalysis::collect(&t.circuit, t.header);
        assert!(after.contains(t.check));
        assert!(after.contains(t.length));
        assert_eq!(t.circuit.acc().state_in(t.length, 0), t.check);
        Verifier::new(&CompilerOptions::default()).verify(&t.circuit).unwrap();
    }

    #[test]
    fn test_loop_carried_selector_folds() {
        let mut circuit = Circuit::new(CircuitInfo::new("sel", MethodId(0)));
        let mut b = CircuitBuilder::new(&mut circuit);
        let obj = b.arg(2, GateType::TaggedPointer);
        let header = b.loop_begin();
        let carried = b.loop_phi(header, MachineType::I64, GateType::TaggedPointer, obj);
        let dphi = b.loop_depend_phi(header);
        let frame = b.frame_state(MethodId(0), 0, &[carried]);
        let check = b.effect(
            OpCode::HeapObjectCheck,
            GateMeta::None,
            MachineType::NoValue,
            &[carried, frame],
            GateType::Empty,
        );
        let flag = b.boolean(true);
        let (_, leave) = b.branch(flag);
        let back_depend = b.depend();
        b.loop_back(header);
        b.set_back_input(carried, EdgeKind::Value, carried);
        b.set_back_input(dphi, EdgeKind::Depend, back_depend);
        let exit = b.loop_exit(leave);
        b.set_depend(dphi);
        b.loop_exit_depend(exit);
        let zero = b.tagged_int(0);
        b.ret(zero);

        let info = LoopAnalysis::collect(&circuit, header);
        let mut peeling = LoopPeeling::new(&CompilerOptions::default());
        let outcome = peeling.peel(&mut circuit, &info);
        assert_eq!(
            outcome,
            PeelOutcome::Peeled {
                hoisted: vec![check],
                folded_selectors: 1
            }
        );
        assert!(circuit.acc().is_nop(carried));
        assert_eq!(circuit.acc().value_in(check, 0), obj);
    }
}
