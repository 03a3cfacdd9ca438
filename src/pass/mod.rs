//! Pass framework
//!
//! A pass is a [`PassVisitor`]: it looks at one gate and either leaves it
//! alone or names a replacement. [`GraphVisitor`] drives a list of passes over
//! the circuit in reverse postorder until a whole sweep changes nothing.
//!
//! Replacing a gate re-points its uses by edge kind:
//!
//! - value uses go to the replacement
//! - state uses go to the replaced gate's own state input
//! - depend uses go to the replaced gate's own depend input
//!
//! A lowering that emits a new effect chain in place of a gate therefore
//! re-points the gate's state and depend inputs at the chain's tail (see
//! [`rewire_effects`]) before returning the replacement value.

pub mod constant_folding;
pub mod loop_analysis;
pub mod loop_peeling;
pub mod pipeline;
pub mod scheduler;
pub mod value_numbering;
pub mod verifier;

pub use constant_folding::ConstantFolding;
pub use loop_analysis::{LoopAnalysis, LoopInfo};
pub use loop_peeling::{LoopPeeling, PeelOutcome};
pub use pipeline::{CompilationUnit, CompileOutput, PassManager};
pub use scheduler::{BasicBlock, Schedule, Scheduler};
pub use value_numbering::ValueNumbering;
pub use verifier::Verifier;

use crate::circuit::{Circuit, EdgeKind, GateRef};
use crate::error::{Error, Result};
use rustc_hash::FxHashSet as HashSet;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Sweeps after which a pass list is considered non-converging
pub const MAX_SWEEPS: usize = 64;

/// Outcome of visiting one gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitResult {
    NoChange,
    /// Replace the visited gate. `GateRef::NULL` is allowed for gates that
    /// produce no value.
    Replace(GateRef),
}

/// A per-gate transformation
pub trait PassVisitor {
    fn name(&self) -> &'static str;

    fn visit_gate(&mut self, circuit: &mut Circuit, gate: GateRef) -> VisitResult;

    /// Report counters once the fixpoint is reached
    fn finish(&mut self, _stats: &mut PassStats) {}
}

/// Named counters reported by passes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    counters: BTreeMap<String, u64>,
}

impl PassStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&mut self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += by;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &PassStats) {
        for (name, value) in &other.counters {
            self.bump(name, *value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counters.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.counters {
            writeln!(f, "{:<40} {}", name, value)?;
        }
        Ok(())
    }
}

/// Point `gate`'s state and depend inputs at a new chain tail
pub fn rewire_effects(circuit: &mut Circuit, gate: GateRef, state: GateRef, depend: GateRef) {
    if circuit.gate(gate).state_ins().len() == 1 {
        circuit.set_input(gate, EdgeKind::State, 0, state);
    }
    if circuit.gate(gate).depend_ins().len() == 1 {
        circuit.set_input(gate, EdgeKind::Depend, 0, depend);
    }
}

/// Replace `old` by `new` with the edge-kind routing described above
pub fn replace_with(circuit: &mut Circuit, old: GateRef, new: GateRef) {
    let state = circuit.acc().state_of(old);
    let depend = circuit.acc().depend_of(old);
    circuit.replace_gate(old, state, depend, new);
}

/// Reverse postorder over use edges, starting from every live gate that has
/// no inputs (the roots first). State successors are explored before depend
/// successors, which are explored before value successors.
pub fn reverse_postorder(circuit: &Circuit) -> Vec<GateRef> {
    let mut starts = vec![circuit.state_entry(), circuit.depend_entry(), circuit.arg_list()];
    starts.extend(circuit.live_gates().filter(|g| !circuit.is_root(*g) && circuit.gate(*g).inputs().next().is_none()));

    let mut visited = vec![false; circuit.len()];
    let mut postorder = Vec::with_capacity(circuit.len());
    // Later starts finish first in postorder, so walk them backwards to put
    // the roots at the front
    for start in starts.into_iter().rev() {
        if visited[start.index()] {
            continue;
        }
        visited[start.index()] = true;
        let mut stack: Vec<(GateRef, Vec<GateRef>)> = vec![(start, successors(circuit, start))];
        while let Some((gate, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => {
                    if !visited[next.index()] && circuit.is_live(next) {
                        visited[next.index()] = true;
                        let succ = successors(circuit, next);
                        stack.push((next, succ));
                    }
                }
                None => {
                    postorder.push(*gate);
                    stack.pop();
                }
            }
        }
    }
    postorder.reverse();
    postorder
}

// Reversed so that popping yields state, then depend, then value successors
fn successors(circuit: &Circuit, gate: GateRef) -> Vec<GateRef> {
    let acc = circuit.acc();
    let mut out = Vec::new();
    for kind in [EdgeKind::Value, EdgeKind::Depend, EdgeKind::State] {
        let mut users: Vec<GateRef> = acc.uses_of_kind(gate, kind).map(|u| u.user).collect();
        users.sort_by(|a, b| b.cmp(a));
        out.extend(users);
    }
    out
}

/// Fixpoint driver for a list of passes
pub struct GraphVisitor {
    stats: PassStats,
    sweeps: usize,
}

impl GraphVisitor {
    pub fn new() -> Self {
        Self {
            stats: PassStats::new(),
            sweeps: 0,
        }
    }

    /// Sweeps performed by the last [`GraphVisitor::run`]
    pub fn sweeps(&self) -> usize {
        self.sweeps
    }

    pub fn stats(&self) -> &PassStats {
        &self.stats
    }

    /// Apply `passes` until a full sweep makes no replacement
    pub fn run(&mut self, circuit: &mut Circuit, passes: &mut [&mut dyn PassVisitor]) -> Result<&PassStats> {
        self.sweeps = 0;
        loop {
            if self.sweeps == MAX_SWEEPS {
                let names: Vec<&str> = passes.iter().map(|p| p.name()).collect();
                return Err(Error::internal(format!(
                    "passes [{}] did not converge after {} sweeps",
                    names.join(", "),
                    MAX_SWEEPS
                )));
            }
            self.sweeps += 1;
            let changed = self.sweep(circuit, passes)?;
            tracing::trace!(sweep = self.sweeps, changed, "sweep finished");
            if changed == 0 {
                break;
            }
        }
        for pass in passes.iter_mut() {
            pass.finish(&mut self.stats);
        }
        Ok(&self.stats)
    }

    fn sweep(&mut self, circuit: &mut Circuit, passes: &mut [&mut dyn PassVisitor]) -> Result<usize> {
        let order = reverse_postorder(circuit);
        let budget = order.len().saturating_mul(16).max(1024);
        let mut queued: HashSet<GateRef> = order.iter().copied().collect();
        let mut queue: VecDeque<GateRef> = order.into();
        let mut changed = 0;
        let mut visits = 0usize;

        while let Some(gate) = queue.pop_front() {
            queued.remove(&gate);
            visits += 1;
            if visits > budget {
                return Err(Error::internal(format!("revisit budget exhausted at {}", gate)));
            }
            for pass in passes.iter_mut() {
                if !circuit.is_live(gate) {
                    break;
                }
                match pass.visit_gate(circuit, gate) {
                    VisitResult::NoChange => {}
                    VisitResult::Replace(new) => {
                        assert_ne!(new, gate, "{} reported {} as its own replacement", pass.name(), gate);
                        let users: Vec<GateRef> = circuit.acc().uses(gate).map(|u| u.user).collect();
                        replace_with(circuit, gate, new);
                        self.stats.bump(&format!("{}.replaced", pass.name()), 1);
                        changed += 1;
                        for user in users {
                            if queued.insert(user) {
                                queue.push_back(user);
                            }
                        }
                        break;
                    }
                }
            }
        }
        Ok(changed)
    }
}

impl Default for GraphVisitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBuilder, CircuitInfo, MachineType, OpCode};
    use crate::pgo::MethodId;

    /// Replaces `Sub x, x` by its first operand's zero; a toy rewrite
    struct SubSelf;

    impl PassVisitor for SubSelf {
        fn name(&self) -> &'static str {
            "sub-self"
        }

        fn visit_gate(&mut self, circuit: &mut Circuit, gate: GateRef) -> VisitResult {
            let acc = circuit.acc();
            if acc.opcode(gate) == OpCode::Sub && acc.value_in(gate, 0) == acc.value_in(gate, 1) {
                let mt = acc.machine_type(gate);
                let zero = circuit.constant(mt, 0, crate::circuit::GateType::NJSValue);
                return VisitResult::Replace(zero);
            }
            VisitResult::NoChange
        }
    }

    struct Forever;

    impl PassVisitor for Forever {
        fn name(&self) -> &'static str {
            "forever"
        }

        fn visit_gate(&mut self, circuit: &mut Circuit, gate: GateRef) -> VisitResult {
            if circuit.acc().opcode(gate) == OpCode::Add {
                let a = circuit.acc().value_in(gate, 0);
                let b = circuit.acc().value_in(gate, 1);
                let fresh = CircuitBuilder::new(circuit).int_add(MachineType::I32, a, b);
                return VisitResult::Replace(fresh);
            }
            VisitResult::NoChange
        }
    }

    #[test]
    fn test_rpo_starts_at_roots() {
        let mut circuit = Circuit::new(CircuitInfo::new("rpo", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let one = builder.int32(1);
        builder.ret(one);
        let order = reverse_postorder(&circuit);
        assert_eq!(order[0], circuit.state_entry());
        assert_eq!(order.len(), circuit.live_count());
    }

    #[test]
    fn test_fixpoint_and_requeue() {
        let mut circuit = Circuit::new(CircuitInfo::new("fix", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let x = builder.int32(5);
        let inner = builder.int_sub(MachineType::I32, x, x);
        let outer = builder.int_sub(MachineType::I32, inner, inner);
        let ret = builder.ret(outer);

        let mut pass = SubSelf;
        let mut visitor = GraphVisitor::new();
        let stats = visitor.run(&mut circuit, &mut [&mut pass]).unwrap();
        assert_eq!(stats.get("sub-self.replaced"), 2);
        let acc = circuit.acc();
        assert_eq!(acc.constant_value(acc.value_in(ret, 0)), Some(0));
        assert!(acc.is_nop(inner));
        assert!(acc.is_nop(outer));
    }

    #[test]
    fn test_non_convergence_is_internal_error() {
        let mut circuit = Circuit::new(CircuitInfo::new("loop", MethodId(0)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let x = builder.int32(1);
        let sum = builder.int_add(MachineType::I32, x, x);
        builder.ret(sum);
        let mut pass = Forever;
        let err = GraphVisitor::new().run(&mut circuit, &mut [&mut pass]).unwrap_err();
        assert!(matches!(err, Error::InternalError(_)));
    }

    #[test]
    fn test_stats_display() {
        let mut stats = PassStats::new();
        stats.bump("gvn.replaced", 3);
        stats.bump("gvn.replaced", 1);
        assert_eq!(stats.get("gvn.replaced"), 4);
        assert!(stats.to_string().contains("gvn.replaced"));
    }
}
