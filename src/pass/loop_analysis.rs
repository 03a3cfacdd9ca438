//! Loop body collection
//!
//! Loop headers are `LoopBegin` gates placed by the graph builder; nothing
//! here infers loops from arbitrary back edges.
//!
//! A loop's control part is every state-chain gate from which one of its
//! `LoopBack` edges is reachable without passing through the header. A
//! `LoopExit` outside the control part is an exit of this loop; exits of
//! nested loops lead back to the back edge and are crossed.
//!
//! The body is every gate reachable from the header through uses without
//! crossing one of the loop's own exits. A selector belongs to the body when
//! its merge does, so the exit's `LoopExitValue`/`LoopExitDepend` gates stay
//! outside.

use crate::circuit::{Circuit, GateRef, OpCode};
use rustc_hash::FxHashSet as HashSet;

/// A loop and the gates that belong to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    pub header: GateRef,
    pub body: HashSet<GateRef>,
    /// `LoopExit` gates leaving this loop
    pub exits: Vec<GateRef>,
    /// `LoopBack` gates closing this loop
    pub back_edges: Vec<GateRef>,
    /// Number of loops enclosing this one, 0 for an outermost loop
    pub depth: u32,
}

impl LoopInfo {
    pub fn contains(&self, gate: GateRef) -> bool {
        self.body.contains(&gate)
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Body gates of the given opcode, in pool order
    pub fn gates_with_op(&self, circuit: &Circuit, op: OpCode) -> Vec<GateRef> {
        let mut gates: Vec<GateRef> = self.body.iter().copied().filter(|g| circuit.gate(*g).op() == op).collect();
        gates.sort();
        gates
    }

    /// First body gate, in pool order, whose opcode satisfies `pred`
    pub fn first_gate_where(&self, circuit: &Circuit, pred: impl Fn(OpCode) -> bool) -> Option<GateRef> {
        self.body
            .iter()
            .copied()
            .filter(|g| pred(circuit.gate(*g).op()))
            .min()
    }
}

pub struct LoopAnalysis;

impl LoopAnalysis {
    /// Collect the loop headed by `header`
    pub fn collect(circuit: &Circuit, header: GateRef) -> LoopInfo {
        debug_assert_eq!(circuit.gate(header).op(), OpCode::LoopBegin);
        let acc = circuit.acc();
        let back_edges: Vec<GateRef> = circuit.gate(header).state_ins()[1..]
            .iter()
            .copied()
            .filter(|g| circuit.is_live(*g))
            .collect();

        // Control part: walk state inputs backwards from the back edges
        let mut control: HashSet<GateRef> = HashSet::default();
        control.insert(header);
        let mut worklist: Vec<GateRef> = back_edges.clone();
        while let Some(gate) = worklist.pop() {
            if !circuit.is_live(gate) || circuit.is_root(gate) || !control.insert(gate) {
                continue;
            }
            worklist.extend(circuit.gate(gate).state_ins().iter().copied());
        }

        let mut body: HashSet<GateRef> = HashSet::default();
        body.insert(header);
        let mut exits = Vec::new();
        let mut worklist = vec![header];
        while let Some(gate) = worklist.pop() {
            for edge in acc.uses(gate) {
                let user = edge.user;
                if body.contains(&user) {
                    continue;
                }
                let op = acc.opcode(user);
                let inside = if op == OpCode::LoopExit && !control.contains(&user) {
                    if !exits.contains(&user) {
                        exits.push(user);
                    }
                    false
                } else if op.is_selector() {
                    body.contains(&acc.state_in(user, 0))
                } else {
                    true
                };
                if inside {
                    body.insert(user);
                    worklist.push(user);
                }
            }
        }
        exits.sort();

        LoopInfo {
            header,
            body,
            exits,
            back_edges,
            depth: 0,
        }
    }

    /// Every loop of the circuit, with nesting depths, outermost first
    pub fn run(circuit: &Circuit) -> Vec<LoopInfo> {
        let mut loops: Vec<LoopInfo> = circuit
            .gates_with_op(OpCode::LoopBegin)
            .into_iter()
            .map(|header| Self::collect(circuit, header))
            .collect();
        let depths: Vec<u32> = loops
            .iter()
            .map(|inner| {
                loops
                    .iter()
                    .filter(|outer| outer.header != inner.header && outer.contains(inner.header))
                    .count() as u32
            })
            .collect();
        for (info, depth) in loops.iter_mut().zip(depths) {
            info.depth = depth;
        }
        loops.sort_by_key(|l| (l.depth, l.header));
        tracing::trace!(loops = loops.len(), "loop analysis finished");
        loops
    }
}
