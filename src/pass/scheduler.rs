//! Scheduling
//!
//! Turns the partially ordered graph into basic blocks and decides, for every
//! pure gate, which block it is computed in.
//!
//! A block starts at a block-start control gate (`StateEntry`, `IfTrue`,
//! `IfFalse`, `Merge`, `LoopBegin`, `LoopExit`) and follows the state chain
//! until a branch, a back edge, a return, or the next block start. The last
//! gate of a block is its control point and names the block.
//!
//! State-chain gates are pinned to their own block, selectors to the block of
//! their merge, and parameters to the entry block. Everything else floats:
//!
//! - eager placement picks the deepest block, in the dominator tree, among
//!   the blocks of the gate's inputs. Loop invariants land before the loop.
//! - lazy placement picks the common dominator of the blocks that use the
//!   gate. A selector's use of its `i`-th input counts as a use at the end of
//!   the merge's `i`-th predecessor.

use super::loop_analysis::LoopAnalysis;
use crate::circuit::{Circuit, EdgeKind, GateRef, OpCode, Use};
use crate::config::{CompilerOptions, SchedulePolicy};
use crate::error::{Error, Result};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::fmt;
use typed_arena::Arena;

/// One basic block of the schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: usize,
    /// Block-start control gate
    pub start: GateRef,
    /// Control point: the last state-chain gate of the block
    pub end: GateRef,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
    /// Immediate dominator; `None` for the entry and unreachable blocks
    pub idom: Option<usize>,
    /// Depth in the dominator tree
    pub depth: u32,
    /// Number of loops containing the block
    pub loop_depth: u32,
    /// State-chain gates and selectors, in chain order
    pub pinned: Vec<GateRef>,
    /// Floating gates placed in the block, inputs before users
    pub scheduled: Vec<GateRef>,
}

/// Result of scheduling a circuit
#[derive(Debug, Clone)]
pub struct Schedule {
    pub blocks: Vec<BasicBlock>,
    assignment: HashMap<GateRef, usize>,
    policy: SchedulePolicy,
}

impl Schedule {
    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    /// Block a gate was assigned to
    pub fn block_of(&self, gate: GateRef) -> Option<&BasicBlock> {
        self.assignment.get(&gate).map(|b| &self.blocks[*b])
    }

    /// Control point of the block a gate was assigned to
    pub fn control_point(&self, gate: GateRef) -> Option<GateRef> {
        self.block_of(gate).map(|b| b.end)
    }

    /// Number of gates with a block
    pub fn assigned(&self) -> usize {
        self.assignment.len()
    }

    pub fn entry(&self) -> &BasicBlock {
        &self.blocks[0]
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            let list = |ids: &[usize]| ids.iter().map(|i| format!("B{}", i)).collect::<Vec<_>>().join(", ");
            write!(f, "B{} [{} .. {}] preds({}) succs({})", block.id, block.start, block.end, list(&block.preds), list(&block.succs))?;
            if let Some(idom) = block.idom {
                write!(f, " idom=B{}", idom)?;
            }
            if block.loop_depth > 0 {
                write!(f, " loop-depth={}", block.loop_depth)?;
            }
            writeln!(f)?;
            for gate in block.scheduled.iter().chain(&block.pinned) {
                writeln!(f, "  {}", gate)?;
            }
        }
        Ok(())
    }
}

pub struct Scheduler {
    policy: SchedulePolicy,
}

impl Scheduler {
    pub fn new(options: &CompilerOptions) -> Self {
        Self {
            policy: options.schedule_policy,
        }
    }

    pub fn with_policy(policy: SchedulePolicy) -> Self {
        Self { policy }
    }

    pub fn run(&self, circuit: &Circuit) -> Result<Schedule> {
        let arena: Arena<GateRef> = Arena::new();
        let mut builder = BlockBuilder::new(circuit, &arena);
        builder.build_blocks()?;
        let mut blocks = builder.finish();
        compute_dominators(&mut blocks);

        let mut assignment: HashMap<GateRef, usize> = HashMap::default();
        for block in &blocks {
            for gate in &block.pinned {
                assignment.insert(*gate, block.id);
            }
        }
        for root in [circuit.depend_entry(), circuit.arg_list()] {
            assignment.insert(root, 0);
        }
        for arg in circuit.gates_with_op(OpCode::Arg) {
            assignment.insert(arg, 0);
        }

        for info in LoopAnalysis::run(circuit) {
            for block in blocks.iter_mut() {
                if info.contains(block.end) {
                    block.loop_depth += 1;
                }
            }
        }

        let floating: Vec<GateRef> = circuit
            .live_gates()
            .filter(|g| !assignment.contains_key(g))
            .collect();
        let mut placer = Placer {
            circuit,
            blocks: &blocks,
            assignment: &mut assignment,
            eager: HashMap::default(),
        };
        for gate in &floating {
            placer.eager(*gate)?;
        }
        if self.policy == SchedulePolicy::Lazy {
            let mut lazy: HashMap<GateRef, usize> = HashMap::default();
            for gate in &floating {
                placer.lazy(*gate, &mut lazy)?;
            }
            for (gate, block) in lazy {
                placer.assignment.insert(gate, block);
            }
        } else {
            let eager = std::mem::take(&mut placer.eager);
            placer.assignment.extend(eager);
        }

        // Order floating gates so that inputs come first
        let mut is_floating = vec![false; circuit.len()];
        for gate in &floating {
            is_floating[gate.index()] = true;
        }
        let mut placed = vec![false; circuit.len()];
        for gate in &floating {
            order_floating(circuit, &assignment, &mut blocks, &is_floating, &mut placed, *gate);
        }

        tracing::debug!(
            blocks = blocks.len(),
            gates = assignment.len(),
            policy = ?self.policy,
            "schedule built"
        );
        Ok(Schedule {
            blocks,
            assignment,
            policy: self.policy,
        })
    }
}

struct BlockBuilder<'c, 'a> {
    circuit: &'c Circuit,
    arena: &'a Arena<GateRef>,
    chains: Vec<&'a [GateRef]>,
    block_of: HashMap<GateRef, usize>,
}

impl<'c, 'a> BlockBuilder<'c, 'a> {
    fn new(circuit: &'c Circuit, arena: &'a Arena<GateRef>) -> Self {
        Self {
            circuit,
            arena,
            chains: Vec::new(),
            block_of: HashMap::default(),
        }
    }

    fn build_blocks(&mut self) -> Result<()> {
        let acc = self.circuit.acc();
        let mut starts = vec![self.circuit.state_entry()];
        starts.extend(
            self.circuit
                .live_gates()
                .filter(|g| acc.opcode(*g).is_block_start() && *g != self.circuit.state_entry()),
        );
        for start in starts {
            let mut chain = vec![start];
            let mut current = start;
            while !matches!(acc.opcode(current), OpCode::IfBranch | OpCode::LoopBack | OpCode::Return) {
                let successors: Vec<GateRef> = acc.state_successors(current).collect();
                let next = match successors.as_slice() {
                    [] => break,
                    [next] => *next,
                    _ => {
                        return Err(Error::internal(format!(
                            "{} has {} state successors",
                            current,
                            successors.len()
                        )))
                    }
                };
                if acc.opcode(next).is_block_start() {
                    break;
                }
                chain.push(next);
                current = next;
            }
            // Selectors live in their merge's block
            chain.extend(acc.selectors_of(start));
            let id = self.chains.len();
            for gate in &chain {
                self.block_of.insert(*gate, id);
            }
            self.chains.push(self.arena.alloc_extend(chain));
        }
        Ok(())
    }

    fn finish(self) -> Vec<BasicBlock> {
        let acc = self.circuit.acc();
        let mut blocks: Vec<BasicBlock> = self
            .chains
            .iter()
            .enumerate()
            .map(|(id, chain)| {
                let start = chain[0];
                let end = chain
                    .iter()
                    .rev()
                    .copied()
                    .find(|g| acc.opcode(*g).is_state_chain())
                    .unwrap_or(start);
                let preds = self
                    .circuit
                    .gate(start)
                    .state_ins()
                    .iter()
                    .filter_map(|p| self.block_of.get(p).copied())
                    .collect();
                BasicBlock {
                    id,
                    start,
                    end,
                    preds,
                    succs: Vec::new(),
                    idom: None,
                    depth: 0,
                    loop_depth: 0,
                    pinned: chain.to_vec(),
                    scheduled: Vec::new(),
                }
            })
            .collect();
        for id in 0..blocks.len() {
            for pred in blocks[id].preds.clone() {
                blocks[pred].succs.push(id);
            }
        }
        blocks
    }
}

fn reverse_postorder(blocks: &[BasicBlock]) -> Vec<usize> {
    let mut visited = vec![false; blocks.len()];
    let mut order = Vec::with_capacity(blocks.len());
    let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
    visited[0] = true;
    while let Some((block, next)) = stack.last_mut() {
        if let Some(succ) = blocks[*block].succs.get(*next).copied() {
            *next += 1;
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            order.push(*block);
            stack.pop();
        }
    }
    order.reverse();
    order
}

/// Cooper, Harvey and Kennedy's iterative dominator algorithm
fn compute_dominators(blocks: &mut [BasicBlock]) {
    if blocks.is_empty() {
        return;
    }
    let order = reverse_postorder(blocks);
    let mut rpo_index = vec![usize::MAX; blocks.len()];
    for (i, b) in order.iter().enumerate() {
        rpo_index[*b] = i;
    }
    let mut idom: Vec<Option<usize>> = vec![None; blocks.len()];
    idom[0] = Some(0);

    let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| -> usize {
        while a != b {
            while rpo_index[a] > rpo_index[b] {
                a = idom[a].unwrap_or(0);
            }
            while rpo_index[b] > rpo_index[a] {
                b = idom[b].unwrap_or(0);
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &block in order.iter().skip(1) {
            let mut new_idom: Option<usize> = None;
            for &pred in &blocks[block].preds {
                if idom[pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, pred, current),
                });
            }
            if new_idom.is_some() && idom[block] != new_idom {
                idom[block] = new_idom;
                changed = true;
            }
        }
    }

    for &block in &order {
        if block != 0 {
            blocks[block].idom = idom[block];
        }
    }
    for &block in &order {
        blocks[block].depth = match blocks[block].idom {
            Some(parent) => blocks[parent].depth + 1,
            None => 0,
        };
    }
}

struct Placer<'s> {
    circuit: &'s Circuit,
    blocks: &'s [BasicBlock],
    assignment: &'s mut HashMap<GateRef, usize>,
    eager: HashMap<GateRef, usize>,
}

impl Placer<'_> {
    fn block(&self, gate: GateRef) -> Option<usize> {
        self.assignment.get(&gate).or_else(|| self.eager.get(&gate)).copied()
    }

    /// Deepest input block
    fn eager(&mut self, root: GateRef) -> Result<usize> {
        if let Some(block) = self.block(root) {
            return Ok(block);
        }
        let circuit = self.circuit;
        let mut on_stack: HashSet<GateRef> = HashSet::default();
        let mut stack: Vec<(GateRef, usize)> = vec![(root, 0)];
        on_stack.insert(root);
        while let Some(&(gate, next)) = stack.last() {
            let inputs = circuit.gate(gate).value_ins();
            if let Some(input) = inputs.get(next).copied() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                if !circuit.is_live(input) {
                    return Err(Error::verification(gate, format!("unscheduled input {}", input)));
                }
                if self.block(input).is_none() && on_stack.insert(input) {
                    stack.push((input, 0));
                }
                continue;
            }
            stack.pop();
            on_stack.remove(&gate);
            let mut best = 0;
            for block in inputs.iter().filter_map(|input| self.block(*input)) {
                if self.blocks[block].depth > self.blocks[best].depth {
                    best = block;
                }
            }
            self.eager.insert(gate, best);
        }
        Ok(self.block(root).unwrap_or(0))
    }

    fn lca(&self, mut a: usize, mut b: usize) -> usize {
        while a != b {
            if self.blocks[a].depth >= self.blocks[b].depth {
                match self.blocks[a].idom {
                    Some(parent) => a = parent,
                    None => return 0,
                }
            } else {
                match self.blocks[b].idom {
                    Some(parent) => b = parent,
                    None => return 0,
                }
            }
        }
        a
    }

    /// Block a use of a gate counts in, once the user is placed
    fn use_block(&self, edge: Use, lazy: &HashMap<GateRef, usize>) -> Option<usize> {
        let acc = self.circuit.acc();
        match acc.opcode(edge.user) {
            OpCode::ValueSelector if edge.kind == EdgeKind::Value => {
                let merge = acc.state_in(edge.user, 0);
                let merge_block = self.block(merge).unwrap_or(0);
                // The i-th value arrives from the merge's i-th state input
                let pred = self
                    .circuit
                    .gate(merge)
                    .state_ins()
                    .get(edge.index)
                    .and_then(|p| self.block(*p));
                Some(pred.unwrap_or(merge_block))
            }
            _ => self.assignment.get(&edge.user).or_else(|| lazy.get(&edge.user)).copied(),
        }
    }

    /// Common dominator of the use blocks
    fn lazy(&mut self, root: GateRef, lazy: &mut HashMap<GateRef, usize>) -> Result<usize> {
        let circuit = self.circuit;
        let acc = circuit.acc();
        if let Some(block) = self.assignment.get(&root).or_else(|| lazy.get(&root)) {
            return Ok(*block);
        }
        let mut on_stack: HashSet<GateRef> = HashSet::default();
        let mut stack: Vec<(GateRef, Vec<Use>, usize)> = vec![(root, acc.uses(root).collect(), 0)];
        on_stack.insert(root);
        while let Some((gate, uses, next)) = stack.last_mut() {
            if let Some(edge) = uses.get(*next).copied() {
                *next += 1;
                let selector_arm = acc.opcode(edge.user) == OpCode::ValueSelector && edge.kind == EdgeKind::Value;
                let placed = self.assignment.contains_key(&edge.user) || lazy.contains_key(&edge.user);
                if !selector_arm && !placed && on_stack.insert(edge.user) {
                    stack.push((edge.user, acc.uses(edge.user).collect(), 0));
                }
                continue;
            }
            let gate = *gate;
            let mut common: Option<usize> = None;
            for edge in uses.iter() {
                let Some(block) = self.use_block(*edge, lazy) else {
                    continue;
                };
                common = Some(match common {
                    None => block,
                    Some(current) => self.lca(current, block),
                });
            }
            stack.pop();
            on_stack.remove(&gate);
            let block = match common {
                Some(block) => block,
                None => self.eager(gate)?,
            };
            lazy.insert(gate, block);
        }
        Ok(lazy.get(&root).copied().unwrap_or(0))
    }
}

/// Append `root` and its unplaced floating inputs to their blocks, inputs
/// first
fn order_floating(
    circuit: &Circuit,
    assignment: &HashMap<GateRef, usize>,
    blocks: &mut [BasicBlock],
    is_floating: &[bool],
    placed: &mut [bool],
    root: GateRef,
) {
    if placed[root.index()] {
        return;
    }
    placed[root.index()] = true;
    let mut stack: Vec<(GateRef, usize)> = vec![(root, 0)];
    while let Some((gate, next)) = stack.last_mut() {
        let gate = *gate;
        if let Some(input) = circuit.gate(gate).value_ins().get(*next).copied() {
            *next += 1;
            if !input.is_null() && is_floating[input.index()] && !placed[input.index()] {
                placed[input.index()] = true;
                stack.push((input, 0));
            }
            continue;
        }
        stack.pop();
        if let Some(block) = assignment.get(&gate) {
            blocks[*block].scheduled.push(gate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBuilder, CircuitInfo, GateType, IcmpCond, MachineType};
    use crate::pgo::MethodId;

    struct LoopShape {
        circuit: Circuit,
        entry_end: GateRef,
        if_true: GateRef,
        back: GateRef,
        invariant: GateRef,
        variant: GateRef,
    }

    // n2 = n * 2 is invariant; i + load(p) is computed in the body
    fn loop_shape() -> LoopShape {
        let mut circuit = Circuit::new(CircuitInfo::new("sched", MethodId(0)));
        let mut b = CircuitBuilder::new(&mut circuit);
        let n = b.arg(2, GateType::NJSValue);
        let p = b.arg(3, GateType::TaggedPointer);
        let two = b.int64(2);
        let zero = b.int64(0);
        let entry_end = b.state();
        let header = b.loop_begin();
        let i = b.loop_phi(header, MachineType::I64, GateType::NJSValue, zero);
        let dphi = b.loop_depend_phi(header);
        let invariant = b.int_mul(MachineType::I64, n, two);
        let cond = b.icmp(IcmpCond::Slt, i, invariant);
        let (if_true, leave) = b.branch(cond);
        let step = b.load_const_offset(MachineType::I64, GateType::NJSValue, p, 8);
        let variant = b.int_add(MachineType::I64, i, step);
        let back_depend = b.depend();
        let back = b.loop_back(header);
        b.set_back_input(i, EdgeKind::Value, variant);
        b.set_back_input(dphi, EdgeKind::Depend, back_depend);
        let exit = b.loop_exit(leave);
        b.set_depend(dphi);
        b.loop_exit_depend(exit);
        let out = b.loop_exit_value(exit, i);
        b.ret(out);
        LoopShape {
            circuit,
            entry_end,
            if_true,
            back,
            invariant,
            variant,
        }
    }

    fn branch_of(circuit: &Circuit, if_true: GateRef) -> GateRef {
        circuit.acc().state_in(if_true, 0)
    }

    #[test]
    fn test_eager_hoists_invariant() {
        let t = loop_shape();
        let branch = branch_of(&t.circuit, t.if_true);
        let schedule = Scheduler::with_policy(SchedulePolicy::Eager).run(&t.circuit).unwrap();
        assert_eq!(schedule.control_point(t.invariant), Some(t.entry_end));
        assert_eq!(schedule.control_point(t.variant), Some(t.back));
        assert_eq!(schedule.control_point(branch), Some(branch));
    }

    #[test]
    fn test_lazy_sinks_to_use() {
        let t = loop_shape();
        let branch = branch_of(&t.circuit, t.if_true);
        let schedule = Scheduler::with_policy(SchedulePolicy::Lazy).run(&t.circuit).unwrap();
        assert_eq!(schedule.control_point(t.invariant), Some(branch));
        assert_eq!(schedule.control_point(t.variant), Some(t.back));
    }

    #[test]
    fn test_every_gate_assigned_once() {
        let t = loop_shape();
        for policy in [SchedulePolicy::Eager, SchedulePolicy::Lazy] {
            let schedule = Scheduler::with_policy(policy).run(&t.circuit).unwrap();
            let mut seen = vec![0; t.circuit.len()];
            for block in &schedule.blocks {
                for gate in block.pinned.iter().chain(&block.scheduled) {
                    seen[gate.index()] += 1;
                }
            }
            for gate in t.circuit.live_gates() {
                if t.circuit.is_root(gate) || t.circuit.gate(gate).op() == OpCode::Arg {
                    continue;
                }
                assert_eq!(seen[gate.index()], 1, "{}", t.circuit.dump_gate(gate));
            }
        }
    }

    #[test]
    fn test_long_value_chain() {
        let mut circuit = Circuit::new(CircuitInfo::new("chain", MethodId(0)));
        let mut b = CircuitBuilder::new(&mut circuit);
        let x = b.arg(2, GateType::NJSValue);
        let one = b.int64(1);
        let mut value = x;
        for _ in 0..20_000 {
            value = b.int_add(MachineType::I64, value, one);
        }
        let ret = b.ret(value);
        for policy in [SchedulePolicy::Eager, SchedulePolicy::Lazy] {
            let schedule = Scheduler::with_policy(policy).run(&circuit).unwrap();
            assert_eq!(schedule.assigned(), circuit.live_count());
            let entry = schedule.entry();
            assert_eq!(entry.scheduled.last(), Some(&value));
            assert_eq!(schedule.control_point(value), Some(ret));
        }
    }

    #[test]
    fn test_selector_arm_after_dead_predecessor() {
        let mut circuit = Circuit::new(CircuitInfo::new("arms", MethodId(0)));
        let mut b = CircuitBuilder::new(&mut circuit);
        let x = b.arg(2, GateType::NJSValue);
        let zero = b.int64(0);
        let one = b.int64(1);
        let cond = b.icmp(IcmpCond::Slt, x, zero);
        let depend = b.depend();
        let (if_true, if_false) = b.branch(cond);
        let true_arm = (if_true, depend, x);
        b.set_position(if_false, depend);
        let bumped = b.int_add(MachineType::I64, x, one);
        let false_arm = (if_false, depend, bumped);
        let joined = b.join(&[true_arm, false_arm], MachineType::I64, GateType::NJSValue);
        b.ret(joined);
        // The true arm was found unreachable
        circuit.delete_gate(if_true);

        let schedule = Scheduler::with_policy(SchedulePolicy::Lazy).run(&circuit).unwrap();
        assert_eq!(schedule.control_point(bumped), Some(if_false));
    }

    #[test]
    fn test_loop_depth_and_dominators() {
        let t = loop_shape();
        let schedule = Scheduler::with_policy(SchedulePolicy::Eager).run(&t.circuit).unwrap();
        let body = schedule.block_of(t.back).unwrap();
        assert_eq!(body.loop_depth, 1);
        assert_eq!(schedule.entry().loop_depth, 0);
        let header = &schedule.blocks[body.idom.unwrap()];
        assert_eq!(header.end, branch_of(&t.circuit, t.if_true));
        assert!(schedule.to_string().contains("loop-depth=1"));
    }
}
