//! Global value numbering
//!
//! Pure gates are entered into an open-addressed table keyed by opcode,
//! inputs and metadata. A gate that finds a structurally equal representative
//! is replaced by it.
//!
//! Slots hold gate references, and gates can be deleted behind the table's
//! back by other passes. A slot whose gate has become a `Nop` is treated as a
//! tombstone: probing continues past it, and the first one seen is reused on
//! insertion.
//!
//! Checks are effectful and never enter the table. A check is instead removed
//! when an equivalent check runs earlier on its depend chain with nothing in
//! between but other checks and loads, or anything at all for call-target
//! checks. Equivalence ignores frame-state inputs
//! and uses the same metadata rules as the table, so two call-target checks
//! of the same callee at different call sites are one check.

use super::{PassStats, PassVisitor, VisitResult};
use crate::circuit::{Circuit, GateRef, MetaEqualityTable, OpCode};
use crate::config::CompilerOptions;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

const INITIAL_CAPACITY: usize = 64;

/// Depend-chain steps searched for an equivalent earlier check
const CHECK_WINDOW: usize = 32;

/// Gates `check` may be moved across without changing its outcome.
/// A function's method never changes, so call-target checks also cross
/// calls and stores.
fn transparent_to(check: OpCode, op: OpCode) -> bool {
    if check == OpCode::TypedCallTargetCheck && op.is_effectful() && !op.is_control() && !op.is_selector() {
        return true;
    }
    op.is_check()
        || matches!(
            op,
            OpCode::Load
                | OpCode::LoadHClass
                | OpCode::LoadProperty
                | OpCode::LoadPropertyOnProto
                | OpCode::LoadTypedArrayLength
                | OpCode::LoadArrayLength
                | OpCode::LoadStringLength
                | OpCode::LoadElement
        )
}

/// Value inputs a check tests, without its frame state
fn guarded_values(circuit: &Circuit, gate: GateRef) -> Vec<GateRef> {
    circuit
        .gate(gate)
        .value_ins()
        .iter()
        .copied()
        .filter(|v| circuit.is_live(*v) && circuit.gate(*v).op() != OpCode::FrameState)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(GateRef),
}

pub struct ValueNumbering {
    table: Vec<Slot>,
    live: usize,
    tombstones: usize,
    meta_table: MetaEqualityTable,
    replaced: u64,
    checks_removed: u64,
    trace: bool,
}

impl ValueNumbering {
    pub fn new(options: &CompilerOptions) -> Self {
        Self::with_meta_table(options, MetaEqualityTable::new())
    }

    pub fn with_meta_table(options: &CompilerOptions, meta_table: MetaEqualityTable) -> Self {
        Self {
            table: vec![Slot::Empty; INITIAL_CAPACITY],
            live: 0,
            tombstones: 0,
            meta_table,
            replaced: 0,
            checks_removed: 0,
            trace: options.trace_enabled("value-numbering"),
        }
    }

    /// Number of gates replaced so far
    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    fn hash_gate(&self, circuit: &Circuit, gate: GateRef) -> u64 {
        let g = circuit.gate(gate);
        let mut state = FxHasher::default();
        g.op().hash(&mut state);
        g.value_ins().hash(&mut state);
        g.machine_type().hash(&mut state);
        self.meta_table.hash_into(g.op(), g.meta(), &mut state);
        state.finish()
    }

    fn equal(&self, circuit: &Circuit, a: GateRef, b: GateRef) -> bool {
        let (ga, gb) = (circuit.gate(a), circuit.gate(b));
        ga.op() == gb.op()
            && ga.value_ins() == gb.value_ins()
            && ga.gate_type() == gb.gate_type()
            && ga.machine_type() == gb.machine_type()
            && self.meta_table.equal(ga.op(), ga.meta(), gb.meta())
    }

    fn needs_growth(&self) -> bool {
        (self.live + self.tombstones + 1) * 5 > self.table.len() * 4
    }

    /// Double the table, re-inserting live entries in slot order
    fn grow(&mut self, circuit: &Circuit) {
        let old = std::mem::take(&mut self.table);
        self.table = vec![Slot::Empty; old.len() * 2];
        self.live = 0;
        self.tombstones = 0;
        for slot in old {
            if let Slot::Occupied(gate) = slot {
                if circuit.is_live(gate) {
                    let mask = self.table.len() - 1;
                    let mut index = self.hash_gate(circuit, gate) as usize & mask;
                    while self.table[index] != Slot::Empty {
                        index = (index + 1) & mask;
                    }
                    self.table[index] = Slot::Occupied(gate);
                    self.live += 1;
                }
            }
        }
    }

    /// An earlier check on `gate`'s depend chain that already tests what
    /// `gate` tests
    fn dominating_check(&self, circuit: &Circuit, gate: GateRef) -> Option<GateRef> {
        let acc = circuit.acc();
        let g = circuit.gate(gate);
        let values = guarded_values(circuit, gate);
        let mut current = acc.depend_of(gate);
        for _ in 0..CHECK_WINDOW {
            if !circuit.is_live(current) || !transparent_to(g.op(), acc.opcode(current)) {
                return None;
            }
            let other = circuit.gate(current);
            if other.op() == g.op()
                && self.meta_table.equal(g.op(), g.meta(), other.meta())
                && guarded_values(circuit, current) == values
            {
                return Some(current);
            }
            current = acc.depend_of(current);
        }
        None
    }

    /// Find `gate`'s representative, inserting it when there is none
    fn lookup_or_insert(&mut self, circuit: &Circuit, gate: GateRef) -> Option<GateRef> {
        if self.needs_growth() {
            self.grow(circuit);
        }
        let mask = self.table.len() - 1;
        let mut index = self.hash_gate(circuit, gate) as usize & mask;
        let mut first_free: Option<usize> = None;
        loop {
            match self.table[index] {
                Slot::Empty => break,
                Slot::Tombstone => {
                    first_free.get_or_insert(index);
                }
                Slot::Occupied(other) if !circuit.is_live(other) => {
                    self.table[index] = Slot::Tombstone;
                    self.live -= 1;
                    self.tombstones += 1;
                    first_free.get_or_insert(index);
                }
                Slot::Occupied(other) if other == gate => return None,
                Slot::Occupied(other) => {
                    if self.equal(circuit, gate, other) {
                        return Some(other);
                    }
                }
            }
            index = (index + 1) & mask;
        }
        match first_free {
            Some(slot) => {
                self.table[slot] = Slot::Occupied(gate);
                self.tombstones -= 1;
            }
            None => self.table[index] = Slot::Occupied(gate),
        }
        self.live += 1;
        None
    }
}

impl PassVisitor for ValueNumbering {
    fn name(&self) -> &'static str {
        "value-numbering"
    }

    fn visit_gate(&mut self, circuit: &mut Circuit, gate: GateRef) -> VisitResult {
        let op = circuit.gate(gate).op();
        if op.is_check() {
            let Some(earlier) = self.dominating_check(circuit, gate) else {
                return VisitResult::NoChange;
            };
            self.checks_removed += 1;
            if self.trace {
                tracing::debug!("value-numbering: {} already checked by {}", circuit.dump_gate(gate), earlier);
            }
            return VisitResult::Replace(GateRef::NULL);
        }
        if !op.is_pure() {
            return VisitResult::NoChange;
        }
        match self.lookup_or_insert(circuit, gate) {
            Some(existing) => {
                self.replaced += 1;
                if self.trace {
                    tracing::debug!(
                        "value-numbering: {} replaced by {}",
                        circuit.dump_gate(gate),
                        existing
                    );
                }
                VisitResult::Replace(existing)
            }
            None => VisitResult::NoChange,
        }
    }

    fn finish(&mut self, stats: &mut PassStats) {
        stats.bump("value-numbering.deduplicated", self.replaced);
        stats.bump("value-numbering.checks-removed", self.checks_removed);
        self.replaced = 0;
        self.checks_removed = 0;
    }
}
