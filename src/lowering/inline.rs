//! Speculative inlining
//!
//! Call sites whose profile names a single callee are replaced by a copy of
//! the callee's graph, guarded by a call-target check. Getter sites
//! (`LdObjByName` resolving to an accessor on a mono receiver) are inlined
//! the same way behind a shape check, with the receiver bound to `this`.
//!
//! The callee's entry state and depend are bound to the position after the
//! guard and its `Return`s are joined into one merge point whose value
//! selector replaces the call's result. Copied call sites are queued again
//! with the extended inlining chain, so the depth and recursion limits hold
//! across nested inlining.

use super::splice;
use crate::circuit::{
    BytecodeInfo, BytecodeOp, CallTargetKind, Circuit, CircuitBuilder, GateMeta, GateRef, GateType, MachineType, OpCode,
};
use crate::config::CompilerOptions;
use crate::pass::PassStats;
use crate::pgo::{CallTypeInfo, MethodId, ProfileProvider, PropertyTypeInfo, ShapeId};
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Callee graphs available for inlining, keyed by method
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<MethodId, Arc<Circuit>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method graph under the method id of its circuit info
    pub fn register(&mut self, circuit: Circuit) {
        let method = circuit.info().method;
        self.methods.insert(method, Arc::new(circuit));
    }

    pub fn get(&self, method: MethodId) -> Option<&Circuit> {
        self.methods.get(&method).map(|c| c.as_ref())
    }

    /// Bytecode count used for the size budget. Falls back to the number of
    /// generic bytecode gates when the front end left the count unset.
    pub fn bytecode_count(&self, method: MethodId) -> Option<u32> {
        let circuit = self.get(method)?;
        let declared = circuit.info().bytecode_count;
        if declared > 0 {
            return Some(declared);
        }
        Some(circuit.gates_with_op(OpCode::JsBytecode).len() as u32)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Why a call site was not inlined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InlineRefusal {
    TooLarge,
    TooDeep,
    Recursive,
    /// Getter site whose lookup result is not a mono accessor
    AccessorMismatch,
    /// The callee never returns
    NoReturn,
    /// The callee graph is not in the registry
    NoCallee,
}

impl InlineRefusal {
    pub fn name(self) -> &'static str {
        match self {
            InlineRefusal::TooLarge => "too-large",
            InlineRefusal::TooDeep => "too-deep",
            InlineRefusal::Recursive => "recursive",
            InlineRefusal::AccessorMismatch => "accessor-mismatch",
            InlineRefusal::NoReturn => "no-return",
            InlineRefusal::NoCallee => "no-callee",
        }
    }
}

impl fmt::Display for InlineRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An inlinable site and the guard protecting it
#[derive(Debug, Clone, Copy)]
enum Site {
    Call { target: MethodId },
    Getter { target: MethodId, receiver: ShapeId, on_proto: bool },
}

impl Site {
    fn target(self) -> MethodId {
        match self {
            Site::Call { target } | Site::Getter { target, .. } => target,
        }
    }
}

pub struct SpeculativeInliner<'a, P: ProfileProvider> {
    provider: &'a P,
    registry: &'a MethodRegistry,
    no_check: bool,
    max_bytecodes: u32,
    max_depth: usize,
    trace: bool,
    refusals: BTreeMap<InlineRefusal, u64>,
}

impl<'a, P: ProfileProvider> SpeculativeInliner<'a, P> {
    pub fn new(provider: &'a P, registry: &'a MethodRegistry, options: &CompilerOptions) -> Self {
        Self {
            provider,
            registry,
            no_check: options.no_check,
            max_bytecodes: options.max_inline_bytecode_count,
            max_depth: options.max_inline_call_depth as usize,
            trace: options.trace_enabled("inline"),
            refusals: BTreeMap::new(),
        }
    }

    /// Refusals of the given kind since construction
    pub fn refusals(&self, reason: InlineRefusal) -> u64 {
        self.refusals.get(&reason).copied().unwrap_or(0)
    }

    /// Inline every eligible site of `circuit`, including sites copied in
    /// from inlined callees
    pub fn run(&mut self, circuit: &mut Circuit) -> PassStats {
        let mut stats = PassStats::new();
        let root = circuit.info().method;
        let mut worklist: Vec<(GateRef, Vec<MethodId>)> = candidate_sites(circuit, circuit.live_gates().collect())
            .into_iter()
            .map(|g| (g, vec![root]))
            .collect();
        worklist.reverse();

        while let Some((gate, chain)) = worklist.pop() {
            if !circuit.is_live(gate) {
                continue;
            }
            let Some(info) = circuit.acc().bytecode_info(gate).cloned() else {
                continue;
            };
            let Some(site) = self.site(&info) else {
                continue;
            };
            let site = match site.and_then(|s| self.check_budget(s, &chain)) {
                Ok(site) => site,
                Err(reason) => {
                    *self.refusals.entry(reason).or_default() += 1;
                    stats.bump(&format!("inline.refused.{}", reason), 1);
                    if self.trace {
                        tracing::debug!("inline: refused {:?} at {}:{}: {}", info.op, info.method, info.pc, reason);
                    }
                    continue;
                }
            };
            let target = site.target();
            let Some(callee) = self.registry.get(target) else {
                continue;
            };
            let copied = inline_site(circuit, gate, &info, site, callee, self.no_check);
            stats.bump("inline.inlined", 1);
            tracing::debug!(callee = %target, depth = chain.len(), "inlined call at {}:{}", info.method, info.pc);

            let mut nested = chain.clone();
            nested.push(target);
            for site in candidate_sites(circuit, copied).into_iter().rev() {
                worklist.push((site, nested.clone()));
            }
        }
        stats
    }

    /// Classify a bytecode. `None` means nothing to inline, `Err` a refusal
    fn site(&self, info: &BytecodeInfo) -> Option<Result<Site, InlineRefusal>> {
        match info.op {
            BytecodeOp::Call => {
                let target = CallTypeInfo::new(self.provider, info.method, info.pc).target?;
                if target.builtin.is_some() {
                    return None;
                }
                Some(Ok(Site::Call { target: target.method }))
            }
            BytecodeOp::LdObjByName => {
                let name = info.name.as_deref()?;
                let types = PropertyTypeInfo::new(self.provider, info.method, info.pc, name);
                if !types.any_accessor() {
                    return None;
                }
                let target = CallTypeInfo::new(self.provider, info.method, info.pc).method();
                let consistent = types.is_mono() && types.plr(0).is_accessor() && !types.has_transition();
                let (Some(target), true) = (target, consistent) else {
                    return Some(Err(InlineRefusal::AccessorMismatch));
                };
                let (receiver, holder) = (types.receiver(0), types.holder(0));
                if self.provider.prototype_depth(receiver, holder).is_none() {
                    return Some(Err(InlineRefusal::AccessorMismatch));
                }
                Some(Ok(Site::Getter {
                    target,
                    receiver,
                    on_proto: holder != receiver,
                }))
            }
            _ => None,
        }
    }

    fn check_budget(&self, site: Site, chain: &[MethodId]) -> Result<Site, InlineRefusal> {
        let target = site.target();
        let count = self.registry.bytecode_count(target).ok_or(InlineRefusal::NoCallee)?;
        if chain.contains(&target) {
            return Err(InlineRefusal::Recursive);
        }
        if chain.len() >= self.max_depth {
            return Err(InlineRefusal::TooDeep);
        }
        if count > self.max_bytecodes {
            return Err(InlineRefusal::TooLarge);
        }
        let returns = self
            .registry
            .get(target)
            .map(|c| c.gates_with_op(OpCode::Return).len())
            .unwrap_or(0);
        if returns == 0 {
            return Err(InlineRefusal::NoReturn);
        }
        Ok(site)
    }
}

/// Call and getter bytecodes among `gates`, in pool order
fn candidate_sites(circuit: &Circuit, mut gates: Vec<GateRef>) -> Vec<GateRef> {
    gates.sort();
    gates
        .into_iter()
        .filter(|g| {
            circuit
                .acc()
                .bytecode_info(*g)
                .is_some_and(|i| matches!(i.op, BytecodeOp::Call | BytecodeOp::LdObjByName))
        })
        .collect()
}

/// Replace `gate` by a guarded copy of `callee`; returns the copied gates
fn inline_site(
    circuit: &mut Circuit,
    gate: GateRef,
    info: &BytecodeInfo,
    site: Site,
    callee: &Circuit,
    no_check: bool,
) -> Vec<GateRef> {
    let values = circuit.gate(gate).value_ins().to_vec();

    let mut b = CircuitBuilder::before(circuit, gate);
    let undefined = b.undefined();
    let arguments: Vec<GateRef> = match site {
        Site::Call { .. } => values.clone(),
        Site::Getter { .. } => vec![undefined, values[0]],
    };
    if !no_check {
        let frame = b.frame_state(info.method, info.pc, &values);
        match site {
            Site::Call { target } => {
                let expected = b.method_const(target);
                b.effect(
                    OpCode::TypedCallTargetCheck,
                    GateMeta::CallTarget {
                        kind: CallTargetKind::Method,
                        pc: info.pc,
                        hint: target,
                    },
                    MachineType::NoValue,
                    &[values[0], expected, frame],
                    GateType::Empty,
                );
            }
            Site::Getter { receiver, on_proto, .. } => {
                b.effect(
                    OpCode::ObjectTypeCheck,
                    GateMeta::Shape(receiver),
                    MachineType::NoValue,
                    &[values[0], frame],
                    GateType::Empty,
                );
                if on_proto {
                    b.effect(
                        OpCode::ProtoChangeMarkerCheck,
                        GateMeta::None,
                        MachineType::NoValue,
                        &[values[0], frame],
                        GateType::Empty,
                    );
                }
            }
        }
    }
    let (entry_state, entry_depend) = (b.state(), b.depend());

    // Create the copies with placeholder inputs first; the callee may
    // contain loops, so inputs can refer forward.
    let mut map = vec![GateRef::NULL; callee.len()];
    map[callee.state_entry().index()] = entry_state;
    map[callee.depend_entry().index()] = entry_depend;
    let mut returns = Vec::new();
    let mut copied = Vec::new();
    for g in callee.live_gates() {
        let gate_ref = callee.gate(g);
        match gate_ref.op() {
            OpCode::StateEntry | OpCode::DependEntry | OpCode::ArgList => {}
            OpCode::Arg => {
                let index = match gate_ref.meta() {
                    GateMeta::Arg(index) => *index as usize,
                    _ => usize::MAX,
                };
                map[g.index()] = arguments.get(index).copied().unwrap_or(undefined);
            }
            OpCode::Return => returns.push(g),
            op => {
                let placeholders = |n: usize| vec![GateRef::NULL; n];
                let copy = circuit.new_gate(
                    op,
                    gate_ref.meta().clone(),
                    gate_ref.machine_type(),
                    &placeholders(gate_ref.state_ins().len()),
                    &placeholders(gate_ref.depend_ins().len()),
                    &placeholders(gate_ref.value_ins().len()),
                    gate_ref.gate_type(),
                );
                map[g.index()] = copy;
                copied.push((g, copy));
            }
        }
    }
    for (original, copy) in &copied {
        for (kind, index, input) in callee.gate(*original).inputs() {
            let mapped = map.get(input.index()).copied().unwrap_or(GateRef::NULL);
            if !input.is_null() && !mapped.is_null() {
                circuit.set_input(*copy, kind, index, mapped);
            }
        }
    }

    let arms: Vec<(GateRef, GateRef, GateRef)> = returns
        .iter()
        .map(|r| {
            let ret = callee.gate(*r);
            let lookup = |g: GateRef| map[g.index()];
            (lookup(ret.state_ins()[0]), lookup(ret.depend_ins()[0]), lookup(ret.value_ins()[0]))
        })
        .collect();
    let mut b = CircuitBuilder::before(circuit, gate);
    let result = b.join(&arms, MachineType::I64, GateType::AnyType);
    let (state, depend) = (b.state(), b.depend());
    splice(circuit, gate, state, depend, result);
    copied.into_iter().map(|(_, copy)| copy).collect()
}
