//! Bytecode-level typed lowering
//!
//! Each generic `JsBytecode` gate is looked up in the profile. When the
//! profile names concrete types or shapes, the bytecode is replaced by guarded
//! typed gates:
//!
//! ```text
//! Add2 a, b        PrimitiveTypeCheck<Int> a, fs
//!           ==>    PrimitiveTypeCheck<Int> b, fs
//!                  TypedBinaryOp<Add, Int> a, b, fs
//! ```
//!
//! Every guard carries a `FrameState` holding the bytecode's pc and inputs,
//! so a failing guard resumes the generic bytecode in the interpreter.
//! Sites without usable samples keep the generic gate.

use super::splice;
use crate::circuit::{
    BytecodeInfo, BytecodeOp, CallTargetKind, Circuit, CircuitBuilder, DeoptReason, GateMeta, GateRef, GateType,
    IcmpCond, MachineType, OpCode, ParamType, RuntimeId, TypedBinOp, TypedUnOp,
};
use crate::config::CompilerOptions;
use crate::pass::PassStats;
use crate::pgo::{
    ArithTypeInfo, BuiltinLength, CallTypeInfo, ElementKind, ElementTypeInfo, ProfileProvider, PropertyLookupResult,
    PropertyTypeInfo, Representation, ShapeId,
};
use std::collections::BTreeMap;

/// What one dispatch arm does once the receiver's shape is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Data property `depth` prototypes above the receiver
    Load { plr: PropertyLookupResult, depth: u32 },
    Getter { plr: PropertyLookupResult, depth: u32 },
    Store {
        plr: PropertyLookupResult,
        transition: Option<(ShapeId, ShapeId)>,
        /// The out-of-object slot is beyond the array's capacity
        grow: bool,
    },
}

/// Receivers that share one access
#[derive(Debug, Clone)]
struct Group {
    receivers: Vec<ShapeId>,
    access: Access,
}

fn push_grouped(groups: &mut Vec<Group>, receiver: ShapeId, access: Access) {
    match groups.iter_mut().find(|g| g.access == access) {
        Some(group) => group.receivers.push(receiver),
        None => groups.push(Group {
            receivers: vec![receiver],
            access,
        }),
    }
}

fn representation_type(plr: PropertyLookupResult) -> GateType {
    match plr.representation {
        Representation::Int => GateType::IntType,
        Representation::Double => GateType::DoubleType,
        Representation::Tagged => GateType::AnyType,
    }
}

fn binary_result_type(op: TypedBinOp, operand: ParamType) -> GateType {
    if op.is_comparison() {
        return GateType::BooleanType;
    }
    match (operand, op) {
        (ParamType::Int, TypedBinOp::Div) => GateType::DoubleType,
        (ParamType::Int, _) => GateType::IntType,
        _ => GateType::DoubleType,
    }
}

fn element_type(kind: ElementKind) -> GateType {
    match kind {
        ElementKind::Tagged => GateType::AnyType,
        k if k.is_small_int() => GateType::IntType,
        _ => GateType::DoubleType,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitCount {
    pub total: u64,
    pub speculated: u64,
}

pub struct TypedBytecodeLowering<'p, P: ProfileProvider> {
    provider: &'p P,
    no_check: bool,
    builtin_lowering: bool,
    trace: bool,
    hits: BTreeMap<BytecodeOp, HitCount>,
}

impl<'p, P: ProfileProvider> TypedBytecodeLowering<'p, P> {
    pub fn new(provider: &'p P, options: &CompilerOptions) -> Self {
        Self {
            provider,
            no_check: options.no_check,
            builtin_lowering: options.enable_builtin_lowering,
            trace: options.trace_enabled("typed-lowering"),
            hits: BTreeMap::new(),
        }
    }

    /// Speculated and total counts per bytecode kind since construction
    pub fn hits(&self, op: BytecodeOp) -> HitCount {
        self.hits.get(&op).copied().unwrap_or_default()
    }

    /// Lower every generic bytecode of the circuit once
    pub fn run(&mut self, circuit: &mut Circuit) -> PassStats {
        let mut stats = PassStats::new();
        for gate in circuit.gates_with_op(OpCode::JsBytecode) {
            if !circuit.is_live(gate) {
                continue;
            }
            let Some(info) = circuit.acc().bytecode_info(gate).cloned() else {
                continue;
            };
            let lowered = self.lower(circuit, gate, &info);
            let count = self.hits.entry(info.op).or_default();
            count.total += 1;
            if lowered {
                count.speculated += 1;
                stats.bump("typed-lowering.speculated", 1);
            } else {
                stats.bump("typed-lowering.generic", 1);
            }
            if self.trace {
                tracing::debug!(
                    "typed-lowering: {:?} at {}:{} {}",
                    info.op,
                    info.method,
                    info.pc,
                    if lowered { "speculated" } else { "left generic" }
                );
            }
        }
        for (op, count) in &self.hits {
            tracing::debug!(?op, speculated = count.speculated, total = count.total, "typed lowering hit rate");
            stats.bump(&format!("typed-lowering.{:?}.total", op), count.total);
            stats.bump(&format!("typed-lowering.{:?}.speculated", op), count.speculated);
        }
        stats
    }

    fn lower(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        match info.op {
            op if op.is_binary_arith() => self.lower_binary(circuit, gate, info),
            op if op.is_unary_arith() => self.lower_unary(circuit, gate, info),
            BytecodeOp::LdObjByName => self.lower_load_by_name(circuit, gate, info),
            BytecodeOp::StObjByName => self.lower_store_by_name(circuit, gate, info),
            BytecodeOp::LdObjByValue => self.lower_load_by_value(circuit, gate, info),
            BytecodeOp::StObjByValue => self.lower_store_by_value(circuit, gate, info),
            BytecodeOp::Call => self.lower_call(circuit, gate, info),
            _ => false,
        }
    }

    /// Emit a guard unless checks are disabled; `values` ends with the frame
    /// state
    fn guard(&self, b: &mut CircuitBuilder<'_>, op: OpCode, meta: GateMeta, values: &[GateRef]) {
        if !self.no_check {
            b.effect(op, meta, MachineType::NoValue, values, GateType::Empty);
        }
    }

    fn lower_binary(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        let Some(op) = TypedBinOp::from_bytecode(info.op) else {
            return false;
        };
        let Some(operand) = ArithTypeInfo::new(self.provider, info.method, info.pc).operand else {
            return false;
        };
        if op.is_bitwise() && operand != ParamType::Int {
            return false;
        }
        let values = circuit.gate(gate).value_ins().to_vec();
        let (lhs, rhs) = (values[0], values[1]);

        let mut b = CircuitBuilder::before(circuit, gate);
        let frame = b.frame_state(info.method, info.pc, &values);
        self.guard(&mut b, OpCode::PrimitiveTypeCheck, GateMeta::PrimitiveCheck(operand), &[lhs, frame]);
        self.guard(&mut b, OpCode::PrimitiveTypeCheck, GateMeta::PrimitiveCheck(operand), &[rhs, frame]);
        let result = b.effect(
            OpCode::TypedBinaryOp,
            GateMeta::TypedBinary { op, operand },
            MachineType::I64,
            &[lhs, rhs, frame],
            binary_result_type(op, operand),
        );
        let (state, depend) = (b.state(), b.depend());
        splice(circuit, gate, state, depend, result);
        true
    }

    fn lower_unary(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        let Some(op) = TypedUnOp::from_bytecode(info.op) else {
            return false;
        };
        let Some(operand) = ArithTypeInfo::new(self.provider, info.method, info.pc).operand else {
            return false;
        };
        let values = circuit.gate(gate).value_ins().to_vec();
        let gt = match (op, operand) {
            (TypedUnOp::Not, _) => GateType::BooleanType,
            (_, ParamType::Int) => GateType::IntType,
            _ => GateType::DoubleType,
        };

        let mut b = CircuitBuilder::before(circuit, gate);
        let frame = b.frame_state(info.method, info.pc, &values);
        self.guard(&mut b, OpCode::PrimitiveTypeCheck, GateMeta::PrimitiveCheck(operand), &[values[0], frame]);
        let result = b.effect(
            OpCode::TypedUnaryOp,
            GateMeta::TypedUnary { op, operand },
            MachineType::I64,
            &[values[0], frame],
            gt,
        );
        let (state, depend) = (b.state(), b.depend());
        splice(circuit, gate, state, depend, result);
        true
    }

    fn lower_load_by_name(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        let Some(name) = info.name.as_deref() else {
            return false;
        };
        let types = PropertyTypeInfo::new(self.provider, info.method, info.pc, name);
        if let Some(length) = types.builtin_length() {
            return self.lower_builtin_length(circuit, gate, info, length);
        }
        if !types.all_found() || types.has_transition() {
            return false;
        }
        let mut groups = Vec::new();
        for i in 0..types.len() {
            let (receiver, holder, plr) = (types.receiver(i), types.holder(i), types.plr(i));
            let Some(depth) = self.provider.prototype_depth(receiver, holder) else {
                return false;
            };
            let access = if plr.is_accessor() {
                Access::Getter { plr, depth }
            } else {
                Access::Load { plr, depth }
            };
            push_grouped(&mut groups, receiver, access);
        }
        if types.is_poly() && types.any_accessor() {
            return false;
        }
        self.dispatch(circuit, gate, info, None, &groups, types.is_mono())
    }

    fn lower_store_by_name(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        let Some(name) = info.name.as_deref() else {
            return false;
        };
        let types = PropertyTypeInfo::new(self.provider, info.method, info.pc, name);
        if !types.all_found() || types.any_accessor() {
            return false;
        }
        let mut groups = Vec::new();
        for i in 0..types.len() {
            let (receiver, plr) = (types.receiver(i), types.plr(i));
            if types.holder(i) != receiver || !plr.is_writable() {
                return false;
            }
            let access = match types.transition(i) {
                Some(to) => {
                    let Some(shape) = self.provider.shape(receiver) else {
                        return false;
                    };
                    let grow = !plr.is_in_object() && plr.offset >= shape.out_of_object_capacity;
                    Access::Store {
                        plr,
                        transition: Some((receiver, to)),
                        grow,
                    }
                }
                None => Access::Store {
                    plr,
                    transition: None,
                    grow: false,
                },
            };
            push_grouped(&mut groups, receiver, access);
        }
        let stored = circuit.gate(gate).value_ins()[1];
        self.dispatch(circuit, gate, info, Some(stored), &groups, types.is_mono())
    }

    /// Replace a by-name access with a shape dispatch over `groups`
    fn dispatch(
        &self,
        circuit: &mut Circuit,
        gate: GateRef,
        info: &BytecodeInfo,
        stored: Option<GateRef>,
        groups: &[Group],
        mono: bool,
    ) -> bool {
        let Some((last, rest)) = groups.split_last() else {
            return false;
        };
        let values = circuit.gate(gate).value_ins().to_vec();
        let object = values[0];
        let gt = groups
            .iter()
            .map(|g| access_type(g.access))
            .reduce(|a, b| if a == b { a } else { GateType::AnyType })
            .unwrap_or(GateType::AnyType);

        let mut b = CircuitBuilder::before(circuit, gate);
        let frame = b.frame_state(info.method, info.pc, &values);
        let result = if mono {
            self.guard(&mut b, OpCode::ObjectTypeCheck, GateMeta::Shape(last.receivers[0]), &[object, frame]);
            self.access(&mut b, object, stored, frame, last.access)
        } else {
            self.guard(&mut b, OpCode::HeapObjectCheck, GateMeta::None, &[object, frame]);
            let hclass = b.effect(OpCode::LoadHClass, GateMeta::None, MachineType::ArchWord, &[object], GateType::NJSValue);
            let mut arms = Vec::with_capacity(groups.len());
            for group in rest {
                let cond = shape_test(&mut b, hclass, &group.receivers);
                let depend = b.depend();
                let (_, if_false) = b.branch(cond);
                let value = self.access(&mut b, object, stored, frame, group.access);
                arms.push((b.state(), b.depend(), value));
                b.set_position(if_false, depend);
            }
            if !self.no_check {
                let cond = shape_test(&mut b, hclass, &last.receivers);
                b.deopt_check(cond, frame, DeoptReason::PolyMiss);
            }
            let value = self.access(&mut b, object, stored, frame, last.access);
            arms.push((b.state(), b.depend(), value));
            let mt = if stored.is_some() { MachineType::NoValue } else { MachineType::I64 };
            b.join(&arms, mt, gt)
        };
        let (state, depend) = (b.state(), b.depend());
        splice(circuit, gate, state, depend, result);
        true
    }

    fn access(
        &self,
        b: &mut CircuitBuilder<'_>,
        object: GateRef,
        stored: Option<GateRef>,
        frame: GateRef,
        access: Access,
    ) -> GateRef {
        let gt = access_type(access);
        match access {
            Access::Load { plr, depth: 0 } => {
                b.effect(OpCode::LoadProperty, GateMeta::Property(plr), MachineType::I64, &[object], gt)
            }
            Access::Load { plr, depth } => {
                self.guard(b, OpCode::ProtoChangeMarkerCheck, GateMeta::None, &[object, frame]);
                b.effect(
                    OpCode::LoadPropertyOnProto,
                    GateMeta::ProtoProperty { plr, depth },
                    MachineType::I64,
                    &[object],
                    gt,
                )
            }
            Access::Getter { plr, depth } => {
                if depth > 0 {
                    self.guard(b, OpCode::ProtoChangeMarkerCheck, GateMeta::None, &[object, frame]);
                }
                b.effect(
                    OpCode::CallGetter,
                    GateMeta::ProtoProperty { plr, depth },
                    MachineType::I64,
                    &[object],
                    gt,
                )
            }
            Access::Store { plr, transition, grow } => {
                let Some(value) = stored else {
                    unreachable!("store dispatch without a stored value");
                };
                if let Some((from, to)) = transition {
                    if grow {
                        b.effect(
                            OpCode::RuntimeCall,
                            GateMeta::Runtime {
                                id: RuntimeId::GrowPropertiesArray,
                                argc: 1,
                            },
                            MachineType::NoValue,
                            &[object],
                            GateType::Empty,
                        );
                    }
                    b.effect(
                        OpCode::TransitionShape,
                        GateMeta::Transition { from, to },
                        MachineType::NoValue,
                        &[object],
                        GateType::Empty,
                    );
                }
                b.effect(OpCode::StoreProperty, GateMeta::Property(plr), MachineType::NoValue, &[object, value], GateType::Empty);
                GateRef::NULL
            }
        }
    }

    fn lower_builtin_length(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo, length: BuiltinLength) -> bool {
        let values = circuit.gate(gate).value_ins().to_vec();
        let object = values[0];
        let mut b = CircuitBuilder::before(circuit, gate);
        let frame = b.frame_state(info.method, info.pc, &values);
        let (check, check_meta, load, load_meta) = match length {
            BuiltinLength::TypedArray(kind) => (
                OpCode::TypedArrayCheck,
                GateMeta::TypedArray(kind),
                OpCode::LoadTypedArrayLength,
                GateMeta::TypedArray(kind),
            ),
            BuiltinLength::Array => (OpCode::StableArrayCheck, GateMeta::None, OpCode::LoadArrayLength, GateMeta::None),
            BuiltinLength::String => (
                OpCode::PrimitiveTypeCheck,
                GateMeta::PrimitiveCheck(ParamType::String),
                OpCode::LoadStringLength,
                GateMeta::None,
            ),
        };
        self.guard(&mut b, check, check_meta, &[object, frame]);
        let result = b.effect(load, load_meta, MachineType::I64, &[object], GateType::IntType);
        let (state, depend) = (b.state(), b.depend());
        splice(circuit, gate, state, depend, result);
        true
    }

    /// Receiver, index and bounds guards shared by element loads and stores
    fn element_guards(&self, b: &mut CircuitBuilder<'_>, kind: ElementKind, object: GateRef, index: GateRef, frame: GateRef) {
        if self.no_check {
            return;
        }
        self.guard(b, OpCode::PrimitiveTypeCheck, GateMeta::PrimitiveCheck(ParamType::Int), &[index, frame]);
        let length = if kind == ElementKind::Tagged {
            self.guard(b, OpCode::StableArrayCheck, GateMeta::None, &[object, frame]);
            b.effect(OpCode::LoadArrayLength, GateMeta::None, MachineType::I64, &[object], GateType::IntType)
        } else {
            self.guard(b, OpCode::TypedArrayCheck, GateMeta::TypedArray(kind), &[object, frame]);
            b.effect(OpCode::LoadTypedArrayLength, GateMeta::TypedArray(kind), MachineType::I64, &[object], GateType::IntType)
        };
        self.guard(b, OpCode::IndexCheck, GateMeta::None, &[length, index, frame]);
    }

    fn lower_load_by_value(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        let types = ElementTypeInfo::new(self.provider, info.method, info.pc);
        let Some(kind) = types.element else {
            return false;
        };
        if kind.is_bigint() || !types.int_index {
            return false;
        }
        let values = circuit.gate(gate).value_ins().to_vec();
        let (object, index) = (values[0], values[1]);

        let mut b = CircuitBuilder::before(circuit, gate);
        let frame = b.frame_state(info.method, info.pc, &values);
        self.element_guards(&mut b, kind, object, index, frame);
        let result = b.effect(
            OpCode::LoadElement,
            GateMeta::Element { kind, mode: types.mode },
            MachineType::I64,
            &[object, index],
            element_type(kind),
        );
        let (state, depend) = (b.state(), b.depend());
        splice(circuit, gate, state, depend, result);
        true
    }

    fn lower_store_by_value(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        let types = ElementTypeInfo::new(self.provider, info.method, info.pc);
        let Some(kind) = types.element else {
            return false;
        };
        if kind.is_bigint() || !types.int_index {
            return false;
        }
        let values = circuit.gate(gate).value_ins().to_vec();
        let (object, index, value) = (values[0], values[1], values[2]);

        let mut b = CircuitBuilder::before(circuit, gate);
        let frame = b.frame_state(info.method, info.pc, &values);
        self.element_guards(&mut b, kind, object, index, frame);
        if kind != ElementKind::Tagged {
            self.guard(&mut b, OpCode::PrimitiveTypeCheck, GateMeta::PrimitiveCheck(ParamType::Number), &[value, frame]);
        }
        b.effect(
            OpCode::StoreElement,
            GateMeta::Element { kind, mode: types.mode },
            MachineType::NoValue,
            &[object, index, value],
            GateType::Empty,
        );
        let (state, depend) = (b.state(), b.depend());
        splice(circuit, gate, state, depend, GateRef::NULL);
        true
    }

    fn lower_call(&mut self, circuit: &mut Circuit, gate: GateRef, info: &BytecodeInfo) -> bool {
        let Some(target) = CallTypeInfo::new(self.provider, info.method, info.pc).target else {
            return false;
        };
        let values = circuit.gate(gate).value_ins().to_vec();
        let callee = values[0];
        let builtin = target.builtin.filter(|_| self.builtin_lowering && info.argc == 1);

        let mut b = CircuitBuilder::before(circuit, gate);
        let frame = b.frame_state(info.method, info.pc, &values);
        if !self.no_check {
            let kind = if builtin.is_some() { CallTargetKind::Builtin } else { CallTargetKind::Method };
            let expected = b.method_const(target.method);
            b.effect(
                OpCode::TypedCallTargetCheck,
                GateMeta::CallTarget {
                    kind,
                    pc: info.pc,
                    hint: target.method,
                },
                MachineType::NoValue,
                &[callee, expected, frame],
                GateType::Empty,
            );
        }
        let result = match builtin {
            Some(id) => {
                let argument = values[2];
                self.guard(&mut b, OpCode::PrimitiveTypeCheck, GateMeta::PrimitiveCheck(ParamType::Number), &[argument, frame]);
                b.circuit().new_gate(
                    OpCode::BuiltinCall,
                    GateMeta::Builtin(id),
                    MachineType::I64,
                    &[],
                    &[],
                    &[argument],
                    GateType::DoubleType,
                )
            }
            None => b.effect(
                OpCode::TypedCall,
                GateMeta::Call { argc: info.argc },
                MachineType::I64,
                &values,
                GateType::AnyType,
            ),
        };
        let (state, depend) = (b.state(), b.depend());
        splice(circuit, gate, state, depend, result);
        true
    }
}

fn access_type(access: Access) -> GateType {
    match access {
        Access::Load { plr, .. } => representation_type(plr),
        Access::Getter { .. } => GateType::AnyType,
        Access::Store { .. } => GateType::Empty,
    }
}

/// `hclass` is one of `shapes`
fn shape_test(b: &mut CircuitBuilder<'_>, hclass: GateRef, shapes: &[ShapeId]) -> GateRef {
    let mut cond = GateRef::NULL;
    for shape in shapes {
        let expected = b.shape_const(*shape);
        let eq = b.icmp(IcmpCond::Eq, hclass, expected);
        cond = if cond.is_null() { eq } else { b.bool_or(cond, eq) };
    }
    cond
}
