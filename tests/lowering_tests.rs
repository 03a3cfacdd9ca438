//! End-to-end tests of profile-guided lowering through the full pipeline

mod common;

use common::{binary_method, count, options};
use mercury::circuit::layout;
use mercury::circuit::{BytecodeInfo, BytecodeOp, DeoptReason, GateMeta, GateType, OpCode};
use mercury::lowering::MethodRegistry;
use mercury::pgo::{
    IcEntry, LiveHeapProvider, MethodId, PgoSample, PrimitiveSample, PropertyLookupResult, ShapeKind, ShapeTriple,
};
use mercury::{Circuit, CircuitBuilder, CompilationUnit, CompilerOptions, ProfileSource, ProfileTypeManager};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const CALLER: MethodId = MethodId(1);
const CALLEE: MethodId = MethodId(2);

fn deopt_reasons(circuit: &Circuit) -> Vec<DeoptReason> {
    circuit
        .gates_with_op(OpCode::DeoptCheck)
        .into_iter()
        .filter_map(|g| match circuit.acc().meta(g) {
            GateMeta::Deopt(reason) => Some(*reason),
            _ => None,
        })
        .collect()
}

fn load_offsets(circuit: &Circuit) -> Vec<u64> {
    circuit
        .gates_with_op(OpCode::Load)
        .into_iter()
        .filter_map(|l| circuit.acc().constant_value(circuit.acc().value_in(l, 1)))
        .collect()
}

/// `function get(o) { return o.x }`
fn property_load(method: MethodId) -> Circuit {
    let mut circuit = common::circuit("get", method);
    let mut b = CircuitBuilder::new(&mut circuit);
    let object = b.arg(2, GateType::AnyType);
    let value = b.bytecode(BytecodeInfo::named(method, 0, BytecodeOp::LdObjByName, "x"), &[object]);
    b.ret(value);
    circuit
}

#[test]
fn test_int_arithmetic_is_lowered_to_machine_ops() {
    let manager = Arc::new(ProfileTypeManager::new());
    manager.record_sample(MethodId(0), 0, PgoSample::primitive(PrimitiveSample::Int));
    let unit = CompilationUnit::new(binary_method(MethodId(0), BytecodeOp::Mul2), ProfileSource::offline(manager), options());
    let out = unit.compile().unwrap();

    assert_eq!(count(&out.circuit, OpCode::JsBytecode), 0);
    assert_eq!(count(&out.circuit, OpCode::TypedBinaryOp), 0);
    let reasons = deopt_reasons(&out.circuit);
    assert_eq!(reasons.iter().filter(|r| **r == DeoptReason::NotInt).count(), 2);
    assert!(reasons.contains(&DeoptReason::Overflow));
    assert!(reasons.contains(&DeoptReason::MinusZero));
    assert_eq!(count(&out.circuit, OpCode::Mul), 1);
}

#[test]
fn test_double_arithmetic_without_checks() {
    let manager = Arc::new(ProfileTypeManager::new());
    manager.record_sample(MethodId(0), 0, PgoSample::primitive(PrimitiveSample::Double));
    let options = CompilerOptions {
        no_check: true,
        ..options()
    };
    let unit = CompilationUnit::new(binary_method(MethodId(0), BytecodeOp::Sub2), ProfileSource::offline(manager), options);
    let out = unit.compile().unwrap();

    assert_eq!(count(&out.circuit, OpCode::DeoptCheck), 0);
    assert_eq!(count(&out.circuit, OpCode::Fsub), 1);
}

#[test]
fn test_live_heap_property_load() {
    let manager = Arc::new(ProfileTypeManager::new());
    let point = manager.register_shape(ShapeKind::Object);
    let mut provider = LiveHeapProvider::new(Arc::clone(&manager));
    provider.add_cache(
        MethodId(0),
        0,
        vec![IcEntry {
            shapes: ShapeTriple::own(point),
            handler: PropertyLookupResult::in_object(1),
        }],
    );
    let unit = CompilationUnit::new(property_load(MethodId(0)), ProfileSource::live(provider), options());
    let out = unit.compile().unwrap();

    assert_eq!(out.stats.get("typed-lowering.speculated"), 1);
    assert_eq!(count(&out.circuit, OpCode::LoadProperty), 0);
    assert!(load_offsets(&out.circuit).contains(&layout::in_object_offset(1)));
    let reasons = deopt_reasons(&out.circuit);
    assert!(reasons.contains(&DeoptReason::WrongShape));
}

#[test]
fn test_offline_and_live_providers_agree() {
    let manager = Arc::new(ProfileTypeManager::new());
    let point = manager.register_shape(ShapeKind::Object);
    manager.add_property(point, "x", PropertyLookupResult::in_object(1)).unwrap();
    manager.record_sample(MethodId(0), 0, PgoSample::shapes(vec![ShapeTriple::own(point)]));
    let mut live = LiveHeapProvider::new(Arc::clone(&manager));
    live.add_cache(
        MethodId(0),
        0,
        vec![IcEntry {
            shapes: ShapeTriple::own(point),
            handler: PropertyLookupResult::in_object(1),
        }],
    );

    let offline = CompilationUnit::new(property_load(MethodId(0)), ProfileSource::offline(manager), options())
        .compile()
        .unwrap();
    let live = CompilationUnit::new(property_load(MethodId(0)), ProfileSource::live(live), options())
        .compile()
        .unwrap();
    assert_eq!(offline.circuit.live_count(), live.circuit.live_count());
    assert_eq!(load_offsets(&offline.circuit), load_offsets(&live.circuit));
}

#[test]
fn test_inlined_callee_is_lowered_with_its_own_profile() {
    let manager = Arc::new(ProfileTypeManager::new());
    manager.record_sample(CALLER, 0, PgoSample::call(CALLEE));
    manager.record_sample(CALLEE, 0, PgoSample::primitive(PrimitiveSample::Int));

    let mut registry = MethodRegistry::new();
    registry.register(binary_method(CALLEE, BytecodeOp::Add2));

    // function caller(f, a, b) { return f(a, b) }
    let mut caller = common::circuit("caller", CALLER);
    let mut b = CircuitBuilder::new(&mut caller);
    let f = b.arg(2, GateType::AnyType);
    let x = b.arg(3, GateType::AnyType);
    let y = b.arg(4, GateType::AnyType);
    let undefined = b.undefined();
    let call = b.bytecode(BytecodeInfo::call(CALLER, 0, 2), &[f, undefined, x, y]);
    b.ret(call);

    let out = CompilationUnit::new(caller, ProfileSource::offline(manager), options())
        .with_registry(Arc::new(registry))
        .compile()
        .unwrap();
    assert_eq!(out.stats.get("inline.inlined"), 1);
    assert_eq!(out.stats.get("typed-lowering.speculated"), 1);
    assert_eq!(count(&out.circuit, OpCode::JsBytecode), 0);
    assert!(deopt_reasons(&out.circuit).contains(&DeoptReason::WrongCallTarget));
}

#[test]
fn test_inlining_disabled_keeps_call() {
    let manager = Arc::new(ProfileTypeManager::new());
    manager.record_sample(CALLER, 0, PgoSample::call(CALLEE));
    let mut registry = MethodRegistry::new();
    registry.register(binary_method(CALLEE, BytecodeOp::Add2));

    let mut caller = common::circuit("caller", CALLER);
    let mut b = CircuitBuilder::new(&mut caller);
    let f = b.arg(2, GateType::AnyType);
    let undefined = b.undefined();
    let call = b.bytecode(BytecodeInfo::call(CALLER, 0, 0), &[f, undefined]);
    b.ret(call);

    let options = CompilerOptions {
        enable_inlining: false,
        ..options()
    };
    let out = CompilationUnit::new(caller, ProfileSource::offline(manager), options)
        .with_registry(Arc::new(registry))
        .compile()
        .unwrap();
    assert_eq!(out.stats.get("inline.inlined"), 0);
    assert_eq!(count(&out.circuit, OpCode::TypedCall), 1);
}
