//! Tests for the compilation pipeline: options, interchange formats and
//! concurrent compilation

mod common;

use common::{binary_method, count, duplicated_adds, options};
use mercury::circuit::{BytecodeOp, GateType, MachineType, OpCode};
use mercury::pass::Verifier;
use mercury::pgo::{
    MethodId, PgoSample, PrimitiveSample, ProfileDocument, PropertyLookupResult, SampleRecord, ShapeKind, ShapeRecord,
    ShapeTriple, ShapeId,
};
use mercury::{
    Circuit, CircuitBuilder, CompilationUnit, CompilerOptions, Error, GateRef, ProfileSource, ProfileTypeManager,
    SchedulePolicy,
};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

#[test]
fn test_options_round_trip_through_file() {
    let original = CompilerOptions {
        enable_loop_peeling: false,
        max_inline_bytecode_count: 40,
        schedule_policy: SchedulePolicy::Lazy,
        trace_passes: vec!["typed-lowering".to_string()],
        ..options()
    };
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(original.to_json().unwrap().as_bytes()).unwrap();

    let loaded = CompilerOptions::from_json_file(file.path()).unwrap();
    assert_eq!(loaded, original);
    assert!(loaded.trace_enabled("typed-lowering"));
    assert!(!loaded.trace_enabled("inline"));
}

#[test]
fn test_partial_options_use_defaults() {
    let loaded = CompilerOptions::from_json(r#"{ "no_check": true, "schedule_policy": "lazy" }"#).unwrap();
    assert!(loaded.no_check);
    assert_eq!(loaded.schedule_policy, SchedulePolicy::Lazy);
    assert_eq!(loaded.max_inline_call_depth, CompilerOptions::default().max_inline_call_depth);
}

#[test]
fn test_invalid_options_file() {
    assert!(matches!(
        CompilerOptions::from_json(r#"{ "max_inline_call_depth": 0 }"#),
        Err(Error::ConfigError(_))
    ));
    assert!(matches!(
        CompilerOptions::from_json("{ not json"),
        Err(Error::JsonError { .. })
    ));
    assert!(matches!(
        CompilerOptions::from_json_file("/nonexistent/mercury.json"),
        Err(Error::IoError { .. })
    ));
}

#[test]
fn test_circuit_round_trip_through_file() {
    let (circuit, _) = duplicated_adds(8);
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(circuit.to_json().unwrap().as_bytes()).unwrap();

    let loaded = Circuit::from_json_file(file.path()).unwrap();
    assert_eq!(loaded.live_count(), circuit.live_count());
    assert_eq!(loaded.dump_all(), circuit.dump_all());
    Verifier::new(&options()).verify(&loaded).unwrap();
}

#[test]
fn test_optimized_circuit_round_trips() {
    let manager = Arc::new(ProfileTypeManager::new());
    manager.record_sample(MethodId(0), 0, PgoSample::primitive(PrimitiveSample::Double));
    let out = CompilationUnit::new(binary_method(MethodId(0), BytecodeOp::Add2), ProfileSource::offline(manager), options())
        .compile()
        .unwrap();
    let loaded = Circuit::from_json(&out.circuit.to_json().unwrap()).unwrap();
    assert_eq!(loaded.live_count(), out.circuit.live_count());
    assert_eq!(count(&loaded, OpCode::DeoptCheck), count(&out.circuit, OpCode::DeoptCheck));
}

#[test]
fn test_malformed_circuit_is_rejected() {
    assert!(Circuit::from_json("[1, 2, 3]").is_err());
}

#[test]
fn test_verifier_rejects_dangling_input() {
    let mut circuit = common::circuit("broken", MethodId(0));
    let mut b = CircuitBuilder::new(&mut circuit);
    let x = b.arg(2, GateType::NJSValue);
    let sum = b.int_add(MachineType::I64, x, GateRef::NULL);
    b.ret(sum);

    let err = Verifier::new(&options()).verify(&circuit).unwrap_err();
    assert!(matches!(err, Error::VerificationError { gate, .. } if gate == sum));
    assert!(CompilationUnit::unprofiled(circuit, options()).compile().is_err());
}

#[test]
fn test_profile_document_from_file() {
    let doc = ProfileDocument {
        shapes: vec![ShapeRecord {
            kind: ShapeKind::Object,
            prototype: None,
            properties: vec![("x".to_string(), PropertyLookupResult::in_object(0))],
            out_of_object_capacity: 0,
            transitions: Vec::new(),
        }],
        samples: vec![
            SampleRecord {
                method: MethodId(3),
                pc: 0,
                sample: PgoSample::shapes(vec![ShapeTriple::own(ShapeId(0))]),
            },
            SampleRecord {
                method: MethodId(3),
                pc: 4,
                sample: PgoSample::primitive(PrimitiveSample::Int),
            },
        ],
    };
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(&doc).unwrap().as_bytes()).unwrap();

    let manager = ProfileTypeManager::new();
    manager.register_shape(ShapeKind::Object);
    manager.load_json_file(file.path()).unwrap();
    // document shape ids are shifted past the existing shape
    let sample = manager.sample(MethodId(3), 0).unwrap();
    assert_eq!(sample.entries, vec![ShapeTriple::own(ShapeId(1))]);
    assert_eq!(manager.sample(MethodId(3), 4).unwrap().primitive, Some(PrimitiveSample::Int));
}

#[test]
fn test_concurrent_compilations() {
    let manager = Arc::new(ProfileTypeManager::new());
    for method in 0..8 {
        manager.record_sample(MethodId(method), 0, PgoSample::primitive(PrimitiveSample::Int));
    }

    let handles: Vec<_> = (0..8)
        .map(|method| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let circuit = binary_method(MethodId(method), BytecodeOp::Add2);
                CompilationUnit::new(circuit, ProfileSource::offline(manager), options()).compile()
            })
        })
        .collect();

    for handle in handles {
        let out = handle.join().unwrap().unwrap();
        assert_eq!(out.stats.get("typed-lowering.speculated"), 1);
        assert_eq!(count(&out.circuit, OpCode::JsBytecode), 0);
    }
}

#[test]
fn test_unoptimized_options_only_schedule() {
    let (circuit, _) = duplicated_adds(4);
    let live = circuit.live_count();
    let out = CompilationUnit::unprofiled(circuit, CompilerOptions::unoptimized()).compile().unwrap();
    assert_eq!(out.circuit.live_count(), live);
    assert_eq!(count(&out.circuit, OpCode::Add), 4);
    assert_eq!(out.schedule.assigned(), live);
}
