//! Shared test helpers for integration tests

use mercury::circuit::{BytecodeInfo, BytecodeOp, EdgeKind, GateMeta, GateType, IcmpCond, MachineType, OpCode};
use mercury::pgo::{ElementKind, MethodId};
use mercury::{Circuit, CircuitBuilder, CircuitInfo, CompilerOptions, GateRef};

/// Default options that report verifier failures as errors
pub fn options() -> CompilerOptions {
    CompilerOptions {
        fatal_verifier: false,
        ..CompilerOptions::default()
    }
}

/// An empty circuit for `method`
pub fn circuit(name: &str, method: MethodId) -> Circuit {
    Circuit::new(CircuitInfo::new(name, method))
}

/// `count` identical additions of the same two parameters; the first one is
/// returned
pub fn duplicated_adds(count: usize) -> (Circuit, GateRef) {
    let mut circuit = circuit("adds", MethodId(0));
    let mut b = CircuitBuilder::new(&mut circuit);
    let x = b.arg(2, GateType::NJSValue);
    let y = b.arg(3, GateType::NJSValue);
    let first = b.int_add(MachineType::I64, x, y);
    for _ in 1..count {
        b.int_add(MachineType::I64, x, y);
    }
    b.ret(first);
    (circuit, first)
}

/// A method made of a single generic binary bytecode on its two parameters
#[allow(dead_code)]
pub fn binary_method(method: MethodId, op: BytecodeOp) -> Circuit {
    let mut circuit = circuit("binary", method);
    let mut b = CircuitBuilder::new(&mut circuit);
    let x = b.arg(2, GateType::AnyType);
    let y = b.arg(3, GateType::AnyType);
    let result = b.bytecode(BytecodeInfo::new(method, 0, op), &[x, y]);
    b.ret(result);
    circuit
}

/// `for (i = 0; i < arr.length; i++) {} return i` over a typed array, with
/// the check and length load inside the loop
#[allow(dead_code)]
pub fn typed_array_loop() -> (Circuit, GateRef) {
    let mut circuit = circuit("loop", MethodId(0));
    let mut b = CircuitBuilder::new(&mut circuit);
    let arr = b.arg(2, GateType::TaggedPointer);
    let zero = b.tagged_int(0);
    let one = b.int64(1);
    let header = b.loop_begin();
    let i = b.loop_phi(header, MachineType::I64, GateType::IntType, zero);
    let dphi = b.loop_depend_phi(header);
    let frame = b.frame_state(MethodId(0), 4, &[arr]);
    b.effect(
        OpCode::TypedArrayCheck,
        GateMeta::TypedArray(ElementKind::Float64),
        MachineType::NoValue,
        &[arr, frame],
        GateType::Empty,
    );
    let length = b.effect(
        OpCode::LoadTypedArrayLength,
        GateMeta::TypedArray(ElementKind::Float64),
        MachineType::I64,
        &[arr],
        GateType::IntType,
    );
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
    (circuit, header)
}

/// Live gates of `op`
pub fn count(circuit: &Circuit, op: OpCode) -> usize {
    circuit.gates_with_op(op).len()
}
