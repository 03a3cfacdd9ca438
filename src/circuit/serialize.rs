//! JSON interchange format for circuits
//!
//! The front end hands graphs over as a flat list of gate records. Gate ids in
//! a document are arbitrary but unique; the three roots are identified by
//! opcode, must appear at most once and take no inputs. Loading validates every record against its opcode signature and
//! reports malformed documents as [`Error::FormatError`] instead of panicking.

use super::meta::GateMeta;
use super::opcode::OpCode;
use super::types::{GateType, MachineType};
use super::{Circuit, CircuitInfo, EdgeKind, GateRef};
use crate::error::{Error, Result};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One gate in a circuit document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub id: u32,
    pub op: OpCode,
    #[serde(default)]
    pub meta: GateMeta,
    #[serde(default = "no_value")]
    pub machine_type: MachineType,
    #[serde(default)]
    pub gate_type: GateType,
    #[serde(default)]
    pub state_ins: Vec<u32>,
    #[serde(default)]
    pub depend_ins: Vec<u32>,
    #[serde(default)]
    pub value_ins: Vec<u32>,
}

fn no_value() -> MachineType {
    MachineType::NoValue
}

/// Serialized form of a whole circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitDocument {
    pub info: CircuitInfo,
    pub gates: Vec<GateRecord>,
}

impl Circuit {
    /// Snapshot the live gates of this circuit
    pub fn to_document(&self) -> CircuitDocument {
        let ids = |ins: &[GateRef]| ins.iter().map(|g| g.index() as u32).collect();
        let gates = self
            .live_gates()
            .map(|gate| {
                let g = self.gate(gate);
                GateRecord {
                    id: gate.index() as u32,
                    op: g.op(),
                    meta: g.meta().clone(),
                    machine_type: g.machine_type(),
                    gate_type: g.gate_type(),
                    state_ins: ids(g.state_ins()),
                    depend_ins: ids(g.depend_ins()),
                    value_ins: ids(g.value_ins()),
                }
            })
            .collect();
        CircuitDocument {
            info: self.info().clone(),
            gates,
        }
    }

    /// Rebuild a circuit from a document
    pub fn from_document(doc: &CircuitDocument) -> Result<Circuit> {
        let mut circuit = Circuit::new(doc.info.clone());
        let mut map: HashMap<u32, GateRef> = HashMap::default();

        // Allocate every gate with placeholder inputs first so that edges may
        // point forward (loop back edges do).
        for record in &doc.gates {
            if map.contains_key(&record.id) {
                return Err(Error::format(format!("duplicate gate id {}", record.id)));
            }
            if matches!(record.op, OpCode::StateEntry | OpCode::DependEntry | OpCode::ArgList) {
                if !(record.state_ins.is_empty() && record.depend_ins.is_empty() && record.value_ins.is_empty()) {
                    return Err(Error::format(format!("root gate {} ({}) has inputs", record.id, record.op)));
                }
                if doc.gates.iter().filter(|other| other.op == record.op).count() > 1 {
                    return Err(Error::format(format!("{} appears more than once", record.op)));
                }
            }
            let gate = match record.op {
                OpCode::StateEntry => circuit.state_entry(),
                OpCode::DependEntry => circuit.depend_entry(),
                OpCode::ArgList => circuit.arg_list(),
                OpCode::Nop => return Err(Error::format(format!("gate {} is a Nop", record.id))),
                op => {
                    let signature = op.signature(&record.meta);
                    let (s, d, v) = (record.state_ins.len(), record.depend_ins.len(), record.value_ins.len());
                    if !signature.accepts(s, d, v) {
                        return Err(Error::format(format!(
                            "gate {} ({}) expects {}, got state={} depend={} value={}",
                            record.id, op, signature, s, d, v
                        )));
                    }
                    circuit.new_gate(
                        op,
                        record.meta.clone(),
                        record.machine_type,
                        &vec![GateRef::NULL; s],
                        &vec![GateRef::NULL; d],
                        &vec![GateRef::NULL; v],
                        record.gate_type,
                    )
                }
            };
            map.insert(record.id, gate);
        }

        for record in &doc.gates {
            let gate = map[&record.id];
            for (kind, ins) in [
                (EdgeKind::State, &record.state_ins),
                (EdgeKind::Depend, &record.depend_ins),
                (EdgeKind::Value, &record.value_ins),
            ] {
                for (index, id) in ins.iter().enumerate() {
                    let input = map.get(id).copied().ok_or_else(|| {
                        Error::format(format!("gate {} refers to unknown gate {}", record.id, id))
                    })?;
                    circuit.set_input(gate, kind, index, input);
                }
            }
        }
        Ok(circuit)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    pub fn from_json(text: &str) -> Result<Circuit> {
        let doc: CircuitDocument = serde_json::from_str(text)?;
        Circuit::from_document(&doc)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Circuit> {
        let text = std::fs::read_to_string(path)?;
        Circuit::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::builder::CircuitBuilder;
    use crate::pgo::MethodId;

    #[test]
    fn test_document_preserves_structure() {
        let mut circuit = Circuit::new(CircuitInfo::new("doc", MethodId(4)));
        let mut builder = CircuitBuilder::new(&mut circuit);
        let a = builder.int32(20);
        let b = builder.int32(22);
        let sum = builder.int_add(MachineType::I32, a, b);
        builder.ret(sum);

        let restored = Circuit::from_json(&circuit.to_json().unwrap()).unwrap();
        assert_eq!(restored.info().method, MethodId(4));
        assert_eq!(restored.live_count(), circuit.live_count());
        let ret = restored.gates_with_op(OpCode::Return)[0];
        let acc = restored.acc();
        let add = acc.value_in(ret, 0);
        assert_eq!(acc.opcode(add), OpCode::Add);
        assert_eq!(acc.constant_value(acc.value_in(add, 1)), Some(22));
        assert_eq!(acc.state_in(ret, 0), restored.state_entry());
    }

    #[test]
    fn test_forward_references() {
        let text = r#"{
            "info": {"name": "loop", "method": 0, "bytecode_count": 1, "param_count": 0},
            "gates": [
                {"id": 0, "op": "StateEntry"},
                {"id": 1, "op": "DependEntry"},
                {"id": 2, "op": "ArgList"},
                {"id": 10, "op": "LoopBegin", "state_ins": [0, 11]},
                {"id": 11, "op": "LoopBack", "state_ins": [10]}
            ]
        }"#;
        let circuit = Circuit::from_json(text).unwrap();
        let header = circuit.gates_with_op(OpCode::LoopBegin)[0];
        let back = circuit.gates_with_op(OpCode::LoopBack)[0];
        assert_eq!(circuit.acc().state_in(header, 1), back);
    }

    #[test]
    fn test_bad_arity_is_format_error() {
        let text = r#"{
            "info": {"name": "bad", "method": 0, "bytecode_count": 0, "param_count": 0},
            "gates": [
                {"id": 0, "op": "StateEntry"},
                {"id": 5, "op": "Add", "machine_type": "I32", "value_ins": [0]}
            ]
        }"#;
        assert!(matches!(Circuit::from_json(text), Err(Error::FormatError(_))));
    }

    #[test]
    fn test_root_with_inputs_is_format_error() {
        let text = r#"{
            "info": {"name": "bad", "method": 0, "bytecode_count": 0, "param_count": 0},
            "gates": [
                {"id": 0, "op": "StateEntry", "state_ins": [0]},
                {"id": 1, "op": "DependEntry", "value_ins": [0]}
            ]
        }"#;
        let err = Circuit::from_json(text).unwrap_err();
        assert!(matches!(err, Error::FormatError(_)));
        assert!(err.to_string().contains("has inputs"));
    }

    #[test]
    fn test_repeated_root_is_format_error() {
        let text = r#"{
            "info": {"name": "bad", "method": 0, "bytecode_count": 0, "param_count": 0},
            "gates": [
                {"id": 0, "op": "StateEntry"},
                {"id": 1, "op": "StateEntry"},
                {"id": 2, "op": "LoopBack", "state_ins": [1]}
            ]
        }"#;
        let err = Circuit::from_json(text).unwrap_err();
        assert!(matches!(err, Error::FormatError(_)));
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_unknown_input_is_format_error() {
        let text = r#"{
            "info": {"name": "bad", "method": 0, "bytecode_count": 0, "param_count": 0},
            "gates": [
                {"id": 0, "op": "StateEntry"},
                {"id": 5, "op": "LoopBack", "state_ins": [99]}
            ]
        }"#;
        let err = Circuit::from_json(text).unwrap_err();
        assert!(err.to_string().contains("unknown gate 99"));
    }
}
