//! Pass pipeline
//!
//! Order of a compilation:
//!
//! 1. verify the input graph
//! 2. speculative inlining
//! 3. bytecode-level typed lowering
//! 4. loop peeling
//! 5. value numbering, which also drops repeated typed checks
//! 6. mid-level lowering
//! 7. value numbering and constant folding to a fixpoint
//! 8. scheduling
//!
//! The graph is verified after every stage that ran. Disabled stages are
//! skipped; scheduling always runs.

use super::{ConstantFolding, GraphVisitor, LoopPeeling, PassStats, PassVisitor, Schedule, Scheduler, ValueNumbering, Verifier};
use crate::circuit::Circuit;
use crate::config::CompilerOptions;
use crate::error::{Result, Stage};
use crate::lowering::{MethodRegistry, SpeculativeInliner, TypedBytecodeLowering, TypedHcrLowering};
use crate::pgo::{ProfileProvider, ProfileSource, ProfileTypeManager};
use std::sync::Arc;
use std::time::Instant;

/// Runs the configured passes over one circuit
pub struct PassManager {
    options: CompilerOptions,
    verifier: Verifier,
}

impl PassManager {
    pub fn new(options: &CompilerOptions) -> Self {
        Self {
            options: options.clone(),
            verifier: Verifier::new(options),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Optimize `circuit` in place and schedule it
    pub fn run<P: ProfileProvider>(
        &self,
        circuit: &mut Circuit,
        provider: &P,
        registry: Option<&MethodRegistry>,
    ) -> Result<(Schedule, PassStats)> {
        let options = &self.options;
        let mut stats = PassStats::new();
        let start = Instant::now();
        self.verifier.run(circuit, Stage::Input)?;

        if options.enable_inlining {
            if let Some(registry) = registry.filter(|r| !r.is_empty()) {
                let mut inliner = SpeculativeInliner::new(provider, registry, options);
                stats.merge(&inliner.run(circuit));
                self.verifier.run(circuit, Stage::Inlining)?;
            }
        }

        if options.enable_typed_lowering {
            let mut lowering = TypedBytecodeLowering::new(provider, options);
            stats.merge(&lowering.run(circuit));
            self.verifier.run(circuit, Stage::TypedLowering)?;
        }

        if options.enable_loop_peeling {
            stats.merge(&LoopPeeling::new(options).run(circuit));
            self.verifier.run(circuit, Stage::LoopPeeling)?;
        }

        if options.enable_value_numbering && options.enable_typed_lowering {
            let mut value_numbering = ValueNumbering::new(options);
            stats.merge(GraphVisitor::new().run(circuit, &mut [&mut value_numbering])?);
            self.verifier.run(circuit, Stage::Optimization)?;
        }

        if options.enable_typed_lowering {
            let mut hcr = TypedHcrLowering::new(options);
            stats.merge(GraphVisitor::new().run(circuit, &mut [&mut hcr])?);
            self.verifier.run(circuit, Stage::HcrLowering)?;
        }

        let mut value_numbering = ValueNumbering::new(options);
        let mut folding = ConstantFolding::new(options);
        let mut passes: Vec<&mut dyn PassVisitor> = Vec::new();
        if options.enable_value_numbering {
            passes.push(&mut value_numbering);
        }
        if options.enable_constant_folding {
            passes.push(&mut folding);
        }
        if !passes.is_empty() {
            stats.merge(GraphVisitor::new().run(circuit, &mut passes)?);
            self.verifier.run(circuit, Stage::Optimization)?;
        }

        let schedule = Scheduler::new(options).run(circuit)?;
        tracing::info!(
            circuit = %circuit.info().name,
            gates = circuit.live_count(),
            blocks = schedule.blocks.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "compiled"
        );
        Ok((schedule, stats))
    }
}

/// Everything one compilation needs; units are independent and may be
/// compiled on separate threads
pub struct CompilationUnit {
    pub circuit: Circuit,
    pub profile: ProfileSource,
    pub registry: Option<Arc<MethodRegistry>>,
    pub options: CompilerOptions,
}

/// Result of [`CompilationUnit::compile`]
#[derive(Debug)]
pub struct CompileOutput {
    pub circuit: Circuit,
    pub schedule: Schedule,
    pub stats: PassStats,
}

impl CompilationUnit {
    pub fn new(circuit: Circuit, profile: ProfileSource, options: CompilerOptions) -> Self {
        Self {
            circuit,
            profile,
            registry: None,
            options,
        }
    }

    /// A unit without profile data; typed lowering keeps every bytecode
    /// generic
    pub fn unprofiled(circuit: Circuit, options: CompilerOptions) -> Self {
        Self::new(circuit, ProfileSource::offline(Arc::new(ProfileTypeManager::new())), options)
    }

    pub fn with_registry(mut self, registry: Arc<MethodRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn compile(self) -> Result<CompileOutput> {
        let CompilationUnit {
            mut circuit,
            profile,
            registry,
            options,
        } = self;
        options.validate()?;
        let manager = PassManager::new(&options);
        let registry = registry.as_deref();
        let (schedule, stats) = match &profile {
            ProfileSource::Offline(provider) => manager.run(&mut circuit, provider, registry)?,
            ProfileSource::LiveHeap(provider) => manager.run(&mut circuit, provider, registry)?,
        };
        Ok(CompileOutput { circuit, schedule, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BytecodeInfo, BytecodeOp, CircuitBuilder, CircuitInfo, GateType, OpCode};
    use crate::pgo::{MethodId, PgoSample, PrimitiveSample};

    fn options() -> CompilerOptions {
        CompilerOptions {
            fatal_verifier: false,
            ..CompilerOptions::default()
        }
    }

    fn add_method() -> Circuit {
        let mut circuit = Circuit::new(CircuitInfo::new("add", MethodId(0)));
        let mut b = CircuitBuilder::new(&mut circuit);
        let x = b.arg(2, GateType::AnyType);
        let y = b.arg(3, GateType::AnyType);
        let sum = b.bytecode(BytecodeInfo::new(MethodId(0), 0, BytecodeOp::Add2), &[x, y]);
        b.ret(sum);
        circuit
    }

    #[test]
    fn test_profiled_add_is_fully_lowered() {
        let manager = Arc::new(ProfileTypeManager::new());
        manager.record_sample(MethodId(0), 0, PgoSample::primitive(PrimitiveSample::Int));
        let unit = CompilationUnit::new(add_method(), ProfileSource::offline(manager), options());
        let output = unit.compile().unwrap();

        assert_eq!(output.stats.get("typed-lowering.speculated"), 1);
        assert!(output.stats.get("hcr-lowering.lowered") >= 3);
        for op in [OpCode::JsBytecode, OpCode::PrimitiveTypeCheck, OpCode::TypedBinaryOp] {
            assert!(output.circuit.gates_with_op(op).is_empty(), "{} left", op);
        }
        assert_eq!(output.circuit.gates_with_op(OpCode::DeoptCheck).len(), 3);
        assert!(output.schedule.assigned() > 0);
    }

    #[test]
    fn test_unprofiled_unit_stays_generic() {
        let output = CompilationUnit::unprofiled(add_method(), options()).compile().unwrap();
        assert_eq!(output.stats.get("typed-lowering.generic"), 1);
        assert_eq!(output.circuit.gates_with_op(OpCode::JsBytecode).len(), 1);
    }

    #[test]
    fn test_repeated_call_is_guarded_once() {
        // function twice(f) { f(); return f() }
        let manager = Arc::new(ProfileTypeManager::new());
        manager.record_sample(MethodId(0), 0, PgoSample::call(MethodId(5)));
        manager.record_sample(MethodId(0), 6, PgoSample::call(MethodId(5)));
        let mut circuit = Circuit::new(CircuitInfo::new("twice", MethodId(0)));
        let mut b = CircuitBuilder::new(&mut circuit);
        let f = b.arg(2, GateType::AnyType);
        let undefined = b.undefined();
        b.bytecode(BytecodeInfo::call(MethodId(0), 0, 0), &[f, undefined]);
        let second = b.bytecode(BytecodeInfo::call(MethodId(0), 6, 0), &[f, undefined]);
        b.ret(second);

        let output = CompilationUnit::new(circuit, ProfileSource::offline(manager), options()).compile().unwrap();
        assert_eq!(output.stats.get("value-numbering.checks-removed"), 1);
        assert_eq!(output.circuit.gates_with_op(OpCode::TypedCall).len(), 2);
        // one heap-object test and one method compare
        assert_eq!(output.circuit.gates_with_op(OpCode::DeoptCheck).len(), 2);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let options = CompilerOptions {
            max_inline_call_depth: 0,
            ..options()
        };
        assert!(CompilationUnit::unprofiled(add_method(), options).compile().is_err());
    }
}
