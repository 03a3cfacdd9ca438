//! Mercury: the optimizing middle-end of a JavaScript AOT/JIT compiler
//!
//! Mercury takes a method's bytecode as a sea-of-nodes graph (a *circuit*)
//! and turns it into a speculatively typed, lowered graph ready for code
//! generation, using type profiles collected by the interpreter or read from
//! an AOT profile file.
//!
//! # Quick Start
//!
//! ```no_run
//! use mercury::{Circuit, CompilationUnit, CompilerOptions};
//!
//! fn main() -> mercury::Result<()> {
//!     let circuit = Circuit::from_json_file("method.json")?;
//!     let output = CompilationUnit::unprofiled(circuit, CompilerOptions::default()).compile()?;
//!     println!("{}", output.schedule);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! The pipeline flows: [`circuit`] → inlining and typed lowering
//! ([`lowering`]) → loop peeling, value numbering, constant folding and
//! scheduling ([`pass`]).
//!
//! | Category | Modules |
//! |----------|---------|
//! | **IR** | [`circuit`] (gates, accessor, builder, metadata equality, JSON interchange) |
//! | **Profiles** | [`pgo`] (shapes, samples, type-info accessors) |
//! | **Passes** | [`pass`] (framework, verifier, GVN, folding, loops, scheduler, pipeline) |
//! | **Lowering** | [`lowering`] (inlining, bytecode-level and mid-level typed lowering) |
//! | **Support** | [`config`], [`error`](Error) |
#![allow(clippy::too_many_arguments)]

pub mod circuit;
pub mod config;
pub mod lowering;
pub mod pass;
pub mod pgo;

mod error;

pub use circuit::{Circuit, CircuitBuilder, CircuitInfo, GateRef};
pub use config::{CompilerOptions, SchedulePolicy};
pub use error::{Error, Result, Stage};
pub use pass::{CompilationUnit, CompileOutput, PassManager, PassStats, Schedule};
pub use pgo::{ProfileSource, ProfileTypeManager};

/// Mercury version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
