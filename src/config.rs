//! Compiler options
//!
//! Options are plain serde structs so they can be loaded from a JSON file by
//! the driver or built in code by an embedder. Every field has a default, so a
//! partial document like `{"no_check": true}` is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Target instruction set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArch {
    X86_64,
    Aarch64,
    Arm32,
}

impl TargetArch {
    /// Native pointer width in bits
    pub fn pointer_bits(self) -> u32 {
        match self {
            TargetArch::X86_64 | TargetArch::Aarch64 => 64,
            TargetArch::Arm32 => 32,
        }
    }

    /// Parse a target triple prefix such as `aarch64-unknown-linux`
    pub fn from_triple(triple: &str) -> Option<Self> {
        let arch = triple.split('-').next().unwrap_or(triple);
        match arch {
            "x86_64" | "amd64" => Some(TargetArch::X86_64),
            "aarch64" | "arm64" => Some(TargetArch::Aarch64),
            "arm" | "armv7" | "arm32" => Some(TargetArch::Arm32),
            _ => None,
        }
    }
}

/// Target machine description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub arch: TargetArch,
    pub little_endian: bool,
}

impl TargetConfig {
    pub fn pointer_bits(&self) -> u32 {
        self.arch.pointer_bits()
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            arch: TargetArch::X86_64,
            little_endian: true,
        }
    }
}

/// How the scheduler places pure computations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePolicy {
    /// Earliest legal block; hoists loop invariants
    #[default]
    Eager,
    /// Latest legal block; keeps values next to their uses
    Lazy,
}

/// Configuration for the optimizing pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Target machine
    pub target: TargetConfig,
    /// Enable global value numbering
    pub enable_value_numbering: bool,
    /// Enable constant folding
    pub enable_constant_folding: bool,
    /// Enable loop peeling
    pub enable_loop_peeling: bool,
    /// Enable profile-guided typed lowering
    pub enable_typed_lowering: bool,
    /// Enable speculative inlining
    pub enable_inlining: bool,
    /// Lower calls to known math builtins
    pub enable_builtin_lowering: bool,
    /// Suppress deoptimization guards (trusted AOT input only)
    pub no_check: bool,
    /// Largest callee, in bytecodes, that may be inlined
    pub max_inline_bytecode_count: u32,
    /// Longest inlining chain, counting the root method
    pub max_inline_call_depth: u32,
    /// Scheduling policy
    pub schedule_policy: SchedulePolicy,
    /// Pass names whose decisions are traced, or `"all"`
    pub trace_passes: Vec<String>,
    /// Panic instead of returning an error when the verifier fails
    pub fatal_verifier: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            enable_value_numbering: true,
            enable_constant_folding: true,
            enable_loop_peeling: true,
            enable_typed_lowering: true,
            enable_inlining: true,
            enable_builtin_lowering: true,
            no_check: false,
            max_inline_bytecode_count: 25,
            max_inline_call_depth: 5,
            schedule_policy: SchedulePolicy::Eager,
            trace_passes: Vec::new(),
            fatal_verifier: cfg!(debug_assertions),
        }
    }
}

impl CompilerOptions {
    /// Options with every optimization switched off
    pub fn unoptimized() -> Self {
        Self {
            enable_value_numbering: false,
            enable_constant_folding: false,
            enable_loop_peeling: false,
            enable_typed_lowering: false,
            enable_inlining: false,
            enable_builtin_lowering: false,
            ..Self::default()
        }
    }

    /// Load options from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse options from a JSON string
    pub fn from_json(text: &str) -> Result<Self> {
        let options: CompilerOptions = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Serialize options to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject option combinations that cannot be honored
    pub fn validate(&self) -> Result<()> {
        if self.max_inline_call_depth == 0 {
            return Err(Error::config("max_inline_call_depth must be at least 1"));
        }
        if self.enable_builtin_lowering && !self.enable_typed_lowering {
            tracing::warn!("builtin lowering has no effect without typed lowering");
        }
        Ok(())
    }

    /// Whether decisions of `pass` should be traced
    pub fn trace_enabled(&self, pass: &str) -> bool {
        self.trace_passes.iter().any(|p| p == "all" || p == pass)
    }

    pub fn pointer_bits(&self) -> u32 {
        self.target.pointer_bits()
    }
}
