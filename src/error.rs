//! Error types for the Mercury compiler middle-end

use crate::circuit::GateRef;
use std::fmt;
use thiserror::Error;

/// Which compilation stage produced a verification failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Graph as handed over by the front end
    Input,
    /// After speculative inlining
    Inlining,
    /// After bytecode-level typed lowering
    TypedLowering,
    /// After loop peeling
    LoopPeeling,
    /// After mid-level lowering
    HcrLowering,
    /// After value numbering and constant folding
    Optimization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Input => write!(f, "input"),
            Stage::Inlining => write!(f, "inlining"),
            Stage::TypedLowering => write!(f, "typed-lowering"),
            Stage::LoopPeeling => write!(f, "loop-peeling"),
            Stage::HcrLowering => write!(f, "hcr-lowering"),
            Stage::Optimization => write!(f, "optimization"),
        }
    }
}

/// Main error type for Mercury
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// The verifier rejected the graph
    #[error("VerificationError: gate {gate}: {message}")]
    VerificationError { gate: GateRef, message: String },

    /// Internal compiler error (a pass misbehaved)
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Invalid compiler options
    #[error("ConfigError: {0}")]
    ConfigError(String),

    /// Malformed circuit or profile document
    #[error("FormatError: {0}")]
    FormatError(String),

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("JsonError: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a verification error for a gate
    pub fn verification(gate: GateRef, message: impl Into<String>) -> Self {
        Error::VerificationError {
            gate,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::ConfigError(message.into())
    }

    /// Create a format error
    pub fn format(message: impl Into<String>) -> Self {
        Error::FormatError(message.into())
    }

    /// Whether this error means the unit must be discarded rather than retried
    pub fn aborts_unit(&self) -> bool {
        matches!(self, Error::VerificationError { .. } | Error::InternalError(_))
    }
}

/// Result type alias for Mercury operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_error_display() {
        let err = Error::verification(GateRef::from_index(7), "dangling value input 0");
        assert_eq!(
            err.to_string(),
            "VerificationError: gate #7: dangling value input 0"
        );
        assert!(err.aborts_unit());
    }

    #[test]
    fn test_config_error_is_not_fatal_to_unit() {
        let err = Error::config("max_inline_call_depth must be positive");
        assert!(!err.aborts_unit());
        assert!(err.to_string().starts_with("ConfigError"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.json");
        let err: Error = io.into();
        assert!(matches!(err, Error::IoError { .. }));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::HcrLowering.to_string(), "hcr-lowering");
    }
}
