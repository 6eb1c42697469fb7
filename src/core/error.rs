// This module defines the error taxonomy of the array compiler using the thiserror crate.
// CompileError covers every fatal condition a compilation can hit: type or arity violations
// while building IR nodes, immediates or displacements that do not fit their encoding,
// register exhaustion (carrying a rendering of the whole register table), opcodes without a
// lowering, planning failures such as unbounded loop variables, and failures from the
// encoder, the object writer or the executable-memory layer. Non-fatal soundness issues are
// modelled separately as SoundnessWarning values which the compilation session collects and
// logs; they never abort a compilation. CompileResult<T> is the usual alias.

//! Error types for the array compiler.
//!
//! Every stage returns [`CompileResult`]; a failure stops the compilation
//! immediately and no partial artifact is produced.

use std::fmt;
use thiserror::Error;

use crate::x64::encoder::EncodingError;

/// Main error type for compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Type error in {op}: {reason}")]
    Type { op: &'static str, reason: String },

    #[error("Overflow: {reason}")]
    Overflow { reason: String },

    #[error("Out of registers while assigning {node}:\n{table}")]
    RegisterExhaustion { node: String, table: String },

    #[error("Unsupported operation: {op} ({reason})")]
    UnsupportedOperation { op: &'static str, reason: String },

    #[error("Planning failed: {reason}")]
    Planning { reason: String },

    #[error("Code generation failed: {reason}")]
    CodeGeneration { reason: String },

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Object file emission failed: {reason}")]
    ObjectFile { reason: String },

    #[error("Executable memory error: {reason}")]
    Memory { reason: String },
}

impl CompileError {
    pub(crate) fn type_error(op: &'static str, reason: impl Into<String>) -> Self {
        CompileError::Type {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn overflow(reason: impl Into<String>) -> Self {
        CompileError::Overflow {
            reason: reason.into(),
        }
    }

    pub(crate) fn planning(reason: impl Into<String>) -> Self {
        CompileError::Planning {
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        CompileError::UnsupportedOperation {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn codegen(reason: impl Into<String>) -> Self {
        CompileError::CodeGeneration {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Conditions that may produce slow or questionable code but do not stop
/// compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoundnessWarning {
    /// A vectorized variable whose lower bound is not a multiple of 4.
    UnalignedVectorBounds { var: String, min: i64 },
    /// Unrolling a variable whose iteration order is not `Parallel`.
    UnrollNotParallel { var: String },
    /// A vector load or store whose address alignment could not be proven.
    UnalignedVectorAccess { node: String },
    /// A load that may read what the definition stores, moved to the store's loop level.
    AliasedLoadPromoted { load: String, from: u8, to: u8 },
    /// Four lane stores could not be merged into one vector store.
    ScalarizedVectorStore { reason: String },
}

impl fmt::Display for SoundnessWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SoundnessWarning::UnalignedVectorBounds { var, min } => write!(
                f,
                "vectorizing {var} whose lower bound {min} is not provably 4-aligned"
            ),
            SoundnessWarning::UnrollNotParallel { var } => write!(
                f,
                "unrolling {var} which is not Parallel; loads and stores may be reordered"
            ),
            SoundnessWarning::UnalignedVectorAccess { node } => {
                write!(f, "emitting unaligned vector access for {node}")
            }
            SoundnessWarning::AliasedLoadPromoted { load, from, to } => write!(
                f,
                "load {load} may alias the store; promoted from level {from} to {to}"
            ),
            SoundnessWarning::ScalarizedVectorStore { reason } => {
                write!(f, "vector store split into scalar lanes: {reason}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CompileError::type_error("Load", "address must be a scalar Int");
        assert_eq!(
            err.to_string(),
            "Type error in Load: address must be a scalar Int"
        );

        let err = CompileError::RegisterExhaustion {
            node: "#4 Plus".to_string(),
            table: "rax: #1".to_string(),
        };
        assert!(err.to_string().contains("rax: #1"));
    }

    #[test]
    fn test_encoding_error_converts() {
        let err: CompileError = EncodingError::InvalidRegister.into();
        assert!(matches!(err, CompileError::Encoding(_)));
    }

    #[test]
    fn test_warning_display() {
        let warning = SoundnessWarning::AliasedLoadPromoted {
            load: "#7".to_string(),
            from: 1,
            to: 2,
        };
        assert!(warning.to_string().contains("level 1 to 2"));
    }
}
