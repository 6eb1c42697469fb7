// This module gathers the infrastructure shared by every compiler stage: the error taxonomy
// and soundness warnings, interval and congruence analysis, the arena-backed compilation
// session with its statistics, compiler options, and register identifiers with bit sets.
// None of it knows about the IR node model; the IR, planner, allocator and backend all
// build on these pieces.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - [`CompileError`] for fatal conditions, [`SoundnessWarning`] for non-fatal ones
//!
//! ## Interval Analysis (`interval`)
//! - Overflow-checked integer intervals and congruence classes
//!
//! ## Session Management (`session`)
//! - Arena allocation using `bumpalo`, statistics, collected warnings
//!
//! ## Registers (`register_file`)
//! - Bank/index register names and per-bank bit sets

pub mod config;
pub mod error;
pub mod interval;
pub mod register_file;
pub mod session;

pub use config::{Abi, CompilerOptions, ObjectFormat};
pub use error::{CompileError, CompileResult, SoundnessWarning};
pub use interval::{Interval, SteppedInterval};
pub use register_file::{AsmReg, RegBitSet, RegClass};
pub use session::{CompilationSession, SessionStats};
