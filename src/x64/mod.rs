//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Register conventions for System V and Win64
//! - A byte buffer with labels and fixups
//! - Instruction encoding using iced-x86
//! - Kernel code generation
//! - Object file writing and executable memory

pub mod assembler;
pub mod calling_convention;
pub mod codegen;
pub mod encoder;
pub mod memory;
pub mod object;

pub use assembler::{CodeBuffer, Label};
pub use calling_convention::{CallingConvention, FrameLayout};
pub use codegen::generate;
pub use encoder::{EncodingError, X64Encoder};
pub use memory::ExecutableBuffer;
pub use self::object::write_object;
