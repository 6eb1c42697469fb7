//! arrayjit - a JIT compiler for array and image expressions.
//!
//! Definitions such as `image(x, y) = image(x, y) * 2` are built as a
//! hash-consed expression DAG, planned into a loop nest (optionally
//! vectorized to four lanes and unrolled), register-allocated without
//! spilling and lowered to x86-64 machine code that runs in place or is
//! written out as an object file.
//!
//! # Primary Usage
//!
//! ```ignore
//! use arrayjit::{Compiler, CompilerOptions, CompilationSession, ImageBuffer, IrBuilder, Type};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut b = IrBuilder::new();
//! let x = b.variable("x", 0, 3);
//! let y = b.variable("y", 0, 3);
//! let c = b.int(0);
//! let image = ImageBuffer::new(pixels.as_ptr() as i64, 4, 4);
//! let value = image.load(&mut b, Type::Int, x, y, c)?;
//! let doubled = b.make(Op::TimesImm, &[value], Imm::Int(2))?;
//! let root = image.store(&mut b, x, y, c, doubled)?;
//!
//! let kernel = Compiler::new(&session, CompilerOptions::default()).compile(&mut b, root)?;
//! unsafe { kernel.run() };
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Errors, interval analysis, session, options, registers
//! - [`ir`] - Node model, factory with folds and rewrites, transforms, evaluator
//! - [`planner`] - Loop-structure planning
//! - [`regalloc`] - Register assignment
//! - [`x64`] - Encoding, code generation, object files, executable memory
//! - [`compiler`] - The driver

pub mod core;
pub mod ir;
pub mod planner;
pub mod regalloc;
pub mod x64;
pub mod compiler;

pub use crate::core::{
    Abi, CompilationSession, CompileError, CompileResult, CompilerOptions, ObjectFormat,
    SessionStats, SoundnessWarning,
};
pub use compiler::{CompiledKernel, Compiler, ImageBuffer};
pub use ir::{Imm, IrBuilder, IterOrder, NodeId, Op, Type, VarInfo};
