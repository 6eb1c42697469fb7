// This module is the driver that takes one output definition from IR to a callable kernel.
// The planner decides the loop nest and expands vectorized or unrolled lanes into roots; the
// loop induction variables are then bound to fixed registers from the calling convention,
// the register allocator schedules and assigns the remaining nodes, and the code generator
// emits prologue, loop scaffolding, bodies, epilogue and constant pool. The result is placed
// in a fresh executable mapping, with absolute fixups linked against the mapping's address,
// and optionally serialized as a relocatable object file. ImageBuffer describes the target
// arrays of the front end (base pointer, width, height, channels, element size) and builds
// the row-major address, load and store expressions for them. A compilation either produces
// the whole kernel or fails with a CompileError; no partial artifact escapes.

//! Compilation driver and buffer descriptors.

use crate::core::config::CompilerOptions;
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::RegBitSet;
use crate::core::session::CompilationSession;
use crate::ir::builder::IrBuilder;
use crate::ir::node::{Imm, NodeId, Op, Type};
use crate::planner::{self, LoopPlan};
use crate::regalloc;
use crate::x64::calling_convention::CallingConvention;
use crate::x64::codegen;
use crate::x64::memory::ExecutableBuffer;
use crate::x64::object::write_object;

/// Row-major interleaved array in the caller's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBuffer {
    pub base: i64,
    pub width: i64,
    pub height: i64,
    pub channels: i64,
    /// Bytes per element; kernels load and store 32-bit elements.
    pub element_size: i64,
}

/// Apply `f` to an owned node and give the reference back.
fn then(
    b: &mut IrBuilder,
    owned: NodeId,
    f: impl FnOnce(&mut IrBuilder, NodeId) -> CompileResult<NodeId>,
) -> CompileResult<NodeId> {
    let result = f(b, owned);
    b.release(owned);
    result
}

impl ImageBuffer {
    /// Single-channel buffer of 32-bit elements.
    pub fn new(base: i64, width: i64, height: i64) -> Self {
        Self {
            base,
            width,
            height,
            channels: 1,
            element_size: 4,
        }
    }

    pub fn with_channels(mut self, channels: i64) -> Self {
        self.channels = channels;
        self
    }

    /// `base + ((y * width + x) * channels + c) * element_size`
    pub fn address(&self, b: &mut IrBuilder, x: NodeId, y: NodeId, c: NodeId) -> CompileResult<NodeId> {
        let row = b.make(Op::TimesImm, &[y], Imm::Int(self.width))?;
        let pixel = then(b, row, |b, row| b.make(Op::Plus, &[row, x], Imm::None))?;
        let scaled = then(b, pixel, |b, p| b.make(Op::TimesImm, &[p], Imm::Int(self.channels)))?;
        let element = then(b, scaled, |b, s| b.make(Op::Plus, &[s, c], Imm::None))?;
        let bytes = then(b, element, |b, e| {
            b.make(Op::TimesImm, &[e], Imm::Int(self.element_size))
        })?;
        let base = b.int(self.base);
        let address = b.make(Op::Plus, &[base, bytes], Imm::None);
        b.release(base);
        b.release(bytes);
        address
    }

    fn check_element(&self, op: &'static str) -> CompileResult<()> {
        if self.element_size != 4 {
            return Err(CompileError::type_error(
                op,
                format!("{}-byte elements are not supported", self.element_size),
            ));
        }
        Ok(())
    }

    pub fn load(&self, b: &mut IrBuilder, ty: Type, x: NodeId, y: NodeId, c: NodeId) -> CompileResult<NodeId> {
        self.check_element("Load")?;
        let address = self.address(b, x, y, c)?;
        then(b, address, |b, a| b.make(Op::Load(ty), &[a], Imm::Int(0)))
    }

    /// The definition `self(x, y, c) = value`.
    pub fn store(
        &self,
        b: &mut IrBuilder,
        x: NodeId,
        y: NodeId,
        c: NodeId,
        value: NodeId,
    ) -> CompileResult<NodeId> {
        self.check_element("Store")?;
        let address = self.address(b, x, y, c)?;
        then(b, address, |b, a| b.make(Op::Store, &[a, value], Imm::Int(0)))
    }
}

/// A compiled definition, ready to run.
#[derive(Debug)]
pub struct CompiledKernel<'arena> {
    code: &'arena [u8],
    object: Option<Vec<u8>>,
    exec: ExecutableBuffer,
}

impl CompiledKernel<'_> {
    /// Machine code before absolute fixups were linked.
    pub fn code(&self) -> &[u8] {
        self.code
    }

    /// Machine code as it sits in executable memory.
    pub fn linked_code(&self) -> &[u8] {
        self.exec.as_slice()
    }

    pub fn object(&self) -> Option<&[u8]> {
        self.object.as_deref()
    }

    /// Execute the kernel once.
    ///
    /// # Safety
    /// Every buffer the definition reads or writes must be live and cover
    /// the addresses the loops touch.
    pub unsafe fn run(&self) {
        unsafe { self.exec.call() }
    }
}

/// Compiles definitions one at a time within a session.
pub struct Compiler<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    options: CompilerOptions,
    cc: CallingConvention,
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>, options: CompilerOptions) -> Self {
        let cc = CallingConvention::new(options.abi);
        Self {
            session,
            options,
            cc,
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// Compile the `Store`/`StoreVector` definition `root`.
    pub fn compile(&self, builder: &mut IrBuilder, root: NodeId) -> CompileResult<CompiledKernel<'arena>> {
        let plan = planner::plan(builder, self.session, root, &self.options)?;
        let result = self.emit(builder, &plan);
        plan.release(builder);

        let stats = builder.stats();
        self.session.record_builder_stats(
            stats.folds,
            stats.rewrites,
            stats.cse_hits,
            stats.nodes_created,
        );
        result
    }

    fn emit(&self, builder: &mut IrBuilder, plan: &LoopPlan) -> CompileResult<CompiledKernel<'arena>> {
        let registers = self.cc.loop_registers(plan.depth()).ok_or_else(|| {
            CompileError::planning(format!(
                "{} nested loops exceed the available induction registers",
                plan.depth()
            ))
        })?;
        let mut reserved = RegBitSet::new();
        for (var, &reg) in plan.loops.iter().zip(registers) {
            builder[var.node].reg = Some(reg);
            reserved.set(reg);
            log::debug!("induction variable {} in {reg}", var.name);
        }

        let alloc = regalloc::assign(builder, self.session, &self.cc, &plan.roots, &reserved)?;
        let code = codegen::generate(builder, self.session, plan, &alloc, &self.cc)?;

        let object = if self.options.emit_object {
            Some(write_object(
                &code,
                self.options.object_format,
                &self.options.symbol_name,
            )?)
        } else {
            None
        };

        let mut exec = ExecutableBuffer::reserve(code.len())?;
        let linked = code.link(exec.base())?;
        exec.finalize(&linked)?;

        self.session.record_definition_compiled(code.len());
        log::info!(
            "compiled {} with {} loops into {} bytes at {:#x}",
            self.options.symbol_name,
            plan.depth(),
            code.len(),
            exec.base()
        );
        Ok(CompiledKernel {
            code: self.session.alloc_slice(code.bytes()),
            object,
            exec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::eval::{execute, Env};
    use bumpalo::Bump;

    #[test]
    fn test_address_is_row_major() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        let y = b.variable("y", 0, 2);
        let c = b.variable("c", 0, 2);
        let image = ImageBuffer::new(0x1000, 4, 3).with_channels(3);
        let address = image.address(&mut b, x, y, c).unwrap();
        let value = b.int(7);
        let store = b.make(Op::Store, &[address, value], Imm::Int(0)).unwrap();

        let mut env = Env::default();
        env.bind(x, 2);
        env.bind(y, 1);
        env.bind(c, 1);
        execute(&b, store, &mut env).unwrap();
        // ((1 * 4 + 2) * 3 + 1) * 4 = 76
        assert_eq!(env.read_i32(0x1000 + 76), 7);
    }

    #[test]
    fn test_wide_elements_rejected() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        let zero = b.int(0);
        let image = ImageBuffer {
            element_size: 8,
            ..ImageBuffer::new(0x1000, 4, 1)
        };
        let err = image.load(&mut b, Type::Int, x, zero, zero).unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
    }

    #[test]
    fn test_non_store_root_rejected() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let compiler = Compiler::new(&session, CompilerOptions::default());
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        let sum = b.make(Op::PlusImm, &[x], Imm::Int(1)).unwrap();
        assert!(matches!(
            compiler.compile(&mut b, sum),
            Err(CompileError::Planning { .. })
        ));
    }
}
