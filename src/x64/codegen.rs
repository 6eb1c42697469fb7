// This module turns one planned and register-allocated definition into x86-64 machine code.
// The layout of a kernel is fixed: prologue, the loop-invariant code of level 0, then for each
// loop level its header (induction register initialised, label bound) followed by the nodes
// scheduled at that level, then the loop tails from the innermost outwards, the epilogue and
// finally a 16-byte aligned constant pool. Each node is lowered through a per-opcode table
// keyed on register class and width; general-purpose registers carry scalar integers and
// SIMD registers carry floats and 4-lane vectors. Two-operand x86 forms are reconciled with
// three-register IR nodes by picking between the destination already holding the first
// operand, holding the second (operands swapped for commutative or flippable operations,
// otherwise routed through the scratch register) or a copy followed by the operation.
// Vector memory accesses use the aligned encoding only when the address congruence proves
// 16-byte alignment, and displacements must fit 32 bits. 4-lane constants live in the pool
// and are addressed through an absolute fixup, resolved when the code is placed in memory.

//! Machine code generation for planned kernels.

use hashbrown::HashMap;

use super::assembler::{CodeBuffer, Label};
use super::calling_convention::{CallingConvention, FrameLayout, SCRATCH_GP, SCRATCH_SIMD};
use super::encoder::{JumpCondition, SseOp, X64Encoder};
use crate::core::error::{CompileError, CompileResult, SoundnessWarning};
use crate::core::register_file::{AsmReg, RegClass};
use crate::core::session::CompilationSession;
use crate::ir::builder::IrBuilder;
use crate::ir::node::{IterOrder, NodeId, Op, Type};
use crate::planner::{LoopPlan, LoopVar};
use crate::regalloc::{is_pooled, Allocation};

/// `cmpps` predicates.
const CMP_EQ: u8 = 0;
const CMP_LT: u8 = 1;
const CMP_LE: u8 = 2;
const CMP_NEQ: u8 = 4;

/// Emit the complete kernel for `plan`.
pub fn generate(
    builder: &IrBuilder,
    session: &CompilationSession<'_>,
    plan: &LoopPlan,
    alloc: &Allocation,
    cc: &CallingConvention,
) -> CompileResult<CodeBuffer> {
    let mut codegen = KernelCodegen {
        encoder: X64Encoder::new()?,
        builder,
        session,
        pool: Vec::new(),
        pool_index: HashMap::new(),
    };
    // loop scaffolding writes every induction register, even for variables
    // that optimization removed from the body
    let mut written = alloc.used;
    for var in &plan.loops {
        written.set(codegen.register(var.node)?);
    }
    let frame = FrameLayout::new(cc, &written);

    codegen.prologue(&frame)?;
    codegen.body(alloc.order.first().map(Vec::as_slice).unwrap_or(&[]))?;

    let mut headers = Vec::with_capacity(plan.loops.len());
    for var in &plan.loops {
        headers.push(codegen.loop_header(var)?);
        let nodes = alloc.order.get(var.level as usize).map(Vec::as_slice).unwrap_or(&[]);
        codegen.body(nodes)?;
    }
    for (var, &label) in plan.loops.iter().zip(headers.iter()).rev() {
        codegen.loop_tail(var, label)?;
    }

    codegen.epilogue(&frame)?;
    codegen.constant_pool()?;

    let (buffer, emitted) = codegen.encoder.finish();
    for mnemonic in emitted {
        session.record_instruction(mnemonic);
    }
    log::debug!(
        "generated {} bytes for {} loops",
        buffer.len(),
        plan.loops.len()
    );
    Ok(buffer)
}

struct PoolEntry {
    label: Label,
    lanes: [u32; 4],
}

struct KernelCodegen<'a, 's> {
    encoder: X64Encoder,
    builder: &'a IrBuilder,
    session: &'a CompilationSession<'s>,
    pool: Vec<PoolEntry>,
    pool_index: HashMap<[u32; 4], usize>,
}

fn displacement(disp: i64) -> CompileResult<i32> {
    i32::try_from(disp)
        .map_err(|_| CompileError::overflow(format!("displacement {disp} does not fit 32 bits")))
}

fn immediate(value: i64, what: &str) -> CompileResult<i32> {
    i32::try_from(value)
        .map_err(|_| CompileError::overflow(format!("{what} {value} does not fit 32 bits")))
}

impl KernelCodegen<'_, '_> {
    // ==== SCAFFOLDING ====

    fn prologue(&mut self, frame: &FrameLayout) -> CompileResult<()> {
        let e = &mut self.encoder;
        e.push(AsmReg::RBP)?;
        e.mov_rr(AsmReg::RBP, AsmReg::RSP)?;
        for &reg in &frame.saved_gp {
            e.push(reg)?;
        }
        e.and_ri(AsmReg::RSP, -16)?;
        if frame.xmm_area() > 0 {
            e.sub_ri(AsmReg::RSP, frame.xmm_area())?;
            for (i, &reg) in frame.saved_xmm.iter().enumerate() {
                e.store_vector(AsmReg::RSP, 16 * i as i32, reg, true)?;
            }
        }
        log::trace!(
            "prologue saves {:?} and {:?}",
            frame.saved_gp,
            frame.saved_xmm
        );
        Ok(())
    }

    fn epilogue(&mut self, frame: &FrameLayout) -> CompileResult<()> {
        let e = &mut self.encoder;
        for (i, &reg) in frame.saved_xmm.iter().enumerate() {
            e.load_vector(reg, AsmReg::RSP, 16 * i as i32, true)?;
        }
        let pushed = 8 * frame.saved_gp.len() as i32;
        e.lea(AsmReg::RSP, AsmReg::RBP, None, -pushed)?;
        for &reg in frame.saved_gp.iter().rev() {
            e.pop(reg)?;
        }
        e.pop(AsmReg::RBP)?;
        e.ret()?;
        Ok(())
    }

    fn loop_header(&mut self, var: &LoopVar) -> CompileResult<Label> {
        let reg = self.register(var.node)?;
        self.encoder.mov_ri(reg, var.start())?;
        let label = self.encoder.buffer_mut().create_label();
        self.encoder.buffer_mut().bind(label)?;
        log::trace!("loop {} header in {reg} from {}", var.name, var.start());
        Ok(label)
    }

    fn loop_tail(&mut self, var: &LoopVar, header: Label) -> CompileResult<()> {
        let reg = self.register(var.node)?;
        let step = immediate(var.step, "loop step")?;
        let (bound, condition) = match var.order {
            IterOrder::Decreasing => {
                self.encoder.sub_ri(reg, step)?;
                (var.min, JumpCondition::GreaterEqual)
            }
            _ => {
                self.encoder.add_ri(reg, step)?;
                (var.last(), JumpCondition::LessEqual)
            }
        };
        match i32::try_from(bound) {
            Ok(imm) => self.encoder.cmp_ri(reg, imm)?,
            Err(_) => {
                self.encoder.mov_ri(SCRATCH_GP, bound)?;
                self.encoder.cmp_rr(reg, SCRATCH_GP)?;
            }
        }
        self.encoder.jcc(condition, header)?;
        Ok(())
    }

    fn constant_pool(&mut self) -> CompileResult<()> {
        if self.pool.is_empty() {
            return Ok(());
        }
        let buffer = self.encoder.buffer_mut();
        buffer.align(16, 0xCC);
        for entry in &self.pool {
            buffer.bind(entry.label)?;
            for lane in entry.lanes {
                buffer.emit(&lane.to_le_bytes());
            }
        }
        log::trace!("constant pool holds {} vectors", self.pool.len());
        Ok(())
    }

    fn pool_label(&mut self, lanes: [u32; 4]) -> Label {
        if let Some(&index) = self.pool_index.get(&lanes) {
            return self.pool[index].label;
        }
        let label = self.encoder.buffer_mut().create_label();
        self.pool_index.insert(lanes, self.pool.len());
        self.pool.push(PoolEntry { label, lanes });
        label
    }

    // ==== OPERANDS ====

    fn register(&self, id: NodeId) -> CompileResult<AsmReg> {
        self.builder[id].reg.ok_or_else(|| {
            CompileError::codegen(format!("{} has no register", self.builder.describe(id)))
        })
    }

    /// Register of `id`, which must be of `class`.
    fn operand(&self, id: NodeId, class: RegClass) -> CompileResult<AsmReg> {
        let reg = self.register(id)?;
        if reg.class() != class {
            return Err(CompileError::codegen(format!(
                "{} is in {reg}, expected a {class:?} register",
                self.builder.describe(id)
            )));
        }
        Ok(reg)
    }

    fn input(&self, id: NodeId, index: usize) -> CompileResult<NodeId> {
        self.builder[id].inputs.get(index).copied().ok_or_else(|| {
            CompileError::codegen(format!(
                "{} is missing input {index}",
                self.builder.describe(id)
            ))
        })
    }

    fn lane_bits(&self, id: NodeId) -> u32 {
        let builder = self.builder;
        let node = &builder[id];
        match node.ty {
            Type::Float => node.fval().to_bits(),
            Type::Bool if node.ival() != 0 => u32::MAX,
            Type::Bool => 0,
            Type::Int => node.ival() as i32 as u32,
        }
    }

    // ==== BODY ====

    fn body(&mut self, nodes: &[NodeId]) -> CompileResult<()> {
        for &id in nodes {
            self.node(id)?;
        }
        Ok(())
    }

    fn node(&mut self, id: NodeId) -> CompileResult<()> {
        let builder = self.builder;
        let node = &builder[id];
        match node.op {
            Op::NoOp | Op::Variable => Ok(()),
            Op::Store | Op::StoreVector => self.store(id),
            _ => {
                let Some(class) = node.reg_class() else {
                    return Ok(());
                };
                let dst = self.operand(id, class)?;
                match class {
                    RegClass::General => self.general(id, dst),
                    RegClass::Simd => self.simd(id, dst),
                }
            }
        }
    }

    fn unsupported(&self, id: NodeId, reason: &str) -> CompileError {
        let builder = self.builder;
        let node = &builder[id];
        CompileError::unsupported(
            node.op.name(),
            format!("{reason} ({})", self.builder.describe(id)),
        )
    }

    fn store(&mut self, id: NodeId) -> CompileResult<()> {
        let builder = self.builder;
        let node = &builder[id];
        let address = self.input(id, 0)?;
        let value = self.input(id, 1)?;
        let base = self.operand(address, RegClass::General)?;
        let disp = displacement(node.ival())?;
        if node.op == Op::StoreVector {
            let src = self.operand(value, RegClass::Simd)?;
            let aligned = self.vector_aligned(id, address, node.ival());
            self.encoder.store_vector(base, disp, src, aligned)?;
            return Ok(());
        }
        let src = self.register(value)?;
        match src.class() {
            RegClass::General => self.encoder.mov32_mr(base, disp, src)?,
            RegClass::Simd => self.encoder.movss_mr(base, disp, src)?,
        }
        Ok(())
    }

    fn vector_aligned(&self, id: NodeId, address: NodeId, disp: i64) -> bool {
        let aligned = self.builder[address].interval.offset(disp).is_aligned(16);
        if !aligned {
            self.session.warn(SoundnessWarning::UnalignedVectorAccess {
                node: self.builder.describe(id),
            });
        }
        aligned
    }

    /// Scalar integer nodes in general-purpose registers.
    fn general(&mut self, id: NodeId, dst: AsmReg) -> CompileResult<()> {
        let builder = self.builder;
        let node = &builder[id];
        match node.op {
            Op::Const => {
                let value = match node.ty {
                    Type::Bool if node.ival() != 0 => -1,
                    _ => node.ival(),
                };
                self.encoder.mov_ri(dst, value)?;
            }
            Op::Load(_) => {
                let base = self.operand(self.input(id, 0)?, RegClass::General)?;
                let disp = displacement(node.ival())?;
                self.encoder.movsxd_rm(dst, base, disp)?;
            }
            Op::Plus | Op::Minus | Op::Times => {
                let a = self.operand(self.input(id, 0)?, RegClass::General)?;
                let b = self.operand(self.input(id, 1)?, RegClass::General)?;
                self.general_binary(node.op, dst, a, b)?;
            }
            Op::PlusImm => {
                let a = self.operand(self.input(id, 0)?, RegClass::General)?;
                match i32::try_from(node.ival()) {
                    Ok(imm) if dst == a => self.encoder.add_ri(dst, imm)?,
                    Ok(imm) => self.encoder.lea(dst, a, None, imm)?,
                    Err(_) => {
                        self.encoder.mov_ri(SCRATCH_GP, node.ival())?;
                        self.general_binary(Op::Plus, dst, a, SCRATCH_GP)?;
                    }
                }
            }
            Op::TimesImm => {
                let a = self.operand(self.input(id, 0)?, RegClass::General)?;
                match i32::try_from(node.ival()) {
                    Ok(imm) => self.encoder.imul_rri(dst, a, imm)?,
                    Err(_) => {
                        self.encoder.mov_ri(SCRATCH_GP, node.ival())?;
                        self.general_binary(Op::Times, dst, a, SCRATCH_GP)?;
                    }
                }
            }
            Op::FloatToInt => {
                let a = self.operand(self.input(id, 0)?, RegClass::Simd)?;
                self.encoder.cvttss2si(dst, a)?;
            }
            op if op.is_comparison() || op.is_bitwise() => {
                return Err(self.unsupported(id, "only available on SIMD registers"));
            }
            _ => return Err(self.unsupported(id, "no general-purpose lowering")),
        }
        Ok(())
    }

    fn general_binary(&mut self, op: Op, dst: AsmReg, a: AsmReg, b: AsmReg) -> CompileResult<()> {
        let e = &mut self.encoder;
        match op {
            Op::Plus if dst == a => e.add_rr(dst, b)?,
            Op::Plus if dst == b => e.add_rr(dst, a)?,
            Op::Plus => e.lea(dst, a, Some(b), 0)?,
            Op::Minus if dst == a => e.sub_rr(dst, b)?,
            Op::Minus if dst == b => {
                e.neg(dst)?;
                e.add_rr(dst, a)?;
            }
            Op::Minus => {
                e.mov_rr(dst, a)?;
                e.sub_rr(dst, b)?;
            }
            Op::Times if dst == a => e.imul_rr(dst, b)?,
            Op::Times if dst == b => e.imul_rr(dst, a)?,
            Op::Times => {
                e.mov_rr(dst, a)?;
                e.imul_rr(dst, b)?;
            }
            other => {
                return Err(CompileError::unsupported(
                    other.name(),
                    "no general-purpose two-register form",
                ))
            }
        }
        Ok(())
    }

    /// Floats and 4-lane vectors in SIMD registers.
    fn simd(&mut self, id: NodeId, dst: AsmReg) -> CompileResult<()> {
        let builder = self.builder;
        let node = &builder[id];
        let float = node.ty == Type::Float;
        let vector = node.width == 4;
        match node.op {
            Op::Const => self.float_constant(dst, self.lane_bits(id))?,
            Op::Vector => self.vector(id, dst)?,
            Op::Load(_) => {
                let base = self.operand(self.input(id, 0)?, RegClass::General)?;
                let disp = displacement(node.ival())?;
                self.encoder.movss_rm(dst, base, disp)?;
            }
            Op::LoadVector(_) => {
                let address = self.input(id, 0)?;
                let base = self.operand(address, RegClass::General)?;
                let disp = displacement(node.ival())?;
                let aligned = self.vector_aligned(id, address, node.ival());
                self.encoder.load_vector(dst, base, disp, aligned)?;
            }
            Op::Plus | Op::Minus | Op::Times | Op::Divide | Op::And | Op::Or => {
                let op = match (node.op, float, vector) {
                    (Op::Plus, true, false) => SseOp::Addss,
                    (Op::Plus, true, true) => SseOp::Addps,
                    (Op::Plus, false, _) => SseOp::Paddd,
                    (Op::Minus, true, false) => SseOp::Subss,
                    (Op::Minus, true, true) => SseOp::Subps,
                    (Op::Minus, false, _) => SseOp::Psubd,
                    (Op::Times, true, false) => SseOp::Mulss,
                    (Op::Times, true, true) => SseOp::Mulps,
                    (Op::Times, false, _) => SseOp::Pmulld,
                    (Op::Divide, _, false) => SseOp::Divss,
                    (Op::Divide, _, true) => SseOp::Divps,
                    (Op::And, ..) => SseOp::Andps,
                    (Op::Or, ..) => SseOp::Orps,
                    _ => return Err(self.unsupported(id, "no SIMD lowering")),
                };
                let a = self.operand(self.input(id, 0)?, RegClass::Simd)?;
                let b = self.operand(self.input(id, 1)?, RegClass::Simd)?;
                self.sse_binary(op, dst, a, b)?;
            }
            Op::Nand => {
                let a = self.operand(self.input(id, 0)?, RegClass::Simd)?;
                let b = self.operand(self.input(id, 1)?, RegClass::Simd)?;
                self.sse_binary(SseOp::Andnps, dst, a, b)?;
            }
            op if op.is_comparison() => self.compare(id, dst)?,
            Op::PlusImm | Op::TimesImm if vector && !float => {
                let a = self.operand(self.input(id, 0)?, RegClass::Simd)?;
                // lanes are 32 bits wide, so is the broadcast immediate
                self.encoder.mov32_ri(SCRATCH_GP, node.ival() as i32)?;
                self.encoder.movd_xr(SCRATCH_SIMD, SCRATCH_GP)?;
                self.encoder.pshufd(SCRATCH_SIMD, SCRATCH_SIMD, 0)?;
                let op = if node.op == Op::PlusImm {
                    SseOp::Paddd
                } else {
                    SseOp::Pmulld
                };
                if dst != a {
                    self.encoder.movaps_rr(dst, a)?;
                }
                self.encoder.sse(op, dst, SCRATCH_SIMD)?;
            }
            Op::IntToFloat if vector => {
                let a = self.operand(self.input(id, 0)?, RegClass::Simd)?;
                self.encoder.cvtdq2ps(dst, a)?;
            }
            Op::IntToFloat => {
                let a = self.operand(self.input(id, 0)?, RegClass::General)?;
                self.encoder.cvtsi2ss(dst, a)?;
            }
            Op::FloatToInt if vector => {
                let a = self.operand(self.input(id, 0)?, RegClass::Simd)?;
                self.encoder.cvttps2dq(dst, a)?;
            }
            Op::SelectVector => {
                let lo = self.operand(self.input(id, 0)?, RegClass::Simd)?;
                let hi = self.operand(self.input(id, 1)?, RegClass::Simd)?;
                let k = node.ival();
                if !(1..4).contains(&k) {
                    return Err(self.unsupported(id, "lane offset must be 1, 2 or 3"));
                }
                self.encoder.movaps_rr(SCRATCH_SIMD, hi)?;
                self.encoder.palignr(SCRATCH_SIMD, lo, 4 * k as u8)?;
                self.encoder.movaps_rr(dst, SCRATCH_SIMD)?;
            }
            _ => return Err(self.unsupported(id, "no SIMD lowering")),
        }
        Ok(())
    }

    /// `dst = a op b` with a two-operand SSE instruction.
    fn sse_binary(&mut self, op: SseOp, dst: AsmReg, a: AsmReg, b: AsmReg) -> CompileResult<()> {
        let e = &mut self.encoder;
        if dst == a {
            e.sse(op, dst, b)?;
        } else if dst == b && op.is_commutative() {
            e.sse(op, dst, a)?;
        } else if dst == b {
            e.movaps_rr(SCRATCH_SIMD, a)?;
            e.sse(op, SCRATCH_SIMD, b)?;
            e.movaps_rr(dst, SCRATCH_SIMD)?;
        } else {
            e.movaps_rr(dst, a)?;
            e.sse(op, dst, b)?;
        }
        Ok(())
    }

    /// `dst = a cmp b` for `cmpps`, never commutative at the instruction level.
    fn cmpps_binary(&mut self, predicate: u8, dst: AsmReg, a: AsmReg, b: AsmReg) -> CompileResult<()> {
        let e = &mut self.encoder;
        if dst == a {
            e.cmpps(dst, b, predicate)?;
        } else if dst == b {
            e.movaps_rr(SCRATCH_SIMD, a)?;
            e.cmpps(SCRATCH_SIMD, b, predicate)?;
            e.movaps_rr(dst, SCRATCH_SIMD)?;
        } else {
            e.movaps_rr(dst, a)?;
            e.cmpps(dst, b, predicate)?;
        }
        Ok(())
    }

    fn compare(&mut self, id: NodeId, dst: AsmReg) -> CompileResult<()> {
        let builder = self.builder;
        let node = &builder[id];
        let lhs = self.input(id, 0)?;
        let mut a = self.operand(lhs, RegClass::Simd)?;
        let mut b = self.operand(self.input(id, 1)?, RegClass::Simd)?;
        let mut op = node.op;
        if dst == b && dst != a {
            op = op.flipped();
            std::mem::swap(&mut a, &mut b);
        }

        if self.builder[lhs].ty == Type::Float {
            // cmpps only has less-than forms
            let (predicate, a, b) = match op {
                Op::Eq => (CMP_EQ, a, b),
                Op::Neq => (CMP_NEQ, a, b),
                Op::Lt => (CMP_LT, a, b),
                Op::Lte => (CMP_LE, a, b),
                Op::Gt => (CMP_LT, b, a),
                _ => (CMP_LE, b, a),
            };
            return self.cmpps_binary(predicate, dst, a, b);
        }

        let (base, a, b, invert) = match op {
            Op::Eq => (SseOp::Pcmpeqd, a, b, false),
            Op::Neq => (SseOp::Pcmpeqd, a, b, true),
            Op::Gt => (SseOp::Pcmpgtd, a, b, false),
            Op::Lt => (SseOp::Pcmpgtd, b, a, false),
            // a >= b is !(b > a)
            Op::Gte => (SseOp::Pcmpgtd, b, a, true),
            _ => (SseOp::Pcmpgtd, a, b, true),
        };
        self.sse_binary(base, dst, a, b)?;
        if invert {
            self.encoder.sse(SseOp::Pcmpeqd, SCRATCH_SIMD, SCRATCH_SIMD)?;
            self.encoder.sse(SseOp::Pxor, dst, SCRATCH_SIMD)?;
        }
        Ok(())
    }

    fn float_constant(&mut self, dst: AsmReg, bits: u32) -> CompileResult<()> {
        if bits == 0 {
            self.encoder.sse(SseOp::Pxor, dst, dst)?;
        } else {
            self.encoder.mov32_ri(SCRATCH_GP, bits as i32)?;
            self.encoder.movd_xr(dst, SCRATCH_GP)?;
        }
        Ok(())
    }

    fn vector(&mut self, id: NodeId, dst: AsmReg) -> CompileResult<()> {
        let lanes: Vec<NodeId> = self.builder[id].inputs.clone();
        if lanes.len() != 4 {
            return Err(self.unsupported(id, "a vector needs four lanes"));
        }

        if is_pooled(self.builder, id) {
            let bits = [0, 1, 2, 3].map(|i| self.lane_bits(lanes[i]));
            let label = self.pool_label(bits);
            self.encoder.mov_label_address(SCRATCH_GP, label)?;
            self.encoder.load_vector(dst, SCRATCH_GP, 0, true)?;
            return Ok(());
        }

        let broadcast = lanes.iter().all(|&l| l == lanes[0]);
        let first = self.register(lanes[0])?;
        match first.class() {
            RegClass::General => {
                self.encoder.movd_xr(SCRATCH_SIMD, first)?;
                if broadcast {
                    self.encoder.pshufd(dst, SCRATCH_SIMD, 0)?;
                    return Ok(());
                }
                for (i, &lane) in lanes.iter().enumerate().skip(1) {
                    let reg = self.operand(lane, RegClass::General)?;
                    self.encoder.pinsrd(SCRATCH_SIMD, reg, i as u8)?;
                }
            }
            RegClass::Simd => {
                if broadcast {
                    self.encoder.pshufd(dst, first, 0)?;
                    return Ok(());
                }
                self.encoder.movaps_rr(SCRATCH_SIMD, first)?;
                for (i, &lane) in lanes.iter().enumerate().skip(1) {
                    let reg = self.operand(lane, RegClass::Simd)?;
                    self.encoder.insertps(SCRATCH_SIMD, reg, i as u8)?;
                }
            }
        }
        self.encoder.movaps_rr(dst, SCRATCH_SIMD)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Abi;
    use crate::core::register_file::RegBitSet;
    use crate::ir::node::Imm;
    use crate::regalloc;
    use bumpalo::Bump;

    const BASE: i64 = 0x5555_0000_0000;

    fn compile(b: &mut IrBuilder, session: &CompilationSession<'_>, root: NodeId) -> CompileResult<CodeBuffer> {
        let cc = CallingConvention::new(Abi::SysV);
        let plan = LoopPlan {
            roots: vec![root],
            loops: Vec::new(),
            vectorized: None,
        };
        let alloc = regalloc::assign(b, session, &cc, &plan.roots, &RegBitSet::new())?;
        generate(b, session, &plan, &alloc, &cc)
    }

    #[test]
    fn test_straight_line_kernel_frame() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let addr = b.int(BASE);
        let load = b.make(Op::Load(Type::Int), &[addr], Imm::Int(0)).unwrap();
        let value = b.make(Op::TimesImm, &[load], Imm::Int(3)).unwrap();
        let store = b.make(Op::Store, &[addr, value], Imm::Int(0)).unwrap();

        let code = compile(&mut b, &session, store).unwrap();
        let bytes = code.bytes();
        // push rbp; mov rbp, rsp
        assert_eq!(&bytes[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(bytes.last(), Some(&0xC3));
        assert!(code.relocations().unwrap().is_empty());

        let stats = session.stats();
        assert_eq!(stats.instruction_counts.get("movsxd"), Some(&1));
        assert_eq!(stats.instruction_counts.get("imul"), Some(&1));
        assert_eq!(stats.instruction_counts.get("ret"), Some(&1));
    }

    #[test]
    fn test_constant_vector_goes_to_pool() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let addr = b.int(BASE);
        let lanes: Vec<NodeId> = (1..=4).map(|v| b.int(v)).collect();
        let constant = b.make(Op::Vector, &lanes, Imm::None).unwrap();
        let store = b.make(Op::StoreVector, &[addr, constant], Imm::Int(0)).unwrap();

        let code = compile(&mut b, &session, store).unwrap();
        let relocations = code.relocations().unwrap();
        assert_eq!(relocations.len(), 1);
        let (_, target) = relocations[0];
        assert_eq!(target % 16, 0);
        let pool: Vec<u8> = [1u32, 2, 3, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(&code.bytes()[target..target + 16], pool.as_slice());
    }

    #[test]
    fn test_scalar_bitwise_rejected() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let addr = b.int(BASE);
        let x = b.make(Op::Load(Type::Int), &[addr], Imm::Int(0)).unwrap();
        let y = b.make(Op::Load(Type::Int), &[addr], Imm::Int(4)).unwrap();
        let and = b.make(Op::And, &[x, y], Imm::None).unwrap();
        let store = b.make(Op::Store, &[addr, and], Imm::Int(8)).unwrap();

        let err = compile(&mut b, &session, store).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_displacement_must_fit() {
        assert!(displacement(i32::MAX as i64).is_ok());
        assert!(matches!(
            displacement(1 << 40),
            Err(CompileError::Overflow { .. })
        ));
    }
}
