// This module wraps the iced-x86 CodeAssembler into X64Encoder, the instruction-level emitter
// used by the code generator. Every method assembles exactly one instruction (or a short fixed
// sequence) from AsmReg operands and immediately encodes it into the crate's own CodeBuffer,
// so byte offsets are known as code is produced and labels, loop back-edges and constant-pool
// references stay under the crate's control instead of iced's label machinery. The encoder
// covers the general-purpose integer forms the kernels need (moves, sign-extending loads,
// add/sub/imul/lea, compares, push/pop, stack alignment) and the SSE/SSE4.1 forms used for
// scalar and packed single-precision and 32-bit integer arithmetic, masks, conversions, lane
// inserts, shuffles and aligned or unaligned 16-byte loads and stores. Branches with rel32
// displacements and 64-bit absolute address moves are written byte-wise because their
// displacement slots are patched later through fixups. Emitted mnemonics are recorded so the
// session statistics can report an instruction histogram.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::*;
use iced_x86::{Encoder, IcedError};

use super::assembler::{CodeBuffer, Label};
use crate::core::register_file::{AsmReg, GP_BANK, SIMD_BANK};

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction,
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// Memory operand construction failed.
    InvalidMemoryOperand,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::UnsupportedInstruction => {
                write!(f, "Unsupported instruction or operand combination")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::InvalidMemoryOperand => write!(f, "Invalid memory operand"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::AssemblyError(e.to_string())
    }
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const XMM_REGS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

/// Two-operand SSE forms `dst = dst op src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseOp {
    Addss,
    Subss,
    Mulss,
    Divss,
    Addps,
    Subps,
    Mulps,
    Divps,
    Paddd,
    Psubd,
    Pmulld,
    Andps,
    Orps,
    /// `dst = !dst & src`
    Andnps,
    Pcmpeqd,
    Pcmpgtd,
    Pxor,
}

impl SseOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            SseOp::Addss => "addss",
            SseOp::Subss => "subss",
            SseOp::Mulss => "mulss",
            SseOp::Divss => "divss",
            SseOp::Addps => "addps",
            SseOp::Subps => "subps",
            SseOp::Mulps => "mulps",
            SseOp::Divps => "divps",
            SseOp::Paddd => "paddd",
            SseOp::Psubd => "psubd",
            SseOp::Pmulld => "pmulld",
            SseOp::Andps => "andps",
            SseOp::Orps => "orps",
            SseOp::Andnps => "andnps",
            SseOp::Pcmpeqd => "pcmpeqd",
            SseOp::Pcmpgtd => "pcmpgtd",
            SseOp::Pxor => "pxor",
        }
    }

    /// `op(a, b) == op(b, a)`.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            SseOp::Addss
                | SseOp::Mulss
                | SseOp::Addps
                | SseOp::Mulps
                | SseOp::Paddd
                | SseOp::Pmulld
                | SseOp::Andps
                | SseOp::Orps
                | SseOp::Pcmpeqd
                | SseOp::Pxor
        )
    }
}

/// Jump conditions for loop back-edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    LessEqual,
    GreaterEqual,
}

impl JumpCondition {
    fn opcode(self) -> u8 {
        match self {
            JumpCondition::LessEqual => 0x8E,
            JumpCondition::GreaterEqual => 0x8D,
        }
    }
}

/// x86-64 instruction encoder writing into a [`CodeBuffer`].
pub struct X64Encoder {
    assembler: CodeAssembler,
    encoder: Encoder,
    buffer: CodeBuffer,
    emitted: Vec<&'static str>,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        Ok(Self {
            assembler: CodeAssembler::new(64)?,
            encoder: Encoder::new(64),
            buffer: CodeBuffer::new(),
            emitted: Vec::new(),
        })
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buffer
    }

    /// Mnemonics emitted so far, in order.
    pub fn emitted(&self) -> &[&'static str] {
        &self.emitted
    }

    pub fn finish(self) -> (CodeBuffer, Vec<&'static str>) {
        (self.buffer, self.emitted)
    }

    fn gp(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }
        GP64_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn gp32(reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }
        GP32_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn xmm(reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
        if reg.bank != SIMD_BANK {
            return Err(EncodingError::InvalidRegister);
        }
        XMM_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Assemble through `f` and append the encoding to the buffer.
    fn asm<F>(&mut self, mnemonic: &'static str, f: F) -> Result<(), EncodingError>
    where
        F: FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    {
        f(&mut self.assembler)?;
        let instructions = self.assembler.instructions().to_vec();
        self.assembler.reset();
        for instruction in &instructions {
            let ip = (self.buffer.len()) as u64;
            self.encoder.encode(instruction, ip)?;
            let bytes = self.encoder.take_buffer();
            self.buffer.emit(&bytes);
        }
        log::trace!("{mnemonic} ({} bytes total)", self.buffer.len());
        self.emitted.push(mnemonic);
        Ok(())
    }

    // ==== GENERAL PURPOSE ====

    pub fn mov_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::gp(dst)?, Self::gp(src)?);
        self.asm("mov", |a| a.mov(d, s))
    }

    pub fn mov_ri(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        let d = Self::gp(dst)?;
        self.asm("mov", |a| a.mov(d, imm))
    }

    pub fn mov32_ri(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = Self::gp32(dst)?;
        self.asm("mov", |a| a.mov(d, imm))
    }

    /// `mov dst, imm64` whose immediate is the absolute address of `label`.
    pub fn mov_label_address(&mut self, dst: AsmReg, label: Label) -> Result<(), EncodingError> {
        if dst.bank != GP_BANK || dst.id > 15 {
            return Err(EncodingError::InvalidRegister);
        }
        let rex = 0x48 | (dst.id >> 3);
        let opcode = 0xB8 + (dst.id & 7);
        self.buffer.emit(&[rex, opcode]);
        let slot = self.buffer.len();
        self.buffer.emit(&[0; 8]);
        self.buffer.reference_absolute(slot, label);
        self.emitted.push("mov");
        Ok(())
    }

    pub fn add_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::gp(dst)?, Self::gp(src)?);
        self.asm("add", |a| a.add(d, s))
    }

    pub fn add_ri(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = Self::gp(dst)?;
        self.asm("add", |a| a.add(d, imm))
    }

    pub fn sub_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::gp(dst)?, Self::gp(src)?);
        self.asm("sub", |a| a.sub(d, s))
    }

    pub fn sub_ri(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = Self::gp(dst)?;
        self.asm("sub", |a| a.sub(d, imm))
    }

    pub fn and_ri(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = Self::gp(dst)?;
        self.asm("and", |a| a.and(d, imm))
    }

    pub fn neg(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let d = Self::gp(dst)?;
        self.asm("neg", |a| a.neg(d))
    }

    pub fn imul_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::gp(dst)?, Self::gp(src)?);
        self.asm("imul", |a| a.imul_2(d, s))
    }

    /// `imul dst, src, imm`
    pub fn imul_rri(&mut self, dst: AsmReg, src: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let (d, s) = (Self::gp(dst)?, Self::gp(src)?);
        self.asm("imul", |a| a.imul_3(d, s, imm))
    }

    /// `lea dst, [base + index + offset]`
    pub fn lea(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        index: Option<AsmReg>,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let (d, b) = (Self::gp(dst)?, Self::gp(base)?);
        let mem = match index {
            Some(index) => b + Self::gp(index)? + offset,
            None => b + offset,
        };
        self.asm("lea", |a| a.lea(d, mem))
    }

    pub fn cmp_rr(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let (l, r) = (Self::gp(left)?, Self::gp(right)?);
        self.asm("cmp", |a| a.cmp(l, r))
    }

    pub fn cmp_ri(&mut self, reg: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let r = Self::gp(reg)?;
        self.asm("cmp", |a| a.cmp(r, imm))
    }

    /// Sign-extending 32-bit load.
    pub fn movsxd_rm(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let (d, b) = (Self::gp(dst)?, Self::gp(base)?);
        self.asm("movsxd", |a| a.movsxd(d, dword_ptr(b + offset)))
    }

    /// Store the low 32 bits of `src`.
    pub fn mov32_mr(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let (b, s) = (Self::gp(base)?, Self::gp32(src)?);
        self.asm("mov", |a| a.mov(dword_ptr(b + offset), s))
    }

    pub fn push(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = Self::gp(reg)?;
        self.asm("push", |a| a.push(r))
    }

    pub fn pop(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = Self::gp(reg)?;
        self.asm("pop", |a| a.pop(r))
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.asm("ret", |a| a.ret())
    }

    /// `jcc rel32` to `label`, bound or not.
    pub fn jcc(&mut self, condition: JumpCondition, label: Label) -> Result<(), EncodingError> {
        self.buffer.emit(&[0x0F, condition.opcode(), 0, 0, 0, 0]);
        let slot = self.buffer.len() - 4;
        self.buffer
            .reference_relative(slot, label)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.emitted.push("jcc");
        Ok(())
    }

    // ==== SSE ====

    pub fn movaps_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm("movaps", |a| a.movaps(d, s))
    }

    pub fn movss_rm(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let (d, b) = (Self::xmm(dst)?, Self::gp(base)?);
        self.asm("movss", |a| a.movss(d, dword_ptr(b + offset)))
    }

    pub fn movss_mr(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let (b, s) = (Self::gp(base)?, Self::xmm(src)?);
        self.asm("movss", |a| a.movss(dword_ptr(b + offset), s))
    }

    /// 16-byte load, `movaps` when `aligned` else `movups`.
    pub fn load_vector(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
        aligned: bool,
    ) -> Result<(), EncodingError> {
        let (d, b) = (Self::xmm(dst)?, Self::gp(base)?);
        let mem = xmmword_ptr(b + offset);
        if aligned {
            self.asm("movaps", |a| a.movaps(d, mem))
        } else {
            self.asm("movups", |a| a.movups(d, mem))
        }
    }

    /// 16-byte store, `movaps` when `aligned` else `movups`.
    pub fn store_vector(
        &mut self,
        base: AsmReg,
        offset: i32,
        src: AsmReg,
        aligned: bool,
    ) -> Result<(), EncodingError> {
        let (b, s) = (Self::gp(base)?, Self::xmm(src)?);
        let mem = xmmword_ptr(b + offset);
        if aligned {
            self.asm("movaps", |a| a.movaps(mem, s))
        } else {
            self.asm("movups", |a| a.movups(mem, s))
        }
    }

    pub fn sse(&mut self, op: SseOp, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm(op.mnemonic(), |a| match op {
            SseOp::Addss => a.addss(d, s),
            SseOp::Subss => a.subss(d, s),
            SseOp::Mulss => a.mulss(d, s),
            SseOp::Divss => a.divss(d, s),
            SseOp::Addps => a.addps(d, s),
            SseOp::Subps => a.subps(d, s),
            SseOp::Mulps => a.mulps(d, s),
            SseOp::Divps => a.divps(d, s),
            SseOp::Paddd => a.paddd(d, s),
            SseOp::Psubd => a.psubd(d, s),
            SseOp::Pmulld => a.pmulld(d, s),
            SseOp::Andps => a.andps(d, s),
            SseOp::Orps => a.orps(d, s),
            SseOp::Andnps => a.andnps(d, s),
            SseOp::Pcmpeqd => a.pcmpeqd(d, s),
            SseOp::Pcmpgtd => a.pcmpgtd(d, s),
            SseOp::Pxor => a.pxor(d, s),
        })
    }

    /// `cmpps dst, src, predicate`
    pub fn cmpps(&mut self, dst: AsmReg, src: AsmReg, predicate: u8) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm("cmpps", |a| a.cmpps(d, s, predicate as i32))
    }

    pub fn cvtsi2ss(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::gp(src)?);
        self.asm("cvtsi2ss", |a| a.cvtsi2ss(d, s))
    }

    pub fn cvttss2si(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::gp(dst)?, Self::xmm(src)?);
        self.asm("cvttss2si", |a| a.cvttss2si(d, s))
    }

    pub fn cvtdq2ps(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm("cvtdq2ps", |a| a.cvtdq2ps(d, s))
    }

    pub fn cvttps2dq(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm("cvttps2dq", |a| a.cvttps2dq(d, s))
    }

    /// Low 32 bits of a general-purpose register into lane 0, upper lanes zeroed.
    pub fn movd_xr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::gp32(src)?);
        self.asm("movd", |a| a.movd(d, s))
    }

    pub fn pinsrd(&mut self, dst: AsmReg, src: AsmReg, lane: u8) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::gp32(src)?);
        self.asm("pinsrd", |a| a.pinsrd(d, s, lane as i32))
    }

    /// Copy lane 0 of `src` into lane `lane` of `dst`.
    pub fn insertps(&mut self, dst: AsmReg, src: AsmReg, lane: u8) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm("insertps", |a| a.insertps(d, s, ((lane & 3) << 4) as i32))
    }

    pub fn pshufd(&mut self, dst: AsmReg, src: AsmReg, order: u8) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm("pshufd", |a| a.pshufd(d, s, order as i32))
    }

    /// `dst = (dst:src) >> (8 * bytes)`
    pub fn palignr(&mut self, dst: AsmReg, src: AsmReg, bytes: u8) -> Result<(), EncodingError> {
        let (d, s) = (Self::xmm(dst)?, Self::xmm(src)?);
        self.asm("palignr", |a| a.palignr(d, s, bytes as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X64Encoder)) -> Vec<u8> {
        let mut enc = X64Encoder::new().unwrap();
        f(&mut enc);
        enc.finish().0.bytes().to_vec()
    }

    #[test]
    fn test_basic_instructions() {
        let bytes = encode(|e| {
            e.mov_rr(AsmReg::RAX, AsmReg::RCX).unwrap();
            e.ret().unwrap();
        });
        assert_eq!(bytes, vec![0x48, 0x89, 0xC8, 0xC3]);
    }

    #[test]
    fn test_sign_extending_load_and_store() {
        let bytes = encode(|e| {
            e.movsxd_rm(AsmReg::RAX, AsmReg::RCX, 8).unwrap();
            e.mov32_mr(AsmReg::RCX, 8, AsmReg::RAX).unwrap();
        });
        assert_eq!(bytes, vec![0x48, 0x63, 0x41, 0x08, 0x89, 0x41, 0x08]);
    }

    #[test]
    fn test_invalid_register_bank() {
        let mut enc = X64Encoder::new().unwrap();
        assert_eq!(
            enc.mov_rr(AsmReg::xmm(0), AsmReg::RAX),
            Err(EncodingError::InvalidRegister)
        );
        assert_eq!(
            enc.sse(SseOp::Addps, AsmReg::RAX, AsmReg::xmm(1)),
            Err(EncodingError::InvalidRegister)
        );
        assert!(enc.emitted().is_empty());
    }

    #[test]
    fn test_vector_forms() {
        let bytes = encode(|e| {
            e.load_vector(AsmReg::xmm(1), AsmReg::RDX, 0, true).unwrap();
            e.sse(SseOp::Paddd, AsmReg::xmm(1), AsmReg::xmm(2)).unwrap();
        });
        // movaps xmm1, [rdx]; paddd xmm1, xmm2
        assert_eq!(bytes, vec![0x0F, 0x28, 0x0A, 0x66, 0x0F, 0xFE, 0xCA]);
    }

    #[test]
    fn test_absolute_address_move() {
        let mut enc = X64Encoder::new().unwrap();
        let label = enc.buffer_mut().create_label();
        enc.mov_label_address(AsmReg::R11, label).unwrap();
        enc.buffer_mut().bind(label).unwrap();
        let (buffer, emitted) = enc.finish();
        assert_eq!(&buffer.bytes()[..2], &[0x49, 0xBB]);
        assert_eq!(buffer.relocations().unwrap(), vec![(2, 10)]);
        assert_eq!(emitted, vec!["mov"]);
    }

    #[test]
    fn test_loop_back_edge() {
        let mut enc = X64Encoder::new().unwrap();
        let top = enc.buffer_mut().create_label();
        enc.buffer_mut().bind(top).unwrap();
        enc.add_ri(AsmReg::R12, 4).unwrap();
        enc.cmp_ri(AsmReg::R12, 12).unwrap();
        enc.jcc(JumpCondition::LessEqual, top).unwrap();
        let bytes = enc.finish().0.bytes().to_vec();
        let len = bytes.len() as i32;
        assert_eq!(&bytes[bytes.len() - 6..bytes.len() - 4], &[0x0F, 0x8E]);
        assert_eq!(&bytes[bytes.len() - 4..], &(-len).to_le_bytes());
    }
}
