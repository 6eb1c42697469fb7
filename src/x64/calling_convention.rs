// This module describes the register conventions the generated kernels live under. A kernel
// is a zero-argument function, so the only ABI obligations are preserving the callee-saved
// registers and keeping the stack aligned. System V treats RBX and R12-R15 as callee-saved;
// Win64 additionally treats RSI, RDI and XMM6-XMM15 as callee-saved. One general-purpose and
// one SIMD register (R11 and XMM15) are reserved as code generator scratch and never handed
// to the allocator. Loop induction variables prefer callee-saved registers so that most
// kernels with shallow nests only touch registers the prologue already has to save.
// FrameLayout works out which registers a given body forces the prologue to save and how
// large the XMM save area is.

//! x86-64 register conventions for generated kernels.

use crate::core::config::Abi;
use crate::core::register_file::{AsmReg, RegBitSet, RegClass, GP_BANK, SIMD_BANK};

/// General-purpose scratch register of the code generator.
pub const SCRATCH_GP: AsmReg = AsmReg::R11;

/// SIMD scratch register of the code generator.
pub const SCRATCH_SIMD: AsmReg = AsmReg::XMM15;

/// Candidate registers for loop induction variables, in preference order.
const LOOP_REGISTERS: [AsmReg; 10] = [
    AsmReg::R12,
    AsmReg::R13,
    AsmReg::R14,
    AsmReg::R15,
    AsmReg::RBX,
    AsmReg::RSI,
    AsmReg::RDI,
    AsmReg::gp(8),
    AsmReg::gp(9),
    AsmReg::gp(10),
];

/// Register conventions of one target ABI.
#[derive(Debug, Clone, Copy)]
pub struct CallingConvention {
    pub abi: Abi,
    callee_saved: RegBitSet,
}

impl CallingConvention {
    pub fn new(abi: Abi) -> Self {
        let mut callee_saved = RegBitSet::from_regs(&[
            AsmReg::RBX,
            AsmReg::RBP,
            AsmReg::R12,
            AsmReg::R13,
            AsmReg::R14,
            AsmReg::R15,
        ]);
        if abi == Abi::Win64 {
            callee_saved.set(AsmReg::RSI);
            callee_saved.set(AsmReg::RDI);
            for id in 6..16 {
                callee_saved.set(AsmReg::xmm(id));
            }
        }
        Self { abi, callee_saved }
    }

    pub fn callee_saved(&self) -> &RegBitSet {
        &self.callee_saved
    }

    pub fn is_callee_saved(&self, reg: AsmReg) -> bool {
        self.callee_saved.contains(reg)
    }

    /// Registers of `class` the allocator may hand out.
    pub fn allocatable(&self, class: RegClass) -> RegBitSet {
        match class {
            RegClass::General => {
                let mut set = RegBitSet::all_in_bank(GP_BANK, 16);
                set.clear(AsmReg::RSP);
                set.clear(AsmReg::RBP);
                set.clear(SCRATCH_GP);
                set
            }
            RegClass::Simd => {
                let mut set = RegBitSet::all_in_bank(SIMD_BANK, 16);
                set.clear(SCRATCH_SIMD);
                set
            }
        }
    }

    /// Registers for `count` loop induction variables.
    pub fn loop_registers(&self, count: usize) -> Option<&'static [AsmReg]> {
        LOOP_REGISTERS.get(..count)
    }
}

/// Registers a kernel body forces the prologue to preserve.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    /// Pushed after `rbp`, popped in reverse.
    pub saved_gp: Vec<AsmReg>,
    /// Stored below the aligned stack pointer.
    pub saved_xmm: Vec<AsmReg>,
}

impl FrameLayout {
    pub fn new(cc: &CallingConvention, used: &RegBitSet) -> Self {
        let mut used = *used;
        if cc.abi == Abi::Win64 {
            used.set(SCRATCH_SIMD);
        }
        let mut layout = FrameLayout::default();
        for reg in used.iter() {
            if !cc.is_callee_saved(reg) || reg == AsmReg::RBP {
                continue;
            }
            match reg.class() {
                RegClass::General => layout.saved_gp.push(reg),
                RegClass::Simd => layout.saved_xmm.push(reg),
            }
        }
        layout
    }

    /// Bytes reserved for the XMM save area, a multiple of 16.
    pub fn xmm_area(&self) -> i32 {
        16 * self.saved_xmm.len() as i32
    }
}
