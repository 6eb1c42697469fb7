//! Register identifiers and register sets.
//!
//! Registers are named by bank and index: bank 0 holds the sixteen x86-64
//! general-purpose registers in hardware encoding order, bank 1 the sixteen
//! SSE registers. [`RegBitSet`] tracks sets of them as one bit mask per bank.

use std::fmt;

/// Number of register banks (general-purpose and SIMD).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Registers per bank on x86-64.
pub const REGISTERS_PER_BANK: u8 = 16;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Bank index of the general-purpose registers.
pub const GP_BANK: RegBank = 0;

/// Bank index of the XMM registers.
pub const SIMD_BANK: RegBank = 1;

const GP_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

/// Register class a value needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// Scalar Int and Bool values.
    General,
    /// Float scalars and every 4-wide value.
    Simd,
}

impl RegClass {
    pub fn bank(self) -> RegBank {
        match self {
            RegClass::General => GP_BANK,
            RegClass::Simd => SIMD_BANK,
        }
    }
}

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RBX: AsmReg = AsmReg::gp(3);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R11: AsmReg = AsmReg::gp(11);
    pub const R12: AsmReg = AsmReg::gp(12);
    pub const R13: AsmReg = AsmReg::gp(13);
    pub const R14: AsmReg = AsmReg::gp(14);
    pub const R15: AsmReg = AsmReg::gp(15);
    pub const XMM15: AsmReg = AsmReg::xmm(15);

    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self { bank: GP_BANK, id }
    }

    pub const fn xmm(id: RegId) -> Self {
        Self {
            bank: SIMD_BANK,
            id,
        }
    }

    pub fn class(&self) -> RegClass {
        if self.bank == GP_BANK {
            RegClass::General
        } else {
            RegClass::Simd
        }
    }

    /// Get the linear register index for array indexing.
    pub fn linear_index(&self) -> usize {
        (self.bank as usize) * REGISTERS_PER_BANK as usize + (self.id as usize)
    }

    /// Create from linear index.
    pub fn from_linear_index(index: usize) -> Self {
        let per_bank = REGISTERS_PER_BANK as usize;
        Self {
            bank: (index / per_bank) as RegBank,
            id: (index % per_bank) as RegId,
        }
    }
}

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank {
            GP_BANK => match GP_NAMES.get(self.id as usize) {
                Some(name) => write!(f, "{name}"),
                None => write!(f, "gp{}", self.id),
            },
            _ => write!(f, "xmm{}", self.id),
        }
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    /// Create register set with the first `count` registers of a bank.
    pub fn all_in_bank(bank: RegBank, count: u8) -> Self {
        let mut set = Self::new();
        if (bank as usize) < MAX_REGISTER_BANKS {
            set.banks[bank as usize] = if count >= 64 {
                u64::MAX
            } else {
                (1u64 << count) - 1
            };
        }
        set
    }

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    /// Set union with another set.
    pub fn union(&mut self, other: &RegBitSet) {
        for i in 0..MAX_REGISTER_BANKS {
            self.banks[i] |= other.banks[i];
        }
    }

    /// Remove every register of `other`.
    pub fn subtract(&mut self, other: &RegBitSet) {
        for i in 0..MAX_REGISTER_BANKS {
            self.banks[i] &= !other.banks[i];
        }
    }

    /// Find first set register in the given bank, excluding specified registers.
    pub fn find_first_in_bank(&self, bank: RegBank, exclude: &RegBitSet) -> Option<RegId> {
        if bank as usize >= MAX_REGISTER_BANKS {
            return None;
        }

        let available = self.banks[bank as usize] & !exclude.banks[bank as usize];
        if available == 0 {
            return None;
        }

        Some(available.trailing_zeros() as RegId)
    }

    /// Count number of set registers in bank.
    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        if bank as usize >= MAX_REGISTER_BANKS {
            return 0;
        }
        self.banks[bank as usize].count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.iter().all(|&b| b == 0)
    }

    /// Registers in the set, general-purpose first, each bank in id order.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        (0..MAX_REGISTER_BANKS).flat_map(move |bank| {
            let mask = self.banks[bank];
            (0..64u8)
                .filter(move |id| mask & (1u64 << id) != 0)
                .map(move |id| AsmReg::new(bank as RegBank, id))
        })
    }
}

impl fmt::Display for RegBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, reg) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{reg}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg1 = AsmReg::gp(5);
        let reg2 = AsmReg::xmm(3);

        assert!(!set.contains(reg1));
        set.set(reg1);
        set.set(reg2);
        assert!(set.contains(reg1));
        assert!(set.contains(reg2));
        assert_eq!(set.count_in_bank(GP_BANK), 1);

        set.clear(reg1);
        assert!(!set.contains(reg1));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![reg2]);
    }

    #[test]
    fn test_find_first_excluding() {
        let all = RegBitSet::all_in_bank(GP_BANK, 16);
        let reserved = RegBitSet::from_regs(&[AsmReg::RAX, AsmReg::RCX]);
        assert_eq!(all.find_first_in_bank(GP_BANK, &reserved), Some(2));
        assert_eq!(all.find_first_in_bank(SIMD_BANK, &reserved), None);
    }

    #[test]
    fn test_register_names() {
        assert_eq!(AsmReg::R12.to_string(), "r12");
        assert_eq!(AsmReg::XMM15.to_string(), "xmm15");
        assert_eq!(AsmReg::from_linear_index(AsmReg::xmm(2).linear_index()), AsmReg::xmm(2));
        let set = RegBitSet::from_regs(&[AsmReg::RDX, AsmReg::xmm(1)]);
        assert_eq!(set.to_string(), "{rdx, xmm1}");
    }
}
