// This module implements the register allocator for one planned definition. There is no stack
// spilling: every value-producing node gets a physical register for its whole lifetime, chosen
// greedily while walking the DAG inputs-first. Before taking a register the allocator checks
// every node that held it earlier in the schedule and only reuses it when the previous values
// can no longer be read. A holder computed in an outer loop may only be overwritten if all of
// its consumers sit at its own level, a holder at the same level only once all its consumers
// have been scheduled, and a holder in an inner loop only if the new value is itself consumed
// entirely at its own (outer) level. The preference order keeps results in the register of an
// input whenever possible so the two-operand x86 forms need no extra moves. Loop induction
// variables arrive with fixed registers and are never reassigned. The result is a schedule per
// loop level plus the registers each level clobbers and those whose values cross levels.

//! Greedy register assignment without spilling.

use bumpalo::collections::Vec as BumpVec;
use hashbrown::{HashMap, HashSet};

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, RegBitSet, RegClass, MAX_REGISTER_BANKS, REGISTERS_PER_BANK};
use crate::core::session::CompilationSession;
use crate::ir::builder::IrBuilder;
use crate::ir::node::{NodeId, Op};
use crate::x64::calling_convention::CallingConvention;

const REGISTER_COUNT: usize = MAX_REGISTER_BANKS * REGISTERS_PER_BANK as usize;

/// Outcome of register assignment for one definition.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Evaluation order per loop level, index 0 being the invariant code.
    pub order: Vec<Vec<NodeId>>,
    /// Registers written by the code of each level.
    pub clobbered: Vec<RegBitSet>,
    /// Registers holding a value consumed at a different level than it is produced.
    pub cross_level: RegBitSet,
    /// Every register written anywhere, loop registers included.
    pub used: RegBitSet,
}

/// 4-wide constants served from the constant pool instead of registers.
pub fn is_pooled(builder: &IrBuilder, id: NodeId) -> bool {
    let node = &builder[id];
    node.op == Op::Vector && node.inputs.iter().all(|&i| builder[i].is_scalar_const())
}

struct Allocator<'a> {
    builder: &'a mut IrBuilder,
    cc: &'a CallingConvention,
    reserved: RegBitSet,
    users: HashMap<NodeId, Vec<NodeId>>,
    scheduled: HashSet<NodeId>,
    holders: Vec<Vec<NodeId>>,
    used: RegBitSet,
}

/// Assign a register to every value in the subgraph below `roots`.
///
/// `reserved` holds registers the caller needs untouched, typically the
/// loop induction registers. Variables must already carry their register.
pub fn assign(
    builder: &mut IrBuilder,
    session: &CompilationSession<'_>,
    cc: &CallingConvention,
    roots: &[NodeId],
    reserved: &RegBitSet,
) -> CompileResult<Allocation> {
    let nodes = schedule_order(builder, session, roots);
    let depth = nodes.iter().map(|&n| builder[n].level as usize).max().unwrap_or(0);

    let mut users: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for &id in nodes.iter() {
        if is_pooled(builder, id) {
            continue;
        }
        for &input in &builder[id].inputs {
            let list = users.entry(input).or_default();
            if !list.contains(&id) {
                list.push(id);
            }
        }
    }

    let mut alloc = Allocator {
        builder,
        cc,
        reserved: *reserved,
        users,
        scheduled: HashSet::new(),
        holders: vec![Vec::new(); REGISTER_COUNT],
        used: RegBitSet::new(),
    };
    let mut order = vec![Vec::new(); depth + 1];

    for &id in nodes.iter() {
        let node = &mut alloc.builder[id];
        if node.op == Op::Variable {
            let Some(reg) = node.reg else {
                return Err(CompileError::codegen(format!(
                    "loop variable {id} has no induction register"
                )));
            };
            alloc.holders[reg.linear_index()].push(id);
            alloc.used.set(reg);
            alloc.scheduled.insert(id);
        } else {
            node.reg = None;
        }
    }

    for &id in nodes.iter() {
        if alloc.scheduled.contains(&id) {
            continue;
        }
        let level = alloc.builder[id].level as usize;
        if let Some(class) = alloc.builder[id].reg_class() {
            let reg = alloc.choose(id, class)?;
            log::trace!("{} -> {reg}", alloc.builder.describe(id));
            alloc.builder[id].reg = Some(reg);
            alloc.holders[reg.linear_index()].push(id);
            alloc.used.set(reg);
        }
        alloc.scheduled.insert(id);
        order[level].push(id);
    }

    let mut clobbered = vec![RegBitSet::new(); depth + 1];
    let mut cross_level = RegBitSet::new();
    for (level, ids) in order.iter().enumerate() {
        for &id in ids {
            let Some(reg) = alloc.builder[id].reg else {
                continue;
            };
            clobbered[level].set(reg);
            let crosses = alloc
                .users
                .get(&id)
                .is_some_and(|us| us.iter().any(|&u| alloc.builder[u].level as usize != level));
            if crosses {
                cross_level.set(reg);
            }
        }
    }

    session.record_registers_used(alloc.used.iter().count());
    log::debug!(
        "allocated {} nodes over {} levels using {}",
        nodes.len(),
        depth + 1,
        alloc.used
    );
    Ok(Allocation {
        order,
        clobbered,
        cross_level,
        used: alloc.used,
    })
}

/// Inputs before consumers; lanes of pooled constants are not visited.
fn schedule_order<'s>(
    builder: &IrBuilder,
    session: &CompilationSession<'s>,
    roots: &[NodeId],
) -> BumpVec<'s, NodeId> {
    let arena = session.arena();
    let mut order = BumpVec::new_in(arena);
    let mut visited = HashSet::new();
    let mut stack: BumpVec<'s, (NodeId, usize)> = BumpVec::new_in(arena);
    for &root in roots {
        if !visited.insert(root) {
            continue;
        }
        stack.push((root, 0));
        while let Some(top) = stack.last_mut() {
            let (id, next) = *top;
            let inputs = &builder[id].inputs;
            if next < inputs.len() && !is_pooled(builder, id) {
                top.1 += 1;
                let input = inputs[next];
                if visited.insert(input) {
                    stack.push((input, 0));
                }
            } else {
                order.push(id);
                stack.pop();
            }
        }
    }
    order
}

impl Allocator<'_> {
    fn consumers(&self, id: NodeId) -> &[NodeId] {
        self.users.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `id` may overwrite `reg` without destroying a value still needed.
    fn can_take(&self, id: NodeId, reg: AsmReg) -> bool {
        let level = self.builder[id].level;
        self.holders[reg.linear_index()].iter().all(|&h| {
            let holder = &self.builder[h];
            if holder.op == Op::Variable {
                return false;
            }
            let at_own_level = |n: NodeId| self.builder[n].level == holder.level;
            if holder.level < level {
                self.consumers(h).iter().all(|&c| at_own_level(c))
            } else if holder.level == level {
                self.consumers(h)
                    .iter()
                    .all(|&c| at_own_level(c) && (c == id || self.scheduled.contains(&c)))
            } else {
                self.consumers(id).iter().all(|&c| self.builder[c].level == level)
            }
        })
    }

    fn input_register(&self, id: NodeId, index: usize, class: RegClass) -> Option<AsmReg> {
        let input = *self.builder[id].inputs.get(index)?;
        let reg = self.builder[input].reg?;
        (reg.class() == class && !self.reserved.contains(reg)).then_some(reg)
    }

    fn choose(&self, id: NodeId, class: RegClass) -> CompileResult<AsmReg> {
        let node = &self.builder[id];
        let same_level = |index: usize| {
            node.inputs
                .get(index)
                .is_some_and(|&i| self.builder[i].level == node.level)
        };

        // result in the primary input's register
        if let Some(reg) = self.input_register(id, 0, class) {
            if same_level(0) && self.can_take(id, reg) {
                return Ok(reg);
            }
        }
        if node.op.is_commutative() {
            if let Some(reg) = self.input_register(id, 1, class) {
                if same_level(1) && self.can_take(id, reg) {
                    return Ok(reg);
                }
            }
        }

        let allocatable = self.cc.allocatable(class);
        // a register used before whose latest value lives at this level or deeper
        for reg in self.used.iter() {
            if !allocatable.contains(reg) || self.reserved.contains(reg) {
                continue;
            }
            let latest = self.holders[reg.linear_index()].last();
            if latest.is_some_and(|&h| self.builder[h].level >= node.level) && self.can_take(id, reg)
            {
                return Ok(reg);
            }
        }

        let mut taken = self.used;
        taken.union(&self.reserved);
        if let Some(reg) = allocatable.find_first_in_bank(class.bank(), &taken) {
            return Ok(AsmReg::new(class.bank(), reg));
        }

        for index in 1..node.inputs.len() {
            if let Some(reg) = self.input_register(id, index, class) {
                if self.can_take(id, reg) {
                    return Ok(reg);
                }
            }
        }

        Err(CompileError::RegisterExhaustion {
            node: self.builder.describe(id),
            table: self.render_table(),
        })
    }

    fn render_table(&self) -> String {
        let mut table = String::new();
        for (index, holders) in self.holders.iter().enumerate() {
            if holders.is_empty() {
                continue;
            }
            let reg = AsmReg::from_linear_index(index);
            let names: Vec<String> = holders.iter().map(|&h| self.builder.describe(h)).collect();
            let mark = if self.reserved.contains(reg) { " (reserved)" } else { "" };
            table.push_str(&format!("  {reg}{mark}: {}\n", names.join(", ")));
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Abi;
    use crate::ir::node::{Imm, Type};
    use crate::ir::transform::assign_level;
    use bumpalo::Bump;

    fn bind(b: &mut IrBuilder, var: NodeId, level: u8, reg: AsmReg) {
        assign_level(b, var, level);
        b[var].reg = Some(reg);
    }

    #[test]
    fn test_chain_reuses_input_register() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let cc = CallingConvention::new(Abi::SysV);
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        bind(&mut b, x, 1, AsmReg::R12);
        let base = b.int(0x5555_0000_0000);
        let addr = b.make(Op::Plus, &[base, x], Imm::None).unwrap();
        let load = b.make(Op::Load(Type::Int), &[addr], Imm::Int(0)).unwrap();
        let doubled = b.make(Op::TimesImm, &[load], Imm::Int(2)).unwrap();
        let store = b.make(Op::Store, &[addr, doubled], Imm::Int(0)).unwrap();

        let reserved = RegBitSet::from_regs(&[AsmReg::R12]);
        let alloc = assign(&mut b, &session, &cc, &[store], &reserved).unwrap();
        assert_eq!(alloc.order[0], vec![base]);
        assert_eq!(alloc.order[1], vec![addr, load, doubled, store]);
        // addr is still read by the store, so the load needs its own register
        assert_ne!(b[load].reg, b[addr].reg);
        assert_eq!(b[doubled].reg, b[load].reg);
        assert!(alloc.cross_level.contains(b[base].reg.unwrap()));
        assert!(!alloc.used.contains(AsmReg::R11));
    }

    #[test]
    fn test_missing_loop_register_is_an_error() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let cc = CallingConvention::new(Abi::SysV);
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        let sum = b.make(Op::PlusImm, &[x], Imm::Int(1)).unwrap();
        let err = assign(&mut b, &session, &cc, &[sum], &RegBitSet::new()).unwrap_err();
        assert!(matches!(err, CompileError::CodeGeneration { .. }));
    }

    #[test]
    fn test_exhaustion_reports_table() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let cc = CallingConvention::new(Abi::SysV);
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        bind(&mut b, x, 1, AsmReg::R12);
        // sixteen Int values that are all live until the final sum
        let mut terms = Vec::new();
        for k in 1..=16 {
            let scaled = b.make(Op::TimesImm, &[x], Imm::Int(k + 1)).unwrap();
            terms.push(scaled);
        }
        // right-nested so every term is evaluated before the first product
        let mut acc = terms[0];
        for &t in &terms[1..] {
            acc = b.make(Op::Times, &[t, acc], Imm::None).unwrap();
        }
        let err = assign(&mut b, &session, &cc, &[acc], &RegBitSet::from_regs(&[AsmReg::R12]))
            .unwrap_err();
        match err {
            CompileError::RegisterExhaustion { table, .. } => assert!(table.contains("r12 (reserved)")),
            other => panic!("unexpected error {other}"),
        }
    }
}
