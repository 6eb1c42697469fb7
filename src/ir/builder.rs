// This module implements IrBuilder, the single-owner arena that holds every IR node of a
// compilation. It replaces process-global node registries: literal interning tables, the
// free list and the builder statistics are fields of the builder, so independent
// compilations never share state. Nodes are reference counted. Every input edge holds one
// reference and every handle returned to a caller holds one; releasing the last reference
// frees the slot, detaches the node from its inputs' consumer lists, drops it from the
// literal tables and cascades into the inputs. The make() factory is the only way to build
// operator nodes: it checks arity and types, inserts casts and scalar broadcasts, then tries
// constant folding, algebraic rewrites and finally CSE against the consumers of the first
// input before allocating a fresh node and running static analysis on it.

//! Hash-consing IR arena and node factory.

use hashbrown::HashMap;
use std::ops::{Index, IndexMut};

use super::analysis;
use super::fold;
use super::node::{Imm, IrNode, NodeId, Op, Type, VarInfo};
use super::rewrite;
use crate::core::error::{CompileError, CompileResult};
use crate::core::interval::{Interval, SteppedInterval};

struct Slot {
    generation: u32,
    node: Option<IrNode>,
}

/// Counters describing the work done by the factory.
#[derive(Debug, Default, Clone)]
pub struct BuilderStats {
    pub nodes_created: usize,
    pub folds: usize,
    pub rewrites: usize,
    pub cse_hits: usize,
}

/// Arena of IR nodes with literal interning and CSE.
///
/// Every `NodeId` returned by a constructor is an owned reference that the
/// caller gives back with [`IrBuilder::release`] once done with it.
pub struct IrBuilder {
    slots: Vec<Slot>,
    free: Vec<u32>,
    int_literals: HashMap<i64, NodeId>,
    float_literals: HashMap<u32, NodeId>,
    bool_literals: [Option<NodeId>; 2],
    live: usize,
    pub(crate) stats: BuilderStats,
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IrBuilder {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            int_literals: HashMap::new(),
            float_literals: HashMap::new(),
            bool_literals: [None, None],
            live: 0,
            stats: BuilderStats::default(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&IrNode> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut IrNode> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of nodes currently allocated.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn stats(&self) -> &BuilderStats {
        &self.stats
    }

    /// Take another owned reference to `id`.
    pub fn retain(&mut self, id: NodeId) -> NodeId {
        self[id].refs += 1;
        id
    }

    /// Drop one owned reference, freeing every node that becomes unreachable.
    pub fn release(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let node = &mut self[id];
            debug_assert!(node.refs > 0, "releasing dead node {id}");
            node.refs -= 1;
            if node.refs > 0 {
                continue;
            }

            let slot = &mut self.slots[id.index()];
            let Some(node) = slot.node.take() else {
                continue;
            };
            debug_assert!(
                node.consumers.is_empty(),
                "{id} freed with live consumers {:?}",
                node.consumers
            );
            self.free.push(id.index);
            self.live -= 1;
            self.forget_literal(id, &node);
            log::trace!("freed {id} {}", node.op.name());

            for input in node.inputs {
                let consumers = &mut self[input].consumers;
                if let Some(pos) = consumers.iter().position(|&c| c == id) {
                    consumers.remove(pos);
                }
                pending.push(input);
            }
        }
    }

    fn forget_literal(&mut self, id: NodeId, node: &IrNode) {
        if !node.is_scalar_const() {
            return;
        }
        match (node.ty, node.imm) {
            (Type::Int, Imm::Int(v)) => {
                if self.int_literals.get(&v) == Some(&id) {
                    self.int_literals.remove(&v);
                }
            }
            (Type::Float, Imm::Float(v)) => {
                if self.float_literals.get(&v.to_bits()) == Some(&id) {
                    self.float_literals.remove(&v.to_bits());
                }
            }
            (Type::Bool, imm) => {
                let slot = &mut self.bool_literals[(imm.int() != 0) as usize];
                if *slot == Some(id) {
                    *slot = None;
                }
            }
            _ => {}
        }
    }

    fn alloc(&mut self, node: IrNode) -> NodeId {
        let inputs = node.inputs.clone();
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        };
        for input in inputs {
            let input = &mut self[input];
            input.refs += 1;
            input.consumers.push(id);
        }
        self.live += 1;
        self.stats.nodes_created += 1;
        id
    }

    /// The interned Int literal `value`.
    pub fn int(&mut self, value: i64) -> NodeId {
        if let Some(&id) = self.int_literals.get(&value) {
            return self.retain(id);
        }
        let mut node = IrNode::new(Op::Const, Type::Int, 1, Imm::Int(value), Vec::new());
        node.interval = SteppedInterval::constant(value);
        let id = self.alloc(node);
        self.int_literals.insert(value, id);
        id
    }

    /// The interned Float literal `value`.
    pub fn float(&mut self, value: f32) -> NodeId {
        if let Some(&id) = self.float_literals.get(&value.to_bits()) {
            return self.retain(id);
        }
        let node = IrNode::new(Op::Const, Type::Float, 1, Imm::Float(value), Vec::new());
        let id = self.alloc(node);
        self.float_literals.insert(value.to_bits(), id);
        id
    }

    /// The interned Bool literal `value`.
    pub fn bool(&mut self, value: bool) -> NodeId {
        if let Some(id) = self.bool_literals[value as usize] {
            return self.retain(id);
        }
        let mut node = IrNode::new(Op::Const, Type::Bool, 1, Imm::Int(value as i64), Vec::new());
        node.interval = SteppedInterval::constant(value as i64);
        let id = self.alloc(node);
        self.bool_literals[value as usize] = Some(id);
        id
    }

    /// Interned Int literal closest to `target` whose distance fits a 32-bit displacement.
    pub fn literal_near(&self, target: i64) -> Option<i64> {
        self.int_literals
            .keys()
            .copied()
            .filter_map(|k| {
                let diff = target.checked_sub(k)?;
                i32::try_from(diff).ok().map(|d| (d.unsigned_abs(), k))
            })
            .min()
            .map(|(_, k)| k)
    }

    /// A fresh loop variable ranging over `[min, max]`.
    pub fn variable(&mut self, name: &str, min: i64, max: i64) -> NodeId {
        let mut node = IrNode::new(Op::Variable, Type::Int, 1, Imm::None, Vec::new());
        node.interval = SteppedInterval::range(Interval::new(min, max));
        node.constant = false;
        node.var = Some(Box::new(VarInfo::new(name)));
        let id = self.alloc(node);
        log::trace!("variable {name} = {id} in [{min}, {max}]");
        id
    }

    pub fn var_info(&self, id: NodeId) -> Option<&VarInfo> {
        self.get(id)?.var.as_deref()
    }

    pub fn var_info_mut(&mut self, id: NodeId) -> Option<&mut VarInfo> {
        self.get_mut(id)?.var.as_deref_mut()
    }

    /// Replace a node's analysis result.
    pub fn set_interval(&mut self, id: NodeId, interval: SteppedInterval) {
        self[id].interval = interval;
    }

    /// Short description used in logs and diagnostics.
    pub fn describe(&self, id: NodeId) -> String {
        match self.get(id) {
            Some(node) => {
                let mut text = format!("{id} {}", node.op.name());
                if let Some(var) = &node.var {
                    text.push_str(&format!(" {}", var.name));
                }
                match node.imm {
                    Imm::Int(v) => text.push_str(&format!(" {v}")),
                    Imm::Float(v) => text.push_str(&format!(" {v:?}")),
                    Imm::None => {}
                }
                text.push_str(&format!(" {:?}x{} L{}", node.ty, node.width, node.level));
                text
            }
            None => format!("{id} <dead>"),
        }
    }

    /// Build (or find) the node `op(inputs)` with immediate `imm`.
    ///
    /// Inputs are borrowed; the returned handle is owned by the caller.
    pub fn make(&mut self, op: Op, inputs: &[NodeId], imm: Imm) -> CompileResult<NodeId> {
        match op {
            Op::Const => {
                return match imm {
                    Imm::Int(v) => Ok(self.int(v)),
                    Imm::Float(v) => Ok(self.float(v)),
                    Imm::None => Err(CompileError::type_error("Const", "literal without value")),
                }
            }
            Op::Variable => {
                return Err(CompileError::type_error(
                    "Variable",
                    "variables are created with IrBuilder::variable",
                ))
            }
            _ => {}
        }
        if let Some(arity) = op.arity() {
            if inputs.len() != arity {
                return Err(CompileError::type_error(
                    op.name(),
                    format!("expected {arity} inputs, got {}", inputs.len()),
                ));
            }
        }
        if let Some(&stale) = inputs.iter().find(|&&id| !self.is_live(id)) {
            return Err(CompileError::type_error(
                op.name(),
                format!("input {stale} is not a live node"),
            ));
        }

        let imm = match op {
            Op::Load(_) | Op::LoadVector(_) | Op::Store | Op::StoreVector | Op::SelectVector => {
                Imm::Int(imm.int())
            }
            Op::PlusImm | Op::TimesImm => imm,
            _ => Imm::None,
        };
        let (ty, coerced) = self.coerce(op, inputs, imm)?;
        let result = self.make_typed(op, ty, &coerced, imm);
        for id in coerced {
            self.release(id);
        }
        result
    }

    /// Factory core for inputs that already have the operator's types.
    pub(crate) fn make_typed(
        &mut self,
        op: Op,
        ty: Type,
        inputs: &[NodeId],
        imm: Imm,
    ) -> CompileResult<NodeId> {
        if let Some(literal) = fold::fold(self, op, ty, inputs, imm) {
            self.stats.folds += 1;
            return Ok(literal);
        }
        if let Some(rewritten) = rewrite::rewrite(self, op, ty, inputs, imm)? {
            self.stats.rewrites += 1;
            return Ok(rewritten);
        }
        Ok(self.intern(op, ty, inputs, imm))
    }

    fn intern(&mut self, op: Op, ty: Type, inputs: &[NodeId], imm: Imm) -> NodeId {
        if let Some(&first) = inputs.first() {
            let found = self[first].consumers.iter().copied().find(|&c| {
                let n = &self[c];
                n.op == op && n.ty == ty && n.imm == imm && n.inputs == inputs
            });
            if let Some(existing) = found {
                self.stats.cse_hits += 1;
                analysis::analyze(self, existing);
                return self.retain(existing);
            }
        }

        let width = match op {
            Op::LoadVector(_) | Op::StoreVector | Op::Vector | Op::SelectVector => 4,
            Op::Load(_) | Op::Store | Op::NoOp => 1,
            _ => inputs.iter().map(|&i| self[i].width).max().unwrap_or(1),
        };
        let mut node = IrNode::new(op, ty, width, imm, inputs.to_vec());
        node.level = inputs.iter().map(|&i| self[i].level).max().unwrap_or(0);
        node.constant = inputs.iter().all(|&i| self[i].constant);
        let id = self.alloc(node);
        analysis::analyze(self, id);
        log::trace!("new {}", self.describe(id));
        id
    }

    /// Check types and arity, returning the result type and owned, converted inputs.
    fn coerce(&mut self, op: Op, inputs: &[NodeId], imm: Imm) -> CompileResult<(Type, Vec<NodeId>)> {
        let types: Vec<Type> = inputs.iter().map(|&i| self[i].ty).collect();
        let widths: Vec<u8> = inputs.iter().map(|&i| self[i].width).collect();
        let any = |t: Type| types.contains(&t);

        match op {
            Op::Plus | Op::Minus | Op::Times => {
                let ty = if any(Type::Float) { Type::Float } else { Type::Int };
                let cast = self.cast_all(inputs, ty)?;
                Ok((ty, self.broadcast(cast)?))
            }
            Op::Divide => {
                let cast = self.cast_all(inputs, Type::Float)?;
                Ok((Type::Float, self.broadcast(cast)?))
            }
            op if op.is_comparison() => {
                let common = if any(Type::Float) { Type::Float } else { Type::Int };
                let cast = self.cast_all(inputs, common)?;
                Ok((Type::Bool, self.broadcast(cast)?))
            }
            Op::And | Op::Or | Op::Nand => {
                let ty = match (types[0], types[1]) {
                    (a, b) if a == b => a,
                    (Type::Bool, other) | (other, Type::Bool) => other,
                    (a, b) => {
                        return Err(CompileError::type_error(
                            op.name(),
                            format!("cannot mix {a:?} and {b:?} bitwise"),
                        ))
                    }
                };
                let owned = inputs.iter().map(|&i| self.retain(i)).collect();
                Ok((ty, self.broadcast(owned)?))
            }
            Op::Load(ty) | Op::LoadVector(ty) => {
                if ty == Type::Bool {
                    return Err(CompileError::type_error(op.name(), "cannot load Bool"));
                }
                self.check_address(op, inputs[0])?;
                Ok((ty, vec![self.retain(inputs[0])]))
            }
            Op::Store | Op::StoreVector => {
                self.check_address(op, inputs[0])?;
                let want = if op == Op::Store { 1 } else { 4 };
                if widths[1] != want {
                    return Err(CompileError::type_error(
                        op.name(),
                        format!("value has width {}, expected {want}", widths[1]),
                    ));
                }
                if types[1] == Type::Bool {
                    return Err(CompileError::type_error(op.name(), "cannot store Bool"));
                }
                let owned = vec![self.retain(inputs[0]), self.retain(inputs[1])];
                Ok((types[1], owned))
            }
            Op::PlusImm | Op::TimesImm => {
                if !matches!(imm, Imm::Int(_)) {
                    return Err(CompileError::type_error(op.name(), "needs an Int immediate"));
                }
                if types[0] == Type::Float {
                    return Err(CompileError::type_error(op.name(), "Int operator applied to Float"));
                }
                Ok((Type::Int, self.cast_all(inputs, Type::Int)?))
            }
            Op::IntToFloat => {
                if types[0] == Type::Float {
                    return Err(CompileError::type_error(op.name(), "input is already Float"));
                }
                Ok((Type::Float, self.cast_all(inputs, Type::Int)?))
            }
            Op::FloatToInt => {
                if types[0] != Type::Float {
                    return Err(CompileError::type_error(op.name(), "input must be Float"));
                }
                Ok((Type::Int, vec![self.retain(inputs[0])]))
            }
            Op::Vector => {
                if widths.iter().any(|&w| w != 1) {
                    return Err(CompileError::type_error(op.name(), "lanes must be scalars"));
                }
                let ty = if any(Type::Float) {
                    Type::Float
                } else if any(Type::Int) {
                    Type::Int
                } else {
                    Type::Bool
                };
                Ok((ty, self.cast_all(inputs, ty)?))
            }
            Op::SelectVector => {
                if widths != [4, 4] || types[0] != types[1] {
                    return Err(CompileError::type_error(
                        op.name(),
                        "needs two vectors of the same type",
                    ));
                }
                if !matches!(imm, Imm::Int(0..=3)) {
                    return Err(CompileError::type_error(op.name(), "lane offset must be 0..=3"));
                }
                let owned = inputs.iter().map(|&i| self.retain(i)).collect();
                Ok((types[0], owned))
            }
            Op::NoOp => {
                let owned = inputs.iter().map(|&i| self.retain(i)).collect();
                Ok((Type::Int, owned))
            }
            Op::Const | Op::Variable => Err(CompileError::type_error(op.name(), "not an operator")),
            _ => Err(CompileError::type_error(op.name(), "no coercion rule")),
        }
    }

    fn check_address(&self, op: Op, address: NodeId) -> CompileResult<()> {
        let node = &self[address];
        if node.ty != Type::Int || node.width != 1 {
            return Err(CompileError::type_error(
                op.name(),
                format!("address must be a scalar Int, got {:?}x{}", node.ty, node.width),
            ));
        }
        Ok(())
    }

    fn cast_all(&mut self, inputs: &[NodeId], ty: Type) -> CompileResult<Vec<NodeId>> {
        let mut owned = Vec::with_capacity(inputs.len());
        for &input in inputs {
            match super::transform::as_type(self, input, ty) {
                Ok(id) => owned.push(id),
                Err(e) => {
                    for id in owned {
                        self.release(id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(owned)
    }

    /// Widen scalar operands of an element-wise operator to match a vector operand.
    fn broadcast(&mut self, owned: Vec<NodeId>) -> CompileResult<Vec<NodeId>> {
        if owned.iter().all(|&i| self[i].width == 1) || owned.iter().all(|&i| self[i].width == 4) {
            return Ok(owned);
        }
        let mut out = Vec::with_capacity(owned.len());
        let mut failure = None;
        for id in owned {
            if self[id].width == 4 || failure.is_some() {
                out.push(id);
                continue;
            }
            match self.make(Op::Vector, &[id, id, id, id], Imm::None) {
                Ok(splat) => {
                    self.release(id);
                    out.push(splat);
                }
                Err(e) => {
                    out.push(id);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => {
                for id in out {
                    self.release(id);
                }
                Err(e)
            }
            None => Ok(out),
        }
    }
}

impl Index<NodeId> for IrBuilder {
    type Output = IrNode;

    fn index(&self, id: NodeId) -> &IrNode {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node id {id}"),
        }
    }
}

impl IndexMut<NodeId> for IrBuilder {
    fn index_mut(&mut self, id: NodeId) -> &mut IrNode {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("stale node id {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals_are_interned() {
        let mut b = IrBuilder::new();
        let a = b.int(42);
        let c = b.int(42);
        assert_eq!(a, c);
        assert_eq!(b[a].reference_count(), 2);

        let f1 = b.float(1.5);
        let f2 = b.float(1.5);
        assert_eq!(f1, f2);
        assert_ne!(b.float(0.0), b.float(-0.0));
    }

    #[test]
    fn test_release_frees_literal() {
        let mut b = IrBuilder::new();
        let a = b.int(7);
        let before = b.live_count();
        b.release(a);
        assert_eq!(b.live_count(), before - 1);
        assert!(!b.is_live(a));

        let fresh = b.int(7);
        assert_ne!(fresh, a);
        assert!(b.is_live(fresh));
    }

    #[test]
    fn test_cse_reuses_nodes() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let y = b.variable("y", 0, 10);
        let p1 = b.make(Op::Plus, &[x, y], Imm::None).unwrap();
        let p2 = b.make(Op::Plus, &[x, y], Imm::None).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(b.stats().cse_hits, 1);
        assert_eq!(b[x].consumers, vec![p1]);
    }

    #[test]
    fn test_release_cascades_through_inputs() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let k = b.int(1 << 40);
        let sum = b.make(Op::Plus, &[x, k], Imm::None).unwrap();
        b.release(k);
        assert!(b.is_live(k));
        b.release(sum);
        assert!(!b.is_live(sum));
        assert!(!b.is_live(k));
        assert!(b[x].consumers.is_empty());
    }

    #[test]
    fn test_type_errors() {
        let mut b = IrBuilder::new();
        let f = b.float(2.0);
        let x = b.variable("x", 0, 3);
        let err = b.make(Op::Load(Type::Int), &[f], Imm::None).unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
        let err = b.make(Op::Plus, &[x], Imm::None).unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
        let err = b.make(Op::TimesImm, &[f], Imm::Int(3)).unwrap_err();
        assert!(matches!(err, CompileError::Type { .. }));
    }

    #[test]
    fn test_promotion_inserts_casts() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        let half = b.float(0.5);
        let sum = b.make(Op::Plus, &[x, half], Imm::None).unwrap();
        assert_eq!(b[sum].ty, Type::Float);
        let cast = b[sum].inputs[0];
        assert_eq!(b[cast].op, Op::IntToFloat);

        let cmp = b.make(Op::Lt, &[x, half], Imm::None).unwrap();
        assert_eq!(b[cmp].ty, Type::Bool);
    }

    #[test]
    fn test_literal_near() {
        let mut b = IrBuilder::new();
        let base = 0x7f00_0000_1000i64;
        let _k = b.int(base);
        assert_eq!(b.literal_near(base + 64), Some(base));
        assert_eq!(b.literal_near(base + (1 << 40)), None);
    }
}
