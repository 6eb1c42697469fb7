//! Whole-expression transforms built on the factory.
//!
//! `optimize` and `substitute` rebuild an expression bottom-up through
//! [`IrBuilder::make`] so every fold and rewrite gets another chance to fire;
//! `assign_level` moves a node (and everything that consumes it) deeper into
//! the loop nest; `as_type` inserts explicit casts.

use hashbrown::HashMap;

use super::builder::IrBuilder;
use super::node::{Imm, NodeId, Op, Type};
use super::sum;
use crate::core::error::CompileResult;

/// Memo table whose values are owned references, released in one go.
struct Memo<K> {
    map: HashMap<K, NodeId>,
}

impl<K: std::hash::Hash + Eq> Memo<K> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    fn get(&self, builder: &mut IrBuilder, key: &K) -> Option<NodeId> {
        let id = *self.map.get(key)?;
        Some(builder.retain(id))
    }

    fn insert(&mut self, builder: &mut IrBuilder, key: K, id: NodeId) {
        if let Some(old) = self.map.insert(key, builder.retain(id)) {
            builder.release(old);
        }
    }

    fn finish(self, builder: &mut IrBuilder) {
        for (_, id) in self.map {
            builder.release(id);
        }
    }
}

/// Convert `id` to `ty`, returning an owned reference.
///
/// Int and Float convert through `IntToFloat`/`FloatToInt`; Bool becomes a
/// number by masking the literal 1 and a number becomes Bool by comparing
/// against zero.
pub fn as_type(builder: &mut IrBuilder, id: NodeId, ty: Type) -> CompileResult<NodeId> {
    let from = builder[id].ty;
    if from == ty {
        return Ok(builder.retain(id));
    }
    let (op, literal) = match (from, ty) {
        (Type::Int, Type::Float) => return builder.make(Op::IntToFloat, &[id], Imm::None),
        (Type::Float, Type::Int) => return builder.make(Op::FloatToInt, &[id], Imm::None),
        (Type::Bool, Type::Int) => (Op::And, builder.int(1)),
        (Type::Bool, Type::Float) => (Op::And, builder.float(1.0)),
        (Type::Int, Type::Bool) => (Op::Neq, builder.int(0)),
        (Type::Float, Type::Bool) => (Op::Neq, builder.float(0.0)),
        _ => return Ok(builder.retain(id)),
    };
    let result = builder.make(op, &[id, literal], Imm::None);
    builder.release(literal);
    result
}

/// Raise the loop level of `id` to at least `level`, propagating to consumers.
///
/// Levels only ever go up.
pub fn assign_level(builder: &mut IrBuilder, id: NodeId, level: u8) {
    let mut pending = vec![id];
    while let Some(id) = pending.pop() {
        let node = &mut builder[id];
        if node.level >= level {
            continue;
        }
        node.level = level;
        pending.extend(node.consumers.iter().copied());
    }
}

/// Rebuild `root` through the factory and rebalance its sums.
pub fn optimize(builder: &mut IrBuilder, root: NodeId) -> CompileResult<NodeId> {
    let mut memo = Memo::new();
    let result = optimize_node(builder, root, false, &mut memo);
    memo.finish(builder);
    result
}

fn is_sum(op: Op) -> bool {
    matches!(op, Op::Plus | Op::Minus | Op::PlusImm)
}

fn optimize_node(
    builder: &mut IrBuilder,
    id: NodeId,
    under_sum: bool,
    memo: &mut Memo<(NodeId, bool)>,
) -> CompileResult<NodeId> {
    if let Some(done) = memo.get(builder, &(id, under_sum)) {
        return Ok(done);
    }
    let (op, imm, inputs) = {
        let node = &builder[id];
        (node.op, node.imm, node.inputs.clone())
    };
    if inputs.is_empty() {
        return Ok(builder.retain(id));
    }

    let mut rebuilt_inputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        match optimize_node(builder, input, is_sum(op), memo) {
            Ok(r) => rebuilt_inputs.push(r),
            Err(e) => {
                release_all(builder, rebuilt_inputs);
                return Err(e);
            }
        }
    }
    let rebuilt = builder.make(op, &rebuilt_inputs, imm);
    release_all(builder, rebuilt_inputs);
    let mut result = rebuilt?;

    if !under_sum && is_sum(builder[result].op) {
        let balanced = sum::rebalance_sum(builder, result);
        builder.release(result);
        result = balanced?;
    }
    memo.insert(builder, (id, under_sum), result);
    Ok(result)
}

/// Replace every occurrence of `old` inside `root` by `new` and rebuild.
pub fn substitute(
    builder: &mut IrBuilder,
    root: NodeId,
    old: NodeId,
    new: NodeId,
) -> CompileResult<NodeId> {
    let mut memo = Memo::new();
    let result = substitute_node(builder, root, old, new, &mut memo);
    memo.finish(builder);
    result
}

fn substitute_node(
    builder: &mut IrBuilder,
    id: NodeId,
    old: NodeId,
    new: NodeId,
    memo: &mut Memo<NodeId>,
) -> CompileResult<NodeId> {
    if id == old {
        return Ok(builder.retain(new));
    }
    if let Some(done) = memo.get(builder, &id) {
        return Ok(done);
    }
    let (op, imm, inputs) = {
        let node = &builder[id];
        (node.op, node.imm, node.inputs.clone())
    };
    if inputs.is_empty() {
        return Ok(builder.retain(id));
    }

    let mut rebuilt_inputs = Vec::with_capacity(inputs.len());
    for &input in &inputs {
        match substitute_node(builder, input, old, new, memo) {
            Ok(r) => rebuilt_inputs.push(r),
            Err(e) => {
                release_all(builder, rebuilt_inputs);
                return Err(e);
            }
        }
    }
    let result = if rebuilt_inputs == inputs {
        Ok(builder.retain(id))
    } else {
        builder.make(op, &rebuilt_inputs, imm)
    };
    release_all(builder, rebuilt_inputs);
    let result = result?;
    memo.insert(builder, id, result);
    Ok(result)
}

pub(crate) fn release_all(builder: &mut IrBuilder, ids: Vec<NodeId>) {
    for id in ids {
        builder.release(id);
    }
}

/// Every node reachable from `roots`, inputs before consumers.
pub fn post_order(builder: &IrBuilder, roots: &[NodeId]) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut visited = hashbrown::HashSet::new();
    let mut stack: Vec<(NodeId, usize)> = Vec::new();
    for &root in roots {
        if !visited.insert(root) {
            continue;
        }
        stack.push((root, 0));
        while let Some(top) = stack.last_mut() {
            let (id, next) = *top;
            let inputs = &builder[id].inputs;
            if next < inputs.len() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::eval::{evaluate, Env};

    #[test]
    fn test_assign_level_propagates() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let y = b.variable("y", 0, 10);
        let sum = b.make(Op::Plus, &[x, y], Imm::None).unwrap();
        let prod = b.make(Op::TimesImm, &[sum], Imm::Int(3)).unwrap();

        assign_level(&mut b, y, 2);
        assign_level(&mut b, x, 1);
        assert_eq!(b[sum].level, 2);
        assert_eq!(b[prod].level, 2);
        assign_level(&mut b, x, 3);
        for id in [x, y, sum, prod] {
            let node = &b[id];
            let max_input = node.inputs.iter().map(|&i| b[i].level).max().unwrap_or(0);
            assert!(node.level >= max_input);
        }
        assert_eq!(b[prod].level, 3);
        assign_level(&mut b, prod, 1);
        assert_eq!(b[prod].level, 3);
    }

    #[test]
    fn test_as_type_table() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", -5, 5);
        let f = as_type(&mut b, x, Type::Float).unwrap();
        assert_eq!(b[f].op, Op::IntToFloat);
        let back = as_type(&mut b, f, Type::Int).unwrap();
        assert_eq!(b[back].op, Op::FloatToInt);
        let flag = as_type(&mut b, x, Type::Bool).unwrap();
        assert_eq!(b[flag].op, Op::Neq);
        let num = as_type(&mut b, flag, Type::Int).unwrap();
        assert_eq!(b[num].op, Op::And);

        let mut env = Env::default();
        for v in -5..=5 {
            env.bind(x, v);
            let out = evaluate(&b, num, &env).unwrap();
            assert_eq!(out.lane(0).as_int(), (v != 0) as i64);
        }
    }

    #[test]
    fn test_substitute_and_optimize() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 100);
        let inner = b.make(Op::PlusImm, &[x], Imm::Int(2)).unwrap();
        let expr = b.make(Op::TimesImm, &[inner], Imm::Int(3)).unwrap();
        let shifted_var = b.make(Op::PlusImm, &[x], Imm::Int(1)).unwrap();
        let shifted = substitute(&mut b, expr, x, shifted_var).unwrap();
        let opt = optimize(&mut b, shifted).unwrap();

        let mut env = Env::default();
        for v in [0, 1, 5, 42, 100] {
            env.bind(x, v);
            let got = evaluate(&b, opt, &env).unwrap().lane(0).as_int();
            assert_eq!(got, (v + 1 + 2) * 3);
        }
    }

    #[test]
    fn test_substitute_without_occurrence_is_identity() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let y = b.variable("y", 0, 10);
        let expr = b.make(Op::TimesImm, &[x], Imm::Int(4)).unwrap();
        let same = substitute(&mut b, expr, y, x).unwrap();
        assert_eq!(same, expr);
    }

    #[test]
    fn test_post_order_visits_inputs_first() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let y = b.variable("y", 0, 10);
        let sum = b.make(Op::Plus, &[x, y], Imm::None).unwrap();
        let prod = b.make(Op::Times, &[sum, x], Imm::None).unwrap();
        let order = post_order(&b, &[prod]);
        assert_eq!(order.len(), 4);
        let pos = |id| order.iter().position(|&n| n == id).unwrap();
        assert!(pos(x) < pos(sum));
        assert!(pos(y) < pos(sum));
        assert!(pos(sum) < pos(prod));
    }
}
