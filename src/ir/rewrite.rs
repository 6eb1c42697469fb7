// This module holds the algebraic rewrites the node factory applies after constant folding
// fails. Each rule looks at the requested operator and the shape of its (already typed)
// inputs and, when it matches, builds the replacement through the factory so further rules
// can fire on the result. Rules cover immediate forms (PlusImm/TimesImm identities, chains
// and distribution over a constant addend), Times by a 32-bit constant becoming TimesImm,
// nested products regrouped by loop level, division by a lower-level node becoming a
// multiplication by its reciprocal, pushing a Vector of four like-shaped lanes down into
// one vector operator, merging four adjacent scalar loads or stores into one vector access,
// folding constant address offsets into load/store displacements, and splitting a vector
// load that is word-aligned but not 16-byte aligned into two aligned loads plus a lane
// select. A rule returns None when it does not apply; the factory then interns the node.

//! Algebraic rewrites applied by the node factory.

use super::builder::IrBuilder;
use super::node::{Imm, NodeId, Op, Type};
use crate::core::error::CompileResult;

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

fn int_literal(b: &IrBuilder, id: NodeId) -> Option<i64> {
    let node = &b[id];
    (node.is_scalar_const() && node.ty == Type::Int).then(|| node.ival())
}

fn float_literal(b: &IrBuilder, id: NodeId) -> Option<f32> {
    let node = &b[id];
    (node.is_scalar_const() && node.ty == Type::Float).then(|| node.fval())
}

/// `op(x, literal)` with a temporary Int literal.
fn with_int(b: &mut IrBuilder, op: Op, x: NodeId, value: i64) -> CompileResult<NodeId> {
    let k = b.int(value);
    let result = b.make(op, &[x, k], Imm::None);
    b.release(k);
    result
}

fn with_float(b: &mut IrBuilder, op: Op, x: NodeId, value: f32) -> CompileResult<NodeId> {
    let k = b.float(value);
    let result = b.make(op, &[x, k], Imm::None);
    b.release(k);
    result
}

/// `x + value`, as `PlusImm` when the constant fits.
fn add_constant(b: &mut IrBuilder, x: NodeId, value: i64) -> CompileResult<NodeId> {
    if fits_i32(value) {
        b.make(Op::PlusImm, &[x], Imm::Int(value))
    } else {
        with_int(b, Op::Plus, x, value)
    }
}

/// Build `outer(inner(x))`-style two-step results, releasing the intermediate.
fn then<F>(b: &mut IrBuilder, first: CompileResult<NodeId>, f: F) -> CompileResult<NodeId>
where
    F: FnOnce(&mut IrBuilder, NodeId) -> CompileResult<NodeId>,
{
    let first = first?;
    let result = f(b, first);
    b.release(first);
    result
}

/// Try every rule for `op(inputs)`; `Some` carries an owned replacement.
pub(crate) fn rewrite(
    b: &mut IrBuilder,
    op: Op,
    ty: Type,
    inputs: &[NodeId],
    imm: Imm,
) -> CompileResult<Option<NodeId>> {
    let result = match op {
        Op::PlusImm => plus_imm(b, inputs[0], imm.int())?,
        Op::TimesImm => times_imm(b, inputs[0], imm.int())?,
        Op::Plus => {
            if int_literal(b, inputs[1]) == Some(0) {
                Some(b.retain(inputs[0]))
            } else if int_literal(b, inputs[0]) == Some(0) {
                Some(b.retain(inputs[1]))
            } else {
                None
            }
        }
        Op::Minus => (int_literal(b, inputs[1]) == Some(0)).then(|| b.retain(inputs[0])),
        Op::Times => times(b, ty, inputs[0], inputs[1])?,
        Op::Divide => divide(b, inputs[0], inputs[1])?,
        Op::Vector => vector(b, inputs)?,
        Op::Load(_) | Op::LoadVector(_) | Op::Store | Op::StoreVector => {
            memory(b, op, inputs, imm.int())?
        }
        Op::SelectVector if imm.int() == 0 => Some(b.retain(inputs[0])),
        _ => None,
    };
    if let Some(id) = result {
        log::trace!("rewrote {} into {}", op.name(), b.describe(id));
    }
    Ok(result)
}

fn plus_imm(b: &mut IrBuilder, x: NodeId, c: i64) -> CompileResult<Option<NodeId>> {
    if c == 0 {
        return Ok(Some(b.retain(x)));
    }
    if !fits_i32(c) {
        return with_int(b, Op::Plus, x, c).map(Some);
    }
    let node = &b[x];
    if node.op == Op::PlusImm {
        if let Some(total) = node.ival().checked_add(c).filter(|&t| fits_i32(t)) {
            let inner = node.inputs[0];
            return b.make(Op::PlusImm, &[inner], Imm::Int(total)).map(Some);
        }
    }
    Ok(None)
}

fn times_imm(b: &mut IrBuilder, x: NodeId, c: i64) -> CompileResult<Option<NodeId>> {
    if c == 1 {
        return Ok(Some(b.retain(x)));
    }
    if c == 0 {
        let zero = b.int(0);
        if b[x].width == 1 {
            return Ok(Some(zero));
        }
        let splat = b.make(Op::Vector, &[zero, zero, zero, zero], Imm::None);
        b.release(zero);
        return splat.map(Some);
    }
    if !fits_i32(c) {
        return with_int(b, Op::Times, x, c).map(Some);
    }

    let (op, imm, inputs) = {
        let node = &b[x];
        (node.op, node.ival(), node.inputs.clone())
    };
    match op {
        Op::TimesImm => match imm.checked_mul(c).filter(|&p| fits_i32(p)) {
            Some(product) => b.make(Op::TimesImm, &[inputs[0]], Imm::Int(product)).map(Some),
            None => Ok(None),
        },
        // (y + a) * c  =>  y*c + a*c
        Op::PlusImm => match imm.checked_mul(c) {
            Some(shift) => {
                let scaled = b.make(Op::TimesImm, &[inputs[0]], Imm::Int(c));
                then(b, scaled, |b, t| add_constant(b, t, shift)).map(Some)
            }
            None => Ok(None),
        },
        Op::Plus | Op::Minus if b[x].width == 1 => {
            let (other, addend) = match (int_literal(b, inputs[0]), int_literal(b, inputs[1])) {
                (_, Some(a)) if op == Op::Minus => (inputs[0], a.checked_neg()),
                (_, Some(a)) => (inputs[0], Some(a)),
                (Some(a), None) if op == Op::Plus => (inputs[1], Some(a)),
                _ => return Ok(None),
            };
            match addend.and_then(|a| a.checked_mul(c)) {
                Some(shift) => {
                    let scaled = b.make(Op::TimesImm, &[other], Imm::Int(c));
                    then(b, scaled, |b, t| add_constant(b, t, shift)).map(Some)
                }
                None => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

fn times(b: &mut IrBuilder, ty: Type, a: NodeId, c: NodeId) -> CompileResult<Option<NodeId>> {
    for (x, k) in [(a, c), (c, a)] {
        if ty == Type::Int {
            if let Some(v) = int_literal(b, k).filter(|&v| fits_i32(v)) {
                return b.make(Op::TimesImm, &[x], Imm::Int(v)).map(Some);
            }
        }
        if ty == Type::Float {
            if let Some(v) = float_literal(b, k) {
                if v == 1.0 {
                    return Ok(Some(b.retain(x)));
                }
                if let Some(r) = distribute_float(b, x, v)? {
                    return Ok(Some(r));
                }
            }
        }
    }

    // Group the two lowest-level factors so their product can be hoisted.
    for (inner, other) in [(a, c), (c, a)] {
        let node = &b[inner];
        if node.op != Op::Times || node.ty != ty || node.width != b[other].width {
            continue;
        }
        let (p, q) = (node.inputs[0], node.inputs[1]);
        let (lo, hi) = if b[p].level <= b[q].level { (p, q) } else { (q, p) };
        if b[other].level < b[hi].level {
            let grouped = b.make(Op::Times, &[lo, other], Imm::None);
            return then(b, grouped, |b, g| b.make(Op::Times, &[g, hi], Imm::None)).map(Some);
        }
    }
    Ok(None)
}

/// `(y ± a) * k` for Float literals `a`, `k`.
fn distribute_float(b: &mut IrBuilder, x: NodeId, k: f32) -> CompileResult<Option<NodeId>> {
    let (op, inputs) = {
        let node = &b[x];
        (node.op, node.inputs.clone())
    };
    if !matches!(op, Op::Plus | Op::Minus) || b[x].width != 1 {
        return Ok(None);
    }
    let (y, a) = match (float_literal(b, inputs[0]), float_literal(b, inputs[1])) {
        (_, Some(a)) => (inputs[0], a),
        (Some(a), None) if op == Op::Plus => (inputs[1], a),
        _ => return Ok(None),
    };
    let scaled = with_float(b, Op::Times, y, k);
    then(b, scaled, |b, t| with_float(b, op, t, a * k)).map(Some)
}

fn divide(b: &mut IrBuilder, a: NodeId, d: NodeId) -> CompileResult<Option<NodeId>> {
    if b[d].level >= b[a].level {
        return Ok(None);
    }
    let one = b.float(1.0);
    let reciprocal = b.make(Op::Divide, &[one, d], Imm::None);
    b.release(one);
    then(b, reciprocal, |b, r| b.make(Op::Times, &[a, r], Imm::None)).map(Some)
}

fn vector(b: &mut IrBuilder, lanes: &[NodeId]) -> CompileResult<Option<NodeId>> {
    if lanes.iter().all(|&l| l == lanes[0]) {
        return Ok(None);
    }
    let shapes: Vec<(Op, Imm, u8, Vec<NodeId>)> = lanes
        .iter()
        .map(|&l| {
            let n = &b[l];
            (n.op, n.imm, n.width, n.inputs.clone())
        })
        .collect();
    let (op, imm, _, first_inputs) = &shapes[0];
    let (op, imm) = (*op, *imm);
    let same_op = shapes.iter().all(|s| s.0 == op && s.2 == 1);
    if !same_op {
        return Ok(None);
    }
    let same_address = shapes.iter().all(|s| s.3.first() == first_inputs.first());
    let contiguous = shapes
        .iter()
        .enumerate()
        .all(|(k, s)| s.1.int() == imm.int() + 4 * k as i64);

    match op {
        Op::Load(ty) if same_address && contiguous => b
            .make(Op::LoadVector(ty), &[first_inputs[0]], imm)
            .map(Some),
        Op::Store if same_address && contiguous => {
            let values: Vec<NodeId> = shapes.iter().map(|s| s.3[1]).collect();
            let packed = b.make(Op::Vector, &values, Imm::None);
            let address = first_inputs[0];
            then(b, packed, |b, v| b.make(Op::StoreVector, &[address, v], imm)).map(Some)
        }
        Op::Const
        | Op::Variable
        | Op::Load(_)
        | Op::LoadVector(_)
        | Op::Store
        | Op::StoreVector
        | Op::Vector
        | Op::SelectVector
        | Op::NoOp => Ok(None),
        _ => {
            if !shapes.iter().all(|s| s.1 == imm && s.3.len() == first_inputs.len()) {
                return Ok(None);
            }
            let mut packed = Vec::with_capacity(first_inputs.len());
            for j in 0..first_inputs.len() {
                let column: Vec<NodeId> = shapes.iter().map(|s| s.3[j]).collect();
                match b.make(Op::Vector, &column, Imm::None) {
                    Ok(v) => packed.push(v),
                    Err(e) => {
                        super::transform::release_all(b, packed);
                        return Err(e);
                    }
                }
            }
            let result = b.make(op, &packed, imm);
            super::transform::release_all(b, packed);
            result.map(Some)
        }
    }
}

fn memory(b: &mut IrBuilder, op: Op, inputs: &[NodeId], offset: i64) -> CompileResult<Option<NodeId>> {
    let address = inputs[0];
    let (addr_op, addr_imm, addr_inputs) = {
        let node = &b[address];
        (node.op, node.ival(), node.inputs.clone())
    };
    let folded = match addr_op {
        Op::PlusImm => Some((addr_inputs[0], addr_imm)),
        Op::Plus => match (int_literal(b, addr_inputs[0]), int_literal(b, addr_inputs[1])) {
            (_, Some(c)) => Some((addr_inputs[0], c)),
            (Some(c), None) => Some((addr_inputs[1], c)),
            _ => None,
        },
        Op::Minus => int_literal(b, addr_inputs[1])
            .and_then(|c| c.checked_neg())
            .map(|c| (addr_inputs[0], c)),
        _ => None,
    };
    if let Some((base, delta)) = folded {
        if let Some(total) = offset.checked_add(delta).filter(|&t| fits_i32(t)) {
            let mut rebuilt = inputs.to_vec();
            rebuilt[0] = base;
            return b.make(op, &rebuilt, Imm::Int(total)).map(Some);
        }
    }

    if let Op::LoadVector(ty) = op {
        let effective = b[address].interval.offset(offset);
        if let Some(residue) = effective.residue(16) {
            let lo = offset - residue;
            if residue != 0 && residue % 4 == 0 && fits_i32(lo) && fits_i32(lo + 16) {
                let low = b.make(Op::LoadVector(ty), &[address], Imm::Int(lo))?;
                let high = b.make(Op::LoadVector(ty), &[address], Imm::Int(lo + 16));
                let high = match high {
                    Ok(h) => h,
                    Err(e) => {
                        b.release(low);
                        return Err(e);
                    }
                };
                let select = b.make(Op::SelectVector, &[low, high], Imm::Int(residue / 4));
                b.release(low);
                b.release(high);
                return select.map(Some);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::interval::{Interval, SteppedInterval};
    use crate::ir::eval::{evaluate, Env};
    use crate::ir::transform::{assign_level, optimize};

    #[test]
    fn test_distribute_plus_imm() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", -50, 50);
        let p = b.make(Op::PlusImm, &[x], Imm::Int(2)).unwrap();
        let lhs = b.make(Op::TimesImm, &[p], Imm::Int(3)).unwrap();
        let lhs = optimize(&mut b, lhs).unwrap();

        let t = b.make(Op::TimesImm, &[x], Imm::Int(3)).unwrap();
        let rhs = b.make(Op::PlusImm, &[t], Imm::Int(6)).unwrap();
        assert_eq!(lhs, rhs);

        let mut env = Env::default();
        for v in [-50, -7, 0, 1, 13, 50] {
            env.bind(x, v);
            let l = evaluate(&b, lhs, &env).unwrap().lane(0).as_int();
            let r = evaluate(&b, rhs, &env).unwrap().lane(0).as_int();
            assert_eq!(l, r);
            assert_eq!(l, (v + 2) * 3);
        }
    }

    #[test]
    fn test_times_by_constant_becomes_times_imm() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let five = b.int(5);
        let t = b.make(Op::Times, &[five, x], Imm::None).unwrap();
        assert_eq!(b[t].op, Op::TimesImm);
        assert_eq!(b[t].ival(), 5);
        assert_eq!(b[t].inputs, vec![x]);

        let one = b.int(1);
        assert_eq!(b.make(Op::Times, &[x, one], Imm::None).unwrap(), x);
    }

    #[test]
    fn test_plus_imm_chain_merges() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let a = b.make(Op::PlusImm, &[x], Imm::Int(3)).unwrap();
        let c = b.make(Op::PlusImm, &[a], Imm::Int(-3)).unwrap();
        assert_eq!(c, x);
        let d = b.make(Op::PlusImm, &[a], Imm::Int(4)).unwrap();
        assert_eq!(b[d].ival(), 7);
        assert_eq!(b[d].inputs, vec![x]);
    }

    #[test]
    fn test_divide_by_invariant_uses_reciprocal() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 1, 10);
        assign_level(&mut b, x, 1);
        let xf = b.make(Op::IntToFloat, &[x], Imm::None).unwrap();
        let four = b.float(4.0);
        let q = b.make(Op::Divide, &[xf, four], Imm::None).unwrap();
        assert_eq!(b[q].op, Op::Times);
        let quarter = b[q].inputs[1];
        assert_eq!(float_literal(&b, quarter), Some(0.25));
    }

    #[test]
    fn test_nested_times_groups_invariants() {
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 10);
        let y = b.variable("y", 0, 10);
        let z = b.variable("z", 0, 10);
        assign_level(&mut b, x, 2);
        assign_level(&mut b, y, 1);
        let xy = b.make(Op::Times, &[x, y], Imm::None).unwrap();
        let xyz = b.make(Op::Times, &[xy, z], Imm::None).unwrap();
        // z (level 0) joins y (level 1) before x (level 2)
        let inner = b[xyz].inputs[0];
        assert_eq!(b[inner].inputs, vec![y, z]);
        assert_eq!(b[xyz].inputs[1], x);
    }

    #[test]
    fn test_vector_of_loads_becomes_load_vector() {
        let mut b = IrBuilder::new();
        let p = b.variable("p", 0, 1 << 20);
        let lanes: Vec<NodeId> = (0..4)
            .map(|k| b.make(Op::Load(Type::Int), &[p], Imm::Int(8 + 4 * k)).unwrap())
            .collect();
        let v = b.make(Op::Vector, &lanes, Imm::None).unwrap();
        assert_eq!(b[v].op, Op::LoadVector(Type::Int));
        assert_eq!(b[v].ival(), 8);
        assert_eq!(b[v].width, 4);
    }

    #[test]
    fn test_vector_pushdown() {
        let mut b = IrBuilder::new();
        let p = b.variable("p", 0, 1 << 20);
        let lanes: Vec<NodeId> = (0..4)
            .map(|k| {
                let load = b.make(Op::Load(Type::Int), &[p], Imm::Int(4 * k)).unwrap();
                b.make(Op::TimesImm, &[load], Imm::Int(2)).unwrap()
            })
            .collect();
        let v = b.make(Op::Vector, &lanes, Imm::None).unwrap();
        assert_eq!(b[v].op, Op::TimesImm);
        assert_eq!(b[v].width, 4);
        let inner = b[v].inputs[0];
        assert_eq!(b[inner].op, Op::LoadVector(Type::Int));
    }

    #[test]
    fn test_load_folds_constant_offset() {
        let mut b = IrBuilder::new();
        let p = b.variable("p", 0, 1 << 20);
        let addr = b.make(Op::PlusImm, &[p], Imm::Int(12)).unwrap();
        let load = b.make(Op::Load(Type::Float), &[addr], Imm::Int(4)).unwrap();
        assert_eq!(b[load].inputs, vec![p]);
        assert_eq!(b[load].ival(), 16);

        let k = b.int(-8);
        let addr = b.make(Op::Plus, &[k, p], Imm::None).unwrap();
        let load = b.make(Op::Load(Type::Int), &[addr], Imm::None).unwrap();
        assert_eq!(b[load].inputs, vec![p]);
        assert_eq!(b[load].ival(), -8);
    }

    #[test]
    fn test_unaligned_load_vector_is_split() {
        let mut b = IrBuilder::new();
        let p = b.variable("p", 0, 1 << 20);
        b.set_interval(
            p,
            SteppedInterval::with_congruence(Interval::new(0, 1 << 20), 16, 0),
        );
        let v = b.make(Op::LoadVector(Type::Int), &[p], Imm::Int(8)).unwrap();
        assert_eq!(b[v].op, Op::SelectVector);
        assert_eq!(b[v].ival(), 2);
        let (lo, hi) = (b[v].inputs[0], b[v].inputs[1]);
        assert_eq!(b[lo].ival(), 0);
        assert_eq!(b[hi].ival(), 16);

        let aligned = b.make(Op::LoadVector(Type::Int), &[p], Imm::Int(32)).unwrap();
        assert_eq!(b[aligned].op, Op::LoadVector(Type::Int));
    }
}
