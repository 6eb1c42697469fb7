//! Loop-level-aware sum rebalancing.
//!
//! A tree of `Plus`, `Minus` and `PlusImm` is flattened into signed terms and
//! rebuilt so that the terms with the lowest loop level are added first. The
//! partial sums over invariant terms then sit at low levels and get hoisted
//! out of the inner loops. Integer constants are split into a 64-bit base
//! added innermost and a 32-bit tail added last through `PlusImm`, which loads
//! and stores absorb into their displacement.

use super::builder::IrBuilder;
use super::node::{Imm, NodeId, Op, Type};
use crate::core::error::CompileResult;

/// Flattened form of a sum.
#[derive(Debug, Clone)]
pub struct SumTerms {
    pub ty: Type,
    pub width: u8,
    /// Non-constant terms with their integer coefficients.
    pub terms: Vec<(NodeId, i64)>,
    pub int_constant: i64,
    pub float_constant: f32,
}

impl SumTerms {
    fn add_term(&mut self, id: NodeId, coefficient: i64) {
        match self.terms.iter_mut().find(|(t, _)| *t == id) {
            Some((_, c)) => *c += coefficient,
            None => self.terms.push((id, coefficient)),
        }
    }
}

/// Flatten the sum rooted at `root`.
pub fn collect_sum(builder: &IrBuilder, root: NodeId) -> SumTerms {
    let node = &builder[root];
    let mut sum = SumTerms {
        ty: node.ty,
        width: node.width,
        terms: Vec::new(),
        int_constant: 0,
        float_constant: 0.0,
    };
    collect(builder, root, 1, &mut sum);
    sum.terms.retain(|&(_, c)| c != 0);
    sum
}

fn collect(builder: &IrBuilder, id: NodeId, sign: i64, sum: &mut SumTerms) {
    let node = &builder[id];
    if node.ty != sum.ty || node.width != sum.width {
        sum.add_term(id, sign);
        return;
    }
    match node.op {
        Op::Plus => {
            collect(builder, node.inputs[0], sign, sum);
            collect(builder, node.inputs[1], sign, sum);
        }
        Op::Minus => {
            collect(builder, node.inputs[0], sign, sum);
            collect(builder, node.inputs[1], -sign, sum);
        }
        Op::PlusImm => {
            collect(builder, node.inputs[0], sign, sum);
            sum.int_constant = sum.int_constant.wrapping_add(sign.wrapping_mul(node.ival()));
        }
        Op::Const if node.ty == Type::Int => {
            sum.int_constant = sum.int_constant.wrapping_add(sign.wrapping_mul(node.ival()));
        }
        Op::Const if node.ty == Type::Float => {
            sum.float_constant += sign as f32 * node.fval();
        }
        _ => sum.add_term(id, sign),
    }
}

/// Split an Int constant into a 64-bit base and a 32-bit displacement.
///
/// The base reuses an existing literal when one lies within 32 bits of the
/// target, so neighbouring addresses share one base register.
pub fn split_constant(builder: &IrBuilder, constant: i64) -> (i64, i64) {
    if i32::try_from(constant).is_ok() {
        return (0, constant);
    }
    match builder.literal_near(constant) {
        Some(base) => (base, constant - base),
        None => (constant, 0),
    }
}

/// Rebuild the sum rooted at `root` innermost-first by loop level.
pub fn rebalance_sum(builder: &mut IrBuilder, root: NodeId) -> CompileResult<NodeId> {
    let mut sum = collect_sum(builder, root);
    sum.terms
        .sort_by_key(|&(id, coefficient)| (builder[id].level, coefficient < 0));

    let int_scalar = sum.ty == Type::Int && sum.width == 1;
    if sum.terms.is_empty() {
        return Ok(match sum.ty {
            Type::Float => builder.float(sum.float_constant),
            _ => builder.int(sum.int_constant),
        });
    }

    // vector lanes are 32-bit, so the whole constant becomes the tail
    let (inner, outer) = match sum.ty {
        Type::Int if int_scalar => split_constant(builder, sum.int_constant),
        Type::Int => (0, sum.int_constant),
        _ => (0, 0),
    };

    let mut acc = None;
    if inner != 0 {
        acc = Some(builder.int(inner));
    }
    if sum.ty == Type::Float && sum.float_constant != 0.0 {
        acc = Some(builder.float(sum.float_constant));
    }

    for &(term, coefficient) in &sum.terms {
        let piece = scaled(builder, term, coefficient.unsigned_abs() as i64, sum.ty)?;
        let op = if coefficient > 0 { Op::Plus } else { Op::Minus };
        let next = match acc {
            Some(prev) => {
                let r = builder.make(op, &[prev, piece], Imm::None);
                builder.release(prev);
                r
            }
            None if coefficient > 0 => Ok(builder.retain(piece)),
            None => {
                let zero = match sum.ty {
                    Type::Float => builder.float(0.0),
                    _ => builder.int(0),
                };
                let r = builder.make(Op::Minus, &[zero, piece], Imm::None);
                builder.release(zero);
                r
            }
        };
        builder.release(piece);
        acc = Some(next?);
    }

    let Some(mut result) = acc else {
        return Ok(builder.int(sum.int_constant));
    };
    if outer != 0 {
        let with_tail = builder.make(Op::PlusImm, &[result], Imm::Int(outer));
        builder.release(result);
        result = with_tail?;
    }
    log::trace!(
        "rebalanced {} into {} ({} terms)",
        root,
        builder.describe(result),
        sum.terms.len()
    );
    Ok(result)
}

fn scaled(builder: &mut IrBuilder, term: NodeId, factor: i64, ty: Type) -> CompileResult<NodeId> {
    if factor == 1 {
        return Ok(builder.retain(term));
    }
    let literal = match ty {
        Type::Float => builder.float(factor as f32),
        _ => builder.int(factor),
    };
    let result = builder.make(Op::Times, &[term, literal], Imm::None);
    builder.release(literal);
    result
}
