//! Constant folding.
//!
//! When every input of a value-producing operator is a scalar literal the
//! result is computed at build time and the interned literal is returned in
//! place of a new operator node.

use super::builder::IrBuilder;
use super::node::{Imm, NodeId, Op, Type};

/// A literal value read back from a `Const` node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f32),
    Bool(bool),
}

impl Literal {
    pub fn of(builder: &IrBuilder, id: NodeId) -> Option<Literal> {
        let node = builder.get(id)?;
        if !node.is_scalar_const() {
            return None;
        }
        Some(match node.ty {
            Type::Int => Literal::Int(node.ival()),
            Type::Float => Literal::Float(node.fval()),
            Type::Bool => Literal::Bool(node.ival() != 0),
        })
    }

    /// Bit pattern as seen by the bitwise operators of a `ty` result.
    fn bits(self, ty: Type) -> u64 {
        let ones = match ty {
            Type::Float => 0xffff_ffff,
            _ => u64::MAX,
        };
        match self {
            Literal::Int(v) => v as u64,
            Literal::Float(v) => v.to_bits() as u64,
            Literal::Bool(true) => ones,
            Literal::Bool(false) => 0,
        }
    }

    fn from_bits(bits: u64, ty: Type) -> Literal {
        match ty {
            Type::Int => Literal::Int(bits as i64),
            Type::Float => Literal::Float(f32::from_bits(bits as u32)),
            Type::Bool => Literal::Bool(bits != 0),
        }
    }

    fn as_f32(self) -> f32 {
        match self {
            Literal::Int(v) => v as f32,
            Literal::Float(v) => v,
            Literal::Bool(b) => b as i32 as f32,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Literal::Int(v) => v,
            Literal::Float(v) => v as i64,
            Literal::Bool(b) => b as i64,
        }
    }
}

/// Evaluate a scalar operator on literal operands.
pub fn evaluate(op: Op, ty: Type, args: &[Literal], imm: Imm) -> Option<Literal> {
    let float_args = args.iter().any(|a| matches!(a, Literal::Float(_)));
    let result = match op {
        Op::Plus | Op::Minus | Op::Times | Op::Divide if ty == Type::Float => {
            let (a, b) = (args[0].as_f32(), args[1].as_f32());
            Literal::Float(match op {
                Op::Plus => a + b,
                Op::Minus => a - b,
                Op::Times => a * b,
                _ => a / b,
            })
        }
        Op::Plus => Literal::Int(args[0].as_i64().wrapping_add(args[1].as_i64())),
        Op::Minus => Literal::Int(args[0].as_i64().wrapping_sub(args[1].as_i64())),
        Op::Times => Literal::Int(args[0].as_i64().wrapping_mul(args[1].as_i64())),
        op if op.is_comparison() && float_args => {
            let (a, b) = (args[0].as_f32(), args[1].as_f32());
            Literal::Bool(compare(op, a.partial_cmp(&b)))
        }
        op if op.is_comparison() => {
            let (a, b) = (args[0].as_i64(), args[1].as_i64());
            Literal::Bool(compare(op, Some(a.cmp(&b))))
        }
        Op::And | Op::Or | Op::Nand => {
            let (a, b) = (args[0].bits(ty), args[1].bits(ty));
            let bits = match op {
                Op::And => a & b,
                Op::Or => a | b,
                _ => !a & b,
            };
            let mask = if ty == Type::Float { 0xffff_ffff } else { u64::MAX };
            Literal::from_bits(bits & mask, ty)
        }
        Op::PlusImm => Literal::Int(args[0].as_i64().wrapping_add(imm.int())),
        Op::TimesImm => Literal::Int(args[0].as_i64().wrapping_mul(imm.int())),
        Op::IntToFloat => Literal::Float(args[0].as_i64() as f32),
        Op::FloatToInt => Literal::Int(args[0].as_f32() as i64),
        _ => return None,
    };
    Some(result)
}

fn compare(op: Op, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ord) {
        // unordered (NaN) compares false except for Neq
        (Op::Neq, None) => true,
        (_, None) => false,
        (Op::Lt, Some(o)) => o == Less,
        (Op::Gt, Some(o)) => o == Greater,
        (Op::Lte, Some(o)) => o != Greater,
        (Op::Gte, Some(o)) => o != Less,
        (Op::Eq, Some(o)) => o == Equal,
        (_, Some(o)) => o != Equal,
    }
}

/// Intern a literal in the builder.
pub fn intern_literal(builder: &mut IrBuilder, literal: Literal) -> NodeId {
    match literal {
        Literal::Int(v) => builder.int(v),
        Literal::Float(v) => builder.float(v),
        Literal::Bool(v) => builder.bool(v),
    }
}

/// Fold `op(inputs)` when every input is a scalar literal.
pub(crate) fn fold(
    builder: &mut IrBuilder,
    op: Op,
    ty: Type,
    inputs: &[NodeId],
    imm: Imm,
) -> Option<NodeId> {
    if inputs.is_empty()
        || matches!(
            op,
            Op::Load(_)
                | Op::LoadVector(_)
                | Op::Store
                | Op::StoreVector
                | Op::Vector
                | Op::SelectVector
                | Op::NoOp
        )
    {
        return None;
    }
    let args = inputs
        .iter()
        .map(|&i| Literal::of(builder, i))
        .collect::<Option<Vec<_>>>()?;
    let literal = evaluate(op, ty, &args, imm)?;
    log::trace!("folded {} of {:?} to {:?}", op.name(), args, literal);
    Some(intern_literal(builder, literal))
}
