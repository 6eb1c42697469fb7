//! IR node model.
//!
//! Nodes live in the [`IrBuilder`](super::IrBuilder) arena and are addressed by
//! generational [`NodeId`]s. Inputs are owning edges (they hold a reference
//! count on the input); consumer lists are plain back edges used for counting
//! and CSE lookups.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::core::interval::SteppedInterval;
use crate::core::register_file::{AsmReg, RegClass};

/// Handle to a node in the builder arena.
///
/// The generation distinguishes a live node from an earlier node that
/// occupied the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Element type of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// 32-bit lanes in vectors and memory, 64-bit in general-purpose registers.
    Int,
    /// IEEE single precision.
    Float,
    /// All-ones or all-zeros masks.
    Bool,
}

/// Operator of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Const,
    Variable,
    Plus,
    Minus,
    Times,
    Divide,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    And,
    Or,
    /// `!a & b`
    Nand,
    /// Scalar load of the given element type from `address + ival`.
    Load(Type),
    /// Four consecutive elements from `address + ival`.
    LoadVector(Type),
    /// Store `value` to `address + ival`.
    Store,
    StoreVector,
    PlusImm,
    TimesImm,
    IntToFloat,
    FloatToInt,
    /// Four scalars packed into one vector.
    Vector,
    /// Lanes `k..k+4` of the eight-lane concatenation of two vectors.
    SelectVector,
    /// Groups its inputs; emits nothing.
    NoOp,
}

impl Op {
    /// Fixed input count, or `None` when any count is accepted.
    pub fn arity(self) -> Option<usize> {
        match self {
            Op::Const | Op::Variable => Some(0),
            Op::Load(_)
            | Op::LoadVector(_)
            | Op::PlusImm
            | Op::TimesImm
            | Op::IntToFloat
            | Op::FloatToInt => Some(1),
            Op::Vector => Some(4),
            Op::NoOp => None,
            _ => Some(2),
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, Op::Lt | Op::Gt | Op::Lte | Op::Gte | Op::Eq | Op::Neq)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, Op::And | Op::Or | Op::Nand)
    }

    /// Operators whose inputs may be swapped, comparisons by flipping.
    pub fn is_commutative(self) -> bool {
        matches!(self, Op::Plus | Op::Times | Op::And | Op::Or) || self.is_comparison()
    }

    /// The comparison that gives the same answer with swapped operands.
    pub fn flipped(self) -> Op {
        match self {
            Op::Lt => Op::Gt,
            Op::Gt => Op::Lt,
            Op::Lte => Op::Gte,
            Op::Gte => Op::Lte,
            other => other,
        }
    }

    pub fn is_load(self) -> bool {
        matches!(self, Op::Load(_) | Op::LoadVector(_))
    }

    pub fn is_store(self) -> bool {
        matches!(self, Op::Store | Op::StoreVector)
    }

    /// Nodes that never occupy a register.
    pub fn produces_value(self) -> bool {
        !matches!(self, Op::Store | Op::StoreVector | Op::NoOp)
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Const => "Const",
            Op::Variable => "Variable",
            Op::Plus => "Plus",
            Op::Minus => "Minus",
            Op::Times => "Times",
            Op::Divide => "Divide",
            Op::Lt => "Lt",
            Op::Gt => "Gt",
            Op::Lte => "Lte",
            Op::Gte => "Gte",
            Op::Eq => "Eq",
            Op::Neq => "Neq",
            Op::And => "And",
            Op::Or => "Or",
            Op::Nand => "Nand",
            Op::Load(_) => "Load",
            Op::LoadVector(_) => "LoadVector",
            Op::Store => "Store",
            Op::StoreVector => "StoreVector",
            Op::PlusImm => "PlusImm",
            Op::TimesImm => "TimesImm",
            Op::IntToFloat => "IntToFloat",
            Op::FloatToInt => "FloatToInt",
            Op::Vector => "Vector",
            Op::SelectVector => "SelectVector",
            Op::NoOp => "NoOp",
        }
    }
}

/// Immediate payload of a node.
#[derive(Debug, Clone, Copy)]
pub enum Imm {
    None,
    Int(i64),
    Float(f32),
}

impl Imm {
    /// Integer payload, zero when absent.
    pub fn int(self) -> i64 {
        match self {
            Imm::Int(v) => v,
            _ => 0,
        }
    }

    pub fn float(self) -> f32 {
        match self {
            Imm::Float(v) => v,
            Imm::Int(v) => v as f32,
            Imm::None => 0.0,
        }
    }
}

// Floats compare by bit pattern so that -0.0 and NaN literals intern correctly.
impl PartialEq for Imm {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Imm::None, Imm::None) => true,
            (Imm::Int(a), Imm::Int(b)) => a == b,
            (Imm::Float(a), Imm::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Imm {}

impl Hash for Imm {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Imm::None => 0u8.hash(state),
            Imm::Int(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            Imm::Float(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
        }
    }
}

/// Iteration order requested for a loop variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterOrder {
    /// Iterations are independent.
    #[default]
    Parallel,
    /// Iterations must run in increasing order.
    Serial,
    /// Iterations must run in decreasing order.
    Decreasing,
}

/// Scheduling metadata carried by `Variable` nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
    /// Requested vector width; anything above 1 asks for 4-wide SIMD.
    pub vector_width: u8,
    pub unroll: u32,
    pub order: IterOrder,
    /// Lower values nest further out.
    pub nesting: i32,
}

impl VarInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vector_width: 1,
            unroll: 1,
            order: IterOrder::Parallel,
            nesting: 0,
        }
    }
}

/// One vertex of the expression DAG.
#[derive(Debug, Clone)]
pub struct IrNode {
    pub op: Op,
    pub ty: Type,
    /// 1 or 4 lanes.
    pub width: u8,
    pub imm: Imm,
    pub interval: SteppedInterval,
    pub inputs: Vec<NodeId>,
    /// Back edges, one per input slot that references this node.
    pub consumers: Vec<NodeId>,
    /// 0 is loop-invariant, `n` is recomputed in the n-th loop.
    pub level: u8,
    /// No Variable is reachable through the inputs.
    pub constant: bool,
    pub reg: Option<AsmReg>,
    pub var: Option<Box<VarInfo>>,
    pub(crate) refs: u32,
}

impl IrNode {
    pub(crate) fn new(op: Op, ty: Type, width: u8, imm: Imm, inputs: Vec<NodeId>) -> Self {
        Self {
            op,
            ty,
            width,
            imm,
            interval: SteppedInterval::UNKNOWN,
            inputs,
            consumers: Vec::new(),
            level: 0,
            constant: true,
            reg: None,
            var: None,
            refs: 1,
        }
    }

    /// Integer immediate (constant value, offset or scale).
    #[inline]
    pub fn ival(&self) -> i64 {
        self.imm.int()
    }

    #[inline]
    pub fn fval(&self) -> f32 {
        self.imm.float()
    }

    pub fn is_const(&self) -> bool {
        self.op == Op::Const
    }

    pub fn is_scalar_const(&self) -> bool {
        self.op == Op::Const && self.width == 1
    }

    /// Register class of the value, `None` for nodes that produce none.
    pub fn reg_class(&self) -> Option<RegClass> {
        if !self.op.produces_value() {
            None
        } else if self.width == 1 && self.ty != Type::Float {
            Some(RegClass::General)
        } else {
            Some(RegClass::Simd)
        }
    }

    /// Bytes touched by a memory operation.
    pub fn access_size(&self) -> i64 {
        match self.op {
            Op::LoadVector(_) | Op::StoreVector => 16,
            _ => 4,
        }
    }

    pub fn reference_count(&self) -> u32 {
        self.refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_properties() {
        assert_eq!(Op::Vector.arity(), Some(4));
        assert_eq!(Op::Load(Type::Int).arity(), Some(1));
        assert_eq!(Op::NoOp.arity(), None);
        assert!(Op::Lt.is_commutative());
        assert_eq!(Op::Lt.flipped(), Op::Gt);
        assert!(!Op::Minus.is_commutative());
        assert!(!Op::StoreVector.produces_value());
    }

    #[test]
    fn test_imm_equality_by_bits() {
        assert_eq!(Imm::Float(f32::NAN), Imm::Float(f32::NAN));
        assert_ne!(Imm::Float(0.0), Imm::Float(-0.0));
        assert_ne!(Imm::Int(1), Imm::Float(1.0));
    }

    #[test]
    fn test_reg_class() {
        let int = IrNode::new(Op::Plus, Type::Int, 1, Imm::None, vec![]);
        let float = IrNode::new(Op::Plus, Type::Float, 1, Imm::None, vec![]);
        let vec = IrNode::new(Op::Plus, Type::Int, 4, Imm::None, vec![]);
        let store = IrNode::new(Op::Store, Type::Int, 1, Imm::None, vec![]);
        assert_eq!(int.reg_class(), Some(RegClass::General));
        assert_eq!(float.reg_class(), Some(RegClass::Simd));
        assert_eq!(vec.reg_class(), Some(RegClass::Simd));
        assert_eq!(store.reg_class(), None);
    }
}
