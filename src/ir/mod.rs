//! Expression graph.
//!
//! Nodes are created exclusively through [`IrBuilder::make`], which folds
//! constants, applies algebraic rewrites and reuses structurally identical
//! nodes before allocating anything new.

pub mod analysis;
pub mod builder;
pub mod eval;
pub mod fold;
pub mod node;
pub mod rewrite;
pub mod sum;
pub mod transform;

pub use builder::{BuilderStats, IrBuilder};
pub use node::{Imm, IrNode, IterOrder, NodeId, Op, Type, VarInfo};
pub use transform::{as_type, assign_level, optimize, post_order, substitute};
