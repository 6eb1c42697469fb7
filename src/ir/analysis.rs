//! Static value analysis of Int nodes.
//!
//! Each node's [`SteppedInterval`] is derived from its operator and the
//! results already stored on its inputs, so analysing in dependency order
//! (which the factory does at creation) covers a whole graph. When a loop
//! variable's range or congruence changes, [`reanalyze`] recomputes every
//! node reachable from a root.

use super::builder::IrBuilder;
use super::node::{NodeId, Op, Type};
use super::transform::post_order;
use crate::core::interval::{Interval, SteppedInterval};

/// Recompute the analysis of one node from its inputs.
pub fn analyze(builder: &mut IrBuilder, id: NodeId) {
    let result = derive(builder, id);
    if let Some(result) = result {
        builder.set_interval(id, result);
    }
}

fn derive(builder: &IrBuilder, id: NodeId) -> Option<SteppedInterval> {
    let node = &builder[id];
    let input = |i: usize| builder[node.inputs[i]].interval;

    if node.ty != Type::Int {
        return match node.op {
            // Bool masks are 0 or -1; Float carries no integer facts
            Op::Const if node.ty == Type::Bool => Some(SteppedInterval::constant(node.ival())),
            Op::Variable => None,
            _ => Some(SteppedInterval::UNKNOWN),
        };
    }

    let result = match node.op {
        Op::Const => SteppedInterval::constant(node.ival()),
        // Variables carry the range and congruence the planner gave them.
        Op::Variable => return None,
        Op::Plus => input(0) + input(1),
        Op::Minus => input(0) - input(1),
        Op::Times => input(0) * input(1),
        Op::PlusImm => input(0).offset(node.ival()),
        Op::TimesImm => input(0).scale(node.ival()),
        // loads sign-extend 32-bit elements
        Op::Load(_) | Op::LoadVector(_) => SteppedInterval::range(Interval::I32),
        // a Bool mask either keeps the other operand or zeroes it
        Op::And | Op::Nand => {
            let (a, b) = (&builder[node.inputs[0]], &builder[node.inputs[1]]);
            match (a.ty, b.ty) {
                (Type::Bool, _) => SteppedInterval::range(b.interval.interval.hull(Interval::point(0))),
                (_, Type::Bool) if node.op == Op::And => {
                    SteppedInterval::range(a.interval.interval.hull(Interval::point(0)))
                }
                _ => SteppedInterval::UNKNOWN,
            }
        }
        Op::Vector => {
            let mut acc = input(0);
            for i in 1..4 {
                acc = acc.hull(input(i));
            }
            acc
        }
        Op::SelectVector => input(0).hull(input(1)),
        Op::Store | Op::StoreVector => input(1),
        _ => SteppedInterval::UNKNOWN,
    };
    Some(result)
}

/// Recompute analysis for everything reachable from `root`, inputs first.
pub fn reanalyze(builder: &mut IrBuilder, root: NodeId) {
    for id in post_order(builder, &[root]) {
        analyze(builder, id);
    }
}
