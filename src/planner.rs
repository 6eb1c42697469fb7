// This module implements the loop-structure planner. Given one output definition (a Store or
// StoreVector whose address and value reference loop Variables) it decides the loop nest that
// will evaluate it. Each variable gets a loop level: variables are ordered by their requested
// nesting and then by how far the store address moves per iteration, largest stride
// outermost, so the innermost loop walks memory with the smallest step. At most one variable is
// vectorized to four lanes and any variable may be unrolled; both expand the definition into
// several roots by substituting shifted copies of the variable and letting the factory merge
// the lanes back into vector operations. A final may-alias pass compares every load address
// against every store address using interval analysis and drags loads that might read a
// just-written element down to the store's loop level so their value is never hoisted stale.

//! Loop-structure planning for one output definition.

use std::cmp::Reverse;

use crate::core::config::CompilerOptions;
use crate::core::error::{CompileError, CompileResult, SoundnessWarning};
use crate::core::interval::{Interval, SteppedInterval};
use crate::core::session::CompilationSession;
use crate::ir::analysis::reanalyze;
use crate::ir::builder::IrBuilder;
use crate::ir::node::{Imm, IterOrder, NodeId, Op};
use crate::ir::transform::{assign_level, optimize, post_order, release_all, substitute};

/// Lanes of the only supported SIMD width.
pub const VECTOR_WIDTH: u8 = 4;

/// Loop levels are stored in a byte; level 0 is reserved for invariants.
pub const MAX_LOOP_VARIABLES: usize = 255;

/// One loop of the planned nest.
#[derive(Debug, Clone)]
pub struct LoopVar {
    pub node: NodeId,
    pub name: String,
    /// 1 is the outermost loop.
    pub level: u8,
    pub min: i64,
    pub max: i64,
    /// Increment per iteration: vector width times unroll factor.
    pub step: i64,
    pub order: IterOrder,
    pub vector_width: u8,
    pub unroll: u32,
    /// Bytes the store address moves when the variable increases by one.
    pub store_delta: Option<i64>,
}

impl LoopVar {
    /// First value the induction register takes.
    pub fn start(&self) -> i64 {
        match self.order {
            IterOrder::Decreasing => self.last(),
            _ => self.min,
        }
    }

    /// Last value the induction register takes.
    pub fn last(&self) -> i64 {
        self.max - self.step + 1
    }

    pub fn trip_count(&self) -> i64 {
        (self.max - self.min + 1) / self.step
    }
}

/// The planned loop nest and the roots to evaluate in its innermost body.
#[derive(Debug, Clone)]
pub struct LoopPlan {
    /// Owned references; give them back with [`LoopPlan::release`].
    pub roots: Vec<NodeId>,
    /// Indexed by `level - 1`.
    pub loops: Vec<LoopVar>,
    pub vectorized: Option<NodeId>,
}

impl LoopPlan {
    pub fn depth(&self) -> usize {
        self.loops.len()
    }

    pub fn release(self, builder: &mut IrBuilder) {
        release_all(builder, self.roots);
    }
}

/// Plan the loop nest for the definition `root`.
pub fn plan(
    builder: &mut IrBuilder,
    session: &CompilationSession<'_>,
    root: NodeId,
    options: &CompilerOptions,
) -> CompileResult<LoopPlan> {
    if !builder[root].op.is_store() {
        return Err(CompileError::planning(format!(
            "definition root {} is not a store",
            builder.describe(root)
        )));
    }

    let mut loops = collect_variables(builder, root)?;
    for candidate in loops.iter_mut() {
        let var = &mut candidate.var;
        var.store_delta = store_delta(builder, root, var.node)?;
        log::debug!("store delta of {} is {:?}", var.name, var.store_delta);
    }

    // unknown deltas sort after every known one
    loops.sort_by_key(|v| (v.node_nesting, Reverse(v.var.store_delta.map(i64::unsigned_abs))));
    let mut loops: Vec<LoopVar> = loops.into_iter().map(|c| c.var).collect();
    for (i, var) in loops.iter_mut().enumerate() {
        var.level = (i + 1) as u8;
        assign_level(builder, var.node, var.level);
        log::debug!("loop level {} iterates {} over [{}, {}]", var.level, var.name, var.min, var.max);
    }

    let vectorized = choose_vector_variable(session, &mut loops)?;
    for var in loops.iter_mut() {
        check_unroll(session, var, options)?;
        var.step = var.vector_width as i64 * var.unroll as i64;
        let interval = Interval::new(var.min, var.last());
        builder.set_interval(
            var.node,
            SteppedInterval::with_congruence(interval, var.step, var.min.rem_euclid(var.step)),
        );
    }

    reanalyze(builder, root);
    let optimized = optimize(builder, root)?;
    let mut roots = vec![optimized];

    if let Some(index) = vectorized {
        let var = loops[index].node;
        let vector_root = vectorize(builder, session, optimized, var);
        builder.release(optimized);
        roots = vector_root?;
    }

    for var in &loops {
        if var.unroll > 1 {
            roots = unroll(builder, roots, var)?;
        }
    }

    promote_aliased_loads(builder, session, &roots);
    log::debug!(
        "planned {} loops, {} roots, vectorized {:?}",
        loops.len(),
        roots.len(),
        vectorized.map(|i| loops[i].name.as_str())
    );
    Ok(LoopPlan {
        roots,
        vectorized: vectorized.map(|i| loops[i].node),
        loops,
    })
}

struct Candidate {
    var: LoopVar,
    node_nesting: i32,
}

fn collect_variables(builder: &IrBuilder, root: NodeId) -> CompileResult<Vec<Candidate>> {
    let mut found = Vec::new();
    for id in post_order(builder, &[root]) {
        let node = &builder[id];
        if node.op != Op::Variable {
            continue;
        }
        let Some(info) = node.var.as_deref() else {
            continue;
        };
        let range = node.interval.interval;
        if range.is_unbounded() {
            return Err(CompileError::planning(format!(
                "loop variable {} has an unbounded range",
                info.name
            )));
        }
        found.push(Candidate {
            node_nesting: info.nesting,
            var: LoopVar {
                node: id,
                name: info.name.clone(),
                level: 0,
                min: range.min,
                max: range.max,
                step: 1,
                order: info.order,
                // the request; only one variable keeps it after planning
                vector_width: info.vector_width.max(1),
                unroll: info.unroll.max(1),
                store_delta: None,
            },
        });
    }
    if found.len() > MAX_LOOP_VARIABLES {
        return Err(CompileError::planning(format!(
            "{} loop variables, at most {MAX_LOOP_VARIABLES} are supported",
            found.len()
        )));
    }
    Ok(found)
}

/// How far the store address moves when `var` increases by one.
fn store_delta(builder: &mut IrBuilder, root: NodeId, var: NodeId) -> CompileResult<Option<i64>> {
    let address = builder[root].inputs[0];
    let base = optimize(builder, address)?;
    let next = builder.make(Op::PlusImm, &[var], Imm::Int(1));
    let shifted = next.and_then(|next| {
        let s = substitute(builder, base, var, next);
        builder.release(next);
        s
    });
    let shifted = shifted.and_then(|s| {
        let o = optimize(builder, s);
        builder.release(s);
        o
    });
    let diff = shifted.and_then(|s| {
        let d = builder.make(Op::Minus, &[s, base], Imm::None);
        builder.release(s);
        d
    });
    builder.release(base);
    let diff = diff?;
    let folded = optimize(builder, diff);
    builder.release(diff);
    let folded = folded?;
    let delta = builder[folded].is_scalar_const().then(|| builder[folded].ival());
    builder.release(folded);
    Ok(delta)
}

/// Keep the vector request of the first variable that asks for one.
fn choose_vector_variable(
    session: &CompilationSession<'_>,
    loops: &mut [LoopVar],
) -> CompileResult<Option<usize>> {
    let chosen = loops.iter().position(|v| v.vector_width > 1);
    for (i, var) in loops.iter_mut().enumerate() {
        if Some(i) != chosen {
            var.vector_width = 1;
        }
    }
    let Some(index) = chosen else {
        return Ok(None);
    };
    let var = &mut loops[index];
    var.vector_width = VECTOR_WIDTH;
    let trips = var.max - var.min + 1;
    if trips % VECTOR_WIDTH as i64 != 0 {
        return Err(CompileError::planning(format!(
            "cannot vectorize {}: {trips} iterations are not a multiple of {VECTOR_WIDTH}",
            var.name
        )));
    }
    if var.min.rem_euclid(VECTOR_WIDTH as i64) != 0 {
        session.warn(SoundnessWarning::UnalignedVectorBounds {
            var: var.name.clone(),
            min: var.min,
        });
    }
    log::debug!("vectorizing {} at level {}", var.name, var.level);
    Ok(Some(index))
}

fn check_unroll(
    session: &CompilationSession<'_>,
    var: &LoopVar,
    options: &CompilerOptions,
) -> CompileResult<()> {
    if var.unroll <= 1 {
        return Ok(());
    }
    if var.unroll > options.max_unroll {
        return Err(CompileError::planning(format!(
            "unroll factor {} of {} exceeds the limit {}",
            var.unroll, var.name, options.max_unroll
        )));
    }
    let trips = (var.max - var.min + 1) / var.vector_width as i64;
    if trips % var.unroll as i64 != 0 {
        return Err(CompileError::planning(format!(
            "unroll factor {} does not divide the {trips} iterations of {}",
            var.unroll, var.name
        )));
    }
    if var.order != IterOrder::Parallel {
        session.warn(SoundnessWarning::UnrollNotParallel {
            var: var.name.clone(),
        });
    }
    log::debug!("unrolling {} by {}", var.name, var.unroll);
    Ok(())
}

/// `root` with `var` replaced by `var + k`.
fn shifted_copy(builder: &mut IrBuilder, root: NodeId, var: NodeId, k: i64) -> CompileResult<NodeId> {
    if k == 0 {
        return Ok(builder.retain(root));
    }
    let next = builder.make(Op::PlusImm, &[var], Imm::Int(k))?;
    let shifted = substitute(builder, root, var, next);
    builder.release(next);
    let shifted = shifted?;
    let optimized = optimize(builder, shifted);
    builder.release(shifted);
    optimized
}

/// Merge four lane copies of `root` into one vector store.
fn vectorize(
    builder: &mut IrBuilder,
    session: &CompilationSession<'_>,
    root: NodeId,
    var: NodeId,
) -> CompileResult<Vec<NodeId>> {
    let mut lanes = Vec::with_capacity(VECTOR_WIDTH as usize);
    for k in 0..VECTOR_WIDTH as i64 {
        match shifted_copy(builder, root, var, k) {
            Ok(lane) => lanes.push(lane),
            Err(e) => {
                release_all(builder, lanes);
                return Err(e);
            }
        }
    }
    let merged = builder.make(Op::Vector, &lanes, Imm::None);
    let merged = match merged {
        Ok(m) => m,
        Err(e) => {
            release_all(builder, lanes);
            return Err(e);
        }
    };
    if builder[merged].op == Op::StoreVector {
        release_all(builder, lanes);
        log::debug!("vector root {}", builder.describe(merged));
        return Ok(vec![merged]);
    }

    session.warn(SoundnessWarning::ScalarizedVectorStore {
        reason: format!("lanes merged into {}", builder.describe(merged)),
    });
    builder.release(merged);
    lanes.dedup();
    Ok(lanes)
}

fn unroll(builder: &mut IrBuilder, roots: Vec<NodeId>, var: &LoopVar) -> CompileResult<Vec<NodeId>> {
    let mut expanded = roots.clone();
    for k in 1..var.unroll as i64 {
        for &root in &roots {
            match shifted_copy(builder, root, var.node, k * var.vector_width as i64) {
                Ok(copy) => expanded.push(copy),
                Err(e) => {
                    release_all(builder, expanded);
                    return Err(e);
                }
            }
        }
    }
    log::debug!("unrolled {} into {} roots", var.name, expanded.len());
    Ok(expanded)
}

/// Byte range a memory operation may touch.
fn access_range(builder: &IrBuilder, id: NodeId) -> Interval {
    let node = &builder[id];
    let address = builder[node.inputs[0]].interval.interval;
    address + Interval::point(node.ival())
}

/// Move loads that may observe a store of this definition to the store's level.
fn promote_aliased_loads(builder: &mut IrBuilder, session: &CompilationSession<'_>, roots: &[NodeId]) {
    let nodes = post_order(builder, roots);
    let loads: Vec<NodeId> = nodes.iter().copied().filter(|&n| builder[n].op.is_load()).collect();
    let stores: Vec<NodeId> = nodes.iter().copied().filter(|&n| builder[n].op.is_store()).collect();

    for &load in &loads {
        for &store in &stores {
            let distance = access_range(builder, load) - access_range(builder, store);
            let load_size = builder[load].access_size();
            let store_size = builder[store].access_size();
            let overlap = distance.is_unbounded()
                || (distance.min < store_size && distance.max > -load_size);
            let (from, to) = (builder[load].level, builder[store].level);
            if overlap && from < to {
                assign_level(builder, load, to);
                session.warn(SoundnessWarning::AliasedLoadPromoted {
                    load: builder.describe(load),
                    from,
                    to,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn image_store(b: &mut IrBuilder, base: i64, width: i64, x: NodeId, y: NodeId) -> NodeId {
        let w = b.int(width);
        let row = b.make(Op::Times, &[y, w], Imm::None).unwrap();
        let index = b.make(Op::Plus, &[row, x], Imm::None).unwrap();
        let bytes = b.make(Op::TimesImm, &[index], Imm::Int(4)).unwrap();
        let start = b.int(base);
        let addr = b.make(Op::Plus, &[start, bytes], Imm::None).unwrap();
        let load = b.make(Op::Load(crate::ir::node::Type::Int), &[addr], Imm::Int(0)).unwrap();
        let doubled = b.make(Op::TimesImm, &[load], Imm::Int(2)).unwrap();
        b.make(Op::Store, &[addr, doubled], Imm::Int(0)).unwrap()
    }

    #[test]
    fn test_levels_follow_store_stride() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 3);
        let y = b.variable("y", 0, 3);
        let root = image_store(&mut b, 0x1_0000, 4, x, y);

        let plan = plan(&mut b, &session, root, &CompilerOptions::default()).unwrap();
        assert_eq!(plan.depth(), 2);
        assert_eq!(plan.loops[0].node, y);
        assert_eq!(plan.loops[0].store_delta, Some(16));
        assert_eq!(plan.loops[1].node, x);
        assert_eq!(plan.loops[1].store_delta, Some(4));
        assert_eq!(b[y].level, 1);
        assert_eq!(b[x].level, 2);
        plan.release(&mut b);
    }

    #[test]
    fn test_vectorize_merges_store() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 7);
        let y = b.variable("y", 0, 1);
        b.var_info_mut(x).unwrap().vector_width = 4;
        let root = image_store(&mut b, 0x1_0000, 8, x, y);

        let plan = plan(&mut b, &session, root, &CompilerOptions::default()).unwrap();
        assert_eq!(plan.vectorized, Some(x));
        assert_eq!(plan.roots.len(), 1);
        assert_eq!(b[plan.roots[0]].op, Op::StoreVector);
        assert_eq!(plan.loops[1].step, 4);
        assert!(session.warnings().is_empty());
        plan.release(&mut b);
    }

    #[test]
    fn test_vector_trip_count_must_divide() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 5);
        let y = b.variable("y", 0, 1);
        b.var_info_mut(x).unwrap().vector_width = 4;
        let root = image_store(&mut b, 0x1_0000, 6, x, y);
        let err = plan(&mut b, &session, root, &CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::Planning { .. }));
    }

    #[test]
    fn test_unroll_expands_roots() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let x = b.variable("x", 0, 7);
        let y = b.variable("y", 0, 1);
        {
            let info = b.var_info_mut(x).unwrap();
            info.unroll = 2;
            info.order = IterOrder::Serial;
        }
        let root = image_store(&mut b, 0x1_0000, 8, x, y);
        let plan = plan(&mut b, &session, root, &CompilerOptions::default()).unwrap();
        assert_eq!(plan.roots.len(), 2);
        assert_eq!(plan.loops[1].step, 2);
        assert_eq!(
            session.warnings(),
            vec![SoundnessWarning::UnrollNotParallel { var: "x".to_string() }]
        );
        plan.release(&mut b);
    }

    #[test]
    fn test_unbounded_variable_rejected() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = IrBuilder::new();
        let x = b.variable("x", i64::MIN, i64::MAX);
        let base = b.int(0x1000);
        let addr = b.make(Op::Plus, &[base, x], Imm::None).unwrap();
        let one = b.int(1);
        let root = b.make(Op::Store, &[addr, one], Imm::Int(0)).unwrap();
        let err = plan(&mut b, &session, root, &CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::Planning { .. }));
    }
}
