//! Properties of the expression factory checked on sampled inputs.

use arrayjit::ir::eval::{evaluate, Env};
use arrayjit::ir::{assign_level, IrBuilder, Imm, Op, Type};

const INTS: [i64; 7] = [-1000, -7, -1, 0, 1, 3, 65536];
const FLOATS: [f32; 6] = [-2.5, -1.0, 0.0, 0.25, 1.0, 3.0];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_integer_constant_folding() {
    init_logger();
    let mut b = IrBuilder::new();
    for a in INTS {
        for c in INTS {
            let (x, y) = (b.int(a), b.int(c));
            let cases = [
                (Op::Plus, a.wrapping_add(c)),
                (Op::Minus, a.wrapping_sub(c)),
                (Op::Times, a.wrapping_mul(c)),
                (Op::And, a & c),
                (Op::Or, a | c),
                (Op::Nand, !a & c),
            ];
            for (op, expected) in cases {
                let r = b.make(op, &[x, y], Imm::None).unwrap();
                assert_eq!(b[r].op, Op::Const, "{op:?} {a} {c}");
                assert_eq!(b[r].ty, Type::Int);
                assert_eq!(b[r].ival(), expected, "{op:?} {a} {c}");
                b.release(r);
            }
            b.release(x);
            b.release(y);
        }
    }
    assert_eq!(b.live_count(), 0);
}

#[test]
fn test_float_constant_folding() {
    init_logger();
    let mut b = IrBuilder::new();
    for a in FLOATS {
        for c in FLOATS {
            let (x, y) = (b.float(a), b.float(c));
            let mut cases = vec![(Op::Plus, a + c), (Op::Minus, a - c), (Op::Times, a * c)];
            if c != 0.0 {
                cases.push((Op::Divide, a / c));
            }
            for (op, expected) in cases {
                let r = b.make(op, &[x, y], Imm::None).unwrap();
                assert_eq!(b[r].op, Op::Const);
                assert_eq!(b[r].fval().to_bits(), expected.to_bits(), "{op:?} {a} {c}");
                b.release(r);
            }
            b.release(x);
            b.release(y);
        }
    }
}

#[test]
fn test_literal_interning_lifecycle() {
    init_logger();
    let mut b = IrBuilder::new();
    let first = b.int(42);
    let second = b.int(42);
    assert_eq!(first, second);
    assert_eq!(b.live_count(), 1);

    b.release(first);
    b.release(second);
    assert!(!b.is_live(first));
    let fresh = b.int(42);
    assert_ne!(fresh, first);
    assert_eq!(b[fresh].ival(), 42);
}

#[test]
fn test_common_subexpressions_shared() {
    init_logger();
    let mut b = IrBuilder::new();
    let x = b.variable("x", 0, 15);
    let y = b.variable("y", 0, 15);
    let first = b.make(Op::Plus, &[x, y], Imm::None).unwrap();
    let second = b.make(Op::Plus, &[x, y], Imm::None).unwrap();
    assert_eq!(first, second);
    assert!(b.stats().cse_hits >= 1);
}

#[test]
fn test_distribution_preserves_value() {
    init_logger();
    let mut b = IrBuilder::new();
    let x = b.variable("x", -100, 100);
    let p = b.make(Op::PlusImm, &[x], Imm::Int(2)).unwrap();
    let lhs = b.make(Op::TimesImm, &[p], Imm::Int(3)).unwrap();
    let t = b.make(Op::TimesImm, &[x], Imm::Int(3)).unwrap();
    let rhs = b.make(Op::PlusImm, &[t], Imm::Int(6)).unwrap();

    let mut env = Env::default();
    for v in [-100, -3, 0, 1, 17, 100] {
        env.bind(x, v);
        let l = evaluate(&b, lhs, &env).unwrap().lane(0).as_int();
        let r = evaluate(&b, rhs, &env).unwrap().lane(0).as_int();
        assert_eq!(l, (v + 2) * 3);
        assert_eq!(l, r);
    }
}

#[test]
fn test_levels_monotone_after_assignment() {
    init_logger();
    let mut b = IrBuilder::new();
    let x = b.variable("x", 0, 7);
    let y = b.variable("y", 0, 7);
    let z = b.variable("z", 0, 7);
    let xy = b.make(Op::Times, &[x, y], Imm::None).unwrap();
    let sum = b.make(Op::Plus, &[xy, z], Imm::None).unwrap();
    let out = b.make(Op::TimesImm, &[sum], Imm::Int(5)).unwrap();

    for (var, level) in [(z, 1), (x, 3), (y, 2), (z, 4)] {
        assign_level(&mut b, var, level);
        for id in [xy, sum, out] {
            let node = &b[id];
            let highest = node.inputs.iter().map(|&i| b[i].level).max().unwrap_or(0);
            assert!(node.level >= highest, "{} below its inputs", b.describe(id));
        }
    }
}

#[test]
fn test_node_intervals_cover_values() {
    init_logger();
    let mut b = IrBuilder::new();
    let x = b.variable("x", -3, 5);
    let y = b.variable("y", 2, 6);
    let sum = b.make(Op::Plus, &[x, y], Imm::None).unwrap();
    let diff = b.make(Op::Minus, &[x, y], Imm::None).unwrap();
    let prod = b.make(Op::Times, &[x, y], Imm::None).unwrap();

    let mut env = Env::default();
    for vx in -3..=5 {
        for vy in 2..=6 {
            env.bind(x, vx);
            env.bind(y, vy);
            for id in [sum, diff, prod] {
                let v = evaluate(&b, id, &env).unwrap().lane(0).as_int();
                let range = b[id].interval.interval;
                assert!(range.is_unbounded() || range.contains(v), "{v} outside {range}");
            }
        }
    }
}
