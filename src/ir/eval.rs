//! Reference interpreter for IR expressions.
//!
//! Evaluates a node for concrete variable values against a sparse byte
//! memory. Scalar Int arithmetic is 64-bit; vector Int lanes and memory
//! elements are 32-bit, matching the generated code. Used to check that
//! rewrites preserve meaning and to predict what compiled kernels write.

use hashbrown::HashMap;

use super::builder::IrBuilder;
use super::fold::{evaluate as evaluate_scalar, Literal};
use super::node::{NodeId, Op, Type};
use crate::core::error::{CompileError, CompileResult};

/// One lane of an evaluated value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lane(Literal);

impl Lane {
    pub fn as_int(self) -> i64 {
        match self.0 {
            Literal::Int(v) => v,
            Literal::Float(v) => v as i64,
            // masks are all ones
            Literal::Bool(b) => -(b as i64),
        }
    }

    pub fn as_float(self) -> f32 {
        match self.0 {
            Literal::Float(v) => v,
            Literal::Int(v) => v as f32,
            Literal::Bool(b) => b as i32 as f32,
        }
    }

    pub fn as_bool(self) -> bool {
        match self.0 {
            Literal::Bool(b) => b,
            Literal::Int(v) => v != 0,
            Literal::Float(v) => v != 0.0,
        }
    }

    fn bits32(self) -> u32 {
        match self.0 {
            Literal::Float(v) => v.to_bits(),
            other => Lane(other).as_int() as u32,
        }
    }
}

/// A scalar or 4-lane value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Value {
    pub width: u8,
    lanes: [Lane; 4],
}

impl Value {
    fn scalar(lane: Literal) -> Self {
        Self {
            width: 1,
            lanes: [Lane(lane); 4],
        }
    }

    fn vector(lanes: [Literal; 4]) -> Self {
        Self {
            width: 4,
            lanes: lanes.map(Lane),
        }
    }

    pub fn lane(&self, i: usize) -> Lane {
        self.lanes[i.min(self.width as usize - 1)]
    }
}

/// Variable bindings and memory contents.
#[derive(Debug, Default, Clone)]
pub struct Env {
    vars: HashMap<NodeId, i64>,
    memory: HashMap<i64, u8>,
}

impl Env {
    pub fn bind(&mut self, var: NodeId, value: i64) {
        self.vars.insert(var, value);
    }

    pub fn write_u32(&mut self, address: i64, value: u32) {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.memory.insert(address + i as i64, byte);
        }
    }

    pub fn read_u32(&self, address: i64) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.memory.get(&(address + i as i64)).copied().unwrap_or(0);
        }
        u32::from_le_bytes(bytes)
    }

    pub fn write_i32(&mut self, address: i64, value: i32) {
        self.write_u32(address, value as u32);
    }

    pub fn read_i32(&self, address: i64) -> i32 {
        self.read_u32(address) as i32
    }
}

fn element(ty: Type, bits: u32) -> Literal {
    match ty {
        Type::Float => Literal::Float(f32::from_bits(bits)),
        _ => Literal::Int(bits as i32 as i64),
    }
}

/// Evaluate `id` without performing stores.
pub fn evaluate(builder: &IrBuilder, id: NodeId, env: &Env) -> CompileResult<Value> {
    let mut memo = HashMap::new();
    eval_node(builder, id, env, &mut memo)
}

/// Evaluate a `Store`/`StoreVector` root and write its value into `env`.
pub fn execute(builder: &IrBuilder, root: NodeId, env: &mut Env) -> CompileResult<()> {
    let node = &builder[root];
    if !node.op.is_store() {
        return Err(CompileError::unsupported(node.op.name(), "execute needs a store"));
    }
    let address = evaluate(builder, node.inputs[0], env)?.lane(0).as_int() + node.ival();
    let value = evaluate(builder, node.inputs[1], env)?;
    for i in 0..node.width as usize {
        env.write_u32(address + 4 * i as i64, value.lane(i).bits32());
    }
    Ok(())
}

fn eval_node(
    builder: &IrBuilder,
    id: NodeId,
    env: &Env,
    memo: &mut HashMap<NodeId, Value>,
) -> CompileResult<Value> {
    if let Some(v) = memo.get(&id) {
        return Ok(*v);
    }
    let node = &builder[id];
    let mut args = Vec::with_capacity(node.inputs.len());
    for &input in &node.inputs {
        args.push(eval_node(builder, input, env, memo)?);
    }

    let value = match node.op {
        Op::Const => Value::scalar(match node.ty {
            Type::Int => Literal::Int(node.ival()),
            Type::Float => Literal::Float(node.fval()),
            Type::Bool => Literal::Bool(node.ival() != 0),
        }),
        Op::Variable => match env.vars.get(&id) {
            Some(&v) => Value::scalar(Literal::Int(v)),
            None => {
                return Err(CompileError::unsupported(
                    "Variable",
                    format!("{} is not bound", builder.describe(id)),
                ))
            }
        },
        Op::Load(ty) => {
            let address = args[0].lane(0).as_int() + node.ival();
            Value::scalar(element(ty, env.read_u32(address)))
        }
        Op::LoadVector(ty) => {
            let address = args[0].lane(0).as_int() + node.ival();
            Value::vector([0, 1, 2, 3].map(|i| element(ty, env.read_u32(address + 4 * i))))
        }
        Op::Store | Op::StoreVector => args[1],
        Op::Vector => Value::vector([0, 1, 2, 3].map(|i| args[i].lane(0).0)),
        Op::SelectVector => {
            let k = node.ival() as usize;
            Value::vector([0, 1, 2, 3].map(|i| {
                let j = k + i;
                if j < 4 {
                    args[0].lane(j).0
                } else {
                    args[1].lane(j - 4).0
                }
            }))
        }
        Op::NoOp => Value::scalar(Literal::Int(0)),
        op => {
            let mut lanes = [Literal::Int(0); 4];
            for (i, lane) in lanes.iter_mut().enumerate().take(node.width as usize) {
                let lane_args: Vec<Literal> = args.iter().map(|a| a.lane(i).0).collect();
                let mut result = evaluate_scalar(op, node.ty, &lane_args, node.imm).ok_or_else(
                    || CompileError::unsupported(op.name(), "no evaluation rule"),
                )?;
                if node.width == 4 {
                    if let Literal::Int(v) = result {
                        result = Literal::Int(v as i32 as i64);
                    }
                }
                *lane = result;
            }
            if node.width == 1 {
                Value::scalar(lanes[0])
            } else {
                Value::vector(lanes)
            }
        }
    };
    memo.insert(id, value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::Imm;

    #[test]
    fn test_memory_round_trip() {
        let mut env = Env::default();
        env.write_i32(0x100, -5);
        assert_eq!(env.read_i32(0x100), -5);
        assert_eq!(env.read_i32(0x104), 0);
    }

    #[test]
    fn test_vector_load_and_select() {
        let mut b = IrBuilder::new();
        let mut env = Env::default();
        for i in 0..8 {
            env.write_i32(0x1000 + 4 * i, i as i32 * 10);
        }
        let base = b.int(0x1000);
        let lo = b.make(Op::LoadVector(Type::Int), &[base], Imm::Int(0)).unwrap();
        let hi = b.make(Op::LoadVector(Type::Int), &[base], Imm::Int(16)).unwrap();
        let sel = b.make(Op::SelectVector, &[lo, hi], Imm::Int(1)).unwrap();
        let v = evaluate(&b, sel, &env).unwrap();
        let lanes: Vec<i64> = (0..4).map(|i| v.lane(i).as_int()).collect();
        assert_eq!(lanes, vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_execute_store() {
        let mut b = IrBuilder::new();
        let mut env = Env::default();
        env.write_i32(0x2000, 21);
        let addr = b.int(0x2000);
        let load = b.make(Op::Load(Type::Int), &[addr], Imm::Int(0)).unwrap();
        let doubled = b.make(Op::TimesImm, &[load], Imm::Int(2)).unwrap();
        let store = b.make(Op::Store, &[addr, doubled], Imm::Int(4)).unwrap();
        execute(&b, store, &mut env).unwrap();
        assert_eq!(env.read_i32(0x2004), 42);
    }
}
