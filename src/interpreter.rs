use std::time::{Duration, Instant};

use snafu::OptionExt;

use crate::{
    device::{Backend, DeviceKind, RawBuffer},
    dtype::DType,
    error::{BackendSnafu, Result},
    ops::{BinaryOp, BufferOp, LazyOp, LazySrc, MovementOp, Op, OpArg, ReduceOp, TernaryOp, UnaryOp},
    shape_tracker::ShapeTracker,
    symbolic::{as_ints, floordiv, VarVals},
};

/// Dense row-major values of one AST node.
#[derive(Clone, Debug)]
struct Value {
    shape: Vec<i64>,
    dtype: DType,
    data: Vec<f64>,
}

fn numel(shape: &[i64]) -> usize {
    usize::try_from(shape.iter().product::<i64>()).unwrap_or(0)
}

/// Calls `f` with every index of `shape`, last axis fastest.
fn for_each_index(shape: &[i64], mut f: impl FnMut(&[i64])) {
    if shape.iter().any(|s| *s == 0) {
        return;
    }
    let mut idx = vec![0; shape.len()];
    loop {
        f(&idx);
        let mut axis = shape.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < shape[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

/// One scalar ALU op, rounded to `dtype`. Integer division truncates and
/// division by zero gives 0; integer modulo follows the sign of the divisor.
pub(crate) fn exec_alu(op: Op, dtype: DType, args: &[f64]) -> f64 {
    let int = dtype.is_int();
    let v = match (op, args) {
        (Op::Unary(op), &[x]) => match op {
            UnaryOp::Noop | UnaryOp::Cast => x,
            UnaryOp::Exp2 => x.exp2(),
            UnaryOp::Log2 => x.log2(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Recip => x.recip(),
            UnaryOp::Neg => -x,
        },
        (Op::Binary(op), &[x, y]) => match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div if int => {
                if y == 0.0 {
                    0.0
                } else {
                    (x / y).trunc()
                }
            }
            BinaryOp::Div => x / y,
            BinaryOp::Max => x.max(y),
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            BinaryOp::Mod if int && y != 0.0 => (x as i64 - y as i64 * floordiv(x as i64, y as i64)) as f64,
            BinaryOp::Mod => x - y * (x / y).floor(),
            BinaryOp::CmpLt => f64::from(u8::from(x < y)),
        },
        (Op::Ternary(TernaryOp::Where), &[c, x, y]) => {
            if c == 0.0 {
                y
            } else {
                x
            }
        }
        (Op::Ternary(TernaryOp::MulAcc), &[a, b, c]) => a * b + c,
        (op, args) => panic!("{op} can't take {} arguments", args.len()),
    };
    dtype.cast_value(v)
}

/// Walks the AST on the host, one node at a time.
pub struct Interpreter {
    name: String,
}

impl Interpreter {
    pub fn new(name: &str) -> Interpreter {
        Interpreter { name: name.to_string() }
    }

    fn err(&self, reason: impl Into<String>) -> crate::error::Error {
        BackendSnafu {
            device: self.name.clone(),
            reason: reason.into(),
        }
        .build()
    }

    fn concrete(&self, st: &ShapeTracker, var_vals: &VarVals) -> Result<(ShapeTracker, Vec<i64>)> {
        let st = st.substitute(var_vals);
        let shape = as_ints(st.shape()).context(BackendSnafu {
            device: self.name.clone(),
            reason: format!("unbound variables in {st}"),
        })?;
        Ok((st, shape))
    }

    fn leaf(&self, st: &ShapeTracker, dtype: DType, var_vals: &VarVals, read: impl Fn(i64) -> f64) -> Result<Value> {
        let (st, shape) = self.concrete(st, var_vals)?;
        let mut data = Vec::with_capacity(numel(&shape));
        for_each_index(&shape, |idx| {
            data.push(st.index_of(idx).map_or(0.0, &read));
        });
        Ok(Value { shape, dtype, data })
    }

    fn src(&self, s: &LazySrc, inputs: &[Vec<f64>], var_vals: &VarVals) -> Result<Value> {
        match s {
            LazySrc::Op(op) => self.eval(op, inputs, var_vals),
            LazySrc::Buffer(b) => Err(self.err(format!("unscheduled buffer {b}"))),
        }
    }

    fn eval(&self, ast: &LazyOp, inputs: &[Vec<f64>], var_vals: &VarVals) -> Result<Value> {
        match (ast.op(), ast.arg()) {
            (Op::Buffer(BufferOp::Mem), OpArg::Mem(m)) => {
                let data = inputs
                    .get(m.idx.wrapping_sub(1))
                    .ok_or_else(|| self.err(format!("no buffer for slot {}", m.idx)))?;
                self.leaf(&m.st, m.dtype, var_vals, |i| {
                    usize::try_from(i).ok().and_then(|i| data.get(i)).copied().unwrap_or(0.0)
                })
            }
            (Op::Buffer(BufferOp::Const), OpArg::ConstBuf(c)) => {
                let v = c.dtype.cast_value(c.val.0);
                self.leaf(&c.st, c.dtype, var_vals, |_| v)
            }
            (Op::Unary(UnaryOp::Cast), OpArg::Cast(dtype, bitcast)) => {
                let x = self.src(&ast.srcs()[0], inputs, var_vals)?;
                let data = if *bitcast {
                    dtype.decode(&x.dtype.encode(&x.data))
                } else {
                    x.data.iter().map(|v| dtype.cast_value(*v)).collect()
                };
                Ok(Value { data, dtype: *dtype, ..x })
            }
            (Op::Unary(op), _) => {
                let x = self.src(&ast.srcs()[0], inputs, var_vals)?;
                let data = x.data.iter().map(|v| exec_alu(Op::Unary(op), x.dtype, &[*v])).collect();
                Ok(Value { data, ..x })
            }
            (Op::Binary(op), _) => {
                let a = self.src(&ast.srcs()[0], inputs, var_vals)?;
                let b = self.src(&ast.srcs()[1], inputs, var_vals)?;
                let dtype = a.dtype.max(b.dtype);
                let data = a
                    .data
                    .iter()
                    .zip(&b.data)
                    .map(|(x, y)| exec_alu(Op::Binary(op), dtype, &[*x, *y]))
                    .collect();
                Ok(Value { data, dtype, ..a })
            }
            (Op::Ternary(op), _) => {
                let a = self.src(&ast.srcs()[0], inputs, var_vals)?;
                let b = self.src(&ast.srcs()[1], inputs, var_vals)?;
                let c = self.src(&ast.srcs()[2], inputs, var_vals)?;
                let dtype = match op {
                    TernaryOp::Where => b.dtype.max(c.dtype),
                    TernaryOp::MulAcc => a.dtype.max(b.dtype).max(c.dtype),
                };
                let data = (0..a.data.len())
                    .map(|i| exec_alu(Op::Ternary(op), dtype, &[a.data[i], b.data[i], c.data[i]]))
                    .collect();
                Ok(Value { data, dtype, ..a })
            }
            (Op::Reduce(op), OpArg::Shape(new_shape)) => {
                let x = self.src(&ast.srcs()[0], inputs, var_vals)?;
                let new_shape: Vec<i64> = new_shape
                    .iter()
                    .map(|s| s.substitute_vals(var_vals).as_num())
                    .collect::<Option<_>>()
                    .ok_or_else(|| self.err("unbound variables in reduce shape"))?;
                let init = match op {
                    ReduceOp::Sum => 0.0,
                    ReduceOp::Max => f64::NEG_INFINITY,
                };
                let mut data = vec![init; numel(&new_shape)];
                let mut i = 0;
                for_each_index(&x.shape, |idx| {
                    let mut out = 0;
                    for (d, n) in idx.iter().zip(&new_shape) {
                        out = out * n + if *n == 1 { 0 } else { *d };
                    }
                    let slot = &mut data[usize::try_from(out).unwrap_or(0)];
                    *slot = match op {
                        ReduceOp::Sum => *slot + x.data[i],
                        ReduceOp::Max => slot.max(x.data[i]),
                    };
                    i += 1;
                });
                let data = data.into_iter().map(|v| x.dtype.cast_value(v)).collect();
                Ok(Value {
                    shape: new_shape,
                    dtype: x.dtype,
                    data,
                })
            }
            (Op::Movement(MovementOp::Reshape), OpArg::Shape(shape)) => {
                let x = self.src(&ast.srcs()[0], inputs, var_vals)?;
                let shape: Vec<i64> = shape
                    .iter()
                    .map(|s| s.substitute_vals(var_vals).as_num())
                    .collect::<Option<_>>()
                    .ok_or_else(|| self.err("unbound variables in reshape"))?;
                if numel(&shape) != x.data.len() {
                    return Err(self.err(format!("can't reshape {:?} to {shape:?}", x.shape)));
                }
                Ok(Value { shape, ..x })
            }
            (op, arg) => Err(self.err(format!("can't interpret {op} with {arg}"))),
        }
    }
}

impl Backend for Interpreter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Interpreted
    }

    fn exec_ast(
        &mut self,
        ast: &LazyOp,
        output: &RawBuffer,
        inputs: &[RawBuffer],
        var_vals: &VarVals,
    ) -> Result<Option<Duration>> {
        let start = Instant::now();
        let inputs: Vec<Vec<f64>> = inputs.iter().map(RawBuffer::read_f64).collect();
        let value = self.eval(ast, &inputs, var_vals)?;
        if value.data.len() > output.size() {
            return Err(self.err(format!(
                "{} values don't fit an output of {}",
                value.data.len(),
                output.size()
            )));
        }
        output.write_f64(&value.data);
        Ok(Some(start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ops::{const_op, mem_op},
        symbolic::{to_nodes, Node, Variable},
    };

    fn st(shape: &[i64]) -> ShapeTracker {
        ShapeTracker::from_shape(&to_nodes(shape)).unwrap()
    }

    fn run(ast: &LazyOp, inputs: &[RawBuffer], size: usize, var_vals: &VarVals) -> Vec<f64> {
        let out = RawBuffer::new(size, DType::Float32);
        Interpreter::new("CPU").exec_ast(ast, &out, inputs, var_vals).unwrap();
        out.read_f64()
    }

    #[test]
    fn test_for_each_index() {
        let mut seen = vec![];
        for_each_index(&[2, 2], |i| seen.push(i.to_vec()));
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
    }

    #[test]
    fn test_sum_of_permuted() {
        let x = RawBuffer::from_values(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], DType::Float32);
        let permuted = st(&[2, 3]).permute(&[1, 0]).unwrap();
        let sum = LazyOp::new(
            Op::Reduce(ReduceOp::Sum),
            vec![mem_op(1, DType::Float32, permuted).into()],
            OpArg::Shape(to_nodes(&[3, 1])),
        );
        assert_eq!(run(&sum, &[x], 3, &VarVals::new()), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_masked_const() {
        let padded = st(&[2]).pad(&[(1, 1)]).unwrap();
        let c = const_op(3.0, DType::Float32, padded);
        assert_eq!(run(&c, &[], 4, &VarVals::new()), vec![0.0, 3.0, 3.0, 0.0]);
    }

    #[test]
    fn test_where_and_cmplt() {
        let a = RawBuffer::from_values(&[1.0, 5.0], DType::Float32);
        let b = RawBuffer::from_values(&[3.0, 3.0], DType::Float32);
        let lt = LazyOp::new(
            Op::Binary(BinaryOp::CmpLt),
            vec![mem_op(1, DType::Float32, st(&[2])).into(), mem_op(2, DType::Float32, st(&[2])).into()],
            OpArg::None,
        );
        let w = LazyOp::new(
            Op::Ternary(TernaryOp::Where),
            vec![lt.into(), mem_op(1, DType::Float32, st(&[2])).into(), mem_op(2, DType::Float32, st(&[2])).into()],
            OpArg::None,
        );
        assert_eq!(run(&w, &[a, b], 2, &VarVals::new()), vec![1.0, 3.0]);
    }

    #[test]
    fn test_symbolic_leaf() {
        let n = Variable::new("n", 1, 4).unwrap();
        let shape = vec![Node::from(n.clone()), Node::num(2)];
        let x = RawBuffer::from_values(&[1.0; 8], DType::Float32);
        let sum = LazyOp::new(
            Op::Reduce(ReduceOp::Sum),
            vec![mem_op(1, DType::Float32, ShapeTracker::from_shape(&shape).unwrap()).into()],
            OpArg::Shape(vec![Node::num(1), Node::num(2)]),
        );
        let var_vals = VarVals::from([(n, 3)]);
        assert_eq!(run(&sum, &[x], 2, &var_vals), vec![3.0, 3.0]);
    }

    #[test]
    fn test_int_division_truncates() {
        let a = RawBuffer::from_elems(&[7i32, -7]);
        let two = const_op(2.0, DType::Int32, st(&[2]));
        let div = LazyOp::new(
            Op::Binary(BinaryOp::Div),
            vec![mem_op(1, DType::Int32, st(&[2])).into(), two.into()],
            OpArg::None,
        );
        let out = RawBuffer::new(2, DType::Int32);
        Interpreter::new("CPU").exec_ast(&div, &out, &[a], &VarVals::new()).unwrap();
        assert_eq!(out.to_vec::<i32>().unwrap(), vec![3, -3]);
    }
}
