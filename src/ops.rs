use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Display, Write},
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    dtype::DType,
    shape_tracker::ShapeTracker,
    symbolic::{render_shape, sym_prod, Node, Variable},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnaryOp {
    Noop,
    Exp2,
    Log2,
    Cast,
    Sin,
    Sqrt,
    Recip,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Mod,
    CmpLt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TernaryOp {
    MulAcc,
    Where,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReduceOp {
    Sum,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MovementOp {
    Reshape,
    Permute,
    Expand,
    Pad,
    Shrink,
    Stride,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoadOp {
    Empty,
    Rand,
    Const,
    From,
    Contiguous,
    Custom,
}

/// Leaves of a scheduled AST. They never appear on lazy buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferOp {
    Mem,
    Const,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Reduce(ReduceOp),
    Movement(MovementOp),
    Load(LoadOp),
    Buffer(BufferOp),
}

/// Coarse kind of the op that produces a lazy buffer. Unary, binary and
/// ternary ops all count as elementwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpType {
    Elementwise,
    Reduce,
    Movement,
    Load,
    Buffer,
}

impl Op {
    pub fn optype(self) -> OpType {
        match self {
            Op::Unary(_) | Op::Binary(_) | Op::Ternary(_) => OpType::Elementwise,
            Op::Reduce(_) => OpType::Reduce,
            Op::Movement(_) => OpType::Movement,
            Op::Load(_) => OpType::Load,
            Op::Buffer(_) => OpType::Buffer,
        }
    }

    pub fn is_elementwise(self) -> bool {
        self.optype() == OpType::Elementwise
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (group, name) = match self {
            Op::Unary(o) => ("UnaryOps", format!("{o:?}")),
            Op::Binary(o) => ("BinaryOps", format!("{o:?}")),
            Op::Ternary(o) => ("TernaryOps", format!("{o:?}")),
            Op::Reduce(o) => ("ReduceOps", format!("{o:?}")),
            Op::Movement(o) => ("MovementOps", format!("{o:?}")),
            Op::Load(o) => ("LoadOps", format!("{o:?}")),
            Op::Buffer(o) => ("BufferOps", format!("{o:?}")),
        };
        write!(f, "{group}.{}", name.to_uppercase())
    }
}

/// Handle of a lazy buffer in its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<LB {}>", self.0)
    }
}

/// A float constant that can be hashed, compared bitwise.
#[derive(Clone, Copy, Debug)]
pub struct ConstValue(pub f64);

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for ConstValue {}

impl Hash for ConstValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// A host function run by `LoadOp::Custom`. It gets the realized sources as
/// f64 values and returns the values of the output.
#[derive(Clone, Copy)]
pub struct CustomFn {
    pub name: &'static str,
    pub f: fn(&[Vec<f64>]) -> Vec<f64>,
}

impl CustomFn {
    fn addr(self) -> usize {
        self.f as usize
    }
}

impl PartialEq for CustomFn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.addr() == other.addr()
    }
}

impl Eq for CustomFn {}

impl Hash for CustomFn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.addr().hash(state);
    }
}

impl std::fmt::Debug for CustomFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CustomFn({})", self.name)
    }
}

/// Slot `idx` of a kernel's buffer list, read through `st`. Slot 0 is the output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemBuffer {
    pub idx: usize,
    pub dtype: DType,
    pub st: ShapeTracker,
}

/// A constant broadcast through `st`, masked like a buffer would be.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConstBuffer {
    pub val: ConstValue,
    pub dtype: DType,
    pub st: ShapeTracker,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpArg {
    None,
    /// Reshape, expand and reduce targets.
    Shape(Vec<Node>),
    /// Permute order.
    Axes(Vec<usize>),
    /// Pad amounts, or shrink bounds.
    Pairs(Vec<(i64, i64)>),
    Strides(Vec<i64>),
    /// Target dtype and whether the cast reinterprets bits.
    Cast(DType, bool),
    Const(ConstValue),
    Seed(u64),
    Custom(CustomFn),
    Mem(MemBuffer),
    ConstBuf(ConstBuffer),
}

impl OpArg {
    pub fn shape(&self) -> Option<&[Node]> {
        match self {
            OpArg::Shape(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LazySrc {
    Op(Arc<LazyOp>),
    Buffer(BufferId),
}

impl LazySrc {
    pub fn as_op(&self) -> Option<&Arc<LazyOp>> {
        match self {
            LazySrc::Op(op) => Some(op),
            LazySrc::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<BufferId> {
        match self {
            LazySrc::Buffer(b) => Some(*b),
            LazySrc::Op(_) => None,
        }
    }

    fn buffers(&self) -> Vec<BufferId> {
        match self {
            LazySrc::Op(op) => op.buffers.clone(),
            LazySrc::Buffer(b) => vec![*b],
        }
    }
}

impl From<LazyOp> for LazySrc {
    fn from(op: LazyOp) -> Self {
        LazySrc::Op(Arc::new(op))
    }
}

impl From<BufferId> for LazySrc {
    fn from(b: BufferId) -> Self {
        LazySrc::Buffer(b)
    }
}

/// An immutable op tree. Leaves are lazy buffers, or buffer ops once scheduled.
#[derive(Clone, Debug)]
pub struct LazyOp {
    op: Op,
    srcs: Vec<LazySrc>,
    arg: OpArg,
    // leaf buffers in source order, duplicates kept
    buffers: Vec<BufferId>,
}

impl PartialEq for LazyOp {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op && self.arg == other.arg && self.srcs == other.srcs
    }
}

impl Eq for LazyOp {}

impl Hash for LazyOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.op.hash(state);
        self.srcs.hash(state);
        self.arg.hash(state);
    }
}

impl LazyOp {
    pub fn new(op: Op, srcs: Vec<LazySrc>, arg: OpArg) -> LazyOp {
        let buffers = srcs.iter().flat_map(LazySrc::buffers).collect();
        LazyOp {
            op,
            srcs,
            arg,
            buffers,
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn srcs(&self) -> &[LazySrc] {
        &self.srcs
    }

    pub fn arg(&self) -> &OpArg {
        &self.arg
    }

    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    /// This op and every op below it, pre-order.
    pub fn get_lazyops(&self) -> Vec<&LazyOp> {
        let mut out = vec![self];
        for s in &self.srcs {
            if let LazySrc::Op(op) = s {
                out.extend(op.get_lazyops());
            }
        }
        out
    }

    /// Replace buffer leaves found in `real_srcs`, keeping the rest.
    #[must_use]
    pub fn map_buffers(&self, real_srcs: &HashMap<BufferId, LazySrc>) -> LazyOp {
        let srcs = self
            .srcs
            .iter()
            .map(|s| match s {
                LazySrc::Buffer(b) => real_srcs.get(b).cloned().unwrap_or(LazySrc::Buffer(*b)),
                LazySrc::Op(op) => LazySrc::Op(Arc::new(op.map_buffers(real_srcs))),
            })
            .collect();
        LazyOp::new(self.op, srcs, self.arg.clone())
    }

    /// Identity of a kernel, a pure function of the op tree. Lazy buffer
    /// leaves are anonymous so two graphs with the same structure agree.
    pub fn key(&self) -> String {
        let mut out = String::new();
        self.write_key(&mut out);
        out
    }

    fn write_key(&self, out: &mut String) {
        let _ = write!(out, "({}", self.op);
        for s in &self.srcs {
            out.push(' ');
            match s {
                LazySrc::Op(op) => op.write_key(out),
                LazySrc::Buffer(_) => out.push_str("LazyBuffer"),
            }
        }
        match &self.arg {
            OpArg::None => {}
            OpArg::Mem(m) => {
                let _ = write!(out, " {} {} {:?}", m.idx, m.dtype, m.st);
            }
            OpArg::ConstBuf(c) => {
                let _ = write!(out, " {} {} {:?}", c.val.0, c.dtype, c.st);
            }
            arg => {
                let _ = write!(out, " {arg:?}");
            }
        }
        out.push(')');
    }
}

/// Structural estimate for one AST.
#[derive(Clone, Debug, PartialEq)]
pub struct OpInfo {
    pub shape: Vec<Node>,
    pub dtype: DType,
    pub flops: Node,
    /// Bytes read per buffer slot.
    pub mem: BTreeMap<usize, i64>,
}

impl OpInfo {
    /// Bytes moved: every input slot plus the output.
    pub fn mem_estimate(&self) -> Node {
        let inputs: i64 = self.mem.values().sum();
        sym_prod(&self.shape).times(self.dtype.itemsize() as i64) + inputs
    }
}

/// Shape after a movement op, for ASTs that still carry one.
fn movement_shape(op: MovementOp, shape: &[Node], arg: &OpArg) -> Vec<Node> {
    match (op, arg) {
        (MovementOp::Reshape | MovementOp::Expand, OpArg::Shape(s)) => s.clone(),
        (MovementOp::Permute, OpArg::Axes(axes)) => axes.iter().map(|a| shape[*a].clone()).collect(),
        (MovementOp::Pad, OpArg::Pairs(p)) => shape
            .iter()
            .zip(p)
            .map(|(s, (b, e))| s + (b + e))
            .collect(),
        (MovementOp::Shrink, OpArg::Pairs(p)) => p.iter().map(|(b, e)| Node::num(e - b)).collect(),
        (MovementOp::Stride, OpArg::Strides(st)) => shape
            .iter()
            .zip(st)
            .map(|(s, m)| (s + (m.abs() - 1)) / m.abs())
            .collect(),
        _ => panic!("bad arg {arg:?} for {op:?}"),
    }
}

#[derive(Default)]
struct Analyzer<'a> {
    seen: HashMap<&'a LazyOp, OpInfo>,
}

impl<'a> Analyzer<'a> {
    fn src(&mut self, s: &'a LazySrc) -> OpInfo {
        match s {
            LazySrc::Op(op) => self.run(op),
            LazySrc::Buffer(b) => panic!("unscheduled buffer {b} in AST"),
        }
    }

    fn run(&mut self, ast: &'a LazyOp) -> OpInfo {
        // a repeated subtree is computed once, so its flops only count once
        if let Some(info) = self.seen.get(ast) {
            return OpInfo {
                flops: Node::num(0),
                ..info.clone()
            };
        }
        let info = self.compute(ast);
        self.seen.insert(ast, info.clone());
        info
    }

    fn compute(&mut self, ast: &'a LazyOp) -> OpInfo {
        match (ast.op, &ast.arg) {
            (Op::Buffer(BufferOp::Mem), OpArg::Mem(m)) => OpInfo {
                shape: m.st.shape().to_vec(),
                dtype: m.dtype,
                flops: Node::num(0),
                mem: BTreeMap::from([(m.idx, m.dtype.itemsize() as i64 * m.st.size())]),
            },
            (Op::Buffer(BufferOp::Const), OpArg::ConstBuf(c)) => OpInfo {
                shape: c.st.shape().to_vec(),
                dtype: c.dtype,
                flops: Node::num(0),
                mem: BTreeMap::new(),
            },
            (Op::Unary(UnaryOp::Cast), OpArg::Cast(dtype, _)) => OpInfo {
                dtype: *dtype,
                ..self.src(&ast.srcs[0])
            },
            (Op::Unary(_), _) => {
                let x = self.src(&ast.srcs[0]);
                OpInfo {
                    flops: &x.flops + &sym_prod(&x.shape),
                    ..x
                }
            }
            (Op::Binary(_) | Op::Ternary(_), _) => {
                let infos: Vec<OpInfo> = ast.srcs.iter().map(|s| self.src(s)).collect();
                let shape = infos[0].shape.clone();
                let dtype = match ast.op {
                    Op::Ternary(TernaryOp::Where) => infos[1].dtype,
                    _ => infos[0].dtype.max(infos[1].dtype),
                };
                let mut flops = sym_prod(&shape);
                let mut mem = BTreeMap::new();
                for i in infos {
                    flops = flops + i.flops;
                    mem.extend(i.mem);
                }
                OpInfo {
                    shape,
                    dtype,
                    flops,
                    mem,
                }
            }
            (Op::Reduce(_), OpArg::Shape(new_shape)) => {
                let x = self.src(&ast.srcs[0]);
                OpInfo {
                    flops: &x.flops + &sym_prod(&x.shape),
                    shape: new_shape.clone(),
                    ..x
                }
            }
            (Op::Movement(m), arg) => {
                let x = self.src(&ast.srcs[0]);
                OpInfo {
                    shape: movement_shape(m, &x.shape, arg),
                    ..x
                }
            }
            (op, arg) => panic!("can't analyze {op} with {arg:?}"),
        }
    }
}

/// Output shape, dtype, flops and memory traffic of a scheduled AST.
pub fn get_info(ast: &LazyOp) -> OpInfo {
    Analyzer::default().run(ast)
}

/// Symbolic variables used by the leaves of a scheduled AST, sorted.
pub fn vars_from_ast(ast: &LazyOp) -> Vec<Variable> {
    let mut vars: Vec<Variable> = vec![];
    for op in ast.get_lazyops() {
        let st = match op.arg() {
            OpArg::Mem(m) => &m.st,
            OpArg::ConstBuf(c) => &c.st,
            _ => continue,
        };
        for v in st.vars() {
            if !vars.contains(&v) {
                vars.push(v);
            }
        }
    }
    vars.sort();
    vars
}

/// `Mem` leaf for slot `idx`.
pub fn mem_op(idx: usize, dtype: DType, st: ShapeTracker) -> LazyOp {
    LazyOp::new(
        Op::Buffer(BufferOp::Mem),
        vec![],
        OpArg::Mem(MemBuffer { idx, dtype, st }),
    )
}

/// `Const` leaf.
pub fn const_op(val: f64, dtype: DType, st: ShapeTracker) -> LazyOp {
    LazyOp::new(
        Op::Buffer(BufferOp::Const),
        vec![],
        OpArg::ConstBuf(ConstBuffer {
            val: ConstValue(val),
            dtype,
            st,
        }),
    )
}

impl Display for OpArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpArg::None => Ok(()),
            OpArg::Shape(s) => write!(f, "{}", render_shape(s)),
            OpArg::Axes(a) => write!(f, "{a:?}"),
            OpArg::Pairs(p) => write!(f, "{p:?}"),
            OpArg::Strides(s) => write!(f, "{s:?}"),
            OpArg::Cast(dtype, bitcast) => write!(f, "({dtype}, {bitcast})"),
            OpArg::Const(c) => write!(f, "{}", c.0),
            OpArg::Seed(s) => write!(f, "seed={s}"),
            OpArg::Custom(c) => write!(f, "{}", c.name),
            OpArg::Mem(m) => write!(f, "MemBuffer(idx={}, dtype={}, st={})", m.idx, m.dtype, m.st),
            OpArg::ConstBuf(c) => {
                write!(f, "ConstBuffer(val={}, dtype={}, st={})", c.val.0, c.dtype, c.st)
            }
        }
    }
}
