use std::{collections::HashMap, fmt::Display};

use log::trace;
use smallvec::SmallVec;

use crate::{
    dtype::DType,
    image::{to_image_idx, ImageConfig},
    kernel::{int_dim, Kernel, KernelBuffer},
    ops::{
        get_info, vars_from_ast, BinaryOp, ConstValue, LazyOp, LazySrc, MovementOp, Op, OpArg, ReduceOp,
        TernaryOp, UnaryOp,
    },
    shape_tracker::ShapeTracker,
    symbolic::{iter_idxs, sym_prod, Node, NodeKind, Variable},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UOpKind {
    Loop,
    End,
    Special,
    DefineGlobal,
    DefineLocal,
    DefineAcc,
    Load,
    Store,
    Const,
    Barrier,
    Alu,
    Wmma,
    Cast,
    Gep,
}

impl Display for UOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UOpKind::Loop => "LOOP",
            UOpKind::End => "END",
            UOpKind::Special => "SPECIAL",
            UOpKind::DefineGlobal => "DEFINE_GLOBAL",
            UOpKind::DefineLocal => "DEFINE_LOCAL",
            UOpKind::DefineAcc => "DEFINE_ACC",
            UOpKind::Load => "LOAD",
            UOpKind::Store => "STORE",
            UOpKind::Const => "CONST",
            UOpKind::Barrier => "BARRIER",
            UOpKind::Alu => "ALU",
            UOpKind::Wmma => "WMMA",
            UOpKind::Cast => "CAST",
            UOpKind::Gep => "GEP",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UOpArg {
    None,
    Value(ConstValue),
    Alu(Op),
    /// Device buffer parameter `data{idx}`, bound to buffer slot `idx`.
    Global { idx: usize, dtype: DType },
    /// A symbolic variable passed as a kernel parameter.
    Var(Variable),
    Local { name: String, size: i64 },
    /// A launch index. `dim` counts from the innermost dimension.
    Special { dim: usize, name: String, size: Node },
    Lane(usize),
    Cast { bitcast: bool },
}

impl Display for UOpArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UOpArg::None => Ok(()),
            UOpArg::Value(v) => write!(f, "{}", v.0),
            UOpArg::Alu(op) => write!(f, "{op}"),
            UOpArg::Global { idx, dtype } => write!(f, "(data{idx}, {dtype})"),
            UOpArg::Var(v) => write!(f, "{v}"),
            UOpArg::Local { name, size } => write!(f, "({name}, {size})"),
            UOpArg::Special { dim, name, size } => write!(f, "({dim}, {name}, {size})"),
            UOpArg::Lane(l) => write!(f, "{l}"),
            UOpArg::Cast { bitcast } => write!(f, "bitcast={bitcast}"),
        }
    }
}

/// One instruction of a linearized kernel. `vin` holds the `num`s of the
/// operands, which always come earlier in the program.
#[derive(Clone, Debug, PartialEq)]
pub struct UOp {
    pub kind: UOpKind,
    pub dtype: Option<DType>,
    pub vin: SmallVec<[usize; 4]>,
    pub arg: UOpArg,
    pub num: usize,
}

type UOpKey = (UOpKind, Option<DType>, SmallVec<[usize; 4]>, UOpArg);

/// A loop or launch index and the extent it runs over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopVar {
    pub var: Variable,
    pub size: Node,
}

impl LoopVar {
    fn new(name: &str, size: &Node) -> LoopVar {
        LoopVar {
            var: Variable::loop_var(name, 0, (size.max() - 1).max(0)),
            size: size.clone(),
        }
    }

    fn node(&self) -> Node {
        Node::from(self.var.clone())
    }

    fn is_const(&self) -> bool {
        self.var.vmin() == self.var.vmax()
    }
}

/// Kernel names seen so far, so repeats get an `n1`, `n2`, ... suffix.
#[derive(Clone, Debug, Default)]
pub struct NameCounter {
    counts: HashMap<String, usize>,
}

impl NameCounter {
    pub fn next(&mut self, base: &str) -> String {
        let count = self.counts.entry(base.to_string()).or_insert(0);
        *count += 1;
        if *count > 1 {
            format!("{base}n{}", *count - 1)
        } else {
            base.to_string()
        }
    }
}

/// Index variables for `dims`, folded into at most `maxdim` hardware
/// dimensions when `maxdim` is not 0. The innermost hardware dimension
/// carries the product of the rest and is split back with div and mod.
pub fn get_grouped_dims(prefix: &str, start: usize, dims: &[Node], maxdim: usize) -> (Vec<Node>, Vec<LoopVar>) {
    let grouped = maxdim != 0 && dims.len() > maxdim;
    let sizes: Vec<Node> = if grouped {
        let mut s = dims[..maxdim - 1].to_vec();
        s.push(sym_prod(&dims[maxdim - 1..]));
        s
    } else {
        dims.to_vec()
    };
    let loop_vars: Vec<LoopVar> = sizes
        .iter()
        .enumerate()
        .map(|(i, s)| LoopVar::new(&format!("{prefix}{}", start + i), s))
        .collect();
    let mut idxs: Vec<Node> = loop_vars.iter().map(LoopVar::node).collect();
    if grouped {
        let mut dd = idxs[maxdim - 1].clone();
        let mut nli = vec![];
        let rest = &dims[maxdim - 1..];
        for (j, s) in rest.iter().enumerate().rev() {
            if j == 0 {
                nli.push(dd.clone());
            } else {
                let s = int_dim(s);
                nli.push(&dd % s);
                dd = &dd / s;
            }
        }
        nli.reverse();
        idxs.truncate(maxdim - 1);
        idxs.extend(nli);
    }
    (idxs, loop_vars.into_iter().filter(|v| !v.is_const()).collect())
}

fn kernel_name(kernel: &Kernel) -> String {
    let prefix = if kernel.reduceop.is_some() { "r_" } else { "E_" };
    let dims: Vec<String> = kernel
        .full_shape()
        .iter()
        .map(|s| match s.as_num() {
            Some(n) => n.to_string(),
            None => s
                .render()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect(),
        })
        .collect();
    format!("{prefix}{}", dims.join("_"))
}

fn reduce_alu(op: ReduceOp) -> Op {
    match op {
        ReduceOp::Sum => Op::Binary(BinaryOp::Add),
        ReduceOp::Max => Op::Binary(BinaryOp::Max),
    }
}

fn reduce_identity(op: ReduceOp) -> f64 {
    match op {
        ReduceOp::Sum => 0.0,
        ReduceOp::Max => f64::NEG_INFINITY,
    }
}

fn src_op(s: &LazySrc) -> &LazyOp {
    match s {
        LazySrc::Op(op) => op.as_ref(),
        LazySrc::Buffer(b) => panic!("unscheduled buffer {b} in a kernel"),
    }
}

/// Lowers a shaped [`Kernel`] into a flat list of [`UOp`]s.
pub struct Linearizer {
    pub kernel: Kernel,
    pub uops: Vec<UOp>,
    pub name: String,
    pub global_size: Option<Vec<Node>>,
    pub local_size: Option<Vec<Node>>,
    pub image: ImageConfig,
    // every uop ever made, by id; `order` is the program
    nodes: Vec<UOp>,
    order: Vec<usize>,
    saved_exprs: HashMap<UOpKey, usize>,
    load_cache: HashMap<String, usize>,
    loop_uops: HashMap<String, usize>,
    buf_uops: Vec<Option<usize>>,
}

impl Linearizer {
    pub fn new(kernel: Kernel) -> Linearizer {
        Linearizer {
            kernel,
            uops: vec![],
            name: String::new(),
            global_size: None,
            local_size: None,
            image: ImageConfig::default(),
            nodes: vec![],
            order: vec![],
            saved_exprs: HashMap::new(),
            load_cache: HashMap::new(),
            loop_uops: HashMap::new(),
            buf_uops: vec![],
        }
    }

    fn node(&self, id: usize) -> &UOp {
        &self.nodes[id]
    }

    fn const_val(&self, id: usize) -> Option<f64> {
        match (&self.nodes[id].kind, &self.nodes[id].arg) {
            (UOpKind::Const, UOpArg::Value(v)) => Some(v.0),
            _ => None,
        }
    }

    fn is_alu(&self, id: usize, op: Op) -> bool {
        self.nodes[id].kind == UOpKind::Alu && self.nodes[id].arg == UOpArg::Alu(op)
    }

    fn push(&mut self, kind: UOpKind, dtype: Option<DType>, vin: SmallVec<[usize; 4]>, arg: UOpArg) -> usize {
        let num = self.nodes.len();
        self.nodes.push(UOp {
            kind,
            dtype,
            vin,
            arg,
            num,
        });
        self.order.push(num);
        num
    }

    pub(crate) fn constant(&mut self, v: f64, dtype: DType) -> usize {
        self.uop(UOpKind::Const, Some(dtype), &[], UOpArg::Value(ConstValue(v)), true)
    }

    /// Add a uop after peephole rewrites, reusing an identical one if
    /// `cachable`.
    fn uop(&mut self, kind: UOpKind, dtype: Option<DType>, vin: &[usize], arg: UOpArg, cachable: bool) -> usize {
        match kind {
            UOpKind::Store if vin.len() == 2 && vin[0] == vin[1] => return vin[0],
            UOpKind::Gep => {
                if let (Some(v), Some(d)) = (self.const_val(vin[0]), dtype) {
                    return self.constant(v, d);
                }
            }
            UOpKind::Cast if !vin.is_empty() => {
                let geps = vin.iter().enumerate().all(|(i, &x)| {
                    self.node(x).kind == UOpKind::Gep
                        && self.node(x).arg == UOpArg::Lane(i)
                        && self.node(x).vin[0] == self.node(vin[0]).vin[0]
                });
                if geps && vin.len() > 1 && self.node(self.node(vin[0]).vin[0]).dtype.map(DType::sz) == Some(vin.len()) {
                    return self.node(vin[0]).vin[0];
                }
                if vin.len() > 1 {
                    if let (Some(first), Some(d)) = (self.const_val(vin[0]), dtype) {
                        if vin.iter().all(|&x| self.const_val(x) == Some(first)) {
                            return self.constant(first, d);
                        }
                    }
                }
            }
            UOpKind::Alu => {
                if let UOpArg::Alu(op) = arg {
                    if let Some(r) = self.fold_alu(op, dtype, vin, cachable) {
                        return r;
                    }
                }
            }
            _ => {}
        }

        let key: UOpKey = (kind, dtype, SmallVec::from_slice(vin), arg);
        if cachable {
            if let Some(&id) = self.saved_exprs.get(&key) {
                return id;
            }
        }
        let (kind, dtype, vin, arg) = key;
        let id = self.push(kind, dtype, vin.clone(), arg.clone());
        if cachable {
            self.saved_exprs.insert((kind, dtype, vin, arg), id);
        }
        id
    }

    fn fold_alu(&mut self, op: Op, dtype: Option<DType>, vin: &[usize], cachable: bool) -> Option<usize> {
        let neg = Op::Unary(UnaryOp::Neg);
        match (op, vin) {
            (Op::Binary(BinaryOp::Add), &[a, b]) if self.is_alu(b, neg) => {
                let inner = self.node(b).vin[0];
                return Some(self.uop(UOpKind::Alu, dtype, &[a, inner], UOpArg::Alu(Op::Binary(BinaryOp::Sub)), cachable));
            }
            (Op::Unary(UnaryOp::Neg), &[a]) => {
                if let (Some(v), Some(d)) = (self.const_val(a), dtype) {
                    return Some(self.constant(-v, d));
                }
            }
            (Op::Binary(BinaryOp::Add), &[a, b]) => {
                if self.const_val(a) == Some(0.0) {
                    return Some(b);
                }
                if self.const_val(b) == Some(0.0) {
                    return Some(a);
                }
            }
            (Op::Binary(BinaryOp::Mul), &[a, b]) => {
                for (x, y) in [(a, b), (b, a)] {
                    match self.const_val(x) {
                        Some(v) if v == 1.0 => return Some(y),
                        Some(v) if v == 0.0 => return Some(x),
                        _ => {}
                    }
                }
            }
            (Op::Binary(BinaryOp::Sub), &[a, b]) if self.const_val(b) == Some(0.0) => return Some(a),
            (Op::Binary(BinaryOp::Div), &[a, b]) if self.const_val(b) == Some(1.0) => return Some(a),
            _ => {}
        }
        None
    }

    fn alu_idx(&mut self, op: BinaryOp, a: usize, b: i64, dtype: DType) -> usize {
        #[allow(clippy::cast_precision_loss)]
        let b = self.constant(b as f64, DType::Int32);
        self.uop(UOpKind::Alu, Some(dtype), &[a, b], UOpArg::Alu(Op::Binary(op)), true)
    }

    /// Index arithmetic as int32 uops, booleans for comparisons.
    fn render_node(&mut self, n: &Node) -> usize {
        match n.kind() {
            NodeKind::Num(v) => {
                #[allow(clippy::cast_precision_loss)]
                let v = *v as f64;
                self.constant(v, DType::Int32)
            }
            NodeKind::Var(v) => match self.loop_uops.get(v.name()) {
                Some(&id) => id,
                None => panic!("no uop for variable {v}"),
            },
            NodeKind::Mul(a, b) => {
                let a = self.render_node(a);
                self.alu_idx(BinaryOp::Mul, a, *b, DType::Int32)
            }
            NodeKind::Div(a, b) => {
                let a = self.render_node(a);
                self.alu_idx(BinaryOp::Div, a, *b, DType::Int32)
            }
            NodeKind::Mod(a, b) => {
                let a = self.render_node(a);
                self.alu_idx(BinaryOp::Mod, a, *b, DType::Int32)
            }
            NodeKind::Lt(a, b) => {
                let a = self.render_node(a);
                self.alu_idx(BinaryOp::CmpLt, a, *b, DType::Bool)
            }
            NodeKind::Sum(nodes) | NodeKind::And(nodes) => {
                let (op, dtype) = if matches!(n.kind(), NodeKind::Sum(_)) {
                    (BinaryOp::Add, DType::Int32)
                } else {
                    (BinaryOp::Mul, DType::Bool)
                };
                let mut acc = self.render_node(&nodes[0]);
                for x in &nodes[1..] {
                    let b = self.render_node(x);
                    acc = self.uop(UOpKind::Alu, Some(dtype), &[acc, b], UOpArg::Alu(Op::Binary(op)), true);
                }
                acc
            }
        }
    }

    fn render_loop(&mut self, vars: &[LoopVar]) -> Vec<usize> {
        let mut loops = vec![];
        for v in vars.iter().filter(|v| !v.is_const()) {
            let start = self.constant(0.0, DType::Int32);
            let end = self.render_node(&v.size);
            let id = self.uop(UOpKind::Loop, Some(DType::Int32), &[start, end], UOpArg::None, false);
            self.loop_uops.insert(v.var.name().to_string(), id);
            loops.push(id);
        }
        loops
    }

    fn end_loops(&mut self, loops: &[usize]) {
        for &l in loops.iter().rev() {
            self.uop(UOpKind::End, None, &[l], UOpArg::None, false);
        }
    }

    fn local_type(&self, i: usize, amt: usize) -> DType {
        match amt {
            4 => DType::Float4,
            2 => DType::Float2,
            _ => self.kernel.bufs[i].dtype().scalar(),
        }
    }

    fn rendered_index(&mut self, i: usize, idx: &Node, valid: &Node) -> (usize, Node) {
        if let Some(base_shape) = self.kernel.bufs[i].dtype().image_shape() {
            let ((x, y), valid) = to_image_idx(base_shape, idx, valid, &self.image);
            let rx = self.render_node(&x);
            let ry = self.render_node(&y);
            let id = self.uop(UOpKind::Cast, Some(DType::Int2), &[rx, ry], UOpArg::Cast { bitcast: false }, true);
            (id, valid)
        } else {
            (self.render_node(idx), valid.clone())
        }
    }

    /// Loads of buffer `i` for every upcasted lane of `idxs`. With `acc`
    /// it defines accumulators initialized to that value instead.
    fn global_load(&mut self, i: usize, idxs: &[Node], acc: Option<f64>, barrier: Option<usize>) -> Vec<usize> {
        let buf = self.kernel.bufs[i].clone();
        let konst = match &buf {
            KernelBuffer::Const(c) => Some(c.val.0),
            _ => acc,
        };

        let mut amt = 1;
        let mut dim = None;
        let upcast_dim = self.kernel.get_upcast_dim(i);
        let mut float4_first = None;
        if let [d] = upcast_dim.as_slice() {
            let expanded = idxs[*d].expand_default();
            if expanded.len() == 4 || expanded.len() == 2 {
                dim = Some(*d);
                amt = expanded.len();
                float4_first = Some(expanded[0].clone());
            }
        }

        let expand_vars: Vec<Option<Variable>> = idxs
            .iter()
            .enumerate()
            .map(|(j, idx)| {
                idx.expand_idx()
                    .map(|v| Variable::loop_var(&format!("_uidx{j}"), v.vmin(), v.vmax()))
            })
            .collect();
        let fake_idxs: Vec<Node> = idxs
            .iter()
            .zip(&expand_vars)
            .map(|(idx, ev)| match (idx.expand_idx(), ev) {
                (Some(v), Some(ev)) => idx.substitute(&[(v, Node::from(ev.clone()))].into()),
                _ => idx.clone(),
            })
            .collect();

        let st = self.kernel.sts[i].clone();
        let (mut g_idx, mut g_valid) = st.expr_idxs(Some(fake_idxs.as_slice()));
        if let (Some(d), Some(first)) = (dim, float4_first) {
            let mut grouped = fake_idxs.clone();
            grouped[d] = first;
            let (idx, valid) = st.expr_idxs(Some(grouped.as_slice()));
            #[allow(clippy::cast_possible_wrap)]
            let a = amt as i64;
            if (&idx / a) * a == idx {
                (g_idx, g_valid) = (idx, valid);
            } else {
                trace!("unaligned float{amt} load of buffer {i}, loading scalars");
                amt = 1;
                dim = None;
            }
        }
        let localtype = self.local_type(i, amt);
        let buf_name = match &buf {
            KernelBuffer::Mem(m) => m.idx.to_string(),
            KernelBuffer::Local { name, .. } => name.clone(),
            KernelBuffer::Const(_) => String::new(),
        };

        let ranges: Vec<(i64, i64)> = expand_vars
            .iter()
            .map(|v| v.as_ref().map_or((0, 0), |v| (v.vmin(), v.vmax())))
            .collect();
        let mut ret = vec![];
        for rep in iter_idxs(&ranges) {
            let sub = expand_vars
                .iter()
                .zip(&rep)
                .filter_map(|(v, r)| v.clone().map(|v| (v, Node::num(*r))))
                .collect();
            let (mut idx, mut valid) = (g_idx.substitute(&sub), g_valid.substitute(&sub));
            let mut this_const = konst;
            if valid.max() == 0 {
                (this_const, idx, valid) = (Some(0.0), Node::num(0), Node::num(1));
            }

            let src = match this_const {
                Some(c) if acc.is_none() => format!("{c}"),
                _ => buf_name.clone(),
            };
            let key = format!("{acc:?}{localtype}{src}{}{}", idx.render(), valid.render());

            let id = match self.load_cache.get(&key) {
                Some(&id) => id,
                None => {
                    let id = if acc.is_some() {
                        assert!(valid.min() == 1, "accumulators are always valid");
                        let v = this_const.unwrap_or(0.0);
                        self.uop(UOpKind::DefineAcc, Some(localtype), &[], UOpArg::Value(ConstValue(v)), false)
                    } else if let Some(c) = this_const {
                        let id = self.constant(c, localtype);
                        if valid.min() == 0 && valid.max() == 1 {
                            let cond = self.render_node(&valid);
                            let zero = self.constant(0.0, localtype);
                            self.uop(
                                UOpKind::Alu,
                                Some(localtype),
                                &[cond, id, zero],
                                UOpArg::Alu(Op::Ternary(TernaryOp::Where)),
                                true,
                            )
                        } else {
                            id
                        }
                    } else {
                        let buf_uop = match self.buf_uops[i] {
                            Some(b) => b,
                            None => panic!("buffer {i} has no uop"),
                        };
                        let (rendered_idx, valid) = self.rendered_index(i, &idx, &valid);
                        let mut vin: SmallVec<[usize; 4]> = SmallVec::from_slice(&[buf_uop, rendered_idx]);
                        if valid.min() == 0 {
                            vin.push(self.render_node(&valid));
                            vin.push(self.constant(0.0, localtype));
                        }
                        vin.extend(barrier);
                        self.uop(UOpKind::Load, Some(localtype), &vin, UOpArg::None, true)
                    };
                    self.load_cache.insert(key, id);
                    id
                }
            };

            ret.push(match dim {
                Some(d) => {
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                    let lane = rep[d] as usize;
                    self.uop(UOpKind::Gep, Some(localtype.scalar()), &[id], UOpArg::Lane(lane), true)
                }
                None => id,
            });
        }
        ret
    }

    /// Store `store` to buffer `i`, one value per upcasted lane of `idxs`,
    /// grouped into vector stores when the lanes are contiguous.
    fn global_store(&mut self, i: usize, idxs: &[Node], store: &[usize]) -> Vec<usize> {
        let buf_uop = match self.buf_uops[i] {
            Some(b) => b,
            None => panic!("buffer {i} has no uop"),
        };
        let expanded: Vec<Vec<Node>> = idxs.iter().map(Node::expand_default).collect();
        #[allow(clippy::cast_possible_wrap)]
        let ranges: Vec<(i64, i64)> = expanded.iter().map(|e| (0, e.len() as i64 - 1)).collect();
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let offsets: Vec<Vec<Node>> = iter_idxs(&ranges)
            .into_iter()
            .map(|rep| rep.iter().zip(&expanded).map(|(r, e)| e[*r as usize].clone()).collect())
            .collect();
        assert_eq!(offsets.len(), store.len(), "one value per store");
        let mut store_offset: Vec<(Vec<Node>, usize)> = offsets.into_iter().zip(store.iter().copied()).collect();

        let st = self.kernel.sts[i].clone();
        let upcast_dim = self.kernel.get_upcast_dim(i);
        if let [d] = upcast_dim.as_slice() {
            let d = *d;
            if expanded[d].len() == 2 || expanded[d].len() == 4 {
                let mut grouped: Vec<(Vec<Node>, Vec<usize>)> = vec![];
                for (k, v) in &store_offset {
                    let mut key = k.clone();
                    key[d] = expanded[d][0].clone();
                    match grouped.iter_mut().find(|(g, _)| *g == key) {
                        Some((_, tokens)) => tokens.push(*v),
                        None => grouped.push((key, vec![*v])),
                    }
                }
                let aligned = grouped.iter().all(|(k, tokens)| {
                    let (idx, valid) = st.expr_idxs(Some(k.as_slice()));
                    #[allow(clippy::cast_possible_wrap)]
                    let amt = tokens.len() as i64;
                    (&idx / amt) * amt == idx && valid.min() == 1
                });
                if aligned {
                    store_offset = grouped
                        .into_iter()
                        .map(|(k, tokens)| {
                            let dtype = if tokens.len() == 4 { DType::Float4 } else { DType::Float2 };
                            let cast = self.uop(UOpKind::Cast, Some(dtype), &tokens, UOpArg::Cast { bitcast: false }, true);
                            (k, cast)
                        })
                        .collect();
                } else {
                    trace!("unaligned vector store to buffer {i}, storing scalars");
                }
            }
        }

        let mut stores = vec![];
        for (k, var) in store_offset {
            let (idx, valid) = st.expr_idxs(Some(k.as_slice()));
            let (rendered_idx, _) = self.rendered_index(i, &idx, &valid);
            stores.push(self.uop(UOpKind::Store, None, &[buf_uop, rendered_idx, var], UOpArg::None, false));
        }
        stores
    }

    /// `acc[off] = op(vals.., acc[off])` for every lane.
    fn accumulate(&mut self, op: Op, values: &[Vec<usize>], acc: &[usize], offs: &[usize]) -> Vec<usize> {
        let mut ret = vec![];
        for (lane, &off) in offs.iter().enumerate().take(values[0].len()) {
            let mut vin: SmallVec<[usize; 4]> = values.iter().map(|v| v[lane]).collect();
            vin.push(acc[off]);
            let dtype = self.node(acc[off]).dtype;
            let alu = self.uop(UOpKind::Alu, dtype, &vin, UOpArg::Alu(op), false);
            self.uop(UOpKind::Store, None, &[acc[off], alu], UOpArg::None, false);
            ret.push(alu);
        }
        ret
    }

    fn alu_dtype(&self, op: Op, vin: &[usize]) -> Option<DType> {
        match op {
            Op::Binary(BinaryOp::CmpLt) => Some(DType::Bool),
            Op::Ternary(TernaryOp::Where) => self.node(vin[1]).dtype,
            _ => vin.iter().filter_map(|&v| self.node(v).dtype).max(),
        }
    }

    fn slot_of(&self, leaf: &LazyOp) -> usize {
        let buf = match (leaf.op(), leaf.arg()) {
            (_, OpArg::Mem(m)) => KernelBuffer::Mem(m.clone()),
            (_, OpArg::ConstBuf(c)) => KernelBuffer::Const(c.clone()),
            _ => panic!("{} is not a buffer", leaf.op()),
        };
        match self.kernel.bufs.iter().position(|b| *b == buf) {
            Some(i) => i,
            None => panic!("buffer {buf:?} is not in the kernel"),
        }
    }

    fn ast_parse(
        &mut self,
        x: &LazyOp,
        acc: &[usize],
        offs: Option<&[usize]>,
        loaded: &HashMap<usize, Vec<usize>>,
        do_reduce: bool,
    ) -> Vec<usize> {
        match (x.op(), x.arg()) {
            (Op::Buffer(_), _) => {
                let slot = self.slot_of(x);
                match loaded.get(&slot) {
                    Some(v) => v.clone(),
                    None => panic!("buffer {slot} wasn't loaded"),
                }
            }
            (Op::Unary(UnaryOp::Noop) | Op::Movement(MovementOp::Reshape), _) => {
                self.ast_parse(src_op(&x.srcs()[0]), acc, offs, loaded, false)
            }
            (Op::Unary(UnaryOp::Cast), OpArg::Cast(dtype, bitcast)) => {
                let vals = self.ast_parse(src_op(&x.srcs()[0]), acc, offs, loaded, false);
                if dtype.is_image() {
                    return vals;
                }
                vals.into_iter()
                    .map(|u| self.uop(UOpKind::Cast, Some(*dtype), &[u], UOpArg::Cast { bitcast: *bitcast }, true))
                    .collect()
            }
            (Op::Reduce(_), _) if !do_reduce => acc.to_vec(),
            (Op::Reduce(r), _) => {
                let offs = match offs {
                    Some(o) => o,
                    None => panic!("reduce without accumulator offsets"),
                };
                let src = src_op(&x.srcs()[0]);
                let mul = match (r, src.op()) {
                    (ReduceOp::Sum, Op::Binary(BinaryOp::Mul)) => Some(src),
                    (ReduceOp::Sum, Op::Unary(UnaryOp::Cast)) => {
                        let inner = src_op(&src.srcs()[0]);
                        (inner.op() == Op::Binary(BinaryOp::Mul)).then_some(inner)
                    }
                    _ => None,
                };
                match mul {
                    Some(mul) => {
                        let values: Vec<Vec<usize>> = mul
                            .srcs()
                            .iter()
                            .map(|s| self.ast_parse(src_op(s), acc, Some(offs), loaded, false))
                            .collect();
                        self.accumulate(Op::Ternary(TernaryOp::MulAcc), &values, acc, offs)
                    }
                    None => {
                        let values = vec![self.ast_parse(src, acc, Some(offs), loaded, false)];
                        self.accumulate(reduce_alu(r), &values, acc, offs)
                    }
                }
            }
            (op @ (Op::Unary(_) | Op::Binary(_) | Op::Ternary(_)), _) => {
                let values: Vec<Vec<usize>> = x
                    .srcs()
                    .iter()
                    .map(|s| self.ast_parse(src_op(s), acc, offs, loaded, false))
                    .collect();
                (0..values[0].len())
                    .map(|lane| {
                        let vin: SmallVec<[usize; 4]> = values.iter().map(|v| v[lane]).collect();
                        let dtype = self.alu_dtype(op, &vin);
                        self.uop(UOpKind::Alu, dtype, &vin, UOpArg::Alu(op), true)
                    })
                    .collect()
            }
            (op, arg) => panic!("can't linearize {op} {arg}"),
        }
    }

    /// Lower the kernel. The kernel's shape state is the same afterwards.
    pub fn linearize(&mut self, names: &mut NameCounter) {
        let sts_backup = self.kernel.sts.clone();
        let gfr_backup = self.kernel.group_for_reduce.clone();
        let upc_backup = self.kernel.upcasted;
        let bufs_backup = self.kernel.bufs.clone();

        self.nodes.clear();
        self.order.clear();
        self.saved_exprs.clear();
        self.load_cache.clear();
        self.loop_uops.clear();
        self.buf_uops = vec![None; self.kernel.bufs.len()];
        assert!(
            self.kernel.group_for_reduce.is_empty() || self.kernel.opts.has_local,
            "a grouped reduce needs local memory"
        );

        for i in 0..self.kernel.bufs.len() {
            if let KernelBuffer::Mem(m) = &self.kernel.bufs[i] {
                let arg = UOpArg::Global {
                    idx: m.idx,
                    dtype: m.dtype,
                };
                let dtype = Some(m.dtype);
                self.buf_uops[i] = Some(self.uop(UOpKind::DefineGlobal, dtype, &[], arg, true));
            }
        }
        for var in vars_from_ast(&self.kernel.ast) {
            let id = self.uop(UOpKind::DefineGlobal, Some(DType::Int32), &[], UOpArg::Var(var.clone()), true);
            self.loop_uops.insert(var.name().to_string(), id);
        }

        let k = &self.kernel;
        let (global_dims, local_dims, first_reduce) = (k.global_dims(), k.local_dims, k.first_reduce());
        let gfr_len = k.group_for_reduce.len();
        if gfr_len > 0 {
            let mut shape: Vec<Node> = vec![Node::num(1); global_dims];
            shape.extend_from_slice(&k.full_shape()[global_dims..global_dims + local_dims + gfr_len]);
            shape.extend(vec![Node::num(1); k.shape_len() - k.upcasted - gfr_len - first_reduce]);
            shape.extend(k.upcasted_axis(0).into_iter().map(|x| Node::num(x.0)));
            let st = match ShapeTracker::from_shape(&shape) {
                Ok(st) => st,
                Err(e) => panic!("bad local buffer shape: {e}"),
            };
            let dtype = k
                .reduceop
                .as_ref()
                .map_or(DType::Float32, |r| get_info(r).dtype.scalar());
            let size = st.size();
            self.kernel.sts.push(st);
            self.kernel.bufs.push(KernelBuffer::Local {
                name: "temp".to_string(),
                size,
                dtype,
            });
            let arg = UOpArg::Local {
                name: "temp".to_string(),
                size,
            };
            let id = self.uop(UOpKind::DefineLocal, Some(dtype), &[], arg, false);
            self.buf_uops.push(Some(id));
        }

        self.name = names.next(&kernel_name(&self.kernel));

        let k = &self.kernel;
        let maxdims = if k.opts.has_local {
            (k.opts.global_max.len(), k.opts.local_max.len())
        } else {
            (0, 0)
        };
        let (global_idxs, loop_global) = get_grouped_dims("gidx", 0, &k.full_shape()[..global_dims], maxdims.0);
        let (mut local_idxs, loop_local) = get_grouped_dims(
            "lidx",
            global_dims,
            &k.full_shape()[global_dims..first_reduce + gfr_len],
            maxdims.1,
        );
        let upcast_vars = |shape: &[Node]| -> Vec<Node> {
            shape[k.shape_len() - k.upcasted..]
                .iter()
                .map(|s| Node::from(Variable::loop_var("", 0, int_dim(s) - 1)))
                .collect()
        };
        let full_upcast_idxs = upcast_vars(k.full_shape());
        let mut upcast_idxs = upcast_vars(k.output_shape());

        let mut outer_loops = vec![];
        if self.kernel.opts.has_local {
            let pad = |sizes: Vec<Node>, n: usize| -> Vec<Node> {
                let mut s: Vec<Node> = sizes.into_iter().rev().collect();
                s.resize(n.max(s.len()), Node::num(1));
                s
            };
            self.global_size = Some(pad(loop_global.iter().map(|v| v.size.clone()).collect(), maxdims.0));
            self.local_size = Some(pad(loop_local.iter().map(|v| v.size.clone()).collect(), maxdims.1));
            for vars in [&loop_global, &loop_local] {
                for (i, v) in vars.iter().enumerate() {
                    let arg = UOpArg::Special {
                        dim: vars.len() - 1 - i,
                        name: v.var.name().to_string(),
                        size: v.size.clone(),
                    };
                    let id = self.uop(UOpKind::Special, Some(DType::Int32), &[], arg, true);
                    self.loop_uops.insert(v.var.name().to_string(), id);
                }
            }
        } else {
            self.global_size = None;
            self.local_size = None;
            let all: Vec<LoopVar> = loop_global.iter().chain(&loop_local).cloned().collect();
            outer_loops = self.render_loop(&all);
        }

        let mut loaded: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut acc: Vec<usize> = vec![];
        let mut fake_reduce_idxs: Vec<Node> = vec![];
        if let Some(reduceop) = self.kernel.reduceop.clone() {
            let Op::Reduce(rop) = reduceop.op() else {
                unreachable!("reduceop is a reduce");
            };
            let k = &self.kernel;
            let reduce_vars: Vec<LoopVar> = (first_reduce + gfr_len..k.shape_len() - k.upcasted)
                .map(|i| LoopVar::new(&format!("ridx{i}"), &k.full_shape()[i]))
                .collect();
            let reduce_idxs: Vec<Node> = reduce_vars.iter().map(LoopVar::node).collect();
            fake_reduce_idxs = reduce_idxs.iter().map(|_| Node::num(0)).collect();

            let idxs = [&global_idxs[..], &local_idxs[..], &fake_reduce_idxs[..], &upcast_idxs[..]].concat();
            acc = self.global_load(0, &idxs, Some(reduce_identity(rop)), None);

            let loop_ctx = self.render_loop(&reduce_vars);

            let early_idxs = [&global_idxs[..], &local_idxs[..], &reduce_idxs[..], &full_upcast_idxs[..]].concat();
            for i in 1..self.kernel.bufs.len() {
                if self.kernel.earlybufs.contains(&self.kernel.bufs[i]) {
                    let l = self.global_load(i, &early_idxs, None, None);
                    loaded.insert(i, l);
                }
            }
            let offs = self.kernel.acc_offsets(self.kernel.full_buf_index);
            self.ast_parse(&reduceop, &acc, Some(&offs), &loaded, true);

            self.end_loops(&loop_ctx);
            self.load_cache.clear();

            if gfr_len > 0 {
                let local = self.kernel.bufs.len() - 1;
                let fake_global_idxs: Vec<Node> = global_idxs.iter().map(|_| Node::num(0)).collect();
                let idxs = [&fake_global_idxs[..], &local_idxs[..], &fake_reduce_idxs[..], &upcast_idxs[..]].concat();
                let stores = self.global_store(local, &idxs, &acc);
                let barrier = self.uop(UOpKind::Barrier, None, &stores, UOpArg::None, false);

                let mid = self.kernel.upcast_in_mid_reduce_axes();
                let k = &self.kernel;
                let mut end_local_vars: Vec<LoopVar> = (0..first_reduce + gfr_len)
                    .map(|i| {
                        let size = if i >= first_reduce && !mid.contains(&i) {
                            k.full_shape()[i].clone()
                        } else {
                            Node::num(1)
                        };
                        LoopVar::new(&format!("tidx{i}"), &size)
                    })
                    .collect();
                local_idxs.truncate(local_dims);
                local_idxs.extend(end_local_vars[global_dims + local_dims..].iter().map(LoopVar::node));

                for j in mid {
                    let shape_len = self.kernel.shape_len();
                    let perm: Vec<usize> = (0..shape_len).filter(|&i| i != j).chain([j]).collect();
                    self.kernel.reshape_and_permute(None, Some(&perm));
                    self.kernel.upcast();
                    self.kernel.group_for_reduce.pop();
                    local_idxs.pop();
                    end_local_vars.pop();
                    let k = &self.kernel;
                    upcast_idxs = k.output_shape()[k.shape_len() - k.upcasted..]
                        .iter()
                        .map(|s| Node::from(Variable::loop_var("", 0, int_dim(s) - 1)))
                        .collect();
                }

                let idxs = [&fake_global_idxs[..], &local_idxs[..], &fake_reduce_idxs[..], &upcast_idxs[..]].concat();
                acc = self.global_load(local, &idxs, Some(reduce_identity(rop)), None);
                let loop_ctx = self.render_loop(&end_local_vars);
                let late = self.global_load(local, &idxs, None, Some(barrier));
                let offs = self.kernel.acc_offsets(local);
                self.accumulate(reduce_alu(rop), &[late], &acc, &offs);
                self.end_loops(&loop_ctx);
                self.load_cache.clear();
            }
        }

        let late_idxs = [&global_idxs[..], &local_idxs[..], &fake_reduce_idxs[..], &upcast_idxs[..]].concat();
        for i in 1..self.kernel.bufs.len() {
            let b = &self.kernel.bufs[i];
            if !self.kernel.earlybufs.contains(b) && !matches!(b, KernelBuffer::Local { .. }) {
                let l = self.global_load(i, &late_idxs, None, None);
                loaded.insert(i, l);
            }
        }
        let ast = self.kernel.ast.clone();
        let val = self.ast_parse(&ast, &acc, None, &loaded, false);
        self.global_store(0, &late_idxs, &val);
        self.end_loops(&outer_loops);

        self.dce();
        self.finalize();
        for u in &self.uops {
            trace!("{:4} {:14} {:8} {:?} {}", u.num, u.kind.to_string(), u.dtype.map(|d| d.to_string()).unwrap_or_default(), u.vin.as_slice(), u.arg);
        }

        self.kernel.sts = sts_backup;
        self.kernel.group_for_reduce = gfr_backup;
        self.kernel.upcasted = upc_backup;
        self.kernel.bufs = bufs_backup;
    }

    /// Drop uops nothing reads, until nothing changes.
    fn dce(&mut self) {
        loop {
            let mut has_child = vec![false; self.nodes.len()];
            for &id in &self.order {
                for &v in &self.nodes[id].vin {
                    has_child[v] = true;
                }
            }
            let before = self.order.len();
            let nodes = &self.nodes;
            self.order.retain(|&id| {
                has_child[id]
                    || matches!(
                        nodes[id].kind,
                        UOpKind::Store | UOpKind::Wmma | UOpKind::End | UOpKind::Barrier | UOpKind::DefineGlobal
                    )
            });
            if self.order.len() == before {
                break;
            }
        }
    }

    fn finalize(&mut self) {
        let mut pos = vec![usize::MAX; self.nodes.len()];
        for (p, &id) in self.order.iter().enumerate() {
            pos[id] = p;
        }
        self.uops = self
            .order
            .iter()
            .enumerate()
            .map(|(p, &id)| {
                let u = &self.nodes[id];
                UOp {
                    kind: u.kind,
                    dtype: u.dtype,
                    vin: u.vin.iter().map(|v| pos[*v]).collect(),
                    arg: u.arg.clone(),
                    num: p,
                }
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        kernel::LinearizerOptions,
        ops::{mem_op, LazySrc},
        symbolic::to_nodes,
    };

    fn st(shape: &[i64]) -> ShapeTracker {
        ShapeTracker::from_shape(&to_nodes(shape)).unwrap()
    }

    fn mem(idx: usize, st: ShapeTracker) -> LazySrc {
        mem_op(idx, DType::Float32, st).into()
    }

    fn kinds(lin: &Linearizer) -> Vec<UOpKind> {
        lin.uops.iter().map(|u| u.kind).collect()
    }

    fn count(lin: &Linearizer, kind: UOpKind) -> usize {
        lin.uops.iter().filter(|u| u.kind == kind).count()
    }

    #[test]
    fn test_elementwise_add_as_one_loop() {
        let ast = Arc::new(LazyOp::new(
            Op::Binary(BinaryOp::Add),
            vec![mem(1, st(&[1024])), mem(2, st(&[1024]))],
            OpArg::None,
        ));
        let k = Kernel::new(ast, LinearizerOptions::loops_only()).unwrap();
        let mut lin = Linearizer::new(k);
        lin.linearize(&mut NameCounter::default());

        assert_eq!(lin.name, "E_1024");
        assert!(lin.global_size.is_none());
        assert_eq!(count(&lin, UOpKind::Loop), 1);
        assert_eq!(count(&lin, UOpKind::End), 1);
        assert_eq!(count(&lin, UOpKind::Barrier), 0);
        assert_eq!(count(&lin, UOpKind::DefineLocal), 0);
        let body: Vec<UOpKind> = kinds(&lin)
            .into_iter()
            .filter(|k| matches!(k, UOpKind::Load | UOpKind::Alu | UOpKind::Store))
            .collect();
        assert_eq!(body, vec![UOpKind::Load, UOpKind::Load, UOpKind::Alu, UOpKind::Store]);
        assert_eq!(lin.uops.last().map(|u| u.kind), Some(UOpKind::End));
        for u in &lin.uops {
            assert!(u.vin.iter().all(|v| *v < u.num), "{u:?} reads a later uop");
        }
    }

    #[test]
    fn test_names_count_up() {
        let mut names = NameCounter::default();
        assert_eq!(names.next("E_4"), "E_4");
        assert_eq!(names.next("E_4"), "E_4n1");
        assert_eq!(names.next("E_4"), "E_4n2");
        assert_eq!(names.next("r_4"), "r_4");
    }

    #[test]
    fn test_grouped_dims() {
        let (idxs, loops) = get_grouped_dims("gidx", 0, &to_nodes(&[2, 3, 4, 5]), 3);
        assert_eq!(loops.len(), 3);
        assert_eq!(loops[2].size, 20);
        assert_eq!(idxs.len(), 4);
        let dd = loops[2].var.clone();
        for v in 0..20 {
            let vals = [(dd.clone(), v)].into();
            assert_eq!(idxs[2].eval(&vals), Some(v / 5));
            assert_eq!(idxs[3].eval(&vals), Some(v % 5));
        }

        let (idxs, loops) = get_grouped_dims("lidx", 2, &to_nodes(&[1, 8]), 0);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].var.name(), "lidx3");
        assert_eq!(idxs[0], 0);
    }

    #[test]
    fn test_peepholes() {
        let k = Kernel::new(
            Arc::new(LazyOp::new(Op::Unary(UnaryOp::Neg), vec![mem(1, st(&[4]))], OpArg::None)),
            LinearizerOptions::loops_only(),
        )
        .unwrap();
        let mut lin = Linearizer::new(k);
        let x = lin.push(UOpKind::DefineGlobal, Some(DType::Float32), SmallVec::new(), UOpArg::None);
        let zero = lin.constant(0.0, DType::Float32);
        let one = lin.constant(1.0, DType::Float32);
        let add = Op::Binary(BinaryOp::Add);
        let mul = Op::Binary(BinaryOp::Mul);
        assert_eq!(lin.uop(UOpKind::Alu, Some(DType::Float32), &[x, zero], UOpArg::Alu(add), true), x);
        assert_eq!(lin.uop(UOpKind::Alu, Some(DType::Float32), &[one, x], UOpArg::Alu(mul), true), x);
        assert_eq!(lin.uop(UOpKind::Alu, Some(DType::Float32), &[x, zero], UOpArg::Alu(mul), true), zero);
        assert_eq!(lin.uop(UOpKind::Store, None, &[x, x], UOpArg::None, false), x);

        let neg_one = lin.uop(UOpKind::Alu, Some(DType::Float32), &[one], UOpArg::Alu(Op::Unary(UnaryOp::Neg)), true);
        assert_eq!(lin.const_val(neg_one), Some(-1.0));

        let neg_x = lin.uop(UOpKind::Alu, Some(DType::Float32), &[x], UOpArg::Alu(Op::Unary(UnaryOp::Neg)), true);
        let sub = lin.uop(UOpKind::Alu, Some(DType::Float32), &[one, neg_x], UOpArg::Alu(add), true);
        assert_eq!(lin.node(sub).arg, UOpArg::Alu(Op::Binary(BinaryOp::Sub)));
        assert_eq!(lin.node(sub).vin.as_slice(), &[one, x]);

        // cse
        let a = lin.uop(UOpKind::Alu, Some(DType::Float32), &[x, one], UOpArg::Alu(Op::Binary(BinaryOp::Max)), true);
        let b = lin.uop(UOpKind::Alu, Some(DType::Float32), &[x, one], UOpArg::Alu(Op::Binary(BinaryOp::Max)), true);
        assert_eq!(a, b);

        let vec = lin.push(UOpKind::Load, Some(DType::Float4), SmallVec::new(), UOpArg::None);
        let lanes: Vec<usize> = (0..4)
            .map(|l| lin.uop(UOpKind::Gep, Some(DType::Float32), &[vec], UOpArg::Lane(l), true))
            .collect();
        assert_eq!(lin.uop(UOpKind::Cast, Some(DType::Float4), &lanes, UOpArg::Cast { bitcast: false }, true), vec);
        assert_eq!(lin.uop(UOpKind::Gep, Some(DType::Float32), &[one], UOpArg::Lane(2), true), one);
    }

    #[test]
    fn test_reduce_defines_acc_and_loop() {
        let ast = Arc::new(LazyOp::new(
            Op::Reduce(ReduceOp::Sum),
            vec![mem(1, st(&[8, 16]))],
            OpArg::Shape(to_nodes(&[8, 1])),
        ));
        let k = Kernel::new(ast, LinearizerOptions::loops_only()).unwrap();
        let mut lin = Linearizer::new(k);
        lin.linearize(&mut NameCounter::default());
        assert_eq!(lin.name, "r_8_16");
        assert_eq!(count(&lin, UOpKind::DefineAcc), 1);
        assert_eq!(count(&lin, UOpKind::Loop), 2);
        assert_eq!(count(&lin, UOpKind::End), 2);
        let acc = lin.uops.iter().find(|u| u.kind == UOpKind::DefineAcc).unwrap();
        assert_eq!(acc.arg, UOpArg::Value(ConstValue(0.0)));
        // the kernel is left as it was
        assert_eq!(lin.kernel.bufs.len(), 2);
    }

    #[test]
    fn test_mulacc_fusion() {
        let mul = LazyOp::new(
            Op::Binary(BinaryOp::Mul),
            vec![mem(1, st(&[4, 8])), mem(2, st(&[4, 8]))],
            OpArg::None,
        );
        let ast = Arc::new(LazyOp::new(Op::Reduce(ReduceOp::Sum), vec![mul.into()], OpArg::Shape(to_nodes(&[4, 1]))));
        let k = Kernel::new(ast, LinearizerOptions::loops_only()).unwrap();
        let mut lin = Linearizer::new(k);
        lin.linearize(&mut NameCounter::default());
        assert!(lin
            .uops
            .iter()
            .any(|u| u.arg == UOpArg::Alu(Op::Ternary(TernaryOp::MulAcc))));
        assert!(!lin.uops.iter().any(|u| u.arg == UOpArg::Alu(Op::Binary(BinaryOp::Mul))
            && u.dtype == Some(DType::Float32)));
    }

    #[test]
    fn test_group_for_reduce_uses_locals() {
        let ast = Arc::new(LazyOp::new(
            Op::Reduce(ReduceOp::Sum),
            vec![mem(1, st(&[4096]))],
            OpArg::Shape(to_nodes(&[1])),
        ));
        let mut k = Kernel::new(ast, LinearizerOptions::default()).unwrap();
        k.hand_coded_optimizations();
        let mut lin = Linearizer::new(k);
        lin.linearize(&mut NameCounter::default());
        assert_eq!(count(&lin, UOpKind::DefineLocal), 1);
        assert_eq!(count(&lin, UOpKind::Barrier), 1);
        assert_eq!(count(&lin, UOpKind::DefineAcc), 2);
        assert_eq!(lin.local_size.as_deref(), Some(&to_nodes(&[256, 1, 1])[..]));
        assert!(lin.uops.iter().any(|u| matches!(&u.arg, UOpArg::Special { name, .. } if name == "lidx0")));
    }
}
