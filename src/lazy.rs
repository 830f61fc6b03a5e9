use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt::Display,
    sync::Arc,
};

use log::trace;
use snafu::{ensure, OptionExt};

use crate::{
    compiled::Compiled,
    config::RewriteConfig,
    device::{Backend, DeviceKind, RawBuffer, Stats},
    dtype::{DType, Elem},
    error::{
        BackendSnafu, Error, InvalidMovementSnafu, InvalidVariableSnafu, MissingBufferSnafu,
        RealizeSnafu, Result, VarValConflictSnafu,
    },
    interpreter::Interpreter,
    ops::{
        BinaryOp, BufferId, ConstValue, LazyOp, LazySrc, LoadOp, MovementOp, Op, OpArg, OpType,
        ReduceOp, TernaryOp, UnaryOp,
    },
    shape_tracker::{get_contraction, ShapeTracker},
    symbolic::{all_int, as_ints, gcd, render_shape, sym_prod, to_nodes, Node, VarVals, Variable},
};

/// Ops where `f(0) != 0` or `f(0, 0) != 0`. A pad can't be pushed through them.
const UNSAFE_PAD_OPS: [Op; 5] = [
    Op::Binary(BinaryOp::Div),
    Op::Binary(BinaryOp::CmpLt),
    Op::Unary(UnaryOp::Log2),
    Op::Unary(UnaryOp::Exp2),
    Op::Unary(UnaryOp::Recip),
];

/// A node of the lazy graph.
///
/// Movement buffers point at a `base` that owns the data. `dtype`,
/// `realized` and `var_vals` are only meaningful on a base, so read them
/// through [`Graph::dtype`], [`Graph::realized`] and [`Graph::var_vals`].
#[derive(Debug)]
pub struct LazyBuffer {
    pub(crate) device: String,
    pub(crate) st: ShapeTracker,
    pub(crate) optype: OpType,
    pub(crate) op: Option<Arc<LazyOp>>,
    pub(crate) dtype: DType,
    pub(crate) realized: Option<RawBuffer>,
    pub(crate) base: Option<BufferId>,
    pub(crate) children: BTreeSet<BufferId>,
    pub(crate) views: BTreeSet<BufferId>,
    pub(crate) var_vals: VarVals,
}

impl LazyBuffer {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn st(&self) -> &ShapeTracker {
        &self.st
    }

    pub fn shape(&self) -> &[Node] {
        self.st.shape()
    }

    pub fn optype(&self) -> OpType {
        self.optype
    }

    /// The op that computes this buffer, dropped once it's realized.
    pub fn op(&self) -> Option<&Arc<LazyOp>> {
        self.op.as_ref()
    }

    pub fn base(&self) -> Option<BufferId> {
        self.base
    }

    pub fn children(&self) -> &BTreeSet<BufferId> {
        &self.children
    }

    pub fn views(&self) -> &BTreeSet<BufferId> {
        &self.views
    }
}

// The dedup key. The tracker isn't part of it, op and base determine it.
#[derive(PartialEq, Eq, Hash)]
struct CacheKey {
    device: String,
    dtype: DType,
    op: Arc<LazyOp>,
    var_keys: Vec<Variable>,
    base: Option<BufferId>,
}

/// Arena of lazy buffers plus everything needed to rewrite, schedule and
/// run them.
///
/// Buffers are never freed implicitly. `children` and `views` are plain
/// back-references; call [`Graph::collect`] with the ids still in use to
/// reclaim the rest.
///
/// Ids are never reused, so a stale `BufferId` is `MissingBuffer` rather
/// than some newer buffer. A collected slot is a `None` one pointer wide.
pub struct Graph {
    pub(crate) buffers: Vec<Option<Box<LazyBuffer>>>,
    cache: HashMap<CacheKey, BufferId>,
    pub(crate) config: RewriteConfig,
    pub(crate) devices: BTreeMap<String, Box<dyn Backend>>,
    pub(crate) stats: Stats,
}

fn movement_error(op: &str, shape: &[Node], reason: impl Into<String>) -> Error {
    InvalidMovementSnafu {
        op,
        shape: render_shape(shape),
        reason: reason.into(),
    }
    .build()
}

impl Graph {
    /// A graph with an interpreted `CPU` device and a compiled `VM` device.
    pub fn new(config: RewriteConfig) -> Graph {
        Graph::with_backends(
            config,
            vec![Box::new(Interpreter::new("CPU")), Box::new(Compiled::vm("VM"))],
        )
    }

    pub fn with_backends(config: RewriteConfig, backends: Vec<Box<dyn Backend>>) -> Graph {
        let mut g = Graph {
            buffers: vec![],
            cache: HashMap::new(),
            config,
            devices: BTreeMap::new(),
            stats: Stats::default(),
        };
        for b in backends {
            g.register(b);
        }
        g
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        self.devices.insert(backend.name().to_string(), backend);
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// # Errors
    ///
    /// `Backend` if no device of that name is registered.
    pub fn backend(&self, device: &str) -> Result<&dyn Backend> {
        self.devices
            .get(device)
            .map(AsRef::as_ref)
            .context(BackendSnafu {
                device,
                reason: "unknown device",
            })
    }

    pub(crate) fn backend_mut(&mut self, device: &str) -> Result<&mut Box<dyn Backend>> {
        self.devices.get_mut(device).context(BackendSnafu {
            device,
            reason: "unknown device",
        })
    }

    /// # Errors
    ///
    /// `MissingBuffer` if the id was never handed out or has been collected.
    pub fn get(&self, id: BufferId) -> Result<&LazyBuffer> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_deref)
            .context(MissingBufferSnafu { id: id.0 })
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lb(&self, id: BufferId) -> &LazyBuffer {
        match self.buffers.get(id.0).and_then(Option::as_deref) {
            Some(b) => b,
            None => panic!("{id} is not in the graph"),
        }
    }

    pub(crate) fn lb_mut(&mut self, id: BufferId) -> &mut LazyBuffer {
        match self.buffers.get_mut(id.0).and_then(Option::as_deref_mut) {
            Some(b) => b,
            None => panic!("{id} is not in the graph"),
        }
    }

    pub fn base_of(&self, id: BufferId) -> BufferId {
        self.lb(id).base.unwrap_or(id)
    }

    pub fn dtype(&self, id: BufferId) -> DType {
        self.lb(self.base_of(id)).dtype
    }

    pub(crate) fn set_dtype(&mut self, id: BufferId, dtype: DType) {
        assert!(self.lb(id).base.is_none(), "no setting dtype of based buffers");
        self.lb_mut(id).dtype = dtype;
    }

    pub fn realized(&self, id: BufferId) -> Option<&RawBuffer> {
        self.lb(self.base_of(id)).realized.as_ref()
    }

    pub(crate) fn set_realized(&mut self, id: BufferId, raw: RawBuffer) {
        assert!(self.lb(id).base.is_none(), "no setting realized of based buffers");
        self.lb_mut(id).realized = Some(raw);
    }

    pub fn is_realized(&self, id: BufferId) -> bool {
        self.realized(id).is_some()
    }

    pub fn var_vals(&self, id: BufferId) -> &VarVals {
        &self.lb(self.base_of(id)).var_vals
    }

    pub(crate) fn set_var_vals(&mut self, id: BufferId, var_vals: VarVals) {
        assert!(self.lb(id).base.is_none(), "no setting var_vals of based buffers");
        self.lb_mut(id).var_vals = var_vals;
    }

    pub fn shape(&self, id: BufferId) -> &[Node] {
        self.lb(id).shape()
    }

    pub(crate) fn device_kind(&self, device: &str) -> Option<DeviceKind> {
        self.devices.get(device).map(|d| d.kind())
    }

    /// The op of a buffer that hasn't been realized yet.
    pub(crate) fn unrealized_op(&self, id: BufferId) -> Option<Arc<LazyOp>> {
        if self.is_realized(id) {
            None
        } else {
            self.lb(id).op.clone()
        }
    }

    fn unrealized_movement(&self, id: BufferId, kind: MovementOp) -> Option<(BufferId, OpArg)> {
        let op = self.unrealized_op(id)?;
        if op.op() != Op::Movement(kind) {
            return None;
        }
        Some((op.srcs()[0].as_buffer()?, op.arg().clone()))
    }

    /// A constant that hasn't been materialized. Compiled devices inline these.
    pub fn is_unrealized_const(&self, id: BufferId) -> bool {
        let base = self.lb(self.base_of(id));
        !self.is_realized(id)
            && base.op.as_ref().map(|o| o.op()) == Some(Op::Load(LoadOp::Const))
            && self.device_kind(&self.lb(id).device) == Some(DeviceKind::Compiled)
    }

    fn insert(&mut self, lb: LazyBuffer) -> BufferId {
        let id = BufferId(self.buffers.len());
        if let Some(op) = &lb.op {
            for b in op.buffers() {
                self.lb_mut(*b).children.insert(id);
            }
        }
        assert!(
            lb.optype != OpType::Movement
                || lb.base.is_some_and(|b| self.lb(b).optype != OpType::Movement),
            "movement ops must be based on a non-movement buffer"
        );
        match lb.base {
            Some(base) => {
                self.lb_mut(base).views.insert(id);
            }
            None => assert!(lb.st.contiguous(), "unbased buffers must be contiguous"),
        }
        self.buffers.push(Some(Box::new(lb)));
        id
    }

    fn create(
        &mut self,
        device: &str,
        st: ShapeTracker,
        op: LazyOp,
        dtype: DType,
        var_vals: VarVals,
        base: Option<BufferId>,
    ) -> BufferId {
        let op = Arc::new(op);
        let uncached = matches!(
            op.op(),
            Op::Load(LoadOp::Empty | LoadOp::Rand | LoadOp::Const)
        );
        let key = (self.config.lazycache && !uncached).then(|| CacheKey {
            device: device.to_string(),
            dtype,
            op: Arc::clone(&op),
            var_keys: var_vals.keys().cloned().collect(),
            base,
        });
        if let Some(hit) = key.as_ref().and_then(|k| self.cache.get(k)).copied() {
            if self.buffers.get(hit.0).is_some_and(Option::is_some) {
                trace!("lazycache hit {hit} for {}", op.op());
                for b in op.buffers() {
                    self.lb_mut(*b).children.insert(hit);
                }
                return hit;
            }
        }
        let id = self.insert(LazyBuffer {
            device: device.to_string(),
            st,
            optype: op.op().optype(),
            op: Some(op),
            dtype,
            realized: None,
            base,
            children: BTreeSet::new(),
            views: BTreeSet::new(),
            var_vals: if base.is_some() { VarVals::new() } else { var_vals },
        });
        if let Some(key) = key {
            self.cache.insert(key, id);
        }
        id
    }

    // *** creation ***

    /// A buffer produced by a load op.
    ///
    /// # Errors
    ///
    /// `Backend` for an unknown device, `InvalidMovement` for a bad shape.
    #[allow(clippy::too_many_arguments)]
    pub fn loadop(
        &mut self,
        op: LoadOp,
        shape: &[Node],
        dtype: DType,
        device: &str,
        arg: OpArg,
        src: Option<BufferId>,
        var_vals: VarVals,
    ) -> Result<BufferId> {
        self.backend(device)?;
        if let Some(src) = src {
            self.get(src)?;
        }
        let st = ShapeTracker::from_shape(shape)?;
        let srcs = src.map(LazySrc::Buffer).into_iter().collect();
        Ok(self.create(
            device,
            st,
            LazyOp::new(Op::Load(op), srcs, arg),
            dtype,
            var_vals,
            None,
        ))
    }

    /// Uninitialized buffer.
    ///
    /// # Errors
    ///
    /// See [`Graph::loadop`].
    pub fn empty(&mut self, device: &str, shape: &[i64], dtype: DType) -> Result<BufferId> {
        self.loadop(LoadOp::Empty, &to_nodes(shape), dtype, device, OpArg::None, None, VarVals::new())
    }

    /// Uniform values in `[0, 1)`.
    ///
    /// # Errors
    ///
    /// See [`Graph::loadop`].
    pub fn rand(&mut self, device: &str, shape: &[i64], dtype: DType, seed: u64) -> Result<BufferId> {
        self.loadop(LoadOp::Rand, &to_nodes(shape), dtype, device, OpArg::Seed(seed), None, VarVals::new())
    }

    /// A scalar constant broadcast to `shape`.
    ///
    /// # Errors
    ///
    /// See [`Graph::loadop`].
    pub fn full(&mut self, device: &str, shape: &[Node], dtype: DType, val: f64) -> Result<BufferId> {
        let scalar = self.loadop(
            LoadOp::Const,
            &[],
            dtype.scalar(),
            device,
            OpArg::Const(ConstValue(val)),
            None,
            VarVals::new(),
        )?;
        let ones = vec![Node::num(1); shape.len()];
        let r = self.reshape(scalar, &ones)?;
        self.expand(r, shape)
    }

    /// A constant with the shape, dtype and device of `x`.
    ///
    /// # Errors
    ///
    /// `MissingBuffer` if `x` isn't in the graph.
    pub fn const_like(&mut self, x: BufferId, val: f64) -> Result<BufferId> {
        let lb = self.get(x)?;
        let (device, shape) = (lb.device.clone(), lb.shape().to_vec());
        self.full(&device, &shape, self.dtype(x), val)
    }

    /// A realized buffer holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// `Backend` for an unknown device, `InvalidMovement` if `data` doesn't fit `shape`.
    pub fn from_host<E: Elem>(&mut self, device: &str, shape: &[i64], data: &[E]) -> Result<BufferId> {
        let raw = self.backend(device)?.from_host(&E::to_buffer(data), E::DTYPE)?;
        self.from_raw(device, shape, raw)
    }

    /// Like `from_host`, with values converted to `dtype`.
    ///
    /// # Errors
    ///
    /// See [`Graph::from_host`].
    pub fn from_values(&mut self, device: &str, shape: &[i64], dtype: DType, values: &[f64]) -> Result<BufferId> {
        let raw = self.backend(device)?.from_host(&dtype.encode(values), dtype)?;
        self.from_raw(device, shape, raw)
    }

    fn from_raw(&mut self, device: &str, shape: &[i64], raw: RawBuffer) -> Result<BufferId> {
        let shape = to_nodes(shape);
        ensure!(
            sym_prod(&shape) == i64::try_from(raw.size()).unwrap_or(-1),
            InvalidMovementSnafu {
                op: "from_host",
                shape: render_shape(&shape),
                reason: format!("got {} elements", raw.size()),
            }
        );
        Ok(self.insert(LazyBuffer {
            device: device.to_string(),
            st: ShapeTracker::from_shape(&shape)?,
            optype: OpType::Load,
            op: None,
            dtype: raw.dtype(),
            realized: Some(raw),
            base: None,
            children: BTreeSet::new(),
            views: BTreeSet::new(),
            var_vals: VarVals::new(),
        }))
    }

    /// `x` in a buffer of its own, unless it already is a pending copy.
    ///
    /// # Errors
    ///
    /// `MissingBuffer` if `x` isn't in the graph.
    pub fn contiguous(&mut self, x: BufferId) -> Result<BufferId> {
        self.get(x)?;
        if self
            .unrealized_op(x)
            .is_some_and(|op| op.op() == Op::Load(LoadOp::Contiguous))
        {
            return Ok(x);
        }
        let lb = self.lb(x);
        let (device, shape) = (lb.device.clone(), lb.shape().to_vec());
        let var_vals = self.var_vals(x).clone();
        self.loadop(LoadOp::Contiguous, &shape, self.dtype(x), &device, OpArg::None, Some(x), var_vals)
    }

    /// # Errors
    ///
    /// `Backend` for an unknown device.
    pub fn copy_to_device(&mut self, x: BufferId, device: &str) -> Result<BufferId> {
        let src = self.contiguous(x)?;
        let shape = self.shape(x).to_vec();
        self.loadop(LoadOp::From, &shape, self.dtype(x), device, OpArg::None, Some(src), VarVals::new())
    }

    /// Realize `x` and read it back row-major.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` for symbolic shapes, and anything realizing can fail with.
    pub fn to_host(&mut self, x: BufferId) -> Result<Vec<f64>> {
        let shape = self.get(x)?.shape().to_vec();
        let numel = as_ints(&shape)
            .context(InvalidMovementSnafu {
                op: "to_host",
                shape: render_shape(&shape),
                reason: "shape is symbolic",
            })?
            .iter()
            .product::<i64>();
        let mut y = x;
        if self.dtype(x).is_image() {
            y = self.cast(y, DType::Float32, false)?;
        }
        let c = self.contiguous(y)?;
        self.realize(c)?;
        let raw = self.realized(c).cloned().context(RealizeSnafu {
            id: c.0,
            reason: "not realized after realize",
        })?;
        let bytes = self.backend(&self.lb(c).device)?.to_host(&raw)?;
        let mut values = raw.dtype().decode(&bytes);
        values.truncate(usize::try_from(numel).unwrap_or(0));
        Ok(values)
    }

    /// Schedule and run everything `x` depends on.
    ///
    /// # Errors
    ///
    /// Scheduling and backend errors.
    pub fn realize(&mut self, x: BufferId) -> Result<()> {
        if !self.get(x).map(|_| self.is_realized(x))? {
            let schedule = self.schedule(x)?;
            self.run_schedule(schedule)?;
        }
        Ok(())
    }

    // *** elementwise ***

    /// Elementwise op over same-shaped sources.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` if source shapes differ, `MissingBuffer` for unknown ids.
    pub fn e(&mut self, op: Op, srcs: &[BufferId], arg: OpArg) -> Result<BufferId> {
        assert!(op.is_elementwise(), "{op} is not elementwise");
        ensure!(
            !srcs.is_empty(),
            InvalidMovementSnafu {
                op: op.to_string(),
                shape: "()",
                reason: "no sources",
            }
        );
        for s in srcs {
            self.get(*s)?;
        }
        let first = srcs[0];
        let out_shape = self.shape(first).to_vec();
        for s in &srcs[1..] {
            ensure!(
                self.shape(*s) == out_shape.as_slice(),
                InvalidMovementSnafu {
                    op: op.to_string(),
                    shape: render_shape(&out_shape),
                    reason: format!("source shape {}", render_shape(self.shape(*s))),
                }
            );
        }
        let var_vals = self.var_vals(first).clone();

        let mut srcs = srcs.to_vec();
        if self.config.shuffle_movement_ops {
            srcs = self.push_movement_ops(&srcs)?;
        }

        let device = self.lb(srcs[0]).device.clone();
        let dtype = match (op, &arg) {
            (Op::Unary(UnaryOp::Cast), OpArg::Cast(dtype, _)) => *dtype,
            _ => srcs.iter().map(|s| self.dtype(*s)).max().unwrap_or(DType::Float32),
        };

        if self.config.push_contiguous && srcs.iter().any(|x| self.pushable_contiguous(*x).is_some()) {
            let mut new_srcs = vec![];
            for x in srcs {
                match self.pushable_contiguous(x) {
                    Some(src) => {
                        self.lb_mut(src).children.remove(&x);
                        new_srcs.push(src);
                    }
                    None => new_srcs.push(x),
                }
            }
            trace!("pushing contiguous after {op}");
            let out = self.e(op, &new_srcs, arg)?;
            return self.contiguous(out);
        }

        let lazy_srcs = srcs
            .iter()
            .map(|x| {
                let lb = self.lb(*x);
                match &lb.op {
                    Some(inner)
                        if self.config.merge_elementwise_ops
                            && lb.optype == OpType::Elementwise
                            && lb.children.is_empty()
                            && !self.is_realized(*x) =>
                    {
                        LazySrc::Op(Arc::clone(inner))
                    }
                    _ => LazySrc::Buffer(*x),
                }
            })
            .collect();

        Ok(self.create(
            &device,
            ShapeTracker::from_shape(&out_shape)?,
            LazyOp::new(op, lazy_srcs, arg),
            dtype,
            var_vals,
            None,
        ))
    }

    // the source of an unrealized contiguous whose source has no other users
    fn pushable_contiguous(&self, x: BufferId) -> Option<BufferId> {
        let op = self.unrealized_op(x)?;
        if op.op() != Op::Load(LoadOp::Contiguous) {
            return None;
        }
        let src = op.srcs()[0].as_buffer()?;
        (self.lb(src).children.len() <= 1).then_some(src)
    }

    /// # Errors
    ///
    /// See [`Graph::e`].
    pub fn unary(&mut self, op: UnaryOp, x: BufferId) -> Result<BufferId> {
        self.e(Op::Unary(op), &[x], OpArg::None)
    }

    /// # Errors
    ///
    /// See [`Graph::e`].
    pub fn binary(&mut self, op: BinaryOp, a: BufferId, b: BufferId) -> Result<BufferId> {
        self.e(Op::Binary(op), &[a, b], OpArg::None)
    }

    /// # Errors
    ///
    /// See [`Graph::e`].
    pub fn ternary(&mut self, op: TernaryOp, a: BufferId, b: BufferId, c: BufferId) -> Result<BufferId> {
        self.e(Op::Ternary(op), &[a, b, c], OpArg::None)
    }

    /// # Errors
    ///
    /// See [`Graph::e`].
    pub fn cast(&mut self, x: BufferId, dtype: DType, bitcast: bool) -> Result<BufferId> {
        self.e(Op::Unary(UnaryOp::Cast), &[x], OpArg::Cast(dtype, bitcast))
    }

    // *** reduce ***

    fn reduce_op(&mut self, op: ReduceOp, x: BufferId, new_shape: &[Node]) -> Result<BufferId> {
        if self.shape(x) == new_shape {
            return Ok(x);
        }
        let srcs = if self.config.shuffle_movement_ops {
            self.push_movement_ops(&[x])?
        } else {
            vec![x]
        };
        let device = self.lb(x).device.clone();
        let var_vals = self.var_vals(x).clone();
        Ok(self.create(
            &device,
            ShapeTracker::from_shape(new_shape)?,
            LazyOp::new(Op::Reduce(op), vec![srcs[0].into()], OpArg::Shape(new_shape.to_vec())),
            self.dtype(x),
            var_vals,
            None,
        ))
    }

    /// Reduce to `new_shape`, where every reduced axis becomes 1. Big
    /// reduces may be split in two passes.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` if `new_shape` isn't a reduction of the shape of `x`.
    pub fn r(&mut self, op: ReduceOp, x: BufferId, new_shape: &[Node]) -> Result<BufferId> {
        let shape = self.get(x)?.shape().to_vec();
        ensure!(
            shape.len() == new_shape.len()
                && shape.iter().zip(new_shape).all(|(o, n)| o == n || *n == 1),
            InvalidMovementSnafu {
                op: "reduce",
                shape: render_shape(&shape),
                reason: format!("can't reduce to {}", render_shape(new_shape)),
            }
        );
        let (Some(split), Some(old), Some(new)) =
            (self.config.reduce_split, as_ints(&shape), as_ints(new_shape))
        else {
            return self.reduce_op(op, x, new_shape);
        };
        let out_size: i64 = new.iter().product();
        if out_size == 0 || old.iter().product::<i64>() / out_size < split.min_work {
            return self.reduce_op(op, x, new_shape);
        }

        let strides = self.lb(x).st.real_strides(false);
        let mut best: Option<(f64, i64, usize)> = None;
        for (i, ((o, n), stride)) in old.iter().zip(&new).zip(&strides).enumerate() {
            if o == n {
                continue;
            }
            let divisor = gcd(split.gcd_base, *o);
            #[allow(clippy::cast_precision_loss)]
            let heuristic = match stride {
                Some(s) if *s != 0 => divisor as f64 / *s as f64,
                _ => 0.0,
            };
            let cand = (heuristic, divisor, i);
            if best.map_or(true, |b| cand > b) {
                best = Some(cand);
            }
        }
        let Some((heuristic, divisor, dim)) = best else {
            return self.reduce_op(op, x, new_shape);
        };
        if divisor < split.min_divisor || heuristic < split.min_heuristic {
            return self.reduce_op(op, x, new_shape);
        }
        trace!("splitting reduce of {} on axis {dim} by {divisor}", render_shape(&shape));

        let splitted = |after: &[i64]| -> Vec<Node> {
            let mut s: Vec<i64> = old[..dim].to_vec();
            s.push(old[dim] / divisor);
            s.extend_from_slice(after);
            s.extend_from_slice(&old[dim + 1..]);
            to_nodes(&s)
        };
        let a = self.reshape(x, &splitted(&[divisor]))?;
        let b = self.reduce_op(op, a, &splitted(&[1]))?;
        let c = self.reshape(b, &splitted(&[]))?;
        self.reduce_op(op, c, new_shape)
    }

    // *** movement ***

    fn movement_op(&mut self, x: BufferId, st: ShapeTracker, op: MovementOp, arg: OpArg) -> Result<BufferId> {
        let realized = self.is_realized(x);
        let lb = self.lb(x);
        if self.config.shuffle_movement_ops
            && lb.optype == OpType::Elementwise
            && !realized
            && lb.children.is_empty()
        {
            if let Some(inner) = lb.op.clone() {
                let shuffles = matches!(op, MovementOp::Shrink | MovementOp::Stride | MovementOp::Permute)
                    || (op == MovementOp::Reshape && matches!(inner.op(), Op::Unary(_)));
                if shuffles {
                    trace!("shuffling {op:?} through {}", inner.op());
                    return self.replace_with_movement_ops(&inner, &[(op, arg)]);
                }
            }
        }

        if self.config.remove_movement_nops && !realized && st.contiguous() {
            let root = self.get_movementroot(x, false);
            if root != x
                && self.lb(root).st.contiguous()
                && sym_prod(st.shape()) == sym_prod(self.shape(root))
            {
                trace!("movement chain on {x} is a reshape of {root}");
                return self.reshape(root, st.shape());
            }
        }

        let base = self.base_of(x);
        let device = self.lb(x).device.clone();
        let var_vals = self.var_vals(x).clone();
        Ok(self.create(
            &device,
            st,
            LazyOp::new(Op::Movement(op), vec![x.into()], arg),
            self.dtype(x),
            var_vals,
            Some(base),
        ))
    }

    fn check_rank(&self, x: BufferId, op: &str, n: usize) -> Result<()> {
        let shape = self.get(x)?.shape();
        ensure!(
            shape.len() == n,
            InvalidMovementSnafu {
                op,
                shape: render_shape(shape),
                reason: format!("expected {} dims, got {n}", shape.len()),
            }
        );
        Ok(())
    }

    // collapsing into the source is only allowed if nothing else observes the intermediate
    fn collapsible(&self, x: BufferId, kind: MovementOp) -> Option<(BufferId, OpArg)> {
        if self.lb(x).children.len() > 1 {
            return None;
        }
        self.unrealized_movement(x, kind)
    }

    /// Reshape. Adding one symbolic dim to an integer shape binds that
    /// variable on the base buffer.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on size mismatch, `InvalidVariable` for an out of
    /// range value or more than one new variable, `VarValConflict` if the
    /// variable is already bound to something else.
    pub fn reshape(&mut self, x: BufferId, arg: &[Node]) -> Result<BufferId> {
        let shape = self.get(x)?.shape().to_vec();
        if shape == arg {
            return Ok(x);
        }

        let (ints, nodes): (Vec<&Node>, Vec<&Node>) = arg.iter().partition(|s| s.is_num());
        if !nodes.is_empty() && all_int(&shape) {
            self.bind_reshape_var(x, &shape, &ints, &nodes)?;
        }

        if let Some((src, _)) = self.collapsible(x, MovementOp::Reshape) {
            trace!("collapsing reshape of reshape {x}");
            self.lb_mut(src).children.remove(&x);
            return self.reshape(src, arg);
        }

        let st = self.lb(x).st.reshape(arg)?;
        self.movement_op(x, st, MovementOp::Reshape, OpArg::Shape(arg.to_vec()))
    }

    fn bind_reshape_var(&mut self, x: BufferId, shape: &[Node], ints: &[&Node], nodes: &[&Node]) -> Result<()> {
        let var = match nodes {
            [n] => n.as_var().cloned(),
            _ => None,
        };
        let Some(var) = var else {
            return InvalidVariableSnafu {
                name: nodes.iter().map(|n| n.render()).collect::<Vec<_>>().join(","),
                min: 0,
                max: 0,
                reason: "only one variable can be added to an int shape",
            }
            .fail();
        };
        let total: i64 = shape.iter().filter_map(Node::as_num).product();
        let rest: i64 = ints.iter().filter_map(|n| n.as_num()).product();
        ensure!(
            rest != 0 && total % rest == 0,
            InvalidMovementSnafu {
                op: "reshape",
                shape: render_shape(shape),
                reason: format!("{total} elements don't divide by {rest}"),
            }
        );
        let new_val = total / rest;
        let base = self.base_of(x);
        match self.lb(base).var_vals.get(&var) {
            None => {
                ensure!(
                    var.vmin() <= new_val && new_val <= var.vmax(),
                    InvalidVariableSnafu {
                        name: var.name(),
                        min: var.vmin(),
                        max: var.vmax(),
                        reason: format!("value {new_val} out of range"),
                    }
                );
                trace!("binding {var} = {new_val} on {base}");
                self.lb_mut(base).var_vals.insert(var, new_val);
            }
            Some(was) => ensure!(
                *was == new_val,
                VarValConflictSnafu {
                    name: var.name(),
                    was: *was,
                    new: new_val,
                }
            ),
        }
        Ok(())
    }

    /// Zero padding, `(before, after)` per axis.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on rank mismatch, negative pads or symbolic axes.
    pub fn pad(&mut self, x: BufferId, arg: &[(i64, i64)]) -> Result<BufferId> {
        self.check_rank(x, "pad", arg.len())?;
        if arg.iter().all(|(b, e)| *b == 0 && *e == 0) {
            return Ok(x);
        }
        if let Some((src, OpArg::Pairs(prev))) = self.collapsible(x, MovementOp::Pad) {
            trace!("collapsing pad of pad {x}");
            let merged: Vec<(i64, i64)> = prev
                .iter()
                .zip(arg)
                .map(|((b1, e1), (b2, e2))| (b1 + b2, e1 + e2))
                .collect();
            return self.pad(src, &merged);
        }
        let st = self.lb(x).st.pad(arg)?;
        self.movement_op(x, st, MovementOp::Pad, OpArg::Pairs(arg.to_vec()))
    }

    /// Broadcast unit axes.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on rank mismatch or a non-unit axis changing size.
    pub fn expand(&mut self, x: BufferId, arg: &[Node]) -> Result<BufferId> {
        self.check_rank(x, "expand", arg.len())?;
        if self.shape(x) == arg {
            return Ok(x);
        }
        if let Some((src, _)) = self.collapsible(x, MovementOp::Expand) {
            trace!("collapsing expand of expand {x}");
            return self.expand(src, arg);
        }
        let st = self.lb(x).st.expand(arg)?;
        self.movement_op(x, st, MovementOp::Expand, OpArg::Shape(arg.to_vec()))
    }

    /// # Errors
    ///
    /// `InvalidMovement` if `arg` isn't a permutation of the axes.
    pub fn permute(&mut self, x: BufferId, arg: &[usize]) -> Result<BufferId> {
        self.check_rank(x, "permute", arg.len())?;
        let shape = self.shape(x).to_vec();
        let mut sorted = arg.to_vec();
        sorted.sort_unstable();
        if sorted != (0..arg.len()).collect::<Vec<_>>() {
            return Err(movement_error("permute", &shape, format!("{arg:?} is not a permutation")));
        }
        if arg.iter().enumerate().all(|(i, a)| i == *a) {
            return Ok(x);
        }
        let permuted: Vec<Node> = arg.iter().map(|a| shape[*a].clone()).collect();

        // moving only unit axes around is a reshape
        if all_int(&shape) && ShapeTracker::from_shape(&shape)?.permute(arg)?.contiguous() {
            return self.reshape(x, &permuted);
        }

        if let Some((src, OpArg::Axes(prev))) = self.collapsible(x, MovementOp::Permute) {
            trace!("collapsing permute of permute {x}");
            let composed: Vec<usize> = arg.iter().map(|i| prev[*i]).collect();
            return self.permute(src, &composed);
        }

        if let Some(op) = self.unrealized_op(x) {
            match (op.op(), op.arg(), op.srcs()[0].as_buffer()) {
                (Op::Reduce(rop), OpArg::Shape(reduced), Some(src)) if self.config.push_permutes => {
                    trace!("pushing permute before reduce {x}");
                    let narg: Vec<Node> = arg.iter().map(|a| reduced[*a].clone()).collect();
                    self.lb_mut(src).children.remove(&x);
                    let p = self.permute(src, arg)?;
                    return self.r(rop, p, &narg);
                }
                // always safe
                (Op::Movement(MovementOp::Expand), OpArg::Shape(expanded), Some(src)) => {
                    trace!("pushing permute before expand {x}");
                    let narg: Vec<Node> = arg.iter().map(|a| expanded[*a].clone()).collect();
                    let p = self.permute(src, arg)?;
                    return self.expand(p, &narg);
                }
                (Op::Movement(MovementOp::Reshape), _, Some(src)) if self.config.push_permutes => {
                    if let Some(groups) = get_contraction(self.shape(src), &shape) {
                        trace!("pushing permute before reshape {x}");
                        self.lb_mut(src).children.remove(&x);
                        let flat: Vec<usize> = arg.iter().flat_map(|i| groups[*i].iter().copied()).collect();
                        let p = self.permute(src, &flat)?;
                        return self.reshape(p, &permuted);
                    }
                }
                _ => {}
            }
        }

        let st = self.lb(x).st.permute(arg)?;
        self.movement_op(x, st, MovementOp::Permute, OpArg::Axes(arg.to_vec()))
    }

    /// Keep `[begin, end)` per axis.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on rank mismatch, bounds outside the shape or symbolic axes.
    pub fn shrink(&mut self, x: BufferId, arg: &[(i64, i64)]) -> Result<BufferId> {
        self.check_rank(x, "shrink", arg.len())?;
        if self.shape(x).iter().zip(arg).all(|(s, (b, e))| *s == e - b) {
            return Ok(x);
        }
        if let Some((src, OpArg::Pairs(prev))) = self.collapsible(x, MovementOp::Shrink) {
            trace!("collapsing shrink of shrink {x}");
            let merged: Vec<(i64, i64)> = prev
                .iter()
                .zip(arg)
                .map(|((b1, _), (b2, e2))| (b1 + b2, b1 + e2))
                .collect();
            return self.shrink(src, &merged);
        }
        let st = self.lb(x).st.shrink(arg)?;
        self.movement_op(x, st, MovementOp::Shrink, OpArg::Pairs(arg.to_vec()))
    }

    /// Step through each axis by a multiplier, negative to flip.
    ///
    /// # Errors
    ///
    /// `InvalidMovement` on rank mismatch, zero strides or symbolic axes.
    pub fn stride(&mut self, x: BufferId, arg: &[i64]) -> Result<BufferId> {
        self.check_rank(x, "stride", arg.len())?;
        if arg.iter().all(|a| *a == 1) {
            return Ok(x);
        }
        if let Some((src, OpArg::Strides(prev))) = self.collapsible(x, MovementOp::Stride) {
            trace!("collapsing stride of stride {x}");
            let merged: Vec<i64> = arg.iter().zip(&prev).map(|(a, b)| a * b).collect();
            return self.stride(src, &merged);
        }
        let st = self.lb(x).st.stride(arg)?;
        self.movement_op(x, st, MovementOp::Stride, OpArg::Strides(arg.to_vec()))
    }

    pub(crate) fn apply_movement(&mut self, x: BufferId, op: MovementOp, arg: &OpArg) -> Result<BufferId> {
        match (op, arg) {
            (MovementOp::Reshape, OpArg::Shape(s)) => self.reshape(x, s),
            (MovementOp::Expand, OpArg::Shape(s)) => self.expand(x, s),
            (MovementOp::Permute, OpArg::Axes(a)) => self.permute(x, a),
            (MovementOp::Pad, OpArg::Pairs(p)) => self.pad(x, p),
            (MovementOp::Shrink, OpArg::Pairs(p)) => self.shrink(x, p),
            (MovementOp::Stride, OpArg::Strides(s)) => self.stride(x, s),
            _ => panic!("bad arg {arg:?} for {op:?}"),
        }
    }

    /// Rebuild an elementwise op tree with `mops` applied to each leaf.
    fn replace_with_movement_ops(&mut self, op: &LazyOp, mops: &[(MovementOp, OpArg)]) -> Result<BufferId> {
        assert!(op.op().is_elementwise(), "can't push movement ops through {}", op.op());
        let mut srcs = Vec::with_capacity(op.srcs().len());
        for s in op.srcs() {
            srcs.push(match s {
                LazySrc::Op(inner) => self.replace_with_movement_ops(inner, mops)?,
                LazySrc::Buffer(b) => {
                    let mut y = *b;
                    for (m, arg) in mops {
                        y = self.apply_movement(y, *m, arg)?;
                    }
                    y
                }
            });
        }
        self.e(op.op(), &srcs, op.arg().clone())
    }

    /// Pull single-use movement chains on top of elementwise ops down to the
    /// elementwise inputs.
    fn push_movement_ops(&mut self, srcs: &[BufferId]) -> Result<Vec<BufferId>> {
        let mut new_srcs = Vec::with_capacity(srcs.len());
        for &x in srcs {
            let mut mops: Vec<(MovementOp, OpArg)> = vec![];
            let mut bx = x;
            while let Some(op) = self.unrealized_op(bx) {
                let Op::Movement(m) = op.op() else { break };
                if m == MovementOp::Expand
                    || (m == MovementOp::Pad && !self.config.shuffle_pad_ops)
                    || self.lb(bx).children.len() > 1
                {
                    break;
                }
                let Some(src) = op.srcs()[0].as_buffer() else { break };
                mops.push((m, op.arg().clone()));
                bx = src;
            }
            if mops.is_empty() {
                new_srcs.push(x);
                continue;
            }
            let pushable = match self.unrealized_op(bx) {
                Some(op) if op.op().is_elementwise() && self.lb(bx).children.len() <= 1 => {
                    let has_pad = mops.iter().any(|(m, _)| *m == MovementOp::Pad);
                    let unsafe_op = op.get_lazyops().iter().any(|o| UNSAFE_PAD_OPS.contains(&o.op()));
                    (!has_pad || !unsafe_op).then_some(op)
                }
                _ => None,
            };
            match pushable {
                Some(op) => {
                    mops.reverse();
                    trace!("pushing {} movement ops below {}", mops.len(), op.op());
                    new_srcs.push(self.replace_with_movement_ops(&op, &mops)?);
                }
                None => new_srcs.push(x),
            }
        }
        Ok(new_srcs)
    }

    // *** roots ***

    /// Follow unrealized movement ops (and, if allowed, copies of contiguous
    /// sources) back to the buffer they read.
    pub fn get_movementroot(&self, x: BufferId, allow_contiguous: bool) -> BufferId {
        let Some(op) = self.unrealized_op(x) else {
            return x;
        };
        let Some(src) = op.srcs().first().and_then(LazySrc::as_buffer) else {
            return x;
        };
        match op.op() {
            Op::Movement(_) => self.get_movementroot(src, allow_contiguous),
            Op::Load(LoadOp::Contiguous) if allow_contiguous && self.lb(src).st.contiguous() => {
                self.get_movementroot(src, allow_contiguous)
            }
            _ => x,
        }
    }

    pub fn get_movementroot_contiguous(&self, x: BufferId) -> BufferId {
        if let Some(op) = self.unrealized_op(x) {
            if op.op() == Op::Load(LoadOp::Contiguous) {
                if let Some(src) = op.srcs()[0].as_buffer() {
                    return self.get_movementroot_contiguous(src);
                }
            }
        }
        let lb = self.lb(x);
        if lb.optype == OpType::Movement && lb.st.contiguous() {
            self.get_movementroot(x, true)
        } else {
            x
        }
    }

    /// Follow single-source ops back as far as they go.
    pub fn get_single_root(&self, x: BufferId) -> BufferId {
        match &self.lb(x).op {
            Some(op) if op.srcs().len() == 1 => match op.srcs()[0].as_buffer() {
                Some(src) => self.get_single_root(src),
                None => x,
            },
            _ => x,
        }
    }

    // *** reclaiming ***

    /// Drop every buffer not reachable from `roots`. Returns how many were
    /// dropped.
    pub fn collect(&mut self, roots: &[BufferId]) -> usize {
        let mut live: HashSet<BufferId> = HashSet::new();
        let mut stack: Vec<BufferId> = roots
            .iter()
            .copied()
            .filter(|r| self.get(*r).is_ok())
            .collect();
        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            let lb = self.lb(id);
            stack.extend(lb.base);
            if let Some(op) = &lb.op {
                stack.extend(op.buffers().iter().copied());
            }
        }

        let mut dropped = 0;
        for (i, slot) in self.buffers.iter_mut().enumerate() {
            if slot.is_some() && !live.contains(&BufferId(i)) {
                *slot = None;
                dropped += 1;
            }
        }
        for lb in self.buffers.iter_mut().flatten() {
            lb.children.retain(|c| live.contains(c));
            lb.views.retain(|v| live.contains(v));
        }
        self.cache.retain(|_, v| live.contains(v));
        trace!("collected {dropped} buffers, {} live", live.len());
        dropped
    }
}

impl Display for LazyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match (&self.realized, &self.op) {
            (Some(_), _) => "realized".to_string(),
            (None, Some(op)) => op.op().to_string(),
            (None, None) => "none".to_string(),
        };
        write!(f, "<LB {} {} op={op} st={}>", render_shape(self.shape()), self.dtype, self.st)
    }
}
