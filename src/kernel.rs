use std::{collections::BTreeSet, fmt::Write, iter::once, sync::Arc};

use log::trace;

use crate::{
    dtype::DType,
    error::Result,
    ops::{get_info, ConstBuffer, LazyOp, MemBuffer, Op, OpArg, OpInfo},
    shape_tracker::{get_contraction, ShapeTracker},
    symbolic::{as_ints, to_nodes, Node},
    view::{mul_dims, strides_for_shape},
};

/// What the target of a kernel supports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinearizerOptions {
    /// Float4/float2 loads and stores of unit stride upcasted axes.
    pub supports_float4: bool,
    /// Global and local ids are launch dimensions instead of loops.
    pub has_local: bool,
    /// Per-dimension launch limits. Their length is the number of hardware
    /// dimensions indices are grouped into.
    pub global_max: Vec<i64>,
    pub local_max: Vec<i64>,
}

impl Default for LinearizerOptions {
    fn default() -> Self {
        LinearizerOptions {
            supports_float4: true,
            has_local: true,
            global_max: vec![65535, 65535, 65535],
            local_max: vec![256, 256, 64],
        }
    }
}

impl LinearizerOptions {
    /// A target that runs everything as plain loops.
    pub fn loops_only() -> Self {
        LinearizerOptions {
            supports_float4: false,
            has_local: false,
            ..LinearizerOptions::default()
        }
    }

    fn max_local_size(&self) -> i64 {
        self.local_max.iter().product::<i64>().min(128)
    }
}

/// A buffer slot of a kernel. Slot 0 is the output.
#[derive(Clone, Debug, PartialEq)]
pub enum KernelBuffer {
    Mem(MemBuffer),
    Const(ConstBuffer),
    /// Workgroup memory for a grouped reduce.
    Local { name: String, size: i64, dtype: DType },
}

impl KernelBuffer {
    pub fn dtype(&self) -> DType {
        match self {
            KernelBuffer::Mem(m) => m.dtype,
            KernelBuffer::Const(c) => c.dtype,
            KernelBuffer::Local { dtype, .. } => *dtype,
        }
    }

    fn from_leaf(op: &LazyOp) -> Option<KernelBuffer> {
        match (op.op(), op.arg()) {
            (Op::Buffer(_), OpArg::Mem(m)) => Some(KernelBuffer::Mem(m.clone())),
            (Op::Buffer(_), OpArg::ConstBuf(c)) => Some(KernelBuffer::Const(c.clone())),
            _ => None,
        }
    }
}

pub(crate) fn must<T>(r: Result<T>, what: &str) -> T {
    match r {
        Ok(v) => v,
        Err(e) => panic!("kernel {what} failed: {e}"),
    }
}

pub(crate) fn int_dim(n: &Node) -> i64 {
    match n.as_num() {
        Some(v) => v,
        None => panic!("expected a concrete dimension, got {n}"),
    }
}

fn prod_int(shape: &[Node]) -> Option<i64> {
    as_ints(shape).map(|s| s.iter().product())
}

/// Cartesian product of `0..n` per entry, last entry fastest.
fn product(sizes: &[i64]) -> Vec<Vec<i64>> {
    let mut out = vec![vec![]];
    for &n in sizes {
        out = out
            .into_iter()
            .flat_map(|prefix: Vec<i64>| {
                (0..n).map(move |x| {
                    let mut p = prefix.clone();
                    p.push(x);
                    p
                })
            })
            .collect();
    }
    out
}

/// Shape state of one AST before it is lowered to uops.
///
/// All trackers share one rank. Axes are laid out as global dims, local
/// dims, grouped reduce dims, reduce loops, then the `upcasted` axes that
/// are unrolled into registers.
#[derive(Clone, Debug)]
pub struct Kernel {
    pub(crate) opts: LinearizerOptions,
    pub(crate) ast: Arc<LazyOp>,
    pub(crate) info: OpInfo,
    pub(crate) reduceop: Option<LazyOp>,
    pub(crate) bufs: Vec<KernelBuffer>,
    pub(crate) sts: Vec<ShapeTracker>,
    pub(crate) earlybufs: Vec<KernelBuffer>,
    pub(crate) full_buf_index: usize,
    pub(crate) upcasted: usize,
    pub(crate) local_dims: usize,
    pub(crate) group_for_reduce: Vec<i64>,
}

impl Kernel {
    /// # Errors
    ///
    /// `InvalidMovement` if the output shape can't back a tracker.
    pub fn new(ast: Arc<LazyOp>, opts: LinearizerOptions) -> Result<Kernel> {
        let info = get_info(&ast);

        let mut reduceops: Vec<LazyOp> = vec![];
        for x in ast.get_lazyops() {
            if matches!(x.op(), Op::Reduce(_)) && !reduceops.contains(x) {
                reduceops.push(x.clone());
            }
        }
        assert!(reduceops.len() <= 1, "max one reduce op in an ast");
        let reduceop = reduceops.pop();

        let output = MemBuffer {
            idx: 0,
            dtype: info.dtype,
            st: ShapeTracker::from_shape(&info.shape)?,
        };
        let mut bufs = vec![KernelBuffer::Mem(output)];
        for b in ast.get_lazyops().into_iter().filter_map(KernelBuffer::from_leaf) {
            if !bufs.contains(&b) {
                bufs.push(b);
            }
        }
        let earlybufs: Vec<KernelBuffer> = reduceop
            .as_ref()
            .map(|r| r.get_lazyops().into_iter().filter_map(KernelBuffer::from_leaf).collect())
            .unwrap_or_default();
        let full_buf_index = earlybufs
            .first()
            .and_then(|e| bufs.iter().position(|b| b == e))
            .unwrap_or(0);
        let sts: Vec<ShapeTracker> = bufs
            .iter()
            .map(|b| match b {
                KernelBuffer::Mem(m) => m.st.simplify(),
                KernelBuffer::Const(c) => c.st.simplify(),
                KernelBuffer::Local { .. } => unreachable!("no local buffers before linearizing"),
            })
            .collect();
        assert!(
            sts.iter().all(|st| st.ndim() == sts[0].ndim()),
            "all buffers of a kernel have the same rank"
        );

        let mut k = Kernel {
            opts,
            ast,
            info,
            reduceop,
            bufs,
            sts,
            earlybufs,
            full_buf_index,
            upcasted: 0,
            local_dims: 0,
            group_for_reduce: vec![],
        };

        // reduce axes go last
        let mut permute: Vec<usize> = vec![];
        let mut reduce_axes: Vec<usize> = vec![];
        for (i, (s, n)) in k.full_shape().iter().zip(k.output_shape()).enumerate() {
            if s == n {
                permute.push(i);
            } else {
                reduce_axes.push(i);
            }
        }
        permute.extend(reduce_axes);
        k.reshape_and_permute(None, Some(&permute));

        k.simplify_ones();
        k.simplify_merge_adjacent();
        Ok(k)
    }

    /// Flops and memory of the AST, computed once on construction.
    pub fn info(&self) -> &OpInfo {
        &self.info
    }

    pub fn ast(&self) -> &LazyOp {
        &self.ast
    }

    pub fn bufs(&self) -> &[KernelBuffer] {
        &self.bufs
    }

    pub fn sts(&self) -> &[ShapeTracker] {
        &self.sts
    }

    pub fn upcasted(&self) -> usize {
        self.upcasted
    }

    pub fn local_dims(&self) -> usize {
        self.local_dims
    }

    pub fn group_for_reduce(&self) -> &[i64] {
        &self.group_for_reduce
    }

    pub fn shape_len(&self) -> usize {
        self.sts[0].ndim()
    }

    pub fn output_shape(&self) -> &[Node] {
        self.sts[0].shape()
    }

    pub fn full_shape(&self) -> &[Node] {
        self.sts[self.full_buf_index].shape()
    }

    pub fn full_unupcasted_shape(&self) -> &[Node] {
        &self.full_shape()[..self.shape_len() - self.upcasted]
    }

    /// First axis where the output is smaller than the full shape.
    pub fn first_reduce(&self) -> usize {
        let n = self.shape_len() - self.upcasted;
        (0..n)
            .find(|&i| self.output_shape()[i] != self.full_shape()[i])
            .unwrap_or(n)
    }

    pub fn global_dims(&self) -> usize {
        self.first_reduce() - self.local_dims
    }

    /// Grouped axes that aren't reduced, they get upcast after the local reduce.
    pub fn upcast_in_mid_reduce_axes(&self) -> Vec<usize> {
        let fr = self.first_reduce();
        (fr..fr + self.group_for_reduce.len())
            .filter(|&j| self.full_shape()[j] == self.output_shape()[j])
            .collect()
    }

    /// Every offset into the upcasted axes of buffer `i`, the last upcasted
    /// axis first in each tuple.
    pub fn shape_offsets(&self, i: usize) -> Vec<Vec<i64>> {
        if self.upcasted == 0 {
            return vec![vec![]];
        }
        let sizes: Vec<i64> = self.sts[i].shape()[self.shape_len() - self.upcasted..]
            .iter()
            .rev()
            .map(int_dim)
            .collect();
        product(&sizes)
    }

    /// Upcasted axes of buffer `i` with unit stride and a multiple of 4 long,
    /// relative to the first upcasted axis.
    pub fn float4_axis(&self, i: usize) -> Vec<usize> {
        let start = self.shape_len() - self.upcasted;
        self.sts[i]
            .unit_stride_axes(false)
            .into_iter()
            .filter(|&x| x >= start && self.sts[i].shape()[x].as_num().is_some_and(|s| s % 4 == 0))
            .map(|x| x - start)
            .collect()
    }

    /// `(size, stride, is_reduce)` of each upcasted axis of buffer `i`.
    pub fn upcasted_axis(&self, i: usize) -> Vec<(i64, Option<i64>, bool)> {
        let start = self.shape_len() - self.upcasted;
        let strides = self.sts[i].real_strides(false);
        (start..self.shape_len())
            .map(|x| {
                (
                    int_dim(&self.sts[i].shape()[x]),
                    strides[x],
                    self.output_shape()[x] != self.full_shape()[x],
                )
            })
            .collect()
    }

    /// Accumulator index for every element of `shape_offsets(i)`.
    pub fn acc_offsets(&self, i: usize) -> Vec<usize> {
        if self.upcasted == 0 {
            return vec![0];
        }
        let upcasted_i: Vec<(i64, Option<i64>, bool)> = self.upcasted_axis(i).into_iter().rev().collect();
        let acc_shape: Vec<i64> = upcasted_i.iter().map(|(s, _, r)| if *r { 1 } else { *s }).collect();
        let acc_strides: Vec<i64> = strides_for_shape(&to_nodes(&acc_shape))
            .unwrap_or_else(|| vec![0; acc_shape.len()])
            .into_iter()
            .zip(&upcasted_i)
            .map(|(x, (_, _, r))| if *r { 0 } else { x })
            .collect();
        let sizes: Vec<i64> = upcasted_i.iter().map(|(s, _, _)| *s).collect();
        product(&sizes)
            .into_iter()
            .map(|t| {
                let off: i64 = t.iter().zip(&acc_strides).map(|(y, st)| y * st).sum();
                usize::try_from(off).unwrap_or(0)
            })
            .collect()
    }

    /// The upcasted axes of buffer `i` that can load as a vector.
    pub fn get_upcast_dim(&self, i: usize) -> Vec<usize> {
        let dtype = self.bufs[i].dtype();
        let should_upcast = self.opts.supports_float4 && (dtype == DType::Float32 || dtype.is_image());
        if !should_upcast {
            return vec![];
        }
        let start = self.shape_len() - self.upcasted;
        self.sts[i]
            .unit_stride_axes(false)
            .into_iter()
            .filter(|&x| x >= start && self.sts[i].shape()[x].as_num().is_some_and(|s| s > 1))
            .collect()
    }

    /// One color per axis:
    /// blue global, cyan local, green grouped reduce, white upcast in the
    /// middle of a grouped reduce, red reduce loop, magenta upcasted reduce,
    /// yellow upcasted.
    pub fn colors(&self) -> Vec<&'static str> {
        let fr = self.first_reduce();
        let mid = self.upcast_in_mid_reduce_axes();
        let mut colors = vec!["blue"; self.global_dims()];
        colors.extend(vec!["cyan"; self.local_dims]);
        colors.extend((fr..fr + self.group_for_reduce.len()).map(|i| if mid.contains(&i) { "white" } else { "green" }));
        let reduce_loops = (self.shape_len() - self.upcasted).saturating_sub(fr + self.group_for_reduce.len());
        colors.extend(vec!["red"; reduce_loops]);
        colors.extend((self.shape_len() - self.upcasted..self.shape_len()).map(|i| {
            if self.full_shape()[i] == self.output_shape()[i] {
                "yellow"
            } else {
                "magenta"
            }
        }));
        assert_eq!(colors.len(), self.shape_len(), "colors size mismatch");
        colors
    }

    /// The full shape, each dim tagged with its color.
    pub fn colored_shape(&self) -> String {
        let mut out = String::new();
        for (s, c) in self.full_shape().iter().zip(self.colors()) {
            let _ = write!(out, "{s}:{c} ");
        }
        out.trim_end().to_string()
    }

    pub fn reshape_and_permute(&mut self, new_shape: Option<&dyn Fn(&[Node]) -> Vec<Node>>, axis: Option<&[usize]>) {
        for st in &mut self.sts {
            if let Some(f) = new_shape {
                *st = must(st.reshape(&f(st.shape())), "reshape");
            }
            if let Some(axis) = axis {
                *st = must(st.permute(axis), "permute");
            }
        }
    }

    /// Mark one more trailing axis as upcasted.
    pub fn upcast(&mut self) {
        let axis = self.shape_len() - self.upcasted - 1;
        let s = int_dim(&self.full_shape()[axis]);
        assert!(s != 1, "can't upcast a dimension with size 1");
        self.upcasted += 1;
    }

    /// Split `amount` off `axis` (from the top if `top`) and move it before
    /// `insert_before`, the end by default.
    pub fn shift_to(&mut self, axis: usize, amount: i64, top: bool, insert_before: Option<usize>) {
        let shape_len = self.shape_len();
        let mut insert_before = insert_before.unwrap_or(shape_len);
        let move_axis = if top { axis } else { axis + 1 };
        if move_axis < insert_before {
            insert_before += 1;
        }
        let split = move |x: &[Node]| -> Vec<Node> {
            let mut out = x[..axis].to_vec();
            let n = int_dim(&x[axis]);
            let (a, b) = match (n > 1, top) {
                (true, true) => (amount, n / amount),
                (true, false) => (n / amount, amount),
                (false, _) => (1, 1),
            };
            out.push(Node::num(a));
            out.push(Node::num(b));
            out.extend_from_slice(&x[axis + 1..]);
            out
        };
        let permute: Vec<usize> = (0..insert_before)
            .filter(|&i| i != move_axis)
            .chain(once(move_axis))
            .chain((insert_before..=shape_len).filter(|&i| i != move_axis))
            .collect();
        self.reshape_and_permute(Some(&split), Some(&permute));
    }

    /// Drop axes that are 1 everywhere. Returns whether any were dropped.
    pub fn simplify_ones(&mut self) -> bool {
        if self.shape_len() == 0 {
            return false;
        }
        let all_ones: Vec<bool> = self.full_shape().iter().map(|s| *s == 1).collect();
        let fr = self.first_reduce();
        let n = self.shape_len();
        self.local_dims -= all_ones[fr - self.local_dims..fr].iter().filter(|x| **x).count();
        self.upcasted -= all_ones[n - self.upcasted..].iter().filter(|x| **x).count();
        let keep = |shape: &[Node]| -> Vec<Node> {
            shape
                .iter()
                .zip(&all_ones)
                .filter(|(_, one)| !**one)
                .map(|(s, _)| s.clone())
                .collect()
        };
        self.reshape_and_permute(Some(&keep), None);
        all_ones.iter().any(|x| *x)
    }

    /// Merge neighbouring axes that every buffer walks as one, never across
    /// the first reduce axis.
    pub fn simplify_merge_adjacent(&mut self) {
        if self.shape_len() == 0 {
            return;
        }
        let mut shapes: Vec<Vec<Node>> = self.sts.iter().map(|st| st.shape().to_vec()).collect();
        let mut strides: Vec<Vec<Option<i64>>> = self.sts.iter().map(|st| st.real_strides(false)).collect();

        // fake strides so merging never crosses an image axis
        if let Some(base_shape) = self.bufs[0].dtype().image_shape() {
            let base = to_nodes(&base_shape);
            if let Some(groups) = get_contraction(self.output_shape(), &base) {
                let mut special: Vec<Option<i64>> = vec![];
                for g in &groups {
                    let piece: Vec<Node> = g.iter().map(|&x| self.output_shape()[x].clone()).collect();
                    let st = strides_for_shape(&piece).unwrap_or_else(|| vec![0; piece.len()]);
                    special.extend(st.into_iter().map(Some));
                }
                shapes.push(self.output_shape().to_vec());
                strides.push(special);
            }
        }

        let fr = self.first_reduce();
        let mut rets: Vec<Vec<(Node, Option<i64>)>> = shapes
            .iter()
            .zip(&strides)
            .map(|(sh, st)| vec![(sh[0].clone(), st[0])])
            .collect();
        for i in 1..shapes[0].len() {
            let mergeable = i != fr
                && (0..shapes.len()).all(|j| {
                    let last = rets[j].last().map(|r| r.1);
                    match strides[j][i] {
                        Some(0) => last == Some(Some(0)),
                        Some(st) => match shapes[j][i].as_num() {
                            Some(n) => last == Some(Some(n * st)),
                            None => false,
                        },
                        None => false,
                    }
                });
            for j in 0..shapes.len() {
                if mergeable {
                    if let Some(last) = rets[j].last_mut() {
                        *last = (mul_dims(&last.0, &shapes[j][i]), strides[j][i]);
                    }
                } else {
                    rets[j].push((shapes[j][i].clone(), strides[j][i]));
                }
            }
        }

        for (st, ret) in self.sts.iter_mut().zip(&rets) {
            let new_shape: Vec<Node> = ret.iter().map(|r| r.0.clone()).collect();
            *st = must(st.reshape(&new_shape), "merge");
        }
    }

    /// Image buffers need a unit stride axis of 4 upcasted.
    pub fn required_optimizations(&mut self, early_only: bool) {
        for buf_index in 0..self.bufs.len() {
            let buf = &self.bufs[buf_index];
            if !buf.dtype().is_image() || (early_only && !self.earlybufs.contains(buf)) {
                continue;
            }
            let st = &self.sts[buf_index];
            let unit_stride_axes_mul_4: Vec<usize> = st
                .unit_stride_axes(true)
                .into_iter()
                .filter(|&i| st.shape()[i].as_num().is_some_and(|s| s % 4 == 0))
                .collect();
            assert!(!unit_stride_axes_mul_4.is_empty(), "needs a unit stride axis in buffer {buf_index}");
            let first = unit_stride_axes_mul_4[0];
            if unit_stride_axes_mul_4.iter().all(|&x| x < self.shape_len() - self.upcasted)
                && !self.upcast_in_mid_reduce_axes().contains(&first)
            {
                self.shift_to(first, 4, false, None);
                self.upcast();
            }
        }
    }

    /// The default schedule of splits and upcasts for a target.
    pub fn hand_coded_optimizations(&mut self) {
        self.required_optimizations(true);
        self.simplify_ones();

        // grouping needs local memory
        let out_size = prod_int(&self.output_shape()[..self.first_reduce()]);
        if self.opts.has_local
            && self.float4_axis(0).is_empty()
            && self.first_reduce() <= 2
            && self.first_reduce() < self.shape_len()
            && out_size.is_some_and(|p| p <= 2048)
        {
            let sizes: &[i64] = if out_size.is_some_and(|p| p <= 32) { &[256, 16] } else { &[16] };
            let fr = self.first_reduce();
            for &sz in sizes {
                let fits = self.sts.iter().all(|st| {
                    st.shape()[fr]
                        .as_num()
                        .is_some_and(|s| s % sz == 0 || s == 1)
                });
                if fits {
                    self.shift_to(fr, sz, true, Some(fr + self.group_for_reduce.len()));
                    self.group_for_reduce.push(sz);
                    trace!("grouping reduce by {sz}");
                    break;
                }
            }
        }

        // upcasting in the middle of a reduce is only for images
        if self.bufs[0].dtype().is_image()
            && self.float4_axis(0).is_empty()
            && !self.group_for_reduce.is_empty()
            && self.first_reduce() <= 2
            && prod_int(self.output_shape()).is_some_and(|p| p > 1)
        {
            let axes = self.sts[0].unit_stride_axes(false);
            assert_eq!(axes.len(), 1, "wrong number of stride 1 axis: {axes:?}");
            if self.sts[0].shape()[axes[0]].as_num().is_some_and(|s| s % 4 == 0) {
                let at = self.first_reduce() + self.group_for_reduce.len();
                self.shift_to(axes[0], 4, false, Some(at));
                self.group_for_reduce.push(4);
            }
        }

        self.required_optimizations(false);
        self.simplify_ones();

        // more image indexing if the output is an image and there's room
        if let Some([h, w, _]) = self.bufs[0].dtype().image_shape() {
            if self.first_reduce() + self.group_for_reduce.len() < 3 {
                if let Some(s0) = self.sts[0].shape()[0].as_num() {
                    if (h * w) % s0 == 0 && s0 / h != 0 {
                        let split = move |x: &[Node]| -> Vec<Node> {
                            let mut out = vec![Node::num(h), Node::num(int_dim(&x[0]) / h)];
                            out.extend_from_slice(&x[1..]);
                            out
                        };
                        self.reshape_and_permute(Some(&split), None);
                        self.simplify_ones();
                    }
                }
            }
        }

        if !self.group_for_reduce.is_empty() {
            return;
        }

        // upcast broadcast axes
        let mut upcasted_axis: BTreeSet<usize> = BTreeSet::new();
        while prod_int(&self.output_shape()[..self.first_reduce()]).is_some_and(|p| p >= 1024) {
            let mut xb_choices: Vec<(usize, i64, usize, i64)> = vec![];
            for axis in 0..self.first_reduce() {
                for amount in [3, 4] {
                    let Some(size) = self.full_shape()[axis].as_num() else {
                        continue;
                    };
                    if upcasted_axis.contains(&axis) || size % amount != 0 {
                        continue;
                    }
                    let broadcasts = (0..self.sts.len()).any(|b| {
                        last_stride(&self.sts[b], axis) == 0
                            && !self.upcasted_axis(b).iter().any(|x| x.1 == Some(0))
                    });
                    if broadcasts {
                        xb_choices.push((
                            self.sts.iter().filter(|st| last_stride(st, axis) > 0).count(),
                            self.sts.iter().map(|st| last_stride(st, axis)).sum(),
                            axis,
                            amount,
                        ));
                    }
                }
            }
            let Some(&(_, _, axis, amount)) = xb_choices.iter().min() else {
                break;
            };
            trace!("float4 merging axis {axis} by {amount}");
            self.shift_to(axis, amount, false, None);
            self.upcast();
            self.simplify_ones();
            upcasted_axis.insert(axis);
        }

        // unroll a small reduce
        if self.first_reduce() < self.shape_len() - self.upcasted
            && (self.shape_offsets(self.full_buf_index).len() <= 4
                || !self.upcasted_axis(self.full_buf_index).iter().any(|x| x.2))
        {
            let last = self.full_unupcasted_shape().len() - 1;
            let last_dim = self.full_unupcasted_shape()[last].as_num();
            match last_dim {
                Some(s) if s <= 32 => {
                    self.upcast();
                    if self.first_reduce() < self.shape_len() - self.upcasted
                        && s <= 3
                        && self
                            .full_unupcasted_shape()
                            .last()
                            .and_then(Node::as_num)
                            .is_some_and(|s| s <= 3)
                    {
                        self.upcast();
                    }
                }
                Some(s) if s % 4 == 0 => {
                    self.shift_to(last, 4, false, Some(last + 1));
                    self.upcast();
                }
                _ => {}
            }
        }

        // an easy upcast if nothing is upcasted yet
        if self.upcasted == 0 {
            if let Some(s) = self.full_unupcasted_shape().last().and_then(Node::as_num) {
                if s % 4 == 0 {
                    let last = self.full_unupcasted_shape().len() - 1;
                    self.shift_to(last, 4, false, Some(last + 1));
                    self.upcast();
                }
            }
        }

        // local groups
        if self.opts.has_local {
            let max_local = self.opts.max_local_size();
            let top = self.first_reduce() - self.local_dims;
            for axis in (0..top).rev() {
                let Some(size) = self.full_shape()[axis].as_num() else {
                    continue;
                };
                if size == 1 {
                    continue;
                }
                let fr = self.first_reduce();
                let local_size = prod_int(&self.full_shape()[fr - self.local_dims..fr]).unwrap_or(max_local);
                let last_try = self.local_dims == 0 && axis == 0;
                if self.sts.iter().any(|st| last_stride(st, axis) == 0) || last_try {
                    let candidates: Vec<i64> = if last_try { vec![32, 16, 8, 4, 3] } else { vec![16, 8, 4, 3] };
                    if let Some(sz) = candidates
                        .into_iter()
                        .find(|x| size % x == 0 && local_size * x <= max_local)
                    {
                        self.shift_to(axis, sz, false, Some(fr - self.local_dims));
                        self.local_dims += 1;
                    }
                }
                if self.local_dims >= 3 {
                    break;
                }
            }
        }

        self.simplify_ones();
        trace!("optimized {}", self.colored_shape());
    }
}

fn last_stride(st: &ShapeTracker, axis: usize) -> i64 {
    st.views().last().map_or(0, |v| v.strides()[axis])
}
