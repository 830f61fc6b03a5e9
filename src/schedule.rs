use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::debug;
use snafu::{ensure, OptionExt};

use crate::{
    dtype::DType,
    error::{Result, ScheduleSnafu, UnknownOpSnafu, VarValConflictSnafu},
    lazy::Graph,
    ops::{
        const_op, mem_op, BufferId, LazyOp, LazySrc, LoadOp, MovementOp, Op, OpArg, OpType, UnaryOp,
    },
    symbolic::{sym_prod, Node, VarVals},
};

/// One unit of work: compute `out` from `inputs` by running `ast`.
///
/// In `ast`, `Mem` slot `i` refers to `inputs[i - 1]`. Load items carry
/// their load op instead, with the sources as inputs.
#[derive(Clone, Debug)]
pub struct ScheduleItem {
    pub ast: Arc<LazyOp>,
    pub out: BufferId,
    pub inputs: Vec<BufferId>,
    pub var_vals: VarVals,
}

impl Graph {
    /// Everything that has to run to realize `root`, dependencies first.
    /// Each buffer appears at most once.
    ///
    /// # Errors
    ///
    /// `MissingBuffer` for an unknown root, `UnknownOp` if a leaf is neither
    /// computable nor a constant.
    pub fn schedule(&mut self, root: BufferId) -> Result<Vec<ScheduleItem>> {
        self.get(root)?;
        let mut seen = HashSet::new();
        let schedule = self.schedule_inner(root, &mut seen)?;
        debug!("scheduled {} items for {root}", schedule.len());
        Ok(schedule)
    }

    fn schedule_inner(&mut self, x: BufferId, seen: &mut HashSet<BufferId>) -> Result<Vec<ScheduleItem>> {
        if seen.contains(&x) || self.is_realized(x) || self.is_unrealized_const(x) {
            return Ok(vec![]);
        }
        seen.insert(x);
        if self.lb(x).optype == OpType::Movement {
            let base = self.base_of(x);
            return self.schedule_inner(base, seen);
        }

        let own = self.lb(x).op.clone().context(ScheduleSnafu {
            reason: format!("{x} is neither realized nor computed"),
        })?;

        if let Op::Load(l) = own.op() {
            if l != LoadOp::Contiguous {
                let mut ret = vec![];
                for b in own.buffers() {
                    ret.extend(self.schedule_inner(*b, seen)?);
                }
                ret.push(ScheduleItem {
                    inputs: own.buffers().to_vec(),
                    ast: own,
                    out: x,
                    var_vals: self.var_vals(x).clone(),
                });
                return Ok(ret);
            }
        }

        let shape = self.shape(x).to_vec();
        let mut op = match (own.op(), self.lb(x).optype) {
            (Op::Load(LoadOp::Contiguous), _) => {
                LazyOp::new(Op::Unary(UnaryOp::Noop), own.srcs().to_vec(), OpArg::None)
            }
            (_, OpType::Elementwise) => self.ast_binaryops(&own, &shape)?,
            (_, OpType::Reduce) => self.ast_reduceops(&own),
            _ => (*own).clone(),
        };

        if let DType::Image { .. } = self.dtype(x) {
            if self.image_needs_float_output(x) {
                debug!("forcing float32 output for {x}, its shape doesn't fit the image");
                let cast = |o: LazySrc| LazyOp::new(Op::Unary(UnaryOp::Cast), vec![o], OpArg::Cast(DType::Float32, false));
                let reshaped = match (op.op(), op.srcs().first()) {
                    (Op::Movement(MovementOp::Reshape), Some(src)) => Some(src.clone()),
                    _ => None,
                };
                op = match reshaped {
                    Some(src) => LazyOp::new(op.op(), vec![cast(src).into()], op.arg().clone()),
                    None => cast(op.into()),
                };
                self.set_dtype(x, DType::Float32);
            }
        }

        // a copy of something already laid out contiguously is just that thing
        if own.op() == Op::Load(LoadOp::Contiguous) {
            if let Some(src) = own.srcs()[0].as_buffer() {
                let src_lb = self.lb(src);
                if src_lb.st.contiguous()
                    && src_lb.st.size() == self.lb(self.base_of(src)).st.size()
                    && !self.is_unrealized_const(src)
                {
                    let mut ret = self.schedule_inner(src, seen)?;
                    ret.push(ScheduleItem {
                        inputs: vec![src],
                        ast: own,
                        out: x,
                        var_vals: self.var_vals(x).clone(),
                    });
                    return Ok(ret);
                }
            }
        }

        let mut ret = vec![];
        for b in op.buffers() {
            ret.extend(self.schedule_inner(*b, seen)?);
        }
        let mut var_vals = self.var_vals(x).clone();
        for b in op.buffers() {
            for (k, v) in self.var_vals(*b) {
                if let Some(was) = var_vals.insert(k.clone(), *v) {
                    ensure!(
                        was == *v,
                        VarValConflictSnafu {
                            name: k.name(),
                            was,
                            new: *v,
                        }
                    );
                }
            }
        }
        self.set_var_vals(x, var_vals.clone());

        let (ast, base_bufs) = self.replace_bufferops(&op)?;
        ret.push(ScheduleItem {
            ast: Arc::new(ast),
            out: x,
            inputs: base_bufs,
            var_vals,
        });
        Ok(ret)
    }

    fn image_needs_float_output(&self, x: BufferId) -> bool {
        let lb = self.lb(x);
        let Some(img) = self.dtype(x).image_shape() else {
            return false;
        };
        let shape = lb.shape();
        sym_prod(shape) != img.iter().product::<i64>()
            || !lb
                .st
                .unit_stride_axes(false)
                .iter()
                .any(|a| shape[*a].as_num().is_some_and(|n| n % 4 == 0))
    }

    /// Inline a single-use elementwise source into the reduce.
    fn ast_reduceops(&self, op: &LazyOp) -> LazyOp {
        let mut src = op.srcs()[0].clone();
        if let LazySrc::Buffer(b) = src {
            if let Some(inner) = self.unrealized_op(b) {
                if self.config.merge_elementwise_into_reduce
                    && self.lb(b).optype == OpType::Elementwise
                    && self.lb(b).children.len() <= 1
                {
                    src = LazySrc::Op(inner);
                }
            }
        }
        LazyOp::new(op.op(), vec![src], op.arg().clone())
    }

    /// Fuse at most one reduce into an elementwise op. Other sources are
    /// reshaped to the reduce's output shape.
    fn ast_binaryops(&mut self, op: &LazyOp, shape: &[Node]) -> Result<LazyOp> {
        let mut keys: Vec<BufferId> = vec![];
        for b in op.buffers() {
            if !keys.contains(b) {
                keys.push(*b);
            }
        }
        let mut real_srcs: HashMap<BufferId, LazySrc> = HashMap::new();
        let mut intermediate = shape.to_vec();

        if self.config.merge_one_reduce_into_elementwise {
            let fusable = keys.iter().find_map(|k| {
                let x = self.get_movementroot_contiguous(*k);
                let ok = self.lb(x).optype == OpType::Reduce
                    && !self.is_realized(x)
                    && sym_prod(self.shape(*k)) == sym_prod(self.shape(x))
                    && self.lb(x).children.len() <= 1
                    && self.lb(*k).children.len() <= 1;
                ok.then_some((*k, x))
            });
            if let Some((k, x)) = fusable {
                if let Some(reduce) = self.unrealized_op(x) {
                    debug!("fusing reduce {x} into elementwise through {k}");
                    let top = Arc::new(self.ast_reduceops(&reduce));
                    real_srcs.insert(k, LazySrc::Op(Arc::clone(&top)));
                    for b in top.buffers() {
                        real_srcs.insert(*b, LazySrc::Buffer(*b));
                    }
                    if self.shape(k) != self.shape(x) {
                        intermediate = self.shape(x).to_vec();
                    }
                }
            }
        }

        for k in keys {
            if !real_srcs.contains_key(&k) {
                let r = self.reshape(k, &intermediate)?;
                real_srcs.insert(k, LazySrc::Buffer(r));
            }
        }
        let ast = op.map_buffers(&real_srcs);
        Ok(if intermediate == shape {
            ast
        } else {
            LazyOp::new(
                Op::Movement(MovementOp::Reshape),
                vec![ast.into()],
                OpArg::Shape(shape.to_vec()),
            )
        })
    }

    /// Turn buffer leaves into `Mem` and `Const` leaves. Returns the new AST
    /// and the base buffers in slot order.
    fn replace_bufferops(&self, op: &LazyOp) -> Result<(LazyOp, Vec<BufferId>)> {
        let mut base_bufs: Vec<BufferId> = vec![];
        for b in op.buffers() {
            if !self.is_unrealized_const(*b) {
                let base = self.base_of(*b);
                if !base_bufs.contains(&base) {
                    base_bufs.push(base);
                }
            }
        }

        let mut repl: HashMap<BufferId, LazySrc> = HashMap::new();
        for b in op.buffers() {
            let lb = self.lb(*b);
            let st = lb.st.simplify();
            let base = self.base_of(*b);
            let leaf = if let Some(i) = base_bufs.iter().position(|x| *x == base) {
                mem_op(i + 1, self.dtype(*b), st)
            } else {
                let base_op = self.unrealized_op(base);
                match base_op.as_ref().map(|o| (o.op(), o.arg())) {
                    Some((Op::Load(LoadOp::Const), OpArg::Const(c))) => const_op(c.0, self.dtype(*b), st),
                    _ => {
                        return UnknownOpSnafu {
                            what: format!("{b} with base {base}"),
                        }
                        .fail()
                    }
                }
            };
            repl.insert(*b, leaf.into());
        }

        let root = match (op.op(), op.srcs().first()) {
            (Op::Movement(MovementOp::Reshape), Some(LazySrc::Op(inner))) => inner.as_ref(),
            _ => op,
        };
        Ok((root.map_buffers(&repl), base_bufs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RewriteConfig,
        ops::{BinaryOp, BufferOp, ReduceOp},
        symbolic::to_nodes,
    };

    fn input(g: &mut Graph, device: &str, shape: &[i64]) -> BufferId {
        let n: usize = shape.iter().product::<i64>().try_into().unwrap();
        g.from_host(device, shape, &vec![1.0f32; n]).unwrap()
    }

    #[test]
    fn test_elementwise_is_one_kernel() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = input(&mut g, "CPU", &[4]);
        let y = input(&mut g, "CPU", &[4]);
        let a = g.binary(BinaryOp::Mul, x, y).unwrap();
        let b = g.binary(BinaryOp::Add, a, x).unwrap();
        let sched = g.schedule(b).unwrap();
        assert_eq!(sched.len(), 1);
        assert_eq!(sched[0].out, b);
        assert_eq!(sched[0].inputs, vec![x, y]);
        let leaves: Vec<_> = sched[0]
            .ast
            .get_lazyops()
            .into_iter()
            .filter_map(|o| match o.arg() {
                OpArg::Mem(m) => Some(m.idx),
                _ => None,
            })
            .collect();
        assert_eq!(leaves, vec![1, 2, 1]);
    }

    #[test]
    fn test_const_is_inlined_on_compiled() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = input(&mut g, "VM", &[4]);
        let c = g.const_like(x, 2.0).unwrap();
        let m = g.binary(BinaryOp::Mul, x, c).unwrap();
        let sched = g.schedule(m).unwrap();
        assert_eq!(sched.len(), 1);
        assert_eq!(sched[0].inputs, vec![x]);
        assert!(sched[0]
            .ast
            .get_lazyops()
            .iter()
            .any(|o| o.op() == Op::Buffer(BufferOp::Const)));
    }

    #[test]
    fn test_const_is_scheduled_on_interpreted() {
        let mut g = Graph::new(RewriteConfig::default());
        let c = g.full("CPU", &to_nodes(&[4, 4]), DType::Float32, 2.0).unwrap();
        let out = g.contiguous(c).unwrap();
        let sched = g.schedule(out).unwrap();
        assert_eq!(sched.len(), 2);
        assert_eq!(sched[0].ast.op(), Op::Load(LoadOp::Const));
        assert_eq!(sched[1].out, out);
    }

    #[test]
    fn test_reduce_fused_into_elementwise() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = input(&mut g, "CPU", &[4, 4]);
        let s = g.r(ReduceOp::Sum, x, &to_nodes(&[4, 1])).unwrap();
        let y = input(&mut g, "CPU", &[4, 1]);
        let out = g.binary(BinaryOp::Add, s, y).unwrap();
        let sched = g.schedule(out).unwrap();
        assert_eq!(sched.len(), 1);
        assert!(sched[0].ast.get_lazyops().iter().any(|o| o.op() == Op::Reduce(ReduceOp::Sum)));
        assert_eq!(sched[0].inputs, vec![x, y]);
    }

    #[test]
    fn test_shared_reduce_is_its_own_kernel() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = input(&mut g, "CPU", &[4, 4]);
        let s = g.r(ReduceOp::Sum, x, &to_nodes(&[4, 1])).unwrap();
        let y = input(&mut g, "CPU", &[4, 1]);
        let a = g.binary(BinaryOp::Add, s, y).unwrap();
        g.binary(BinaryOp::Mul, s, y).unwrap();
        let sched = g.schedule(a).unwrap();
        assert_eq!(sched.len(), 2);
        assert_eq!(sched[0].out, s);
        assert_eq!(sched[1].out, a);
    }

    #[test]
    fn test_contiguous_of_contiguous_aliases() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = input(&mut g, "CPU", &[4]);
        let c = g.contiguous(x).unwrap();
        let sched = g.schedule(c).unwrap();
        assert_eq!(sched.len(), 1);
        assert_eq!(sched[0].ast.op(), Op::Load(LoadOp::Contiguous));
    }

    #[test]
    fn test_contiguous_of_permute_copies() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = input(&mut g, "CPU", &[2, 3]);
        let p = g.permute(x, &[1, 0]).unwrap();
        let c = g.contiguous(p).unwrap();
        let sched = g.schedule(c).unwrap();
        assert_eq!(sched.len(), 1);
        assert_eq!(sched[0].ast.op(), Op::Unary(UnaryOp::Noop));
        assert_eq!(sched[0].inputs, vec![x]);
    }

    #[test]
    fn test_schedule_each_buffer_once() {
        let mut g = Graph::new(RewriteConfig::from_opt_level(0));
        let x = input(&mut g, "CPU", &[4]);
        let a = g.unary(UnaryOp::Neg, x).unwrap();
        let b = g.binary(BinaryOp::Add, a, a).unwrap();
        let c = g.binary(BinaryOp::Mul, b, a).unwrap();
        let sched = g.schedule(c).unwrap();
        let outs: Vec<_> = sched.iter().map(|s| s.out).collect();
        assert_eq!(outs, vec![a, b, c]);
    }
}
