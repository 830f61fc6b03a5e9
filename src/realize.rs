use std::{collections::VecDeque, time::Instant};

use log::{debug, trace};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use snafu::{ensure, OptionExt};

use crate::{
    device::RawBuffer,
    error::{RealizeSnafu, Result, ScheduleSnafu},
    lazy::Graph,
    ops::{get_info, BufferId, LoadOp, Op, OpArg},
    schedule::ScheduleItem,
    symbolic::sym_infer,
};

impl Graph {
    /// Run items in order. Each output is realized once its item is done,
    /// and its op (and the ops of its views) is dropped.
    ///
    /// # Errors
    ///
    /// Backend errors, and `Realize` if an output ends up unrealized or with
    /// the wrong dtype or device.
    pub fn run_schedule(&mut self, schedule: Vec<ScheduleItem>) -> Result<()> {
        let mut queue: VecDeque<ScheduleItem> = schedule.into();
        while let Some(si) = queue.pop_front() {
            trace!("running {} -> {}", si.ast.op(), si.out);
            match si.ast.op() {
                Op::Load(l) => self.run_load(l, &si)?,
                _ => self.run_ast(&si)?,
            }

            let out = si.out;
            self.lb_mut(out).op = None;
            let views: Vec<BufferId> = self.lb(out).views.iter().copied().collect();
            for v in views {
                if let Some(lb) = self.buffers.get_mut(v.0).and_then(Option::as_deref_mut) {
                    lb.op = None;
                }
            }

            let realized = self.realized(out).context(RealizeSnafu {
                id: out.0,
                reason: "no realized buffer after running",
            })?;
            ensure!(
                realized.dtype() == self.dtype(out),
                RealizeSnafu {
                    id: out.0,
                    reason: format!("realized as {}, expected {}", realized.dtype(), self.dtype(out)),
                }
            );
            let device = &self.lb(out).device;
            ensure!(
                realized.device() == Some(device.as_str()),
                RealizeSnafu {
                    id: out.0,
                    reason: format!("realized on {}, expected {device}", realized.device().unwrap_or("no device")),
                }
            );
        }
        Ok(())
    }

    fn numel(&self, out: BufferId) -> Result<usize> {
        let mut n: i64 = 1;
        for s in self.shape(out) {
            n *= s.max();
        }
        usize::try_from(n).ok().context(RealizeSnafu {
            id: out.0,
            reason: format!("bad size {n}"),
        })
    }

    pub(crate) fn input_buffers(&self, si: &ScheduleItem) -> Result<Vec<RawBuffer>> {
        si.inputs
            .iter()
            .map(|b| {
                self.realized(*b).cloned().context(ScheduleSnafu {
                    reason: format!("input {b} of {} isn't realized", si.out),
                })
            })
            .collect()
    }

    fn run_load(&mut self, op: LoadOp, si: &ScheduleItem) -> Result<()> {
        let out = si.out;
        let device = self.lb(out).device.clone();
        let dtype = self.dtype(out);
        let raw = match (op, si.ast.arg()) {
            (LoadOp::Empty, _) => self.backend(&device)?.allocate(self.numel(out)?, dtype)?,
            (LoadOp::Rand, OpArg::Seed(seed)) => {
                let mut rng = StdRng::seed_from_u64(*seed);
                let dist = Uniform::new(0.0, 1.0);
                let values: Vec<f64> = (0..self.numel(out)?).map(|_| dist.sample(&mut rng)).collect();
                self.backend(&device)?.from_host(&dtype.encode(&values), dtype)?
            }
            (LoadOp::Const, OpArg::Const(c)) => self.backend(&device)?.from_host(&dtype.encode(&[c.0]), dtype)?,
            (LoadOp::Contiguous, _) => {
                let inputs = self.input_buffers(si)?;
                inputs.into_iter().next().context(ScheduleSnafu {
                    reason: "contiguous without a source",
                })?
            }
            (LoadOp::Custom, OpArg::Custom(custom)) => {
                let args: Vec<Vec<f64>> = self.input_buffers(si)?.iter().map(RawBuffer::read_f64).collect();
                let values = (custom.f)(&args);
                ensure!(
                    values.len() == self.numel(out)?,
                    RealizeSnafu {
                        id: out.0,
                        reason: format!("{} returned {} values", custom.name, values.len()),
                    }
                );
                self.backend(&device)?.from_host(&dtype.encode(&values), dtype)?
            }
            (LoadOp::From, _) => {
                let src = self.input_buffers(si)?.into_iter().next().context(ScheduleSnafu {
                    reason: "copy without a source",
                })?;
                let src_device = &self.lb(si.inputs[0]).device;
                let bytes = self.backend(src_device)?.to_host(&src)?;
                debug!("copy {} bytes {src_device} -> {device}", bytes.len());
                self.backend(&device)?.from_host(&bytes, dtype)?
            }
            (op, arg) => {
                return ScheduleSnafu {
                    reason: format!("bad arg {arg} for {op:?}"),
                }
                .fail()
            }
        };
        self.set_realized(out, raw);
        Ok(())
    }

    fn run_ast(&mut self, si: &ScheduleItem) -> Result<()> {
        let out = si.out;
        let device = self.lb(out).device.clone();
        let dtype = self.dtype(out);
        let inputs = self.input_buffers(si)?;
        let output = self.backend(&device)?.allocate(self.numel(out)?, dtype)?;

        let start = Instant::now();
        let et = self
            .backend_mut(&device)?
            .exec_ast(&si.ast, &output, &inputs, &si.var_vals)?;
        let info = get_info(&si.ast);
        let name = format!(
            "{} {}",
            si.ast.op(),
            info.shape
                .iter()
                .map(|s| sym_infer(s, &si.var_vals).map_or_else(|| s.render(), |v| v.to_string()))
                .collect::<Vec<_>>()
                .join("_")
        );
        self.stats.record(&name, &info, &si.var_vals, Some(et.unwrap_or_else(|| start.elapsed())));
        self.set_realized(out, output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::RewriteConfig,
        device::{Backend, DeviceKind},
        dtype::DType,
        error::Error,
        interpreter::Interpreter,
        ops::{BinaryOp, CustomFn, LazyOp},
        symbolic::{to_nodes, VarVals},
    };

    /// Runs on the interpreter but hands out outputs labelled as `CPU` memory.
    struct Mislabeled(Interpreter);

    impl Backend for Mislabeled {
        fn name(&self) -> &str {
            "ODD"
        }

        fn kind(&self) -> DeviceKind {
            DeviceKind::Interpreted
        }

        fn allocate(&self, size: usize, dtype: DType) -> Result<RawBuffer> {
            Ok(RawBuffer::new(size, dtype).with_device("CPU"))
        }

        fn exec_ast(
            &mut self,
            ast: &LazyOp,
            output: &RawBuffer,
            inputs: &[RawBuffer],
            var_vals: &VarVals,
        ) -> Result<Option<Duration>> {
            self.0.exec_ast(ast, output, inputs, var_vals)
        }
    }

    #[test]
    fn test_realized_buffers_carry_device() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = g.from_host("VM", &[2], &[1.0f32, 2.0]).unwrap();
        let y = g.binary(BinaryOp::Mul, x, x).unwrap();
        g.realize(y).unwrap();
        assert_eq!(g.realized(x).unwrap().device(), Some("VM"));
        assert_eq!(g.realized(y).unwrap().device(), Some("VM"));
    }

    #[test]
    fn test_output_on_wrong_device_is_rejected() {
        let mut g = Graph::with_backends(
            RewriteConfig::default(),
            vec![Box::new(Interpreter::new("CPU")), Box::new(Mislabeled(Interpreter::new("ODD")))],
        );
        let x = g.from_host("ODD", &[3], &[1.0f32, 2.0, 3.0]).unwrap();
        let y = g.binary(BinaryOp::Add, x, x).unwrap();
        match g.realize(y).unwrap_err() {
            Error::Realize { id, reason } => {
                assert_eq!(id, y.index());
                assert!(reason.contains("realized on CPU, expected ODD"), "{reason}");
            }
            e => panic!("unexpected error {e}"),
        }
    }

    #[test]
    fn test_realize_drops_op() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = g.from_host("CPU", &[3], &[1.0f32, 2.0, 3.0]).unwrap();
        let y = g.binary(BinaryOp::Add, x, x).unwrap();
        g.realize(y).unwrap();
        assert!(g.is_realized(y));
        assert!(g.get(y).unwrap().op().is_none());
        assert_eq!(g.to_host(y).unwrap(), vec![2.0, 4.0, 6.0]);
        assert_eq!(g.stats().kernel_count, 1);
    }

    #[test]
    fn test_rand_is_seeded() {
        let mut g = Graph::new(RewriteConfig::default());
        let a = g.rand("CPU", &[16], DType::Float32, 7).unwrap();
        let b = g.rand("CPU", &[16], DType::Float32, 7).unwrap();
        let a = g.to_host(a).unwrap();
        assert_eq!(a, g.to_host(b).unwrap());
        assert!(a.iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_contiguous_aliases_source() {
        let mut g = Graph::new(RewriteConfig::default());
        let x = g.from_host("CPU", &[2], &[1.0f32, 2.0]).unwrap();
        let c = g.contiguous(x).unwrap();
        g.realize(c).unwrap();
        assert!(g.realized(c).unwrap().ptr_eq(g.realized(x).unwrap()));
    }

    #[test]
    fn test_custom_and_copy() {
        fn double(args: &[Vec<f64>]) -> Vec<f64> {
            args[0].iter().map(|v| v * 2.0).collect()
        }
        let mut g = Graph::new(RewriteConfig::default());
        let x = g.from_host("CPU", &[3], &[1.0f32, 2.0, 3.0]).unwrap();
        let c = g
            .loadop(
                LoadOp::Custom,
                &to_nodes(&[3]),
                DType::Float32,
                "CPU",
                OpArg::Custom(CustomFn { name: "double", f: double }),
                Some(x),
                VarVals::new(),
            )
            .unwrap();
        let moved = g.copy_to_device(c, "VM").unwrap();
        assert_eq!(g.to_host(moved).unwrap(), vec![2.0, 4.0, 6.0]);
        assert_eq!(g.get(moved).unwrap().device(), "VM");
    }

    #[test]
    fn test_empty_is_zeroed() {
        let mut g = Graph::new(RewriteConfig::default());
        let e = g.empty("VM", &[2, 2], DType::Int32).unwrap();
        assert_eq!(g.to_host(e).unwrap(), vec![0.0; 4]);
    }
}
