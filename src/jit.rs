use std::{collections::BTreeMap, sync::Arc};

use log::debug;
use snafu::{ensure, OptionExt};

use crate::{
    device::RawBuffer,
    error::{RealizeSnafu, Result, ScheduleSnafu},
    lazy::Graph,
    ops::{get_info, BufferId, LazyOp, Op, OpInfo},
    symbolic::{Node, VarVals},
};

/// One captured kernel launch. `rawbufs[0]` is the output, the rest are
/// the inputs in slot order.
#[derive(Clone, Debug)]
pub struct JitItem {
    pub device: String,
    pub ast: Arc<LazyOp>,
    pub info: OpInfo,
    pub rawbufs: Vec<RawBuffer>,
    pub var_vals: VarVals,
}

/// Total flops and memory of a captured run.
pub fn get_jit_stats(items: &[JitItem]) -> (Node, Node) {
    (
        Node::sum(items.iter().map(|ji| ji.info.flops.clone()).collect()),
        Node::sum(items.iter().map(|ji| ji.info.mem_estimate()).collect()),
    )
}

/// Map `(item, slot)` to the index of the input buffer found there.
///
/// # Errors
///
/// `Schedule` if an input isn't read by any captured kernel.
pub fn get_input_replace(items: &[JitItem], inputs: &[RawBuffer]) -> Result<BTreeMap<(usize, usize), usize>> {
    let mut replace = BTreeMap::new();
    for (j, ji) in items.iter().enumerate() {
        for (i, buf) in ji.rawbufs.iter().enumerate() {
            if let Some(k) = inputs.iter().position(|x| x.ptr_eq(buf)) {
                replace.insert((j, i), k);
            }
        }
    }
    let mut found: Vec<usize> = replace.values().copied().collect();
    found.sort_unstable();
    found.dedup();
    ensure!(
        found.len() == inputs.len(),
        ScheduleSnafu {
            reason: format!("only {} of {} jit inputs are read by a kernel", found.len(), inputs.len()),
        }
    );
    Ok(replace)
}

/// Items whose kernels take symbolic variables.
pub fn get_jc_idxs_with_updatable_var_vals(items: &[JitItem]) -> Vec<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, ji)| !ji.var_vals.is_empty())
        .map(|(j, _)| j)
        .collect()
}

/// A captured run of kernels, replayable on new input buffers.
///
/// Load items (empty, rand, copies, custom) run once during capture and
/// their results are reused. Intermediate and output buffers are shared
/// between replays.
#[derive(Debug)]
pub struct Jit {
    items: Vec<JitItem>,
    input_replace: BTreeMap<(usize, usize), usize>,
    inputs: Vec<RawBuffer>,
    output: RawBuffer,
}

impl Jit {
    pub fn items(&self) -> &[JitItem] {
        &self.items
    }

    pub fn output(&self) -> &RawBuffer {
        &self.output
    }

    /// Run the captured kernels with `inputs` in place of the captured
    /// ones. Variables in `var_vals` override the captured bindings, and
    /// compiled runners infer their launch dims from them.
    ///
    /// # Errors
    ///
    /// `Schedule` if `inputs` don't match the captured count, dtypes or
    /// sizes, and any backend error.
    pub fn replay(&self, g: &mut Graph, inputs: &[RawBuffer], var_vals: &VarVals) -> Result<RawBuffer> {
        ensure!(
            inputs.len() == self.inputs.len(),
            ScheduleSnafu {
                reason: format!("jit expects {} inputs, got {}", self.inputs.len(), inputs.len()),
            }
        );
        for (k, (new, old)) in inputs.iter().zip(&self.inputs).enumerate() {
            ensure!(
                new.dtype() == old.dtype() && new.size() == old.size(),
                ScheduleSnafu {
                    reason: format!(
                        "jit input {k} is {} x {}, captured as {} x {}",
                        new.size(),
                        new.dtype(),
                        old.size(),
                        old.dtype()
                    ),
                }
            );
        }

        for (j, ji) in self.items.iter().enumerate() {
            let mut bufs = ji.rawbufs.clone();
            for (&(_, i), &k) in self.input_replace.range((j, 0)..(j + 1, 0)) {
                bufs[i] = inputs[k].clone();
            }
            let vals: VarVals = ji
                .var_vals
                .iter()
                .map(|(v, x)| (v.clone(), *var_vals.get(v).unwrap_or(x)))
                .collect();
            let et = g.backend_mut(&ji.device)?.exec_ast(&ji.ast, &bufs[0], &bufs[1..], &vals)?;
            g.stats.record(&format!("jit {}", ji.ast.op()), &ji.info, &vals, et);
        }
        Ok(self.output.clone())
    }
}

impl Graph {
    /// Realize `root` and record every kernel it runs so the run can be
    /// replayed with different contents for `inputs`.
    ///
    /// # Errors
    ///
    /// `Schedule` if `inputs` repeat a buffer or one of them isn't read by
    /// any kernel, plus anything realizing `root` can fail with.
    pub fn jit_capture(&mut self, root: BufferId, inputs: &[BufferId]) -> Result<Jit> {
        let mut input_raw: Vec<RawBuffer> = Vec::with_capacity(inputs.len());
        for &x in inputs {
            self.realize(x)?;
            let raw = self.realized(x).cloned().context(RealizeSnafu {
                id: x.0,
                reason: "jit input has no buffer",
            })?;
            ensure!(
                !input_raw.iter().any(|r| r.ptr_eq(&raw)),
                ScheduleSnafu {
                    reason: format!("duplicate jit input {x}"),
                }
            );
            input_raw.push(raw);
        }

        let mut items = vec![];
        for si in self.schedule(root)? {
            let is_kernel = !matches!(si.ast.op(), Op::Load(_));
            let device = self.lb(si.out).device.clone();
            let srcs = if is_kernel { self.input_buffers(&si)? } else { vec![] };
            let out = si.out;
            let (ast, var_vals) = (Arc::clone(&si.ast), si.var_vals.clone());
            self.run_schedule(vec![si])?;
            if is_kernel {
                let mut rawbufs = Vec::with_capacity(srcs.len() + 1);
                rawbufs.extend(self.realized(out).cloned());
                rawbufs.extend(srcs);
                items.push(JitItem {
                    device,
                    info: get_info(&ast),
                    ast,
                    rawbufs,
                    var_vals,
                });
            }
        }
        let output = self.realized(root).cloned().context(RealizeSnafu {
            id: root.0,
            reason: "jit output has no buffer",
        })?;
        let input_replace = get_input_replace(&items, &input_raw)?;
        debug!("jit captured {} kernels, {} input slots", items.len(), input_replace.len());
        Ok(Jit {
            items,
            input_replace,
            inputs: input_raw,
            output,
        })
    }
}
