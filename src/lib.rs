#![warn(clippy::pedantic)]

mod compiled;
mod config;
mod device;
mod display;
mod dtype;
mod error;
mod image;
mod interpreter;
mod jit;
mod kernel;
mod lazy;
mod linearizer;
mod math_macros;
mod ops;
mod realize;
mod schedule;
mod shape_tracker;
mod symbolic;
mod view;

pub use compiled::{CStyleRenderer, Compiled, CompiledAstRunner, Program, ProgramSource, Renderer, Runtime, UOpRuntime};
pub use config::{ReduceSplit, RewriteConfig};
pub use device::{Backend, DeviceKind, RawBuffer, Stats};
pub use display::{ScheduleListing, UOpListing};
pub use dtype::{DType, Elem};
pub use error::{Error, Result};
pub use image::{to_image_idx, ImageConfig};
pub use interpreter::Interpreter;
pub use jit::{get_input_replace, get_jc_idxs_with_updatable_var_vals, get_jit_stats, Jit, JitItem};
pub use kernel::{Kernel, KernelBuffer, LinearizerOptions};
pub use lazy::{Graph, LazyBuffer};
pub use linearizer::{get_grouped_dims, Linearizer, LoopVar, NameCounter, UOp, UOpArg, UOpKind};
pub use ops::{
    const_op, get_info, mem_op, vars_from_ast, BinaryOp, BufferId, BufferOp, ConstBuffer, ConstValue, CustomFn,
    LazyOp, LazySrc, LoadOp, MemBuffer, MovementOp, Op, OpArg, OpInfo, OpType, ReduceOp, TernaryOp, UnaryOp,
};
pub use schedule::ScheduleItem;
pub use shape_tracker::{get_contraction, ShapeTracker};
pub use symbolic::{
    all_int, as_ints, floordiv, gcd, iter_idxs, pymod, render_shape, sym_infer, sym_prod, to_nodes, Node, NodeKind,
    NodeRenderer, PlainRenderer, VarVals, Variable,
};
pub use view::{strides_for_shape, View};

// TODO:
// - Tensor core (WMMA) lowering. The UOp kind exists but the kernel never asks for it.
// - Alias local buffers for early loads instead of always going through global memory.
// - Split launch dims larger than `global_max`/`local_max`. Today only the number of dims is capped.
