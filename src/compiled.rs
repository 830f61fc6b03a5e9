use std::{
    collections::HashMap,
    fmt::Write,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace};
use smallvec::{smallvec, SmallVec};
use snafu::OptionExt;

use crate::{
    device::{Backend, DeviceKind, RawBuffer},
    dtype::DType,
    error::{BackendSnafu, Error, Result},
    image::ImageConfig,
    interpreter::exec_alu,
    kernel::{Kernel, LinearizerOptions},
    linearizer::{Linearizer, NameCounter, UOp, UOpArg, UOpKind},
    ops::{vars_from_ast, BinaryOp, LazyOp, Op, TernaryOp, UnaryOp},
    symbolic::{iter_idxs, sym_infer, Node, VarVals, Variable},
};

/// A rendered kernel. `uops` travel along for runtimes that execute them
/// directly instead of compiling `code`.
#[derive(Clone, Debug)]
pub struct ProgramSource {
    pub name: String,
    pub code: String,
    pub uops: Vec<UOp>,
}

pub trait Renderer {
    fn render(&self, name: &str, uops: &[UOp]) -> ProgramSource;
}

pub trait Runtime {
    /// # Errors
    ///
    /// `Backend` if the program can't be built.
    fn load(&self, src: &ProgramSource) -> Result<Box<dyn Program>>;
}

pub trait Program {
    /// Run over `bufs`, indexed by buffer slot. `global` and `local` are the
    /// launch sizes, innermost dimension first, or `None` for a single
    /// invocation.
    ///
    /// # Errors
    ///
    /// `Backend` on anything the program can't execute.
    fn run(
        &self,
        bufs: &[RawBuffer],
        global: Option<&[i64]>,
        local: Option<&[i64]>,
        var_vals: &VarVals,
    ) -> Result<Option<Duration>>;
}

fn backend_err(device: &str, reason: impl Into<String>) -> Error {
    BackendSnafu {
        device: device.to_string(),
        reason: reason.into(),
    }
    .build()
}

/// A loaded program with its launch configuration.
pub struct CompiledAstRunner {
    pub name: String,
    pub src: String,
    pub global_size: Option<Vec<Node>>,
    pub local_size: Option<Vec<Node>>,
    pub vars: Vec<Variable>,
    pub op_estimate: Node,
    pub mem_estimate: Node,
    prg: Box<dyn Program>,
}

impl CompiledAstRunner {
    fn launch_dims(&self, device: &str, var_vals: &VarVals) -> Result<(Option<Vec<i64>>, Option<Vec<i64>>)> {
        let infer = |dims: &Option<Vec<Node>>| -> Result<Option<Vec<i64>>> {
            dims.as_ref()
                .map(|dims| {
                    dims.iter()
                        .map(|d| {
                            sym_infer(d, var_vals).context(BackendSnafu {
                                device: device.to_string(),
                                reason: format!("unbound variable in launch size {d}"),
                            })
                        })
                        .collect()
                })
                .transpose()
        };
        Ok((infer(&self.global_size)?, infer(&self.local_size)?))
    }

    /// # Errors
    ///
    /// `Backend` if a launch dimension can't be resolved or the program fails.
    pub fn exec(&self, device: &str, bufs: &[RawBuffer], var_vals: &VarVals) -> Result<Option<Duration>> {
        let (global, local) = self.launch_dims(device, var_vals)?;
        debug!(
            "{device} launch {:<24} global {:?} local {:?} ops {} mem {}",
            self.name,
            global,
            local,
            sym_infer(&self.op_estimate, var_vals).unwrap_or(0),
            sym_infer(&self.mem_estimate, var_vals).unwrap_or(0)
        );
        self.prg.run(bufs, global.as_deref(), local.as_deref(), var_vals)
    }
}

/// A device that lowers each AST to UOps and runs the loaded program.
pub struct Compiled {
    name: String,
    opts: LinearizerOptions,
    image: ImageConfig,
    hand_optimize: bool,
    renderer: Box<dyn Renderer>,
    runtime: Box<dyn Runtime>,
    names: NameCounter,
    method_cache: HashMap<String, CompiledAstRunner>,
}

impl Compiled {
    pub fn new(name: &str, opts: LinearizerOptions, renderer: Box<dyn Renderer>, runtime: Box<dyn Runtime>) -> Compiled {
        Compiled {
            name: name.to_string(),
            opts,
            image: ImageConfig::default(),
            hand_optimize: true,
            renderer,
            runtime,
            names: NameCounter::default(),
            method_cache: HashMap::new(),
        }
    }

    /// C-style source plus the UOp virtual machine.
    pub fn vm(name: &str) -> Compiled {
        Compiled::new(
            name,
            LinearizerOptions::default(),
            Box::new(CStyleRenderer::default()),
            Box::new(UOpRuntime { device: name.to_string() }),
        )
    }

    #[must_use]
    pub fn with_options(mut self, opts: LinearizerOptions) -> Compiled {
        self.opts = opts;
        self
    }

    #[must_use]
    pub fn with_hand_optimize(mut self, hand_optimize: bool) -> Compiled {
        self.hand_optimize = hand_optimize;
        self
    }

    #[must_use]
    pub fn with_image_config(mut self, image: ImageConfig) -> Compiled {
        self.image = image;
        self
    }

    /// Number of distinct programs built so far.
    pub fn cache_len(&self) -> usize {
        self.method_cache.len()
    }

    fn cache_key(ast: &LazyOp) -> String {
        let vars: Vec<String> = vars_from_ast(ast).iter().map(ToString::to_string).collect();
        format!("{}|{}", ast.key(), vars.join(","))
    }

    /// Shape, lower and load `ast`.
    ///
    /// # Errors
    ///
    /// Kernel construction or program loading failures.
    pub fn to_program(&mut self, ast: &LazyOp) -> Result<CompiledAstRunner> {
        let mut k = Kernel::new(Arc::new(ast.clone()), self.opts.clone())?;
        if self.hand_optimize {
            k.hand_coded_optimizations();
        } else {
            k.required_optimizations(false);
        }
        trace!("{} kernel shape {}", self.name, k.colored_shape());
        let op_estimate = k.info().flops.clone();
        let mem_estimate = k.info().mem_estimate();
        let mut lin = Linearizer::new(k);
        lin.image = self.image;
        lin.linearize(&mut self.names);
        let src = self.renderer.render(&lin.name, &lin.uops);
        trace!("{}", src.code);
        let prg = self.runtime.load(&src)?;
        Ok(CompiledAstRunner {
            name: src.name,
            src: src.code,
            global_size: lin.global_size,
            local_size: lin.local_size,
            vars: vars_from_ast(ast),
            mem_estimate,
            op_estimate,
            prg,
        })
    }
}

impl Backend for Compiled {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Compiled
    }

    fn exec_ast(
        &mut self,
        ast: &LazyOp,
        output: &RawBuffer,
        inputs: &[RawBuffer],
        var_vals: &VarVals,
    ) -> Result<Option<Duration>> {
        let key = Compiled::cache_key(ast);
        if !self.method_cache.contains_key(&key) {
            let runner = self.to_program(ast)?;
            self.method_cache.insert(key.clone(), runner);
        } else {
            trace!("{} method cache hit", self.name);
        }
        let runner = self
            .method_cache
            .get(&key)
            .context(BackendSnafu {
                device: self.name.clone(),
                reason: "method cache lost a program",
            })?;
        let mut bufs = Vec::with_capacity(inputs.len() + 1);
        bufs.push(output.clone());
        bufs.extend_from_slice(inputs);
        runner.exec(&self.name, &bufs, var_vals)
    }
}

/// Renders UOps as a C-like kernel.
#[derive(Clone, Debug)]
pub struct CStyleRenderer {
    pub kernel_prefix: String,
    pub buffer_prefix: String,
    pub smem_prefix: String,
    pub barrier: String,
    pub gid: Vec<String>,
    pub lid: Vec<String>,
}

impl Default for CStyleRenderer {
    fn default() -> Self {
        CStyleRenderer {
            kernel_prefix: "__kernel ".to_string(),
            buffer_prefix: "__global ".to_string(),
            smem_prefix: "__local ".to_string(),
            barrier: "barrier(CLK_LOCAL_MEM_FENCE);".to_string(),
            gid: (0..3).map(|i| format!("get_group_id({i})")).collect(),
            lid: (0..3).map(|i| format!("get_local_id({i})")).collect(),
        }
    }
}

fn code_for_op(op: Op, a: &[String]) -> String {
    match (op, a) {
        (Op::Unary(UnaryOp::Neg), [x]) => format!("(-{x})"),
        (Op::Unary(UnaryOp::Exp2), [x]) => format!("exp2({x})"),
        (Op::Unary(UnaryOp::Log2), [x]) => format!("log2({x})"),
        (Op::Unary(UnaryOp::Sin), [x]) => format!("sin({x})"),
        (Op::Unary(UnaryOp::Sqrt), [x]) => format!("sqrt({x})"),
        (Op::Unary(UnaryOp::Recip), [x]) => format!("(1.0f/{x})"),
        (Op::Unary(UnaryOp::Noop | UnaryOp::Cast), [x]) => x.clone(),
        (Op::Binary(BinaryOp::Add), [x, y]) => format!("({x}+{y})"),
        (Op::Binary(BinaryOp::Sub), [x, y]) => format!("({x}-{y})"),
        (Op::Binary(BinaryOp::Mul), [x, y]) => format!("({x}*{y})"),
        (Op::Binary(BinaryOp::Div), [x, y]) => format!("({x}/{y})"),
        (Op::Binary(BinaryOp::Max), [x, y]) => format!("max({x},{y})"),
        (Op::Binary(BinaryOp::Mod), [x, y]) => format!("({x}%{y})"),
        (Op::Binary(BinaryOp::CmpLt), [x, y]) => format!("({x}<{y})"),
        (Op::Ternary(TernaryOp::MulAcc), [x, y, z]) => format!("(({x}*{y})+{z})"),
        (Op::Ternary(TernaryOp::Where), [x, y, z]) => format!("({x}!=0?{y}:{z})"),
        (op, a) => panic!("no code for {op} with {} operands", a.len()),
    }
}

fn strip_parens(s: &str) -> &str {
    let inner = s.strip_prefix('(').and_then(|s| s.strip_suffix(')'));
    match inner {
        Some(inner) if inner.chars().scan(0i32, |depth, c| {
            *depth += match c {
                '(' => 1,
                ')' => -1,
                _ => 0,
            };
            Some(*depth)
        }).all(|d| d >= 0) => inner,
        _ => s,
    }
}

impl CStyleRenderer {
    fn render_const(x: f64, dtype: DType) -> String {
        let val = if x.is_nan() {
            "NAN".to_string()
        } else if x.is_infinite() {
            format!("{}INFINITY", if x < 0.0 { "-" } else { "" })
        } else if dtype.is_float() {
            format!("{x:?}f")
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let x = x as i64;
            x.to_string()
        };
        if dtype.sz() > 1 {
            Self::render_cast(&vec![val; dtype.sz()], dtype)
        } else {
            val
        }
    }

    fn render_cast(x: &[String], dtype: DType) -> String {
        if let [x] = x {
            format!("({})({x})", dtype.name())
        } else {
            format!("({})({})", dtype.name(), x.join(","))
        }
    }

    fn render_kernel(&self, name: &str, kernel: &[String], bufs: &[(String, String)]) -> String {
        let args: Vec<String> = bufs.iter().map(|(n, t)| format!("{t} {n}")).collect();
        format!("{}void {name}({}) {{\n{}\n}}", self.kernel_prefix, args.join(", "), kernel.join("\n"))
    }
}

impl Renderer for CStyleRenderer {
    fn render(&self, name: &str, uops: &[UOp]) -> ProgramSource {
        let mut kernel: Vec<String> = vec![];
        let mut bufs: Vec<(String, String)> = vec![];
        let mut depth = 1;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut r: Vec<String> = vec![String::new(); uops.len()];
        let mut child_count = vec![0usize; uops.len()];
        for u in uops {
            for &v in &u.vin {
                child_count[v] += 1;
            }
        }
        let mut ssa = |prefix: &'static str| {
            let c = counts.entry(prefix).or_insert(0);
            *c += 1;
            format!("{prefix}{}", *c - 1)
        };
        let kk = |kernel: &mut Vec<String>, depth: usize, s: String| kernel.push(format!("{}{s}", "  ".repeat(depth)));
        let is_local = |i: usize| uops[i].kind == UOpKind::DefineLocal;
        let type_name = |u: &UOp| u.dtype.map_or("float", DType::name);

        for u in uops {
            let n = u.num;
            match (u.kind, &u.arg) {
                (UOpKind::Loop, _) => {
                    r[n] = ssa("ridx");
                    let s = format!("for (int {0} = {1}; {0} < {2}; ++{0}) {{", r[n], r[u.vin[0]], r[u.vin[1]]);
                    kk(&mut kernel, depth, s);
                    depth += 1;
                }
                (UOpKind::End, _) => {
                    depth -= 1;
                    kk(&mut kernel, depth, "}".to_string());
                }
                (UOpKind::Barrier, _) => kk(&mut kernel, depth, self.barrier.clone()),
                (UOpKind::Alu, UOpArg::Alu(op)) => {
                    let mut args: Vec<String> = u.vin.iter().map(|&v| r[v].clone()).collect();
                    let first = &uops[u.vin[0]];
                    if first.kind == UOpKind::Alu
                        && first.arg == u.arg
                        && matches!(op, Op::Binary(BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul))
                    {
                        args[0] = strip_parens(&args[0]).to_string();
                    }
                    let val = code_for_op(*op, &args);
                    if child_count[n] <= 1 || u.dtype.is_some_and(DType::is_int) {
                        r[n] = val;
                    } else {
                        r[n] = ssa("alu");
                        kk(&mut kernel, depth, format!("{} {} = {val};", type_name(u), r[n]));
                    }
                }
                (UOpKind::DefineAcc, UOpArg::Value(v)) => {
                    r[n] = ssa("acc");
                    let dtype = u.dtype.unwrap_or(DType::Float32);
                    let s = format!("{} {} = {};", type_name(u), r[n], Self::render_const(v.0, dtype));
                    kk(&mut kernel, depth, s);
                }
                (UOpKind::Special, UOpArg::Special { dim, name, size }) => {
                    let xid = if name.starts_with('g') { &self.gid } else { &self.lid };
                    kk(&mut kernel, depth, format!("int {name} = {}; /* {size} */", xid[*dim]));
                    r[n] = name.clone();
                }
                (UOpKind::Const, UOpArg::Value(v)) => {
                    let c = Self::render_const(v.0, u.dtype.unwrap_or(DType::Float32));
                    r[n] = if v.0 < 0.0 { format!("({c})") } else { c };
                }
                (UOpKind::Load, _) => {
                    let buf = &uops[u.vin[0]];
                    let dtype = u.dtype.unwrap_or(DType::Float32);
                    let buf_dtype = buf.dtype.unwrap_or(DType::Float32);
                    let idx = strip_parens(&r[u.vin[1]]).to_string();
                    let mut val = if buf_dtype.is_image() {
                        format!("read_imagef({}, smp, {idx})", r[u.vin[0]])
                    } else if dtype.sz() > 1 {
                        let prefix = if is_local(u.vin[0]) { &self.smem_prefix } else { &self.buffer_prefix };
                        format!("*(({prefix}{}*)({}+{idx}))", dtype.name(), r[u.vin[0]])
                    } else {
                        format!("{}[{idx}]", r[u.vin[0]])
                    };
                    if u.vin.len() >= 4 {
                        val = format!("({})?({val}):{}", r[u.vin[2]], r[u.vin[3]]);
                    }
                    r[n] = ssa("val");
                    kk(&mut kernel, depth, format!("{} {} = {val};", dtype.name(), r[n]));
                }
                (UOpKind::Store, _) if u.vin.len() == 2 => {
                    kk(&mut kernel, depth, format!("{} = {};", r[u.vin[0]], r[u.vin[1]]));
                }
                (UOpKind::Store, _) => {
                    let buf = &uops[u.vin[0]];
                    let var = &uops[u.vin[2]];
                    let (b, idx, v) = (&r[u.vin[0]], strip_parens(&r[u.vin[1]]), &r[u.vin[2]]);
                    let var_dtype = var.dtype.unwrap_or(DType::Float32);
                    let s = if buf.dtype.is_some_and(DType::is_image) {
                        format!("write_imagef({b}, {idx}, {v});")
                    } else if var_dtype.sz() > 1 {
                        let prefix = if is_local(u.vin[0]) { &self.smem_prefix } else { &self.buffer_prefix };
                        format!("*(({prefix}{}*)({b}+{idx})) = {v};", var_dtype.name())
                    } else {
                        format!("{b}[{idx}] = {v};")
                    };
                    kk(&mut kernel, depth, s);
                }
                (UOpKind::Cast, UOpArg::Cast { bitcast }) => {
                    let dtype = u.dtype.unwrap_or(DType::Float32);
                    let args: Vec<String> = u.vin.iter().map(|&v| r[v].clone()).collect();
                    let val = if *bitcast {
                        format!("as_{}({})", dtype.name(), args[0])
                    } else {
                        Self::render_cast(&args, dtype)
                    };
                    if child_count[n] <= 1 {
                        r[n] = val;
                    } else {
                        r[n] = ssa("cast");
                        kk(&mut kernel, depth, format!("{} {} = {val};", dtype.name(), r[n]));
                    }
                }
                (UOpKind::DefineLocal, UOpArg::Local { name, size }) => {
                    let dtype = type_name(u);
                    kk(&mut kernel, depth, format!("{}{dtype} {name}[{size}];", self.smem_prefix));
                    r[n] = name.clone();
                }
                (UOpKind::DefineGlobal, UOpArg::Global { idx, dtype }) => {
                    r[n] = format!("data{idx}");
                    let t = if dtype.is_image() {
                        format!("{} image2d_t", if *idx > 0 { "read_only" } else { "write_only" })
                    } else {
                        format!("{}{}{}*", if *idx > 0 { "const " } else { "" }, self.buffer_prefix, dtype.name())
                    };
                    bufs.push((r[n].clone(), t));
                }
                (UOpKind::DefineGlobal, UOpArg::Var(v)) => {
                    r[n] = v.name().to_string();
                    bufs.push((r[n].clone(), "const int".to_string()));
                }
                (UOpKind::Gep, UOpArg::Lane(l)) => {
                    r[n] = format!("({}).{}", r[u.vin[0]], &"xyzw"[*l..=*l]);
                }
                (kind, arg) => panic!("can't render {kind} {arg}"),
            }
        }

        let mut code = String::new();
        if bufs.iter().any(|(_, t)| t.ends_with("image2d_t")) {
            let _ = writeln!(code, "const sampler_t smp = CLK_NORMALIZED_COORDS_FALSE | CLK_ADDRESS_CLAMP | CLK_FILTER_NEAREST;");
        }
        code.push_str(&self.render_kernel(name, &kernel, &bufs));
        ProgramSource {
            name: name.to_string(),
            code,
            uops: uops.to_vec(),
        }
    }
}

/// Runs linearized UOps directly, one workgroup at a time.
#[derive(Clone, Debug)]
pub struct UOpRuntime {
    pub device: String,
}

impl Runtime for UOpRuntime {
    fn load(&self, src: &ProgramSource) -> Result<Box<dyn Program>> {
        Ok(Box::new(VmProgram::new(&self.device, src)?))
    }
}

type Reg = SmallVec<[f64; 4]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mem {
    Global(usize),
    Local(usize),
}

struct VmProgram {
    device: String,
    name: String,
    uops: Vec<UOp>,
    /// For each LOOP, the position of its END, and the reverse.
    jumps: HashMap<usize, usize>,
    /// Program ranges executed between barriers.
    phases: Vec<(usize, usize)>,
    mems: HashMap<usize, Mem>,
    local_sizes: Vec<usize>,
}

impl VmProgram {
    fn new(device: &str, src: &ProgramSource) -> Result<VmProgram> {
        let err = |reason: String| backend_err(device, reason);
        let uops = src.uops.clone();
        let mut jumps = HashMap::new();
        let mut depth = 0usize;
        let mut phases = vec![];
        let mut phase_start = 0;
        let mut mems = HashMap::new();
        let mut local_sizes = vec![];
        for u in &uops {
            match (u.kind, &u.arg) {
                (UOpKind::Loop, _) => depth += 1,
                (UOpKind::End, _) => {
                    depth = depth.checked_sub(1).context(BackendSnafu {
                        device: device.to_string(),
                        reason: format!("unmatched END at {}", u.num),
                    })?;
                    jumps.insert(u.vin[0], u.num);
                    jumps.insert(u.num, u.vin[0]);
                }
                (UOpKind::Barrier, _) if depth > 0 => return Err(err(format!("barrier inside a loop at {}", u.num))),
                (UOpKind::Barrier, _) => {
                    phases.push((phase_start, u.num + 1));
                    phase_start = u.num + 1;
                }
                (UOpKind::Wmma, _) => return Err(err("WMMA isn't supported".to_string())),
                (UOpKind::DefineGlobal, UOpArg::Global { idx, .. }) => {
                    mems.insert(u.num, Mem::Global(*idx));
                }
                (UOpKind::DefineLocal, UOpArg::Local { size, .. }) => {
                    mems.insert(u.num, Mem::Local(local_sizes.len()));
                    local_sizes.push(usize::try_from(*size).unwrap_or(0));
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(err(format!("{depth} unclosed loops")));
        }
        phases.push((phase_start, uops.len()));
        Ok(VmProgram {
            device: device.to_string(),
            name: src.name.clone(),
            uops,
            jumps,
            phases,
            mems,
            local_sizes,
        })
    }

    fn err(&self, reason: impl Into<String>) -> Error {
        backend_err(&self.device, format!("{}: {}", self.name, reason.into()))
    }

    fn read(&self, regs: &[Reg], i: usize) -> Reg {
        let u = &self.uops[i];
        match (u.kind, &u.arg) {
            (UOpKind::Gep, UOpArg::Lane(l)) => {
                let src = self.read(regs, u.vin[0]);
                smallvec![src.get(*l).copied().unwrap_or(0.0)]
            }
            _ => regs[i].clone(),
        }
    }

    fn write(&self, regs: &mut [Reg], i: usize, v: Reg) {
        let u = &self.uops[i];
        match (u.kind, &u.arg) {
            (UOpKind::Gep, UOpArg::Lane(l)) => {
                let lane = v.first().copied().unwrap_or(0.0);
                if let Some(x) = regs[u.vin[0]].get_mut(*l) {
                    *x = lane;
                }
            }
            _ => regs[i] = v,
        }
    }

    /// Element offset of `idx`, or `None` for a texel outside its image.
    #[allow(clippy::cast_possible_truncation)]
    fn address(buf: &UOp, idx: &Reg) -> Option<i64> {
        match buf.dtype {
            Some(DType::Image { height, width, .. }) => {
                let (x, y) = (idx[0] as i64, idx.get(1).copied().unwrap_or(0.0) as i64);
                if x < 0 || x >= width || y < 0 || y >= height {
                    return None;
                }
                Some((y * width + x) * 4)
            }
            _ => Some(idx[0] as i64),
        }
    }

    fn memory<'a>(
        &self,
        i: usize,
        globals: &'a mut [Vec<f64>],
        locals: &'a mut [Vec<f64>],
    ) -> Result<&'a mut Vec<f64>> {
        match self.mems.get(&i) {
            Some(Mem::Global(idx)) => globals
                .get_mut(*idx)
                .context(BackendSnafu {
                    device: self.device.clone(),
                    reason: format!("no buffer for data{idx}"),
                }),
            Some(Mem::Local(idx)) => Ok(&mut locals[*idx]),
            None => Err(self.err(format!("uop {i} isn't a buffer"))),
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::too_many_arguments)]
    fn step(
        &self,
        pc: usize,
        regs: &mut [Reg],
        ids: (&[i64], &[i64]),
        globals: &mut [Vec<f64>],
        locals: &mut [Vec<f64>],
        var_vals: &VarVals,
    ) -> Result<usize> {
        let u = &self.uops[pc];
        let lanes = u.dtype.map_or(1, DType::sz);
        match (u.kind, &u.arg) {
            (UOpKind::Loop, _) => {
                let (start, end) = (self.read(regs, u.vin[0])[0], self.read(regs, u.vin[1])[0]);
                regs[pc] = smallvec![start];
                if start >= end {
                    return Ok(self.jumps[&pc] + 1);
                }
            }
            (UOpKind::End, _) => {
                let lp = u.vin[0];
                let end = self.read(regs, self.uops[lp].vin[1])[0];
                regs[lp][0] += 1.0;
                if regs[lp][0] < end {
                    return Ok(lp + 1);
                }
            }
            (UOpKind::Special, UOpArg::Special { dim, name, .. }) => {
                let src = if name.starts_with('g') { ids.0 } else { ids.1 };
                regs[pc] = smallvec![src.get(*dim).copied().unwrap_or(0) as f64];
            }
            (UOpKind::DefineGlobal, UOpArg::Var(v)) => {
                let val = var_vals.get(v).context(BackendSnafu {
                    device: self.device.clone(),
                    reason: format!("no value for {v}"),
                })?;
                regs[pc] = smallvec![*val as f64];
            }
            (UOpKind::DefineGlobal | UOpKind::DefineLocal | UOpKind::Barrier | UOpKind::Gep, _) => {}
            (UOpKind::DefineAcc | UOpKind::Const, UOpArg::Value(v)) => {
                let dtype = u.dtype.unwrap_or(DType::Float32);
                regs[pc] = smallvec![dtype.cast_value(v.0); lanes];
            }
            (UOpKind::Load, _) => {
                let idx = self.read(regs, u.vin[1]);
                let gated = u.vin.len() >= 4 && self.read(regs, u.vin[2])[0] == 0.0;
                regs[pc] = if gated {
                    let alt = self.read(regs, u.vin[3]);
                    (0..lanes).map(|l| alt.get(l).copied().unwrap_or(alt[0])).collect()
                } else {
                    let addr = VmProgram::address(&self.uops[u.vin[0]], &idx);
                    let mem = self.memory(u.vin[0], globals, locals)?;
                    match addr {
                        None => smallvec![0.0; lanes],
                        Some(a) => {
                            let a = usize::try_from(a).map_err(|_| self.err(format!("negative load address {a}")))?;
                            let vals = mem.get(a..a + lanes).context(BackendSnafu {
                                device: self.device.clone(),
                                reason: format!("{}: load out of bounds at {a}", self.name),
                            })?;
                            SmallVec::from_slice(vals)
                        }
                    }
                };
            }
            (UOpKind::Store, _) if u.vin.len() == 2 => {
                let v = self.read(regs, u.vin[1]);
                self.write(regs, u.vin[0], v);
            }
            (UOpKind::Store, _) => {
                let idx = self.read(regs, u.vin[1]);
                let val = self.read(regs, u.vin[2]);
                let buf = &self.uops[u.vin[0]];
                let dtype = buf.dtype.unwrap_or(DType::Float32);
                let addr = VmProgram::address(buf, &idx);
                let mem = self.memory(u.vin[0], globals, locals)?;
                if let Some(a) = addr {
                    let a = usize::try_from(a).map_err(|_| self.err(format!("negative store address {a}")))?;
                    let slot = mem.get_mut(a..a + val.len()).context(BackendSnafu {
                        device: self.device.clone(),
                        reason: format!("{}: store out of bounds at {a}", self.name),
                    })?;
                    for (m, v) in slot.iter_mut().zip(&val) {
                        *m = dtype.cast_value(*v);
                    }
                }
            }
            (UOpKind::Cast, UOpArg::Cast { bitcast }) => {
                let dtype = u.dtype.unwrap_or(DType::Float32);
                regs[pc] = if u.vin.len() > 1 {
                    u.vin.iter().map(|&v| self.read(regs, v)[0]).collect()
                } else {
                    let x = self.read(regs, u.vin[0]);
                    let from = self.uops[u.vin[0]].dtype.unwrap_or(DType::Float32);
                    x.iter().map(|&v| if *bitcast { bitcast_value(v, from, dtype) } else { dtype.cast_value(v) }).collect()
                };
            }
            (UOpKind::Alu, UOpArg::Alu(op)) => {
                let args: Vec<Reg> = u.vin.iter().map(|&v| self.read(regs, v)).collect();
                let n = args.iter().map(SmallVec::len).max().unwrap_or(1);
                let dtype = u.dtype.unwrap_or(DType::Float32);
                let mut lane_args: SmallVec<[f64; 3]> = SmallVec::new();
                regs[pc] = (0..n)
                    .map(|l| {
                        lane_args.clear();
                        lane_args.extend(args.iter().map(|a| a.get(l).copied().unwrap_or(a[0])));
                        exec_alu(*op, dtype, &lane_args)
                    })
                    .collect();
            }
            (kind, arg) => return Err(self.err(format!("can't execute {kind} {arg}"))),
        }
        Ok(pc + 1)
    }

    fn run_phase(
        &self,
        (start, end): (usize, usize),
        regs: &mut [Reg],
        ids: (&[i64], &[i64]),
        globals: &mut [Vec<f64>],
        locals: &mut [Vec<f64>],
        var_vals: &VarVals,
    ) -> Result<()> {
        let mut pc = start;
        while pc < end {
            pc = self.step(pc, regs, ids, globals, locals, var_vals)?;
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn bitcast_value(v: f64, from: DType, to: DType) -> f64 {
    match (from.scalar(), to.scalar()) {
        (DType::Float32, DType::Int32) => f64::from((v as f32).to_bits() as i32),
        (DType::Int32, DType::Float32) => f64::from(f32::from_bits(v as i32 as u32)),
        _ => to.cast_value(v),
    }
}

fn launch_ranges(dims: Option<&[i64]>) -> Vec<(i64, i64)> {
    dims.map_or_else(|| vec![(0, 0)], |d| d.iter().map(|s| (0, s - 1)).collect())
}

impl Program for VmProgram {
    fn run(
        &self,
        bufs: &[RawBuffer],
        global: Option<&[i64]>,
        local: Option<&[i64]>,
        var_vals: &VarVals,
    ) -> Result<Option<Duration>> {
        let start = Instant::now();
        let mut globals: Vec<Vec<f64>> = bufs.iter().map(RawBuffer::read_f64).collect();
        let groups = iter_idxs(&launch_ranges(global));
        let threads = iter_idxs(&launch_ranges(local));
        for gid in &groups {
            let mut locals: Vec<Vec<f64>> = self.local_sizes.iter().map(|s| vec![0.0; *s]).collect();
            let mut regs: Vec<Vec<Reg>> = vec![vec![smallvec![0.0]; self.uops.len()]; threads.len()];
            for phase in &self.phases {
                for (lid, r) in threads.iter().zip(regs.iter_mut()) {
                    self.run_phase(*phase, r, (gid, lid), &mut globals, &mut locals, var_vals)?;
                }
            }
        }
        let stored: Vec<usize> = self
            .uops
            .iter()
            .filter(|u| u.kind == UOpKind::Store && u.vin.len() == 3)
            .filter_map(|u| match self.mems.get(&u.vin[0]) {
                Some(Mem::Global(idx)) => Some(*idx),
                _ => None,
            })
            .collect();
        for (i, (buf, vals)) in bufs.iter().zip(&globals).enumerate() {
            if stored.contains(&i) {
                buf.write_f64(vals);
            }
        }
        Ok(Some(start.elapsed()))
    }
}
