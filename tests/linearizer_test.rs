use std::sync::Arc;

use kernelken::{
    sym_prod, to_nodes, BinaryOp, CStyleRenderer, Compiled, Graph, Kernel, LazyOp, Linearizer, LinearizerOptions,
    NameCounter, ReduceOp, Renderer, RewriteConfig, UOpKind, UOpListing,
};

fn scheduled_ast(build: impl FnOnce(&mut Graph) -> kernelken::BufferId) -> Arc<LazyOp> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut g = Graph::new(RewriteConfig::default());
    let out = build(&mut g);
    let mut sched = g.schedule(out).unwrap();
    assert_eq!(sched.len(), 1);
    sched.remove(0).ast
}

fn add_1024(g: &mut Graph) -> kernelken::BufferId {
    let x = g.from_host("VM", &[1024], &vec![1.0f32; 1024]).unwrap();
    let y = g.from_host("VM", &[1024], &vec![2.0f32; 1024]).unwrap();
    g.binary(BinaryOp::Add, x, y).unwrap()
}

fn count(lin: &Linearizer, kind: UOpKind) -> usize {
    lin.uops.iter().filter(|u| u.kind == kind).count()
}

fn assert_well_formed(lin: &Linearizer) {
    for (i, u) in lin.uops.iter().enumerate() {
        assert_eq!(u.num, i);
        assert!(u.vin.iter().all(|v| *v < u.num), "{u:?} reads a later uop");
    }
    assert_eq!(count(lin, UOpKind::Loop), count(lin, UOpKind::End));
}

#[test]
fn test_elementwise_add_without_locals() {
    let ast = scheduled_ast(add_1024);
    let kernel = Kernel::new(ast, LinearizerOptions::loops_only()).unwrap();
    let mut lin = Linearizer::new(kernel);
    lin.linearize(&mut NameCounter::default());

    assert_well_formed(&lin);
    assert_eq!(count(&lin, UOpKind::Loop), 1);
    assert_eq!(count(&lin, UOpKind::Barrier), 0);
    assert_eq!(count(&lin, UOpKind::DefineLocal), 0);
    let body: Vec<UOpKind> = lin
        .uops
        .iter()
        .map(|u| u.kind)
        .skip_while(|k| *k != UOpKind::Loop)
        .filter(|k| matches!(k, UOpKind::Load | UOpKind::Alu | UOpKind::Store))
        .collect();
    assert_eq!(body, vec![UOpKind::Load, UOpKind::Load, UOpKind::Alu, UOpKind::Store]);
}

#[test]
fn test_hand_optimized_reduce() {
    let ast = scheduled_ast(|g| {
        let x = g.from_host("VM", &[16, 64], &vec![0.5f32; 1024]).unwrap();
        g.r(ReduceOp::Sum, x, &to_nodes(&[16, 1])).unwrap()
    });
    let mut kernel = Kernel::new(ast, LinearizerOptions::default()).unwrap();
    kernel.hand_coded_optimizations();
    assert_eq!(sym_prod(kernel.full_shape()), 1024);
    assert!(kernel.first_reduce() <= kernel.shape_len());

    let mut lin = Linearizer::new(kernel);
    lin.linearize(&mut NameCounter::default());
    assert_well_formed(&lin);
    assert!(lin.name.starts_with('r'), "{}", lin.name);
    assert!(count(&lin, UOpKind::DefineAcc) >= 1);
    assert!(count(&lin, UOpKind::Special) >= 1);
    assert!(lin.global_size.is_some());
    assert!(count(&lin, UOpKind::Store) >= 1);
}

#[test]
fn test_listing_has_one_row_per_uop() {
    let ast = scheduled_ast(add_1024);
    let kernel = Kernel::new(ast, LinearizerOptions::loops_only()).unwrap();
    let mut lin = Linearizer::new(kernel);
    lin.linearize(&mut NameCounter::default());

    let listing = UOpListing(&lin.uops);
    assert_eq!(listing.table().len(), lin.uops.len());
    let text = listing.to_string();
    assert!(text.contains("LOOP"), "{text}");
    assert!(text.contains("STORE"), "{text}");
}

#[test]
fn test_rendered_loop() {
    let ast = scheduled_ast(add_1024);
    let kernel = Kernel::new(ast, LinearizerOptions::loops_only()).unwrap();
    let mut lin = Linearizer::new(kernel);
    lin.linearize(&mut NameCounter::default());
    let src = CStyleRenderer::default().render(&lin.name, &lin.uops);
    assert_eq!(src.name, "E_1024");
    assert!(src.code.contains("for (int"), "{}", src.code);
    assert!(src.code.contains("data0["), "{}", src.code);
}

#[test]
fn test_repeated_shapes_get_distinct_names() {
    let add = scheduled_ast(add_1024);
    let mul = scheduled_ast(|g| {
        let x = g.from_host("VM", &[1024], &vec![1.0f32; 1024]).unwrap();
        g.binary(BinaryOp::Mul, x, x).unwrap()
    });
    let mut backend = Compiled::vm("VM")
        .with_options(LinearizerOptions::loops_only())
        .with_hand_optimize(false);
    let first = backend.to_program(&add).unwrap();
    let second = backend.to_program(&mul).unwrap();
    assert_eq!(first.name, "E_1024");
    assert_eq!(second.name, "E_1024n1");
    assert_eq!(backend.to_program(&add).unwrap().name, "E_1024n2");
    assert!(first.src.contains("E_1024("), "{}", first.src);
}
