use std::collections::HashSet;

use kernelken::{
    to_nodes, BinaryOp, BufferId, DType, Error, Graph, LoadOp, Node, Op, OpType, ReduceOp, RewriteConfig, UnaryOp,
};
use test_case::test_case;

fn iota(g: &mut Graph, device: &str, shape: &[i64]) -> BufferId {
    let n: i64 = shape.iter().product();
    #[allow(clippy::cast_precision_loss)]
    let data: Vec<f32> = (0..n).map(|x| (x % 7) as f32).collect();
    g.from_host(device, shape, &data).unwrap()
}

#[test]
fn test_reshape_roundtrip_is_same_buffer() {
    let mut g = Graph::new(RewriteConfig::default());
    let a = g.full("VM", &to_nodes(&[4, 4]), DType::Float32, 2.0).unwrap();
    let r = g.reshape(a, &to_nodes(&[16])).unwrap();
    let b = g.reshape(r, &to_nodes(&[4, 4])).unwrap();
    assert_eq!(a, b);

    let out = g.contiguous(b).unwrap();
    let sched = g.schedule(out).unwrap();
    assert_eq!(sched.len(), 1);
    g.run_schedule(sched).unwrap();
    assert_eq!(g.to_host(out).unwrap(), vec![2.0; 16]);
    assert_eq!(g.stats().kernel_count, 1);
}

#[test]
fn test_sum_of_elementwise_is_one_kernel() {
    let mut g = Graph::new(RewriteConfig::default());
    let x = iota(&mut g, "CPU", &[4, 4]);
    let y = iota(&mut g, "CPU", &[4, 4]);
    let a = g.binary(BinaryOp::Mul, x, y).unwrap();
    let b = g.binary(BinaryOp::Sub, x, y).unwrap();
    let c = g.binary(BinaryOp::Add, a, b).unwrap();
    let s = g.r(ReduceOp::Sum, c, &to_nodes(&[1, 4])).unwrap();
    assert_eq!(g.get(a).unwrap().optype(), OpType::Elementwise);

    let sched = g.schedule(s).unwrap();
    assert_eq!(sched.len(), 1);
    let ast = &sched[0].ast;
    assert_eq!(ast.op(), Op::Reduce(ReduceOp::Sum));
    let inner = ast.srcs()[0].as_op().unwrap();
    assert_eq!(inner.op(), Op::Binary(BinaryOp::Add));
    assert_eq!(sched[0].inputs, vec![x, y]);
}

#[test]
fn test_symbolic_rebind_conflicts() {
    let mut g = Graph::new(RewriteConfig::default());
    let x = iota(&mut g, "CPU", &[35]);
    let n = Node::var("N", 1, 10).unwrap();
    let first = g.reshape(x, &[n.clone(), Node::num(7)]).unwrap();
    assert_eq!(g.shape(first)[0], n);
    assert_eq!(g.var_vals(x).get(n.as_var().unwrap()), Some(&5));

    let err = g.reshape(x, &[n, Node::num(5)]).unwrap_err();
    match err {
        Error::VarValConflict { name, was, new } => {
            assert_eq!(name, "N");
            assert_eq!((was, new), (5, 7));
        }
        e => panic!("unexpected error {e}"),
    }
}

#[test_case("CPU"; "interpreted")]
#[test_case("VM"; "compiled")]
fn test_pad_through_div_keeps_zero_padding(device: &str) {
    let mut g = Graph::new(RewriteConfig::default());
    let x = g.from_host(device, &[4], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    let y = g.from_host(device, &[4], &[2.0f32, 2.0, 2.0, 2.0]).unwrap();
    let d = g.binary(BinaryOp::Div, x, y).unwrap();
    let p = g.pad(d, &[(1, 1)]).unwrap();
    let z = g.from_host(device, &[6], &[10.0f32; 6]).unwrap();
    let out = g.binary(BinaryOp::Add, p, z).unwrap();
    assert_eq!(g.to_host(out).unwrap(), vec![10.0, 10.5, 11.0, 11.5, 12.0, 10.0]);
}

#[test_case("CPU"; "interpreted")]
#[test_case("VM"; "compiled")]
fn test_expand_of_padded_keeps_zeros(device: &str) {
    let mut g = Graph::new(RewriteConfig::default());
    let x = g.from_host(device, &[1, 1], &[5.0f32]).unwrap();
    let p = g.pad(x, &[(0, 0), (0, 1)]).unwrap();
    let r = g.reshape(p, &to_nodes(&[1, 1, 2])).unwrap();
    let e = g.expand(r, &to_nodes(&[2, 1, 2])).unwrap();
    let out = g.contiguous(e).unwrap();
    assert_eq!(g.to_host(out).unwrap(), vec![5.0, 0.0, 5.0, 0.0]);
}

#[test]
fn test_shared_intermediate_scheduled_once() {
    let mut g = Graph::new(RewriteConfig::from_opt_level(0));
    let x = iota(&mut g, "CPU", &[8]);
    let a = g.unary(UnaryOp::Neg, x).unwrap();
    let b = g.binary(BinaryOp::Mul, a, a).unwrap();
    let c = g.binary(BinaryOp::Add, b, a).unwrap();
    let d = g.binary(BinaryOp::Max, c, a).unwrap();
    let sched = g.schedule(d).unwrap();
    let outs: HashSet<BufferId> = sched.iter().map(|s| s.out).collect();
    assert_eq!(sched.len(), 4);
    assert_eq!(outs, HashSet::from([a, b, c, d]));
    g.run_schedule(sched).unwrap();
    assert!(g.schedule(d).unwrap().is_empty());
}

#[test_case(&[65536], &[1]; "full")]
#[test_case(&[2, 32768], &[2, 1]; "inner")]
#[test_case(&[32768, 4], &[1, 4]; "outer")]
fn test_split_reduce_matches_unsplit(shape: &[i64], out_shape: &[i64]) {
    let run = |config: RewriteConfig, device: &str| {
        let mut g = Graph::new(config);
        let x = iota(&mut g, device, shape);
        let s = g.r(ReduceOp::Sum, x, &to_nodes(out_shape)).unwrap();
        g.to_host(s).unwrap()
    };
    let expected = run(RewriteConfig::default().with_reduce_split(None), "CPU");
    assert_eq!(run(RewriteConfig::default(), "CPU"), expected);
    assert_eq!(run(RewriteConfig::default(), "VM"), expected);

    let cols = usize::try_from(shape[1..].iter().product::<i64>()).unwrap();
    let n = usize::try_from(shape.iter().product::<i64>()).unwrap();
    #[allow(clippy::cast_precision_loss)]
    let naive: Vec<f64> = match out_shape {
        [1] => vec![(0..n).map(|i| (i % 7) as f64).sum()],
        [_, 1] => (0..shape[0] as usize)
            .map(|r| (0..cols).map(|c| ((r * cols + c) % 7) as f64).sum())
            .collect(),
        _ => (0..cols)
            .map(|c| (0..shape[0] as usize).map(|r| ((r * cols + c) % 7) as f64).sum())
            .collect(),
    };
    assert_eq!(expected, naive);
}

#[test_case(&[65536], &[1]; "full")]
#[test_case(&[2, 32768], &[2, 1]; "inner")]
#[test_case(&[32768, 4], &[1, 4]; "outer")]
fn test_split_max_is_exact(shape: &[i64], out_shape: &[i64]) {
    let run = |config: RewriteConfig, device: &str| {
        let mut g = Graph::new(config);
        let n: i64 = shape.iter().product();
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..n).map(|x| -1.5 - ((x * 13) % 101) as f32).collect();
        let x = g.from_host(device, shape, &data).unwrap();
        let m = g.r(ReduceOp::Max, x, &to_nodes(out_shape)).unwrap();
        let sched = g.schedule(m).unwrap();
        let reduces = sched
            .iter()
            .filter(|si| si.ast.get_lazyops().iter().any(|o| o.op() == Op::Reduce(ReduceOp::Max)))
            .count();
        g.run_schedule(sched).unwrap();
        (reduces, g.to_host(m).unwrap())
    };
    let (unsplit_reduces, expected) = run(RewriteConfig::default().with_reduce_split(None), "CPU");
    assert_eq!(unsplit_reduces, 1);
    assert!(expected.iter().all(|v| *v == -1.5), "{expected:?}");
    for device in ["CPU", "VM"] {
        let (reduces, got) = run(RewriteConfig::default(), device);
        assert_eq!(reduces, 2, "{device}");
        assert_eq!(got, expected, "{device}");
    }
}

#[test_case("CPU"; "interpreted")]
#[test_case("VM"; "compiled")]
fn test_pushed_pad_matches_unpushed(device: &str) {
    let run = |config: RewriteConfig| {
        let mut g = Graph::new(config);
        let x = iota(&mut g, device, &[3, 4]);
        let y = iota(&mut g, device, &[3, 4]);
        let three = g.const_like(x, 3.0).unwrap();
        let a = g.binary(BinaryOp::Add, x, three).unwrap();
        let b = g.binary(BinaryOp::Add, a, y).unwrap();
        let p = g.pad(b, &[(1, 2), (2, 0)]).unwrap();
        let out = g.contiguous(p).unwrap();
        g.to_host(out).unwrap()
    };
    let unpushed = run(RewriteConfig::from_opt_level(0));
    let pushed = run(RewriteConfig::from_opt_level(2));
    assert_eq!(unpushed.len(), 6 * 6);
    assert_eq!(pushed, unpushed);
    for (i, v) in unpushed.iter().enumerate() {
        let (r, c) = (i / 6, i % 6);
        if !(1..4).contains(&r) || c < 2 {
            assert_eq!(*v, 0.0, "padded cell ({r}, {c})");
        }
    }
}

#[test]
fn test_split_reduce_builds_two_reduces() {
    let mut g = Graph::new(RewriteConfig::default());
    let x = g.empty("CPU", &[32768, 4], DType::Float32).unwrap();
    let s = g.r(ReduceOp::Sum, x, &to_nodes(&[1, 4])).unwrap();
    let sched = g.schedule(s).unwrap();
    let reduces = sched
        .iter()
        .filter(|si| si.ast.get_lazyops().iter().any(|o| matches!(o.op(), Op::Reduce(_))))
        .count();
    assert_eq!(reduces, 2);
}

#[test]
fn test_collect_then_realize() {
    let mut g = Graph::new(RewriteConfig::default());
    let x = iota(&mut g, "VM", &[4]);
    let keep = g.unary(UnaryOp::Sqrt, x).unwrap();
    for _ in 0..3 {
        let dead = g.binary(BinaryOp::Mul, x, x).unwrap();
        g.reshape(dead, &to_nodes(&[2, 2])).unwrap();
    }
    let before = g.len();
    let dropped = g.collect(&[keep]);
    assert!(dropped > 0);
    assert_eq!(g.len(), before - dropped);
    let got = g.to_host(keep).unwrap();
    let want: Vec<f64> = [0.0f32, 1.0, 2.0, 3.0].iter().map(|v| f64::from(v.sqrt())).collect();
    assert_eq!(got, want);
}

#[test]
fn test_copy_between_devices() {
    let mut g = Graph::new(RewriteConfig::default());
    let x = iota(&mut g, "CPU", &[3, 2]);
    let p = g.permute(x, &[1, 0]).unwrap();
    let moved = g.copy_to_device(p, "VM").unwrap();
    let sched = g.schedule(moved).unwrap();
    assert_eq!(sched.last().unwrap().ast.op(), Op::Load(LoadOp::From));
    assert_eq!(g.to_host(moved).unwrap(), vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
}
