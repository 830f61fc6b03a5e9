use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kernelken::{to_nodes, BinaryOp, BufferId, Graph, ReduceOp, RewriteConfig, UnaryOp};
use rand::{rngs::StdRng, Rng, SeedableRng};

// a chain of elementwise ops with a reduce every few steps, like a small MLP
fn build(g: &mut Graph, depth: usize, rng: &mut StdRng) -> BufferId {
    let data: Vec<f32> = (0..64 * 64).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let mut x = g.from_host("CPU", &[64, 64], &data).unwrap();
    for i in 0..depth {
        let y = g.unary(UnaryOp::Exp2, x).unwrap();
        x = g.binary(BinaryOp::Add, x, y).unwrap();
        if i % 4 == 3 {
            let s = g.r(ReduceOp::Sum, x, &to_nodes(&[64, 1])).unwrap();
            let s = g.expand(s, &to_nodes(&[64, 64])).unwrap();
            x = g.binary(BinaryOp::Sub, x, s).unwrap();
        }
    }
    x
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = StdRng::seed_from_u64(12345u64);
    let mut group = c.benchmark_group("Graph: schedule");

    for depth in [4, 16, 64] {
        for opt in [0u8, 2] {
            group.bench_with_input(BenchmarkId::new(format!("opt {opt}"), depth), &depth, |b, &depth| {
                b.iter(|| {
                    let mut g = Graph::new(RewriteConfig::from_opt_level(opt));
                    let out = build(&mut g, depth, &mut rng);
                    black_box(g.schedule(out).unwrap())
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
