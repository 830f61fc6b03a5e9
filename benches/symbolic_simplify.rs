use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kernelken::{Node, VarVals, Variable};
use rand::{rngs::StdRng, Rng, SeedableRng};

// index expressions the way the linearizer builds them: a sum of scaled
// loop vars, then split back with div and mod
fn index_expr(vars: &[Variable], rng: &mut StdRng) -> Node {
    let mut acc = Node::num(rng.gen_range(0..16));
    for v in vars {
        acc = acc + v.node() * rng.gen_range(1..64);
    }
    let d = rng.gen_range(2..32);
    (acc.clone() / d) * 3 + acc % d
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let mut group = c.benchmark_group("Symbolic: simplify");

    for nvars in [1, 2, 4, 8] {
        let vars: Vec<Variable> = (0..nvars)
            .map(|i| Variable::new(&format!("v{i}"), 0, rng.gen_range(1..256)).unwrap())
            .collect();
        group.bench_with_input(BenchmarkId::new("build", nvars), &nvars, |b, _| {
            b.iter(|| black_box(index_expr(&vars, &mut rng)));
        });
        let expr = index_expr(&vars, &mut rng);
        let vals: VarVals = vars.iter().map(|v| (v.clone(), v.vmax() / 2)).collect();
        group.bench_with_input(BenchmarkId::new("substitute", nvars), &nvars, |b, _| {
            b.iter(|| black_box(expr.substitute_vals(&vals)));
        });
        group.bench_with_input(BenchmarkId::new("render", nvars), &nvars, |b, _| {
            b.iter(|| black_box(expr.render()));
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
