//! Benchmarks of incremental SPD growth.
//!
//! Compares bordering an existing factorization with refactorizing the
//! whole gram matrix after every accepted point.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emeta_core::types::{Tensor, Vector};
use emeta_density::{GaussianKernel, Kernel, Spd};
use nalgebra::linalg::Cholesky;
use rand::prelude::*;

fn points(n: usize) -> Tensor {
    let mut rng = SmallRng::seed_from_u64(42);
    Tensor::from_fn(n, 2, |_, _| rng.gen_range(-20.0..20.0))
}

fn bench_append(c: &mut Criterion) {
    let kernel = GaussianKernel::new(&[0.5, 0.5]).unwrap();
    let mut group = c.benchmark_group("spd_growth");

    for &n in &[25, 50, 100] {
        let xs = points(n);
        let gram = kernel.eval(&xs, &xs).unwrap();

        group.bench_with_input(BenchmarkId::new("append", n), &n, |b, &n| {
            b.iter(|| {
                let mut spd = Spd::new(1e-6).unwrap();
                for i in 0..n {
                    let column = Vector::from_iterator(i, (0..i).map(|j| gram[(i, j)]));
                    black_box(spd.append(&column, 1.0, None).unwrap());
                }
                spd
            });
        });

        group.bench_with_input(BenchmarkId::new("refactorize", n), &n, |b, &n| {
            b.iter(|| {
                for i in 1..=n {
                    let sub = gram.view((0, 0), (i, i)).into_owned();
                    black_box(Cholesky::new(sub).map(|c| c.inverse()));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
