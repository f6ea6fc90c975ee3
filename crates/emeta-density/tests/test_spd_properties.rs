//! Invariants of the incremental SPD maintainer on random gram matrices.

use approx::assert_relative_eq;
use emeta_core::types::{Tensor, Vector};
use emeta_density::{GaussianKernel, Kernel, Spd};
use nalgebra::linalg::Cholesky;
use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Random points in the plane.
fn random_points(n: usize, seed: u64) -> Tensor {
    let mut rng = SmallRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 2.0).unwrap();
    Tensor::from_fn(n, 2, |_, _| normal.sample(&mut rng))
}

/// Appends every point in turn; returns the indices that were accepted.
fn grow(spd: &mut Spd, kernel: &GaussianKernel, points: &Tensor) -> Vec<usize> {
    let mut accepted: Vec<usize> = Vec::new();
    for i in 0..points.nrows() {
        let x = points.rows(i, 1).into_owned();
        let basis = Tensor::from_fn(accepted.len(), 2, |r, c| points[(accepted[r], c)]);
        let column: Vector = if accepted.is_empty() {
            Vector::zeros(0)
        } else {
            kernel.eval(&x, &basis).unwrap().row(0).transpose()
        };
        if spd.append(&column, 1.0, None).unwrap() {
            accepted.push(i);
        }
    }
    accepted
}

#[test]
fn test_incremental_factors_match_batch_factorization() {
    let kernel = GaussianKernel::new(&[0.8, 0.8]).unwrap();
    let points = random_points(40, 7);
    let mut spd = Spd::new(1e-3).unwrap();
    let accepted = grow(&mut spd, &kernel, &points);
    assert!(accepted.len() > 1);

    let basis = Tensor::from_fn(accepted.len(), 2, |r, c| points[(accepted[r], c)]);
    let gram = kernel.eval(&basis, &basis).unwrap();
    let batch = Cholesky::new(gram.clone()).unwrap().l();

    assert_relative_eq!(spd.data(), &gram, epsilon = 1e-12);
    assert_relative_eq!(spd.cholesky().unwrap(), &batch, epsilon = 1e-8);
    assert!(spd.identity_error().unwrap() < 1e-6);
}

#[test]
fn test_removing_then_appending_restores_inverse() {
    let kernel = GaussianKernel::new(&[1.0, 1.0]).unwrap();
    let points = random_points(10, 11);
    let mut spd = Spd::new(1e-3).unwrap();
    grow(&mut spd, &kernel, &points);
    let n = spd.len();
    assert!(n >= 2);

    spd.remove(n - 1).unwrap();
    assert_eq!(spd.len(), n - 1);
    assert!(spd.identity_error().unwrap() < 1e-6);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_accepted_sets_stay_well_conditioned(seed in 0u64..1000, epsilon in 1e-3f64..0.5) {
        let kernel = GaussianKernel::new(&[0.5, 0.5]).unwrap();
        let points = random_points(25, seed);
        let mut spd = Spd::new(epsilon).unwrap();
        let accepted = grow(&mut spd, &kernel, &points);

        prop_assert!(!accepted.is_empty());
        prop_assert_eq!(spd.len(), accepted.len());
        prop_assert!(spd.identity_error().unwrap() < 1e-6);
        let l = spd.cholesky().unwrap().clone();
        prop_assert!(l.diagonal().iter().all(|d| d * d >= epsilon * (1.0 - 1e-9)));
    }

    #[test]
    fn prop_rejection_leaves_state_untouched(offset in 0.0f64..1e-3) {
        let kernel = GaussianKernel::new(&[1.0]).unwrap();
        let mut spd = Spd::new(0.1).unwrap();
        spd.append(&Vector::zeros(0), 1.0, None).unwrap();
        let before = spd.clone();

        let x = Tensor::from_element(1, 1, offset);
        let column = kernel.eval(&x, &Tensor::zeros(1, 1)).unwrap().row(0).transpose();
        prop_assert!(!spd.append(&column, 1.0, None).unwrap());
        prop_assert_eq!(spd.data(), before.data());
    }
}
