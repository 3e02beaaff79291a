use fugw::coarse_to_fine::{self, CoarseToFineConfig, FineInit, PairSelection, Sampling};
use fugw::{BcdConfig, Distribution, Error, FitOptions, Geometry, Hyperparams, Support, UotConfig};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

const N: usize = 500;
const N_SAMPLES: usize = 50;
/// Covers the typical gap between 50 uniform samples of the unit square,
/// about `1 / sqrt(50) ≈ 0.14`.
const RADIUS: f64 = 0.15;

/// Points in the unit square with smooth features of their position.
fn square_cloud(seed: u64, shift: f64) -> Distribution {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let x = Array2::from_shape_simple_fn((N, 2), || rng.random::<f64>());
    let f = Array2::from_shape_fn((3, N), |(r, i)| {
        let (a, b) = (x[[i, 0]] + shift, x[[i, 1]]);
        match r {
            0 => a,
            1 => b,
            _ => (3.0 * a).sin() * b,
        }
    });
    Distribution::uniform(f, Geometry::Embedding(x)).unwrap()
}

fn options(nits_bcd: usize, nits_uot: usize) -> FitOptions {
    FitOptions {
        bcd: BcdConfig {
            nits_bcd,
            ..BcdConfig::default()
        },
        uot: UotConfig {
            nits_uot,
            ..UotConfig::default()
        },
        ..FitOptions::default()
    }
}

fn config() -> CoarseToFineConfig {
    CoarseToFineConfig {
        source_sample_size: N_SAMPLES,
        target_sample_size: N_SAMPLES,
        sampling: Sampling::Uniform,
        seed: 7,
        selection: PairSelection::TopK { k: 3 },
        min_pairs: 1,
        source_radius: RADIUS,
        target_radius: RADIUS,
        fine_init: FineInit::Uniform,
        coarse_hyper: Hyperparams::new(0.5, 1.0, 0.01),
        coarse_options: options(5, 300),
        fine_hyper: Hyperparams::new(0.5, 1.0, 0.01),
        fine_options: options(2, 100),
    }
}

fn embedding(dist: &Distribution) -> &Array2<f64> {
    match dist.geometry() {
        Geometry::Embedding(x) => x,
        Geometry::Matrix(_) => unreachable!("test clouds carry embeddings"),
    }
}

#[test]
fn coarse_to_fine_builds_a_bounded_mask_and_fits_on_it() {
    let (source, target) = (square_cloud(1, 0.0), square_cloud(2, 0.02));
    let (mapping, report) = coarse_to_fine::fit(&source, &target, &config()).unwrap();

    assert_eq!(report.source_indices.len(), N_SAMPLES);
    assert_eq!(report.target_indices.len(), N_SAMPLES);
    assert!(report.source_indices.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(report.coarse_plan.dim(), (N_SAMPLES, N_SAMPLES));

    // Every selected pair is its own ball's center, so it is in the mask.
    assert!(!report.pairs.is_empty());
    for &(i, j) in &report.pairs {
        assert!(report.mask.contains(i, j), "pair ({}, {}) missing from mask", i, j);
    }
    assert!(!report.mask.is_empty());

    // The mask is a union of N_s(i) x N_t(j) over the selected pairs, so it
    // can hold no more than the sum of those products.
    let (xs, xt) = (embedding(&source), embedding(&target));
    let mut bound = 0;
    let mut ball_sizes = 0;
    for &(i, j) in &report.pairs {
        let ns = coarse_to_fine::neighbourhood(xs, i, RADIUS);
        let nt = coarse_to_fine::neighbourhood(xt, j, RADIUS);
        assert!(ns.contains(&i) && nt.contains(&j));
        for &a in &ns {
            for &b in &nt {
                assert!(report.mask.contains(a, b), "({}, {}) missing from mask", a, b);
            }
        }
        bound += ns.len() * nt.len();
        ball_sizes += ns.len() + nt.len();
    }
    assert!(report.mask.len() <= bound, "mask {} > bound {}", report.mask.len(), bound);
    let avg = ball_sizes as f64 / (2 * report.pairs.len()) as f64;
    assert!(avg > 1.0, "radius does not reach any neighbour");
    assert!(report.mask.len() < N * N, "mask covers the full plan");

    let plan = mapping.plan().unwrap();
    assert!(Arc::ptr_eq(plan.mask(), &report.mask));
    assert!(plan.values().iter().all(|&v| v >= 0.0 && v.is_finite()));
    for ((a, b), &v) in plan.to_dense().indexed_iter() {
        if v != 0.0 {
            assert!(report.mask.contains(a, b), "mass {} at ({}, {}) outside mask", v, a, b);
        }
    }
    assert!(report.fine.loss_history().iter().all(|l| l.is_finite()));

    let moved = mapping.transform(source.features()).unwrap();
    assert_eq!(moved.dim(), (3, N));
}

#[test]
fn coarse_to_fine_is_deterministic_for_a_seed() {
    let (source, target) = (square_cloud(3, 0.0), square_cloud(4, 0.0));
    let mut cfg = config();
    cfg.sampling = Sampling::FarthestPoint;
    cfg.fine_init = FineInit::FromCoarse;
    cfg.fine_options = options(1, 50);

    let (_, a) = coarse_to_fine::fit(&source, &target, &cfg).unwrap();
    let (_, b) = coarse_to_fine::fit(&source, &target, &cfg).unwrap();
    assert_eq!(a.source_indices, b.source_indices);
    assert_eq!(a.target_indices, b.target_indices);
    assert_eq!(a.pairs, b.pairs);
    assert_eq!(a.mask.as_ref(), b.mask.as_ref());
}

#[test]
fn an_empty_selection_is_a_validation_error() {
    // Nothing is strictly above the maximum, so no pair survives.
    let (source, target) = (square_cloud(5, 0.0), square_cloud(6, 0.0));
    let mut cfg = config();
    cfg.source_sample_size = 10;
    cfg.target_sample_size = 10;
    cfg.selection = PairSelection::Quantile { q: 1.0 };
    let err = coarse_to_fine::fit(&source, &target, &cfg).unwrap_err();
    assert!(matches!(err, Error::EmptyMask(_)), "unexpected {:?}", err);
    assert!(err.is_validation());
}

#[test]
fn matrix_geometry_is_rejected() {
    let g = Array2::zeros((3, 3));
    let f = Array2::zeros((1, 3));
    let dist = Distribution::uniform(f, Geometry::Matrix(g)).unwrap();
    assert!(matches!(
        coarse_to_fine::fit(&dist, &dist, &CoarseToFineConfig::default()),
        Err(Error::Domain(_))
    ));
}
