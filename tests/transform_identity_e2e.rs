use fugw::{BcdConfig, Distribution, FitOptions, FugwDense, Geometry, Hyperparams, UotConfig};
use ndarray::Array2;

fn same_line(n: usize) -> Distribution {
    let g = Array2::from_shape_fn((n, n), |(i, j)| {
        (i as f64 - j as f64).powi(2) / ((n - 1) * (n - 1)) as f64
    });
    let f = Array2::from_shape_fn((1, n), |(_, i)| i as f64 / (n - 1) as f64);
    Distribution::uniform(f, Geometry::Matrix(g)).unwrap()
}

#[test]
fn transport_between_identical_distributions_is_the_identity() {
    // Source == target with hard marginals and small eps: the plan concentrates
    // on the diagonal, so transform and inverse_transform are the identity map.
    let n = 6;
    let dist = same_line(n);
    let hyper = Hyperparams::new(0.2, f64::INFINITY, 1e-3);
    let mut mapping = FugwDense::new(hyper).unwrap();
    let options = FitOptions {
        bcd: BcdConfig {
            nits_bcd: 5,
            ..BcdConfig::default()
        },
        uot: UotConfig {
            nits_uot: 3000,
            tol_uot: 1e-10,
            ..UotConfig::default()
        },
        ..FitOptions::default()
    };
    mapping.fit(&dist, &dist, None, &options).unwrap();

    let plan = mapping.plan().unwrap();
    for i in 0..n {
        assert!(
            plan[[i, i]] > 0.99 / n as f64,
            "diagonal entry {} is {}",
            i,
            plan[[i, i]]
        );
    }

    let features = Array2::from_shape_fn((3, n), |(r, i)| ((r + 1) * i) as f64 * 0.5 - r as f64);
    let moved = mapping.transform(&features).unwrap();
    let back = mapping.inverse_transform(&moved).unwrap();
    for ((a, b), c) in features.iter().zip(moved.iter()).zip(back.iter()) {
        assert!((a - b).abs() < 1e-3, "transform: {} vs {}", a, b);
        assert!((a - c).abs() < 1e-3, "round trip: {} vs {}", a, c);
    }

    let score = mapping.score(&features, &features).unwrap();
    assert!(score <= 0.0 && score > -1e-4, "score {}", score);
}
