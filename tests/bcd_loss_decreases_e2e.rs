use fugw::{
    BcdConfig, BcdState, Distribution, FitOptions, FugwDense, Geometry, Hyperparams, RegMode,
    UotConfig, UotSolver,
};
use ndarray::Array2;

fn curve(n: usize, phase: f64) -> Distribution {
    // Points on a gently bent curve; features vary smoothly along it.
    let pts: Vec<(f64, f64)> = (0..n)
        .map(|i| {
            let t = i as f64 / (n - 1) as f64;
            (t, 0.3 * (3.0 * t + phase).sin())
        })
        .collect();
    let g = Array2::from_shape_fn((n, n), |(i, j)| {
        (pts[i].0 - pts[j].0).powi(2) + (pts[i].1 - pts[j].1).powi(2)
    });
    let f = Array2::from_shape_fn((2, n), |(r, i)| if r == 0 { pts[i].0 } else { pts[i].1 });
    Distribution::uniform(f, Geometry::Matrix(g)).unwrap()
}

fn options(solver: UotSolver) -> FitOptions {
    FitOptions {
        solver,
        bcd: BcdConfig {
            nits_bcd: 6,
            // Never stop early: every alternation is recorded.
            tol_bcd: 0.0,
            eval_bcd: 1,
            early_stopping_threshold: 0.0,
        },
        uot: UotConfig {
            nits_uot: 2000,
            tol_uot: 1e-10,
            eval_uot: 1,
            ..UotConfig::default()
        },
        ..FitOptions::default()
    }
}

fn assert_non_increasing(history: &[f64]) {
    for w in history.windows(2) {
        let slack = 1e-3 * w[0].abs() + 1e-9;
        assert!(w[1] <= w[0] + slack, "loss went up: {:?}", history);
    }
}

#[test]
fn loss_history_is_non_increasing_for_every_solver() {
    // Each half-step solves a convex sub-problem exactly (up to tolerance),
    // so the recorded FUGW loss should not go up between evaluations.
    let (source, target) = (curve(9, 0.0), curve(8, 0.4));
    let hyper = Hyperparams::new(0.5, 1.0, 0.1);

    for solver in [UotSolver::Sinkhorn, UotSolver::Mm, UotSolver::Ibpp] {
        let mut mapping = FugwDense::new(hyper).unwrap();
        let report = mapping.fit(&source, &target, None, &options(solver)).unwrap();
        let history = report.loss_history();

        assert!(history.len() >= 3, "{}: only {} losses", solver, history.len());
        assert_eq!(report.loss_steps[0], 0);
        assert_eq!(report.state, BcdState::MaxIterationsReached);
        assert!(history.iter().all(|l| l.is_finite()), "{}: {:?}", solver, history);
        assert_non_increasing(&history);
        assert!(
            history.last().unwrap() < &history[0],
            "{}: no progress {:?}",
            solver,
            history
        );
    }
}

#[test]
fn early_stopping_needs_the_loss_itself_below_threshold() {
    // The loss flattens out around 0.1. A flat loss is not a small loss, so a
    // 1e-3 threshold must not end the run.
    let (source, target) = (curve(9, 0.0), curve(8, 0.4));
    let mut opts = options(UotSolver::Sinkhorn);
    opts.bcd.early_stopping_threshold = 1e-3;
    let mut mapping = FugwDense::new(Hyperparams::new(0.5, 1.0, 0.1)).unwrap();
    let report = mapping.fit(&source, &target, None, &opts).unwrap();

    let history = report.loss_history();
    assert!(history.iter().all(|&l| l > 1e-3), "{:?}", history);
    assert_eq!(report.state, BcdState::MaxIterationsReached);
    assert_eq!(report.iterations, opts.bcd.nits_bcd);
    assert!(!report.converged());
}

#[test]
fn independent_regularization_also_decreases() {
    let (source, target) = (curve(7, 0.2), curve(7, 0.9));
    let hyper = Hyperparams::new(0.3, 2.0, 0.1).with_reg_mode(RegMode::Independent);
    let mut mapping = FugwDense::new(hyper).unwrap();
    let report = mapping
        .fit(&source, &target, None, &options(UotSolver::Sinkhorn))
        .unwrap();
    assert_non_increasing(&report.loss_history());

    // Loss components are reported separately and add up.
    let last = report.loss.last().unwrap();
    let weighted = (1.0 - hyper.alpha) * last.wasserstein
        + hyper.alpha * last.gromov_wasserstein
        + last.marginal_source
        + last.marginal_target
        + last.regularization;
    assert!((weighted - last.total).abs() < 1e-9 * last.total.abs().max(1.0));
}
