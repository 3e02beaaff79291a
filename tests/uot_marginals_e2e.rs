use fugw::uot::{UotParams, UotProblem};
use fugw::{
    BcdConfig, DenseSupport, Distribution, FitOptions, FugwDense, Geometry, Hyperparams, Support,
    UotConfig, UotSolver,
};
use ndarray::{array, Array1, Array2, Axis};

fn line_cost(n: usize, m: usize) -> Array1<f64> {
    Array1::from_shape_fn(n * m, |k| {
        let (i, j) = (k / m, k % m);
        (i as f64 / n as f64 - j as f64 / m as f64).powi(2)
    })
}

fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

#[test]
fn hard_marginals_are_matched_by_sinkhorn() {
    // rho = inf turns the sub-problem into balanced entropic OT:
    // both marginals of the returned plan must equal the weights.
    let ws = array![0.1, 0.2, 0.3, 0.25, 0.15];
    let wt = array![0.3, 0.3, 0.4];
    let support = DenseSupport::new(5, 3);
    let cost = line_cost(5, 3);
    let params = UotParams {
        rho_s: f64::INFINITY,
        rho_t: f64::INFINITY,
        eps: 0.05,
    };
    let problem = UotProblem::new(&support, &cost, &ws, &wt, params).unwrap();
    let cfg = UotConfig {
        nits_uot: 5000,
        tol_uot: 1e-12,
        eval_uot: 1,
        ..UotConfig::default()
    };
    let init = Array1::from_elem(15, 1.0 / 15.0);
    let out = UotSolver::Sinkhorn.solve(&problem, &init, None, &cfg).unwrap();

    let rows = support.row_sums(&out.plan);
    let cols = support.col_sums(&out.plan);
    assert!(max_abs_diff(&rows, &ws) < 1e-8, "rows {:?} vs {:?}", rows, ws);
    assert!(max_abs_diff(&cols, &wt) < 1e-6, "cols {:?} vs {:?}", cols, wt);
    assert!(out.iterations < cfg.nits_uot, "did not converge");
}

#[test]
fn hard_marginals_survive_the_bcd_loop() {
    // alpha = 0 drops the geometry term, rho = inf pins both marginals.
    // Uniform weights have unit mass on both sides, so the BCD mass
    // rescaling is the identity and the fitted plan keeps the marginals.
    let n = 6;
    let g = Array2::from_shape_fn((n, n), |(i, j)| (i as f64 - j as f64).abs() / n as f64);
    let fs = Array2::from_shape_fn((2, n), |(r, i)| (i + r) as f64 / n as f64);
    let ft = Array2::from_shape_fn((2, n), |(r, i)| ((n - 1 - i) + r) as f64 / n as f64);
    let source = Distribution::uniform(fs, Geometry::Matrix(g.clone())).unwrap();
    let target = Distribution::uniform(ft, Geometry::Matrix(g)).unwrap();

    let hyper = Hyperparams::new(0.0, f64::INFINITY, 0.05);
    let mut mapping = FugwDense::new(hyper).unwrap();
    let options = FitOptions {
        bcd: BcdConfig {
            nits_bcd: 4,
            ..BcdConfig::default()
        },
        uot: UotConfig {
            nits_uot: 5000,
            tol_uot: 1e-12,
            eval_uot: 1,
            ..UotConfig::default()
        },
        ..FitOptions::default()
    };
    let report = mapping.fit(&source, &target, None, &options).unwrap();
    assert!(report.loss_history().iter().all(|l| l.is_finite()));

    let plan = mapping.plan().unwrap();
    let rows = plan.sum_axis(Axis(1));
    let cols = plan.sum_axis(Axis(0));
    for i in 0..n {
        assert!((rows[i] - 1.0 / n as f64).abs() < 1e-5, "row {}: {}", i, rows[i]);
        assert!((cols[i] - 1.0 / n as f64).abs() < 1e-5, "col {}: {}", i, cols[i]);
    }
    // Hard marginals contribute nothing to the loss.
    let last = report.loss.last().unwrap();
    assert_eq!(last.marginal_source, 0.0);
    assert_eq!(last.marginal_target, 0.0);
}
