//! Log-domain unbalanced Sinkhorn on a fixed support.
//!
//! With `P = exp(α_i + β_j) · K_ij` and `log K_ij = log ws_i + log wt_j − T_ij/ε`,
//! the alternating updates are
//!
//! ```text
//! β_j ← −τt (lse_i(α_i + log K_ij) − log wt_j)
//! α_i ← −τs (lse_j(β_j + log K_ij) − log ws_i)
//! ```
//!
//! with `τ = ρ/(ρ+ε)`. The kernel is never exponentiated until the final plan,
//! so small `ε` does not underflow.

use crate::support::Support;
use crate::uot::{tau, Duals, UotOutput, UotProblem};
use crate::{ensure_finite, safe_ln, UotConfig};
use log::trace;
use ndarray::Array1;

/// Log kernel plus the marginal exponents; shared with IBPP, whose proximal
/// steps are Sinkhorn problems with a different reference measure.
pub(crate) struct LogKernel<'a, S: Support> {
    support: &'a S,
    log_k: Array1<f64>,
    log_ws: Array1<f64>,
    log_wt: Array1<f64>,
    tau_s: f64,
    tau_t: f64,
}

impl<'a, S: Support> LogKernel<'a, S> {
    pub(crate) fn new(
        support: &'a S,
        log_k: Array1<f64>,
        ws: &Array1<f64>,
        wt: &Array1<f64>,
        tau_s: f64,
        tau_t: f64,
    ) -> Self {
        Self {
            support,
            log_k,
            log_ws: ws.mapv(safe_ln),
            log_wt: wt.mapv(safe_ln),
            tau_s,
            tau_t,
        }
    }

    /// `log ws_i + log wt_j − cost_ij / eps` on the support.
    pub(crate) fn entropic_log_kernel(
        support: &S,
        cost: &Array1<f64>,
        ws: &Array1<f64>,
        wt: &Array1<f64>,
        eps: f64,
    ) -> Array1<f64> {
        let (log_ws, log_wt) = (ws.mapv(safe_ln), wt.mapv(safe_ln));
        let mut log_k = support.map_entries(|i, j| log_ws[i] + log_wt[j]);
        log_k.zip_mut_with(cost, |lk, &c| *lk -= c / eps);
        log_k
    }

    pub(crate) fn update_beta(&self, alpha: &Array1<f64>, beta: &mut Array1<f64>) {
        let logits = self.shifted(alpha, |i, _| i);
        let lse = self.support.col_logsumexp(&logits);
        for j in 0..beta.len() {
            beta[j] = dual_update(self.tau_t, lse[j], self.log_wt[j]);
        }
    }

    pub(crate) fn update_alpha(&self, beta: &Array1<f64>, alpha: &mut Array1<f64>) {
        let logits = self.shifted(beta, |_, j| j);
        let lse = self.support.row_logsumexp(&logits);
        for i in 0..alpha.len() {
            alpha[i] = dual_update(self.tau_s, lse[i], self.log_ws[i]);
        }
    }

    pub(crate) fn plan(&self, alpha: &Array1<f64>, beta: &Array1<f64>) -> Array1<f64> {
        let mut plan = self.log_k.clone();
        for (k, lp) in plan.iter_mut().enumerate() {
            let (i, j) = self.support.entry(k);
            *lp = (*lp + alpha[i] + beta[j]).exp();
        }
        plan
    }

    fn shifted(&self, dual: &Array1<f64>, pick: impl Fn(usize, usize) -> usize) -> Array1<f64> {
        let mut logits = self.log_k.clone();
        for (k, x) in logits.iter_mut().enumerate() {
            let (i, j) = self.support.entry(k);
            *x += dual[pick(i, j)];
        }
        logits
    }
}

/// Rows/columns with no reachable mass, or zero weight, keep a zero dual.
#[inline]
fn dual_update(tau: f64, lse: f64, log_w: f64) -> f64 {
    if lse == f64::NEG_INFINITY || log_w == f64::NEG_INFINITY || tau == 0.0 {
        0.0
    } else {
        -tau * (lse - log_w)
    }
}

fn sup_change(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

pub(crate) fn solve<S: Support>(
    problem: &UotProblem<'_, S>,
    init_duals: Option<&Duals>,
    cfg: &UotConfig,
) -> crate::Result<UotOutput> {
    let (n, m) = problem.support.shape();
    let params = problem.params;
    let log_k = LogKernel::entropic_log_kernel(
        problem.support,
        problem.cost,
        problem.ws,
        problem.wt,
        params.eps,
    );
    let kernel = LogKernel::new(
        problem.support,
        log_k,
        problem.ws,
        problem.wt,
        tau(params.rho_s, params.eps),
        tau(params.rho_t, params.eps),
    );

    let (mut alpha, mut beta) = match init_duals {
        Some(Duals::Sinkhorn { alpha, beta }) if alpha.len() == n && beta.len() == m => {
            (alpha.clone(), beta.clone())
        }
        _ => (Array1::zeros(n), Array1::zeros(m)),
    };

    let mut iterations = 0;
    for it in 0..cfg.nits_uot {
        let check = it % cfg.eval_uot == 0;
        let prev = check.then(|| (alpha.clone(), beta.clone()));

        kernel.update_beta(&alpha, &mut beta);
        kernel.update_alpha(&beta, &mut alpha);
        iterations = it + 1;

        if let Some((alpha_prev, beta_prev)) = prev {
            ensure_finite(alpha.iter().chain(beta.iter()), "sinkhorn", it)?;
            let err = sup_change(&alpha, &alpha_prev).max(sup_change(&beta, &beta_prev));
            if err < cfg.tol_uot {
                break;
            }
        }
    }

    let plan = kernel.plan(&alpha, &beta);
    ensure_finite(plan.iter(), "sinkhorn", iterations)?;
    trace!("sinkhorn: {} iterations, plan mass {:.6e}", iterations, plan.sum());

    Ok(UotOutput {
        plan,
        duals: Duals::Sinkhorn { alpha, beta },
        iterations,
    })
}
