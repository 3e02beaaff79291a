//! Majorize-minimization for the KL-penalized sub-problem.
//!
//! Each step minimizes a separable majorizer of the objective around the current
//! plan, which has the closed form
//!
//! ```text
//! P ← P^{τ1+τ2} / (p₁^{τ1} ⊗ p₂^{τ2}) ⊙ ws^{τ1+r} wt^{τ2+r} exp(−T/S)
//! S = ρs + ρt + ε,  τ1 = ρs/S,  τ2 = ρt/S,  r = ε/S
//! ```
//!
//! so the objective never increases. Computed in log space. Zero entries stay
//! zero, so the initial plan's support is preserved.

use crate::support::Support;
use crate::uot::{Duals, UotOutput, UotProblem};
use crate::{ensure_finite, safe_ln, Error, Result, UotConfig};
use log::trace;
use ndarray::Array1;

pub(crate) fn solve<S: Support>(
    problem: &UotProblem<'_, S>,
    init_plan: &Array1<f64>,
    cfg: &UotConfig,
) -> Result<UotOutput> {
    let params = problem.params;
    if !params.rho_s.is_finite() || !params.rho_t.is_finite() {
        return Err(Error::Domain("mm solver needs finite rho_s and rho_t"));
    }
    let support = problem.support;
    let s = params.rho_s + params.rho_t + params.eps;
    let (t1, t2, r) = (params.rho_s / s, params.rho_t / s, params.eps / s);

    let (log_ws, log_wt) = (problem.ws.mapv(safe_ln), problem.wt.mapv(safe_ln));
    let mut log_k = support.map_entries(|i, j| (t1 + r) * log_ws[i] + (t2 + r) * log_wt[j]);
    log_k.zip_mut_with(problem.cost, |lk, &c| *lk -= c / s);

    let mut plan = init_plan.clone();
    let mut row = support.row_sums(&plan);
    let mut col = support.col_sums(&plan);

    let mut iterations = 0;
    for it in 0..cfg.nits_uot {
        let (log_row, log_col) = (row.mapv(safe_ln), col.mapv(safe_ln));
        for (k, p) in plan.iter_mut().enumerate() {
            if *p <= 0.0 {
                *p = 0.0;
                continue;
            }
            let (i, j) = support.entry(k);
            let log_p = (t1 + t2) * p.ln() - t1 * log_row[i] - t2 * log_col[j] + log_k[k];
            *p = log_p.exp();
        }
        iterations = it + 1;

        let new_row = support.row_sums(&plan);
        let new_col = support.col_sums(&plan);
        if it % cfg.eval_uot == 0 {
            ensure_finite(plan.iter(), "mm", it)?;
            let err = max_abs_diff(&new_row, &row).max(max_abs_diff(&new_col, &col));
            if err < cfg.tol_uot {
                row = new_row;
                col = new_col;
                break;
            }
        }
        row = new_row;
        col = new_col;
    }

    ensure_finite(plan.iter(), "mm", iterations)?;
    trace!("mm: {} iterations, plan mass {:.6e}", iterations, plan.sum());

    Ok(UotOutput {
        plan,
        duals: Duals::Mm { row, col },
        iterations,
    })
}

fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}
