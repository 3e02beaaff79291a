//! The entropic unbalanced OT sub-problem shared by every BCD half-step.
//!
//! Each solver minimizes, over plans living on a fixed [`Support`],
//!
//! ```text
//! <T, P> + ρs KL(P1 | ws) + ρt KL(Pᵀ1 | wt) + ε KL(P | ws⊗wt)
//! ```
//!
//! They differ in how they iterate and in the dual state they carry, which is
//! what [`Duals`] records so the next call on the same half can warm-start.

use crate::config::{UotConfig, UotSolver};
use crate::loss::{kl, plan_kl};
use crate::support::Support;
use crate::{ibpp, mm, sinkhorn, Error, Result};
use ndarray::Array1;

/// Effective parameters of one sub-problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UotParams {
    pub rho_s: f64,
    pub rho_t: f64,
    pub eps: f64,
}

/// One sub-problem instance. Cost and plan are flat, one value per support entry.
#[derive(Debug, Clone, Copy)]
pub struct UotProblem<'a, S: Support> {
    pub support: &'a S,
    pub cost: &'a Array1<f64>,
    pub ws: &'a Array1<f64>,
    pub wt: &'a Array1<f64>,
    pub params: UotParams,
}

impl<'a, S: Support> UotProblem<'a, S> {
    pub fn new(
        support: &'a S,
        cost: &'a Array1<f64>,
        ws: &'a Array1<f64>,
        wt: &'a Array1<f64>,
        params: UotParams,
    ) -> Result<Self> {
        let (n, m) = support.shape();
        if cost.len() != support.len() {
            return Err(Error::LengthMismatch {
                what: "cost vs support entries",
                expected: support.len(),
                got: cost.len(),
            });
        }
        if ws.len() != n {
            return Err(Error::LengthMismatch {
                what: "source weights vs plan rows",
                expected: n,
                got: ws.len(),
            });
        }
        if wt.len() != m {
            return Err(Error::LengthMismatch {
                what: "target weights vs plan columns",
                expected: m,
                got: wt.len(),
            });
        }
        if !(params.eps > 0.0) || !params.eps.is_finite() {
            return Err(Error::InvalidRegularization(params.eps));
        }
        for rho in [params.rho_s, params.rho_t] {
            if !(rho > 0.0) {
                return Err(Error::InvalidMassPenalty(rho));
            }
        }
        Ok(Self {
            support,
            cost,
            ws,
            wt,
            params,
        })
    }
}

/// Dual state returned by a solve; one variant per solver.
#[derive(Debug, Clone, PartialEq)]
pub enum Duals {
    /// Log-domain scalings (`f/ε`, `g/ε`).
    Sinkhorn { alpha: Array1<f64>, beta: Array1<f64> },
    /// Row and column marginals of the final plan.
    Mm { row: Array1<f64>, col: Array1<f64> },
    /// Log scalings of the last proximal step, plus its anchor plan.
    Ibpp {
        log_u: Array1<f64>,
        log_v: Array1<f64>,
        anchor: Array1<f64>,
    },
}

impl Duals {
    pub fn solver(&self) -> UotSolver {
        match self {
            Duals::Sinkhorn { .. } => UotSolver::Sinkhorn,
            Duals::Mm { .. } => UotSolver::Mm,
            Duals::Ibpp { .. } => UotSolver::Ibpp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UotOutput {
    pub plan: Array1<f64>,
    pub duals: Duals,
    pub iterations: usize,
}

impl UotSolver {
    /// Solve one sub-problem.
    ///
    /// `init_plan` seeds MM and the first IBPP anchor. `init_duals` from a
    /// different solver are ignored.
    pub fn solve<S: Support>(
        &self,
        problem: &UotProblem<'_, S>,
        init_plan: &Array1<f64>,
        init_duals: Option<&Duals>,
        cfg: &UotConfig,
    ) -> Result<UotOutput> {
        if init_plan.len() != problem.support.len() {
            return Err(Error::LengthMismatch {
                what: "initial plan vs support entries",
                expected: problem.support.len(),
                got: init_plan.len(),
            });
        }
        let init_duals = init_duals.filter(|d| d.solver() == *self);
        match self {
            UotSolver::Sinkhorn => sinkhorn::solve(problem, init_duals, cfg),
            UotSolver::Mm => mm::solve(problem, init_plan, cfg),
            UotSolver::Ibpp => ibpp::solve(problem, init_plan, init_duals, cfg),
        }
    }
}

/// `ρ / (ρ + ε)`: exponent of the KL-relaxed marginal update.
///
/// `1` for a hard marginal (`ρ = ∞`).
#[inline]
pub(crate) fn tau(rho: f64, eps: f64) -> f64 {
    if rho.is_infinite() {
        1.0
    } else {
        rho / (rho + eps)
    }
}

/// Value of the sub-problem objective at `plan`.
///
/// Hard marginals (`ρ = ∞`) contribute nothing.
pub fn uot_objective<S: Support>(problem: &UotProblem<'_, S>, plan: &Array1<f64>) -> f64 {
    let UotParams { rho_s, rho_t, eps } = problem.params;
    let support = problem.support;
    let mut obj = problem.cost.dot(plan);
    if rho_s.is_finite() {
        obj += rho_s * kl(&support.row_sums(plan), problem.ws);
    }
    if rho_t.is_finite() {
        obj += rho_t * kl(&support.col_sums(plan), problem.wt);
    }
    obj + eps * plan_kl(support, plan, problem.ws, problem.wt)
}
