//! Block-coordinate descent over the lifted pair `(P, Q)`.
//!
//! Fixing one plan turns the FUGW objective into a convex entropic UOT problem
//! in the other. The driver alternates those half-steps (P first), rescales each
//! new plan towards the mass of the fixed one, and records the loss every
//! `eval_bcd` alternations.

use crate::config::{BcdConfig, RegMode, UotConfig, UotSolver};
use crate::cost::FusedCost;
use crate::loss::{approx_kl, fugw_loss, plan_approx_kl, LossTerms};
use crate::support::Support;
use crate::uot::{Duals, UotParams, UotProblem};
use crate::{Error, Hyperparams, Result};
use log::{debug, trace, warn};
use ndarray::Array1;

/// `ws_i · wt_j / sqrt(Σws · Σwt)` on every support entry.
pub fn product_plan<S: Support>(support: &S, ws: &Array1<f64>, wt: &Array1<f64>) -> Array1<f64> {
    let scale = (ws.sum() * wt.sum()).sqrt();
    support.map_entries(|i, j| ws[i] * wt[j] / scale)
}

/// Where the driver is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcdState {
    Initializing,
    OptimizingP,
    OptimizingQ,
    Converged,
    MaxIterationsReached,
}

/// Starting point of a run.
#[derive(Debug, Clone)]
pub struct BcdInit {
    pub pi: Array1<f64>,
    pub gamma: Array1<f64>,
    pub duals_pi: Option<Duals>,
    pub duals_gamma: Option<Duals>,
}

impl BcdInit {
    /// Both plans start at `plan`; no warm-start duals.
    pub fn from_plan(plan: Array1<f64>) -> Self {
        Self {
            pi: plan.clone(),
            gamma: plan,
            duals_pi: None,
            duals_gamma: None,
        }
    }
}

/// Result of a run: both plans, their last duals and the recorded losses.
#[derive(Debug, Clone)]
pub struct BcdOutput {
    pub pi: Array1<f64>,
    pub gamma: Array1<f64>,
    pub duals_pi: Option<Duals>,
    pub duals_gamma: Option<Duals>,
    /// Recorded losses, the initial one first.
    pub loss: Vec<LossTerms>,
    /// BCD iteration at which each entry of `loss` was recorded.
    pub loss_steps: Vec<usize>,
    pub state: BcdState,
    /// Full (P, Q) alternations run.
    pub iterations: usize,
}

impl BcdOutput {
    pub fn loss_history(&self) -> Vec<f64> {
        self.loss.iter().map(|l| l.total).collect()
    }
}

/// One configured BCD run over a cost builder.
pub struct Bcd<'a, C: FusedCost> {
    cost: &'a C,
    ws: &'a Array1<f64>,
    wt: &'a Array1<f64>,
    hyper: Hyperparams,
    solver: UotSolver,
    bcd: BcdConfig,
    uot: UotConfig,
}

impl<'a, C: FusedCost> Bcd<'a, C> {
    /// Validate the configuration against the cost's support.
    ///
    /// MM cannot enforce a hard marginal, so it is rejected here with an
    /// infinite `rho`.
    pub fn new(
        cost: &'a C,
        ws: &'a Array1<f64>,
        wt: &'a Array1<f64>,
        hyper: Hyperparams,
        solver: UotSolver,
        bcd: BcdConfig,
        uot: UotConfig,
    ) -> Result<Self> {
        hyper.validate()?;
        bcd.validate()?;
        uot.validate()?;
        if solver == UotSolver::Mm && (hyper.rho_s.is_infinite() || hyper.rho_t.is_infinite()) {
            return Err(Error::Domain("mm solver needs finite rho_s and rho_t"));
        }
        let (n, m) = cost.support().shape();
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
        Ok(Self {
            cost,
            ws,
            wt,
            hyper,
            solver,
            bcd,
            uot,
        })
    }

    /// Alternate P and Q half-steps from `init` until a stopping rule fires.
    pub fn run(&self, init: BcdInit) -> Result<BcdOutput> {
        let len = self.cost.support().len();
        for plan in [&init.pi, &init.gamma] {
            if plan.len() != len {
                return Err(Error::LengthMismatch {
                    what: "initial plan vs support entries",
                    expected: len,
                    got: plan.len(),
                });
            }
            if plan.iter().any(|&p| !(p >= 0.0) || !p.is_finite()) {
                return Err(Error::Domain("initial plan must be nonnegative and finite"));
            }
        }

        let BcdInit {
            mut pi,
            mut gamma,
            mut duals_pi,
            mut duals_gamma,
        } = init;
        let mut state = BcdState::Initializing;

        let mut loss = vec![self.loss(&pi, &gamma, 0)?];
        let mut loss_steps = vec![0];
        debug!("bcd 0: loss {:.6e} ({} solver)", loss[0].total, self.solver);

        let mut iterations = 0;
        for idx in 0..self.bcd.nits_bcd {
            let pi_prev = pi.clone();

            state = BcdState::OptimizingP;
            trace!("bcd {}: {:?}", idx + 1, state);
            let (next, duals) = self.half_step(&gamma, &pi, duals_pi.as_ref(), idx)?;
            pi = next;
            duals_pi = Some(duals);

            state = BcdState::OptimizingQ;
            trace!("bcd {}: {:?}", idx + 1, state);
            let (next, duals) = self.half_step(&pi, &gamma, duals_gamma.as_ref(), idx)?;
            gamma = next;
            duals_gamma = Some(duals);
            iterations = idx + 1;

            if idx % self.bcd.eval_bcd != 0 {
                continue;
            }

            let err: f64 = pi.iter().zip(pi_prev.iter()).map(|(a, b)| (a - b).abs()).sum();
            let terms = self.loss(&pi, &gamma, iterations)?;
            debug!(
                "bcd {}: loss {:.6e}, plan change {:.3e}, mass {:.6e}",
                iterations,
                terms.total,
                err,
                pi.sum()
            );
            loss.push(terms);
            loss_steps.push(iterations);

            if err < self.bcd.tol_bcd {
                debug!("bcd converged on plan change after {} iterations", iterations);
                state = BcdState::Converged;
                break;
            }
            if terms.total < self.bcd.early_stopping_threshold {
                debug!("bcd loss below early stopping threshold after {} iterations", iterations);
                state = BcdState::Converged;
                break;
            }
        }

        if state != BcdState::Converged {
            warn!(
                "bcd stopped after nits_bcd = {} iterations without converging",
                self.bcd.nits_bcd
            );
            state = BcdState::MaxIterationsReached;
        }

        Ok(BcdOutput {
            pi,
            gamma,
            duals_pi,
            duals_gamma,
            loss,
            loss_steps,
            state,
            iterations,
        })
    }

    fn loss(&self, pi: &Array1<f64>, gamma: &Array1<f64>, iteration: usize) -> Result<LossTerms> {
        let terms = fugw_loss(self.cost, pi, gamma, self.ws, self.wt, &self.hyper)?;
        if !terms.total.is_finite() {
            return Err(Error::NumericalInstability {
                solver: "bcd",
                iteration,
            });
        }
        Ok(terms)
    }

    /// Best `X` given the fixed plan `other`, then `X ← sqrt(m(other) / m(X)) · X`.
    fn half_step(
        &self,
        other: &Array1<f64>,
        current: &Array1<f64>,
        duals: Option<&Duals>,
        iteration: usize,
    ) -> Result<(Array1<f64>, Duals)> {
        let support = self.cost.support();
        let Hyperparams {
            alpha,
            rho_s,
            rho_t,
            eps,
            reg_mode,
        } = self.hyper;

        let mass = other.sum();
        if !(mass > 0.0) || !mass.is_finite() {
            return Err(Error::NumericalInstability {
                solver: "bcd",
                iteration,
            });
        }

        let mut shift = 0.0;
        if rho_s.is_finite() {
            shift += rho_s * approx_kl(&support.row_sums(other), self.ws);
        }
        if rho_t.is_finite() {
            shift += rho_t * approx_kl(&support.col_sums(other), self.wt);
        }
        let eps_eff = match reg_mode {
            RegMode::Joint => {
                shift += eps * plan_approx_kl(support, other, self.ws, self.wt);
                eps * mass
            }
            RegMode::Independent => eps,
        };

        let mut cost = self.cost.gw_cost(other)?;
        let feature = self.cost.feature_cost();
        cost.zip_mut_with(feature, |t, &c| *t = alpha * *t + (1.0 - alpha) / 2.0 * c + shift);

        let params = UotParams {
            rho_s: rho_s * mass,
            rho_t: rho_t * mass,
            eps: eps_eff,
        };
        let problem = UotProblem::new(support, &cost, self.ws, self.wt, params)?;
        let out = self.solver.solve(&problem, current, duals, &self.uot)?;

        let new_mass = out.plan.sum();
        if !(new_mass > 0.0) || !new_mass.is_finite() {
            return Err(Error::NumericalInstability {
                solver: self.solver.name(),
                iteration,
            });
        }
        let plan = out.plan * (mass / new_mass).sqrt();
        trace!(
            "bcd {}: half-step with {} inner iterations, mass {:.6e}",
            iteration,
            out.iterations,
            plan.sum()
        );
        Ok((plan, out.duals))
    }
}
