//! Hyperparameters and iteration schedules.
//!
//! The outer BCD loop and the inner sub-solver loops each get their own struct,
//! passed by value into every fit. Nothing here is global.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How the entropic penalties of the two half-plans combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RegMode {
    /// `eps · KL(P⊗Q | w⊗w)`: one penalty on the lifted plan, scaled by mass.
    #[default]
    Joint,
    /// `eps · (KL(P | w) + KL(Q | w))`.
    Independent,
}

/// FUGW model hyperparameters, fixed for the duration of one fit.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Hyperparams {
    /// Balance between the Gromov-Wasserstein term (`alpha`) and the feature
    /// term (`1 - alpha`).
    pub alpha: f64,
    /// Source marginal penalty. `f64::INFINITY` enforces the marginal.
    pub rho_s: f64,
    /// Target marginal penalty. `f64::INFINITY` enforces the marginal.
    pub rho_t: f64,
    /// Entropic regularization strength.
    pub eps: f64,
    pub reg_mode: RegMode,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            rho_s: 1.0,
            rho_t: 1.0,
            eps: 1e-2,
            reg_mode: RegMode::Joint,
        }
    }
}

impl Hyperparams {
    /// Same `rho` on both sides.
    pub fn new(alpha: f64, rho: f64, eps: f64) -> Self {
        Self {
            alpha,
            rho_s: rho,
            rho_t: rho,
            eps,
            reg_mode: RegMode::Joint,
        }
    }

    pub fn with_reg_mode(mut self, reg_mode: RegMode) -> Self {
        self.reg_mode = reg_mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::InvalidAlpha(self.alpha));
        }
        if !(self.eps > 0.0) || !self.eps.is_finite() {
            return Err(Error::InvalidRegularization(self.eps));
        }
        for rho in [self.rho_s, self.rho_t] {
            // NaN fails the comparison too.
            if !(rho > 0.0) {
                return Err(Error::InvalidMassPenalty(rho));
            }
        }
        Ok(())
    }
}

/// Outer block-coordinate-descent schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BcdConfig {
    /// Maximum number of full (P, Q) alternations.
    pub nits_bcd: usize,
    /// Stop when `Σ|P - P_prev|` falls below this.
    pub tol_bcd: f64,
    /// Evaluate loss and convergence every `eval_bcd` alternations.
    pub eval_bcd: usize,
    /// Stop when a recorded FUGW loss falls below this.
    pub early_stopping_threshold: f64,
}

impl Default for BcdConfig {
    fn default() -> Self {
        Self {
            nits_bcd: 10,
            tol_bcd: 1e-7,
            eval_bcd: 1,
            early_stopping_threshold: 1e-6,
        }
    }
}

impl BcdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eval_bcd == 0 {
            return Err(Error::Domain("eval_bcd must be >= 1"));
        }
        if self.tol_bcd < 0.0 || self.early_stopping_threshold < 0.0 {
            return Err(Error::Domain("BCD tolerances must be nonnegative"));
        }
        Ok(())
    }
}

/// Inner sub-solver schedule, shared by all three solvers.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UotConfig {
    /// Maximum iterations (outer proximal steps for IBPP).
    pub nits_uot: usize,
    pub tol_uot: f64,
    /// Check the stopping criterion every `eval_uot` iterations.
    pub eval_uot: usize,
    /// Proximal strength of IBPP.
    pub ibpp_eps_base: f64,
    /// Sinkhorn sweeps per IBPP proximal step.
    pub ibpp_nits_sinkhorn: usize,
}

impl Default for UotConfig {
    fn default() -> Self {
        Self {
            nits_uot: 1000,
            tol_uot: 1e-7,
            eval_uot: 10,
            ibpp_eps_base: 1.0,
            ibpp_nits_sinkhorn: 1,
        }
    }
}

impl UotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eval_uot == 0 {
            return Err(Error::Domain("eval_uot must be >= 1"));
        }
        if self.tol_uot < 0.0 {
            return Err(Error::Domain("tol_uot must be nonnegative"));
        }
        if !(self.ibpp_eps_base > 0.0) || !self.ibpp_eps_base.is_finite() {
            return Err(Error::InvalidRegularization(self.ibpp_eps_base));
        }
        if self.ibpp_nits_sinkhorn == 0 {
            return Err(Error::Domain("ibpp_nits_sinkhorn must be >= 1"));
        }
        Ok(())
    }
}

/// Inner solver used for each BCD half-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UotSolver {
    /// Log-domain unbalanced Sinkhorn scaling.
    #[default]
    Sinkhorn,
    /// Majorize-minimization multiplicative updates.
    Mm,
    /// Inexact Bregman proximal point around an inner Sinkhorn loop.
    Ibpp,
}

impl UotSolver {
    pub fn name(&self) -> &'static str {
        match self {
            UotSolver::Sinkhorn => "sinkhorn",
            UotSolver::Mm => "mm",
            UotSolver::Ibpp => "ibpp",
        }
    }
}

impl fmt::Display for UotSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UotSolver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sinkhorn" => Ok(UotSolver::Sinkhorn),
            "mm" => Ok(UotSolver::Mm),
            "ibpp" => Ok(UotSolver::Ibpp),
            _ => Err(Error::UnknownSolver(s.to_string())),
        }
    }
}

/// Where the dense kernels run.
///
/// `Parallel` spreads cost construction across the rayon global pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Device {
    #[default]
    Cpu,
    Parallel,
}
