//! Dense plan engine.
//!
//! Holds the fitted `n × m` plan and maps feature maps between the two
//! distributions through it.

use crate::bcd::{product_plan, Bcd, BcdInit, BcdOutput, BcdState};
use crate::config::{BcdConfig, Device, UotConfig, UotSolver};
use crate::cost::{DenseCost, FusedCost};
use crate::loss::LossTerms;
use crate::uot::Duals;
use crate::{Distribution, Error, Hyperparams, Result};
use log::info;
use ndarray::{Array1, Array2, Axis};

/// Per-fit options: solver choice, both iteration schedules, device, warm start.
#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    pub solver: UotSolver,
    pub bcd: BcdConfig,
    pub uot: UotConfig,
    pub device: Device,
    /// Duals for the (P, Q) half-steps of the first BCD iteration.
    pub init_duals: Option<(Duals, Duals)>,
}

/// What a fit reports besides the plan.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub loss: Vec<LossTerms>,
    pub loss_steps: Vec<usize>,
    pub state: BcdState,
    pub iterations: usize,
}

impl FitReport {
    pub fn loss_history(&self) -> Vec<f64> {
        self.loss.iter().map(|l| l.total).collect()
    }

    pub fn converged(&self) -> bool {
        self.state == BcdState::Converged
    }
}

impl From<&BcdOutput> for FitReport {
    fn from(out: &BcdOutput) -> Self {
        Self {
            loss: out.loss.clone(),
            loss_steps: out.loss_steps.clone(),
            state: out.state,
            iterations: out.iterations,
        }
    }
}

pub(crate) fn bcd_init(plan: Array1<f64>, options: &FitOptions) -> BcdInit {
    let mut init = BcdInit::from_plan(plan);
    if let Some((dp, dg)) = &options.init_duals {
        init.duals_pi = Some(dp.clone());
        init.duals_gamma = Some(dg.clone());
    }
    init
}

/// FUGW between two distributions with a full `n × m` plan.
#[derive(Debug, Clone)]
pub struct FugwDense {
    hyper: Hyperparams,
    plan: Option<Array2<f64>>,
    duals: Option<(Duals, Duals)>,
}

impl FugwDense {
    /// Unfitted mapping; `hyper` is validated here.
    pub fn new(hyper: Hyperparams) -> Result<Self> {
        hyper.validate()?;
        Ok(Self {
            hyper,
            plan: None,
            duals: None,
        })
    }

    pub fn hyperparams(&self) -> &Hyperparams {
        &self.hyper
    }

    /// Fit the plan between `source` and `target`.
    ///
    /// Without `init_plan`, both BCD plans start at `ws⊗wt / sqrt(Σws·Σwt)`.
    /// On error the previously fitted plan (if any) is kept.
    pub fn fit(
        &mut self,
        source: &Distribution,
        target: &Distribution,
        init_plan: Option<&Array2<f64>>,
        options: &FitOptions,
    ) -> Result<FitReport> {
        let (n, m) = (source.len(), target.len());
        info!(
            "fitting dense FUGW: {} x {} plan, solver {}, alpha {}, eps {}",
            n, m, options.solver, self.hyper.alpha, self.hyper.eps
        );
        let cost = DenseCost::new(source, target, options.device)?;

        let flat = match init_plan {
            Some(p) => {
                if p.dim() != (n, m) {
                    return Err(Error::ShapeMismatch {
                        what: "initial plan",
                        expected: (n, m),
                        got: p.dim(),
                    });
                }
                Array1::from_iter(p.iter().copied())
            }
            None => product_plan(cost.support(), source.weights(), target.weights()),
        };

        let out = Bcd::new(
            &cost,
            source.weights(),
            target.weights(),
            self.hyper,
            options.solver,
            options.bcd,
            options.uot,
        )?
        .run(bcd_init(flat, options))?;

        let report = FitReport::from(&out);
        info!(
            "dense FUGW done: {:?} after {} iterations, final loss {:.6e}",
            report.state,
            report.iterations,
            report.loss.last().map_or(f64::NAN, |l| l.total)
        );
        self.plan = Some(out.pi.into_shape_with_order((n, m))?);
        self.duals = out.duals_pi.zip(out.duals_gamma);
        Ok(report)
    }

    /// Fitted plan `P` (n × m).
    pub fn plan(&self) -> Option<&Array2<f64>> {
        self.plan.as_ref()
    }

    /// Duals of the last (P, Q) half-steps.
    pub fn duals(&self) -> Option<&(Duals, Duals)> {
        self.duals.as_ref()
    }

    /// Map source features `(d, n)` to the target: `(d, m)`.
    pub fn transform(&self, features: &Array2<f64>) -> Result<Array2<f64>> {
        let plan = self.plan.as_ref().ok_or(Error::NotFitted)?;
        check_cols("source features", features, plan.nrows())?;
        Ok(divide_columns(features.dot(plan), &plan.sum_axis(Axis(0))))
    }

    /// Map target features `(d, m)` back to the source: `(d, n)`.
    pub fn inverse_transform(&self, features: &Array2<f64>) -> Result<Array2<f64>> {
        let plan = self.plan.as_ref().ok_or(Error::NotFitted)?;
        check_cols("target features", features, plan.ncols())?;
        Ok(divide_columns(features.dot(&plan.t()), &plan.sum_axis(Axis(1))))
    }

    /// Negative mean squared error between the transported source features and
    /// `target_features`. Higher is better.
    pub fn score(&self, source_features: &Array2<f64>, target_features: &Array2<f64>) -> Result<f64> {
        neg_mse(&self.transform(source_features)?, target_features)
    }
}

pub(crate) fn check_cols(what: &'static str, features: &Array2<f64>, expected: usize) -> Result<()> {
    if features.ncols() != expected {
        return Err(Error::LengthMismatch {
            what,
            expected,
            got: features.ncols(),
        });
    }
    Ok(())
}

/// Divide column `j` by `sums[j]`; columns with no mass become zero.
pub(crate) fn divide_columns(mut mapped: Array2<f64>, sums: &Array1<f64>) -> Array2<f64> {
    for (mut col, &s) in mapped.axis_iter_mut(Axis(1)).zip(sums.iter()) {
        if s > 0.0 {
            col /= s;
        } else {
            col.fill(0.0);
        }
    }
    mapped
}

pub(crate) fn neg_mse(predicted: &Array2<f64>, expected: &Array2<f64>) -> Result<f64> {
    if predicted.dim() != expected.dim() {
        return Err(Error::ShapeMismatch {
            what: "target features",
            expected: predicted.dim(),
            got: expected.dim(),
        });
    }
    let sq: f64 = predicted
        .iter()
        .zip(expected.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum();
    Ok(-sq / predicted.len().max(1) as f64)
}
