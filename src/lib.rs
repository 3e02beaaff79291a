//! # fugw
//!
//! Fused Unbalanced Gromov-Wasserstein transport: align two weighted point sets
//! using both what the points *are* (features) and how they *sit* relative to
//! each other (geometry), while allowing mass to be created or destroyed.
//!
//! ## The Problem
//!
//! Given a source distribution (weights `ws`, features `Fs`, geometry `Ds`) and a
//! target distribution (`wt`, `Ft`, `Dt`), find a nonnegative plan `P` minimizing
//!
//! ```text
//! (1-α)/2 (<C,P> + <C,Q>)                      feature (Wasserstein) term
//!   + α Σ (Ds_ik - Dt_jl)² P_ij Q_kl           geometry (Gromov-Wasserstein) term
//!   + ρs KL(P1⊗Q1 | ws⊗ws) + ρt KL(Pᵀ1⊗Qᵀ1 | wt⊗wt)   relaxed marginals
//!   + ε KL(P⊗Q | (ws⊗wt)⊗(ws⊗wt))              entropy
//! ```
//!
//! over the lifted pair `(P, Q)`. The objective is minimized by block-coordinate
//! descent: each half-step fixes one plan and solves a convex entropic unbalanced
//! OT problem for the other.
//!
//! ## Key Types
//!
//! | Type | Use Case | Memory |
//! |------|----------|--------|
//! | [`FugwDense`] | Full geometry matrices, dense plan | O(n² + m² + nm) |
//! | [`FugwSparse`] | Geometry embeddings, plan on a fixed mask | O((n + m)k² + nnz) |
//! | [`coarse_to_fine::fit`] | Derive the mask from a coarse dense solve | coarse + fine |
//! | [`lmds::compute_lmds_mesh`] | Mesh → low-rank geodesic embedding | O(L·n) |
//!
//! The inner solver is chosen per fit with [`UotSolver`]: log-domain Sinkhorn,
//! majorize-minimization, or inexact Bregman proximal point. All three solve the
//! same sub-problem and share one contract ([`uot::UotProblem`] → [`uot::UotOutput`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use fugw::{Distribution, FitOptions, FugwDense, Geometry, Hyperparams};
//! use ndarray::{array, Array2};
//!
//! let geometry = array![[0.0, 1.0, 4.0], [1.0, 0.0, 1.0], [4.0, 1.0, 0.0]];
//! let features = array![[0.0, 0.5, 1.0]];
//! let source = Distribution::uniform(features.clone(), Geometry::Matrix(geometry.clone())).unwrap();
//! let target = Distribution::uniform(features, Geometry::Matrix(geometry)).unwrap();
//!
//! let mut mapping = FugwDense::new(Hyperparams::default()).unwrap();
//! let report = mapping.fit(&source, &target, None, &FitOptions::default()).unwrap();
//! assert!(!report.loss_history().is_empty());
//!
//! let moved: Array2<f64> = mapping.transform(&array![[1.0, 2.0, 3.0]]).unwrap();
//! assert_eq!(moved.dim(), (1, 3));
//! ```
//!
//! ## What Can Go Wrong
//!
//! 1. **Numerical instability**: tiny `eps` relative to the cost scale can overflow
//!    the scalings. Reported as [`Error::NumericalInstability`]; rescale the
//!    geometry or raise `eps` (or use [`UotSolver::Ibpp`]).
//! 2. **Not converged**: hitting `nits_bcd` is a normal outcome
//!    ([`BcdState::MaxIterationsReached`]); the plan is still returned.
//! 3. **Empty mask**: coarse-to-fine radii too small for the sampled pairs.
//!    Reported as [`Error::EmptyMask`].
//!
//! ## References
//!
//! - Thual et al. (2022). "Aligning individual brains with Fused Unbalanced
//!   Gromov-Wasserstein"
//! - Séjourné, Vialard, Peyré (2021). "The Unbalanced Gromov Wasserstein Distance"
//! - Chapel et al. (2021). "Unbalanced Optimal Transport through Non-negative
//!   Penalized Linear Regression"
//! - Xie et al. (2020). "A Fast Proximal Point Method for Computing Exact
//!   Wasserstein Distance"
//! - de Silva & Tenenbaum (2004). "Sparse multidimensional scaling using landmark points"

use thiserror::Error;

pub mod bcd;
pub mod coarse_to_fine;
pub mod config;
pub mod cost;
pub mod dense;
pub mod distribution;
pub mod ibpp;
pub mod lmds;
pub mod loss;
pub mod mm;
pub mod sinkhorn;
pub mod sparse;
pub mod support;
pub mod uot;

pub use bcd::{BcdOutput, BcdState};
pub use config::{BcdConfig, Device, Hyperparams, RegMode, UotConfig, UotSolver};
pub use dense::{FitOptions, FitReport, FugwDense};
pub use distribution::{Distribution, Geometry};
pub use loss::LossTerms;
pub use sparse::{FugwSparse, SparsePlan};
pub use support::{DenseSupport, Support, SupportMask};
pub use uot::Duals;

/// FUGW error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// Two arrays that must have the same length do not.
    #[error("length mismatch for {what}: expected {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A matrix does not have the expected shape.
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// `alpha` outside `[0, 1]`.
    #[error("alpha must lie in [0, 1], got {0}")]
    InvalidAlpha(f64),

    /// Invalid regularization parameter.
    #[error("regularization parameter must be positive and finite, got {0}")]
    InvalidRegularization(f64),

    /// Invalid mass-variation penalty parameter.
    #[error("mass penalty parameter must be positive (or +inf), got {0}")]
    InvalidMassPenalty(f64),

    /// Domain error (invalid inputs for the mathematical definition).
    #[error("{0}")]
    Domain(&'static str),

    /// A solver name that does not match any known solver.
    #[error("unknown solver {0:?} (expected \"sinkhorn\", \"mm\" or \"ibpp\")")]
    UnknownSolver(String),

    /// A support index lies outside the plan shape.
    #[error("support entry ({row}, {col}) lies outside a ({n_rows}, {n_cols}) plan")]
    OutOfSupport {
        row: usize,
        col: usize,
        n_rows: usize,
        n_cols: usize,
    },

    /// A support mask with no entries.
    #[error("support mask is empty: {0}")]
    EmptyMask(&'static str),

    /// Non-finite values produced while iterating.
    #[error("non-finite values in {solver} at iteration {iteration}; try a larger eps or rescaled costs")]
    NumericalInstability {
        solver: &'static str,
        iteration: usize,
    },

    /// Mesh has vertices unreachable from a landmark.
    #[error("mesh is disconnected: vertex {vertex} is unreachable from landmark {landmark}")]
    DisconnectedMesh { landmark: usize, vertex: usize },

    /// `transform` or `score` called before `fit`.
    #[error("mapping has not been fitted")]
    NotFitted,

    /// Building the worker pool failed.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    /// Array reshaping failed.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl Error {
    /// `true` for errors detected on the inputs before any iteration ran.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            Error::NumericalInstability { .. } | Error::WorkerPool(_)
        )
    }
}

/// Result type for FUGW operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Numerically stable \(\log \sum_i \exp(x_i)\) for an indexable family.
///
/// \[
/// \log \sum_i \exp(x_i) = m + \log \sum_i \exp(x_i - m), \quad m = \max_i x_i
/// \]
///
/// Returns `-∞` if `len == 0`.
#[inline]
pub(crate) fn logsumexp_by(len: usize, mut f: impl FnMut(usize) -> f64) -> f64 {
    if len == 0 {
        return f64::NEG_INFINITY;
    }

    let mut max_val = f64::NEG_INFINITY;
    for i in 0..len {
        max_val = max_val.max(f(i));
    }
    if !max_val.is_finite() {
        // If everything is -inf (or NaN), propagate the max.
        return max_val;
    }

    let mut sum_exp = 0.0;
    for i in 0..len {
        sum_exp += (f(i) - max_val).exp();
    }
    max_val + sum_exp.ln()
}

/// `ln(x)` with `ln(0) = -∞` and no NaN for tiny negatives from float noise.
#[inline]
pub(crate) fn safe_ln(x: f64) -> f64 {
    if x <= 0.0 {
        f64::NEG_INFINITY
    } else {
        x.ln()
    }
}

pub(crate) fn ensure_finite<'a>(
    values: impl IntoIterator<Item = &'a f64>,
    solver: &'static str,
    iteration: usize,
) -> Result<()> {
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::NumericalInstability { solver, iteration })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn logsumexp_empty_is_neg_inf() {
        assert_eq!(logsumexp_by(0, |_| 0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn logsumexp_all_neg_inf_stays_neg_inf() {
        assert_eq!(logsumexp_by(3, |_| f64::NEG_INFINITY), f64::NEG_INFINITY);
    }

    #[test]
    fn ensure_finite_reports_solver_and_iteration() {
        let err = ensure_finite(&[1.0, f64::NAN], "sinkhorn", 7).unwrap_err();
        match err {
            Error::NumericalInstability { solver, iteration } => {
                assert_eq!(solver, "sinkhorn");
                assert_eq!(iteration, 7);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!Error::NumericalInstability { solver: "mm", iteration: 0 }.is_validation());
        assert!(Error::EmptyMask("no pairs").is_validation());
    }

    proptest! {
        #[test]
        fn logsumexp_translation_invariant(
            xs in prop::collection::vec(-50.0f64..50.0, 1..64),
            shift in -10.0f64..10.0
        ) {
            let l1 = logsumexp_by(xs.len(), |i| xs[i]);
            let l2 = logsumexp_by(xs.len(), |i| xs[i] + shift);
            prop_assert!((l2 - (l1 + shift)).abs() < 1e-9);
        }

        #[test]
        fn logsumexp_matches_naive_on_safe_range(
            xs in prop::collection::vec(-20.0f64..20.0, 1..64),
        ) {
            let naive = xs.iter().map(|&x| x.exp()).sum::<f64>().ln();
            let stable = logsumexp_by(xs.len(), |i| xs[i]);
            prop_assert!((stable - naive).abs() < 1e-9);
        }

        #[test]
        fn logsumexp_bounds_by_max(
            xs in prop::collection::vec(-50.0f64..50.0, 1..64),
        ) {
            let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let lse = logsumexp_by(xs.len(), |i| xs[i]);
            prop_assert!(lse >= max - 1e-9);
            prop_assert!(lse <= max + (xs.len() as f64).ln() + 1e-9);
        }
    }
}
