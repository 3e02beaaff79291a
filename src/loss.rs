//! KL divergences and the FUGW objective.
//!
//! All divergences here are the *generalized* KL between nonnegative measures:
//!
//! \[
//! \mathrm{KL}(p \,\|\, q) = \sum_i p_i \log(p_i / q_i) - p_i + q_i
//! \]
//!
//! with `0 log 0 = 0`, and `+∞` when `p_i > 0` but `q_i = 0`.

use crate::config::RegMode;
use crate::cost::FusedCost;
use crate::support::Support;
use crate::{Hyperparams, Result};
use ndarray::Array1;

/// Generalized KL divergence `KL(p | q)`.
pub fn kl(p: &Array1<f64>, q: &Array1<f64>) -> f64 {
    let mut s = 0.0;
    for (&pi, &qi) in p.iter().zip(q.iter()) {
        if pi <= 0.0 {
            s += qi;
            continue;
        }
        if qi <= 0.0 {
            return f64::INFINITY;
        }
        s += pi * (pi / qi).ln() - pi + qi;
    }
    s
}

/// `Σ p log(p / q)`, the linear part of `KL(p | q)` without the mass terms.
///
/// Entries with `p = 0` contribute nothing.
pub fn approx_kl(p: &Array1<f64>, q: &Array1<f64>) -> f64 {
    p.iter()
        .zip(q.iter())
        .filter(|(&pi, _)| pi > 0.0)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum()
}

/// `KL(μ⊗ν | a⊗b)` from the factors, without forming the products:
///
/// ```text
/// m(ν) KL(μ|a) + m(μ) KL(ν|b) + (m(μ) − m(a)) (m(ν) − m(b))
/// ```
pub fn quad_kl(mu: &Array1<f64>, nu: &Array1<f64>, a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let (m_mu, m_nu) = (mu.sum(), nu.sum());
    m_nu * kl(mu, a) + m_mu * kl(nu, b) + (m_mu - a.sum()) * (m_nu - b.sum())
}

/// `KL(P | ws⊗wt)` for a plan stored on `support`.
///
/// The reference mass is the full `Σws·Σwt`, also for a partial support.
pub fn plan_kl<S: Support>(support: &S, plan: &Array1<f64>, ws: &Array1<f64>, wt: &Array1<f64>) -> f64 {
    let mut s = ws.sum() * wt.sum();
    for (k, &p) in plan.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        let (i, j) = support.entry(k);
        let r = ws[i] * wt[j];
        if r <= 0.0 {
            return f64::INFINITY;
        }
        s += p * (p / r).ln() - p;
    }
    s
}

/// `Σ P log(P / ws⊗wt)` over the support.
pub fn plan_approx_kl<S: Support>(
    support: &S,
    plan: &Array1<f64>,
    ws: &Array1<f64>,
    wt: &Array1<f64>,
) -> f64 {
    plan.iter()
        .enumerate()
        .filter(|(_, &p)| p > 0.0)
        .map(|(k, &p)| {
            let (i, j) = support.entry(k);
            p * (p / (ws[i] * wt[j])).ln()
        })
        .sum()
}

/// FUGW loss split by term.
///
/// `wasserstein` and `gromov_wasserstein` are reported unweighted; the other
/// terms already carry their `rho`/`eps` factor. `total` is the weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossTerms {
    /// `(<C,P> + <C,Q>) / 2`
    pub wasserstein: f64,
    /// `<G(Q), P>`
    pub gromov_wasserstein: f64,
    pub marginal_source: f64,
    pub marginal_target: f64,
    pub regularization: f64,
    pub total: f64,
}

/// Evaluate the FUGW loss of the pair `(pi, gamma)`.
pub fn fugw_loss<C: FusedCost>(
    cost: &C,
    pi: &Array1<f64>,
    gamma: &Array1<f64>,
    ws: &Array1<f64>,
    wt: &Array1<f64>,
    hyper: &Hyperparams,
) -> Result<LossTerms> {
    let support = cost.support();
    let c = cost.feature_cost();
    let wasserstein = (c.dot(pi) + c.dot(gamma)) / 2.0;
    let gromov_wasserstein = cost.gw_cost(gamma)?.dot(pi);

    let marginal_source = if hyper.rho_s.is_finite() {
        hyper.rho_s * quad_kl(&support.row_sums(pi), &support.row_sums(gamma), ws, ws)
    } else {
        0.0
    };
    let marginal_target = if hyper.rho_t.is_finite() {
        hyper.rho_t * quad_kl(&support.col_sums(pi), &support.col_sums(gamma), wt, wt)
    } else {
        0.0
    };

    let regularization = hyper.eps
        * match hyper.reg_mode {
            RegMode::Joint => {
                let (m_pi, m_gamma) = (pi.sum(), gamma.sum());
                let m_ref = ws.sum() * wt.sum();
                m_gamma * plan_kl(support, pi, ws, wt)
                    + m_pi * plan_kl(support, gamma, ws, wt)
                    + (m_pi - m_ref) * (m_gamma - m_ref)
            }
            RegMode::Independent => plan_kl(support, pi, ws, wt) + plan_kl(support, gamma, ws, wt),
        };

    let total = (1.0 - hyper.alpha) * wasserstein
        + hyper.alpha * gromov_wasserstein
        + marginal_source
        + marginal_target
        + regularization;

    Ok(LossTerms {
        wasserstein,
        gromov_wasserstein,
        marginal_source,
        marginal_target,
        regularization,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::DenseCost;
    use crate::support::DenseSupport;
    use crate::{Device, Distribution, Geometry};
    use ndarray::{array, Array2};
    use proptest::prelude::*;

    fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(a.len() * b.len(), |k| a[k / b.len()] * b[k % b.len()])
    }

    #[test]
    fn kl_handles_zeros() {
        assert_eq!(kl(&array![0.0, 1.0], &array![0.5, 1.0]), 0.5);
        assert_eq!(kl(&array![1.0], &array![0.0]), f64::INFINITY);
        assert_eq!(approx_kl(&array![0.0, 2.0], &array![1.0, 2.0]), 0.0);
    }

    #[test]
    fn plan_kl_matches_flat_kl_on_dense_support() {
        let ws = array![0.2, 0.3, 0.5];
        let wt = array![0.6, 0.4];
        let plan = array![0.1, 0.05, 0.2, 0.1, 0.25, 0.3];
        let s = DenseSupport::new(3, 2);
        let reference = outer(&ws, &wt);
        assert!((plan_kl(&s, &plan, &ws, &wt) - kl(&plan, &reference)).abs() < 1e-12);
        assert!((plan_approx_kl(&s, &plan, &ws, &wt) - approx_kl(&plan, &reference)).abs() < 1e-12);
    }

    #[test]
    fn balanced_identity_pair_has_only_entropy_and_w_terms() {
        let g = array![[0.0, 1.0], [1.0, 0.0]];
        let f = array![[0.0, 1.0]];
        let d = Distribution::uniform(f, Geometry::Matrix(g)).unwrap();
        let cost = DenseCost::new(&d, &d, Device::Cpu).unwrap();
        let plan = array![0.5, 0.0, 0.0, 0.5];
        let hyper = Hyperparams::new(0.5, 1.0, 1e-3);
        let terms = fugw_loss(&cost, &plan, &plan, d.weights(), d.weights(), &hyper).unwrap();
        assert!(terms.wasserstein.abs() < 1e-12);
        assert!(terms.gromov_wasserstein.abs() < 1e-12);
        assert!(terms.marginal_source.abs() < 1e-12);
        assert!(terms.marginal_target.abs() < 1e-12);
        assert!(terms.regularization > 0.0);
        let sum = 0.5 * terms.wasserstein
            + 0.5 * terms.gromov_wasserstein
            + terms.marginal_source
            + terms.marginal_target
            + terms.regularization;
        assert!((terms.total - sum).abs() < 1e-12);
    }

    #[test]
    fn infinite_rho_drops_marginal_terms() {
        let g = Array2::from_shape_fn((3, 3), |(i, j)| (i as f64 - j as f64).abs());
        let d = Distribution::uniform(array![[0.0, 1.0, 2.0]], Geometry::Matrix(g)).unwrap();
        let cost = DenseCost::new(&d, &d, Device::Cpu).unwrap();
        let plan = Array1::from_elem(9, 0.2);
        let hyper = Hyperparams::new(0.5, f64::INFINITY, 0.1);
        let terms = fugw_loss(&cost, &plan, &plan, d.weights(), d.weights(), &hyper).unwrap();
        assert_eq!(terms.marginal_source, 0.0);
        assert_eq!(terms.marginal_target, 0.0);
    }

    proptest! {
        #[test]
        fn quad_kl_matches_kl_of_products(
            mu in prop::collection::vec(0.01f64..2.0, 3),
            nu in prop::collection::vec(0.01f64..2.0, 2),
            a in prop::collection::vec(0.01f64..2.0, 3),
            b in prop::collection::vec(0.01f64..2.0, 2),
        ) {
            let (mu, nu) = (Array1::from_vec(mu), Array1::from_vec(nu));
            let (a, b) = (Array1::from_vec(a), Array1::from_vec(b));
            let direct = kl(&outer(&mu, &nu), &outer(&a, &b));
            let factored = quad_kl(&mu, &nu, &a, &b);
            prop_assert!((direct - factored).abs() < 1e-9 * (1.0 + direct.abs()));
        }

        #[test]
        fn kl_is_nonnegative(
            p in prop::collection::vec(0.0f64..3.0, 5),
            q in prop::collection::vec(0.01f64..3.0, 5),
        ) {
            prop_assert!(kl(&Array1::from_vec(p), &Array1::from_vec(q)) >= -1e-12);
        }
    }
}
