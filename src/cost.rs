//! Cost tensors for the FUGW half-steps.
//!
//! The Gromov-Wasserstein term `Σ (Ds_ik − Dt_jl)² P_ij Q_kl` is never formed as
//! a 4-tensor. Its linearization around a plan `Q` is
//!
//! ```text
//! G(Q)_ij = (Ds∘Ds · q₁)_i + (Dt∘Dt · q₂)_j − 2 (Ds Q Dtᵀ)_ij
//! ```
//!
//! with `q₁ = Q1`, `q₂ = Qᵀ1`, so each half-step costs a constant number of
//! matrix products. With embeddings, `D = L Rᵀ` is kept factored ([`LowRank`])
//! and the products above run through the factors, evaluated only on the plan's
//! support.

use crate::distribution::squared_distances;
use crate::support::{DenseSupport, Support, SupportMask};
use crate::{Device, Distribution, Error, Geometry, Result};
use ndarray::{Array1, Array2, Axis, Zip};
use rayon::prelude::*;
use std::sync::Arc;

/// Everything a BCD half-step needs to know about the two distributions.
pub trait FusedCost {
    type Support: Support;

    fn support(&self) -> &Self::Support;

    /// Feature cost `C`, one value per support entry.
    fn feature_cost(&self) -> &Array1<f64>;

    /// Linearized GW cost `G(plan)`, one value per support entry.
    fn gw_cost(&self, plan: &Array1<f64>) -> Result<Array1<f64>>;
}

/// Squared Euclidean cost between feature columns.
///
/// C[i,j] = ‖Fs[:, i] − Ft[:, j]‖²
///
/// # Arguments
///
/// * `fs` - Source features (d × n)
/// * `ft` - Target features (d × m)
///
/// # Returns
///
/// Cost matrix (n × m)
pub fn feature_cost_matrix(fs: &Array2<f64>, ft: &Array2<f64>, device: Device) -> Result<Array2<f64>> {
    check_feature_dims(fs, ft)?;
    let sq_s = fs.map_axis(Axis(0), |c| c.dot(&c));
    let sq_t = ft.map_axis(Axis(0), |c| c.dot(&c));
    let mut cost = fs.t().dot(ft);

    let fill = |(i, j): (usize, usize), c: &mut f64| {
        // Clamp float noise from the expansion.
        *c = (sq_s[i] + sq_t[j] - 2.0 * *c).max(0.0);
    };
    match device {
        Device::Cpu => Zip::indexed(&mut cost).for_each(fill),
        Device::Parallel => Zip::indexed(&mut cost).par_for_each(fill),
    }
    Ok(cost)
}

/// Squared Euclidean feature cost evaluated only on the entries of `support`.
pub fn feature_cost_on_support<S: Support + Sync>(
    fs: &Array2<f64>,
    ft: &Array2<f64>,
    support: &S,
    device: Device,
) -> Result<Array1<f64>> {
    check_feature_dims(fs, ft)?;
    let entry_cost = |k: usize| {
        let (i, j) = support.entry(k);
        fs.column(i)
            .iter()
            .zip(ft.column(j).iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
    };
    let values: Vec<f64> = match device {
        Device::Cpu => (0..support.len()).map(entry_cost).collect(),
        Device::Parallel => (0..support.len()).into_par_iter().map(entry_cost).collect(),
    };
    Ok(Array1::from_vec(values))
}

fn check_feature_dims(fs: &Array2<f64>, ft: &Array2<f64>) -> Result<()> {
    if fs.nrows() != ft.nrows() {
        return Err(Error::LengthMismatch {
            what: "feature dimension (source vs target)",
            expected: fs.nrows(),
            got: ft.nrows(),
        });
    }
    Ok(())
}

/// Cost builder for full geometry matrices and a dense plan.
#[derive(Debug, Clone)]
pub struct DenseCost {
    support: DenseSupport,
    features: Array1<f64>,
    gs: Array2<f64>,
    gt: Array2<f64>,
    gs_sq: Array2<f64>,
    gt_sq: Array2<f64>,
}

impl DenseCost {
    /// Embedding geometries are expanded to their squared-distance matrices.
    pub fn new(source: &Distribution, target: &Distribution, device: Device) -> Result<Self> {
        let (n, m) = (source.len(), target.len());
        let features = feature_cost_matrix(source.features(), target.features(), device)?
            .into_shape_with_order(n * m)?;
        let gs = dense_geometry(source.geometry());
        let gt = dense_geometry(target.geometry());
        let gs_sq = gs.mapv(|x| x * x);
        let gt_sq = gt.mapv(|x| x * x);
        Ok(Self {
            support: DenseSupport::new(n, m),
            features,
            gs,
            gt,
            gs_sq,
            gt_sq,
        })
    }
}

fn dense_geometry(geometry: &Geometry) -> Array2<f64> {
    match geometry {
        Geometry::Matrix(d) => d.clone(),
        Geometry::Embedding(x) => squared_distances(x),
    }
}

impl FusedCost for DenseCost {
    type Support = DenseSupport;

    fn support(&self) -> &DenseSupport {
        &self.support
    }

    fn feature_cost(&self) -> &Array1<f64> {
        &self.features
    }

    fn gw_cost(&self, plan: &Array1<f64>) -> Result<Array1<f64>> {
        let (n, m) = self.support.shape();
        let p = plan.view().into_shape_with_order((n, m))?;
        let a = self.gs_sq.dot(&p.sum_axis(Axis(1)));
        let b = self.gt_sq.dot(&p.sum_axis(Axis(0)));
        let cross = self.gs.dot(&p).dot(&self.gt.t());
        Ok(Array1::from_shape_fn(n * m, |k| {
            let (i, j) = (k / m, k % m);
            a[i] + b[j] - 2.0 * cross[[i, j]]
        }))
    }
}

/// A matrix kept as `left · rightᵀ`.
#[derive(Debug, Clone)]
pub struct LowRank {
    left: Array2<f64>,
    right: Array2<f64>,
}

impl LowRank {
    /// Factors of `D_ij = ‖x_i − x_j‖²`: `L_i = [‖x_i‖², 1, −2x_i]`,
    /// `R_j = [1, ‖x_j‖², x_j]`, rank `k + 2`.
    pub fn squared_distances(x: &Array2<f64>) -> Self {
        let (n, k) = x.dim();
        let mut left = Array2::zeros((n, k + 2));
        let mut right = Array2::zeros((n, k + 2));
        for i in 0..n {
            let row = x.row(i);
            let sq = row.dot(&row);
            left[[i, 0]] = sq;
            left[[i, 1]] = 1.0;
            right[[i, 0]] = 1.0;
            right[[i, 1]] = sq;
            for c in 0..k {
                left[[i, c + 2]] = -2.0 * row[c];
                right[[i, c + 2]] = row[c];
            }
        }
        Self { left, right }
    }

    /// Factors of the elementwise square `D ∘ D`, via row-wise Kronecker
    /// products (rank r²).
    pub fn hadamard_square(&self) -> Self {
        Self {
            left: row_kron(&self.left),
            right: row_kron(&self.right),
        }
    }

    pub fn rank(&self) -> usize {
        self.left.ncols()
    }

    pub fn len(&self) -> usize {
        self.left.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `D v` without forming `D`.
    pub fn matvec(&self, v: &Array1<f64>) -> Array1<f64> {
        self.left.dot(&self.right.t().dot(v))
    }

    pub fn entry(&self, i: usize, j: usize) -> f64 {
        self.left.row(i).dot(&self.right.row(j))
    }
}

fn row_kron(a: &Array2<f64>) -> Array2<f64> {
    let (n, r) = a.dim();
    let mut out = Array2::zeros((n, r * r));
    for i in 0..n {
        for p in 0..r {
            let ap = a[[i, p]];
            for q in 0..r {
                out[[i, p * r + q]] = ap * a[[i, q]];
            }
        }
    }
    out
}

/// Cost builder for embedding geometries and a plan on a fixed mask.
#[derive(Debug, Clone)]
pub struct SparseCost {
    mask: Arc<SupportMask>,
    features: Array1<f64>,
    ds: LowRank,
    dt: LowRank,
    ds_sq: LowRank,
    dt_sq: LowRank,
}

impl SparseCost {
    pub fn new(
        source: &Distribution,
        target: &Distribution,
        mask: Arc<SupportMask>,
        device: Device,
    ) -> Result<Self> {
        let (xs, xt) = match (source.geometry(), target.geometry()) {
            (Geometry::Embedding(xs), Geometry::Embedding(xt)) => (xs, xt),
            _ => return Err(Error::Domain("sparse solve needs geometry embeddings")),
        };
        if xs.ncols() != xt.ncols() {
            return Err(Error::LengthMismatch {
                what: "embedding dimension (source vs target)",
                expected: xs.ncols(),
                got: xt.ncols(),
            });
        }
        let shape = (source.len(), target.len());
        if mask.shape() != shape {
            return Err(Error::ShapeMismatch {
                what: "support mask",
                expected: shape,
                got: mask.shape(),
            });
        }

        let features =
            feature_cost_on_support(source.features(), target.features(), mask.as_ref(), device)?;
        let ds = LowRank::squared_distances(xs);
        let dt = LowRank::squared_distances(xt);
        let ds_sq = ds.hadamard_square();
        let dt_sq = dt.hadamard_square();
        Ok(Self {
            mask,
            features,
            ds,
            dt,
            ds_sq,
            dt_sq,
        })
    }

    pub fn mask(&self) -> &Arc<SupportMask> {
        &self.mask
    }
}

impl FusedCost for SparseCost {
    type Support = SupportMask;

    fn support(&self) -> &SupportMask {
        &self.mask
    }

    fn feature_cost(&self) -> &Array1<f64> {
        &self.features
    }

    fn gw_cost(&self, plan: &Array1<f64>) -> Result<Array1<f64>> {
        let mask = self.mask.as_ref();
        let a = self.ds_sq.matvec(&mask.row_sums(plan));
        let b = self.dt_sq.matvec(&mask.col_sums(plan));

        // Rsᵀ P Rt accumulated over the mask entries (r × r).
        let (rs, rt) = (&self.ds.right, &self.dt.right);
        let mut middle = Array2::<f64>::zeros((self.ds.rank(), self.dt.rank()));
        for (k, &pk) in plan.iter().enumerate() {
            if pk == 0.0 {
                continue;
            }
            let (i, j) = mask.entry(k);
            for p in 0..rs.ncols() {
                let f = pk * rs[[i, p]];
                for q in 0..rt.ncols() {
                    middle[[p, q]] += f * rt[[j, q]];
                }
            }
        }
        let left_middle = self.ds.left.dot(&middle);
        let lt = &self.dt.left;

        Ok(mask.map_entries(|i, j| a[i] + b[j] - 2.0 * left_middle.row(i).dot(&lt.row(j))))
    }
}
