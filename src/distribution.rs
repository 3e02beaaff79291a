//! Weighted point sets with features and geometry.

use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};

/// Geometry of a point set.
#[derive(Debug, Clone)]
pub enum Geometry {
    /// Full `n × n` kernel or distance matrix (symmetric, nonnegative).
    Matrix(Array2<f64>),
    /// Low-rank embedding `X` (`n × k`) standing for `D_ij = ‖X_i − X_j‖²`.
    Embedding(Array2<f64>),
}

impl Geometry {
    /// Number of points described.
    pub fn len(&self) -> usize {
        match self {
            Geometry::Matrix(d) => d.nrows(),
            Geometry::Embedding(x) => x.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A weighted point set: mass vector, features `(d, n)` and geometry.
///
/// Validated on construction and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Distribution {
    weights: Array1<f64>,
    features: Array2<f64>,
    geometry: Geometry,
}

impl Distribution {
    pub fn new(weights: Array1<f64>, features: Array2<f64>, geometry: Geometry) -> Result<Self> {
        let n = weights.len();
        if n == 0 {
            return Err(Error::Domain("distribution must have at least one point"));
        }
        if features.ncols() != n {
            return Err(Error::LengthMismatch {
                what: "features (columns) vs weights",
                expected: n,
                got: features.ncols(),
            });
        }
        if weights.iter().any(|&w| !(w >= 0.0) || !w.is_finite()) {
            return Err(Error::Domain("weights must be nonnegative and finite"));
        }
        if weights.sum() <= 0.0 {
            return Err(Error::Domain("weights must have positive total mass"));
        }
        if features.iter().any(|x| !x.is_finite()) {
            return Err(Error::Domain("features must be finite"));
        }

        match &geometry {
            Geometry::Matrix(d) => {
                if d.dim() != (n, n) {
                    return Err(Error::ShapeMismatch {
                        what: "geometry matrix",
                        expected: (n, n),
                        got: d.dim(),
                    });
                }
                if d.iter().any(|&x| !(x >= 0.0) || !x.is_finite()) {
                    return Err(Error::Domain("geometry must be nonnegative and finite"));
                }
                let scale = d.iter().fold(1.0f64, |acc, &x| acc.max(x));
                let asym = d
                    .indexed_iter()
                    .map(|((i, j), &x)| (x - d[[j, i]]).abs())
                    .fold(0.0f64, f64::max);
                if asym > 1e-8 * scale {
                    return Err(Error::Domain("geometry matrix must be symmetric"));
                }
            }
            Geometry::Embedding(x) => {
                if x.nrows() != n {
                    return Err(Error::LengthMismatch {
                        what: "geometry embedding (rows) vs weights",
                        expected: n,
                        got: x.nrows(),
                    });
                }
                if x.ncols() == 0 {
                    return Err(Error::Domain("geometry embedding must have positive dimension"));
                }
                if x.iter().any(|v| !v.is_finite()) {
                    return Err(Error::Domain("geometry embedding must be finite"));
                }
            }
        }

        Ok(Self {
            weights,
            features,
            geometry,
        })
    }

    /// Uniform weights `1/n`.
    pub fn uniform(features: Array2<f64>, geometry: Geometry) -> Result<Self> {
        let n = features.ncols();
        if n == 0 {
            return Err(Error::Domain("distribution must have at least one point"));
        }
        Self::new(Array1::from_elem(n, 1.0 / n as f64), features, geometry)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Always `false`; construction rejects empty point sets.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.nrows()
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// Features, one column per point.
    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn mass(&self) -> f64 {
        self.weights.sum()
    }

    /// Restrict to `indices`, keeping the total mass.
    ///
    /// Embedding geometry is turned into the matching squared-distance matrix,
    /// which is what a dense solve on the sub-sample needs.
    pub fn subsample(&self, indices: &[usize]) -> Result<Distribution> {
        let n = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
            return Err(Error::LengthMismatch {
                what: "subsample index vs distribution size",
                expected: n,
                got: bad,
            });
        }
        let mut weights = self.weights.select(Axis(0), indices);
        let sub_mass = weights.sum();
        if sub_mass <= 0.0 {
            return Err(Error::Domain("subsample carries no mass"));
        }
        weights *= self.mass() / sub_mass;
        let features = self.features.select(Axis(1), indices);
        let geometry = match &self.geometry {
            Geometry::Matrix(d) => Geometry::Matrix(d.select(Axis(0), indices).select(Axis(1), indices)),
            Geometry::Embedding(x) => {
                Geometry::Matrix(squared_distances(&x.select(Axis(0), indices)))
            }
        };
        Distribution::new(weights, features, geometry)
    }
}

/// `D_ij = ‖X_i − X_j‖²` between the rows of `x`.
pub fn squared_distances(x: &Array2<f64>) -> Array2<f64> {
    let n = x.nrows();
    let mut d = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let dist_sq: f64 = x
                .row(i)
                .iter()
                .zip(x.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            d[[i, j]] = dist_sq;
            d[[j, i]] = dist_sq;
        }
    }
    d
}
