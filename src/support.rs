//! Plan supports: which `(row, col)` positions a plan may occupy.
//!
//! Every solver in this crate stores a plan as a flat vector of values, one per
//! support entry. A [`Support`] maps entry `k` to its `(row, col)` position and
//! provides the segment reductions (row/column sums and log-sum-exps) that the
//! cost builder and the sub-solvers are written against. The dense case is just
//! the full support; the sparse case is a [`SupportMask`] fixed before solving.
//!
//! Entries are always stored row-major (sorted by `(row, col)`), so rows are
//! contiguous segments.

use crate::{logsumexp_by, Error, Result};
use ndarray::Array1;

/// Index set of a plan.
pub trait Support {
    /// `(n_rows, n_cols)` of the plan this support lives in.
    fn shape(&self) -> (usize, usize);

    /// Number of entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(row, col)` position of entry `k`.
    fn entry(&self, k: usize) -> (usize, usize);

    /// `Σ_{k in row i} values[k]` for every row.
    fn row_sums(&self, values: &Array1<f64>) -> Array1<f64> {
        let (n, _) = self.shape();
        let mut out = Array1::zeros(n);
        for (k, &v) in values.iter().enumerate() {
            out[self.entry(k).0] += v;
        }
        out
    }

    /// `Σ_{k in col j} values[k]` for every column.
    fn col_sums(&self, values: &Array1<f64>) -> Array1<f64> {
        let (_, m) = self.shape();
        let mut out = Array1::zeros(m);
        for (k, &v) in values.iter().enumerate() {
            out[self.entry(k).1] += v;
        }
        out
    }

    /// Per-row log-sum-exp of `logits`. Rows without entries get `-∞`.
    fn row_logsumexp(&self, logits: &Array1<f64>) -> Array1<f64> {
        let (n, _) = self.shape();
        segment_logsumexp(n, logits, |k| self.entry(k).0)
    }

    /// Per-column log-sum-exp of `logits`. Columns without entries get `-∞`.
    fn col_logsumexp(&self, logits: &Array1<f64>) -> Array1<f64> {
        let (_, m) = self.shape();
        segment_logsumexp(m, logits, |k| self.entry(k).1)
    }

    /// `values[k] = f(row, col)` for every entry.
    fn map_entries(&self, mut f: impl FnMut(usize, usize) -> f64) -> Array1<f64> {
        Array1::from_shape_fn(self.len(), |k| {
            let (i, j) = self.entry(k);
            f(i, j)
        })
    }
}

/// Two-pass segmented log-sum-exp (max, then shifted sum).
fn segment_logsumexp(
    n_segments: usize,
    logits: &Array1<f64>,
    segment_of: impl Fn(usize) -> usize,
) -> Array1<f64> {
    let mut max = Array1::from_elem(n_segments, f64::NEG_INFINITY);
    for (k, &x) in logits.iter().enumerate() {
        let s = segment_of(k);
        if x > max[s] {
            max[s] = x;
        }
    }
    let mut sum = Array1::<f64>::zeros(n_segments);
    for (k, &x) in logits.iter().enumerate() {
        let s = segment_of(k);
        if max[s].is_finite() {
            sum[s] += (x - max[s]).exp();
        }
    }
    Array1::from_shape_fn(n_segments, |s| {
        if max[s].is_finite() {
            max[s] + sum[s].ln()
        } else {
            max[s]
        }
    })
}

/// The full `n × m` support, entry `k = i * m + j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseSupport {
    n_rows: usize,
    n_cols: usize,
}

impl DenseSupport {
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self { n_rows, n_cols }
    }
}

impl Support for DenseSupport {
    fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    fn len(&self) -> usize {
        self.n_rows * self.n_cols
    }

    #[inline]
    fn entry(&self, k: usize) -> (usize, usize) {
        (k / self.n_cols, k % self.n_cols)
    }

    fn row_logsumexp(&self, logits: &Array1<f64>) -> Array1<f64> {
        let m = self.n_cols;
        Array1::from_shape_fn(self.n_rows, |i| logsumexp_by(m, |j| logits[i * m + j]))
    }

    fn col_logsumexp(&self, logits: &Array1<f64>) -> Array1<f64> {
        let (n, m) = (self.n_rows, self.n_cols);
        Array1::from_shape_fn(m, |j| logsumexp_by(n, |i| logits[i * m + j]))
    }
}

/// A fixed set of `(row, col)` positions, stored in CSR order.
///
/// Built once and never mutated; solvers share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportMask {
    n_rows: usize,
    n_cols: usize,
    /// `row_ptr[i]..row_ptr[i + 1]` are the entries of row `i`.
    row_ptr: Vec<usize>,
    rows: Vec<usize>,
    cols: Vec<usize>,
}

impl SupportMask {
    /// Build a mask from arbitrary pairs; duplicates are merged.
    pub fn from_pairs(
        n_rows: usize,
        n_cols: usize,
        pairs: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<Self> {
        let mut pairs: Vec<(usize, usize)> = pairs.into_iter().collect();
        if let Some(&(row, col)) = pairs.iter().find(|&&(i, j)| i >= n_rows || j >= n_cols) {
            return Err(Error::OutOfSupport {
                row,
                col,
                n_rows,
                n_cols,
            });
        }
        pairs.sort_unstable();
        pairs.dedup();
        if pairs.is_empty() {
            return Err(Error::EmptyMask("no (row, col) pairs"));
        }

        let mut row_ptr = vec![0usize; n_rows + 1];
        for &(i, _) in &pairs {
            row_ptr[i + 1] += 1;
        }
        for i in 0..n_rows {
            row_ptr[i + 1] += row_ptr[i];
        }
        let (rows, cols) = pairs.into_iter().unzip();
        Ok(Self {
            n_rows,
            n_cols,
            row_ptr,
            rows,
            cols,
        })
    }

    /// Every position of an `n_rows × n_cols` plan.
    pub fn full(n_rows: usize, n_cols: usize) -> Result<Self> {
        Self::from_pairs(
            n_rows,
            n_cols,
            (0..n_rows).flat_map(|i| (0..n_cols).map(move |j| (i, j))),
        )
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Entry indices of row `i`.
    pub fn row_range(&self, i: usize) -> std::ops::Range<usize> {
        self.row_ptr[i]..self.row_ptr[i + 1]
    }

    /// Entry index of `(i, j)`, if it is in the mask.
    pub fn index_of(&self, i: usize, j: usize) -> Option<usize> {
        if i >= self.n_rows {
            return None;
        }
        let range = self.row_range(i);
        let start = range.start;
        self.cols[range]
            .binary_search(&j)
            .ok()
            .map(|offset| start + offset)
    }

    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.index_of(i, j).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }

    /// Fraction of the full `n_rows × n_cols` plan covered by the mask.
    pub fn density(&self) -> f64 {
        self.rows.len() as f64 / (self.n_rows as f64 * self.n_cols as f64)
    }
}

impl Support for SupportMask {
    fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    fn entry(&self, k: usize) -> (usize, usize) {
        (self.rows[k], self.cols[k])
    }

    fn row_logsumexp(&self, logits: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.n_rows, |i| {
            let range = self.row_range(i);
            let start = range.start;
            logsumexp_by(range.len(), |o| logits[start + o])
        })
    }
}
