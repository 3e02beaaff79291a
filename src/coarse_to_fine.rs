//! Coarse-to-fine FUGW.
//!
//! A dense solve between small sub-samples of the two distributions decides
//! which regions correspond; the fine sparse solve is then restricted to pairs
//! of points lying near a selected coarse pair.
//!
//! ```text
//! sample ──> dense coarse fit ──> select pairs ──> neighbourhoods ──> mask ──> sparse fine fit
//! ```
//!
//! Both distributions must carry [`Geometry::Embedding`]: the coarse geometry
//! is the squared embedding distance between samples, and neighbourhoods are
//! Euclidean balls in embedding space.

use crate::dense::{FitOptions, FitReport, FugwDense};
use crate::sparse::{FugwSparse, SparsePlan};
use crate::support::{Support, SupportMask};
use crate::{Device, Distribution, Error, Geometry, Hyperparams, Result};
use log::info;
use ndarray::{Array1, Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// How coarse sample points are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    /// Uniformly at random without replacement.
    #[default]
    Uniform,
    /// Farthest-point sampling in embedding space from a random start.
    FarthestPoint,
}

/// How coarse plan entries become fine pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairSelection {
    /// The `k` largest entries of every row and of every column.
    TopK { k: usize },
    /// Entries strictly above the `q`-quantile of all coarse entries.
    Quantile { q: f64 },
}

impl Default for PairSelection {
    fn default() -> Self {
        PairSelection::TopK { k: 10 }
    }
}

/// Starting values of the fine plan on the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FineInit {
    /// Same value on every mask entry.
    #[default]
    Uniform,
    /// Each selected pair's coarse mass spread over its neighbourhood product.
    FromCoarse,
}

#[derive(Debug, Clone)]
pub struct CoarseToFineConfig {
    pub source_sample_size: usize,
    pub target_sample_size: usize,
    pub sampling: Sampling,
    pub seed: u64,
    pub selection: PairSelection,
    /// Fewer selected pairs than this is an [`Error::EmptyMask`].
    pub min_pairs: usize,
    pub source_radius: f64,
    pub target_radius: f64,
    pub fine_init: FineInit,
    pub coarse_hyper: Hyperparams,
    pub coarse_options: FitOptions,
    pub fine_hyper: Hyperparams,
    pub fine_options: FitOptions,
}

impl Default for CoarseToFineConfig {
    fn default() -> Self {
        Self {
            source_sample_size: 1000,
            target_sample_size: 1000,
            sampling: Sampling::default(),
            seed: 0,
            selection: PairSelection::default(),
            min_pairs: 1,
            source_radius: 1.0,
            target_radius: 1.0,
            fine_init: FineInit::default(),
            coarse_hyper: Hyperparams::default(),
            coarse_options: FitOptions::default(),
            fine_hyper: Hyperparams::default(),
            fine_options: FitOptions::default(),
        }
    }
}

/// Intermediate results of a coarse-to-fine run.
#[derive(Debug, Clone)]
pub struct CoarseToFineReport {
    pub source_indices: Vec<usize>,
    pub target_indices: Vec<usize>,
    pub coarse: FitReport,
    /// Coarse plan between the samples.
    pub coarse_plan: Array2<f64>,
    /// Selected pairs, as indices into the full distributions.
    pub pairs: Vec<(usize, usize)>,
    pub mask: Arc<SupportMask>,
    pub fine: FitReport,
}

/// Run the whole pipeline; returns the fitted sparse mapping.
pub fn fit(
    source: &Distribution,
    target: &Distribution,
    config: &CoarseToFineConfig,
) -> Result<(FugwSparse, CoarseToFineReport)> {
    let xs = embedding(source)?;
    let xt = embedding(target)?;
    if config.source_radius < 0.0 || config.target_radius < 0.0 {
        return Err(Error::Domain("selection radii must be nonnegative"));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let source_indices = sample_indices(xs, config.source_sample_size, config.sampling, &mut rng)?;
    let target_indices = sample_indices(xt, config.target_sample_size, config.sampling, &mut rng)?;
    info!(
        "coarse-to-fine: sampled {} source and {} target points",
        source_indices.len(),
        target_indices.len()
    );

    let coarse_source = source.subsample(&source_indices)?;
    let coarse_target = target.subsample(&target_indices)?;
    let mut coarse_mapping = FugwDense::new(config.coarse_hyper)?;
    let coarse = coarse_mapping.fit(&coarse_source, &coarse_target, None, &config.coarse_options)?;
    let coarse_plan = coarse_mapping.plan().ok_or(Error::NotFitted)?.clone();

    let selected = select_pairs(&coarse_plan, config.selection, config.min_pairs)?;
    let pairs: Vec<(usize, usize)> = selected
        .iter()
        .map(|&(i, j)| (source_indices[i], target_indices[j]))
        .collect();
    info!("coarse-to-fine: selected {} coarse pairs", pairs.len());

    let device = config.fine_options.device;
    let source_balls = neighbourhoods(xs, pairs.iter().map(|p| p.0), config.source_radius, device);
    let target_balls = neighbourhoods(xt, pairs.iter().map(|p| p.1), config.target_radius, device);
    let mask = Arc::new(mask_from_balls(
        source.len(),
        target.len(),
        &pairs,
        &source_balls,
        &target_balls,
    )?);
    info!(
        "coarse-to-fine: mask has {} entries ({:.3}% of the full plan)",
        mask.len(),
        100.0 * mask.density()
    );

    let init_values = match config.fine_init {
        FineInit::Uniform => Array1::ones(mask.len()),
        FineInit::FromCoarse => {
            let mut values = Array1::<f64>::zeros(mask.len());
            for (&(ci, cj), &(i, j)) in selected.iter().zip(pairs.iter()) {
                let (ns, nt) = (&source_balls[&i], &target_balls[&j]);
                let share = coarse_plan[[ci, cj]] / (ns.len() * nt.len()) as f64;
                for &a in ns {
                    for &b in nt {
                        if let Some(k) = mask.index_of(a, b) {
                            values[k] += share;
                        }
                    }
                }
            }
            // Entries with no coarse mass would stay zero under MM.
            let floor = values
                .iter()
                .copied()
                .filter(|&v| v > 0.0)
                .fold(f64::INFINITY, f64::min);
            let floor = if floor.is_finite() { floor } else { 1.0 };
            values.mapv_inplace(|v| if v > 0.0 { v } else { floor });
            values
        }
    };
    let init = SparsePlan::new(Arc::clone(&mask), init_values)?;

    let mut fine_mapping = FugwSparse::new(config.fine_hyper)?;
    let fine = fine_mapping.fit(source, target, Some(&init), &config.fine_options)?;

    let report = CoarseToFineReport {
        source_indices,
        target_indices,
        coarse,
        coarse_plan,
        pairs,
        mask,
        fine,
    };
    Ok((fine_mapping, report))
}

fn embedding(dist: &Distribution) -> Result<&Array2<f64>> {
    match dist.geometry() {
        Geometry::Embedding(x) => Ok(x),
        Geometry::Matrix(_) => Err(Error::Domain("coarse-to-fine needs geometry embeddings")),
    }
}

/// Draw `size` distinct row indices of `x` (all rows if `size >= n`), sorted.
pub fn sample_indices<R: Rng>(
    x: &Array2<f64>,
    size: usize,
    sampling: Sampling,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let n = x.nrows();
    if size == 0 {
        return Err(Error::Domain("sample size must be >= 1"));
    }
    if size >= n {
        return Ok((0..n).collect());
    }
    let mut picked = match sampling {
        Sampling::Uniform => {
            let mut all: Vec<usize> = (0..n).collect();
            all.shuffle(rng);
            all.truncate(size);
            all
        }
        Sampling::FarthestPoint => {
            let start = rng.random_range(0..n);
            farthest_point_sampling(x, size, start)
        }
    };
    picked.sort_unstable();
    Ok(picked)
}

/// Greedy farthest-point sampling over the rows of `x`, ties to the lower index.
pub(crate) fn farthest_point_sampling(x: &Array2<f64>, size: usize, start: usize) -> Vec<usize> {
    let n = x.nrows();
    let mut picked = Vec::with_capacity(size);
    let mut min_dist = vec![f64::INFINITY; n];
    let mut next = start;
    while picked.len() < size.min(n) {
        picked.push(next);
        let center = x.row(next);
        for (a, d) in min_dist.iter_mut().enumerate() {
            *d = d.min(sq_dist(x.row(a), center));
        }
        // Never pick a point twice, even among duplicates.
        min_dist[next] = f64::NEG_INFINITY;
        let mut best = (f64::NEG_INFINITY, 0);
        for (a, &d) in min_dist.iter().enumerate() {
            if d > best.0 {
                best = (d, a);
            }
        }
        next = best.1;
    }
    picked
}

fn sq_dist(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Pick `(row, col)` pairs of a coarse plan.
pub fn select_pairs(
    plan: &Array2<f64>,
    selection: PairSelection,
    min_pairs: usize,
) -> Result<Vec<(usize, usize)>> {
    let (n, m) = plan.dim();
    let mut pairs = match selection {
        PairSelection::TopK { k } => {
            if k == 0 {
                return Err(Error::Domain("top-k selection needs k >= 1"));
            }
            let mut pairs = Vec::with_capacity(k * (n + m));
            for i in 0..n {
                pairs.extend(top_k(plan.row(i).to_vec(), k).map(|j| (i, j)));
            }
            for j in 0..m {
                pairs.extend(top_k(plan.column(j).to_vec(), k).map(|i| (i, j)));
            }
            pairs
        }
        PairSelection::Quantile { q } => {
            if !(0.0..=1.0).contains(&q) {
                return Err(Error::Domain("quantile selection needs q in [0, 1]"));
            }
            let threshold = quantile(plan.iter().copied().collect(), q);
            plan.indexed_iter()
                .filter(|(_, &v)| v > threshold)
                .map(|(ij, _)| ij)
                .collect()
        }
    };
    pairs.sort_unstable();
    pairs.dedup();
    if pairs.is_empty() || pairs.len() < min_pairs {
        return Err(Error::EmptyMask("too few coarse pairs selected"));
    }
    Ok(pairs)
}

/// Indices of the `k` largest values, ties broken by lower index.
fn top_k(values: Vec<f64>, k: usize) -> impl Iterator<Item = usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order.truncate(k);
    order.into_iter()
}

/// Linear-interpolation quantile.
fn quantile(mut values: Vec<f64>, q: f64) -> f64 {
    values.sort_by(f64::total_cmp);
    let pos = q * (values.len() - 1) as f64;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    values[lo] + (pos - lo as f64) * (values[hi] - values[lo])
}

/// Rows of `x` within Euclidean distance `radius` of row `center`.
pub fn neighbourhood(x: &Array2<f64>, center: usize, radius: f64) -> Vec<usize> {
    let c = x.row(center);
    let r2 = radius * radius;
    (0..x.nrows()).filter(|&a| sq_dist(x.row(a), c) <= r2).collect()
}

/// Neighbourhoods of every distinct center.
fn neighbourhoods(
    x: &Array2<f64>,
    centers: impl Iterator<Item = usize>,
    radius: f64,
    device: Device,
) -> HashMap<usize, Vec<usize>> {
    let mut distinct: Vec<usize> = centers.collect();
    distinct.sort_unstable();
    distinct.dedup();
    match device {
        Device::Cpu => distinct
            .into_iter()
            .map(|c| (c, neighbourhood(x, c, radius)))
            .collect(),
        Device::Parallel => distinct
            .into_par_iter()
            .map(|c| (c, neighbourhood(x, c, radius)))
            .collect(),
    }
}

/// Union of `N_s(i) × N_t(j)` over the selected pairs.
pub fn build_mask(
    xs: &Array2<f64>,
    xt: &Array2<f64>,
    pairs: &[(usize, usize)],
    source_radius: f64,
    target_radius: f64,
) -> Result<SupportMask> {
    let source_balls = neighbourhoods(xs, pairs.iter().map(|p| p.0), source_radius, Device::Cpu);
    let target_balls = neighbourhoods(xt, pairs.iter().map(|p| p.1), target_radius, Device::Cpu);
    mask_from_balls(xs.nrows(), xt.nrows(), pairs, &source_balls, &target_balls)
}

fn mask_from_balls(
    n: usize,
    m: usize,
    pairs: &[(usize, usize)],
    source_balls: &HashMap<usize, Vec<usize>>,
    target_balls: &HashMap<usize, Vec<usize>>,
) -> Result<SupportMask> {
    SupportMask::from_pairs(
        n,
        m,
        pairs.iter().flat_map(|(i, j)| {
            let (ns, nt) = (&source_balls[i], &target_balls[j]);
            ns.iter().flat_map(move |&a| nt.iter().map(move |&b| (a, b)))
        }),
    )
}
