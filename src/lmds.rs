//! Landmark MDS embeddings of mesh geodesics.
//!
//! Geodesic distances on a mesh with `n` vertices form a dense `n × n` matrix,
//! which the sparse engine cannot afford. Landmark MDS only needs distances from
//! `L ≪ n` landmarks to every vertex:
//!
//! 1. pick landmarks by farthest-point sampling over the vertex coordinates;
//! 2. Dijkstra from every landmark on the mesh edge graph (in parallel);
//! 3. classical MDS on the `L × L` landmark block: `B = −½ H Δ H`, top `k`
//!    eigenpairs;
//! 4. place every vertex by distance-based triangulation
//!    `x_a = −½ L^# (δ_a − δ_μ)`.
//!
//! The result `X` (n × k) satisfies `‖X_a − X_b‖² ≈ d_geo(a, b)²`, which is the
//! [`Geometry::Embedding`](crate::Geometry::Embedding) contract.
//!
//! # References
//!
//! - de Silva & Tenenbaum (2004). "Sparse multidimensional scaling using landmark points"

use crate::coarse_to_fine::farthest_point_sampling;
use crate::{Error, Result};
use log::{debug, info};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::Array2;
use petgraph::algo::dijkstra;
use petgraph::graph::{NodeIndex, UnGraph};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmdsConfig {
    /// Embedding dimension.
    pub k: usize,
    pub n_landmarks: usize,
    /// Worker threads for the landmark Dijkstra runs; `0` lets rayon decide.
    pub n_jobs: usize,
    /// Seeds the first landmark.
    pub seed: u64,
}

impl Default for LmdsConfig {
    fn default() -> Self {
        Self {
            k: 3,
            n_landmarks: 100,
            n_jobs: 0,
            seed: 0,
        }
    }
}

/// Undirected edge graph of a triangle mesh, weighted by Euclidean edge length.
pub fn mesh_graph(coordinates: &Array2<f64>, triangles: &[[usize; 3]]) -> Result<UnGraph<(), f64>> {
    let n = coordinates.nrows();
    if coordinates.iter().any(|x| !x.is_finite()) {
        return Err(Error::Domain("mesh coordinates must be finite"));
    }
    let mut edges = BTreeSet::new();
    for tri in triangles {
        if let Some(&bad) = tri.iter().find(|&&v| v >= n) {
            return Err(Error::LengthMismatch {
                what: "triangle vertex index vs vertex count",
                expected: n,
                got: bad,
            });
        }
        for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            if a != b {
                edges.insert((a.min(b), a.max(b)));
            }
        }
    }

    let mut graph = UnGraph::<(), f64>::with_capacity(n, edges.len());
    let nodes: Vec<NodeIndex> = (0..n).map(|_| graph.add_node(())).collect();
    for (a, b) in edges {
        let len = coordinates
            .row(a)
            .iter()
            .zip(coordinates.row(b).iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt();
        graph.add_edge(nodes[a], nodes[b], len);
    }
    Ok(graph)
}

/// Squared geodesic distances `(L, n)` from each landmark to every vertex.
pub fn geodesic_distances(
    graph: &UnGraph<(), f64>,
    landmarks: &[usize],
    n_jobs: usize,
) -> Result<Array2<f64>> {
    let n = graph.node_count();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(n_jobs).build()?;
    let rows: Vec<Vec<f64>> = pool.install(|| {
        landmarks
            .par_iter()
            .map(|&landmark| {
                let reached = dijkstra(graph, NodeIndex::new(landmark), None, |e| *e.weight());
                (0..n)
                    .map(|v| {
                        reached
                            .get(&NodeIndex::new(v))
                            .map(|d| d * d)
                            .ok_or(Error::DisconnectedMesh { landmark, vertex: v })
                    })
                    .collect::<Result<Vec<f64>>>()
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut out = Array2::zeros((landmarks.len(), n));
    for (l, row) in rows.into_iter().enumerate() {
        for (v, d) in row.into_iter().enumerate() {
            out[[l, v]] = d;
        }
    }
    Ok(out)
}

/// Landmark MDS from squared distances `(L, n)`; `landmarks[l]` is the vertex
/// of row `l`. Returns `(n, k)`.
pub fn lmds(sq_dist: &Array2<f64>, landmarks: &[usize], k: usize) -> Result<Array2<f64>> {
    let (l, n) = sq_dist.dim();
    if landmarks.len() != l {
        return Err(Error::LengthMismatch {
            what: "landmarks vs distance rows",
            expected: l,
            got: landmarks.len(),
        });
    }
    if k == 0 || k >= l {
        return Err(Error::Domain("lmds needs 1 <= k < number of landmarks"));
    }

    // Landmark block, symmetrized.
    let delta = DMatrix::from_fn(l, l, |a, b| {
        0.5 * (sq_dist[[a, landmarks[b]]] + sq_dist[[b, landmarks[a]]])
    });
    let row_means: Vec<f64> = (0..l).map(|a| delta.row(a).mean()).collect();
    let grand_mean = row_means.iter().sum::<f64>() / l as f64;
    let b = DMatrix::from_fn(l, l, |a, c| {
        -0.5 * (delta[(a, c)] - row_means[a] - row_means[c] + grand_mean)
    });

    let eig = SymmetricEigen::new(b);
    let mut order: Vec<usize> = (0..l).collect();
    order.sort_by(|&a, &c| eig.eigenvalues[c].total_cmp(&eig.eigenvalues[a]));
    let top = eig.eigenvalues[order[0]];
    let tiny = 1e-12 * top.abs().max(1.0);
    let chosen = &order[..k];
    if chosen.iter().any(|&i| !(eig.eigenvalues[i] > tiny)) {
        return Err(Error::Domain("fewer than k positive eigenvalues in landmark MDS"));
    }
    debug!(
        "lmds: top eigenvalues {:?}",
        chosen.iter().map(|&i| eig.eigenvalues[i]).collect::<Vec<_>>()
    );

    // Pseudo-inverse transpose of the landmark embedding, (k, l).
    let mut pinv = Array2::<f64>::zeros((k, l));
    for (r, &i) in chosen.iter().enumerate() {
        let s = eig.eigenvalues[i].sqrt();
        for a in 0..l {
            pinv[[r, a]] = eig.eigenvectors[(a, i)] / s;
        }
    }

    let mut out = Array2::zeros((n, k));
    for v in 0..n {
        for r in 0..k {
            let mut acc = 0.0;
            for a in 0..l {
                acc += pinv[[r, a]] * (sq_dist[[a, v]] - row_means[a]);
            }
            out[[v, r]] = -0.5 * acc;
        }
    }
    Ok(out)
}

/// Low-rank geodesic embedding `(n, k)` of a triangle mesh.
pub fn compute_lmds_mesh(
    coordinates: &Array2<f64>,
    triangles: &[[usize; 3]],
    config: &LmdsConfig,
) -> Result<Array2<f64>> {
    let n = coordinates.nrows();
    if n == 0 {
        return Err(Error::Domain("mesh has no vertices"));
    }
    let n_landmarks = config.n_landmarks.min(n);
    if config.k == 0 || config.k >= n_landmarks {
        return Err(Error::Domain("lmds needs 1 <= k < number of landmarks"));
    }
    info!(
        "lmds: {} vertices, {} triangles, {} landmarks, k = {}",
        n,
        triangles.len(),
        n_landmarks,
        config.k
    );

    let graph = mesh_graph(coordinates, triangles)?;
    let start = ChaCha8Rng::seed_from_u64(config.seed).random_range(0..n);
    let landmarks = farthest_point_sampling(coordinates, n_landmarks, start);
    let sq_dist = geodesic_distances(&graph, &landmarks, config.n_jobs)?;
    lmds(&sq_dist, &landmarks, config.k)
}
