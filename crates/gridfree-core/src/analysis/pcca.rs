//! Robust Perron cluster analysis (PCCA+).
//!
//! The leading right eigenvectors of the reversible node transition matrix
//! are linearly transformed into membership vectors `chi = X A`. The inner
//! simplex algorithm yields a feasible start for `A`, which can then be
//! refined towards crisper memberships with a simplex search over the free
//! block of `A`.

use super::AnalysisError;
use super::overlap::{Spectrum, cluster_count, eigen_gaps};
use crate::engine::utils::simplex::{Minimizer, NelderMead};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, instrument, warn};

/// Eigenvalues above this count as part of the Perron cluster.
const PERRON_THRESHOLD: f64 = 0.9999;

#[derive(Debug, Clone)]
pub struct PccaOptions {
    /// Fixed number of clusters; largest eigenvalue gap when `None`.
    pub n_clusters: Option<usize>,
    pub optimize: bool,
    pub max_iterations: usize,
}

impl Default for PccaOptions {
    fn default() -> Self {
        Self {
            n_clusters: None,
            optimize: true,
            max_iterations: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pcca {
    pub n_clusters: usize,
    /// Node-by-cluster memberships; rows sum to one.
    pub chi: DMatrix<f64>,
    pub rotation: DMatrix<f64>,
    /// Coarse-grained rate matrix `A^-1 diag(lambda) A - I`.
    pub rate_matrix: DMatrix<f64>,
    /// Statistical weight of every cluster (first row of `A`).
    pub cluster_weights: DVector<f64>,
    pub gaps: Vec<f64>,
}

/// Makes the eigenvectors orthonormal in the `stationary`-weighted inner
/// product with the constant vector in column 0.
///
/// Degenerate Perron eigenvalues can leave the constant vector mixed with
/// others; the most constant one is then swapped to the front and the rest of
/// the cluster re-orthogonalised.
pub fn orthogonalize(values: &DVector<f64>, vectors: &mut DMatrix<f64>, stationary: &DVector<f64>) {
    let n = vectors.ncols();
    let perron = values.iter().take_while(|&&l| l > PERRON_THRESHOLD).count();
    if perron > 1 {
        let most_constant = (0..perron)
            .max_by(|&a, &b| {
                let sa = vectors.column(a).dot(stationary).abs();
                let sb = vectors.column(b).dot(stationary).abs();
                sa.total_cmp(&sb)
            })
            .unwrap_or(0);
        vectors.swap_columns(0, most_constant);
        vectors.column_mut(0).fill(1.0);
        for j in 1..perron {
            for k in 0..j {
                let vk = vectors.column(k).into_owned();
                let proj = weighted_dot(&vectors.column(j).into_owned(), &vk, stationary)
                    / weighted_dot(&vk, &vk, stationary);
                vectors.column_mut(j).axpy(-proj, &vk, 1.0);
            }
        }
        debug!(perron, "Re-orthogonalised degenerate Perron cluster");
    }
    for j in 0..n {
        let v = vectors.column(j).into_owned();
        let norm = weighted_dot(&v, &v, stationary).sqrt();
        if norm > 0.0 {
            vectors.column_mut(j).unscale_mut(norm);
        }
    }
    vectors.column_mut(0).fill(1.0);
}

fn weighted_dot(a: &DVector<f64>, b: &DVector<f64>, w: &DVector<f64>) -> f64 {
    a.iter().zip(b.iter()).zip(w.iter()).map(|((x, y), z)| x * y * z).sum()
}

/// Inner simplex algorithm: picks `n` representative nodes and returns the
/// rotation `A = X[ind]^-1` with the corresponding memberships `X A`.
pub fn cluster_by_isa(
    vectors: &DMatrix<f64>,
    n_clusters: usize,
) -> Result<(DMatrix<f64>, DMatrix<f64>), AnalysisError> {
    let n = n_clusters.min(vectors.ncols());
    if n == 0 {
        return Err(AnalysisError::InvalidClusterCount {
            requested: n_clusters,
            available: vectors.ncols(),
        });
    }
    let c = vectors.columns(0, n).into_owned();
    let rows = c.nrows();

    let mut ind = vec![0usize; n];
    ind[0] = (0..rows)
        .max_by(|&a, &b| c.row(a).norm().total_cmp(&c.row(b).norm()))
        .unwrap_or(0);
    let mut ortho = DMatrix::from_fn(rows, n, |i, j| c[(i, j)] - c[(ind[0], j)]);
    for k in 1..n {
        let temp = ortho.row(ind[k - 1]).into_owned();
        let mut best = (0usize, f64::NEG_INFINITY);
        for i in 0..rows {
            let proj = temp.dot(&ortho.row(i));
            let updated = ortho.row(i) - &temp * proj;
            ortho.set_row(i, &updated);
            let norm = updated.norm();
            if norm > best.1 {
                best = (i, norm);
            }
        }
        if !(best.1 > 0.0) {
            return Err(AnalysisError::Singular("inner simplex algorithm"));
        }
        ind[k] = best.0;
        ortho.unscale_mut(best.1);
    }
    debug!(representatives = ?ind, "Inner simplex vertices");

    let rotation = c
        .select_rows(&ind)
        .try_inverse()
        .ok_or(AnalysisError::Singular("inner simplex rotation"))?;
    let chi = &c * &rotation;
    Ok((chi, rotation))
}

/// Completes a rotation from its free block `A[1.., 1..]` so that the
/// memberships stay non-negative and partition unity.
pub fn fill_matrix(crop: &DMatrix<f64>, vectors: &DMatrix<f64>) -> DMatrix<f64> {
    let n = crop.nrows() + 1;
    let mut rot = DMatrix::zeros(n, n);
    for i in 1..n {
        let row_sum: f64 = crop.row(i - 1).sum();
        rot[(i, 0)] = -row_sum;
        for j in 1..n {
            rot[(i, j)] = crop[(i - 1, j - 1)];
        }
    }
    let lower = rot.rows(1, n - 1).into_owned();
    let tmp = -(vectors.columns(1, n - 1) * lower);
    for j in 0..n {
        rot[(0, j)] = tmp.column(j).max();
    }
    let top_sum = rot.row(0).sum();
    rot / top_sum
}

/// Crispness objective to minimise: `-sum_i sum_(j>0) A_ji^2 / A_0i`.
fn crispness(rot: &DMatrix<f64>) -> f64 {
    let n = rot.ncols();
    let mut total = 0.0;
    for i in 0..n {
        let top = rot[(0, i)];
        if !(top > 0.0) {
            return f64::INFINITY;
        }
        for j in 1..n {
            total += rot[(j, i)].powi(2) / top;
        }
    }
    -total
}

/// Refines an inner-simplex rotation by simplex search over its free block.
pub fn optimize_rotation(
    rotation: &DMatrix<f64>,
    vectors: &DMatrix<f64>,
    max_iterations: usize,
) -> Result<DMatrix<f64>, AnalysisError> {
    let n = rotation.nrows();
    if n < 2 {
        return Ok(rotation.clone());
    }
    let c = vectors.columns(0, n).into_owned();
    let m = n - 1;
    let x0: Vec<f64> = (0..m * m).map(|k| rotation[(1 + k / m, 1 + k % m)]).collect();
    let unflatten = |x: &[f64]| DMatrix::from_fn(m, m, |i, j| x[i * m + j]);

    let minimizer = NelderMead::default().with_max_iterations(max_iterations);
    let mut objective = |x: &[f64]| crispness(&fill_matrix(&unflatten(x), &c));
    let best = minimizer.minimize(&mut objective, &x0)?;
    if !best.converged {
        warn!(
            iterations = best.iterations,
            "Rotation optimisation stopped before converging"
        );
    }
    debug!(value = best.value, "Optimised rotation");
    Ok(fill_matrix(&unflatten(&best.x), &c))
}

/// `A^-1 diag(lambda_0..n) A - I`.
pub fn coarse_rate_matrix(
    rotation: &DMatrix<f64>,
    values: &DVector<f64>,
) -> Result<DMatrix<f64>, AnalysisError> {
    let n = rotation.nrows();
    let inverse = rotation
        .clone()
        .try_inverse()
        .ok_or(AnalysisError::Singular("coarse rate matrix"))?;
    let lambda = DMatrix::from_diagonal(&values.rows(0, n).into_owned());
    Ok(inverse * lambda * rotation - DMatrix::identity(n, n))
}

/// Runs PCCA+ on the spectrum of a reversible matrix.
#[instrument(skip_all, name = "pcca")]
pub fn pcca(
    spectrum: &Spectrum,
    stationary: &DVector<f64>,
    options: &PccaOptions,
) -> Result<Pcca, AnalysisError> {
    let gaps = eigen_gaps(&spectrum.values);
    let available = spectrum.values.len();
    let n_clusters = options
        .n_clusters
        .unwrap_or_else(|| cluster_count(&spectrum.values));
    if n_clusters == 0 || n_clusters > available {
        return Err(AnalysisError::InvalidClusterCount {
            requested: n_clusters,
            available,
        });
    }

    let mut vectors = spectrum.vectors.clone();
    orthogonalize(&spectrum.values, &mut vectors, stationary);
    let (mut chi, mut rotation) = cluster_by_isa(&vectors, n_clusters)?;
    if options.optimize && n_clusters > 1 {
        rotation = optimize_rotation(&rotation, &vectors, options.max_iterations)?;
        chi = vectors.columns(0, n_clusters) * &rotation;
    }
    let rate_matrix = coarse_rate_matrix(&rotation, &spectrum.values)?;
    let cluster_weights = rotation.row(0).transpose();
    info!(n_clusters, "PCCA+ clustering finished");
    Ok(Pcca {
        n_clusters,
        chi,
        rotation,
        rate_matrix,
        cluster_weights,
        gaps,
    })
}
