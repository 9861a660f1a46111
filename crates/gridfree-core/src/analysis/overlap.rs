use super::AnalysisError;
use crate::core::coords::TrajectoryFrames;
use crate::core::phi::PhiPartition;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::{debug, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Overlap of every node's sampled ensemble with every partition region.
///
/// Row `i` is the weighted mean over frames `f` of node `i`'s trajectory of
/// `phi_j` at frame `f + lag`, weighted with the first `n - lag` frame
/// weights. With `lag = 0` this is the overlap matrix S, otherwise the
/// transition matrix K.
#[instrument(skip_all, name = "overlap_matrix", fields(nodes = trajectories.len(), lag))]
pub fn overlap_matrix(
    partition: &PhiPartition,
    trajectories: &[&TrajectoryFrames],
    lag: usize,
) -> Result<DMatrix<f64>, AnalysisError> {
    if trajectories.len() != partition.len() {
        return Err(AnalysisError::Shape {
            expected: partition.len(),
            found: (trajectories.len(), partition.len()),
        });
    }

    let iterator = trajectories.iter();

    #[cfg(feature = "parallel")]
    let iterator = trajectories.par_iter();

    let rows: Vec<Result<DVector<f64>, AnalysisError>> = iterator
        .map(|frames| overlap_row(partition, frames, lag))
        .collect();

    let mut matrix = DMatrix::zeros(partition.len(), partition.len());
    for (i, row) in rows.into_iter().enumerate() {
        matrix.set_row(i, &row?.transpose());
    }
    debug!("Overlap matrix assembled");
    Ok(matrix)
}

fn overlap_row(
    partition: &PhiPartition,
    frames: &TrajectoryFrames,
    lag: usize,
) -> Result<DVector<f64>, AnalysisError> {
    let n = frames.n_frames();
    if n <= lag {
        return Err(AnalysisError::NotEnoughFrames {
            required: lag + 1,
            found: n,
        });
    }
    let phi = partition.memberships(frames)?;
    let weights = match frames.weights() {
        Some(w) => w.rows(0, n - lag).into_owned(),
        None => DVector::from_element(n - lag, 1.0),
    };
    let total = weights.sum();
    if !(total > 0.0) {
        return Err(AnalysisError::ZeroWeight("trajectory frame weights"));
    }
    let shifted = phi.rows(lag, n - lag);
    Ok(shifted.transpose() * weights / total)
}

/// Eigenvalues (descending) and right eigenvectors of a reversible matrix.
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub values: DVector<f64>,
    /// Column `k` is the right eigenvector of `values[k]`.
    pub vectors: DMatrix<f64>,
}

/// Decomposes a row-stochastic matrix in detailed balance with `stationary`
/// through the similar symmetric matrix `D^(1/2) T D^(-1/2)`.
pub fn reversible_eigen(
    matrix: &DMatrix<f64>,
    stationary: &DVector<f64>,
) -> Result<Spectrum, AnalysisError> {
    let n = matrix.nrows();
    if !matrix.is_square() || stationary.len() != n {
        return Err(AnalysisError::Shape {
            expected: stationary.len(),
            found: matrix.shape(),
        });
    }
    if stationary.iter().any(|&p| !(p > 0.0)) {
        return Err(AnalysisError::ZeroWeight("stationary distribution"));
    }
    let sqrt_pi = stationary.map(f64::sqrt);
    let mut similar = DMatrix::from_fn(n, n, |i, j| sqrt_pi[i] * matrix[(i, j)] / sqrt_pi[j]);
    similar = (&similar + similar.transpose()) * 0.5;

    let eigen = SymmetricEigen::new(similar);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let values = DVector::from_iterator(n, order.iter().map(|&k| eigen.eigenvalues[k]));
    let mut vectors = DMatrix::zeros(n, n);
    for (col, &k) in order.iter().enumerate() {
        let right = eigen.eigenvectors.column(k).component_div(&sqrt_pi);
        vectors.set_column(col, &right);
    }
    Ok(Spectrum { values, vectors })
}

/// `|lambda_i - lambda_(i+1)|` for consecutive eigenvalues; the last gap is 0.
pub fn eigen_gaps(values: &DVector<f64>) -> Vec<f64> {
    let mut gaps: Vec<f64> = values
        .as_slice()
        .windows(2)
        .map(|pair| (pair[0] - pair[1]).abs())
        .collect();
    if !values.is_empty() {
        gaps.push(0.0);
    }
    gaps
}

/// Number of metastable sets: position of the largest eigenvalue gap.
pub fn cluster_count(values: &DVector<f64>) -> usize {
    eigen_gaps(values)
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &g)| {
            if g > best.1 { (i, g) } else { best }
        })
        .0
        + 1
}
