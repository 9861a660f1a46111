//! # Analysis Module
//!
//! Ensemble algorithms operating on sampled trajectories and node overlap
//! matrices.
//!
//! - **Convergence** ([`convergence`]) - Gelman-Rubin shrink factors per coordinate
//! - **Seeding** ([`kmeans`]) - Weighted k-means with fixed centroids
//! - **Overlap** ([`overlap`]) - S/K matrices and their reversible eigendecomposition
//! - **Symmetrization** ([`symmetrize`]) - Weight correction and detailed balance
//! - **Clustering** ([`pcca`]) - PCCA+ membership and coarse-grained rate matrix
//! - **Reweighting** ([`reweight`]) - Direct free-energy node weights

pub mod convergence;
pub mod kmeans;
pub mod overlap;
pub mod pcca;
pub mod reweight;
pub mod symmetrize;

use crate::core::coords::CoordinateError;
use crate::core::phi::PhiError;
use crate::engine::utils::simplex::SimplexError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("At least {required} chains are required, got {found}")]
    TooFewChains { required: usize, found: usize },

    #[error("Need at least {required} frames, got {found}")]
    NotEnoughFrames { required: usize, found: usize },

    #[error("Pooled within-chain variance of '{coord}' is not positive ({value})")]
    NonPositiveVariance { coord: String, value: f64 },

    #[error("Cannot form {requested} clusters from {available} candidates")]
    InvalidClusterCount { requested: usize, available: usize },

    #[error("Row {row} of the matrix sums to zero")]
    ZeroRowSum { row: usize },

    #[error("Sum of {0} is not positive")]
    ZeroWeight(&'static str),

    #[error("Matrix must be square with {expected} rows, found {found:?}")]
    Shape {
        expected: usize,
        found: (usize, usize),
    },

    #[error("{what} did not converge within {iterations} iterations")]
    NoConvergence {
        what: &'static str,
        iterations: usize,
    },

    #[error("Singular matrix in {0}")]
    Singular(&'static str),

    #[error("Node '{node}' has no reference points in the energy region")]
    NoRefpoints { node: String },

    #[error(transparent)]
    Coordinates(#[from] CoordinateError),

    #[error(transparent)]
    Phi(#[from] PhiError),

    #[error(transparent)]
    Simplex(#[from] SimplexError),
}
