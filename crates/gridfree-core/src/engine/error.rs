use thiserror::Error;

use super::config::ConfigError;
use super::fitting::FittingError;
use super::lock::LockError;
use super::node::NodeError;
use super::pool::PoolError;
use crate::analysis::AnalysisError;
use crate::core::coords::CoordinateError;
use crate::core::io::traits::SnapshotError;
use crate::core::io::trr::TrrError;
use crate::core::phi::PhiError;
use crate::core::restraint::RestraintError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordinate error: {0}")]
    Coordinates(#[from] CoordinateError),

    #[error("Trajectory error: {0}")]
    Trajectory(#[from] TrrError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Partition error: {0}")]
    Phi(#[from] PhiError),

    #[error("Restraint error: {0}")]
    Restraint(#[from] RestraintError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Restraint fitting failed: {0}")]
    Fitting(#[from] FittingError),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("MD engine failed for node '{node}': {message}")]
    MdEngine { node: String, message: String },

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EngineError {
    pub(crate) fn io(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| EngineError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
