//! The seam between the pool bookkeeping and the external MD program.
//!
//! Workflows never spawn processes themselves; they hand an [`MdJob`] to an
//! [`MdEngine`] implementation and map its [`MdEngineError`] onto
//! [`EngineError::MdEngine`].

use crate::core::coords::CoordinateSet;
use crate::core::restraint::Restraint;
use crate::engine::error::EngineError;
use crate::engine::node::Node;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MdEngineError {
    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },
    #[error("I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Expected output '{0}' was not produced")]
    MissingOutput(String),
}

/// Everything an engine needs to set up, run or extend one node.
#[derive(Debug, Clone)]
pub struct MdJob<'a> {
    pub name: &'a str,
    pub dir: &'a Path,
    /// Single frame the sampling starts from.
    pub start_frame: PathBuf,
    /// Trajectory the run must write (or append to when extending).
    pub trajectory: PathBuf,
    /// Restraints in physical units, one per coordinate; empty for
    /// unrestrained nodes.
    pub restraints: Vec<Restraint>,
    pub coordinates: &'a CoordinateSet,
    /// Initial sampling length in ps.
    pub sampling_length: f64,
    pub extensions_counter: u32,
}

impl<'a> MdJob<'a> {
    pub fn for_node(node: &'a Node, coordinates: &'a CoordinateSet) -> Self {
        let restraints = node
            .record()
            .restraints
            .as_deref()
            .unwrap_or_default()
            .iter()
            .zip(coordinates.iter())
            .map(|(r, c)| r.to_physical(c))
            .collect();
        Self {
            name: node.name(),
            dir: node.dir(),
            start_frame: node.start_frame_path(),
            trajectory: node.trajectory_path(),
            restraints,
            coordinates,
            sampling_length: node.record().sampling_length,
            extensions_counter: node.record().extensions_counter,
        }
    }
}

/// An external molecular-dynamics program.
///
/// The four steps mirror the node lifecycle: `setup` moves a node from
/// created to grompp-able, `preprocess` from grompp-able to mdrun-able, and
/// `run` produces the trajectory. `extend` prolongs an existing run before
/// it is resumed.
pub trait MdEngine {
    fn setup(&self, job: &MdJob<'_>) -> Result<(), MdEngineError>;

    fn preprocess(&self, job: &MdJob<'_>) -> Result<(), MdEngineError>;

    /// Prolongs the run by `length` ps.
    fn extend(&self, job: &MdJob<'_>, length: f64) -> Result<(), MdEngineError>;

    fn run(&self, job: &MdJob<'_>) -> Result<(), MdEngineError>;
}

pub(crate) fn engine_error(node: &str) -> impl FnOnce(MdEngineError) -> EngineError + '_ {
    move |e| EngineError::MdEngine {
        node: node.to_string(),
        message: e.to_string(),
    }
}
