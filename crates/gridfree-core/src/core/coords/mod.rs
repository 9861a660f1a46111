//! Internal-coordinate space: coordinate definitions, periodic-boundary
//! resolution and the frames-by-coordinates trajectory representation.

mod coordinate;
mod definition;
mod frames;
mod pbc;
mod set;

pub use coordinate::{CoordinateKind, InternalCoordinate};
pub use definition::{format_definition, parse_definition};
pub use frames::TrajectoryFrames;
pub use pbc::PbcResolver;
pub use set::CoordinateSet;

use crate::core::io::trr::TrrError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinateError {
    #[error("Coordinate set must contain at least one coordinate")]
    EmptySet,

    #[error("Malformed coordinate definition at byte {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Coordinate #{index}: dihedral found after linear coordinate without explicit type")]
    DihedralAfterLinear { index: usize },

    #[error("Unknown coordinate type tag '{0}'")]
    UnknownKind(String),

    #[error("Coordinate #{index}: {kind:?} requires {expected} atoms, found {found}")]
    AtomCount {
        index: usize,
        kind: CoordinateKind,
        expected: usize,
        found: usize,
    },

    #[error("Coordinate #{index}: parameter '{parameter}' is not supported for {kind:?}")]
    UnsupportedParameter {
        index: usize,
        kind: CoordinateKind,
        parameter: String,
    },

    #[error("Box of frame {frame} is not lower-triangular")]
    InvalidBox { frame: usize },

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Trajectory frames reference different coordinate sets")]
    IncompatibleSets,

    #[error("Operation requires frame weights")]
    MissingWeights,

    #[error("Operation requires at least one frame")]
    EmptyFrames,

    #[error("Frame index {index} out of range for {n_frames} frames")]
    FrameOutOfRange { index: usize, n_frames: usize },

    #[error("Cannot split {n_frames} frames into {parts} parts")]
    InvalidSplit { n_frames: usize, parts: usize },

    #[error("Atom {atom} outside of the {available} atoms read from the trajectory")]
    AtomOutOfRange { atom: usize, available: usize },

    #[error("I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Trajectory error: {0}")]
    Trajectory(#[from] TrrError),
}
