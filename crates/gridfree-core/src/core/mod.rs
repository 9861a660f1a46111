//! # Core Module
//!
//! Stateless building blocks of the sampling workflow: the internal-coordinate
//! space, trajectory I/O, restraint potentials and the phi membership
//! functions.
//!
//! ## Architecture
//!
//! - **Coordinate Space** ([`coords`]) - Coordinate definitions, periodic-boundary resolution
//!   and the frames-by-coordinates [`coords::TrajectoryFrames`] representation
//! - **File I/O** ([`io`]) - GROMACS TRR trajectories and versioned TOML snapshots
//! - **Restraints** ([`restraint`]) - Flat-bottomed dihedral and distance potentials
//! - **Partition** ([`phi`]) - Soft membership functions over node centres
//! - **Utilities** ([`utils`]) - Geometry and small numeric helpers
//!
//! Nothing in this layer touches the pool directory or holds locks; that is the
//! job of the [`crate::engine`] layer.

pub mod constants;
pub mod coords;
pub mod io;
pub mod phi;
pub mod restraint;
pub mod utils;
