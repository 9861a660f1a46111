//! File formats consumed and produced by the library: GROMACS TRR
//! trajectories and the versioned TOML snapshots of pools and nodes.

pub mod traits;
pub mod trr;
