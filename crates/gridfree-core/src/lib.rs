//! # gridfree Core Library
//!
//! Bookkeeping, scheduling and analysis for grid-free conformational sampling.
//! Conformational space, spanned by a set of internal coordinates, is split
//! into soft cells by a phi-function partition; every cell is sampled by a
//! restrained molecular-dynamics run whose results are reweighted and
//! clustered into metastable sets.
//!
//! ## Architectural Philosophy
//!
//! The library keeps the same strict layering throughout:
//!
//! - **[`core`]: The Foundation.** Stateless models: internal coordinates and
//!   periodic boundaries, trajectory frames, the phi partition, restraint
//!   potentials, and the TRR and snapshot I/O.
//!
//! - **[`engine`]: The Stateful Layer.** The on-disk node pool and its file
//!   locks, the node lifecycle, restraint fitting, configuration, errors and
//!   progress reporting.
//!
//! - **[`analysis`]: The Ensemble Algorithms.** Gelman-Rubin convergence,
//!   k-means seeding, overlap matrices, symmetrisation, direct reweighting
//!   and PCCA+.
//!
//! - **[`workflows`]: The Public API.** Complete procedures (pool creation,
//!   discretisation, the sampling worker, refinement, reweighting, analysis,
//!   recovery and export) composed from the lower layers. The MD program is
//!   reached only through the [`workflows::md::MdEngine`] trait.

pub mod analysis;
pub mod core;
pub mod engine;
pub mod workflows;
