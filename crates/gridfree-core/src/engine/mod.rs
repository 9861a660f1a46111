//! # Engine Module
//!
//! The stateful layer of the sampling workflow. It owns the pool directory,
//! the node lifecycle and the cross-process locks, and turns the stateless
//! [`crate::core`] models into restraints for new nodes.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Study parameters and per-workflow option structs
//! - **Locking** ([`lock`]) - File-marker locks with pluggable liveness checks
//! - **Nodes** ([`node`]) - Node lifecycle states and persisted snapshots
//! - **Pool** ([`pool`]) - Node registry, history and the current phi partition
//! - **Restraint Fitting** ([`fitting`]) - Harmonic, plateau and least-squares fitters
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress events
//! - **Error Handling** ([`error`]) - The aggregated [`error::EngineError`]
//!
//! Locks are never broken implicitly. Any operation touching several nodes
//! takes them with [`pool::Pool::multilock`] first and saves a node only while
//! holding its lock.

pub mod config;
pub mod error;
pub mod fitting;
pub mod lock;
pub mod node;
pub mod pool;
pub mod progress;
pub mod utils;
