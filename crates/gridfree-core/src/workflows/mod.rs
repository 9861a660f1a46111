//! # Workflows Module
//!
//! The user-facing steps of a sampling study. Each workflow takes an open
//! [`Pool`], does its work under the node locks it needs and reports
//! progress through a [`ProgressReporter`].
//!
//! ## Lifecycle
//!
//! - **Pool creation** ([`create_pool`]) - Pool directory and root node from a presampling run
//! - **Discretisation** ([`discretize`]) - New partition nodes and their restraints
//! - **Preparation** ([`prepare`]) - Hands created nodes to the MD engine until they are runnable
//! - **Sampling** ([`sampling`]) - Worker loop running nodes and testing convergence
//! - **Refinement** ([`refine`]) - Splits or extends nodes after sampling
//! - **Reweighting** ([`reweight`]) - Direct free-energy weights of the partition nodes
//! - **Analysis** ([`analyze`]) - Overlap matrices, symmetrisation and PCCA+
//! - **Recovery** ([`recover`]) - Stale locks, failed runs and node removal
//! - **Export** ([`export`]) - Tabular summary of the pool
//!
//! The external MD program sits behind the [`md::MdEngine`] trait.

pub mod analyze;
pub mod create_pool;
pub mod discretize;
pub mod export;
pub mod md;
pub mod prepare;
pub mod recover;
pub mod refine;
pub mod reweight;
pub mod sampling;

use crate::engine::error::EngineError;
use crate::engine::node::NodeState;
use crate::engine::pool::{NodeId, Pool};
use crate::engine::progress::{Progress, ProgressReporter};
use std::time::Duration;

/// Locks `ids`, runs `f` on the nodes actually owned and releases them again,
/// also when `f` fails. With `require_all`, failing to lock any node is an
/// error and `f` is not run.
pub(crate) fn with_multilock<T>(
    pool: &mut Pool,
    ids: &[NodeId],
    guard: Duration,
    require_all: bool,
    f: impl FnOnce(&mut Pool, &[NodeId]) -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let owned = pool.multilock(ids, guard)?;
    if require_all && owned.len() != ids.len() {
        pool.unlock(&owned)?;
        return Err(EngineError::Precondition(format!(
            "could only lock {} of {} nodes; another process is working on the pool",
            owned.len(),
            ids.len()
        )));
    }
    let result = f(pool, &owned);
    let released = pool.unlock(&owned);
    let value = result?;
    released?;
    Ok(value)
}

/// Moves a node to `next` and reports the transition.
pub(crate) fn transition(
    pool: &mut Pool,
    id: NodeId,
    next: NodeState,
    reporter: &ProgressReporter,
) -> Result<(), EngineError> {
    let node = pool.node_mut(id);
    let from = node.state();
    node.set_state(next)?;
    reporter.report(Progress::NodeTransition {
        node: node.name().to_string(),
        from: from.as_str(),
        to: next.as_str(),
    });
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::config::{AlphaMethod, FitMethod, NodeCreationConfig, SeedMethod};
    use crate::engine::pool::tests::{pool_with_root, write_distances};
    use tempfile::TempDir;

    /// Pool with one partition node per root frame, alpha 1 and harmonic
    /// restraints. Nodes are left in `created`.
    pub(crate) fn seeded_pool(root: &[f64], max_extensions: u32) -> (TempDir, Pool, Vec<NodeId>) {
        let (dir, mut pool) = pool_with_root(None, root);
        let config = NodeCreationConfig {
            num_nodes: root.len(),
            seed_method: SeedMethod::All,
            alpha_method: AlphaMethod::Fixed(1.0),
            fit_method: FitMethod::Harmonic,
            max_extensions,
            ..Default::default()
        };
        let ids = discretize::run(&mut pool, &config, &ProgressReporter::new()).unwrap();
        (dir, pool, ids)
    }

    /// Forces a node into `state` with the given trajectory, bypassing the
    /// lifecycle.
    pub(crate) fn force_sampled(pool: &mut Pool, id: NodeId, state: NodeState, distances: &[f64]) {
        let node = pool.node_mut(id);
        assert!(node.lock(Duration::ZERO).unwrap());
        node.record_mut().state = state;
        node.save().unwrap();
        node.unlock().unwrap();
        write_distances(&node.trajectory_path(), distances);
    }

    #[test]
    fn multilock_releases_nodes_when_the_closure_fails() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        let err = with_multilock(&mut pool, &ids, Duration::ZERO, true, |_, owned| {
            assert_eq!(owned.len(), 2);
            Err::<(), _>(EngineError::Precondition("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
        assert!(ids.iter().all(|&id| !pool.node(id).is_locked()));
    }

    #[test]
    fn require_all_refuses_partially_locked_sets() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        assert!(pool.node(ids[0]).lock(Duration::ZERO).unwrap());
        let result = with_multilock(&mut pool, &ids, Duration::ZERO, true, |_, _| Ok(()));
        assert!(matches!(result, Err(EngineError::Precondition(_))));
        assert!(!pool.node(ids[1]).is_locked());
        assert!(pool.node(ids[0]).is_locked());
    }
}
