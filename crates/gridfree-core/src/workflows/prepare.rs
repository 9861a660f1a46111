use super::md::{MdEngine, MdJob, engine_error};
use super::{transition, with_multilock};
use crate::engine::error::EngineError;
use crate::engine::node::NodeState;
use crate::engine::pool::Pool;
use crate::engine::progress::{Progress, ProgressReporter};
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareSummary {
    /// Nodes moved from created to grompp-able.
    pub set_up: Vec<String>,
    /// Nodes moved from grompp-able to mdrun-able.
    pub preprocessed: Vec<String>,
}

/// Drives every created node through the engine's setup and preprocessing
/// steps until it is runnable.
///
/// Setup needs every created node; preprocessing takes whichever
/// grompp-able nodes are free.
#[instrument(skip_all, name = "prepare_nodes")]
pub fn run(
    pool: &mut Pool,
    engine: &dyn MdEngine,
    guard: Duration,
    reporter: &ProgressReporter,
) -> Result<PrepareSummary, EngineError> {
    let mut summary = PrepareSummary::default();

    // === Phase 1: Setup ===
    let created = pool.select(|n| n.state() == NodeState::Created);
    if !created.is_empty() {
        reporter.report(Progress::PhaseStart {
            name: "Setting Up Nodes",
        });
        summary.set_up = with_multilock(pool, &created, guard, true, |pool, owned| {
            let mut done = Vec::with_capacity(owned.len());
            for &id in owned {
                let node = pool.node(id);
                let name = node.name().to_string();
                engine
                    .setup(&MdJob::for_node(node, pool.coordinates()))
                    .map_err(engine_error(&name))?;
                transition(pool, id, NodeState::GromppAble, reporter)?;
                pool.node_mut(id).save()?;
                done.push(name);
            }
            Ok(done)
        })?;
        reporter.report(Progress::PhaseFinish);
    }

    // === Phase 2: Preprocessing ===
    let grompp_able = pool.select(|n| n.state() == NodeState::GromppAble);
    if !grompp_able.is_empty() {
        reporter.report(Progress::PhaseStart {
            name: "Preprocessing Nodes",
        });
        summary.preprocessed = with_multilock(pool, &grompp_able, guard, false, |pool, owned| {
            let mut done = Vec::with_capacity(owned.len());
            for &id in owned {
                let node = pool.node(id);
                let name = node.name().to_string();
                engine
                    .preprocess(&MdJob::for_node(node, pool.coordinates()))
                    .map_err(engine_error(&name))?;
                transition(pool, id, NodeState::MdrunAble, reporter)?;
                pool.node_mut(id).save()?;
                done.push(name);
            }
            Ok(done)
        })?;
        reporter.report(Progress::PhaseFinish);
    }

    info!(
        set_up = summary.set_up.len(),
        preprocessed = summary.preprocessed.len(),
        "Node preparation complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::md::tests::ScriptedEngine;
    use crate::workflows::tests::seeded_pool;

    #[test]
    fn created_nodes_become_runnable() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        let engine = ScriptedEngine::default();
        let summary = run(&mut pool, &engine, Duration::ZERO, &ProgressReporter::new()).unwrap();

        assert_eq!(summary.set_up, vec!["node0001", "node0002"]);
        assert_eq!(summary.preprocessed, summary.set_up);
        for &id in &ids {
            assert_eq!(pool.node(id).state(), NodeState::MdrunAble);
            assert!(!pool.node(id).is_locked());
        }
        assert_eq!(
            engine.calls(),
            vec![
                "setup:node0001",
                "setup:node0002",
                "preprocess:node0001",
                "preprocess:node0002"
            ]
        );
    }

    #[test]
    fn locked_created_node_blocks_setup() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        assert!(pool.node(ids[1]).lock(Duration::ZERO).unwrap());
        let engine = ScriptedEngine::default();
        let err = run(&mut pool, &engine, Duration::ZERO, &ProgressReporter::new()).unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
        assert!(engine.calls().is_empty());
        assert_eq!(pool.node(ids[0]).state(), NodeState::Created);
    }

    #[test]
    fn nothing_to_prepare_is_not_an_error() {
        let (_dir, mut pool, _ids) = seeded_pool(&[0.0, 1.0], 0);
        let engine = ScriptedEngine::default();
        run(&mut pool, &engine, Duration::ZERO, &ProgressReporter::new()).unwrap();
        let summary = run(&mut pool, &engine, Duration::ZERO, &ProgressReporter::new()).unwrap();
        assert_eq!(summary, PrepareSummary::default());
    }
}
