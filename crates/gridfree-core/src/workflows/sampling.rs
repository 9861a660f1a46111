use super::md::{MdEngine, MdJob, engine_error};
use super::{refine, transition};
use crate::analysis::convergence::{ConvergenceReport, GelmanRubin};
use crate::engine::config::{RefineOptions, WorkerOptions};
use crate::engine::error::EngineError;
use crate::engine::node::NodeState;
use crate::engine::pool::{NodeId, Pool};
use crate::engine::progress::{Progress, ProgressReporter};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub converged: Vec<String>,
    pub not_converged: Vec<String>,
    /// Transition nodes that used up their repeat runs.
    pub ready: Vec<String>,
    /// Nodes that stay runnable for another extension.
    pub extended: Vec<String>,
    pub failed: Vec<String>,
    pub refinements: u32,
}

/// Runs nodes until none is left to sample.
///
/// Each round re-reads the pool, locks the first runnable node, samples it
/// and decides its next state from the convergence test. A failing node is
/// marked `mdrun-failed` and the worker moves on. Once nothing is runnable,
/// up to `options.auto_refines` refinement rounds are started.
#[instrument(skip_all, name = "sampling_worker")]
pub fn run(
    pool: &mut Pool,
    engine: &dyn MdEngine,
    options: &WorkerOptions,
    refine_options: &RefineOptions,
    reporter: &ProgressReporter,
) -> Result<WorkerSummary, EngineError> {
    if options.convtest_only {
        return convergence_only(pool, reporter);
    }

    let mut summary = WorkerSummary::default();
    loop {
        pool.reload()?;
        pool.reload_nodes()?;

        let Some(id) = lock_runnable(pool, options)? else {
            if summary.refinements < options.auto_refines {
                summary.refinements += 1;
                info!(
                    round = summary.refinements,
                    of = options.auto_refines,
                    "No runnable node left, refining the pool"
                );
                refine::run(pool, engine, refine_options, options.lock_guard, reporter)?;
                continue;
            }
            break;
        };

        let name = pool.node(id).name().to_string();
        reporter.report(Progress::PhaseStart { name: "Sampling" });
        let outcome = sample_node(pool, engine, id, reporter).or_else(|e| {
            error!(node = %name, error = %e, "Sampling failed");
            mark_failed(pool, id, reporter).map(|()| NodeState::MdrunFailed)
        });
        reporter.report(Progress::PhaseFinish);
        let released = pool.node(id).unlock();
        match outcome? {
            NodeState::Converged => summary.converged.push(name),
            NodeState::MdrunAble => summary.extended.push(name),
            NodeState::Ready => summary.ready.push(name),
            NodeState::MdrunFailed => summary.failed.push(name),
            _ => summary.not_converged.push(name),
        }
        released?;
    }

    info!(
        converged = summary.converged.len(),
        not_converged = summary.not_converged.len(),
        ready = summary.ready.len(),
        failed = summary.failed.len(),
        "Worker finished"
    );
    Ok(summary)
}

/// Locks the first runnable node, re-reading it once the lock is held.
fn lock_runnable(pool: &mut Pool, options: &WorkerOptions) -> Result<Option<NodeId>, EngineError> {
    for id in pool.select(|n| n.state() == NodeState::MdrunAble) {
        if !pool.node(id).lock(options.lock_guard)? {
            continue;
        }
        let node = pool.node_mut(id);
        node.reload()?;
        if node.state() == NodeState::MdrunAble {
            return Ok(Some(id));
        }
        node.unlock()?;
    }
    Ok(None)
}

/// Extends (if sampled before) and runs one node, then tests convergence.
/// Returns the node's new state.
fn sample_node(
    pool: &mut Pool,
    engine: &dyn MdEngine,
    id: NodeId,
    reporter: &ProgressReporter,
) -> Result<NodeState, EngineError> {
    let study = pool.study()?;
    {
        let node = pool.node(id);
        let job = MdJob::for_node(node, pool.coordinates());
        let record = node.record();
        if record.extensions_counter > 0 {
            info!(node = %node.name(), extension = record.extensions_counter, "Extending run");
            engine
                .extend(&job, record.extensions_length)
                .map_err(engine_error(node.name()))?;
        }
        info!(node = %node.name(), "Running MD");
        engine.run(&job).map_err(engine_error(node.name()))?;
    }

    let report = convergence_test(pool, id, GelmanRubin::new(study.gr_threshold, study.gr_chains))?;

    let node = pool.node_mut(id);
    let record = node.record();
    let budget_spent = record.extensions_counter >= record.extensions_max;
    // Transition runs are repeated until the budget is spent, converged or not.
    let next = if node.is_transition() && budget_spent {
        NodeState::Ready
    } else if report.converged && !node.is_transition() {
        NodeState::Converged
    } else if budget_spent {
        NodeState::NotConverged
    } else {
        node.record_mut().extensions_counter += 1;
        NodeState::MdrunAble
    };
    transition(pool, id, next, reporter)?;
    pool.node_mut(id).save()?;
    Ok(next)
}

/// Gelman-Rubin test on the node's weighted trajectory; the result is logged
/// next to the node and kept in its observables.
fn convergence_test(
    pool: &mut Pool,
    id: NodeId,
    test: GelmanRubin,
) -> Result<ConvergenceReport, EngineError> {
    let trajectory = pool.trajectory(id)?;
    let report = test.evaluate(&trajectory.frames)?;
    let node = pool.node_mut(id);
    node.append_log(&node.convergence_log_path(), &report.summary())?;
    node.observables_mut().shrink_factors = Some(report.shrink_factors.clone());
    info!(
        node = %node.name(),
        converged = report.converged,
        runaway = report.runaway,
        "Convergence test"
    );
    Ok(report)
}

/// Restores the node from disk and marks it failed.
fn mark_failed(pool: &mut Pool, id: NodeId, reporter: &ProgressReporter) -> Result<(), EngineError> {
    pool.node_mut(id).reload()?;
    transition(pool, id, NodeState::MdrunFailed, reporter)?;
    pool.node_mut(id).save()?;
    Ok(())
}

/// Re-runs the convergence test on every sampled node without changing any
/// state. Returns the node names with their test outcome.
fn convergence_only(pool: &mut Pool, reporter: &ProgressReporter) -> Result<WorkerSummary, EngineError> {
    let study = pool.study()?;
    let test = GelmanRubin::new(study.gr_threshold, study.gr_chains);
    let sampled = pool.select(|n| matches!(n.state(), NodeState::Converged | NodeState::NotConverged));

    reporter.report(Progress::PhaseStart {
        name: "Convergence Test",
    });
    reporter.report(Progress::TaskStart {
        total_steps: sampled.len() as u64,
    });
    let mut summary = WorkerSummary::default();
    for id in sampled {
        let name = pool.node(id).name().to_string();
        let report = pool
            .trajectory(id)
            .map_err(EngineError::from)
            .and_then(|t| Ok(test.evaluate(&t.frames)?));
        match report {
            Ok(report) if report.converged => summary.converged.push(name),
            Ok(_) => summary.not_converged.push(name),
            Err(e) => {
                warn!(node = %name, error = %e, "Convergence test failed");
                summary.failed.push(name);
            }
        }
        reporter.report(Progress::TaskIncrement);
    }
    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::md::tests::ScriptedEngine;
    use crate::workflows::prepare;
    use crate::workflows::tests::seeded_pool;
    use std::time::Duration;

    /// Frames alternating around `centre`: every chain has the same mean.
    fn stationary(centre: f64) -> Vec<f64> {
        (0..20).map(|i| centre + if i % 2 == 0 { 0.05 } else { 0.1 }).collect()
    }

    fn drifting(start: f64) -> Vec<f64> {
        (0..20).map(|i| start + 0.05 * i as f64).collect()
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            lock_guard: Duration::ZERO,
            ..Default::default()
        }
    }

    fn runnable_pool(max_extensions: u32) -> (tempfile::TempDir, Pool, Vec<NodeId>) {
        let (dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], max_extensions);
        prepare::run(&mut pool, &ScriptedEngine::default(), Duration::ZERO, &ProgressReporter::new()).unwrap();
        (dir, pool, ids)
    }

    #[test]
    fn stationary_runs_converge() {
        let (_dir, mut pool, ids) = runnable_pool(2);
        let mut engine = ScriptedEngine::with_trajectory(&stationary(0.0));
        engine.trajectories.insert("node0002".into(), stationary(1.0));

        let summary = run(&mut pool, &engine, &options(), &RefineOptions::default(), &ProgressReporter::new()).unwrap();
        assert_eq!(summary.converged, vec!["node0001", "node0002"]);
        for &id in &ids {
            let node = pool.node(id);
            assert_eq!(node.state(), NodeState::Converged);
            assert!(!node.is_locked());
            assert_eq!(node.observables().shrink_factors.as_ref().map(Vec::len), Some(1));
            let log = std::fs::read_to_string(node.convergence_log_path()).unwrap();
            assert!(log.contains("=> converged"));
        }
    }

    #[test]
    fn drifting_run_is_extended_until_the_budget_is_spent() {
        let (_dir, mut pool, ids) = runnable_pool(1);
        let mut engine = ScriptedEngine::with_trajectory(&stationary(1.0));
        engine.trajectories.insert("node0001".into(), drifting(0.0));

        let summary = run(&mut pool, &engine, &options(), &RefineOptions::default(), &ProgressReporter::new()).unwrap();
        assert_eq!(summary.extended, vec!["node0001"]);
        assert_eq!(summary.not_converged, vec!["node0001"]);

        let node = pool.node(ids[0]);
        assert_eq!(node.state(), NodeState::NotConverged);
        assert_eq!(node.record().extensions_counter, 1);
        assert!(engine.calls().contains(&"extend:node0001".to_string()));
        assert_eq!(pool.node(ids[1]).state(), NodeState::Converged);
    }

    #[test]
    fn engine_failure_marks_the_node_failed() {
        let (_dir, mut pool, ids) = runnable_pool(0);
        let mut engine = ScriptedEngine::with_trajectory(&stationary(1.0));
        engine.failing.push("node0001".into());

        let summary = run(&mut pool, &engine, &options(), &RefineOptions::default(), &ProgressReporter::new()).unwrap();
        assert_eq!(summary.failed, vec!["node0001"]);
        assert_eq!(pool.node(ids[0]).state(), NodeState::MdrunFailed);
        assert!(!pool.node(ids[0]).is_locked());
        assert_eq!(pool.node(ids[1]).state(), NodeState::Converged);
    }

    #[test]
    fn transition_node_is_repeated_then_ready() {
        use crate::engine::config::{NodeCreationConfig, SeedMethod};
        use crate::engine::pool::tests::pool_with_root;
        use crate::workflows::discretize;

        let (_dir, mut pool) = pool_with_root(None, &[0.0, 0.5, 1.0]);
        let config = NodeCreationConfig {
            num_nodes: 1,
            seed_method: SeedMethod::Unrestrained,
            max_extensions: 1,
            ..Default::default()
        };
        let created = discretize::run(&mut pool, &config, &ProgressReporter::new()).unwrap();
        prepare::run(&mut pool, &ScriptedEngine::default(), Duration::ZERO, &ProgressReporter::new()).unwrap();
        assert_eq!(pool.node(created[0]).state(), NodeState::MdrunAble);

        let engine = ScriptedEngine::with_trajectory(&stationary(0.5));
        let summary = run(&mut pool, &engine, &options(), &RefineOptions::default(), &ProgressReporter::new()).unwrap();
        assert_eq!(summary.extended, vec!["node0001"]);
        assert_eq!(summary.ready, vec!["node0001"]);
        assert!(summary.converged.is_empty());

        let node = pool.node(created[0]);
        assert_eq!(node.state(), NodeState::Ready);
        assert_eq!(node.record().extensions_counter, 1);
        assert!(!node.is_locked());
        let runs = engine.calls().iter().filter(|c| *c == "run:node0001").count();
        assert_eq!(runs, 2);
    }

    #[test]
    fn unrecordable_failure_still_releases_the_lock() {
        let (_dir, mut pool, ids) = runnable_pool(0);
        let mut engine = ScriptedEngine::with_trajectory(&stationary(1.0));
        engine.vanishing.push("node0001".into());

        assert!(run(&mut pool, &engine, &options(), &RefineOptions::default(), &ProgressReporter::new()).is_err());
        assert!(!pool.node(ids[0]).is_locked());
    }

    #[test]
    fn convergence_only_mode_leaves_states_alone() {
        let (_dir, mut pool, ids) = runnable_pool(0);
        let mut engine = ScriptedEngine::with_trajectory(&stationary(1.0));
        engine.trajectories.insert("node0001".into(), drifting(0.0));
        run(&mut pool, &engine, &options(), &RefineOptions::default(), &ProgressReporter::new()).unwrap();

        let opts = WorkerOptions {
            convtest_only: true,
            ..options()
        };
        let summary = run(&mut pool, &engine, &opts, &RefineOptions::default(), &ProgressReporter::new()).unwrap();
        assert_eq!(summary.not_converged, vec!["node0001"]);
        assert_eq!(summary.converged, vec!["node0002"]);
        assert_eq!(pool.node(ids[0]).state(), NodeState::NotConverged);
    }
}
