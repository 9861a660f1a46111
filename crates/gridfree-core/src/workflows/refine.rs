use super::discretize::{discretize, fit_pending};
use super::md::MdEngine;
use super::{prepare, transition, with_multilock};
use crate::analysis::kmeans::KMeans;
use crate::engine::config::{AlphaMethod, NodeCreationConfig, RefineOptions, RefinePolicy, SeedMethod};
use crate::engine::error::EngineError;
use crate::engine::node::NodeState;
use crate::engine::pool::{NodeId, Pool, PoolError};
use crate::engine::progress::{Progress, ProgressReporter};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Squared distance between the two k-means centroids of a converged
/// trajectory above which the node counts as falsely converged.
const FAKE_CONVERGENCE_DISTANCE: f64 = 2.0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefineSummary {
    /// Nodes split into children.
    pub refined: Vec<String>,
    /// Nodes sent back for another extension.
    pub extended: Vec<String>,
    pub created: usize,
}

/// Refines or extends the sampled partition nodes, then prepares whatever
/// was created.
///
/// A refined node leaves the partition before its children's restraints are
/// fitted, so the children split its region among themselves.
#[instrument(skip_all, name = "refine")]
pub fn run(
    pool: &mut Pool,
    engine: &dyn MdEngine,
    options: &RefineOptions,
    guard: Duration,
    reporter: &ProgressReporter,
) -> Result<RefineSummary, EngineError> {
    let needy = pool.select(|n| n.is_partition() && n.is_sampled());
    if needy.is_empty() {
        info!("No sampled partition node to refine");
        return Ok(RefineSummary::default());
    }

    reporter.report(Progress::PhaseStart { name: "Refining" });
    let summary = with_multilock(pool, &needy, guard, false, |pool, owned| {
        let mut summary = RefineSummary::default();
        for &id in owned {
            match pool.node(id).state() {
                NodeState::Converged => {
                    if options.refine_fake_converged && is_fake_converged(pool, id, options)? {
                        info!(node = %pool.node(id).name(), "Converged node splits into distant clusters");
                        summary.created += refine_node(pool, id, options, reporter)?;
                        summary.refined.push(pool.node(id).name().to_string());
                    }
                }
                NodeState::NotConverged => match options.not_converged {
                    RefinePolicy::Refine => {
                        summary.created += refine_node(pool, id, options, reporter)?;
                        summary.refined.push(pool.node(id).name().to_string());
                    }
                    RefinePolicy::Extend => {
                        pool.node_mut(id).record_mut().extensions_counter += 1;
                        transition(pool, id, NodeState::MdrunAble, reporter)?;
                        summary.extended.push(pool.node(id).name().to_string());
                    }
                },
                _ => continue,
            }
        }
        if !summary.refined.is_empty() {
            fit_pending(pool, options.fit_method, reporter)?;
        }
        for &id in owned {
            pool.node_mut(id).save()?;
        }
        Ok(summary)
    })?;
    reporter.report(Progress::PhaseFinish);

    if summary.created > 0 || !summary.extended.is_empty() {
        prepare::run(pool, engine, guard, reporter)?;
    }
    info!(
        refined = summary.refined.len(),
        extended = summary.extended.len(),
        created = summary.created,
        "Refinement complete"
    );
    Ok(summary)
}

/// Splits the node's trajectory in two with k-means and compares the
/// centroids.
fn is_fake_converged(pool: &mut Pool, id: NodeId, options: &RefineOptions) -> Result<bool, EngineError> {
    let trajectory = pool.trajectory(id)?;
    if trajectory.frames.n_frames() < 2 {
        return Ok(false);
    }
    let mut rng = match options.random_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let clustering = KMeans::new(2).run(&trajectory.frames, None, &mut rng)?;
    let centroids = &clustering.centroids;
    let spread = centroids.frame(0)?.difference(&centroids.frame(1)?)?.norm2()[0];
    debug!(node = %pool.node(id).name(), spread, "Centroid separation");
    Ok(spread > FAKE_CONVERGENCE_DISTANCE)
}

/// Seeds children from the node's trajectory and takes the node out of the
/// partition. Restraints are fitted later for all new nodes at once.
fn refine_node(
    pool: &mut Pool,
    id: NodeId,
    options: &RefineOptions,
    reporter: &ProgressReporter,
) -> Result<usize, EngineError> {
    let alpha = pool.alpha().ok_or(PoolError::AlphaUnset)?;
    let config = NodeCreationConfig {
        parent: pool.node(id).name().to_string(),
        num_nodes: options.num_nodes,
        seed_method: SeedMethod::KMeans,
        alpha_method: AlphaMethod::Fixed(alpha),
        fit_method: options.fit_method,
        random_seed: options.random_seed,
        ..Default::default()
    };
    let children = discretize(pool, id, &config)?;
    transition(pool, id, NodeState::Refined, reporter)?;
    Ok(children.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::FitMethod;
    use crate::workflows::md::tests::ScriptedEngine;
    use crate::workflows::tests::{force_sampled, seeded_pool};

    fn options(policy: RefinePolicy, fake: bool) -> RefineOptions {
        RefineOptions {
            not_converged: policy,
            refine_fake_converged: fake,
            num_nodes: 2,
            fit_method: FitMethod::Harmonic,
            random_seed: Some(3),
        }
    }

    fn two_blobs() -> Vec<f64> {
        (0..20)
            .map(|i| if i % 2 == 0 { 0.01 * i as f64 } else { 3.0 + 0.01 * i as f64 })
            .collect()
    }

    #[test]
    fn not_converged_node_is_split_into_runnable_children() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        let drift: Vec<f64> = (0..20).map(|i| 0.05 * i as f64).collect();
        force_sampled(&mut pool, ids[0], NodeState::NotConverged, &drift);
        force_sampled(&mut pool, ids[1], NodeState::Converged, &[1.0, 1.1]);
        let engine = ScriptedEngine::default();

        let summary = run(
            &mut pool,
            &engine,
            &options(RefinePolicy::Refine, false),
            Duration::ZERO,
            &ProgressReporter::new(),
        )
        .unwrap();
        assert_eq!(summary.refined, vec!["node0001"]);
        assert_eq!(summary.created, 2);

        let parent = pool.node(ids[0]);
        assert_eq!(parent.state(), NodeState::Refined);
        assert!(!parent.is_partition());
        assert!(!parent.is_locked());

        let children = pool.children(ids[0]);
        assert_eq!(children.len(), 2);
        for id in children {
            assert_eq!(pool.node(id).state(), NodeState::MdrunAble);
            assert!(pool.node(id).has_restraints());
        }
        assert_eq!(pool.alpha(), Some(1.0));
        assert_eq!(pool.history().len(), 2);
        assert_eq!(pool.history()[1].node, "node0001");
        assert_eq!(pool.history()[1].node_state, NodeState::NotConverged);
        assert_eq!(pool.node(ids[1]).state(), NodeState::Converged);
    }

    #[test]
    fn extend_policy_sends_node_back_to_sampling() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        force_sampled(&mut pool, ids[0], NodeState::NotConverged, &[0.0, 0.1]);
        let summary = run(
            &mut pool,
            &ScriptedEngine::default(),
            &options(RefinePolicy::Extend, false),
            Duration::ZERO,
            &ProgressReporter::new(),
        )
        .unwrap();
        assert_eq!(summary.extended, vec!["node0001"]);
        let node = pool.node(ids[0]);
        assert_eq!(node.state(), NodeState::MdrunAble);
        assert_eq!(node.record().extensions_counter, 1);
    }

    #[test]
    fn converged_node_with_two_clusters_is_refined() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        force_sampled(&mut pool, ids[0], NodeState::Converged, &two_blobs());
        let summary = run(
            &mut pool,
            &ScriptedEngine::default(),
            &options(RefinePolicy::Refine, true),
            Duration::ZERO,
            &ProgressReporter::new(),
        )
        .unwrap();
        assert_eq!(summary.refined, vec!["node0001"]);
    }

    #[test]
    fn converged_nodes_are_kept_without_the_check() {
        let (_dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        force_sampled(&mut pool, ids[0], NodeState::Converged, &two_blobs());
        let summary = run(
            &mut pool,
            &ScriptedEngine::default(),
            &options(RefinePolicy::Refine, false),
            Duration::ZERO,
            &ProgressReporter::new(),
        )
        .unwrap();
        assert_eq!(summary, RefineSummary::default());
        assert_eq!(pool.node(ids[0]).state(), NodeState::Converged);
    }
}
