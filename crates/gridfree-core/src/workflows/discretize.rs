use crate::analysis::kmeans::KMeans;
use crate::core::coords::{CoordinateError, TrajectoryFrames};
use crate::core::io::trr::TrrReader;
use crate::core::utils::numeric::median;
use crate::engine::config::{AlphaMethod, FitMethod, NodeCreationConfig, SeedMethod};
use crate::engine::error::EngineError;
use crate::engine::fitting::{FitContext, fit_restraints, fitter_for};
use crate::engine::node::{NodeRecord, NodeState};
use crate::engine::pool::{NodeId, Pool, PoolError};
use crate::engine::progress::{Progress, ProgressReporter};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Smallest nearest-neighbour distance accepted when deriving alpha.
const MIN_THETA: f64 = 1e-5;
/// Bisection on the equidistant spacing stops below this bracket width.
const EQUIDIST_TOLERANCE: f64 = 2e-6;

/// Discretises the parent's trajectory into new partition nodes and fits
/// their restraints. Returns the created nodes.
#[instrument(skip_all, name = "create_nodes", fields(parent = %config.parent))]
pub fn run(
    pool: &mut Pool,
    config: &NodeCreationConfig,
    reporter: &ProgressReporter,
) -> Result<Vec<NodeId>, EngineError> {
    let parent = resolve_parent(pool, &config.parent)?;
    if config.seed_method == SeedMethod::Unrestrained {
        return create_unrestrained(pool, parent, config, reporter);
    }

    // === Phase 1: Seeding ===
    reporter.report(Progress::PhaseStart {
        name: "Discretizing",
    });
    let created = discretize(pool, parent, config)?;
    reporter.report(Progress::PhaseFinish);

    // === Phase 2: Restraint fitting ===
    fit_pending(pool, config.fit_method, reporter)?;

    info!(nodes = created.len(), "Node creation complete");
    Ok(created)
}

/// `"root"` names the pool's root node.
pub fn resolve_parent(pool: &Pool, name: &str) -> Result<NodeId, EngineError> {
    if name == "root" {
        return Ok(pool.root().ok_or(PoolError::NoRoot)?);
    }
    Ok(pool.require(name)?)
}

/// Picks new node positions from the parent trajectory and registers the
/// nodes as `creating-a-partition`. Alpha is updated and the pool saved, but
/// the nodes themselves are only persisted by [`fit_pending`].
pub fn discretize(
    pool: &mut Pool,
    parent: NodeId,
    config: &NodeCreationConfig,
) -> Result<Vec<NodeId>, EngineError> {
    let trajectory = pool.trajectory(parent)?;
    let frames = &trajectory.frames;

    let chosen = match config.seed_method {
        SeedMethod::KMeans => {
            let children = pool.children(parent);
            let fixed = if children.is_empty() {
                None
            } else {
                Some(pool.positions(&children)?)
            };
            let mut rng = match config.random_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let clustering = KMeans::new(config.num_nodes)
                .with_max_iterations(config.kmeans_iterations)
                .run(frames, fixed.as_ref(), &mut rng)?;
            if !clustering.converged {
                warn!(iterations = clustering.iterations, "k-means stopped before converging");
            }
            clustering.chosen
        }
        SeedMethod::Equidistant => {
            if pool.node(parent).state() == NodeState::Refined && pool.len() > 1 {
                return Err(EngineError::Precondition(
                    "equidistant seeding only works on a pool holding just the root".into(),
                ));
            }
            equidistant_indices(frames, config.num_nodes)?
        }
        SeedMethod::All => (0..frames.n_frames()).collect(),
        SeedMethod::Unrestrained => {
            return Err(EngineError::Precondition(
                "unrestrained nodes do not join the partition".into(),
            ));
        }
    };
    if chosen.is_empty() {
        return Err(EngineError::Precondition(
            "no frames were selected as new nodes".into(),
        ));
    }
    if chosen.len() != config.num_nodes {
        warn!(
            requested = config.num_nodes,
            chosen = chosen.len(),
            "Created a different number of nodes than requested"
        );
    }

    pool.record_discretization(parent);
    let parent_name = pool.node(parent).name().to_string();
    let created: Vec<NodeId> = chosen
        .iter()
        .map(|&frame| {
            let mut record = NodeRecord::new(NodeState::CreatingAPartition);
            record.parent = Some(parent_name.clone());
            record.parent_frame = Some(frame);
            record.extensions_max = config.max_extensions;
            record.extensions_length = config.extension_length;
            record.sampling_length = config.sampling_length;
            record.position = Some(frames.frame_values(frame));
            pool.create_node(record)
        })
        .collect();

    let alpha = match config.alpha_method {
        AlphaMethod::Fixed(alpha) => alpha,
        AlphaMethod::Theta => {
            let positions = pool.positions(&pool.partition_ids())?;
            let (theta, alpha) = theta_alpha(&positions)?;
            info!(theta, alpha, "Derived alpha from node spacing");
            alpha
        }
    };
    pool.set_alpha(alpha);
    pool.save()?;
    info!(parent = %parent_name, nodes = created.len(), alpha, "Discretized trajectory");
    Ok(created)
}

/// Creates `config.num_nodes` unrestrained nodes started from evenly spaced
/// frames of the parent. They skip restraint fitting, leave alpha and the
/// history untouched and are saved directly as `created`.
#[instrument(skip_all, name = "create_unrestrained_nodes")]
pub fn create_unrestrained(
    pool: &mut Pool,
    parent: NodeId,
    config: &NodeCreationConfig,
    reporter: &ProgressReporter,
) -> Result<Vec<NodeId>, EngineError> {
    let trajectory = pool.trajectory(parent)?;
    let frames = &trajectory.frames;
    let chosen = spaced_indices(frames.n_frames(), config.num_nodes);
    if chosen.is_empty() {
        return Err(EngineError::Precondition(
            "no frames were selected as new nodes".into(),
        ));
    }

    reporter.report(Progress::PhaseStart {
        name: "Creating Unrestrained Nodes",
    });
    reporter.report(Progress::TaskStart {
        total_steps: chosen.len() as u64,
    });
    let parent_name = pool.node(parent).name().to_string();
    let mut created = Vec::with_capacity(chosen.len());
    for frame in chosen {
        let mut record = NodeRecord::new(NodeState::Created);
        record.parent = Some(parent_name.clone());
        record.parent_frame = Some(frame);
        record.extensions_max = config.max_extensions;
        record.extensions_length = config.extension_length;
        record.sampling_length = config.sampling_length;
        record.position = Some(frames.frame_values(frame));
        let id = pool.create_node(record);
        pool.node_mut(id).save()?;
        write_start_frame(pool, id)?;
        reporter.report(Progress::TaskIncrement);
        created.push(id);
    }
    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);
    info!(parent = %parent_name, nodes = created.len(), "Created unrestrained nodes");
    Ok(created)
}

/// `count` frame indices spread evenly from the first to the last frame,
/// rounded down.
fn spaced_indices(n_frames: usize, count: usize) -> Vec<usize> {
    if n_frames == 0 || count == 0 {
        return Vec::new();
    }
    if count == 1 {
        return vec![0];
    }
    let last = (n_frames - 1) as f64;
    (0..count)
        .map(|i| (i as f64 * last / (count - 1) as f64) as usize)
        .collect()
}

/// Fits restraints for every `creating-a-partition` node against the current
/// partition, writes its start frame and marks it created.
pub fn fit_pending(
    pool: &mut Pool,
    method: FitMethod,
    reporter: &ProgressReporter,
) -> Result<Vec<NodeId>, EngineError> {
    let pending = pool.select(|n| n.state() == NodeState::CreatingAPartition);
    if pending.is_empty() {
        return Ok(pending);
    }
    reporter.report(Progress::PhaseStart {
        name: "Fitting Restraints",
    });

    let study = pool.study()?;
    let force_constant = study.force_constant().ok_or(PoolError::AlphaUnset)?;
    let fitter = fitter_for(method);
    let ranges = (0..pool.coordinates().len())
        .map(|c| pool.coord_range(c, fitter.range_slack()))
        .collect::<Result<Vec<_>, _>>()?;
    let partition_ids = pool.partition_ids();
    let partition = pool.partition_of(&partition_ids)?;

    reporter.report(Progress::TaskStart {
        total_steps: pending.len() as u64,
    });
    for &id in &pending {
        let node_index = partition_ids
            .iter()
            .position(|&p| p == id)
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "node '{}' is not part of the partition",
                    pool.node(id).name()
                ))
            })?;
        let ctx = FitContext {
            partition: &partition,
            node_index,
            beta: study.beta(),
            force_constant,
        };
        let restraints = fit_restraints(fitter.as_ref(), &ctx, &ranges)?;

        let node = pool.node_mut(id);
        // Leftovers of an interrupted run already have a directory.
        let relock = node.dir().exists();
        if relock && !node.lock(Duration::ZERO)? {
            return Err(EngineError::Precondition(format!(
                "node '{}' is locked by another process",
                node.name()
            )));
        }
        node.record_mut().restraints = Some(restraints);
        node.set_state(NodeState::Created)?;
        node.save()?;
        write_start_frame(pool, id)?;
        if relock {
            pool.node(id).unlock()?;
        }
        reporter.report(Progress::NodeTransition {
            node: pool.node(id).name().to_string(),
            from: NodeState::CreatingAPartition.as_str(),
            to: NodeState::Created.as_str(),
        });
        reporter.report(Progress::TaskIncrement);
    }
    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);
    info!(nodes = pending.len(), ?method, "Fitted restraints");
    Ok(pending)
}

/// Copies the parent frame a node was seeded from into its start file.
fn write_start_frame(pool: &Pool, id: NodeId) -> Result<(), EngineError> {
    let node = pool.node(id);
    let (Some(parent), Some(frame)) = (node.parent(), node.record().parent_frame) else {
        return Ok(());
    };
    let source = pool.node(pool.require(parent)?).trajectory_path();
    let mut reader = TrrReader::open(&source)?;
    let header = reader.seek_frame(frame)?;
    let bytes = reader.raw_frame(&header)?;
    let target = node.start_frame_path();
    fs::write(&target, bytes).map_err(EngineError::io(&target))?;
    debug!(node = %node.name(), frame, "Wrote start frame");
    Ok(())
}

/// Median nearest-neighbour distance `theta` of the positions and the alpha
/// `-ln(1e-3 / n) / (3 theta^2)` derived from it.
pub fn theta_alpha(positions: &TrajectoryFrames) -> Result<(f64, f64), EngineError> {
    let n = positions.n_frames();
    if n < 2 {
        return Err(EngineError::Precondition(
            "alpha from node spacing needs at least two nodes".into(),
        ));
    }
    let nearest = (0..n)
        .map(|i| {
            let distances = positions.difference(&positions.frame(i)?)?.norm();
            Ok(distances
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &d)| d)
                .fold(f64::INFINITY, f64::min))
        })
        .collect::<Result<Vec<f64>, CoordinateError>>()?;
    let theta = median(&nearest).unwrap_or(0.0);
    if !(theta > MIN_THETA) {
        return Err(EngineError::Precondition(format!(
            "nodes are too close to derive alpha (theta = {theta:e})"
        )));
    }
    let alpha = -(1e-3 / n as f64).ln() / (3.0 * theta * theta);
    Ok((theta, alpha))
}

/// Frames spaced roughly evenly by their distance from frame 0.
///
/// The spacing is bisected until exactly `count` frames are picked or the
/// bracket collapses; the closest result is returned in the latter case.
pub fn equidistant_indices(
    frames: &TrajectoryFrames,
    count: usize,
) -> Result<Vec<usize>, EngineError> {
    if frames.is_empty() || count == 0 {
        return Ok(Vec::new());
    }
    let distances = frames.difference(&frames.frame(0)?)?.norm();
    let mut order: Vec<usize> = (0..frames.n_frames()).collect();
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));

    let pick = |theta: f64| -> Vec<usize> {
        let mut chosen = Vec::new();
        let mut rest = &order[..];
        while let Some(&first) = rest.first() {
            chosen.push(first);
            let reference = distances[first];
            let covered = rest
                .iter()
                .take_while(|&&i| distances[i] - reference < theta)
                .count()
                .max(1);
            rest = &rest[covered..];
        }
        chosen
    };

    let mut low = 0.0;
    let mut high = distances.max();
    let mut theta = high / 2.0;
    loop {
        let chosen = pick(theta);
        if chosen.len() < count {
            high = theta;
        } else {
            low = theta;
        }
        if chosen.len() == count || high - low < EQUIDIST_TOLERANCE {
            debug!(theta, chosen = chosen.len(), "Equidistant spacing found");
            return Ok(chosen);
        }
        theta = (low + high) / 2.0;
    }
}
