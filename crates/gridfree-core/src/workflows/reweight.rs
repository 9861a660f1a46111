use super::with_multilock;
use crate::analysis::reweight::{NodeSample, direct_weights, entropy_weights};
use crate::engine::config::{ReweightMethod, ReweightOptions};
use crate::engine::error::EngineError;
use crate::engine::node::{Node, NodeState};
use crate::engine::pool::Pool;
use crate::engine::progress::{Progress, ProgressReporter};
use nalgebra::DVector;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument};

/// Supplies the potential energy of every frame of a node's trajectory.
pub trait EnergySource {
    fn energies(&self, node: &Node) -> Result<DVector<f64>, EngineError>;
}

/// Reads `<name>_energies.csv` from the node directory, one row per frame.
#[derive(Debug, Clone)]
pub struct CsvEnergySource {
    /// Header of the column holding the energies in kJ/mol.
    pub column: String,
}

impl Default for CsvEnergySource {
    fn default() -> Self {
        Self {
            column: "energy".to_string(),
        }
    }
}

impl CsvEnergySource {
    pub fn path(node: &Node) -> PathBuf {
        node.dir().join(format!("{}_energies.csv", node.name()))
    }
}

impl EnergySource for CsvEnergySource {
    fn energies(&self, node: &Node) -> Result<DVector<f64>, EngineError> {
        let path = Self::path(node);
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(&path)?;
        let column = reader
            .headers()?
            .iter()
            .position(|h| h == self.column)
            .ok_or_else(|| {
                EngineError::Precondition(format!(
                    "'{}' has no column '{}'",
                    path.display(),
                    self.column
                ))
            })?;
        let mut values = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let value = record
                .get(column)
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| {
                    EngineError::Precondition(format!(
                        "'{}' row {}: no energy value",
                        path.display(),
                        row + 1
                    ))
                })?;
            values.push(value);
        }
        Ok(DVector::from_vec(values))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReweightSummary {
    pub method: ReweightMethod,
    pub nodes: Vec<String>,
    pub weights: Vec<f64>,
    /// Energy half-width of the reference frames (direct) or squared
    /// neighbour distance (entropy).
    pub region: f64,
}

/// Reweighting of the partition with the method chosen in `options`.
///
/// Every partition node must have finished sampling; failed and unconverged
/// nodes are tolerated only when `options` says so, and failed nodes are
/// left out of the partition used for reweighting.
#[instrument(skip_all, name = "reweight")]
pub fn run(
    pool: &mut Pool,
    source: &dyn EnergySource,
    options: &ReweightOptions,
    guard: Duration,
    reporter: &ProgressReporter,
) -> Result<ReweightSummary, EngineError> {
    let partition = pool.partition_ids();
    let blocking: Vec<&str> = partition
        .iter()
        .map(|&id| pool.node(id))
        .filter(|n| match n.state() {
            NodeState::Converged => false,
            NodeState::NotConverged => !options.ignore_not_converged,
            NodeState::MdrunFailed => !options.ignore_failed,
            _ => true,
        })
        .map(Node::name)
        .collect();
    if !blocking.is_empty() {
        return Err(EngineError::Precondition(format!(
            "nodes not ready for reweighting: {}",
            blocking.join(", ")
        )));
    }
    let active: Vec<_> = partition
        .into_iter()
        .filter(|&id| pool.node(id).state() != NodeState::MdrunFailed)
        .collect();
    if active.is_empty() {
        return Err(EngineError::Precondition("no node to reweight".into()));
    }

    reporter.report(Progress::PhaseStart {
        name: "Reweighting",
    });
    let summary = with_multilock(pool, &active, guard, true, |pool, owned| {
        let study = pool.study()?;
        let beta = study.beta();
        let partition = pool.partition_of(owned)?;

        let mut samples = Vec::with_capacity(owned.len());
        let mut trajectories = Vec::with_capacity(owned.len());
        for (index, &id) in owned.iter().enumerate() {
            let trajectory = pool.trajectory(id)?;
            let frames = &trajectory.frames;
            let node = pool.node(id);
            let energies = source.energies(node)?;
            if energies.len() != frames.n_frames() {
                return Err(EngineError::Precondition(format!(
                    "node '{}' has {} energies for {} frames",
                    node.name(),
                    energies.len(),
                    frames.n_frames()
                )));
            }
            let phi_potential = partition.potential(frames, partition.centre(index)?, beta)?;
            let frame_weights = frames
                .weights()
                .cloned()
                .unwrap_or_else(|| DVector::from_element(frames.n_frames(), 1.0));
            samples.push(NodeSample {
                name: node.name().to_string(),
                energies,
                phi_potential,
                frame_weights,
            });
            trajectories.push(trajectory.frames.clone());
        }

        let (weights, stats, thermo, region) = match options.method {
            ReweightMethod::Direct => {
                let result = direct_weights(&samples, beta)?;
                (result.weights, result.stats, None, result.region)
            }
            ReweightMethod::Entropy => {
                let result = entropy_weights(&samples, &trajectories, study.temperature)?;
                let thermo: Vec<(f64, f64)> = result
                    .entropies
                    .iter()
                    .copied()
                    .zip(result.free_energies.iter().copied())
                    .collect();
                (result.weights, result.stats, Some(thermo), result.region)
            }
        };
        for (index, (&id, &weight)) in owned.iter().zip(weights.iter()).enumerate() {
            let stats = &stats[index];
            let node = pool.node_mut(id);
            let observables = node.observables_mut();
            observables.weight_direct = Some(weight);
            observables.mean_v = Some(stats.mean_v);
            observables.std_v = Some(stats.std_v);
            observables.n_refpoints = Some(stats.n_refpoints);
            let mut entry = format!(
                "weight_direct={weight:.6e} mean_v={:.4} std_v={:.4} refpoints={} region={:.4}",
                stats.mean_v, stats.std_v, stats.n_refpoints, region
            );
            if let Some((entropy, free_energy)) = thermo.as_ref().map(|t| t[index]) {
                observables.entropy = Some(entropy);
                observables.free_energy = Some(free_energy);
                entry.push_str(&format!(" entropy={entropy:.6e} free_energy={free_energy:.4}"));
            }
            node.append_log(&node.reweighting_log_path(), &entry)?;
            node.save()?;
        }
        Ok(ReweightSummary {
            method: options.method,
            nodes: samples.into_iter().map(|s| s.name).collect(),
            weights: weights.iter().copied().collect(),
            region,
        })
    })?;
    reporter.report(Progress::PhaseFinish);

    info!(method = ?summary.method, nodes = summary.nodes.len(), region = summary.region, "Reweighting complete");
    Ok(summary)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::pool::NodeId;
    use crate::workflows::tests::{force_sampled, seeded_pool};
    use std::collections::HashMap;
    use std::fs;

    /// Energies keyed by node name.
    pub(crate) struct FixedEnergies(pub(crate) HashMap<String, Vec<f64>>);

    impl EnergySource for FixedEnergies {
        fn energies(&self, node: &Node) -> Result<DVector<f64>, EngineError> {
            let values = self.0.get(node.name()).cloned().unwrap_or_default();
            Ok(DVector::from_vec(values))
        }
    }

    /// Two converged nodes with symmetric trajectories around their centres.
    pub(crate) fn converged_pair() -> (tempfile::TempDir, Pool, Vec<NodeId>) {
        let (dir, mut pool, ids) = seeded_pool(&[0.0, 1.0], 0);
        force_sampled(&mut pool, ids[0], NodeState::Converged, &[0.1, 0.2, 0.1, 0.2]);
        force_sampled(&mut pool, ids[1], NodeState::Converged, &[0.8, 0.9, 0.8, 0.9]);
        (dir, pool, ids)
    }

    pub(crate) fn energies(low: f64, high: f64) -> FixedEnergies {
        FixedEnergies(HashMap::from([
            ("node0001".to_string(), vec![low; 4]),
            ("node0002".to_string(), vec![high; 4]),
        ]))
    }

    #[test]
    fn lower_energy_node_gets_more_weight() {
        let (_dir, mut pool, ids) = converged_pair();
        let summary = run(
            &mut pool,
            &energies(0.0, 5.0),
            &ReweightOptions::default(),
            Duration::ZERO,
            &ProgressReporter::new(),
        )
        .unwrap();
        assert_eq!(summary.nodes, vec!["node0001", "node0002"]);
        assert!((summary.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(summary.weights[0] > summary.weights[1]);

        for &id in &ids {
            let node = pool.node(id);
            assert!(node.observables().weight_direct.is_some());
            assert!(node.observables().n_refpoints.unwrap() > 0);
            assert!(node.reweighting_log_path().exists());
            assert!(!node.is_locked());
        }
    }

    #[test]
    fn entropy_method_records_free_energies() {
        let (_dir, mut pool, ids) = converged_pair();
        let options = ReweightOptions {
            method: ReweightMethod::Entropy,
            ..Default::default()
        };
        let summary = run(&mut pool, &energies(0.0, 5.0), &options, Duration::ZERO, &ProgressReporter::new())
            .unwrap();
        assert_eq!(summary.method, ReweightMethod::Entropy);
        assert!((summary.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(summary.weights[0] > summary.weights[1]);

        let low = pool.node(ids[0]).observables();
        let high = pool.node(ids[1]).observables();
        let gap = high.free_energy.unwrap() - low.free_energy.unwrap();
        assert!(gap > 0.0);
        assert!(low.entropy.is_some());
        assert_eq!(low.weight_direct, Some(summary.weights[0]));
        let log = fs::read_to_string(pool.node(ids[0]).reweighting_log_path()).unwrap();
        assert!(log.contains("entropy="));
    }

    #[test]
    fn unsampled_partition_blocks_reweighting() {
        let (_dir, mut pool, _ids) = seeded_pool(&[0.0, 1.0], 0);
        let err = run(
            &mut pool,
            &energies(0.0, 0.0),
            &ReweightOptions::default(),
            Duration::ZERO,
            &ProgressReporter::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(msg) if msg.contains("node0001")));
    }

    #[test]
    fn failed_nodes_can_be_left_out() {
        let (_dir, mut pool, ids) = converged_pair();
        let node = pool.node_mut(ids[1]);
        assert!(node.lock(Duration::ZERO).unwrap());
        node.record_mut().state = NodeState::MdrunFailed;
        node.save().unwrap();
        node.unlock().unwrap();

        let strict = run(
            &mut pool,
            &energies(0.0, 0.0),
            &ReweightOptions::default(),
            Duration::ZERO,
            &ProgressReporter::new(),
        );
        assert!(strict.is_err());

        let options = ReweightOptions {
            ignore_failed: true,
            ..Default::default()
        };
        let summary = run(&mut pool, &energies(0.0, 0.0), &options, Duration::ZERO, &ProgressReporter::new())
            .unwrap();
        assert_eq!(summary.nodes, vec!["node0001"]);
        assert!((summary.weights[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn energy_count_must_match_frames() {
        let (_dir, mut pool, _ids) = converged_pair();
        let source = FixedEnergies(HashMap::from([("node0001".to_string(), vec![0.0; 3])]));
        let err = run(&mut pool, &source, &ReweightOptions::default(), Duration::ZERO, &ProgressReporter::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
    }

    #[test]
    fn csv_source_reads_the_named_column() {
        let (_dir, pool, ids) = converged_pair();
        let node = pool.node(ids[0]);
        fs::write(CsvEnergySource::path(node), "time, energy\n0, -1.5\n1, 2.25\n").unwrap();
        let values = CsvEnergySource::default().energies(node).unwrap();
        assert_eq!(values.as_slice(), &[-1.5, 2.25]);

        let other = CsvEnergySource {
            column: "potential".into(),
        };
        assert!(matches!(other.energies(node), Err(EngineError::Precondition(_))));
    }
}
