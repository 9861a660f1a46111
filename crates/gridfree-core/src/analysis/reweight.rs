use super::AnalysisError;
use crate::core::constants::{AVOGADRO, BOLTZMANN, thermo_beta};
use crate::core::coords::TrajectoryFrames;
use crate::core::utils::numeric::{log_sum_exp, median};
use nalgebra::DVector;
use tracing::{debug, instrument, warn};

/// Sampled energies of one node.
#[derive(Debug, Clone)]
pub struct NodeSample {
    pub name: String,
    /// Potential energy of every frame (kJ/mol).
    pub energies: DVector<f64>,
    /// `-(1/beta) ln phi` of every frame for the node's own region.
    pub phi_potential: DVector<f64>,
    pub frame_weights: DVector<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeEnergyStats {
    pub mean_v: f64,
    pub std_v: f64,
    pub n_refpoints: usize,
}

#[derive(Debug, Clone)]
pub struct DirectWeights {
    /// Normalised node weights.
    pub weights: DVector<f64>,
    pub stats: Vec<NodeEnergyStats>,
    /// Energy half-width around each node's mean that selects reference
    /// frames.
    pub region: f64,
}

#[derive(Debug, Clone)]
pub struct EntropyWeights {
    /// Normalised node weights.
    pub weights: DVector<f64>,
    pub stats: Vec<NodeEnergyStats>,
    /// Configurational entropy of every node in kJ/(mol K).
    pub entropies: Vec<f64>,
    /// `mean_v - T S` of every node in kJ/mol.
    pub free_energies: Vec<f64>,
    /// Squared coordinate distance below which two frames are neighbours.
    pub region: f64,
}

/// Weighted mean and spread of `E = V + V_phi` over a node's frames.
fn node_energy(sample: &NodeSample) -> Result<(DVector<f64>, NodeEnergyStats), AnalysisError> {
    let n = sample.energies.len();
    if n == 0 {
        return Err(AnalysisError::NotEnoughFrames {
            required: 1,
            found: 0,
        });
    }
    if sample.phi_potential.len() != n || sample.frame_weights.len() != n {
        return Err(AnalysisError::Shape {
            expected: n,
            found: (sample.phi_potential.len(), sample.frame_weights.len()),
        });
    }
    let total = sample.frame_weights.sum();
    if !(total > 0.0) {
        return Err(AnalysisError::ZeroWeight("trajectory frame weights"));
    }
    let energy = &sample.energies + &sample.phi_potential;
    let mean_v = energy.dot(&sample.frame_weights) / total;
    let var_v = energy
        .iter()
        .zip(sample.frame_weights.iter())
        .map(|(e, w)| w * (e - mean_v).powi(2))
        .sum::<f64>()
        / total;
    let stats = NodeEnergyStats {
        mean_v,
        std_v: var_v.sqrt(),
        n_refpoints: 0,
    };
    Ok((energy, stats))
}

/// Direct free-energy reweighting of the partition nodes.
///
/// With `E = V + V_phi` on every frame, node `i` gets
/// `ln w_i = ln n_i - ln sum_(ref) exp(beta E)` over the reference frames
/// whose energy lies within `region` of the node's weighted mean energy.
/// `region` is the spread of the node mean energies.
#[instrument(skip_all, name = "direct_reweighting", fields(nodes = samples.len()))]
pub fn direct_weights(samples: &[NodeSample], beta: f64) -> Result<DirectWeights, AnalysisError> {
    if samples.is_empty() {
        return Err(AnalysisError::ZeroWeight("node samples"));
    }
    let mut stats = Vec::with_capacity(samples.len());
    let mut combined = Vec::with_capacity(samples.len());
    for sample in samples {
        let (energy, stat) = node_energy(sample)?;
        stats.push(stat);
        combined.push(energy);
    }

    let means: Vec<f64> = stats.iter().map(|s| s.mean_v).collect();
    let grand = means.iter().sum::<f64>() / means.len() as f64;
    let region = (means.iter().map(|m| (m - grand).powi(2)).sum::<f64>() / means.len() as f64).sqrt();
    debug!(region, "Reference energy region");

    let mut log_weights = Vec::with_capacity(samples.len());
    for ((sample, energy), stat) in samples.iter().zip(&combined).zip(stats.iter_mut()) {
        let half_width = if region > 0.0 { region } else { stat.std_v };
        let reference: Vec<f64> = energy
            .iter()
            .filter(|&&e| (e - stat.mean_v).abs() < half_width)
            .map(|&e| beta * e)
            .collect();
        if reference.is_empty() && samples.len() > 1 {
            return Err(AnalysisError::NoRefpoints {
                node: sample.name.clone(),
            });
        }
        stat.n_refpoints = reference.len();
        let n_frames = energy.len() as f64;
        let log_w = if reference.is_empty() {
            0.0
        } else {
            n_frames.ln() - log_sum_exp(reference.iter().copied())
        };
        debug!(node = %sample.name, refpoints = stat.n_refpoints, log_w, "Node reweighted");
        log_weights.push(log_w);
    }

    let norm = log_sum_exp(log_weights.iter().copied());
    let weights = DVector::from_iterator(log_weights.len(), log_weights.iter().map(|l| (l - norm).exp()));
    Ok(DirectWeights {
        weights,
        stats,
        region,
    })
}

/// Entropy reweighting of the partition nodes.
///
/// Reference frames of a node are those whose energy lies within one
/// standard deviation of the node mean. For each of them the ratio of all
/// frames to the frames closer than `region` (squared distance, the mean
/// merged variance of the nodes) estimates the visited volume; the
/// median ratio gives `S = k_B N_A ln(ratio)` and the node free energy
/// `A = mean_v - T S`. Weights follow `exp(-beta (A - A_min))`.
#[instrument(skip_all, name = "entropy_reweighting", fields(nodes = samples.len()))]
pub fn entropy_weights(
    samples: &[NodeSample],
    frames: &[TrajectoryFrames],
    temperature: f64,
) -> Result<EntropyWeights, AnalysisError> {
    if samples.is_empty() {
        return Err(AnalysisError::ZeroWeight("node samples"));
    }
    if frames.len() != samples.len() {
        return Err(AnalysisError::Shape {
            expected: samples.len(),
            found: (frames.len(), 1),
        });
    }
    let mut weighted = Vec::with_capacity(samples.len());
    for (sample, frames) in samples.iter().zip(frames) {
        if frames.n_frames() != sample.energies.len() {
            return Err(AnalysisError::Shape {
                expected: sample.energies.len(),
                found: (frames.n_frames(), frames.n_coords()),
            });
        }
        weighted.push(frames.clone().with_weights(sample.frame_weights.clone())?);
    }
    let mut region = 0.0;
    for frames in &weighted {
        region += frames.merged_var_weighted()?;
    }
    region /= weighted.len() as f64;
    if !(region > 0.0) {
        return Err(AnalysisError::ZeroWeight("merged coordinate variance"));
    }
    debug!(region, "Neighbour distance region");

    let beta = thermo_beta(temperature);
    let mut stats = Vec::with_capacity(samples.len());
    let mut entropies = Vec::with_capacity(samples.len());
    let mut free_energies = Vec::with_capacity(samples.len());
    for (sample, frames) in samples.iter().zip(&weighted) {
        let (energy, mut stat) = node_energy(sample)?;
        let refpoints: Vec<usize> = energy
            .iter()
            .enumerate()
            .filter(|&(_, e)| (e - stat.mean_v).abs() <= stat.std_v)
            .map(|(i, _)| i)
            .collect();
        if refpoints.is_empty() {
            return Err(AnalysisError::NoRefpoints {
                node: sample.name.clone(),
            });
        }
        stat.n_refpoints = refpoints.len();

        let n_frames = frames.n_frames() as f64;
        let mut ratios = Vec::with_capacity(refpoints.len());
        let mut lonely = 0;
        for &r in &refpoints {
            let distances = frames.difference(&frames.frame(r)?)?.norm2();
            let near = distances.iter().filter(|&&d| d < region).count();
            if near == 1 {
                lonely += 1;
            }
            ratios.push(n_frames / near as f64);
        }
        if lonely > 0 {
            warn!(node = %sample.name, refpoints = lonely, "Reference frames without neighbours; sampling may be too sparse");
        }
        let ratio = median(&ratios).ok_or_else(|| AnalysisError::NoRefpoints {
            node: sample.name.clone(),
        })?;
        let entropy = AVOGADRO * BOLTZMANN * ratio.ln();
        let free_energy = stat.mean_v - temperature * entropy;
        debug!(node = %sample.name, refpoints = stat.n_refpoints, entropy, free_energy, "Node entropy");
        stats.push(stat);
        entropies.push(entropy);
        free_energies.push(free_energy);
    }

    let log_weights: Vec<f64> = free_energies.iter().map(|a| -beta * a).collect();
    let norm = log_sum_exp(log_weights.iter().copied());
    let weights = DVector::from_iterator(log_weights.len(), log_weights.iter().map(|l| (l - norm).exp()));
    Ok(EntropyWeights {
        weights,
        stats,
        entropies,
        free_energies,
        region,
    })
}
