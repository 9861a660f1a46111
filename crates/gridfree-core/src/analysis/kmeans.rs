use super::AnalysisError;
use crate::core::coords::TrajectoryFrames;
use nalgebra::DVector;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

/// Weighted k-means in internal-coordinate space.
///
/// Fixed centroids take part in the assignment step but never move, so new
/// centroids settle away from existing nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeans {
    pub k: usize,
    /// Stop once the mean squared centroid shift falls below this value.
    pub threshold: f64,
    pub max_iterations: usize,
}

#[derive(Debug, Clone)]
pub struct Clustering {
    /// The `k` free centroids, one frame each.
    pub centroids: TrajectoryFrames,
    /// Sorted, de-duplicated indices of the frames closest to each centroid.
    pub chosen: Vec<usize>,
    pub iterations: usize,
    pub converged: bool,
}

impl KMeans {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            threshold: 1e-4,
            max_iterations: 50,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn run<R: Rng + ?Sized>(
        &self,
        frames: &TrajectoryFrames,
        fixed: Option<&TrajectoryFrames>,
        rng: &mut R,
    ) -> Result<Clustering, AnalysisError> {
        if self.k == 0 || self.k > frames.n_frames() {
            return Err(AnalysisError::InvalidClusterCount {
                requested: self.k,
                available: frames.n_frames(),
            });
        }
        let mut order: Vec<usize> = (0..frames.n_frames()).collect();
        order.shuffle(rng);
        let mut means: Vec<TrajectoryFrames> = order[..self.k]
            .iter()
            .map(|&i| frames.frame(i))
            .collect::<Result<_, _>>()?;
        if let Some(fixed) = fixed {
            for f in 0..fixed.n_frames() {
                means.push(fixed.frame(f)?);
            }
        }

        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.max_iterations {
            iterations += 1;
            let members = assign(frames, &means)?;
            let mut progress = 0.0;
            for (j, mean) in means.iter_mut().enumerate().take(self.k) {
                let indices: Vec<usize> = members
                    .iter()
                    .enumerate()
                    .filter_map(|(f, &m)| (m == j).then_some(f))
                    .collect();
                let Some(updated) = cluster_mean(frames, &indices)? else {
                    continue;
                };
                progress += updated.difference(mean)?.norm2()[0];
                *mean = updated;
            }
            progress /= self.k as f64;
            debug!(iteration = iterations, progress, "k-means step");
            if progress < self.threshold {
                converged = true;
                break;
            }
        }
        if !converged {
            warn!(
                iterations,
                "k-means stopped at the iteration limit before converging"
            );
        }

        means.truncate(self.k);
        let mut chosen = Vec::with_capacity(self.k);
        for mean in &means {
            let dist = frames.difference(mean)?.norm2();
            chosen.push(dist.argmin().0);
        }
        chosen.sort_unstable();
        chosen.dedup();
        if chosen.len() < self.k {
            warn!(
                requested = self.k,
                found = chosen.len(),
                "Several centroids share their closest frame"
            );
        }
        Ok(Clustering {
            centroids: TrajectoryFrames::stack(&means)?,
            chosen,
            iterations,
            converged,
        })
    }
}

/// Index of the closest mean for every frame.
fn assign(frames: &TrajectoryFrames, means: &[TrajectoryFrames]) -> Result<Vec<usize>, AnalysisError> {
    let mut best = vec![0usize; frames.n_frames()];
    let mut best_dist = DVector::from_element(frames.n_frames(), f64::INFINITY);
    for (j, mean) in means.iter().enumerate() {
        let dist = frames.difference(mean)?.norm2();
        for f in 0..frames.n_frames() {
            if dist[f] < best_dist[f] {
                best_dist[f] = dist[f];
                best[f] = j;
            }
        }
    }
    Ok(best)
}

/// Weighted mean of the selected frames, `None` for an empty or weightless
/// cluster.
fn cluster_mean(
    frames: &TrajectoryFrames,
    indices: &[usize],
) -> Result<Option<TrajectoryFrames>, AnalysisError> {
    if indices.is_empty() {
        return Ok(None);
    }
    let members = frames.select(indices)?;
    let mean = match members.weights() {
        Some(w) if w.sum() > 0.0 => members.mean_weighted()?,
        Some(_) => return Ok(None),
        None => members.mean()?,
    };
    Ok(Some(mean))
}
