use super::AnalysisError;
use crate::core::coords::TrajectoryFrames;
use std::fmt::Write;
use tracing::debug;

/// Gelman-Rubin convergence test on a single weighted trajectory split into
/// contiguous chains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GelmanRubin {
    pub threshold: f64,
    pub n_chains: usize,
}

/// Outcome of one convergence test.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceReport {
    pub converged: bool,
    /// At least one chain lies entirely outside the node's region.
    pub runaway: bool,
    /// Potential scale reduction factor per coordinate; empty on runaway.
    pub shrink_factors: Vec<f64>,
    pub labels: Vec<String>,
    pub threshold: f64,
}

impl ConvergenceReport {
    /// Human-readable per-coordinate table for the node's convergence log.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if self.runaway {
            let _ = writeln!(out, "runaway: a chain carries zero weight, not converged");
            return out;
        }
        for (label, r) in self.labels.iter().zip(&self.shrink_factors) {
            let status = if *r < self.threshold { "ok" } else { "FAILED" };
            let _ = writeln!(out, "{label:<24} R={r:.6} (< {:.4}) {status}", self.threshold);
        }
        let verdict = if self.converged { "converged" } else { "not converged" };
        let _ = writeln!(out, "=> {verdict}");
        out
    }
}

impl GelmanRubin {
    pub fn new(threshold: f64, n_chains: usize) -> Self {
        Self {
            threshold,
            n_chains,
        }
    }

    /// Computes the shrink factor `R = sqrt(V / W)` of every coordinate.
    ///
    /// `W` is the mean within-chain weighted variance, `B` the spread of the
    /// weighted chain means around the overall weighted mean and
    /// `V = (1 - 1/L) W + B` with `L` the chain length.
    pub fn evaluate(&self, frames: &TrajectoryFrames) -> Result<ConvergenceReport, AnalysisError> {
        if self.n_chains < 2 {
            return Err(AnalysisError::TooFewChains {
                required: 2,
                found: self.n_chains,
            });
        }
        if frames.n_frames() < self.n_chains {
            return Err(AnalysisError::NotEnoughFrames {
                required: self.n_chains,
                found: frames.n_frames(),
            });
        }
        let labels: Vec<String> = frames.coordinates().iter().map(|c| c.label()).collect();
        let chains = frames.split(self.n_chains)?;

        let runaway = chains.iter().any(|chain| {
            chain
                .weights()
                .is_none_or(|w| w.iter().fold(0.0_f64, |m, &v| m.max(v)) == 0.0)
        });
        if runaway {
            debug!("Chain with zero weight found, trajectory ran away");
            return Ok(ConvergenceReport {
                converged: false,
                runaway: true,
                shrink_factors: Vec::new(),
                labels,
                threshold: self.threshold,
            });
        }

        let total_mean = frames.mean_weighted()?;
        let n_coords = frames.n_coords();
        let mut within = vec![0.0; n_coords];
        let mut between = vec![0.0; n_coords];
        for chain in &chains {
            let var = chain.var_weighted()?;
            let shift = chain.mean_weighted()?.difference(&total_mean)?;
            for c in 0..n_coords {
                within[c] += var.value(0, c) / self.n_chains as f64;
                between[c] += shift.value(0, c).powi(2) / (self.n_chains - 1) as f64;
            }
        }

        let chain_len = frames.n_frames() as f64 / self.n_chains as f64;
        let shrink_factors = within
            .iter()
            .zip(&between)
            .zip(&labels)
            .map(|((&w, &b), label)| {
                if !(w > 0.0) {
                    return Err(AnalysisError::NonPositiveVariance {
                        coord: label.clone(),
                        value: w,
                    });
                }
                let v = (1.0 - 1.0 / chain_len) * w + b;
                Ok((v / w).sqrt())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let converged = shrink_factors.iter().all(|&r| r < self.threshold);
        Ok(ConvergenceReport {
            converged,
            runaway: false,
            shrink_factors,
            labels,
            threshold: self.threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coords::{CoordinateSet, InternalCoordinate};
    use nalgebra::DVector;

    fn weighted(values: &[f64], weights: Option<Vec<f64>>) -> TrajectoryFrames {
        let set = CoordinateSet::new(vec![InternalCoordinate::linear(0, 1)]).unwrap();
        let rows: Vec<Vec<f64>> = values.iter().map(|&v| vec![v]).collect();
        let weights = weights.unwrap_or_else(|| vec![1.0; values.len()]);
        TrajectoryFrames::from_rows(set, &rows)
            .unwrap()
            .with_weights(DVector::from_vec(weights))
            .unwrap()
    }

    /// Five chains of 100 frames; chain `c` oscillates by `1e-3` around
    /// `centre(c)`.
    fn five_chains(centre: impl Fn(usize) -> f64) -> TrajectoryFrames {
        let values: Vec<f64> = (0..500)
            .map(|i| centre(i / 100) + 1e-3 * (i % 2) as f64)
            .collect();
        weighted(&values, None)
    }

    #[test]
    fn chains_with_identical_means_converge() {
        let report = GelmanRubin::new(1.1, 5).evaluate(&five_chains(|_| 1.0)).unwrap();
        assert!(report.converged);
        assert!(report.shrink_factors[0] < 1.01);
        assert!(report.summary().contains("=> converged"));
    }

    #[test]
    fn chains_with_distant_means_do_not_converge() {
        let report = GelmanRubin::new(1.1, 5)
            .evaluate(&five_chains(|c| 10.0 * c as f64))
            .unwrap();
        assert!(!report.converged);
        assert!(report.shrink_factors[0] > 2.0);
        assert!(report.summary().contains("FAILED"));
    }

    #[test]
    fn chain_without_weight_is_runaway() {
        let values: Vec<f64> = (0..20).map(|i| (i % 2) as f64).collect();
        let mut weights = vec![1.0; 20];
        for w in &mut weights[15..] {
            *w = 0.0;
        }
        let report = GelmanRubin::new(1.1, 4)
            .evaluate(&weighted(&values, Some(weights)))
            .unwrap();
        assert!(report.runaway);
        assert!(!report.converged);
        assert!(report.shrink_factors.is_empty());
    }

    #[test]
    fn constant_trajectory_has_no_within_variance() {
        let frames = weighted(&[1.0; 12], None);
        let err = GelmanRubin::new(1.1, 3).evaluate(&frames).unwrap_err();
        assert!(matches!(err, AnalysisError::NonPositiveVariance { .. }));
    }

    #[test]
    fn single_chain_is_rejected() {
        let frames = weighted(&[0.0, 1.0], None);
        assert!(matches!(
            GelmanRubin::new(1.1, 1).evaluate(&frames),
            Err(AnalysisError::TooFewChains { .. })
        ));
        assert!(matches!(
            GelmanRubin::new(1.1, 3).evaluate(&frames),
            Err(AnalysisError::NotEnoughFrames { .. })
        ));
    }
}
