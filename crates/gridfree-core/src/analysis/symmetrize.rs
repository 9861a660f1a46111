use super::AnalysisError;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

/// Result of enforcing detailed balance on an overlap matrix.
#[derive(Debug, Clone)]
pub struct Symmetrized {
    /// Row-stochastic matrix satisfying `pi_i M_ij = pi_j M_ji`.
    pub matrix: DMatrix<f64>,
    /// Stationary distribution `pi`, normalised to one.
    pub stationary: DVector<f64>,
    /// Node weights the symmetrisation was scaled with.
    pub weights: DVector<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Symmetrizer {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Refine the weights to the left eigenvector of the matrix first.
    pub correct_weights: bool,
}

impl Symmetrizer {
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
            correct_weights: false,
        }
    }

    pub fn correcting_weights(mut self, correct: bool) -> Self {
        self.correct_weights = correct;
        self
    }

    pub fn symmetrize(
        &self,
        matrix: &DMatrix<f64>,
        weights: &DVector<f64>,
    ) -> Result<Symmetrized, AnalysisError> {
        let n = matrix.nrows();
        if !matrix.is_square() || weights.len() != n {
            return Err(AnalysisError::Shape {
                expected: weights.len(),
                found: matrix.shape(),
            });
        }
        let total = weights.sum();
        if !(total > 0.0) {
            return Err(AnalysisError::ZeroWeight("node weights"));
        }
        let mut w = weights / total;
        if self.correct_weights {
            w = self.correct(matrix, w)?;
        }

        let mut current = matrix.clone();
        let mut converged = false;
        for iteration in 1..=self.max_iterations {
            let scaled = scale_rows(&current, &w)?;
            let next = (&scaled + scaled.transpose()) * 0.5;
            let diff = spectral_norm(&next - &current);
            current = next;
            debug!(iteration, diff, "Symmetrisation step");
            if diff < self.tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            return Err(AnalysisError::NoConvergence {
                what: "symmetrisation",
                iterations: self.max_iterations,
            });
        }

        let row_sums = row_sums(&current);
        let stationary = &row_sums / row_sums.sum();
        let matrix = scale_rows(&current, &DVector::from_element(n, 1.0))?;
        Ok(Symmetrized {
            matrix,
            stationary,
            weights: w,
        })
    }

    /// Power iteration `w <- M^T w` towards the stationary weights.
    fn correct(&self, matrix: &DMatrix<f64>, mut w: DVector<f64>) -> Result<DVector<f64>, AnalysisError> {
        for iteration in 1..=self.max_iterations {
            let mut next = matrix.transpose() * &w;
            let total = next.sum();
            if !(total > 0.0) {
                return Err(AnalysisError::ZeroWeight("corrected weights"));
            }
            next /= total;
            let diff = (&next - &w).norm();
            w = next;
            if diff < self.tolerance {
                info!(iterations = iteration, "Node weights corrected");
                return Ok(w);
            }
        }
        Err(AnalysisError::NoConvergence {
            what: "weight correction",
            iterations: self.max_iterations,
        })
    }
}

fn row_sums(matrix: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(matrix.nrows(), matrix.row_iter().map(|r| r.sum()))
}

/// `diag(target / rowsum(M)) M`: rescales every row to sum to `target`.
fn scale_rows(matrix: &DMatrix<f64>, target: &DVector<f64>) -> Result<DMatrix<f64>, AnalysisError> {
    let sums = row_sums(matrix);
    let mut scaled = matrix.clone();
    for (row, (&sum, &t)) in sums.iter().zip(target.iter()).enumerate() {
        if sum == 0.0 {
            return Err(AnalysisError::ZeroRowSum { row });
        }
        scaled.row_mut(row).scale_mut(t / sum);
    }
    Ok(scaled)
}

fn spectral_norm(matrix: DMatrix<f64>) -> f64 {
    matrix.svd(false, false).singular_values.max()
}
