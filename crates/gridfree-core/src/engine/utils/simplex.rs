use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SimplexError {
    #[error("Cannot minimize over zero parameters")]
    EmptyParameters,
    #[error("Initial guess contains non-finite values")]
    NonFiniteGuess,
}

/// Result of a minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    pub x: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Derivative-free minimization of a scalar objective.
pub trait Minimizer {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
    ) -> Result<Minimum, SimplexError>;
}

/// Downhill simplex (Nelder-Mead) with the standard reflection, expansion,
/// contraction and shrink coefficients.
///
/// The initial simplex perturbs each parameter by 5 % (or sets it to
/// `0.00025` when zero). Iteration stops once both the simplex extent and
/// the spread of objective values fall below their tolerances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NelderMead {
    pub x_tolerance: f64,
    pub f_tolerance: f64,
    /// Defaults to `200 * n` for `n` parameters.
    pub max_iterations: Option<usize>,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            x_tolerance: 1e-4,
            f_tolerance: 1e-4,
            max_iterations: None,
        }
    }
}

const RHO: f64 = 1.0;
const CHI: f64 = 2.0;
const PSI: f64 = 0.5;
const SIGMA: f64 = 0.5;

fn affine(base: &[f64], towards: &[f64], factor: f64) -> Vec<f64> {
    base.iter()
        .zip(towards)
        .map(|(b, t)| b + factor * (b - t))
        .collect()
}

impl NelderMead {
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = Some(iterations);
        self
    }

    fn has_converged(&self, sim: &[Vec<f64>], fsim: &[f64]) -> bool {
        let x_spread = sim[1..]
            .iter()
            .flat_map(|v| v.iter().zip(&sim[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        let f_spread = fsim[1..]
            .iter()
            .map(|f| (f - fsim[0]).abs())
            .fold(0.0, f64::max);
        x_spread <= self.x_tolerance && f_spread <= self.f_tolerance
    }
}

impl Minimizer for NelderMead {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
    ) -> Result<Minimum, SimplexError> {
        let n = x0.len();
        if n == 0 {
            return Err(SimplexError::EmptyParameters);
        }
        if x0.iter().any(|v| !v.is_finite()) {
            return Err(SimplexError::NonFiniteGuess);
        }
        let mut eval = |x: &[f64]| {
            let value = objective(x);
            if value.is_nan() { f64::INFINITY } else { value }
        };

        let mut sim = vec![x0.to_vec()];
        for k in 0..n {
            let mut y = x0.to_vec();
            y[k] = if y[k] != 0.0 { 1.05 * y[k] } else { 0.00025 };
            sim.push(y);
        }
        let mut fsim: Vec<f64> = sim.iter().map(|x| eval(x)).collect();

        let sort = |sim: &mut Vec<Vec<f64>>, fsim: &mut Vec<f64>| {
            let mut order: Vec<usize> = (0..fsim.len()).collect();
            order.sort_by(|&a, &b| fsim[a].total_cmp(&fsim[b]));
            *sim = order.iter().map(|&i| sim[i].clone()).collect();
            *fsim = order.iter().map(|&i| fsim[i]).collect();
        };
        sort(&mut sim, &mut fsim);

        let max_iterations = self.max_iterations.unwrap_or(200 * n);
        let mut iterations = 0;
        let mut converged = false;
        while iterations < max_iterations {
            if self.has_converged(&sim, &fsim) {
                converged = true;
                break;
            }
            iterations += 1;

            let centroid: Vec<f64> = (0..n)
                .map(|j| sim[..n].iter().map(|v| v[j]).sum::<f64>() / n as f64)
                .collect();
            let worst = sim[n].clone();

            let xr = affine(&centroid, &worst, RHO);
            let fxr = eval(&xr);
            let mut shrink = false;

            if fxr < fsim[0] {
                let xe = affine(&centroid, &worst, RHO * CHI);
                let fxe = eval(&xe);
                if fxe < fxr {
                    sim[n] = xe;
                    fsim[n] = fxe;
                } else {
                    sim[n] = xr;
                    fsim[n] = fxr;
                }
            } else if fxr < fsim[n - 1] {
                sim[n] = xr;
                fsim[n] = fxr;
            } else if fxr < fsim[n] {
                let xc = affine(&centroid, &worst, PSI * RHO);
                let fxc = eval(&xc);
                if fxc <= fxr {
                    sim[n] = xc;
                    fsim[n] = fxc;
                } else {
                    shrink = true;
                }
            } else {
                let xcc = affine(&centroid, &worst, -PSI);
                let fxcc = eval(&xcc);
                if fxcc < fsim[n] {
                    sim[n] = xcc;
                    fsim[n] = fxcc;
                } else {
                    shrink = true;
                }
            }

            if shrink {
                for j in 1..=n {
                    sim[j] = sim[0]
                        .iter()
                        .zip(&sim[j])
                        .map(|(best, x)| best + SIGMA * (x - best))
                        .collect();
                    fsim[j] = eval(&sim[j]);
                }
            }
            sort(&mut sim, &mut fsim);
        }

        Ok(Minimum {
            x: sim.swap_remove(0),
            value: fsim[0],
            iterations,
            converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_minimum_of_shifted_quadratic() {
        let mut f = |x: &[f64]| (x[0] - 3.0).powi(2) + (x[1] + 1.0).powi(2);
        let min = NelderMead::default().minimize(&mut f, &[0.0, 0.0]).unwrap();
        assert!(min.converged);
        assert!((min.x[0] - 3.0).abs() < 1e-3);
        assert!((min.x[1] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn finds_rosenbrock_valley_minimum() {
        let mut rosen =
            |x: &[f64]| 100.0 * (x[1] - x[0] * x[0]).powi(2) + (1.0 - x[0]).powi(2);
        let min = NelderMead {
            x_tolerance: 1e-8,
            f_tolerance: 1e-8,
            max_iterations: Some(5000),
        }
        .minimize(&mut rosen, &[-1.2, 1.0])
        .unwrap();
        assert!((min.x[0] - 1.0).abs() < 1e-3);
        assert!((min.x[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn iteration_cap_is_reported_as_not_converged() {
        let mut f = |x: &[f64]| x.iter().map(|v| (v - 10.0).powi(2)).sum::<f64>();
        let min = NelderMead::default()
            .with_max_iterations(3)
            .minimize(&mut f, &[0.0, 0.0, 0.0])
            .unwrap();
        assert!(!min.converged);
        assert_eq!(min.iterations, 3);
    }

    #[test]
    fn nan_objective_values_are_avoided() {
        let mut f = |x: &[f64]| if x[0] < 0.0 { f64::NAN } else { (x[0] - 1.0).powi(2) };
        let min = NelderMead::default().minimize(&mut f, &[0.5]).unwrap();
        assert!((min.x[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn empty_guess_is_rejected() {
        let mut f = |_: &[f64]| 0.0;
        assert_eq!(
            NelderMead::default().minimize(&mut f, &[]),
            Err(SimplexError::EmptyParameters)
        );
    }
}
