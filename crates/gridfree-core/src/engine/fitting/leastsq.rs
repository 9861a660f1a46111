use super::{FitContext, FittingError, RestraintFitter};
use crate::core::coords::{CoordinateKind, InternalCoordinate};
use crate::core::restraint::Restraint;
use crate::core::utils::numeric::logistic_step;
use crate::engine::utils::simplex::{Minimizer, NelderMead};
use tracing::{trace, warn};

/// Least-squares fit of the restraint parameters to the phi potential.
///
/// The residual at each sample is the absolute deviation between restraint
/// and potential, amplified by `overshoot_weight` where the restraint lies
/// below the potential inside the node's region (phi above `phi_cutoff`),
/// plus `anchor_weight` times the restraint energy at the node value.
#[derive(Debug, Clone, Copy)]
pub struct LeastSquaresFitter {
    pub minimizer: NelderMead,
    pub steepness: f64,
    pub phi_cutoff: f64,
    pub overshoot_weight: f64,
    pub anchor_weight: f64,
}

impl Default for LeastSquaresFitter {
    fn default() -> Self {
        Self {
            minimizer: NelderMead::default(),
            steepness: 500.0,
            phi_cutoff: 0.01,
            overshoot_weight: 15.0,
            anchor_weight: 10.0,
        }
    }
}

/// Parameters `[phi0, dphi, k]` or `[r0, r1, r2, k]`; all but the first are
/// clamped at zero.
fn restraint_from(coord: &InternalCoordinate, params: &[f64]) -> Restraint {
    let p: Vec<f64> = params
        .iter()
        .enumerate()
        .map(|(i, &v)| if i == 0 { v } else { v.max(0.0) })
        .collect();
    match coord.kind() {
        CoordinateKind::Dihedral => Restraint::Dihedral {
            atoms: coord.atoms().to_vec(),
            phi0: p[0],
            dphi: p[1],
            k: p[2],
        },
        CoordinateKind::Linear => Restraint::Distance {
            atoms: coord.atoms().to_vec(),
            r0: p[0],
            r1: p[1],
            r2: p[2],
            k: p[3],
        },
    }
}

impl RestraintFitter for LeastSquaresFitter {
    fn range_slack(&self) -> bool {
        true
    }

    fn fit(
        &self,
        ctx: &FitContext<'_>,
        coord: &InternalCoordinate,
        index: usize,
        range: &[f64],
    ) -> Result<Restraint, FittingError> {
        if range.is_empty() {
            return Err(FittingError::EmptyRange { coord: coord.label() });
        }
        let potential = ctx.potential(range, index)?;
        let phi_on: Vec<f64> = ctx
            .phi(range, index)?
            .iter()
            .map(|p| logistic_step(p - self.phi_cutoff, self.steepness))
            .collect();
        let node_value = ctx.node_value(index)?;
        let node_sample = range
            .iter()
            .enumerate()
            .map(|(i, &x)| (i, coord.difference(x, node_value).powi(2)))
            .fold((0, f64::INFINITY), |best, (i, d)| if d < best.1 { (i, d) } else { best })
            .0;

        let k0 = ctx.force_constant;
        let x0 = match coord.kind() {
            CoordinateKind::Dihedral => vec![node_value, 2.0, k0],
            CoordinateKind::Linear => vec![node_value, node_value, node_value + 1.0, k0],
        };

        let mut objective = |params: &[f64]| {
            let restraint = restraint_from(coord, params);
            let anchor = self.anchor_weight * restraint.energy(range[node_sample]).abs();
            range
                .iter()
                .zip(&potential)
                .zip(&phi_on)
                .map(|((&x, &pot), &on)| {
                    let diff = restraint.energy(x) - pot;
                    let below = logistic_step(-diff, self.steepness);
                    let residual = diff.abs() + self.overshoot_weight * on * below * diff.abs() + anchor;
                    residual * residual
                })
                .sum::<f64>()
        };
        let minimum = self.minimizer.minimize(&mut objective, &x0)?;
        if minimum.converged {
            trace!(coord = %coord.label(), iterations = minimum.iterations, "Least-squares fit converged");
        } else {
            warn!(
                coord = %coord.label(),
                iterations = minimum.iterations,
                "Least-squares restraint fit stopped at the iteration limit"
            );
        }

        let fitted = restraint_from(coord, &minimum.x);
        Ok(match fitted {
            Restraint::Dihedral { phi0, dphi, k, .. } => Restraint::dihedral(coord, phi0, dphi, k)?,
            Restraint::Distance { r0, r1, r2, k, .. } => Restraint::distance(coord, r0, r1, r2, k)?,
        })
    }
}
