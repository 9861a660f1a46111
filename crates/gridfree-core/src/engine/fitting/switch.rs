use super::{FitContext, FittingError, RestraintFitter};
use crate::core::constants::OPEN_UPPER_BOUND;
use crate::core::coords::{CoordinateKind, InternalCoordinate};
use crate::core::restraint::Restraint;
use crate::core::utils::geometry::wrap_angle;
use std::f64::consts::PI;

/// Fits a flat-bottomed restraint to the plateau of the phi potential.
///
/// The plateau is the set of samples whose potential lies below
/// `threshold` times the potential's span. It is stretched to include the
/// node value, and the force constant is the slope from the plateau edge to
/// the potential maximum.
#[derive(Debug, Clone, Copy)]
pub struct SwitchFitter {
    pub threshold: f64,
    /// Jump between consecutive plateau samples that splits a dihedral
    /// plateau wrapping around +-pi.
    pub break_angle: f64,
}

impl Default for SwitchFitter {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            break_angle: 2f64.to_radians(),
        }
    }
}

struct Scan {
    plateau: Vec<f64>,
    max: f64,
    argmax_value: f64,
}

impl SwitchFitter {
    fn scan(&self, potential: &[f64], range: &[f64], coord: &InternalCoordinate) -> Result<Scan, FittingError> {
        let min = potential.iter().copied().fold(f64::INFINITY, f64::min);
        let normalized: Vec<f64> = potential.iter().map(|p| (p - min).abs()).collect();
        let (argmax, max) = normalized
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
        let plateau: Vec<f64> = normalized
            .iter()
            .zip(range)
            .filter(|(v, _)| **v < max * self.threshold)
            .map(|(_, x)| *x)
            .collect();
        if plateau.is_empty() {
            return Err(FittingError::EmptyPlateau { coord: coord.label() });
        }
        Ok(Scan {
            plateau,
            max,
            argmax_value: range[argmax],
        })
    }

    fn dihedral(&self, scan: &Scan, node_value: f64, coord: &InternalCoordinate) -> Result<Restraint, FittingError> {
        let plateau = &scan.plateau;
        let mut left = plateau[0];
        let mut right = plateau[plateau.len() - 1];
        if left == -PI && right == PI {
            if let Some(i) = (1..plateau.len())
                .find(|&i| (plateau[i].abs() - plateau[i - 1].abs()).abs() >= self.break_angle)
            {
                right = plateau[i - 1];
                left = plateau[i];
            }
        }

        let to_right = wrap_angle(right - node_value).abs();
        let to_left = wrap_angle(left - node_value).abs();
        let mut size = (plateau.len() as f64).to_radians();
        if to_right > size || to_left > size {
            if to_right < to_left {
                size += wrap_angle(right - node_value).abs();
                right = node_value;
            } else {
                size += wrap_angle(left - node_value).abs();
                left = node_value;
            }
        }

        let dphi = size / 2.0;
        let phi0 = wrap_angle(right - dphi);
        let flank = |edge: f64| {
            let d = (scan.argmax_value - edge).abs();
            d.min(2.0 * PI - d)
        };
        let k = slope(scan.max, flank(left).max(flank(right)), coord)?;
        Ok(Restraint::dihedral(coord, phi0, dphi, k)?)
    }

    fn linear(&self, scan: &Scan, node_value: f64, coord: &InternalCoordinate) -> Result<Restraint, FittingError> {
        let mut r0 = scan.plateau[0];
        let mut r1 = scan.plateau[scan.plateau.len() - 1];
        if node_value > r1 {
            r1 = node_value;
        } else if node_value < r0 {
            r0 = node_value;
        }
        let run = (scan.argmax_value - r0).abs().max((scan.argmax_value - r1).abs());
        let k = slope(scan.max, run, coord)?;
        Ok(Restraint::distance(coord, r0, r1, OPEN_UPPER_BOUND, k)?)
    }
}

fn slope(rise: f64, run: f64, coord: &InternalCoordinate) -> Result<f64, FittingError> {
    if run > 0.0 {
        Ok(rise / run)
    } else {
        Err(FittingError::DegenerateSlope { coord: coord.label() })
    }
}

impl RestraintFitter for SwitchFitter {
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
        let scan = self.scan(&potential, range, coord)?;
        let node_value = ctx.node_value(index)?;
        match coord.kind() {
            CoordinateKind::Dihedral => self.dihedral(&scan, node_value, coord),
            CoordinateKind::Linear => self.linear(&scan, node_value, coord),
        }
    }
}
