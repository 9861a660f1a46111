//! Restraint fitting: approximating a node's phi region along each
//! coordinate with a flat-bottomed restraint potential.

mod harmonic;
mod leastsq;
mod switch;

pub use harmonic::HarmonicFitter;
pub use leastsq::LeastSquaresFitter;
pub use switch::SwitchFitter;

use super::config::FitMethod;
use super::utils::simplex::SimplexError;
use crate::core::coords::InternalCoordinate;
use crate::core::phi::{PhiError, PhiPartition};
use crate::core::restraint::{Restraint, RestraintError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FittingError {
    #[error("Coordinate '{coord}': phi potential has no plateau (constant potential)")]
    EmptyPlateau { coord: String },
    #[error("Coordinate '{coord}': sampling range is empty")]
    EmptyRange { coord: String },
    #[error("Coordinate '{coord}': potential maximum coincides with the plateau edge")]
    DegenerateSlope { coord: String },
    #[error(transparent)]
    Phi(#[from] PhiError),
    #[error(transparent)]
    Restraint(#[from] RestraintError),
    #[error(transparent)]
    Simplex(#[from] SimplexError),
}

/// Everything a fitter needs to know about the node being fitted.
#[derive(Debug, Clone, Copy)]
pub struct FitContext<'a> {
    pub partition: &'a PhiPartition,
    /// Index of the node inside `partition`.
    pub node_index: usize,
    pub beta: f64,
    /// Harmonic force constant `alpha / beta`.
    pub force_constant: f64,
}

impl FitContext<'_> {
    /// Value of coordinate `coord` at the node centre.
    pub fn node_value(&self, coord: usize) -> Result<f64, FittingError> {
        Ok(self.partition.centre(self.node_index)?.value(0, coord))
    }

    /// `-(1/beta) ln phi` of the node along `samples` of coordinate `coord`.
    pub fn potential(&self, samples: &[f64], coord: usize) -> Result<Vec<f64>, FittingError> {
        Ok(self
            .partition
            .contribution_potential(samples, self.node_index, coord, self.beta)?)
    }

    pub fn phi(&self, samples: &[f64], coord: usize) -> Result<Vec<f64>, FittingError> {
        Ok(self.partition.contribution(samples, self.node_index, coord)?)
    }
}

pub trait RestraintFitter {
    /// Whether the linear sampling range should be widened by 10 %.
    fn range_slack(&self) -> bool {
        false
    }

    /// Fits a restraint for `coord` (index `index` in the coordinate set),
    /// scanning the potential over `range`.
    fn fit(
        &self,
        ctx: &FitContext<'_>,
        coord: &InternalCoordinate,
        index: usize,
        range: &[f64],
    ) -> Result<Restraint, FittingError>;
}

pub fn fitter_for(method: FitMethod) -> Box<dyn RestraintFitter> {
    match method {
        FitMethod::Harmonic => Box::new(HarmonicFitter),
        FitMethod::Switch => Box::new(SwitchFitter::default()),
        FitMethod::LeastSquares => Box::new(LeastSquaresFitter::default()),
    }
}

/// One restraint per coordinate for the node at `ctx.node_index`.
///
/// `ranges[c]` is the sampling grid for coordinate `c`.
pub fn fit_restraints(
    fitter: &dyn RestraintFitter,
    ctx: &FitContext<'_>,
    ranges: &[Vec<f64>],
) -> Result<Vec<Restraint>, FittingError> {
    let coords = ctx.partition.centre(ctx.node_index)?.coordinates().clone();
    coords
        .iter()
        .zip(ranges)
        .enumerate()
        .map(|(index, (coord, range))| {
            let restraint = fitter.fit(ctx, coord, index, range)?;
            debug!(coord = %coord.label(), ?restraint, "Fitted restraint");
            Ok(restraint)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::constants::RANGE_SAMPLES;
    use crate::core::coords::{CoordinateSet, TrajectoryFrames};
    use crate::core::utils::numeric::linspace;
    use std::f64::consts::PI;

    pub(crate) fn partition(coords: &CoordinateSet, positions: &[Vec<f64>], alpha: f64) -> PhiPartition {
        let centres = positions
            .iter()
            .map(|p| TrajectoryFrames::single(coords.clone(), p).unwrap())
            .collect();
        PhiPartition::new(alpha, centres).unwrap()
    }

    pub(crate) fn linear_coords() -> CoordinateSet {
        CoordinateSet::new(vec![InternalCoordinate::linear(0, 1)]).unwrap()
    }

    pub(crate) fn dihedral_coords() -> CoordinateSet {
        CoordinateSet::new(vec![InternalCoordinate::dihedral([0, 1, 2, 3])]).unwrap()
    }

    pub(crate) fn dihedral_range() -> Vec<f64> {
        linspace(-PI, PI, RANGE_SAMPLES)
    }

    #[test]
    fn fit_restraints_produces_one_restraint_per_coordinate() {
        let coords = CoordinateSet::new(vec![
            InternalCoordinate::dihedral([0, 1, 2, 3]),
            InternalCoordinate::linear(0, 3),
        ])
        .unwrap();
        let p = partition(&coords, &[vec![0.0, 1.0], vec![2.0, 3.0]], 2.0);
        let ctx = FitContext {
            partition: &p,
            node_index: 1,
            beta: 0.4,
            force_constant: 5.0,
        };
        let ranges = vec![dihedral_range(), linspace(0.0, 4.0, RANGE_SAMPLES)];
        let restraints = fit_restraints(&HarmonicFitter, &ctx, &ranges).unwrap();
        assert_eq!(restraints.len(), 2);
        assert!(matches!(restraints[0], Restraint::Dihedral { phi0, .. } if phi0 == 2.0));
        assert!(matches!(restraints[1], Restraint::Distance { r0, .. } if r0 == 3.0));
    }

    #[test]
    fn fitter_for_returns_matching_strategy() {
        assert!(fitter_for(FitMethod::LeastSquares).range_slack());
        assert!(!fitter_for(FitMethod::Switch).range_slack());
    }
}
