//! Soft membership ("phi") functions over a set of node centres.
//!
//! For centres `q_j` and a point `x`,
//! `phi_i(x) = exp(-alpha d_i) / sum_j exp(-alpha d_j)` with `d_j` the merged
//! squared norm `|x - q_j|^2`. Evaluation uses the equivalent form
//! `1 / sum_j exp(-alpha (d_j - d_i))` and, for potentials, a log-sum-exp.

use crate::core::coords::{CoordinateError, CoordinateSet, TrajectoryFrames};
use crate::core::utils::numeric::log_sum_exp;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhiError {
    #[error("Partition has no active nodes")]
    EmptyPartition,
    #[error("Alpha must be finite and positive, got {0}")]
    InvalidAlpha(f64),
    #[error("Partition centre {index} must be a single frame, got {n_frames}")]
    CentreNotSingleFrame { index: usize, n_frames: usize },
    #[error("Node index {index} outside partition of {size} nodes")]
    IndexOutOfRange { index: usize, size: usize },
    #[error("Coordinate index {index} outside of {size} coordinates")]
    CoordinateOutOfRange { index: usize, size: usize },
    #[error("Degenerate phi denominator ({0})")]
    DegenerateDenominator(f64),
    #[error(transparent)]
    Coordinates(#[from] CoordinateError),
}

/// The active node centres of a partition together with its `alpha`.
#[derive(Debug, Clone)]
pub struct PhiPartition {
    alpha: f64,
    coords: CoordinateSet,
    centres: Vec<TrajectoryFrames>,
}

impl PhiPartition {
    pub fn new(alpha: f64, centres: Vec<TrajectoryFrames>) -> Result<Self, PhiError> {
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(PhiError::InvalidAlpha(alpha));
        }
        let coords = centres
            .first()
            .ok_or(PhiError::EmptyPartition)?
            .coordinates()
            .clone();
        for (index, centre) in centres.iter().enumerate() {
            if centre.n_frames() != 1 {
                return Err(PhiError::CentreNotSingleFrame {
                    index,
                    n_frames: centre.n_frames(),
                });
            }
            if centre.coordinates() != &coords {
                return Err(CoordinateError::IncompatibleSets.into());
            }
        }
        Ok(Self {
            alpha,
            coords,
            centres,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn len(&self) -> usize {
        self.centres.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centres.is_empty()
    }

    pub fn centre(&self, index: usize) -> Result<&TrajectoryFrames, PhiError> {
        self.centres.get(index).ok_or(PhiError::IndexOutOfRange {
            index,
            size: self.centres.len(),
        })
    }

    /// Squared distance of every frame to every centre (frames x centres).
    pub fn squared_distances(&self, frames: &TrajectoryFrames) -> Result<DMatrix<f64>, PhiError> {
        let mut dist = DMatrix::zeros(frames.n_frames(), self.centres.len());
        for (j, centre) in self.centres.iter().enumerate() {
            dist.set_column(j, &frames.difference(centre)?.norm2());
        }
        Ok(dist)
    }

    /// `1 / sum_j exp(-alpha (d_j - d_i))` for one row of squared distances.
    fn phi_from(&self, row: impl Iterator<Item = f64>, d_i: f64) -> Result<f64, PhiError> {
        let denominator: f64 = row.map(|d_j| (-self.alpha * (d_j - d_i)).exp()).sum();
        if denominator > 0.0 && !denominator.is_nan() {
            Ok(1.0 / denominator)
        } else {
            Err(PhiError::DegenerateDenominator(denominator))
        }
    }

    /// Membership of every frame in the region of `centre`.
    ///
    /// `centre` need not be one of the partition's nodes; the denominator
    /// always runs over the partition.
    pub fn phi(
        &self,
        frames: &TrajectoryFrames,
        centre: &TrajectoryFrames,
    ) -> Result<DVector<f64>, PhiError> {
        let dist = self.squared_distances(frames)?;
        let own = frames.difference(centre)?.norm2();
        let values = (0..frames.n_frames())
            .map(|f| self.phi_from(dist.row(f).iter().copied(), own[f]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DVector::from_vec(values))
    }

    /// Membership of every frame in the region of partition node `index`.
    pub fn phi_of(&self, frames: &TrajectoryFrames, index: usize) -> Result<DVector<f64>, PhiError> {
        let centre = self.centre(index)?.clone();
        self.phi(frames, &centre)
    }

    /// Memberships of every frame in every region (frames x nodes).
    pub fn memberships(&self, frames: &TrajectoryFrames) -> Result<DMatrix<f64>, PhiError> {
        let dist = self.squared_distances(frames)?;
        let mut phi = DMatrix::zeros(dist.nrows(), dist.ncols());
        for f in 0..dist.nrows() {
            for i in 0..dist.ncols() {
                phi[(f, i)] = self.phi_from(dist.row(f).iter().copied(), dist[(f, i)])?;
            }
        }
        Ok(phi)
    }

    /// `-(1/beta) ln phi` for the region of `centre`, via log-sum-exp.
    pub fn potential(
        &self,
        frames: &TrajectoryFrames,
        centre: &TrajectoryFrames,
        beta: f64,
    ) -> Result<DVector<f64>, PhiError> {
        let dist = self.squared_distances(frames)?;
        let own = frames.difference(centre)?.norm2();
        Ok(DVector::from_iterator(
            frames.n_frames(),
            (0..frames.n_frames()).map(|f| {
                let lse = log_sum_exp(dist.row(f).iter().map(|d| -self.alpha * d));
                (self.alpha * own[f] + lse) / beta
            }),
        ))
    }

    /// Squared-distance contributions when only coordinate `coord` of node
    /// `index`'s position varies over `samples`.
    fn contribution_distances(
        &self,
        samples: &[f64],
        index: usize,
        coord: usize,
    ) -> Result<DMatrix<f64>, PhiError> {
        if coord >= self.coords.len() {
            return Err(PhiError::CoordinateOutOfRange {
                index: coord,
                size: self.coords.len(),
            });
        }
        let reference = self.centre(index)?;
        let c = &self.coords[coord];
        let mut dist = DMatrix::zeros(samples.len(), self.centres.len());
        for (j, other) in self.centres.iter().enumerate() {
            let fixed: f64 = (0..self.coords.len())
                .filter(|&k| k != coord)
                .map(|k| {
                    self.coords[k]
                        .difference(reference.value(0, k), other.value(0, k))
                        .powi(2)
                })
                .sum();
            for (s, &x) in samples.iter().enumerate() {
                dist[(s, j)] = fixed + c.difference(x, other.value(0, coord)).powi(2);
            }
        }
        Ok(dist)
    }

    /// Membership of node `index` along a one-coordinate scan.
    pub fn contribution(
        &self,
        samples: &[f64],
        index: usize,
        coord: usize,
    ) -> Result<Vec<f64>, PhiError> {
        let dist = self.contribution_distances(samples, index, coord)?;
        (0..samples.len())
            .map(|s| self.phi_from(dist.row(s).iter().copied(), dist[(s, index)]))
            .collect()
    }

    /// `-(1/beta) ln phi` of node `index` along a one-coordinate scan.
    pub fn contribution_potential(
        &self,
        samples: &[f64],
        index: usize,
        coord: usize,
        beta: f64,
    ) -> Result<Vec<f64>, PhiError> {
        let dist = self.contribution_distances(samples, index, coord)?;
        Ok((0..samples.len())
            .map(|s| {
                let lse = log_sum_exp(dist.row(s).iter().map(|d| -self.alpha * d));
                (self.alpha * dist[(s, index)] + lse) / beta
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coords::InternalCoordinate;

    fn linear_set() -> CoordinateSet {
        CoordinateSet::new(vec![InternalCoordinate::linear(0, 1)]).unwrap()
    }

    fn point(set: &CoordinateSet, x: f64) -> TrajectoryFrames {
        TrajectoryFrames::single(set.clone(), &[x]).unwrap()
    }

    fn path(set: &CoordinateSet, xs: &[f64]) -> TrajectoryFrames {
        let rows: Vec<Vec<f64>> = xs.iter().map(|&x| vec![x]).collect();
        TrajectoryFrames::from_rows(set.clone(), &rows).unwrap()
    }

    fn two_nodes(alpha: f64) -> (CoordinateSet, PhiPartition) {
        let set = linear_set();
        let partition = PhiPartition::new(alpha, vec![point(&set, 0.0), point(&set, 2.0)]).unwrap();
        (set, partition)
    }

    #[test]
    fn empty_partition_is_a_configuration_error() {
        assert!(matches!(
            PhiPartition::new(1.0, Vec::new()),
            Err(PhiError::EmptyPartition)
        ));
    }

    #[test]
    fn non_positive_alpha_is_rejected() {
        let set = linear_set();
        assert!(matches!(
            PhiPartition::new(0.0, vec![point(&set, 0.0)]),
            Err(PhiError::InvalidAlpha(_))
        ));
    }

    #[test]
    fn two_nodes_split_membership_evenly_at_midpoint() {
        let (set, partition) = two_nodes(1.0);
        let frames = path(&set, &[1.0, 0.0]);
        let phi_a = partition.phi_of(&frames, 0).unwrap();
        let phi_b = partition.phi_of(&frames, 1).unwrap();
        assert!((phi_a[0] - 0.5).abs() < 1e-12);
        assert!((phi_b[0] - 0.5).abs() < 1e-12);
        let expected = 1.0 / (1.0 + (-4.0f64).exp());
        assert!((phi_a[1] - expected).abs() < 1e-12);
        assert!(phi_a[1] > 0.98);
    }

    #[test]
    fn memberships_form_a_partition_of_unity() {
        let set = CoordinateSet::new(vec![
            InternalCoordinate::dihedral([0, 1, 2, 3]),
            InternalCoordinate::linear(0, 3),
        ])
        .unwrap();
        let centres = [[0.0, 1.0], [2.0, 1.5], [-2.5, 0.5], [3.1, 2.0]]
            .iter()
            .map(|c| TrajectoryFrames::single(set.clone(), c).unwrap())
            .collect();
        let partition = PhiPartition::new(3.0, centres).unwrap();
        let rows: Vec<Vec<f64>> = (0..50)
            .map(|i| vec![-3.1 + 0.125 * i as f64, 0.2 + 0.05 * i as f64])
            .collect();
        let frames = TrajectoryFrames::from_rows(set, &rows).unwrap();
        let phi = partition.memberships(&frames).unwrap();
        for row in phi.row_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn membership_peaks_at_own_centre() {
        let (set, partition) = two_nodes(5.0);
        let xs: Vec<f64> = (0..=20).map(|i| 0.1 * i as f64).collect();
        let phi_a = partition.phi_of(&path(&set, &xs), 0).unwrap();
        let argmax = phi_a.argmax().0;
        assert_eq!(argmax, 0);
        for w in phi_a.as_slice().windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn far_away_frames_do_not_overflow() {
        let (set, partition) = two_nodes(50.0);
        let phi = partition.phi_of(&path(&set, &[40.0, -40.0]), 0).unwrap();
        assert!(phi[0] >= 0.0 && phi[0] < 1e-300);
        assert!((phi[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn potential_matches_negative_log_phi() {
        let (set, partition) = two_nodes(1.0);
        let frames = path(&set, &[0.3, 1.0, 1.7]);
        let centre = partition.centre(0).unwrap().clone();
        let phi = partition.phi(&frames, &centre).unwrap();
        let pot = partition.potential(&frames, &centre, 0.4).unwrap();
        for f in 0..3 {
            assert!((pot[f] + phi[f].ln() / 0.4).abs() < 1e-9);
        }
    }

    #[test]
    fn contribution_varies_only_the_chosen_coordinate() {
        let set = CoordinateSet::new(vec![
            InternalCoordinate::linear(0, 1),
            InternalCoordinate::linear(1, 2),
        ])
        .unwrap();
        let centres = vec![
            TrajectoryFrames::single(set.clone(), &[0.0, 0.0]).unwrap(),
            TrajectoryFrames::single(set.clone(), &[2.0, 1.0]).unwrap(),
        ];
        let partition = PhiPartition::new(1.0, centres).unwrap();
        let samples = [0.0, 1.0, 2.0];
        let contrib = partition.contribution(&samples, 0, 0).unwrap();
        let frames = TrajectoryFrames::from_rows(
            set,
            &samples.iter().map(|&x| vec![x, 0.0]).collect::<Vec<_>>(),
        )
        .unwrap();
        let direct = partition.phi_of(&frames, 0).unwrap();
        for s in 0..3 {
            assert!((contrib[s] - direct[s]).abs() < 1e-12);
        }
        let pot = partition.contribution_potential(&samples, 0, 0, 1.0).unwrap();
        assert!((pot[1] + contrib[1].ln()).abs() < 1e-9);
    }
}
