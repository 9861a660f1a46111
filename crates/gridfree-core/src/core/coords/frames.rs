use super::{CoordinateError, CoordinateSet};
use nalgebra::{DMatrix, DVector};

/// A frames-by-coordinates matrix of internal-coordinate values, optionally
/// carrying one statistical weight per frame.
///
/// Instances are immutable; every operation returns a new instance. Values
/// and weights are validated to be finite on construction.
#[derive(Debug, Clone)]
pub struct TrajectoryFrames {
    coords: CoordinateSet,
    values: DMatrix<f64>,
    weights: Option<DVector<f64>>,
}

impl TrajectoryFrames {
    pub fn new(
        coords: CoordinateSet,
        values: DMatrix<f64>,
        weights: Option<DVector<f64>>,
    ) -> Result<Self, CoordinateError> {
        if values.ncols() != coords.len() {
            return Err(CoordinateError::ShapeMismatch {
                expected: (values.nrows(), coords.len()),
                found: values.shape(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CoordinateError::NonFinite("trajectory values"));
        }
        if let Some(w) = &weights {
            if w.len() != values.nrows() {
                return Err(CoordinateError::ShapeMismatch {
                    expected: (values.nrows(), 1),
                    found: (w.len(), 1),
                });
            }
            if w.iter().any(|v| !v.is_finite()) {
                return Err(CoordinateError::NonFinite("frame weights"));
            }
        }
        Ok(Self {
            coords,
            values,
            weights,
        })
    }

    /// Builds an unweighted instance from row-major frame values.
    pub fn from_rows(coords: CoordinateSet, rows: &[Vec<f64>]) -> Result<Self, CoordinateError> {
        let n_coords = coords.len();
        if let Some(row) = rows.iter().find(|r| r.len() != n_coords) {
            return Err(CoordinateError::ShapeMismatch {
                expected: (rows.len(), n_coords),
                found: (rows.len(), row.len()),
            });
        }
        let values = DMatrix::from_fn(rows.len(), n_coords, |i, j| rows[i][j]);
        Self::new(coords, values, None)
    }

    /// A one-frame instance, e.g. a node position.
    pub fn single(coords: CoordinateSet, values: &[f64]) -> Result<Self, CoordinateError> {
        Self::from_rows(coords, &[values.to_vec()])
    }

    pub fn with_weights(self, weights: DVector<f64>) -> Result<Self, CoordinateError> {
        Self::new(self.coords, self.values, Some(weights))
    }

    pub fn coordinates(&self) -> &CoordinateSet {
        &self.coords
    }
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }
    pub fn weights(&self) -> Option<&DVector<f64>> {
        self.weights.as_ref()
    }
    pub fn has_weights(&self) -> bool {
        self.weights.is_some()
    }
    pub fn n_frames(&self) -> usize {
        self.values.nrows()
    }
    pub fn n_coords(&self) -> usize {
        self.values.ncols()
    }
    pub fn is_empty(&self) -> bool {
        self.n_frames() == 0
    }

    pub fn value(&self, frame: usize, coord: usize) -> f64 {
        self.values[(frame, coord)]
    }

    /// All values of one frame.
    pub fn frame_values(&self, frame: usize) -> Vec<f64> {
        self.values.row(frame).iter().copied().collect()
    }

    /// All values of one coordinate across frames.
    pub fn column(&self, coord: usize) -> Vec<f64> {
        self.values.column(coord).iter().copied().collect()
    }

    fn require_weights(&self) -> Result<&DVector<f64>, CoordinateError> {
        self.weights.as_ref().ok_or(CoordinateError::MissingWeights)
    }

    fn mean_with(&self, weights: Option<&[f64]>) -> Result<Self, CoordinateError> {
        if self.is_empty() {
            return Err(CoordinateError::EmptyFrames);
        }
        let means: Vec<f64> = self
            .coords
            .iter()
            .enumerate()
            .map(|(c, coord)| coord.mean(&self.column(c), weights))
            .collect();
        Self::single(self.coords.clone(), &means)
    }

    /// Per-coordinate mean; circular for dihedrals.
    pub fn mean(&self) -> Result<Self, CoordinateError> {
        self.mean_with(None)
    }

    pub fn mean_weighted(&self) -> Result<Self, CoordinateError> {
        let weights = self.require_weights()?;
        self.mean_with(Some(weights.as_slice()))
    }

    fn average_rows(matrix: &DMatrix<f64>, weights: Option<&DVector<f64>>) -> DVector<f64> {
        match weights {
            Some(w) => {
                let total = w.sum();
                matrix.transpose() * w / total
            }
            None => matrix.row_mean().transpose(),
        }
    }

    /// Per-coordinate variance around the mean, as a one-frame instance.
    pub fn var(&self) -> Result<Self, CoordinateError> {
        let diff = self.difference(&self.mean()?)?;
        let var = Self::average_rows(&diff.values.map(|v| v * v), None);
        Self::single(self.coords.clone(), var.as_slice())
    }

    /// Weighted per-coordinate variance around the weighted mean.
    pub fn var_weighted(&self) -> Result<Self, CoordinateError> {
        let weights = self.require_weights()?;
        let diff = self.difference(&self.mean_weighted()?)?;
        let var = Self::average_rows(&diff.values.map(|v| v * v), Some(weights));
        Self::single(self.coords.clone(), var.as_slice())
    }

    /// Variance with all coordinates merged: mean squared norm of the
    /// deviations from the mean.
    pub fn merged_var(&self) -> Result<f64, CoordinateError> {
        let diff = self.difference(&self.mean()?)?;
        Ok(diff.norm2().mean())
    }

    pub fn merged_var_weighted(&self) -> Result<f64, CoordinateError> {
        let weights = self.require_weights()?;
        let diff = self.difference(&self.mean_weighted()?)?;
        Ok(diff.norm2().dot(weights) / weights.sum())
    }

    /// Frame-wise difference using each coordinate's own arithmetic.
    ///
    /// A one-frame `other` is broadcast across all frames of `self`. The
    /// result carries no weights.
    pub fn difference(&self, other: &Self) -> Result<Self, CoordinateError> {
        if self.coords != other.coords {
            return Err(CoordinateError::IncompatibleSets);
        }
        let broadcast = other.n_frames() == 1;
        if !broadcast && other.n_frames() != self.n_frames() {
            return Err(CoordinateError::ShapeMismatch {
                expected: self.values.shape(),
                found: other.values.shape(),
            });
        }
        let values = DMatrix::from_fn(self.n_frames(), self.n_coords(), |f, c| {
            let g = if broadcast { 0 } else { f };
            self.coords[c].difference(self.values[(f, c)], other.values[(g, c)])
        });
        Self::new(self.coords.clone(), values, None)
    }

    /// Sum of squares across coordinates, per frame.
    ///
    /// Dihedral (radians) and linear values are summed as-is.
    pub fn norm2(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.n_frames(),
            self.values.row_iter().map(|row| row.norm_squared()),
        )
    }

    pub fn norm(&self) -> DVector<f64> {
        self.norm2().map(f64::sqrt)
    }

    pub fn square(&self) -> Self {
        Self {
            coords: self.coords.clone(),
            values: self.values.map(|v| v * v),
            weights: self.weights.clone(),
        }
    }

    pub fn frame(&self, index: usize) -> Result<Self, CoordinateError> {
        self.select(&[index])
    }

    /// Selects frames (weights included) in the given order.
    pub fn select(&self, indices: &[usize]) -> Result<Self, CoordinateError> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.n_frames()) {
            return Err(CoordinateError::FrameOutOfRange {
                index,
                n_frames: self.n_frames(),
            });
        }
        Ok(Self {
            coords: self.coords.clone(),
            values: self.values.select_rows(indices),
            weights: self.weights.as_ref().map(|w| w.select_rows(indices)),
        })
    }

    /// Splits into `parts` contiguous segments of near-equal length; the
    /// first `n_frames % parts` segments are one frame longer.
    pub fn split(&self, parts: usize) -> Result<Vec<Self>, CoordinateError> {
        if parts == 0 || parts > self.n_frames() {
            return Err(CoordinateError::InvalidSplit {
                n_frames: self.n_frames(),
                parts,
            });
        }
        let base = self.n_frames() / parts;
        let extra = self.n_frames() % parts;
        let mut start = 0;
        (0..parts)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let indices: Vec<usize> = (start..start + len).collect();
                start += len;
                self.select(&indices)
            })
            .collect()
    }

    /// Concatenates frames of instances sharing a coordinate set. Weights are
    /// kept only if every part has them.
    pub fn stack(parts: &[Self]) -> Result<Self, CoordinateError> {
        let first = parts.first().ok_or(CoordinateError::EmptyFrames)?;
        if parts.iter().any(|p| p.coords != first.coords) {
            return Err(CoordinateError::IncompatibleSets);
        }
        let n_frames: usize = parts.iter().map(Self::n_frames).sum();
        let mut values = DMatrix::zeros(n_frames, first.n_coords());
        let mut row = 0;
        for part in parts {
            values
                .rows_mut(row, part.n_frames())
                .copy_from(&part.values);
            row += part.n_frames();
        }
        let weights = if parts.iter().all(Self::has_weights) {
            Some(DVector::from_iterator(
                n_frames,
                parts
                    .iter()
                    .flat_map(|p| p.weights.iter().flat_map(|w| w.iter().copied())),
            ))
        } else {
            None
        };
        Self::new(first.coords.clone(), values, weights)
    }
}
