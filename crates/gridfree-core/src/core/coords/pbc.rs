use super::CoordinateError;
use itertools::iproduct;
use nalgebra::{Matrix3, Vector3};

/// Minimum-image resolution for triclinic boxes.
///
/// Each box is a 3x3 matrix whose rows are the box vectors. Only
/// lower-triangular boxes are accepted. For every frame the 27 integer
/// combinations of the box vectors (the zero shift included) are precomputed;
/// a pair difference is resolved to the shifted image of smallest norm.
#[derive(Debug, Clone)]
pub struct PbcResolver {
    shifts: Option<Vec<[Vector3<f64>; 27]>>,
}

impl PbcResolver {
    /// Plain differences, no periodic images.
    pub fn disabled() -> Self {
        Self { shifts: None }
    }

    pub fn new(boxes: &[Matrix3<f64>]) -> Result<Self, CoordinateError> {
        if boxes.iter().all(|b| b.iter().all(|&v| v == 0.0)) {
            return Ok(Self::disabled());
        }

        let mut shifts = Vec::with_capacity(boxes.len());
        for (frame, b) in boxes.iter().enumerate() {
            if b[(0, 1)] != 0.0 || b[(0, 2)] != 0.0 || b[(1, 2)] != 0.0 {
                return Err(CoordinateError::InvalidBox { frame });
            }
            if b.iter().any(|v| !v.is_finite()) {
                return Err(CoordinateError::NonFinite("box"));
            }
            let rows = [
                b.row(0).transpose(),
                b.row(1).transpose(),
                b.row(2).transpose(),
            ];
            let mut frame_shifts = [Vector3::zeros(); 27];
            for (slot, (i, j, k)) in iproduct!(-1i32..=1, -1i32..=1, -1i32..=1).enumerate() {
                frame_shifts[slot] =
                    rows[0] * f64::from(i) + rows[1] * f64::from(j) + rows[2] * f64::from(k);
            }
            shifts.push(frame_shifts);
        }
        Ok(Self {
            shifts: Some(shifts),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.shifts.is_some()
    }

    /// Shortest image of `xi - xj` in the given frame.
    pub fn minimum_image(&self, frame: usize, xi: &Vector3<f64>, xj: &Vector3<f64>) -> Vector3<f64> {
        let dx = xi - xj;
        let Some(shifts) = &self.shifts else {
            return dx;
        };
        shifts[frame]
            .iter()
            .map(|shift| dx + shift)
            .min_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))
            .unwrap_or(dx)
    }
}
