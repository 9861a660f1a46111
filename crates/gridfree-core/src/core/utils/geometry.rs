use nalgebra::Vector3;
use std::f64::consts::{PI, TAU};

/// Signed dihedral angle defined by the bond vectors `r_ij = x_i - x_j`,
/// `r_kj = x_k - x_j` and `r_kl = x_k - x_l`.
///
/// The magnitude is `atan2(|m x n|, m . n)` with `m = r_ij x r_kj` and
/// `n = r_kj x r_kl`, the sign is taken from `r_ij . n` (non-negative counts
/// as positive, as in GROMACS).
pub fn dihedral_angle(r_ij: &Vector3<f64>, r_kj: &Vector3<f64>, r_kl: &Vector3<f64>) -> f64 {
    let m = r_ij.cross(r_kj);
    let n = r_kj.cross(r_kl);
    let angle = m.cross(&n).norm().atan2(m.dot(&n));
    let sign = r_ij.dot(&n);
    if sign < 0.0 { -angle } else { angle }
}

/// Wraps an angular difference into `(-pi, pi]`.
#[inline]
pub fn wrap_angle(delta: f64) -> f64 {
    let wrapped = (delta + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

/// Weighted circular mean of a set of angles.
///
/// Averages the unit complex exponentials and returns the angle of the result.
/// `weights` must have the same length as `angles` when given.
pub fn circular_mean(angles: &[f64], weights: Option<&[f64]>) -> f64 {
    let (mut sin_sum, mut cos_sum) = (0.0, 0.0);
    for (i, angle) in angles.iter().enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        sin_sum += w * angle.sin();
        cos_sum += w * angle.cos();
    }
    sin_sum.atan2(cos_sum)
}
