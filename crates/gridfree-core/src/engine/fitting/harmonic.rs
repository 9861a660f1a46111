use super::{FitContext, FittingError, RestraintFitter};
use crate::core::constants::OPEN_UPPER_BOUND;
use crate::core::coords::{CoordinateKind, InternalCoordinate};
use crate::core::restraint::Restraint;

/// Plain harmonic restraint centred on the node with `k = alpha / beta`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarmonicFitter;

impl RestraintFitter for HarmonicFitter {
    fn fit(
        &self,
        ctx: &FitContext<'_>,
        coord: &InternalCoordinate,
        index: usize,
        _range: &[f64],
    ) -> Result<Restraint, FittingError> {
        let value = ctx.node_value(index)?;
        let k = ctx.force_constant;
        Ok(match coord.kind() {
            CoordinateKind::Dihedral => Restraint::dihedral(coord, value, 0.0, k)?,
            CoordinateKind::Linear => Restraint::distance(coord, value, value, OPEN_UPPER_BOUND, k)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fitting::tests::{linear_coords, partition};

    #[test]
    fn harmonic_restraint_has_no_flat_region() {
        let coords = linear_coords();
        let p = partition(&coords, &[vec![0.0], vec![2.0]], 1.0);
        let ctx = FitContext {
            partition: &p,
            node_index: 0,
            beta: 0.4,
            force_constant: 2.5,
        };
        let r = HarmonicFitter.fit(&ctx, &coords[0], 0, &[]).unwrap();
        assert_eq!(
            r,
            Restraint::Distance {
                atoms: vec![0, 1],
                r0: 0.0,
                r1: 0.0,
                r2: OPEN_UPPER_BOUND,
                k: 2.5,
            }
        );
        assert_eq!(r.energy(0.0), 0.0);
        assert!((r.energy(1.0) - 1.25).abs() < 1e-12);
    }
}
