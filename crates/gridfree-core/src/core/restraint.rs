use crate::core::constants::OPEN_UPPER_BOUND;
use crate::core::coords::InternalCoordinate;
use crate::core::utils::geometry::wrap_angle;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RestraintError {
    #[error("Restraint parameter '{0}' must be finite")]
    NonFinite(&'static str),
    #[error("Restraint parameter '{0}' must not be negative")]
    Negative(&'static str),
}

/// A flat-bottomed restraint potential acting on one internal coordinate.
///
/// Parameters are expressed in the coordinate's own (scaled) units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Restraint {
    /// Harmonic in the wrapped angular deviation beyond `dphi` from `phi0`.
    Dihedral {
        atoms: Vec<usize>,
        phi0: f64,
        dphi: f64,
        k: f64,
    },
    /// Harmonic below `r0`, flat on `[r0, r1)`, harmonic on `[r1, r2)` and
    /// linear beyond `r2`.
    Distance {
        atoms: Vec<usize>,
        r0: f64,
        r1: f64,
        r2: f64,
        k: f64,
    },
}

fn check(name: &'static str, value: f64) -> Result<f64, RestraintError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RestraintError::NonFinite(name))
    }
}

impl Restraint {
    pub fn dihedral(
        coord: &InternalCoordinate,
        phi0: f64,
        dphi: f64,
        k: f64,
    ) -> Result<Self, RestraintError> {
        if dphi < 0.0 {
            return Err(RestraintError::Negative("dphi"));
        }
        Ok(Restraint::Dihedral {
            atoms: coord.atoms().to_vec(),
            phi0: check("phi0", phi0)?,
            dphi: check("dphi", dphi)?,
            k: check("k", k)?,
        })
    }

    pub fn distance(
        coord: &InternalCoordinate,
        r0: f64,
        r1: f64,
        r2: f64,
        k: f64,
    ) -> Result<Self, RestraintError> {
        Ok(Restraint::Distance {
            atoms: coord.atoms().to_vec(),
            r0: check("r0", r0)?,
            r1: check("r1", r1)?,
            r2: check("r2", r2)?,
            k: check("k", k)?,
        })
    }

    /// A restraint of the coordinate's kind that never contributes energy.
    pub fn inactive(coord: &InternalCoordinate) -> Self {
        if coord.is_dihedral() {
            Restraint::Dihedral {
                atoms: coord.atoms().to_vec(),
                phi0: 0.0,
                dphi: 0.0,
                k: 0.0,
            }
        } else {
            Restraint::Distance {
                atoms: coord.atoms().to_vec(),
                r0: 0.0,
                r1: 0.0,
                r2: OPEN_UPPER_BOUND,
                k: 0.0,
            }
        }
    }

    pub fn atoms(&self) -> &[usize] {
        match self {
            Restraint::Dihedral { atoms, .. } | Restraint::Distance { atoms, .. } => atoms,
        }
    }

    pub fn force_constant(&self) -> f64 {
        match self {
            Restraint::Dihedral { k, .. } | Restraint::Distance { k, .. } => *k,
        }
    }

    /// Restraint energy at coordinate value `x`.
    pub fn energy(&self, x: f64) -> f64 {
        match *self {
            Restraint::Dihedral { phi0, dphi, k, .. } => {
                let dp = wrap_angle(phi0 - x).abs();
                if dp > dphi {
                    0.5 * k * (dp - dphi).powi(2)
                } else {
                    0.0
                }
            }
            Restraint::Distance { r0, r1, r2, k, .. } => {
                if x < r0 {
                    0.5 * k * (x - r0).powi(2)
                } else if x < r1 {
                    0.0
                } else if x < r2 {
                    0.5 * k * (x - r1).powi(2)
                } else {
                    0.5 * k * (r2 - r1) * (2.0 * x - r2 - r1)
                }
            }
        }
    }

    /// Parameters converted from the coordinate's scaled units to physical
    /// units (nm and kJ/(mol nm^2) for distances). Dihedrals are unchanged.
    pub fn to_physical(&self, coord: &InternalCoordinate) -> Self {
        match self {
            Restraint::Dihedral { .. } => self.clone(),
            Restraint::Distance {
                atoms,
                r0,
                r1,
                r2,
                k,
            } => Restraint::Distance {
                atoms: atoms.clone(),
                r0: coord.to_physical(*r0),
                r1: coord.to_physical(*r1),
                r2: if *r2 >= OPEN_UPPER_BOUND {
                    *r2
                } else {
                    coord.to_physical(*r2)
                },
                k: k * coord.weight() * coord.weight(),
            },
        }
    }
}
