//! Physical constants and fixed numeric parameters shared across the library.

/// Boltzmann constant in kJ/K.
pub const BOLTZMANN: f64 = 1.380658e-26;

/// Avogadro constant in 1/mol.
pub const AVOGADRO: f64 = 6.02214199e23;

/// Upper switching distance that effectively disables the linear tail of a
/// distance restraint.
pub const OPEN_UPPER_BOUND: f64 = 99999.0;

/// Number of samples taken along a coordinate when scanning a potential.
pub const RANGE_SAMPLES: usize = 360;

/// Thermodynamic beta `1 / (k_B T N_A)` in mol/kJ.
#[inline]
pub fn thermo_beta(temperature: f64) -> f64 {
    1.0 / (temperature * BOLTZMANN * AVOGADRO)
}
