use super::pbc::PbcResolver;
use crate::core::utils::geometry::{circular_mean, dihedral_angle, wrap_angle};
use nalgebra::Vector3;
use phf::phf_map;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinateKind {
    Dihedral,
    Linear,
}

static KIND_TAGS: phf::Map<&'static str, CoordinateKind> = phf_map! {
    "Dihedral" => CoordinateKind::Dihedral,
    "DihedralCoordinate" => CoordinateKind::Dihedral,
    "Linear" => CoordinateKind::Linear,
    "LinearCoordinate" => CoordinateKind::Linear,
};

impl CoordinateKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        KIND_TAGS.get(tag).copied()
    }

    pub fn tag(self) -> &'static str {
        match self {
            CoordinateKind::Dihedral => "Dihedral",
            CoordinateKind::Linear => "Linear",
        }
    }

    pub fn atom_count(self) -> usize {
        match self {
            CoordinateKind::Dihedral => 4,
            CoordinateKind::Linear => 2,
        }
    }

    /// Kind implied by a bare atom tuple of the given length.
    pub fn for_atom_count(count: usize) -> Option<Self> {
        match count {
            4 => Some(CoordinateKind::Dihedral),
            2 => Some(CoordinateKind::Linear),
            _ => None,
        }
    }

    fn label_prefix(self) -> &'static str {
        match self {
            CoordinateKind::Dihedral => "dih",
            CoordinateKind::Linear => "lin",
        }
    }
}

/// A single internal coordinate: a dihedral angle over four atoms, or a
/// rescaled distance between two atoms.
///
/// Linear values are reported as `weight * (distance - offset)`; dihedrals
/// always carry unit weight and zero offset.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalCoordinate {
    kind: CoordinateKind,
    atoms: Vec<usize>,
    label: Option<String>,
    weight: f64,
    offset: f64,
    index: usize,
}

impl InternalCoordinate {
    pub fn dihedral(atoms: [usize; 4]) -> Self {
        Self {
            kind: CoordinateKind::Dihedral,
            atoms: atoms.to_vec(),
            label: None,
            weight: 1.0,
            offset: 0.0,
            index: 0,
        }
    }

    pub fn linear(first: usize, second: usize) -> Self {
        Self {
            kind: CoordinateKind::Linear,
            atoms: vec![first, second],
            label: None,
            weight: 1.0,
            offset: 0.0,
            index: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Only meaningful for linear coordinates.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Only meaningful for linear coordinates.
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn kind(&self) -> CoordinateKind {
        self.kind
    }
    pub fn atoms(&self) -> &[usize] {
        &self.atoms
    }
    pub fn weight(&self) -> f64 {
        self.weight
    }
    pub fn offset(&self) -> f64 {
        self.offset
    }
    /// Position of this coordinate inside its set.
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn explicit_label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The explicit label, or `dih_NNN` / `lin_NNN` derived from the index.
    pub fn label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("{}_{:03}", self.kind.label_prefix(), self.index),
        }
    }

    pub fn is_dihedral(&self) -> bool {
        self.kind == CoordinateKind::Dihedral
    }

    /// Difference `a - b` under this coordinate's arithmetic.
    #[inline]
    pub fn difference(&self, a: f64, b: f64) -> f64 {
        match self.kind {
            CoordinateKind::Dihedral => wrap_angle(a - b),
            CoordinateKind::Linear => a - b,
        }
    }

    /// Mean of `values`, circular for dihedrals.
    pub fn mean(&self, values: &[f64], weights: Option<&[f64]>) -> f64 {
        match self.kind {
            CoordinateKind::Dihedral => circular_mean(values, weights),
            CoordinateKind::Linear => {
                let (mut sum, mut norm) = (0.0, 0.0);
                for (i, v) in values.iter().enumerate() {
                    let w = weights.map_or(1.0, |w| w[i]);
                    sum += w * v;
                    norm += w;
                }
                sum / norm
            }
        }
    }

    /// Natural sampling range: `[-pi, pi]` for dihedrals, none for linears.
    pub fn natural_range(&self) -> Option<(f64, f64)> {
        match self.kind {
            CoordinateKind::Dihedral => Some((-PI, PI)),
            CoordinateKind::Linear => None,
        }
    }

    /// Converts a value of this coordinate back to physical units
    /// (nm for linears, radians for dihedrals).
    pub fn to_physical(&self, value: f64) -> f64 {
        match self.kind {
            CoordinateKind::Dihedral => value,
            CoordinateKind::Linear => value / self.weight + self.offset,
        }
    }

    /// Evaluates the coordinate for one frame.
    ///
    /// `positions` holds the atoms starting at absolute index `atom_offset`.
    pub(crate) fn evaluate(
        &self,
        positions: &[Vector3<f64>],
        atom_offset: usize,
        pbc: &PbcResolver,
        frame: usize,
    ) -> f64 {
        let dx = |a: usize, b: usize| {
            pbc.minimum_image(
                frame,
                &positions[self.atoms[a] - atom_offset],
                &positions[self.atoms[b] - atom_offset],
            )
        };
        match self.kind {
            CoordinateKind::Dihedral => dihedral_angle(&dx(0, 1), &dx(2, 1), &dx(2, 3)),
            CoordinateKind::Linear => self.weight * (dx(0, 1).norm() - self.offset),
        }
    }
}
