use super::coordinate::{CoordinateKind, InternalCoordinate};
use super::definition::{format_definition, parse_definition};
use super::frames::TrajectoryFrames;
use super::pbc::PbcResolver;
use super::CoordinateError;
use crate::core::io::trr::TrrReader;
use nalgebra::{DMatrix, Matrix3, Vector3};
use std::ops::{Index, Range};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

/// An ordered, immutable, non-empty list of internal coordinates.
///
/// Cloning is cheap: all clones share the same underlying list.
#[derive(Debug, Clone)]
pub struct CoordinateSet {
    coords: Arc<[InternalCoordinate]>,
}

impl PartialEq for CoordinateSet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.coords, &other.coords) || self.coords == other.coords
    }
}

impl Index<usize> for CoordinateSet {
    type Output = InternalCoordinate;

    fn index(&self, index: usize) -> &Self::Output {
        &self.coords[index]
    }
}

impl CoordinateSet {
    pub fn new(mut coords: Vec<InternalCoordinate>) -> Result<Self, CoordinateError> {
        if coords.is_empty() {
            return Err(CoordinateError::EmptySet);
        }
        for (index, coord) in coords.iter_mut().enumerate() {
            let expected = coord.kind().atom_count();
            if coord.atoms().len() != expected {
                return Err(CoordinateError::AtomCount {
                    index,
                    kind: coord.kind(),
                    expected,
                    found: coord.atoms().len(),
                });
            }
            if !coord.weight().is_finite() || !coord.offset().is_finite() {
                return Err(CoordinateError::NonFinite("coordinate parameters"));
            }
            coord.set_index(index);
        }
        Ok(Self {
            coords: coords.into(),
        })
    }

    pub fn parse(text: &str) -> Result<Self, CoordinateError> {
        Self::new(parse_definition(text)?)
    }

    pub fn read_from_path(path: &Path) -> Result<Self, CoordinateError> {
        let text = std::fs::read_to_string(path).map_err(|e| CoordinateError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Self::parse(&text)
    }

    pub fn write_to_path(&self, path: &Path) -> Result<(), CoordinateError> {
        std::fs::write(path, self.to_definition() + "\n").map_err(|e| CoordinateError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })
    }

    pub fn to_definition(&self) -> String {
        format_definition(&self.coords)
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InternalCoordinate> {
        self.coords.iter()
    }

    pub fn n_kind(&self, kind: CoordinateKind) -> usize {
        self.coords.iter().filter(|c| c.kind() == kind).count()
    }

    /// Index of the first coordinate with the given label.
    pub fn position(&self, label: &str) -> Option<usize> {
        self.coords.iter().position(|c| c.label() == label)
    }

    /// Smallest contiguous atom range touched by any coordinate.
    pub fn atom_range(&self) -> Range<usize> {
        let atoms = self.coords.iter().flat_map(|c| c.atoms().iter().copied());
        let min = atoms.clone().min().unwrap_or(0);
        let max = atoms.max().unwrap_or(0);
        min..max + 1
    }

    /// Evaluates every coordinate on every frame.
    ///
    /// `positions[f]` holds the atoms of frame `f` starting at absolute index
    /// `atom_offset`; `boxes` is either empty or has one box per frame.
    pub fn evaluate(
        &self,
        positions: &[Vec<Vector3<f64>>],
        boxes: &[Matrix3<f64>],
        atom_offset: usize,
    ) -> Result<TrajectoryFrames, CoordinateError> {
        let pbc = if boxes.is_empty() {
            PbcResolver::disabled()
        } else if boxes.len() != positions.len() {
            return Err(CoordinateError::ShapeMismatch {
                expected: (positions.len(), 3),
                found: (boxes.len(), 3),
            });
        } else {
            PbcResolver::new(boxes)?
        };
        let range = self.atom_range();
        for frame in positions {
            let available = atom_offset + frame.len();
            if range.start < atom_offset || range.end > available {
                return Err(CoordinateError::AtomOutOfRange {
                    atom: if range.start < atom_offset { range.start } else { range.end - 1 },
                    available,
                });
            }
        }
        let values = DMatrix::from_fn(positions.len(), self.len(), |f, c| {
            self.coords[c].evaluate(&positions[f], atom_offset, &pbc, f)
        });
        TrajectoryFrames::new(self.clone(), values, None)
    }

    /// Reads a TRR trajectory and converts it into coordinate space.
    #[instrument(skip_all, name = "read_trajectory", fields(path = %path.display()))]
    pub fn read_trajectory(&self, path: &Path) -> Result<TrajectoryFrames, CoordinateError> {
        let mut reader = TrrReader::open(path)?;
        let atoms = self.atom_range();
        let frames = reader.read_all(atoms.clone())?;
        debug!(frames = frames.len(), "Loaded trajectory frames");

        let has_boxes = frames.iter().all(|f| f.cell.is_some());
        let boxes: Vec<Matrix3<f64>> = if has_boxes {
            frames.iter().filter_map(|f| f.cell).collect()
        } else {
            Vec::new()
        };
        let positions: Vec<Vec<Vector3<f64>>> =
            frames.into_iter().map(|f| f.positions).collect();
        self.evaluate(&positions, &boxes, atoms.start)
    }

    /// Returns a copy in which every linear coordinate is rescaled so that the
    /// given presampling trajectory has zero mean and variance one half along
    /// it. Dihedrals are left untouched.
    pub fn balanced(&self, presampling: &TrajectoryFrames) -> Result<Self, CoordinateError> {
        if presampling.coordinates() != self {
            return Err(CoordinateError::IncompatibleSets);
        }
        let mean = presampling.mean()?;
        let var = presampling.var()?;
        let coords = self
            .coords
            .iter()
            .enumerate()
            .map(|(c, coord)| match coord.kind() {
                CoordinateKind::Dihedral => coord.clone(),
                CoordinateKind::Linear => {
                    let physical_mean = coord.to_physical(mean.value(0, c));
                    let physical_var = var.value(0, c) / (coord.weight() * coord.weight());
                    let weight = 1.0 / (2.0 * physical_var).sqrt();
                    coord.clone().with_weight(weight).with_offset(physical_mean)
                }
            })
            .collect();
        Self::new(coords)
    }
}

impl<'a> IntoIterator for &'a CoordinateSet {
    type Item = &'a InternalCoordinate;
    type IntoIter = std::slice::Iter<'a, InternalCoordinate>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn chain_positions(twist: f64, stretch: f64) -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(twist.cos(), twist.sin(), 1.0 + stretch),
        ]
    }

    #[test]
    fn empty_set_is_rejected() {
        assert!(matches!(
            CoordinateSet::new(Vec::new()),
            Err(CoordinateError::EmptySet)
        ));
    }

    #[test]
    fn clones_compare_equal_and_independent_parses_compare_by_content() {
        let a = CoordinateSet::parse("(0-1-2-3),(0-3)").unwrap();
        let b = CoordinateSet::parse("(0-1-2-3), (0-3)").unwrap();
        let c = CoordinateSet::parse("(0-1-2-3),(1-3)").unwrap();
        assert_eq!(a, a.clone());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn default_labels_are_assigned_by_position() {
        let set = CoordinateSet::parse("(0-1-2-3),(0-3){'label':'end'},(1-2)").unwrap();
        let labels: Vec<String> = set.iter().map(|c| c.label()).collect();
        assert_eq!(labels, vec!["dih_000", "end", "lin_002"]);
        assert_eq!(set.position("end"), Some(1));
    }

    #[test]
    fn definition_round_trip_preserves_set() {
        let set = CoordinateSet::parse(
            "(0-1-2-3){'label':'omega'},(0-3){'weight':1.75,'offset':0.3},(1-3)",
        )
        .unwrap();
        let reparsed = CoordinateSet::parse(&set.to_definition()).unwrap();
        assert_eq!(set, reparsed);
        assert_eq!(reparsed.len(), 3);
    }

    #[test]
    fn evaluate_computes_dihedral_and_distance() {
        let set = CoordinateSet::parse("(0-1-2-3),(2-3)").unwrap();
        let frames = set
            .evaluate(
                &[chain_positions(PI / 2.0, 0.0), chain_positions(PI, 1.0)],
                &[],
                0,
            )
            .unwrap();
        assert!((frames.value(0, 0).abs() - PI / 2.0).abs() < 1e-9);
        assert!((frames.value(1, 0).abs() - PI).abs() < 1e-9);
        assert!((frames.value(0, 1) - 1.0).abs() < 1e-9);
        assert!((frames.value(1, 1) - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn evaluate_applies_periodic_images() {
        let set = CoordinateSet::parse("(0-1)").unwrap();
        let positions = vec![vec![Vector3::new(0.1, 0.0, 0.0), Vector3::new(2.9, 0.0, 0.0)]];
        let frames = set
            .evaluate(&positions, &[Matrix3::from_diagonal_element(3.0)], 0)
            .unwrap();
        assert!((frames.value(0, 0) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn evaluate_needs_one_box_per_frame() {
        let set = CoordinateSet::parse("(0-1)").unwrap();
        let frame = vec![Vector3::new(0.1, 0.0, 0.0), Vector3::new(2.9, 0.0, 0.0)];
        let err = set
            .evaluate(&[frame.clone(), frame], &[Matrix3::from_diagonal_element(3.0)], 0)
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinateError::ShapeMismatch {
                expected: (2, 3),
                found: (1, 3)
            }
        ));
    }

    #[test]
    fn evaluate_rejects_atoms_outside_loaded_range() {
        let set = CoordinateSet::parse("(0-5)").unwrap();
        let err = set
            .evaluate(&[vec![Vector3::zeros(); 3]], &[], 0)
            .unwrap_err();
        assert!(matches!(err, CoordinateError::AtomOutOfRange { atom: 5, .. }));
    }

    #[test]
    fn atom_range_spans_all_coordinates() {
        let set = CoordinateSet::parse("(4-5-6-7),(3-9)").unwrap();
        assert_eq!(set.atom_range(), 3..10);
    }

    #[test]
    fn balancing_rescales_linears_to_unit_half_variance() {
        let set = CoordinateSet::parse("(0-1-2-3),(2-3)").unwrap();
        let rows: Vec<Vec<f64>> = [1.0, 2.0, 3.0].iter().map(|&v| vec![0.0, v]).collect();
        let presampling = TrajectoryFrames::from_rows(set.clone(), &rows).unwrap();
        let balanced = set.balanced(&presampling).unwrap();
        let lin = &balanced[1];
        assert!((lin.offset() - 2.0).abs() < 1e-12);
        assert!((lin.weight() - (3.0f64 / 4.0).sqrt()).abs() < 1e-12);
        assert_eq!(balanced[0], set[0]);
    }
}
