//! Atomic structures and species bookkeeping
//!
//! Input data model for the pipeline: ordered atoms with species codes,
//! positions, an optional periodic cell, and optional ground-truth targets.
//! Structures are immutable inputs owned by the caller; everything derived
//! from them (neighbor graphs, batches) lives in [`crate::graph`] and
//! [`crate::batch`].

use serde::{Deserialize, Serialize};

use crate::{Result, RotprobeError};

/// Periodic cell: three lattice vectors (rows) plus per-axis periodicity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Lattice vectors, row-major: `vectors[i]` is the i-th lattice vector.
    pub vectors: [[f64; 3]; 3],
    /// Which axes are periodic.
    pub periodic: [bool; 3],
}

impl Cell {
    /// Fully periodic cell from three lattice vectors.
    pub fn periodic(vectors: [[f64; 3]; 3]) -> Self {
        Self {
            vectors,
            periodic: [true, true, true],
        }
    }

    /// Cubic cell with edge length `a`, fully periodic.
    pub fn cubic(a: f64) -> Self {
        Self::periodic([[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]])
    }

    /// Volume of the cell (absolute determinant of the lattice matrix).
    pub fn volume(&self) -> f64 {
        let [a, b, c] = self.vectors;
        let bxc = cross(b, c);
        dot(a, bxc).abs()
    }

    /// Perpendicular distance between the two cell faces spanned by the other
    /// two lattice vectors. Controls how many periodic images a cutoff needs.
    pub fn perpendicular_width(&self, axis: usize) -> f64 {
        let [a, b, c] = self.vectors;
        let (u, v) = match axis {
            0 => (b, c),
            1 => (c, a),
            _ => (a, b),
        };
        let area = norm(cross(u, v));
        if area < f64::EPSILON {
            0.0
        } else {
            self.volume() / area
        }
    }
}

/// One atomic structure: ordered atoms with species, positions, optional
/// scalar attributes, an optional periodic cell, and optional ground truth.
///
/// `scalar_target` is a structure-level quantity (e.g. an energy);
/// `vector_target` is per-atom (e.g. forces). A target left as `None` is
/// treated as absent downstream — never as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicStructure {
    /// Per-atom species codes (e.g. atomic numbers).
    pub species: Vec<i32>,
    /// Per-atom Cartesian positions.
    pub positions: Vec<[f64; 3]>,
    /// Optional per-atom scalar attributes (e.g. charges).
    pub scalar_attributes: Option<Vec<f64>>,
    /// Optional periodic cell.
    pub cell: Option<Cell>,
    /// Structure-level scalar ground truth.
    pub scalar_target: Option<f64>,
    /// Per-atom vector ground truth.
    pub vector_target: Option<Vec<[f64; 3]>>,
}

impl AtomicStructure {
    /// Non-periodic structure from species and positions.
    pub fn new(species: Vec<i32>, positions: Vec<[f64; 3]>) -> Self {
        Self {
            species,
            positions,
            scalar_attributes: None,
            cell: None,
            scalar_target: None,
            vector_target: None,
        }
    }

    /// Builder: attach a periodic cell.
    pub fn with_cell(mut self, cell: Cell) -> Self {
        self.cell = Some(cell);
        self
    }

    /// Builder: attach a structure-level scalar target.
    pub fn with_scalar_target(mut self, target: f64) -> Self {
        self.scalar_target = Some(target);
        self
    }

    /// Builder: attach per-atom vector targets.
    pub fn with_vector_target(mut self, target: Vec<[f64; 3]>) -> Self {
        self.vector_target = Some(target);
        self
    }

    /// Builder: attach per-atom scalar attributes.
    pub fn with_scalar_attributes(mut self, attrs: Vec<f64>) -> Self {
        self.scalar_attributes = Some(attrs);
        self
    }

    pub fn n_atoms(&self) -> usize {
        self.species.len()
    }

    /// Consistency check: positions, attributes, and targets must all cover
    /// every atom, and the structure must be non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.species.is_empty() {
            return Err(RotprobeError::Input("structure has zero atoms".into()));
        }
        if self.positions.len() != self.species.len() {
            return Err(RotprobeError::Input(format!(
                "species/position length mismatch: {} vs {}",
                self.species.len(),
                self.positions.len()
            )));
        }
        if let Some(attrs) = &self.scalar_attributes {
            if attrs.len() != self.species.len() {
                return Err(RotprobeError::Input(
                    "scalar attribute count does not match atom count".into(),
                ));
            }
        }
        if let Some(grads) = &self.vector_target {
            if grads.len() != self.species.len() {
                return Err(RotprobeError::Input(
                    "vector target count does not match atom count".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Source of structures, e.g. an extended-XYZ reader. Implementations must
/// preserve file order; predictions are later aligned with ground truth by
/// position.
pub trait StructureSource {
    /// Read structures from `path`. `range` selects a half-open index range;
    /// `None` reads everything.
    fn read(&self, path: &std::path::Path, range: Option<(usize, usize)>)
        -> Result<Vec<AtomicStructure>>;
}

// ============================================================================
// Species table
// ============================================================================

/// Ordered set of species codes known to a trained model.
///
/// Maps raw species codes to dense indices `0..n_species`. Padded neighbor
/// slots use the fake index `n_species`, one past the real range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesTable {
    codes: Vec<i32>,
}

impl SpeciesTable {
    /// Build from an ordered list of species codes.
    pub fn new(codes: Vec<i32>) -> Result<Self> {
        if codes.is_empty() {
            return Err(RotprobeError::Input("empty species table".into()));
        }
        Ok(Self { codes })
    }

    /// Collect the sorted set of species present in `structures`.
    pub fn from_structures(structures: &[AtomicStructure]) -> Result<Self> {
        let mut codes: Vec<i32> = structures
            .iter()
            .flat_map(|s| s.species.iter().copied())
            .collect();
        codes.sort_unstable();
        codes.dedup();
        Self::new(codes)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn codes(&self) -> &[i32] {
        &self.codes
    }

    /// Dense index of a species code. Unknown species are an input error:
    /// the model was never trained on them.
    pub fn index_of(&self, code: i32) -> Result<u32> {
        self.codes
            .iter()
            .position(|&c| c == code)
            .map(|i| i as u32)
            .ok_or_else(|| {
                RotprobeError::Input(format!("species {code} not in the model's species table"))
            })
    }

    /// Index used for padded neighbor slots, one past the real species range.
    pub fn padding_index(&self) -> u32 {
        self.codes.len() as u32
    }

    /// Per-species atom counts for one structure, ordered like the table.
    ///
    /// The dot product of this vector with per-species self-contribution
    /// coefficients gives the structure's additive baseline.
    pub fn compositional_features(&self, structure: &AtomicStructure) -> Result<Vec<f64>> {
        let mut counts = vec![0.0; self.codes.len()];
        for &code in &structure.species {
            let idx = self.index_of(code)? as usize;
            counts[idx] += 1.0;
        }
        Ok(counts)
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_structure() {
        let s = AtomicStructure::new(vec![], vec![]);
        assert!(matches!(s.validate(), Err(RotprobeError::Input(_))));
    }

    #[test]
    fn test_validate_length_mismatch() {
        let s = AtomicStructure::new(vec![1, 8], vec![[0.0; 3]]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_species_table_indexing() {
        let table = SpeciesTable::new(vec![1, 6, 8]).unwrap();
        assert_eq!(table.index_of(1).unwrap(), 0);
        assert_eq!(table.index_of(8).unwrap(), 2);
        assert_eq!(table.padding_index(), 3);
        assert!(table.index_of(26).is_err());
    }

    #[test]
    fn test_species_table_from_structures() {
        let a = AtomicStructure::new(vec![8, 1, 1], vec![[0.0; 3]; 3]);
        let b = AtomicStructure::new(vec![6, 1], vec![[0.0; 3]; 2]);
        let table = SpeciesTable::from_structures(&[a, b]).unwrap();
        assert_eq!(table.codes(), &[1, 6, 8]);
    }

    #[test]
    fn test_compositional_features() {
        // 2 x H + 1 x O
        let table = SpeciesTable::new(vec![1, 8]).unwrap();
        let water = AtomicStructure::new(
            vec![1, 1, 8],
            vec![[0.0; 3], [1.0, 0.0, 0.0], [0.5, 0.5, 0.0]],
        );
        let feats = table.compositional_features(&water).unwrap();
        assert_eq!(feats, vec![2.0, 1.0]);
    }

    #[test]
    fn test_cell_geometry() {
        let cell = Cell::cubic(4.0);
        assert!((cell.volume() - 64.0).abs() < 1e-12);
        for axis in 0..3 {
            assert!((cell.perpendicular_width(axis) - 4.0).abs() < 1e-12);
        }
    }
}
