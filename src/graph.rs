//! Neighbor-graph construction
//!
//! Converts one [`AtomicStructure`] into a fixed-capacity, padded neighbor
//! graph: per-(center, slot) displacement vectors, species encodings, a
//! padded-slot mask, and the `neighbors_index`/`neighbors_pos` back-reference
//! pair that routes per-slot gradients back to the neighbor's own list during
//! force extraction.
//!
//! Neighbor pairs are inserted symmetrically (both directions at once), so
//! the back-reference invariant holds by construction: for every real slot
//! `(i, k)` pointing at atom `j`, slot `(j, neighbors_pos[i][k])` holds the
//! negated displacement.
//!
//! Graphs are built per structure with their own neighbor count, then padded
//! to the maximum count over the whole structure set ([`build_all`]) so that
//! batches share one capacity.

use rayon::prelude::*;
use tracing::debug;

use crate::structure::{AtomicStructure, SpeciesTable};
use crate::{Result, RotprobeError};

/// Pairs closer than this are treated as overlapping atoms and rejected.
const MIN_PAIR_DISTANCE: f64 = 1e-10;

/// Padded, per-structure neighbor graph.
///
/// All per-slot arrays are `[n_atoms * max_num]` row-major; displacements and
/// vector targets carry a trailing component axis. `padded[i * max_num + k]`
/// is `true` for slots beyond the atom's true neighbor count; those slots
/// hold zero displacements and the fake species index.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborGraph {
    pub n_atoms: usize,
    pub max_num: usize,
    /// Relative displacements, `[n_atoms * max_num * 3]`, zero for padding.
    pub displacements: Vec<f32>,
    /// `true` marks a padded slot.
    pub padded: Vec<bool>,
    /// Dense species index of each center atom, `[n_atoms]`.
    pub central_species: Vec<u32>,
    /// Dense species index per slot; padding slots get `padding_species`.
    pub neighbor_species: Vec<u32>,
    /// Fake species index used for padded slots (`n_species`).
    pub padding_species: u32,
    /// For slot `(i, k)`: index of the neighbor atom `j`.
    pub neighbors_index: Vec<u32>,
    /// For slot `(i, k)`: the slot in `j`'s list that points back at `i`.
    pub neighbors_pos: Vec<u32>,
    /// True neighbor count per atom, `[n_atoms]`.
    pub neighbor_counts: Vec<usize>,
    /// Optional per-atom scalar attributes, `[n_atoms]`.
    pub scalar_attributes: Option<Vec<f32>>,
    /// Structure-level scalar ground truth, if requested and present.
    pub scalar_target: Option<f64>,
    /// Per-atom vector ground truth, `[n_atoms * 3]`, if requested.
    pub vector_target: Option<Vec<f32>>,
}

impl NeighborGraph {
    /// Displacement vector of slot `(i, k)`.
    pub fn displacement(&self, i: usize, k: usize) -> [f32; 3] {
        let base = (i * self.max_num + k) * 3;
        [
            self.displacements[base],
            self.displacements[base + 1],
            self.displacements[base + 2],
        ]
    }

    /// Whether slot `(i, k)` is padding.
    pub fn is_padded(&self, i: usize, k: usize) -> bool {
        self.padded[i * self.max_num + k]
    }

    /// Grow the slot capacity to `new_max`, appending fully-masked zero
    /// slots. Must not shrink.
    pub fn pad_to(&mut self, new_max: usize) -> Result<()> {
        if new_max < self.max_num {
            return Err(RotprobeError::Contract(format!(
                "cannot shrink neighbor capacity from {} to {}",
                self.max_num, new_max
            )));
        }
        if new_max == self.max_num {
            return Ok(());
        }
        let n = self.n_atoms;
        let old_max = self.max_num;

        let mut displacements = vec![0.0f32; n * new_max * 3];
        let mut padded = vec![true; n * new_max];
        let mut neighbor_species = vec![self.padding_species; n * new_max];
        let mut neighbors_index = vec![0u32; n * new_max];
        let mut neighbors_pos = vec![0u32; n * new_max];

        for i in 0..n {
            for k in 0..old_max {
                let src = i * old_max + k;
                let dst = i * new_max + k;
                displacements[dst * 3..dst * 3 + 3]
                    .copy_from_slice(&self.displacements[src * 3..src * 3 + 3]);
                padded[dst] = self.padded[src];
                neighbor_species[dst] = self.neighbor_species[src];
                neighbors_index[dst] = self.neighbors_index[src];
                neighbors_pos[dst] = self.neighbors_pos[src];
            }
        }

        self.displacements = displacements;
        self.padded = padded;
        self.neighbor_species = neighbor_species;
        self.neighbors_index = neighbors_index;
        self.neighbors_pos = neighbors_pos;
        self.max_num = new_max;
        Ok(())
    }

    /// Check the back-reference invariant: every real slot `(i, k)` resolves
    /// through `neighbors_index`/`neighbors_pos` to a slot holding the
    /// negated displacement.
    pub fn check_back_references(&self, tol: f32) -> Result<()> {
        for i in 0..self.n_atoms {
            for k in 0..self.max_num {
                if self.is_padded(i, k) {
                    continue;
                }
                let j = self.neighbors_index[i * self.max_num + k] as usize;
                let pos = self.neighbors_pos[i * self.max_num + k] as usize;
                if j >= self.n_atoms || pos >= self.max_num || self.is_padded(j, pos) {
                    return Err(RotprobeError::Contract(format!(
                        "slot ({i}, {k}) back-references invalid slot ({j}, {pos})"
                    )));
                }
                let d = self.displacement(i, k);
                let back = self.displacement(j, pos);
                for c in 0..3 {
                    if (d[c] + back[c]).abs() > tol {
                        return Err(RotprobeError::Contract(format!(
                            "slot ({i}, {k}) and back-reference ({j}, {pos}) are not mirrored"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Intermediate per-atom neighbor entry before padding.
#[derive(Debug, Clone, Copy)]
struct Entry {
    neighbor: usize,
    displacement: [f64; 3],
    back_pos: usize,
}

/// Builds padded neighbor graphs from atomic structures.
///
/// Pure, deterministic transformation; no retries. A structure with zero
/// atoms or a non-positive cutoff is rejected.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    cutoff: f64,
    species: SpeciesTable,
    use_scalar_attributes: bool,
    use_vector_targets: bool,
}

impl GraphBuilder {
    pub fn new(cutoff: f64, species: SpeciesTable) -> Result<Self> {
        if !(cutoff > 0.0) {
            return Err(RotprobeError::Input(format!(
                "cutoff radius must be positive, got {cutoff}"
            )));
        }
        Ok(Self {
            cutoff,
            species,
            use_scalar_attributes: false,
            use_vector_targets: false,
        })
    }

    /// Builder: carry per-atom scalar attributes into graphs.
    pub fn with_scalar_attributes(mut self, yes: bool) -> Self {
        self.use_scalar_attributes = yes;
        self
    }

    /// Builder: carry per-atom vector ground truth into graphs.
    pub fn with_vector_targets(mut self, yes: bool) -> Self {
        self.use_vector_targets = yes;
        self
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn species(&self) -> &SpeciesTable {
        &self.species
    }

    /// Build the neighbor graph for one structure, padded to its own maximum
    /// neighbor count. Use [`NeighborGraph::pad_to`] (or [`build_all`]) to
    /// align capacities across a structure set.
    pub fn build(&self, structure: &AtomicStructure) -> Result<NeighborGraph> {
        structure.validate()?;
        let n = structure.n_atoms();
        let lists = self.neighbor_lists(structure)?;
        let max_num = lists.iter().map(|l| l.len()).max().unwrap_or(0);

        let central_species: Vec<u32> = structure
            .species
            .iter()
            .map(|&code| self.species.index_of(code))
            .collect::<Result<_>>()?;
        let fake = self.species.padding_index();

        let mut displacements = vec![0.0f32; n * max_num * 3];
        let mut padded = vec![true; n * max_num];
        let mut neighbor_species = vec![fake; n * max_num];
        let mut neighbors_index = vec![0u32; n * max_num];
        let mut neighbors_pos = vec![0u32; n * max_num];
        let mut neighbor_counts = vec![0usize; n];

        for (i, list) in lists.iter().enumerate() {
            neighbor_counts[i] = list.len();
            for (k, entry) in list.iter().enumerate() {
                let slot = i * max_num + k;
                for c in 0..3 {
                    displacements[slot * 3 + c] = entry.displacement[c] as f32;
                }
                padded[slot] = false;
                neighbor_species[slot] = central_species[entry.neighbor];
                neighbors_index[slot] = entry.neighbor as u32;
                neighbors_pos[slot] = entry.back_pos as u32;
            }
        }

        let scalar_attributes = if self.use_scalar_attributes {
            let attrs = structure.scalar_attributes.as_ref().ok_or_else(|| {
                RotprobeError::Input("scalar attributes requested but missing".into())
            })?;
            Some(attrs.iter().map(|&a| a as f32).collect())
        } else {
            None
        };

        let vector_target = if self.use_vector_targets {
            structure
                .vector_target
                .as_ref()
                .map(|g| g.iter().flatten().map(|&v| v as f32).collect())
        } else {
            None
        };

        Ok(NeighborGraph {
            n_atoms: n,
            max_num,
            displacements,
            padded,
            central_species,
            neighbor_species,
            padding_species: fake,
            neighbors_index,
            neighbors_pos,
            neighbor_counts,
            scalar_attributes,
            scalar_target: structure.scalar_target,
            vector_target,
        })
    }

    /// Per-atom neighbor lists with symmetric insertion.
    fn neighbor_lists(&self, structure: &AtomicStructure) -> Result<Vec<Vec<Entry>>> {
        let n = structure.n_atoms();
        let mut lists: Vec<Vec<Entry>> = vec![Vec::new(); n];

        let shifts = self.image_shifts(structure);

        // Distinct pairs: insert both directions at once so back_pos is exact.
        for i in 0..n {
            for j in (i + 1)..n {
                for &shift in &shifts {
                    let mut d = [0.0f64; 3];
                    for c in 0..3 {
                        d[c] = structure.positions[j][c] - structure.positions[i][c] + shift[c];
                    }
                    let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                    if r >= self.cutoff {
                        continue;
                    }
                    if r < MIN_PAIR_DISTANCE {
                        return Err(RotprobeError::Input(format!(
                            "atoms {i} and {j} overlap (distance {r:.2e})"
                        )));
                    }
                    let pos_i = lists[i].len();
                    let pos_j = lists[j].len();
                    lists[i].push(Entry {
                        neighbor: j,
                        displacement: d,
                        back_pos: pos_j,
                    });
                    lists[j].push(Entry {
                        neighbor: i,
                        displacement: [-d[0], -d[1], -d[2]],
                        back_pos: pos_i,
                    });
                }
            }
        }

        // Self-images under periodicity: the shift s and its mirror -s form
        // a mutually back-referencing slot pair on the same atom.
        for &shift in &shifts {
            if !lexicographically_positive(shift) {
                continue;
            }
            let r = (shift[0] * shift[0] + shift[1] * shift[1] + shift[2] * shift[2]).sqrt();
            if r >= self.cutoff || r < MIN_PAIR_DISTANCE {
                continue;
            }
            for list in lists.iter_mut() {
                let pos = list.len();
                list.push(Entry {
                    neighbor: usize::MAX, // fixed up below
                    displacement: shift,
                    back_pos: pos + 1,
                });
                list.push(Entry {
                    neighbor: usize::MAX,
                    displacement: [-shift[0], -shift[1], -shift[2]],
                    back_pos: pos,
                });
            }
        }
        for (i, list) in lists.iter_mut().enumerate() {
            for entry in list.iter_mut() {
                if entry.neighbor == usize::MAX {
                    entry.neighbor = i;
                }
            }
        }

        Ok(lists)
    }

    /// Lattice translations whose images can fall within the cutoff.
    /// Non-periodic structures get only the zero shift.
    fn image_shifts(&self, structure: &AtomicStructure) -> Vec<[f64; 3]> {
        let Some(cell) = &structure.cell else {
            return vec![[0.0; 3]];
        };
        let mut reps = [0i64; 3];
        for axis in 0..3 {
            if cell.periodic[axis] {
                let width = cell.perpendicular_width(axis);
                if width > f64::EPSILON {
                    reps[axis] = (self.cutoff / width).ceil() as i64;
                }
            }
        }
        let mut shifts = Vec::new();
        for sa in -reps[0]..=reps[0] {
            for sb in -reps[1]..=reps[1] {
                for sc in -reps[2]..=reps[2] {
                    let mut shift = [0.0f64; 3];
                    for c in 0..3 {
                        shift[c] = sa as f64 * cell.vectors[0][c]
                            + sb as f64 * cell.vectors[1][c]
                            + sc as f64 * cell.vectors[2][c];
                    }
                    shifts.push(shift);
                }
            }
        }
        shifts
    }
}

fn lexicographically_positive(shift: [f64; 3]) -> bool {
    for c in 0..3 {
        if shift[c] > f64::EPSILON {
            return true;
        }
        if shift[c] < -f64::EPSILON {
            return false;
        }
    }
    false
}

/// Build graphs for a whole structure set on a rayon worker pool, compute the
/// global maximum neighbor count, and pad every graph to it. Order follows
/// the input slice.
pub fn build_all(builder: &GraphBuilder, structures: &[AtomicStructure]) -> Result<Vec<NeighborGraph>> {
    if structures.is_empty() {
        return Err(RotprobeError::Input("no structures to process".into()));
    }
    let mut graphs: Vec<NeighborGraph> = structures
        .par_iter()
        .map(|s| builder.build(s))
        .collect::<Result<_>>()?;

    let max_num = graphs.iter().map(|g| g.max_num).max().unwrap_or(0);
    for graph in &mut graphs {
        graph.pad_to(max_num)?;
    }
    debug!(
        n_structures = graphs.len(),
        max_num, "built neighbor graphs"
    );
    Ok(graphs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Cell;

    fn species_ho() -> SpeciesTable {
        SpeciesTable::new(vec![1, 8]).unwrap()
    }

    fn dimer(distance: f64) -> AtomicStructure {
        AtomicStructure::new(vec![1, 1], vec![[0.0; 3], [distance, 0.0, 0.0]])
    }

    #[test]
    fn test_rejects_bad_cutoff() {
        assert!(GraphBuilder::new(0.0, species_ho()).is_err());
        assert!(GraphBuilder::new(-1.0, species_ho()).is_err());
    }

    #[test]
    fn test_rejects_empty_structure() {
        let builder = GraphBuilder::new(2.0, species_ho()).unwrap();
        let empty = AtomicStructure::new(vec![], vec![]);
        assert!(builder.build(&empty).is_err());
    }

    #[test]
    fn test_neighbor_counts_respect_cutoff() {
        // Pair at 1.0 is inside cutoff 2.0; pair at 3.0 is outside.
        let builder = GraphBuilder::new(2.0, species_ho()).unwrap();
        let near = builder.build(&dimer(1.0)).unwrap();
        let far = builder.build(&dimer(3.0)).unwrap();

        assert_eq!(near.neighbor_counts, vec![1, 1]);
        assert_eq!(near.max_num, 1);
        assert_eq!(far.neighbor_counts, vec![0, 0]);
        assert_eq!(far.max_num, 0);
    }

    #[test]
    fn test_build_all_shares_max_num() {
        let builder = GraphBuilder::new(2.0, species_ho()).unwrap();
        let graphs = build_all(&builder, &[dimer(1.0), dimer(3.0)]).unwrap();
        assert_eq!(graphs.len(), 2);
        assert_eq!(graphs[0].max_num, 1);
        assert_eq!(graphs[1].max_num, 1);
        assert_eq!(graphs[1].neighbor_counts, vec![0, 0]);
        assert!(graphs[1].is_padded(0, 0));
    }

    #[test]
    fn test_back_reference_invariant_cluster() {
        // Bent triatomic cluster; all three pairs within cutoff.
        let species = SpeciesTable::new(vec![1, 8]).unwrap();
        let water = AtomicStructure::new(
            vec![8, 1, 1],
            vec![[0.0; 3], [0.96, 0.0, 0.0], [-0.24, 0.93, 0.0]],
        );
        let builder = GraphBuilder::new(2.0, species).unwrap();
        let graph = builder.build(&water).unwrap();
        assert_eq!(graph.neighbor_counts, vec![2, 2, 2]);
        graph.check_back_references(1e-6).unwrap();
    }

    #[test]
    fn test_displacement_matches_geometry() {
        let builder = GraphBuilder::new(2.0, species_ho()).unwrap();
        let graph = builder.build(&dimer(1.0)).unwrap();
        let d = graph.displacement(0, 0);
        assert!((d[0] - 1.0).abs() < 1e-6);
        assert!(d[1].abs() < 1e-6 && d[2].abs() < 1e-6);
        let back = graph.displacement(1, 0);
        assert!((back[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_periodic_images() {
        // Single atom in a cubic cell smaller than the cutoff sees its own
        // images: 6 face neighbors at distance 2.0 under cutoff 2.5.
        let cell = Cell::cubic(2.0);
        let s = AtomicStructure::new(vec![1], vec![[0.0; 3]]).with_cell(cell);
        let builder = GraphBuilder::new(2.5, species_ho()).unwrap();
        let graph = builder.build(&s).unwrap();
        assert_eq!(graph.neighbor_counts, vec![6]);
        graph.check_back_references(1e-6).unwrap();
    }

    #[test]
    fn test_periodic_pair_minimum_image() {
        // Two atoms 0.8 apart along x in a 4.0 cubic cell, cutoff 1.0: only
        // the direct image is within range, once from each side.
        let cell = Cell::cubic(4.0);
        let s = AtomicStructure::new(vec![1, 1], vec![[0.0; 3], [0.8, 0.0, 0.0]]).with_cell(cell);
        let builder = GraphBuilder::new(1.0, species_ho()).unwrap();
        let graph = builder.build(&s).unwrap();
        assert_eq!(graph.neighbor_counts, vec![1, 1]);
        graph.check_back_references(1e-6).unwrap();
    }

    #[test]
    fn test_pad_to_appends_masked_slots() {
        let builder = GraphBuilder::new(2.0, species_ho()).unwrap();
        let mut graph = builder.build(&dimer(1.0)).unwrap();
        graph.pad_to(4).unwrap();
        assert_eq!(graph.max_num, 4);
        assert!(!graph.is_padded(0, 0));
        for k in 1..4 {
            assert!(graph.is_padded(0, k));
            assert_eq!(graph.displacement(0, k), [0.0; 3]);
        }
        graph.check_back_references(1e-6).unwrap();
    }

    #[test]
    fn test_pad_to_cannot_shrink() {
        let builder = GraphBuilder::new(2.0, species_ho()).unwrap();
        let mut graph = builder.build(&dimer(1.0)).unwrap();
        assert!(matches!(
            graph.pad_to(0),
            Err(RotprobeError::Contract(_))
        ));
    }

    #[test]
    fn test_unknown_species_rejected() {
        let builder = GraphBuilder::new(2.0, species_ho()).unwrap();
        let s = AtomicStructure::new(vec![26], vec![[0.0; 3]]);
        assert!(matches!(builder.build(&s), Err(RotprobeError::Input(_))));
    }
}
