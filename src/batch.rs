//! Batch assembly
//!
//! Stacks padded neighbor graphs into the fixed-shape tensors the predictor
//! consumes. Graphs are concatenated along the atom axis (order preserving,
//! never shuffled — downstream predictions are aligned with ground truth by
//! position), and the `neighbors_index` back-references are offset to
//! batch-global atom indices.

use candle_core::{Device, Tensor};

use crate::graph::NeighborGraph;
use crate::{Result, RotprobeError};

/// A batch of neighbor graphs sharing one neighbor capacity.
///
/// Tensor shapes use `N` = total atoms in the batch, `K` = `max_num`:
///
/// - `displacements`: `[N, K, 3]` f32, zero in padded slots
/// - `slot_mask`: `[N, K]` f32, `1.0` for real slots, `0.0` for padding
/// - `central_species`: `[N]` u32
/// - `neighbor_species`: `[N, K]` u32 (padding slots hold the fake index)
/// - `gather_index`: `[N * K]` u32, flattened `j * K + pos` back-reference
///   used to route per-slot gradients to the mirrored slot
#[derive(Debug, Clone)]
pub struct Batch {
    pub n_structures: usize,
    pub n_atoms: usize,
    pub max_num: usize,
    pub displacements: Tensor,
    pub slot_mask: Tensor,
    pub central_species: Tensor,
    pub neighbor_species: Tensor,
    pub neighbors_index: Tensor,
    pub neighbors_pos: Tensor,
    pub gather_index: Tensor,
    /// Which structure each atom belongs to, `[N]` u32.
    pub structure_index: Tensor,
    /// Atom count per structure, in batch order.
    pub atoms_per_structure: Vec<usize>,
    /// Optional per-atom scalar attributes, `[N]` f32.
    pub scalar_attributes: Option<Tensor>,
    /// Structure-level scalar ground truth, `[n_structures]` f32.
    pub scalar_targets: Option<Tensor>,
    /// Per-atom vector ground truth, `[N, 3]` f32.
    pub vector_targets: Option<Tensor>,
}

impl Batch {
    pub fn device(&self) -> &Device {
        self.displacements.device()
    }

    /// Stack a run of graphs into one batch. All graphs must already share
    /// the same `max_num`; mismatches are programming errors.
    pub fn from_graphs(graphs: &[NeighborGraph], device: &Device) -> Result<Self> {
        if graphs.is_empty() {
            return Err(RotprobeError::Input("cannot assemble an empty batch".into()));
        }
        let max_num = graphs[0].max_num;
        for (idx, g) in graphs.iter().enumerate() {
            if g.max_num != max_num {
                return Err(RotprobeError::Contract(format!(
                    "graph {idx} has neighbor capacity {} but the batch uses {max_num}",
                    g.max_num
                )));
            }
        }
        if max_num == 0 {
            return Err(RotprobeError::Input(
                "no atom in the batch has any neighbor within the cutoff".into(),
            ));
        }

        let n_atoms: usize = graphs.iter().map(|g| g.n_atoms).sum();
        let mut displacements = Vec::with_capacity(n_atoms * max_num * 3);
        let mut slot_mask = Vec::with_capacity(n_atoms * max_num);
        let mut central_species = Vec::with_capacity(n_atoms);
        let mut neighbor_species = Vec::with_capacity(n_atoms * max_num);
        let mut neighbors_index = Vec::with_capacity(n_atoms * max_num);
        let mut neighbors_pos = Vec::with_capacity(n_atoms * max_num);
        let mut structure_index = Vec::with_capacity(n_atoms);
        let mut atoms_per_structure = Vec::with_capacity(graphs.len());

        let any_scalar_attrs = graphs.iter().any(|g| g.scalar_attributes.is_some());
        let any_scalar_targets = graphs.iter().any(|g| g.scalar_target.is_some());
        let any_vector_targets = graphs.iter().any(|g| g.vector_target.is_some());
        if any_scalar_targets && !graphs.iter().all(|g| g.scalar_target.is_some()) {
            return Err(RotprobeError::Input(
                "scalar ground truth present for some structures but not all".into(),
            ));
        }
        if any_vector_targets && !graphs.iter().all(|g| g.vector_target.is_some()) {
            return Err(RotprobeError::Input(
                "vector ground truth present for some structures but not all".into(),
            ));
        }
        if any_scalar_attrs && !graphs.iter().all(|g| g.scalar_attributes.is_some()) {
            return Err(RotprobeError::Input(
                "scalar attributes present for some structures but not all".into(),
            ));
        }

        let mut scalar_attributes = Vec::new();
        let mut scalar_targets = Vec::new();
        let mut vector_targets = Vec::new();

        let mut atom_offset = 0u32;
        for (s_idx, g) in graphs.iter().enumerate() {
            displacements.extend_from_slice(&g.displacements);
            slot_mask.extend(g.padded.iter().map(|&p| if p { 0.0f32 } else { 1.0 }));
            central_species.extend_from_slice(&g.central_species);
            neighbor_species.extend_from_slice(&g.neighbor_species);
            neighbors_index.extend(g.neighbors_index.iter().map(|&j| j + atom_offset));
            neighbors_pos.extend_from_slice(&g.neighbors_pos);
            structure_index.extend(std::iter::repeat(s_idx as u32).take(g.n_atoms));
            atoms_per_structure.push(g.n_atoms);

            if let Some(attrs) = &g.scalar_attributes {
                scalar_attributes.extend_from_slice(attrs);
            }
            if let Some(t) = g.scalar_target {
                scalar_targets.push(t as f32);
            }
            if let Some(grads) = &g.vector_target {
                vector_targets.extend_from_slice(grads);
            }

            atom_offset += g.n_atoms as u32;
        }

        let gather_index: Vec<u32> = neighbors_index
            .iter()
            .zip(neighbors_pos.iter())
            .map(|(&j, &pos)| j * max_num as u32 + pos)
            .collect();

        Ok(Self {
            n_structures: graphs.len(),
            n_atoms,
            max_num,
            displacements: Tensor::from_vec(displacements, (n_atoms, max_num, 3), device)?,
            slot_mask: Tensor::from_vec(slot_mask, (n_atoms, max_num), device)?,
            central_species: Tensor::from_vec(central_species, n_atoms, device)?,
            neighbor_species: Tensor::from_vec(neighbor_species, (n_atoms, max_num), device)?,
            neighbors_index: Tensor::from_vec(neighbors_index, (n_atoms, max_num), device)?,
            neighbors_pos: Tensor::from_vec(neighbors_pos, (n_atoms, max_num), device)?,
            gather_index: Tensor::from_vec(gather_index, n_atoms * max_num, device)?,
            structure_index: Tensor::from_vec(structure_index, n_atoms, device)?,
            atoms_per_structure,
            scalar_attributes: if any_scalar_attrs {
                Some(Tensor::from_vec(scalar_attributes, n_atoms, device)?)
            } else {
                None
            },
            scalar_targets: if any_scalar_targets {
                Some(Tensor::from_vec(
                    scalar_targets,
                    graphs.len(),
                    device,
                )?)
            } else {
                None
            },
            vector_targets: if any_vector_targets {
                Some(Tensor::from_vec(vector_targets, (n_atoms, 3), device)?)
            } else {
                None
            },
        })
    }

    /// Sum a per-atom tensor `[N, ...]` into per-structure totals by segment.
    /// Used by test predictors and the reporter for per-structure readout.
    pub fn segment_sum(&self, per_atom: &Tensor) -> Result<Tensor> {
        let mut per_structure = Vec::with_capacity(self.n_structures);
        let mut offset = 0;
        for &count in &self.atoms_per_structure {
            let segment = per_atom.narrow(0, offset, count)?;
            per_structure.push(segment.sum(0)?);
            offset += count;
        }
        Ok(Tensor::stack(&per_structure.iter().collect::<Vec<_>>(), 0)?)
    }
}

/// Split graphs into fixed-size batches, preserving order.
pub fn assemble(
    graphs: &[NeighborGraph],
    batch_size: usize,
    device: &Device,
) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(RotprobeError::Input("batch size must be positive".into()));
    }
    graphs
        .chunks(batch_size)
        .map(|chunk| Batch::from_graphs(chunk, device))
        .collect()
}
