//! End-to-end error estimation
//!
//! Wires the pipeline together: structures are turned into padded neighbor
//! graphs on a worker pool, stacked into batches, run through the predictor
//! under sampled augmentation rotations, aggregated, and compared against
//! ground truth. The result is a printable [`ErrorReport`].

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::Tensor;
use rand::Rng;
use tracing::info;

use crate::aggregate::{aggregate, per_atom_scalar_std};
use crate::artifacts::{SelfContributionTable, save_prediction_arrays};
use crate::batch::assemble;
use crate::device::{best_device, cpu_device};
use crate::ensemble::{EnsembleRunner, Predictor};
use crate::frames::FrameSampler;
use crate::graph::{GraphBuilder, build_all};
use crate::hypers::Hypers;
use crate::metrics::{mae, relative_rmse, rmse};
use crate::rotations::random_rotations;
use crate::structure::{AtomicStructure, SpeciesTable};
use crate::{Result, RotprobeError};

/// Per-run evaluation options, orthogonal to the model's [`Hypers`].
#[derive(Debug, Clone, Default)]
pub struct EstimateOptions {
    /// Number of augmentation rotations to sample; 0 means a single
    /// identity pass.
    pub n_augmentations: usize,
    /// Average predictions over sampled local frames. Frame sets are
    /// computed per batch, so this forces a batch size of 1.
    pub use_frames: bool,
    /// Override the hypers' structural batch size.
    pub batch_size: Option<usize>,
    /// Persist the aggregated prediction arrays here.
    pub save_dir: Option<PathBuf>,
}

/// Errors of one target kind against ground truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetMetrics {
    pub mae: f64,
    pub rmse: f64,
    /// Relative to the predict-the-mean baseline; absent when the targets
    /// are constant.
    pub relative_rmse: Option<f64>,
}

impl TargetMetrics {
    fn compute(predictions: &Tensor, targets: &Tensor) -> Result<Self> {
        Ok(Self {
            mae: mae(predictions, targets)?,
            rmse: rmse(predictions, targets)?,
            relative_rmse: relative_rmse(predictions, targets).ok(),
        })
    }
}

/// Everything one estimation run learned about the model.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub n_structures: usize,
    pub n_atoms: usize,
    pub n_augmentations: usize,

    /// Structure-level scalar errors, when scalar ground truth was present.
    pub scalar: Option<TargetMetrics>,
    /// The same errors with predictions and targets divided by atom counts.
    pub scalar_per_atom: Option<TargetMetrics>,
    /// Pooled rotational discrepancy of the scalar predictions.
    pub scalar_rotational_std: Option<f64>,
    /// Rotational discrepancy normalized by atom counts before pooling.
    pub scalar_rotational_std_per_atom: Option<f64>,

    /// Per-component vector errors, when vector ground truth was present.
    pub vector: Option<TargetMetrics>,
    /// Pooled rotational discrepancy of the vector predictions.
    pub vector_rotational_std: Option<f64>,

    pub seconds_per_atom: f64,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "estimated on {} structures ({} atoms), {} augmentation(s)",
            self.n_structures, self.n_atoms, self.n_augmentations
        )?;
        if let Some(m) = &self.scalar {
            writeln!(f, "scalar      mae {:.6}  rmse {:.6}", m.mae, m.rmse)?;
            if let Some(rel) = m.relative_rmse {
                writeln!(f, "scalar      relative rmse {rel:.6}")?;
            }
        }
        if let Some(m) = &self.scalar_per_atom {
            writeln!(f, "scalar/atom mae {:.6}  rmse {:.6}", m.mae, m.rmse)?;
        }
        if let Some(std) = self.scalar_rotational_std {
            writeln!(f, "scalar      rotational std {std:.6}")?;
        }
        if let Some(std) = self.scalar_rotational_std_per_atom {
            writeln!(f, "scalar/atom rotational std {std:.6}")?;
        }
        if let Some(m) = &self.vector {
            writeln!(f, "vector      mae {:.6}  rmse {:.6}", m.mae, m.rmse)?;
            if let Some(rel) = m.relative_rmse {
                writeln!(f, "vector      relative rmse {rel:.6}")?;
            }
        }
        if let Some(std) = self.vector_rotational_std {
            writeln!(f, "vector      rotational std {std:.6}")?;
        }
        write!(f, "time per atom: {:.3e} s", self.seconds_per_atom)
    }
}

/// Drives a full estimation run.
pub struct ErrorEstimator {
    hypers: Hypers,
    species: SpeciesTable,
    self_contributions: Option<SelfContributionTable>,
}

impl ErrorEstimator {
    pub fn new(hypers: Hypers, species: SpeciesTable) -> Self {
        Self {
            hypers,
            species,
            self_contributions: None,
        }
    }

    /// Attach the additive per-species baseline fitted at training time.
    pub fn with_self_contributions(mut self, table: SelfContributionTable) -> Self {
        self.self_contributions = Some(table);
        self
    }

    pub fn estimate<P: Predictor + ?Sized, R: Rng + ?Sized>(
        &self,
        structures: &[AtomicStructure],
        predictor: &P,
        options: &EstimateOptions,
        rng: &mut R,
    ) -> Result<ErrorReport> {
        if structures.is_empty() {
            return Err(RotprobeError::Input("no structures to evaluate".into()));
        }
        self.hypers.validate()?;
        if !self.hypers.use_scalar_targets && !self.hypers.use_vector_targets {
            return Err(RotprobeError::Input(
                "no target kind enabled; enable scalar or vector targets".into(),
            ));
        }

        let builder = GraphBuilder::new(self.hypers.cutoff, self.species.clone())?
            .with_scalar_attributes(self.hypers.use_scalar_attributes)
            .with_vector_targets(self.hypers.use_vector_targets);
        let graphs = build_all(&builder, structures)?;
        let n_atoms: usize = graphs.iter().map(|g| g.n_atoms).sum();
        info!(
            structures = structures.len(),
            atoms = n_atoms,
            max_num = graphs[0].max_num,
            "built neighbor graphs"
        );

        let device = if self.hypers.multi_device {
            best_device()
        } else {
            cpu_device()
        };

        // Frame sets are computed per batch, so the frames path evaluates
        // one structure at a time.
        let batch_size = if options.use_frames {
            1
        } else {
            options
                .batch_size
                .unwrap_or(self.hypers.structural_batch_size)
        };
        let batches = assemble(&graphs, batch_size, &device)?;

        let mut runner = EnsembleRunner::new(self.hypers.cutoff)?;
        if options.use_frames {
            runner = runner.with_frames(FrameSampler::new(self.hypers.frame_config())?);
        }
        let augmentations = random_rotations(rng, options.n_augmentations);

        let started = Instant::now();
        let ensemble = runner.run(
            &batches,
            predictor,
            &augmentations,
            self.hypers.use_vector_targets,
        )?;
        let elapsed = started.elapsed().as_secs_f64();
        let n_runs = ensemble.n_augmentations();
        let seconds_per_atom = elapsed / (n_atoms * n_runs) as f64;

        // The scalar branch (baseline correction, targets, discrepancy) is
        // gated as a whole: a model evaluated only on vector targets skips it.
        let baseline = if self.hypers.use_scalar_targets {
            self.self_contributions
                .as_ref()
                .map(|t| t.baseline_tensor(structures, &device))
                .transpose()?
        } else {
            None
        };
        let aggregated = aggregate(&ensemble, baseline.as_ref())?;

        let atom_counts: Vec<usize> = structures.iter().map(|s| s.n_atoms()).collect();
        let scalar_rotational_std_per_atom = if self.hypers.use_scalar_targets {
            per_atom_scalar_std(&ensemble, &atom_counts)?
        } else {
            None
        };

        // Ground truth, aligned with predictions by structure order.
        let scalar_targets = if self.hypers.use_scalar_targets {
            scalar_target_tensor(structures, &device)?
        } else {
            None
        };
        let vector_targets = vector_target_tensor(structures, &device)?;

        let (scalar, scalar_per_atom) = match &scalar_targets {
            Some(targets) => {
                let per_structure =
                    TargetMetrics::compute(&aggregated.scalar_mean, targets)?;
                let counts: Vec<f32> = atom_counts.iter().map(|&c| c as f32).collect();
                let counts = Tensor::from_vec(counts, atom_counts.len(), &device)?;
                let per_atom = TargetMetrics::compute(
                    &aggregated.scalar_mean.div(&counts)?,
                    &targets.div(&counts)?,
                )?;
                (Some(per_structure), Some(per_atom))
            }
            None => (None, None),
        };

        let vector = match (&aggregated.vector_mean, &vector_targets) {
            (Some(pred), Some(targets)) => Some(TargetMetrics::compute(pred, targets)?),
            _ => None,
        };

        if let Some(dir) = &options.save_dir {
            let mut arrays: Vec<(&str, &Tensor)> = Vec::new();
            if self.hypers.use_scalar_targets {
                arrays.push(("scalar_mean", &aggregated.scalar_mean));
            }
            if let Some(v) = &aggregated.vector_mean {
                arrays.push(("vector_mean", v));
            }
            save_prediction_arrays(dir, &arrays)?;
        }

        let report = ErrorReport {
            n_structures: structures.len(),
            n_atoms,
            n_augmentations: n_runs,
            scalar,
            scalar_per_atom,
            scalar_rotational_std: if self.hypers.use_scalar_targets {
                aggregated.scalar_std
            } else {
                None
            },
            scalar_rotational_std_per_atom,
            vector,
            vector_rotational_std: aggregated.vector_std,
            seconds_per_atom,
        };
        info!(seconds_per_atom = report.seconds_per_atom, "estimation complete");
        Ok(report)
    }
}

/// Structure-level scalar ground truth, or `None` when absent. Mixed
/// presence is an input error: predictions could not be aligned.
fn scalar_target_tensor(
    structures: &[AtomicStructure],
    device: &candle_core::Device,
) -> Result<Option<Tensor>> {
    let present = structures.iter().filter(|s| s.scalar_target.is_some()).count();
    if present == 0 {
        return Ok(None);
    }
    if present != structures.len() {
        return Err(RotprobeError::Input(
            "scalar ground truth present for some structures but not all".into(),
        ));
    }
    let values: Vec<f32> = structures
        .iter()
        .map(|s| s.scalar_target.unwrap_or_default() as f32)
        .collect();
    Ok(Some(Tensor::from_vec(values, structures.len(), device)?))
}

/// Per-atom vector ground truth concatenated over structures, `[N, 3]`.
fn vector_target_tensor(
    structures: &[AtomicStructure],
    device: &candle_core::Device,
) -> Result<Option<Tensor>> {
    let present = structures.iter().filter(|s| s.vector_target.is_some()).count();
    if present == 0 {
        return Ok(None);
    }
    if present != structures.len() {
        return Err(RotprobeError::Input(
            "vector ground truth present for some structures but not all".into(),
        ));
    }
    let mut values = Vec::new();
    let mut n = 0;
    for s in structures {
        if let Some(rows) = &s.vector_target {
            for row in rows {
                values.extend(row.iter().map(|&v| v as f32));
            }
            n += rows.len();
        }
    }
    Ok(Some(Tensor::from_vec(values, (n, 3), device)?))
}
