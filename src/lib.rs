//! # rotprobe
//!
//! Accuracy and rotational-robustness estimation for learned atomistic
//! potentials: differentiable inference over padded neighbor graphs with
//! rotational-augmentation ensembles.
//!
//! ## Overview
//!
//! Given a set of atomic structures, a trained potential (consumed as an
//! opaque [`Predictor`](ensemble::Predictor)), and a number of rotational
//! augmentations, this crate predicts per-structure scalar targets (e.g.
//! energies) and per-atom vector targets (e.g. forces), compares them against
//! ground truth, and reports error and uncertainty statistics.
//!
//! Pipeline stages:
//!
//! - **Graph construction**: structures → fixed-capacity, padded neighbor
//!   graphs with message-routing back-references ([`graph`])
//! - **Batching**: graphs stacked into batch tensors sharing one neighbor
//!   capacity ([`batch`])
//! - **Frame sampling**: weighted local reference frames per atomic
//!   environment for approximate rotational invariance ([`frames`])
//! - **Ensemble inference**: repeated forward passes under augmentation
//!   rotations, with per-atom gradients recovered by reverse-mode
//!   differentiation through the neighbor-graph topology ([`ensemble`])
//! - **Aggregation**: ensemble mean plus bias-corrected rotational
//!   discrepancy ([`aggregate`])
//! - **Metrics**: MAE / RMSE / relative RMSE ([`metrics`])
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rotprobe::prelude::*;
//! use rand::SeedableRng;
//!
//! let hypers = Hypers::from_file("hypers_used.yaml")?;
//! let structures = my_source.read("test.xyz", None)?;
//! let mut rng = rand::rngs::StdRng::seed_from_u64(hypers.random_seed);
//!
//! let report = ErrorEstimator::new(hypers, species)
//!     .with_self_contributions(self_contributions)
//!     .estimate(&structures, &predictor, &EstimateOptions::default(), &mut rng)?;
//! println!("{report}");
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod aggregate;
pub mod artifacts;
pub mod batch;
pub mod device;
pub mod ensemble;
pub mod estimator;
pub mod frames;
pub mod graph;
pub mod hypers;
pub mod metrics;
pub mod rotations;
pub mod structure;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for the estimation pipeline
#[derive(Debug, thiserror::Error)]
pub enum RotprobeError {
    /// Malformed input: empty structures, bad cutoffs, unknown species,
    /// unsupported target combinations. Fail fast, no retry.
    #[error("invalid input: {0}")]
    Input(String),

    /// NaN/Inf in a prediction or gradient. The affected run aborts rather
    /// than silently dropping the augmentation, which would bias the mean.
    #[error("numerical failure: {0}")]
    Numerical(String),

    /// Shape or index-contract violations (mismatched neighbor capacities,
    /// missing back-references). Programming errors, not recoverable.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for the estimation pipeline
pub type Result<T> = std::result::Result<T, RotprobeError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{Result, RotprobeError};

    pub use crate::structure::{AtomicStructure, Cell, SpeciesTable, StructureSource};

    pub use crate::graph::{GraphBuilder, NeighborGraph, build_all};

    pub use crate::batch::{Batch, assemble};

    pub use crate::frames::{Frame, FrameConfig, FramePlan, FrameSampler};

    pub use crate::rotations::{identity_rotation, random_rotation, random_rotations};

    pub use crate::ensemble::{Capabilities, EnsembleRunner, PredictionEnsemble, Predictor};

    pub use crate::aggregate::{AggregatedResult, aggregate, per_atom_scalar_std};

    pub use crate::artifacts::{SelfContributionTable, load_checkpoint, save_prediction_arrays};

    pub use crate::metrics::{mae, relative_rmse, rmse};

    pub use crate::hypers::Hypers;

    pub use crate::estimator::{ErrorEstimator, ErrorReport, EstimateOptions};

    pub use crate::device::{best_device, cpu_device};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let device = cpu_device();
        assert!(matches!(device, Device::Cpu));
    }
}
