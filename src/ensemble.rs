//! Rotational-augmentation ensemble inference
//!
//! Runs a trained predictor repeatedly over the same batches under a set of
//! augmentation rotations and collects the per-augmentation predictions. The
//! spread of the ensemble is a direct probe of how far the model is from
//! exact rotational equivariance.
//!
//! For each augmentation `R` the displacement tensor is rotated into every
//! sampled local frame `F`, composed as `R * F` and applied to row vectors
//! (`x @ (R * F)`); the predictor's per-structure scalars are averaged with
//! the frame weights. Per-atom vector predictions are recovered by
//! reverse-mode differentiation: the scalar total is differentiated with
//! respect to the *un-rotated* displacement tensor, and the per-slot gradient
//! is folded back onto atoms through the `neighbors_index`/`neighbors_pos`
//! back-references. On the frames path the frame rotations and weights are
//! re-evaluated from the same autodiff root (see
//! [`FramePlan::evaluate`](crate::frames::FramePlan::evaluate)), so the
//! gradient includes their dependence on the geometry. Each augmentation
//! uses a fresh root so no gradient state leaks between ensemble members.

use candle_core::{Tensor, Var};
use tracing::{debug, info};

use crate::batch::Batch;
use crate::frames::{FramePlan, FrameSampler};
use crate::rotations::{self, Rotation};
use crate::{Result, RotprobeError};

/// Target kinds a predictor can serve.
///
/// `gradients` means the scalar output is differentiable with respect to the
/// displacement tensor handed to [`Predictor::forward`], so per-atom vector
/// predictions can be extracted from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub scalars: bool,
    pub gradients: bool,
}

impl Capabilities {
    pub fn scalar_only() -> Self {
        Self {
            scalars: true,
            gradients: false,
        }
    }

    pub fn with_gradients() -> Self {
        Self {
            scalars: true,
            gradients: true,
        }
    }
}

/// A trained model, consumed as an opaque forward pass.
///
/// `forward` receives the batch (species, mask, routing indices) together
/// with a displacement tensor of shape `[N, K, 3]` and returns per-structure
/// scalars of shape `[n_structures]`. The displacement tensor is passed
/// separately from the batch because the runner substitutes rotated and
/// autodiff-rooted variants of it; implementations must build their output
/// from the supplied tensor, not from `batch.displacements`, or gradient
/// extraction sees a constant.
pub trait Predictor {
    fn capabilities(&self) -> Capabilities;

    fn forward(&self, batch: &Batch, displacements: &Tensor) -> Result<Tensor>;
}

/// Ordered per-augmentation predictions.
///
/// `scalars[a]` has shape `[total_structures]`; `vectors[a]` (when gradient
/// extraction was requested) has shape `[total_atoms, 3]`. Entries are
/// ordered like the augmentation list, and structures/atoms are ordered like
/// the input batches.
#[derive(Debug, Clone)]
pub struct PredictionEnsemble {
    pub scalars: Vec<Tensor>,
    pub vectors: Option<Vec<Tensor>>,
}

impl PredictionEnsemble {
    pub fn n_augmentations(&self) -> usize {
        self.scalars.len()
    }
}

/// Drives ensemble inference over batches.
#[derive(Debug, Clone)]
pub struct EnsembleRunner {
    cutoff: f64,
    sampler: Option<FrameSampler>,
}

impl EnsembleRunner {
    pub fn new(cutoff: f64) -> Result<Self> {
        if !(cutoff > 0.0) {
            return Err(RotprobeError::Config(format!(
                "cutoff must be positive, got {cutoff}"
            )));
        }
        Ok(Self {
            cutoff,
            sampler: None,
        })
    }

    /// Enable local-frame sampling. Without a sampler every batch uses a
    /// single identity frame.
    pub fn with_frames(mut self, sampler: FrameSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Run the predictor once per augmentation rotation over all batches.
    ///
    /// An empty augmentation list means plain inference and is treated as
    /// `{identity}`. With `want_gradients` the ensemble also carries per-atom
    /// vector predictions; the predictor must advertise the `gradients`
    /// capability. Any NaN or Inf in a prediction or gradient aborts the run.
    pub fn run<P: Predictor + ?Sized>(
        &self,
        batches: &[Batch],
        predictor: &P,
        augmentations: &[Rotation],
        want_gradients: bool,
    ) -> Result<PredictionEnsemble> {
        if batches.is_empty() {
            return Err(RotprobeError::Input("no batches to run".into()));
        }
        let caps = predictor.capabilities();
        if !caps.scalars {
            return Err(RotprobeError::Input(
                "predictor does not produce scalar targets".into(),
            ));
        }
        if want_gradients && !caps.gradients {
            return Err(RotprobeError::Input(
                "vector targets requested but the predictor is not differentiable".into(),
            ));
        }

        let identity = [rotations::identity_rotation()];
        let augs: &[Rotation] = if augmentations.is_empty() {
            &identity
        } else {
            augmentations
        };

        // Frame selection is piecewise constant in the geometry, so it is
        // fixed once per batch; the rotations and weights themselves are
        // re-evaluated per pass on the differentiation root.
        let plans: Vec<Option<FramePlan>> = match &self.sampler {
            Some(sampler) => batches
                .iter()
                .map(|b| {
                    Ok(Some(
                        sampler.plan_for_batch(&batch_environments(b)?, self.cutoff),
                    ))
                })
                .collect::<Result<_>>()?,
            None => batches.iter().map(|_| None).collect(),
        };

        info!(
            augmentations = augs.len(),
            batches = batches.len(),
            frames = self.sampler.is_some(),
            gradients = want_gradients,
            "running ensemble inference"
        );

        let mut scalars = Vec::with_capacity(augs.len());
        let mut vectors = want_gradients.then(|| Vec::with_capacity(augs.len()));

        for (a_idx, aug) in augs.iter().enumerate() {
            let mut scalar_parts = Vec::with_capacity(batches.len());
            let mut vector_parts = Vec::with_capacity(batches.len());

            for (batch, plan) in batches.iter().zip(plans.iter()) {
                let (pred, grad) =
                    self.run_one(batch, plan.as_ref(), aug, predictor, want_gradients)?;
                scalar_parts.push(pred);
                if let Some(g) = grad {
                    vector_parts.push(g);
                }
            }

            scalars.push(Tensor::cat(&scalar_parts, 0)?);
            if let Some(v) = vectors.as_mut() {
                v.push(Tensor::cat(&vector_parts, 0)?);
            }
            debug!(augmentation = a_idx, "augmentation complete");
        }

        Ok(PredictionEnsemble { scalars, vectors })
    }

    /// One (augmentation, batch) pass: frame-weighted scalar prediction plus,
    /// on request, the per-atom gradient folded through the back-references.
    fn run_one<P: Predictor + ?Sized>(
        &self,
        batch: &Batch,
        plan: Option<&FramePlan>,
        aug: &Rotation,
        predictor: &P,
        want_gradients: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (n, k, _) = batch.displacements.dims3()?;

        // Fresh autodiff root over the un-rotated displacements; gradient
        // extraction differentiates through both the rotations applied below
        // and the frame evaluation.
        let root = want_gradients
            .then(|| Var::from_tensor(&batch.displacements))
            .transpose()?;
        let x = match &root {
            Some(var) => var.as_tensor().clone(),
            None => batch.displacements.clone(),
        };
        let aug_t = rotations::to_tensor(aug, batch.device())?;

        let prediction = match plan {
            Some(plan) if !plan.is_degenerate() => {
                let mut weighted: Option<Tensor> = None;
                for (frame, weight) in plan.evaluate(&x)? {
                    let composed = aug_t.matmul(&frame)?;
                    let rotated =
                        x.reshape((n * k, 3))?.matmul(&composed)?.reshape((n, k, 3))?;
                    let pred = predictor.forward(batch, &rotated)?;
                    check_prediction_shape(batch, &pred)?;
                    let term = pred.broadcast_mul(&weight)?;
                    weighted = Some(match weighted {
                        Some(acc) => acc.add(&term)?,
                        None => term,
                    });
                }
                weighted.ok_or_else(|| {
                    RotprobeError::Contract("empty frame set for a batch".into())
                })?
            }
            _ => {
                let rotated = x.reshape((n * k, 3))?.matmul(&aug_t)?.reshape((n, k, 3))?;
                let pred = predictor.forward(batch, &rotated)?;
                check_prediction_shape(batch, &pred)?;
                pred
            }
        };
        ensure_finite(&prediction, "scalar prediction")?;

        let Some(root) = root else {
            return Ok((prediction, None));
        };

        let grads = prediction.sum_all()?.backward()?;
        let slot_grad = grads.get(&root).ok_or_else(|| {
            RotprobeError::Contract(
                "prediction does not depend on the displacement tensor".into(),
            )
        })?;

        // Fold per-slot gradients onto atoms. The direct part is the slot's
        // own gradient; the messaged part is the gradient of the mirrored
        // slot, fetched through the back-references. Padded slots are zeroed
        // on both tensors before summation so padding cannot leak in.
        let mask = batch.slot_mask.unsqueeze(2)?;
        let direct = slot_grad.broadcast_mul(&mask)?;
        let messaged = slot_grad
            .reshape((n * k, 3))?
            .index_select(&batch.gather_index, 0)?
            .reshape((n, k, 3))?
            .broadcast_mul(&mask)?;
        let per_atom = direct.sum(1)?.sub(&messaged.sum(1)?)?;
        ensure_finite(&per_atom, "vector prediction")?;

        Ok((prediction, Some(per_atom)))
    }
}

fn check_prediction_shape(batch: &Batch, pred: &Tensor) -> Result<()> {
    if pred.dims() != [batch.n_structures] {
        return Err(RotprobeError::Contract(format!(
            "predictor returned shape {:?}, expected [{}]",
            pred.dims(),
            batch.n_structures
        )));
    }
    Ok(())
}

/// Real neighbor vectors per atom, as `(slot, displacement)` pairs addressing
/// the batch's displacement tensor.
fn batch_environments(batch: &Batch) -> Result<Vec<Vec<(usize, [f64; 3])>>> {
    let disp = batch.displacements.to_vec3::<f32>()?;
    let mask = batch.slot_mask.to_vec2::<f32>()?;
    let mut environments = Vec::with_capacity(batch.n_atoms);
    for (atom, slots) in disp.iter().enumerate() {
        let mut env = Vec::new();
        for (slot, v) in slots.iter().enumerate() {
            if mask[atom][slot] > 0.5 {
                env.push((slot, [v[0] as f64, v[1] as f64, v[2] as f64]));
            }
        }
        environments.push(env);
    }
    Ok(environments)
}

fn ensure_finite(t: &Tensor, what: &str) -> Result<()> {
    let values: Vec<f32> = t.flatten_all()?.to_vec1()?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(RotprobeError::Numerical(format!(
            "{what} contains a non-finite value"
        )));
    }
    Ok(())
}
