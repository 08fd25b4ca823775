//! Local reference frames for atomic environments
//!
//! Computes weighted sets of orthonormal frames from the neighbor
//! displacement vectors of an atomic environment. Predictions averaged over
//! these frames become approximately invariant to global rotation; the
//! ensemble runner composes them with augmentation rotations to probe the
//! residual sensitivity.
//!
//! Every ordered pair of non-collinear neighbor vectors defines a candidate
//! frame by Gram-Schmidt. Candidate weights combine a smooth radial cutoff
//! factor for both vectors with a collinearity factor (sin of the pair
//! angle), so the frame set varies continuously with geometry. Continuity
//! matters because the frames and weights are themselves functions of the
//! displacements and must be part of the differentiated graph during force
//! extraction. The discrete choices (which pairs anchor a frame, which
//! candidates survive pruning) are made once on host data as a
//! [`FramePlan`]; the rotations and weights are then re-evaluated as tensor
//! operations on the displacement tensor, so reverse-mode gradients carry
//! the frame sensitivity.
//!
//! Environments with fewer than two usable neighbors (or zero total weight)
//! fall back to a single identity frame of weight 1.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::rotations::{self, Rotation};
use crate::{Result, RotprobeError};

/// Vectors shorter than this cannot anchor a frame axis.
const MIN_AXIS_NORM: f64 = 1e-8;

/// One frame: an orthonormal rotation whose columns are the local axes,
/// plus a non-negative weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub rotation: Rotation,
    pub weight: f64,
}

impl Frame {
    pub fn identity(weight: f64) -> Self {
        Self {
            rotation: rotations::identity_rotation(),
            weight,
        }
    }
}

/// Smoothing parameters for frame weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameConfig {
    /// Width of the cosine switching region below the cutoff. Neighbor
    /// vectors shorter than `cutoff - smoothing_width` get full radial
    /// weight; the weight decays smoothly to zero at the cutoff.
    pub smoothing_width: f64,
    /// Candidates below this fraction of the best candidate weight are
    /// discarded.
    pub floor_fraction: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            smoothing_width: 0.5,
            floor_fraction: 0.2,
        }
    }
}

/// One anchored candidate frame: an ordered neighbor-slot pair of one atom,
/// with its host-evaluated rotation and final weight. Pruned candidates stay
/// in the plan because the weight normalization sums over every candidate of
/// an environment.
#[derive(Debug, Clone)]
struct Candidate {
    atom: usize,
    slot_a: usize,
    slot_b: usize,
    rotation: Rotation,
    /// Final normalized weight for kept candidates, the pre-prune
    /// per-environment share otherwise.
    weight: f64,
    kept: bool,
}

/// Frame selection for one batch, fixed on host data.
///
/// The plan records which slot pairs anchor frames and which candidates
/// survive pruning; both choices are piecewise constant in the geometry.
/// [`FramePlan::evaluate`] recomputes the rotations and weights from a
/// displacement tensor so they live on its differentiation graph.
#[derive(Debug, Clone)]
pub struct FramePlan {
    config: FrameConfig,
    cutoff: f64,
    candidates: Vec<Candidate>,
}

impl FramePlan {
    /// No candidate survived; the batch uses a single identity frame.
    pub fn is_degenerate(&self) -> bool {
        !self.candidates.iter().any(|c| c.kept)
    }

    /// Host-evaluated frames, weights summing to 1. Degenerate plans yield
    /// the identity fallback.
    pub fn frames(&self) -> Vec<Frame> {
        let kept: Vec<Frame> = self
            .candidates
            .iter()
            .filter(|c| c.kept)
            .map(|c| Frame {
                rotation: c.rotation,
                weight: c.weight,
            })
            .collect();
        if kept.is_empty() {
            vec![Frame::identity(1.0)]
        } else {
            kept
        }
    }

    /// Re-evaluate the kept frames from a displacement tensor `[N, K, 3]`.
    ///
    /// Returns `(rotation [3, 3], weight [1])` pairs built entirely from
    /// tensor operations on `x`, so differentiating a frame-averaged
    /// prediction with respect to `x` includes the dependence of the frames
    /// and weights on the geometry.
    pub fn evaluate(&self, x: &Tensor) -> Result<Vec<(Tensor, Tensor)>> {
        if self.is_degenerate() {
            return Err(RotprobeError::Contract(
                "cannot evaluate a degenerate frame plan".into(),
            ));
        }

        let mut env_totals: HashMap<usize, Tensor> = HashMap::new();
        let mut kept: Vec<(usize, Tensor, Tensor)> = Vec::new();

        for cand in &self.candidates {
            let va = slot_vector(x, cand.atom, cand.slot_a)?;
            let vb = slot_vector(x, cand.atom, cand.slot_b)?;
            let ra = vector_norm(&va)?;
            let rb = vector_norm(&vb)?;
            let wa = self.radial_weight_tensor(&ra)?;
            let wb = self.radial_weight_tensor(&rb)?;

            let e1 = va.broadcast_div(&ra)?;
            let proj = vb.mul(&e1)?.sum_keepdim(0)?;
            let u = vb.sub(&e1.broadcast_mul(&proj)?)?;
            let ru = vector_norm(&u)?;
            let sin_ab = ru.div(&rb)?;
            let raw = wa.mul(&wb)?.mul(&sin_ab)?;

            let total = match env_totals.remove(&cand.atom) {
                Some(t) => t.add(&raw)?,
                None => raw.clone(),
            };
            env_totals.insert(cand.atom, total);

            if cand.kept {
                let e2 = u.broadcast_div(&ru)?;
                let e3 = cross_tensor(&e1, &e2)?;
                let rotation = Tensor::stack(&[e1, e2, e3], 1)?;
                kept.push((cand.atom, rotation, raw));
            }
        }

        // Per-environment share, then renormalize over the survivors.
        let mut shares = Vec::with_capacity(kept.len());
        for (atom, rotation, raw) in kept {
            let share = raw.div(&env_totals[&atom])?;
            shares.push((rotation, share));
        }
        let mut total: Option<Tensor> = None;
        for (_, share) in &shares {
            total = Some(match total {
                Some(t) => t.add(share)?,
                None => share.clone(),
            });
        }
        let total = total.ok_or_else(|| {
            RotprobeError::Contract("frame plan lost all candidates".into())
        })?;

        shares
            .into_iter()
            .map(|(rotation, share)| Ok((rotation, share.div(&total)?)))
            .collect()
    }

    /// Tensor version of [`FrameSampler::radial_weight`], identical values.
    fn radial_weight_tensor(&self, r: &Tensor) -> Result<Tensor> {
        let width = self.config.smoothing_width;
        let inner = self.cutoff - width;
        let t = r.affine(1.0 / width, -inner / width)?.clamp(0.0, 1.0)?;
        Ok(t.affine(std::f64::consts::PI, 0.0)?.cos()?.affine(0.5, 0.5)?)
    }
}

/// Computes weighted frame sets from neighbor displacement vectors.
#[derive(Debug, Clone, Default)]
pub struct FrameSampler {
    config: FrameConfig,
}

impl FrameSampler {
    pub fn new(config: FrameConfig) -> Result<Self> {
        if !(config.smoothing_width > 0.0) {
            return Err(RotprobeError::Config(
                "frame smoothing width must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&config.floor_fraction) {
            return Err(RotprobeError::Config(
                "frame floor fraction must lie in [0, 1]".into(),
            ));
        }
        Ok(Self { config })
    }

    /// Smooth radial weight of one neighbor vector: 1 well inside the
    /// cutoff, cosine decay over the smoothing width, 0 at and beyond the
    /// cutoff.
    fn radial_weight(&self, r: f64, cutoff: f64) -> f64 {
        let inner = cutoff - self.config.smoothing_width;
        if r <= inner {
            1.0
        } else if r >= cutoff {
            0.0
        } else {
            0.5 * (1.0 + (std::f64::consts::PI * (r - inner) / self.config.smoothing_width).cos())
        }
    }

    /// Weighted frames for one atomic environment, given its (unmasked)
    /// neighbor displacement vectors. Weights sum to 1.
    pub fn frames_for_environment(
        &self,
        displacements: &[[f64; 3]],
        cutoff: f64,
    ) -> Vec<Frame> {
        let env: Vec<(usize, [f64; 3])> =
            displacements.iter().copied().enumerate().collect();
        self.plan_for_batch(&[env], cutoff).frames()
    }

    /// Weighted frames for a whole batch: per-environment candidate shares
    /// are merged, pruned against the global best, and normalized.
    /// Degenerate batches fall back to the identity frame.
    pub fn frames_for_batch(
        &self,
        environments: &[Vec<[f64; 3]>],
        cutoff: f64,
    ) -> Vec<Frame> {
        let with_slots: Vec<Vec<(usize, [f64; 3])>> = environments
            .iter()
            .map(|env| env.iter().copied().enumerate().collect())
            .collect();
        self.plan_for_batch(&with_slots, cutoff).frames()
    }

    /// Fix the frame selection for a batch. Environments are per-atom lists
    /// of `(slot, displacement)` pairs; the slot indices address the
    /// displacement tensor handed to [`FramePlan::evaluate`] later.
    pub fn plan_for_batch(
        &self,
        environments: &[Vec<(usize, [f64; 3])>],
        cutoff: f64,
    ) -> FramePlan {
        let mut candidates = Vec::new();
        for (atom, env) in environments.iter().enumerate() {
            let mut usable = Vec::with_capacity(env.len());
            for &(slot, v) in env {
                let r = norm(v);
                if r < MIN_AXIS_NORM || r >= cutoff {
                    continue;
                }
                usable.push((slot, v, self.radial_weight(r, cutoff)));
            }

            let mut env_candidates = Vec::new();
            for (i, &(slot_a, va, wa)) in usable.iter().enumerate() {
                for (j, &(slot_b, vb, wb)) in usable.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    let Some((rotation, sin_ab)) = gram_schmidt_frame(va, vb) else {
                        continue;
                    };
                    let weight = wa * wb * sin_ab;
                    if weight > 0.0 {
                        env_candidates.push(Candidate {
                            atom,
                            slot_a,
                            slot_b,
                            rotation,
                            weight,
                            kept: true,
                        });
                    }
                }
            }

            let total: f64 = env_candidates.iter().map(|c| c.weight).sum();
            if total > 0.0 {
                for c in &mut env_candidates {
                    c.weight /= total;
                }
                candidates.extend(env_candidates);
            }
        }

        if !candidates.is_empty() {
            let best = candidates
                .iter()
                .map(|c| c.weight)
                .fold(f64::NEG_INFINITY, f64::max);
            let floor = self.config.floor_fraction * best;
            for c in &mut candidates {
                c.kept = c.weight >= floor;
            }
            let total_kept: f64 = candidates
                .iter()
                .filter(|c| c.kept)
                .map(|c| c.weight)
                .sum();
            for c in &mut candidates {
                if c.kept {
                    c.weight /= total_kept;
                }
            }
        }

        FramePlan {
            config: self.config,
            cutoff,
            candidates,
        }
    }
}

/// Slot `(atom, k)` of a `[N, K, 3]` tensor as a `[3]` vector, still on the
/// differentiation graph.
fn slot_vector(x: &Tensor, atom: usize, slot: usize) -> Result<Tensor> {
    Ok(x.narrow(0, atom, 1)?.narrow(1, slot, 1)?.flatten_all()?)
}

/// Euclidean norm of a `[3]` vector as a `[1]` tensor.
fn vector_norm(v: &Tensor) -> Result<Tensor> {
    Ok(v.sqr()?.sum_keepdim(0)?.sqrt()?)
}

/// Cross product of two `[3]` vectors.
fn cross_tensor(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (a0, a1, a2) = (a.narrow(0, 0, 1)?, a.narrow(0, 1, 1)?, a.narrow(0, 2, 1)?);
    let (b0, b1, b2) = (b.narrow(0, 0, 1)?, b.narrow(0, 1, 1)?, b.narrow(0, 2, 1)?);
    let c0 = a1.mul(&b2)?.sub(&a2.mul(&b1)?)?;
    let c1 = a2.mul(&b0)?.sub(&a0.mul(&b2)?)?;
    let c2 = a0.mul(&b1)?.sub(&a1.mul(&b0)?)?;
    Ok(Tensor::cat(&[c0, c1, c2], 0)?)
}

/// Orthonormal frame from an ordered vector pair: first axis along `a`,
/// second the orthogonalized part of `b`, third their cross product. Returns
/// the rotation (columns = axes) and the pair's sin-angle, or `None` for
/// degenerate pairs.
fn gram_schmidt_frame(a: [f64; 3], b: [f64; 3]) -> Option<(Rotation, f64)> {
    let ra = norm(a);
    let rb = norm(b);
    if ra < MIN_AXIS_NORM || rb < MIN_AXIS_NORM {
        return None;
    }
    let e1 = [a[0] / ra, a[1] / ra, a[2] / ra];
    let proj = dot(b, e1);
    let u = [b[0] - proj * e1[0], b[1] - proj * e1[1], b[2] - proj * e1[2]];
    let ru = norm(u);
    if ru < MIN_AXIS_NORM {
        return None; // collinear
    }
    let e2 = [u[0] / ru, u[1] / ru, u[2] / ru];
    let e3 = cross(e1, e2);

    let rotation = [
        [e1[0], e2[0], e3[0]],
        [e1[1], e2[1], e3[1]],
        [e1[2], e2[2], e3[2]],
    ];
    let sin_ab = ru / rb;
    Some((rotation, sin_ab))
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu_device;
    use crate::rotations::{apply, compose, random_rotation, transpose};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sampler() -> FrameSampler {
        FrameSampler::new(FrameConfig::default()).unwrap()
    }

    fn assert_orthonormal(m: &Rotation) {
        let prod = compose(m, &transpose(m));
        for r in 0..3 {
            for c in 0..3 {
                let expect = if r == c { 1.0 } else { 0.0 };
                assert!((prod[r][c] - expect).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(FrameSampler::new(FrameConfig {
            smoothing_width: 0.0,
            floor_fraction: 0.2
        })
        .is_err());
        assert!(FrameSampler::new(FrameConfig {
            smoothing_width: 0.5,
            floor_fraction: 1.5
        })
        .is_err());
    }

    #[test]
    fn test_isolated_environment_falls_back_to_identity() {
        let frames = sampler().frames_for_environment(&[], 4.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].rotation, rotations::identity_rotation());
        assert!((frames[0].weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_neighbor_falls_back_to_identity() {
        let frames = sampler().frames_for_environment(&[[1.0, 0.0, 0.0]], 4.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].rotation, rotations::identity_rotation());
    }

    #[test]
    fn test_collinear_neighbors_fall_back_to_identity() {
        let frames = sampler()
            .frames_for_environment(&[[1.0, 0.0, 0.0], [-1.5, 0.0, 0.0]], 4.0);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].rotation, rotations::identity_rotation());
    }

    #[test]
    fn test_frames_are_orthonormal_and_normalized() {
        let env = [[1.0, 0.2, 0.0], [0.1, 1.1, 0.3], [-0.4, 0.2, 0.9]];
        let frames = sampler().frames_for_environment(&env, 4.0);
        assert!(!frames.is_empty());
        let total: f64 = frames.iter().map(|f| f.weight).sum();
        assert!((total - 1.0).abs() < 1e-10);
        for frame in &frames {
            assert_orthonormal(&frame.rotation);
            assert!(frame.weight > 0.0);
        }
    }

    #[test]
    fn test_frame_axes_follow_the_pair() {
        // Two orthogonal unit vectors: the first frame axis must be e_x and
        // the second e_y for the (x, y) ordered pair.
        let (rotation, sin_ab) =
            gram_schmidt_frame([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]).unwrap();
        assert!((sin_ab - 1.0).abs() < 1e-12);
        let e1 = [rotation[0][0], rotation[1][0], rotation[2][0]];
        let e2 = [rotation[0][1], rotation[1][1], rotation[2][1]];
        let e3 = [rotation[0][2], rotation[1][2], rotation[2][2]];
        assert_eq!(e1, [1.0, 0.0, 0.0]);
        assert_eq!(e2, [0.0, 1.0, 0.0]);
        assert_eq!(e3, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_radial_weight_is_smooth_switch() {
        let s = sampler();
        assert!((s.radial_weight(1.0, 4.0) - 1.0).abs() < 1e-12);
        assert!((s.radial_weight(3.5, 4.0) - 1.0).abs() < 1e-12);
        assert!((s.radial_weight(3.75, 4.0) - 0.5).abs() < 1e-12);
        assert!(s.radial_weight(4.0, 4.0).abs() < 1e-12);
        assert!(s.radial_weight(5.0, 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_equivariance_under_global_rotation() {
        // Rotating every neighbor vector by Q rotates every frame by Q.
        let env = [[1.0, 0.2, 0.0], [0.1, 1.1, 0.3], [-0.4, 0.2, 0.9]];
        let q = random_rotation(&mut StdRng::seed_from_u64(11));
        let rotated: Vec<[f64; 3]> = env.iter().map(|&v| apply(&q, v)).collect();

        let frames = sampler().frames_for_environment(&env, 4.0);
        let frames_rot = sampler().frames_for_environment(&rotated, 4.0);
        assert_eq!(frames.len(), frames_rot.len());

        for (f, fr) in frames.iter().zip(frames_rot.iter()) {
            let expected = compose(&q, &f.rotation);
            for r in 0..3 {
                for c in 0..3 {
                    assert!((expected[r][c] - fr.rotation[r][c]).abs() < 1e-9);
                }
            }
            assert!((f.weight - fr.weight).abs() < 1e-9);
        }
    }

    #[test]
    fn test_batch_frames_merge_environments() {
        let env_a = vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let env_b: Vec<[f64; 3]> = vec![]; // degenerate, contributes nothing
        let frames = sampler().frames_for_batch(&[env_a, env_b], 4.0);
        assert!(!frames.is_empty());
        let total: f64 = frames.iter().map(|f| f.weight).sum();
        assert!((total - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_plan_evaluation_matches_host_frames() {
        // The tensor re-evaluation must reproduce the host-computed
        // rotations and weights up to f32 precision.
        let envs = vec![
            vec![(0usize, [1.0, 0.2, 0.0]), (1, [0.1, 1.1, 0.3])],
            vec![(0, [-0.4, 0.2, 0.9]), (1, [0.8, -0.5, 0.1])],
        ];
        let plan = sampler().plan_for_batch(&envs, 4.0);
        let host = plan.frames();

        let device = cpu_device();
        let mut flat = vec![0.0f32; 2 * 2 * 3];
        for (atom, env) in envs.iter().enumerate() {
            for &(slot, v) in env {
                for c in 0..3 {
                    flat[(atom * 2 + slot) * 3 + c] = v[c] as f32;
                }
            }
        }
        let x = Tensor::from_vec(flat, (2, 2, 3), &device).unwrap();
        let evaluated = plan.evaluate(&x).unwrap();
        assert_eq!(evaluated.len(), host.len());

        for (frame, (rotation, weight)) in host.iter().zip(evaluated.iter()) {
            let w: Vec<f32> = weight.to_vec1().unwrap();
            assert!((w[0] as f64 - frame.weight).abs() < 1e-5);
            let m: Vec<Vec<f32>> = rotation.to_vec2().unwrap();
            for r in 0..3 {
                for c in 0..3 {
                    assert!((m[r][c] as f64 - frame.rotation[r][c]).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_degenerate_plan_refuses_evaluation() {
        let plan = sampler().plan_for_batch(&[vec![(0usize, [1.0, 0.0, 0.0])]], 4.0);
        assert!(plan.is_degenerate());
        let x = Tensor::zeros((1, 1, 3), candle_core::DType::F32, &cpu_device()).unwrap();
        assert!(matches!(
            plan.evaluate(&x),
            Err(RotprobeError::Contract(_))
        ));
    }
}
