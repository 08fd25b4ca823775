//! Ensemble aggregation
//!
//! Collapses a [`PredictionEnsemble`](crate::ensemble::PredictionEnsemble)
//! into final predictions: the arithmetic mean over the augmentation axis,
//! plus a pooled rotational-discrepancy estimate. The discrepancy uses the
//! bias-corrected form `sqrt(mean(disc^2) * n / (n - 1))`, since the
//! ensemble mean itself was fitted from the same `n` augmentations.
//!
//! Additive self-contribution baselines (per-species coefficients dotted
//! with per-species atom counts) enter the scalar mean only. They are exactly
//! rotation invariant, so folding them into the discrepancy would dilute it.

use candle_core::Tensor;

use crate::ensemble::PredictionEnsemble;
use crate::{Result, RotprobeError};

/// Aggregated ensemble output.
///
/// `scalar_mean` has shape `[total_structures]`; `vector_mean`, when vector
/// predictions were produced, has shape `[total_atoms, 3]`. The std fields
/// are pooled scalars and present only for ensembles with more than one
/// augmentation.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    pub scalar_mean: Tensor,
    pub scalar_std: Option<f64>,
    pub vector_mean: Option<Tensor>,
    pub vector_std: Option<f64>,
}

/// Mean and pooled bias-corrected std over the augmentation axis.
///
/// `self_contributions`, when given, is a per-structure baseline tensor of
/// shape `[total_structures]` added to the scalar mean.
pub fn aggregate(
    ensemble: &PredictionEnsemble,
    self_contributions: Option<&Tensor>,
) -> Result<AggregatedResult> {
    let n = ensemble.n_augmentations();
    if n == 0 {
        return Err(RotprobeError::Input("empty prediction ensemble".into()));
    }

    let (mut scalar_mean, scalar_std) = mean_and_std(&ensemble.scalars)?;
    if let Some(baseline) = self_contributions {
        if baseline.dims() != scalar_mean.dims() {
            return Err(RotprobeError::Contract(format!(
                "self-contribution shape {:?} does not match predictions {:?}",
                baseline.dims(),
                scalar_mean.dims()
            )));
        }
        scalar_mean = scalar_mean.add(baseline)?;
    }

    let (vector_mean, vector_std) = match &ensemble.vectors {
        Some(members) => {
            let (mean, std) = mean_and_std(members)?;
            (Some(mean), std)
        }
        None => (None, None),
    };

    Ok(AggregatedResult {
        scalar_mean,
        scalar_std,
        vector_mean,
        vector_std,
    })
}

/// Pooled scalar discrepancy with per-structure atom-count normalization:
/// each structure's discrepancy is divided by its atom count before pooling,
/// giving a per-atom-scale uncertainty for extensive targets.
pub fn per_atom_scalar_std(
    ensemble: &PredictionEnsemble,
    atoms_per_structure: &[usize],
) -> Result<Option<f64>> {
    let n = ensemble.n_augmentations();
    if n < 2 {
        return Ok(None);
    }
    let stacked = Tensor::stack(&ensemble.scalars, 0)?;
    if stacked.dims()[1] != atoms_per_structure.len() {
        return Err(RotprobeError::Contract(format!(
            "{} structures in the ensemble but {} atom counts",
            stacked.dims()[1],
            atoms_per_structure.len()
        )));
    }
    let counts: Vec<f32> = atoms_per_structure.iter().map(|&c| c as f32).collect();
    let counts = Tensor::from_vec(counts, atoms_per_structure.len(), stacked.device())?;

    let mean = stacked.mean(0)?;
    let disc = stacked.broadcast_sub(&mean)?.broadcast_div(&counts)?;
    Ok(Some(pooled_std(&disc, n)?))
}

/// Mean over the augmentation axis plus, for n > 1, the pooled std.
fn mean_and_std(members: &[Tensor]) -> Result<(Tensor, Option<f64>)> {
    if members.is_empty() {
        return Err(RotprobeError::Contract(
            "empty ensemble member list".into(),
        ));
    }
    let shape = members[0].dims();
    for m in members {
        if m.dims() != shape {
            return Err(RotprobeError::Contract(
                "ensemble members disagree on shape".into(),
            ));
        }
    }
    let n = members.len();
    let stacked = Tensor::stack(members, 0)?;
    let mean = stacked.mean(0)?;
    if n < 2 {
        return Ok((mean, None));
    }
    let disc = stacked.broadcast_sub(&mean)?;
    let std = pooled_std(&disc, n)?;
    Ok((mean, Some(std)))
}

fn pooled_std(discrepancies: &Tensor, n: usize) -> Result<f64> {
    let mean_sq = discrepancies.sqr()?.mean_all()?.to_scalar::<f32>()? as f64;
    Ok((mean_sq * n as f64 / (n as f64 - 1.0)).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu_device;

    fn scalar_ensemble(members: Vec<Vec<f32>>) -> PredictionEnsemble {
        let device = cpu_device();
        let scalars = members
            .into_iter()
            .map(|v| {
                let len = v.len();
                Tensor::from_vec(v, len, &device).unwrap()
            })
            .collect();
        PredictionEnsemble {
            scalars,
            vectors: None,
        }
    }

    #[test]
    fn test_identical_members_have_zero_discrepancy() {
        let ensemble = scalar_ensemble(vec![vec![1.0, 2.0]; 4]);
        let result = aggregate(&ensemble, None).unwrap();
        let mean: Vec<f32> = result.scalar_mean.to_vec1().unwrap();
        assert_eq!(mean, vec![1.0, 2.0]);
        assert!(result.scalar_std.unwrap().abs() < 1e-7);
    }

    #[test]
    fn test_two_member_closed_form() {
        // Members {v, v + delta}: discrepancies are -+delta/2, the corrected
        // variance is delta^2 / 2, the std delta / sqrt(2).
        let delta = 0.4f64;
        let ensemble = scalar_ensemble(vec![vec![1.0], vec![1.0 + delta as f32]]);
        let result = aggregate(&ensemble, None).unwrap();
        let mean: Vec<f32> = result.scalar_mean.to_vec1().unwrap();
        assert!((mean[0] as f64 - (1.0 + delta / 2.0)).abs() < 1e-6);
        assert!((result.scalar_std.unwrap() - delta / 2f64.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_single_member_has_no_std() {
        let ensemble = scalar_ensemble(vec![vec![3.0, 4.0]]);
        let result = aggregate(&ensemble, None).unwrap();
        assert!(result.scalar_std.is_none());
        assert!(result.vector_std.is_none());
    }

    #[test]
    fn test_self_contributions_shift_mean_only() {
        let ensemble = scalar_ensemble(vec![vec![1.0], vec![2.0]]);
        let plain = aggregate(&ensemble, None).unwrap();
        let baseline = Tensor::from_vec(vec![4.0f32], 1, &cpu_device()).unwrap();
        let shifted = aggregate(&ensemble, Some(&baseline)).unwrap();

        let m0: Vec<f32> = plain.scalar_mean.to_vec1().unwrap();
        let m1: Vec<f32> = shifted.scalar_mean.to_vec1().unwrap();
        assert!((m1[0] - m0[0] - 4.0).abs() < 1e-6);
        assert_eq!(plain.scalar_std, shifted.scalar_std);
    }

    #[test]
    fn test_mismatched_baseline_is_contract_error() {
        let ensemble = scalar_ensemble(vec![vec![1.0], vec![2.0]]);
        let baseline = Tensor::from_vec(vec![1.0f32, 2.0], 2, &cpu_device()).unwrap();
        let err = aggregate(&ensemble, Some(&baseline)).unwrap_err();
        assert!(matches!(err, RotprobeError::Contract(_)));
    }

    #[test]
    fn test_vector_aggregation() {
        let device = cpu_device();
        let a = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0], (2, 3), &device)
            .unwrap();
        let b = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0], (2, 3), &device)
            .unwrap();
        let ensemble = PredictionEnsemble {
            scalars: vec![
                Tensor::from_vec(vec![1.0f32], 1, &device).unwrap(),
                Tensor::from_vec(vec![1.0f32], 1, &device).unwrap(),
            ],
            vectors: Some(vec![a, b]),
        };
        let result = aggregate(&ensemble, None).unwrap();
        assert!(result.vector_std.unwrap().abs() < 1e-7);
        let mean: Vec<Vec<f32>> = result.vector_mean.unwrap().to_vec2().unwrap();
        assert_eq!(mean[0], vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_vector_member_list_is_contract_error() {
        // An ensemble can carry scalars while the vector list is present but
        // empty; aggregation must refuse it rather than index into nothing.
        let device = cpu_device();
        let ensemble = PredictionEnsemble {
            scalars: vec![Tensor::from_vec(vec![1.0f32], 1, &device).unwrap()],
            vectors: Some(vec![]),
        };
        let err = aggregate(&ensemble, None).unwrap_err();
        assert!(matches!(err, RotprobeError::Contract(_)));
    }

    #[test]
    fn test_per_atom_scalar_std_normalizes_by_count() {
        // One structure with 4 atoms, members {0, 2}: raw discrepancies
        // -+1, per-atom -+0.25; corrected std = 0.25 * sqrt(2).
        let ensemble = scalar_ensemble(vec![vec![0.0], vec![2.0]]);
        let std = per_atom_scalar_std(&ensemble, &[4]).unwrap().unwrap();
        assert!((std - 0.25 * 2f64.sqrt()).abs() < 1e-6);
    }
}
