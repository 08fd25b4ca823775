//! Error metrics
//!
//! Pure reductions over matching-shape prediction and ground-truth tensors.
//! Callers choose the normalization: pass structure-level tensors for
//! per-structure errors, or divide extensive targets by atom counts first
//! for per-atom errors.

use candle_core::Tensor;

use crate::{Result, RotprobeError};

fn check_shapes(predictions: &Tensor, targets: &Tensor) -> Result<()> {
    if predictions.dims() != targets.dims() {
        return Err(RotprobeError::Contract(format!(
            "prediction shape {:?} does not match target shape {:?}",
            predictions.dims(),
            targets.dims()
        )));
    }
    if predictions.elem_count() == 0 {
        return Err(RotprobeError::Input("empty tensors have no error".into()));
    }
    Ok(())
}

/// Mean absolute error.
pub fn mae(predictions: &Tensor, targets: &Tensor) -> Result<f64> {
    check_shapes(predictions, targets)?;
    let abs = predictions.sub(targets)?.abs()?;
    Ok(abs.mean_all()?.to_scalar::<f32>()? as f64)
}

/// Root mean square error.
pub fn rmse(predictions: &Tensor, targets: &Tensor) -> Result<f64> {
    check_shapes(predictions, targets)?;
    let sq = predictions.sub(targets)?.sqr()?;
    Ok((sq.mean_all()?.to_scalar::<f32>()? as f64).sqrt())
}

/// RMSE relative to the trivial baseline that always predicts the target
/// mean. Values below 1 mean the model beats the baseline; the measure is
/// scale free, so targets in different units are comparable.
pub fn relative_rmse(predictions: &Tensor, targets: &Tensor) -> Result<f64> {
    check_shapes(predictions, targets)?;
    let model = rmse(predictions, targets)?;
    let target_mean = targets.mean_all()?.to_scalar::<f32>()? as f64;
    let centered = targets.affine(1.0, -target_mean)?;
    let baseline = (centered.sqr()?.mean_all()?.to_scalar::<f32>()? as f64).sqrt();
    if baseline == 0.0 {
        return Err(RotprobeError::Numerical(
            "constant targets make relative RMSE undefined".into(),
        ));
    }
    Ok(model / baseline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cpu_device;

    fn tensor(values: Vec<f32>) -> Tensor {
        let len = values.len();
        Tensor::from_vec(values, len, &cpu_device()).unwrap()
    }

    #[test]
    fn test_mae_and_rmse() {
        let pred = tensor(vec![1.0, 2.0, 3.0]);
        let truth = tensor(vec![1.0, 0.0, 3.0]);
        assert!((mae(&pred, &truth).unwrap() - 2.0 / 3.0).abs() < 1e-6);
        assert!((rmse(&pred, &truth).unwrap() - (4.0f64 / 3.0).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_perfect_predictions() {
        let pred = tensor(vec![1.5, -2.5]);
        assert_eq!(mae(&pred, &pred).unwrap(), 0.0);
        assert_eq!(rmse(&pred, &pred).unwrap(), 0.0);
    }

    #[test]
    fn test_relative_rmse_of_mean_baseline_is_one() {
        let truth = tensor(vec![1.0, 3.0, 5.0]);
        let baseline = tensor(vec![3.0, 3.0, 3.0]);
        assert!((relative_rmse(&baseline, &truth).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_relative_rmse_rejects_constant_targets() {
        let pred = tensor(vec![1.0, 2.0]);
        let truth = tensor(vec![4.0, 4.0]);
        assert!(matches!(
            relative_rmse(&pred, &truth),
            Err(RotprobeError::Numerical(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_is_contract_error() {
        let a = tensor(vec![1.0]);
        let b = tensor(vec![1.0, 2.0]);
        assert!(matches!(mae(&a, &b), Err(RotprobeError::Contract(_))));
    }
}
