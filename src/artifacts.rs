//! Model artifacts and persisted outputs
//!
//! On-disk companions of a trained model: safetensors checkpoints (consumed
//! as read-only name-to-tensor maps), the species table and per-species
//! self-contribution coefficients fitted at training time (JSON), and the
//! prediction arrays an evaluation run writes back out.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::structure::{AtomicStructure, SpeciesTable};
use crate::{Result, RotprobeError};

/// Load a safetensors checkpoint as a name-to-tensor map.
pub fn load_checkpoint(path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, device)?;
    info!(path = %path.display(), tensors = tensors.len(), "loaded checkpoint");
    Ok(tensors)
}

/// Per-species additive baseline coefficients, fitted by least squares on
/// the training compositions. The baseline of a structure is the dot product
/// of its per-species atom counts with these coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfContributionTable {
    species: SpeciesTable,
    coefficients: Vec<f64>,
}

/// Serialized form, one coefficient per species code in table order.
#[derive(Serialize, Deserialize)]
struct SelfContributionFile {
    species: Vec<i32>,
    coefficients: Vec<f64>,
}

impl SelfContributionTable {
    pub fn new(species: SpeciesTable, coefficients: Vec<f64>) -> Result<Self> {
        if coefficients.len() != species.len() {
            return Err(RotprobeError::Input(format!(
                "{} self-contribution coefficients for {} species",
                coefficients.len(),
                species.len()
            )));
        }
        Ok(Self {
            species,
            coefficients,
        })
    }

    pub fn species(&self) -> &SpeciesTable {
        &self.species
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Additive baseline of one structure.
    pub fn baseline(&self, structure: &AtomicStructure) -> Result<f64> {
        let counts = self.species.compositional_features(structure)?;
        Ok(counts
            .iter()
            .zip(self.coefficients.iter())
            .map(|(c, k)| c * k)
            .sum())
    }

    /// Baselines of a structure list as an f32 tensor, aligned with the
    /// aggregated scalar predictions.
    pub fn baseline_tensor(
        &self,
        structures: &[AtomicStructure],
        device: &Device,
    ) -> Result<Tensor> {
        let values: Vec<f32> = structures
            .iter()
            .map(|s| self.baseline(s).map(|b| b as f32))
            .collect::<Result<_>>()?;
        Ok(Tensor::from_vec(values, structures.len(), device)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = SelfContributionFile {
            species: self.species.codes().to_vec(),
            coefficients: self.coefficients.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| RotprobeError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: SelfContributionFile = serde_json::from_str(&text)
            .map_err(|e| RotprobeError::Serialization(e.to_string()))?;
        Self::new(SpeciesTable::new(file.species)?, file.coefficients)
    }
}

// ============================================================================
// Prediction arrays
// ============================================================================

/// Key the prediction tensor is stored under inside each safetensors file.
const PREDICTION_KEY: &str = "values";

/// Persist named prediction tensors, one safetensors file per name
/// (`<dir>/<name>.safetensors`).
pub fn save_prediction_arrays(
    dir: impl AsRef<Path>,
    arrays: &[(&str, &Tensor)],
) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    for (name, tensor) in arrays {
        let mut map = HashMap::new();
        map.insert(PREDICTION_KEY.to_string(), (*tensor).clone());
        let path = dir.join(format!("{name}.safetensors"));
        candle_core::safetensors::save(&map, &path)?;
        info!(path = %path.display(), shape = ?tensor.dims(), "saved predictions");
    }
    Ok(())
}

/// Load one persisted prediction array back.
pub fn load_prediction_array(
    dir: impl AsRef<Path>,
    name: &str,
    device: &Device,
) -> Result<Tensor> {
    let path = dir.as_ref().join(format!("{name}.safetensors"));
    let mut map = candle_core::safetensors::load(&path, device)?;
    map.remove(PREDICTION_KEY).ok_or_else(|| {
        RotprobeError::Serialization(format!(
            "{} holds no '{PREDICTION_KEY}' tensor",
            path.display()
        ))
    })
}
