//! Hyperparameter files
//!
//! Run configuration loaded from YAML. Models are trained against a hypers
//! file and evaluated against the same one, so the loader supports a
//! defaults overlay: values in the run file override a defaults file, and
//! fields introduced after a model was fitted fall back to their defaults
//! instead of failing deserialization.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::frames::FrameConfig;
use crate::{Result, RotprobeError};

fn default_cutoff() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    32
}

fn default_seed() -> u64 {
    0
}

fn default_smoothing_width() -> f64 {
    0.5
}

fn default_floor_fraction() -> f64 {
    0.2
}

/// Evaluation hyperparameters, shared with training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypers {
    /// Neighbor cutoff radius.
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,

    /// Whether the model predicts structure-level scalar targets.
    #[serde(default = "default_true")]
    pub use_scalar_targets: bool,

    /// Whether per-atom vector targets are extracted by differentiation.
    #[serde(default)]
    pub use_vector_targets: bool,

    /// Whether structures carry per-atom scalar attributes.
    #[serde(default)]
    pub use_scalar_attributes: bool,

    /// Structures per batch.
    #[serde(default = "default_batch_size")]
    pub structural_batch_size: usize,

    /// Prefer an accelerator when one is compiled in.
    #[serde(default)]
    pub multi_device: bool,

    /// Seed for augmentation-rotation sampling.
    #[serde(default = "default_seed")]
    pub random_seed: u64,

    /// Width of the frame sampler's radial switching region.
    #[serde(default = "default_smoothing_width")]
    pub frame_smoothing_width: f64,

    /// Frame candidates below this fraction of the best weight are dropped.
    #[serde(default = "default_floor_fraction")]
    pub frame_floor_fraction: f64,
}

impl Default for Hypers {
    fn default() -> Self {
        // serde defaults and Default must agree; an empty YAML document
        // deserializes to exactly this value.
        Self {
            cutoff: default_cutoff(),
            use_scalar_targets: true,
            use_vector_targets: false,
            use_scalar_attributes: false,
            structural_batch_size: default_batch_size(),
            multi_device: false,
            random_seed: default_seed(),
            frame_smoothing_width: default_smoothing_width(),
            frame_floor_fraction: default_floor_fraction(),
        }
    }
}

impl Hypers {
    /// Load from a single YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let hypers: Self = serde_yaml::from_str(&text)
            .map_err(|e| RotprobeError::Serialization(e.to_string()))?;
        hypers.validate()?;
        Ok(hypers)
    }

    /// Load a run file over a defaults file: every key present in the run
    /// file wins, everything else comes from the defaults, and keys missing
    /// from both fall back to the built-in defaults.
    pub fn from_files(path: impl AsRef<Path>, defaults: impl AsRef<Path>) -> Result<Self> {
        let base = read_yaml_value(defaults.as_ref())?;
        let over = read_yaml_value(path.as_ref())?;
        let merged = match (base, over) {
            (serde_yaml::Value::Mapping(mut b), serde_yaml::Value::Mapping(o)) => {
                for (k, v) in o {
                    b.insert(k, v);
                }
                serde_yaml::Value::Mapping(b)
            }
            (_, over) => over,
        };
        let hypers: Self = serde_yaml::from_value(merged)
            .map_err(|e| RotprobeError::Serialization(e.to_string()))?;
        hypers.validate()?;
        Ok(hypers)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.cutoff > 0.0) {
            return Err(RotprobeError::Config(format!(
                "cutoff must be positive, got {}",
                self.cutoff
            )));
        }
        if self.structural_batch_size == 0 {
            return Err(RotprobeError::Config(
                "structural batch size must be positive".into(),
            ));
        }
        if !(self.frame_smoothing_width > 0.0) {
            return Err(RotprobeError::Config(
                "frame smoothing width must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.frame_floor_fraction) {
            return Err(RotprobeError::Config(
                "frame floor fraction must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            smoothing_width: self.frame_smoothing_width,
            floor_fraction: self.frame_floor_fraction,
        }
    }
}

fn read_yaml_value(path: &Path) -> Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(serde_yaml::Value::Mapping(Default::default()));
    }
    serde_yaml::from_str(&text).map_err(|e| RotprobeError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "hypers.yaml", "cutoff: 4.5\nrandom_seed: 7\n");
        let hypers = Hypers::from_file(&path).unwrap();
        assert_eq!(hypers.cutoff, 4.5);
        assert_eq!(hypers.random_seed, 7);
        assert_eq!(hypers.structural_batch_size, default_batch_size());
    }

    #[test]
    fn test_run_file_overrides_defaults_file() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = write_file(
            &dir,
            "defaults.yaml",
            "cutoff: 5.0\nstructural_batch_size: 16\nuse_vector_targets: true\n",
        );
        let run = write_file(&dir, "run.yaml", "cutoff: 3.0\n");
        let hypers = Hypers::from_files(&run, &defaults).unwrap();
        assert_eq!(hypers.cutoff, 3.0);
        assert_eq!(hypers.structural_batch_size, 16);
        assert!(hypers.use_vector_targets);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad.yaml", "cutoff: -1.0\n");
        assert!(matches!(
            Hypers::from_file(&path),
            Err(RotprobeError::Config(_))
        ));
    }

    #[test]
    fn test_roundtrip() {
        let hypers = Hypers {
            cutoff: 4.0,
            use_vector_targets: true,
            ..Default::default()
        };
        let text = serde_yaml::to_string(&hypers).unwrap();
        let back: Hypers = serde_yaml::from_str(&text).unwrap();
        assert_eq!(hypers, back);
    }
}
