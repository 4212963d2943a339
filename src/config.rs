//! Pipeline configuration
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields the standard pipeline. Example:
//!
//! ```yaml
//! noise:
//!   coils: 32
//! denoise:
//!   patch_radius: 1
//!   block_radius: 2
//! registration:
//!   max_iter: 100
//!   stages: [translation, rigid, affine]
//! fit:
//!   b_threshold: 200
//! save_denoised: true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::denoise::{NlmeansParams, NoiseParams};
use crate::error::{IvimError, Result};
use crate::ivim::FitParams;
use crate::registration::RegistrationParams;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IvimConfig {
    pub noise: NoiseParams,
    pub denoise: NlmeansParams,
    pub registration: RegistrationParams,
    pub fit: FitParams,
    /// b-values at or below this count as unweighted
    pub b0_threshold: f64,
    /// Also write `<base>_denoised.nii.gz`
    pub save_denoised: bool,
}

impl IvimConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: IvimConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| IvimError::io(path, e))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.noise.validate()?;
        self.denoise.validate()?;
        self.registration.validate()?;
        self.fit.validate()?;
        if !(self.b0_threshold.is_finite() && self.b0_threshold >= 0.0) {
            return Err(IvimError::Config(format!("b0_threshold {} is invalid", self.b0_threshold)));
        }
        Ok(())
    }
}
