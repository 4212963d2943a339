//! Path-addressed stage cache
//!
//! A stage result lives at `<base>_<stage>.nii.gz`, with optional metadata in a
//! YAML sidecar `<base>_<stage>.yml`. Existence of the image is the whole
//! validity check: a present file is loaded as-is, an absent one means the
//! stage must run. Both files are written atomically, sidecar first, so the
//! image never appears without its metadata.

use std::path::{Path, PathBuf};

use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{IvimError, Result};
use crate::nifti_io::{path_with_suffix, read_image_file, save_image_file, write_atomic};
use crate::volume::ImageVolume;

#[derive(Clone, Debug)]
pub struct StageCache {
    base: PathBuf,
}

impl StageCache {
    /// `base` is the subject path without extension
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn image_path(&self, stage: &str) -> PathBuf {
        path_with_suffix(&self.base, &format!("_{}.nii.gz", stage))
    }

    pub fn sidecar_path(&self, stage: &str) -> PathBuf {
        path_with_suffix(&self.base, &format!("_{}.yml", stage))
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.image_path(stage).exists()
    }

    /// Cached image, or `None` on a miss
    pub fn load_image(&self, stage: &str) -> Result<Option<ImageVolume>> {
        let path = self.image_path(stage);
        if !path.exists() {
            return Ok(None);
        }
        info!("Loading cached {} result from {}", stage, path.display());
        read_image_file(&path).map(Some)
    }

    /// Sidecar metadata, or `None` if there is no sidecar
    pub fn load_sidecar<T: DeserializeOwned>(&self, stage: &str) -> Result<Option<T>> {
        let path = self.sidecar_path(stage);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|e| IvimError::io(&path, e))?;
        Ok(Some(serde_yaml::from_str(&text)?))
    }

    /// Write a stage result and its metadata
    pub fn store<T: Serialize>(
        &self,
        stage: &str,
        image: &ImageVolume,
        metadata: &T,
    ) -> Result<()> {
        let sidecar = self.sidecar_path(stage);
        write_atomic(&sidecar, serde_yaml::to_string(metadata)?.as_bytes())?;
        let path = self.image_path(stage);
        save_image_file(&path, image)?;
        info!("Cached {} result at {}", stage, path.display());
        Ok(())
    }
}
