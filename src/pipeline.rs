//! Per-subject IVIM pipeline
//!
//! Stages, in order: noise estimation, non-local means denoising, motion
//! correction (cached), masking, IVIM fitting, map writing. A subject whose
//! perfusion fraction map already exists is skipped. When only the motion
//! correction cache exists, the raw series is not read again and fitting
//! resumes from the cached series.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::cache::StageCache;
use crate::config::IvimConfig;
use crate::denoise::{estimate_sigma, nlmeans};
use crate::error::{IvimError, Result};
use crate::gradients::{read_bvals_bvecs, GradientTable};
use crate::ivim::{fit_ivim, write_maps, FitSummary, MapPaths};
use crate::nifti_io::{path_with_suffix, read_image_file, read_mask_file, save_image_file};
use crate::registration::{
    load_cached, motion_correction_cached, AffineRegistration, VolumeRegistration,
};
use crate::volume::ImageVolume;

/// Input and output locations of one subject
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectPaths {
    /// Image path without `.nii.gz`/`.nii`; all outputs derive from it
    pub base: PathBuf,
    pub image: PathBuf,
    pub bval: PathBuf,
    pub bvec: PathBuf,
    pub mask: PathBuf,
}

/// Strip `.nii.gz` or `.nii` from a path
pub fn strip_nifti_extension(path: &Path) -> PathBuf {
    let s = path.as_os_str().to_string_lossy();
    for ext in [".nii.gz", ".nii"] {
        if let Some(stripped) = s.strip_suffix(ext) {
            return PathBuf::from(stripped);
        }
    }
    path.to_path_buf()
}

impl SubjectPaths {
    pub fn new(image: &Path, bval: &Path, bvec: &Path, mask: &Path) -> Self {
        Self {
            base: strip_nifti_extension(image),
            image: image.to_path_buf(),
            bval: bval.to_path_buf(),
            bvec: bvec.to_path_buf(),
            mask: mask.to_path_buf(),
        }
    }

    /// Conventional layout next to the image:
    /// `<base>.bval`, `<base>.bvec`, `<base>_brain_mask.nii.gz`
    pub fn from_image(image: &Path) -> Self {
        let base = strip_nifti_extension(image);
        Self {
            bval: path_with_suffix(&base, ".bval"),
            bvec: path_with_suffix(&base, ".bvec"),
            mask: path_with_suffix(&base, "_brain_mask.nii.gz"),
            image: image.to_path_buf(),
            base,
        }
    }

    pub fn cache(&self) -> StageCache {
        StageCache::new(&self.base)
    }

    pub fn maps(&self) -> MapPaths {
        MapPaths::for_base(&self.base)
    }

    pub fn denoised(&self) -> PathBuf {
        path_with_suffix(&self.base, "_denoised.nii.gz")
    }
}

/// Find subjects in `dir`: every `<name>.bval` with a `<name>.nii.gz` or `<name>.nii` beside it
pub fn discover_subjects(dir: &Path) -> Result<Vec<SubjectPaths>> {
    let entries = std::fs::read_dir(dir).map_err(|e| IvimError::io(dir, e))?;
    let mut subjects = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| IvimError::io(dir, e))?.path();
        if path.extension().map_or(true, |ext| ext != "bval") {
            continue;
        }
        let base = path.with_extension("");
        let image = [".nii.gz", ".nii"]
            .iter()
            .map(|ext| path_with_suffix(&base, ext))
            .find(|p| p.exists());
        match image {
            Some(image) => subjects.push(SubjectPaths::from_image(&image)),
            None => warn!("{}: no matching NIfTI image, skipping", path.display()),
        }
    }
    subjects.sort_by(|a, b| a.base.cmp(&b.base));
    Ok(subjects)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubjectStatus {
    /// Maps already present
    Skipped,
    Completed,
}

/// What happened to one subject
#[derive(Clone, Debug)]
pub struct SubjectReport {
    pub base: PathBuf,
    pub status: SubjectStatus,
    /// Motion-corrected series came from the cache
    pub cache_hit: bool,
    /// Mean noise sigma over volumes, if noise was estimated
    pub noise_sigma: Option<f64>,
    pub registration_warnings: Vec<String>,
    pub fit: FitSummary,
    pub elapsed: Duration,
}

impl SubjectReport {
    fn skipped(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            status: SubjectStatus::Skipped,
            cache_hit: false,
            noise_sigma: None,
            registration_warnings: Vec::new(),
            fit: FitSummary::default(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Noise estimation and denoising; returns the mean sigma
fn denoise_stage(
    image: &ImageVolume,
    gtab: &GradientTable,
    config: &IvimConfig,
    paths: &SubjectPaths,
) -> Result<f64> {
    gtab.check_volumes(image.n_volumes())?;

    let start = Instant::now();
    let noise = estimate_sigma(image, &config.noise)?;
    info!("Noise sigma: mean {:.4} over {} volumes", noise.mean(), noise.len());

    let denoised = nlmeans(image, &noise, &config.denoise)?;
    info!("Denoising finished in {:.1?}", start.elapsed());

    if config.save_denoised {
        let path = paths.denoised();
        save_image_file(&path, &denoised)?;
        info!("Wrote {}", path.display());
    }
    Ok(noise.mean())
}

/// Run the pipeline for one subject with the default registration
pub fn run_subject(paths: &SubjectPaths, config: &IvimConfig) -> Result<SubjectReport> {
    let registrar = AffineRegistration::new(config.registration.clone());
    run_subject_with(paths, config, &registrar)
}

/// Run the pipeline for one subject with a given registration method
pub fn run_subject_with<R: VolumeRegistration + ?Sized>(
    paths: &SubjectPaths,
    config: &IvimConfig,
    registrar: &R,
) -> Result<SubjectReport> {
    config.validate()?;
    let start = Instant::now();
    let maps = paths.maps();

    if maps.is_complete() {
        info!("{}: {} exists, skipping", paths.base.display(), maps.f.display());
        return Ok(SubjectReport::skipped(&paths.base));
    }
    info!("Processing {}", paths.base.display());

    let gtab = read_bvals_bvecs(&paths.bval, &paths.bvec, config.b0_threshold)?;
    let cache = paths.cache();

    let mut noise_sigma = None;
    let moco = match load_cached(&cache)? {
        Some(hit) => {
            info!("Using cached motion correction");
            if config.save_denoised && !paths.denoised().exists() {
                let image = read_image_file(&paths.image)?;
                noise_sigma = Some(denoise_stage(&image, &gtab, config, paths)?);
            }
            hit
        }
        None => {
            let image = read_image_file(&paths.image)?;
            noise_sigma = Some(denoise_stage(&image, &gtab, config, paths)?);
            let t = Instant::now();
            let result = motion_correction_cached(&image, &gtab, registrar, &cache)?;
            info!("Motion correction finished in {:.1?}", t.elapsed());
            result
        }
    };

    gtab.check_volumes(moco.image.n_volumes())?;
    let mask = read_mask_file(&paths.mask)?;

    let t = Instant::now();
    let (parameter_maps, fit) = fit_ivim(&moco.image, &gtab, &mask, &config.fit)?;
    info!(
        "Fitted {} voxels ({} failed, {} out of iterations) in {:.1?}",
        fit.fitted,
        fit.failed,
        fit.exhausted,
        t.elapsed()
    );

    write_maps(&parameter_maps, &maps)?;

    let elapsed = start.elapsed();
    info!("{} done in {:.1?}", paths.base.display(), elapsed);
    Ok(SubjectReport {
        base: paths.base.clone(),
        status: SubjectStatus::Completed,
        cache_hit: moco.from_cache,
        noise_sigma,
        registration_warnings: moco.warnings,
        fit,
        elapsed,
    })
}
