//! Motion correction of a diffusion series
//!
//! Every volume is registered to a reference volume (the first volume with the
//! lowest b-value) by minimizing an intensity-scaled sum of squared
//! differences. Diffusion weighting changes the overall intensity between
//! volumes, so the scale factor is estimated jointly with the transform: it
//! starts from the least-squares factor at identity and is refined by every
//! stage. The transform is refined in stages of increasing freedom
//! (translation, rigid, affine), each solved with Levenberg–Marquardt and
//! seeded by the previous one.

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cache::StageCache;
use crate::error::{IvimError, Result};
use crate::gradients::GradientTable;
use crate::registration::interpolate::{trilinear, trilinear_with_gradient};
use crate::registration::transform::{volume_center, AffineTransform, TransformModel};
use crate::solvers::{levenberg_marquardt, LeastSquaresProblem, LmOptions, NormalEquations};
use crate::volume::{idx3d, ImageVolume};

/// Cache stage name of the motion-corrected series
pub const MOCO_STAGE: &str = "moco";

/// Parameters for registration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    /// Iteration budget per stage
    pub max_iter: usize,
    /// Relative cost/step change treated as converged
    pub tolerance: f64,
    /// Stages in order of increasing freedom
    pub stages: Vec<TransformModel>,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tolerance: 1e-6,
            stages: vec![
                TransformModel::Translation,
                TransformModel::Rigid,
                TransformModel::Affine,
            ],
        }
    }
}

impl RegistrationParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(IvimError::Config("registration.max_iter must be at least 1".to_string()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(IvimError::Config(format!(
                "registration.tolerance {} is invalid",
                self.tolerance
            )));
        }
        if self.stages.is_empty() {
            return Err(IvimError::Config("registration.stages is empty".to_string()));
        }
        if self.stages.windows(2).any(|w| w[0] >= w[1]) {
            return Err(IvimError::Config(format!(
                "registration.stages {:?} must increase in freedom without repeats", self.stages
            )));
        }
        Ok(())
    }
}

/// Outcome of registering one volume
#[derive(Clone, Debug)]
pub struct VolumeAlignment {
    pub transform: AffineTransform,
    pub converged: bool,
    pub iterations: usize,
}

/// Registers one 3D volume onto another
pub trait VolumeRegistration: Sync {
    fn register(
        &self,
        fixed: &[f64],
        moving: &[f64],
        dims: (usize, usize, usize),
    ) -> VolumeAlignment;
}

/// Staged affine registration with an intensity-scaled SSD metric
#[derive(Clone, Debug, Default)]
pub struct AffineRegistration {
    pub params: RegistrationParams,
}

impl AffineRegistration {
    pub fn new(params: RegistrationParams) -> Self {
        Self { params }
    }
}

/// Intensity-scaled SSD for one stage
///
/// Parameters are the model's transform parameters followed by the intensity
/// scale of the moving volume.
struct AlignmentProblem<'a> {
    fixed: &'a [f64],
    moving: &'a [f64],
    dims: (usize, usize, usize),
    center: [f64; 3],
    model: TransformModel,
}

impl AlignmentProblem<'_> {
    /// Visit every reference voxel with its centred coordinates
    fn for_each_voxel<F: FnMut(usize, [f64; 3])>(&self, mut f: F) {
        let (nx, ny, nz) = self.dims;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let pc = [
                        i as f64 - self.center[0],
                        j as f64 - self.center[1],
                        k as f64 - self.center[2],
                    ];
                    f(idx3d(i, j, k, nx, ny), pc);
                }
            }
        }
    }

    #[inline]
    fn map_point(&self, m: &[f64; 12], pc: [f64; 3]) -> [f64; 3] {
        let mut q = [0.0; 3];
        for r in 0..3 {
            q[r] = m[r * 4] * pc[0]
                + m[r * 4 + 1] * pc[1]
                + m[r * 4 + 2] * pc[2]
                + m[r * 4 + 3]
                + self.center[r];
        }
        q
    }

    /// Split a parameter vector into the centred matrix and the intensity scale
    fn unpack(&self, x: &[f64]) -> ([f64; 12], f64) {
        let n = self.model.n_params();
        (self.model.centered_matrix(&x[..n]), x[n])
    }

    /// d(matrix)/d(param) for the transform parameters by central differences;
    /// exact for the linear models
    fn matrix_derivatives(&self, x: &[f64]) -> Vec<[f64; 12]> {
        let h = 1e-6;
        let n = self.model.n_params();
        (0..n)
            .map(|p| {
                let mut plus = x[..n].to_vec();
                let mut minus = x[..n].to_vec();
                plus[p] += h;
                minus[p] -= h;
                let a = self.model.centered_matrix(&plus);
                let b = self.model.centered_matrix(&minus);
                let mut d = [0.0; 12];
                for e in 0..12 {
                    d[e] = (a[e] - b[e]) / (2.0 * h);
                }
                d
            })
            .collect()
    }
}

impl LeastSquaresProblem for AlignmentProblem<'_> {
    fn n_params(&self) -> usize {
        self.model.n_params() + 1
    }

    fn cost(&self, x: &[f64]) -> f64 {
        let (m, scale) = self.unpack(x);
        let mut cost = 0.0;
        self.for_each_voxel(|idx, pc| {
            let q = self.map_point(&m, pc);
            let r = scale * trilinear(self.moving, self.dims, q) - self.fixed[idx];
            cost += r * r;
        });
        cost
    }

    fn normal_equations(&self, x: &[f64]) -> Option<NormalEquations> {
        let n = x.len();
        let (m, scale) = self.unpack(x);
        let dm = self.matrix_derivatives(x);
        let mut jtj = vec![0.0; n * n];
        let mut jtr = vec![0.0; n];
        let mut cost = 0.0;
        let mut row = vec![0.0; n];

        self.for_each_voxel(|idx, pc| {
            let q = self.map_point(&m, pc);
            let (v, g) = trilinear_with_gradient(self.moving, self.dims, q);
            let r = scale * v - self.fixed[idx];
            for (p, d) in dm.iter().enumerate() {
                let mut dot = 0.0;
                for a in 0..3 {
                    let dq = d[a * 4] * pc[0]
                        + d[a * 4 + 1] * pc[1]
                        + d[a * 4 + 2] * pc[2]
                        + d[a * 4 + 3];
                    dot += g[a] * dq;
                }
                row[p] = scale * dot;
            }
            row[n - 1] = v;
            for a in 0..n {
                jtr[a] += row[a] * r;
                for b in 0..n {
                    jtj[a * n + b] += row[a] * row[b];
                }
            }
            cost += r * r;
        });

        if cost.is_finite() {
            Some(NormalEquations { jtj, jtr, cost })
        } else {
            None
        }
    }
}

/// Least-squares factor s minimizing Σ(s·moving - fixed)²
fn intensity_scale(fixed: &[f64], moving: &[f64]) -> f64 {
    let fm: f64 = fixed.iter().zip(moving).map(|(f, m)| f * m).sum();
    let mm: f64 = moving.iter().map(|m| m * m).sum();
    if mm > 0.0 && fm.is_finite() {
        fm / mm
    } else {
        1.0
    }
}

impl VolumeRegistration for AffineRegistration {
    fn register(
        &self,
        fixed: &[f64],
        moving: &[f64],
        dims: (usize, usize, usize),
    ) -> VolumeAlignment {
        let center = volume_center(dims);
        let energy: f64 = fixed.iter().map(|v| v * v).sum();
        let options = LmOptions {
            max_iter: self.params.max_iter,
            ftol: self.params.tolerance,
            xtol: self.params.tolerance,
            cost_floor: self.params.tolerance * self.params.tolerance * energy,
            ..LmOptions::default()
        };

        let mut current = TransformModel::Translation.centered_matrix(&[0.0; 3]);
        let mut scale = intensity_scale(fixed, moving);
        let mut iterations = 0;
        for &model in &self.params.stages {
            let problem = AlignmentProblem { fixed, moving, dims, center, model };
            let mut x0 = model.initial_params(&current);
            x0.push(scale);
            let result = levenberg_marquardt(&problem, &x0, &options);
            iterations += result.iterations;
            if !result.converged() {
                debug!(
                    "{:?} stage stopped with {:?} after {} iterations",
                    model, result.status, result.iterations
                );
                return VolumeAlignment {
                    transform: AffineTransform::identity(),
                    converged: false,
                    iterations,
                };
            }
            let (matrix, fitted_scale) = problem.unpack(&result.x);
            current = matrix;
            scale = fitted_scale;
        }
        debug!("Registered with intensity scale {:.4} in {} iterations", scale, iterations);

        VolumeAlignment {
            transform: AffineTransform::from_centered(&current, center),
            converged: true,
            iterations,
        }
    }
}

/// Resample a volume through a transform onto the reference grid
pub fn resample(
    moving: &[f64],
    dims: (usize, usize, usize),
    transform: &AffineTransform,
) -> Vec<f64> {
    if transform.is_identity(0.0) {
        return moving.to_vec();
    }
    let (nx, ny, nz) = dims;
    let mut out = vec![0.0; nx * ny * nz];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let q = transform.apply([i as f64, j as f64, k as f64]);
                out[idx3d(i, j, k, nx, ny)] = trilinear(moving, dims, q);
            }
        }
    }
    out
}

/// Motion-corrected series with per-volume bookkeeping
#[derive(Clone, Debug)]
pub struct MotionCorrectionResult {
    pub image: ImageVolume,
    /// One per volume; empty when loaded from a cache without sidecar
    pub transforms: Vec<AffineTransform>,
    /// Volumes left unregistered
    pub warnings: Vec<String>,
    pub from_cache: bool,
}

/// Register every volume of `image` to its reference volume
pub fn motion_correction<R: VolumeRegistration + ?Sized>(
    image: &ImageVolume,
    gtab: &GradientTable,
    registrar: &R,
) -> Result<MotionCorrectionResult> {
    gtab.check_volumes(image.n_volumes())?;
    let dims = image.spatial_dims();
    let reference = gtab.reference_index();
    let fixed = image.volume(reference);
    info!("Motion correction: {} volumes, reference volume {}", image.n_volumes(), reference);

    let aligned: Vec<(Vec<f64>, AffineTransform, Option<String>)> = (0..image.n_volumes())
        .into_par_iter()
        .map(|t| {
            let moving = image.volume(t);
            if t == reference {
                return (moving.to_vec(), AffineTransform::identity(), None);
            }
            let alignment = registrar.register(fixed, moving, dims);
            if alignment.converged {
                let data = resample(moving, dims, &alignment.transform);
                (data, alignment.transform, None)
            } else {
                let msg = format!(
                    "volume {} did not converge after {} iterations; left unregistered",
                    t, alignment.iterations
                );
                (moving.to_vec(), AffineTransform::identity(), Some(msg))
            }
        })
        .collect();

    let mut data = Vec::with_capacity(image.data.len());
    let mut transforms = Vec::with_capacity(aligned.len());
    let mut warnings = Vec::new();
    for (vol, transform, warning) in aligned {
        data.extend(vol);
        transforms.push(transform);
        if let Some(w) = warning {
            warn!("Registration: {}", w);
            warnings.push(w);
        }
    }

    Ok(MotionCorrectionResult {
        image: image.with_data(data)?,
        transforms,
        warnings,
        from_cache: false,
    })
}

/// Motion correction through the stage cache
///
/// On a hit the cached series is returned without touching `image` or the
/// registrar. On a miss, registration runs and its result is cached.
pub fn motion_correction_cached<R: VolumeRegistration + ?Sized>(
    image: &ImageVolume,
    gtab: &GradientTable,
    registrar: &R,
    cache: &StageCache,
) -> Result<MotionCorrectionResult> {
    if let Some(result) = load_cached(cache)? {
        return Ok(result);
    }
    let result = motion_correction(image, gtab, registrar)?;
    cache.store(MOCO_STAGE, &result.image, &result.transforms)?;
    Ok(result)
}

/// Cached motion-corrected series, if present
pub fn load_cached(cache: &StageCache) -> Result<Option<MotionCorrectionResult>> {
    let image = match cache.load_image(MOCO_STAGE)? {
        Some(image) => image,
        None => return Ok(None),
    };
    let transforms = cache.load_sidecar::<Vec<AffineTransform>>(MOCO_STAGE)?.unwrap_or_default();
    Ok(Some(MotionCorrectionResult { image, transforms, warnings: Vec::new(), from_cache: true }))
}
