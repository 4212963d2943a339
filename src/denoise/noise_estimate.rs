//! Noise standard deviation estimation
//!
//! Local-difference estimator: each voxel is compared with the mean of its six
//! face neighbours, which removes slowly varying signal and leaves noise. The
//! squared residuals are averaged over non-zero voxels and divided by the
//! variance factor of the magnitude noise distribution (Rician for one coil,
//! non-central chi for N coils) so that the result is the underlying Gaussian
//! sigma.
//!
//! Reference:
//! Koay, C.G., Basser, P.J. (2006). "Analytically exact correction scheme for
//! signal extraction from noisy magnitude MR signals."
//! Journal of Magnetic Resonance, 179(2):317-322. https://doi.org/10.1016/j.jmr.2006.01.016

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{IvimError, Result};
use crate::volume::{idx3d, reflect, ImageVolume};

/// Parameters for noise estimation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    /// Number of receive coils; 0 selects a Gaussian noise model
    pub coils: usize,
    /// Minimum number of usable (non-zero) voxels per volume
    pub min_samples: usize,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            // Head coil array
            coils: 32,
            min_samples: 8,
        }
    }
}

impl NoiseParams {
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_COILS.contains(&self.coils) {
            return Err(IvimError::Config(format!(
                "noise.coils {} is not one of {:?}", self.coils, SUPPORTED_COILS
            )));
        }
        if self.min_samples == 0 {
            return Err(IvimError::Config("noise.min_samples must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Coil counts accepted in configuration (0 = Gaussian noise)
pub const SUPPORTED_COILS: [usize; 11] = [0, 1, 4, 6, 8, 12, 16, 20, 24, 32, 64];

/// Noise sigma, one global estimate per acquisition volume
#[derive(Clone, Debug, PartialEq)]
pub struct NoiseMap {
    sigma: Vec<f64>,
}

impl NoiseMap {
    /// Negative or non-finite values are clamped to zero
    pub fn new(sigma: Vec<f64>) -> Self {
        let sigma = sigma
            .into_iter()
            .map(|s| if s.is_finite() && s > 0.0 { s } else { 0.0 })
            .collect();
        Self { sigma }
    }

    /// Same sigma for `n_volumes` volumes
    pub fn uniform(sigma: f64, n_volumes: usize) -> Self {
        Self::new(vec![sigma; n_volumes])
    }

    /// Sigma for acquisition volume `t`
    pub fn for_volume(&self, t: usize) -> f64 {
        self.sigma[t]
    }

    pub fn values(&self) -> &[f64] {
        &self.sigma
    }

    pub fn len(&self) -> usize {
        self.sigma.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigma.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.sigma.is_empty() {
            return 0.0;
        }
        self.sigma.iter().sum::<f64>() / self.sigma.len() as f64
    }
}

/// Variance of the magnitude noise relative to the Gaussian sigma²
///
/// For N coils the background follows a chi distribution with 2N degrees of
/// freedom: var/σ² = 2N - 2·(Γ(N+½)/Γ(N))². N = 0 selects Gaussian noise.
pub fn correction_factor(coils: usize) -> f64 {
    if coils == 0 {
        return 1.0;
    }
    // Γ(N+½)/Γ(N), built up from Γ(1.5)/Γ(1) = √π/2
    let mut ratio = std::f64::consts::PI.sqrt() / 2.0;
    for n in 1..coils {
        let n = n as f64;
        ratio *= (n + 0.5) / n;
    }
    let n = coils as f64;
    2.0 * n - 2.0 * ratio * ratio
}

/// Estimate the noise sigma of one 3D volume
///
/// # Returns
/// (sigma, number of voxels contributing)
fn estimate_volume_sigma(
    vol: &[f64],
    nx: usize, ny: usize, nz: usize,
    factor: f64,
) -> (f64, usize) {
    let norm = (6.0f64 / 7.0).sqrt();
    let mut sum_sq = 0.0;
    let mut count = 0usize;

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let center = vol[idx3d(i, j, k, nx, ny)];
                if center == 0.0 || !center.is_finite() {
                    continue;
                }

                let (ii, jj, kk) = (i as isize, j as isize, k as isize);
                let neighbours = vol[idx3d(reflect(ii - 1, nx), j, k, nx, ny)]
                    + vol[idx3d(reflect(ii + 1, nx), j, k, nx, ny)]
                    + vol[idx3d(i, reflect(jj - 1, ny), k, nx, ny)]
                    + vol[idx3d(i, reflect(jj + 1, ny), k, nx, ny)]
                    + vol[idx3d(i, j, reflect(kk - 1, nz), nx, ny)]
                    + vol[idx3d(i, j, reflect(kk + 1, nz), nx, ny)];

                let block = norm * (center - neighbours / 6.0);
                if block.is_finite() {
                    sum_sq += block * block;
                    count += 1;
                }
            }
        }
    }

    if count == 0 {
        return (0.0, 0);
    }
    ((sum_sq / count as f64 / factor).max(0.0).sqrt(), count)
}

/// Estimate per-volume noise sigma from a raw diffusion series
///
/// # Arguments
/// * `image` - Raw 4D series (not modified)
/// * `params` - Coil count and minimum sample count
///
/// # Errors
/// `InsufficientData` if any volume has fewer than `params.min_samples`
/// non-zero voxels.
pub fn estimate_sigma(image: &ImageVolume, params: &NoiseParams) -> Result<NoiseMap> {
    params.validate()?;
    let (nx, ny, nz) = image.spatial_dims();
    let factor = correction_factor(params.coils);

    let mut sigma = Vec::with_capacity(image.n_volumes());
    for t in 0..image.n_volumes() {
        let (s, count) = estimate_volume_sigma(image.volume(t), nx, ny, nz, factor);
        if count < params.min_samples {
            return Err(IvimError::InsufficientData {
                volume: t,
                found: count,
                required: params.min_samples,
            });
        }
        debug!("noise sigma volume {}: {:.4} ({} voxels)", t, s, count);
        sigma.push(s);
    }

    Ok(NoiseMap::new(sigma))
}
