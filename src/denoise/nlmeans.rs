//! Non-local means denoising for magnitude MR volumes
//!
//! Each output voxel is a weighted average over a search block; weights decay with
//! the mean squared difference between the patch around the target voxel and the
//! patch around each candidate. With the Rician option the average is taken over
//! squared intensities and the 2σ² noise floor is subtracted before the root.
//!
//! Reference:
//! Coupé, P., Yger, P., Prima, S., Hellier, P., Kervrann, C., Barillot, C. (2008).
//! "An optimized blockwise nonlocal means denoising filter for 3-D magnetic resonance images."
//! IEEE Transactions on Medical Imaging, 27(4):425-441. https://doi.org/10.1109/TMI.2007.906087

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::denoise::noise_estimate::NoiseMap;
use crate::error::{IvimError, Result};
use crate::volume::{idx3d, reflect, ImageVolume};

/// Parameters for non-local means
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NlmeansParams {
    /// Patch radius in voxels (patch side = 2r+1)
    pub patch_radius: usize,
    /// Search block radius in voxels
    pub block_radius: usize,
    /// Correct for the Rician noise floor of magnitude data
    pub rician: bool,
}

impl Default for NlmeansParams {
    fn default() -> Self {
        Self {
            patch_radius: 1,
            block_radius: 2,
            rician: true,
        }
    }
}

impl NlmeansParams {
    pub fn validate(&self) -> Result<()> {
        if self.patch_radius == 0 && self.block_radius == 0 {
            return Err(IvimError::Config(
                "nlmeans needs a non-zero patch or block radius".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mean squared difference between the patches centred at `p` and `q`
#[inline]
fn patch_distance(
    vol: &[f64],
    p: (isize, isize, isize),
    q: (isize, isize, isize),
    radius: isize,
    nx: usize, ny: usize, nz: usize,
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for dk in -radius..=radius {
        let pk = reflect(p.2 + dk, nz);
        let qk = reflect(q.2 + dk, nz);
        for dj in -radius..=radius {
            let pj = reflect(p.1 + dj, ny);
            let qj = reflect(q.1 + dj, ny);
            for di in -radius..=radius {
                let pi = reflect(p.0 + di, nx);
                let qi = reflect(q.0 + di, nx);
                let d = vol[idx3d(pi, pj, pk, nx, ny)] - vol[idx3d(qi, qj, qk, nx, ny)];
                sum += d * d;
                count += 1;
            }
        }
    }
    sum / count as f64
}

/// Denoise a single 3D volume
///
/// # Arguments
/// * `vol` - Input volume (nx * ny * nz)
/// * `sigma` - Noise standard deviation for this volume
/// * `params` - Patch/block radii and noise model
///
/// # Returns
/// Denoised volume; a copy of the input if `sigma` is zero
pub fn nlmeans_3d(
    vol: &[f64],
    nx: usize, ny: usize, nz: usize,
    sigma: f64,
    params: &NlmeansParams,
) -> Vec<f64> {
    if sigma <= 0.0 || nx * ny * nz == 0 {
        return vol.to_vec();
    }

    let denom = std::f64::consts::SQRT_2 * sigma * sigma;
    let floor = 2.0 * sigma * sigma;
    let pr = params.patch_radius as isize;
    let br = params.block_radius as isize;
    let slice_len = nx * ny;

    let mut out = vec![0.0; nx * ny * nz];
    out.par_chunks_mut(slice_len).enumerate().for_each(|(k, slice)| {
        let k = k as isize;
        for j in 0..ny as isize {
            for i in 0..nx as isize {
                let mut sum_w = 0.0;
                let mut sum_out = 0.0;

                for c in (k - br).max(0)..=(k + br).min(nz as isize - 1) {
                    for b in (j - br).max(0)..=(j + br).min(ny as isize - 1) {
                        for a in (i - br).max(0)..=(i + br).min(nx as isize - 1) {
                            let d = patch_distance(vol, (i, j, k), (a, b, c), pr, nx, ny, nz);
                            let w = (-d / denom).exp();
                            let x = vol[idx3d(a as usize, b as usize, c as usize, nx, ny)];
                            sum_w += w;
                            sum_out += if params.rician { w * x * x } else { w * x };
                        }
                    }
                }

                let idx = i as usize + j as usize * nx;
                slice[idx] = if sum_w == 0.0 {
                    0.0
                } else if params.rician {
                    (sum_out / sum_w - floor).max(0.0).sqrt()
                } else {
                    sum_out / sum_w
                };
            }
        }
    });

    out
}

/// Denoise every volume of a series with its own noise level
///
/// The input series is left untouched; the output shares its geometry.
pub fn nlmeans(
    image: &ImageVolume,
    noise: &NoiseMap,
    params: &NlmeansParams,
) -> Result<ImageVolume> {
    if noise.len() != image.n_volumes() {
        return Err(IvimError::ShapeMismatch(format!(
            "noise map has {} entries for {} volumes", noise.len(), image.n_volumes()
        )));
    }
    params.validate()?;

    let (nx, ny, nz) = image.spatial_dims();
    let mut data = Vec::with_capacity(image.data.len());
    for t in 0..image.n_volumes() {
        let sigma = noise.for_volume(t);
        debug!("nlmeans volume {} (sigma {:.4})", t, sigma);
        data.extend(nlmeans_3d(image.volume(t), nx, ny, nz, sigma, params));
    }

    image.with_data(data)
}
