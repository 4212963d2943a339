//! Common test utilities for IVIM-core integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use ivim_core::ivim::{predict, IvimParameters};
use ivim_core::nifti_io::{save_image_file, save_map_file};
use ivim_core::pipeline::SubjectPaths;
use ivim_core::utils::Mask;
use ivim_core::volume::{ImageVolume, ScalarMap, IDENTITY_AFFINE};

/// Acquisition used throughout the tests
pub const BVALS: [f64; 6] = [0.0, 50.0, 100.0, 200.0, 400.0, 800.0];

pub fn reference_parameters() -> IvimParameters {
    IvimParameters { s0: 1000.0, f: 0.1, d: 0.001, dstar: 0.02 }
}

/// Compute RMSE between two arrays, only within mask
pub fn rmse(a: &[f64], b: &[f64], mask: &[bool]) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 0..a.len() {
        if mask[i] {
            let diff = a[i] - b[i];
            sum_sq += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Largest relative error against a constant truth within mask
pub fn max_relative_error(values: &[f64], truth: f64, mask: &[bool]) -> f64 {
    values
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m)
        .map(|(v, _)| (v - truth).abs() / truth.abs())
        .fold(0.0, f64::max)
}

/// Deterministic uniform samples in [0, 1)
pub struct Lcg(pub u64);

impl Lcg {
    pub fn uniform(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Approximately standard normal (sum of 12 uniforms)
    pub fn gaussian(&mut self) -> f64 {
        (0..12).map(|_| self.uniform()).sum::<f64>() - 6.0
    }
}

/// Series where every voxel follows the same IVIM curve
pub fn uniform_series(
    dims: (usize, usize, usize),
    params: &IvimParameters,
    bvals: &[f64],
) -> ImageVolume {
    let n = dims.0 * dims.1 * dims.2;
    let curve = predict(params, bvals);
    let volumes: Vec<Vec<f64>> = curve.iter().map(|&s| vec![s; n]).collect();
    ImageVolume::from_volumes(&volumes, dims, (2.0, 2.0, 2.0), IDENTITY_AFFINE).unwrap()
}

/// Same curve with Rician noise of standard deviation `sigma`
pub fn noisy_series(
    dims: (usize, usize, usize),
    params: &IvimParameters,
    bvals: &[f64],
    sigma: f64,
    seed: u64,
) -> ImageVolume {
    let mut rng = Lcg(seed);
    let mut image = uniform_series(dims, params, bvals);
    for v in image.data.iter_mut() {
        let re = *v + sigma * rng.gaussian();
        let im = sigma * rng.gaussian();
        *v = (re * re + im * im).sqrt();
    }
    image
}

/// A subject written to a scratch directory in the conventional layout
pub struct TestSubject {
    pub dir: PathBuf,
    pub paths: SubjectPaths,
}

impl TestSubject {
    /// Empty scratch directory unique to this test
    pub fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("ivim_it_{}_{}", name, std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let paths = SubjectPaths::from_image(&dir.join("sub-01.nii.gz"));
        Self { dir, paths }
    }

    pub fn write_image(&self, image: &ImageVolume) {
        save_image_file(&self.paths.image, image).unwrap();
    }

    pub fn write_gradients(&self, bvals: &[f64]) {
        let bval: Vec<String> = bvals.iter().map(|b| b.to_string()).collect();
        std::fs::write(&self.paths.bval, bval.join(" ") + "\n").unwrap();

        let x: Vec<&str> = bvals.iter().map(|&b| if b > 0.0 { "1" } else { "0" }).collect();
        let zeros = vec!["0"; bvals.len()].join(" ");
        let bvec = format!("{}\n{}\n{}\n", x.join(" "), zeros, zeros);
        std::fs::write(&self.paths.bvec, bvec).unwrap();
    }

    pub fn write_mask(&self, mask: &Mask) {
        let map = ScalarMap {
            data: mask.data.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect(),
            dims: mask.dims,
            voxel_size: (2.0, 2.0, 2.0),
            affine: IDENTITY_AFFINE,
        };
        save_map_file(&self.paths.mask, &map).unwrap();
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for TestSubject {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}
