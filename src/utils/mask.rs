//! Foreground masks restricting voxel-wise fitting
//!
//! Masks are supplied externally (usually a brain mask NIfTI). Helpers here turn
//! loaded intensities into a boolean field and build geometric masks for tests
//! and phantoms. Fortran ordering: index = x + y*nx + z*nx*ny.

use crate::error::{IvimError, Result};
use crate::volume::idx3d;

/// Binary 3D mask; `true` = include voxel in fitting
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    pub data: Vec<bool>,
    pub dims: (usize, usize, usize),
}

impl Mask {
    /// Mask including every voxel
    pub fn full(dims: (usize, usize, usize)) -> Self {
        Self { data: vec![true; dims.0 * dims.1 * dims.2], dims }
    }

    /// Any non-zero, finite intensity counts as foreground
    pub fn from_values(values: &[f64], dims: (usize, usize, usize)) -> Result<Self> {
        let n = dims.0 * dims.1 * dims.2;
        if values.len() != n {
            return Err(IvimError::ShapeMismatch(format!(
                "mask has {} voxels, dims {:?} need {}", values.len(), dims, n
            )));
        }
        let data = values.iter().map(|&v| v.is_finite() && v != 0.0).collect();
        Ok(Self { data, dims })
    }

    /// Binary sphere mask
    ///
    /// # Arguments
    /// * `dims` - Volume dimensions
    /// * `center` - Sphere center in voxel coordinates
    /// * `radius` - Sphere radius in voxels
    pub fn sphere(dims: (usize, usize, usize), center: (f64, f64, f64), radius: f64) -> Self {
        let (nx, ny, nz) = dims;
        let mut data = vec![false; nx * ny * nz];
        let r2 = radius * radius;

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let dx = i as f64 - center.0;
                    let dy = j as f64 - center.1;
                    let dz = k as f64 - center.2;
                    if dx * dx + dy * dy + dz * dz <= r2 {
                        data[idx3d(i, j, k, nx, ny)] = true;
                    }
                }
            }
        }

        Self { data, dims }
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&m| m).count()
    }

    /// Flat indices of included voxels, ascending
    pub fn indices(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| if m { Some(i) } else { None })
            .collect()
    }

    pub fn check_dims(&self, dims: (usize, usize, usize)) -> Result<()> {
        if self.dims != dims {
            return Err(IvimError::ShapeMismatch(format!(
                "mask dims {:?} do not match image dims {:?}", self.dims, dims
            )));
        }
        Ok(())
    }
}
