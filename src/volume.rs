//! In-memory image containers
//!
//! Volumes are stored flat in Fortran (column-major) order to match the NIfTI
//! convention: index = x + y*nx + z*nx*ny + t*nx*ny*nz.

use crate::error::{IvimError, Result};

/// Row-major 4x4 identity, used as the default spatial transform.
pub const IDENTITY_AFFINE: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

/// Index into 3D array (Fortran/column-major order)
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// Half-sample symmetric boundary (matches "reflect" convolution mode);
/// `n` must be at least 1
#[inline]
pub(crate) fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let mut i = i;
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        } else {
            return i as usize;
        }
    }
}

/// A 4-D diffusion series (three spatial axes plus the acquisition axis)
#[derive(Clone, Debug, PartialEq)]
pub struct ImageVolume {
    /// Samples, length nx*ny*nz*nt
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz, nt)
    pub dims: (usize, usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Voxel-to-world affine (4x4, row-major)
    pub affine: [f64; 16],
}

impl ImageVolume {
    pub fn new(
        data: Vec<f64>,
        dims: (usize, usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Result<Self> {
        let expected = dims.0 * dims.1 * dims.2 * dims.3;
        if data.len() != expected {
            return Err(IvimError::ShapeMismatch(format!(
                "volume data has {} samples, dims {:?} need {}",
                data.len(), dims, expected
            )));
        }
        Ok(Self { data, dims, voxel_size, affine })
    }

    /// Build a series from equally sized 3D volumes, sharing one geometry.
    pub fn from_volumes(
        volumes: &[Vec<f64>],
        spatial: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Result<Self> {
        let n_vox = spatial.0 * spatial.1 * spatial.2;
        let mut data = Vec::with_capacity(n_vox * volumes.len());
        for (t, vol) in volumes.iter().enumerate() {
            if vol.len() != n_vox {
                return Err(IvimError::ShapeMismatch(format!(
                    "volume {} has {} voxels, expected {}", t, vol.len(), n_vox
                )));
            }
            data.extend_from_slice(vol);
        }
        Self::new(data, (spatial.0, spatial.1, spatial.2, volumes.len()), voxel_size, affine)
    }

    pub fn spatial_dims(&self) -> (usize, usize, usize) {
        (self.dims.0, self.dims.1, self.dims.2)
    }

    /// Number of voxels in one 3D volume
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// Number of acquisition volumes
    pub fn n_volumes(&self) -> usize {
        self.dims.3
    }

    /// Borrow volume `t` as a flat 3D slice
    pub fn volume(&self, t: usize) -> &[f64] {
        let n = self.n_voxels();
        &self.data[t * n..(t + 1) * n]
    }

    pub fn volume_mut(&mut self, t: usize) -> &mut [f64] {
        let n = self.n_voxels();
        &mut self.data[t * n..(t + 1) * n]
    }

    /// Signal curve of one voxel across the acquisition axis
    pub fn voxel_signal(&self, voxel: usize) -> Vec<f64> {
        let n = self.n_voxels();
        (0..self.n_volumes()).map(|t| self.data[voxel + t * n]).collect()
    }

    /// Same geometry, new samples
    pub fn with_data(&self, data: Vec<f64>) -> Result<Self> {
        Self::new(data, self.dims, self.voxel_size, self.affine)
    }
}

/// A single 3D map sharing the geometry of the series it was derived from
#[derive(Clone, Debug, PartialEq)]
pub struct ScalarMap {
    pub data: Vec<f64>,
    pub dims: (usize, usize, usize),
    pub voxel_size: (f64, f64, f64),
    pub affine: [f64; 16],
}

impl ScalarMap {
    pub fn zeros(
        dims: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Self {
        Self {
            data: vec![0.0; dims.0 * dims.1 * dims.2],
            dims,
            voxel_size,
            affine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        let result = ImageVolume::new(vec![0.0; 7], (2, 2, 2, 1), (1.0, 1.0, 1.0), IDENTITY_AFFINE);
        assert!(matches!(result, Err(IvimError::ShapeMismatch(_))));
    }

    #[test]
    fn test_from_volumes_layout() {
        let v0 = vec![1.0; 8];
        let v1 = vec![2.0; 8];
        let series =
            ImageVolume::from_volumes(&[v0, v1], (2, 2, 2), (1.0, 1.0, 1.0), IDENTITY_AFFINE)
                .unwrap();
        assert_eq!(series.dims, (2, 2, 2, 2));
        assert_eq!(series.volume(1), &[2.0; 8]);
        assert_eq!(series.voxel_signal(3), vec![1.0, 2.0]);
    }

    #[test]
    fn test_idx3d_fortran_order() {
        assert_eq!(idx3d(1, 0, 0, 3, 4), 1);
        assert_eq!(idx3d(0, 1, 0, 3, 4), 3);
        assert_eq!(idx3d(0, 0, 1, 3, 4), 12);
    }

    #[test]
    fn test_reflect_boundary() {
        assert_eq!(reflect(-1, 5), 0);
        assert_eq!(reflect(-2, 5), 1);
        assert_eq!(reflect(5, 5), 4);
        assert_eq!(reflect(6, 5), 3);
        assert_eq!(reflect(2, 5), 2);
        assert_eq!(reflect(-1, 1), 0);
        assert_eq!(reflect(1, 1), 0);
    }
}
