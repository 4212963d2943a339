//! Spatial transforms for volume-to-volume registration
//!
//! Transforms map reference (fixed) voxel coordinates to moving voxel
//! coordinates. Internally they are parameterized about the volume centre so
//! that rotation and translation parameters are decoupled; the stored form is a
//! plain 4x4 voxel-space matrix.

use serde::{Deserialize, Serialize};

use crate::volume::IDENTITY_AFFINE;

/// Degrees of freedom of one registration stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformModel {
    /// 3 translations
    Translation,
    /// 3 translations + 3 rotations (radians)
    Rigid,
    /// Full 3x3 matrix + 3 translations
    Affine,
}

impl TransformModel {
    pub fn n_params(&self) -> usize {
        match self {
            TransformModel::Translation => 3,
            TransformModel::Rigid => 6,
            TransformModel::Affine => 12,
        }
    }

    /// Centred 3x4 matrix [A | t] (row-major) for a parameter vector
    pub fn centered_matrix(&self, x: &[f64]) -> [f64; 12] {
        match self {
            TransformModel::Translation => [
                1.0, 0.0, 0.0, x[0],
                0.0, 1.0, 0.0, x[1],
                0.0, 0.0, 1.0, x[2],
            ],
            TransformModel::Rigid => {
                let r = rotation(x[3], x[4], x[5]);
                [
                    r[0], r[1], r[2], x[0],
                    r[3], r[4], r[5], x[1],
                    r[6], r[7], r[8], x[2],
                ]
            }
            TransformModel::Affine => [
                x[0], x[1], x[2], x[9],
                x[3], x[4], x[5], x[10],
                x[6], x[7], x[8], x[11],
            ],
        }
    }

    /// Starting parameters for this stage given the previous stage's result
    ///
    /// Stages run in increasing order of freedom, so the previous matrix is
    /// always representable: a translation seeds a rigid stage with zero
    /// angles, any matrix seeds an affine stage.
    pub fn initial_params(&self, previous: &[f64; 12]) -> Vec<f64> {
        let t = [previous[3], previous[7], previous[11]];
        match self {
            TransformModel::Translation => t.to_vec(),
            TransformModel::Rigid => {
                let (rx, ry, rz) = euler_angles(previous);
                vec![t[0], t[1], t[2], rx, ry, rz]
            }
            TransformModel::Affine => vec![
                previous[0], previous[1], previous[2],
                previous[4], previous[5], previous[6],
                previous[8], previous[9], previous[10],
                t[0], t[1], t[2],
            ],
        }
    }
}

/// R = Rz·Ry·Rx, row-major
fn rotation(rx: f64, ry: f64, rz: f64) -> [f64; 9] {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();
    [
        cz * cy, cz * sy * sx - sz * cx, cz * sy * cx + sz * sx,
        sz * cy, sz * sy * sx + cz * cx, sz * sy * cx - cz * sx,
        -sy, cy * sx, cy * cx,
    ]
}

/// Inverse of `rotation` for a matrix that is (close to) a rotation
fn euler_angles(m: &[f64; 12]) -> (f64, f64, f64) {
    let ry = (-m[8]).clamp(-1.0, 1.0).asin();
    let rx = m[9].atan2(m[10]);
    let rz = m[4].atan2(m[0]);
    (rx, ry, rz)
}

/// Voxel-space affine transform (reference voxel -> moving voxel)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AffineTransform {
    /// 4x4 row-major
    pub matrix: [f64; 16],
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self { matrix: IDENTITY_AFFINE }
    }

    /// Un-centre a centred [A | t] matrix: q = A(p - c) + t + c
    pub fn from_centered(m: &[f64; 12], center: [f64; 3]) -> Self {
        let mut matrix = IDENTITY_AFFINE;
        for r in 0..3 {
            let a = [m[r * 4], m[r * 4 + 1], m[r * 4 + 2]];
            let ac = a[0] * center[0] + a[1] * center[1] + a[2] * center[2];
            matrix[r * 4] = a[0];
            matrix[r * 4 + 1] = a[1];
            matrix[r * 4 + 2] = a[2];
            matrix[r * 4 + 3] = m[r * 4 + 3] + center[r] - ac;
        }
        Self { matrix }
    }

    #[inline]
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let m = &self.matrix;
        [
            m[0] * p[0] + m[1] * p[1] + m[2] * p[2] + m[3],
            m[4] * p[0] + m[5] * p[1] + m[6] * p[2] + m[7],
            m[8] * p[0] + m[9] * p[1] + m[10] * p[2] + m[11],
        ]
    }

    /// Largest absolute deviation from the identity matrix
    pub fn distance_from_identity(&self) -> f64 {
        self.matrix
            .iter()
            .zip(IDENTITY_AFFINE.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    pub fn is_identity(&self, tol: f64) -> bool {
        self.distance_from_identity() <= tol
    }
}

/// Geometric centre of a volume in voxel coordinates
pub fn volume_center(dims: (usize, usize, usize)) -> [f64; 3] {
    [
        (dims.0 as f64 - 1.0) / 2.0,
        (dims.1 as f64 - 1.0) / 2.0,
        (dims.2 as f64 - 1.0) / 2.0,
    ]
}
