//! Trilinear interpolation with analytic gradient
//!
//! Sample positions are clamped to the volume, so points outside read the
//! nearest edge value and have zero gradient along the clamped axis.

use crate::volume::idx3d;

/// Clamp `x` into the axis and return (lower index, fraction, inside)
#[inline]
fn axis(x: f64, n: usize) -> (usize, f64, bool) {
    if n < 2 {
        return (0, 0.0, false);
    }
    let max = (n - 1) as f64;
    let inside = x >= 0.0 && x <= max;
    let xc = x.clamp(0.0, max);
    let i0 = (xc.floor() as usize).min(n - 2);
    (i0, xc - i0 as f64, inside)
}

/// Interpolated value at `p` (voxel coordinates)
#[inline]
pub fn trilinear(vol: &[f64], dims: (usize, usize, usize), p: [f64; 3]) -> f64 {
    trilinear_with_gradient(vol, dims, p).0
}

/// Interpolated value and spatial gradient at `p`
pub fn trilinear_with_gradient(
    vol: &[f64],
    dims: (usize, usize, usize),
    p: [f64; 3],
) -> (f64, [f64; 3]) {
    let (nx, ny, nz) = dims;
    let (i0, fx, inx) = axis(p[0], nx);
    let (j0, fy, iny) = axis(p[1], ny);
    let (k0, fz, inz) = axis(p[2], nz);
    let i1 = (i0 + 1).min(nx - 1);
    let j1 = (j0 + 1).min(ny - 1);
    let k1 = (k0 + 1).min(nz - 1);

    let c000 = vol[idx3d(i0, j0, k0, nx, ny)];
    let c100 = vol[idx3d(i1, j0, k0, nx, ny)];
    let c010 = vol[idx3d(i0, j1, k0, nx, ny)];
    let c110 = vol[idx3d(i1, j1, k0, nx, ny)];
    let c001 = vol[idx3d(i0, j0, k1, nx, ny)];
    let c101 = vol[idx3d(i1, j0, k1, nx, ny)];
    let c011 = vol[idx3d(i0, j1, k1, nx, ny)];
    let c111 = vol[idx3d(i1, j1, k1, nx, ny)];

    // Interpolate along x
    let c00 = c000 + fx * (c100 - c000);
    let c10 = c010 + fx * (c110 - c010);
    let c01 = c001 + fx * (c101 - c001);
    let c11 = c011 + fx * (c111 - c011);
    // along y
    let c0 = c00 + fy * (c10 - c00);
    let c1 = c01 + fy * (c11 - c01);
    let value = c0 + fz * (c1 - c0);

    let gx = if inx {
        let d00 = c100 - c000;
        let d10 = c110 - c010;
        let d01 = c101 - c001;
        let d11 = c111 - c011;
        let d0 = d00 + fy * (d10 - d00);
        let d1 = d01 + fy * (d11 - d01);
        d0 + fz * (d1 - d0)
    } else {
        0.0
    };
    let gy = if iny {
        let d0 = c10 - c00;
        let d1 = c11 - c01;
        d0 + fz * (d1 - d0)
    } else {
        0.0
    };
    let gz = if inz { c1 - c0 } else { 0.0 };

    (value, [gx, gy, gz])
}
