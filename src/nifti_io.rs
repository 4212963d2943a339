//! NIfTI file I/O
//!
//! Loads 3D masks and 4D diffusion series from `.nii`/`.nii.gz` files and writes
//! float32 NIfTI-1 images. Files are written to a temporary sibling first and then
//! renamed, so a reader never observes a partially written output.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{IvimError, Result};
use crate::utils::mask::Mask;
use crate::volume::{ImageVolume, ScalarMap};

/// NIfTI data loaded from bytes
pub struct NiftiData {
    /// Volume data as f64, Fortran order with the 4th axis slowest
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz, nt); nt = 1 for 3D images
    pub dims: (usize, usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

fn read_object(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut decompressed = Vec::new();
            let mut decoder = GzDecoder::new(Cursor::new(bytes));
            let info = if std::io::Read::read_to_end(&mut decoder, &mut decompressed).is_ok() {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            IvimError::Nifti(format!("Failed to read gzipped NIfTI: {} ({})", e, info))
        })
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| IvimError::Nifti(format!("Failed to read NIfTI: {} ({})", e, info)))
    }
}

/// Load a 3D or 4D NIfTI image from bytes
///
/// Supports both .nii and .nii.gz files (gzip is auto-detected).
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let obj = read_object(bytes)?;
    let header = obj.header();

    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(IvimError::Nifti(format!("Expected at least 3D volume, got {}D", ndim)));
    }

    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);
    let affine = get_affine(header);

    // `into_ndarray` applies scl_slope/scl_inter
    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| IvimError::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    // Use the actual array shape for dimensions (nifti-rs may drop trailing axes)
    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(IvimError::Nifti(format!("Expected at least 3D array, got {}D", shape.len())));
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    // index = x + y*nx + z*nx*ny + t*nx*ny*nz
    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    if shape.len() == 3 {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data.push(array[[i, j, k]]);
                }
            }
        }
    } else if shape.len() == 4 {
        for t in 0..nt {
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx {
                        data.push(array[[i, j, k, t]]);
                    }
                }
            }
        }
    } else {
        return Err(IvimError::Nifti(format!("Unsupported {}D image", shape.len())));
    }

    Ok(NiftiData {
        data,
        dims: (nx, ny, nz, nt),
        voxel_size,
        affine,
    })
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        // Fall back to identity with voxel scaling
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Encode data as uncompressed NIfTI-1 bytes (float32)
///
/// A 4th dimension of 1 produces a 3D header.
pub fn save_nifti(
    data: &[f64],
    dims: (usize, usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    let (nx, ny, nz, nt) = dims;
    if data.len() != nx * ny * nz * nt {
        return Err(IvimError::ShapeMismatch(format!(
            "cannot write {} samples with dims {:?}", data.len(), dims
        )));
    }
    if [nx, ny, nz, nt].iter().any(|&d| d > i16::MAX as usize) {
        return Err(IvimError::Nifti(format!("dimension too large for NIfTI-1: {:?}", dims)));
    }
    let (vsx, vsy, vsz) = voxel_size;

    let mut header = [0u8; 348];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim: i16 = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, nt as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            let value = affine[row * 4 + col] as f32;
            header[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);
    for &val in data {
        buffer.extend_from_slice(&(val as f32).to_le_bytes());
    }

    Ok(buffer)
}

/// Encode data as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    dims: (usize, usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let uncompressed = save_nifti(data, dims, voxel_size, affine)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| IvimError::Nifti(format!("Gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| IvimError::Nifti(format!("Gzip finish failed: {}", e)))
}

/// Read a NIfTI file from a filesystem path
pub fn read_nifti_file(path: &Path) -> Result<NiftiData> {
    let bytes = std::fs::read(path).map_err(|e| IvimError::io(path, e))?;
    load_nifti(&bytes)
}

/// Read a diffusion series (3D files become a single-volume series)
pub fn read_image_file(path: &Path) -> Result<ImageVolume> {
    let nifti = read_nifti_file(path)?;
    ImageVolume::new(nifti.data, nifti.dims, nifti.voxel_size, nifti.affine)
}

/// Read a binary mask; non-zero voxels are foreground
pub fn read_mask_file(path: &Path) -> Result<Mask> {
    let nifti = read_nifti_file(path)?;
    if nifti.dims.3 != 1 {
        return Err(IvimError::ShapeMismatch(format!(
            "mask '{}' has {} volumes, expected a 3D image", path.display(), nifti.dims.3
        )));
    }
    Mask::from_values(&nifti.data, (nifti.dims.0, nifti.dims.1, nifti.dims.2))
}

/// Append `suffix` to the final component of `base` (no extension handling)
pub fn path_with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Write bytes to `path` via a temporary sibling and a rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path);
    std::fs::write(&tmp, bytes).map_err(|e| IvimError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        std::fs::remove_file(&tmp).ok();
        IvimError::io(path, e)
    })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

/// Save NIfTI data to a file
///
/// If the path ends with .nii.gz, the file is gzip compressed.
/// Otherwise it is saved as uncompressed .nii.
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    dims: (usize, usize, usize, usize),
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(data, dims, voxel_size, affine)?
    } else {
        save_nifti(data, dims, voxel_size, affine)?
    };
    write_atomic(path, &bytes)
}

pub fn save_image_file(path: &Path, image: &ImageVolume) -> Result<()> {
    save_nifti_to_file(path, &image.data, image.dims, image.voxel_size, &image.affine)
}

pub fn save_map_file(path: &Path, map: &ScalarMap) -> Result<()> {
    let (nx, ny, nz) = map.dims;
    save_nifti_to_file(path, &map.data, (nx, ny, nz, 1), map.voxel_size, &map.affine)
}
