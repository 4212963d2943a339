//! Parameter maps and their on-disk layout

use std::path::{Path, PathBuf};

use log::info;

use crate::error::Result;
use crate::ivim::model::IvimParameters;
use crate::nifti_io::{path_with_suffix, save_map_file};
use crate::volume::ScalarMap;

pub const S0_SUFFIX: &str = "-S0_prediction.nii.gz";
pub const D_SUFFIX: &str = "-d_map.nii.gz";
pub const DSTAR_SUFFIX: &str = "-d_star_map.nii.gz";
/// Written last; its presence marks a finished subject
pub const PERFUSION_SUFFIX: &str = "-perfusion_fraction_map.nii.gz";

/// The four IVIM maps of one subject
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterMapSet {
    pub s0: ScalarMap,
    pub d: ScalarMap,
    pub dstar: ScalarMap,
    pub f: ScalarMap,
}

impl ParameterMapSet {
    /// All-sentinel maps with the given geometry
    pub fn new(
        dims: (usize, usize, usize),
        voxel_size: (f64, f64, f64),
        affine: [f64; 16],
    ) -> Self {
        let zeros = ScalarMap::zeros(dims, voxel_size, affine);
        Self {
            s0: zeros.clone(),
            d: zeros.clone(),
            dstar: zeros.clone(),
            f: zeros,
        }
    }

    pub fn set(&mut self, voxel: usize, p: &IvimParameters) {
        self.s0.data[voxel] = p.s0;
        self.f.data[voxel] = p.f;
        self.d.data[voxel] = p.d;
        self.dstar.data[voxel] = p.dstar;
    }

    pub fn get(&self, voxel: usize) -> IvimParameters {
        IvimParameters {
            s0: self.s0.data[voxel],
            f: self.f.data[voxel],
            d: self.d.data[voxel],
            dstar: self.dstar.data[voxel],
        }
    }
}

/// Output locations for a subject base path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapPaths {
    pub s0: PathBuf,
    pub d: PathBuf,
    pub dstar: PathBuf,
    pub f: PathBuf,
}

impl MapPaths {
    pub fn for_base(base: &Path) -> Self {
        Self {
            s0: path_with_suffix(base, S0_SUFFIX),
            d: path_with_suffix(base, D_SUFFIX),
            dstar: path_with_suffix(base, DSTAR_SUFFIX),
            f: path_with_suffix(base, PERFUSION_SUFFIX),
        }
    }

    /// Completion marker
    pub fn is_complete(&self) -> bool {
        self.f.exists()
    }
}

/// Write all four maps, perfusion fraction last
pub fn write_maps(maps: &ParameterMapSet, paths: &MapPaths) -> Result<()> {
    let outputs = [
        (&maps.s0, &paths.s0),
        (&maps.d, &paths.d),
        (&maps.dstar, &paths.dstar),
        (&maps.f, &paths.f),
    ];
    for (map, path) in outputs {
        save_map_file(path, map)?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::read_nifti_file;
    use crate::volume::IDENTITY_AFFINE;

    #[test]
    fn test_paths_from_base() {
        let paths = MapPaths::for_base(Path::new("/data/sub-01_dwi"));
        assert_eq!(paths.s0, PathBuf::from("/data/sub-01_dwi-S0_prediction.nii.gz"));
        assert_eq!(paths.d, PathBuf::from("/data/sub-01_dwi-d_map.nii.gz"));
        assert_eq!(paths.dstar, PathBuf::from("/data/sub-01_dwi-d_star_map.nii.gz"));
        assert_eq!(paths.f, PathBuf::from("/data/sub-01_dwi-perfusion_fraction_map.nii.gz"));
    }

    #[test]
    fn test_set_get() {
        let mut maps = ParameterMapSet::new((2, 2, 2), (1.0, 1.0, 1.0), IDENTITY_AFFINE);
        let p = IvimParameters { s0: 900.0, f: 0.2, d: 0.0008, dstar: 0.03 };
        maps.set(5, &p);
        assert_eq!(maps.get(5), p);
        assert_eq!(maps.get(0), IvimParameters::SENTINEL);
    }

    #[test]
    fn test_write_maps_keeps_affine() {
        let base = std::env::temp_dir().join(format!("ivim_maps_{}", std::process::id()));
        let mut affine = IDENTITY_AFFINE;
        affine[3] = -10.0;
        affine[5] = 2.0;
        let mut maps = ParameterMapSet::new((2, 3, 2), (1.0, 2.0, 1.0), affine);
        maps.set(1, &IvimParameters { s0: 500.0, f: 0.25, d: 0.001, dstar: 0.05 });

        let paths = MapPaths::for_base(&base);
        assert!(!paths.is_complete());
        write_maps(&maps, &paths).unwrap();
        assert!(paths.is_complete());

        let f = read_nifti_file(&paths.f).unwrap();
        assert_eq!(f.dims, (2, 3, 2, 1));
        assert!((f.data[1] - 0.25).abs() < 1e-6);
        assert!((f.affine[3] + 10.0).abs() < 1e-6);
        assert!((f.affine[5] - 2.0).abs() < 1e-6);

        for p in [&paths.s0, &paths.d, &paths.dstar, &paths.f] {
            std::fs::remove_file(p).ok();
        }
    }
}
