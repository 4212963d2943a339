//! End-to-end tests of the subject pipeline and its stages

mod common;

use common::*;

use ivim_core::cache::StageCache;
use ivim_core::config::IvimConfig;
use ivim_core::denoise::{estimate_sigma, NoiseParams};
use ivim_core::error::IvimError;
use ivim_core::gradients::GradientTable;
use ivim_core::ivim::{
    fit_ivim, fit_voxel_detailed, sum_squared_residuals, FitParams, IvimParameters,
};
use ivim_core::nifti_io::read_nifti_file;
use ivim_core::pipeline::{run_subject, run_subject_with, SubjectStatus};
use ivim_core::registration::{
    motion_correction, AffineRegistration, AffineTransform, VolumeAlignment, VolumeRegistration,
    MOCO_STAGE,
};
use ivim_core::utils::Mask;
use ivim_core::volume::{idx3d, ImageVolume, IDENTITY_AFFINE};

/// Mask of a 3x3x3 grid without its first and last voxel
fn partial_mask() -> Mask {
    let mut mask = Mask::full((3, 3, 3));
    mask.data[0] = false;
    mask.data[26] = false;
    mask
}

struct PanickingRegistration;

impl VolumeRegistration for PanickingRegistration {
    fn register(&self, _: &[f64], _: &[f64], _: (usize, usize, usize)) -> VolumeAlignment {
        panic!("registration must not run when the cache is present");
    }
}

#[test]
fn test_end_to_end_recovers_parameters() {
    let subject = TestSubject::new("e2e");
    let truth = reference_parameters();
    subject.write_image(&uniform_series((3, 3, 3), &truth, &BVALS));
    subject.write_gradients(&BVALS);
    let mask = partial_mask();
    subject.write_mask(&mask);

    let report = run_subject(&subject.paths, &IvimConfig::default()).unwrap();
    assert_eq!(report.status, SubjectStatus::Completed);
    assert!(!report.cache_hit);
    assert_eq!(report.fit.fitted, 25);
    assert_eq!(report.fit.failed, 0);
    assert!(report.registration_warnings.is_empty());
    assert!(report.noise_sigma.unwrap() < 1e-6);

    let maps = subject.paths.maps();
    let s0 = read_nifti_file(&maps.s0).unwrap();
    let f = read_nifti_file(&maps.f).unwrap();
    let d = read_nifti_file(&maps.d).unwrap();
    let dstar = read_nifti_file(&maps.dstar).unwrap();
    assert_eq!(f.dims, (3, 3, 3, 1));
    assert_eq!(f.affine, IDENTITY_AFFINE);

    assert!(max_relative_error(&s0.data, truth.s0, &mask.data) < 0.05);
    assert!(max_relative_error(&f.data, truth.f, &mask.data) < 0.05);
    assert!(max_relative_error(&d.data, truth.d, &mask.data) < 0.05);
    assert!(max_relative_error(&dstar.data, truth.dstar, &mask.data) < 0.05);

    // Masked-out voxels hold the sentinel
    for map in [&s0, &f, &d, &dstar] {
        assert_eq!(map.data[0], 0.0);
        assert_eq!(map.data[26], 0.0);
    }

    // Motion correction cached with one transform per volume
    let cache = subject.paths.cache();
    assert!(cache.contains(MOCO_STAGE));
    let transforms: Vec<AffineTransform> = cache.load_sidecar(MOCO_STAGE).unwrap().unwrap();
    assert_eq!(transforms.len(), BVALS.len());
    assert!(transforms.iter().all(|t| t.is_identity(1e-6)));
}

#[test]
fn test_finished_subject_is_skipped() {
    let subject = TestSubject::new("skip");
    subject.write_gradients(&BVALS);
    let maps = subject.paths.maps();
    std::fs::write(&maps.f, b"done").unwrap();

    // No image, no mask: nothing may be read
    let report = run_subject(&subject.paths, &IvimConfig::default()).unwrap();
    assert_eq!(report.status, SubjectStatus::Skipped);
    assert!(!maps.s0.exists());
    assert!(!subject.paths.cache().contains(MOCO_STAGE));
}

#[test]
fn test_resume_uses_cached_series() {
    let subject = TestSubject::new("resume");
    subject.write_gradients(&BVALS);
    subject.write_mask(&Mask::full((3, 3, 3)));

    // Raw image deliberately absent; the cache holds a distinctive series
    let cached = IvimParameters { s0: 1500.0, f: 0.25, d: 0.0008, dstar: 0.05 };
    let series = uniform_series((3, 3, 3), &cached, &BVALS);
    StageCache::new(&subject.paths.base)
        .store(MOCO_STAGE, &series, &Vec::<AffineTransform>::new())
        .unwrap();

    let report =
        run_subject_with(&subject.paths, &IvimConfig::default(), &PanickingRegistration).unwrap();
    assert_eq!(report.status, SubjectStatus::Completed);
    assert!(report.cache_hit);
    assert!(report.noise_sigma.is_none());

    let maps = subject.paths.maps();
    let all = vec![true; 27];
    let f = read_nifti_file(&maps.f).unwrap();
    let s0 = read_nifti_file(&maps.s0).unwrap();
    assert!(max_relative_error(&f.data, cached.f, &all) < 0.05);
    assert!(max_relative_error(&s0.data, cached.s0, &all) < 0.05);
}

#[test]
fn test_rerun_after_partial_output_matches() {
    let subject = TestSubject::new("rerun");
    subject.write_image(&uniform_series((3, 3, 3), &reference_parameters(), &BVALS));
    subject.write_gradients(&BVALS);
    subject.write_mask(&partial_mask());

    run_subject(&subject.paths, &IvimConfig::default()).unwrap();
    let maps = subject.paths.maps();
    let first = read_nifti_file(&maps.d).unwrap().data;

    // Losing the completion marker triggers a resume from the cache
    std::fs::remove_file(&maps.f).unwrap();
    let report =
        run_subject_with(&subject.paths, &IvimConfig::default(), &PanickingRegistration).unwrap();
    assert!(report.cache_hit);
    let second = read_nifti_file(&maps.d).unwrap().data;
    assert!(rmse(&first, &second, &[true; 27]) < 1e-9);
}

#[test]
fn test_denoised_series_saved_on_request() {
    let subject = TestSubject::new("denoised");
    subject.write_image(&uniform_series((3, 3, 3), &reference_parameters(), &BVALS));
    subject.write_gradients(&BVALS);
    subject.write_mask(&Mask::full((3, 3, 3)));

    let config = IvimConfig { save_denoised: true, ..IvimConfig::default() };
    run_subject(&subject.paths, &config).unwrap();
    let denoised = read_nifti_file(&subject.paths.denoised()).unwrap();
    assert_eq!(denoised.dims, (3, 3, 3, 6));
}

#[test]
fn test_gradient_volume_mismatch_is_fatal() {
    let subject = TestSubject::new("mismatch");
    subject.write_image(&uniform_series((3, 3, 3), &reference_parameters(), &BVALS));
    subject.write_gradients(&BVALS[..5]);
    subject.write_mask(&Mask::full((3, 3, 3)));

    let result = run_subject(&subject.paths, &IvimConfig::default());
    assert!(matches!(result, Err(IvimError::Gradient(_))));
    assert!(!subject.paths.maps().f.exists());
}

#[test]
fn test_missing_mask_is_fatal() {
    let subject = TestSubject::new("nomask");
    subject.write_image(&uniform_series((3, 3, 3), &reference_parameters(), &BVALS));
    subject.write_gradients(&BVALS);

    let result = run_subject(&subject.paths, &IvimConfig::default());
    assert!(matches!(result, Err(IvimError::Io { .. })));
    assert!(!subject.paths.maps().f.exists());
}

#[test]
fn test_fit_is_idempotent() {
    let image = noisy_series((4, 4, 4), &reference_parameters(), &BVALS, 10.0, 3);
    let gtab = GradientTable::from_bvals(&BVALS, 0.0).unwrap();
    let mask = Mask::full((4, 4, 4));

    let (a, sa) = fit_ivim(&image, &gtab, &mask, &FitParams::default()).unwrap();
    let (b, sb) = fit_ivim(&image, &gtab, &mask, &FitParams::default()).unwrap();
    assert_eq!(a, b);
    assert_eq!(sa, sb);
}

#[test]
fn test_noisy_fit_respects_bounds_and_sentinel() {
    let dims = (4, 4, 4);
    let image = noisy_series(dims, &reference_parameters(), &BVALS, 20.0, 11);
    let gtab = GradientTable::from_bvals(&BVALS, 0.0).unwrap();
    let mask = Mask::sphere(dims, (1.5, 1.5, 1.5), 1.8);
    let params = FitParams::default();

    let (maps, summary) = fit_ivim(&image, &gtab, &mask, &params).unwrap();
    assert_eq!(summary.fitted + summary.failed, mask.count());

    for voxel in 0..mask.data.len() {
        let p = maps.get(voxel);
        if !mask.data[voxel] || p == IvimParameters::SENTINEL {
            assert_eq!(p, IvimParameters::SENTINEL);
            continue;
        }
        assert!(p.s0 >= 0.0);
        assert!((0.0..=1.0).contains(&p.f), "f = {}", p.f);
        assert!(p.d >= 0.0 && p.d <= params.d_max, "D = {}", p.d);
        assert!(p.dstar >= p.d && p.dstar <= params.dstar_max, "D* = {}", p.dstar);
    }
}

#[test]
fn test_failures_split_by_reason() {
    let dims = (3, 3, 3);
    let mut image = noisy_series(dims, &reference_parameters(), &BVALS, 15.0, 23);
    for t in 0..BVALS.len() {
        image.volume_mut(t)[0] = 0.0;
    }
    let gtab = GradientTable::from_bvals(&BVALS, 0.0).unwrap();
    let mask = Mask::full(dims);
    let params = FitParams { max_iter: 1, ftol: 0.0, xtol: 0.0, ..FitParams::default() };

    let (maps, summary) = fit_ivim(&image, &gtab, &mask, &params).unwrap();
    assert_eq!(summary.fitted + summary.failed, mask.count());
    assert!(summary.exhausted > 0, "{:?}", summary);
    // The empty voxel fails without reaching the solver
    assert!(summary.exhausted < summary.failed, "{:?}", summary);
    assert_eq!(maps.get(0), IvimParameters::SENTINEL);
}

#[test]
fn test_joint_stage_never_increases_residual() {
    let image = noisy_series((3, 3, 3), &reference_parameters(), &BVALS, 15.0, 5);
    let params = FitParams::default();
    for voxel in 0..image.n_voxels() {
        let signal = image.voxel_signal(voxel);
        if let Ok(fit) = fit_voxel_detailed(&BVALS, &signal, &params) {
            let seg = sum_squared_residuals(&fit.segmented, &BVALS, &signal);
            let joint = sum_squared_residuals(&fit.joint, &BVALS, &signal);
            assert!(
                joint <= seg * (1.0 + 1e-9),
                "voxel {}: joint {} > segmented {}",
                voxel,
                joint,
                seg
            );
        }
    }
}

#[test]
fn test_noise_estimate_non_negative() {
    let image = noisy_series((6, 6, 6), &reference_parameters(), &BVALS, 20.0, 17);
    for coils in [0, 1, 32] {
        let params = NoiseParams { coils, ..NoiseParams::default() };
        let noise = estimate_sigma(&image, &params).unwrap();
        assert_eq!(noise.len(), BVALS.len());
        assert!(noise.values().iter().all(|&s| s >= 0.0 && s.is_finite()));
    }
}

fn gaussian_blob(dims: (usize, usize, usize), center: [f64; 3], width: f64) -> Vec<f64> {
    let (nx, ny, nz) = dims;
    let mut blob = vec![0.0; nx * ny * nz];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let d2 = (i as f64 - center[0]).powi(2)
                    + (j as f64 - center[1]).powi(2)
                    + (k as f64 - center[2]).powi(2);
                blob[idx3d(i, j, k, nx, ny)] = (-d2 / (2.0 * width * width)).exp();
            }
        }
    }
    blob
}

#[test]
fn test_registration_of_aligned_series_is_identity() {
    let dims = (12, 12, 12);
    let blob = gaussian_blob(dims, [5.5, 5.5, 5.5], 3.0);
    let curve = ivim_core::ivim::predict(&reference_parameters(), &BVALS);
    let volumes: Vec<Vec<f64>> =
        curve.iter().map(|&s| blob.iter().map(|v| v * s).collect()).collect();
    let image =
        ImageVolume::from_volumes(&volumes, dims, (1.0, 1.0, 1.0), IDENTITY_AFFINE).unwrap();
    let gtab = GradientTable::from_bvals(&BVALS, 0.0).unwrap();

    let result = motion_correction(&image, &gtab, &AffineRegistration::default()).unwrap();
    assert_eq!(result.transforms.len(), BVALS.len());
    for (t, transform) in result.transforms.iter().enumerate() {
        assert!(transform.is_identity(1e-6), "volume {}: {:?}", t, transform);
    }
    assert!(rmse(&result.image.data, &image.data, &vec![true; image.data.len()]) < 1e-9);
}

#[test]
fn test_default_registration_realigns_shifted_weighted_volume() {
    let dims = (16, 16, 16);
    let shift = [1.0, -1.0, 0.0];
    let bvals = [0.0, 800.0];
    let curve = ivim_core::ivim::predict(&reference_parameters(), &bvals);
    let still = gaussian_blob(dims, [7.5, 7.5, 7.5], 2.5);
    let moved = gaussian_blob(dims, [7.5 + shift[0], 7.5 + shift[1], 7.5 + shift[2]], 2.5);
    let volumes = vec![
        still.iter().map(|v| v * curve[0]).collect::<Vec<f64>>(),
        moved.iter().map(|v| v * curve[1]).collect::<Vec<f64>>(),
    ];
    let image =
        ImageVolume::from_volumes(&volumes, dims, (1.0, 1.0, 1.0), IDENTITY_AFFINE).unwrap();
    let gtab = GradientTable::from_bvals(&bvals, 0.0).unwrap();

    let result = motion_correction(&image, &gtab, &AffineRegistration::default()).unwrap();
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert!(result.transforms[0].is_identity(0.0));

    let m = &result.transforms[1].matrix;
    for r in 0..3 {
        let diagonal = m[r * 5];
        assert!((diagonal - 1.0).abs() < 5e-3, "A[{}][{}] = {}", r, r, diagonal);
        let t = m[r * 4 + 3];
        assert!((t - shift[r]).abs() < 0.05, "axis {}: {} vs {}", r, t, shift[r]);
    }

    // The corrected weighted volume lines up with the reference blob
    let expected: Vec<f64> = still.iter().map(|v| v * curve[1]).collect();
    let everywhere = vec![true; expected.len()];
    let error = rmse(result.image.volume(1), &expected, &everywhere);
    assert!(error < 0.01 * curve[1], "rmse {} vs peak {}", error, curve[1]);
}
