//! Two-stage IVIM fitting
//!
//! Stage 1 (segmented): above `b_threshold` the perfusion compartment has
//! decayed, so a log-linear fit of the high-b signal gives D and the intercept
//! (1-f)·S0. The low-b excess over that line is fitted again log-linearly for D*.
//!
//! Stage 2 (joint): bounded Levenberg–Marquardt over (S0, f, D, D*) started
//! from the stage 1 estimate.
//!
//! Both stages work on the signal divided by the mean lowest-b signal, so S0
//! bounds and convergence tolerances do not depend on the scanner's intensity
//! scale.

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{IvimError, Result};
use crate::gradients::GradientTable;
use crate::ivim::maps::ParameterMapSet;
use crate::ivim::model::{jacobian_row, signal, IvimParameters};
use crate::solvers::{
    levenberg_marquardt, LeastSquaresProblem, LmOptions, LmStatus, NormalEquations,
};
use crate::utils::mask::Mask;
use crate::volume::ImageVolume;

/// Parameters for the IVIM fit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    /// Iteration budget of the joint stage
    pub max_iter: usize,
    /// b-values at or above this (s/mm²) are used for the D estimate
    pub b_threshold: f64,
    /// S0 bounds as multiples of the observed lowest-b signal; must contain 1
    pub s0_bounds: (f64, f64),
    /// Upper bound on D (mm²/s)
    pub d_max: f64,
    /// Upper bound on D* (mm²/s)
    pub dstar_max: f64,
    /// Relative cost reduction treated as converged
    pub ftol: f64,
    /// Relative step size treated as converged
    pub xtol: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            max_iter: 10,
            b_threshold: 200.0,
            s0_bounds: (0.5, 2.0),
            d_max: 0.005,
            dstar_max: 1.0,
            ftol: 1e-4,
            xtol: 1e-6,
        }
    }
}

impl FitParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(IvimError::Config("fit.max_iter must be at least 1".to_string()));
        }
        if !self.b_threshold.is_finite() || self.b_threshold < 0.0 {
            return Err(IvimError::Config(format!(
                "fit.b_threshold {} is invalid",
                self.b_threshold
            )));
        }
        let (lo, hi) = self.s0_bounds;
        if !(lo.is_finite() && hi.is_finite() && lo >= 0.0 && lo <= hi) {
            return Err(IvimError::Config(format!("fit.s0_bounds ({}, {}) are invalid", lo, hi)));
        }
        // Stage 1 starts S0 at the observed lowest-b signal
        if !(lo <= 1.0 && 1.0 <= hi) {
            return Err(IvimError::Config(format!(
                "fit.s0_bounds ({}, {}) must contain 1",
                lo, hi
            )));
        }
        if !(self.d_max.is_finite() && self.d_max > 0.0) {
            return Err(IvimError::Config(format!("fit.d_max {} is invalid", self.d_max)));
        }
        if !(self.dstar_max.is_finite() && self.dstar_max >= self.d_max) {
            return Err(IvimError::Config(format!(
                "fit.dstar_max {} must be finite and at least d_max {}",
                self.dstar_max, self.d_max
            )));
        }
        if !(self.ftol >= 0.0 && self.xtol >= 0.0) {
            return Err(IvimError::Config("fit tolerances must be non-negative".to_string()));
        }
        Ok(())
    }

    fn lm_options(&self) -> LmOptions {
        LmOptions {
            max_iter: self.max_iter,
            ftol: self.ftol,
            xtol: self.xtol,
            ..LmOptions::default()
        }
    }
}

/// Outcome of both stages for one voxel
#[derive(Clone, Debug)]
pub struct VoxelFit {
    /// Stage 1 estimate, clamped to the bounds
    pub segmented: IvimParameters,
    /// Stage 2 estimate (equal to `segmented` if no step lowered the cost)
    pub joint: IvimParameters,
    pub status: LmStatus,
    pub iterations: usize,
}

/// Per-subject fit counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FitSummary {
    /// Masked voxels fitted successfully
    pub fitted: usize,
    /// Masked voxels that fell back to the sentinel
    pub failed: usize,
    /// Failed voxels whose joint stage ran out of iterations
    pub exhausted: usize,
}

/// Failure reason of a joint stage that used its whole iteration budget
pub const BUDGET_EXHAUSTED: &str = "iteration budget exhausted";

#[inline]
fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

/// Least-squares line z = slope·x + intercept
fn linear_fit(x: &[f64], z: &[f64]) -> Option<(f64, f64)> {
    let n = x.len() as f64;
    let sx: f64 = x.iter().sum();
    let sz: f64 = z.iter().sum();
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    let sxz: f64 = x.iter().zip(z).map(|(a, b)| a * b).sum();
    let den = n * sxx - sx * sx;
    if x.len() < 2 || den.abs() <= f64::EPSILON * n * sxx {
        return None;
    }
    let slope = (n * sxz - sx * sz) / den;
    Some((slope, (sz - slope * sx) / n))
}

/// Signal divided by the mean signal at the lowest b-value
struct NormalizedSignal {
    scale: f64,
    values: Vec<f64>,
}

fn normalize(bvals: &[f64], measured: &[f64]) -> Result<NormalizedSignal> {
    if bvals.len() != measured.len() {
        return Err(IvimError::ShapeMismatch(format!(
            "{} b-values for {} signal samples", bvals.len(), measured.len()
        )));
    }
    if measured.iter().any(|v| !v.is_finite()) {
        return Err(IvimError::FitConvergence { reason: "non-finite signal" });
    }
    let b_min = bvals.iter().cloned().fold(f64::INFINITY, f64::min);
    let low: Vec<f64> = bvals
        .iter()
        .zip(measured)
        .filter(|(&b, _)| b == b_min)
        .map(|(_, &y)| y)
        .collect();
    let scale = low.iter().sum::<f64>() / low.len().max(1) as f64;
    if !(scale > 0.0) {
        return Err(IvimError::FitConvergence {
            reason: "non-positive signal at the lowest b-value",
        });
    }
    Ok(NormalizedSignal { scale, values: measured.iter().map(|v| v / scale).collect() })
}

/// Stage 1 on a normalized signal; returns (1, f, D, D*) clamped to the bounds
fn segmented_normalized(bvals: &[f64], yn: &[f64], params: &FitParams) -> Result<[f64; 4]> {
    let (hx, hz): (Vec<f64>, Vec<f64>) = bvals
        .iter()
        .zip(yn)
        .filter(|(&b, &y)| b >= params.b_threshold && y > 0.0)
        .map(|(&b, &y)| (b, y.ln()))
        .unzip();
    let (slope, intercept) = linear_fit(&hx, &hz).ok_or(IvimError::FitConvergence {
        reason: "fewer than two positive samples above the b threshold",
    })?;

    let d = clamp(-slope, 0.0, params.d_max);
    let s0_tissue = intercept.exp();
    let f = clamp(1.0 - s0_tissue, 0.0, 1.0);

    // Perfusion excess at low b
    let (lx, lz): (Vec<f64>, Vec<f64>) = bvals
        .iter()
        .zip(yn)
        .filter(|(&b, _)| b < params.b_threshold)
        .filter_map(|(&b, &y)| {
            let excess = y - s0_tissue * (-b * d).exp();
            if excess > 0.0 {
                Some((b, excess.ln()))
            } else {
                None
            }
        })
        .unzip();

    let dstar = match linear_fit(&lx, &lz) {
        Some((slope, _)) if slope.is_finite() && -slope > d => -slope,
        _ if d > 0.0 => 10.0 * d,
        _ => 0.01,
    };
    let dstar = clamp(dstar, d, params.dstar_max);

    Ok([1.0, f, d, dstar])
}

/// Joint least-squares problem on a normalized signal
struct IvimProblem<'a> {
    bvals: &'a [f64],
    yn: &'a [f64],
    params: &'a FitParams,
}

impl IvimProblem<'_> {
    fn lower(&self, x: &[f64]) -> Vec<f64> {
        vec![self.params.s0_bounds.0, 0.0, 0.0, x[2]]
    }

    fn upper(&self) -> Vec<f64> {
        vec![self.params.s0_bounds.1, 1.0, self.params.d_max, self.params.dstar_max]
    }
}

impl LeastSquaresProblem for IvimProblem<'_> {
    fn n_params(&self) -> usize {
        4
    }

    fn cost(&self, x: &[f64]) -> f64 {
        let p = IvimParameters::from_slice(x);
        self.bvals
            .iter()
            .zip(self.yn)
            .map(|(&b, &y)| (signal(&p, b) - y).powi(2))
            .sum()
    }

    fn normal_equations(&self, x: &[f64]) -> Option<NormalEquations> {
        let p = IvimParameters::from_slice(x);
        let mut jtj = vec![0.0; 16];
        let mut jtr = vec![0.0; 4];
        let mut cost = 0.0;
        for (&b, &y) in self.bvals.iter().zip(self.yn) {
            let r = signal(&p, b) - y;
            let j = jacobian_row(&p, b);
            for a in 0..4 {
                jtr[a] += j[a] * r;
                for c in 0..4 {
                    jtj[a * 4 + c] += j[a] * j[c];
                }
            }
            cost += r * r;
        }
        if jtj.iter().chain(&jtr).all(|v| v.is_finite()) {
            Some(NormalEquations { jtj, jtr, cost })
        } else {
            None
        }
    }

    fn bounds(&self, x: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
        Some((self.lower(x), self.upper()))
    }

    fn project(&self, x: &mut [f64]) {
        let (s0_lo, s0_hi) = self.params.s0_bounds;
        x[0] = clamp(x[0], s0_lo, s0_hi);
        x[1] = clamp(x[1], 0.0, 1.0);
        // D first: it is the lower bound of D*
        x[2] = clamp(x[2], 0.0, self.params.d_max);
        x[3] = clamp(x[3], x[2], self.params.dstar_max);
    }
}

fn denormalize(x: &[f64], scale: f64) -> IvimParameters {
    IvimParameters { s0: x[0] * scale, f: x[1], d: x[2], dstar: x[3] }
}

/// Stage 1 estimate projected onto the feasible box
fn starting_point(problem: &IvimProblem<'_>) -> Result<[f64; 4]> {
    let mut x0 = segmented_normalized(problem.bvals, problem.yn, problem.params)?;
    problem.project(&mut x0);
    Ok(x0)
}

/// Stage 1 only: segmented log-linear estimate
pub fn segmented_fit(
    bvals: &[f64],
    measured: &[f64],
    params: &FitParams,
) -> Result<IvimParameters> {
    let norm = normalize(bvals, measured)?;
    let problem = IvimProblem { bvals, yn: &norm.values, params };
    let x = starting_point(&problem)?;
    Ok(denormalize(&x, norm.scale))
}

/// Both stages, reporting the solver outcome
///
/// Errors only if stage 1 cannot produce a starting point.
pub fn fit_voxel_detailed(
    bvals: &[f64],
    measured: &[f64],
    params: &FitParams,
) -> Result<VoxelFit> {
    let norm = normalize(bvals, measured)?;
    let problem = IvimProblem { bvals, yn: &norm.values, params };
    let x0 = starting_point(&problem)?;
    let result = levenberg_marquardt(&problem, &x0, &params.lm_options());

    Ok(VoxelFit {
        segmented: denormalize(&x0, norm.scale),
        joint: denormalize(&result.x, norm.scale),
        status: result.status,
        iterations: result.iterations,
    })
}

/// Fit one voxel's signal curve
///
/// # Errors
/// `FitConvergence` if the signal is unusable, the normal equations are
/// singular, or the iteration budget runs out.
pub fn fit_voxel(bvals: &[f64], measured: &[f64], params: &FitParams) -> Result<IvimParameters> {
    let fit = fit_voxel_detailed(bvals, measured, params)?;
    match fit.status {
        LmStatus::Converged if fit.joint.is_finite() => Ok(fit.joint),
        LmStatus::Converged => Err(IvimError::FitConvergence { reason: "non-finite estimate" }),
        LmStatus::Singular => {
            Err(IvimError::FitConvergence { reason: "singular normal equations" })
        }
        LmStatus::MaxIterations => Err(IvimError::FitConvergence { reason: BUDGET_EXHAUSTED }),
    }
}

/// Fit every masked voxel of a motion-corrected series
///
/// Voxels outside the mask and voxels whose fit fails hold the sentinel 0 in
/// every map. Failures are counted, not propagated.
pub fn fit_ivim(
    image: &ImageVolume,
    gtab: &GradientTable,
    mask: &Mask,
    params: &FitParams,
) -> Result<(ParameterMapSet, FitSummary)> {
    params.validate()?;
    gtab.check_volumes(image.n_volumes())?;
    mask.check_dims(image.spatial_dims())?;

    let bvals = gtab.bvals();
    let indices = mask.indices();
    info!("Fitting IVIM model in {} voxels", indices.len());

    let results: Vec<(usize, Result<IvimParameters>)> = indices
        .par_iter()
        .map(|&voxel| (voxel, fit_voxel(&bvals, &image.voxel_signal(voxel), params)))
        .collect();

    let mut maps = ParameterMapSet::new(image.spatial_dims(), image.voxel_size, image.affine);
    let mut summary = FitSummary::default();
    for (voxel, result) in results {
        match result {
            Ok(p) => {
                maps.set(voxel, &p);
                summary.fitted += 1;
            }
            Err(e) => {
                debug!("voxel {}: {}", voxel, e);
                summary.failed += 1;
                if matches!(e, IvimError::FitConvergence { reason: BUDGET_EXHAUSTED }) {
                    summary.exhausted += 1;
                }
            }
        }
    }

    let total = summary.fitted + summary.failed;
    if summary.exhausted > 0 {
        warn!(
            "{} of {} voxels used all {} iterations without converging and were set to 0",
            summary.exhausted, total, params.max_iter
        );
    }
    let unusable = summary.failed - summary.exhausted;
    if unusable > 0 {
        warn!(
            "{} of {} voxels had an unusable signal or singular fit and were set to 0",
            unusable, total
        );
    }

    Ok((maps, summary))
}
