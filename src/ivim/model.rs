//! Biexponential IVIM signal model
//!
//! S(b) = S0 · [f·exp(-b·D*) + (1-f)·exp(-b·D)]
//!
//! The first exponential is the fast, perfusion-driven pseudo-diffusion
//! compartment; the second is tissue diffusion.
//!
//! Reference:
//! Le Bihan, D., Breton, E., Lallemand, D., Aubin, M.L., Vignaud, J., Laval-Jeantet, M. (1988).
//! "Separation of diffusion and perfusion in intravoxel incoherent motion MR imaging."
//! Radiology, 168(2):497-505. https://doi.org/10.1148/radiology.168.2.3393671

/// Fitted IVIM parameters of one voxel
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IvimParameters {
    /// Unattenuated signal amplitude
    pub s0: f64,
    /// Perfusion fraction
    pub f: f64,
    /// Tissue diffusion coefficient (mm²/s)
    pub d: f64,
    /// Pseudo-diffusion coefficient (mm²/s)
    pub dstar: f64,
}

impl IvimParameters {
    /// Written for masked-out and failed voxels
    pub const SENTINEL: IvimParameters = IvimParameters { s0: 0.0, f: 0.0, d: 0.0, dstar: 0.0 };

    pub fn to_array(&self) -> [f64; 4] {
        [self.s0, self.f, self.d, self.dstar]
    }

    pub fn from_slice(x: &[f64]) -> Self {
        Self { s0: x[0], f: x[1], d: x[2], dstar: x[3] }
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// Model signal at one b-value
#[inline]
pub fn signal(params: &IvimParameters, b: f64) -> f64 {
    params.s0 * (params.f * (-b * params.dstar).exp() + (1.0 - params.f) * (-b * params.d).exp())
}

/// Model signal at every b-value
pub fn predict(params: &IvimParameters, bvals: &[f64]) -> Vec<f64> {
    bvals.iter().map(|&b| signal(params, b)).collect()
}

/// Partial derivatives of the signal with respect to (S0, f, D, D*)
#[inline]
pub fn jacobian_row(params: &IvimParameters, b: f64) -> [f64; 4] {
    let e_fast = (-b * params.dstar).exp();
    let e_slow = (-b * params.d).exp();
    [
        params.f * e_fast + (1.0 - params.f) * e_slow,
        params.s0 * (e_fast - e_slow),
        -params.s0 * (1.0 - params.f) * b * e_slow,
        -params.s0 * params.f * b * e_fast,
    ]
}

/// Sum of squared residuals between the model and a measured signal
pub fn sum_squared_residuals(params: &IvimParameters, bvals: &[f64], measured: &[f64]) -> f64 {
    bvals
        .iter()
        .zip(measured)
        .map(|(&b, &y)| {
            let r = signal(params, b) - y;
            r * r
        })
        .sum()
}
