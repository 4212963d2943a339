//! IVIM-Core: intravoxel incoherent motion mapping for diffusion MRI
//!
//! This crate estimates perfusion fraction, pseudo-diffusion, diffusion and
//! signal amplitude maps from multi-shell diffusion-weighted series.
//!
//! # Modules
//! - `denoise`: Noise estimation and non-local means denoising
//! - `registration`: Motion correction (staged affine registration)
//! - `ivim`: Biexponential model, two-stage fitting, parameter maps
//! - `solvers`: Dense linear solves and bounded Levenberg–Marquardt
//! - `pipeline`: Per-subject pipeline with resume and caching
//! - `utils`: Masks

// Core modules
pub mod error;
pub mod volume;
pub mod config;
pub mod cache;

// Algorithm modules
pub mod denoise;
pub mod registration;
pub mod ivim;
pub mod solvers;
pub mod utils;

// I/O modules
pub mod nifti_io;
pub mod gradients;

// Subject processing
pub mod pipeline;

pub use error::{IvimError, Result};
