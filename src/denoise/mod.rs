//! Noise characterization and denoising
//!
//! - `noise_estimate`: per-volume noise sigma with coil-count bias correction
//! - `nlmeans`: non-local means filter with optional Rician correction

pub mod noise_estimate;
pub mod nlmeans;

pub use noise_estimate::{correction_factor, estimate_sigma, NoiseMap, NoiseParams};
pub use nlmeans::{nlmeans, nlmeans_3d, NlmeansParams};
