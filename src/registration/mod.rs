//! Volume registration and motion correction
//!
//! - `transform`: staged transform models and voxel-space affines
//! - `interpolate`: trilinear sampling with gradients
//! - `motion`: per-volume registration of a series, with on-disk caching

pub mod interpolate;
pub mod motion;
pub mod transform;

pub use motion::{
    load_cached, motion_correction, motion_correction_cached, resample, AffineRegistration,
    MotionCorrectionResult, RegistrationParams, VolumeAlignment, VolumeRegistration, MOCO_STAGE,
};
pub use transform::{AffineTransform, TransformModel};
