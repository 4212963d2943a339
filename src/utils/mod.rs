//! Utility functions

pub mod mask;

pub use mask::Mask;
