//! Numerical solvers
//!
//! - `dense`: Gaussian elimination for small normal equations
//! - `levenberg_marquardt`: box-projected damped least squares

pub mod dense;
pub mod levenberg_marquardt;

pub use levenberg_marquardt::{
    levenberg_marquardt, LeastSquaresProblem, LmOptions, LmResult, LmStatus, NormalEquations,
};
