//! IVIM model and voxel-wise fitting
//!
//! - `model`: biexponential signal and its derivatives
//! - `fit`: segmented then joint bounded least squares
//! - `maps`: parameter maps and output naming

pub mod fit;
pub mod maps;
pub mod model;

pub use fit::{
    fit_ivim, fit_voxel, fit_voxel_detailed, segmented_fit, FitParams, FitSummary, VoxelFit,
    BUDGET_EXHAUSTED,
};
pub use maps::{write_maps, MapPaths, ParameterMapSet};
pub use model::{predict, signal, sum_squared_residuals, IvimParameters};
