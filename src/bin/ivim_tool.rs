//! Command-line IVIM mapping
//!
//! Single subject:
//!     ivim_tool dwi.nii.gz dwi.bval dwi.bvec dwi_brain_mask.nii.gz
//! Every subject in a directory (`<name>.bval` next to `<name>.nii.gz`):
//!     ivim_tool --dir /data/ivim

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info};

use ivim_core::config::IvimConfig;
use ivim_core::pipeline::{discover_subjects, run_subject, SubjectPaths, SubjectStatus};

#[derive(Parser, Debug)]
#[command(author, version, about = "Fit IVIM parameter maps to diffusion MRI series")]
struct Args {
    /// Diffusion-weighted series (.nii or .nii.gz)
    image: Option<PathBuf>,

    /// b-values (defaults to <base>.bval)
    bval: Option<PathBuf>,

    /// b-vectors (defaults to <base>.bvec)
    bvec: Option<PathBuf>,

    /// Brain mask (defaults to <base>_brain_mask.nii.gz)
    mask: Option<PathBuf>,

    /// Process every subject found in this directory
    #[arg(short, long, conflicts_with = "image")]
    dir: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write the denoised series
    #[arg(long)]
    save_denoised: bool,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Seconds))
        .init();
}

fn subjects(args: &Args) -> Result<Vec<SubjectPaths>> {
    if let Some(dir) = &args.dir {
        let found = discover_subjects(dir).with_context(|| format!("scanning {}", dir.display()))?;
        info!("Found {} subjects in {}", found.len(), dir.display());
        return Ok(found);
    }
    let Some(image) = &args.image else {
        bail!("either an image path or --dir is required");
    };
    let mut paths = SubjectPaths::from_image(image);
    if let Some(bval) = &args.bval {
        paths.bval = bval.clone();
    }
    if let Some(bvec) = &args.bvec {
        paths.bvec = bvec.clone();
    }
    if let Some(mask) = &args.mask {
        paths.mask = mask.clone();
    }
    Ok(vec![paths])
}

fn run(args: &Args) -> Result<bool> {
    let mut config = match &args.config {
        Some(path) => IvimConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IvimConfig::default(),
    };
    config.save_denoised |= args.save_denoised;

    let mut all_ok = true;
    for paths in subjects(args)? {
        match run_subject(&paths, &config) {
            Ok(report) => {
                if report.status == SubjectStatus::Completed {
                    info!(
                        "{}: {} voxels fitted, {} failed ({} out of iterations), \
                         {} registration warnings",
                        report.base.display(),
                        report.fit.fitted,
                        report.fit.failed,
                        report.fit.exhausted,
                        report.registration_warnings.len()
                    );
                }
            }
            Err(e) => {
                error!("{}: {}", paths.base.display(), e);
                all_ok = false;
            }
        }
    }
    Ok(all_ok)
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
