//! Rechunk the arrays of multiscale Zarr image pyramids in place.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use zarrs_rechunk::{OverwriteMode, RechunkConfig, RechunkStatus, run_batch};

/// How a rechunked array replaces the original.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Write the new chunks over the original array.
    Direct,
    /// Write to `<level>_tmp`, then replace the original array.
    Staged,
}

impl From<Mode> for OverwriteMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Direct => Self::Direct,
            Mode::Staged => Self::Staged,
        }
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "zarrs_rechunk_cli")]
#[command(about = "Rechunk the arrays of multiscale Zarr image pyramids in place")]
struct Args {
    /// Path to the JSON rechunk configuration
    #[arg(long)]
    config: PathBuf,

    /// Validate every array without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Rewrite arrays that already have the target chunk shape
    #[arg(long)]
    force: bool,

    /// Override the overwrite mode of the configuration
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

type Result<T> = std::result::Result<T, anyhow::Error>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RechunkConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config.dry_run |= args.dry_run;
    config.force |= args.force;
    if let Some(mode) = args.mode {
        config.overwrite_mode = mode.into();
    }

    let report = run_batch(&config).with_context(|| {
        format!(
            "failed to rechunk {} (configured by {})",
            config.root_path.display(),
            args.config.display()
        )
    })?;

    for array in &report.arrays {
        log::debug!("{}: {} ({} chunks)", array.path, array.status, array.chunks_written);
    }
    if config.dry_run {
        log::info!(
            "dry run: {} arrays would be rechunked",
            report.count(RechunkStatus::Planned)
        );
    }

    Ok(())
}
