//! spotfilter CLI: band-pass / top-hat filtering of tiled microscopy volumes.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use spotfilter::app::{load_config, run_extract, write_json, ExtractConfig};
use spotfilter::{build_radial_profile, default_r2, expand_to_nd, CancelToken};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spotfilter")]
#[command(about = "Filter raw microscopy tiles with a zero-sum band-pass kernel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter every (tile, round, channel) listed in a JSON config.
    Run(RunArgs),

    /// Print the band-pass profile and kernel statistics for given radii.
    Kernel {
        /// Inner radius in pixels.
        #[arg(long)]
        r1: usize,
        /// Outer radius in pixels (default: 2 * r1).
        #[arg(long)]
        r2: Option<usize>,
        /// Build the 3-D kernel instead of the 2-D one.
        #[arg(long)]
        is_3d: bool,
        /// Also write the taps as JSON.
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// Path to the JSON config.
    #[arg(long)]
    config: PathBuf,

    /// Override `input_dir`.
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Override `output_dir`.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override `r1` (pixels).
    #[arg(long)]
    r1: Option<usize>,

    /// Override `r2` (pixels).
    #[arg(long)]
    r2: Option<usize>,

    /// Override `scale`.
    #[arg(long)]
    scale: Option<f32>,

    /// Override `scale_anchor`.
    #[arg(long)]
    scale_anchor: Option<f32>,

    /// Recompute jobs whose output already exists.
    #[arg(long)]
    overwrite: bool,

    /// Write the batch summary to this JSON file.
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn apply_overrides(cfg: &mut ExtractConfig, args: &RunArgs) {
    if let Some(dir) = &args.input_dir {
        cfg.input_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.output_dir {
        cfg.output_dir = Some(dir.clone());
    }
    if let Some(r1) = args.r1 {
        cfg.r1 = Some(r1);
    }
    if let Some(r2) = args.r2 {
        cfg.r2 = Some(r2);
    }
    if let Some(scale) = args.scale {
        cfg.scale = Some(scale);
    }
    if let Some(scale) = args.scale_anchor {
        cfg.scale_anchor = Some(scale);
    }
    if args.overwrite {
        cfg.overwrite = Some(true);
    }
    if let Some(path) = &args.summary_json {
        cfg.summary_json = Some(path.clone());
    }
}

fn run(args: &RunArgs) -> Result<()> {
    let mut cfg = load_config(&args.config)?;
    apply_overrides(&mut cfg, args);
    init_tracing(cfg.log_level.as_deref().unwrap_or("info"));

    let summary = run_extract(&cfg, &CancelToken::new())?;
    println!(
        "written {}  skipped {}  failed {}  cancelled {}",
        summary.written, summary.skipped, summary.failed, summary.cancelled
    );
    if let Some(scale) = summary.scale {
        println!("scale {scale}");
    }
    if let Some(scale) = summary.scale_anchor {
        println!("scale_anchor {scale}");
    }
    if !summary.is_success() {
        bail!("{} job(s) did not complete", summary.failed + summary.cancelled);
    }
    Ok(())
}

fn kernel(r1: usize, r2: Option<usize>, is_3d: bool, json: Option<PathBuf>) -> Result<()> {
    init_tracing("warn");
    let r2 = r2.unwrap_or_else(|| default_r2(r1));
    let profile = build_radial_profile(r1, r2).context("building profile")?;
    let kernel = expand_to_nd(&profile, if is_3d { 3 } else { 2 })?;

    println!("r1 {r1}  r2 {r2}  scale {}", kernel.scale());
    println!("profile taps {:?}  sum {}", profile.taps(), profile.sum());
    let h = kernel.half_extent();
    let centre = kernel.weights()[[h[0], h[1], h[2]]];
    println!(
        "kernel shape {:?}  sum {}  centre {centre}",
        kernel.shape(),
        kernel.sum()
    );
    if let Some(path) = json {
        write_json(
            &path,
            &serde_json::json!({
                "r1": r1,
                "r2": r2,
                "scale": kernel.scale(),
                "taps": profile.taps(),
                "shape": kernel.shape(),
            }),
        )?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(&args),
        Commands::Kernel {
            r1,
            r2,
            is_3d,
            json,
        } => kernel(r1, r2, is_3d, json),
    }
}
