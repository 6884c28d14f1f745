use std::path::PathBuf;

use anyhow::Result;
use beverage_classifier::{artifact::ProjectLayout, inference, logging};
use burn::backend::{wgpu::{AutoGraphicsApi, WgpuDevice}, Wgpu};
use clap::Parser;

type MyBackend = Wgpu<AutoGraphicsApi, f32, i32>;

/// Classify one image with the model saved by `train`
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project root holding dataset/ and models/
    #[arg(short, long, default_value = ".")]
    project_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("{}", e);
    }

    let layout = ProjectLayout::new(cli.project_dir);
    let device = WgpuDevice::BestAvailable;

    let mut input = std::io::stdin().lock();
    let mut output = std::io::stdout();
    inference::run::<MyBackend, _, _>(&mut input, &mut output, &layout, &device)?;

    Ok(())
}
