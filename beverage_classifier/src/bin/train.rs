use std::path::PathBuf;

use anyhow::{Context, Result};
use beverage_classifier::{artifact::{save_model, ProjectLayout}, logging, training::{self, BackboneInit, TrainingConfig}};
use burn::backend::{wgpu::{AutoGraphicsApi, WgpuDevice}, Autodiff, Wgpu};
use clap::Parser;

type MyBackend = Wgpu<AutoGraphicsApi, f32, i32>;
type MyAutodiffBackend = Autodiff<MyBackend>;

/// Fine-tune the beverage classifier on dataset/train and save it under models/
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project root holding dataset/ and models/
    #[arg(short, long, default_value = ".")]
    project_dir: PathBuf,

    /// torchvision MobileNetV2 ImageNet weights [default: <project-dir>/models/mobilenet_v2.pth]
    #[arg(short, long)]
    backbone_weights: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("{}", e);
    }

    println!("\n=== Training MobileNetV2 model ===\n");

    let layout = ProjectLayout::new(cli.project_dir);
    let weights = cli.backbone_weights.unwrap_or_else(|| layout.backbone_weights());
    let config = TrainingConfig::with_default_optimizer();
    let device = WgpuDevice::BestAvailable;

    let trained = training::train::<MyAutodiffBackend>(&layout, &config, BackboneInit::ImageNet(weights), device)
        .context("Training failed")?;

    println!("\nFinal Evaluation (Validation Set)");
    println!("{}\n", trained.scores);

    let model_path = save_model(&layout, trained.model, &trained.metadata)
        .context("Failed to save the trained model")?;
    println!("Model saved at {}\n", model_path.display());

    Ok(())
}
