use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use robovision_core::{
    AcceptanceBand, FaceMatch, LabelRegistry, LbphRecognizer, ModelSlot, ScrfdDetector, Trainer,
    TrainingEvent,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_training, TrainingJob};

#[derive(Parser)]
#[command(name = "robovision", about = "RoboVision face identity training and recognition")]
struct Cli {
    /// Directory holding the trained label registry and model (overrides ROBOVISION_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Directory holding det_10g.onnx (overrides ROBOVISION_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train identities from a directory of per-person image folders
    Train {
        /// Dataset root; each subdirectory name becomes a label
        #[arg(short, long)]
        dataset: Option<PathBuf>,
    },
    /// Recognize faces in still images using the trained model
    Recognize {
        /// Images to process
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Exclusive lower bound of accepted match distance
        #[arg(long)]
        low: Option<f64>,
        /// Inclusive upper bound of accepted match distance
        #[arg(long)]
        high: Option<f64>,
        /// Print one JSON object per image
        #[arg(long)]
        json: bool,
    },
    /// List the identities of the trained model
    Labels,
}

#[derive(Serialize)]
struct ImageReport<'a> {
    image: &'a std::path::Path,
    faces: &'a [FaceMatch],
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }

    match cli.command {
        Commands::Train { dataset } => {
            if let Some(dataset) = dataset {
                config.dataset_dir = dataset;
            }
            train(&config).await
        }
        Commands::Recognize {
            images,
            low,
            high,
            json,
        } => {
            if let Some(low) = low {
                config.accept_low = low;
            }
            if let Some(high) = high {
                config.accept_high = high;
            }
            recognize(&config, &images, json)
        }
        Commands::Labels => labels(&config),
    }
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    let path = config.detector_model_path();
    let detector = ScrfdDetector::load(&path)
        .with_context(|| format!("loading face detector {}", path.display()))?;
    Ok(detector.with_confidence_threshold(config.detect_confidence))
}

async fn train(config: &Config) -> Result<()> {
    let detector = load_detector(config)?;
    let job = TrainingJob {
        dataset_dir: config.dataset_dir.clone(),
        artifacts: config.artifacts(),
        trainer: Trainer::new(detector, LbphRecognizer::default()),
    };

    println!("Training from {}", config.dataset_dir.display());
    let (mut events, done) = spawn_training(job)?.split();
    while let Some(event) = events.recv().await {
        match event {
            TrainingEvent::DirectoryEntered { name } => println!("checking {name}"),
            TrainingEvent::ImageProcessed { label, path, faces } => {
                println!("  {label}: {} ({faces} face(s))", path.display())
            }
            TrainingEvent::ImageSkipped { path, reason } => {
                println!("  skipped {}: {reason}", path.display())
            }
            TrainingEvent::Finished { .. } => {}
        }
    }

    let summary = done.await.context("training failed")?;
    println!(
        "Trained {} identities from {} samples ({} images, {} skipped)",
        summary.identities, summary.samples, summary.images, summary.skipped_images
    );
    println!("  labels: {}", summary.artifacts.labels.display());
    println!("  model:  {}", summary.artifacts.model.display());
    Ok(())
}

fn recognize(config: &Config, images: &[PathBuf], json: bool) -> Result<()> {
    let band: AcceptanceBand = config.band()?;
    let slot: ModelSlot = ModelSlot::new();
    slot.load_and_publish(&config.artifacts(), band)
        .context("loading trained model; run `robovision train` first")?;
    let mut detector = load_detector(config)?;

    for path in images {
        let frame = image::open(path)
            .with_context(|| format!("reading {}", path.display()))?
            .to_luma8();
        let model = slot.current().context("no model published")?;
        let faces = model.detect_and_recognize(&mut detector, &frame)?;

        if json {
            println!("{}", serde_json::to_string(&ImageReport { image: path, faces: &faces })?);
            continue;
        }
        println!("{}: {} face(s)", path.display(), faces.len());
        for face in &faces {
            let d = &face.decision;
            match &d.label {
                Some(name) => println!("  {} -> {name} (confidence {:.1})", face.region, d.confidence),
                None => println!("  {} -> unknown (confidence {:.1})", face.region, d.confidence),
            }
        }
    }
    Ok(())
}

fn labels(config: &Config) -> Result<()> {
    let path = config.artifacts().labels;
    let registry = LabelRegistry::load(&path).with_context(|| format!("loading {}", path.display()))?;
    if registry.is_empty() {
        println!("No identities trained");
        return Ok(());
    }
    for (id, label) in registry.iter() {
        println!("{id}\t{label}");
    }
    Ok(())
}
