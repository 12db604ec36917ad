use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use nshare::AsNdarray2;
use tracing_subscriber::EnvFilter;

use vessel_seg::{
    codec, config::check_format, overlay, Config, ImageInput, ImageProcessor, ModelManager,
    PredictionResult, Predictor,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Segment one image and print the result as JSON
    Predict {
        image: PathBuf,

        /// Write the mask here instead of embedding it in the JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write a red-tinted overlay of the mask on the input image
        #[arg(long)]
        overlay: Option<PathBuf>,

        #[command(flatten)]
        config: Config,
    },
    /// Segment every image under a directory tree
    Batch {
        input_dir: PathBuf,

        #[arg(default_value = "output")]
        output_dir: PathBuf,

        #[arg(short, long, default_value_t = String::from("png"), value_parser = check_format)]
        format: String,

        /// Also write `<stem>_overlay.<format>` next to every mask
        #[arg(long)]
        overlays: bool,

        #[command(flatten)]
        config: Config,
    },
    /// Load the model, run the self-test and print the health report
    Health {
        #[command(flatten)]
        config: Config,
    },
    /// Load the model and print what was loaded
    Info {
        #[command(flatten)]
        config: Config,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vessel_seg=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Predict {
            image,
            output,
            overlay,
            config,
        } => predict(image, output, overlay, config),
        Command::Batch {
            input_dir,
            output_dir,
            format,
            overlays,
            config,
        } => {
            ensure!(input_dir.is_dir(), "Input directory does not exist");
            let predictor = load_predictor(config)?;
            let summary = ImageProcessor::new(&predictor, input_dir, output_dir, format)
                .with_overlays(overlays)
                .process_directory(true)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Health { config } => {
            let predictor = load_predictor(config)?;
            let health = predictor.health_check();
            println!("{}", serde_json::to_string_pretty(&health)?);
            ensure!(health.is_healthy(), "service is unhealthy");
            Ok(())
        }
        Command::Info { config } => {
            let predictor = load_predictor(config)?;
            println!("{}", serde_json::to_string_pretty(&predictor.model_info())?);
            Ok(())
        }
    }
}

fn load_predictor(config: Config) -> Result<Predictor> {
    config.validate()?;
    let manager = ModelManager::new(config);
    manager.load().context("Failed to load any segmentation model")?;
    Ok(Predictor::new(Arc::new(manager)))
}

fn predict(
    image_path: PathBuf,
    output: Option<PathBuf>,
    overlay_path: Option<PathBuf>,
    config: Config,
) -> Result<()> {
    let bytes = fs::read(&image_path)
        .with_context(|| format!("Failed to read image: {}", image_path.display()))?;
    let predictor = load_predictor(config)?;

    if output.is_none() && overlay_path.is_none() {
        let result = predictor.predict(ImageInput::Bytes(bytes));
        println!("{}", serde_json::to_string_pretty(&result)?);
        ensure!(result.success, "{}", result.message);
        return Ok(());
    }

    let image = codec::decode_bytes(&bytes)?;
    let segmentation = predictor
        .segment(image.clone())
        .with_context(|| format!("Prediction failed for {}", image_path.display()))?;

    if let Some(overlay_path) = overlay_path {
        let tinted = overlay::render(&image, &segmentation.mask, overlay::DEFAULT_ALPHA)?;
        tinted
            .save(&overlay_path)
            .with_context(|| format!("Failed to save overlay: {}", overlay_path.display()))?;
    }
    let mask = match output {
        Some(output) => {
            segmentation
                .mask
                .save(&output)
                .with_context(|| format!("Failed to save mask: {}", output.display()))?;
            None
        }
        None => Some(codec::encode(
            segmentation.mask.as_ndarray2().into_dyn(),
            "png",
        )?),
    };

    let processing_time = segmentation.metrics.processing_time;
    let result = PredictionResult::from_segmentation(&segmentation, mask, processing_time);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
