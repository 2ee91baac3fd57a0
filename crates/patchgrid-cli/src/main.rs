//! patchgrid CLI — build a memory bank from known-good images and score
//! query images against it.
//!
//! The bank lives only for the duration of the run: `inspect` fits on
//! the normal set and scores the queries in one process, writing a JSON
//! report plus heatmap and segmentation-mask PNGs per query.

use clap::{Args, Parser, Subcommand};
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array3;
use std::fs;
use std::path::{Path, PathBuf};

use patchgrid_core::{
    AnomalyDetector, AnomalyResult, BankConfig, DetectorConfig, FitSummary, OnnxBackbone,
    OnnxConfig, PatchConfig,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "patchgrid")]
#[command(about = "Detect visual anomalies by nearest-neighbor matching against a bank of known-good patch features")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a memory bank on normal images and score query images.
    Inspect(InspectArgs),

    /// Print the inputs and outputs of an exported backbone model.
    ModelInfo {
        /// Path to the ONNX model file.
        #[arg(long)]
        model: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct InspectArgs {
    /// Directory of known-good images (jpg/jpeg/png/bmp).
    #[arg(long)]
    normal_dir: PathBuf,

    /// Query image(s) to score. Repeatable.
    #[arg(long = "image", required = true)]
    images: Vec<PathBuf>,

    /// Directory for the report and rendered maps.
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,

    /// Path to the exported backbone model (ONNX).
    #[arg(long)]
    model: PathBuf,

    /// Name of the model's image input.
    #[arg(long, default_value = "input")]
    input_name: String,

    /// Names of the two feature outputs, shallower tap first.
    #[arg(long, num_args = 2, default_values = ["layer2", "layer3"])]
    feature_outputs: Vec<String>,

    /// Square working resolution images are resized to before entering
    /// the backbone.
    #[arg(long, default_value = "224")]
    input_size: u32,

    /// Fraction of pooled patch descriptors kept in the bank.
    #[arg(long, default_value = "0.1")]
    sampling_fraction: f64,

    /// RNG seed for bank subsampling.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Side of the stride-1 smoothing window applied to feature maps.
    #[arg(long, default_value = "3")]
    smooth_window: usize,

    /// Threshold multiplier for the segmentation mask.
    #[arg(long, default_value = "1.25")]
    mask_margin: f32,

    /// Intra-op thread count for the inference runtime (0 = auto).
    #[arg(long, default_value = "0")]
    threads: usize,
}

/// Per-query entry of the JSON report.
#[derive(Debug, serde::Serialize)]
struct QueryReport {
    image: String,
    score: f32,
    normalized: f32,
    verdict: String,
    heatmap: String,
    mask: String,
}

/// Full report for one `inspect` run.
#[derive(Debug, serde::Serialize)]
struct InspectReport {
    bank: FitSummary,
    queries: Vec<QueryReport>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Inspect(args) => run_inspect(&args),
        Commands::ModelInfo { model } => run_model_info(&model),
    };
    if let Err(err) = result {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

fn run_model_info(model: &Path) -> CliResult<()> {
    let backbone = OnnxBackbone::load(OnnxConfig {
        model_path: model.to_path_buf(),
        ..OnnxConfig::default()
    });
    match backbone {
        Ok(b) => {
            println!("model:   {}", b.config().model_path.display());
            println!("input:   {}", b.config().input_name);
            println!("outputs: {:?}", b.config().feature_outputs);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn run_inspect(args: &InspectArgs) -> CliResult<()> {
    let backbone = OnnxBackbone::load(OnnxConfig {
        model_path: args.model.clone(),
        input_name: args.input_name.clone(),
        feature_outputs: [
            args.feature_outputs[0].clone(),
            args.feature_outputs[1].clone(),
        ],
        intra_threads: args.threads,
    })?;

    let config = DetectorConfig {
        patch: PatchConfig {
            smooth_window: args.smooth_window,
        },
        bank: BankConfig {
            sampling_fraction: args.sampling_fraction,
            seed: args.seed,
        },
        mask_margin: args.mask_margin,
    };
    let detector = AnomalyDetector::with_config(backbone, config);

    let normal_paths = list_images(&args.normal_dir)?;
    if normal_paths.is_empty() {
        return Err(format!(
            "no images found under '{}'",
            args.normal_dir.display()
        )
        .into());
    }
    tracing::info!(
        "loading {} normal images from '{}'",
        normal_paths.len(),
        args.normal_dir.display()
    );
    let normal: Vec<Array3<f32>> = normal_paths
        .iter()
        .map(|p| load_tensor(p, args.input_size))
        .collect::<CliResult<_>>()?;

    let summary = detector.fit(&normal)?;
    tracing::info!(
        "memory bank ready: {} descriptors, threshold {:.6}",
        summary.kept_vectors,
        summary.threshold
    );

    fs::create_dir_all(&args.out_dir)?;
    let mut queries = Vec::with_capacity(args.images.len());
    for path in &args.images {
        let tensor = load_tensor(path, args.input_size)?;
        let result = detector.score(&tensor)?;
        tracing::info!(
            "{}: score {:.6} (normalized {:.2}) -> {}",
            path.display(),
            result.score,
            result.normalized,
            result.verdict
        );

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "query".to_string());
        let heatmap_path = args.out_dir.join(format!("{}_heatmap.png", stem));
        let mask_path = args.out_dir.join(format!("{}_mask.png", stem));
        render_heatmap(&result, summary.threshold).save(&heatmap_path)?;
        render_mask(&result).save(&mask_path)?;

        queries.push(QueryReport {
            image: path.display().to_string(),
            score: result.score,
            normalized: result.normalized,
            verdict: result.verdict.to_string(),
            heatmap: heatmap_path.display().to_string(),
            mask: mask_path.display().to_string(),
        });
    }

    let report = InspectReport {
        bank: summary,
        queries,
    };
    let report_path = args.out_dir.join("report.json");
    fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;
    tracing::info!("report written to {}", report_path.display());
    Ok(())
}

/// Collect image files directly under `dir`, sorted for reproducibility.
fn list_images(dir: &Path) -> CliResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("jpg" | "jpeg" | "png" | "bmp")) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Decode, resize to the square working resolution, convert to RGB and
/// scale to `[0, 1]` in `(channel, height, width)` order.
fn load_tensor(path: &Path, size: u32) -> CliResult<Array3<f32>> {
    let img = image::open(path)
        .map_err(|e| format!("cannot open '{}': {}", path.display(), e))?;
    Ok(tensor_from_image(&img, size))
}

fn tensor_from_image(img: &DynamicImage, size: u32) -> Array3<f32> {
    let rgb = image::imageops::resize(
        &img.to_rgb8(),
        size,
        size,
        image::imageops::FilterType::Triangle,
    );
    Array3::from_shape_fn((3, size as usize, size as usize), |(c, y, x)| {
        rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Render the distance map with a jet-style palette over the display
/// window `[threshold, 2 * threshold]`.
fn render_heatmap(result: &AnomalyResult, threshold: f32) -> RgbImage {
    let (h, w) = result.distance_map.dim();
    let span = if threshold > 0.0 { threshold } else { 1.0 };
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let v = result.distance_map[[y as usize, x as usize]];
        let t = ((v - threshold) / span).clamp(0.0, 1.0);
        image::Rgb(jet(t))
    })
}

/// Segmentation mask as a black/white raster.
fn render_mask(result: &AnomalyResult) -> GrayImage {
    let (h, w) = result.mask.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        image::Luma([if result.mask[[y as usize, x as usize]] {
            255
        } else {
            0
        }])
    })
}

/// Classic jet ramp: blue through cyan/green/yellow to red.
fn jet(t: f32) -> [u8; 3] {
    let r = (1.5 - (4.0 * t - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * t - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * t - 1.0).abs()).clamp(0.0, 1.0);
    [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0.0), [0, 0, 127]);
        assert_eq!(jet(1.0), [127, 0, 0]);
        assert_eq!(jet(0.5), [127, 255, 127]);
    }

    #[test]
    fn tensor_shape_and_range() {
        let img = DynamicImage::new_rgb8(64, 48);
        let t = tensor_from_image(&img, 32);
        assert_eq!(t.dim(), (3, 32, 32));
        assert!(t.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
