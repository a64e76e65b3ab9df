//! raw-develop: render one image through the develop engine.
//!
//! ```text
//! raw-develop photo.nef out.jpg --sidecar photo.json --max-width 2048
//! ```

use clap::Parser;
use image::{DynamicImage, ImageFormat};
use raw_develop::develop::{export, Develop, HistoryStack};
use raw_develop::state::Library;
use raw_develop::{Context, EngineConfig, EngineError, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Develop a RAW (or plain image) file and write the result.
#[derive(Parser)]
#[command(name = "raw-develop", version)]
struct Cli {
    /// Source file.
    input: PathBuf,

    /// Output file; the format follows the extension.
    output: PathBuf,

    /// Catalog database. An in-memory catalog is used when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// JSON history to apply instead of the catalog's.
    #[arg(long)]
    sidecar: Option<PathBuf>,

    /// Maximum output width in pixels.
    #[arg(long)]
    max_width: Option<u32>,

    /// Maximum output height in pixels.
    #[arg(long)]
    max_height: Option<u32>,

    /// Engine configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };

    let input = std::fs::canonicalize(&cli.input)?;
    let probe = raw_develop::raw::load_raw_data(input.clone()).await?;
    tracing::info!(
        "📷 {} {} {}x{}",
        probe.maker,
        probe.model,
        probe.width,
        probe.height
    );

    let library = match &cli.catalog {
        Some(path) => Library::open(path)?,
        None => Library::open_in_memory()?,
    };
    let image_id = library.import_image(&input)?;
    let ctx = Context::new(config, Arc::new(library))?;

    let sidecar = match &cli.sidecar {
        Some(path) => Some(read_sidecar(path).await?),
        None => None,
    };
    let max_width = cli.max_width.unwrap_or(u32::MAX);
    let max_height = cli.max_height.unwrap_or(u32::MAX);

    let render_ctx = Arc::clone(&ctx);
    let rendered = tokio::task::spawn_blocking(move || {
        let develop = Develop::open(Arc::clone(&render_ctx), image_id)?;
        for diagnostic in develop.diagnostics() {
            tracing::warn!("⚠️  {}", diagnostic);
        }
        let history = sidecar.unwrap_or_else(|| develop.history());
        develop.close();
        tracing::info!("⚙️  Rendering {} history items", history.end());
        export::render(&render_ctx, image_id, max_width, max_height, &history)
    })
    .await
    .map_err(|e| EngineError::Config(format!("render task failed: {}", e)))??;

    let (width, height) = (rendered.width, rendered.height);
    let image = rendered.into_rgba_image().ok_or_else(|| EngineError::Decode {
        path: input.clone(),
        reason: "rendered buffer has the wrong size".into(),
    })?;
    save(DynamicImage::ImageRgba8(image), &cli.output)?;
    ctx.shutdown();

    tracing::info!("✅ Wrote {} ({}x{})", cli.output.display(), width, height);
    Ok(())
}

/// Sidecar: `{"items": [...], "history_end": n}`.
async fn read_sidecar(path: &Path) -> Result<HistoryStack> {
    let text = tokio::fs::read_to_string(path).await?;
    let stack: HistoryStack = serde_json::from_str(&text)?;
    Ok(HistoryStack::from_items(stack.items().to_vec(), stack.end()))
}

fn save(image: DynamicImage, path: &Path) -> Result<()> {
    match ImageFormat::from_path(path)? {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => image.to_rgb8().save_with_format(path, ImageFormat::Jpeg)?,
        format => image.save_with_format(path, format)?,
    }
    Ok(())
}
