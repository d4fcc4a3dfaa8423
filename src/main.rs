use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use preview_sink::{
    api,
    config::SinkCfg,
    frame::Frame,
    metadata::ExecutionContext,
    paths::ImageRef,
    sink::{ExecutionResult, UiImages},
    widget::{HttpSaveClient, LogNotifier, NodeHooks, NodeInputs, NodeWidget, TriggerOutcome},
    SaveMode,
};

#[derive(Parser)]
#[command(name = "preview-sink", about = "Preview generated images now, keep them later")]
struct Cli {
    /// YAML config; defaults apply when the file does not exist.
    #[arg(long, short, default_value = "preview-sink.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg { Always, Manual }

impl From<ModeArg> for SaveMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Always => SaveMode::AlwaysSave,
            ModeArg::Manual => SaveMode::ManualSave,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the manual-save endpoint.
    Serve,
    /// Run one execution step over image files, as the graph engine would.
    Stage {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(long, value_enum, default_value = "always")]
        mode: ModeArg,
        #[arg(long, default_value = "")]
        prefix: String,
        /// JSON file embedded as the `prompt` text chunk.
        #[arg(long)]
        prompt: Option<PathBuf>,
    },
    /// Commit staged temp images through a running server.
    Save {
        #[arg(required = true)]
        filenames: Vec<String>,
        #[arg(long, default_value = "")]
        prefix: String,
        /// Server root; defaults to the configured bind address.
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = SinkCfg::load(Some(cli.config.as_path())).await?;

    match cli.cmd {
        Cmd::Serve => api::serve(cfg).await,
        Cmd::Stage { images, mode, prefix, prompt } => stage(&cfg, images, mode.into(), &prefix, prompt).await,
        Cmd::Save { filenames, prefix, server } => save(&cfg, filenames, prefix, server).await,
    }
}

async fn stage(cfg: &SinkCfg, images: Vec<PathBuf>, mode: SaveMode, prefix: &str, prompt: Option<PathBuf>) -> Result<()> {
    let mut frames = Vec::with_capacity(images.len());
    for path in &images {
        let img = image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;
        frames.push(Frame::from_dynamic(&img)?);
    }
    let ctx = match prompt {
        Some(p) => {
            let txt = tokio::fs::read_to_string(&p).await.with_context(|| format!("Failed to read {}", p.display()))?;
            ExecutionContext { prompt: Some(serde_json::from_str(&txt).context("prompt file is not JSON")?), extra_pnginfo: None }
        }
        None => ExecutionContext::default(),
    };
    let res = cfg.build_sink().execute(&frames, mode, prefix, &ctx).await?;
    println!("{}", serde_json::to_string_pretty(&res)?);
    Ok(())
}

async fn save(cfg: &SinkCfg, filenames: Vec<String>, prefix: String, server: Option<String>) -> Result<()> {
    let base = server.unwrap_or_else(|| format!("http://{}", cfg.bind));
    let client = Arc::new(HttpSaveClient::new(&base, &cfg.namespace));
    let inputs = NodeInputs { save_mode: SaveMode::ManualSave, filename_prefix: prefix };
    let mut node = NodeWidget::new("cli", inputs, client, Arc::new(LogNotifier));

    let images = filenames.into_iter().map(ImageRef::temp).collect();
    node.on_executed(&ExecutionResult { ui: UiImages { images } });

    match node.on_trigger().await {
        TriggerOutcome::Saved(paths) => {
            for p in paths { println!("{p}"); }
            Ok(())
        }
        TriggerOutcome::Partial { saved, failed } => {
            for p in saved { println!("{p}"); }
            anyhow::bail!("{failed} image(s) could not be saved")
        }
        TriggerOutcome::NothingToSave => anyhow::bail!("nothing to save"),
        TriggerOutcome::Failed(detail) => anyhow::bail!("manual save failed: {detail}"),
    }
}
