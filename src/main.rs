use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crystcap::export::import_dataset;
use crystcap::models::Config;
use crystcap::pipeline::AnnotatePipeline;
use crystcap::scorer;

#[derive(Parser)]
#[command(name = "crystcap", about = "Caption annotation pipeline for crystallization phase datasets", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "crystcap.toml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the annotation pipeline and export the dataset.
    Annotate {
        /// Ignore the checkpoint and re-run every image.
        #[arg(long)]
        force: bool,
    },
    /// Re-score an exported dataset and report drift.
    Validate {
        /// Dataset file to check (defaults to <output.dir>/dataset.json).
        #[arg(long)]
        dataset: Option<PathBuf>,
    },
    /// Print an example configuration file.
    Example,
}

fn setup_logging(verbose: bool) {
    let default = if verbose {
        "crystcap=debug,info"
    } else {
        "crystcap=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Command::Annotate { force } => annotate(&cli.config, force).await,
        Command::Validate { dataset } => validate(&cli.config, dataset),
        Command::Example => {
            print!("{EXAMPLE_CONFIG}");
            Ok(())
        }
    }
}

async fn annotate(config_path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight requests");
            let _ = cancel_tx.send(true);
        }
    });

    let output_dir = config.output.dir.clone();
    let pipeline = AnnotatePipeline::new(config, cancel_rx, force)?;
    let stats = pipeline.run().await?;

    println!("\n=== Annotation Run Summary ===");
    println!("Images enumerated:    {}", stats.total_images);
    println!("Skipped (checkpoint): {}", stats.skipped_checkpoint);
    println!("Skipped (cancelled):  {}", stats.skipped_cancelled);
    println!("Captions succeeded:   {}", stats.succeeded);
    println!("Captions failed:      {}", stats.failed);
    println!("Accepted:             {}", stats.accepted);
    println!("Needs review:         {}", stats.needs_review);
    println!("Rejected:             {}", stats.rejected);
    println!("Regenerated:          {}", stats.regenerated);
    println!("Mean score:           {:.2}", stats.mean_score);
    println!("Runtime:              {:.1}s", stats.runtime_secs);
    println!("Output:               {}", output_dir.display());

    Ok(())
}

fn validate(config_path: &std::path::Path, dataset: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    config.validate()?;
    config
        .provider
        .resolve_api_key()
        .context("provider credentials")?;

    let path = dataset.unwrap_or_else(|| config.output.dir.join("dataset.json"));
    let records = import_dataset(&path)?;

    let mut drifted = 0usize;
    for record in &records {
        let rescored = scorer::score(&record.caption, &record.phase_label, &config.scoring);
        if rescored.total != record.total_score {
            drifted += 1;
            error!(
                image = %record.image_path,
                stored = record.total_score,
                rescored = rescored.total,
                "score drift"
            );
        }
    }

    println!("Validated {} entries from {}", records.len(), path.display());
    if drifted > 0 {
        anyhow::bail!("{drifted} entries no longer match the configured scoring rules");
    }
    println!("All scores consistent with current scoring rules");
    Ok(())
}

const EXAMPLE_CONFIG: &str = r#"# crystcap configuration

[dataset]
root = "data/balanced_dataset"
phases = [
    { dir = "Unsaturated", label = "unsaturated" },
    { dir = "Labile", label = "labile" },
    { dir = "Intermediate", label = "intermediate" },
    { dir = "Metastable", label = "metastable" },
]
# extensions = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"]

[provider]
kind = "local"            # "openai" | "anthropic" | "local"
model = "llava:13b"
# base_url = "http://localhost:11434"
# api_key_env = "OPENAI_API_KEY"
# timeout_secs = 60
# requests_per_minute = 60

[requester]
concurrency = 4
max_attempts = 3
backoff_base_ms = 500
backoff_cap_ms = 30000

[validation]
regeneration_cap = 1

[output]
dir = "out"
# checkpoint = "out/checkpoint.jsonl"
include_needs_review = false
"#;
