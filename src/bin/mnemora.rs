//! Binary entry point for the Mnemora engine and administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::Color;

use mnemora::engine::HealthStatus;
use mnemora::{logging, Config, Engine};

#[derive(Parser, Debug)]
#[command(
    name = "mnemora",
    version,
    about = "Local capture-and-recall engine",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, help = "Override the data directory")]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Explicit config file path")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, help = "Reduce decorative output and color usage")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine and serve the local API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:4807", help = "Listen address")]
        bind: SocketAddr,
    },
    /// Print store and index statistics plus the health report.
    Stats,
    /// Rebuild the vector index from stored embeddings.
    Reindex,
    /// Generate shell completions.
    Completions {
        #[arg(value_enum, help = "Target shell")]
        shell: clap_complete::Shell,
    },
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = Some(data_dir.clone());
    }
    Ok(config)
}

fn paint(quiet: bool, color: Color, text: &str) -> String {
    if quiet {
        text.to_string()
    } else {
        color.paint(text).to_string()
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{}", Color::Red.paint(format!("error: {err}")));
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    logging::init(if cli.quiet { "warn" } else { "info" });
    let config = load_config(&cli)?;

    match cli.command {
        Command::Serve { bind } => {
            let engine = Engine::bootstrap(config)?;
            let serving = Arc::clone(&engine);
            if !cli.quiet {
                println!(
                    "{} listening on {}",
                    paint(cli.quiet, Color::Green, "mnemora"),
                    paint(cli.quiet, Color::Cyan, &bind.to_string()),
                );
            }
            mnemora::rpc::serve(serving, bind).await?;
            engine.shutdown();
        }
        Command::Stats => {
            let engine = Engine::bootstrap(config)?;
            let stats = engine.stats()?;
            let health = engine.health();
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "stats": stats,
                        "health": health,
                    }))?
                ),
                OutputFormat::Text => {
                    println!("{}", paint(cli.quiet, Color::Cyan, "store"));
                    println!("  screenshots        {}", stats.screenshots);
                    println!("  batches            {}", stats.batches);
                    println!("  unfinished batches {}", stats.unfinished_batches);
                    println!("  context nodes      {}", stats.nodes);
                    println!("  threads            {}", stats.threads);
                    println!("  activity windows   {}", stats.activity_windows);
                    println!("{}", paint(cli.quiet, Color::Cyan, "vector index"));
                    println!("  live vectors       {}", stats.vector_index.live_vectors);
                    println!("  dimensions         {}", stats.vector_index.dimensions);
                    println!("{}", paint(cli.quiet, Color::Cyan, "runtime"));
                    println!("  backpressure       {}", stats.backpressure_level);
                    println!("  ocr queue          {}", stats.ocr_queue);
                    for (label, usage) in ["vlm", "text", "embedding"]
                        .iter()
                        .zip(stats.ai_usage.iter())
                    {
                        println!(
                            "  {label:<9} calls {} errors {} tokens {}",
                            usage.calls, usage.errors, usage.total_tokens
                        );
                    }
                    let color = match health.status {
                        HealthStatus::Healthy => Color::Green,
                        HealthStatus::Degraded => Color::Yellow,
                        HealthStatus::Unhealthy => Color::Red,
                    };
                    println!("{}", paint(cli.quiet, Color::Cyan, "health"));
                    println!(
                        "  status             {}",
                        paint(cli.quiet, color, &format!("{:?}", health.status))
                    );
                    for check in &health.checks {
                        println!("  {}", serde_json::to_string(check)?);
                    }
                }
            }
            engine.shutdown();
        }
        Command::Reindex => {
            let engine = Engine::bootstrap(config)?;
            let bar = if cli.quiet {
                ProgressBar::hidden()
            } else {
                let bar = ProgressBar::new(0);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner} [{bar:30}] {pos}/{len} vectors",
                    )?
                    .progress_chars("=> "),
                );
                bar
            };
            let progress_bar = bar.clone();
            let inserted = engine.reindex(move |done, total| {
                progress_bar.set_length(total as u64);
                progress_bar.set_position(done as u64);
            })?;
            bar.finish_and_clear();
            println!(
                "{} {inserted} vectors reindexed",
                paint(cli.quiet, Color::Green, "done:")
            );
            engine.shutdown();
        }
        Command::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
        }
    }
    Ok(())
}
