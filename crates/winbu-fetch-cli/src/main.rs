//! winbu-fetch: command-line entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::sync::Notify;

use winbu_fetch::{ConfigSnapshot, Engine, EngineSettings, Fetched, JsonExtractor, StaticConfig};

#[derive(Parser)]
#[command(
    name = "winbu-fetch",
    about = "Fetch pages, resolve their stream servers, and cache the assembled documents",
    version
)]
struct Cli {
    /// JSON configuration file. WINBU_* environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Maximum concurrent primary fetches.
    #[arg(long, global = true)]
    max_fetches: Option<usize>,

    /// Maximum concurrent side-channel resolutions per page.
    #[arg(long, global = true)]
    resolver_width: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one target and print the document as JSON.
    Fetch {
        /// Absolute URL or slug below the base URL.
        target: String,

        /// Session deadline, e.g. "30s" or "2m".
        #[arg(long, value_parser = humantime::parse_duration)]
        deadline: Option<Duration>,

        /// Print compact JSON instead of pretty JSON.
        #[arg(long)]
        compact: bool,
    },

    /// Fetch several targets concurrently and print a summary.
    Warmup {
        /// Absolute URLs or slugs below the base URL.
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Fetch the given targets, then print cache and admission statistics.
    Stats {
        targets: Vec<String>,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   winbu-fetch completions bash > ~/.local/share/bash-completion/completions/winbu-fetch
    ///   winbu-fetch completions zsh > ~/.zfunc/_winbu-fetch
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "winbu-fetch", &mut std::io::stdout());
        return Ok(());
    }

    let engine = build_engine(&cli)?;
    let shutdown = Arc::new(Notify::new());
    let sweeper = engine.spawn_sweeper(Arc::clone(&shutdown));

    let result = run(&engine, cli.command).await;

    shutdown.notify_one();
    sweeper.await.context("cache sweep task panicked")?;
    result
}

fn build_engine(cli: &Cli) -> anyhow::Result<Engine> {
    let snapshot = match &cli.config {
        Some(path) => ConfigSnapshot::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ConfigSnapshot::from_env(),
    };

    let mut settings = EngineSettings::default();
    if let Some(k) = cli.max_fetches {
        settings.max_concurrent_fetches = k;
    }
    if let Some(m) = cli.resolver_width {
        settings.max_concurrent_resolutions = m;
    }

    tracing::debug!(
        "engine: base_url={} fetches={} resolver_width={}",
        snapshot.base_url,
        settings.max_concurrent_fetches,
        settings.max_concurrent_resolutions
    );
    Engine::new(StaticConfig::new(snapshot), JsonExtractor, settings)
        .context("failed to build engine")
}

async fn run(engine: &Engine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Fetch {
            target,
            deadline,
            compact,
        } => {
            let fetched = match deadline {
                Some(d) => {
                    engine
                        .fetch_with_deadline(&target, tokio::time::Instant::now() + d)
                        .await
                }
                None => engine.fetch(&target).await,
            }
            .with_context(|| format!("fetch of {target} failed"))?;

            let output = render(&fetched);
            if compact {
                println!("{}", serde_json::to_string(&output)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        }

        Commands::Warmup { targets } => {
            let report = engine.spawn_warm_up(targets).await?;
            let info = serde_json::json!({
                "report": report,
                "cache": engine.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Stats { targets } => {
            if !targets.is_empty() {
                engine.warm_up(&targets).await;
            }
            let transport = engine.transport_stats();
            let info = serde_json::json!({
                "cache": engine.stats(),
                "admission": engine.admission(),
                "transport": {
                    "primary_requests": transport.primary_requests(),
                    "side_channel_requests": transport.side_channel_requests(),
                },
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn render(fetched: &Fetched) -> serde_json::Value {
    serde_json::json!({
        "source": if fetched.from_cache() { "cache" } else { "network" },
        "document": &*fetched.document,
        "warnings": fetched.warnings,
    })
}
