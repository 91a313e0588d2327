use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use garimpo::config::FabricConfig;
use garimpo::models::CompanyInput;
use garimpo::scraper::batch::{BatchProcessor, NoCandidates, NullSink};
use garimpo::scraper::{orchestrator, prober, ScrapeContext};

#[derive(Parser)]
#[command(
    name = "garimpo",
    version,
    about = "Scraping fabric for Brazilian B2B company profiling",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables override
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a URL for its reachable canonical variant
    Probe {
        /// URL or bare domain
        url: String,
    },

    /// Scrape one company site end to end
    Scrape {
        /// URL or bare domain
        url: String,

        /// Cap on selected subpages
        #[arg(long)]
        max_subpages: Option<usize>,

        /// Print the aggregated page text instead of the summary
        #[arg(long, default_value = "false")]
        text: bool,
    },

    /// Process a batch of companies from a JSON-lines file
    Batch {
        /// Input file: one {"registration_id", "url"?, ...} per line
        #[arg(short, long)]
        input: PathBuf,

        /// Worker count override
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Health-check the proxy pool and print its distribution
    Proxies {
        /// Proxy list file (IP:PORT:USER:PASS per line)
        #[arg(short, long)]
        list: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FabricConfig::from_file(path)?,
        None => FabricConfig::from_env()?,
    };
    if cli.verbose {
        config.logging.level = String::from("debug");
    }
    config.validate().context("Invalid configuration")?;

    setup_tracing(&cli.log_format, &config.logging.level)?;
    tracing::info!("garimpo starting");

    match cli.command {
        Commands::Probe { url } => {
            let ctx = build_context(config).await?;
            let deadline = tokio::time::Instant::now() + ctx.config.probe_timeout();
            match prober::probe(&ctx.proxies, &url, deadline).await {
                Ok(capture) => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "canonical_url": capture.url,
                            "http_status": capture.http_status,
                            "latency_ms": capture.elapsed_ms,
                            "body_bytes": capture.body.len(),
                        })
                    );
                }
                Err(reason) => {
                    println!("{}", serde_json::json!({ "error": reason.as_str() }));
                    std::process::exit(1);
                }
            }
        }

        Commands::Scrape {
            url,
            max_subpages,
            text,
        } => {
            if let Some(max) = max_subpages {
                config.scrape.max_subpages = max;
            }
            let ctx = build_context(config).await?;
            let result = orchestrator::scrape_company(&ctx, &url).await;
            if text {
                println!("{}", result.aggregated_text());
            } else {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            if !result.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Batch { input, workers } => {
            if let Some(workers) = workers {
                config.scrape.workers = workers;
            }
            let companies = read_companies(&input)?;
            let ctx = build_context(config).await?;
            let batch = BatchProcessor::new(ctx, Arc::new(NullSink), Arc::new(NoCandidates));
            let snapshot = batch.run(companies).await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        Commands::Proxies { list } => {
            config.proxy.list_path = Some(list.display().to_string());
            let ctx = build_context(config).await?;
            println!("{}", serde_json::to_string_pretty(&ctx.proxies.status())?);
        }
    }

    Ok(())
}

/// Build the scrape context, loading and health-checking the proxy
/// pool when one is configured.
async fn build_context(config: FabricConfig) -> Result<Arc<ScrapeContext>> {
    let endpoints = match &config.proxy.list_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read proxy list: {path}"))?;
            garimpo::scraper::proxy::parse_proxy_list(&content)
        }
        None => Vec::new(),
    };

    let has_proxies = !endpoints.is_empty();
    let ctx = ScrapeContext::with_proxies(config, endpoints);

    if has_proxies {
        let alive = ctx
            .proxies
            .health_check(
                &ctx.config.proxy.health_check_url,
                std::time::Duration::from_millis(ctx.config.proxy.health_check_timeout_ms),
            )
            .await;
        if alive == 0 {
            tracing::warn!("Every proxy failed the health check; fetches will fail fast");
        }
    }

    Ok(ctx)
}

fn read_companies(path: &PathBuf) -> Result<Vec<CompanyInput>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch input: {}", path.display()))?;

    let mut companies = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let company: CompanyInput = serde_json::from_str(line)
            .with_context(|| format!("Invalid company on line {}", idx + 1))?;
        companies.push(company);
    }
    anyhow::ensure!(!companies.is_empty(), "Batch input is empty");
    Ok(companies)
}

fn setup_tracing(format: &str, level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    Ok(())
}
