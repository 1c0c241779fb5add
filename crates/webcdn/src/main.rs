//! WebCdn command line node
//!
//! Usage:
//!   webcdn get <url> [--hash <sha256>] [--output <path>]
//!   webcdn seed <path>...
//!   webcdn config

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;
use webcdn::{LoadRequest, WebCdn};
use webcdn_config::{get_config_path, Config};

#[derive(Parser)]
#[command(name = "webcdn")]
#[command(about = "Peer-to-peer content delivery with HTTP fallback", long_about = None)]
struct Cli {
    /// Coordinator websocket URL (overrides config)
    #[arg(long, global = true)]
    coordinator: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load one resource, from a peer if one has it
    Get {
        /// Fallback URL of the resource
        url: String,
        /// Expected SHA-256 of the content; enables peer delivery
        #[arg(long)]
        hash: Option<String>,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve local files to peers until interrupted
    Seed {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides, e.g. RUST_LOG=webcdn=debug,webcdn_peer=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webcdn=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default();
    if let Some(url) = cli.coordinator {
        config.coordinator.url = url;
    }

    match cli.command {
        Commands::Get { url, hash, output } => {
            let request = match hash {
                Some(hash) => LoadRequest::content(hash, Some(url)),
                None => LoadRequest::url(url),
            };
            let resource_id = request.resource_id();

            let cdn = WebCdn::connect(config).await?;
            let result = cdn.load(request).await;
            let stats = cdn.stats();
            cdn.shutdown().await;
            let data = result.with_context(|| format!("Failed to load {}", resource_id))?;

            match output {
                Some(path) => {
                    tokio::fs::write(&path, &data)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    eprintln!("wrote {} bytes to {}", data.len(), path.display());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
            eprintln!(
                "source: {}",
                if stats.peer_deliveries > 0 { "peer" } else { "fallback" }
            );
        }
        Commands::Seed { paths } => {
            let cdn = WebCdn::connect(config).await?;
            for path in &paths {
                let content = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let size = content.len();
                let resource_id = cdn.publish(content.into());
                println!("seeding {} {} ({} bytes)", resource_id, path.display(), size);
            }
            println!("Node {} serving {} files, Ctrl-C to stop", cdn.local_id(), paths.len());

            tokio::signal::ctrl_c().await?;
            let stats = cdn.stats();
            cdn.shutdown().await;
            println!("Uploaded {} bytes", stats.bytes_sent);
        }
        Commands::Config => {
            let config_path = get_config_path();
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
