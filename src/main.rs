//! `bittided`: a thin CLI around the engine facade — enough to exercise the
//! engine end-to-end without a UI. Owns no engine logic of its own.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use bittide::engine::{Engine, EngineConfig};
use bittide::metainfo::hash::{from_hex, to_hex};

#[derive(Debug, Parser)]
#[command(name = "bittided", about = "Headless BitTorrent download engine")]
struct Cli {
    #[arg(long, default_value = ".", global = true)]
    download_dir: PathBuf,

    #[arg(long, default_value_t = 6881, global = true)]
    port: u16,

    #[arg(long, default_value_t = 50, global = true)]
    max_peers: usize,

    #[arg(long, global = true)]
    auto_start: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a torrent from a `.torrent` file path or a `magnet:` URI.
    Add { path_or_magnet: String },
    /// Start a registered torrent by its info-hash (hex).
    Start { info_hash: String },
    /// Stop a registered torrent by its info-hash (hex).
    Stop { info_hash: String },
    /// Remove a registered torrent by its info-hash (hex); leaves files on disk.
    Delete { info_hash: String },
    /// Print a status table for every registered torrent.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig {
        download_dir: cli.download_dir,
        incoming_port: cli.port,
        max_peers: cli.max_peers,
        auto_start: cli.auto_start,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).context("invalid engine configuration")?;

    match cli.command {
        Command::Add { path_or_magnet } => {
            let info_hash = if path_or_magnet.starts_with("magnet:") {
                engine.add_from_magnet(&path_or_magnet).await?
            } else {
                let bytes = std::fs::read(&path_or_magnet)
                    .with_context(|| format!("reading {path_or_magnet}"))?;
                engine.add_from_file(&bytes).await?
            };
            println!("added {}", to_hex(&info_hash));
        }
        Command::Start { info_hash } => {
            engine.start(parse_info_hash(&info_hash)?).await?;
            println!("started {info_hash}");
        }
        Command::Stop { info_hash } => {
            engine.stop(parse_info_hash(&info_hash)?).await?;
            println!("stopped {info_hash}");
        }
        Command::Delete { info_hash } => {
            engine.delete(parse_info_hash(&info_hash)?).await?;
            println!("deleted {info_hash}");
        }
        Command::Status => {
            let snapshot = engine.snapshot().await;
            println!(
                "{:<42}{:<22}{:<16}{:<8}{:<10}",
                "info-hash", "name", "state", "peers", "pieces"
            );
            for torrent in snapshot {
                println!(
                    "{:<42}{:<22}{:<16?}{:<8}{:<10}",
                    to_hex(&torrent.info_hash),
                    torrent.name.unwrap_or_else(|| "-".to_string()),
                    torrent.state,
                    torrent.connected_peers,
                    format!("{}/{}", torrent.completed_pieces, torrent.total_pieces),
                );
                if let Some(err) = torrent.last_error {
                    println!("  last error: {err}");
                }
            }
        }
    }

    Ok(())
}

fn parse_info_hash(hex: &str) -> Result<[u8; 20]> {
    from_hex(hex).with_context(|| format!("`{hex}` is not a valid 40-character hex info-hash"))
}
