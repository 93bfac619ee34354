use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use nostr_sdk::EventId;
use threadline_cli::{logging, render};
use threadline_core::constants::CONNECT_TIMEOUT_MS;
use threadline_core::{EngineConfig, NostrRelayTransport, RelayTransport, ThreadEngine, ViewContext};

#[derive(Parser)]
#[command(name = "threadline")]
#[command(about = "Reconstruct and cache Nostr reply threads")]
struct Cli {
    /// Path to JSON config file (camelCase engine settings)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Relay URL to query (can be specified multiple times; replaces configured relays)
    #[arg(long, short = 'r')]
    relay: Vec<String>,

    /// Directory for persisted trees (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Print relay statistics to stderr when done
    #[arg(long)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the conversation containing a note and print its reply tree
    Thread {
        /// Note ID (hex or bech32)
        note_id: String,
        /// Reply levels to fetch and print below the note
        #[arg(long, short = 'd')]
        depth: Option<usize>,
        /// Keep paging older replies to the note until none are left
        #[arg(long)]
        all_pages: bool,
    },

    /// Print the conversation root of a note
    Root {
        /// Note ID (hex or bech32)
        note_id: String,
    },

    /// Remove expired trees from the persisted cache
    Gc,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging() {
        eprintln!("Warning: {:#}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    let transport = match &cli.command {
        // Garbage collection never talks to relays
        Commands::Gc => None,
        _ => Some(Arc::new(
            NostrRelayTransport::connect(&config.relays, Duration::from_millis(CONNECT_TIMEOUT_MS))
                .await
                .context("Failed to connect to relays")?,
        )),
    };
    let engine_transport: Arc<dyn RelayTransport> = match &transport {
        Some(transport) => transport.clone() as Arc<dyn RelayTransport>,
        None => Arc::new(NostrRelayTransport::from_client(
            nostr_sdk::Client::builder().build(),
            Vec::new(),
        )),
    };
    let engine = ThreadEngine::init(config, engine_transport).context("Failed to start thread engine")?;

    let result = execute(&cli, &engine).await;

    if cli.stats {
        print_json(&render::stats_json(&engine.stats()), true)?;
    }
    engine.dispose().await;
    if let Some(transport) = transport {
        transport.disconnect().await;
    }
    result
}

async fn execute(cli: &Cli, engine: &ThreadEngine) -> Result<()> {
    match &cli.command {
        Commands::Thread {
            note_id,
            depth,
            all_pages,
        } => {
            let note_id = parse_note_id(note_id)?;
            let depth = depth.unwrap_or(engine.config().default_max_depth);
            let report = engine.open_thread(&note_id, depth, ViewContext::default()).await?;

            if *all_pages {
                loop {
                    let has_more = engine
                        .thread_state(&report.root_id)
                        .map(|s| s.status.has_more)
                        .unwrap_or(false);
                    if !has_more || engine.fetch_next_page(&report.root_id).await? == 0 {
                        break;
                    }
                }
            }

            let view = engine
                .thread_view(&report.root_id, &note_id, depth)
                .ok_or_else(|| anyhow!("Note {} is not in the loaded thread", note_id))?;
            if cli.json {
                print_json(&render::view_json(&view, &report), false)?;
            } else {
                print!("{}", render::render_view(&view));
                eprintln!("{}", render::report_summary(&report));
            }
        }
        Commands::Root { note_id } => {
            let note_id = parse_note_id(note_id)?;
            let outcome = engine.discover_root(&note_id).await?;
            if cli.json {
                print_json(&render::discovery_json(&note_id, &outcome), false)?;
            } else {
                println!("{}", outcome.root_id());
                if !outcome.is_complete() {
                    eprintln!("Root discovery stopped early; showing the furthest ancestor found");
                }
            }
        }
        Commands::Gc => {
            let report = engine.collect_garbage();
            if cli.json {
                print_json(&render::gc_json(&report), false)?;
            } else {
                println!("Removed {} expired trees", report.expired);
            }
        }
    }
    Ok(())
}

/// Config file (if any), then command-line overrides
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if !cli.relay.is_empty() {
        config.relays = cli.relay.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if config.data_dir.is_none() {
        config.data_dir = dirs::data_dir().map(|dir| dir.join("threadline"));
    }
    if config.relays.is_empty() && !matches!(cli.command, Commands::Gc) {
        return Err(anyhow!("No relays configured"));
    }
    Ok(config)
}

fn parse_note_id(input: &str) -> Result<String> {
    let id = EventId::parse(input).with_context(|| format!("Invalid note id: {}", input))?;
    Ok(id.to_hex())
}

fn print_json(value: &serde_json::Value, to_stderr: bool) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    if to_stderr {
        eprintln!("{}", text);
    } else {
        println!("{}", text);
    }
    Ok(())
}
