//! Swarmcast - Knowledge dissemination for robot swarms
//!
//! Command-line agent for listening to and publishing on a knowledge domain.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swarmcast::config::{self, Config};
use swarmcast::protocol::{self, FullHeader, ReducedHeader, Value};
use swarmcast::store::KnowledgeBase;
use swarmcast::transport::Transport;

/// Swarmcast - Knowledge dissemination for robot swarms
#[derive(Parser)]
#[command(name = "swarmcast")]
#[command(version)]
#[command(about = "Share a key/value knowledge base across a swarm over UDP multicast", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Knowledge domain (overrides configuration)
    #[arg(short, long, global = true)]
    domain: Option<String>,

    /// Originator identity (overrides configuration)
    #[arg(long, global = true)]
    id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the domain and print the knowledge base as it changes
    Listen {
        /// Print snapshots as JSON
        #[arg(long)]
        json: bool,

        /// Report interval in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Set values and send them to the domain
    Publish {
        /// Assignments such as pos.x=1.5 or mode=search
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,

        /// Quality stamped on the published values
        #[arg(short, long, default_value_t = 0)]
        quality: u32,

        /// Number of times to send
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,

        /// Delay between repeats in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    if let Some(domain) = cli.domain {
        config.transport.domain = domain;
    }
    if let Some(id) = cli.id {
        config.general.id = Some(id);
    }

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Listen { json, interval_ms } => {
            if let Some(ms) = interval_ms {
                config.transport.send_interval_ms = ms;
            }
            run_listen(config, json).await?;
        }
        Commands::Publish {
            assignments,
            quality,
            repeat,
            interval_ms,
        } => {
            if let Some(ms) = interval_ms {
                config.transport.send_interval_ms = ms;
            }
            run_publish(config, assignments, quality, repeat).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Listen on the domain until Ctrl+C
async fn run_listen(config: Config, json: bool) -> anyhow::Result<()> {
    let settings = config.transport_settings()?;
    let store = Arc::new(KnowledgeBase::new());
    let mut transport = Transport::open(settings, store.clone()).await?;

    println!(
        "Listening on {} as '{}' (domain '{}'). Press Ctrl+C to stop.\n",
        config.transport.group,
        transport.identity(),
        config.transport.domain
    );

    let mut ticker = tokio::time::interval(config.send_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                print_snapshot(&transport, json)?;
            }
            _ = store.changed() => {
                tracing::debug!("Knowledge base changed ({} entries)", store.len());
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    let stats = transport.stats();
    transport.close().await?;
    tracing::info!(
        "Received {} datagrams, accepted {} updates",
        stats.datagrams_received,
        stats.updates_accepted
    );

    Ok(())
}

fn print_snapshot(transport: &Transport<KnowledgeBase>, json: bool) -> anyhow::Result<()> {
    let snapshot = transport.store().snapshot();

    if json {
        let report = serde_json::json!({
            "entries": snapshot,
            "send_bps": transport.send_bandwidth(),
            "receive_bps": transport.receive_bandwidth(),
        });
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    println!(
        "--- {} entries | send {} B/s | receive {} B/s",
        snapshot.len(),
        transport.send_bandwidth(),
        transport.receive_bandwidth()
    );
    for (key, record) in &snapshot {
        println!(
            "  {} = {} (clock {}, quality {})",
            key, record.value, record.clock, record.quality
        );
    }
    Ok(())
}

/// Publish values, optionally repeating, then close
async fn run_publish(
    config: Config,
    assignments: Vec<(String, String)>,
    quality: u32,
    repeat: u32,
) -> anyhow::Result<()> {
    let settings = config.transport_settings()?;
    let store = Arc::new(KnowledgeBase::new());
    let mut transport = Transport::open(settings, store.clone()).await?;

    let values: Vec<(String, Value)> = assignments
        .into_iter()
        .map(|(key, text)| {
            let value = Value::parse_literal(&text);
            (key, value)
        })
        .collect();

    for key in values.iter().map(|(key, _)| key) {
        store.set_quality(key, quality);
    }

    let rounds = repeat.max(1);
    for round in 0..rounds {
        for (key, value) in &values {
            store.set(key, value.clone());
        }
        let sent = transport.send_data().await?;
        tracing::info!(
            "Published {} values ({} bytes) as '{}'",
            values.len(),
            sent,
            transport.identity()
        );

        if round + 1 < rounds {
            tokio::select! {
                _ = tokio::time::sleep(config.send_interval()) => {}
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }

    transport.close().await?;
    Ok(())
}

/// Print protocol constants and configured defaults
fn print_protocol_info(config: &Config) {
    println!("Swarmcast Protocol Information");
    println!("==============================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Group: {}", protocol::DEFAULT_GROUP);
    println!(
        "Full Header: {} bytes ({})",
        FullHeader::ENCODED_LEN,
        String::from_utf8_lossy(&protocol::FULL_IDENTIFIER)
    );
    println!(
        "Reduced Header: {} bytes ({})",
        ReducedHeader::ENCODED_LEN,
        String::from_utf8_lossy(&protocol::REDUCED_IDENTIFIER)
    );
    println!("Max Datagram: {} bytes", protocol::MAX_DATAGRAM_SIZE);

    println!("\nConfigured:");
    println!("  Group: {} ({:?})", config.transport.group, config.transport.kind);
    println!("  Domain: {}", config.transport.domain);
    println!("  Queue Length: {}", config.transport.queue_length);
    println!(
        "  TTL: {} (rebroadcast ceiling {})",
        config.transport.ttl, config.transport.rebroadcast_ttl
    );
}
