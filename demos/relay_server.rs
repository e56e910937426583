//! Relay Server - serves channels from a settings file
//!
//! Run with: cargo run --example relay_server -- [settings.toml]
//!
//! Without an argument `demos/relay.toml` is used. Play a channel with:
//!
//! ```text
//! ffplay http://localhost:34400/stream/<provider>/<channel>
//! vlc    http://localhost:34400/stream/<provider>/<channel>
//! ```
//!
//! On startup any transcoder left behind by a crashed run is killed (see the
//! PID ledger in the temp folder). Ctrl+C evicts every client, stops all
//! workers and removes the segment folders.

use std::path::PathBuf;
use std::sync::Arc;

use iptv_relay::{RelayServer, Settings, StreamManager};

fn print_usage() {
    eprintln!("Usage: relay_server [SETTINGS]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  SETTINGS  Path to a TOML settings file (default: demos/relay.toml)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("demos/relay.toml"));

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("iptv_relay=info".parse()?)
                .add_directive("relay_server=info".parse()?),
        )
        .init();

    let settings = Settings::load(&path)?;
    let relay = settings.relay_config();
    let server_config = settings.server_config();
    let providers = settings.providers();

    println!("Loaded {} provider(s) from {}", providers.len(), path.display());
    println!("Segments in {}", relay.temp_dir.display());

    let manager = StreamManager::new(relay, Arc::new(providers));

    let orphans = manager.pid_ledger().kill_orphans().await?;
    if !orphans.is_empty() {
        println!("Killed {} orphaned transcoder(s)", orphans.len());
    }

    println!("Relay listening on http://{}/stream/<provider>/<channel>", server_config.bind_addr);

    let server = RelayServer::new(server_config, manager.clone());
    let result = server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await;

    manager.teardown_all().await;

    if let Err(e) = result {
        eprintln!("Server error: {}", e);
    }
    Ok(())
}
