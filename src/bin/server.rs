//! muxkv Engine Binary
//!
//! Runs the reference engine on a Unix socket.

use std::path::PathBuf;

use clap::Parser;
use muxkv::engine::Server;
use muxkv::EngineConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// muxkv reference engine
#[derive(Parser, Debug)]
#[command(name = "muxkv-engine")]
#[command(about = "Reference key-value engine speaking the muxkv protocol")]
#[command(version)]
struct Args {
    /// Unix socket to listen on
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Largest accepted frame body in MB
    #[arg(long, default_value = "512")]
    max_frame_mb: u32,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,muxkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let mut builder = EngineConfig::builder().max_frame_size(args.max_frame_mb.saturating_mul(1024 * 1024));
    if let Some(socket) = args.socket {
        builder = builder.socket_path(socket);
    }
    let config = builder.build();

    tracing::info!("muxkv engine v{}", muxkv::VERSION);
    tracing::info!("Socket: {}", config.socket_path.display());

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to bind: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}
