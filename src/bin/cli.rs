//! muxkv CLI Client
//!
//! Command-line interface for talking to a muxkv engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use muxkv::client::PubSubConfig;
use muxkv::protocol::PubSubSubscriptions;
use muxkv::{ClientConfig, Command, Connection, Decoder, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// muxkv CLI
#[derive(Parser, Debug)]
#[command(name = "muxkv-cli")]
#[command(about = "CLI for the muxkv engine")]
struct Args {
    /// Engine socket
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Request timeout in milliseconds
    #[arg(short, long, default_value = "250")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete keys
    Del {
        /// The keys to delete
        keys: Vec<String>,
    },

    /// Ping the engine
    Ping,

    /// Publish a message on a channel
    Publish { channel: String, message: String },

    /// Subscribe to channels and print messages until interrupted
    Subscribe {
        /// Channels to subscribe to
        channels: Vec<String>,

        /// Treat channels as glob patterns
        #[arg(short, long)]
        pattern: bool,
    },

    /// Send an arbitrary command, e.g. `raw INCR counter`
    Raw {
        /// Command name followed by its arguments
        #[arg(required = true)]
        words: Vec<String>,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let socket = args
        .socket
        .unwrap_or_else(|| muxkv::EngineConfig::default().socket_path);

    if let Err(e) = run(socket, args.timeout_ms, args.command) {
        eprintln!("(error) {}", e);
        std::process::exit(1);
    }
}

fn run(socket: PathBuf, timeout_ms: u64, command: Commands) -> muxkv::Result<()> {
    let builder = ClientConfig::builder()
        .request_timeout_ms(timeout_ms)
        .decoder(Decoder::String);

    let command = match command {
        Commands::Subscribe { channels, pattern } => {
            let channels: Vec<Vec<u8>> = channels.into_iter().map(String::into_bytes).collect();
            let subscriptions = if pattern {
                PubSubSubscriptions {
                    patterns: channels,
                    ..Default::default()
                }
            } else {
                PubSubSubscriptions {
                    channels,
                    ..Default::default()
                }
            };
            let config = builder.pubsub(PubSubConfig::pull(subscriptions)).build();
            let connection = Connection::connect(&socket, config)?;
            loop {
                let message = connection.get_pubsub_message()?;
                println!(
                    "{}: {}",
                    String::from_utf8_lossy(&message.channel),
                    String::from_utf8_lossy(&message.message)
                );
            }
        }
        Commands::Get { key } => Command::new("GET").arg(key),
        Commands::Set { key, value } => Command::new("SET").arg(key).arg(value),
        Commands::Del { keys } => keys.iter().fold(Command::new("DEL"), |c, k| c.arg(k)),
        Commands::Ping => Command::new("PING"),
        Commands::Publish { channel, message } => {
            Command::new("PUBLISH").arg(channel).arg(message)
        }
        Commands::Raw { words } => words
            .iter()
            .skip(1)
            .fold(Command::new(words[0].as_str()), |c, w| c.arg(w)),
    };

    let connection = Connection::connect(&socket, builder.build())?;
    let reply = connection.custom_command(command)?;
    println!("{}", render(&reply));
    Ok(())
}

fn render(value: &Value) -> String {
    match value {
        Value::Nil => "(nil)".to_string(),
        Value::Okay => "OK".to_string(),
        Value::Int(n) => format!("(integer) {}", n),
        Value::Double(d) => format!("(double) {}", d),
        Value::Boolean(b) => format!("(boolean) {}", b),
        Value::Bytes(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
        Value::Text(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{}) {}", i + 1, render(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| format!("{} => {}", render(k), render(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Push { kind, data } => format!("push {:?} {:?}", kind, data),
    }
}
