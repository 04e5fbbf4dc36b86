//! Request definitions
//!
//! Messages sent from the client to the engine.

use serde::{Deserialize, Serialize};

/// A single command: name plus raw arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub args: Vec<Vec<u8>>,
}

impl Command {
    /// Create a command with no arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Build a command from a whitespace separated line, e.g. `SET k v`
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(parts.fold(Command::new(name), |cmd, part| cmd.arg(part)))
    }
}

/// Routing directive for multi-node topologies.
///
/// Opaque to the binding; forwarded to the engine as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Random,
    AllNodes,
    AllPrimaries,
    SlotKey { key: Vec<u8>, replica: bool },
    SlotId { slot: u16, replica: bool },
    ByAddress { host: String, port: u16 },
}

/// What a request asks the engine to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// One command
    Single(Command),

    /// Several commands; `atomic` runs them as a transaction
    Batch { commands: Vec<Command>, atomic: bool },

    /// Invoke a stored script by hash
    Script {
        hash: String,
        keys: Vec<Vec<u8>>,
        args: Vec<Vec<u8>>,
    },

    /// Replace the password used when the engine reconnects
    UpdatePassword {
        password: Option<String>,
        immediate_auth: bool,
    },
}

/// A framed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub callback_idx: u32,
    pub kind: RequestKind,
    pub route: Option<Route>,
}

// =============================================================================
// Handshake
// =============================================================================

/// Address of an engine-side node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

/// Channels to subscribe to as part of the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubSubscriptions {
    pub channels: Vec<Vec<u8>>,
    pub patterns: Vec<Vec<u8>>,
    pub sharded: Vec<Vec<u8>>,
}

impl PubSubSubscriptions {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty() && self.sharded.is_empty()
    }
}

/// The single configuration message sent before any other traffic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub addresses: Vec<NodeAddress>,
    pub database_id: u32,
    pub client_name: Option<String>,
    pub request_timeout_ms: u64,
    pub subscriptions: Option<PubSubSubscriptions>,
}
