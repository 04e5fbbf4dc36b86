//! Configuration for muxkv
//!
//! Centralized configuration with sensible defaults, for both the client
//! connection and the reference engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{HandleTable, PubSubConfig, ValueResolver};
use crate::protocol::{ConnectionRequest, Decoder, NodeAddress, DEFAULT_MAX_FRAME_SIZE};

/// Configuration for one client connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -------------------------------------------------------------------------
    // Handshake Configuration (forwarded to the engine)
    // -------------------------------------------------------------------------
    /// Nodes the engine should connect to
    pub addresses: Vec<NodeAddress>,

    /// Logical database to select
    pub database_id: u32,

    /// Name reported by the engine for this client
    pub client_name: Option<String>,

    // -------------------------------------------------------------------------
    // Request Configuration
    // -------------------------------------------------------------------------
    /// How long a caller waits for a response (milliseconds)
    pub request_timeout_ms: u64,

    /// Max pending requests, abandoned ones included (0 = unlimited)
    pub max_inflight_requests: usize,

    /// How byte-string replies are surfaced by default
    pub decoder: Decoder,

    // -------------------------------------------------------------------------
    // Transport Configuration
    // -------------------------------------------------------------------------
    /// How long the handshake may take (milliseconds)
    pub connection_timeout_ms: u64,

    /// Size of each socket read
    pub read_buffer_size: usize,

    /// Largest accepted frame body (bytes)
    pub max_frame_size: u32,

    // -------------------------------------------------------------------------
    // Push Notifications / Out-of-band Values
    // -------------------------------------------------------------------------
    /// Subscriptions and delivery mode; `None` disables push delivery
    pub pubsub: Option<PubSubConfig>,

    /// Resolves value handles; `None` rejects handle replies
    pub resolver: Option<Arc<dyn ValueResolver>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addresses: vec![NodeAddress {
                host: "localhost".to_string(),
                port: 6379,
            }],
            database_id: 0,
            client_name: None,
            request_timeout_ms: 250,
            max_inflight_requests: 1000,
            decoder: Decoder::Bytes,
            connection_timeout_ms: 2000,
            read_buffer_size: 64 * 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            pubsub: None,
            resolver: None,
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// The handshake message describing this configuration
    pub fn connection_request(&self) -> ConnectionRequest {
        ConnectionRequest {
            addresses: self.addresses.clone(),
            database_id: self.database_id,
            client_name: self.client_name.clone(),
            request_timeout_ms: self.request_timeout_ms,
            subscriptions: self
                .pubsub
                .as_ref()
                .map(|pubsub| pubsub.subscriptions.clone()),
        }
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Add an engine-side node address
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        let address = NodeAddress {
            host: host.into(),
            port,
        };
        if self.config.addresses == ClientConfig::default().addresses {
            self.config.addresses.clear();
        }
        self.config.addresses.push(address);
        self
    }

    pub fn database_id(mut self, id: u32) -> Self {
        self.config.database_id = id;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = Some(name.into());
        self
    }

    /// Set the request timeout (in milliseconds)
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    /// Set the inflight request limit (0 = unlimited)
    pub fn max_inflight_requests(mut self, count: usize) -> Self {
        self.config.max_inflight_requests = count;
        self
    }

    pub fn decoder(mut self, decoder: Decoder) -> Self {
        self.config.decoder = decoder;
        self
    }

    /// Set the handshake timeout (in milliseconds)
    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connection_timeout_ms = ms;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn pubsub(mut self, pubsub: PubSubConfig) -> Self {
        self.config.pubsub = Some(pubsub);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ValueResolver>) -> Self {
        self.config.resolver = Some(resolver);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

// =============================================================================
// Reference Engine Configuration
// =============================================================================

/// Configuration for the reference engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unix socket the engine listens on
    pub socket_path: PathBuf,

    /// Values whose payload exceeds this many bytes are sent as handles
    /// (only when `handle_table` is set)
    pub inline_value_limit: usize,

    /// Shared store for out-of-band values
    pub handle_table: Option<Arc<HandleTable>>,

    /// Largest accepted frame body (bytes)
    pub max_frame_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("muxkv-engine.sock"),
            inline_value_limit: 16 * 1024,
            handle_table: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for EngineConfig
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    pub fn inline_value_limit(mut self, bytes: usize) -> Self {
        self.config.inline_value_limit = bytes;
        self
    }

    pub fn handle_table(mut self, table: Arc<HandleTable>) -> Self {
        self.config.handle_table = Some(table);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
