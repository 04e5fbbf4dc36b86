//! # muxkv
//!
//! An asynchronous request/response multiplexer for talking to a key-value
//! engine over a single duplex stream:
//! - Length-delimited frames with partial-read reassembly
//! - Many requests in flight at once, correlated by callback id
//! - Push notifications routed to a callback or a pull queue
//! - Connection-fatal errors broadcast to every waiting caller
//!
//! ## Architecture Overview
//!
//! ```text
//!   caller threads                                 reader thread
//! ┌────────────────┐                          ┌──────────────────────┐
//! │ Connection::   │  register id   ┌───────┐ │ FrameDecoder::feed   │
//! │ submit()  ─────┼──────────────▶ │       │ │          │           │
//! │                │                │Dispat-│ │          ▼           │
//! │  encode frame  │                │ cher  │◀┼── dispatch(Response) │
//! │       │        │                │       │ │                      │
//! │       ▼        │                └───┬───┘ └──────────▲───────────┘
//! │ OutboundWriter │            completion│ / push       │
//! └───────┬────────┘                      ▼              │
//!         │                     callers & subscribers    │
//!         ▼                                              │
//! ┌──────────────────────── duplex stream ───────────────┴──────────────┐
//! │                       engine (e.g. engine::Server)                  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod writer;
pub mod client;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{classify_request_error, ErrorKind, MuxError, RequestErrorType, Result};
pub use config::{ClientConfig, EngineConfig};
pub use client::{Connection, PendingReply, PubSubConfig, PubSubMessage};
pub use protocol::{Command, Decoder, Value};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of muxkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
