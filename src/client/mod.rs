//! Client Module
//!
//! Multiplexes many concurrently pending requests over one duplex stream.
//!
//! ## Architecture
//! - Callback registry hands out correlation ids
//! - Outbound writer serializes frames onto the stream
//! - One reader thread per connection decodes frames
//! - Dispatcher routes responses to callers and pushes to subscribers

mod registry;
mod dispatcher;
mod pubsub;
mod handle;
mod transport;
mod connection;

pub use registry::{AbandonHandle, CallbackRegistry, Completion, PendingRequest};
pub use dispatcher::{CloseReason, ConnectionStatus, Dispatcher, Flow};
pub use pubsub::{NotificationQueue, PubSubConfig, PubSubMessage, PubSubMode, PushCallback, Waiter};
pub use handle::{HandleTable, ValueResolver};
pub use transport::Transport;
pub use connection::{Connection, PendingReply};
