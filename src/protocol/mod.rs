//! Protocol Module
//!
//! Defines the wire protocol between the client binding and the engine.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬─────────────────────────────────────┐
//! │ Len (4)  │      bincode-encoded message        │
//! └──────────┴─────────────────────────────────────┘
//! ```
//!
//! ### Client → Engine
//! - one [`ConnectionRequest`] (handshake), then
//! - any number of [`CommandRequest`]s, each tagged with a callback id
//!
//! ### Engine → Client
//! - [`Response`]s, each either correlated to a callback id, a push
//!   notification (`is_push`), or a fatal closing error

mod command;
mod response;
mod value;
mod codec;

pub use command::{
    Command, CommandRequest, ConnectionRequest, NodeAddress, PubSubSubscriptions, RequestKind,
    Route,
};
pub use response::{ConstantResponse, RequestError, Response, ResponseValue, ValueHandle};
pub use value::{Decoder, PushKind, Value};
pub use codec::{
    decode_frame, encode_frame, encode_frame_into, feed_frames, read_frame, write_frame,
    FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE,
};
