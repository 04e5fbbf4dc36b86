//! Response definitions
//!
//! Messages sent from the engine back to the client.

use serde::{Deserialize, Serialize};

use super::Value;
use crate::error::RequestErrorType;

/// Fixed acknowledgement replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstantResponse {
    Ok,
}

/// Identifier of a value stored out of band.
///
/// Two 32-bit halves of one 64-bit identifier, resolved by a
/// [`ValueResolver`](crate::client::ValueResolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueHandle {
    pub high: u32,
    pub low: u32,
}

impl ValueHandle {
    pub fn from_u64(id: u64) -> Self {
        Self {
            high: (id >> 32) as u32,
            low: id as u32,
        }
    }

    pub fn as_u64(self) -> u64 {
        ((self.high as u64) << 32) | self.low as u64
    }
}

/// A failure reported for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    /// Raw wire tag, see [`RequestErrorType`]
    pub error_type: u32,
    pub message: String,
}

impl RequestError {
    pub fn new(error_type: RequestErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.tag(),
            message: message.into(),
        }
    }
}

/// Response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseValue {
    /// Fatal: the engine is tearing the connection down
    ClosingError(String),
    RequestError(RequestError),
    Constant(ConstantResponse),
    Inline(Value),
    Handle(ValueHandle),
}

/// A framed response or push notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id; meaningless when `is_push` is set
    pub callback_idx: u32,

    /// `None` is a null reply
    pub value: Option<ResponseValue>,

    pub is_push: bool,
}

impl Response {
    pub fn ok(callback_idx: u32) -> Self {
        Self {
            callback_idx,
            value: Some(ResponseValue::Constant(ConstantResponse::Ok)),
            is_push: false,
        }
    }

    pub fn nil(callback_idx: u32) -> Self {
        Self {
            callback_idx,
            value: None,
            is_push: false,
        }
    }

    pub fn value(callback_idx: u32, value: Value) -> Self {
        Self {
            callback_idx,
            value: Some(ResponseValue::Inline(value)),
            is_push: false,
        }
    }

    pub fn handle(callback_idx: u32, handle: ValueHandle) -> Self {
        Self {
            callback_idx,
            value: Some(ResponseValue::Handle(handle)),
            is_push: false,
        }
    }

    pub fn error(callback_idx: u32, error_type: RequestErrorType, message: impl Into<String>) -> Self {
        Self {
            callback_idx,
            value: Some(ResponseValue::RequestError(RequestError::new(
                error_type, message,
            ))),
            is_push: false,
        }
    }

    /// Closing errors are not tied to a request
    pub fn closing(message: impl Into<String>) -> Self {
        Self {
            callback_idx: u32::MAX,
            value: Some(ResponseValue::ClosingError(message.into())),
            is_push: false,
        }
    }

    pub fn push(value: ResponseValue) -> Self {
        Self {
            callback_idx: 0,
            value: Some(value),
            is_push: true,
        }
    }
}
