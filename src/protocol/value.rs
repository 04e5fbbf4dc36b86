//! Value definitions
//!
//! Reply values carried inline in response frames or behind a value handle.

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// How byte-string replies should be surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decoder {
    /// Keep bulk strings as raw bytes
    #[default]
    Bytes,

    /// Convert bulk strings to UTF-8 text (fails on invalid UTF-8)
    String,
}

/// Push message kinds emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushKind {
    Message,
    PMessage,
    SMessage,
    Subscribe,
    PSubscribe,
    SSubscribe,
    Unsubscribe,
    PUnsubscribe,
    SUnsubscribe,
    Disconnect,
    Other(String),
}

impl PushKind {
    /// Kinds that carry a published message for the application
    pub fn is_message(&self) -> bool {
        matches!(self, PushKind::Message | PushKind::PMessage | PushKind::SMessage)
    }
}

/// A reply value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Okay,
    Int(i64),
    Double(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Push { kind: PushKind, data: Vec<Value> },
}

impl Value {
    /// Borrow the raw bytes of a string-like value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Apply a [`Decoder`] to this value, recursing into aggregates
    pub fn decode(self, decoder: Decoder) -> Result<Value> {
        match decoder {
            Decoder::Bytes => Ok(self),
            Decoder::String => self.into_text(),
        }
    }

    fn into_text(self) -> Result<Value> {
        Ok(match self {
            Value::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Value::Text(text),
                Err(e) => {
                    return Err(MuxError::Decode(format!(
                        "reply is not valid UTF-8: {}",
                        e.utf8_error()
                    )))
                }
            },
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::into_text)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(pairs) => Value::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| Ok((k.into_text()?, v.into_text()?)))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Push { kind, data } => Value::Push {
                kind,
                data: data
                    .into_iter()
                    .map(Value::into_text)
                    .collect::<Result<Vec<_>>>()?,
            },
            other => other,
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}
