//! Out-of-band value handles
//!
//! Some replies are not carried inline in the response frame. The engine
//! stores the value elsewhere and sends a [`ValueHandle`]; a
//! [`ValueResolver`] injected into the client turns the handle back into the
//! value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{MuxError, Result};
use crate::protocol::{Value, ValueHandle};

/// Resolves value handles received in response frames
pub trait ValueResolver: Send + Sync + std::fmt::Debug {
    /// Produce the value behind `handle`.
    ///
    /// Fails with [`MuxError::Decode`] when the handle is unknown.
    fn resolve(&self, handle: ValueHandle) -> Result<Value>;
}

/// In-process handle store shared by an engine and its clients.
///
/// Each stored value can be resolved once; resolving hands ownership to
/// the caller and frees the entry.
#[derive(Debug)]
pub struct HandleTable {
    values: Mutex<HashMap<u64, Value>>,
    next_id: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Store a value and return its handle
    pub fn store(&self, value: Value) -> ValueHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.values.lock().insert(id, value);
        ValueHandle::from_u64(id)
    }

    /// Number of stored, not yet resolved values
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueResolver for HandleTable {
    fn resolve(&self, handle: ValueHandle) -> Result<Value> {
        self.values.lock().remove(&handle.as_u64()).ok_or_else(|| {
            MuxError::Decode(format!("Unknown value handle {:#x}", handle.as_u64()))
        })
    }
}
