//! Pending-Notification Queue
//!
//! Push notifications are either handed to a callback as soon as they are
//! decoded, or queued until the application pulls them. Queued
//! notifications and blocked pullers are paired first-in first-out.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam::channel::Sender;

use crate::error::{MuxError, Result};
use crate::protocol::{PubSubSubscriptions, PushKind, Value};

/// A message published on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub kind: PushKind,
    pub channel: Vec<u8>,

    /// Matching pattern, for pattern subscriptions
    pub pattern: Option<Vec<u8>>,

    pub message: Vec<u8>,
}

impl PubSubMessage {
    /// Build from a decoded push value.
    ///
    /// Returns `Ok(None)` for informational kinds (subscription
    /// acknowledgements, disconnect) that carry nothing for the application.
    pub fn from_push(kind: PushKind, data: Vec<Value>) -> Result<Option<Self>> {
        if !kind.is_message() {
            return Ok(None);
        }

        let mut parts = data
            .into_iter()
            .map(|value| match value {
                Value::Bytes(bytes) => Ok(bytes),
                Value::Text(text) => Ok(text.into_bytes()),
                other => Err(MuxError::Decode(format!(
                    "unexpected push element {:?}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let expected = if kind == PushKind::PMessage { 3 } else { 2 };
        if parts.len() != expected {
            return Err(MuxError::Decode(format!(
                "{:?} push with {} elements (expected {})",
                kind,
                parts.len(),
                expected
            )));
        }

        let message = parts.pop().unwrap_or_default();
        let channel = parts.pop().unwrap_or_default();
        let pattern = parts.pop();

        Ok(Some(Self {
            kind,
            channel,
            pattern,
            message,
        }))
    }
}

/// Callback receiving push notifications in callback mode
pub type PushCallback = Arc<dyn Fn(PubSubMessage) + Send + Sync + 'static>;

/// How push notifications reach the application
#[derive(Clone)]
pub enum PubSubMode {
    /// Every notification goes straight to the callback
    Callback(PushCallback),

    /// Notifications queue up until pulled
    Pull,
}

impl std::fmt::Debug for PubSubMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubMode::Callback(_) => f.write_str("Callback"),
            PubSubMode::Pull => f.write_str("Pull"),
        }
    }
}

/// Subscription configuration sent with the handshake
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub subscriptions: PubSubSubscriptions,
    pub mode: PubSubMode,
}

impl PubSubConfig {
    pub fn pull(subscriptions: PubSubSubscriptions) -> Self {
        Self {
            subscriptions,
            mode: PubSubMode::Pull,
        }
    }

    pub fn callback(
        subscriptions: PubSubSubscriptions,
        callback: impl Fn(PubSubMessage) + Send + Sync + 'static,
    ) -> Self {
        Self {
            subscriptions,
            mode: PubSubMode::Callback(Arc::new(callback)),
        }
    }
}

/// Reply slot of a blocked puller
pub type Waiter = Sender<Result<PubSubMessage>>;

/// Notifications not yet delivered, and pullers waiting for one
#[derive(Default)]
pub struct NotificationQueue {
    messages: VecDeque<PubSubMessage>,
    waiters: VecDeque<Waiter>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a notification to the oldest waiter, or queue it
    pub fn push(&mut self, message: PubSubMessage) {
        let mut message = message;
        while let Some(waiter) = self.waiters.pop_front() {
            // Waiter channels have capacity one and receive at most once
            match waiter.try_send(Ok(message)) {
                Ok(()) => return,
                Err(e) => {
                    let Ok(returned) = e.into_inner() else { return };
                    message = returned;
                }
            }
        }
        self.messages.push_back(message);
    }

    /// Take the oldest queued notification
    pub fn pop(&mut self) -> Option<PubSubMessage> {
        self.messages.pop_front()
    }

    pub fn add_waiter(&mut self, waiter: Waiter) {
        self.waiters.push_back(waiter);
    }

    pub fn drain_waiters(&mut self) -> Vec<Waiter> {
        self.waiters.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
