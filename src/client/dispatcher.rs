//! Response Dispatcher
//!
//! Routes every decoded response frame to the right consumer and owns the
//! per-connection state that routing needs.
//!
//! ## Routing
//! ```text
//!                       ┌──────────────────────┐
//!   closing error ────► │ close: fail all      │
//!                       └──────────────────────┘
//!                       ┌──────────────────────┐
//!   is_push ──────────► │ callback / queue     │
//!                       └──────────────────────┘
//!                       ┌──────────────────────┐
//!   callback_idx ─────► │ registry.release(id) │ ─► completion(Ok | Err)
//!                       └──────────────────────┘
//! ```
//!
//! ## Concurrency
//! All mutable state lives behind one mutex. Completions and push callbacks
//! always run after the mutex is released, so they may call back into the
//! connection.

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::bounded;
use parking_lot::Mutex;

use super::handle::ValueResolver;
use super::pubsub::{NotificationQueue, PubSubMessage, PubSubMode};
use super::registry::{CallbackRegistry, PendingRequest};
use crate::error::{classify_request_error, MuxError, Result};
use crate::protocol::{ConstantResponse, Decoder, Response, ResponseValue, Value};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    Closing,
    Closed,
}

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The application called `close`
    Requested,

    /// The engine sent a closing error frame
    EngineClosing(String),

    /// The transport failed or reached end of stream
    Transport(String),

    /// A frame could not be decoded; the stream can no longer be framed
    Decode(String),
}

impl CloseReason {
    /// The error delivered to every pending request and waiter
    pub fn to_error(&self) -> MuxError {
        match self {
            CloseReason::Requested => MuxError::Closing("connection closed".to_string()),
            CloseReason::EngineClosing(message) => MuxError::Closing(message.clone()),
            CloseReason::Transport(message) => MuxError::Connection(message.clone()),
            CloseReason::Decode(message) => MuxError::Decode(message.clone()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed by client"),
            CloseReason::EngineClosing(message) => write!(f, "closed by engine: {}", message),
            CloseReason::Transport(message) => write!(f, "transport failure: {}", message),
            CloseReason::Decode(message) => write!(f, "undecodable frame: {}", message),
        }
    }
}

/// Whether the reader should keep feeding frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

struct State {
    status: ConnectionStatus,
    close_reason: Option<CloseReason>,
    registry: CallbackRegistry,
    notifications: NotificationQueue,
}

/// Per-connection routing state machine
pub struct Dispatcher {
    state: Mutex<State>,
    resolver: Option<Arc<dyn ValueResolver>>,
    pubsub: Option<PubSubMode>,

    /// 0 disables the limit
    max_inflight: usize,
}

impl Dispatcher {
    pub fn new(
        resolver: Option<Arc<dyn ValueResolver>>,
        pubsub: Option<PubSubMode>,
        max_inflight: usize,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                status: ConnectionStatus::Open,
                close_reason: None,
                registry: CallbackRegistry::new(),
                notifications: NotificationQueue::new(),
            }),
            resolver,
            pubsub,
            max_inflight,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().close_reason.clone()
    }

    /// Reserved plus pending requests, abandoned ones included
    pub fn pending_count(&self) -> usize {
        self.state.lock().registry.pending_count()
    }

    /// Notifications queued for pulling
    pub fn queued_notifications(&self) -> usize {
        self.state.lock().notifications.len()
    }

    /// Callers blocked in `pull`
    pub fn waiting_pullers(&self) -> usize {
        self.state.lock().notifications.waiter_count()
    }

    // =========================================================================
    // Request Side
    // =========================================================================

    /// Register a pending request and return its callback id
    pub fn register(&self, request: PendingRequest) -> Result<u32> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;

        if self.max_inflight > 0 && state.registry.pending_count() >= self.max_inflight {
            return Err(MuxError::Request(
                "Client reached maximum inflight requests".to_string(),
            ));
        }

        Ok(state.registry.insert(request))
    }

    /// Take back a request that never made it onto the wire
    pub fn unregister(&self, id: u32) -> Option<PendingRequest> {
        self.state.lock().registry.release(id)
    }

    // =========================================================================
    // Response Side
    // =========================================================================

    /// Route a batch of decoded frames, stopping at a fatal one
    pub fn dispatch(&self, responses: Vec<Response>) -> Flow {
        for response in responses {
            if self.dispatch_one(response) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Route one decoded frame
    pub fn dispatch_one(&self, response: Response) -> Flow {
        if self.status() != ConnectionStatus::Open {
            return Flow::Stop;
        }

        if let Some(ResponseValue::ClosingError(message)) = &response.value {
            tracing::error!("Engine closed the connection: {}", message);
            self.close(CloseReason::EngineClosing(message.clone()));
            return Flow::Stop;
        }

        if response.is_push {
            self.deliver_push(response.value);
            return Flow::Continue;
        }

        let entry = self.state.lock().registry.release(response.callback_idx);
        let Some(entry) = entry else {
            tracing::warn!(
                "Dropping response for unknown callback id {}",
                response.callback_idx
            );
            return Flow::Continue;
        };

        if entry.is_abandoned() {
            // Resolve anyway so out-of-band storage is freed
            let _ = self.resolve_reply(response.value, entry.decoder);
            tracing::debug!(
                "Late response for abandoned callback id {} discarded",
                response.callback_idx
            );
            return Flow::Continue;
        }

        tracing::trace!("Resolving callback id {}", response.callback_idx);
        let outcome = self.resolve_reply(response.value, entry.decoder);
        entry.complete(outcome);
        Flow::Continue
    }

    fn resolve_reply(&self, value: Option<ResponseValue>, decoder: Decoder) -> Result<Value> {
        match value {
            None => Ok(Value::Nil),
            Some(ResponseValue::Constant(ConstantResponse::Ok)) => Ok(Value::Okay),
            Some(ResponseValue::RequestError(err)) => {
                Err(classify_request_error(err.error_type, err.message))
            }
            Some(ResponseValue::Inline(value)) => value.decode(decoder),
            Some(ResponseValue::Handle(handle)) => self.resolve_handle(handle)?.decode(decoder),
            Some(ResponseValue::ClosingError(message)) => Err(MuxError::Closing(message)),
        }
    }

    fn resolve_handle(&self, handle: crate::protocol::ValueHandle) -> Result<Value> {
        match &self.resolver {
            Some(resolver) => resolver.resolve(handle),
            None => Err(MuxError::Decode(format!(
                "Received value handle {:#x} but no resolver is configured",
                handle.as_u64()
            ))),
        }
    }

    fn deliver_push(&self, value: Option<ResponseValue>) {
        let message = match self.resolve_reply(value, Decoder::Bytes) {
            Ok(Value::Push { kind, data }) => match PubSubMessage::from_push(kind.clone(), data) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    tracing::debug!("Informational push {:?}", kind);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Dropping malformed push: {}", e);
                    return;
                }
            },
            Ok(other) => {
                tracing::warn!("Dropping push frame without push payload: {:?}", other);
                return;
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable push: {}", e);
                return;
            }
        };

        match &self.pubsub {
            Some(PubSubMode::Callback(callback)) => callback(message),
            Some(PubSubMode::Pull) => self.state.lock().notifications.push(message),
            None => {
                tracing::warn!("Push received but no subscriptions are configured");
            }
        }
    }

    // =========================================================================
    // Pulling Notifications
    // =========================================================================

    fn ensure_open(state: &State) -> Result<()> {
        if state.status == ConnectionStatus::Open {
            return Ok(());
        }
        let reason = state
            .close_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "connection closed".to_string());
        Err(MuxError::Closing(reason))
    }

    fn ensure_pull_allowed(&self, state: &State) -> Result<()> {
        Self::ensure_open(state)?;
        match &self.pubsub {
            Some(PubSubMode::Pull) => Ok(()),
            Some(PubSubMode::Callback(_)) => Err(MuxError::Config(
                "Pubsub callback is configured; messages cannot be pulled".to_string(),
            )),
            None => Err(MuxError::Config(
                "No pubsub subscriptions were configured".to_string(),
            )),
        }
    }

    /// Take a queued notification without waiting
    pub fn try_pull(&self) -> Result<Option<PubSubMessage>> {
        let mut state = self.state.lock();
        self.ensure_pull_allowed(&state)?;
        Ok(state.notifications.pop())
    }

    /// Take a queued notification, waiting for one if the queue is empty
    pub fn pull(&self) -> Result<PubSubMessage> {
        let receiver = {
            let mut state = self.state.lock();
            self.ensure_pull_allowed(&state)?;
            if let Some(message) = state.notifications.pop() {
                return Ok(message);
            }
            let (sender, receiver) = bounded(1);
            state.notifications.add_waiter(sender);
            receiver
        };

        receiver
            .recv()
            .unwrap_or_else(|_| Err(MuxError::Closing("connection closed".to_string())))
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Fail everything still waiting and mark the connection closed.
    ///
    /// Idempotent. Returns the number of requests and waiters failed.
    pub fn close(&self, reason: CloseReason) -> usize {
        let (entries, waiters) = {
            let mut state = self.state.lock();
            if state.status != ConnectionStatus::Open {
                return 0;
            }
            state.status = ConnectionStatus::Closing;
            state.close_reason = Some(reason.clone());
            while state.notifications.pop().is_some() {}
            (
                state.registry.drain_all(),
                state.notifications.drain_waiters(),
            )
        };

        tracing::debug!(
            "Closing connection ({}): failing {} requests and {} waiters",
            reason,
            entries.len(),
            waiters.len()
        );

        let mut failed = 0;
        for entry in entries {
            if entry.is_abandoned() {
                continue;
            }
            entry.complete(Err(reason.to_error()));
            failed += 1;
        }
        for waiter in waiters {
            if waiter.try_send(Err(reason.to_error())).is_ok() {
                failed += 1;
            }
        }

        self.state.lock().status = ConnectionStatus::Closed;
        failed
    }
}
