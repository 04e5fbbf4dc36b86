//! Client Connection
//!
//! Ties the pieces together for one duplex stream:
//!
//! ```text
//!  callers ──► Dispatcher.register ──► encode_frame ──► OutboundWriter ──► stream
//!                                                                             │
//!  callers ◄── completion ◄── Dispatcher.dispatch ◄── FrameDecoder ◄── reader thread
//! ```
//!
//! The reader thread is the only owner of the partial-read buffer. Callers
//! only touch the dispatcher state briefly and the writer's queue.

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use super::dispatcher::{CloseReason, ConnectionStatus, Dispatcher, Flow};
use super::pubsub::PubSubMessage;
use super::registry::{AbandonHandle, PendingRequest};
use super::transport::Transport;
use crate::config::ClientConfig;
use crate::error::{MuxError, Result};
use crate::protocol::{
    encode_frame, read_frame, write_frame, Command, CommandRequest, Decoder, FrameDecoder,
    RequestKind, Response, Route, Value,
};
use crate::writer::OutboundWriter;

type Shutdown = Box<dyn Fn() -> std::io::Result<()> + Send + Sync>;

struct Inner {
    dispatcher: Dispatcher,
    writer: OutboundWriter<Box<dyn Write + Send>>,
    shutdown: Shutdown,
    config: ClientConfig,
    peer: String,
}

impl Inner {
    /// Tear the connection down and unblock the reader
    fn teardown(&self, reason: CloseReason) -> usize {
        let failed = self.dispatcher.close(reason);
        self.shutdown_stream();
        failed
    }

    fn shutdown_stream(&self) {
        if let Err(e) = (self.shutdown)() {
            if e.kind() != IoErrorKind::NotConnected {
                tracing::debug!("Shutdown of {} failed: {}", self.peer, e);
            }
        }
    }
}

/// A multiplexed connection to the engine
pub struct Connection {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to an engine listening on a Unix socket
    pub fn connect(path: impl AsRef<Path>, config: ClientConfig) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).map_err(|e| {
            MuxError::Connection(format!(
                "failed to connect to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::with_transport(stream, config)
    }

    /// Run the handshake over `transport` and start the reader thread
    pub fn with_transport<T: Transport>(mut transport: T, config: ClientConfig) -> Result<Self> {
        let peer = transport.describe();
        let pubsub_mode = config.pubsub.as_ref().map(|p| p.mode.clone());
        let dispatcher = Dispatcher::new(
            config.resolver.clone(),
            pubsub_mode,
            config.max_inflight_requests,
        );

        Self::handshake(&mut transport, &dispatcher, &config).map_err(|e| {
            let _ = transport.shutdown_transport();
            e
        })?;

        tracing::debug!("Connection to {} established", peer);

        let read_half = transport.try_clone_transport()?;
        let control = transport.try_clone_transport()?;
        let write_half: Box<dyn Write + Send> = Box::new(transport);

        let inner = Arc::new(Inner {
            dispatcher,
            writer: OutboundWriter::new(write_half),
            shutdown: Box::new(move || control.shutdown_transport()),
            config,
            peer,
        });

        let reader = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("muxkv-reader".to_string())
                .spawn(move || read_loop(read_half, inner))?
        };

        Ok(Self {
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Send the configuration message and wait for its acknowledgement.
    ///
    /// The acknowledgement goes through the dispatcher like any other
    /// response, under the first callback id.
    fn handshake<T: Transport>(
        transport: &mut T,
        dispatcher: &Dispatcher,
        config: &ClientConfig,
    ) -> Result<()> {
        let (sender, receiver) = bounded(1);
        let id = dispatcher.register(PendingRequest::new(Decoder::Bytes, move |outcome| {
            let _ = sender.send(outcome);
        }))?;

        transport.set_read_timeout_transport(Some(config.connection_timeout()))?;
        write_frame(transport, &config.connection_request())?;

        let response: Response = read_frame(transport, config.max_frame_size).map_err(|e| match e {
            MuxError::Io(io) => MuxError::Connection(format!("handshake failed: {}", io)),
            other => other,
        })?;
        transport.set_read_timeout_transport(None)?;

        if !response.is_push && response.callback_idx != id {
            tracing::warn!(
                "Handshake answered with callback id {} (expected {})",
                response.callback_idx,
                id
            );
        }
        dispatcher.dispatch_one(response);

        match receiver.try_recv() {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MuxError::Decode(
                "unexpected reply to connection request".to_string(),
            )),
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Issue a request; the outcome is delivered to `completion` exactly once.
    ///
    /// Returns the callback id. On `Err` the completion is never called.
    pub fn submit_with_callback(
        &self,
        kind: RequestKind,
        route: Option<Route>,
        decoder: Decoder,
        completion: impl FnOnce(Result<Value>) + Send + 'static,
    ) -> Result<u32> {
        self.submit_pending(kind, route, PendingRequest::new(decoder, completion))
    }

    fn submit_pending(
        &self,
        kind: RequestKind,
        route: Option<Route>,
        request: PendingRequest,
    ) -> Result<u32> {
        let id = self.inner.dispatcher.register(request)?;

        let frame = match encode_frame(&CommandRequest {
            callback_idx: id,
            kind,
            route,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.dispatcher.unregister(id);
                return Err(e);
            }
        };

        tracing::trace!("Sending request {} ({} bytes)", id, frame.len());

        if let Err(e) = self.inner.writer.enqueue(&frame) {
            tracing::error!("Write to {} failed: {}", self.inner.peer, e);
            let entry = self.inner.dispatcher.unregister(id);
            self.inner.teardown(CloseReason::Transport(e.to_string()));
            if entry.is_none() {
                // A concurrent close already delivered the outcome
                return Ok(id);
            }
            return Err(MuxError::Connection(e.to_string()));
        }

        Ok(id)
    }

    /// Issue a request and get a handle to wait on
    pub fn submit(
        &self,
        kind: RequestKind,
        route: Option<Route>,
        decoder: Decoder,
    ) -> Result<PendingReply> {
        let (sender, receiver) = bounded(1);
        let request = PendingRequest::new(decoder, move |outcome| {
            let _ = sender.send(outcome);
        });
        let abandon = request.abandon_handle();
        let id = self.submit_pending(kind, route, request)?;

        Ok(PendingReply {
            id,
            receiver,
            abandon,
            timeout: self.inner.config.request_timeout(),
        })
    }

    /// Issue a request and wait for its outcome with the configured timeout
    pub fn request(&self, kind: RequestKind, route: Option<Route>) -> Result<Value> {
        self.submit(kind, route, self.inner.config.decoder)?.wait()
    }

    /// Run a single command
    pub fn custom_command(&self, command: Command) -> Result<Value> {
        self.request(RequestKind::Single(command), None)
    }

    /// Run a single command on a specific route
    pub fn custom_command_routed(&self, command: Command, route: Route) -> Result<Value> {
        self.request(RequestKind::Single(command), Some(route))
    }

    /// Run several commands; `atomic` makes them a transaction
    pub fn exec_batch(&self, commands: Vec<Command>, atomic: bool) -> Result<Value> {
        self.request(RequestKind::Batch { commands, atomic }, None)
    }

    /// Invoke a stored script by hash
    pub fn invoke_script(
        &self,
        hash: impl Into<String>,
        keys: Vec<Vec<u8>>,
        args: Vec<Vec<u8>>,
    ) -> Result<Value> {
        self.request(
            RequestKind::Script {
                hash: hash.into(),
                keys,
                args,
            },
            None,
        )
    }

    /// Replace the password the engine uses to (re)authenticate
    pub fn update_connection_password(
        &self,
        password: Option<String>,
        immediate_auth: bool,
    ) -> Result<Value> {
        self.request(
            RequestKind::UpdatePassword {
                password,
                immediate_auth,
            },
            None,
        )
    }

    // =========================================================================
    // Push Notifications
    // =========================================================================

    /// Wait for the next pubsub message
    pub fn get_pubsub_message(&self) -> Result<PubSubMessage> {
        self.inner.dispatcher.pull()
    }

    /// Take a queued pubsub message, if any, without waiting
    pub fn try_get_pubsub_message(&self) -> Result<Option<PubSubMessage>> {
        self.inner.dispatcher.try_pull()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn status(&self) -> ConnectionStatus {
        self.inner.dispatcher.status()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.dispatcher.close_reason()
    }

    /// Requests waiting for a response, abandoned ones included
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    /// Callers blocked in `get_pubsub_message`
    pub fn waiting_pullers(&self) -> usize {
        self.inner.dispatcher.waiting_pullers()
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Close the connection, failing everything still waiting.
    ///
    /// Idempotent. Returns the number of requests and waiters failed.
    pub fn close(&self) -> usize {
        let failed = self.inner.teardown(CloseReason::Requested);
        if let Some(reader) = self.reader.lock().take() {
            // Dropped from a callback running on the reader itself
            if reader.thread().id() == std::thread::current().id() {
                return failed;
            }
            if reader.join().is_err() {
                tracing::warn!("Reader thread for {} panicked", self.inner.peer);
            }
        }
        failed
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to the outcome of one submitted request
#[derive(Debug)]
pub struct PendingReply {
    id: u32,
    receiver: Receiver<Result<Value>>,
    abandon: AbandonHandle,
    timeout: Duration,
}

impl PendingReply {
    /// Callback id of the request
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait with the connection's request timeout
    pub fn wait(self) -> Result<Value> {
        let timeout = self.timeout;
        self.wait_timeout(timeout)
    }

    /// Wait at most `timeout`.
    ///
    /// On expiry the request is abandoned: its id stays reserved until the
    /// engine answers, and that late answer is discarded.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Value> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.abandon.abandon();
                // The response may have landed between the timer and the flag
                if let Ok(outcome) = self.receiver.try_recv() {
                    return outcome;
                }
                tracing::debug!("Request {} timed out after {:?}", self.id, timeout);
                Err(MuxError::Timeout(format!(
                    "no response for request {} within {:?}",
                    self.id, timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(MuxError::Closing("connection closed".to_string()))
            }
        }
    }

    /// Wait without a deadline
    pub fn wait_forever(self) -> Result<Value> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(MuxError::Closing("connection closed".to_string())))
    }
}

/// Tears the connection down if the reader unwinds out of a user callback
struct ReaderGuard(Arc<Inner>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Reader for {} panicked in a callback", self.0.peer);
            self.0
                .teardown(CloseReason::Transport("reader thread exited".to_string()));
        }
    }
}

/// Reader thread body: bytes → frames → dispatcher
fn read_loop<R: Read>(mut reader: R, inner: Arc<Inner>) {
    let _guard = ReaderGuard(Arc::clone(&inner));
    let mut decoder = FrameDecoder::with_max_frame_size(inner.config.max_frame_size);
    let mut buffer = vec![0u8; inner.config.read_buffer_size.max(1)];

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!("Engine at {} closed the stream", inner.peer);
                inner.teardown(CloseReason::Transport(
                    "engine closed the stream".to_string(),
                ));
                break;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => {
                if inner.dispatcher.status() == ConnectionStatus::Open {
                    tracing::warn!("Error reading from {}: {}", inner.peer, e);
                }
                inner.teardown(CloseReason::Transport(e.to_string()));
                break;
            }
        };

        match decoder.feed::<Response>(&buffer[..read]) {
            Ok(frames) => {
                if inner.dispatcher.dispatch(frames) == Flow::Stop {
                    inner.shutdown_stream();
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Undecodable data from {}: {}", inner.peer, e);
                inner.teardown(CloseReason::Decode(e.to_string()));
                break;
            }
        }
    }

    tracing::trace!("Reader for {} exiting", inner.peer);
}
