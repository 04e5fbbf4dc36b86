//! Session Handler
//!
//! Serves one client connection: handshake, then framed requests in a loop.

use std::collections::HashSet;
use std::io::{ErrorKind as IoErrorKind, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;

use super::broker::SubscriptionKind;
use super::Engine;
use crate::error::{MuxError, Result};
use crate::protocol::{
    encode_frame, read_frame, CommandRequest, ConnectionRequest, FrameDecoder, PushKind,
    Response, ResponseValue, Value,
};
use crate::writer::OutboundWriter;

/// Channels a session is subscribed to
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    pub channels: HashSet<Vec<u8>>,
    pub patterns: HashSet<Vec<u8>>,
    pub sharded: HashSet<Vec<u8>>,
}

impl Subscriptions {
    fn table(&mut self, kind: SubscriptionKind) -> &mut HashSet<Vec<u8>> {
        match kind {
            SubscriptionKind::Exact => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
            SubscriptionKind::Sharded => &mut self.sharded,
        }
    }

    pub fn count(&self) -> usize {
        self.channels.len() + self.patterns.len() + self.sharded.len()
    }
}

/// The parts of a session other threads may use: its writer and its
/// subscription state
pub struct SessionHandle {
    id: u64,
    writer: OutboundWriter<UnixStream>,
    control: UnixStream,
    name: Mutex<Option<String>>,
    subscriptions: Mutex<Subscriptions>,
}

impl SessionHandle {
    pub fn new(id: u64, stream: &UnixStream) -> Result<Self> {
        Ok(Self {
            id,
            writer: OutboundWriter::new(stream.try_clone()?),
            control: stream.try_clone()?,
            name: Mutex::new(None),
            subscriptions: Mutex::new(Subscriptions::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: Option<String>) {
        *self.name.lock() = name;
    }

    /// Snapshot of the current subscriptions
    pub fn subscriptions(&self) -> Subscriptions {
        self.subscriptions.lock().clone()
    }

    /// Add channels; returns the subscription count after each one
    pub fn subscribe(&self, kind: SubscriptionKind, channels: &[Vec<u8>]) -> Vec<(Vec<u8>, usize)> {
        let mut subscriptions = self.subscriptions.lock();
        channels
            .iter()
            .map(|channel| {
                subscriptions.table(kind).insert(channel.clone());
                (channel.clone(), subscriptions.count())
            })
            .collect()
    }

    /// Remove channels (all of `kind` when `channels` is empty)
    pub fn unsubscribe(&self, kind: SubscriptionKind, channels: &[Vec<u8>]) -> Vec<(Vec<u8>, usize)> {
        let mut subscriptions = self.subscriptions.lock();
        let targets: Vec<Vec<u8>> = if channels.is_empty() {
            subscriptions.table(kind).iter().cloned().collect()
        } else {
            channels.to_vec()
        };
        targets
            .into_iter()
            .map(|channel| {
                subscriptions.table(kind).remove(&channel);
                let count = subscriptions.count();
                (channel, count)
            })
            .collect()
    }

    /// Encode and queue one response frame
    pub fn send(&self, response: &Response) -> Result<()> {
        let frame = encode_frame(response)?;
        self.writer.enqueue(&frame)
    }

    /// Queue a push frame
    pub fn push(&self, kind: PushKind, data: Vec<Value>) -> Result<()> {
        self.send(&Response::push(ResponseValue::Inline(Value::Push { kind, data })))
    }

    /// Send a closing error and shut the stream down
    pub fn close(&self, message: &str) {
        if let Err(e) = self.send(&Response::closing(message)) {
            tracing::debug!("Closing error to session {} not sent: {}", self.id, e);
        }
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

/// Handles a single client connection
pub struct Session {
    reader: UnixStream,
    handle: Arc<SessionHandle>,
    engine: Arc<Engine>,
}

impl Session {
    pub fn new(id: u64, stream: UnixStream, engine: Arc<Engine>) -> Result<Self> {
        let handle = Arc::new(SessionHandle::new(id, &stream)?);
        Ok(Self {
            reader: stream,
            handle,
            engine,
        })
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        Arc::clone(&self.handle)
    }

    /// Serve the session (blocking until closed)
    pub fn run(mut self) -> Result<()> {
        let max_frame_size = self.engine.config().max_frame_size;

        let request: ConnectionRequest = match read_frame(&mut self.reader, max_frame_size) {
            Ok(request) => request,
            Err(MuxError::Io(ref e)) if e.kind() == IoErrorKind::UnexpectedEof => {
                // Peers probing whether the socket is alive connect and leave
                tracing::debug!("Session {} closed before handshake", self.handle.id());
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Session {} sent a bad handshake: {}", self.handle.id(), e);
                self.handle.close(&format!("bad connection request: {}", e));
                return Err(e);
            }
        };

        self.engine.accept(&self.handle, request)?;
        tracing::debug!("Session {} ready", self.handle.id());

        let result = self.serve(max_frame_size);
        self.engine.broker().unregister(self.handle.id());
        tracing::debug!("Session {} ended", self.handle.id());
        result
    }

    fn serve(&mut self, max_frame_size: u32) -> Result<()> {
        let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let read = match self.reader.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(ref e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        IoErrorKind::ConnectionReset
                            | IoErrorKind::ConnectionAborted
                            | IoErrorKind::BrokenPipe
                    ) =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e.into()),
            };

            let requests: Vec<CommandRequest> = match decoder.feed(&buffer[..read]) {
                Ok(requests) => requests,
                Err(e) => {
                    tracing::warn!("Session {} sent undecodable data: {}", self.handle.id(), e);
                    self.handle.close(&e.to_string());
                    return Err(e);
                }
            };

            for request in requests {
                tracing::trace!("Session {} request {:?}", self.handle.id(), request);
                let response = self.engine.execute(&self.handle, request);
                if let Err(e) = self.handle.send(&response) {
                    tracing::debug!("Session {} write failed: {}", self.handle.id(), e);
                    return Ok(());
                }
            }
        }
    }
}
