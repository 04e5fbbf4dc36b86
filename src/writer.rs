//! Outbound Writer
//!
//! Accumulates encoded frames and drains them to the transport with at most
//! one flush in flight.
//!
//! ```text
//! caller 1 ─┐                     ┌──────────────┐
//! caller 2 ─┼─► pending (BytesMut) ─► flusher ─► │  transport   │
//! caller N ─┘                     └──────────────┘
//! ```
//!
//! Whichever caller finds the writer idle becomes the flusher and keeps
//! writing until the pending buffer is empty. Callers arriving while a flush
//! is in progress only append and return.

use std::io::Write;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::Result;

/// Initial capacity of the pending buffer
const INITIAL_CAPACITY: usize = 16 * 1024;

struct WriteState {
    /// Frames waiting to be written, in enqueue order
    pending: BytesMut,

    /// True while some caller is draining `pending`
    flushing: bool,
}

/// Serializes frame writes onto one transport
pub struct OutboundWriter<W: Write> {
    state: Mutex<WriteState>,

    /// Only the current flusher touches the sink
    sink: Mutex<W>,
}

impl<W: Write> OutboundWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            state: Mutex::new(WriteState {
                pending: BytesMut::with_capacity(INITIAL_CAPACITY),
                flushing: false,
            }),
            sink: Mutex::new(sink),
        }
    }

    /// Queue one encoded frame.
    ///
    /// Starts a flush when the writer is idle; otherwise the flush already in
    /// progress picks the frame up.
    pub fn enqueue(&self, frame: &[u8]) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.pending.extend_from_slice(frame);
            if state.flushing {
                return Ok(());
            }
            state.flushing = true;
        }

        self.flush()
    }

    /// Drain the pending buffer until nothing new has accumulated
    fn flush(&self) -> Result<()> {
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    state.flushing = false;
                    return Ok(());
                }
                state.pending.split()
            };

            tracing::trace!("Flushing {} bytes", batch.len());

            let written = {
                let mut sink = self.sink.lock();
                sink.write_all(&batch).and_then(|_| sink.flush())
            };

            if let Err(e) = written {
                let mut state = self.state.lock();
                state.flushing = false;
                state.pending.clear();
                return Err(e.into());
            }
        }
    }

    /// Bytes queued but not yet handed to the transport
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }
}
