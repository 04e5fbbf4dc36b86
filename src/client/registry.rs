//! Callback Registry
//!
//! Assigns correlation ids to pending requests and recycles them.
//!
//! Ids index directly into a growable slot table. Released ids go onto a
//! free-list and the most recently freed id is handed out first; when the
//! free-list is empty the next sequential id is used.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MuxError, Result};
use crate::protocol::{Decoder, Value};

/// Completion invoked exactly once with the outcome of a request
pub type Completion = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Lets a caller that stopped waiting mark its request as abandoned.
///
/// The registry slot stays reserved until the engine answers or the
/// connection closes; the late answer is then discarded.
#[derive(Debug, Clone)]
pub struct AbandonHandle(Arc<AtomicBool>);

impl AbandonHandle {
    pub fn abandon(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A request awaiting its response
pub struct PendingRequest {
    completion: Completion,

    /// How to surface byte-string replies
    pub decoder: Decoder,

    abandoned: AbandonHandle,
}

impl PendingRequest {
    pub fn new(decoder: Decoder, completion: impl FnOnce(Result<Value>) + Send + 'static) -> Self {
        Self {
            completion: Box::new(completion),
            decoder,
            abandoned: AbandonHandle(Arc::new(AtomicBool::new(false))),
        }
    }

    pub fn abandon_handle(&self) -> AbandonHandle {
        self.abandoned.clone()
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_abandoned()
    }

    /// Consume the entry, delivering the outcome
    pub fn complete(self, outcome: Result<Value>) {
        (self.completion)(outcome)
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("decoder", &self.decoder)
            .field("abandoned", &self.is_abandoned())
            .finish_non_exhaustive()
    }
}

enum Slot {
    Free,
    Reserved,
    Pending(PendingRequest),
}

/// Per-connection table of pending requests
#[derive(Default)]
pub struct CallbackRegistry {
    slots: Vec<Slot>,

    /// Released ids, most recent last
    free: Vec<u32>,

    /// Reserved plus pending slots
    in_use: usize,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id. It cannot be handed out again until released.
    pub fn allocate(&mut self) -> u32 {
        self.in_use += 1;
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Slot::Reserved;
            return id;
        }

        let id = self.slots.len() as u32;
        self.slots.push(Slot::Reserved);
        id
    }

    /// Attach a pending request to a reserved id
    pub fn register(&mut self, id: u32, request: PendingRequest) -> Result<()> {
        match self.slots.get_mut(id as usize) {
            Some(slot) if matches!(slot, Slot::Reserved) => {
                *slot = Slot::Pending(request);
                Ok(())
            }
            _ => Err(MuxError::Request(format!(
                "callback id {} was not reserved",
                id
            ))),
        }
    }

    /// Reserve an id and register `request` under it
    pub fn insert(&mut self, request: PendingRequest) -> u32 {
        let id = self.allocate();
        self.slots[id as usize] = Slot::Pending(request);
        id
    }

    /// Remove the entry for `id` and free the id for reuse.
    ///
    /// Returns `None` when nothing is registered under `id`; a reserved id
    /// is freed either way.
    pub fn release(&mut self, id: u32) -> Option<PendingRequest> {
        let slot = self.slots.get_mut(id as usize)?;
        match std::mem::replace(slot, Slot::Free) {
            Slot::Free => None,
            Slot::Reserved => {
                self.in_use -= 1;
                self.free.push(id);
                None
            }
            Slot::Pending(request) => {
                self.in_use -= 1;
                self.free.push(id);
                Some(request)
            }
        }
    }

    pub fn is_pending(&self, id: u32) -> bool {
        matches!(self.slots.get(id as usize), Some(Slot::Pending(_)))
    }

    /// Remove every pending entry. All ids become free.
    pub fn drain_all(&mut self) -> Vec<PendingRequest> {
        let drained = std::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Pending(request) => Some(request),
                _ => None,
            })
            .collect();
        self.free.clear();
        self.in_use = 0;
        drained
    }

    /// Reserved plus pending entries, abandoned ones included
    pub fn pending_count(&self) -> usize {
        self.in_use
    }
}
