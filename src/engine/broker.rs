//! Pubsub Broker
//!
//! Tracks live sessions and fans published messages out to subscribers as
//! push frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::session::SessionHandle;
use crate::protocol::{PushKind, Value};

/// Which subscription table a channel lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Exact,
    Pattern,
    Sharded,
}

impl SubscriptionKind {
    pub fn subscribe_push(self) -> PushKind {
        match self {
            SubscriptionKind::Exact => PushKind::Subscribe,
            SubscriptionKind::Pattern => PushKind::PSubscribe,
            SubscriptionKind::Sharded => PushKind::SSubscribe,
        }
    }

    pub fn unsubscribe_push(self) -> PushKind {
        match self {
            SubscriptionKind::Exact => PushKind::Unsubscribe,
            SubscriptionKind::Pattern => PushKind::PUnsubscribe,
            SubscriptionKind::Sharded => PushKind::SUnsubscribe,
        }
    }
}

/// Registry of live sessions
#[derive(Default)]
pub struct Broker {
    sessions: RwLock<HashMap<u64, Arc<SessionHandle>>>,
    closed: AtomicBool,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session. Returns false once `close_all` has run.
    pub fn register(&self, session: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        sessions.insert(session.id(), session);
        true
    }

    pub fn unregister(&self, id: u64) {
        self.sessions.write().remove(&id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Deliver `message` to every matching subscriber.
    ///
    /// Returns the number of push frames sent.
    pub fn publish(&self, channel: &[u8], message: &[u8], sharded: bool) -> usize {
        let sessions: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();

        let mut delivered = 0;
        for session in sessions {
            let subscriptions = session.subscriptions();

            if sharded {
                if subscriptions.sharded.contains(channel) {
                    delivered += send_push(
                        &session,
                        PushKind::SMessage,
                        vec![Value::from(channel.to_vec()), Value::from(message.to_vec())],
                    );
                }
                continue;
            }

            if subscriptions.channels.contains(channel) {
                delivered += send_push(
                    &session,
                    PushKind::Message,
                    vec![Value::from(channel.to_vec()), Value::from(message.to_vec())],
                );
            }

            for pattern in subscriptions.patterns.iter() {
                if glob_match(pattern, channel) {
                    delivered += send_push(
                        &session,
                        PushKind::PMessage,
                        vec![
                            Value::from(pattern.clone()),
                            Value::from(channel.to_vec()),
                            Value::from(message.to_vec()),
                        ],
                    );
                }
            }
        }

        delivered
    }

    /// Send a closing error to every session and shut their streams down
    pub fn close_all(&self, message: &str) {
        let sessions: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.sessions.write();
            self.closed.store(true, Ordering::Release);
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close(message);
        }
    }
}

fn send_push(session: &SessionHandle, kind: PushKind, data: Vec<Value>) -> usize {
    match session.push(kind, data) {
        Ok(()) => 1,
        Err(e) => {
            tracing::debug!("Push to session {} failed: {}", session.id(), e);
            0
        }
    }
}

/// Glob matching with `*` (any run) and `?` (any single byte)
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
