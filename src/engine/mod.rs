//! Reference Engine
//!
//! An in-process engine that speaks the muxkv wire protocol over a Unix
//! socket. It backs the binaries and the end-to-end tests.
//!
//! ## Layout
//! ```text
//! Server ── accept ──▶ Session (thread) ── CommandRequest ──▶ Engine::execute
//!                          ▲                                     │
//!                          └────── Response / push frames ◀──────┘
//!                                  (OutboundWriter per session)
//! ```

mod broker;
mod keyspace;
mod server;
mod session;

pub use broker::{glob_match, Broker, SubscriptionKind};
pub use keyspace::Keyspace;
pub use server::{RunningServer, Server, ShutdownHandle};
pub use session::{Session, SessionHandle, Subscriptions};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::{RequestErrorType, Result};
use crate::protocol::{
    Command, CommandRequest, ConnectionRequest, PubSubSubscriptions, PushKind, RequestKind,
    Response, Value,
};

/// Outcome of one command: a value or an error message for the caller
type Reply = std::result::Result<Value, String>;

const NOSCRIPT: &str = "NOSCRIPT No matching script. Please use EVAL.";
const EXECABORT: &str = "EXECABORT Transaction discarded because of previous errors.";

/// Commands the engine understands (upper case)
const COMMANDS: &[&str] = &[
    "PING", "ECHO", "GET", "SET", "DEL", "EXISTS", "INCR", "PUBLISH", "SPUBLISH", "SUBSCRIBE",
    "PSUBSCRIBE", "SSUBSCRIBE", "UNSUBSCRIBE", "PUNSUBSCRIBE", "SUNSUBSCRIBE", "CLIENT",
];

/// The reference engine shared by every session
///
/// Keys live in a [`Keyspace`]; subscriptions and fan-out go through the
/// [`Broker`]. Both are internally locked, so `execute` takes `&self`.
pub struct Engine {
    config: EngineConfig,
    keyspace: Keyspace,
    broker: Broker,

    /// Password set through `UpdatePassword`
    password: Mutex<Option<String>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            keyspace: Keyspace::new(),
            broker: Broker::new(),
            password: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn password(&self) -> Option<String> {
        self.password.lock().clone()
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Apply a connection request and acknowledge it with callback id 0
    ///
    /// The acknowledgement is sent before any subscription pushes so the
    /// client reads it as the first frame.
    pub fn accept(&self, session: &Arc<SessionHandle>, request: ConnectionRequest) -> Result<()> {
        tracing::debug!(
            "Session {} handshake: db={} name={:?} addresses={}",
            session.id(),
            request.database_id,
            request.client_name,
            request.addresses.len()
        );
        session.set_name(request.client_name);

        let subscriptions = request.subscriptions.unwrap_or_default();
        let acks = self.record_subscriptions(session, &subscriptions);

        session.send(&Response::ok(0))?;

        if !self.broker.register(Arc::clone(session)) {
            session.close("engine is shutting down");
            return Ok(());
        }

        for (kind, channel, count) in acks {
            session.push(
                kind.subscribe_push(),
                vec![Value::from(channel), Value::Int(count as i64)],
            )?;
        }
        Ok(())
    }

    fn record_subscriptions(
        &self,
        session: &SessionHandle,
        subscriptions: &PubSubSubscriptions,
    ) -> Vec<(SubscriptionKind, Vec<u8>, usize)> {
        let tables = [
            (SubscriptionKind::Exact, &subscriptions.channels),
            (SubscriptionKind::Pattern, &subscriptions.patterns),
            (SubscriptionKind::Sharded, &subscriptions.sharded),
        ];

        let mut acks = Vec::new();
        for (kind, channels) in tables {
            if channels.is_empty() {
                continue;
            }
            for (channel, count) in session.subscribe(kind, channels) {
                acks.push((kind, channel, count));
            }
        }
        acks
    }

    // =========================================================================
    // Request Execution
    // =========================================================================

    /// Execute one request and build its response
    pub fn execute(&self, session: &SessionHandle, request: CommandRequest) -> Response {
        let id = request.callback_idx;
        if let Some(route) = &request.route {
            tracing::trace!("Request {} routed {:?}; single node engine ignores it", id, route);
        }

        match request.kind {
            RequestKind::Single(command) => self.respond(id, self.run(session, &command)),
            RequestKind::Batch { commands, atomic } => self.run_batch(session, id, commands, atomic),
            RequestKind::Script { hash, .. } => {
                tracing::debug!("Script {} is not loaded", hash);
                Response::error(id, RequestErrorType::Unspecified, NOSCRIPT)
            }
            RequestKind::UpdatePassword {
                password,
                immediate_auth,
            } => {
                tracing::debug!(
                    "Session {} updated password (immediate_auth={})",
                    session.id(),
                    immediate_auth
                );
                *self.password.lock() = password;
                Response::ok(id)
            }
        }
    }

    fn run_batch(
        &self,
        session: &SessionHandle,
        id: u32,
        commands: Vec<Command>,
        atomic: bool,
    ) -> Response {
        if atomic {
            if let Some(unknown) = commands.iter().find(|c| !is_known(&c.name)) {
                tracing::debug!("Transaction aborted on unknown command {}", unknown.name);
                return Response::error(id, RequestErrorType::ExecAbort, EXECABORT);
            }
        }

        let mut results = Vec::with_capacity(commands.len());
        for command in &commands {
            match self.run(session, command) {
                Ok(value) => results.push(value),
                Err(message) => {
                    return Response::error(id, RequestErrorType::Unspecified, message)
                }
            }
        }
        self.respond(id, Ok(Value::Array(results)))
    }

    /// Turn a reply into a response frame, moving large values out of band
    fn respond(&self, id: u32, reply: Reply) -> Response {
        let value = match reply {
            Ok(value) => value,
            Err(message) => return Response::error(id, RequestErrorType::Unspecified, message),
        };

        match value {
            Value::Okay => Response::ok(id),
            Value::Nil => Response::nil(id),
            value => match &self.config.handle_table {
                Some(table) if payload_size(&value) > self.config.inline_value_limit => {
                    Response::handle(id, table.store(value))
                }
                _ => Response::value(id, value),
            },
        }
    }

    fn run(&self, session: &SessionHandle, command: &Command) -> Reply {
        let name = command.name.to_ascii_uppercase();
        let args = &command.args;

        match name.as_str() {
            "PING" => match args.as_slice() {
                [] => Ok(Value::Text("PONG".to_string())),
                [message] => Ok(Value::Bytes(message.clone())),
                _ => Err(arity("ping")),
            },
            "ECHO" => match args.as_slice() {
                [message] => Ok(Value::Bytes(message.clone())),
                _ => Err(arity("echo")),
            },
            "GET" => match args.as_slice() {
                [key] => Ok(self.keyspace.get(key).map(Value::Bytes).unwrap_or(Value::Nil)),
                _ => Err(arity("get")),
            },
            "SET" => match args.as_slice() {
                [key, value] => {
                    self.keyspace.set(key.clone(), value.clone());
                    Ok(Value::Okay)
                }
                _ => Err(arity("set")),
            },
            "DEL" if !args.is_empty() => {
                Ok(Value::Int(self.keyspace.delete(args.iter().map(Vec::as_slice)) as i64))
            }
            "EXISTS" if !args.is_empty() => {
                Ok(Value::Int(self.keyspace.exists(args.iter().map(Vec::as_slice)) as i64))
            }
            "INCR" => match args.as_slice() {
                [key] => self
                    .keyspace
                    .incr(key, 1)
                    .map(Value::Int)
                    .ok_or_else(|| "ERR value is not an integer or out of range".to_string()),
                _ => Err(arity("incr")),
            },
            "PUBLISH" | "SPUBLISH" => match args.as_slice() {
                [channel, message] => {
                    let sharded = name == "SPUBLISH";
                    Ok(Value::Int(self.broker.publish(channel, message, sharded) as i64))
                }
                _ => Err(arity(&name.to_ascii_lowercase())),
            },
            "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" if !args.is_empty() => {
                let kind = subscription_kind(&name);
                let acks = session.subscribe(kind, args);
                self.ack(session, kind.subscribe_push(), acks)
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "SUNSUBSCRIBE" => {
                let kind = subscription_kind(&name);
                let acks = session.unsubscribe(kind, args);
                self.ack(session, kind.unsubscribe_push(), acks)
            }
            "CLIENT" => self.run_client(session, args),
            "DEL" | "EXISTS" | "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" => {
                Err(arity(&name.to_ascii_lowercase()))
            }
            _ => Err(format!("ERR unknown command '{}'", command.name)),
        }
    }

    fn run_client(&self, session: &SessionHandle, args: &[Vec<u8>]) -> Reply {
        let Some((sub, rest)) = args.split_first() else {
            return Err(arity("client"));
        };
        match (sub.to_ascii_uppercase().as_slice(), rest) {
            (b"GETNAME", []) => Ok(session
                .name()
                .map(|name| Value::Bytes(name.into_bytes()))
                .unwrap_or(Value::Nil)),
            (b"SETNAME", [name]) => {
                let name = String::from_utf8(name.clone())
                    .map_err(|_| "ERR client name must be valid UTF-8".to_string())?;
                session.set_name(Some(name));
                Ok(Value::Okay)
            }
            _ => Err(format!(
                "ERR unknown subcommand '{}'",
                String::from_utf8_lossy(sub)
            )),
        }
    }

    /// Send one subscription push per channel; the reply itself is nil
    fn ack(&self, session: &SessionHandle, kind: PushKind, acks: Vec<(Vec<u8>, usize)>) -> Reply {
        for (channel, count) in acks {
            session
                .push(kind.clone(), vec![Value::from(channel), Value::Int(count as i64)])
                .map_err(|e| format!("ERR {}", e))?;
        }
        Ok(Value::Nil)
    }
}

fn is_known(name: &str) -> bool {
    COMMANDS.iter().any(|known| known.eq_ignore_ascii_case(name))
}

fn arity(command: &str) -> String {
    format!("ERR wrong number of arguments for '{}' command", command)
}

fn subscription_kind(name: &str) -> SubscriptionKind {
    match name {
        "PSUBSCRIBE" | "PUNSUBSCRIBE" => SubscriptionKind::Pattern,
        "SSUBSCRIBE" | "SUNSUBSCRIBE" => SubscriptionKind::Sharded,
        _ => SubscriptionKind::Exact,
    }
}

/// Bytes of string payload carried by a value
fn payload_size(value: &Value) -> usize {
    match value {
        Value::Bytes(bytes) => bytes.len(),
        Value::Text(text) => text.len(),
        Value::Array(items) => items.iter().map(payload_size).sum(),
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| payload_size(k) + payload_size(v))
            .sum(),
        Value::Push { data, .. } => data.iter().map(payload_size).sum(),
        _ => 0,
    }
}
