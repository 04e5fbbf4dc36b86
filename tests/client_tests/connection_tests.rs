//! Connection Tests
//!
//! Drives a client `Connection` against a scripted engine on the other end
//! of a socket pair.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use muxkv::client::{ConnectionStatus, HandleTable, PubSubConfig, Transport};
use muxkv::error::{ErrorKind, RequestErrorType};
use muxkv::protocol::{
    encode_frame, read_frame, write_frame, Command, CommandRequest, ConnectionRequest,
    PubSubSubscriptions, RequestKind, Response, DEFAULT_MAX_FRAME_SIZE,
};
use muxkv::{ClientConfig, Connection, Decoder, Value};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Scripted Engine
// =============================================================================

struct FakeEngine {
    stream: UnixStream,
}

impl FakeEngine {
    fn next_request(&mut self) -> CommandRequest {
        read_frame(&mut self.stream, DEFAULT_MAX_FRAME_SIZE).unwrap()
    }

    fn reply(&mut self, response: &Response) {
        write_frame(&mut self.stream, response).unwrap();
    }
}

fn test_config() -> muxkv::config::ClientConfigBuilder {
    ClientConfig::builder().request_timeout_ms(5_000)
}

/// Connect with `config`, answering the handshake with `ack`
fn connect_with_ack(
    config: ClientConfig,
    ack: Response,
) -> (muxkv::Result<Connection>, FakeEngine, ConnectionRequest) {
    let (client, server) = UnixStream::pair().unwrap();
    let engine = thread::spawn(move || {
        let mut engine = FakeEngine { stream: server };
        let request: ConnectionRequest =
            read_frame(&mut engine.stream, DEFAULT_MAX_FRAME_SIZE).unwrap();
        engine.reply(&ack);
        (engine, request)
    });

    let connection = Connection::with_transport(client, config);
    let (engine, request) = engine.join().unwrap();
    (connection, engine, request)
}

fn connect(config: ClientConfig) -> (Connection, FakeEngine) {
    let (connection, engine, _) = connect_with_ack(config, Response::ok(0));
    (connection.unwrap(), engine)
}

fn get(key: &str) -> RequestKind {
    RequestKind::Single(Command::new("GET").arg(key))
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

// =============================================================================
// Handshake Tests
// =============================================================================

#[test]
fn test_handshake_carries_configuration() {
    let config = test_config()
        .address("10.0.0.5", 7000)
        .database_id(3)
        .client_name("worker-1")
        .build();

    let (connection, _engine, request) = connect_with_ack(config, Response::ok(0));
    let connection = connection.unwrap();

    assert_eq!(connection.status(), ConnectionStatus::Open);
    assert_eq!(request.database_id, 3);
    assert_eq!(request.client_name.as_deref(), Some("worker-1"));
    assert_eq!(request.addresses.len(), 1);
    assert_eq!(request.addresses[0].port, 7000);
    assert_eq!(request.request_timeout_ms, 5_000);
    // The handshake id is free again
    assert_eq!(connection.pending_requests(), 0);
}

#[test]
fn test_handshake_rejection_fails_connect() {
    let (connection, _engine, _) = connect_with_ack(
        test_config().build(),
        Response::error(0, RequestErrorType::Unspecified, "bad database"),
    );
    let err = connection.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Request);
}

#[test]
fn test_handshake_closing_error_fails_connect() {
    let (connection, _engine, _) =
        connect_with_ack(test_config().build(), Response::closing("engine unavailable"));
    let err = connection.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Closing);
}

// =============================================================================
// Correlation Tests
// =============================================================================

#[test]
fn test_split_response_resolves_and_id_is_reused() {
    let (connection, mut engine) = connect(test_config().build());

    let reply = connection.submit(get("k"), None, Decoder::Bytes).unwrap();
    assert_eq!(reply.id(), 0);

    let request = engine.next_request();
    assert_eq!(request.callback_idx, 0);
    assert_eq!(request.kind, get("k"));

    // Deliver the response over two reads
    let frame = encode_frame(&Response::value(0, Value::from("v"))).unwrap();
    engine.stream.write_all(&frame[..6]).unwrap();
    engine.stream.flush().unwrap();
    thread::sleep(Duration::from_millis(20));
    engine.stream.write_all(&frame[6..]).unwrap();

    assert_eq!(reply.wait_timeout(WAIT).unwrap(), Value::from("v"));
    wait_until(|| connection.pending_requests() == 0);

    let again = connection.submit(get("k"), None, Decoder::Bytes).unwrap();
    assert_eq!(again.id(), 0);
}

#[test]
fn test_out_of_order_responses() {
    let (connection, mut engine) = connect(test_config().build());

    let replies: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|key| connection.submit(get(key), None, Decoder::Bytes).unwrap())
        .collect();
    let requests: Vec<_> = (0..3).map(|_| engine.next_request()).collect();

    for request in requests.iter().rev() {
        let RequestKind::Single(command) = &request.kind else {
            panic!("expected a single command");
        };
        engine.reply(&Response::value(
            request.callback_idx,
            Value::Bytes(command.args[0].clone()),
        ));
    }

    let values: Vec<Value> = replies
        .into_iter()
        .map(|reply| reply.wait_timeout(WAIT).unwrap())
        .collect();
    assert_eq!(values, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
}

#[test]
fn test_request_errors_are_classified() {
    let (connection, mut engine) = connect(test_config().build());

    let cases = [
        (RequestErrorType::Unspecified, ErrorKind::Request),
        (RequestErrorType::ExecAbort, ErrorKind::ExecAbort),
        (RequestErrorType::Timeout, ErrorKind::Timeout),
        (RequestErrorType::Disconnect, ErrorKind::Connection),
    ];

    for (error_type, expected) in cases {
        let reply = connection.submit(get("k"), None, Decoder::Bytes).unwrap();
        let id = engine.next_request().callback_idx;
        engine.reply(&Response::error(id, error_type, "failed"));

        let err = reply.wait_timeout(WAIT).unwrap_err();
        assert_eq!(err.kind(), expected);
    }

    // Per-request errors leave the connection usable
    assert_eq!(connection.status(), ConnectionStatus::Open);
}

#[test]
fn test_ok_and_nil_responses() {
    let (connection, mut engine) = connect(test_config().build());

    let set = connection
        .submit(
            RequestKind::Single(Command::new("SET").arg("k").arg("v")),
            None,
            Decoder::Bytes,
        )
        .unwrap();
    let missing = connection.submit(get("missing"), None, Decoder::Bytes).unwrap();

    let first = engine.next_request().callback_idx;
    let second = engine.next_request().callback_idx;
    engine.reply(&Response::ok(first));
    engine.reply(&Response::nil(second));

    assert_eq!(set.wait_timeout(WAIT).unwrap(), Value::Okay);
    assert_eq!(missing.wait_timeout(WAIT).unwrap(), Value::Nil);
}

#[test]
fn test_submit_with_callback() {
    let (connection, mut engine) = connect(test_config().build());
    let (tx, rx) = unbounded();

    let id = connection
        .submit_with_callback(get("k"), None, Decoder::Bytes, move |outcome| {
            tx.send(outcome).unwrap();
        })
        .unwrap();

    assert_eq!(engine.next_request().callback_idx, id);
    engine.reply(&Response::value(id, Value::Int(42)));

    assert_eq!(rx.recv_timeout(WAIT).unwrap().unwrap(), Value::Int(42));
    // Exactly one outcome
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

// =============================================================================
// Decoding Tests
// =============================================================================

#[test]
fn test_string_decoder() {
    let (connection, mut engine) = connect(test_config().build());

    let text = connection.submit(get("a"), None, Decoder::String).unwrap();
    let invalid = connection.submit(get("b"), None, Decoder::String).unwrap();
    let raw = connection.submit(get("c"), None, Decoder::Bytes).unwrap();

    let ids: Vec<u32> = (0..3).map(|_| engine.next_request().callback_idx).collect();
    engine.reply(&Response::value(ids[0], Value::Bytes("héllo".as_bytes().to_vec())));
    engine.reply(&Response::value(ids[1], Value::Bytes(vec![0xff, 0xfe])));
    engine.reply(&Response::value(ids[2], Value::Bytes(vec![0xff, 0xfe])));

    assert_eq!(text.wait_timeout(WAIT).unwrap(), Value::Text("héllo".to_string()));
    assert_eq!(invalid.wait_timeout(WAIT).unwrap_err().kind(), ErrorKind::Decode);
    assert_eq!(raw.wait_timeout(WAIT).unwrap(), Value::Bytes(vec![0xff, 0xfe]));
    assert_eq!(connection.status(), ConnectionStatus::Open);
}

#[test]
fn test_value_handles_are_resolved() {
    let table = Arc::new(HandleTable::new());
    let handle = table.store(Value::Array(vec![Value::from("x"), Value::Int(1)]));

    let (connection, mut engine) = connect(test_config().resolver(table.clone()).build());
    let reply = connection.submit(get("big"), None, Decoder::Bytes).unwrap();
    let id = engine.next_request().callback_idx;
    engine.reply(&Response::handle(id, handle));

    assert_eq!(
        reply.wait_timeout(WAIT).unwrap(),
        Value::Array(vec![Value::from("x"), Value::Int(1)])
    );
    assert!(table.is_empty());
}

#[test]
fn test_handle_without_resolver_fails_request() {
    let (connection, mut engine) = connect(test_config().build());
    let reply = connection.submit(get("big"), None, Decoder::Bytes).unwrap();
    let id = engine.next_request().callback_idx;
    engine.reply(&Response::handle(id, muxkv::protocol::ValueHandle::from_u64(5)));

    assert_eq!(reply.wait_timeout(WAIT).unwrap_err().kind(), ErrorKind::Decode);
    assert_eq!(connection.status(), ConnectionStatus::Open);
}

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_timeout_abandons_request() {
    let (connection, mut engine) = connect(test_config().build());

    let slow = connection.submit(get("slow"), None, Decoder::Bytes).unwrap();
    let slow_id = slow.id();
    let err = slow.wait_timeout(Duration::from_millis(30)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // The abandoned id stays reserved until the engine answers
    assert_eq!(connection.pending_requests(), 1);
    let next = connection.submit(get("fast"), None, Decoder::Bytes).unwrap();
    assert_ne!(next.id(), slow_id);

    assert_eq!(engine.next_request().callback_idx, slow_id);
    let next_id = engine.next_request().callback_idx;
    engine.reply(&Response::value(slow_id, Value::from("late")));
    engine.reply(&Response::value(next_id, Value::from("fast")));

    assert_eq!(next.wait_timeout(WAIT).unwrap(), Value::from("fast"));
    wait_until(|| connection.pending_requests() == 0);
}

#[test]
fn test_configured_request_timeout() {
    let (connection, _engine) = connect(ClientConfig::builder().request_timeout_ms(20).build());
    let err = connection.custom_command(Command::new("PING")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn test_inflight_limit() {
    let (connection, _engine) = connect(test_config().max_inflight_requests(2).build());

    let _first = connection.submit(get("a"), None, Decoder::Bytes).unwrap();
    let _second = connection.submit(get("b"), None, Decoder::Bytes).unwrap();
    let err = connection.submit(get("c"), None, Decoder::Bytes).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Request);
    assert!(err.to_string().contains("maximum inflight requests"));
}

// =============================================================================
// Write Ordering Tests
// =============================================================================

#[test]
fn test_concurrent_submits_produce_whole_frames() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;

    let (connection, mut engine) = connect(test_config().build());
    let connection = Arc::new(connection);

    let engine_thread = thread::spawn(move || {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..THREADS * PER_THREAD {
            let request = engine.next_request();
            assert!(seen.insert(request.callback_idx), "duplicate id");
            let RequestKind::Single(command) = &request.kind else {
                panic!("expected a single command");
            };
            engine.reply(&Response::value(
                request.callback_idx,
                Value::Bytes(command.args[0].clone()),
            ));
        }
        engine
    });

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let connection = Arc::clone(&connection);
            thread::spawn(move || {
                let replies: Vec<_> = (0..PER_THREAD)
                    .map(|i| {
                        let key = format!("{}-{}", t, i);
                        (key.clone(), connection.submit(get(&key), None, Decoder::Bytes).unwrap())
                    })
                    .collect();
                for (key, reply) in replies {
                    assert_eq!(reply.wait_timeout(WAIT).unwrap(), Value::from(key.as_str()));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    let _engine = engine_thread.join().unwrap();
    assert_eq!(connection.pending_requests(), 0);
}

// =============================================================================
// Fatal Error Tests
// =============================================================================

#[test]
fn test_engine_closing_error_fails_everyone() {
    const PENDING: usize = 4;
    const WAITERS: usize = 3;

    let config = test_config()
        .pubsub(PubSubConfig::pull(PubSubSubscriptions {
            channels: vec![b"news".to_vec()],
            ..Default::default()
        }))
        .build();
    let (connection, mut engine) = connect(config);
    let connection = Arc::new(connection);

    let replies: Vec<_> = (0..PENDING)
        .map(|i| connection.submit(get(&i.to_string()), None, Decoder::Bytes).unwrap())
        .collect();

    let pullers: Vec<_> = (0..WAITERS)
        .map(|_| {
            let connection = Arc::clone(&connection);
            thread::spawn(move || connection.get_pubsub_message())
        })
        .collect();
    wait_until(|| connection.waiting_pullers() == WAITERS);

    engine.reply(&Response::closing("engine shutting down"));

    let mut failures = 0;
    for reply in replies {
        let err = reply.wait_timeout(WAIT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closing);
        assert!(err.to_string().contains("engine shutting down"));
        failures += 1;
    }
    for puller in pullers {
        let err = puller.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closing);
        failures += 1;
    }
    assert_eq!(failures, PENDING + WAITERS);
    assert_ne!(connection.status(), ConnectionStatus::Open);

    // New work is refused
    let err = connection.submit(get("x"), None, Decoder::Bytes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closing);
}

#[test]
fn test_undecodable_frame_is_fatal() {
    let (connection, mut engine) = connect(test_config().max_frame_size(1024).build());

    let first = connection.submit(get("a"), None, Decoder::Bytes).unwrap();
    let second = connection.submit(get("b"), None, Decoder::Bytes).unwrap();

    // Header announcing a body larger than the client accepts
    engine.stream.write_all(&4096u32.to_be_bytes()).unwrap();

    assert_eq!(first.wait_timeout(WAIT).unwrap_err().kind(), ErrorKind::Decode);
    assert_eq!(second.wait_timeout(WAIT).unwrap_err().kind(), ErrorKind::Decode);
    wait_until(|| connection.status() == ConnectionStatus::Closed);
}

#[test]
fn test_engine_hangup_fails_pending() {
    let (connection, engine) = connect(test_config().build());
    let reply = connection.submit(get("a"), None, Decoder::Bytes).unwrap();

    drop(engine);

    assert_eq!(reply.wait_timeout(WAIT).unwrap_err().kind(), ErrorKind::Connection);
    wait_until(|| connection.status() == ConnectionStatus::Closed);
}

#[test]
fn test_close_fails_pending_and_waiters_and_is_idempotent() {
    const PENDING: usize = 2;
    const WAITERS: usize = 3;

    let config = test_config()
        .pubsub(PubSubConfig::pull(PubSubSubscriptions {
            channels: vec![b"news".to_vec()],
            ..Default::default()
        }))
        .build();
    let (connection, _engine) = connect(config);
    let connection = Arc::new(connection);

    let replies: Vec<_> = (0..PENDING)
        .map(|i| connection.submit(get(&i.to_string()), None, Decoder::Bytes).unwrap())
        .collect();
    let pullers: Vec<_> = (0..WAITERS)
        .map(|_| {
            let connection = Arc::clone(&connection);
            thread::spawn(move || connection.get_pubsub_message())
        })
        .collect();
    wait_until(|| connection.waiting_pullers() == WAITERS);

    assert_eq!(connection.close(), PENDING + WAITERS);
    assert_eq!(connection.close(), 0);

    for reply in replies {
        assert_eq!(reply.wait_timeout(WAIT).unwrap_err().kind(), ErrorKind::Closing);
    }
    for puller in pullers {
        let err = puller.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closing);
    }
    assert_eq!(connection.waiting_pullers(), 0);
    assert_eq!(connection.status(), ConnectionStatus::Closed);
}

// =============================================================================
// Close Race Tests
// =============================================================================

/// Blocks the first write after it is armed until released
struct WriteGate {
    armed: AtomicBool,
    entered: Sender<()>,
    release: Receiver<()>,
}

struct GatedStream {
    stream: UnixStream,
    gate: Arc<WriteGate>,
}

impl Read for GatedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for GatedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.gate.armed.swap(false, Ordering::AcqRel) {
            let _ = self.gate.entered.send(());
            let _ = self.gate.release.recv();
        }
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for GatedStream {
    fn try_clone_transport(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            gate: Arc::clone(&self.gate),
        })
    }

    fn shutdown_transport(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }

    fn set_read_timeout_transport(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn describe(&self) -> String {
        "gated-socket".to_string()
    }
}

#[test]
fn test_close_during_submit_write_reports_one_outcome() {
    let (client, server) = UnixStream::pair().unwrap();
    let (entered_tx, entered_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    let gate = Arc::new(WriteGate {
        armed: AtomicBool::new(false),
        entered: entered_tx,
        release: release_rx,
    });

    let engine = thread::spawn(move || {
        let mut engine = FakeEngine { stream: server };
        let _: ConnectionRequest = read_frame(&mut engine.stream, DEFAULT_MAX_FRAME_SIZE).unwrap();
        engine.reply(&Response::ok(0));
        engine
    });
    let transport = GatedStream {
        stream: client,
        gate: Arc::clone(&gate),
    };
    let connection = Arc::new(Connection::with_transport(transport, test_config().build()).unwrap());
    let _engine = engine.join().unwrap();

    // Hold the request's write while the connection closes underneath it
    gate.armed.store(true, Ordering::Release);
    let (outcome_tx, outcome_rx) = unbounded();
    let submitter = {
        let connection = Arc::clone(&connection);
        thread::spawn(move || {
            connection.submit_with_callback(get("k"), None, Decoder::Bytes, move |outcome| {
                outcome_tx.send(outcome).unwrap();
            })
        })
    };
    entered_rx.recv_timeout(WAIT).unwrap();

    assert_eq!(connection.close(), 1);
    release_tx.send(()).unwrap();

    // The completion already carries the outcome, so the submit itself succeeds
    assert_eq!(submitter.join().unwrap().unwrap(), 0);
    let outcome = outcome_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome.unwrap_err().kind(), ErrorKind::Closing);
    assert!(outcome_rx.recv_timeout(Duration::from_millis(50)).is_err());
}

// =============================================================================
// Configuration Edge Tests
// =============================================================================

#[test]
fn test_zero_read_buffer_size_still_reads() {
    let config = ClientConfig {
        read_buffer_size: 0,
        ..test_config().build()
    };
    let (connection, mut engine) = connect(config);

    let reply = connection.submit(get("k"), None, Decoder::Bytes).unwrap();
    let request = engine.next_request();
    engine.reply(&Response::value(request.callback_idx, Value::from("v")));

    assert_eq!(reply.wait_timeout(WAIT).unwrap(), Value::from("v"));
    assert_eq!(connection.status(), ConnectionStatus::Open);
}

#[test]
fn test_unknown_callback_id_is_skipped() {
    let (connection, mut engine) = connect(test_config().build());
    let reply = connection.submit(get("a"), None, Decoder::Bytes).unwrap();
    let id = engine.next_request().callback_idx;

    engine.reply(&Response::value(900, Value::from("stray")));
    engine.reply(&Response::value(id, Value::from("mine")));

    assert_eq!(reply.wait_timeout(WAIT).unwrap(), Value::from("mine"));
    assert_eq!(connection.status(), ConnectionStatus::Open);
}
