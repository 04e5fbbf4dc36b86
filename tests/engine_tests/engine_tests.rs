//! Engine Tests
//!
//! Client connections against the reference engine on a temporary socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use muxkv::client::{ConnectionStatus, HandleTable, PubSubConfig};
use muxkv::engine::RunningServer;
use muxkv::error::ErrorKind;
use muxkv::protocol::{PubSubSubscriptions, PushKind, Route};
use muxkv::{ClientConfig, Command, Connection, Decoder, EngineConfig, Value};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn start() -> (TempDir, RunningServer) {
    start_with(EngineConfig::builder())
}

fn start_with(builder: muxkv::config::EngineConfigBuilder) -> (TempDir, RunningServer) {
    let dir = tempfile::tempdir().unwrap();
    let server = RunningServer::spawn(builder.socket_path(dir.path().join("engine.sock")).build())
        .unwrap();
    (dir, server)
}

fn client_config() -> muxkv::config::ClientConfigBuilder {
    ClientConfig::builder().request_timeout_ms(5_000)
}

fn connect(path: &PathBuf) -> Connection {
    Connection::connect(path, client_config().build()).unwrap()
}

fn cmd(line: &str) -> Command {
    Command::parse_line(line).unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Publish until at least one subscriber receives the message
fn publish_until_delivered(connection: &Connection, command: &str) {
    wait_until(|| connection.custom_command(cmd(command)).unwrap() != Value::Int(0));
}

// =============================================================================
// Key Commands
// =============================================================================

#[test]
fn test_basic_commands() {
    let (_dir, server) = start();
    let path = server.socket_path().to_path_buf();
    let connection = connect(&path);

    assert_eq!(connection.custom_command(cmd("PING")).unwrap(), Value::Text("PONG".into()));
    assert_eq!(connection.custom_command(cmd("ECHO hi")).unwrap(), Value::from("hi"));
    assert_eq!(connection.custom_command(cmd("SET k v")).unwrap(), Value::Okay);
    assert_eq!(connection.custom_command(cmd("GET k")).unwrap(), Value::from("v"));
    assert_eq!(connection.custom_command(cmd("EXISTS k nope")).unwrap(), Value::Int(1));
    assert_eq!(connection.custom_command(cmd("INCR n")).unwrap(), Value::Int(1));
    assert_eq!(connection.custom_command(cmd("INCR n")).unwrap(), Value::Int(2));
    assert_eq!(connection.custom_command(cmd("DEL k n")).unwrap(), Value::Int(2));
    assert_eq!(connection.custom_command(cmd("GET k")).unwrap(), Value::Nil);
    assert_eq!(server.engine().keyspace().len(), 0);
}

#[test]
fn test_unknown_command_is_request_error() {
    let (_dir, server) = start();
    let connection = connect(&server.socket_path().to_path_buf());

    let err = connection.custom_command(cmd("FLY away")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);
    assert!(err.to_string().contains("unknown command"));

    // Still usable
    assert_eq!(connection.custom_command(cmd("SET a 1")).unwrap(), Value::Okay);
}

#[test]
fn test_routed_command_runs_on_single_node() {
    let (_dir, server) = start();
    let connection = connect(&server.socket_path().to_path_buf());

    connection.custom_command(cmd("SET k routed")).unwrap();
    let value = connection
        .custom_command_routed(
            cmd("GET k"),
            Route::SlotKey {
                key: b"k".to_vec(),
                replica: true,
            },
        )
        .unwrap();
    assert_eq!(value, Value::from("routed"));
}

#[test]
fn test_client_name_from_handshake() {
    let (_dir, server) = start();
    let connection = Connection::connect(
        server.socket_path(),
        client_config().client_name("reporter").decoder(Decoder::String).build(),
    )
    .unwrap();

    assert_eq!(
        connection.custom_command(cmd("CLIENT GETNAME")).unwrap(),
        Value::Text("reporter".into())
    );
}

// =============================================================================
// Batches, Scripts, Passwords
// =============================================================================

#[test]
fn test_batches() {
    let (_dir, server) = start();
    let connection = connect(&server.socket_path().to_path_buf());

    let value = connection
        .exec_batch(vec![cmd("SET a 1"), cmd("INCR a"), cmd("GET a")], true)
        .unwrap();
    assert_eq!(
        value,
        Value::Array(vec![Value::Okay, Value::Int(2), Value::from("2")])
    );

    let err = connection
        .exec_batch(vec![cmd("SET b 1"), cmd("BOGUS")], true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecAbort);
    assert_eq!(connection.custom_command(cmd("GET b")).unwrap(), Value::Nil);
}

#[test]
fn test_script_and_password() {
    let (_dir, server) = start();
    let connection = connect(&server.socket_path().to_path_buf());

    let err = connection
        .invoke_script("deadbeef", vec![b"k".to_vec()], vec![])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);
    assert!(err.to_string().contains("NOSCRIPT"));

    assert_eq!(
        connection
            .update_connection_password(Some("s3cret".to_string()), true)
            .unwrap(),
        Value::Okay
    );
    assert_eq!(server.engine().password().as_deref(), Some("s3cret"));
}

// =============================================================================
// Out-of-band Values
// =============================================================================

#[test]
fn test_large_values_travel_as_handles() {
    let table = Arc::new(HandleTable::new());
    let (_dir, server) = start_with(
        EngineConfig::builder()
            .inline_value_limit(32)
            .handle_table(Arc::clone(&table)),
    );

    let connection = Connection::connect(
        server.socket_path(),
        client_config().resolver(table.clone()).build(),
    )
    .unwrap();

    let big = "x".repeat(1024);
    connection
        .custom_command(Command::new("SET").arg("big").arg(&big))
        .unwrap();
    assert_eq!(
        connection.custom_command(cmd("GET big")).unwrap(),
        Value::from(big.as_str())
    );
    assert!(table.is_empty());
}

// =============================================================================
// Pubsub
// =============================================================================

#[test]
fn test_publish_reaches_subscribers() {
    let (_dir, server) = start();
    let path = server.socket_path().to_path_buf();

    let subscriber = Connection::connect(
        &path,
        client_config()
            .pubsub(PubSubConfig::pull(PubSubSubscriptions {
                channels: vec![b"news".to_vec()],
                patterns: vec![b"log.*".to_vec()],
                sharded: vec![b"shard".to_vec()],
            }))
            .build(),
    )
    .unwrap();
    let publisher = connect(&path);

    publish_until_delivered(&publisher, "PUBLISH news hello");
    let message = subscriber.get_pubsub_message().unwrap();
    assert_eq!(message.kind, PushKind::Message);
    assert_eq!(message.channel, b"news");
    assert_eq!(message.message, b"hello");

    assert_eq!(
        publisher.custom_command(cmd("PUBLISH log.db up")).unwrap(),
        Value::Int(1)
    );
    let message = subscriber.get_pubsub_message().unwrap();
    assert_eq!(message.kind, PushKind::PMessage);
    assert_eq!(message.pattern.as_deref(), Some(b"log.*".as_slice()));
    assert_eq!(message.channel, b"log.db");

    assert_eq!(
        publisher.custom_command(cmd("SPUBLISH shard s1")).unwrap(),
        Value::Int(1)
    );
    let message = subscriber.get_pubsub_message().unwrap();
    assert_eq!(message.kind, PushKind::SMessage);
    assert_eq!(message.message, b"s1");

    assert_eq!(
        publisher.custom_command(cmd("PUBLISH elsewhere x")).unwrap(),
        Value::Int(0)
    );
}

#[test]
fn test_subscribe_and_unsubscribe_commands() {
    let (_dir, server) = start();
    let path = server.socket_path().to_path_buf();

    let subscriber = Connection::connect(
        &path,
        client_config()
            .pubsub(PubSubConfig::pull(PubSubSubscriptions::default()))
            .build(),
    )
    .unwrap();
    let publisher = connect(&path);

    assert_eq!(subscriber.custom_command(cmd("SUBSCRIBE alerts")).unwrap(), Value::Nil);
    publish_until_delivered(&publisher, "PUBLISH alerts fire");
    assert_eq!(subscriber.get_pubsub_message().unwrap().message, b"fire");

    subscriber.custom_command(cmd("UNSUBSCRIBE")).unwrap();
    assert_eq!(
        publisher.custom_command(cmd("PUBLISH alerts again")).unwrap(),
        Value::Int(0)
    );
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn test_shutdown_closes_sessions() {
    let (_dir, server) = start();
    let path = server.socket_path().to_path_buf();

    let subscriber = Arc::new(
        Connection::connect(
            &path,
            client_config()
                .pubsub(PubSubConfig::pull(PubSubSubscriptions {
                    channels: vec![b"news".to_vec()],
                    ..Default::default()
                }))
                .build(),
        )
        .unwrap(),
    );
    let waiter = {
        let subscriber = Arc::clone(&subscriber);
        thread::spawn(move || subscriber.get_pubsub_message())
    };
    wait_until(|| subscriber.waiting_pullers() == 1);
    wait_until(|| server.engine().broker().session_count() == 1);

    server.stop().unwrap();

    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closing);
    assert!(err.to_string().contains("shutting down"));
    wait_until(|| subscriber.status() == ConnectionStatus::Closed);
    assert!(!path.exists());
}
