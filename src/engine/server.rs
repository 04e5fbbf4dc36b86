//! Unix Socket Server
//!
//! Accepts sessions and runs each on its own thread.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::session::Session;
use super::Engine;
use crate::config::EngineConfig;
use crate::error::{MuxError, Result};

/// Poll interval of the nonblocking accept loop
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Unix socket server for the reference engine
pub struct Server {
    engine: Arc<Engine>,
    listener: UnixListener,
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    next_session: AtomicU64,
}

/// Signals a running [`Server`] to stop from another thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Server {
    /// Bind the socket named in `config`, replacing a stale socket file
    pub fn bind(config: EngineConfig) -> Result<Self> {
        let socket_path = config.socket_path.clone();
        if socket_path.exists() {
            tracing::debug!("Removing stale socket {}", socket_path.display());
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        tracing::info!("Engine listening on {}", socket_path.display());

        Ok(Self {
            engine: Arc::new(Engine::new(config)),
            listener,
            socket_path,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_session: AtomicU64::new(1),
        })
    }

    pub fn engine(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Signal the server to shut down gracefully
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Accept sessions until shut down (blocking)
    ///
    /// On shutdown every live session receives a closing error frame.
    pub fn run(&self) -> Result<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    let session = match stream
                        .set_nonblocking(false)
                        .map_err(MuxError::from)
                        .and_then(|_| Session::new(id, stream, Arc::clone(&self.engine)))
                    {
                        Ok(session) => session,
                        Err(e) => {
                            tracing::warn!("Dropping session {}: {}", id, e);
                            continue;
                        }
                    };
                    tracing::debug!("Accepted session {}", id);
                    thread::Builder::new()
                        .name(format!("muxkv-session-{}", id))
                        .spawn(move || {
                            if let Err(e) = session.run() {
                                tracing::debug!("Session {} error: {}", id, e);
                            }
                        })?;
                }
                Err(ref e) if e.kind() == IoErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(ref e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    self.close_sessions();
                    return Err(e.into());
                }
            }
        }

        self.close_sessions();
        Ok(())
    }

    fn close_sessions(&self) {
        tracing::info!(
            "Engine shutting down, closing {} sessions",
            self.engine.broker().session_count()
        );
        self.engine.broker().close_all("engine is shutting down");
        if let Err(e) = fs::remove_file(&self.socket_path) {
            tracing::debug!("Socket {} not removed: {}", self.socket_path.display(), e);
        }
    }
}

/// A server running on a background thread; stopped on drop
pub struct RunningServer {
    socket_path: PathBuf,
    engine: Arc<Engine>,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<Result<()>>>,
}

impl RunningServer {
    /// Bind and start serving on a background thread
    pub fn spawn(config: EngineConfig) -> Result<Self> {
        let server = Server::bind(config)?;
        let socket_path = server.socket_path().to_path_buf();
        let engine = server.engine();
        let shutdown = server.shutdown_handle();

        let thread = thread::Builder::new()
            .name("muxkv-engine".to_string())
            .spawn(move || server.run())?;

        Ok(Self {
            socket_path,
            engine,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Shut down and wait for the accept loop to exit
    pub fn stop(mut self) -> Result<()> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<()> {
        self.shutdown.shutdown();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| MuxError::Connection("engine thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop_inner() {
            tracing::warn!("Engine stopped with error: {}", e);
        }
    }
}
