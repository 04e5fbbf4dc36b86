//! Transport abstraction
//!
//! A connection needs three handles onto one duplex byte stream: one for the
//! reader thread, one for the outbound writer, and one kept around to shut
//! the stream down (which unblocks the reader).

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// An ordered, reliable duplex byte stream
pub trait Transport: Read + Write + Send + Sync + Sized + 'static {
    /// Another handle onto the same stream
    fn try_clone_transport(&self) -> io::Result<Self>;

    /// Close both directions
    fn shutdown_transport(&self) -> io::Result<()>;

    /// Bound blocking reads (`None` = block forever)
    fn set_read_timeout_transport(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Human-readable peer description for logs
    fn describe(&self) -> String;
}

impl Transport for UnixStream {
    fn try_clone_transport(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_transport(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_read_timeout_transport(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn describe(&self) -> String {
        self.peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix socket".to_string())
    }
}

impl Transport for TcpStream {
    fn try_clone_transport(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_transport(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_read_timeout_transport(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn describe(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}
