//! Read/write adapter over one peer's byte stream.
//!
//! Mirrors `os_aio_pod_channel.endpoint.Endpoint` / `NullEndpoint`: a single
//! type with a close-once guarantee, plus a distinguished null variant used
//! as a placeholder when a backend isn't known yet (spec §3, §4.1).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::EndpointError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Connected {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
    peer_addr: Option<SocketAddr>,
}

/// A read/write endpoint over one peer, or the distinguished null endpoint.
///
/// The two halves (`reader`, `writer`) are each wrapped in their own
/// uncontended `Mutex`: by construction (spec §5, "Shared resources") the
/// reader is only ever touched by one direction's task and the writer only
/// by the other, so the lock is never actually contended — it exists purely
/// so an `Arc<Endpoint>` can be handed to two tasks at once.
pub enum Endpoint {
    Real(Connected),
    Null,
}

impl Endpoint {
    /// Wrap a split async stream pair as a connected endpoint.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Endpoint::Real(Connected {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
            peer_addr,
        })
    }

    /// Wrap a `TcpStream` as a connected endpoint, splitting it into owned
    /// halves so the two directions of a channel can drive it independently.
    pub fn from_tcp_stream(stream: tokio::net::TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, peer_addr)
    }

    /// The distinguished null endpoint: always closed, reads as EOF, writes
    /// and closes are no-ops. Used as a placeholder backend until a real one
    /// is supplied via `Channel::set_backend`.
    pub const fn null() -> Self {
        Endpoint::Null
    }

    /// Replacement for the Python source's `__bool__` truthiness check
    /// (`if backend: ...`) — Rust has no implicit bool conversion for
    /// structs, so callers spell it out as `!endpoint.is_null()`.
    pub fn is_null(&self) -> bool {
        matches!(self, Endpoint::Null)
    }

    pub fn closed(&self) -> bool {
        match self {
            Endpoint::Real(c) => c.closed.load(Ordering::Acquire),
            Endpoint::Null => true,
        }
    }

    /// Read up to `max` bytes. An empty return means EOF, not an error.
    pub async fn read(&self, max: usize) -> Result<Bytes, EndpointError> {
        match self {
            Endpoint::Null => Ok(Bytes::new()),
            Endpoint::Real(c) => {
                if c.closed.load(Ordering::Acquire) {
                    return Ok(Bytes::new());
                }
                let mut buf = vec![0u8; max];
                let mut reader = c.reader.lock().await;
                let n = reader.read(&mut buf).await.map_err(EndpointError::Read)?;
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Non-blocking-style buffered write. Call `drain` to push it out.
    pub async fn write(&self, data: &[u8]) -> Result<(), EndpointError> {
        match self {
            Endpoint::Null => Ok(()),
            Endpoint::Real(c) => {
                if c.closed.load(Ordering::Acquire) {
                    return Ok(());
                }
                let mut writer = c.writer.lock().await;
                writer.write_all(data).await.map_err(EndpointError::Write)
            }
        }
    }

    /// Wait for the write buffer to be flushed.
    pub async fn drain(&self) -> Result<(), EndpointError> {
        match self {
            Endpoint::Null => Ok(()),
            Endpoint::Real(c) => {
                if c.closed.load(Ordering::Acquire) {
                    return Ok(());
                }
                let mut writer = c.writer.lock().await;
                writer.flush().await.map_err(EndpointError::Write)
            }
        }
    }

    /// `write(data)` followed by `drain()` — the combination spec §9 ("Open
    /// question: backward write flush") requires on both directions for
    /// correct backpressure.
    pub async fn flush_write(&self, data: &[u8]) -> Result<(), EndpointError> {
        self.write(data).await?;
        self.drain().await
    }

    /// Idempotent, safe to call from either direction's task concurrently.
    pub async fn close(&self) {
        match self {
            Endpoint::Null => {}
            Endpoint::Real(c) => {
                if c.closed.swap(true, Ordering::AcqRel) {
                    return;
                }
                let mut writer = c.writer.lock().await;
                let _ = writer.shutdown().await;
            }
        }
    }

    /// Opaque metadata about the peer, e.g. its socket address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Null => None,
            Endpoint::Real(c) => c.peer_addr,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Null => f.write_str("Endpoint::Null"),
            Endpoint::Real(c) => f
                .debug_struct("Endpoint::Real")
                .field("peer_addr", &c.peer_addr)
                .field("closed", &c.closed.load(Ordering::Relaxed))
                .finish(),
        }
    }
}
