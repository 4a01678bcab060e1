//! [`ConnectionRegistry`] – the set of live client connections.
//!
//! The registry owns the write side of every connection from acceptance
//! until removal.  Reads happen in each connection's own loop and never go
//! through the registry.
//!
//! * [`add`][ConnectionRegistry::add] and [`remove`][ConnectionRegistry::remove]
//!   may be called concurrently from any task.
//! * [`broadcast_all`][ConnectionRegistry::broadcast_all] writes to a
//!   snapshot of the membership.  A connection whose write fails or times
//!   out is removed; the others still receive the payload.
//! * Removal is idempotent and closes the write side exactly once.  It also
//!   fires the connection's close signal, which ends its read loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use armlink_types::{ArmError, ConnectionId};
use futures_util::future::join_all;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

/// Write side of a client byte stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ────────────────────────────────────────────────────────────────────────────
// ClientConnection
// ────────────────────────────────────────────────────────────────────────────

/// One accepted client: identity, peer label and the write half of its
/// stream.  Whole payloads are written under the writer lock, so lines from
/// different senders never interleave mid-line.
pub struct ClientConnection {
    id: ConnectionId,
    peer: String,
    writer: Mutex<Option<BoxWriter>>,
    closed: CancellationToken,
}

impl ClientConnection {
    pub fn new(peer: impl Into<String>, writer: BoxWriter) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            peer: peer.into(),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write and flush `payload`, failing if it takes longer than `timeout`.
    ///
    /// # Errors
    ///
    /// [`ArmError::Transport`] on I/O failure, timeout, or when the
    /// connection has already been closed.
    pub async fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), ArmError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| ArmError::Transport(format!("connection {} is closed", self.id)))?;
        let write = async {
            writer.write_all(payload).await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ArmError::Transport(format!("write to {} failed: {e}", self.peer))),
            Err(_) => Err(ArmError::Transport(format!(
                "write to {} timed out after {timeout:?}",
                self.peer
            ))),
        }
    }

    /// Resolves once the connection has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Signal the read loop and shut the write side down.  Later calls are
    /// no-ops.
    async fn close(&self) {
        self.closed.cancel();
        let taken = self.writer.lock().await.take();
        if let Some(mut writer) = taken
            && let Err(e) = writer.shutdown().await
        {
            debug!(conn_id = %self.id, error = %e, "shutdown of write side failed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ConnectionRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Delivery summary of one [`ConnectionRegistry::broadcast_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Concurrent set of live connections keyed by [`ConnectionId`].
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    write_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            write_timeout,
        }
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn add(&self, conn: Arc<ClientConnection>) {
        info!(conn_id = %conn.id(), peer = %conn.peer(), "client connected");
        self.write_map().insert(conn.id(), conn);
    }

    /// Remove `id` and close its write side.  Returns `true` only for the
    /// call that actually removed it.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.write_map().remove(&id);
        match removed {
            Some(conn) => {
                conn.close().await;
                info!(conn_id = %id, peer = %conn.peer(), "client disconnected");
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.read_map().len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read_map().contains_key(&id)
    }

    /// Write `payload` to one connection, removing it on failure.
    pub async fn send_to(&self, conn: &ClientConnection, payload: &str) -> Result<(), ArmError> {
        if let Err(e) = conn.send(payload.as_bytes(), self.write_timeout).await {
            warn!(conn_id = %conn.id(), error = %e, "dropping client after failed write");
            self.remove(conn.id()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Write `payload` to every connection in the current membership.
    pub async fn broadcast_all(&self, payload: &str) -> BroadcastReport {
        let snapshot: Vec<Arc<ClientConnection>> = self.read_map().values().cloned().collect();
        if snapshot.is_empty() {
            return BroadcastReport::default();
        }

        let results = join_all(snapshot.iter().map(|conn| self.send_to(conn, payload))).await;
        let dropped = results.iter().filter(|r| r.is_err()).count();
        BroadcastReport {
            delivered: results.len() - dropped,
            dropped,
        }
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Arc<ClientConnection>>> {
        // The map holds no invariant a panicking writer could break.
        self.clients.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<ClientConnection>>> {
        self.clients.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    /// A writer whose every write fails, as a reset socket would.
    pub(crate) struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer reset")))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// A healthy in-memory client; returns the connection and the far end.
    pub(crate) fn duplex_client(peer: &str) -> (Arc<ClientConnection>, DuplexStream) {
        let (near, far) = duplex(64 * 1024);
        (ClientConnection::new(peer, Box::new(near)), far)
    }

    pub(crate) async fn read_available(far: &mut DuplexStream, n: usize) -> String {
        let mut buf = vec![0u8; n];
        far.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn add_count_and_remove() {
        let reg = registry();
        let (a, _fa) = duplex_client("a");
        let (b, _fb) = duplex_client("b");
        reg.add(Arc::clone(&a));
        reg.add(Arc::clone(&b));
        assert_eq!(reg.count(), 2);
        assert!(reg.remove(a.id()).await);
        assert_eq!(reg.count(), 1);
        assert!(!reg.contains(a.id()));
        assert!(reg.contains(b.id()));
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_closes_once() {
        let reg = registry();
        let (a, _fa) = duplex_client("a");
        reg.add(Arc::clone(&a));
        assert!(reg.remove(a.id()).await);
        assert!(!reg.remove(a.id()).await);
        assert!(a.is_closed().await);
        a.closed().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let reg = registry();
        let (a, mut fa) = duplex_client("a");
        let (b, mut fb) = duplex_client("b");
        reg.add(a);
        reg.add(b);
        let report = reg.broadcast_all("True\n").await;
        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 0 });
        assert_eq!(read_available(&mut fa, 5).await, "True\n");
        assert_eq!(read_available(&mut fb, 5).await, "True\n");
    }

    #[tokio::test]
    async fn failed_write_drops_only_that_client() {
        let reg = registry();
        let broken = ClientConnection::new("a", Box::new(BrokenWriter));
        let (b, mut fb) = duplex_client("b");
        reg.add(Arc::clone(&broken));
        reg.add(Arc::clone(&b));

        let report = reg.broadcast_all("1,2,3\n").await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert!(!reg.contains(broken.id()));
        assert_eq!(reg.count(), 1);
        assert_eq!(read_available(&mut fb, 6).await, "1,2,3\n");

        // The next broadcast still reaches B and does not try A again.
        let report = reg.broadcast_all("False\n").await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 0 });
        assert_eq!(read_available(&mut fb, 6).await, "False\n");
    }

    #[tokio::test]
    async fn stalled_client_times_out_and_is_dropped() {
        let reg = ConnectionRegistry::new(Duration::from_millis(50));
        // Tiny buffer that nobody drains: the second write blocks.
        let (near, _far) = duplex(4);
        let stalled = ClientConnection::new("stalled", Box::new(near));
        reg.add(Arc::clone(&stalled));
        let report = reg.broadcast_all("0123456789\n").await;
        assert_eq!(report.dropped, 1);
        assert_eq!(reg.count(), 0);
        tokio::time::timeout(Duration::from_millis(100), stalled.closed())
            .await
            .expect("close signal not fired for the dropped client");
    }

    #[tokio::test]
    async fn send_after_close_is_a_transport_error() {
        let reg = registry();
        let (a, _fa) = duplex_client("a");
        reg.add(Arc::clone(&a));
        reg.remove(a.id()).await;
        let err = a.send(b"x", Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ArmError::Transport(_)));
    }
}
