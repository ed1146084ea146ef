//! In-memory connector — a loopback endpoint for tests, benches, and
//! embedded hosts that terminate the channel in-process.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connector::{Connection, ConnectionReceiver, ConnectionSender, Connector};

struct HubInner {
    accepted: AtomicU32,
    fail_next: AtomicU32,
    hang: AtomicBool,
    servers: mpsc::UnboundedSender<MemoryServer>,
}

/// Loopback connector. Each successful `connect` yields a [`MemoryServer`]
/// handle on the hub side for the peer to script.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<HubInner>,
    servers: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryServer>>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(HubInner {
                accepted: AtomicU32::new(0),
                fail_next: AtomicU32::new(0),
                hang: AtomicBool::new(false),
                servers: tx,
            }),
            servers: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Make the next `n` connect attempts fail with a handshake error.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make connect attempts hang forever (half-open handshake).
    pub fn hang_connects(&self, hang: bool) {
        self.inner.hang.store(hang, Ordering::SeqCst);
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> u32 {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    /// Wait for the server-side handle of the next accepted connection.
    pub async fn next_server(&self) -> MemoryServer {
        self.servers
            .lock()
            .await
            .recv()
            .await
            .expect("connector hub dropped")
    }
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn connect(&self, _url: &str) -> anyhow::Result<MemoryConnection> {
        if self.inner.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("connection refused");
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let server = MemoryServer {
            incoming: server_rx,
            outgoing: Some(server_tx),
        };
        let _ = self.inner.servers.send(server);
        self.inner.accepted.fetch_add(1, Ordering::SeqCst);

        Ok(MemoryConnection {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

pub struct MemoryConnection {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

pub struct MemorySender {
    tx: mpsc::UnboundedSender<String>,
}

pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl Connection for MemoryConnection {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    fn split(self) -> (MemorySender, MemoryReceiver) {
        (MemorySender { tx: self.tx }, MemoryReceiver { rx: self.rx })
    }
}

impl ConnectionSender for MemorySender {
    async fn send(&mut self, text: String) -> anyhow::Result<()> {
        self.tx
            .send(text)
            .map_err(|_| anyhow::anyhow!("peer closed the connection"))
    }

    async fn close(&mut self) {}
}

impl ConnectionReceiver for MemoryReceiver {
    async fn recv(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.rx.recv().await)
    }
}

/// Server-side handle for one accepted loopback connection.
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

impl MemoryServer {
    /// Next frame sent by the client; `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Push a frame to the client. Silently dropped after close.
    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = &self.outgoing {
            let _ = tx.send(text.into());
        }
    }

    /// Close the connection from the server side; the client observes a
    /// clean end-of-stream.
    pub fn close(&mut self) {
        self.outgoing = None;
        self.incoming.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{
        Connection as _, ConnectionReceiver as _, ConnectionSender as _, Connector as _,
    };

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let connector = MemoryConnector::new();
        let conn = connector.connect("memory://test").await.unwrap();
        let (mut tx, mut rx) = conn.split();
        let mut server = connector.next_server().await;

        tx.send("hello".into()).await.unwrap();
        assert_eq!(server.recv().await.as_deref(), Some("hello"));

        server.send("world");
        assert_eq!(rx.recv().await.unwrap().as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_server_close_yields_clean_end_of_stream() {
        let connector = MemoryConnector::new();
        let conn = connector.connect("memory://test").await.unwrap();
        let (_tx, mut rx) = conn.split();
        let mut server = connector.next_server().await;

        server.close();
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let connector = MemoryConnector::new();
        connector.fail_next_connects(2);

        assert!(connector.connect("memory://test").await.is_err());
        assert!(connector.connect("memory://test").await.is_err());
        assert!(connector.connect("memory://test").await.is_ok());
        assert_eq!(connector.accepted(), 1);
    }
}
