//! Common test helpers for comrelay tests
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - Port allocation
//! - A scriptable TCP peer that records, optionally echoes, and can drop
//!   its connections on demand

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Find an available UDP port for testing
pub fn find_available_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// UDP Helpers
// ============================================================================

/// Receive one datagram as text, or `None` on timeout
pub async fn recv_text(socket: &UdpSocket, max_wait: Duration) -> Option<(String, SocketAddr)> {
    let mut buf = vec![0u8; 65536];
    match timeout(max_wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => Some((String::from_utf8_lossy(&buf[..len]).into_owned(), from)),
        _ => None,
    }
}

// ============================================================================
// Test TCP Peer - RAII wrapper with proper cleanup
// ============================================================================

/// A TCP server standing in for a robot controller. Stops listening on drop.
pub struct TcpPeer {
    port: u16,
    accepts: Arc<AtomicU32>,
    received: Arc<Mutex<Vec<String>>>,
    kick: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TcpPeer {
    /// Listen on an ephemeral port, recording only
    pub async fn start() -> Self {
        Self::bind(0, false).await
    }

    /// Listen on an ephemeral port and write every chunk back
    pub async fn echo() -> Self {
        Self::bind(0, true).await
    }

    /// Listen on a specific port
    pub async fn bind(port: u16, echo: bool) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accepts = Arc::new(AtomicU32::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (kick, _) = broadcast::channel(4);

        let handle = {
            let accepts = accepts.clone();
            let received = received.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    accepts.fetch_add(1, Ordering::SeqCst);
                    let received = received.clone();
                    let mut kicked = kick.subscribe();

                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        loop {
                            tokio::select! {
                                _ = kicked.recv() => break,
                                result = stream.read(&mut buf) => match result {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        received
                                            .lock()
                                            .push(String::from_utf8_lossy(&buf[..n]).into_owned());
                                        if echo && stream.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                },
                            }
                        }
                    });
                }
            })
        };

        Self {
            port,
            accepts,
            received,
            kick,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far
    pub fn accepts(&self) -> u32 {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Chunks received, in arrival order
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Everything received, concatenated
    pub fn received_text(&self) -> String {
        self.received.lock().concat()
    }

    pub fn clear(&self) {
        self.received.lock().clear();
    }

    pub async fn wait_for_accepts(&self, n: u32, max_wait: Duration) -> bool {
        wait_for_count(&self.accepts, n, max_wait).await
    }

    /// Wait until the concatenated input contains `needle`
    pub async fn wait_for_text(&self, needle: &str, max_wait: Duration) -> bool {
        wait_for(
            || async { self.received_text().contains(needle) },
            DEFAULT_CHECK_INTERVAL,
            max_wait,
        )
        .await
    }

    /// Close every open connection; keep listening
    pub fn disconnect_all(&self) {
        let _ = self.kick.send(());
    }

    /// Close every connection and stop listening (also happens on drop)
    pub fn close(&mut self) {
        let _ = self.kick.send(());
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.close();
    }
}
