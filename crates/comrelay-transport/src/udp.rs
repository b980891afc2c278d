//! Bound UDP socket with a cancellable receive task

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::task::{shutdown_channel, ShutdownTrigger};

/// Largest payload a single UDP datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// A bound UDP socket. Sending works as soon as it is bound; receiving starts
/// with [`UdpEndpoint::spawn_receiver`] and ends with [`UdpEndpoint::close`].
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    trigger: ShutdownTrigger,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEndpoint {
    /// Bind to `host:port`; port 0 lets the OS choose
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((host, port))
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}:{}: {}", host, port, e)))?;
        let local_addr = socket.local_addr()?;
        let (trigger, _) = shutdown_channel();

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            trigger,
            receiver: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize> {
        if self.trigger.is_triggered() {
            return Err(TransportError::NotStarted);
        }
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", target, e)))
    }

    /// Spawn the receive loop. `handler` runs on the receive task for every
    /// datagram, in arrival order.
    pub fn spawn_receiver<F>(&self, label: &str, max_packet_size: usize, mut handler: F) -> Result<()>
    where
        F: FnMut(&[u8], SocketAddr) + Send + 'static,
    {
        let mut receiver = self.receiver.lock();
        if receiver.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let socket = self.socket.clone();
        let mut shutdown = self.trigger.signal();
        let task_label = label.to_string();
        let size = max_packet_size.clamp(1, MAX_UDP_PAYLOAD);

        *receiver = Some(tokio::spawn(async move {
            let label = task_label;
            let mut buf = vec![0u8; size];

            loop {
                tokio::select! {
                    _ = shutdown.triggered() => break,

                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, from)) => {
                            debug!(client = %label, "received {} bytes from {}", len, from);
                            handler(&buf[..len], from);
                        }
                        Err(e) => {
                            // ICMP port-unreachable from an earlier send surfaces
                            // here on some platforms; it does not end the loop.
                            if e.kind() == std::io::ErrorKind::ConnectionReset {
                                debug!(client = %label, "ignoring connection reset");
                                continue;
                            }
                            error!(client = %label, "listen error: {}", e);
                            break;
                        }
                    },
                }
            }

            debug!(client = %label, "receiver exited");
        }));

        info!(client = label, "listening on {}", self.local_addr);
        Ok(())
    }

    /// Stop receiving and refuse further sends. Idempotent.
    pub fn close(&self) {
        self.trigger.trigger();
        self.receiver.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.trigger.is_triggered()
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}
