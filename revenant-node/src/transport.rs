//! UDP broadcast transport: one socket, opaque datagrams in and out.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use revenant_core::protocol::MAX_DATAGRAM_LEN;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Raw datagram as received, before any decoding.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind udp {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("broadcast send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("datagram of {0} bytes exceeds udp limit")]
    TooLarge(usize),
    #[error("transport stopped")]
    Stopped,
}

/// Anything that can put one datagram on the shared channel.
/// Each call sends exactly one datagram or fails.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, datagram: &[u8]) -> Result<(), TransportError>;
}

pub struct Transport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    target: SocketAddr,
    local_addr: SocketAddr,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Bind `0.0.0.0:port` and broadcast to `255.255.255.255:port`.
    /// Must be called from within a tokio runtime.
    pub fn start(port: u16) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Datagram>), TransportError> {
        Self::start_with(
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        )
    }

    /// Bind `bind` and send every datagram to `target`.
    pub fn start_with(
        bind: SocketAddr,
        target: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Datagram>), TransportError> {
        let socket = make_broadcast_socket(bind).map_err(|source| TransportError::Bind {
            addr: bind,
            source,
        })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::Bind { addr: bind, source })?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        let recv_task = tokio::spawn(recv_loop(socket.clone(), tx));
        tracing::info!(%local_addr, %target, "transport started");
        let transport = Arc::new(Self {
            socket: RwLock::new(Some(socket)),
            target,
            local_addr,
            recv_task: Mutex::new(Some(recv_task)),
        });
        Ok((transport, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Release the socket. Later `broadcast` calls fail with [`TransportError::Stopped`].
    pub async fn stop(&self) {
        let socket = self.socket.write().await.take();
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        if socket.is_some() {
            tracing::info!(local_addr = %self.local_addr, "transport stopped");
        }
    }
}

#[async_trait]
impl Broadcaster for Transport {
    async fn broadcast(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if datagram.len() > MAX_DATAGRAM_LEN {
            return Err(TransportError::TooLarge(datagram.len()));
        }
        let socket = self
            .socket
            .read()
            .await
            .clone()
            .ok_or(TransportError::Stopped)?;
        socket
            .send_to(datagram, self.target)
            .await
            .map_err(TransportError::Send)?;
        Ok(())
    }
}

fn make_broadcast_socket(bind: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(bind),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    UdpSocket::from_std(socket.into())
}

/// Pause after a transient receive error before reading again.
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Backoff for a receive error, or `None` when the socket is beyond recovery.
fn recv_retry_delay(kind: ErrorKind) -> Option<Duration> {
    match kind {
        ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::OutOfMemory => Some(RECV_RETRY_DELAY),
        _ => None,
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<Datagram>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let datagram = Datagram {
                    bytes: buf[..n].to_vec(),
                    from,
                };
                if tx.send(datagram).is_err() {
                    break;
                }
            }
            Err(e) => match recv_retry_delay(e.kind()) {
                Some(delay) => {
                    tracing::warn!(error = %e, "udp receive failed");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(error = %e, "udp receive failed; receiver stopped");
                    break;
                }
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    async fn delivers_datagram_between_sockets() {
        let (receiver, mut rx) = Transport::start_with(loopback(), loopback()).unwrap();
        let (sender, _rx) = Transport::start_with(loopback(), receiver.local_addr()).unwrap();

        sender.broadcast(b"opaque bytes").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.bytes, b"opaque bytes");
        assert_eq!(got.from, sender.local_addr());

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn broadcast_after_stop_fails() {
        let (t, _rx) = Transport::start_with(loopback(), loopback()).unwrap();
        t.stop().await;
        assert!(matches!(
            t.broadcast(b"late").await,
            Err(TransportError::Stopped)
        ));
        // idempotent
        t.stop().await;
    }

    #[tokio::test]
    async fn oversized_datagram_rejected() {
        let (t, _rx) = Transport::start_with(loopback(), loopback()).unwrap();
        let big = vec![0u8; MAX_DATAGRAM_LEN + 1];
        assert!(matches!(
            t.broadcast(&big).await,
            Err(TransportError::TooLarge(_))
        ));
        t.stop().await;
    }

    #[test]
    fn receive_errors_back_off_or_stop() {
        assert_eq!(
            recv_retry_delay(ErrorKind::ConnectionReset),
            Some(RECV_RETRY_DELAY)
        );
        assert_eq!(recv_retry_delay(ErrorKind::Interrupted), Some(RECV_RETRY_DELAY));
        assert_eq!(recv_retry_delay(ErrorKind::NotConnected), None);
        assert_eq!(recv_retry_delay(ErrorKind::InvalidInput), None);
    }

    #[tokio::test]
    async fn rebind_same_port_after_stop() {
        let (first, _rx) = Transport::start_with(loopback(), loopback()).unwrap();
        let addr = first.local_addr();
        first.stop().await;
        drop(first);
        let (second, _rx) = Transport::start_with(addr, loopback()).unwrap();
        assert_eq!(second.local_addr(), addr);
        second.stop().await;
    }
}
