//! UDP transport: one socket shared by the receive task and the swarm task.

use std::net::SocketAddr;
use std::sync::Arc;

use ppspp_core::Transport;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

use crate::Event;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    /// Never waits: a full socket buffer is reported as a failed send.
    fn send(&mut self, peer: SocketAddr, bytes: &[u8]) -> std::io::Result<()> {
        let n = self.socket.try_send_to(bytes, peer)?;
        if n != bytes.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "datagram truncated",
            ));
        }
        Ok(())
    }
}

/// Forward every inbound datagram to the swarm task until the queue closes.
pub async fn recv_loop(
    socket: Arc<UdpSocket>,
    max_datagram: usize,
    events: mpsc::Sender<Event>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; max_datagram.max(1500)];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if events
                    .send(Event::Datagram(from, buf[..n].to_vec()))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
            // ICMP port-unreachable surfaces here on Linux; the peer's channel times out on its own.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                warn!(error = %e, "udp recv");
            }
            Err(e) => return Err(e),
        }
    }
}
