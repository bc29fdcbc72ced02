//! LAN discovery: UDP multicast beacons naming the swarm and our listen port.
//! Peers heard on the same swarm are handed to the swarm task.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ppspp_core::{SwarmId, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use crate::Event;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const MAGIC: &[u8; 4] = b"PPSB";
const HEADER_LEN: usize = 4 + 1 + 8 + 2;

/// One announcement: who is sending (random per process), where it listens, which swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub nonce: u64,
    pub listen_port: u16,
    pub swarm_id: SwarmId,
}

impl Beacon {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.swarm_id.as_bytes().len());
        out.extend_from_slice(MAGIC);
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.listen_port.to_be_bytes());
        out.extend_from_slice(self.swarm_id.as_bytes());
        out
    }

    /// `None` for foreign traffic or another protocol version.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() <= HEADER_LEN || &buf[..4] != MAGIC || buf[4] != PROTOCOL_VERSION {
            return None;
        }
        let nonce = u64::from_be_bytes(buf[5..13].try_into().ok()?);
        let listen_port = u16::from_be_bytes(buf[13..15].try_into().ok()?);
        Some(Self {
            nonce,
            listen_port,
            swarm_id: SwarmId(buf[HEADER_LEN..].to_vec()),
        })
    }
}

pub async fn run_discovery(
    swarm_id: SwarmId,
    discovery_port: u16,
    listen_port: u16,
    events: mpsc::Sender<Event>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let beacon = Beacon {
        nonce: rand::random(),
        listen_port,
        swarm_id,
    };
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));

    let send_socket = socket.clone();
    let frame = beacon.encode();
    let beacon_task = tokio::spawn(async move { beacon_loop(send_socket, frame, dest).await });
    let recv_task = tokio::spawn(async move { recv_loop(socket, beacon, events).await });

    let _ = tokio::try_join!(beacon_task, recv_task);
    Ok(())
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    frame: Vec<u8>,
    dest: SocketAddr,
) -> std::io::Result<()> {
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    ours: Beacon,
    events: mpsc::Sender<Event>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 1500];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(beacon) = Beacon::decode(&buf[..n]) else {
            continue;
        };
        if beacon.nonce == ours.nonce || beacon.swarm_id != ours.swarm_id {
            continue;
        }
        let peer = SocketAddr::new(from.ip(), beacon.listen_port);
        debug!(peer = %peer, "swarm peer on the LAN");
        if events.send(Event::Discovered(peer)).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_roundtrip() {
        let b = Beacon {
            nonce: 0x0102_0304_0506_0708,
            listen_port: 6778,
            swarm_id: SwarmId(vec![0xab; 32]),
        };
        let bytes = b.encode();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(Beacon::decode(&bytes), Some(b));
    }

    #[test]
    fn foreign_datagrams_ignored() {
        assert_eq!(Beacon::decode(b""), None);
        assert_eq!(Beacon::decode(b"PPSB"), None);
        let mut bytes = Beacon {
            nonce: 1,
            listen_port: 1,
            swarm_id: SwarmId(vec![1]),
        }
        .encode();
        bytes[4] = PROTOCOL_VERSION + 1;
        assert_eq!(Beacon::decode(&bytes), None);
        // Beacon with an empty swarm ID carries nothing to match on.
        assert_eq!(Beacon::decode(&bytes[..HEADER_LEN]), None);
    }
}
