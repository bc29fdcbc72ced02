//! Collaborators the host supplies: datagram transport, chunk storage, peer discovery.
//!
//! The core never performs I/O itself. Inbound datagrams are handed to
//! [`crate::Swarm::on_datagram`]; outbound ones come back as
//! [`crate::OutboundAction::Send`] and are passed to a [`Transport`] by [`dispatch`].

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::bin::Bin;
use crate::protocol::SwarmId;
use crate::swarm::{OutboundAction, Swarm};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("bin {0} is not a single chunk")]
    NotLeaf(Bin),
    #[error("chunk of {got} bytes exceeds chunk size {max}")]
    TooLarge { got: usize, max: usize },
}

/// Send one datagram. Errors are reported back to the swarm as degraded liveness.
pub trait Transport {
    fn send(&mut self, peer: SocketAddr, bytes: &[u8]) -> std::io::Result<()>;
}

/// Verified chunk bytes, addressed by leaf bin.
pub trait Storage {
    fn write_chunk(&mut self, bin: Bin, data: &[u8]) -> Result<(), StorageError>;
    /// `Ok(None)` if the chunk is not stored.
    fn read_chunk(&mut self, bin: Bin) -> Result<Option<Vec<u8>>, StorageError>;
}

/// Source of candidate peers for a swarm (tracker, DHT, static list).
pub trait Discovery {
    fn find_peers(&mut self, swarm_id: &SwarmId) -> Vec<SocketAddr>;
}

/// Fixed peer list, e.g. from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

impl Discovery for StaticDiscovery {
    fn find_peers(&mut self, _swarm_id: &SwarmId) -> Vec<SocketAddr> {
        self.peers.clone()
    }
}

/// In-memory chunk store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    chunks: HashMap<u64, Vec<u8>>,
    writes: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `write_chunk` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Stored chunks concatenated in index order, stopping at the first gap.
    pub fn contiguous(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut i = 0;
        while let Some(c) = self.chunks.get(&i) {
            out.extend_from_slice(c);
            i += 1;
        }
        out
    }
}

impl Storage for MemoryStorage {
    fn write_chunk(&mut self, bin: Bin, data: &[u8]) -> Result<(), StorageError> {
        if !bin.is_leaf() {
            return Err(StorageError::NotLeaf(bin));
        }
        self.writes += 1;
        self.chunks.insert(bin.base_offset(), data.to_vec());
        Ok(())
    }

    fn read_chunk(&mut self, bin: Bin) -> Result<Option<Vec<u8>>, StorageError> {
        if !bin.is_leaf() {
            return Err(StorageError::NotLeaf(bin));
        }
        Ok(self.chunks.get(&bin.base_offset()).cloned())
    }
}

/// Hand `Send` actions to the transport; failed sends are fed back to the swarm.
/// Returns the remaining (non-send) actions plus any the swarm produced in reaction.
pub fn dispatch<S: Storage, T: Transport>(
    swarm: &mut Swarm<S>,
    transport: &mut T,
    now: std::time::Instant,
    actions: Vec<OutboundAction>,
) -> Vec<OutboundAction> {
    let mut queue = actions;
    let mut rest = Vec::new();
    while !queue.is_empty() {
        let mut follow_up = Vec::new();
        for action in queue {
            match action {
                OutboundAction::Send { to, bytes } => {
                    if let Err(e) = transport.send(to, &bytes) {
                        tracing::debug!(peer = %to, error = %e, "send failed");
                        follow_up.extend(swarm.on_send_failed(now, to));
                    }
                }
                other => rest.push(other),
            }
        }
        queue = follow_up;
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_roundtrip() {
        let mut s = MemoryStorage::new();
        assert_eq!(s.read_chunk(Bin::chunk(2)).unwrap(), None);
        s.write_chunk(Bin::chunk(0), b"ab").unwrap();
        s.write_chunk(Bin::chunk(1), b"cd").unwrap();
        s.write_chunk(Bin::chunk(3), b"zz").unwrap();
        assert_eq!(s.read_chunk(Bin::chunk(1)).unwrap(), Some(b"cd".to_vec()));
        assert_eq!(s.contiguous(), b"abcd".to_vec());
        assert_eq!(s.writes(), 3);
        assert!(matches!(
            s.write_chunk(Bin::new(1), b"x"),
            Err(StorageError::NotLeaf(_))
        ));
    }

    #[test]
    fn static_discovery_returns_list() {
        let addr: SocketAddr = "127.0.0.1:6778".parse().unwrap();
        let mut d = StaticDiscovery::new(vec![addr]);
        assert_eq!(d.find_peers(&SwarmId(vec![1])), vec![addr]);
    }
}
