//! Peer-to-Peer Streaming Peer Protocol (RFC 7574) engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod bin;
pub mod binmap;
pub mod channel;
pub mod chunk;
pub mod config;
pub mod congestion;
pub mod error;
pub mod host;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod scheduler;
pub mod swarm;
pub mod wire;

pub use bin::Bin;
pub use binmap::Binmap;
pub use channel::{Channel, ChannelState};
pub use config::{Config, ConfigError, SchedulingPolicy};
pub use congestion::Ledbat;
pub use error::PeerError;
pub use host::{
    dispatch, Discovery, MemoryStorage, StaticDiscovery, Storage, StorageError, Transport,
};
pub use identity::{SourceKey, SourceKeypair};
pub use integrity::{IntegrityError, MerkleTree, PeerTrustTracker, TrustAnchor};
pub use protocol::{
    Addressing, ChannelId, Datagram, HashFunction, IntegrityMethod, Message, SwarmId,
    PROTOCOL_VERSION,
};
pub use scheduler::Scheduler;
pub use swarm::{OutboundAction, Swarm, SwarmError, SwarmView};
pub use wire::{decode_datagram, encode_datagram, DecodeError, EncodeError};
