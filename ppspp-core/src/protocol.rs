//! PPSPP message model: message types, protocol options and handshake negotiation.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{SocketAddrV4, SocketAddrV6};

use serde::{Deserialize, Serialize};

use crate::bin::Bin;

/// Protocol version spoken by this implementation (RFC 7574).
pub const PROTOCOL_VERSION: u8 = 1;

/// Local channel identifier. Zero is reserved for the initiating HANDSHAKE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub const ZERO: ChannelId = ChannelId(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Random non-zero channel ID.
    pub fn random<R: rand::Rng + ?Sized>(rng: &mut R) -> Self {
        loop {
            let v: u32 = rng.gen();
            if v != 0 {
                return ChannelId(v);
            }
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Swarm identifier: root hash for static content, source public key for live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwarmId(pub Vec<u8>);

impl SwarmId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        if self.0.len() > 8 {
            f.write_str("…")?;
        }
        Ok(())
    }
}

/// Message type codes (RFC 7574 §8.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 0,
    Data = 1,
    Ack = 2,
    Have = 3,
    Integrity = 4,
    PexResV4 = 5,
    PexReq = 6,
    SignedIntegrity = 7,
    Request = 8,
    Cancel = 9,
    Choke = 10,
    Unchoke = 11,
    PexResV6 = 12,
    PexResCert = 13,
}

impl MessageType {
    pub const ALL: [MessageType; 14] = [
        MessageType::Handshake,
        MessageType::Data,
        MessageType::Ack,
        MessageType::Have,
        MessageType::Integrity,
        MessageType::PexResV4,
        MessageType::PexReq,
        MessageType::SignedIntegrity,
        MessageType::Request,
        MessageType::Cancel,
        MessageType::Choke,
        MessageType::Unchoke,
        MessageType::PexResV6,
        MessageType::PexResCert,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// Content integrity protection method (RFC 7574 §7.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityMethod {
    None = 0,
    MerkleHashTree = 1,
    SignAll = 2,
    UnifiedMerkleTree = 3,
}

impl IntegrityMethod {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::MerkleHashTree),
            2 => Some(Self::SignAll),
            3 => Some(Self::UnifiedMerkleTree),
            _ => None,
        }
    }
}

/// Merkle hash tree function (RFC 7574 §7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    Sha1 = 0,
    Sha224 = 1,
    Sha256 = 2,
    Sha384 = 3,
    Sha512 = 4,
}

impl HashFunction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Sha1),
            1 => Some(Self::Sha224),
            2 => Some(Self::Sha256),
            3 => Some(Self::Sha384),
            4 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }
}

/// Live signature algorithm, DNSSEC algorithm numbers (RFC 7574 §7.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    Ed25519,
    Other(u8),
}

impl SignatureAlgorithm {
    pub fn from_u8(v: u8) -> Self {
        match v {
            5 => Self::RsaSha1,
            8 => Self::RsaSha256,
            13 => Self::EcdsaP256Sha256,
            14 => Self::EcdsaP384Sha384,
            15 => Self::Ed25519,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::RsaSha1 => 5,
            Self::RsaSha256 => 8,
            Self::EcdsaP256Sha256 => 13,
            Self::EcdsaP384Sha384 => 14,
            Self::Ed25519 => 15,
            Self::Other(v) => v,
        }
    }

    /// Signature length in bytes, if this implementation can verify it.
    pub fn signature_len(self) -> Option<usize> {
        match self {
            Self::Ed25519 => Some(64),
            _ => None,
        }
    }
}

/// Chunk addressing method (RFC 7574 §7.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Addressing {
    Bins32 = 0,
    ByteRanges64 = 1,
    ChunkRanges32 = 2,
    Bins64 = 3,
    ChunkRanges64 = 4,
}

impl Addressing {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Bins32),
            1 => Some(Self::ByteRanges64),
            2 => Some(Self::ChunkRanges32),
            3 => Some(Self::Bins64),
            4 => Some(Self::ChunkRanges64),
            _ => None,
        }
    }

    /// Width in bytes of one addressing value (a bin or one end of a range).
    pub fn value_width(self) -> usize {
        match self {
            Self::Bins32 | Self::ChunkRanges32 => 4,
            Self::ByteRanges64 | Self::Bins64 | Self::ChunkRanges64 => 8,
        }
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, Self::ByteRanges64)
    }
}

/// Protocol options carried in HANDSHAKE (RFC 7574 §7). Absent options are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolOptions {
    pub version: Option<u8>,
    pub minimum_version: Option<u8>,
    pub swarm_id: Option<SwarmId>,
    pub integrity: Option<IntegrityMethod>,
    pub hash_function: Option<HashFunction>,
    pub signature_algorithm: Option<SignatureAlgorithm>,
    pub addressing: Option<Addressing>,
    pub live_discard_window: Option<u64>,
    pub supported_messages: Option<BTreeSet<u8>>,
    pub chunk_size: Option<u32>,
}

/// Chunk size value announcing variable-sized chunks.
pub const VARIABLE_CHUNK_SIZE: u32 = 0xFFFF_FFFF;

/// Effective parameters of a channel once both handshakes agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub integrity: IntegrityMethod,
    pub hash_function: HashFunction,
    pub signature_algorithm: SignatureAlgorithm,
    pub addressing: Addressing,
    pub chunk_size: u32,
    pub live_discard_window: Option<u64>,
    pub supported_messages: BTreeSet<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("peer speaks protocol version {0}, need {PROTOCOL_VERSION}")]
    Version(u8),
    #[error("swarm id does not match")]
    SwarmMismatch,
    #[error("unsupported chunk addressing method {0:?}")]
    Addressing(Addressing),
    #[error("unsupported merkle hash function {0:?}")]
    HashFunction(HashFunction),
    #[error("unsupported content integrity method {0:?}")]
    Integrity(IntegrityMethod),
    #[error("unsupported live signature algorithm {0:?}")]
    SignatureAlgorithm(SignatureAlgorithm),
    #[error("peer and local {0} options differ")]
    Conflict(&'static str),
    #[error("chunk size {0} not usable")]
    ChunkSize(u32),
    #[error("peer rejected the handshake")]
    Rejected,
}

impl ProtocolOptions {
    /// Check a peer's options against ours and produce the channel parameters.
    /// The peer's swarm id, when present, must equal ours; per-swarm content
    /// parameters it names must agree with ours.
    pub fn negotiate(&self, peer: &ProtocolOptions) -> Result<Negotiated, NegotiationError> {
        if let Some(v) = peer.version {
            let min = peer.minimum_version.unwrap_or(v);
            if !(min..=v).contains(&PROTOCOL_VERSION) {
                return Err(NegotiationError::Version(v));
            }
        }
        if let (Some(ours), Some(theirs)) = (&self.swarm_id, &peer.swarm_id) {
            if ours != theirs {
                return Err(NegotiationError::SwarmMismatch);
            }
        }

        let addressing = peer
            .addressing
            .or(self.addressing)
            .unwrap_or(Addressing::Bins32);
        if !addressing.is_supported() {
            return Err(NegotiationError::Addressing(addressing));
        }
        let integrity = pick(self.integrity, peer.integrity, "integrity")?
            .unwrap_or(IntegrityMethod::MerkleHashTree);
        if integrity == IntegrityMethod::SignAll {
            return Err(NegotiationError::Integrity(integrity));
        }
        let hash_function = pick(self.hash_function, peer.hash_function, "hash function")?
            .unwrap_or(HashFunction::Sha256);
        if hash_function == HashFunction::Sha1 {
            return Err(NegotiationError::HashFunction(hash_function));
        }
        let signature_algorithm = pick(
            self.signature_algorithm,
            peer.signature_algorithm,
            "signature algorithm",
        )?
        .unwrap_or(SignatureAlgorithm::Ed25519);
        if integrity == IntegrityMethod::UnifiedMerkleTree
            && signature_algorithm.signature_len().is_none()
        {
            return Err(NegotiationError::SignatureAlgorithm(signature_algorithm));
        }
        let chunk_size = pick(self.chunk_size, peer.chunk_size, "chunk size")?
            .unwrap_or(crate::chunk::DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 || chunk_size == VARIABLE_CHUNK_SIZE {
            return Err(NegotiationError::ChunkSize(chunk_size));
        }
        let supported_messages = peer
            .supported_messages
            .clone()
            .unwrap_or_else(|| MessageType::ALL.iter().map(|t| *t as u8).collect());

        Ok(Negotiated {
            integrity,
            hash_function,
            signature_algorithm,
            addressing,
            chunk_size,
            live_discard_window: peer.live_discard_window.or(self.live_discard_window),
            supported_messages,
        })
    }
}

fn pick<T: PartialEq + Copy>(
    ours: Option<T>,
    theirs: Option<T>,
    what: &'static str,
) -> Result<Option<T>, NegotiationError> {
    match (ours, theirs) {
        (Some(a), Some(b)) if a != b => Err(NegotiationError::Conflict(what)),
        (a, b) => Ok(a.or(b)),
    }
}

/// One PPSPP message, decoded once and dispatched on its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake {
        source_channel: ChannelId,
        options: ProtocolOptions,
    },
    /// Explicit close: on the wire, a HANDSHAKE with an all-zero source channel.
    Reset,
    Data {
        bin: Bin,
        timestamp: u64,
        payload: Vec<u8>,
    },
    Ack {
        bin: Bin,
        delay_sample: i64,
    },
    Have {
        bin: Bin,
    },
    Integrity {
        bin: Bin,
        hash: Vec<u8>,
    },
    SignedIntegrity {
        bin: Bin,
        timestamp: u64,
        signature: Vec<u8>,
    },
    Request {
        bin: Bin,
    },
    Cancel {
        bin: Bin,
    },
    Choke,
    Unchoke,
    PexReq,
    PexResV4(SocketAddrV4),
    PexResV6(SocketAddrV6),
    PexResCert(Vec<u8>),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake { .. } | Message::Reset => MessageType::Handshake,
            Message::Data { .. } => MessageType::Data,
            Message::Ack { .. } => MessageType::Ack,
            Message::Have { .. } => MessageType::Have,
            Message::Integrity { .. } => MessageType::Integrity,
            Message::SignedIntegrity { .. } => MessageType::SignedIntegrity,
            Message::Request { .. } => MessageType::Request,
            Message::Cancel { .. } => MessageType::Cancel,
            Message::Choke => MessageType::Choke,
            Message::Unchoke => MessageType::Unchoke,
            Message::PexReq => MessageType::PexReq,
            Message::PexResV4(_) => MessageType::PexResV4,
            Message::PexResV6(_) => MessageType::PexResV6,
            Message::PexResCert(_) => MessageType::PexResCert,
        }
    }
}

/// A datagram: destination channel plus zero or more messages (zero = keepalive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub channel: ChannelId,
    pub messages: Vec<Message>,
}

impl Datagram {
    pub fn new(channel: ChannelId, messages: Vec<Message>) -> Self {
        Self { channel, messages }
    }

    pub fn keepalive(channel: ChannelId) -> Self {
        Self::new(channel, Vec::new())
    }
}
