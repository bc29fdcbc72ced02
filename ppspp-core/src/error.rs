//! Why a channel closed or failed. Per-peer failures stay with that peer's channel.

use crate::integrity::IntegrityError;
use crate::protocol::NegotiationError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    /// Incompatible handshake options. Not retried.
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    /// Bad hash or unresolved proof. The data is dropped, the channel survives.
    #[error("integrity: {0}")]
    Integrity(#[from] IntegrityError),
    /// Malformed or out-of-sequence traffic past the tolerated count.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Timeout, explicit RESET, or local close.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(&'static str),
    /// Local bound exceeded; incoming work is dropped.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}
