//! Protocol tunables. Every field has a default so a partial TOML table works.

use std::time::Duration;

use serde::Deserialize;

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::integrity::DEFAULT_MAX_INTEGRITY_FAILURES;
use crate::protocol::{Addressing, HashFunction, IntegrityMethod, VARIABLE_CHUNK_SIZE};

/// Room left in a datagram for the channel header, DATA framing and timestamp.
const DATA_OVERHEAD: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size {0} is out of range")]
    ChunkSize(u32),
    #[error("datagram size {datagram} cannot carry a {chunk}-byte chunk")]
    DatagramTooSmall { datagram: usize, chunk: u32 },
    #[error("addressing {0:?} is not supported")]
    Addressing(Addressing),
    #[error("hash function {0:?} is not supported")]
    HashFunction(HashFunction),
    #[error("{0} must be positive")]
    Zero(&'static str),
}

/// Which missing bins the scheduler prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Video on demand: fewest holders first, ties to the lowest index.
    RarestFirst,
    /// Live: lowest index inside the playback window; late bins are skipped.
    InOrder,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Chunk size in bytes (default 1024).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_hash_function")]
    pub hash_function: HashFunction,
    #[serde(default = "default_addressing")]
    pub addressing: Addressing,
    #[serde(default = "default_integrity")]
    pub integrity: IntegrityMethod,
    /// Live swarms: each signed munro covers `2^munro_layer` chunks.
    #[serde(default = "default_munro_layer")]
    pub munro_layer: u32,
    /// Live swarms: chunks kept behind the newest one. `None` keeps everything.
    #[serde(default)]
    pub live_discard_window: Option<u64>,
    #[serde(default = "default_policy")]
    pub policy: SchedulingPolicy,
    /// In-order policy: chunks ahead of the playhead eligible for requests.
    #[serde(default = "default_playback_window")]
    pub playback_window: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retransmissions of a REQUEST before the bin goes back to the pool.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retries after which a second peer may be asked for the same bin.
    #[serde(default = "default_endgame_after_retries")]
    pub endgame_after_retries: u32,
    /// Duplicate requests allowed per scheduling tick.
    #[serde(default = "default_endgame_max_duplicates")]
    pub endgame_max_duplicates: usize,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Silence after which an established channel is closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_handshake_retries")]
    pub handshake_retries: u32,
    /// Undecodable datagrams tolerated before a channel is closed.
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,
    /// Chunks held while waiting for their hashes.
    #[serde(default = "default_max_pending_chunks")]
    pub max_pending_chunks: usize,
    /// Queued outbound DATA per channel.
    #[serde(default = "default_upload_queue_limit")]
    pub upload_queue_limit: usize,
    /// DATA messages sent per channel per tick.
    #[serde(default = "default_uploads_per_tick")]
    pub uploads_per_tick: usize,
    #[serde(default = "default_max_integrity_failures")]
    pub max_integrity_failures: u32,
    #[serde(default = "default_ledbat_target_ms")]
    pub ledbat_target_ms: u64,
    #[serde(default = "default_ledbat_gain")]
    pub ledbat_gain: f64,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    /// Consecutive failed sends before a channel is closed.
    #[serde(default = "default_max_send_failures")]
    pub max_send_failures: u32,
}

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}
fn default_hash_function() -> HashFunction {
    HashFunction::Sha256
}
fn default_addressing() -> Addressing {
    Addressing::Bins32
}
fn default_integrity() -> IntegrityMethod {
    IntegrityMethod::MerkleHashTree
}
fn default_munro_layer() -> u32 {
    6
}
fn default_policy() -> SchedulingPolicy {
    SchedulingPolicy::RarestFirst
}
fn default_playback_window() -> u64 {
    256
}
fn default_request_timeout_ms() -> u64 {
    2_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_endgame_after_retries() -> u32 {
    1
}
fn default_endgame_max_duplicates() -> usize {
    4
}
fn default_keepalive_interval_ms() -> u64 {
    10_000
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
fn default_handshake_timeout_ms() -> u64 {
    1_000
}
fn default_handshake_retries() -> u32 {
    5
}
fn default_max_violations() -> u32 {
    8
}
fn default_max_pending_chunks() -> usize {
    256
}
fn default_upload_queue_limit() -> usize {
    256
}
fn default_uploads_per_tick() -> usize {
    64
}
fn default_max_integrity_failures() -> u32 {
    DEFAULT_MAX_INTEGRITY_FAILURES
}
fn default_ledbat_target_ms() -> u64 {
    100
}
fn default_ledbat_gain() -> f64 {
    1.0
}
fn default_max_peers() -> usize {
    32
}
fn default_max_datagram_size() -> usize {
    1400
}
fn default_max_send_failures() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            hash_function: default_hash_function(),
            addressing: default_addressing(),
            integrity: default_integrity(),
            munro_layer: default_munro_layer(),
            live_discard_window: None,
            policy: default_policy(),
            playback_window: default_playback_window(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            endgame_after_retries: default_endgame_after_retries(),
            endgame_max_duplicates: default_endgame_max_duplicates(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            handshake_retries: default_handshake_retries(),
            max_violations: default_max_violations(),
            max_pending_chunks: default_max_pending_chunks(),
            upload_queue_limit: default_upload_queue_limit(),
            uploads_per_tick: default_uploads_per_tick(),
            max_integrity_failures: default_max_integrity_failures(),
            ledbat_target_ms: default_ledbat_target_ms(),
            ledbat_gain: default_ledbat_gain(),
            max_peers: default_max_peers(),
            max_datagram_size: default_max_datagram_size(),
            max_send_failures: default_max_send_failures(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size == VARIABLE_CHUNK_SIZE {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.max_datagram_size < self.chunk_size as usize + DATA_OVERHEAD {
            return Err(ConfigError::DatagramTooSmall {
                datagram: self.max_datagram_size,
                chunk: self.chunk_size,
            });
        }
        if !self.addressing.is_supported() {
            return Err(ConfigError::Addressing(self.addressing));
        }
        if self.hash_function == HashFunction::Sha1 {
            return Err(ConfigError::HashFunction(self.hash_function));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Zero("max_peers"));
        }
        if self.playback_window == 0 {
            return Err(ConfigError::Zero("playback_window"));
        }
        if self.ledbat_gain.is_nan() || self.ledbat_gain <= 0.0 {
            return Err(ConfigError::Zero("ledbat_gain"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ledbat_target(&self) -> Duration {
        Duration::from_millis(self.ledbat_target_ms)
    }
}
