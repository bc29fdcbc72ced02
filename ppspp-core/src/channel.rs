//! Channel: one protocol session with one peer inside a swarm.
//!
//! Lifecycle: CONNECTING -> HANDSHAKING -> ESTABLISHED -> CLOSING -> CLOSED,
//! with FAILED reachable from any non-terminal state. The channel owns the
//! per-peer bookkeeping (peer availability, outstanding requests, upload
//! queue, congestion window); shared state (hash tree, local availability)
//! belongs to the swarm, which drives the channel.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::config::Config;
use crate::congestion::Ledbat;
use crate::error::PeerError;
use crate::protocol::{ChannelId, Message, MessageType, Negotiated};
use crate::wire::WireContext;

/// Served bins remembered per channel to spot repeated requests.
const SERVED_MEMORY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Handshaking,
    Established,
    Closing,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn can_become(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Established)
                | (Established, Closing)
                | (Connecting | Handshaking, Closing)
                | (Closing, Closed)
                | (Connecting | Handshaking | Established | Closing, Failed)
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A REQUEST awaiting its DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingRequest {
    pub bin: Bin,
    pub first_sent_at: Instant,
    pub sent_at: Instant,
    pub retries: u32,
}

/// Result of a timeout sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expired {
    /// Re-requested from the same peer.
    pub retransmitted: Vec<Bin>,
    /// Out of retries; back to the missing pool.
    pub dropped: Vec<Bin>,
}

pub struct Channel {
    local_id: ChannelId,
    remote_id: ChannelId,
    peer: SocketAddr,
    state: ChannelState,
    initiator: bool,
    negotiated: Option<Negotiated>,
    wire: WireContext,
    chunk_size: u64,
    peer_have: Binmap,
    outstanding: BTreeMap<Bin, OutstandingRequest>,
    gave_up: BTreeSet<Bin>,
    upload_queue: VecDeque<Bin>,
    hashes_sent: HashSet<Bin>,
    served: BTreeSet<Bin>,
    cc: Ledbat,
    choked_by_peer: bool,
    choking_peer: bool,
    violations: u32,
    send_failures: u32,
    last_recv: Instant,
    last_send: Instant,
    handshake_sent_at: Option<Instant>,
    handshake_attempts: u32,
    close_reason: Option<PeerError>,
    outbox: Vec<Message>,
}

impl Channel {
    fn new(local_id: ChannelId, peer: SocketAddr, now: Instant, config: &Config) -> Self {
        Self {
            local_id,
            remote_id: ChannelId::ZERO,
            peer,
            state: ChannelState::Connecting,
            initiator: true,
            negotiated: None,
            wire: WireContext {
                addressing: config.addressing,
                hash_len: config.hash_function.output_len(),
                ..WireContext::default()
            },
            chunk_size: u64::from(config.chunk_size),
            peer_have: Binmap::new(),
            outstanding: BTreeMap::new(),
            gave_up: BTreeSet::new(),
            upload_queue: VecDeque::new(),
            hashes_sent: HashSet::new(),
            served: BTreeSet::new(),
            cc: Ledbat::new(config.chunk_size, config.ledbat_target(), config.ledbat_gain),
            choked_by_peer: false,
            choking_peer: false,
            violations: 0,
            send_failures: 0,
            last_recv: now,
            last_send: now,
            handshake_sent_at: None,
            handshake_attempts: 0,
            close_reason: None,
            outbox: Vec::new(),
        }
    }

    /// Outbound channel: CONNECTING until its HANDSHAKE goes out.
    pub fn initiate(local_id: ChannelId, peer: SocketAddr, now: Instant, config: &Config) -> Self {
        Self::new(local_id, peer, now, config)
    }

    /// Inbound channel whose HANDSHAKE already negotiated: ESTABLISHED at once.
    pub fn accept(
        local_id: ChannelId,
        remote_id: ChannelId,
        peer: SocketAddr,
        negotiated: Negotiated,
        now: Instant,
        config: &Config,
    ) -> Self {
        let mut ch = Self::new(local_id, peer, now, config);
        ch.initiator = false;
        ch.remote_id = remote_id;
        ch.chunk_size = u64::from(negotiated.chunk_size);
        ch.wire = WireContext::from_negotiated(&negotiated);
        ch.negotiated = Some(negotiated);
        ch.state = ChannelState::Established;
        info!(channel = %local_id, peer = %peer, remote = %remote_id, "channel accepted");
        ch
    }

    pub fn local_id(&self) -> ChannelId {
        self.local_id
    }

    /// Peer's channel ID; zero until its HANDSHAKE arrives.
    pub fn remote_id(&self) -> ChannelId {
        self.remote_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn wire(&self) -> &WireContext {
        &self.wire
    }

    pub fn peer_have(&self) -> &Binmap {
        &self.peer_have
    }

    pub fn outstanding(&self) -> &BTreeMap<Bin, OutstandingRequest> {
        &self.outstanding
    }

    /// Bins this peer failed to deliver within the retry budget.
    pub fn gave_up(&self) -> &BTreeSet<Bin> {
        &self.gave_up
    }

    pub fn congestion(&self) -> &Ledbat {
        &self.cc
    }

    /// Chunks the congestion window still admits.
    pub fn headroom_chunks(&self) -> u64 {
        self.cc.open_window() / self.chunk_size.max(1)
    }

    pub fn is_choked_by_peer(&self) -> bool {
        self.choked_by_peer
    }

    pub fn is_choking_peer(&self) -> bool {
        self.choking_peer
    }

    pub fn close_reason(&self) -> Option<&PeerError> {
        self.close_reason.as_ref()
    }

    pub fn hashes_sent(&self) -> &HashSet<Bin> {
        &self.hashes_sent
    }

    /// Bins uploaded that the peer has not yet confirmed.
    pub fn served(&self) -> &BTreeSet<Bin> {
        &self.served
    }

    pub fn upload_queue_len(&self) -> usize {
        self.upload_queue.len()
    }

    /// True if the peer accepts messages of type `t`.
    pub fn supports(&self, t: MessageType) -> bool {
        self.negotiated
            .as_ref()
            .map_or(true, |n| n.supported_messages.contains(&(t as u8)))
    }

    fn transition(&mut self, next: ChannelState) -> bool {
        if !self.state.can_become(next) {
            debug!(channel = %self.local_id, from = %self.state, to = %next, "transition ignored");
            return false;
        }
        info!(channel = %self.local_id, peer = %self.peer, from = %self.state, to = %next, "channel state");
        self.state = next;
        true
    }

    /// The HANDSHAKE went out (first send or retransmit).
    pub fn handshake_sent(&mut self, now: Instant) {
        if self.state == ChannelState::Connecting {
            self.transition(ChannelState::Handshaking);
        }
        self.handshake_sent_at = Some(now);
        self.handshake_attempts += 1;
        self.last_send = now;
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts
    }

    /// True if the HANDSHAKE reply is overdue.
    pub fn handshake_due(&self, now: Instant, timeout: Duration) -> bool {
        self.state == ChannelState::Handshaking
            && self
                .handshake_sent_at
                .is_some_and(|t| now.saturating_duration_since(t) >= timeout)
    }

    /// Peer's HANDSHAKE reply accepted.
    pub fn establish(&mut self, remote_id: ChannelId, negotiated: Negotiated) -> bool {
        if !self.transition(ChannelState::Established) {
            return false;
        }
        self.remote_id = remote_id;
        self.chunk_size = u64::from(negotiated.chunk_size);
        self.wire = WireContext::from_negotiated(&negotiated);
        self.negotiated = Some(negotiated);
        true
    }

    /// Move to FAILED. Outstanding requests are released and returned.
    pub fn fail(&mut self, reason: PeerError) -> Vec<Bin> {
        warn!(channel = %self.local_id, peer = %self.peer, reason = %reason, "channel failed");
        if !self.transition(ChannelState::Failed) {
            return Vec::new();
        }
        self.close_reason = Some(reason);
        self.release_all()
    }

    /// Move to CLOSING and queue a RESET. Outstanding requests are released and returned.
    pub fn begin_close(&mut self, reason: PeerError) -> Vec<Bin> {
        if !self.transition(ChannelState::Closing) {
            return Vec::new();
        }
        debug!(channel = %self.local_id, reason = %reason, "closing");
        self.close_reason = Some(reason);
        self.outbox.clear();
        self.upload_queue.clear();
        self.outbox.push(Message::Reset);
        self.release_all()
    }

    /// RESET sent; the channel is done.
    pub fn finish_close(&mut self) {
        self.transition(ChannelState::Closed);
    }

    fn release_all(&mut self) -> Vec<Bin> {
        let bins: Vec<Bin> = self.outstanding.keys().copied().collect();
        for _ in &bins {
            self.cc.on_release(self.chunk_size);
        }
        self.outstanding.clear();
        self.upload_queue.clear();
        bins
    }

    /// Any datagram from the peer proves liveness.
    pub fn on_receive(&mut self, now: Instant) {
        self.last_recv = now;
        self.send_failures = 0;
    }

    /// Peer announced `bin`. Returns the number of newly known chunks.
    pub fn on_have(&mut self, bin: Bin) -> u64 {
        self.served.retain(|b| !bin.contains(*b));
        self.peer_have.insert_bin(bin)
    }

    /// Forget peer availability below `index` (live discard window).
    pub fn discard_below(&mut self, index: u64) {
        self.peer_have.remove_below(index);
        self.served.retain(|b| b.base_offset() >= index);
    }

    /// Record and queue a REQUEST for a leaf bin.
    pub fn request(&mut self, bin: Bin, now: Instant) -> bool {
        if self.outstanding.contains_key(&bin) {
            return false;
        }
        self.outstanding.insert(
            bin,
            OutstandingRequest {
                bin,
                first_sent_at: now,
                sent_at: now,
                retries: 0,
            },
        );
        self.cc.on_send(self.chunk_size);
        self.outbox.push(Message::Request { bin });
        true
    }

    /// DATA for `bin` arrived. Returns false if it was not requested here.
    pub fn on_delivered(&mut self, bin: Bin, delay_sample_us: i64) -> bool {
        if self.outstanding.remove(&bin).is_none() {
            return false;
        }
        self.cc.on_ack(self.chunk_size, delay_sample_us);
        true
    }

    /// Drop an outstanding request without penalty (verified via another peer,
    /// cancelled, or past the playhead). Queues a CANCEL if `cancel` is set.
    pub fn release(&mut self, bin: Bin, cancel: bool) -> bool {
        if self.outstanding.remove(&bin).is_none() {
            return false;
        }
        self.cc.on_release(self.chunk_size);
        if cancel && self.is_established() {
            self.outbox.push(Message::Cancel { bin });
        }
        true
    }

    /// `bin` is now held locally; no further requests to anyone are needed.
    pub fn forget_bin(&mut self, bin: Bin) {
        self.gave_up.remove(&bin);
        self.served.remove(&bin);
    }

    /// Retransmit or drop requests older than `timeout`.
    pub fn expire_requests(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> Expired {
        let mut out = Expired::default();
        let due: Vec<Bin> = self
            .outstanding
            .values()
            .filter(|r| now.saturating_duration_since(r.sent_at) >= timeout)
            .map(|r| r.bin)
            .collect();
        for bin in due {
            let Some(req) = self.outstanding.get_mut(&bin) else {
                continue;
            };
            if req.retries < max_retries {
                req.retries += 1;
                req.sent_at = now;
                self.outbox.push(Message::Request { bin });
                out.retransmitted.push(bin);
            } else {
                self.outstanding.remove(&bin);
                self.cc.on_timeout(self.chunk_size);
                self.gave_up.insert(bin);
                debug!(channel = %self.local_id, bin = %bin, "request dropped after retries");
                out.dropped.push(bin);
            }
        }
        out
    }

    /// Queue an upload obligation for a leaf bin the peer requested.
    pub fn queue_upload(&mut self, bin: Bin, limit: usize) -> Result<bool, PeerError> {
        if self.upload_queue.contains(&bin) {
            return Ok(false);
        }
        if self.served.contains(&bin) {
            // A repeated request means our earlier proof may have been lost.
            debug!(channel = %self.local_id, bin = %bin, "re-request, resending hashes");
            self.hashes_sent.clear();
        }
        if self.upload_queue.len() >= limit {
            return Err(PeerError::ResourceExhausted("upload queue"));
        }
        self.upload_queue.push_back(bin);
        Ok(true)
    }

    /// CANCEL: drop queued uploads under `bin`.
    pub fn cancel_upload(&mut self, bin: Bin) -> usize {
        let before = self.upload_queue.len();
        self.upload_queue.retain(|b| !bin.contains(*b));
        before - self.upload_queue.len()
    }

    pub fn next_upload(&mut self) -> Option<Bin> {
        let bin = self.upload_queue.pop_front()?;
        self.served.insert(bin);
        if self.served.len() > SERVED_MEMORY {
            self.served.pop_first();
        }
        Some(bin)
    }

    /// Peer stopped serving us. Our outstanding requests are released.
    pub fn on_choke(&mut self) -> Vec<Bin> {
        self.choked_by_peer = true;
        let bins: Vec<Bin> = self.outstanding.keys().copied().collect();
        for _ in &bins {
            self.cc.on_release(self.chunk_size);
        }
        self.outstanding.clear();
        bins
    }

    pub fn on_unchoke(&mut self) {
        self.choked_by_peer = false;
    }

    /// Stop or resume serving this peer.
    pub fn set_choking(&mut self, choking: bool) -> bool {
        if self.choking_peer == choking {
            return false;
        }
        self.choking_peer = choking;
        if choking {
            self.upload_queue.clear();
            self.outbox.push(Message::Choke);
        } else {
            self.outbox.push(Message::Unchoke);
        }
        true
    }

    /// Count an undecodable datagram. True once the threshold is reached.
    pub fn record_violation(&mut self, max: u32) -> bool {
        self.violations += 1;
        self.violations >= max
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Count a failed send. True once the threshold is reached.
    pub fn record_send_failure(&mut self, max: u32) -> bool {
        self.send_failures += 1;
        self.send_failures >= max
    }

    pub fn mark_hash_sent(&mut self, bin: Bin) {
        self.hashes_sent.insert(bin);
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_recv) >= timeout
    }

    pub fn keepalive_due(&self, now: Instant, interval: Duration) -> bool {
        self.is_established() && now.saturating_duration_since(self.last_send) >= interval
    }

    pub fn push(&mut self, m: Message) {
        self.outbox.push(m);
    }

    pub fn has_outbox(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Messages queued since the last flush. Marks the channel as having sent.
    pub fn take_outbox(&mut self, now: Instant) -> Vec<Message> {
        if !self.outbox.is_empty() {
            self.last_send = now;
        }
        std::mem::take(&mut self.outbox)
    }

    /// Keepalive is an empty datagram; this only stamps the send time.
    pub fn keepalive_sent(&mut self, now: Instant) {
        self.last_send = now;
    }
}
