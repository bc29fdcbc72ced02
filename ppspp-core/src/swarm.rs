//! Swarm manager: the channels of one swarm around a shared hash tree,
//! local availability and the chunk scheduler.
//!
//! Everything is host-driven. Inbound datagrams go to [`Swarm::on_datagram`],
//! timers to [`Swarm::tick`]; each call returns the [`OutboundAction`]s the
//! host must carry out. Nothing in here blocks or touches a socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Range;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::bin::{chunks_to_covering_bins, Bin};
use crate::binmap::Binmap;
use crate::channel::{Channel, ChannelState};
use crate::chunk::{self, ChunkBuffer};
use crate::config::{Config, ConfigError, SchedulingPolicy};
use crate::error::PeerError;
use crate::host::{Discovery, Storage, StorageError};
use crate::identity::{SourceKey, SourceKeypair};
use crate::integrity::{
    IntegrityError, MerkleTree, PeerTrustTracker, Resolved, TreeHasher, TrustAnchor,
};
use crate::protocol::{
    ChannelId, Datagram, IntegrityMethod, Message, MessageType, NegotiationError,
    ProtocolOptions, SignatureAlgorithm, SwarmId, PROTOCOL_VERSION,
};
use crate::scheduler::{PeerSlot, Scheduler};
use crate::wire::{self, WireContext};

/// Peers listed in one PEX answer.
const MAX_PEX_PEERS: usize = 32;

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Transmit one datagram.
    Send { to: SocketAddr, bytes: Vec<u8> },
    /// A chunk passed verification and was written to storage.
    ChunkVerified(Bin),
    /// A channel reached CLOSED or FAILED and was removed.
    ChannelClosed {
        peer: SocketAddr,
        state: ChannelState,
        reason: PeerError,
    },
    /// An address learned through peer exchange.
    PeerDiscovered(SocketAddr),
    /// Every chunk of static content is verified.
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("no peers found for the swarm")]
    NoPeers,
    #[error("swarm id does not fit the integrity method")]
    InvalidSwarmId,
    #[error("integrity method {0:?} cannot be used here")]
    UnsupportedIntegrity(IntegrityMethod),
    #[error("peer limit reached")]
    TooManyPeers,
    #[error("only the live source injects chunks")]
    NotSource,
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What this node holds: verified chunks, the content length when known, and
/// the live discard floor.
#[derive(Debug, Clone, Default)]
pub struct SwarmView {
    have: Binmap,
    chunk_count: Option<u64>,
    floor: u64,
}

impl SwarmView {
    pub fn have(&self) -> &Binmap {
        &self.have
    }

    pub fn chunk_count(&self) -> Option<u64> {
        self.chunk_count
    }

    /// Lowest chunk still kept; everything below fell out of the live window.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn verified_count(&self) -> u64 {
        self.have.len()
    }

    pub fn is_verified(&self, index: u64) -> bool {
        self.have.contains_chunk(index)
    }

    pub fn latest(&self) -> Option<u64> {
        self.have.highest()
    }

    /// Static content only.
    pub fn is_complete(&self) -> bool {
        self.chunk_count
            .is_some_and(|n| n > 0 && self.have.covered_in(0, n) == n)
    }

    fn record(&mut self, index: u64) -> bool {
        self.have.insert_chunk(index)
    }

    fn discard_below(&mut self, index: u64) -> u64 {
        if index <= self.floor {
            return 0;
        }
        self.floor = index;
        self.have.remove_below(index)
    }
}

/// A delivered chunk held in the tree until its hashes arrive.
#[derive(Debug, Clone, Copy)]
struct PendingChunk {
    channel: ChannelId,
    since: Instant,
}

pub struct Swarm<S: Storage> {
    swarm_id: SwarmId,
    config: Config,
    options: ProtocolOptions,
    tree: MerkleTree,
    pending: HashMap<Bin, PendingChunk>,
    view: SwarmView,
    storage: S,
    scheduler: Scheduler,
    trust: PeerTrustTracker,
    channels: HashMap<ChannelId, Channel>,
    by_peer: HashMap<SocketAddr, ChannelId>,
    source: Option<SourceKeypair>,
    next_live_index: u64,
    epoch: Instant,
    completed: bool,
    actions: Vec<OutboundAction>,
}

impl<S: Storage> Swarm<S> {
    /// Swarm around an existing tree. The swarm ID must match the tree's
    /// anchor: the root hash for static content, the source key for live.
    pub fn new(
        swarm_id: SwarmId,
        tree: MerkleTree,
        storage: S,
        config: Config,
        now: Instant,
    ) -> Result<Self, SwarmError> {
        config.validate()?;
        let integrity = match tree.anchor() {
            TrustAnchor::None => IntegrityMethod::None,
            TrustAnchor::Root { hash, .. } => {
                if hash.as_slice() != swarm_id.as_bytes() {
                    return Err(SwarmError::InvalidSwarmId);
                }
                IntegrityMethod::MerkleHashTree
            }
            TrustAnchor::Signed { key, .. } => {
                if key.swarm_id() != swarm_id {
                    return Err(SwarmError::InvalidSwarmId);
                }
                IntegrityMethod::UnifiedMerkleTree
            }
        };
        let live = integrity == IntegrityMethod::UnifiedMerkleTree;
        let options = ProtocolOptions {
            version: Some(PROTOCOL_VERSION),
            minimum_version: Some(PROTOCOL_VERSION),
            swarm_id: Some(swarm_id.clone()),
            integrity: Some(integrity),
            hash_function: Some(tree.hasher().function()),
            signature_algorithm: live.then_some(SignatureAlgorithm::Ed25519),
            addressing: Some(config.addressing),
            live_discard_window: if live { config.live_discard_window } else { None },
            supported_messages: None,
            chunk_size: Some(config.chunk_size),
        };
        let view = SwarmView {
            chunk_count: tree.chunk_count(),
            ..SwarmView::default()
        };
        info!(swarm = %swarm_id, integrity = ?integrity, "swarm created");
        Ok(Self {
            swarm_id,
            options,
            tree,
            pending: HashMap::new(),
            view,
            storage,
            scheduler: Scheduler::new(&config),
            trust: PeerTrustTracker::new(),
            channels: HashMap::new(),
            by_peer: HashMap::new(),
            source: None,
            next_live_index: 0,
            epoch: now,
            completed: false,
            actions: Vec::new(),
            config,
        })
    }

    /// Seed static content held in memory: chunk it, build the tree, store
    /// every chunk. The swarm ID is the root hash (or, without integrity, the
    /// hash of the whole content).
    pub fn from_content(
        content: &[u8],
        mut storage: S,
        config: Config,
        now: Instant,
    ) -> Result<Self, SwarmError> {
        let chunks = chunk::split_into_chunks(content, config.chunk_size);
        if chunks.is_empty() {
            return Err(IntegrityError::EmptyContent.into());
        }
        let (swarm_id, tree) = match config.integrity {
            IntegrityMethod::MerkleHashTree => {
                let tree =
                    MerkleTree::from_chunks(config.hash_function, &chunks, config.max_pending_chunks)?;
                let id = SwarmId(tree.root_hash().unwrap_or_default().to_vec());
                (id, tree)
            }
            IntegrityMethod::None => {
                let id = SwarmId(TreeHasher::new(config.hash_function)?.leaf(content));
                let tree = MerkleTree::new(
                    config.hash_function,
                    TrustAnchor::None,
                    config.max_pending_chunks,
                )?;
                (id, tree)
            }
            other => return Err(SwarmError::UnsupportedIntegrity(other)),
        };
        for (i, c) in chunks.iter().enumerate() {
            storage.write_chunk(Bin::chunk(i as u64), c)?;
        }
        let count = chunks.len() as u64;
        let mut available = Binmap::new();
        available.insert_range(0, count);
        let mut swarm = Self::new(swarm_id, tree, storage, config, now)?;
        swarm.view.chunk_count = Some(count);
        Ok(swarm.with_verified(available))
    }

    /// Download static content of `chunk_count` chunks named by `swarm_id`.
    pub fn for_content(
        swarm_id: SwarmId,
        chunk_count: u64,
        storage: S,
        config: Config,
        now: Instant,
    ) -> Result<Self, SwarmError> {
        if chunk_count == 0 {
            return Err(IntegrityError::EmptyContent.into());
        }
        let tree = match config.integrity {
            IntegrityMethod::MerkleHashTree => {
                if swarm_id.as_bytes().len() != config.hash_function.output_len() {
                    return Err(SwarmError::InvalidSwarmId);
                }
                MerkleTree::new(
                    config.hash_function,
                    TrustAnchor::root(swarm_id.as_bytes().to_vec(), chunk_count),
                    config.max_pending_chunks,
                )?
            }
            IntegrityMethod::None => MerkleTree::new(
                config.hash_function,
                TrustAnchor::None,
                config.max_pending_chunks,
            )?,
            other => return Err(SwarmError::UnsupportedIntegrity(other)),
        };
        let mut swarm = Self::new(swarm_id, tree, storage, config, now)?;
        swarm.view.chunk_count = Some(chunk_count);
        Ok(swarm)
    }

    /// Live source: chunks arrive through [`Swarm::inject_live_chunk`].
    pub fn live_source(
        source: SourceKeypair,
        storage: S,
        config: Config,
        now: Instant,
    ) -> Result<Self, SwarmError> {
        let tree = MerkleTree::live(
            config.hash_function,
            *source.public_key(),
            config.munro_layer,
            config.max_pending_chunks,
        )?;
        let mut swarm = Self::new(source.swarm_id(), tree, storage, config, now)?;
        swarm.source = Some(source);
        Ok(swarm)
    }

    /// Join a live swarm. The swarm ID is the source's public key.
    pub fn live_receiver(
        swarm_id: SwarmId,
        storage: S,
        config: Config,
        now: Instant,
    ) -> Result<Self, SwarmError> {
        let key = SourceKey::from_swarm_id(&swarm_id).ok_or(SwarmError::InvalidSwarmId)?;
        let tree = MerkleTree::live(
            config.hash_function,
            key,
            config.munro_layer,
            config.max_pending_chunks,
        )?;
        Self::new(swarm_id, tree, storage, config, now)
    }

    /// Mark chunks the storage already holds (resume from a checkpoint).
    pub fn with_verified(mut self, have: Binmap) -> Self {
        for (s, e) in have.ranges() {
            self.view.have.insert_range(s, e);
        }
        self.completed = self.view.is_complete();
        self
    }

    pub fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn view(&self) -> &SwarmView {
        &self.view
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn trust(&self) -> &PeerTrustTracker {
        &self.trust
    }

    pub fn is_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channel_for(&self, peer: SocketAddr) -> Option<&Channel> {
        self.by_peer.get(&peer).and_then(|id| self.channels.get(id))
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> + '_ {
        self.channels.values()
    }

    /// Serialised hash tree for [`MerkleTree::restore`].
    pub fn checkpoint(&self) -> Result<Vec<u8>, SwarmError> {
        Ok(self.tree.checkpoint()?)
    }

    /// Open a channel to `peer`. A no-op if one exists.
    pub fn connect(
        &mut self,
        now: Instant,
        peer: SocketAddr,
    ) -> Result<Vec<OutboundAction>, SwarmError> {
        if !self.by_peer.contains_key(&peer) {
            if self.live_channel_count() >= self.config.max_peers {
                return Err(SwarmError::TooManyPeers);
            }
            self.open_channel(now, peer);
        }
        Ok(self.after_event(now))
    }

    /// Connect to whatever `discovery` knows for this swarm.
    pub fn bootstrap(
        &mut self,
        now: Instant,
        discovery: &mut dyn Discovery,
    ) -> Result<Vec<OutboundAction>, SwarmError> {
        let peers = discovery.find_peers(&self.swarm_id);
        if peers.is_empty() {
            return Err(SwarmError::NoPeers);
        }
        let mut out = Vec::new();
        for peer in peers {
            match self.connect(now, peer) {
                Ok(actions) => out.extend(actions),
                Err(SwarmError::TooManyPeers) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub fn on_datagram(
        &mut self,
        now: Instant,
        from: SocketAddr,
        bytes: &[u8],
    ) -> Vec<OutboundAction> {
        match wire::peek_channel(bytes) {
            None => debug!(peer = %from, len = bytes.len(), "runt datagram dropped"),
            Some(dest) if dest.is_zero() => self.on_channel_zero(now, from, bytes),
            Some(dest) => self.on_channel_datagram(now, from, dest, bytes),
        }
        self.after_event(now)
    }

    /// Timers: handshake retransmission, request expiry, idle close,
    /// keepalives, and buffered chunks whose hashes never came.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.tick_channel(now, id);
        }
        let timeout = self.config.request_timeout();
        self.drop_pending_where(|p| now.saturating_duration_since(p.since) >= timeout);
        self.after_event(now)
    }

    /// The host could not send to `peer`. Enough failures in a row fail the channel.
    pub fn on_send_failed(&mut self, now: Instant, peer: SocketAddr) -> Vec<OutboundAction> {
        let max = self.config.max_send_failures;
        if let Some(ch) = self
            .by_peer
            .get(&peer)
            .and_then(|id| self.channels.get_mut(id))
        {
            if ch.record_send_failure(max) {
                ch.fail(PeerError::PeerDisconnected("send failures"));
            }
        }
        self.after_event(now)
    }

    /// Stop serving `peer`.
    pub fn choke(&mut self, now: Instant, peer: SocketAddr) -> Vec<OutboundAction> {
        self.set_choking(peer, true);
        self.after_event(now)
    }

    pub fn unchoke(&mut self, now: Instant, peer: SocketAddr) -> Vec<OutboundAction> {
        self.set_choking(peer, false);
        self.after_event(now)
    }

    /// Advance playback. With the in-order policy, missing chunks behind the
    /// playhead are skipped and their requests cancelled.
    pub fn set_playhead(&mut self, now: Instant, index: u64) -> Vec<OutboundAction> {
        let skipped = self.scheduler.set_playhead(index, &self.view.have);
        if skipped > 0 {
            info!(playhead = index, skipped, "chunks skipped behind the playhead");
        }
        if self.scheduler.policy() == SchedulingPolicy::InOrder {
            for ch in self.channels.values_mut() {
                let late: Vec<Bin> = ch
                    .outstanding()
                    .keys()
                    .filter(|b| b.base_offset() < index)
                    .copied()
                    .collect();
                for bin in late {
                    ch.release(bin, true);
                }
            }
        }
        self.after_event(now)
    }

    /// Live source: append the next chunk. When it completes a munro, the
    /// munro is signed and announced.
    pub fn inject_live_chunk(
        &mut self,
        now: Instant,
        data: &[u8],
    ) -> Result<Vec<OutboundAction>, SwarmError> {
        let Some(source) = self.source.as_ref() else {
            return Err(SwarmError::NotSource);
        };
        let max = self.config.chunk_size as usize;
        if data.len() > max {
            return Err(StorageError::TooLarge {
                got: data.len(),
                max,
            }
            .into());
        }
        let index = self.next_live_index;
        self.storage.write_chunk(Bin::chunk(index), data)?;
        self.next_live_index += 1;
        if let Some((munro, hash)) = self.tree.add_source_chunk(index, data) {
            let timestamp = self.now_us(now);
            let signature = source.sign(munro, timestamp, &hash);
            self.tree.record_signature(munro, timestamp, signature);
            let (first, last) = munro.range();
            self.view.have.insert_range(first, last + 1);
            debug!(munro = %munro, "munro signed");
            for ch in self.channels.values_mut().filter(|c| c.is_established()) {
                ch.push(Message::Have { bin: munro });
            }
            self.apply_discard_window();
        }
        Ok(self.after_event(now))
    }

    /// Close every channel with a RESET.
    pub fn shutdown(&mut self, now: Instant) -> Vec<OutboundAction> {
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(id, PeerError::PeerDisconnected("shutdown"));
        }
        self.flush(now);
        self.reap();
        std::mem::take(&mut self.actions)
    }

    fn after_event(&mut self, now: Instant) -> Vec<OutboundAction> {
        self.schedule(now);
        self.serve_uploads(now);
        self.flush(now);
        self.reap();
        std::mem::take(&mut self.actions)
    }

    fn now_us(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_micros()).unwrap_or(u64::MAX)
    }

    fn live_channel_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| !c.state().is_terminal())
            .count()
    }

    fn allocate_channel_id(&self) -> ChannelId {
        let mut rng = rand::thread_rng();
        loop {
            let id = ChannelId::random(&mut rng);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    fn open_channel(&mut self, now: Instant, peer: SocketAddr) {
        let id = self.allocate_channel_id();
        let mut ch = Channel::initiate(id, peer, now, &self.config);
        ch.push(Message::Handshake {
            source_channel: id,
            options: self.options.clone(),
        });
        ch.handshake_sent(now);
        info!(channel = %id, peer = %peer, "connecting");
        self.channels.insert(id, ch);
        self.by_peer.insert(peer, id);
    }

    fn send_reset(&mut self, to: SocketAddr, channel: ChannelId) {
        let datagram = Datagram::new(channel, vec![Message::Reset]);
        match wire::encode_datagram(&datagram, &WireContext::default()) {
            Ok(bytes) => self.actions.push(OutboundAction::Send { to, bytes }),
            Err(e) => warn!(peer = %to, error = %e, "reset not encodable"),
        }
    }

    fn on_channel_zero(&mut self, now: Instant, from: SocketAddr, bytes: &[u8]) {
        let datagram = match wire::decode_datagram(bytes, &WireContext::default()) {
            Ok(d) => d,
            Err(e) => {
                debug!(peer = %from, error = %e, "undecodable handshake dropped");
                return;
            }
        };
        let mut messages = datagram.messages.into_iter();
        match messages.next() {
            Some(Message::Handshake {
                source_channel,
                options,
            }) => self.on_inbound_handshake(now, from, source_channel, options, messages.collect()),
            // The peer had no channel for us; drop whatever we hold for it.
            Some(Message::Reset) => {
                if let Some(id) = self.by_peer.get(&from).copied() {
                    self.on_reset(now, id);
                }
            }
            _ => debug!(peer = %from, "datagram for channel 0 without handshake dropped"),
        }
    }

    fn on_inbound_handshake(
        &mut self,
        now: Instant,
        from: SocketAddr,
        source: ChannelId,
        options: ProtocolOptions,
        rest: Vec<Message>,
    ) {
        if let Some(ch) = self.by_peer.get(&from).and_then(|id| self.channels.get(id)) {
            let existing = ch.local_id();
            match ch.state() {
                ChannelState::Connecting | ChannelState::Handshaking if ch.is_initiator() => {
                    // Simultaneous open: the lower channel ID survives.
                    if existing < source {
                        debug!(peer = %from, channel = %existing, "simultaneous open, keeping ours");
                        return;
                    }
                    debug!(peer = %from, channel = %existing, "simultaneous open, yielding");
                    self.channels.remove(&existing);
                    self.by_peer.remove(&from);
                }
                ChannelState::Established if ch.remote_id() == source => {
                    debug!(peer = %from, channel = %existing, "repeated handshake, answering again");
                    self.greet(existing);
                    return;
                }
                _ => self.close_channel(
                    existing,
                    PeerError::PeerDisconnected("superseded by a new handshake"),
                ),
            }
        }

        if options.swarm_id.is_none() {
            warn!(peer = %from, "handshake without swarm id refused");
            self.send_reset(from, source);
            return;
        }
        let negotiated = match self.options.negotiate(&options) {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %from, error = %e, "handshake refused");
                self.send_reset(from, source);
                return;
            }
        };
        if self.live_channel_count() >= self.config.max_peers {
            warn!(peer = %from, limit = self.config.max_peers, "peer limit reached, handshake refused");
            self.send_reset(from, source);
            return;
        }
        let id = self.allocate_channel_id();
        let mut ch = Channel::accept(id, source, from, negotiated, now, &self.config);
        ch.on_receive(now);
        self.channels.insert(id, ch);
        self.by_peer.insert(from, id);
        self.greet(id);
        for m in rest {
            self.handle_message(now, id, m);
        }
    }

    /// Responder's HANDSHAKE plus our availability.
    fn greet(&mut self, id: ChannelId) {
        let haves = self.view.have.covering_bins();
        let options = self.options.clone();
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.push(Message::Handshake {
                source_channel: id,
                options,
            });
            for bin in haves {
                ch.push(Message::Have { bin });
            }
        }
    }

    /// Initiator side, right after ESTABLISHED.
    fn announce(&mut self, id: ChannelId) {
        let haves = self.view.have.covering_bins();
        let want_peers = self.live_channel_count() < self.config.max_peers;
        if let Some(ch) = self.channels.get_mut(&id) {
            for bin in haves {
                ch.push(Message::Have { bin });
            }
            if want_peers && ch.supports(MessageType::PexReq) {
                ch.push(Message::PexReq);
            }
        }
    }

    fn on_channel_datagram(
        &mut self,
        now: Instant,
        from: SocketAddr,
        dest: ChannelId,
        bytes: &[u8],
    ) {
        let ctx = self
            .channels
            .get(&dest)
            .filter(|c| c.peer() == from && !c.state().is_terminal())
            .map(|c| *c.wire());
        let Some(ctx) = ctx else {
            let is_reset = wire::decode_datagram(bytes, &WireContext::default())
                .is_ok_and(|d| d.messages.contains(&Message::Reset));
            if !is_reset {
                debug!(peer = %from, channel = %dest, "datagram for unknown channel, resetting");
                self.send_reset(from, ChannelId::ZERO);
            }
            return;
        };
        match wire::decode_datagram(bytes, &ctx) {
            Ok(datagram) => {
                if let Some(ch) = self.channels.get_mut(&dest) {
                    ch.on_receive(now);
                }
                for m in datagram.messages {
                    self.handle_message(now, dest, m);
                }
            }
            Err(e) => {
                warn!(peer = %from, channel = %dest, error = %e, "malformed datagram");
                self.violation(dest, e.to_string());
            }
        }
    }

    fn handle_message(&mut self, now: Instant, id: ChannelId, message: Message) {
        let Some(state) = self.channels.get(&id).map(Channel::state) else {
            return;
        };
        if state.is_terminal() || state == ChannelState::Closing {
            return;
        }
        match message {
            Message::Handshake {
                source_channel,
                options,
            } => self.on_handshake_reply(id, source_channel, options),
            Message::Reset => self.on_reset(now, id),
            _ if state != ChannelState::Established => {
                self.violation(id, format!("{:?} before handshake", message.message_type()));
            }
            Message::Have { bin } | Message::Ack { bin, .. } => self.on_peer_have(id, bin),
            Message::Integrity { bin, hash } => {
                let result = self.tree.offer_hash(bin, hash);
                self.on_integrity_result(id, result);
            }
            Message::SignedIntegrity {
                bin,
                timestamp,
                signature,
            } => self.on_signed_integrity(id, bin, timestamp, signature),
            Message::Data {
                bin,
                timestamp,
                payload,
            } => self.on_data(now, id, bin, timestamp, &payload),
            Message::Request { bin } => self.on_request(id, bin),
            Message::Cancel { bin } => {
                if let Some(ch) = self.channels.get_mut(&id) {
                    ch.cancel_upload(bin);
                }
            }
            Message::Choke => {
                if let Some(ch) = self.channels.get_mut(&id) {
                    let released = ch.on_choke();
                    debug!(channel = %id, released = released.len(), "choked by peer");
                }
            }
            Message::Unchoke => {
                if let Some(ch) = self.channels.get_mut(&id) {
                    ch.on_unchoke();
                }
            }
            Message::PexReq => self.on_pex_request(id),
            Message::PexResV4(addr) => self.on_pex_peer(now, SocketAddr::V4(addr)),
            Message::PexResV6(addr) => self.on_pex_peer(now, SocketAddr::V6(addr)),
            Message::PexResCert(_) => debug!(channel = %id, "certificate PEX ignored"),
        }
    }

    fn on_handshake_reply(&mut self, id: ChannelId, source: ChannelId, options: ProtocolOptions) {
        let Some(ch) = self.channels.get(&id) else {
            return;
        };
        let peer = ch.peer();
        match ch.state() {
            ChannelState::Handshaking => match self.options.negotiate(&options) {
                Ok(negotiated) => {
                    if let Some(ch) = self.channels.get_mut(&id) {
                        ch.establish(source, negotiated);
                    }
                    self.announce(id);
                }
                Err(e) => {
                    self.send_reset(peer, source);
                    self.fail_channel(id, PeerError::Negotiation(e));
                }
            },
            ChannelState::Established if ch.remote_id() == source => {
                debug!(channel = %id, "duplicate handshake reply");
            }
            _ => self.violation(id, "unexpected handshake".into()),
        }
    }

    fn on_reset(&mut self, now: Instant, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        match ch.state() {
            ChannelState::Connecting | ChannelState::Handshaking => {
                ch.fail(PeerError::Negotiation(NegotiationError::Rejected));
            }
            ChannelState::Established => {
                ch.begin_close(PeerError::PeerDisconnected("reset by peer"));
                // No RESET in answer to a RESET.
                ch.take_outbox(now);
                ch.finish_close();
            }
            _ => {}
        }
    }

    fn on_peer_have(&mut self, id: ChannelId, bin: Bin) {
        let floor = self.view.floor;
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.on_have(bin);
            if floor > 0 {
                ch.discard_below(floor);
            }
        }
    }

    fn on_signed_integrity(&mut self, id: ChannelId, bin: Bin, timestamp: u64, signature: Vec<u8>) {
        let hash = self
            .tree
            .candidate(bin)
            .or_else(|| self.tree.node(bin).map(|n| n.hash.as_slice()))
            .map(<[u8]>::to_vec);
        let Some(hash) = hash else {
            debug!(channel = %id, bin = %bin, "signature without a munro hash dropped");
            return;
        };
        let result = self.tree.submit_signed_hash(bin, hash, timestamp, signature);
        self.on_integrity_result(id, result);
    }

    fn on_integrity_result(&mut self, id: ChannelId, result: Result<Resolved, IntegrityError>) {
        match result {
            Ok(resolved) => self.apply_resolved(id, resolved, None),
            Err(
                e @ (IntegrityError::Conflict(_)
                | IntegrityError::Mismatch(_)
                | IntegrityError::BadSignature(_)),
            ) => self.penalize(id, e),
            Err(
                e @ (IntegrityError::HashLength { .. }
                | IntegrityError::NotMunro(_)
                | IntegrityError::OutOfRange(_)),
            ) => self.violation(id, e.to_string()),
            Err(e) => debug!(channel = %id, error = %e, "hash not applied"),
        }
    }

    fn on_data(&mut self, now: Instant, id: ChannelId, bin: Bin, timestamp: u64, payload: &[u8]) {
        let Some(chunk_size) = self
            .channels
            .get(&id)
            .and_then(Channel::negotiated)
            .map(|n| n.chunk_size)
        else {
            return;
        };
        let Some(parts) = chunk::split_payload(bin, payload, chunk_size) else {
            self.violation(id, format!("data for {bin} does not fit chunk size {chunk_size}"));
            return;
        };
        // Sender and receiver clocks differ by a constant; LEDBAT only uses
        // the difference to the smallest sample seen.
        let delay = (self.now_us(now) as i64).wrapping_sub(timestamp as i64);
        for (leaf, data) in parts {
            let Some(ch) = self.channels.get_mut(&id) else {
                return;
            };
            // Late answers to requests we gave up on are still welcome.
            let requested = ch.on_delivered(leaf, delay) || ch.gave_up().contains(&leaf);
            let index = leaf.base_offset();
            if index < self.view.floor || self.view.is_verified(index) {
                debug!(channel = %id, bin = %leaf, "chunk already held");
                continue;
            }
            if !requested {
                self.violation(id, format!("unrequested data for {leaf}"));
                if !self.channels.get(&id).is_some_and(Channel::is_established) {
                    return;
                }
                if self.pending.contains_key(&leaf) {
                    continue;
                }
            }
            match self.tree.submit_chunk_data(leaf, data.to_vec()) {
                Ok(resolved) => self.apply_resolved(id, resolved, Some((leaf, delay))),
                Err(IntegrityError::Unresolved(_)) if requested => {
                    debug!(channel = %id, bin = %leaf, "chunk waits for its hashes");
                    self.pending.insert(
                        leaf,
                        PendingChunk {
                            channel: id,
                            since: now,
                        },
                    );
                }
                // Unasked-for and unprovable: not worth a buffer slot.
                Err(IntegrityError::Unresolved(_)) => {
                    self.tree.drop_pending(leaf);
                }
                Err(e @ IntegrityError::PendingFull(_)) => {
                    warn!(channel = %id, error = %e, "incoming chunk dropped");
                }
                Err(
                    e @ (IntegrityError::Mismatch(_)
                    | IntegrityError::Conflict(_)
                    | IntegrityError::BadSignature(_)),
                ) => self.penalize(id, e),
                Err(e) => self.violation(id, e.to_string()),
            }
        }
    }

    /// Store verified chunks, ACK the one `id` just delivered, tell everyone
    /// else. Buffered chunks that failed are charged to whoever sent them.
    fn apply_resolved(&mut self, id: ChannelId, resolved: Resolved, ack: Option<(Bin, i64)>) {
        for c in &resolved.verified {
            self.pending.remove(&c.bin);
        }
        for bin in resolved.rejected {
            let sender = self.pending.remove(&bin).map_or(id, |p| p.channel);
            self.penalize(sender, IntegrityError::Mismatch(bin));
        }
        let stored: Vec<u64> = resolved
            .verified
            .iter()
            .filter(|c| self.store_verified(c))
            .map(ChunkBuffer::index)
            .collect();
        if stored.is_empty() {
            return;
        }
        let acked = ack.filter(|(bin, _)| stored.contains(&bin.base_offset()));
        if let Some((bin, delay_sample)) = acked {
            if let Some(ch) = self.channels.get_mut(&id) {
                ch.push(Message::Ack { bin, delay_sample });
            }
        }
        let to_all = chunks_to_covering_bins(stored.iter().copied());
        let to_sender = chunks_to_covering_bins(
            stored
                .iter()
                .copied()
                .filter(|i| acked.map(|(b, _)| b.base_offset()) != Some(*i)),
        );
        for ch in self.channels.values_mut().filter(|c| c.is_established()) {
            let bins = if ch.local_id() == id { &to_sender } else { &to_all };
            for &bin in bins {
                ch.push(Message::Have { bin });
            }
        }
        self.apply_discard_window();
        if !self.completed && self.view.is_complete() {
            self.completed = true;
            info!(swarm = %self.swarm_id, chunks = self.view.verified_count(), "content complete");
            self.actions.push(OutboundAction::Complete);
        }
    }

    fn store_verified(&mut self, chunk: &ChunkBuffer) -> bool {
        let index = chunk.index();
        if self.view.is_verified(index) {
            return false;
        }
        if let Err(e) = self.storage.write_chunk(chunk.bin, &chunk.data) {
            warn!(bin = %chunk.bin, error = %e, "verified chunk not stored");
            return false;
        }
        self.view.record(index);
        for ch in self.channels.values_mut() {
            ch.release(chunk.bin, true);
            ch.forget_bin(chunk.bin);
        }
        self.actions.push(OutboundAction::ChunkVerified(chunk.bin));
        true
    }

    /// Failed hash check attributed to the peer behind `id`. Past the
    /// threshold the peer is choked and no longer asked for data.
    fn penalize(&mut self, id: ChannelId, err: IntegrityError) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        let peer = ch.peer();
        warn!(channel = %id, peer = %peer, error = %err, "integrity failure");
        self.trust.record_failure(peer);
        if self
            .trust
            .is_isolated(&peer, self.config.max_integrity_failures)
            && ch.set_choking(true)
        {
            warn!(peer = %peer, failures = self.trust.failure_count(&peer), "peer isolated");
        }
    }

    fn violation(&mut self, id: ChannelId, what: String) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        debug!(channel = %id, violation = %what, "protocol violation");
        if ch.record_violation(self.config.max_violations) {
            self.close_channel(id, PeerError::ProtocolViolation(what));
        }
    }

    fn on_request(&mut self, id: ChannelId, bin: Bin) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        if ch.is_choking_peer() {
            debug!(channel = %id, bin = %bin, "request from choked peer ignored");
            return;
        }
        let (first, last) = bin.range();
        let end = last.saturating_add(1);
        let limit = self.config.upload_queue_limit;
        for (s, e) in self.view.have.ranges() {
            for index in s.max(first)..e.min(end) {
                if let Err(err) = ch.queue_upload(Bin::chunk(index), limit) {
                    warn!(channel = %id, bin = %bin, error = %err, "request dropped");
                    return;
                }
            }
        }
    }

    fn on_pex_request(&mut self, id: ChannelId) {
        let peers: Vec<SocketAddr> = self
            .channels
            .values()
            .filter(|c| c.is_established() && c.local_id() != id)
            .map(Channel::peer)
            .take(MAX_PEX_PEERS)
            .collect();
        if let Some(ch) = self.channels.get_mut(&id) {
            for peer in peers {
                ch.push(match peer {
                    SocketAddr::V4(a) => Message::PexResV4(a),
                    SocketAddr::V6(a) => Message::PexResV6(a),
                });
            }
        }
    }

    fn on_pex_peer(&mut self, now: Instant, peer: SocketAddr) {
        if self.by_peer.contains_key(&peer) {
            return;
        }
        debug!(peer = %peer, "peer learned through PEX");
        self.actions.push(OutboundAction::PeerDiscovered(peer));
        if self.live_channel_count() < self.config.max_peers {
            self.open_channel(now, peer);
        }
    }

    fn set_choking(&mut self, peer: SocketAddr, choking: bool) {
        if let Some(ch) = self
            .by_peer
            .get(&peer)
            .and_then(|id| self.channels.get_mut(id))
        {
            if ch.is_established() && ch.set_choking(choking) {
                info!(peer = %peer, choking, "choke state changed");
            }
        }
    }

    fn tick_channel(&mut self, now: Instant, id: ChannelId) {
        let Some(ch) = self.channels.get_mut(&id) else {
            return;
        };
        match ch.state() {
            ChannelState::Handshaking if ch.handshake_due(now, self.config.handshake_timeout()) => {
                if ch.handshake_attempts() > self.config.handshake_retries {
                    ch.fail(PeerError::PeerDisconnected("handshake timeout"));
                } else {
                    debug!(channel = %id, attempt = ch.handshake_attempts() + 1, "handshake retransmit");
                    ch.push(Message::Handshake {
                        source_channel: id,
                        options: self.options.clone(),
                    });
                    ch.handshake_sent(now);
                }
            }
            ChannelState::Established => {
                if ch.is_idle(now, self.config.idle_timeout()) {
                    ch.begin_close(PeerError::PeerDisconnected("idle timeout"));
                    return;
                }
                let expired =
                    ch.expire_requests(now, self.config.request_timeout(), self.config.max_retries);
                if !expired.dropped.is_empty() {
                    debug!(channel = %id, dropped = expired.dropped.len(), "requests back in the pool");
                }
            }
            _ => {}
        }
    }

    /// Chunk range worth requesting now. `None` for a live source, or a live
    /// receiver that has heard of no chunks yet.
    fn request_bounds(&self) -> Option<Range<u64>> {
        if self.source.is_some() {
            return None;
        }
        let floor = self.view.floor;
        if let Some(n) = self.view.chunk_count {
            return (floor < n).then_some(floor..n);
        }
        let hi = self
            .channels
            .values()
            .filter(|c| c.is_established())
            .filter_map(|c| c.peer_have().highest())
            .max()?
            + 1;
        let lo = match self.config.live_discard_window {
            Some(w) => floor.max(hi.saturating_sub(w)),
            None => floor,
        };
        (lo < hi).then_some(lo..hi)
    }

    fn schedule(&mut self, now: Instant) {
        let Some(bounds) = self.request_bounds() else {
            return;
        };
        let mut local = self.view.have.clone();
        for bin in self.pending.keys() {
            local.insert_bin(*bin);
        }
        let max_failures = self.config.max_integrity_failures;
        let decisions = {
            let mut slots: Vec<PeerSlot<'_>> = self
                .channels
                .values()
                .filter(|c| {
                    c.is_established()
                        && !c.is_choked_by_peer()
                        && !self.trust.is_isolated(&c.peer(), max_failures)
                })
                .map(PeerSlot::from_channel)
                .collect();
            slots.sort_by_key(|s| s.channel);
            self.scheduler.plan(&local, bounds, &slots)
        };
        for d in decisions {
            if let Some(ch) = self.channels.get_mut(&d.channel) {
                if ch.request(d.bin, now) {
                    debug!(channel = %d.channel, bin = %d.bin, endgame = d.endgame, "request");
                }
            }
        }
    }

    /// Answer queued REQUESTs: proof hashes first, then the DATA.
    fn serve_uploads(&mut self, now: Instant) {
        let now_us = self.now_us(now);
        let per_tick = self.config.uploads_per_tick;
        for ch in self.channels.values_mut() {
            if !ch.is_established() || ch.is_choking_peer() {
                continue;
            }
            for _ in 0..per_tick {
                let Some(bin) = ch.next_upload() else {
                    break;
                };
                let payload = match self.storage.read_chunk(bin) {
                    Ok(Some(d)) => d,
                    Ok(None) => {
                        debug!(channel = %ch.local_id(), bin = %bin, "requested chunk not stored");
                        continue;
                    }
                    Err(e) => {
                        warn!(bin = %bin, error = %e, "chunk read failed");
                        continue;
                    }
                };
                let proof = match self.tree.proof_for(bin, ch.peer_have(), ch.hashes_sent()) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(bin = %bin, error = %e, "no proof for chunk");
                        continue;
                    }
                };
                if let Some(m) = proof.munro {
                    ch.push(Message::Integrity {
                        bin: m.bin,
                        hash: m.hash,
                    });
                    ch.push(Message::SignedIntegrity {
                        bin: m.bin,
                        timestamp: m.timestamp,
                        signature: m.signature,
                    });
                    ch.mark_hash_sent(m.bin);
                }
                for (uncle, hash) in proof.uncles {
                    ch.push(Message::Integrity { bin: uncle, hash });
                    ch.mark_hash_sent(uncle);
                }
                ch.push(Message::Data {
                    bin,
                    timestamp: now_us,
                    payload,
                });
            }
        }
    }

    fn apply_discard_window(&mut self) {
        let Some(window) = self.config.live_discard_window else {
            return;
        };
        if self.view.chunk_count.is_some() {
            return;
        }
        let Some(latest) = self.view.latest() else {
            return;
        };
        let floor = (latest + 1).saturating_sub(window);
        if floor <= self.view.floor {
            return;
        }
        let dropped = self.view.discard_below(floor);
        for ch in self.channels.values_mut() {
            ch.discard_below(floor);
            let stale: Vec<Bin> = ch
                .outstanding()
                .keys()
                .filter(|b| b.base_offset() < floor)
                .copied()
                .collect();
            for bin in stale {
                ch.release(bin, true);
            }
        }
        debug!(floor, dropped, "live discard window advanced");
    }

    /// Encode every channel's queued messages; keepalives for quiet channels.
    fn flush(&mut self, now: Instant) {
        let keepalive = self.config.keepalive_interval();
        let max_len = self.config.max_datagram_size;
        for ch in self.channels.values_mut() {
            if ch.state().is_terminal() {
                continue;
            }
            let to = ch.peer();
            let remote = ch.remote_id();
            if !ch.has_outbox() {
                if ch.keepalive_due(now, keepalive) {
                    match wire::encode_datagram(&Datagram::keepalive(remote), ch.wire()) {
                        Ok(bytes) => self.actions.push(OutboundAction::Send { to, bytes }),
                        Err(e) => warn!(peer = %to, error = %e, "keepalive not encodable"),
                    }
                    ch.keepalive_sent(now);
                }
                continue;
            }
            let messages = ch.take_outbox(now);
            match wire::encode_packed(remote, &messages, ch.wire(), max_len) {
                Ok(datagrams) => self.actions.extend(
                    datagrams
                        .into_iter()
                        .map(|bytes| OutboundAction::Send { to, bytes }),
                ),
                Err(e) => {
                    warn!(channel = %ch.local_id(), error = %e, "messages not encodable, dropped")
                }
            }
            if ch.state() == ChannelState::Closing {
                ch.finish_close();
            }
        }
    }

    fn close_channel(&mut self, id: ChannelId, reason: PeerError) {
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.begin_close(reason);
        }
    }

    fn fail_channel(&mut self, id: ChannelId, reason: PeerError) {
        if let Some(ch) = self.channels.get_mut(&id) {
            ch.fail(reason);
        }
    }

    /// Forget buffered chunks matching `stale`; they become missing again.
    fn drop_pending_where(&mut self, stale: impl Fn(&PendingChunk) -> bool) {
        let bins: Vec<Bin> = self
            .pending
            .iter()
            .filter(|(_, p)| stale(p))
            .map(|(bin, _)| *bin)
            .collect();
        for bin in bins {
            self.pending.remove(&bin);
            self.tree.drop_pending(bin);
            debug!(bin = %bin, "buffered chunk dropped, hashes never arrived");
        }
    }

    /// Drop CLOSED and FAILED channels and report them.
    fn reap(&mut self) {
        let done: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, c)| c.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            let Some(ch) = self.channels.remove(&id) else {
                continue;
            };
            if self.by_peer.get(&ch.peer()) == Some(&id) {
                self.by_peer.remove(&ch.peer());
            }
            self.drop_pending_where(|p| p.channel == id);
            let reason = ch
                .close_reason()
                .cloned()
                .unwrap_or(PeerError::PeerDisconnected("closed"));
            self.actions.push(OutboundAction::ChannelClosed {
                peer: ch.peer(),
                state: ch.state(),
                reason,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::io;
    use std::time::Duration;

    use super::*;
    use crate::host::{dispatch, MemoryStorage, StaticDiscovery, Transport};
    use crate::protocol::{Addressing, HashFunction};

    fn addr(i: usize) -> SocketAddr {
        format!("10.0.0.{}:6778", i + 1).parse().unwrap()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn encode(d: &Datagram) -> Vec<u8> {
        wire::encode_datagram(d, &WireContext::default()).unwrap()
    }

    fn decode(bytes: &[u8]) -> Datagram {
        wire::decode_datagram(bytes, &WireContext::default()).unwrap()
    }

    fn data_bins(bytes: &[u8]) -> Vec<Bin> {
        decode(bytes)
            .messages
            .into_iter()
            .filter_map(|m| match m {
                Message::Data { bin, .. } => Some(bin),
                _ => None,
            })
            .collect()
    }

    fn sends(actions: &[OutboundAction]) -> Vec<(SocketAddr, Vec<u8>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send { to, bytes } => Some((*to, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    fn seed(data: &[u8], now: Instant) -> Swarm<MemoryStorage> {
        Swarm::from_content(data, MemoryStorage::new(), Config::default(), now).unwrap()
    }

    fn leech(id: &SwarmId, chunks: u64, config: Config, now: Instant) -> Swarm<MemoryStorage> {
        Swarm::for_content(id.clone(), chunks, MemoryStorage::new(), config, now).unwrap()
    }

    fn requests(actions: &[OutboundAction]) -> Vec<Bin> {
        sends(actions)
            .iter()
            .flat_map(|(_, bytes)| decode(bytes).messages)
            .filter_map(|m| match m {
                Message::Request { bin } => Some(bin),
                _ => None,
            })
            .collect()
    }

    fn tree_of(data: &[u8]) -> MerkleTree {
        MerkleTree::from_chunks(
            HashFunction::Sha256,
            &chunk::split_into_chunks(data, 1024),
            16,
        )
        .unwrap()
    }

    fn proof_messages(tree: &MerkleTree, leaf: Bin) -> Vec<Message> {
        tree.proof_for(leaf, &Binmap::new(), &HashSet::new())
            .unwrap()
            .uncles
            .into_iter()
            .map(|(bin, hash)| Message::Integrity { bin, hash })
            .collect()
    }

    fn data_message(data: &[u8], index: u64) -> Message {
        let at = index as usize * 1024;
        Message::Data {
            bin: Bin::chunk(index),
            timestamp: 0,
            payload: data[at..at + 1024].to_vec(),
        }
    }

    /// Handshake `b` with a peer played by the test, which claims `have`.
    /// Returns the channel to address `b` on and the bins `b` asked it for.
    fn hand_peer(
        b: &mut Swarm<MemoryStorage>,
        peer: SocketAddr,
        id: &SwarmId,
        have: Bin,
        now: Instant,
    ) -> (ChannelId, Vec<Bin>) {
        let hello = decode(&sends(&b.connect(now, peer).unwrap())[0].1);
        let Message::Handshake {
            source_channel: ours,
            ..
        } = hello.messages[0].clone()
        else {
            panic!("expected a handshake");
        };
        let options = ProtocolOptions {
            version: Some(PROTOCOL_VERSION),
            swarm_id: Some(id.clone()),
            integrity: Some(IntegrityMethod::MerkleHashTree),
            hash_function: Some(HashFunction::Sha256),
            addressing: Some(Addressing::Bins32),
            chunk_size: Some(1024),
            ..ProtocolOptions::default()
        };
        let reply = Datagram::new(
            ours,
            vec![
                Message::Handshake {
                    source_channel: ChannelId(66),
                    options,
                },
                Message::Have { bin: have },
            ],
        );
        let actions = b.on_datagram(now, peer, &encode(&reply));
        assert!(b.channel_for(peer).unwrap().is_established());
        (ours, requests(&actions))
    }

    struct Node {
        addr: SocketAddr,
        swarm: Swarm<MemoryStorage>,
        events: Vec<OutboundAction>,
    }

    type DropRule = Box<dyn Fn(SocketAddr, &[u8]) -> bool>;

    /// Lossless in-order datagram shuttle between swarms, on a synthetic clock.
    struct Net {
        now: Instant,
        nodes: Vec<Node>,
        queue: VecDeque<(SocketAddr, SocketAddr, Vec<u8>)>,
        /// Everything sent, including what `drop_rule` discarded.
        sent: Vec<(SocketAddr, SocketAddr, Vec<u8>)>,
        drop_rule: Option<DropRule>,
    }

    impl Net {
        fn new(now: Instant) -> Self {
            Self {
                now,
                nodes: Vec::new(),
                queue: VecDeque::new(),
                sent: Vec::new(),
                drop_rule: None,
            }
        }

        fn add(&mut self, swarm: Swarm<MemoryStorage>) -> usize {
            let i = self.nodes.len();
            self.nodes.push(Node {
                addr: addr(i),
                swarm,
                events: Vec::new(),
            });
            i
        }

        fn swarm(&self, i: usize) -> &Swarm<MemoryStorage> {
            &self.nodes[i].swarm
        }

        fn events(&self, i: usize) -> &[OutboundAction] {
            &self.nodes[i].events
        }

        fn verified(&self, i: usize) -> Vec<Bin> {
            let mut bins: Vec<Bin> = self
                .events(i)
                .iter()
                .filter_map(|e| match e {
                    OutboundAction::ChunkVerified(b) => Some(*b),
                    _ => None,
                })
                .collect();
            bins.sort();
            bins
        }

        fn closed(&self, i: usize) -> Vec<(ChannelState, PeerError)> {
            self.events(i)
                .iter()
                .filter_map(|e| match e {
                    OutboundAction::ChannelClosed { state, reason, .. } => {
                        Some((*state, reason.clone()))
                    }
                    _ => None,
                })
                .collect()
        }

        fn absorb(&mut self, i: usize, actions: Vec<OutboundAction>) {
            let from = self.nodes[i].addr;
            for action in actions {
                match action {
                    OutboundAction::Send { to, bytes } => {
                        self.sent.push((from, to, bytes.clone()));
                        if self.drop_rule.as_ref().is_some_and(|d| d(from, &bytes)) {
                            continue;
                        }
                        self.queue.push_back((from, to, bytes));
                    }
                    other => self.nodes[i].events.push(other),
                }
            }
        }

        fn step(&mut self) -> bool {
            let Some((from, to, bytes)) = self.queue.pop_front() else {
                return false;
            };
            if let Some(i) = self.nodes.iter().position(|n| n.addr == to) {
                let now = self.now;
                let actions = self.nodes[i].swarm.on_datagram(now, from, &bytes);
                self.absorb(i, actions);
            }
            true
        }

        fn pump(&mut self) {
            let mut steps = 0;
            while self.step() {
                steps += 1;
                assert!(steps < 100_000, "network never settled");
            }
        }

        fn connect(&mut self, from: usize, to: usize) {
            let now = self.now;
            let peer = self.nodes[to].addr;
            let actions = self.nodes[from].swarm.connect(now, peer).unwrap();
            self.absorb(from, actions);
        }

        fn advance(&mut self, dt: Duration) {
            self.now += dt;
            for i in 0..self.nodes.len() {
                let now = self.now;
                let actions = self.nodes[i].swarm.tick(now);
                self.absorb(i, actions);
            }
            self.pump();
        }
    }

    #[test]
    fn eight_chunk_transfer_completes() {
        let t0 = Instant::now();
        let data = content(8 * 1024);
        let mut net = Net::new(t0);
        let a = net.add(seed(&data, t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 8, Config::default(), t0));
        net.connect(b, a);
        net.pump();
        for _ in 0..10 {
            if net.swarm(b).view().is_complete() {
                break;
            }
            net.advance(Duration::from_millis(500));
        }

        let leech = net.swarm(b);
        assert!(leech.view().is_complete());
        assert_eq!(leech.storage().writes(), 8);
        assert_eq!(leech.storage().contiguous(), data);
        assert_eq!(net.verified(b), (0..8).map(Bin::chunk).collect::<Vec<_>>());
        let completions = net
            .events(b)
            .iter()
            .filter(|e| **e == OutboundAction::Complete)
            .count();
        assert_eq!(completions, 1);
        assert!(!net.events(a).contains(&OutboundAction::Complete));

        // The first DATA travels behind the hashes that prove it.
        let (_, _, first) = net
            .sent
            .iter()
            .find(|(from, _, bytes)| *from == addr(a) && !data_bins(bytes).is_empty())
            .unwrap();
        let messages = decode(first).messages;
        assert!(matches!(messages.first(), Some(Message::Integrity { .. })));
        assert!(matches!(messages.last(), Some(Message::Data { .. })));
    }

    #[test]
    fn unanswered_chunk_moves_to_other_peer() {
        let t0 = Instant::now();
        let data = content(8 * 1024);
        let cfg = Config {
            endgame_after_retries: 100,
            ..Config::default()
        };
        let mut net = Net::new(t0);
        let a = net.add(seed(&data, t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 8, cfg.clone(), t0));
        let c = net.add(seed(&data, t0));
        let slow = addr(a);
        net.drop_rule = Some(Box::new(move |from, bytes| {
            from == slow && data_bins(bytes).contains(&Bin::chunk(5))
        }));

        net.connect(b, a);
        net.pump();
        assert_eq!(net.swarm(b).view().verified_count(), 7);
        assert!(net
            .swarm(b)
            .channel_for(addr(a))
            .unwrap()
            .outstanding()
            .contains_key(&Bin::chunk(5)));

        let chunk5_from = |net: &Net, peer: usize| {
            net.sent
                .iter()
                .filter(|(f, _, bytes)| *f == addr(peer) && data_bins(bytes).contains(&Bin::chunk(5)))
                .count()
        };
        net.connect(b, c);
        net.pump();
        assert_eq!(chunk5_from(&net, c), 0);

        for _ in 0..10 {
            if net.swarm(b).view().is_complete() {
                break;
            }
            net.advance(cfg.request_timeout());
        }
        assert!(net.swarm(b).view().is_complete());
        assert_eq!(chunk5_from(&net, c), 1);
        assert_eq!(chunk5_from(&net, a), 1 + cfg.max_retries as usize);
    }

    #[test]
    fn swarm_mismatch_in_reply_fails_channel() {
        let t0 = Instant::now();
        let mut a = seed(&content(4096), t0);
        let peer = addr(5);
        let actions = a.connect(t0, peer).unwrap();
        let hello = match &actions[..] {
            [OutboundAction::Send { to, bytes }] if *to == peer => decode(bytes),
            other => panic!("unexpected actions {other:?}"),
        };
        assert_eq!(hello.channel, ChannelId::ZERO);
        let Message::Handshake { source_channel, .. } = hello.messages[0].clone() else {
            panic!("expected a handshake");
        };

        let reply = Datagram::new(
            source_channel,
            vec![Message::Handshake {
                source_channel: ChannelId(77),
                options: ProtocolOptions {
                    swarm_id: Some(SwarmId(vec![9; 32])),
                    ..ProtocolOptions::default()
                },
            }],
        );
        let actions = a.on_datagram(t0, peer, &encode(&reply));
        assert!(actions.contains(&OutboundAction::ChannelClosed {
            peer,
            state: ChannelState::Failed,
            reason: PeerError::Negotiation(NegotiationError::SwarmMismatch),
        }));
        let reset = sends(&actions)
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .next()
            .unwrap();
        assert_eq!(reset, Datagram::new(ChannelId(77), vec![Message::Reset]));
        assert_eq!(a.channels().count(), 0);
    }

    #[test]
    fn responder_refuses_foreign_swarm() {
        let t0 = Instant::now();
        let mut net = Net::new(t0);
        let a = net.add(seed(&content(4096), t0));
        let other = seed(&content(5000), t0);
        let b = net.add(leech(other.swarm_id(), 5, Config::default(), t0));
        net.connect(b, a);
        net.pump();
        assert_eq!(
            net.closed(b),
            vec![(
                ChannelState::Failed,
                PeerError::Negotiation(NegotiationError::Rejected)
            )]
        );
        assert_eq!(net.swarm(a).channels().count(), 0);
    }

    #[test]
    fn unknown_channel_gets_stateless_reset() {
        let t0 = Instant::now();
        let mut a = seed(&content(1024), t0);
        let stray = Datagram::new(ChannelId(1234), vec![Message::Have { bin: Bin::chunk(0) }]);
        let actions = a.on_datagram(t0, addr(3), &encode(&stray));
        let out = sends(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, addr(3));
        assert_eq!(
            decode(&out[0].1),
            Datagram::new(ChannelId::ZERO, vec![Message::Reset])
        );

        let reset = Datagram::new(ChannelId(1234), vec![Message::Reset]);
        assert!(a.on_datagram(t0, addr(3), &encode(&reset)).is_empty());
    }

    #[test]
    fn malformed_datagrams_close_channel() {
        let t0 = Instant::now();
        let data = content(2048);
        let cfg = Config {
            max_violations: 2,
            ..Config::default()
        };
        let mut net = Net::new(t0);
        let seed = Swarm::from_content(&data, MemoryStorage::new(), cfg, t0).unwrap();
        let a = net.add(seed);
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 2, Config::default(), t0));
        net.connect(b, a);
        net.pump();

        let channel = net.swarm(a).channel_for(addr(b)).unwrap().local_id();
        let mut garbage = channel.0.to_be_bytes().to_vec();
        garbage.push(0xEE);
        let now = net.now;
        assert!(net.nodes[a].swarm.on_datagram(now, addr(b), &garbage).is_empty());
        let actions = net.nodes[a].swarm.on_datagram(now, addr(b), &garbage);
        assert!(actions.iter().any(|e| matches!(
            e,
            OutboundAction::ChannelClosed {
                state: ChannelState::Closed,
                reason: PeerError::ProtocolViolation(_),
                ..
            }
        )));
        assert!(net.swarm(a).channel_for(addr(b)).is_none());
    }

    #[test]
    fn silent_peer_handshake_times_out() {
        let t0 = Instant::now();
        let cfg = Config::default();
        let mut a = seed(&content(1024), t0);
        let peer = addr(7);
        assert_eq!(sends(&a.connect(t0, peer).unwrap()).len(), 1);
        for i in 1..=cfg.handshake_retries {
            let actions = a.tick(t0 + cfg.handshake_timeout() * i);
            assert_eq!(sends(&actions).len(), 1, "retransmit {i}");
        }
        let actions = a.tick(t0 + cfg.handshake_timeout() * (cfg.handshake_retries + 1));
        assert_eq!(
            actions,
            vec![OutboundAction::ChannelClosed {
                peer,
                state: ChannelState::Failed,
                reason: PeerError::PeerDisconnected("handshake timeout"),
            }]
        );
    }

    #[test]
    fn quiet_channel_gets_keepalive_then_closes() {
        let t0 = Instant::now();
        let cfg = Config::default();
        let mut net = Net::new(t0);
        let a = net.add(seed(&content(1024), t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 1, Config::default(), t0));
        net.connect(b, a);
        net.pump();
        assert!(net.swarm(b).view().is_complete());

        let actions = net.nodes[a].swarm.tick(t0 + cfg.keepalive_interval());
        let lens: Vec<usize> = sends(&actions).iter().map(|(_, b)| b.len()).collect();
        assert_eq!(lens, vec![4]);

        let actions = net.nodes[a].swarm.tick(t0 + cfg.idle_timeout());
        assert!(actions.contains(&OutboundAction::ChannelClosed {
            peer: addr(b),
            state: ChannelState::Closed,
            reason: PeerError::PeerDisconnected("idle timeout"),
        }));
    }

    #[test]
    fn live_stream_verifies_and_discards_old_chunks() {
        let t0 = Instant::now();
        let cfg = Config {
            integrity: IntegrityMethod::UnifiedMerkleTree,
            munro_layer: 2,
            ..Config::default()
        };
        let key = SourceKeypair::from_secret_bytes(&[7; 32]);
        let id = key.swarm_id();
        let mut net = Net::new(t0);
        let src = net.add(Swarm::live_source(key, MemoryStorage::new(), cfg.clone(), t0).unwrap());
        let rx_cfg = Config {
            live_discard_window: Some(4),
            ..cfg
        };
        let rx = net.add(Swarm::live_receiver(id, MemoryStorage::new(), rx_cfg, t0).unwrap());

        let inject = |net: &mut Net, i: u8| {
            let now = net.now;
            let actions = net.nodes[src]
                .swarm
                .inject_live_chunk(now, &[i; 1024])
                .unwrap();
            net.absorb(src, actions);
            net.pump();
        };
        for i in 0..3 {
            inject(&mut net, i);
        }
        net.connect(rx, src);
        net.pump();
        assert_eq!(net.swarm(rx).view().verified_count(), 0);

        for i in 3..8 {
            inject(&mut net, i);
        }
        let receiver = net.swarm(rx);
        assert_eq!(net.verified(rx), (0..8).map(Bin::chunk).collect::<Vec<_>>());
        assert_eq!(receiver.storage().writes(), 8);
        assert!(receiver.tree().signature(Bin::from_layer(2, 1).unwrap()).is_some());
        assert_eq!(receiver.view().floor(), 4);
        assert_eq!(receiver.view().verified_count(), 4);
    }

    #[test]
    fn pex_introduces_other_peers() {
        let t0 = Instant::now();
        let data = content(4096);
        let mut net = Net::new(t0);
        let a = net.add(seed(&data, t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 4, Config::default(), t0));
        let c = net.add(leech(&id, 4, Config::default(), t0));
        let d = net.add(leech(&id, 4, Config::default(), t0));
        for n in [b, c, d] {
            net.connect(n, a);
            net.pump();
        }
        let found: Vec<SocketAddr> = net
            .events(d)
            .iter()
            .filter_map(|e| match e {
                OutboundAction::PeerDiscovered(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert!(found.contains(&addr(b)));
        assert!(found.contains(&addr(c)));
        assert!(net
            .swarm(d)
            .channel_for(addr(b))
            .is_some_and(Channel::is_established));
    }

    #[test]
    fn choked_peer_waits_for_unchoke() {
        let t0 = Instant::now();
        let data = content(4096);
        let mut net = Net::new(t0);
        let a = net.add(seed(&data, t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 4, Config::default(), t0));
        net.connect(b, a);
        assert!(net.step());
        let now = net.now;
        let actions = net.nodes[a].swarm.choke(now, addr(b));
        net.absorb(a, actions);
        net.pump();

        assert!(net.swarm(b).channel_for(addr(a)).unwrap().is_choked_by_peer());
        assert_eq!(net.swarm(b).view().verified_count(), 0);
        assert!(!net
            .sent
            .iter()
            .any(|(f, _, bytes)| *f == addr(a) && !data_bins(bytes).is_empty()));

        let actions = net.nodes[a].swarm.unchoke(now, addr(b));
        net.absorb(a, actions);
        net.pump();
        assert!(net.swarm(b).view().is_complete());
    }

    #[test]
    fn simultaneous_open_settles_on_one_channel() {
        let t0 = Instant::now();
        let data = content(4096);
        let mut net = Net::new(t0);
        let a = net.add(seed(&data, t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 4, Config::default(), t0));
        net.connect(a, b);
        net.connect(b, a);
        net.pump();

        assert_eq!(net.swarm(a).channels().count(), 1);
        assert_eq!(net.swarm(b).channels().count(), 1);
        let ab = net.swarm(a).channel_for(addr(b)).unwrap();
        let ba = net.swarm(b).channel_for(addr(a)).unwrap();
        assert!(ab.is_established() && ba.is_established());
        assert_eq!(ab.remote_id(), ba.local_id());
        assert_eq!(ba.remote_id(), ab.local_id());
        assert!(net.swarm(b).view().is_complete());
    }

    #[test]
    fn integrity_failures_isolate_peer() {
        let t0 = Instant::now();
        let data = content(8 * 1024);
        let honest = tree_of(&data);
        let id = SwarmId(honest.root_hash().unwrap().to_vec());
        let mut b = leech(&id, 8, Config::default(), t0);
        let evil = addr(9);
        let (ours, _) = hand_peer(&mut b, evil, &id, Bin::new(7), t0);

        let uncle = |n: u64| honest.node(Bin::new(n)).unwrap().hash.clone();
        let forged = Datagram::new(
            ours,
            vec![
                Message::Integrity { bin: Bin::new(11), hash: uncle(11) },
                Message::Integrity { bin: Bin::new(5), hash: uncle(5) },
                Message::Integrity { bin: Bin::new(2), hash: uncle(2) },
                Message::Data {
                    bin: Bin::chunk(0),
                    timestamp: 0,
                    payload: vec![0xAA; 1024],
                },
            ],
        );
        let mut last = Vec::new();
        for _ in 0..3 {
            last = b.on_datagram(t0, evil, &encode(&forged));
        }
        assert_eq!(b.trust().failure_count(&evil), 3);
        assert!(b.channel_for(evil).unwrap().is_choking_peer());
        assert_eq!(b.view().verified_count(), 0);
        assert!(sends(&last)
            .iter()
            .any(|(_, bytes)| decode(bytes).messages.contains(&Message::Choke)));
    }

    #[test]
    fn proof_and_data_in_separate_datagrams() {
        let t0 = Instant::now();
        let data = content(8 * 1024);
        // Too small for a DATA and more than one hash together.
        let cfg = Config {
            max_datagram_size: 1024 + 64,
            ..Config::default()
        };
        let mut net = Net::new(t0);
        let seed = Swarm::from_content(&data, MemoryStorage::new(), cfg, t0).unwrap();
        let a = net.add(seed);
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 8, Config::default(), t0));
        net.connect(b, a);
        net.pump();
        for _ in 0..10 {
            if net.swarm(b).view().is_complete() {
                break;
            }
            net.advance(Duration::from_millis(500));
        }
        assert!(net.swarm(b).view().is_complete());
        assert_eq!(net.swarm(b).storage().contiguous(), data);
        let hashes_alone = net
            .sent
            .iter()
            .filter(|(from, _, bytes)| {
                *from == addr(a)
                    && data_bins(bytes).is_empty()
                    && decode(bytes)
                        .messages
                        .iter()
                        .any(|m| matches!(m, Message::Integrity { .. }))
            })
            .count();
        assert!(hashes_alone > 0);
    }

    #[test]
    fn data_waits_for_hashes_in_a_later_datagram() {
        let t0 = Instant::now();
        let data = content(2 * 1024);
        let honest = tree_of(&data);
        let id = SwarmId(honest.root_hash().unwrap().to_vec());
        let mut b = leech(&id, 2, Config::default(), t0);
        let peer = addr(9);
        let (ours, requested) = hand_peer(&mut b, peer, &id, Bin::new(1), t0);
        assert!(requested.contains(&Bin::chunk(0)));

        let chunk0 = encode(&Datagram::new(ours, vec![data_message(&data, 0)]));
        let out = b.on_datagram(t0, peer, &chunk0);
        assert!(!out.contains(&OutboundAction::ChunkVerified(Bin::chunk(0))));
        assert!(b.tree().is_pending(Bin::chunk(0)));

        let proof = Datagram::new(ours, proof_messages(&honest, Bin::chunk(0)));
        let out = b.on_datagram(t0, peer, &encode(&proof));
        assert!(out.contains(&OutboundAction::ChunkVerified(Bin::chunk(0))));
        assert_eq!(b.tree().pending_len(), 0);
        assert_eq!(b.channel_for(peer).unwrap().violations(), 0);
    }

    #[test]
    fn hashes_ahead_of_their_data_verify_it_on_arrival() {
        let t0 = Instant::now();
        let data = content(2 * 1024);
        let honest = tree_of(&data);
        let id = SwarmId(honest.root_hash().unwrap().to_vec());
        let mut b = leech(&id, 2, Config::default(), t0);
        let peer = addr(9);
        let (ours, requested) = hand_peer(&mut b, peer, &id, Bin::new(1), t0);
        assert!(requested.contains(&Bin::chunk(0)));

        let proof = Datagram::new(ours, proof_messages(&honest, Bin::chunk(0)));
        let out = b.on_datagram(t0, peer, &encode(&proof));
        assert!(!out.contains(&OutboundAction::ChunkVerified(Bin::chunk(0))));
        assert_eq!(b.view().verified_count(), 0);

        let chunk0 = encode(&Datagram::new(ours, vec![data_message(&data, 0)]));
        let out = b.on_datagram(t0, peer, &chunk0);
        assert!(out.contains(&OutboundAction::ChunkVerified(Bin::chunk(0))));
        assert_eq!(b.tree().pending_len(), 0);
    }

    #[test]
    fn lost_hashes_release_the_chunk_for_a_new_request() {
        let t0 = Instant::now();
        let data = content(2 * 1024);
        let honest = tree_of(&data);
        let id = SwarmId(honest.root_hash().unwrap().to_vec());
        let cfg = Config::default();
        let mut b = leech(&id, 2, cfg.clone(), t0);
        let peer = addr(9);
        let (ours, requested) = hand_peer(&mut b, peer, &id, Bin::new(1), t0);
        assert!(requested.contains(&Bin::chunk(0)));

        // The datagram with the hashes never arrives.
        let chunk0 = encode(&Datagram::new(ours, vec![data_message(&data, 0)]));
        b.on_datagram(t0, peer, &chunk0);
        assert!(b.tree().is_pending(Bin::chunk(0)));
        let out = b.tick(t0 + cfg.request_timeout() / 2);
        assert!(b.tree().is_pending(Bin::chunk(0)));
        assert!(!requests(&out).contains(&Bin::chunk(0)));

        let later = t0 + cfg.request_timeout();
        let out = b.tick(later);
        assert!(!b.tree().is_pending(Bin::chunk(0)));
        assert!(requests(&out).contains(&Bin::chunk(0)));

        let mut answer = proof_messages(&honest, Bin::chunk(0));
        answer.push(data_message(&data, 0));
        let out = b.on_datagram(later, peer, &encode(&Datagram::new(ours, answer)));
        assert!(out.contains(&OutboundAction::ChunkVerified(Bin::chunk(0))));
        assert_eq!(b.channel_for(peer).unwrap().violations(), 0);
    }

    #[test]
    fn buffered_chunk_dropped_when_its_channel_closes() {
        let t0 = Instant::now();
        let data = content(2 * 1024);
        let honest = tree_of(&data);
        let id = SwarmId(honest.root_hash().unwrap().to_vec());
        let mut b = leech(&id, 2, Config::default(), t0);
        let peer = addr(9);
        let (ours, _) = hand_peer(&mut b, peer, &id, Bin::new(1), t0);
        let chunk0 = encode(&Datagram::new(ours, vec![data_message(&data, 0)]));
        b.on_datagram(t0, peer, &chunk0);
        assert!(b.tree().is_pending(Bin::chunk(0)));

        let reset = encode(&Datagram::new(ours, vec![Message::Reset]));
        let out = b.on_datagram(t0, peer, &reset);
        assert!(out
            .iter()
            .any(|a| matches!(a, OutboundAction::ChannelClosed { .. })));
        assert!(b.channel_for(peer).is_none());
        assert_eq!(b.tree().pending_len(), 0);
    }

    #[test]
    fn unrequested_data_counts_as_violation() {
        let t0 = Instant::now();
        let data = content(8 * 1024);
        let id = SwarmId(tree_of(&data).root_hash().unwrap().to_vec());
        let mut b = leech(&id, 8, Config::default(), t0);
        let evil = addr(9);
        let (ours, requested) = hand_peer(&mut b, evil, &id, Bin::new(7), t0);
        assert!(!requested.contains(&Bin::chunk(7)));

        let junk = encode(&Datagram::new(
            ours,
            vec![Message::Data {
                bin: Bin::chunk(7),
                timestamp: 0,
                payload: vec![0xAA; 1024],
            }],
        ));
        let max = Config::default().max_violations;
        for n in 1..max {
            b.on_datagram(t0, evil, &junk);
            assert_eq!(b.channel_for(evil).unwrap().violations(), n);
        }
        assert_eq!(b.tree().pending_len(), 0);

        let out = b.on_datagram(t0, evil, &junk);
        assert!(b.channel_for(evil).is_none());
        assert!(out.iter().any(|a| matches!(
            a,
            OutboundAction::ChannelClosed {
                reason: PeerError::ProtocolViolation(_),
                ..
            }
        )));
    }

    #[test]
    fn hashless_data_does_not_stall_download() {
        let t0 = Instant::now();
        let data = content(8 * 1024);
        let mut net = Net::new(t0);
        let a = net.add(seed(&data, t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 8, Config::default(), t0));
        let evil = addr(9);
        let (ours, requested) =
            hand_peer(&mut net.nodes[b].swarm, evil, &id, Bin::new(7), t0);
        assert!(!requested.is_empty());

        let mut order = requested.clone();
        order.extend((0..8).map(Bin::chunk).filter(|bin| !requested.contains(bin)));
        for bin in order {
            let junk = Datagram::new(
                ours,
                vec![Message::Data {
                    bin,
                    timestamp: 0,
                    payload: vec![0xAA; 1024],
                }],
            );
            let actions = net.nodes[b].swarm.on_datagram(t0, evil, &encode(&junk));
            net.absorb(b, actions);
        }
        assert!(net.swarm(b).tree().is_pending(requested[0]));
        assert_eq!(net.swarm(b).view().verified_count(), 0);

        net.connect(b, a);
        net.pump();
        for _ in 0..120 {
            if net.swarm(b).view().is_complete() {
                break;
            }
            net.advance(Duration::from_secs(1));
        }
        let leecher = net.swarm(b);
        assert!(leecher.view().is_complete());
        assert_eq!(leecher.storage().contiguous(), data);
        assert_eq!(leecher.tree().pending_len(), 0);
    }

    #[test]
    fn repeated_send_failures_fail_channel() {
        let t0 = Instant::now();
        let mut a = seed(&content(1024), t0);
        let peer = addr(4);
        a.connect(t0, peer).unwrap();
        let max = Config::default().max_send_failures;
        for _ in 1..max {
            assert!(a.on_send_failed(t0, peer).is_empty());
        }
        assert_eq!(
            a.on_send_failed(t0, peer),
            vec![OutboundAction::ChannelClosed {
                peer,
                state: ChannelState::Failed,
                reason: PeerError::PeerDisconnected("send failures"),
            }]
        );
    }

    struct Refusing(u32);

    impl Transport for Refusing {
        fn send(&mut self, _peer: SocketAddr, _bytes: &[u8]) -> io::Result<()> {
            self.0 += 1;
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    #[test]
    fn dispatch_reports_failed_sends() {
        let t0 = Instant::now();
        let mut a = seed(&content(1024), t0);
        let actions = a.connect(t0, addr(4)).unwrap();
        let mut transport = Refusing(0);
        let rest = dispatch(&mut a, &mut transport, t0, actions);
        assert!(rest.is_empty());
        assert_eq!(transport.0, 1);
        assert_eq!(
            a.channel_for(addr(4)).unwrap().state(),
            ChannelState::Handshaking
        );
    }

    #[test]
    fn bootstrap_needs_peers() {
        let t0 = Instant::now();
        let id = seed(&content(1024), t0).swarm_id().clone();
        let mut b = leech(&id, 1, Config::default(), t0);
        assert!(matches!(
            b.bootstrap(t0, &mut StaticDiscovery::new(Vec::new())),
            Err(SwarmError::NoPeers)
        ));
        let actions = b
            .bootstrap(t0, &mut StaticDiscovery::new(vec![addr(1), addr(2)]))
            .unwrap();
        assert_eq!(sends(&actions).len(), 2);
        assert_eq!(b.channels().count(), 2);
    }

    #[test]
    fn swarm_ids_checked_against_integrity() {
        let t0 = Instant::now();
        assert!(matches!(
            Swarm::for_content(SwarmId(vec![1, 2, 3]), 4, MemoryStorage::new(), Config::default(), t0),
            Err(SwarmError::InvalidSwarmId)
        ));
        assert!(matches!(
            Swarm::live_receiver(SwarmId(vec![0; 5]), MemoryStorage::new(), Config::default(), t0),
            Err(SwarmError::InvalidSwarmId)
        ));
        let tree = MerkleTree::from_chunks(HashFunction::Sha256, &[b"abc".as_slice()], 4).unwrap();
        assert!(matches!(
            Swarm::new(SwarmId(vec![0; 32]), tree, MemoryStorage::new(), Config::default(), t0),
            Err(SwarmError::InvalidSwarmId)
        ));
        let mut b = leech(&SwarmId(vec![0; 32]), 1, Config::default(), t0);
        assert!(matches!(
            b.inject_live_chunk(t0, b"x"),
            Err(SwarmError::NotSource)
        ));
    }

    #[test]
    fn resumed_seed_serves_from_checkpoint() {
        let t0 = Instant::now();
        let data = content(4096);
        let original = seed(&data, t0);
        let id = original.swarm_id().clone();
        let tree = MerkleTree::restore(
            &original.checkpoint().unwrap(),
            TrustAnchor::root(id.as_bytes().to_vec(), 4),
            16,
        )
        .unwrap();
        let mut storage = MemoryStorage::new();
        for (i, c) in chunk::split_into_chunks(&data, 1024).iter().enumerate() {
            storage.write_chunk(Bin::chunk(i as u64), c).unwrap();
        }
        let mut have = Binmap::new();
        have.insert_range(0, 4);
        let resumed = Swarm::new(id.clone(), tree, storage, Config::default(), t0)
            .unwrap()
            .with_verified(have);

        let mut net = Net::new(t0);
        let a = net.add(resumed);
        let b = net.add(leech(&id, 4, Config::default(), t0));
        net.connect(b, a);
        net.pump();
        assert_eq!(net.swarm(b).storage().contiguous(), data);
    }

    #[test]
    fn in_order_playhead_skips_late_chunks() {
        let t0 = Instant::now();
        let data = content(8 * 1024);
        let cfg = Config {
            policy: SchedulingPolicy::InOrder,
            playback_window: 2,
            ..Config::default()
        };
        let mut net = Net::new(t0);
        let a = net.add(seed(&data, t0));
        let id = net.swarm(a).swarm_id().clone();
        let b = net.add(leech(&id, 8, cfg, t0));
        net.connect(b, a);
        net.pump();
        assert_eq!(net.verified(b), vec![Bin::chunk(0), Bin::chunk(1)]);

        let now = net.now;
        let actions = net.nodes[b].swarm.set_playhead(now, 4);
        net.absorb(b, actions);
        net.pump();
        assert_eq!(net.swarm(b).scheduler().skipped().len(), 2);
        assert_eq!(
            net.verified(b),
            vec![Bin::chunk(0), Bin::chunk(1), Bin::chunk(4), Bin::chunk(5)]
        );
    }
}
