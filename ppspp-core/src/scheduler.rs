//! Chunk scheduler: decide which missing chunks to request from which peer.
//!
//! Planning is a pure function of local availability, each peer's advertised
//! availability, its outstanding requests and its window headroom. Calling it
//! again with the requests it returned already recorded yields nothing new.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::channel::{Channel, OutstandingRequest};
use crate::config::{Config, SchedulingPolicy};
use crate::protocol::ChannelId;

/// One eligible peer as the scheduler sees it.
pub struct PeerSlot<'a> {
    pub channel: ChannelId,
    pub have: &'a Binmap,
    /// Chunks the congestion window still admits.
    pub headroom: u64,
    pub outstanding: &'a BTreeMap<Bin, OutstandingRequest>,
    pub gave_up: &'a BTreeSet<Bin>,
}

impl<'a> PeerSlot<'a> {
    pub fn from_channel(ch: &'a Channel) -> Self {
        Self {
            channel: ch.local_id(),
            have: ch.peer_have(),
            headroom: ch.headroom_chunks(),
            outstanding: ch.outstanding(),
            gave_up: ch.gave_up(),
        }
    }

    fn can_serve(&self, bin: Bin) -> bool {
        !self.outstanding.contains_key(&bin) && !self.gave_up.contains(&bin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDecision {
    pub bin: Bin,
    pub channel: ChannelId,
    /// Duplicate of a slow request already outstanding elsewhere.
    pub endgame: bool,
}

/// Run of chunks held by the same set of peers.
struct Segment {
    start: u64,
    end: u64,
    holders: Vec<usize>,
}

pub struct Scheduler {
    policy: SchedulingPolicy,
    playback_window: u64,
    playhead: u64,
    skipped: Binmap,
    endgame_after_retries: u32,
    endgame_max_duplicates: usize,
}

impl Scheduler {
    pub fn new(config: &Config) -> Self {
        Self {
            policy: config.policy,
            playback_window: config.playback_window.max(1),
            playhead: 0,
            skipped: Binmap::new(),
            endgame_after_retries: config.endgame_after_retries,
            endgame_max_duplicates: config.endgame_max_duplicates,
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    pub fn playhead(&self) -> u64 {
        self.playhead
    }

    /// Chunks given up on because playback passed them.
    pub fn skipped(&self) -> &Binmap {
        &self.skipped
    }

    /// Advance playback. Under the in-order policy every chunk still missing
    /// below the new playhead is marked permanently skipped. Returns how many.
    pub fn set_playhead(&mut self, playhead: u64, local: &Binmap) -> u64 {
        if playhead <= self.playhead {
            return 0;
        }
        let mut skipped = 0;
        if self.policy == SchedulingPolicy::InOrder {
            for (s, e) in local.missing_in(self.playhead, playhead) {
                skipped += self.skipped.insert_range(s, e);
            }
        }
        self.playhead = playhead;
        skipped
    }

    /// Chunk range eligible for requests, given the swarm's content bounds.
    pub fn window(&self, bounds: Range<u64>) -> Range<u64> {
        match self.policy {
            SchedulingPolicy::RarestFirst => bounds,
            SchedulingPolicy::InOrder => {
                let lo = bounds.start.max(self.playhead);
                let hi = bounds
                    .end
                    .min(self.playhead.saturating_add(self.playback_window));
                lo..hi.max(lo)
            }
        }
    }

    /// Requests for this tick, in priority order.
    pub fn plan(&self, local: &Binmap, bounds: Range<u64>, peers: &[PeerSlot<'_>]) -> Vec<RequestDecision> {
        let window = self.window(bounds);
        let mut out = Vec::new();
        if window.is_empty() || peers.is_empty() {
            return out;
        }
        let mut headroom: Vec<u64> = peers.iter().map(|p| p.headroom).collect();

        // bin -> (peers asking, most retries)
        let mut inflight: HashMap<Bin, (usize, u32)> = HashMap::new();
        for p in peers {
            for r in p.outstanding.values() {
                let e = inflight.entry(r.bin).or_insert((0, 0));
                e.0 += 1;
                e.1 = e.1.max(r.retries);
            }
        }

        let mut segments = availability(peers, window.clone());
        if self.policy == SchedulingPolicy::RarestFirst {
            segments.sort_by_key(|s| (s.holders.len(), s.start));
        }

        let mut planned: BTreeSet<Bin> = BTreeSet::new();
        for seg in &segments {
            if !seg.holders.iter().any(|&i| headroom[i] > 0) {
                continue;
            }
            'gaps: for (s, e) in local.missing_in(seg.start, seg.end) {
                for idx in s..e {
                    let bin = Bin::chunk(idx);
                    if inflight.contains_key(&bin) {
                        continue;
                    }
                    if let Some(i) = pick_peer(peers, &headroom, seg.holders.iter().copied(), bin) {
                        headroom[i] -= 1;
                        planned.insert(bin);
                        out.push(RequestDecision {
                            bin,
                            channel: peers[i].channel,
                            endgame: false,
                        });
                    }
                    if !seg.holders.iter().any(|&i| headroom[i] > 0) {
                        break 'gaps;
                    }
                }
            }
        }

        let mut slow: Vec<Bin> = inflight
            .iter()
            .filter(|(b, (count, retries))| {
                *count == 1
                    && *retries >= self.endgame_after_retries
                    && window.contains(&b.base_offset())
                    && !planned.contains(*b)
            })
            .map(|(b, _)| *b)
            .collect();
        slow.sort();
        let mut duplicates = 0;
        for bin in slow {
            if duplicates >= self.endgame_max_duplicates {
                break;
            }
            let holders = (0..peers.len()).filter(|&i| peers[i].have.contains_bin(bin));
            if let Some(i) = pick_peer(peers, &headroom, holders, bin) {
                headroom[i] -= 1;
                duplicates += 1;
                out.push(RequestDecision {
                    bin,
                    channel: peers[i].channel,
                    endgame: true,
                });
            }
        }
        out
    }
}

/// Peer with the most headroom that may be asked for `bin`; ties to the lower channel ID.
fn pick_peer(
    peers: &[PeerSlot<'_>],
    headroom: &[u64],
    candidates: impl Iterator<Item = usize>,
    bin: Bin,
) -> Option<usize> {
    candidates
        .filter(|&i| headroom[i] > 0 && peers[i].can_serve(bin))
        .max_by_key(|&i| (headroom[i], Reverse(peers[i].channel)))
}

/// Split `window` at every peer range boundary; keep runs held by at least one peer.
fn availability(peers: &[PeerSlot<'_>], window: Range<u64>) -> Vec<Segment> {
    let mut cuts: BTreeSet<u64> = BTreeSet::new();
    cuts.insert(window.start);
    cuts.insert(window.end);
    for p in peers {
        for (s, e) in p.have.ranges() {
            if e <= window.start || s >= window.end {
                continue;
            }
            cuts.insert(s.max(window.start));
            cuts.insert(e.min(window.end));
        }
    }
    let cuts: Vec<u64> = cuts.into_iter().collect();
    cuts.windows(2)
        .filter_map(|w| {
            let holders: Vec<usize> = (0..peers.len())
                .filter(|&i| peers[i].have.contains_chunk(w[0]))
                .collect();
            (!holders.is_empty()).then_some(Segment {
                start: w[0],
                end: w[1],
                holders,
            })
        })
        .collect()
}
