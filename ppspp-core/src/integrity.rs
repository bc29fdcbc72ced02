//! Integrity: Merkle hash tree verification (RFC 7574 §5-6) and peer trust tracking.
//!
//! Hashes and chunk bytes may arrive in either order and from different
//! peers. Unverified hashes are kept as candidates; chunk bytes without a
//! trusted chain wait in a bounded pending buffer. Each new hash re-checks the
//! buffer, so arrival order changes only when a chunk verifies, never whether.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tracing::{debug, warn};

use crate::bin::Bin;
use crate::binmap::Binmap;
use crate::chunk::ChunkBuffer;
use crate::identity::SourceKey;
use crate::protocol::HashFunction;

/// Default maximum integrity failures before a peer is isolated.
pub const DEFAULT_MAX_INTEGRITY_FAILURES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("no trusted hash chain for bin {0}")]
    Unresolved(Bin),
    #[error("hash mismatch for bin {0}")]
    Mismatch(Bin),
    #[error("conflicting hash for verified bin {0}")]
    Conflict(Bin),
    #[error("pending chunk buffer full, dropped bin {0}")]
    PendingFull(Bin),
    #[error("bad munro signature for bin {0}")]
    BadSignature(Bin),
    #[error("bin {0} is not a munro of this swarm")]
    NotMunro(Bin),
    #[error("bin {0} is outside the content")]
    OutOfRange(Bin),
    #[error("bin {0} is not a single chunk")]
    NotLeaf(Bin),
    #[error("hash length {got}, expected {expected}")]
    HashLength { expected: usize, got: usize },
    #[error("hash function {0:?} not supported")]
    UnsupportedHash(HashFunction),
    #[error("content has no chunks")]
    EmptyContent,
    #[error("checkpoint: {0}")]
    Checkpoint(String),
}

/// Hash function used for leaves and interior nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHasher {
    function: HashFunction,
}

impl TreeHasher {
    pub fn new(function: HashFunction) -> Result<Self, IntegrityError> {
        match function {
            HashFunction::Sha1 => Err(IntegrityError::UnsupportedHash(function)),
            _ => Ok(Self { function }),
        }
    }

    pub fn function(&self) -> HashFunction {
        self.function
    }

    pub fn output_len(&self) -> usize {
        self.function.output_len()
    }

    /// Hash of a node wholly beyond the end of the content.
    pub fn zero(&self) -> Vec<u8> {
        vec![0u8; self.output_len()]
    }

    pub fn leaf(&self, data: &[u8]) -> Vec<u8> {
        self.digest(&[data])
    }

    /// Parent hash: H(left || right).
    pub fn parent(&self, left: &[u8], right: &[u8]) -> Vec<u8> {
        self.digest(&[left, right])
    }

    fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut h = D::new();
            for p in parts {
                h.update(p);
            }
            h.finalize().to_vec()
        }
        match self.function {
            HashFunction::Sha224 => run::<Sha224>(parts),
            HashFunction::Sha384 => run::<Sha384>(parts),
            HashFunction::Sha512 => run::<Sha512>(parts),
            HashFunction::Sha1 | HashFunction::Sha256 => run::<Sha256>(parts),
        }
    }
}

/// What a swarm's hashes are ultimately checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustAnchor {
    /// No integrity protection: chunks are accepted as delivered.
    None,
    /// Static content: the root hash (the swarm ID) over `chunk_count` chunks.
    Root {
        bin: Bin,
        hash: Vec<u8>,
        chunk_count: u64,
    },
    /// Live content: munro hashes signed by the source key.
    Signed { key: SourceKey, munro_layer: u32 },
}

impl TrustAnchor {
    /// Root anchor for content of `chunk_count` chunks.
    pub fn root(hash: Vec<u8>, chunk_count: u64) -> Self {
        TrustAnchor::Root {
            bin: Bin::covering_root(chunk_count),
            hash,
            chunk_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    pub bin: Bin,
    pub hash: Vec<u8>,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MunroSignature {
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// Signed munro hash to send ahead of the uncles on a live swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMunro {
    pub bin: Bin,
    pub hash: Vec<u8>,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// Hashes a peer needs to verify one chunk, uncles ordered top-down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proof {
    pub munro: Option<SignedMunro>,
    pub uncles: Vec<(Bin, Vec<u8>)>,
}

/// Chunks newly verified and pending chunks found corrupt by one call.
#[derive(Debug, Default)]
pub struct Resolved {
    pub verified: Vec<ChunkBuffer>,
    pub rejected: Vec<Bin>,
}

impl Resolved {
    pub fn is_empty(&self) -> bool {
        self.verified.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    hash_function: HashFunction,
    nodes: Vec<(Bin, Vec<u8>)>,
    signatures: Vec<(Bin, MunroSignature)>,
}

/// Per-swarm hash tree: an arena of nodes keyed by bin.
pub struct MerkleTree {
    hasher: TreeHasher,
    anchor: TrustAnchor,
    nodes: HashMap<Bin, MerkleNode>,
    signatures: HashMap<Bin, MunroSignature>,
    pending: BTreeMap<Bin, Vec<u8>>,
    max_pending: usize,
}

impl MerkleTree {
    pub fn new(
        function: HashFunction,
        anchor: TrustAnchor,
        max_pending: usize,
    ) -> Result<Self, IntegrityError> {
        let hasher = TreeHasher::new(function)?;
        let mut tree = Self {
            hasher,
            anchor,
            nodes: HashMap::new(),
            signatures: HashMap::new(),
            pending: BTreeMap::new(),
            max_pending,
        };
        if let TrustAnchor::Root { bin, hash, .. } = &tree.anchor {
            tree.check_len(hash)?;
            let (bin, hash) = (*bin, hash.clone());
            tree.set_verified(bin, hash);
        }
        Ok(tree)
    }

    /// Build a fully verified tree over local content. The root hash is the swarm ID.
    pub fn from_chunks(
        function: HashFunction,
        chunks: &[&[u8]],
        max_pending: usize,
    ) -> Result<Self, IntegrityError> {
        if chunks.is_empty() {
            return Err(IntegrityError::EmptyContent);
        }
        let hasher = TreeHasher::new(function)?;
        let chunk_count = chunks.len() as u64;
        let root = Bin::covering_root(chunk_count);
        let mut nodes = HashMap::new();
        let root_hash = build_subtree(&hasher, root, chunk_count, chunks, &mut nodes);
        let mut tree = Self::new(function, TrustAnchor::root(root_hash, chunk_count), max_pending)?;
        for (bin, hash) in nodes {
            tree.set_verified(bin, hash);
        }
        Ok(tree)
    }

    /// Empty tree for a live swarm. The source fills it with [`MerkleTree::add_source_chunk`].
    pub fn live(
        function: HashFunction,
        key: SourceKey,
        munro_layer: u32,
        max_pending: usize,
    ) -> Result<Self, IntegrityError> {
        Self::new(
            function,
            TrustAnchor::Signed { key, munro_layer },
            max_pending,
        )
    }

    pub fn hasher(&self) -> &TreeHasher {
        &self.hasher
    }

    pub fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    pub fn root_hash(&self) -> Option<&[u8]> {
        match &self.anchor {
            TrustAnchor::Root { hash, .. } => Some(hash),
            _ => None,
        }
    }

    /// Number of chunks in static content, if known.
    pub fn chunk_count(&self) -> Option<u64> {
        match &self.anchor {
            TrustAnchor::Root { chunk_count, .. } => Some(*chunk_count),
            _ => None,
        }
    }

    pub fn node(&self, bin: Bin) -> Option<&MerkleNode> {
        self.nodes.get(&bin)
    }

    pub fn is_verified(&self, bin: Bin) -> bool {
        self.nodes.get(&bin).is_some_and(|n| n.verified)
    }

    /// Unverified hash offered for `bin`, if any.
    pub fn candidate(&self, bin: Bin) -> Option<&[u8]> {
        self.nodes
            .get(&bin)
            .filter(|n| !n.verified)
            .map(|n| n.hash.as_slice())
    }

    pub fn signature(&self, bin: Bin) -> Option<&MunroSignature> {
        self.signatures.get(&bin)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, bin: Bin) -> bool {
        self.pending.contains_key(&bin)
    }

    /// Discard a buffered chunk. False if none was held for `bin`.
    pub fn drop_pending(&mut self, bin: Bin) -> bool {
        self.pending.remove(&bin).is_some()
    }

    /// Record an INTEGRITY hash as a candidate and re-check buffered chunks.
    pub fn offer_hash(&mut self, bin: Bin, hash: Vec<u8>) -> Result<Resolved, IntegrityError> {
        self.insert_candidate(bin, hash)?;
        Ok(self.recheck_pending())
    }

    /// Insert `hash` for `bin` with its proof chain (uncle hashes) and try to
    /// resolve it to a trusted ancestor. Candidates stay in the tree on
    /// `Unresolved` so a later hash can complete the chain.
    pub fn submit_hash(
        &mut self,
        bin: Bin,
        hash: Vec<u8>,
        proof: &[(Bin, Vec<u8>)],
    ) -> Result<Resolved, IntegrityError> {
        for (b, h) in proof {
            self.insert_candidate(*b, h.clone())?;
        }
        self.insert_candidate(bin, hash.clone())?;
        self.resolve(bin, hash)?;
        Ok(self.recheck_pending())
    }

    /// Accept a munro hash carried with the source's signature.
    pub fn submit_signed_hash(
        &mut self,
        bin: Bin,
        hash: Vec<u8>,
        timestamp: u64,
        signature: Vec<u8>,
    ) -> Result<Resolved, IntegrityError> {
        let TrustAnchor::Signed { key, munro_layer } = &self.anchor else {
            return Err(IntegrityError::NotMunro(bin));
        };
        if bin.layer() != *munro_layer {
            return Err(IntegrityError::NotMunro(bin));
        }
        self.check_len(&hash)?;
        if !key.verify(bin, timestamp, &hash, &signature) {
            warn!(bin = %bin, "munro signature rejected");
            return Err(IntegrityError::BadSignature(bin));
        }
        if let Some(node) = self.nodes.get(&bin) {
            if node.verified && node.hash != hash {
                return Err(IntegrityError::Conflict(bin));
            }
        }
        self.set_verified(bin, hash);
        self.signatures.insert(
            bin,
            MunroSignature {
                timestamp,
                signature,
            },
        );
        Ok(self.recheck_pending())
    }

    /// Check delivered chunk bytes. On success the chunk (and any buffered
    /// chunk it unblocks) is returned for storage. Without a trusted chain the
    /// bytes are buffered and `Unresolved` is returned.
    pub fn submit_chunk_data(&mut self, bin: Bin, data: Vec<u8>) -> Result<Resolved, IntegrityError> {
        if !bin.is_leaf() {
            return Err(IntegrityError::NotLeaf(bin));
        }
        let leaf_hash = self.hasher.leaf(&data);
        if self.anchor == TrustAnchor::None {
            self.set_verified(bin, leaf_hash);
            return Ok(Resolved {
                verified: vec![ChunkBuffer::new(bin, data)],
                rejected: Vec::new(),
            });
        }
        match self.resolve(bin, leaf_hash) {
            Ok(()) => {
                self.pending.remove(&bin);
                let mut out = self.recheck_pending();
                out.verified.insert(0, ChunkBuffer::new(bin, data));
                Ok(out)
            }
            Err(IntegrityError::Unresolved(_)) => {
                if self.pending.len() >= self.max_pending && !self.pending.contains_key(&bin) {
                    warn!(bin = %bin, limit = self.max_pending, "pending chunk buffer full");
                    return Err(IntegrityError::PendingFull(bin));
                }
                debug!(bin = %bin, "chunk buffered until its hash arrives");
                self.pending.insert(bin, data);
                Err(IntegrityError::Unresolved(bin))
            }
            Err(e) => Err(e),
        }
    }

    /// Hashes a peer needs to verify `leaf`, skipping what it already knows:
    /// uncles under a bin the peer holds chunks of, and bins already sent.
    pub fn proof_for(
        &self,
        leaf: Bin,
        peer_have: &Binmap,
        sent: &HashSet<Bin>,
    ) -> Result<Proof, IntegrityError> {
        let mut proof = Proof::default();
        if self.anchor == TrustAnchor::None {
            return Ok(proof);
        }
        let top = self.top_for(leaf)?;
        let mut cur = leaf;
        while cur != top {
            let sib = cur.sibling();
            if peer_have.intersects_bin(cur.parent()) || sent.contains(&sib) {
                break;
            }
            if !self.beyond_end(sib) {
                let hash = self
                    .nodes
                    .get(&sib)
                    .filter(|n| n.verified)
                    .ok_or(IntegrityError::Unresolved(leaf))?;
                proof.uncles.push((sib, hash.hash.clone()));
            }
            cur = cur.parent();
        }
        proof.uncles.reverse();

        if matches!(self.anchor, TrustAnchor::Signed { .. })
            && !peer_have.intersects_bin(top)
            && !sent.contains(&top)
        {
            let node = self
                .nodes
                .get(&top)
                .filter(|n| n.verified)
                .ok_or(IntegrityError::Unresolved(leaf))?;
            let sig = self
                .signatures
                .get(&top)
                .ok_or(IntegrityError::Unresolved(leaf))?;
            proof.munro = Some(SignedMunro {
                bin: top,
                hash: node.hash.clone(),
                timestamp: sig.timestamp,
                signature: sig.signature.clone(),
            });
        }
        Ok(proof)
    }

    /// Live source: add chunk `index`. Returns the munro bin and its hash once
    /// every chunk under that munro is present; the caller signs it and
    /// records the signature with [`MerkleTree::record_signature`].
    pub fn add_source_chunk(&mut self, index: u64, data: &[u8]) -> Option<(Bin, Vec<u8>)> {
        let TrustAnchor::Signed { munro_layer, .. } = self.anchor else {
            return None;
        };
        let leaf = Bin::chunk(index);
        let hash = self.hasher.leaf(data);
        self.set_verified(leaf, hash);
        let munro = Bin::from_layer(munro_layer, index >> munro_layer)?;
        let (first, last) = munro.range();
        if !(first..=last).all(|i| self.is_verified(Bin::chunk(i))) {
            return None;
        }
        let hash = self.fill_from_leaves(munro);
        Some((munro, hash))
    }

    pub fn record_signature(&mut self, munro: Bin, timestamp: u64, signature: Vec<u8>) {
        self.signatures.insert(
            munro,
            MunroSignature {
                timestamp,
                signature,
            },
        );
    }

    /// Serialise verified nodes and munro signatures.
    pub fn checkpoint(&self) -> Result<Vec<u8>, IntegrityError> {
        let mut nodes: Vec<(Bin, Vec<u8>)> = self
            .nodes
            .values()
            .filter(|n| n.verified)
            .map(|n| (n.bin, n.hash.clone()))
            .collect();
        nodes.sort_by_key(|(b, _)| *b);
        let mut signatures: Vec<(Bin, MunroSignature)> = self
            .signatures
            .iter()
            .map(|(b, s)| (*b, s.clone()))
            .collect();
        signatures.sort_by_key(|(b, _)| *b);
        let cp = Checkpoint {
            hash_function: self.hasher.function(),
            nodes,
            signatures,
        };
        bincode::serialize(&cp).map_err(|e| IntegrityError::Checkpoint(e.to_string()))
    }

    /// Rebuild a tree from [`MerkleTree::checkpoint`] output. The stored root
    /// (static) or munro signatures (live) must agree with `anchor`.
    pub fn restore(
        bytes: &[u8],
        anchor: TrustAnchor,
        max_pending: usize,
    ) -> Result<Self, IntegrityError> {
        let cp: Checkpoint =
            bincode::deserialize(bytes).map_err(|e| IntegrityError::Checkpoint(e.to_string()))?;
        let mut tree = Self::new(cp.hash_function, anchor, max_pending)?;
        let stored: HashMap<Bin, Vec<u8>> = cp.nodes.into_iter().collect();
        match &tree.anchor {
            TrustAnchor::Root { bin, hash, .. } => {
                if stored.get(bin) != Some(hash) {
                    return Err(IntegrityError::Checkpoint("root hash differs".into()));
                }
            }
            TrustAnchor::Signed { key, .. } => {
                for (bin, sig) in &cp.signatures {
                    let hash = stored
                        .get(bin)
                        .ok_or_else(|| IntegrityError::Checkpoint("signed munro missing".into()))?;
                    if !key.verify(*bin, sig.timestamp, hash, &sig.signature) {
                        return Err(IntegrityError::BadSignature(*bin));
                    }
                }
            }
            TrustAnchor::None => {}
        }
        for (bin, hash) in stored {
            tree.check_len(&hash)?;
            tree.set_verified(bin, hash);
        }
        tree.signatures = cp.signatures.into_iter().collect();
        Ok(tree)
    }

    fn check_len(&self, hash: &[u8]) -> Result<(), IntegrityError> {
        if hash.len() != self.hasher.output_len() {
            return Err(IntegrityError::HashLength {
                expected: self.hasher.output_len(),
                got: hash.len(),
            });
        }
        Ok(())
    }

    fn set_verified(&mut self, bin: Bin, hash: Vec<u8>) {
        self.nodes.insert(
            bin,
            MerkleNode {
                bin,
                hash,
                verified: true,
            },
        );
    }

    fn insert_candidate(&mut self, bin: Bin, hash: Vec<u8>) -> Result<(), IntegrityError> {
        self.check_len(&hash)?;
        if let Some(node) = self.nodes.get(&bin) {
            if node.verified {
                if node.hash == hash {
                    return Ok(());
                }
                warn!(bin = %bin, "conflicting hash for verified bin");
                return Err(IntegrityError::Conflict(bin));
            }
        }
        if self.beyond_end(bin) {
            return if hash == self.hasher.zero() {
                Ok(())
            } else {
                Err(IntegrityError::Conflict(bin))
            };
        }
        self.nodes.insert(
            bin,
            MerkleNode {
                bin,
                hash,
                verified: false,
            },
        );
        Ok(())
    }

    /// True if every chunk under `bin` lies past the end of static content.
    fn beyond_end(&self, bin: Bin) -> bool {
        match &self.anchor {
            TrustAnchor::Root { chunk_count, .. } => bin.base_offset() >= *chunk_count,
            _ => false,
        }
    }

    /// Highest bin a hash under `bin` must chain up to.
    fn top_for(&self, bin: Bin) -> Result<Bin, IntegrityError> {
        match &self.anchor {
            TrustAnchor::None => Ok(bin),
            TrustAnchor::Root {
                bin: root,
                chunk_count,
                ..
            } => {
                if root.contains(bin) && bin.base_offset() < *chunk_count {
                    Ok(*root)
                } else {
                    Err(IntegrityError::OutOfRange(bin))
                }
            }
            TrustAnchor::Signed { munro_layer, .. } => {
                if bin.layer() > *munro_layer {
                    return Err(IntegrityError::OutOfRange(bin));
                }
                Bin::from_layer(*munro_layer, bin.base_offset() >> *munro_layer)
                    .ok_or(IntegrityError::OutOfRange(bin))
            }
        }
    }

    /// Walk from `start` towards its trusted ancestor, hashing with sibling
    /// hashes. On a match every node on the path and every sibling used
    /// becomes verified. On a mismatch the candidates used are dropped.
    fn resolve(&mut self, start: Bin, start_hash: Vec<u8>) -> Result<(), IntegrityError> {
        let top = self.top_for(start)?;
        let mut path: Vec<(Bin, Vec<u8>)> = Vec::new();
        let mut used: Vec<Bin> = Vec::new();
        let mut cur = start;
        let mut hash = start_hash;
        loop {
            let trusted = self
                .nodes
                .get(&cur)
                .filter(|n| n.verified)
                .map(|n| n.hash == hash);
            if let Some(matches) = trusted {
                if matches {
                    break;
                }
                warn!(bin = %start, at = %cur, "hash chain does not match trusted node");
                if !self.is_verified(start) {
                    used.push(start);
                }
                for b in used {
                    self.nodes.remove(&b);
                }
                return Err(IntegrityError::Mismatch(start));
            }
            if cur == top {
                return Err(IntegrityError::Unresolved(start));
            }
            let sib = cur.sibling();
            let sib_hash = match self.nodes.get(&sib) {
                Some(n) => {
                    if !n.verified {
                        used.push(sib);
                    }
                    n.hash.clone()
                }
                None if self.beyond_end(sib) => self.hasher.zero(),
                None => return Err(IntegrityError::Unresolved(start)),
            };
            let parent = if cur.is_left() {
                self.hasher.parent(&hash, &sib_hash)
            } else {
                self.hasher.parent(&sib_hash, &hash)
            };
            path.push((cur, hash));
            if !self.beyond_end(sib) {
                path.push((sib, sib_hash));
            }
            cur = cur.parent();
            hash = parent;
        }
        for (bin, hash) in path {
            self.set_verified(bin, hash);
        }
        Ok(())
    }

    fn recheck_pending(&mut self) -> Resolved {
        let mut out = Resolved::default();
        loop {
            let mut progressed = false;
            let bins: Vec<Bin> = self.pending.keys().copied().collect();
            for bin in bins {
                let Some(data) = self.pending.get(&bin) else {
                    continue;
                };
                let leaf_hash = self.hasher.leaf(data);
                match self.resolve(bin, leaf_hash) {
                    Ok(()) => {
                        if let Some(data) = self.pending.remove(&bin) {
                            out.verified.push(ChunkBuffer::new(bin, data));
                        }
                        progressed = true;
                    }
                    Err(IntegrityError::Unresolved(_)) => {}
                    Err(_) => {
                        self.pending.remove(&bin);
                        out.rejected.push(bin);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        out
    }

    /// Compute and verify every interior node under `top` from verified leaves.
    fn fill_from_leaves(&mut self, top: Bin) -> Vec<u8> {
        if let (Some(l), Some(r)) = (top.left(), top.right()) {
            let left = self.fill_from_leaves(l);
            let right = self.fill_from_leaves(r);
            let hash = self.hasher.parent(&left, &right);
            self.set_verified(top, hash.clone());
            return hash;
        }
        self.nodes
            .get(&top)
            .map(|n| n.hash.clone())
            .unwrap_or_else(|| self.hasher.zero())
    }
}

fn build_subtree(
    hasher: &TreeHasher,
    bin: Bin,
    chunk_count: u64,
    chunks: &[&[u8]],
    nodes: &mut HashMap<Bin, Vec<u8>>,
) -> Vec<u8> {
    if bin.base_offset() >= chunk_count {
        return hasher.zero();
    }
    let hash = match (bin.left(), bin.right()) {
        (Some(l), Some(r)) => {
            let left = build_subtree(hasher, l, chunk_count, chunks, nodes);
            let right = build_subtree(hasher, r, chunk_count, chunks, nodes);
            hasher.parent(&left, &right)
        }
        _ => hasher.leaf(chunks[bin.base_offset() as usize]),
    };
    nodes.insert(bin, hash.clone());
    hash
}

/// Tracks integrity failures per peer for malicious peer detection.
pub struct PeerTrustTracker {
    failures: HashMap<SocketAddr, u32>,
}

impl PeerTrustTracker {
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
        }
    }

    /// Record an integrity failure for a peer.
    pub fn record_failure(&mut self, peer: SocketAddr) {
        *self.failures.entry(peer).or_insert(0) += 1;
    }

    /// Check if a peer should be isolated (failures >= max_failures).
    pub fn is_isolated(&self, peer: &SocketAddr, max_failures: u32) -> bool {
        self.failure_count(peer) >= max_failures
    }

    pub fn failure_count(&self, peer: &SocketAddr) -> u32 {
        self.failures.get(peer).copied().unwrap_or(0)
    }
}

impl Default for PeerTrustTracker {
    fn default() -> Self {
        Self::new()
    }
}
