//! Bin numbering: a binary interval tree over chunk indices (RFC 7574 §4.3).
//!
//! Leaf chunk `i` is bin `2i`. A bin at layer `l` has exactly `l` trailing one
//! bits and covers `2^l` consecutive chunks. Every relation (parent, sibling,
//! children, covered range) is computed from the integer alone.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a node in the chunk tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bin(u64);

impl Bin {
    /// Root of the whole 63-layer tree; covers every addressable chunk.
    pub const ALL: Bin = Bin(u64::MAX >> 1);
    /// Sentinel for "no bin".
    pub const NONE: Bin = Bin(u64::MAX);
    /// Highest chunk index a bin can address.
    pub const MAX_CHUNK: u64 = u64::MAX >> 1;

    pub const fn new(raw: u64) -> Self {
        Bin(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Leaf bin for chunk `index`.
    pub const fn chunk(index: u64) -> Self {
        Bin(index << 1)
    }

    /// Bin at `layer` with `offset` counted in units of `2^layer` chunks.
    /// `None` if that bin lies outside the 64-bit tree.
    pub fn from_layer(layer: u32, offset: u64) -> Option<Self> {
        let odd = offset.checked_mul(2)?.checked_add(1)?;
        let scaled = odd.checked_mul(1u64.checked_shl(layer)?)?;
        Some(Bin(scaled - 1))
    }

    pub fn is_none(self) -> bool {
        self == Bin::NONE
    }

    pub fn is_all(self) -> bool {
        self == Bin::ALL
    }

    pub fn layer(self) -> u32 {
        self.0.trailing_ones()
    }

    pub fn is_leaf(self) -> bool {
        self.0 & 1 == 0
    }

    /// Position of this bin among the bins of its layer.
    pub fn layer_offset(self) -> u64 {
        self.0.checked_shr(self.layer() + 1).unwrap_or(0)
    }

    /// First chunk covered.
    pub fn base_offset(self) -> u64 {
        self.layer_offset() << self.layer().min(63)
    }

    /// Number of chunks covered.
    pub fn base_length(self) -> u64 {
        1u64.checked_shl(self.layer()).unwrap_or(u64::MAX)
    }

    /// Inclusive chunk range `(first, last)` covered by this bin.
    pub fn range(self) -> (u64, u64) {
        let first = self.base_offset();
        (first, first.saturating_add(self.base_length() - 1))
    }

    /// Leftmost leaf under this bin.
    pub fn base_left(self) -> Bin {
        Bin::chunk(self.base_offset())
    }

    /// Rightmost leaf under this bin.
    pub fn base_right(self) -> Bin {
        Bin::chunk(self.range().1)
    }

    pub fn parent(self) -> Bin {
        let l = self.layer();
        if l >= 62 {
            return Bin::ALL;
        }
        Bin((self.0 & !(1 << (l + 1))) | (1 << l))
    }

    pub fn sibling(self) -> Bin {
        let l = self.layer();
        if l >= 63 {
            return Bin::NONE;
        }
        Bin(self.0 ^ (1 << (l + 1)))
    }

    /// True if this bin is the left child of its parent.
    pub fn is_left(self) -> bool {
        let l = self.layer();
        l >= 63 || self.0 & (1 << (l + 1)) == 0
    }

    pub fn left(self) -> Option<Bin> {
        match self.layer() {
            0 => None,
            l => Some(Bin(self.0 ^ (1 << (l - 1)))),
        }
    }

    pub fn right(self) -> Option<Bin> {
        match self.layer() {
            0 => None,
            l => Some(Bin(self.0 + (1 << (l - 1)))),
        }
    }

    /// True if `other` lies entirely inside this bin's range.
    pub fn contains(self, other: Bin) -> bool {
        let (a, b) = self.range();
        let (c, d) = other.range();
        a <= c && d <= b
    }

    /// True if this bin covers chunk `index`.
    pub fn contains_chunk(self, index: u64) -> bool {
        let (a, b) = self.range();
        a <= index && index <= b
    }

    /// Smallest bin rooted at chunk 0 that covers `chunk_count` chunks.
    pub fn covering_root(chunk_count: u64) -> Bin {
        let layer = chunk_count.max(1).next_power_of_two().trailing_zeros();
        Bin::from_layer(layer, 0).expect("layer <= 63 with offset 0 is always in the tree")
    }

    /// Chain of ancestors from this bin (exclusive) up to and including `top`.
    pub fn ancestors_until(self, top: Bin) -> impl Iterator<Item = Bin> {
        let mut cur = self;
        std::iter::from_fn(move || {
            if cur == top || cur.layer() >= top.layer() {
                return None;
            }
            cur = cur.parent();
            Some(cur)
        })
    }
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let (first, last) = self.range();
        write!(f, "{}[{}..={}]", self.0, first, last)
    }
}

/// Minimal set of bins exactly covering the inclusive chunk range. `None` if
/// the range reaches past [`Bin::MAX_CHUNK`].
pub fn range_to_bins(first: u64, last: u64) -> Option<Vec<Bin>> {
    if last > Bin::MAX_CHUNK {
        return None;
    }
    let mut out = Vec::new();
    let mut a = first;
    while a <= last {
        let mut layer = a.trailing_zeros().min(63);
        while layer > 0 {
            match a.checked_add((1u64 << layer) - 1) {
                Some(end) if end <= last => break,
                _ => layer -= 1,
            }
        }
        out.push(Bin::from_layer(layer, a >> layer)?);
        match a.checked_add(1u64 << layer) {
            Some(next) => a = next,
            None => break,
        }
    }
    Some(out)
}

/// Minimal set of bins covering exactly the given chunk indices. Indices past
/// [`Bin::MAX_CHUNK`] have no bin and are left out.
pub fn chunks_to_covering_bins<I>(chunks: I) -> Vec<Bin>
where
    I: IntoIterator<Item = u64>,
{
    let mut sorted: Vec<u64> = chunks.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut out = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return out;
    };
    let mut end = start;
    for c in iter {
        if c == end + 1 {
            end = c;
            continue;
        }
        out.extend(range_to_bins(start, end).unwrap_or_default());
        start = c;
        end = c;
    }
    out.extend(range_to_bins(start, end).unwrap_or_default());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_bins_map_to_chunks() {
        for i in 0..64u64 {
            let b = Bin::chunk(i);
            assert!(b.is_leaf());
            assert_eq!(b.layer(), 0);
            assert_eq!(b.range(), (i, i));
        }
    }

    #[test]
    fn rfc_example_numbering() {
        // Figure 2 of RFC 7574: bin 3 covers chunks 0..=3, bin 7 covers 0..=7.
        assert_eq!(Bin::new(1).range(), (0, 1));
        assert_eq!(Bin::new(5).range(), (2, 3));
        assert_eq!(Bin::new(3).range(), (0, 3));
        assert_eq!(Bin::new(11).range(), (4, 7));
        assert_eq!(Bin::new(7).range(), (0, 7));
        assert_eq!(Bin::from_layer(2, 1), Some(Bin::new(11)));
    }

    #[test]
    fn from_layer_rejects_bins_past_the_tree() {
        assert_eq!(Bin::from_layer(63, 0), Some(Bin::ALL));
        assert_eq!(Bin::from_layer(0, Bin::MAX_CHUNK), Some(Bin::new(u64::MAX - 1)));
        assert_eq!(Bin::from_layer(0, Bin::MAX_CHUNK + 1), None);
        assert_eq!(Bin::from_layer(63, 1), None);
        assert_eq!(Bin::from_layer(62, 2), None);
        assert_eq!(Bin::from_layer(64, 0), None);
    }

    #[test]
    fn range_to_bins_stops_at_max_chunk() {
        assert_eq!(range_to_bins(0, 3), Some(vec![Bin::new(3)]));
        assert_eq!(range_to_bins(0, Bin::MAX_CHUNK), Some(vec![Bin::ALL]));
        assert_eq!(
            range_to_bins(Bin::MAX_CHUNK, Bin::MAX_CHUNK),
            Some(vec![Bin::chunk(Bin::MAX_CHUNK)])
        );
        assert_eq!(range_to_bins(Bin::MAX_CHUNK - 1, u64::MAX), None);
        assert_eq!(range_to_bins(u64::MAX - 3, u64::MAX), None);
    }

    #[test]
    fn parent_range_is_union_of_children() {
        for raw in 0..4096u64 {
            let b = Bin::new(raw);
            if let (Some(l), Some(r)) = (b.left(), b.right()) {
                let (a, _) = l.range();
                let (_, d) = r.range();
                assert_eq!(b.range(), (a, d));
                assert_eq!(l.range().1 + 1, r.range().0);
                assert_eq!(l.parent(), b);
                assert_eq!(r.parent(), b);
                assert_eq!(l.sibling(), r);
                assert!(l.is_left());
                assert!(!r.is_left());
            }
        }
    }

    #[test]
    fn range_is_deterministic_over_leaves() {
        let b = Bin::new(23);
        let (first, last) = b.range();
        let leaves: Vec<u64> = (first..=last)
            .filter(|&i| b.contains(Bin::chunk(i)))
            .collect();
        assert_eq!(leaves.len() as u64, b.base_length());
        assert_eq!(b.base_left(), Bin::chunk(first));
        assert_eq!(b.base_right(), Bin::chunk(last));
    }

    #[test]
    fn covering_root_sizes() {
        assert_eq!(Bin::covering_root(1), Bin::chunk(0));
        assert_eq!(Bin::covering_root(2), Bin::new(1));
        assert_eq!(Bin::covering_root(5), Bin::new(7));
        assert_eq!(Bin::covering_root(8), Bin::new(7));
    }

    #[test]
    fn all_covers_everything() {
        assert_eq!(Bin::ALL.range(), (0, (1u64 << 63) - 1));
        assert!(Bin::ALL.contains(Bin::chunk(1_000_000)));
    }

    #[test]
    fn covering_bins_are_minimal() {
        assert_eq!(chunks_to_covering_bins(0..8), vec![Bin::new(7)]);
        assert_eq!(
            chunks_to_covering_bins([1, 2, 3, 4]),
            vec![Bin::chunk(1), Bin::new(5), Bin::chunk(4)]
        );
        assert_eq!(
            chunks_to_covering_bins([9, 0, 1]),
            vec![Bin::new(1), Bin::chunk(9)]
        );
        assert!(chunks_to_covering_bins(std::iter::empty()).is_empty());
    }

    #[test]
    fn covering_bins_round_trip_chunks() {
        let chunks = [0u64, 1, 2, 5, 6, 7, 8, 9, 10, 11, 30];
        let bins = chunks_to_covering_bins(chunks);
        let mut back: Vec<u64> = bins
            .iter()
            .flat_map(|b| {
                let (a, z) = b.range();
                a..=z
            })
            .collect();
        back.sort_unstable();
        assert_eq!(back, chunks.to_vec());
    }

    #[test]
    fn ancestors_stop_at_top() {
        let chain: Vec<Bin> = Bin::chunk(2).ancestors_until(Bin::new(7)).collect();
        assert_eq!(chain, vec![Bin::new(5), Bin::new(3), Bin::new(7)]);
    }
}
