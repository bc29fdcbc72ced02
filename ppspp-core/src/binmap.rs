//! Availability set over chunk indices, stored as sorted disjoint ranges.
//!
//! Used for the local SwarmView and for each peer's advertised HAVEs. A single
//! HAVE for a large bin is one range, so memory stays proportional to the
//! number of holes rather than the number of chunks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bin::{range_to_bins, Bin};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binmap {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
    count: u64,
}

impl Binmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of chunks in the set.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    pub fn lowest(&self) -> Option<u64> {
        self.ranges.keys().next().copied()
    }

    pub fn highest(&self) -> Option<u64> {
        self.ranges.values().next_back().map(|&e| e - 1)
    }

    /// Number of chunks in `[start, end)` already present.
    pub fn covered_in(&self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let mut total = 0;
        if let Some((_, &pe)) = self.ranges.range(..start).next_back() {
            if pe > start {
                total += pe.min(end) - start;
            }
        }
        for (&s, &e) in self.ranges.range(start..end) {
            total += e.min(end) - s;
        }
        total
    }

    /// Insert `[start, end)`. Returns how many chunks were newly added.
    pub fn insert_range(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let added = (end - start) - self.covered_in(start, end);
        if added == 0 {
            return 0;
        }
        let mut s = start;
        let mut e = end;
        if let Some((&ps, &pe)) = self.ranges.range(..=s).next_back() {
            if pe >= s {
                s = ps;
                e = e.max(pe);
            }
        }
        let absorbed: Vec<u64> = self.ranges.range(s..=e).map(|(&k, _)| k).collect();
        for k in absorbed {
            if let Some(v) = self.ranges.remove(&k) {
                e = e.max(v);
            }
        }
        self.ranges.insert(s, e);
        self.count += added;
        added
    }

    pub fn insert_bin(&mut self, bin: Bin) -> u64 {
        if bin.is_none() {
            return 0;
        }
        let (first, last) = bin.range();
        self.insert_range(first, last.saturating_add(1))
    }

    pub fn insert_chunk(&mut self, index: u64) -> bool {
        self.insert_range(index, index + 1) == 1
    }

    /// Remove `[start, end)`. Returns how many chunks were removed.
    pub fn remove_range(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let removed = self.covered_in(start, end);
        if removed == 0 {
            return 0;
        }
        let mut touched: Vec<(u64, u64)> = Vec::new();
        if let Some((&ps, &pe)) = self.ranges.range(..start).next_back() {
            if pe > start {
                touched.push((ps, pe));
            }
        }
        touched.extend(self.ranges.range(start..end).map(|(&s, &e)| (s, e)));
        for (s, e) in touched {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
        self.count -= removed;
        removed
    }

    /// Forget everything below chunk `index`.
    pub fn remove_below(&mut self, index: u64) -> u64 {
        self.remove_range(0, index)
    }

    pub fn contains_chunk(&self, index: u64) -> bool {
        match self.ranges.range(..=index).next_back() {
            Some((_, &e)) => index < e,
            None => false,
        }
    }

    /// True if every chunk under `bin` is present.
    pub fn contains_bin(&self, bin: Bin) -> bool {
        let (first, last) = bin.range();
        match self.ranges.range(..=first).next_back() {
            Some((_, &e)) => last < e,
            None => false,
        }
    }

    /// True if at least one chunk under `bin` is present.
    pub fn intersects_bin(&self, bin: Bin) -> bool {
        let (first, last) = bin.range();
        self.covered_in(first, last.saturating_add(1)) > 0
    }

    /// Lowest chunk at or after `from` that is not in the set.
    pub fn first_missing(&self, from: u64) -> u64 {
        match self.ranges.range(..=from).next_back() {
            Some((_, &e)) if e > from => e,
            _ => from,
        }
    }

    /// Gaps inside `[start, end)` as half-open ranges, ascending.
    pub fn missing_in(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut cursor = start;
        if let Some((_, &pe)) = self.ranges.range(..start).next_back() {
            cursor = cursor.max(pe);
        }
        for (&s, &e) in self.ranges.range(start..end) {
            if s > cursor {
                out.push((cursor, s));
            }
            cursor = cursor.max(e);
        }
        if cursor < end {
            out.push((cursor, end));
        }
        out
    }

    /// Minimal bins describing the whole set, for compact HAVE messages.
    pub fn covering_bins(&self) -> Vec<Bin> {
        self.ranges
            .iter()
            .flat_map(|(&s, &e)| range_to_bins(s, e - 1).unwrap_or_default())
            .collect()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.count = 0;
    }
}
