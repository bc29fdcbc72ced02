//! LEDBAT delay-based window (RFC 6817), one per channel.
//!
//! Runs on the requesting side: the window bounds bytes requested but not yet
//! delivered. A DATA arrival is the ACK-equivalent, its one-way delay sample
//! being our receive clock minus the sender's timestamp. The two clocks are
//! unsynchronised; the constant offset cancels against the base delay.

use std::collections::VecDeque;
use std::time::Duration;

/// Window a channel starts with, in chunks.
const INITIAL_CWND_CHUNKS: u64 = 3;
/// Smallest window, in chunks. One chunk always fits below it.
const MIN_CWND_CHUNKS: u64 = 2;
/// Most the window may exceed the bytes in flight, in chunks.
const ALLOWED_INCREASE_CHUNKS: u64 = 2;
/// Samples in the current-delay filter.
const CURRENT_FILTER: usize = 4;

pub struct Ledbat {
    chunk_size: u64,
    cwnd: u64,
    flight: u64,
    target_us: i64,
    gain: f64,
    base_delay: Option<i64>,
    recent: VecDeque<i64>,
}

impl Ledbat {
    pub fn new(chunk_size: u32, target: Duration, gain: f64) -> Self {
        let chunk_size = u64::from(chunk_size.max(1));
        Self {
            chunk_size,
            cwnd: INITIAL_CWND_CHUNKS * chunk_size,
            flight: 0,
            target_us: i64::try_from(target.as_micros()).unwrap_or(i64::MAX).max(1),
            gain,
            base_delay: None,
            recent: VecDeque::with_capacity(CURRENT_FILTER),
        }
    }

    /// True if `n_bytes` more may be put in flight. Pure.
    pub fn can_send(&self, n_bytes: u64) -> bool {
        self.flight.saturating_add(n_bytes) <= self.cwnd
    }

    /// Bytes that may go in flight while keeping it strictly below the
    /// window. Requesters fill up to this, so their acks can still grow it.
    pub fn open_window(&self) -> u64 {
        self.cwnd.saturating_sub(self.flight).saturating_sub(1)
    }

    pub fn on_send(&mut self, n_bytes: u64) {
        self.flight = self.flight.saturating_add(n_bytes);
    }

    /// Delivery of `bytes` with a one-way delay sample in microseconds.
    /// A window that was already full may shrink here but never grows.
    pub fn on_ack(&mut self, bytes: u64, delay_sample_us: i64) {
        let flight_before = self.flight;
        let gated = !self.can_send(1);
        self.flight = self.flight.saturating_sub(bytes);

        let base = self
            .base_delay
            .map_or(delay_sample_us, |b| b.min(delay_sample_us));
        self.base_delay = Some(base);
        if self.recent.len() == CURRENT_FILTER {
            self.recent.pop_front();
        }
        self.recent.push_back(delay_sample_us);

        let queuing = self.queuing_delay_us();
        let off_target = (self.target_us - queuing) as f64 / self.target_us as f64;
        let mut delta =
            self.gain * off_target * bytes as f64 * self.chunk_size as f64 / self.cwnd as f64;
        if gated {
            delta = delta.min(0.0);
        }
        let grown = (self.cwnd as f64 + delta).max(0.0) as u64;
        let cap = flight_before.saturating_add(ALLOWED_INCREASE_CHUNKS * self.chunk_size);
        self.cwnd = grown.min(cap.max(self.cwnd)).max(self.min_cwnd());
    }

    /// Loss of `bytes` (request gave up after retries): halve the window.
    pub fn on_timeout(&mut self, bytes: u64) {
        self.flight = self.flight.saturating_sub(bytes);
        self.cwnd = (self.cwnd / 2).max(self.min_cwnd());
    }

    /// Bytes no longer in flight for reasons other than delivery or loss
    /// (cancel, choke, retransmit bookkeeping). Window unchanged.
    pub fn on_release(&mut self, bytes: u64) {
        self.flight = self.flight.saturating_sub(bytes);
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    pub fn flight(&self) -> u64 {
        self.flight
    }

    /// Bytes that may still be put in flight.
    pub fn headroom(&self) -> u64 {
        self.cwnd.saturating_sub(self.flight)
    }

    pub fn base_delay_us(&self) -> Option<i64> {
        self.base_delay
    }

    /// Filtered current delay minus base delay.
    pub fn queuing_delay_us(&self) -> i64 {
        match (self.recent.iter().min(), self.base_delay) {
            (Some(&cur), Some(base)) => cur.saturating_sub(base).max(0),
            _ => 0,
        }
    }

    fn min_cwnd(&self) -> u64 {
        MIN_CWND_CHUNKS * self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u32 = 1000;

    fn ledbat() -> Ledbat {
        Ledbat::new(CHUNK, Duration::from_millis(100), 1.0)
    }

    /// Keep the pipe as full as a requester would, acking one chunk at a time
    /// with a fixed queuing delay.
    fn run(cc: &mut Ledbat, rounds: usize, base_us: i64, queuing_us: i64) {
        for _ in 0..rounds {
            while cc.open_window() >= CHUNK as u64 {
                cc.on_send(CHUNK as u64);
            }
            cc.on_ack(CHUNK as u64, base_us + queuing_us);
        }
    }

    #[test]
    fn grows_below_target() {
        let mut cc = ledbat();
        let start = cc.cwnd();
        cc.on_send(CHUNK as u64);
        cc.on_ack(CHUNK as u64, 5_000);
        run(&mut cc, 50, 5_000, 0);
        assert!(cc.cwnd() > start, "cwnd {} should exceed {}", cc.cwnd(), start);
    }

    #[test]
    fn shrinks_above_target() {
        let mut cc = ledbat();
        cc.on_send(CHUNK as u64);
        cc.on_ack(CHUNK as u64, 1_000);
        run(&mut cc, 100, 1_000, 0);
        let grown = cc.cwnd();
        run(&mut cc, 20, 1_000, 300_000);
        assert!(cc.cwnd() < grown);
        assert!(cc.queuing_delay_us() >= 299_000);
    }

    #[test]
    fn full_window_does_not_grow() {
        let mut cc = ledbat();
        for _ in 0..CURRENT_FILTER {
            cc.on_send(CHUNK as u64);
            cc.on_ack(CHUNK as u64, 0);
        }
        let before = cc.cwnd();
        cc.on_send(cc.headroom());
        assert!(!cc.can_send(1));
        cc.on_ack(CHUNK as u64, 0);
        assert_eq!(cc.cwnd(), before);

        // Delay above target still shrinks a full window.
        for _ in 0..CURRENT_FILTER {
            cc.on_send(cc.headroom());
            assert!(!cc.can_send(1));
            cc.on_ack(CHUNK as u64, 500_000);
        }
        assert!(cc.cwnd() < before);
    }

    #[test]
    fn open_window_stays_below_cwnd() {
        let mut cc = ledbat();
        assert_eq!(cc.open_window(), cc.cwnd() - 1);
        cc.on_send(cc.open_window());
        assert!(cc.can_send(1));
        assert!(!cc.can_send(2));
        assert_eq!(cc.open_window(), 0);
    }

    #[test]
    fn window_floor_leaves_room_for_a_chunk() {
        let mut cc = ledbat();
        cc.on_send(CHUNK as u64);
        cc.on_ack(CHUNK as u64, 0);
        run(&mut cc, 200, 0, 10_000_000);
        assert_eq!(cc.cwnd(), 2 * CHUNK as u64);
        for _ in 0..10 {
            cc.on_timeout(0);
        }
        assert_eq!(cc.cwnd(), 2 * CHUNK as u64);
        assert!(cc.open_window() >= CHUNK as u64);
    }

    #[test]
    fn timeout_halves_window() {
        let mut cc = ledbat();
        run(&mut cc, 100, 0, 0);
        let before = cc.cwnd();
        cc.on_send(CHUNK as u64);
        let flight = cc.flight();
        cc.on_timeout(CHUNK as u64);
        assert_eq!(cc.cwnd(), (before / 2).max(2 * CHUNK as u64));
        assert_eq!(cc.flight(), flight - CHUNK as u64);
    }

    #[test]
    fn can_send_gates_on_window() {
        let mut cc = ledbat();
        assert!(cc.can_send(3 * CHUNK as u64));
        cc.on_send(3 * CHUNK as u64);
        assert!(!cc.can_send(1));
        assert_eq!(cc.headroom(), 0);
        cc.on_release(CHUNK as u64);
        assert!(cc.can_send(CHUNK as u64));
    }

    #[test]
    fn idle_sender_window_does_not_run_ahead() {
        let mut cc = ledbat();
        // acks with almost nothing in flight: the window stays near what was used
        for _ in 0..1000 {
            cc.on_send(10);
            cc.on_ack(10, 0);
        }
        assert!(cc.cwnd() <= INITIAL_CWND_CHUNKS * CHUNK as u64);
    }

    #[test]
    fn clock_offset_cancels() {
        let mut a = ledbat();
        let mut b = ledbat();
        run(&mut a, 30, 0, 20_000);
        run(&mut b, 30, -7_000_000, 20_000);
        assert_eq!(a.cwnd(), b.cwnd());
    }
}
