// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer MTU discovery state machine (§4.2).
//!
//! RTT and bandwidth are tracked with the teacher's
//! `congestion::rtt_estimator::RttEstimator`, reused here per-peer instead of
//! per-writer, unchanged.

use crate::config::MTU_PROBE_MIN_SIZE;
use crate::congestion::rtt_estimator::RttEstimator;
use std::time::{Duration, Instant};

/// `mtuprobes` thresholds (§4.2).
const CONVERGED_AT: u32 = 30;
const IDLE_AT: u32 = 31;
const RECHECK_AT: u32 = 32;

/// Ticks without any reply before UDP is declared lost and the peer falls
/// back to TCP tunneling (§4.2 "If 10 ticks pass with no reply at all").
const NO_REPLY_TICK_LIMIT: u32 = 10;

/// Burst probe slots per tick, excluding the optional broadcast slot
/// (§4.2 "send a burst of 4 (+1 if local-discovery enabled)").
const BURST_SIZE: usize = 4;

/// One outgoing probe datagram the caller must send (§4.2: "≥64 B,
/// zero-filled header region, random body").
pub struct ProbeDatagram {
    pub size: usize,
    pub is_broadcast: bool,
}

/// Simple xorshift PRNG so probe sizing doesn't need a `rand` dependency
/// for a single call site; not used for anything security-sensitive.
struct SizeRng(u64);

impl SizeRng {
    fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in `(low, high]`; returns `high` if the range is empty.
    fn range_exclusive_inclusive(&mut self, low: usize, high: usize) -> usize {
        if high <= low + 1 {
            return high;
        }
        let span = (high - low) as u64;
        low + 1 + (self.next_u64() % span) as usize
    }
}

/// Per-peer MTU discovery and link-health state (§4.2).
pub struct MtuProbe {
    ceiling: usize,
    minmtu: usize,
    maxmtu: usize,
    mtuprobes: u32,
    ticks_without_reply: u32,

    rtt: RttEstimator,
    bandwidth_bytes_per_sec: f32,

    prev_received_seqno: u64,
    received_seqno: u64,
    prev_sent_seqno: u64,
    sent_seqno: u64,
    loss: f32,

    burst_send_time: Option<Instant>,
    replies_this_burst: u32,
    burst_probe_len: usize,

    last_hard_try: Option<Instant>,
    rng: SizeRng,
}

impl MtuProbe {
    /// `ceiling` is the largest MTU this peer will ever grow to (`MTU_CEILING`
    /// unless the peer's config raises it).
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            minmtu: 0,
            maxmtu: ceiling,
            mtuprobes: 1,
            ticks_without_reply: 0,
            rtt: RttEstimator::new(100.0),
            bandwidth_bytes_per_sec: 0.0,
            prev_received_seqno: 0,
            received_seqno: 0,
            prev_sent_seqno: 0,
            sent_seqno: 0,
            loss: 0.0,
            burst_send_time: None,
            replies_this_burst: 0,
            burst_probe_len: 0,
            last_hard_try: None,
            rng: SizeRng::new(ceiling as u64 ^ 0x9E3779B97F4A7C15),
        }
    }

    pub fn mtuprobes(&self) -> u32 {
        self.mtuprobes
    }

    pub fn minmtu(&self) -> usize {
        self.minmtu
    }

    pub fn maxmtu(&self) -> usize {
        self.maxmtu
    }

    pub fn is_converged(&self) -> bool {
        self.mtuprobes == CONVERGED_AT
    }

    pub fn udp_lost(&self) -> bool {
        self.ticks_without_reply >= NO_REPLY_TICK_LIMIT
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt.rtt()
    }

    pub fn bandwidth_bytes_per_sec(&self) -> f32 {
        self.bandwidth_bytes_per_sec
    }

    pub fn loss(&self) -> f32 {
        self.loss
    }

    /// Resets discovery to phase 1 with `minmtu` cleared and `maxmtu` back
    /// at the ceiling (§4.2 ">32 -> declare UDP lost and restart").
    pub fn restart(&mut self) {
        self.mtuprobes = 1;
        self.minmtu = 0;
        self.maxmtu = self.ceiling;
        self.ticks_without_reply = 0;
        self.burst_send_time = None;
        self.replies_this_burst = 0;
    }

    /// Advances the `mtuprobes` phase counter after each 1-second tick,
    /// wrapping >32 into a restart (§4.2 state table).
    fn advance_phase(&mut self) {
        if self.mtuprobes > RECHECK_AT {
            self.restart();
        } else if self.mtuprobes < CONVERGED_AT {
            self.mtuprobes += 1;
        }
        // 30 (converged) and 31 (idle) hold until external events move them;
        // 32 (recheck) is driven back down by `on_reply`/`on_tick_timeout`.
    }

    /// Builds this tick's burst, or `None` if converged/idle and not due for
    /// a recheck. `prevedge` mirrors the C source's pointer: `Some` only
    /// while a prior edge toward this peer is known.
    pub fn send_burst(&mut self, prevedge_known: bool, now: Instant) -> Option<Vec<ProbeDatagram>> {
        match self.mtuprobes {
            CONVERGED_AT => return None, // wait for pinginterval; caller schedules recheck
            IDLE_AT => return None,
            _ => {}
        }

        let mut probes = Vec::with_capacity(BURST_SIZE + 1);

        let above_ceiling_allowed = self.mtuprobes >= CONVERGED_AT || self.maxmtu >= self.ceiling;
        if above_ceiling_allowed {
            probes.push(ProbeDatagram {
                size: (self.maxmtu + 8).min(self.ceiling + 8),
                is_broadcast: false,
            });
        }

        let low = self.minmtu.max(MTU_PROBE_MIN_SIZE - 1);
        let high = self.maxmtu.max(low + 1);
        let remaining = BURST_SIZE.saturating_sub(probes.len());
        for _ in 0..remaining {
            let size = self.rng.range_exclusive_inclusive(low, high).max(MTU_PROBE_MIN_SIZE);
            probes.push(ProbeDatagram { size, is_broadcast: false });
        }

        // §9 resolution: skip the broadcast slot entirely when no prior
        // edge toward this peer is known, rather than sending to nothing.
        if prevedge_known {
            probes.push(ProbeDatagram {
                size: MTU_PROBE_MIN_SIZE,
                is_broadcast: true,
            });
        }

        self.burst_send_time = Some(now);
        self.replies_this_burst = 0;
        self.burst_probe_len = probes.first().map(|p| p.size).unwrap_or(0);

        self.advance_phase();
        Some(probes)
    }

    /// Called on each PKT_PROBE reply (first byte == 1). `len` is the size
    /// of the datagram that came back.
    pub fn on_reply(&mut self, len: usize, now: Instant) {
        self.ticks_without_reply = 0;

        if len > self.minmtu {
            self.minmtu = len.min(self.maxmtu);
        }

        self.replies_this_burst += 1;
        if self.replies_this_burst == 1 {
            if let Some(sent) = self.burst_send_time {
                self.rtt.update_duration(now.saturating_duration_since(sent));
            }
        } else if self.replies_this_burst == 3 {
            if let Some(sent) = self.burst_send_time {
                let elapsed = now.saturating_duration_since(sent).as_secs_f32();
                if elapsed > 0.0 {
                    self.bandwidth_bytes_per_sec = 2.0 * len as f32 / elapsed;
                }
            }
        }

        if len == self.maxmtu + 8 {
            self.maxmtu = self.ceiling;
            self.mtuprobes = 10;
        }

        if self.mtuprobes == 0 {
            self.mtuprobes = 1;
        }
    }

    /// Called once per 1-second base timer when no reply arrived for the
    /// outstanding burst; tracks the consecutive-silence counter that
    /// triggers the UDP-lost fallback (§4.2).
    pub fn on_tick_timeout(&mut self) {
        self.ticks_without_reply += 1;
        if self.mtuprobes == RECHECK_AT {
            self.advance_phase();
        }
    }

    /// Re-arms the idle/converged state for another `pinginterval` wait,
    /// or schedules the single-burst recheck (phase 32) after
    /// `pingtimeout` (§4.2 state table rows 31/32).
    pub fn schedule_recheck(&mut self) {
        if self.mtuprobes == CONVERGED_AT || self.mtuprobes == IDLE_AT {
            self.mtuprobes = RECHECK_AT;
        }
    }

    /// Marks the peer converged and idle, the steady state once `minmtu`
    /// and `maxmtu` have met (phase 30 -> 31 is driven externally by the
    /// caller once it stops seeing growth across several bursts).
    pub fn mark_converged(&mut self) {
        self.mtuprobes = CONVERGED_AT;
    }

    /// Retries a key request or handshake; writes `last_hard_try`
    /// unconditionally before branching so both soft and hard retry paths
    /// share one throttle clock (§9 resolution).
    pub fn try_harder(&mut self, hard: bool, now: Instant) -> bool {
        self.last_hard_try = Some(now);
        if hard {
            self.restart();
            true
        } else {
            false
        }
    }

    /// Applied when a send comes back `EMSGSIZE`: the kernel has told us
    /// the real path MTU is smaller than `new_mtu`, so both bounds are
    /// clamped down to it immediately rather than waiting for the probe
    /// burst to rediscover the ceiling.
    pub fn on_send_too_large(&mut self, new_mtu: usize) {
        self.maxmtu = new_mtu.min(self.maxmtu);
        self.minmtu = self.minmtu.min(self.maxmtu);
    }

    /// Refreshes the packet-loss estimate once per tick when the sequence
    /// counters have advanced (§4.2, §9 resolution for the stalled case).
    pub fn update_loss(&mut self, sent_seqno: u64, received_seqno: u64) {
        self.prev_sent_seqno = self.sent_seqno;
        self.prev_received_seqno = self.received_seqno;
        self.sent_seqno = sent_seqno;
        self.received_seqno = received_seqno;

        if self.received_seqno == self.prev_received_seqno {
            self.loss = 0.0;
            return;
        }

        let seqno_delta = self.sent_seqno.saturating_sub(self.prev_sent_seqno);
        let received_delta = self.received_seqno.saturating_sub(self.prev_received_seqno);
        if seqno_delta == 0 {
            self.loss = 0.0;
            return;
        }

        let ratio = received_delta as f32 / seqno_delta as f32;
        self.loss = (1.0 - ratio).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_phase_one_with_no_minmtu() {
        let probe = MtuProbe::new(1500);
        assert_eq!(probe.mtuprobes(), 1);
        assert_eq!(probe.minmtu(), 0);
        assert_eq!(probe.maxmtu(), 1500);
        assert!(!probe.is_converged());
    }

    #[test]
    fn reply_raises_minmtu_but_never_past_maxmtu() {
        let mut probe = MtuProbe::new(1500);
        let now = Instant::now();
        probe.on_reply(800, now);
        assert_eq!(probe.minmtu(), 800);
        probe.on_reply(400, now);
        assert_eq!(probe.minmtu(), 800, "minmtu must not shrink on a smaller reply");
    }

    #[test]
    fn reply_at_maxmtu_plus_eight_grows_the_ceiling_probe_and_restarts_phase() {
        let mut probe = MtuProbe::new(1500);
        let now = Instant::now();
        probe.on_reply(1508, now);
        assert_eq!(probe.maxmtu(), 1500);
        assert_eq!(probe.mtuprobes(), 10);
    }

    #[test]
    fn ten_silent_ticks_declare_udp_lost() {
        let mut probe = MtuProbe::new(1500);
        for _ in 0..9 {
            probe.on_tick_timeout();
            assert!(!probe.udp_lost());
        }
        probe.on_tick_timeout();
        assert!(probe.udp_lost());
    }

    #[test]
    fn reply_resets_the_silence_counter() {
        let mut probe = MtuProbe::new(1500);
        for _ in 0..5 {
            probe.on_tick_timeout();
        }
        probe.on_reply(100, Instant::now());
        for _ in 0..5 {
            probe.on_tick_timeout();
        }
        assert!(!probe.udp_lost());
    }

    #[test]
    fn restart_clears_minmtu_and_resets_maxmtu_to_ceiling() {
        let mut probe = MtuProbe::new(1500);
        probe.on_reply(900, Instant::now());
        probe.restart();
        assert_eq!(probe.minmtu(), 0);
        assert_eq!(probe.maxmtu(), 1500);
        assert_eq!(probe.mtuprobes(), 1);
    }

    #[test]
    fn burst_without_prevedge_omits_the_broadcast_slot() {
        let mut probe = MtuProbe::new(1500);
        let burst = probe.send_burst(false, Instant::now()).unwrap();
        assert!(burst.iter().all(|p| !p.is_broadcast));
    }

    #[test]
    fn burst_with_prevedge_includes_exactly_one_broadcast_slot() {
        let mut probe = MtuProbe::new(1500);
        let burst = probe.send_burst(true, Instant::now()).unwrap();
        assert_eq!(burst.iter().filter(|p| p.is_broadcast).count(), 1);
    }

    #[test]
    fn converged_peer_sends_no_burst() {
        let mut probe = MtuProbe::new(1500);
        probe.mark_converged();
        assert!(probe.send_burst(false, Instant::now()).is_none());
    }

    #[test]
    fn loss_is_zero_when_received_seqno_has_not_advanced() {
        let mut probe = MtuProbe::new(1500);
        probe.update_loss(10, 8);
        probe.update_loss(20, 8);
        assert_eq!(probe.loss(), 0.0);
    }

    #[test]
    fn loss_reflects_dropped_fraction() {
        let mut probe = MtuProbe::new(1500);
        probe.update_loss(0, 0);
        probe.update_loss(10, 5);
        assert!((probe.loss() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn try_harder_always_stamps_last_hard_try() {
        let mut probe = MtuProbe::new(1500);
        let now = Instant::now();
        assert!(!probe.try_harder(false, now));
        assert!(probe.last_hard_try.is_some());
        assert!(probe.try_harder(true, now));
        assert_eq!(probe.mtuprobes(), 1);
    }

    #[test]
    fn minmtu_is_non_decreasing_across_a_sequence_of_replies_absent_reset() {
        let mut probe = MtuProbe::new(1500);
        let sizes = [100, 250, 200, 400, 399, 800, 700];
        let mut last = 0;
        for &size in &sizes {
            probe.on_reply(size, Instant::now());
            assert!(probe.minmtu() >= last);
            last = probe.minmtu();
        }
    }
}
