//! Per-receiver session: tick un-wrapping, arrival history, liveness.
//!
//! The session is a classifier and buffer — no numerical estimation
//! happens here. It turns raw hardware tick counts into monotone u64
//! ticks, keeps a bounded ring of recent arrivals, and enforces the
//! per-session message rate limit.

use std::collections::VecDeque;

use crate::config::SessionParams;
use crate::frame::{parse_frame, IcaoCache, ModesFrame};
use crate::geo::Ecef;
use crate::types::{Icao, MlatError, ReceiverId, Result};

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Receiver liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ReceiverState {
    /// Connected, no traffic yet.
    Connecting,
    /// Receiving traffic, clock not yet usable.
    Syncing,
    /// At least one mature clock pair.
    Synced,
    /// Disconnected or timed out.
    Dead,
}

// ---------------------------------------------------------------------------
// Tick un-wrapping
// ---------------------------------------------------------------------------

/// Un-wraps modulo-2^w hardware tick counts into a monotone u64.
///
/// The wrap width is hardware-specific (12 MHz dongles wrap at 2^24 or
/// 2^48) and is a per-receiver parameter. A raw value that steps backward
/// past half the wrap range signals a hardware reset.
#[derive(Debug)]
pub struct TickUnwrapper {
    mask: u64,
    last_raw: u64,
    last_wall: f64,
    total: u64,
    started: bool,
    /// Incremented whenever the un-wrap re-anchors (gap or reset).
    pub epoch: u32,
    reset_gap_s: f64,
}

impl TickUnwrapper {
    pub fn new(wrap_bits: u32, reset_gap_s: f64) -> Self {
        let mask = if wrap_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << wrap_bits) - 1
        };
        TickUnwrapper {
            mask,
            last_raw: 0,
            last_wall: 0.0,
            total: 0,
            started: false,
            epoch: 0,
            reset_gap_s,
        }
    }

    /// Feed the next raw tick; returns the un-wrapped monotone tick.
    ///
    /// `BadTick` means the tick went backward: the caller resets the
    /// session and starts a fresh epoch.
    pub fn unwrap(&mut self, raw: u64, wall: f64) -> Result<u64> {
        let raw = raw & self.mask;
        if !self.started {
            self.started = true;
            self.last_raw = raw;
            self.last_wall = wall;
            self.total = raw;
            return Ok(self.total);
        }

        let delta = raw.wrapping_sub(self.last_raw) & self.mask;

        if wall - self.last_wall > self.reset_gap_s {
            // Long silence: wraps may have been missed, so the delta is
            // meaningless. Re-anchor and keep the count monotone.
            self.epoch += 1;
            self.total += delta.max(1);
            self.last_raw = raw;
            self.last_wall = wall;
            return Ok(self.total);
        }

        if delta > self.mask / 2 {
            // Backward step beyond the wrap threshold: hardware reset.
            // The anchor is kept, so a genuinely reset clock keeps
            // failing until the session resyncs explicitly.
            let backward = self.mask + 1 - delta;
            return Err(MlatError::BadTick {
                last: self.total,
                got: self.total.saturating_sub(backward),
            });
        }

        self.total += delta;
        self.last_raw = raw;
        self.last_wall = wall;
        Ok(self.total)
    }

    /// Forget the anchor; the next tick starts a new epoch.
    pub fn reset(&mut self) {
        self.started = false;
        self.epoch += 1;
    }
}

// ---------------------------------------------------------------------------
// Arrivals
// ---------------------------------------------------------------------------

/// One message arrival at one receiver.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub receiver: ReceiverId,
    /// Un-wrapped hardware tick.
    pub tick: u64,
    /// Wall-clock receipt time at the server [s, unix].
    pub wall: f64,
    pub frame: ModesFrame,
}

/// Compact history entry (the ring does not keep payloads).
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry {
    pub tick: u64,
    pub wall: f64,
    pub icao: Icao,
    pub df: u8,
}

// ---------------------------------------------------------------------------
// Receiver session
// ---------------------------------------------------------------------------

/// A connected receiver: surveyed antenna position, clock parameters,
/// un-wrap state, bounded arrival history, counters.
///
/// Position and clock frequency are immutable while the session lives.
#[derive(Debug)]
pub struct Receiver {
    pub id: ReceiverId,
    pub name: String,
    /// Surveyed antenna position, ECEF [m].
    pub position: Ecef,
    /// Hardware timestamp frequency [Hz].
    pub clock_hz: f64,
    /// Per-receiver timing noise floor [ns].
    pub noise_floor_ns: f64,
    pub state: ReceiverState,

    unwrapper: TickUnwrapper,
    history: VecDeque<HistoryEntry>,
    icao_cache: IcaoCache,
    params: SessionParams,

    // Rate limiting: count within the current one-second bucket
    bucket_start: f64,
    bucket_count: u32,

    pub last_heard: f64,
    pub messages: u64,
    pub dropped: u64,
    pub bad_ticks: u32,
    pub bad_messages: u64,
}

impl Receiver {
    pub fn new(
        id: ReceiverId,
        name: String,
        position: Ecef,
        clock_hz: f64,
        wrap_bits: u32,
        params: SessionParams,
    ) -> Self {
        Receiver {
            id,
            name,
            position,
            clock_hz,
            noise_floor_ns: 50.0,
            state: ReceiverState::Connecting,
            unwrapper: TickUnwrapper::new(wrap_bits, params.unwrap_reset_gap_s),
            history: VecDeque::with_capacity(params.history_len),
            icao_cache: IcaoCache::default(),
            params,
            bucket_start: 0.0,
            bucket_count: 0,
            last_heard: 0.0,
            messages: 0,
            dropped: 0,
            bad_ticks: 0,
            bad_messages: 0,
        }
    }

    /// Ingest one raw record. Classifies, un-wraps, buffers, and returns
    /// the arrival for fan-out to the sync and MLAT pipelines.
    pub fn on_message(
        &mut self,
        tick_raw: u64,
        bytes: &[u8],
        rssi: Option<f64>,
        wall: f64,
    ) -> Result<Arrival> {
        self.last_heard = wall;

        // Rate limit before any parsing work
        if wall - self.bucket_start >= 1.0 {
            self.bucket_start = wall;
            self.bucket_count = 0;
        }
        self.bucket_count += 1;
        if self.bucket_count > self.params.rate_limit_per_s {
            self.dropped += 1;
            return Err(MlatError::ResourceExhausted(format!(
                "receiver {} over rate limit",
                self.name
            )));
        }

        let frame = match parse_frame(bytes, rssi, wall, &mut self.icao_cache) {
            Ok(f) => f,
            Err(e) => {
                self.bad_messages += 1;
                return Err(e);
            }
        };

        let tick = match self.unwrapper.unwrap(tick_raw, wall) {
            Ok(t) => {
                self.bad_ticks = 0;
                t
            }
            Err(e) => {
                self.bad_ticks += 1;
                if self.bad_ticks >= self.params.max_bad_ticks {
                    // Hardware reset: resync so the next tick re-anchors.
                    self.unwrapper.reset();
                }
                return Err(e);
            }
        };

        self.messages += 1;
        if self.state == ReceiverState::Connecting {
            self.state = ReceiverState::Syncing;
        }

        if self.history.len() == self.params.history_len {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            tick,
            wall,
            icao: frame.icao,
            df: frame.df,
        });

        Ok(Arrival {
            receiver: self.id,
            tick,
            wall,
            frame,
        })
    }

    /// Best-estimate mapping from wall time to local tick, for cold-start
    /// sanity checks only.
    pub fn epoch_ticks(&self, t_wall: f64) -> Option<u64> {
        let anchor = self.history.back()?;
        let dt = t_wall - anchor.wall;
        let ticks = anchor.tick as f64 + dt * self.clock_hz;
        if ticks < 0.0 {
            None
        } else {
            Some(ticks as u64)
        }
    }

    /// Un-wrapped tick converted to seconds on this receiver's clock.
    pub fn tick_seconds(&self, tick: u64) -> f64 {
        tick as f64 / self.clock_hz
    }

    /// Sustained bad ticks mean the hardware is resetting under us.
    pub fn should_drop(&self) -> bool {
        self.bad_ticks >= self.params.max_bad_ticks
    }

    pub fn is_silent(&self, now: f64) -> bool {
        now - self.last_heard > self.params.silence_timeout_s
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Housekeeping: expire the ICAO cache.
    pub fn prune(&mut self, now: f64) {
        self.icao_cache.prune(now);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::crc24;
    use crate::types::hex_decode;

    const DF17: &str = "8D4840D6202CC371C32CE0576098";

    fn make_receiver(wrap_bits: u32) -> Receiver {
        Receiver::new(
            ReceiverId(0),
            "test".into(),
            Ecef::new(0.0, 0.0, 0.0),
            12e6,
            wrap_bits,
            SessionParams::default(),
        )
    }

    #[test]
    fn test_unwrap_monotone() {
        let mut u = TickUnwrapper::new(24, 1.0);
        assert_eq!(u.unwrap(100, 0.0).unwrap(), 100);
        assert_eq!(u.unwrap(200, 0.001).unwrap(), 200);
        assert!(matches!(
            u.unwrap(150, 0.002),
            Err(MlatError::BadTick { .. })
        ));
    }

    #[test]
    fn test_unwrap_across_wrap() {
        let mut u = TickUnwrapper::new(24, 1.0);
        let near_top = (1u64 << 24) - 10;
        assert_eq!(u.unwrap(near_top, 0.0).unwrap(), near_top);
        // Wraps: raw 20 is 30 ticks later
        assert_eq!(u.unwrap(20, 0.001).unwrap(), near_top + 30);
    }

    #[test]
    fn test_unwrap_backward_is_bad_tick() {
        let mut u = TickUnwrapper::new(24, 1.0);
        u.unwrap(1_000_000, 0.0).unwrap();
        let err = u.unwrap(500_000, 0.001).unwrap_err();
        assert!(matches!(err, MlatError::BadTick { .. }));
        // Anchor is kept: the reset clock keeps failing until a resync
        assert!(u.unwrap(600_000, 0.002).is_err());
        u.reset();
        assert_eq!(u.unwrap(600_000, 0.003).unwrap(), 600_000);
    }

    #[test]
    fn test_unwrap_gap_resets_epoch() {
        let mut u = TickUnwrapper::new(48, 1.0);
        u.unwrap(1000, 0.0).unwrap();
        assert_eq!(u.epoch, 0);
        let t = u.unwrap(2000, 5.0).unwrap();
        assert_eq!(u.epoch, 1);
        assert!(t > 1000);
        // Still monotone afterwards
        assert!(u.unwrap(3000, 5.1).unwrap() > t);
    }

    #[test]
    fn test_on_message_classifies() {
        let mut rx = make_receiver(48);
        let bytes = hex_decode(DF17).unwrap();
        let arrival = rx.on_message(1_000, &bytes, Some(-12.5), 100.0).unwrap();
        assert_eq!(arrival.frame.df, 17);
        assert_eq!(arrival.tick, 1_000);
        assert_eq!(rx.state, ReceiverState::Syncing);
        assert_eq!(rx.messages, 1);
    }

    #[test]
    fn test_on_message_bad_frame_counted() {
        let mut rx = make_receiver(48);
        let mut bytes = hex_decode(DF17).unwrap();
        bytes[5] ^= 0xFF;
        assert!(rx.on_message(1_000, &bytes, None, 100.0).is_err());
        assert_eq!(rx.bad_messages, 1);
        assert_eq!(rx.messages, 0);
    }

    #[test]
    fn test_history_bounded() {
        let mut rx = make_receiver(48);
        let bytes = hex_decode(DF17).unwrap();
        for i in 0..200u64 {
            rx.on_message(1_000 + i * 100, &bytes, None, 100.0 + i as f64 * 0.0001)
                .unwrap();
        }
        assert_eq!(rx.history().count(), 64);
    }

    #[test]
    fn test_rate_limit() {
        let mut rx = make_receiver(48);
        let bytes = hex_decode(DF17).unwrap();
        let mut dropped = 0;
        for i in 0..6000u64 {
            if rx.on_message(1_000 + i, &bytes, None, 100.0).is_err() {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 1000);
        assert_eq!(rx.dropped, 1000);
        // New second, new bucket
        assert!(rx.on_message(10_000, &bytes, None, 101.5).is_ok());
    }

    #[test]
    fn test_epoch_ticks() {
        let mut rx = make_receiver(48);
        let bytes = hex_decode(DF17).unwrap();
        rx.on_message(12_000_000, &bytes, None, 100.0).unwrap();
        // One wall second later = one clock second = 12e6 ticks
        let est = rx.epoch_ticks(101.0).unwrap();
        assert_eq!(est, 24_000_000);
    }

    #[test]
    fn test_silence() {
        let mut rx = make_receiver(48);
        let bytes = hex_decode(DF17).unwrap();
        rx.on_message(1_000, &bytes, None, 100.0).unwrap();
        assert!(!rx.is_silent(110.0));
        assert!(rx.is_silent(140.0));
    }

    #[test]
    fn test_bad_tick_run_drops_receiver() {
        let mut rx = make_receiver(24);
        let bytes = hex_decode(DF17).unwrap();
        rx.on_message(10_000_000, &bytes, None, 100.0).unwrap();
        // A hardware reset sends every subsequent tick backward.
        let mut wall = 100.0;
        for i in 0..3u64 {
            wall += 0.001;
            assert!(rx.on_message(5_000_000 + i, &bytes, None, wall).is_err());
        }
        assert!(rx.should_drop());
    }

    /// DF17 test vector stays CRC-valid (guards the fixture itself).
    #[test]
    fn test_fixture_crc() {
        assert_eq!(crc24(&hex_decode(DF17).unwrap()), 0);
    }
}
