//! Transmission correlator — clusters arrivals of the same Mode S
//! message across receivers.
//!
//! Every arrival is translated into the anchor receiver's timebase; the
//! canonical time substitutes for wall-clock ordering, which does not
//! exist across receivers. Arrivals land in an existing group when they
//! fall inside the correlation window and their payload agrees: bit-exact
//! for long frames, Hamming distance <= 1 for short replies (reception
//! noise legitimately flips single bits).

use std::collections::{HashMap, VecDeque};

use crate::config::CorrelatorParams;
use crate::frame::{hamming, SHORT_FRAME_LEN};
use crate::graph::ClockGraph;
use crate::types::{Icao, ReceiverId, Result};

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// One receiver's contribution to a group.
#[derive(Debug, Clone)]
pub struct GroupArrival {
    pub receiver: ReceiverId,
    /// Un-wrapped hardware tick at the receiver.
    pub tick: u64,
    /// Arrival time in the anchor timebase [s].
    pub t_anchor: f64,
    /// Variance of the timebase translation [s^2].
    pub variance: f64,
}

/// An open group: arrivals believed to be one transmission.
#[derive(Debug, Clone)]
pub struct Group {
    pub icao: Icao,
    pub payload: Vec<u8>,
    pub anchor: ReceiverId,
    pub created_wall: f64,
    /// Anchor-frame timestamp of the first arrival.
    pub t_anchor: f64,
    pub arrivals: Vec<GroupArrival>,
}

impl Group {
    pub fn receiver_count(&self) -> usize {
        self.arrivals.len()
    }
}

/// A group past its close deadline, ready for the solver.
#[derive(Debug, Clone)]
pub struct ClosedGroup {
    pub icao: Icao,
    pub payload: Vec<u8>,
    pub anchor: ReceiverId,
    pub arrivals: Vec<GroupArrival>,
    /// Altitude from a recent accompanying Mode S altitude reply [m].
    pub altitude_m: Option<f64>,
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Groups arrivals per aircraft and closes them on a wall-clock deadline.
pub struct Correlator {
    groups: HashMap<Icao, Vec<Group>>,
    /// Last decoded altitude per aircraft: (metres, wall time).
    altitudes: HashMap<Icao, (f64, f64)>,
    params: CorrelatorParams,

    pub no_sync_path: u64,
    pub groups_started: u64,
    pub arrivals_merged: u64,
    pub dropped_small: u64,
}

/// Altitude replies older than this no longer constrain the solve [s].
const ALTITUDE_TTL: f64 = 30.0;

impl Correlator {
    pub fn new(params: CorrelatorParams) -> Self {
        Correlator {
            groups: HashMap::new(),
            altitudes: HashMap::new(),
            params,
            no_sync_path: 0,
            groups_started: 0,
            arrivals_merged: 0,
            dropped_small: 0,
        }
    }

    /// Feed one arrival.
    ///
    /// `t_local` is the arrival in seconds on the receiver's own clock;
    /// `altitude_m` is the altitude decoded from this message, if any.
    /// Fails with `NoSyncPath` when the receiver cannot be translated
    /// into the anchor frame; the arrival still contributes its altitude.
    #[allow(clippy::too_many_arguments)]
    pub fn on_arrival(
        &mut self,
        icao: Icao,
        payload: &[u8],
        receiver: ReceiverId,
        tick: u64,
        t_local: f64,
        wall: f64,
        altitude_m: Option<f64>,
        graph: &ClockGraph,
        anchor: ReceiverId,
    ) -> Result<()> {
        if let Some(alt) = altitude_m {
            self.altitudes.insert(icao, (alt, wall));
        }

        let (t_anchor, variance) = match graph.translate(t_local, receiver, anchor) {
            Ok(tv) => tv,
            Err(e) => {
                self.no_sync_path += 1;
                return Err(e);
            }
        };

        let window = self.params.window_s;
        let tolerance = self.params.short_hamming_tolerance;
        let groups = self.groups.entry(icao).or_default();

        let matched = groups.iter_mut().find(|g| {
            (t_anchor - g.t_anchor).abs() <= window
                && payload_matches(payload, &g.payload, tolerance)
                && !g.arrivals.iter().any(|a| a.receiver == receiver)
        });

        let arrival = GroupArrival {
            receiver,
            tick,
            t_anchor,
            variance,
        };

        match matched {
            Some(g) => {
                g.arrivals.push(arrival);
                self.arrivals_merged += 1;
            }
            None => {
                if groups.len() == self.params.max_groups_per_icao {
                    groups.remove(0);
                }
                groups.push(Group {
                    icao,
                    payload: payload.to_vec(),
                    anchor,
                    created_wall: wall,
                    t_anchor,
                    arrivals: vec![arrival],
                });
                self.groups_started += 1;
            }
        }
        Ok(())
    }

    /// Close groups past the deadline. Groups heard by at least three
    /// distinct receivers go to the solver; smaller ones are discarded.
    pub fn close_due(&mut self, now: f64) -> Vec<ClosedGroup> {
        let close_delay = self.params.close_delay_s;
        let mut closed = Vec::new();

        for (icao, groups) in &mut self.groups {
            let mut remaining = Vec::with_capacity(groups.len());
            for g in groups.drain(..) {
                if now - g.created_wall <= close_delay {
                    remaining.push(g);
                    continue;
                }
                if g.receiver_count() >= 3 {
                    let altitude_m = self
                        .altitudes
                        .get(icao)
                        .filter(|&&(_, w)| now - w <= ALTITUDE_TTL)
                        .map(|&(alt, _)| alt);
                    closed.push(ClosedGroup {
                        icao: g.icao,
                        payload: g.payload,
                        anchor: g.anchor,
                        arrivals: g.arrivals,
                        altitude_m,
                    });
                } else {
                    self.dropped_small += 1;
                }
            }
            *groups = remaining;
        }
        self.groups.retain(|_, v| !v.is_empty());
        closed
    }

    /// A disconnected receiver's pending contributions are invalid; the
    /// groups themselves stay open for the remaining receivers.
    pub fn drop_receiver(&mut self, receiver: ReceiverId) {
        for groups in self.groups.values_mut() {
            for g in groups.iter_mut() {
                g.arrivals.retain(|a| a.receiver != receiver);
            }
            groups.retain(|g| !g.arrivals.is_empty());
        }
        self.groups.retain(|_, v| !v.is_empty());
    }

    /// Forget per-aircraft altitude state that has aged out.
    pub fn prune(&mut self, now: f64) {
        self.altitudes.retain(|_, &mut (_, w)| now - w <= ALTITUDE_TTL);
    }

    pub fn open_groups(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

fn payload_matches(a: &[u8], b: &[u8], short_tolerance: u32) -> bool {
    if a.len() != b.len() {
        return false;
    }
    if a.len() == SHORT_FRAME_LEN {
        hamming(a, b) <= short_tolerance
    } else {
        a == b
    }
}

// ---------------------------------------------------------------------------
// Solve queue
// ---------------------------------------------------------------------------

/// Bounded queue of closed groups awaiting the solver.
///
/// When full, the fewest-receiver group goes first: it carries the least
/// geometry.
pub struct SolveQueue {
    queue: VecDeque<ClosedGroup>,
    cap: usize,
    pub dropped: u64,
}

impl SolveQueue {
    pub fn new(cap: usize) -> Self {
        SolveQueue {
            queue: VecDeque::with_capacity(cap),
            cap,
            dropped: 0,
        }
    }

    pub fn push(&mut self, group: ClosedGroup) {
        if self.queue.len() < self.cap {
            self.queue.push_back(group);
            return;
        }
        // Full: evict the weakest group if the newcomer is stronger
        let (weakest_idx, weakest_n) = self
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, g)| g.arrivals.len())
            .map(|(i, g)| (i, g.arrivals.len()))
            .expect("queue is full, therefore non-empty");
        if group.arrivals.len() > weakest_n {
            self.queue.remove(weakest_idx);
            self.queue.push_back(group);
        }
        self.dropped += 1;
    }

    pub fn pop(&mut self) -> Option<ClosedGroup> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{PairClock, PairKey};
    use crate::config::{GraphParams, SyncParams};

    const A: ReceiverId = ReceiverId(0); // anchor
    const ICAO1: Icao = [0xAA, 0x00, 0x01];
    const ICAO2: Icao = [0xBB, 0x00, 0x02];

    /// Graph where receivers 1..n all have a zero-offset pair with the
    /// anchor receiver 0.
    fn star_graph(n: u32) -> (Vec<(PairKey, PairClock)>, ClockGraph) {
        let pairs: Vec<(PairKey, PairClock)> = (1..=n)
            .map(|k| {
                let mut pc = PairClock::new(SyncParams::default());
                for i in 0..10 {
                    pc.update(i as f64, 0.0, 1e-15, 100.0 + i as f64);
                }
                (PairKey::new(A, ReceiverId(k)), pc)
            })
            .collect();
        let graph = ClockGraph::rebuild(
            pairs.iter().map(|(k, p)| (k, p)),
            &GraphParams::default(),
        );
        (pairs, graph)
    }

    fn long_payload(tag: u8) -> Vec<u8> {
        let mut p = vec![0x8D; 14];
        p[13] = tag;
        p
    }

    #[test]
    fn test_same_transmission_groups() {
        let (_p, graph) = star_graph(3);
        let mut c = Correlator::new(CorrelatorParams::default());
        let payload = long_payload(1);

        for k in 0..4u32 {
            c.on_arrival(
                ICAO1,
                &payload,
                ReceiverId(k),
                1000 + k as u64,
                50.0 + k as f64 * 50e-6, // spread by propagation, well within 2 ms
                100.0,
                None,
                &graph,
                A,
            )
            .unwrap();
        }
        assert_eq!(c.open_groups(), 1);
        assert_eq!(c.groups_started, 1);
        assert_eq!(c.arrivals_merged, 3);

        let closed = c.close_due(100.6);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].arrivals.len(), 4);
    }

    #[test]
    fn test_different_icao_never_groups() {
        let (_p, graph) = star_graph(2);
        let mut c = Correlator::new(CorrelatorParams::default());
        let payload = long_payload(1);

        c.on_arrival(ICAO1, &payload, A, 1, 50.0, 100.0, None, &graph, A)
            .unwrap();
        c.on_arrival(ICAO2, &payload, ReceiverId(1), 2, 50.0, 100.0, None, &graph, A)
            .unwrap();
        assert_eq!(c.open_groups(), 2);
    }

    #[test]
    fn test_transmissions_apart_form_groups() {
        let (_p, graph) = star_graph(1);
        let mut c = Correlator::new(CorrelatorParams::default());
        let payload = long_payload(1);

        c.on_arrival(ICAO1, &payload, A, 1, 50.0, 100.0, None, &graph, A)
            .unwrap();
        // 5 ms later: outside the 2 ms window, new transmission
        c.on_arrival(ICAO1, &payload, ReceiverId(1), 2, 50.005, 100.0, None, &graph, A)
            .unwrap();
        assert_eq!(c.open_groups(), 2);
    }

    #[test]
    fn test_noise_copy_rejected() {
        // Five arrivals; one is a Hamming-distance-4 noise copy of a
        // short reply. It starts its own group which dies at close time,
        // leaving the solver the four clean arrivals.
        let (_p, graph) = star_graph(4);
        let mut c = Correlator::new(CorrelatorParams::default());
        let clean: Vec<u8> = vec![0x28, 0x00, 0x05, 0x30, 0xAB, 0xCD, 0xEF];
        let mut noisy = clean.clone();
        noisy[4] ^= 0x0F; // 4 flipped bits

        for k in 0..4u32 {
            c.on_arrival(ICAO1, &clean, ReceiverId(k), 1, 50.0, 100.0, None, &graph, A)
                .unwrap();
        }
        c.on_arrival(ICAO1, &noisy, ReceiverId(4), 1, 50.0, 100.0, None, &graph, A)
            .unwrap();
        assert_eq!(c.open_groups(), 2);

        let closed = c.close_due(100.6);
        assert_eq!(closed.len(), 1, "noise group dies below 3 receivers");
        assert_eq!(closed[0].arrivals.len(), 4);
        assert_eq!(c.dropped_small, 1);
    }

    #[test]
    fn test_single_bit_noise_accepted_on_short() {
        let (_p, graph) = star_graph(1);
        let mut c = Correlator::new(CorrelatorParams::default());
        let clean: Vec<u8> = vec![0x28, 0x00, 0x05, 0x30, 0xAB, 0xCD, 0xEF];
        let mut one_bit = clean.clone();
        one_bit[4] ^= 0x01;

        c.on_arrival(ICAO1, &clean, A, 1, 50.0, 100.0, None, &graph, A)
            .unwrap();
        c.on_arrival(ICAO1, &one_bit, ReceiverId(1), 2, 50.0, 100.0, None, &graph, A)
            .unwrap();
        assert_eq!(c.open_groups(), 1);
    }

    #[test]
    fn test_long_frames_require_exact_match() {
        let (_p, graph) = star_graph(1);
        let mut c = Correlator::new(CorrelatorParams::default());
        let a = long_payload(0);
        let mut b = a.clone();
        b[5] ^= 0x01; // single bit, but long frames must match exactly

        c.on_arrival(ICAO1, &a, A, 1, 50.0, 100.0, None, &graph, A).unwrap();
        c.on_arrival(ICAO1, &b, ReceiverId(1), 2, 50.0, 100.0, None, &graph, A)
            .unwrap();
        assert_eq!(c.open_groups(), 2);
    }

    #[test]
    fn test_receiver_disconnect_mid_group() {
        let (_p, graph) = star_graph(3);
        let mut c = Correlator::new(CorrelatorParams::default());
        let payload = long_payload(1);

        for k in 0..4u32 {
            c.on_arrival(ICAO1, &payload, ReceiverId(k), 1, 50.0, 100.0, None, &graph, A)
                .unwrap();
        }
        c.drop_receiver(ReceiverId(2));

        let closed = c.close_due(100.6);
        assert_eq!(closed.len(), 1, "group survives with 3 receivers");
        assert_eq!(closed[0].arrivals.len(), 3);
        assert!(closed[0].arrivals.iter().all(|a| a.receiver != ReceiverId(2)));
    }

    #[test]
    fn test_altitude_attached_when_fresh() {
        let (_p, graph) = star_graph(2);
        let mut c = Correlator::new(CorrelatorParams::default());
        let payload = long_payload(1);

        // A short altitude reply first
        c.on_arrival(
            ICAO1,
            &[0x20u8; 7],
            A,
            1,
            49.0,
            99.0,
            Some(3000.0),
            &graph,
            A,
        )
        .unwrap();
        for k in 0..3u32 {
            c.on_arrival(ICAO1, &payload, ReceiverId(k), 2, 50.0, 100.0, None, &graph, A)
                .unwrap();
        }
        let closed = c.close_due(100.6);
        let with_alt = closed.iter().find(|g| g.arrivals.len() == 3).unwrap();
        assert_eq!(with_alt.altitude_m, Some(3000.0));
    }

    #[test]
    fn test_queue_priority_drop() {
        let mut q = SolveQueue::new(2);
        let mk = |n: usize| ClosedGroup {
            icao: ICAO1,
            payload: long_payload(0),
            anchor: A,
            arrivals: (0..n)
                .map(|k| GroupArrival {
                    receiver: ReceiverId(k as u32),
                    tick: 0,
                    t_anchor: 0.0,
                    variance: 0.0,
                })
                .collect(),
            altitude_m: None,
        };
        q.push(mk(3));
        q.push(mk(4));
        assert_eq!(q.len(), 2);

        // Queue full: a 5-receiver group displaces the 3-receiver one
        q.push(mk(5));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped, 1);
        let sizes: Vec<usize> = std::iter::from_fn(|| q.pop())
            .map(|g| g.arrivals.len())
            .collect();
        assert!(sizes.contains(&4) && sizes.contains(&5));
    }

    #[test]
    fn test_queue_drops_weak_newcomer() {
        let mut q = SolveQueue::new(1);
        let mk = |n: usize| ClosedGroup {
            icao: ICAO1,
            payload: long_payload(0),
            anchor: A,
            arrivals: (0..n)
                .map(|k| GroupArrival {
                    receiver: ReceiverId(k as u32),
                    tick: 0,
                    t_anchor: 0.0,
                    variance: 0.0,
                })
                .collect(),
            altitude_m: None,
        };
        q.push(mk(5));
        q.push(mk(3));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap().arrivals.len(), 5);
    }
}
