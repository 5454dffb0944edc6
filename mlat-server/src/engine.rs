//! The multilateration engine — owner of all cross-receiver state.
//!
//! One `Engine` holds the receiver registry, the reference decoder, the
//! sync tracker, the clock graph snapshot, the correlator, the solve
//! queue, and the aircraft tracker. Every mutation is synchronous; the
//! async layers (ingest, status, feed) share it behind one lock and only
//! ever call short methods.
//!
//! Pipeline per record: session classifies and un-wraps -> DF17 positions
//! feed the sync tracker -> every arrival feeds the correlator in the
//! anchor timebase. A periodic housekeeping tick closes groups, runs the
//! solver, and evicts the dead.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use mlat_core::adsb::{decode_modes, RefDecoder};
use mlat_core::clock::{ReceiverGeom, SyncTracker, UpdateOutcome};
use mlat_core::config::MlatParams;
use mlat_core::correlator::{ClosedGroup, Correlator, SolveQueue};
use mlat_core::geo::{geodetic_to_ecef, Geodetic};
use mlat_core::graph::ClockGraph;
use mlat_core::receiver::{Receiver, ReceiverState};
use mlat_core::solver::{solve, Fix, SolverInput};
use mlat_core::track::AircraftTracker;
use mlat_core::types::{MlatError, ReceiverId};

/// Solves attempted per housekeeping tick, so the loop never stalls.
const SOLVES_PER_TICK: usize = 16;

// ---------------------------------------------------------------------------
// Coverage bookkeeping
// ---------------------------------------------------------------------------

/// Bounding box of reference positions a receiver has heard.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Coverage {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub sightings: u64,
}

impl Coverage {
    fn observe(&mut self, lat: f64, lon: f64) {
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
        self.min_lon = self.min_lon.min(lon);
        self.max_lon = self.max_lon.max(lon);
        self.sightings += 1;
    }

    fn fresh(lat: f64, lon: f64) -> Self {
        Coverage {
            min_lat: lat,
            max_lat: lat,
            min_lon: lon,
            max_lon: lon,
            sightings: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    params: MlatParams,
    receivers: HashMap<ReceiverId, Receiver>,
    next_id: u32,

    decoder: RefDecoder,
    sync: SyncTracker,
    graph: ClockGraph,
    anchor: Option<ReceiverId>,

    correlator: Correlator,
    solve_queue: SolveQueue,
    tracker: AircraftTracker,
    coverage: HashMap<ReceiverId, Coverage>,

    // Counters for the status snapshot
    pub fixes_emitted: u64,
    pub fixes_gated: u64,
    pub solver_poor_geometry: u64,
    pub solver_not_converged: u64,
    pub solver_high_residual: u64,
    pub solver_out_of_bounds: u64,
}

impl Engine {
    pub fn new(params: MlatParams) -> Self {
        let graph = ClockGraph::rebuild(std::iter::empty(), &params.graph);
        Engine {
            decoder: RefDecoder::new(),
            sync: SyncTracker::new(params.sync.clone()),
            graph,
            anchor: None,
            correlator: Correlator::new(params.correlator.clone()),
            solve_queue: SolveQueue::new(params.correlator.solve_queue_cap),
            tracker: AircraftTracker::new(params.track.clone()),
            coverage: HashMap::new(),
            receivers: HashMap::new(),
            next_id: 0,
            params,
            fixes_emitted: 0,
            fixes_gated: 0,
            solver_poor_geometry: 0,
            solver_not_converged: 0,
            solver_high_residual: 0,
            solver_out_of_bounds: 0,
        }
    }

    // -- registry -------------------------------------------------------

    /// Register a receiver with its surveyed location.
    pub fn register_receiver(
        &mut self,
        name: &str,
        location: Geodetic,
        clock_hz: f64,
        wrap_bits: u32,
    ) -> ReceiverId {
        let id = ReceiverId(self.next_id);
        self.next_id += 1;
        let rx = Receiver::new(
            id,
            name.to_string(),
            geodetic_to_ecef(&location),
            clock_hz,
            wrap_bits,
            self.params.session.clone(),
        );
        info!(receiver = name, id = id.0, "receiver connected");
        self.receivers.insert(id, rx);
        id
    }

    /// Tear down a receiver and everything that references it.
    pub fn remove_receiver(&mut self, id: ReceiverId) {
        if let Some(rx) = self.receivers.remove(&id) {
            info!(receiver = %rx.name, "receiver disconnected");
        }
        self.sync.drop_receiver(id);
        self.correlator.drop_receiver(id);
        self.coverage.remove(&id);
        // Edges incident on the receiver disappear with the next rebuild;
        // do it now so no translation uses them in the meantime.
        self.rebuild_graph();
    }

    pub fn receivers(&self) -> impl Iterator<Item = &Receiver> {
        self.receivers.values()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn anchor(&self) -> Option<ReceiverId> {
        self.anchor
    }

    pub fn sync(&self) -> &SyncTracker {
        &self.sync
    }

    // -- per-record pipeline --------------------------------------------

    /// Ingest one raw record from a receiver.
    ///
    /// Per-message errors are counted and dropped here (DEBUG); a
    /// receiver signalling sustained bad ticks is removed (INFO).
    pub fn on_record(
        &mut self,
        id: ReceiverId,
        tick_raw: u64,
        bytes: &[u8],
        rssi: Option<f64>,
        wall: f64,
    ) {
        let Some(rx) = self.receivers.get_mut(&id) else {
            return;
        };
        let clock_hz = rx.clock_hz;

        let arrival = match rx.on_message(tick_raw, bytes, rssi, wall) {
            Ok(a) => a,
            Err(e) => {
                debug!(receiver = %rx.name, error = %e, "record dropped");
                let should_drop = rx.should_drop();
                if should_drop {
                    info!(receiver = %rx.name, "sustained bad ticks, dropping receiver");
                }
                if should_drop {
                    self.remove_receiver(id);
                }
                return;
            }
        };

        let t_local = arrival.tick as f64 / clock_hz;

        // DF17/18 with a resolved position drives clock sync
        if arrival.frame.is_extended_squitter() {
            if let Some(position) = self.decoder.decode_adsb(&arrival.frame, wall) {
                self.coverage
                    .entry(id)
                    .and_modify(|c| c.observe(position.geodetic.lat_deg, position.geodetic.lon_deg))
                    .or_insert_with(|| {
                        Coverage::fresh(position.geodetic.lat_deg, position.geodetic.lon_deg)
                    });

                let geoms = self.receiver_geoms();
                let outcomes = self.sync.on_reference_sighting(
                    id,
                    t_local,
                    wall,
                    &arrival.frame.raw,
                    &position,
                    &geoms,
                );
                for (key, outcome) in outcomes {
                    if outcome == UpdateOutcome::Reset {
                        warn!(pair = ?key, "clock pair reset");
                    }
                }
            }
        }

        // Every arrival is a candidate MLAT contribution
        let summary = decode_modes(&arrival.frame);
        let Some(anchor) = self.anchor else {
            return; // no usable clock graph yet
        };
        let _ = self.correlator.on_arrival(
            summary.icao,
            &arrival.frame.raw,
            id,
            arrival.tick,
            t_local,
            wall,
            summary.altitude_m,
            &self.graph,
            anchor,
        );
    }

    // -- housekeeping ---------------------------------------------------

    /// Periodic tick: evictions, graph rebuild, group closure, solving.
    /// Returns the fixes accepted this tick.
    pub fn housekeeping(&mut self, now: f64) -> Vec<Fix> {
        // Silent receivers go first so their pairs die with them
        let silent: Vec<ReceiverId> = self
            .receivers
            .values()
            .filter(|rx| rx.last_heard > 0.0 && rx.is_silent(now))
            .map(|rx| rx.id)
            .collect();
        for id in silent {
            info!(id = id.0, "receiver silent, dropping");
            self.remove_receiver(id);
        }

        for key in self.sync.evict_idle(now) {
            debug!(pair = ?key, "pair evicted");
        }

        self.rebuild_graph();
        self.decoder.prune(now);
        self.correlator.prune(now);
        self.tracker.prune(now);
        for rx in self.receivers.values_mut() {
            rx.prune(now);
        }

        for group in self.correlator.close_due(now) {
            self.solve_queue.push(group);
        }

        let mut fixes = Vec::new();
        for _ in 0..SOLVES_PER_TICK {
            let Some(group) = self.solve_queue.pop() else {
                break;
            };
            if let Some(fix) = self.solve_group(group, now) {
                fixes.push(fix);
            }
        }
        fixes
    }

    fn rebuild_graph(&mut self) {
        self.graph = ClockGraph::rebuild(self.sync.pairs(), &self.params.graph);
        // Sticky anchor: open correlator groups hold timestamps in the
        // anchor's frame, so it only changes when it leaves the graph.
        self.anchor = match self.anchor {
            Some(a) if self.graph.contains(a) => Some(a),
            _ => self.graph.select_anchor(),
        };
        for rx in self.receivers.values_mut() {
            if rx.state == ReceiverState::Synced && !self.graph.contains(rx.id) {
                rx.state = ReceiverState::Syncing;
            } else if rx.state == ReceiverState::Syncing && self.graph.contains(rx.id) {
                rx.state = ReceiverState::Synced;
            }
        }
    }

    fn solve_group(&mut self, group: ClosedGroup, now: f64) -> Option<Fix> {
        let inputs: Vec<SolverInput> = group
            .arrivals
            .iter()
            .filter_map(|a| {
                let rx = self.receivers.get(&a.receiver)?;
                let noise = (rx.noise_floor_ns * 1e-9).powi(2);
                Some(SolverInput {
                    receiver: a.receiver,
                    position: rx.position,
                    t: a.t_anchor,
                    variance: a.variance + noise,
                    tick: a.tick,
                })
            })
            .collect();
        if inputs.len() < 3 {
            return None;
        }

        let initial = self.tracker.initial_guess(&group.icao, now);
        match solve(
            group.icao,
            &inputs,
            group.altitude_m,
            initial,
            &self.params.solver,
        ) {
            Ok(fix) => {
                if self.tracker.on_fix(&fix, now) {
                    self.fixes_emitted += 1;
                    Some(fix)
                } else {
                    debug!(icao = ?fix.icao, "fix gated by track history");
                    self.fixes_gated += 1;
                    None
                }
            }
            Err(e) => {
                match e {
                    MlatError::PoorGeometry(_) => self.solver_poor_geometry += 1,
                    MlatError::NotConverged { .. } => self.solver_not_converged += 1,
                    MlatError::HighResidual { .. } => self.solver_high_residual += 1,
                    MlatError::OutOfBounds { .. } => self.solver_out_of_bounds += 1,
                    _ => {}
                }
                debug!(error = %e, "solve failed");
                None
            }
        }
    }

    fn receiver_geoms(&self) -> HashMap<ReceiverId, ReceiverGeom> {
        self.receivers
            .iter()
            .map(|(&id, rx)| {
                (
                    id,
                    ReceiverGeom {
                        position: rx.position,
                        noise_floor_ns: rx.noise_floor_ns,
                    },
                )
            })
            .collect()
    }

    // -- status snapshots -----------------------------------------------

    /// `sync.json`: receiver -> peers -> [n_obs, jitter_ns, rate_ppm].
    pub fn sync_snapshot(&self) -> serde_json::Value {
        let mut by_receiver: HashMap<&str, serde_json::Map<String, serde_json::Value>> =
            HashMap::new();
        for (key, pc) in self.sync.pairs() {
            let (Some(rx_i), Some(rx_j)) =
                (self.receivers.get(&key.i), self.receivers.get(&key.j))
            else {
                continue;
            };
            let entry = serde_json::json!([
                pc.n_obs(),
                pc.jitter_s() * 1e9,
                pc.rate_ppm(),
            ]);
            by_receiver
                .entry(rx_i.name.as_str())
                .or_default()
                .insert(rx_j.name.clone(), entry.clone());
            by_receiver
                .entry(rx_j.name.as_str())
                .or_default()
                .insert(rx_i.name.clone(), entry);
        }

        let mut out = serde_json::Map::new();
        for rx in self.receivers.values() {
            let peers = by_receiver
                .remove(rx.name.as_str())
                .unwrap_or_default();
            out.insert(
                rx.name.clone(),
                serde_json::json!({ "peers": serde_json::Value::Object(peers) }),
            );
        }
        serde_json::Value::Object(out)
    }

    /// `coverage.json`: receiver -> bounding box + sighting count.
    pub fn coverage_snapshot(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (id, cov) in &self.coverage {
            let Some(rx) = self.receivers.get(id) else {
                continue;
            };
            out.insert(rx.name.clone(), serde_json::to_value(cov).unwrap_or_default());
        }
        serde_json::Value::Object(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mlat_core::frame::crc24;
    use mlat_core::geo::{
        ecef_to_geodetic, enu_to_ecef, Ecef, SPEED_OF_LIGHT,
    };
    use mlat_core::types::Icao;

    const ICAO: Icao = [0x4B, 0x17, 0xF2];
    const CLOCK_HZ: f64 = 12e6;
    const FT_PER_M: f64 = 1.0 / 0.3048;

    // -- synthetic frame builders --------------------------------------

    /// CPR-encode a latitude/longitude into the 17-bit even or odd words.
    fn cpr_encode(lat: f64, lon: f64, odd: bool) -> (u32, u32) {
        const NZ: f64 = 15.0;
        const CPR_MAX: f64 = 131_072.0;
        let i = if odd { 1.0 } else { 0.0 };
        let dlat = 360.0 / (4.0 * NZ - i);
        let modulo = |x: f64, y: f64| x - y * (x / y).floor();
        let yz = (CPR_MAX * modulo(lat, dlat) / dlat + 0.5).floor() as u32 & 0x1FFFF;

        let nl = mlat_core::adsb::nl(lat);
        let n_lon = (nl - i as i32).max(1);
        let dlon = 360.0 / n_lon as f64;
        let xz = (CPR_MAX * modulo(lon, dlon) / dlon + 0.5).floor() as u32 & 0x1FFFF;
        (yz, xz)
    }

    /// Sealed DF17 airborne position frame.
    fn df17_frame(icao: Icao, g: &Geodetic, odd: bool) -> Vec<u8> {
        let (cpr_lat, cpr_lon) = cpr_encode(g.lat_deg, g.lon_deg, odd);
        let n = ((g.alt_m * FT_PER_M + 1000.0) / 25.0).round() as u32;
        let alt_code = ((n >> 4) << 5) | (1 << 4) | (n & 0x0F);

        let tc: u8 = 11;
        let mut me = [0u8; 7];
        me[0] = tc << 3;
        me[1] = (alt_code >> 4) as u8;
        me[2] = (((alt_code & 0x0F) as u8) << 4)
            | (if odd { 0x04 } else { 0x00 })
            | ((cpr_lat >> 15) & 0x03) as u8;
        me[3] = ((cpr_lat >> 7) & 0xFF) as u8;
        me[4] = (((cpr_lat & 0x7F) as u8) << 1) | ((cpr_lon >> 16) & 0x01) as u8;
        me[5] = ((cpr_lon >> 8) & 0xFF) as u8;
        me[6] = (cpr_lon & 0xFF) as u8;

        let mut raw = vec![0x8Du8, icao[0], icao[1], icao[2]];
        raw.extend_from_slice(&me);
        raw.extend_from_slice(&[0, 0, 0]);
        let parity = crc24(&raw);
        raw[11] = ((parity >> 16) & 0xFF) as u8;
        raw[12] = ((parity >> 8) & 0xFF) as u8;
        raw[13] = (parity & 0xFF) as u8;
        raw
    }

    /// Sealed DF4 altitude reply (parity overlaid with the ICAO).
    fn df4_frame(icao: Icao, alt_m: f64) -> Vec<u8> {
        let n = ((alt_m * FT_PER_M + 1000.0) / 25.0).round() as u32;
        let ac13 = ((n >> 5) << 7) | (1 << 4) | (((n >> 4) & 1) << 5) | (n & 0x0F);

        let mut raw = vec![0x20u8, 0x00, 0x00, 0x00, 0, 0, 0];
        raw[2] = ((ac13 >> 8) & 0x1F) as u8;
        raw[3] = (ac13 & 0xFF) as u8;
        let parity = crc24(&raw) ^ mlat_core::types::icao_to_u32(&icao);
        raw[4] = ((parity >> 16) & 0xFF) as u8;
        raw[5] = ((parity >> 8) & 0xFF) as u8;
        raw[6] = (parity & 0xFF) as u8;
        raw
    }

    // -- synthetic receiver network ------------------------------------

    struct SimReceiver {
        id: ReceiverId,
        ecef: Ecef,
        /// Clock offset [s] and rate error (dimensionless).
        offset: f64,
        rate: f64,
    }

    impl SimReceiver {
        /// Hardware tick for a reception at true time `t` [s].
        fn tick_at(&self, t: f64) -> u64 {
            let local = t + self.offset + self.rate * t;
            (local * CLOCK_HZ).round() as u64
        }
    }

    fn build_network(engine: &mut Engine) -> Vec<SimReceiver> {
        let origin = Geodetic {
            lat_deg: 47.0,
            lon_deg: 8.0,
            alt_m: 500.0,
        };
        let o = geodetic_to_ecef(&origin);
        let enu = [
            (0.0, 0.0),
            (30_000.0, 0.0),
            (0.0, 30_000.0),
            (15_000.0, 15_000.0),
        ];
        let offsets = [0.0, 1.2345, -0.678, 42.0];
        let rates = [0.0, 15e-6, -8e-6, 3e-6];

        enu.iter()
            .zip(offsets.iter().zip(rates.iter()))
            .enumerate()
            .map(|(k, (&(e, n), (&offset, &rate)))| {
                let ecef = enu_to_ecef(&o, e, n, 0.0);
                let id = engine.register_receiver(
                    &format!("rx{k}"),
                    ecef_to_geodetic(&ecef),
                    CLOCK_HZ,
                    48,
                );
                SimReceiver {
                    id,
                    ecef,
                    offset,
                    rate,
                }
            })
            .collect()
    }

    /// Scenario: four receivers with wildly different clock offsets and
    /// drifts hear one climbing aircraft. After 30 s of DF17 traffic the
    /// pair filters converge and the solver recovers the position.
    #[test]
    fn test_end_to_end_sync_and_solve() {
        let mut engine = Engine::new(MlatParams::default());
        let receivers = build_network(&mut engine);

        let aircraft_base = Geodetic {
            lat_deg: 47.09,
            lon_deg: 8.13,
            alt_m: 3_000.0,
        };

        let mut fixes: Vec<Fix> = Vec::new();
        // Start well past zero so every receiver's local clock (offsets
        // down to -0.678 s) stays positive.
        let mut housekeeping_at = 10.1;
        let wall0 = 1_000_000.0;

        // Two messages per second for 30 seconds
        for k in 0..60u32 {
            let t = 10.0 + k as f64 * 0.5;
            // Climb keeps every payload distinct
            let aircraft = Geodetic {
                alt_m: aircraft_base.alt_m + k as f64 * 8.0,
                ..aircraft_base
            };
            let tx_ecef = geodetic_to_ecef(&aircraft);
            let frame = df17_frame(ICAO, &aircraft, k % 2 == 1);

            for rx in &receivers {
                let t_arrival = t + tx_ecef.distance(&rx.ecef) / SPEED_OF_LIGHT;
                engine.on_record(
                    rx.id,
                    rx.tick_at(t_arrival),
                    &frame,
                    Some(-20.0),
                    wall0 + t_arrival,
                );
            }

            // A DF4 altitude reply alongside every fourth squitter
            if k % 4 == 0 {
                let reply = df4_frame(ICAO, aircraft.alt_m);
                for rx in &receivers {
                    let t_arrival = t + 0.02 + tx_ecef.distance(&rx.ecef) / SPEED_OF_LIGHT;
                    engine.on_record(
                        rx.id,
                        rx.tick_at(t_arrival),
                        &reply,
                        Some(-22.0),
                        wall0 + t_arrival,
                    );
                }
            }

            while housekeeping_at < t {
                fixes.extend(engine.housekeeping(wall0 + housekeeping_at));
                housekeeping_at += 0.1;
            }
        }
        for _ in 0..20 {
            fixes.extend(engine.housekeeping(wall0 + housekeeping_at));
            housekeeping_at += 0.1;
        }

        // Pairs converged: the filters should report the injected
        // offset differences and rates.
        let key = mlat_core::PairKey::new(receivers[0].id, receivers[1].id);
        let pair = engine.sync().pair(&key).expect("pair 0-1 exists");
        assert!(pair.eligible(), "pair 0-1 never matured");
        // The filter tracks delta at its own time: 1.2345 s plus ~40 s of
        // 15 ppm drift.
        assert!(
            (pair.delta() - 1.2345).abs() < 2e-3,
            "pair delta {}",
            pair.delta()
        );
        assert!(
            (pair.rate_ppm() - 15.0).abs() < 2.0,
            "pair rate {} ppm",
            pair.rate_ppm()
        );

        assert!(
            !fixes.is_empty(),
            "no fixes produced (poor_geometry={} not_converged={} high_residual={})",
            engine.solver_poor_geometry,
            engine.solver_not_converged,
            engine.solver_high_residual
        );

        // The last fixes should be near the aircraft's final position
        let last = fixes.last().unwrap();
        let final_pos = geodetic_to_ecef(&Geodetic {
            alt_m: aircraft_base.alt_m + 59.0 * 8.0,
            ..aircraft_base
        });
        let err = last.ecef.distance(&final_pos);
        assert!(err < 200.0, "final fix error {err} m");
        assert_eq!(last.icao, ICAO);
        assert!(last.receiver_count() >= 3);
    }

    #[test]
    fn test_receiver_lifecycle() {
        let mut engine = Engine::new(MlatParams::default());
        let id = engine.register_receiver(
            "short-lived",
            Geodetic {
                lat_deg: 47.0,
                lon_deg: 8.0,
                alt_m: 500.0,
            },
            CLOCK_HZ,
            24,
        );
        assert_eq!(engine.receiver_count(), 1);

        // One frame, then silence past the timeout
        let frame = df17_frame(
            ICAO,
            &Geodetic {
                lat_deg: 47.1,
                lon_deg: 8.1,
                alt_m: 1_000.0,
            },
            false,
        );
        engine.on_record(id, 1_000, &frame, None, 1_000.0);
        engine.housekeeping(1_010.0);
        assert_eq!(engine.receiver_count(), 1);
        engine.housekeeping(1_040.0);
        assert_eq!(engine.receiver_count(), 0, "silent receiver dropped");
    }

    #[test]
    fn test_sync_snapshot_shape() {
        let mut engine = Engine::new(MlatParams::default());
        let receivers = build_network(&mut engine);

        let aircraft = Geodetic {
            lat_deg: 47.09,
            lon_deg: 8.13,
            alt_m: 3_000.0,
        };
        let tx_ecef = geodetic_to_ecef(&aircraft);
        for k in 0..6u32 {
            let t = k as f64 * 0.5;
            let g = Geodetic {
                alt_m: aircraft.alt_m + k as f64 * 8.0,
                ..aircraft
            };
            let frame = df17_frame(ICAO, &g, k % 2 == 1);
            for rx in &receivers {
                let t_arrival = t + tx_ecef.distance(&rx.ecef) / SPEED_OF_LIGHT;
                engine.on_record(rx.id, rx.tick_at(t_arrival), &frame, None, 1e6 + t_arrival);
            }
        }

        let snapshot = engine.sync_snapshot();
        let rx0 = snapshot.get("rx0").expect("rx0 present");
        let peers = rx0.get("peers").unwrap().as_object().unwrap();
        assert!(peers.contains_key("rx1"));
        let entry = peers["rx1"].as_array().unwrap();
        assert_eq!(entry.len(), 3); // [n_obs, jitter_ns, rate_ppm]

        let coverage = engine.coverage_snapshot();
        let c0 = coverage.get("rx0").expect("coverage for rx0");
        assert!(c0.get("sightings").unwrap().as_u64().unwrap() > 0);
    }
}
