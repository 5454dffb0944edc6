//! Pair clock synchronization.
//!
//! For every unordered pair of receivers that hear the same DF17 position
//! squitter, the transmitter position is known from the ADS-B decode, so
//! the propagation delays to both antennas can be subtracted out. What is
//! left is a direct measurement of the relative clock offset between the
//! two receivers at the moment of transmission:
//!
//!     z = (t_j - tau_j) - (t_i - tau_i)
//!
//! independent of the unknown transmission time. A two-state Kalman filter
//! per pair tracks (offset, rate) through these opportunistic observations.

use std::collections::{HashMap, VecDeque};

use crate::adsb::{nuc_horizontal_sigma_m, RefPosition};
use crate::config::SyncParams;
use crate::geo::{Ecef, SPEED_OF_LIGHT};
use crate::types::{Icao, ReceiverId};

// ---------------------------------------------------------------------------
// Pair key
// ---------------------------------------------------------------------------

/// Unordered receiver pair, normalized so `i < j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub i: ReceiverId,
    pub j: ReceiverId,
}

impl PairKey {
    pub fn new(a: ReceiverId, b: ReceiverId) -> Self {
        if a < b {
            PairKey { i: a, j: b }
        } else {
            PairKey { i: b, j: a }
        }
    }

    pub fn touches(&self, id: ReceiverId) -> bool {
        self.i == id || self.j == id
    }

    /// The other end of the pair, if `id` is one of them.
    pub fn peer(&self, id: ReceiverId) -> Option<ReceiverId> {
        if self.i == id {
            Some(self.j)
        } else if self.j == id {
            Some(self.i)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Pair filter
// ---------------------------------------------------------------------------

/// Filter phase: wide-prior bootstrap, then tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Bootstrap,
    Tracking,
}

/// What one observation did to the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted,
    /// Innovation gate rejection.
    Rejected,
    /// Geometry contradiction or rejection run; filter is back in bootstrap.
    Reset,
}

/// Two-state Kalman filter over one receiver pair's relative clock.
///
/// State: offset delta [s] such that `t_j ~= t_i + delta`, and the
/// dimensionless relative rate. All timestamps are seconds on receiver
/// i's clock.
#[derive(Debug)]
pub struct PairClock {
    state: PairState,
    delta: f64,
    rate: f64,
    p: [[f64; 2]; 2],
    /// Filter time of the last processed observation (i's clock).
    last_obs_t: Option<f64>,
    pub last_update_wall: f64,
    n_obs: u32,
    consecutive_rejects: u32,
    /// Accepted innovations for the robust jitter estimate.
    innovations: VecDeque<f64>,
    /// Wall times of accepted observations inside the bootstrap window.
    bootstrap_accepts: VecDeque<f64>,
    params: SyncParams,
}

impl PairClock {
    pub fn new(params: SyncParams) -> Self {
        let mut pc = PairClock {
            state: PairState::Bootstrap,
            delta: 0.0,
            rate: 0.0,
            p: [[0.0; 2]; 2],
            last_obs_t: None,
            last_update_wall: 0.0,
            n_obs: 0,
            consecutive_rejects: 0,
            innovations: VecDeque::new(),
            bootstrap_accepts: VecDeque::new(),
            params,
        };
        pc.apply_prior();
        pc
    }

    fn apply_prior(&mut self) {
        self.delta = 0.0;
        self.rate = 0.0;
        self.p = [[1.0, 0.0], [0.0, 1e-6]];
    }

    /// Back to bootstrap with the wide prior.
    pub fn reset(&mut self) {
        self.state = PairState::Bootstrap;
        self.apply_prior();
        self.last_obs_t = None;
        self.n_obs = 0;
        self.consecutive_rejects = 0;
        self.innovations.clear();
        self.bootstrap_accepts.clear();
    }

    /// Time update to `t` (seconds on i's clock).
    fn predict(&mut self, t: f64) {
        let dt = match self.last_obs_t {
            Some(last) => (t - last).max(0.0),
            None => 0.0,
        };
        if dt == 0.0 {
            return;
        }

        self.delta += self.rate * dt;

        // P <- F P F' + Q, F = [[1, dt], [0, 1]]
        let [[p00, p01], [p10, p11]] = self.p;
        self.p = [
            [p00 + dt * (p01 + p10) + dt * dt * p11, p01 + dt * p11],
            [p10 + dt * p11, p11],
        ];
        self.p[0][0] += self.params.sigma_offset_per_s.powi(2) * dt;
        self.p[1][1] += self.params.sigma_rate_per_s.powi(2) * dt;
    }

    /// Measurement update with observation `z` at filter time `t`.
    pub fn update(&mut self, t: f64, z: f64, r_var: f64, wall: f64) -> UpdateOutcome {
        self.predict(t);
        self.last_obs_t = Some(t);
        self.last_update_wall = wall;

        if self.n_obs == 0 {
            // Free-running SDR clocks start with arbitrary epochs, so the
            // offset can be anything; the first observation sets it and
            // the wide prior covers the rest.
            self.delta = z;
        }

        let y = z - self.delta;

        if self.state == PairState::Tracking && y.abs() > self.params.max_observation_s {
            // Geometry contradiction, not a noise event
            self.reset();
            return UpdateOutcome::Reset;
        }

        let s = self.p[0][0] + r_var;

        if y * y > self.params.gate_sigma.powi(2) * s {
            self.consecutive_rejects += 1;
            if self.consecutive_rejects >= self.params.max_consecutive_rejects {
                self.reset();
                return UpdateOutcome::Reset;
            }
            return UpdateOutcome::Rejected;
        }

        let [[p00, p01], [p10, p11]] = self.p;
        let k0 = p00 / s;
        let k1 = p10 / s;
        self.delta += k0 * y;
        self.rate += k1 * y;
        self.p = [
            [p00 - k0 * p00, p01 - k0 * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];

        self.consecutive_rejects = 0;
        self.n_obs += 1;

        if self.innovations.len() == self.params.jitter_window {
            self.innovations.pop_front();
        }
        self.innovations.push_back(y);

        if self.state == PairState::Bootstrap {
            self.bootstrap_accepts.push_back(wall);
            let cutoff = wall - self.params.bootstrap_window_s;
            while self.bootstrap_accepts.front().is_some_and(|&w| w < cutoff) {
                self.bootstrap_accepts.pop_front();
            }
            if self.bootstrap_accepts.len() as u32 >= self.params.bootstrap_obs {
                self.state = PairState::Tracking;
            }
        }

        UpdateOutcome::Accepted
    }

    /// Translate a timestamp on i's clock into j's clock: `(t_j, variance)`.
    pub fn translate(&self, t_i: f64) -> (f64, f64) {
        let dt = t_i - self.last_obs_t.unwrap_or(t_i);
        let t_j = t_i + self.delta + self.rate * dt;
        (t_j, self.offset_variance_at(dt))
    }

    /// Translate a timestamp on j's clock into i's clock.
    ///
    /// Solves `t_i = t_j - delta(t_i)` exactly; the offset can be tens of
    /// seconds, so evaluating the rate term at t_j would not do.
    pub fn translate_rev(&self, t_j: f64) -> (f64, f64) {
        let last = self.last_obs_t.unwrap_or(t_j);
        let t_i = (t_j - self.delta + self.rate * last) / (1.0 + self.rate);
        (t_i, self.offset_variance_at(t_i - last))
    }

    /// Predicted offset variance `dt` seconds past the last observation.
    fn offset_variance_at(&self, dt: f64) -> f64 {
        let dt = dt.max(0.0);
        let [[p00, p01], [p10, p11]] = self.p;
        p00 + dt * (p01 + p10) + dt * dt * p11 + self.params.sigma_offset_per_s.powi(2) * dt
    }

    /// Robust jitter estimate: 1.4826 x MAD over accepted innovations.
    /// Falls back to the filter sigma before enough samples exist.
    pub fn jitter_s(&self) -> f64 {
        if self.innovations.len() < 4 {
            return self.sigma().max(1e-8);
        }
        let mut v: Vec<f64> = self.innovations.iter().copied().collect();
        let med = median(&mut v);
        let mut dev: Vec<f64> = self.innovations.iter().map(|&x| (x - med).abs()).collect();
        (1.4826 * median(&mut dev)).max(1e-9)
    }

    pub fn sigma(&self) -> f64 {
        self.p[0][0].max(0.0).sqrt()
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn rate_ppm(&self) -> f64 {
        self.rate * 1e6
    }

    pub fn n_obs(&self) -> u32 {
        self.n_obs
    }

    /// Filter time of the last processed observation (i's clock).
    pub fn last_obs_t(&self) -> Option<f64> {
        self.last_obs_t
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Mature enough to appear in the clock graph.
    pub fn eligible(&self) -> bool {
        self.state == PairState::Tracking && self.n_obs >= self.params.min_obs_for_graph
    }
}

fn median(v: &mut [f64]) -> f64 {
    v.sort_by(f64::total_cmp);
    let n = v.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        v[n / 2]
    } else {
        (v[n / 2 - 1] + v[n / 2]) / 2.0
    }
}

// ---------------------------------------------------------------------------
// Observation construction
// ---------------------------------------------------------------------------

/// Geometry a sync observation needs about each receiver.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverGeom {
    pub position: Ecef,
    pub noise_floor_ns: f64,
}

/// One receiver's sighting of a position-bearing squitter.
#[derive(Debug, Clone)]
pub struct RefSighting {
    pub icao: Icao,
    pub payload: Vec<u8>,
    /// Arrival time, seconds on the receiver's own clock.
    pub t_local: f64,
    pub wall: f64,
    /// ADS-B-decoded transmitter position.
    pub tx: Ecef,
    pub nuc: u8,
}

/// Build the geometry-corrected pair observation from two sightings of
/// the same transmission.
///
/// Returns `(z, t_i_corrected, r_var)`: the measured offset, the filter
/// time (transmission moment on i's clock), and the measurement variance.
pub fn pair_observation(
    si: &RefSighting,
    gi: &ReceiverGeom,
    sj: &RefSighting,
    gj: &ReceiverGeom,
    params: &SyncParams,
) -> (f64, f64, f64) {
    let tau_i = gi.position.distance(&si.tx) / SPEED_OF_LIGHT;
    let tau_j = gj.position.distance(&sj.tx) / SPEED_OF_LIGHT;

    let z = (sj.t_local - tau_j) - (si.t_local - tau_i);
    let t_i = si.t_local - tau_i;

    // Transmitter position error maps into z through the difference of
    // the unit vectors toward the two antennas.
    let u_i = (gi.position - si.tx).unit();
    let u_j = (gj.position - sj.tx).unit();
    let geom_gain = (u_i - u_j).norm();
    let sigma_pos = nuc_horizontal_sigma_m(si.nuc.min(sj.nuc));
    let geom_var = (geom_gain * sigma_pos / SPEED_OF_LIGHT).powi(2);

    let floor = (params.noise_floor_ns2
        + gi.noise_floor_ns.powi(2)
        + gj.noise_floor_ns.powi(2))
        * 1e-18;

    (z, t_i, geom_var + floor)
}

// ---------------------------------------------------------------------------
// Sync tracker
// ---------------------------------------------------------------------------

/// All pair filters plus the per-receiver sighting rings that feed them.
pub struct SyncTracker {
    params: SyncParams,
    pairs: HashMap<PairKey, PairClock>,
    recent: HashMap<ReceiverId, VecDeque<RefSighting>>,
    pub observations: u64,
    pub resets: u64,
}

impl SyncTracker {
    pub fn new(params: SyncParams) -> Self {
        SyncTracker {
            params,
            pairs: HashMap::new(),
            recent: HashMap::new(),
            observations: 0,
            resets: 0,
        }
    }

    /// Feed one reference sighting; updates every pair the sighting
    /// completes. Returns the outcomes for logging.
    pub fn on_reference_sighting(
        &mut self,
        rx: ReceiverId,
        t_local: f64,
        wall: f64,
        payload: &[u8],
        position: &RefPosition,
        geoms: &HashMap<ReceiverId, ReceiverGeom>,
    ) -> Vec<(PairKey, UpdateOutcome)> {
        let sighting = RefSighting {
            icao: position.icao,
            payload: payload.to_vec(),
            t_local,
            wall,
            tx: position.ecef,
            nuc: position.nuc,
        };

        let mut outcomes = Vec::new();
        let Some(g_rx) = geoms.get(&rx) else {
            return outcomes;
        };

        for (&other, ring) in &self.recent {
            if other == rx {
                continue;
            }
            let Some(g_other) = geoms.get(&other) else {
                continue;
            };
            // Most recent matching sighting wins
            let m = ring.iter().rev().find(|s| {
                s.icao == sighting.icao
                    && s.payload == sighting.payload
                    && (wall - s.wall).abs() <= self.params.pairing_window_s
            });
            let Some(m) = m else { continue };

            let key = PairKey::new(rx, other);
            let (z, t_i, r_var) = if key.i == rx {
                pair_observation(&sighting, g_rx, m, g_other, &self.params)
            } else {
                pair_observation(m, g_other, &sighting, g_rx, &self.params)
            };

            let pair = self
                .pairs
                .entry(key)
                .or_insert_with(|| PairClock::new(self.params.clone()));
            let outcome = pair.update(t_i, z, r_var, wall);
            self.observations += 1;
            if outcome == UpdateOutcome::Reset {
                self.resets += 1;
            }
            outcomes.push((key, outcome));
        }

        let ring = self.recent.entry(rx).or_default();
        if ring.len() == self.params.sighting_ring {
            ring.pop_front();
        }
        ring.push_back(sighting);

        outcomes
    }

    /// Evict pairs with no update in the idle timeout. Returns the evicted keys.
    pub fn evict_idle(&mut self, now: f64) -> Vec<PairKey> {
        let timeout = self.params.pair_idle_timeout_s;
        let dead: Vec<PairKey> = self
            .pairs
            .iter()
            .filter(|(_, pc)| now - pc.last_update_wall > timeout)
            .map(|(&k, _)| k)
            .collect();
        for k in &dead {
            self.pairs.remove(k);
        }
        dead
    }

    /// Remove everything touching a dead receiver.
    pub fn drop_receiver(&mut self, id: ReceiverId) {
        self.pairs.retain(|k, _| !k.touches(id));
        self.recent.remove(&id);
    }

    pub fn pair(&self, key: &PairKey) -> Option<&PairClock> {
        self.pairs.get(key)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&PairKey, &PairClock)> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
