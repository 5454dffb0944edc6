//! Per-aircraft smoother over successive position fixes.
//!
//! A constant-velocity Kalman filter in ECEF (position + velocity blocks,
//! all covariance arithmetic on 3x3 blocks). It supplies initial guesses
//! back to the solver and gates fixes that disagree with recent history.

use std::collections::HashMap;

use crate::config::TrackParams;
use crate::geo::Ecef;
use crate::linalg::{mat3_inv, mat3_mul, mat3_vec, Mat3};
use crate::solver::Fix;
use crate::types::Icao;

const ZERO3: Mat3 = [[0.0; 3]; 3];

fn eye(scale: f64) -> Mat3 {
    let mut m = ZERO3;
    m[0][0] = scale;
    m[1][1] = scale;
    m[2][2] = scale;
    m
}

fn add(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = ZERO3;
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = a[i][j] + b[i][j];
        }
    }
    out
}

fn sub(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = ZERO3;
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = a[i][j] - b[i][j];
        }
    }
    out
}

fn scale(a: &Mat3, k: f64) -> Mat3 {
    let mut out = *a;
    for row in out.iter_mut() {
        for cell in row.iter_mut() {
            *cell *= k;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Single track
// ---------------------------------------------------------------------------

/// Constant-velocity state for one aircraft.
#[derive(Debug, Clone)]
pub struct Track {
    pub position: Ecef,
    pub velocity: Ecef,
    // Covariance blocks: [[pp, pv], [vp, vv]]
    p_pp: Mat3,
    p_pv: Mat3,
    p_vp: Mat3,
    p_vv: Mat3,
    pub last_update: f64,
    pub n_fixes: u32,
}

impl Track {
    fn new(fix: &Fix, wall: f64) -> Self {
        Track {
            position: fix.ecef,
            velocity: Ecef::default(),
            p_pp: fix.covariance,
            p_pv: ZERO3,
            p_vp: ZERO3,
            // Anything from parked to supersonic
            p_vv: eye(300.0 * 300.0),
            last_update: wall,
            n_fixes: 1,
        }
    }

    fn predict(&mut self, dt: f64, accel_sigma: f64) {
        if dt <= 0.0 {
            return;
        }
        self.position = self.position + self.velocity.scaled(dt);

        let pp = add(
            &add(&self.p_pp, &scale(&add(&self.p_pv, &self.p_vp), dt)),
            &scale(&self.p_vv, dt * dt),
        );
        let pv = add(&self.p_pv, &scale(&self.p_vv, dt));
        let vp = add(&self.p_vp, &scale(&self.p_vv, dt));

        let q = accel_sigma * accel_sigma;
        self.p_pp = add(&pp, &eye(q * dt.powi(4) / 4.0));
        self.p_pv = add(&pv, &eye(q * dt.powi(3) / 2.0));
        self.p_vp = add(&vp, &eye(q * dt.powi(3) / 2.0));
        self.p_vv = add(&self.p_vv, &eye(q * dt * dt));
    }

    /// Measurement update; `false` means the fix failed the gate.
    fn update(&mut self, fix: &Fix, wall: f64, gate_sigma: f64) -> bool {
        let y = fix.ecef - self.position;
        let s = add(&self.p_pp, &fix.covariance);
        let Some(s_inv) = mat3_inv(&s) else {
            return false;
        };

        let yv = [y.x, y.y, y.z];
        let siy = mat3_vec(&s_inv, &yv);
        let d2 = yv[0] * siy[0] + yv[1] * siy[1] + yv[2] * siy[2];
        if d2 > gate_sigma * gate_sigma {
            return false;
        }

        let k_p = mat3_mul(&self.p_pp, &s_inv);
        let k_v = mat3_mul(&self.p_vp, &s_inv);

        let dp = mat3_vec(&k_p, &yv);
        let dv = mat3_vec(&k_v, &yv);
        self.position = self.position + Ecef::new(dp[0], dp[1], dp[2]);
        self.velocity = self.velocity + Ecef::new(dv[0], dv[1], dv[2]);

        let (pp, pv, vp, vv) = (self.p_pp, self.p_pv, self.p_vp, self.p_vv);
        self.p_pp = sub(&pp, &mat3_mul(&k_p, &pp));
        self.p_pv = sub(&pv, &mat3_mul(&k_p, &pv));
        self.p_vp = sub(&vp, &mat3_mul(&k_v, &pp));
        self.p_vv = sub(&vv, &mat3_mul(&k_v, &pv));

        self.last_update = wall;
        self.n_fixes += 1;
        true
    }

    /// Dead-reckoned position `dt` seconds past the last update.
    pub fn extrapolate(&self, dt: f64) -> Ecef {
        self.position + self.velocity.scaled(dt.max(0.0))
    }

    pub fn speed_mps(&self) -> f64 {
        self.velocity.norm()
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// All aircraft tracks, keyed by ICAO address.
pub struct AircraftTracker {
    tracks: HashMap<Icao, Track>,
    params: TrackParams,
    pub fixes_accepted: u64,
    pub fixes_gated: u64,
}

impl AircraftTracker {
    pub fn new(params: TrackParams) -> Self {
        AircraftTracker {
            tracks: HashMap::new(),
            params,
            fixes_accepted: 0,
            fixes_gated: 0,
        }
    }

    /// Fold a solver fix into the aircraft's track.
    ///
    /// Returns `false` when the fix is inconsistent with recent history
    /// (Mahalanobis gate); the caller treats it as suspect.
    pub fn on_fix(&mut self, fix: &Fix, wall: f64) -> bool {
        match self.tracks.get_mut(&fix.icao) {
            None => {
                self.tracks.insert(fix.icao, Track::new(fix, wall));
                self.fixes_accepted += 1;
                true
            }
            Some(track) => {
                track.predict(wall - track.last_update, self.params.accel_sigma);
                if track.update(fix, wall, self.params.gate_sigma) {
                    self.fixes_accepted += 1;
                    true
                } else {
                    self.fixes_gated += 1;
                    false
                }
            }
        }
    }

    /// Recent-history initial guess for the solver, when fresh enough.
    pub fn initial_guess(&self, icao: &Icao, now: f64) -> Option<Ecef> {
        let track = self.tracks.get(icao)?;
        let age = now - track.last_update;
        if age > self.params.guess_max_age_s {
            return None;
        }
        Some(track.extrapolate(age))
    }

    pub fn get(&self, icao: &Icao) -> Option<&Track> {
        self.tracks.get(icao)
    }

    /// Drop tracks silent past the timeout. Returns how many went.
    pub fn prune(&mut self, now: f64) -> usize {
        let timeout = self.params.timeout_s;
        let before = self.tracks.len();
        self.tracks.retain(|_, t| now - t.last_update <= timeout);
        before - self.tracks.len()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
