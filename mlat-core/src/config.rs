//! Tunable parameters for every pipeline stage, with working defaults.
//!
//! Everything here is a plain value object; the server layer decides where
//! overrides come from (config file, CLI flags).

use std::time::Duration;

// ---------------------------------------------------------------------------
// Receiver sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Most recent arrivals kept per receiver.
    pub history_len: usize,
    /// Messages per second accepted before dropping.
    pub rate_limit_per_s: u32,
    /// Receiver dropped after this much silence [s].
    pub silence_timeout_s: f64,
    /// Wall-clock gap that resets the tick un-wrap [s].
    pub unwrap_reset_gap_s: f64,
    /// Sustained bad ticks before the receiver is dropped.
    pub max_bad_ticks: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            history_len: 64,
            rate_limit_per_s: 5000,
            silence_timeout_s: 30.0,
            unwrap_reset_gap_s: 1.0,
            max_bad_ticks: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Pair clock sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Wall-clock proximity for pairing two sightings of one squitter [s].
    pub pairing_window_s: f64,
    /// Offset random walk [s per sqrt(s)].
    pub sigma_offset_per_s: f64,
    /// Rate random walk [1 per sqrt(s)].
    pub sigma_rate_per_s: f64,
    /// Innovation gate in sigmas.
    pub gate_sigma: f64,
    /// Consecutive gate rejections before a pair resets.
    pub max_consecutive_rejects: u32,
    /// Accepted observations needed to leave bootstrap...
    pub bootstrap_obs: u32,
    /// ...within this window [s].
    pub bootstrap_window_s: f64,
    /// Observations before the pair is published to the graph.
    pub min_obs_for_graph: u32,
    /// Pair evicted after this much idle time [s].
    pub pair_idle_timeout_s: f64,
    /// Measurement variance floor [ns^2].
    pub noise_floor_ns2: f64,
    /// |z| beyond this is a geometry contradiction -> pair reset [s].
    pub max_observation_s: f64,
    /// Accepted innovations kept for the MAD jitter estimate.
    pub jitter_window: usize,
    /// Reference sightings kept per receiver.
    pub sighting_ring: usize,
}

impl Default for SyncParams {
    fn default() -> Self {
        SyncParams {
            pairing_window_s: 5.0,
            sigma_offset_per_s: 100e-9,
            sigma_rate_per_s: 1e-6,
            gate_sigma: 4.0,
            max_consecutive_rejects: 6,
            bootstrap_obs: 4,
            bootstrap_window_s: 30.0,
            min_obs_for_graph: 6,
            pair_idle_timeout_s: 60.0,
            noise_floor_ns2: 50.0,
            max_observation_s: 1.0,
            jitter_window: 32,
            sighting_ring: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Clock graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GraphParams {
    /// Added to each edge weight to bias toward fewer hops [s^2].
    pub hop_penalty_s2: f64,
    /// Edges above this jitter variance are not published [s^2].
    pub edge_variance_cutoff_s2: f64,
    /// Translations above this total variance fail [s^2].
    pub path_variance_ceiling_s2: f64,
}

impl Default for GraphParams {
    fn default() -> Self {
        GraphParams {
            hop_penalty_s2: 1e-14,           // (100 ns)^2 per hop
            edge_variance_cutoff_s2: 4e-12,  // (2 us)^2
            path_variance_ceiling_s2: 2.5e-11, // (5 us)^2
        }
    }
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CorrelatorParams {
    /// Same-message grouping window in the anchor frame [s].
    pub window_s: f64,
    /// Group closed this long after creation [s].
    pub close_delay_s: f64,
    /// Open groups kept per aircraft.
    pub max_groups_per_icao: usize,
    /// Bit errors tolerated between short-frame copies.
    pub short_hamming_tolerance: u32,
    /// Closed groups awaiting the solver.
    pub solve_queue_cap: usize,
}

impl Default for CorrelatorParams {
    fn default() -> Self {
        CorrelatorParams {
            window_s: 0.002,
            close_delay_s: 0.5,
            max_groups_per_icao: 8,
            short_hamming_tolerance: 1,
            solve_queue_cap: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SolverParams {
    /// Initial Levenberg-Marquardt damping.
    pub lambda0: f64,
    pub max_iterations: u32,
    /// Convergence: step norm below this [m].
    pub step_tolerance_m: f64,
    /// Wall budget per solve.
    pub wall_budget: Duration,
    /// Acceptance threshold on chi^2 per degree of freedom.
    pub chi2_dof_max: f64,
    /// Altitude constraint variance [m^2].
    pub altitude_var_m2: f64,
    /// Unconstrained solutions outside [min, max] altitude are rejected [m].
    pub alt_max_m: f64,
    pub alt_min_m: f64,
    /// Baseline collinearity limit (ratio of the two largest singular values).
    pub condition_limit: f64,
    /// Dilution-of-precision cap at the initial guess.
    pub dop_cap: f64,
    /// Horizontal covariance semi-major axis cap [m].
    pub horizontal_axis_max_m: f64,
}

impl Default for SolverParams {
    fn default() -> Self {
        SolverParams {
            lambda0: 1e-3,
            max_iterations: 20,
            step_tolerance_m: 1.0,
            wall_budget: Duration::from_millis(10),
            chi2_dof_max: 25.0,
            altitude_var_m2: 10.0,
            alt_max_m: 18_000.0,
            alt_min_m: -1_000.0,
            condition_limit: 1e6,
            dop_cap: 50.0,
            horizontal_axis_max_m: 10_000.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Aircraft smoother
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrackParams {
    /// Process noise: acceleration sigma [m/s^2].
    pub accel_sigma: f64,
    /// Mahalanobis gate on incoming fixes [sigmas].
    pub gate_sigma: f64,
    /// Track supplies an initial guess when younger than this [s].
    pub guess_max_age_s: f64,
    /// Track evicted after this much silence [s].
    pub timeout_s: f64,
}

impl Default for TrackParams {
    fn default() -> Self {
        TrackParams {
            accel_sigma: 10.0,
            gate_sigma: 5.0,
            guess_max_age_s: 10.0,
            timeout_s: 30.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Every tunable in one place; `Default` is a working configuration.
#[derive(Debug, Clone, Default)]
pub struct MlatParams {
    pub session: SessionParams,
    pub sync: SyncParams,
    pub graph: GraphParams,
    pub correlator: CorrelatorParams,
    pub solver: SolverParams,
    pub track: TrackParams,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let p = MlatParams::default();
        assert!(p.sync.gate_sigma > 0.0);
        assert!(p.sync.bootstrap_obs < p.sync.min_obs_for_graph);
        assert!(p.graph.edge_variance_cutoff_s2 < p.graph.path_variance_ceiling_s2);
        assert!(p.correlator.window_s < p.correlator.close_delay_s);
        assert!(p.solver.alt_min_m < p.solver.alt_max_m);
    }
}
