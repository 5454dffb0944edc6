//! Reference ADS-B decoder — DF17/18 positions that drive clock sync.
//!
//! The sync engine only needs one thing from ADS-B: messages whose decoded
//! payload yields a known transmitter position. This module carries the CPR
//! machinery for that (global even/odd pairing, local decode against the
//! last known position) plus the Mode S altitude fields the solver uses as
//! an optional constraint.
//!
//! CPR constants:
//! - NZ = 15 (latitude zones per hemisphere for even frames)
//! - Nb = 17 (bits per coordinate)
//! - Global decode requires an even+odd pair within 10 seconds

use std::collections::HashMap;

use crate::frame::ModesFrame;
use crate::geo::{geodetic_to_ecef, Ecef, Geodetic};
use crate::types::Icao;

/// Number of latitude zones per hemisphere.
const NZ: f64 = 15.0;

/// Maximum CPR value (2^17).
const CPR_MAX: f64 = (1u32 << 17) as f64;

/// Maximum time between even/odd frames for global decode (seconds).
pub const MAX_PAIR_AGE: f64 = 10.0;

/// Aircraft CPR state evicted after this much silence (seconds).
const STATE_TTL: f64 = 60.0;

const FT_TO_M: f64 = 0.3048;

// ---------------------------------------------------------------------------
// CPR decode
// ---------------------------------------------------------------------------

/// Number of longitude zones at a given latitude (NL function).
/// Ranges from 1 near the poles to 59 at the equator.
pub fn nl(lat: f64) -> i32 {
    if lat.abs() >= 87.0 {
        return 1;
    }
    let a = 1.0 - (std::f64::consts::PI / (2.0 * NZ)).cos();
    let b = (std::f64::consts::PI / 180.0 * lat.abs()).cos().powi(2);
    let nl_val = (2.0 * std::f64::consts::PI / (1.0 - a / b).acos()).floor() as i32;
    nl_val.max(1)
}

/// Modulo that always returns a non-negative result.
fn modulo(x: f64, y: f64) -> f64 {
    x - y * (x / y).floor()
}

/// Global CPR decode from an even/odd frame pair.
///
/// Returns `(latitude, longitude)` in degrees, or `None` if the pair is
/// too old or straddles a zone boundary.
pub fn cpr_global(
    lat_even: u32,
    lon_even: u32,
    lat_odd: u32,
    lon_odd: u32,
    t_even: f64,
    t_odd: f64,
) -> Option<(f64, f64)> {
    if (t_even - t_odd).abs() > MAX_PAIR_AGE {
        return None;
    }

    let dlat_even = 360.0 / (4.0 * NZ);
    let dlat_odd = 360.0 / (4.0 * NZ - 1.0);

    let lat_even_cpr = lat_even as f64 / CPR_MAX;
    let lon_even_cpr = lon_even as f64 / CPR_MAX;
    let lat_odd_cpr = lat_odd as f64 / CPR_MAX;
    let lon_odd_cpr = lon_odd as f64 / CPR_MAX;

    let j = (59.0 * lat_even_cpr - 60.0 * lat_odd_cpr + 0.5).floor();

    let mut lat_e = dlat_even * (modulo(j, 60.0) + lat_even_cpr);
    let mut lat_o = dlat_odd * (modulo(j, 59.0) + lat_odd_cpr);
    if lat_e >= 270.0 {
        lat_e -= 360.0;
    }
    if lat_o >= 270.0 {
        lat_o -= 360.0;
    }

    // Both latitudes must land in the same longitude zone band
    if nl(lat_e) != nl(lat_o) {
        return None;
    }

    let (lat, lon) = if t_even >= t_odd {
        let nl_val = nl(lat_e);
        let n_lon = nl_val.max(1);
        let dlon = 360.0 / n_lon as f64;
        let m = (lon_even_cpr * (nl_val - 1) as f64 - lon_odd_cpr * nl_val as f64 + 0.5).floor();
        (lat_e, dlon * (modulo(m, n_lon as f64) + lon_even_cpr))
    } else {
        let nl_val = nl(lat_o);
        let n_lon = (nl_val - 1).max(1);
        let dlon = 360.0 / n_lon as f64;
        let m = (lon_even_cpr * (nl_val - 1) as f64 - lon_odd_cpr * nl_val as f64 + 0.5).floor();
        (lat_o, dlon * (modulo(m, n_lon as f64) + lon_odd_cpr))
    };

    let lon = if lon >= 180.0 { lon - 360.0 } else { lon };
    Some((lat, lon))
}

/// Local CPR decode against a reference position within ~180 nm.
pub fn cpr_local(
    cpr_lat: u32,
    cpr_lon: u32,
    odd: bool,
    ref_lat: f64,
    ref_lon: f64,
) -> (f64, f64) {
    let i = if odd { 1.0 } else { 0.0 };
    let dlat = 360.0 / (4.0 * NZ - i);

    let lat_norm = cpr_lat as f64 / CPR_MAX;
    let lon_norm = cpr_lon as f64 / CPR_MAX;

    let j = (ref_lat / dlat).floor() + (modulo(ref_lat, dlat) / dlat - lat_norm + 0.5).floor();
    let mut lat = dlat * (j + lat_norm);

    let nl_val = nl(lat);
    let n_lon = (nl_val - i as i32).max(1);
    let dlon = 360.0 / n_lon as f64;

    let m = (ref_lon / dlon).floor() + (modulo(ref_lon, dlon) / dlon - lon_norm + 0.5).floor();
    let mut lon = dlon * (m + lon_norm);

    if lat > 90.0 {
        lat -= 360.0;
    }
    if lon >= 180.0 {
        lon -= 360.0;
    }
    (lat, lon)
}

// ---------------------------------------------------------------------------
// Altitude decode
// ---------------------------------------------------------------------------

/// Decode the 12-bit altitude code of a DF17 airborne position [ft].
///
/// Q=1 selects 25-ft resolution; Q=0 is 100-ft Gillham gray code.
pub fn decode_altitude12(alt_code: u32) -> Option<i32> {
    if alt_code == 0 {
        return None;
    }
    let q_bit = (alt_code >> 4) & 1;
    if q_bit == 1 {
        let n = ((alt_code >> 5) << 4) | (alt_code & 0x0F);
        Some(n as i32 * 25 - 1000)
    } else {
        decode_gillham(alt_code)
    }
}

/// Decode the 13-bit altitude field of DF0/4/16/20 [ft].
pub fn decode_altitude13(alt_code_13: u32) -> Option<i32> {
    if alt_code_13 == 0 {
        return None;
    }
    let m_bit = (alt_code_13 >> 6) & 1;
    let q_bit = (alt_code_13 >> 4) & 1;

    if m_bit == 1 {
        return None; // Metric altitude, very rare
    }
    if q_bit == 1 {
        // Remove M and Q bits to get the 11-bit code
        let n =
            ((alt_code_13 & 0x1F80) >> 2) | ((alt_code_13 & 0x0020) >> 1) | (alt_code_13 & 0x000F);
        Some(n as i32 * 25 - 1000)
    } else {
        decode_gillham(alt_code_13)
    }
}

/// 100-ft Gillham gray code (shared by the 12- and 13-bit paths).
fn decode_gillham(alt_code: u32) -> Option<i32> {
    let c1 = (alt_code >> 12) & 1;
    let a1 = (alt_code >> 11) & 1;
    let c2 = (alt_code >> 10) & 1;
    let a2 = (alt_code >> 9) & 1;
    let c4 = (alt_code >> 8) & 1;
    let a4 = (alt_code >> 7) & 1;
    let b1 = (alt_code >> 5) & 1;
    let b2 = (alt_code >> 3) & 1;
    let b4 = (alt_code >> 1) & 1;

    let c_digit = c4 * 4 + c2 * 2 + c1;
    let mut c_bin = c_digit;
    c_bin ^= c_bin >> 2;
    c_bin ^= c_bin >> 1;
    if c_bin == 0 || c_bin >= 6 {
        return None;
    }

    let ab_gray = (a4 * 4 + a2 * 2 + a1) << 3 | (b4 * 4 + b2 * 2 + b1);
    let mut ab_bin = ab_gray;
    ab_bin ^= ab_bin >> 4;
    ab_bin ^= ab_bin >> 2;
    ab_bin ^= ab_bin >> 1;

    let altitude = ab_bin as i32 * 500 + c_bin as i32 * 100 - 1200;
    if !(-1200..=126_750).contains(&altitude) {
        return None;
    }
    Some(altitude)
}

// ---------------------------------------------------------------------------
// NUC
// ---------------------------------------------------------------------------

/// Navigation Uncertainty Category from the airborne position type code.
pub fn nuc_from_type_code(tc: u8) -> u8 {
    match tc {
        9..=18 => 18 - tc,
        20 => 9,
        21 => 8,
        _ => 0,
    }
}

/// Horizontal position sigma implied by a NUCp value [m].
///
/// Feeds the pair filter's measurement variance.
pub fn nuc_horizontal_sigma_m(nuc: u8) -> f64 {
    match nuc {
        9 => 7.5,
        8 => 25.0,
        7 => 185.0,
        6 => 370.0,
        5 => 926.0,
        4 => 1_852.0,
        3 => 3_704.0,
        _ => 9_260.0,
    }
}

// ---------------------------------------------------------------------------
// Reference decoder
// ---------------------------------------------------------------------------

/// A DF17/18 sighting with a fully resolved transmitter position.
#[derive(Debug, Clone, PartialEq)]
pub struct RefPosition {
    pub icao: Icao,
    pub geodetic: Geodetic,
    pub ecef: Ecef,
    pub nuc: u8,
}

/// Summary of any classified Mode S frame: what MLAT needs and nothing more.
#[derive(Debug, Clone, PartialEq)]
pub struct ModesSummary {
    pub df: u8,
    pub icao: Icao,
    /// Geometric-ish altitude [m] from DF0/4/16/20 replies, when present.
    pub altitude_m: Option<f64>,
}

#[derive(Debug, Default)]
struct CprState {
    even: Option<(u32, u32, f64)>, // lat, lon, wall
    odd: Option<(u32, u32, f64)>,
    last_pos: Option<(f64, f64)>,
    last_wall: f64,
}

/// Stateful DF17/18 position decoder.
///
/// Pairs even/odd CPR frames per aircraft; falls back to local decode
/// against the aircraft's own last position. Unparsable or ambiguous CPR
/// is discarded silently; sync just waits for the next squitter.
#[derive(Debug, Default)]
pub struct RefDecoder {
    aircraft: HashMap<Icao, CprState>,
}

impl RefDecoder {
    pub fn new() -> Self {
        RefDecoder {
            aircraft: HashMap::new(),
        }
    }

    /// Decode an airborne position from a DF17/18 frame.
    ///
    /// Returns `None` for anything that does not resolve to a full 3D
    /// transmitter position (non-position type codes, unpaired CPR,
    /// missing altitude).
    pub fn decode_adsb(&mut self, frame: &ModesFrame, wall: f64) -> Option<RefPosition> {
        if !frame.is_extended_squitter() {
            return None;
        }
        let tc = frame.type_code()?;
        // TC 20-22 (GNSS height) uses a different altitude encoding; the
        // barometric airborne positions are plenty for sync.
        if !(9..=18).contains(&tc) {
            return None;
        }

        let me = frame.me();
        let alt_code = ((me[1] as u32) << 4) | ((me[2] as u32) >> 4);
        let odd = me[2] & 0x04 != 0;
        let cpr_lat = (((me[2] & 0x03) as u32) << 15) | ((me[3] as u32) << 7) | ((me[4] as u32) >> 1);
        let cpr_lon = (((me[4] & 0x01) as u32) << 16) | ((me[5] as u32) << 8) | (me[6] as u32);

        let altitude_ft = decode_altitude12(alt_code)?;

        let state = self.aircraft.entry(frame.icao).or_default();
        state.last_wall = wall;
        if odd {
            state.odd = Some((cpr_lat, cpr_lon, wall));
        } else {
            state.even = Some((cpr_lat, cpr_lon, wall));
        }

        let latlon = match (state.even, state.odd) {
            (Some((elat, elon, et)), Some((olat, olon, ot))) => {
                cpr_global(elat, elon, olat, olon, et, ot).or_else(|| {
                    state
                        .last_pos
                        .map(|(rlat, rlon)| cpr_local(cpr_lat, cpr_lon, odd, rlat, rlon))
                })
            }
            _ => state
                .last_pos
                .map(|(rlat, rlon)| cpr_local(cpr_lat, cpr_lon, odd, rlat, rlon)),
        }?;

        state.last_pos = Some(latlon);

        let geodetic = Geodetic {
            lat_deg: latlon.0,
            lon_deg: latlon.1,
            alt_m: altitude_ft as f64 * FT_TO_M,
        };
        Some(RefPosition {
            icao: frame.icao,
            ecef: geodetic_to_ecef(&geodetic),
            geodetic,
            nuc: nuc_from_type_code(tc),
        })
    }

    /// Drop CPR state for aircraft silent longer than the TTL.
    pub fn prune(&mut self, now: f64) {
        self.aircraft
            .retain(|_, s| now - s.last_wall <= STATE_TTL);
    }

    pub fn tracked(&self) -> usize {
        self.aircraft.len()
    }
}

/// Extract the MLAT-relevant summary of any classified frame.
pub fn decode_modes(frame: &ModesFrame) -> ModesSummary {
    let altitude_m = match frame.df {
        0 | 4 | 16 | 20 => {
            let ac13 = (((frame.raw[2] & 0x1F) as u32) << 8) | frame.raw[3] as u32;
            decode_altitude13(ac13).map(|ft| ft as f64 * FT_TO_M)
        }
        _ => None,
    };
    ModesSummary {
        df: frame.df,
        icao: frame.icao,
        altitude_m,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
