//! ECEF / WGS-84 geometry.
//!
//! All multilateration math runs in Earth-Centered Earth-Fixed double
//! precision; geodetic conversion happens only at the edges (surveyed
//! receiver locations in, solved positions out).

use serde::Serialize;

/// Speed of light in vacuum [m/s].
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

// WGS-84 ellipsoid
const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);
const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);
// Second eccentricity squared
const WGS84_EP2: f64 = WGS84_E2 / (1.0 - WGS84_E2);

// ---------------------------------------------------------------------------
// ECEF vector
// ---------------------------------------------------------------------------

/// Earth-Centered Earth-Fixed position or displacement [m].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Ecef {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Ecef {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Ecef { x, y, z }
    }

    pub fn dot(&self, other: &Ecef) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn distance(&self, other: &Ecef) -> f64 {
        (*self - *other).norm()
    }

    pub fn scaled(&self, k: f64) -> Ecef {
        Ecef::new(self.x * k, self.y * k, self.z * k)
    }

    /// Unit vector in the same direction; zero vector stays zero.
    pub fn unit(&self) -> Ecef {
        let n = self.norm();
        if n > 0.0 {
            self.scaled(1.0 / n)
        } else {
            *self
        }
    }
}

impl std::ops::Add for Ecef {
    type Output = Ecef;
    fn add(self, rhs: Ecef) -> Ecef {
        Ecef::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Ecef {
    type Output = Ecef;
    fn sub(self, rhs: Ecef) -> Ecef {
        Ecef::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

// ---------------------------------------------------------------------------
// Geodetic conversion
// ---------------------------------------------------------------------------

/// WGS-84 geodetic coordinates: degrees, degrees, metres above the ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Geodetic {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_m: f64,
}

/// Geodetic (degrees, metres) to ECEF.
pub fn geodetic_to_ecef(g: &Geodetic) -> Ecef {
    let lat = g.lat_deg.to_radians();
    let lon = g.lon_deg.to_radians();
    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    Ecef::new(
        (n + g.alt_m) * cos_lat * lon.cos(),
        (n + g.alt_m) * cos_lat * lon.sin(),
        (n * (1.0 - WGS84_E2) + g.alt_m) * sin_lat,
    )
}

/// ECEF to geodetic, Bowring's closed-form approximation.
///
/// Sub-millimetre for any point between -10 km and LEO; no iteration.
pub fn ecef_to_geodetic(e: &Ecef) -> Geodetic {
    let p = (e.x * e.x + e.y * e.y).sqrt();
    let lon = e.y.atan2(e.x);

    if p < 1e-9 {
        // On the polar axis
        let lat = if e.z >= 0.0 {
            std::f64::consts::FRAC_PI_2
        } else {
            -std::f64::consts::FRAC_PI_2
        };
        return Geodetic {
            lat_deg: lat.to_degrees(),
            lon_deg: lon.to_degrees(),
            alt_m: e.z.abs() - WGS84_B,
        };
    }

    let theta = (e.z * WGS84_A).atan2(p * WGS84_B);
    let sin_t = theta.sin();
    let cos_t = theta.cos();
    let lat = (e.z + WGS84_EP2 * WGS84_B * sin_t * sin_t * sin_t)
        .atan2(p - WGS84_E2 * WGS84_A * cos_t * cos_t * cos_t);
    let sin_lat = lat.sin();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
    let alt = p / lat.cos() - n;

    Geodetic {
        lat_deg: lat.to_degrees(),
        lon_deg: lon.to_degrees(),
        alt_m: alt,
    }
}

/// Height above the WGS-84 ellipsoid [m].
pub fn ellipsoidal_height(e: &Ecef) -> f64 {
    ecef_to_geodetic(e).alt_m
}

/// Local East/North/Up unit vectors at an ECEF point.
pub fn enu_basis(at: &Ecef) -> [Ecef; 3] {
    let g = ecef_to_geodetic(at);
    let lat = g.lat_deg.to_radians();
    let lon = g.lon_deg.to_radians();
    let (sin_lat, cos_lat) = (lat.sin(), lat.cos());
    let (sin_lon, cos_lon) = (lon.sin(), lon.cos());

    let east = Ecef::new(-sin_lon, cos_lon, 0.0);
    let north = Ecef::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat);
    let up = Ecef::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat);
    [east, north, up]
}

/// Straight-line propagation delay between two ECEF points [s].
pub fn propagation_seconds(a: &Ecef, b: &Ecef) -> f64 {
    a.distance(b) / SPEED_OF_LIGHT
}

/// Convert a local ENU offset at `origin` into an absolute ECEF point.
///
/// Used by tests and by coverage reporting; receivers register geodetic
/// positions directly.
pub fn enu_to_ecef(origin: &Ecef, east_m: f64, north_m: f64, up_m: f64) -> Ecef {
    let [e, n, u] = enu_basis(origin);
    *origin + e.scaled(east_m) + n.scaled(north_m) + u.scaled(up_m)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
