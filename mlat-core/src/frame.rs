//! Mode S frame classification over raw message bytes.
//!
//! Responsibilities:
//! - Classify Downlink Format (DF) from the first 5 bits
//! - Check message length against the DF (7 bytes short, 14 bytes long)
//! - CRC-24 validation for DF11/17/18; ICAO recovery from the CRC residual
//!   for DF0/4/5/16/20/21
//! - Validate residual-recovered ICAOs against a time-windowed cache
//!
//! Receivers deliver raw bytes; there is no hex parsing on this path.

use std::collections::HashMap;

use crate::types::{Icao, MlatError, Result};

const GENERATOR: u32 = 0xFFF409;

// DFs where ICAO is explicit in bytes 1-3
const DF_EXPLICIT_ICAO: &[u8] = &[11, 17, 18];

// DFs where ICAO is recovered from CRC residual
const DF_RESIDUAL_ICAO: &[u8] = &[0, 4, 5, 16, 20, 21];

/// Short Mode S reply length in bytes.
pub const SHORT_FRAME_LEN: usize = 7;
/// Long Mode S reply length in bytes.
pub const LONG_FRAME_LEN: usize = 14;

// ---------------------------------------------------------------------------
// CRC-24
// ---------------------------------------------------------------------------

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x800000 != 0 {
                crc = (crc << 1) ^ GENERATOR;
            } else {
                crc <<= 1;
            }
            crc &= 0xFFFFFF;
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_crc_table();

/// Mode S CRC-24 check.
///
/// Polynomial division of the first (n-3) bytes, then XOR with the last 3
/// bytes (PI/CRC field).
///
/// - DF17/18: returns 0 when valid.
/// - DF0/4/5/16/20/21: returns the ICAO address.
pub fn crc24(data: &[u8]) -> u32 {
    if data.len() <= 3 {
        let mut val = 0u32;
        for &b in data {
            val = (val << 8) | b as u32;
        }
        return val & 0xFFFFFF;
    }

    let payload_len = data.len() - 3;
    let mut crc = 0u32;
    for &byte in &data[..payload_len] {
        crc = ((crc << 8) ^ CRC_TABLE[((crc >> 16) ^ byte as u32) as usize & 0xFF]) & 0xFFFFFF;
    }

    crc ^ ((data[payload_len] as u32) << 16
        | (data[payload_len + 1] as u32) << 8
        | data[payload_len + 2] as u32)
}

// ---------------------------------------------------------------------------
// ICAO cache
// ---------------------------------------------------------------------------

/// Time-windowed cache of validated ICAO addresses.
///
/// ICAOs are registered when seen in DF11/17/18 frames (CRC-validated).
/// For DF0/4/5/16/20/21, the ICAO is recovered from the CRC residual —
/// noise produces fake addresses, so residual-recovered ICAOs not recently
/// seen in a validated frame are rejected.
#[derive(Debug)]
pub struct IcaoCache {
    ttl: f64,
    cache: HashMap<Icao, f64>, // icao -> last_seen wall time
}

impl IcaoCache {
    pub fn new(ttl: f64) -> Self {
        IcaoCache {
            ttl,
            cache: HashMap::new(),
        }
    }

    /// Register a validated ICAO (from DF11/17/18).
    pub fn register(&mut self, icao: Icao, wall: f64) {
        self.cache.insert(icao, wall);
    }

    /// Check if an ICAO was recently seen in a validated frame.
    pub fn is_known(&mut self, icao: &Icao, wall: f64) -> bool {
        if let Some(&last_seen) = self.cache.get(icao) {
            if wall - last_seen <= self.ttl {
                return true;
            }
            self.cache.remove(icao);
        }
        false
    }

    /// Remove expired entries.
    pub fn prune(&mut self, now: f64) {
        let ttl = self.ttl;
        self.cache.retain(|_, &mut last_seen| now - last_seen <= ttl);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for IcaoCache {
    fn default() -> Self {
        IcaoCache::new(60.0)
    }
}

// ---------------------------------------------------------------------------
// ModesFrame
// ---------------------------------------------------------------------------

/// A classified Mode S frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ModesFrame {
    /// Downlink Format (0-24)
    pub df: u8,
    /// 3-byte ICAO address
    pub icao: Icao,
    /// Full message bytes (7 or 14)
    pub raw: Vec<u8>,
    /// Signal level if the receiver reported one
    pub rssi: Option<f64>,
}

impl ModesFrame {
    /// True if this is a 112-bit (long) message.
    pub fn is_long(&self) -> bool {
        self.raw.len() == LONG_FRAME_LEN
    }

    /// True if this is an ADS-B extended squitter (DF17/18).
    pub fn is_extended_squitter(&self) -> bool {
        self.df == 17 || self.df == 18
    }

    /// Message Extended field (bytes 4-10, 56 bits) for DF17/18.
    /// Returns an empty slice for short frames.
    pub fn me(&self) -> &[u8] {
        if self.is_long() && self.is_extended_squitter() {
            &self.raw[4..11]
        } else {
            &[]
        }
    }

    /// ADS-B Type Code (first 5 bits of ME), `None` for non-squitter frames.
    pub fn type_code(&self) -> Option<u8> {
        let me = self.me();
        if me.is_empty() {
            None
        } else {
            Some(me[0] >> 3)
        }
    }
}

/// Classify raw Mode S bytes into a frame.
///
/// Rejects wrong lengths, CRC failures on extended squitters, and
/// residual-recovered ICAOs that the cache has never seen validated.
pub fn parse_frame(
    bytes: &[u8],
    rssi: Option<f64>,
    wall: f64,
    cache: &mut IcaoCache,
) -> Result<ModesFrame> {
    if bytes.is_empty() {
        return Err(MlatError::BadMessage("empty message".into()));
    }

    let df = (bytes[0] >> 3) & 0x1F;
    let expected = if df >= 16 {
        LONG_FRAME_LEN
    } else {
        SHORT_FRAME_LEN
    };
    if bytes.len() != expected {
        return Err(MlatError::BadMessage(format!(
            "DF{df}: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }

    let icao = if DF_EXPLICIT_ICAO.contains(&df) {
        let residual = crc24(bytes);
        // DF17/18 must divide to zero; DF11 may carry an interrogator
        // code in the low 7 bits of the parity field.
        let ok = match df {
            11 => residual & 0xFFFF80 == 0,
            _ => residual == 0,
        };
        if !ok {
            return Err(MlatError::BadMessage(format!("DF{df} CRC failed")));
        }
        let icao = [bytes[1], bytes[2], bytes[3]];
        cache.register(icao, wall);
        icao
    } else if DF_RESIDUAL_ICAO.contains(&df) {
        let residual = crc24(bytes);
        let icao = [
            ((residual >> 16) & 0xFF) as u8,
            ((residual >> 8) & 0xFF) as u8,
            (residual & 0xFF) as u8,
        ];
        if !cache.is_known(&icao, wall) {
            return Err(MlatError::BadMessage(format!(
                "DF{df} residual ICAO not in cache"
            )));
        }
        icao
    } else {
        return Err(MlatError::BadMessage(format!("unhandled DF{df}")));
    };

    Ok(ModesFrame {
        df,
        icao,
        raw: bytes.to_vec(),
        rssi,
    })
}

/// Bit distance between two equal-length payloads.
///
/// Used by the correlator to accept noise copies of short replies.
/// Unequal lengths count as far apart.
pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
    if a.len() != b.len() {
        return u32::MAX;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hex_decode;

    // CRC-valid DF17 captures
    const VALID_FRAMES: &[&str] = &[
        "8D4840D6202CC371C32CE0576098",
        "8D40621D58C382D690C8AC2863A7",
        "8D485020994409940838175B284F",
    ];

    fn bytes(hex: &str) -> Vec<u8> {
        hex_decode(hex).unwrap()
    }

    #[test]
    fn test_crc_table_entry_zero() {
        assert_eq!(CRC_TABLE[0], 0);
    }

    #[test]
    fn test_valid_df17_remainder_zero() {
        for hex in VALID_FRAMES {
            assert_eq!(crc24(&bytes(hex)), 0, "CRC should be 0 for {hex}");
        }
    }

    #[test]
    fn test_parse_df17() {
        let mut cache = IcaoCache::default();
        let frame = parse_frame(&bytes(VALID_FRAMES[0]), None, 1.0, &mut cache).unwrap();
        assert_eq!(frame.df, 17);
        assert_eq!(frame.icao, [0x48, 0x40, 0xD6]);
        assert!(frame.is_long());
        assert!(frame.is_extended_squitter());
    }

    #[test]
    fn test_parse_registers_icao() {
        let mut cache = IcaoCache::default();
        parse_frame(&bytes(VALID_FRAMES[0]), None, 1.0, &mut cache).unwrap();
        assert!(cache.is_known(&[0x48, 0x40, 0xD6], 2.0));
    }

    #[test]
    fn test_corrupted_df17_rejected() {
        let mut cache = IcaoCache::default();
        let mut data = bytes(VALID_FRAMES[0]);
        data[5] ^= 0x01;
        assert!(parse_frame(&data, None, 1.0, &mut cache).is_err());
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut cache = IcaoCache::default();
        let data = bytes(VALID_FRAMES[0]);
        assert!(parse_frame(&data[..7], None, 1.0, &mut cache).is_err());
    }

    #[test]
    fn test_residual_icao_needs_cache() {
        let mut cache = IcaoCache::default();

        // Build a DF4-shaped short reply whose residual equals a known ICAO:
        // take a payload and append its own CRC XOR the target address.
        let icao = [0x48, 0x40, 0xD6];
        let mut short = vec![0x20, 0x00, 0x05, 0x30, 0x00, 0x00, 0x00];
        let parity = crc24(&[short[0], short[1], short[2], short[3], 0, 0, 0]);
        let target = parity ^ 0x4840D6;
        short[4] = ((target >> 16) & 0xFF) as u8;
        short[5] = ((target >> 8) & 0xFF) as u8;
        short[6] = (target & 0xFF) as u8;
        assert_eq!(crc24(&short), 0x4840D6);

        // Unknown ICAO: rejected
        assert!(parse_frame(&short, None, 1.0, &mut cache).is_err());

        // After a validated DF17 the same short reply classifies
        parse_frame(&bytes(VALID_FRAMES[0]), None, 1.0, &mut cache).unwrap();
        let frame = parse_frame(&short, None, 2.0, &mut cache).unwrap();
        assert_eq!(frame.df, 4);
        assert_eq!(frame.icao, icao);
        assert!(!frame.is_long());
        assert_eq!(frame.type_code(), None);
    }

    #[test]
    fn test_icao_cache_expiry() {
        let mut cache = IcaoCache::new(10.0);
        cache.register([1, 2, 3], 0.0);
        assert!(cache.is_known(&[1, 2, 3], 5.0));
        assert!(!cache.is_known(&[1, 2, 3], 20.0));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hamming() {
        assert_eq!(hamming(&[0xFF, 0x00], &[0xFF, 0x00]), 0);
        assert_eq!(hamming(&[0xFF, 0x00], &[0xFE, 0x00]), 1);
        assert_eq!(hamming(&[0xF0], &[0x0F]), 8);
        assert_eq!(hamming(&[0x00], &[0x00, 0x00]), u32::MAX);
    }
}
