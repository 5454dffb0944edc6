//! Receiver ingest — TCP JSON-lines sessions.
//!
//! A receiver connects, sends one handshake line with its surveyed
//! location and clock parameters, then streams timestamped frames:
//!
//! ```text
//! {"name":"rx0","lat":47.0,"lon":8.0,"alt_m":520.0,"clock_hz":12000000,"wrap_bits":48}
//! {"tick":482193,"frame":"8D4840D6202CC371C32CE0576098","rssi":-21.5}
//! ```
//!
//! Framing is this module's concern only; the engine sees raw bytes and
//! un-wrapped ticks.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use mlat_core::geo::Geodetic;
use mlat_core::types::hex_decode;

use crate::engine::Engine;

pub type SharedEngine = Arc<Mutex<Engine>>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Handshake {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
    #[serde(default = "default_clock_hz")]
    pub clock_hz: f64,
    #[serde(default = "default_wrap_bits")]
    pub wrap_bits: u32,
}

fn default_clock_hz() -> f64 {
    12e6
}

fn default_wrap_bits() -> u32 {
    48
}

#[derive(Debug, Deserialize)]
pub struct RecordLine {
    pub tick: u64,
    pub frame: String,
    #[serde(default)]
    pub rssi: Option<f64>,
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accept receiver connections forever.
pub async fn run(listener: TcpListener, engine: SharedEngine) {
    loop {
        let Ok((stream, addr)) = listener.accept().await else {
            continue;
        };
        debug!(%addr, "receiver connecting");
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_receiver(stream, engine).await {
                debug!(%addr, error = %e, "receiver session ended");
            }
        });
    }
}

async fn handle_receiver(stream: TcpStream, engine: SharedEngine) -> std::io::Result<()> {
    let mut lines = BufReader::new(stream).lines();

    // Handshake first
    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    let handshake: Handshake = match serde_json::from_str(&first) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "bad handshake, closing");
            return Ok(());
        }
    };

    let location = Geodetic {
        lat_deg: handshake.lat,
        lon_deg: handshake.lon,
        alt_m: handshake.alt_m,
    };
    let id = engine.lock().unwrap().register_receiver(
        &handshake.name,
        location,
        handshake.clock_hz,
        handshake.wrap_bits,
    );

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let record: RecordLine = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                debug!(receiver = %handshake.name, error = %e, "bad record line");
                continue;
            }
        };
        let Some(bytes) = hex_decode(&record.frame) else {
            debug!(receiver = %handshake.name, "bad frame hex");
            continue;
        };
        engine
            .lock()
            .unwrap()
            .on_record(id, record.tick, &bytes, record.rssi, now());
    }

    info!(receiver = %handshake.name, "connection closed");
    engine.lock().unwrap().remove_receiver(id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_parses() {
        let h: Handshake = serde_json::from_str(
            r#"{"name":"rx0","lat":47.0,"lon":8.0,"alt_m":520.0,"clock_hz":12000000,"wrap_bits":24}"#,
        )
        .unwrap();
        assert_eq!(h.name, "rx0");
        assert_eq!(h.wrap_bits, 24);
    }

    #[test]
    fn test_handshake_defaults() {
        let h: Handshake =
            serde_json::from_str(r#"{"name":"rx0","lat":47.0,"lon":8.0,"alt_m":520.0}"#).unwrap();
        assert_eq!(h.clock_hz, 12e6);
        assert_eq!(h.wrap_bits, 48);
    }

    #[test]
    fn test_record_line_parses() {
        let r: RecordLine = serde_json::from_str(
            r#"{"tick":482193,"frame":"8D4840D6202CC371C32CE0576098","rssi":-21.5}"#,
        )
        .unwrap();
        assert_eq!(r.tick, 482_193);
        assert_eq!(r.rssi, Some(-21.5));
        assert!(hex_decode(&r.frame).is_some());
    }

    #[test]
    fn test_record_line_rssi_optional() {
        let r: RecordLine =
            serde_json::from_str(r#"{"tick":1,"frame":"8D4840D6202CC371C32CE0576098"}"#).unwrap();
        assert_eq!(r.rssi, None);
    }
}
