//! Offline replay of multi-receiver capture files.
//!
//! Capture format, one record per line, time-ordered:
//!
//! ```text
//! # receivers first, then records
//! @rx0,47.0,8.0,520.0,12000000,48
//! rx0,1700000000.031,482193,8D4840D6202CC371C32CE0576098,-20.5
//! ```
//!
//! `@name,lat,lon,alt_m[,clock_hz[,wrap_bits]]` registers a receiver;
//! `name,wall,tick,hex[,rssi]` is one arrival. Blank lines and `#`
//! comments are skipped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use comfy_table::Table;

use mlat_core::config::MlatParams;
use mlat_core::geo::Geodetic;
use mlat_core::solver::Fix;
use mlat_core::types::{hex_decode, MlatError, ReceiverId, Result};

use crate::engine::Engine;

/// Housekeeping cadence during replay [s].
const TICK: f64 = 0.1;

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// `@name,lat,lon,alt_m[,clock_hz[,wrap_bits]]`
pub fn parse_location_line(line: &str) -> Option<(String, Geodetic, f64, u32)> {
    let rest = line.strip_prefix('@')?;
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }
    let location = Geodetic {
        lat_deg: fields[1].parse().ok()?,
        lon_deg: fields[2].parse().ok()?,
        alt_m: fields[3].parse().ok()?,
    };
    let clock_hz = match fields.get(4) {
        Some(v) => v.parse().ok()?,
        None => 12e6,
    };
    let wrap_bits = match fields.get(5) {
        Some(v) => v.parse().ok()?,
        None => 48,
    };
    Some((fields[0].to_string(), location, clock_hz, wrap_bits))
}

/// `name,wall,tick,hex[,rssi]`
pub fn parse_record_line(line: &str) -> Option<(String, f64, u64, Vec<u8>, Option<f64>)> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }
    let wall: f64 = fields[1].parse().ok()?;
    let tick: u64 = fields[2].parse().ok()?;
    let bytes = hex_decode(fields[3])?;
    let rssi = fields.get(4).and_then(|v| v.parse().ok());
    Some((fields[0].to_string(), wall, tick, bytes, rssi))
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub records: u64,
    pub skipped_lines: u64,
    pub fixes: Vec<Fix>,
}

/// Run a capture file through a fresh engine.
pub fn run_replay(path: &Path, params: MlatParams) -> Result<(Engine, ReplaySummary)> {
    let text = fs::read_to_string(path)?;
    let mut engine = Engine::new(params);
    let mut summary = ReplaySummary::default();
    let mut ids: HashMap<String, ReceiverId> = HashMap::new();
    let mut next_tick: Option<f64> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('@') {
            match parse_location_line(line) {
                Some((name, location, clock_hz, wrap_bits)) => {
                    let id = engine.register_receiver(&name, location, clock_hz, wrap_bits);
                    ids.insert(name, id);
                }
                None => summary.skipped_lines += 1,
            }
            continue;
        }

        let Some((name, wall, tick, bytes, rssi)) = parse_record_line(line) else {
            summary.skipped_lines += 1;
            continue;
        };
        let Some(&id) = ids.get(&name) else {
            summary.skipped_lines += 1;
            continue;
        };

        // Housekeeping runs between records, as the event loop would
        let mut due = *next_tick.get_or_insert(wall + TICK);
        while wall > due {
            summary.fixes.extend(engine.housekeeping(due));
            due += TICK;
        }
        next_tick = Some(due);

        engine.on_record(id, tick, &bytes, rssi, wall);
        summary.records += 1;
    }

    // Flush: enough ticks to close and solve every pending group
    if let Some(mut due) = next_tick {
        for _ in 0..20 {
            summary.fixes.extend(engine.housekeeping(due));
            due += TICK;
        }
    }

    Ok((engine, summary))
}

/// Human-readable replay report.
pub fn print_summary(engine: &Engine, summary: &ReplaySummary) {
    let mut receivers = Table::new();
    receivers.set_header(vec!["receiver", "state", "messages", "bad", "dropped"]);
    let mut rows: Vec<_> = engine.receivers().collect();
    rows.sort_by_key(|rx| rx.id);
    for rx in rows {
        receivers.add_row(vec![
            rx.name.clone(),
            format!("{:?}", rx.state),
            rx.messages.to_string(),
            rx.bad_messages.to_string(),
            rx.dropped.to_string(),
        ]);
    }
    println!("{receivers}");

    let mut pairs = Table::new();
    pairs.set_header(vec!["pair", "obs", "jitter ns", "rate ppm", "offset s"]);
    let mut pair_rows: Vec<_> = engine.sync().pairs().collect();
    pair_rows.sort_by_key(|(key, _)| **key);
    for (key, pc) in pair_rows {
        pairs.add_row(vec![
            format!("{}-{}", key.i, key.j),
            pc.n_obs().to_string(),
            format!("{:.0}", pc.jitter_s() * 1e9),
            format!("{:+.2}", pc.rate_ppm()),
            format!("{:+.6}", pc.delta()),
        ]);
    }
    println!("{pairs}");

    println!(
        "{} records, {} fixes, {} skipped lines",
        summary.records,
        summary.fixes.len(),
        summary.skipped_lines
    );
}

/// Serialize fixes as JSON lines.
pub fn write_fixes(fixes: &[Fix], out: &mut dyn std::io::Write) -> Result<()> {
    for fix in fixes {
        let record = crate::output::FixRecord::from_fix(fix);
        let line = serde_json::to_string(&record)
            .map_err(|e| MlatError::Config(format!("serialize fix: {e}")))?;
        writeln!(out, "{line}")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DF17: &str = "8D4840D6202CC371C32CE0576098";

    #[test]
    fn test_parse_location_line() {
        let (name, g, clock_hz, wrap) =
            parse_location_line("@rx0,47.0,8.0,520.0,12000000,24").unwrap();
        assert_eq!(name, "rx0");
        assert_eq!(g.lat_deg, 47.0);
        assert_eq!(clock_hz, 12e6);
        assert_eq!(wrap, 24);
    }

    #[test]
    fn test_parse_location_line_defaults() {
        let (_, _, clock_hz, wrap) = parse_location_line("@rx1,47.0,8.0,520.0").unwrap();
        assert_eq!(clock_hz, 12e6);
        assert_eq!(wrap, 48);
    }

    #[test]
    fn test_parse_record_line() {
        let (name, wall, tick, bytes, rssi) =
            parse_record_line(&format!("rx0,1700000000.5,42,{DF17},-20.5")).unwrap();
        assert_eq!(name, "rx0");
        assert_eq!(wall, 1_700_000_000.5);
        assert_eq!(tick, 42);
        assert_eq!(bytes.len(), 14);
        assert_eq!(rssi, Some(-20.5));
    }

    #[test]
    fn test_parse_record_line_no_rssi() {
        let (.., rssi) = parse_record_line(&format!("rx0,1.0,42,{DF17}")).unwrap();
        assert_eq!(rssi, None);
    }

    #[test]
    fn test_replay_small_capture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# tiny capture").unwrap();
        writeln!(file, "@rx0,47.0,8.0,520.0").unwrap();
        writeln!(file, "@rx1,47.1,8.1,480.0").unwrap();
        writeln!(file, "rx0,1000.000,120000,{DF17}").unwrap();
        writeln!(file, "rx1,1000.001,121000,{DF17},-19.0").unwrap();
        writeln!(file, "not a record").unwrap();
        writeln!(file, "rx9,1000.002,1,{DF17}").unwrap(); // unknown receiver
        file.flush().unwrap();

        let (engine, summary) = run_replay(file.path(), MlatParams::default()).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.skipped_lines, 2);
        assert_eq!(engine.receiver_count(), 2);
        assert!(summary.fixes.is_empty(), "two receivers cannot produce a fix");
    }

    #[test]
    fn test_write_fixes_empty() {
        let mut buf = Vec::new();
        write_fixes(&[], &mut buf).unwrap();
        assert!(buf.is_empty());
    }
}
