//! Configuration file management for mlat-server.
//!
//! Reads/writes `~/.mlat-server/config.yaml` with bind addresses, the
//! output webhook, and a handful of tuning overrides. CLI flags win over
//! the file.

use std::path::{Path, PathBuf};

use mlat_core::config::MlatParams;
use mlat_core::types::MlatError;

/// Server-level settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Receiver ingest bind address.
    pub ingest: String,
    /// Status API bind address.
    pub status: String,
    /// Position feed bind address.
    pub feed: String,
    /// Optional webhook POSTed per accepted fix.
    pub webhook: Option<String>,
    /// Solver acceptance override.
    pub chi2_dof_max: Option<f64>,
    /// Group close delay override [s].
    pub close_delay_s: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ingest: "0.0.0.0:40001".into(),
            status: "127.0.0.1:8080".into(),
            feed: "0.0.0.0:40002".into(),
            webhook: None,
            chi2_dof_max: None,
            close_delay_s: None,
        }
    }
}

impl Settings {
    /// Fold the file overrides into the core parameter set.
    pub fn apply(&self, params: &mut MlatParams) {
        if let Some(v) = self.chi2_dof_max {
            params.solver.chi2_dof_max = v;
        }
        if let Some(v) = self.close_delay_s {
            params.correlator.close_delay_s = v;
        }
    }
}

/// Get the config directory path (`~/.mlat-server/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".mlat-server")
}

/// Get the default config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load settings from a file; missing file means defaults.
pub fn load_settings(path: &Path) -> Settings {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Settings::default();
    };
    parse_settings(&text).unwrap_or_default()
}

/// Save settings.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<(), MlatError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| MlatError::Config(e.to_string()))?;
    }
    std::fs::write(path, serialize_settings(settings))
        .map_err(|e| MlatError::Config(e.to_string()))?;
    Ok(())
}

/// Parse simple YAML-like settings text.
fn parse_settings(text: &str) -> Option<Settings> {
    let mut settings = Settings::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            if val.is_empty() {
                current_section = Some(key.to_string());
            } else {
                current_section = None;
                if key == "webhook" {
                    settings.webhook = parse_string_value(val);
                }
            }
        } else if let Some(ref section) = current_section {
            match section.as_str() {
                "server" => match key {
                    "ingest" => {
                        if let Some(v) = parse_string_value(val) {
                            settings.ingest = v;
                        }
                    }
                    "status" => {
                        if let Some(v) = parse_string_value(val) {
                            settings.status = v;
                        }
                    }
                    "feed" => {
                        if let Some(v) = parse_string_value(val) {
                            settings.feed = v;
                        }
                    }
                    _ => {}
                },
                "solver" => {
                    if key == "chi2_dof_max" {
                        settings.chi2_dof_max = parse_float_value(val);
                    }
                }
                "correlator" => {
                    if key == "close_delay_s" {
                        settings.close_delay_s = parse_float_value(val);
                    }
                }
                _ => {}
            }
        }
    }
    Some(settings)
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    if (val.starts_with('"') && val.ends_with('"'))
        || (val.starts_with('\'') && val.ends_with('\''))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_float_value(val: &str) -> Option<f64> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    val.parse().ok()
}

/// Serialize settings to YAML-like text.
fn serialize_settings(settings: &Settings) -> String {
    let mut lines = vec!["# mlat-server configuration".to_string(), String::new()];

    lines.push("server:".into());
    lines.push(format!("  ingest: \"{}\"", settings.ingest));
    lines.push(format!("  status: \"{}\"", settings.status));
    lines.push(format!("  feed: \"{}\"", settings.feed));
    lines.push(String::new());

    lines.push("solver:".into());
    match settings.chi2_dof_max {
        Some(v) => lines.push(format!("  chi2_dof_max: {v}")),
        None => lines.push("  chi2_dof_max: null".into()),
    }
    lines.push(String::new());

    lines.push("correlator:".into());
    match settings.close_delay_s {
        Some(v) => lines.push(format!("  close_delay_s: {v}")),
        None => lines.push("  close_delay_s: null".into()),
    }
    lines.push(String::new());

    match &settings.webhook {
        Some(url) => lines.push(format!("webhook: \"{url}\"")),
        None => lines.push("webhook: null".into()),
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert_eq!(s.ingest, "0.0.0.0:40001");
        assert!(s.webhook.is_none());
    }

    #[test]
    fn test_parse_settings() {
        let text = r#"
server:
  ingest: "0.0.0.0:50001"
  status: "0.0.0.0:9090"
  feed: "0.0.0.0:50002"

solver:
  chi2_dof_max: 16.0

correlator:
  close_delay_s: 0.8

webhook: "https://example.com/hook"
"#;
        let s = parse_settings(text).unwrap();
        assert_eq!(s.ingest, "0.0.0.0:50001");
        assert_eq!(s.status, "0.0.0.0:9090");
        assert_eq!(s.chi2_dof_max, Some(16.0));
        assert_eq!(s.close_delay_s, Some(0.8));
        assert_eq!(s.webhook, Some("https://example.com/hook".into()));
    }

    #[test]
    fn test_roundtrip() {
        let s = Settings {
            ingest: "127.0.0.1:1".into(),
            status: "127.0.0.1:2".into(),
            feed: "127.0.0.1:3".into(),
            webhook: Some("https://example.com".into()),
            chi2_dof_max: Some(9.0),
            close_delay_s: None,
        };
        let parsed = parse_settings(&serialize_settings(&s)).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn test_apply_overrides() {
        let s = Settings {
            chi2_dof_max: Some(16.0),
            close_delay_s: Some(0.8),
            ..Settings::default()
        };
        let mut params = MlatParams::default();
        s.apply(&mut params);
        assert_eq!(params.solver.chi2_dof_max, 16.0);
        assert_eq!(params.correlator.close_delay_s, 0.8);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings(&dir.path().join("nope.yaml"));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let s = Settings {
            webhook: Some("https://example.com/x".into()),
            ..Settings::default()
        };
        save_settings(&s, &path).unwrap();
        assert_eq!(load_settings(&path), s);
    }
}
