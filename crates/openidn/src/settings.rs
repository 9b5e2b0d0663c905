// SPDX-License-Identifier: MIT
// Copyright (c) 2024-2026 The OpenIDN Developers

//! Persisted settings: a small key=value INI at a fixed filesystem path.
//!
//! The core consumes only two keys (`[idn_server] name`,
//! `[output] buffer_duration`) but preserves everything else it finds
//! across a load/store round trip, so provisioning tools can keep their
//! own sections in the same file.

use crate::error::Error;
use std::fmt;
use std::path::Path;

/// Parsed settings file. Section and key order are preserved across a
/// load/store round trip.
#[derive(Debug, Default)]
pub struct Settings {
    sections: Vec<Section>,
}

#[derive(Debug)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Settings {
    /// Load from disk; a missing file yields empty settings.
    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Parse INI text: `[section]` headers, `key=value` lines, `;`/`#`
    /// comments and blank lines.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut settings = Settings::default();

        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let Some(name) = name.strip_suffix(']') else {
                    return Err(Error::SettingsParse {
                        line: index + 1,
                        reason: "unterminated section header".into(),
                    });
                };
                settings.sections.push(Section {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::SettingsParse {
                    line: index + 1,
                    reason: "expected 'key=value'".into(),
                });
            };
            let Some(section) = settings.sections.last_mut() else {
                return Err(Error::SettingsParse {
                    line: index + 1,
                    reason: "key before any section header".into(),
                });
            };
            section
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(settings)
    }

    /// Write back to disk.
    pub fn store(&self, path: &Path) -> Result<(), Error> {
        std::fs::write(path, self.to_string()).map_err(Error::Io)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == section)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let index = match self.sections.iter().position(|s| s.name == section) {
            Some(index) => index,
            None => {
                self.sections.push(Section {
                    name: section.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        let entries = &mut self.sections[index].entries;
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value.to_string(),
            None => entries.push((key.to_string(), value.to_string())),
        }
    }

    // ===== Typed accessors for the keys the core consumes =====

    /// `[idn_server] name` - scan response host name.
    pub fn host_name(&self) -> Option<&str> {
        self.get("idn_server", "name")
    }

    /// `[output] buffer_duration` - driver fill-depth setpoint in ms.
    pub fn buffer_target_ms(&self) -> Option<f64> {
        self.get("output", "buffer_duration")?.parse().ok()
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            writeln!(f, "[{}]", section.name)?;
            for (key, value) in &section.entries {
                writeln!(f, "{}={}", key, value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
; OpenIDN device settings
[idn_server]
name=Stage Left

[output]
buffer_duration=25

[mode_priority]
idn=10
file=5
";

    #[test]
    fn test_parse_typed_accessors() {
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.host_name(), Some("Stage Left"));
        assert_eq!(settings.buffer_target_ms(), Some(25.0));
    }

    #[test]
    fn test_unconsumed_sections_preserved() {
        // Sections the core does not interpret survive untouched
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.get("mode_priority", "idn"), Some("10"));
        assert_eq!(settings.get("mode_priority", "file"), Some("5"));
        assert_eq!(settings.get("mode_priority", "dmx"), None);
    }

    #[test]
    fn test_comments_and_blanks_ignored() {
        let settings = Settings::parse("# top\n\n[a]\n; inner\nx = 1\n").unwrap();
        assert_eq!(settings.get("a", "x"), Some("1"));
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = Settings::parse("[a]\nbroken line\n").unwrap_err();
        assert!(matches!(err, Error::SettingsParse { line: 2, .. }));

        let err = Settings::parse("orphan=1\n").unwrap_err();
        assert!(matches!(err, Error::SettingsParse { line: 1, .. }));

        let err = Settings::parse("[unterminated\n").unwrap_err();
        assert!(matches!(err, Error::SettingsParse { line: 1, .. }));
    }

    #[test]
    fn test_set_updates_or_appends() {
        let mut settings = Settings::parse(SAMPLE).unwrap();
        settings.set("idn_server", "name", "Rig 2");
        settings.set("network", "dhcp", "true");
        assert_eq!(settings.host_name(), Some("Rig 2"));
        assert_eq!(settings.get("network", "dhcp"), Some("true"));
    }

    #[test]
    fn test_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.ini");

        let mut settings = Settings::parse(SAMPLE).unwrap();
        settings.set("idn_server", "name", "Persisted");
        settings.store(&path).unwrap();

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded.host_name(), Some("Persisted"));
        assert_eq!(reloaded.buffer_target_ms(), Some(25.0));
        assert_eq!(reloaded.get("mode_priority", "idn"), Some("10"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.ini")).unwrap();
        assert_eq!(settings.host_name(), None);
    }
}
