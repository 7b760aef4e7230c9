// src/config/mod.rs - persisted machine settings with the `$n=value` command syntax

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use thiserror::Error;

/// Bumped whenever the on-disk layout changes; a file with a different
/// version is replaced by defaults rather than migrated.
pub const SETTINGS_VERSION: u32 = 4;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Bad number format")]
    BadNumberFormat,
    #[error("Unsupported statement")]
    UnsupportedStatement,
}

/// Outcome of a `$` command the caller must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsReply {
    /// A parameter changed; persist the store.
    Stored,
    /// Formatted parameter listing to send back verbatim.
    Dump(String),
    /// `$17`: run the work-area calibration cycle, then persist.
    Calibrate,
}

/// Machine configuration, read-only to the interpreter and motion engine.
///
/// `steps_per_mm` is derived: it is recomputed from `steps_per_turn` and
/// `rod_step` whenever either source parameter changes, and can also be
/// pinned directly through `$4`..`$6`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Leadscrew travel per motor turn, mm.
    #[serde(default = "default_rod_step")]
    pub rod_step: f64,
    #[serde(default = "default_steps_per_turn")]
    pub steps_per_turn: [u32; 3],
    #[serde(default = "default_steps_per_mm")]
    pub steps_per_mm: [f64; 3],
    /// mm/min used when a line carries no F word.
    #[serde(default = "default_feed_rate")]
    pub default_feed_rate: f64,
    /// mm/min for rapid (G0) moves.
    #[serde(default = "default_seek_rate")]
    pub default_seek_rate: f64,
    #[serde(default = "default_invert_mask")]
    pub invert_mask: u8,
    /// Arc segment density constant; see the arc interpolator.
    #[serde(default = "default_mm_per_arc_segment")]
    pub mm_per_arc_segment: f64,
    #[serde(default = "default_spindle_speed")]
    pub default_spindle_speed: i32,
    /// Usable travel per axis in mm, measured by `$17` calibration.
    #[serde(default = "default_work_area")]
    pub work_area: [f64; 3],
    /// Whether limit switches are fitted and should be honored.
    #[serde(default)]
    pub limit_switch: bool,
    /// De-energize motors after every completed move.
    #[serde(default = "default_release_after_move")]
    pub release_after_move: bool,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}
fn default_rod_step() -> f64 {
    1.25
}
fn default_steps_per_turn() -> [u32; 3] {
    [48, 48, 48]
}
fn default_steps_per_mm() -> [f64; 3] {
    let spt = default_steps_per_turn();
    let rod = default_rod_step();
    [spt[0] as f64 / rod, spt[1] as f64 / rod, spt[2] as f64 / rod]
}
fn default_feed_rate() -> f64 {
    500.0
}
fn default_seek_rate() -> f64 {
    500.0
}
fn default_invert_mask() -> u8 {
    1
}
fn default_mm_per_arc_segment() -> f64 {
    0.1
}
fn default_spindle_speed() -> i32 {
    255
}
fn default_work_area() -> [f64; 3] {
    [474.956, 375.208, 277.031]
}
fn default_release_after_move() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            rod_step: default_rod_step(),
            steps_per_turn: default_steps_per_turn(),
            steps_per_mm: default_steps_per_mm(),
            default_feed_rate: default_feed_rate(),
            default_seek_rate: default_seek_rate(),
            invert_mask: default_invert_mask(),
            mm_per_arc_segment: default_mm_per_arc_segment(),
            default_spindle_speed: default_spindle_speed(),
            work_area: default_work_area(),
            limit_switch: false,
            release_after_move: default_release_after_move(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults (and rewriting the
    /// file) when it is missing, unparsable, or carries a stale version.
    pub fn load_or_create(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, writing defaults");
            let settings = Self::default();
            settings.save(path)?;
            return Ok(settings);
        }
        let contents = std::fs::read_to_string(path)?;
        match toml::from_str::<Settings>(&contents) {
            Ok(settings) if settings.version == SETTINGS_VERSION => Ok(settings),
            Ok(settings) => {
                tracing::warn!(
                    found = settings.version,
                    expected = SETTINGS_VERSION,
                    "settings version mismatch, resetting to defaults"
                );
                let settings = Self::default();
                settings.save(path)?;
                Ok(settings)
            }
            Err(e) => {
                tracing::warn!("unreadable settings file ({e}), resetting to defaults");
                let settings = Self::default();
                settings.save(path)?;
                Ok(settings)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn recompute_steps_per_mm(&mut self) {
        for i in 0..3 {
            self.steps_per_mm[i] = self.steps_per_turn[i] as f64 / self.rod_step;
        }
    }

    /// Execute one `$`-prefixed settings line: `$$` dumps all parameters,
    /// `$n=value` stores one.
    pub fn execute_line(&mut self, line: &str) -> Result<SettingsReply, SettingsError> {
        let rest = line.strip_prefix('$').ok_or(SettingsError::UnsupportedStatement)?;
        if rest == "$" {
            return Ok(SettingsReply::Dump(self.dump()));
        }
        let eq = rest.find('=').ok_or(SettingsError::UnsupportedStatement)?;
        let parameter: u32 = rest[..eq].parse().map_err(|_| SettingsError::BadNumberFormat)?;
        let value: f64 = rest[eq + 1..].parse().map_err(|_| SettingsError::BadNumberFormat)?;
        self.store(parameter, value)
    }

    /// Store one numbered parameter. The numbering is frozen; senders script
    /// against it.
    pub fn store(&mut self, parameter: u32, value: f64) -> Result<SettingsReply, SettingsError> {
        match parameter {
            0 => {
                if value <= 0.0 {
                    return Err(SettingsError::BadNumberFormat);
                }
                self.rod_step = value;
                self.recompute_steps_per_mm();
            }
            1..=3 => {
                if value < 1.0 {
                    return Err(SettingsError::BadNumberFormat);
                }
                self.steps_per_turn[(parameter - 1) as usize] = value as u32;
                self.recompute_steps_per_mm();
            }
            4..=6 => {
                if value <= 0.0 {
                    return Err(SettingsError::BadNumberFormat);
                }
                self.steps_per_mm[(parameter - 4) as usize] = value;
            }
            // A zero or negative modal rate would make every pacing budget
            // non-finite, so the rates get the same positivity check as the
            // step parameters.
            7 => {
                if value <= 0.0 {
                    return Err(SettingsError::BadNumberFormat);
                }
                self.default_feed_rate = value;
            }
            8 => {
                if value <= 0.0 {
                    return Err(SettingsError::BadNumberFormat);
                }
                self.default_seek_rate = value;
            }
            9 => self.mm_per_arc_segment = value,
            10 => self.invert_mask = value as u8,
            11 => self.default_spindle_speed = value as i32,
            12 => self.limit_switch = value != 0.0,
            13 => self.release_after_move = value != 0.0,
            // Work area is measured by calibration, not set by hand.
            14..=16 => return Err(SettingsError::UnsupportedStatement),
            17 => return Ok(SettingsReply::Calibrate),
            18 => {
                if value == 1.0 {
                    tracing::info!("settings reset to defaults");
                    *self = Self::default();
                }
            }
            _ => return Err(SettingsError::UnsupportedStatement),
        }
        Ok(SettingsReply::Stored)
    }

    /// Parameter listing in the numbered format G-code senders expect.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "$0 = {} (mm/turn rod step)", self.rod_step);
        for i in 0..3 {
            let axis = [b'x', b'y', b'z'][i] as char;
            let _ = writeln!(out, "${} = {} (steps/turn {axis} motor)", i + 1, self.steps_per_turn[i]);
        }
        for i in 0..3 {
            let axis = [b'x', b'y', b'z'][i] as char;
            let _ = writeln!(out, "${} = {} (steps/mm {axis})", i + 4, self.steps_per_mm[i]);
        }
        let _ = writeln!(out, "$7 = {} (mm/min default feed rate)", self.default_feed_rate);
        let _ = writeln!(out, "$8 = {} (mm/min default seek rate)", self.default_seek_rate);
        let _ = writeln!(out, "$9 = {} (mm/arc segment)", self.mm_per_arc_segment);
        let _ = writeln!(out, "$10 = {} (step port invert mask)", self.invert_mask);
        let _ = writeln!(out, "$11 = {} (default spindle speed in pwm)", self.default_spindle_speed);
        let _ = writeln!(out, "$12 = {} (limit switch enable/disable, 1/0)", self.limit_switch as u8);
        let _ = writeln!(
            out,
            "$13 = {} (release motors after move enable/disable, 1/0)",
            self.release_after_move as u8
        );
        for i in 0..3 {
            let axis = [b'X', b'Y', b'Z'][i] as char;
            let _ = writeln!(out, "${} = {} (mm on {axis} axis working area)", i + 14, self.work_area[i]);
        }
        if self.limit_switch {
            let _ = writeln!(out, "$17 = 0 (recalibrate working area)");
        } else {
            let _ = writeln!(out, "$17 = 0 (recalibrate not available with limit switch disabled)");
        }
        let _ = writeln!(out, "$18 = 0 (1 to reset settings)");
        let _ = writeln!(out, "'$x=value' to set parameter or '$$' to dump current settings");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_steps_per_mm() {
        let settings = Settings::default();
        for i in 0..3 {
            assert!((settings.steps_per_mm[i] - 38.4).abs() < 1e-12);
        }
    }

    #[test]
    fn storing_rod_step_recomputes_steps_per_mm() {
        let mut settings = Settings::default();
        settings.execute_line("$0=2.5").unwrap();
        for i in 0..3 {
            assert!((settings.steps_per_mm[i] - 48.0 / 2.5).abs() < 1e-12);
        }
        settings.execute_line("$2=96").unwrap();
        assert!((settings.steps_per_mm[1] - 96.0 / 2.5).abs() < 1e-12);
        // Direct override pins the derived value.
        settings.execute_line("$5=100").unwrap();
        assert_eq!(settings.steps_per_mm[1], 100.0);
    }

    #[test]
    fn malformed_settings_lines_are_rejected() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.execute_line("$abc=1"),
            Err(SettingsError::BadNumberFormat)
        ));
        assert!(matches!(
            settings.execute_line("$7"),
            Err(SettingsError::UnsupportedStatement)
        ));
        assert!(matches!(
            settings.execute_line("$7=xyz"),
            Err(SettingsError::BadNumberFormat)
        ));
        assert!(matches!(
            settings.execute_line("$99=1"),
            Err(SettingsError::UnsupportedStatement)
        ));
    }

    #[test]
    fn modal_rates_must_be_positive() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.execute_line("$7=0"),
            Err(SettingsError::BadNumberFormat)
        ));
        assert!(matches!(
            settings.execute_line("$8=-100"),
            Err(SettingsError::BadNumberFormat)
        ));
        assert_eq!(settings.default_feed_rate, 500.0);
        assert_eq!(settings.default_seek_rate, 500.0);
    }

    #[test]
    fn dump_lists_every_parameter() {
        let dump = Settings::default().dump();
        for n in 0..=18 {
            assert!(dump.contains(&format!("${n} = ")), "missing ${n} in dump");
        }
    }

    #[test]
    fn reset_restores_defaults() {
        let mut settings = Settings::default();
        settings.execute_line("$7=123.0").unwrap();
        settings.execute_line("$12=1").unwrap();
        settings.execute_line("$18=1").unwrap();
        assert_eq!(settings.default_feed_rate, 500.0);
        assert!(!settings.limit_switch);
    }

    #[test]
    fn calibrate_request_is_surfaced_not_handled() {
        let mut settings = Settings::default();
        assert_eq!(settings.execute_line("$17=1").unwrap(), SettingsReply::Calibrate);
    }

    #[test]
    fn load_or_create_round_trips_and_resets_stale_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.toml");

        let mut settings = Settings::load_or_create(&path).unwrap();
        settings.store(7, 750.0).unwrap();
        settings.save(&path).unwrap();

        let reloaded = Settings::load_or_create(&path).unwrap();
        assert_eq!(reloaded.default_feed_rate, 750.0);

        let mut stale = reloaded.clone();
        stale.version = 1;
        stale.save(&path).unwrap();
        let reset = Settings::load_or_create(&path).unwrap();
        assert_eq!(reset.default_feed_rate, 500.0);
        assert_eq!(reset.version, SETTINGS_VERSION);
    }
}
