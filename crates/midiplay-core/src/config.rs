//! Configuration file support for playback defaults.
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/midiplay/config.toml`
//! - macOS: `~/Library/Application Support/midiplay/config.toml`
//! - Windows: `%APPDATA%\midiplay\config.toml`

use crate::clock::validate_speed;
use crate::error::{PlaybackError, Result};
use crate::reconcile::TrackFlags;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Initial playback properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Speed multiplier (must be > 0)
    pub speed: f64,
    /// Restart from the window start when the end is reached
    #[serde(rename = "loop")]
    pub looped: bool,
    /// Send note-offs for sounding notes on stop
    pub interrupt_notes_on_stop: bool,
    /// Which state dimensions are reconciled
    pub tracking: TrackingSettings,
    /// Dispatch clock configuration
    pub clock: ClockSettings,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            looped: false,
            interrupt_notes_on_stop: true,
            tracking: TrackingSettings::default(),
            clock: ClockSettings::default(),
        }
    }
}

impl PlaybackSettings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: PlaybackSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a specific file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load settings from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::from_path(&path)
        } else {
            Err(PlaybackError::Config(format!(
                "Config file not found at {:?}",
                path
            )))
        }
    }

    /// Load settings or return defaults if missing or invalid
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            log::debug!("[CONFIG] Using default playback settings: {}", e);
            Self::default()
        })
    }

    /// Save settings to a specific file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Save settings to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "midiplay") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(PlaybackError::Config(
                "Could not determine config directory".to_string(),
            ))
        }
    }

    /// Reject values the playback API would reject.
    pub fn validate(&self) -> Result<()> {
        validate_speed(self.speed)?;
        if self.clock.interval_ms == 0 {
            return Err(PlaybackError::Config(
                "clock.interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn track_flags(&self) -> TrackFlags {
        TrackFlags {
            notes: self.tracking.notes,
            program: self.tracking.program,
            pitch: self.tracking.pitch_value,
            control: self.tracking.control_value,
        }
    }
}

/// Reconciliation switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub notes: bool,
    pub program: bool,
    pub pitch_value: bool,
    pub control_value: bool,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            notes: true,
            program: true,
            pitch_value: true,
            control_value: true,
        }
    }
}

/// Dispatch clock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    /// Dispatch quantum in milliseconds
    pub interval_ms: u64,
    /// Host drives time through `Playback::tick` instead of a thread
    pub manual: bool,
    /// Wall-time period of position reports in milliseconds, 0 to disable
    pub position_report_ms: u64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1,
            manual: false,
            position_report_ms: 0,
        }
    }
}

impl ClockSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Period of [`Notification::CurrentTimeChanged`](crate::Notification), if enabled.
    pub fn position_report(&self) -> Option<Duration> {
        (self.position_report_ms > 0).then(|| Duration::from_millis(self.position_report_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PlaybackSettings::default();
        assert!((settings.speed - 1.0).abs() < 0.001);
        assert!(!settings.looped);
        assert!(settings.interrupt_notes_on_stop);
        assert_eq!(settings.track_flags(), TrackFlags::ALL);
        assert_eq!(settings.clock.interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings = PlaybackSettings::from_toml_str(
            r#"
speed = 1.5
loop = true

[tracking]
notes = false
"#,
        )
        .unwrap();
        assert!((settings.speed - 1.5).abs() < 0.001);
        assert!(settings.looped);
        assert!(!settings.tracking.notes);
        assert!(settings.tracking.program);
        assert!(!settings.clock.manual);
    }

    #[test]
    fn test_position_report_period() {
        assert_eq!(ClockSettings::default().position_report(), None);
        let settings =
            PlaybackSettings::from_toml_str("[clock]\nposition_report_ms = 250").unwrap();
        assert_eq!(
            settings.clock.position_report(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(settings.clock.interval_ms, 1);
    }

    #[test]
    fn test_invalid_speed_rejected() {
        let err = PlaybackSettings::from_toml_str("speed = 0.0").unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidSpeed(_)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = PlaybackSettings::from_toml_str("[clock]\ninterval_ms = 0").unwrap_err();
        assert!(matches!(err, PlaybackError::Config(_)));
    }

    #[test]
    fn test_malformed_toml() {
        let err = PlaybackSettings::from_toml_str("speed = ").unwrap_err();
        assert!(matches!(err, PlaybackError::TomlParse(_)));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut settings = PlaybackSettings::default();
        settings.speed = 2.0;
        settings.clock.manual = true;
        settings.save_to(&path).unwrap();

        let loaded = PlaybackSettings::from_path(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PlaybackSettings::from_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, PlaybackError::Io(_)));
    }
}
