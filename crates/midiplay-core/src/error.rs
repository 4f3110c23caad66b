//! Error types for midiplay.
//!
//! Only usage and configuration problems surface as [`PlaybackError`].
//! Device failures travel through the notification channel and data
//! problems become schedule warnings.

use crate::source::ObjectId;
use crate::timing::MetricTime;
use thiserror::Error;

/// Result type alias for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;

/// Errors returned synchronously by the playback API.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// Speed must be a finite, strictly positive multiplier.
    #[error("Invalid speed {0}: must be finite and greater than zero")]
    InvalidSpeed(f64),

    /// Playback end placed before playback start.
    #[error("Invalid playback window: end {end} is before start {start}")]
    InvalidWindow { start: MetricTime, end: MetricTime },

    /// The object handle is not part of the collection.
    #[error("Unknown object {0}")]
    UnknownObject(ObjectId),

    /// Blocking playback needs the internal clock thread.
    #[error("Play() is not available with a manually ticked clock")]
    ManualClock,

    /// The dispatch thread could not be spawned.
    #[error("Failed to spawn dispatch thread: {0}")]
    Spawn(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
