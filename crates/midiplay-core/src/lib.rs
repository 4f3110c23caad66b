//! midiplay core - real-time MIDI playback with live editing.
//!
//! This crate plays a collection of timed musical objects through a MIDI
//! output while the collection keeps changing:
//!
//! - **Source** - Raw events, notes and chords in a versioned arena
//! - **Schedule** - The flat, ordered list of protocol events derived from the source
//! - **Tracker** - Sounding notes and effective per-channel values
//! - **Reconcile** - Corrections that follow an edit or a seek
//! - **Clock** - Scaled, seekable, windowed playback position
//! - **Playback** - The engine, the dispatch thread and the public handle
//! - **Device** - Hot-swappable output sinks (midir behind `native`)
//! - **Recording** - Takes of incoming events turned back into objects
//!
//! # Architecture
//!
//! Every operation on a [`Playback`] runs inside one critical section
//! shared with the dispatch thread. Edits rebuild the [`Schedule`], carry
//! the delivery cursor across by event identity and send the corrective
//! events right away; the dispatch thread then continues from the cursor.
//! Hosts observe playback through [`Notification`]s on a crossbeam channel.
//!
//! ```no_run
//! use midiplay_core::{FixedTempo, Note, Playback, SourceObject};
//! use std::sync::Arc;
//!
//! let playback = Playback::new(
//!     vec![SourceObject::from(Note::new(60).with_length(480))],
//!     Arc::new(FixedTempo::default()),
//! );
//! playback.play().unwrap();
//! ```
//!
//! # Feature Flags
//!
//! - `native` (default) - Hardware MIDI output through midir

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod midi;
pub mod notify;
pub mod playback;
pub mod reconcile;
pub mod recording;
pub mod schedule;
pub mod snapping;
pub mod source;
pub mod timing;
pub mod tracker;

pub use clock::{PlaybackState, VirtualClock};
pub use config::{ClockSettings, PlaybackSettings, TrackingSettings};
pub use device::{CaptureDevice, CaptureHandle, DeviceBinding, LogDevice, OutputDevice};
pub use error::{PlaybackError, Result};
pub use midi::MidiEvent;
pub use notify::Notification;
pub use playback::Playback;
pub use reconcile::TrackFlags;
pub use recording::{RecordedEvent, Recorder};
pub use schedule::{Schedule, ScheduleWarning, ScheduledEvent};
pub use source::{Chord, Note, ObjectId, SourceObject, TimedEvent};
pub use timing::{FixedTempo, MetricTime, TempoError, TempoMap};
pub use tracker::PlayedNote;

#[cfg(feature = "native")]
pub use device::{list_output_ports, MidirOutput};
