//! Playback notifications.
//!
//! The engine never calls host code while it holds its lock. Instead every
//! lifecycle change is pushed as a [`Notification`] to each subscriber's
//! channel; hosts drain their receiver at their own pace.

use crate::midi::MidiEvent;
use crate::schedule::ScheduleWarning;
use crate::source::ObjectId;
use crate::timing::MetricTime;
use crate::tracker::PlayedNote;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;

/// Something that happened during playback.
#[derive(Debug, Clone)]
pub enum Notification {
    // === Lifecycle ===
    /// The clock started or resumed.
    Started,
    /// The clock was stopped or paused.
    Stopped,
    /// A non-looping pass reached the end.
    Finished,
    /// A looping pass wrapped around to the window start.
    RepeatStarted,

    // === Position ===
    /// Periodic report of the playback position while running.
    CurrentTimeChanged(MetricTime),

    // === Notes ===
    /// Notes began sounding.
    NotesPlaybackStarted(Vec<PlayedNote>),
    /// Notes stopped sounding, normally or by interruption.
    NotesPlaybackFinished(Vec<PlayedNote>),

    // === Events ===
    /// An event was handed to the output device.
    EventPlayed {
        event: MidiEvent,
        /// Originating object; `None` for synthetic corrections.
        source: Option<ObjectId>,
    },

    // === Errors and diagnostics ===
    /// The output device failed to send or prepare.
    DeviceErrorOccurred {
        error: Arc<anyhow::Error>,
        /// Event being sent; `None` when preparing the device failed.
        event: Option<MidiEvent>,
    },
    /// An object was skipped or scheduled without note pairing.
    ScheduleWarning(ScheduleWarning),
}

/// Fan-out of notifications to every live subscriber.
#[derive(Default)]
pub struct Notifier {
    subscribers: Vec<Sender<Notification>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new receiver that sees every notification from now on.
    pub fn subscribe(&mut self) -> Receiver<Notification> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver to all subscribers, dropping the ones that hung up.
    pub fn notify(&mut self, notification: Notification) {
        match self.subscribers.len() {
            0 => {}
            1 => {
                if self.subscribers[0].send(notification).is_err() {
                    self.subscribers.clear();
                }
            }
            _ => self
                .subscribers
                .retain(|tx| tx.send(notification.clone()).is_ok()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
