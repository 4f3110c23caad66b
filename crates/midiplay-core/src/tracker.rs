//! Active-state tracking.
//!
//! [`ActiveState`] remembers which notes are sounding and which program,
//! pitch bend and controller values are in force on every channel.
//! [`ChannelValues`] is the per-channel half on its own; the reconciler
//! folds a schedule prefix into one to learn what *should* be in force.

use crate::midi::{MidiEvent, CHANNEL_COUNT};
use crate::schedule::{EventRole, NoteKey, NoteSpan, ScheduledEvent};
use crate::source::ObjectId;
use crate::timing::MetricTime;
use std::collections::BTreeMap;

/// A note whose on event has been sent and whose off has not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveNote {
    pub key: NoteKey,
    pub on_event: MidiEvent,
    pub off_event: MidiEvent,
    /// Position at which the note was turned on.
    pub started_at: MetricTime,
    /// Where the scheduled note-off currently sits.
    pub expected_off: MetricTime,
}

impl ActiveNote {
    pub fn from_span(span: &NoteSpan, started_at: MetricTime) -> Self {
        Self {
            key: span.key,
            on_event: span.on_event.clone(),
            off_event: span.off_event.clone(),
            started_at,
            expected_off: span.end,
        }
    }

    /// Public description of the note for notifications.
    pub fn played(&self) -> PlayedNote {
        let velocity = match self.on_event {
            MidiEvent::NoteOn { velocity, .. } => velocity,
            _ => 0,
        };
        PlayedNote {
            source: self.key.source,
            channel: self.key.channel,
            number: self.key.number,
            velocity,
            started_at: self.started_at,
        }
    }
}

/// Note reported by note lifecycle notifications.
///
/// Built from the same [`ActiveNote`] when the note starts and when it
/// finishes, so started/finished reports for one note compare equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlayedNote {
    pub source: ObjectId,
    pub channel: u8,
    pub number: u8,
    pub velocity: u8,
    pub started_at: MetricTime,
}

/// Program, pitch and controller values of one channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub program: Option<u8>,
    pub pitch: Option<u16>,
    pub controls: BTreeMap<u8, u8>,
}

/// Per-channel values for all sixteen channels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelValues {
    channels: [ChannelState; CHANNEL_COUNT],
}

impl ChannelValues {
    /// Fold the values carried by `events`, last one wins.
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a ScheduledEvent>,
    {
        let mut values = Self::default();
        for scheduled in events {
            values.apply(&scheduled.event);
        }
        values
    }

    /// Record the value carried by `event`, if any.
    pub fn apply(&mut self, event: &MidiEvent) {
        match *event {
            MidiEvent::ProgramChange { channel, program } => {
                if let Some(state) = self.channels.get_mut(channel as usize) {
                    state.program = Some(program);
                }
            }
            MidiEvent::PitchBend { channel, value } => {
                if let Some(state) = self.channels.get_mut(channel as usize) {
                    state.pitch = Some(value);
                }
            }
            MidiEvent::ControlChange {
                channel,
                controller,
                value,
            } => {
                if let Some(state) = self.channels.get_mut(channel as usize) {
                    state.controls.insert(controller, value);
                }
            }
            _ => {}
        }
    }

    pub fn channel(&self, channel: u8) -> Option<&ChannelState> {
        self.channels.get(channel as usize)
    }

    pub fn channel_mut(&mut self, channel: u8) -> Option<&mut ChannelState> {
        self.channels.get_mut(channel as usize)
    }

    pub fn program(&self, channel: u8) -> Option<u8> {
        self.channel(channel).and_then(|c| c.program)
    }

    pub fn pitch(&self, channel: u8) -> Option<u16> {
        self.channel(channel).and_then(|c| c.pitch)
    }

    pub fn control(&self, channel: u8, controller: u8) -> Option<u8> {
        self.channel(channel)
            .and_then(|c| c.controls.get(&controller).copied())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of recording a delivered event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NoteTransition {
    Started(ActiveNote),
    Finished(ActiveNote),
}

/// What has actually been delivered: sounding notes and channel values.
#[derive(Clone, Debug, Default)]
pub struct ActiveState {
    notes: BTreeMap<NoteKey, ActiveNote>,
    values: ChannelValues,
}

impl ActiveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the state for a delivered schedule entry.
    ///
    /// Paired note-ons create an [`ActiveNote`], paired note-offs remove
    /// it. A note-off for a note that isn't sounding changes nothing.
    pub fn record(
        &mut self,
        scheduled: &ScheduledEvent,
        span: Option<&NoteSpan>,
        position: MetricTime,
    ) -> Option<NoteTransition> {
        self.values.apply(&scheduled.event);
        let key = scheduled.note?;
        match scheduled.role {
            EventRole::NoteOn => {
                let note = match span {
                    Some(span) => ActiveNote::from_span(span, position),
                    None => ActiveNote {
                        key,
                        on_event: scheduled.event.clone(),
                        off_event: MidiEvent::note_off(key.channel, key.number, 0),
                        started_at: position,
                        expected_off: position,
                    },
                };
                self.notes.insert(key, note.clone());
                Some(NoteTransition::Started(note))
            }
            EventRole::NoteOff => self.notes.remove(&key).map(NoteTransition::Finished),
            EventRole::Regular => None,
        }
    }

    pub fn is_active(&self, key: &NoteKey) -> bool {
        self.notes.contains_key(key)
    }

    pub fn active_notes(&self) -> impl Iterator<Item = &ActiveNote> {
        self.notes.values()
    }

    pub fn active_count(&self) -> usize {
        self.notes.len()
    }

    pub fn insert_note(&mut self, note: ActiveNote) {
        self.notes.insert(note.key, note);
    }

    pub fn remove_note(&mut self, key: &NoteKey) -> Option<ActiveNote> {
        self.notes.remove(key)
    }

    pub fn note_mut(&mut self, key: &NoteKey) -> Option<&mut ActiveNote> {
        self.notes.get_mut(key)
    }

    /// Remove and return every sounding note, in key order.
    pub fn take_notes(&mut self) -> Vec<ActiveNote> {
        std::mem::take(&mut self.notes).into_values().collect()
    }

    pub fn values(&self) -> &ChannelValues {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ChannelValues {
        &mut self.values
    }

    /// Forget everything, as after a restart from scratch.
    pub fn clear(&mut self) {
        self.notes.clear();
        self.values.clear();
    }
}
