//! Recording of incoming events.
//!
//! A [`Recorder`] timestamps events relative to the moment recording
//! started. [`to_objects`] turns such a take back into source objects:
//! note-on/off pairs become [`Note`]s, everything else stays a raw event.

use crate::midi::{MidiEvent, DEFAULT_OFF_VELOCITY};
use crate::source::{Note, SourceObject, TimedEvent};
use crate::timing::{MetricTime, TempoError, TempoMap};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// An event with its offset from the start of the take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event: MidiEvent,
    pub offset: Duration,
}

/// Collects `(event, wall offset)` pairs.
#[derive(Debug, Default)]
pub struct Recorder {
    started: Option<Instant>,
    events: Vec<RecordedEvent>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new take, discarding the previous one.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.events.clear();
    }

    /// Stop recording; the take is kept.
    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn is_recording(&self) -> bool {
        self.started.is_some()
    }

    /// Record an event now. Ignored while not recording.
    pub fn record(&mut self, event: MidiEvent) {
        let Some(started) = self.started else {
            return;
        };
        self.events.push(RecordedEvent {
            event,
            offset: started.elapsed(),
        });
    }

    /// Record raw MIDI bytes; unparseable input is dropped.
    pub fn record_bytes(&mut self, bytes: &[u8]) {
        match MidiEvent::from_bytes(bytes) {
            Some(event) => self.record(event),
            None => log::debug!("[RECORD] Ignoring unparsed bytes {:?}", bytes),
        }
    }

    /// Record an event at an explicit offset.
    pub fn record_at(&mut self, event: MidiEvent, offset: Duration) {
        self.events.push(RecordedEvent { event, offset });
    }

    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<RecordedEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Rebuild source objects from a take.
///
/// Notes are paired first-in first-out per `(channel, note)`. A note-on
/// never closed becomes a raw event, as does a stray note-off.
pub fn to_objects(
    events: &[RecordedEvent],
    tempo: &dyn TempoMap,
) -> Result<Vec<SourceObject>, TempoError> {
    let mut ordered: Vec<&RecordedEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.offset);

    // Slots keep output in order of the opening event.
    let mut slots: Vec<Option<SourceObject>> = Vec::with_capacity(ordered.len());
    let mut open: HashMap<(u8, u8), VecDeque<(usize, u64, u8)>> = HashMap::new();

    for recorded in ordered {
        let ticks = tempo.to_ticks(MetricTime::from_duration(recorded.offset))?;
        let event = &recorded.event;
        match event.note_identity() {
            Some(identity) if event.is_note_on() => {
                let velocity = match event {
                    MidiEvent::NoteOn { velocity, .. } => *velocity,
                    _ => 0,
                };
                open.entry(identity)
                    .or_default()
                    .push_back((slots.len(), ticks, velocity));
                slots.push(None);
            }
            Some(identity @ (channel, number)) => {
                let opened = open.get_mut(&identity).and_then(VecDeque::pop_front);
                match opened {
                    Some((slot, start, velocity)) => {
                        let off_velocity = match event {
                            MidiEvent::NoteOff { velocity, .. } => *velocity,
                            _ => DEFAULT_OFF_VELOCITY,
                        };
                        slots[slot] = Some(SourceObject::Note(
                            Note::new(number)
                                .with_channel(channel)
                                .with_time(start)
                                .with_length(ticks.saturating_sub(start))
                                .with_velocity(velocity)
                                .with_off_velocity(off_velocity),
                        ));
                    }
                    None => slots.push(Some(TimedEvent::new(event.clone(), ticks).into())),
                }
            }
            None => slots.push(Some(TimedEvent::new(event.clone(), ticks).into())),
        }
    }

    // Unclosed note-ons stay raw.
    for ((channel, number), pending) in open {
        for (slot, start, velocity) in pending {
            let event = MidiEvent::note_on(channel, number, velocity);
            slots[slot] = Some(TimedEvent::new(event, start).into());
        }
    }

    Ok(slots.into_iter().flatten().collect())
}
