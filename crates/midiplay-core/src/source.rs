//! Source objects and the versioned collection that owns them.
//!
//! Objects are anchored in musical time (ticks) and converted to metric
//! time by the scheduler. The [`SourceCollection`] hands out stable
//! [`ObjectId`] handles so a changed object can be told apart from a new
//! one, and bumps a generation counter on every structural mutation.

use crate::midi::{MidiEvent, DEFAULT_OFF_VELOCITY, DEFAULT_VELOCITY};
use std::fmt;

/// Handle of an object inside a [`SourceCollection`]. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single protocol event at a musical time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub event: MidiEvent,
    pub time: u64,
}

impl TimedEvent {
    pub fn new(event: MidiEvent, time: u64) -> Self {
        Self { event, time }
    }
}

/// A note with start time and length in ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub channel: u8,
    pub number: u8,
    pub time: u64,
    pub length: u64,
    pub velocity: u8,
    pub off_velocity: u8,
}

impl Note {
    /// Create a note at tick zero with zero length on channel 0.
    pub fn new(number: u8) -> Self {
        Self {
            channel: 0,
            number,
            time: 0,
            length: 0,
            velocity: DEFAULT_VELOCITY,
            off_velocity: DEFAULT_OFF_VELOCITY,
        }
    }

    pub fn with_time(mut self, time: u64) -> Self {
        self.time = time;
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = length;
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_velocity(mut self, velocity: u8) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_off_velocity(mut self, off_velocity: u8) -> Self {
        self.off_velocity = off_velocity;
        self
    }

    /// End tick, saturating on overflow.
    pub fn end(&self) -> u64 {
        self.time.saturating_add(self.length)
    }

    pub fn on_event(&self) -> MidiEvent {
        MidiEvent::note_on(self.channel, self.number, self.velocity)
    }

    pub fn off_event(&self) -> MidiEvent {
        MidiEvent::note_off(self.channel, self.number, self.off_velocity)
    }
}

/// A group of notes edited as one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chord {
    pub notes: Vec<Note>,
}

impl Chord {
    pub fn new(notes: impl IntoIterator<Item = Note>) -> Self {
        Self {
            notes: notes.into_iter().collect(),
        }
    }

    /// Earliest note start, `None` for an empty chord.
    pub fn time(&self) -> Option<u64> {
        self.notes.iter().map(|n| n.time).min()
    }

    /// Latest note end, `None` for an empty chord.
    pub fn end(&self) -> Option<u64> {
        self.notes.iter().map(Note::end).max()
    }

    /// Move every note so the chord starts at `time`.
    pub fn set_time(&mut self, time: u64) {
        let Some(current) = self.time() else {
            return;
        };
        for note in &mut self.notes {
            let offset = note.time - current;
            note.time = time.saturating_add(offset);
        }
    }

    /// Set the length of every note.
    pub fn set_length(&mut self, length: u64) {
        for note in &mut self.notes {
            note.length = length;
        }
    }
}

/// A caller-owned timed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceObject {
    Event(TimedEvent),
    Note(Note),
    Chord(Chord),
}

impl SourceObject {
    /// Musical start time; `None` for an empty chord.
    pub fn time(&self) -> Option<u64> {
        match self {
            SourceObject::Event(e) => Some(e.time),
            SourceObject::Note(n) => Some(n.time),
            SourceObject::Chord(c) => c.time(),
        }
    }

    /// Musical end time (start plus length).
    pub fn end(&self) -> Option<u64> {
        match self {
            SourceObject::Event(e) => Some(e.time),
            SourceObject::Note(n) => Some(n.end()),
            SourceObject::Chord(c) => c.end(),
        }
    }

    /// Move the object so it starts at `time`.
    pub fn set_time(&mut self, time: u64) {
        match self {
            SourceObject::Event(e) => e.time = time,
            SourceObject::Note(n) => n.time = time,
            SourceObject::Chord(c) => c.set_time(time),
        }
    }

    pub fn as_note_mut(&mut self) -> Option<&mut Note> {
        match self {
            SourceObject::Note(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_chord_mut(&mut self) -> Option<&mut Chord> {
        match self {
            SourceObject::Chord(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_event_mut(&mut self) -> Option<&mut TimedEvent> {
        match self {
            SourceObject::Event(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TimedEvent> for SourceObject {
    fn from(value: TimedEvent) -> Self {
        SourceObject::Event(value)
    }
}

impl From<Note> for SourceObject {
    fn from(value: Note) -> Self {
        SourceObject::Note(value)
    }
}

impl From<Chord> for SourceObject {
    fn from(value: Chord) -> Self {
        SourceObject::Chord(value)
    }
}

/// Arena of source objects in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SourceCollection {
    entries: Vec<(ObjectId, SourceObject)>,
    next_id: u64,
    generation: u64,
}

impl SourceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object and return its handle.
    pub fn add(&mut self, object: impl Into<SourceObject>) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, object.into()));
        self.generation += 1;
        id
    }

    /// Append several objects; one generation bump for the whole batch.
    pub fn add_all<I>(&mut self, objects: I) -> Vec<ObjectId>
    where
        I: IntoIterator,
        I::Item: Into<SourceObject>,
    {
        let ids: Vec<ObjectId> = objects
            .into_iter()
            .map(|object| {
                let id = ObjectId(self.next_id);
                self.next_id += 1;
                self.entries.push((id, object.into()));
                id
            })
            .collect();
        if !ids.is_empty() {
            self.generation += 1;
        }
        ids
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<SourceObject> {
        let index = self.entries.iter().position(|(entry, _)| *entry == id)?;
        self.generation += 1;
        Some(self.entries.remove(index).1)
    }

    /// Edit an object in place. Returns `None` if the handle is unknown.
    pub fn mutate<F, R>(&mut self, id: ObjectId, f: F) -> Option<R>
    where
        F: FnOnce(&mut SourceObject) -> R,
    {
        let (_, object) = self.entries.iter_mut().find(|(entry, _)| *entry == id)?;
        let result = f(object);
        self.generation += 1;
        Some(result)
    }

    pub fn get(&self, id: ObjectId) -> Option<&SourceObject> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, object)| object)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &SourceObject)> {
        self.entries.iter().map(|(id, object)| (*id, object))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counter bumped by every structural change.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
