//! Flat schedule builder.
//!
//! Decomposes the source collection into a time-ordered list of protocol
//! events. Notes and chords become paired on/off events; raw note events
//! are paired by identity when a matching off follows. Objects whose time
//! cannot be resolved are skipped and reported as [`ScheduleWarning`]s.
//!
//! Ordering: ascending due position; at equal positions note-offs come
//! first, then derivation order (object declaration order, then
//! decomposition order inside an object).

use crate::midi::MidiEvent;
use crate::source::{Chord, Note, ObjectId, SourceCollection, SourceObject};
use crate::timing::{MetricTime, TempoError, TempoMap};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Role an event plays in note bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventRole {
    /// Start of a paired note.
    NoteOn,
    /// End of a paired note.
    NoteOff,
    /// Anything else, including unpaired note events.
    Regular,
}

/// Identity of a paired note across schedule generations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoteKey {
    /// Object that produced the note-on.
    pub source: ObjectId,
    pub channel: u8,
    pub number: u8,
    /// Disambiguates identical pitches inside one chord.
    pub occurrence: u16,
}

/// A protocol event due at a metric position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledEvent {
    /// Event to send.
    pub event: MidiEvent,
    /// Position at which the event is due.
    pub due: MetricTime,
    /// Object the event was derived from.
    pub source: ObjectId,
    /// Bookkeeping role.
    pub role: EventRole,
    /// Note the event belongs to, for paired on/off events.
    pub note: Option<NoteKey>,
    /// Tie-break group at equal due positions.
    rank: u8,
    /// Derivation order, used as the final tie-break.
    ordinal: u64,
}

impl ScheduledEvent {
    /// Identity used to match deliveries between schedule generations.
    pub fn key(&self) -> EventKey {
        EventKey {
            source: self.source,
            role: self.role,
            event: self.event.clone(),
        }
    }

    fn sort_key(&self) -> (MetricTime, u8, u64) {
        (self.due, self.rank, self.ordinal)
    }
}

/// Delivery identity of a scheduled event.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub source: ObjectId,
    pub role: EventRole,
    pub event: MidiEvent,
}

/// A paired note as laid out in the schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteSpan {
    pub key: NoteKey,
    pub on_event: MidiEvent,
    pub off_event: MidiEvent,
    pub start: MetricTime,
    pub end: MetricTime,
    /// Index of the note-on in the schedule.
    pub on_index: usize,
    /// Index of the note-off in the schedule.
    pub off_index: usize,
}

/// Why an object was skipped or scheduled without note bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WarningKind {
    /// The tempo map could not place the object.
    Tempo(TempoError),
    /// A raw note-on with no following note-off of the same identity.
    UnpairedNoteOn,
    /// A raw note-off with no preceding note-on of the same identity.
    UnpairedNoteOff,
}

/// Diagnostic produced while building a schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleWarning {
    pub source: ObjectId,
    pub kind: WarningKind,
}

impl fmt::Display for ScheduleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WarningKind::Tempo(e) => write!(f, "object {} skipped: {}", self.source, e),
            WarningKind::UnpairedNoteOn => {
                write!(f, "object {}: note-on without matching note-off", self.source)
            }
            WarningKind::UnpairedNoteOff => {
                write!(f, "object {}: note-off without matching note-on", self.source)
            }
        }
    }
}

/// The flat, ordered schedule derived from a source collection.
#[derive(Clone, Debug, Default)]
pub struct Schedule {
    events: Vec<ScheduledEvent>,
    notes: HashMap<NoteKey, NoteSpan>,
    duration: MetricTime,
    warnings: Vec<ScheduleWarning>,
}

impl Schedule {
    /// Build the schedule for the current collection.
    pub fn build(collection: &SourceCollection, tempo: &dyn TempoMap) -> Self {
        let mut builder = Builder::default();
        for (id, object) in collection.iter() {
            builder.push_object(id, object, tempo);
        }
        builder.finish()
    }

    pub fn events(&self) -> &[ScheduledEvent] {
        &self.events
    }

    pub fn get(&self, index: usize) -> Option<&ScheduledEvent> {
        self.events.get(index)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn note(&self, key: &NoteKey) -> Option<&NoteSpan> {
        self.notes.get(key)
    }

    pub fn notes(&self) -> impl Iterator<Item = &NoteSpan> {
        self.notes.values()
    }

    /// Latest due position of any event; zero when empty.
    pub fn duration(&self) -> MetricTime {
        self.duration
    }

    pub fn warnings(&self) -> &[ScheduleWarning] {
        &self.warnings
    }

    /// Index of the first event due at or after `time`.
    pub fn first_at_or_after(&self, time: MetricTime) -> usize {
        self.events.partition_point(|e| e.due < time)
    }

    /// Index of the first event due strictly after `time`.
    pub fn first_after(&self, time: MetricTime) -> usize {
        self.events.partition_point(|e| e.due <= time)
    }

    /// Split the schedule into delivered and pending events at `position`.
    ///
    /// Everything due before `position` counts as delivered. Among events
    /// due exactly at `position`, those matching `delivered` are moved in
    /// front of the rest so a single cursor separates the two groups.
    /// Returns that cursor.
    pub fn partition_at<F>(&mut self, position: MetricTime, delivered: F) -> usize
    where
        F: Fn(&ScheduledEvent) -> bool,
    {
        let lo = self.first_at_or_after(position);
        let hi = self.first_after(position);
        if lo == hi {
            return lo;
        }
        let (done, pending): (Vec<_>, Vec<_>) =
            self.events.drain(lo..hi).partition(|e| delivered(e));
        let cursor = lo + done.len();
        let tail = self.events.split_off(lo);
        self.events.extend(done);
        self.events.extend(pending);
        self.events.extend(tail);
        self.reindex_notes();
        cursor
    }

    fn reindex_notes(&mut self) {
        for (index, event) in self.events.iter().enumerate() {
            let Some(key) = event.note else {
                continue;
            };
            if let Some(span) = self.notes.get_mut(&key) {
                match event.role {
                    EventRole::NoteOn => span.on_index = index,
                    EventRole::NoteOff => span.off_index = index,
                    EventRole::Regular => {}
                }
            }
        }
    }
}

#[derive(Default)]
struct Builder {
    events: Vec<ScheduledEvent>,
    notes: HashMap<NoteKey, NoteSpan>,
    warnings: Vec<ScheduleWarning>,
    ordinal: u64,
}

impl Builder {
    fn push_object(&mut self, id: ObjectId, object: &SourceObject, tempo: &dyn TempoMap) {
        let result = match object {
            SourceObject::Event(timed) => tempo.to_metric(timed.time).map(|due| {
                self.push(timed.event.clone(), due, id, EventRole::Regular, None);
            }),
            SourceObject::Note(note) => resolve_note(note, tempo).map(|(start, end)| {
                self.push_note(id, note, 0, start, end);
            }),
            SourceObject::Chord(chord) => self.push_chord(id, chord, tempo),
        };
        if let Err(e) = result {
            self.warnings.push(ScheduleWarning {
                source: id,
                kind: WarningKind::Tempo(e),
            });
        }
    }

    fn push_chord(
        &mut self,
        id: ObjectId,
        chord: &Chord,
        tempo: &dyn TempoMap,
    ) -> Result<(), TempoError> {
        // Resolve everything first so a chord is either fully placed or skipped.
        let resolved = chord
            .notes
            .iter()
            .map(|note| resolve_note(note, tempo))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen: HashMap<(u8, u8), u16> = HashMap::new();
        for (note, (start, end)) in chord.notes.iter().zip(resolved) {
            let occurrence = seen.entry((note.channel, note.number)).or_insert(0);
            let current = *occurrence;
            *occurrence += 1;
            self.push_note(id, note, current, start, end);
        }
        Ok(())
    }

    fn push_note(
        &mut self,
        id: ObjectId,
        note: &Note,
        occurrence: u16,
        start: MetricTime,
        end: MetricTime,
    ) {
        let key = NoteKey {
            source: id,
            channel: note.channel,
            number: note.number,
            occurrence,
        };
        self.push(note.on_event(), start, id, EventRole::NoteOn, Some(key));
        self.push(note.off_event(), end, id, EventRole::NoteOff, Some(key));
        if start == end {
            self.hold_zero_length_off();
        }
        self.notes.insert(
            key,
            NoteSpan {
                key,
                on_event: note.on_event(),
                off_event: note.off_event(),
                start,
                end,
                on_index: 0,
                off_index: 0,
            },
        );
    }

    fn push(
        &mut self,
        event: MidiEvent,
        due: MetricTime,
        source: ObjectId,
        role: EventRole,
        note: Option<NoteKey>,
    ) {
        // Note-offs go first at equal positions.
        let rank = if role == EventRole::NoteOff || event.is_note_off() {
            0
        } else {
            1
        };
        self.events.push(ScheduledEvent {
            event,
            due,
            source,
            role,
            note,
            rank,
            ordinal: self.ordinal,
        });
        self.ordinal += 1;
    }

    /// A zero-length note still sends its on before its off.
    fn hold_zero_length_off(&mut self) {
        if let Some(off) = self.events.last_mut() {
            off.rank = 2;
        }
    }

    /// Pair raw note-on/off events: each off closes the earliest open on
    /// of the same identity.
    fn pair_raw_notes(&mut self) {
        let mut raw: Vec<usize> = self
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role == EventRole::Regular && e.event.note_identity().is_some())
            .map(|(i, _)| i)
            .collect();
        raw.sort_by_key(|&i| (self.events[i].due, self.events[i].ordinal));

        let mut open: HashMap<(u8, u8), VecDeque<usize>> = HashMap::new();
        let mut pairs = Vec::new();
        let mut orphan_offs = Vec::new();
        for i in raw {
            let Some(identity) = self.events[i].event.note_identity() else {
                continue;
            };
            if self.events[i].event.is_note_off() {
                match open.get_mut(&identity).and_then(VecDeque::pop_front) {
                    Some(on) => pairs.push((on, i)),
                    None => orphan_offs.push(i),
                }
            } else {
                open.entry(identity).or_default().push_back(i);
            }
        }

        for (on, off) in pairs {
            let (channel, number) = self.events[on].event.note_identity().unwrap_or_default();
            let key = NoteKey {
                source: self.events[on].source,
                channel,
                number,
                occurrence: 0,
            };
            self.events[on].role = EventRole::NoteOn;
            self.events[on].note = Some(key);
            self.events[off].role = EventRole::NoteOff;
            self.events[off].note = Some(key);
            if self.events[off].due == self.events[on].due {
                self.events[off].rank = 2;
            }
            self.notes.insert(
                key,
                NoteSpan {
                    key,
                    on_event: self.events[on].event.clone(),
                    off_event: self.events[off].event.clone(),
                    start: self.events[on].due,
                    end: self.events[off].due,
                    on_index: 0,
                    off_index: 0,
                },
            );
        }

        for i in orphan_offs {
            self.warnings.push(ScheduleWarning {
                source: self.events[i].source,
                kind: WarningKind::UnpairedNoteOff,
            });
        }
        let mut orphan_ons: Vec<usize> = open.into_values().flatten().collect();
        orphan_ons.sort_unstable();
        for i in orphan_ons {
            self.warnings.push(ScheduleWarning {
                source: self.events[i].source,
                kind: WarningKind::UnpairedNoteOn,
            });
        }
    }

    fn finish(mut self) -> Schedule {
        self.pair_raw_notes();
        self.events.sort_by_key(ScheduledEvent::sort_key);
        let duration = self
            .events
            .iter()
            .map(|e| e.due)
            .max()
            .unwrap_or(MetricTime::ZERO);
        let mut schedule = Schedule {
            events: self.events,
            notes: self.notes,
            duration,
            warnings: self.warnings,
        };
        schedule.reindex_notes();
        schedule
    }
}

fn resolve_note(note: &Note, tempo: &dyn TempoMap) -> Result<(MetricTime, MetricTime), TempoError> {
    let start = tempo.to_metric(note.time)?;
    let end_ticks = note
        .time
        .checked_add(note.length)
        .ok_or(TempoError::Overflow(note.time))?;
    let end = tempo.to_metric(end_ticks)?;
    Ok((start, end))
}
