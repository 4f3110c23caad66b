//! Reconciliation of delivered state against a rebuilt schedule.
//!
//! After the source data changes (or the position jumps), the schedule is
//! rebuilt and split at the current position. Everything before the split
//! describes what *should* be in force; [`ActiveState`] describes what was
//! actually delivered. [`reconcile`] turns the difference into the smallest
//! set of [`Correction`]s:
//!
//! - notes that should no longer sound get a synthetic note-off
//! - notes that should sound but were never started get a synthetic note-on
//! - program, pitch bend and controller values get one event per changed slot
//!
//! Sounding notes that still cover the position keep sounding; only their
//! expected off position is refreshed.

use crate::midi::{MidiEvent, CHANNEL_COUNT, PITCH_BEND_CENTER};
use crate::schedule::{EventKey, NoteKey, NoteSpan, Schedule};
use crate::timing::MetricTime;
use crate::tracker::{ActiveNote, ActiveState, ChannelValues};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Program assumed when no program change is in force.
pub const DEFAULT_PROGRAM: u8 = 0;

/// Controller value assumed when no control change is in force.
pub const DEFAULT_CONTROL_VALUE: u8 = 0;

/// Which dimensions take part in reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackFlags {
    pub notes: bool,
    pub program: bool,
    pub pitch: bool,
    pub control: bool,
}

impl TrackFlags {
    pub const ALL: TrackFlags = TrackFlags {
        notes: true,
        program: true,
        pitch: true,
        control: true,
    };

    pub const NONE: TrackFlags = TrackFlags {
        notes: false,
        program: false,
        pitch: false,
        control: false,
    };
}

impl Default for TrackFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// A corrective action produced by [`reconcile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Correction {
    /// Turn off a note that should no longer sound.
    NoteOff(ActiveNote),
    /// Turn on a note whose window now covers the position.
    NoteOn(ActiveNote),
    /// Bring a program, pitch bend or controller value up to date.
    Value(MidiEvent),
}

impl Correction {
    /// Event to send for this correction.
    pub fn event(&self) -> &MidiEvent {
        match self {
            Correction::NoteOff(note) => &note.off_event,
            Correction::NoteOn(note) => &note.on_event,
            Correction::Value(event) => event,
        }
    }
}

/// Keys of the events delivered exactly at `position` under `schedule`.
pub fn delivered_at(
    schedule: &Schedule,
    cursor: usize,
    position: MetricTime,
) -> HashSet<EventKey> {
    let lo = schedule.first_at_or_after(position);
    if lo >= cursor {
        return HashSet::new();
    }
    schedule.events()[lo..cursor.min(schedule.len())]
        .iter()
        .filter(|e| e.due == position)
        .map(|e| e.key())
        .collect()
}

/// Place the cursor of a freshly built schedule.
///
/// Events due before `position` count as delivered. Events due exactly at
/// `position` count as delivered only if the previous generation already
/// delivered them; new ones stay pending and go out as due now.
pub fn rebase(
    old: &Schedule,
    old_cursor: usize,
    new: &mut Schedule,
    position: MetricTime,
) -> usize {
    let delivered = delivered_at(old, old_cursor, position);
    new.partition_at(position, |event| delivered.contains(&event.key()))
}

/// Compare what should be in force at the cursor with what was delivered.
///
/// Updates `state` to match and returns the corrections to send, note-offs
/// first, then value changes, then note-ons. A note ending exactly at
/// `position` is not restarted, and a value slot with a pending event due
/// exactly at `position` is left to that event.
pub fn reconcile(
    schedule: &Schedule,
    cursor: usize,
    state: &mut ActiveState,
    position: MetricTime,
    flags: TrackFlags,
) -> Vec<Correction> {
    let cursor = cursor.min(schedule.len());
    let should_sound: BTreeMap<NoteKey, &NoteSpan> = schedule
        .notes()
        .filter(|span| span.on_index < cursor && span.off_index >= cursor)
        .map(|span| (span.key, span))
        .collect();

    // Notes that keep sounding follow their new off position.
    for (key, span) in &should_sound {
        if let Some(active) = state.note_mut(key) {
            active.expected_off = span.end;
            active.off_event = span.off_event.clone();
        }
    }

    let mut offs = Vec::new();
    let mut ons = Vec::new();
    if flags.notes {
        let stale: Vec<NoteKey> = state
            .active_notes()
            .filter(|note| !should_sound.contains_key(&note.key))
            .map(|note| note.key)
            .collect();
        for key in stale {
            if let Some(note) = state.remove_note(&key) {
                offs.push(Correction::NoteOff(note));
            }
        }
        for (key, span) in &should_sound {
            if span.end > position && !state.is_active(key) {
                let note = ActiveNote::from_span(span, position);
                state.insert_note(note.clone());
                ons.push(Correction::NoteOn(note));
            }
        }
    }

    let events = schedule.events();
    let should = ChannelValues::from_events(&events[..cursor]);
    let due_end = schedule.first_after(position).max(cursor);
    let due_now = ChannelValues::from_events(&events[cursor..due_end]);
    let values = reconcile_values(&should, &due_now, state.values_mut(), flags);

    let mut corrections = offs;
    corrections.extend(values.into_iter().map(Correction::Value));
    corrections.extend(ons);
    corrections
}

fn reconcile_values(
    should: &ChannelValues,
    due_now: &ChannelValues,
    current: &mut ChannelValues,
    flags: TrackFlags,
) -> Vec<MidiEvent> {
    let mut events = Vec::new();
    for channel in 0..CHANNEL_COUNT as u8 {
        let (Some(target), Some(pending), Some(tracked)) = (
            should.channel(channel),
            due_now.channel(channel),
            current.channel_mut(channel),
        ) else {
            continue;
        };

        if flags.program && pending.program.is_none() {
            if let Some(program) = correction(tracked.program, target.program, DEFAULT_PROGRAM) {
                events.push(MidiEvent::program_change(channel, program));
            }
            tracked.program = target.program;
        }

        if flags.pitch && pending.pitch.is_none() {
            if let Some(value) = correction(tracked.pitch, target.pitch, PITCH_BEND_CENTER) {
                events.push(MidiEvent::pitch_bend(channel, value));
            }
            tracked.pitch = target.pitch;
        }

        if flags.control {
            let controllers: BTreeSet<u8> = tracked
                .controls
                .keys()
                .chain(target.controls.keys())
                .copied()
                .filter(|controller| !pending.controls.contains_key(controller))
                .collect();
            for controller in controllers {
                let wanted = target.controls.get(&controller).copied();
                let have = tracked.controls.get(&controller).copied();
                if let Some(value) = correction(have, wanted, DEFAULT_CONTROL_VALUE) {
                    events.push(MidiEvent::control_change(channel, controller, value));
                }
                match wanted {
                    Some(value) => tracked.controls.insert(controller, value),
                    None => tracked.controls.remove(&controller),
                };
            }
        }
    }
    events
}

/// Value to send so that `should` (or `default` if unset) is in force.
///
/// With nothing tracked the default is assumed to be in force already.
fn correction<T: Copy + PartialEq>(
    current: Option<T>,
    should: Option<T>,
    default: T,
) -> Option<T> {
    let target = should.unwrap_or(default);
    match current {
        Some(value) if value != target => Some(target),
        Some(_) => None,
        None if target != default => Some(target),
        None => None,
    }
}
