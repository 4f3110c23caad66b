//! Snap points for coarse navigation.
//!
//! User markers can be combined with automatic markers at every note
//! start; the engine uses [`SnapPoints::next_after`] and
//! [`SnapPoints::previous_before`] to jump between them.

use crate::schedule::{EventRole, Schedule};
use crate::timing::MetricTime;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct SnapPoints {
    markers: BTreeSet<MetricTime>,
    note_starts: bool,
}

impl SnapPoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, time: MetricTime) {
        self.markers.insert(time);
    }

    pub fn remove(&mut self, time: MetricTime) -> bool {
        self.markers.remove(&time)
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    pub fn markers(&self) -> impl Iterator<Item = MetricTime> + '_ {
        self.markers.iter().copied()
    }

    /// Also snap to the start of every note in the schedule.
    pub fn set_note_starts(&mut self, enabled: bool) {
        self.note_starts = enabled;
    }

    pub fn note_starts(&self) -> bool {
        self.note_starts
    }

    /// First snap point strictly after `position`.
    pub fn next_after(&self, position: MetricTime, schedule: &Schedule) -> Option<MetricTime> {
        let marker = self.markers.range(position..).find(|t| **t > position).copied();
        let note = self
            .note_starts
            .then(|| {
                schedule.events()[schedule.first_after(position)..]
                    .iter()
                    .find(|e| e.role == EventRole::NoteOn)
                    .map(|e| e.due)
            })
            .flatten();
        match (marker, note) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Last snap point strictly before `position`.
    pub fn previous_before(&self, position: MetricTime, schedule: &Schedule) -> Option<MetricTime> {
        let marker = self.markers.range(..position).next_back().copied();
        let note = self
            .note_starts
            .then(|| {
                schedule.events()[..schedule.first_at_or_after(position)]
                    .iter()
                    .rev()
                    .find(|e| e.role == EventRole::NoteOn)
                    .map(|e| e.due)
            })
            .flatten();
        match (marker, note) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}
