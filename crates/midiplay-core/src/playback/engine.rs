//! The playback engine: everything guarded by the single critical section.
//!
//! The engine owns the source collection, the schedule, the active-state
//! tracker, the virtual clock and the device binding. It is driven from
//! two sides: the dispatch thread calls [`Engine::tick`], and the public
//! [`Playback`](super::Playback) handle calls the control and mutation
//! methods. Both go through the same mutex, so a mutation and a tick never
//! interleave.

use crate::clock::{PlaybackState, VirtualClock};
use crate::config::PlaybackSettings;
use crate::device::{DeviceBinding, OutputDevice};
use crate::error::{PlaybackError, Result};
use crate::midi::MidiEvent;
use crate::notify::{Notification, Notifier};
use crate::reconcile::{self, Correction, TrackFlags};
use crate::schedule::{EventRole, Schedule};
use crate::snapping::SnapPoints;
use crate::source::{ObjectId, SourceCollection, SourceObject};
use crate::timing::{MetricTime, TempoError, TempoMap};
use crate::tracker::{ActiveState, NoteTransition};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Engine {
    /// Caller-visible objects in declaration order.
    collection: SourceCollection,
    /// Musical to metric time conversion.
    tempo: Arc<dyn TempoMap>,
    /// Current schedule generation.
    schedule: Schedule,
    /// Index of the first event not yet delivered.
    cursor: usize,
    /// What has actually been delivered.
    tracker: ActiveState,
    clock: VirtualClock,
    device: DeviceBinding,
    notifier: Notifier,
    state: PlaybackState,
    flags: TrackFlags,
    looped: bool,
    interrupt_notes_on_stop: bool,
    snaps: SnapPoints,
    /// Wall-time period of position reports.
    position_report: Option<Duration>,
    since_report: Duration,
    /// Bumped on every run/halt transition; a dispatch thread exits once
    /// the epoch it was started with is gone.
    epoch: u64,
}

impl Engine {
    pub(crate) fn new(
        collection: SourceCollection,
        tempo: Arc<dyn TempoMap>,
        settings: &PlaybackSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let mut clock = VirtualClock::new();
        clock.set_speed(settings.speed)?;
        Ok(Self::with_clock(collection, tempo, clock, settings))
    }

    /// Engine with default properties.
    pub(crate) fn with_defaults(collection: SourceCollection, tempo: Arc<dyn TempoMap>) -> Self {
        Self::with_clock(
            collection,
            tempo,
            VirtualClock::new(),
            &PlaybackSettings::default(),
        )
    }

    fn with_clock(
        collection: SourceCollection,
        tempo: Arc<dyn TempoMap>,
        clock: VirtualClock,
        settings: &PlaybackSettings,
    ) -> Self {
        let schedule = Schedule::build(&collection, tempo.as_ref());
        for warning in schedule.warnings() {
            log::warn!("[SCHEDULE] {}", warning);
        }

        Self {
            collection,
            tempo,
            schedule,
            cursor: 0,
            tracker: ActiveState::new(),
            clock,
            device: DeviceBinding::default(),
            notifier: Notifier::new(),
            state: PlaybackState::Created,
            flags: settings.track_flags(),
            looped: settings.looped,
            interrupt_notes_on_stop: settings.interrupt_notes_on_stop,
            snaps: SnapPoints::new(),
            position_report: settings.clock.position_report(),
            since_report: Duration::ZERO,
            epoch: 0,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub(crate) fn state(&self) -> PlaybackState {
        self.state
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == PlaybackState::Running
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start or resume. Returns the new epoch if the engine began running.
    pub(crate) fn start(&mut self) -> Option<u64> {
        let duration = self.schedule.duration();
        match self.state {
            PlaybackState::Running => return None,
            PlaybackState::Finished => {
                let (start, _) = self.clock.bounds(duration);
                self.clock.seek(start, duration);
                self.cursor = self.schedule.first_at_or_after(start);
            }
            PlaybackState::Created => {
                // Keep a seek made before the first start, clamped into the window.
                let position = self.clock.seek(self.clock.position(), duration);
                self.cursor = self.schedule.first_at_or_after(position);
            }
            PlaybackState::Paused | PlaybackState::Stopped => {}
        }

        if let Err(e) = self.device.prepare() {
            self.report_device_error(e, None);
        }

        self.clock.start();
        self.since_report = Duration::ZERO;
        self.state = PlaybackState::Running;
        self.epoch += 1;
        log::info!("[PLAYBACK] Started at {}", self.clock.position());

        self.correct(self.flags);
        self.notifier.notify(Notification::Started);
        self.deliver_due();
        Some(self.epoch)
    }

    /// Halt without touching sounding notes.
    pub(crate) fn pause(&mut self) -> bool {
        if self.state != PlaybackState::Running {
            return false;
        }
        self.halt(PlaybackState::Paused);
        log::info!("[PLAYBACK] Paused at {}", self.clock.position());
        self.notifier.notify(Notification::Stopped);
        true
    }

    /// Halt and, if configured, turn off every sounding note.
    ///
    /// Idempotent: stopping a halted engine changes nothing.
    pub(crate) fn stop(&mut self) -> bool {
        let was_running = match self.state {
            PlaybackState::Running => true,
            PlaybackState::Paused => false,
            PlaybackState::Created | PlaybackState::Stopped | PlaybackState::Finished => {
                return false
            }
        };
        self.halt(PlaybackState::Stopped);
        if self.interrupt_notes_on_stop {
            self.interrupt_notes();
        }
        log::info!("[PLAYBACK] Stopped at {}", self.clock.position());
        if was_running {
            self.notifier.notify(Notification::Stopped);
        }
        true
    }

    fn halt(&mut self, state: PlaybackState) {
        self.clock.pause();
        self.state = state;
        self.epoch += 1;
    }

    fn finish(&mut self) {
        self.halt(PlaybackState::Finished);
        if self.interrupt_notes_on_stop {
            self.interrupt_notes();
        }
        log::info!("[PLAYBACK] Finished at {}", self.clock.position());
        self.notifier.notify(Notification::Finished);
    }

    fn wrap(&mut self) {
        let start = self.clock.wrap(self.schedule.duration());
        self.cursor = self.schedule.first_at_or_after(start);
        if !self.flags.notes {
            // Nothing would ever turn these off once the pass restarts.
            self.interrupt_notes();
        }
        self.correct(self.flags);
        log::debug!("[PLAYBACK] Repeat from {}", start);
        self.notifier.notify(Notification::RepeatStarted);
        self.deliver_due();
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Advance the clock by `wall_delta` and deliver what became due.
    pub(crate) fn tick(&mut self, wall_delta: Duration) {
        if self.state != PlaybackState::Running {
            return;
        }
        let duration = self.schedule.duration();
        let tick = self.clock.tick(wall_delta, duration);
        self.deliver_due();
        self.report_position(wall_delta);

        if tick.reached_end {
            let (start, end) = self.clock.bounds(duration);
            // A zero-length window would repeat on every tick.
            if self.looped && end > start {
                self.wrap();
            } else {
                self.finish();
            }
        }
    }

    fn report_position(&mut self, wall_delta: Duration) {
        let Some(period) = self.position_report else {
            return;
        };
        self.since_report += wall_delta;
        if self.since_report >= period {
            self.since_report = Duration::ZERO;
            self.notifier
                .notify(Notification::CurrentTimeChanged(self.clock.position()));
        }
    }

    /// Deliver every pending event due at or before the position.
    ///
    /// The off of a paired note that is not sounding is skipped.
    fn deliver_due(&mut self) {
        let (_, end) = self.clock.bounds(self.schedule.duration());
        let limit = self.clock.position().min(end);

        while let Some(next) = self.schedule.get(self.cursor) {
            if next.due > limit {
                break;
            }
            let scheduled = next.clone();
            let span = scheduled
                .note
                .as_ref()
                .and_then(|key| self.schedule.note(key))
                .cloned();
            self.cursor += 1;

            if scheduled.role == EventRole::NoteOff
                && scheduled
                    .note
                    .is_some_and(|key| !self.tracker.is_active(&key))
            {
                log::trace!("[DISPATCH] {} dropping off of silent note", scheduled.due);
                continue;
            }

            log::trace!("[DISPATCH] {} {:?}", scheduled.due, scheduled.event);
            self.send(&scheduled.event, Some(scheduled.source));
            match self.tracker.record(&scheduled, span.as_ref(), scheduled.due) {
                Some(NoteTransition::Started(note)) => self
                    .notifier
                    .notify(Notification::NotesPlaybackStarted(vec![note.played()])),
                Some(NoteTransition::Finished(note)) => self
                    .notifier
                    .notify(Notification::NotesPlaybackFinished(vec![note.played()])),
                None => {}
            }
        }
    }

    /// Send one event; failures become notifications.
    fn send(&mut self, event: &MidiEvent, source: Option<ObjectId>) {
        match self.device.send(event) {
            Ok(()) => self.notifier.notify(Notification::EventPlayed {
                event: event.clone(),
                source,
            }),
            Err(e) => self.report_device_error(e, Some(event.clone())),
        }
    }

    fn report_device_error(&mut self, error: anyhow::Error, event: Option<MidiEvent>) {
        log::warn!("[DEVICE] {:#} (event: {:?})", error, event);
        self.notifier.notify(Notification::DeviceErrorOccurred {
            error: Arc::new(error),
            event,
        });
    }

    fn interrupt_notes(&mut self) {
        let notes = self.tracker.take_notes();
        if notes.is_empty() {
            return;
        }
        log::debug!("[PLAYBACK] Interrupting {} sounding notes", notes.len());
        let mut played = Vec::with_capacity(notes.len());
        for note in notes {
            self.send(&note.off_event, None);
            played.push(note.played());
        }
        self.notifier
            .notify(Notification::NotesPlaybackFinished(played));
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Send the corrections that bring delivered state in line with the schedule.
    fn correct(&mut self, flags: TrackFlags) {
        let position = self.clock.position();
        let corrections =
            reconcile::reconcile(&self.schedule, self.cursor, &mut self.tracker, position, flags);
        if corrections.is_empty() {
            return;
        }
        log::debug!(
            "[RECONCILE] {} corrections at {}",
            corrections.len(),
            position
        );

        let mut started = Vec::new();
        let mut finished = Vec::new();
        for correction in &corrections {
            self.send(correction.event(), None);
            match correction {
                Correction::NoteOff(note) => finished.push(note.played()),
                Correction::NoteOn(note) => started.push(note.played()),
                Correction::Value(_) => {}
            }
        }
        if !finished.is_empty() {
            self.notifier
                .notify(Notification::NotesPlaybackFinished(finished));
        }
        if !started.is_empty() {
            self.notifier
                .notify(Notification::NotesPlaybackStarted(started));
        }
    }

    /// Rebuild the schedule after the collection changed.
    fn rebuild(&mut self) {
        let mut schedule = Schedule::build(&self.collection, self.tempo.as_ref());
        for warning in schedule.warnings() {
            if !self.schedule.warnings().contains(warning) {
                log::warn!("[SCHEDULE] {}", warning);
                self.notifier
                    .notify(Notification::ScheduleWarning(warning.clone()));
            }
        }
        let position = self.clock.position();
        self.cursor = reconcile::rebase(&self.schedule, self.cursor, &mut schedule, position);
        self.schedule = schedule;
        log::debug!(
            "[RECONCILE] Generation {}: {} events, cursor {}",
            self.collection.generation(),
            self.schedule.len(),
            self.cursor
        );
    }

    fn after_mutation(&mut self) {
        self.rebuild();
        if self.is_running() {
            self.correct(self.flags);
            self.deliver_due();
        }
    }

    // ========================================================================
    // Source collection
    // ========================================================================

    pub(crate) fn add(&mut self, objects: Vec<SourceObject>) -> Vec<ObjectId> {
        let ids = self.collection.add_all(objects);
        if !ids.is_empty() {
            self.after_mutation();
        }
        ids
    }

    pub(crate) fn remove(&mut self, ids: &[ObjectId]) -> Result<Vec<SourceObject>> {
        if let Some(unknown) = ids.iter().find(|id| !self.collection.contains(**id)) {
            return Err(PlaybackError::UnknownObject(*unknown));
        }
        let removed: Vec<SourceObject> = ids
            .iter()
            .filter_map(|id| self.collection.remove(*id))
            .collect();
        if !removed.is_empty() {
            self.after_mutation();
        }
        Ok(removed)
    }

    pub(crate) fn mutate<F, R>(&mut self, id: ObjectId, f: F) -> Result<R>
    where
        F: FnOnce(&mut SourceObject) -> R,
    {
        let result = self
            .collection
            .mutate(id, f)
            .ok_or(PlaybackError::UnknownObject(id))?;
        self.after_mutation();
        Ok(result)
    }

    pub(crate) fn collection(&self) -> &SourceCollection {
        &self.collection
    }

    // ========================================================================
    // Position
    // ========================================================================

    pub(crate) fn move_to_time(&mut self, target: MetricTime) {
        let from = self.clock.position();
        let position = self.clock.seek(target, self.schedule.duration());
        self.cursor = self.schedule.first_at_or_after(position);
        log::debug!("[PLAYBACK] Seek {} -> {}", from, position);
        if self.is_running() {
            self.correct(self.flags);
        }
    }

    pub(crate) fn move_to_start(&mut self) {
        let (start, _) = self.clock.bounds(self.schedule.duration());
        self.move_to_time(start);
    }

    pub(crate) fn move_forward(&mut self, step: MetricTime) {
        self.move_to_time(self.clock.position() + step);
    }

    pub(crate) fn move_back(&mut self, step: MetricTime) {
        self.move_to_time(self.clock.position() - step);
    }

    pub(crate) fn current_time(&self) -> MetricTime {
        self.clock.position()
    }

    pub(crate) fn current_time_ticks(&self) -> std::result::Result<u64, TempoError> {
        self.tempo.to_ticks(self.clock.position())
    }

    pub(crate) fn duration(&self) -> MetricTime {
        self.schedule.duration()
    }

    pub(crate) fn snaps_mut(&mut self) -> &mut SnapPoints {
        &mut self.snaps
    }

    pub(crate) fn move_to_next_snap_point(&mut self) -> Option<MetricTime> {
        let target = self
            .snaps
            .next_after(self.clock.position(), &self.schedule)?;
        self.move_to_time(target);
        Some(self.clock.position())
    }

    pub(crate) fn move_to_previous_snap_point(&mut self) -> Option<MetricTime> {
        let target = self
            .snaps
            .previous_before(self.clock.position(), &self.schedule)?;
        self.move_to_time(target);
        Some(self.clock.position())
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub(crate) fn speed(&self) -> f64 {
        self.clock.speed()
    }

    pub(crate) fn set_speed(&mut self, speed: f64) -> Result<()> {
        self.clock.set_speed(speed)
    }

    pub(crate) fn is_looped(&self) -> bool {
        self.looped
    }

    pub(crate) fn set_looped(&mut self, looped: bool) {
        self.looped = looped;
    }

    pub(crate) fn interrupt_notes_on_stop(&self) -> bool {
        self.interrupt_notes_on_stop
    }

    pub(crate) fn set_interrupt_notes_on_stop(&mut self, interrupt: bool) {
        self.interrupt_notes_on_stop = interrupt;
    }

    pub(crate) fn playback_start(&self) -> MetricTime {
        self.clock.bounds(self.schedule.duration()).0
    }

    pub(crate) fn playback_end(&self) -> MetricTime {
        self.clock.bounds(self.schedule.duration()).1
    }

    pub(crate) fn set_playback_start(&mut self, start: Option<MetricTime>) -> Result<()> {
        self.clock.set_window_start(start)?;
        let (start, _) = self.clock.bounds(self.schedule.duration());
        if self.clock.position() < start {
            self.move_to_time(start);
        }
        Ok(())
    }

    /// An end pulled in behind the position finishes on the next tick.
    pub(crate) fn set_playback_end(&mut self, end: Option<MetricTime>) -> Result<()> {
        self.clock.set_window_end(end)
    }

    pub(crate) fn position_report_interval(&self) -> Option<Duration> {
        self.position_report
    }

    pub(crate) fn set_position_report_interval(&mut self, period: Option<Duration>) {
        self.position_report = period.filter(|p| !p.is_zero());
        self.since_report = Duration::ZERO;
    }

    pub(crate) fn track_flags(&self) -> TrackFlags {
        self.flags
    }

    /// Change the tracked dimensions; newly enabled ones are reconciled now.
    pub(crate) fn set_track_flags(&mut self, flags: TrackFlags) {
        let enabled = TrackFlags {
            notes: flags.notes && !self.flags.notes,
            program: flags.program && !self.flags.program,
            pitch: flags.pitch && !self.flags.pitch,
            control: flags.control && !self.flags.control,
        };
        self.flags = flags;
        if self.is_running() && enabled != TrackFlags::NONE {
            self.correct(enabled);
        }
    }

    pub(crate) fn set_output_device(
        &mut self,
        device: Option<Box<dyn OutputDevice>>,
    ) -> Option<Box<dyn OutputDevice>> {
        let previous = self.device.swap(device);
        if self.is_running() {
            if let Err(e) = self.device.prepare() {
                self.report_device_error(e, None);
            }
        }
        previous
    }

    pub(crate) fn output_device_name(&self) -> Option<String> {
        self.device.name().map(str::to_string)
    }

    pub(crate) fn subscribe(&mut self) -> Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub(crate) fn active_note_count(&self) -> usize {
        self.tracker.active_count()
    }
}
