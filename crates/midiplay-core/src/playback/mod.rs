//! Thread-safe playback handle.
//!
//! [`Playback`] is the public surface. It wraps the engine in a single
//! mutex shared with the dispatch thread:
//!
//! - control calls (`start`, `stop`, `move_to_time`, ...) lock, act, unlock
//! - mutations of the source collection lock, rebuild, reconcile, unlock
//! - the dispatch thread locks once per quantum to advance the clock
//!
//! Hosts observe playback through [`Playback::subscribe`].

mod dispatch;
mod engine;

use crate::clock::PlaybackState;
use crate::config::{ClockSettings, PlaybackSettings};
use crate::device::OutputDevice;
use crate::error::{PlaybackError, Result};
use crate::notify::Notification;
use crate::reconcile::TrackFlags;
use crate::source::{ObjectId, SourceCollection, SourceObject};
use crate::timing::{MetricTime, TempoError, TempoMap};
use crossbeam_channel::Receiver;
use dispatch::Dispatcher;
use engine::Engine;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared between the handle and the dispatch thread.
pub(crate) struct Shared {
    engine: Mutex<Engine>,
    /// Signalled whenever the dispatch thread exits or playback halts.
    finished: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a closure inside the critical section.
    pub(crate) fn with_engine<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Engine) -> R,
    {
        let mut engine = self.lock();
        f(&mut engine)
    }
}

/// A playback of a collection of source objects.
///
/// Dropping the handle stops playback and joins the dispatch thread.
pub struct Playback {
    shared: Arc<Shared>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    clock: ClockSettings,
}

impl Playback {
    /// Create a playback with default settings.
    pub fn new<I>(objects: I, tempo: Arc<dyn TempoMap>) -> Self
    where
        I: IntoIterator<Item = SourceObject>,
    {
        let mut collection = SourceCollection::new();
        collection.add_all(objects);
        let engine = Engine::with_defaults(collection, tempo);
        Self::from_engine(engine, ClockSettings::default())
    }

    /// Create a playback with explicit initial settings.
    pub fn with_settings<I>(
        objects: I,
        tempo: Arc<dyn TempoMap>,
        settings: &PlaybackSettings,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = SourceObject>,
    {
        let mut collection = SourceCollection::new();
        collection.add_all(objects);
        let engine = Engine::new(collection, tempo, settings)?;
        Ok(Self::from_engine(engine, settings.clock.clone()))
    }

    fn from_engine(engine: Engine, clock: ClockSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine: Mutex::new(engine),
                finished: Condvar::new(),
            }),
            thread_handle: Mutex::new(None),
            clock,
        }
    }

    fn with_engine<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Engine) -> R,
    {
        self.shared.with_engine(f)
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Start playback without blocking. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        let Some(epoch) = self.with_engine(Engine::start) else {
            return Ok(());
        };
        if self.clock.manual {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let interval = self.clock.interval();
        let spawned = thread::Builder::new()
            .name("midiplay-dispatch".to_string())
            .spawn(move || Dispatcher::new(shared, epoch, interval).run());

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.with_engine(Engine::stop);
                return Err(PlaybackError::Spawn(e.to_string()));
            }
        };

        // A previous thread has already seen its epoch invalidated.
        let previous = self.lock_thread().replace(handle);
        if let Some(previous) = previous {
            let _ = previous.join();
        }
        Ok(())
    }

    /// Start playback and block until it finishes or is stopped.
    pub fn play(&self) -> Result<()> {
        if self.clock.manual {
            return Err(PlaybackError::ManualClock);
        }
        self.start()?;

        let mut engine = self.shared.lock();
        while engine.is_running() {
            engine = self
                .shared
                .finished
                .wait(engine)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Ok(())
    }

    /// Halt without interrupting sounding notes.
    pub fn pause(&self) {
        if self.with_engine(Engine::pause) {
            self.halted();
        }
    }

    /// Continue after [`pause`](Self::pause).
    pub fn resume(&self) -> Result<()> {
        if self.state() != PlaybackState::Paused {
            return Ok(());
        }
        self.start()
    }

    /// Halt playback. Safe to call from any state; repeated calls are no-ops.
    ///
    /// When interruption is enabled, sounding notes are turned off before
    /// this returns.
    pub fn stop(&self) {
        if self.with_engine(Engine::stop) {
            self.halted();
        }
    }

    fn halted(&self) {
        self.shared.finished.notify_all();
        let handle = self.lock_thread().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn lock_thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance a manual clock by `wall_delta`.
    ///
    /// With the threaded clock this advances time in addition to the
    /// dispatch thread.
    pub fn tick(&self, wall_delta: Duration) {
        let halted = self.with_engine(|engine| {
            let was_running = engine.is_running();
            engine.tick(wall_delta);
            was_running && !engine.is_running()
        });
        if halted {
            self.shared.finished.notify_all();
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.with_engine(|e| e.state())
    }

    pub fn is_running(&self) -> bool {
        self.with_engine(|e| e.is_running())
    }

    // ========================================================================
    // Position
    // ========================================================================

    pub fn move_to_time(&self, time: MetricTime) {
        self.with_engine(|e| e.move_to_time(time));
    }

    pub fn move_to_start(&self) {
        self.with_engine(Engine::move_to_start);
    }

    pub fn move_forward(&self, step: MetricTime) {
        self.with_engine(|e| e.move_forward(step));
    }

    pub fn move_back(&self, step: MetricTime) {
        self.with_engine(|e| e.move_back(step));
    }

    /// Jump to the next snap point. Returns the new position, if any.
    pub fn move_to_next_snap_point(&self) -> Option<MetricTime> {
        self.with_engine(Engine::move_to_next_snap_point)
    }

    /// Jump to the previous snap point. Returns the new position, if any.
    pub fn move_to_previous_snap_point(&self) -> Option<MetricTime> {
        self.with_engine(Engine::move_to_previous_snap_point)
    }

    pub fn add_snap_point(&self, time: MetricTime) {
        self.with_engine(|e| e.snaps_mut().add(time));
    }

    pub fn remove_snap_point(&self, time: MetricTime) -> bool {
        self.with_engine(|e| e.snaps_mut().remove(time))
    }

    pub fn clear_snap_points(&self) {
        self.with_engine(|e| e.snaps_mut().clear());
    }

    /// Also treat every note start as a snap point.
    pub fn set_snap_to_note_starts(&self, enabled: bool) {
        self.with_engine(|e| e.snaps_mut().set_note_starts(enabled));
    }

    pub fn current_time(&self) -> MetricTime {
        self.with_engine(|e| e.current_time())
    }

    /// Current position in musical ticks.
    pub fn current_time_ticks(&self) -> std::result::Result<u64, TempoError> {
        self.with_engine(|e| e.current_time_ticks())
    }

    /// End of the last object, independent of the playback window.
    pub fn duration(&self) -> MetricTime {
        self.with_engine(|e| e.duration())
    }

    // ========================================================================
    // Source collection
    // ========================================================================

    /// Add objects; the schedule is reconciled before this returns.
    pub fn add<I>(&self, objects: I) -> Vec<ObjectId>
    where
        I: IntoIterator<Item = SourceObject>,
    {
        let objects: Vec<SourceObject> = objects.into_iter().collect();
        self.with_engine(|e| e.add(objects))
    }

    /// Remove objects. Fails without changes if any id is unknown.
    pub fn remove(&self, ids: &[ObjectId]) -> Result<Vec<SourceObject>> {
        self.with_engine(|e| e.remove(ids))
    }

    /// Change an object in place.
    pub fn mutate<F, R>(&self, id: ObjectId, f: F) -> Result<R>
    where
        F: FnOnce(&mut SourceObject) -> R,
    {
        self.with_engine(|e| e.mutate(id, f))
    }

    /// Copy of an object.
    pub fn object(&self, id: ObjectId) -> Option<SourceObject> {
        self.with_engine(|e| e.collection().get(id).cloned())
    }

    /// Ids of all objects in declaration order.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.with_engine(|e| e.collection().iter().map(|(id, _)| id).collect())
    }

    // ========================================================================
    // Properties
    // ========================================================================

    pub fn speed(&self) -> f64 {
        self.with_engine(|e| e.speed())
    }

    /// Set the speed multiplier; must be finite and positive.
    pub fn set_speed(&self, speed: f64) -> Result<()> {
        self.with_engine(|e| e.set_speed(speed))
    }

    pub fn is_looped(&self) -> bool {
        self.with_engine(|e| e.is_looped())
    }

    pub fn set_loop(&self, looped: bool) {
        self.with_engine(|e| e.set_looped(looped));
    }

    pub fn interrupt_notes_on_stop(&self) -> bool {
        self.with_engine(|e| e.interrupt_notes_on_stop())
    }

    pub fn set_interrupt_notes_on_stop(&self, interrupt: bool) {
        self.with_engine(|e| e.set_interrupt_notes_on_stop(interrupt));
    }

    /// Effective window start.
    pub fn playback_start(&self) -> MetricTime {
        self.with_engine(|e| e.playback_start())
    }

    /// Effective window end.
    pub fn playback_end(&self) -> MetricTime {
        self.with_engine(|e| e.playback_end())
    }

    /// Set the window start; `None` restores the data start.
    pub fn set_playback_start(&self, start: Option<MetricTime>) -> Result<()> {
        self.with_engine(|e| e.set_playback_start(start))
    }

    /// Set the window end; `None` restores the data end.
    pub fn set_playback_end(&self, end: Option<MetricTime>) -> Result<()> {
        self.with_engine(|e| e.set_playback_end(end))
    }

    /// Wall-time period of [`Notification::CurrentTimeChanged`] reports.
    pub fn position_report_interval(&self) -> Option<Duration> {
        self.with_engine(|e| e.position_report_interval())
    }

    /// Report the position every `period` of wall time while running;
    /// `None` or a zero period turns reports off.
    pub fn set_position_report_interval(&self, period: Option<Duration>) {
        self.with_engine(|e| e.set_position_report_interval(period));
    }

    pub fn track_flags(&self) -> TrackFlags {
        self.with_engine(|e| e.track_flags())
    }

    pub fn set_track_flags(&self, flags: TrackFlags) {
        self.with_engine(|e| e.set_track_flags(flags));
    }

    pub fn track_notes(&self) -> bool {
        self.track_flags().notes
    }

    pub fn set_track_notes(&self, enabled: bool) {
        self.update_flags(|f| f.notes = enabled);
    }

    pub fn track_program(&self) -> bool {
        self.track_flags().program
    }

    pub fn set_track_program(&self, enabled: bool) {
        self.update_flags(|f| f.program = enabled);
    }

    pub fn track_pitch_value(&self) -> bool {
        self.track_flags().pitch
    }

    pub fn set_track_pitch_value(&self, enabled: bool) {
        self.update_flags(|f| f.pitch = enabled);
    }

    pub fn track_control_value(&self) -> bool {
        self.track_flags().control
    }

    pub fn set_track_control_value(&self, enabled: bool) {
        self.update_flags(|f| f.control = enabled);
    }

    fn update_flags(&self, f: impl FnOnce(&mut TrackFlags)) {
        self.with_engine(|e| {
            let mut flags = e.track_flags();
            f(&mut flags);
            e.set_track_flags(flags);
        });
    }

    /// Bind a new output device, returning the previous one.
    ///
    /// Takes effect between two sends: every event goes to exactly one device.
    pub fn set_output_device(
        &self,
        device: Option<Box<dyn OutputDevice>>,
    ) -> Option<Box<dyn OutputDevice>> {
        self.with_engine(|e| e.set_output_device(device))
    }

    pub fn output_device_name(&self) -> Option<String> {
        self.with_engine(|e| e.output_device_name())
    }

    /// Number of notes currently sounding on the output.
    pub fn active_note_count(&self) -> usize {
        self.with_engine(|e| e.active_note_count())
    }

    /// Receive every notification raised from now on.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.with_engine(|e| e.subscribe())
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
        // Paused or finished playback may still own an exiting thread.
        if let Some(handle) = self.lock_thread().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CaptureDevice, CaptureHandle};
    use crate::midi::MidiEvent;
    use crate::source::{Chord, Note, TimedEvent};
    use crate::timing::FixedTempo;
    use std::time::Instant;

    fn ms(v: i64) -> MetricTime {
        MetricTime::from_millis(v)
    }

    fn manual_settings() -> PlaybackSettings {
        let mut settings = PlaybackSettings::default();
        settings.clock.manual = true;
        settings
    }

    fn text(label: &str, time: u64) -> SourceObject {
        TimedEvent::new(MidiEvent::text(label), time).into()
    }

    fn note(number: u8, time: u64, length: u64) -> SourceObject {
        Note::new(number).with_time(time).with_length(length).into()
    }

    fn on(number: u8) -> MidiEvent {
        MidiEvent::note_on(0, number, 100)
    }

    fn off(number: u8) -> MidiEvent {
        MidiEvent::note_off(0, number, 0)
    }

    /// Manual-clock playback that tags every delivered event with the
    /// wall time (in ticked milliseconds) at which it went out.
    struct Harness {
        playback: Playback,
        output: CaptureHandle,
        elapsed: u64,
        seen: usize,
        delivered: Vec<(MidiEvent, u64)>,
    }

    impl Harness {
        fn new(objects: Vec<SourceObject>) -> Self {
            Self::with_settings(objects, manual_settings())
        }

        fn with_settings(objects: Vec<SourceObject>, settings: PlaybackSettings) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let playback =
                Playback::with_settings(objects, Arc::new(FixedTempo::millis()), &settings)
                    .unwrap();
            let device = CaptureDevice::new("capture");
            let output = device.handle();
            playback.set_output_device(Some(Box::new(device)));
            Self {
                playback,
                output,
                elapsed: 0,
                seen: 0,
                delivered: Vec::new(),
            }
        }

        fn collect(&mut self) {
            let events = self.output.midi_events();
            for event in &events[self.seen..] {
                self.delivered.push((event.clone(), self.elapsed));
            }
            self.seen = events.len();
        }

        fn start(&mut self) {
            self.playback.start().unwrap();
            self.collect();
        }

        fn advance(&mut self, millis: u64) {
            for _ in 0..millis {
                self.playback.tick(Duration::from_millis(1));
                self.elapsed += 1;
                self.collect();
            }
        }

        /// Run a control call and collect what it sent.
        fn act<R>(&mut self, f: impl FnOnce(&Playback) -> R) -> R {
            let result = f(&self.playback);
            self.collect();
            result
        }
    }

    #[test]
    fn test_event_added_during_playback_is_delivered() {
        let mut h = Harness::new(vec![note(70, 0, 1000)]);
        h.start();
        h.advance(500);
        h.act(|p| p.add(vec![text("marker", 700)]));
        h.advance(600);

        assert_eq!(
            h.delivered,
            vec![
                (on(70), 0),
                (MidiEvent::text("marker"), 700),
                (off(70), 1000),
            ]
        );
        assert_eq!(h.playback.state(), PlaybackState::Finished);
    }

    #[test]
    fn test_events_delivered_once_in_order() {
        let mut h = Harness::new(vec![
            note(60, 0, 300),
            note(62, 100, 300),
            text("a", 250),
            note(64, 300, 100),
        ]);
        h.start();
        h.advance(500);

        let times: Vec<u64> = h.delivered.iter().map(|(_, t)| *t).collect();
        assert_eq!(times, vec![0, 100, 250, 300, 300, 400, 400]);
        // Note-offs first at equal times.
        assert_eq!(h.delivered[3].0, off(60));
        assert_eq!(h.delivered[4].0, on(64));
        assert_eq!(h.output.len(), 7);
    }

    #[test]
    fn test_loop_repeats_note() {
        let mut settings = manual_settings();
        settings.looped = true;
        let mut h = Harness::with_settings(vec![note(70, 0, 500)], settings);
        let notifications = h.playback.subscribe();
        h.start();
        h.advance(1000);

        assert_eq!(
            &h.delivered[..4],
            &[(on(70), 0), (off(70), 500), (on(70), 500), (off(70), 1000)]
        );
        let repeats = notifications
            .try_iter()
            .filter(|n| matches!(n, Notification::RepeatStarted))
            .count();
        assert_eq!(repeats, 2);
        assert!(h.playback.is_running());
    }

    #[test]
    fn test_device_hot_swap() {
        let mut h = Harness::new(vec![text("first", 100), text("second", 600)]);
        h.start();
        h.advance(300);

        let second = CaptureDevice::new("second");
        let second_output = second.handle();
        let previous = h.playback.set_output_device(Some(Box::new(second)));
        assert_eq!(previous.map(|d| d.name().to_string()), Some("capture".to_string()));
        assert_eq!(h.playback.output_device_name(), Some("second".to_string()));
        h.advance(400);

        assert_eq!(h.output.midi_events(), vec![MidiEvent::text("first")]);
        assert_eq!(second_output.midi_events(), vec![MidiEvent::text("second")]);
    }

    #[test]
    fn test_stop_interrupts_sounding_notes() {
        let mut h = Harness::new(vec![note(60, 0, 2000)]);
        h.start();
        h.advance(1000);
        h.act(Playback::stop);

        assert_eq!(h.delivered, vec![(on(60), 0), (off(60), 1000)]);
        assert_eq!(h.playback.active_note_count(), 0);
        assert_eq!(h.playback.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_stop_without_interruption_leaves_notes() {
        let mut settings = manual_settings();
        settings.interrupt_notes_on_stop = false;
        let mut h = Harness::with_settings(vec![note(60, 0, 2000)], settings);
        h.start();
        h.advance(1000);
        h.act(Playback::stop);

        assert_eq!(h.delivered, vec![(on(60), 0)]);
        assert_eq!(h.playback.active_note_count(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut h = Harness::new(vec![note(60, 0, 1000)]);
        let notifications = h.playback.subscribe();
        h.playback.stop();
        assert_eq!(h.playback.state(), PlaybackState::Created);

        h.start();
        h.advance(10);
        h.playback.stop();
        h.playback.stop();
        h.advance(10);

        assert!(!h.playback.is_running());
        assert_eq!(h.playback.current_time(), ms(10));
        let stopped = notifications
            .try_iter()
            .filter(|n| matches!(n, Notification::Stopped))
            .count();
        assert_eq!(stopped, 1);
    }

    #[test]
    fn test_started_and_finished_notes_pair_up() {
        let mut h = Harness::new(vec![
            note(60, 0, 400),
            note(64, 100, 600),
            Chord::new([
                Note::new(67).with_time(200).with_length(300),
                Note::new(71).with_time(200).with_length(500),
            ])
            .into(),
        ]);
        let notifications = h.playback.subscribe();
        h.start();
        h.advance(300);
        let ids = h.playback.object_ids();
        h.playback.remove(&ids[1..2]).unwrap();
        h.playback.add(vec![note(72, 100, 500)]);
        h.advance(200);
        h.playback.stop();

        let mut started = Vec::new();
        let mut finished = Vec::new();
        for notification in notifications.try_iter() {
            match notification {
                Notification::NotesPlaybackStarted(notes) => started.extend(notes),
                Notification::NotesPlaybackFinished(notes) => finished.extend(notes),
                _ => {}
            }
        }
        let key = |n: &crate::tracker::PlayedNote| (n.source.as_u64(), n.number, n.started_at);
        started.sort_by_key(key);
        finished.sort_by_key(key);
        assert_eq!(started.len(), 5);
        assert_eq!(started, finished);
    }

    #[test]
    fn test_duration_ignores_window() {
        let playback = Playback::new(
            vec![
                note(60, 0, 1000),
                Chord::new([
                    Note::new(64).with_time(500).with_length(200),
                    Note::new(67).with_time(500).with_length(800),
                ])
                .into(),
                text("t", 200),
            ],
            Arc::new(FixedTempo::millis()),
        );
        assert_eq!(playback.duration(), ms(1300));
        playback.set_playback_start(Some(ms(100))).unwrap();
        playback.set_playback_end(Some(ms(400))).unwrap();
        assert_eq!(playback.duration(), ms(1300));
        assert_eq!(playback.playback_end(), ms(400));

        // Objects behind the position still count.
        playback.add(vec![note(50, 0, 2000)]);
        assert_eq!(playback.duration(), ms(2000));
    }

    #[test]
    fn test_retroactive_program_change_corrects_once() {
        let mut h = Harness::new(vec![
            note(60, 0, 1000),
            TimedEvent::new(MidiEvent::program_change(0, 70), 300).into(),
        ]);
        h.start();
        h.advance(500);
        let pc = h.playback.object_ids()[1];

        // Still in effect: nothing to send.
        h.act(|p| p.mutate(pc, |o| o.set_time(100))).unwrap();
        assert_eq!(h.delivered.len(), 2);

        // No longer in effect: the default program is restored.
        h.act(|p| p.mutate(pc, |o| o.set_time(800))).unwrap();
        assert_eq!(h.delivered[2], (MidiEvent::program_change(0, 0), 500));

        h.advance(500);
        assert_eq!(
            &h.delivered[3..],
            &[(MidiEvent::program_change(0, 70), 800), (off(60), 1000)]
        );
    }

    #[test]
    fn test_note_inserted_over_position_starts_now() {
        let mut h = Harness::new(vec![note(60, 0, 1000)]);
        h.start();
        h.advance(500);
        h.act(|p| p.add(vec![note(64, 200, 600)]));
        h.advance(500);

        assert_eq!(
            h.delivered,
            vec![(on(60), 0), (on(64), 500), (off(64), 800), (off(60), 1000)]
        );
    }

    #[test]
    fn test_removing_last_sounding_note() {
        let mut h = Harness::new(vec![note(60, 0, 1000)]);
        h.start();
        h.advance(500);
        let ids = h.playback.object_ids();
        h.act(|p| p.remove(&ids)).unwrap();
        assert_eq!(h.delivered, vec![(on(60), 0), (off(60), 500)]);

        h.advance(10);
        assert_eq!(h.delivered.len(), 2);
        assert_eq!(h.playback.state(), PlaybackState::Finished);
        assert_eq!(h.playback.duration(), MetricTime::ZERO);
    }

    #[test]
    fn test_note_removed_from_chord_turns_off_once() {
        let chord = Chord::new([
            Note::new(60).with_length(1000),
            Note::new(64).with_length(1000),
        ]);
        let mut h = Harness::new(vec![chord.into()]);
        h.start();
        h.advance(400);
        let id = h.playback.object_ids()[0];

        h.act(|p| {
            p.mutate(id, |o| {
                if let Some(chord) = o.as_chord_mut() {
                    chord.notes.retain(|n| n.number != 64);
                }
            })
        })
        .unwrap();
        h.advance(100);
        h.act(|p| {
            p.mutate(id, |o| {
                if let Some(chord) = o.as_chord_mut() {
                    chord.notes.clear();
                }
            })
        })
        .unwrap();
        h.advance(600);

        assert_eq!(
            h.delivered,
            vec![(on(60), 0), (on(64), 0), (off(64), 400), (off(60), 500)]
        );
    }

    #[test]
    fn test_seek_forward_applies_skipped_values() {
        let mut h = Harness::new(vec![
            note(60, 0, 1000),
            TimedEvent::new(MidiEvent::program_change(0, 70), 300).into(),
            text("skipped", 400),
        ]);
        h.start();
        h.advance(100);
        h.act(|p| p.move_to_time(ms(700)));
        h.advance(300);

        assert_eq!(
            h.delivered,
            vec![
                (on(60), 0),
                (MidiEvent::program_change(0, 70), 100),
                (off(60), 400),
            ]
        );
    }

    #[test]
    fn test_seek_backward_restores_values() {
        let mut h = Harness::new(vec![
            note(60, 0, 1000),
            TimedEvent::new(MidiEvent::program_change(0, 70), 300).into(),
        ]);
        h.start();
        h.advance(500);
        h.act(|p| p.move_to_time(ms(100)));
        h.advance(200);

        assert_eq!(
            h.delivered,
            vec![
                (on(60), 0),
                (MidiEvent::program_change(0, 70), 300),
                (MidiEvent::program_change(0, 0), 500),
                (MidiEvent::program_change(0, 70), 700),
            ]
        );
    }

    #[test]
    fn test_loop_repeat_does_not_reset_program_at_start() {
        let mut settings = manual_settings();
        settings.looped = true;
        let mut h = Harness::with_settings(
            vec![
                TimedEvent::new(MidiEvent::program_change(0, 70), 0).into(),
                note(60, 0, 500),
            ],
            settings,
        );
        h.start();
        h.advance(600);

        assert_eq!(
            h.delivered,
            vec![
                (MidiEvent::program_change(0, 70), 0),
                (on(60), 0),
                (off(60), 500),
                (MidiEvent::program_change(0, 70), 500),
                (on(60), 500),
            ]
        );
    }

    #[test]
    fn test_seek_onto_program_change_sends_it_once() {
        let mut h = Harness::new(vec![
            note(60, 0, 1000),
            TimedEvent::new(MidiEvent::program_change(0, 70), 300).into(),
        ]);
        h.start();
        h.advance(800);
        h.act(|p| p.move_to_time(ms(300)));
        h.advance(100);

        assert_eq!(
            h.delivered,
            vec![
                (on(60), 0),
                (MidiEvent::program_change(0, 70), 300),
                (MidiEvent::program_change(0, 70), 801),
            ]
        );
    }

    #[test]
    fn test_seek_to_note_end_stays_silent() {
        let mut h = Harness::new(vec![note(60, 0, 500), text("anchor", 2000)]);
        h.start();
        h.advance(800);
        h.act(|p| p.move_to_time(ms(500)));
        h.advance(1);

        assert_eq!(h.delivered, vec![(on(60), 0), (off(60), 500)]);
        assert_eq!(h.playback.active_note_count(), 0);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut h = Harness::new(vec![note(60, 0, 1000)]);
        let notifications = h.playback.subscribe();
        h.start();
        h.advance(300);
        h.playback.pause();
        assert_eq!(h.playback.state(), PlaybackState::Paused);
        assert_eq!(h.playback.active_note_count(), 1);

        h.playback.tick(Duration::from_millis(100));
        assert_eq!(h.playback.current_time(), ms(300));

        h.playback.resume().unwrap();
        h.advance(700);
        assert_eq!(h.delivered, vec![(on(60), 0), (off(60), 1000)]);
        assert!(notifications
            .try_iter()
            .any(|n| matches!(n, Notification::Finished)));
    }

    #[test]
    fn test_start_after_finish_restarts() {
        let mut h = Harness::new(vec![note(60, 0, 100)]);
        h.start();
        h.advance(100);
        assert_eq!(h.playback.state(), PlaybackState::Finished);
        assert!(!h.playback.is_running());

        h.start();
        assert_eq!(h.playback.current_time(), MetricTime::ZERO);
        assert_eq!(h.delivered.len(), 3);
        assert_eq!(h.delivered[2], (on(60), 100));
    }

    #[test]
    fn test_playback_window() {
        let mut h = Harness::new(vec![text("a", 100), text("b", 300), text("c", 700)]);
        h.playback.set_playback_start(Some(ms(200))).unwrap();
        h.playback.set_playback_end(Some(ms(600))).unwrap();
        assert_eq!(h.playback.current_time(), ms(200));

        h.start();
        h.advance(400);
        assert_eq!(h.delivered, vec![(MidiEvent::text("b"), 100)]);
        assert_eq!(h.playback.state(), PlaybackState::Finished);
        assert_eq!(h.playback.current_time(), ms(600));
    }

    #[test]
    fn test_speed_scales_time() {
        let mut settings = manual_settings();
        settings.speed = 2.0;
        let mut h = Harness::with_settings(vec![note(60, 0, 1000)], settings);
        h.start();
        h.advance(250);
        assert_eq!(h.playback.current_time(), ms(500));
        assert_eq!(h.playback.current_time_ticks().unwrap(), 500);
    }

    #[test]
    fn test_usage_errors_leave_state_unchanged() {
        let h = Harness::new(vec![note(60, 0, 1000)]);
        let p = &h.playback;

        assert!(matches!(p.set_speed(0.0), Err(PlaybackError::InvalidSpeed(_))));
        assert!(matches!(p.set_speed(f64::NAN), Err(PlaybackError::InvalidSpeed(_))));
        assert!((p.speed() - 1.0).abs() < f64::EPSILON);

        p.set_playback_start(Some(ms(200))).unwrap();
        assert!(matches!(
            p.set_playback_end(Some(ms(100))),
            Err(PlaybackError::InvalidWindow { .. })
        ));
        assert_eq!(p.playback_end(), ms(1000));

        let ids = p.object_ids();
        let gone = p.add(vec![text("gone", 0)])[0];
        p.remove(&[gone]).unwrap();
        let err = p.remove(&[ids[0], gone]).unwrap_err();
        assert!(matches!(err, PlaybackError::UnknownObject(_)));
        assert_eq!(p.object_ids(), ids);

        assert!(matches!(p.play(), Err(PlaybackError::ManualClock)));
        assert_eq!(p.state(), PlaybackState::Created);
    }

    #[test]
    fn test_device_errors_are_reported() {
        struct Broken;

        impl OutputDevice for Broken {
            fn send(&mut self, _event: &MidiEvent) -> anyhow::Result<()> {
                anyhow::bail!("cable unplugged")
            }
        }

        let playback = Playback::with_settings(
            vec![note(60, 0, 100)],
            Arc::new(FixedTempo::millis()),
            &manual_settings(),
        )
        .unwrap();
        playback.set_output_device(Some(Box::new(Broken)));
        let notifications = playback.subscribe();
        playback.start().unwrap();
        playback.tick(Duration::from_millis(100));

        let errors: Vec<Option<MidiEvent>> = notifications
            .try_iter()
            .filter_map(|n| match n {
                Notification::DeviceErrorOccurred { error, event } => {
                    assert!(error.to_string().contains("unplugged"));
                    Some(event)
                }
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![Some(on(60)), Some(off(60))]);
        assert_eq!(playback.state(), PlaybackState::Finished);
    }

    #[test]
    fn test_position_reports_follow_wall_time() {
        let mut settings = manual_settings();
        settings.speed = 2.0;
        settings.clock.position_report_ms = 100;
        let mut h = Harness::with_settings(vec![note(60, 0, 2000)], settings);
        let notifications = h.playback.subscribe();
        h.start();
        h.advance(350);
        h.playback.pause();
        h.playback.tick(Duration::from_millis(500));

        let positions: Vec<MetricTime> = notifications
            .try_iter()
            .filter_map(|n| match n {
                Notification::CurrentTimeChanged(position) => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![ms(200), ms(400), ms(600)]);
    }

    #[test]
    fn test_position_reports_off_by_default() {
        let mut h = Harness::new(vec![note(60, 0, 1000)]);
        let notifications = h.playback.subscribe();
        assert_eq!(h.playback.position_report_interval(), None);
        h.start();
        h.advance(300);
        assert!(!notifications
            .try_iter()
            .any(|n| matches!(n, Notification::CurrentTimeChanged(_))));

        h.playback
            .set_position_report_interval(Some(Duration::from_millis(50)));
        h.advance(120);
        let reports = notifications
            .try_iter()
            .filter(|n| matches!(n, Notification::CurrentTimeChanged(_)))
            .count();
        assert_eq!(reports, 2);

        h.playback.set_position_report_interval(Some(Duration::ZERO));
        assert_eq!(h.playback.position_report_interval(), None);
    }

    #[test]
    fn test_enabling_note_tracking_corrects() {
        let mut settings = manual_settings();
        settings.tracking.notes = false;
        let mut h = Harness::with_settings(vec![note(60, 0, 1000)], settings);
        h.start();
        h.advance(200);
        let ids = h.playback.object_ids();
        h.act(|p| p.remove(&ids)).unwrap();
        assert_eq!(h.delivered, vec![(on(60), 0)]);

        h.act(|p| p.set_track_notes(true));
        assert_eq!(h.delivered, vec![(on(60), 0), (off(60), 200)]);
        assert!(h.playback.track_notes());
    }

    #[test]
    fn test_snap_point_navigation() {
        let playback = Playback::new(
            vec![note(60, 0, 100), note(62, 600, 100)],
            Arc::new(FixedTempo::millis()),
        );
        playback.add_snap_point(ms(300));
        playback.set_snap_to_note_starts(true);

        assert_eq!(playback.move_to_next_snap_point(), Some(ms(300)));
        assert_eq!(playback.move_to_next_snap_point(), Some(ms(600)));
        assert_eq!(playback.move_to_next_snap_point(), None);
        assert_eq!(playback.move_to_previous_snap_point(), Some(ms(300)));

        playback.move_forward(ms(50));
        assert_eq!(playback.current_time(), ms(350));
        playback.move_back(ms(1000));
        assert_eq!(playback.current_time(), MetricTime::ZERO);
    }

    #[test]
    fn test_play_blocks_until_finished() {
        let playback = Playback::new(vec![note(60, 0, 30)], Arc::new(FixedTempo::millis()));
        let device = CaptureDevice::new("capture");
        let output = device.handle();
        playback.set_output_device(Some(Box::new(device)));

        let started = Instant::now();
        playback.play().unwrap();

        assert_eq!(playback.state(), PlaybackState::Finished);
        assert_eq!(output.midi_events(), vec![on(60), off(60)]);
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_cancels_play() {
        let playback = Arc::new(Playback::new(
            vec![note(60, 0, 10_000)],
            Arc::new(FixedTempo::millis()),
        ));
        let device = CaptureDevice::new("capture");
        let output = device.handle();
        playback.set_output_device(Some(Box::new(device)));

        let stopper = {
            let playback = Arc::clone(&playback);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                playback.stop();
            })
        };
        let started = Instant::now();
        playback.play().unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(playback.state(), PlaybackState::Stopped);
        assert_eq!(output.midi_events(), vec![on(60), off(60)]);
    }

    #[test]
    fn test_threaded_start_and_stop() {
        let playback = Playback::new(
            vec![note(60, 0, 10_000), text("late", 5_000)],
            Arc::new(FixedTempo::millis()),
        );
        playback.start().unwrap();
        playback.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(playback.is_running());
        assert!(playback.current_time() > MetricTime::ZERO);

        playback.stop();
        let stopped_at = playback.current_time();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(playback.current_time(), stopped_at);
        assert!(!playback.is_running());
    }
}
