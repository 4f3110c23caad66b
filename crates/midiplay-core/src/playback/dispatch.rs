//! The dispatch thread.
//!
//! One thread per running epoch. It sleeps for the configured interval,
//! measures the wall time that actually passed, and hands it to the
//! engine. Pause, stop, finish and restart all bump the engine's epoch,
//! which makes a stale thread exit on its next wake-up.

use super::Shared;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    epoch: u64,
    interval: Duration,
    last_tick: Instant,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, epoch: u64, interval: Duration) -> Self {
        Self {
            shared,
            epoch,
            interval,
            last_tick: Instant::now(),
        }
    }

    pub(crate) fn run(&mut self) {
        log::debug!("[DISPATCH] Thread started (epoch {})", self.epoch);

        loop {
            thread::sleep(self.interval);
            let now = Instant::now();
            let delta = now.saturating_duration_since(self.last_tick);
            self.last_tick = now;

            let epoch = self.epoch;
            let keep_going = self.shared.with_engine(|engine| {
                if engine.epoch() != epoch || !engine.is_running() {
                    return false;
                }
                engine.tick(delta);
                engine.is_running()
            });
            if !keep_going {
                break;
            }
        }

        // Wake anyone blocked in `play`.
        self.shared.finished.notify_all();
        log::debug!("[DISPATCH] Thread exited (epoch {})", self.epoch);
    }
}
