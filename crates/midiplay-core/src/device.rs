//! Output devices and the hot-swappable device binding.
//!
//! This module provides:
//! - [`OutputDevice`], the sink trait the dispatch loop sends through
//! - [`DeviceBinding`], the slot holding the current sink
//! - [`CaptureDevice`], an in-memory sink for hosts and tests
//! - [`LogDevice`], a sink that only logs
//! - [`MidirOutput`], a hardware sink via midir (`native` feature)

use crate::midi::MidiEvent;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Destination for protocol events.
///
/// Errors are returned, never panicked; the dispatch loop turns them into
/// notifications and keeps going.
pub trait OutputDevice: Send {
    /// Send a single event.
    fn send(&mut self, event: &MidiEvent) -> anyhow::Result<()>;

    /// Get ready to receive events. Called whenever playback (re)starts.
    fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Human readable device name.
    fn name(&self) -> &str {
        "output"
    }
}

/// Slot holding the device events are currently sent to.
///
/// Lives inside the engine's critical section, so a swap happens between
/// two sends and every event goes to exactly one device.
#[derive(Default)]
pub struct DeviceBinding {
    device: Option<Box<dyn OutputDevice>>,
}

impl DeviceBinding {
    pub fn new(device: Option<Box<dyn OutputDevice>>) -> Self {
        Self { device }
    }

    /// Replace the bound device, returning the previous one.
    pub fn swap(&mut self, device: Option<Box<dyn OutputDevice>>) -> Option<Box<dyn OutputDevice>> {
        let previous = std::mem::replace(&mut self.device, device);
        log::info!(
            "[DEVICE] Output switched from {} to {}",
            previous.as_ref().map_or("none", |d| d.name()),
            self.name().unwrap_or("none")
        );
        previous
    }

    pub fn is_bound(&self) -> bool {
        self.device.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.device.as_deref().map(|d| d.name())
    }

    /// Send through the bound device. Without a device this is a no-op.
    pub fn send(&mut self, event: &MidiEvent) -> anyhow::Result<()> {
        match self.device.as_mut() {
            Some(device) => device.send(event),
            None => Ok(()),
        }
    }

    pub fn prepare(&mut self) -> anyhow::Result<()> {
        match self.device.as_mut() {
            Some(device) => device.prepare(),
            None => Ok(()),
        }
    }
}

/// An event received by a [`CaptureDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub event: MidiEvent,
    pub at: Instant,
}

/// Shared view of the events a [`CaptureDevice`] received.
#[derive(Clone, Default)]
pub struct CaptureHandle {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureHandle {
    /// Copy of everything received so far.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.lock().clone()
    }

    /// Just the events, without timestamps.
    pub fn midi_events(&self) -> Vec<MidiEvent> {
        self.lock().iter().map(|c| c.event.clone()).collect()
    }

    /// Events with their offset from `origin`.
    pub fn offsets_since(&self, origin: Instant) -> Vec<(MidiEvent, Duration)> {
        self.lock()
            .iter()
            .map(|c| (c.event.clone(), c.at.saturating_duration_since(origin)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CapturedEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory sink that timestamps everything it receives.
pub struct CaptureDevice {
    name: String,
    handle: CaptureHandle,
}

impl CaptureDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: CaptureHandle::default(),
        }
    }

    /// Handle for reading the captured events after the device is bound.
    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }
}

impl OutputDevice for CaptureDevice {
    fn send(&mut self, event: &MidiEvent) -> anyhow::Result<()> {
        self.handle.lock().push(CapturedEvent {
            event: event.clone(),
            at: Instant::now(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sink that logs events at debug level and drops them.
#[derive(Debug, Default)]
pub struct LogDevice;

impl OutputDevice for LogDevice {
    fn send(&mut self, event: &MidiEvent) -> anyhow::Result<()> {
        log::debug!("[DEVICE] {:?}", event);
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(feature = "native")]
pub use native::{list_output_ports, MidirOutput};

#[cfg(feature = "native")]
mod native {
    use super::OutputDevice;
    use crate::midi::MidiEvent;
    use anyhow::{anyhow, Context};
    use midir::{MidiOutput, MidiOutputConnection};

    const CLIENT_NAME: &str = "midiplay";

    /// List the names of available MIDI output ports.
    pub fn list_output_ports() -> anyhow::Result<Vec<String>> {
        let midi_out = MidiOutput::new(CLIENT_NAME)
            .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?;
        Ok(midi_out
            .ports()
            .iter()
            .enumerate()
            .map(|(i, port)| {
                midi_out
                    .port_name(port)
                    .unwrap_or_else(|_| format!("Unknown Device {}", i))
            })
            .collect())
    }

    /// Hardware MIDI output through midir.
    pub struct MidirOutput {
        name: String,
        connection: MidiOutputConnection,
    }

    impl MidirOutput {
        /// Open a MIDI output port by index.
        pub fn open_by_index(port_index: usize) -> anyhow::Result<Self> {
            let midi_out = MidiOutput::new(CLIENT_NAME)
                .map_err(|e| anyhow!("Failed to create MIDI output: {}", e))?;

            let ports = midi_out.ports();
            let port = ports
                .get(port_index)
                .with_context(|| format!("Invalid MIDI port index: {}", port_index))?;

            let name = midi_out
                .port_name(port)
                .unwrap_or_else(|_| format!("Unknown Device {}", port_index));

            let connection = midi_out
                .connect(port, "midiplay-output")
                .map_err(|e| anyhow!("Failed to connect to MIDI device: {}", e))?;

            log::info!("[DEVICE] Connected to MIDI output: {} (port {})", name, port_index);

            Ok(Self { name, connection })
        }

        /// Open the first output port whose name contains `name` (case-insensitive).
        pub fn open_by_name(name: &str) -> anyhow::Result<Self> {
            let name_lower = name.to_lowercase();
            let index = super::list_output_ports()?
                .iter()
                .position(|port| port.to_lowercase().contains(&name_lower))
                .with_context(|| format!("No MIDI device found matching '{}'", name))?;
            Self::open_by_index(index)
        }
    }

    impl OutputDevice for MidirOutput {
        fn send(&mut self, event: &MidiEvent) -> anyhow::Result<()> {
            // Meta events have no wire form; nothing to send.
            let Some(bytes) = event.to_bytes() else {
                return Ok(());
            };
            self.connection
                .send(&bytes)
                .map_err(|e| anyhow!("MIDI send to {} failed: {}", self.name, e))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl OutputDevice for Broken {
        fn send(&mut self, _event: &MidiEvent) -> anyhow::Result<()> {
            anyhow::bail!("cable unplugged")
        }
    }

    #[test]
    fn test_unbound_send_is_noop() {
        let mut binding = DeviceBinding::default();
        assert!(!binding.is_bound());
        assert!(binding.send(&MidiEvent::text("x")).is_ok());
        assert!(binding.prepare().is_ok());
    }

    #[test]
    fn test_swap_routes_to_new_device() {
        let a = CaptureDevice::new("a");
        let b = CaptureDevice::new("b");
        let (ha, hb) = (a.handle(), b.handle());

        let mut binding = DeviceBinding::new(Some(Box::new(a)));
        binding.send(&MidiEvent::program_change(0, 1)).unwrap();
        let previous = binding.swap(Some(Box::new(b)));
        assert_eq!(previous.map(|d| d.name().to_string()), Some("a".to_string()));
        binding.send(&MidiEvent::program_change(0, 2)).unwrap();

        assert_eq!(ha.midi_events(), vec![MidiEvent::program_change(0, 1)]);
        assert_eq!(hb.midi_events(), vec![MidiEvent::program_change(0, 2)]);
        assert_eq!(binding.name(), Some("b"));
    }

    #[test]
    fn test_send_error_returned() {
        let mut binding = DeviceBinding::new(Some(Box::new(Broken)));
        let err = binding.send(&MidiEvent::text("x")).unwrap_err();
        assert!(err.to_string().contains("unplugged"));
    }

    #[test]
    fn test_capture_offsets() {
        let origin = Instant::now();
        let mut device = CaptureDevice::new("cap");
        let handle = device.handle();
        device.send(&MidiEvent::note_on(0, 60, 100)).unwrap();
        let offsets = handle.offsets_since(origin);
        assert_eq!(offsets.len(), 1);
        assert!(offsets[0].1 < Duration::from_secs(1));
        handle.clear();
        assert!(handle.is_empty());
    }
}
