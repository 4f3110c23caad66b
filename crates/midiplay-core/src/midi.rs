//! MIDI event model.
//!
//! This module provides:
//! - [`MidiEvent`], the protocol events the scheduler emits
//! - A status-byte codec for byte-oriented sinks and recorders
//! - Channel state defaults shared by the tracker and the reconciler

/// Velocity used for notes that don't specify one.
pub const DEFAULT_VELOCITY: u8 = 100;

/// Release velocity used for notes that don't specify one.
pub const DEFAULT_OFF_VELOCITY: u8 = 0;

/// Pitch bend value that means "no bend" (14-bit centre).
pub const PITCH_BEND_CENTER: u16 = 8192;

/// Largest 14-bit pitch bend value.
pub const PITCH_BEND_MAX: u16 = 16383;

/// Number of MIDI channels.
pub const CHANNEL_COUNT: usize = 16;

/// A single protocol event.
///
/// Channels are zero-based (0-15). Data bytes are 7-bit; the codec masks
/// out-of-range values rather than rejecting them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MidiEvent {
    /// Note on event (channel 0-15, note 0-127, velocity 0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note off event with release velocity
    NoteOff { channel: u8, note: u8, velocity: u8 },
    /// Control change (channel, controller number, value)
    ControlChange {
        channel: u8,
        controller: u8,
        value: u8,
    },
    /// Program change
    ProgramChange { channel: u8, program: u8 },
    /// Pitch bend (channel, 14-bit value centered at 8192)
    PitchBend { channel: u8, value: u16 },
    /// Channel aftertouch (channel pressure)
    ChannelAftertouch { channel: u8, pressure: u8 },
    /// Polyphonic aftertouch (per-note pressure)
    PolyAftertouch { channel: u8, note: u8, pressure: u8 },
    /// Text meta event; has no wire representation.
    Text(String),
}

impl MidiEvent {
    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        MidiEvent::NoteOn {
            channel,
            note,
            velocity,
        }
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        MidiEvent::NoteOff {
            channel,
            note,
            velocity,
        }
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        MidiEvent::ProgramChange { channel, program }
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        MidiEvent::ControlChange {
            channel,
            controller,
            value,
        }
    }

    pub fn pitch_bend(channel: u8, value: u16) -> Self {
        MidiEvent::PitchBend { channel, value }
    }

    pub fn text(text: impl Into<String>) -> Self {
        MidiEvent::Text(text.into())
    }

    /// Channel of a channel voice message.
    pub fn channel(&self) -> Option<u8> {
        match self {
            MidiEvent::NoteOn { channel, .. }
            | MidiEvent::NoteOff { channel, .. }
            | MidiEvent::ControlChange { channel, .. }
            | MidiEvent::ProgramChange { channel, .. }
            | MidiEvent::PitchBend { channel, .. }
            | MidiEvent::ChannelAftertouch { channel, .. }
            | MidiEvent::PolyAftertouch { channel, .. } => Some(*channel),
            MidiEvent::Text(_) => None,
        }
    }

    /// True for a note on with non-zero velocity.
    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiEvent::NoteOn { velocity, .. } if *velocity > 0)
    }

    /// True for a note off, including the note-on-with-zero-velocity form.
    pub fn is_note_off(&self) -> bool {
        match self {
            MidiEvent::NoteOff { .. } => true,
            MidiEvent::NoteOn { velocity, .. } => *velocity == 0,
            _ => false,
        }
    }

    /// `(channel, note)` identity of a note on/off.
    pub fn note_identity(&self) -> Option<(u8, u8)> {
        match self {
            MidiEvent::NoteOn { channel, note, .. } | MidiEvent::NoteOff { channel, note, .. } => {
                Some((*channel, *note))
            }
            _ => None,
        }
    }

    /// Encode as raw MIDI bytes. Text events have no wire form.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            } => vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiEvent::NoteOff {
                channel,
                note,
                velocity,
            } => vec![0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiEvent::ControlChange {
                channel,
                controller,
                value,
            } => vec![0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F],
            MidiEvent::ProgramChange { channel, program } => {
                vec![0xC0 | (channel & 0x0F), program & 0x7F]
            }
            MidiEvent::PitchBend { channel, value } => {
                let value = (*value).min(PITCH_BEND_MAX);
                vec![
                    0xE0 | (channel & 0x0F),
                    (value & 0x7F) as u8,
                    ((value >> 7) & 0x7F) as u8,
                ]
            }
            MidiEvent::ChannelAftertouch { channel, pressure } => {
                vec![0xD0 | (channel & 0x0F), pressure & 0x7F]
            }
            MidiEvent::PolyAftertouch {
                channel,
                note,
                pressure,
            } => vec![0xA0 | (channel & 0x0F), note & 0x7F, pressure & 0x7F],
            MidiEvent::Text(_) => return None,
        };
        Some(bytes)
    }

    /// Parse raw MIDI bytes into a MidiEvent.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;

        let msg_type = status & 0xF0;
        let channel = status & 0x0F;

        match msg_type {
            0x90 if bytes.len() >= 3 => {
                let note = bytes[1];
                let velocity = bytes[2];
                if velocity == 0 {
                    // Note on with velocity 0 is treated as note off
                    Some(MidiEvent::note_off(channel, note, 0))
                } else {
                    Some(MidiEvent::note_on(channel, note, velocity))
                }
            }
            0x80 if bytes.len() >= 3 => Some(MidiEvent::note_off(channel, bytes[1], bytes[2])),
            0xB0 if bytes.len() >= 3 => {
                Some(MidiEvent::control_change(channel, bytes[1], bytes[2]))
            }
            0xE0 if bytes.len() >= 3 => {
                // Pitch bend is 14-bit: LSB + MSB
                let lsb = (bytes[1] & 0x7F) as u16;
                let msb = (bytes[2] & 0x7F) as u16;
                Some(MidiEvent::pitch_bend(channel, (msb << 7) | lsb))
            }
            0xD0 if bytes.len() >= 2 => Some(MidiEvent::ChannelAftertouch {
                channel,
                pressure: bytes[1],
            }),
            0xA0 if bytes.len() >= 3 => Some(MidiEvent::PolyAftertouch {
                channel,
                note: bytes[1],
                pressure: bytes[2],
            }),
            0xC0 if bytes.len() >= 2 => Some(MidiEvent::program_change(channel, bytes[1])),
            _ => None,
        }
    }
}
