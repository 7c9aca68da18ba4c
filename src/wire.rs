// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Payload encodings for the two peripheral channels.
//!
//! | Command      | Bytes | Encoding                                  |
//! |--------------|-------|-------------------------------------------|
//! | Vibration    | 2     | little-endian u16 period in ms, 0 = stop  |
//! | Note (stop)  | 1     | `0x00`                                    |
//! | Note (play)  | 2     | little-endian u16 frequency in whole Hz   |

/// The lowest MIDI note the peripheral can play. Lower notes are clamped.
pub const LOWEST_NOTE: i64 = 48;

/// The highest MIDI note the peripheral can play. Higher notes are clamped.
pub const HIGHEST_NOTE: i64 = 83;

/// Equal tempered frequencies for MIDI notes 48 (C3) through 83 (B5).
const FREQUENCIES: [f64; 36] = [
    130.81, 138.59, 146.83, 155.56, 164.81, 174.61, 185.00, 196.00, 207.65, 220.00, 233.08,
    246.94, 261.63, 277.18, 293.67, 311.13, 329.63, 349.23, 369.99, 392.00, 415.30, 440.00,
    466.16, 493.88, 523.25, 554.37, 587.33, 622.25, 659.26, 698.46, 739.99, 783.99, 830.61,
    880.00, 932.33, 987.77,
];

/// Raised when pitch or tempo data coming from the score or the engine can't be
/// turned into a command. Callers resolve it to a stop instead of propagating it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolDataError {
    #[error("tempo {0} is not a usable BPM")]
    InvalidTempo(f64),
    #[error("note value {0} is not a MIDI note number")]
    InvalidNote(f64),
}

/// Encodes a vibration period.
pub fn vibration_payload(period_ms: u16) -> Vec<u8> {
    period_ms.to_le_bytes().to_vec()
}

/// Gets the frequency for the given MIDI note, clamped to the playable range.
pub fn midi_to_frequency(midi: i64) -> f64 {
    let index = midi.clamp(LOWEST_NOTE, HIGHEST_NOTE) - LOWEST_NOTE;
    FREQUENCIES[index as usize]
}

/// A command for the notes channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteCommand {
    /// Silences the peripheral.
    Stop,
    /// Plays the given frequency in whole Hz.
    Play(u16),
}

impl NoteCommand {
    /// Resolves a note value reported by the playback engine.
    pub fn from_midi(value: f64) -> Result<NoteCommand, ProtocolDataError> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(ProtocolDataError::InvalidNote(value));
        }

        // The wire carries whole Hz, so the fractional part is truncated.
        Ok(NoteCommand::Play(midi_to_frequency(value as i64) as u16))
    }

    /// Encodes the command.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            NoteCommand::Stop => vec![0],
            NoteCommand::Play(frequency) => frequency.to_le_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vibration_payload() {
        assert_eq!(vec![0xf4, 0x01], vibration_payload(500));
        assert_eq!(vec![0x9b, 0x02], vibration_payload(667));
        assert_eq!(vec![0x00, 0x00], vibration_payload(0));
    }

    #[test]
    fn test_midi_to_frequency_clamps() {
        assert_eq!(130.81, midi_to_frequency(0));
        assert_eq!(130.81, midi_to_frequency(48));
        assert_eq!(440.0, midi_to_frequency(69));
        assert_eq!(987.77, midi_to_frequency(83));
        assert_eq!(987.77, midi_to_frequency(127));
    }

    #[test]
    fn test_note_commands() {
        assert_eq!(Ok(NoteCommand::Play(440)), NoteCommand::from_midi(69.0));
        assert_eq!(Ok(NoteCommand::Play(261)), NoteCommand::from_midi(60.0));
        assert_eq!(vec![0xb8, 0x01], NoteCommand::Play(440).payload());
        assert_eq!(vec![0x00], NoteCommand::Stop.payload());
    }

    #[test]
    fn test_malformed_notes() {
        assert!(NoteCommand::from_midi(f64::NAN).is_err());
        assert!(NoteCommand::from_midi(f64::INFINITY).is_err());
        assert!(NoteCommand::from_midi(60.5).is_err());
    }
}
