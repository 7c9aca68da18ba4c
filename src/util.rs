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

use std::time::Duration;

/// Outputs the given duration in a zero padded minutes:seconds format.
pub fn duration_minutes_seconds(duration: Duration) -> String {
    let minutes = duration.as_secs() / 60;
    let secs = duration.as_secs() - minutes * 60;
    format!("{:02}:{:02}", minutes, secs)
}

/// Formats a song position as "current / end".
pub fn song_position(current_ms: u64, end_ms: u64) -> String {
    format!(
        "{} / {}",
        duration_minutes_seconds(Duration::from_millis(current_ms)),
        duration_minutes_seconds(Duration::from_millis(end_ms))
    )
}

/// Renders a payload as space separated hex bytes for logging.
pub fn hex_payload(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::util::{duration_minutes_seconds, hex_payload, song_position};

    #[test]
    fn test_duration_minutes_strings() {
        assert_eq!("00:00", duration_minutes_seconds(Duration::new(0, 0)));
        assert_eq!("00:05", duration_minutes_seconds(Duration::new(5, 0)));
        assert_eq!("00:55", duration_minutes_seconds(Duration::new(55, 0)));
        assert_eq!("01:00", duration_minutes_seconds(Duration::new(60, 0)));
        assert_eq!("02:05", duration_minutes_seconds(Duration::new(125, 0)));
        assert_eq!("60:06", duration_minutes_seconds(Duration::new(3606, 0)));
    }

    #[test]
    fn test_song_position() {
        assert_eq!("00:01 / 03:20", song_position(1_999, 200_000));
    }

    #[test]
    fn test_hex_payload() {
        assert_eq!("f4 01", hex_payload(&[0xf4, 0x01]));
        assert_eq!("00", hex_payload(&[0]));
        assert_eq!("", hex_payload(&[]));
    }
}
