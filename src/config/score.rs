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
use serde::Deserialize;

use super::ConfigError;

const DEFAULT_NUMERATOR: u32 = 4;

/// A bar as written in a score file.
#[derive(Deserialize, Clone, Debug)]
pub(super) struct Bar {
    /// The tick the bar starts at.
    start: u64,
    /// The tempo set on this bar. Omit to keep the previous tempo.
    tempo: Option<f64>,
    /// Beats per bar (default: 4).
    numerator: Option<u32>,
    /// MIDI note values sounding in this bar.
    notes: Option<Vec<f64>>,
}

/// A score file.
#[derive(Deserialize, Clone, Debug)]
pub(super) struct Score {
    title: String,
    artist: Option<String>,
    /// The total duration in ticks.
    duration: u64,
    bars: Vec<Bar>,
    tracks: Option<Vec<String>>,
}

impl Score {
    /// Validates the score and converts it.
    pub(super) fn to_score(&self) -> Result<crate::score::Score, ConfigError> {
        if self
            .bars
            .windows(2)
            .any(|pair| pair[1].start < pair[0].start)
        {
            return Err(ConfigError::InvalidScore(format!(
                "bars of {} are out of order",
                self.title
            )));
        }
        if let Some(last) = self.bars.last() {
            if self.duration < last.start {
                return Err(ConfigError::InvalidScore(format!(
                    "{} ends at tick {} before its last bar starts at tick {}",
                    self.title, self.duration, last.start
                )));
            }
        }

        let bars = self
            .bars
            .iter()
            .map(|bar| {
                crate::score::Bar::new(
                    bar.start,
                    bar.tempo,
                    bar.numerator.unwrap_or(DEFAULT_NUMERATOR),
                )
                .with_notes(bar.notes.clone().unwrap_or_default())
            })
            .collect();

        Ok(crate::score::Score::new(
            &self.title,
            self.artist.as_deref().unwrap_or_default(),
            self.duration,
            bars,
            self.tracks.clone().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod test {
    use config::{Config, File, FileFormat};

    use crate::config::ConfigError;

    use super::Score;

    fn parse(yaml: &str) -> Result<crate::score::Score, ConfigError> {
        let score: Score = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        score.to_score()
    }

    #[test]
    fn test_score() {
        let score = parse(
            r#"
            title: Song
            artist: Artist
            duration: 1440
            tracks:
              - Guitar
              - Bass
            bars:
              - start: 0
                tempo: 120
                notes: [60, 64]
              - start: 480
                numerator: 3
              - start: 960
                tempo: 90.5
        "#,
        )
        .expect("valid score");

        assert_eq!("Song", score.title());
        assert_eq!("Artist", score.artist());
        assert_eq!(1440, score.duration());
        assert_eq!(vec!["Guitar".to_string(), "Bass".to_string()], score.tracks());
        assert_eq!(3, score.bars().len());
        assert_eq!(Some(120.0), score.bars()[0].tempo());
        assert_eq!(4, score.bars()[0].time_signature_numerator());
        assert_eq!(&[60.0, 64.0], score.bars()[0].notes());
        assert_eq!(None, score.bars()[1].tempo());
        assert_eq!(3, score.bars()[1].time_signature_numerator());
        assert_eq!(Some(90.5), score.bars()[2].tempo());
    }

    #[test]
    fn test_bars_out_of_order() {
        let result = parse(
            r#"
            title: Song
            duration: 1440
            bars:
              - start: 480
              - start: 0
        "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidScore(_))));
    }

    #[test]
    fn test_duration_before_last_bar() {
        let result = parse(
            r#"
            title: Song
            duration: 100
            bars:
              - start: 0
              - start: 480
        "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidScore(_))));
    }
}
