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
use std::fmt;

/// A bar (master bar) of the score.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    /// The tick the bar starts at.
    start: u64,
    /// The tempo set explicitly on this bar, if any.
    tempo: Option<f64>,
    /// The number of beats in the bar.
    time_signature_numerator: u32,
    /// The note values sounding in this bar, used by the simulated engine.
    notes: Vec<f64>,
}

impl Bar {
    /// Creates a new bar.
    pub fn new(start: u64, tempo: Option<f64>, time_signature_numerator: u32) -> Bar {
        Bar {
            start,
            tempo,
            time_signature_numerator,
            notes: Vec::new(),
        }
    }

    /// Sets the note values sounding in this bar.
    pub fn with_notes(mut self, notes: Vec<f64>) -> Bar {
        self.notes = notes;
        self
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn tempo(&self) -> Option<f64> {
        self.tempo
    }

    pub fn time_signature_numerator(&self) -> u32 {
        self.time_signature_numerator
    }

    pub fn notes(&self) -> &[f64] {
        &self.notes
    }
}

/// A loaded score, as far as synchronization is concerned.
#[derive(Debug, Clone)]
pub struct Score {
    title: String,
    artist: String,
    /// Total duration in ticks.
    duration: u64,
    bars: Vec<Bar>,
    tracks: Vec<String>,
}

impl Score {
    /// Creates a new score.
    pub fn new(
        title: &str,
        artist: &str,
        duration: u64,
        bars: Vec<Bar>,
        tracks: Vec<String>,
    ) -> Score {
        Score {
            title: title.to_string(),
            artist: artist.to_string(),
            duration,
            bars,
            tracks,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    /// Gets the total duration of the score in ticks.
    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn tracks(&self) -> &[String] {
        &self.tracks
    }

    /// Gets the index of the bar containing the given tick. Ticks before the first
    /// bar resolve to the first bar.
    pub fn bar_index_at(&self, tick: u64) -> usize {
        self.bars
            .iter()
            .rposition(|bar| bar.start <= tick)
            .unwrap_or(0)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by {} (bars: {}, tracks: {})",
            self.title,
            self.artist,
            self.bars.len(),
            self.tracks.join(", ")
        )
    }
}
