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

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{score::Bar, wire::ProtocolDataError};

/// The tempo used when a bar has no tempo or a tempo of zero.
pub const DEFAULT_BPM: f64 = 120.0;

/// A vibration period that applies from `tick_start` until the next segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TempoSegment {
    pub tick_start: u64,
    pub period_ms: u16,
}

/// The wait after a single beat of the metronome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BeatPause {
    /// Seconds until the next beat.
    pub wait_time: f64,
    /// Whether this is the first beat of its bar.
    pub is_first_beat: bool,
}

impl BeatPause {
    /// Gets the wait time as a duration.
    pub fn wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.wait_time).unwrap_or(Duration::MAX)
    }
}

/// The effective tempo of a bar.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Tempo {
    Bpm(f64),
    /// The score carried a tempo that can't drive the peripheral.
    Malformed,
}

impl Tempo {
    fn from_bpm(bpm: f64) -> Result<Tempo, ProtocolDataError> {
        if !bpm.is_finite() || bpm < 0.0 {
            return Err(ProtocolDataError::InvalidTempo(bpm));
        }
        Ok(Tempo::Bpm(bpm))
    }

    fn period_ms(&self) -> u16 {
        match self {
            Tempo::Bpm(bpm) => {
                let period = (60000.0 / bpm).round();
                if period > f64::from(u16::MAX) {
                    u16::MAX
                } else {
                    period as u16
                }
            }
            Tempo::Malformed => 0,
        }
    }

    /// The tempo the metronome paces beats at.
    fn pacing_bpm(&self) -> f64 {
        match self {
            Tempo::Bpm(bpm) => *bpm,
            Tempo::Malformed => DEFAULT_BPM,
        }
    }
}

/// The compiled timing schedule of a score.
#[derive(Debug, Clone)]
pub struct TempoMap {
    /// Run length compressed periods, ending with a stop segment at the end of the score.
    segments: Vec<TempoSegment>,
    /// One pause per beat across all bars.
    beat_pauses: Arc<[BeatPause]>,
    /// The start tick of every bar.
    bar_starts: Vec<u64>,
    /// The index of every bar's first beat in `beat_pauses`.
    bar_first_beats: Vec<usize>,
}

impl Default for TempoMap {
    fn default() -> Self {
        TempoMap {
            segments: Vec::new(),
            beat_pauses: Arc::from(Vec::new()),
            bar_starts: Vec::new(),
            bar_first_beats: Vec::new(),
        }
    }
}

impl TempoMap {
    /// Builds the tempo map from the bars of a score and its total duration in ticks.
    pub fn build(bars: &[Bar], duration: u64) -> TempoMap {
        let mut segments: Vec<TempoSegment> = Vec::new();
        let mut beat_pauses: Vec<BeatPause> = Vec::new();
        let mut bar_starts: Vec<u64> = Vec::with_capacity(bars.len());
        let mut bar_first_beats: Vec<usize> = Vec::with_capacity(bars.len());

        // Zero forces the first bar to emit a segment.
        let mut last_tempo = Tempo::Bpm(0.0);
        for bar in bars.iter() {
            let tempo = match bar.tempo() {
                Some(bpm) => Tempo::from_bpm(bpm).unwrap_or_else(|e| {
                    warn!(bar = bar.start(), err = %e, "Malformed tempo, stopping vibration.");
                    Tempo::Malformed
                }),
                None => last_tempo,
            };
            let tempo = match tempo {
                Tempo::Bpm(bpm) if bpm == 0.0 => Tempo::Bpm(DEFAULT_BPM),
                tempo => tempo,
            };

            if tempo != last_tempo {
                segments.push(TempoSegment {
                    tick_start: bar.start(),
                    period_ms: tempo.period_ms(),
                });
                last_tempo = tempo;
            }

            bar_starts.push(bar.start());
            bar_first_beats.push(beat_pauses.len());

            let numerator = bar.time_signature_numerator();
            let wait_time = 60.0 / tempo.pacing_bpm();
            beat_pauses.extend((0..numerator).map(|beat| BeatPause {
                wait_time,
                is_first_beat: beat == 0,
            }));
        }

        // Vibration always stops at the end of the score, even if bars run past it.
        if segments.iter().any(|segment| segment.tick_start >= duration) {
            warn!(duration, "Bars start past the end of the score, dropping their tempos.");
            segments.retain(|segment| segment.tick_start < duration);
        }
        segments.push(TempoSegment {
            tick_start: duration,
            period_ms: 0,
        });

        debug!(
            segments = segments.len(),
            beats = beat_pauses.len(),
            "Tempo map generated."
        );

        TempoMap {
            segments,
            beat_pauses: Arc::from(beat_pauses),
            bar_starts,
            bar_first_beats,
        }
    }

    pub fn segments(&self) -> &[TempoSegment] {
        &self.segments
    }

    /// Gets the beat pauses, shareable with the beat scheduler.
    pub fn beat_pauses(&self) -> Arc<[BeatPause]> {
        self.beat_pauses.clone()
    }

    /// Resolves the vibration period at the given tick: the period of the last segment
    /// starting at or before the tick, or 0 if there is none.
    pub fn period_at(&self, tick: u64) -> u16 {
        self.segments
            .iter()
            .rev()
            .find(|segment| segment.tick_start <= tick)
            .map_or(0, |segment| segment.period_ms)
    }

    /// Gets the index of the first beat of the bar containing the given tick.
    pub fn beat_index_at(&self, tick: u64) -> usize {
        self.bar_starts
            .iter()
            .rposition(|start| *start <= tick)
            .and_then(|bar| self.bar_first_beats.get(bar).copied())
            .unwrap_or(0)
    }
}
