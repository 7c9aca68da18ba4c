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
use std::time::{Duration, Instant};

use tracing::warn;

use crate::{tempo::TempoMap, wire::NoteCommand};

/// Turns position samples into edge-triggered vibration periods.
#[derive(Debug, Default)]
pub struct PeriodResolver {
    last_emitted: Option<u16>,
}

impl PeriodResolver {
    pub fn new() -> PeriodResolver {
        PeriodResolver::default()
    }

    /// Resolves the period at the given tick. Returns the period only if it differs
    /// from the last one emitted.
    pub fn resolve(&mut self, tempo_map: &TempoMap, tick: u64) -> Option<u16> {
        let period = tempo_map.period_at(tick);
        if self.last_emitted == Some(period) {
            return None;
        }
        self.last_emitted = Some(period);
        Some(period)
    }

    /// Forgets the last emitted period so the next sample emits again.
    pub fn reset(&mut self) {
        self.last_emitted = None;
    }

    pub fn last_emitted(&self) -> Option<u16> {
        self.last_emitted
    }
}

/// Turns the active notes reported by the playback engine into note commands.
#[derive(Debug)]
pub struct NoteResolver {
    last_sent: Option<NoteCommand>,
    last_sent_at: Option<Instant>,
    min_interval: Duration,
}

impl NoteResolver {
    /// Creates a resolver that sends plays no sooner than `min_interval` after the
    /// last command it sent.
    pub fn new(min_interval: Duration) -> NoteResolver {
        NoteResolver {
            last_sent: None,
            last_sent_at: None,
            min_interval,
        }
    }

    pub fn resolve(&mut self, notes: &[f64]) -> Option<NoteCommand> {
        self.resolve_at(notes, Instant::now())
    }

    /// Resolves the active notes at the given instant. Only the first note sounds.
    /// Returns None if nothing needs to be sent.
    pub fn resolve_at(&mut self, notes: &[f64], now: Instant) -> Option<NoteCommand> {
        let command = match notes.first() {
            Some(note) => NoteCommand::from_midi(*note).unwrap_or_else(|e| {
                warn!(err = %e, "Unplayable note, stopping.");
                NoteCommand::Stop
            }),
            None => NoteCommand::Stop,
        };

        match command {
            NoteCommand::Stop => {
                if self.last_sent == Some(NoteCommand::Stop) {
                    return None;
                }
                self.last_sent_at = Some(now);
            }
            NoteCommand::Play(_) => {
                if self
                    .last_sent_at
                    .is_some_and(|last| now.saturating_duration_since(last) < self.min_interval)
                {
                    return None;
                }
                self.last_sent_at = Some(now);
            }
        }

        self.last_sent = Some(command);
        Some(command)
    }

    /// Records an unconditional stop, returning it for sending.
    pub fn force_stop(&mut self) -> NoteCommand {
        self.last_sent = Some(NoteCommand::Stop);
        NoteCommand::Stop
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
        self.last_sent_at = None;
    }

    pub fn last_sent(&self) -> Option<NoteCommand> {
        self.last_sent
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use crate::{score::Bar, tempo::TempoMap, wire::NoteCommand};

    use super::{NoteResolver, PeriodResolver};

    #[test]
    fn test_period_edge_triggered() {
        let tempo_map = TempoMap::build(
            &[
                Bar::new(0, Some(120.0), 4),
                Bar::new(480, Some(120.0), 4),
                Bar::new(960, Some(90.0), 4),
            ],
            1440,
        );
        let mut resolver = PeriodResolver::new();

        assert_eq!(Some(500), resolver.resolve(&tempo_map, 0));
        assert_eq!(None, resolver.resolve(&tempo_map, 500));
        assert_eq!(Some(667), resolver.resolve(&tempo_map, 1000));
        assert_eq!(None, resolver.resolve(&tempo_map, 1000));
        assert_eq!(None, resolver.resolve(&tempo_map, 1001));
        assert_eq!(Some(0), resolver.resolve(&tempo_map, 1440));

        resolver.reset();
        assert_eq!(None, resolver.last_emitted());
        assert_eq!(Some(667), resolver.resolve(&tempo_map, 1001));
    }

    #[test]
    fn test_notes() {
        let mut resolver = NoteResolver::new(Duration::ZERO);

        assert_eq!(Some(NoteCommand::Play(440)), resolver.resolve(&[69.0, 72.0]));
        assert_eq!(Some(NoteCommand::Play(440)), resolver.resolve(&[69.0]));
        assert_eq!(Some(NoteCommand::Stop), resolver.resolve(&[]));
        // Stops are only sent once.
        assert_eq!(None, resolver.resolve(&[]));
        assert_eq!(None, resolver.resolve(&[f64::NAN]));
        assert_eq!(Some(NoteCommand::Play(130)), resolver.resolve(&[12.0]));
        assert_eq!(Some(NoteCommand::Stop), resolver.resolve(&[f64::NAN]));
    }

    #[test]
    fn test_notes_min_interval() {
        let mut resolver = NoteResolver::new(Duration::from_millis(100));
        let start = Instant::now();

        assert_eq!(
            Some(NoteCommand::Play(440)),
            resolver.resolve_at(&[69.0], start)
        );
        assert_eq!(
            None,
            resolver.resolve_at(&[71.0], start + Duration::from_millis(50))
        );
        // Stops aren't rate limited, but restart the interval.
        assert_eq!(
            Some(NoteCommand::Stop),
            resolver.resolve_at(&[], start + Duration::from_millis(60))
        );
        assert_eq!(
            None,
            resolver.resolve_at(&[71.0], start + Duration::from_millis(100))
        );
        assert_eq!(
            Some(NoteCommand::Play(493)),
            resolver.resolve_at(&[71.0], start + Duration::from_millis(160))
        );
    }

    #[test]
    fn test_force_stop() {
        let mut resolver = NoteResolver::new(Duration::ZERO);
        resolver.resolve(&[60.0]);
        assert_eq!(NoteCommand::Stop, resolver.force_stop());
        assert_eq!(None, resolver.resolve(&[]));

        resolver.reset();
        assert_eq!(None, resolver.last_sent());
        assert_eq!(Some(NoteCommand::Stop), resolver.resolve(&[]));
    }
}
