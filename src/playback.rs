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

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, span, Instrument, Level};

use crate::{
    score::Score,
    tempo::{TempoMap, DEFAULT_BPM},
};

/// The state of the playback engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Playing,
    Paused,
    Stopped,
}

/// Where the playback engine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionSample {
    pub current_tick: u64,
    pub current_time_ms: u64,
    pub end_time_ms: u64,
}

/// What the playback engine reports.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Position(PositionSample),
    State(PlayerState),
    /// The note values sounding at the current beat.
    ActiveNotes(Vec<f64>),
}

/// Transport requests accepted by a playback engine. Engines answer through their
/// update stream.
pub trait Engine: Send + Sync + 'static {
    fn play(&self);
    fn pause(&self);
    fn stop(&self);
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Play,
    Pause,
    Stop,
}

/// A playback engine that advances through a score in real time without producing
/// any sound.
pub struct SimulatedEngine {
    requests: UnboundedSender<Request>,
}

impl SimulatedEngine {
    /// Spawns the engine. It starts out stopped at `start_tick`.
    pub fn spawn(
        score: Arc<Score>,
        ticks_per_quarter: u32,
        sample_interval: Duration,
        start_tick: u64,
        updates: UnboundedSender<Update>,
    ) -> SimulatedEngine {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let state = EngineState::new(score, ticks_per_quarter, start_tick, updates);
        tokio::spawn(
            run(state, sample_interval, requests_rx)
                .instrument(span!(Level::INFO, "simulated engine")),
        );
        SimulatedEngine { requests }
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            debug!("Simulated engine is gone.");
        }
    }
}

impl Engine for SimulatedEngine {
    fn play(&self) {
        self.send(Request::Play);
    }

    fn pause(&self) {
        self.send(Request::Pause);
    }

    fn stop(&self) {
        self.send(Request::Stop);
    }
}

struct EngineState {
    score: Arc<Score>,
    tempo_map: TempoMap,
    ticks_per_quarter: f64,
    start_tick: u64,
    /// Fractional ticks are kept so short samples don't lose time.
    tick: f64,
    state: PlayerState,
    last_bar: Option<usize>,
    has_notes: bool,
    updates: UnboundedSender<Update>,
}

impl EngineState {
    fn new(
        score: Arc<Score>,
        ticks_per_quarter: u32,
        start_tick: u64,
        updates: UnboundedSender<Update>,
    ) -> EngineState {
        let tempo_map = TempoMap::build(score.bars(), score.duration());
        let has_notes = score.bars().iter().any(|bar| !bar.notes().is_empty());
        EngineState {
            score,
            tempo_map,
            ticks_per_quarter: f64::from(ticks_per_quarter.max(1)),
            start_tick,
            tick: start_tick as f64,
            state: PlayerState::Stopped,
            last_bar: None,
            has_notes,
            updates,
        }
    }

    /// Milliseconds per quarter note at the given tick. Stretches without a usable
    /// tempo are paced at the default tempo.
    fn quarter_ms(&self, tick: u64) -> f64 {
        match self.tempo_map.period_at(tick) {
            0 => 60000.0 / DEFAULT_BPM,
            period => f64::from(period),
        }
    }

    /// Converts a tick into milliseconds from the start of the score.
    fn time_ms_at(&self, tick: u64) -> u64 {
        let mut ms = 0.0;
        let mut from = 0;
        let segments = self.tempo_map.segments();
        for (i, segment) in segments.iter().enumerate() {
            if segment.tick_start >= tick {
                break;
            }
            if segment.tick_start > from {
                ms += (segment.tick_start - from) as f64 * 60000.0
                    / DEFAULT_BPM
                    / self.ticks_per_quarter;
                from = segment.tick_start;
            }
            let end = segments
                .get(i + 1)
                .map_or(tick, |next| next.tick_start.min(tick));
            ms += (end - from) as f64 * self.quarter_ms(from) / self.ticks_per_quarter;
            from = end;
        }
        if tick > from {
            ms += (tick - from) as f64 * self.quarter_ms(from) / self.ticks_per_quarter;
        }
        ms.round() as u64
    }

    fn current_tick(&self) -> u64 {
        self.tick as u64
    }

    fn send(&self, update: Update) {
        let _ = self.updates.send(update);
    }

    fn set_state(&mut self, state: PlayerState) {
        if self.state != state {
            info!(state = ?state, tick = self.current_tick(), "Engine state changed.");
            self.state = state;
            self.send(Update::State(state));
        }
    }

    fn send_position(&self) {
        let current_tick = self.current_tick();
        self.send(Update::Position(PositionSample {
            current_tick,
            current_time_ms: self.time_ms_at(current_tick),
            end_time_ms: self.time_ms_at(self.score.duration()),
        }));
    }

    /// Reports the position, and the notes if the cursor entered a new bar.
    fn report_position(&mut self) {
        self.send_position();

        let current_tick = self.current_tick();
        if !self.has_notes {
            return;
        }
        let bar = self.score.bar_index_at(current_tick);
        if self.last_bar != Some(bar) {
            self.last_bar = Some(bar);
            let notes = self
                .score
                .bars()
                .get(bar)
                .map(|bar| bar.notes().to_vec())
                .unwrap_or_default();
            self.send(Update::ActiveNotes(notes));
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Play => {
                if self.state == PlayerState::Playing {
                    return;
                }
                if self.current_tick() >= self.score.duration() {
                    self.tick = 0.0;
                }
                self.set_state(PlayerState::Playing);
                self.report_position();
            }
            Request::Pause => {
                if self.state == PlayerState::Playing {
                    self.set_state(PlayerState::Paused);
                }
            }
            Request::Stop => {
                self.set_state(PlayerState::Stopped);
                self.rewind(self.start_tick);
            }
        }
    }

    /// Moves the cursor and reports where it ended up. Callers stop first, so the
    /// rewind is never taken for playback.
    fn rewind(&mut self, tick: u64) {
        self.tick = tick as f64;
        self.last_bar = None;
        self.send_position();
    }

    /// Advances the cursor by the given wall clock time. At the end of the score the
    /// engine stops and rewinds to the beginning.
    fn advance(&mut self, elapsed: Duration) {
        let quarter_ms = self.quarter_ms(self.current_tick());
        self.tick += elapsed.as_secs_f64() * 1000.0 * self.ticks_per_quarter / quarter_ms;

        let duration = self.score.duration();
        if self.current_tick() >= duration {
            self.tick = duration as f64;
            self.report_position();
            self.set_state(PlayerState::Stopped);
            self.rewind(0);
            return;
        }
        self.report_position();
    }
}

async fn run(
    mut state: EngineState,
    sample_interval: Duration,
    mut requests: UnboundedReceiver<Request>,
) {
    let mut interval = tokio::time::interval(sample_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    state.send_position();

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    return;
                };
                state.handle(request);
                if state.state == PlayerState::Playing {
                    last = Instant::now();
                    interval.reset();
                }
            }
            now = interval.tick(), if state.state == PlayerState::Playing => {
                let now = now.max(last);
                state.advance(now - last);
                last = now;
            }
        }
    }
}
