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
use std::{error::Error, sync::Arc, time::Duration};

use tokio::{
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::{JoinError, JoinHandle},
};
use tracing::{debug, info, span, warn, Instrument, Level};

use crate::{
    dispatch::WriteCompletion,
    link::{ConnectionError, Link, Peripheral, ServiceFilter, TransportError},
    playback::{Engine, PlayerState, Update},
    registry::DeviceId,
    scheduler::{self, Scheduler},
    score::Score,
    session::Session,
};

/// Capacity of the beat broadcast. Slow subscribers skip beats.
const BEAT_CAPACITY: usize = 64;

/// Requests into the controller.
#[derive(Debug)]
pub enum Event {
    /// Loads a score and rebuilds the tempo map.
    LoadScore(Arc<Score>),
    /// Connects to a peripheral matching the filter. The result is sent to the reply
    /// channel if one is given.
    Connect {
        filter: ServiceFilter,
        reply: Option<oneshot::Sender<Result<DeviceId, ConnectionError>>>,
    },
    /// Disconnects and forgets every peripheral.
    DisconnectAll,
    /// Plays from the current position.
    Play,
    Pause,
    Stop,
    Status(oneshot::Sender<Status>),
}

/// A snapshot of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub score: Option<String>,
    pub connected: Vec<DeviceId>,
    pub playing: bool,
    pub current_tick: u64,
    /// The last vibration period sent, if any.
    pub period_ms: Option<u16>,
    /// The song position as "MM:SS / MM:SS".
    pub position: Option<String>,
}

/// Results posted back to the controller by the tasks it spawns.
enum Completion {
    Connected(
        Result<Peripheral, ConnectionError>,
        Option<oneshot::Sender<Result<DeviceId, ConnectionError>>>,
    ),
    Write(WriteCompletion),
}

/// Drives peripherals in sync with a playback engine.
pub struct Controller {
    events: UnboundedSender<Event>,
    beats: broadcast::Sender<scheduler::Output>,
    handle: JoinHandle<()>,
}

impl Controller {
    /// Creates a new controller on the given link. Playback updates are read from
    /// `updates`, transport requests go to `engine`.
    pub fn new(
        link: Arc<dyn Link>,
        engine: Arc<dyn Engine>,
        updates: UnboundedReceiver<Update>,
        note_min_interval: Duration,
    ) -> Result<Controller, Box<dyn Error>> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (disconnects_tx, disconnects) = mpsc::unbounded_channel();
        link.watch_disconnects(disconnects_tx)?;

        let (beats, _) = broadcast::channel(BEAT_CAPACITY);
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (scheduler_tx, scheduler_output) = mpsc::unbounded_channel();

        info!(link = %link, "Controller started.");
        let runner = Runner {
            session: Session::new(note_min_interval),
            link,
            engine,
            scheduler: Scheduler::spawn(scheduler_tx),
            beats: beats.clone(),
            completions_tx,
        };
        let handle = tokio::spawn(
            runner
                .run(events_rx, updates, disconnects, completions, scheduler_output)
                .instrument(span!(Level::INFO, "controller")),
        );

        Ok(Controller {
            events,
            beats,
            handle,
        })
    }

    /// Sends an event to the controller.
    pub fn send(&self, event: Event) -> Result<(), Box<dyn Error>> {
        self.events
            .send(event)
            .map_err(|_| "controller is closed".into())
    }

    /// Connects a peripheral and waits for the result.
    pub async fn connect(&self, filter: ServiceFilter) -> Result<DeviceId, ConnectionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Event::Connect {
            filter,
            reply: Some(reply),
        })
        .map_err(|e| ConnectionError::Link(e.to_string()))?;
        reply_rx
            .await
            .map_err(|e| ConnectionError::Link(e.to_string()))?
    }

    /// Gets a snapshot of the session.
    pub async fn status(&self) -> Result<Status, Box<dyn Error>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Event::Status(reply))?;
        Ok(reply_rx.await?)
    }

    /// Subscribes to the output of the beat scheduler.
    pub fn subscribe_beats(&self) -> broadcast::Receiver<scheduler::Output> {
        self.beats.subscribe()
    }

    /// Silences every device and waits for the controller to finish.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        drop(self.events);
        self.handle.await
    }
}

/// The state owned by the controller task.
struct Runner {
    session: Session,
    link: Arc<dyn Link>,
    engine: Arc<dyn Engine>,
    scheduler: Scheduler,
    beats: broadcast::Sender<scheduler::Output>,
    completions_tx: UnboundedSender<Completion>,
}

impl Runner {
    async fn run(
        mut self,
        mut events: UnboundedReceiver<Event>,
        mut updates: UnboundedReceiver<Update>,
        mut disconnects: UnboundedReceiver<DeviceId>,
        mut completions: UnboundedReceiver<Completion>,
        mut scheduler_output: UnboundedReceiver<scheduler::Output>,
    ) {
        loop {
            // Requests are handled ahead of the updates that follow them.
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Controller closing.");
                        self.scheduler.stop();
                        self.session.halt();
                        self.dispatch();
                        return;
                    }
                },
                Some(update) = updates.recv() => self.handle_update(update),
                Some(id) = disconnects.recv() => {
                    if self.session.on_disconnect(&id) {
                        self.pause_for_lost_devices();
                    }
                }
                Some(completion) = completions.recv() => self.handle_completion(completion),
                Some(output) = scheduler_output.recv() => {
                    match output {
                        scheduler::Output::Beat(pause) => {
                            debug!(first = pause.is_first_beat, wait = pause.wait_time, "Beat.");
                        }
                        scheduler::Output::Finished => info!("Beats finished."),
                    }
                    // Nobody listening is fine.
                    let _ = self.beats.send(output);
                }
            }

            self.dispatch();
        }
    }

    fn handle_event(&mut self, event: Event) {
        debug!(event = ?event, "Received event.");
        match event {
            Event::LoadScore(score) => {
                if self.session.is_playing() {
                    self.stop_output();
                    self.engine.stop();
                }
                self.session.load_score(score);
            }
            Event::Connect { filter, reply } => {
                let handle = self.link.connect(filter);
                let completions = self.completions_tx.clone();
                tokio::spawn(async move {
                    let result = handle
                        .await
                        .unwrap_or_else(|e| Err(ConnectionError::Link(e.to_string())));
                    let _ = completions.send(Completion::Connected(result, reply));
                });
            }
            Event::DisconnectAll => {
                let was_playing = self.session.is_playing();
                self.scheduler.stop();
                for id in self.session.disconnect_all() {
                    self.link.disconnect(id);
                }
                if was_playing {
                    self.session.halt();
                    self.engine.pause();
                }
            }
            Event::Play => {
                if self.session.score().is_none() {
                    warn!("No score loaded, not playing.");
                    return;
                }
                let start_index = self.session.start();
                self.scheduler
                    .start(start_index, self.session.tempo_map().beat_pauses());
                self.engine.play();
            }
            Event::Pause => {
                self.stop_output();
                self.engine.pause();
            }
            Event::Stop => {
                self.stop_output();
                self.engine.stop();
            }
            Event::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn handle_update(&mut self, update: Update) {
        match update {
            Update::Position(sample) => self.session.on_position(sample),
            Update::State(state) => {
                if matches!(state, PlayerState::Paused | PlayerState::Stopped) {
                    self.scheduler.stop();
                }
                self.session.on_player_state(state);
            }
            Update::ActiveNotes(notes) => self.session.on_active_notes(&notes),
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected(result, reply) => {
                let result = result.and_then(|peripheral| {
                    let id = peripheral.id.clone();
                    self.session.register(peripheral).map(|_| id)
                });
                if let Err(e) = result.as_ref() {
                    warn!(err = %e, "Unable to connect device.");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Completion::Write(completion) => {
                if self.session.on_write_complete(completion) {
                    self.pause_for_lost_devices();
                }
            }
        }
    }

    fn stop_output(&mut self) {
        self.scheduler.stop();
        self.session.halt();
    }

    fn pause_for_lost_devices(&mut self) {
        warn!("All devices disconnected, pausing playback.");
        self.stop_output();
        self.engine.pause();
    }

    fn status(&self) -> Status {
        Status {
            score: self.session.score().map(|score| score.to_string()),
            connected: self.session.registry().connected(),
            playing: self.session.is_playing(),
            current_tick: self.session.current_tick(),
            period_ms: self.session.last_period(),
            position: self.session.position(),
        }
    }

    /// Hands the writes the session has ready to the link. Each completion is posted
    /// back as a new event, which pumps the channel again.
    fn dispatch(&mut self) {
        for request in self.session.take_writes() {
            let handle = self
                .link
                .write(request.device.clone(), request.kind, request.payload.clone());
            let completions = self.completions_tx.clone();
            tokio::spawn(async move {
                let result = handle
                    .await
                    .unwrap_or_else(|e| Err(TransportError::Write(e.to_string())));
                let _ = completions.send(Completion::Write(request.completed(result)));
            });
        }
    }
}
