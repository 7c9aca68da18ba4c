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

//! The synchronization state of a session. The session is owned by a single task,
//! so none of it is locked. Writes are not issued directly: they are collected in an
//! outbox that the owner drains after every event and hands to the link.

use std::{sync::Arc, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    dispatch::{ChannelKind, WriteCompletion, WriteRequest},
    link::{ConnectionError, Peripheral},
    playback::{PlayerState, PositionSample},
    registry::{DeviceId, Registry},
    resolver::{NoteResolver, PeriodResolver},
    score::Score,
    tempo::TempoMap,
    util::{hex_payload, song_position},
    wire::{vibration_payload, NoteCommand},
};

pub struct Session {
    registry: Registry,
    score: Option<Arc<Score>>,
    tempo_map: TempoMap,
    periods: PeriodResolver,
    notes: NoteResolver,
    /// Whether playback is active as far as the session is concerned.
    playing: bool,
    current_tick: u64,
    position: Option<PositionSample>,
    outbox: Vec<WriteRequest>,
}

impl Session {
    pub fn new(note_min_interval: Duration) -> Session {
        Session {
            registry: Registry::new(),
            score: None,
            tempo_map: TempoMap::default(),
            periods: PeriodResolver::new(),
            notes: NoteResolver::new(note_min_interval),
            playing: false,
            current_tick: 0,
            position: None,
            outbox: Vec::new(),
        }
    }

    /// Loads a score, rebuilding the tempo map. The position is left alone, the
    /// playback engine reports it.
    pub fn load_score(&mut self, score: Arc<Score>) {
        info!(score = %score, "Loading score.");
        self.tempo_map = TempoMap::build(score.bars(), score.duration());
        self.score = Some(score);
        self.periods.reset();
    }

    pub fn score(&self) -> Option<Arc<Score>> {
        self.score.clone()
    }

    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo_map
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn last_period(&self) -> Option<u16> {
        self.periods.last_emitted()
    }

    /// Gets the song position as "MM:SS / MM:SS", if the engine has reported one.
    pub fn position(&self) -> Option<String> {
        self.position
            .map(|sample| song_position(sample.current_time_ms, sample.end_time_ms))
    }

    /// Registers a freshly connected peripheral. A peripheral joining during
    /// playback is brought up to the current period right away.
    pub fn register(&mut self, peripheral: Peripheral) -> Result<(), ConnectionError> {
        let id = self.registry.register(peripheral)?.id().clone();
        if self.playing {
            let period = self.tempo_map.period_at(self.current_tick);
            self.enqueue(&id, ChannelKind::Vibration, vibration_payload(period));
        }
        Ok(())
    }

    /// Handles a link level disconnect. Returns true if this left no device
    /// connected while playing.
    pub fn on_disconnect(&mut self, id: &DeviceId) -> bool {
        if !self.registry.on_disconnect(id) {
            debug!(id = %id, "Disconnect for unknown device.");
            return false;
        }
        self.lost_all_devices()
    }

    /// Empties the registry, returning the devices the link should disconnect.
    pub fn disconnect_all(&mut self) -> Vec<DeviceId> {
        let ids = self.registry.disconnect_all();
        self.outbox.clear();
        self.periods.reset();
        self.notes.reset();
        info!(devices = ids.len(), "Disconnected all devices.");
        ids
    }

    fn lost_all_devices(&mut self) -> bool {
        if self.registry.connected_count() > 0 {
            return false;
        }
        self.periods.reset();
        self.notes.reset();
        self.playing
    }

    /// Queues a payload on one channel of a device and pumps the channel. Does
    /// nothing if the device is unknown or disconnected.
    pub fn enqueue(&mut self, id: &DeviceId, kind: ChannelKind, payload: Vec<u8>) {
        let Some(endpoint) = self.registry.get_mut(id) else {
            debug!(id = %id, channel = %kind, "Enqueue for unknown device ignored.");
            return;
        };
        if !endpoint.is_connected() {
            debug!(
                device = endpoint.name(),
                channel = %kind,
                "Enqueue for disconnected device ignored."
            );
            return;
        }

        if !endpoint.channel_mut(kind).enqueue(payload) {
            debug!(
                device = endpoint.name(),
                channel = %kind,
                "Dropped duplicate command."
            );
        }
        self.pump(id, kind);
    }

    /// Queues a payload on the given channel of every connected device.
    pub fn broadcast(&mut self, kind: ChannelKind, payload: Vec<u8>) {
        for id in self.registry.connected() {
            self.enqueue(&id, kind, payload.clone());
        }
    }

    /// Hands the next queued command of a channel to the outbox, unless a write is
    /// already in flight, the queue is empty or the device is gone.
    pub fn pump(&mut self, id: &DeviceId, kind: ChannelKind) {
        let Some(endpoint) = self.registry.get_mut(id) else {
            return;
        };
        if !endpoint.is_connected() {
            return;
        }
        let epoch = endpoint.epoch();
        let channel = endpoint.channel_mut(kind);
        let Some(command) = channel.take_next() else {
            return;
        };
        let size = channel.len();

        debug!(
            device = endpoint.name(),
            channel = %kind,
            size,
            latency_ms = command.latency().as_millis() as u64,
            payload = hex_payload(command.payload()),
            "Dispatching command."
        );
        self.outbox.push(WriteRequest {
            device: id.clone(),
            epoch,
            kind,
            payload: command.into_payload(),
        });
    }

    /// Handles the completion of a write. Returns true if a network failure left no
    /// device connected while playing.
    pub fn on_write_complete(&mut self, completion: WriteCompletion) -> bool {
        let WriteCompletion {
            device,
            epoch,
            kind,
            result,
        } = completion;

        let Some(endpoint) = self.registry.get_mut(&device) else {
            debug!(id = %device, "Completion for removed device ignored.");
            return false;
        };
        if endpoint.epoch() != epoch {
            debug!(id = %device, epoch, "Stale completion ignored.");
            return false;
        }
        endpoint.channel_mut(kind).complete();

        match result {
            Ok(()) => {
                self.pump(&device, kind);
                false
            }
            Err(e) if e.is_network() => {
                error!(
                    device = endpoint.name(),
                    channel = %kind,
                    err = %e,
                    "Link lost, disconnecting device."
                );
                endpoint.mark_link_lost(kind);
                self.lost_all_devices()
            }
            Err(e) => {
                warn!(
                    device = endpoint.name(),
                    channel = %kind,
                    err = %e,
                    "Write failed, skipping command."
                );
                self.pump(&device, kind);
                false
            }
        }
    }

    /// Handles a position sample from the playback engine.
    pub fn on_position(&mut self, sample: PositionSample) {
        self.current_tick = sample.current_tick;
        self.position = Some(sample);
        if !self.playing || self.registry.connected_count() == 0 {
            return;
        }

        if let Some(period) = self.periods.resolve(&self.tempo_map, sample.current_tick) {
            debug!(
                tick = sample.current_tick,
                period_ms = period,
                "Vibration period changed."
            );
            self.broadcast(ChannelKind::Vibration, vibration_payload(period));
        }
    }

    /// Handles a state change of the playback engine.
    pub fn on_player_state(&mut self, state: PlayerState) {
        match state {
            PlayerState::Playing => {
                self.playing = true;
            }
            PlayerState::Paused | PlayerState::Stopped => {
                let was_playing = self.playing;
                self.playing = false;
                if was_playing {
                    self.stop_vibration();
                    if let Some(command) = self.notes.resolve(&[]) {
                        self.broadcast(ChannelKind::Notes, command.payload());
                    }
                }
            }
        }
    }

    /// Handles the notes the playback engine reports as sounding.
    pub fn on_active_notes(&mut self, notes: &[f64]) {
        if self.registry.connected_count() == 0 {
            return;
        }
        if let Some(command) = self.notes.resolve(notes) {
            if let NoteCommand::Play(frequency) = command {
                debug!(frequency, "Playing note.");
            }
            self.broadcast(ChannelKind::Notes, command.payload());
        }
    }

    /// Prepares for playback from the current tick, returning the beat index the
    /// beat scheduler should start at.
    pub fn start(&mut self) -> usize {
        self.playing = true;
        self.periods.reset();
        self.tempo_map.beat_index_at(self.current_tick)
    }

    /// Stops playback output: silences notes and vibration on every device.
    pub fn halt(&mut self) {
        self.playing = false;
        let stop = self.notes.force_stop();
        self.broadcast(ChannelKind::Notes, stop.payload());
        self.stop_vibration();
    }

    fn stop_vibration(&mut self) {
        self.periods.reset();
        self.broadcast(ChannelKind::Vibration, vibration_payload(0));
    }

    /// Takes the writes that are ready to be handed to the link.
    pub fn take_writes(&mut self) -> Vec<WriteRequest> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use crate::{
        dispatch::{ChannelKind, WriteRequest},
        link::{Peripheral, TransportError},
        playback::{PlayerState, PositionSample},
        registry::DeviceId,
        score::{Bar, Score},
    };

    use super::Session;

    fn score() -> Arc<Score> {
        Arc::new(Score::new(
            "Song",
            "Artist",
            1440,
            vec![
                Bar::new(0, Some(120.0), 4),
                Bar::new(480, Some(120.0), 4),
                Bar::new(960, Some(90.0), 4),
            ],
            vec![],
        ))
    }

    fn session(devices: &[&str]) -> Session {
        let mut session = Session::new(Duration::ZERO);
        session.load_score(score());
        for device in devices {
            session
                .register(Peripheral::new(DeviceId::new(device), "ESP32"))
                .expect("register");
        }
        session
    }

    fn sample(current_tick: u64) -> PositionSample {
        PositionSample {
            current_tick,
            current_time_ms: 0,
            end_time_ms: 0,
        }
    }

    fn single(writes: Vec<WriteRequest>) -> WriteRequest {
        assert_eq!(1, writes.len(), "expected a single write: {:?}", writes);
        writes.into_iter().next().unwrap()
    }

    #[test]
    fn test_channel_order_one_in_flight() {
        let mut session = session(&["a"]);
        let id = DeviceId::new("a");
        for payload in [vec![1, 0], vec![2, 0], vec![3, 0]] {
            session.enqueue(&id, ChannelKind::Vibration, payload);
        }

        let mut written = Vec::new();
        let mut write = single(session.take_writes());
        loop {
            written.push(write.payload.clone());
            // Pumping while in flight never hands out another write.
            session.pump(&id, ChannelKind::Vibration);
            assert!(session.take_writes().is_empty());

            session.on_write_complete(write.completed(Ok(())));
            let writes = session.take_writes();
            if writes.is_empty() {
                break;
            }
            write = single(writes);
        }

        assert_eq!(vec![vec![1, 0], vec![2, 0], vec![3, 0]], written);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut session = session(&["a"]);
        let id = DeviceId::new("a");
        session.enqueue(&id, ChannelKind::Vibration, vec![1, 0]);
        session.enqueue(&id, ChannelKind::Notes, vec![0]);

        let writes = session.take_writes();
        assert_eq!(2, writes.len());
    }

    #[test]
    fn test_note_dedup() {
        let mut session = session(&["a"]);
        let id = DeviceId::new("a");
        session.enqueue(&id, ChannelKind::Notes, vec![0]);
        let first = single(session.take_writes());

        session.enqueue(&id, ChannelKind::Notes, vec![0xb8, 0x01]);
        session.enqueue(&id, ChannelKind::Notes, vec![0xb8, 0x01]);
        session.enqueue(&id, ChannelKind::Notes, vec![0x05, 0x01]);

        session.on_write_complete(first.completed(Ok(())));
        let second = single(session.take_writes());
        assert_eq!(vec![0xb8, 0x01], second.payload);
        session.on_write_complete(second.completed(Ok(())));
        let third = single(session.take_writes());
        assert_eq!(vec![0x05, 0x01], third.payload);
        session.on_write_complete(third.completed(Ok(())));
        assert!(session.take_writes().is_empty());
    }

    #[test]
    fn test_period_edges() {
        let mut session = session(&["a", "b"]);
        session.start();

        session.on_position(sample(500));
        let writes = session.take_writes();
        assert_eq!(2, writes.len());
        assert!(writes.iter().all(|write| write.payload == vec![0xf4, 0x01]));
        for write in writes {
            session.on_write_complete(write.completed(Ok(())));
        }

        session.on_position(sample(1000));
        let writes = session.take_writes();
        assert_eq!(2, writes.len());
        assert!(writes.iter().all(|write| write.payload == vec![0x9b, 0x02]));
        for write in writes {
            session.on_write_complete(write.completed(Ok(())));
        }

        session.on_position(sample(1000));
        session.on_position(sample(1001));
        assert!(session.take_writes().is_empty());
        assert_eq!(Some(667), session.last_period());
    }

    #[test]
    fn test_no_periods_when_not_playing() {
        let mut session = session(&["a"]);
        session.on_position(sample(500));
        assert!(session.take_writes().is_empty());
        assert_eq!(500, session.current_tick());
    }

    #[test]
    fn test_network_failure_disconnects() {
        let mut session = session(&["a", "b"]);
        let id = DeviceId::new("a");
        session.enqueue(&id, ChannelKind::Vibration, vec![1, 0]);
        session.enqueue(&id, ChannelKind::Vibration, vec![2, 0]);
        let write = single(session.take_writes());

        let lost_all = session.on_write_complete(
            write.completed(Err(TransportError::Network("gone".to_string()))),
        );
        assert!(!lost_all);

        let endpoint = session.registry().get(&id).unwrap();
        assert!(!endpoint.is_connected());
        assert!(endpoint.channel(ChannelKind::Vibration).is_empty());
        assert!(session.take_writes().is_empty());

        session.enqueue(&id, ChannelKind::Vibration, vec![3, 0]);
        assert!(session.take_writes().is_empty());
        assert!(session
            .registry()
            .get(&id)
            .unwrap()
            .channel(ChannelKind::Vibration)
            .is_empty());

        // A fresh connect brings the device back.
        session
            .register(Peripheral::new(id.clone(), "ESP32"))
            .expect("reconnect");
        session.enqueue(&id, ChannelKind::Vibration, vec![4, 0]);
        assert_eq!(vec![4, 0], single(session.take_writes()).payload);
    }

    #[test]
    fn test_network_failure_of_last_device_while_playing() {
        let mut session = session(&["a"]);
        session.start();
        session.on_position(sample(0));
        let write = single(session.take_writes());

        assert!(session.on_write_complete(
            write.completed(Err(TransportError::Network("gone".to_string())))
        ));
    }

    #[test]
    fn test_transient_failure_continues() {
        let mut session = session(&["a"]);
        let id = DeviceId::new("a");
        session.enqueue(&id, ChannelKind::Notes, vec![1, 1]);
        session.enqueue(&id, ChannelKind::Notes, vec![2, 1]);
        let write = single(session.take_writes());

        session.on_write_complete(write.completed(Err(TransportError::Write("busy".to_string()))));
        assert!(session.registry().get(&id).unwrap().is_connected());
        assert_eq!(vec![2, 1], single(session.take_writes()).payload);
    }

    #[test]
    fn test_stale_completion_ignored() {
        let mut session = session(&["a"]);
        let id = DeviceId::new("a");
        session.enqueue(&id, ChannelKind::Vibration, vec![1, 0]);
        let stale = single(session.take_writes());

        assert!(!session.on_disconnect(&id));
        session
            .register(Peripheral::new(id.clone(), "ESP32"))
            .expect("reconnect");
        session.enqueue(&id, ChannelKind::Vibration, vec![2, 0]);
        session.enqueue(&id, ChannelKind::Vibration, vec![3, 0]);
        let fresh = single(session.take_writes());
        assert_eq!(vec![2, 0], fresh.payload);

        // The old write finishing must not release the fresh channel.
        session.on_write_complete(stale.completed(Ok(())));
        assert!(session.take_writes().is_empty());

        session.on_write_complete(fresh.completed(Ok(())));
        assert_eq!(vec![3, 0], single(session.take_writes()).payload);
    }

    #[test]
    fn test_disconnect_all() {
        let mut session = session(&["a", "b"]);
        let id = DeviceId::new("a");
        session.enqueue(&id, ChannelKind::Vibration, vec![1, 0]);
        session.enqueue(&id, ChannelKind::Vibration, vec![2, 0]);
        let write = single(session.take_writes());

        let ids = session.disconnect_all();
        assert_eq!(vec![DeviceId::new("a"), DeviceId::new("b")], ids);
        assert!(session.registry().is_empty());

        session.pump(&id, ChannelKind::Vibration);
        session.on_write_complete(write.completed(Ok(())));
        session.enqueue(&id, ChannelKind::Vibration, vec![3, 0]);
        assert!(session.take_writes().is_empty());
    }

    #[test]
    fn test_total_disconnect_while_playing() {
        let mut session = session(&["a", "b"]);
        session.start();

        assert!(!session.on_disconnect(&DeviceId::new("a")));
        assert!(session.on_disconnect(&DeviceId::new("b")));
        assert!(!session.on_disconnect(&DeviceId::new("unknown")));
    }

    #[test]
    fn test_halt() {
        let mut session = session(&["a"]);
        let id = DeviceId::new("a");
        session.start();
        session.on_position(sample(0));
        let first = single(session.take_writes());

        session.halt();
        assert!(!session.is_playing());
        let notes = single(session.take_writes());
        assert_eq!(ChannelKind::Notes, notes.kind);
        assert_eq!(vec![0], notes.payload);

        session.on_write_complete(first.completed(Ok(())));
        let vibration = single(session.take_writes());
        assert_eq!(id, vibration.device);
        assert_eq!(vec![0, 0], vibration.payload);
    }

    #[test]
    fn test_engine_stop_forces_zero_period() {
        let mut session = session(&["a"]);
        session.on_player_state(PlayerState::Playing);
        session.on_position(sample(0));
        let first = single(session.take_writes());
        session.on_write_complete(first.completed(Ok(())));

        session.on_player_state(PlayerState::Stopped);
        let writes = session.take_writes();
        assert!(writes
            .iter()
            .any(|write| write.kind == ChannelKind::Vibration && write.payload == vec![0, 0]));
        assert_eq!(None, session.last_period());

        // Already stopped, nothing else to send.
        session.on_player_state(PlayerState::Paused);
        assert!(session.take_writes().is_empty());
    }

    #[test]
    fn test_register_while_playing() {
        let mut session = session(&["a"]);
        session.start();
        session.on_position(sample(1000));
        let _ = session.take_writes();

        session
            .register(Peripheral::new(DeviceId::new("b"), "ESP32"))
            .expect("register");
        let write = single(session.take_writes());
        assert_eq!(DeviceId::new("b"), write.device);
        assert_eq!(vec![0x9b, 0x02], write.payload);
    }

    #[test]
    fn test_active_notes() {
        let mut session = session(&["a"]);
        session.on_active_notes(&[69.0]);
        let write = single(session.take_writes());
        assert_eq!(ChannelKind::Notes, write.kind);
        assert_eq!(vec![0xb8, 0x01], write.payload);
    }

    #[test]
    fn test_start_index() {
        let mut session = session(&["a"]);
        session.on_position(sample(1000));
        assert_eq!(8, session.start());
        assert!(session.is_playing());
    }
}
