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
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    error::Error,
    fmt,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    dispatch::ChannelKind,
    registry::DeviceId,
    util::hex_payload,
};

use super::{ConnectionError, Peripheral, ServiceFilter, TransportError};

/// A write that reached a mock peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub device: DeviceId,
    pub kind: ChannelKind,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    /// Number of peripherals the link can see.
    devices: usize,
    /// Connect attempts so far, used to pick the next peripheral.
    attempts: usize,
    connected: BTreeSet<DeviceId>,
    writes: Vec<Write>,
    in_flight: HashMap<(DeviceId, ChannelKind), usize>,
    max_in_flight: usize,
    connect_failures: VecDeque<ConnectionError>,
    write_failures: VecDeque<(ChannelKind, TransportError)>,
    disconnect_sender: Option<UnboundedSender<DeviceId>>,
}

/// A mock link. Peripherals are named mock-device-N and accept every write.
#[derive(Clone)]
pub struct Link {
    name: String,
    latency: Duration,
    failure_rate: f64,
    state: Arc<Mutex<State>>,
}

impl Link {
    /// Creates a mock link that can see the given number of peripherals.
    pub fn new(name: &str, devices: usize, latency: Duration, failure_rate: f64) -> Link {
        Link {
            name: name.to_string(),
            latency,
            failure_rate,
            state: Arc::new(Mutex::new(State {
                devices,
                ..Default::default()
            })),
        }
    }

    /// Makes the next connect attempt fail with the given error.
    pub fn fail_next_connect(&self, error: ConnectionError) {
        self.state.lock().connect_failures.push_back(error);
    }

    /// Makes the next write to the given channel kind fail with the given error.
    pub fn fail_next_write(&self, kind: ChannelKind, error: TransportError) {
        self.state.lock().write_failures.push_back((kind, error));
    }

    /// Drops the link to a peripheral and reports it like a real disconnect.
    pub fn simulate_disconnect(&self, device: &DeviceId) {
        let sender = {
            let mut state = self.state.lock();
            state.connected.remove(device);
            state.disconnect_sender.clone()
        };
        if let Some(sender) = sender {
            let _ = sender.send(device.clone());
        }
    }

    /// Gets every write that reached a peripheral, in completion order.
    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().writes.clone()
    }

    /// Gets the payloads written to one channel of one peripheral.
    pub fn payloads(&self, device: &DeviceId, kind: ChannelKind) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|write| &write.device == device && write.kind == kind)
            .map(|write| write.payload.clone())
            .collect()
    }

    /// The highest number of simultaneous writes seen on any single channel.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.state.lock().connected.contains(device)
    }

    fn jitter(&self) -> Duration {
        let max = self.latency.as_micros() / 4;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::thread_rng().gen_range(0..=max as u64))
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

impl super::Link for Link {
    fn connect(&self, filter: ServiceFilter) -> JoinHandle<Result<Peripheral, ConnectionError>> {
        let state = self.state.clone();
        let delay = self.latency + self.jitter();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut state = state.lock();
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            if state.devices == 0 {
                return Err(ConnectionError::NotFound(filter.service));
            }

            let name = format!("mock-device-{}", state.attempts % state.devices);
            state.attempts += 1;
            if let Some(prefix) = filter.name_prefix.as_ref() {
                if !name.starts_with(prefix.as_str()) {
                    return Err(ConnectionError::NotFound(filter.service));
                }
            }

            let id = DeviceId::new(&name);
            state.connected.insert(id.clone());
            info!(device = name, "Mock peripheral connected.");
            Ok(Peripheral::new(id, &name))
        })
    }

    fn write(
        &self,
        device: DeviceId,
        kind: ChannelKind,
        payload: Vec<u8>,
    ) -> JoinHandle<Result<(), TransportError>> {
        let state = self.state.clone();
        let delay = self.latency + self.jitter();
        let random_failure = self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate;
        tokio::spawn(async move {
            let key = (device.clone(), kind);
            {
                let mut state = state.lock();
                let in_flight = state.in_flight.entry(key.clone()).or_insert(0);
                *in_flight += 1;
                let in_flight = *in_flight;
                state.max_in_flight = state.max_in_flight.max(in_flight);
            }

            tokio::time::sleep(delay).await;

            let mut state = state.lock();
            if let Some(in_flight) = state.in_flight.get_mut(&key) {
                *in_flight -= 1;
            }

            if !state.connected.contains(&device) {
                return Err(TransportError::Network(format!("{} is not connected", device)));
            }
            if let Some(position) = state
                .write_failures
                .iter()
                .position(|(failure_kind, _)| *failure_kind == kind)
            {
                if let Some((_, error)) = state.write_failures.remove(position) {
                    return Err(error);
                }
            }
            if random_failure {
                return Err(TransportError::Write("simulated write failure".to_string()));
            }

            debug!(
                device = %device,
                channel = %kind,
                payload = hex_payload(&payload),
                "Mock write."
            );
            state.writes.push(Write {
                device,
                kind,
                payload,
            });
            Ok(())
        })
    }

    fn disconnect(&self, device: DeviceId) {
        self.state.lock().connected.remove(&device);
    }

    fn watch_disconnects(&self, sender: UnboundedSender<DeviceId>) -> Result<(), Box<dyn Error>> {
        let mut state = self.state.lock();
        if state.disconnect_sender.is_some() {
            return Err("Already watching disconnects.".into());
        }
        state.disconnect_sender = Some(sender);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{
        dispatch::ChannelKind,
        link::{ConnectionError, Link as _, ServiceFilter, TransportError},
        registry::DeviceId,
    };

    use super::Link;

    fn filter() -> ServiceFilter {
        ServiceFilter {
            service: "19b10000-e8f2-537e-4f6c-d104768a1214".to_string(),
            name_prefix: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cycles_devices() {
        let link = Link::new("mock", 2, Duration::from_millis(10), 0.0);
        let first = link.connect(filter()).await.unwrap().expect("connect");
        let second = link.connect(filter()).await.unwrap().expect("connect");
        let third = link.connect(filter()).await.unwrap().expect("connect");

        assert_eq!(DeviceId::new("mock-device-0"), first.id);
        assert_eq!(DeviceId::new("mock-device-1"), second.id);
        assert_eq!(first.id, third.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_devices() {
        let link = Link::new("mock", 0, Duration::ZERO, 0.0);
        assert!(matches!(
            link.connect(filter()).await.unwrap(),
            Err(ConnectionError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_records_and_fails() {
        let link = Link::new("mock", 1, Duration::from_millis(5), 0.0);
        let device = link.connect(filter()).await.unwrap().unwrap().id;

        link.write(device.clone(), ChannelKind::Vibration, vec![0xf4, 0x01])
            .await
            .unwrap()
            .expect("write");
        link.fail_next_write(
            ChannelKind::Vibration,
            TransportError::Write("busy".to_string()),
        );
        assert!(link
            .write(device.clone(), ChannelKind::Vibration, vec![0x00, 0x00])
            .await
            .unwrap()
            .is_err());
        assert_eq!(
            vec![vec![0xf4, 0x01]],
            link.payloads(&device, ChannelKind::Vibration)
        );

        link.disconnect(device.clone());
        let result = link
            .write(device, ChannelKind::Notes, vec![0])
            .await
            .unwrap();
        assert!(result.is_err_and(|e| e.is_network()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_disconnect_reports() {
        let link = Link::new("mock", 1, Duration::ZERO, 0.0);
        let device = link.connect(filter()).await.unwrap().unwrap().id;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        link.watch_disconnects(tx.clone()).expect("watch");
        assert!(link.watch_disconnects(tx).is_err());

        link.simulate_disconnect(&device);
        assert_eq!(Some(device.clone()), rx.recv().await);
        assert!(!link.is_connected(&device));
    }
}
