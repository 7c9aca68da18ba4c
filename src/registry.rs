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
    collections::{btree_map::Entry, BTreeMap},
    fmt,
};

use tracing::{info, warn};

use crate::{
    dispatch::{ChannelKind, OutboundChannel},
    link::{ConnectionError, Peripheral},
};

/// The identity of a peripheral as reported by the link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: &str) -> DeviceId {
        DeviceId(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A connected (or formerly connected) peripheral and its two channels.
#[derive(Debug)]
pub struct PeripheralEndpoint {
    id: DeviceId,
    name: String,
    state: ConnectionState,
    /// Distinguishes this endpoint from earlier endpoints with the same identity.
    epoch: u64,
    vibration: OutboundChannel,
    notes: OutboundChannel,
}

impl PeripheralEndpoint {
    fn new(peripheral: Peripheral, epoch: u64) -> PeripheralEndpoint {
        PeripheralEndpoint {
            id: peripheral.id,
            name: peripheral.name,
            state: ConnectionState::Connected,
            epoch,
            vibration: OutboundChannel::new(ChannelKind::Vibration),
            notes: OutboundChannel::new(ChannelKind::Notes),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn channel(&self, kind: ChannelKind) -> &OutboundChannel {
        match kind {
            ChannelKind::Vibration => &self.vibration,
            ChannelKind::Notes => &self.notes,
        }
    }

    pub fn channel_mut(&mut self, kind: ChannelKind) -> &mut OutboundChannel {
        match kind {
            ChannelKind::Vibration => &mut self.vibration,
            ChannelKind::Notes => &mut self.notes,
        }
    }

    /// Marks the endpoint disconnected and discards everything queued on it.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.vibration.clear();
        self.notes.clear();
    }

    /// Marks the endpoint disconnected after a network failure on one channel,
    /// discarding that channel's queue.
    pub fn mark_link_lost(&mut self, kind: ChannelKind) {
        self.state = ConnectionState::Disconnected;
        self.channel_mut(kind).clear();
    }
}

/// Tracks the peripherals of a session.
#[derive(Debug, Default)]
pub struct Registry {
    endpoints: BTreeMap<DeviceId, PeripheralEndpoint>,
    next_epoch: u64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a peripheral after a successful handshake. Fails if an endpoint with
    /// the same identity is still connected. A disconnected endpoint with the same
    /// identity is replaced by a fresh one.
    pub fn register(
        &mut self,
        peripheral: Peripheral,
    ) -> Result<&PeripheralEndpoint, ConnectionError> {
        if self
            .endpoints
            .get(&peripheral.id)
            .is_some_and(|endpoint| endpoint.is_connected())
        {
            return Err(ConnectionError::AlreadyConnected(peripheral.id));
        }

        self.next_epoch += 1;
        let id = peripheral.id.clone();
        let endpoint = PeripheralEndpoint::new(peripheral, self.next_epoch);
        info!(
            device = endpoint.name(),
            id = %id,
            "Device added."
        );

        Ok(match self.endpoints.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.insert(endpoint);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(endpoint),
        })
    }

    /// Handles a link level disconnect. Returns false if the device is unknown.
    pub fn on_disconnect(&mut self, id: &DeviceId) -> bool {
        match self.endpoints.get_mut(id) {
            Some(endpoint) => {
                warn!(device = endpoint.name(), id = %id, "Device disconnected.");
                endpoint.mark_disconnected();
                true
            }
            None => false,
        }
    }

    /// Empties the registry, returning the identities the link should disconnect.
    pub fn disconnect_all(&mut self) -> Vec<DeviceId> {
        let ids: Vec<DeviceId> = self.endpoints.keys().cloned().collect();
        self.endpoints.clear();
        ids
    }

    pub fn get(&self, id: &DeviceId) -> Option<&PeripheralEndpoint> {
        self.endpoints.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut PeripheralEndpoint> {
        self.endpoints.get_mut(id)
    }

    /// Gets the identities of all connected endpoints.
    pub fn connected(&self) -> Vec<DeviceId> {
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.is_connected())
            .map(|endpoint| endpoint.id.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.endpoints
            .values()
            .filter(|endpoint| endpoint.is_connected())
            .count()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod test {
    use crate::{dispatch::ChannelKind, link::ConnectionError, link::Peripheral};

    use super::{ConnectionState, DeviceId, Registry};

    fn peripheral(id: &str) -> Peripheral {
        Peripheral::new(DeviceId::new(id), "ESP32")
    }

    #[test]
    fn test_register() {
        let mut registry = Registry::new();
        let endpoint = registry.register(peripheral("a")).expect("register");
        assert_eq!(ConnectionState::Connected, endpoint.state());
        assert!(endpoint.channel(ChannelKind::Vibration).is_empty());
        assert!(endpoint.channel(ChannelKind::Notes).is_empty());
        assert_eq!(1, registry.connected_count());
    }

    #[test]
    fn test_register_already_connected() {
        let mut registry = Registry::new();
        registry.register(peripheral("a")).expect("register");

        assert!(matches!(
            registry.register(peripheral("a")),
            Err(ConnectionError::AlreadyConnected(_))
        ));
        assert_eq!(1, registry.len());
    }

    #[test]
    fn test_disconnect_clears_channels() {
        let mut registry = Registry::new();
        let id = DeviceId::new("a");
        registry.register(peripheral("a")).expect("register");
        {
            let endpoint = registry.get_mut(&id).unwrap();
            endpoint.channel_mut(ChannelKind::Vibration).enqueue(vec![1, 2]);
            endpoint.channel_mut(ChannelKind::Notes).enqueue(vec![0]);
            let _in_flight = endpoint.channel_mut(ChannelKind::Notes).take_next();
        }

        assert!(registry.on_disconnect(&id));
        let endpoint = registry.get(&id).unwrap();
        assert_eq!(ConnectionState::Disconnected, endpoint.state());
        assert!(endpoint.channel(ChannelKind::Vibration).is_empty());
        assert!(!endpoint.channel(ChannelKind::Notes).is_in_flight());
        assert_eq!(0, registry.connected_count());

        assert!(!registry.on_disconnect(&DeviceId::new("unknown")));
    }

    #[test]
    fn test_reconnect_creates_fresh_endpoint() {
        let mut registry = Registry::new();
        let id = DeviceId::new("a");
        let first_epoch = registry.register(peripheral("a")).unwrap().epoch();
        registry.on_disconnect(&id);

        let endpoint = registry.register(peripheral("a")).expect("reconnect");
        assert!(endpoint.is_connected());
        assert_ne!(first_epoch, endpoint.epoch());
    }

    #[test]
    fn test_disconnect_all() {
        let mut registry = Registry::new();
        registry.register(peripheral("a")).unwrap();
        registry.register(peripheral("b")).unwrap();
        registry.on_disconnect(&DeviceId::new("b"));

        let ids = registry.disconnect_all();
        assert_eq!(vec![DeviceId::new("a"), DeviceId::new("b")], ids);
        assert!(registry.is_empty());
    }
}
