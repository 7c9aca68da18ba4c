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
use std::{collections::HashMap, error::Error, fmt, str::FromStr, sync::Arc, time::Duration};

use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral as BlePeripheral},
};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{config, dispatch::ChannelKind, registry::DeviceId};

use super::{ConnectionError, Peripheral, ServiceFilter, TransportError};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A connected peripheral and its two characteristics.
#[derive(Clone)]
struct Connected {
    peripheral: BlePeripheral,
    vibration: Characteristic,
    notes: Characteristic,
}

impl Connected {
    fn characteristic(&self, kind: ChannelKind) -> &Characteristic {
        match kind {
            ChannelKind::Vibration => &self.vibration,
            ChannelKind::Notes => &self.notes,
        }
    }
}

/// A Bluetooth LE link on the first adapter of the system.
pub struct Link {
    name: String,
    adapter: Adapter,
    vibration: Uuid,
    notes: Uuid,
    scan_time: Duration,
    connect_timeout: Duration,
    connected: Arc<Mutex<HashMap<DeviceId, Connected>>>,
}

impl Link {
    pub async fn new(config: &config::Link) -> Result<Link, Box<dyn Error>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or("no Bluetooth adapter found")?;

        Ok(Link {
            name: config.name().to_string(),
            adapter,
            vibration: Uuid::from_str(config.vibration_characteristic())?,
            notes: Uuid::from_str(config.notes_characteristic())?,
            scan_time: config.scan_time()?,
            connect_timeout: config.connect_timeout()?,
            connected: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Bluetooth LE)", self.name)
    }
}

/// Picks the first match that isn't connected yet. Fails if every match is already
/// connected.
fn pick_match(matches: &[(DeviceId, bool)]) -> Option<Result<usize, ConnectionError>> {
    let (first, _) = matches.first()?;
    match matches.iter().position(|(_, connected)| !connected) {
        Some(index) => Some(Ok(index)),
        None => Some(Err(ConnectionError::AlreadyConnected(first.clone()))),
    }
}

/// Polls the adapter until a peripheral advertising the service shows up.
async fn find_peripheral(
    adapter: &Adapter,
    service: Uuid,
    filter: &ServiceFilter,
    connected: &Mutex<HashMap<DeviceId, Connected>>,
) -> Result<(BlePeripheral, String), ConnectionError> {
    loop {
        let mut candidates = Vec::new();
        for peripheral in adapter.peripherals().await.unwrap_or_default() {
            let id = DeviceId::new(&peripheral.id().to_string());
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            if !properties.services.contains(&service) {
                continue;
            }
            let name = properties.local_name.unwrap_or_else(|| id.to_string());
            if filter
                .name_prefix
                .as_ref()
                .is_some_and(|prefix| !name.starts_with(prefix.as_str()))
            {
                continue;
            }
            let is_connected = connected.lock().contains_key(&id);
            candidates.push((id, is_connected, peripheral, name));
        }

        let matches: Vec<(DeviceId, bool)> = candidates
            .iter()
            .map(|(id, is_connected, _, _)| (id.clone(), *is_connected))
            .collect();
        match pick_match(&matches) {
            Some(Ok(index)) => {
                let (_, _, peripheral, name) = candidates.swap_remove(index);
                return Ok((peripheral, name));
            }
            Some(Err(e)) => return Err(e),
            None => tokio::time::sleep(SCAN_POLL_INTERVAL).await,
        }
    }
}

impl super::Link for Link {
    fn connect(&self, filter: ServiceFilter) -> JoinHandle<Result<Peripheral, ConnectionError>> {
        let adapter = self.adapter.clone();
        let connected = self.connected.clone();
        let vibration_uuid = self.vibration;
        let notes_uuid = self.notes;
        let scan_time = self.scan_time;
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let service = Uuid::from_str(&filter.service)
                .map_err(|e| ConnectionError::Link(e.to_string()))?;
            adapter
                .start_scan(ScanFilter {
                    services: vec![service],
                })
                .await
                .map_err(|e| ConnectionError::Link(e.to_string()))?;

            let found = tokio::time::timeout(
                scan_time,
                find_peripheral(&adapter, service, &filter, &connected),
            )
            .await;
            if let Err(e) = adapter.stop_scan().await {
                debug!(err = %e, "Unable to stop scan.");
            }
            let (peripheral, name) =
                found.map_err(|_| ConnectionError::NotFound(filter.service.clone()))??;

            info!(device = name, "Connecting to peripheral.");
            tokio::time::timeout(connect_timeout, peripheral.connect())
                .await
                .map_err(|_| ConnectionError::Timeout(name.clone()))?
                .map_err(|e| ConnectionError::Link(e.to_string()))?;
            tokio::time::timeout(connect_timeout, peripheral.discover_services())
                .await
                .map_err(|_| ConnectionError::Timeout(name.clone()))?
                .map_err(|e| ConnectionError::Link(e.to_string()))?;

            let characteristics = peripheral.characteristics();
            let find = |uuid: Uuid, kind: ChannelKind| {
                characteristics
                    .iter()
                    .find(|characteristic| characteristic.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| ConnectionError::MissingCapability {
                        device: name.clone(),
                        kind,
                    })
            };
            let capabilities = find(vibration_uuid, ChannelKind::Vibration)
                .and_then(|vibration| Ok((vibration, find(notes_uuid, ChannelKind::Notes)?)));
            let (vibration, notes) = match capabilities {
                Ok(capabilities) => capabilities,
                Err(e) => {
                    let _ = peripheral.disconnect().await;
                    return Err(e);
                }
            };

            let id = DeviceId::new(&peripheral.id().to_string());
            connected.lock().insert(
                id.clone(),
                Connected {
                    peripheral,
                    vibration,
                    notes,
                },
            );
            Ok(Peripheral::new(id, &name))
        })
    }

    fn write(
        &self,
        device: DeviceId,
        kind: ChannelKind,
        payload: Vec<u8>,
    ) -> JoinHandle<Result<(), TransportError>> {
        let connected = self.connected.lock().get(&device).cloned();
        tokio::spawn(async move {
            let connected = connected
                .ok_or_else(|| TransportError::Network(format!("{} is not connected", device)))?;
            connected
                .peripheral
                .write(
                    connected.characteristic(kind),
                    &payload,
                    WriteType::WithoutResponse,
                )
                .await
                .map_err(|e| match e {
                    btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => {
                        TransportError::Network(e.to_string())
                    }
                    e => TransportError::Write(e.to_string()),
                })
        })
    }

    fn disconnect(&self, device: DeviceId) {
        let Some(connected) = self.connected.lock().remove(&device) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = connected.peripheral.disconnect().await {
                warn!(device = %device, err = %e, "Error disconnecting peripheral.");
            }
        });
    }

    fn watch_disconnects(&self, sender: UnboundedSender<DeviceId>) -> Result<(), Box<dyn Error>> {
        let adapter = self.adapter.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(err = %e, "Unable to watch adapter events.");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let id = DeviceId::new(&id.to_string());
                    if connected.lock().remove(&id).is_some() && sender.send(id).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{link::ConnectionError, registry::DeviceId};

    use super::pick_match;

    #[test]
    fn test_pick_match() {
        assert!(pick_match(&[]).is_none());

        let a = DeviceId::new("a");
        let b = DeviceId::new("b");
        assert!(matches!(
            pick_match(&[(a.clone(), true), (b.clone(), false)]),
            Some(Ok(1))
        ));
        assert!(matches!(
            pick_match(&[(a.clone(), false), (b.clone(), false)]),
            Some(Ok(0))
        ));
        assert!(matches!(
            pick_match(&[(a.clone(), true), (b, true)]),
            Some(Err(ConnectionError::AlreadyConnected(id))) if id == a
        ));
    }
}
