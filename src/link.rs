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
use std::{error::Error, fmt, sync::Arc};

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

use crate::{config, dispatch::ChannelKind, registry::DeviceId};

#[cfg(feature = "ble")]
mod btle;
mod error;
pub mod mock;

pub use error::{ConnectionError, TransportError};

/// Selects which peripherals a connect attempt accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFilter {
    /// The service UUID the peripheral must advertise.
    pub service: String,
    /// An optional prefix the advertised name must start with.
    pub name_prefix: Option<String>,
}

/// The result of a successful connect handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: DeviceId,
    pub name: String,
}

impl Peripheral {
    pub fn new(id: DeviceId, name: &str) -> Peripheral {
        Peripheral {
            id,
            name: name.to_string(),
        }
    }
}

/// A wireless link to haptic peripherals. Every peripheral exposes a vibration and a
/// notes endpoint that accept raw bytes.
pub trait Link: fmt::Display + Send + Sync + 'static {
    /// Finds a peripheral matching the filter, connects to it and verifies that it
    /// exposes both endpoints.
    fn connect(&self, filter: ServiceFilter) -> JoinHandle<Result<Peripheral, ConnectionError>>;

    /// Writes the payload to one endpoint of a peripheral without waiting for an
    /// acknowledgment from the peripheral.
    fn write(
        &self,
        device: DeviceId,
        kind: ChannelKind,
        payload: Vec<u8>,
    ) -> JoinHandle<Result<(), TransportError>>;

    /// Requests a link level disconnect.
    fn disconnect(&self, device: DeviceId);

    /// Reports link level disconnects to the given sender.
    fn watch_disconnects(&self, sender: UnboundedSender<DeviceId>) -> Result<(), Box<dyn Error>>;
}

/// Gets the link described by the configuration. Names starting with "mock" get the
/// in-process mock link.
pub async fn get_link(config: &config::Link) -> Result<Arc<dyn Link>, Box<dyn Error>> {
    if config.name().starts_with("mock") {
        return Ok(Arc::new(mock::Link::new(
            config.name(),
            config.mock_devices(),
            config.mock_latency()?,
            config.mock_failure_rate(),
        )));
    }

    #[cfg(feature = "ble")]
    return Ok(Arc::new(btle::Link::new(config).await?));

    #[cfg(not(feature = "ble"))]
    return Err(format!(
        "link {} needs Bluetooth support, rebuild with the ble feature",
        config.name()
    )
    .into());
}
