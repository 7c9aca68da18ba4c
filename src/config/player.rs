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
use std::time::Duration;

use duration_string::DurationString;
use serde::Deserialize;

use crate::link::ServiceFilter;

use super::ConfigError;

pub const DEFAULT_SERVICE: &str = "19b10000-e8f2-537e-4f6c-d104768a1214";
pub const DEFAULT_VIBRATION_CHARACTERISTIC: &str = "19b10002-e8f2-537e-4f6c-d104768a1214";
pub const DEFAULT_NOTES_CHARACTERISTIC: &str = "39114440-f153-414b-9ca8-cd739acad81c";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SCAN_TIME: Duration = Duration::from_secs(15);
const DEFAULT_MOCK_LATENCY: Duration = Duration::from_millis(5);
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_TICKS_PER_QUARTER: u32 = 960;

fn parse_duration(value: &Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => Ok(DurationString::from_string(value.clone())?.into()),
        None => Ok(default),
    }
}

/// The configuration of the wireless link.
#[derive(Deserialize, Clone, Debug)]
pub struct Link {
    /// The link to use. Names starting with "mock" select the mock link.
    name: String,

    /// The service UUID peripherals must advertise.
    service: Option<String>,

    /// Only peripherals whose name starts with this prefix are accepted.
    name_prefix: Option<String>,

    vibration_characteristic: Option<String>,

    notes_characteristic: Option<String>,

    /// How long to wait for a connect handshake.
    connect_timeout: Option<String>,

    /// How long to scan for a peripheral before giving up.
    scan_time: Option<String>,

    /// The number of peripherals the mock link can see (default: 1).
    mock_devices: Option<usize>,

    /// The simulated write latency of the mock link.
    mock_latency: Option<String>,

    /// The fraction of mock writes that fail (default: 0).
    mock_failure_rate: Option<f64>,
}

impl Link {
    /// New will create a new link configuration.
    pub fn new(name: &str) -> Link {
        Link {
            name: name.to_string(),
            service: None,
            name_prefix: None,
            vibration_characteristic: None,
            notes_characteristic: None,
            connect_timeout: None,
            scan_time: None,
            mock_devices: None,
            mock_latency: None,
            mock_failure_rate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or(DEFAULT_SERVICE)
    }

    pub fn name_prefix(&self) -> Option<&str> {
        self.name_prefix.as_deref()
    }

    /// Gets the filter connect attempts use.
    pub fn service_filter(&self) -> ServiceFilter {
        ServiceFilter {
            service: self.service().to_string(),
            name_prefix: self.name_prefix.clone(),
        }
    }

    pub fn vibration_characteristic(&self) -> &str {
        self.vibration_characteristic
            .as_deref()
            .unwrap_or(DEFAULT_VIBRATION_CHARACTERISTIC)
    }

    pub fn notes_characteristic(&self) -> &str {
        self.notes_characteristic
            .as_deref()
            .unwrap_or(DEFAULT_NOTES_CHARACTERISTIC)
    }

    pub fn connect_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.connect_timeout, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn scan_time(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.scan_time, DEFAULT_SCAN_TIME)
    }

    pub fn mock_devices(&self) -> usize {
        self.mock_devices.unwrap_or(1)
    }

    pub fn mock_latency(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.mock_latency, DEFAULT_MOCK_LATENCY)
    }

    pub fn mock_failure_rate(&self) -> f64 {
        self.mock_failure_rate.unwrap_or(0.0).clamp(0.0, 1.0)
    }
}

/// The configuration for the player.
#[derive(Deserialize, Clone, Debug)]
pub struct Player {
    /// The wireless link.
    link: Link,

    /// The number of devices to connect (default: 1).
    devices: Option<usize>,

    /// How often the playback engine reports its position (default: 50ms).
    sample_interval: Option<String>,

    /// The resolution of the score (default: 960).
    ticks_per_quarter: Option<u32>,

    /// The shortest time between two played notes (default: 0).
    note_min_interval: Option<String>,
}

impl Player {
    pub fn new(link: Link) -> Player {
        Player {
            link,
            devices: None,
            sample_interval: None,
            ticks_per_quarter: None,
            note_min_interval: None,
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn devices(&self) -> usize {
        self.devices.unwrap_or(1)
    }

    pub fn sample_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.sample_interval, DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn ticks_per_quarter(&self) -> u32 {
        self.ticks_per_quarter
            .unwrap_or(DEFAULT_TICKS_PER_QUARTER)
            .max(1)
    }

    pub fn note_min_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.note_min_interval, Duration::ZERO)
    }
}
