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

use crate::{dispatch::ChannelKind, registry::DeviceId};

/// Errors raised while establishing a connection. No registry state is kept for a
/// failed attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("device {0} is already connected")]
    AlreadyConnected(DeviceId),
    #[error("no device found advertising service {0}")]
    NotFound(String),
    #[error("device {device} has no {kind} characteristic")]
    MissingCapability { device: String, kind: ChannelKind },
    #[error("connecting to {0} timed out")]
    Timeout(String),
    #[error("link error: {0}")]
    Link(String),
}

/// Errors raised by a write.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The link to the device is gone. Fatal for the device.
    #[error("network error: {0}")]
    Network(String),
    /// Any other write failure. The dispatcher skips the command and carries on.
    #[error("write failed: {0}")]
    Write(String),
}

impl TransportError {
    pub fn is_network(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}
