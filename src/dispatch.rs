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
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use crate::{link::TransportError, registry::DeviceId};

/// The two independent command streams of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Vibration,
    Notes,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Vibration => write!(f, "vibration"),
            ChannelKind::Notes => write!(f, "notes"),
        }
    }
}

/// A command waiting to be written.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    payload: Vec<u8>,
    /// When the command was queued, for latency measurement.
    enqueued_at: Instant,
}

impl PendingCommand {
    fn new(payload: Vec<u8>) -> PendingCommand {
        PendingCommand {
            payload,
            enqueued_at: Instant::now(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// How long the command has been waiting.
    pub fn latency(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// A serialized FIFO writer for one channel of one peripheral. At most one write is
/// in flight at a time; the next queued command is only handed out once the
/// previous write has completed.
#[derive(Debug)]
pub struct OutboundChannel {
    kind: ChannelKind,
    queue: VecDeque<PendingCommand>,
    in_flight: bool,
}

impl OutboundChannel {
    /// Creates an empty channel.
    pub fn new(kind: ChannelKind) -> OutboundChannel {
        OutboundChannel {
            kind,
            queue: VecDeque::new(),
            in_flight: false,
        }
    }

    /// Queues a payload. On the notes channel a payload identical to the last
    /// command still waiting in the queue is dropped. Returns whether the payload
    /// was queued.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.kind == ChannelKind::Notes
            && self
                .queue
                .back()
                .is_some_and(|last| last.payload == payload)
        {
            return false;
        }

        self.queue.push_back(PendingCommand::new(payload));
        true
    }

    /// Takes the head of the queue for writing and marks the channel in flight.
    /// Returns None while a write is already in flight or when the queue is empty.
    pub fn take_next(&mut self) -> Option<PendingCommand> {
        if self.in_flight {
            return None;
        }

        let command = self.queue.pop_front()?;
        self.in_flight = true;
        Some(command)
    }

    /// Marks the in-flight write as finished, successfully or not.
    pub fn complete(&mut self) {
        self.in_flight = false;
    }

    /// Discards everything queued and forgets the in-flight write.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// A write handed to the link.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub device: DeviceId,
    /// The registration epoch of the endpoint the write was issued for.
    pub epoch: u64,
    pub kind: ChannelKind,
    pub payload: Vec<u8>,
}

/// The outcome of a write, posted back to the controller.
#[derive(Debug)]
pub struct WriteCompletion {
    pub device: DeviceId,
    pub epoch: u64,
    pub kind: ChannelKind,
    pub result: Result<(), TransportError>,
}

impl WriteRequest {
    /// Creates the completion for this request.
    pub fn completed(&self, result: Result<(), TransportError>) -> WriteCompletion {
        WriteCompletion {
            device: self.device.clone(),
            epoch: self.epoch,
            kind: self.kind,
            result,
        }
    }
}
