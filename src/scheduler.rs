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
use std::{pin::Pin, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{Instant, Sleep},
};
use tracing::{debug, span, Instrument, Level};

use crate::tempo::BeatPause;

/// Longest single wait the scheduler arms a timer for.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Messages into the beat scheduler.
#[derive(Debug, Clone)]
pub enum Command {
    /// Cancels any pending beat and starts pacing the pauses at the given index.
    Start {
        start_index: usize,
        pauses: Arc<[BeatPause]>,
    },
    /// Cancels any pending beat. Does nothing if already stopped.
    Stop,
}

/// Messages out of the beat scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Beat(BeatPause),
    /// The end of the pause sequence was reached.
    Finished,
}

/// Paces beat pauses on its own task. The scheduler shares nothing with its owner:
/// it is driven by commands and answers with outputs. The task exits once the
/// scheduler is dropped.
pub struct Scheduler {
    commands: UnboundedSender<Command>,
}

impl Scheduler {
    pub fn spawn(output: UnboundedSender<Output>) -> Scheduler {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(commands_rx, output).instrument(span!(Level::INFO, "beat scheduler")));
        Scheduler { commands }
    }

    pub fn start(&self, start_index: usize, pauses: Arc<[BeatPause]>) {
        self.send(Command::Start {
            start_index,
            pauses,
        });
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Beat scheduler is gone.");
        }
    }
}

async fn run(mut commands: UnboundedReceiver<Command>, output: UnboundedSender<Output>) {
    let mut pauses: Arc<[BeatPause]> = Arc::from(Vec::new());
    let mut cursor = 0;
    let mut armed = false;
    let sleep = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start { start_index, pauses: new_pauses }) => {
                    debug!(start_index, beats = new_pauses.len(), "Starting beats.");
                    pauses = new_pauses;
                    cursor = start_index;
                    armed = emit(&pauses, &mut cursor, &output, sleep.as_mut());
                }
                Some(Command::Stop) => {
                    armed = false;
                    cursor = 0;
                }
                None => return,
            },
            () = &mut sleep, if armed => {
                cursor += 1;
                armed = emit(&pauses, &mut cursor, &output, sleep.as_mut());
            }
        }
    }
}

/// Emits the beat at the cursor and arms the timer for its pause. Returns whether
/// the timer was armed.
fn emit(
    pauses: &[BeatPause],
    cursor: &mut usize,
    output: &UnboundedSender<Output>,
    sleep: Pin<&mut Sleep>,
) -> bool {
    match pauses.get(*cursor) {
        Some(pause) => {
            let _ = output.send(Output::Beat(*pause));
            sleep.reset(Instant::now() + pause.wait().min(MAX_WAIT));
            true
        }
        None => {
            let _ = output.send(Output::Finished);
            *cursor = 0;
            false
        }
    }
}
