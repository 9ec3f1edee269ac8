use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::peer::{PeerId, PeerSocket};
use crate::relay::{RelayState, RelayStats};

enum RelayCommand {
    Open { id: PeerId, socket: PeerSocket },
    Text { id: PeerId, text: String },
    Binary { id: PeerId, data: Vec<u8> },
    Close { id: PeerId },
    Error { id: PeerId, error: String },
    Stats { reply: oneshot::Sender<RelayStats> },
}

/// Cloneable handle to the task that owns the [`RelayState`].
///
/// Socket events from every connection funnel into one queue, so pairing and
/// disposal never interleave.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    pub fn spawn(state: RelayState, sweep_interval: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(state, rx, sweep_interval));
        (Self { tx }, task)
    }

    pub fn open(&self, id: PeerId, socket: PeerSocket) {
        self.submit(RelayCommand::Open { id, socket });
    }

    pub fn text(&self, id: PeerId, text: String) {
        self.submit(RelayCommand::Text { id, text });
    }

    pub fn binary(&self, id: PeerId, data: Vec<u8>) {
        self.submit(RelayCommand::Binary { id, data });
    }

    pub fn close(&self, id: PeerId) {
        self.submit(RelayCommand::Close { id });
    }

    pub fn error(&self, id: PeerId, error: String) {
        self.submit(RelayCommand::Error { id, error });
    }

    pub async fn stats(&self) -> Option<RelayStats> {
        let (reply, rx) = oneshot::channel();
        self.submit(RelayCommand::Stats { reply });
        rx.await.ok()
    }

    fn submit(&self, command: RelayCommand) {
        if self.tx.send(command).is_err() {
            debug!("relay task stopped; dropping command");
        }
    }
}

async fn run(
    mut state: RelayState,
    mut rx: mpsc::UnboundedReceiver<RelayCommand>,
    sweep_interval: Duration,
) {
    let mut sweeper = tokio::time::interval(sweep_interval);
    sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(sweep_ms = sweep_interval.as_millis() as u64, "relay task started");

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                apply(&mut state, command);
            }
            _ = sweeper.tick() => {
                state.sweep(Instant::now());
            }
        }
    }
    info!("relay task stopped");
}

fn apply(state: &mut RelayState, command: RelayCommand) {
    let now = Instant::now();
    match command {
        RelayCommand::Open { id, socket } => state.on_open(id, socket, now),
        RelayCommand::Text { id, text } => state.on_text(id, &text, now),
        RelayCommand::Binary { id, data } => state.on_binary(id, data, now),
        RelayCommand::Close { id } => state.on_close(id),
        RelayCommand::Error { id, error } => state.on_error(id, &error),
        RelayCommand::Stats { reply } => {
            let _ = reply.send(state.stats());
        }
    }
}
