use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::protocol::ServerMessage;

pub type PeerId = Uuid;

pub fn generate_peer_id() -> PeerId {
    Uuid::new_v4()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unset,
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unset => "unset",
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

/// Frames the relay asks a connection's writer task to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

pub type PeerSocket = mpsc::UnboundedSender<Outbound>;

/// Signaling-side record for one websocket.
#[derive(Debug)]
pub struct RelayPeer {
    pub id: PeerId,
    socket: PeerSocket,
    pub role: Role,
    pub pairing_code: Option<String>,
    pair: Option<PeerId>,
}

impl RelayPeer {
    pub fn new(id: PeerId, socket: PeerSocket) -> Self {
        Self {
            id,
            socket,
            role: Role::Unset,
            pairing_code: None,
            pair: None,
        }
    }

    pub fn pair(&self) -> Option<PeerId> {
        self.pair
    }

    pub fn is_paired(&self) -> bool {
        self.pair.is_some()
    }

    /// Records the partner. A peer is linked at most once.
    pub fn link(&mut self, other: PeerId) {
        debug_assert!(self.pair.is_none(), "peer {} relinked", self.id);
        if self.pair.is_none() {
            self.pair = Some(other);
        }
    }

    pub fn is_open(&self) -> bool {
        !self.socket.is_closed()
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        self.send_text(message.to_json())
    }

    pub fn send_text(&self, text: String) -> bool {
        let delivered = self.socket.send(Outbound::Text(text)).is_ok();
        if !delivered {
            trace!(peer_id = %self.id, "writer gone; dropping frame");
        }
        delivered
    }

    pub fn close(&self) {
        let _ = self.socket.send(Outbound::Close);
    }
}
