//! JSON envelopes exchanged with the pairing relay.
//!
//! Control messages (`send`, `receive`) are read by the relay itself. Once
//! paired, `sdp` and `ice` envelopes are forwarded verbatim to the other side.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::events::PeerEvent;

pub const STATUS_PAIRED: i32 = 0;
pub const STATUS_NOT_FOUND: i32 = 404;

/// Messages a client writes to the relay socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientSignal {
    Send,
    #[serde(alias = "recive")]
    Receive {
        code: String,
    },
    Sdp {
        data: RTCSessionDescription,
    },
    Ice {
        data: RTCIceCandidateInit,
    },
}

impl ClientSignal {
    /// The envelope to forward for a local negotiation event, if any.
    pub fn from_event(event: &PeerEvent) -> Option<Self> {
        match event {
            PeerEvent::SdpReady(sdp) => Some(ClientSignal::Sdp { data: sdp.clone() }),
            PeerEvent::IceCandidate(candidate) => Some(ClientSignal::Ice {
                data: candidate.clone(),
            }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Messages a client reads from the relay socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelaySignal {
    Code { code: String },
    Status { code: i32 },
    Err { data: i32, msg: String },
    Sdp { data: RTCSessionDescription },
    Ice { data: RTCIceCandidateInit },
}

impl RelaySignal {
    pub fn is_paired(&self) -> bool {
        matches!(self, RelaySignal::Status { code } if *code == STATUS_PAIRED)
    }
}
