use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::codec::Delivery;
use crate::error::ChannelError;

/// Notifications a [`PeerChannel`](crate::PeerChannel) sends to its owner.
#[derive(Debug)]
pub enum PeerEvent {
    /// A local offer or answer to forward to the remote side.
    SdpReady(RTCSessionDescription),
    IceCandidate(RTCIceCandidateInit),
    /// The data channel is open and `send` will be accepted.
    Opened,
    Connected,
    Received(Delivery),
    Error(ChannelError),
    /// Emitted once; no events follow.
    Disposed,
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;
