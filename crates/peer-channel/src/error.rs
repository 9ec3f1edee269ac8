use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("data channel is not open")]
    NotReady,
    #[error("another send is still in flight on this channel")]
    SendInProgress,
    #[error("peer channel disposed")]
    Disposed,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("webrtc error: {0}")]
    Webrtc(#[from] webrtc::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
