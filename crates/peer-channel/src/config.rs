use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::codec::DEFAULT_BLOCK_SIZE;

pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "dc";
pub const MIN_BLOCK_SIZE: usize = 1024;
/// SCTP message ceiling negotiated by default.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Configuration for a [`PeerChannel`](crate::PeerChannel).
#[derive(Clone, Debug)]
pub struct PeerChannelConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Size of each data block after the header
    pub block_size: usize,
    /// The initiating side creates the data channel; the other side adopts it
    pub create_data_channel_locally: bool,
    pub label: String,
}

impl Default for PeerChannelConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            block_size: DEFAULT_BLOCK_SIZE,
            create_data_channel_locally: false,
            label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
        }
    }
}

impl PeerChannelConfig {
    pub fn initiator() -> Self {
        Self {
            create_data_channel_locally: true,
            ..Self::default()
        }
    }

    pub fn responder() -> Self {
        Self::default()
    }

    /// Reads `FASTSEND_BLOCK_SIZE` and `FASTSEND_LOCALHOST_ONLY`.
    pub fn from_env(create_data_channel_locally: bool) -> Self {
        let block_size = parse_block_size_env("FASTSEND_BLOCK_SIZE", DEFAULT_BLOCK_SIZE);
        let config = Self {
            block_size,
            create_data_channel_locally,
            ..Self::default()
        };
        if std::env::var("FASTSEND_LOCALHOST_ONLY").is_ok() {
            config.localhost()
        } else {
            config
        }
    }

    /// Drop STUN/TURN servers; only host candidates are gathered.
    pub fn localhost(mut self) -> Self {
        self.ice_servers.clear();
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.clamp(1, MAX_BLOCK_SIZE);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

fn parse_block_size_env(var: &str, default: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&parsed) => parsed,
            Ok(parsed) => {
                warn!(
                    var,
                    parsed,
                    min = MIN_BLOCK_SIZE,
                    max = MAX_BLOCK_SIZE,
                    default,
                    "block size out of range; using default"
                );
                default
            }
            Err(err) => {
                warn!(var, error = %err, default, "failed to parse block size from env; using default");
                default
            }
        },
        Err(_) => default,
    }
}
