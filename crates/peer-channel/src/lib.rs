//! Chunked payload transfer over one ordered, reliable WebRTC data channel.
//!
//! A payload travels as a JSON header announcing the block count and kind,
//! followed by that many raw blocks. Sends are paced by the data channel's
//! buffered-amount-low callback; receives are reassembled one message at a
//! time through an [`OrderedDeliveryQueue`].

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod progress;
pub mod queue;
pub mod signal;

pub use channel::{ChannelState, PeerChannel};
pub use codec::{Delivery, Payload, PayloadKind, ReceiveInfo, ReceiveSession, TransferHeader};
pub use config::PeerChannelConfig;
pub use error::ChannelError;
pub use events::{PeerEvent, PeerEvents};
pub use progress::{NoProgress, ProgressSink, TransferOutcome, TransferProgress};
pub use queue::{handler_fn, DeliveryHandler, OrderedDeliveryQueue};
pub use signal::{ClientSignal, RelaySignal};
