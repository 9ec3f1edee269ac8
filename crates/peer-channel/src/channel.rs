use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::codec::{self, Payload, ReceiveSession, TransferHeader};
use crate::config::PeerChannelConfig;
use crate::error::ChannelError;
use crate::events::{PeerEvent, PeerEvents};
use crate::flow::{self, BlockSink};
use crate::progress::{NoProgress, ProgressSink, TransferOutcome};
use crate::queue::{DeliveryHandler, DeliverySender, OrderedDeliveryQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Negotiating,
    Connecting,
    Connected,
    Disposed,
}

/// One peer connection carrying a single ordered, reliable data channel.
///
/// Notifications arrive on the [`PeerEvents`] receiver returned by the
/// constructors. Dropping the channel without calling [`dispose`] tears it
/// down in the background.
///
/// [`dispose`]: PeerChannel::dispose
pub struct PeerChannel {
    inner: Arc<Inner>,
}

struct Inner {
    pc: Arc<RTCPeerConnection>,
    dc: Mutex<Option<Arc<RTCDataChannel>>>,
    state: Mutex<ChannelState>,
    events: mpsc::UnboundedSender<PeerEvent>,
    inbound: OrderedDeliveryQueue<Bytes>,
    buffered_low: Arc<Notify>,
    block_size: usize,
    sending: AtomicBool,
    disposed: watch::Sender<bool>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    received_bytes: Arc<AtomicUsize>,
}

impl PeerChannel {
    pub async fn new(config: PeerChannelConfig) -> Result<(Self, PeerEvents), ChannelError> {
        let api = APIBuilder::new().build();
        Self::with_api(&api, config).await
    }

    /// Builds the connection from a caller-supplied API, e.g. one bound to a
    /// virtual network.
    pub async fn with_api(
        api: &API,
        config: PeerChannelConfig,
    ) -> Result<(Self, PeerEvents), ChannelError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let received_bytes = Arc::new(AtomicUsize::new(0));
        let inbound = OrderedDeliveryQueue::spawn(ReceiveHandler {
            session: ReceiveSession::new(),
            events: events_tx.clone(),
            buffered: received_bytes.clone(),
        });
        let (disposed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            pc,
            dc: Mutex::new(None),
            state: Mutex::new(ChannelState::Negotiating),
            events: events_tx,
            inbound,
            buffered_low: Arc::new(Notify::new()),
            block_size: config.block_size.max(1),
            sending: AtomicBool::new(false),
            disposed,
            pending_candidates: Mutex::new(Vec::new()),
            received_bytes,
        });
        Inner::attach_connection_hooks(&inner);

        if config.create_data_channel_locally {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = match inner.pc.create_data_channel(&config.label, Some(init)).await {
                Ok(dc) => dc,
                Err(err) => {
                    inner.dispose().await;
                    return Err(err.into());
                }
            };
            Inner::attach_data_channel(&inner, dc).await;
        }

        debug!(
            block_size = inner.block_size,
            initiator = config.create_data_channel_locally,
            "peer channel created"
        );
        Ok((Self { inner }, events_rx))
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.pc.connection_state() == RTCPeerConnectionState::Connected
    }

    /// Bytes buffered for a partially received payload.
    pub fn received_buffer_size(&self) -> usize {
        self.inner.received_bytes.load(Ordering::Relaxed)
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Applies the remote offer or answer. An offer is answered and the answer
    /// is emitted as [`PeerEvent::SdpReady`]. Queued remote candidates are
    /// applied afterwards.
    pub async fn offer_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(ChannelError::Disposed);
        }
        let is_offer = description.sdp_type == RTCSdpType::Offer;
        debug!(sdp_type = %description.sdp_type, "applying remote description");

        if let Err(err) = inner.pc.set_remote_description(description).await {
            return Err(inner.fail_negotiation(err).await);
        }
        if is_offer {
            inner.begin_negotiation();
            match inner.answer().await {
                Ok(answer) => inner.emit(PeerEvent::SdpReady(answer)),
                Err(err) => return Err(inner.fail_negotiation(err).await),
            }
        }
        inner.flush_pending_candidates().await
    }

    /// Adds a remote ICE candidate. Candidates that arrive before any remote
    /// description are held until one is applied.
    pub async fn add_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(ChannelError::Disposed);
        }
        if inner.pc.remote_description().await.is_none() {
            trace!(candidate = %candidate.candidate, "queueing remote candidate");
            inner.pending_candidates.lock().push(candidate);
            if inner.pc.remote_description().await.is_some() {
                return inner.flush_pending_candidates().await;
            }
            return Ok(());
        }
        inner.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub async fn send(&self, payload: Payload) -> Result<(), ChannelError> {
        self.send_with_progress(payload, &NoProgress).await
    }

    /// Streams `payload` as a header followed by its blocks. Resolves once the
    /// last block has been handed to the data channel.
    pub async fn send_with_progress(
        &self,
        payload: Payload,
        progress: &dyn ProgressSink,
    ) -> Result<(), ChannelError> {
        let dc = self.inner.open_data_channel()?;
        let _guard = SendGuard::acquire(&self.inner.sending)?;
        let mut disposed = self.inner.disposed.subscribe();

        let plan = codec::split(&payload, self.inner.block_size)?;
        debug!(
            blocks = plan.header.count,
            kind = ?plan.header.kind,
            bytes = plan.total_bytes,
            "sending payload"
        );
        let sink = DataChannelSink {
            dc,
            low: self.inner.buffered_low.clone(),
        };
        let result =
            flow::pump_until_disposed(&sink, plan, self.inner.block_size, progress, &mut disposed)
                .await;
        match &result {
            Ok(()) => progress.on_outcome(TransferOutcome::Completed),
            Err(err) => {
                debug!(error = %err, "send aborted");
                progress.on_outcome(TransferOutcome::Failed);
            }
        }
        result
    }

    /// Tears down the data channel and connection. Safe to call repeatedly;
    /// [`PeerEvent::Disposed`] is emitted once.
    pub async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        if self.inner.is_disposed() {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move { inner.dispose().await });
        }
    }
}

impl Inner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn is_disposed(&self) -> bool {
        *self.state.lock() == ChannelState::Disposed
    }

    /// Returns false once disposed; disposal is terminal.
    fn transition(&self, next: ChannelState) -> bool {
        let mut state = self.state.lock();
        if *state == ChannelState::Disposed {
            return false;
        }
        *state = next;
        true
    }

    /// Marks a new offer/answer round. A live connection keeps reporting
    /// `Connected` because no fresh connected event follows renegotiation.
    fn begin_negotiation(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Disposed => false,
            ChannelState::Connected => true,
            ChannelState::Negotiating | ChannelState::Connecting => {
                *state = ChannelState::Negotiating;
                true
            }
        }
    }

    fn open_data_channel(&self) -> Result<Arc<RTCDataChannel>, ChannelError> {
        match self.dc.lock().as_ref() {
            Some(dc) if dc.ready_state() == RTCDataChannelState::Open => Ok(dc.clone()),
            _ => Err(ChannelError::NotReady),
        }
    }

    fn attach_connection_hooks(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        inner
            .pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let (Some(inner), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => inner.emit(PeerEvent::IceCandidate(init)),
                        Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                    }
                })
            }));

        let weak = Arc::downgrade(inner);
        inner
            .pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_connection_state(state);
                    }
                })
            }));

        let weak = Arc::downgrade(inner);
        inner
            .pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        debug!(label = dc.label(), "adopting remote data channel");
                        Inner::attach_data_channel(&inner, dc).await;
                    }
                })
            }));

        let weak = Arc::downgrade(inner);
        inner.pc.on_negotiation_needed(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.renegotiate().await;
                }
            })
        }));
    }

    async fn attach_data_channel(inner: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        if inner.is_disposed() {
            let _ = dc.close().await;
            return;
        }

        dc.set_buffered_amount_low_threshold(0).await;
        hook_buffered_low(&dc, inner.buffered_low.clone()).await;

        let inbound: DeliverySender<Bytes> = inner.inbound.sender();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let inbound = inbound.clone();
            Box::pin(async move {
                if inbound.enqueue(message.data).is_err() {
                    trace!("dropping inbound message after dispose");
                }
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(inner);
        let opened_dc = Arc::downgrade(&dc);
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let opened_dc = opened_dc.clone();
            Box::pin(async move {
                if let (Some(inner), Some(dc)) = (weak.upgrade(), opened_dc.upgrade()) {
                    // A channel adopted from the remote side only wires the
                    // buffered-low hook into its stream once open.
                    hook_buffered_low(&dc, inner.buffered_low.clone()).await;
                    info!("data channel open");
                    inner.emit(PeerEvent::Opened);
                }
            })
        }));

        *inner.dc.lock() = Some(dc);
    }

    fn handle_connection_state(self: &Arc<Self>, state: RTCPeerConnectionState) {
        debug!(?state, "peer connection state changed");
        match state {
            RTCPeerConnectionState::Connecting => {
                self.transition(ChannelState::Connecting);
            }
            RTCPeerConnectionState::Connected => {
                if self.transition(ChannelState::Connected) {
                    self.emit(PeerEvent::Connected);
                }
            }
            RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed => {
                // Closing the connection from inside its own callback can stall
                // the ICE agent; tear down from a separate task.
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.dispose().await });
            }
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {}
        }
    }

    async fn renegotiate(&self) {
        if !self.begin_negotiation() {
            return;
        }
        debug!("negotiation needed; creating offer");
        match self.offer().await {
            Ok(offer) => self.emit(PeerEvent::SdpReady(offer)),
            Err(err) => {
                self.fail_negotiation(err).await;
            }
        }
    }

    async fn offer(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(self.pc.local_description().await.unwrap_or(offer))
    }

    async fn answer(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(self.pc.local_description().await.unwrap_or(answer))
    }

    async fn fail_negotiation(&self, err: webrtc::Error) -> ChannelError {
        warn!(error = %err, "negotiation failed");
        self.emit(PeerEvent::Error(ChannelError::Negotiation(err.to_string())));
        self.dispose().await;
        ChannelError::Negotiation(err.to_string())
    }

    async fn flush_pending_candidates(&self) -> Result<(), ChannelError> {
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "applying queued remote candidates");
        let mut first_error = None;
        for candidate in pending {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                warn!(error = %err, "failed to apply queued candidate");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Disposed {
                return;
            }
            *state = ChannelState::Disposed;
        }
        self.disposed.send_replace(true);
        self.inbound.shutdown();
        self.pending_candidates.lock().clear();

        let dc = self.dc.lock().take();
        if let Some(dc) = dc {
            dc.on_message(Box::new(|_| Box::pin(async {})));
            dc.on_open(Box::new(|| Box::pin(async {})));
            dc.on_buffered_amount_low(Box::new(|| Box::pin(async {})))
                .await;
            if let Err(err) = dc.close().await {
                debug!(error = %err, "data channel close failed");
            }
        }
        self.buffered_low.notify_waiters();

        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_data_channel(Box::new(|_| Box::pin(async {})));
        self.pc.on_negotiation_needed(Box::new(|| Box::pin(async {})));
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close failed");
        }

        info!("peer channel disposed");
        self.emit(PeerEvent::Disposed);
    }
}

async fn hook_buffered_low(dc: &RTCDataChannel, low: Arc<Notify>) {
    dc.on_buffered_amount_low(Box::new(move || {
        let low = low.clone();
        Box::pin(async move { low.notify_one() })
    }))
    .await;
}

/// Clears the in-flight flag when a send finishes or is dropped.
struct SendGuard<'a>(&'a AtomicBool);

impl<'a> SendGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ChannelError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SendGuard(flag))
            .map_err(|_| ChannelError::SendInProgress)
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct DataChannelSink {
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
}

#[async_trait]
impl BlockSink for DataChannelSink {
    async fn send_header(&self, header: &TransferHeader) -> Result<(), ChannelError> {
        self.dc.send_text(header.encode()).await?;
        Ok(())
    }

    async fn send_block(&self, block: Bytes) -> Result<(), ChannelError> {
        self.dc.send(&block).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_low_watermark(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn buffered_amount_low(&self) {
        self.low.notified().await;
    }
}

struct ReceiveHandler {
    session: ReceiveSession,
    events: mpsc::UnboundedSender<PeerEvent>,
    buffered: Arc<AtomicUsize>,
}

#[async_trait]
impl DeliveryHandler<Bytes> for ReceiveHandler {
    async fn handle(&mut self, message: Bytes) {
        match self.session.ingest(message, Instant::now()) {
            Ok(Some(delivery)) => {
                debug!(
                    size = delivery.info.size,
                    duration_ms = delivery.info.duration.as_millis() as u64,
                    "payload received"
                );
                let _ = self.events.send(PeerEvent::Received(delivery));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "discarding inbound message");
                let _ = self.events.send(PeerEvent::Error(err.into()));
            }
        }
        self.buffered
            .store(self.session.buffered_bytes(), Ordering::Relaxed);
    }
}
