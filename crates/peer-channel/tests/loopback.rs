use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use peer_channel::{
    ChannelError, ChannelState, ClientSignal, Payload, PeerChannel, PeerChannelConfig, PeerEvent,
    PeerEvents,
};
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

async fn attach(vnet: &Arc<Net>, router: &Arc<Mutex<Router>>) {
    let nic = vnet.get_nic().expect("vnet nic");
    router
        .lock()
        .await
        .add_net(Arc::clone(&nic))
        .await
        .expect("attach nic");
    nic.lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .expect("set router");
}

fn api_for(vnet: Arc<Net>) -> API {
    let mut setting = SettingEngine::default();
    setting.set_vnet(Some(vnet));
    setting.set_ice_timeouts(
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_millis(200)),
    );
    APIBuilder::new().with_setting_engine(setting).build()
}

/// Two APIs on a private virtual LAN so the test never touches host networking.
async fn vnet_apis() -> (API, API, Arc<Mutex<Router>>) {
    let wan = Arc::new(Mutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .expect("router"),
    ));
    let offer_net = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.2".to_owned()],
        ..Default::default()
    })));
    attach(&offer_net, &wan).await;
    let answer_net = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec!["10.0.0.3".to_owned()],
        ..Default::default()
    })));
    attach(&answer_net, &wan).await;
    wan.lock().await.start().await.expect("router start");
    (api_for(offer_net), api_for(answer_net), wan)
}

/// Forwards negotiation events to `remote` through their JSON envelopes, the
/// same path a relay would carry them, and passes everything else on.
fn forward(
    mut events: PeerEvents,
    remote: Arc<PeerChannel>,
) -> mpsc::UnboundedReceiver<PeerEvent> {
    let (observed_tx, observed_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(signal) = ClientSignal::from_event(&event) else {
                let _ = observed_tx.send(event);
                continue;
            };
            let wire = signal.to_json().expect("encode signal");
            let _ = match serde_json::from_str::<ClientSignal>(&wire).expect("decode signal") {
                ClientSignal::Sdp { data } => remote.offer_remote_description(data).await,
                ClientSignal::Ice { data } => remote.add_remote_candidate(data).await,
                _ => Ok(()),
            };
        }
    });
    observed_rx
}

async fn wait_for<F>(observed: &mut mpsc::UnboundedReceiver<PeerEvent>, mut accept: F) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    loop {
        let event = timeout(EVENT_TIMEOUT, observed.recv())
            .await
            .expect("event before timeout")
            .expect("event stream open");
        if accept(&event) {
            return event;
        }
    }
}

struct Pair {
    offerer: Arc<PeerChannel>,
    answerer: Arc<PeerChannel>,
    offerer_events: mpsc::UnboundedReceiver<PeerEvent>,
    answerer_events: mpsc::UnboundedReceiver<PeerEvent>,
    _router: Arc<Mutex<Router>>,
}

async fn connected_pair(block_size: usize) -> Pair {
    let (offer_api, answer_api, router) = vnet_apis().await;
    let (offerer, offerer_raw) = PeerChannel::with_api(
        &offer_api,
        PeerChannelConfig::initiator()
            .localhost()
            .with_block_size(block_size),
    )
    .await
    .expect("offerer");
    let (answerer, answerer_raw) =
        PeerChannel::with_api(
            &answer_api,
            PeerChannelConfig::responder()
                .localhost()
                .with_block_size(block_size),
        )
        .await
        .expect("answerer");
    let offerer = Arc::new(offerer);
    let answerer = Arc::new(answerer);

    let mut offerer_events = forward(offerer_raw, answerer.clone());
    let mut answerer_events = forward(answerer_raw, offerer.clone());
    wait_for(&mut offerer_events, |event| matches!(event, PeerEvent::Opened)).await;
    wait_for(&mut answerer_events, |event| matches!(event, PeerEvent::Opened)).await;

    Pair {
        offerer,
        answerer,
        offerer_events,
        answerer_events,
        _router: router,
    }
}

#[test_timeout::timeout(60)]
async fn binary_payload_arrives_bit_identical() {
    let mut pair = connected_pair(32_768).await;

    let mut data = vec![0u8; 100_000];
    rand::thread_rng().fill_bytes(&mut data);
    pair.offerer
        .send(Payload::Binary(Bytes::from(data.clone())))
        .await
        .expect("send");

    let PeerEvent::Received(delivery) =
        wait_for(&mut pair.answerer_events, |event| matches!(event, PeerEvent::Received(_))).await
    else {
        unreachable!()
    };
    assert_eq!(delivery.info.size, 100_000);
    assert_eq!(delivery.payload, Payload::Binary(Bytes::from(data)));
    assert_eq!(pair.answerer.received_buffer_size(), 0);

    pair.offerer.dispose().await;
    pair.answerer.dispose().await;
}

#[test_timeout::timeout(60)]
async fn payloads_arrive_in_send_order_both_ways() {
    let mut pair = connected_pair(1_024).await;

    for index in 0..3 {
        timeout(
            EVENT_TIMEOUT,
            pair.answerer
                .send(Payload::Text(format!("reply {index} {}", "✓".repeat(600)))),
        )
        .await
        .expect("answerer send completes")
        .expect("answerer send");
    }
    for index in 0..3 {
        let PeerEvent::Received(delivery) =
            wait_for(&mut pair.offerer_events, |event| matches!(event, PeerEvent::Received(_)))
                .await
        else {
            unreachable!()
        };
        let Payload::Text(text) = delivery.payload else {
            panic!("expected text payload");
        };
        assert!(text.starts_with(&format!("reply {index} ")));
    }

    pair.offerer.send(Payload::from("")).await.expect("empty send");
    let PeerEvent::Received(delivery) =
        wait_for(&mut pair.answerer_events, |event| matches!(event, PeerEvent::Received(_))).await
    else {
        unreachable!()
    };
    assert_eq!(delivery.payload, Payload::Text(String::new()));

    pair.offerer.dispose().await;
    pair.answerer.dispose().await;
}

#[test_timeout::timeout(60)]
async fn responder_streams_more_than_one_burst() {
    let mut pair = connected_pair(1_024).await;

    let mut data = vec![0u8; 40 * 1_024 + 17];
    rand::thread_rng().fill_bytes(&mut data);
    timeout(
        EVENT_TIMEOUT,
        pair.answerer.send(Payload::Binary(Bytes::from(data.clone()))),
    )
    .await
    .expect("send completes")
    .expect("send");

    let PeerEvent::Received(delivery) =
        wait_for(&mut pair.offerer_events, |event| matches!(event, PeerEvent::Received(_))).await
    else {
        unreachable!()
    };
    assert_eq!(delivery.payload, Payload::Binary(Bytes::from(data)));

    pair.offerer.dispose().await;
    pair.answerer.dispose().await;
}

#[test_timeout::timeout(60)]
async fn remote_teardown_disposes_the_survivor() {
    let mut pair = connected_pair(32_768).await;

    pair.offerer.dispose().await;
    wait_for(&mut pair.offerer_events, |event| matches!(event, PeerEvent::Disposed)).await;
    assert!(matches!(
        pair.offerer.send(Payload::from("late")).await,
        Err(ChannelError::NotReady)
    ));

    wait_for(&mut pair.answerer_events, |event| matches!(event, PeerEvent::Disposed)).await;
    assert_eq!(pair.answerer.state(), ChannelState::Disposed);
}
