use std::collections::HashMap;
use std::time::Instant;

use metrics::{counter, gauge};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::codes::{self, CodeGenerator, RandomCodes};
use crate::config::RelayConfig;
use crate::counter::TransferCounter;
use crate::peer::{PeerId, PeerSocket, RelayPeer, Role};
use crate::pool::{InitPolicy, PairedPolicy, PeerPool, WaitingPolicy};
use crate::protocol::{
    self, Inbound, ProtocolViolation, ServerMessage, STATUS_NOT_FOUND, STATUS_PAIRED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Init,
    Waiting,
    Paired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub peers: usize,
    pub init: usize,
    pub waiting: usize,
    pub paired: usize,
    pub transfers: u64,
}

/// Pairing state for every live signaling socket.
///
/// All mutation happens through `&mut self`; the actor in `actor.rs` owns the
/// only instance in a running server.
pub struct RelayState {
    config: RelayConfig,
    peers: HashMap<PeerId, RelayPeer>,
    init: PeerPool<PeerId>,
    waiting: PeerPool<String>,
    paired: PeerPool<PeerId>,
    codes: Box<dyn CodeGenerator>,
    counter: TransferCounter,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            init: PeerPool::new("init", config.init, Box::new(InitPolicy)),
            waiting: PeerPool::new("waiting", config.waiting, Box::new(WaitingPolicy)),
            paired: PeerPool::new("paired", config.paired, Box::new(PairedPolicy)),
            config,
            peers: HashMap::new(),
            codes: Box::new(RandomCodes::new()),
            counter: TransferCounter::in_memory(),
        }
    }

    pub fn with_code_generator(mut self, codes: Box<dyn CodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    pub fn with_counter(mut self, counter: TransferCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn peer(&self, id: PeerId) -> Option<&RelayPeer> {
        self.peers.get(&id)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            peers: self.peers.len(),
            init: self.init.len(),
            waiting: self.waiting.len(),
            paired: self.paired.len(),
            transfers: self.counter.get(),
        }
    }

    pub fn on_open(&mut self, id: PeerId, socket: PeerSocket, now: Instant) {
        self.peers.insert(id, RelayPeer::new(id, socket));
        counter!("fastsend_relay_connections_total").increment(1);
        debug!(peer_id = %id, "signaling socket opened");
        let evicted = self.init.insert(id, id, now);
        self.apply_evictions(PoolKind::Init, evicted);
        self.record_pool_gauges();
    }

    pub fn on_text(&mut self, id: PeerId, text: &str, now: Instant) {
        if !self.peers.contains_key(&id) {
            trace!(peer_id = %id, "message for disposed peer ignored");
            return;
        }
        match protocol::classify(text) {
            Ok(Inbound::Send) => self.init_send(id, now),
            Ok(Inbound::Receive { code }) => self.init_receive(id, &code, now),
            Ok(Inbound::Relay) => self.relay(id, text),
            Err(violation) => self.violation(id, violation),
        }
    }

    pub fn on_binary(&mut self, id: PeerId, data: Vec<u8>, now: Instant) {
        match String::from_utf8(data) {
            Ok(text) => self.on_text(id, &text, now),
            Err(_) => self.violation(id, ProtocolViolation::NotUtf8),
        }
    }

    pub fn on_close(&mut self, id: PeerId) {
        if self.peers.contains_key(&id) {
            debug!(peer_id = %id, "signaling socket closed");
            self.dispose(id);
        }
    }

    pub fn on_error(&mut self, id: PeerId, error: &str) {
        if self.peers.contains_key(&id) {
            warn!(peer_id = %id, error, "signaling socket error");
            self.dispose(id);
        }
    }

    /// Expires pool entries whose TTL has passed. Returns how many were evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let init = self.init.expire(now);
        let waiting = self.waiting.expire(now);
        let paired = self.paired.expire(now);
        let evicted = init.len() + waiting.len() + paired.len();
        self.apply_evictions(PoolKind::Init, init);
        self.apply_evictions(PoolKind::Waiting, waiting);
        self.apply_evictions(PoolKind::Paired, paired);
        if evicted > 0 {
            debug!(evicted, "pool sweep");
            self.record_pool_gauges();
        }
        evicted
    }

    /// Closes `id` and, transitively, its partner. Each peer is torn down once.
    pub fn dispose(&mut self, id: PeerId) {
        let mut next = Some(id);
        while let Some(current) = next.take() {
            let Some(peer) = self.peers.remove(&current) else {
                break;
            };
            self.init.remove(&current);
            self.paired.remove(&current);
            if let Some(code) = &peer.pairing_code {
                self.waiting.remove_if_owned(code, current);
            }
            peer.close();
            counter!("fastsend_relay_connections_closed_total").increment(1);
            debug!(peer_id = %current, role = peer.role.as_str(), "peer disposed");

            next = peer
                .pair()
                .filter(|pair| self.peers.get(pair).is_some_and(RelayPeer::is_open));
        }
        self.record_pool_gauges();
    }

    fn init_send(&mut self, id: PeerId, now: Instant) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        if peer.role != Role::Unset {
            trace!(peer_id = %id, role = peer.role.as_str(), "repeated send ignored");
            return;
        }

        let waiting = &self.waiting;
        let allocated = codes::allocate(self.codes.as_mut(), self.config.code_attempts, |code| {
            waiting.contains_key(&code.to_string())
        });
        let Some(code) = allocated else {
            warn!(
                peer_id = %id,
                attempts = self.config.code_attempts,
                waiting = self.waiting.len(),
                "no free pairing code"
            );
            counter!("fastsend_relay_code_exhausted_total").increment(1);
            peer.send(&ServerMessage::code_exhausted());
            return;
        };

        let evicted = self.waiting.insert(code.clone(), id, now);
        self.init.remove(&id);
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.role = Role::Sender;
            peer.pairing_code = Some(code.clone());
            peer.send(&ServerMessage::Code { code: code.clone() });
        }
        counter!("fastsend_relay_codes_issued_total").increment(1);
        info!(peer_id = %id, code = %code, "pairing code issued");

        self.apply_evictions(PoolKind::Waiting, evicted);
        self.record_pool_gauges();
    }

    fn init_receive(&mut self, id: PeerId, code: &str, now: Instant) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        if peer.is_paired() {
            trace!(peer_id = %id, "receive from paired peer ignored");
            return;
        }

        let code_key = code.to_string();
        let target = self.waiting.get(&code_key).filter(|target| {
            *target != id
                && self
                    .peers
                    .get(target)
                    .is_some_and(|sender| !sender.is_paired() && sender.is_open())
        });
        let Some(target) = target else {
            info!(peer_id = %id, code, "pairing code not found");
            counter!("fastsend_relay_pairings_total", "outcome" => "not_found").increment(1);
            peer.send(&ServerMessage::Status {
                code: STATUS_NOT_FOUND,
            });
            self.dispose(id);
            return;
        };

        self.waiting.remove(&code_key);
        let own_code = peer.pairing_code.clone();
        if let Some(own_code) = own_code {
            self.waiting.remove_if_owned(&own_code, id);
        }
        self.init.remove(&id);
        self.init.remove(&target);

        if let Some(receiver) = self.peers.get_mut(&id) {
            if receiver.role == Role::Unset {
                receiver.role = Role::Receiver;
            }
            receiver.link(target);
            receiver.send(&ServerMessage::Status {
                code: STATUS_PAIRED,
            });
        }
        if let Some(sender) = self.peers.get_mut(&target) {
            sender.link(id);
        }

        let mut evicted = self.paired.insert(id, id, now);
        evicted.extend(self.paired.insert(target, target, now));

        let transfers = self.counter.increment();
        counter!("fastsend_relay_pairings_total", "outcome" => "paired").increment(1);
        info!(receiver = %id, sender = %target, code, transfers, "peers paired");

        self.apply_evictions(PoolKind::Paired, evicted);
        self.record_pool_gauges();
    }

    fn relay(&mut self, id: PeerId, text: &str) {
        let partner = self
            .peers
            .get(&id)
            .and_then(RelayPeer::pair)
            .and_then(|pair| self.peers.get(&pair));
        match partner {
            Some(partner) => {
                partner.send_text(text.to_string());
                counter!("fastsend_relay_messages_relayed_total").increment(1);
                counter!("fastsend_relay_bytes_relayed_total").increment(text.len() as u64);
                trace!(from = %id, to = %partner.id, bytes = text.len(), "relayed message");
            }
            None => self.violation(id, ProtocolViolation::Unpaired),
        }
    }

    fn violation(&mut self, id: PeerId, violation: ProtocolViolation) {
        warn!(
            peer_id = %id,
            reason = violation.metric_label(),
            error = %violation,
            "protocol violation; closing socket"
        );
        counter!(
            "fastsend_relay_protocol_violations_total",
            "reason" => violation.metric_label()
        )
        .increment(1);
        self.dispose(id);
    }

    fn apply_evictions(&mut self, pool: PoolKind, evicted: Vec<PeerId>) {
        for peer_id in evicted {
            let close = match self.peers.get(&peer_id) {
                Some(peer) => self.policy_closes(pool, peer),
                None => continue,
            };
            let pool_name = self.pool_name(pool);
            debug!(peer_id = %peer_id, pool = pool_name, close, "pool entry evicted");
            counter!(
                "fastsend_relay_evictions_total",
                "pool" => pool_name,
                "closed" => if close { "true" } else { "false" }
            )
            .increment(1);
            if close {
                self.dispose(peer_id);
            }
        }
    }

    fn policy_closes(&self, pool: PoolKind, peer: &RelayPeer) -> bool {
        match pool {
            PoolKind::Init => self.init.policy().should_close(peer),
            PoolKind::Waiting => self.waiting.policy().should_close(peer),
            PoolKind::Paired => self.paired.policy().should_close(peer),
        }
    }

    fn pool_name(&self, pool: PoolKind) -> &'static str {
        match pool {
            PoolKind::Init => self.init.name(),
            PoolKind::Waiting => self.waiting.name(),
            PoolKind::Paired => self.paired.name(),
        }
    }

    fn record_pool_gauges(&self) {
        let pools = [
            (self.init.name(), self.init.len()),
            (self.waiting.name(), self.waiting.len()),
            (self.paired.name(), self.paired.len()),
        ];
        for (pool, entries) in pools {
            gauge!("fastsend_relay_pool_entries", "pool" => pool).set(entries as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::peer::{generate_peer_id, Outbound};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FixedCodes(&'static str);

    impl CodeGenerator for FixedCodes {
        fn generate(&mut self) -> String {
            self.0.to_string()
        }
    }

    struct Client {
        id: PeerId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<Outbound> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }

        fn texts(&mut self) -> Vec<serde_json::Value> {
            self.drain()
                .into_iter()
                .filter_map(|frame| match frame {
                    Outbound::Text(text) => serde_json::from_str(&text).ok(),
                    Outbound::Close => None,
                })
                .collect()
        }
    }

    fn connect(state: &mut RelayState, now: Instant) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = generate_peer_id();
        state.on_open(id, tx, now);
        Client { id, rx }
    }

    fn closes(frames: &[Outbound]) -> usize {
        frames
            .iter()
            .filter(|frame| **frame == Outbound::Close)
            .count()
    }

    fn issue_code(state: &mut RelayState, sender: &mut Client, now: Instant) -> String {
        state.on_text(sender.id, r#"{"type":"send"}"#, now);
        let replies = sender.texts();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["type"], "code");
        replies[0]["code"].as_str().unwrap().to_string()
    }

    fn pair(state: &mut RelayState, now: Instant) -> (Client, Client) {
        let mut sender = connect(state, now);
        let mut receiver = connect(state, now);
        let code = issue_code(state, &mut sender, now);
        state.on_text(
            receiver.id,
            &format!(r#"{{"type":"receive","code":"{code}"}}"#),
            now,
        );
        assert_eq!(receiver.texts(), vec![serde_json::json!({"type":"status","code":0})]);
        (sender, receiver)
    }

    #[test_timeout::timeout]
    fn issued_codes_are_unique_while_waiting() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut seen = HashSet::new();
        let mut senders = Vec::new();
        for _ in 0..500 {
            let mut sender = connect(&mut state, now);
            let code = issue_code(&mut state, &mut sender, now);
            assert!(codes::is_valid_code(&code));
            assert!(seen.insert(code), "code issued twice");
            senders.push(sender);
        }
        assert_eq!(state.stats().waiting, 500);
        assert_eq!(state.stats().init, 0);
    }

    #[test_timeout::timeout]
    fn receiver_pairs_with_waiting_sender() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let (sender, receiver) = pair(&mut state, now);

        let sender_peer = state.peer(sender.id).unwrap();
        let receiver_peer = state.peer(receiver.id).unwrap();
        assert_eq!(sender_peer.pair(), Some(receiver.id));
        assert_eq!(receiver_peer.pair(), Some(sender.id));
        assert_eq!(sender_peer.role, Role::Sender);
        assert_eq!(receiver_peer.role, Role::Receiver);

        let stats = state.stats();
        assert_eq!((stats.init, stats.waiting, stats.paired), (0, 0, 2));
        assert_eq!(stats.transfers, 1);
    }

    #[test_timeout::timeout]
    fn paired_messages_are_forwarded_verbatim() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let (mut sender, mut receiver) = pair(&mut state, now);

        let offer = r#"{"type":"sdp","data":{"type":"offer","sdp":"v=0"}}"#;
        state.on_text(sender.id, offer, now);
        assert_eq!(receiver.drain(), vec![Outbound::Text(offer.to_string())]);

        let candidate = r#"{"type":"ice","data":{"candidate":"c"}}"#;
        state.on_binary(receiver.id, candidate.as_bytes().to_vec(), now);
        assert_eq!(sender.drain(), vec![Outbound::Text(candidate.to_string())]);
    }

    #[test_timeout::timeout]
    fn repeated_send_is_ignored() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut sender = connect(&mut state, now);
        let code = issue_code(&mut state, &mut sender, now);
        state.on_text(sender.id, r#"{"type":"send"}"#, now);
        assert!(sender.drain().is_empty());
        assert_eq!(state.peer(sender.id).unwrap().pairing_code.as_deref(), Some(code.as_str()));
        assert_eq!(state.stats().waiting, 1);
    }

    #[test_timeout::timeout]
    fn exhausted_code_space_reports_error_and_keeps_socket() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig {
            code_attempts: 8,
            ..RelayConfig::default()
        })
        .with_code_generator(Box::new(FixedCodes("1234")));
        let mut first = connect(&mut state, now);
        assert_eq!(issue_code(&mut state, &mut first, now), "1234");

        let mut second = connect(&mut state, now);
        state.on_text(second.id, r#"{"type":"send"}"#, now);
        assert_eq!(
            second.texts(),
            vec![serde_json::json!({"type":"err","data":-1,"msg":"Init code fail"})]
        );
        let peer = state.peer(second.id).expect("socket stays open");
        assert_eq!(peer.role, Role::Unset);
        assert_eq!(state.stats().init, 1);
    }

    #[test_timeout::timeout]
    fn unknown_code_gets_404_and_close() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut receiver = connect(&mut state, now);
        state.on_text(receiver.id, r#"{"type":"receive","code":"0000"}"#, now);
        let frames = receiver.drain();
        assert_eq!(
            frames[0],
            Outbound::Text(r#"{"type":"status","code":404}"#.to_string())
        );
        assert_eq!(closes(&frames), 1);
        assert!(state.peer(receiver.id).is_none());
    }

    #[test_timeout::timeout]
    fn own_code_is_not_found() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut sender = connect(&mut state, now);
        let code = issue_code(&mut state, &mut sender, now);
        state.on_text(
            sender.id,
            &format!(r#"{{"type":"receive","code":"{code}"}}"#),
            now,
        );
        assert_eq!(closes(&sender.drain()), 1);
        assert_eq!(state.stats().waiting, 0);
    }

    #[test_timeout::timeout]
    fn taken_code_is_not_found_for_a_second_receiver() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut sender = connect(&mut state, now);
        let code = issue_code(&mut state, &mut sender, now);
        let first = connect(&mut state, now);
        let mut second = connect(&mut state, now);
        let join = format!(r#"{{"type":"receive","code":"{code}"}}"#);
        state.on_text(first.id, &join, now);
        state.on_text(second.id, &join, now);
        assert_eq!(
            second.drain()[0],
            Outbound::Text(r#"{"type":"status","code":404}"#.to_string())
        );
        assert_eq!(state.peer(sender.id).unwrap().pair(), Some(first.id));
    }

    #[test_timeout::timeout]
    fn violations_close_the_socket() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        for bad in [
            "not json".as_bytes().to_vec(),
            br#"{"type":"receive","code":"12"}"#.to_vec(),
            br#"{"type":"sdp"}"#.to_vec(),
            vec![0xff, 0xfe, 0xfd],
        ] {
            let mut client = connect(&mut state, now);
            state.on_binary(client.id, bad, now);
            assert_eq!(closes(&client.drain()), 1);
            assert!(state.peer(client.id).is_none());
        }
        assert_eq!(state.stats(), RelayStats::default());
    }

    #[test_timeout::timeout]
    fn closing_one_side_closes_both_once() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let (mut sender, mut receiver) = pair(&mut state, now);

        state.on_close(sender.id);
        state.on_close(receiver.id);
        state.on_error(sender.id, "late error");

        assert_eq!(closes(&sender.drain()), 1);
        assert_eq!(closes(&receiver.drain()), 1);
        let stats = state.stats();
        assert_eq!((stats.peers, stats.paired), (0, 0));
    }

    #[test_timeout::timeout]
    fn cascade_skips_partner_whose_socket_is_gone() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let (mut sender, receiver) = pair(&mut state, now);
        drop(receiver.rx);

        state.dispose(sender.id);
        assert_eq!(closes(&sender.drain()), 1);
        assert!(state.peer(receiver.id).is_some());
        state.on_close(receiver.id);
        assert_eq!(state.stats().peers, 0);
    }

    #[test_timeout::timeout]
    fn disposing_a_sender_frees_its_code() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut sender = connect(&mut state, now);
        let code = issue_code(&mut state, &mut sender, now);
        state.on_close(sender.id);

        let mut receiver = connect(&mut state, now);
        state.on_text(
            receiver.id,
            &format!(r#"{{"type":"receive","code":"{code}"}}"#),
            now,
        );
        assert_eq!(
            receiver.drain()[0],
            Outbound::Text(r#"{"type":"status","code":404}"#.to_string())
        );
    }

    #[test_timeout::timeout]
    fn idle_sockets_expire_from_init() {
        let start = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut idle = connect(&mut state, start);
        assert_eq!(state.sweep(start + Duration::from_secs(599)), 0);
        assert_eq!(state.sweep(start + Duration::from_secs(600)), 1);
        assert_eq!(closes(&idle.drain()), 1);
        assert!(state.peer(idle.id).is_none());
    }

    #[test_timeout::timeout]
    fn unjoined_senders_expire_from_waiting() {
        let start = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let mut sender = connect(&mut state, start);
        issue_code(&mut state, &mut sender, start + Duration::from_secs(60));
        state.sweep(start + Duration::from_secs(600));
        assert!(state.peer(sender.id).is_some());
        state.sweep(start + Duration::from_secs(660));
        assert_eq!(closes(&sender.drain()), 1);
        assert_eq!(state.stats().waiting, 0);
    }

    #[test_timeout::timeout]
    fn paired_lease_expiry_closes_both() {
        let start = Instant::now();
        let mut state = RelayState::new(RelayConfig::default());
        let (mut sender, mut receiver) = pair(&mut state, start);
        state.sweep(start + Duration::from_secs(30 * 60 - 1));
        assert_eq!(state.stats().paired, 2);
        state.sweep(start + Duration::from_secs(30 * 60));
        assert_eq!(closes(&sender.drain()), 1);
        assert_eq!(closes(&receiver.drain()), 1);
        assert_eq!(state.stats(), RelayStats { transfers: 1, ..RelayStats::default() });
    }

    #[test_timeout::timeout]
    fn init_capacity_evicts_oldest_unset_socket() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig {
            init: PoolSettings::new(2, Duration::from_secs(600)),
            ..RelayConfig::default()
        });
        let mut oldest = connect(&mut state, now);
        let _second = connect(&mut state, now + Duration::from_secs(1));
        let _third = connect(&mut state, now + Duration::from_secs(2));
        assert_eq!(closes(&oldest.drain()), 1);
        assert_eq!(state.stats().init, 2);
    }

    #[test_timeout::timeout]
    fn waiting_capacity_eviction_closes_unpaired_sender() {
        let now = Instant::now();
        let mut state = RelayState::new(RelayConfig {
            waiting: PoolSettings::new(1, Duration::from_secs(600)),
            ..RelayConfig::default()
        });
        let mut first = connect(&mut state, now);
        issue_code(&mut state, &mut first, now);
        let mut second = connect(&mut state, now);
        issue_code(&mut state, &mut second, now + Duration::from_secs(1));
        assert_eq!(closes(&first.drain()), 1);
        assert!(state.peer(second.id).is_some());
        assert_eq!(state.stats().waiting, 1);
    }
}
