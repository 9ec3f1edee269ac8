use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::config::PoolSettings;
use crate::peer::{PeerId, RelayPeer, Role};

struct Slot<V> {
    value: V,
    generation: u64,
}

/// Bounded map whose entries expire `ttl` after insertion.
///
/// Deadlines live in a min-heap; removals leave stale heap entries behind that
/// are skipped by generation when they surface.
pub struct ExpiringPool<K, V> {
    entries: HashMap<K, Slot<V>>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, K)>>,
    capacity: usize,
    ttl: Duration,
    next_generation: u64,
}

impl<K, V> ExpiringPool<K, V>
where
    K: Clone + Eq + Hash + Ord,
{
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
            capacity: settings.capacity.max(1),
            ttl: settings.ttl,
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Inserts or refreshes `key`. Returns entries pushed out to stay within
    /// capacity, oldest deadline first.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                match self.pop_earliest() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.deadlines
            .push(Reverse((now + self.ttl, generation, key.clone())));
        self.entries.insert(key, Slot { value, generation });
        self.compact();
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key).map(|slot| slot.value);
        self.compact();
        removed
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, _, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, generation, key))) = self.deadlines.pop() else {
                break;
            };
            if self.is_live(&key, generation) {
                if let Some(slot) = self.entries.remove(&key) {
                    expired.push((key, slot.value));
                }
            }
        }
        expired
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.deadlines.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    fn is_live(&self, key: &K, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|slot| slot.generation == generation)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, generation, key))) = self.deadlines.peek() {
            if self.is_live(key, *generation) {
                break;
            }
            self.deadlines.pop();
        }
    }

    fn pop_earliest(&mut self) -> Option<(K, V)> {
        while let Some(Reverse((_, generation, key))) = self.deadlines.pop() {
            if self.is_live(&key, generation) {
                let slot = self.entries.remove(&key)?;
                return Some((key, slot.value));
            }
        }
        None
    }

    fn compact(&mut self) {
        if self.deadlines.len() <= 2 * self.entries.len() + 64 {
            return;
        }
        let live: Vec<_> = self
            .deadlines
            .drain()
            .filter(|Reverse((_, generation, key))| {
                self.entries
                    .get(key)
                    .is_some_and(|slot| slot.generation == *generation)
            })
            .collect();
        self.deadlines = live.into();
    }
}

/// Decides whether a peer evicted from a pool has its socket closed.
pub trait EvictionPolicy: Send + Sync {
    fn should_close(&self, peer: &RelayPeer) -> bool;
}

/// Close sockets that never declared a role.
pub struct InitPolicy;

impl EvictionPolicy for InitPolicy {
    fn should_close(&self, peer: &RelayPeer) -> bool {
        peer.role == Role::Unset
    }
}

/// Close senders nobody joined.
pub struct WaitingPolicy;

impl EvictionPolicy for WaitingPolicy {
    fn should_close(&self, peer: &RelayPeer) -> bool {
        !peer.is_paired()
    }
}

/// Paired peers are closed unconditionally once their lease runs out.
pub struct PairedPolicy;

impl EvictionPolicy for PairedPolicy {
    fn should_close(&self, _peer: &RelayPeer) -> bool {
        true
    }
}

/// An [`ExpiringPool`] of peer ids plus the policy applied to its evictions.
pub struct PeerPool<K> {
    name: &'static str,
    entries: ExpiringPool<K, PeerId>,
    policy: Box<dyn EvictionPolicy>,
}

impl<K> PeerPool<K>
where
    K: Clone + Eq + Hash + Ord,
{
    pub fn new(name: &'static str, settings: PoolSettings, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            name,
            entries: ExpiringPool::new(settings),
            policy,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<PeerId> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: K, peer: PeerId, now: Instant) -> Vec<PeerId> {
        self.entries
            .insert(key, peer, now)
            .into_iter()
            .map(|(_, peer)| peer)
            .collect()
    }

    pub fn remove(&mut self, key: &K) -> Option<PeerId> {
        self.entries.remove(key)
    }

    /// Removes `key` only while it still maps to `peer`.
    pub fn remove_if_owned(&mut self, key: &K, peer: PeerId) -> bool {
        if self.get(key) == Some(peer) {
            self.entries.remove(key);
            return true;
        }
        false
    }

    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        self.entries
            .expire(now)
            .into_iter()
            .map(|(_, peer)| peer)
            .collect()
    }
}
