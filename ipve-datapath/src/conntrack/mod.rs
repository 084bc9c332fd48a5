//! Connection tracking.
//!
//! Four partitions: TCP and everything else, per address family. Each
//! partition is a capacity-bounded hash table split into shards with a short
//! lock per operation. A create on a full shard evicts an approximately least
//! recently used entry picked from a small random sample. Inserting a key that
//! already exists overwrites it. Concurrent operations on the same tuple are
//! resolved by whichever write lands last.

mod cleaner;

pub use cleaner::{CLEANUP_INTERVAL_SECS, ConnTrackCleaner};

use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash, RandomState};
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

#[cfg(feature = "ipv4")]
use std::net::Ipv4Addr;

use ipve_common::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{DropReason, Result};
use crate::tuple::CtTuple;

const MAX_SHARDS: usize = 16;
const EVICTION_SAMPLES: usize = 8;

/// Outcome of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtStatus {
    New,
    Established,
    Reply,
    Related,
}

impl CtStatus {
    pub const fn code(self) -> u8 {
        match self {
            CtStatus::New => CT_NEW,
            CtStatus::Established => CT_ESTABLISHED,
            CtStatus::Reply => CT_REPLY,
            CtStatus::Related => CT_RELATED,
        }
    }

    /// Reply and related packets bypass policy.
    pub const fn is_reply(self) -> bool {
        matches!(self, CtStatus::Reply | CtStatus::Related)
    }
}

impl TryFrom<u8> for CtStatus {
    type Error = DropReason;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            CT_NEW => Ok(CtStatus::New),
            CT_ESTABLISHED => Ok(CtStatus::Established),
            CT_REPLY => Ok(CtStatus::Reply),
            CT_RELATED => Ok(CtStatus::Related),
            _ => Err(DropReason::UnknownConnTrackState),
        }
    }
}

impl fmt::Display for CtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CtStatus::New => "new",
            CtStatus::Established => "established",
            CtStatus::Reply => "reply",
            CtStatus::Related => "related",
        };
        f.write_str(s)
    }
}

/// State recorded when a connection is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtState {
    pub rev_nat_index: u16,
    pub src_sec_id: u32,
    pub orig_dport: u16,
    pub loopback: bool,
}

/// Stored connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtEntry {
    pub rev_nat_index: u16,
    pub src_sec_id: u32,
    pub orig_dport: u16,
    pub loopback: bool,
    /// Expiry time in clock seconds.
    pub lifetime: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_closing: bool,
    pub rx_closing: bool,
    pub seen_non_syn: bool,
    last_used: u64,
}

impl CtEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.lifetime <= now
    }
}

/// Result of [`CtMaps::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtLookup {
    pub status: CtStatus,
    pub rev_nat_index: u16,
    pub orig_dport: u16,
    pub src_sec_id: u32,
    pub loopback: bool,
    /// Capture length hint for trace events.
    pub monitor: u32,
}

impl CtLookup {
    fn new_flow() -> Self {
        Self {
            status: CtStatus::New,
            rev_nat_index: 0,
            orig_dport: 0,
            src_sec_id: 0,
            loopback: false,
            monitor: TRACE_PAYLOAD_LEN,
        }
    }

    fn from_entry(status: CtStatus, entry: &CtEntry, monitor: u32) -> Self {
        Self {
            status,
            rev_nat_index: entry.rev_nat_index,
            orig_dport: entry.orig_dport,
            src_sec_id: entry.src_sec_id,
            loopback: entry.loopback,
            monitor,
        }
    }
}

/// Packet attributes that update an entry on a hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtObservation {
    pub bytes: u64,
    pub tcp_flags: u8,
}

/// Table sizes and lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtConfig {
    pub tcp_capacity: usize,
    pub any_capacity: usize,
    /// Seconds an idle TCP connection is kept.
    pub tcp_lifetime: u64,
    /// Seconds an idle non-TCP flow is kept.
    pub nontcp_lifetime: u64,
    /// Seconds a TCP connection is kept after FIN or RST.
    pub close_timeout: u64,
}

impl Default for CtConfig {
    fn default() -> Self {
        Self {
            tcp_capacity: CT_MAP_SIZE_TCP as usize,
            any_capacity: CT_MAP_SIZE_ANY as usize,
            tcp_lifetime: CT_CONNECTION_LIFETIME_TCP as u64,
            nontcp_lifetime: CT_CONNECTION_LIFETIME_NONTCP as u64,
            close_timeout: CT_CLOSE_TIMEOUT as u64,
        }
    }
}

/// Time source for entry lifetimes.
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary fixed point.
    fn now(&self) -> u64;
}

/// Monotonic clock starting at process start.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_secs()
    }
}

type Shard<A> = Mutex<HashMap<CtTuple<A>, CtEntry>>;

/// One capacity-bounded partition.
pub struct CtMap<A> {
    name: &'static str,
    shards: Box<[Shard<A>]>,
    shard_capacity: usize,
    hasher: RandomState,
    evictions: AtomicU64,
}

impl<A: Copy + Eq + Hash> CtMap<A> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let nshards = capacity.min(MAX_SHARDS);
        let shards = (0..nshards)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            name,
            shards,
            shard_capacity: capacity.div_ceil(nshards),
            hasher: RandomState::new(),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Upper bound on the number of entries.
    pub fn capacity(&self) -> usize {
        self.shard_capacity * self.shards.len()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn shard(&self, tuple: &CtTuple<A>) -> MutexGuard<'_, HashMap<CtTuple<A>, CtEntry>> {
        let idx = self.hasher.hash_one(tuple) as usize % self.shards.len();
        lock(&self.shards[idx])
    }

    pub fn get(&self, tuple: &CtTuple<A>) -> Option<CtEntry> {
        self.shard(tuple).get(tuple).copied()
    }

    pub fn contains(&self, tuple: &CtTuple<A>) -> bool {
        self.shard(tuple).contains_key(tuple)
    }

    /// Apply `f` to the entry for `tuple`, if present.
    fn update<R>(&self, tuple: &CtTuple<A>, f: impl FnOnce(&mut CtEntry) -> R) -> Option<R> {
        self.shard(tuple).get_mut(tuple).map(f)
    }

    /// Insert or overwrite.
    pub fn insert(&self, tuple: CtTuple<A>, entry: CtEntry) {
        let mut shard = self.shard(&tuple);
        if shard.len() >= self.shard_capacity && !shard.contains_key(&tuple) {
            if let Some(victim) = pick_victim(&shard) {
                shard.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        shard.insert(tuple, entry);
    }

    /// Remove `tuple`; returns whether it was present.
    pub fn remove(&self, tuple: &CtTuple<A>) -> bool {
        self.shard(tuple).remove(tuple).is_some()
    }

    /// Drop every entry whose lifetime ended at or before `now`.
    pub fn gc(&self, now: u64) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let before = shard.len();
            shard.retain(|_, entry| !entry.is_expired(now));
            removed += before - shard.len();
        }
        removed
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            lock(shard).clear();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Oldest entry among a few sampled from a random position.
fn pick_victim<A: Copy>(shard: &HashMap<CtTuple<A>, CtEntry>) -> Option<CtTuple<A>> {
    if shard.is_empty() {
        return None;
    }
    let start = rand::thread_rng().gen_range(0..shard.len());
    shard
        .iter()
        .cycle()
        .skip(start)
        .take(EVICTION_SAMPLES.min(shard.len()))
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(tuple, _)| *tuple)
}

/// Address types that have connection tracking partitions.
pub trait CtAddress: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    fn partition(maps: &CtMaps, nexthdr: u8) -> &CtMap<Self>;
}

impl CtAddress for Ipv6Addr {
    fn partition(maps: &CtMaps, nexthdr: u8) -> &CtMap<Self> {
        if nexthdr == IPPROTO_TCP {
            &maps.tcp6
        } else {
            &maps.any6
        }
    }
}

#[cfg(feature = "ipv4")]
impl CtAddress for Ipv4Addr {
    fn partition(maps: &CtMaps, nexthdr: u8) -> &CtMap<Self> {
        if nexthdr == IPPROTO_TCP {
            &maps.tcp4
        } else {
            &maps.any4
        }
    }
}

/// All connection tracking partitions of a node.
pub struct CtMaps {
    tcp6: CtMap<Ipv6Addr>,
    any6: CtMap<Ipv6Addr>,
    #[cfg(feature = "ipv4")]
    tcp4: CtMap<Ipv4Addr>,
    #[cfg(feature = "ipv4")]
    any4: CtMap<Ipv4Addr>,
    config: CtConfig,
    clock: Arc<dyn Clock>,
}

impl CtMaps {
    pub fn new(config: CtConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    pub fn with_clock(config: CtConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            tcp6: CtMap::new("ct6_tcp", config.tcp_capacity),
            any6: CtMap::new("ct6_any", config.any_capacity),
            #[cfg(feature = "ipv4")]
            tcp4: CtMap::new("ct4_tcp", config.tcp_capacity),
            #[cfg(feature = "ipv4")]
            any4: CtMap::new("ct4_any", config.any_capacity),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CtConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Partition holding flows of protocol `nexthdr`.
    pub fn map<A: CtAddress>(&self, nexthdr: u8) -> &CtMap<A> {
        A::partition(self, nexthdr)
    }

    fn lifetime(&self, nexthdr: u8) -> u64 {
        if nexthdr == IPPROTO_TCP {
            self.config.tcp_lifetime
        } else {
            self.config.nontcp_lifetime
        }
    }

    /// Classify a packet and refresh the entry it hit.
    ///
    /// The exact tuple means the flow was created in this direction, the
    /// reverse tuple means this is a reply. For ICMP errors `related` is the
    /// quoted flow; a hit there makes the packet related.
    pub fn lookup<A: CtAddress>(
        &self,
        tuple: &CtTuple<A>,
        related: Option<&CtTuple<A>>,
        obs: &CtObservation,
    ) -> Result<CtLookup> {
        let now = self.now();
        let map = self.map::<A>(tuple.nexthdr);

        if let Some(hit) = map.update(tuple, |e| {
            self.refresh(e, CtStatus::Established, tuple.nexthdr, obs, now)
        }) {
            return Ok(hit);
        }

        if let Some(hit) = map.update(&tuple.reverse(), |e| {
            self.refresh(e, CtStatus::Reply, tuple.nexthdr, obs, now)
        }) {
            return Ok(hit);
        }

        if let Some(inner) = related {
            let inner_map = self.map::<A>(inner.nexthdr);
            if let Some(entry) = inner_map.get(inner) {
                trace!(map = inner_map.name(), "related flow found");
                return Ok(CtLookup::from_entry(CtStatus::Related, &entry, 0));
            }
        }

        Ok(CtLookup::new_flow())
    }

    fn refresh(
        &self,
        entry: &mut CtEntry,
        status: CtStatus,
        nexthdr: u8,
        obs: &CtObservation,
        now: u64,
    ) -> CtLookup {
        let reply = status == CtStatus::Reply;
        let was_closing = entry.tx_closing || entry.rx_closing;
        if reply {
            entry.rx_packets += 1;
            entry.rx_bytes += obs.bytes;
        } else {
            entry.tx_packets += 1;
            entry.tx_bytes += obs.bytes;
        }

        if nexthdr == IPPROTO_TCP {
            if obs.tcp_flags & (TCP_FLAG_FIN | TCP_FLAG_RST) != 0 {
                if reply {
                    entry.rx_closing = true;
                } else {
                    entry.tx_closing = true;
                }
            }
            if obs.tcp_flags & TCP_FLAG_SYN == 0 {
                entry.seen_non_syn = true;
            }
        }

        let closing = entry.tx_closing || entry.rx_closing;
        entry.lifetime = now
            + if closing {
                self.config.close_timeout
            } else {
                self.lifetime(nexthdr)
            };
        entry.last_used = now;

        let monitor = if closing && !was_closing {
            TRACE_PAYLOAD_LEN
        } else {
            0
        };
        CtLookup::from_entry(status, entry, monitor)
    }

    /// Record a new connection. An existing entry for the tuple is replaced.
    pub fn create<A: CtAddress>(&self, tuple: &CtTuple<A>, state: &CtState, obs: &CtObservation) {
        let now = self.now();
        let entry = CtEntry {
            rev_nat_index: state.rev_nat_index,
            src_sec_id: state.src_sec_id,
            orig_dport: state.orig_dport,
            loopback: state.loopback,
            lifetime: now + self.lifetime(tuple.nexthdr),
            tx_packets: 1,
            tx_bytes: obs.bytes,
            seen_non_syn: tuple.nexthdr == IPPROTO_TCP && obs.tcp_flags & TCP_FLAG_SYN == 0,
            last_used: now,
            ..Default::default()
        };
        let map = self.map::<A>(tuple.nexthdr);
        map.insert(*tuple, entry);
        debug!(
            map = map.name(),
            dir = ?tuple.direction(),
            rev_nat_index = state.rev_nat_index,
            "conntrack entry created"
        );
    }

    /// Remove the entry for `tuple`. Removing a missing entry is not an error.
    pub fn delete<A: CtAddress>(&self, tuple: &CtTuple<A>) {
        let map = self.map::<A>(tuple.nexthdr);
        if map.remove(tuple) {
            debug!(map = map.name(), "conntrack entry deleted");
        }
    }

    pub fn get<A: CtAddress>(&self, tuple: &CtTuple<A>) -> Option<CtEntry> {
        self.map::<A>(tuple.nexthdr).get(tuple)
    }

    /// Sweep expired entries from every partition.
    pub fn gc(&self) -> usize {
        let now = self.now();
        let mut removed = self.tcp6.gc(now) + self.any6.gc(now);
        #[cfg(feature = "ipv4")]
        {
            removed += self.tcp4.gc(now) + self.any4.gc(now);
        }
        removed
    }

    /// Total entries across partitions.
    pub fn len(&self) -> usize {
        let mut len = self.tcp6.len() + self.any6.len();
        #[cfg(feature = "ipv4")]
        {
            len += self.tcp4.len() + self.any4.len();
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Direction;
    use crate::test_util::ManualClock;

    fn tuple(sport: u16) -> CtTuple<Ipv6Addr> {
        CtTuple::new(
            "f00d::1".parse().unwrap(),
            "f00d::2".parse().unwrap(),
            IPPROTO_TCP,
            Direction::Egress,
        )
        .with_ports(sport, 80)
    }

    fn maps() -> (CtMaps, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(100));
        (CtMaps::with_clock(CtConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn test_status_codes() {
        for status in [
            CtStatus::New,
            CtStatus::Established,
            CtStatus::Reply,
            CtStatus::Related,
        ] {
            assert_eq!(CtStatus::try_from(status.code()), Ok(status));
        }
        assert_eq!(
            CtStatus::try_from(9),
            Err(DropReason::UnknownConnTrackState)
        );
    }

    #[test]
    fn test_lookup_states() {
        let (ct, _) = maps();
        let t = tuple(1000);
        let obs = CtObservation::default();

        assert_eq!(ct.lookup(&t, None, &obs).unwrap().status, CtStatus::New);

        let state = CtState {
            rev_nat_index: 3,
            ..Default::default()
        };
        ct.create(&t, &state, &obs);

        let hit = ct.lookup(&t, None, &obs).unwrap();
        assert_eq!(hit.status, CtStatus::Established);
        assert_eq!(hit.rev_nat_index, 3);

        let reply = ct.lookup(&t.reverse(), None, &obs).unwrap();
        assert_eq!(reply.status, CtStatus::Reply);
        assert_eq!(reply.rev_nat_index, 3);
    }

    #[test]
    fn test_related() {
        let (ct, _) = maps();
        let flow = tuple(1000);
        ct.create(&flow, &CtState::default(), &CtObservation::default());

        let icmp = CtTuple::new(
            "f00d::99".parse().unwrap(),
            "f00d::1".parse().unwrap(),
            IPPROTO_ICMPV6,
            Direction::Ingress,
        );
        let hit = ct
            .lookup(&icmp, Some(&flow), &CtObservation::default())
            .unwrap();
        assert_eq!(hit.status, CtStatus::Related);
        assert!(hit.status.is_reply());
    }

    #[test]
    fn test_create_overwrites() {
        let (ct, _) = maps();
        let t = tuple(1000);
        let obs = CtObservation::default();
        ct.create(&t, &CtState { rev_nat_index: 1, ..Default::default() }, &obs);
        ct.create(&t, &CtState { rev_nat_index: 2, ..Default::default() }, &obs);
        assert_eq!(ct.len(), 1);
        assert_eq!(ct.get(&t).unwrap().rev_nat_index, 2);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (ct, _) = maps();
        let t = tuple(1000);
        ct.create(&t, &CtState::default(), &CtObservation::default());
        ct.delete(&t);
        ct.delete(&t);
        assert!(ct.get(&t).is_none());
    }

    #[test]
    fn test_partition_by_protocol() {
        let (ct, _) = maps();
        let tcp = tuple(1000);
        let mut udp = tcp;
        udp.nexthdr = IPPROTO_UDP;
        let obs = CtObservation::default();
        ct.create(&tcp, &CtState::default(), &obs);
        ct.create(&udp, &CtState::default(), &obs);

        assert_eq!(ct.map::<Ipv6Addr>(IPPROTO_TCP).len(), 1);
        assert_eq!(ct.map::<Ipv6Addr>(IPPROTO_UDP).len(), 1);
        assert_eq!(ct.map::<Ipv6Addr>(IPPROTO_ICMPV6).len(), 1);
    }

    #[test]
    fn test_counters_and_close_timeout() {
        let (ct, clock) = maps();
        let t = tuple(1000);
        ct.create(&t, &CtState::default(), &CtObservation { bytes: 60, tcp_flags: TCP_FLAG_SYN });
        assert_eq!(ct.get(&t).unwrap().lifetime, 100 + CT_CONNECTION_LIFETIME_TCP as u64);

        clock.advance(5);
        let reply = CtObservation { bytes: 40, tcp_flags: TCP_FLAG_FIN | TCP_FLAG_ACK };
        let hit = ct.lookup(&t.reverse(), None, &reply).unwrap();
        assert_eq!(hit.monitor, TRACE_PAYLOAD_LEN);

        let entry = ct.get(&t).unwrap();
        assert_eq!((entry.tx_packets, entry.tx_bytes), (1, 60));
        assert_eq!((entry.rx_packets, entry.rx_bytes), (1, 40));
        assert!(entry.rx_closing);
        assert!(entry.seen_non_syn);
        assert_eq!(entry.lifetime, 105 + CT_CLOSE_TIMEOUT as u64);
    }

    #[test]
    fn test_gc_removes_expired() {
        let (ct, clock) = maps();
        let tcp = tuple(1000);
        let mut udp = tuple(2000);
        udp.nexthdr = IPPROTO_UDP;
        ct.create(&tcp, &CtState::default(), &CtObservation::default());
        ct.create(&udp, &CtState::default(), &CtObservation::default());

        clock.advance(CT_CONNECTION_LIFETIME_NONTCP as u64);
        assert_eq!(ct.gc(), 1);
        assert!(ct.get(&udp).is_none());
        assert!(ct.get(&tcp).is_some());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let map = CtMap::new("test", 32);
        for port in 0..1000u16 {
            map.insert(tuple(port), CtEntry::default());
        }
        assert!(map.len() <= map.capacity());
        assert_eq!(map.capacity(), 32);
        assert!(map.evictions() >= 1000 - 32);
    }

    #[test]
    fn test_eviction_prefers_stale_entries() {
        let map = CtMap::new("test", 1);
        let old = tuple(1);
        map.insert(old, CtEntry::default());
        let new = tuple(2);
        map.insert(new, CtEntry::default());
        assert!(!map.contains(&old));
        assert!(map.contains(&new));
    }
}
