//! Small stateful containers owned by a node: sighting table, packet-id
//! dedup cache, TX queue, rate limiter, counters and configuration.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::protocol::packet::Packet;

/// Sighting table capacity.
pub const MAX_SIGHTINGS: usize = 16;
/// Dedup ring capacity.
pub const PACKET_ID_CACHE_SIZE: usize = 32;
/// Bounded TX queue depth.
pub const TX_QUEUE_SIZE: usize = 4;

/// Forward rate limit defaults.
pub const RATE_LIMIT_FORWARD_MAX: u32 = 100;
pub const RATE_LIMIT_FORWARD_SECS: u64 = 60;
/// Tightened forward ceiling inside a quiet-hours window.
pub const QUIET_HOURS_FORWARD_MAX: u32 = 30;

pub const DEFAULT_ADVERT_INTERVAL_MS: u64 = 300_000;

/// Per-peer reception record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Sighting {
    pub hash: u8,
    pub last_rssi: i16,
    pub last_snr: i16,
    pub pkt_count: u32,
    pub last_seen_ms: u64,
    pub name: String,
}

/// Bounded set of per-peer sightings with LRU eviction by last-seen.
#[derive(Default)]
pub struct SightingTable {
    entries: Vec<Sighting>,
}

impl SightingTable {
    pub fn new() -> SightingTable {
        SightingTable::default()
    }

    /// Record a reception from `hash`. Returns true when this created a new
    /// entry. A `name` of `None` leaves any previously learned name intact.
    pub fn update(
        &mut self,
        hash: u8,
        rssi: i16,
        snr: i16,
        name: Option<&str>,
        now_ms: u64,
    ) -> bool {
        if let Some(s) = self.entries.iter_mut().find(|s| s.hash == hash) {
            s.last_rssi = rssi;
            s.last_snr = snr;
            s.pkt_count += 1;
            s.last_seen_ms = now_ms;
            if let Some(name) = name {
                if !name.is_empty() {
                    s.name = name.to_string();
                }
            }
            return false;
        }

        let entry = Sighting {
            hash,
            last_rssi: rssi,
            last_snr: snr,
            pkt_count: 1,
            last_seen_ms: now_ms,
            name: name.unwrap_or("").to_string(),
        };
        if self.entries.len() < MAX_SIGHTINGS {
            self.entries.push(entry);
        } else {
            // Evict the least recently seen peer.
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_seen_ms)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.entries[oldest] = entry;
        }
        true
    }

    pub fn get(&self, hash: u8) -> Option<&Sighting> {
        self.entries.iter().find(|s| s.hash == hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sighting> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ring of recently seen packet fingerprints. Membership is linear over the
/// 32 slots; insertion overwrites the oldest entry.
pub struct PacketIdCache {
    ids: [u32; PACKET_ID_CACHE_SIZE],
    pos: usize,
}

impl Default for PacketIdCache {
    fn default() -> Self {
        PacketIdCache {
            ids: [0; PACKET_ID_CACHE_SIZE],
            pos: 0,
        }
    }
}

impl PacketIdCache {
    pub fn new() -> PacketIdCache {
        PacketIdCache::default()
    }

    /// Insert `id` if not already present. Returns true when it was new.
    pub fn add_if_new(&mut self, id: u32) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids[self.pos] = id;
        self.pos = (self.pos + 1) % PACKET_ID_CACHE_SIZE;
        true
    }
}

/// Bounded FIFO of packets awaiting transmission.
#[derive(Default)]
pub struct TxQueue {
    queue: VecDeque<Packet>,
}

impl TxQueue {
    pub fn new() -> TxQueue {
        TxQueue::default()
    }

    /// Enqueue a packet. Fails when the queue is full.
    pub fn add(&mut self, pkt: Packet) -> bool {
        if self.queue.len() >= TX_QUEUE_SIZE {
            return false;
        }
        self.queue.push_back(pkt);
        true
    }

    pub fn pop(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Sliding one-window rate limiter.
pub struct RateLimiter {
    pub window_start: u64,
    pub window_secs: u64,
    pub max_count: u32,
    pub count: u32,
    pub total_blocked: u64,
    pub total_allowed: u64,
}

impl RateLimiter {
    pub fn new(max_count: u32, window_secs: u64) -> RateLimiter {
        RateLimiter {
            window_start: 0,
            window_secs,
            max_count,
            count: 0,
            total_blocked: 0,
            total_allowed: 0,
        }
    }

    /// Account one event at `now_secs`; returns whether it is allowed.
    pub fn allow(&mut self, now_secs: u64) -> bool {
        if now_secs < self.window_start + self.window_secs {
            self.count += 1;
            if self.count > self.max_count {
                self.total_blocked += 1;
                return false;
            }
        } else {
            self.window_start = now_secs;
            self.count = 1;
        }
        self.total_allowed += 1;
        true
    }
}

/// Per-node traffic counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Stats {
    pub rx_count: u64,
    pub tx_count: u64,
    pub fwd_count: u64,
    pub err_count: u64,
    pub adv_tx_count: u64,
    pub adv_rx_count: u64,
}

/// Tunable node parameters. Scene files may override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Beacon interval once the clock is synchronized.
    pub advert_interval_ms: u64,
    /// Weakest reception the forwarder will repeat.
    pub rssi_forward_gate_dbm: i16,
    /// Forward rate limit outside quiet hours.
    pub forward_max: u32,
    pub forward_window_secs: u64,
    /// Airtime estimate (ms) used as the base unit for forward delay hints.
    pub airtime_hint_ms: u64,
    /// Check advert signatures before the sighting update. Off by default;
    /// the receive path is verification-free on the wire.
    pub verify_adverts: bool,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            advert_interval_ms: DEFAULT_ADVERT_INTERVAL_MS,
            rssi_forward_gate_dbm: -120,
            forward_max: RATE_LIMIT_FORWARD_MAX,
            forward_window_secs: RATE_LIMIT_FORWARD_SECS,
            airtime_hint_ms: 200,
            verify_adverts: false,
        }
    }
}
