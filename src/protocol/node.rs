//! The per-node firmware state machine.
//!
//! A node is driven by exactly two entry points: [`Node::on_rx_frame`] for
//! received radio frames (with RSSI/SNR metadata) and [`Node::tick`] for
//! scheduler ticks. Everything else (time sync, sighting bookkeeping,
//! store-and-forward, the forwarding engine, the directed ping protocol)
//! happens synchronously inside those two calls.
//!
//! Two roles share the reception pipeline: a repeater runs the full
//! forwarding engine, a companion only processes frames addressed to itself.

use std::collections::VecDeque;

use chrono::{DateTime, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;

use crate::protocol::advert::{build_advert, extract_timestamp, parse_advert, verify_signature};
use crate::protocol::health::{AdaptiveTxPower, Neighbour, NeighbourTable};
use crate::protocol::identity::{
    FLAG_HAS_NAME, Identity, NODE_TYPE_CHAT, NODE_TYPE_REPEATER,
};
use crate::protocol::mailbox::Mailbox;
use crate::protocol::packet::{
    MAX_PATH_LEN, PAYLOAD_VER_1, Packet, PayloadType, RouteType,
};
use crate::protocol::tables::{
    NodeConfig, PacketIdCache, RateLimiter, Sighting, SightingTable, Stats, TxQueue,
};
use crate::protocol::timesync::{SyncOutcome, TimeSync};
use crate::simulation::clock::VirtualClock;

// Log tag prefixes, matching the firmware serial output.
pub const TAG_RX: &str = "[R]";
pub const TAG_FWD: &str = "[F]";
pub const TAG_PING: &str = "[P]";
pub const TAG_ADVERT: &str = "[A]";
pub const TAG_NODE: &str = "[N]";
pub const TAG_OK: &str = "[OK]";
pub const TAG_ERROR: &str = "[E]";
pub const TAG_INFO: &str = "[I]";

/// Delay before advertising after a time sync, so the mesh hears a node's
/// corrected clock shortly after it learns one.
pub const ADVERT_AFTER_SYNC_MS: u64 = 5_000;
/// A peer unseen for this long counts as offline for store-and-forward.
pub const HEALTH_OFFLINE_MS: u64 = 1_800_000;
/// Repeater housekeeping cadence (quiet hours, breakers, adaptive TX).
const PERIODIC_INTERVAL_MS: u64 = 60_000;

/// Forward delay weights, thousandths of a millisecond per millisecond of
/// airtime, indexed worst SNR to best.
const FWD_DELAY_WEIGHTS: [u64; 11] = [1293, 1105, 936, 783, 645, 521, 410, 310, 220, 139, 65];

/// Map a quarter-dB SNR onto the delay weight index: -20 dB and below map to
/// 0, +15 dB and above to 10.
pub fn snr_delay_index(snr_qdb: i16) -> usize {
    (((snr_qdb as i32 + 80) * 10) / 140).clamp(0, 10) as usize
}

/// SNR-driven component of the flood forward delay.
pub fn snr_delay_ms(snr_qdb: i16, airtime_ms: u64) -> u64 {
    FWD_DELAY_WEIGHTS[snr_delay_index(snr_qdb)] * airtime_ms / 1000
}

/// Uniform TX jitter: one of {0..6} doubled airtimes.
fn random_jitter_ms(rng: &mut StdRng, airtime_ms: u64) -> u64 {
    rng.gen_range(0..=6u64) * 2 * airtime_ms
}

fn fmt_snr(snr_qdb: i16) -> String {
    format!("{}.{}dB", snr_qdb / 4, (snr_qdb % 4).abs() * 25)
}

fn wall_hour(unix_time: u32) -> u8 {
    DateTime::<Utc>::from_timestamp(unix_time as i64, 0)
        .map(|dt| dt.hour() as u8)
        .unwrap_or(0)
}

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Repeater,
    Companion,
}

impl NodeKind {
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Repeater => "repeater",
            NodeKind::Companion => "companion",
        }
    }
}

/// One per-node event log entry: `(tick_ms, tag, message)`.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at_ms: u64,
    pub tag: &'static str,
    pub text: String,
}

/// Maximum retained event-log entries per node.
const NODE_LOG_CAPACITY: usize = 1000;

/// Per-node event log: a drain buffer for the host plus a bounded history.
#[derive(Default)]
pub struct EventLog {
    buffer: VecDeque<LogEntry>,
    history: VecDeque<LogEntry>,
}

impl EventLog {
    fn push(&mut self, at_ms: u64, tag: &'static str, text: String) {
        log::trace!("{at_ms}ms {tag} {text}");
        let entry = LogEntry { at_ms, tag, text };
        self.buffer.push_back(entry.clone());
        if self.history.len() >= NODE_LOG_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    /// Take the entries accumulated since the last drain.
    pub fn drain(&mut self) -> Vec<LogEntry> {
        self.buffer.drain(..).collect()
    }

    pub fn history(&self) -> impl Iterator<Item = &LogEntry> {
        self.history.iter()
    }
}

/// Configured quiet-hours window `[start, end)` in local wall hours, with
/// midnight wrap-around.
struct QuietHours {
    start_hour: u8,
    end_hour: u8,
    max_forwards: u32,
}

impl QuietHours {
    fn contains(&self, hour: u8) -> bool {
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// State only a forwarding node carries.
pub(crate) struct RepeaterState {
    pub(crate) forward_limiter: RateLimiter,
    pub(crate) neighbours: NeighbourTable,
    pub(crate) mailbox: Mailbox,
    pub(crate) adaptive_tx: AdaptiveTxPower,
    quiet_hours: Option<QuietHours>,
    pub(crate) in_quiet_period: bool,
    last_periodic_ms: u64,
}

impl RepeaterState {
    fn new(config: &NodeConfig) -> RepeaterState {
        RepeaterState {
            forward_limiter: RateLimiter::new(config.forward_max, config.forward_window_secs),
            neighbours: NeighbourTable::new(),
            mailbox: Mailbox::new(),
            adaptive_tx: AdaptiveTxPower::default(),
            quiet_hours: None,
            in_quiet_period: false,
            last_periodic_ms: 0,
        }
    }
}

pub(crate) enum Role {
    Companion,
    Repeater(RepeaterState),
}

/// JSON-friendly state snapshot of a node.
#[derive(Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub hash: String,
    pub kind: &'static str,
    pub flags: String,
    pub public_key: String,
    pub stats: Stats,
    pub time_synced: bool,
    pub timestamp: u32,
    pub seen_nodes: Vec<Sighting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbours: Option<Vec<Neighbour>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox_used: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox_total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_power_dbm: Option<i8>,
}

/// A simulated mesh node.
pub struct Node {
    pub identity: Identity,
    pub config: NodeConfig,
    pub time_sync: TimeSync,
    pub sightings: SightingTable,
    pub tx_queue: TxQueue,
    pub stats: Stats,
    pub events: EventLog,
    pub(crate) packet_cache: PacketIdCache,
    pub(crate) role: Role,
    clock: VirtualClock,
    rng: StdRng,
    ping_counter: u32,
    last_advert_ms: u64,
    pending_advert_ms: u64,
}

impl Node {
    pub fn new_repeater(name: &str, clock: VirtualClock, master_rng: &mut StdRng) -> Node {
        Node::new(name, NodeKind::Repeater, clock, master_rng)
    }

    pub fn new_companion(name: &str, clock: VirtualClock, master_rng: &mut StdRng) -> Node {
        Node::new(name, NodeKind::Companion, clock, master_rng)
    }

    fn new(name: &str, kind: NodeKind, clock: VirtualClock, master_rng: &mut StdRng) -> Node {
        let mut identity = Identity::generate(name, master_rng);
        identity.flags = match kind {
            NodeKind::Repeater => NODE_TYPE_REPEATER | FLAG_HAS_NAME,
            NodeKind::Companion => NODE_TYPE_CHAT | FLAG_HAS_NAME,
        };
        let config = NodeConfig::default();
        let role = match kind {
            NodeKind::Repeater => Role::Repeater(RepeaterState::new(&config)),
            NodeKind::Companion => Role::Companion,
        };
        let rng = StdRng::seed_from_u64(master_rng.next_u64());
        Node {
            identity,
            time_sync: TimeSync::new(clock.clone()),
            sightings: SightingTable::new(),
            tx_queue: TxQueue::new(),
            stats: Stats::default(),
            events: EventLog::default(),
            packet_cache: PacketIdCache::new(),
            config,
            role,
            clock,
            rng,
            ping_counter: 0,
            last_advert_ms: 0,
            pending_advert_ms: 0,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.role {
            Role::Repeater(_) => NodeKind::Repeater,
            Role::Companion => NodeKind::Companion,
        }
    }

    pub fn is_repeater(&self) -> bool {
        matches!(self.role, Role::Repeater(_))
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn hash(&self) -> u8 {
        self.identity.hash
    }

    // --- Reception ---

    /// Entry point for a raw frame off the radio. Codec failures are counted
    /// and logged, never propagated.
    pub fn on_rx_frame(&mut self, data: &[u8], rssi: i16, snr: i16) {
        match Packet::deserialize(data) {
            Ok(pkt) => self.on_rx_packet(pkt, rssi, snr),
            Err(e) => {
                self.stats.err_count += 1;
                let now = self.clock.millis();
                self.events.push(now, TAG_ERROR, e.to_string());
            }
        }
    }

    /// Process one received packet with its reception metadata.
    pub fn on_rx_packet(&mut self, mut pkt: Packet, rssi: i16, snr: i16) {
        let now = self.clock.millis();
        pkt.rssi = rssi;
        pkt.snr = snr;
        pkt.rx_time_ms = now;
        self.stats.rx_count += 1;

        let pt = pkt.payload_type();
        if pt == PayloadType::Advert as u8 {
            self.process_advert(&pkt);
        } else if pt == PayloadType::Plain as u8 {
            self.process_plain(&pkt);
        }

        // Learn peers from the path: the originator and the last hop.
        if let Some(&origin) = pkt.path.first() {
            self.sightings.update(origin, rssi, snr, None, now);
            if pkt.path.len() > 1 {
                let last_hop = pkt.path[pkt.path.len() - 1];
                if last_hop != origin {
                    self.sightings.update(last_hop, rssi, snr, None, now);
                }
            }
        }

        if self.is_repeater() {
            self.maybe_store_for_offline(&pkt);
            self.try_forward(&pkt);
        }
    }

    fn process_advert(&mut self, pkt: &Packet) {
        let now = self.clock.millis();
        self.stats.adv_rx_count += 1;

        let advert_time = extract_timestamp(&pkt.payload);
        if advert_time > 0 {
            match self.time_sync.sync_from_advert(advert_time) {
                SyncOutcome::FirstSync => {
                    let ts = self.time_sync.get_timestamp();
                    self.events.push(now, TAG_OK, format!("Time sync {ts}"));
                    self.pending_advert_ms = now + ADVERT_AFTER_SYNC_MS;
                }
                SyncOutcome::Resync => {
                    let ts = self.time_sync.get_timestamp();
                    self.events.push(now, TAG_OK, format!("Time resync {ts}"));
                    self.pending_advert_ms = now + ADVERT_AFTER_SYNC_MS;
                }
                SyncOutcome::Ignored => {}
            }
        }

        let info = match parse_advert(&pkt.payload) {
            Ok(info) => info,
            Err(e) => {
                self.stats.err_count += 1;
                self.events.push(now, TAG_ERROR, e.to_string());
                return;
            }
        };

        // Opt-in authentication at the parser/sighting boundary: a failed
        // signature means the claimed identity is never recorded.
        if self.config.verify_adverts && !verify_signature(&pkt.payload) {
            self.stats.err_count += 1;
            self.events
                .push(now, TAG_ERROR, format!("Advert sig {:02X}", info.hash));
            return;
        }

        self.events.push(
            now,
            TAG_NODE,
            format!(
                "{}{}{} {:02X}",
                info.name,
                if info.is_repeater { " R" } else { "" },
                if info.is_chat_node { " C" } else { "" },
                info.hash
            ),
        );
        let is_new =
            self.sightings
                .update(info.hash, pkt.rssi, pkt.snr, Some(info.name.as_str()), now);
        if is_new {
            self.events.push(now, TAG_NODE, "New node".to_string());
        }

        let Role::Repeater(rs) = &mut self.role else {
            return;
        };

        // Zero-hop adverts from other repeaters define our radio neighbours.
        if pkt.path.is_empty() && info.is_repeater {
            rs.neighbours.observe(info.hash, pkt.rssi, pkt.snr, now);
        }

        // The peer is back: flush anything we held for it.
        while let Some(data) = rs.mailbox.pop_for(info.hash) {
            match Packet::deserialize(&data) {
                Ok(stored) => {
                    if self.tx_queue.add(stored) {
                        self.events
                            .push(now, TAG_INFO, format!("Mbox fwd {:02X}", info.hash));
                    } else {
                        self.stats.err_count += 1;
                        self.events.push(now, TAG_ERROR, "TX queue full".to_string());
                    }
                }
                Err(e) => {
                    self.stats.err_count += 1;
                    self.events.push(now, TAG_ERROR, e.to_string());
                }
            }
        }
    }

    /// Directed ping/pong/trace over plain payloads:
    /// `[dest:1][src:1][marker:2][text]`.
    fn process_plain(&mut self, pkt: &Packet) {
        if pkt.payload.len() < 4 {
            return;
        }
        let dest = pkt.payload[0];
        let src = pkt.payload[1];
        if dest != self.identity.hash {
            return;
        }
        let marker = [pkt.payload[2], pkt.payload[3]];
        let text = String::from_utf8_lossy(&pkt.payload[4..]).into_owned();
        let now = self.clock.millis();

        match &marker {
            b"DP" => {
                self.events
                    .push(now, TAG_PING, format!("from {src:02X} {text}"));
                self.send_pong(src, pkt);
            }
            b"PO" => {
                self.events.push(
                    now,
                    TAG_PING,
                    format!(
                        "PONG {src:02X} {text} rssi={} snr={} p={}",
                        pkt.rssi,
                        fmt_snr(pkt.snr),
                        pkt.path_len()
                    ),
                );
            }
            b"DT" => {
                self.events
                    .push(now, TAG_PING, format!("TRACE from {src:02X} {text}"));
                self.send_trace_response(src, pkt);
            }
            b"TR" => {
                self.events.push(
                    now,
                    TAG_PING,
                    format!(
                        "TRACE {src:02X} {text} rssi={} snr={} p={}",
                        pkt.rssi,
                        fmt_snr(pkt.snr),
                        pkt.path_len()
                    ),
                );
            }
            _ => {}
        }
    }

    // --- Forwarding engine (repeater only) ---

    /// Admission predicate: whether a received packet should be repeated.
    /// Inserts the packet id into the dedup cache as a side effect.
    pub(crate) fn should_forward(&mut self, pkt: &Packet) -> bool {
        let is_flood = pkt.is_flood();
        let is_direct = pkt.is_direct();
        if !is_flood && !is_direct {
            return false;
        }

        // Too weak to trust.
        if pkt.rssi < self.config.rssi_forward_gate_dbm {
            return false;
        }

        // Source routing: we must be the next hop.
        if is_direct && pkt.path.first() != Some(&self.identity.hash) {
            return false;
        }

        // Addressed to us, not for repeating.
        let pt = pkt.payload_type();
        if (pt == PayloadType::AnonReq as u8
            || pt == PayloadType::Request as u8
            || pt == PayloadType::Response as u8)
            && pkt.payload.first() == Some(&self.identity.hash)
        {
            return false;
        }

        if !self.packet_cache.add_if_new(pkt.packet_id()) {
            return false;
        }

        if is_flood {
            if pkt.path.contains(&self.identity.hash) {
                return false;
            }
            if pkt.path_len() >= MAX_PATH_LEN - 1 {
                return false;
            }
        }

        true
    }

    fn try_forward(&mut self, pkt: &Packet) {
        if !self.should_forward(pkt) {
            return;
        }
        let now = self.clock.millis();
        let airtime = self.config.airtime_hint_ms;

        let Role::Repeater(rs) = &mut self.role else {
            return;
        };

        if !rs.forward_limiter.allow(now / 1000) {
            self.events.push(now, TAG_FWD, "Rate lim".to_string());
            return;
        }

        // Direct frames toward a tripped neighbour are dropped.
        if pkt.is_direct() && pkt.path.len() >= 2 && rs.neighbours.is_blocked(pkt.path[1]) {
            self.events
                .push(now, TAG_FWD, format!("CB {:02X}", pkt.path[1]));
            return;
        }

        let mut fwd = pkt.clone();
        let delay_ms;
        if fwd.is_direct() {
            // Peel: the next hop moves to the head.
            fwd.path.remove(0);
            delay_ms = random_jitter_ms(&mut self.rng, airtime) / 2;
            self.events
                .push(now, TAG_FWD, format!("Direct p={}", fwd.path.len()));
        } else {
            // Accumulate the route.
            fwd.path.push(self.identity.hash);
            delay_ms =
                snr_delay_ms(pkt.snr, airtime) + random_jitter_ms(&mut self.rng, airtime);
            self.events
                .push(now, TAG_FWD, format!("Flood p={}", fwd.path.len()));
        }

        let path_len = fwd.path.len();
        if self.tx_queue.add(fwd) {
            self.stats.fwd_count += 1;
            self.events
                .push(now, TAG_FWD, format!("Q p={path_len} d={delay_ms}ms"));
        } else {
            self.stats.err_count += 1;
            self.events.push(now, TAG_ERROR, "TX queue full".to_string());
        }
    }

    /// Hold request/response/plain traffic for peers that look offline, to
    /// replay when they advertise again.
    fn maybe_store_for_offline(&mut self, pkt: &Packet) {
        let pt = pkt.payload_type();
        let storable = pt == PayloadType::Request as u8
            || pt == PayloadType::Response as u8
            || pt == PayloadType::Plain as u8
            || pt == PayloadType::AnonReq as u8;
        if !storable || pkt.payload.len() < 2 {
            return;
        }
        let dest = pkt.payload[0];
        if dest == 0 || dest == self.identity.hash {
            return;
        }

        let now = self.clock.millis();
        let (pkt_count, last_seen_ms) = match self.sightings.get(dest) {
            Some(s) => (s.pkt_count, s.last_seen_ms),
            None => return,
        };
        // Known peer, quiet for too long.
        if pkt_count < 2 || now - last_seen_ms <= HEALTH_OFFLINE_MS {
            return;
        }
        // A stored-at timestamp needs a real clock.
        if !self.time_sync.is_synchronized() {
            return;
        }

        let unix_time = self.time_sync.get_timestamp();
        let data = pkt.serialize();
        let Role::Repeater(rs) = &mut self.role else {
            return;
        };
        if rs.mailbox.store(dest, data, unix_time) {
            self.events
                .push(now, TAG_INFO, format!("Mbox store {dest:02X}"));
        }
    }

    // --- Transmission ---

    fn enqueue_own(&mut self, pkt: Packet) -> bool {
        // Self-echo prevention: remember our own frame before it is on air.
        self.packet_cache.add_if_new(pkt.packet_id());
        if self.tx_queue.add(pkt) {
            self.stats.tx_count += 1;
            true
        } else {
            self.stats.err_count += 1;
            let now = self.clock.millis();
            self.events.push(now, TAG_ERROR, "TX queue full".to_string());
            false
        }
    }

    /// Build and enqueue an advert. Flood by default; `flood = false` emits
    /// a zero-hop local advert with direct routing.
    pub fn send_advert(&mut self, flood: bool) {
        let route = if flood {
            RouteType::Flood
        } else {
            RouteType::Direct
        };
        let pkt = build_advert(&self.identity, &self.time_sync, route);
        let now = self.clock.millis();
        if self.enqueue_own(pkt) {
            self.stats.adv_tx_count += 1;
        }
        self.last_advert_ms = now;
        self.events.push(
            now,
            TAG_ADVERT,
            format!(
                "{} {}",
                if flood { "flood" } else { "local" },
                self.identity.name
            ),
        );
    }

    /// Send a directed ping (`DP`) to a node hash.
    pub fn send_directed_ping(&mut self, target_hash: u8) {
        self.ping_counter += 1;
        let counter = self.ping_counter;
        let pkt = self.build_plain(target_hash, *b"DP", &format!("#{counter} {}", self.identity.name));
        let now = self.clock.millis();
        self.events
            .push(now, TAG_PING, format!("-> {target_hash:02X} #{counter}"));
        self.enqueue_own(pkt);
    }

    /// Send a directed trace (`DT`) to a node hash.
    pub fn send_directed_trace(&mut self, target_hash: u8) {
        self.ping_counter += 1;
        let counter = self.ping_counter;
        let pkt = self.build_plain(target_hash, *b"DT", &format!("#{counter} {}", self.identity.name));
        let now = self.clock.millis();
        self.events
            .push(now, TAG_PING, format!("~> {target_hash:02X} #{counter}"));
        self.enqueue_own(pkt);
    }

    fn send_pong(&mut self, target_hash: u8, rx_pkt: &Packet) {
        let pkt = self.build_plain(
            target_hash,
            *b"PO",
            &format!("{} {}", self.identity.name, rx_pkt.rssi),
        );
        let now = self.clock.millis();
        self.events
            .push(now, TAG_PING, format!("PONG -> {target_hash:02X}"));
        self.enqueue_own(pkt);
    }

    fn send_trace_response(&mut self, target_hash: u8, rx_pkt: &Packet) {
        let pkt = self.build_plain(
            target_hash,
            *b"TR",
            &format!(
                "{} {} {}",
                self.identity.name,
                rx_pkt.rssi,
                rx_pkt.path_len()
            ),
        );
        let now = self.clock.millis();
        self.events
            .push(now, TAG_PING, format!("TR -> {target_hash:02X}"));
        self.enqueue_own(pkt);
    }

    fn build_plain(&self, dest_hash: u8, marker: [u8; 2], text: &str) -> Packet {
        let mut pkt = Packet::new();
        pkt.set_header(RouteType::Flood, PayloadType::Plain, PAYLOAD_VER_1);
        pkt.path = vec![self.identity.hash];
        let mut payload = vec![dest_hash, self.identity.hash, marker[0], marker[1]];
        payload.extend_from_slice(text.as_bytes());
        pkt.payload = payload;
        pkt
    }

    // --- Tick ---

    /// One scheduler tick: timers, repeater housekeeping, then a FIFO drain
    /// of the TX queue for the radio.
    pub fn tick(&mut self) -> Vec<Packet> {
        let now = self.clock.millis();

        if self.pending_advert_ms > 0 && now >= self.pending_advert_ms {
            self.pending_advert_ms = 0;
            self.send_advert(true);
        }

        if self.time_sync.is_synchronized()
            && now - self.last_advert_ms >= self.config.advert_interval_ms
        {
            self.send_advert(true);
        }

        self.periodic_maintenance(now);

        let mut out = Vec::with_capacity(self.tx_queue.len());
        while let Some(pkt) = self.tx_queue.pop() {
            out.push(pkt);
        }
        out
    }

    fn periodic_maintenance(&mut self, now: u64) {
        let unix_time = self.time_sync.get_timestamp();
        let hour = wall_hour(unix_time);

        {
            let Role::Repeater(rs) = &mut self.role else {
                return;
            };
            if now - rs.last_periodic_ms < PERIODIC_INTERVAL_MS {
                return;
            }
            rs.last_periodic_ms = now;
            rs.neighbours.tick_timeouts(now);
            rs.mailbox.expire_old(unix_time);
            if let Some(power) = rs.adaptive_tx.evaluate(rs.neighbours.avg_snr()) {
                self.events.push(now, TAG_INFO, format!("TxP: {power}dBm"));
            }
        }
        self.evaluate_quiet_hours(hour);
    }

    // --- Quiet hours ---

    /// Configure the quiet-hours window `[start, end)` with a tightened
    /// forward ceiling. Repeater only.
    pub fn set_quiet_hours(&mut self, start_hour: u8, end_hour: u8, max_forwards: u32) {
        if let Role::Repeater(rs) = &mut self.role {
            rs.quiet_hours = Some(QuietHours {
                start_hour,
                end_hour,
                max_forwards,
            });
        }
    }

    /// Drop the quiet-hours window and restore the normal forward limit.
    pub fn disable_quiet_hours(&mut self) {
        if let Role::Repeater(rs) = &mut self.role {
            rs.quiet_hours = None;
            rs.in_quiet_period = false;
            rs.forward_limiter.max_count = self.config.forward_max;
        }
    }

    pub fn is_quiet_hours_enabled(&self) -> bool {
        matches!(&self.role, Role::Repeater(rs) if rs.quiet_hours.is_some())
    }

    /// Apply the quiet-hours window against the given wall hour, swapping
    /// the forward limiter ceiling on transitions.
    pub(crate) fn evaluate_quiet_hours(&mut self, hour: u8) {
        let now = self.clock.millis();
        let Role::Repeater(rs) = &mut self.role else {
            return;
        };
        let Some(qh) = &rs.quiet_hours else {
            return;
        };
        let active = qh.contains(hour);
        if active == rs.in_quiet_period {
            return;
        }
        rs.in_quiet_period = active;
        rs.forward_limiter.max_count = if active {
            qh.max_forwards
        } else {
            self.config.forward_max
        };
        self.events.push(
            now,
            TAG_INFO,
            format!("Quiet hours {}", if active { "on" } else { "off" }),
        );
    }

    /// Enable or disable the adaptive TX power controller. Repeater only.
    pub fn set_adaptive_tx(&mut self, enabled: bool) {
        if let Role::Repeater(rs) = &mut self.role {
            rs.adaptive_tx.enabled = enabled;
        }
    }

    /// Current transmit power, repeater only.
    pub fn tx_power_dbm(&self) -> Option<i8> {
        match &self.role {
            Role::Repeater(rs) => Some(rs.adaptive_tx.current_dbm),
            Role::Companion => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn observe_neighbour(&mut self, hash: u8, rssi: i16, snr: i16) {
        let now = self.clock.millis();
        if let Role::Repeater(rs) = &mut self.role {
            rs.neighbours.observe(hash, rssi, snr, now);
        }
    }

    // --- CLI ---

    /// Process one CLI command line, returning the reply text.
    pub fn process_command(&mut self, line: &str) -> String {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return String::new();
        };
        let command = command.to_ascii_lowercase();
        let arg = parts.next();
        let is_repeater = self.is_repeater();

        match (command.as_str(), arg) {
            ("status", _) => self.cmd_status(),
            ("stats", _) if is_repeater => self.cmd_stats(),
            ("nodes", _) if is_repeater => self.cmd_nodes(),
            ("ping", Some(target)) => match parse_hash(target) {
                Ok(hash) => {
                    self.send_directed_ping(hash);
                    format!("{TAG_PING} -> {hash:02X}")
                }
                Err(reply) => reply,
            },
            ("trace", Some(target)) => match parse_hash(target) {
                Ok(hash) => {
                    self.send_directed_trace(hash);
                    format!("{TAG_PING} ~> {hash:02X}")
                }
                Err(reply) => reply,
            },
            ("advert", _) => {
                self.send_advert(true);
                format!("{TAG_ADVERT} sent")
            }
            ("help", _) => {
                if is_repeater {
                    "status stats nodes ping <hash> trace <hash> advert help".to_string()
                } else {
                    "status ping <hash> trace <hash> advert help".to_string()
                }
            }
            _ => format!("Unknown: {}", line.trim()),
        }
    }

    fn cmd_status(&self) -> String {
        if self.is_repeater() {
            format!(
                "{} {:02X}\nTime: {} sync={}\nRX:{} TX:{} FWD:{}",
                self.identity.name,
                self.identity.hash,
                self.time_sync.get_timestamp(),
                if self.time_sync.is_synchronized() {
                    "yes"
                } else {
                    "no"
                },
                self.stats.rx_count,
                self.stats.tx_count,
                self.stats.fwd_count
            )
        } else {
            format!("{} {:02X} (companion)", self.identity.name, self.identity.hash)
        }
    }

    fn cmd_stats(&self) -> String {
        let neighbour_count = match &self.role {
            Role::Repeater(rs) => rs.neighbours.len(),
            Role::Companion => 0,
        };
        format!(
            "RX:{} TX:{} FWD:{} ERR:{}\nADV TX:{} RX:{}\nNodes:{} Nbr:{}",
            self.stats.rx_count,
            self.stats.tx_count,
            self.stats.fwd_count,
            self.stats.err_count,
            self.stats.adv_tx_count,
            self.stats.adv_rx_count,
            self.sightings.len(),
            neighbour_count
        )
    }

    fn cmd_nodes(&self) -> String {
        if self.sightings.is_empty() {
            return "No nodes seen".to_string();
        }
        self.sightings
            .iter()
            .map(|s| {
                format!(
                    "  {:02X} {:<12} rssi={} pkt={}",
                    s.hash,
                    if s.name.is_empty() { "?" } else { s.name.as_str() },
                    s.last_rssi,
                    s.pkt_count
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// State snapshot for the host shell.
    pub fn snapshot(&self) -> NodeSnapshot {
        let (neighbours, mailbox_used, mailbox_total, tx_power_dbm) = match &self.role {
            Role::Repeater(rs) => (
                Some(rs.neighbours.iter().cloned().collect()),
                Some(rs.mailbox.used()),
                Some(rs.mailbox.total_slots()),
                Some(rs.adaptive_tx.current_dbm),
            ),
            Role::Companion => (None, None, None, None),
        };
        NodeSnapshot {
            name: self.identity.name.clone(),
            hash: format!("{:02X}", self.identity.hash),
            kind: self.kind().name(),
            flags: format!("0x{:02X}", self.identity.flags),
            public_key: hex::encode(self.identity.public_key),
            stats: self.stats,
            time_synced: self.time_sync.is_synchronized(),
            timestamp: self.time_sync.get_timestamp(),
            seen_nodes: self.sightings.iter().cloned().collect(),
            neighbours,
            mailbox_used,
            mailbox_total,
            tx_power_dbm,
        }
    }
}

/// Parse a CLI hash argument: the full hex literal, masked to one byte.
fn parse_hash(arg: &str) -> Result<u8, String> {
    let Ok(value) = u64::from_str_radix(arg, 16) else {
        return Err(format!("{TAG_ERROR} Invalid hash"));
    };
    match (value & 0xFF) as u8 {
        0 => Err(format!("{TAG_ERROR} Invalid hash 0")),
        hash => Ok(hash),
    }
}
