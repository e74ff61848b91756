//! Simulated radio channel.
//!
//! Connectivity is an explicit link map: each unordered node-name pair
//! carries the RSSI and SNR a receiver observes on that link. Transmitted
//! frames travel as serialized wire bytes and arrive one airtime later, so
//! the receiving node exercises its codec on every delivery. Optional
//! log-normal shadowing perturbs the configured RSSI per reception.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::protocol::packet::Packet;
use crate::simulation::clock::VirtualClock;

/// Default on-air duration of a frame (SF8/BW62.5-ish for ~50 bytes).
pub const DEFAULT_AIRTIME_MS: u64 = 200;

/// One bidirectional link between two nodes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Received signal strength at either end, dBm.
    pub rssi: i16,
    /// Signal-to-noise ratio at either end, quarter-dB.
    pub snr: i16,
    pub enabled: bool,
}

/// A frame in flight: serialized bytes plus the deliveries it will make.
pub struct InFlightFrame {
    pub sender: String,
    pub bytes: Vec<u8>,
    pub deliver_at_ms: u64,
    pub targets: Vec<DeliveryTarget>,
}

/// One receiver of an in-flight frame with its per-link reception values.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub name: String,
    pub rssi: i16,
    pub snr: i16,
}

/// LoRa modulation parameters for airtime estimation.
#[derive(Debug, Clone, Deserialize)]
pub struct LoraParameters {
    pub bandwidth_hz: u32,
    pub spreading_factor: u8,
    /// Coding rate denominator offset: 1 for 4/5 through 4 for 4/8.
    pub coding_rate: u8,
    pub preamble_symbols: f64,
    pub crc_enabled: bool,
    pub low_data_rate_optimization: bool,
}

/// Estimate the on-air time of a frame of `payload_len` bytes.
///
/// Standard LoRa airtime: `T_sym = 2^SF / BW`, preamble of
/// `n_preamble + 4.25` symbols, and the payload symbol count from the
/// SX127x formula with the DE and CRC terms.
pub fn lora_airtime_ms(payload_len: usize, p: &LoraParameters) -> u64 {
    let sf = p.spreading_factor as f64;
    let t_sym_ms = (1u64 << p.spreading_factor) as f64 * 1000.0 / p.bandwidth_hz as f64;

    let crc = if p.crc_enabled { 16.0 } else { 0.0 };
    let de = if p.low_data_rate_optimization { 2.0 } else { 0.0 };
    let numerator = 8.0 * payload_len as f64 - 4.0 * sf + 28.0 + crc;
    let n_payload = 8.0 + (numerator / (4.0 * (sf - de))).ceil().max(0.0) * (p.coding_rate as f64 + 4.0);

    let total_symbols = p.preamble_symbols + 4.25 + n_payload;
    (total_symbols * t_sym_ms).round() as u64
}

/// The simulated RF environment between nodes.
pub struct RadioEnvironment {
    clock: VirtualClock,
    links: BTreeMap<(String, String), LinkConfig>,
    in_flight: Vec<InFlightFrame>,
    pub airtime_ms: u64,
    /// Standard deviation (dB) of per-reception RSSI shadowing; 0 disables.
    pub shadowing_sigma: f64,
    rng: StdRng,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl RadioEnvironment {
    pub fn new(clock: VirtualClock, seed: u64) -> RadioEnvironment {
        RadioEnvironment {
            clock,
            links: BTreeMap::new(),
            in_flight: Vec::new(),
            airtime_ms: DEFAULT_AIRTIME_MS,
            shadowing_sigma: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create or replace a bidirectional link.
    pub fn set_link(&mut self, a: &str, b: &str, rssi: i16, snr: i16) {
        self.links.insert(
            link_key(a, b),
            LinkConfig {
                rssi,
                snr,
                enabled: true,
            },
        );
    }

    pub fn remove_link(&mut self, a: &str, b: &str) {
        self.links.remove(&link_key(a, b));
    }

    pub fn set_link_enabled(&mut self, a: &str, b: &str, enabled: bool) {
        if let Some(link) = self.links.get_mut(&link_key(a, b)) {
            link.enabled = enabled;
        }
    }

    pub fn get_link(&self, a: &str, b: &str) -> Option<&LinkConfig> {
        self.links.get(&link_key(a, b))
    }

    /// Drop every link touching a removed node.
    pub fn remove_node(&mut self, name: &str) {
        self.links.retain(|(a, b), _| a != name && b != name);
    }

    pub fn links(&self) -> impl Iterator<Item = (&(String, String), &LinkConfig)> {
        self.links.iter()
    }

    /// Put a frame on the air. It reaches every enabled link peer of the
    /// sender after one airtime. Returns the receiver names for event
    /// reporting.
    pub fn transmit(&mut self, sender: &str, pkt: &Packet) -> Vec<String> {
        let mut targets = Vec::new();
        for ((a, b), link) in &self.links {
            if !link.enabled {
                continue;
            }
            let peer = if a == sender {
                b
            } else if b == sender {
                a
            } else {
                continue;
            };
            let rssi = if self.shadowing_sigma > 0.0 {
                let normal = Normal::new(0.0, self.shadowing_sigma)
                    .expect("shadowing sigma must be finite and non-negative");
                link.rssi + normal.sample(&mut self.rng).round() as i16
            } else {
                link.rssi
            };
            targets.push(DeliveryTarget {
                name: peer.clone(),
                rssi,
                snr: link.snr,
            });
        }

        let names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
        if !targets.is_empty() {
            self.in_flight.push(InFlightFrame {
                sender: sender.to_string(),
                bytes: pkt.serialize(),
                deliver_at_ms: self.clock.millis() + self.airtime_ms,
                targets,
            });
        }
        names
    }

    /// Remove and return every frame whose airtime has elapsed.
    pub fn take_due(&mut self) -> Vec<InFlightFrame> {
        let now = self.clock.millis();
        let (due, pending): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|f| now >= f.deliver_at_ms);
        self.in_flight = pending;
        due
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{PAYLOAD_VER_1, PayloadType, RouteType};

    fn env() -> (RadioEnvironment, VirtualClock) {
        let clock = VirtualClock::new();
        (RadioEnvironment::new(clock.clone(), 1), clock)
    }

    fn frame() -> Packet {
        let mut pkt = Packet::new();
        pkt.set_header(RouteType::Flood, PayloadType::Plain, PAYLOAD_VER_1);
        pkt.path = vec![0x01];
        pkt.payload = b"hello".to_vec();
        pkt
    }

    #[test]
    fn frames_reach_linked_peers_after_airtime() {
        let (mut radio, clock) = env();
        radio.set_link("A", "B", -70, 32);
        radio.set_link("A", "C", -80, 20);
        radio.set_link("B", "C", -75, 28);

        let targets = radio.transmit("A", &frame());
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&"B".to_string()));
        assert!(targets.contains(&"C".to_string()));

        // Not due yet.
        clock.advance(DEFAULT_AIRTIME_MS - 1);
        assert!(radio.take_due().is_empty());
        assert!(radio.has_in_flight());

        clock.advance(1);
        let due = radio.take_due();
        assert_eq!(due.len(), 1);
        let f = &due[0];
        assert_eq!(f.sender, "A");
        assert_eq!(f.bytes, frame().serialize());
        let b = f.targets.iter().find(|t| t.name == "B").unwrap();
        assert_eq!((b.rssi, b.snr), (-70, 32));
        assert!(!radio.has_in_flight());
    }

    #[test]
    fn disabled_and_removed_links_carry_nothing() {
        let (mut radio, _clock) = env();
        radio.set_link("A", "B", -70, 32);
        radio.set_link_enabled("A", "B", false);
        assert!(radio.transmit("A", &frame()).is_empty());

        radio.set_link_enabled("A", "B", true);
        radio.remove_link("A", "B");
        assert!(radio.transmit("A", &frame()).is_empty());
        assert!(!radio.has_in_flight());
    }

    #[test]
    fn removing_a_node_drops_its_links() {
        let (mut radio, _clock) = env();
        radio.set_link("A", "B", -70, 32);
        radio.set_link("B", "C", -70, 32);
        radio.remove_node("B");
        assert!(radio.get_link("A", "B").is_none());
        assert!(radio.get_link("B", "C").is_none());
    }

    #[test]
    fn link_key_is_symmetric() {
        let (mut radio, _clock) = env();
        radio.set_link("B", "A", -70, 32);
        assert!(radio.get_link("A", "B").is_some());
        let targets = radio.transmit("B", &frame());
        assert_eq!(targets, vec!["A".to_string()]);
    }

    #[test]
    fn shadowing_perturbs_rssi_deterministically() {
        let (mut radio, clock) = env();
        radio.shadowing_sigma = 6.0;
        radio.set_link("A", "B", -70, 32);
        radio.transmit("A", &frame());
        clock.advance(DEFAULT_AIRTIME_MS);
        let due_rssi = radio.take_due()[0].targets[0].rssi;
        // Same seed gives the same draw.
        let clock2 = VirtualClock::new();
        let mut radio2 = RadioEnvironment::new(clock2.clone(), 1);
        radio2.shadowing_sigma = 6.0;
        radio2.set_link("A", "B", -70, 32);
        radio2.transmit("A", &frame());
        clock2.advance(DEFAULT_AIRTIME_MS);
        assert_eq!(radio2.take_due()[0].targets[0].rssi, due_rssi);
    }

    #[test]
    fn lora_airtime_is_plausible() {
        // SF7 BW125 CR4/5, 8 preamble symbols, CRC on: a 20-byte frame is
        // in the tens of milliseconds.
        let p = LoraParameters {
            bandwidth_hz: 125_000,
            spreading_factor: 7,
            coding_rate: 1,
            preamble_symbols: 8.0,
            crc_enabled: true,
            low_data_rate_optimization: false,
        };
        let t = lora_airtime_ms(20, &p);
        assert!((30..80).contains(&t), "unexpected airtime {t}");

        // Higher spreading factors are slower.
        let mut slow = p.clone();
        slow.spreading_factor = 10;
        slow.low_data_rate_optimization = true;
        assert!(lora_airtime_ms(20, &slow) > t * 4);

        // Longer payloads take longer.
        assert!(lora_airtime_ms(100, &p) > lora_airtime_ms(20, &p));
    }
}
