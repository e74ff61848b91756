//! Per-link health controls for repeaters: a circuit breaker driven by
//! neighbour SNR samples and an adaptive transmit-power controller.
//!
//! Neighbours are learned from zero-hop repeater adverts and never evicted;
//! a mesh deployment has at most a handful of radio neighbours.

use serde::Serialize;

/// SNR below this (quarter-dB, -10 dB) counts as a bad sample.
pub const CB_SNR_THRESHOLD_QDB: i16 = -40;
/// An open breaker relaxes to half-open after this long without a sample.
pub const CB_OPEN_TIMEOUT_MS: u64 = 300_000;

pub const ADAPTIVE_TX_HIGH_SNR_QDB: i16 = 40;
pub const ADAPTIVE_TX_LOW_SNR_QDB: i16 = -20;
pub const ADAPTIVE_TX_STEP_DBM: i8 = 2;
pub const ADAPTIVE_TX_MIN_POWER_DBM: i8 = 5;
pub const DEFAULT_TX_POWER_DBM: i8 = 14;

/// Circuit-breaker state for one neighbour link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CbState {
    /// Normal forwarding.
    Closed,
    /// Direct-class frames toward this neighbour are dropped.
    Open,
    /// Acts like closed; the next sample decides the transition.
    HalfOpen,
}

/// One radio neighbour of a repeater.
#[derive(Debug, Clone, Serialize)]
pub struct Neighbour {
    pub hash: u8,
    pub rssi: i16,
    pub snr: i16,
    pub last_seen_ms: u64,
    pub cb_state: CbState,
}

/// Neighbour set with circuit-breaker bookkeeping.
#[derive(Default)]
pub struct NeighbourTable {
    entries: Vec<Neighbour>,
}

impl NeighbourTable {
    pub fn new() -> NeighbourTable {
        NeighbourTable::default()
    }

    /// Feed one SNR sample for a neighbour. The first sample creates the
    /// record in the closed state; it takes a second bad sample to open the
    /// breaker. A good sample always closes it again.
    pub fn observe(&mut self, hash: u8, rssi: i16, snr: i16, now_ms: u64) {
        if let Some(n) = self.entries.iter_mut().find(|n| n.hash == hash) {
            n.rssi = rssi;
            n.snr = snr;
            n.last_seen_ms = now_ms;
            if snr < CB_SNR_THRESHOLD_QDB {
                n.cb_state = CbState::Open;
            } else if n.cb_state != CbState::Closed {
                n.cb_state = CbState::Closed;
            }
        } else {
            self.entries.push(Neighbour {
                hash,
                rssi,
                snr,
                last_seen_ms: now_ms,
                cb_state: CbState::Closed,
            });
        }
    }

    /// Relax open breakers that have not seen a sample for the timeout.
    pub fn tick_timeouts(&mut self, now_ms: u64) {
        for n in &mut self.entries {
            if n.cb_state == CbState::Open && now_ms - n.last_seen_ms > CB_OPEN_TIMEOUT_MS {
                n.cb_state = CbState::HalfOpen;
            }
        }
    }

    pub fn get(&self, hash: u8) -> Option<&Neighbour> {
        self.entries.iter().find(|n| n.hash == hash)
    }

    /// Whether a direct-class forward toward `hash` is currently blocked.
    pub fn is_blocked(&self, hash: u8) -> bool {
        self.get(hash).is_some_and(|n| n.cb_state == CbState::Open)
    }

    pub fn open_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|n| n.cb_state == CbState::Open)
            .count()
    }

    /// Mean SNR over all neighbours, quarter-dB.
    pub fn avg_snr(&self) -> Option<i16> {
        if self.entries.is_empty() {
            return None;
        }
        let sum: i32 = self.entries.iter().map(|n| n.snr as i32).sum();
        Some((sum / self.entries.len() as i32) as i16)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbour> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Adaptive transmit-power controller. Disabled by default; when enabled it
/// steps the power down while every neighbour hears us loudly and back up
/// when the average link turns weak.
pub struct AdaptiveTxPower {
    pub enabled: bool,
    pub current_dbm: i8,
    pub max_dbm: i8,
}

impl Default for AdaptiveTxPower {
    fn default() -> Self {
        AdaptiveTxPower {
            enabled: false,
            current_dbm: DEFAULT_TX_POWER_DBM,
            max_dbm: DEFAULT_TX_POWER_DBM,
        }
    }
}

impl AdaptiveTxPower {
    /// Evaluate one adjustment step against the current neighbour average.
    /// Returns the new power only when it actually changed.
    pub fn evaluate(&mut self, avg_snr_qdb: Option<i16>) -> Option<i8> {
        if !self.enabled {
            return None;
        }
        let avg = avg_snr_qdb?;

        if avg > ADAPTIVE_TX_HIGH_SNR_QDB && self.current_dbm > ADAPTIVE_TX_MIN_POWER_DBM {
            self.current_dbm =
                (self.current_dbm - ADAPTIVE_TX_STEP_DBM).max(ADAPTIVE_TX_MIN_POWER_DBM);
            Some(self.current_dbm)
        } else if avg < ADAPTIVE_TX_LOW_SNR_QDB && self.current_dbm < self.max_dbm {
            self.current_dbm = (self.current_dbm + ADAPTIVE_TX_STEP_DBM).min(self.max_dbm);
            Some(self.current_dbm)
        } else {
            None
        }
    }
}
