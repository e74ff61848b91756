//! Wall-clock tracking from received advert timestamps.
//!
//! A node has no RTC; it anchors a base timestamp to a local millisecond
//! reading and extrapolates. The first plausible advert timestamp is adopted
//! outright. A later timestamp that disagrees by more than the drift
//! tolerance is only adopted once a second, independent advert confirms it
//! within the consensus window, which keeps one misconfigured node from
//! dragging the mesh clock.

use crate::simulation::clock::VirtualClock;

/// Accept advert timestamps only inside [2020-01-01, 2100-01-01].
const MIN_PLAUSIBLE_TS: u32 = 1_577_836_800;
const MAX_PLAUSIBLE_TS: u32 = 4_102_444_800;

/// Disagreement below this is treated as already-in-sync.
pub const MAX_TIMESTAMP_DIFF_SECS: i64 = 300;
/// A pending candidate older than this no longer counts toward consensus.
pub const CONSENSUS_WINDOW_MS: u64 = 3_600_000;

/// Outcome of feeding an advert timestamp into the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Implausible, within tolerance, or recorded as pending.
    Ignored,
    /// First adoption of a wall clock.
    FirstSync,
    /// Two-source consensus moved the base.
    Resync,
}

/// Time synchronization state.
pub struct TimeSync {
    clock: VirtualClock,
    base_timestamp: u32,
    base_millis: u64,
    synchronized: bool,
    pending_timestamp: u32,
    pending_millis: u64,
}

impl TimeSync {
    pub fn new(clock: VirtualClock) -> TimeSync {
        TimeSync {
            clock,
            base_timestamp: 0,
            base_millis: 0,
            synchronized: false,
            pending_timestamp: 0,
            pending_millis: 0,
        }
    }

    /// Feed a timestamp (unix seconds) extracted from a received advert.
    pub fn sync_from_advert(&mut self, unix_time: u32) -> SyncOutcome {
        if !(MIN_PLAUSIBLE_TS..=MAX_PLAUSIBLE_TS).contains(&unix_time) {
            return SyncOutcome::Ignored;
        }

        let now = self.clock.millis();

        if !self.synchronized {
            self.base_timestamp = unix_time;
            self.base_millis = now;
            self.synchronized = true;
            self.clear_pending();
            return SyncOutcome::FirstSync;
        }

        let our_time = self.base_timestamp as u64 + (now - self.base_millis) / 1000;
        let diff = unix_time as i64 - our_time as i64;
        if diff.abs() < MAX_TIMESTAMP_DIFF_SECS {
            self.clear_pending();
            return SyncOutcome::Ignored;
        }

        if self.pending_timestamp > 0 && now - self.pending_millis < CONSENSUS_WINDOW_MS {
            let pending_adjusted =
                self.pending_timestamp as u64 + (now - self.pending_millis) / 1000;
            let pending_diff = unix_time as i64 - pending_adjusted as i64;
            if pending_diff.abs() < MAX_TIMESTAMP_DIFF_SECS {
                let avg = (unix_time as u64 + pending_adjusted) / 2;
                self.base_timestamp = avg as u32;
                self.base_millis = now;
                self.clear_pending();
                return SyncOutcome::Resync;
            }
        }

        self.pending_timestamp = unix_time;
        self.pending_millis = now;
        SyncOutcome::Ignored
    }

    /// Current wall clock in unix seconds. Falls back to the raw local clock
    /// before the first sync.
    pub fn get_timestamp(&self) -> u32 {
        if self.synchronized {
            (self.base_timestamp as u64 + (self.clock.millis() - self.base_millis) / 1000) as u32
        } else {
            (self.clock.millis() / 1000) as u32
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Manual override: adopt unconditionally and drop any pending candidate.
    pub fn set_time(&mut self, unix_time: u32) {
        self.base_timestamp = unix_time;
        self.base_millis = self.clock.millis();
        self.synchronized = true;
        self.clear_pending();
    }

    fn clear_pending(&mut self) {
        self.pending_timestamp = 0;
        self.pending_millis = 0;
    }
}
