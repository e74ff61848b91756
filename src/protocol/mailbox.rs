//! Store-and-forward mailbox.
//!
//! Two tiers of slots hold serialized packets for peers that look offline:
//! a small persistent tier that is expected to survive a restart in the
//! intended deployment, and a volatile overflow tier. Duplicate detection is
//! exact byte equality of the stored frame across both tiers.

use serde::{Deserialize, Serialize};

/// Persistent-tier slot count.
pub const MAILBOX_SLOTS: usize = 2;
/// Volatile-tier slot count.
pub const MAILBOX_RAM_SLOTS: usize = 4;
/// Stored frames expire after 24 hours.
pub const MAILBOX_TTL_SECS: u32 = 86_400;

/// One mailbox slot. Empty iff `data` is empty; a non-empty slot always
/// carries the destination hash and the store timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSlot {
    pub dest_hash: u8,
    pub stored_at: u32,
    pub data: Vec<u8>,
}

impl MailboxSlot {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn clear(&mut self) {
        self.dest_hash = 0;
        self.stored_at = 0;
        self.data.clear();
    }

    fn fill(&mut self, dest_hash: u8, stored_at: u32, data: Vec<u8>) {
        self.dest_hash = dest_hash;
        self.stored_at = stored_at;
        self.data = data;
    }
}

/// Two-tier store-and-forward buffer.
#[derive(Debug, Default)]
pub struct Mailbox {
    persistent: Vec<MailboxSlot>,
    volatile: Vec<MailboxSlot>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox {
            persistent: vec![MailboxSlot::default(); MAILBOX_SLOTS],
            volatile: vec![MailboxSlot::default(); MAILBOX_RAM_SLOTS],
        }
    }

    fn slots(&self) -> impl Iterator<Item = &MailboxSlot> {
        self.persistent.iter().chain(self.volatile.iter())
    }

    fn slots_mut(&mut self) -> impl Iterator<Item = &mut MailboxSlot> {
        self.persistent.iter_mut().chain(self.volatile.iter_mut())
    }

    fn is_duplicate(&self, data: &[u8]) -> bool {
        self.slots().any(|s| !s.is_empty() && s.data == data)
    }

    /// Store a serialized frame for an offline peer. Rejects empty frames
    /// and exact duplicates; fills persistent slots first, then volatile,
    /// then overwrites the volatile slot with the oldest timestamp.
    pub fn store(&mut self, dest_hash: u8, data: Vec<u8>, unix_time: u32) -> bool {
        if data.is_empty() || self.is_duplicate(&data) {
            return false;
        }

        if let Some(slot) = self.persistent.iter_mut().find(|s| s.is_empty()) {
            slot.fill(dest_hash, unix_time, data);
            return true;
        }
        if let Some(slot) = self.volatile.iter_mut().find(|s| s.is_empty()) {
            slot.fill(dest_hash, unix_time, data);
            return true;
        }

        // All full: the volatile tier absorbs the overflow.
        if let Some(slot) = self.volatile.iter_mut().min_by_key(|s| s.stored_at) {
            slot.fill(dest_hash, unix_time, data);
            return true;
        }
        false
    }

    /// Number of pending frames for a destination.
    pub fn count_for(&self, dest_hash: u8) -> usize {
        self.slots()
            .filter(|s| !s.is_empty() && s.dest_hash == dest_hash)
            .count()
    }

    /// Remove and return one pending frame for a destination, persistent
    /// tier first.
    pub fn pop_for(&mut self, dest_hash: u8) -> Option<Vec<u8>> {
        let slot = self
            .slots_mut()
            .find(|s| !s.is_empty() && s.dest_hash == dest_hash)?;
        let data = std::mem::take(&mut slot.data);
        slot.clear();
        Some(data)
    }

    /// Drop frames older than [`MAILBOX_TTL_SECS`].
    pub fn expire_old(&mut self, now_secs: u32) {
        for slot in self.slots_mut() {
            if !slot.is_empty() && now_secs.saturating_sub(slot.stored_at) > MAILBOX_TTL_SECS {
                slot.clear();
            }
        }
    }

    /// Occupied slots across both tiers.
    pub fn used(&self) -> usize {
        self.slots().filter(|s| !s.is_empty()).count()
    }

    pub fn total_slots(&self) -> usize {
        MAILBOX_SLOTS + MAILBOX_RAM_SLOTS
    }

    /// Snapshot of the persistent tier for saving across restarts. The
    /// volatile tier is never included.
    pub fn persistent_snapshot(&self) -> Vec<MailboxSlot> {
        self.persistent.clone()
    }

    /// Restore the persistent tier from a saved snapshot.
    pub fn restore_persistent(&mut self, slots: &[MailboxSlot]) {
        for (dst, src) in self.persistent.iter_mut().zip(slots) {
            *dst = src.clone();
        }
    }
}
