use tracing::debug;

use hidmux_wire::BROADCAST_CHANNEL;

use crate::error::RegistryError;

/// Number of logical channels the device tracks at once.
pub const CHANNEL_SLOTS: usize = 10;

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: u32,
    last_active: u64,
}

/// Fixed-capacity table of active logical channels.
///
/// Entries are created lazily on first contact (or by the allocation
/// handshake), refreshed on every accepted fragment, and freed when the
/// owning exchange completes, errors out, or idles past the deadline.
#[derive(Debug)]
pub struct ChannelRegistry {
    slots: [Option<Entry>; CHANNEL_SLOTS],
    next_id: u32,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            slots: [None; CHANNEL_SLOTS],
            next_id: 1,
        }
    }

    /// Mint a fresh channel id and register it.
    ///
    /// The id is never zero, never the broadcast id, and never collides with
    /// a currently registered channel.
    pub fn allocate_new(&mut self, now: u64) -> Result<u32, RegistryError> {
        let slot = self
            .free_slot()
            .ok_or(RegistryError::NoCapacity)?;

        loop {
            self.next_id = self.next_id.wrapping_add(1);
            let candidate = self.next_id;
            if candidate != 0 && candidate != BROADCAST_CHANNEL && !self.exists(candidate) {
                self.slots[slot] = Some(Entry {
                    id: candidate,
                    last_active: now,
                });
                debug!(channel = candidate, "allocated channel");
                return Ok(candidate);
            }
        }
    }

    /// True if `id` currently occupies a slot.
    pub fn exists(&self, id: u32) -> bool {
        self.find(id).is_some()
    }

    /// Refresh the last-activity time of a registered channel.
    pub fn touch(&mut self, id: u32, now: u64) -> Result<(), RegistryError> {
        let slot = self.find(id).ok_or(RegistryError::NotFound(id))?;
        if let Some(entry) = &mut self.slots[slot] {
            entry.last_active = now;
        }
        Ok(())
    }

    /// Register `id` if absent; no-op when it already has a slot.
    pub fn ensure(&mut self, id: u32, now: u64) -> Result<(), RegistryError> {
        if self.exists(id) {
            return Ok(());
        }
        let slot = self.free_slot().ok_or(RegistryError::NoCapacity)?;
        self.slots[slot] = Some(Entry {
            id,
            last_active: now,
        });
        debug!(channel = id, "registered channel");
        Ok(())
    }

    /// Free the slot held by `id`. Idempotent.
    pub fn release(&mut self, id: u32) {
        if let Some(slot) = self.find(id) {
            self.slots[slot] = None;
        }
    }

    /// Free and return every channel idle for at least `idle_deadline` ms.
    pub fn sweep(&mut self, now: u64, idle_deadline: u64) -> Vec<u32> {
        let mut expired = Vec::new();
        for slot in &mut self.slots {
            if let Some(entry) = slot {
                if now.saturating_sub(entry.last_active) >= idle_deadline {
                    expired.push(entry.id);
                    *slot = None;
                }
            }
        }
        expired
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn find(&self, id: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.map(|entry| entry.id) == Some(id))
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }
}
