use alloc::vec::Vec;

use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

use crate::{CacheConfig, EvictionPolicy};

/// Directory of the cache slots, guarded by the pool-wide lock.
///
/// The directory is the only place where "which slot holds which block" is
/// decided. Slot contents are guarded by the per-slot locks; the pool lock
/// holder only ever *tries* to take a slot lock and never blocks on one.
#[derive(Debug)]
pub struct SlotTable {
    entries: Vec<SlotEntry>,
    policy: EvictionPolicy,
    hand: usize,
    rng: SmallRng,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SlotEntry {
    /// Block the slot holds or is being filled with.
    pub(crate) resident: Option<usize>,
    /// Block whose dirty content the slot is writing back before refilling.
    pub(crate) evicting: Option<usize>,
    /// Reference bit for [`EvictionPolicy::Clock`].
    pub(crate) accessed: bool,
}

impl SlotEntry {
    pub(crate) fn holding(index: usize) -> Self {
        Self {
            resident: Some(index),
            evicting: None,
            accessed: true,
        }
    }

    fn is_free(&self) -> bool {
        self.resident.is_none() && self.evicting.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// The block is (or is being loaded) in this slot.
    Resident(usize),
    /// The slot is writing back this block before reuse.
    Evicting(usize),
    Absent,
}

impl SlotTable {
    pub(crate) fn new(config: &CacheConfig) -> Self {
        Self {
            entries: alloc::vec![SlotEntry::default(); config.num_slots],
            policy: config.policy,
            hand: 0,
            rng: SmallRng::seed_from_u64(config.seed),
        }
    }

    pub(crate) fn entry(&self, slot: usize) -> &SlotEntry {
        &self.entries[slot]
    }

    pub(crate) fn entry_mut(&mut self, slot: usize) -> &mut SlotEntry {
        &mut self.entries[slot]
    }

    pub(crate) fn lookup(&self, index: usize) -> Lookup {
        for (slot, entry) in self.entries.iter().enumerate() {
            if entry.resident == Some(index) {
                return Lookup::Resident(slot);
            }
            if entry.evicting == Some(index) {
                return Lookup::Evicting(slot);
            }
        }
        Lookup::Absent
    }

    pub(crate) fn free_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.is_free().then_some(slot))
    }

    /// Number of victim proposals worth trying before giving up the pool lock.
    pub(crate) fn victim_attempts(&self) -> usize {
        match self.policy {
            EvictionPolicy::Random => self.entries.len(),
            // one sweep clears the reference bits, the next one finds a victim
            EvictionPolicy::Clock => self.entries.len() * 2,
        }
    }

    /// Proposes a slot to evict.
    ///
    /// The caller still has to lock the slot; a proposal that cannot be
    /// locked, or that is already being written back, is simply skipped.
    pub(crate) fn propose_victim(&mut self) -> usize {
        let n = self.entries.len();
        match self.policy {
            EvictionPolicy::Random => self.rng.random_range(0..n),
            EvictionPolicy::Clock => loop {
                let slot = self.hand;
                self.hand = (self.hand + 1) % n;
                let entry = &mut self.entries[slot];
                if entry.accessed {
                    entry.accessed = false;
                    continue;
                }
                break slot;
            },
        }
    }

    /// Blocks currently mapped by the directory, in slot order.
    pub(crate) fn resident_blocks(&self) -> Vec<usize> {
        self.entries.iter().filter_map(|e| e.resident).collect()
    }
}
