//! Sector buffer cache for block I/O.
//!
//! [`BufferCache`] keeps a fixed pool of slots between the file system and a
//! [`BlockDevice`]. Locking is two-phase:
//!
//! 1. The pool lock guards the [`SlotTable`] directory. Under it a caller
//!    finds the slot holding its block (or reserves one for it), and locks
//!    that slot with `try_lock`. The pool lock holder never blocks on a slot.
//! 2. The pool lock is released and all device I/O (fill, write-back) runs
//!    under the slot lock alone.
//!
//! A caller that had to wait for a slot re-checks the slot's block after
//! acquiring it and starts over if the slot was recycled in between. When
//! every slot is locked, the caller blocks on one of them with the pool lock
//! released, then starts over.
//!
//! Each public operation holds at most one slot lock and releases it before
//! returning, so no thread ever nests two slot locks.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use mutex_api::Mutex;
use strum::IntoStaticStr;

pub use self::{
    config::{CacheConfig, EvictionPolicy},
    table::SlotTable,
};
use self::table::{Lookup, SlotEntry};

mod config;
mod table;

/// A trait representing a block device with a fixed block size.
///
/// # Constants
///
/// * `BLOCK_SIZE`: The size of each block in bytes.
pub trait BlockDevice<const BLOCK_SIZE: usize> {
    /// The error type that can be returned by the block device operations.
    type Error;

    /// Reads a block of data from the device at the specified index into the
    /// provided buffer.
    ///
    /// Returns `Ok(())` if the read operation is successful, or an error of
    /// type `Self::Error` if it fails.
    fn read(&self, block_index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error>;

    /// Writes a block of data to the device at the specified index from the
    /// provided buffer.
    ///
    /// Returns `Ok(())` if the write operation is successful, or an error of
    /// type `Self::Error` if it fails.
    fn write(&self, block_index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error>;

    /// Returns the number of blocks of the device.
    fn num_blocks(&self) -> usize;
}

/// State of the content of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum SlotState {
    /// The slot holds nothing.
    Unused,
    /// The slot holds the block as it is on the device.
    InUse,
    /// The slot holds a block that was modified since it was loaded.
    Dirty,
}

/// Content of a cache slot, guarded by the slot's own lock.
pub struct SlotData<const BLOCK_SIZE: usize> {
    index: usize,
    state: SlotState,
    data: [u8; BLOCK_SIZE],
}

impl<const BLOCK_SIZE: usize> Default for SlotData<BLOCK_SIZE> {
    fn default() -> Self {
        Self {
            index: 0,
            state: SlotState::Unused,
            data: [0; BLOCK_SIZE],
        }
    }
}

impl<const BLOCK_SIZE: usize> SlotData<BLOCK_SIZE> {
    fn holds(&self, index: usize) -> bool {
        self.state != SlotState::Unused && self.index == index
    }
}

/// Counters of cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served by a resident slot.
    pub hits: usize,
    /// Lookups that had to load a slot.
    pub misses: usize,
    /// Slots recycled for another block.
    pub evictions: usize,
    /// Dirty slots written to the device.
    pub writebacks: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    writebacks: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// How a freshly claimed slot obtains its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// Read the block from the device.
    Read,
    /// The caller overwrites the whole block; skip the device read.
    Overwrite,
}

/// A slot reserved for a block under the pool lock.
struct Claim<Guard> {
    slot: usize,
    guard: Guard,
    /// Block whose dirty content must be written back before refilling.
    writeback: Option<usize>,
}

/// A sector buffer cache with a fixed number of slots.
///
/// # Type Parameters
///
/// * `Device`: The underlying block device.
/// * `PoolMutex`: The mutex protecting the slot directory.
/// * `SlotMutex`: The mutex protecting each slot's content.
pub struct BufferCache<Device, PoolMutex, SlotMutex> {
    device: Device,
    pool: PoolMutex,
    slots: Vec<SlotMutex>,
    counters: Counters,
}

impl<Device, PoolMutex, SlotMutex, const BLOCK_SIZE: usize> BufferCache<Device, PoolMutex, SlotMutex>
where
    Device: BlockDevice<BLOCK_SIZE>,
    PoolMutex: Mutex<Data = SlotTable>,
    SlotMutex: Mutex<Data = SlotData<BLOCK_SIZE>>,
{
    /// Creates a new [`BufferCache`] instance with all slots unused.
    ///
    /// # Panics
    ///
    /// Panics if `config.num_slots` is `0`.
    pub fn new(device: Device, config: &CacheConfig) -> Self {
        assert!(config.num_slots > 0, "size must be greater than 0");
        log::debug!(
            "buffer cache: {} slots, {} eviction",
            config.num_slots,
            config.policy
        );
        Self {
            device,
            pool: PoolMutex::new(SlotTable::new(config)),
            slots: (0..config.num_slots)
                .map(|_| SlotMutex::new(SlotData::default()))
                .collect(),
            counters: Counters::default(),
        }
    }

    /// Returns a reference to the underlying device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the number of slots.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Copies `dst.len()` bytes at `offset` of block `index` into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the block or `index` is out of the device.
    pub fn read(&self, index: usize, offset: usize, dst: &mut [u8]) -> Result<(), Device::Error> {
        check_range::<BLOCK_SIZE>(offset, dst.len());
        let guard = self.acquire(index, Fill::Read)?;
        dst.copy_from_slice(&guard.data[offset..][..dst.len()]);
        Ok(())
    }

    /// Copies `src` into block `index` at `offset`, marking the slot dirty.
    ///
    /// A write covering the whole block does not read the block from the
    /// device first.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the block or `index` is out of the device.
    pub fn write(&self, index: usize, offset: usize, src: &[u8]) -> Result<(), Device::Error> {
        check_range::<BLOCK_SIZE>(offset, src.len());
        let fill = if src.len() == BLOCK_SIZE {
            Fill::Overwrite
        } else {
            Fill::Read
        };
        let mut guard = self.acquire(index, fill)?;
        guard.data[offset..][..src.len()].copy_from_slice(src);
        guard.state = SlotState::Dirty;
        Ok(())
    }

    /// Reads a whole block.
    pub fn read_block(
        &self,
        index: usize,
        data: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), Device::Error> {
        self.read(index, 0, data)
    }

    /// Writes a whole block.
    pub fn write_block(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Device::Error> {
        self.write(index, 0, data)
    }

    /// Loads block `index` into the cache if it is not resident yet.
    ///
    /// Blocks past the end of the device are ignored.
    pub fn prefetch(&self, index: usize) -> Result<(), Device::Error> {
        if index >= self.device.num_blocks() || self.pool.lock().lookup(index) != Lookup::Absent {
            return Ok(());
        }
        log::trace!("prefetch block {index}");
        let _guard = self.acquire(index, Fill::Read)?;
        Ok(())
    }

    /// Writes every dirty slot back to the device.
    ///
    /// Slots are visited one at a time without the pool lock.
    pub fn flush_all(&self) -> Result<(), Device::Error> {
        let mut flushed = 0;
        for slot in &self.slots {
            let mut guard = slot.lock();
            if guard.state == SlotState::Dirty {
                self.device.write(guard.index, &guard.data)?;
                guard.state = SlotState::InUse;
                Counters::bump(&self.counters.writebacks);
                flushed += 1;
            }
        }
        log::debug!("flushed {flushed} dirty blocks");
        Ok(())
    }

    /// Flushes the cache before the device goes away.
    pub fn shutdown(&self) -> Result<(), Device::Error> {
        self.flush_all()
    }

    /// Returns the blocks currently mapped to a slot.
    pub fn resident_blocks(&self) -> Vec<usize> {
        self.pool.lock().resident_blocks()
    }

    /// Returns a snapshot of the activity counters.
    pub fn stats(&self) -> CacheStats {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            evictions: load(&self.counters.evictions),
            writebacks: load(&self.counters.writebacks),
        }
    }

    /// Returns the locked slot holding block `index`, loading it on a miss.
    fn acquire(&self, index: usize, fill: Fill) -> Result<SlotMutex::Guard<'_>, Device::Error> {
        assert!(
            index < self.device.num_blocks(),
            "block {index} out of range"
        );
        loop {
            let mut pool = self.pool.lock();
            match pool.lookup(index) {
                Lookup::Resident(slot) => {
                    pool.entry_mut(slot).accessed = true;
                    if let Some(guard) = self.slots[slot].try_lock() {
                        drop(pool);
                        debug_assert!(guard.holds(index));
                        Counters::bump(&self.counters.hits);
                        return Ok(guard);
                    }
                    drop(pool);
                    let guard = self.slots[slot].lock();
                    if guard.holds(index) {
                        Counters::bump(&self.counters.hits);
                        return Ok(guard);
                    }
                    // recycled or failed to load while we waited
                    continue;
                }
                Lookup::Evicting(slot) => {
                    drop(pool);
                    drop(self.slots[slot].lock());
                    continue;
                }
                Lookup::Absent => {}
            }

            let Some(claim) = self.claim(&mut pool, index) else {
                // every slot is locked; sleep on one of them instead of polling
                let busy = pool.propose_victim();
                drop(pool);
                log::trace!("all slots busy, waiting on slot {busy} for block {index}");
                drop(self.slots[busy].lock());
                continue;
            };
            drop(pool);
            return self.load(claim, index, fill);
        }
    }

    /// Reserves a slot for block `index`, preferring unused ones.
    fn claim(
        &self,
        pool: &mut SlotTable,
        index: usize,
    ) -> Option<Claim<SlotMutex::Guard<'_>>> {
        let free = pool
            .free_slots()
            .find_map(|slot| self.slots[slot].try_lock().map(|guard| (slot, guard)));
        if let Some((slot, guard)) = free {
            *pool.entry_mut(slot) = SlotEntry::holding(index);
            return Some(Claim {
                slot,
                guard,
                writeback: None,
            });
        }

        for _ in 0..pool.victim_attempts() {
            let slot = pool.propose_victim();
            if pool.entry(slot).evicting.is_some() {
                continue;
            }
            let Some(guard) = self.slots[slot].try_lock() else {
                continue;
            };
            let writeback = (guard.state == SlotState::Dirty).then_some(guard.index);
            if let Some(old) = pool.entry(slot).resident {
                log::debug!(
                    "evict block {old} ({}) from slot {slot} for block {index}",
                    <&str>::from(guard.state)
                );
                Counters::bump(&self.counters.evictions);
            }
            *pool.entry_mut(slot) = SlotEntry {
                evicting: writeback,
                ..SlotEntry::holding(index)
            };
            return Some(Claim {
                slot,
                guard,
                writeback,
            });
        }
        None
    }

    /// Writes back the previous content of a claimed slot and fills it.
    ///
    /// Runs without the pool lock; takes it only briefly to publish the
    /// outcome while still holding the slot.
    fn load<'a>(
        &'a self,
        claim: Claim<SlotMutex::Guard<'a>>,
        index: usize,
        fill: Fill,
    ) -> Result<SlotMutex::Guard<'a>, Device::Error> {
        let Claim {
            slot,
            mut guard,
            writeback,
        } = claim;

        if let Some(old) = writeback {
            if let Err(e) = self.device.write(old, &guard.data) {
                // keep the dirty content where it was
                *self.pool.lock().entry_mut(slot) = SlotEntry {
                    accessed: false,
                    ..SlotEntry::holding(old)
                };
                return Err(e);
            }
            Counters::bump(&self.counters.writebacks);
            self.pool.lock().entry_mut(slot).evicting = None;
        }

        Counters::bump(&self.counters.misses);
        log::trace!("load block {index} into slot {slot} ({fill:?})");
        guard.index = index;
        if fill == Fill::Read {
            if let Err(e) = self.device.read(index, &mut guard.data) {
                let mut pool = self.pool.lock();
                *pool.entry_mut(slot) = SlotEntry::default();
                guard.state = SlotState::Unused;
                drop(pool);
                return Err(e);
            }
        }
        guard.state = SlotState::InUse;
        Ok(guard)
    }
}

fn check_range<const BLOCK_SIZE: usize>(offset: usize, len: usize) {
    assert!(
        offset.checked_add(len).is_some_and(|end| end <= BLOCK_SIZE),
        "range {offset}+{len} exceeds block size {BLOCK_SIZE}"
    );
}
