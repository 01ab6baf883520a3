//! Free-sector bitmap.
//!
//! Hands out runs of contiguous sectors, first fit. The bitmap is kept in
//! memory; the file system stores [`FreeMap::to_bytes`] in a regular file
//! and restores it with [`FreeMap::load_bytes`] at mount time.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{vec, vec::Vec};

use mutex_api::Mutex;
use pintfs_types::{SectorNo, to_u32};

/// Source of free sectors.
pub trait SectorAllocator {
    /// Allocates `count` contiguous sectors and returns the first one.
    ///
    /// Returns `None` if no run of that length is free.
    fn allocate(&self, count: usize) -> Option<SectorNo>;

    /// Returns `count` sectors starting at `start` to the free pool.
    fn release(&self, start: SectorNo, count: usize);
}

/// In-use bit per sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
    used: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
            used: 0,
        }
    }

    fn is_allocated(&self, n: usize) -> bool {
        assert!(n < self.len, "sector {n} out of range");
        self.bits[n / 8] & (1 << (n % 8)) != 0
    }

    fn allocate(&mut self, n: usize) {
        assert!(!self.is_allocated(n), "sector {n} already in use");
        self.bits[n / 8] |= 1 << (n % 8);
        self.used += 1;
    }

    fn free(&mut self, n: usize) {
        assert!(self.is_allocated(n), "freeing free sector {n}");
        self.bits[n / 8] &= !(1 << (n % 8));
        self.used -= 1;
    }

    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for n in 0..self.len {
            if self.is_allocated(n) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Some(n + 1 - count);
            }
        }
        None
    }
}

/// Bitmap allocator over the sectors of one disk.
pub struct FreeMap<M> {
    map: M,
}

impl<M> FreeMap<M>
where
    M: Mutex<Data = Bitmap>,
{
    /// Creates a map of `num_sectors` free sectors.
    pub fn new(num_sectors: usize) -> Self {
        Self {
            map: M::new(Bitmap::new(num_sectors)),
        }
    }

    /// Returns the number of sectors covered by the map.
    pub fn num_sectors(&self) -> usize {
        self.map.lock().len
    }

    /// Returns the number of free sectors.
    pub fn free_count(&self) -> usize {
        let map = self.map.lock();
        map.len - map.used
    }

    /// Returns `true` if `sector` is in use.
    ///
    /// # Panics
    ///
    /// Panics if `sector` is out of range.
    pub fn is_allocated(&self, sector: SectorNo) -> bool {
        self.map.lock().is_allocated(sector.as_index())
    }

    /// Marks a fixed sector, such as a well-known inode, as in use.
    ///
    /// # Panics
    ///
    /// Panics if `sector` is out of range or already in use.
    pub fn reserve(&self, sector: SectorNo) {
        self.map.lock().allocate(sector.as_index());
    }

    /// Number of bytes of the persistent form of the map.
    pub fn byte_len(&self) -> usize {
        self.map.lock().bits.len()
    }

    /// Returns the persistent form of the map.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.map.lock().bits.clone()
    }

    /// Replaces the map with a previously saved one.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` was not produced by a map of the same size.
    pub fn load_bytes(&self, bytes: &[u8]) {
        let mut map = self.map.lock();
        assert_eq!(bytes.len(), map.bits.len(), "free map size mismatch");
        map.bits.copy_from_slice(bytes);
        let used = (0..map.len).filter(|&n| map.is_allocated(n)).count();
        map.used = used;
    }
}

impl<M> SectorAllocator for FreeMap<M>
where
    M: Mutex<Data = Bitmap>,
{
    fn allocate(&self, count: usize) -> Option<SectorNo> {
        assert!(count > 0);
        let mut map = self.map.lock();
        let Some(start) = map.find_free_run(count) else {
            log::warn!(
                "no run of {count} free sectors ({} free)",
                map.len - map.used
            );
            return None;
        };
        for n in start..start + count {
            map.allocate(n);
        }
        Some(SectorNo::new(to_u32(start)))
    }

    fn release(&self, start: SectorNo, count: usize) {
        let mut map = self.map.lock();
        for n in start.as_index()..start.as_index() + count {
            map.free(n);
        }
    }
}
