#![no_std]

/// Number of slots in the sector buffer cache.
pub const NUM_CACHE_SLOTS: usize = 64;

/// Number of contiguous sectors an inode takes from the free map at once.
pub const BLOCKS_PER_GROUP: usize = 8;

/// Sector holding the inode of the free-map file.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the inode of the root directory.
pub const ROOT_DIR_SECTOR: u32 = 1;
