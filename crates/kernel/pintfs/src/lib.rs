//! Inode layer of a Pintos-style file system.
//!
//! All sector traffic goes through a [`BufferCache`]. Files are inodes
//! addressed by the sector holding them; a file's data is mapped through
//! direct, indirect and doubly-indirect pointers and grows on write.
//! Free space is tracked by a bitmap that is itself stored in an inode at
//! [`FREE_MAP_SECTOR`], next to the root directory inode at
//! [`ROOT_DIR_SECTOR`].
//!
//! The file system is generic over the block device and over the lock
//! implementation ([`MutexKind`]), so it can be linked into a kernel or
//! tested on the host with `std` locks.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{sync::Arc, vec};
use core::fmt;

pub use block_io::{BlockDevice, CacheConfig, CacheStats, EvictionPolicy};
use block_io::{BufferCache, SlotData, SlotTable};
use free_map::{Bitmap, FreeMap, SectorAllocator};
use mutex_api::MutexKind;
pub use pintfs_params::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
pub use pintfs_types::{MAX_FILE_SIZE, SECTOR_SIZE, SectorNo};

pub use self::{error::FsError, inode::Inode, io::SectorIo};
use self::inode::InodeTable;

mod error;
mod inode;
mod io;

/// The buffer cache type used by a [`FileSystem`] with locks of kind `K`.
pub type Cache<D, K> = BufferCache<
    D,
    <K as MutexKind>::Lock<SlotTable>,
    <K as MutexKind>::Lock<SlotData<SECTOR_SIZE>>,
>;

/// Runtime configuration of a [`FileSystem`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsConfig {
    pub cache: CacheConfig,
}

impl FsConfig {
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }
}

/// State shared by a file system and all inode handles opened from it.
pub(crate) struct FsShared<D, K>
where
    K: MutexKind,
{
    cache: Cache<D, K>,
    free_map: FreeMap<K::Lock<Bitmap>>,
    inodes: InodeTable<K>,
}

impl<D, K> FsShared<D, K>
where
    D: BlockDevice<SECTOR_SIZE>,
    D::Error: fmt::Debug,
    K: MutexKind,
{
    pub(crate) fn io(&self) -> &impl SectorIo {
        &self.cache
    }
}

fn holds_reserved_sectors(num_sectors: usize) -> bool {
    SectorNo::new(FREE_MAP_SECTOR.max(ROOT_DIR_SECTOR)).as_index() < num_sectors
}

/// A mounted file system.
pub struct FileSystem<D, K>
where
    D: BlockDevice<SECTOR_SIZE>,
    D::Error: fmt::Debug,
    K: MutexKind,
{
    shared: Arc<FsShared<D, K>>,
}

impl<D, K> FileSystem<D, K>
where
    D: BlockDevice<SECTOR_SIZE>,
    D::Error: fmt::Debug,
    K: MutexKind,
{
    fn new(device: D, config: &FsConfig) -> Self {
        let num_sectors = device.num_blocks();
        Self {
            shared: Arc::new(FsShared {
                cache: Cache::<D, K>::new(device, &config.cache),
                free_map: FreeMap::new(num_sectors),
                inodes: InodeTable::new(),
            }),
        }
    }

    /// Creates an empty file system on `device`.
    ///
    /// Writes the free map inode and an empty root directory inode, and
    /// returns the file system mounted.
    pub fn format(device: D, config: &FsConfig) -> Result<Self, FsError> {
        let num_sectors = device.num_blocks();
        if !holds_reserved_sectors(num_sectors) {
            return Err(FsError::NoSpace);
        }
        log::info!("formatting {num_sectors} sectors");

        let fs = Self::new(device, config);
        let io = fs.shared.io();
        let free_map = &fs.shared.free_map;
        let free_map_sector = SectorNo::new(FREE_MAP_SECTOR);
        let root = SectorNo::new(ROOT_DIR_SECTOR);
        free_map.reserve(free_map_sector);
        free_map.reserve(root);
        inode::create(io, free_map, free_map_sector, free_map.byte_len(), false, root)?;
        inode::create(io, free_map, root, 0, true, root)?;
        fs.sync()?;
        Ok(fs)
    }

    /// Mounts the file system stored on `device`.
    pub fn mount(device: D, config: &FsConfig) -> Result<Self, FsError> {
        let num_sectors = device.num_blocks();
        if !holds_reserved_sectors(num_sectors) {
            return Err(FsError::NotFormatted);
        }

        let fs = Self::new(device, config);
        let not_formatted = |e| match e {
            FsError::NotAnInode(_) => FsError::NotFormatted,
            e => e,
        };
        let file = fs
            .open(SectorNo::new(FREE_MAP_SECTOR))
            .map_err(not_formatted)?;
        let mut bytes = vec![0; fs.shared.free_map.byte_len()];
        if file.length() != bytes.len() {
            log::warn!(
                "free map is {} bytes, expected {} for {num_sectors} sectors",
                file.length(),
                bytes.len()
            );
            return Err(FsError::NotFormatted);
        }
        file.read_at(&mut bytes, 0)?;
        file.close()?;
        fs.shared.free_map.load_bytes(&bytes);
        fs.root().map_err(not_formatted)?.close()?;

        log::info!(
            "mounted {num_sectors} sectors, {} free",
            fs.shared.free_map.free_count()
        );
        Ok(fs)
    }

    /// Creates an inode of `length` zero bytes and returns its sector.
    pub fn create(&self, length: usize, is_dir: bool, parent: SectorNo) -> Result<SectorNo, FsError> {
        let free_map = &self.shared.free_map;
        let sector = free_map.allocate(1).ok_or(FsError::NoSpace)?;
        if let Err(e) = inode::create(self.shared.io(), free_map, sector, length, is_dir, parent) {
            free_map.release(sector, 1);
            return Err(e);
        }
        Ok(sector)
    }

    /// Opens the inode stored at `sector`.
    pub fn open(&self, sector: SectorNo) -> Result<Inode<D, K>, FsError> {
        let node = self.shared.inodes.open(self.shared.io(), sector)?;
        Ok(Inode::new(Arc::clone(&self.shared), node))
    }

    /// Opens the root directory inode.
    pub fn root(&self) -> Result<Inode<D, K>, FsError> {
        self.open(SectorNo::new(ROOT_DIR_SECTOR))
    }

    /// Returns the number of free sectors.
    #[must_use]
    pub fn free_sectors(&self) -> usize {
        self.shared.free_map.free_count()
    }

    /// Returns the number of inodes with at least one open handle.
    #[must_use]
    pub fn open_inodes(&self) -> usize {
        self.shared.inodes.len()
    }

    #[must_use]
    pub fn cache(&self) -> &Cache<D, K> {
        &self.shared.cache
    }

    /// Stores the free map and writes every dirty sector to the device.
    pub fn sync(&self) -> Result<(), FsError> {
        let bytes = self.shared.free_map.to_bytes();
        let file = self.open(SectorNo::new(FREE_MAP_SECTOR))?;
        let written = file.write_at(&bytes, 0)?;
        file.close()?;
        assert_eq!(written, bytes.len(), "free map file is write-protected");
        self.shared.io().flush()
    }

    /// Syncs the file system and unmounts it.
    pub fn shutdown(self) -> Result<(), FsError> {
        let open = self.open_inodes();
        if open > 0 {
            log::warn!("shutting down with {open} open inodes");
        }
        self.sync()?;
        log::info!("shut down, cache stats {:?}", self.shared.cache.stats());
        Ok(())
    }
}
