use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use mutex_api::StdMutexKind;
use pintfs::{BlockDevice, Cache, CacheConfig, FileSystem, FsConfig, SECTOR_SIZE};

pub type Fs = FileSystem<MemDisk, StdMutexKind>;
pub type DiskCache = Cache<MemDisk, StdMutexKind>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskError(pub usize);

/// RAM disk whose clones share the same sectors, so a test can inspect what
/// reached the device after handing it to a cache.
#[derive(Clone)]
pub struct MemDisk {
    sectors: Arc<Mutex<Vec<[u8; SECTOR_SIZE]>>>,
    faulty: Arc<Mutex<HashSet<usize>>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl MemDisk {
    pub fn new(num_sectors: usize) -> Self {
        Self::filled(num_sectors, 0)
    }

    /// Creates a disk whose sectors hold `byte` everywhere, standing in for
    /// leftovers of earlier use.
    pub fn filled(num_sectors: usize, byte: u8) -> Self {
        Self {
            sectors: Arc::new(Mutex::new(vec![[byte; SECTOR_SIZE]; num_sectors])),
            faulty: Arc::default(),
            reads: Arc::default(),
            writes: Arc::default(),
        }
    }

    pub fn sector(&self, index: usize) -> [u8; SECTOR_SIZE] {
        self.sectors.lock().unwrap()[index]
    }

    pub fn set_faulty(&self, index: usize, faulty: bool) {
        let mut set = self.faulty.lock().unwrap();
        if faulty {
            set.insert(index);
        } else {
            set.remove(&index);
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice<SECTOR_SIZE> for MemDisk {
    type Error = DiskError;

    fn read(&self, block_index: usize, data: &mut [u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        if self.faulty.lock().unwrap().contains(&block_index) {
            return Err(DiskError(block_index));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        *data = self.sectors.lock().unwrap()[block_index];
        Ok(())
    }

    fn write(&self, block_index: usize, data: &[u8; SECTOR_SIZE]) -> Result<(), Self::Error> {
        if self.faulty.lock().unwrap().contains(&block_index) {
            return Err(DiskError(block_index));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.sectors.lock().unwrap()[block_index] = *data;
        Ok(())
    }

    fn num_blocks(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }
}

pub fn config(num_slots: usize) -> FsConfig {
    FsConfig::default().with_cache(CacheConfig::default().with_num_slots(num_slots))
}

/// Formats a fresh disk and returns it with the mounted file system.
pub fn format(num_sectors: usize, num_slots: usize) -> (MemDisk, Fs) {
    init_logger();
    let disk = MemDisk::new(num_sectors);
    let fs = Fs::format(disk.clone(), &config(num_slots)).unwrap();
    (disk, fs)
}

pub fn cache(disk: &MemDisk, config: CacheConfig) -> DiskCache {
    init_logger();
    DiskCache::new(disk.clone(), &config)
}
