use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};

use dataview::PodMethods as _;
use free_map::SectorAllocator;
use mutex_api::{Mutex, MutexKind};
use pintfs_types::{DiskInode, SectorNo};

use super::{InodeState, OpenInode, block_map};
use crate::{FsError, io::SectorIo};

/// Table of open inodes.
///
/// Keeps one [`OpenInode`] per sector, so every opener of a file shares the
/// same in-memory state. The table lock is always taken before an inode's own
/// lock, and is only held across an inode lock by the last close, when no other
/// handle can hold it.
pub(crate) struct InodeTable<K>
where
    K: MutexKind,
{
    map: K::Lock<BTreeMap<SectorNo, Arc<OpenInode<K>>>>,
}

impl<K> InodeTable<K>
where
    K: MutexKind,
{
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the number of open inodes.
    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Opens the inode stored at `sector`, sharing an already open one.
    pub(crate) fn open<Io>(&self, io: &Io, sector: SectorNo) -> Result<Arc<OpenInode<K>>, FsError>
    where
        Io: SectorIo,
    {
        let mut map = self.map.lock();
        if let Some(node) = map.get(&sector) {
            node.open_count.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(node));
        }

        let disk = io.read_pod::<DiskInode>(sector)?;
        if !disk.is_valid() {
            log::warn!("sector {sector} has magic {:#x}", disk.magic());
            return Err(FsError::NotAnInode(sector));
        }
        log::debug!("open inode {sector} ({} bytes)", disk.length());
        let node = Arc::new(OpenInode {
            sector,
            open_count: AtomicUsize::new(1),
            state: Mutex::new(InodeState {
                removed: false,
                deny_write_count: 0,
                disk,
            }),
        });
        map.insert(sector, Arc::clone(&node));
        Ok(node)
    }

    /// Drops one reference to `node`.
    ///
    /// The last close takes the inode out of the table and, if it was
    /// removed, releases its data, index and inode sectors. The inode sector
    /// is cleared first so it no longer opens as an inode, and the entry stays
    /// in the table until the sectors are released.
    pub(crate) fn close<Io, A>(
        &self,
        io: &Io,
        alloc: &A,
        node: &OpenInode<K>,
        denies_write: bool,
    ) -> Result<(), FsError>
    where
        Io: SectorIo,
        A: SectorAllocator,
    {
        if denies_write {
            node.state.lock().allow_write();
        }

        let mut map = self.map.lock();
        let count = node.open_count.load(Ordering::Relaxed);
        assert!(count > 0, "inode {} closed too often", node.sector);
        node.open_count.store(count - 1, Ordering::Relaxed);
        if count > 1 {
            return Ok(());
        }

        let mut state = node.state.lock();
        let res = if state.removed {
            Self::delete(io, alloc, node.sector, &mut state)
        } else {
            Ok(())
        };
        map.remove(&node.sector);
        log::debug!("inode {} closed", node.sector);
        res
    }

    fn delete<Io, A>(
        io: &Io,
        alloc: &A,
        sector: SectorNo,
        state: &mut InodeState,
    ) -> Result<(), FsError>
    where
        Io: SectorIo,
        A: SectorAllocator,
    {
        io.write_pod(sector, &DiskInode::zeroed())?;
        block_map::release_all(io, alloc, &mut state.disk)?;
        alloc.release(sector, 1);
        log::debug!("inode {sector} deleted");
        Ok(())
    }
}
