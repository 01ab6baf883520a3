//! Inodes.
//!
//! An inode occupies one sector holding a [`DiskInode`]. Its data is reached
//! through direct, indirect and doubly-indirect pointers (see [`block_map`]).
//!
//! Every open inode has a single in-memory [`OpenInode`], shared by all
//! [`Inode`] handles to it through the [`InodeTable`]. The inode lock
//! serializes reads, writes and metadata changes of one inode and is held for
//! the whole of a `read_at` or `write_at` call.

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use block_io::BlockDevice;
use free_map::SectorAllocator;
use mutex_api::{Mutex, MutexKind};
use pintfs_types::{DiskInode, MAX_FILE_SIZE, SECTOR_SIZE, SectorNo};

pub(crate) use self::table::InodeTable;
use crate::{FsError, FsShared, io::SectorIo};

pub(crate) mod block_map;
mod table;

/// In-memory state of an open inode, shared by all its handles.
pub(crate) struct OpenInode<K>
where
    K: MutexKind,
{
    pub(crate) sector: SectorNo,
    /// Number of handles. Only changed under the table lock.
    pub(crate) open_count: AtomicUsize,
    pub(crate) state: K::Lock<InodeState>,
}

pub(crate) struct InodeState {
    pub(crate) removed: bool,
    pub(crate) deny_write_count: usize,
    pub(crate) disk: DiskInode,
}

impl InodeState {
    fn deny_write(&mut self, open_count: usize) {
        self.deny_write_count += 1;
        assert!(
            self.deny_write_count <= open_count,
            "more write denials than openers"
        );
    }

    pub(crate) fn allow_write(&mut self) {
        assert!(self.deny_write_count > 0, "allow_write without deny_write");
        self.deny_write_count -= 1;
    }
}

/// Initializes an inode of `length` bytes at `sector`.
///
/// The data sectors are allocated and zero-filled up front. On failure
/// nothing stays allocated, except `sector` itself which belongs to the
/// caller.
pub(crate) fn create<Io, A>(
    io: &Io,
    alloc: &A,
    sector: SectorNo,
    length: usize,
    is_dir: bool,
    parent: SectorNo,
) -> Result<(), FsError>
where
    Io: SectorIo,
    A: SectorAllocator,
{
    if length > MAX_FILE_SIZE {
        return Err(FsError::FileTooLarge);
    }
    let mut disk = DiskInode::new(0, is_dir, parent);
    block_map::extend_to(io, alloc, &mut disk, length)?;
    if let Err(e) = io.write_pod(sector, &disk) {
        if let Err(undo) = block_map::release_all(io, alloc, &mut disk) {
            log::error!("releasing blocks of unwritten inode {sector} failed: {undo}");
        }
        return Err(e);
    }
    log::debug!(
        "created {} inode {sector} ({length} bytes)",
        if is_dir { "directory" } else { "file" }
    );
    Ok(())
}

/// A handle to an open inode.
///
/// Handles are closed with [`Inode::close`]. A handle dropped without being
/// closed is closed on drop, logging any error.
pub struct Inode<D, K>
where
    D: BlockDevice<SECTOR_SIZE>,
    D::Error: fmt::Debug,
    K: MutexKind,
{
    fs: Arc<FsShared<D, K>>,
    node: Arc<OpenInode<K>>,
    closed: bool,
    denies_write: bool,
}

impl<D, K> Inode<D, K>
where
    D: BlockDevice<SECTOR_SIZE>,
    D::Error: fmt::Debug,
    K: MutexKind,
{
    pub(crate) fn new(fs: Arc<FsShared<D, K>>, node: Arc<OpenInode<K>>) -> Self {
        Self {
            fs,
            node,
            closed: false,
            denies_write: false,
        }
    }

    /// Returns the sector the inode is stored at.
    #[must_use]
    pub fn inumber(&self) -> SectorNo {
        self.node.sector
    }

    /// Opens another handle to the same inode.
    pub fn reopen(&self) -> Result<Self, FsError> {
        let node = self.fs.inodes.open(self.fs.io(), self.node.sector)?;
        debug_assert!(Arc::ptr_eq(&node, &self.node));
        Ok(Self::new(Arc::clone(&self.fs), node))
    }

    /// Closes the handle.
    ///
    /// Closing the last handle of a removed inode frees its sectors.
    pub fn close(mut self) -> Result<(), FsError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), FsError> {
        assert!(!self.closed);
        self.closed = true;
        let denies_write = core::mem::take(&mut self.denies_write);
        self.fs
            .inodes
            .close(self.fs.io(), &self.fs.free_map, &self.node, denies_write)
    }

    /// Marks the inode to be deleted when its last handle is closed.
    pub fn remove(&self) {
        self.node.state.lock().removed = true;
        log::debug!("inode {} marked removed", self.node.sector);
    }

    /// Returns `true` if the inode was removed.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.node.state.lock().removed
    }

    /// Reads from the inode at `offset` into `buf`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` if
    /// the end of file is reached.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let state = self.node.state.lock();
        let io = self.fs.io();
        let length = state.disk.length();
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min(length - offset);
        let mut done = 0;
        while done < len {
            let pos = offset + done;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (len - done).min(SECTOR_SIZE - sector_ofs);
            let Some(sector) = block_map::byte_to_sector(io, &state.disk, pos)? else {
                panic!("offset {pos} within length {length} has no sector");
            };
            io.read(sector, sector_ofs, &mut buf[done..][..chunk])?;
            done += chunk;
        }

        let ahead = (offset + len).next_multiple_of(SECTOR_SIZE);
        match block_map::byte_to_sector(io, &state.disk, ahead) {
            Ok(Some(sector)) => {
                if let Err(e) = io.prefetch(sector) {
                    log::debug!("read-ahead of sector {sector} failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => log::debug!("read-ahead past offset {ahead} failed: {e}"),
        }
        Ok(len)
    }

    /// Writes `buf` to the inode at `offset`, growing the inode if needed.
    ///
    /// Returns the number of bytes written, which is `0` while writes are
    /// denied. Bytes between the old end of file and `offset` read as zeros.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        let mut state = self.node.state.lock();
        if state.deny_write_count > 0 {
            log::debug!("write to inode {} denied", self.node.sector);
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let io = self.fs.io();
        let end = offset
            .checked_add(buf.len())
            .ok_or(FsError::FileTooLarge)?;
        if end > state.disk.length() {
            block_map::extend_to(io, &self.fs.free_map, &mut state.disk, end)?;
            io.write_pod(self.node.sector, &state.disk)?;
            log::debug!("inode {} extended to {end} bytes", self.node.sector);
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - done).min(SECTOR_SIZE - sector_ofs);
            let Some(sector) = block_map::byte_to_sector(io, &state.disk, pos)? else {
                panic!("offset {pos} not covered after extending to {end}");
            };
            io.write(sector, sector_ofs, &buf[done..][..chunk])?;
            done += chunk;
        }
        Ok(done)
    }

    /// Denies writes to the inode until this handle allows them again or is
    /// closed.
    ///
    /// Does nothing if this handle already denies writes.
    pub fn deny_write(&mut self) {
        if !self.denies_write {
            let open_count = self.node.open_count.load(Ordering::Relaxed);
            self.node.state.lock().deny_write(open_count);
            self.denies_write = true;
        }
    }

    /// Lifts the write denial made through this handle.
    ///
    /// Does nothing if this handle does not deny writes.
    pub fn allow_write(&mut self) {
        if self.denies_write {
            self.node.state.lock().allow_write();
            self.denies_write = false;
        }
    }

    /// Returns the length of the inode's data in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.node.state.lock().disk.length()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.node.state.lock().disk.is_dir()
    }

    /// Returns the sector of the parent directory.
    #[must_use]
    pub fn parent(&self) -> SectorNo {
        self.node.state.lock().disk.parent()
    }

    /// Returns the number of handles open on the inode.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.node.open_count.load(Ordering::Relaxed)
    }
}

impl<D, K> Drop for Inode<D, K>
where
    D: BlockDevice<SECTOR_SIZE>,
    D::Error: fmt::Debug,
    K: MutexKind,
{
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.release() {
            log::error!("closing inode {} failed: {e}", self.node.sector);
        }
    }
}

impl<D, K> fmt::Debug for Inode<D, K>
where
    D: BlockDevice<SECTOR_SIZE>,
    D::Error: fmt::Debug,
    K: MutexKind,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("sector", &self.node.sector)
            .field("denies_write", &self.denies_write)
            .finish_non_exhaustive()
    }
}
