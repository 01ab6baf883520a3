//! Mapping of file blocks to disk sectors.
//!
//! Data sectors are taken from a per-inode allocation group of
//! [`BLOCKS_PER_GROUP`] contiguous sectors and are handed out in order, so a
//! sequentially growing file stays mostly contiguous. `next_block` and
//! `group_blocks_free` of the [`DiskInode`] record the unused tail of the
//! current group. Index blocks are allocated one sector at a time.
//!
//! Removing sectors walks the same path backwards: each data sector is given
//! back to the group, and once the group is whole again it is returned to the
//! allocator. Since groups are always exhausted before the next one is taken,
//! the sector being removed is always the one just before `next_block`.

use arrayvec::ArrayVec;
use dataview::PodMethods as _;
use free_map::SectorAllocator;
use pintfs_params::BLOCKS_PER_GROUP;
use pintfs_types::{
    DOUBLY_INDIRECT_SLOT, DiskInode, INDIRECT_SLOT, IndirectBlock, Location, MAX_FILE_SIZE,
    SECTOR_SIZE, SectorNo, bytes_to_sectors,
};

use crate::{FsError, io::SectorIo};

/// Returns the sector holding byte `offset`, or `None` past the end of file.
pub(crate) fn byte_to_sector<Io>(
    io: &Io,
    disk: &DiskInode,
    offset: usize,
) -> Result<Option<SectorNo>, FsError>
where
    Io: SectorIo,
{
    if offset >= disk.length() {
        return Ok(None);
    }
    block_sector(io, disk, offset / SECTOR_SIZE)
}

/// Returns the sector of data block `vblock`, or `None` if it is not allocated.
pub(crate) fn block_sector<Io>(
    io: &Io,
    disk: &DiskInode,
    vblock: usize,
) -> Result<Option<SectorNo>, FsError>
where
    Io: SectorIo,
{
    if vblock >= disk.blocks_used() {
        return Ok(None);
    }
    let Some(location) = Location::of(vblock) else {
        return Ok(None);
    };
    let sector = match location {
        Location::Direct(i) => disk.block(i),
        Location::Indirect(i) => match disk.block(INDIRECT_SLOT) {
            Some(indirect) => read_ptr(io, indirect, i)?,
            None => None,
        },
        Location::DoublyIndirect(outer, inner) => match disk.block(DOUBLY_INDIRECT_SLOT) {
            Some(doubly) => match read_ptr(io, doubly, outer)? {
                Some(indirect) => read_ptr(io, indirect, inner)?,
                None => None,
            },
            None => None,
        },
    };
    log::trace!("block {vblock} -> sector {sector:?}");
    Ok(sector)
}

fn read_ptr<Io>(io: &Io, index_block: SectorNo, i: usize) -> Result<Option<SectorNo>, FsError>
where
    Io: SectorIo,
{
    Ok(io.read_pod::<IndirectBlock>(index_block)?.get(i))
}

fn write_ptr<Io>(io: &Io, index_block: SectorNo, i: usize, sector: SectorNo) -> Result<(), FsError>
where
    Io: SectorIo,
{
    let mut block = io.read_pod::<IndirectBlock>(index_block)?;
    block.set(i, Some(sector));
    io.write_pod(index_block, &block)
}

/// Sectors obtained by one `append_sector` call and not linked yet.
#[derive(Default)]
struct Reserved {
    group: Option<SectorNo>,
    indirect: Option<SectorNo>,
    doubly: Option<SectorNo>,
}

impl Reserved {
    fn index_blocks(&self) -> impl Iterator<Item = SectorNo> {
        self.indirect.into_iter().chain(self.doubly)
    }

    fn release<A>(self, alloc: &A)
    where
        A: SectorAllocator,
    {
        for sector in self.index_blocks() {
            alloc.release(sector, 1);
        }
        if let Some(group) = self.group {
            alloc.release(group, BLOCKS_PER_GROUP);
        }
    }
}

/// Attaches one zero-filled data sector after the last one of the inode.
///
/// On failure every sector obtained so far is released and `disk` is left
/// unchanged.
pub(crate) fn append_sector<Io, A>(io: &Io, alloc: &A, disk: &mut DiskInode) -> Result<(), FsError>
where
    Io: SectorIo,
    A: SectorAllocator,
{
    let vblock = disk.blocks_used();
    let Some(location) = Location::of(vblock) else {
        return Err(FsError::FileTooLarge);
    };

    let mut reserved = Reserved::default();
    let (data, group_free) = match (disk.group_blocks_free(), disk.next_block()) {
        (0, _) => {
            let group = alloc.allocate(BLOCKS_PER_GROUP).ok_or(FsError::NoSpace)?;
            reserved.group = Some(group);
            (group, BLOCKS_PER_GROUP)
        }
        (free, Some(next)) => (next, free),
        (free, None) => panic!("allocation group with {free} free sectors has no cursor"),
    };

    // the outer index block of a doubly-indirect entry is allocated
    // separately from the inner one
    let (need_indirect, need_doubly) = match location {
        Location::Direct(_) => (false, false),
        Location::Indirect(_) => (disk.block(INDIRECT_SLOT).is_none(), false),
        Location::DoublyIndirect(_, inner) => {
            (inner == 0, disk.block(DOUBLY_INDIRECT_SLOT).is_none())
        }
    };
    if need_indirect {
        reserved.indirect = alloc.allocate(1);
    }
    if need_doubly {
        reserved.doubly = alloc.allocate(1);
    }
    if (need_indirect && reserved.indirect.is_none()) || (need_doubly && reserved.doubly.is_none())
    {
        reserved.release(alloc);
        return Err(FsError::NoSpace);
    }

    if let Err(e) = link(io, disk, location, data, &reserved) {
        reserved.release(alloc);
        return Err(e);
    }

    match location {
        Location::Direct(i) => disk.set_block(i, Some(data)),
        Location::Indirect(_) => {
            if let Some(indirect) = reserved.indirect {
                disk.set_block(INDIRECT_SLOT, Some(indirect));
            }
        }
        Location::DoublyIndirect(..) => {
            if let Some(doubly) = reserved.doubly {
                disk.set_block(DOUBLY_INDIRECT_SLOT, Some(doubly));
            }
        }
    }
    disk.set_blocks_used(vblock + 1);
    let group_free = group_free - 1;
    disk.set_group_blocks_free(group_free);
    disk.set_next_block((group_free > 0).then(|| data.offset(1)));
    log::trace!("append block {vblock} at sector {data}");
    Ok(())
}

/// Zero-fills the new sectors and writes the pointers that live in index
/// blocks. Pointers stored in the inode itself are left to the caller.
fn link<Io>(
    io: &Io,
    disk: &DiskInode,
    location: Location,
    data: SectorNo,
    reserved: &Reserved,
) -> Result<(), FsError>
where
    Io: SectorIo,
{
    io.zero(data)?;
    for sector in reserved.index_blocks() {
        io.write_pod(sector, &IndirectBlock::zeroed())?;
    }

    match location {
        Location::Direct(_) => {}
        Location::Indirect(i) => {
            let Some(indirect) = reserved.indirect.or_else(|| disk.block(INDIRECT_SLOT)) else {
                panic!("indirect block missing for entry {i}");
            };
            write_ptr(io, indirect, i, data)?;
        }
        Location::DoublyIndirect(outer, inner) => {
            let Some(doubly) = reserved.doubly.or_else(|| disk.block(DOUBLY_INDIRECT_SLOT))
            else {
                panic!("doubly-indirect block missing for entry {outer}");
            };
            let indirect = match reserved.indirect {
                Some(indirect) => {
                    write_ptr(io, doubly, outer, indirect)?;
                    indirect
                }
                None => {
                    let Some(indirect) = read_ptr(io, doubly, outer)? else {
                        panic!("indirect block {outer} of sector {doubly} missing");
                    };
                    indirect
                }
            };
            write_ptr(io, indirect, inner, data)?;
        }
    }
    Ok(())
}

/// Detaches the last data sector of the inode.
///
/// The data sector goes back to the allocation group before any index block
/// that became empty is released.
///
/// # Panics
///
/// Panics if the inode has no data sector, or if an index block on the path
/// to its last sector is missing.
pub(crate) fn pop_sector<Io, A>(io: &Io, alloc: &A, disk: &mut DiskInode) -> Result<(), FsError>
where
    Io: SectorIo,
    A: SectorAllocator,
{
    let used = disk.blocks_used();
    assert!(used > 0, "no sector to remove");
    let vblock = used - 1;
    let Some(location) = Location::of(vblock) else {
        panic!("block count {used} exceeds the file size limit");
    };

    // index blocks left empty, with the inode slot pointing at them
    let mut emptied = ArrayVec::<(Option<usize>, SectorNo), 2>::new();
    let data = match location {
        Location::Direct(i) => {
            let data = disk.block(i);
            disk.set_block(i, None);
            data
        }
        Location::Indirect(i) => {
            let Some(indirect) = disk.block(INDIRECT_SLOT) else {
                panic!("block {vblock} is in use but there is no indirect block");
            };
            if i == 0 {
                emptied.push((Some(INDIRECT_SLOT), indirect));
            }
            read_ptr(io, indirect, i)?
        }
        Location::DoublyIndirect(outer, inner) => {
            let Some(doubly) = disk.block(DOUBLY_INDIRECT_SLOT) else {
                panic!("block {vblock} is in use but there is no doubly-indirect block");
            };
            let Some(indirect) = read_ptr(io, doubly, outer)? else {
                panic!("block {vblock} is in use but indirect block {outer} is missing");
            };
            if inner == 0 {
                emptied.push((None, indirect));
                if outer == 0 {
                    emptied.push((Some(DOUBLY_INDIRECT_SLOT), doubly));
                }
            }
            read_ptr(io, indirect, inner)?
        }
    };
    let Some(data) = data else {
        panic!("block {vblock} within the file has no sector");
    };

    let free = disk.group_blocks_free() + 1;
    if let Some(next) = disk.next_block() {
        debug_assert_eq!(data.offset(1), next);
    }
    if free == BLOCKS_PER_GROUP {
        alloc.release(data, BLOCKS_PER_GROUP);
        disk.set_group_blocks_free(0);
        disk.set_next_block(None);
    } else {
        disk.set_group_blocks_free(free);
        disk.set_next_block(Some(data));
    }

    for (slot, sector) in emptied {
        alloc.release(sector, 1);
        if let Some(slot) = slot {
            disk.set_block(slot, None);
        }
    }
    disk.set_blocks_used(vblock);
    log::trace!("pop block {vblock} from sector {data}");
    Ok(())
}

/// Grows the inode to `length` bytes, attaching zero-filled sectors as needed.
///
/// Either all needed sectors are attached or none is. The length never
/// shrinks.
pub(crate) fn extend_to<Io, A>(
    io: &Io,
    alloc: &A,
    disk: &mut DiskInode,
    length: usize,
) -> Result<(), FsError>
where
    Io: SectorIo,
    A: SectorAllocator,
{
    if length > MAX_FILE_SIZE {
        return Err(FsError::FileTooLarge);
    }
    let before = disk.blocks_used();
    let target = bytes_to_sectors(length);
    while disk.blocks_used() < target {
        if let Err(e) = append_sector(io, alloc, disk) {
            log::warn!(
                "extending to {length} bytes failed at block {}: {e}",
                disk.blocks_used()
            );
            if let Err(undo) = shrink_to(io, alloc, disk, before) {
                log::error!("rolling back extension failed: {undo}");
            }
            return Err(e);
        }
    }
    if length > disk.length() {
        disk.set_length(length);
    }
    Ok(())
}

fn shrink_to<Io, A>(io: &Io, alloc: &A, disk: &mut DiskInode, blocks: usize) -> Result<(), FsError>
where
    Io: SectorIo,
    A: SectorAllocator,
{
    while disk.blocks_used() > blocks {
        pop_sector(io, alloc, disk)?;
    }
    Ok(())
}

/// Releases every data and index sector of the inode.
pub(crate) fn release_all<Io, A>(io: &Io, alloc: &A, disk: &mut DiskInode) -> Result<(), FsError>
where
    Io: SectorIo,
    A: SectorAllocator,
{
    shrink_to(io, alloc, disk, 0)?;
    disk.set_length(0);
    Ok(())
}
