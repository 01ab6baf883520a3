//! On-disk data types of the pintfs file system.
//!
//! The disk is an array of [`SECTOR_SIZE`]-byte sectors. Every file is
//! described by one inode sector ([`DiskInode`]) that points at its data
//! sectors:
//!
//! | slot of `blocks`          | points to                                              |
//! |---------------------------|--------------------------------------------------------|
//! | `0..NUM_DIRECT`           | data sectors 0 to 11                                    |
//! | [`INDIRECT_SLOT`]         | an [`IndirectBlock`] of data sectors                    |
//! | [`DOUBLY_INDIRECT_SLOT`]  | an [`IndirectBlock`] of [`IndirectBlock`]s              |
//! | [`TRIPLY_INDIRECT_SLOT`]  | reserved, always zero                                   |
//!
//! Sector number `0` never holds file data, so a zero pointer means
//! "not allocated".

#![no_std]

use core::fmt;

use dataview::{Pod, PodMethods as _};

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of block pointers stored in an inode.
pub const N_BLOCKS: usize = 15;

/// Number of data sectors directly referenced by an inode.
pub const NUM_DIRECT: usize = N_BLOCKS - 3;

/// Index of the singly-indirect pointer in [`DiskInode`] blocks.
pub const INDIRECT_SLOT: usize = NUM_DIRECT;

/// Index of the doubly-indirect pointer in [`DiskInode`] blocks.
pub const DOUBLY_INDIRECT_SLOT: usize = NUM_DIRECT + 1;

/// Index of the (unsupported) triply-indirect pointer.
pub const TRIPLY_INDIRECT_SLOT: usize = NUM_DIRECT + 2;

/// Number of sector pointers held by one indirect block.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / size_of::<u32>();

/// Maximum number of data sectors a file can reference.
pub const MAX_SECTORS: usize = NUM_DIRECT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Maximum length of a file in bytes.
pub const MAX_FILE_SIZE: usize = MAX_SECTORS * SECTOR_SIZE;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Converts a `usize` to a `u32`.
///
/// # Panics
///
/// Panics if `n` does not fit.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub const fn to_u32(n: usize) -> u32 {
    assert!(n <= u32::MAX as usize);
    n as u32
}

/// Returns the number of sectors needed to hold `len` bytes.
#[must_use]
pub const fn bytes_to_sectors(len: usize) -> usize {
    len.div_ceil(SECTOR_SIZE)
}

/// Represents a disk sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SectorNo {
    /// Creates a new `SectorNo` with the given value.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Returns the value of the sector number.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Converts the sector number to an index.
    #[must_use]
    pub const fn as_index(&self) -> usize {
        self.0 as usize
    }

    /// Returns the sector `n` sectors after this one.
    #[must_use]
    pub const fn offset(self, n: usize) -> Self {
        Self(self.0 + to_u32(n))
    }

    fn from_raw(raw: u32) -> Option<Self> {
        let n = u32::from_le(raw);
        (n != 0).then_some(Self(n))
    }

    fn into_raw(sector: Option<Self>) -> u32 {
        sector.map_or(0, |s| s.0).to_le()
    }
}

/// Position of a data sector inside the pointer tree of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// `blocks[i]` of the inode.
    Direct(usize),
    /// Entry `i` of the singly-indirect block.
    Indirect(usize),
    /// Entry `inner` of the indirect block found at entry `outer` of the
    /// doubly-indirect block.
    DoublyIndirect(usize, usize),
}

impl Location {
    /// Locates the `vblock`-th data sector of a file.
    ///
    /// Returns `None` if `vblock` is beyond [`MAX_SECTORS`].
    #[must_use]
    pub const fn of(vblock: usize) -> Option<Self> {
        if vblock < NUM_DIRECT {
            return Some(Self::Direct(vblock));
        }
        let vblock = vblock - NUM_DIRECT;
        if vblock < PTRS_PER_SECTOR {
            return Some(Self::Indirect(vblock));
        }
        let vblock = vblock - PTRS_PER_SECTOR;
        if vblock < PTRS_PER_SECTOR * PTRS_PER_SECTOR {
            return Some(Self::DoublyIndirect(
                vblock / PTRS_PER_SECTOR,
                vblock % PTRS_PER_SECTOR,
            ));
        }
        None
    }
}

/// On-disk inode.
///
/// All fields are stored little-endian.
#[derive(Pod)]
#[repr(C)]
pub struct DiskInode {
    length: i32,
    magic: u32,
    blocks_used: u32,
    next_block: u32,
    group_blocks_free: u32,
    blocks: [u32; N_BLOCKS],
    is_dir: u32,
    parent: u32,
    unused: [u32; SECTOR_SIZE / 4 - 7 - N_BLOCKS],
}
const _: () = const { assert!(size_of::<DiskInode>() == SECTOR_SIZE) };

impl fmt::Debug for DiskInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskInode")
            .field("length", &self.length())
            .field("magic", &self.magic())
            .field("blocks_used", &self.blocks_used())
            .field("next_block", &self.next_block())
            .field("group_blocks_free", &self.group_blocks_free())
            .field("blocks", &self.blocks.map(u32::from_le))
            .field("is_dir", &self.is_dir())
            .field("parent", &self.parent())
            .finish_non_exhaustive()
    }
}

impl DiskInode {
    /// Creates an empty inode of the given length, kind and parent.
    ///
    /// No sector is attached yet; `blocks_used` is zero.
    ///
    /// # Panics
    ///
    /// Panics if `length` exceeds [`MAX_FILE_SIZE`].
    #[must_use]
    pub fn new(length: usize, is_dir: bool, parent: SectorNo) -> Self {
        assert!(length <= MAX_FILE_SIZE);
        let mut inode = Self::zeroed();
        inode.magic = INODE_MAGIC.to_le();
        inode.set_length(length);
        inode.is_dir = u32::from(is_dir).to_le();
        inode.parent = parent.0.to_le();
        inode
    }

    /// Returns `true` if the magic number identifies an inode.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic() == INODE_MAGIC
    }

    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_le(self.magic)
    }

    /// Returns the file length in bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        usize::try_from(i32::from_le(self.length)).unwrap_or(0)
    }

    /// Sets the file length in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `length` exceeds [`MAX_FILE_SIZE`].
    pub fn set_length(&mut self, length: usize) {
        assert!(length <= MAX_FILE_SIZE);
        self.length = i32::try_from(length).unwrap_or(i32::MAX).to_le();
    }

    /// Returns the number of data sectors attached to the inode.
    #[must_use]
    pub fn blocks_used(&self) -> usize {
        u32::from_le(self.blocks_used) as usize
    }

    pub fn set_blocks_used(&mut self, n: usize) {
        self.blocks_used = to_u32(n).to_le();
    }

    /// Returns the next unused sector of the current allocation group.
    #[must_use]
    pub fn next_block(&self) -> Option<SectorNo> {
        SectorNo::from_raw(self.next_block)
    }

    pub fn set_next_block(&mut self, sector: Option<SectorNo>) {
        self.next_block = SectorNo::into_raw(sector);
    }

    /// Returns the number of unused sectors left in the current allocation group.
    #[must_use]
    pub fn group_blocks_free(&self) -> usize {
        u32::from_le(self.group_blocks_free) as usize
    }

    pub fn set_group_blocks_free(&mut self, n: usize) {
        self.group_blocks_free = to_u32(n).to_le();
    }

    /// Returns the pointer stored in `blocks[slot]`.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= N_BLOCKS`.
    #[must_use]
    pub fn block(&self, slot: usize) -> Option<SectorNo> {
        SectorNo::from_raw(self.blocks[slot])
    }

    /// Stores a pointer in `blocks[slot]`.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= N_BLOCKS`.
    pub fn set_block(&mut self, slot: usize, sector: Option<SectorNo>) {
        self.blocks[slot] = SectorNo::into_raw(sector);
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        u32::from_le(self.is_dir) != 0
    }

    /// Returns the sector of the parent directory's inode.
    #[must_use]
    pub fn parent(&self) -> SectorNo {
        SectorNo(u32::from_le(self.parent))
    }
}

/// Sector holding [`PTRS_PER_SECTOR`] sector pointers.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; PTRS_PER_SECTOR]);
const _: () = const { assert!(size_of::<IndirectBlock>() == SECTOR_SIZE) };

impl IndirectBlock {
    /// Returns the pointer stored at `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= PTRS_PER_SECTOR`.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        SectorNo::from_raw(self.0[i])
    }

    /// Stores a pointer at `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= PTRS_PER_SECTOR`.
    pub fn set(&mut self, i: usize, sector: Option<SectorNo>) {
        self.0[i] = SectorNo::into_raw(sector);
    }
}
