use pintfs_types::SectorNo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no free sectors left")]
    NoSpace,
    #[error("file size limit exceeded")]
    FileTooLarge,
    #[error("sector {0} does not hold an inode")]
    NotAnInode(SectorNo),
    #[error("disk is not formatted")]
    NotFormatted,
    #[error("I/O error")]
    Io,
}
