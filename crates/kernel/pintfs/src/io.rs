use core::fmt;

use block_io::{BlockDevice, BufferCache, SlotData, SlotTable};
use dataview::{Pod, PodMethods as _};
use mutex_api::Mutex;
use pintfs_types::{SECTOR_SIZE, SectorNo};

use crate::FsError;

/// Sector-granular I/O as seen by the inode layer.
pub trait SectorIo {
    /// Reads `buf.len()` bytes at `offset` of `sector`.
    fn read(&self, sector: SectorNo, offset: usize, buf: &mut [u8]) -> Result<(), FsError>;

    /// Writes `buf` at `offset` of `sector`.
    fn write(&self, sector: SectorNo, offset: usize, buf: &[u8]) -> Result<(), FsError>;

    /// Hints that `sector` will be read soon.
    fn prefetch(&self, _sector: SectorNo) -> Result<(), FsError> {
        Ok(())
    }

    /// Persists every pending write.
    fn flush(&self) -> Result<(), FsError>;

    /// Reads a whole sector as `T`.
    fn read_pod<T>(&self, sector: SectorNo) -> Result<T, FsError>
    where
        T: Pod,
    {
        let mut value = T::zeroed();
        self.read(sector, 0, value.as_bytes_mut())?;
        Ok(value)
    }

    /// Writes `value` over a whole sector.
    fn write_pod<T>(&self, sector: SectorNo, value: &T) -> Result<(), FsError>
    where
        T: Pod,
    {
        self.write(sector, 0, value.as_bytes())
    }

    /// Fills a sector with zeros.
    fn zero(&self, sector: SectorNo) -> Result<(), FsError> {
        self.write(sector, 0, &[0; SECTOR_SIZE])
    }
}

fn io_error<E>(sector: Option<SectorNo>) -> impl FnOnce(E) -> FsError
where
    E: fmt::Debug,
{
    move |e| {
        match sector {
            Some(sector) => log::error!("I/O error on sector {sector}: {e:?}"),
            None => log::error!("I/O error while flushing: {e:?}"),
        }
        FsError::Io
    }
}

impl<Device, PoolMutex, SlotMutex> SectorIo for BufferCache<Device, PoolMutex, SlotMutex>
where
    Device: BlockDevice<SECTOR_SIZE>,
    Device::Error: fmt::Debug,
    PoolMutex: Mutex<Data = SlotTable>,
    SlotMutex: Mutex<Data = SlotData<SECTOR_SIZE>>,
{
    fn read(&self, sector: SectorNo, offset: usize, buf: &mut [u8]) -> Result<(), FsError> {
        Self::read(self, sector.as_index(), offset, buf).map_err(io_error(Some(sector)))
    }

    fn write(&self, sector: SectorNo, offset: usize, buf: &[u8]) -> Result<(), FsError> {
        Self::write(self, sector.as_index(), offset, buf).map_err(io_error(Some(sector)))
    }

    fn prefetch(&self, sector: SectorNo) -> Result<(), FsError> {
        Self::prefetch(self, sector.as_index()).map_err(io_error(Some(sector)))
    }

    fn flush(&self) -> Result<(), FsError> {
        self.flush_all().map_err(io_error(None))
    }
}
