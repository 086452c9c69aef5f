//! The device seam: a page-addressed NOR flash contract plus the host hooks
//! the store reports through.

use crate::error::Error;
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

/// Transport-level failure of a single flash operation. Any of these aborts
/// the store operation in progress and surfaces as [`Error::FlashTransfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiError {
    Busy,
    Timeout,
    Invalid,
    Transfer,
}

/// Everything the store needs from the platform: a paged flash device and
/// two host hooks.
///
/// The device is addressed in pages of `PAGE_SIZE` bytes, erased in sectors
/// of `SECTOR_PAGES` pages. A freshly erased byte reads 0xFF and programming
/// can only clear bits (1→0).
///
/// See `tests/common.rs` for a host-side reference implementation.
pub trait Platform {
    /// Bytes per page, the minimum program unit.
    const PAGE_SIZE: usize;
    /// Pages per sector, the minimum erase unit.
    const SECTOR_PAGES: usize;
    /// Total device capacity in pages.
    const FLASH_PAGES: usize;

    /// Fills `buf[..count * PAGE_SIZE]` with the content of `count`
    /// consecutive pages starting at `start_page`.
    fn read_pages(&mut self, start_page: u32, count: u32, buf: &mut [u8]) -> Result<(), SpiError>;

    /// Programs one page. Only 1→0 bit transitions take effect.
    fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), SpiError>;

    /// Erases one sector to all-0xFF.
    fn erase_sector(&mut self, sector: u32) -> Result<(), SpiError>;

    /// Called right before the store returns one of the fatal [`Error`]
    /// values. The hook may halt, reboot or simply record; the store stays
    /// in the documented state either way.
    fn fatal_error(&mut self, error: Error);

    /// Called when a buffer allocation fails.
    fn bad_alloc(&mut self);
}

impl<T: Platform + ?Sized> Platform for &mut T {
    const PAGE_SIZE: usize = T::PAGE_SIZE;
    const SECTOR_PAGES: usize = T::SECTOR_PAGES;
    const FLASH_PAGES: usize = T::FLASH_PAGES;

    fn read_pages(&mut self, start_page: u32, count: u32, buf: &mut [u8]) -> Result<(), SpiError> {
        (**self).read_pages(start_page, count, buf)
    }

    fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), SpiError> {
        (**self).write_page(page, buf)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), SpiError> {
        (**self).erase_sector(sector)
    }

    fn fatal_error(&mut self, error: Error) {
        (**self).fatal_error(error)
    }

    fn bad_alloc(&mut self) {
        (**self).bad_alloc()
    }
}

/// Mounts a device implementing the `embedded-storage` NOR traits as a paged
/// [`Platform`].
///
/// The page size and total page count are const parameters because the
/// `embedded-storage` traits only expose the erase granularity as a constant;
/// the sector size in pages is derived from `ERASE_SIZE`.
///
/// The hooks log (with the `defmt` feature) and carry on. Implement
/// [`Platform`] directly when the host needs to halt on fatal reports.
pub struct PagedNorFlash<T, const PAGE_SIZE: usize, const FLASH_PAGES: usize> {
    inner: T,
}

impl<T, const PAGE_SIZE: usize, const FLASH_PAGES: usize> PagedNorFlash<T, PAGE_SIZE, FLASH_PAGES>
where
    T: ReadNorFlash + NorFlash,
{
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn release(self) -> T {
        self.inner
    }
}

fn transport_error<E: NorFlashError>(error: E) -> SpiError {
    match error.kind() {
        NorFlashErrorKind::NotAligned | NorFlashErrorKind::OutOfBounds => SpiError::Invalid,
        _ => SpiError::Transfer,
    }
}

impl<T, const PAGE_SIZE: usize, const FLASH_PAGES: usize> Platform
    for PagedNorFlash<T, PAGE_SIZE, FLASH_PAGES>
where
    T: ReadNorFlash + NorFlash,
{
    const PAGE_SIZE: usize = PAGE_SIZE;
    const SECTOR_PAGES: usize = T::ERASE_SIZE / PAGE_SIZE;
    const FLASH_PAGES: usize = FLASH_PAGES;

    fn read_pages(&mut self, start_page: u32, count: u32, buf: &mut [u8]) -> Result<(), SpiError> {
        let bytes = count as usize * PAGE_SIZE;
        self.inner
            .read(start_page * PAGE_SIZE as u32, &mut buf[..bytes])
            .map_err(transport_error)
    }

    fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), SpiError> {
        self.inner
            .write(page * PAGE_SIZE as u32, &buf[..PAGE_SIZE])
            .map_err(transport_error)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), SpiError> {
        let from = sector * (Self::SECTOR_PAGES * PAGE_SIZE) as u32;
        let to = from + (Self::SECTOR_PAGES * PAGE_SIZE) as u32;
        self.inner.erase(from, to).map_err(transport_error)
    }

    fn fatal_error(&mut self, error: Error) {
        #[cfg(feature = "defmt")]
        defmt::error!("fatal config store error: {}", error);
        let _ = error;
    }

    fn bad_alloc(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::error!("config store allocation failure");
    }
}
