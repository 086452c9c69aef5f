//! Boot-time layout: validates the device geometry once and hands out
//! contiguous page ranges in declaration order.

use crate::error::Error;
use crate::platform::Platform;
use crate::{ConfigStore, Settings};

/// Partitions a flash can be split into.
pub const MAX_PARTITIONS: u8 = 3;

/// Assigns base pages to up to [`MAX_PARTITIONS`] partitions, front to back.
#[derive(Debug)]
pub struct Partitioner {
    next_base: u32,
    flash_pages: u32,
    sector_pages: u32,
    claims: u8,
}

impl Partitioner {
    /// Checks the device geometry: page size a power of two within
    /// 256..=32768 bytes, sector and flash sizes powers of two, the flash
    /// larger than one sector and at most 4 GiB.
    pub fn new<T: Platform>() -> Result<Self, Error> {
        let page_size = T::PAGE_SIZE;
        let sector_pages = T::SECTOR_PAGES;
        let flash_pages = T::FLASH_PAGES;
        if !page_size.is_power_of_two() || !(256..=32768).contains(&page_size) {
            return Err(Error::InvalidGeometry);
        }
        if !sector_pages.is_power_of_two()
            || !flash_pages.is_power_of_two()
            || flash_pages <= sector_pages
        {
            return Err(Error::InvalidGeometry);
        }
        if flash_pages as u64 * page_size as u64 > 1u64 << 32 {
            return Err(Error::InvalidGeometry);
        }
        Ok(Self {
            next_base: 0,
            flash_pages: flash_pages as u32,
            sector_pages: sector_pages as u32,
            claims: 0,
        })
    }

    /// Reserves `pages` pages and returns their base page. Claims must be
    /// whole sectors; a zero-page claim is legal and holds a slot's place in
    /// the declaration order.
    pub fn claim(&mut self, pages: u32) -> Result<u32, Error> {
        if self.claims >= MAX_PARTITIONS {
            return Err(Error::TooManyPartitions);
        }
        if !pages.is_multiple_of(self.sector_pages) {
            return Err(Error::InvalidPartitionSize);
        }
        if pages > self.flash_pages - self.next_base {
            return Err(Error::InvalidPartitionSize);
        }
        self.claims += 1;
        let base = self.next_base;
        self.next_base += pages;
        Ok(base)
    }
}

/// Claims a partition, builds the store on it and runs the boot-time load.
///
/// The load verdict comes back next to the store instead of failing the
/// mount: after a [`Error::BadCopy1`]-class report the store still holds the
/// surviving copy, and the host decides whether to heal it
/// ([`ConfigStore::make_all_dirty`] + [`ConfigStore::commit`]), halt, or
/// carry on.
pub fn mount_config<T: Platform>(
    partitioner: &mut Partitioner,
    hal: T,
    settings: Settings,
) -> Result<(ConfigStore<T>, Result<(), Error>), Error> {
    let base_page = partitioner.claim(settings.pages)?;
    let mut store = ConfigStore::new(hal, base_page, settings)?;
    let loaded = store.read_all();
    Ok((store, loaded))
}
