#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod internal;
pub mod partition;
pub mod platform;
mod raw;

extern crate alloc;

pub use crate::error::Error;

use crate::internal::{ConfigItem, PageVerdict, ScanTask};
use crate::platform::Platform;
use crate::raw::{OFFSET_ITEM_DATA, OFFSET_PAGE_ITEMS, UNUSED_VALUE};
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::warn;

/// Number of redundant, page-identical images kept in the partition.
///
/// With two copies the partition is split in half; the first half is copy A,
/// the second copy B. After a clean commit both halves are byte-identical
/// over the live pages, so a torn commit is detected on the next load and
/// the surviving copy wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Copies {
    One = 1,
    Two = 2,
}

impl Copies {
    fn count(self) -> u32 {
        self as u32
    }
}

/// Static shape of one config partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Settings {
    /// Total partition size in pages, across all copies. Each copy must be
    /// a whole number of sectors.
    pub pages: u32,
    pub copies: Copies,
    /// Pages buffered per flash read. More than one page and a whole number
    /// of sectors.
    pub read_ahead_pages: u32,
    /// Capacity of the item table.
    pub max_items: u16,
}

/// A snapshot of the append cursor and cache usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Statistics {
    /// Assigned item ids, `0..item_count`.
    pub item_count: u16,
    /// Lowest page of a copy with room left, or the copy size when full.
    pub first_usable_page: u32,
    /// First free byte within that page.
    pub first_usable_byte: u16,
    /// Pages whose RAM image may differ from flash.
    pub dirty_page_count: u32,
}

/// A configuration partition on paged NOR flash.
///
/// Holds a small set of variable-length binary values addressed by dense
/// integer ids, assigned by [`add`](Self::add) in call order and stable for
/// the life of the partition. All reads come from an in-RAM cache;
/// [`commit`](Self::commit) writes mutated pages back, erasing a sector only
/// when in-place programming cannot express the change.
///
/// Operations that fail with one of the fatal [`Error`] values also report
/// through the platform's `fatal_error` hook first; the store is left in a
/// well-defined state either way (see the per-variant docs on [`Error`]).
pub struct ConfigStore<T: Platform> {
    pub(crate) hal: T,
    pub(crate) base_page: u32,
    pub(crate) copies: Copies,
    pub(crate) copy_pages: u32,
    pub(crate) read_ahead_pages: u32,
    pub(crate) cache: Vec<ConfigItem>,
    pub(crate) dirty_pages: Vec<bool>,
    pub(crate) read_ahead: Vec<u8>,
    pub(crate) first_usable_page: u32,
    pub(crate) first_usable_byte: u16,
    pub(crate) next_id: u16,
}

impl<T: Platform> ConfigStore<T> {
    /// Validates the partition shape and allocates the cache, the dirty-page
    /// map and the read-ahead buffer, in that order.
    ///
    /// The store starts empty; call [`read_all`](Self::read_all) (or mount
    /// through [`partition::mount_config`]) to load the partition.
    pub fn new(mut hal: T, base_page: u32, settings: Settings) -> Result<Self, Error> {
        let sector_pages = T::SECTOR_PAGES as u32;
        if settings.read_ahead_pages <= 1 || !settings.read_ahead_pages.is_multiple_of(sector_pages)
        {
            return Err(Error::InvalidReadAhead);
        }
        let copy_pages = settings.pages / settings.copies.count();
        if copy_pages == 0
            || !copy_pages.is_multiple_of(sector_pages)
            || copy_pages * settings.copies.count() != settings.pages
        {
            return Err(Error::InvalidPartitionSize);
        }
        if !base_page.is_multiple_of(sector_pages) {
            return Err(Error::InvalidPartitionOffset);
        }
        if base_page as usize + settings.pages as usize > T::FLASH_PAGES {
            return Err(Error::InvalidPartitionSize);
        }

        let mut cache = Vec::new();
        if cache.try_reserve_exact(settings.max_items as usize).is_err() {
            hal.bad_alloc();
            return Err(Error::BadAlloc);
        }
        cache.resize_with(settings.max_items as usize, ConfigItem::vacant);
        let mut dirty_pages = Vec::new();
        if dirty_pages.try_reserve_exact(copy_pages as usize).is_err() {
            hal.bad_alloc();
            return Err(Error::BadAlloc);
        }
        dirty_pages.resize(copy_pages as usize, false);
        let buffer_bytes = settings.read_ahead_pages as usize * T::PAGE_SIZE;
        let mut read_ahead = Vec::new();
        if read_ahead.try_reserve_exact(buffer_bytes).is_err() {
            hal.bad_alloc();
            return Err(Error::BadAlloc);
        }
        read_ahead.resize(buffer_bytes, 0);

        Ok(Self {
            hal,
            base_page,
            copies: settings.copies,
            copy_pages,
            read_ahead_pages: settings.read_ahead_pages,
            cache,
            dirty_pages,
            read_ahead,
            first_usable_page: 0,
            first_usable_byte: OFFSET_PAGE_ITEMS as u16,
            next_id: 0,
        })
    }

    /// Gives the flash device back.
    pub fn release(self) -> T {
        self.hal
    }

    /// Loads the partition: copy A first and, with two copies, copy B as a
    /// cross-check, or as the fallback when copy A is corrupt.
    ///
    /// Outcomes with two copies:
    ///
    /// | copy A | copy B     | result                                        |
    /// |--------|------------|-----------------------------------------------|
    /// | ok     | ok         | `Ok`, cache and cursor from A                 |
    /// | ok     | mismatch   | [`Error::CopiesMismatch`], cache wiped        |
    /// | ok     | corrupt    | [`Error::BadCopy2`], cache and cursor from A  |
    /// | corrupt| ok         | [`Error::BadCopy1`], cache and cursor from B  |
    /// | corrupt| corrupt    | [`Error::BadCopies`], cache wiped             |
    ///
    /// A single-copy partition maps any failure to [`Error::BadCopies`] with
    /// the cache wiped. An all-erased copy is a valid empty store, not an
    /// error.
    pub fn read_all(&mut self) -> Result<(), Error> {
        self.clear();
        let verdict_a = self.read_copy(0, ScanTask::Load);
        let cursor_a = (self.first_usable_page, self.first_usable_byte);
        if self.copies == Copies::Two {
            let verdict_b = if verdict_a == PageVerdict::Match {
                self.read_copy(self.copy_pages, ScanTask::Verify)
            } else {
                self.clear();
                self.read_copy(self.copy_pages, ScanTask::Load)
            };
            if verdict_a == PageVerdict::Match && verdict_b == PageVerdict::Mismatch {
                self.reset_cursor();
                self.clear();
                Err(self.fault(Error::CopiesMismatch))
            } else if verdict_a == PageVerdict::Match && verdict_b != PageVerdict::Match {
                (self.first_usable_page, self.first_usable_byte) = cursor_a;
                Err(self.fault(Error::BadCopy2))
            } else if verdict_a != PageVerdict::Match && verdict_b == PageVerdict::Match {
                Err(self.fault(Error::BadCopy1))
            } else if verdict_a != PageVerdict::Match {
                self.reset_cursor();
                self.clear();
                Err(self.fault(Error::BadCopies))
            } else {
                // the verify pass moved the cursor across copy B; the
                // authoritative cursor is copy A's
                (self.first_usable_page, self.first_usable_byte) = cursor_a;
                Ok(())
            }
        } else if verdict_a != PageVerdict::Match {
            self.reset_cursor();
            self.clear();
            Err(self.fault(Error::BadCopies))
        } else {
            Ok(())
        }
    }

    /// Adds a new item and returns its id. The length is fixed for good;
    /// only the bytes can change later via [`set`](Self::set).
    ///
    /// Touches RAM only. The item reaches flash on the next
    /// [`commit`](Self::commit).
    pub fn add(&mut self, data: &[u8]) -> Result<u16, Error> {
        let page_size = T::PAGE_SIZE;
        if data.len() > page_size - OFFSET_PAGE_ITEMS - OFFSET_ITEM_DATA {
            return Err(self.fault(Error::ItemTooBig));
        }
        if self.next_id >= UNUSED_VALUE {
            return Err(self.fault(Error::InvalidId));
        }
        let count = data.len() as u16;
        let id = self.next_id;
        self.next_id += 1;
        // the item must fit with its header, or the serializer could never
        // emit it on this page
        let leftover = (page_size as u16).saturating_sub(self.first_usable_byte);
        if leftover < count + OFFSET_ITEM_DATA as u16 {
            self.first_usable_page += 1;
            self.first_usable_byte = OFFSET_PAGE_ITEMS as u16;
        }
        if self.first_usable_page >= self.copy_pages || id as usize >= self.cache.len() {
            return Err(self.fault(Error::Full));
        }
        if self.cache[id as usize]
            .init(
                self.first_usable_page,
                self.first_usable_byte + OFFSET_ITEM_DATA as u16,
                count,
            )
            .is_err()
        {
            self.hal.bad_alloc();
            return Err(Error::BadAlloc);
        }
        let item = &mut self.cache[id as usize];
        self.first_usable_byte += OFFSET_ITEM_DATA as u16 + count;
        self.dirty_pages[item.page_index() as usize] = true;
        item.set_data(data);
        Ok(id)
    }

    /// Replaces an item's bytes. Writing the value it already has is a
    /// no-op and keeps the page clean. `data` may be longer than the item;
    /// only the first `count` bytes are used.
    pub fn set(&mut self, id: u16, data: &[u8]) -> Result<(), Error> {
        if id >= self.next_id || id as usize >= self.cache.len() {
            return Err(self.fault(Error::InvalidId));
        }
        if data.len() < self.cache[id as usize].count() as usize {
            return Err(self.fault(Error::ValueTooShort));
        }
        let item = &mut self.cache[id as usize];
        if !item.matches(data) {
            self.dirty_pages[item.page_index() as usize] = true;
            item.set_data(data);
        }
        Ok(())
    }

    /// The item's current bytes, straight from the cache.
    pub fn get(&mut self, id: u16) -> Result<&[u8], Error> {
        if id >= self.next_id || id as usize >= self.cache.len() {
            return Err(self.fault(Error::InvalidId));
        }
        Ok(self.cache[id as usize].data())
    }

    /// Writes every dirty page back to flash, copy A fully before copy B.
    /// Dirty flags are cleared only after all copies landed, so a failed
    /// commit can be retried as a whole.
    pub fn commit(&mut self) -> Result<(), Error> {
        let mut ok = self.commit_copy(0);
        if ok && self.copies == Copies::Two {
            ok = self.commit_copy(self.copy_pages);
        }
        if ok {
            self.make_all_clean();
            Ok(())
        } else {
            Err(self.fault(Error::FlashTransfer))
        }
    }

    /// Forgets all assigned ids and dirty flags. Does not touch flash, and
    /// keeps the cache buffers: item lengths are stable, a reload reuses
    /// them.
    pub fn clear(&mut self) {
        self.next_id = 0;
        self.make_all_clean();
    }

    /// Forces the next [`commit`](Self::commit) to rewrite every live page,
    /// e.g. to heal a partition after [`Error::BadCopy1`].
    pub fn make_all_dirty(&mut self) {
        self.dirty_pages.fill(true);
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            item_count: self.next_id,
            first_usable_page: self.first_usable_page,
            first_usable_byte: self.first_usable_byte,
            dirty_page_count: self.dirty_pages.iter().filter(|&&dirty| dirty).count() as u32,
        }
    }

    fn make_all_clean(&mut self) {
        self.dirty_pages.fill(false);
    }

    fn reset_cursor(&mut self) {
        self.first_usable_page = 0;
        self.first_usable_byte = OFFSET_PAGE_ITEMS as u16;
    }

    fn fault(&mut self, error: Error) -> Error {
        #[cfg(feature = "defmt")]
        warn!("config store fault: {}", error);
        self.hal.fatal_error(error);
        error
    }
}
