//! The engine core: cache entries, the streaming load/verify pipeline and
//! the sector-level commit planner.

use crate::ConfigStore;
use crate::error::Error;
use crate::platform::{Platform, SpiError};
use crate::raw::{
    self, Magic, OFFSET_ITEM_COUNT, OFFSET_ITEM_DATA, OFFSET_ITEM_ID, OFFSET_PAGE_CHECKSUM,
    OFFSET_PAGE_COUNT, OFFSET_PAGE_ITEMS, OFFSET_PAGE_MAGIC, UNUSED_VALUE,
};
use alloc::boxed::Box;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::trace;

/// Values up to this many bytes live inline in the cache entry; longer ones
/// get their own heap buffer, sized once at assignment.
pub(crate) const INLINE_VALUE_BYTES: usize = 8;

enum ValueSlot {
    Void,
    Few([u8; INLINE_VALUE_BYTES]),
    Many(Box<[u8]>),
}

/// One cached item: where it lives within its copy and its current bytes.
pub(crate) struct ConfigItem {
    page_index: u32,
    data_offset: u16,
    count: u16,
    value: ValueSlot,
}

impl ConfigItem {
    pub(crate) const fn vacant() -> Self {
        Self {
            page_index: 0,
            data_offset: 0,
            count: 0,
            value: ValueSlot::Void,
        }
    }

    /// One-shot: an item's location and size never change once assigned.
    /// Calls after the first are ignored.
    pub(crate) fn init(&mut self, page_index: u32, data_offset: u16, count: u16) -> Result<(), Error> {
        if !matches!(self.value, ValueSlot::Void) {
            return Ok(());
        }
        let value = if count as usize > INLINE_VALUE_BYTES {
            let mut buf = Vec::new();
            if buf.try_reserve_exact(count as usize).is_err() {
                return Err(Error::BadAlloc);
            }
            buf.resize(count as usize, 0);
            ValueSlot::Many(buf.into_boxed_slice())
        } else {
            ValueSlot::Few([0; INLINE_VALUE_BYTES])
        };
        self.page_index = page_index;
        self.data_offset = data_offset;
        self.count = count;
        self.value = value;
        Ok(())
    }

    #[allow(dead_code)]
    pub(crate) fn is_valid(&self) -> bool {
        self.count > 0
    }

    pub(crate) fn page_index(&self) -> u32 {
        self.page_index
    }

    #[allow(dead_code)]
    pub(crate) fn data_offset(&self) -> u16 {
        self.data_offset
    }

    pub(crate) fn count(&self) -> u16 {
        self.count
    }

    pub(crate) fn data(&self) -> &[u8] {
        match &self.value {
            ValueSlot::Void => &[],
            ValueSlot::Few(buf) => &buf[..self.count as usize],
            ValueSlot::Many(buf) => buf,
        }
    }

    /// Byte-equal compare of the first `count` bytes of `src` against the
    /// cached value. Shorter input can never match.
    pub(crate) fn matches(&self, src: &[u8]) -> bool {
        src.len() >= self.count as usize && self.data() == &src[..self.count as usize]
    }

    /// Copies `count` bytes from `src`.
    pub(crate) fn set_data(&mut self, src: &[u8]) {
        let count = self.count as usize;
        match &mut self.value {
            ValueSlot::Void => {}
            ValueSlot::Few(buf) => buf[..count].copy_from_slice(&src[..count]),
            ValueSlot::Many(buf) => buf.copy_from_slice(&src[..count]),
        }
    }
}

/// What a scan concluded about one page.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum PageVerdict {
    /// Page agrees with the cache (or was loaded into it).
    Match,
    ChecksumError,
    ConsistencyError,
    /// A verified page's bytes disagree with the cache.
    Mismatch,
    /// Cleanly erased; live pages end here.
    Erased,
    TransferError,
}

/// What a scan pass does with each page.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ScanTask {
    /// Rebuild the cache and the append cursor from flash.
    Load,
    /// Compare flash against the cache; an erased page ends the copy.
    Verify,
    /// Like `Verify`, but an erased page must be uniformly 0xFF and the
    /// cursor stays put. Used by the commit planner.
    VerifyErased,
}

impl<T: Platform> ConfigStore<T> {
    /// Streams one copy through the read-ahead buffer, page by page, until
    /// the first erased page or the copy end. Returns the first non-`Match`
    /// verdict, with a clean `Erased` termination mapped back to `Match`.
    pub(crate) fn read_copy(&mut self, copy_offset: u32, task: ScanTask) -> PageVerdict {
        let page_size = T::PAGE_SIZE;
        self.first_usable_page = 0;
        self.first_usable_byte = OFFSET_PAGE_ITEMS as u16;
        let mut pages_read = 0u32;
        let mut verdict = PageVerdict::Match;
        'copy: while pages_read < self.copy_pages {
            let chunk = self.read_ahead_pages.min(self.copy_pages - pages_read);
            #[cfg(feature = "defmt")]
            trace!(
                "read_copy: pages {}..{} at offset {}",
                pages_read,
                pages_read + chunk,
                copy_offset
            );
            if self
                .hal
                .read_pages(
                    self.base_page + copy_offset + pages_read,
                    chunk,
                    &mut self.read_ahead[..chunk as usize * page_size],
                )
                .is_err()
            {
                verdict = PageVerdict::TransferError;
                break;
            }
            for page_in_buffer in 0..chunk {
                verdict = self.process_page(page_in_buffer as usize, pages_read + page_in_buffer, task);
                if verdict != PageVerdict::Match {
                    break 'copy;
                }
            }
            pages_read += chunk;
        }
        if verdict == PageVerdict::Erased {
            PageVerdict::Match
        } else {
            verdict
        }
    }

    /// Classifies one buffered page and, per the task, loads it into the
    /// cache or verifies the cache against it.
    ///
    /// Under `Load` the cursor follows the walk, so after the last live page
    /// it points at the first free byte. Item ids must be contiguous and
    /// ascending across the copy; any gap, out-of-range length or foreign
    /// magic byte condemns the page.
    pub(crate) fn process_page(
        &mut self,
        page_in_buffer: usize,
        page_rel_copy: u32,
        task: ScanTask,
    ) -> PageVerdict {
        let page_size = T::PAGE_SIZE;
        let start = page_in_buffer * page_size;
        let page = &self.read_ahead[start..start + page_size];
        match Magic::from_repr(page[OFFSET_PAGE_MAGIC]) {
            Some(Magic::Erased) if task != ScanTask::VerifyErased => PageVerdict::Erased,
            Some(Magic::Erased) => {
                if page.iter().all(|&byte| byte == Magic::Erased as u8) {
                    PageVerdict::Erased
                } else {
                    PageVerdict::ConsistencyError
                }
            }
            Some(Magic::Config) => {
                if raw::page_checksum(page) != raw::get_u16(page, OFFSET_PAGE_CHECKSUM) {
                    return PageVerdict::ChecksumError;
                }
                let item_count = raw::get_u16(page, OFFSET_PAGE_COUNT);
                if item_count == 0 || item_count == UNUSED_VALUE {
                    return PageVerdict::ConsistencyError;
                }
                if task != ScanTask::VerifyErased {
                    self.first_usable_page = page_rel_copy;
                }
                let mut verdict = PageVerdict::Match;
                let mut item_start = OFFSET_PAGE_ITEMS;
                for _ in 0..item_count {
                    if item_start + OFFSET_ITEM_DATA > page_size {
                        return PageVerdict::ConsistencyError;
                    }
                    let id = raw::get_u16(page, item_start + OFFSET_ITEM_ID);
                    let count = raw::get_u16(page, item_start + OFFSET_ITEM_COUNT) as usize;
                    item_start += OFFSET_ITEM_DATA;
                    if item_start + count > page_size
                        || id > self.next_id
                        || id as usize >= self.cache.len()
                    {
                        return PageVerdict::ConsistencyError;
                    }
                    if id == self.next_id && task == ScanTask::Load {
                        if self.cache[id as usize]
                            .init(page_rel_copy, item_start as u16, count as u16)
                            .is_err()
                        {
                            self.hal.bad_alloc();
                            return PageVerdict::ConsistencyError;
                        }
                        self.next_id += 1;
                    } else if task == ScanTask::Load
                        && self.cache[id as usize].count() as usize != count
                    {
                        return PageVerdict::ConsistencyError;
                    }
                    let item = &mut self.cache[id as usize];
                    if task == ScanTask::Load {
                        item.set_data(&page[item_start..item_start + count]);
                    } else {
                        // the verdict of the page's last item wins; earlier
                        // mismatches within the same page may be overridden
                        verdict = if item.matches(&page[item_start..]) {
                            PageVerdict::Match
                        } else {
                            PageVerdict::Mismatch
                        };
                    }
                    item_start += count;
                    if task != ScanTask::VerifyErased {
                        self.first_usable_byte = item_start as u16;
                    }
                }
                verdict
            }
            None => PageVerdict::ConsistencyError,
        }
    }

    /// Reconciles one copy's dirty pages with flash, sector by sector.
    ///
    /// A sector that already agrees with the cache is skipped. A cleanly
    /// erased sector is programmed in place (1→0 transitions need no erase).
    /// Anything else is erased and every page up to the cursor rewritten.
    /// Returns `false` on the first transport error.
    pub(crate) fn commit_copy(&mut self, copy_offset: u32) -> bool {
        let page_size = T::PAGE_SIZE;
        let sector_pages = T::SECTOR_PAGES as u32;
        let end_limit = self.copy_pages.min(self.first_usable_page + 1);
        let mut next_dirty = self.find_dirty(0, end_limit);
        while let Some(dirty_page) = next_dirty {
            let start_sector = dirty_page / sector_pages;
            let start_page = start_sector * sector_pages;
            let end_page = end_limit.min(start_page + self.read_ahead_pages);
            let page_count = end_page - start_page;
            let sector_count = page_count.div_ceil(sector_pages);
            next_dirty = self.find_dirty(end_page, end_limit);
            if self
                .hal
                .read_pages(
                    self.base_page + copy_offset + start_page,
                    page_count,
                    &mut self.read_ahead[..page_count as usize * page_size],
                )
                .is_err()
            {
                return false;
            }
            for sector_index in 0..sector_count {
                let mut all_erased = true;
                let mut something_changed = false;
                for page_index in 0..sector_pages {
                    let page_in_buffer = sector_index * sector_pages + page_index;
                    // a page past the read window lies beyond the live
                    // cursor; counting it as changed-and-not-erased keeps a
                    // partially covered tail sector on the erase path
                    let verdict = if page_in_buffer < page_count {
                        self.process_page(
                            page_in_buffer as usize,
                            start_page + page_in_buffer,
                            ScanTask::VerifyErased,
                        )
                    } else {
                        PageVerdict::ConsistencyError
                    };
                    something_changed = something_changed || verdict != PageVerdict::Match;
                    all_erased = all_erased && verdict == PageVerdict::Erased;
                }
                if !something_changed {
                    #[cfg(feature = "defmt")]
                    trace!("commit: sector {} unchanged", start_sector + sector_index);
                    continue;
                }
                if all_erased {
                    #[cfg(feature = "defmt")]
                    trace!("commit: sector {} in place", start_sector + sector_index);
                    for page_index in 0..sector_pages {
                        let page_in_buffer = sector_index * sector_pages + page_index;
                        let page_rel_copy = start_page + page_in_buffer;
                        if self.dirty_pages[page_rel_copy as usize] {
                            self.serialize_page(page_in_buffer as usize, page_rel_copy);
                            if self
                                .write_buffered_page(copy_offset, page_in_buffer as usize, page_rel_copy)
                                .is_err()
                            {
                                return false;
                            }
                        }
                    }
                } else {
                    let sector =
                        (self.base_page + copy_offset) / sector_pages + start_sector + sector_index;
                    #[cfg(feature = "defmt")]
                    trace!("commit: erase sector {}", sector);
                    if self.hal.erase_sector(sector).is_err() {
                        return false;
                    }
                    for page_index in 0..sector_pages {
                        let page_in_buffer = sector_index * sector_pages + page_index;
                        let page_rel_copy = start_page + page_in_buffer;
                        let in_use = page_rel_copy < self.first_usable_page
                            || (page_rel_copy == self.first_usable_page
                                && self.first_usable_byte > OFFSET_PAGE_ITEMS as u16);
                        if in_use {
                            self.serialize_page(page_in_buffer as usize, page_rel_copy);
                            if self
                                .write_buffered_page(copy_offset, page_in_buffer as usize, page_rel_copy)
                                .is_err()
                            {
                                return false;
                            }
                        }
                    }
                }
            }
        }
        true
    }

    fn find_dirty(&self, from: u32, to: u32) -> Option<u32> {
        self.dirty_pages[from as usize..to as usize]
            .iter()
            .position(|&dirty| dirty)
            .map(|offset| from + offset as u32)
    }

    fn write_buffered_page(
        &mut self,
        copy_offset: u32,
        page_in_buffer: usize,
        page_rel_copy: u32,
    ) -> Result<(), SpiError> {
        let page_size = T::PAGE_SIZE;
        let start = page_in_buffer * page_size;
        self.hal.write_page(
            self.base_page + copy_offset + page_rel_copy,
            &self.read_ahead[start..start + page_size],
        )
    }

    /// Rebuilds one page image inside the read-ahead buffer from the cache.
    ///
    /// Ids are assigned in page-ascending order, so the live cache prefix is
    /// sorted by page index and a binary search finds the page's first item.
    /// Items are appended in id order while they fit. Bytes past the last
    /// item keep whatever the buffer held; the checksum covers them and
    /// nothing ever reads them back.
    pub(crate) fn serialize_page(&mut self, page_in_buffer: usize, page_rel_copy: u32) {
        let page_size = T::PAGE_SIZE;
        let start = page_in_buffer * page_size;
        let mut id = self.cache[..self.next_id as usize]
            .partition_point(|item| item.page_index() < page_rel_copy);
        let page = &mut self.read_ahead[start..start + page_size];
        page[OFFSET_PAGE_MAGIC] = Magic::Config as u8;
        let mut emitted = 0u16;
        let mut item_start = OFFSET_PAGE_ITEMS;
        while id < self.next_id as usize {
            let item = &self.cache[id];
            let count = item.count() as usize;
            if item_start + OFFSET_ITEM_DATA + count > page_size {
                break;
            }
            raw::put_u16(page, item_start + OFFSET_ITEM_ID, id as u16);
            raw::put_u16(page, item_start + OFFSET_ITEM_COUNT, count as u16);
            item_start += OFFSET_ITEM_DATA;
            page[item_start..item_start + count].copy_from_slice(item.data());
            item_start += count;
            emitted += 1;
            id += 1;
        }
        raw::put_u16(page, OFFSET_PAGE_COUNT, emitted);
        let sum = raw::page_checksum(page);
        raw::put_u16(page, OFFSET_PAGE_CHECKSUM, sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_stay_inline() {
        let mut item = ConfigItem::vacant();
        assert!(!item.is_valid());
        item.init(2, 9, INLINE_VALUE_BYTES as u16).unwrap();
        assert!(matches!(item.value, ValueSlot::Few(_)));
        assert!(item.is_valid());
        assert_eq!(item.page_index(), 2);
        assert_eq!(item.data_offset(), 9);
        assert_eq!(item.data().len(), INLINE_VALUE_BYTES);
    }

    #[test]
    fn large_values_get_their_own_buffer() {
        let mut item = ConfigItem::vacant();
        item.init(0, 9, INLINE_VALUE_BYTES as u16 + 1).unwrap();
        assert!(matches!(item.value, ValueSlot::Many(_)));
        assert_eq!(item.data().len(), INLINE_VALUE_BYTES + 1);
    }

    #[test]
    fn init_is_one_shot() {
        let mut item = ConfigItem::vacant();
        item.init(1, 9, 4).unwrap();
        item.set_data(&[1, 2, 3, 4]);
        item.init(7, 30, 100).unwrap();
        assert_eq!(item.page_index(), 1);
        assert_eq!(item.count(), 4);
        assert_eq!(item.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn matches_compares_exactly_count_bytes() {
        let mut item = ConfigItem::vacant();
        item.init(0, 9, 3).unwrap();
        item.set_data(&[0xAA, 0xBB, 0xCC]);
        assert!(item.matches(&[0xAA, 0xBB, 0xCC]));
        assert!(item.matches(&[0xAA, 0xBB, 0xCC, 0xDD]));
        assert!(!item.matches(&[0xAA, 0xBB]));
        assert!(!item.matches(&[0xAA, 0xBB, 0xCD]));
    }

    #[test]
    fn set_data_replaces_the_bytes() {
        let mut item = ConfigItem::vacant();
        item.init(0, 9, 12).unwrap();
        let pattern: alloc::vec::Vec<u8> = (0u8..12).collect();
        item.set_data(&pattern);
        assert_eq!(item.data(), &pattern[..]);
    }
}
