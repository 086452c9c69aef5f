#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use nor_config::platform::{Platform, SpiError};
use nor_config::{Copies, Error, Settings};

pub const PAGE_SIZE: usize = 256;
pub const SECTOR_PAGES: usize = 16;
pub const FLASH_PAGES: usize = 4096;

/// The shape used by most tests: both copies together fill the whole mock
/// device, 2048 pages each.
pub fn settings() -> Settings {
    Settings {
        pages: FLASH_PAGES as u32,
        copies: Copies::Two,
        read_ahead_pages: 48,
        max_items: 20,
    }
}

pub const COPY_PAGES: u32 = FLASH_PAGES as u32 / 2;

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    ReadPages { start_page: u32, count: u32 },
    WritePage { page: u32 },
    EraseSector { sector: u32 },
}

/// In-RAM paged NOR flash: erases to 0xFF, writes can only clear bits.
/// Every operation with index >= `fail_after_operation` fails; a failing
/// write models a torn page by programming only its first half.
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    pub faults: Vec<Error>,
    pub bad_allocs: usize,
}

impl Flash {
    pub fn new() -> Self {
        Self {
            buf: vec![0xFF; PAGE_SIZE * FLASH_PAGES],
            fail_after_operation: usize::MAX,
            operations: Vec::new(),
            faults: Vec::new(),
            bad_allocs: 0,
        }
    }

    pub fn new_with_fault(fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::new()
        }
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn reads(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::ReadPages { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::WritePage { .. }))
            .count()
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::EraseSector { .. }))
            .count()
    }

    pub fn page(&self, page: u32) -> &[u8] {
        &self.buf[page as usize * PAGE_SIZE..(page as usize + 1) * PAGE_SIZE]
    }

    pub fn pages(&self, first_page: u32, count: u32) -> &[u8] {
        &self.buf[first_page as usize * PAGE_SIZE..(first_page + count) as usize * PAGE_SIZE]
    }

    pub fn flip_bit(&mut self, page: u32, offset: usize) {
        self.buf[page as usize * PAGE_SIZE + offset] ^= 0x01;
    }

    fn faulted(&self) -> bool {
        self.operations.len() >= self.fail_after_operation
    }
}

impl Platform for Flash {
    const PAGE_SIZE: usize = PAGE_SIZE;
    const SECTOR_PAGES: usize = SECTOR_PAGES;
    const FLASH_PAGES: usize = FLASH_PAGES;

    fn read_pages(&mut self, start_page: u32, count: u32, buf: &mut [u8]) -> Result<(), SpiError> {
        assert!((start_page + count) as usize <= FLASH_PAGES);
        if self.faulted() {
            return Err(SpiError::Transfer);
        }
        self.operations.push(Operation::ReadPages { start_page, count });
        let offset = start_page as usize * PAGE_SIZE;
        let len = count as usize * PAGE_SIZE;
        buf[..len].copy_from_slice(&self.buf[offset..offset + len]);
        Ok(())
    }

    fn write_page(&mut self, page: u32, buf: &[u8]) -> Result<(), SpiError> {
        assert!((page as usize) < FLASH_PAGES);
        assert_eq!(buf.len(), PAGE_SIZE);
        let offset = page as usize * PAGE_SIZE;
        if self.faulted() {
            // torn write: only the first half of the page got programmed
            for (dst, &src) in self.buf[offset..offset + PAGE_SIZE / 2].iter_mut().zip(buf) {
                *dst &= src;
            }
            return Err(SpiError::Transfer);
        }
        self.operations.push(Operation::WritePage { page });
        for (dst, &src) in self.buf[offset..offset + PAGE_SIZE].iter_mut().zip(buf) {
            *dst &= src;
        }
        Ok(())
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), SpiError> {
        assert!((sector as usize + 1) * SECTOR_PAGES <= FLASH_PAGES);
        if self.faulted() {
            return Err(SpiError::Transfer);
        }
        self.operations.push(Operation::EraseSector { sector });
        let offset = sector as usize * SECTOR_PAGES * PAGE_SIZE;
        self.buf[offset..offset + SECTOR_PAGES * PAGE_SIZE].fill(0xFF);
        Ok(())
    }

    fn fatal_error(&mut self, error: Error) {
        self.faults.push(error);
    }

    fn bad_alloc(&mut self) {
        self.bad_allocs += 1;
    }
}
