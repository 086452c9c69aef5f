use thiserror::Error;

/// Errors reported by the store. The same values are handed to the platform's
/// [`fatal_error`](crate::platform::Platform::fatal_error) hook right before the
/// corresponding `Err` is returned, so a host that prefers to halt or reboot on
/// data corruption can do so without inspecting every call site.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The flash transport failed outside of a store operation.
    #[error("flash communication error")]
    Communication,

    /// Dual-copy load: the first copy is corrupt, the second loaded fine.
    /// The store now holds the second copy's data; rewrite with
    /// `make_all_dirty` + `commit` to heal the first copy.
    #[error("first copy corrupt, second copy loaded")]
    BadCopy1,

    /// Dual-copy load: the first copy loaded fine, the second is corrupt.
    /// The store holds the first copy's data.
    #[error("second copy corrupt, first copy loaded")]
    BadCopy2,

    /// No copy could be loaded. The cache is empty.
    #[error("no loadable copy")]
    BadCopies,

    /// Both copies are individually valid but disagree. The cache is empty;
    /// the host has to decide which copy (if any) to trust.
    #[error("copies disagree")]
    CopiesMismatch,

    /// An id outside `[0, next assigned id)` was used, or the id space
    /// (65535 items) is exhausted.
    #[error("invalid item id")]
    InvalidId,

    /// The partition (or the item table) has no room for another item.
    #[error("config partition full")]
    Full,

    /// A value longer than a page can carry was passed to `add`.
    #[error("item data too big for a page")]
    ItemTooBig,

    /// The value passed to `set` is shorter than the item's fixed size.
    #[error("value shorter than the item size")]
    ValueTooShort,

    /// The flash transport failed during a read or commit.
    #[error("flash transfer error")]
    FlashTransfer,

    /// The device constants violate the supported geometry (page size a power
    /// of two in 256..=32768 bytes, sector and flash size powers of two,
    /// flash larger than a sector, at most 4 GiB).
    #[error("unsupported flash geometry")]
    InvalidGeometry,

    /// The partition base page is not sector-aligned.
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition size is not a whole number of sectors per copy, or does
    /// not fit the flash.
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// The read-ahead buffer must be more than one page and a whole number
    /// of sectors.
    #[error("invalid read-ahead size")]
    InvalidReadAhead,

    /// More partitions claimed than the layout supports.
    #[error("too many partitions")]
    TooManyPartitions,

    /// A buffer allocation failed. Also reported through the platform's
    /// [`bad_alloc`](crate::platform::Platform::bad_alloc) hook.
    #[error("allocation failure")]
    BadAlloc,
}
