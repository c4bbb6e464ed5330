//! Persistent record layouts for the bucket table
//!
//! All records are arrays of little-endian u64 fields at fixed offsets from
//! the record's `PAddr`.
//!
//! ```text
//! Table:  magic | nbuckets | Bucket[nbuckets]
//! Bucket: lock | head
//! Entry:  next | count | lock | word_len | word bytes (padded to 8)
//! ```
//!
//! Lock fields are runtime-only (see `pool::lock`). Everything else in an
//! entry except `count` is written once, inside the transaction that links
//! the entry into its bucket.

use crate::address::PAddr;
use crate::constants::NBUCKETS;

/// Table header magic
pub const TABLE_MAGIC: u64 = u64::from_le_bytes(*b"PMFQTBL1");

/// Root object size; the table reference is the first field.
pub const ROOT_SIZE: u64 = 64;

/// Offset of the table reference inside the root object
pub const ROOT_TABLE_FIELD: u64 = 0;

/// Table header is two u64 fields
pub const TABLE_HEADER_SIZE: u64 = 16;

/// One bucket record
pub const BUCKET_SIZE: u64 = 16;

/// Fixed part of an entry record
pub const ENTRY_HEADER_SIZE: u64 = 32;

/// Total size of the bucket table
pub const TABLE_SIZE: u64 = TABLE_HEADER_SIZE + NBUCKETS as u64 * BUCKET_SIZE;

/// Reference to the persistent bucket table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRecord(PAddr);

impl TableRecord {
    pub fn new(addr: PAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> PAddr {
        self.0
    }

    pub fn magic_addr(&self) -> PAddr {
        self.0
    }

    pub fn nbuckets_addr(&self) -> PAddr {
        self.0.field(8)
    }

    pub fn bucket(&self, index: usize) -> BucketRecord {
        debug_assert!(index < NBUCKETS);
        BucketRecord(self.0.field(TABLE_HEADER_SIZE + index as u64 * BUCKET_SIZE))
    }
}

/// Reference to one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRecord(PAddr);

impl BucketRecord {
    pub fn lock_addr(&self) -> PAddr {
        self.0
    }

    pub fn head_addr(&self) -> PAddr {
        self.0.field(8)
    }
}

/// Reference to one chain entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRecord(PAddr);

impl EntryRecord {
    pub fn new(addr: PAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> PAddr {
        self.0
    }

    pub fn next_addr(&self) -> PAddr {
        self.0
    }

    pub fn count_addr(&self) -> PAddr {
        self.0.field(8)
    }

    pub fn lock_addr(&self) -> PAddr {
        self.0.field(16)
    }

    pub fn word_len_addr(&self) -> PAddr {
        self.0.field(24)
    }

    pub fn word_addr(&self) -> PAddr {
        self.0.field(ENTRY_HEADER_SIZE)
    }

    /// Allocation size for an entry holding a word of `word_len` bytes
    pub fn size_for(word_len: usize) -> u64 {
        ENTRY_HEADER_SIZE + (word_len as u64).div_ceil(8) * 8
    }
}
