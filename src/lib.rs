//! pmfreq - crash-consistent concurrent word counting on a persistent heap
//!
//! Words from many input files are counted in parallel into a hash table
//! that lives in a memory-mapped pool file. Every increment is transactional:
//! after a crash the pool reopens with each count equal to the number of
//! updates that had committed.
//!
//! - **Pool**: mapped heap with a root object, bump allocation, undo-log
//!   transactions and run-scoped locks
//! - **Index**: fixed bucket table with the count-or-insert protocol
//! - **Counter**: tokenizer and per-file worker threads
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pmfreq::{constants::LAYOUT, FreqTable, Pool, PoolConfig};
//!
//! let pool = Pool::open_or_create("/tmp/words.pool", LAYOUT, &PoolConfig::default())?;
//! let table = FreqTable::ensure_allocated(Arc::new(pool))?;
//!
//! table.update("hello")?;
//! assert!(table.get("hello")?.unwrap() >= 1);
//! # Ok::<(), pmfreq::PmemError>(())
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod config;
pub mod counter;
pub mod index;
pub mod pool;
pub mod status;
pub mod words;

// Re-exports for convenience
pub use address::PAddr;
pub use counter::{count_file, count_files, count_reader, CountError, FileSummary};
pub use index::{FreqTable, TableStats, WordCount};
pub use pool::{Pool, PoolConfig, Transaction};
pub use status::{PmemError, PmemResult, Status};

/// Constants used throughout the library
pub mod constants {
    /// Number of hash buckets; part of the on-pool format
    pub const NBUCKETS: usize = 10007;

    /// Layout name word-count pools are created with
    pub const LAYOUT: &str = "freq";

    /// Longest word stored as a single entry; longer runs are split
    pub const MAX_WORD_LEN: usize = 8191;
}

/// Utility for size literals
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::PAddr;
    pub use crate::constants::{LAYOUT, NBUCKETS};
    pub use crate::counter::{count_files, CountError};
    pub use crate::index::{FreqTable, WordCount};
    pub use crate::pool::{Pool, PoolConfig};
    pub use crate::status::{PmemError, PmemResult, Status};
}
