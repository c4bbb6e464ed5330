//! Persistent hash index of word counts
//!
//! - [`hash`]: the word to bucket mapping
//! - [`FreqTable`]: the bucket table and its count-or-insert protocol

mod hash;
pub(crate) mod record;
mod table;

pub use hash::{hash, hash_bytes};
pub use table::{FreqTable, TableStats, WordCount};
