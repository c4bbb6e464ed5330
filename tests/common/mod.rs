//! Shared test utilities for pool, table and crash-consistency tests.

#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use pmfreq::constants::LAYOUT;
use pmfreq::{FreqTable, Pool, PoolConfig};

/// Pool settings for tests: small, many lanes, no msync.
pub fn test_config(size: u64) -> PoolConfig {
    PoolConfig {
        size,
        lanes: 16,
        lane_log_size: 1024,
        flush: false,
    }
}

/// Path of the scratch pool inside `dir`.
pub fn pool_path(dir: &TempDir) -> PathBuf {
    dir.path().join("words.pool")
}

/// Open (or create) the scratch pool in `dir` and its table.
pub fn open_table(dir: &TempDir) -> FreqTable {
    open_table_at(&pool_path(dir))
}

/// Open (or create) the pool at `path` and its table.
pub fn open_table_at(path: &Path) -> FreqTable {
    let pool = Pool::open_or_create(path, LAYOUT, &test_config(16 << 20)).unwrap();
    FreqTable::ensure_allocated(Arc::new(pool)).unwrap()
}

/// Write `contents` to `dir/name` and return its path.
pub fn write_input(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

/// Sorted `(word, count)` pairs of the whole table.
pub fn snapshot(table: &FreqTable) -> Vec<(String, u64)> {
    let mut out: Vec<_> = table
        .entries()
        .unwrap()
        .into_iter()
        .map(|entry| (entry.word, entry.count))
        .collect();
    out.sort();
    out
}

// ---------------------------------------------------------------------------
// File corruption utilities
// ---------------------------------------------------------------------------

/// Flip one bit at the given byte offset in a file.
pub fn corrupt_byte_at(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut byte = [0u8];
    file.read_exact(&mut byte)?;
    byte[0] ^= 0x01;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    Ok(())
}

/// Truncate a file to `new_len` bytes.
pub fn truncate_to(path: &Path, new_len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(new_len)?;
    file.sync_all()?;
    Ok(())
}
