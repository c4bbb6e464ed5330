//! Persistent word-frequency table
//!
//! A fixed array of `NBUCKETS` buckets, each heading a singly-linked chain of
//! entries. New entries are prepended; entries are never removed.
//!
//! # Locking
//!
//! Each bucket has a reader/writer structural lock and each entry has an
//! exclusive count lock. `update` searches under the shared bucket lock.
//! On a miss it takes the exclusive lock and re-scans the entries prepended
//! since its shared scan before inserting, so two threads racing on the first
//! occurrence of a word cannot both insert it. Count increments happen under
//! the entry lock only; entries never move or disappear, so dropping the
//! bucket lock first is safe. No thread ever holds two bucket locks.

use std::collections::HashSet;
use std::sync::Arc;

use crate::address::PAddr;
use crate::constants::NBUCKETS;
use crate::index::hash::hash;
use crate::index::record::{
    BucketRecord, EntryRecord, TableRecord, ENTRY_HEADER_SIZE, ROOT_SIZE, ROOT_TABLE_FIELD,
    TABLE_MAGIC, TABLE_SIZE,
};
use crate::pool::lock::{PMutex, PRwLock};
use crate::pool::{Pool, Transaction};
use crate::status::{PmemError, PmemResult};

/// A word and its count, as returned by a dump
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WordCount {
    /// The word
    pub word: String,
    /// Number of recorded occurrences
    pub count: u64,
}

/// Table shape statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Distinct words
    pub entries: u64,
    /// Sum of all counts
    pub total_words: u64,
    /// Buckets with a non-empty chain
    pub used_buckets: u64,
    /// Length of the longest chain
    pub longest_chain: u64,
}

/// Handle to the persistent bucket table of a pool
#[derive(Clone)]
pub struct FreqTable {
    pool: Arc<Pool>,
    table: TableRecord,
    /// Upper bound on chain length; walking further means a cycle.
    max_chain: u64,
}

impl FreqTable {
    /// Find the pool's bucket table, allocating it on first use.
    ///
    /// Must run before worker threads start; two concurrent first-time
    /// initializers are not serialized against each other.
    pub fn ensure_allocated(pool: Arc<Pool>) -> PmemResult<Self> {
        let root = pool.root(ROOT_SIZE)?;
        let table_field = root.field(ROOT_TABLE_FIELD);
        let existing = PAddr::new(pool.read_u64(table_field)?);

        let table = if existing.is_null() {
            let table = pool.run_tx(|tx| {
                let table = tx.alloc_zeroed(TABLE_SIZE)?;
                let record = TableRecord::new(table);
                tx.write_u64(record.magic_addr(), TABLE_MAGIC)?;
                tx.write_u64(record.nbuckets_addr(), NBUCKETS as u64)?;
                tx.write_u64(table_field, table.offset())?;
                Ok(record)
            })?;
            tracing::info!(table = %table.addr(), buckets = NBUCKETS, "bucket table allocated");
            table
        } else {
            Self::validate(&pool, existing)?
        };

        Ok(Self::with_table(pool, table))
    }

    /// Attach to the pool's bucket table without allocating anything.
    ///
    /// Returns `None` if the pool has no table yet.
    pub fn open(pool: Arc<Pool>) -> PmemResult<Option<Self>> {
        let Some(root) = pool.existing_root(ROOT_SIZE)? else {
            return Ok(None);
        };
        let existing = PAddr::new(pool.read_u64(root.field(ROOT_TABLE_FIELD))?);
        if existing.is_null() {
            return Ok(None);
        }
        let table = Self::validate(&pool, existing)?;
        Ok(Some(Self::with_table(pool, table)))
    }

    fn with_table(pool: Arc<Pool>, table: TableRecord) -> Self {
        let heap = pool.size() - pool.header().heap_start;
        Self {
            max_chain: heap / EntryRecord::size_for(1) + 1,
            pool,
            table,
        }
    }

    fn validate(pool: &Pool, addr: PAddr) -> PmemResult<TableRecord> {
        if !addr.is_aligned() || !pool.in_heap(addr, TABLE_SIZE) {
            return Err(PmemError::corruption(format!(
                "bucket table reference {addr} outside heap"
            )));
        }
        let record = TableRecord::new(addr);
        let magic = pool.read_u64(record.magic_addr())?;
        if magic != TABLE_MAGIC {
            return Err(PmemError::corruption(format!(
                "bucket table at {addr} has bad magic {magic:#x}"
            )));
        }
        let nbuckets = pool.read_u64(record.nbuckets_addr())?;
        if nbuckets != NBUCKETS as u64 {
            return Err(PmemError::LayoutMismatch {
                expected: format!("{NBUCKETS} buckets"),
                found: format!("{nbuckets} buckets"),
            });
        }
        Ok(record)
    }

    /// The pool this table lives in
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Record one more occurrence of `word`, inserting it with count 1 if it
    /// is new. Returns the word's count after the update.
    ///
    /// When this returns `Ok` the increment is durable. On error nothing was
    /// applied.
    pub fn update(&self, word: &str) -> PmemResult<u64> {
        if word.is_empty() {
            return Err(PmemError::InvalidArgument("cannot count an empty word".into()));
        }
        let bucket = self.table.bucket(hash(word));

        let seen_head = {
            let shared = self.structural_lock(bucket)?.read();
            let head = self.head(bucket)?;
            if let Some(entry) = self.find(head, PAddr::NULL, word)? {
                drop(shared);
                return self.bump(entry);
            }
            head
        };

        let exclusive = self.structural_lock(bucket)?.write();
        let head = self.head(bucket)?;
        if let Some(entry) = self.find(head, seen_head, word)? {
            drop(exclusive);
            return self.bump(entry);
        }
        self.pool
            .run_tx(|tx| Self::link_new_entry(tx, bucket, head, word))?;
        drop(exclusive);
        Ok(1)
    }

    /// Current count for `word`, if it has been seen.
    pub fn get(&self, word: &str) -> PmemResult<Option<u64>> {
        if word.is_empty() {
            return Ok(None);
        }
        let bucket = self.table.bucket(hash(word));
        let entry = {
            let _shared = self.structural_lock(bucket)?.read();
            let head = self.head(bucket)?;
            self.find(head, PAddr::NULL, word)?
        };
        match entry {
            Some(entry) => Ok(Some(self.read_count(entry)?)),
            None => Ok(None),
        }
    }

    /// Every word and its count, in bucket and chain order.
    pub fn entries(&self) -> PmemResult<Vec<WordCount>> {
        let mut out = Vec::new();
        for index in 0..NBUCKETS {
            let bucket = self.table.bucket(index);
            let _shared = self.structural_lock(bucket)?.read();
            let mut cursor = self.head(bucket)?;
            let mut steps = 0;
            while !cursor.is_null() {
                let entry = self.entry(cursor, &mut steps)?;
                out.push(WordCount {
                    word: self.word_str(entry)?.to_string(),
                    count: self.read_count(entry)?,
                });
                cursor = PAddr::new(self.pool.read_u64(entry.next_addr())?);
            }
        }
        Ok(out)
    }

    /// Table shape statistics.
    pub fn stats(&self) -> PmemResult<TableStats> {
        self.walk(false)
    }

    /// Check every structural invariant: finite acyclic chains, words in the
    /// bucket they hash to, no duplicate words, counts of at least one.
    pub fn verify(&self) -> PmemResult<TableStats> {
        self.walk(true)
    }

    fn walk(&self, strict: bool) -> PmemResult<TableStats> {
        let mut stats = TableStats::default();
        for index in 0..NBUCKETS {
            let bucket = self.table.bucket(index);
            let _shared = self.structural_lock(bucket)?.read();
            let mut seen = HashSet::new();
            let mut visited = HashSet::new();
            let mut cursor = self.head(bucket)?;
            let mut steps = 0;
            while !cursor.is_null() {
                let entry = self.entry(cursor, &mut steps)?;
                let count = self.read_count(entry)?;
                if strict {
                    if !visited.insert(cursor) {
                        return Err(PmemError::corruption(format!(
                            "chain of bucket {index} revisits {cursor} (cycle)"
                        )));
                    }
                    let word = self.word_str(entry)?;
                    if hash(word) != index {
                        return Err(PmemError::corruption(format!(
                            "word {word:?} found in bucket {index}, hashes to {}",
                            hash(word)
                        )));
                    }
                    if !seen.insert(word) {
                        return Err(PmemError::corruption(format!(
                            "duplicate entry for {word:?} in bucket {index}"
                        )));
                    }
                    if count == 0 {
                        return Err(PmemError::corruption(format!(
                            "entry for {word:?} has count 0"
                        )));
                    }
                }
                stats.entries += 1;
                stats.total_words += count;
                cursor = PAddr::new(self.pool.read_u64(entry.next_addr())?);
            }
            if steps > 0 {
                stats.used_buckets += 1;
                stats.longest_chain = stats.longest_chain.max(steps);
            }
        }
        Ok(stats)
    }

    fn structural_lock(&self, bucket: BucketRecord) -> PmemResult<PRwLock<'_>> {
        Ok(PRwLock::new(
            self.pool.atomic_u64(bucket.lock_addr())?,
            self.pool.run_tag(),
        ))
    }

    fn count_lock(&self, entry: EntryRecord) -> PmemResult<PMutex<'_>> {
        Ok(PMutex::new(
            self.pool.atomic_u64(entry.lock_addr())?,
            self.pool.run_tag(),
        ))
    }

    fn head(&self, bucket: BucketRecord) -> PmemResult<PAddr> {
        Ok(PAddr::new(self.pool.read_u64(bucket.head_addr())?))
    }

    /// Validate a chain link and count it against the cycle bound.
    fn entry(&self, addr: PAddr, steps: &mut u64) -> PmemResult<EntryRecord> {
        *steps += 1;
        if *steps > self.max_chain {
            return Err(PmemError::corruption(format!(
                "chain through {addr} exceeds {} links (cycle)",
                self.max_chain
            )));
        }
        if !addr.is_aligned() || !self.pool.in_heap(addr, ENTRY_HEADER_SIZE) {
            return Err(PmemError::corruption(format!(
                "chain link {addr} outside heap"
            )));
        }
        Ok(EntryRecord::new(addr))
    }

    fn word_bytes(&self, entry: EntryRecord) -> PmemResult<&[u8]> {
        let len = self.pool.read_u64(entry.word_len_addr())?;
        if !self.pool.in_heap(entry.word_addr(), len) {
            return Err(PmemError::corruption(format!(
                "entry {} word of {len} bytes runs past the heap",
                entry.addr()
            )));
        }
        // Words are immutable once the entry is linked.
        self.pool.bytes(entry.word_addr(), len)
    }

    fn word_str(&self, entry: EntryRecord) -> PmemResult<&str> {
        std::str::from_utf8(self.word_bytes(entry)?).map_err(|_| {
            PmemError::corruption(format!("entry {} word is not UTF-8", entry.addr()))
        })
    }

    /// Scan from `from` until `stop` (exclusive) or the end of the chain.
    fn find(&self, from: PAddr, stop: PAddr, word: &str) -> PmemResult<Option<EntryRecord>> {
        let mut cursor = from;
        let mut steps = 0;
        while !cursor.is_null() && cursor != stop {
            let entry = self.entry(cursor, &mut steps)?;
            if self.word_bytes(entry)? == word.as_bytes() {
                return Ok(Some(entry));
            }
            cursor = PAddr::new(self.pool.read_u64(entry.next_addr())?);
        }
        Ok(None)
    }

    fn read_count(&self, entry: EntryRecord) -> PmemResult<u64> {
        let _guard = self.count_lock(entry)?.lock();
        self.pool.read_u64(entry.count_addr())
    }

    /// Increment an existing entry's count under its lock.
    fn bump(&self, entry: EntryRecord) -> PmemResult<u64> {
        let _guard = self.count_lock(entry)?.lock();
        self.pool.run_tx(|tx| {
            let count = tx.read_u64(entry.count_addr())?;
            if count == 0 {
                return Err(PmemError::corruption(format!(
                    "entry {} has count 0",
                    entry.addr()
                )));
            }
            let next = count
                .checked_add(1)
                .ok_or_else(|| PmemError::corruption("count overflow"))?;
            tx.write_u64(entry.count_addr(), next)?;
            Ok(next)
        })
    }

    /// Allocate an entry for `word` in front of `head` and make it the
    /// bucket's new head. Caller holds the bucket's exclusive lock.
    fn link_new_entry(
        tx: &mut Transaction<'_>,
        bucket: BucketRecord,
        head: PAddr,
        word: &str,
    ) -> PmemResult<EntryRecord> {
        let addr = tx.alloc(EntryRecord::size_for(word.len()))?;
        let entry = EntryRecord::new(addr);
        tx.write_u64(entry.next_addr(), head.offset())?;
        tx.write_u64(entry.count_addr(), 1)?;
        tx.write_u64(entry.lock_addr(), 0)?;
        tx.write_u64(entry.word_len_addr(), word.len() as u64)?;
        tx.write_bytes(entry.word_addr(), word.as_bytes())?;
        tx.write_u64(bucket.head_addr(), addr.offset())?;
        Ok(entry)
    }
}

impl std::fmt::Debug for FreqTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreqTable")
            .field("table", &self.table.addr())
            .field("pool", &self.pool.path())
            .finish()
    }
}
