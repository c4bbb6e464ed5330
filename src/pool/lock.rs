//! Locks embedded in persistent records
//!
//! A lock word lives inside the pool next to the data it protects, but its
//! state is meaningless after a restart. Every lock word carries the low 32
//! bits of the pool's run id in its upper half; a word stamped with any other
//! run id (including the all-zero word of a fresh allocation) reads as
//! unlocked. Opening a pool bumps the run id, which releases every lock a
//! crashed process left behind without touching the records.
//!
//! Lock words are never written inside transactions and never flushed.
//!
//! ```text
//! PMutex:  [run id : 32][unused : 31][locked : 1]
//! PRwLock: [run id : 32][writer : 1][readers : 31]
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::Backoff;

const RUN_SHIFT: u32 = 32;
const LOW_MASK: u64 = (1 << RUN_SHIFT) - 1;
const LOCKED: u64 = 1;
const WRITER: u64 = 1 << 31;
const READER_MASK: u64 = WRITER - 1;

/// Run tag stamped into lock words owned by the current open of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTag(u32);

impl RunTag {
    /// Derive the tag from the pool's run id. Zero is skipped so that zeroed
    /// memory never looks owned.
    pub fn from_run_id(run_id: u64) -> Self {
        match (run_id & LOW_MASK) as u32 {
            0 => Self(1),
            tag => Self(tag),
        }
    }

    #[inline]
    fn base(self) -> u64 {
        (self.0 as u64) << RUN_SHIFT
    }

    /// Normalize a lock word: a word from another run counts as unlocked.
    #[inline]
    fn current(self, word: u64) -> u64 {
        if word >> RUN_SHIFT == self.0 as u64 {
            word
        } else {
            self.base()
        }
    }
}

/// Exclusive lock over a persistent lock word
pub struct PMutex<'a> {
    word: &'a AtomicU64,
    tag: RunTag,
}

impl<'a> PMutex<'a> {
    /// Wrap a lock word for the current run
    pub fn new(word: &'a AtomicU64, tag: RunTag) -> Self {
        Self { word, tag }
    }

    /// Acquire the lock, spinning with backoff while it is held
    pub fn lock(self) -> PMutexGuard<'a> {
        let backoff = Backoff::new();
        loop {
            let raw = self.word.load(Ordering::Relaxed);
            let cur = self.tag.current(raw);
            if cur & LOCKED == 0
                && self
                    .word
                    .compare_exchange_weak(
                        raw,
                        self.tag.base() | LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return PMutexGuard {
                    word: self.word,
                    tag: self.tag,
                };
            }
            backoff.snooze();
        }
    }

    /// Try to acquire the lock without waiting
    pub fn try_lock(self) -> Option<PMutexGuard<'a>> {
        let raw = self.word.load(Ordering::Relaxed);
        if self.tag.current(raw) & LOCKED != 0 {
            return None;
        }
        self.word
            .compare_exchange(
                raw,
                self.tag.base() | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| PMutexGuard {
                word: self.word,
                tag: self.tag,
            })
    }
}

/// Guard releasing a `PMutex` on drop
pub struct PMutexGuard<'a> {
    word: &'a AtomicU64,
    tag: RunTag,
}

impl Drop for PMutexGuard<'_> {
    fn drop(&mut self) {
        self.word.store(self.tag.base(), Ordering::Release);
    }
}

/// Reader/writer lock over a persistent lock word
pub struct PRwLock<'a> {
    word: &'a AtomicU64,
    tag: RunTag,
}

impl<'a> PRwLock<'a> {
    /// Wrap a lock word for the current run
    pub fn new(word: &'a AtomicU64, tag: RunTag) -> Self {
        Self { word, tag }
    }

    /// Acquire in shared mode
    pub fn read(self) -> PReadGuard<'a> {
        let backoff = Backoff::new();
        loop {
            let raw = self.word.load(Ordering::Relaxed);
            let cur = self.tag.current(raw);
            if cur & WRITER == 0
                && cur & READER_MASK < READER_MASK
                && self
                    .word
                    .compare_exchange_weak(raw, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return PReadGuard { word: self.word };
            }
            backoff.snooze();
        }
    }

    /// Acquire in exclusive mode
    pub fn write(self) -> PWriteGuard<'a> {
        let backoff = Backoff::new();
        loop {
            let raw = self.word.load(Ordering::Relaxed);
            let cur = self.tag.current(raw);
            if cur & (WRITER | READER_MASK) == 0
                && self
                    .word
                    .compare_exchange_weak(
                        raw,
                        self.tag.base() | WRITER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return PWriteGuard {
                    word: self.word,
                    tag: self.tag,
                };
            }
            backoff.snooze();
        }
    }
}

/// Guard releasing a shared hold on drop
pub struct PReadGuard<'a> {
    word: &'a AtomicU64,
}

impl Drop for PReadGuard<'_> {
    fn drop(&mut self) {
        // The word was stamped by the acquiring CAS, so it is current.
        self.word.fetch_sub(1, Ordering::Release);
    }
}

/// Guard releasing an exclusive hold on drop
pub struct PWriteGuard<'a> {
    word: &'a AtomicU64,
    tag: RunTag,
}

impl Drop for PWriteGuard<'_> {
    fn drop(&mut self) {
        self.word.store(self.tag.base(), Ordering::Release);
    }
}
