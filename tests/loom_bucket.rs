//! Loom-based model checks of the bucket count-or-insert protocol.
//!
//! The harness mirrors `FreqTable::update` on a single bucket: search under
//! the shared structural lock, bump under the entry lock on a hit, and on a
//! miss take the exclusive lock and re-scan only the entries prepended since
//! the shared scan before inserting. Loom explores every interleaving of the
//! racing threads without touching the production pool code.
//!
//! Run with:
//! ```bash
//! cargo test --test loom_bucket
//! ```

use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use loom::sync::{Arc, Mutex, RwLock};
use loom::thread;

const SLOTS: usize = 4;

// ---------------------------------------------------------------------------
// Test-local harness: one bucket with a prepend-only chain.
//
// Slots are filled in order; a chain whose head is `n` holds slots
// `n-1, n-2, .., 0`, newest first. Word ids stand in for word bytes.
// ---------------------------------------------------------------------------

struct Bucket {
    structural: RwLock<()>,
    head: AtomicUsize,
    words: [AtomicU64; SLOTS],
    counts: [AtomicU64; SLOTS],
    entry_locks: [Mutex<()>; SLOTS],
}

impl Bucket {
    fn new() -> Self {
        Self {
            structural: RwLock::new(()),
            head: AtomicUsize::new(0),
            words: std::array::from_fn(|_| AtomicU64::new(0)),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            entry_locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Scan from `head` down to `stop` (exclusive).
    fn find(&self, head: usize, stop: usize, word: u64) -> Option<usize> {
        (stop..head)
            .rev()
            .find(|&slot| self.words[slot].load(Ordering::Acquire) == word)
    }

    fn bump(&self, slot: usize) -> u64 {
        let _guard = self.entry_locks[slot].lock().unwrap();
        let next = self.counts[slot].load(Ordering::Relaxed) + 1;
        self.counts[slot].store(next, Ordering::Relaxed);
        next
    }

    fn update(&self, word: u64) -> u64 {
        let seen = {
            let _shared = self.structural.read().unwrap();
            let head = self.head.load(Ordering::Acquire);
            if let Some(slot) = self.find(head, 0, word) {
                drop(_shared);
                return self.bump(slot);
            }
            head
        };

        let exclusive = self.structural.write().unwrap();
        let head = self.head.load(Ordering::Acquire);
        if let Some(slot) = self.find(head, seen, word) {
            drop(exclusive);
            return self.bump(slot);
        }
        self.words[head].store(word, Ordering::Relaxed);
        self.counts[head].store(1, Ordering::Relaxed);
        self.head.store(head + 1, Ordering::Release);
        1
    }

    fn entries(&self) -> Vec<(u64, u64)> {
        let head = self.head.load(Ordering::Acquire);
        (0..head)
            .map(|slot| {
                (
                    self.words[slot].load(Ordering::Acquire),
                    self.counts[slot].load(Ordering::Acquire),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Two threads race on the first occurrence of the same word.
/// Exactly one entry may exist afterwards, with count 2.
#[test]
fn test_loom_first_insert_race() {
    loom::model(|| {
        let bucket = Arc::new(Bucket::new());

        let b1 = Arc::clone(&bucket);
        let b2 = Arc::clone(&bucket);
        let h1 = thread::spawn(move || b1.update(7));
        let h2 = thread::spawn(move || b2.update(7));

        let mut seen = [h1.join().unwrap(), h2.join().unwrap()];
        seen.sort_unstable();
        assert_eq!(seen, [1, 2]);
        assert_eq!(bucket.entries(), vec![(7, 2)]);
    });
}

/// Two colliding words inserted concurrently both end up in the chain.
#[test]
fn test_loom_colliding_inserts() {
    loom::model(|| {
        let bucket = Arc::new(Bucket::new());

        let b1 = Arc::clone(&bucket);
        let b2 = Arc::clone(&bucket);
        let h1 = thread::spawn(move || b1.update(1));
        let h2 = thread::spawn(move || b2.update(2));

        assert_eq!(h1.join().unwrap(), 1);
        assert_eq!(h2.join().unwrap(), 1);

        let mut entries = bucket.entries();
        entries.sort_unstable();
        assert_eq!(entries, vec![(1, 1), (2, 1)]);
    });
}

/// A bump racing an insert of a different word loses no increment.
#[test]
fn test_loom_bump_races_insert() {
    loom::model(|| {
        let bucket = Arc::new(Bucket::new());
        bucket.update(1);

        let b1 = Arc::clone(&bucket);
        let b2 = Arc::clone(&bucket);
        let h1 = thread::spawn(move || b1.update(1));
        let h2 = thread::spawn(move || b2.update(2));

        assert_eq!(h1.join().unwrap(), 2);
        assert_eq!(h2.join().unwrap(), 1);

        let mut entries = bucket.entries();
        entries.sort_unstable();
        assert_eq!(entries, vec![(1, 2), (2, 1)]);
    });
}

/// Concurrent bumps of an existing entry serialize on its entry lock.
#[test]
fn test_loom_concurrent_bumps() {
    loom::model(|| {
        let bucket = Arc::new(Bucket::new());
        bucket.update(3);

        let b1 = Arc::clone(&bucket);
        let b2 = Arc::clone(&bucket);
        let h1 = thread::spawn(move || b1.update(3));
        let h2 = thread::spawn(move || b2.update(3));
        h1.join().unwrap();
        h2.join().unwrap();

        assert_eq!(bucket.entries(), vec![(3, 3)]);
    });
}
