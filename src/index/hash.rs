//! Word hashing
//!
//! The bucket a word lives in is fixed by this function for the life of a
//! pool, so it must never change once data exists. It is deliberately not
//! `DefaultHasher`, whose output may differ between builds.

use crate::constants::NBUCKETS;

/// Map a word to its bucket index in `[0, NBUCKETS)`.
#[inline]
pub fn hash(word: &str) -> usize {
    hash_bytes(word.as_bytes())
}

/// Map raw word bytes to a bucket index.
///
/// Seeds with `NBUCKETS ^ (first << 2)`, then folds each following byte
/// together with its predecessor, shifting by an amount that cycles with the
/// position.
pub fn hash_bytes(bytes: &[u8]) -> usize {
    let Some((&first, rest)) = bytes.split_first() else {
        return 0;
    };

    let mut h = (NBUCKETS as u32) ^ (u32::from(first) << 2);
    let mut len: u32 = 0;
    let mut prev = first;
    for &cur in rest {
        len += 1;
        let shift = len % 3;
        h ^= (u32::from(cur) << shift).wrapping_add(u32::from(prev) << (shift + 7));
        prev = cur;
    }
    h ^= len;

    (h % NBUCKETS as u32) as usize
}
