#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy)]
pub struct FuzzParams {
    pub seed: u64,
    pub steps: usize,
    pub word_space: u64,
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse::<usize>().ok()
}

fn mix_seed(mut seed: u64, tag: &str) -> u64 {
    // Each test gets a different deterministic stream by default.
    for (i, b) in tag.as_bytes().iter().enumerate() {
        seed ^= (*b as u64) << ((i % 8) * 8);
        seed = seed.rotate_left(13).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
    seed
}

pub fn params(test_tag: &str, default_steps: usize, default_word_space: u64) -> FuzzParams {
    let base_seed = env_u64("PMFREQ_FUZZ_SEED").unwrap_or(0xA1B2_C3D4_E5F6_0708);
    let steps = env_usize("PMFREQ_FUZZ_STEPS").unwrap_or(default_steps);
    let word_space = env_u64("PMFREQ_FUZZ_WORD_SPACE").unwrap_or(default_word_space);

    FuzzParams {
        seed: mix_seed(base_seed, test_tag),
        steps,
        word_space: word_space.max(1),
    }
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Spell `n` in base 26 with lowercase letters.
pub fn word_for(mut n: u64) -> String {
    let mut word = Vec::new();
    loop {
        word.push(b'a' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
    }
    word.into_iter().map(char::from).collect()
}

/// A word from the first `word_space` base-26 spellings, or occasionally a
/// pair known to share a bucket.
pub fn choose_word(rng: &mut StdRng, word_space: u64) -> String {
    match rng.gen_range(0u8..20) {
        0 => "acd".to_string(),
        1 => "eaa".to_string(),
        _ => word_for(rng.gen_range(0..word_space)),
    }
}
