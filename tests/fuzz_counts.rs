//! Model-based fuzzing of the word table against a `HashMap`.
//!
//! Tune with `PMFREQ_FUZZ_SEED`, `PMFREQ_FUZZ_STEPS` and
//! `PMFREQ_FUZZ_WORD_SPACE`.

mod common;
mod fuzz_util;

use std::collections::HashMap;
use std::thread;

use rand::Rng;

use common::{open_table_at, pool_path, snapshot};

fn sorted(model: &HashMap<String, u64>) -> Vec<(String, u64)> {
    let mut out: Vec<_> = model.iter().map(|(w, c)| (w.clone(), *c)).collect();
    out.sort();
    out
}

#[test]
fn fuzz_single_thread_with_reopens() {
    let params = fuzz_util::params("single_thread_with_reopens", 4_000, 500);
    let mut rng = fuzz_util::rng(params.seed);

    let dir = tempfile::tempdir().unwrap();
    let path = pool_path(&dir);
    let mut table = open_table_at(&path);
    let mut model: HashMap<String, u64> = HashMap::new();
    let mut reopens = 0;

    for _ in 0..params.steps {
        let word = fuzz_util::choose_word(&mut rng, params.word_space);
        match rng.gen_range(0u8..=99) {
            0..=69 => {
                let count = table.update(&word).unwrap();
                let expected = model.entry(word).or_default();
                *expected += 1;
                assert_eq!(count, *expected);
            }
            70..=94 => {
                assert_eq!(table.get(&word).unwrap(), model.get(&word).copied());
            }
            95..=97 => {
                let stats = table.verify().unwrap();
                assert_eq!(stats.entries, model.len() as u64);
                assert_eq!(stats.total_words, model.values().sum::<u64>());
            }
            _ => {
                drop(table);
                table = open_table_at(&path);
                reopens += 1;
            }
        }
    }

    assert_eq!(snapshot(&table), sorted(&model));
    table.verify().unwrap();
    assert!(reopens > 0 || params.steps < 100);
}

#[test]
fn fuzz_concurrent_workers() {
    const THREADS: u64 = 4;
    let params = fuzz_util::params("concurrent_workers", 2_000, 200);

    let dir = tempfile::tempdir().unwrap();
    let table = open_table_at(&pool_path(&dir));

    let models: Vec<HashMap<String, u64>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let table = &table;
                scope.spawn(move || {
                    let mut rng = fuzz_util::rng(params.seed ^ t);
                    let mut model = HashMap::new();
                    for _ in 0..params.steps {
                        let word = fuzz_util::choose_word(&mut rng, params.word_space);
                        table.update(&word).unwrap();
                        *model.entry(word).or_default() += 1;
                    }
                    model
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut merged: HashMap<String, u64> = HashMap::new();
    for model in models {
        for (word, count) in model {
            *merged.entry(word).or_default() += count;
        }
    }

    assert_eq!(snapshot(&table), sorted(&merged));
    let stats = table.verify().unwrap();
    assert_eq!(stats.total_words, THREADS * params.steps as u64);
}
