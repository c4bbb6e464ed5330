//! Counting workers
//!
//! One worker per input file; each tokenizes its file and feeds every word
//! to `FreqTable::update`. A failing worker stops at its first error but does
//! not disturb the others, and every word it counted before the failure stays
//! counted.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::index::FreqTable;
use crate::status::PmemError;
use crate::words::words;

/// Errors from a counting worker
#[derive(Debug, thiserror::Error)]
pub enum CountError {
    /// The input could not be opened or read.
    #[error("cannot read {}: {source}", path.display())]
    Input {
        /// Input file.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The table rejected an update.
    #[error("storage failure while counting {}: {source}", path.display())]
    Store {
        /// Input file.
        path: PathBuf,
        /// Underlying error.
        source: PmemError,
    },
    /// The worker thread panicked.
    #[error("worker for {} panicked", path.display())]
    Panicked {
        /// Input file.
        path: PathBuf,
    },
}

impl CountError {
    /// Input the failing worker was processing
    pub fn path(&self) -> &Path {
        match self {
            CountError::Input { path, .. }
            | CountError::Store { path, .. }
            | CountError::Panicked { path } => path,
        }
    }
}

/// Outcome of one successful worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    /// Input file
    pub path: PathBuf,
    /// Words counted
    pub words: u64,
    /// Wall time spent
    pub elapsed: Duration,
}

/// Count every word of `reader`. `path` labels errors.
pub fn count_reader<R: BufRead>(
    table: &FreqTable,
    reader: R,
    path: &Path,
) -> Result<u64, CountError> {
    let mut counted = 0;
    for word in words(reader) {
        let word = word.map_err(|source| CountError::Input {
            path: path.to_path_buf(),
            source,
        })?;
        table.update(&word).map_err(|source| CountError::Store {
            path: path.to_path_buf(),
            source,
        })?;
        counted += 1;
    }
    Ok(counted)
}

/// Count every word of the file at `path`.
pub fn count_file(table: &FreqTable, path: &Path) -> Result<FileSummary, CountError> {
    let started = Instant::now();
    let file = File::open(path).map_err(|source| CountError::Input {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!(path = %path.display(), "worker started");
    let words = count_reader(table, BufReader::new(file), path)?;
    let elapsed = started.elapsed();
    tracing::info!(
        path = %path.display(),
        words,
        elapsed_ms = elapsed.as_millis() as u64,
        "worker finished"
    );

    Ok(FileSummary {
        path: path.to_path_buf(),
        words,
        elapsed,
    })
}

/// Count `paths` in parallel, one thread per file, and wait for all of them.
///
/// Results are returned in the order of `paths`.
pub fn count_files(
    table: &FreqTable,
    paths: &[PathBuf],
) -> Vec<Result<FileSummary, CountError>> {
    thread::scope(|scope| {
        let handles: Vec<_> = paths
            .iter()
            .map(|path| (path, scope.spawn(move || count_file(table, path))))
            .collect();

        handles
            .into_iter()
            .map(|(path, handle)| {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(CountError::Panicked {
                        path: path.clone(),
                    })
                });
                if let Err(err) = &result {
                    tracing::error!(error = %err, "worker failed");
                }
                result
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::LAYOUT;
    use crate::pool::{Pool, PoolConfig};
    use std::io::Cursor;
    use std::sync::Arc;

    fn table(dir: &tempfile::TempDir) -> FreqTable {
        let config = PoolConfig {
            size: 8 << 20,
            lanes: 8,
            lane_log_size: 1024,
            flush: false,
        };
        let pool = Pool::create(dir.path().join("pool"), LAYOUT, &config).unwrap();
        FreqTable::ensure_allocated(Arc::new(pool)).unwrap()
    }

    #[test]
    fn test_count_reader() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let n = count_reader(&table, Cursor::new(b"a a b a".to_vec()), Path::new("mem")).unwrap();
        assert_eq!(n, 4);
        assert_eq!(table.get("a").unwrap(), Some(3));
        assert_eq!(table.get("b").unwrap(), Some(1));
        assert_eq!(table.stats().unwrap().entries, 2);
    }

    #[test]
    fn test_missing_file_fails_only_its_worker() {
        let dir = tempfile::tempdir().unwrap();
        let table = table(&dir);
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "x y x").unwrap();
        let missing = dir.path().join("missing.txt");

        let results = count_files(&table, &[good.clone(), missing.clone()]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().words, 3);
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(err, CountError::Input { .. }));
        assert_eq!(err.path(), missing.as_path());
        assert_eq!(table.get("x").unwrap(), Some(2));
    }
}
