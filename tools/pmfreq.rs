// pmfreq - count words from files into a persistent pool
//
// Usage:
//   pmfreq <POOL> <FILE>... [--config pmfreq.toml] [--dump [--top N]] [--verify]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pmfreq::config::PmfreqConfig;
use pmfreq::{count_files, FreqTable, Pool, WordCount};

#[derive(Parser, Debug)]
#[command(name = "pmfreq")]
#[command(about = "Crash-consistent parallel word counter", long_about = None)]
struct Args {
    /// Pool file, created if missing
    #[arg(value_name = "POOL")]
    pool: PathBuf,

    /// Input files, one worker thread each
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// TOML configuration file (default: $PMFREQ_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the counts after counting, most frequent first
    #[arg(short, long)]
    dump: bool,

    /// Print only the N most frequent words
    #[arg(long, value_name = "N", requires = "dump")]
    top: Option<usize>,

    /// Check the table's structure after counting
    #[arg(long)]
    verify: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match PmfreqConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("pmfreq: configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&args, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(error = %err, "pmfreq failed");
            eprintln!("pmfreq: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when some worker failed.
fn run(args: &Args, config: &PmfreqConfig) -> Result<bool, pmfreq::PmemError> {
    let pool = Pool::open_or_create(&args.pool, config.layout(), &config.to_pool_config())?;
    let table = FreqTable::ensure_allocated(Arc::new(pool))?;

    let results = count_files(&table, &args.files);
    let mut failed = 0;
    let mut words = 0;
    for result in &results {
        match result {
            Ok(summary) => words += summary.words,
            Err(err) => {
                eprintln!("pmfreq: {err}");
                failed += 1;
            }
        }
    }
    tracing::info!(files = results.len(), failed, words, "counting finished");

    if args.verify {
        let stats = table.verify()?;
        println!(
            "ok: {} words, {} distinct, {} buckets used, longest chain {}",
            stats.total_words, stats.entries, stats.used_buckets, stats.longest_chain
        );
    }

    if args.dump {
        let mut entries = table.entries()?;
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
        let limit = args.top.unwrap_or(entries.len());
        for WordCount { word, count } in entries.iter().take(limit) {
            println!("{count:>10} {word}");
        }
    }

    let pool = Arc::clone(table.pool());
    drop(table);
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.close()?,
        Err(_) => tracing::warn!("pool still shared at exit; skipping close"),
    }

    Ok(failed == 0)
}
