//! Persistent heap
//!
//! A pool is a file mapped into memory that holds a header, a set of
//! undo-log lanes and a bump-allocated heap. Objects inside it refer to each
//! other by `PAddr` offsets, so the graph survives restarts. Every mutation of
//! reachable state goes through a [`Transaction`].
//!
//! # Crash consistency
//!
//! - The heap top is persisted before an allocation is returned, so space
//!   handed to a transaction that later aborts (or a process that crashes)
//!   leaks instead of being reused while still referenced.
//! - Overwrites of existing bytes are undo-logged first; `Pool::open` rolls
//!   back every lane that still holds records.
//! - Lock words embedded in records are released implicitly by bumping the
//!   run id on open (see [`lock`]).

mod format;
mod lane;
pub mod lock;
mod mapping;
mod tx;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::address::PAddr;
use crate::size::{KIB, MIB};
use crate::status::{PmemError, PmemResult};

pub use format::{compute_xor_checksum, inspect, PoolHeader, PoolInfo, HEADER_SIZE, POOL_MAGIC};
pub use lock::RunTag;
pub use tx::Transaction;

use format::{HEAP_TOP_FIELD, ROOT_OFFSET_FIELD, ROOT_SIZE_FIELD, RUN_ID_FIELD};
use lane::{LanePool, UndoLane, MIN_LANE_SIZE};
use mapping::PoolMemory;

/// Pool creation and runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool file size in bytes (used on create only)
    pub size: u64,
    /// Number of undo-log lanes, i.e. concurrent transactions (create only)
    pub lanes: usize,
    /// Bytes per lane (create only)
    pub lane_log_size: u64,
    /// Persist with msync on commit. Without it a process crash is still
    /// survived (the page cache holds the writes) but power loss is not.
    pub flush: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 64 * MIB,
            lanes: 32,
            lane_log_size: 4 * KIB,
            flush: true,
        }
    }
}

/// An open persistent heap
pub struct Pool {
    path: PathBuf,
    header: PoolHeader,
    mem: PoolMemory,
    lanes: LanePool,
    run_id: u64,
    tag: RunTag,
    alloc_lock: Mutex<()>,
    root_lock: Mutex<()>,
}

impl Pool {
    /// Create a new pool file. Fails if `path` already exists.
    pub fn create(path: impl AsRef<Path>, layout: &str, config: &PoolConfig) -> PmemResult<Self> {
        let path = path.as_ref();
        if config.lanes == 0 {
            return Err(PmemError::InvalidArgument("pool needs at least one lane".into()));
        }
        if config.lane_log_size < MIN_LANE_SIZE || config.lane_log_size % 8 != 0 {
            return Err(PmemError::InvalidArgument(format!(
                "lane size must be a multiple of 8 and at least {MIN_LANE_SIZE}, got {}",
                config.lane_log_size
            )));
        }
        let header = PoolHeader::new(layout, config.size, config.lanes as u64, config.lane_log_size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(header.pool_size)?;

        let mem = PoolMemory::map(file, config.flush)?;
        let mut page = vec![0u8; HEADER_SIZE as usize];
        header.encode(&mut page)?;
        mem.copy_in(PAddr::NULL, &page)?;
        mem.store_u64(HEAP_TOP_FIELD, header.heap_start)?;
        mem.persist_all()?;

        tracing::info!(
            path = %path.display(),
            layout,
            size = header.pool_size,
            lanes = header.nlanes,
            uuid = %header.uuid,
            "pool created"
        );

        Self::attach(path, header, mem)
    }

    /// Open an existing pool, rolling back any transaction a previous
    /// process left unfinished.
    pub fn open(path: impl AsRef<Path>, layout: &str, config: &PoolConfig) -> PmemResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = check_file_len(path, &file)?;
        let mem = PoolMemory::map(file, config.flush)?;
        Self::open_mapped(path, layout, mem, file_len)
    }

    /// Open a private copy-on-write view of an existing pool.
    ///
    /// Recovery, the run id bump and any later transactions apply to the
    /// view only; the file is opened read-only and never modified.
    pub fn open_snapshot(path: impl AsRef<Path>, layout: &str) -> PmemResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path)?;
        let file_len = check_file_len(path, &file)?;
        let mem = PoolMemory::map_private(file)?;
        Self::open_mapped(path, layout, mem, file_len)
    }

    fn open_mapped(path: &Path, layout: &str, mem: PoolMemory, file_len: u64) -> PmemResult<Self> {
        let header = PoolHeader::decode(mem.bytes(PAddr::NULL, HEADER_SIZE)?)?;
        if header.layout != layout {
            return Err(PmemError::LayoutMismatch {
                expected: layout.to_string(),
                found: header.layout,
            });
        }
        if header.pool_size != file_len {
            return Err(PmemError::Format(format!(
                "header records {} bytes but file has {file_len}",
                header.pool_size
            )));
        }
        if header.lanes_end() > header.heap_start {
            return Err(PmemError::Format("lane region overlaps the heap".into()));
        }

        let pool = Self::attach(path, header, mem)?;
        pool.recover()?;

        let heap_top = pool.mem.load_u64(HEAP_TOP_FIELD)?;
        if heap_top < pool.header.heap_start || heap_top > pool.header.pool_size {
            return Err(PmemError::corruption(format!(
                "heap top {heap_top:#x} outside heap"
            )));
        }

        tracing::info!(
            path = %path.display(),
            layout,
            run_id = pool.run_id,
            heap_used = heap_top - pool.header.heap_start,
            snapshot = pool.mem.is_private(),
            "pool opened"
        );
        Ok(pool)
    }

    /// Open `path` if it exists, otherwise create it.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        layout: &str,
        config: &PoolConfig,
    ) -> PmemResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, layout, config)
        } else {
            Self::create(path, layout, config)
        }
    }

    fn attach(path: &Path, header: PoolHeader, mem: PoolMemory) -> PmemResult<Self> {
        let run_id = mem.load_u64(RUN_ID_FIELD)?.wrapping_add(1);
        mem.store_u64(RUN_ID_FIELD, run_id)?;
        mem.persist(RUN_ID_FIELD, 8)?;

        let lanes = (0..header.nlanes as usize)
            .map(|i| UndoLane::new(i, PAddr::new(header.lane_offset(i)), header.lane_size))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            header,
            mem,
            lanes: LanePool::new(lanes),
            run_id,
            tag: RunTag::from_run_id(run_id),
            alloc_lock: Mutex::new(()),
            root_lock: Mutex::new(()),
        })
    }

    fn recover(&self) -> PmemResult<()> {
        for lane in self.lanes.lanes() {
            let undone = lane.rollback(&self.mem)?;
            if undone > 0 {
                tracing::warn!(
                    lane = lane.index(),
                    records = undone,
                    "rolled back interrupted transaction"
                );
            }
        }
        Ok(())
    }

    /// Flush everything and unmap the pool.
    pub fn close(self) -> PmemResult<()> {
        self.mem.persist_all()?;
        tracing::info!(path = %self.path.display(), "pool closed");
        Ok(())
    }

    /// Bump-allocate `size` bytes, rounded up to the allocator alignment.
    ///
    /// Returns the address and the rounded size.
    pub(crate) fn allocate(&self, size: u64) -> PmemResult<(PAddr, u64)> {
        if size == 0 {
            return Err(PmemError::InvalidArgument("zero-sized allocation".into()));
        }
        let size = size.div_ceil(PAddr::ALIGNMENT) * PAddr::ALIGNMENT;

        let _guard = self.alloc_lock.lock();
        let top = self.mem.load_u64(HEAP_TOP_FIELD)?;
        let available = self.header.pool_size.saturating_sub(top);
        if size > available {
            return Err(PmemError::OutOfSpace {
                requested: size,
                available,
            });
        }
        self.mem.store_u64(HEAP_TOP_FIELD, top + size)?;
        self.mem.persist(HEAP_TOP_FIELD, 8)?;
        Ok((PAddr::new(top), size))
    }

    /// The pool's root object, allocated zeroed on first use.
    ///
    /// Every caller must ask for the same size for the life of the pool.
    pub fn root(&self, size: u64) -> PmemResult<PAddr> {
        let _guard = self.root_lock.lock();
        if let Some(root) = self.existing_root(size)? {
            return Ok(root);
        }

        self.run_tx(|tx| {
            let root = tx.alloc_zeroed(size)?;
            tx.write_u64(ROOT_OFFSET_FIELD, root.offset())?;
            tx.write_u64(ROOT_SIZE_FIELD, size)?;
            Ok(root)
        })
    }

    /// The root object if one was ever allocated. Never allocates.
    pub fn existing_root(&self, size: u64) -> PmemResult<Option<PAddr>> {
        let root = PAddr::new(self.mem.load_u64(ROOT_OFFSET_FIELD)?);
        if root.is_null() {
            return Ok(None);
        }
        let recorded = self.mem.load_u64(ROOT_SIZE_FIELD)?;
        if recorded != size {
            return Err(PmemError::LayoutMismatch {
                expected: format!("root of {size} bytes"),
                found: format!("root of {recorded} bytes"),
            });
        }
        Ok(Some(root))
    }

    /// Read a u64 field
    pub fn read_u64(&self, addr: PAddr) -> PmemResult<u64> {
        self.mem.load_u64(addr)
    }

    pub(crate) fn atomic_u64(&self, addr: PAddr) -> PmemResult<&std::sync::atomic::AtomicU64> {
        self.mem.atomic_u64(addr)
    }

    /// Borrow immutable bytes (see `PoolMemory::bytes` for the contract).
    pub(crate) fn bytes(&self, addr: PAddr, len: u64) -> PmemResult<&[u8]> {
        self.mem.bytes(addr, len)
    }

    /// Tag for lock words owned by this open of the pool
    pub fn run_tag(&self) -> RunTag {
        self.tag
    }

    /// Run id of this open; bumped on every open
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Static header
    pub fn header(&self) -> &PoolHeader {
        &self.header
    }

    /// Path of the pool file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total pool size in bytes
    pub fn size(&self) -> u64 {
        self.mem.len()
    }

    /// Bytes allocated from the heap so far, including leaked allocations
    pub fn heap_used(&self) -> PmemResult<u64> {
        Ok(self.mem.load_u64(HEAP_TOP_FIELD)? - self.header.heap_start)
    }

    /// Whether `addr .. addr + len` lies inside the heap
    pub(crate) fn in_heap(&self, addr: PAddr, len: u64) -> bool {
        addr.offset() >= self.header.heap_start
            && addr
                .offset()
                .checked_add(len)
                .is_some_and(|end| end <= self.header.pool_size)
    }
}

fn check_file_len(path: &Path, file: &std::fs::File) -> PmemResult<u64> {
    let file_len = file.metadata()?.len();
    if file_len < HEADER_SIZE {
        return Err(PmemError::Format(format!(
            "{} is {file_len} bytes, smaller than a pool header",
            path.display()
        )));
    }
    Ok(file_len)
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("path", &self.path)
            .field("layout", &self.header.layout)
            .field("size", &self.header.pool_size)
            .field("run_id", &self.run_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LAYOUT: &str = "test";

    fn small_config() -> PoolConfig {
        PoolConfig {
            size: 1 << 20,
            lanes: 4,
            lane_log_size: 1024,
            flush: false,
        }
    }

    fn create_pool(dir: &TempDir) -> Pool {
        Pool::create(dir.path().join("pool"), LAYOUT, &small_config()).unwrap()
    }

    fn reopen(dir: &TempDir) -> Pool {
        Pool::open(dir.path().join("pool"), LAYOUT, &small_config()).unwrap()
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        assert_eq!(pool.run_id(), 1);
        assert_eq!(pool.heap_used().unwrap(), 0);
        pool.close().unwrap();

        let pool = reopen(&dir);
        assert_eq!(pool.run_id(), 2);
        assert_eq!(pool.header().layout, LAYOUT);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        drop(create_pool(&dir));
        let err = Pool::create(dir.path().join("pool"), LAYOUT, &small_config()).unwrap_err();
        assert!(matches!(err, PmemError::Io(_)));
    }

    #[test]
    fn test_create_rejects_overflowing_lanes() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            lanes: 1 << 62,
            ..small_config()
        };
        let err = Pool::create(dir.path().join("pool"), LAYOUT, &config).unwrap_err();
        assert!(matches!(err, PmemError::InvalidArgument(_)), "{err}");
        assert!(!dir.path().join("pool").exists());
    }

    #[test]
    fn test_open_rejects_overflowing_lanes() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempfile::tempdir().unwrap();
        let mut header = create_pool(&dir).header().clone();
        header.nlanes = 1 << 62;
        let mut page = vec![0u8; HEADER_SIZE as usize];
        header.encode(&mut page).unwrap();

        // Rewrite the static header only; dynamic fields start at 128.
        let mut file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("pool"))
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&page[..128]).unwrap();
        drop(file);

        let err = Pool::open(dir.path().join("pool"), LAYOUT, &small_config()).unwrap_err();
        assert!(matches!(err, PmemError::Format(_)), "{err}");
        let err = inspect(dir.path().join("pool")).unwrap_err();
        assert!(matches!(err, PmemError::Format(_)), "{err}");
    }

    #[test]
    fn test_flushed_pool_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            flush: true,
            ..small_config()
        };
        {
            let pool = Pool::create(dir.path().join("pool"), LAYOUT, &config).unwrap();
            let root = pool.root(16).unwrap();
            pool.run_tx(|tx| tx.write_u64(root.field(8), 77)).unwrap();
            pool.close().unwrap();
        }
        let pool = Pool::open(dir.path().join("pool"), LAYOUT, &config).unwrap();
        let root = pool.root(16).unwrap();
        assert_eq!(pool.read_u64(root.field(8)).unwrap(), 77);
    }

    #[test]
    fn test_open_rejects_other_layout() {
        let dir = tempfile::tempdir().unwrap();
        drop(create_pool(&dir));
        let err = Pool::open(dir.path().join("pool"), "other", &small_config()).unwrap_err();
        assert!(matches!(err, PmemError::LayoutMismatch { .. }));
    }

    #[test]
    fn test_root_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(64).unwrap();
        assert_eq!(pool.root(64).unwrap(), root);
        assert!(pool.root(32).is_err());
        drop(pool);

        let pool = reopen(&dir);
        assert_eq!(pool.root(64).unwrap(), root);
        assert_eq!(pool.read_u64(root).unwrap(), 0);
    }

    #[test]
    fn test_commit_is_visible_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(16).unwrap();

        pool.run_tx(|tx| tx.write_u64(root, 41)).unwrap();
        pool.run_tx(|tx| {
            let v = tx.read_u64(root)?;
            tx.write_u64(root, v + 1)
        })
        .unwrap();
        drop(pool);

        let pool = reopen(&dir);
        assert_eq!(pool.read_u64(root).unwrap(), 42);
    }

    #[test]
    fn test_error_in_closure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(16).unwrap();
        pool.run_tx(|tx| tx.write_u64(root, 7)).unwrap();

        let result: PmemResult<()> = pool.run_tx(|tx| {
            tx.write_u64(root, 8)?;
            tx.write_u64(root.field(8), 9)?;
            Err(PmemError::InvalidArgument("stop".into()))
        });
        assert!(result.is_err());
        assert_eq!(pool.read_u64(root).unwrap(), 7);
        assert_eq!(pool.read_u64(root.field(8)).unwrap(), 0);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(8).unwrap();

        {
            let mut tx = pool.begin();
            tx.write_u64(root, 99).unwrap();
            assert_eq!(pool.read_u64(root).unwrap(), 99);
        }
        assert_eq!(pool.read_u64(root).unwrap(), 0);
    }

    #[test]
    fn test_crash_before_commit_is_rolled_back_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(16).unwrap();
        pool.run_tx(|tx| tx.write_u64(root, 5)).unwrap();

        let mut tx = pool.begin();
        tx.write_u64(root, 6).unwrap();
        tx.write_u64(root.field(8), 6).unwrap();
        let lane = tx.lane();
        // Simulated crash: the undo log stays behind, nothing is rolled back.
        std::mem::forget(tx);
        drop(pool);

        let info = inspect(dir.path().join("pool")).unwrap();
        assert_eq!(info.dirty_lanes(), vec![lane]);

        let pool = reopen(&dir);
        assert_eq!(pool.read_u64(root).unwrap(), 5);
        assert_eq!(pool.read_u64(root.field(8)).unwrap(), 0);
        drop(pool);
        assert!(inspect(dir.path().join("pool")).unwrap().dirty_lanes().is_empty());
    }

    #[test]
    fn test_allocation_leaks_on_abort_but_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);

        let mut tx = pool.begin();
        let first = tx.alloc(24).unwrap();
        tx.abort().unwrap();

        let second = pool.run_tx(|tx| tx.alloc(24)).unwrap();
        assert!(second.offset() >= first.offset() + 24);
        assert_eq!(pool.heap_used().unwrap(), 48);
    }

    #[test]
    fn test_out_of_space() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let heap = pool.size() - pool.header().heap_start;

        let err = pool.run_tx(|tx| tx.alloc(heap + 8)).unwrap_err();
        assert!(matches!(err, PmemError::OutOfSpace { .. }));
        assert_eq!(pool.heap_used().unwrap(), 0);

        pool.run_tx(|tx| tx.alloc(heap)).unwrap();
        let err = pool.run_tx(|tx| tx.alloc(8)).unwrap_err();
        assert!(matches!(err, PmemError::OutOfSpace { available: 0, .. }));
    }

    #[test]
    fn test_undo_log_full() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(2048).unwrap();

        let big = vec![0xAAu8; 2048];
        let err = pool.run_tx(|tx| tx.write_bytes(root, &big)).unwrap_err();
        assert!(matches!(err, PmemError::TxLogFull { .. }));
        assert_eq!(pool.bytes(root, 2048).unwrap(), &[0u8; 2048][..]);
    }

    #[test]
    fn test_fresh_allocation_needs_no_undo() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);

        // Larger than a lane: only works because fresh ranges are not logged.
        let payload = vec![0x5Au8; 4096];
        let addr = pool
            .run_tx(|tx| {
                let addr = tx.alloc(4096)?;
                tx.write_bytes(addr, &payload)?;
                Ok(addr)
            })
            .unwrap();
        assert_eq!(pool.bytes(addr, 4096).unwrap(), &payload[..]);
    }

    #[test]
    fn test_concurrent_transactions_share_lanes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(8 * 8).unwrap();

        std::thread::scope(|s| {
            for t in 0..8u64 {
                let pool = &pool;
                s.spawn(move || {
                    for _ in 0..100 {
                        pool.run_tx(|tx| {
                            let field = root.field(t * 8);
                            let v = tx.read_u64(field)?;
                            tx.write_u64(field, v + 1)
                        })
                        .unwrap();
                    }
                });
            }
        });

        for t in 0..8u64 {
            assert_eq!(pool.read_u64(root.field(t * 8)).unwrap(), 100);
        }
    }

    #[test]
    fn test_corrupt_undo_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir);
        let root = pool.root(8).unwrap();

        let mut tx = pool.begin();
        tx.write_u64(root, 1).unwrap();
        let lane = tx.lane();
        std::mem::forget(tx);
        let record_data = pool.header().lane_offset(lane) + 8 + 24;
        drop(pool);

        let path = dir.path().join("pool");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[record_data as usize] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = Pool::open(&path, LAYOUT, &small_config()).unwrap_err();
        assert!(matches!(err, PmemError::Corruption(_)));
    }
}
