//! Scoped transactions
//!
//! A `Transaction` groups writes to the pool so that they become durable
//! together or not at all. Dropping a transaction that was not committed
//! rolls it back; a process that dies mid-transaction is rolled back by the
//! next `Pool::open`.

use crate::address::PAddr;
use crate::pool::lane::UndoLane;
use crate::pool::Pool;
use crate::status::PmemResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    Aborted,
}

/// An open transaction holding one undo-log lane
pub struct Transaction<'p> {
    pool: &'p Pool,
    lane: UndoLane,
    state: TxState,
    /// Ranges with an undo record in this transaction
    logged: Vec<(PAddr, u64)>,
    /// Ranges allocated by this transaction; unreachable until commit
    fresh: Vec<(PAddr, u64)>,
    /// Ranges to persist at commit
    dirty: Vec<(PAddr, u64)>,
}

fn covers(ranges: &[(PAddr, u64)], addr: PAddr, len: u64) -> bool {
    ranges.iter().any(|&(start, size)| {
        addr.offset() >= start.offset() && addr.offset() + len <= start.offset() + size
    })
}

impl<'p> Transaction<'p> {
    pub(crate) fn begin(pool: &'p Pool) -> Self {
        Self {
            lane: pool.lanes.acquire(),
            pool,
            state: TxState::Active,
            logged: Vec::new(),
            fresh: Vec::new(),
            dirty: Vec::new(),
        }
    }

    /// Index of the undo-log lane this transaction holds
    pub fn lane(&self) -> usize {
        self.lane.index()
    }

    /// Record the current contents of a range so it can be restored on abort.
    ///
    /// Ranges allocated by this transaction and ranges already recorded are
    /// skipped.
    pub fn snapshot(&mut self, addr: PAddr, len: u64) -> PmemResult<()> {
        if covers(&self.fresh, addr, len) || covers(&self.logged, addr, len) {
            return Ok(());
        }
        let mem = &self.pool.mem;
        let old = mem.bytes(addr, len)?;
        self.lane.append(mem, addr, old)?;
        self.logged.push((addr, len));
        Ok(())
    }

    /// Read a u64 field
    pub fn read_u64(&self, addr: PAddr) -> PmemResult<u64> {
        self.pool.mem.load_u64(addr)
    }

    /// Transactionally overwrite a u64 field
    pub fn write_u64(&mut self, addr: PAddr, value: u64) -> PmemResult<()> {
        self.snapshot(addr, 8)?;
        self.pool.mem.store_u64(addr, value)?;
        self.dirty.push((addr, 8));
        Ok(())
    }

    /// Transactionally overwrite a byte range
    pub fn write_bytes(&mut self, addr: PAddr, data: &[u8]) -> PmemResult<()> {
        let len = data.len() as u64;
        self.snapshot(addr, len)?;
        self.pool.mem.copy_in(addr, data)?;
        self.dirty.push((addr, len));
        Ok(())
    }

    /// Allocate `size` bytes. The contents are unspecified until written.
    ///
    /// If the transaction aborts the allocation leaks; it is never handed out
    /// again.
    pub fn alloc(&mut self, size: u64) -> PmemResult<PAddr> {
        let (addr, size) = self.pool.allocate(size)?;
        self.fresh.push((addr, size));
        self.dirty.push((addr, size));
        Ok(addr)
    }

    /// Allocate `size` zeroed bytes
    pub fn alloc_zeroed(&mut self, size: u64) -> PmemResult<PAddr> {
        let addr = self.alloc(size)?;
        self.pool.mem.zero(addr, size)?;
        Ok(addr)
    }

    /// Make every write durable and release the undo log.
    pub fn commit(mut self) -> PmemResult<()> {
        let mem = &self.pool.mem;
        for &(addr, len) in &self.dirty {
            mem.persist(addr, len)?;
        }
        self.lane.truncate(mem)?;
        self.state = TxState::Committed;
        Ok(())
    }

    /// Restore every overwritten range and release the undo log.
    pub fn abort(mut self) -> PmemResult<()> {
        self.rollback()
    }

    fn rollback(&mut self) -> PmemResult<()> {
        self.state = TxState::Aborted;
        let undone = self.lane.rollback(&self.pool.mem)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(lane = self.lane.index(), undone, "transaction aborted");
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            if let Err(err) = self.rollback() {
                tracing::error!(lane = self.lane.index(), error = %err, "transaction rollback failed");
            }
        }
        self.pool.lanes.release(self.lane);
    }
}

impl Pool {
    /// Start a transaction, blocking until an undo-log lane is free.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::begin(self)
    }

    /// Run `f` inside a transaction: commit if it returns `Ok`, roll back if
    /// it returns `Err`.
    pub fn run_tx<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> PmemResult<T>,
    ) -> PmemResult<T> {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = tx.abort() {
                    tracing::error!(error = %abort_err, cause = %err, "abort after failed transaction");
                    return Err(abort_err);
                }
                Err(err)
            }
        }
    }
}
