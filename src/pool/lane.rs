//! Undo-log lanes
//!
//! Each running transaction owns one lane: a fixed region of the pool that
//! records the old contents of every range the transaction overwrites.
//!
//! ```text
//! +-----------------+
//! | used bytes (8)  |  0 means no transaction in flight
//! +-----------------+--------------+----------------+-------------------+
//! | target (8)      | length (8)   | checksum (8)   | old bytes, padded |
//! +-----------------+--------------+----------------+-------------------+
//! | ...next record                                                      |
//! ```
//!
//! A record is persisted before `used` is advanced past it, and `used` is
//! persisted before the target range is modified. Truncating `used` to zero
//! is the commit point. Recovery replays the records of every lane with a
//! non-zero `used` in reverse order.

use parking_lot::{Condvar, Mutex};

use crate::address::PAddr;
use crate::pool::format::compute_xor_checksum;
use crate::pool::mapping::PoolMemory;
use crate::status::{PmemError, PmemResult};

/// Size of the lane header (the `used` counter)
pub const LANE_HEADER_SIZE: u64 = 8;

/// Size of an undo record header
pub const RECORD_HEADER_SIZE: u64 = 24;

/// Smallest lane the pool accepts
pub const MIN_LANE_SIZE: u64 = 256;

const RECORD_SEED: u64 = 0x504d_4652_5544_4f31; // "PMFRUDO1"

fn padded(len: u64) -> u64 {
    len.div_ceil(8) * 8
}

fn record_checksum(target: PAddr, old: &[u8]) -> u64 {
    RECORD_SEED ^ target.offset() ^ (old.len() as u64).rotate_left(32) ^ compute_xor_checksum(old)
}

/// One undo-log lane
#[derive(Debug, Clone, Copy)]
pub(crate) struct UndoLane {
    index: usize,
    start: PAddr,
    size: u64,
}

impl UndoLane {
    pub(crate) fn new(index: usize, start: PAddr, size: u64) -> Self {
        Self { index, start, size }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Usable bytes for undo records
    pub(crate) fn capacity(&self) -> u64 {
        self.size - LANE_HEADER_SIZE
    }

    pub(crate) fn used(&self, mem: &PoolMemory) -> PmemResult<u64> {
        mem.load_u64(self.start)
    }

    /// Append an undo record holding `old`, the current contents of `target`.
    pub(crate) fn append(&self, mem: &PoolMemory, target: PAddr, old: &[u8]) -> PmemResult<()> {
        let used = self.used(mem)?;
        let record_len = RECORD_HEADER_SIZE + padded(old.len() as u64);
        if used + record_len > self.capacity() {
            return Err(PmemError::TxLogFull {
                needed: used + record_len,
                capacity: self.capacity(),
            });
        }

        let record = self.start + LANE_HEADER_SIZE + used;
        mem.store_u64(record, target.offset())?;
        mem.store_u64(record.field(8), old.len() as u64)?;
        mem.store_u64(record.field(16), record_checksum(target, old))?;
        mem.copy_in(record.field(RECORD_HEADER_SIZE), old)?;
        mem.persist(record, record_len)?;

        mem.store_u64(self.start, used + record_len)?;
        mem.persist(self.start, LANE_HEADER_SIZE)
    }

    /// Drop all records. This is the commit point of the owning transaction.
    pub(crate) fn truncate(&self, mem: &PoolMemory) -> PmemResult<()> {
        mem.store_u64(self.start, 0)?;
        mem.persist(self.start, LANE_HEADER_SIZE)
    }

    /// Restore every recorded range, newest first, then truncate.
    ///
    /// Returns the number of records undone.
    pub(crate) fn rollback(&self, mem: &PoolMemory) -> PmemResult<usize> {
        let used = self.used(mem)?;
        if used == 0 {
            return Ok(0);
        }
        if used > self.capacity() {
            return Err(PmemError::corruption(format!(
                "lane {} claims {used} undo bytes, capacity {}",
                self.index,
                self.capacity()
            )));
        }

        let mut records = Vec::new();
        let mut pos = 0;
        while pos < used {
            if pos + RECORD_HEADER_SIZE > used {
                return Err(self.torn(pos));
            }
            let record = self.start + LANE_HEADER_SIZE + pos;
            let target = PAddr::new(mem.load_u64(record)?);
            let len = mem.load_u64(record.field(8))?;
            let checksum = mem.load_u64(record.field(16))?;
            let record_len = RECORD_HEADER_SIZE + padded(len);
            if pos + record_len > used {
                return Err(self.torn(pos));
            }

            let old = mem.bytes(record.field(RECORD_HEADER_SIZE), len)?;
            if record_checksum(target, old) != checksum {
                return Err(PmemError::corruption(format!(
                    "lane {} undo record at +{pos} failed its checksum",
                    self.index
                )));
            }
            records.push((target, old));
            pos += record_len;
        }

        for (target, old) in records.iter().rev() {
            mem.copy_in(*target, old)?;
            mem.persist(*target, old.len() as u64)?;
        }
        self.truncate(mem)?;
        Ok(records.len())
    }

    fn torn(&self, pos: u64) -> PmemError {
        PmemError::corruption(format!(
            "lane {} undo record at +{pos} overruns the log",
            self.index
        ))
    }
}

/// Free list of lanes; transactions block here when every lane is busy.
pub(crate) struct LanePool {
    lanes: Vec<UndoLane>,
    free: Mutex<Vec<usize>>,
    available: Condvar,
}

impl LanePool {
    pub(crate) fn new(lanes: Vec<UndoLane>) -> Self {
        let free = (0..lanes.len()).rev().collect();
        Self {
            lanes,
            free: Mutex::new(free),
            available: Condvar::new(),
        }
    }

    pub(crate) fn lanes(&self) -> &[UndoLane] {
        &self.lanes
    }

    pub(crate) fn acquire(&self) -> UndoLane {
        let mut free = self.free.lock();
        loop {
            if let Some(index) = free.pop() {
                return self.lanes[index];
            }
            self.available.wait(&mut free);
        }
    }

    pub(crate) fn release(&self, lane: UndoLane) {
        self.free.lock().push(lane.index());
        self.available.notify_one();
    }
}
