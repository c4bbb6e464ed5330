//! Raw access to the mapped pool file
//!
//! `PoolMemory` owns the mapping and hands out bounds-checked views into it.
//! All concurrent access discipline (which thread may touch which bytes) is
//! enforced one level up, by transactions and record locks.

use std::fs::File;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::address::PAddr;
use crate::status::{PmemError, PmemResult};

pub(crate) struct PoolMemory {
    mmap: MmapMut,
    base: *mut u8,
    len: u64,
    flush: bool,
    /// Copy-on-write view; writes never reach the file.
    private: bool,
    _file: File,
}

// SAFETY: the mapping is shared memory addressed through `base`; the pool's
// transaction lanes, allocator lock and record locks guarantee that no two
// threads write overlapping bytes concurrently, and u64 fields that are read
// while another thread may write them go through `AtomicU64`.
unsafe impl Send for PoolMemory {}
unsafe impl Sync for PoolMemory {}

impl PoolMemory {
    /// Map the whole file read-write.
    pub(crate) fn map(file: File, flush: bool) -> io::Result<Self> {
        // SAFETY: the pool file is owned by this process for the lifetime of
        // the mapping (single-process use); nothing truncates it while mapped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::from_mmap(mmap, file, flush, false))
    }

    /// Map the whole file as a private copy-on-write view.
    pub(crate) fn map_private(file: File) -> io::Result<Self> {
        // SAFETY: as for `map`; the view is private so the file itself is
        // only read.
        let mmap = unsafe { MmapOptions::new().map_copy(&file)? };
        Ok(Self::from_mmap(mmap, file, false, true))
    }

    fn from_mmap(mut mmap: MmapMut, file: File, flush: bool, private: bool) -> Self {
        let base = mmap.as_mut_ptr();
        let len = mmap.len() as u64;
        Self {
            mmap,
            base,
            len,
            flush,
            private,
            _file: file,
        }
    }

    pub(crate) fn is_private(&self) -> bool {
        self.private
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    fn check(&self, addr: PAddr, len: u64) -> PmemResult<usize> {
        match addr.offset().checked_add(len) {
            Some(end) if end <= self.len => Ok(addr.offset() as usize),
            _ => Err(PmemError::OutOfBounds {
                addr,
                len,
                pool_size: self.len,
            }),
        }
    }

    /// View an aligned u64 field as an atomic.
    pub(crate) fn atomic_u64(&self, addr: PAddr) -> PmemResult<&AtomicU64> {
        let off = self.check(addr, 8)?;
        if !addr.is_aligned() {
            return Err(PmemError::corruption(format!(
                "misaligned u64 field at {addr}"
            )));
        }
        // SAFETY: in bounds, 8-byte aligned (the mapping is page aligned),
        // and valid for the lifetime of `self`.
        Ok(unsafe { &*(self.base.add(off) as *const AtomicU64) })
    }

    pub(crate) fn load_u64(&self, addr: PAddr) -> PmemResult<u64> {
        Ok(self.atomic_u64(addr)?.load(Ordering::Acquire))
    }

    pub(crate) fn store_u64(&self, addr: PAddr, value: u64) -> PmemResult<()> {
        self.atomic_u64(addr)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Borrow `len` bytes at `addr`.
    ///
    /// Callers only use this for bytes nobody writes concurrently: immutable
    /// record fields, or ranges they hold the lock for.
    pub(crate) fn bytes(&self, addr: PAddr, len: u64) -> PmemResult<&[u8]> {
        let off = self.check(addr, len)?;
        // SAFETY: in bounds; see the caller contract above.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(off), len as usize) })
    }

    /// Copy `data` into the mapping at `addr`.
    pub(crate) fn copy_in(&self, addr: PAddr, data: &[u8]) -> PmemResult<()> {
        let off = self.check(addr, data.len() as u64)?;
        if data.len() == 8 && addr.is_aligned() {
            let mut word = [0u8; 8];
            word.copy_from_slice(data);
            return self.store_u64(addr, u64::from_le_bytes(word));
        }
        // SAFETY: in bounds; the caller owns the destination range.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(off), data.len()) };
        Ok(())
    }

    /// Zero `len` bytes at `addr`.
    pub(crate) fn zero(&self, addr: PAddr, len: u64) -> PmemResult<()> {
        let off = self.check(addr, len)?;
        // SAFETY: in bounds; the caller owns the destination range.
        unsafe { ptr::write_bytes(self.base.add(off), 0, len as usize) };
        Ok(())
    }

    /// Make a range durable. A no-op when flushing is disabled, in which case
    /// only process crashes (not power loss) are survived.
    pub(crate) fn persist(&self, addr: PAddr, len: u64) -> PmemResult<()> {
        if !self.flush || len == 0 {
            return Ok(());
        }
        let off = self.check(addr, len)?;
        self.mmap.flush_range(off, len as usize)?;
        Ok(())
    }

    /// Flush the whole mapping regardless of the flush setting. A no-op for
    /// private views.
    pub(crate) fn persist_all(&self) -> PmemResult<()> {
        if self.private {
            return Ok(());
        }
        self.mmap.flush()?;
        Ok(())
    }
}
