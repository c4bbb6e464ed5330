//! On-media pool header
//!
//! The first page of a pool file holds the header. The static part is
//! written once at create time and protected by an XOR checksum; the dynamic
//! part (run id, heap top, root object) is updated in place while the pool is
//! open.
//!
//! ```text
//! offset  size  field
//!      0     8  magic "PMFREQP1"
//!      8     4  version
//!     12     4  flags (reserved, zero)
//!     16    16  pool uuid
//!     32    16  layout name (NUL padded)
//!     48     8  pool size
//!     56     8  number of undo-log lanes
//!     64     8  bytes per lane
//!     72     8  heap start
//!     80     8  checksum (XOR of bytes 0..80)
//!    128     8  run id          (dynamic)
//!    136     8  heap top        (dynamic)
//!    144     8  root offset     (dynamic)
//!    152     8  root size       (dynamic)
//! ```
//!
//! Lanes follow the header page; the heap starts at the next page boundary
//! after the last lane.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use uuid::Uuid;

use crate::address::PAddr;
use crate::pool::lane::MIN_LANE_SIZE;
use crate::status::{PmemError, PmemResult};

/// Pool file magic
pub const POOL_MAGIC: [u8; 8] = *b"PMFREQP1";

/// Current header version
pub const POOL_VERSION: u32 = 1;

/// Size reserved for the header (one page)
pub const HEADER_SIZE: u64 = 4096;

/// Maximum layout name length in bytes
pub const MAX_LAYOUT_LEN: usize = 16;

/// Length of the checksummed static header
const STATIC_LEN: usize = 80;
const CHECKSUM_OFFSET: usize = 80;

/// Dynamic header field: run id, bumped on every open
pub const RUN_ID_FIELD: PAddr = PAddr::new(128);
/// Dynamic header field: first unallocated heap byte
pub const HEAP_TOP_FIELD: PAddr = PAddr::new(136);
/// Dynamic header field: root object offset
pub const ROOT_OFFSET_FIELD: PAddr = PAddr::new(144);
/// Dynamic header field: root object size
pub const ROOT_SIZE_FIELD: PAddr = PAddr::new(152);

/// Static pool header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHeader {
    /// Header version
    pub version: u32,
    /// Pool identity, generated at create time
    pub uuid: Uuid,
    /// Layout name the pool was created for
    pub layout: String,
    /// Total pool size in bytes
    pub pool_size: u64,
    /// Number of undo-log lanes
    pub nlanes: u64,
    /// Bytes per lane, including the lane header
    pub lane_size: u64,
    /// Offset of the first heap byte
    pub heap_start: u64,
}

impl PoolHeader {
    /// Build the header for a new pool, computing the heap start from the
    /// lane geometry.
    pub fn new(layout: &str, pool_size: u64, nlanes: u64, lane_size: u64) -> PmemResult<Self> {
        if layout.is_empty() || layout.len() > MAX_LAYOUT_LEN {
            return Err(PmemError::InvalidArgument(format!(
                "layout name must be 1..={MAX_LAYOUT_LEN} bytes, got {:?}",
                layout
            )));
        }
        let heap_start = lanes_end(nlanes, lane_size)
            .and_then(|end| end.checked_next_multiple_of(HEADER_SIZE))
            .ok_or_else(|| {
                PmemError::InvalidArgument(format!(
                    "{nlanes} lanes of {lane_size} bytes overflow the pool address space"
                ))
            })?;
        if heap_start >= pool_size {
            return Err(PmemError::InvalidArgument(format!(
                "pool size {pool_size} leaves no heap after {nlanes} lanes of {lane_size} bytes"
            )));
        }

        Ok(Self {
            version: POOL_VERSION,
            uuid: Uuid::new_v4(),
            layout: layout.to_string(),
            pool_size,
            nlanes,
            lane_size,
            heap_start,
        })
    }

    /// Offset of lane `index`; `index` must be below `nlanes`.
    pub fn lane_offset(&self, index: usize) -> u64 {
        HEADER_SIZE + index as u64 * self.lane_size
    }

    /// End of the lane region. Geometry is validated by `new` and `decode`,
    /// so this cannot overflow for a header obtained from either.
    pub fn lanes_end(&self) -> u64 {
        HEADER_SIZE + self.nlanes * self.lane_size
    }

    /// Encode the static header into `buf` (at least 88 bytes).
    pub fn encode(&self, buf: &mut [u8]) -> PmemResult<()> {
        if buf.len() < STATIC_LEN + 8 {
            return Err(PmemError::Format("buffer too small for pool header".into()));
        }

        buf[0..8].copy_from_slice(&POOL_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&0u32.to_le_bytes());
        buf[16..32].copy_from_slice(self.uuid.as_bytes());

        let mut layout = [0u8; MAX_LAYOUT_LEN];
        layout[..self.layout.len()].copy_from_slice(self.layout.as_bytes());
        buf[32..48].copy_from_slice(&layout);

        buf[48..56].copy_from_slice(&self.pool_size.to_le_bytes());
        buf[56..64].copy_from_slice(&self.nlanes.to_le_bytes());
        buf[64..72].copy_from_slice(&self.lane_size.to_le_bytes());
        buf[72..80].copy_from_slice(&self.heap_start.to_le_bytes());

        let checksum = compute_xor_checksum(&buf[..STATIC_LEN]);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].copy_from_slice(&checksum.to_le_bytes());
        Ok(())
    }

    /// Decode and verify the static header.
    pub fn decode(buf: &[u8]) -> PmemResult<Self> {
        if buf.len() < STATIC_LEN + 8 {
            return Err(PmemError::Format("file too small for pool header".into()));
        }
        if buf[0..8] != POOL_MAGIC {
            return Err(PmemError::Format("magic mismatch".into()));
        }

        let stored = read_u64(buf, CHECKSUM_OFFSET);
        let computed = compute_xor_checksum(&buf[..STATIC_LEN]);
        if stored != computed {
            return Err(PmemError::Format(format!(
                "header checksum mismatch (stored={stored:#x}, computed={computed:#x})"
            )));
        }

        let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if version != POOL_VERSION {
            return Err(PmemError::Format(format!("unsupported version {version}")));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[16..32]);

        let layout_bytes = &buf[32..48];
        let end = layout_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_LAYOUT_LEN);
        let layout = std::str::from_utf8(&layout_bytes[..end])
            .map_err(|_| PmemError::Format("layout name is not UTF-8".into()))?
            .to_string();

        let header = Self {
            version,
            uuid: Uuid::from_bytes(uuid),
            layout,
            pool_size: read_u64(buf, 48),
            nlanes: read_u64(buf, 56),
            lane_size: read_u64(buf, 64),
            heap_start: read_u64(buf, 72),
        };

        let lanes_fit = lanes_end(header.nlanes, header.lane_size)
            .is_some_and(|end| end <= header.heap_start);
        if header.nlanes == 0
            || header.lane_size < MIN_LANE_SIZE
            || !lanes_fit
            || header.heap_start > header.pool_size
        {
            return Err(PmemError::Format("inconsistent lane geometry".into()));
        }
        Ok(header)
    }
}

/// End of a lane region of `nlanes` lanes, or `None` on overflow
fn lanes_end(nlanes: u64, lane_size: u64) -> Option<u64> {
    nlanes.checked_mul(lane_size)?.checked_add(HEADER_SIZE)
}

/// Read-only summary of a pool file, for tools and tests
#[derive(Debug, Clone)]
pub struct PoolInfo {
    /// Static header
    pub header: PoolHeader,
    /// Run id of the last open
    pub run_id: u64,
    /// First unallocated heap byte
    pub heap_top: u64,
    /// Root object, null if never allocated
    pub root: PAddr,
    /// Root object size
    pub root_size: u64,
    /// Undo bytes pending per lane; non-zero means the last run crashed
    /// inside a transaction on that lane.
    pub pending_undo: Vec<u64>,
}

impl PoolInfo {
    /// Bytes allocated from the heap so far
    pub fn heap_used(&self) -> u64 {
        self.heap_top.saturating_sub(self.header.heap_start)
    }

    /// Lanes with undo records awaiting recovery
    pub fn dirty_lanes(&self) -> Vec<usize> {
        self.pending_undo
            .iter()
            .enumerate()
            .filter(|(_, used)| **used != 0)
            .map(|(i, _)| i)
            .collect()
    }
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "layout:     {}", self.header.layout)?;
        writeln!(f, "uuid:       {}", self.header.uuid)?;
        writeln!(f, "size:       {}", self.header.pool_size)?;
        writeln!(
            f,
            "lanes:      {} x {} bytes",
            self.header.nlanes, self.header.lane_size
        )?;
        writeln!(
            f,
            "heap:       {} used of {}",
            self.heap_used(),
            self.header.pool_size - self.header.heap_start
        )?;
        writeln!(f, "run id:     {}", self.run_id)?;
        writeln!(f, "root:       {} ({} bytes)", self.root, self.root_size)?;
        write!(f, "dirty lanes: {:?}", self.dirty_lanes())
    }
}

/// Read a pool's header and lane state without mapping or recovering it.
pub fn inspect(path: impl AsRef<Path>) -> PmemResult<PoolInfo> {
    let mut file = File::open(path.as_ref())?;
    let mut page = vec![0u8; HEADER_SIZE as usize];
    file.read_exact(&mut page)?;

    let header = PoolHeader::decode(&page)?;
    let file_len = file.metadata()?.len();
    if header.pool_size != file_len {
        return Err(PmemError::Format(format!(
            "header records {} bytes but file has {file_len}",
            header.pool_size
        )));
    }
    let mut pending_undo = Vec::with_capacity(header.nlanes as usize);
    for lane in 0..header.nlanes as usize {
        file.seek(SeekFrom::Start(header.lane_offset(lane)))?;
        let mut used = [0u8; 8];
        file.read_exact(&mut used)?;
        pending_undo.push(u64::from_le_bytes(used));
    }

    Ok(PoolInfo {
        run_id: read_u64(&page, RUN_ID_FIELD.offset() as usize),
        heap_top: read_u64(&page, HEAP_TOP_FIELD.offset() as usize),
        root: PAddr::new(read_u64(&page, ROOT_OFFSET_FIELD.offset() as usize)),
        root_size: read_u64(&page, ROOT_SIZE_FIELD.offset() as usize),
        header,
        pending_undo,
    })
}

/// Compute an XOR checksum over a byte slice, eight bytes at a time.
pub fn compute_xor_checksum(data: &[u8]) -> u64 {
    let mut checksum: u64 = 0;

    let mut chunks = data.chunks_exact(8);
    for chunk in chunks.by_ref() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        checksum ^= u64::from_le_bytes(word);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut last = [0u8; 8];
        last[..remainder.len()].copy_from_slice(remainder);
        checksum ^= u64::from_le_bytes(last);
    }

    checksum
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(word)
}
