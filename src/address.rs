//! Persistent addresses
//!
//! A `PAddr` is a byte offset from the start of a pool file. Offsets stay
//! meaningful across process restarts and remappings, unlike native pointers,
//! so every reference stored inside the pool is a `PAddr`.

use std::fmt;
use std::ops::Add;

/// A stable reference to a location inside a persistent pool.
///
/// Offset 0 is occupied by the pool header, so it doubles as the null value.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PAddr(u64);

impl PAddr {
    /// The null reference (an empty chain, an unset root field).
    pub const NULL: Self = Self(0);

    /// Alignment of every object handed out by the pool allocator
    pub const ALIGNMENT: u64 = 8;

    /// Create an address from a raw pool offset
    #[inline]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Get the raw pool offset
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0
    }

    /// Check if this is the null reference
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Check if the offset satisfies the allocator alignment
    #[inline]
    pub const fn is_aligned(&self) -> bool {
        self.0 % Self::ALIGNMENT == 0
    }

    /// Address of a field `bytes` past this one
    #[inline]
    pub const fn field(&self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl Add<u64> for PAddr {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl From<u64> for PAddr {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "PAddr(null)")
        } else {
            write!(f, "PAddr({:#x})", self.0)
        }
    }
}

impl fmt::Display for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
