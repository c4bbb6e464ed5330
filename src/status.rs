//! Status codes and errors for pool and table operations
//!
//! `PmemError` is the error type returned by the persistent heap and the
//! frequency table. Every variant maps to a coarse `Status` code so callers
//! can branch on the failure class without matching on error details.

use std::fmt;
use std::io;

use crate::address::PAddr;

/// Coarse classification of an operation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// The persistent heap has no room left
    OutOfSpace = 1,
    /// I/O error on the backing medium
    IoError = 2,
    /// Persistent state failed an integrity or invariant check
    Corruption = 3,
    /// Invalid argument provided
    InvalidArgument = 4,
    /// Pool file does not match the requested layout
    LayoutMismatch = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::OutOfSpace => "OutOfSpace",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::InvalidArgument => "InvalidArgument",
            Status::LayoutMismatch => "LayoutMismatch",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors returned by the persistent heap and the frequency table.
///
/// Every error aborts the transaction it happened in; none of them leaves a
/// partially applied update behind.
#[derive(Debug, thiserror::Error)]
pub enum PmemError {
    /// The allocator could not satisfy a request.
    #[error("pool out of space: requested {requested} bytes, {available} available")]
    OutOfSpace {
        /// Bytes requested (after alignment).
        requested: u64,
        /// Bytes left between the heap top and the end of the pool.
        available: u64,
    },
    /// A transaction wrote more undo data than its lane can hold.
    #[error("transaction undo log full: need {needed} bytes, lane holds {capacity}")]
    TxLogFull {
        /// Bytes the new undo record needs.
        needed: u64,
        /// Usable bytes in one lane.
        capacity: u64,
    },
    /// I/O error from the backing file or mapping.
    #[error("pool io error: {0}")]
    Io(#[from] io::Error),
    /// Persistent state violates an invariant.
    #[error("pool corruption: {0}")]
    Corruption(String),
    /// A reference points outside the mapped pool.
    #[error("reference {addr} (+{len} bytes) outside pool of {pool_size} bytes")]
    OutOfBounds {
        /// Offending address.
        addr: PAddr,
        /// Length of the access.
        len: u64,
        /// Pool size in bytes.
        pool_size: u64,
    },
    /// The pool header is unreadable or was written by something else.
    #[error("invalid pool header: {0}")]
    Format(String),
    /// The pool was created for a different layout or table geometry.
    #[error("layout mismatch: expected {expected}, found {found}")]
    LayoutMismatch {
        /// Layout the caller asked for.
        expected: String,
        /// Layout recorded in the pool.
        found: String,
    },
    /// Invalid argument provided by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl PmemError {
    /// Map the error to its status code
    pub fn status(&self) -> Status {
        match self {
            PmemError::OutOfSpace { .. } | PmemError::TxLogFull { .. } => Status::OutOfSpace,
            PmemError::Io(_) => Status::IoError,
            PmemError::Corruption(_) | PmemError::OutOfBounds { .. } | PmemError::Format(_) => {
                Status::Corruption
            }
            PmemError::LayoutMismatch { .. } => Status::LayoutMismatch,
            PmemError::InvalidArgument(_) => Status::InvalidArgument,
        }
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        PmemError::Corruption(msg.into())
    }
}

/// Result alias used throughout the crate
pub type PmemResult<T> = Result<T, PmemError>;
