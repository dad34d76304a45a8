//! Storage Error Taxonomy
//!
//! Every engine operation fails with one of the variants below. The network
//! path and the signed entry points both collapse an error into a negative
//! errno-style code via [`StoreError::errno`], so callers on either side see
//! the same taxonomy.

use thiserror::Error;

/// `ENOENT`
pub const ENOENT: i32 = 2;
/// `EFAULT`
pub const EFAULT: i32 = 14;
/// `EEXIST`
pub const EEXIST: i32 = 17;
/// `EINVAL`
pub const EINVAL: i32 = 22;
/// `ENOSPC`
pub const ENOSPC: i32 = 28;

/// Errors returned by the storage engine and its components.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The operation required an existing key and none was found
    #[error("key not found")]
    NotFound,

    /// `add` on a key that already exists
    #[error("key already exists")]
    AlreadyExists,

    /// The allocator is exhausted, or the item fits no size class
    #[error("out of space")]
    OutOfSpace,

    /// The request itself is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The store reached a state it should never reach
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns the negative errno-style code for this error.
    pub fn errno(&self) -> i32 {
        match self {
            StoreError::NotFound => -ENOENT,
            StoreError::AlreadyExists => -EEXIST,
            StoreError::OutOfSpace => -ENOSPC,
            StoreError::InvalidRequest(_) => -EINVAL,
            StoreError::Internal(_) => -EFAULT,
        }
    }

    /// Maps a negative code back to an error kind.
    ///
    /// Non-negative codes are not errors and yield `None`.
    pub fn from_errno(code: i64) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        let err = match i32::try_from(-code).unwrap_or(EFAULT) {
            ENOENT => StoreError::NotFound,
            EEXIST => StoreError::AlreadyExists,
            ENOSPC => StoreError::OutOfSpace,
            EINVAL => StoreError::InvalidRequest(format!("code {}", code)),
            _ => StoreError::Internal(format!("code {}", code)),
        };
        Some(err)
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Collapses a storage result into the signed convention used by the
/// entry points: the success length, or a negative error code.
pub fn to_signed(result: StoreResult<usize>) -> isize {
    match result {
        Ok(len) => isize::try_from(len).unwrap_or(isize::MAX),
        Err(e) => e.errno() as isize,
    }
}
