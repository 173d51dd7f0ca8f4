//! Unified error handling for the tile pool
//!
//! One error type covers the whole crate. Errors fall into three categories:
//! - User errors (bad arguments, rejected before any state mutation)
//! - Capacity errors (container or page pool exhausted, block still in use)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;
use thiserror::Error;

/// Unified error type for the tile pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Alignment is not a power of two or exceeds the page size
    #[error("invalid alignment {0:#x}: must be a power of two no larger than the page size")]
    InvalidAlignment(u32),

    /// Offset is not a pixel multiple or is not below the alignment
    #[error("invalid offset {offset:#x} for alignment {align:#x}")]
    InvalidOffset { offset: u32, align: u32 },

    /// Zero width, height or count requested
    #[error("zero-sized request")]
    ZeroSize,

    /// The operation does not support this pixel format
    #[error("unsupported format for this operation")]
    UnsupportedFormat,

    /// The converted slot rectangle does not fit the container
    #[error("request needs {width}x{height} slots, container is {max_width}x{max_height}")]
    ExceedsContainer {
        width: u32,
        height: u32,
        max_width: u16,
        max_height: u16,
    },

    /// The slot container cannot fit the rectangle or strip
    #[error("no room left in the slot container")]
    OutOfSpace,

    /// The page pool cannot satisfy the request
    #[error("page pool exhausted: requested {requested}, {available} available")]
    OutOfPages { requested: usize, available: usize },

    /// The block is still referenced and cannot be released outright
    #[error("block is still referenced")]
    Busy,

    /// No block matches the given key/id or address
    #[error("block not found")]
    BlockNotFound,

    /// No group exists for the given owner and group id
    #[error("group not found")]
    GroupNotFound,

    /// The address does not belong to the pool's aliased views
    #[error("address {0:#x} is not a pool address")]
    NotPoolAddress(u32),

    /// A user buffer crosses a region the backing manager cannot resolve
    #[error("user buffer {addr:#x}+{len:#x} crosses an unmapped region")]
    UnmappedUserRange { addr: u64, len: u64 },

    /// Translation programming was handed the wrong number of pages
    #[error("translation fill mismatch: area has {expected} slots, {provided} pages given")]
    TranslationMismatch { expected: u32, provided: usize },

    /// Rejected configuration
    #[error("invalid pool configuration: {0}")]
    InvalidConfiguration(String),

    /// Lock poisoned (indicates a bug)
    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for PoolError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PoolError::LockPoisoned(err.to_string())
    }
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Categorize the error for handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PoolError::InvalidAlignment(_)
            | PoolError::InvalidOffset { .. }
            | PoolError::ZeroSize
            | PoolError::UnsupportedFormat
            | PoolError::ExceedsContainer { .. }
            | PoolError::BlockNotFound
            | PoolError::GroupNotFound
            | PoolError::NotPoolAddress(_)
            | PoolError::UnmappedUserRange { .. }
            | PoolError::InvalidConfiguration(_) => ErrorCategory::User,

            PoolError::OutOfSpace | PoolError::OutOfPages { .. } | PoolError::Busy => {
                ErrorCategory::Capacity
            }

            PoolError::TranslationMismatch { .. } | PoolError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Capacity errors are temporary: the caller may retry after space frees up.
    pub fn is_capacity(&self) -> bool {
        self.category() == ErrorCategory::Capacity
    }

    /// User errors indicate invalid input; the caller should fix the request.
    pub fn is_user_error(&self) -> bool {
        self.category() == ErrorCategory::User
    }
}

/// Error category for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Temporary exhaustion; may succeed later
    Capacity,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Capacity => write!(f, "Capacity"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            PoolError::InvalidAlignment(3).category(),
            ErrorCategory::User
        );
        assert_eq!(
            PoolError::InvalidOffset {
                offset: 8,
                align: 8
            }
            .category(),
            ErrorCategory::User
        );
        assert_eq!(PoolError::OutOfSpace.category(), ErrorCategory::Capacity);
        assert_eq!(
            PoolError::OutOfPages {
                requested: 4,
                available: 0
            }
            .category(),
            ErrorCategory::Capacity
        );
        assert_eq!(PoolError::Busy.category(), ErrorCategory::Capacity);
        assert_eq!(
            PoolError::LockPoisoned("test".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_capacity() {
        assert!(PoolError::OutOfSpace.is_capacity());
        assert!(PoolError::Busy.is_capacity());
        assert!(!PoolError::ZeroSize.is_capacity());
    }

    #[test]
    fn test_is_user_error() {
        assert!(PoolError::ZeroSize.is_user_error());
        assert!(PoolError::BlockNotFound.is_user_error());
        assert!(!PoolError::OutOfSpace.is_user_error());
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::InvalidAlignment(0x30);
        assert!(err.to_string().contains("0x30"));

        let err = PoolError::OutOfPages {
            requested: 16,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "page pool exhausted: requested 16, 3 available"
        );
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::User.to_string(), "User");
        assert_eq!(ErrorCategory::Capacity.to_string(), "Capacity");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal");
    }
}
