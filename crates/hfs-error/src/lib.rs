#![forbid(unsafe_code)]
//! Error types for the HFS+ B-tree engine.
//!
//! # Error Taxonomy
//!
//! Two layers, mirroring the split between pure parsing and I/O:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `hfs-types` | Byte-level format violations, no I/O context |
//! | Runtime | `HfsError` | `hfs-error` (this crate) | Errors returned by every API that touches a device |
//!
//! ## Mapping Policy: ParseError → HfsError
//!
//! `hfs-error` does not depend on `hfs-types`. The conversion happens where
//! the node id is known (`hfs-btree`, `hfs-extent`):
//!
//! | Context | HfsError Variant |
//! |---------|------------------|
//! | Tree open, header node invalid | `Format(detail)` |
//! | Traversal of a live tree | `Corruption { node, detail }` |
//! | No node context available | `Parse(detail)` |
//!
//! A key lookup that finds nothing is not an error: lookups return
//! `Ok(None)`.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `MissingExtent` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `OutOfRange` | `EINVAL` |
//! | `BeyondEndOfFile` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all device-backed operations.
#[derive(Debug, Error)]
pub enum HfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The B-tree file is structurally wrong at open time.
    ///
    /// Bad header node kind, node size outside 512..=32768, a declared
    /// depth deeper than the configured maximum.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// A node reached during traversal is malformed.
    ///
    /// Kind or height does not match its position in the tree, the record
    /// offset table is inconsistent, or a key overruns its record.
    #[error("corrupt B-tree node {node}: {detail}")]
    Corruption { node: u32, detail: String },

    /// A read fell outside the backing store.
    #[error("read out of range: offset={offset} len={len} size={size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// The extents-overflow tree lacks a record the fork's block count
    /// says must exist.
    #[error("missing extent for file {file_id} ({fork} fork) at block {start_block}")]
    MissingExtent {
        file_id: u32,
        fork: &'static str,
        start_block: u64,
    },

    /// A read or block lookup started past the end of a fork.
    #[error("position {position} is beyond end of file (size {size})")]
    BeyondEndOfFile { position: u64, size: u64 },

    /// Parse-layer error without node context.
    #[error("parse error: {0}")]
    Parse(String),

    /// The caller passed a parameter that can never be valid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl HfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; a new variant does not compile until its
    /// errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::MissingExtent { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::OutOfRange { .. }
            | Self::BeyondEndOfFile { .. }
            | Self::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// True for errors that indicate on-disk inconsistency rather than a
    /// caller mistake or an OS failure.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::MissingExtent { .. })
    }
}

/// Result alias using `HfsError`.
pub type Result<T> = std::result::Result<T, HfsError>;
