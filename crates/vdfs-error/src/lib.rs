#![forbid(unsafe_code)]
//! Error types for the VDFS metadata engine.
//!
//! # Error Taxonomy
//!
//! VDFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `vdfs-types` | Byte-level format violations while decoding a block |
//! | Runtime | `Fault` | `vdfs-error` (this crate) | Every failure surfaced by trees, allocator, snapshot manager and volume |
//!
//! `vdfs-error` does not depend on `vdfs-types`; the `ParseError` → `Fault`
//! conversion lives next to the code that knows whether the volume is still
//! mounting (`Format`) or already live (`Corrupt`).
//!
//! ## Failure classes
//!
//! | Variant | Meaning | errno |
//! |---------|---------|-------|
//! | `Io` | device read/write failed | `EIO` or the raw OS error |
//! | `Corrupt` | CRC or magic mismatch on a metadata block | `EIO` |
//! | `Format` | image rejected at mount/format time | `EINVAL` |
//! | `Inconsistent` | a structural invariant was found broken | `EFAULT` |
//! | `Exists` | catalog name already present | `EEXIST` |
//! | `DuplicateKey` | B-tree insert hit an equal key | `EEXIST` |
//! | `NotFound` | lookup miss | `ENOENT` |
//! | `NoSpace` | allocator, metadata area or tree capacity exhausted | `ENOSPC` |
//! | `Interrupted` | transaction grab lost to a pending commit | `EINTR` |
//! | `ReadOnly` | write on a read-only or degraded volume | `EROFS` |
//!
//! `Exists`, `DuplicateKey` and `NotFound` are ordinary results. `Corrupt`
//! and `Inconsistent` mean the structure they were found in can no longer be
//! trusted; the volume layer decides whether that is fatal.

use thiserror::Error;

/// Unified error type for all VDFS operations.
#[derive(Debug, Error)]
pub enum Fault {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata block failed its magic or CRC check.
    ///
    /// `block` is the physical block the bad data was read from, so that a
    /// checker can report it.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt { block: u64, detail: String },

    /// The image (or a format request) is structurally unacceptable.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// An internal invariant does not hold (bitmap bit already in the
    /// requested state, empty node where records were expected, ...).
    #[error("filesystem inconsistency: {detail}")]
    Inconsistent { detail: String },

    /// Catalog entry with the same `(parent_id, name)` already exists.
    #[error("file exists")]
    Exists,

    /// B-tree comparator reported equality with an existing record.
    #[error("duplicate key")]
    DuplicateKey,

    /// Named object or record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// No free blocks, inode numbers, metadata pages or bnodes.
    #[error("no space left on device")]
    NoSpace,

    /// A non-blocking transaction start lost against a pending commit.
    #[error("interrupted by pending commit")]
    Interrupted,

    /// Volume is read-only (mounted so, or degraded after an inconsistency).
    #[error("read-only filesystem")]
    ReadOnly,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// File operation attempted on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Directory still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// Name longer than the catalog key allows.
    #[error("name too long")]
    NameTooLong,

    /// Caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Fault {
    /// Shorthand for [`Fault::Corrupt`].
    pub fn corrupt(block: u64, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            block,
            detail: detail.into(),
        }
    }

    /// Shorthand for [`Fault::Inconsistent`].
    pub fn inconsistent(detail: impl Into<String>) -> Self {
        Self::Inconsistent {
            detail: detail.into(),
        }
    }

    /// Whether this error indicates damaged or untrustworthy metadata.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Inconsistent { .. })
    }

    /// Convert this error into a POSIX errno.
    ///
    /// Every variant has an explicit arm, so a new variant does not compile
    /// until it is assigned one.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupt { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Inconsistent { .. } => libc::EFAULT,
            Self::Exists | Self::DuplicateKey => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::NoSpace => libc::ENOSPC,
            Self::Interrupted => libc::EINTR,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
        }
    }
}

/// Result alias using `Fault`.
pub type Result<T> = std::result::Result<T, Fault>;
